use std::sync::Arc;

use episode_kernel_core::{resolve_as_of, tokenize_query_terms, ScoredFact, SubjectMatch};
use time::OffsetDateTime;
use tracing::debug;

use crate::error::IngestError;
use crate::guard::Guard;
use crate::retry::RetryPolicy;
use crate::store::FactStore;

/// Read-only as-of search. The store filters by validity and ranks; the resolver
/// re-checks validity and keeps one record per fact.
pub struct TemporalQueryResolver {
    store: Arc<dyn FactStore>,
    guard: Guard,
    retry: RetryPolicy,
    overfetch: usize,
}

impl TemporalQueryResolver {
    #[must_use]
    pub fn new(store: Arc<dyn FactStore>, guard: Guard, retry: RetryPolicy, overfetch: usize) -> Self {
        Self { store, guard, retry, overfetch: overfetch.max(1) }
    }

    /// # Errors
    /// Returns [`IngestError::Validation`] for text without searchable terms, or the
    /// store's error after retries.
    pub async fn query(
        &self,
        text: &str,
        as_of: Option<OffsetDateTime>,
        limit: usize,
    ) -> Result<Vec<ScoredFact>, IngestError> {
        ensure_terms(text)?;
        if limit == 0 {
            return Ok(Vec::new());
        }

        let _permit = self.guard.begin_read();
        let as_of = as_of.unwrap_or_else(OffsetDateTime::now_utc);
        let fetch_limit = limit.saturating_mul(self.overfetch);
        let store = &self.store;
        let fetched = self
            .retry
            .execute("search", |_| async move { store.search(text, as_of, fetch_limit).await })
            .await?;
        let fetched_count = fetched.len();
        let resolved = resolve_as_of(fetched, as_of, limit);
        debug!(
            fetched = fetched_count,
            returned = resolved.len(),
            as_of = %as_of,
            "resolved as-of search"
        );
        Ok(resolved)
    }

    /// Subjects with open facts matching `text`.
    ///
    /// # Errors
    /// Returns [`IngestError::Validation`] for text without searchable terms, or the
    /// store's error after retries.
    pub async fn subjects(&self, text: &str, limit: usize) -> Result<Vec<SubjectMatch>, IngestError> {
        ensure_terms(text)?;
        if limit == 0 {
            return Ok(Vec::new());
        }

        let _permit = self.guard.begin_read();
        let store = &self.store;
        let subjects = self
            .retry
            .execute("search_subjects", |_| async move { store.search_subjects(text, limit).await })
            .await?;
        debug!(returned = subjects.len(), "resolved subject search");
        Ok(subjects)
    }
}

fn ensure_terms(text: &str) -> Result<(), IngestError> {
    if tokenize_query_terms(text).is_empty() {
        return Err(IngestError::Validation(
            "search text MUST include at least one alphanumeric term".to_string(),
        ));
    }
    Ok(())
}
