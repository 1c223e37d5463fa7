use std::sync::Arc;

use episode_kernel_core::{EpisodeId, FactId, NewEpisode};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::error::IngestError;
use crate::extract::FactExtractor;
use crate::guard::Guard;
use crate::retry::RetryPolicy;
use crate::store::FactStore;
use crate::supersession::{SupersessionEngine, WrittenFact};

/// Returned once every fact from the episode is committed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EpisodeOutcome {
    pub episode_id: EpisodeId,
    #[serde(with = "time::serde::rfc3339")]
    pub reference_time: OffsetDateTime,
    pub written: Vec<WrittenFact>,
    pub skipped_duplicates: Vec<FactId>,
}

pub struct AdmissionController {
    guard: Guard,
    extractor: Arc<dyn FactExtractor>,
    store: Arc<dyn FactStore>,
    retry: RetryPolicy,
    engine: SupersessionEngine,
}

impl AdmissionController {
    #[must_use]
    pub fn new(
        guard: Guard,
        extractor: Arc<dyn FactExtractor>,
        store: Arc<dyn FactStore>,
        retry: RetryPolicy,
    ) -> Self {
        let engine = SupersessionEngine::new(Arc::clone(&store), retry.clone());
        Self { guard, extractor, store, retry, engine }
    }

    #[must_use]
    pub fn engine(&self) -> &SupersessionEngine {
        &self.engine
    }

    /// Validate, admit, extract, persist and supersede one episode.
    ///
    /// The admission ticket lives on this call's stack, so it is released on every
    /// exit path, including cancellation of the returned future.
    ///
    /// # Errors
    /// `Validation` before admission, `AdmissionRejected` under backpressure, then
    /// `Extraction` or a storage error from the pipeline.
    pub async fn add_episode(&self, submission: NewEpisode) -> Result<EpisodeOutcome, IngestError> {
        let episode = submission.into_episode(OffsetDateTime::now_utc())?;
        let ticket = self.guard.admit(episode.estimated_cost())?;
        info!(
            episode_id = %episode.episode_id,
            kind = episode.kind.as_str(),
            reference_time = %episode.reference_time,
            cost = ticket.cost(),
            "admitted episode"
        );

        let candidates = match self.extractor.extract(&episode).await {
            Ok(candidates) => candidates,
            Err(err) => {
                warn!(episode_id = %episode.episode_id, error = %err, "extraction failed");
                return Err(err);
            }
        };

        let store = &self.store;
        let stored = &episode;
        self.retry
            .execute("insert_episode", |_| async move { store.insert_episode(stored).await })
            .await?;

        let applied = self.engine.apply(&candidates).await?;
        info!(
            episode_id = %episode.episode_id,
            candidates = candidates.len(),
            written = applied.written.len(),
            duplicates = applied.skipped_duplicates.len(),
            "episode ingested"
        );
        ticket.release();

        Ok(EpisodeOutcome {
            episode_id: episode.episode_id,
            reference_time: episode.reference_time,
            written: applied.written,
            skipped_duplicates: applied.skipped_duplicates,
        })
    }
}
