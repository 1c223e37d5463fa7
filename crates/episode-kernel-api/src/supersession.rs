use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use episode_kernel_core::{
    plan_supersession, CandidateFact, Disposition, FactId, FactKey, FactRecord, SupersessionPlan,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info};

use crate::error::IngestError;
use crate::retry::RetryPolicy;
use crate::store::FactStore;

/// One exclusive critical section per fact key, created on demand.
#[derive(Debug, Default)]
pub struct KeyLocks {
    locks: Mutex<HashMap<FactKey, Arc<AsyncMutex<()>>>>,
}

impl KeyLocks {
    pub async fn lock(&self, key: &FactKey) -> KeyGuard<'_> {
        let entry = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(key.clone()).or_default())
        };
        let guard = entry.lock_owned().await;
        KeyGuard { locks: self, key: key.clone(), guard: Some(guard) }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Holds a key's critical section; drops the map entry once nobody else wants it.
pub struct KeyGuard<'a> {
    locks: &'a KeyLocks,
    key: FactKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.locks.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks.get(&self.key).is_some_and(|entry| Arc::strong_count(entry) == 1) {
            locks.remove(&self.key);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WrittenFact {
    pub disposition: Disposition,
    pub record: FactRecord,
    /// The record whose `valid_to` was patched in the same transaction.
    pub closed_fact_id: Option<FactId>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppliedFacts {
    pub written: Vec<WrittenFact>,
    pub skipped_duplicates: Vec<FactId>,
}

/// Places candidate facts into their keys' timelines.
pub struct SupersessionEngine {
    store: Arc<dyn FactStore>,
    retry: RetryPolicy,
    locks: KeyLocks,
}

impl SupersessionEngine {
    #[must_use]
    pub fn new(store: Arc<dyn FactStore>, retry: RetryPolicy) -> Self {
        Self { store, retry, locks: KeyLocks::default() }
    }

    #[must_use]
    pub fn locks(&self) -> &KeyLocks {
        &self.locks
    }

    /// Apply candidates in order, each under its key's critical section.
    ///
    /// Each fact is read, planned and written as one retried unit, so a conflict
    /// re-reads the key before trying again.
    ///
    /// # Errors
    /// Returns the first terminal error. Facts committed before it stay committed.
    pub async fn apply(&self, candidates: &[CandidateFact]) -> Result<AppliedFacts, IngestError> {
        let mut applied = AppliedFacts::default();
        for candidate in candidates {
            match self.apply_one(candidate).await? {
                SupersessionPlan::Duplicate { existing } => {
                    debug!(key = %candidate.key, %existing, "skipped duplicate fact");
                    applied.skipped_duplicates.push(existing);
                }
                SupersessionPlan::Write(write) => {
                    info!(
                        key = %candidate.key,
                        fact_id = %write.insert.fact_id,
                        disposition = write.disposition.as_str(),
                        valid_from = %write.insert.valid_from,
                        closed = write.close.is_some(),
                        "committed fact"
                    );
                    applied.written.push(WrittenFact {
                        disposition: write.disposition,
                        closed_fact_id: write.close.map(|close| close.fact_id),
                        record: write.insert,
                    });
                }
            }
        }
        Ok(applied)
    }

    async fn apply_one(&self, candidate: &CandidateFact) -> Result<SupersessionPlan, IngestError> {
        candidate.validate()?;
        let _key_guard = self.locks.lock(&candidate.key).await;
        let store = &self.store;
        self.retry
            .execute("supersession", |_| async move {
                let snapshot = store.read_snapshot(&candidate.key, candidate.reference_time).await?;
                let plan = plan_supersession(
                    candidate,
                    &snapshot,
                    FactId::new(),
                    OffsetDateTime::now_utc(),
                )?;
                if let SupersessionPlan::Write(write) = &plan {
                    store.write_fact(write).await?;
                }
                Ok(plan)
            })
            .await
    }
}
