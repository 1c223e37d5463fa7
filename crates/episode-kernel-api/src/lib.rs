use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use episode_kernel_core::{
    Episode, FactKey, FactRecord, KernelConfig, NewEpisode, ScoredFact, SubjectMatch,
};
use episode_kernel_store_sqlite::{ClearSummary, IntegrityReport};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info};

pub mod admission;
pub mod error;
pub mod extract;
pub mod guard;
pub mod query;
pub mod retry;
pub mod store;
pub mod supersession;

pub use admission::{AdmissionController, EpisodeOutcome};
pub use error::{ErrorBody, IngestError};
pub use extract::{FactExtractor, RuleExtractor};
pub use guard::{AdmissionTicket, Guard, GuardStats, ReadPermit};
pub use query::TemporalQueryResolver;
pub use retry::RetryPolicy;
pub use store::{FactStore, SqliteFactStore};
pub use supersession::{AppliedFacts, KeyLocks, SupersessionEngine, WrittenFact};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SetupResult {
    pub current_version: i64,
    pub target_version: i64,
    pub applied_versions: Vec<i64>,
    pub after_version: i64,
    pub up_to_date: bool,
}

/// Caller-facing entry point: ingestion, as-of search and maintenance.
pub struct EpisodeKernel {
    config: KernelConfig,
    guard: Guard,
    store: Arc<dyn FactStore>,
    retry: RetryPolicy,
    admission: AdmissionController,
    resolver: TemporalQueryResolver,
    closed: AtomicBool,
}

impl EpisodeKernel {
    /// Open a kernel over a `SQLite` database with the built-in [`RuleExtractor`].
    ///
    /// # Errors
    /// Returns an error when the config is invalid or the database cannot be opened.
    pub fn open(db_path: &Path, config: KernelConfig) -> Result<Self, IngestError> {
        let store = SqliteFactStore::open(db_path)?;
        Self::with_parts(Arc::new(store), Arc::new(RuleExtractor), config)
    }

    /// # Errors
    /// Returns [`IngestError::Validation`] when `config` fails validation.
    pub fn with_parts(
        store: Arc<dyn FactStore>,
        extractor: Arc<dyn FactExtractor>,
        config: KernelConfig,
    ) -> Result<Self, IngestError> {
        config.validate()?;
        let guard = Guard::new(&config);
        let retry = RetryPolicy::from_config(&config);
        let admission =
            AdmissionController::new(guard.clone(), extractor, Arc::clone(&store), retry.clone());
        let resolver = TemporalQueryResolver::new(
            Arc::clone(&store),
            guard.clone(),
            retry.clone(),
            config.search_overfetch,
        );
        Ok(Self { config, guard, store, retry, admission, resolver, closed: AtomicBool::new(false) })
    }

    #[must_use]
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    fn ensure_open(&self) -> Result<(), IngestError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(IngestError::Closed);
        }
        Ok(())
    }

    /// Create tables, constraints and indices. Safe to call repeatedly.
    ///
    /// # Errors
    /// Returns an error when schema inspection or migration fails.
    pub async fn build_indices_and_constraints(&self) -> Result<SetupResult, IngestError> {
        self.ensure_open()?;
        let before = self.store.schema_status().await?;
        let store = &self.store;
        self.retry.execute("migrate", |_| async move { store.migrate().await }).await?;
        let after = self.store.schema_status().await?;
        info!(
            from_version = before.current_version,
            to_version = after.current_version,
            "schema ready"
        );
        Ok(SetupResult {
            current_version: before.current_version,
            target_version: before.target_version,
            applied_versions: before.pending_versions,
            after_version: after.current_version,
            up_to_date: after.pending_versions.is_empty(),
        })
    }

    /// # Errors
    /// See [`AdmissionController::add_episode`]; also [`IngestError::Closed`].
    pub async fn add_episode(&self, submission: NewEpisode) -> Result<EpisodeOutcome, IngestError> {
        self.ensure_open()?;
        self.admission.add_episode(submission).await
    }

    /// Ingest many episodes in chunks of `episode_batch_size`.
    ///
    /// Within a chunk at most `max_concurrent_episodes` run at once. Every episode is
    /// admitted on its own and gets its own result, in input order.
    pub async fn add_episode_bulk(
        &self,
        submissions: Vec<NewEpisode>,
    ) -> Vec<Result<EpisodeOutcome, IngestError>> {
        let width = self.config.max_concurrent_episodes.max(1);
        let mut results = Vec::with_capacity(submissions.len());
        for (chunk_index, chunk) in submissions.chunks(self.config.episode_batch_size.max(1)).enumerate()
        {
            let chunk_results = stream::iter(chunk.iter().cloned())
                .map(|submission| self.add_episode(submission))
                .buffered(width)
                .collect::<Vec<_>>()
                .await;
            debug!(
                chunk = chunk_index,
                size = chunk.len(),
                failed = chunk_results.iter().filter(|result| result.is_err()).count(),
                "bulk chunk finished"
            );
            results.extend(chunk_results);
        }
        results
    }

    /// Search facts valid now.
    ///
    /// # Errors
    /// See [`TemporalQueryResolver::query`].
    pub async fn search(&self, query: &str, num_results: usize) -> Result<Vec<ScoredFact>, IngestError> {
        self.ensure_open()?;
        self.resolver.query(query, None, num_results).await
    }

    /// Search facts valid at `as_of`.
    ///
    /// # Errors
    /// See [`TemporalQueryResolver::query`].
    pub async fn search_as_of(
        &self,
        query: &str,
        as_of: OffsetDateTime,
        num_results: usize,
    ) -> Result<Vec<ScoredFact>, IngestError> {
        self.ensure_open()?;
        self.resolver.query(query, Some(as_of), num_results).await
    }

    /// Distinct subjects with open facts matching `query`, best match first.
    ///
    /// # Errors
    /// See [`TemporalQueryResolver::subjects`].
    pub async fn search_subjects(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<SubjectMatch>, IngestError> {
        self.ensure_open()?;
        self.resolver.subjects(query, limit).await
    }

    /// Every record ever stored for one key, oldest `valid_from` first.
    ///
    /// # Errors
    /// Returns [`IngestError::Validation`] for a blank key, or a storage error.
    pub async fn fact_history(
        &self,
        subject: &str,
        predicate: &str,
    ) -> Result<Vec<FactRecord>, IngestError> {
        self.ensure_open()?;
        let key = FactKey::new(subject, predicate)?;
        let _permit = self.guard.begin_read();
        self.store.fact_history(&key).await
    }

    /// # Errors
    /// Returns a storage error when episodes cannot be read.
    pub async fn retrieve_episodes(
        &self,
        reference_time: OffsetDateTime,
        last_n: usize,
    ) -> Result<Vec<Episode>, IngestError> {
        self.ensure_open()?;
        let _permit = self.guard.begin_read();
        self.store.recent_episodes(reference_time, last_n).await
    }

    /// # Errors
    /// Returns a storage error when the delete fails.
    pub async fn clear_data(&self) -> Result<ClearSummary, IngestError> {
        self.ensure_open()?;
        let summary = self.store.clear_data().await?;
        info!(
            episodes = summary.deleted_episodes,
            facts = summary.deleted_facts,
            "cleared kernel data"
        );
        Ok(summary)
    }

    /// # Errors
    /// Returns a storage error when an integrity probe fails.
    pub async fn integrity_check(&self) -> Result<IntegrityReport, IngestError> {
        self.ensure_open()?;
        self.store.integrity_check().await
    }

    #[must_use]
    pub fn stats(&self) -> GuardStats {
        self.guard.stats()
    }

    /// Stop accepting work, then release the store. Later calls fail with
    /// [`IngestError::Closed`]; closing twice is a no-op.
    ///
    /// # Errors
    /// Returns the store's error when its resources cannot be released cleanly.
    pub async fn close(&self) -> Result<(), IngestError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let outstanding = self.guard.stats().outstanding_tickets;
        self.store.close().await?;
        info!(outstanding, "episode kernel closed");
        Ok(())
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::sync::{Mutex, MutexGuard};

    use super::*;
    use async_trait::async_trait;
    use episode_kernel_core::{
        lexical_score, rank_subjects, sort_timeline, tokenize_query_terms, Disposition,
        EpisodeKind, FactWrite, KeySnapshot,
    };
    use episode_kernel_store_sqlite::{OpenKeyViolation, SchemaStatus};
    use time::Duration;
    use tokio::sync::Semaphore;

    fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
        match mutex.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// In-memory store with the same write contract as `SQLite`, plus fault injection.
    #[derive(Default)]
    struct MemoryStore {
        facts: Mutex<Vec<FactRecord>>,
        episodes: Mutex<Vec<Episode>>,
        migrated: AtomicBool,
        transient_write_failures: AtomicU32,
        write_attempts: AtomicU32,
        write_gate: Option<Arc<Semaphore>>,
        closed: AtomicBool,
    }

    impl MemoryStore {
        fn failing_writes(count: u32) -> Self {
            Self { transient_write_failures: AtomicU32::new(count), ..Self::default() }
        }

        fn gated(gate: Arc<Semaphore>) -> Self {
            Self { write_gate: Some(gate), ..Self::default() }
        }

        fn timeline(&self, key: &FactKey) -> Vec<FactRecord> {
            let mut records = lock(&self.facts)
                .iter()
                .filter(|record| record.subject == key.subject() && record.predicate == key.predicate())
                .cloned()
                .collect::<Vec<_>>();
            sort_timeline(&mut records);
            records
        }

        fn scored(&self, text: &str) -> Vec<ScoredFact> {
            let terms = tokenize_query_terms(text);
            lock(&self.facts)
                .iter()
                .filter_map(|record| {
                    lexical_score(&terms, record)
                        .map(|score| ScoredFact { record: record.clone(), score })
                })
                .collect()
        }
    }

    #[async_trait]
    impl FactStore for MemoryStore {
        async fn schema_status(&self) -> Result<SchemaStatus, IngestError> {
            let migrated = self.migrated.load(Ordering::SeqCst);
            Ok(SchemaStatus {
                current_version: i64::from(migrated),
                target_version: 1,
                pending_versions: if migrated { Vec::new() } else { vec![1] },
            })
        }

        async fn migrate(&self) -> Result<(), IngestError> {
            self.migrated.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn insert_episode(&self, episode: &Episode) -> Result<(), IngestError> {
            lock(&self.episodes).push(episode.clone());
            Ok(())
        }

        async fn recent_episodes(
            &self,
            at: OffsetDateTime,
            last_n: usize,
        ) -> Result<Vec<Episode>, IngestError> {
            let mut episodes = lock(&self.episodes)
                .iter()
                .filter(|episode| episode.reference_time <= at)
                .cloned()
                .collect::<Vec<_>>();
            episodes.sort_by(|lhs, rhs| rhs.reference_time.cmp(&lhs.reference_time));
            episodes.truncate(last_n);
            Ok(episodes)
        }

        async fn read_open(&self, key: &FactKey) -> Result<Option<FactRecord>, IngestError> {
            Ok(self.timeline(key).into_iter().find(FactRecord::is_open))
        }

        async fn read_snapshot(
            &self,
            key: &FactKey,
            at: OffsetDateTime,
        ) -> Result<KeySnapshot, IngestError> {
            Ok(KeySnapshot::from_timeline(&self.timeline(key), at))
        }

        async fn write_fact(&self, write: &FactWrite) -> Result<(), IngestError> {
            self.write_attempts.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.write_gate {
                match gate.acquire().await {
                    Ok(permit) => permit.forget(),
                    Err(_) => return Err(IngestError::Closed),
                }
            }
            if self
                .transient_write_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok()
            {
                return Err(IngestError::TransientStorage("injected lock contention".to_string()));
            }

            let mut facts = lock(&self.facts);
            let close_index = match &write.close {
                Some(close) => {
                    let Some(index) = facts.iter().position(|record| record.fact_id == close.fact_id)
                    else {
                        return Err(IngestError::SupersessionConflict("closure target missing".to_string()));
                    };
                    if facts[index].valid_to != close.expected_valid_to {
                        return Err(IngestError::SupersessionConflict("stale closure".to_string()));
                    }
                    Some(index)
                }
                None => None,
            };
            let insert = &write.insert;
            let open_taken = insert.is_open()
                && facts.iter().enumerate().any(|(index, record)| {
                    Some(index) != close_index
                        && record.is_open()
                        && record.subject == insert.subject
                        && record.predicate == insert.predicate
                });
            if open_taken {
                return Err(IngestError::SupersessionConflict("open record exists".to_string()));
            }

            if let (Some(index), Some(close)) = (close_index, &write.close) {
                facts[index].valid_to = Some(close.valid_to);
            }
            facts.push(insert.clone());
            Ok(())
        }

        async fn search(
            &self,
            text: &str,
            as_of: OffsetDateTime,
            limit: usize,
        ) -> Result<Vec<ScoredFact>, IngestError> {
            let mut scored = self
                .scored(text)
                .into_iter()
                .filter(|fact| fact.record.is_valid_at(as_of))
                .collect::<Vec<_>>();
            scored.truncate(limit);
            Ok(scored)
        }

        async fn search_subjects(
            &self,
            text: &str,
            limit: usize,
        ) -> Result<Vec<SubjectMatch>, IngestError> {
            Ok(rank_subjects(&self.scored(text), limit))
        }

        async fn fact_history(&self, key: &FactKey) -> Result<Vec<FactRecord>, IngestError> {
            Ok(self.timeline(key))
        }

        async fn clear_data(&self) -> Result<ClearSummary, IngestError> {
            let deleted_facts = std::mem::take(&mut *lock(&self.facts)).len();
            let deleted_episodes = std::mem::take(&mut *lock(&self.episodes)).len();
            Ok(ClearSummary { deleted_episodes, deleted_facts })
        }

        async fn integrity_check(&self) -> Result<IntegrityReport, IngestError> {
            let schema_status = self.schema_status().await?;
            let facts = lock(&self.facts);
            let mut open_key_violations: Vec<OpenKeyViolation> = Vec::new();
            for record in facts.iter().filter(|record| record.is_open()) {
                let open_records = facts
                    .iter()
                    .filter(|other| {
                        other.is_open()
                            && other.subject == record.subject
                            && other.predicate == record.predicate
                    })
                    .count();
                let already_reported = open_key_violations.iter().any(|violation| {
                    violation.subject == record.subject && violation.predicate == record.predicate
                });
                if open_records > 1 && !already_reported {
                    open_key_violations.push(OpenKeyViolation {
                        subject: record.subject.clone(),
                        predicate: record.predicate.clone(),
                        open_records: i64::try_from(open_records).unwrap_or(i64::MAX),
                    });
                }
            }
            Ok(IntegrityReport {
                quick_check_ok: true,
                quick_check_message: "ok".to_string(),
                foreign_key_violations: Vec::new(),
                open_key_violations,
                schema_status,
            })
        }

        async fn close(&self) -> Result<(), IngestError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn day(offset: i64) -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::days(19_723 + offset)
    }

    fn fast_config() -> KernelConfig {
        KernelConfig { retry_base_delay_ms: 1, retry_max_delay_ms: 4, ..KernelConfig::default() }
    }

    fn kernel_with(store: Arc<MemoryStore>, config: KernelConfig) -> EpisodeKernel {
        match EpisodeKernel::with_parts(store, Arc::new(RuleExtractor), config) {
            Ok(kernel) => kernel,
            Err(err) => panic!("kernel should build: {err}"),
        }
    }

    fn price_episode(price: &str, reference_time: OffsetDateTime) -> NewEpisode {
        NewEpisode::new(
            format!("price {price}"),
            format!("Product | price | {price}"),
            EpisodeKind::Text,
            "catalog feed",
            reference_time,
        )
    }

    async fn ingest(kernel: &EpisodeKernel, price: &str, reference_time: OffsetDateTime) -> EpisodeOutcome {
        match kernel.add_episode(price_episode(price, reference_time)).await {
            Ok(outcome) => outcome,
            Err(err) => panic!("episode {price} should ingest: {err}"),
        }
    }

    async fn prices_as_of(kernel: &EpisodeKernel, as_of: OffsetDateTime) -> Vec<String> {
        match kernel.search_as_of("product price", as_of, 10).await {
            Ok(results) => results.into_iter().map(|fact| fact.record.object).collect(),
            Err(err) => panic!("search should succeed: {err}"),
        }
    }

    async fn intervals(kernel: &EpisodeKernel) -> Vec<(OffsetDateTime, Option<OffsetDateTime>, String)> {
        match kernel.fact_history("product", "price").await {
            Ok(records) => records
                .into_iter()
                .map(|record| (record.valid_from, record.valid_to, record.object))
                .collect(),
            Err(err) => panic!("history should load: {err}"),
        }
    }

    #[tokio::test]
    async fn as_of_search_returns_the_fact_valid_at_each_instant() {
        let kernel = kernel_with(Arc::new(MemoryStore::default()), fast_config());
        ingest(&kernel, "$79", day(0)).await;
        ingest(&kernel, "$69", day(2)).await;

        assert_eq!(prices_as_of(&kernel, day(3)).await, vec!["$69".to_string()]);
        assert_eq!(prices_as_of(&kernel, day(1)).await, vec!["$79".to_string()]);
        assert!(prices_as_of(&kernel, day(-1)).await.is_empty());
    }

    #[tokio::test]
    async fn arrival_order_does_not_change_the_timeline() {
        let in_order = kernel_with(Arc::new(MemoryStore::default()), fast_config());
        ingest(&in_order, "$79", day(0)).await;
        ingest(&in_order, "$69", day(2)).await;

        let reversed = kernel_with(Arc::new(MemoryStore::default()), fast_config());
        let late = ingest(&reversed, "$69", day(2)).await;
        let early = ingest(&reversed, "$79", day(0)).await;
        assert_eq!(late.written[0].disposition, Disposition::Opened);
        assert_eq!(early.written[0].disposition, Disposition::Historical);

        assert_eq!(intervals(&in_order).await, intervals(&reversed).await);
    }

    #[tokio::test]
    async fn second_episode_is_rejected_while_the_only_slot_is_held() {
        let gate = Arc::new(Semaphore::new(0));
        let store = Arc::new(MemoryStore::gated(Arc::clone(&gate)));
        let config = KernelConfig { max_concurrent_episodes: 1, ..fast_config() };
        let kernel = Arc::new(kernel_with(Arc::clone(&store), config));

        let first = {
            let kernel = Arc::clone(&kernel);
            tokio::spawn(async move { kernel.add_episode(price_episode("$79", day(0))).await })
        };
        for _ in 0..1_000 {
            if store.write_attempts.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(kernel.stats().outstanding_tickets, 1);

        let rejected = kernel.add_episode(price_episode("$69", day(2))).await;
        assert!(matches!(rejected, Err(IngestError::AdmissionRejected(_))));

        gate.add_permits(10);
        match first.await {
            Ok(Ok(outcome)) => assert_eq!(outcome.written.len(), 1),
            Ok(Err(err)) => panic!("first episode should ingest: {err}"),
            Err(err) => panic!("first episode task failed: {err}"),
        }
        assert_eq!(kernel.stats().outstanding_tickets, 0);

        let retried = kernel.add_episode(price_episode("$69", day(2))).await;
        assert!(retried.is_ok());
        let stats = kernel.stats();
        assert_eq!(stats.admitted_total, 2);
        assert_eq!(stats.rejected_total, 1);
    }

    #[tokio::test]
    async fn two_transient_failures_then_success_takes_three_attempts() {
        let store = Arc::new(MemoryStore::failing_writes(2));
        let kernel = kernel_with(Arc::clone(&store), fast_config());

        let outcome = ingest(&kernel, "$79", day(0)).await;
        assert_eq!(outcome.written.len(), 1);
        assert_eq!(store.write_attempts.load(Ordering::SeqCst), 3);
        assert_eq!(intervals(&kernel).await.len(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_and_release_the_ticket() {
        let store = Arc::new(MemoryStore::failing_writes(10));
        let config = KernelConfig { max_retries: 2, ..fast_config() };
        let kernel = kernel_with(Arc::clone(&store), config);

        match kernel.add_episode(price_episode("$79", day(0))).await {
            Err(IngestError::RetryExhausted { attempts, last }) => {
                assert_eq!(attempts, 2);
                assert!(matches!(*last, IngestError::TransientStorage(_)));
            }
            other => panic!("expected RetryExhausted, got {other:?}"),
        }
        assert_eq!(store.write_attempts.load(Ordering::SeqCst), 2);
        let stats = kernel.stats();
        assert_eq!(stats.outstanding_tickets, 0);
        assert_eq!(stats.reserved_bytes, 0);
    }

    #[tokio::test]
    async fn invalid_episode_is_rejected_before_admission() {
        let kernel = kernel_with(Arc::new(MemoryStore::default()), fast_config());
        let blank = NewEpisode { body: "  ".to_string(), ..price_episode("$79", day(0)) };
        let result = kernel.add_episode(blank).await;
        assert!(matches!(result, Err(IngestError::Validation(_))));
        assert_eq!(kernel.stats().admitted_total, 0);
    }

    #[tokio::test]
    async fn extraction_failure_releases_ticket_and_stores_nothing() {
        let store = Arc::new(MemoryStore::default());
        let kernel = kernel_with(Arc::clone(&store), fast_config());
        let submission =
            NewEpisode::new("broken", "{not json", EpisodeKind::Json, "test", day(0));

        let result = kernel.add_episode(submission).await;
        assert!(matches!(result, Err(IngestError::Extraction(_))));
        assert_eq!(kernel.stats().outstanding_tickets, 0);
        assert!(lock(&store.episodes).is_empty());
    }

    #[tokio::test]
    async fn reingesting_the_same_episode_skips_duplicates() {
        let kernel = kernel_with(Arc::new(MemoryStore::default()), fast_config());
        let first = ingest(&kernel, "$79", day(0)).await;
        let second = ingest(&kernel, "$79", day(0)).await;

        assert!(second.written.is_empty());
        assert_eq!(second.skipped_duplicates, vec![first.written[0].record.fact_id]);
        assert_eq!(intervals(&kernel).await.len(), 1);
    }

    #[tokio::test]
    async fn bulk_ingestion_returns_one_result_per_episode_in_order() {
        let config = KernelConfig { episode_batch_size: 3, max_concurrent_episodes: 2, ..fast_config() };
        let kernel = kernel_with(Arc::new(MemoryStore::default()), config);
        let mut submissions = (0..7)
            .map(|offset| price_episode(&format!("${offset}"), day(offset)))
            .collect::<Vec<_>>();
        submissions.push(NewEpisode { body: String::new(), ..price_episode("$9", day(9)) });

        let results = kernel.add_episode_bulk(submissions).await;
        assert_eq!(results.len(), 8);
        assert!(results[..7].iter().all(Result::is_ok));
        assert!(matches!(results[7], Err(IngestError::Validation(_))));

        let history = intervals(&kernel).await;
        assert_eq!(history.len(), 7);
        assert_eq!(history[6], (day(6), None, "$6".to_string()));
    }

    #[tokio::test]
    async fn concurrent_out_of_order_episodes_keep_one_open_record() {
        let kernel = Arc::new(kernel_with(Arc::new(MemoryStore::default()), fast_config()));
        let offsets = [4_i64, 1, 3, 0, 2];
        let tasks = offsets
            .iter()
            .map(|offset| {
                let kernel = Arc::clone(&kernel);
                let offset = *offset;
                tokio::spawn(async move {
                    kernel.add_episode(price_episode(&format!("${offset}"), day(offset))).await
                })
            })
            .collect::<Vec<_>>();
        for task in futures::future::join_all(tasks).await {
            match task {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => panic!("episode should ingest: {err}"),
                Err(err) => panic!("task failed: {err}"),
            }
        }

        let expected = (0..5)
            .map(|offset| {
                let valid_to = if offset == 4 { None } else { Some(day(offset + 1)) };
                (day(offset), valid_to, format!("${offset}"))
            })
            .collect::<Vec<_>>();
        assert_eq!(intervals(&kernel).await, expected);
        match kernel.integrity_check().await {
            Ok(report) => assert!(report.open_key_violations.is_empty()),
            Err(err) => panic!("integrity check should run: {err}"),
        }
    }

    #[tokio::test]
    async fn retrieve_episodes_and_clear_data() {
        let kernel = kernel_with(Arc::new(MemoryStore::default()), fast_config());
        for offset in 0..4 {
            ingest(&kernel, &format!("${offset}"), day(offset)).await;
        }
        let recent = match kernel.retrieve_episodes(day(2), 2).await {
            Ok(episodes) => episodes,
            Err(err) => panic!("episodes should load: {err}"),
        };
        assert_eq!(
            recent.iter().map(|episode| episode.reference_time).collect::<Vec<_>>(),
            vec![day(2), day(1)]
        );

        match kernel.clear_data().await {
            Ok(summary) => {
                assert_eq!(summary.deleted_episodes, 4);
                assert_eq!(summary.deleted_facts, 4);
            }
            Err(err) => panic!("clear should succeed: {err}"),
        }
        assert!(intervals(&kernel).await.is_empty());
    }

    #[tokio::test]
    async fn closed_kernel_refuses_new_work() {
        let store = Arc::new(MemoryStore::default());
        let kernel = kernel_with(Arc::clone(&store), fast_config());
        assert_eq!(kernel.close().await, Ok(()));
        assert_eq!(kernel.close().await, Ok(()));
        assert!(kernel.is_closed());
        assert!(store.closed.load(Ordering::SeqCst));
        assert_eq!(
            kernel.add_episode(price_episode("$79", day(0))).await,
            Err(IngestError::Closed)
        );
        assert_eq!(kernel.search("product", 5).await, Err(IngestError::Closed));
    }

    #[tokio::test]
    async fn search_without_terms_is_a_validation_error() {
        let kernel = kernel_with(Arc::new(MemoryStore::default()), fast_config());
        assert!(matches!(kernel.search("?!", 5).await, Err(IngestError::Validation(_))));
        assert_eq!(kernel.search("product", 0).await, Ok(Vec::new()));
    }

    #[test]
    fn invalid_config_is_rejected_at_construction() {
        let config = KernelConfig { memory_safety_factor: 0.0, ..KernelConfig::default() };
        let result =
            EpisodeKernel::with_parts(Arc::new(MemoryStore::default()), Arc::new(RuleExtractor), config);
        assert!(matches!(result, Err(IngestError::Validation(_))));
    }

    fn unique_temp_db_path() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("episodekernel-api-{}.sqlite3", ulid::Ulid::new()))
    }

    fn cleanup(db_path: &Path) {
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{suffix}", db_path.display()));
        }
    }

    #[tokio::test]
    async fn sqlite_kernel_setup_is_idempotent_and_answers_as_of_queries() {
        let db_path = unique_temp_db_path();
        let kernel = match EpisodeKernel::open(&db_path, fast_config()) {
            Ok(kernel) => kernel,
            Err(err) => panic!("sqlite kernel should open: {err}"),
        };

        let first = match kernel.build_indices_and_constraints().await {
            Ok(result) => result,
            Err(err) => panic!("setup should succeed: {err}"),
        };
        assert_eq!(first.applied_versions, vec![1, 2]);
        let second = match kernel.build_indices_and_constraints().await {
            Ok(result) => result,
            Err(err) => panic!("second setup should succeed: {err}"),
        };
        assert!(second.applied_versions.is_empty());
        assert!(second.up_to_date);

        ingest(&kernel, "$69", day(2)).await;
        ingest(&kernel, "$79", day(0)).await;
        assert_eq!(prices_as_of(&kernel, day(3)).await, vec!["$69".to_string()]);
        assert_eq!(prices_as_of(&kernel, day(1)).await, vec!["$79".to_string()]);
        assert!(prices_as_of(&kernel, day(-1)).await.is_empty());

        match kernel.integrity_check().await {
            Ok(report) => {
                assert!(report.quick_check_ok);
                assert!(report.open_key_violations.is_empty());
            }
            Err(err) => panic!("integrity check should run: {err}"),
        }
        if let Err(err) = kernel.close().await {
            panic!("close should release the connection: {err}");
        }
        drop(kernel);
        cleanup(&db_path);
    }

    async fn open_sqlite_kernel(db_path: &Path) -> EpisodeKernel {
        let kernel = match EpisodeKernel::open(db_path, fast_config()) {
            Ok(kernel) => kernel,
            Err(err) => panic!("sqlite kernel should open: {err}"),
        };
        if let Err(err) = kernel.build_indices_and_constraints().await {
            panic!("setup should succeed: {err}");
        }
        kernel
    }

    #[tokio::test]
    async fn sqlite_as_of_search_finds_early_facts_behind_a_long_history() {
        let db_path = unique_temp_db_path();
        let kernel = open_sqlite_kernel(&db_path).await;
        for offset in 0..10 {
            ingest(&kernel, &format!("${offset}"), day(offset)).await;
        }

        for (offset, expected) in [(0, "$0"), (3, "$3"), (9, "$9")] {
            let results = match kernel.search_as_of("product price", day(offset), 1).await {
                Ok(results) => results,
                Err(err) => panic!("search should succeed: {err}"),
            };
            let objects = results.into_iter().map(|fact| fact.record.object).collect::<Vec<_>>();
            assert_eq!(objects, vec![expected.to_string()], "as of day {offset}");
        }

        if let Err(err) = kernel.close().await {
            panic!("close should succeed: {err}");
        }
        cleanup(&db_path);
    }

    #[tokio::test]
    async fn sqlite_close_releases_the_store_for_every_later_call() {
        let db_path = unique_temp_db_path();
        let kernel = open_sqlite_kernel(&db_path).await;
        ingest(&kernel, "$79", day(0)).await;
        let store = Arc::clone(&kernel.store);

        assert_eq!(kernel.close().await, Ok(()));
        assert_eq!(kernel.close().await, Ok(()));
        assert_eq!(kernel.search("product", 5).await, Err(IngestError::Closed));
        let key = match FactKey::new("product", "price") {
            Ok(key) => key,
            Err(err) => panic!("key should validate: {err}"),
        };
        assert_eq!(store.fact_history(&key).await, Err(IngestError::Closed));
        cleanup(&db_path);
    }

    #[tokio::test]
    async fn cancelled_ingestion_releases_its_ticket_and_writes_nothing() {
        let gate = Arc::new(Semaphore::new(0));
        let store = Arc::new(MemoryStore::gated(Arc::clone(&gate)));
        let kernel = Arc::new(kernel_with(Arc::clone(&store), fast_config()));

        let task = {
            let kernel = Arc::clone(&kernel);
            tokio::spawn(async move { kernel.add_episode(price_episode("$79", day(0))).await })
        };
        for _ in 0..1_000 {
            if store.write_attempts.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(store.write_attempts.load(Ordering::SeqCst), 1);
        assert_eq!(kernel.stats().outstanding_tickets, 1);
        assert!(!kernel.admission.engine().locks().is_empty());

        task.abort();
        match task.await {
            Err(err) => assert!(err.is_cancelled()),
            Ok(result) => panic!("aborted ingestion should not finish: {result:?}"),
        }

        let stats = kernel.stats();
        assert_eq!(stats.outstanding_tickets, 0);
        assert_eq!(stats.reserved_bytes, 0);
        assert!(intervals(&kernel).await.is_empty());
        assert!(kernel.admission.engine().locks().is_empty());

        gate.add_permits(10);
        ingest(&kernel, "$69", day(1)).await;
        assert_eq!(intervals(&kernel).await, vec![(day(1), None, "$69".to_string())]);
    }

    #[tokio::test]
    async fn subject_search_lists_subjects_with_open_matching_facts() {
        let kernel = kernel_with(Arc::new(MemoryStore::default()), fast_config());
        ingest(&kernel, "$79", day(0)).await;
        ingest(&kernel, "$69", day(1)).await;
        let supplier =
            NewEpisode::new("supplier", "Acme | supplies | product", EpisodeKind::Text, "feed", day(1));
        if let Err(err) = kernel.add_episode(supplier).await {
            panic!("supplier episode should ingest: {err}");
        }

        let subjects = match kernel.search_subjects("product", 10).await {
            Ok(subjects) => subjects,
            Err(err) => panic!("subject search should succeed: {err}"),
        };
        let summary = subjects
            .iter()
            .map(|entry| (entry.subject.as_str(), entry.matching_facts))
            .collect::<Vec<_>>();
        assert_eq!(summary, vec![("acme", 1), ("product", 1)]);
        assert!(matches!(kernel.search_subjects("!!", 5).await, Err(IngestError::Validation(_))));
        assert_eq!(kernel.search_subjects("product", 0).await, Ok(Vec::new()));
    }

    #[tokio::test]
    async fn episode_larger_than_the_whole_budget_is_a_validation_error() {
        let config = KernelConfig {
            memory_budget_bytes: 8_192,
            memory_safety_factor: 1.0,
            ..fast_config()
        };
        let kernel = kernel_with(Arc::new(MemoryStore::default()), config);
        let oversized = NewEpisode {
            body: format!("Product | price | {}", "9".repeat(2_000)),
            ..price_episode("$79", day(0))
        };

        assert!(matches!(kernel.add_episode(oversized).await, Err(IngestError::Validation(_))));
        let stats = kernel.stats();
        assert_eq!(stats.rejected_total, 0);
        assert_eq!(stats.admitted_total, 0);
        ingest(&kernel, "$79", day(0)).await;
    }
}
