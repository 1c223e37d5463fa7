use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use episode_kernel_core::{
    Episode, FactKey, FactRecord, FactWrite, KeySnapshot, ScoredFact, SubjectMatch,
};
use episode_kernel_store_sqlite::{ClearSummary, IntegrityReport, SchemaStatus, SqliteStore};
use time::OffsetDateTime;

use crate::error::IngestError;

/// The storage operations the engine needs, and nothing else.
///
/// `write_fact` must apply its optional closure and its insert atomically, and
/// must report a lost race as [`IngestError::SupersessionConflict`].
#[async_trait]
pub trait FactStore: Send + Sync {
    async fn schema_status(&self) -> Result<SchemaStatus, IngestError>;
    async fn migrate(&self) -> Result<(), IngestError>;
    async fn insert_episode(&self, episode: &Episode) -> Result<(), IngestError>;
    async fn recent_episodes(
        &self,
        at: OffsetDateTime,
        last_n: usize,
    ) -> Result<Vec<Episode>, IngestError>;
    async fn read_open(&self, key: &FactKey) -> Result<Option<FactRecord>, IngestError>;
    async fn read_snapshot(
        &self,
        key: &FactKey,
        at: OffsetDateTime,
    ) -> Result<KeySnapshot, IngestError>;
    async fn write_fact(&self, write: &FactWrite) -> Result<(), IngestError>;
    /// Rank facts valid at `as_of`; validity must be applied before `limit`.
    async fn search(
        &self,
        text: &str,
        as_of: OffsetDateTime,
        limit: usize,
    ) -> Result<Vec<ScoredFact>, IngestError>;
    async fn search_subjects(&self, text: &str, limit: usize)
        -> Result<Vec<SubjectMatch>, IngestError>;
    async fn fact_history(&self, key: &FactKey) -> Result<Vec<FactRecord>, IngestError>;
    async fn clear_data(&self) -> Result<ClearSummary, IngestError>;
    async fn integrity_check(&self) -> Result<IntegrityReport, IngestError>;
    /// Release the underlying resources. Later calls fail with [`IngestError::Closed`].
    async fn close(&self) -> Result<(), IngestError>;
}

/// [`FactStore`] over one `SQLite` connection, driven from the blocking pool.
#[derive(Clone)]
pub struct SqliteFactStore {
    inner: Arc<Mutex<Option<SqliteStore>>>,
}

impl SqliteFactStore {
    /// # Errors
    /// Returns [`IngestError::Storage`] when the database cannot be opened.
    pub fn open(path: &Path) -> Result<Self, IngestError> {
        let store = SqliteStore::open(path).map_err(|err| IngestError::from_store("open", &err))?;
        Ok(Self::from_store(store))
    }

    #[must_use]
    pub fn from_store(store: SqliteStore) -> Self {
        Self { inner: Arc::new(Mutex::new(Some(store))) }
    }

    async fn run<T, F>(&self, operation: &'static str, call: F) -> Result<T, IngestError>
    where
        T: Send + 'static,
        F: FnOnce(&mut SqliteStore) -> anyhow::Result<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let joined = tokio::task::spawn_blocking(move || {
            let mut slot = inner.lock().unwrap_or_else(PoisonError::into_inner);
            slot.as_mut().map(call)
        })
        .await
        .map_err(|err| IngestError::Storage(format!("{operation}: blocking task failed: {err}")))?;
        match joined {
            Some(result) => result.map_err(|err| IngestError::from_store(operation, &err)),
            None => Err(IngestError::Closed),
        }
    }
}

#[async_trait]
impl FactStore for SqliteFactStore {
    async fn schema_status(&self) -> Result<SchemaStatus, IngestError> {
        self.run("schema_status", |store| store.schema_status()).await
    }

    async fn migrate(&self) -> Result<(), IngestError> {
        self.run("migrate", SqliteStore::migrate).await
    }

    async fn insert_episode(&self, episode: &Episode) -> Result<(), IngestError> {
        let episode = episode.clone();
        self.run("insert_episode", move |store| store.insert_episode(&episode)).await
    }

    async fn recent_episodes(
        &self,
        at: OffsetDateTime,
        last_n: usize,
    ) -> Result<Vec<Episode>, IngestError> {
        self.run("recent_episodes", move |store| store.recent_episodes(at, last_n)).await
    }

    async fn read_open(&self, key: &FactKey) -> Result<Option<FactRecord>, IngestError> {
        let key = key.clone();
        self.run("read_open", move |store| store.read_open(&key)).await
    }

    async fn read_snapshot(
        &self,
        key: &FactKey,
        at: OffsetDateTime,
    ) -> Result<KeySnapshot, IngestError> {
        let key = key.clone();
        self.run("read_snapshot", move |store| store.read_snapshot(&key, at)).await
    }

    async fn write_fact(&self, write: &FactWrite) -> Result<(), IngestError> {
        let write = write.clone();
        self.run("write_fact", move |store| store.write_fact(&write)).await
    }

    async fn search(
        &self,
        text: &str,
        as_of: OffsetDateTime,
        limit: usize,
    ) -> Result<Vec<ScoredFact>, IngestError> {
        let text = text.to_string();
        self.run("search", move |store| store.search(&text, as_of, limit)).await
    }

    async fn search_subjects(
        &self,
        text: &str,
        limit: usize,
    ) -> Result<Vec<SubjectMatch>, IngestError> {
        let text = text.to_string();
        self.run("search_subjects", move |store| store.search_subjects(&text, limit)).await
    }

    async fn fact_history(&self, key: &FactKey) -> Result<Vec<FactRecord>, IngestError> {
        let key = key.clone();
        self.run("fact_history", move |store| store.read_timeline(&key)).await
    }

    async fn clear_data(&self) -> Result<ClearSummary, IngestError> {
        self.run("clear_data", SqliteStore::clear_data).await
    }

    async fn integrity_check(&self) -> Result<IntegrityReport, IngestError> {
        self.run("integrity_check", |store| store.integrity_check()).await
    }

    async fn close(&self) -> Result<(), IngestError> {
        let inner = Arc::clone(&self.inner);
        let taken = tokio::task::spawn_blocking(move || {
            let store = inner.lock().unwrap_or_else(PoisonError::into_inner).take();
            store.map(SqliteStore::close)
        })
        .await
        .map_err(|err| IngestError::Storage(format!("close: blocking task failed: {err}")))?;
        match taken {
            Some(result) => result.map_err(|err| IngestError::from_store("close", &err)),
            None => Ok(()),
        }
    }
}
