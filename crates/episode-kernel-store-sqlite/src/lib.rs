use std::path::Path;

use anyhow::{anyhow, Context, Result};
use episode_kernel_core::{
    lexical_score, rank_subjects, tokenize_query_terms, Episode, EpisodeId, EpisodeKind, FactId,
    FactKey, FactRecord, FactWrite, KeySnapshot, ScoredFact, SubjectMatch,
};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at_ns INTEGER NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS episodes (
  episode_id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  body TEXT NOT NULL,
  kind TEXT NOT NULL CHECK (kind IN ('text','json','message')),
  source_description TEXT NOT NULL,
  reference_time_ns INTEGER NOT NULL,
  ingested_at_ns INTEGER NOT NULL,
  content_hash TEXT NOT NULL CHECK (content_hash LIKE 'sha256:%')
);

CREATE TABLE IF NOT EXISTS fact_records (
  fact_id TEXT PRIMARY KEY,
  subject TEXT NOT NULL CHECK (length(subject) > 0),
  predicate TEXT NOT NULL CHECK (length(predicate) > 0),
  object TEXT NOT NULL,
  confidence REAL NOT NULL CHECK (confidence >= 0.0 AND confidence <= 1.0),
  valid_from_ns INTEGER NOT NULL,
  valid_to_ns INTEGER CHECK (valid_to_ns IS NULL OR valid_to_ns >= valid_from_ns),
  episode_id TEXT NOT NULL,
  created_at_ns INTEGER NOT NULL,
  FOREIGN KEY (episode_id) REFERENCES episodes(episode_id)
);
";

const MIGRATION_002_SQL: &str = r"
CREATE UNIQUE INDEX IF NOT EXISTS idx_fact_records_open_key
  ON fact_records(subject, predicate) WHERE valid_to_ns IS NULL;
CREATE INDEX IF NOT EXISTS idx_fact_records_key_valid_from
  ON fact_records(subject, predicate, valid_from_ns);
CREATE INDEX IF NOT EXISTS idx_fact_records_episode ON fact_records(episode_id);
CREATE INDEX IF NOT EXISTS idx_episodes_reference_time ON episodes(reference_time_ns);
";

const MIGRATIONS: [(i64, &str); 2] = [(1, MIGRATION_001_SQL), (2, MIGRATION_002_SQL)];

const FACT_COLUMNS: &str = "fact_id, subject, predicate, object, confidence, \
     valid_from_ns, valid_to_ns, episode_id, created_at_ns";

const EPISODE_COLUMNS: &str = "episode_id, name, body, kind, source_description, \
     reference_time_ns, ingested_at_ns, content_hash";

/// A fact write that lost a race: the record it meant to close changed, or
/// another open record for the same key was committed first.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("write conflict on {key}: {reason}")]
pub struct WriteConflict {
    pub key: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    /// Another writer changed the key between read and write.
    Conflict,
    /// `SQLite` reported `BUSY` or `LOCKED`.
    Busy,
    Fatal,
}

/// Classify a store error by walking its cause chain.
#[must_use]
pub fn classify_error(err: &anyhow::Error) -> StoreErrorKind {
    for cause in err.chain() {
        if cause.downcast_ref::<WriteConflict>().is_some() {
            return StoreErrorKind::Conflict;
        }
        if let Some(rusqlite::Error::SqliteFailure(failure, _)) =
            cause.downcast_ref::<rusqlite::Error>()
        {
            if matches!(failure.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) {
                return StoreErrorKind::Busy;
            }
        }
    }
    StoreErrorKind::Fatal
}

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OpenKeyViolation {
    pub subject: String,
    pub predicate: String,
    pub open_records: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub open_key_violations: Vec<OpenKeyViolation>,
    pub schema_status: SchemaStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClearSummary {
    pub deleted_episodes: usize,
    pub deleted_facts: usize,
}

impl SqliteStore {
    /// Open a SQLite-backed fact store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = MIGRATIONS
            .iter()
            .map(|(version, _)| *version)
            .filter(|version| *version > current_version)
            .collect::<Vec<_>>();

        Ok(SchemaStatus { current_version, target_version: LATEST_SCHEMA_VERSION, pending_versions })
    }

    /// Create tables, constraints and indices. Safe to call any number of times.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let current_version = current_schema_version(&self.conn)?;
        if current_version > LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {current_version}; expected <= {LATEST_SCHEMA_VERSION}"
            ));
        }

        for (version, sql) in MIGRATIONS {
            if version <= current_version {
                continue;
            }
            let tx = self
                .conn
                .transaction()
                .with_context(|| format!("failed to start migration v{version} transaction"))?;
            tx.execute_batch(sql).with_context(|| format!("failed to apply migration v{version}"))?;
            tx.execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at_ns) VALUES (?1, ?2)",
                params![version, now_unix_nanos()?],
            )
            .with_context(|| format!("failed to record migration version {version}"))?;
            tx.commit().with_context(|| format!("failed to commit migration v{version}"))?;
        }

        Ok(())
    }

    /// Close the connection, reporting any error `SQLite` raises while finalizing.
    ///
    /// # Errors
    /// Returns an error when the connection cannot be closed cleanly.
    pub fn close(self) -> Result<()> {
        self.conn
            .close()
            .map_err(|(_, err)| err)
            .context("failed to close sqlite connection")
    }

    /// Persist one accepted episode. Episodes are never updated afterwards.
    ///
    /// # Errors
    /// Returns an error when the insert fails.
    pub fn insert_episode(&mut self, episode: &Episode) -> Result<()> {
        self.conn
            .execute(
                &format!(
                    "INSERT INTO episodes({EPISODE_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
                ),
                params![
                    episode.episode_id.to_string(),
                    episode.name,
                    episode.body,
                    episode.kind.as_str(),
                    episode.source_description,
                    to_unix_nanos(episode.reference_time)?,
                    to_unix_nanos(episode.ingested_at)?,
                    episode.content_hash,
                ],
            )
            .context("failed to insert episode")?;
        Ok(())
    }

    /// Return up to `last_n` episodes with `reference_time <= at`, newest first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn recent_episodes(&self, at: OffsetDateTime, last_n: usize) -> Result<Vec<Episode>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {EPISODE_COLUMNS} FROM episodes
             WHERE reference_time_ns <= ?1
             ORDER BY reference_time_ns DESC, ingested_at_ns DESC, episode_id DESC
             LIMIT ?2"
        ))?;
        let limit = i64::try_from(last_n).unwrap_or(i64::MAX);
        let mut rows = stmt.query(params![to_unix_nanos(at)?, limit])?;
        let mut episodes = Vec::new();
        while let Some(row) = rows.next()? {
            episodes.push(decode_episode(row)?);
        }
        Ok(episodes)
    }

    /// Read the record for `key` whose `valid_to` is open, if any.
    ///
    /// # Errors
    /// Returns an error when the lookup or row decoding fails.
    pub fn read_open(&self, key: &FactKey) -> Result<Option<FactRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {FACT_COLUMNS} FROM fact_records
             WHERE subject = ?1 AND predicate = ?2 AND valid_to_ns IS NULL"
        ))?;
        let mut rows = stmt.query(params![key.subject(), key.predicate()])?;
        match rows.next()? {
            Some(row) => Ok(Some(decode_fact(row)?)),
            None => Ok(None),
        }
    }

    /// Read the neighbors of instant `at` in the timeline of `key`.
    ///
    /// # Errors
    /// Returns an error when any lookup or row decoding fails.
    pub fn read_snapshot(&self, key: &FactKey, at: OffsetDateTime) -> Result<KeySnapshot> {
        let at_ns = to_unix_nanos(at)?;
        let open = self.read_open(key)?;
        let covering = self.query_one_fact(
            &format!(
                "SELECT {FACT_COLUMNS} FROM fact_records
                 WHERE subject = ?1 AND predicate = ?2 AND valid_from_ns < ?3
                   AND (valid_to_ns IS NULL OR valid_to_ns > ?3)
                 ORDER BY valid_from_ns DESC, created_at_ns DESC, fact_id DESC
                 LIMIT 1"
            ),
            key,
            at_ns,
        )?;
        let successor = self.query_one_fact(
            &format!(
                "SELECT {FACT_COLUMNS} FROM fact_records
                 WHERE subject = ?1 AND predicate = ?2 AND valid_from_ns >= ?3
                 ORDER BY valid_from_ns ASC, created_at_ns ASC, fact_id ASC
                 LIMIT 1"
            ),
            key,
            at_ns,
        )?;

        let mut stmt = self.conn.prepare(&format!(
            "SELECT {FACT_COLUMNS} FROM fact_records
             WHERE subject = ?1 AND predicate = ?2 AND valid_from_ns = ?3
             ORDER BY created_at_ns ASC, fact_id ASC"
        ))?;
        let mut rows = stmt.query(params![key.subject(), key.predicate(), at_ns])?;
        let mut same_instant = Vec::new();
        while let Some(row) = rows.next()? {
            same_instant.push(decode_fact(row)?);
        }

        Ok(KeySnapshot { open, covering, successor, same_instant })
    }

    /// Load every record for `key` in chronological order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn read_timeline(&self, key: &FactKey) -> Result<Vec<FactRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {FACT_COLUMNS} FROM fact_records
             WHERE subject = ?1 AND predicate = ?2
             ORDER BY valid_from_ns ASC, created_at_ns ASC, fact_id ASC"
        ))?;
        let mut rows = stmt.query(params![key.subject(), key.predicate()])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(decode_fact(row)?);
        }
        Ok(records)
    }

    /// Load all fact records ordered by key and time.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_facts(&self) -> Result<Vec<FactRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {FACT_COLUMNS} FROM fact_records
             ORDER BY subject ASC, predicate ASC, valid_from_ns ASC, created_at_ns ASC, fact_id ASC"
        ))?;
        let mut rows = stmt.query([])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(decode_fact(row)?);
        }
        Ok(records)
    }

    /// Apply one close/insert pair atomically.
    ///
    /// The closure only applies if the target record still has the `valid_to` that was
    /// read when the write was planned; otherwise nothing is written and a
    /// [`WriteConflict`] is returned. Inserting a second open record for a key is
    /// rejected by the partial unique index and also reported as a conflict.
    ///
    /// # Errors
    /// Returns [`WriteConflict`] (inside the `anyhow` chain) on a lost race, or any
    /// other error when validation or persistence fails.
    pub fn write_fact(&mut self, write: &FactWrite) -> Result<()> {
        write.insert.validate().map_err(|err| anyhow!("fact validation failed: {err}"))?;
        let key_label = format!("{}/{}", write.insert.subject, write.insert.predicate);

        let tx = self
            .conn
            .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)
            .context("failed to start fact write transaction")?;

        if let Some(close) = &write.close {
            let changed = match close.expected_valid_to {
                None => tx.execute(
                    "UPDATE fact_records SET valid_to_ns = ?1
                     WHERE fact_id = ?2 AND valid_to_ns IS NULL",
                    params![to_unix_nanos(close.valid_to)?, close.fact_id.to_string()],
                ),
                Some(expected) => tx.execute(
                    "UPDATE fact_records SET valid_to_ns = ?1
                     WHERE fact_id = ?2 AND valid_to_ns = ?3",
                    params![
                        to_unix_nanos(close.valid_to)?,
                        close.fact_id.to_string(),
                        to_unix_nanos(expected)?
                    ],
                ),
            }
            .context("failed to close fact record")?;

            if changed != 1 {
                return Err(anyhow::Error::new(WriteConflict {
                    key: key_label,
                    reason: format!("fact {} changed since it was read", close.fact_id),
                }));
            }
        }

        let record = &write.insert;
        let inserted = tx.execute(
            &format!(
                "INSERT INTO fact_records({FACT_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
            ),
            params![
                record.fact_id.to_string(),
                record.subject,
                record.predicate,
                record.object,
                f64::from(record.confidence),
                to_unix_nanos(record.valid_from)?,
                record.valid_to.map(to_unix_nanos).transpose()?,
                record.episode_id.to_string(),
                to_unix_nanos(record.created_at)?,
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(err) if is_open_key_violation(&err) => {
                return Err(anyhow::Error::new(WriteConflict {
                    key: key_label,
                    reason: "another open record was committed first".to_string(),
                }));
            }
            Err(err) => return Err(err).context("failed to insert fact record"),
        }

        tx.commit().context("failed to commit fact write transaction")?;
        Ok(())
    }

    /// Rank facts valid at `as_of` by lexical overlap with `text` across subject,
    /// predicate and object.
    ///
    /// Validity is applied before ranking and truncation, so a long history for one
    /// key cannot push the record valid at `as_of` out of the result window.
    ///
    /// # Errors
    /// Returns an error when the query text has no searchable terms, or reads fail.
    pub fn search(&self, text: &str, as_of: OffsetDateTime, limit: usize) -> Result<Vec<ScoredFact>> {
        let terms = search_terms(text)?;
        let as_of_ns = to_unix_nanos(as_of)?;
        let mut scored = self.scan_matches(
            &terms,
            "valid_from_ns <= ? AND (valid_to_ns IS NULL OR valid_to_ns > ?)",
            vec![SqlValue::Integer(as_of_ns), SqlValue::Integer(as_of_ns)],
        )?;

        scored.sort_by(|lhs, rhs| {
            rhs.score
                .partial_cmp(&lhs.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| rhs.record.valid_from.cmp(&lhs.record.valid_from))
                .then_with(|| lhs.record.fact_id.cmp(&rhs.record.fact_id))
        });
        scored.truncate(limit);
        Ok(scored)
    }

    /// Distinct subjects whose open facts match `text`, best match first.
    ///
    /// # Errors
    /// Returns an error when the query text has no searchable terms, or reads fail.
    pub fn search_subjects(&self, text: &str, limit: usize) -> Result<Vec<SubjectMatch>> {
        let terms = search_terms(text)?;
        let scored = self.scan_matches(&terms, "valid_to_ns IS NULL", Vec::new())?;
        Ok(rank_subjects(&scored, limit))
    }

    fn scan_matches(
        &self,
        terms: &[String],
        validity: &str,
        mut bindings: Vec<SqlValue>,
    ) -> Result<Vec<ScoredFact>> {
        let mut sql = format!("SELECT {FACT_COLUMNS} FROM fact_records WHERE {validity}");
        // SQLite lower() only folds ASCII; non-ASCII terms are left to lexical_score.
        if terms.iter().all(|term| term.is_ascii()) {
            let filters = vec![
                "lower(subject || ' ' || predicate || ' ' || object) LIKE ?";
                terms.len()
            ]
            .join(" OR ");
            sql.push_str(&format!(" AND ({filters})"));
            bindings.extend(terms.iter().map(|term| SqlValue::Text(format!("%{term}%"))));
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(bindings))?;
        let mut scored = Vec::new();
        while let Some(row) = rows.next()? {
            let record = decode_fact(row)?;
            if let Some(score) = lexical_score(terms, &record) {
                scored.push(ScoredFact { record, score });
            }
        }
        Ok(scored)
    }

    /// Delete every episode and fact record, keeping the schema.
    ///
    /// # Errors
    /// Returns an error when the delete transaction fails.
    pub fn clear_data(&mut self) -> Result<ClearSummary> {
        let tx = self.conn.transaction().context("failed to start clear transaction")?;
        let deleted_facts =
            tx.execute("DELETE FROM fact_records", []).context("failed to delete fact records")?;
        let deleted_episodes =
            tx.execute("DELETE FROM episodes", []).context("failed to delete episodes")?;
        tx.commit().context("failed to commit clear transaction")?;
        Ok(ClearSummary { deleted_episodes, deleted_facts })
    }

    /// Run quick-check, foreign-key-check, open-record uniqueness, and schema status probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;
        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let mut stmt = self
            .conn
            .prepare(
                "SELECT subject, predicate, COUNT(*) FROM fact_records
                 WHERE valid_to_ns IS NULL
                 GROUP BY subject, predicate
                 HAVING COUNT(*) > 1
                 ORDER BY subject ASC, predicate ASC",
            )
            .context("failed to prepare open-record uniqueness probe")?;
        let rows = stmt.query_map([], |row| {
            Ok(OpenKeyViolation {
                subject: row.get(0)?,
                predicate: row.get(1)?,
                open_records: row.get(2)?,
            })
        })?;
        let mut open_key_violations = Vec::new();
        for row in rows {
            open_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            open_key_violations,
            schema_status,
        })
    }

    fn query_one_fact(&self, sql: &str, key: &FactKey, at_ns: i64) -> Result<Option<FactRecord>> {
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query(params![key.subject(), key.predicate(), at_ns])?;
        match rows.next()? {
            Some(row) => Ok(Some(decode_fact(row)?)),
            None => Ok(None),
        }
    }
}

fn search_terms(text: &str) -> Result<Vec<String>> {
    let terms = tokenize_query_terms(text);
    if terms.is_empty() {
        return Err(anyhow!("search text MUST include at least one alphanumeric term"));
    }
    Ok(terms)
}

fn is_open_key_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(failure, message) => {
            failure.code == ErrorCode::ConstraintViolation
                && failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                && message.as_deref().map_or(true, |text| text.contains("fact_records.subject"))
        }
        _ => false,
    }
}

#[allow(clippy::cast_possible_truncation)]
fn decode_fact(row: &Row<'_>) -> Result<FactRecord> {
    let fact_id_raw: String = row.get(0)?;
    let episode_id_raw: String = row.get(7)?;
    let confidence: f64 = row.get(4)?;
    let valid_to_ns: Option<i64> = row.get(6)?;

    Ok(FactRecord {
        fact_id: parse_fact_id(&fact_id_raw)?,
        subject: row.get(1)?,
        predicate: row.get(2)?,
        object: row.get(3)?,
        confidence: confidence as f32,
        valid_from: from_unix_nanos(row.get(5)?)?,
        valid_to: valid_to_ns.map(from_unix_nanos).transpose()?,
        episode_id: parse_episode_id(&episode_id_raw)?,
        created_at: from_unix_nanos(row.get(8)?)?,
    })
}

fn decode_episode(row: &Row<'_>) -> Result<Episode> {
    let episode_id_raw: String = row.get(0)?;
    let kind_raw: String = row.get(3)?;
    Ok(Episode {
        episode_id: parse_episode_id(&episode_id_raw)?,
        name: row.get(1)?,
        body: row.get(2)?,
        kind: EpisodeKind::parse(&kind_raw)
            .ok_or_else(|| anyhow!("unknown episode kind: {kind_raw}"))?,
        source_description: row.get(4)?,
        reference_time: from_unix_nanos(row.get(5)?)?,
        ingested_at: from_unix_nanos(row.get(6)?)?,
        content_hash: row.get(7)?,
    })
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .optional()
        .context("failed to read current schema version")?;
    Ok(version.unwrap_or(0))
}

fn now_unix_nanos() -> Result<i64> {
    to_unix_nanos(OffsetDateTime::now_utc())
}

fn to_unix_nanos(value: OffsetDateTime) -> Result<i64> {
    i64::try_from(value.unix_timestamp_nanos())
        .with_context(|| format!("timestamp out of storable range: {value}"))
}

fn from_unix_nanos(value: i64) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(value))
        .with_context(|| format!("invalid stored timestamp: {value}"))
}

fn parse_fact_id(raw: &str) -> Result<FactId> {
    let parsed = Ulid::from_string(raw).with_context(|| format!("invalid ULID: {raw}"))?;
    Ok(FactId(parsed))
}

fn parse_episode_id(raw: &str) -> Result<EpisodeId> {
    let parsed = Ulid::from_string(raw).with_context(|| format!("invalid ULID: {raw}"))?;
    Ok(EpisodeId(parsed))
}
