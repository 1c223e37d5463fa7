use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use ulid::Ulid;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum KernelError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("config error: {0}")]
    Config(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct EpisodeId(pub Ulid);

impl EpisodeId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for EpisodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for EpisodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct FactId(pub Ulid);

impl FactId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for FactId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for FactId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeKind {
    Text,
    Json,
    Message,
}

impl EpisodeKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Json => "json",
            Self::Message => "message",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "text" => Some(Self::Text),
            "json" => Some(Self::Json),
            "message" => Some(Self::Message),
            _ => None,
        }
    }
}

/// Fixed per-episode reservation charged by admission, independent of body size.
pub const EPISODE_BASE_COST_BYTES: u64 = 4096;
/// Working-set multiplier applied to the body length when estimating admission cost.
pub const EPISODE_BODY_COST_MULTIPLIER: u64 = 8;

#[must_use]
pub fn estimate_episode_cost(body_len: usize) -> u64 {
    u64::try_from(body_len)
        .unwrap_or(u64::MAX)
        .saturating_mul(EPISODE_BODY_COST_MULTIPLIER)
        .saturating_add(EPISODE_BASE_COST_BYTES)
}

#[must_use]
pub fn content_hash(body: &str) -> String {
    let digest = Sha256::digest(body.as_bytes());
    format!("sha256:{digest:x}")
}

/// Raw episode submission as received from a caller. `kind` stays a string so
/// that unknown kinds surface as validation errors rather than decode failures.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NewEpisode {
    pub name: String,
    pub body: String,
    pub kind: String,
    #[serde(default)]
    pub source_description: String,
    #[serde(with = "time::serde::rfc3339")]
    pub reference_time: OffsetDateTime,
}

impl NewEpisode {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        body: impl Into<String>,
        kind: EpisodeKind,
        source_description: impl Into<String>,
        reference_time: OffsetDateTime,
    ) -> Self {
        Self {
            name: name.into(),
            body: body.into(),
            kind: kind.as_str().to_string(),
            source_description: source_description.into(),
            reference_time,
        }
    }

    #[must_use]
    pub fn estimated_cost(&self) -> u64 {
        estimate_episode_cost(self.body.len())
    }

    /// Validate the submission and stamp it into an immutable [`Episode`].
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] when the body is blank or the kind is not
    /// one of `text`, `json`, `message`.
    pub fn into_episode(self, ingested_at: OffsetDateTime) -> Result<Episode, KernelError> {
        if self.body.trim().is_empty() {
            return Err(KernelError::Validation("episode body MUST be non-empty".to_string()));
        }

        let Some(kind) = EpisodeKind::parse(self.kind.trim()) else {
            return Err(KernelError::Validation(format!(
                "episode kind MUST be one of text, json, message (got `{}`)",
                self.kind
            )));
        };

        let content_hash = content_hash(&self.body);
        Ok(Episode {
            episode_id: EpisodeId::new(),
            name: self.name,
            body: self.body,
            kind,
            source_description: self.source_description,
            reference_time: self.reference_time,
            ingested_at,
            content_hash,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Episode {
    pub episode_id: EpisodeId,
    pub name: String,
    pub body: String,
    pub kind: EpisodeKind,
    pub source_description: String,
    #[serde(with = "time::serde::rfc3339")]
    pub reference_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub ingested_at: OffsetDateTime,
    pub content_hash: String,
}

impl Episode {
    #[must_use]
    pub fn estimated_cost(&self) -> u64 {
        estimate_episode_cost(self.body.len())
    }
}

/// Normalize one half of a fact key: trimmed, lowercased, with runs of
/// whitespace, `-` and `_` collapsed to a single `_`.
#[must_use]
pub fn normalize_key_part(raw: &str) -> String {
    let mut normalized = String::with_capacity(raw.len());
    let mut pending_separator = false;
    for ch in raw.trim().chars() {
        if ch.is_whitespace() || ch == '-' || ch == '_' {
            pending_separator = true;
            continue;
        }
        if pending_separator && !normalized.is_empty() {
            normalized.push('_');
        }
        pending_separator = false;
        normalized.extend(ch.to_lowercase());
    }
    normalized
}

/// The (subject, predicate) identity under which at most one fact is open.
///
/// Two candidates conflict only when their normalized keys are byte-equal.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct FactKey {
    subject: String,
    predicate: String,
}

impl FactKey {
    /// # Errors
    /// Returns [`KernelError::Validation`] when either part normalizes to empty.
    pub fn new(subject: &str, predicate: &str) -> Result<Self, KernelError> {
        let subject = normalize_key_part(subject);
        let predicate = normalize_key_part(predicate);
        if subject.is_empty() {
            return Err(KernelError::Validation("fact subject MUST be non-empty".to_string()));
        }
        if predicate.is_empty() {
            return Err(KernelError::Validation("fact predicate MUST be non-empty".to_string()));
        }
        Ok(Self { subject, predicate })
    }

    #[must_use]
    pub fn subject(&self) -> &str {
        &self.subject
    }

    #[must_use]
    pub fn predicate(&self) -> &str {
        &self.predicate
    }
}

impl Display for FactKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.subject, self.predicate)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CandidateFact {
    pub key: FactKey,
    pub object: String,
    pub confidence: f32,
    pub episode_id: EpisodeId,
    pub reference_time: OffsetDateTime,
}

impl CandidateFact {
    #[must_use]
    pub fn new(key: FactKey, object: impl Into<String>, confidence: f32, episode: &Episode) -> Self {
        Self {
            key,
            object: object.into(),
            confidence,
            episode_id: episode.episode_id,
            reference_time: episode.reference_time,
        }
    }

    /// # Errors
    /// Returns [`KernelError::Validation`] for a blank object or an out-of-range confidence.
    pub fn validate(&self) -> Result<(), KernelError> {
        if self.object.trim().is_empty() {
            return Err(KernelError::Validation(format!(
                "fact object MUST be non-empty for key {}",
                self.key
            )));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(KernelError::Validation(
                "confidence MUST be in [0.0, 1.0]".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FactRecord {
    pub fact_id: FactId,
    pub subject: String,
    pub predicate: String,
    pub object: String,
    pub confidence: f32,
    #[serde(with = "time::serde::rfc3339")]
    pub valid_from: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub valid_to: Option<OffsetDateTime>,
    pub episode_id: EpisodeId,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl FactRecord {
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.valid_to.is_none()
    }

    /// `valid_from <= at` and (`valid_to` is open or `at < valid_to`).
    #[must_use]
    pub fn is_valid_at(&self, at: OffsetDateTime) -> bool {
        self.valid_from <= at && self.valid_to.map_or(true, |valid_to| at < valid_to)
    }

    /// # Errors
    /// Returns [`KernelError::Validation`] when subject or predicate is blank.
    pub fn key(&self) -> Result<FactKey, KernelError> {
        FactKey::new(&self.subject, &self.predicate)
    }

    /// Validate one persisted fact against the interval invariants.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] for a blank key or object, an inverted
    /// validity interval, or an out-of-range confidence.
    pub fn validate(&self) -> Result<(), KernelError> {
        self.key()?;
        if self.object.trim().is_empty() {
            return Err(KernelError::Validation("fact object MUST be non-empty".to_string()));
        }
        if let Some(valid_to) = self.valid_to {
            if valid_to < self.valid_from {
                return Err(KernelError::Validation(
                    "valid_to MUST NOT precede valid_from".to_string(),
                ));
            }
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(KernelError::Validation(
                "confidence MUST be in [0.0, 1.0]".to_string(),
            ));
        }
        Ok(())
    }

    fn timeline_cmp(lhs: &Self, rhs: &Self) -> Ordering {
        lhs.valid_from
            .cmp(&rhs.valid_from)
            .then_with(|| lhs.created_at.cmp(&rhs.created_at))
            .then_with(|| lhs.fact_id.cmp(&rhs.fact_id))
    }
}

/// Order one key's records chronologically (`valid_from`, then `created_at`, then `fact_id`).
pub fn sort_timeline(records: &mut [FactRecord]) {
    records.sort_by(FactRecord::timeline_cmp);
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoredFact {
    pub record: FactRecord,
    pub score: f32,
}

/// The slice of one key's timeline needed to place a candidate at instant `at`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeySnapshot {
    /// The record with `valid_to = None`, if any.
    pub open: Option<FactRecord>,
    /// The record whose interval strictly contains `at` from an earlier `valid_from`.
    pub covering: Option<FactRecord>,
    /// The earliest record with `valid_from >= at`.
    pub successor: Option<FactRecord>,
    /// Every record with `valid_from == at`.
    pub same_instant: Vec<FactRecord>,
}

impl KeySnapshot {
    /// Build a snapshot from the full timeline of a single key.
    #[must_use]
    pub fn from_timeline(records: &[FactRecord], at: OffsetDateTime) -> Self {
        let open = records.iter().find(|record| record.is_open()).cloned();
        let covering = records
            .iter()
            .filter(|record| {
                record.valid_from < at && record.valid_to.map_or(true, |valid_to| valid_to > at)
            })
            .max_by(|lhs, rhs| FactRecord::timeline_cmp(lhs, rhs))
            .cloned();
        let successor = records
            .iter()
            .filter(|record| record.valid_from >= at)
            .min_by(|lhs, rhs| FactRecord::timeline_cmp(lhs, rhs))
            .cloned();
        let same_instant =
            records.iter().filter(|record| record.valid_from == at).cloned().collect();

        Self { open, covering, successor, same_instant }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// First fact for the key; nothing closed.
    Opened,
    /// New current fact; the previously open record was closed.
    Superseded,
    /// Late-arriving fact placed into the past with a bounded interval.
    Historical,
}

impl Disposition {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Opened => "opened",
            Self::Superseded => "superseded",
            Self::Historical => "historical",
        }
    }
}

/// Patch of one existing record's `valid_to`, guarded by the value read at plan time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct FactClosure {
    pub fact_id: FactId,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expected_valid_to: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub valid_to: OffsetDateTime,
}

/// One atomic write: optionally close an existing record, then insert a new one.
#[derive(Debug, Clone, PartialEq)]
pub struct FactWrite {
    pub close: Option<FactClosure>,
    pub insert: FactRecord,
    pub disposition: Disposition,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SupersessionPlan {
    Duplicate { existing: FactId },
    Write(FactWrite),
}

/// Decide how a candidate enters its key's timeline.
///
/// Placement depends only on `reference_time` ordering:
/// - no open record, or the open record starts strictly earlier: the candidate
///   becomes the open record and the previous one (if any) is closed at the
///   candidate's `valid_from`;
/// - the open record starts at or after the candidate: the candidate is
///   inserted as history ending at its successor's `valid_from`, and a closed
///   record covering that instant is shortened to end there.
///
/// A candidate with the same object and instant as an existing record is a duplicate.
///
/// # Errors
/// Returns [`KernelError::Validation`] when the candidate is invalid or the snapshot
/// is internally inconsistent.
pub fn plan_supersession(
    candidate: &CandidateFact,
    snapshot: &KeySnapshot,
    fact_id: FactId,
    created_at: OffsetDateTime,
) -> Result<SupersessionPlan, KernelError> {
    candidate.validate()?;
    let at = candidate.reference_time;

    if let Some(existing) =
        snapshot.same_instant.iter().find(|record| record.object == candidate.object)
    {
        return Ok(SupersessionPlan::Duplicate { existing: existing.fact_id });
    }

    let mut insert = FactRecord {
        fact_id,
        subject: candidate.key.subject().to_string(),
        predicate: candidate.key.predicate().to_string(),
        object: candidate.object.clone(),
        confidence: candidate.confidence,
        valid_from: at,
        valid_to: None,
        episode_id: candidate.episode_id,
        created_at,
    };

    let place_as_history = match snapshot.open.as_ref() {
        Some(open) => open.valid_from >= at,
        None => snapshot.successor.is_some(),
    };

    if !place_as_history {
        let close = snapshot.open.as_ref().map(|open| FactClosure {
            fact_id: open.fact_id,
            expected_valid_to: None,
            valid_to: at,
        });
        let disposition =
            if close.is_some() { Disposition::Superseded } else { Disposition::Opened };
        return Ok(SupersessionPlan::Write(FactWrite { close, insert, disposition }));
    }

    let Some(successor) = snapshot.successor.as_ref() else {
        return Err(KernelError::Validation(format!(
            "inconsistent timeline for {}: open record starts after candidate but no successor was read",
            candidate.key
        )));
    };
    insert.valid_to = Some(successor.valid_from);

    let close = match snapshot.covering.as_ref() {
        Some(covering) => match covering.valid_to {
            Some(valid_to) => Some(FactClosure {
                fact_id: covering.fact_id,
                expected_valid_to: Some(valid_to),
                valid_to: at,
            }),
            None => {
                return Err(KernelError::Validation(format!(
                    "inconsistent timeline for {}: more than one open record",
                    candidate.key
                )));
            }
        },
        None => None,
    };

    Ok(SupersessionPlan::Write(FactWrite { close, insert, disposition: Disposition::Historical }))
}

fn ranked_cmp(lhs: &ScoredFact, rhs: &ScoredFact) -> Ordering {
    rhs.score
        .partial_cmp(&lhs.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| rhs.record.valid_from.cmp(&lhs.record.valid_from))
        .then_with(|| lhs.record.fact_id.cmp(&rhs.record.fact_id))
}

/// Keep only facts valid at `as_of`, ranked by score then most recent `valid_from`.
#[must_use]
pub fn resolve_as_of(
    candidates: Vec<ScoredFact>,
    as_of: OffsetDateTime,
    limit: usize,
) -> Vec<ScoredFact> {
    let mut seen = BTreeSet::new();
    let mut valid = candidates
        .into_iter()
        .filter(|candidate| candidate.record.is_valid_at(as_of))
        .filter(|candidate| seen.insert(candidate.record.fact_id))
        .collect::<Vec<_>>();
    valid.sort_by(ranked_cmp);
    valid.truncate(limit);
    valid
}

#[must_use]
pub fn tokenize_query_terms(value: &str) -> Vec<String> {
    let mut terms = BTreeSet::new();
    for raw in value.split(|ch: char| ch.is_whitespace() || ch == '_' || ch == '/') {
        let normalized = raw
            .chars()
            .filter(|ch| ch.is_alphanumeric() || *ch == '-')
            .collect::<String>()
            .to_lowercase();
        if normalized.chars().count() >= 2 {
            terms.insert(normalized);
        }
    }
    terms.into_iter().collect()
}

fn fact_terms(record: &FactRecord) -> BTreeSet<String> {
    let mut terms = BTreeSet::new();
    for input in [record.subject.as_str(), record.predicate.as_str(), record.object.as_str()] {
        terms.extend(tokenize_query_terms(input));
    }
    terms
}

/// Fraction of normalized query terms present in the fact's subject, predicate or object.
#[must_use]
pub fn lexical_score(query_terms: &[String], record: &FactRecord) -> Option<f32> {
    if query_terms.is_empty() {
        return None;
    }
    let terms = fact_terms(record);
    let matched = query_terms.iter().filter(|term| terms.contains(*term)).count();
    if matched == 0 {
        return None;
    }
    let matched_f32 = f32::from(u16::try_from(matched).unwrap_or(u16::MAX));
    let total_f32 = f32::from(u16::try_from(query_terms.len()).unwrap_or(u16::MAX));
    Some(matched_f32 / total_f32)
}

/// A subject that has at least one open fact matching a query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubjectMatch {
    pub subject: String,
    /// Best score among the subject's matching open facts.
    pub score: f32,
    pub matching_facts: usize,
}

/// Group open scored facts by subject, best score first, then subject name.
///
/// Closed records are ignored so a subject only matches on what is currently true.
#[must_use]
pub fn rank_subjects(scored: &[ScoredFact], limit: usize) -> Vec<SubjectMatch> {
    let mut subjects: Vec<SubjectMatch> = Vec::new();
    for fact in scored.iter().filter(|fact| fact.record.is_open()) {
        match subjects.iter_mut().find(|entry| entry.subject == fact.record.subject) {
            Some(entry) => {
                entry.score = entry.score.max(fact.score);
                entry.matching_facts += 1;
            }
            None => subjects.push(SubjectMatch {
                subject: fact.record.subject.clone(),
                score: fact.score,
                matching_facts: 1,
            }),
        }
    }
    subjects.sort_by(|lhs, rhs| {
        rhs.score
            .partial_cmp(&lhs.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| lhs.subject.cmp(&rhs.subject))
    });
    subjects.truncate(limit);
    subjects
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct KernelConfig {
    pub max_concurrent_episodes: usize,
    pub memory_budget_bytes: u64,
    pub memory_safety_factor: f64,
    pub episode_batch_size: usize,
    pub transaction_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub search_overfetch: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            max_concurrent_episodes: 5,
            memory_budget_bytes: 256 * 1024 * 1024,
            memory_safety_factor: 0.8,
            episode_batch_size: 100,
            transaction_timeout_ms: 30_000,
            max_retries: 3,
            retry_base_delay_ms: 100,
            retry_max_delay_ms: 5_000,
            search_overfetch: 4,
        }
    }
}

impl KernelConfig {
    /// # Errors
    /// Returns [`KernelError::Config`] naming the first out-of-range option.
    pub fn validate(&self) -> Result<(), KernelError> {
        if self.max_concurrent_episodes == 0 {
            return Err(KernelError::Config("max_concurrent_episodes MUST be >= 1".to_string()));
        }
        if self.memory_budget_bytes == 0 {
            return Err(KernelError::Config("memory_budget_bytes MUST be >= 1".to_string()));
        }
        if !(self.memory_safety_factor > 0.0 && self.memory_safety_factor <= 1.0) {
            return Err(KernelError::Config(
                "memory_safety_factor MUST be in (0.0, 1.0]".to_string(),
            ));
        }
        if self.episode_batch_size == 0 {
            return Err(KernelError::Config("episode_batch_size MUST be >= 1".to_string()));
        }
        if self.transaction_timeout_ms == 0 {
            return Err(KernelError::Config("transaction_timeout_ms MUST be >= 1".to_string()));
        }
        if self.max_retries == 0 {
            return Err(KernelError::Config("max_retries MUST be >= 1".to_string()));
        }
        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            return Err(KernelError::Config(
                "retry_max_delay_ms MUST be >= retry_base_delay_ms".to_string(),
            ));
        }
        if self.search_overfetch == 0 {
            return Err(KernelError::Config("search_overfetch MUST be >= 1".to_string()));
        }
        Ok(())
    }

    /// Bytes admission may reserve: `memory_budget_bytes * memory_safety_factor`.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn admissible_bytes(&self) -> u64 {
        (self.memory_budget_bytes as f64 * self.memory_safety_factor).floor() as u64
    }

    #[must_use]
    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }

    #[must_use]
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    #[must_use]
    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }
}
