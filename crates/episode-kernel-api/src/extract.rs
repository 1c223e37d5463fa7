use async_trait::async_trait;
use episode_kernel_core::{CandidateFact, Episode, EpisodeKind, FactKey};
use serde_json::{Map, Value};

use crate::error::IngestError;

/// Turns one episode into candidate facts.
///
/// Predicates must come from a controlled vocabulary: the engine compares
/// normalized keys by exact equality and never guesses that two differently
/// worded predicates mean the same thing.
#[async_trait]
pub trait FactExtractor: Send + Sync {
    async fn extract(&self, episode: &Episode) -> Result<Vec<CandidateFact>, IngestError>;
}

pub const MESSAGE_FALLBACK_PREDICATE: &str = "last_message";

/// Deterministic extractor for explicitly structured episodes.
///
/// - `text`: one `subject | predicate | object [| confidence]` per line.
/// - `json`: an object with a string `subject` field, or an object of objects.
/// - `message`: `Speaker: utterance` lines.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleExtractor;

#[async_trait]
impl FactExtractor for RuleExtractor {
    async fn extract(&self, episode: &Episode) -> Result<Vec<CandidateFact>, IngestError> {
        match episode.kind {
            EpisodeKind::Text => extract_text(episode),
            EpisodeKind::Json => extract_json(episode),
            EpisodeKind::Message => extract_message(episode),
        }
    }
}

struct Triple<'a> {
    subject: &'a str,
    predicate: &'a str,
    object: &'a str,
    confidence: Option<&'a str>,
}

fn parse_triple(line: &str) -> Option<Triple<'_>> {
    let parts = line.split('|').map(str::trim).collect::<Vec<_>>();
    let (subject, predicate, object, confidence) = match parts.as_slice() {
        [subject, predicate, object] => (*subject, *predicate, *object, None),
        [subject, predicate, object, confidence] => {
            (*subject, *predicate, *object, Some(*confidence))
        }
        _ => return None,
    };
    if subject.is_empty() || predicate.is_empty() || object.is_empty() {
        return None;
    }
    Some(Triple { subject, predicate, object, confidence })
}

fn candidate(
    episode: &Episode,
    subject: &str,
    predicate: &str,
    object: &str,
    confidence: f32,
) -> Result<CandidateFact, IngestError> {
    let key = FactKey::new(subject, predicate)
        .map_err(|err| IngestError::Extraction(format!("episode {}: {err}", episode.episode_id)))?;
    Ok(CandidateFact::new(key, object, confidence, episode))
}

fn triple_candidate(episode: &Episode, triple: &Triple<'_>) -> Result<CandidateFact, IngestError> {
    let confidence = match triple.confidence {
        None => 1.0,
        Some(raw) => match raw.parse::<f32>() {
            Ok(value) if (0.0..=1.0).contains(&value) => value,
            _ => {
                return Err(IngestError::Extraction(format!(
                    "episode {}: confidence `{raw}` MUST be a number in [0.0, 1.0]",
                    episode.episode_id
                )));
            }
        },
    };
    candidate(episode, triple.subject, triple.predicate, triple.object, confidence)
}

/// Within one episode the later statement wins for the same key.
fn push_last_wins(facts: &mut Vec<CandidateFact>, fact: CandidateFact) {
    if let Some(existing) = facts.iter_mut().find(|existing| existing.key == fact.key) {
        *existing = fact;
    } else {
        facts.push(fact);
    }
}

fn extract_text(episode: &Episode) -> Result<Vec<CandidateFact>, IngestError> {
    let mut facts = Vec::new();
    for triple in episode.body.lines().filter_map(parse_triple) {
        push_last_wins(&mut facts, triple_candidate(episode, &triple)?);
    }
    Ok(facts)
}

fn render_scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.trim().is_empty() => Some(text.clone()),
        Value::Number(_) | Value::Bool(_) => Some(value.to_string()),
        _ => None,
    }
}

fn object_facts(
    facts: &mut Vec<CandidateFact>,
    episode: &Episode,
    subject: &str,
    fields: &Map<String, Value>,
    skip: Option<&str>,
) -> Result<(), IngestError> {
    for (field, value) in fields {
        if Some(field.as_str()) == skip {
            continue;
        }
        if let Some(object) = render_scalar(value) {
            push_last_wins(facts, candidate(episode, subject, field, &object, 1.0)?);
        }
    }
    Ok(())
}

fn extract_json(episode: &Episode) -> Result<Vec<CandidateFact>, IngestError> {
    let value: Value = serde_json::from_str(&episode.body).map_err(|err| {
        IngestError::Extraction(format!("episode {}: invalid JSON body: {err}", episode.episode_id))
    })?;
    let Value::Object(root) = value else {
        return Err(IngestError::Extraction(format!(
            "episode {}: JSON body MUST be an object",
            episode.episode_id
        )));
    };

    let mut facts = Vec::new();
    if let Some(Value::String(subject)) = root.get("subject") {
        object_facts(&mut facts, episode, subject, &root, Some("subject"))?;
        return Ok(facts);
    }

    for (subject, value) in &root {
        if let Value::Object(fields) = value {
            object_facts(&mut facts, episode, subject, fields, None)?;
        }
    }
    Ok(facts)
}

fn extract_message(episode: &Episode) -> Result<Vec<CandidateFact>, IngestError> {
    let mut facts: Vec<CandidateFact> = Vec::new();
    for line in episode.body.lines() {
        let Some((speaker, utterance)) = line.split_once(':') else {
            continue;
        };
        let (speaker, utterance) = (speaker.trim(), utterance.trim());
        if speaker.is_empty() || utterance.is_empty() {
            continue;
        }

        let fact = match parse_triple(utterance) {
            Some(triple) => triple_candidate(episode, &triple)?,
            None => candidate(episode, speaker, MESSAGE_FALLBACK_PREDICATE, utterance, 1.0)?,
        };
        push_last_wins(&mut facts, fact);
    }
    Ok(facts)
}
