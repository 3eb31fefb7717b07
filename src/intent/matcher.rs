//! Utterance-to-intent matching.
//!
//! Skills register keyword phrases mapped to semantic slot tags, and intents
//! naming which tags they require. Matching finds the tags an utterance
//! triggers, scores every live intent on tag coverage, and picks the winner
//! deterministically: score, then declared priority, then registration
//! order. A match below the confidence threshold goes to the fallback chain
//! instead.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::MatcherConfig;
use crate::registry::SkillRegistration;

/// A keyword phrase mapped to a semantic slot tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VocabularyEntry {
    /// Slot tag this phrase triggers, e.g. `AlarmKeyword`.
    pub tag: String,
    /// The phrase to look for, e.g. `"set an alarm"`.
    pub phrase: String,
}

/// A named capability a skill exposes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentDescriptor {
    /// Intent name, unique within the skill.
    pub name: String,
    /// Slot tags the utterance must trigger for this intent to be a
    /// candidate.
    pub required_vocabulary: Vec<String>,
    /// Slot tags that improve the score but are not required.
    #[serde(default)]
    pub optional_vocabulary: Vec<String>,
    /// Tie-break weight; higher wins among equal scores.
    #[serde(default)]
    pub priority: u32,
}

/// A winning skill+intent for an utterance.
#[derive(Debug, Clone, PartialEq)]
pub struct IntentMatch {
    /// Skill that owns the matched intent.
    pub skill_id: String,
    /// Name of the matched intent.
    pub intent_name: String,
    /// Registry generation the match was resolved against. The session
    /// manager discards the match if the skill has re-registered since.
    pub generation: u64,
    /// Coverage score in \[0, 1\].
    pub score: f32,
    /// Triggered slot tags and the phrases that triggered them.
    pub slots: HashMap<String, String>,
}

/// Scores utterances against live skill registrations.
pub struct IntentMatcher {
    confidence_threshold: f32,
}

impl IntentMatcher {
    /// Create a matcher with the configured acceptance threshold.
    pub fn new(config: &MatcherConfig) -> Self {
        Self {
            confidence_threshold: config.confidence_threshold,
        }
    }

    /// Select the best-scoring skill+intent for an utterance, or `None` if
    /// nothing reaches the confidence threshold.
    pub fn match_utterance(
        &self,
        utterance: &str,
        registrations: &[SkillRegistration],
    ) -> Option<IntentMatch> {
        let tokens = tokenize(utterance);
        if tokens.is_empty() {
            return None;
        }

        let mut best: Option<(IntentMatch, u32, u64)> = None;
        for registration in registrations {
            let triggered = triggered_tags(&tokens, &registration.vocabulary);
            for intent in &registration.intents {
                let Some((score, slots)) = score_intent(intent, &triggered) else {
                    continue;
                };
                if score < self.confidence_threshold {
                    continue;
                }
                let candidate = IntentMatch {
                    skill_id: registration.skill_id.clone(),
                    intent_name: intent.name.clone(),
                    generation: registration.generation,
                    score,
                    slots,
                };
                let replace = match &best {
                    None => true,
                    Some((current, current_priority, current_order)) => {
                        // Score first, then declared priority, then
                        // registration order. Strict inequality keeps the
                        // earliest registration on full ties.
                        candidate.score > current.score
                            || (candidate.score == current.score
                                && (intent.priority > *current_priority
                                    || (intent.priority == *current_priority
                                        && registration.order < *current_order)))
                    }
                };
                if replace {
                    best = Some((candidate, intent.priority, registration.order));
                }
            }
        }

        let winner = best.map(|(m, _, _)| m);
        match &winner {
            Some(m) => debug!(
                skill_id = %m.skill_id,
                intent = %m.intent_name,
                score = m.score,
                "intent matched"
            ),
            None => debug!(%utterance, "no intent above threshold"),
        }
        winner
    }
}

/// Lowercase, strip punctuation, split on whitespace.
fn tokenize(utterance: &str) -> Vec<String> {
    utterance
        .to_lowercase()
        .split_whitespace()
        .map(|w| {
            w.chars()
                .filter(|c| c.is_alphanumeric() || *c == '\'')
                .collect::<String>()
        })
        .filter(|w| !w.is_empty())
        .collect()
}

/// Which slot tags the utterance triggers, and the phrase that did it.
///
/// A vocabulary phrase matches when its tokens appear as a contiguous run in
/// the utterance.
fn triggered_tags(tokens: &[String], vocabulary: &[VocabularyEntry]) -> HashMap<String, String> {
    let mut triggered = HashMap::new();
    for entry in vocabulary {
        let phrase_tokens = tokenize(&entry.phrase);
        if phrase_tokens.is_empty() {
            continue;
        }
        let hit = tokens
            .windows(phrase_tokens.len())
            .any(|window| window == phrase_tokens.as_slice());
        if hit {
            triggered
                .entry(entry.tag.clone())
                .or_insert_with(|| entry.phrase.clone());
        }
    }
    triggered
}

/// Coverage score for one intent, or `None` if it is not a candidate.
///
/// All required tags must be triggered. Optional tags contribute at half
/// weight. Intents with no vocabulary at all cannot match.
fn score_intent(
    intent: &IntentDescriptor,
    triggered: &HashMap<String, String>,
) -> Option<(f32, HashMap<String, String>)> {
    if intent.required_vocabulary.is_empty() && intent.optional_vocabulary.is_empty() {
        return None;
    }

    let mut slots = HashMap::new();
    for tag in &intent.required_vocabulary {
        let phrase = triggered.get(tag)?;
        slots.insert(tag.clone(), phrase.clone());
    }

    let mut optional_hits = 0_usize;
    for tag in &intent.optional_vocabulary {
        if let Some(phrase) = triggered.get(tag) {
            slots.insert(tag.clone(), phrase.clone());
            optional_hits += 1;
        }
    }

    let required = intent.required_vocabulary.len() as f32;
    let optional = intent.optional_vocabulary.len() as f32;
    let score = (required + 0.5 * optional_hits as f32) / (required + 0.5 * optional);
    Some((score, slots))
}
