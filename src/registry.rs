//! Skill registry: who is alive, what they can do, and which generation of
//! their registration the rest of the system may trust.
//!
//! Pure logic — the service loop feeds it bus messages and asks for
//! snapshots. Skills that miss heartbeats are marked not-alive but never
//! deleted; a later heartbeat reactivates them without re-registration.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::RegistryConfig;
use crate::intent::{IntentDescriptor, VocabularyEntry};

/// One skill's registration record.
#[derive(Debug, Clone)]
pub struct SkillRegistration {
    /// Stable skill identifier (derived from its install directory name).
    pub skill_id: String,
    /// Intents the skill handles.
    pub intents: Vec<IntentDescriptor>,
    /// Keyword phrases mapped to semantic slot tags.
    pub vocabulary: Vec<VocabularyEntry>,
    /// Bumped on every re-registration. Matches resolved against an older
    /// generation must be discarded — the skill may have restarted with
    /// different behavior.
    pub generation: u64,
    /// Heartbeat-derived liveness.
    pub alive: bool,
    /// When the last heartbeat (or registration) was seen.
    pub last_heartbeat: Instant,
    /// Registration order, used as the final tie-break in matching.
    pub order: u64,
}

/// A fallback slot: consulted in priority order when nothing matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackSlot {
    /// Skill offering to handle unmatched utterances.
    pub skill_id: String,
    /// Lower values are consulted first.
    pub priority: u32,
}

/// Registry of skill registrations and fallback slots.
pub struct SkillRegistry {
    skills: HashMap<String, SkillRegistration>,
    fallbacks: Vec<FallbackSlot>,
    heartbeat_interval: Duration,
    max_missed_heartbeats: u32,
    next_order: u64,
}

impl SkillRegistry {
    /// Create a registry with the given liveness settings.
    pub fn new(config: &RegistryConfig) -> Self {
        Self {
            skills: HashMap::new(),
            fallbacks: Vec::new(),
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_secs),
            max_missed_heartbeats: config.max_missed_heartbeats,
            next_order: 0,
        }
    }

    /// Store or overwrite a skill's registration, bumping its generation.
    ///
    /// Returns the new generation.
    pub fn register(
        &mut self,
        skill_id: &str,
        intents: Vec<IntentDescriptor>,
        vocabulary: Vec<VocabularyEntry>,
        now: Instant,
    ) -> u64 {
        let generation = self.skills.get(skill_id).map_or(1, |r| r.generation + 1);
        let order = match self.skills.get(skill_id) {
            Some(existing) => existing.order,
            None => self.take_order(),
        };
        info!(%skill_id, generation, intents = intents.len(), "skill registered");
        self.skills.insert(
            skill_id.to_owned(),
            SkillRegistration {
                skill_id: skill_id.to_owned(),
                intents,
                vocabulary,
                generation,
                alive: true,
                last_heartbeat: now,
                order,
            },
        );
        generation
    }

    /// Refresh a skill's liveness. Reactivates not-alive skills without
    /// requiring re-registration. Unknown skills are ignored with a warning.
    pub fn heartbeat(&mut self, skill_id: &str, now: Instant) {
        match self.skills.get_mut(skill_id) {
            Some(reg) => {
                if !reg.alive {
                    info!(%skill_id, "skill reactivated by heartbeat");
                }
                reg.alive = true;
                reg.last_heartbeat = now;
            }
            None => warn!(%skill_id, "heartbeat from unregistered skill"),
        }
    }

    /// Mark a skill not-alive. The registration is kept.
    pub fn deregister(&mut self, skill_id: &str) {
        if let Some(reg) = self.skills.get_mut(skill_id) {
            info!(%skill_id, "skill deregistered");
            reg.alive = false;
        }
    }

    /// Remove one intent from a skill's registration.
    pub fn detach_intent(&mut self, skill_id: &str, intent_name: &str) {
        if let Some(reg) = self.skills.get_mut(skill_id) {
            reg.intents.retain(|i| i.name != intent_name);
            debug!(%skill_id, %intent_name, "intent detached");
        }
    }

    /// Remove all intents and vocabulary registered for a skill.
    pub fn detach_skill(&mut self, skill_id: &str) {
        if let Some(reg) = self.skills.get_mut(skill_id) {
            reg.intents.clear();
            reg.vocabulary.clear();
            debug!(%skill_id, "all intents detached");
        }
    }

    /// Register (or re-prioritize) a fallback slot for a skill.
    pub fn register_fallback(&mut self, skill_id: &str, priority: u32) {
        self.fallbacks.retain(|f| f.skill_id != skill_id);
        let slot = FallbackSlot {
            skill_id: skill_id.to_owned(),
            priority,
        };
        // Insertion keeps the list ordered by priority, ties by registration
        // order, so the chain is deterministic.
        let at = self
            .fallbacks
            .iter()
            .position(|f| f.priority > priority)
            .unwrap_or(self.fallbacks.len());
        self.fallbacks.insert(at, slot);
    }

    /// Mark not-alive every skill whose heartbeat is overdue.
    ///
    /// Returns the ids of skills that just went not-alive.
    pub fn prune(&mut self, now: Instant) -> Vec<String> {
        let deadline = self.heartbeat_interval * self.max_missed_heartbeats;
        let mut lapsed = Vec::new();
        for reg in self.skills.values_mut() {
            if reg.alive && now.saturating_duration_since(reg.last_heartbeat) > deadline {
                warn!(skill_id = %reg.skill_id, "skill missed heartbeats, marking not-alive");
                reg.alive = false;
                lapsed.push(reg.skill_id.clone());
            }
        }
        lapsed
    }

    /// Snapshot of all live registrations for the matcher.
    pub fn intents_for_match(&self) -> Vec<SkillRegistration> {
        let mut live: Vec<SkillRegistration> = self
            .skills
            .values()
            .filter(|r| r.alive)
            .cloned()
            .collect();
        live.sort_by_key(|r| r.order);
        live
    }

    /// Ordered chain of live fallback skill ids.
    pub fn fallback_chain(&self) -> Vec<String> {
        self.fallbacks
            .iter()
            .filter(|f| self.is_alive(&f.skill_id))
            .map(|f| f.skill_id.clone())
            .collect()
    }

    /// Current generation for a skill, if registered.
    pub fn generation_of(&self, skill_id: &str) -> Option<u64> {
        self.skills.get(skill_id).map(|r| r.generation)
    }

    /// Whether a skill is currently alive.
    pub fn is_alive(&self, skill_id: &str) -> bool {
        self.skills.get(skill_id).is_some_and(|r| r.alive)
    }

    fn take_order(&mut self) -> u64 {
        let order = self.next_order;
        self.next_order += 1;
        order
    }
}
