//! Message types and payloads making up the bus contract.
//!
//! Every service speaks this contract and nothing else: skills never command
//! the audio or GUI services directly, they declare effects through
//! `session.end` / `session.continue` and the intent service arbitrates.

use serde::{Deserialize, Serialize};

use crate::intent::{IntentDescriptor, VocabularyEntry};
use crate::session::Effect;

/// Fixed message types on the bus.
pub mod topics {
    /// Wake word detected; a new session should start listening.
    pub const WAKEWORD: &str = "recognizer_loop:wakeword";
    /// Explicit listen trigger (button press, skill-requested response).
    pub const LISTEN: &str = "mic.listen";
    /// A transcribed user utterance.
    pub const UTTERANCE: &str = "recognizer_loop:utterance";

    /// Skill announces itself and its intents.
    pub const SKILL_REGISTER: &str = "skill.register";
    /// Periodic skill liveness beat.
    pub const SKILL_HEARTBEAT: &str = "skill.heartbeat";
    /// Skill is going away.
    pub const SKILL_DEREGISTER: &str = "skill.deregister";
    /// Emitted by the bus server when a skill's connection drops.
    pub const SKILL_DISCONNECTED: &str = "skill.disconnected";
    /// Remove a single intent from a skill's registration.
    pub const SKILL_DETACH_INTENT: &str = "skill.detach_intent";
    /// Remove all intents and vocabulary from a skill's registration.
    pub const SKILL_DETACH_SKILL: &str = "skill.detach_skill";
    /// Register a skill as a fallback handler with a priority.
    pub const SKILL_REGISTER_FALLBACK: &str = "skill.register_fallback";

    /// Skill response ending its session, carrying declared effects.
    pub const SESSION_END: &str = "session.end";
    /// Skill response continuing its session (optionally expecting a reply).
    pub const SESSION_CONTINUE: &str = "session.continue";

    /// Announcement: a session has started.
    pub const SESSION_STARTED: &str = "session.started";
    /// Announcement: a session was continued by its owning skill.
    pub const SESSION_CONTINUED: &str = "session.continued";
    /// Announcement: all of a session's effects have been dispatched.
    pub const SESSION_EFFECTS_COMPLETED: &str = "session.effects-completed";
    /// Announcement: a session has ended and the system is reverting to idle.
    pub const SESSION_ENDED: &str = "session.ended";
    /// Announcement: session ownership was handed to a child skill.
    pub const SESSION_DELEGATED: &str = "session.delegated";

    /// To the audio collaborator: speak a dialog line.
    pub const SPEAK: &str = "speak";
    /// Hint to the audio collaborator: pre-synthesize the next queued line.
    pub const SPEAK_CACHE: &str = "speak.cache";
    /// From the audio collaborator: speech output has started.
    pub const SPEECH_STARTED: &str = "speech.started";
    /// From the audio collaborator: speech output has finished.
    pub const SPEECH_FINISHED: &str = "speech.finished";

    /// To the GUI collaborator: show a page.
    pub const GUI_SHOW_PAGE: &str = "gui.show_page";
    /// To the GUI collaborator: clear the display now.
    pub const GUI_CLEAR: &str = "gui.clear";
    /// From the GUI collaborator: page is on screen (best-effort ack).
    pub const GUI_PAGE_SHOWN: &str = "gui.page_shown";
    /// To the GUI collaborator: revert to the idle screen.
    pub const GUI_IDLE: &str = "gui.idle";

    /// Fallback skill accept/decline reply.
    pub const FALLBACK_RESPONSE: &str = "fallback.response";
}

/// Build the invocation type for a matched intent:
/// `intent.invoke.<skill_id>.<intent_name>`.
#[must_use]
pub fn intent_invoke_topic(skill_id: &str, intent_name: &str) -> String {
    format!("intent.invoke.{skill_id}.{intent_name}")
}

/// Build the raw follow-up type for a skill awaiting a response:
/// `raw_utterance.<skill_id>`.
#[must_use]
pub fn raw_utterance_topic(skill_id: &str) -> String {
    format!("raw_utterance.{skill_id}")
}

/// Build the fallback consultation type: `fallback.request.<skill_id>`.
#[must_use]
pub fn fallback_request_topic(skill_id: &str) -> String {
    format!("fallback.request.{skill_id}")
}

/// Build the delegation invocation type for a child skill:
/// `delegate.invoke.<skill_id>`.
#[must_use]
pub fn delegate_invoke_topic(skill_id: &str) -> String {
    format!("delegate.invoke.{skill_id}")
}

/// Payload of `skill.register`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterPayload {
    /// Stable skill identifier (install directory name).
    pub skill_id: String,
    /// Intents the skill can handle.
    pub intents: Vec<IntentDescriptor>,
    /// Keyword phrases mapped to semantic slot tags.
    #[serde(default)]
    pub vocabulary: Vec<VocabularyEntry>,
}

/// Payload of `skill.register_fallback`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterFallbackPayload {
    /// Skill offering to handle unmatched utterances.
    pub skill_id: String,
    /// Lower values are consulted first.
    pub priority: u32,
}

/// Payload of `session.end` sent by the owning skill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndSessionPayload {
    /// Effects to serialize before the session reverts to idle.
    #[serde(default)]
    pub effects: Vec<Effect>,
}

/// Payload of `session.continue` sent by the owning skill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinueSessionPayload {
    /// Effects to dispatch before the session continues.
    #[serde(default)]
    pub effects: Vec<Effect>,
    /// True if the next utterance should be routed straight back to the
    /// owning skill as a raw follow-up.
    #[serde(default)]
    pub expects_response: bool,
}

/// Payload of `fallback.response`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackResponsePayload {
    /// True if the fallback skill took the utterance and now owns the session.
    pub handled: bool,
}

/// Payload of `session.ended`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEndedPayload {
    /// True if the session was cut short (timeout, error, preemption).
    pub aborted: bool,
    /// Skills the abort is attributed to, for diagnostics. Empty on clean
    /// endings; both parent and child on delegation timeouts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attributed_to: Vec<String>,
}
