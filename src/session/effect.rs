//! Skill-declared effects.
//!
//! Effects are data, not commands: a skill never talks to the audio or GUI
//! services directly. It declares what it wants when ending or continuing a
//! session, and the session manager serializes the declared effects into one
//! coherent on-device experience.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

fn default_wait() -> bool {
    true
}

/// A declarative side-effect request emitted by a skill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Effect {
    /// Speak a dialog line. Spoken effects are serialized: one in flight per
    /// session, the next dispatched only after `speech.finished`.
    Speak {
        /// Dialog file id the text was rendered from, if any.
        #[serde(skip_serializing_if = "Option::is_none")]
        dialog_id: Option<String>,
        /// Text to speak.
        text: String,
        /// Whether later effects wait for this line to finish. Defaults to
        /// true; `wait = false` lines fire and forget.
        #[serde(default = "default_wait")]
        wait: bool,
    },
    /// Show a GUI page. Fire-and-forget from the manager's perspective.
    ShowPage {
        /// Page identifier, `{skill_id}.{page_name}`.
        page_id: String,
        /// Values for the page template.
        #[serde(default)]
        data: Map<String, Value>,
    },
    /// Clear the GUI immediately.
    ClearGui,
    /// Hand session ownership to a child skill, which must end the session
    /// itself (the "common query / common play" pattern).
    Delegate {
        /// Skill receiving ownership.
        child_skill_id: String,
        /// Payload forwarded to the child's delegation handler.
        #[serde(default)]
        data: Map<String, Value>,
    },
}

impl Effect {
    /// Shorthand for a waiting spoken dialog line.
    pub fn speak_dialog(dialog_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::Speak {
            dialog_id: Some(dialog_id.into()),
            text: text.into(),
            wait: true,
        }
    }

    /// Whether this effect updates the display.
    pub fn is_gui(&self) -> bool {
        matches!(self, Self::ShowPage { .. } | Self::ClearGui)
    }
}
