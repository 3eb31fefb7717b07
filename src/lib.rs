//! Session and intent coordination core for a voice-assistant appliance.
//!
//! The crate has three pillars: a lightweight message bus (in-process broker
//! plus a WebSocket endpoint for out-of-process skills and collaborator
//! services), a skill registry with heartbeat liveness and intent matching,
//! and a single-session state machine that arbitrates every spoken line and
//! GUI page on the device. [`IntentService`] ties them together.

pub mod bus;
pub mod config;
pub mod contract;
pub mod error;
pub mod intent;
pub mod registry;
pub mod service;
pub mod session;

pub use bus::{Broker, BusClient, Message, MessageContext};
pub use config::SkaldConfig;
pub use error::{Result, SkaldError};
pub use intent::{IntentDescriptor, IntentMatch, IntentMatcher, VocabularyEntry};
pub use registry::SkillRegistry;
pub use service::IntentService;
pub use session::{Directive, Effect, SessionEvent, SessionManager, SessionState, TimerKind};
