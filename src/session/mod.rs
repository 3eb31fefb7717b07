//! Session lifecycle: the state machine and the effects it arbitrates.

pub mod effect;
pub mod manager;

pub use effect::Effect;
pub use manager::{
    Directive, IntentResolver, Session, SessionEvent, SessionManager, SessionState, TimerKind,
};
