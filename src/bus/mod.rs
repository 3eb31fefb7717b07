//! Publish/subscribe message bus.
//!
//! The broker is in-process; remote processes (skills, audio, GUI) attach
//! through the WebSocket surface in [`server`]. The bus holds no business
//! state — it delivers typed messages to subscribers and nothing more.

pub mod broker;
pub mod client;
pub mod message;
pub mod server;

pub use broker::{Broker, TypePattern};
pub use client::{BusClient, BusSubscription};
pub use message::{Message, MessageContext};
