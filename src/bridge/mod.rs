//! The bridging engine.
//!
//! ## Module Structure
//!
//! - `actions`: translation between room events, neutral actions and IRC
//! - `channels`: channels between the listener, the connections and the loop
//! - `local_events` / `remote_events`: handlers for each side's events
//! - `orchestrator`: startup sequence, event loop and bot supervision
//! - `registration`: homeserver token and registration file
//! - `requests`: per-event accounting with timeout escalation
//! - `state`: shared context and the connection registry

pub mod actions;
pub mod channels;
pub mod local_events;
pub mod orchestrator;
pub mod registration;
pub mod remote_events;
pub mod requests;
pub mod state;

#[cfg(test)]
pub mod testing;

pub use channels::ChannelBundle;
pub use orchestrator::Bridge;
pub use state::BridgeContext;
