//! Homeserver side of the bridge.

pub mod client;
pub mod listener;

#[cfg(test)]
pub mod testing;

pub use client::HttpRemoteClient;
