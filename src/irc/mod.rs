//! IRC side of the bridge.

pub mod client;
pub mod codec;
pub mod connection;
pub mod formatting;
pub mod names;
pub mod server;
pub mod wire;

#[cfg(test)]
pub mod testing;

pub use client::ConnectionDeps;
pub use connection::TcpConnector;
pub use names::StoreNames;
