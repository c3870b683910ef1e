//! Common utilities and types shared across the application.

pub mod error;
pub mod messages;
pub mod metrics;
pub mod types;
