//! Error types for the application.

use thiserror::Error;

/// Errors raised by the bridging core.
///
/// Startup errors (`ConfigDrift`, `MissingRegistration`, `NoServers`) abort
/// the process. Everything else is scoped to a single event and ends up as a
/// rejection of the originating request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BridgeError {
    #[error("Token {token} failed the CRC ({stored} != {computed}); the config changed without --generate-registration. Either skip this check (-s) or generate a registration.")]
    ConfigDrift {
        token: String,
        stored: String,
        computed: String,
    },

    #[error("No stored homeserver token. Did you run --generate-registration?")]
    MissingRegistration,

    #[error("No servers specified")]
    NoServers,

    #[error("Connection to {domain} as {nick} failed: {reason}")]
    ConnectionFailed {
        domain: String,
        nick: String,
        reason: String,
    },

    #[error("Failed to join {channel} after {attempts} tries")]
    JoinTimeout { channel: String, attempts: u32 },

    #[error("Cannot track channel {channel}: {code}")]
    JoinRejected { channel: String, code: String },

    #[error("Cannot find nick {nick} on whois")]
    WhoisNotFound { nick: String },

    #[error("{channel} is a do-not-track channel")]
    ChannelExcluded { channel: String },

    #[error("Nick '{nick}' {reason}")]
    InvalidNick { nick: String, reason: String },

    #[error("Store is not ready")]
    StoreUnavailable,

    #[error("Store error: {0}")]
    Store(String),

    #[error("Unknown action kind: {kind}")]
    UnknownActionKind { kind: String },

    #[error("No known server for domain {domain}")]
    UnknownServer { domain: String },

    #[error("Homeserver request failed: {0}")]
    Remote(String),
}

impl From<StoreError> for BridgeError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotReady => BridgeError::StoreUnavailable,
            other => BridgeError::Store(other.to_string()),
        }
    }
}

/// Document store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store has not finished loading")]
    NotReady,

    #[error("Unsupported database URI '{uri}' (use file://<dir> or memory://)")]
    BadUri { uri: String },

    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt document: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {message}")]
    IoError { path: String, message: String },

    #[error("Failed to parse config: {message}")]
    ParseError { message: String },

    #[error("Config validation failed: {message}")]
    ValidationError { message: String },
}

/// Result type alias for bridge operations.
pub type BridgeResult<T> = std::result::Result<T, BridgeError>;

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;
