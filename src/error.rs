//! Error types for the gateway
//!
//! Only [`ConfigError`] is fatal, and only at startup. Everything else is
//! recovered inside the handshake that produced it.

use thiserror::Error;

/// Configuration could not be assembled
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required setting is absent from both the file and the environment
    #[error("missing required setting {0}")]
    Missing(&'static str),

    /// A setting is present but cannot be parsed
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },

    /// The configuration file could not be read
    #[error("failed to read config file {path}: {source}")]
    File {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML for [`crate::config::Config`]
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Several problems were found; all of them are reported at once
    #[error("configuration errors:\n  - {}", .0.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("\n  - "))]
    Multiple(Vec<ConfigError>),
}

/// A control plane request failed
#[derive(Debug, Error)]
pub enum ControlPlaneError {
    /// Transport failure (connect, TLS, timeout)
    #[error("control plane request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The control plane answered with a non-success status
    #[error("control plane returned {status}: {body}")]
    Status { status: u16, body: String },

    /// The response body did not have the expected shape
    #[error("unexpected control plane response: {0}")]
    Decode(String),
}

/// The game wire protocol could not be spoken with a peer
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A VarInt ran past its five byte maximum
    #[error("VarInt is too long")]
    VarIntTooLong,

    #[error("packet length {0} exceeds limit")]
    PacketTooLarge(usize),

    #[error("invalid packet length {0}")]
    InvalidLength(i32),

    #[error("unexpected packet id {id:#04x} in {state} state")]
    UnexpectedPacket { id: i32, state: &'static str },

    #[error("invalid string: {0}")]
    InvalidString(String),

    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    /// The peer closed the connection mid-packet
    #[error("connection closed by peer")]
    Closed,

    /// The peer went quiet for longer than the client timeout
    #[error("timed out waiting for peer")]
    TimedOut,
}
