//! Pure mapping from a reconciled status to what the client is shown
//!
//! Nothing here performs I/O or reads the clock; the same inputs always
//! give the same payload.

use crate::status::{EffectiveStatus, PlayersInfo, StatusPayload, VersionInfo};
use serde_json::json;

/// Presentation settings for placeholder status payloads
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Presentation {
    pub version_name: String,
    pub max_players: u32,
}

impl Default for Presentation {
    fn default() -> Self {
        Self {
            version_name: "Wakegate".to_string(),
            max_players: 20,
        }
    }
}

/// Why a login was turned away while the server is busy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusyReason {
    Stopping,
}

/// Why no start could be arranged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnavailableReason {
    /// The start command was sent and refused or failed in transit
    StartFailed,
    /// The control plane could not tell us the server's state
    ControlPlane,
}

/// What happened with the start gate for this login
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartAttempt {
    /// The status did not call for a start
    NotNeeded,
    /// This login won the gate and the start command succeeded
    Triggered,
    /// This login won the gate but the start command failed
    Failed,
    /// Another login already holds the gate
    AlreadyInFlight,
}

/// Message a login handshake ends with
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    ConnectDirectly(String),
    StartTriggered { restart: bool },
    AlreadyStarting { elapsed_minutes: u64 },
    Busy(BusyReason),
    Unavailable(UnavailableReason),
}

impl LoginOutcome {
    /// Text shown on the client's disconnect screen
    pub fn message(&self) -> String {
        match self {
            Self::ConnectDirectly(address) => {
                format!("The server is online! Connect directly to {}.", address)
            }
            Self::StartTriggered { restart: false } => {
                "The server is starting up! Refresh and try again shortly.".to_string()
            }
            Self::StartTriggered { restart: true } => {
                "The server was unresponsive; a restart has been triggered. Try again shortly."
                    .to_string()
            }
            Self::AlreadyStarting { elapsed_minutes } => format!(
                "The server is already starting (started {} min ago) — please wait.",
                elapsed_minutes
            ),
            Self::Busy(BusyReason::Stopping) => {
                "The server is stopping — please wait before trying again.".to_string()
            }
            Self::Unavailable(UnavailableReason::StartFailed) => {
                "The server is currently unavailable — contact an administrator.".to_string()
            }
            Self::Unavailable(UnavailableReason::ControlPlane) => {
                "Error communicating with the control plane — contact an administrator."
                    .to_string()
            }
        }
    }

    /// Short label for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectDirectly(_) => "connect_directly",
            Self::StartTriggered { restart: false } => "start_triggered",
            Self::StartTriggered { restart: true } => "restart_triggered",
            Self::AlreadyStarting { .. } => "already_starting",
            Self::Busy(_) => "busy",
            Self::Unavailable(_) => "unavailable",
        }
    }
}

/// Description text for a status that is not served by the backend itself
pub fn status_description(status: EffectiveStatus, elapsed_minutes: u64) -> String {
    match status {
        EffectiveStatus::Offline => "Server is Offline — join to start it!".to_string(),
        EffectiveStatus::Starting => format!(
            "Server is starting… (started {} min ago)",
            elapsed_minutes
        ),
        EffectiveStatus::Stopping => {
            "Server is stopping — please wait before trying again.".to_string()
        }
        EffectiveStatus::RunningUnreachable => {
            "Server is unresponsive — join to attempt a restart.".to_string()
        }
        EffectiveStatus::Unknown => {
            "Error communicating with the control plane — contact an administrator.".to_string()
        }
        EffectiveStatus::RunningReachable => "Server is online!".to_string(),
    }
}

/// Build the list-ping payload.
///
/// A reachable server is represented by its own payload, unchanged.
/// Everything else gets a placeholder that echoes the client's protocol
/// version so the client does not flag it as incompatible.
pub fn compose_ping_payload(
    status: EffectiveStatus,
    elapsed_minutes: u64,
    protocol_version: i32,
    real_payload: Option<&StatusPayload>,
    presentation: &Presentation,
) -> StatusPayload {
    if status == EffectiveStatus::RunningReachable {
        if let Some(real) = real_payload {
            return real.clone();
        }
    }

    StatusPayload {
        version: VersionInfo {
            name: presentation.version_name.clone(),
            protocol: protocol_version,
        },
        players: PlayersInfo {
            max: i64::from(presentation.max_players),
            online: 0,
            sample: Vec::new(),
        },
        description: json!({ "text": status_description(status, elapsed_minutes) }),
        favicon: None,
        extra: serde_json::Map::new(),
    }
}

/// Decide which message a login handshake ends with.
///
/// Sending the start command is the caller's job; `attempt` reports how
/// that went so this mapping can stay pure.
pub fn compose_login_outcome(
    status: EffectiveStatus,
    attempt: StartAttempt,
    elapsed_minutes: u64,
    backend_address: &str,
) -> LoginOutcome {
    match status {
        EffectiveStatus::RunningReachable => {
            LoginOutcome::ConnectDirectly(backend_address.to_string())
        }
        EffectiveStatus::Offline | EffectiveStatus::RunningUnreachable => match attempt {
            StartAttempt::Triggered => LoginOutcome::StartTriggered {
                restart: status == EffectiveStatus::RunningUnreachable,
            },
            StartAttempt::Failed => LoginOutcome::Unavailable(UnavailableReason::StartFailed),
            StartAttempt::AlreadyInFlight => LoginOutcome::AlreadyStarting { elapsed_minutes },
            // A start was needed but never attempted; nothing to promise
            StartAttempt::NotNeeded => LoginOutcome::Unavailable(UnavailableReason::StartFailed),
        },
        EffectiveStatus::Starting => LoginOutcome::AlreadyStarting { elapsed_minutes },
        EffectiveStatus::Stopping => LoginOutcome::Busy(BusyReason::Stopping),
        EffectiveStatus::Unknown => LoginOutcome::Unavailable(UnavailableReason::ControlPlane),
    }
}
