//! Status types shared by the oracle, the probe and the composer

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle state as reported by the control plane
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Offline,
    Starting,
    Stopping,
    Running,
    /// Unrecognized value, or the control plane could not be asked
    Unknown,
}

impl LifecycleState {
    /// Parse the control plane's `current_state` field
    pub fn from_api(value: &str) -> Self {
        match value {
            "offline" => Self::Offline,
            "starting" => Self::Starting,
            "stopping" => Self::Stopping,
            "running" => Self::Running,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Offline => "offline",
            Self::Starting => "starting",
            Self::Stopping => "stopping",
            Self::Running => "running",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state reconciled with the liveness probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectiveStatus {
    /// Running and answering list-pings
    RunningReachable,
    /// Running according to the control plane, but not answering
    RunningUnreachable,
    Starting,
    Stopping,
    Offline,
    Unknown,
}

impl EffectiveStatus {
    /// Reconcile a lifecycle state with the liveness probe result.
    /// `reachable` is only consulted when the state is `Running`.
    pub fn from_lifecycle(state: LifecycleState, reachable: bool) -> Self {
        match state {
            LifecycleState::Running if reachable => Self::RunningReachable,
            LifecycleState::Running => Self::RunningUnreachable,
            LifecycleState::Starting => Self::Starting,
            LifecycleState::Stopping => Self::Stopping,
            LifecycleState::Offline => Self::Offline,
            LifecycleState::Unknown => Self::Unknown,
        }
    }

    /// Whether a login in this state should ask the control plane to start
    /// the server
    pub fn needs_start(&self) -> bool {
        matches!(self, Self::Offline | Self::RunningUnreachable)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunningReachable => "running",
            Self::RunningUnreachable => "unresponsive",
            Self::Starting => "starting",
            Self::Stopping => "stopping",
            Self::Offline => "offline",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for EffectiveStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// List-ping status payload, as sent to clients and read from the backend.
///
/// Parsing is lenient: servers and proxies in the wild omit or trim
/// fields, and a missing field should not make a live server look dead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusPayload {
    #[serde(default)]
    pub version: VersionInfo,
    #[serde(default)]
    pub players: PlayersInfo,
    /// Plain string or chat component; backends use both forms
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub description: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub favicon: Option<String>,
    /// Fields this gateway does not interpret (mod info, secure chat flags)
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VersionInfo {
    pub name: String,
    pub protocol: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayersInfo {
    pub max: i64,
    pub online: i64,
    pub sample: Vec<PlayerSample>,
}

/// Hover-list entry. Servers often put MOTD lines here without an id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerSample {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl StatusPayload {
    /// Plain text of the description, whichever form it was sent in
    pub fn description_text(&self) -> Option<&str> {
        match &self.description {
            Value::String(text) => Some(text),
            Value::Object(map) => map.get("text").and_then(Value::as_str),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
