//! Direct liveness probe against the game server
//!
//! The control plane can report a server as running while the process is
//! hung, crashed, or still finishing its boot. A list-ping against the
//! server itself tells those cases apart from a server that is really
//! serving.

use crate::config::BackendConfig;
use crate::protocol;
use crate::status::StatusPayload;
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Result of a liveness probe
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    /// The server answered. Carries its own status payload when the reply
    /// could be read as one.
    Reachable(Option<StatusPayload>),
    /// No valid answer within the timeout, for whatever reason
    Unreachable,
}

#[async_trait]
pub trait LivenessProbe: Send + Sync {
    /// Probe the backend. Must return within the probe's own timeout.
    async fn probe(&self) -> ProbeOutcome;
}

/// Probe that performs a full list-ping over TCP
pub struct ListPingProbe {
    host: String,
    port: u16,
    timeout: Duration,
}

impl ListPingProbe {
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            timeout,
        }
    }

    pub fn from_config(config: &BackendConfig) -> Self {
        Self::new(config.host.clone(), config.port, config.probe_timeout())
    }
}

#[async_trait]
impl LivenessProbe for ListPingProbe {
    async fn probe(&self) -> ProbeOutcome {
        let addr = format!("{}:{}", self.host, self.port);

        // Connect and exchange share one deadline
        let result = tokio::time::timeout(self.timeout, async {
            let mut stream = TcpStream::connect(&addr).await?;
            stream.set_nodelay(true)?;
            protocol::query_status(&mut stream, &self.host, self.port).await
        })
        .await;

        match result {
            Ok(Ok(json)) => {
                debug!(addr = %addr, "Liveness probe passed");
                match serde_json::from_value::<StatusPayload>(json) {
                    Ok(payload) => ProbeOutcome::Reachable(Some(payload)),
                    Err(e) => {
                        debug!(addr = %addr, error = %e, "Status reply is not a status payload");
                        ProbeOutcome::Reachable(None)
                    }
                }
            }
            Ok(Err(e)) => {
                debug!(addr = %addr, error = %e, "Liveness probe failed");
                ProbeOutcome::Unreachable
            }
            Err(_) => {
                debug!(
                    addr = %addr,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Liveness probe timed out"
                );
                ProbeOutcome::Unreachable
            }
        }
    }
}
