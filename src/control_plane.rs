//! Control plane client
//!
//! The control plane is the authority on whether the game server is
//! running, and the only way to start it. It is reached over a
//! Pterodactyl-style client API:
//!
//! - `GET /api/client/servers/{id}/resources` → `attributes.current_state`
//! - `POST /api/client/servers/{id}/power` with `{"signal": "start"}`

use crate::config::ControlPlaneConfig;
use crate::error::ControlPlaneError;
use crate::status::LifecycleState;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, error, info};

/// Longest response body excerpt kept in errors and logs
const MAX_ERROR_BODY_LEN: usize = 512;

/// Access to the control plane managing the game server
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Current lifecycle state. Never fails: transport, authentication and
    /// decoding problems all report [`LifecycleState::Unknown`]. One attempt,
    /// no retries.
    async fn lifecycle_state(&self) -> LifecycleState;

    /// Ask the control plane to start the server. One attempt, no retries.
    async fn send_start(&self) -> Result<(), ControlPlaneError>;
}

#[derive(Debug, Deserialize)]
struct ResourcesResponse {
    attributes: ResourceAttributes,
}

#[derive(Debug, Deserialize)]
struct ResourceAttributes {
    current_state: String,
}

/// HTTP client for a Pterodactyl-compatible panel
pub struct PterodactylClient {
    http_client: reqwest::Client,
    base_url: String,
    api_key: String,
    server_id: String,
}

impl PterodactylClient {
    pub fn new(config: &ControlPlaneConfig) -> Result<Self, ControlPlaneError> {
        let http_client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            http_client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            server_id: config.server_id.clone(),
        })
    }

    fn resources_url(&self) -> String {
        format!(
            "{}/api/client/servers/{}/resources",
            self.base_url, self.server_id
        )
    }

    fn power_url(&self) -> String {
        format!("{}/api/client/servers/{}/power", self.base_url, self.server_id)
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        self.http_client
            .request(method, url)
            .bearer_auth(&self.api_key)
            .header(reqwest::header::ACCEPT, "application/json")
            .header(reqwest::header::CONTENT_TYPE, "application/json")
    }

    /// Fetch the raw state, surfacing every failure
    pub async fn fetch_state(&self) -> Result<LifecycleState, ControlPlaneError> {
        let response = self
            .request(reqwest::Method::GET, self.resources_url())
            .send()
            .await?;
        let response = check_status(response).await?;

        let body = response.text().await?;
        let parsed: ResourcesResponse = serde_json::from_str(&body)
            .map_err(|e| ControlPlaneError::Decode(e.to_string()))?;

        let state = LifecycleState::from_api(&parsed.attributes.current_state);
        if state == LifecycleState::Unknown {
            debug!(
                current_state = %parsed.attributes.current_state,
                "Unrecognized lifecycle state from control plane"
            );
        }
        Ok(state)
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ControlPlaneError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let mut body = response.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY_LEN {
        let mut cut = MAX_ERROR_BODY_LEN;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    Err(ControlPlaneError::Status {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl ControlPlane for PterodactylClient {
    async fn lifecycle_state(&self) -> LifecycleState {
        match self.fetch_state().await {
            Ok(state) => state,
            Err(e) => {
                error!(error = %e, "Failed to fetch server status from control plane");
                LifecycleState::Unknown
            }
        }
    }

    async fn send_start(&self) -> Result<(), ControlPlaneError> {
        let response = self
            .request(reqwest::Method::POST, self.power_url())
            .json(&serde_json::json!({ "signal": "start" }))
            .send()
            .await?;

        match check_status(response).await {
            Ok(_) => {
                info!(server_id = %self.server_id, "Start command accepted by control plane");
                Ok(())
            }
            Err(e) => {
                error!(server_id = %self.server_id, error = %e, "Start command rejected by control plane");
                Err(e)
            }
        }
    }
}
