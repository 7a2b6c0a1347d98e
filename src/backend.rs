//! ==============================================================================
//! backend.rs - garden REST api client
//! ==============================================================================
//!
//! purpose:
//!     everything the live view needs from the garden backend, behind the
//!     GardenApi trait so the view can be driven by a scripted backend in
//!     tests.
//!
//! endpoints (relative to backend.base_url):
//!     GET  /gardens
//!     GET  /gardens/{id}/sensors/latest
//!     GET  /gardens/{id}/devices
//!     GET  /gardens/{id}/sensors/history?limit=N     newest-first
//!     POST /gardens/{id}/devices/control             { device, state }
//!     POST /gardens/{id}/devices/auto-mode           { auto_mode }
//!     GET  /gardens/{id}/analysis/latest
//!
//! errors:
//!     transport failures and non-2xx answers both come back as
//!     LiveError::Backend carrying a short, user-readable reason.
//!
//! ==============================================================================

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::time::Duration;

use crate::config::BackendConfig;
use crate::domain::{CommandKey, DeviceStateSet, GardenRef, SensorSnapshot};
use crate::error::{LiveError, LiveResult};

#[async_trait]
pub trait GardenApi: Send + Sync {
    async fn list_gardens(&self) -> LiveResult<Vec<GardenRef>>;
    async fn latest_sensor(&self, garden_id: &str) -> LiveResult<SensorSnapshot>;
    async fn device_states(&self, garden_id: &str) -> LiveResult<DeviceStateSet>;
    async fn sensor_history(&self, garden_id: &str, limit: usize) -> LiveResult<Vec<SensorSnapshot>>;
    async fn control_device(&self, garden_id: &str, device: CommandKey, state: bool) -> LiveResult<()>;
    async fn set_auto_mode(&self, garden_id: &str, enabled: bool) -> LiveResult<()>;
    async fn latest_analysis(&self, garden_id: &str) -> LiveResult<serde_json::Value>;
}

pub struct HttpBackend {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpBackend {
    pub fn new(config: &BackendConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone().filter(|t| !t.is_empty()),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> LiveResult<Response> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| LiveError::Backend(transport_reason(&e)))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        // prefer the backend's own message when it sends one
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v.get("message").or_else(|| v.get("error")).cloned())
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
        Err(LiveError::Backend(message))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> LiveResult<T> {
        let response = self.send(self.client.get(self.url(path))).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| LiveError::Backend(format!("unexpected response from {}: {}", path, e)))
    }
}

fn transport_reason(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        "request timed out".to_string()
    } else if e.is_connect() {
        "backend unreachable".to_string()
    } else {
        e.to_string()
    }
}

#[async_trait]
impl GardenApi for HttpBackend {
    async fn list_gardens(&self) -> LiveResult<Vec<GardenRef>> {
        self.get_json("/gardens").await
    }

    async fn latest_sensor(&self, garden_id: &str) -> LiveResult<SensorSnapshot> {
        self.get_json(&format!("/gardens/{}/sensors/latest", garden_id)).await
    }

    async fn device_states(&self, garden_id: &str) -> LiveResult<DeviceStateSet> {
        self.get_json(&format!("/gardens/{}/devices", garden_id)).await
    }

    async fn sensor_history(&self, garden_id: &str, limit: usize) -> LiveResult<Vec<SensorSnapshot>> {
        self.get_json(&format!("/gardens/{}/sensors/history?limit={}", garden_id, limit))
            .await
    }

    async fn control_device(&self, garden_id: &str, device: CommandKey, state: bool) -> LiveResult<()> {
        let request = self
            .client
            .post(self.url(&format!("/gardens/{}/devices/control", garden_id)))
            .json(&json!({ "device": device.as_wire(), "state": state }));
        self.send(request).await.map(|_| ())
    }

    async fn set_auto_mode(&self, garden_id: &str, enabled: bool) -> LiveResult<()> {
        let request = self
            .client
            .post(self.url(&format!("/gardens/{}/devices/auto-mode", garden_id)))
            .json(&json!({ "auto_mode": enabled }));
        self.send(request).await.map(|_| ())
    }

    async fn latest_analysis(&self, garden_id: &str) -> LiveResult<serde_json::Value> {
        self.get_json(&format!("/gardens/{}/analysis/latest", garden_id)).await
    }
}
