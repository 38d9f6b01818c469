//! HTTP session initiation against the assistant server.
//!
//! `POST {server}/voice/initiate` with the user's bearer token returns the
//! realtime token the media transport connects with. Session durations are
//! reported to the optional usage endpoint when a stream is torn down.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{rounded_secs, BackendLink, SpeechBackend, StreamHandle};
use crate::config::BackendConfig;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const QUOTA_MESSAGE: &str = "You've used all your voice minutes for today.";
const GENERIC_MESSAGE: &str = "Could not initiate voice session.";

#[derive(Debug, Deserialize)]
struct InitiateResponse {
    rtc_token: String,
    #[serde(default)]
    ice_servers: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    detail: Option<String>,
}

/// Turn a failed initiate response into the reason shown to the user.
pub fn initiate_error_message(status: StatusCode, body: &str) -> String {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return QUOTA_MESSAGE.to_string();
    }
    serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|b| b.detail)
        .filter(|d| !d.trim().is_empty())
        .unwrap_or_else(|| GENERIC_MESSAGE.to_string())
}

pub struct HttpSpeechBackend {
    server_url: String,
    auth_token: Option<String>,
    usage_url: Option<String>,
    client: reqwest::Client,
}

impl HttpSpeechBackend {
    pub fn new(config: &BackendConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {}", e))?;
        Ok(Self {
            server_url: config.server_url.trim_end_matches('/').to_string(),
            auth_token: config.auth_token.clone(),
            usage_url: config.usage_url.clone(),
            client,
        })
    }

    fn initiate_url(&self) -> String {
        format!("{}/voice/initiate", self.server_url)
    }
}

impl SpeechBackend for HttpSpeechBackend {
    fn connect(
        &self,
        device_id: Option<String>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<BackendLink>> + Send + '_>> {
        Box::pin(async move {
            let url = self.initiate_url();
            info!(url = %url, device = ?device_id, "Initiating voice session");

            let mut request = self.client.post(&url);
            if let Some(token) = &self.auth_token {
                request = request.bearer_auth(token);
            }
            let resp = request
                .send()
                .await
                .map_err(|e| anyhow::anyhow!("Voice server unreachable: {}", e))?;

            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                warn!(%status, "Voice session initiation rejected");
                anyhow::bail!("{}", initiate_error_message(status, &body));
            }

            let body: InitiateResponse = resp
                .json()
                .await
                .map_err(|e| anyhow::anyhow!("Malformed initiate response: {}", e))?;
            debug!(ice_servers = body.ice_servers.len(), "Voice session initiated");

            Ok(BackendLink::silent(StreamHandle::new(body.rtc_token)))
        })
    }

    fn disconnect(&self, handle: StreamHandle, duration: Duration) {
        let secs = rounded_secs(duration);
        info!(secs, "Voice session closed");

        let Some(url) = self.usage_url.clone() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime available, skipping usage report");
            return;
        };

        let mut request = self
            .client
            .post(url)
            .json(&serde_json::json!({ "duration_seconds": secs }));
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }
        runtime.spawn(async move {
            match request.send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!(handle = %handle, secs, "Usage reported");
                }
                Ok(resp) => warn!(status = %resp.status(), "Usage report rejected"),
                Err(e) => warn!("Usage report failed: {}", e),
            }
        });
    }

    fn name(&self) -> String {
        format!("http ({})", self.server_url)
    }
}
