use crate::config::{env_parse, env_string};
use crate::http::build_client_with_timeout;
use crate::models::ArtifactKind;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    VideoAdCopy,
    ImageAdCopy,
    VideoGeneration,
    ImageGeneration,
}

impl Flow {
    pub fn ad_copy(kind: ArtifactKind) -> Self {
        match kind {
            ArtifactKind::Video => Flow::VideoAdCopy,
            ArtifactKind::Image => Flow::ImageAdCopy,
        }
    }

    pub fn generation(kind: ArtifactKind) -> Self {
        match kind {
            ArtifactKind::Video => Flow::VideoGeneration,
            ArtifactKind::Image => Flow::ImageGeneration,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Flow::VideoAdCopy => "video_ad_copy",
            Flow::ImageAdCopy => "image_ad_copy",
            Flow::VideoGeneration => "video_generation",
            Flow::ImageGeneration => "image_generation",
        }
    }
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub ad_copy_url: Option<String>,
    pub image_ad_copy_url: Option<String>,
    pub video_url: Option<String>,
    pub image_url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout: Duration,
}

impl WebhookConfig {
    pub fn from_env() -> Self {
        Self {
            ad_copy_url: env_string("WEBHOOK_AD_COPY_URL"),
            image_ad_copy_url: env_string("WEBHOOK_IMAGE_AD_COPY_URL"),
            video_url: env_string("WEBHOOK_VIDEO_URL"),
            image_url: env_string("WEBHOOK_IMAGE_URL"),
            username: env_string("WEBHOOK_USERNAME"),
            password: env_string("WEBHOOK_PASSWORD"),
            timeout: Duration::from_secs(
                env_parse("WEBHOOK_TIMEOUT_SECS")
                    .filter(|v: &u64| *v > 0)
                    .unwrap_or(120),
            ),
        }
    }

    fn url(&self, flow: Flow) -> Option<&str> {
        match flow {
            Flow::VideoAdCopy => self.ad_copy_url.as_deref(),
            Flow::ImageAdCopy => self
                .image_ad_copy_url
                .as_deref()
                .or(self.ad_copy_url.as_deref()),
            Flow::VideoGeneration => self.video_url.as_deref(),
            Flow::ImageGeneration => self.image_url.as_deref(),
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no webhook configured for {0}")]
    NotConfigured(&'static str),
    #[error("request failed: {0}")]
    Request(String),
    #[error("webhook answered HTTP {status}")]
    Status { status: u16, body: String },
    #[error("invalid response shape: {0}")]
    InvalidResponseShape(String),
}

/// Body posted to every workflow endpoint.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DispatchRequest {
    pub artifact_id: Uuid,
    pub product_image_id: Uuid,
    pub product_info_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_ad_copy: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AdCopyResponse {
    ad_copies: Vec<GeneratedCopy>,
}

#[derive(Debug, Deserialize)]
struct GeneratedCopy {
    text: String,
}

/// Outbound calls to the workflow engine. Each call blocks the calling action
/// until the engine answers or the configured timeout elapses.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    config: WebhookConfig,
    http: Client,
}

impl Dispatcher {
    pub fn new(config: WebhookConfig) -> Self {
        let http = build_client_with_timeout(config.timeout);
        Self { config, http }
    }

    pub fn from_env() -> Self {
        Self::new(WebhookConfig::from_env())
    }

    /// Asks the engine for candidate ad copies and returns their texts in order.
    pub async fn generate_ad_copies(
        &self,
        kind: ArtifactKind,
        request: &DispatchRequest,
    ) -> Result<Vec<String>, DispatchError> {
        let flow = Flow::ad_copy(kind);
        let response = self.post(flow, request).await?;
        let raw = response
            .text()
            .await
            .map_err(|err| DispatchError::Request(err.to_string()))?;
        let parsed: AdCopyResponse = serde_json::from_str(&raw)
            .map_err(|err| DispatchError::InvalidResponseShape(err.to_string()))?;
        let texts: Vec<String> = parsed
            .ad_copies
            .into_iter()
            .map(|copy| copy.text.trim().to_string())
            .filter(|text| !text.is_empty())
            .collect();
        if texts.is_empty() {
            return Err(DispatchError::InvalidResponseShape(
                "ad_copies is empty".into(),
            ));
        }
        Ok(texts)
    }

    /// Hands the selected copy to the engine; completion arrives later via callback.
    pub async fn start_generation(
        &self,
        kind: ArtifactKind,
        request: &DispatchRequest,
    ) -> Result<(), DispatchError> {
        self.post(Flow::generation(kind), request).await?;
        Ok(())
    }

    async fn post(&self, flow: Flow, body: &DispatchRequest) -> Result<Response, DispatchError> {
        let url = self
            .config
            .url(flow)
            .ok_or(DispatchError::NotConfigured(flow.name()))?;
        let mut request = self.http.post(url).json(body);
        if let Some(username) = &self.config.username {
            request = request.basic_auth(username, self.config.password.as_deref());
        }

        let started = Instant::now();
        let result = request.send().await;
        let elapsed = started.elapsed().as_millis();
        let response = match result {
            Ok(response) => response,
            Err(err) => {
                crate::metrics::dispatch_elapsed(flow.name(), elapsed, false);
                warn!(
                    target = "adstudio.dispatch",
                    flow = flow.name(),
                    artifact_id = %body.artifact_id,
                    timeout = err.is_timeout(),
                    error = %err,
                    "webhook_request_failed"
                );
                return Err(DispatchError::Request(err.to_string()));
            }
        };

        let status = response.status();
        crate::metrics::dispatch_elapsed(flow.name(), elapsed, status.is_success());
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            warn!(
                target = "adstudio.dispatch",
                flow = flow.name(),
                artifact_id = %body.artifact_id,
                status = status.as_u16(),
                body = %body_text,
                "webhook_rejected"
            );
            return Err(DispatchError::Status {
                status: status.as_u16(),
                body: body_text,
            });
        }
        info!(
            target = "adstudio.dispatch",
            flow = flow.name(),
            artifact_id = %body.artifact_id,
            elapsed_ms = elapsed as u64,
            "webhook_accepted"
        );
        Ok(response)
    }
}
