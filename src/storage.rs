//! Object storage for product photos and generated outputs. Objects live under
//! `<user_id>/...` in a single bucket.

use crate::config::{STORAGE_BUCKET, env_parse};
use crate::http::build_client;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};
use urlencoding::encode;

const LIST_PAGE_SIZE: usize = 1000;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object storage is not configured")]
    NotConfigured,
    #[error("path `{0}` is outside the caller's namespace")]
    OutsideNamespace(String),
    #[error("request failed: {0}")]
    Request(String),
    #[error("storage answered HTTP {status}: {body}")]
    Status { status: u16, body: String },
}

/// True when `path` names an object inside `user_id`'s folder.
pub fn in_user_namespace(user_id: &str, path: &str) -> bool {
    let Some(rest) = path.strip_prefix(user_id).and_then(|r| r.strip_prefix('/')) else {
        return false;
    };
    !user_id.is_empty()
        && !rest.is_empty()
        && rest
            .split('/')
            .all(|segment| !segment.is_empty() && segment != "." && segment != "..")
}

#[derive(Debug, Deserialize)]
struct SignedUrl {
    #[serde(rename = "signedURL", alias = "signedUrl")]
    signed_url: String,
}

#[derive(Debug, Deserialize)]
struct ListedObject {
    name: String,
    #[serde(default)]
    id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Storage {
    base_url: Option<String>,
    service_key: String,
    bucket: String,
    signed_url_ttl: Duration,
    http: Client,
}

impl Storage {
    pub fn new(base_url: &str, service_key: &str, bucket: &str) -> Self {
        Self {
            base_url: Some(base_url.trim_end_matches('/').to_string()),
            service_key: service_key.to_string(),
            bucket: bucket.to_string(),
            signed_url_ttl: Duration::from_secs(
                env_parse("SIGNED_URL_TTL_SECS")
                    .filter(|v: &u64| *v > 0)
                    .unwrap_or(3600),
            ),
            http: build_client(),
        }
    }

    /// Storage without a backend. Every call fails with `NotConfigured`.
    pub fn disabled() -> Self {
        Self {
            base_url: None,
            service_key: String::new(),
            bucket: STORAGE_BUCKET.clone(),
            signed_url_ttl: Duration::from_secs(3600),
            http: build_client(),
        }
    }

    pub fn from_env() -> Self {
        let base_url = std::env::var("SUPABASE_URL").ok();
        let service_key = std::env::var("SUPABASE_SERVICE_ROLE_KEY")
            .or_else(|_| std::env::var("SUPABASE_SERVICE_KEY"))
            .ok();
        match (base_url, service_key) {
            (Some(url), Some(key)) => Self::new(&url, &key, &STORAGE_BUCKET),
            _ => Self::disabled(),
        }
    }

    pub fn signed_url_ttl(&self) -> Duration {
        self.signed_url_ttl
    }

    fn base(&self) -> Result<&str, StorageError> {
        self.base_url.as_deref().ok_or(StorageError::NotConfigured)
    }

    fn object_path(path: &str) -> String {
        path.split('/').map(|s| encode(s).into_owned()).collect::<Vec<_>>().join("/")
    }

    async fn post(&self, url: String, body: serde_json::Value) -> Result<reqwest::Response, StorageError> {
        let response = self
            .http
            .post(url)
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
            .json(&body)
            .send()
            .await
            .map_err(|err| StorageError::Request(err.to_string()))?;
        check(response).await
    }

    /// Time-limited download link for `path`. Absolute URLs are returned as-is;
    /// the workflow engine sometimes reports outputs hosted elsewhere.
    pub async fn download_url(&self, path: &str) -> Result<String, StorageError> {
        if path.starts_with("https://") || path.starts_with("http://") {
            return Ok(path.to_string());
        }
        let base = self.base()?;
        let url = format!(
            "{base}/storage/v1/object/sign/{}/{}",
            self.bucket,
            Self::object_path(path.trim_start_matches('/'))
        );
        let response = self
            .post(url, json!({ "expiresIn": self.signed_url_ttl.as_secs() }))
            .await?;
        let signed: SignedUrl = response
            .json()
            .await
            .map_err(|err| StorageError::Request(err.to_string()))?;
        Ok(format!("{base}/storage/v1{}", signed.signed_url))
    }

    /// Removes every object under `<user_id>/`, descending into folders.
    pub async fn remove_user_objects(&self, user_id: &str) -> Result<usize, StorageError> {
        if user_id.is_empty() {
            return Err(StorageError::OutsideNamespace(String::new()));
        }
        let base = self.base()?.to_string();
        let mut pending = vec![user_id.to_string()];
        let mut files = Vec::new();
        while let Some(prefix) = pending.pop() {
            let mut offset = 0;
            loop {
                let response = self
                    .post(
                        format!("{base}/storage/v1/object/list/{}", self.bucket),
                        json!({ "prefix": prefix, "limit": LIST_PAGE_SIZE, "offset": offset }),
                    )
                    .await?;
                let objects: Vec<ListedObject> = response
                    .json()
                    .await
                    .map_err(|err| StorageError::Request(err.to_string()))?;
                let listed = objects.len();
                for object in objects {
                    let full = format!("{prefix}/{}", object.name);
                    // Folders come back without an id.
                    if object.id.is_some() {
                        files.push(full);
                    } else {
                        pending.push(full);
                    }
                }
                if listed < LIST_PAGE_SIZE {
                    break;
                }
                offset += listed;
            }
        }
        if files.is_empty() {
            return Ok(0);
        }

        for batch in files.chunks(LIST_PAGE_SIZE) {
            let response = self
                .http
                .delete(format!("{base}/storage/v1/object/{}", self.bucket))
                .header("apikey", &self.service_key)
                .header("Authorization", format!("Bearer {}", self.service_key))
                .json(&json!({ "prefixes": batch }))
                .send()
                .await
                .map_err(|err| StorageError::Request(err.to_string()))?;
            check(response).await?;
        }
        info!(
            target = "adstudio.storage",
            user_id = %user_id,
            removed = files.len(),
            "user_objects_removed"
        );
        Ok(files.len())
    }
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response, StorageError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    warn!(
        target = "adstudio.storage",
        status = status.as_u16(),
        body = %body,
        "storage_request_failed"
    );
    Err(StorageError::Status {
        status: status.as_u16(),
        body,
    })
}
