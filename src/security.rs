use crate::models::ApiError;
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{self, Request, StatusCode, header::HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use std::{collections::HashMap, convert::Infallible, env, sync::Arc, time::Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub const SIGNATURE_HEADER: &str = "X-Signature";

#[derive(Clone)]
pub struct AuthState {
    sessions: Arc<HashMap<String, SessionRecord>>,
    limiter: Arc<TokenBuckets>,
}

/// Identity of the caller, inserted into request extensions by
/// [`require_session`].
#[derive(Clone, Debug)]
pub struct AuthContext {
    pub user_id: String,
    pub session_id: String,
}

#[derive(Clone)]
struct SessionRecord {
    user_id: String,
    session_id: String,
}

impl AuthState {
    pub fn from_env() -> Self {
        let raw = env::var("SESSION_KEYS").unwrap_or_else(|_| "demo-user:demo-token".to_string());
        Self::from_pairs(&raw, TokenBuckets::from_env())
    }

    fn from_pairs(raw: &str, limiter: TokenBuckets) -> Self {
        Self {
            sessions: Arc::new(load_sessions(raw)),
            limiter: Arc::new(limiter),
        }
    }

    fn authenticate(&self, presented: &str) -> Option<AuthContext> {
        self.sessions.get(presented).map(|record| AuthContext {
            user_id: record.user_id.clone(),
            session_id: record.session_id.clone(),
        })
    }

    async fn consume(&self, user_id: &str) -> Result<RatePermit, RateExceeded> {
        self.limiter.consume(user_id).await
    }
}

pub async fn require_session(
    State(state): State<AuthState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    let Some(presented) = extract_session_token(request.headers()) else {
        return Ok(unauthorized_response());
    };

    let Some(context) = state.authenticate(&presented) else {
        warn!(target = "adstudio.api", "unknown session token presented");
        return Ok(unauthorized_response());
    };

    match state.consume(&context.user_id).await {
        Ok(permit) => {
            request.extensions_mut().insert(context);
            let mut response = next.run(request).await;
            permit.apply_headers(response.headers_mut());
            Ok(response)
        }
        Err(exceeded) => {
            let mut response = too_many_requests();
            exceeded.apply_headers(response.headers_mut());
            Ok(response)
        }
    }
}

fn extract_session_token(headers: &http::HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(http::header::AUTHORIZATION)
        && let Ok(raw) = value.to_str()
        && raw.len() >= 7
        && raw[..6].eq_ignore_ascii_case("bearer")
    {
        return Some(raw[6..].trim().to_string());
    }
    headers
        .get("X-Session-Token")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn unauthorized_response() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(ApiError::new("로그인이 필요합니다.")),
    )
        .into_response()
}

fn too_many_requests() -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        Json(ApiError::new(
            "요청이 너무 많습니다. 잠시 후 다시 시도해주세요.",
        )),
    )
        .into_response()
}

fn load_sessions(raw: &str) -> HashMap<String, SessionRecord> {
    let mut entries = HashMap::new();
    for (idx, token) in raw.split(',').enumerate() {
        let trimmed = token.trim();
        if trimmed.is_empty() {
            continue;
        }
        let mut parts = trimmed.splitn(2, ':');
        let user_id = parts.next().map(str::trim).filter(|s| !s.is_empty());
        let secret = parts.next().map(str::trim).filter(|s| !s.is_empty());
        match (user_id, secret) {
            (Some(user), Some(secret)) => {
                let record = SessionRecord {
                    user_id: user.to_string(),
                    session_id: format!("session-{:02}", idx + 1),
                };
                entries.insert(secret.to_string(), record);
            }
            _ => warn!(
                target = "adstudio.api",
                "ignored malformed SESSION_KEYS entry: {trimmed}"
            ),
        }
    }

    if entries.is_empty() {
        warn!(
            target = "adstudio.api",
            "SESSION_KEYS produced no sessions; falling back to demo credentials"
        );
        entries.insert(
            "demo-token".to_string(),
            SessionRecord {
                user_id: "demo-user".to_string(),
                session_id: "session-01".to_string(),
            },
        );
    } else {
        info!(
            target = "adstudio.api",
            session_count = entries.len(),
            "loaded sessions from env"
        );
    }

    entries
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("callback secret is not configured")]
    NotConfigured,
    #[error("signature header missing")]
    Missing,
    #[error("signature does not match")]
    Mismatch,
}

/// HMAC-SHA256 over the raw callback body, base64 encoded in `X-Signature`.
#[derive(Clone)]
pub struct CallbackVerifier {
    secret: Option<Arc<Vec<u8>>>,
}

impl CallbackVerifier {
    pub fn new(secret: Option<&str>) -> Self {
        Self {
            secret: secret
                .filter(|s| !s.is_empty())
                .map(|s| Arc::new(s.as_bytes().to_vec())),
        }
    }

    pub fn from_env() -> Self {
        let verifier = Self::new(env::var("CALLBACK_SECRET").ok().as_deref());
        if verifier.secret.is_none() {
            warn!(
                target = "adstudio.api",
                "CALLBACK_SECRET not set; completion callbacks will be rejected"
            );
        }
        verifier
    }

    fn mac(&self) -> Result<Hmac<Sha256>, SignatureError> {
        let secret = self.secret.as_ref().ok_or(SignatureError::NotConfigured)?;
        Hmac::<Sha256>::new_from_slice(secret).map_err(|_| SignatureError::NotConfigured)
    }

    pub fn sign(&self, body: &[u8]) -> Result<String, SignatureError> {
        let mut mac = self.mac()?;
        mac.update(body);
        Ok(STANDARD.encode(mac.finalize().into_bytes()))
    }

    pub fn verify(&self, headers: &http::HeaderMap, body: &[u8]) -> Result<(), SignatureError> {
        let mut mac = self.mac()?;
        let presented = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or(SignatureError::Missing)?;
        let presented = presented.strip_prefix("sha256=").unwrap_or(presented);
        let decoded = STANDARD
            .decode(presented)
            .map_err(|_| SignatureError::Mismatch)?;
        mac.update(body);
        mac.verify_slice(&decoded)
            .map_err(|_| SignatureError::Mismatch)
    }
}

#[derive(Clone)]
struct TokenBuckets {
    rate_per_sec: f64,
    capacity: f64,
    buckets: Arc<Mutex<HashMap<String, BucketState>>>,
}

impl TokenBuckets {
    fn from_env() -> Self {
        let rate_per_sec = env::var("RATE_LIMIT_PER_SEC")
            .ok()
            .and_then(|value| value.parse::<f64>().ok())
            .filter(|value| *value > 0.0)
            .unwrap_or(5.0);
        let capacity = env::var("RATE_LIMIT_CAPACITY")
            .ok()
            .and_then(|value| value.parse::<f64>().ok())
            .filter(|value| *value >= 1.0)
            .unwrap_or(10.0);
        Self::new(rate_per_sec, capacity)
    }

    fn new(rate_per_sec: f64, capacity: f64) -> Self {
        Self {
            rate_per_sec,
            capacity,
            buckets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn consume(&self, key: &str) -> Result<RatePermit, RateExceeded> {
        let mut guard = self.buckets.lock().await;
        let now = Instant::now();
        let state = guard.entry(key.to_string()).or_insert_with(|| BucketState {
            tokens: self.capacity,
            last_refill: now,
        });

        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.capacity);
            state.last_refill = now;
        }

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(RatePermit {
                capacity: self.capacity,
                tokens: state.tokens,
                rate: self.rate_per_sec,
            })
        } else {
            let deficit = 1.0 - state.tokens;
            Err(RateExceeded {
                retry_after: (deficit / self.rate_per_sec).max(0.0),
                capacity: self.capacity,
                tokens: state.tokens,
                rate: self.rate_per_sec,
            })
        }
    }
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct RatePermit {
    capacity: f64,
    tokens: f64,
    rate: f64,
}

fn header_number(value: u64) -> HeaderValue {
    HeaderValue::from_str(&value.to_string()).unwrap_or_else(|_| HeaderValue::from_static("0"))
}

impl RatePermit {
    fn apply_headers(&self, headers: &mut http::HeaderMap) {
        let remaining = self.tokens.max(0.0).floor() as u64;
        let reset = ((self.capacity - self.tokens) / self.rate).ceil().max(0.0) as u64;
        headers.insert("X-RateLimit-Limit", header_number(self.capacity as u64));
        headers.insert("X-RateLimit-Remaining", header_number(remaining));
        headers.insert("X-RateLimit-Reset", header_number(reset));
    }
}

#[derive(Debug, Clone)]
pub struct RateExceeded {
    retry_after: f64,
    capacity: f64,
    tokens: f64,
    rate: f64,
}

impl RateExceeded {
    fn apply_headers(&self, headers: &mut http::HeaderMap) {
        let retry = self.retry_after.ceil().max(1.0) as u64;
        headers.insert(http::header::RETRY_AFTER, header_number(retry));
        headers.insert("X-RateLimit-Limit", header_number(self.capacity as u64));
        headers.insert("X-RateLimit-Remaining", HeaderValue::from_static("0"));
        let reset = ((self.capacity - self.tokens) / self.rate).ceil().max(0.0) as u64;
        headers.insert("X-RateLimit-Reset", header_number(reset));
    }
}

#[cfg(test)]
pub(crate) fn test_auth_state(pairs: &str) -> AuthState {
    AuthState::from_pairs(pairs, TokenBuckets::new(100.0, 100.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_and_session_header_are_both_accepted() {
        let mut headers = http::HeaderMap::new();
        headers.insert(http::header::AUTHORIZATION, HeaderValue::from_static("Bearer tok-1"));
        assert_eq!(extract_session_token(&headers).as_deref(), Some("tok-1"));

        let mut headers = http::HeaderMap::new();
        headers.insert("X-Session-Token", HeaderValue::from_static(" tok-2 "));
        assert_eq!(extract_session_token(&headers).as_deref(), Some("tok-2"));

        assert_eq!(extract_session_token(&http::HeaderMap::new()), None);
    }

    #[test]
    fn malformed_session_pairs_fall_back_to_demo() {
        let state = AuthState::from_pairs("nonsense,:x", TokenBuckets::new(1.0, 1.0));
        let ctx = state.authenticate("demo-token").expect("demo session");
        assert_eq!(ctx.user_id, "demo-user");

        let state = AuthState::from_pairs("alice:a-token, bob:b-token", TokenBuckets::new(1.0, 1.0));
        assert_eq!(state.authenticate("b-token").unwrap().user_id, "bob");
        assert!(state.authenticate("demo-token").is_none());
    }

    #[tokio::test]
    async fn bucket_refuses_once_empty() {
        let buckets = TokenBuckets::new(0.001, 2.0);
        assert!(buckets.consume("user_1").await.is_ok());
        assert!(buckets.consume("user_1").await.is_ok());
        let exceeded = buckets.consume("user_1").await.expect_err("empty");
        assert!(exceeded.retry_after > 0.0);
        assert!(buckets.consume("user_2").await.is_ok());
    }

    #[test]
    fn callback_signature_round_trip() {
        let verifier = CallbackVerifier::new(Some("cb-secret"));
        let body = br#"{"status":"completed","output_url":"u"}"#;
        let signature = verifier.sign(body).unwrap();

        let mut headers = http::HeaderMap::new();
        headers.insert(SIGNATURE_HEADER, HeaderValue::from_str(&signature).unwrap());
        assert_eq!(verifier.verify(&headers, body), Ok(()));
        assert_eq!(
            verifier.verify(&headers, br#"{"status":"failed"}"#),
            Err(SignatureError::Mismatch)
        );
        assert_eq!(
            verifier.verify(&http::HeaderMap::new(), body),
            Err(SignatureError::Missing)
        );
        assert_eq!(
            CallbackVerifier::new(None).verify(&headers, body),
            Err(SignatureError::NotConfigured)
        );
    }
}
