//! Shared fixtures for in-module tests: a scripted workflow engine served over
//! real HTTP, and seeded stores.

use crate::dispatch::WebhookConfig;
use crate::models::{Role, User};
use crate::store::{MemoryStore, Store};
use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{net::TcpListener, sync::Mutex};

#[derive(Debug, Clone)]
pub enum Reply {
    /// `{ "ad_copies": [...] }` with this many candidates.
    Copies(usize),
    Status(u16, &'static str),
    Json(Value),
    Accepted,
}

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub path: String,
    pub body: Value,
    pub authorization: Option<String>,
}

#[derive(Clone, Default)]
struct EngineState {
    replies: Arc<Mutex<HashMap<String, Reply>>>,
    calls: Arc<Mutex<Vec<RecordedCall>>>,
}

pub struct FakeEngine {
    pub base_url: String,
    state: EngineState,
}

impl FakeEngine {
    pub async fn start() -> Self {
        let state = EngineState::default();
        let app = Router::new()
            .fallback(handle_webhook)
            .with_state(state.clone());
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake engine");
        let addr = listener.local_addr().expect("fake engine addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self {
            base_url: format!("http://{addr}"),
            state,
        }
    }

    pub async fn reply(&self, path: &str, reply: Reply) {
        self.state
            .replies
            .lock()
            .await
            .insert(path.to_string(), reply);
    }

    pub async fn calls(&self) -> Vec<RecordedCall> {
        self.state.calls.lock().await.clone()
    }

    pub async fn call_count(&self, path: &str) -> usize {
        self.state
            .calls
            .lock()
            .await
            .iter()
            .filter(|call| call.path == path)
            .count()
    }

    pub fn webhook_config(&self) -> WebhookConfig {
        WebhookConfig {
            ad_copy_url: Some(format!("{}/ad-copy", self.base_url)),
            image_ad_copy_url: Some(format!("{}/image-ad-copy", self.base_url)),
            video_url: Some(format!("{}/video", self.base_url)),
            image_url: Some(format!("{}/image", self.base_url)),
            username: Some("workflow".into()),
            password: Some("secret".into()),
            timeout: Duration::from_secs(5),
        }
    }
}

async fn handle_webhook(
    State(state): State<EngineState>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri.path().to_string();
    let body: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    let authorization = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    state.calls.lock().await.push(RecordedCall {
        path: path.clone(),
        body,
        authorization,
    });
    let reply = state
        .replies
        .lock()
        .await
        .get(&path)
        .cloned()
        .unwrap_or(Reply::Accepted);
    match reply {
        Reply::Copies(count) => {
            let copies: Vec<Value> = (1..=count)
                .map(|idx| json!({ "id": idx, "text": format!("candidate {idx}") }))
                .collect();
            Json(json!({ "ad_copies": copies })).into_response()
        }
        Reply::Status(code, text) => (
            StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            text,
        )
            .into_response(),
        Reply::Json(value) => Json(value).into_response(),
        Reply::Accepted => Json(json!({ "accepted": true })).into_response(),
    }
}

pub async fn seed_user(store: &MemoryStore, id: &str, balance: i64, role: Role) -> User {
    store
        .insert_user_if_absent(&User::new(id, None))
        .await
        .expect("seed user");
    store.set_balance(id, balance).await;
    store.set_role(id, role).await;
    store
        .get_user(id)
        .await
        .expect("read user")
        .expect("seeded user")
}
