mod account;
mod admin;
mod config;
mod dispatch;
mod error;
mod http;
mod idempotency;
mod ledger;
mod metrics;
mod models;
mod observer;
mod payments;
mod saga;
mod security;
mod stage;
mod storage;
mod store;
#[cfg(test)]
mod testing;

use account::{Accounts, SyncRequest};
use admin::{Admin, GrantRequest};
use axum::{
    Json, Router,
    body::Bytes,
    extract::{Extension, Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    middleware,
    response::{
        Html, IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use config::{CreditCosts, RefundPolicy};
use dispatch::Dispatcher;
use error::{ActionError, ActionErrorKind};
use eyre::eyre;
use idempotency::{IdempotencyCache, idempotency_key};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{ActionResponse, ApiError, ArtifactKind, ArtifactStatus, Page};
use observer::ArtifactWatcher;
use payments::{ConfirmRequest, PaymentGateway, Payments};
use saga::{CompletionReport, NewArtifact, Orchestrator, SagaContext, SelectRequest};
use security::{AuthContext, AuthState, CallbackVerifier, SignatureError, require_session};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Value, json};
use stage::{ImageStage, Stage, VideoStage};
use std::{convert::Infallible, net::SocketAddr, sync::Arc};
use storage::Storage;
use store::{MemoryStore, Store, SupabaseStore};
use tokio_stream::{Stream, StreamExt, wrappers::ReceiverStream};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};
use uuid::Uuid;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    if let Err(err) = run().await {
        error!(target = "adstudio.api", "server crashed: {err}");
        return Err(err);
    }
    Ok(())
}

async fn run() -> eyre::Result<()> {
    let store: Arc<dyn Store> = match SupabaseStore::from_env() {
        Some(store) => Arc::new(store),
        None => {
            warn!(
                target = "adstudio.api",
                "SUPABASE_URL not set; using the in-memory store"
            );
            Arc::new(MemoryStore::with_default_tiers())
        }
    };
    let storage = Storage::from_env();
    let saga = SagaContext::new(store.clone(), Dispatcher::from_env(), storage.clone())
        .with_costs(CreditCosts::from_env())
        .with_refund_policy(RefundPolicy::from_env());
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|err| eyre!("prometheus recorder: {err}"))?;

    let state = AppState::new(
        store,
        storage,
        saga,
        PaymentGateway::from_env(),
        CallbackVerifier::from_env(),
        IdempotencyCache::from_env(),
        prometheus_handle,
    );
    let app = router(state, AuthState::from_env());

    let port: u16 = config::env_parse("PORT").unwrap_or(8000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "adstudio.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    fmt().with_env_filter(filter).with_target(true).init();
}

#[derive(Clone)]
struct AppState {
    saga: SagaContext,
    watcher: ArtifactWatcher,
    payments: Payments,
    accounts: Accounts,
    admin: Admin,
    callbacks: CallbackVerifier,
    idempotency: IdempotencyCache,
    openapi: Arc<Value>,
    prometheus_handle: PrometheusHandle,
}

impl AppState {
    fn new(
        store: Arc<dyn Store>,
        storage: Storage,
        saga: SagaContext,
        gateway: PaymentGateway,
        callbacks: CallbackVerifier,
        idempotency: IdempotencyCache,
        prometheus_handle: PrometheusHandle,
    ) -> Self {
        let openapi: Value = serde_yaml::from_str(include_str!("../docs/openapi.yaml"))
            .unwrap_or(json!({ "openapi": "3.0.3" }));
        Self {
            watcher: ArtifactWatcher::new(store.clone()),
            payments: Payments::new(store.clone(), gateway),
            accounts: Accounts::new(store.clone(), storage),
            admin: Admin::new(store),
            saga,
            callbacks,
            idempotency,
            openapi: Arc::new(openapi),
            prometheus_handle,
        }
    }

    fn orchestrator<S: Stage>(&self) -> Orchestrator<S> {
        Orchestrator::new(self.saga.clone())
    }
}

fn router(state: AppState, auth: AuthState) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let protected = Router::new()
        .nest("/videos", artifact_routes::<VideoStage>())
        .nest("/images", artifact_routes::<ImageStage>())
        .route("/pricing-tiers", get(pricing_tiers))
        .route("/payments", get(payment_history))
        .route("/payments/orders", post(create_order))
        .route("/payments/confirm", post(confirm_payment))
        .route("/payments/{order_id}/cancel", post(cancel_payment))
        .route("/account", get(account_profile).delete(close_account))
        .route("/account/sync", post(account_sync))
        .route("/account/ledger", get(account_ledger))
        .route("/admin/users", get(admin_users))
        .route("/admin/credits", post(admin_grant))
        .route("/admin/{kind}/{id}", get(admin_artifact))
        .route_layer(middleware::from_fn_with_state(auth, require_session));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .route("/docs", get(swagger_ui))
        .route("/gallery/{kind}", get(gallery))
        .route("/callbacks/{kind}/{id}", post(completion_callback))
        .merge(protected)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit_from_env()))
}

/// Routes shared by `/videos` and `/images`.
fn artifact_routes<S: Stage>() -> Router<AppState> {
    Router::new()
        .route("/", get(list_artifacts::<S>).post(create_artifact::<S>))
        .route("/{id}", get(get_artifact::<S>))
        .route("/{id}/ad-copies", get(list_ad_copies::<S>))
        .route("/{id}/generate-ad-copies", post(generate_ad_copies::<S>))
        .route("/{id}/regenerate-ad-copies", post(regenerate_ad_copies::<S>))
        .route("/{id}/select", post(select_ad_copy::<S>))
        .route("/{id}/cancel", post(cancel_artifact::<S>))
        .route("/{id}/visibility", post(set_visibility::<S>))
        .route("/{id}/download", get(download_artifact::<S>))
        .route("/{id}/status", get(artifact_status::<S>))
        .route("/{id}/events", get(artifact_events::<S>))
}

type ApiResult<T> = Result<Json<ActionResponse<T>>, AppError>;

fn ok<T: Serialize>(data: T) -> Json<ActionResponse<T>> {
    Json(ActionResponse::ok(data))
}

/// Parses an optional JSON body; an empty body yields the default.
fn optional_body<T: DeserializeOwned + Default>(
    operation: &'static str,
    body: &Bytes,
) -> Result<T, ActionError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|err| ActionError::invalid_input(operation, err.to_string()))
}

fn body_limit_from_env() -> usize {
    config::env_parse("REQUEST_MAX_BYTES")
        .filter(|v: &usize| *v > 0)
        .unwrap_or(256 * 1024)
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "adstudio-api-rs",
    }))
}

async fn openapi_json(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, AppError> {
    if let Some(key) = config::env_string("OPENAPI_KEY") {
        let presented = headers
            .get("X-Docs-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != key {
            return Err(ActionError::forbidden("docs", "invalid docs key").into());
        }
    }
    Ok(Json((*state.openapi).clone()))
}

async fn swagger_ui() -> Html<&'static str> {
    Html(
        r#"<!doctype html>
<html>
<head>
  <meta charset='utf-8'/>
  <title>AdStudio API Docs</title>
  <link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css" />
</head>
<body>
  <div id="swagger-ui"></div>
  <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js"></script>
  <script>
    window.onload = () => {
      window.ui = SwaggerUIBundle({ url: '/openapi.json', dom_id: '#swagger-ui' });
    };
  </script>
</body>
</html>"#,
    )
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(secret) = config::env_string("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.prometheus_handle.render(),
    )
        .into_response()
}

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    #[serde(default)]
    status: Option<ArtifactStatus>,
    #[serde(default)]
    page: Option<u32>,
    #[serde(default)]
    per_page: Option<u32>,
}

impl ListQuery {
    fn page(&self) -> Page {
        let default = Page::default();
        Page::new(
            self.page.unwrap_or(default.page),
            self.per_page.unwrap_or(default.per_page),
        )
    }
}

async fn create_artifact<S: Stage>(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Json(input): Json<NewArtifact>,
) -> Result<(StatusCode, Json<ActionResponse<Value>>), AppError> {
    metrics::inc_requests("/{kind}");
    let artifact = state
        .orchestrator::<S>()
        .create_artifact(&context.user_id, input)
        .await?;
    Ok((StatusCode::CREATED, ok(json!({ "artifact": artifact }))))
}

async fn list_artifacts<S: Stage>(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Query(query): Query<ListQuery>,
) -> ApiResult<models::Paginated<stage::Artifact<S>>> {
    metrics::inc_requests("/{kind}");
    let page = state
        .orchestrator::<S>()
        .list(&context.user_id, query.status, query.page())
        .await?;
    Ok(ok(page))
}

async fn get_artifact<S: Stage>(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<Value> {
    metrics::inc_requests("/{kind}/{id}");
    let artifact = state.orchestrator::<S>().get(&context.user_id, id).await?;
    Ok(ok(json!({ "artifact": artifact })))
}

async fn list_ad_copies<S: Stage>(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<Value> {
    metrics::inc_requests("/{kind}/{id}/ad-copies");
    let copies = state
        .orchestrator::<S>()
        .list_ad_copies(&context.user_id, id)
        .await?;
    Ok(ok(json!({ "ad_copies": copies })))
}

/// Generate the first batch of ad-copy candidates.
///
/// - Method: `POST`
/// - Path: `/{kind}/{id}/generate-ad-copies`
/// - Response: the artifact at `ad_copy_selection` plus its candidates
async fn generate_ad_copies<S: Stage>(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<saga::AdCopyBatch<S>> {
    metrics::inc_requests("/{kind}/{id}/generate-ad-copies");
    let batch = state
        .orchestrator::<S>()
        .generate_ad_copies(&context.user_id, id)
        .await?;
    Ok(ok(batch))
}

async fn regenerate_ad_copies<S: Stage>(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<saga::AdCopyBatch<S>> {
    metrics::inc_requests("/{kind}/{id}/regenerate-ad-copies");
    let batch = state
        .orchestrator::<S>()
        .regenerate_ad_copies(&context.user_id, id)
        .await?;
    Ok(ok(batch))
}

/// Select a candidate (or custom text), pay for generation and start it.
///
/// - Method: `POST`
/// - Path: `/{kind}/{id}/select`
/// - Body: `{ "ad_copy_id": uuid }` or `{ "custom_text": string }`
/// - Errors: `402` with `insufficientCredits: true` when the balance is short
async fn select_ad_copy<S: Stage>(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<Uuid>,
    Json(request): Json<SelectRequest>,
) -> ApiResult<saga::GenerationStarted<S>> {
    metrics::inc_requests("/{kind}/{id}/select");
    let selection = request.into_selection()?;
    let started = state
        .orchestrator::<S>()
        .select_ad_copy_and_generate(&context.user_id, id, selection)
        .await?;
    Ok(ok(started))
}

async fn cancel_artifact<S: Stage>(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<Value> {
    metrics::inc_requests("/{kind}/{id}/cancel");
    let artifact = state
        .orchestrator::<S>()
        .cancel(&context.user_id, id)
        .await?;
    Ok(ok(json!({ "artifact": artifact })))
}

#[derive(Debug, Deserialize)]
struct VisibilityRequest {
    is_public: bool,
}

async fn set_visibility<S: Stage>(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<Uuid>,
    Json(request): Json<VisibilityRequest>,
) -> ApiResult<Value> {
    metrics::inc_requests("/{kind}/{id}/visibility");
    let artifact = state
        .orchestrator::<S>()
        .set_visibility(&context.user_id, id, request.is_public)
        .await?;
    Ok(ok(json!({ "artifact": artifact })))
}

async fn download_artifact<S: Stage>(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<saga::DownloadLink> {
    metrics::inc_requests("/{kind}/{id}/download");
    let link = state
        .orchestrator::<S>()
        .download_url(&context.user_id, id)
        .await?;
    Ok(ok(link))
}

async fn artifact_status<S: Stage>(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<Value> {
    let op = "artifact_status";
    state.orchestrator::<S>().get(&context.user_id, id).await?;
    let snapshot = state
        .watcher
        .snapshot(S::KIND, id)
        .await
        .map_err(ActionError::store(op))?
        .ok_or_else(|| ActionError::not_found(op, id.to_string()))?;
    Ok(ok(json!({ "snapshot": snapshot })))
}

/// Server-sent progress for one artifact.
///
/// - Method: `GET`
/// - Path: `/{kind}/{id}/events`
/// - Events: `snapshot` on every change, then a single `terminal`
async fn artifact_events<S: Stage>(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    state.orchestrator::<S>().get(&context.user_id, id).await?;
    let stream = ReceiverStream::new(state.watcher.watch(S::KIND, id)).map(|snapshot| {
        let name = if snapshot.is_terminal() {
            "terminal"
        } else {
            "snapshot"
        };
        let data = serde_json::to_string(&snapshot).unwrap_or_else(|_| "{}".to_string());
        Ok(Event::default().event(name).data(data))
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn gallery(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Query(page): Query<Page>,
) -> Result<Json<ActionResponse<models::Paginated<saga::GalleryItem>>>, AppError> {
    metrics::inc_requests("/gallery/{kind}");
    let items = match ArtifactKind::from_route(&kind) {
        Some(ArtifactKind::Video) => state.orchestrator::<VideoStage>().gallery(page).await?,
        Some(ArtifactKind::Image) => state.orchestrator::<ImageStage>().gallery(page).await?,
        None => return Err(ActionError::not_found("gallery", kind).into()),
    };
    Ok(ok(items))
}

/// Progress report from the workflow engine.
///
/// - Method: `POST`
/// - Path: `/callbacks/{kind}/{id}`
/// - Auth: `X-Signature: base64(HMAC-SHA256(CALLBACK_SECRET, body))`
/// - Body: `{ "status": "processing" | "completed" | "failed", ... }`
async fn completion_callback(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, Uuid)>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<saga::CallbackOutcome> {
    let op = "completion_callback";
    metrics::inc_requests("/callbacks/{kind}/{id}");
    if let Err(err) = state.callbacks.verify(&headers, &body) {
        warn!(target = "adstudio.api", artifact_id = %id, error = %err, "callback_rejected");
        return Err(match err {
            SignatureError::NotConfigured => ActionError::unavailable(op, err.to_string()),
            SignatureError::Missing | SignatureError::Mismatch => {
                ActionError::unauthenticated(op)
            }
        }
        .into());
    }
    let report: CompletionReport = serde_json::from_slice(&body)
        .map_err(|err| ActionError::invalid_input(op, err.to_string()))?;
    let outcome = match ArtifactKind::from_route(&kind) {
        Some(ArtifactKind::Video) => {
            state
                .orchestrator::<VideoStage>()
                .complete_from_callback(id, report)
                .await?
        }
        Some(ArtifactKind::Image) => {
            state
                .orchestrator::<ImageStage>()
                .complete_from_callback(id, report)
                .await?
        }
        None => return Err(ActionError::not_found(op, kind).into()),
    };
    Ok(ok(outcome))
}

async fn pricing_tiers(State(state): State<AppState>) -> ApiResult<Value> {
    metrics::inc_requests("/pricing-tiers");
    let tiers = state.payments.pricing_tiers().await?;
    Ok(ok(json!({ "tiers": tiers })))
}

#[derive(Debug, Deserialize)]
struct CreateOrderRequest {
    #[serde(alias = "pricingTierId", alias = "tier_id")]
    pricing_tier_id: String,
}

async fn create_order(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Json(request): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<ActionResponse<Value>>), AppError> {
    metrics::inc_requests("/payments/orders");
    let payment = state
        .payments
        .create_order(&context.user_id, &request.pricing_tier_id)
        .await?;
    Ok((StatusCode::CREATED, ok(json!({ "payment": payment }))))
}

/// Confirm a payment approved by the gateway's checkout widget.
///
/// - Method: `POST`
/// - Path: `/payments/confirm`
/// - Body: `{ payment_key, order_id, amount }` (camelCase accepted)
/// - Header: optional `Idempotency-Key`; a replay returns the stored response
async fn confirm_payment(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    headers: HeaderMap,
    Json(request): Json<ConfirmRequest>,
) -> Result<Json<Value>, AppError> {
    let op = "confirm_payment";
    metrics::inc_requests("/payments/confirm");
    let key = idempotency_key(&headers);
    if let Some(key) = &key
        && let Some(existing) = state.idempotency.get(&context.user_id, key).await
    {
        info!(
            target = "adstudio.api",
            user_id = %context.user_id,
            "idempotent_replay"
        );
        return Ok(Json(existing));
    }
    let confirmed = state.payments.confirm(&context.user_id, request).await?;
    let response = serde_json::to_value(ActionResponse::ok(confirmed))
        .map_err(|err| ActionError::persistence(op, err.to_string()))?;
    if let Some(key) = &key {
        state
            .idempotency
            .put(&context.user_id, key, &response)
            .await;
    }
    Ok(Json(response))
}

#[derive(Debug, Default, Deserialize)]
struct CancelPaymentRequest {
    #[serde(default, alias = "cancelReason")]
    reason: Option<String>,
}

async fn cancel_payment(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(order_id): Path<String>,
    body: Bytes,
) -> ApiResult<Value> {
    metrics::inc_requests("/payments/{order_id}/cancel");
    let request: CancelPaymentRequest = optional_body("cancel_payment", &body)?;
    let payment = state
        .payments
        .cancel(
            &context.user_id,
            &order_id,
            request.reason.as_deref().unwrap_or_default(),
        )
        .await?;
    Ok(ok(json!({ "payment": payment })))
}

async fn payment_history(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Query(page): Query<Page>,
) -> ApiResult<models::Paginated<models::Payment>> {
    metrics::inc_requests("/payments");
    Ok(ok(state.payments.history(&context.user_id, page).await?))
}

async fn account_sync(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    body: Bytes,
) -> ApiResult<Value> {
    metrics::inc_requests("/account/sync");
    let request: SyncRequest = optional_body("account_sync", &body)?;
    let user = state.accounts.sync(&context.user_id, request).await?;
    Ok(ok(json!({ "user": user })))
}

async fn account_profile(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
) -> ApiResult<Value> {
    metrics::inc_requests("/account");
    let user = state.accounts.profile(&context.user_id).await?;
    Ok(ok(json!({ "user": user })))
}

async fn account_ledger(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Query(page): Query<Page>,
) -> ApiResult<models::Paginated<models::LedgerEntry>> {
    metrics::inc_requests("/account/ledger");
    Ok(ok(state.accounts.ledger(&context.user_id, page).await?))
}

async fn close_account(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
) -> ApiResult<account::ClosureReport> {
    metrics::inc_requests("/account");
    Ok(ok(state.accounts.close(&context.user_id).await?))
}

async fn admin_users(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Query(page): Query<Page>,
) -> ApiResult<models::Paginated<models::User>> {
    metrics::inc_requests("/admin/users");
    Ok(ok(state.admin.list_users(&context.user_id, page).await?))
}

async fn admin_grant(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Json(request): Json<GrantRequest>,
) -> ApiResult<admin::GrantResult> {
    metrics::inc_requests("/admin/credits");
    Ok(ok(state.admin.grant(&context.user_id, request).await?))
}

async fn admin_artifact(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path((kind, id)): Path<(String, Uuid)>,
) -> ApiResult<admin::ArtifactDiagnostic> {
    metrics::inc_requests("/admin/{kind}/{id}");
    let kind = ArtifactKind::from_route(&kind)
        .ok_or_else(|| ActionError::not_found("admin_artifact", kind.clone()))?;
    Ok(ok(state
        .admin
        .artifact_diagnostic(&context.user_id, kind, id)
        .await?))
}

#[derive(Debug)]
enum AppError {
    Action(ActionError),
}

impl From<ActionError> for AppError {
    fn from(value: ActionError) -> Self {
        Self::Action(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Action(err) => {
                let status = match err.kind() {
                    ActionErrorKind::Unauthenticated => StatusCode::UNAUTHORIZED,
                    ActionErrorKind::NotFound => StatusCode::NOT_FOUND,
                    ActionErrorKind::Forbidden => StatusCode::FORBIDDEN,
                    ActionErrorKind::InvalidStage => StatusCode::CONFLICT,
                    ActionErrorKind::InsufficientFunds => StatusCode::PAYMENT_REQUIRED,
                    ActionErrorKind::Dispatch | ActionErrorKind::Gateway => StatusCode::BAD_GATEWAY,
                    ActionErrorKind::Persistence => StatusCode::INTERNAL_SERVER_ERROR,
                    ActionErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
                    ActionErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
                };
                if status.is_server_error() {
                    error!(
                        target = "adstudio.api",
                        operation = err.operation(),
                        detail = err.detail(),
                        "action_failed"
                    );
                } else {
                    info!(
                        target = "adstudio.api",
                        operation = err.operation(),
                        kind = ?err.kind(),
                        detail = err.detail(),
                        "action_rejected"
                    );
                }
                let mut payload = ApiError::new(err.user_message());
                if let Some((balance, required)) = err.shortfall() {
                    payload.insufficient_credits = true;
                    payload.detail = Some(json!({ "balance": balance, "required": required }));
                }
                (status, Json(payload)).into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use crate::security::{SIGNATURE_HEADER, test_auth_state};
    use crate::testing::{FakeEngine, seed_user};
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    const CALLBACK_SECRET: &str = "callback-secret";

    struct TestApp {
        app: Router,
        store: MemoryStore,
        _engine: FakeEngine,
    }

    async fn test_app() -> TestApp {
        let store = MemoryStore::with_default_tiers();
        seed_user(&store, "user_1", 500, Role::User).await;
        seed_user(&store, "user_2", 0, Role::User).await;
        seed_user(&store, "admin_1", 0, Role::Admin).await;
        let engine = FakeEngine::start().await;
        engine.reply("/ad-copy", crate::testing::Reply::Copies(3)).await;
        let shared: Arc<dyn Store> = Arc::new(store.clone());
        let storage = Storage::disabled();
        let saga = SagaContext::new(
            shared.clone(),
            Dispatcher::new(engine.webhook_config()),
            storage.clone(),
        );
        let mut state = AppState::new(
            shared.clone(),
            storage,
            saga,
            PaymentGateway::new("http://127.0.0.1:9", None),
            CallbackVerifier::new(Some(CALLBACK_SECRET)),
            IdempotencyCache::new(None, Duration::from_secs(60)),
            PrometheusBuilder::new().build_recorder().handle(),
        );
        state.watcher = ArtifactWatcher::with_timing(
            shared,
            Duration::from_millis(10),
            Duration::from_secs(2),
        );
        let auth = test_auth_state("user_1:token-1,user_2:token-2,admin_1:token-admin");
        TestApp {
            app: router(state, auth),
            store,
            _engine: engine,
        }
    }

    impl TestApp {
        async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
            let response = self.app.clone().oneshot(request).await.unwrap();
            let status = response.status();
            let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
            let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
            (status, body)
        }

        async fn call(&self, method: &str, uri: &str, token: &str, body: Value) -> (StatusCode, Value) {
            let request = Request::builder()
                .method(method)
                .uri(uri)
                .header("Authorization", format!("Bearer {token}"))
                .header("Content-Type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap();
            self.send(request).await
        }

        async fn artifact_in_processing(&self) -> String {
            let (status, created) = self
                .call(
                    "POST",
                    "/videos",
                    "token-1",
                    json!({ "product_name": "수제 캔들", "image_path": "user_1/candle.png" }),
                )
                .await;
            assert_eq!(status, StatusCode::CREATED);
            let id = created["artifact"]["id"].as_str().unwrap().to_string();
            let (status, batch) = self
                .call("POST", &format!("/videos/{id}/generate-ad-copies"), "token-1", json!({}))
                .await;
            assert_eq!(status, StatusCode::OK);
            let copy_id = batch["ad_copies"][0]["id"].as_str().unwrap().to_string();
            let (status, started) = self
                .call(
                    "POST",
                    &format!("/videos/{id}/select"),
                    "token-1",
                    json!({ "ad_copy_id": copy_id }),
                )
                .await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(started["success"], json!(true));
            assert_eq!(started["credits_charged"], json!(100));
            id
        }
    }

    fn signed_callback(uri: &str, body: Value, signature: Option<String>) -> Request<Body> {
        let raw = body.to_string();
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("Content-Type", "application/json");
        if let Some(signature) = signature {
            builder = builder.header(SIGNATURE_HEADER, signature);
        }
        builder.body(Body::from(raw)).unwrap()
    }

    fn sign(body: &Value) -> String {
        CallbackVerifier::new(Some(CALLBACK_SECRET))
            .sign(body.to_string().as_bytes())
            .unwrap()
    }

    #[tokio::test]
    async fn health_is_public_and_actions_need_a_session() {
        let app = test_app().await;
        let (status, body) = app
            .send(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], json!("ok"));

        let (status, body) = app
            .send(Request::builder().uri("/account").body(Body::empty()).unwrap())
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["success"], json!(false));
    }

    #[tokio::test]
    async fn generation_flow_completes_through_signed_callback() {
        let app = test_app().await;
        let id = app.artifact_in_processing().await;

        let report = json!({ "status": "completed", "output_url": "https://cdn.example/v.mp4" });
        let (status, outcome) = app
            .send(signed_callback(
                &format!("/callbacks/videos/{id}"),
                report.clone(),
                Some(sign(&report)),
            ))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(outcome["applied"], json!(true));
        assert_eq!(outcome["status"], json!("completed"));

        let (status, body) = app
            .call("GET", &format!("/videos/{id}/status"), "token-1", Value::Null)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["snapshot"]["status"], json!("completed"));

        let (status, profile) = app.call("GET", "/account", "token-1", Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(profile["user"]["credit_balance"], json!(400));
    }

    #[tokio::test]
    async fn unsigned_callbacks_are_rejected() {
        let app = test_app().await;
        let id = app.artifact_in_processing().await;
        let report = json!({ "status": "completed", "output_url": "https://cdn.example/v.mp4" });
        let (status, _) = app
            .send(signed_callback(&format!("/callbacks/videos/{id}"), report.clone(), None))
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = app
            .send(signed_callback(
                &format!("/callbacks/videos/{id}"),
                report,
                Some("sha256=bm90LXRoZS1zaWduYXR1cmU=".into()),
            ))
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn insufficient_credits_are_flagged() {
        let app = test_app().await;
        let (_, created) = app
            .call(
                "POST",
                "/videos",
                "token-2",
                json!({ "product_name": "텀블러", "image_path": "user_2/tumbler.png" }),
            )
            .await;
        let id = created["artifact"]["id"].as_str().unwrap().to_string();
        app.call("POST", &format!("/videos/{id}/generate-ad-copies"), "token-2", json!({}))
            .await;
        let (status, body) = app
            .call(
                "POST",
                &format!("/videos/{id}/select"),
                "token-2",
                json!({ "custom_text": "직접 쓴 문구" }),
            )
            .await;
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
        assert_eq!(body["success"], json!(false));
        assert_eq!(body["insufficientCredits"], json!(true));
        assert_eq!(body["error"], json!("크레딧이 부족합니다."));
    }

    #[tokio::test]
    async fn other_users_artifacts_are_forbidden() {
        let app = test_app().await;
        let id = app.artifact_in_processing().await;
        let (status, _) = app
            .call("GET", &format!("/videos/{id}"), "token-2", Value::Null)
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn payment_confirmation_replays_with_idempotency_key() {
        let app = test_app().await;
        let (status, order) = app
            .call("POST", "/payments/orders", "token-2", json!({ "pricing_tier_id": "starter" }))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        let order_id = order["payment"]["order_id"].as_str().unwrap().to_string();
        let amount = order["payment"]["amount"].clone();

        let confirm = || {
            Request::builder()
                .method("POST")
                .uri("/payments/confirm")
                .header("Authorization", "Bearer token-2")
                .header("Content-Type", "application/json")
                .header("Idempotency-Key", "confirm-1")
                .body(Body::from(
                    json!({ "paymentKey": "pk_1", "orderId": order_id, "amount": amount })
                        .to_string(),
                ))
                .unwrap()
        };
        let (status, first) = app.send(confirm()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["balance_after"], json!(1_000));
        let (status, second) = app.send(confirm()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first, second);

        let user = app.store.get_user("user_2").await.unwrap().unwrap();
        assert_eq!(user.credit_balance, 1_000);
    }

    #[tokio::test]
    async fn admin_routes_recheck_role() {
        let app = test_app().await;
        let (status, _) = app.call("GET", "/admin/users", "token-1", Value::Null).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, body) = app
            .call(
                "POST",
                "/admin/credits",
                "token-admin",
                json!({ "user_id": "user_2", "amount": 50, "reason": "보상" }),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["balance_after"], json!(50));

        let id = app.artifact_in_processing().await;
        let (status, dump) = app
            .call("GET", &format!("/admin/videos/{id}"), "token-admin", Value::Null)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(dump["artifact"]["credits_charged"], json!(100));
        assert_eq!(dump["ad_copies"].as_array().map(Vec::len), Some(3));
        assert_eq!(dump["ledger_entries"][0]["type"], json!("usage"));
        assert_eq!(
            dump["product_image"]["storage_path"],
            json!("user_1/candle.png")
        );
    }

    #[tokio::test]
    async fn account_sync_accepts_an_empty_body() {
        let app = test_app().await;
        let request = Request::builder()
            .method("POST")
            .uri("/account/sync")
            .header("X-Session-Token", "token-1")
            .body(Body::empty())
            .unwrap();
        let (status, body) = app.send(request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["user"]["credit_balance"], json!(500));
    }
}
