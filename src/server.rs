use std::future::Future;

use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use sqlx::PgPool;
use subtle::ConstantTimeEq;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::error::ApiError;
use crate::pools::{self, NewAccount, NewProxy};
use crate::queue;
use crate::registry;
use crate::sanitize::{self, MAX_LOG_BYTES};
use crate::servers;
use crate::socks::ProxyKind;
use crate::types::{
    AddServersRequest, ClaimRequest, CompleteRequest, FailRequest, HeartbeatRequest,
    RegisterRequest, RegisterResponse, TaskLogsRequest,
};

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    /// `None` disables operator authentication entirely.
    pub api_key: Option<String>,
}

/// Build the CORS layer from a comma-separated origin list; absent means
/// any origin.
pub fn cors_layer(origins: Option<&str>) -> CorsLayer {
    match origins {
        Some(list) => {
            let parsed: Vec<HeaderValue> = list
                .split(',')
                .filter_map(|origin| origin.trim().parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(parsed))
                .allow_methods(Any)
                .allow_headers(Any)
        }
        None => CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    }
}

/// Route table. Agent endpoints are open (network restrictions live in the
/// deployment); operator endpoints sit behind the API-key middleware.
pub fn router(state: AppState, cors: CorsLayer) -> Router {
    let agent_api = Router::new()
        .route("/agents/register", post(register_agent))
        .route("/agents/heartbeat", post(agent_heartbeat))
        .route("/queue/claim", post(claim_work))
        .route("/queue/{id}/complete", post(complete_work))
        .route("/queue/{id}/fail", post(fail_work))
        .route("/tasks/{id}/logs", post(task_logs));

    let operator_api = Router::new()
        .route("/agents", get(list_agents))
        .route("/servers/add", post(add_servers))
        .route("/servers", get(list_servers))
        .route("/servers/by-address/{address}", get(server_by_address))
        .route("/servers/{id}", get(get_server).delete(delete_server))
        .route("/servers/{id}/scan/{timestamp}", delete(delete_scan_entry))
        .route("/queue", get(queue_stats))
        .route("/proxies", get(list_proxies).post(create_proxy))
        .route("/proxies/{id}", delete(delete_proxy))
        .route("/proxies/import", post(import_proxies))
        .route("/accounts", get(list_accounts).post(create_account))
        .route("/accounts/{id}", delete(delete_account))
        .route("/accounts/import", post(import_accounts))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    Router::new()
        .nest("/api", agent_api.merge(operator_api))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until `shutdown` resolves.
pub async fn serve(
    state: AppState,
    bind: &str,
    cors: CorsLayer,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = router(state, cors);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(addr = %bind, "coordinator listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn require_api_key(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = &state.api_key else {
        return Ok(next.run(req).await);
    };
    let provided = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if bool::from(provided.as_bytes().ct_eq(expected.as_bytes())) {
        Ok(next.run(req).await)
    } else {
        Err(ApiError::Auth)
    }
}

async fn register_agent(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, ApiError> {
    let agent_name = registry::register(&state.pool, &req.agent_id).await?;
    Ok(Json(RegisterResponse {
        ok: true,
        agent_id: req.agent_id,
        agent_name,
    }))
}

async fn agent_heartbeat(
    State(state): State<AppState>,
    Json(req): Json<HeartbeatRequest>,
) -> Result<impl IntoResponse, ApiError> {
    registry::heartbeat(&state.pool, &req.agent_id, req.status, req.current_queue_id).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn claim_work(
    State(state): State<AppState>,
    Json(req): Json<ClaimRequest>,
) -> Result<Response, ApiError> {
    match queue::claim(&state.pool, &req.agent_id).await? {
        Some(claim) => Ok(Json(claim).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

async fn complete_work(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<CompleteRequest>,
) -> Result<impl IntoResponse, ApiError> {
    queue::complete(&state.pool, id, req.result).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn fail_work(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<FailRequest>,
) -> Result<impl IntoResponse, ApiError> {
    queue::fail(&state.pool, id, &req.error_message).await?;
    Ok(Json(json!({ "ok": true })))
}

/// Log sink: re-emit agent-shipped task logs through the coordinator's
/// subscriber, sanitized.
async fn task_logs(
    Path(id): Path<Uuid>,
    Json(req): Json<TaskLogsRequest>,
) -> impl IntoResponse {
    let agent = sanitize::clean(&req.agent_id, 100);
    for entry in req.logs.iter().take(1_000) {
        tracing::info!(
            task = %id,
            agent = %agent,
            level = %sanitize::clean(&entry.level, 16),
            "{}",
            sanitize::clean(&entry.message, MAX_LOG_BYTES)
        );
    }
    Json(json!({ "ok": true }))
}

async fn list_agents(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(registry::list(&state.pool).await?))
}

async fn add_servers(
    State(state): State<AppState>,
    Json(req): Json<AddServersRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = queue::add_servers(&state.pool, &req.servers).await?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

#[derive(Debug, Deserialize)]
struct Page {
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

fn default_limit() -> i64 {
    50
}

async fn list_servers(
    State(state): State<AppState>,
    Query(page): Query<Page>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(servers::list(&state.pool, page.limit, page.offset).await?))
}

async fn get_server(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(servers::get(&state.pool, id).await?))
}

async fn server_by_address(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(servers::get_by_address(&state.pool, &address).await?))
}

async fn delete_server(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    servers::delete(&state.pool, id).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn delete_scan_entry(
    State(state): State<AppState>,
    Path((id, timestamp)): Path<(Uuid, String)>,
) -> Result<impl IntoResponse, ApiError> {
    servers::delete_scan(&state.pool, id, &timestamp).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn queue_stats(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(queue::stats(&state.pool).await?))
}

async fn list_proxies(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(pools::list_proxies(&state.pool).await?))
}

async fn create_proxy(
    State(state): State<AppState>,
    Json(new): Json<NewProxy>,
) -> Result<impl IntoResponse, ApiError> {
    Ok((StatusCode::CREATED, Json(pools::create_proxy(&state.pool, new).await?)))
}

async fn delete_proxy(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    pools::delete_proxy(&state.pool, id).await?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
struct ProxyImportQuery {
    #[serde(rename = "type", default)]
    kind: ProxyKind,
}

async fn import_proxies(
    State(state): State<AppState>,
    Query(query): Query<ProxyImportQuery>,
    body: String,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(pools::import_proxies(&state.pool, &body, query.kind).await?))
}

async fn list_accounts(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(pools::list_accounts(&state.pool).await?))
}

async fn create_account(
    State(state): State<AppState>,
    Json(new): Json<NewAccount>,
) -> Result<impl IntoResponse, ApiError> {
    Ok((StatusCode::CREATED, Json(pools::create_account(&state.pool, new).await?)))
}

async fn delete_account(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    pools::delete_account(&state.pool, id).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn import_accounts(
    State(state): State<AppState>,
    body: String,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(pools::import_accounts(&state.pool, &body).await?))
}
