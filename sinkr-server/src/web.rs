//! HTTP and WebSocket front door.
//!
//! `GET /{appId}` upgrades sinks (dispatched to a worker shard),
//! sources (`sinkrKey`/`appKey` query, held on the coordinator), and
//! coordination-internal connections (bearer-matched). `POST /{appId}`
//! is the stateless source transport carrying one envelope per request.
//! The read-only surfaces are `/api/v1/health` and the bearer-guarded
//! `/internal/shards` load-table dump.

use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

use crate::connection;
use crate::db::AppRow;
use crate::protocol::{RouteError, SourceEnvelope};
use crate::server::SharedState;

/// Build the axum router.
pub fn router(state: Arc<SharedState>) -> Router {
    Router::new()
        .route("/api/v1/health", get(api_health))
        .route("/api/v1/{app_id}/channels", get(api_channels))
        .route("/api/v1/{app_id}/channels/{channel_id}/messages", get(api_channel_messages))
        .route("/internal/shards", get(internal_shards))
        .route("/{app_id}", get(peer_upgrade).post(source_http))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Look up an enabled app or produce the 404 both entry points share.
fn lookup_app(state: &SharedState, app_id: &str) -> Result<AppRow, Response> {
    match state.with_db(|db| db.get_app(app_id)) {
        Ok(Some(app)) if app.enabled => Ok(app),
        Ok(_) => Err((StatusCode::NOT_FOUND, "Invalid application").into_response()),
        Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR.into_response()),
    }
}

// ── WebSocket upgrade ──────────────────────────────────────────────────

#[derive(Deserialize)]
struct UpgradeQuery {
    #[serde(rename = "sinkrKey")]
    sinkr_key: Option<String>,
    #[serde(rename = "appKey")]
    app_key: Option<String>,
}

async fn peer_upgrade(
    ws: WebSocketUpgrade,
    Path(app_id): Path<String>,
    Query(query): Query<UpgradeQuery>,
    headers: HeaderMap,
    State(state): State<Arc<SharedState>>,
) -> Response {
    let app = match lookup_app(&state, &app_id) {
        Ok(app) => app,
        Err(resp) => return resp,
    };

    // Coordinator-internal upgrades are bearer-matched and never
    // dispatched to a shard. The app id still has to be valid.
    if let Some(secret) = state.config.coordination_secret.as_deref()
        && bearer(&headers) == Some(secret)
    {
        return ws.on_upgrade(connection::run_internal_socket).into_response();
    }

    // A source key marks the peer as a source, kept on the coordinator.
    if let Some(key) = query.sinkr_key.or(query.app_key) {
        if key != app.secret_key {
            return (StatusCode::UNAUTHORIZED, "Invalid key").into_response();
        }
        return ws
            .on_upgrade(move |socket| connection::run_source_socket(state, socket, app))
            .into_response();
    }

    // Sink: least-loaded worker shard under the soft cap.
    let shard = match state.with_db(|db| state.coordinator.assign_shard(db)) {
        Ok(shard) => shard,
        Err(_) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    };
    ws.on_upgrade(move |socket| connection::run_sink_socket(state, shard, socket, app))
        .into_response()
}

// ── HTTP source transport ──────────────────────────────────────────────

#[derive(Serialize)]
struct HttpError {
    success: bool,
    error: RouteError,
}

async fn source_http(
    Path(app_id): Path<String>,
    State(state): State<Arc<SharedState>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    let app = match lookup_app(&state, &app_id) {
        Ok(app) => app,
        Err(resp) => return resp,
    };
    if bearer(&headers) != Some(app.secret_key.as_str()) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let envelope: SourceEnvelope = match serde_json::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::debug!(app = %app.id, error = %e, "rejected malformed source request");
            return (
                StatusCode::BAD_REQUEST,
                Json(HttpError { success: false, error: RouteError::InvalidRequest }),
            )
                .into_response();
        }
    };
    Json(connection::routing::execute(&state, &app, envelope)).into_response()
}

// ── Read-only surfaces ─────────────────────────────────────────────────

#[derive(Serialize)]
struct HealthResponse {
    server: &'static str,
    shards: usize,
    connections: usize,
    uptime_secs: u64,
}

async fn api_health(State(state): State<Arc<SharedState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        server: "sinkr",
        shards: state.coordinator.shard_count(),
        connections: state.coordinator.connection_count(),
        uptime_secs: state.uptime_secs(),
    })
}

#[derive(Serialize)]
struct ChannelInfo {
    id: String,
    name: String,
    auth: crate::protocol::ChannelAuthMode,
    store: bool,
    subscribers: usize,
}

/// Read-only channel listing for a tenant, authorized by the app secret
/// (this is a source-side surface, not a sink one).
async fn api_channels(
    Path(app_id): Path<String>,
    headers: HeaderMap,
    State(state): State<Arc<SharedState>>,
) -> Response {
    let app = match lookup_app(&state, &app_id) {
        Ok(app) => app,
        Err(resp) => return resp,
    };
    if bearer(&headers) != Some(app.secret_key.as_str()) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    match state.with_db(|db| db.list_channels(&app.id)) {
        Ok(channels) => Json(
            channels
                .into_iter()
                .map(|(c, subscribers)| ChannelInfo {
                    id: c.id,
                    name: c.name,
                    auth: c.auth,
                    store: c.store,
                    subscribers,
                })
                .collect::<Vec<_>>(),
        )
        .into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

/// Stored-message refs (`id` + `date`) of one channel, ascending.
async fn api_channel_messages(
    Path((app_id, channel_id)): Path<(String, String)>,
    headers: HeaderMap,
    State(state): State<Arc<SharedState>>,
) -> Response {
    let app = match lookup_app(&state, &app_id) {
        Ok(app) => app,
        Err(resp) => return resp,
    };
    if bearer(&headers) != Some(app.secret_key.as_str()) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let refs = state.with_db(|db| {
        let Some(channel) = db.get_channel(&app.id, &channel_id)? else {
            return Ok(None);
        };
        Ok(Some(db.stored_message_refs(&channel.id)?))
    });
    match refs {
        Ok(Some(refs)) => Json(
            refs.into_iter()
                .map(|(id, date)| crate::protocol::StoredMessageRef { id, date })
                .collect::<Vec<_>>(),
        )
        .into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

#[derive(Serialize)]
struct ShardLoad {
    id: i64,
    connections: usize,
}

async fn internal_shards(
    headers: HeaderMap,
    State(state): State<Arc<SharedState>>,
) -> Response {
    let Some(secret) = state.config.coordination_secret.as_deref() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if bearer(&headers) != Some(secret) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let loads: Vec<ShardLoad> = state
        .coordinator
        .load_snapshot()
        .into_iter()
        .map(|(id, connections)| ShardLoad { id, connections })
        .collect();
    Json(loads).into_response()
}
