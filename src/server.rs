//! ==============================================================================
//! server.rs - local live-view api
//! ==============================================================================
//!
//! routes:
//!     GET  /api/state              current LiveSnapshot as json
//!     POST /api/select             { garden_id }
//!     POST /api/control            { device, state }
//!     POST /api/auto-mode          toggle auto mode
//!     POST /api/refresh            reload the active garden
//!     POST /api/analysis/refresh   fetch the latest plant analysis
//!     POST /hooks/live             { event, data } pushed by the backend
//!
//! every command answers {"status": "ok", ...} or
//! {"status": "error", "message": ...} with a matching status code.
//!
//! ==============================================================================

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;

use crate::domain::CommandKey;
use crate::error::LiveError;
use crate::live::{LiveEvent, RoomHub};
use crate::view::{LiveSnapshot, LiveView};

type Reply = (StatusCode, Json<Value>);

#[derive(Clone)]
struct ApiState {
    view: LiveView,
    hub: RoomHub,
}

pub fn router(view: LiveView, hub: RoomHub) -> Router {
    Router::new()
        .route("/api/state", get(state_handler))
        .route("/api/select", post(select_handler))
        .route("/api/control", post(control_handler))
        .route("/api/auto-mode", post(auto_mode_handler))
        .route("/api/refresh", post(refresh_handler))
        .route("/api/analysis/refresh", post(analysis_handler))
        .route("/hooks/live", post(live_hook_handler))
        .layer(CorsLayer::permissive())
        .with_state(ApiState { view, hub })
}

pub async fn run_server(bind: &str, view: LiveView, hub: RoomHub) -> Result<()> {
    let app = router(view.clone(), hub);
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {}", bind))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    view.teardown();
    Ok(())
}

fn status_for(err: &LiveError) -> StatusCode {
    match err {
        LiveError::NoActiveGarden | LiveError::AutoModePending => StatusCode::CONFLICT,
        LiveError::DeviceCooling { .. } => StatusCode::TOO_MANY_REQUESTS,
        LiveError::UnknownDevice(_) => StatusCode::BAD_REQUEST,
        LiveError::CorruptCache { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        LiveError::PartialFetchFailure(_)
        | LiveError::CommandRejected(_)
        | LiveError::Backend(_) => StatusCode::BAD_GATEWAY,
    }
}

fn ok(body: Value) -> Reply {
    (StatusCode::OK, Json(body))
}

fn error(err: LiveError) -> Reply {
    let mut body = json!({ "status": "error", "message": err.to_string() });
    if let LiveError::DeviceCooling { remaining, .. } = err {
        body["remaining"] = json!(remaining);
    }
    (status_for(&err), Json(body))
}

async fn state_handler(State(api): State<ApiState>) -> Json<LiveSnapshot> {
    Json(api.view.snapshot().await)
}

#[derive(Deserialize)]
struct SelectBody {
    garden_id: String,
}

async fn select_handler(State(api): State<ApiState>, Json(body): Json<SelectBody>) -> Reply {
    let mut selected = api.view.select_garden(&body.garden_id).await;
    if !selected {
        // the garden may have been created after our list was loaded
        if let Err(e) = api.view.refresh_gardens().await {
            return error(e);
        }
        selected = api.view.select_garden(&body.garden_id).await;
    }
    if selected {
        ok(json!({ "status": "ok", "garden_id": body.garden_id }))
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({ "status": "error", "message": "unknown garden" })),
        )
    }
}

#[derive(Deserialize)]
struct ControlBody {
    device: String,
    state: bool,
}

async fn control_handler(State(api): State<ApiState>, Json(body): Json<ControlBody>) -> Reply {
    let device: CommandKey = match body.device.parse() {
        Ok(device) => device,
        Err(e) => return error(e),
    };
    match api.view.control(device, body.state).await {
        Ok(()) => ok(json!({ "status": "ok", "device": device, "state": body.state })),
        Err(e) => error(e),
    }
}

async fn auto_mode_handler(State(api): State<ApiState>) -> Reply {
    match api.view.toggle_auto_mode().await {
        Ok(auto) => ok(json!({ "status": "ok", "auto_mode": auto })),
        Err(e) => error(e),
    }
}

async fn refresh_handler(State(api): State<ApiState>) -> Reply {
    let Some(garden_id) = api.view.active_garden().await else {
        return error(LiveError::NoActiveGarden);
    };
    match api.view.load_snapshot(&garden_id).await {
        Ok(()) => ok(json!({ "status": "ok" })),
        Err(e) => error(e),
    }
}

async fn analysis_handler(State(api): State<ApiState>) -> Reply {
    match api.view.refresh_analysis().await {
        Ok(analysis) => ok(json!({ "status": "ok", "analysis": analysis })),
        Err(e) => error(e),
    }
}

async fn live_hook_handler(State(api): State<ApiState>, Json(event): Json<LiveEvent>) -> Reply {
    let delivered = api.hub.publish(event);
    ok(json!({ "status": "ok", "delivered": delivered }))
}
