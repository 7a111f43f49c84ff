//! HTTP ingress through which the cloud-side bridge delivers session signals.
//!
//! Routes:
//!   GET  /api/health                   → health check
//!   GET  /api/locations                → configured locations and cameras
//!   POST /api/cameras/:id/motion       → motion detected on a camera
//!   POST /api/cameras/:id/call-ended   → a camera's live call has ended
//!   POST /api/token                    → the refresh token was rotated

use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use chrono::Local;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use doorwatch_common::protocol::{HealthResponse, LocationInfo, TokenRotation};

use crate::session::{Session, SessionEvent};

/// Shared state for route handlers.
#[derive(Clone)]
struct AppState {
    session: Session,
    start_time: Instant,
}

fn router(session: Session) -> Router {
    let state = AppState {
        session,
        start_time: Instant::now(),
    };

    Router::new()
        .route("/api/health", get(health))
        .route("/api/locations", get(list_locations))
        .route("/api/cameras/{id}/motion", post(motion))
        .route("/api/cameras/{id}/call-ended", post(call_ended))
        .route("/api/token", post(rotate_token))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server. Runs until `shutdown` is cancelled.
pub async fn run(
    session: Session,
    listen_addr: &str,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(listen_addr).await?;
    info!("Signal ingress listening on {listen_addr}");
    serve(listener, session, shutdown).await
}

async fn serve(
    listener: TcpListener,
    session: Session,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    axum::serve(listener, router(session))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}

// ── route handlers ───────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

async fn list_locations(State(state): State<AppState>) -> Json<Vec<LocationInfo>> {
    Json(state.session.locations().iter().map(|l| l.info()).collect())
}

async fn motion(State(state): State<AppState>, Path(id): Path<String>) -> StatusCode {
    if state.session.camera(&id).is_none() {
        return StatusCode::NOT_FOUND;
    }
    deliver(
        &state,
        SessionEvent::Motion {
            camera_id: id,
            occurred_at: Local::now(),
        },
    )
    .await
}

async fn call_ended(State(state): State<AppState>, Path(id): Path<String>) -> StatusCode {
    if state.session.camera(&id).is_none() {
        return StatusCode::NOT_FOUND;
    }
    deliver(&state, SessionEvent::CallEnded { camera_id: id }).await
}

async fn rotate_token(
    State(state): State<AppState>,
    Json(body): Json<TokenRotation>,
) -> StatusCode {
    if body.new_refresh_token.is_empty() {
        return StatusCode::BAD_REQUEST;
    }
    deliver(
        &state,
        SessionEvent::TokenRotated {
            old: body.old_refresh_token.filter(|t| !t.is_empty()),
            new: body.new_refresh_token,
        },
    )
    .await
}

async fn deliver(state: &AppState, event: SessionEvent) -> StatusCode {
    match state.session.events().send(event).await {
        Ok(()) => StatusCode::ACCEPTED,
        Err(e) => {
            warn!("Dropping session event, dispatcher gone: {e}");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}
