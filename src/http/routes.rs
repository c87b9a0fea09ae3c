//! HTTP route definitions

use axum::{
    extract::{Path, State},
    http::{header, Method, StatusCode},
    middleware,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::app::AppState;
use crate::http::middleware::require_admin;
use crate::movement::{Direction, MobileId, PolicyKind, Position, PositionUpdate, RejectReason, SessionView};
use crate::util::time::uptime_secs;
use crate::ws::handler::ws_handler;

/// Build the application router
pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.client_origin);

    // Public routes (no auth required)
    let public_routes = Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_handler));

    // Operator routes (admin token required)
    let admin_routes = Router::new()
        .route("/mobiles/:id", get(inspect_handler))
        .route("/mobiles/:id/teleport", post(teleport_handler))
        .route("/mobiles/:id/speed", post(speed_handler))
        .layer(middleware::from_fn_with_state(state.clone(), require_admin));

    Router::new()
        .merge(public_routes)
        .merge(admin_routes)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CompressionLayer::new())
                .layer(cors),
        )
        .with_state(state)
}

/// CORS configuration - support multiple origins (comma-separated), `*` for any
fn cors_layer(client_origin: &str) -> CorsLayer {
    if client_origin.trim() == "*" {
        return CorsLayer::permissive();
    }

    let allowed_origins: Vec<header::HeaderValue> = client_origin
        .split(',')
        .filter_map(|s| s.trim().parse::<header::HeaderValue>().ok())
        .collect();

    CorsLayer::new()
        .allow_origin(allowed_origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
}

// ============================================================================
// Health endpoint
// ============================================================================

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    active_sessions: usize,
    tracked_mobiles: usize,
    policy: PolicyKind,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: uptime_secs(),
        active_sessions: state.registry.len(),
        tracked_mobiles: state.world.tracked(),
        policy: state.registry.policy(),
    })
}

// ============================================================================
// Mobile admin endpoints
// ============================================================================

#[derive(Serialize)]
struct MobileResponse {
    session: SessionView,
    /// Last position the world simulation applied
    last_published: Option<PositionUpdate>,
}

#[derive(Deserialize)]
struct TeleportRequest {
    x: u16,
    y: u16,
    #[serde(default)]
    z: i8,
    facing: Direction,
}

#[derive(Deserialize)]
struct SpeedRequest {
    mounted: bool,
}

async fn inspect_handler(
    State(state): State<AppState>,
    Path(mobile_id): Path<MobileId>,
) -> Result<Json<MobileResponse>, AppError> {
    let session = state.registry.inspect(mobile_id).await?;
    Ok(Json(MobileResponse {
        session,
        last_published: state.world.last_known(mobile_id),
    }))
}

async fn teleport_handler(
    State(state): State<AppState>,
    Path(mobile_id): Path<MobileId>,
    Json(req): Json<TeleportRequest>,
) -> Result<Json<SessionView>, AppError> {
    let position = Position::new(req.x, req.y, req.z);
    state.registry.teleport(mobile_id, position, req.facing).await?;
    info!(mobile_id, x = req.x, y = req.y, "Operator teleport");

    Ok(Json(state.registry.inspect(mobile_id).await?))
}

async fn speed_handler(
    State(state): State<AppState>,
    Path(mobile_id): Path<MobileId>,
    Json(req): Json<SpeedRequest>,
) -> Result<Json<SessionView>, AppError> {
    let speed = state.config.speed_profile(req.mounted);
    state.registry.set_speed(mobile_id, speed).await?;
    info!(mobile_id, mounted = req.mounted, "Operator speed change");

    Ok(Json(state.registry.inspect(mobile_id).await?))
}

// ============================================================================
// Error handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<RejectReason> for AppError {
    fn from(reason: RejectReason) -> Self {
        match reason {
            RejectReason::SessionClosed => AppError::NotFound("no live session for mobile".to_string()),
            other => AppError::BadRequest(other.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match &self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
        };

        let body = serde_json::json!({
            "error": message
        });

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn state_with_token(token: Option<&str>) -> AppState {
        let token = token.map(str::to_string);
        let config = Config::from_lookup(|key| match key {
            "ADMIN_TOKEN" => token.clone(),
            _ => None,
        })
        .unwrap();
        AppState::new(config)
    }

    fn get_mobile(id: MobileId, auth: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(format!("/mobiles/{id}"));
        if let Some(auth) = auth {
            builder = builder.header(header::AUTHORIZATION, auth);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_policy_and_sessions() {
        let config = Config::from_lookup(|key| match key {
            "MOVEMENT_POLICY" => Some("queue_depth_based".to_string()),
            _ => None,
        })
        .unwrap();
        let state = AppState::new(config);

        let Json(health) = health_handler(State(state)).await;

        assert_eq!(health.status, "ok");
        assert_eq!(health.active_sessions, 0);
        assert_eq!(health.policy, PolicyKind::QueueDepthBased);
    }

    #[tokio::test]
    async fn test_router_builds_with_origin_list() {
        let config = Config::from_lookup(|key| match key {
            "CLIENT_ORIGIN" => Some("https://play.example.com, https://beta.example.com".to_string()),
            _ => None,
        })
        .unwrap();
        let _router = build_router(AppState::new(config));
    }

    #[tokio::test]
    async fn test_admin_routes_disabled_without_token() {
        let router = build_router(state_with_token(None));
        let response = router.oneshot(get_mobile(1, Some("Bearer anything"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_admin_routes_require_matching_bearer() {
        let state = state_with_token(Some("s3cret"));

        let missing = build_router(state.clone()).oneshot(get_mobile(1, None)).await.unwrap();
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

        let wrong = build_router(state.clone())
            .oneshot(get_mobile(1, Some("Bearer nope")))
            .await
            .unwrap();
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

        let malformed = build_router(state.clone())
            .oneshot(get_mobile(1, Some("s3cret")))
            .await
            .unwrap();
        assert_eq!(malformed.status(), StatusCode::BAD_REQUEST);

        let unknown = build_router(state)
            .oneshot(get_mobile(1, Some("Bearer s3cret")))
            .await
            .unwrap();
        assert_eq!(unknown.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_inspect_live_mobile_through_router() {
        let state = state_with_token(Some("s3cret"));
        let (handle, _events) = state.registry.open(
            state.config.speed_profile(false),
            state.config.spawn,
            Direction::South,
        );

        let response = build_router(state)
            .oneshot(get_mobile(handle.mobile_id(), Some("Bearer s3cret")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_operator_teleport_and_mount() {
        let state = state_with_token(Some("s3cret"));
        let (handle, _events) = state.registry.open(
            state.config.speed_profile(false),
            state.config.spawn,
            Direction::South,
        );
        let id = handle.mobile_id();

        let Json(view) = teleport_handler(
            State(state.clone()),
            Path(id),
            Json(TeleportRequest {
                x: 1500,
                y: 1600,
                z: 5,
                facing: Direction::West,
            }),
        )
        .await
        .unwrap();
        assert_eq!(view.position, Position::new(1500, 1600, 5));
        assert_eq!(view.facing, Direction::West);
        assert_eq!(view.expected_sequence, 0);

        let Json(view) = speed_handler(State(state.clone()), Path(id), Json(SpeedRequest { mounted: true }))
            .await
            .unwrap();
        assert_eq!(
            view.base_tile_duration_ms,
            state.config.speed_profile(true).base_tile_duration_ms
        );

        let Json(mobile) = inspect_handler(State(state), Path(id)).await.unwrap();
        assert_eq!(mobile.session.position, Position::new(1500, 1600, 5));
        assert!(mobile.last_published.is_none());
    }

    #[tokio::test]
    async fn test_unknown_mobile_maps_to_not_found() {
        let state = state_with_token(Some("s3cret"));
        let err = inspect_handler(State(state), Path(7)).await.err().unwrap();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
