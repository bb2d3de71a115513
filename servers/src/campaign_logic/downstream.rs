//! # Downstream API
//!
//! HTTP and WebSocket surface of the campaign pipeline.
//!
//! ## Core Design Principles
//!
//! 1. **Thin Handlers**: every route maps onto exactly one pipeline or
//!    resolver operation; no business rules live here.
//! 2. **Stable Error Bodies**: a [`PipelineError`] becomes a JSON body carrying
//!    its code prefix and an HTTP status chosen from the error variant.
//! 3. **Live Streams End Cleanly**: a WebSocket closes when the client leaves,
//!    when the subscriber is dropped for falling behind, or on shutdown.

use crate::campaign_logic::config::ServerConfig;
use crate::campaign_logic::state::AppState;
use axum::{
    Json, Router,
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures_util::StreamExt;
use lib_campaign::cache::{Asset, Board, StoreError};
use lib_campaign::{
    CampaignMetrics, CampaignRegistration, EntityKind, EventKind, HealthStatus, MetricsSample, NewCampaign,
    PipelineError, Registered, RegistrationUpdate, UpdateOutcome,
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::net::SocketAddr;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// # API Error
///
/// Wraps a [`PipelineError`] so handlers can use `?` and still answer with a
/// JSON body.
#[derive(Debug)]
pub struct ApiError(pub PipelineError);

impl From<PipelineError> for ApiError {
    fn from(value: PipelineError) -> Self {
        Self(value)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            PipelineError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            PipelineError::AlreadyRegistered(_) => StatusCode::CONFLICT,
            PipelineError::NotFound(_) => StatusCode::NOT_FOUND,
            PipelineError::CacheLoadFailed(StoreError::NotFound { .. }) => StatusCode::NOT_FOUND,
            PipelineError::CacheLoadFailed(StoreError::Backend(_)) => StatusCode::BAD_GATEWAY,
            PipelineError::PublishFailed(_) | PipelineError::BusDisconnected(_) => StatusCode::SERVICE_UNAVAILABLE,
            PipelineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match &self.0 {
            PipelineError::InvalidInput(_) => "INVALID_INPUT",
            PipelineError::AlreadyRegistered(_) => "ALREADY_REGISTERED",
            PipelineError::NotFound(_) => "NOT_FOUND",
            PipelineError::PublishFailed(_) => "PUBLISH_FAILED",
            PipelineError::BusDisconnected(_) => "BUS_DISCONNECTED",
            PipelineError::CacheLoadFailed(_) => "CACHE_LOAD_FAILED",
            PipelineError::Internal(_) => "INTERNAL",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self.0, "request failed");
        } else {
            warn!(error = %self.0, "request rejected");
        }
        let body = json!({
            "error": self.code(),
            "message": self.0.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn router(app_state: AppState) -> Router {
    Router::new()
        .route("/campaigns", post(register_handler))
        .route("/campaigns/{id}", get(lookup_handler).patch(update_registration_handler))
        .route("/campaigns/{id}/metrics", get(get_metrics_handler).post(update_metrics_handler))
        .route("/projects/{id}/campaigns", get(project_campaigns_handler))
        .route("/projects/{id}/boards", get(project_boards_handler))
        .route("/projects/{id}/live", get(live_handler))
        .route("/boards/{id}", get(board_handler))
        .route("/boards/{id}/assets", get(board_assets_handler))
        .route("/cache/invalidate/{kind}/{id}", post(invalidate_handler))
        .route("/cache/stats", get(cache_stats_handler))
        .route("/monitoring/start", post(start_monitoring_handler))
        .route("/monitoring/stop", post(stop_monitoring_handler))
        .route("/health", get(health_handler))
        .with_state(app_state)
}

pub async fn run(config: ServerConfig, app_state: AppState, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
    let app = router(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Downstream server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.recv().await.ok();
            info!("Downstream server shutting down.");
        })
        .await?;
    Ok(())
}

async fn register_handler(
    State(state): State<AppState>,
    Json(campaign): Json<NewCampaign>,
) -> ApiResult<(StatusCode, Json<Registered>)> {
    let registered = state.pipeline.register(campaign).await?;
    Ok((StatusCode::CREATED, Json(registered)))
}

async fn lookup_handler(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<CampaignRegistration>> {
    Ok(Json(state.pipeline.lookup(&id)?))
}

async fn update_registration_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<RegistrationUpdate>,
) -> ApiResult<Json<CampaignRegistration>> {
    Ok(Json(state.pipeline.update_registration(&id, update)?))
}

async fn update_metrics_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(sample): Json<MetricsSample>,
) -> ApiResult<Json<UpdateOutcome>> {
    Ok(Json(state.pipeline.update_metrics(&id, sample).await?))
}

async fn get_metrics_handler(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<CampaignMetrics>> {
    Ok(Json(state.pipeline.get_metrics(&id)?))
}

async fn project_campaigns_handler(State(state): State<AppState>, Path(id): Path<String>) -> Json<Vec<CampaignMetrics>> {
    Json(state.pipeline.get_project_campaigns(&id))
}

async fn project_boards_handler(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Vec<Board>>> {
    let boards = state.resolver.get_project_boards(&id).await?;
    Ok(Json(boards.iter().map(|board| board.as_ref().clone()).collect()))
}

async fn board_handler(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Board>> {
    let board = state.resolver.get_board(&id).await?;
    Ok(Json(board.as_ref().clone()))
}

async fn board_assets_handler(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Vec<Asset>>> {
    let assets = state.resolver.get_board_assets(&id).await?;
    Ok(Json(assets.iter().map(|asset| asset.as_ref().clone()).collect()))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidateQuery {
    /// Owning board of an asset; lets a created or moved asset refresh just
    /// that board's list.
    pub board_id: Option<String>,
}

async fn invalidate_handler(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
    Query(query): Query<InvalidateQuery>,
) -> ApiResult<StatusCode> {
    let kind: EntityKind = kind.parse().map_err(PipelineError::InvalidInput)?;
    match kind {
        EntityKind::Asset => state.resolver.invalidate_asset(&id, query.board_id.as_deref()),
        _ => state.resolver.invalidate(kind, &id),
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn cache_stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.resolver.stats())
}

async fn start_monitoring_handler(State(state): State<AppState>) -> Json<Value> {
    let started = state.pipeline.start_monitoring();
    Json(json!({ "started": started, "active": state.pipeline.is_monitoring() }))
}

async fn stop_monitoring_handler(State(state): State<AppState>) -> Json<Value> {
    let stopped = state.pipeline.stop_monitoring().await;
    Json(json!({ "stopped": stopped, "active": state.pipeline.is_monitoring() }))
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.pipeline.health_check().await;
    let status = match report.status {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
    };
    (status, Json(report))
}

#[derive(Debug, Default, Deserialize)]
pub struct LiveQuery {
    /// Comma separated event kinds, e.g. `budget_exceeded,metrics_updated`.
    pub kinds: Option<String>,
}

fn parse_kinds(raw: Option<&str>) -> Result<Option<HashSet<EventKind>>, PipelineError> {
    let Some(raw) = raw.filter(|raw| !raw.trim().is_empty()) else {
        return Ok(None);
    };
    raw.split(',')
        .map(|kind| {
            let kind = kind.trim();
            serde_json::from_value::<EventKind>(Value::String(kind.to_string()))
                .map_err(|_| PipelineError::InvalidInput(format!("unknown event kind '{}'", kind)))
        })
        .collect::<Result<HashSet<_>, _>>()
        .map(Some)
}

async fn live_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Query(query): Query<LiveQuery>,
) -> ApiResult<Response> {
    let kinds = parse_kinds(query.kinds.as_deref())?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, project_id, kinds)))
}

async fn handle_socket(mut socket: WebSocket, state: AppState, project_id: String, kinds: Option<HashSet<EventKind>>) {
    let mut subscription = state.pipeline.subscribe(&project_id, kinds);
    let mut shutdown = state.shutdown_signal();
    info!(project_id = %project_id, subscriber = subscription.id(), "live client connected");

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
            // Clients only ever send pings and close frames
            incoming = socket.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
            event = subscription.recv() => {
                let Some(event) = event else {
                    // Dropped for falling behind, or the bridge stopped
                    warn!(project_id = %project_id, subscriber = subscription.id(), "live stream ended by the bridge");
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                };
                match serde_json::to_string(event.as_ref()) {
                    Ok(json_str) => {
                        if socket.send(Message::Text(json_str.into())).await.is_err() {
                            break; // client disconnected
                        }
                    }
                    Err(e) => error!(error = %e, "failed to encode live event"),
                }
            }
        }
    }

    info!(project_id = %project_id, subscriber = subscription.id(), "live client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::campaign_logic::state::seed_demo_entities;
    use lib_campaign::{CachedResolver, CampaignPipeline, InMemoryBus, InMemoryStore, PipelineSettings, Platform};
    use std::sync::Arc;

    async fn test_state() -> AppState {
        let settings = PipelineSettings {
            lane_count: 2,
            ..PipelineSettings::default()
        };
        let store = Arc::new(InMemoryStore::new());
        seed_demo_entities(&store, "P1");
        let resolver = Arc::new(CachedResolver::new(store, settings.cache.clone()));
        let pipeline = CampaignPipeline::start(settings, Arc::new(InMemoryBus::default())).await;
        let (shutdown_tx, _) = broadcast::channel(1);
        AppState::new(pipeline, resolver, shutdown_tx)
    }

    fn campaign(id: &str) -> NewCampaign {
        NewCampaign {
            campaign_id: id.to_string(),
            project_id: "P1".to_string(),
            campaign_name: String::new(),
            platform: Platform::Meta,
            budget_limit: 1000.0,
            thresholds: None,
        }
    }

    #[test]
    fn errors_map_to_status_codes() {
        let cases = [
            (PipelineError::InvalidInput("x".into()), StatusCode::BAD_REQUEST),
            (PipelineError::AlreadyRegistered("x".into()), StatusCode::CONFLICT),
            (PipelineError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (
                PipelineError::CacheLoadFailed(StoreError::NotFound {
                    kind: EntityKind::Board,
                    id: "b".into(),
                }),
                StatusCode::NOT_FOUND,
            ),
            (PipelineError::BusDisconnected("x".into()), StatusCode::SERVICE_UNAVAILABLE),
            (PipelineError::Internal("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (error, expected) in cases {
            assert_eq!(ApiError(error).into_response().status(), expected);
        }
    }

    #[test]
    fn live_kinds_parse_from_query() {
        assert_eq!(parse_kinds(None).unwrap(), None);
        assert_eq!(parse_kinds(Some("  ")).unwrap(), None);
        let kinds = parse_kinds(Some("budget_exceeded, metrics_updated")).unwrap().unwrap();
        assert_eq!(kinds, HashSet::from([EventKind::BudgetExceeded, EventKind::MetricsUpdated]));
        assert!(matches!(parse_kinds(Some("bogus")), Err(PipelineError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn register_update_and_read_back() {
        let state = test_state().await;

        let (status, Json(registered)) = register_handler(State(state.clone()), Json(campaign("C1")))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(registered.registration.campaign_name, "C1");

        let conflict = register_handler(State(state.clone()), Json(campaign("C1"))).await.unwrap_err();
        assert_eq!(conflict.status(), StatusCode::CONFLICT);

        let sample = MetricsSample {
            impressions: Some(10_000),
            clicks: Some(500),
            spend: Some(250.0),
            conversions: Some(20),
            revenue: Some(1_250.0),
        };
        let Json(outcome) = update_metrics_handler(State(state.clone()), Path("C1".to_string()), Json(sample))
            .await
            .unwrap();
        assert_eq!(outcome.metrics.ctr, 5.0);

        let Json(metrics) = get_metrics_handler(State(state.clone()), Path("C1".to_string())).await.unwrap();
        assert_eq!(metrics.roas, 5.0);
        let Json(listed) = project_campaigns_handler(State(state.clone()), Path("P1".to_string())).await;
        assert_eq!(listed.len(), 1);

        let missing = get_metrics_handler(State(state.clone()), Path("nope".to_string())).await.unwrap_err();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        state.pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn board_reads_and_invalidation() {
        let state = test_state().await;

        let Json(assets) = board_assets_handler(State(state.clone()), Path("demo-board-summer".to_string()))
            .await
            .unwrap();
        assert_eq!(assets.len(), 3);
        let Json(boards) = project_boards_handler(State(state.clone()), Path("P1".to_string())).await.unwrap();
        assert_eq!(boards.len(), 2);

        let status = invalidate_handler(
            State(state.clone()),
            Path(("asset".to_string(), assets[0].id.clone())),
            Query(InvalidateQuery::default()),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);

        board_assets_handler(State(state.clone()), Path("demo-board-summer".to_string())).await.unwrap();
        board_assets_handler(State(state.clone()), Path("demo-board-launch".to_string())).await.unwrap();
        invalidate_handler(
            State(state.clone()),
            Path(("asset".to_string(), "fresh-asset".to_string())),
            Query(InvalidateQuery {
                board_id: Some("demo-board-launch".to_string()),
            }),
        )
        .await
        .unwrap();
        let cache = state.resolver.cache();
        assert!(cache.get_board_assets("demo-board-launch").is_none());
        assert!(cache.get_board_assets("demo-board-summer").is_some());

        let bad = invalidate_handler(
            State(state.clone()),
            Path(("widget".to_string(), "x".to_string())),
            Query(InvalidateQuery::default()),
        )
        .await
        .unwrap_err();
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);

        let missing = board_handler(State(state.clone()), Path("ghost".to_string())).await.unwrap_err();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        state.pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn health_reports_ok_on_a_connected_bus() {
        let state = test_state().await;
        let response = health_handler(State(state.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        state.pipeline.shutdown().await;
    }
}
