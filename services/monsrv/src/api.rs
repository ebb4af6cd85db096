//! HTTP API
//!
//! Read access to the cached device data and the monitor history, a
//! server-sent event stream of monitor records and the heat pump control
//! endpoint. Query flags are present-or-true: `?latest`, `?latest=true`
//! and `?latest=1` all count, `false` and `0` do not.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::context::AppContext;
use crate::devices::{
    ControllerState, FroniusSymoValues, GridMeterSample, HeatpumpMode, Nibe1155Values, NibeQuery,
    SymoBlocks,
};
use crate::error::{DecodeError, DeviceError};
use crate::monitor::{Health, MonitorState};
use crate::record::MonitorRecord;
use crate::registers::RegisterId;
use crate::statistics::StatisticsSnapshot;

type Params = Query<Vec<(String, String)>>;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub ts: DateTime<Utc>,
}

/// API error with its HTTP status
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Device(DeviceError),
}

impl From<DeviceError> for ApiError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::Decode(e) => e.into(),
            e @ DeviceError::NotWritable(_) => ApiError::BadRequest(e.to_string()),
            other => ApiError::Device(other),
        }
    }
}

impl From<DecodeError> for ApiError {
    fn from(err: DecodeError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Device(e @ DeviceError::NotReady(_)) => {
                (StatusCode::SERVICE_UNAVAILABLE, e.to_string())
            },
            ApiError::Device(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        };
        let body = Json(ErrorResponse {
            error,
            ts: Utc::now(),
        });
        (status, body).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn flag(params: &[(String, String)], name: &str) -> bool {
    params
        .iter()
        .any(|(key, value)| key == name && !matches!(value.as_str(), "false" | "0"))
}

pub fn create_router(context: Arc<AppContext>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/data/monitor", get(get_monitor))
        .route("/data/monitor/stream", get(stream_monitor))
        .route("/data/froniussymo", get(get_fronius_symo))
        .route("/data/froniusmeter", get(get_fronius_meter))
        .route("/data/nibe1155", get(get_nibe1155))
        .route("/data/statistics", get(get_statistics))
        .route("/control/heatpumpmode", post(post_heatpump_mode))
        .route("/control/loglevel", get(get_log_level).post(post_log_level))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(context)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub monitor: MonitorState,
    pub health: Health,
    pub subscribers: usize,
    pub history: usize,
}

async fn health(State(ctx): State<Arc<AppContext>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        monitor: ctx.monitor.state(),
        health: ctx.monitor.health(),
        subscribers: ctx.feed.subscriber_count(),
        history: ctx.monitor.history().len(),
    })
}

/// `GET /data/monitor[?latest]`, oldest first
async fn get_monitor(
    State(ctx): State<Arc<AppContext>>,
    Query(params): Params,
) -> Json<Vec<Arc<MonitorRecord>>> {
    if flag(&params, "latest") {
        Json(ctx.monitor.latest().into_iter().collect())
    } else {
        Json(ctx.monitor.history())
    }
}

/// `GET /data/monitor/stream`; the connection is a feed subscriber
async fn stream_monitor(
    State(ctx): State<Arc<AppContext>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    info!("Monitor stream opened");
    let subscription = ctx.feed.subscribe();
    let stream = futures::stream::unfold(subscription, |mut subscription| async move {
        let record = subscription.recv().await?;
        let event = Event::default()
            .event("record")
            .json_data(&*record)
            .unwrap_or_else(|e| {
                warn!("Monitor record not serializable: {}", e);
                Event::default().event("error").data(e.to_string())
            });
        Some((Ok::<_, Infallible>(event), subscription))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// `GET /data/froniussymo?<block flags>`
async fn get_fronius_symo(
    State(ctx): State<Arc<AppContext>>,
    Query(params): Params,
) -> ApiResult<FroniusSymoValues> {
    let symo = ctx
        .symo
        .as_ref()
        .ok_or_else(|| ApiError::NotFound("froniusSymo not configured".to_string()))?;
    let blocks = SymoBlocks::from_flags(
        params
            .iter()
            .filter(|(key, _)| flag(&params, key))
            .map(|(key, _)| key.as_str()),
    )
    .map_err(ApiError::BadRequest)?;
    Ok(Json(symo.snapshot(blocks)))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FroniusMeterResponse {
    pub latest: Option<GridMeterSample>,
    pub history: Vec<GridMeterSample>,
}

/// `GET /data/froniusmeter`
async fn get_fronius_meter(State(ctx): State<Arc<AppContext>>) -> ApiResult<FroniusMeterResponse> {
    let meter = ctx
        .grid_meter
        .as_ref()
        .ok_or_else(|| ApiError::NotFound("gridMeter not configured".to_string()))?;
    Ok(Json(FroniusMeterResponse {
        latest: meter.latest(),
        history: meter.history(),
    }))
}

/// `GET /data/nibe1155?completeValues&simpleValues&controller&id=..`
///
/// Without any block flag every block is returned.
async fn get_nibe1155(
    State(ctx): State<Arc<AppContext>>,
    Query(params): Params,
) -> ApiResult<Nibe1155Values> {
    let nibe = ctx
        .nibe
        .as_ref()
        .ok_or_else(|| ApiError::NotFound("nibe1155 not configured".to_string()))?;

    let ids = params
        .iter()
        .filter(|(key, _)| key == "id")
        .map(|(_, value)| {
            value
                .parse::<u16>()
                .map(RegisterId)
                .map_err(|_| ApiError::BadRequest(format!("invalid id '{}'", value)))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut query = NibeQuery {
        complete_values: flag(&params, "completeValues"),
        simple_values: flag(&params, "simpleValues"),
        controller: flag(&params, "controller"),
        ids: (!ids.is_empty()).then_some(ids),
    };
    if !query.complete_values && !query.simple_values && !query.controller {
        query.complete_values = true;
        query.simple_values = true;
        query.controller = true;
    }
    Ok(Json(nibe.snapshot(&query)?))
}

/// `GET /data/statistics`
async fn get_statistics(State(ctx): State<Arc<AppContext>>) -> Json<StatisticsSnapshot> {
    Json(ctx.statistics.snapshot())
}

/// `POST /control/heatpumpmode`
async fn post_heatpump_mode(
    State(ctx): State<Arc<AppContext>>,
    Json(mode): Json<HeatpumpMode>,
) -> ApiResult<ControllerState> {
    let nibe = ctx
        .nibe
        .as_ref()
        .ok_or_else(|| ApiError::NotFound("nibe1155 not configured".to_string()))?;
    info!("Heat pump mode requested: {:?}", mode);
    let state = nibe.write_heatpump_mode(&mode).await?;
    Ok(Json(state))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LogLevel {
    pub level: String,
}

async fn get_log_level() -> Json<LogLevel> {
    Json(LogLevel {
        level: common::get_log_level(),
    })
}

/// Replace the log filter at runtime, e.g. `info,monsrv=debug`
async fn post_log_level(Json(request): Json<LogLevel>) -> ApiResult<LogLevel> {
    common::set_log_level(&request.level).map_err(ApiError::BadRequest)?;
    info!("Log level set to {}", request.level);
    Ok(Json(request))
}
