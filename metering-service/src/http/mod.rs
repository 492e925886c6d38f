//! JSON API over the billing engine, on-demand polls and the cycle trigger.

use std::{net::SocketAddr, sync::Arc};

use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use metering_client::domain::MeterKind;
use serde::Deserialize;
use serde_json::{json, Value};
use time::{OffsetDateTime, UtcOffset};
use tokio_util::sync::CancellationToken;

use crate::{
    billing::{period::parse_date, rate, room_charges, usage_series, BillingMonth},
    gateway::DeviceGateway,
    ingest::{self, PollSettings, RelayError},
    scheduler::{BillingScheduler, CycleOutcome, RunOptions},
    store::{MeteringStore, StoreError},
};

/// Parallel polls for an admin-triggered cycle when the request names none.
pub const ADMIN_RUN_PARALLEL: usize = 5;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn MeteringStore>,
    pub gateway: Arc<dyn DeviceGateway>,
    pub scheduler: Arc<BillingScheduler>,
    pub utc_offset: UtcOffset,
    pub poll: PollSettings,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Upstream(String),
    #[error("{0}")]
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl From<RelayError> for ApiError {
    fn from(e: RelayError) -> Self {
        match e {
            RelayError::NoDevice(_) => ApiError::NotFound(e.to_string()),
            RelayError::Gateway(_) => ApiError::Upstream(e.to_string()),
            RelayError::Store(e) => e.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/buildings/:building_id/electric/charges", get(electric_charges))
        .route("/api/buildings/:building_id/water/charges", get(water_charges))
        .route("/api/buildings/:building_id/utility-rate", get(utility_rate))
        .route("/api/buildings/:building_id/rooms/:room/usage/series", get(room_usage_series))
        .route("/api/buildings/:building_id/rooms/:room/pull", post(pull_room))
        .route("/api/buildings/:building_id/rooms/:room/relay", post(relay))
        .route("/api/admin/metering/run", post(admin_run))
        .with_state(state)
}

/// Serves the API until `shutdown` fires.
pub async fn serve(bind_addr: &str, state: AppState, shutdown: CancellationToken) -> anyhow::Result<()> {
    let addr: SocketAddr = bind_addr
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid http.bind_addr '{bind_addr}': {e}"))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "HTTP API listening");
    axum::serve(listener, router(state).into_make_service())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

fn parse_building(raw: &str) -> Result<i32, ApiError> {
    match raw.parse::<i32>() {
        Ok(id) if id > 0 => Ok(id),
        _ => Err(ApiError::BadRequest(format!("invalid building id '{raw}'"))),
    }
}

fn month_or_current(raw: Option<&str>, offset: UtcOffset) -> Result<BillingMonth, ApiError> {
    match raw {
        Some(m) => m.parse().map_err(|e: crate::billing::PeriodError| ApiError::BadRequest(e.to_string())),
        None => Ok(BillingMonth::containing(OffsetDateTime::now_utc(), offset)),
    }
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct MonthQuery {
    month: Option<String>,
}

async fn electric_charges(
    State(state): State<AppState>,
    Path(building_id): Path<String>,
    Query(q): Query<MonthQuery>,
) -> ApiResult<Value> {
    charges(state, &building_id, q.month.as_deref(), MeterKind::Electric).await
}

async fn water_charges(
    State(state): State<AppState>,
    Path(building_id): Path<String>,
    Query(q): Query<MonthQuery>,
) -> ApiResult<Value> {
    charges(state, &building_id, q.month.as_deref(), MeterKind::Water).await
}

async fn charges(state: AppState, building_id: &str, month: Option<&str>, kind: MeterKind) -> ApiResult<Value> {
    let building_id = parse_building(building_id)?;
    let month = month_or_current(month, state.utc_offset)?;
    metrics::counter!("http_charge_requests_total", "kind" => kind.as_str()).increment(1);

    let sheet = room_charges(state.store.as_ref(), building_id, month, kind, state.utc_offset).await?;
    Ok(Json(sheet.to_json()))
}

#[derive(Debug, Deserialize)]
struct DateQuery {
    date: Option<String>,
}

async fn utility_rate(
    State(state): State<AppState>,
    Path(building_id): Path<String>,
    Query(q): Query<DateQuery>,
) -> ApiResult<Value> {
    let building_id = parse_building(&building_id)?;
    let as_of = match q.date.as_deref() {
        Some(d) => parse_date(d).map_err(|e| ApiError::BadRequest(e.to_string()))?,
        None => OffsetDateTime::now_utc().to_offset(state.utc_offset).date(),
    };

    let rate = rate::resolve(state.store.as_ref(), building_id, as_of).await?;
    Ok(Json(json!({
        "buildingId": building_id,
        "date": as_of.to_string(),
        "electricUnitPrice": rate.electric_per_kwh,
        "waterUnitPrice": rate.water_per_liter,
        "effectiveDate": rate.effective_date.map(|d| d.to_string()),
    })))
}

#[derive(Debug, Deserialize)]
struct SeriesQuery {
    months: Option<String>,
}

async fn room_usage_series(
    State(state): State<AppState>,
    Path((building_id, room)): Path<(String, String)>,
    Query(q): Query<SeriesQuery>,
) -> ApiResult<Value> {
    let building_id = parse_building(&building_id)?;
    let months = match q.months.as_deref() {
        Some(raw) => raw
            .parse::<u32>()
            .map_err(|_| ApiError::BadRequest(format!("invalid months '{raw}'")))?,
        None => 6,
    };

    let series = usage_series(
        state.store.as_ref(),
        building_id,
        &room,
        months,
        OffsetDateTime::now_utc(),
        state.utc_offset,
    )
    .await?;
    Ok(Json(json!({ "roomNumber": room, "months": series })))
}

async fn pull_room(
    State(state): State<AppState>,
    Path((building_id, room)): Path<(String, String)>,
) -> ApiResult<Value> {
    let building_id = parse_building(&building_id)?;
    let summary = ingest::poll_room(state.store.clone(), state.gateway.clone(), building_id, &room, &state.poll).await?;
    if summary.scanned == 0 {
        return Err(ApiError::NotFound(format!("room {room} has no active meters")));
    }
    Ok(Json(json!(summary)))
}

#[derive(Debug, Deserialize)]
struct RelayRequest {
    on: bool,
}

async fn relay(
    State(state): State<AppState>,
    Path((building_id, room)): Path<(String, String)>,
    body: Result<Json<RelayRequest>, JsonRejection>,
) -> ApiResult<Value> {
    let building_id = parse_building(&building_id)?;
    let Json(req) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;

    let outcome = ingest::set_relay(state.store.as_ref(), state.gateway.as_ref(), building_id, &room, req.on).await?;
    Ok(Json(json!(outcome)))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunRequest {
    building_id: Option<i32>,
    dry_run: Option<bool>,
    parallel: Option<usize>,
}

async fn admin_run(State(state): State<AppState>, body: Bytes) -> ApiResult<Value> {
    let req: RunRequest = if body.iter().all(u8::is_ascii_whitespace) {
        RunRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(format!("invalid run request: {e}")))?
    };
    if let Some(id) = req.building_id.filter(|id| *id <= 0) {
        return Err(ApiError::BadRequest(format!("invalid building id '{id}'")));
    }

    let opts = RunOptions {
        building: req.building_id,
        dry_run: req.dry_run,
        parallel: Some(req.parallel.unwrap_or(ADMIN_RUN_PARALLEL)),
    };
    match state
        .scheduler
        .run_once(opts)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
    {
        CycleOutcome::Completed(summary) => Ok(Json(json!(summary))),
        CycleOutcome::Skipped => Err(ApiError::Conflict("a metering cycle is already running".to_string())),
    }
}
