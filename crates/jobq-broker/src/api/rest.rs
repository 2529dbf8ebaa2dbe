use crate::Broker;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use jobq_core::{
    BrokerQueue, JobError, JobId, JobOutcome, JobRecord, JobState, QueueDepth, ResultStore,
    WEATHER_HANDLER,
};
use jobq_worker::{CityWeather, Region, WeatherReport, WeatherRequest};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// REST API routes
pub fn create_rest_api(broker: Arc<Broker>) -> Router {
    Router::new()
        .route("/jobs", post(submit_job))
        .route("/jobs/:id", get(get_job))
        .route("/jobs/:id/result", get(get_job_result))
        .route("/weather", post(submit_weather))
        .route("/weather/regions/:region", get(get_region_weather))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(broker)
}

#[derive(Debug, Deserialize)]
struct SubmitJobRequest {
    handler_name: String,
    #[serde(default)]
    payload: Value,
    max_attempts: Option<u32>,
}

#[derive(Debug, Serialize)]
struct SubmitJobResponse {
    id: JobId,
    state: JobState,
}

#[derive(Debug, Serialize)]
struct JobView {
    id: JobId,
    handler_name: String,
    state: JobState,
    attempt: u32,
    max_attempts: u32,
    runs: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<JobRecord> for JobView {
    fn from(record: JobRecord) -> Self {
        JobView {
            state: record.current_state(),
            id: record.id,
            handler_name: record.handler_name,
            attempt: record.attempt,
            max_attempts: record.max_attempts,
            runs: record.runs,
            result: record.result,
            error: record.error,
            last_error: record.last_error,
            retry_at: record.retry_at,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
struct JobResultResponse {
    id: JobId,
    #[serde(flatten)]
    outcome: JobOutcome,
}

#[derive(Debug, Serialize)]
struct RegionWeather {
    job_id: JobId,
    #[serde(flatten)]
    weather: CityWeather,
}

#[derive(Debug, Serialize)]
struct RegionWeatherResponse {
    region: Region,
    results: Vec<RegionWeather>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    queue: QueueDepth,
}

/// Submit a job for any registered handler
async fn submit_job(
    State(broker): State<Arc<Broker>>,
    Json(req): Json<SubmitJobRequest>,
) -> Result<(StatusCode, Json<SubmitJobResponse>), ApiError> {
    let dispatcher = broker.dispatcher();
    let max_attempts = req
        .max_attempts
        .unwrap_or_else(|| dispatcher.default_max_attempts());

    let id = dispatcher
        .submit_with(&req.handler_name, req.payload, max_attempts)
        .await?;

    Ok(accepted(id))
}

/// Submit a weather lookup for a list of cities
async fn submit_weather(
    State(broker): State<Arc<Broker>>,
    Json(req): Json<WeatherRequest>,
) -> Result<(StatusCode, Json<SubmitJobResponse>), ApiError> {
    req.validate().map_err(ApiError::BadRequest)?;

    let payload = serde_json::to_value(&req).map_err(JobError::from)?;
    let id = broker.dispatcher().submit(WEATHER_HANDLER, payload).await?;

    Ok(accepted(id))
}

fn accepted(id: JobId) -> (StatusCode, Json<SubmitJobResponse>) {
    (
        StatusCode::ACCEPTED,
        Json(SubmitJobResponse {
            id,
            state: JobState::Pending,
        }),
    )
}

async fn get_job(
    State(broker): State<Arc<Broker>>,
    Path(id): Path<JobId>,
) -> Result<Json<JobView>, ApiError> {
    let record = broker.dispatcher().get_record(&id).await?;
    Ok(Json(JobView::from(record)))
}

async fn get_job_result(
    State(broker): State<Arc<Broker>>,
    Path(id): Path<JobId>,
) -> Result<Json<JobResultResponse>, ApiError> {
    let outcome = broker.dispatcher().get_result(&id).await?;
    Ok(Json(JobResultResponse { id, outcome }))
}

/// Cities of one region across every live, succeeded weather job
async fn get_region_weather(
    State(broker): State<Arc<Broker>>,
    Path(region): Path<String>,
) -> Result<Json<RegionWeatherResponse>, ApiError> {
    let region: Region = region.parse().map_err(ApiError::BadRequest)?;
    let records = broker
        .store()
        .list(WEATHER_HANDLER, JobState::Succeeded)
        .await?;

    let mut results = Vec::new();
    for record in records {
        let Some(result) = record.result else {
            continue;
        };
        match serde_json::from_value::<WeatherReport>(result) {
            Ok(report) => results.extend(report.in_region(region).map(|weather| RegionWeather {
                job_id: record.id,
                weather: weather.clone(),
            })),
            Err(e) => {
                tracing::debug!(job_id = %record.id, "Skipping unreadable weather result: {}", e)
            }
        }
    }

    Ok(Json(RegionWeatherResponse { region, results }))
}

/// Health check endpoint
async fn health_check(State(broker): State<Arc<Broker>>) -> Result<Json<HealthResponse>, ApiError> {
    let queue = broker.queue().depth().await?;

    Ok(Json(HealthResponse {
        status: "healthy".to_string(),
        queue,
    }))
}

/// API error types
#[derive(Debug)]
enum ApiError {
    NotFound(String),
    BadRequest(String),
    NotReady { message: String, state: JobState },
    Unavailable(String),
    Internal(String),
}

impl From<JobError> for ApiError {
    fn from(e: JobError) -> Self {
        let message = e.to_string();
        match e {
            JobError::NotFound(_) | JobError::Expired(_) => ApiError::NotFound(message),
            JobError::NotReady { state, .. } => ApiError::NotReady { message, state },
            JobError::UnknownHandler(_) | JobError::InvalidEnvelope(_) => {
                ApiError::BadRequest(message)
            }
            JobError::BrokerUnavailable(_) => ApiError::Unavailable(message),
            _ => ApiError::Internal(message),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, serde_json::json!({ "error": msg })),
            ApiError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, serde_json::json!({ "error": msg }))
            }
            ApiError::NotReady { message, state } => (
                StatusCode::CONFLICT,
                serde_json::json!({ "error": message, "state": state }),
            ),
            ApiError::Unavailable(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                serde_json::json!({ "error": msg }),
            ),
            ApiError::Internal(msg) => {
                tracing::error!("Request failed: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    serde_json::json!({ "error": msg }),
                )
            }
        };

        (status, Json(body)).into_response()
    }
}
