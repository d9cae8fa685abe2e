//! HTTP API endpoints

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tidedb_core::service::{
    GetRequest, GetResponse, PutPoint, PutRequest, PutResponse, ServiceStats, TideService,
};
use tidedb_core::shard::ShardState;
use tidedb_core::{ShardId, TideError};
use tower::ServiceBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state
pub type AppState = Arc<TideService>;

/// Create the API router
pub fn create_router(service: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health check
        .route("/health", get(health))
        .route("/ping", get(ping))
        // Writes: JSON batches and line protocol
        .route("/put", post(put))
        .route("/write", post(write))
        // Reads
        .route("/get", post(get_points))
        // Stats
        .route("/stats", get(stats))
        .route("/metrics", get(metrics))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CompressionLayer::new())
                .layer(cors),
        )
        .with_state(service)
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct WriteParams {
    /// Shard for lines without a `shard` tag
    shard: Option<ShardId>,
    /// Timestamp precision: s (default), ms, us or ns
    precision: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub time: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Errors returned by the handlers
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Tide(#[from] TideError),

    #[error("{0}")]
    BadRequest(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Tide(e) => match e {
                TideError::ShardNotFound(_) => StatusCode::NOT_FOUND,
                TideError::NotOwned(_) => StatusCode::MISDIRECTED_REQUEST,
                TideError::ShardInProgress(_) => StatusCode::SERVICE_UNAVAILABLE,
                TideError::InvalidBucket { .. }
                | TideError::TimestampTooClose { .. }
                | TideError::BucketFull
                | TideError::BucketExpired(_)
                | TideError::BucketFinalized(_) => StatusCode::UNPROCESSABLE_ENTITY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        }
        (status, Json(ErrorResponse { error: self.to_string() })).into_response()
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: tidedb_core::VERSION.to_string(),
        time: chrono::Utc::now().to_rfc3339(),
    })
}

async fn ping() -> &'static str {
    "pong"
}

async fn put(
    State(service): State<AppState>,
    Json(request): Json<PutRequest>,
) -> Result<Json<PutResponse>, ApiError> {
    Ok(Json(service.put(&request)?))
}

async fn write(
    State(service): State<AppState>,
    Query(params): Query<WriteParams>,
    body: String,
) -> Result<Json<PutResponse>, ApiError> {
    let precision = params.precision.as_deref().unwrap_or("s");
    let points = parse_line_protocol(&body, params.shard, precision).map_err(ApiError::BadRequest)?;

    Ok(Json(service.put(&PutRequest { points })?))
}

async fn get_points(
    State(service): State<AppState>,
    Json(request): Json<GetRequest>,
) -> Result<Json<GetResponse>, ApiError> {
    Ok(Json(service.get(&request)?))
}

async fn stats(State(service): State<AppState>) -> Json<ServiceStats> {
    Json(service.stats())
}

async fn metrics(State(service): State<AppState>) -> String {
    let stats = service.stats();

    // Prometheus format
    let mut output = String::new();
    output.push_str("# HELP tidedb_series_total Total number of series\n");
    output.push_str("# TYPE tidedb_series_total gauge\n");
    output.push_str(&format!("tidedb_series_total {}\n", stats.series));

    output.push_str("# HELP tidedb_shard_owned Whether the shard is fully owned\n");
    output.push_str("# TYPE tidedb_shard_owned gauge\n");
    for shard in &stats.shards {
        let owned = u8::from(shard.state == ShardState::Owned);
        output.push_str(&format!(
            "tidedb_shard_owned{{shard=\"{}\"}} {}\n",
            shard.shard_id, owned
        ));
    }

    output.push_str("# HELP tidedb_active_points Points in open buckets\n");
    output.push_str("# TYPE tidedb_active_points gauge\n");
    for shard in &stats.shards {
        output.push_str(&format!(
            "tidedb_active_points{{shard=\"{}\"}} {}\n",
            shard.shard_id, shard.active_points
        ));
    }

    output.push_str("# HELP tidedb_cold_series Series not read within the retained window\n");
    output.push_str("# TYPE tidedb_cold_series gauge\n");
    for shard in &stats.shards {
        output.push_str(&format!(
            "tidedb_cold_series{{shard=\"{}\"}} {}\n",
            shard.shard_id, shard.cold_series
        ));
    }

    output.push_str("# HELP tidedb_storage_bytes Block bytes held for closed buckets\n");
    output.push_str("# TYPE tidedb_storage_bytes gauge\n");
    for shard in &stats.shards {
        output.push_str(&format!(
            "tidedb_storage_bytes{{shard=\"{}\"}} {}\n",
            shard.shard_id, shard.storage.bytes
        ));
    }

    output
}

// ============================================================================
// Line Protocol Parser
// ============================================================================

fn parse_line_protocol(
    data: &str,
    default_shard: Option<ShardId>,
    precision: &str,
) -> Result<Vec<PutPoint>, String> {
    let divisor = match precision {
        "s" => 1,
        "ms" => 1_000,
        "us" | "u" => 1_000_000,
        "ns" => 1_000_000_000,
        _ => return Err(format!("Unknown precision: {}", precision)),
    };

    let mut points = Vec::new();
    for line in data.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        points.push(parse_line(line, default_shard, divisor)?);
    }

    Ok(points)
}

fn parse_line(line: &str, default_shard: Option<ShardId>, divisor: i64) -> Result<PutPoint, String> {
    // Format: key,shard=1,category=3 value=23.5 1609459200
    let parts: Vec<&str> = line.splitn(3, ' ').collect();
    if parts.len() < 2 {
        return Err(format!("Invalid line format: {}", line));
    }

    let mut key_tags = parts[0].split(',');
    let key = key_tags.next().filter(|k| !k.is_empty()).ok_or("Missing key")?;

    let mut shard_id = default_shard;
    let mut category = None;
    for tag in key_tags {
        match tag.split_once('=') {
            Some(("shard", v)) => {
                shard_id = Some(v.parse().map_err(|_| format!("Invalid shard: {}", v))?)
            }
            Some(("category", v)) => {
                category = Some(v.parse().map_err(|_| format!("Invalid category: {}", v))?)
            }
            _ => return Err(format!("Unknown tag: {}", tag)),
        }
    }
    let shard_id = shard_id.ok_or_else(|| format!("No shard for {}", key))?;

    let value = match parts[1].split_once('=') {
        Some(("value", v)) => v
            .parse::<f64>()
            .map_err(|_| format!("Invalid field value: {}", v))?,
        _ => return Err(format!("Expected value field, got {}", parts[1])),
    };

    let timestamp = match parts.get(2) {
        Some(ts) => {
            ts.trim()
                .parse::<i64>()
                .map_err(|_| format!("Invalid timestamp: {}", ts))?
                / divisor
        }
        None => chrono::Utc::now().timestamp(),
    };

    Ok(PutPoint {
        key: key.to_string(),
        shard_id,
        timestamp,
        value,
        category,
    })
}
