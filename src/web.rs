use std::io;

use axum::{
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::codec::{CodecError, FrameInput};
use crate::config::Config;
use crate::pump::CONTENT_TYPE;
use crate::relay::{FrameRelay, MjpegResponse, RelayError};
use crate::stats::RelayStatsSnapshot;
use crate::store::{StoreError, StoreStats, StreamInfo};

/// Web server state
#[derive(Clone)]
pub struct AppState {
    relay: FrameRelay,
}

/// Build the HTTP router
pub fn router(relay: FrameRelay) -> Router {
    // Base64 text is a third larger than the bytes it carries; leave room
    // for JSON and multipart framing as well.
    let body_limit = relay.codec().max_frame_bytes + 64 * 1024;
    let state = AppState { relay };

    Router::new()
        .route("/", get(home_handler))
        .route("/health", get(health_handler))
        .route("/api/stats", get(stats_handler))
        .route("/api/streams", get(streams_handler))
        .route("/send_frame_from_string/:id", post(send_string_handler))
        .route("/send_frame_from_file/:id", post(send_file_handler))
        .route("/send_frame_from_bytes/:id", post(send_bytes_handler))
        .route("/video_feed/:id", get(video_feed_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the web server
pub async fn run_server(config: &Config, relay: FrameRelay) -> anyhow::Result<()> {
    let app = router(relay);

    let addr = config.bind_addr();
    info!("Starting web server on http://{}", addr);

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

impl IntoResponse for MjpegResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from_stream(self.body));
        *response.status_mut() = self.status;
        response.headers_mut().extend(self.headers);
        response
            .headers_mut()
            .insert(header::CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE));
        response
    }
}

/// Error returned by the HTTP handlers
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Relay(RelayError),
}

impl From<RelayError> for ApiError {
    fn from(e: RelayError) -> Self {
        ApiError::Relay(e)
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Relay(e) => {
                let status = match &e {
                    RelayError::Codec(CodecError::TooLarge { .. })
                    | RelayError::Store(StoreError::PayloadTooLarge { .. }) => {
                        StatusCode::PAYLOAD_TOO_LARGE
                    }
                    RelayError::Store(StoreError::CapacityExhausted(_)) => {
                        StatusCode::INSUFFICIENT_STORAGE
                    }
                    RelayError::Codec(_) | RelayError::Pump(_) => StatusCode::BAD_REQUEST,
                };
                (status, e.to_string())
            }
        };

        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

/// Liveness handler
async fn home_handler() -> Json<[&'static str; 1]> {
    Json(["ok"])
}

/// Health check response
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Health check handler
async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Stats API response
#[derive(Serialize)]
struct StatsResponse {
    store: StoreStats,
    relay: RelayStatsSnapshot,
}

async fn stats_handler(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        store: state.relay.store().stats(),
        relay: state.relay.stats().snapshot(),
    })
}

async fn streams_handler(State(state): State<AppState>) -> Json<Vec<StreamInfo>> {
    Json(state.relay.store().streams())
}

/// JSON body of `send_frame_from_string`
#[derive(Deserialize)]
struct InputImg {
    img_base64str: String,
}

/// Response of the upload handlers
#[derive(Serialize)]
struct SendResponse {
    stream_id: String,
    seq: u64,
}

async fn send_string_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<InputImg>,
) -> Result<Json<SendResponse>, ApiError> {
    let seq = state
        .relay
        .send_frame(&id, FrameInput::Base64(input.img_base64str))
        .await?;
    Ok(Json(SendResponse { stream_id: id, seq }))
}

async fn send_file_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    mut multipart: Multipart,
) -> Result<Json<SendResponse>, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?
    {
        if field.name() != Some("file") && field.file_name().is_none() {
            continue;
        }

        let upload = field
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
            .boxed();
        let seq = state.relay.send_frame(&id, FrameInput::Upload(upload)).await?;
        return Ok(Json(SendResponse { stream_id: id, seq }));
    }

    Err(ApiError::BadRequest("missing file field".to_string()))
}

async fn send_bytes_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<SendResponse>, ApiError> {
    let seq = state.relay.send_frame(&id, FrameInput::Raw(body)).await?;
    Ok(Json(SendResponse { stream_id: id, seq }))
}

/// Query of `video_feed`
#[derive(Deserialize)]
struct FeedQuery {
    freq: Option<f64>,
}

async fn video_feed_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<FeedQuery>,
) -> Result<MjpegResponse, ApiError> {
    let mut options = state.relay.default_options();
    if let Some(freq) = query.freq {
        options.freq = freq;
    }
    Ok(state.relay.get_stream(&id, options)?)
}
