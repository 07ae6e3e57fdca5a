//! HTTP adapters: live feeds, frame and detection push, snapshots, health.

use crate::camera_manager::{ConnectionError, ConnectionManager, ConnectionStats};
use crate::config::ServerConfig;
use crate::encoder::FrameEncoder;
use crate::frame::{CameraKey, Detection, DetectionEvent, Frame};
use crate::hub::FrameHub;
use crate::overlay::OverlayRenderer;
use crate::relay::{ClientRelay, RelayRequest, ResponseSink, SinkSignal, WriteStatus};
use anyhow::{Context, Result};
use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<FrameHub>,
    pub manager: Arc<ConnectionManager>,
    pub renderer: Arc<dyn OverlayRenderer>,
    pub encoder: FrameEncoder,
    pub sink_buffer_frames: usize,
}

/// Errors returned by the HTTP adapters.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("No frame received yet for camera {0}")]
    NoFrame(CameraKey),

    #[error("Frame body is empty")]
    EmptyFrame,

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("Failed to build response: {0}")]
    Internal(String),
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::NoFrame(_) => (StatusCode::NOT_FOUND, "NO_FRAME"),
            ApiError::EmptyFrame => (StatusCode::BAD_REQUEST, "EMPTY_FRAME"),
            ApiError::Connection(ConnectionError::UnknownCamera(_)) => {
                (StatusCode::NOT_FOUND, "UNKNOWN_CAMERA")
            }
            ApiError::Connection(_) | ApiError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
            }
        };

        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
                code: code.to_string(),
            }),
        )
            .into_response()
    }
}

/// A viewer's HTTP response body, fed through a bounded channel.
///
/// The sink reports full once the channel has no free slot, then signals
/// drain when the response body has taken a part off the channel.
pub struct StreamingSink {
    tx: Option<mpsc::Sender<Bytes>>,
    signals: mpsc::UnboundedSender<SinkSignal>,
    done: CancellationToken,
}

impl StreamingSink {
    /// Returns the sink, the relay's signal receiver, and the body receiver.
    pub fn channel(
        buffer_frames: usize,
    ) -> (
        Self,
        mpsc::UnboundedReceiver<SinkSignal>,
        mpsc::Receiver<Bytes>,
    ) {
        let (tx, body_rx) = mpsc::channel(buffer_frames.max(1));
        let (signals, signal_rx) = mpsc::unbounded_channel();
        let done = CancellationToken::new();

        // Report a departed viewer even while nothing is being written.
        let watch_tx = tx.clone();
        let watch_signals = signals.clone();
        let watch_done = done.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = watch_done.cancelled() => {}
                _ = watch_tx.closed() => {
                    let _ = watch_signals.send(SinkSignal::Closed);
                }
            }
        });

        let sink = Self {
            tx: Some(tx),
            signals,
            done,
        };
        (sink, signal_rx, body_rx)
    }

    fn watch_drain(&self, tx: mpsc::Sender<Bytes>) {
        let signals = self.signals.clone();
        let done = self.done.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = done.cancelled() => {}
                permit = tx.reserve() => {
                    let signal = match permit {
                        Ok(_) => SinkSignal::Drain,
                        Err(_) => SinkSignal::Closed,
                    };
                    let _ = signals.send(signal);
                }
            }
        });
    }
}

impl ResponseSink for StreamingSink {
    fn write(&mut self, chunk: Bytes) -> WriteStatus {
        let Some(tx) = &self.tx else {
            return WriteStatus::Closed;
        };

        match tx.try_send(chunk) {
            Ok(()) if tx.capacity() > 0 => WriteStatus::Ready,
            Ok(()) => {
                self.watch_drain(tx.clone());
                WriteStatus::Full
            }
            Err(TrySendError::Full(_)) => {
                self.watch_drain(tx.clone());
                WriteStatus::Dropped
            }
            Err(TrySendError::Closed(_)) => WriteStatus::Closed,
        }
    }

    fn close(&mut self) {
        self.done.cancel();
        self.tx = None;
    }
}

impl Drop for StreamingSink {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct LiveParams {
    #[serde(default)]
    pub overlay: bool,
}

#[derive(Debug, Serialize)]
pub struct PublishResponse {
    pub camera: CameraKey,
    pub subscribers: usize,
}

#[derive(Debug, Serialize)]
pub struct CameraHealth {
    pub camera: CameraKey,
    pub viewers: usize,
    #[serde(flatten)]
    pub stats: ConnectionStats,
}

/// Create the API router
pub fn create_router(state: AppState, config: &ServerConfig) -> Router {
    let cors = if config.cors_enabled {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/live/:app_id/:camera_id", get(live_feed))
        .route("/api/v1/frames/:app_id/:camera_id", post(push_frame))
        .route("/api/v1/detections/:app_id/:camera_id", post(push_detections))
        .route("/api/v1/snapshot/:app_id/:camera_id", get(snapshot))
        .route(
            "/api/v1/cameras/:app_id/:camera_id/restart",
            post(restart_camera),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let cameras: Vec<CameraHealth> = state
        .manager
        .all_stats()
        .into_iter()
        .map(|(camera, stats)| CameraHealth {
            viewers: state
                .manager
                .connection(&camera)
                .map(|c| c.viewer_count())
                .unwrap_or(0),
            camera,
            stats,
        })
        .collect();

    Json(serde_json::json!({
        "status": "healthy",
        "service": "relay-service",
        "cameras": cameras,
    }))
}

/// Long-lived multipart response carrying one camera's frames.
async fn live_feed(
    State(state): State<AppState>,
    Path((app_id, camera_id)): Path<(String, String)>,
    Query(params): Query<LiveParams>,
) -> Result<Response, ApiError> {
    let key = CameraKey::new(app_id, camera_id);
    let (sink, signals, body_rx) = StreamingSink::channel(state.sink_buffer_frames);

    let relay = ClientRelay::new(
        RelayRequest {
            key: key.clone(),
            overlay: params.overlay,
        },
        sink,
        signals,
        &state.hub,
        state.renderer.clone(),
        state.encoder.clone(),
    )
    .with_viewer(state.manager.attach_viewer(&key));

    debug!(
        app_id = %key.app_id,
        camera_id = %key.camera_id,
        overlay = params.overlay,
        viewer_id = %relay.id(),
        "Viewer attached"
    );
    tokio::spawn(relay.run());

    let stream = ReceiverStream::new(body_rx).map(Ok::<_, Infallible>);

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, state.encoder.content_type())
        .header(header::CACHE_CONTROL, "no-cache, no-store, must-revalidate")
        .header(header::PRAGMA, "no-cache")
        .header(header::EXPIRES, "0")
        .body(Body::from_stream(stream))
        .map_err(|e| ApiError::Internal(e.to_string()))
}

/// Publish a pushed JPEG on the camera's raw channel.
async fn push_frame(
    State(state): State<AppState>,
    Path((app_id, camera_id)): Path<(String, String)>,
    body: Bytes,
) -> Result<Json<PublishResponse>, ApiError> {
    if body.is_empty() {
        return Err(ApiError::EmptyFrame);
    }

    let camera = CameraKey::new(app_id, camera_id);
    let subscribers = state
        .hub
        .publish_frame(&camera, Arc::new(Frame::from_jpeg(body)));
    metrics::counter!("relay_frames_pushed_total").increment(1);

    Ok(Json(PublishResponse {
        camera,
        subscribers,
    }))
}

/// Pair detections with the camera's latest frame for overlay viewers.
async fn push_detections(
    State(state): State<AppState>,
    Path((app_id, camera_id)): Path<(String, String)>,
    Json(detections): Json<Vec<Detection>>,
) -> Result<Json<PublishResponse>, ApiError> {
    let camera = CameraKey::new(app_id, camera_id);
    let frame = state
        .hub
        .latest_frame(&camera)
        .ok_or_else(|| ApiError::NoFrame(camera.clone()))?;

    let subscribers = state
        .hub
        .publish_detections(&camera, DetectionEvent { frame, detections });

    Ok(Json(PublishResponse {
        camera,
        subscribers,
    }))
}

/// The camera's most recent frame as a plain JPEG.
async fn snapshot(
    State(state): State<AppState>,
    Path((app_id, camera_id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let camera = CameraKey::new(app_id, camera_id);
    let frame = state
        .hub
        .latest_frame(&camera)
        .ok_or(ApiError::NoFrame(camera))?;

    Ok((
        [
            (header::CONTENT_TYPE, "image/jpeg"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        frame.bytes().clone(),
    )
        .into_response())
}

/// Reconnect a camera now. Needed when automatic reconnection is off.
async fn restart_camera(
    State(state): State<AppState>,
    Path((app_id, camera_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let camera = CameraKey::new(app_id, camera_id);
    state.manager.restart(&camera)?;
    info!(app_id = %camera.app_id, camera_id = %camera.camera_id, "Restart requested");
    Ok(StatusCode::ACCEPTED)
}

/// Start the relay API server
pub async fn start_api_server(state: AppState, config: &ServerConfig) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting relay API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}
