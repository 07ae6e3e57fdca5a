//! Upstream camera connections with supervised reconnection.
//!
//! Each configured camera gets one [`ConnectionState`] and one supervisor
//! task. The supervisor owns the TCP socket and a fresh
//! [`FrameReassembler`] per connection attempt, publishes every completed
//! frame on the camera's raw channel, and reconnects after a fixed delay
//! whenever the socket closes, ends or fails.

use crate::frame::{CameraDescriptor, CameraKey};
use crate::hub::FrameHub;
use crate::reassembler::{FrameReassembler, ReassemblerLimits};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Errors surfaced by the connection manager's control operations.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Connection to {address} failed: {source}")]
    ConnectFailed {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Stream read failed: {0}")]
    ReadFailed(#[source] std::io::Error),

    #[error("Unknown camera: {0}")]
    UnknownCamera(CameraKey),
}

/// Why an upstream connection attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The camera reset or aborted the connection.
    Closed,
    /// The stream reached end of file.
    Ended,
    Error(String),
    Requested,
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionEvent::Closed => f.write_str("closed"),
            ConnectionEvent::Ended => f.write_str("ended"),
            ConnectionEvent::Error(e) => write!(f, "error: {}", e),
            ConnectionEvent::Requested => f.write_str("restart requested"),
        }
    }
}

/// What happens after an upstream connection is lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectPolicy {
    /// Reconnect after the configured delay, forever.
    Automatic,
    /// Wait for [`ConnectionManager::restart`]. Used in development mode.
    Manual,
}

/// Runtime settings shared by every camera supervisor.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub reconnect_delay: Duration,
    pub policy: ReconnectPolicy,
    pub read_buffer_bytes: usize,
    pub limits: ReassemblerLimits,
    /// Upstream multipart boundary, if known. Any `--` line otherwise.
    pub upstream_boundary: Option<String>,
}

impl ManagerSettings {
    fn reassembler(&self) -> FrameReassembler {
        match &self.upstream_boundary {
            Some(boundary) => FrameReassembler::with_boundary(boundary, self.limits),
            None => FrameReassembler::new(self.limits),
        }
    }
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(5),
            policy: ReconnectPolicy::Automatic,
            read_buffer_bytes: 64 * 1024,
            limits: ReassemblerLimits::default(),
            upstream_boundary: None,
        }
    }
}

/// Statistics for one camera connection.
#[derive(Debug, Default, Clone, Serialize)]
pub struct ConnectionStats {
    pub connected: bool,
    pub frames_received: u64,
    pub frames_dropped: u64,
    pub bytes_received: u64,
    pub reconnect_count: u32,
    pub last_frame_at: Option<DateTime<Utc>>,
}

/// Live state for one camera.
pub struct ConnectionState {
    descriptor: CameraDescriptor,
    restarting: AtomicBool,
    /// Cancels the supervisor and its socket for good.
    socket: CancellationToken,
    /// Cancels the current connection attempt only.
    attempt: Mutex<CancellationToken>,
    /// Parent of every attached viewer's token.
    viewers: CancellationToken,
    viewer_count: AtomicUsize,
    /// Wakes a supervisor waiting to reconnect.
    restart_requested: Notify,
    stats: RwLock<ConnectionStats>,
}

impl ConnectionState {
    fn new(descriptor: CameraDescriptor) -> Self {
        let socket = CancellationToken::new();
        let attempt = socket.child_token();
        Self {
            descriptor,
            restarting: AtomicBool::new(false),
            socket,
            attempt: Mutex::new(attempt),
            viewers: CancellationToken::new(),
            viewer_count: AtomicUsize::new(0),
            restart_requested: Notify::new(),
            stats: RwLock::new(ConnectionStats::default()),
        }
    }

    pub fn descriptor(&self) -> &CameraDescriptor {
        &self.descriptor
    }

    pub fn key(&self) -> &CameraKey {
        &self.descriptor.key
    }

    pub fn stats(&self) -> ConnectionStats {
        self.stats.read().clone()
    }

    pub fn viewer_count(&self) -> usize {
        self.viewer_count.load(Ordering::SeqCst)
    }

    pub fn is_restarting(&self) -> bool {
        self.restarting.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.socket.is_cancelled()
    }

    /// Report a failure of the current connection. Only the first signal of
    /// an attempt schedules a reconnect; later ones return `false`.
    pub fn signal(&self, event: ConnectionEvent) -> bool {
        if self.restarting.swap(true, Ordering::SeqCst) {
            debug!(
                app_id = %self.descriptor.key.app_id,
                camera_id = %self.descriptor.key.camera_id,
                event = %event,
                "Reconnect already scheduled"
            );
            return false;
        }

        warn!(
            app_id = %self.descriptor.key.app_id,
            camera_id = %self.descriptor.key.camera_id,
            event = %event,
            "Upstream connection lost"
        );
        self.attempt.lock().cancel();
        true
    }

    /// Start a new attempt and return its cancellation token.
    fn begin_attempt(&self) -> CancellationToken {
        let token = self.socket.child_token();
        *self.attempt.lock() = token.clone();
        self.restarting.store(false, Ordering::SeqCst);
        token
    }

    /// Close the socket and every attached viewer.
    fn close(&self) {
        self.socket.cancel();
        self.viewers.cancel();
    }

    fn set_connected(&self, connected: bool) {
        self.stats.write().connected = connected;
    }

    fn record_read(&self, bytes: usize, frames: u64, dropped: u64) {
        let mut stats = self.stats.write();
        stats.bytes_received += bytes as u64;
        stats.frames_received += frames;
        stats.frames_dropped += dropped;
        if frames > 0 {
            stats.last_frame_at = Some(Utc::now());
        }
    }
}

/// A viewer's registration with a camera. Dropping it detaches the viewer.
pub struct ViewerGuard {
    token: CancellationToken,
    state: Option<Arc<ConnectionState>>,
}

impl ViewerGuard {
    /// Cancelled when the camera is replaced or the manager shuts down.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Drop for ViewerGuard {
    fn drop(&mut self) {
        if let Some(state) = &self.state {
            state.viewer_count.fetch_sub(1, Ordering::SeqCst);
        }
        metrics::gauge!("relay_viewers").decrement(1.0);
    }
}

/// Owns every camera connection. At most one live state exists per key.
pub struct ConnectionManager {
    hub: Arc<FrameHub>,
    settings: ManagerSettings,
    connections: Mutex<HashMap<CameraKey, Arc<ConnectionState>>>,
}

impl ConnectionManager {
    pub fn new(hub: Arc<FrameHub>, settings: ManagerSettings) -> Self {
        Self {
            hub,
            settings,
            connections: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    /// Connect to a camera, replacing any existing connection for its key.
    pub fn start(&self, descriptor: CameraDescriptor) -> Arc<ConnectionState> {
        let state = Arc::new(ConnectionState::new(descriptor));
        let previous = self
            .connections
            .lock()
            .insert(state.key().clone(), state.clone());

        if let Some(previous) = previous {
            info!(
                app_id = %state.key().app_id,
                camera_id = %state.key().camera_id,
                viewers = previous.viewer_count(),
                "Replacing existing camera connection"
            );
            previous.close();
        }

        tokio::spawn(supervise(
            state.clone(),
            self.hub.clone(),
            self.settings.clone(),
        ));
        state
    }

    pub fn start_all(&self, descriptors: impl IntoIterator<Item = CameraDescriptor>) {
        for descriptor in descriptors {
            self.start(descriptor);
        }
    }

    /// Force a new connection cycle without waiting out the reconnect delay.
    /// Under the manual policy this is the only way a lost camera comes back.
    pub fn restart(&self, key: &CameraKey) -> Result<(), ConnectionError> {
        let state = self
            .connection(key)
            .ok_or_else(|| ConnectionError::UnknownCamera(key.clone()))?;

        // A live attempt is cancelled outright; a pending reconnect is woken.
        if !state.signal(ConnectionEvent::Requested) {
            state.restart_requested.notify_one();
        }
        Ok(())
    }

    pub fn connection(&self, key: &CameraKey) -> Option<Arc<ConnectionState>> {
        self.connections.lock().get(key).cloned()
    }

    pub fn stats(&self, key: &CameraKey) -> Option<ConnectionStats> {
        self.connection(key).map(|state| state.stats())
    }

    pub fn all_stats(&self) -> Vec<(CameraKey, ConnectionStats)> {
        let mut all: Vec<_> = self
            .connections
            .lock()
            .values()
            .map(|state| (state.key().clone(), state.stats()))
            .collect();
        sort_by_camera(&mut all);
        all
    }

    /// Register a viewer with the camera's connection state, if any.
    pub fn attach_viewer(&self, key: &CameraKey) -> ViewerGuard {
        metrics::gauge!("relay_viewers").increment(1.0);
        match self.connection(key) {
            Some(state) => {
                state.viewer_count.fetch_add(1, Ordering::SeqCst);
                ViewerGuard {
                    token: state.viewers.child_token(),
                    state: Some(state),
                }
            }
            None => ViewerGuard {
                token: CancellationToken::new(),
                state: None,
            },
        }
    }

    /// Close every socket and every attached viewer. Returns each camera's
    /// stats as they stood before closing.
    pub fn shutdown(&self) -> Vec<(CameraKey, ConnectionStats)> {
        let states: Vec<_> = self.connections.lock().drain().map(|(_, s)| s).collect();
        let mut final_stats = Vec::with_capacity(states.len());
        for state in states {
            final_stats.push((state.key().clone(), state.stats()));
            state.close();
        }
        sort_by_camera(&mut final_stats);
        info!(cameras = final_stats.len(), "Camera connections closed");
        final_stats
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        for state in self.connections.get_mut().values() {
            state.close();
        }
    }
}

fn sort_by_camera(stats: &mut [(CameraKey, ConnectionStats)]) {
    stats.sort_by(|a, b| (&a.0.app_id, &a.0.camera_id).cmp(&(&b.0.app_id, &b.0.camera_id)));
}

/// Keep one camera connected until its state is closed.
async fn supervise(state: Arc<ConnectionState>, hub: Arc<FrameHub>, settings: ManagerSettings) {
    let key = state.key().clone();

    loop {
        let attempt = state.begin_attempt();

        let event = tokio::select! {
            biased;
            _ = state.socket.cancelled() => break,
            _ = attempt.cancelled() => ConnectionEvent::Requested,
            event = run_connection(&state, &hub, &settings) => event,
        };
        state.set_connected(false);

        // A no-op when a signal from elsewhere already ended this attempt.
        state.signal(event.clone());

        metrics::counter!(
            "relay_reconnects_total",
            "app_id" => key.app_id.clone(),
            "camera_id" => key.camera_id.clone()
        )
        .increment(1);

        match (settings.policy, &event) {
            (_, ConnectionEvent::Requested) => {
                debug!(app_id = %key.app_id, camera_id = %key.camera_id, "Restart requested");
            }
            (ReconnectPolicy::Automatic, _) => {
                debug!(
                    app_id = %key.app_id,
                    camera_id = %key.camera_id,
                    delay_ms = settings.reconnect_delay.as_millis() as u64,
                    "Reconnecting after delay"
                );
                tokio::select! {
                    _ = state.socket.cancelled() => break,
                    _ = state.restart_requested.notified() => {}
                    _ = tokio::time::sleep(settings.reconnect_delay) => {}
                }
            }
            (ReconnectPolicy::Manual, _) => {
                info!(
                    app_id = %key.app_id,
                    camera_id = %key.camera_id,
                    "Automatic reconnection disabled, waiting for manual restart"
                );
                tokio::select! {
                    _ = state.socket.cancelled() => break,
                    _ = state.restart_requested.notified() => {}
                }
            }
        }

        state.stats.write().reconnect_count += 1;
    }

    state.set_connected(false);
    debug!(app_id = %key.app_id, camera_id = %key.camera_id, "Camera supervisor stopped");
}

/// One connection attempt: connect, then read until the stream stops.
async fn run_connection(
    state: &ConnectionState,
    hub: &FrameHub,
    settings: &ManagerSettings,
) -> ConnectionEvent {
    let key = state.key();
    let address = state.descriptor().address();

    let mut stream = match TcpStream::connect(&address).await {
        Ok(stream) => stream,
        Err(source) => {
            let error = ConnectionError::ConnectFailed { address, source };
            return ConnectionEvent::Error(error.to_string());
        }
    };

    info!(
        app_id = %key.app_id,
        camera_id = %key.camera_id,
        address = %address,
        "Connected to camera stream"
    );
    state.set_connected(true);

    let mut reassembler = settings.reassembler();
    let mut buf = vec![0u8; settings.read_buffer_bytes.max(1)];
    let mut dropped_seen = 0;

    loop {
        match stream.read(&mut buf).await {
            Ok(0) => return ConnectionEvent::Ended,
            Ok(n) => {
                let frames = reassembler.push(&buf[..n]);
                let count = frames.len() as u64;
                for frame in frames {
                    hub.publish_frame(key, Arc::new(frame));
                }
                if count > 0 {
                    metrics::counter!(
                        "relay_frames_reassembled_total",
                        "app_id" => key.app_id.clone(),
                        "camera_id" => key.camera_id.clone()
                    )
                    .increment(count);
                }
                let dropped = reassembler.stats().frames_dropped;
                state.record_read(n, count, dropped - dropped_seen);
                dropped_seen = dropped;
            }
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted
                ) =>
            {
                return ConnectionEvent::Closed;
            }
            Err(e) => {
                return ConnectionEvent::Error(ConnectionError::ReadFailed(e).to_string());
            }
        }
    }
}
