//! Per-viewer bridge from a camera's channel to a response sink.
//!
//! A relay runs as one task that alone owns its write state, so the
//! `drained`, `closed` and in-flight overlay flags need no locking. Frames
//! arrive in reassembly order and are either written or dropped, never
//! queued: a full sink drops frames until it signals drain, and in overlay
//! mode detection events that arrive while a render is in flight are dropped.

use crate::camera_manager::ViewerGuard;
use crate::encoder::FrameEncoder;
use crate::frame::{CameraKey, DetectionEvent, Frame};
use crate::hub::{ChannelKind, FrameHub};
use crate::overlay::{OverlayError, OverlayRenderer};
use bytes::Bytes;
use futures::future::{BoxFuture, OptionFuture};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Result of handing a chunk to a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// Accepted, and the sink can take more.
    Ready,
    /// Accepted, but the sink is now full. [`SinkSignal::Drain`] follows.
    Full,
    /// Not accepted because the sink was already full. [`SinkSignal::Drain`] follows.
    Dropped,
    /// The viewer is gone; nothing was written.
    Closed,
}

/// Out-of-band notifications from a sink to its relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkSignal {
    Drain,
    Closed,
}

/// The outbound half of a viewer's response.
pub trait ResponseSink: Send {
    fn write(&mut self, chunk: Bytes) -> WriteStatus;

    /// End the response. Must be idempotent.
    fn close(&mut self);
}

/// What a viewer asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayRequest {
    pub key: CameraKey,
    pub overlay: bool,
}

impl RelayRequest {
    pub fn channel(&self) -> ChannelKind {
        if self.overlay {
            ChannelKind::Overlay
        } else {
            ChannelKind::Raw
        }
    }
}

/// Snapshot of a relay's counters.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct RelayStats {
    pub frames_written: u64,
    pub dropped_backpressure: u64,
    pub dropped_overlay_busy: u64,
    pub overlay_failures: u64,
    pub lagged: u64,
}

/// Live counters, readable while the relay runs.
#[derive(Debug, Default)]
pub struct RelayCounters {
    frames_written: AtomicU64,
    dropped_backpressure: AtomicU64,
    dropped_overlay_busy: AtomicU64,
    overlay_failures: AtomicU64,
    lagged: AtomicU64,
}

impl RelayCounters {
    pub fn snapshot(&self) -> RelayStats {
        RelayStats {
            frames_written: self.frames_written.load(Ordering::Relaxed),
            dropped_backpressure: self.dropped_backpressure.load(Ordering::Relaxed),
            dropped_overlay_busy: self.dropped_overlay_busy.load(Ordering::Relaxed),
            overlay_failures: self.overlay_failures.load(Ordering::Relaxed),
            lagged: self.lagged.load(Ordering::Relaxed),
        }
    }
}

/// Exactly one of the camera's two topics.
enum Feed {
    Raw(broadcast::Receiver<Arc<Frame>>),
    Overlay(broadcast::Receiver<Arc<DetectionEvent>>),
}

enum FeedItem {
    Frame(Arc<Frame>),
    Detections(Arc<DetectionEvent>),
}

impl Feed {
    fn subscribe(hub: &FrameHub, request: &RelayRequest) -> Self {
        if request.overlay {
            Feed::Overlay(hub.subscribe_detections(&request.key))
        } else {
            Feed::Raw(hub.subscribe_frames(&request.key))
        }
    }

    async fn recv(&mut self) -> Result<FeedItem, RecvError> {
        match self {
            Feed::Raw(rx) => rx.recv().await.map(FeedItem::Frame),
            Feed::Overlay(rx) => rx.recv().await.map(FeedItem::Detections),
        }
    }
}

/// The write path: backpressure accounting in front of the sink.
struct RelayWriter<S> {
    key: CameraKey,
    sink: S,
    encoder: FrameEncoder,
    drained: bool,
    closed: bool,
    counters: Arc<RelayCounters>,
}

impl<S: ResponseSink> RelayWriter<S> {
    fn write(&mut self, frame: &Frame) {
        if self.closed {
            return;
        }

        if !self.drained {
            self.count_drop(&self.counters.dropped_backpressure, "backpressure");
            return;
        }

        match self.sink.write(self.encoder.encode(frame)) {
            WriteStatus::Ready => self.count_written(),
            WriteStatus::Full => {
                self.count_written();
                self.drained = false;
            }
            WriteStatus::Dropped => {
                self.count_drop(&self.counters.dropped_backpressure, "backpressure");
                self.drained = false;
            }
            WriteStatus::Closed => {
                debug!(
                    app_id = %self.key.app_id,
                    camera_id = %self.key.camera_id,
                    "Viewer write failed, closing relay"
                );
                self.closed = true;
            }
        }
    }

    fn count_written(&self) {
        self.counters.frames_written.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("relay_frames_written_total").increment(1);
    }

    fn count_drop(&self, counter: &AtomicU64, reason: &'static str) {
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("relay_frames_dropped_total", "reason" => reason).increment(1);
        trace!(
            app_id = %self.key.app_id,
            camera_id = %self.key.camera_id,
            reason,
            "Frame dropped"
        );
    }

    fn close(&mut self) {
        self.closed = true;
        self.sink.close();
    }
}

/// Bridges one viewer's sink to a camera's raw or overlay channel.
pub struct ClientRelay<S> {
    id: Uuid,
    request: RelayRequest,
    feed: Feed,
    hub: Arc<FrameHub>,
    signals: mpsc::UnboundedReceiver<SinkSignal>,
    renderer: Arc<dyn OverlayRenderer>,
    cancel: CancellationToken,
    viewer: Option<ViewerGuard>,
    writer: RelayWriter<S>,
}

impl<S: ResponseSink> ClientRelay<S> {
    /// Subscribes immediately, so frames published after this call are seen.
    pub fn new(
        request: RelayRequest,
        sink: S,
        signals: mpsc::UnboundedReceiver<SinkSignal>,
        hub: &Arc<FrameHub>,
        renderer: Arc<dyn OverlayRenderer>,
        encoder: FrameEncoder,
    ) -> Self {
        let feed = Feed::subscribe(hub, &request);
        Self {
            id: Uuid::new_v4(),
            writer: RelayWriter {
                key: request.key.clone(),
                sink,
                encoder,
                drained: true,
                closed: false,
                counters: Arc::new(RelayCounters::default()),
            },
            request,
            feed,
            hub: hub.clone(),
            signals,
            renderer,
            cancel: CancellationToken::new(),
            viewer: None,
        }
    }

    /// Tie the relay to a camera registration; the relay closes when the
    /// camera is replaced or shut down.
    pub fn with_viewer(mut self, viewer: ViewerGuard) -> Self {
        self.cancel = viewer.token();
        self.viewer = Some(viewer);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Identifies this viewer in logs.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn counters(&self) -> Arc<RelayCounters> {
        self.writer.counters.clone()
    }

    /// Relay frames until the viewer leaves or the relay is cancelled.
    pub async fn run(self) -> RelayStats {
        let ClientRelay {
            id,
            request,
            mut feed,
            hub,
            mut signals,
            renderer,
            cancel,
            viewer: _viewer,
            mut writer,
        } = self;

        debug!(
            app_id = %request.key.app_id,
            camera_id = %request.key.camera_id,
            channel = %request.channel(),
            viewer_id = %id,
            "Relay started"
        );

        let mut rendering: Option<BoxFuture<'static, Result<Frame, OverlayError>>> = None;

        while !writer.closed {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                signal = signals.recv() => match signal {
                    Some(SinkSignal::Drain) => writer.drained = true,
                    Some(SinkSignal::Closed) | None => break,
                },

                Some(result) = OptionFuture::from(rendering.as_mut()), if rendering.is_some() => {
                    rendering = None;
                    match result {
                        Ok(frame) => writer.write(&frame),
                        Err(e) => {
                            writer.counters.overlay_failures.fetch_add(1, Ordering::Relaxed);
                            warn!(
                                app_id = %request.key.app_id,
                                camera_id = %request.key.camera_id,
                                error = %e,
                                "Overlay render failed, frame skipped"
                            );
                        }
                    }
                }

                item = feed.recv() => match item {
                    Ok(FeedItem::Frame(frame)) => writer.write(&frame),
                    Ok(FeedItem::Detections(event)) => {
                        if rendering.is_some() {
                            writer.count_drop(&writer.counters.dropped_overlay_busy, "overlay_busy");
                        } else if event.detections.is_empty() {
                            writer.write(&event.frame);
                        } else if !writer.drained {
                            writer.count_drop(&writer.counters.dropped_backpressure, "backpressure");
                        } else {
                            let renderer = renderer.clone();
                            rendering = Some(Box::pin(async move {
                                renderer.render(&event.frame, &event.detections).await
                            }));
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        writer.counters.lagged.fetch_add(skipped, Ordering::Relaxed);
                        metrics::counter!("relay_frames_dropped_total", "reason" => "lagged")
                            .increment(skipped);
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }

        writer.close();
        drop(feed);
        hub.release(&request.key, request.channel());

        let stats = writer.counters.snapshot();
        info!(
            app_id = %request.key.app_id,
            camera_id = %request.key.camera_id,
            frames_written = stats.frames_written,
            dropped_backpressure = stats.dropped_backpressure,
            dropped_overlay_busy = stats.dropped_overlay_busy,
            viewer_id = %id,
            "Relay closed"
        );
        stats
    }
}
