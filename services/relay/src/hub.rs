//! Typed publish/subscribe channels keyed by camera.
//!
//! Two topics exist per camera: raw frames from the upstream socket (or the
//! push endpoint), and frames paired with detections from the detection
//! collaborator. Channels are created on first use and shared by every
//! publisher and subscriber of that camera.

use crate::frame::{CameraKey, DetectionEvent, Frame};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

const DEFAULT_CHANNEL_CAPACITY: usize = 16;
const DEFAULT_MAX_CAMERAS: usize = 256;

/// Which per-camera topic a subscriber is reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Raw,
    Overlay,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::Raw => f.write_str("raw"),
            ChannelKind::Overlay => f.write_str("overlay"),
        }
    }
}

/// A family of broadcast channels, one per camera.
///
/// A channel exists only while it has receivers: publishing to a camera
/// nobody watches creates nothing, and the entry is removed once its last
/// receiver is gone.
struct Topic<T: Clone> {
    senders: RwLock<HashMap<CameraKey, broadcast::Sender<T>>>,
    capacity: usize,
}

impl<T: Clone> Topic<T> {
    fn new(capacity: usize) -> Self {
        Self {
            senders: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Returns the number of receivers the value reached.
    fn publish(&self, key: &CameraKey, value: T) -> usize {
        let sent = match self.senders.read().get(key) {
            Some(tx) => tx.send(value).ok(),
            None => return 0,
        };
        match sent {
            Some(reached) => reached,
            None => {
                self.release(key);
                0
            }
        }
    }

    fn subscribe(&self, key: &CameraKey) -> broadcast::Receiver<T> {
        // Subscribing under the lock keeps `release` from orphaning the sender.
        if let Some(tx) = self.senders.read().get(key) {
            return tx.subscribe();
        }
        self.senders
            .write()
            .entry(key.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Drop the camera's channel if nobody is subscribed to it.
    fn release(&self, key: &CameraKey) -> bool {
        let mut senders = self.senders.write();
        match senders.get(key) {
            Some(tx) if tx.receiver_count() == 0 => {
                senders.remove(key);
                true
            }
            _ => false,
        }
    }

    fn receiver_count(&self, key: &CameraKey) -> usize {
        self.senders
            .read()
            .get(key)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    fn len(&self) -> usize {
        self.senders.read().len()
    }
}

/// Most recent frame per camera, bounded by evicting the camera updated
/// least recently.
struct LatestFrames {
    frames: HashMap<CameraKey, (u64, Arc<Frame>)>,
    sequence: u64,
    max_cameras: usize,
}

impl LatestFrames {
    fn new(max_cameras: usize) -> Self {
        Self {
            frames: HashMap::new(),
            sequence: 0,
            max_cameras,
        }
    }

    fn insert(&mut self, key: &CameraKey, frame: Arc<Frame>) {
        self.sequence += 1;
        if let Some(entry) = self.frames.get_mut(key) {
            *entry = (self.sequence, frame);
            return;
        }

        if self.frames.len() >= self.max_cameras {
            let stale = self
                .frames
                .iter()
                .min_by_key(|(_, (seq, _))| *seq)
                .map(|(key, _)| key.clone());
            if let Some(stale) = stale {
                trace!(camera = %stale, "Evicting latest frame");
                self.frames.remove(&stale);
            }
        }
        self.frames.insert(key.clone(), (self.sequence, frame));
    }

    fn get(&self, key: &CameraKey) -> Option<Arc<Frame>> {
        self.frames.get(key).map(|(_, frame)| frame.clone())
    }
}

/// Registry of per-camera frame channels.
pub struct FrameHub {
    frames: Topic<Arc<Frame>>,
    detections: Topic<Arc<DetectionEvent>>,
    latest: RwLock<LatestFrames>,
}

impl FrameHub {
    /// Capacity bounds how far a subscriber may lag before it skips frames.
    pub fn new(capacity: usize) -> Self {
        Self::with_limits(capacity, DEFAULT_MAX_CAMERAS)
    }

    /// `max_cameras` bounds how many cameras keep a latest frame.
    pub fn with_limits(capacity: usize, max_cameras: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: Topic::new(capacity),
            detections: Topic::new(capacity),
            latest: RwLock::new(LatestFrames::new(max_cameras.max(1))),
        }
    }

    /// Publish a raw frame. Returns the number of subscribers reached.
    pub fn publish_frame(&self, key: &CameraKey, frame: Arc<Frame>) -> usize {
        self.latest.write().insert(key, frame.clone());
        let reached = self.frames.publish(key, frame);
        trace!(camera = %key, reached, "Frame published");
        reached
    }

    /// Publish a frame paired with its detections.
    pub fn publish_detections(&self, key: &CameraKey, event: DetectionEvent) -> usize {
        self.detections.publish(key, Arc::new(event))
    }

    pub fn subscribe_frames(&self, key: &CameraKey) -> broadcast::Receiver<Arc<Frame>> {
        self.frames.subscribe(key)
    }

    pub fn subscribe_detections(
        &self,
        key: &CameraKey,
    ) -> broadcast::Receiver<Arc<DetectionEvent>> {
        self.detections.subscribe(key)
    }

    /// Remove the camera's channel of this kind if it has no subscribers left.
    /// Returns whether a channel was removed.
    pub fn release(&self, key: &CameraKey, kind: ChannelKind) -> bool {
        match kind {
            ChannelKind::Raw => self.frames.release(key),
            ChannelKind::Overlay => self.detections.release(key),
        }
    }

    /// Most recent raw frame seen for a camera.
    pub fn latest_frame(&self, key: &CameraKey) -> Option<Arc<Frame>> {
        self.latest.read().get(key)
    }

    pub fn subscriber_count(&self, key: &CameraKey, kind: ChannelKind) -> usize {
        match kind {
            ChannelKind::Raw => self.frames.receiver_count(key),
            ChannelKind::Overlay => self.detections.receiver_count(key),
        }
    }

    /// Number of cameras with an open channel of this kind.
    pub fn channel_count(&self, kind: ChannelKind) -> usize {
        match kind {
            ChannelKind::Raw => self.frames.len(),
            ChannelKind::Overlay => self.detections.len(),
        }
    }

    /// Number of cameras holding a latest frame.
    pub fn latest_count(&self) -> usize {
        self.latest.read().frames.len()
    }
}

impl Default for FrameHub {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}
