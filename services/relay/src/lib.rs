//! Nier Relay - live MJPEG camera relay for factory floor analytics
//!
//! Connects to cameras that emit multipart JPEG streams over raw TCP,
//! reassembles complete frames, and fans them out to HTTP viewers as
//! `multipart/x-mixed-replace` responses. Viewers choose between the raw feed
//! and an overlay feed whose frames carry detection boxes.
//!
//! # Architecture
//!
//! ```text
//! Camera TCP -> ConnectionManager -> FrameReassembler -> FrameHub (raw)
//!                                                           |
//! POST /detections ----------------------------------> FrameHub (overlay)
//!                                                           |
//!                                    ClientRelay -> StreamingSink -> viewer
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use nier_relay::{ConnectionManager, FrameHub, RelayConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = RelayConfig::load()?;
//!     config.validate()?;
//!
//!     let hub = Arc::new(FrameHub::with_limits(
//!         config.stream.channel_capacity,
//!         config.stream.max_cameras,
//!     ));
//!     let manager = ConnectionManager::new(hub, config.manager_settings("production"));
//!     manager.start_all(config.descriptors());
//!
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod camera_manager;
pub mod config;
pub mod encoder;
pub mod frame;
pub mod hub;
pub mod overlay;
pub mod reassembler;
pub mod relay;

// Re-export main types
pub use api::{create_router, start_api_server, ApiError, AppState, StreamingSink};
pub use camera_manager::{
    ConnectionError, ConnectionEvent, ConnectionManager, ConnectionState, ConnectionStats,
    ManagerSettings, ReconnectPolicy, ViewerGuard,
};
pub use config::{ConfigValidationError, RelayConfig};
pub use encoder::FrameEncoder;
pub use frame::{CameraDescriptor, CameraKey, Detection, DetectionEvent, Frame, FrameHeaders};
pub use hub::{ChannelKind, FrameHub};
pub use overlay::{BoxOverlayRenderer, BoxStyle, OverlayError, OverlayRenderer};
pub use reassembler::{FrameReassembler, ReassemblerLimits, ReassemblerStats};
pub use relay::{ClientRelay, RelayRequest, RelayStats, ResponseSink, SinkSignal, WriteStatus};
