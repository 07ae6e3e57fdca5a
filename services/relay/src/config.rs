//! Configuration management for the relay service.
//!
//! Loaded from configuration files and environment variables. Every section
//! has defaults, so an empty environment yields a relay with no cameras that
//! still serves pushed frames.

use crate::camera_manager::{ManagerSettings, ReconnectPolicy};
use crate::encoder::DEFAULT_BOUNDARY;
use crate::frame::{CameraDescriptor, CameraKey};
use crate::overlay::BoxStyle;
use crate::reassembler::ReassemblerLimits;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;

/// Run mode in which cameras are not reconnected automatically.
pub const DEVELOPMENT_MODE: &str = "development";

/// Main configuration for the relay service.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelayConfig {
    /// Upstream camera configuration
    #[serde(default)]
    pub cameras: CamerasConfig,

    /// Stream framing and buffering
    #[serde(default)]
    pub stream: StreamConfig,

    /// Overlay rendering
    #[serde(default)]
    pub overlay: OverlayConfig,

    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Upstream cameras.
#[derive(Debug, Clone, Deserialize)]
pub struct CamerasConfig {
    /// Whether the camera subsystem runs at all
    #[serde(default = "default_cameras_enabled")]
    pub enabled: bool,

    /// Host shared by every upstream camera port
    #[serde(default = "default_camera_host")]
    pub host: String,

    /// Delay before reconnecting a lost camera, in seconds
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,

    /// Reconnect automatically even in development mode
    #[serde(default)]
    pub reconnect_in_development: bool,

    /// Cameras to connect to, in order
    #[serde(default)]
    pub list: Vec<CameraEntry>,
}

/// One upstream camera.
#[derive(Debug, Clone, Deserialize)]
pub struct CameraEntry {
    pub camera_id: String,
    pub app_id: String,
    pub port: u16,
}

/// Stream framing and buffering.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    /// Boundary written between parts on viewer responses
    #[serde(default = "default_boundary")]
    pub boundary: String,

    /// Frames a slow subscriber may lag before it skips ahead
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Encoded parts buffered per viewer before the sink reports full
    #[serde(default = "default_sink_buffer_frames")]
    pub sink_buffer_frames: usize,

    /// Cameras that keep a latest frame for snapshots and detection pairing
    #[serde(default = "default_max_cameras")]
    pub max_cameras: usize,

    /// Largest accepted frame payload
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,

    /// Largest accepted part header block
    #[serde(default = "default_max_header_bytes")]
    pub max_header_bytes: usize,

    /// Upstream boundary, when cameras use a fixed one
    #[serde(default)]
    pub upstream_boundary: Option<String>,
}

/// Overlay rendering.
#[derive(Debug, Clone, Deserialize)]
pub struct OverlayConfig {
    /// JPEG quality of annotated frames (1-100)
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,

    /// Box outline thickness in pixels
    #[serde(default = "default_line_thickness")]
    pub line_thickness: u32,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_host")]
    pub host: String,

    #[serde(default = "default_server_port")]
    pub port: u16,

    /// Enable permissive CORS for browser viewers
    #[serde(default = "default_cors_enabled")]
    pub cors_enabled: bool,

    /// Port for the Prometheus exporter; disabled when unset
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_cameras_enabled() -> bool {
    true
}
fn default_camera_host() -> String {
    "127.0.0.1".to_string()
}
fn default_reconnect_delay_secs() -> u64 {
    5
}
fn default_boundary() -> String {
    DEFAULT_BOUNDARY.to_string()
}
fn default_channel_capacity() -> usize {
    16
}
fn default_sink_buffer_frames() -> usize {
    4
}
fn default_max_cameras() -> usize {
    256
}
fn default_max_frame_bytes() -> usize {
    ReassemblerLimits::default().max_frame_bytes
}
fn default_max_header_bytes() -> usize {
    ReassemblerLimits::default().max_header_bytes
}
fn default_jpeg_quality() -> u8 {
    80
}
fn default_line_thickness() -> u32 {
    3
}
fn default_server_host() -> String {
    "0.0.0.0".to_string()
}
fn default_server_port() -> u16 {
    8090
}
fn default_cors_enabled() -> bool {
    true
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}

impl Default for CamerasConfig {
    fn default() -> Self {
        Self {
            enabled: default_cameras_enabled(),
            host: default_camera_host(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
            reconnect_in_development: false,
            list: Vec::new(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            boundary: default_boundary(),
            channel_capacity: default_channel_capacity(),
            sink_buffer_frames: default_sink_buffer_frames(),
            max_cameras: default_max_cameras(),
            max_frame_bytes: default_max_frame_bytes(),
            max_header_bytes: default_max_header_bytes(),
            upstream_boundary: None,
        }
    }
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            jpeg_quality: default_jpeg_quality(),
            line_thickness: default_line_thickness(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_server_port(),
            cors_enabled: default_cors_enabled(),
            metrics_port: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// The current run mode, `production` when unset.
pub fn run_mode() -> String {
    std::env::var("RUN_MODE").unwrap_or_else(|_| "production".into())
}

impl RelayConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default config file (config/default.toml)
    /// 2. Run-mode config (config/{RUN_MODE}.toml)
    /// 3. Environment variables (prefixed with RELAY_)
    pub fn load() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode())).required(false))
            // e.g. RELAY_SERVER__PORT=9000
            .add_source(
                Environment::with_prefix("RELAY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Create configuration from environment variables only.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(
                Environment::with_prefix("RELAY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.cameras.enabled && !self.cameras.list.is_empty() && self.cameras.host.is_empty() {
            return Err(ConfigValidationError::MissingField("cameras.host".to_string()));
        }

        let mut seen = HashSet::new();
        for (index, camera) in self.cameras.list.iter().enumerate() {
            if camera.app_id.is_empty() {
                return Err(ConfigValidationError::MissingField(format!(
                    "cameras.list[{}].app_id",
                    index
                )));
            }
            if camera.camera_id.is_empty() {
                return Err(ConfigValidationError::MissingField(format!(
                    "cameras.list[{}].camera_id",
                    index
                )));
            }
            if camera.port == 0 {
                return Err(ConfigValidationError::InvalidValue {
                    field: format!("cameras.list[{}].port", index),
                    message: "Port must be greater than 0".to_string(),
                });
            }
            if !seen.insert((camera.app_id.as_str(), camera.camera_id.as_str())) {
                return Err(ConfigValidationError::InvalidValue {
                    field: format!("cameras.list[{}]", index),
                    message: format!(
                        "Duplicate camera {}/{}",
                        camera.app_id, camera.camera_id
                    ),
                });
            }
        }

        // The boundary ends up in a response header and between parts.
        let boundary = &self.stream.boundary;
        if boundary.is_empty()
            || boundary.len() > 70
            || !boundary.chars().all(|c| c.is_ascii_graphic() && c != '"')
        {
            return Err(ConfigValidationError::InvalidValue {
                field: "stream.boundary".to_string(),
                message: "Boundary must be 1-70 printable ASCII characters".to_string(),
            });
        }

        if self.stream.channel_capacity == 0
            || self.stream.sink_buffer_frames == 0
            || self.stream.max_cameras == 0
        {
            return Err(ConfigValidationError::InvalidValue {
                field: "stream.channel_capacity/sink_buffer_frames/max_cameras".to_string(),
                message: "Capacities must be greater than 0".to_string(),
            });
        }

        if self.stream.max_frame_bytes == 0 || self.stream.max_header_bytes == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "stream.max_frame_bytes/max_header_bytes".to_string(),
                message: "Limits must be greater than 0".to_string(),
            });
        }

        if !(1..=100).contains(&self.overlay.jpeg_quality) {
            return Err(ConfigValidationError::InvalidValue {
                field: "overlay.jpeg_quality".to_string(),
                message: "Quality must be between 1 and 100".to_string(),
            });
        }

        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            return Err(ConfigValidationError::InvalidValue {
                field: "logging.format".to_string(),
                message: "Format must be json or pretty".to_string(),
            });
        }

        Ok(())
    }

    /// Whether the camera subsystem should start.
    pub fn cameras_enabled(&self) -> bool {
        self.cameras.enabled && !self.cameras.list.is_empty()
    }

    /// Descriptors for every configured camera, in configuration order.
    pub fn descriptors(&self) -> Vec<CameraDescriptor> {
        self.cameras
            .list
            .iter()
            .map(|camera| CameraDescriptor {
                key: CameraKey::new(&camera.app_id, &camera.camera_id),
                host: self.cameras.host.clone(),
                port: camera.port,
            })
            .collect()
    }

    /// Supervisor settings for the given run mode.
    pub fn manager_settings(&self, run_mode: &str) -> ManagerSettings {
        let policy = if run_mode == DEVELOPMENT_MODE && !self.cameras.reconnect_in_development {
            ReconnectPolicy::Manual
        } else {
            ReconnectPolicy::Automatic
        };

        ManagerSettings {
            reconnect_delay: self.cameras.reconnect_delay(),
            policy,
            limits: self.stream.limits(),
            upstream_boundary: self.stream.upstream_boundary.clone(),
            ..ManagerSettings::default()
        }
    }

    pub fn box_style(&self) -> BoxStyle {
        BoxStyle {
            thickness: self.overlay.line_thickness,
            jpeg_quality: self.overlay.jpeg_quality,
            ..BoxStyle::default()
        }
    }
}

impl CamerasConfig {
    /// Get reconnect delay as Duration.
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

impl StreamConfig {
    pub fn limits(&self) -> ReassemblerLimits {
        ReassemblerLimits {
            max_header_bytes: self.max_header_bytes,
            max_frame_bytes: self.max_frame_bytes,
        }
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_config() -> RelayConfig {
        RelayConfig {
            cameras: CamerasConfig {
                enabled: true,
                host: "10.0.0.5".to_string(),
                reconnect_delay_secs: 5,
                reconnect_in_development: false,
                list: vec![
                    CameraEntry {
                        camera_id: "1".to_string(),
                        app_id: "yard".to_string(),
                        port: 8081,
                    },
                    CameraEntry {
                        camera_id: "2".to_string(),
                        app_id: "yard".to_string(),
                        port: 8082,
                    },
                ],
            },
            ..RelayConfig::default()
        }
    }

    #[test]
    fn test_valid_config() {
        let config = create_test_config();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = RelayConfig::default();
        assert!(config.validate().is_ok());
        assert!(!config.cameras_enabled());
        assert_eq!(config.cameras.reconnect_delay(), Duration::from_secs(5));
    }

    #[test]
    fn test_missing_app_id() {
        let mut config = create_test_config();
        config.cameras.list[1].app_id = String::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::MissingField(field)) if field == "cameras.list[1].app_id"
        ));
    }

    #[test]
    fn test_duplicate_camera() {
        let mut config = create_test_config();
        config.cameras.list[1].camera_id = "1".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_invalid_boundary() {
        let mut config = create_test_config();
        config.stream.boundary = "has space".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_invalid_jpeg_quality() {
        let mut config = create_test_config();
        config.overlay.jpeg_quality = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_zero_max_cameras() {
        let mut config = create_test_config();
        config.stream.max_cameras = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { field, .. }) if field.contains("max_cameras")
        ));
    }

    #[test]
    fn test_disabled_cameras() {
        let mut config = create_test_config();
        assert!(config.cameras_enabled());
        config.cameras.enabled = false;
        assert!(!config.cameras_enabled());
    }

    #[test]
    fn test_descriptors_keep_order() {
        let descriptors = create_test_config().descriptors();
        assert_eq!(descriptors.len(), 2);
        assert_eq!(descriptors[0].key, CameraKey::new("yard", "1"));
        assert_eq!(descriptors[0].address(), "10.0.0.5:8081");
        assert_eq!(descriptors[1].port, 8082);
    }

    #[test]
    fn test_development_mode_is_manual() {
        let mut config = create_test_config();
        assert_eq!(
            config.manager_settings("development").policy,
            ReconnectPolicy::Manual
        );
        assert_eq!(
            config.manager_settings("production").policy,
            ReconnectPolicy::Automatic
        );

        config.cameras.reconnect_in_development = true;
        assert_eq!(
            config.manager_settings("development").policy,
            ReconnectPolicy::Automatic
        );
    }

    #[test]
    fn test_manager_settings_carry_limits() {
        let mut config = create_test_config();
        config.stream.max_frame_bytes = 1024;
        config.cameras.reconnect_delay_secs = 2;

        let settings = config.manager_settings("production");
        assert_eq!(settings.limits.max_frame_bytes, 1024);
        assert_eq!(settings.reconnect_delay, Duration::from_secs(2));
    }
}
