//! Camera frame acquisition and distribution server
//!
//! Frames delivered by a capture backend land in a bounded [`RingBuffer`].
//! From there the [`StreamServer`] broadcasts the newest frame to TCP clients
//! at a fixed rate and serves single-shot control commands, while the
//! [`FrameLogger`] drains every frame in order and, when recording is on,
//! writes it to disk through a bounded pool of encoder workers.

pub mod app;
pub mod capture;
pub mod control;
pub mod pipeline;
pub mod server;
pub mod utils;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use app::{AppError, CamServer};
pub use capture::{CaptureBackend, Frame, FrameHeader, FrameSink};
pub use control::{CameraControl, CameraController};
pub use pipeline::{FrameLogger, Recorder, RingBuffer};
pub use server::StreamServer;

/// Version recorded in session metadata
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub buffer: BufferConfig,
    pub server: ServerConfig,
    pub recording: RecordingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Built-in test pattern generator
    Synthetic,
    /// Video4Linux2 device (requires the `v4l2` feature)
    V4l2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerMode {
    Freerun,
    Software,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub backend: BackendKind,
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub offset_x: u32,
    pub offset_y: u32,
    /// Acquisition rate in Hz (ignored for software trigger)
    pub rate_hz: f64,
    pub gain: i32,
    pub exposure_us: i32,
    pub trigger: TriggerMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Requested number of frame slots
    pub capacity: usize,
    /// Share of free memory the ring may occupy
    pub memory_fraction: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub frame_port: u16,
    pub command_port: u16,
    /// Reserved, not served
    pub telemetry_port: u16,
    pub publish_rate_hz: f64,
    pub poll_interval_ms: u64,
    pub write_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Directory under which daily and per-session directories are created
    pub root_dir: PathBuf,
    /// Start recording as soon as acquisition starts
    pub enabled: bool,
    pub workers: usize,
    pub image_format: pipeline::ImageFileFormat,
    /// Hardware timestamp ticks per second, for elapsed-time columns
    pub timestamp_ticks_per_second: f64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Synthetic,
            device: "/dev/video0".into(),
            width: 2048,
            height: 2048,
            offset_x: 0,
            offset_y: 0,
            rate_hz: 15.0,
            gain: 0,
            exposure_us: 10_000,
            trigger: TriggerMode::Freerun,
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            memory_fraction: 0.10,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".into(),
            frame_port: 2000,
            command_port: 2001,
            telemetry_port: 2002,
            publish_rate_hz: 6.0,
            poll_interval_ms: 83,
            write_timeout_ms: 2000,
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("."),
            enabled: false,
            workers: 10,
            image_format: pipeline::ImageFileFormat::Tiff,
            timestamp_ticks_per_second: 1_000_000.0,
        }
    }
}

impl Config {
    /// Load defaults, then the optional TOML file, then `CAMSERVER__*` environment overrides.
    /// Not validated, so later overrides can still fix values up; call [`validate`](Self::validate).
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("CAMSERVER")
                .separator("__")
                .try_parsing(true),
        );

        Ok(builder.build()?.try_deserialize()?)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = config::Config::builder()
            .add_source(config::File::from_str(content, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        let cap = &self.capture;
        if cap.width == 0 || cap.height == 0 {
            return invalid(format!(
                "capture width and height must be > 0, got {}x{}",
                cap.width, cap.height
            ));
        }
        if !(cap.rate_hz >= utils::MIN_RATE_HZ) {
            return invalid(format!(
                "capture rate must be >= {} Hz, got {}",
                utils::MIN_RATE_HZ,
                cap.rate_hz
            ));
        }

        let buf = &self.buffer;
        if !(buf.memory_fraction > 0.0 && buf.memory_fraction <= 1.0) {
            return invalid(format!(
                "memory_fraction must be in (0, 1], got {}",
                buf.memory_fraction
            ));
        }

        let srv = &self.server;
        if !(srv.publish_rate_hz >= utils::MIN_RATE_HZ) {
            return invalid(format!(
                "publish rate must be >= {} Hz, got {}",
                utils::MIN_RATE_HZ,
                srv.publish_rate_hz
            ));
        }
        if srv.poll_interval_ms == 0 {
            return invalid("poll_interval_ms must be > 0".into());
        }
        let ports = [srv.frame_port, srv.command_port, srv.telemetry_port];
        if ports[0] != 0 && (ports[0] == ports[1] || ports[0] == ports[2])
            || ports[1] != 0 && ports[1] == ports[2]
        {
            return invalid(format!(
                "frame, command and telemetry ports must differ, got {:?}",
                ports
            ));
        }

        let rec = &self.recording;
        if rec.workers == 0 {
            return invalid("recording needs at least one worker".into());
        }
        if !(rec.timestamp_ticks_per_second > 0.0) {
            return invalid("timestamp_ticks_per_second must be > 0".into());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.frame_port, 2000);
        assert_eq!(config.server.command_port, 2001);
        assert_eq!(config.server.telemetry_port, 2002);
        assert_eq!(config.buffer.capacity, 1000);
        assert!(!config.recording.enabled);
    }

    #[test]
    fn test_config_from_toml() {
        let toml = r#"
[capture]
backend = "synthetic"
width = 640
height = 480
rate_hz = 30.0
gain = 6

[server]
frame_port = 3000
command_port = 3001
telemetry_port = 3002
publish_rate_hz = 10.0

[recording]
root_dir = "/tmp"
workers = 4
image_format = "png"
        "#;

        let config = Config::from_toml_str(toml).unwrap();
        assert_eq!(config.capture.width, 640);
        assert_eq!(config.capture.gain, 6);
        assert_eq!(config.server.frame_port, 3000);
        assert_eq!(config.server.publish_rate_hz, 10.0);
        assert_eq!(config.recording.workers, 4);
        assert_eq!(config.recording.image_format, pipeline::ImageFileFormat::Png);
        // untouched sections keep their defaults
        assert_eq!(config.buffer.capacity, 1000);
        assert_eq!(config.capture.trigger, TriggerMode::Freerun);
    }

    #[test]
    fn test_port_collision_rejected() {
        let toml = r#"
[server]
frame_port = 4000
command_port = 4000
        "#;
        assert!(matches!(
            Config::from_toml_str(toml),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_invalid_values_rejected() {
        for toml in [
            "[capture]\nwidth = 0",
            "[server]\npublish_rate_hz = 0.0",
            "[server]\npublish_rate_hz = 1e-300",
            "[capture]\nrate_hz = 1e-300",
            "[buffer]\nmemory_fraction = 1.5",
            "[recording]\nworkers = 0",
        ] {
            assert!(Config::from_toml_str(toml).is_err(), "accepted: {toml}");
        }
    }

    #[test]
    fn test_load_leaves_validation_to_caller() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("camserver.toml");
        std::fs::write(&path, "[capture]\nwidth = 0\n").unwrap();

        let mut config = Config::load(Some(&path)).unwrap();
        assert!(config.validate().is_err());

        // e.g. a command-line override
        config.capture.width = 320;
        assert!(config.validate().is_ok());
    }
}
