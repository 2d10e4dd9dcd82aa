//! Capture backends and the frame sink they deliver into

pub mod frame;
pub mod synthetic;
#[cfg(feature = "v4l2")]
pub mod v4l2;

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::pipeline::{Recorder, RingBuffer};
use crate::{BackendKind, CaptureConfig};

pub use frame::{Frame, FrameHeader, HEADER_LEN};
pub use synthetic::SyntheticCamera;
#[cfg(feature = "v4l2")]
pub use v4l2::V4l2Camera;

/// Frames per measured-rate window
pub const RATE_WINDOW: u32 = 60;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("camera is not configured")]
    NotConfigured,

    #[error("acquisition already running")]
    AlreadyStreaming,

    #[error("{0}")]
    Device(String),

    #[error("{0} is not supported by this camera")]
    Unsupported(&'static str),

    #[error("capture backend '{0}' is not compiled in")]
    BackendUnavailable(&'static str),

    #[error("camera I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Sensor limits reported when a backend is configured
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorInfo {
    /// Largest frame the sensor can deliver; sizes the ring slots
    pub width_max: u32,
    pub height_max: u32,
    pub gain_range: (f64, f64),
    pub exposure_range: (f64, f64),
}

/// Live camera settings, stamped into every header and recorded per session
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SensorState {
    pub width: u32,
    pub height: u32,
    pub offset_x: u32,
    pub offset_y: u32,
    pub gain: f64,
    pub gain_min: f64,
    pub gain_max: f64,
    pub exposure: f64,
    pub exposure_min: f64,
    pub exposure_max: f64,
    pub rate: f64,
}

impl SensorState {
    pub fn stamp(&self, header: &mut FrameHeader) {
        header.gain = self.gain;
        header.gain_min = self.gain_min;
        header.gain_max = self.gain_max;
        header.exposure = self.exposure;
        header.exposure_min = self.exposure_min;
        header.exposure_max = self.exposure_max;
        header.rate = self.rate;
    }

    pub fn clamp_gain(&self, gain: f64) -> f64 {
        gain.clamp(self.gain_min, self.gain_max)
    }

    pub fn clamp_exposure(&self, exposure: f64) -> f64 {
        exposure.clamp(self.exposure_min, self.exposure_max)
    }
}

/// Camera driver contract
///
/// Backends deliver frames by calling [`FrameSink::push`] from their own
/// acquisition context. All control calls come from the command channel and
/// are serialized by the caller.
pub trait CaptureBackend: Send {
    fn name(&self) -> &'static str;

    /// Open the device and apply `config`. Must be called before [`start`](Self::start).
    fn configure(&mut self, config: &CaptureConfig) -> Result<SensorInfo, CaptureError>;

    /// Begin continuous acquisition into `sink`
    fn start(&mut self, sink: FrameSink) -> Result<(), CaptureError>;

    /// Halt acquisition. Stopping an idle camera is not an error.
    fn stop(&mut self) -> Result<(), CaptureError>;

    fn is_streaming(&self) -> bool;

    /// Apply a gain in dB, clamped to the sensor range. Returns the applied value.
    fn set_gain(&mut self, gain: i32) -> Result<f64, CaptureError>;

    /// Apply an exposure in microseconds, clamped to the sensor range. Returns the applied value.
    fn set_exposure(&mut self, exposure_us: i32) -> Result<f64, CaptureError>;

    fn set_offsets(&mut self, offset_x: u32, offset_y: u32) -> Result<(), CaptureError>;

    /// Request a single frame (software trigger). Free-running cameras ignore it.
    fn trigger(&mut self) -> Result<(), CaptureError>;

    fn settings(&self) -> SensorState;

    /// Stop acquisition and release the device
    fn shutdown(&mut self);
}

/// Build the backend selected in `config`
pub fn open_backend(config: &CaptureConfig) -> Result<Box<dyn CaptureBackend>, CaptureError> {
    match config.backend {
        BackendKind::Synthetic => Ok(Box::new(SyntheticCamera::new())),
        #[cfg(feature = "v4l2")]
        BackendKind::V4l2 => Ok(Box::new(V4l2Camera::new(&config.device)?)),
        #[cfg(not(feature = "v4l2"))]
        BackendKind::V4l2 => Err(CaptureError::BackendUnavailable("v4l2")),
    }
}

/// Delivered-rate estimate over fixed frame windows
#[derive(Debug)]
pub struct RateMeter {
    window: u32,
    count: u32,
    window_start: Option<Instant>,
    rate: f64,
}

impl RateMeter {
    pub fn new(window: u32) -> Self {
        Self {
            window: window.max(1),
            count: 0,
            window_start: None,
            rate: 0.0,
        }
    }

    /// Record a frame arrival and return the current estimate
    pub fn tick(&mut self, now: Instant) -> f64 {
        let Some(start) = self.window_start else {
            self.window_start = Some(now);
            return self.rate;
        };

        self.count += 1;
        if self.count >= self.window {
            let elapsed = now.duration_since(start).as_secs_f64();
            if elapsed > 0.0 {
                self.rate = self.count as f64 / elapsed;
            }
            self.count = 0;
            self.window_start = Some(now);
        }
        self.rate
    }
}

/// Entry point for captured frames
///
/// Stamps the recording flag and the measured rate into each header before
/// committing the frame to the ring.
#[derive(Clone)]
pub struct FrameSink {
    ring: Arc<RingBuffer>,
    recorder: Arc<Recorder>,
    meter: Arc<Mutex<RateMeter>>,
}

impl FrameSink {
    pub fn new(ring: Arc<RingBuffer>, recorder: Arc<Recorder>) -> Self {
        Self {
            ring,
            recorder,
            meter: Arc::new(Mutex::new(RateMeter::new(RATE_WINDOW))),
        }
    }

    pub fn push(&self, mut header: FrameHeader, data: &[u8]) {
        header.logging = self.recorder.is_logging();
        header.rate_measured = self.meter.lock().tick(Instant::now());

        debug!(
            "Frame {}: {}x{} size={} ts={}",
            header.frame_id, header.width, header.height, header.image_size, header.timestamp
        );

        self.ring.put(&header, data);
    }

    /// Largest frame the ring slots can hold
    pub fn max_dimensions(&self) -> (u32, u32) {
        self.ring.dimensions()
    }
}
