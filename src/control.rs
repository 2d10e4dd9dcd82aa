//! Camera control surface driven by the command channel

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::capture::{CaptureBackend, CaptureError, FrameSink, SensorState};
use crate::pipeline::{LoggerError, Recorder};

#[derive(Error, Debug)]
pub enum ControlError {
    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Recording(#[from] LoggerError),
}

/// Actions reachable from the command protocol
pub trait CameraControl: Send + Sync {
    fn set_recording(&self, enabled: bool) -> Result<(), ControlError>;

    fn set_gain(&self, gain: i32) -> Result<(), ControlError>;

    fn set_exposure(&self, exposure_us: i32) -> Result<(), ControlError>;

    fn stop_imaging(&self) -> Result<(), ControlError>;

    /// Stop imaging and request process shutdown
    fn exit(&self) -> Result<(), ControlError>;

    fn snap(&self) -> Result<(), ControlError>;
}

/// Owns the capture backend and routes control calls to it and the recorder
pub struct CameraController {
    backend: Mutex<Box<dyn CaptureBackend>>,
    recorder: Arc<Recorder>,
    cancel: CancellationToken,
}

impl CameraController {
    pub fn new(
        backend: Box<dyn CaptureBackend>,
        recorder: Arc<Recorder>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            backend: Mutex::new(backend),
            recorder,
            cancel,
        }
    }

    pub fn start_imaging(&self, sink: FrameSink) -> Result<(), ControlError> {
        let mut backend = self.backend.lock();
        backend.start(sink)?;
        info!("Imaging started on {} camera", backend.name());
        Ok(())
    }

    pub fn is_imaging(&self) -> bool {
        self.backend.lock().is_streaming()
    }

    pub fn settings(&self) -> SensorState {
        self.backend.lock().settings()
    }

    pub fn set_offsets(&self, offset_x: u32, offset_y: u32) -> Result<(), ControlError> {
        self.backend.lock().set_offsets(offset_x, offset_y)?;
        Ok(())
    }

    /// Release the camera. Called once at process shutdown.
    pub fn shutdown(&self) {
        self.backend.lock().shutdown();
    }
}

impl CameraControl for CameraController {
    fn set_recording(&self, enabled: bool) -> Result<(), ControlError> {
        let settings = self.settings();
        self.recorder.set_logging(enabled, &settings)?;
        Ok(())
    }

    fn set_gain(&self, gain: i32) -> Result<(), ControlError> {
        let applied = self.backend.lock().set_gain(gain)?;
        if applied != gain as f64 {
            warn!("Gain {} out of range, clamped to {}", gain, applied);
        }
        info!("Gain set to {} dB", applied);
        Ok(())
    }

    fn set_exposure(&self, exposure_us: i32) -> Result<(), ControlError> {
        let applied = self.backend.lock().set_exposure(exposure_us)?;
        if applied != exposure_us as f64 {
            warn!("Exposure {} out of range, clamped to {}", exposure_us, applied);
        }
        info!("Exposure set to {} us", applied);
        Ok(())
    }

    fn stop_imaging(&self) -> Result<(), ControlError> {
        self.backend.lock().stop()?;
        Ok(())
    }

    fn exit(&self) -> Result<(), ControlError> {
        let stopped = self.stop_imaging();
        info!("Exit requested");
        self.cancel.cancel();
        stopped
    }

    fn snap(&self) -> Result<(), ControlError> {
        let mut backend = self.backend.lock();
        let settings = backend.settings();
        self.recorder.request_snap(&settings)?;
        if let Err(e) = backend.trigger() {
            self.recorder.cancel_snap();
            return Err(e.into());
        }
        Ok(())
    }
}
