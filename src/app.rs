//! Server assembly and ordered shutdown

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::capture::{CaptureBackend, CaptureError, FrameSink};
use crate::control::{CameraControl, CameraController, ControlError};
use crate::pipeline::{
    FrameLogger, ImageFileEncoder, LoggerError, LoggerStats, Recorder, RingBuffer, RingError,
};
use crate::server::{ServerError, ServerStats, StreamServer};
use crate::Config;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("camera setup failed: {0}")]
    Capture(#[from] CaptureError),

    #[error("ring buffer setup failed: {0}")]
    Ring(#[from] RingError),

    #[error("recorder setup failed: {0}")]
    Logger(#[from] LoggerError),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error(transparent)]
    Control(#[from] ControlError),

    #[error("server setup failed: {0}")]
    Io(#[from] std::io::Error),
}

/// A running camera server: capture, ring, logger and network loops
pub struct CamServer {
    controller: Arc<CameraController>,
    ring: Arc<RingBuffer>,
    recorder: Arc<Recorder>,
    logger: FrameLogger,
    server: JoinHandle<()>,
    server_stats: Arc<ServerStats>,
    addrs: (SocketAddr, SocketAddr),
    cancel: CancellationToken,
}

impl CamServer {
    /// Configure the camera, allocate the ring and start every loop.
    ///
    /// Any failure here is fatal; nothing keeps running when an error is returned.
    pub fn start(
        config: &Config,
        mut backend: Box<dyn CaptureBackend>,
        cancel: CancellationToken,
    ) -> Result<Self, AppError> {
        let sensor = backend.configure(&config.capture)?;
        info!(
            "{} camera: up to {}x{}, gain {:?} dB, exposure {:?} us",
            backend.name(),
            sensor.width_max,
            sensor.height_max,
            sensor.gain_range,
            sensor.exposure_range
        );

        let ring = Arc::new(RingBuffer::with_memory_cap(
            config.buffer.capacity,
            sensor.width_max,
            sensor.height_max,
            config.buffer.memory_fraction,
        )?);
        let recorder = Arc::new(Recorder::new(&config.recording.root_dir)?);
        let encoder = Arc::new(ImageFileEncoder::new(config.recording.image_format));

        let controller = Arc::new(CameraController::new(
            backend,
            recorder.clone(),
            cancel.clone(),
        ));
        if config.recording.enabled {
            controller.set_recording(true)?;
        }

        let server = StreamServer::bind(
            &config.server,
            ring.clone(),
            controller.clone(),
            cancel.clone(),
        )?;
        let addrs = server.local_addrs()?;
        let server_stats = server.stats();

        let logger = FrameLogger::start(
            ring.clone(),
            recorder.clone(),
            encoder,
            &config.recording,
            cancel.clone(),
        )?;
        let server = server.spawn()?;

        let sink = FrameSink::new(ring.clone(), recorder.clone());
        if let Err(e) = controller.start_imaging(sink) {
            cancel.cancel();
            join_server(server);
            logger.join();
            controller.shutdown();
            return Err(e.into());
        }

        Ok(Self {
            controller,
            ring,
            recorder,
            logger,
            server,
            server_stats,
            addrs,
            cancel,
        })
    }

    pub fn frame_addr(&self) -> SocketAddr {
        self.addrs.0
    }

    pub fn command_addr(&self) -> SocketAddr {
        self.addrs.1
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn controller(&self) -> Arc<CameraController> {
        self.controller.clone()
    }

    pub fn recorder(&self) -> Arc<Recorder> {
        self.recorder.clone()
    }

    pub fn logger_stats(&self) -> LoggerStats {
        self.logger.stats()
    }

    /// Log a one-line summary of every component's counters
    pub fn report(&self) {
        let ring = self.ring.stats();
        let logger = self.logger.stats();
        let server = self.server_stats.snapshot();
        info!(
            "ring {}/{} (written {}, dropped {}) | logger: {} logged, {} inline, {} errors | \
             clients: {} frame, {} command | published {}, sent {}",
            self.ring.size(),
            self.ring.capacity(),
            ring.frames_written,
            ring.frames_dropped,
            logger.frames_logged,
            logger.inline_fallbacks,
            logger.errors,
            server.frame_clients,
            server.command_clients,
            server.frames_published,
            server.frames_sent,
        );
    }

    /// Stop the server, then acquisition, then flush the logger and release the camera
    pub fn shutdown(self) {
        info!("Shutting down");
        self.cancel.cancel();

        join_server(self.server);
        if let Err(e) = self.controller.stop_imaging() {
            warn!("Failed to stop imaging: {}", e);
        }
        self.logger.join();
        self.controller.shutdown();

        let ring = self.ring.stats();
        info!(
            "Shutdown complete: {} frames captured, {} dropped by the ring",
            ring.frames_written, ring.frames_dropped
        );
    }
}

/// Wait for the server thread. `false` if it panicked.
fn join_server(server: JoinHandle<()>) -> bool {
    let clean = server.join().is_ok();
    if !clean {
        warn!("Stream server thread panicked");
    }
    clean
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_server_panic_reported() {
        let panicked = thread::spawn(|| panic!("poll loop blew up"));
        assert!(!join_server(panicked));

        let finished = thread::spawn(|| {});
        assert!(join_server(finished));
    }
}
