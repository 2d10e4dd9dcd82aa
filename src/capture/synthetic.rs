//! Test-pattern camera
//!
//! Produces 8-bit mono frames from a dedicated thread, either free-running at
//! the configured rate or one frame per software trigger.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use tracing::{debug, info, warn};

use super::{CaptureBackend, CaptureError, FrameHeader, FrameSink, SensorInfo, SensorState};
use crate::{CaptureConfig, TriggerMode};

const WIDTH_MAX: u32 = 4096;
const HEIGHT_MAX: u32 = 4096;
const GAIN_RANGE: (f64, f64) = (0.0, 24.0);
const EXPOSURE_RANGE: (f64, f64) = (10.0, 1_000_000.0);
const TRIGGER_WAIT: Duration = Duration::from_millis(100);

pub struct SyntheticCamera {
    state: Arc<ArcSwap<SensorState>>,
    trigger_mode: TriggerMode,
    configured: bool,
    running: Arc<AtomicBool>,
    /// Sequence ids keep counting across stop/start
    sequence: Arc<AtomicU64>,
    epoch: Instant,
    trigger_tx: Option<flume::Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl SyntheticCamera {
    pub fn new() -> Self {
        Self {
            state: Arc::new(ArcSwap::from_pointee(SensorState::default())),
            trigger_mode: TriggerMode::Freerun,
            configured: false,
            running: Arc::new(AtomicBool::new(false)),
            sequence: Arc::new(AtomicU64::new(0)),
            epoch: Instant::now(),
            trigger_tx: None,
            worker: None,
        }
    }

    fn update(&self, f: impl Fn(&mut SensorState)) {
        self.state.rcu(|current| {
            let mut next = **current;
            f(&mut next);
            next
        });
    }
}

impl Default for SyntheticCamera {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureBackend for SyntheticCamera {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn configure(&mut self, config: &CaptureConfig) -> Result<SensorInfo, CaptureError> {
        if config.width > WIDTH_MAX || config.height > HEIGHT_MAX {
            return Err(CaptureError::Device(format!(
                "{}x{} exceeds sensor size {}x{}",
                config.width, config.height, WIDTH_MAX, HEIGHT_MAX
            )));
        }

        let mut state = SensorState {
            width: config.width,
            height: config.height,
            offset_x: config.offset_x,
            offset_y: config.offset_y,
            gain_min: GAIN_RANGE.0,
            gain_max: GAIN_RANGE.1,
            exposure_min: EXPOSURE_RANGE.0,
            exposure_max: EXPOSURE_RANGE.1,
            rate: config.rate_hz,
            ..Default::default()
        };
        state.gain = state.clamp_gain(config.gain as f64);
        state.exposure = state.clamp_exposure(config.exposure_us as f64);

        self.state.store(Arc::new(state));
        self.trigger_mode = config.trigger;
        self.configured = true;

        info!(
            "Synthetic camera configured: {}x{} @ {} Hz ({:?})",
            config.width, config.height, config.rate_hz, config.trigger
        );

        // Slots sized for the configured frame
        Ok(SensorInfo {
            width_max: config.width,
            height_max: config.height,
            gain_range: GAIN_RANGE,
            exposure_range: EXPOSURE_RANGE,
        })
    }

    fn start(&mut self, sink: FrameSink) -> Result<(), CaptureError> {
        if !self.configured {
            return Err(CaptureError::NotConfigured);
        }
        if self.worker.is_some() {
            return Err(CaptureError::AlreadyStreaming);
        }

        let (trigger_tx, trigger_rx) = flume::bounded(1);
        let generator = Generator {
            state: self.state.clone(),
            running: self.running.clone(),
            sequence: self.sequence.clone(),
            epoch: self.epoch,
            mode: self.trigger_mode,
            trigger_rx,
            sink,
        };

        self.running.store(true, Ordering::Release);
        let worker = thread::Builder::new()
            .name("synthetic-camera".into())
            .spawn(move || generator.run())?;

        self.trigger_tx = Some(trigger_tx);
        self.worker = Some(worker);
        info!("Synthetic acquisition started");
        Ok(())
    }

    fn stop(&mut self) -> Result<(), CaptureError> {
        self.running.store(false, Ordering::Release);
        self.trigger_tx = None;

        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Synthetic camera thread panicked");
            }
            info!("Synthetic acquisition stopped");
        }
        Ok(())
    }

    fn is_streaming(&self) -> bool {
        self.worker.is_some()
    }

    fn set_gain(&mut self, gain: i32) -> Result<f64, CaptureError> {
        let applied = self.state.load().clamp_gain(gain as f64);
        self.update(|s| s.gain = applied);
        Ok(applied)
    }

    fn set_exposure(&mut self, exposure_us: i32) -> Result<f64, CaptureError> {
        let applied = self.state.load().clamp_exposure(exposure_us as f64);
        self.update(|s| s.exposure = applied);
        Ok(applied)
    }

    fn set_offsets(&mut self, offset_x: u32, offset_y: u32) -> Result<(), CaptureError> {
        self.update(|s| {
            s.offset_x = offset_x;
            s.offset_y = offset_y;
        });
        Ok(())
    }

    fn trigger(&mut self) -> Result<(), CaptureError> {
        if self.trigger_mode != TriggerMode::Software {
            return Ok(());
        }
        match &self.trigger_tx {
            // A pending trigger already guarantees the next frame
            Some(tx) => {
                let _ = tx.try_send(());
                Ok(())
            }
            None => Err(CaptureError::Device("acquisition is not running".into())),
        }
    }

    fn settings(&self) -> SensorState {
        **self.state.load()
    }

    fn shutdown(&mut self) {
        let _ = self.stop();
        self.configured = false;
        debug!("Synthetic camera shut down");
    }
}

impl Drop for SyntheticCamera {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// State moved into the acquisition thread
struct Generator {
    state: Arc<ArcSwap<SensorState>>,
    running: Arc<AtomicBool>,
    sequence: Arc<AtomicU64>,
    epoch: Instant,
    mode: TriggerMode,
    trigger_rx: flume::Receiver<()>,
    sink: FrameSink,
}

impl Generator {
    fn run(self) {
        let mut pixels = Vec::new();
        let mut next_due = Instant::now();

        while self.running.load(Ordering::Acquire) {
            let state = **self.state.load();

            match self.mode {
                TriggerMode::Freerun => {
                    let period = crate::utils::rate_period(state.rate);
                    let now = Instant::now();
                    if next_due > now {
                        thread::sleep(next_due - now);
                    }
                    next_due += period;
                    // Fell far behind, skip instead of bursting
                    if next_due + period < Instant::now() {
                        next_due = Instant::now();
                    }
                    if !self.running.load(Ordering::Acquire) {
                        break;
                    }
                }
                TriggerMode::Software => match self.trigger_rx.recv_timeout(TRIGGER_WAIT) {
                    Ok(()) => {}
                    Err(flume::RecvTimeoutError::Timeout) => continue,
                    Err(flume::RecvTimeoutError::Disconnected) => break,
                },
            }

            let frame_id = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
            render_pattern(&mut pixels, &state, frame_id);

            let timestamp = self.epoch.elapsed().as_micros() as u64;
            let mut header = FrameHeader::new(state.width, state.height, frame_id, timestamp);
            state.stamp(&mut header);
            self.sink.push(header, &pixels);
        }
    }
}

/// Moving diagonal gradient, brightness scaled by gain
fn render_pattern(pixels: &mut Vec<u8>, state: &SensorState, frame_id: u64) {
    let (w, h) = (state.width as usize, state.height as usize);
    pixels.resize(w * h, 0);

    let shift = frame_id as usize + state.offset_x as usize + state.offset_y as usize;
    let scale = 1.0 + state.gain / 24.0;
    for (y, row) in pixels.chunks_exact_mut(w).enumerate() {
        for (x, px) in row.iter_mut().enumerate() {
            let base = ((x + y + shift) & 0xff) as f64;
            *px = (base * scale).min(255.0) as u8;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Recorder, RingBuffer};

    fn config(trigger: TriggerMode) -> CaptureConfig {
        CaptureConfig {
            width: 16,
            height: 8,
            rate_hz: 200.0,
            gain: 6,
            trigger,
            ..Default::default()
        }
    }

    fn sink(info: &SensorInfo) -> (Arc<RingBuffer>, FrameSink, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let ring = Arc::new(RingBuffer::new(64, info.width_max, info.height_max).unwrap());
        let recorder = Arc::new(Recorder::new(dir.path()).unwrap());
        let sink = FrameSink::new(ring.clone(), recorder);
        (ring, sink, dir)
    }

    #[test]
    fn test_start_requires_configure() {
        let mut camera = SyntheticCamera::new();
        let info = SensorInfo {
            width_max: 4,
            height_max: 4,
            gain_range: GAIN_RANGE,
            exposure_range: EXPOSURE_RANGE,
        };
        let (_ring, sink, _dir) = sink(&info);
        assert!(matches!(camera.start(sink), Err(CaptureError::NotConfigured)));
    }

    #[test]
    fn test_freerun_delivers_increasing_ids() {
        let mut camera = SyntheticCamera::new();
        let info = camera.configure(&config(TriggerMode::Freerun)).unwrap();
        let (ring, sink, _dir) = sink(&info);

        camera.start(sink).unwrap();
        assert!(camera.is_streaming());
        thread::sleep(Duration::from_millis(100));
        camera.stop().unwrap();
        assert!(!camera.is_streaming());

        let frames: Vec<_> = std::iter::from_fn(|| ring.get()).collect();
        assert!(frames.len() >= 2, "only {} frames", frames.len());
        for pair in frames.windows(2) {
            assert_eq!(pair[1].sequence(), pair[0].sequence() + 1);
        }

        let header = frames[0].header;
        assert_eq!((header.width, header.height), (16, 8));
        assert_eq!(header.image_size, 128);
        assert_eq!(header.gain, 6.0);
        assert_eq!(header.rate, 200.0);
    }

    #[test]
    fn test_software_trigger_one_frame_each() {
        let mut camera = SyntheticCamera::new();
        let info = camera.configure(&config(TriggerMode::Software)).unwrap();
        let (ring, sink, _dir) = sink(&info);
        camera.start(sink).unwrap();

        thread::sleep(Duration::from_millis(50));
        assert!(ring.is_empty());

        camera.trigger().unwrap();
        let frame = ring.get_blocking(Duration::from_secs(2)).unwrap();
        assert_eq!(frame.sequence(), 1);
        camera.shutdown();
    }

    #[test]
    fn test_gain_and_exposure_clamped() {
        let mut camera = SyntheticCamera::new();
        camera.configure(&config(TriggerMode::Freerun)).unwrap();

        assert_eq!(camera.set_gain(50).unwrap(), GAIN_RANGE.1);
        assert_eq!(camera.set_exposure(1).unwrap(), EXPOSURE_RANGE.0);
        assert_eq!(camera.set_exposure(20_000).unwrap(), 20_000.0);

        let settings = camera.settings();
        assert_eq!(settings.gain, GAIN_RANGE.1);
        assert_eq!(settings.exposure, 20_000.0);
    }

    #[test]
    fn test_oversized_configuration_rejected() {
        let mut camera = SyntheticCamera::new();
        let cfg = CaptureConfig {
            width: WIDTH_MAX + 1,
            ..config(TriggerMode::Freerun)
        };
        assert!(matches!(camera.configure(&cfg), Err(CaptureError::Device(_))));
    }
}
