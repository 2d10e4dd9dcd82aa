//! V4L2 capture backend
//!
//! Delivers the luminance plane of YUYV or GREY devices. Gain and exposure go
//! through the standard V4L2 user and camera controls.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use arc_swap::ArcSwap;
use tracing::{debug, error, info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::control::{Control, Value};
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::{CaptureBackend, CaptureError, FrameHeader, FrameSink, SensorInfo, SensorState};
use crate::{CaptureConfig, TriggerMode};

const CID_GAIN: u32 = 0x0098_0913;
/// Units of 100 us
const CID_EXPOSURE_ABSOLUTE: u32 = 0x009a_0902;
const BUFFER_COUNT: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    Grey,
    Yuyv,
}

pub struct V4l2Camera {
    path: PathBuf,
    device: Device,
    layout: Layout,
    state: Arc<ArcSwap<SensorState>>,
    configured: bool,
    running: Arc<AtomicBool>,
    sequence: Arc<AtomicU64>,
    worker: Option<JoinHandle<()>>,
}

/// First `/dev/videoN` that supports video capture
pub fn auto_detect_device() -> Result<PathBuf, CaptureError> {
    for i in 0..10 {
        let path = PathBuf::from(format!("/dev/video{}", i));
        let Ok(device) = Device::with_path(&path) else {
            continue;
        };
        if let Ok(caps) = device.query_caps() {
            if caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
                info!("Auto-detected capture device {}: {}", path.display(), caps.card);
                return Ok(path);
            }
        }
    }
    Err(CaptureError::Device("no V4L2 capture device found".into()))
}

impl V4l2Camera {
    pub fn new(device: &str) -> Result<Self, CaptureError> {
        let path = if device.is_empty() {
            auto_detect_device()?
        } else {
            PathBuf::from(device)
        };
        info!("Opening V4L2 device {}", path.display());

        let device = Device::with_path(&path)?;
        let caps = device.query_caps()?;
        info!("Device: {} ({})", caps.card, caps.driver);
        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(CaptureError::Device(format!(
                "{} doesn't support video capture",
                path.display()
            )));
        }

        Ok(Self {
            path,
            device,
            layout: Layout::Grey,
            state: Arc::new(ArcSwap::from_pointee(SensorState::default())),
            configured: false,
            running: Arc::new(AtomicBool::new(false)),
            sequence: Arc::new(AtomicU64::new(0)),
            worker: None,
        })
    }

    fn control_range(&self, id: u32) -> Option<(i64, i64)> {
        let controls = self.device.query_controls().ok()?;
        controls
            .iter()
            .find(|desc| desc.id == id)
            .map(|desc| (desc.minimum, desc.maximum))
    }

    fn set_integer(&self, id: u32, value: i64) -> Result<(), CaptureError> {
        self.device.set_control(Control {
            id,
            value: Value::Integer(value),
        })?;
        Ok(())
    }

    fn update(&self, f: impl Fn(&mut SensorState)) {
        self.state.rcu(|current| {
            let mut next = **current;
            f(&mut next);
            next
        });
    }
}

impl CaptureBackend for V4l2Camera {
    fn name(&self) -> &'static str {
        "v4l2"
    }

    #[instrument(skip(self, config))]
    fn configure(&mut self, config: &CaptureConfig) -> Result<SensorInfo, CaptureError> {
        if config.trigger == TriggerMode::Software {
            return Err(CaptureError::Unsupported("software trigger"));
        }

        let mut fmt = self.device.format()?;
        fmt.width = config.width;
        fmt.height = config.height;
        fmt.fourcc = FourCC::new(b"GREY");
        let mut fmt = self.device.set_format(&fmt)?;
        if fmt.fourcc != FourCC::new(b"GREY") {
            fmt.fourcc = FourCC::new(b"YUYV");
            fmt = self.device.set_format(&fmt)?;
        }

        self.layout = match &fmt.fourcc.repr {
            b"GREY" => Layout::Grey,
            b"YUYV" => Layout::Yuyv,
            other => {
                return Err(CaptureError::Device(format!(
                    "unsupported pixel format {}",
                    String::from_utf8_lossy(other)
                )))
            }
        };
        if (fmt.width, fmt.height) != (config.width, config.height) {
            warn!(
                "Requested {}x{}, device negotiated {}x{}",
                config.width, config.height, fmt.width, fmt.height
            );
        }

        let gain_range = self
            .control_range(CID_GAIN)
            .map_or((0.0, 0.0), |(lo, hi)| (lo as f64, hi as f64));
        let exposure_range = self
            .control_range(CID_EXPOSURE_ABSOLUTE)
            .map_or((0.0, 0.0), |(lo, hi)| (lo as f64 * 100.0, hi as f64 * 100.0));

        self.state.store(Arc::new(SensorState {
            width: fmt.width,
            height: fmt.height,
            offset_x: config.offset_x,
            offset_y: config.offset_y,
            gain_min: gain_range.0,
            gain_max: gain_range.1,
            exposure_min: exposure_range.0,
            exposure_max: exposure_range.1,
            rate: config.rate_hz,
            ..Default::default()
        }));
        self.configured = true;

        if let Err(e) = self.set_gain(config.gain) {
            warn!("Initial gain not applied: {}", e);
        }
        if let Err(e) = self.set_exposure(config.exposure_us) {
            warn!("Initial exposure not applied: {}", e);
        }

        info!("Format: {}x{} {:?}", fmt.width, fmt.height, self.layout);
        Ok(SensorInfo {
            width_max: fmt.width,
            height_max: fmt.height,
            gain_range,
            exposure_range,
        })
    }

    fn start(&mut self, sink: FrameSink) -> Result<(), CaptureError> {
        if !self.configured {
            return Err(CaptureError::NotConfigured);
        }
        if self.worker.is_some() {
            return Err(CaptureError::AlreadyStreaming);
        }

        let reader = StreamReader {
            path: self.path.clone(),
            layout: self.layout,
            state: self.state.clone(),
            running: self.running.clone(),
            sequence: self.sequence.clone(),
            sink,
        };
        self.running.store(true, Ordering::Release);
        self.worker = Some(
            thread::Builder::new()
                .name("v4l2-capture".into())
                .spawn(move || {
                    if let Err(e) = reader.run() {
                        error!("V4L2 capture stopped: {}", e);
                    }
                })?,
        );
        info!("Capture stream started with {} buffers", BUFFER_COUNT);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), CaptureError> {
        self.running.store(false, Ordering::Release);
        // Returns after the next dequeued buffer
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("V4L2 capture thread panicked");
            }
            info!("Capture stream stopped");
        }
        Ok(())
    }

    fn is_streaming(&self) -> bool {
        self.worker.is_some()
    }

    fn set_gain(&mut self, gain: i32) -> Result<f64, CaptureError> {
        let applied = self.state.load().clamp_gain(gain as f64);
        self.set_integer(CID_GAIN, applied as i64)?;
        self.update(|s| s.gain = applied);
        Ok(applied)
    }

    fn set_exposure(&mut self, exposure_us: i32) -> Result<f64, CaptureError> {
        let applied = self.state.load().clamp_exposure(exposure_us as f64);
        self.set_integer(CID_EXPOSURE_ABSOLUTE, (applied / 100.0).round() as i64)?;
        self.update(|s| s.exposure = applied);
        Ok(applied)
    }

    fn set_offsets(&mut self, _offset_x: u32, _offset_y: u32) -> Result<(), CaptureError> {
        Err(CaptureError::Unsupported("sensor offsets"))
    }

    fn trigger(&mut self) -> Result<(), CaptureError> {
        // Free-running only
        Ok(())
    }

    fn settings(&self) -> SensorState {
        **self.state.load()
    }

    fn shutdown(&mut self) {
        let _ = self.stop();
        self.configured = false;
        debug!("V4L2 camera {} released", self.path.display());
    }
}

impl Drop for V4l2Camera {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Acquisition thread state; the stream is opened on the thread itself
struct StreamReader {
    path: PathBuf,
    layout: Layout,
    state: Arc<ArcSwap<SensorState>>,
    running: Arc<AtomicBool>,
    sequence: Arc<AtomicU64>,
    sink: FrameSink,
}

impl StreamReader {
    fn run(self) -> Result<(), CaptureError> {
        let device = open(&self.path)?;
        let mut stream = MmapStream::with_buffers(&device, Type::VideoCapture, BUFFER_COUNT)?;
        let mut luma = Vec::new();

        while self.running.load(Ordering::Acquire) {
            let (buf, meta) = stream.next()?;
            let state = **self.state.load();

            extract_luma(self.layout, buf, &mut luma);
            let frame_id = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
            let timestamp = meta.timestamp.sec as u64 * 1_000_000 + meta.timestamp.usec as u64;

            let mut header = FrameHeader::new(state.width, state.height, frame_id, timestamp);
            header.image_size = luma.len() as u64;
            state.stamp(&mut header);
            self.sink.push(header, &luma);
        }
        Ok(())
    }
}

fn open(path: &Path) -> Result<Device, CaptureError> {
    Ok(Device::with_path(path)?)
}

fn extract_luma(layout: Layout, buf: &[u8], out: &mut Vec<u8>) {
    out.clear();
    match layout {
        Layout::Grey => out.extend_from_slice(buf),
        Layout::Yuyv => out.extend(buf.iter().step_by(2)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_luma() {
        let yuyv = [10u8, 128, 20, 128, 30, 128, 40, 128];
        let mut out = Vec::new();
        extract_luma(Layout::Yuyv, &yuyv, &mut out);
        assert_eq!(out, vec![10, 20, 30, 40]);

        extract_luma(Layout::Grey, &[1, 2, 3], &mut out);
        assert_eq!(out, vec![1, 2, 3]);
    }
}
