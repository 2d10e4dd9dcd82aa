//! Frame logger: drains the ring in FIFO order and persists frames while recording
//!
//! One drain thread pulls every frame out of the ring. Frames that must be
//! recorded are offered to a fixed pool of encoder workers over a rendezvous
//! channel; when no worker is waiting, the drain thread encodes the frame
//! itself so nothing is dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::utils::CachePadded;
use flume::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::encoder::FrameEncoder;
use super::recorder::{LoggerError, Recorder, Session};
use super::ringbuf::RingBuffer;
use crate::capture::{Frame, FrameHeader};
use crate::RecordingConfig;

/// Bounded wait on the ring between cancellation checks
const DRAIN_WAIT: Duration = Duration::from_millis(100);

#[derive(Default)]
struct Counters {
    frames_drained: AtomicU64,
    frames_logged: AtomicU64,
    inline_fallbacks: AtomicU64,
    errors: AtomicU64,
}

/// Snapshot of logger counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoggerStats {
    pub frames_drained: u64,
    pub frames_logged: u64,
    pub inline_fallbacks: u64,
    pub errors: u64,
}

/// A frame bound for disk
struct LogJob {
    frame: Frame,
    logical_id: u64,
    elapsed_secs: f64,
    session: Arc<Session>,
}

/// Per-session numbering of logged frames
#[derive(Debug, Default)]
struct Numbering {
    /// (sequence, timestamp) of the first frame after the last boundary
    baseline: Option<(u64, u64)>,
    session_id: Option<u64>,
}

impl Numbering {
    /// Frames were skipped; the next logged frame starts over at 1
    fn mark_boundary(&mut self) {
        self.baseline = None;
    }

    fn assign(&mut self, header: &FrameHeader, session_id: u64, ticks_per_second: f64) -> (u64, f64) {
        let restart = match self.baseline {
            None => true,
            Some((seq, _)) => self.session_id != Some(session_id) || header.frame_id < seq,
        };
        if restart {
            self.baseline = Some((header.frame_id, header.timestamp));
            self.session_id = Some(session_id);
        }

        let (base_seq, base_ts) = self.baseline.unwrap_or((header.frame_id, header.timestamp));
        let logical_id = header.frame_id - base_seq + 1;
        let elapsed = header.timestamp.saturating_sub(base_ts) as f64 / ticks_per_second;
        (logical_id, elapsed)
    }
}

/// Drain loop plus encoder worker pool
pub struct FrameLogger {
    drain: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
    counters: Arc<CachePadded<Counters>>,
}

impl FrameLogger {
    pub fn start(
        ring: Arc<RingBuffer>,
        recorder: Arc<Recorder>,
        encoder: Arc<dyn FrameEncoder>,
        config: &RecordingConfig,
        cancel: CancellationToken,
    ) -> Result<Self, LoggerError> {
        let counters = Arc::new(CachePadded::new(Counters::default()));
        // Rendezvous: a send only succeeds if a worker is already waiting
        let (tx, rx) = flume::bounded::<LogJob>(0);

        let mut workers = Vec::with_capacity(config.workers);
        for i in 0..config.workers {
            let rx = rx.clone();
            let encoder = encoder.clone();
            let counters = counters.clone();
            let handle = thread::Builder::new()
                .name(format!("frame-logger-{}", i))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        write_job(&job, encoder.as_ref(), &counters);
                    }
                })
                .map_err(LoggerError::Spawn)?;
            workers.push(handle);
        }
        drop(rx);

        let drain = DrainLoop {
            ring,
            recorder,
            encoder,
            tx,
            counters: counters.clone(),
            cancel,
            ticks_per_second: config.timestamp_ticks_per_second,
            numbering: Numbering::default(),
        };
        let drain = thread::Builder::new()
            .name("frame-drain".into())
            .spawn(move || drain.run())
            .map_err(LoggerError::Spawn)?;

        info!("Frame logger started with {} workers", config.workers);
        Ok(Self {
            drain: Some(drain),
            workers,
            counters,
        })
    }

    pub fn stats(&self) -> LoggerStats {
        LoggerStats {
            frames_drained: self.counters.frames_drained.load(Ordering::Relaxed),
            frames_logged: self.counters.frames_logged.load(Ordering::Relaxed),
            inline_fallbacks: self.counters.inline_fallbacks.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
        }
    }

    /// Wait for the drain loop to observe cancellation, then for every worker
    pub fn join(mut self) -> LoggerStats {
        if let Some(drain) = self.drain.take() {
            if drain.join().is_err() {
                warn!("Frame drain thread panicked");
            }
        }
        // Drain loop dropped the sender, workers see a closed channel
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("Frame logger worker panicked");
            }
        }

        let stats = self.stats();
        info!(
            "Frame logger stopped: {} drained, {} logged, {} inline, {} errors",
            stats.frames_drained, stats.frames_logged, stats.inline_fallbacks, stats.errors
        );
        stats
    }
}

/// State owned by the drain thread
struct DrainLoop {
    ring: Arc<RingBuffer>,
    recorder: Arc<Recorder>,
    encoder: Arc<dyn FrameEncoder>,
    tx: flume::Sender<LogJob>,
    counters: Arc<CachePadded<Counters>>,
    cancel: CancellationToken,
    ticks_per_second: f64,
    numbering: Numbering,
}

impl DrainLoop {
    fn run(mut self) {
        debug!("Frame drain loop running");
        let mut flushing = false;

        loop {
            if !flushing && self.cancel.is_cancelled() {
                if !self.recorder.is_logging() {
                    break;
                }
                info!("Flushing {} buffered frames to disk", self.ring.size());
                flushing = true;
            }

            let frame = if flushing {
                match self.ring.get() {
                    Some(frame) => frame,
                    None => break,
                }
            } else {
                match self.ring.get_blocking(DRAIN_WAIT) {
                    Some(frame) => frame,
                    None => continue,
                }
            };

            self.handle(frame);
        }

        debug!("Frame drain loop ended, {} frames left in ring", self.ring.size());
    }

    fn handle(&mut self, frame: Frame) {
        self.counters.frames_drained.fetch_add(1, Ordering::Relaxed);

        let logging = self.recorder.is_logging();
        if !logging && !self.recorder.take_snap() {
            self.numbering.mark_boundary();
            return;
        }

        let Some(session) = self.recorder.session() else {
            warn!("Recording without a session, frame {} skipped", frame.sequence());
            return;
        };

        let (logical_id, elapsed_secs) =
            self.numbering
                .assign(&frame.header, session.id(), self.ticks_per_second);
        let job = LogJob {
            frame,
            logical_id,
            elapsed_secs,
            session,
        };

        match self.tx.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(job)) | Err(TrySendError::Disconnected(job)) => {
                self.counters.inline_fallbacks.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("camserver_logger_inline_total").increment(1);
                debug!("No idle logger worker, writing frame {} inline", job.logical_id);
                write_job(&job, self.encoder.as_ref(), &self.counters);
            }
        }
    }
}

fn write_job(job: &LogJob, encoder: &dyn FrameEncoder, counters: &Counters) {
    let path = job.session.frame_path(job.logical_id, encoder.extension());
    let result = encoder
        .encode(&path, &job.frame.header, &job.frame.data)
        .and_then(|()| job.session.append_timestamp(job.logical_id, job.elapsed_secs));

    match result {
        Ok(()) => {
            counters.frames_logged.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("camserver_frames_logged_total").increment(1);
        }
        Err(e) => {
            counters.errors.fetch_add(1, Ordering::Relaxed);
            warn!("Failed to log frame {}: {}", job.logical_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(seq: u64, ts: u64) -> FrameHeader {
        FrameHeader::new(4, 4, seq, ts)
    }

    #[test]
    fn test_numbering_starts_at_one() {
        let mut numbering = Numbering::default();
        assert_eq!(numbering.assign(&header(40, 1_000_000), 1, 1e6), (1, 0.0));
        assert_eq!(numbering.assign(&header(41, 1_500_000), 1, 1e6), (2, 0.5));
        assert_eq!(numbering.assign(&header(45, 3_000_000), 1, 1e6), (6, 2.0));
    }

    #[test]
    fn test_numbering_restarts_on_boundary() {
        let mut numbering = Numbering::default();
        numbering.assign(&header(10, 0), 1, 1e6);
        numbering.assign(&header(11, 0), 1, 1e6);

        numbering.mark_boundary();
        assert_eq!(numbering.assign(&header(20, 5), 1, 1e6).0, 1);
        assert_eq!(numbering.assign(&header(21, 5), 1, 1e6).0, 2);
    }

    #[test]
    fn test_numbering_restarts_on_new_session() {
        let mut numbering = Numbering::default();
        numbering.assign(&header(10, 0), 1, 1e6);
        assert_eq!(numbering.assign(&header(11, 0), 2, 1e6).0, 1);
        assert_eq!(numbering.assign(&header(12, 0), 2, 1e6).0, 2);
    }

    #[test]
    fn test_numbering_restarts_when_sequence_goes_back() {
        let mut numbering = Numbering::default();
        numbering.assign(&header(100, 0), 1, 1e6);
        assert_eq!(numbering.assign(&header(3, 0), 1, 1e6).0, 1);
    }
}
