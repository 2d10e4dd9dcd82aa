//! Recording state and on-disk sessions
//!
//! A session is one directory `<root>/<YYYY.MM.DD>/<YYYY.MM.DD_HH.MM.SS.mmm>/`
//! holding the image files, an append-only `timestamps.txt` and a
//! `session.toml` describing the camera at session start.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::capture::SensorState;

pub const TIMESTAMP_FILE: &str = "timestamps.txt";
pub const METADATA_FILE: &str = "session.toml";

#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("log directory {} does not exist", .0.display())]
    RootMissing(PathBuf),

    #[error("log path {} is not a directory", .0.display())]
    RootNotDirectory(PathBuf),

    #[error("{}: {source}", .path.display())]
    Io { path: PathBuf, source: io::Error },

    #[error("failed to encode {}: {reason}", .path.display())]
    Encode { path: PathBuf, reason: String },

    #[error("failed to write session metadata: {0}")]
    Metadata(#[from] toml::ser::Error),

    #[error("failed to spawn logger thread: {0}")]
    Spawn(io::Error),

    #[error("Snap only works when recording is disabled.")]
    SnapWhileRecording,

    #[error("A snap is already pending.")]
    SnapPending,
}

impl LoggerError {
    fn io(path: &Path) -> impl FnOnce(io::Error) -> Self + '_ {
        move |source| LoggerError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Serialize)]
struct SessionMetadata<'a> {
    version: &'a str,
    session: u64,
    started: String,
    camera: &'a SensorState,
}

/// One recording session directory
#[derive(Debug)]
pub struct Session {
    id: u64,
    dir: PathBuf,
    started: DateTime<Local>,
    timestamps: Mutex<File>,
}

impl Session {
    /// Create a fresh session directory under `root`
    pub fn create(root: &Path, id: u64, camera: &SensorState) -> Result<Self, LoggerError> {
        check_root(root)?;
        let (dir, started) = create_session_dir(root)?;

        let metadata = SessionMetadata {
            version: crate::VERSION,
            session: id,
            started: started.to_rfc3339(),
            camera,
        };
        let meta_path = dir.join(METADATA_FILE);
        fs::write(&meta_path, toml::to_string_pretty(&metadata)?)
            .map_err(LoggerError::io(&meta_path))?;

        let ts_path = dir.join(TIMESTAMP_FILE);
        let timestamps = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&ts_path)
            .map_err(LoggerError::io(&ts_path))?;

        info!("Recording session {} at {}", id, dir.display());
        Ok(Self {
            id,
            dir,
            started,
            timestamps: Mutex::new(timestamps),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn started(&self) -> DateTime<Local> {
        self.started
    }

    pub fn frame_path(&self, logical_id: u64, extension: &str) -> PathBuf {
        self.dir.join(format!("{:05}_frame.{}", logical_id, extension))
    }

    /// Append one line to the session's timestamp log, stamped with the current wall clock
    pub fn append_timestamp(&self, logical_id: u64, elapsed_secs: f64) -> Result<(), LoggerError> {
        let line = timestamp_line(logical_id, Local::now(), elapsed_secs);
        self.timestamps
            .lock()
            .write_all(line.as_bytes())
            .map_err(|source| LoggerError::Io {
                path: self.dir.join(TIMESTAMP_FILE),
                source,
            })
    }
}

/// `<5-digit id> <HH:MM:SS.mmm> <YYYY.MM.DD> <seconds since session start>`
pub fn timestamp_line(logical_id: u64, now: DateTime<Local>, elapsed_secs: f64) -> String {
    format!(
        "{:05} {} {:.6}\n",
        logical_id,
        now.format("%H:%M:%S%.3f %Y.%m.%d"),
        elapsed_secs
    )
}

fn check_root(root: &Path) -> Result<(), LoggerError> {
    match fs::metadata(root) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(LoggerError::RootNotDirectory(root.to_path_buf())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            Err(LoggerError::RootMissing(root.to_path_buf()))
        }
        Err(e) => Err(LoggerError::io(root)(e)),
    }
}

fn create_session_dir(root: &Path) -> Result<(PathBuf, DateTime<Local>), LoggerError> {
    loop {
        let now = Local::now();
        let day = root.join(now.format("%Y.%m.%d").to_string());
        fs::create_dir_all(&day).map_err(LoggerError::io(&day))?;

        let dir = day.join(now.format("%Y.%m.%d_%H.%M.%S%.3f").to_string());
        match fs::create_dir(&dir) {
            Ok(()) => return Ok((dir, now)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                debug!("Session directory {} exists, retrying", dir.display());
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(e) => return Err(LoggerError::io(&dir)(e)),
        }
    }
}

/// Recording switch, pending snap and the active session
///
/// Shared by the command channel (writer) and the logger drain loop (reader).
pub struct Recorder {
    root: PathBuf,
    logging: AtomicBool,
    snap_pending: AtomicBool,
    session: ArcSwapOption<Session>,
    next_session: AtomicU64,
}

impl Recorder {
    pub fn new(root: impl AsRef<Path>) -> Result<Self, LoggerError> {
        let root = root.as_ref();
        check_root(root)?;
        Ok(Self {
            root: root.to_path_buf(),
            logging: AtomicBool::new(false),
            snap_pending: AtomicBool::new(false),
            session: ArcSwapOption::empty(),
            next_session: AtomicU64::new(1),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_logging(&self) -> bool {
        self.logging.load(Ordering::Acquire)
    }

    /// Switch recording on or off. Turning it on opens a new session.
    pub fn set_logging(&self, enabled: bool, camera: &SensorState) -> Result<(), LoggerError> {
        if !enabled {
            if self.logging.swap(false, Ordering::AcqRel) {
                info!("Recording disabled");
            }
            return Ok(());
        }

        if self.is_logging() {
            debug!("Recording already enabled");
            return Ok(());
        }

        self.open_session(camera)?;
        // Session must be visible before the flag
        self.logging.store(true, Ordering::Release);
        info!("Recording enabled");
        Ok(())
    }

    /// Arrange for the next drained frame to be logged into a fresh session
    pub fn request_snap(&self, camera: &SensorState) -> Result<(), LoggerError> {
        if self.is_logging() {
            return Err(LoggerError::SnapWhileRecording);
        }
        if self.snap_pending.load(Ordering::Acquire) {
            return Err(LoggerError::SnapPending);
        }

        self.open_session(camera)?;
        self.snap_pending.store(true, Ordering::Release);
        info!("Snap requested");
        Ok(())
    }

    pub fn snap_pending(&self) -> bool {
        self.snap_pending.load(Ordering::Acquire)
    }

    /// Consume a pending snap
    pub(crate) fn take_snap(&self) -> bool {
        self.snap_pending
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Withdraw a pending snap whose trigger failed and discard its unused session
    pub fn cancel_snap(&self) {
        if !self.take_snap() {
            return;
        }
        if let Some(session) = self.session.swap(None) {
            if let Err(e) = fs::remove_dir_all(session.dir()) {
                warn!("Could not remove {}: {}", session.dir().display(), e);
            }
            // Only removed when no other session shares the day directory
            if let Some(day) = session.dir().parent() {
                let _ = fs::remove_dir(day);
            }
        }
        info!("Snap cancelled");
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        self.session.load_full()
    }

    fn open_session(&self, camera: &SensorState) -> Result<(), LoggerError> {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let session = Session::create(&self.root, id, camera)?;
        self.session.store(Some(Arc::new(session)));
        Ok(())
    }
}
