//! Frame buffering and disk recording

pub mod encoder;
pub mod logger;
pub mod recorder;
pub mod ringbuf;

pub use encoder::{FrameEncoder, ImageFileEncoder, ImageFileFormat};
pub use logger::{FrameLogger, LoggerStats};
pub use recorder::{LoggerError, Recorder, Session};
pub use ringbuf::{RingBuffer, RingError, RingStats};
