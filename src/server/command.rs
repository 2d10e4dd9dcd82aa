//! Command channel protocol: one ASCII command in, one reply line out

use std::fmt;

use thiserror::Error;

use crate::control::{CameraControl, ControlError};

/// Largest command read from a connection
pub const MAX_COMMAND_LEN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    EnableRecording,
    DisableRecording,
    SetGain(i32),
    SetExposure(i32),
    StopImaging,
    Exit,
    Snap,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("Unknown command.")]
    Unknown,

    #[error("Invalid {0} value.")]
    InvalidValue(&'static str),
}

impl Command {
    /// Case-sensitive prefix match against the command vocabulary
    pub fn parse(text: &str) -> Result<Self, CommandError> {
        if text.starts_with("ENABLE_RECORDING") {
            Ok(Command::EnableRecording)
        } else if text.starts_with("DISABLE_RECORDING") {
            Ok(Command::DisableRecording)
        } else if let Some(value) = text.strip_prefix("GAIN=") {
            parse_value(value, "gain").map(Command::SetGain)
        } else if let Some(value) = text.strip_prefix("EXPOSURE=") {
            parse_value(value, "exposure").map(Command::SetExposure)
        } else if text.starts_with("STOP_IMAGING") {
            Ok(Command::StopImaging)
        } else if text.starts_with("EXIT") {
            Ok(Command::Exit)
        } else if text.starts_with("SNAP") {
            Ok(Command::Snap)
        } else {
            Err(CommandError::Unknown)
        }
    }

    pub fn apply(self, control: &dyn CameraControl) -> Result<(), ControlError> {
        match self {
            Command::EnableRecording => control.set_recording(true),
            Command::DisableRecording => control.set_recording(false),
            Command::SetGain(gain) => control.set_gain(gain),
            Command::SetExposure(exposure) => control.set_exposure(exposure),
            Command::StopImaging => control.stop_imaging(),
            Command::Exit => control.exit(),
            Command::Snap => control.snap(),
        }
    }
}

fn parse_value(value: &str, field: &'static str) -> Result<i32, CommandError> {
    value
        .trim()
        .parse()
        .map_err(|_| CommandError::InvalidValue(field))
}

/// Strip NUL padding and line endings clients append
pub fn clean(raw: &str) -> &str {
    raw.trim_end_matches(|c: char| c == '\0' || c.is_whitespace())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ack(String),
    Err(String),
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Ack(echo) => writeln!(f, "ACK: {}", echo),
            Reply::Err(reason) => writeln!(f, "ERR: {}", reason),
        }
    }
}

/// Parse and run one raw command, producing the reply to send back
pub fn execute(raw: &str, control: &dyn CameraControl) -> Reply {
    let text = clean(raw);
    let command = match Command::parse(text) {
        Ok(command) => command,
        Err(e) => return Reply::Err(e.to_string()),
    };

    match command.apply(control) {
        Ok(()) => Reply::Ack(text.to_string()),
        Err(e) => Reply::Err(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recording {
        calls: Mutex<Vec<String>>,
    }

    impl Recording {
        fn push(&self, call: String) -> Result<(), ControlError> {
            self.calls.lock().push(call);
            Ok(())
        }
    }

    impl CameraControl for Recording {
        fn set_recording(&self, enabled: bool) -> Result<(), ControlError> {
            self.push(format!("recording {enabled}"))
        }
        fn set_gain(&self, gain: i32) -> Result<(), ControlError> {
            self.push(format!("gain {gain}"))
        }
        fn set_exposure(&self, exposure_us: i32) -> Result<(), ControlError> {
            self.push(format!("exposure {exposure_us}"))
        }
        fn stop_imaging(&self) -> Result<(), ControlError> {
            self.push("stop".into())
        }
        fn exit(&self) -> Result<(), ControlError> {
            self.push("exit".into())
        }
        fn snap(&self) -> Result<(), ControlError> {
            Err(crate::pipeline::LoggerError::SnapWhileRecording.into())
        }
    }

    #[test]
    fn test_parse_vocabulary() {
        assert_eq!(Command::parse("ENABLE_RECORDING"), Ok(Command::EnableRecording));
        assert_eq!(Command::parse("DISABLE_RECORDING"), Ok(Command::DisableRecording));
        assert_eq!(Command::parse("GAIN=50"), Ok(Command::SetGain(50)));
        assert_eq!(Command::parse("EXPOSURE=-2"), Ok(Command::SetExposure(-2)));
        assert_eq!(Command::parse("STOP_IMAGING"), Ok(Command::StopImaging));
        assert_eq!(Command::parse("EXIT"), Ok(Command::Exit));
        assert_eq!(Command::parse("SNAP"), Ok(Command::Snap));
        // prefix match
        assert_eq!(Command::parse("EXIT now"), Ok(Command::Exit));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(Command::parse("BOGUS"), Err(CommandError::Unknown));
        assert_eq!(Command::parse("exit"), Err(CommandError::Unknown));
        assert_eq!(Command::parse(""), Err(CommandError::Unknown));
        assert_eq!(
            Command::parse("GAIN=loud"),
            Err(CommandError::InvalidValue("gain"))
        );
        assert_eq!(
            Command::parse("EXPOSURE="),
            Err(CommandError::InvalidValue("exposure"))
        );
    }

    #[test]
    fn test_clean_strips_padding() {
        let mut padded = b"GAIN=50\r\n".to_vec();
        padded.resize(128, 0);
        let raw = String::from_utf8(padded).unwrap();
        assert_eq!(clean(&raw), "GAIN=50");
    }

    #[test]
    fn test_execute_replies() {
        let control = Recording::default();

        assert_eq!(execute("GAIN=50\0\0\0", &control).to_string(), "ACK: GAIN=50\n");
        assert_eq!(
            execute("BOGUS", &control).to_string(),
            "ERR: Unknown command.\n"
        );
        assert_eq!(
            execute("GAIN=x", &control).to_string(),
            "ERR: Invalid gain value.\n"
        );
        assert_eq!(
            execute("SNAP", &control).to_string(),
            "ERR: Snap only works when recording is disabled.\n"
        );
        assert_eq!(
            execute("ENABLE_RECORDING\n", &control),
            Reply::Ack("ENABLE_RECORDING".into())
        );

        assert_eq!(
            *control.calls.lock(),
            vec!["gain 50".to_string(), "recording true".to_string()]
        );
    }
}
