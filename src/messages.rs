// Immutable samples published from the poller to consumers

use serde::{Deserialize, Serialize};

use crate::controller::OperationMode;
use crate::error::ErrorRecord;
use crate::profile::{Column, MotionProfileEntry};

/// Velocity feedback read from the drive, in rpm
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpeedSample {
    pub speed: f64,
}

/// Current diagnostic text of the drive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticSample {
    pub message: String,
}

impl DiagnosticSample {
    /// Decode the fixed-size diagnostic buffer, stopping at the first NUL
    pub fn from_buffer(buf: &[u8]) -> Self {
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        let message = String::from_utf8_lossy(&buf[..end]).trim_end().to_string();
        Self { message }
    }
}

/// One line of console output
// Tagged so every line is self-describing JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConsoleEvent {
    Speed(SpeedSample),
    Diagnostic(DiagnosticSample),
    Error(ErrorRecord),
    Mode { mode: OperationMode },
    /// Command completed
    Done { command: String },
    /// Command ignored, refused or failed
    Failed { command: String, error: String },
    Sequence { rows: Vec<SequenceRow> },
    ErrorLog { records: Vec<ErrorRecord>, dropped: u64 },
    DiagnosticNumber { number: u32 },
}

/// One sequence step as displayed to the operator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceRow {
    pub speed: String,
    pub accel_decel: String,
    pub jerk: String,
    pub delay: String,
}

impl From<&MotionProfileEntry> for SequenceRow {
    fn from(entry: &MotionProfileEntry) -> Self {
        Self {
            speed: entry.get(Column::Speed),
            accel_decel: entry.get(Column::AccelDecel),
            jerk: entry.get(Column::Jerk),
            delay: entry.get(Column::Delay),
        }
    }
}

impl From<SpeedSample> for ConsoleEvent {
    fn from(sample: SpeedSample) -> Self {
        ConsoleEvent::Speed(sample)
    }
}

impl From<DiagnosticSample> for ConsoleEvent {
    fn from(sample: DiagnosticSample) -> Self {
        ConsoleEvent::Diagnostic(sample)
    }
}

impl From<&ErrorRecord> for ConsoleEvent {
    fn from(record: &ErrorRecord) -> Self {
        ConsoleEvent::Error(record.clone())
    }
}
