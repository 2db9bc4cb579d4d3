// Error types shared by the link, controller and panel layers

use serde::{Deserialize, Serialize};

use crate::config::MAX_ERROR_MESSAGE_LEN;
use crate::controller::OperationMode;

/// Functional block that produced a link failure.
///
/// Result codes are built as `(block << 4) | 1`, so the block can be
/// recovered from any code the drive library reports.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorBlock {
    OpenByCom = 1,
    Close = 2,
    SeqInit = 6,
    SeqWrite = 7,
    SpeedInit = 8,
    SpeedWrite = 9,
    Status = 10,
    ClearError = 11,
}

impl ErrorBlock {
    /// Result code for a failure in this block
    pub fn code(self) -> i32 {
        ((self as i32) << 4) | 1
    }
}

/// Out-of-band error record reported by a failed link call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("drive error 0x{code:04X}: {message}")]
pub struct ErrorRecord {
    pub code: i32,
    pub message: String,
}

impl ErrorRecord {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        let mut message = message.into();
        if message.len() > MAX_ERROR_MESSAGE_LEN {
            let mut end = MAX_ERROR_MESSAGE_LEN;
            while !message.is_char_boundary(end) {
                end -= 1;
            }
            message.truncate(end);
        }
        Self { code, message }
    }

    pub fn from_block(block: ErrorBlock, message: impl Into<String>) -> Self {
        Self::new(block.code(), message)
    }
}

/// Text-to-number conversion failure. The edited value is left untouched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConversionError {
    #[error("'{text}' is not a number")]
    Malformed { text: String },

    #[error("'{text}' is out of range")]
    OutOfRange { text: String },

    #[error("'{text}' must not be negative")]
    Negative { text: String },
}

/// Why a command was ignored without touching the link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    NotConnected,
    WrongMode {
        required: OperationMode,
        actual: OperationMode,
    },
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::NotConnected => write!(f, "not connected"),
            RejectReason::WrongMode { required, actual } => {
                write!(f, "requires {:?}, drive is in {:?}", required, actual)
            }
        }
    }
}

/// Error returned by every controller and panel operation
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ControlError {
    #[error(transparent)]
    Link(#[from] ErrorRecord),

    #[error("Conversion failed: {0}")]
    Conversion(#[from] ConversionError),

    #[error("Please RELEASE the drive before starting (operating state 0b{state:02b})")]
    PreconditionNotMet { state: u8 },

    #[error("Ignored: {reason}")]
    Rejected { reason: RejectReason },

    #[error("Sequence has {len} entries, the drive accepts at most {max}")]
    CapacityExceeded { len: usize, max: usize },

    #[error("Row {row} does not exist (sequence has {len} entries)")]
    RowOutOfRange { row: usize, len: usize },

    #[error("Column {0} does not exist")]
    UnknownColumn(usize),
}

impl ControlError {
    /// The device fault carried by this error, if it came from the link
    pub fn as_link_failure(&self) -> Option<&ErrorRecord> {
        match self {
            ControlError::Link(record) => Some(record),
            _ => None,
        }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, ControlError::Rejected { .. })
    }
}

pub type Result<T> = std::result::Result<T, ControlError>;
