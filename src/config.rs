// Serial settings, poll timing, mode-initialization ceilings
use std::time::Duration;

// Serial link to the drive (SIS over RS232, 8N1)
pub const BAUD_RATE: u32 = 19_200;

// Read timeout for a single telegram exchange
pub const SERIAL_TIMEOUT: Duration = Duration::from_millis(1000);

// Telemetry poll period (speed and diagnostic loops share it)
pub const POLL_PERIOD: Duration = Duration::from_millis(500);

// Acceleration/jerk ceilings written when a mode is initialized.
// These never come from user sequence data.
pub const SPEED_MODE_MAX_ACCEL: f64 = 1000.0;
pub const SPEED_MODE_MAX_JERK: f64 = 1000.0;
pub const SEQUENCER_MAX_ACCEL: f64 = 1000.0;
pub const SEQUENCER_MAX_JERK: f64 = 1000.0;

// Operating-state bits 0 and 1 must both be set before motion is allowed
pub const RELEASE_MASK: u8 = 0b11;

// Drive diagnostic text arrives in a fixed buffer
pub const DIAGNOSTIC_MSG_LEN: usize = 256;

// Sequence length is carried in a 16-bit count field
pub const MAX_SEQUENCE_LEN: usize = u16::MAX as usize;

// Upper bound of the in-memory error log
pub const ERROR_LOG_CAPACITY: usize = 256;

// Bound on ErrorRecord message text (size of the drive library's error buffer)
pub const MAX_ERROR_MESSAGE_LEN: usize = 2048;

/// Acceleration and jerk ceiling for a drive mode
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModeLimits {
    pub max_accel: f64,
    pub max_jerk: f64,
}

impl ModeLimits {
    pub const SPEED: ModeLimits = ModeLimits {
        max_accel: SPEED_MODE_MAX_ACCEL,
        max_jerk: SPEED_MODE_MAX_JERK,
    };

    pub const SEQUENCER: ModeLimits = ModeLimits {
        max_accel: SEQUENCER_MAX_ACCEL,
        max_jerk: SEQUENCER_MAX_JERK,
    };
}

/// Runtime-tunable settings, defaulting to the constants above
#[derive(Debug, Clone)]
pub struct ControlConfig {
    pub baud_rate: u32,
    pub poll_period: Duration,
    pub speed_limits: ModeLimits,
    pub sequencer_limits: ModeLimits,
    pub error_capacity: usize,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            baud_rate: BAUD_RATE,
            poll_period: POLL_PERIOD,
            speed_limits: ModeLimits::SPEED,
            sequencer_limits: ModeLimits::SEQUENCER,
            error_capacity: ERROR_LOG_CAPACITY,
        }
    }
}
