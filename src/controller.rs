// Drive controller - connection lifecycle, operation mode, command gating
//
// Every motion command is checked against the connection state, the
// drive-reported operation mode and the drive's release bits before it
// reaches the link. Checks that depend on the drive (release bits) run in
// the same critical section as the command they guard.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{ControlConfig, MAX_SEQUENCE_LEN, RELEASE_MASK};
use crate::error::{ControlError, ConversionError, RejectReason, Result};
use crate::error_sink::ErrorSink;
use crate::link::{DriveLink, LinkHandle, MODE_CODE_SEQUENCER, MODE_CODE_SPEED};
use crate::profile::SequenceTable;

/// Drive-side control scheme, as last reported by the drive
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationMode {
    #[default]
    Unknown,
    SpeedControl,
    SequenceControl,
}

impl OperationMode {
    /// Map the drive's mode code (1 = sequencer, 2 = speed control)
    pub fn from_code(code: u32) -> Self {
        match code {
            MODE_CODE_SEQUENCER => OperationMode::SequenceControl,
            MODE_CODE_SPEED => OperationMode::SpeedControl,
            _ => OperationMode::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connected,
}

/// Owns one drive session and dispatches validated commands to it
pub struct DriveController {
    link: LinkHandle,
    errors: ErrorSink,
    config: ControlConfig,
    connection: ConnectionState,
    mode: OperationMode,
    // Speed-mode limits are written once per connected session
    speed_limits_ready: bool,
}

impl DriveController {
    pub fn new(link: LinkHandle, errors: ErrorSink, config: ControlConfig) -> Self {
        Self {
            link,
            errors,
            config,
            connection: ConnectionState::Disconnected,
            mode: OperationMode::Unknown,
            speed_limits_ready: false,
        }
    }

    /// Open the link at the configured baud rate and query the mode.
    ///
    /// A failed mode query after a successful open leaves the controller
    /// connected in [`OperationMode::Unknown`]; the failure is in the error log.
    pub fn open(&mut self, port: &str) -> Result<()> {
        let baud_rate = self.config.baud_rate;
        info!("Opening drive on {} at {} baud", port, baud_rate);
        let result = self.link.with(|link| link.open(port, baud_rate));
        self.settle(result.map_err(ControlError::from))?;

        self.connection = ConnectionState::Connected;
        self.speed_limits_ready = false;
        info!("Drive connected on {}", port);

        if let Err(e) = self.refresh_mode() {
            warn!("Mode query after open failed: {}", e);
        }
        Ok(())
    }

    /// Close the link. The session ends even if the drive reports a failure.
    pub fn close(&mut self) -> Result<()> {
        info!("Closing drive (state {:?})", self.connection);
        let result = self.link.with(|link| link.close());

        self.connection = ConnectionState::Disconnected;
        self.mode = OperationMode::Unknown;
        self.speed_limits_ready = false;

        self.settle(result.map_err(ControlError::from))
    }

    /// Query the drive-reported mode and adopt it
    pub fn refresh_mode(&mut self) -> Result<OperationMode> {
        self.require_connected()?;
        let result = self.link.with(|link| link.drive_mode());
        match self.settle(result.map_err(ControlError::from)) {
            Ok(code) => {
                let mode = OperationMode::from_code(code);
                if mode != self.mode {
                    info!("Operation mode {:?} -> {:?} (code {})", self.mode, mode, code);
                }
                self.mode = mode;
                Ok(mode)
            }
            Err(e) => {
                self.mode = OperationMode::Unknown;
                Err(e)
            }
        }
    }

    pub fn activate_speed_mode(&mut self) -> Result<()> {
        self.activate(OperationMode::SpeedControl, |link| link.speed_mode_activate())
    }

    pub fn activate_sequence_mode(&mut self) -> Result<()> {
        self.activate(OperationMode::SequenceControl, |link| {
            link.sequencer_activate()
        })
    }

    /// Issue an activation and re-read the mode whatever its outcome
    fn activate(
        &mut self,
        target: OperationMode,
        command: impl FnOnce(&mut dyn DriveLink) -> crate::link::LinkResult<()>,
    ) -> Result<()> {
        self.require_connected()?;
        info!("Activating {:?}", target);
        // A mode switch may replace the drive's ceilings
        self.speed_limits_ready = false;
        let result = self.link.with(command);
        let activated = self.settle(result.map_err(ControlError::from));

        let refreshed = self.refresh_mode();
        activated?;
        refreshed.map(|mode| {
            if mode != target {
                warn!("Drive reports {:?} after activating {:?}", mode, target);
            }
        })
    }

    /// Write a speed set point. The release bits are checked first; the
    /// speed-mode limits are written before the first set point of a session.
    pub fn set_speed(&mut self, speed: u32, accel: f64) -> Result<()> {
        self.require_mode(OperationMode::SpeedControl)?;
        check_non_negative(accel)?;

        let limits = self.config.speed_limits;
        let needs_init = !self.speed_limits_ready;
        let mut initialized = false;

        let result = self.link.with(|link| -> Result<()> {
            check_release(link)?;
            if needs_init {
                link.speed_mode_init(limits.max_accel, limits.max_jerk)?;
                initialized = true;
            }
            link.speed_mode_write(speed as f64, accel)?;
            Ok(())
        });

        if initialized {
            self.speed_limits_ready = true;
        }
        if result.is_ok() {
            debug!("Speed set point {} rpm, accel {}", speed, accel);
        }
        self.settle(result)
    }

    /// Transmit a whole sequence in one call after initializing the sequencer
    pub fn run_sequence(&mut self, table: &SequenceTable) -> Result<()> {
        self.require_mode(OperationMode::SequenceControl)?;
        // The drive takes a 16-bit count; never truncate
        let count = u16::try_from(table.len()).map_err(|_| ControlError::CapacityExceeded {
            len: table.len(),
            max: MAX_SEQUENCE_LEN,
        })?;

        let columns = table.columns();
        let limits = self.config.sequencer_limits;
        info!("Transmitting sequence of {} entries", count);
        let mut initialized = false;

        let result = self.link.with(|link| -> Result<()> {
            check_release(link)?;
            link.sequencer_init(limits.max_accel, limits.max_jerk)?;
            initialized = true;
            link.sequencer_write(
                &columns.speeds,
                &columns.accels,
                &columns.jerks,
                &columns.delays,
                count,
            )?;
            Ok(())
        });

        // The sequencer ceilings overwrite the speed-mode ones
        if initialized {
            self.speed_limits_ready = false;
        }
        self.settle(result)
    }

    /// Start the transmitted sequence
    pub fn trigger_sequence(&mut self) -> Result<()> {
        self.require_mode(OperationMode::SequenceControl)?;
        info!("Triggering sequencer");
        let result = self.link.with(|link| -> Result<()> {
            check_release(link)?;
            link.sequencer_soft_trigger()?;
            Ok(())
        });
        self.settle(result)
    }

    /// Reset the drive's class 1 diagnostic (error) state
    pub fn clear_error(&mut self) -> Result<()> {
        self.require_connected()?;
        info!("Clearing drive error");
        let result = self.link.with(|link| link.clear_error());
        self.settle(result.map_err(ControlError::from))
    }

    pub fn diagnostic_number(&mut self) -> Result<u32> {
        self.require_connected()?;
        let result = self.link.with(|link| link.diagnostic_number());
        self.settle(result.map_err(ControlError::from))
    }

    pub fn connection(&self) -> ConnectionState {
        self.connection
    }

    pub fn is_connected(&self) -> bool {
        self.connection == ConnectionState::Connected
    }

    pub fn mode(&self) -> OperationMode {
        self.mode
    }

    pub fn link(&self) -> &LinkHandle {
        &self.link
    }

    pub fn errors(&self) -> &ErrorSink {
        &self.errors
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    fn require_connected(&self) -> Result<()> {
        if self.connection != ConnectionState::Connected {
            debug!("Ignored: not connected");
            return Err(ControlError::Rejected {
                reason: RejectReason::NotConnected,
            });
        }
        Ok(())
    }

    fn require_mode(&self, required: OperationMode) -> Result<()> {
        self.require_connected()?;
        if self.mode != required {
            debug!("Ignored: requires {:?}, drive is in {:?}", required, self.mode);
            return Err(ControlError::Rejected {
                reason: RejectReason::WrongMode {
                    required,
                    actual: self.mode,
                },
            });
        }
        Ok(())
    }

    /// Route link failures to the error log. Called with the link unlocked.
    fn settle<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(ControlError::Link(record)) = &result {
            self.errors.push(record.clone());
        }
        result
    }
}

impl std::fmt::Debug for DriveController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriveController")
            .field("connection", &self.connection)
            .field("mode", &self.mode)
            .field("speed_limits_ready", &self.speed_limits_ready)
            .finish()
    }
}

/// Motion is only allowed once the drive is released (bits 0 and 1 set)
fn check_release(link: &mut dyn DriveLink) -> Result<()> {
    let state = link.operating_state()?;
    if state & RELEASE_MASK != RELEASE_MASK {
        info!("Drive not released (operating state 0b{:02b})", state);
        return Err(ControlError::PreconditionNotMet { state });
    }
    Ok(())
}

fn check_non_negative(value: f64) -> Result<()> {
    if !value.is_finite() {
        return Err(ConversionError::OutOfRange {
            text: value.to_string(),
        }
        .into());
    }
    if value < 0.0 {
        return Err(ConversionError::Negative {
            text: value.to_string(),
        }
        .into());
    }
    Ok(())
}
