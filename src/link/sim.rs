// In-memory drive used by the console's --simulate mode and by tests
//
// Behaves like a drive that answers instantly: activation changes the
// reported mode, speed writes show up in the velocity feedback. Every call
// is recorded so callers can check what reached the link.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::{DriveLink, LinkResult, MODE_CODE_SEQUENCER, MODE_CODE_SPEED};
use crate::config::DIAGNOSTIC_MSG_LEN;
use crate::error::{ErrorBlock, ErrorRecord};

/// One recorded link call with its arguments
#[derive(Debug, Clone, PartialEq)]
pub enum LinkCall {
    Open { port: String, baud_rate: u32 },
    Close,
    SpeedModeActivate,
    SpeedModeInit { max_accel: f64, max_jerk: f64 },
    SpeedModeWrite { speed: f64, accel: f64 },
    SequencerActivate,
    SequencerInit { max_accel: f64, max_jerk: f64 },
    SequencerWrite {
        speeds: Vec<f64>,
        accels: Vec<f64>,
        jerks: Vec<f64>,
        delays: Vec<u32>,
        count: u16,
    },
    SequencerSoftTrigger,
    DriveMode,
    OperatingState,
    Speed,
    DiagnosticMessage,
    DiagnosticNumber,
    ClearError,
}

impl LinkCall {
    fn block(&self) -> ErrorBlock {
        match self {
            LinkCall::Open { .. } => ErrorBlock::OpenByCom,
            LinkCall::Close => ErrorBlock::Close,
            LinkCall::SpeedModeActivate | LinkCall::SpeedModeInit { .. } => ErrorBlock::SpeedInit,
            LinkCall::SpeedModeWrite { .. } => ErrorBlock::SpeedWrite,
            LinkCall::SequencerActivate | LinkCall::SequencerInit { .. } => ErrorBlock::SeqInit,
            LinkCall::SequencerWrite { .. } | LinkCall::SequencerSoftTrigger => {
                ErrorBlock::SeqWrite
            }
            LinkCall::ClearError => ErrorBlock::ClearError,
            _ => ErrorBlock::Status,
        }
    }

    /// True for calls that poll telemetry rather than command the drive
    pub fn is_telemetry(&self) -> bool {
        matches!(self, LinkCall::Speed | LinkCall::DiagnosticMessage)
    }
}

type FailurePredicate = Box<dyn Fn(&LinkCall) -> bool + Send>;

struct SimState {
    open: bool,
    mode_code: u32,
    operating_state: u8,
    speed: f64,
    diagnostic: String,
    diagnostic_number: u32,
    calls: Vec<LinkCall>,
    fail_when: Vec<FailurePredicate>,
}

/// Simulated drive; clones share the same state
#[derive(Clone)]
pub struct SimulatedDrive {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimulatedDrive {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedDrive {
    /// Closed drive in an unsupported mode, not released
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                open: false,
                mode_code: 0,
                operating_state: 0,
                speed: 0.0,
                diagnostic: "A0012 Control and power sections ready for operation".to_string(),
                diagnostic_number: 0xA0012,
                calls: Vec::new(),
                fail_when: Vec::new(),
            })),
        }
    }

    pub fn with_drive_mode(self, code: u32) -> Self {
        self.set_drive_mode(code);
        self
    }

    pub fn with_operating_state(self, state: u8) -> Self {
        self.set_operating_state(state);
        self
    }

    pub fn with_diagnostic(self, message: &str) -> Self {
        self.state.lock().diagnostic = message.to_string();
        self
    }

    /// Change the operating state (e.g. the operator releases the drive)
    pub fn set_operating_state(&self, state: u8) {
        self.state.lock().operating_state = state;
    }

    /// Change the reported mode without an activation (e.g. from the drive panel)
    pub fn set_drive_mode(&self, code: u32) {
        self.state.lock().mode_code = code;
    }

    /// Fail every call matching `predicate` from now on
    pub fn fail_when(&self, predicate: impl Fn(&LinkCall) -> bool + Send + 'static) {
        self.state.lock().fail_when.push(Box::new(predicate));
    }

    pub fn fail_all(&self) {
        self.fail_when(|_| true);
    }

    /// Snapshot of every call made so far
    pub fn calls(&self) -> Vec<LinkCall> {
        self.state.lock().calls.clone()
    }

    /// Calls excluding telemetry polls
    pub fn command_calls(&self) -> Vec<LinkCall> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| !c.is_telemetry())
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    /// Record `call` and decide whether it fails
    fn enter(&self, call: LinkCall) -> LinkResult<parking_lot::MutexGuard<'_, SimState>> {
        let mut state = self.state.lock();
        debug!("Simulated link call: {:?}", call);

        let injected = state.fail_when.iter().any(|p| p(&call));
        let needs_port = !matches!(call, LinkCall::Open { .. });
        let block = call.block();
        let name = format!("{:?}", call);
        state.calls.push(call);

        if injected {
            return Err(ErrorRecord::from_block(
                block,
                format!("Simulated failure in {}", name),
            ));
        }
        if needs_port && !state.open {
            return Err(ErrorRecord::from_block(block, "Serial port is not open"));
        }
        Ok(state)
    }
}

impl DriveLink for SimulatedDrive {
    fn open(&mut self, port: &str, baud_rate: u32) -> LinkResult<()> {
        let mut state = self.enter(LinkCall::Open {
            port: port.to_string(),
            baud_rate,
        })?;
        state.open = true;
        Ok(())
    }

    fn close(&mut self) -> LinkResult<()> {
        let mut state = self.enter(LinkCall::Close)?;
        state.open = false;
        Ok(())
    }

    fn speed_mode_activate(&mut self) -> LinkResult<()> {
        let mut state = self.enter(LinkCall::SpeedModeActivate)?;
        state.mode_code = MODE_CODE_SPEED;
        Ok(())
    }

    fn speed_mode_init(&mut self, max_accel: f64, max_jerk: f64) -> LinkResult<()> {
        self.enter(LinkCall::SpeedModeInit {
            max_accel,
            max_jerk,
        })?;
        Ok(())
    }

    fn speed_mode_write(&mut self, speed: f64, accel: f64) -> LinkResult<()> {
        let mut state = self.enter(LinkCall::SpeedModeWrite { speed, accel })?;
        state.speed = speed;
        Ok(())
    }

    fn sequencer_activate(&mut self) -> LinkResult<()> {
        let mut state = self.enter(LinkCall::SequencerActivate)?;
        state.mode_code = MODE_CODE_SEQUENCER;
        Ok(())
    }

    fn sequencer_init(&mut self, max_accel: f64, max_jerk: f64) -> LinkResult<()> {
        self.enter(LinkCall::SequencerInit {
            max_accel,
            max_jerk,
        })?;
        Ok(())
    }

    fn sequencer_write(
        &mut self,
        speeds: &[f64],
        accels: &[f64],
        jerks: &[f64],
        delays: &[u32],
        count: u16,
    ) -> LinkResult<()> {
        self.enter(LinkCall::SequencerWrite {
            speeds: speeds.to_vec(),
            accels: accels.to_vec(),
            jerks: jerks.to_vec(),
            delays: delays.to_vec(),
            count,
        })?;
        Ok(())
    }

    fn sequencer_soft_trigger(&mut self) -> LinkResult<()> {
        self.enter(LinkCall::SequencerSoftTrigger)?;
        Ok(())
    }

    fn drive_mode(&mut self) -> LinkResult<u32> {
        Ok(self.enter(LinkCall::DriveMode)?.mode_code)
    }

    fn operating_state(&mut self) -> LinkResult<u8> {
        Ok(self.enter(LinkCall::OperatingState)?.operating_state)
    }

    fn speed(&mut self) -> LinkResult<f64> {
        Ok(self.enter(LinkCall::Speed)?.speed)
    }

    fn diagnostic_message(&mut self) -> LinkResult<[u8; DIAGNOSTIC_MSG_LEN]> {
        let state = self.enter(LinkCall::DiagnosticMessage)?;
        let mut buf = [0u8; DIAGNOSTIC_MSG_LEN];
        let bytes = state.diagnostic.as_bytes();
        // Keep the last byte as terminator
        let len = bytes.len().min(DIAGNOSTIC_MSG_LEN - 1);
        buf[..len].copy_from_slice(&bytes[..len]);
        Ok(buf)
    }

    fn diagnostic_number(&mut self) -> LinkResult<u32> {
        Ok(self.enter(LinkCall::DiagnosticNumber)?.diagnostic_number)
    }

    fn clear_error(&mut self) -> LinkResult<()> {
        self.enter(LinkCall::ClearError)?;
        Ok(())
    }
}
