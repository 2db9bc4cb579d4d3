// Operator-facing surface
//
// Takes raw text from the operator, converts it, and hands typed values to
// the controller. Owns the sequence being edited and the telemetry poller,
// which runs while a session is open.

use tokio::runtime::Handle;
use tracing::{debug, info};

use crate::config::ControlConfig;
use crate::controller::{ConnectionState, DriveController, OperationMode};
use crate::error::{ErrorRecord, Result};
use crate::error_sink::ErrorSink;
use crate::link::LinkHandle;
use crate::messages::{DiagnosticSample, SpeedSample};
use crate::profile::{Column, MotionProfileEntry, SequenceTable, parse_decimal, parse_unsigned};
use crate::telemetry::TelemetryPoller;

pub struct ControlPanel {
    controller: DriveController,
    poller: TelemetryPoller,
    sequence: SequenceTable,
}

impl ControlPanel {
    /// Panel for `link`; telemetry loops are spawned on `runtime`
    pub fn new(link: LinkHandle, config: ControlConfig, runtime: Handle) -> Self {
        let errors = ErrorSink::new(config.error_capacity);
        let poller = TelemetryPoller::new(link.clone(), errors.clone(), runtime);
        Self {
            controller: DriveController::new(link, errors, config),
            poller,
            sequence: SequenceTable::new(),
        }
    }

    /// Open the session and start polling telemetry
    pub fn open(&mut self, port: &str) -> Result<()> {
        self.controller.open(port)?;
        let period = self.controller.config().poll_period;
        self.poller.start(period);
        Ok(())
    }

    /// Stop polling, then close the session
    pub fn close(&mut self) -> Result<()> {
        self.poller.stop();
        self.controller.close()
    }

    pub fn activate_speed_mode(&mut self) -> Result<()> {
        self.controller.activate_speed_mode()
    }

    pub fn activate_sequence_mode(&mut self) -> Result<()> {
        self.controller.activate_sequence_mode()
    }

    /// Convert both fields, then send the set point. Nothing reaches the
    /// drive if either field does not convert.
    pub fn set_speed(&mut self, speed: &str, accel: &str) -> Result<()> {
        let speed = parse_unsigned(speed)?;
        let accel = parse_decimal(accel, Column::AccelDecel.decimals())?;
        self.controller.set_speed(speed, accel)
    }

    /// Append a zero-valued step and return its row
    pub fn append_sequence_entry(&mut self) -> usize {
        let row = self.sequence.append();
        debug!("Sequence entry {} appended", row);
        row
    }

    /// Edit one cell. A failed conversion keeps the previous value.
    pub fn update_sequence_entry(&mut self, row: usize, column: usize, text: &str) -> Result<()> {
        self.sequence.update(row, column, text)?;
        debug!(
            "Sequence cell [{}:{}] = {} (input '{}')",
            row,
            column,
            self.sequence.get(row, column)?,
            text
        );
        Ok(())
    }

    pub fn remove_sequence_entry(&mut self, row: usize) -> Result<MotionProfileEntry> {
        self.sequence.remove(row)
    }

    pub fn run_sequence(&mut self) -> Result<()> {
        self.controller.run_sequence(&self.sequence)
    }

    pub fn trigger_sequence(&mut self) -> Result<()> {
        self.controller.trigger_sequence()
    }

    pub fn clear_error(&mut self) -> Result<()> {
        self.controller.clear_error()
    }

    pub fn diagnostic_number(&mut self) -> Result<u32> {
        self.controller.diagnostic_number()
    }

    pub fn subscribe_errors(&self, callback: impl Fn(&ErrorRecord) + Send + Sync + 'static) {
        self.controller.errors().subscribe(callback);
    }

    pub fn subscribe_speed(&self, callback: impl Fn(&SpeedSample) + Send + Sync + 'static) {
        self.poller.subscribe_speed(callback);
    }

    pub fn subscribe_diagnostic(
        &self,
        callback: impl Fn(&DiagnosticSample) + Send + Sync + 'static,
    ) {
        self.poller.subscribe_diagnostic(callback);
    }

    pub fn sequence(&self) -> &SequenceTable {
        &self.sequence
    }

    pub fn errors(&self) -> &ErrorSink {
        self.controller.errors()
    }

    pub fn mode(&self) -> OperationMode {
        self.controller.mode()
    }

    pub fn connection(&self) -> ConnectionState {
        self.controller.connection()
    }

    pub fn is_polling(&self) -> bool {
        self.poller.is_running()
    }
}

impl Drop for ControlPanel {
    fn drop(&mut self) {
        if self.controller.is_connected() {
            info!("Closing drive session on shutdown");
            let _ = self.close();
        }
    }
}
