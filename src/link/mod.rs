// Command channel to the drive
//
// Provides:
// - DriveLink: the capability every drive backend implements
// - LinkHandle: the single exclusive access point shared by command
//   dispatch and telemetry polling
// - SimulatedDrive: in-memory drive with a call log
// - sis: IndraDrive SIS protocol over RS232

use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::DIAGNOSTIC_MSG_LEN;
use crate::error::ErrorRecord;

mod sim;
pub mod sis;

pub use sim::{LinkCall, SimulatedDrive};
pub use sis::SisDriveLink;

pub type LinkResult<T> = std::result::Result<T, ErrorRecord>;

/// Drive-reported mode code for the sequencer
pub const MODE_CODE_SEQUENCER: u32 = 1;
/// Drive-reported mode code for speed control
pub const MODE_CODE_SPEED: u32 = 2;

/// Operations offered by a drive backend.
///
/// Every call blocks until the drive answered. A failed call returns the
/// error record describing it; implementations are not required to be
/// re-entrant, so callers go through [`LinkHandle`].
pub trait DriveLink: Send {
    fn open(&mut self, port: &str, baud_rate: u32) -> LinkResult<()>;
    fn close(&mut self) -> LinkResult<()>;

    fn speed_mode_activate(&mut self) -> LinkResult<()>;
    fn speed_mode_init(&mut self, max_accel: f64, max_jerk: f64) -> LinkResult<()>;
    fn speed_mode_write(&mut self, speed: f64, accel: f64) -> LinkResult<()>;

    fn sequencer_activate(&mut self) -> LinkResult<()>;
    fn sequencer_init(&mut self, max_accel: f64, max_jerk: f64) -> LinkResult<()>;
    /// Transmit a whole sequence in one call. All slices hold `count` items.
    fn sequencer_write(
        &mut self,
        speeds: &[f64],
        accels: &[f64],
        jerks: &[f64],
        delays: &[u32],
        count: u16,
    ) -> LinkResult<()>;
    fn sequencer_soft_trigger(&mut self) -> LinkResult<()>;

    /// Mode code: 1 = sequencer, 2 = speed control, anything else unknown
    fn drive_mode(&mut self) -> LinkResult<u32>;
    /// Operating-state bitmask; bits 0 and 1 set means released
    fn operating_state(&mut self) -> LinkResult<u8>;
    fn speed(&mut self) -> LinkResult<f64>;
    /// NUL-terminated diagnostic text
    fn diagnostic_message(&mut self) -> LinkResult<[u8; DIAGNOSTIC_MSG_LEN]>;
    fn diagnostic_number(&mut self) -> LinkResult<u32>;
    fn clear_error(&mut self) -> LinkResult<()>;
}

/// Exclusive, cloneable access to one drive session
#[derive(Clone)]
pub struct LinkHandle {
    inner: Arc<Mutex<Box<dyn DriveLink>>>,
}

impl LinkHandle {
    pub fn new(link: impl DriveLink + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(link))),
        }
    }

    /// Run `f` with the link locked. Nothing else reaches the drive meanwhile.
    pub fn with<R>(&self, f: impl FnOnce(&mut dyn DriveLink) -> R) -> R {
        let mut guard = self.inner.lock();
        f(&mut **guard)
    }
}

impl std::fmt::Debug for LinkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkHandle")
            .field("locked", &self.inner.is_locked())
            .finish()
    }
}
