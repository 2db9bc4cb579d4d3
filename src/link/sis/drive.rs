// IndraDrive operations on top of the SIS bus
//
// Maps every DriveLink call onto SERCOS parameter traffic. Failures are
// turned into ErrorRecords tagged with the functional block they came from.

use serialport::SerialPort;
use tracing::{debug, info, warn};

use super::bus::{Port, SisBus, SisError};
use super::telegram::ParamId;
use crate::config::DIAGNOSTIC_MSG_LEN;
use crate::error::{ErrorBlock, ErrorRecord};
use crate::link::{DriveLink, LinkResult, MODE_CODE_SEQUENCER, MODE_CODE_SPEED};

/// Primary operation mode values (S-0-0032)
pub const DRIVEMODE_SPEEDCONTROL: u64 = 0b10;
pub const DRIVEMODE_SEQUENCER: u64 = 0b111011;

/// Velocity scaling: preferred scaling, rotary, rpm (S-0-0044)
const SCALING_ROTARY_RPM: u64 = 0b010;

/// Sequencer step mode flag (P-0-4019)
const STEP_MODE_ABSOLUTE: u32 = 0b1000_0000;

// Parameters used by the operations below
const PRIMARY_MODE: ParamId = ParamId::s(32);
const SPEED_SETPOINT: ParamId = ParamId::s(36);
const VELOCITY_FEEDBACK: ParamId = ParamId::s(40);
const VELOCITY_SCALING: ParamId = ParamId::s(44);
const DIAGNOSTIC_MESSAGE: ParamId = ParamId::s(95);
const RESET_CLASS1_DIAG: ParamId = ParamId::s(99);
const MAX_ACCEL: ParamId = ParamId::s(138);
const MAX_JERK: ParamId = ParamId::s(349);
const DIAGNOSTIC_NUMBER: ParamId = ParamId::s(390);
const ENTER_PARAM_MODE: ParamId = ParamId::s(420);
const LEAVE_PARAM_MODE: ParamId = ParamId::s(422);
const DEVICE_STATUS: ParamId = ParamId::p(115);
const CONTROL_MODE: ParamId = ParamId::p(1200);
const SPEED_ACCEL: ParamId = ParamId::p(1203);
const SEQ_STEP_COUNT: ParamId = ParamId::p(1370);
const SEQ_READ_TRIGGER: ParamId = ParamId::p(1371);
const SEQ_START_TRIGGER: ParamId = ParamId::p(1372);
const SEQ_DELAYS: ParamId = ParamId::p(1389);
const SEQ_STATUS: ParamId = ParamId::p(1410);
const SEQ_POSITIONS: ParamId = ParamId::p(4006);
const SEQ_SPEEDS: ParamId = ParamId::p(4007);
const SEQ_ACCELS: ParamId = ParamId::p(4008);
const SEQ_JERKS: ParamId = ParamId::p(4009);
const SEQ_WAITS: ParamId = ParamId::p(4018);
const SEQ_MODES: ParamId = ParamId::p(4019);
const SEQ_DECELS: ParamId = ParamId::p(4063);

/// Bytes ahead of the text in the diagnostic message list (actual/max length)
const LIST_HEADER_LEN: usize = 4;

type Opener<P> = Box<dyn FnMut(&str, u32) -> Result<SisBus<P>, SisError> + Send>;

/// Drive link speaking SIS to an IndraDrive
pub struct SisDriveLink<P: Port = Box<dyn SerialPort>> {
    bus: Option<SisBus<P>>,
    opener: Opener<P>,
}

impl SisDriveLink {
    /// Session that opens a serial port on `open`
    pub fn new() -> Self {
        Self::with_opener(SisBus::open)
    }
}

impl Default for SisDriveLink {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Port> SisDriveLink<P> {
    /// Session using a custom way to reach the drive
    pub fn with_opener(
        opener: impl FnMut(&str, u32) -> Result<SisBus<P>, SisError> + Send + 'static,
    ) -> Self {
        Self {
            bus: None,
            opener: Box::new(opener),
        }
    }

    /// Run `f` on the open bus, tagging failures with `block`
    fn run<T>(
        &mut self,
        block: ErrorBlock,
        f: impl FnOnce(&mut SisBus<P>) -> Result<T, SisError>,
    ) -> LinkResult<T> {
        let bus = self
            .bus
            .as_mut()
            .ok_or_else(|| ErrorRecord::from_block(block, SisError::NotOpen.to_string()))?;
        f(bus).map_err(|e| {
            warn!("SIS {:?} failed: {}", block, e);
            ErrorRecord::from_block(block, e.to_string())
        })
    }

    fn change_mode(bus: &mut SisBus<P>, mode: u64) -> Result<(), SisError> {
        let current = bus.read_parameter(PRIMARY_MODE)? as u64;
        // Mode changes write to flash; skip when already active
        if current == mode {
            debug!("Drive already in mode 0b{:b}", mode);
            return Ok(());
        }
        info!("Switching drive mode 0b{:b} -> 0b{:b}", current, mode);
        bus.execute_command(ENTER_PARAM_MODE)?;
        bus.write_parameter(PRIMARY_MODE, mode as f64)?;
        bus.execute_command(LEAVE_PARAM_MODE)
    }

    fn ensure_rpm_units(bus: &mut SisBus<P>) -> Result<(), SisError> {
        let units = bus.read_parameter(VELOCITY_SCALING)? as u64;
        // Scaling type bits 0-2, flag bits 3-6 must be clear
        if units & 0x7F == SCALING_ROTARY_RPM {
            return Ok(());
        }
        bus.write_parameter(VELOCITY_SCALING, SCALING_ROTARY_RPM as f64)
    }

    fn init_limits(bus: &mut SisBus<P>, max_accel: f64, max_jerk: f64) -> Result<(), SisError> {
        Self::ensure_rpm_units(bus)?;
        bus.write_parameter(MAX_ACCEL, max_accel)?;
        bus.write_parameter(MAX_JERK, max_jerk)
    }
}

/// Rotation direction bits of a sequencer step
fn direction_bits(speed: f64) -> u32 {
    if speed > 0.0 { 0b01 << 2 } else { 0b10 << 2 }
}

impl<P: Port> DriveLink for SisDriveLink<P> {
    fn open(&mut self, port: &str, baud_rate: u32) -> LinkResult<()> {
        info!("Opening SIS link on {} at {} baud", port, baud_rate);
        let bus = (self.opener)(port, baud_rate)
            .map_err(|e| ErrorRecord::from_block(ErrorBlock::OpenByCom, e.to_string()))?;
        self.bus = Some(bus);
        Ok(())
    }

    fn close(&mut self) -> LinkResult<()> {
        match self.bus.take() {
            Some(_) => {
                info!("SIS link closed");
                Ok(())
            }
            None => Err(ErrorRecord::from_block(
                ErrorBlock::Close,
                SisError::NotOpen.to_string(),
            )),
        }
    }

    fn speed_mode_activate(&mut self) -> LinkResult<()> {
        self.run(ErrorBlock::SpeedInit, |bus| {
            Self::change_mode(bus, DRIVEMODE_SPEEDCONTROL)
        })
    }

    fn speed_mode_init(&mut self, max_accel: f64, max_jerk: f64) -> LinkResult<()> {
        self.run(ErrorBlock::SpeedInit, |bus| {
            Self::init_limits(bus, max_accel, max_jerk)
        })
    }

    fn speed_mode_write(&mut self, speed: f64, accel: f64) -> LinkResult<()> {
        self.run(ErrorBlock::SpeedWrite, |bus| {
            // Bit 10 selects positive rotation
            let rotation = if speed > 0.0 { 1u32 << 10 } else { 0 };
            bus.write_parameter(CONTROL_MODE, rotation as f64)?;
            bus.write_parameter(SPEED_ACCEL, accel)?;
            bus.write_parameter(SPEED_SETPOINT, speed.abs())
        })
    }

    fn sequencer_activate(&mut self) -> LinkResult<()> {
        self.run(ErrorBlock::SeqInit, |bus| {
            Self::change_mode(bus, DRIVEMODE_SEQUENCER)
        })
    }

    fn sequencer_init(&mut self, max_accel: f64, max_jerk: f64) -> LinkResult<()> {
        self.run(ErrorBlock::SeqInit, |bus| {
            Self::init_limits(bus, max_accel, max_jerk)?;
            bus.write_parameter(SEQ_READ_TRIGGER, 0.0)?;
            bus.write_parameter(SEQ_START_TRIGGER, 0.0)
        })
    }

    fn sequencer_write(
        &mut self,
        speeds: &[f64],
        accels: &[f64],
        jerks: &[f64],
        delays: &[u32],
        count: u16,
    ) -> LinkResult<()> {
        let n = count as usize;
        if speeds.len() < n || accels.len() < n || jerks.len() < n || delays.len() < n {
            return Err(ErrorRecord::from_block(
                ErrorBlock::SeqWrite,
                format!("Sequence arrays are shorter than count {}", count),
            ));
        }

        self.run(ErrorBlock::SeqWrite, |bus| {
            // Drive list positions start at 1
            for (i, position) in (1..=count).enumerate() {
                let speed = speeds[i];
                bus.write_list_element(SEQ_SPEEDS, position, speed.abs())?;
                bus.write_list_element(SEQ_ACCELS, position, accels[i])?;
                bus.write_list_element(SEQ_DECELS, position, accels[i])?;
                bus.write_list_element(SEQ_JERKS, position, jerks[i])?;
                let mode = STEP_MODE_ABSOLUTE | direction_bits(speed);
                bus.write_list_element(SEQ_MODES, position, mode as f64)?;
                bus.write_list_element(SEQ_POSITIONS, position, 0.0)?;
                bus.write_list_element(SEQ_WAITS, position, 0.0)?;
                bus.write_list_element(SEQ_DELAYS, position, delays[i] as f64)?;
            }
            bus.write_parameter(SEQ_STEP_COUNT, count as f64)
        })
    }

    fn sequencer_soft_trigger(&mut self) -> LinkResult<()> {
        self.run(ErrorBlock::SeqWrite, |bus| {
            // Feed the table, then start it; each edge is a 0 -> 1 transition
            bus.write_parameter(SEQ_READ_TRIGGER, 0.0)?;
            bus.write_parameter(SEQ_READ_TRIGGER, 1.0)?;
            let status = bus.read_parameter(SEQ_STATUS)?;
            debug!("Sequencer status after read trigger: {}", status);

            bus.write_parameter(SEQ_START_TRIGGER, 0.0)?;
            bus.write_parameter(SEQ_START_TRIGGER, 1.0)?;
            let status = bus.read_parameter(SEQ_STATUS)?;
            debug!("Sequencer status after start trigger: {}", status);
            Ok(())
        })
    }

    fn drive_mode(&mut self) -> LinkResult<u32> {
        self.run(ErrorBlock::Status, |bus| {
            let mode = bus.read_parameter(PRIMARY_MODE)? as u64;
            Ok(match mode {
                DRIVEMODE_SEQUENCER => MODE_CODE_SEQUENCER,
                DRIVEMODE_SPEEDCONTROL => MODE_CODE_SPEED,
                _ => 0,
            })
        })
    }

    fn operating_state(&mut self) -> LinkResult<u8> {
        self.run(ErrorBlock::Status, |bus| {
            let status = bus.read_parameter(DEVICE_STATUS)? as u64;
            // Bits 14-15 of the status word hold the operating state
            Ok(((status >> 14) & 0b11) as u8)
        })
    }

    fn speed(&mut self) -> LinkResult<f64> {
        self.run(ErrorBlock::Status, |bus| bus.read_parameter(VELOCITY_FEEDBACK))
    }

    fn diagnostic_message(&mut self) -> LinkResult<[u8; DIAGNOSTIC_MSG_LEN]> {
        self.run(ErrorBlock::Status, |bus| {
            let data = bus.read_bytes(DIAGNOSTIC_MESSAGE)?;
            let text = data.get(LIST_HEADER_LEN..).unwrap_or_default();
            let mut buf = [0u8; DIAGNOSTIC_MSG_LEN];
            let len = text.len().min(DIAGNOSTIC_MSG_LEN - 1);
            buf[..len].copy_from_slice(&text[..len]);
            Ok(buf)
        })
    }

    fn diagnostic_number(&mut self) -> LinkResult<u32> {
        self.run(ErrorBlock::Status, |bus| {
            Ok(bus.read_parameter(DIAGNOSTIC_NUMBER)? as u32)
        })
    }

    fn clear_error(&mut self) -> LinkResult<()> {
        self.run(ErrorBlock::ClearError, |bus| {
            bus.execute_command(RESET_CLASS1_DIAG)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::sis::bus::tests::{ScriptedPort, attr_word};
    use crate::link::sis::telegram::Service;
    use crate::link::sis::telegram::tests::reaction;

    fn scripted_link(port: &ScriptedPort) -> SisDriveLink<ScriptedPort> {
        let port = port.clone();
        let mut link = SisDriveLink::with_opener(move |_, _| Ok(SisBus::new(port.clone())));
        link.open("COM3", 19200).unwrap();
        link
    }

    #[test]
    fn test_calls_before_open_fail() {
        let mut link = SisDriveLink::with_opener(|_, _| Ok(SisBus::new(ScriptedPort::default())));
        let err = link.speed().unwrap_err();
        assert_eq!(err.code, ErrorBlock::Status.code());
        let err = link.close().unwrap_err();
        assert_eq!(err.code, ErrorBlock::Close.code());
    }

    #[test]
    fn test_open_failure_uses_open_block() {
        let mut link: SisDriveLink<ScriptedPort> =
            SisDriveLink::with_opener(|_, _| Err(SisError::Timeout));
        let err = link.open("COM9", 19200).unwrap_err();
        assert_eq!(err.code, ErrorBlock::OpenByCom.code());
        assert!(err.message.contains("Timeout"));
    }

    #[test]
    fn test_drive_mode_maps_primary_mode() {
        let port = ScriptedPort::default();
        let mut link = scripted_link(&port);

        port.reply(reaction(Service::ParamRead, 0, &attr_word(0)));
        port.reply(reaction(
            Service::ParamRead,
            0,
            &(DRIVEMODE_SEQUENCER as u32).to_le_bytes(),
        ));
        assert_eq!(link.drive_mode().unwrap(), MODE_CODE_SEQUENCER);

        port.reply(reaction(Service::ParamRead, 0, &attr_word(0)));
        port.reply(reaction(Service::ParamRead, 0, &0b1011u32.to_le_bytes()));
        assert_eq!(link.drive_mode().unwrap(), 0);
    }

    #[test]
    fn test_operating_state_from_status_word() {
        let port = ScriptedPort::default();
        let mut link = scripted_link(&port);

        port.reply(reaction(Service::ParamRead, 0, &attr_word(0)));
        port.reply(reaction(Service::ParamRead, 0, &0xC123u32.to_le_bytes()));
        assert_eq!(link.operating_state().unwrap(), 0b11);
    }

    #[test]
    fn test_diagnostic_message_skips_list_header() {
        let port = ScriptedPort::default();
        let mut link = scripted_link(&port);

        let text = b"A0012 Control and power sections ready";
        let mut data = vec![text.len() as u8, 0, 0xFF, 0];
        data.extend_from_slice(text);
        port.reply(reaction(Service::ParamRead, 0, &data));

        let buf = link.diagnostic_message().unwrap();
        assert_eq!(&buf[..text.len()], text);
        assert_eq!(buf[text.len()], 0);
    }

    #[test]
    fn test_drive_error_tagged_with_block() {
        let port = ScriptedPort::default();
        let mut link = scripted_link(&port);

        port.reply(reaction(Service::ParamRead, 1, &[0x01, 0x10]));
        let err = link.speed().unwrap_err();
        assert_eq!(err.code, ErrorBlock::Status.code());
    }

    #[test]
    fn test_short_sequence_arrays_rejected_without_traffic() {
        let port = ScriptedPort::default();
        let mut link = scripted_link(&port);

        let err = link
            .sequencer_write(&[100.0], &[10.0], &[10.0], &[], 1)
            .unwrap_err();
        assert_eq!(err.code, ErrorBlock::SeqWrite.code());
        assert!(port.tx.lock().is_empty());
    }

    #[test]
    fn test_direction_bits() {
        assert_eq!(STEP_MODE_ABSOLUTE | direction_bits(500.0), 0b1000_0100);
        assert_eq!(STEP_MODE_ABSOLUTE | direction_bits(-500.0), 0b1000_1000);
        assert_eq!(direction_bits(0.0), 0b1000);
    }
}
