// SIS bus - telegram exchange with one drive over a serial port

use std::io::{self, Read, Write};

use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use tracing::debug;

use super::telegram::{
    self, Attribute, Datablock, HEADER_LEN, ParamId, Service, decode_reaction, encode_command,
    list_payload, param_payload,
};
use crate::config::SERIAL_TIMEOUT;

/// Busy polls allowed while a procedure command runs
pub const MAX_COMMAND_POLLS: usize = 300;

/// Drive error code for a write-protected procedure command
const ERR_WRITE_PROTECTED: u16 = 0x700C;

/// Procedure command request values
const COMMAND_SET: f64 = 3.0;
const COMMAND_CLEAR: f64 = 0.0;

/// Procedure command status values
const STATUS_NOT_SET: u8 = 0x0;
const STATUS_OK: u8 = 0x3;
const STATUS_BUSY: u8 = 0x7;

/// Error types for SIS communication
#[derive(Debug, thiserror::Error)]
pub enum SisError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid response from drive: {reason}")]
    InvalidResponse { reason: String },

    #[error("Checksum mismatch in reaction telegram")]
    ChecksumMismatch,

    #[error("Drive returned error status 0x{status:02X}, code 0x{code:04X}")]
    Drive { status: u8, code: u16 },

    #[error("Timeout waiting for reaction telegram")]
    Timeout,

    #[error("Telegram of {len} bytes exceeds the SIS maximum")]
    TelegramTooLong { len: usize },

    #[error("List position {position} of {param} is out of range")]
    ListPosition { param: ParamId, position: u16 },

    #[error(
        "Command {param} cannot be executed because it is write-protected. \
         Release the drive torque (disable drive), or restart the drive."
    )]
    WriteProtected { param: ParamId },

    #[error("Command {param} stayed busy. Please restart the drive.")]
    CommandBusy { param: ParamId },

    #[error("Command {param} failed with status {status}")]
    CommandFailed { param: ParamId, status: u8 },

    #[error("Serial port is not open")]
    NotOpen,
}

pub type Result<T> = std::result::Result<T, SisError>;

/// Byte stream carrying SIS telegrams
pub trait Port: Read + Write + Send {
    /// Drop stale bytes before a new exchange
    fn discard_input(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Port for Box<dyn SerialPort> {
    fn discard_input(&mut self) -> io::Result<()> {
        self.clear(serialport::ClearBuffer::Input)?;
        Ok(())
    }
}

/// SIS bus - handles telegram exchange with the drive
pub struct SisBus<P: Port = Box<dyn SerialPort>> {
    port: P,
}

impl SisBus {
    /// Open the serial port with the SIS line settings (8N1, no handshake)
    pub fn open(port_name: &str, baud_rate: u32) -> Result<Self> {
        let port = serialport::new(port_name, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(SERIAL_TIMEOUT)
            .open()?;

        Ok(Self { port })
    }
}

impl<P: Port> SisBus<P> {
    pub fn new(port: P) -> Self {
        Self { port }
    }

    /// Send one command telegram and return the reaction data
    fn transceive(&mut self, service: Service, payload: &[u8]) -> Result<Vec<u8>> {
        let frame = encode_command(service, payload)?;
        debug!("SIS tx: {}", telegram::hex(&frame));

        self.port.discard_input()?;
        self.port.write_all(&frame)?;
        self.port.flush()?;

        let mut header = [0u8; HEADER_LEN];
        self.read_exact(&mut header)?;
        let len = telegram::payload_len(&header)?;

        let mut reaction = vec![0u8; HEADER_LEN + len];
        reaction[..HEADER_LEN].copy_from_slice(&header);
        self.read_exact(&mut reaction[HEADER_LEN..])?;
        debug!("SIS rx: {}", telegram::hex(&reaction));

        Ok(decode_reaction(&reaction, service)?.data)
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.port.read_exact(buf).map_err(|e| match e.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::UnexpectedEof => SisError::Timeout,
            _ => SisError::Io(e),
        })
    }

    /// Read the attribute word (data length, format, decimals) of a parameter
    pub fn attribute(&mut self, param: ParamId) -> Result<Attribute> {
        let payload = param_payload(Datablock::Attribute, param, &[]);
        let data = self.transceive(Service::ParamRead, &payload)?;
        let mut word = [0u8; 4];
        let len = data.len().min(4);
        word[..len].copy_from_slice(&data[..len]);
        Ok(Attribute(u32::from_le_bytes(word)))
    }

    /// Read the operating data of a parameter, scaled to its unit
    pub fn read_parameter(&mut self, param: ParamId) -> Result<f64> {
        let attr = self.attribute(param)?;
        let data = self.read_bytes(param)?;
        let value = attr.decode(&data);
        debug!("Read {} = {}", param, value);
        Ok(value)
    }

    /// Read the raw operating data bytes of a parameter (strings, lists)
    pub fn read_bytes(&mut self, param: ParamId) -> Result<Vec<u8>> {
        let payload = param_payload(Datablock::OperatingData, param, &[]);
        self.transceive(Service::ParamRead, &payload)
    }

    pub fn write_parameter(&mut self, param: ParamId, value: f64) -> Result<()> {
        let attr = self.attribute(param)?;
        let payload = param_payload(Datablock::OperatingData, param, &attr.encode(value));
        debug!("Write {} = {}", param, value);
        self.transceive(Service::ParamWrite, &payload)?;
        Ok(())
    }

    pub fn write_list_element(&mut self, param: ParamId, position: u16, value: f64) -> Result<()> {
        let attr = self.attribute(param)?;
        let (offset, size) = Self::segment(param, position, attr)?;
        let payload = list_payload(param, offset, size, &attr.encode(value));
        debug!("Write {}[{}] = {}", param, position, value);
        self.transceive(Service::ListWrite, &payload)?;
        Ok(())
    }

    /// Byte offset and size of one list element
    fn segment(param: ParamId, position: u16, attr: Attribute) -> Result<(u16, u16)> {
        let size = attr.data_len() as u16;
        let offset = position
            .checked_mul(size)
            .ok_or(SisError::ListPosition { param, position })?;
        Ok((offset, size))
    }

    /// Status of a procedure command parameter
    fn command_status(&mut self, param: ParamId) -> Result<u8> {
        let payload = param_payload(
            Datablock::IdentNumber,
            param,
            &param.number.to_le_bytes(),
        );
        let data = self.transceive(Service::ParamWrite, &payload)?;
        Ok(data.first().copied().unwrap_or(STATUS_NOT_SET))
    }

    fn wait_while_busy(&mut self, param: ParamId) -> Result<u8> {
        for _ in 0..MAX_COMMAND_POLLS {
            let status = self.command_status(param)?;
            if status != STATUS_BUSY {
                return Ok(status);
            }
        }
        Err(SisError::CommandBusy { param })
    }

    /// Run a procedure command (e.g. S-0-0420) to completion and reset it
    pub fn execute_command(&mut self, param: ParamId) -> Result<()> {
        debug!("Executing command {}", param);
        match self.write_parameter(param, COMMAND_SET) {
            Err(SisError::Drive {
                code: ERR_WRITE_PROTECTED,
                ..
            }) => return Err(SisError::WriteProtected { param }),
            other => other?,
        }

        let status = self.wait_while_busy(param)?;
        if status != STATUS_OK {
            return Err(SisError::CommandFailed { param, status });
        }

        self.write_parameter(param, COMMAND_CLEAR)?;
        let status = self.wait_while_busy(param)?;
        if status != STATUS_NOT_SET {
            return Err(SisError::CommandFailed { param, status });
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::link::sis::telegram::tests::reaction;

    /// In-memory port: replies are queued up front, writes are captured
    #[derive(Clone, Default)]
    pub(crate) struct ScriptedPort {
        pub(crate) rx: Arc<Mutex<VecDeque<u8>>>,
        pub(crate) tx: Arc<Mutex<Vec<u8>>>,
    }

    impl ScriptedPort {
        pub(crate) fn reply(&self, frame: Vec<u8>) {
            self.rx.lock().extend(frame);
        }
    }

    impl Read for ScriptedPort {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut rx = self.rx.lock();
            if rx.is_empty() {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
            }
            let n = buf.len().min(rx.len());
            for slot in buf.iter_mut().take(n) {
                *slot = rx.pop_front().unwrap_or_default();
            }
            Ok(n)
        }
    }

    impl Write for ScriptedPort {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.tx.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Port for ScriptedPort {}

    /// 4-byte signed parameter with `decimals` places
    pub(crate) fn attr_word(decimals: u32) -> Vec<u8> {
        ((0b010 << 16) | (0b010 << 20) | (decimals << 24))
            .to_le_bytes()
            .to_vec()
    }

    #[test]
    fn test_read_parameter_applies_scaling() {
        let port = ScriptedPort::default();
        port.reply(reaction(Service::ParamRead, 0, &attr_word(4)));
        port.reply(reaction(
            Service::ParamRead,
            0,
            &15_000_000u32.to_le_bytes(),
        ));

        let mut bus = SisBus::new(port.clone());
        let value = bus.read_parameter(ParamId::s(40)).unwrap();
        assert_eq!(value, 1500.0);

        // Two telegrams: attribute request, then operating data
        let tx = port.tx.lock().clone();
        assert_eq!(tx.len(), 2 * (HEADER_LEN + 5));
        assert_eq!(tx[HEADER_LEN], Datablock::Attribute.control_byte());
        assert_eq!(tx[2 * HEADER_LEN + 5], Datablock::OperatingData.control_byte());
    }

    #[test]
    fn test_write_list_element_offset() {
        let port = ScriptedPort::default();
        port.reply(reaction(Service::ParamRead, 0, &attr_word(0)));
        port.reply(reaction(Service::ListWrite, 0, &[]));

        let mut bus = SisBus::new(port.clone());
        bus.write_list_element(ParamId::p(1389), 3, 250.0).unwrap();

        let tx = port.tx.lock().clone();
        let list = &tx[HEADER_LEN + 5..];
        assert_eq!(list[5], 0x1E);
        let payload = &list[HEADER_LEN..];
        assert_eq!(&payload[5..9], &[12, 0, 4, 0]);
        assert_eq!(&payload[9..], &250u32.to_le_bytes());
    }

    #[test]
    fn test_missing_reaction_times_out() {
        let mut bus = SisBus::new(ScriptedPort::default());
        assert!(matches!(
            bus.read_bytes(ParamId::s(95)),
            Err(SisError::Timeout)
        ));
    }

    #[test]
    fn test_execute_command_sequence() {
        let port = ScriptedPort::default();
        let param = ParamId::s(420);
        // set request
        port.reply(reaction(Service::ParamRead, 0, &attr_word(0)));
        port.reply(reaction(Service::ParamWrite, 0, &[]));
        // busy, then ok
        port.reply(reaction(Service::ParamWrite, 0, &[STATUS_BUSY]));
        port.reply(reaction(Service::ParamWrite, 0, &[STATUS_OK]));
        // clear request, then not set
        port.reply(reaction(Service::ParamRead, 0, &attr_word(0)));
        port.reply(reaction(Service::ParamWrite, 0, &[]));
        port.reply(reaction(Service::ParamWrite, 0, &[STATUS_NOT_SET]));

        let mut bus = SisBus::new(port.clone());
        bus.execute_command(param).unwrap();
        assert!(port.rx.lock().is_empty());
    }

    #[test]
    fn test_write_protected_command() {
        let port = ScriptedPort::default();
        port.reply(reaction(Service::ParamRead, 0, &attr_word(0)));
        port.reply(reaction(Service::ParamWrite, 1, &[0x0C, 0x70]));

        let mut bus = SisBus::new(port);
        assert!(matches!(
            bus.execute_command(ParamId::s(420)),
            Err(SisError::WriteProtected { .. })
        ));
    }

    #[test]
    fn test_failed_command_status() {
        let port = ScriptedPort::default();
        port.reply(reaction(Service::ParamRead, 0, &attr_word(0)));
        port.reply(reaction(Service::ParamWrite, 0, &[]));
        port.reply(reaction(Service::ParamWrite, 0, &[0xF]));

        let mut bus = SisBus::new(port);
        assert!(matches!(
            bus.execute_command(ParamId::s(422)),
            Err(SisError::CommandFailed { status: 0xF, .. })
        ));
    }
}
