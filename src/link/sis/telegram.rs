// SIS telegram layout
//
// Frame: [STX, CS, DatL, DatLW, Cntrl, Service, AdrS, AdrE, payload...]
// - DatL/DatLW: payload length (repeated)
// - CS: chosen so that all frame bytes sum to zero (mod 256)
//
// Command payloads (SERCOS services):
// - parameter: [control, unit, type, ident_lo, ident_hi, data...]
// - list:      [control, unit, type, ident_lo, ident_hi, off_lo, off_hi, size_lo, size_hi, data...]
// Reaction payload: [status, control, unit, data... | error_lo, error_hi]

use std::fmt;

use super::bus::SisError;

pub const STX: u8 = 0x02;
pub const HEADER_LEN: usize = 8;
pub const MAX_TELEGRAM_LEN: usize = 254;
pub const MAX_PAYLOAD_LEN: usize = MAX_TELEGRAM_LEN - HEADER_LEN;

/// SIS address of this host
pub const ADDR_MASTER: u8 = 0x00;
/// SIS address of the drive
pub const ADDR_SLAVE: u8 = 0x01;
/// Unit address inside the drive (P-0-4022)
pub const ADDR_UNIT: u8 = 0x01;

/// Header control bit marking a reaction telegram
const CNTRL_REACTION: u8 = 1 << 4;

/// SERCOS services used by this crate
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    ParamRead = 0x10,
    ListRead = 0x11,
    ListWrite = 0x1E,
    ParamWrite = 0x1F,
}

/// Data block of a SERCOS parameter addressed by the control byte
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Datablock {
    IdentNumber = 1,
    Name = 2,
    Attribute = 3,
    Unit = 4,
    MinValue = 5,
    MaxValue = 6,
    OperatingData = 7,
}

impl Datablock {
    /// SERCOS control byte: final transmission, this data block
    pub fn control_byte(self) -> u8 {
        (1 << 2) | ((self as u8) << 3)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    S,
    P,
}

/// SERCOS parameter identifier, e.g. S-0-0036 or P-0-1371
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamId {
    pub kind: ParamKind,
    pub number: u16,
}

impl ParamId {
    pub const fn s(number: u16) -> Self {
        Self {
            kind: ParamKind::S,
            number,
        }
    }

    pub const fn p(number: u16) -> Self {
        Self {
            kind: ParamKind::P,
            number,
        }
    }

    /// 16-bit ident: bits 0-11 number, bits 12-14 set (always 0), bit 15 P-parameter
    pub fn ident(self) -> u16 {
        let variant = match self.kind {
            ParamKind::S => 0,
            ParamKind::P => 0x8000,
        };
        variant | (self.number & 0x0FFF)
    }
}

impl fmt::Display for ParamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            ParamKind::S => 'S',
            ParamKind::P => 'P',
        };
        write!(f, "{}-0-{:04}", kind, self.number)
    }
}

/// Display format of parameter data (attribute bits 20-22)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFormat {
    Binary,
    Unsigned,
    Signed,
    Float,
    Other,
}

/// Parameter attribute word, read from the attribute data block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attribute(pub u32);

impl Attribute {
    /// Byte length of one value (or list element)
    pub fn data_len(self) -> usize {
        match (self.0 >> 16) & 0b111 {
            0b001 | 0b101 => 2,
            0b010 | 0b110 => 4,
            0b011 | 0b111 => 8,
            _ => 1,
        }
    }

    /// Places after the decimal point of fixed-point data
    pub fn decimals(self) -> u32 {
        (self.0 >> 24) & 0x0F
    }

    pub fn format(self) -> DataFormat {
        match (self.0 >> 20) & 0b111 {
            0b000 => DataFormat::Binary,
            0b001 => DataFormat::Unsigned,
            0b010 => DataFormat::Signed,
            0b110 => DataFormat::Float,
            _ => DataFormat::Other,
        }
    }

    /// Encode a value as `data_len` little-endian bytes
    pub fn encode(self, value: f64) -> Vec<u8> {
        let len = self.data_len();
        let raw: u64 = match self.format() {
            DataFormat::Float if len == 4 => (value as f32).to_bits() as u64,
            DataFormat::Float => value.to_bits(),
            _ => {
                let scaled = (value * 10f64.powi(self.decimals() as i32)).round();
                // Two's complement covers signed values; unsigned ones are never negative
                (scaled as i64) as u64
            }
        };
        raw.to_le_bytes()[..len].to_vec()
    }

    /// Decode `data_len` little-endian bytes into a value
    pub fn decode(self, data: &[u8]) -> f64 {
        let len = self.data_len().min(data.len()).min(8);
        if len == 0 {
            return 0.0;
        }
        let mut bytes = [0u8; 8];
        bytes[..len].copy_from_slice(&data[..len]);
        let raw = u64::from_le_bytes(bytes);

        match self.format() {
            DataFormat::Float if len == 4 => f32::from_bits(raw as u32) as f64,
            DataFormat::Float => f64::from_bits(raw),
            DataFormat::Signed => {
                let shift = 64 - 8 * len as u32;
                let signed = ((raw << shift) as i64) >> shift;
                signed as f64 / 10f64.powi(self.decimals() as i32)
            }
            _ => raw as f64 / 10f64.powi(self.decimals() as i32),
        }
    }
}

/// Payload of a single-parameter service
pub fn param_payload(block: Datablock, param: ParamId, data: &[u8]) -> Vec<u8> {
    let ident = param.ident().to_le_bytes();
    let mut payload = vec![block.control_byte(), ADDR_UNIT, 0, ident[0], ident[1]];
    payload.extend_from_slice(data);
    payload
}

/// Payload of a list-segment service
pub fn list_payload(param: ParamId, offset: u16, segment_size: u16, data: &[u8]) -> Vec<u8> {
    let ident = param.ident().to_le_bytes();
    let offset = offset.to_le_bytes();
    let size = segment_size.to_le_bytes();
    let mut payload = vec![
        Datablock::OperatingData.control_byte(),
        ADDR_UNIT,
        0,
        ident[0],
        ident[1],
        offset[0],
        offset[1],
        size[0],
        size[1],
    ];
    payload.extend_from_slice(data);
    payload
}

/// Two's complement of the byte sum, so the whole frame sums to zero
pub fn checksum(bytes: &[u8]) -> u8 {
    let sum = bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    0u8.wrapping_sub(sum)
}

/// Build a command telegram around `payload`
pub fn encode_command(service: Service, payload: &[u8]) -> Result<Vec<u8>, SisError> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(SisError::TelegramTooLong {
            len: HEADER_LEN + payload.len(),
        });
    }

    let len = payload.len() as u8;
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&[
        STX,
        0, // checksum, filled below
        len,
        len,
        0, // command telegram, no sub-addresses
        service as u8,
        ADDR_MASTER,
        ADDR_SLAVE,
    ]);
    frame.extend_from_slice(payload);
    frame[1] = checksum(&frame);
    Ok(frame)
}

/// Decoded reaction telegram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reaction {
    pub service: u8,
    pub data: Vec<u8>,
}

/// Payload length announced by a reaction header
pub fn payload_len(header: &[u8; HEADER_LEN]) -> Result<usize, SisError> {
    if header[0] != STX {
        return Err(SisError::InvalidResponse {
            reason: format!("Invalid start byte: 0x{:02X}", header[0]),
        });
    }
    if header[2] != header[3] {
        return Err(SisError::InvalidResponse {
            reason: format!("Length mismatch: DatL={} DatLW={}", header[2], header[3]),
        });
    }
    Ok(header[2] as usize)
}

/// Check and decode a complete reaction telegram
pub fn decode_reaction(frame: &[u8], expected: Service) -> Result<Reaction, SisError> {
    if frame.len() < HEADER_LEN {
        return Err(SisError::InvalidResponse {
            reason: format!("Telegram too short: {} bytes", frame.len()),
        });
    }
    let mut header = [0u8; HEADER_LEN];
    header.copy_from_slice(&frame[..HEADER_LEN]);
    let len = payload_len(&header)?;

    if frame.len() != HEADER_LEN + len {
        return Err(SisError::InvalidResponse {
            reason: format!("Expected {} bytes, got {}", HEADER_LEN + len, frame.len()),
        });
    }
    if checksum(frame) != 0 {
        return Err(SisError::ChecksumMismatch);
    }
    if header[4] & CNTRL_REACTION == 0 {
        return Err(SisError::InvalidResponse {
            reason: "Telegram is not a reaction".to_string(),
        });
    }
    if header[5] != expected as u8 {
        return Err(SisError::InvalidResponse {
            reason: format!(
                "Service mismatch: expected 0x{:02X}, got 0x{:02X}",
                expected as u8, header[5]
            ),
        });
    }
    if len == 0 {
        return Err(SisError::InvalidResponse {
            reason: "Reaction telegram without payload".to_string(),
        });
    }

    let payload = &frame[HEADER_LEN..];
    let status = payload[0];
    let data = payload.get(3..).unwrap_or_default();

    if status != 0 {
        let code = match data {
            [lo, hi, ..] => u16::from_le_bytes([*lo, *hi]),
            [lo] => *lo as u16,
            [] => 0,
        };
        return Err(SisError::Drive { status, code });
    }

    Ok(Reaction {
        service: header[5],
        data: data.to_vec(),
    })
}

/// Hex dump used in log and error messages
pub fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
