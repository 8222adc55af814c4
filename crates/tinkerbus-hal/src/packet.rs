//! Brick daemon packet codec.
//!
//! Every packet starts with an 8-byte little-endian header:
//!
//! | Offset | Size | Field |
//! |---|---|---|
//! | 0 | 4 | device UID (numeric) |
//! | 4 | 1 | total packet length, header included |
//! | 5 | 1 | function id |
//! | 6 | 1 | `sequence << 4 \| response_expected << 3` |
//! | 7 | 1 | flags, error code in bits 6–7 |
//!
//! Sequence `0` marks a callback; requests cycle through `1..=15`.
//!
//! UIDs travel as `u32` inside the header and as base58 strings everywhere
//! else.

use tinkerbus_types::{DeviceError, EnumerationCause, EnumerationNotification, Identity};

pub const HEADER_LEN: usize = 8;
pub const MAX_PACKET_LEN: usize = 80;

/// Broadcast request asking every device to announce itself.
pub const FUNCTION_ENUMERATE: u8 = 254;
/// Callback carrying one enumeration notification.
pub const CALLBACK_ENUMERATE: u8 = 253;
/// Identity query understood by every device.
pub const FUNCTION_GET_IDENTITY: u8 = 255;

const ENUMERATE_PAYLOAD_LEN: usize = 26;
const IDENTITY_PAYLOAD_LEN: usize = 25;
const UID_FIELD_LEN: usize = 8;

const ERROR_CODE_OK: u8 = 0;
const ERROR_CODE_INVALID_PARAMETER: u8 = 1;
const ERROR_CODE_FUNCTION_NOT_SUPPORTED: u8 = 2;

const BASE58_ALPHABET: &[u8; 58] = b"123456789abcdefghijkmnopqrstuvwxyzABCDEFGHJKLMNPQRSTUVWXYZ";

// ─────────────────────────────────────────────────────────────────────────────
// Header
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub uid: u32,
    pub length: u8,
    pub function_id: u8,
    pub sequence: u8,
    pub response_expected: bool,
    pub error_code: u8,
}

impl Header {
    pub fn to_bytes(self) -> [u8; HEADER_LEN] {
        let uid = self.uid.to_le_bytes();
        let options = (self.sequence & 0x0f) << 4 | u8::from(self.response_expected) << 3;
        [
            uid[0],
            uid[1],
            uid[2],
            uid[3],
            self.length,
            self.function_id,
            options,
            (self.error_code & 0x03) << 6,
        ]
    }

    /// Decode a header; `None` when fewer than 8 bytes are given or the
    /// declared length is impossible.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let raw: &[u8; HEADER_LEN] = bytes.get(..HEADER_LEN)?.try_into().ok()?;
        let length = raw[4];
        if usize::from(length) < HEADER_LEN || usize::from(length) > MAX_PACKET_LEN {
            return None;
        }
        Some(Self {
            uid: u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            length,
            function_id: raw[5],
            sequence: raw[6] >> 4,
            response_expected: raw[6] & 0x08 != 0,
            error_code: raw[7] >> 6,
        })
    }

    /// Payload length announced by this header.
    pub fn payload_len(&self) -> usize {
        usize::from(self.length) - HEADER_LEN
    }

    pub fn is_callback(&self) -> bool {
        self.sequence == 0
    }

    /// Map the error code of a response to a [`DeviceError`].
    pub fn check_error(&self) -> Result<(), DeviceError> {
        match self.error_code {
            ERROR_CODE_OK => Ok(()),
            ERROR_CODE_INVALID_PARAMETER => Err(DeviceError::InvalidParameter {
                uid: base58_encode(self.uid),
                function_id: self.function_id,
            }),
            ERROR_CODE_FUNCTION_NOT_SUPPORTED => Err(DeviceError::FunctionNotSupported {
                uid: base58_encode(self.uid),
                function_id: self.function_id,
            }),
            other => Err(DeviceError::MalformedResponse {
                uid: base58_encode(self.uid),
                details: format!("unknown error code {other}"),
            }),
        }
    }
}

/// Serialize a complete packet.
///
/// Payloads are at most 72 bytes for every function this crate issues.
pub fn encode_packet(
    uid: u32,
    function_id: u8,
    sequence: u8,
    response_expected: bool,
    payload: &[u8],
) -> Vec<u8> {
    let length = u8::try_from(HEADER_LEN + payload.len()).unwrap_or(u8::MAX);
    let header = Header {
        uid,
        length,
        function_id,
        sequence,
        response_expected,
        error_code: ERROR_CODE_OK,
    };
    let mut packet = Vec::with_capacity(usize::from(length));
    packet.extend_from_slice(&header.to_bytes());
    packet.extend_from_slice(payload);
    packet
}

// ─────────────────────────────────────────────────────────────────────────────
// Payload helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Little-endian payload builder.
#[derive(Debug, Default)]
pub struct PayloadWriter(Vec<u8>);

impl PayloadWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u8(mut self, value: u8) -> Self {
        self.0.push(value);
        self
    }

    pub fn u16(mut self, value: u16) -> Self {
        self.0.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn i16(mut self, value: i16) -> Self {
        self.0.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn u32(mut self, value: u32) -> Self {
        self.0.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// A single ASCII character; anything outside ASCII is sent as `'?'`.
    pub fn char(self, value: char) -> Self {
        let byte = if value.is_ascii() { value as u8 } else { b'?' };
        self.u8(byte)
    }

    /// Fixed-width, NUL-padded string field.
    pub fn string(mut self, value: &str, width: usize) -> Self {
        let bytes = value.as_bytes();
        let take = bytes.len().min(width);
        self.0.extend_from_slice(&bytes[..take]);
        self.0.resize(self.0.len() + (width - take), 0);
        self
    }

    pub fn bytes(mut self, value: &[u8]) -> Self {
        self.0.extend_from_slice(value);
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.0
    }
}

/// Little-endian payload cursor. Every read fails once the payload is
/// exhausted.
#[derive(Debug)]
pub struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let slice = self.buf.get(self.pos..self.pos + n)?;
        self.pos += n;
        Some(slice)
    }

    pub fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    pub fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn i16(&mut self) -> Option<i16> {
        self.take(2).map(|b| i16::from_le_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Option<u32> {
        self.take(4).map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn char(&mut self) -> Option<char> {
        self.u8().map(char::from)
    }

    /// Fixed-width string field, cut at the first NUL.
    pub fn string(&mut self, width: usize) -> Option<String> {
        let raw = self.take(width)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        Some(String::from_utf8_lossy(&raw[..end]).into_owned())
    }

    pub fn version(&mut self) -> Option<[u8; 3]> {
        let raw = self.take(3)?;
        Some([raw[0], raw[1], raw[2]])
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Identity / enumerate payloads
// ─────────────────────────────────────────────────────────────────────────────

fn identity_writer(identity: &Identity) -> PayloadWriter {
    PayloadWriter::new()
        .string(&identity.uid, UID_FIELD_LEN)
        .string(&identity.connected_uid, UID_FIELD_LEN)
        .char(identity.position)
        .bytes(&identity.hardware_version)
        .bytes(&identity.firmware_version)
        .u16(identity.device_identifier)
}

fn read_identity(reader: &mut PayloadReader<'_>) -> Option<Identity> {
    Some(Identity {
        uid: reader.string(UID_FIELD_LEN)?,
        connected_uid: reader.string(UID_FIELD_LEN)?,
        position: reader.char()?,
        hardware_version: reader.version()?,
        firmware_version: reader.version()?,
        device_identifier: reader.u16()?,
    })
}

pub fn encode_identity(identity: &Identity) -> Vec<u8> {
    identity_writer(identity).finish()
}

/// Decode the answer to [`FUNCTION_GET_IDENTITY`] sent to `uid`.
pub fn decode_identity(uid: &str, payload: &[u8]) -> Result<Identity, DeviceError> {
    if payload.len() < IDENTITY_PAYLOAD_LEN {
        return Err(DeviceError::MalformedResponse {
            uid: uid.to_string(),
            details: format!("identity payload has {} bytes", payload.len()),
        });
    }
    read_identity(&mut PayloadReader::new(payload)).ok_or_else(|| DeviceError::MalformedResponse {
        uid: uid.to_string(),
        details: "truncated identity payload".to_string(),
    })
}

pub fn encode_enumerate(notification: &EnumerationNotification) -> Vec<u8> {
    PayloadWriter::new()
        .string(&notification.uid, UID_FIELD_LEN)
        .string(&notification.connected_uid, UID_FIELD_LEN)
        .char(notification.position)
        .bytes(&notification.hardware_version)
        .bytes(&notification.firmware_version)
        .u16(notification.device_identifier)
        .u8(notification.cause.to_wire())
        .finish()
}

/// Decode a [`CALLBACK_ENUMERATE`] payload. `None` for short payloads and
/// unknown enumeration types.
pub fn decode_enumerate(payload: &[u8]) -> Option<EnumerationNotification> {
    if payload.len() < ENUMERATE_PAYLOAD_LEN {
        return None;
    }
    let mut reader = PayloadReader::new(payload);
    let identity = read_identity(&mut reader)?;
    let cause = EnumerationCause::from_wire(reader.u8()?)?;
    Some(EnumerationNotification::from_identity(identity, cause))
}

// ─────────────────────────────────────────────────────────────────────────────
// Base58 UIDs
// ─────────────────────────────────────────────────────────────────────────────

pub fn base58_encode(mut value: u32) -> String {
    let mut digits = Vec::new();
    loop {
        digits.push(BASE58_ALPHABET[(value % 58) as usize]);
        value /= 58;
        if value == 0 {
            break;
        }
    }
    digits.reverse();
    String::from_utf8_lossy(&digits).into_owned()
}

/// Decode a base58 UID into the numeric form used in packet headers.
///
/// UIDs wider than 32 bits are folded the way the firmware does it.
pub fn base58_decode(encoded: &str) -> Option<u32> {
    if encoded.is_empty() {
        return None;
    }
    let mut value: u64 = 0;
    for c in encoded.bytes() {
        let digit = BASE58_ALPHABET.iter().position(|&a| a == c)?;
        value = value.checked_mul(58)?.checked_add(digit as u64)?;
    }
    if value <= u64::from(u32::MAX) {
        return u32::try_from(value).ok();
    }
    let low = value & 0xffff_ffff;
    let high = (value >> 32) & 0xffff_ffff;
    let folded = (low & 0x0000_0fff)
        | (low & 0x0f00_0000) >> 12
        | (high & 0x0000_003f) << 16
        | (high & 0x000f_0000) << 6
        | (high & 0x3f00_0000) << 2;
    u32::try_from(folded).ok()
}
