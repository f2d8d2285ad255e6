use thiserror::Error;

/// TFTP opcodes per RFC 1350 + RFC 2347.
pub(crate) const OPCODE_RRQ: u16 = 1;
pub(crate) const OPCODE_WRQ: u16 = 2;
pub(crate) const OPCODE_DATA: u16 = 3;
pub(crate) const OPCODE_ACK: u16 = 4;
pub(crate) const OPCODE_ERROR: u16 = 5;
pub(crate) const OPCODE_OACK: u16 = 6;

/// Default data payload per DATA packet (RFC 1350).
pub const DEFAULT_BLOCK_SIZE: usize = 512;

/// Negotiable blksize bounds (RFC 2348).
pub const MIN_BLKSIZE: usize = 8;
pub const MAX_BLKSIZE: usize = 65464;

/// Every TFTP frame carries at least opcode + one 16-bit field.
const MIN_FRAME: usize = 4;

/// Transfer mode from an RRQ/WRQ (RFC 1350). Mode strings are matched
/// case-insensitively on the wire and emitted lowercase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Netascii,
    Octet,
    Mail,
}

impl Mode {
    fn from_wire(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "netascii" => Some(Mode::Netascii),
            "octet" => Some(Mode::Octet),
            "mail" => Some(Mode::Mail),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Netascii => "netascii",
            Mode::Octet => "octet",
            Mode::Mail => "mail",
        }
    }
}

/// TFTP error codes (RFC 1350 + RFC 2347). The numeric value is the wire
/// code; the display string is the default human-readable message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ErrorKind {
    #[error("Not Defined")]
    NotDefined = 0,
    #[error("File Not Found")]
    FileNotFound = 1,
    #[error("Access Violation")]
    AccessViolation = 2,
    #[error("Disk Full")]
    DiskFull = 3,
    #[error("Illegal Operation")]
    IllegalOperation = 4,
    #[error("Unknown Transfer ID")]
    UnknownTid = 5,
    #[error("File Already Exists")]
    FileAlreadyExists = 6,
    #[error("No Such User")]
    NoSuchUser = 7,
    #[error("Option Negotiation Failed")]
    OptionNegotiationFailed = 8,
}

impl ErrorKind {
    pub fn code(self) -> u16 {
        self as u16
    }
}

/// Why a datagram failed to decode. The listener treats these differently:
/// an unknown opcode from a stranger earns ERROR 5, a malformed frame is
/// dropped silently.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
    #[error("unknown opcode {0}")]
    UnknownOpcode(u16),
}

/// A fully parsed TFTP packet. Request and OACK options keep their wire
/// order, so re-encoding a decoded frame reproduces the original bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(clippy::upper_case_acronyms)]
pub enum Packet {
    RRQ {
        filename: String,
        mode: Mode,
        options: Vec<(String, String)>,
    },
    WRQ {
        filename: String,
        mode: Mode,
        options: Vec<(String, String)>,
    },
    DATA {
        block_num: u16,
        data: Vec<u8>,
    },
    ACK {
        block_num: u16,
    },
    ERROR {
        code: u16,
        msg: String,
    },
    /// Option Acknowledgment (RFC 2347).
    OACK {
        options: Vec<(String, String)>,
    },
}

impl Packet {
    /// Parse raw bytes into a `Packet`.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < MIN_FRAME {
            return Err(DecodeError::Malformed("frame shorter than 4 bytes"));
        }
        let opcode = u16::from_be_bytes([buf[0], buf[1]]);
        match opcode {
            OPCODE_RRQ => parse_request(buf, true),
            OPCODE_WRQ => parse_request(buf, false),
            OPCODE_DATA => parse_data(buf),
            OPCODE_ACK => parse_ack(buf),
            OPCODE_ERROR => parse_error(buf),
            OPCODE_OACK => parse_oack(buf),
            other => Err(DecodeError::UnknownOpcode(other)),
        }
    }

    /// Serialize the packet to bytes for transmission.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Packet::RRQ {
                filename,
                mode,
                options,
            } => encode_request(OPCODE_RRQ, filename, *mode, options),
            Packet::WRQ {
                filename,
                mode,
                options,
            } => encode_request(OPCODE_WRQ, filename, *mode, options),
            Packet::DATA { block_num, data } => {
                let mut buf = Vec::with_capacity(4 + data.len());
                buf.extend_from_slice(&OPCODE_DATA.to_be_bytes());
                buf.extend_from_slice(&block_num.to_be_bytes());
                buf.extend_from_slice(data);
                buf
            }
            Packet::ACK { block_num } => {
                let mut buf = Vec::with_capacity(4);
                buf.extend_from_slice(&OPCODE_ACK.to_be_bytes());
                buf.extend_from_slice(&block_num.to_be_bytes());
                buf
            }
            Packet::ERROR { code, msg } => {
                let mut buf = Vec::with_capacity(5 + msg.len());
                buf.extend_from_slice(&OPCODE_ERROR.to_be_bytes());
                buf.extend_from_slice(&code.to_be_bytes());
                buf.extend_from_slice(msg.as_bytes());
                buf.push(0);
                buf
            }
            Packet::OACK { options } => {
                let mut buf = Vec::new();
                buf.extend_from_slice(&OPCODE_OACK.to_be_bytes());
                for (key, val) in options {
                    buf.extend_from_slice(key.as_bytes());
                    buf.push(0);
                    buf.extend_from_slice(val.as_bytes());
                    buf.push(0);
                }
                buf
            }
        }
    }

    /// Build an ERROR packet from an `ErrorKind` and its default message.
    pub fn error(kind: ErrorKind) -> Self {
        Packet::ERROR {
            code: kind.code(),
            msg: kind.to_string(),
        }
    }

    /// Build an ERROR packet with a custom message.
    pub fn error_with(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Packet::ERROR {
            code: kind.code(),
            msg: msg.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Internal parsing helpers
// ---------------------------------------------------------------------------

fn ascii_field(bytes: &[u8]) -> Result<&str, DecodeError> {
    if !bytes.is_ascii() {
        return Err(DecodeError::Malformed("non-ASCII string field"));
    }
    // ASCII is always valid UTF-8.
    std::str::from_utf8(bytes).map_err(|_| DecodeError::Malformed("invalid string field"))
}

/// Parse RRQ / WRQ: 2-byte opcode | filename\0 | mode\0 [| option\0 | value\0 ]*
fn parse_request(buf: &[u8], is_rrq: bool) -> Result<Packet, DecodeError> {
    let payload = &buf[2..];
    let fields: Vec<&[u8]> = payload.split(|&b| b == 0).collect();

    if fields.len() < 2 {
        return Err(DecodeError::Malformed("missing filename or mode"));
    }

    let filename = ascii_field(fields[0])?.to_string();
    if filename.is_empty() {
        return Err(DecodeError::Malformed("empty filename"));
    }
    let mode = Mode::from_wire(ascii_field(fields[1])?)
        .ok_or(DecodeError::Malformed("unsupported mode"))?;

    let options = parse_option_pairs(&fields[2..])?;

    if is_rrq {
        Ok(Packet::RRQ {
            filename,
            mode,
            options,
        })
    } else {
        Ok(Packet::WRQ {
            filename,
            mode,
            options,
        })
    }
}

/// Parse RFC 2347 option key/value pairs. Names are matched
/// case-insensitively on the wire, so they are lowercased here once.
fn parse_option_pairs(fields: &[&[u8]]) -> Result<Vec<(String, String)>, DecodeError> {
    let mut options = Vec::new();
    let mut i = 0;
    while i + 1 < fields.len() {
        let key = ascii_field(fields[i])?.to_ascii_lowercase();
        let val = ascii_field(fields[i + 1])?.to_string();
        if !key.is_empty() {
            options.push((key, val));
        }
        i += 2;
    }
    Ok(options)
}

/// Parse DATA: 2-byte opcode | 2-byte block# | 0..N bytes
fn parse_data(buf: &[u8]) -> Result<Packet, DecodeError> {
    let block_num = u16::from_be_bytes([buf[2], buf[3]]);
    let data = buf[4..].to_vec();
    Ok(Packet::DATA { block_num, data })
}

/// Parse ACK: 2-byte opcode | 2-byte block#, nothing more.
fn parse_ack(buf: &[u8]) -> Result<Packet, DecodeError> {
    if buf.len() != MIN_FRAME {
        return Err(DecodeError::Malformed("ACK must be exactly 4 bytes"));
    }
    let block_num = u16::from_be_bytes([buf[2], buf[3]]);
    Ok(Packet::ACK { block_num })
}

/// Parse ERROR: 2-byte opcode | 2-byte code | msg\0. A missing trailing NUL
/// is tolerated.
fn parse_error(buf: &[u8]) -> Result<Packet, DecodeError> {
    let code = u16::from_be_bytes([buf[2], buf[3]]);
    let msg_bytes = &buf[4..];
    let end = msg_bytes
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(msg_bytes.len());
    let msg = String::from_utf8_lossy(&msg_bytes[..end]).to_string();
    Ok(Packet::ERROR { code, msg })
}

/// Parse OACK: 2-byte opcode | [option\0 | value\0]*
fn parse_oack(buf: &[u8]) -> Result<Packet, DecodeError> {
    let payload = &buf[2..];
    let fields: Vec<&[u8]> = payload.split(|&b| b == 0).collect();
    let options = parse_option_pairs(&fields)?;
    Ok(Packet::OACK { options })
}

fn encode_request(opcode: u16, filename: &str, mode: Mode, options: &[(String, String)]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + filename.len() + mode.as_str().len());
    buf.extend_from_slice(&opcode.to_be_bytes());
    buf.extend_from_slice(filename.as_bytes());
    buf.push(0);
    buf.extend_from_slice(mode.as_str().as_bytes());
    buf.push(0);
    for (key, val) in options {
        buf.extend_from_slice(key.as_bytes());
        buf.push(0);
        buf.extend_from_slice(val.as_bytes());
        buf.push(0);
    }
    buf
}
