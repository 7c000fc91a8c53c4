//! NAT-PMP (RFC 6886) wire format.
//!
//! ```text
//! mapping request (12 bytes)           mapping response (16 bytes)
//! 0      version = 0                   0      version = 0
//! 1      opcode (1 UDP, 2 TCP)         1      opcode + 128
//! 2..4   reserved                      2..4   result code
//! 4..6   internal port                 4..8   seconds since epoch
//! 6..8   suggested external port       8..10  internal port
//! 8..12  requested lifetime            10..12 mapped external port
//!                                      12..16 granted lifetime
//! ```
//!
//! The public address request is the two-byte `[0, 0]`; its 12-byte
//! response carries the address at `8..12`. All fields are big-endian.

use std::fmt;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use super::error::CodecError;

/// NAT-PMP protocol version.
pub const VERSION: u8 = 0;

/// Opcode of the public address request.
pub const OP_PUBLIC_ADDRESS: u8 = 0;

/// Offset added to a request opcode in its response.
pub const RESPONSE_BIT: u8 = 128;

/// Mapping request length.
pub const MAPPING_REQUEST_LEN: usize = 12;

/// Mapping response length.
pub const MAPPING_RESPONSE_LEN: usize = 16;

/// Public address response length.
pub const PUBLIC_ADDRESS_RESPONSE_LEN: usize = 12;

/// Transport protocol of a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP mapping.
    Tcp,
    /// UDP mapping.
    Udp,
}

impl Protocol {
    /// Request opcode for this protocol.
    pub fn opcode(self) -> u8 {
        match self {
            Self::Udp => 1,
            Self::Tcp => 2,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "TCP"),
            Self::Udp => write!(f, "UDP"),
        }
    }
}

/// A mapping request. Lifetime 0 destroys the mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingRequest {
    /// Protocol to map.
    pub protocol: Protocol,
    /// Internal port.
    pub internal_port: u16,
    /// Preferred external port, 0 for none.
    pub suggested_external_port: u16,
    /// Requested lifetime in seconds.
    pub lifetime: u32,
}

/// A successful mapping response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingResponse {
    /// Protocol mapped.
    pub protocol: Protocol,
    /// Internal port echoed by the gateway.
    pub internal_port: u16,
    /// External port assigned by the gateway.
    pub external_port: u16,
    /// Lifetime granted by the gateway, in seconds.
    pub lifetime: u32,
}

/// Encode a mapping request.
pub fn encode_mapping_request(request: &MappingRequest) -> [u8; MAPPING_REQUEST_LEN] {
    let mut buf = [0_u8; MAPPING_REQUEST_LEN];
    buf[0] = VERSION;
    buf[1] = request.protocol.opcode();
    buf[4..6].copy_from_slice(&request.internal_port.to_be_bytes());
    buf[6..8].copy_from_slice(&request.suggested_external_port.to_be_bytes());
    buf[8..12].copy_from_slice(&request.lifetime.to_be_bytes());
    buf
}

/// Decode a mapping response for `protocol`.
pub fn decode_mapping_response(
    protocol: Protocol,
    buf: &[u8],
) -> Result<MappingResponse, CodecError> {
    check_header(buf, MAPPING_RESPONSE_LEN, protocol.opcode())?;
    Ok(MappingResponse {
        protocol,
        internal_port: u16::from_be_bytes([buf[8], buf[9]]),
        external_port: u16::from_be_bytes([buf[10], buf[11]]),
        lifetime: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
    })
}

/// Encode a public address request.
pub fn encode_public_address_request() -> [u8; 2] {
    [VERSION, OP_PUBLIC_ADDRESS]
}

/// Decode a public address response.
pub fn decode_public_address_response(buf: &[u8]) -> Result<Ipv4Addr, CodecError> {
    check_header(buf, PUBLIC_ADDRESS_RESPONSE_LEN, OP_PUBLIC_ADDRESS)?;
    Ok(Ipv4Addr::new(buf[8], buf[9], buf[10], buf[11]))
}

fn check_header(buf: &[u8], len: usize, request_opcode: u8) -> Result<(), CodecError> {
    if buf.len() < len {
        return Err(CodecError::TooShort {
            expected: len,
            actual: buf.len(),
        });
    }
    if buf[0] != VERSION {
        return Err(CodecError::UnexpectedVersion(buf[0]));
    }
    let expected = request_opcode.saturating_add(RESPONSE_BIT);
    if buf[1] != expected {
        return Err(CodecError::UnexpectedOpcode {
            expected,
            actual: buf[1],
        });
    }
    let code = u16::from_be_bytes([buf[2], buf[3]]);
    if code != 0 {
        return Err(CodecError::ResultCode {
            code,
            description: result_code_desc(code),
        });
    }
    Ok(())
}

/// Human-readable description of a NAT-PMP result code.
pub fn result_code_desc(code: u16) -> &'static str {
    match code {
        0 => "success",
        1 => "unsupported NAT-PMP version",
        2 => "not authorized/refused",
        3 => "network failure",
        4 => "out of resources",
        5 => "unsupported opcode",
        _ => "unknown error",
    }
}
