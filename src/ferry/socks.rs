use std::net::Ipv4Addr;

use thiserror::Error;

/// SOCKS protocol version carried by well-formed requests. Logged, not enforced.
pub const VERSION: u8 = 4;

/// CONNECT command code. Logged, not enforced.
pub const CMD_CONNECT: u8 = 1;

/// Reply status: request granted.
pub const REPLY_GRANTED: u8 = 0x5A;
/// Reply status: request rejected or failed.
pub const REPLY_REJECTED: u8 = 0x5B;

/// Smallest possible CONNECT request: 8-byte header plus the user-id NUL.
pub const MIN_REQUEST_LEN: usize = 9;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("need more data")]
    NeedMoreData,
    #[error("malformed request: {0}")]
    Malformed(String),
}

/// A parsed SOCKS4/4a CONNECT request.
///
/// Wire layout: version, command, port (u16 big-endian), IPv4 address
/// (network order), NUL-terminated user-id. The user-id content is ignored;
/// only its terminator matters for framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub version: u8,
    pub command: u8,
    pub port: u16,
    pub addr: Ipv4Addr,
    /// Total bytes consumed from the capture buffer, including the NUL.
    /// Anything past this offset is payload the client pipelined before
    /// waiting for our reply.
    pub header_len: usize,
}

impl ConnectRequest {
    /// SOCKS4a marks a domain-name request with a deliberately invalid
    /// destination of the form `0.0.0.x` (x nonzero); the hostname follows
    /// the user-id. Ferry detects but does not resolve these.
    pub fn is_socks4a(&self) -> bool {
        let o = self.addr.octets();
        o[0] == 0 && o[1] == 0 && o[2] == 0 && o[3] != 0
    }
}

/// Try to parse a complete CONNECT request from the front of `buf`.
///
/// Returns `NeedMoreData` until the buffer holds the fixed header and a
/// NUL-terminated user-id, so callers can accumulate fragmented reads and
/// retry with the grown buffer.
pub fn parse_connect(buf: &[u8]) -> Result<ConnectRequest, ParseError> {
    if buf.len() < MIN_REQUEST_LEN {
        return Err(ParseError::NeedMoreData);
    }

    let Some(nul) = buf[8..].iter().position(|&b| b == 0) else {
        return Err(ParseError::NeedMoreData);
    };

    Ok(ConnectRequest {
        version: buf[0],
        command: buf[1],
        port: u16::from_be_bytes([buf[2], buf[3]]),
        addr: Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7]),
        header_len: 8 + nul + 1,
    })
}

/// Encode the 8-byte SOCKS4 reply for `status`.
///
/// The bound address/port fields stay zero-filled; Ferry never echoes the
/// actual connected address back.
pub fn encode_reply(status: u8) -> [u8; 8] {
    [0, status, 0, 0, 0, 0, 0, 0]
}
