// Wire-level types for RFC 1350: the five packet kinds, their parsers and
// encoders, the numeric error-code table, and a thin async wrapper around a
// UDP socket that deals in raw datagrams.

use async_io::Async;
use std::error;
use std::fmt;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;
use thiserror::Error;
use tokio::time::error::Elapsed;
use tokio::time::timeout;

/// Largest datagram the server will accept: a 1500-byte Ethernet MTU minus
/// 20 bytes IPv4, 8 bytes UDP, and a 4-byte margin for the TFTP header.
pub const MAX_DATAGRAM_SIZE: usize = 1468;

/// Payload size of every DATA packet except the final one.
pub const BLOCK_SIZE: usize = 512;

///////////////////////////////////////////////////////////////
// Error-handling objects

/// Represents an error returned from the TFTP socket handler.
#[derive(Debug)]
pub enum SocketError {
    IO(io::Error),
    Timeout(Elapsed),
}

impl error::Error for SocketError {}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SocketError::IO(e) => write!(f, "Socket IO error: {e}"),
            SocketError::Timeout(e) => write!(f, "Socket IO timeout: {e}"),
        }
    }
}

impl From<io::Error> for SocketError {
    fn from(e: io::Error) -> Self {
        SocketError::IO(e)
    }
}

impl From<Elapsed> for SocketError {
    fn from(e: Elapsed) -> Self {
        SocketError::Timeout(e)
    }
}

pub type TftpResult<T> = Result<T, SocketError>;

/// A failure to decode a datagram. Both variants answer the peer with
/// error code 4 (illegal TFTP operation); the split records why.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    /// The datagram is too short, carries an unknown opcode, or breaks the
    /// framing rules for its opcode.
    #[error("malformed packet: {0}")]
    Malformed(String),

    /// The request names a transfer mode this server does not speak.
    #[error("illegal operation: {0}")]
    IllegalOperation(String),
}

/// Represents the mode for a file the client wishes to read or write.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum FileMode {
    NetAscii,
    Octet,
}

impl FileMode {
    pub fn as_str(self) -> &'static str {
        match self {
            FileMode::NetAscii => "netascii",
            FileMode::Octet => "octet",
        }
    }
}

/// Represents a TFTP error code surfaced by a TFTP error packet.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u16)]
pub enum ErrorCode {
    Undefined = 0,
    FileNotFound = 1,
    AccessViolation = 2,
    DiskFull = 3,
    Illegal = 4,
    UnknownTid = 5,
    FileAlreadyExists = 6,
    NoSuchUser = 7,
}

impl ErrorCode {
    pub fn code(self) -> u16 {
        self as u16
    }
}

impl From<u16> for ErrorCode {
    fn from(raw: u16) -> Self {
        match raw {
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::Illegal,
            5 => ErrorCode::UnknownTid,
            6 => ErrorCode::FileAlreadyExists,
            7 => ErrorCode::NoSuchUser,
            _ => ErrorCode::Undefined,
        }
    }
}

impl From<io::ErrorKind> for ErrorCode {
    fn from(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::NotFound => ErrorCode::FileNotFound,
            io::ErrorKind::PermissionDenied => ErrorCode::AccessViolation,
            io::ErrorKind::AlreadyExists => ErrorCode::FileAlreadyExists,
            io::ErrorKind::StorageFull | io::ErrorKind::WriteZero => ErrorCode::DiskFull,
            _ => ErrorCode::Undefined,
        }
    }
}

/// An RFC 1350 error: the numeric code plus the human-readable message that
/// travels in the error packet.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct TftpError {
    pub code: ErrorCode,
    pub message: String,
}

impl TftpError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> TftpError {
        TftpError {
            code,
            message: message.into(),
        }
    }

    /// The error packet announcing this failure to a peer.
    pub fn to_packet(&self) -> Packet {
        Packet::Error {
            code: self.code,
            message: self.message.clone(),
        }
    }
}

impl From<io::Error> for TftpError {
    fn from(e: io::Error) -> Self {
        let message = match e.kind() {
            io::ErrorKind::NotFound => "file not found".to_string(),
            io::ErrorKind::PermissionDenied => "access violation".to_string(),
            io::ErrorKind::AlreadyExists => "file already exists".to_string(),
            io::ErrorKind::StorageFull | io::ErrorKind::WriteZero => "disk full".to_string(),
            _ => format!("{e}"),
        };
        TftpError::new(e.kind().into(), message)
    }
}

/// An enum representing a TFTP packet and its associated data.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Packet {
    /// A read request packet
    ReadReq {
        /// The file path the client wants to read.
        path: String,

        /// The transfer mode.
        mode: FileMode,
    },

    /// A write request packet
    WriteReq {
        path: String,
        mode: FileMode,
    },

    /// A data packet
    Data {
        /// The block number for this data packet.
        block: u16,

        /// The contents of the data itself.
        data: Vec<u8>,
    },

    /// An acknowledgment packet
    Ack {
        /// The block being acknowledged.
        block: u16,
    },

    /// An error packet.
    Error {
        code: ErrorCode,
        message: String,
    },
}

fn read_u16(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}

/// Splits a null-terminated netascii string off the front of `buf`,
/// returning it alongside whatever follows the terminator. `None` when the
/// terminator is missing.
fn take_netascii_string(buf: &[u8]) -> Option<(String, &[u8])> {
    let nul = buf.iter().position(|&b| b == 0x00)?;
    let s = buf[..nul].iter().map(|&b| char::from(b)).collect();
    Some((s, &buf[nul + 1..]))
}

/// The TFTP opcode carried in the first two bytes of every packet.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum OpCode {
    Rrq,
    Wrq,
    Data,
    Ack,
    Error,
}

impl OpCode {
    fn wire_code(self) -> u16 {
        match self {
            OpCode::Rrq => 1,
            OpCode::Wrq => 2,
            OpCode::Data => 3,
            OpCode::Ack => 4,
            OpCode::Error => 5,
        }
    }
}

/// Reads just the opcode off the front of a datagram, so the dispatcher can
/// route without a full parse. `None` for short or unknown headers.
pub fn peek_op_code(buf: &[u8]) -> Option<OpCode> {
    if buf.len() < 2 {
        return None;
    }
    match read_u16(buf) {
        1 => Some(OpCode::Rrq),
        2 => Some(OpCode::Wrq),
        3 => Some(OpCode::Data),
        4 => Some(OpCode::Ack),
        5 => Some(OpCode::Error),
        _ => None,
    }
}

fn retrieve_op_code(buf: &[u8]) -> Result<OpCode, ParseError> {
    peek_op_code(buf).ok_or_else(|| {
        ParseError::Malformed(format!("unknown opcode retrieved: {}", read_u16(buf)))
    })
}

fn parse_path_and_mode(buf: &[u8]) -> Result<(String, FileMode), ParseError> {
    let (path, rest) = take_netascii_string(buf).ok_or_else(|| {
        ParseError::Malformed("request filename must be terminated with a null byte".to_string())
    })?;

    let (raw_mode, _) = take_netascii_string(rest).ok_or_else(|| {
        ParseError::Malformed("request mode must be terminated with a null byte".to_string())
    })?;

    let mode = match raw_mode.to_lowercase().as_str() {
        "netascii" => FileMode::NetAscii,
        "octet" => FileMode::Octet,
        _ => {
            return Err(ParseError::IllegalOperation(format!(
                "unknown transfer mode: '{raw_mode}'"
            )))
        }
    };

    Ok((path, mode))
}

fn parse_read_req(buf: &[u8]) -> Result<Packet, ParseError> {
    let (path, mode) = parse_path_and_mode(&buf[2..])?;
    Ok(Packet::ReadReq { path, mode })
}

fn parse_write_req(buf: &[u8]) -> Result<Packet, ParseError> {
    let (path, mode) = parse_path_and_mode(&buf[2..])?;
    Ok(Packet::WriteReq { path, mode })
}

fn parse_data(buf: &[u8]) -> Result<Packet, ParseError> {
    let block = read_u16(&buf[2..4]);
    let data = &buf[4..];
    if data.len() > BLOCK_SIZE {
        return Err(ParseError::Malformed(format!(
            "data payload of {} bytes exceeds the {BLOCK_SIZE}-byte block size",
            data.len()
        )));
    }
    Ok(Packet::Data {
        block,
        data: Vec::from(data),
    })
}

fn parse_ack(buf: &[u8]) -> Result<Packet, ParseError> {
    let block = read_u16(&buf[2..4]);
    Ok(Packet::Ack { block })
}

fn parse_error(buf: &[u8]) -> Result<Packet, ParseError> {
    if buf.len() < 5 {
        return Err(ParseError::Malformed(
            "error packet must carry a code and a null-terminated message".to_string(),
        ));
    }
    let code = ErrorCode::from(read_u16(&buf[2..4]));

    let (message, _) = take_netascii_string(&buf[4..]).ok_or_else(|| {
        ParseError::Malformed("error message must be terminated with a null byte".to_string())
    })?;
    Ok(Packet::Error { code, message })
}

impl Packet {
    /// Decodes a raw datagram into a packet, enforcing the per-opcode
    /// minimum lengths and framing rules.
    pub fn parse(buf: &[u8]) -> Result<Packet, ParseError> {
        if buf.len() < 4 {
            return Err(ParseError::Malformed("packet too short".to_string()));
        }

        match retrieve_op_code(&buf[..2])? {
            OpCode::Rrq | OpCode::Wrq if buf.len() < 6 => Err(ParseError::Malformed(
                "request packet too short".to_string(),
            )),
            OpCode::Rrq => parse_read_req(buf),
            OpCode::Wrq => parse_write_req(buf),
            OpCode::Data => parse_data(buf),
            OpCode::Ack => parse_ack(buf),
            OpCode::Error => parse_error(buf),
        }
    }

    /// Encodes this packet into its exact wire representation. The returned
    /// buffer is allocated at the declared length up front; nothing pads it.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Packet::ReadReq { path, mode } => encode_request(OpCode::Rrq, path, *mode),
            Packet::WriteReq { path, mode } => encode_request(OpCode::Wrq, path, *mode),
            Packet::Data { block, data } => {
                let mut buf = Vec::with_capacity(4 + data.len());
                buf.extend_from_slice(&OpCode::Data.wire_code().to_be_bytes());
                buf.extend_from_slice(&block.to_be_bytes());
                buf.extend_from_slice(data);
                buf
            }
            Packet::Ack { block } => {
                let mut buf = Vec::with_capacity(4);
                buf.extend_from_slice(&OpCode::Ack.wire_code().to_be_bytes());
                buf.extend_from_slice(&block.to_be_bytes());
                buf
            }
            Packet::Error { code, message } => {
                let mut buf = Vec::with_capacity(5 + message.len());
                buf.extend_from_slice(&OpCode::Error.wire_code().to_be_bytes());
                buf.extend_from_slice(&code.code().to_be_bytes());
                buf.extend_from_slice(message.as_bytes());
                buf.push(0x00);
                buf
            }
        }
    }
}

fn encode_request(op: OpCode, path: &str, mode: FileMode) -> Vec<u8> {
    let mode_str = mode.as_str();
    let mut buf = Vec::with_capacity(2 + path.len() + 1 + mode_str.len() + 1);
    buf.extend_from_slice(&op.wire_code().to_be_bytes());
    buf.extend_from_slice(path.as_bytes());
    buf.push(0x00);
    buf.extend_from_slice(mode_str.as_bytes());
    buf.push(0x00);
    buf
}

///////////////////////////////////////////////////////////////
/// Wrapper around a UDP socket that hands out raw datagrams with their
/// source address. Parsing happens upstream, after the caller has decided
/// the datagram came from the peer it expected.
pub struct TftpSocket {
    sock: Async<UdpSocket>,
}

impl TftpSocket {
    pub fn bind(addr: SocketAddr) -> TftpResult<TftpSocket> {
        Ok(TftpSocket {
            sock: Async::<UdpSocket>::bind(addr)?,
        })
    }

    pub fn local_addr(&self) -> TftpResult<SocketAddr> {
        Ok(self.sock.get_ref().local_addr()?)
    }

    /// Waits for the next datagram, without bound.
    pub async fn recv_from(&self) -> TftpResult<(Vec<u8>, SocketAddr)> {
        let mut buf = [0; MAX_DATAGRAM_SIZE];
        let (total_written, src) = self.sock.recv_from(&mut buf).await?;
        Ok((buf[..total_written].to_vec(), src))
    }

    /// Waits for the next datagram, giving up after `ttl`.
    pub async fn recv_with_timeout(&self, ttl: Duration) -> TftpResult<(Vec<u8>, SocketAddr)> {
        let mut buf = [0; MAX_DATAGRAM_SIZE];
        let (total_written, src) = timeout(ttl, self.sock.recv_from(&mut buf)).await??;
        Ok((buf[..total_written].to_vec(), src))
    }

    pub async fn send(&self, packet: &Packet, dst: SocketAddr) -> TftpResult<()> {
        self.send_raw(&packet.to_bytes(), dst).await
    }

    /// Sends already-encoded bytes, e.g. a retained packet being retransmitted.
    pub async fn send_raw(&self, bytes: &[u8], dst: SocketAddr) -> TftpResult<()> {
        self.sock.send_to(bytes, dst).await?;
        Ok(())
    }
}
