//! Framed session protocol.
//!
//! A session is: connect -> command frame -> (DEPLOY) ok-to-proceed status
//! -> chunked payload stream -> terminal status -> close. The daemon sends
//! exactly one terminal status per session.
//!
//! Wire format: all integers big-endian. Name fields are fixed-width
//! zero-padded UTF-8 buffers, trimmed of padding on read.

use std::io;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{DeployError, Result};

/// Width of the target and principal name fields.
pub const NAME_FIELD: usize = 64;

/// Maximum payload chunk size. Caps per-read memory and gives the receiver
/// natural backpressure points.
pub const CHUNK_SIZE: usize = 1024;

/// Maximum accepted payload size (1 GiB) - prevents OOM from a hostile peer.
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024 * 1024;

/// Maximum accepted status message length.
const MAX_MESSAGE_LEN: usize = 64 * 1024;

const OP_DEPLOY: u8 = 0x01;
const OP_PING: u8 = 0x02;

// =============================================================================
// Command frame
// =============================================================================

/// Command frame: `opcode:u8 | target:[u8;64] | principal:[u8;64]`.
///
/// Opcodes outside the known set decode to `Unknown` so the daemon can
/// answer `UNSUPPORTED` instead of dropping the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Deploy { target: String, principal: String },
    Ping,
    Unknown(u8),
}

impl Command {
    pub fn encode(&self) -> Result<BytesMut> {
        let mut buf = BytesMut::with_capacity(1 + 2 * NAME_FIELD);
        match self {
            Command::Deploy { target, principal } => {
                buf.put_u8(OP_DEPLOY);
                put_name(&mut buf, target)?;
                put_name(&mut buf, principal)?;
            }
            Command::Ping => {
                buf.put_u8(OP_PING);
                put_name(&mut buf, "")?;
                put_name(&mut buf, "")?;
            }
            Command::Unknown(op) => {
                buf.put_u8(*op);
                put_name(&mut buf, "")?;
                put_name(&mut buf, "")?;
            }
        }
        Ok(buf)
    }
}

fn put_name(buf: &mut BytesMut, value: &str) -> Result<()> {
    let bytes = value.as_bytes();
    if bytes.len() > NAME_FIELD {
        return Err(DeployError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("name exceeds {NAME_FIELD} bytes: {value}"),
        )));
    }
    buf.put_slice(bytes);
    buf.put_bytes(0, NAME_FIELD - bytes.len());
    Ok(())
}

fn trim_name(field: &[u8]) -> Result<String> {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8(field[..end].to_vec()).map_err(|_| {
        DeployError::Transmission(io::Error::new(
            io::ErrorKind::InvalidData,
            "name field is not valid UTF-8",
        ))
    })
}

pub async fn write_command<W: AsyncWrite + Unpin>(w: &mut W, command: &Command) -> Result<()> {
    let frame = command.encode()?;
    w.write_all(&frame).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_command<R: AsyncRead + Unpin>(r: &mut R) -> Result<Command> {
    let opcode = match r.read_u8().await {
        Ok(b) => b,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            return Err(DeployError::ConnectionClosed)
        }
        Err(e) => return Err(DeployError::Transmission(e)),
    };
    let mut fields = [0u8; 2 * NAME_FIELD];
    read_exact(r, &mut fields).await?;

    match opcode {
        OP_DEPLOY => Ok(Command::Deploy {
            target: trim_name(&fields[..NAME_FIELD])?,
            principal: trim_name(&fields[NAME_FIELD..])?,
        }),
        OP_PING => Ok(Command::Ping),
        other => Ok(Command::Unknown(other)),
    }
}

// =============================================================================
// Status frame
// =============================================================================

/// Status frame: `code:u8 | [msg_len:u32 | msg]`. Only `Ok` omits the
/// message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Ok,
    NotOk(String),
    Unsupported(String),
    Blocked(String),
    NotExist(String),
}

impl Status {
    pub fn code(&self) -> u8 {
        match self {
            Status::Ok => 0,
            Status::NotOk(_) => 1,
            Status::Unsupported(_) => 2,
            Status::Blocked(_) => 3,
            Status::NotExist(_) => 4,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }

    pub fn message(&self) -> &str {
        match self {
            Status::Ok => "",
            Status::NotOk(m) | Status::Unsupported(m) | Status::Blocked(m) | Status::NotExist(m) => {
                m
            }
        }
    }
}

pub async fn write_status<W: AsyncWrite + Unpin>(w: &mut W, status: &Status) -> Result<()> {
    let mut buf = BytesMut::with_capacity(1 + 4 + status.message().len());
    buf.put_u8(status.code());
    if !status.is_ok() {
        let msg = status.message().as_bytes();
        buf.put_u32(msg.len() as u32);
        buf.put_slice(msg);
    }
    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_status<R: AsyncRead + Unpin>(r: &mut R) -> Result<Status> {
    let code = match r.read_u8().await {
        Ok(b) => b,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            return Err(DeployError::ConnectionClosed)
        }
        Err(e) => return Err(DeployError::Transmission(e)),
    };
    if code == 0 {
        return Ok(Status::Ok);
    }
    let len = read_u32(r).await? as usize;
    if len > MAX_MESSAGE_LEN {
        return Err(DeployError::Transmission(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("status message length {len} exceeds maximum {MAX_MESSAGE_LEN}"),
        )));
    }
    let mut msg = vec![0u8; len];
    read_exact(r, &mut msg).await?;
    let msg = String::from_utf8_lossy(&msg).into_owned();

    match code {
        1 => Ok(Status::NotOk(msg)),
        2 => Ok(Status::Unsupported(msg)),
        3 => Ok(Status::Blocked(msg)),
        4 => Ok(Status::NotExist(msg)),
        other => Err(DeployError::Transmission(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unknown status code {other}"),
        ))),
    }
}

// =============================================================================
// Payload stream
// =============================================================================

/// Write the payload as length-delimited chunks followed by a zero-length
/// end-of-stream marker.
pub async fn write_stream<W: AsyncWrite + Unpin>(w: &mut W, payload: &[u8]) -> Result<()> {
    for chunk in payload.chunks(CHUNK_SIZE) {
        w.write_u32(chunk.len() as u32).await?;
        w.write_all(chunk).await?;
    }
    w.write_u32(0).await?;
    w.flush().await?;
    Ok(())
}

/// Read chunks until the end-of-stream marker.
///
/// A clean EOF before the marker is a [`DeployError::ConnectionClosed`]
/// cancellation; any other I/O failure is [`DeployError::Transmission`].
pub async fn read_stream<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<u8>> {
    let mut payload = Vec::new();
    loop {
        let len = read_u32(r).await? as usize;
        if len == 0 {
            return Ok(payload);
        }
        if len > CHUNK_SIZE {
            return Err(DeployError::Transmission(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("chunk length {len} exceeds maximum {CHUNK_SIZE}"),
            )));
        }
        if payload.len() + len > MAX_PAYLOAD_SIZE {
            return Err(DeployError::Transmission(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("payload exceeds maximum size {MAX_PAYLOAD_SIZE}"),
            )));
        }
        let start = payload.len();
        payload.resize(start + len, 0);
        read_exact(r, &mut payload[start..]).await?;
    }
}

async fn read_u32<R: AsyncRead + Unpin>(r: &mut R) -> Result<u32> {
    match r.read_u32().await {
        Ok(n) => Ok(n),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(DeployError::ConnectionClosed),
        Err(e) => Err(DeployError::Transmission(e)),
    }
}

async fn read_exact<R: AsyncRead + Unpin>(r: &mut R, buf: &mut [u8]) -> Result<()> {
    match r.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(DeployError::ConnectionClosed),
        Err(e) => Err(DeployError::Transmission(e)),
    }
}

// =============================================================================
// Tests
// =============================================================================
