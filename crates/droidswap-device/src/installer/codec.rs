//! Frame codec for the installer channel
//!
//! ```text
//! +--------+--------+------------+------------+-----------------+
//! | "DSWP" | opcode | request id | length     | JSON payload    |
//! | 4 B    | u8     | u32 BE     | u32 BE     | `length` bytes  |
//! +--------+--------+------------+------------+-----------------+
//! ```
//!
//! Responses echo the opcode and request id of the request they answer.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use droidswap_core::prelude::*;

pub const MAGIC: [u8; 4] = *b"DSWP";
pub const HEADER_LEN: usize = 13;
pub const MAX_PAYLOAD_LEN: u32 = 64 * 1024 * 1024;

/// Installer operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Handshake = 1,
    Dump = 2,
    DeltaInstall = 3,
    Swap = 4,
    Shutdown = 5,
}

impl Opcode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Opcode::Handshake),
            2 => Some(Opcode::Dump),
            3 => Some(Opcode::DeltaInstall),
            4 => Some(Opcode::Swap),
            5 => Some(Opcode::Shutdown),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Opcode::Handshake => "handshake",
            Opcode::Dump => "dump",
            Opcode::DeltaInstall => "delta install",
            Opcode::Swap => "swap",
            Opcode::Shutdown => "shutdown",
        }
    }
}

/// One request or response on the installer channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: Opcode,
    pub request_id: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(opcode: Opcode, request_id: u32, payload: Vec<u8>) -> Self {
        Self {
            opcode,
            request_id,
            payload,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let len = u32::try_from(self.payload.len())
            .ok()
            .filter(|len| *len <= MAX_PAYLOAD_LEN)
            .ok_or_else(|| {
                Error::installer_protocol(format!(
                    "payload of {} bytes exceeds the frame limit",
                    self.payload.len()
                ))
            })?;

        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&MAGIC);
        buf.push(self.opcode as u8);
        buf.extend_from_slice(&self.request_id.to_be_bytes());
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }
}

fn io_to_protocol(e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::installer_protocol("installer closed the stream")
    } else {
        Error::installer_protocol(format!("stream I/O failed: {}", e))
    }
}

/// Write one frame and flush
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
    let bytes = frame.encode()?;
    writer.write_all(&bytes).await.map_err(io_to_protocol)?;
    writer.flush().await.map_err(io_to_protocol)?;
    Ok(())
}

/// Read one frame, validating magic, opcode and length
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame> {
    let mut header = [0u8; HEADER_LEN];
    reader
        .read_exact(&mut header)
        .await
        .map_err(io_to_protocol)?;

    if header[0..4] != MAGIC {
        return Err(Error::installer_protocol(format!(
            "bad frame magic {:02x?}",
            &header[0..4]
        )));
    }

    let opcode = Opcode::from_u8(header[4])
        .ok_or_else(|| Error::installer_protocol(format!("unknown opcode {}", header[4])))?;
    let request_id = u32::from_be_bytes([header[5], header[6], header[7], header[8]]);
    let len = u32::from_be_bytes([header[9], header[10], header[11], header[12]]);

    if len > MAX_PAYLOAD_LEN {
        return Err(Error::installer_protocol(format!(
            "frame length {} exceeds the limit",
            len
        )));
    }

    let mut payload = vec![0u8; len as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(io_to_protocol)?;

    Ok(Frame {
        opcode,
        request_id,
        payload,
    })
}
