//! Mux wire format.
//!
//! Each frame has an 8-byte header followed by the payload:
//! version(1) + cmd(1) + length(2, LE) + stream_id(4, LE).

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};

/// Stream identifier type.
pub type StreamId = u32;

/// Frame header size.
pub const HEADER_SIZE: usize = 8;

/// Largest payload a frame can carry.
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

/// Size of an UPD payload: consumed(4) + window(4).
pub const UPDATE_SIZE: usize = 8;

/// Frame commands.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cmd {
    /// Open a stream
    Syn = 0,
    /// Half-close a stream
    Fin = 1,
    /// Stream data
    Psh = 2,
    /// Keepalive, no payload
    Nop = 3,
    /// Flow-control window update (version 2 only)
    Upd = 4,
}

impl Cmd {
    fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(Self::Syn),
            1 => Ok(Self::Fin),
            2 => Ok(Self::Psh),
            3 => Ok(Self::Nop),
            4 => Ok(Self::Upd),
            _ => Err(Error::Mux(format!("unknown command: {}", v))),
        }
    }
}

/// A mux frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub version: u8,
    pub cmd: Cmd,
    pub sid: StreamId,
    pub data: Bytes,
}

impl Frame {
    pub fn new(version: u8, cmd: Cmd, sid: StreamId) -> Self {
        Self {
            version,
            cmd,
            sid,
            data: Bytes::new(),
        }
    }

    /// Create a PSH frame carrying `data`.
    pub fn data(version: u8, sid: StreamId, data: Bytes) -> Self {
        Self {
            version,
            cmd: Cmd::Psh,
            sid,
            data,
        }
    }

    /// Create an UPD frame announcing how much was consumed and the new window.
    pub fn update(version: u8, sid: StreamId, consumed: u32, window: u32) -> Self {
        let mut payload = BytesMut::with_capacity(UPDATE_SIZE);
        payload.put_u32_le(consumed);
        payload.put_u32_le(window);
        Self {
            version,
            cmd: Cmd::Upd,
            sid,
            data: payload.freeze(),
        }
    }

    /// Decode the payload of an UPD frame.
    pub fn parse_update(&self) -> Result<(u32, u32)> {
        if self.data.len() < UPDATE_SIZE {
            return Err(Error::Mux(format!(
                "update frame too short: {} bytes",
                self.data.len()
            )));
        }
        let d = &self.data;
        let consumed = u32::from_le_bytes([d[0], d[1], d[2], d[3]]);
        let window = u32::from_le_bytes([d[4], d[5], d[6], d[7]]);
        Ok((consumed, window))
    }

    /// Append the encoded frame to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_SIZE + self.data.len());
        dst.put_u8(self.version);
        dst.put_u8(self.cmd as u8);
        dst.put_u16_le(self.data.len() as u16);
        dst.put_u32_le(self.sid);
        dst.extend_from_slice(&self.data);
    }

    /// Read exactly one frame.
    pub async fn read_from<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self> {
        let mut header = [0u8; HEADER_SIZE];
        r.read_exact(&mut header).await?;

        let version = header[0];
        let cmd = Cmd::from_u8(header[1])?;
        let len = u16::from_le_bytes([header[2], header[3]]) as usize;
        let sid = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        let data = if len > 0 {
            let mut payload = vec![0u8; len];
            r.read_exact(&mut payload).await?;
            Bytes::from(payload)
        } else {
            Bytes::new()
        };

        Ok(Self {
            version,
            cmd,
            sid,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let frame = Frame::data(2, 0x0102_0304, Bytes::from_static(b"abc"));
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);

        assert_eq!(&buf[..HEADER_SIZE], &[2, 2, 3, 0, 4, 3, 2, 1]);
        assert_eq!(&buf[HEADER_SIZE..], b"abc");
    }

    #[tokio::test]
    async fn test_read_frame() {
        let mut buf = BytesMut::new();
        Frame::new(1, Cmd::Syn, 3).encode(&mut buf);
        Frame::update(2, 3, 100, 65536).encode(&mut buf);

        let mut reader = &buf[..];
        let syn = Frame::read_from(&mut reader).await.unwrap();
        assert_eq!(syn.cmd, Cmd::Syn);
        assert_eq!(syn.sid, 3);

        let upd = Frame::read_from(&mut reader).await.unwrap();
        assert_eq!(upd.parse_update().unwrap(), (100, 65536));
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let raw = [1u8, 9, 0, 0, 1, 0, 0, 0];
        let mut reader = &raw[..];
        assert!(matches!(
            Frame::read_from(&mut reader).await,
            Err(Error::Mux(_))
        ));
    }
}
