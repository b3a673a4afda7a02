//! UDP datagram framing over a byte-stream data channel
//!
//! Layout (big-endian):
//!
//! ```text
//! [magic: 4][payload_len: 4][addr_len: 4][addr: addr_len][port: 2][payload: payload_len]
//! ```
//!
//! `magic` is `0xDEADBEEF` and `addr_len` is 4 for IPv4 or 16 for IPv6.

use bytes::{BufMut, Bytes, BytesMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Frame magic number
pub const MAGIC: u32 = 0xDEAD_BEEF;

/// Smallest buffer that can hold the fixed header fields
pub const MIN_HEADER_LEN: usize = 14;

/// Largest payload a UDP datagram can carry over IPv4
pub const MAX_PAYLOAD_LEN: usize = 65_507;

/// Framing errors; any of these means the frame is corrupt and is dropped
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FrameError {
    #[error("Frame too short: {0} bytes")]
    TooShort(usize),

    #[error("Bad magic: {0:#010x}")]
    BadMagic(u32),

    #[error("Invalid address length: {0}")]
    BadAddressLength(u32),

    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(u32),

    #[error("Length mismatch: header says {expected} bytes, buffer has {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("IO error: {0}")]
    Io(String),
}

/// A datagram together with the remote peer it belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpFrame {
    pub addr: SocketAddr,
    pub payload: Bytes,
}

impl UdpFrame {
    pub fn new(addr: SocketAddr, payload: impl Into<Bytes>) -> Self {
        Self {
            addr,
            payload: payload.into(),
        }
    }

    fn addr_len(&self) -> usize {
        match self.addr.ip() {
            IpAddr::V4(_) => 4,
            IpAddr::V6(_) => 16,
        }
    }

    /// Total encoded size of this frame
    pub fn encoded_len(&self) -> usize {
        MIN_HEADER_LEN + self.addr_len() + self.payload.len()
    }

    pub fn encode(&self) -> Result<Bytes, FrameError> {
        if self.payload.len() > MAX_PAYLOAD_LEN {
            return Err(FrameError::PayloadTooLarge(self.payload.len() as u32));
        }

        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u32(MAGIC);
        buf.put_u32(self.payload.len() as u32);
        buf.put_u32(self.addr_len() as u32);
        match self.addr.ip() {
            IpAddr::V4(ip) => buf.put_slice(&ip.octets()),
            IpAddr::V6(ip) => buf.put_slice(&ip.octets()),
        }
        buf.put_u16(self.addr.port());
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Decode one complete frame; the buffer must hold exactly one frame
    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < MIN_HEADER_LEN {
            return Err(FrameError::TooShort(buf.len()));
        }

        let (payload_len, addr_len) = parse_header(&buf[..12])?;
        let expected = MIN_HEADER_LEN + addr_len + payload_len;
        if buf.len() != expected {
            return Err(FrameError::LengthMismatch {
                expected,
                actual: buf.len(),
            });
        }

        let addr_end = 12 + addr_len;
        let ip = match addr_len {
            4 => {
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&buf[12..addr_end]);
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            _ => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[12..addr_end]);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
        };
        let port = u16::from_be_bytes([buf[addr_end], buf[addr_end + 1]]);
        let payload = Bytes::copy_from_slice(&buf[addr_end + 2..]);

        Ok(Self {
            addr: SocketAddr::new(ip, port),
            payload,
        })
    }

    /// Read one frame from a stream
    ///
    /// Returns `Ok(None)` on a clean end of stream between frames. A bad
    /// header is reported before the body is read, so a corrupt length can
    /// never make the reader allocate or wait for an unbounded body.
    pub async fn read_from<R>(reader: &mut R) -> Result<Option<Self>, FrameError>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; 12];
        match reader.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(FrameError::Io(e.to_string())),
        }

        let (payload_len, addr_len) = parse_header(&header)?;
        let mut frame = vec![0u8; MIN_HEADER_LEN + addr_len + payload_len];
        frame[..12].copy_from_slice(&header);
        reader
            .read_exact(&mut frame[12..])
            .await
            .map_err(|e| FrameError::Io(e.to_string()))?;

        Self::decode(&frame).map(Some)
    }
}

/// Validate the first 12 bytes; returns `(payload_len, addr_len)`
fn parse_header(header: &[u8]) -> Result<(usize, usize), FrameError> {
    let word = |i: usize| u32::from_be_bytes([header[i], header[i + 1], header[i + 2], header[i + 3]]);

    let magic = word(0);
    if magic != MAGIC {
        return Err(FrameError::BadMagic(magic));
    }

    let payload_len = word(4);
    if payload_len as usize > MAX_PAYLOAD_LEN {
        return Err(FrameError::PayloadTooLarge(payload_len));
    }

    let addr_len = word(8);
    if addr_len != 4 && addr_len != 16 {
        return Err(FrameError::BadAddressLength(addr_len));
    }

    Ok((payload_len as usize, addr_len as usize))
}
