//! Codec for control-channel frames
//!
//! Format: `[length: u32 BE][payload: utf-8]`. The control channel runs the
//! codec through `tokio_util::codec::Framed`; the transfer port reads exactly
//! one frame with [`read_frame`] so no bytes past the greeting are buffered.

use crate::MAX_FRAME_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Frame is not valid UTF-8")]
    InvalidUtf8,
}

/// Length-prefixed UTF-8 frame codec
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl FrameCodec {
    /// Encode a single frame to bytes
    pub fn encode_frame(payload: &str) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::with_capacity(4 + payload.len());
        FrameCodec.encode(payload, &mut buf)?;
        Ok(buf.freeze())
    }
}

impl Decoder for FrameCodec {
    type Item = String;
    type Error = CodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<String>, CodecError> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&buf[..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(length));
        }

        if buf.len() < 4 + length {
            buf.reserve(4 + length - buf.len());
            return Ok(None);
        }

        buf.advance(4);
        let payload = buf.split_to(length);
        String::from_utf8(payload.to_vec())
            .map(Some)
            .map_err(|_| CodecError::InvalidUtf8)
    }
}

impl Encoder<&str> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: &str, dst: &mut BytesMut) -> Result<(), CodecError> {
        if item.len() > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(item.len()));
        }
        dst.reserve(4 + item.len());
        dst.put_u32(item.len() as u32);
        dst.extend_from_slice(item.as_bytes());
        Ok(())
    }
}

impl Encoder<String> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), CodecError> {
        Encoder::<&str>::encode(self, item.as_str(), dst)
    }
}

/// Read exactly one frame from a raw stream
///
/// Returns `Ok(None)` if the stream was closed before the length prefix.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<String>, CodecError>
where
    R: AsyncRead + Unpin,
{
    let length = match reader.read_u32().await {
        Ok(length) => length as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    if length > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge(length));
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;
    String::from_utf8(payload)
        .map(Some)
        .map_err(|_| CodecError::InvalidUtf8)
}

/// Write one frame to a raw stream and flush it
pub async fn write_frame<W>(writer: &mut W, payload: &str) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    let frame = FrameCodec::encode_frame(payload)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_incomplete() {
        let encoded = FrameCodec::encode_frame(":>ping").unwrap();

        let mut buf = BytesMut::from(&encoded[..4]);
        assert_eq!(FrameCodec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(&encoded[4..]);
        assert_eq!(
            FrameCodec.decode(&mut buf).unwrap(),
            Some(":>ping".to_string())
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_multiple() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&FrameCodec::encode_frame("first").unwrap());
        buf.extend_from_slice(&FrameCodec::encode_frame("second").unwrap());

        assert_eq!(FrameCodec.decode(&mut buf).unwrap().as_deref(), Some("first"));
        assert_eq!(FrameCodec.decode(&mut buf).unwrap().as_deref(), Some("second"));
        assert_eq!(FrameCodec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);
        assert!(matches!(
            FrameCodec.decode(&mut buf),
            Err(CodecError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(2);
        buf.extend_from_slice(&[0xff, 0xfe]);
        assert!(matches!(
            FrameCodec.decode(&mut buf),
            Err(CodecError::InvalidUtf8)
        ));
    }

    #[tokio::test]
    async fn test_read_frame_leaves_trailing_bytes() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        write_frame(&mut client, "TCP;42").await.unwrap();
        client.write_all(b"raw payload").await.unwrap();
        drop(client);

        let greeting = read_frame(&mut server).await.unwrap();
        assert_eq!(greeting.as_deref(), Some("TCP;42"));

        let mut rest = Vec::new();
        server.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"raw payload");
    }

    #[tokio::test]
    async fn test_read_frame_on_closed_stream() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        assert_eq!(read_frame(&mut server).await.unwrap(), None);
    }
}
