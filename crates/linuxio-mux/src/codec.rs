use std::io;

use bytes::{Buf as _, BufMut as _, BytesMut};
use linuxio_proto::{Envelope, Error, LEN_PREFIX_SIZE};
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};
use tokio_util::codec::{Decoder, Encoder};

pub(crate) struct FrameCodec {
    pub(crate) max_frame_size: usize,
}

impl Decoder for FrameCodec {
    type Item = Envelope;

    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        const MAX_RESERVE_CHUNK_IN_BYTES: usize = 8 * 1024; // 8 kiB

        if src.len() < LEN_PREFIX_SIZE {
            // Not enough data to read the length marker.
            return Ok(None);
        }

        let mut length_bytes = [0u8; LEN_PREFIX_SIZE];
        length_bytes.copy_from_slice(&src[..LEN_PREFIX_SIZE]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > self.max_frame_size {
            return Err(io::Error::other(Error::FrameTooLarge {
                announced: length,
                max: self.max_frame_size,
            }));
        }

        if src.len() < LEN_PREFIX_SIZE + length {
            // The full frame has not arrived yet.
            // Reserve more space in the buffer (good performance-wise).
            let additional = core::cmp::min(MAX_RESERVE_CHUNK_IN_BYTES, LEN_PREFIX_SIZE + length - src.len());
            src.reserve(additional);

            // Inform the Framed that more bytes are required to form the next frame.
            return Ok(None);
        }

        src.advance(LEN_PREFIX_SIZE);
        let body = src.split_to(length).freeze();

        let envelope = Envelope::decode(body).map_err(io::Error::other)?;

        Ok(Some(envelope))
    }
}

impl Encoder<Envelope> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode(dst, self.max_frame_size).map_err(io::Error::other)
    }
}

/// Writes a single frame outside the multiplexer, for the pre-mux HELLO
/// exchange.
pub async fn write_envelope<W>(writer: &mut W, envelope: &Envelope, max_frame_size: usize) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::new();
    envelope.encode(&mut buf, max_frame_size).map_err(io::Error::other)?;
    writer.write_all(&buf).await?;
    writer.flush().await
}

/// Reads a single frame outside the multiplexer, for the pre-mux HELLO
/// exchange.
pub async fn read_envelope<R>(reader: &mut R, max_frame_size: usize) -> io::Result<Envelope>
where
    R: AsyncRead + Unpin,
{
    let mut length_bytes = [0u8; LEN_PREFIX_SIZE];
    reader.read_exact(&mut length_bytes).await?;
    let length = u32::from_be_bytes(length_bytes) as usize;

    if length > max_frame_size {
        return Err(io::Error::other(Error::FrameTooLarge {
            announced: length,
            max: max_frame_size,
        }));
    }

    let mut body = BytesMut::with_capacity(length);
    body.put_bytes(0, length);
    reader.read_exact(&mut body).await?;

    Envelope::decode(body.freeze()).map_err(io::Error::other)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

    use super::*;
    use linuxio_proto::{Bytes, Kind};

    #[test]
    fn decode_partial_then_full() {
        let envelope = Envelope::data(1, 1, Bytes::from_static(b"abcdef"));
        let mut wire = BytesMut::new();
        envelope.encode(&mut wire, 1024).unwrap();

        let mut codec = FrameCodec { max_frame_size: 1024 };

        let mut partial = BytesMut::from(&wire[..wire.len() - 3]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&wire[wire.len() - 3..]);
        let decoded = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(envelope, decoded);
        assert!(partial.is_empty());
    }

    #[test]
    fn oversized_announced_length_is_fatal() {
        let mut src = BytesMut::new();
        src.put_u32(u32::MAX);
        src.put_bytes(0, 16);

        let mut codec = FrameCodec { max_frame_size: 1024 };
        let err = codec.decode(&mut src).unwrap_err();
        assert!(err.to_string().contains("exceeds ceiling"));
    }

    #[tokio::test]
    async fn envelope_helpers_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(256);

        let envelope = Envelope::empty(Kind::Ping, 0, 42);
        write_envelope(&mut a, &envelope, 1024).await.unwrap();

        let read_back = read_envelope(&mut b, 1024).await.unwrap();
        assert_eq!(envelope, read_back);
    }
}
