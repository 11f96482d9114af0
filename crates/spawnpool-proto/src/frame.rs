//! Length-prefixed CBOR framing over an async byte pipe.
//!
//! One frame is a `u32` big-endian length followed by that many bytes of CBOR.
//! [`FrameWriter`] encodes and flushes one message per call; [`FrameReader`]
//! yields decoded messages until EOF.
//!
//! A CBOR decode failure is scoped to the offending frame: the reader returns
//! [`ProtoError::Decode`] and stays usable, so a single corrupt message never
//! tears down the transport. I/O errors and oversized length prefixes are
//! fatal to the stream.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

/// Maximum frame length (64 MiB). Guards against a corrupt length prefix
/// allocating unbounded memory.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Errors produced by the frame codec.
#[derive(Error, Debug)]
pub enum ProtoError {
    /// The underlying pipe failed; the stream is dead.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A message could not be serialized to CBOR.
    #[error("frame encode error: {0}")]
    Encode(String),

    /// One frame held malformed CBOR; the stream remains usable.
    #[error("frame decode error: {0}")]
    Decode(String),
}

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

/// Writes length-prefixed CBOR messages to an async byte sink.
///
/// Writes are flushed per message so a child (or parent) blocked on the next
/// command never waits on buffered bytes. Callers that share one writer
/// across tasks are expected to serialise access themselves (the supervisor
/// holds it in an `Arc<Mutex<…>>`).
pub struct FrameWriter<W> {
    inner: FramedWrite<W, LengthDelimitedCodec>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Wrap an async writer in the frame codec.
    pub fn new(writer: W) -> Self {
        Self {
            inner: FramedWrite::new(writer, codec()),
        }
    }

    /// Encode `msg` as CBOR and write it as a single frame, flushing.
    ///
    /// # Errors
    ///
    /// [`ProtoError::Encode`] if serialization fails, [`ProtoError::Io`] if
    /// the pipe does.
    pub async fn send<T: Serialize>(&mut self, msg: &T) -> Result<(), ProtoError> {
        let mut buf = Vec::new();
        ciborium::into_writer(msg, &mut buf).map_err(|e| ProtoError::Encode(e.to_string()))?;
        self.inner.send(Bytes::from(buf)).await?;
        Ok(())
    }

    /// Shut the underlying writer down, signalling EOF to the peer.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the flush-and-close fails.
    pub async fn shutdown(&mut self) -> Result<(), ProtoError> {
        self.inner.close().await?;
        Ok(())
    }
}

/// Reads length-prefixed CBOR messages from an async byte source.
pub struct FrameReader<R> {
    inner: FramedRead<R, LengthDelimitedCodec>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wrap an async reader in the frame codec.
    pub fn new(reader: R) -> Self {
        Self {
            inner: FramedRead::new(reader, codec()),
        }
    }

    /// Read and decode the next frame, returning `None` on clean EOF.
    ///
    /// # Errors
    ///
    /// [`ProtoError::Decode`] for a malformed frame (the reader stays
    /// usable); [`ProtoError::Io`] for transport failures.
    pub async fn next<T: DeserializeOwned>(&mut self) -> Result<Option<T>, ProtoError> {
        match self.inner.next().await {
            None => Ok(None),
            Some(Err(e)) => Err(ProtoError::Io(e)),
            Some(Ok(frame)) => ciborium::from_reader(frame.as_ref())
                .map(Some)
                .map_err(|e| ProtoError::Decode(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Msg {
        id: String,
        n: u64,
        blob: Bytes,
    }

    fn sample(n: u64) -> Msg {
        Msg {
            id: format!("req-{n}"),
            n,
            blob: Bytes::from_static(&[0x00, 0xff, 0x7f, 0x01]),
        }
    }

    #[tokio::test]
    async fn test_roundtrip_single_frame() {
        let (client, server) = tokio::io::duplex(4096);
        let mut writer = FrameWriter::new(client);
        let mut reader = FrameReader::new(server);

        writer.send(&sample(1)).await.unwrap();
        let got: Msg = reader.next().await.unwrap().unwrap();
        assert_eq!(got, sample(1));
    }

    #[tokio::test]
    async fn test_roundtrip_preserves_binary_blob() {
        let (client, server) = tokio::io::duplex(4096);
        let mut writer = FrameWriter::new(client);
        let mut reader = FrameReader::new(server);

        let raw: Vec<u8> = (0u16..=255).map(|b| b as u8).collect();
        let msg = Msg {
            id: "blob".into(),
            n: 0,
            blob: Bytes::from(raw.clone()),
        };
        writer.send(&msg).await.unwrap();
        let got: Msg = reader.next().await.unwrap().unwrap();
        assert_eq!(got.blob.as_ref(), raw.as_slice());
    }

    #[tokio::test]
    async fn test_pipelined_frames_in_order() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let mut writer = FrameWriter::new(client);
        let mut reader = FrameReader::new(server);

        for n in 0..10 {
            writer.send(&sample(n)).await.unwrap();
        }
        for n in 0..10 {
            let got: Msg = reader.next().await.unwrap().unwrap();
            assert_eq!(got.n, n);
        }
    }

    #[tokio::test]
    async fn test_eof_returns_none() {
        let (client, server) = tokio::io::duplex(4096);
        drop(client);
        let mut reader = FrameReader::new(server);
        let got: Option<Msg> = reader.next().await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_decode_error_does_not_kill_stream() {
        use tokio::io::AsyncWriteExt;

        let (mut client, server) = tokio::io::duplex(4096);
        let mut reader = FrameReader::new(server);

        // A frame whose payload is not valid CBOR for Msg.
        client.write_all(&3u32.to_be_bytes()).await.unwrap();
        client.write_all(b"zzz").await.unwrap();

        // Followed by a valid frame.
        let mut buf = Vec::new();
        ciborium::into_writer(&sample(7), &mut buf).unwrap();
        client.write_all(&(buf.len() as u32).to_be_bytes()).await.unwrap();
        client.write_all(&buf).await.unwrap();
        client.flush().await.unwrap();

        let err = reader.next::<Msg>().await.unwrap_err();
        assert!(matches!(err, ProtoError::Decode(_)));

        // The stream survives the bad frame.
        let got: Msg = reader.next().await.unwrap().unwrap();
        assert_eq!(got.n, 7);
    }

    #[tokio::test]
    async fn test_writer_shutdown_propagates_eof() {
        let (client, server) = tokio::io::duplex(4096);
        let mut writer = FrameWriter::new(client);
        let mut reader = FrameReader::new(server);

        writer.send(&sample(3)).await.unwrap();
        writer.shutdown().await.unwrap();
        drop(writer);

        let got: Msg = reader.next().await.unwrap().unwrap();
        assert_eq!(got.n, 3);
        let eof: Option<Msg> = reader.next().await.unwrap();
        assert!(eof.is_none());
    }
}
