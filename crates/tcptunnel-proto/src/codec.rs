//! Length-prefixed framing
//!
//! Format: [length: u32 big-endian][payload: UTF-8 JSON object]
//!
//! The control channel runs this framing for its whole life through
//! [`ControlChannel`]. A relay socket carries exactly one frame (read with
//! [`read_frame`]) before switching to raw bytes, so it must never read past
//! the end of that frame.

use std::net::SocketAddr;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::error::ProtoError;
use crate::messages::encode_signed;

/// Maximum frame payload size (64KB)
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(MAX_FRAME_SIZE)
        .new_codec()
}

/// A framed, ordered control connection over TCP
pub struct ControlChannel {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
    peer_addr: SocketAddr,
}

impl ControlChannel {
    pub fn new(stream: TcpStream) -> Result<Self, ProtoError> {
        let peer_addr = stream.peer_addr()?;
        Ok(Self {
            framed: Framed::new(stream, frame_codec()),
            peer_addr,
        })
    }

    /// Connect to `addr` and wrap the stream
    pub async fn connect(addr: &str) -> Result<Self, ProtoError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Self::new(stream)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Sign `msg` with `secret` and send it as one frame
    pub async fn send_signed<M: Serialize>(
        &mut self,
        secret: &str,
        msg: &M,
    ) -> Result<(), ProtoError> {
        let payload = encode_signed(secret, msg)?;
        self.send_frame(payload).await
    }

    /// Send a raw frame payload
    pub async fn send_frame(&mut self, payload: Vec<u8>) -> Result<(), ProtoError> {
        if payload.len() > MAX_FRAME_SIZE {
            return Err(ProtoError::FrameTooLarge(payload.len()));
        }
        self.framed.send(Bytes::from(payload)).await?;
        Ok(())
    }

    /// Receive the next frame payload
    ///
    /// Returns Ok(None) once the peer closed the connection cleanly.
    pub async fn recv_frame(&mut self) -> Result<Option<Bytes>, ProtoError> {
        match self.framed.next().await {
            Some(Ok(frame)) => Ok(Some(frame.freeze())),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    /// Flush pending frames and shut down the write side
    pub async fn close(&mut self) -> Result<(), ProtoError> {
        SinkExt::<Bytes>::close(&mut self.framed).await?;
        Ok(())
    }
}

/// Read exactly one frame from `reader`, consuming nothing beyond it
///
/// Returns Ok(None) if the stream ended before a length header arrived.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, ProtoError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let length = u32::from_be_bytes(header) as usize;
    if length > MAX_FRAME_SIZE {
        return Err(ProtoError::FrameTooLarge(length));
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Write one frame to `writer`
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), ProtoError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtoError::FrameTooLarge(payload.len()));
    }
    writer
        .write_all(&(payload.len() as u32).to_be_bytes())
        .await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{decode_fields, ControlMessage};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_read_frame_stops_at_boundary() {
        let mut wire = Vec::new();
        write_frame(&mut wire, b"{\"a\":1}").await.unwrap();
        wire.extend_from_slice(b"raw trailing bytes");

        let mut reader = std::io::Cursor::new(wire);
        let frame = read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(frame, b"{\"a\":1}");

        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"raw trailing bytes");
    }

    #[tokio::test]
    async fn test_read_frame_on_empty_stream() {
        let mut reader = std::io::Cursor::new(Vec::<u8>::new());
        assert!(read_frame(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_frame_rejects_oversized_length() {
        let mut wire = ((MAX_FRAME_SIZE + 1) as u32).to_be_bytes().to_vec();
        wire.extend_from_slice(&[0u8; 8]);
        let mut reader = std::io::Cursor::new(wire);
        assert!(matches!(
            read_frame(&mut reader).await,
            Err(ProtoError::FrameTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn test_control_channel_interops_with_raw_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let frame = read_frame(&mut socket).await.unwrap().unwrap();
            write_frame(&mut socket, &frame).await.unwrap();
        });

        let mut channel = ControlChannel::connect(&addr.to_string()).await.unwrap();
        channel
            .send_signed(
                "secret",
                &ControlMessage::Message {
                    message: "hello".to_string(),
                },
            )
            .await
            .unwrap();

        let echoed = channel.recv_frame().await.unwrap().unwrap();
        let fields = decode_fields(&echoed).unwrap();
        assert_eq!(fields["message"], "hello");

        server.await.unwrap();
        assert!(channel.recv_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_close_flushes_and_ends_the_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let frame = read_frame(&mut socket).await.unwrap().unwrap();
            let after = read_frame(&mut socket).await.unwrap();
            (frame, after)
        });

        let mut channel = ControlChannel::connect(&addr.to_string()).await.unwrap();
        channel.send_frame(b"{\"last\":true}".to_vec()).await.unwrap();
        channel.close().await.unwrap();

        let (frame, after) = server.await.unwrap();
        assert_eq!(frame, b"{\"last\":true}");
        assert!(after.is_none());
    }
}
