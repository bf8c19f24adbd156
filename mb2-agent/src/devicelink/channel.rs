//! Backup-protocol message channel.
//!
//! `DeviceLinkChannel` abstracts the established mobilebackup2 service
//! connection: plist messages framed with a big-endian u32 length prefix,
//! plus a raw byte lane used by the file-stream sublane. `PlistStream`
//! is the provided implementation over any async byte stream.

use bytes::{BufMut, BytesMut};
use plist::Value;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on one encoded message; prevents memory exhaustion from a
/// corrupt length prefix.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("receive timed out")]
    TimedOut,

    #[error("connection closed")]
    Closed,

    #[error("message of {0} bytes exceeds frame limit")]
    Oversize(usize),

    #[error("plist error: {0}")]
    Plist(#[from] plist::Error),

    #[error("I/O error: {0}")]
    Io(std::io::Error),
}

impl From<std::io::Error> for ChannelError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => ChannelError::Closed,
            _ => ChannelError::Io(err),
        }
    }
}

/// Bidirectional message channel to the device's backup service.
#[allow(async_fn_in_trait)]
pub trait DeviceLinkChannel {
    async fn send(&mut self, message: Value) -> Result<(), ChannelError>;

    /// Block for one message, up to `timeout`. `ChannelError::TimedOut` is
    /// distinguishable from connection failure so the caller can poll its
    /// cancellation flag and retry.
    async fn receive(&mut self, timeout: Duration) -> Result<Value, ChannelError>;

    async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), ChannelError>;

    async fn receive_exact(&mut self, buf: &mut [u8]) -> Result<(), ChannelError>;

    async fn send_be_u32(&mut self, value: u32) -> Result<(), ChannelError> {
        self.send_raw(&value.to_be_bytes()).await
    }

    async fn receive_be_u32(&mut self) -> Result<u32, ChannelError> {
        let mut buf = [0u8; 4];
        self.receive_exact(&mut buf).await?;
        Ok(u32::from_be_bytes(buf))
    }

    async fn receive_code(&mut self) -> Result<u8, ChannelError> {
        let mut buf = [0u8; 1];
        self.receive_exact(&mut buf).await?;
        Ok(buf[0])
    }
}

/// Length-prefixed binary-plist framing over an async byte stream.
pub struct PlistStream<S> {
    stream: S,
}

impl<S> PlistStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S> DeviceLinkChannel for PlistStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    async fn send(&mut self, message: Value) -> Result<(), ChannelError> {
        let mut payload = Vec::new();
        message.to_writer_binary(&mut payload)?;
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(ChannelError::Oversize(payload.len()));
        }

        let mut frame = BytesMut::with_capacity(4 + payload.len());
        frame.put_u32(payload.len() as u32);
        frame.put_slice(&payload);
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Value, ChannelError> {
        let mut len_buf = [0u8; 4];
        match tokio::time::timeout(timeout, self.stream.read_exact(&mut len_buf)).await {
            Err(_) => return Err(ChannelError::TimedOut),
            Ok(result) => {
                result?;
            }
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_MESSAGE_SIZE {
            return Err(ChannelError::Oversize(len));
        }
        let mut body = vec![0u8; len];
        self.stream.read_exact(&mut body).await?;

        let value: Value = plist::from_bytes(&body)?;
        Ok(value)
    }

    async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), ChannelError> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn receive_exact(&mut self, buf: &mut [u8]) -> Result<(), ChannelError> {
        self.stream.read_exact(buf).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn message_round_trip() {
        let (a, b) = tokio::io::duplex(4096);
        let mut left = PlistStream::new(a);
        let mut right = PlistStream::new(b);

        let message = crate::devicelink::status_response(0, None, None);
        left.send(message.clone()).await.unwrap();

        let received = right.receive(Duration::from_secs(1)).await.unwrap();
        assert_eq!(received, message);
    }

    #[tokio::test]
    async fn receive_times_out_on_silence() {
        let (a, _b) = tokio::io::duplex(64);
        let mut channel = PlistStream::new(a);

        let err = channel.receive(Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, ChannelError::TimedOut));
    }

    #[tokio::test]
    async fn receive_reports_closed_peer() {
        let (a, b) = tokio::io::duplex(64);
        drop(b);
        let mut channel = PlistStream::new(a);

        let err = channel.receive(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ChannelError::Closed));
    }

    #[tokio::test]
    async fn oversize_length_prefix_is_rejected() {
        let (a, mut b) = tokio::io::duplex(64);
        let mut channel = PlistStream::new(a);

        b.write_all(&(u32::MAX).to_be_bytes()).await.unwrap();
        let err = channel.receive(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ChannelError::Oversize(_)));
    }

    #[tokio::test]
    async fn raw_lane_round_trip() {
        let (a, b) = tokio::io::duplex(64);
        let mut left = PlistStream::new(a);
        let mut right = PlistStream::new(b);

        left.send_be_u32(0x0102_0304).await.unwrap();
        left.send_raw(&[0x0c]).await.unwrap();

        assert_eq!(right.receive_be_u32().await.unwrap(), 0x0102_0304);
        assert_eq!(right.receive_code().await.unwrap(), 0x0c);
    }
}
