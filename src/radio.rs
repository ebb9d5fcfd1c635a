//! Seam for the LoRa radio driver. The bridge treats the radio as an opaque
//! collaborator: set it up once, read one message at a time, observe its
//! link status. An empty read means "no message", never an error.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UnixDatagram;
use tokio::time::timeout;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum RadioError {
    #[error("radio is not set up")]
    NotReady,

    #[error("radio I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Link status as last reported by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioStatus {
    Ready,
    Fault,
}

/// Trait for abstracting the radio driver to enable dependency injection
#[async_trait]
pub trait Radio {
    /// Initialize the radio link
    async fn setup(&mut self) -> Result<RadioStatus, RadioError>;

    /// Read one inbound message. An empty payload means no message was
    /// available within the read timeout.
    async fn read_message(&mut self) -> Result<Bytes, RadioError>;

    /// Link status after the last operation
    fn status(&self) -> RadioStatus;
}

/// Radio driver fed through a Unix datagram socket.
///
/// The driver process owns the physical transceiver and forwards each
/// received frame as one datagram; this side only binds the socket and
/// drains it.
pub struct SocketRadio {
    path: PathBuf,
    read_timeout: Duration,
    socket: Option<UnixDatagram>,
    status: RadioStatus,
}

impl SocketRadio {
    /// Largest frame the driver will forward in one datagram
    const MAX_FRAME: usize = 4096;

    pub fn new(path: impl Into<PathBuf>, read_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            read_timeout,
            socket: None,
            status: RadioStatus::Fault,
        }
    }
}

#[async_trait]
impl Radio for SocketRadio {
    async fn setup(&mut self) -> Result<RadioStatus, RadioError> {
        // Clear a stale socket left over from a previous run
        if self.path.exists() {
            tokio::fs::remove_file(&self.path).await?;
        }

        let socket = UnixDatagram::bind(&self.path)?;
        info!(path = %self.path.display(), "radio socket bound");
        self.socket = Some(socket);
        self.status = RadioStatus::Ready;
        Ok(self.status)
    }

    async fn read_message(&mut self) -> Result<Bytes, RadioError> {
        let socket = self.socket.as_ref().ok_or(RadioError::NotReady)?;

        let mut buf = vec![0u8; Self::MAX_FRAME];
        match timeout(self.read_timeout, socket.recv(&mut buf)).await {
            // No frame within the timeout, not an error
            Err(_) => Ok(Bytes::new()),
            Ok(Ok(len)) => {
                debug!(len, "received radio frame");
                buf.truncate(len);
                Ok(Bytes::from(buf))
            }
            Ok(Err(e)) => {
                self.status = RadioStatus::Fault;
                Err(e.into())
            }
        }
    }

    fn status(&self) -> RadioStatus {
        self.status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn it_reads_a_frame_sent_by_the_driver() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("radio.sock");

        let mut radio = SocketRadio::new(&path, Duration::from_millis(500));
        assert_eq!(radio.setup().await.unwrap(), RadioStatus::Ready);

        let driver = UnixDatagram::unbound().unwrap();
        driver
            .send_to(br#"{"temperature":27.3}"#, &path)
            .await
            .unwrap();

        let frame = radio.read_message().await.unwrap();
        assert_eq!(&frame[..], br#"{"temperature":27.3}"#);
        assert_eq!(radio.status(), RadioStatus::Ready);
    }

    #[tokio::test]
    async fn an_empty_read_is_not_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("radio.sock");

        let mut radio = SocketRadio::new(&path, Duration::from_millis(10));
        radio.setup().await.unwrap();

        let frame = radio.read_message().await.unwrap();
        assert!(frame.is_empty());
    }

    #[tokio::test]
    async fn reading_before_setup_fails() {
        let mut radio = SocketRadio::new("/tmp/never-bound.sock", Duration::from_millis(10));
        assert!(matches!(
            radio.read_message().await,
            Err(RadioError::NotReady)
        ));
    }
}
