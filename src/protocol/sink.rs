use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::SinkExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::codec::FramedWrite;

use super::{FrameCodec, Outbound};
use crate::error::FrameError;

pub type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// Shared write side of one connection.
///
/// The connection's own task and every other session relaying to it go
/// through the same lock, so whole frames never interleave.
#[derive(Clone)]
pub struct FrameSink {
    inner: Arc<Mutex<FramedWrite<BoxedWriter, FrameCodec>>>,
    timeout: Duration,
}

impl FrameSink {
    pub fn new<W>(writer: W, codec: FrameCodec, timeout: Duration) -> Self
    where
        W: AsyncWrite + Send + 'static,
    {
        let boxed: BoxedWriter = Box::pin(writer);
        Self {
            inner: Arc::new(Mutex::new(FramedWrite::new(boxed, codec))),
            timeout,
        }
    }

    /// Encode and flush one frame, bounded by the write timeout.
    pub async fn send(&self, item: impl Into<Outbound>) -> Result<(), FrameError> {
        let item = item.into();
        let mut framed = self.inner.lock().await;
        match tokio::time::timeout(self.timeout, framed.send(item)).await {
            Ok(result) => result,
            Err(_) => Err(FrameError::WriteTimeout {
                secs: self.timeout.as_secs(),
            }),
        }
    }

    /// Shut down the underlying writer. Errors are ignored; the peer may
    /// already be gone.
    pub async fn close(&self) {
        let mut framed = self.inner.lock().await;
        let _ = tokio::time::timeout(self.timeout, framed.get_mut().shutdown()).await;
    }
}
