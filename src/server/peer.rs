use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{MasterError, Result};
use crate::protocol::{write_frame, Frame};
use crate::scheduler::ConnId;

/// Frames queued per connection. A peer that falls this far behind is
/// treated as unreachable and closed.
pub const PEER_QUEUE_DEPTH: usize = 256;

/// A frame handed to a connection's writer task, with a channel for the
/// write result.
#[derive(Debug)]
pub struct OutboundFrame {
    pub frame: Frame,
    pub done: oneshot::Sender<io::Result<()>>,
}

/// Completion of a frame already queued on a connection.
///
/// Dropping it does not cancel the write.
#[derive(Debug)]
pub struct PendingSend {
    conn_id: ConnId,
    result: oneshot::Receiver<io::Result<()>>,
}

impl PendingSend {
    /// Wait until the writer has flushed the frame.
    pub async fn wait(self) -> Result<()> {
        self.result
            .await
            .map_err(|_| MasterError::PeerClosed(self.conn_id))??;
        Ok(())
    }
}

/// Non-owning handle to a connection.
///
/// The socket's write half belongs to a single writer task; the read half
/// belongs to the connection handler. Registry records only keep clones of
/// this handle, so closing a stale session never touches the socket directly.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    conn_id: ConnId,
    tx: mpsc::Sender<OutboundFrame>,
    close: CancellationToken,
}

impl PeerHandle {
    /// Create a handle and the inbox its writer task drains.
    pub fn channel(conn_id: ConnId, depth: usize) -> (Self, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(depth);
        let handle = Self {
            conn_id,
            tx,
            close: CancellationToken::new(),
        };
        (handle, rx)
    }

    /// An in-process peer whose frames are delivered to the returned receiver.
    /// Dropping the receiver makes later sends fail.
    pub fn loopback(conn_id: ConnId) -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (handle, mut inbox) = Self::channel(conn_id, PEER_QUEUE_DEPTH);
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let close = handle.close.clone();
        tokio::spawn(async move {
            loop {
                let out = tokio::select! {
                    _ = close.cancelled() => break,
                    out = inbox.recv() => match out {
                        Some(out) => out,
                        None => break,
                    },
                };
                if frames_tx.send(out.frame).is_err() {
                    close.cancel();
                    let _ = out.done.send(Err(io::ErrorKind::BrokenPipe.into()));
                    break;
                }
                let _ = out.done.send(Ok(()));
            }
        });
        (handle, frames_rx)
    }

    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    /// Queue `frame` without waiting.
    ///
    /// Frames queued through one handle reach the socket in call order. A full
    /// queue closes the peer.
    pub fn enqueue(&self, frame: Frame) -> Result<PendingSend> {
        if self.close.is_cancelled() {
            return Err(MasterError::PeerClosed(self.conn_id));
        }
        let (done, result) = oneshot::channel();
        match self.tx.try_send(OutboundFrame { frame, done }) {
            Ok(()) => Ok(PendingSend {
                conn_id: self.conn_id,
                result,
            }),
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(conn_id = self.conn_id, "Outbound queue full, closing connection");
                self.close.cancel();
                Err(MasterError::PeerClosed(self.conn_id))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(MasterError::PeerClosed(self.conn_id)),
        }
    }

    /// Queue `frame` and wait until the writer has flushed it.
    pub async fn send(&self, frame: Frame) -> Result<()> {
        self.enqueue(frame)?.wait().await
    }

    pub fn is_closed(&self) -> bool {
        self.close.is_cancelled() || self.tx.is_closed()
    }

    /// Ask the connection to shut down. Its handler sees this and exits.
    pub fn close(&self) {
        self.close.cancel();
    }

    pub async fn closed(&self) {
        self.close.cancelled().await
    }

    pub(crate) fn close_token(&self) -> CancellationToken {
        self.close.clone()
    }
}

/// Drain `inbox` into `writer` until the peer is closed or a write fails.
pub fn spawn_writer<W>(
    conn_id: ConnId,
    mut writer: W,
    mut inbox: mpsc::Receiver<OutboundFrame>,
    close: CancellationToken,
) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let out = tokio::select! {
                _ = close.cancelled() => break,
                out = inbox.recv() => match out {
                    Some(out) => out,
                    None => break,
                },
            };
            match write_frame(&mut writer, &out.frame).await {
                Ok(()) => {
                    let _ = out.done.send(Ok(()));
                }
                Err(e) => {
                    tracing::debug!(conn_id, error = %e, "Write failed, closing connection");
                    // Mark closed before reporting so the caller sees a closed peer.
                    close.cancel();
                    let _ = out.done.send(Err(e));
                    break;
                }
            }
        }
        let _ = writer.shutdown().await;
    })
}
