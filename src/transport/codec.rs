//! Frame codec and request bookkeeping shared by both ends of a TCP
//! connection.
//!
//! # Wire format
//!
//! ```text
//! +----------------+---------------------------+
//! | length: u32 BE | JSON-encoded Envelope     |
//! +----------------+---------------------------+
//! ```
//!
//! `length` counts the JSON bytes only and is capped at [`MAX_FRAME_SIZE`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::constants::MAX_FRAME_SIZE;
use crate::error::{Error, Result};
use crate::protocol::Envelope;

/// Depth of the per-connection outbound frame queue.
pub(crate) const OUTBOUND_QUEUE_DEPTH: usize = 256;

pub fn encode_frame(envelope: &Envelope) -> Result<Bytes> {
    let body = serde_json::to_vec(envelope)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(Error::Transport(format!(
            "frame of {} bytes exceeds maximum {MAX_FRAME_SIZE}",
            body.len()
        )));
    }
    let mut buf = BytesMut::with_capacity(4 + body.len());
    buf.put_u32(body.len() as u32);
    buf.put_slice(&body);
    Ok(buf.freeze())
}

/// Read one frame. `Ok(None)` means the peer closed the connection cleanly
/// between frames.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Envelope>> {
    let size = match reader.read_u32().await {
        Ok(size) => size as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if size > MAX_FRAME_SIZE {
        return Err(Error::Transport(format!(
            "frame of {size} bytes exceeds maximum {MAX_FRAME_SIZE}"
        )));
    }
    trace!(size, "Reading frame");

    let mut body = vec![0u8; size];
    reader.read_exact(&mut body).await?;
    Ok(Some(serde_json::from_slice(&body)?))
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, envelope: &Envelope) -> Result<()> {
    let frame = encode_frame(envelope)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Drain `outbound` into `writer` until the queue closes, a write fails or
/// `cancel` fires. Canceling the token on exit lets the reader side notice.
pub(crate) fn spawn_writer<W>(
    mut writer: W,
    mut outbound: mpsc::Receiver<Envelope>,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let envelope = tokio::select! {
                _ = cancel.cancelled() => break,
                next = outbound.recv() => match next {
                    Some(envelope) => envelope,
                    None => break,
                },
            };
            if let Err(e) = write_frame(&mut writer, &envelope).await {
                debug!(error = %e, "Frame write failed");
                break;
            }
        }
        cancel.cancel();
        let _ = writer.shutdown().await;
    })
}

/// Calls awaiting a reply, keyed by correlation id.
pub(crate) struct PendingCalls<T> {
    next_id: AtomicU64,
    waiting: DashMap<u64, oneshot::Sender<T>>,
}

impl<T> PendingCalls<T> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            waiting: DashMap::new(),
        })
    }

    /// Allocate a correlation id and the receiver its reply will land in.
    pub(crate) fn register(self: &Arc<Self>) -> (PendingGuard<T>, oneshot::Receiver<T>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.waiting.insert(id, tx);
        (
            PendingGuard {
                calls: Arc::clone(self),
                id,
            },
            rx,
        )
    }

    /// Route a reply to its waiter. Returns false for unknown ids, which
    /// happens when the caller already gave up.
    pub(crate) fn complete(&self, id: u64, reply: T) -> bool {
        match self.waiting.remove(&id) {
            Some((_, tx)) => tx.send(reply).is_ok(),
            None => false,
        }
    }

    /// Fail every outstanding call; used when the connection goes away.
    pub(crate) fn fail_all(&self) {
        self.waiting.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.waiting.len()
    }
}

/// Removes its entry on drop so abandoned calls do not accumulate.
pub(crate) struct PendingGuard<T> {
    calls: Arc<PendingCalls<T>>,
    id: u64,
}

impl<T> PendingGuard<T> {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }
}

impl<T> Drop for PendingGuard<T> {
    fn drop(&mut self) {
        self.calls.waiting.remove(&self.id);
    }
}

/// Send `envelope` and wait for the matching reply.
pub(crate) async fn round_trip<T>(
    outbound: &mpsc::Sender<Envelope>,
    pending: &Arc<PendingCalls<T>>,
    build: impl FnOnce(u64) -> Envelope,
) -> Result<T> {
    let (guard, reply) = pending.register();
    outbound
        .send(build(guard.id()))
        .await
        .map_err(|_| Error::Transport("connection closed".to_string()))?;
    let reply = reply
        .await
        .map_err(|_| Error::Transport("connection closed before reply".to_string()))?;
    drop(guard);
    Ok(reply)
}
