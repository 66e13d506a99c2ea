use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    select,
    sync::{
        Notify, mpsc,
        mpsc::error::TrySendError,
        oneshot,
    },
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, warn};

use crate::message::write_line;

/// How long teardown waits for queued lines to drain before abandoning the socket.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Lines a connection may have queued but not yet written. A client that falls
/// this far behind is cut off rather than buffered without limit.
pub const OUTBOUND_CAPACITY: usize = 128;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identity of one accepted connection.
///
/// Used as the registry key and as the exclusion token when broadcasting, so
/// identity never depends on the lifetime of the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("outbound sink is closed")]
    Closed,
    #[error("outbound queue is full")]
    Full,
}

/// Sending side of a connection's outbound line queue.
///
/// Cloning is cheap; every clone feeds the same writer task, which is the only
/// code that touches the socket, so lines from concurrent senders never
/// interleave.
#[derive(Debug, Clone)]
pub struct Outbound {
    tx: mpsc::Sender<String>,
    overflow: Arc<Notify>,
}

impl Outbound {
    /// Creates a queue without a writer task. The receiver stands in for the socket.
    pub fn channel() -> (Self, mpsc::Receiver<String>) {
        let (outbound, rx, _) = Self::with_overflow();
        (outbound, rx)
    }

    fn with_overflow() -> (Self, mpsc::Receiver<String>, Arc<Notify>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let overflow = Arc::new(Notify::new());
        let outbound = Self {
            tx,
            overflow: Arc::clone(&overflow),
        };
        (outbound, rx, overflow)
    }

    /// Queues one line. Never blocks.
    ///
    /// A full queue means the reader has stalled: the line is dropped and the
    /// writer is told to give up, which closes the queue for every sender.
    pub fn send(&self, line: impl Into<String>) -> Result<(), DeliveryError> {
        match self.tx.try_send(line.into()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.overflow.notify_one();
                Err(DeliveryError::Full)
            }
            Err(TrySendError::Closed(_)) => Err(DeliveryError::Closed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once the writer task has stopped draining the queue.
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

/// Handle to the task draining an [`Outbound`] queue into a transport.
pub struct Writer {
    close: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl Writer {
    /// Spawns the writer task for `sink` and returns the queue that feeds it.
    pub fn spawn<W>(sink: W, id: ConnectionId) -> (Outbound, Writer)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound, rx, overflow) = Outbound::with_overflow();
        let (close, close_rx) = oneshot::channel();
        let handle = tokio::spawn(drain_outbound(sink, rx, close_rx, overflow, id));
        (outbound, Writer { close, handle })
    }

    /// Flushes what is already queued, then shuts the transport down.
    ///
    /// A writer stuck on a stalled peer is aborted after [`CLOSE_TIMEOUT`].
    pub async fn close(self) {
        let Writer { close, mut handle } = self;
        // The task may already be gone after a write error; that is fine.
        let _ = close.send(());

        match timeout(CLOSE_TIMEOUT, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = ?err, "writer task ended abnormally"),
            Err(_) => {
                debug!("writer did not drain in time, aborting");
                handle.abort();
            }
        }
    }
}

async fn drain_outbound<W>(
    mut sink: W,
    mut rx: mpsc::Receiver<String>,
    mut close: oneshot::Receiver<()>,
    overflow: Arc<Notify>,
    id: ConnectionId,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        select! {
            biased;
            _ = overflow.notified() => {
                debug!(conn = %id, "outbound queue overflowed, dropping connection");
                return;
            }
            line = rx.recv() => match line {
                Some(line) => {
                    // A peer that stops reading parks this write; overflow must still win.
                    select! {
                        biased;
                        _ = overflow.notified() => {
                            debug!(conn = %id, "outbound queue overflowed, dropping connection");
                            return;
                        }
                        written = write_line(&mut sink, &line) => {
                            if let Err(err) = written {
                                debug!(conn = %id, error = ?err, "failed to write to connection");
                                return;
                            }
                        }
                    }
                }
                None => break,
            },
            _ = &mut close => break,
        }
    }

    if let Err(err) = sink.shutdown().await {
        debug!(conn = %id, error = ?err, "failed to close connection cleanly");
    }
}

/// A joined participant: identity, display name, and outbound queue.
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    name: Arc<str>,
    outbound: Outbound,
}

impl Connection {
    pub fn new(id: ConnectionId, name: impl Into<Arc<str>>, outbound: Outbound) -> Self {
        Self {
            id,
            name: name.into(),
            outbound,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn send(&self, line: impl Into<String>) -> Result<(), DeliveryError> {
        self.outbound.send(line)
    }
}
