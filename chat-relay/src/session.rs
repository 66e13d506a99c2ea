//! Per-connection control loop.
//!
//! A session walks `Connecting -> Negotiating -> Joined -> Leaving -> Closed`.
//! Every exit path out of `Joined` (quit command, end of stream, read error,
//! dead writer, server shutdown) funnels through the single `Leaving` state,
//! whose teardown is guarded so it runs at most once.

use std::{fmt, io, sync::Arc};

use tokio::{
    io::{AsyncBufRead, AsyncWrite},
    select,
    sync::watch,
};
use tracing::{debug, info, trace};

use crate::{
    broadcast::Broadcaster,
    connection::{Connection, ConnectionId, Outbound, Writer},
    message::{NAME_PROMPT, chat_line, display_name, is_quit, join_notice, leave_notice, read_line},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Negotiating,
    Joined,
    Leaving(LeaveReason),
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveReason {
    Quit,
    RemoteClosed,
    ReadFailed,
    WriteFailed,
    Shutdown,
}

impl fmt::Display for LeaveReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            LeaveReason::Quit => "quit",
            LeaveReason::RemoteClosed => "remote closed",
            LeaveReason::ReadFailed => "read failed",
            LeaveReason::WriteFailed => "write failed",
            LeaveReason::Shutdown => "server shutdown",
        };
        f.write_str(reason)
    }
}

pub struct Session<R> {
    id: ConnectionId,
    reader: R,
    outbound: Outbound,
    writer: Option<Writer>,
    broadcaster: Broadcaster,
    shutdown: watch::Receiver<bool>,
    state: SessionState,
    member: Option<Connection>,
    torn_down: bool,
}

impl<R> Session<R>
where
    R: AsyncBufRead + Unpin,
{
    /// Creates a session in `Connecting` and starts the writer task for `sink`.
    pub fn new<W>(
        reader: R,
        sink: W,
        broadcaster: Broadcaster,
        shutdown: watch::Receiver<bool>,
    ) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let id = ConnectionId::next();
        let (outbound, writer) = Writer::spawn(sink, id);
        Self {
            id,
            reader,
            outbound,
            writer: Some(writer),
            broadcaster,
            shutdown,
            state: SessionState::Connecting,
            member: None,
            torn_down: false,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Drives the session until it is closed and reports why it left.
    pub async fn run(mut self) -> LeaveReason {
        let mut reason = LeaveReason::RemoteClosed;
        loop {
            let current = self.state;
            let next = match current {
                SessionState::Connecting => SessionState::Negotiating,
                SessionState::Negotiating => self.negotiate().await,
                SessionState::Joined => self.join_and_relay().await,
                SessionState::Leaving(why) => {
                    reason = why;
                    self.teardown(why).await;
                    SessionState::Closed
                }
                SessionState::Closed => break,
            };
            trace!(conn = %self.id, from = ?current, to = ?next, "session transition");
            self.state = next;
        }
        reason
    }

    async fn negotiate(&mut self) -> SessionState {
        if self.outbound.send(NAME_PROMPT).is_err() {
            return SessionState::Leaving(LeaveReason::WriteFailed);
        }

        let line = select! {
            line = read_line(&mut self.reader) => line,
            _ = wait_for_shutdown(&mut self.shutdown) => {
                return SessionState::Leaving(LeaveReason::Shutdown);
            }
        };

        match line {
            Ok(line) => {
                let name = display_name(line.as_deref());
                self.member = Some(Connection::new(self.id, name, self.outbound.clone()));
                SessionState::Joined
            }
            Err(err) => {
                debug!(conn = %self.id, error = ?err, "failed to read name");
                SessionState::Leaving(LeaveReason::ReadFailed)
            }
        }
    }

    async fn join_and_relay(&mut self) -> SessionState {
        let Some(member) = self.member.clone() else {
            return SessionState::Leaving(LeaveReason::ReadFailed);
        };

        self.broadcaster.registry().add(member.clone()).await;
        info!(conn = %self.id, name = %member.name(), "client joined");
        self.broadcaster
            .deliver(&join_notice(member.name()), self.id)
            .await;

        loop {
            let line = select! {
                line = read_line(&mut self.reader) => line,
                _ = self.outbound.closed() => {
                    return SessionState::Leaving(LeaveReason::WriteFailed);
                }
                _ = wait_for_shutdown(&mut self.shutdown) => {
                    return SessionState::Leaving(LeaveReason::Shutdown);
                }
            };

            match classify(line, self.id) {
                Inbound::Chat(text) => {
                    self.broadcaster
                        .deliver(&chat_line(member.name(), &text), self.id)
                        .await;
                }
                Inbound::Leave(reason) => return SessionState::Leaving(reason),
            }
        }
    }

    /// Closes the transport, leaves the registry, and tells the remaining peers.
    ///
    /// Safe to call more than once; only the first call has any effect.
    async fn teardown(&mut self, reason: LeaveReason) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        if let Some(writer) = self.writer.take() {
            writer.close().await;
        }

        let registry = Arc::clone(self.broadcaster.registry());
        if let Some(member) = self.member.take() {
            registry.remove(self.id).await;
            info!(conn = %self.id, name = %member.name(), %reason, "client left");
            self.broadcaster
                .deliver(&leave_notice(member.name()), self.id)
                .await;
        } else {
            debug!(conn = %self.id, %reason, "client left before joining");
        }
    }
}

enum Inbound {
    Chat(String),
    Leave(LeaveReason),
}

fn classify(line: io::Result<Option<String>>, id: ConnectionId) -> Inbound {
    match line {
        Ok(Some(line)) if is_quit(&line) => Inbound::Leave(LeaveReason::Quit),
        Ok(Some(line)) => Inbound::Chat(line),
        Ok(None) => Inbound::Leave(LeaveReason::RemoteClosed),
        Err(err) => {
            debug!(conn = %id, error = ?err, "failed to read from connection");
            Inbound::Leave(LeaveReason::ReadFailed)
        }
    }
}

/// Resolves once shutdown has been requested. Pends forever if the server
/// side of the channel is dropped without requesting it.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{
        io::{AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf},
        time::timeout,
    };

    use super::*;
    use crate::{message::write_line, registry::Registry};

    struct Harness {
        broadcaster: Broadcaster,
        shutdown: watch::Sender<bool>,
        shutdown_rx: watch::Receiver<bool>,
    }

    impl Harness {
        fn new() -> Self {
            let (shutdown, shutdown_rx) = watch::channel(false);
            Self {
                broadcaster: Broadcaster::new(Arc::new(Registry::new())),
                shutdown,
                shutdown_rx,
            }
        }

        fn session(
            &self,
        ) -> (
            Session<BufReader<ReadHalf<DuplexStream>>>,
            BufReader<ReadHalf<DuplexStream>>,
            WriteHalf<DuplexStream>,
        ) {
            let (server, client) = tokio::io::duplex(4096);
            let (server_read, server_write) = tokio::io::split(server);
            let (client_read, client_write) = tokio::io::split(client);
            let session = Session::new(
                BufReader::new(server_read),
                server_write,
                self.broadcaster.clone(),
                self.shutdown_rx.clone(),
            );
            (session, BufReader::new(client_read), client_write)
        }
    }

    async fn next_line(reader: &mut BufReader<ReadHalf<DuplexStream>>) -> Option<String> {
        timeout(Duration::from_secs(1), read_line(reader))
            .await
            .expect("timed out waiting for line")
            .expect("read line")
    }

    #[tokio::test]
    async fn eof_during_negotiation_joins_as_anonymous_then_leaves() {
        let harness = Harness::new();
        let (session, mut reader, mut writer) = harness.session();
        let task = tokio::spawn(session.run());

        assert_eq!(next_line(&mut reader).await.as_deref(), Some(NAME_PROMPT));
        writer.shutdown().await.expect("close client side");

        let reason = timeout(Duration::from_secs(1), task)
            .await
            .expect("session finished")
            .expect("session task");
        assert_eq!(reason, LeaveReason::RemoteClosed);
        assert!(harness.broadcaster.registry().is_empty().await);
    }

    #[tokio::test]
    async fn quit_closes_transport_and_leaves_registry() {
        let harness = Harness::new();
        let (session, mut reader, mut writer) = harness.session();
        let id = session.id();
        let task = tokio::spawn(session.run());

        assert_eq!(next_line(&mut reader).await.as_deref(), Some(NAME_PROMPT));
        write_line(&mut writer, "carol").await.expect("send name");
        write_line(&mut writer, "/Quit").await.expect("send quit");

        let reason = task.await.expect("session task");
        assert_eq!(reason, LeaveReason::Quit);
        assert!(!harness.broadcaster.registry().contains(id).await);
        assert_eq!(next_line(&mut reader).await, None);
        let _ = writer.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_signal_ends_session() {
        let harness = Harness::new();
        let (session, mut reader, mut writer) = harness.session();
        let task = tokio::spawn(session.run());

        assert_eq!(next_line(&mut reader).await.as_deref(), Some(NAME_PROMPT));
        write_line(&mut writer, "dave").await.expect("send name");
        while harness.broadcaster.registry().is_empty().await {
            tokio::task::yield_now().await;
        }

        harness.shutdown.send(true).expect("signal shutdown");
        let reason = timeout(Duration::from_secs(1), task)
            .await
            .expect("session finished")
            .expect("session task");
        assert_eq!(reason, LeaveReason::Shutdown);
        assert!(harness.broadcaster.registry().is_empty().await);
    }

    #[tokio::test]
    async fn teardown_runs_once() {
        let harness = Harness::new();
        let (mut session, _reader, _writer) = harness.session();
        let (peer_outbound, mut peer_rx) = Outbound::channel();
        let peer = Connection::new(ConnectionId::next(), "peer", peer_outbound);
        harness.broadcaster.registry().add(peer).await;

        session.member = Some(Connection::new(session.id, "erin", session.outbound.clone()));
        harness
            .broadcaster
            .registry()
            .add(session.member.clone().expect("member"))
            .await;

        session.teardown(LeaveReason::ReadFailed).await;
        session.teardown(LeaveReason::ReadFailed).await;

        assert_eq!(peer_rx.try_recv().as_deref(), Ok("🔴 erin left the chat."));
        assert!(peer_rx.try_recv().is_err());
        assert_eq!(harness.broadcaster.registry().len().await, 1);
    }
}
