use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use tokio::{
    io::BufReader,
    net::{TcpListener, TcpStream},
    select,
    sync::watch,
};
use tracing::{info, warn};

use crate::{
    broadcast::Broadcaster, message::SHUTDOWN_NOTICE, registry::Registry, session::Session,
};

/// Accept loop. Every accepted socket gets its own session task, so a slow
/// handshake never holds up the next `accept`.
pub struct Server {
    listener: TcpListener,
    broadcaster: Broadcaster,
}

impl Server {
    pub fn new(listener: TcpListener) -> Self {
        Self {
            listener,
            broadcaster: Broadcaster::new(Arc::new(Registry::new())),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(self.broadcaster.registry())
    }

    /// Accepts connections until `shutdown` resolves.
    ///
    /// An accept error is fatal and ends the loop with that error.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            listener,
            broadcaster,
        } = self;
        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::pin!(shutdown);

        let result = loop {
            select! {
                _ = &mut shutdown => break Ok(()),
                accept_result = listener.accept() => {
                    match accept_result.context("failed to accept connection") {
                        Ok((stream, peer)) => {
                            spawn_session(stream, peer, &broadcaster, stop_rx.clone());
                        }
                        Err(err) => break Err(err),
                    }
                }
            }
        };

        handle_shutdown(&broadcaster, &stop_tx).await;
        result
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

async fn handle_shutdown(broadcaster: &Broadcaster, stop_tx: &watch::Sender<bool>) {
    info!("server shutting down");
    broadcaster.announce(SHUTDOWN_NOTICE).await;
    // No receivers left just means no session is running.
    let _ = stop_tx.send(true);
}

fn spawn_session(
    stream: TcpStream,
    peer: SocketAddr,
    broadcaster: &Broadcaster,
    shutdown: watch::Receiver<bool>,
) {
    let (reader, writer) = stream.into_split();
    let session = Session::new(
        BufReader::new(reader),
        writer,
        broadcaster.clone(),
        shutdown,
    );
    info!(conn = %session.id(), peer = %peer, "client connected");

    tokio::spawn(async move {
        let id = session.id();
        let reason = session.run().await;
        info!(conn = %id, peer = %peer, %reason, "session closed");
    });
}
