//! # Server Accept Loop
//!
//! Accepts sockets, runs the responder handshake for each on its own task and
//! keeps at most one live [`Connection`] per user in a [`SessionTable`]. A user
//! that authenticates again evicts its previous session: the old connection is
//! sent [`LOG_OUT`] and closed before the new one is published.

use crate::config::{NetworkConfig, TransportConfig};
use crate::error::{ProtocolError, Result};
use crate::identity::Accounts;
use crate::protocol::handshake::{self, HandshakeOutcome};
use crate::protocol::magic::LOG_OUT;
use crate::service::connection::Connection;
use crate::utils::timeout::with_timeout_error;
use futures::future::{BoxFuture, FutureExt};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

/// Application logic run for every established connection.
pub type Handler = Arc<dyn Fn(Arc<Connection>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Wrap an async closure as a [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Arc<Connection>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |connection| f(connection).boxed())
}

/// How a stale session took its log-out notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Eviction {
    Notified,
    Unresponsive,
    Failed,
}

/// The live connection of every authenticated user.
#[derive(Debug)]
pub struct SessionTable {
    sessions: Mutex<HashMap<String, Arc<Connection>>>,
    eviction_timeout: Duration,
}

impl SessionTable {
    pub fn new(eviction_timeout: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            eviction_timeout,
        }
    }

    /// Publish `connection` as its user's live session. Any previous session is
    /// evicted while the table stays locked, so no reader ever sees two.
    pub async fn register(&self, connection: Arc<Connection>) {
        let name = connection.user().name().to_owned();
        let mut sessions = self.sessions.lock().await;
        if let Some(previous) = sessions.remove(&name) {
            info!(user = %name, "Evicting previous session");
            let eviction = self.evict(&previous).await;
            debug!(user = %name, ?eviction, "Previous session evicted");
        }
        sessions.insert(name, connection);
    }

    async fn evict(&self, stale: &Arc<Connection>) -> Eviction {
        let limit = self.eviction_timeout;
        let notice = with_timeout_error(
            stale.blocked_with_timeout(
                limit,
                |c| async move { c.write_int(LOG_OUT).await.map(|()| Eviction::Notified) },
                |c| async move {
                    debug!(user = %c.user().name(), "Stale session did not take its log-out notice");
                    Ok(Eviction::Unresponsive)
                },
            ),
            // The inner bound starts only once the block guard is held.
            limit.saturating_mul(2),
        )
        .await
        .unwrap_or_else(|e| {
            debug!(error = %e, "Could not deliver log-out notice");
            Eviction::Failed
        });
        if let Err(e) = stale.close().await {
            warn!(error = %e, "Error closing evicted session");
        }
        notice
    }

    /// Remove `name`'s entry if it is still `connection`. Returns whether it was.
    pub async fn remove_if_same(&self, name: &str, connection: &Arc<Connection>) -> bool {
        let mut sessions = self.sessions.lock().await;
        match sessions.get(name) {
            Some(current) if Arc::ptr_eq(current, connection) => {
                sessions.remove(name);
                true
            }
            _ => false,
        }
    }

    pub async fn get(&self, name: &str) -> Option<Arc<Connection>> {
        self.sessions.lock().await.get(name).cloned()
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Close and forget every session.
    pub async fn close_all(&self) {
        let drained: Vec<_> = self.sessions.lock().await.drain().collect();
        for (name, connection) in drained {
            if let Err(e) = connection.close().await {
                warn!(user = %name, error = %e, "Error closing session during shutdown");
            }
        }
    }
}

/// Everything a worker task needs, cloned per accepted socket.
#[derive(Clone)]
struct Worker {
    accounts: Arc<Accounts>,
    sessions: Arc<SessionTable>,
    transport: TransportConfig,
    handshake_timeout: Duration,
    handler: Handler,
}

impl Worker {
    async fn serve(self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer, error = %e, "Could not disable Nagle");
        }
        let (reader, writer) = stream.into_split();
        let outcome = with_timeout_error(
            handshake::accept(Box::new(reader), Box::new(writer), &self.accounts, &self.transport),
            self.handshake_timeout,
        )
        .await;

        let connection = match outcome {
            Ok(HandshakeOutcome::Accepted(connection)) => Arc::new(connection),
            Ok(HandshakeOutcome::Refused(reason)) => {
                info!(%peer, %reason, "Handshake refused");
                return;
            }
            Err(e) => {
                warn!(%peer, error = %e, "Handshake failed");
                return;
            }
        };

        let name = connection.user().name().to_owned();
        self.sessions.register(Arc::clone(&connection)).await;
        debug!(%peer, user = %name, "Session registered");

        match (self.handler)(Arc::clone(&connection)).await {
            Ok(()) => debug!(user = %name, "Handler finished"),
            Err(ProtocolError::LoggedOut) => info!(user = %name, "Session logged out"),
            Err(e) if connection.is_closed() => debug!(user = %name, error = %e, "Handler ended on closed connection"),
            Err(e) => warn!(user = %name, error = %e, "Handler failed"),
        }

        self.sessions.remove_if_same(&name, &connection).await;
        if let Err(e) = connection.close().await {
            debug!(user = %name, error = %e, "Error closing connection");
        }
    }
}

/// Accepts connections and enforces one live session per user.
pub struct Server {
    config: NetworkConfig,
    accounts: Arc<Accounts>,
    sessions: Arc<SessionTable>,
}

impl Server {
    pub fn new(config: NetworkConfig, accounts: Arc<Accounts>) -> Self {
        let sessions = Arc::new(SessionTable::new(config.server.eviction_timeout));
        Self {
            config,
            accounts,
            sessions,
        }
    }

    pub fn accounts(&self) -> &Arc<Accounts> {
        &self.accounts
    }

    pub fn sessions(&self) -> &Arc<SessionTable> {
        &self.sessions
    }

    /// Bind the configured server address.
    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(&self.config.server.address).await?;
        info!(address = %self.config.server.address, "Listening");
        Ok(listener)
    }

    /// Serve `listener` until `shutdown` fires (or its sender is dropped), or
    /// accepting fails.
    ///
    /// Never returns `Ok`: on shutdown every worker is aborted, every session is
    /// closed and [`ProtocolError::Interrupted`] is returned; an accept failure is
    /// returned after the same cleanup.
    #[instrument(skip_all, fields(address = ?listener.local_addr().ok()))]
    pub async fn run(
        &self,
        listener: TcpListener,
        mut shutdown: mpsc::Receiver<()>,
        handler: Handler,
    ) -> Result<()> {
        let worker = Worker {
            accounts: Arc::clone(&self.accounts),
            sessions: Arc::clone(&self.sessions),
            transport: self.config.transport.clone(),
            handshake_timeout: self.config.server.handshake_timeout,
            handler,
        };
        let poll = self.config.server.accept_poll_interval;
        let max_connections = self.config.server.max_connections;
        let mut workers = JoinSet::new();

        let cause = loop {
            tokio::select! {
                biased;

                // A dropped sender counts as a shutdown request
                _ = shutdown.recv() => break ProtocolError::Interrupted,

                Some(finished) = workers.join_next(), if !workers.is_empty() => {
                    if let Err(e) = finished {
                        if e.is_panic() {
                            error!(error = %e, "Worker panicked");
                        }
                    }
                }

                accepted = tokio::time::timeout(poll, listener.accept()) => match accepted {
                    Err(_) => continue,
                    Ok(Err(e)) => {
                        error!(error = %e, "Error accepting connection");
                        break ProtocolError::Io(e);
                    }
                    Ok(Ok((stream, peer))) => {
                        if workers.len() >= max_connections {
                            warn!(%peer, limit = max_connections, "Connection limit reached, dropping socket");
                            drop(stream);
                            continue;
                        }
                        debug!(%peer, "Accepted connection");
                        workers.spawn(worker.clone().serve(stream, peer));
                    }
                },
            }
        };

        info!(reason = %cause, workers = workers.len(), "Shutting down server");
        workers.shutdown().await;
        self.sessions.close_all().await;
        Err(cause)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::core::wire::{FrameReader, FrameWriter};
    use crate::identity::User;
    use crate::transport::{BoxReader, BoxWriter};
    use tokio::io::AsyncReadExt;

    fn session(name: &str) -> (Arc<Connection>, tokio::io::DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(256);
        let (r, w) = tokio::io::split(ours);
        let reader: BoxReader = Box::new(r);
        let writer: BoxWriter = Box::new(w);
        let connection = Connection::socket(
            FrameReader::new(reader),
            FrameWriter::new(writer),
            Arc::new(User::new(name, "pw")),
            0,
        );
        (Arc::new(connection), theirs)
    }

    #[tokio::test]
    async fn test_register_evicts_previous_session() {
        let table = SessionTable::new(Duration::from_millis(200));
        let (first, mut first_peer) = session("ann");
        let (second, _second_peer) = session("ann");

        table.register(Arc::clone(&first)).await;
        table.register(Arc::clone(&second)).await;

        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert!(Arc::ptr_eq(&table.get("ann").await.unwrap(), &second));

        let mut notice = [0u8; 4];
        first_peer.read_exact(&mut notice).await.unwrap();
        assert_eq!(i32::from_le_bytes(notice), LOG_OUT);
    }

    #[tokio::test]
    async fn test_evict_runs_fallback_when_notice_stalls() {
        let table = SessionTable::new(Duration::from_millis(50));
        let (stale, _peer) = session("ann");
        // Fill the pipe so the log-out notice cannot be written.
        stale.write_arr(&[0u8; 256]).await.unwrap();

        assert_eq!(table.evict(&stale).await, Eviction::Unresponsive);
        assert!(stale.is_closed());
    }

    #[tokio::test]
    async fn test_evict_reports_delivered_notice() {
        let table = SessionTable::new(Duration::from_millis(200));
        let (stale, mut peer) = session("ann");

        assert_eq!(table.evict(&stale).await, Eviction::Notified);
        let mut notice = [0u8; 4];
        peer.read_exact(&mut notice).await.unwrap();
        assert_eq!(i32::from_le_bytes(notice), LOG_OUT);
    }

    #[tokio::test]
    async fn test_remove_if_same_keeps_newer_session() {
        let table = SessionTable::new(Duration::from_millis(200));
        let (first, _p1) = session("ann");
        let (second, _p2) = session("ann");

        table.register(Arc::clone(&first)).await;
        table.register(Arc::clone(&second)).await;

        assert!(!table.remove_if_same("ann", &first).await);
        assert_eq!(table.len().await, 1);
        assert!(table.remove_if_same("ann", &second).await);
        assert!(table.is_empty().await);
    }

    #[tokio::test]
    async fn test_close_all() {
        let table = SessionTable::new(Duration::from_millis(200));
        let (ann, _p1) = session("ann");
        let (bob, _p2) = session("bob");
        table.register(Arc::clone(&ann)).await;
        table.register(Arc::clone(&bob)).await;

        table.close_all().await;
        assert!(ann.is_closed() && bob.is_closed());
        assert!(table.is_empty().await);
    }
}
