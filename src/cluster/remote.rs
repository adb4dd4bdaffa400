//! Coordination over TCP.
//!
//! `CoordinationServer` serves an `InMemoryCoordinator` to other processes;
//! `RemoteCoordinator` is the client side used when
//! `cluster_manager_addresses` is configured. Every request is one frame and
//! every reply is one `Result<CoordResponse, CoordError>` frame.

use crate::cluster::coordinator::{CoordError, CoordRequest, CoordResponse, Coordinator, InMemoryCoordinator};
use crate::cluster::wire::{self, Connection};
use futures::future::BoxFuture;
use std::io::Result as IoResult;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct CoordinationServer {
    listener: TcpListener,
    store: InMemoryCoordinator,
}

impl CoordinationServer {
    pub async fn bind(addr: &str, store: InMemoryCoordinator) -> IoResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(CoordinationServer { listener, store })
    }

    pub fn local_addr(&self) -> IoResult<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn store(&self) -> &InMemoryCoordinator {
        &self.store
    }

    pub async fn serve(self, cancel: CancellationToken) {
        if let Ok(addr) = self.listener.local_addr() {
            info!(%addr, "coordination service listening");
        }
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let store = self.store.clone();
                        let cancel = cancel.clone();
                        tokio::spawn(async move {
                            if let Err(e) = Self::handle_connection(stream, store, cancel).await {
                                debug!(%peer, error = %e, "coordination connection closed");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "coordination accept failed"),
                }
            }
        }
        info!("coordination service stopped");
    }

    async fn handle_connection(
        stream: TcpStream,
        store: InMemoryCoordinator,
        cancel: CancellationToken,
    ) -> IoResult<()> {
        stream.set_nodelay(true)?;
        let mut conn = wire::framed(stream);
        loop {
            let request = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                request = wire::recv::<CoordRequest>(&mut conn) => request?,
            };
            let Some(request) = request else {
                return Ok(());
            };
            let reply: Result<CoordResponse, CoordError> = store.apply(request);
            wire::send(&mut conn, &reply).await?;
        }
    }
}

/// Client for a `CoordinationServer`, trying each configured address in
/// turn and keeping one connection open.
pub struct RemoteCoordinator {
    addresses: Vec<String>,
    timeout: Duration,
    conn: tokio::sync::Mutex<Option<Connection>>,
}

impl std::fmt::Debug for RemoteCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteCoordinator")
            .field("addresses", &self.addresses)
            .finish()
    }
}

impl RemoteCoordinator {
    pub fn new(addresses: Vec<String>, timeout: Duration) -> Self {
        RemoteCoordinator {
            addresses,
            timeout,
            conn: tokio::sync::Mutex::new(None),
        }
    }

    async fn connect_any(&self) -> Result<Connection, CoordError> {
        let mut last_error = "no coordination addresses configured".to_string();
        for addr in &self.addresses {
            match wire::connect(addr, self.timeout).await {
                Ok(conn) => return Ok(conn),
                Err(e) => last_error = format!("{}: {}", addr, e),
            }
        }
        Err(CoordError::Unavailable(last_error))
    }

    async fn roundtrip(&self, request: CoordRequest) -> Result<CoordResponse, CoordError> {
        let mut guard = self.conn.lock().await;
        let mut conn = match guard.take() {
            Some(conn) => conn,
            None => self.connect_any().await?,
        };
        match wire::call::<_, Result<CoordResponse, CoordError>>(&mut conn, &request, self.timeout).await {
            Ok(reply) => {
                *guard = Some(conn);
                reply
            }
            // Connection dropped; the caller's retry reconnects.
            Err(e) => Err(CoordError::Unavailable(e.to_string())),
        }
    }
}

impl Coordinator for RemoteCoordinator {
    fn execute(&self, request: CoordRequest) -> BoxFuture<'_, Result<CoordResponse, CoordError>> {
        Box::pin(self.roundtrip(request))
    }
}
