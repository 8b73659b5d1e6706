//! # Server
//!
//! Accepts inbound connections, runs the optional TLS and WebSocket
//! handshakes under one deadline, and hands each established connection to
//! a [`Session`] registered in the server's hub.
//!
//! `start` runs the accept loop until [`Server::stop`] is called. When the
//! loop ends the hub is shut down and the server's exit callbacks run.

use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{ServerConfig, TransportKind};
use crate::error::{ProtocolError, Result};
use crate::protocol::hub::Hub;
use crate::protocol::session::Session;
use crate::transport::tls::TlsServerConfig;
use crate::transport::{stream, websocket, Connection, PeerInfo};
use crate::utils::panic::guard;
use crate::utils::timeout::with_timeout_error;

/// Called once after the accept loop has ended and the hub has shut down.
pub type ExitCallback = Arc<dyn Fn() + Send + Sync>;

struct ServerInner {
    config: ServerConfig,
    hub: Hub,
    listener: TcpListener,
    local_addr: SocketAddr,
    tls: Option<TlsAcceptor>,
    shutdown: CancellationToken,
    exit_callbacks: RwLock<Vec<ExitCallback>>,
}

#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Validate `config`, load TLS material if configured and bind the
    /// listening socket.
    #[instrument(skip(config, hub), fields(address = %config.address))]
    pub async fn bind(config: ServerConfig, hub: Hub) -> Result<Server> {
        let errors = config.validate();
        if !errors.is_empty() {
            return Err(ProtocolError::ConfigError(errors.join("; ")));
        }

        let tls = match (&config.cert_path, &config.key_path) {
            (Some(cert), Some(key)) => Some(TlsServerConfig::new(cert, key).acceptor()?),
            _ => None,
        };

        let listener = TcpListener::bind(&config.address).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, transport = ?config.transport, tls = tls.is_some(), "Server bound");

        Ok(Server {
            inner: Arc::new(ServerInner {
                config,
                hub,
                listener,
                local_addr,
                tls,
                shutdown: CancellationToken::new(),
                exit_callbacks: RwLock::new(Vec::new()),
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn hub(&self) -> &Hub {
        &self.inner.hub
    }

    pub fn session_count(&self) -> usize {
        self.inner.hub.session_count()
    }

    /// Register a callback run after the server has fully stopped.
    pub fn on_close<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner
            .exit_callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(callback));
    }

    /// Stop accepting. The running `start` call then shuts the hub down.
    pub fn stop(&self) {
        info!(address = %self.inner.local_addr, "Server stop requested");
        self.inner.shutdown.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Run the accept loop until [`Server::stop`] is called.
    #[instrument(skip(self), fields(address = %self.inner.local_addr))]
    pub async fn start(&self) -> Result<()> {
        info!("Server accepting connections");

        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => {
                    info!("Shutting down server");
                    break;
                }

                accepted = self.inner.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let inner = self.inner.clone();
                        tokio::spawn(async move {
                            if let Err(e) = inner.establish(stream, addr).await {
                                warn!(peer = %addr, error = %e, "Handshake failed");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Error accepting connection");
                    }
                },
            }
        }

        self.inner.hub.exit().await;

        let callbacks = self
            .inner
            .exit_callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for callback in callbacks {
            let _ = guard("server exit callback", || callback());
        }

        info!("Server stopped");
        Ok(())
    }
}

impl ServerInner {
    async fn establish(&self, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %addr, error = %e, "Failed to set TCP_NODELAY");
        }

        let connection = with_timeout_error(self.upgrade(stream, addr), self.config.handshake_timeout).await?;
        let session = Session::spawn(&self.hub, connection);

        // stop() may have landed while the handshake was in flight.
        if self.shutdown.is_cancelled() {
            session.close();
        }
        Ok(())
    }

    async fn upgrade(&self, stream: TcpStream, addr: SocketAddr) -> Result<Connection> {
        match &self.tls {
            Some(acceptor) => {
                let tls_stream = acceptor
                    .accept(stream)
                    .await
                    .map_err(|e| ProtocolError::TlsError(format!("TLS handshake failed: {e}")))?;
                self.wrap(tls_stream, addr).await
            }
            None => self.wrap(stream, addr).await,
        }
    }

    async fn wrap<S>(&self, io: S, addr: SocketAddr) -> Result<Connection>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        match self.config.transport {
            TransportKind::WebSocket => {
                websocket::accept(io, Some(addr), self.hub.config().forwarded_by_client_ip).await
            }
            TransportKind::Tcp => Ok(stream::connection(io, PeerInfo::from_addr(addr))),
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.inner.local_addr)
            .field("transport", &self.inner.config.transport)
            .field("tls", &self.inner.tls.is_some())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
