//! TLS listeners and the accept loop.

use super::audit::{AuditSink, AuditedDispatcher};
use super::connection::serve_connection;
use super::dispatch::{Dispatcher, Handler};
use super::tls::CertificateContext;
use super::ChannelError;
use crate::config::ServerSettings;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// The command channel server: one listener per configured protocol generation.
pub struct ChannelServer {
    settings: ServerSettings,
    dispatcher: AuditedDispatcher,
}

impl ChannelServer {
    pub fn new(settings: ServerSettings, sink: Arc<dyn AuditSink>) -> Self {
        Self {
            settings,
            dispatcher: AuditedDispatcher::new(Dispatcher::new(), sink),
        }
    }

    /// Route `command` to `handler`, replacing any previous handler.
    pub fn register_handler(&mut self, command: impl Into<String>, handler: impl Handler + 'static) {
        self.dispatcher.register_handler(command, handler);
    }

    /// Open a TLS listening socket for one certificate context.
    pub async fn listen(
        bind_address: &str,
        port: u16,
        context: Arc<CertificateContext>,
        backlog: u32,
    ) -> Result<Listener, ChannelError> {
        let ip: IpAddr = bind_address
            .parse()
            .map_err(|_| ChannelError::InvalidAddress(bind_address.to_string()))?;
        let address = SocketAddr::new(ip, port);
        let bind_error = |source: std::io::Error| ChannelError::Bind {
            address: address.to_string(),
            source,
        };

        let socket = if address.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(bind_error)?;
        socket.set_reuseaddr(true).map_err(bind_error)?;
        socket.bind(address).map_err(bind_error)?;
        let tcp = socket.listen(backlog).map_err(bind_error)?;

        let acceptor = context.acceptor().await?;
        let listener = Listener {
            tcp,
            acceptor,
            context,
        };
        info!(
            "generation {} listening on {}",
            listener.context.generation().index(),
            listener.local_addr().unwrap_or(address)
        );
        Ok(listener)
    }

    /// Build both certificate contexts, bind every listener and serve until
    /// one of them fails.
    pub async fn run(self) -> Result<(), ChannelError> {
        let mut listeners = Vec::new();
        for listener in &self.settings.listeners {
            let context = Arc::new(CertificateContext::for_listener(
                &self.settings,
                listener.generation,
            )?);
            listeners.push(
                Self::listen(
                    &listener.address,
                    self.settings.port,
                    context,
                    self.settings.backlog,
                )
                .await?,
            );
        }

        let idle_timeout = self.settings.idle_timeout();
        let dispatcher = self.into_dispatcher();
        let connections = Arc::new(AtomicUsize::new(0));

        let serving = listeners.into_iter().map(|listener| {
            listener.serve(
                Arc::clone(&dispatcher),
                idle_timeout,
                Arc::clone(&connections),
            )
        });
        futures::future::try_join_all(serving).await?;
        Ok(())
    }

    /// Split into the dispatcher, for serving listeners opened separately.
    pub fn into_dispatcher(self) -> Arc<AuditedDispatcher> {
        Arc::new(self.dispatcher)
    }
}

/// A bound TLS listener.
pub struct Listener {
    tcp: TcpListener,
    acceptor: TlsAcceptor,
    context: Arc<CertificateContext>,
}

impl Listener {
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.tcp.local_addr()
    }

    /// Accept connections forever, one task per connection. The TLS handshake
    /// and each wait for a request are bounded by `idle_timeout`.
    pub async fn serve(
        self,
        dispatcher: Arc<AuditedDispatcher>,
        idle_timeout: Duration,
        connections: Arc<AtomicUsize>,
    ) -> Result<(), ChannelError> {
        let generation = self.context.generation().index();
        loop {
            let (stream, peer) = match self.tcp.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("failed to accept connection: {}", e);
                    continue;
                }
            };

            let acceptor = self.acceptor.clone();
            let dispatcher = Arc::clone(&dispatcher);
            let guard = ConnectionGuard::new(Arc::clone(&connections), peer);

            tokio::spawn(async move {
                let tls = match tokio::time::timeout(idle_timeout, acceptor.accept(stream)).await {
                    Ok(Ok(tls)) => tls,
                    Ok(Err(e)) => {
                        warn!("TLS handshake with {} failed: {}", peer, e);
                        return;
                    }
                    Err(_) => {
                        warn!("TLS handshake with {} timed out after {:?}", peer, idle_timeout);
                        return;
                    }
                };
                debug!("{} connected on generation {}", peer, generation);
                let label = peer.to_string();
                if let Err(e) = serve_connection(tls, &dispatcher, idle_timeout, &label).await {
                    warn!("closing connection to {}: {}", peer, e);
                }
                drop(guard);
            });
        }
    }
}

/// Counts a live connection until dropped.
struct ConnectionGuard {
    connections: Arc<AtomicUsize>,
    peer: SocketAddr,
}

impl ConnectionGuard {
    fn new(connections: Arc<AtomicUsize>, peer: SocketAddr) -> Self {
        let live = connections.fetch_add(1, Ordering::SeqCst) + 1;
        info!("connection from {} ({} live)", peer, live);
        Self { connections, peer }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let live = self.connections.fetch_sub(1, Ordering::SeqCst) - 1;
        info!("{} disconnected ({} live)", self.peer, live);
    }
}
