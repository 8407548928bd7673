//! TCP entry points: a listener that yields server sessions and a dialer
//! that yields client sessions.

use crate::{
    config::Config,
    error::{Result, SmuxError},
    session::Session,
};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio_util::sync::CancellationToken;

/// Accepts TCP connections and wraps each in a server-role [`Session`].
#[derive(Debug)]
pub struct Listener {
    inner: TcpListener,
    config: Config,
    shutdown: CancellationToken,
}

impl Listener {
    /// Binds a TCP listener whose sessions use `config`.
    pub async fn bind<A: ToSocketAddrs>(addr: A, config: Config) -> Result<Self> {
        config.validate()?;
        Self::bind_unchecked(addr, config).await
    }

    pub(crate) async fn bind_unchecked<A: ToSocketAddrs>(addr: A, config: Config) -> Result<Self> {
        let inner = TcpListener::bind(addr).await?;
        tracing::debug!("listening on {:?}", inner.local_addr().ok());
        Ok(Self {
            inner,
            config,
            shutdown: CancellationToken::new(),
        })
    }

    /// Waits for the next connection. A failed accept fails only this call;
    /// after [`Listener::close`] every call fails with `ListenerClosed`.
    pub async fn accept(&self) -> Result<Session> {
        let (socket, peer) = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Err(SmuxError::ListenerClosed),
            accepted = self.inner.accept() => accepted?,
        };

        socket.set_nodelay(true)?;
        tracing::debug!("accepted connection from {}", peer);
        Session::server(socket, self.config.clone()).await
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.local_addr()?)
    }

    /// Makes pending and future `accept` calls fail with `ListenerClosed`.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// Connects to `addr` and starts a client-role [`Session`] over the socket.
pub async fn dial<A: ToSocketAddrs>(addr: A, config: Config) -> Result<Session> {
    let socket = TcpStream::connect(addr).await?;
    socket.set_nodelay(true)?;
    Session::client(socket, config).await
}
