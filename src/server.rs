//! Request/response serving on top of sessions.
//!
//! Every accepted stream carries one request, terminated by the client's
//! CLOSE. The request is read to end-of-stream, handed to the [`Handler`],
//! and the handler's output goes back with a single
//! [`Stream::write_once`].

use crate::{
    config::Config,
    error::{Result, SmuxError},
    net::Listener,
    session::Session,
    stream::Stream,
};
use async_trait::async_trait;
use futures::FutureExt;
use std::{panic::AssertUnwindSafe, sync::Arc, time::Duration};
use tokio::{io::AsyncReadExt, net::ToSocketAddrs};

/// Pause after a failed accept before trying again.
pub const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Produces one response per request.
///
/// Plain functions and closures of type `Fn(&[u8], &mut Vec<u8>)` are
/// handlers; implement the trait directly for handlers that need to await.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn serve(&self, request: &[u8], response: &mut Vec<u8>);
}

#[async_trait]
impl<F> Handler for F
where
    F: Fn(&[u8], &mut Vec<u8>) + Send + Sync + 'static,
{
    async fn serve(&self, request: &[u8], response: &mut Vec<u8>) {
        self(request, response)
    }
}

/// TCP request/response server running one [`Handler`].
pub struct Server<H> {
    handler: Arc<H>,
    config: Config,
}

impl<H: Handler> Server<H> {
    pub fn new(handler: H) -> Self {
        Self::with_config(handler, Config::default())
    }

    pub fn with_config(handler: H, config: Config) -> Self {
        Self::from_arc_with_config(Arc::new(handler), config)
    }

    /// Serves with a handler the caller keeps a handle to.
    pub fn from_arc(handler: Arc<H>) -> Self {
        Self::from_arc_with_config(handler, Config::default())
    }

    pub fn from_arc_with_config(handler: Arc<H>, config: Config) -> Self {
        Self { handler, config }
    }

    /// Binds `addr` and serves until the listener fails to bind.
    pub async fn listen_and_serve<A: ToSocketAddrs>(&self, addr: A) -> Result<()> {
        let listener = Listener::bind(addr, self.config.clone()).await?;
        self.serve(&listener).await
    }

    /// Accept loop. Returns once the listener is closed; other accept errors
    /// are logged and the loop continues after [`ACCEPT_BACKOFF`].
    pub async fn serve(&self, listener: &Listener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok(session) => {
                    tokio::spawn(serve_session(session, Arc::clone(&self.handler)));
                }
                Err(SmuxError::ListenerClosed) => {
                    tracing::debug!("listener closed, stopping accept loop");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!("accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }
}

/// Per-connection worker: one task per accepted stream until the session
/// closes.
pub async fn serve_session<H: Handler>(session: Session, handler: Arc<H>) {
    loop {
        match session.accept_stream().await {
            Ok(stream) => {
                tokio::spawn(serve_stream(stream, Arc::clone(&handler)));
            }
            Err(e) => {
                tracing::debug!("session ended: {}", e);
                break;
            }
        }
    }
    session.close();
}

/// Per-stream worker: read the full request, run the handler, reply once.
pub async fn serve_stream<H: Handler>(mut stream: Stream, handler: Arc<H>) {
    let stream_id = stream.stream_id();

    let mut request = Vec::new();
    if let Err(e) = stream.read_to_end(&mut request).await {
        tracing::debug!("stream {}: reading request failed: {}", stream_id, e);
        let _ = stream.close().await;
        return;
    }

    let mut response = Vec::new();
    let outcome = AssertUnwindSafe(handler.serve(&request, &mut response))
        .catch_unwind()
        .await;

    match outcome {
        Ok(()) => {
            if let Err(e) = stream.write_once(&response).await {
                tracing::debug!("stream {}: writing response failed: {}", stream_id, e);
            }
        }
        Err(_) => tracing::error!("stream {}: handler panicked", stream_id),
    }

    let _ = stream.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpStream,
    };

    fn upper(request: &[u8], response: &mut Vec<u8>) {
        response.extend(request.iter().map(u8::to_ascii_uppercase));
    }

    #[tokio::test]
    async fn test_serve_stream_over_duplex() {
        let (client_transport, server_transport) = tokio::io::duplex(4096);
        let client = Session::client(client_transport, Config::default())
            .await
            .unwrap();
        let server = Session::server(server_transport, Config::default())
            .await
            .unwrap();
        tokio::spawn(serve_session(server, Arc::new(upper)));

        let mut stream = client.open_stream().await.unwrap();
        stream.write_once(b"hello").await.unwrap();

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"HELLO");
    }

    #[tokio::test]
    async fn test_handler_sees_request_only_after_close() {
        let (client_transport, server_transport) = tokio::io::duplex(4096);
        let client = Session::client(client_transport, Config::default())
            .await
            .unwrap();
        let server = Session::server(server_transport, Config::default())
            .await
            .unwrap();
        let len = |request: &[u8], response: &mut Vec<u8>| {
            response.extend_from_slice(request.len().to_string().as_bytes());
        };
        tokio::spawn(serve_session(server, Arc::new(len)));

        let mut stream = client.open_stream().await.unwrap();
        stream.write_all(b"abc").await.unwrap();
        stream.write_all(b"defg").await.unwrap();
        stream.shutdown().await.unwrap();

        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert_eq!(response, "7");
    }

    struct Panicking;

    #[async_trait]
    impl Handler for Panicking {
        async fn serve(&self, _request: &[u8], _response: &mut Vec<u8>) {
            panic!("handler failure");
        }
    }

    #[tokio::test]
    async fn test_panicking_handler_still_ends_stream() {
        let (client_transport, server_transport) = tokio::io::duplex(4096);
        let client = Session::client(client_transport, Config::default())
            .await
            .unwrap();
        let server = Session::server(server_transport, Config::default())
            .await
            .unwrap();
        tokio::spawn(serve_session(server, Arc::new(Panicking)));

        let mut stream = client.open_stream().await.unwrap();
        stream.write_once(b"boom").await.unwrap();

        let mut response = Vec::new();
        let read = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            stream.read_to_end(&mut response),
        )
        .await
        .unwrap();
        assert_eq!(read.unwrap(), 0);
        assert!(response.is_empty());
    }

    #[tokio::test]
    async fn test_failed_accepts_back_off() {
        // Sessions cannot be created with this config, so every accept fails.
        let config = Config {
            max_frame_size: 0,
            ..Default::default()
        };
        let listener = Arc::new(Listener::bind_unchecked("127.0.0.1:0", config).await.unwrap());
        let addr = listener.local_addr().unwrap();

        let mut first = TcpStream::connect(addr).await.unwrap();
        let mut second = TcpStream::connect(addr).await.unwrap();

        let server = Server::new(upper);
        let serving = tokio::spawn({
            let listener = Arc::clone(&listener);
            async move { server.serve(&listener).await }
        });

        // The server drops each socket when session setup fails.
        let mut buf = [0u8; 1];
        assert_eq!(first.read(&mut buf).await.unwrap_or(0), 0);
        let first_closed = Instant::now();
        assert_eq!(second.read(&mut buf).await.unwrap_or(0), 0);
        assert!(first_closed.elapsed() >= ACCEPT_BACKOFF - Duration::from_millis(10));

        listener.close();
        serving.await.unwrap().unwrap();
    }
}
