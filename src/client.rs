use crate::{
    config::Config,
    error::Result,
    net::dial,
    session::Session,
};
use tokio::{io::AsyncReadExt, net::ToSocketAddrs};

/// Request/response client: each [`Client::post`] runs on its own stream of
/// one shared session.
#[derive(Debug)]
pub struct Client {
    session: Session,
}

impl Client {
    /// Dials `addr` and wraps the client session.
    pub async fn connect<A: ToSocketAddrs>(addr: A, config: Config) -> Result<Self> {
        Ok(Self::from_session(dial(addr, config).await?))
    }

    /// Uses an existing client-role session. The session closes when the
    /// `Client` is dropped.
    pub fn from_session(session: Session) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Sends `request` on a new stream and returns everything the server
    /// writes back before its CLOSE.
    pub async fn post(&self, request: &[u8]) -> Result<Vec<u8>> {
        let mut stream = self.session.open_stream().await?;
        stream.write_once(request).await?;

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await?;
        stream.close().await?;
        Ok(response)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.session.close();
    }
}
