//! Dialing replicas.
//!
//! The pool only needs a byte stream per channel.  [`TcpConnector`] is the
//! plain TCP default; TLS or proxying is layered in by supplying another
//! [`Connector`].

use {
    crate::{
        address::PhysicalAddress,
        error::{Result, TransportError},
    },
    async_trait::async_trait,
    log::debug,
    std::{io, time::Duration},
    tokio::{
        io::{AsyncRead, AsyncWrite},
        net::TcpStream,
    },
};

/// A bidirectional byte stream a channel can run over.
pub trait ChannelStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> ChannelStream for T {}

pub type BoxedStream = Box<dyn ChannelStream>;

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, address: &PhysicalAddress) -> Result<BoxedStream>;
}

/// Plain TCP with `TCP_NODELAY` and a connect timeout.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, address: &PhysicalAddress) -> Result<BoxedStream> {
        let connect_error = |source: io::Error| TransportError::Connect {
            address: address.to_string(),
            source,
        };
        let stream = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect(address.authority()),
        )
        .await
        .map_err(|_| {
            connect_error(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect timed out after {:?}", self.connect_timeout),
            ))
        })?
        .map_err(connect_error)?;
        stream.set_nodelay(true).map_err(connect_error)?;
        debug!("connected to {} from {:?}", address, stream.local_addr().ok());
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use {super::*, tokio::net::TcpListener};

    #[tokio::test]
    async fn test_tcp_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let address = PhysicalAddress::parse(&format!("rntbd://127.0.0.1:{port}/r/")).unwrap();
        let connector = TcpConnector::new(Duration::from_secs(1));
        let (connected, accepted) = tokio::join!(connector.connect(&address), listener.accept());
        assert!(connected.is_ok());
        assert!(accepted.is_ok());
    }

    #[tokio::test]
    async fn test_tcp_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let address = PhysicalAddress::parse(&format!("rntbd://127.0.0.1:{port}/r/")).unwrap();
        let result = TcpConnector::new(Duration::from_secs(1)).connect(&address).await;
        assert!(matches!(result, Err(TransportError::Connect { .. })));
    }
}
