//! TLS termination for client connections.

use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{self, AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::{server::TlsStream, TlsAcceptor};

#[derive(thiserror::Error, Debug)]
pub enum TlsError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("tls: {0}")]
    Tls(#[from] tokio_rustls::rustls::Error),
    #[error("{0}")]
    Pem(&'static str),
}

/// Server-side TLS built from PEM cert and key files.
#[derive(Clone, Debug)]
pub struct TlsTermination {
    config: Arc<ServerConfig>,
}

impl TlsTermination {
    pub async fn from_pem_files(
        cert: impl AsRef<Path>,
        key: impl AsRef<Path>,
    ) -> Result<Self, TlsError> {
        let cert_bytes = tokio::fs::read(cert).await?;
        let certs = rustls_pemfile::certs(&mut cert_bytes.as_slice())
            .collect::<Result<Vec<_>, _>>()?;
        if certs.is_empty() {
            return Err(TlsError::Pem("no certificates found in cert file"));
        }

        let key_bytes = tokio::fs::read(key).await?;
        let key = rustls_pemfile::private_key(&mut key_bytes.as_slice())?
            .ok_or(TlsError::Pem("no private key found in key file"))?;

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        Ok(Self {
            config: Arc::new(config),
        })
    }

    pub async fn accept<C>(&self, conn: C) -> Result<TlsStream<C>, TlsError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        Ok(TlsAcceptor::from(self.config.clone()).accept(conn).await?)
    }
}

/// A client connection, optionally upgraded to TLS after the SSLRequest
/// exchange.
pub enum Connection<C> {
    Plain(C),
    // Boxed for the size difference between the variants.
    Tls(Box<TlsStream<C>>),
}

impl<C> AsyncRead for Connection<C>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context,
        buf: &mut ReadBuf,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Plain(inner) => Pin::new(inner).poll_read(cx, buf),
            Connection::Tls(inner) => Pin::new(inner).poll_read(cx, buf),
        }
    }
}

impl<C> AsyncWrite for Connection<C>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Connection::Plain(inner) => Pin::new(inner).poll_write(cx, buf),
            Connection::Tls(inner) => Pin::new(inner).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Plain(inner) => Pin::new(inner).poll_flush(cx),
            Connection::Tls(inner) => Pin::new(inner).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Plain(inner) => Pin::new(inner).poll_shutdown(cx),
            Connection::Tls(inner) => Pin::new(inner).poll_shutdown(cx),
        }
    }
}
