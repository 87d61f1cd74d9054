use crate::types::{Error, SecurityInfo};
use async_trait::async_trait;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::ring::default_provider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::time;
use tokio_rustls::{client::TlsStream, TlsConnector};
use url::Url;

/// Read half of a session transport.
#[async_trait(?Send)]
pub trait TransportRead {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Write half of a session transport. `write` may accept fewer bytes than
/// offered; the session keeps the rest in flight.
#[async_trait(?Send)]
pub trait TransportWrite {
    async fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    async fn shutdown(&mut self) -> io::Result<()>;
}

#[async_trait(?Send)]
impl<T: AsyncRead + Unpin> TransportRead for T {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        AsyncReadExt::read(self, buf).await
    }
}

#[async_trait(?Send)]
impl<T: AsyncWrite + Unpin> TransportWrite for T {
    async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        AsyncWriteExt::write(self, buf).await
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        AsyncWriteExt::shutdown(self).await
    }
}

/// Accepts the handshake whatever the certificate, but remembers why the
/// chain failed so the session can refuse secure content over it.
#[derive(Debug)]
struct RecordingVerifier {
    inner: Arc<WebPkiServerVerifier>,
    error: Arc<Mutex<Option<String>>>,
}

impl ServerCertVerifier for RecordingVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if let Err(err) =
            self.inner
                .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            if let Ok(mut slot) = self.error.lock() {
                *slot = Some(err.to_string());
            }
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

pub enum TransportStream {
    Tcp(TcpStream),
    Tls(TlsStream<TcpStream>),
}

impl std::fmt::Debug for TransportStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportStream::Tcp(_) => f.write_str("TransportStream::Tcp"),
            TransportStream::Tls(_) => f.write_str("TransportStream::Tls"),
        }
    }
}

impl AsyncRead for TransportStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TransportStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            TransportStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TransportStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            TransportStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            TransportStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TransportStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            TransportStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TransportStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            TransportStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

const ALPN_H2: &[u8] = b"h2";

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Applies to the TCP connect and the TLS handshake separately.
    pub timeout: Option<Duration>,
    pub alpn_protocols: Vec<Vec<u8>>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(10)),
            alpn_protocols: vec![ALPN_H2.to_vec()],
        }
    }
}

fn host_and_port(url: &Url) -> Result<(&str, u16), Error> {
    let host = url
        .host_str()
        .ok_or_else(|| Error::InvalidState(format!("url has no host: {}", url)))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| Error::InvalidState(format!("url has no port: {}", url)))?;
    Ok((host, port))
}

/// `host:port` key a session for `url` is pooled and remembered under.
pub fn endpoint_for(url: &Url) -> Result<String, Error> {
    let (host, port) = host_and_port(url)?;
    Ok(format!("{}:{}", host, port))
}

fn server_name_from_str(name: &str) -> io::Result<ServerName<'static>> {
    ServerName::try_from(name.to_string()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("Invalid server name: {}", name),
        )
    })
}

fn build_tls_connector(alpn_protocols: &[Vec<u8>], error: Arc<Mutex<Option<String>>>) -> io::Result<TlsConnector> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let inner = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), Arc::new(default_provider()))
        .build()
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))?;

    let mut config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(RecordingVerifier { inner, error }))
        .with_no_client_auth();
    config.alpn_protocols = alpn_protocols.to_vec();

    Ok(TlsConnector::from(Arc::new(config)))
}

async fn with_timeout<F, T>(
    duration: Option<Duration>,
    future: F,
    timeout_message: &'static str,
) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    if let Some(duration) = duration {
        match time::timeout(duration, future).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, timeout_message)),
        }
    } else {
        future.await
    }
}

async fn connect_tcp(host: &str, port: u16, timeout: Option<Duration>) -> io::Result<TcpStream> {
    let stream = with_timeout(timeout, TcpStream::connect((host, port)), "TCP connection timed out").await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

pub async fn create_tcp_stream(
    host: &str,
    port: u16,
    timeout: Option<Duration>,
) -> io::Result<(TransportStream, SecurityInfo)> {
    let stream = connect_tcp(host, port, timeout).await?;
    Ok((TransportStream::Tcp(stream), SecurityInfo::insecure()))
}

pub async fn create_tls_stream(
    host: &str,
    port: u16,
    options: &ConnectOptions,
) -> io::Result<(TransportStream, SecurityInfo)> {
    // Ensure a crypto provider is installed (required for rustls >=0.23).
    let _ = default_provider().install_default();
    let tcp_stream = connect_tcp(host, port, options.timeout).await?;

    let certificate_error = Arc::new(Mutex::new(None));
    let connector = build_tls_connector(&options.alpn_protocols, Arc::clone(&certificate_error))?;
    let server_name = server_name_from_str(host)?;

    let tls_stream = with_timeout(
        options.timeout,
        connector.connect(server_name, tcp_stream),
        "TLS handshake timed out",
    )
    .await?;

    let security = SecurityInfo {
        is_secure: true,
        certificate_error: certificate_error.lock().ok().and_then(|slot| slot.clone()),
    };
    Ok((TransportStream::Tls(tls_stream), security))
}

/// Opens the byte stream a session for `url` runs over.
pub async fn connect(url: &Url, options: &ConnectOptions) -> Result<(TransportStream, SecurityInfo), Error> {
    let (host, port) = host_and_port(url)?;

    let connected = match url.scheme() {
        "http" | "ws" => create_tcp_stream(host, port, options.timeout).await,
        "https" | "wss" => create_tls_stream(host, port, options).await,
        scheme => {
            return Err(Error::InvalidState(format!("Unsupported scheme: {}", scheme)));
        }
    };
    Ok(connected?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_uses_default_ports() {
        let url = Url::parse("https://example.com/index.html").unwrap();
        assert_eq!(endpoint_for(&url).unwrap(), "example.com:443");
        let url = Url::parse("http://example.com:8080/").unwrap();
        assert_eq!(endpoint_for(&url).unwrap(), "example.com:8080");
    }

    #[tokio::test]
    async fn url_without_host_is_rejected_before_connecting() {
        let url = Url::parse("unix:/run/app.sock").unwrap();
        assert!(matches!(endpoint_for(&url), Err(Error::InvalidState(_))));
        let err = connect(&url, &ConnectOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test]
    async fn unsupported_scheme_is_rejected() {
        let url = Url::parse("ftp://example.com/").unwrap();
        let err = connect(&url, &ConnectOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test]
    async fn duplex_halves_implement_transport_traits() {
        let (client, mut server) = tokio::io::duplex(64);
        let (mut reader, mut writer) = tokio::io::split(client);

        assert_eq!(TransportWrite::write(&mut writer, b"ping").await.unwrap(), 4);
        let mut buf = [0u8; 4];
        AsyncReadExt::read_exact(&mut server, &mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        AsyncWriteExt::write_all(&mut server, b"pong").await.unwrap();
        let n = TransportRead::read(&mut reader, &mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pong");
    }
}
