//! Connection plumbing shared by both halves of the bouncer: the stream
//! enum over TCP/TLS/Unix transports, upstream dialing, and the writer
//! task that serializes a connection's outbound queue to the wire.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context as _};
use futures_util::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::{TcpSocket, TcpStream};
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::warn;

use slbnc_proto::{IrcCodec, Message};

use crate::db;

/// A connected transport.
pub enum Stream {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Stream::Tls(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Stream::Tls(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_flush(cx),
            Stream::Tls(s) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Stream::Tls(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

pub type Reader = FramedRead<ReadHalf<Stream>, IrcCodec>;
pub type Writer = FramedWrite<WriteHalf<Stream>, IrcCodec>;

/// Split a stream into framed halves sized for tagged connections.
pub fn split(stream: Stream) -> (Reader, Writer) {
    let (r, w) = tokio::io::split(stream);
    (
        FramedRead::new(r, IrcCodec::with_tags()),
        FramedWrite::new(w, IrcCodec::with_tags()),
    )
}

/// Enable TCP keepalive; best effort.
pub fn set_keepalive(stream: &TcpStream) {
    use socket2::{SockRef, TcpKeepalive};
    let sock = SockRef::from(stream);
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(120))
        .with_interval(Duration::from_secs(30));
    if let Err(e) = sock.set_tcp_keepalive(&keepalive) {
        warn!(error = %e, "failed to enable TCP keepalive");
    }
}

/// Parsed upstream address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamAddr {
    /// `ircs://host[:port]`, default scheme and port 6697.
    Tls { host: String, addr: String },
    /// `irc+insecure://host[:port]`, default port 6667.
    Insecure { addr: String },
    /// `irc+unix:///path` or `unix:///path`.
    Unix { path: String },
}

/// Parse and validate a network address.
///
/// The accepted schemes are ircs (default for a bare `host:port`),
/// irc+insecure, irc+unix and unix. Userinfo, query strings and fragments
/// are rejected; TCP schemes require a host and no path, Unix schemes a
/// path and no host.
pub fn parse_upstream_addr(s: &str) -> anyhow::Result<UpstreamAddr> {
    let (scheme, rest) = match s.split_once("://") {
        Some((scheme, rest)) => (scheme, rest),
        None => ("ircs", s),
    };

    if rest.contains(['?', '#']) {
        bail!("{}:// URL must not have query values or a fragment", scheme);
    }

    match scheme {
        "ircs" | "irc+insecure" => {
            if rest.contains('@') {
                bail!("{}:// URL must not have username and password information", scheme);
            }
            if rest.contains('/') {
                bail!("{}:// URL must not have a path", scheme);
            }
            if rest.is_empty() {
                bail!("{}:// URL must have a host", scheme);
            }
            let (host, addr) = match rest.rsplit_once(':') {
                Some((host, port)) if port.parse::<u16>().is_ok() => {
                    (host.to_owned(), rest.to_owned())
                }
                _ => {
                    let default_port = if scheme == "ircs" { 6697 } else { 6667 };
                    (rest.to_owned(), format!("{}:{}", rest, default_port))
                }
            };
            if scheme == "ircs" {
                Ok(UpstreamAddr::Tls { host, addr })
            } else {
                Ok(UpstreamAddr::Insecure { addr })
            }
        }
        "irc+unix" | "unix" => {
            let path = match rest.strip_prefix('/') {
                Some(_) => rest.to_owned(),
                None => bail!("{}:// URL must not have a host", scheme),
            };
            if path.is_empty() {
                bail!("{}:// URL must have a path", scheme);
            }
            Ok(UpstreamAddr::Unix { path })
        }
        _ => bail!("unknown URL scheme {:?}", scheme),
    }
}

/// A dialed upstream connection with its address pair for identd.
pub struct Dialed {
    pub stream: Stream,
    pub remote_addr: String,
    pub local_addr: String,
}

async fn connect_tcp(addr: &str, local_ip: Option<IpAddr>) -> anyhow::Result<TcpStream> {
    let mut last_err = None;
    for resolved in tokio::net::lookup_host(addr)
        .await
        .with_context(|| format!("failed to resolve {:?}", addr))?
    {
        let result = match local_ip {
            Some(ip) => {
                let socket = match resolved {
                    SocketAddr::V4(_) => TcpSocket::new_v4(),
                    SocketAddr::V6(_) => TcpSocket::new_v6(),
                }?;
                socket.bind(SocketAddr::new(ip, 0))?;
                socket.connect(resolved).await
            }
            None => TcpStream::connect(resolved).await,
        };
        match result {
            Ok(stream) => {
                set_keepalive(&stream);
                return Ok(stream);
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err
        .map(anyhow::Error::from)
        .unwrap_or_else(|| anyhow!("no addresses for {:?}", addr)))
}

fn tls_config(sasl: &db::Sasl) -> anyhow::Result<ClientConfig> {
    let mut roots = RootCertStore::empty();
    let certs = rustls_native_certs::load_native_certs();
    for cert in certs.certs {
        if let Err(e) = roots.add(cert) {
            warn!(error = %e, "failed to add root certificate");
        }
    }
    for e in &certs.errors {
        warn!(error = %e, "error loading native certificates");
    }

    let builder = ClientConfig::builder().with_root_certificates(roots);
    if sasl.mechanism == "EXTERNAL" {
        let cert = sasl
            .external_cert
            .clone()
            .ok_or_else(|| anyhow!("missing certificate for authentication"))?;
        let key = sasl
            .external_key
            .clone()
            .ok_or_else(|| anyhow!("missing private key for authentication"))?;
        let chain = vec![CertificateDer::from(cert)];
        let key = PrivateKeyDer::Pkcs8(key.into());
        Ok(builder.with_client_auth_cert(chain, key)?)
    } else {
        Ok(builder.with_no_client_auth())
    }
}

/// Dial an upstream server. The caller applies the connect timeout.
pub async fn dial_upstream(
    addr: &str,
    sasl: &db::Sasl,
    local_ip: Option<IpAddr>,
) -> anyhow::Result<Dialed> {
    match parse_upstream_addr(addr)? {
        UpstreamAddr::Tls { host, addr } => {
            let tcp = connect_tcp(&addr, local_ip).await?;
            let remote_addr = tcp.peer_addr()?.to_string();
            let local_addr = tcp.local_addr()?.to_string();
            let connector = TlsConnector::from(Arc::new(tls_config(sasl)?));
            let server_name = ServerName::try_from(host.clone())
                .map_err(|_| anyhow!("invalid TLS server name {:?}", host))?;
            let stream = connector
                .connect(server_name, tcp)
                .await
                .with_context(|| format!("TLS handshake with {:?} failed", addr))?;
            Ok(Dialed {
                stream: Stream::Tls(Box::new(stream)),
                remote_addr,
                local_addr,
            })
        }
        UpstreamAddr::Insecure { addr } => {
            let tcp = connect_tcp(&addr, local_ip).await?;
            let remote_addr = tcp.peer_addr()?.to_string();
            let local_addr = tcp.local_addr()?.to_string();
            Ok(Dialed {
                stream: Stream::Tcp(tcp),
                remote_addr,
                local_addr,
            })
        }
        UpstreamAddr::Unix { path } => {
            #[cfg(unix)]
            {
                let stream = UnixStream::connect(&path)
                    .await
                    .with_context(|| format!("failed to connect to Unix socket {:?}", path))?;
                Ok(Dialed {
                    stream: Stream::Unix(stream),
                    remote_addr: path.clone(),
                    local_addr: path,
                })
            }
            #[cfg(not(unix))]
            {
                bail!("Unix sockets are not supported on this platform")
            }
        }
    }
}

/// Outbound write rate limit: `burst` messages, then one per `delay`.
#[derive(Clone, Copy)]
pub struct RateLimit {
    pub delay: Duration,
    pub burst: u32,
}

/// Spawn the writer task draining `rx` to the wire.
///
/// The task ends when every sender is dropped or the write fails.
pub fn spawn_writer(
    mut writer: Writer,
    mut rx: mpsc::UnboundedReceiver<Message>,
    rate: Option<RateLimit>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tokens = rate.map_or(0, |r| r.burst);
        let mut last_refill = Instant::now();
        while let Some(msg) = rx.recv().await {
            if let Some(rate) = rate {
                let elapsed = last_refill.elapsed();
                if elapsed >= rate.delay {
                    let refill = (elapsed.as_millis() / rate.delay.as_millis().max(1)) as u32;
                    tokens = tokens.saturating_add(refill).min(rate.burst);
                    last_refill = Instant::now();
                }
                if tokens == 0 {
                    tokio::time::sleep(rate.delay).await;
                    last_refill = Instant::now();
                } else {
                    tokens -= 1;
                }
            }
            if let Err(e) = writer.send(msg).await {
                warn!(error = %e, "failed to write message");
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addr_parsing() {
        assert_eq!(
            parse_upstream_addr("irc.libera.chat").unwrap(),
            UpstreamAddr::Tls {
                host: "irc.libera.chat".into(),
                addr: "irc.libera.chat:6697".into(),
            }
        );
        assert_eq!(
            parse_upstream_addr("ircs://irc.libera.chat:7000").unwrap(),
            UpstreamAddr::Tls {
                host: "irc.libera.chat".into(),
                addr: "irc.libera.chat:7000".into(),
            }
        );
        assert_eq!(
            parse_upstream_addr("irc+insecure://example.org").unwrap(),
            UpstreamAddr::Insecure {
                addr: "example.org:6667".into(),
            }
        );
        assert_eq!(
            parse_upstream_addr("unix:///run/irc.sock").unwrap(),
            UpstreamAddr::Unix {
                path: "/run/irc.sock".into(),
            }
        );
    }

    #[test]
    fn addr_rejections() {
        assert!(parse_upstream_addr("http://example.org").is_err());
        assert!(parse_upstream_addr("ircs://user:pw@example.org").is_err());
        assert!(parse_upstream_addr("ircs://example.org/path").is_err());
        assert!(parse_upstream_addr("ircs://example.org?x=1").is_err());
        assert!(parse_upstream_addr("ircs://").is_err());
        assert!(parse_upstream_addr("unix://host/path").is_err());
        assert!(parse_upstream_addr("unix://").is_err());
    }
}
