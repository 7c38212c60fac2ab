use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use http::Uri;
use rustls::client::danger::ServerCertVerifier;
use rustls::pki_types::ServerName;
use rustls::RootCertStore;
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::pool::{Factory, Pool, PoolGuard, ShouldDropFn};
use crate::proxy::ProxyConnection;
use crate::stream::MaybeTlsStream;

/// Pool map key: one pool per destination (host, port, tls) triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct HostPortKey {
    host: String,
    port: u16,
    tls: bool,
}

impl HostPortKey {
    pub(crate) fn from_uri(uri: &Uri) -> Result<Self> {
        let tls = match uri.scheme_str() {
            Some("http") => false,
            Some("https") => true,
            other => {
                return Err(Error::Config(format!(
                    "unsupported request scheme {:?}",
                    other.unwrap_or("")
                )));
            }
        };
        let host = uri
            .host()
            .ok_or_else(|| Error::Config("request URI has no host".into()))?
            .to_string();
        let port = uri.port_u16().unwrap_or(if tls { 443 } else { 80 });
        Ok(HostPortKey { host, port, tls })
    }
}

impl fmt::Display for HostPortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls { "https" } else { "http" };
        write!(f, "{scheme}://{}:{}", self.host, self.port)
    }
}

/// One pooled proxy tunnel to a destination.
///
/// The tunnel stream is realised lazily on first use: the proxy handshake
/// runs, then https destinations get a TLS upgrade with the destination
/// host as server name. Between exchanges the stream is parked here; an
/// exchange takes it out and hands it back only if the response body was
/// consumed to its framing end.
pub(crate) struct PooledTunnel {
    conn: ProxyConnection,
    host: String,
    port: u16,
    tls: bool,
    tls_verifier: Option<Arc<dyn ServerCertVerifier>>,
    stream: Option<MaybeTlsStream>,
    stream_created: bool,
}

impl PooledTunnel {
    fn new(conn: ProxyConnection, key: &HostPortKey, verifier: Option<Arc<dyn ServerCertVerifier>>) -> Self {
        PooledTunnel {
            conn,
            host: key.host.clone(),
            port: key.port,
            tls: key.tls,
            tls_verifier: verifier,
            stream: None,
            stream_created: false,
        }
    }

    pub(crate) fn is_broken(&self) -> bool {
        self.stream_created && !self.conn.is_connected()
    }

    /// Takes the tunnel stream, establishing it on first use.
    pub(crate) async fn take_stream(&mut self) -> Result<MaybeTlsStream> {
        if let Some(stream) = self.stream.take() {
            return Ok(stream);
        }
        // set before connecting: a failed attempt leaves the connection
        // unusable, and the flag is what gets the tunnel replaced
        self.stream_created = true;
        let socket = self.conn.connect(&self.host, self.port).await?;
        if self.tls {
            match upgrade_to_tls(socket, &self.host, self.tls_verifier.clone()).await {
                Ok(stream) => Ok(MaybeTlsStream::Tls(Box::new(stream))),
                Err(e) => {
                    self.conn.mark_broken();
                    Err(e)
                }
            }
        } else {
            Ok(MaybeTlsStream::Plain(socket))
        }
    }

    /// Parks a fully consumed stream for the next exchange.
    pub(crate) fn restore_stream(&mut self, stream: MaybeTlsStream) {
        self.stream = Some(stream);
    }

    /// The stream is unsafe to reuse; the next acquire replaces the tunnel.
    pub(crate) fn mark_broken(&mut self) {
        self.stream = None;
        self.conn.mark_broken();
    }
}

/// TLS upgrade of a tunnelled socket, with SNI set to the destination host.
async fn upgrade_to_tls(
    socket: TcpStream,
    host: &str,
    verifier: Option<Arc<dyn ServerCertVerifier>>,
) -> Result<TlsStream<TcpStream>> {
    // first caller wins; keeps the builder unambiguous about providers
    let _ = rustls::crypto::ring::default_provider().install_default();
    let config = match verifier {
        Some(verifier) => rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_no_client_auth(),
        None => {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        }
    };
    let connector = TlsConnector::from(Arc::new(config));
    let name = ServerName::try_from(host.to_string())
        .map_err(|_| Error::Config(format!("invalid TLS server name {host:?}")))?;
    connector
        .connect(name, socket)
        .await
        .map_err(|e| Error::proxy_io(format!("TLS handshake with {host} failed"), e))
}

/// Lazily instantiated per-destination tunnel pools.
pub(crate) struct TunnelPools {
    pools: RwLock<HashMap<HostPortKey, Pool<PooledTunnel>>>,
    config: Arc<ClientConfig>,
    shutdown: CancellationToken,
}

impl TunnelPools {
    pub(crate) fn new(config: Arc<ClientConfig>, shutdown: CancellationToken) -> Self {
        TunnelPools {
            pools: RwLock::new(HashMap::new()),
            config,
            shutdown,
        }
    }

    /// Borrows a tunnel for `uri`, creating its pool on first sight of the
    /// destination. Reads take the fast path; the write lock is only held
    /// for the double-checked insert.
    pub(crate) async fn acquire(
        &self,
        uri: &Uri,
        caller: &CancellationToken,
    ) -> Result<PoolGuard<PooledTunnel>> {
        let key = HostPortKey::from_uri(uri)?;

        let existing = self.pools.read().await.get(&key).cloned();
        let pool = match existing {
            Some(pool) => pool,
            None => {
                let mut pools = self.pools.write().await;
                match pools.get(&key) {
                    Some(pool) => pool.clone(),
                    None => {
                        debug!(destination = %key, "creating tunnel pool");
                        let pool = self.build_pool(&key);
                        pools.insert(key.clone(), pool.clone());
                        pool
                    }
                }
            }
        };

        pool.acquire(self.config.pool_acquire_timeout, caller).await
    }

    fn build_pool(&self, key: &HostPortKey) -> Pool<PooledTunnel> {
        let config = Arc::clone(&self.config);
        let key = key.clone();
        let factory: Factory<PooledTunnel> = Arc::new(move || {
            let config = Arc::clone(&config);
            let key = key.clone();
            Box::pin(async move {
                let conn = ProxyConnection::new(
                    config.dialect,
                    config.proxy.clone(),
                    config.proxy_send_timeout,
                    config.proxy_recv_timeout,
                );
                Ok(PooledTunnel::new(conn, &key, config.tls_cert_verifier.clone()))
            })
        });
        let should_drop: ShouldDropFn<PooledTunnel> =
            Box::new(|tunnel: &PooledTunnel| tunnel.is_broken());
        Pool::new(
            self.config.pool_size_per_host as usize,
            factory,
            None,
            Some(should_drop),
            self.shutdown.child_token(),
        )
    }

    /// Disposes every pool: in-flight factories observe cancellation and
    /// realised tunnels are closed.
    pub(crate) async fn dispose(&self) {
        let pools = self.pools.write().await;
        for pool in pools.values() {
            pool.dispose();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProxyDialect, ProxyEndpoint};

    fn uri(s: &str) -> Uri {
        s.parse().unwrap()
    }

    #[test]
    fn test_key_from_uri() {
        let key = HostPortKey::from_uri(&uri("http://example.com/a")).unwrap();
        assert_eq!(
            key,
            HostPortKey {
                host: "example.com".into(),
                port: 80,
                tls: false
            }
        );

        let key = HostPortKey::from_uri(&uri("https://example.com/a")).unwrap();
        assert_eq!(key.port, 443);
        assert!(key.tls);

        let key = HostPortKey::from_uri(&uri("http://example.com:8080/")).unwrap();
        assert_eq!(key.port, 8080);

        assert!(HostPortKey::from_uri(&uri("ftp://example.com/")).is_err());
        assert!(HostPortKey::from_uri(&uri("/relative/only")).is_err());
    }

    #[test]
    fn test_key_distinguishes_tls() {
        let http = HostPortKey::from_uri(&uri("http://h:1234/")).unwrap();
        let https = HostPortKey::from_uri(&uri("https://h:1234/")).unwrap();
        assert_ne!(http, https);
    }

    #[tokio::test]
    async fn test_pool_is_created_once_per_destination() {
        let endpoint = ProxyEndpoint::new("127.0.0.1", 1080).unwrap();
        let config = Arc::new(ClientConfig::new(ProxyDialect::Socks5, endpoint));
        let pools = TunnelPools::new(config, CancellationToken::new());
        let caller = CancellationToken::new();

        // two acquires against the same destination share one pool, and the
        // tunnel is handed out without any network activity (it is lazy)
        let first = pools.acquire(&uri("http://h/a"), &caller).await.unwrap();
        drop(first);
        let second = pools.acquire(&uri("http://h/b"), &caller).await.unwrap();
        drop(second);
        assert_eq!(pools.pools.read().await.len(), 1);

        let other = pools.acquire(&uri("https://h/a"), &caller).await.unwrap();
        drop(other);
        assert_eq!(pools.pools.read().await.len(), 2);
    }

    #[tokio::test]
    async fn test_unrealised_tunnel_is_not_broken() {
        let endpoint = ProxyEndpoint::new("127.0.0.1", 1080).unwrap();
        let config = Arc::new(ClientConfig::new(ProxyDialect::Socks4, endpoint));
        let pools = TunnelPools::new(config, CancellationToken::new());
        let caller = CancellationToken::new();

        let mut tunnel = pools.acquire(&uri("http://h/"), &caller).await.unwrap();
        assert!(!tunnel.is_broken());
        tunnel.mark_broken();
        // never realised a stream, so the formula still reports healthy
        assert!(!tunnel.is_broken());
    }
}
