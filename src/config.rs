use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::ServerCertVerifier;
use serde::{Deserialize, Serialize};

use crate::cookies::CookieStore;
use crate::error::{Error, Result};

/// Wire protocol spoken to the upstream proxy server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyDialect {
    Http,
    Socks4,
    Socks4a,
    Socks5,
}

impl ProxyDialect {
    /// Conventional port for proxies of this dialect.
    pub fn default_port(self) -> u16 {
        match self {
            ProxyDialect::Http => 8080,
            ProxyDialect::Socks4 | ProxyDialect::Socks4a | ProxyDialect::Socks5 => 1080,
        }
    }
}

impl fmt::Display for ProxyDialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProxyDialect::Http => "http",
            ProxyDialect::Socks4 => "socks4",
            ProxyDialect::Socks4a => "socks4a",
            ProxyDialect::Socks5 => "socks5",
        };
        f.write_str(name)
    }
}

/// Address and credentials of the upstream proxy server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ProxyEndpoint {
    host: String,
    port: u16,
    username: Option<String>,
    password: Option<String>,
}

impl ProxyEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self> {
        let host = host.into();
        if host.is_empty() {
            return Err(Error::Config("proxy host must not be empty".into()));
        }
        if port == 0 {
            return Err(Error::Config("proxy port must be in 1..=65535".into()));
        }
        Ok(ProxyEndpoint {
            host,
            port,
            username: None,
            password: None,
        })
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    /// Username and password together, when both are configured.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(u), Some(p)) => Some((u, p)),
            _ => None,
        }
    }
}

/// Client options.
///
/// `dialect` and `proxy` are required at construction; everything else has a
/// usable default and can be adjusted field-by-field before the config is
/// handed to [`Client::new`](crate::Client::new), which validates it.
#[derive(Clone)]
pub struct ClientConfig {
    /// Proxy wire protocol.
    pub dialect: ProxyDialect,
    /// Proxy address and credentials.
    pub proxy: ProxyEndpoint,
    /// Pooled connections kept per (host, port, tls) destination. Must be
    /// at least 1.
    pub pool_size_per_host: u32,
    /// Total wait for a free pool slot; `None` waits forever.
    pub pool_acquire_timeout: Option<Duration>,
    /// Per-operation timeout for writes towards the proxy (also bounds the
    /// TCP connect).
    pub proxy_send_timeout: Option<Duration>,
    /// Per-operation timeout for reads from the proxy.
    pub proxy_recv_timeout: Option<Duration>,
    /// Follow 301/302/303/307 responses automatically.
    pub follow_redirects: bool,
    /// Redirect-chain bound. Must be at least 1.
    pub max_redirects: u32,
    /// Parse `Set-Cookie` response headers and emit `Cookie` request
    /// headers through the configured (or a default) jar.
    pub use_cookies: bool,
    /// Caller-provided cookie jar; a fresh in-memory jar is used when
    /// `use_cookies` is set and this is `None`.
    pub cookie_jar: Option<Arc<dyn CookieStore>>,
    /// Caller-supplied server certificate verifier for the TLS upgrade of
    /// https tunnels; `None` validates against the bundled webpki roots.
    pub tls_cert_verifier: Option<Arc<dyn ServerCertVerifier>>,
}

impl ClientConfig {
    pub fn new(dialect: ProxyDialect, proxy: ProxyEndpoint) -> Self {
        ClientConfig {
            dialect,
            proxy,
            pool_size_per_host: 4,
            pool_acquire_timeout: Some(Duration::from_secs(30)),
            proxy_send_timeout: Some(Duration::from_secs(30)),
            proxy_recv_timeout: Some(Duration::from_secs(30)),
            follow_redirects: true,
            max_redirects: 10,
            use_cookies: false,
            cookie_jar: None,
            tls_cert_verifier: None,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.pool_size_per_host == 0 {
            return Err(Error::Config("pool_size_per_host must be at least 1".into()));
        }
        if self.max_redirects == 0 {
            return Err(Error::Config("max_redirects must be at least 1".into()));
        }
        Ok(())
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("dialect", &self.dialect)
            .field("proxy", &self.proxy)
            .field("pool_size_per_host", &self.pool_size_per_host)
            .field("pool_acquire_timeout", &self.pool_acquire_timeout)
            .field("proxy_send_timeout", &self.proxy_send_timeout)
            .field("proxy_recv_timeout", &self.proxy_recv_timeout)
            .field("follow_redirects", &self.follow_redirects)
            .field("max_redirects", &self.max_redirects)
            .field("use_cookies", &self.use_cookies)
            .field("cookie_jar", &self.cookie_jar.is_some())
            .field("tls_cert_verifier", &self.tls_cert_verifier.is_some())
            .finish()
    }
}
