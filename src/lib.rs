//! HTTP/1.x client transport that reaches every destination through an
//! upstream proxy: HTTP CONNECT, SOCKS4, SOCKS4a or SOCKS5.
//!
//! The proxy handshake replaces the direct TCP/TLS connect; after it, the
//! socket is an end-to-end tunnel and the crate speaks plain HTTP/1.x over
//! it — hand-written request serialization, response parsing, chunked and
//! content-length body framing, and transparent gzip/deflate decompression.
//! Tunnels are pooled per (host, port, tls) destination and reused once a
//! response body has been consumed to its framing end.
//!
//! ```no_run
//! use tunnelhttp::{Client, ClientConfig, ProxyDialect, ProxyEndpoint};
//!
//! # async fn run() -> tunnelhttp::Result<()> {
//! let proxy = ProxyEndpoint::new("proxy.local", 1080)?;
//! let client = Client::new(ClientConfig::new(ProxyDialect::Socks5, proxy))?;
//!
//! let request = http::Request::builder()
//!     .uri("https://example.com/")
//!     .body(None)
//!     .unwrap();
//! let response = client.send(request).await?;
//! let body = response.into_body().bytes().await?;
//! # Ok(())
//! # }
//! ```

mod body;
mod client;
mod config;
mod connection;
mod connection_pool;
mod cookies;
mod error;
mod pool;
mod proxy;
mod stream;

pub use body::Body;
pub use client::Client;
pub use config::{ClientConfig, ProxyDialect, ProxyEndpoint};
pub use connection::ReasonPhrase;
pub use cookies::{CookieStore, Jar};
pub use error::{Error, Result};

pub use tokio_util::sync::CancellationToken;

/// Request type accepted by [`Client::send`]: an [`http::Request`] whose
/// body is either absent or a single in-memory buffer.
pub type Request = http::Request<Option<bytes::Bytes>>;

/// Response type returned by [`Client::send`].
pub type Response = http::Response<Body>;
