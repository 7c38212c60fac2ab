use std::fmt::Write as _;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::{ProxyDialect, ProxyEndpoint};
use crate::error::{Error, Result};

mod connect;
mod socks4;
mod socks5;

/// Longest the client waits for a handshake reply from the proxy.
pub(crate) const HANDSHAKE_WAIT: Duration = Duration::from_secs(15);

/// One TCP connection to the proxy server.
///
/// Created idle; [`connect`](Self::connect) dials the proxy, runs the
/// dialect handshake and hands back the tunnelled socket. After any
/// handshake error the instance is unusable and must be replaced.
pub(crate) struct ProxyConnection {
    dialect: ProxyDialect,
    endpoint: ProxyEndpoint,
    send_timeout: Option<Duration>,
    recv_timeout: Option<Duration>,
    connected: bool,
    failed: bool,
}

impl ProxyConnection {
    pub(crate) fn new(
        dialect: ProxyDialect,
        endpoint: ProxyEndpoint,
        send_timeout: Option<Duration>,
        recv_timeout: Option<Duration>,
    ) -> Self {
        ProxyConnection {
            dialect,
            endpoint,
            send_timeout,
            recv_timeout,
            connected: false,
            failed: false,
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected
    }

    pub(crate) fn mark_broken(&mut self) {
        self.connected = false;
        self.failed = true;
    }

    /// Dials the proxy and negotiates a tunnel to `dest_host:dest_port`.
    ///
    /// On success the returned socket carries end-to-end bytes between the
    /// caller and the destination.
    pub(crate) async fn connect(&mut self, dest_host: &str, dest_port: u16) -> Result<TcpStream> {
        if self.connected || self.failed {
            return Err(Error::proxy(
                "proxy connection is not reusable; a fresh one is required",
            ));
        }

        let proxy_host = self.endpoint.host().to_string();
        let proxy_port = self.endpoint.port();
        debug!(
            dialect = %self.dialect,
            proxy_host = %proxy_host,
            proxy_port,
            dest_host,
            dest_port,
            "connecting through proxy"
        );

        let dial = TcpStream::connect((proxy_host.as_str(), proxy_port));
        let dialed = match self.send_timeout {
            Some(limit) => timeout(limit, dial).await.map_err(|_| {
                Error::proxy(format!(
                    "timeout connecting to proxy {proxy_host}:{proxy_port}"
                ))
            })?,
            None => dial.await,
        };
        let mut socket = match dialed {
            Ok(socket) => socket,
            Err(e) => {
                self.failed = true;
                return Err(Error::proxy_io(
                    format!("failed to connect to proxy {proxy_host}:{proxy_port}"),
                    e,
                ));
            }
        };

        let deadline = reply_deadline(self.recv_timeout);
        let result = match self.dialect {
            ProxyDialect::Http => {
                connect::handshake(
                    &mut socket,
                    dest_host,
                    dest_port,
                    self.endpoint.credentials(),
                    self.send_timeout,
                    deadline,
                )
                .await
            }
            ProxyDialect::Socks4 => {
                socks4::handshake(
                    &mut socket,
                    dest_host,
                    dest_port,
                    self.endpoint.username().unwrap_or(""),
                    false,
                    self.send_timeout,
                    deadline,
                )
                .await
            }
            ProxyDialect::Socks4a => {
                socks4::handshake(
                    &mut socket,
                    dest_host,
                    dest_port,
                    self.endpoint.username().unwrap_or(""),
                    true,
                    self.send_timeout,
                    deadline,
                )
                .await
            }
            ProxyDialect::Socks5 => {
                socks5::handshake(
                    &mut socket,
                    dest_host,
                    dest_port,
                    self.endpoint.credentials(),
                    self.send_timeout,
                    deadline,
                )
                .await
            }
        };

        match result {
            Ok(()) => {
                self.connected = true;
                info!(
                    dialect = %self.dialect,
                    dest_host,
                    dest_port,
                    "proxy tunnel established"
                );
                Ok(socket)
            }
            Err(e) => {
                self.failed = true;
                warn!(dialect = %self.dialect, error = %e, "proxy handshake failed");
                Err(e)
            }
        }
    }
}

/// Handshake replies wait at most [`HANDSHAKE_WAIT`], or the configured
/// receive timeout when that is shorter.
fn reply_deadline(recv_timeout: Option<Duration>) -> Duration {
    match recv_timeout {
        Some(t) if t < HANDSHAKE_WAIT => t,
        _ => HANDSHAKE_WAIT,
    }
}

/// Writes one handshake frame, bounded by the send timeout.
pub(crate) async fn send_frame<S>(
    socket: &mut S,
    frame: &[u8],
    send_timeout: Option<Duration>,
) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let write = async {
        socket.write_all(frame).await?;
        socket.flush().await
    };
    let written = match send_timeout {
        Some(limit) => timeout(limit, write)
            .await
            .map_err(|_| Error::proxy("timeout writing handshake to proxy"))?,
        None => write.await,
    };
    written.map_err(|e| Error::proxy_io("failed to write handshake to proxy", e))
}

/// Reads an exact-size handshake reply, bounded by `deadline`.
pub(crate) async fn read_reply<S>(socket: &mut S, buf: &mut [u8], deadline: Duration) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    timeout(deadline, socket.read_exact(buf))
        .await
        .map_err(|_| Error::proxy("timeout waiting for reply from proxy"))?
        .map_err(|e| Error::proxy_io("failed to read proxy reply", e))?;
    Ok(())
}

/// Space-separated hex rendering of a reply, for diagnostics.
pub(crate) fn hex_dump(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, b) in bytes.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{b:02x}");
    }
    out
}
