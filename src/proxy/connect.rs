use std::io;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::time::timeout;

use super::send_frame;
use crate::error::{Error, Result};

/// Upper bound on the CONNECT response head.
const MAX_RESPONSE_HEAD: usize = 8 * 1024;

/// HTTP CONNECT handshake.
///
/// Sends an `HTTP/1.0` CONNECT with a `Host` header (and Basic
/// `Proxy-Authorization` when credentials are configured), then reads the
/// response head up to its terminating blank line. Anything the proxy sent
/// past the blank line is discarded: after a 200 the socket is a raw tunnel.
pub(super) async fn handshake<S>(
    socket: &mut S,
    dest_host: &str,
    dest_port: u16,
    credentials: Option<(&str, &str)>,
    send_timeout: Option<Duration>,
    deadline: Duration,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let authority = format!("{dest_host}:{dest_port}");
    let mut request = format!("CONNECT {authority} HTTP/1.0\r\nHost: {authority}\r\n");
    if let Some((username, password)) = credentials {
        let token = BASE64.encode(format!("{username}:{password}"));
        request.push_str(&format!("Proxy-Authorization: Basic {token}\r\n"));
    }
    request.push_str("\r\n");
    send_frame(socket, request.as_bytes(), send_timeout).await?;

    let head = read_response_head(socket, deadline).await?;
    let status_line = head.split('\r').next().unwrap_or("");
    let (code, reason) = parse_status_line(status_line)?;

    match code {
        200 => Ok(()),
        502 => Err(Error::proxy(format!(
            "proxy reported a bad gateway for {authority} (502 {reason})"
        ))),
        code => Err(Error::proxy(format!(
            "proxy refused CONNECT with status {code} {reason}"
        ))),
    }
}

/// Reads until the blank line that ends the response head, or EOF.
async fn read_response_head<S>(socket: &mut S, deadline: Duration) -> Result<String>
where
    S: AsyncRead + Unpin,
{
    let collect = async {
        let mut collected: Vec<u8> = Vec::with_capacity(256);
        let mut scratch = [0u8; 512];
        loop {
            let n = socket.read(&mut scratch).await?;
            if n == 0 {
                break;
            }
            collected.extend_from_slice(&scratch[..n]);
            // rescan only around the freshly appended bytes
            let from = collected.len().saturating_sub(n + 3);
            if collected[from..].windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
            if collected.len() > MAX_RESPONSE_HEAD {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "CONNECT response head too large",
                ));
            }
        }
        Ok(collected)
    };
    let collected = timeout(deadline, collect)
        .await
        .map_err(|_| Error::proxy("timeout waiting for CONNECT reply from proxy"))?
        .map_err(|e: io::Error| Error::proxy_io("failed to read CONNECT reply", e))?;
    Ok(String::from_utf8_lossy(&collected).into_owned())
}

/// `HTTP/<v> <code> <reason>`; a missing HTTP token or unparseable code is
/// a proxy protocol violation.
fn parse_status_line(line: &str) -> Result<(u16, String)> {
    let mut parts = line.splitn(3, ' ');
    let version = parts.next().unwrap_or("");
    if !version.starts_with("HTTP") {
        return Err(Error::proxy(format!(
            "malformed CONNECT reply from proxy: {line:?}"
        )));
    }
    let code = parts
        .next()
        .and_then(|s| s.trim().parse::<u16>().ok())
        .ok_or_else(|| {
            Error::proxy(format!("malformed CONNECT reply from proxy: {line:?}"))
        })?;
    let reason = parts.next().unwrap_or("").trim().to_string();
    Ok((code, reason))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncWriteExt};

    const DEADLINE: Duration = Duration::from_secs(1);

    async fn read_request_head(server: &mut (impl AsyncRead + Unpin)) -> String {
        let mut collected = Vec::new();
        let mut byte = [0u8; 1];
        while !collected.ends_with(b"\r\n\r\n") {
            server.read_exact(&mut byte).await.unwrap();
            collected.push(byte[0]);
        }
        String::from_utf8(collected).unwrap()
    }

    #[tokio::test]
    async fn test_connect_success() {
        let (mut client, mut server) = duplex(1024);

        let client_side = handshake(&mut client, "example.com", 443, None, None, DEADLINE);
        let server_side = async {
            let request = read_request_head(&mut server).await;
            assert_eq!(
                request,
                "CONNECT example.com:443 HTTP/1.0\r\nHost: example.com:443\r\n\r\n"
            );
            server
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await
                .unwrap();
        };

        let (result, ()) = tokio::join!(client_side, server_side);
        result.unwrap();
    }

    #[tokio::test]
    async fn test_connect_basic_auth_header() {
        let (mut client, mut server) = duplex(1024);

        let client_side = handshake(
            &mut client,
            "example.com",
            443,
            Some(("user", "pass")),
            None,
            DEADLINE,
        );
        let server_side = async {
            let request = read_request_head(&mut server).await;
            // b64("user:pass")
            assert!(
                request.contains("Proxy-Authorization: Basic dXNlcjpwYXNz\r\n"),
                "{request}"
            );
            server.write_all(b"HTTP/1.0 200 OK\r\n\r\n").await.unwrap();
        };

        let (result, ()) = tokio::join!(client_side, server_side);
        result.unwrap();
    }

    #[tokio::test]
    async fn test_connect_407() {
        let (mut client, mut server) = duplex(1024);

        let client_side = handshake(&mut client, "a.b", 443, None, None, DEADLINE);
        let server_side = async {
            let request = read_request_head(&mut server).await;
            assert_eq!(request, "CONNECT a.b:443 HTTP/1.0\r\nHost: a.b:443\r\n\r\n");
            server
                .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .await
                .unwrap();
        };

        let (result, ()) = tokio::join!(client_side, server_side);
        let err = result.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("407"), "{message}");
        assert!(message.contains("Proxy Authentication Required"), "{message}");
    }

    #[tokio::test]
    async fn test_connect_502_phrasing() {
        let (mut client, mut server) = duplex(1024);

        let client_side = handshake(&mut client, "a.b", 80, None, None, DEADLINE);
        let server_side = async {
            let _ = read_request_head(&mut server).await;
            server
                .write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n")
                .await
                .unwrap();
        };

        let (result, ()) = tokio::join!(client_side, server_side);
        let err = result.unwrap_err();
        assert!(err.to_string().contains("bad gateway"), "{err}");
    }

    #[tokio::test]
    async fn test_connect_garbage_reply() {
        let (mut client, mut server) = duplex(1024);

        let client_side = handshake(&mut client, "a.b", 80, None, None, DEADLINE);
        let server_side = async {
            let _ = read_request_head(&mut server).await;
            server.write_all(b"SSH-2.0-OpenSSH\r\n\r\n").await.unwrap();
        };

        let (result, ()) = tokio::join!(client_side, server_side);
        let err = result.unwrap_err();
        assert!(err.to_string().contains("malformed"), "{err}");
    }

    #[test]
    fn test_parse_status_line() {
        assert_eq!(
            parse_status_line("HTTP/1.1 200 Connection established").unwrap(),
            (200, "Connection established".to_string())
        );
        assert_eq!(parse_status_line("HTTP/1.0 200").unwrap().0, 200);
        assert!(parse_status_line("FTP 200 OK").is_err());
        assert!(parse_status_line("HTTP/1.1 abc OK").is_err());
        assert!(parse_status_line("").is_err());
    }
}
