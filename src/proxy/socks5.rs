use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};

use super::{hex_dump, read_reply, send_frame};
use crate::error::{Error, Result};

const VERSION: u8 = 0x05;
const CMD_CONNECT: u8 = 0x01;

const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USERPASS: u8 = 0x02;
const METHOD_UNACCEPTABLE: u8 = 0xff;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const AUTH_VERSION: u8 = 0x01;

/// SOCKS5 CONNECT: method negotiation (with optional username/password
/// subnegotiation) followed by the connect request.
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
    // both methods are always offered; the server picks
    send_frame(
        socket,
        &[VERSION, 2, METHOD_NO_AUTH, METHOD_USERPASS],
        send_timeout,
    )
    .await?;

    let mut choice = [0u8; 2];
    read_reply(socket, &mut choice, deadline).await?;
    if choice[0] != VERSION {
        return Err(Error::proxy(format!(
            "unexpected SOCKS version {:#04x} in method reply",
            choice[0]
        )));
    }
    match choice[1] {
        METHOD_NO_AUTH => {}
        METHOD_USERPASS => match credentials {
            Some((username, password)) => {
                authenticate(socket, username, password, send_timeout, deadline).await?;
            }
            None => {
                return Err(Error::proxy(
                    "proxy requires username/password authentication: credentials required",
                ));
            }
        },
        METHOD_UNACCEPTABLE => {
            return Err(Error::proxy("no acceptable methods offered to the proxy"));
        }
        other => {
            return Err(Error::proxy(format!(
                "proxy selected unsupported method {other:#04x}"
            )));
        }
    }

    let request = build_connect_request(dest_host, dest_port)?;
    send_frame(socket, &request, send_timeout).await?;

    let mut head = [0u8; 4];
    read_reply(socket, &mut head, deadline).await?;
    let mut reply = head.to_vec();

    let addr_len = match head[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            read_reply(socket, &mut len, deadline).await?;
            reply.push(len[0]);
            len[0] as usize
        }
        other => {
            return Err(Error::proxy(format!(
                "unsupported address type {other:#04x} in reply (reply {})",
                hex_dump(&reply)
            )));
        }
    };
    let mut bound = vec![0u8; addr_len + 2];
    read_reply(socket, &mut bound, deadline).await?;
    reply.extend_from_slice(&bound);

    match head[1] {
        0x00 => Ok(()),
        code => Err(Error::proxy(format!(
            "{} (reply {})",
            reply_message(code),
            hex_dump(&reply)
        ))),
    }
}

async fn authenticate<S>(
    socket: &mut S,
    username: &str,
    password: &str,
    send_timeout: Option<Duration>,
    deadline: Duration,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if username.len() > 255 || password.len() > 255 {
        return Err(Error::Config(
            "SOCKS5 username and password are limited to 255 bytes".into(),
        ));
    }
    let mut frame = Vec::with_capacity(3 + username.len() + password.len());
    frame.push(AUTH_VERSION);
    frame.push(username.len() as u8);
    frame.extend_from_slice(username.as_bytes());
    frame.push(password.len() as u8);
    frame.extend_from_slice(password.as_bytes());
    send_frame(socket, &frame, send_timeout).await?;

    let mut reply = [0u8; 2];
    read_reply(socket, &mut reply, deadline).await?;
    if reply[1] != 0x00 {
        return Err(Error::proxy(format!(
            "auth failure (status {:#04x})",
            reply[1]
        )));
    }
    Ok(())
}

fn build_connect_request(dest_host: &str, dest_port: u16) -> Result<Vec<u8>> {
    let mut frame = vec![VERSION, CMD_CONNECT, 0x00];
    if let Ok(ip) = dest_host.parse::<Ipv4Addr>() {
        frame.push(ATYP_IPV4);
        frame.extend_from_slice(&ip.octets());
    } else if let Ok(ip) = dest_host.parse::<Ipv6Addr>() {
        frame.push(ATYP_IPV6);
        frame.extend_from_slice(&ip.octets());
    } else {
        if dest_host.len() > 255 {
            return Err(Error::proxy(format!(
                "domain name too long for SOCKS5: {} bytes",
                dest_host.len()
            )));
        }
        frame.push(ATYP_DOMAIN);
        frame.push(dest_host.len() as u8);
        frame.extend_from_slice(dest_host.as_bytes());
    }
    frame.extend_from_slice(&dest_port.to_be_bytes());
    Ok(frame)
}

/// RFC 1928 §6 reply field.
fn reply_message(code: u8) -> &'static str {
    match code {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown reply code",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    const DEADLINE: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn test_ipv4_no_auth() {
        let (mut client, mut server) = duplex(256);

        let client_side = handshake(&mut client, "1.2.3.4", 443, None, None, DEADLINE);
        let server_side = async {
            let mut greeting = [0u8; 4];
            server.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [0x05, 0x02, 0x00, 0x02]);
            server.write_all(&[0x05, 0x00]).await.unwrap();

            let mut request = [0u8; 10];
            server.read_exact(&mut request).await.unwrap();
            assert_eq!(
                request,
                [0x05, 0x01, 0x00, 0x01, 0x01, 0x02, 0x03, 0x04, 0x01, 0xbb]
            );
            server
                .write_all(&[0x05, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00])
                .await
                .unwrap();
        };

        let (result, ()) = tokio::join!(client_side, server_side);
        result.unwrap();
    }

    #[tokio::test]
    async fn test_domain_request() {
        let (mut client, mut server) = duplex(256);

        let client_side = handshake(&mut client, "example.com", 80, None, None, DEADLINE);
        let server_side = async {
            let mut greeting = [0u8; 4];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&[0x05, 0x00]).await.unwrap();

            let mut request = vec![0u8; 4 + 1 + 11 + 2];
            server.read_exact(&mut request).await.unwrap();
            assert_eq!(&request[..4], &[0x05, 0x01, 0x00, 0x03]);
            assert_eq!(request[4], 11);
            assert_eq!(&request[5..16], b"example.com");
            assert_eq!(&request[16..], &80u16.to_be_bytes());
            server
                .write_all(&[0x05, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00])
                .await
                .unwrap();
        };

        let (result, ()) = tokio::join!(client_side, server_side);
        result.unwrap();
    }

    #[tokio::test]
    async fn test_auth_subnegotiation_failure() {
        let (mut client, mut server) = duplex(256);

        let client_side = handshake(
            &mut client,
            "example.com",
            80,
            Some(("foo", "bar")),
            None,
            DEADLINE,
        );
        let server_side = async {
            let mut greeting = [0u8; 4];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&[0x05, 0x02]).await.unwrap();

            let mut auth = [0u8; 9];
            server.read_exact(&mut auth).await.unwrap();
            assert_eq!(
                auth,
                [0x01, 0x03, 0x66, 0x6f, 0x6f, 0x03, 0x62, 0x61, 0x72]
            );
            server.write_all(&[0x01, 0x01]).await.unwrap();
        };

        let (result, ()) = tokio::join!(client_side, server_side);
        let err = result.unwrap_err();
        assert!(err.to_string().contains("auth failure"), "{err}");
    }

    #[tokio::test]
    async fn test_auth_demanded_without_credentials() {
        let (mut client, mut server) = duplex(256);

        let client_side = handshake(&mut client, "example.com", 80, None, None, DEADLINE);
        let server_side = async {
            let mut greeting = [0u8; 4];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&[0x05, 0x02]).await.unwrap();
        };

        let (result, ()) = tokio::join!(client_side, server_side);
        let err = result.unwrap_err();
        assert!(err.to_string().contains("credentials required"), "{err}");
    }

    #[tokio::test]
    async fn test_no_acceptable_methods() {
        let (mut client, mut server) = duplex(256);

        let client_side = handshake(&mut client, "example.com", 80, None, None, DEADLINE);
        let server_side = async {
            let mut greeting = [0u8; 4];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&[0x05, 0xff]).await.unwrap();
        };

        let (result, ()) = tokio::join!(client_side, server_side);
        let err = result.unwrap_err();
        assert!(err.to_string().contains("no acceptable methods"), "{err}");
    }

    #[tokio::test]
    async fn test_connect_refused_reports_hex_reply() {
        let (mut client, mut server) = duplex(256);

        let client_side = handshake(&mut client, "1.2.3.4", 80, None, None, DEADLINE);
        let server_side = async {
            let mut greeting = [0u8; 4];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&[0x05, 0x00]).await.unwrap();

            let mut request = [0u8; 10];
            server.read_exact(&mut request).await.unwrap();
            server
                .write_all(&[0x05, 0x05, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00])
                .await
                .unwrap();
        };

        let (result, ()) = tokio::join!(client_side, server_side);
        let err = result.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("connection refused"), "{message}");
        assert!(
            message.contains("05 05 00 01 00 00 00 00 00 00"),
            "{message}"
        );
    }

    #[test]
    fn test_ipv6_request_shape() {
        let frame = build_connect_request("::1", 443).unwrap();
        assert_eq!(&frame[..4], &[0x05, 0x01, 0x00, 0x04]);
        assert_eq!(frame.len(), 4 + 16 + 2);
        assert_eq!(&frame[frame.len() - 2..], &443u16.to_be_bytes());
    }

    #[test]
    fn test_overlong_domain_rejected() {
        let long = "a".repeat(256);
        assert!(build_connect_request(&long, 80).is_err());
    }
}
