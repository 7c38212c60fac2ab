use std::net::Ipv4Addr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::lookup_host;

use super::{read_reply, send_frame};
use crate::error::{Error, Result};

const VERSION: u8 = 0x04;
const CMD_CONNECT: u8 = 0x01;

const REPLY_GRANTED: u8 = 90;
const REPLY_REJECTED: u8 = 91;
const REPLY_NO_IDENTD: u8 = 92;
const REPLY_IDENTD_MISMATCH: u8 = 93;

/// SOCKS4 / SOCKS4a CONNECT.
///
/// SOCKS4 resolves the destination locally and sends its first A record;
/// SOCKS4a (`remote_resolve`) sends the marker address 0.0.0.1 plus the
/// hostname so the proxy resolves it.
pub(super) async fn handshake<S>(
    socket: &mut S,
    dest_host: &str,
    dest_port: u16,
    userid: &str,
    remote_resolve: bool,
    send_timeout: Option<Duration>,
    deadline: Duration,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = if remote_resolve {
        build_request(Ipv4Addr::new(0, 0, 0, 1), dest_port, userid, Some(dest_host))
    } else {
        let ip = resolve_v4(dest_host, dest_port).await?;
        build_request(ip, dest_port, userid, None)
    };
    send_frame(socket, &frame, send_timeout).await?;

    let mut reply = [0u8; 8];
    read_reply(socket, &mut reply, deadline).await?;

    match reply[1] {
        REPLY_GRANTED => Ok(()),
        code => Err(Error::proxy(reply_failure_message(code, &reply))),
    }
}

fn build_request(ip: Ipv4Addr, port: u16, userid: &str, hostname: Option<&str>) -> Vec<u8> {
    let mut frame = Vec::with_capacity(
        10 + userid.len() + hostname.map(|h| h.len() + 1).unwrap_or(0),
    );
    frame.push(VERSION);
    frame.push(CMD_CONNECT);
    frame.extend_from_slice(&port.to_be_bytes());
    frame.extend_from_slice(&ip.octets());
    frame.extend_from_slice(userid.as_bytes());
    frame.push(0);
    if let Some(host) = hostname {
        frame.extend_from_slice(host.as_bytes());
        frame.push(0);
    }
    frame
}

/// IPv4 literal, or the first A record for the host.
async fn resolve_v4(host: &str, port: u16) -> Result<Ipv4Addr> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Ok(ip);
    }
    let addrs = lookup_host((host, port))
        .await
        .map_err(|e| Error::proxy_io(format!("DNS resolve failed: {host}"), e))?;
    for addr in addrs {
        if let std::net::IpAddr::V4(ip) = addr.ip() {
            return Ok(ip);
        }
    }
    Err(Error::proxy(format!("DNS resolve failed: {host}")))
}

fn reply_failure_message(code: u8, reply: &[u8; 8]) -> String {
    let reason = match code {
        REPLY_REJECTED => "request rejected or failed".to_string(),
        REPLY_NO_IDENTD => {
            "request rejected: SOCKS server cannot connect to identd on the client".to_string()
        }
        REPLY_IDENTD_MISMATCH => {
            "request rejected: client program and identd report different user-ids".to_string()
        }
        other => format!("unknown reply code {other}"),
    };
    let ip = Ipv4Addr::new(reply[4], reply[5], reply[6], reply[7]);
    // reported endpoint is diagnostic only; the port keeps the historical
    // low-byte-first assembly
    let port = u16::from_le_bytes([reply[2], reply[3]]);
    format!("SOCKS4 {reason} (reported endpoint {ip}:{port})")
}
