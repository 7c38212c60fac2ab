use bytes::Bytes;
use http::header::{CONTENT_LENGTH, HOST, SET_COOKIE, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Method, Uri, Version};
use tokio::io::AsyncWriteExt;
use tracing::{debug, trace};

use crate::cookies::CookieStore;
use crate::error::{Error, Result};
use crate::stream::{BufferedReadStream, MaybeTlsStream};

/// Reason phrase of the response status line, kept in the response
/// extensions since the status code alone does not carry it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReasonPhrase(pub String);

/// Parsed response head.
pub(crate) struct ResponseHead {
    pub(crate) status: u16,
    pub(crate) reason: Option<String>,
    pub(crate) headers: HeaderMap,
}

/// Body framing announced by the response headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Framing {
    Chunked,
    Length(u64),
    /// Neither chunked nor length-framed: the rest of the connection.
    Raw,
}

/// Content encodings undone transparently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ContentEncoding {
    Identity,
    Gzip,
    Deflate,
}

/// One HTTP/1.x request/response exchange over a tunnelled transport.
pub(crate) struct HttpConnection {
    transport: BufferedReadStream<MaybeTlsStream>,
}

impl HttpConnection {
    pub(crate) fn new(stream: MaybeTlsStream) -> Self {
        HttpConnection {
            transport: BufferedReadStream::new(stream),
        }
    }

    pub(crate) fn into_transport(self) -> BufferedReadStream<MaybeTlsStream> {
        self.transport
    }

    /// Serializes and writes the request head and body.
    pub(crate) async fn send_request(
        &mut self,
        method: &Method,
        uri: &Uri,
        version: Version,
        headers: &HeaderMap,
        body: Option<&Bytes>,
        jar: Option<&dyn CookieStore>,
    ) -> Result<()> {
        let head = serialize_request(method, uri, version, headers, body, jar)?;
        trace!(bytes = head.len(), %method, %uri, "writing request head");
        self.transport.write_all(&head).await?;
        if let Some(body) = body {
            self.transport.write_all(body).await?;
        }
        self.transport.flush().await?;
        Ok(())
    }

    /// Reads the status line and header block.
    ///
    /// `Set-Cookie` headers are fed to the jar when one is attached instead
    /// of landing in the response headers.
    pub(crate) async fn read_response_head(
        &mut self,
        jar: Option<&dyn CookieStore>,
        uri: &Uri,
    ) -> Result<ResponseHead> {
        let status_line = self.transport.read_line().await?;
        let (status, reason) = parse_status_line(&status_line)?;
        debug!(status, "response status received");

        let mut headers = HeaderMap::new();
        loop {
            let line = self.transport.read_line().await?;
            if line.is_empty() {
                break;
            }
            let (name, value) = parse_header_line(&line)?;
            if let Some(jar) = jar {
                if name.eq_ignore_ascii_case(SET_COOKIE.as_str()) {
                    jar.store_response_cookie(value, uri);
                    continue;
                }
            }
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| Error::Protocol(format!("invalid header line {line:?}")))?;
            let header_value = HeaderValue::from_str(value)
                .map_err(|_| Error::Protocol(format!("invalid header line {line:?}")))?;
            headers.append(header_name, header_value);
        }

        Ok(ResponseHead {
            status,
            reason,
            headers,
        })
    }
}

fn version_token(version: Version) -> Result<&'static str> {
    if version == Version::HTTP_10 {
        Ok("1.0")
    } else if version == Version::HTTP_11 {
        Ok("1.1")
    } else {
        Err(Error::Config(format!(
            "only HTTP/1.x requests can be tunnelled, got {version:?}"
        )))
    }
}

/// Request head and content headers as wire bytes.
fn serialize_request(
    method: &Method,
    uri: &Uri,
    version: Version,
    headers: &HeaderMap,
    body: Option<&Bytes>,
    jar: Option<&dyn CookieStore>,
) -> Result<Vec<u8>> {
    let path = match uri.path_and_query() {
        Some(pq) if !pq.as_str().is_empty() => pq.as_str(),
        _ => "/",
    };
    let version = version_token(version)?;

    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(method.as_str().as_bytes());
    out.push(b' ');
    out.extend_from_slice(path.as_bytes());
    out.extend_from_slice(b" HTTP/");
    out.extend_from_slice(version.as_bytes());
    out.extend_from_slice(b"\r\n");

    if !headers.contains_key(HOST) {
        let authority = uri
            .authority()
            .ok_or_else(|| Error::Config("request URI has no authority".into()))?;
        out.extend_from_slice(b"Host: ");
        out.extend_from_slice(authority.as_str().as_bytes());
        out.extend_from_slice(b"\r\n");
    }

    // one line per value for multi-valued headers
    for (name, value) in headers.iter() {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }

    if let Some(body) = body {
        if !headers.contains_key(CONTENT_LENGTH) {
            out.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
        }
    }

    if let Some(jar) = jar {
        if let Some(cookie_header) = jar.cookie_header(uri) {
            out.extend_from_slice(b"Cookie: ");
            out.extend_from_slice(cookie_header.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
    }

    out.extend_from_slice(b"\r\n");
    Ok(out)
}

/// Splits `HTTP/<v> <code> [<reason>]` on spaces into at most three parts;
/// two are required and the code must be a decimal integer.
fn parse_status_line(line: &str) -> Result<(u16, Option<String>)> {
    let mut parts = line.splitn(3, ' ');
    let version = parts.next().unwrap_or("");
    let code = parts
        .next()
        .ok_or_else(|| Error::Protocol(format!("malformed status line {line:?}")))?;
    if version.is_empty() || code.is_empty() {
        return Err(Error::Protocol(format!("malformed status line {line:?}")));
    }
    let status = code
        .parse::<u16>()
        .map_err(|_| Error::Protocol(format!("invalid status code in {line:?}")))?;
    let reason = parts.next().map(str::to_owned);
    Ok((status, reason))
}

/// Splits a header line at the first colon. The value starts after the
/// colon with leading spaces and tabs removed, so both `Name: value` and
/// `Name:value` parse to the same thing.
fn parse_header_line(line: &str) -> Result<(&str, &str)> {
    let colon = line
        .find(':')
        .ok_or_else(|| Error::Protocol(format!("invalid header line {line:?}")))?;
    let name = &line[..colon];
    if name.is_empty() {
        return Err(Error::Protocol(format!("invalid header line {line:?}")));
    }
    let value = line[colon + 1..].trim_start_matches([' ', '\t']);
    Ok((name, value))
}

/// Picks the body framing: chunked wins, then content-length, then the raw
/// remainder of the connection.
pub(crate) fn resolve_framing(headers: &HeaderMap) -> Result<Framing> {
    let chunked = headers.get_all(TRANSFER_ENCODING).iter().any(|value| {
        value
            .to_str()
            .map(|s| s.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false)
    });
    if chunked {
        return Ok(Framing::Chunked);
    }
    if let Some(value) = headers.get(CONTENT_LENGTH) {
        let length = value
            .to_str()
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .ok_or_else(|| Error::Protocol(format!("invalid Content-Length {value:?}")))?;
        return Ok(Framing::Length(length));
    }
    Ok(Framing::Raw)
}

/// Recognises `gzip` and `deflate` content encodings (case-insensitively)
/// and strips the header for a recognised one, since the returned body is
/// already decoded.
pub(crate) fn resolve_encoding(headers: &mut HeaderMap) -> ContentEncoding {
    let encoding = headers
        .get(http::header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_ascii_lowercase());
    match encoding.as_deref() {
        Some("gzip") => {
            headers.remove(http::header::CONTENT_ENCODING);
            ContentEncoding::Gzip
        }
        Some("deflate") => {
            headers.remove(http::header::CONTENT_ENCODING);
            ContentEncoding::Deflate
        }
        _ => ContentEncoding::Identity,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cookies::Jar;

    fn serialize(
        method: &Method,
        uri: &str,
        headers: &HeaderMap,
        body: Option<&Bytes>,
        jar: Option<&dyn CookieStore>,
    ) -> String {
        let uri: Uri = uri.parse().unwrap();
        let bytes =
            serialize_request(method, &uri, Version::HTTP_11, headers, body, jar).unwrap();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn test_serialize_get() {
        let out = serialize(
            &Method::GET,
            "http://example.com/a?x=1",
            &HeaderMap::new(),
            None,
            None,
        );
        assert_eq!(
            out,
            "GET /a?x=1 HTTP/1.1\r\nHost: example.com\r\n\r\n"
        );
    }

    #[test]
    fn test_serialize_respects_existing_host() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("override.example"));
        let out = serialize(&Method::GET, "http://example.com/", &headers, None, None);
        assert!(out.contains("Host: override.example\r\n"));
        assert!(!out.contains("Host: example.com"));
    }

    #[test]
    fn test_serialize_body_content_length() {
        let body = Bytes::from_static(b"payload");
        let out = serialize(
            &Method::POST,
            "http://example.com/submit",
            &HeaderMap::new(),
            Some(&body),
            None,
        );
        assert!(out.contains("Content-Length: 7\r\n"), "{out}");
        assert!(out.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_serialize_keeps_caller_content_length() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("7"));
        let body = Bytes::from_static(b"payload");
        let out = serialize(
            &Method::POST,
            "http://example.com/",
            &headers,
            Some(&body),
            None,
        );
        assert_eq!(out.matches("Content-Length").count(), 1);
    }

    #[test]
    fn test_serialize_multi_value_headers() {
        let mut headers = HeaderMap::new();
        headers.append("accept", HeaderValue::from_static("text/html"));
        headers.append("accept", HeaderValue::from_static("application/json"));
        let out = serialize(&Method::GET, "http://example.com/", &headers, None, None);
        assert!(out.contains("accept: text/html\r\n"));
        assert!(out.contains("accept: application/json\r\n"));
    }

    #[test]
    fn test_serialize_cookie_header() {
        let jar = Jar::new();
        let uri: Uri = "http://example.com/".parse().unwrap();
        jar.store_response_cookie("a=1", &uri);
        jar.store_response_cookie("b=2", &uri);
        let out = serialize(&Method::GET, "http://example.com/", &HeaderMap::new(), None, Some(&jar));
        assert!(out.contains("Cookie: a=1; b=2;\r\n"), "{out}");
    }

    #[test]
    fn test_status_line_parsing() {
        assert_eq!(
            parse_status_line("HTTP/1.1 200 OK").unwrap(),
            (200, Some("OK".to_string()))
        );
        assert_eq!(
            parse_status_line("HTTP/1.1 404 Not Found").unwrap(),
            (404, Some("Not Found".to_string()))
        );
        assert_eq!(parse_status_line("HTTP/1.1 204").unwrap(), (204, None));
        assert!(parse_status_line("HTTP/1.1").is_err());
        assert!(parse_status_line("HTTP/1.1 two00 OK").is_err());
        assert!(parse_status_line("").is_err());
    }

    #[test]
    fn test_header_line_parsing() {
        assert_eq!(
            parse_header_line("Content-Type: text/html").unwrap(),
            ("Content-Type", "text/html")
        );
        // no space after the colon parses to the same value
        assert_eq!(
            parse_header_line("Content-Type:text/html").unwrap(),
            ("Content-Type", "text/html")
        );
        // a colon inside the value stays intact
        assert_eq!(
            parse_header_line("Location: http://h/b").unwrap(),
            ("Location", "http://h/b")
        );
        assert!(parse_header_line("no colon here").is_err());
        assert!(parse_header_line(": empty name").is_err());
    }

    #[test]
    fn test_resolve_framing() {
        let mut headers = HeaderMap::new();
        assert_eq!(resolve_framing(&headers).unwrap(), Framing::Raw);

        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("42"));
        assert_eq!(resolve_framing(&headers).unwrap(), Framing::Length(42));

        // chunked wins over content-length
        headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("Chunked"));
        assert_eq!(resolve_framing(&headers).unwrap(), Framing::Chunked);

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("nope"));
        assert!(resolve_framing(&headers).is_err());
    }

    #[test]
    fn test_resolve_encoding_strips_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::CONTENT_ENCODING,
            HeaderValue::from_static("GZIP"),
        );
        assert_eq!(resolve_encoding(&mut headers), ContentEncoding::Gzip);
        assert!(headers.get(http::header::CONTENT_ENCODING).is_none());

        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::CONTENT_ENCODING,
            HeaderValue::from_static("deflate"),
        );
        assert_eq!(resolve_encoding(&mut headers), ContentEncoding::Deflate);

        // unknown encodings are left alone for the caller to see
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::CONTENT_ENCODING,
            HeaderValue::from_static("br"),
        );
        assert_eq!(resolve_encoding(&mut headers), ContentEncoding::Identity);
        assert!(headers.get(http::header::CONTENT_ENCODING).is_some());
    }
}
