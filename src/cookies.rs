use std::fmt::Write as _;
use std::sync::Mutex;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use http::Uri;
use tracing::trace;

/// Caller-provided cookie storage.
///
/// The client feeds every `Set-Cookie` response header through
/// [`store_response_cookie`](Self::store_response_cookie) and asks
/// [`cookie_header`](Self::cookie_header) for the outbound `Cookie` header
/// value before each request.
pub trait CookieStore: Send + Sync {
    /// Records one `Set-Cookie` header value received for `uri`.
    fn store_response_cookie(&self, header: &str, uri: &Uri);

    /// `Cookie` header value for `uri`, or `None` when no cookie applies.
    fn cookie_header(&self, uri: &Uri) -> Option<String>;
}

#[derive(Debug, Clone)]
struct StoredCookie {
    name: String,
    value: String,
    domain: String,
    path: String,
    expires: Option<DateTime<Utc>>,
    secure: bool,
    http_only: bool,
    discard: bool,
    port: Option<String>,
}

impl StoredCookie {
    fn expired(&self, now: DateTime<Utc>) -> bool {
        self.expires.map(|at| at <= now).unwrap_or(false)
    }

    fn matches(&self, host: &str, path: &str, https: bool) -> bool {
        if self.domain != host {
            return false;
        }
        if self.secure && !https {
            return false;
        }
        path.starts_with(&self.path)
    }
}

#[derive(Debug, Default)]
struct ParsedCookie {
    name: String,
    value: String,
    path: Option<String>,
    expires: Option<DateTime<Utc>>,
    max_age: Option<i64>,
    secure: bool,
    http_only: bool,
    discard: bool,
    port: Option<String>,
}

impl ParsedCookie {
    /// `Expires` wins over `Max-Age`; neither means a session cookie.
    fn effective_expiry(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.expires.is_some() {
            return self.expires;
        }
        self.max_age
            .map(|seconds| now + ChronoDuration::seconds(seconds))
    }
}

/// One `Set-Cookie` value: `name=value` followed by `;`-separated
/// attributes with case-insensitive names. Returns `None` for values
/// without a `name=value` lead.
fn parse_set_cookie(header: &str) -> Option<ParsedCookie> {
    let mut segments = header.split(';');

    let first = segments.next()?.trim();
    let (name, value) = first.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }

    let mut cookie = ParsedCookie {
        name: name.to_string(),
        value: value.trim().to_string(),
        ..ParsedCookie::default()
    };

    for segment in segments {
        let segment = segment.trim();
        let (attr, attr_value) = match segment.split_once('=') {
            Some((a, v)) => (a.trim(), Some(v.trim())),
            None => (segment, None),
        };
        if attr.eq_ignore_ascii_case("expires") {
            cookie.expires = attr_value
                .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
                .map(|dt| dt.with_timezone(&Utc));
        } else if attr.eq_ignore_ascii_case("max-age") {
            cookie.max_age = attr_value.and_then(|v| v.parse::<i64>().ok());
        } else if attr.eq_ignore_ascii_case("path") {
            cookie.path = attr_value.map(str::to_string);
        } else if attr.eq_ignore_ascii_case("port") {
            cookie.port = attr_value.map(str::to_string);
        } else if attr.eq_ignore_ascii_case("discard") {
            cookie.discard = true;
        } else if attr.eq_ignore_ascii_case("secure") {
            cookie.secure = true;
        } else if attr.eq_ignore_ascii_case("httponly") {
            cookie.http_only = true;
        }
    }

    Some(cookie)
}

/// In-memory cookie jar; the default store when cookies are enabled
/// without a caller-provided one.
#[derive(Debug, Default)]
pub struct Jar {
    cookies: Mutex<Vec<StoredCookie>>,
}

impl Jar {
    pub fn new() -> Self {
        Jar::default()
    }

    pub fn len(&self) -> usize {
        let now = Utc::now();
        self.cookies
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|c| !c.expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn get(&self, name: &str, host: &str) -> Option<StoredCookie> {
        self.cookies
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.name == name && c.domain == host)
            .cloned()
    }
}

impl CookieStore for Jar {
    fn store_response_cookie(&self, header: &str, uri: &Uri) {
        let Some(parsed) = parse_set_cookie(header) else {
            trace!(header, "ignoring unparseable Set-Cookie header");
            return;
        };
        let Some(host) = uri.host() else {
            return;
        };
        let https = uri.scheme_str() == Some("https");
        let now = Utc::now();

        let path = parsed.path.clone().unwrap_or_else(|| "/".to_string());
        let expiry = parsed.effective_expiry(now);

        let mut cookies = self.cookies.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(expiry) = expiry {
            if expiry <= now {
                // an already-expired cookie evicts its predecessor instead
                // of being stored
                cookies.retain(|c| {
                    !(c.name == parsed.name && c.domain == host && c.path == path)
                });
                return;
            }
        }

        let cookie = StoredCookie {
            name: parsed.name,
            value: parsed.value,
            domain: host.to_string(),
            path,
            expires: expiry,
            // a cookie set over https is always marked secure
            secure: parsed.secure || https,
            http_only: parsed.http_only,
            discard: parsed.discard,
            port: parsed.port,
        };
        cookies.retain(|c| {
            !(c.name == cookie.name && c.domain == cookie.domain && c.path == cookie.path)
        });
        cookies.push(cookie);
    }

    fn cookie_header(&self, uri: &Uri) -> Option<String> {
        let host = uri.host()?;
        let https = uri.scheme_str() == Some("https");
        let path = uri.path();
        let now = Utc::now();

        let cookies = self.cookies.lock().unwrap_or_else(|p| p.into_inner());
        let mut header = String::new();
        for cookie in cookies.iter() {
            if cookie.expired(now) || !cookie.matches(host, path, https) {
                continue;
            }
            if !header.is_empty() {
                header.push(' ');
            }
            let _ = write!(header, "{}={};", cookie.name, cookie.value);
        }
        if header.is_empty() {
            None
        } else {
            Some(header)
        }
    }
}
