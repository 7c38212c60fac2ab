use std::sync::Arc;

use bytes::Bytes;
use http::{header, Method, Response, StatusCode, Uri, Version};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::body::{Body, BodyReader, ChunkedReader, FramedBody, LengthReader};
use crate::config::ClientConfig;
use crate::connection::{
    resolve_encoding, resolve_framing, ContentEncoding, Framing, HttpConnection, ReasonPhrase,
};
use crate::connection_pool::TunnelPools;
use crate::cookies::{CookieStore, Jar};
use crate::error::{Error, Result};

/// HTTP/1.x client that reaches every destination through the configured
/// proxy.
///
/// Requests are [`http::Request`] values with an optional [`Bytes`] body;
/// responses stream their body through [`Body`], which returns the
/// underlying tunnel to its per-destination pool once consumed.
pub struct Client {
    config: Arc<ClientConfig>,
    pools: TunnelPools,
    jar: Option<Arc<dyn CookieStore>>,
    shutdown: CancellationToken,
}

impl Client {
    /// Validates `config` and builds a client with empty pools.
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let jar = if config.use_cookies {
            Some(
                config
                    .cookie_jar
                    .clone()
                    .unwrap_or_else(|| Arc::new(Jar::new()) as Arc<dyn CookieStore>),
            )
        } else {
            None
        };
        let shutdown = CancellationToken::new();
        let config = Arc::new(config);
        Ok(Client {
            pools: TunnelPools::new(Arc::clone(&config), shutdown.child_token()),
            config,
            jar,
            shutdown,
        })
    }

    /// Sends `request` and returns the final response, following redirects
    /// when enabled.
    pub async fn send(&self, request: http::Request<Option<Bytes>>) -> Result<Response<Body>> {
        self.send_with_token(request, &CancellationToken::new())
            .await
    }

    /// As [`send`](Self::send), with a caller cancellation token that is
    /// honoured across pool waits and in-flight I/O.
    pub async fn send_with_token(
        &self,
        request: http::Request<Option<Bytes>>,
        caller: &CancellationToken,
    ) -> Result<Response<Body>> {
        let (parts, mut body) = request.into_parts();
        let mut method = parts.method;
        let mut uri = parts.uri;
        let version = parts.version;
        let headers = parts.headers;

        let mut redirects = 0u32;
        loop {
            if self.shutdown.is_cancelled() || caller.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let response = self
                .round_trip(&method, &uri, version, &headers, body.as_ref(), caller)
                .await?;
            let status = response.status().as_u16();

            let redirect = self.config.follow_redirects
                && matches!(status, 301 | 302 | 303 | 307)
                && redirects < self.config.max_redirects;
            if !redirect {
                return Ok(response);
            }
            let Some(location) = response
                .headers()
                .get(header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned)
            else {
                // a 3xx without Location is the caller's problem
                return Ok(response);
            };

            // the tunnel is only reusable once the redirect body is gone
            let (_discarded, mut redirect_body) = response.into_parts();
            redirect_body.drain().await?;

            uri = resolve_location(&uri, &location)?;
            if (status == 301 || status == 302) && method == Method::POST || status == 303 {
                if method != Method::GET {
                    debug!(%method, status, "rewriting redirected request to GET");
                    method = Method::GET;
                }
                body = None;
            }
            redirects += 1;
            debug!(%uri, redirects, status, "following redirect");
        }
    }

    /// One request/response exchange over one pooled tunnel.
    async fn round_trip(
        &self,
        method: &Method,
        uri: &Uri,
        version: Version,
        headers: &http::HeaderMap,
        body: Option<&Bytes>,
        caller: &CancellationToken,
    ) -> Result<Response<Body>> {
        let mut lease = self.pools.acquire(uri, caller).await?;
        let stream = lease.take_stream().await?;
        let mut conn = HttpConnection::new(stream);

        let jar = self.jar.as_deref();
        let exchange = async {
            conn.send_request(method, uri, version, headers, body, jar)
                .await?;
            conn.read_response_head(jar, uri).await
        };
        let head = match exchange.await {
            Ok(head) => head,
            Err(e) => {
                warn!(%uri, error = %e, "exchange failed; dropping tunnel");
                lease.mark_broken();
                return Err(e);
            }
        };

        let status = match StatusCode::from_u16(head.status) {
            Ok(status) => status,
            Err(_) => {
                lease.mark_broken();
                return Err(Error::Protocol(format!(
                    "status code {} out of range",
                    head.status
                )));
            }
        };
        let framing = match resolve_framing(&head.headers) {
            Ok(framing) => framing,
            Err(e) => {
                lease.mark_broken();
                return Err(e);
            }
        };
        let mut headers = head.headers;
        let encoding = resolve_encoding(&mut headers);

        let transport = conn.into_transport();
        let framed = match framing {
            Framing::Chunked => FramedBody::Chunked(ChunkedReader::new(transport)),
            Framing::Length(n) => FramedBody::Length(LengthReader::new(transport, n)),
            Framing::Raw => FramedBody::Raw(transport),
        };
        let reader = match encoding {
            ContentEncoding::Identity => BodyReader::identity(framed),
            ContentEncoding::Gzip => BodyReader::gzip(framed),
            ContentEncoding::Deflate => BodyReader::deflate(framed),
        };

        let mut response = Response::new(Body::new(reader, lease));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        if let Some(reason) = head.reason {
            response.extensions_mut().insert(ReasonPhrase(reason));
        }
        Ok(response)
    }

    /// Disposes every tunnel pool. In-flight requests observe cancellation;
    /// subsequent sends fail with [`Error::Cancelled`].
    pub async fn close(&self) {
        self.shutdown.cancel();
        self.pools.dispose().await;
    }
}

/// Absolute `Location` values are used as-is; relative ones resolve
/// against `<scheme>://<authority>/`.
fn resolve_location(base: &Uri, location: &str) -> Result<Uri> {
    if let Ok(absolute) = location.parse::<Uri>() {
        if absolute.scheme().is_some() {
            return Ok(absolute);
        }
    }
    let scheme = base.scheme_str().unwrap_or("http");
    let authority = base
        .authority()
        .map(|a| a.as_str())
        .ok_or_else(|| Error::Protocol("redirect base URI has no authority".into()))?;
    let path = if location.starts_with('/') {
        location.to_string()
    } else {
        format!("/{location}")
    };
    format!("{scheme}://{authority}{path}")
        .parse::<Uri>()
        .map_err(|_| Error::Protocol(format!("invalid redirect location {location:?}")))
}
