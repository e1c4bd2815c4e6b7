//! Opening handshake for both endpoint roles.
//!
//! Clients build the HTTP/1.1 Upgrade request (driven through hyper's http1
//! client) and verify the `101 Switching Protocols` response, including the
//! mandatory `Sec-WebSocket-Accept` check against the challenge key. Servers
//! come in two flavors: [`WebSocket::upgrade`] plugs into a hyper-hosted
//! service and completes through [`UpgradeFut`], while [`WebSocket::accept`]
//! runs the whole exchange directly on a raw byte stream.
//!
//! The accept key is `base64(sha1(challenge ++ GUID))` with the fixed GUID
//! from RFC 6455 §1.3; the challenge key is the base64 of 16 random bytes.

use std::{
    borrow::BorrowMut,
    future::Future,
    io,
    pin::Pin,
    sync::Arc,
    task::{ready, Context, Poll},
};

use base64::prelude::*;
use bytes::{Bytes, BytesMut};
use http_body_util::Empty;
use hyper::{body::Incoming, header, upgrade::Upgraded, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use pin_project::pin_project;
use sha1::{Digest, Sha1};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
};
use tokio_rustls::{rustls, rustls::pki_types::ServerName, TlsConnector};
use url::Url;

use crate::{
    conn::{Options, Role, WebSocket},
    stream::MaybeTlsStream,
    Result, WebSocketError,
};

/// Type alias for WebSocket connections established via [`WebSocket::connect`],
/// covering both plain TCP and TLS transports.
pub type TcpWebSocket = WebSocket<MaybeTlsStream<TcpStream>>;

/// Type alias for server-side connections obtained from an HTTP upgrade.
pub type HttpWebSocket = WebSocket<TokioIo<Upgraded>>;

/// The HTTP response a server returns to the client during the upgrade.
///
/// The body is empty; after the handshake the connection leaves HTTP
/// entirely.
pub type HttpResponse = Response<Empty<Bytes>>;

/// Fixed GUID appended to the challenge key before hashing, from
/// RFC 6455 §1.3.
const WEBSOCKET_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Upper bound on the size of an upgrade request [`WebSocket::accept`] will
/// buffer.
const MAX_REQUEST_SIZE: usize = 8 * 1024;

/// Generates a fresh challenge key: the base64 of 16 random bytes.
pub(crate) fn generate_key() -> String {
    let input: [u8; 16] = rand::random();
    BASE64_STANDARD.encode(input)
}

/// Derives the `Sec-WebSocket-Accept` value for a challenge key:
/// `base64(sha1(key ++ GUID))`.
pub fn derive_accept_key(key: &[u8]) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key);
    sha1.update(WEBSOCKET_GUID);
    BASE64_STANDARD.encode(&sha1.finalize()[..])
}

impl WebSocket<MaybeTlsStream<TcpStream>> {
    /// Establishes a WebSocket connection to the given `ws://` or `wss://`
    /// URL.
    ///
    /// Dials TCP to the URL's host and port (80 and 443 by default), wraps
    /// the stream in TLS for `wss`, and performs the upgrade handshake. Any
    /// other scheme fails with [`WebSocketError::BadUrl`].
    ///
    /// ```no_run
    /// use websock::WebSocket;
    ///
    /// #[tokio::main]
    /// async fn main() -> websock::Result<()> {
    ///     let ws = WebSocket::connect("wss://echo.websocket.org".parse()?).await?;
    ///     Ok(())
    /// }
    /// ```
    pub async fn connect(url: Url) -> Result<TcpWebSocket> {
        Self::connect_with_options(url, Options::default()).await
    }

    /// Like [`WebSocket::connect`], with explicit connection options.
    pub async fn connect_with_options(url: Url, options: Options) -> Result<TcpWebSocket> {
        let Some(host) = url.host_str().map(str::to_owned) else {
            return Err(WebSocketError::BadUrl);
        };
        let port = match url.scheme() {
            "ws" => url.port().unwrap_or(80),
            "wss" => url.port().unwrap_or(443),
            _ => return Err(WebSocketError::BadUrl),
        };

        let tcp_stream = TcpStream::connect((host.as_str(), port)).await?;

        let stream = match url.scheme() {
            "ws" => MaybeTlsStream::Plain(tcp_stream),
            _ => {
                let domain = ServerName::try_from(host)
                    .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid dnsname"))?;
                MaybeTlsStream::Tls(tls_connector().connect(domain, tcp_stream).await?)
            }
        };

        WebSocket::handshake(url, stream, options).await
    }
}

impl<S> WebSocket<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Performs the client side of the WebSocket handshake over an existing
    /// stream.
    ///
    /// Use this instead of [`WebSocket::connect`] when the connection is
    /// established by other means (a proxy, custom DNS resolution, a
    /// pre-opened socket). The URL supplies the `Host` header and request
    /// target.
    ///
    /// The server's response must carry status 101, matching `Upgrade` and
    /// `Connection` headers, and a `Sec-WebSocket-Accept` derived from the
    /// challenge key sent in the request; anything else fails the handshake.
    /// Bytes the server sent after its response remain available to the
    /// frame reader.
    pub async fn handshake(url: Url, io: S, options: Options) -> Result<WebSocket<S>> {
        let Some(host) = url.host_str() else {
            return Err(WebSocketError::BadUrl);
        };
        let host_header = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_owned(),
        };

        let key = generate_key();
        let request = Request::builder()
            .method(Method::GET)
            .uri(&url[url::Position::BeforePath..])
            .header(header::HOST, host_header.as_str())
            .header(header::UPGRADE, "websocket")
            .header(header::CONNECTION, "upgrade")
            .header(header::SEC_WEBSOCKET_KEY, key.as_str())
            .header(header::SEC_WEBSOCKET_VERSION, "13")
            .body(Empty::<Bytes>::new())
            .expect("request build");

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io)).await?;

        tokio::spawn(async move {
            if let Err(err) = conn.with_upgrades().await {
                log::error!("upgrading connection: {err:?}");
            }
        });

        let mut response = sender.send_request(request).await?;
        verify_response(&response, &key)?;

        let upgraded = hyper::upgrade::on(&mut response).await?;
        let parts = upgraded
            .downcast::<TokioIo<S>>()
            .expect("downcast to original stream");

        log::debug!("client handshake complete for {url}");

        // Whatever the server sent right behind its response is replayed to
        // the frame reader.
        Ok(WebSocket::new(
            Role::Client,
            parts.io.into_inner(),
            parts.read_buf,
            &options,
        ))
    }
}

impl<S> WebSocket<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Accepts a WebSocket connection on a raw stream: reads the client's
    /// upgrade request, validates it, and writes the `101 Switching
    /// Protocols` response.
    ///
    /// The request must be a GET with `Connection: Upgrade`,
    /// `Upgrade: websocket`, `Sec-WebSocket-Version: 13`, and a
    /// `Sec-WebSocket-Key`; a failed validation answers with an HTTP error
    /// status before returning the error. A peer that transmits data before
    /// the handshake is accepted is rejected with
    /// [`WebSocketError::DataBeforeHandshake`].
    pub async fn accept(io: S) -> Result<WebSocket<S>> {
        Self::accept_with_options(io, Options::default()).await
    }

    /// Like [`WebSocket::accept`], with explicit connection options.
    pub async fn accept_with_options(mut io: S, options: Options) -> Result<WebSocket<S>> {
        let mut buf = BytesMut::with_capacity(1024);

        let (consumed, accept) = loop {
            if io.read_buf(&mut buf).await? == 0 {
                return Err(WebSocketError::BadHandshake(
                    "connection closed during handshake",
                ));
            }

            let mut headers = [httparse::EMPTY_HEADER; 32];
            let mut request = httparse::Request::new(&mut headers);
            match request.parse(&buf) {
                Ok(httparse::Status::Complete(consumed)) => {
                    match validate_upgrade_request(&request) {
                        Ok(accept) => break (consumed, accept),
                        Err(err) => {
                            let _ = io.write_all(reject_status(&err)).await;
                            return Err(err);
                        }
                    }
                }
                Ok(httparse::Status::Partial) => {
                    if buf.len() > MAX_REQUEST_SIZE {
                        return Err(WebSocketError::BadHandshake("upgrade request too large"));
                    }
                }
                Err(_) => {
                    let _ = io
                        .write_all(b"HTTP/1.1 400 Bad Request\r\ncontent-length: 0\r\n\r\n")
                        .await;
                    return Err(WebSocketError::BadHandshake("malformed upgrade request"));
                }
            }
        };

        let response = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {accept}\r\n\r\n"
        );
        io.write_all(response.as_bytes()).await?;

        // Frames may only follow the accepted handshake.
        if buf.len() > consumed {
            return Err(WebSocketError::DataBeforeHandshake);
        }

        log::debug!("server handshake complete");

        Ok(WebSocket::new(Role::Server, io, Bytes::new(), &options))
    }
}

impl WebSocket<TokioIo<Upgraded>> {
    /// Upgrades an HTTP request served by hyper into a WebSocket connection.
    ///
    /// Validates the upgrade headers and returns the `101 Switching
    /// Protocols` response together with an [`UpgradeFut`]. The response
    /// must be sent back through the host HTTP stack; the future resolves
    /// to the server-role connection once hyper hands over the underlying
    /// stream.
    ///
    /// ```no_run
    /// use http_body_util::Empty;
    /// use hyper::{body::{Bytes, Incoming}, Request, Response};
    /// use websock::WebSocket;
    ///
    /// async fn serve(mut req: Request<Incoming>) -> websock::Result<Response<Empty<Bytes>>> {
    ///     let (response, upgrade) = WebSocket::upgrade(&mut req)?;
    ///
    ///     tokio::spawn(async move {
    ///         let mut ws = upgrade.await?;
    ///         let (opcode, payload) = ws.read_message().await?;
    ///         ws.write_message(opcode, payload).await?;
    ///         Ok::<_, websock::WebSocketError>(())
    ///     });
    ///
    ///     Ok(response)
    /// }
    /// ```
    pub fn upgrade<B>(request: impl BorrowMut<Request<B>>) -> Result<(HttpResponse, UpgradeFut)> {
        Self::upgrade_with_options(request, Options::default())
    }

    /// Like [`WebSocket::upgrade`], with explicit connection options.
    pub fn upgrade_with_options<B>(
        mut request: impl BorrowMut<Request<B>>,
        options: Options,
    ) -> Result<(HttpResponse, UpgradeFut)> {
        let request = request.borrow_mut();

        if request.method() != Method::GET {
            return Err(WebSocketError::InvalidMethod);
        }

        if !header_contains_token(request.headers(), header::CONNECTION, "upgrade") {
            return Err(WebSocketError::InvalidConnectionHeader);
        }

        if !request
            .headers()
            .get(header::UPGRADE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false)
        {
            return Err(WebSocketError::InvalidUpgradeHeader);
        }

        if request
            .headers()
            .get(header::SEC_WEBSOCKET_VERSION)
            .map(|value| value.as_bytes())
            != Some(b"13")
        {
            return Err(WebSocketError::InvalidSecWebsocketVersion);
        }

        let key = request
            .headers()
            .get(header::SEC_WEBSOCKET_KEY)
            .ok_or(WebSocketError::MissingSecWebSocketKey)?;

        let response = Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(header::CONNECTION, "upgrade")
            .header(header::UPGRADE, "websocket")
            .header(header::SEC_WEBSOCKET_ACCEPT, derive_accept_key(key.as_bytes()))
            .body(Empty::new())
            .expect("bug: failed to build response");

        let fut = UpgradeFut {
            inner: hyper::upgrade::on(request),
            options: Some(options),
        };

        Ok((response, fut))
    }
}

/// Future that completes a server-side upgrade, resolving to the WebSocket
/// connection once the host HTTP stack has sent the response and released
/// the underlying stream.
#[pin_project]
#[derive(Debug)]
pub struct UpgradeFut {
    #[pin]
    inner: hyper::upgrade::OnUpgrade,
    options: Option<Options>,
}

impl Future for UpgradeFut {
    type Output = Result<HttpWebSocket>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let upgraded = match ready!(this.inner.poll(cx)) {
            Ok(upgraded) => upgraded,
            Err(err) => return Poll::Ready(Err(err.into())),
        };

        let options = this.options.take().expect("polled after completion");

        Poll::Ready(Ok(WebSocket::new(
            Role::Server,
            TokioIo::new(upgraded),
            Bytes::new(),
            &options,
        )))
    }
}

/// Checks the client's view of the server response: status 101, matching
/// upgrade headers, and the accept key derived from our challenge.
fn verify_response(response: &Response<Incoming>, key: &str) -> Result<()> {
    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        return Err(WebSocketError::InvalidStatusCode(
            response.status().as_u16(),
        ));
    }

    let headers = response.headers();

    if !headers
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
    {
        return Err(WebSocketError::InvalidUpgradeHeader);
    }

    if !headers
        .get(header::CONNECTION)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.eq_ignore_ascii_case("upgrade"))
        .unwrap_or(false)
    {
        return Err(WebSocketError::InvalidConnectionHeader);
    }

    let expected = derive_accept_key(key.as_bytes());
    match headers
        .get(header::SEC_WEBSOCKET_ACCEPT)
        .and_then(|value| value.to_str().ok())
    {
        Some(accept) if accept == expected => Ok(()),
        _ => Err(WebSocketError::InvalidSecWebSocketAccept),
    }
}

/// True when any comma-separated token of the header equals `token`,
/// case-insensitively. `Connection` headers routinely carry several tokens,
/// e.g. `keep-alive, Upgrade`.
fn header_contains_token(
    headers: &hyper::HeaderMap,
    name: header::HeaderName,
    token: &str,
) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|part| part.trim().eq_ignore_ascii_case(token))
}

/// Validates a parsed upgrade request and derives its accept key.
fn validate_upgrade_request(request: &httparse::Request<'_, '_>) -> Result<String> {
    if request.method != Some("GET") {
        return Err(WebSocketError::InvalidMethod);
    }

    let header = |name: &str| {
        request
            .headers
            .iter()
            .find(|header| header.name.eq_ignore_ascii_case(name))
            .map(|header| header.value)
    };

    let connection_ok = header("Connection")
        .and_then(|value| std::str::from_utf8(value).ok())
        .map(|value| {
            value
                .split(',')
                .any(|part| part.trim().eq_ignore_ascii_case("upgrade"))
        })
        .unwrap_or(false);
    if !connection_ok {
        return Err(WebSocketError::InvalidConnectionHeader);
    }

    let upgrade_ok = header("Upgrade")
        .and_then(|value| std::str::from_utf8(value).ok())
        .map(|value| value.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    if !upgrade_ok {
        return Err(WebSocketError::InvalidUpgradeHeader);
    }

    if !matches!(header("Sec-WebSocket-Version"), Some(b"13")) {
        return Err(WebSocketError::InvalidSecWebsocketVersion);
    }

    let Some(key) = header("Sec-WebSocket-Key") else {
        return Err(WebSocketError::MissingSecWebSocketKey);
    };

    Ok(derive_accept_key(key))
}

/// Minimal HTTP error answer for a rejected upgrade request.
fn reject_status(err: &WebSocketError) -> &'static [u8] {
    match err {
        WebSocketError::InvalidMethod => {
            b"HTTP/1.1 405 Method Not Allowed\r\ncontent-length: 0\r\n\r\n"
        }
        _ => b"HTTP/1.1 400 Bad Request\r\ncontent-length: 0\r\n\r\n",
    }
}

/// Creates a TLS connector trusting the webpki root set, for `wss://`
/// connections.
fn tls_connector() -> TlsConnector {
    let mut root_cert_store = rustls::RootCertStore::empty();
    root_cert_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let mut config = rustls::ClientConfig::builder()
        .with_root_certificates(root_cert_store)
        .with_no_client_auth();
    config.alpn_protocols = vec!["http/1.1".into()];

    TlsConnector::from(Arc::new(config))
}
