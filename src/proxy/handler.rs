//! Per-connection proxy logic.
//!
//! A [`ConnectionHandler`] owns one accepted client connection from the first
//! byte to close. Plain `http://` requests are forwarded in origin-form over
//! a (reused where possible) upstream connection. `CONNECT` requests either
//! become an opaque byte relay or, with interception on, a pair of
//! TLS-terminated legs whose inner requests are forwarded one by one. Every
//! logical exchange, failed ones included, lands in the capture store.
//!
//! Nothing in here returns an error to the accept loop: failures end the
//! connection and are recorded on its capture.

use http::StatusCode;
use rustls::pki_types::ServerName;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info, warn};

use super::http1::{
    encode_request_head, has_header, simple_response, tunnel_origin_form, AbsoluteTarget,
    BodyFraming, BufferedConn, HeadError, RawHead, RequestHead, ResponseHead, Target,
};
use crate::capture::{CaptureStore, CapturedExchange};
use crate::config::ProxyConfig;
use crate::error::{ExchangeError, HandshakeSide};
use crate::state::{ExchangeTimer, Metrics};
use crate::tls::{CertificateAuthority, TlsConfigProvider};

/// Headers addressed to the proxy itself; not forwarded on the plain leg.
const PROXY_ONLY_HEADERS: &[&str] = &["proxy-connection", "proxy-authorization"];

const UPSTREAM_CLOSED: &str = "upstream closed the connection before responding";

/// How long a request carrying `Expect: 100-continue` waits for the origin
/// before its body is forwarded regardless.
const CONTINUE_WAIT: Duration = Duration::from_secs(1);

/// Collaborators shared by every connection of one running proxy.
pub struct HandlerContext {
    pub store: Arc<CaptureStore>,
    pub authority: Arc<CertificateAuthority>,
    pub tls: Arc<TlsConfigProvider>,
    pub metrics: Arc<Metrics>,
    settings: ProxyConfig,
    intercept_tls: AtomicBool,
}

impl HandlerContext {
    pub fn new(
        store: Arc<CaptureStore>,
        authority: Arc<CertificateAuthority>,
        tls: Arc<TlsConfigProvider>,
        metrics: Arc<Metrics>,
        settings: ProxyConfig,
    ) -> Self {
        Self {
            intercept_tls: AtomicBool::new(settings.intercept_tls),
            store,
            authority,
            tls,
            metrics,
            settings,
        }
    }

    pub fn settings(&self) -> &ProxyConfig {
        &self.settings
    }

    pub fn intercept_tls(&self) -> bool {
        self.intercept_tls.load(Ordering::Relaxed)
    }

    /// Takes effect for CONNECT requests read after the call.
    pub fn set_intercept_tls(&self, enabled: bool) {
        self.intercept_tls.store(enabled, Ordering::Relaxed);
    }
}

struct Upstream {
    target: Target,
    conn: BufferedConn<TcpStream>,
}

/// Whether each side of a finished exchange may carry another one.
struct Persistence {
    client: bool,
    upstream: bool,
}

pub struct ConnectionHandler {
    ctx: Arc<HandlerContext>,
    peer: SocketAddr,
}

impl ConnectionHandler {
    pub fn new(ctx: Arc<HandlerContext>, peer: SocketAddr) -> Self {
        Self { ctx, peer }
    }

    /// Serve `stream` until the client or the exchange ends it. Both sides
    /// are closed on return.
    pub async fn run<S>(self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        self.ctx.metrics.connection_opened();
        debug!(peer = %self.peer, "Connection accepted");

        let mut client = BufferedConn::new(stream);
        self.serve(&mut client).await;
        let _ = client.shutdown().await;

        self.ctx.metrics.connection_closed();
        debug!(peer = %self.peer, "Connection closed");
    }

    async fn serve<C>(&self, client: &mut BufferedConn<C>)
    where
        C: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut upstream: Option<Upstream> = None;

        loop {
            let raw = match self.read_request_head(client).await {
                Ok(Some(raw)) => raw,
                Ok(None) => return,
                Err(err) => {
                    let timer = self.timer(Instant::now());
                    self.reject(client, CapturedExchange::new("", "", ""), err, timer)
                        .await;
                    return;
                }
            };

            let head = match RequestHead::parse(&raw.bytes) {
                Ok(head) => head,
                Err(reason) => {
                    let timer = self.timer(raw.started);
                    let capture = CapturedExchange::new(first_token(&raw.bytes), "", "");
                    self.reject(client, capture, ExchangeError::MalformedRequest(reason), timer)
                        .await;
                    return;
                }
            };

            if head.method == "CONNECT" {
                drop(upstream.take());
                self.serve_connect(client, head, raw.started).await;
                return;
            }

            if !self.forward_plain(client, &mut upstream, head, raw.started).await {
                return;
            }
        }
    }

    async fn read_request_head<C>(
        &self,
        conn: &mut BufferedConn<C>,
    ) -> Result<Option<RawHead>, ExchangeError>
    where
        C: AsyncRead + Unpin,
    {
        let limit = self.ctx.settings.max_head_bytes;
        let window = self.ctx.settings.head_read_timeout();

        match tokio::time::timeout(window, conn.read_head(limit)).await {
            Ok(Ok(head)) => Ok(head),
            Ok(Err(HeadError::TooLarge(limit))) => Err(ExchangeError::HeadTooLarge(limit)),
            Ok(Err(HeadError::Truncated)) => Err(ExchangeError::MalformedRequest(
                "connection closed in the middle of the request head".into(),
            )),
            // Resets on an idle keep-alive connection are just closes.
            Ok(Err(HeadError::Io(_))) if conn.buffered().is_empty() => Ok(None),
            Ok(Err(HeadError::Io(err))) => Err(ExchangeError::Io(err)),
            Err(_) if conn.buffered().is_empty() => Ok(None),
            Err(_) => Err(ExchangeError::MalformedRequest(format!(
                "request head incomplete after {window:?}"
            ))),
        }
    }

    async fn forward_plain<C>(
        &self,
        client: &mut BufferedConn<C>,
        upstream: &mut Option<Upstream>,
        head: RequestHead,
        started: Instant,
    ) -> bool
    where
        C: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let timer = self.timer(started);
        let mut capture = CapturedExchange::new(head.method.clone(), "", head.target.clone());
        capture.request_header_count = head.headers.len();

        let target = match AbsoluteTarget::parse(&head.target) {
            Ok(target) => target,
            Err(reason) => {
                self.reject(client, capture, ExchangeError::MalformedRequest(reason), timer)
                    .await;
                return false;
            }
        };
        capture.target_host = target.target.host.clone();

        let framing = match head.framing() {
            Ok(framing) => framing,
            Err(reason) => {
                self.reject(client, capture, ExchangeError::MalformedRequest(reason), timer)
                    .await;
                return false;
            }
        };

        let host_header =
            (!has_header(&head.headers, "host")).then(|| target.target.url_authority(80));
        let extra: Vec<(&str, &str)> = host_header.iter().map(|h| ("Host", h.as_str())).collect();
        let encoded = encode_request_head(&head, &target.origin_form, PROXY_ONLY_HEADERS, &extra);

        let mut reused = upstream
            .as_ref()
            .is_some_and(|current| current.target == target.target);

        loop {
            if !reused {
                *upstream = None;
                match self.dial(&target.target).await {
                    Ok(stream) => {
                        *upstream = Some(Upstream {
                            target: target.target.clone(),
                            conn: BufferedConn::new(stream),
                        });
                    }
                    Err(err) => {
                        self.reject(client, capture, err, timer).await;
                        return false;
                    }
                }
            }
            let Some(current) = upstream.as_mut() else {
                return false;
            };

            let result = self
                .exchange(client, &mut current.conn, &head, &encoded, framing, &mut capture)
                .await;

            match result {
                Ok(persistence) => {
                    if !persistence.upstream {
                        *upstream = None;
                    }
                    self.record(capture, timer, None);
                    return persistence.client;
                }
                Err(err)
                    if reused
                        && framing == BodyFraming::None
                        && capture.response_status_code == 0
                        && is_stale_upstream(&err) =>
                {
                    debug!(upstream = %target.target, error = %err, "Reused upstream connection was stale; redialing");
                    reused = false;
                }
                Err(err) => {
                    *upstream = None;
                    self.fail_exchange(client, capture, err, timer).await;
                    return false;
                }
            }
        }
    }

    async fn serve_connect<C>(&self, client: &mut BufferedConn<C>, head: RequestHead, started: Instant)
    where
        C: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let timer = self.timer(started);
        let mut capture = CapturedExchange::new("CONNECT", "", head.target.clone());
        capture.request_header_count = head.headers.len();

        let target = match Target::parse_authority(&head.target, 443) {
            Ok(target) => target,
            Err(reason) => {
                self.reject(client, capture, ExchangeError::MalformedRequest(reason), timer)
                    .await;
                return;
            }
        };
        capture.target_host = target.host.clone();
        capture.url = target.to_string();

        let upstream = match self.dial(&target).await {
            Ok(stream) => stream,
            Err(err) => {
                self.reject(client, capture, err, timer).await;
                return;
            }
        };

        let established = async {
            client
                .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                .await?;
            client.flush().await
        };
        if let Err(err) = established.await {
            self.record(capture, timer, Some(&ExchangeError::Io(err)));
            return;
        }
        capture.response_status_code = 200;

        if self.ctx.intercept_tls() {
            self.intercept(client, upstream, target, capture, timer).await;
        } else {
            self.tunnel(client, upstream, target, capture, timer).await;
        }
    }

    /// Opaque relay: one capture for the whole tunnel, with byte counts.
    async fn tunnel<C>(
        &self,
        client: &mut BufferedConn<C>,
        mut upstream: TcpStream,
        target: Target,
        mut capture: CapturedExchange,
        timer: ExchangeTimer,
    ) where
        C: AsyncRead + AsyncWrite + Unpin + Send,
    {
        self.ctx.metrics.record_tunnel(false);
        info!(peer = %self.peer, upstream = %target, "Relaying opaque tunnel");

        let mut sent = 0u64;
        let mut received = 0u64;
        let outcome = {
            let (client_read, client_write) = tokio::io::split(client);
            let (upstream_read, upstream_write) = upstream.split();
            let forward = pump(client_read, upstream_write, &mut sent);
            let backward = pump(upstream_read, client_write, &mut received);
            tokio::pin!(forward, backward);

            // A clean EOF half-closes; the other direction keeps going. Any
            // error ends both.
            tokio::select! {
                done = &mut forward => match done {
                    Ok(()) => backward.await,
                    Err(err) => Err(err),
                },
                done = &mut backward => match done {
                    Ok(()) => forward.await,
                    Err(err) => Err(err),
                },
            }
        };

        capture.request_body_size = sent;
        capture.response_body_size = received;
        match outcome {
            // Browsers usually end tunnels with a reset.
            Err(err) if sent + received > 0 && is_abortive_close(&err) => {
                debug!(peer = %self.peer, upstream = %target, error = %err, "Tunnel closed abortively");
                self.record(capture, timer, None);
            }
            Err(err) => self.record(capture, timer, Some(&ExchangeError::Io(err))),
            Ok(()) => self.record(capture, timer, None),
        }
    }

    /// Terminate TLS on both legs and forward the decrypted exchanges.
    async fn intercept<C>(
        &self,
        client: &mut BufferedConn<C>,
        upstream: TcpStream,
        target: Target,
        capture: CapturedExchange,
        timer: ExchangeTimer,
    ) where
        C: AsyncRead + AsyncWrite + Unpin + Send,
    {
        self.ctx.metrics.record_tunnel(true);
        let handshake_window = self.ctx.settings.head_read_timeout();

        let leaf = match self.ctx.authority.leaf_for(&target.host).await {
            Ok(leaf) => leaf,
            Err(err) => {
                self.record(capture, timer, Some(&ExchangeError::CertificateMint(err)));
                return;
            }
        };

        let acceptor = TlsAcceptor::from(leaf.server_config());
        let tls_client =
            match tokio::time::timeout(handshake_window, acceptor.accept(&mut *client)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(err)) => {
                    let err = handshake_error(HandshakeSide::Client, err.to_string());
                    self.record(capture, timer, Some(&err));
                    return;
                }
                Err(_) => {
                    let err = handshake_error(HandshakeSide::Client, "timed out".into());
                    self.record(capture, timer, Some(&err));
                    return;
                }
            };
        let mut tls_client = BufferedConn::new(tls_client);

        let upstream = match self.connect_upstream_tls(&target, upstream).await {
            Ok(stream) => stream,
            Err(err) => {
                let _ = tls_client
                    .write_all(&simple_response(StatusCode::BAD_GATEWAY, &err.to_string()))
                    .await;
                let _ = tls_client.shutdown().await;
                self.record(capture, timer, Some(&err));
                return;
            }
        };
        let mut tls_upstream = BufferedConn::new(upstream);

        info!(peer = %self.peer, upstream = %target, "Intercepting TLS tunnel");
        // The CONNECT itself is not recorded; its decrypted requests are.
        drop(timer);

        // `reused`: the upstream session already carried an exchange.
        // `upstream_open`: the last response allowed another one on it.
        let mut reused = false;
        let mut upstream_open = true;

        loop {
            let raw = match self.read_request_head(&mut tls_client).await {
                Ok(Some(raw)) => raw,
                Ok(None) => break,
                Err(err) => {
                    let capture = self.tunnel_capture("", &target, "");
                    let timer = self.timer(Instant::now());
                    self.reject(&mut tls_client, capture, err, timer).await;
                    break;
                }
            };
            let timer = self.timer(raw.started);

            let head = match RequestHead::parse(&raw.bytes) {
                Ok(head) => head,
                Err(reason) => {
                    let capture = self.tunnel_capture(&first_token(&raw.bytes), &target, "");
                    self.reject(&mut tls_client, capture, ExchangeError::MalformedRequest(reason), timer)
                        .await;
                    break;
                }
            };

            let mut capture = self.tunnel_capture(&head.method, &target, &head.target);
            capture.request_header_count = head.headers.len();

            let prepared = tunnel_origin_form(&head.target).and_then(|origin| {
                if head.method == "CONNECT" {
                    return Err("CONNECT inside an intercepted tunnel".to_string());
                }
                head.framing().map(|framing| (origin, framing))
            });
            let (origin, framing) = match prepared {
                Ok(prepared) => prepared,
                Err(reason) => {
                    self.reject(&mut tls_client, capture, ExchangeError::MalformedRequest(reason), timer)
                        .await;
                    break;
                }
            };
            capture.url = format!("https://{}{}", target.url_authority(443), origin);

            let host_header =
                (!has_header(&head.headers, "host")).then(|| target.url_authority(443));
            let extra: Vec<(&str, &str)> =
                host_header.iter().map(|h| ("Host", h.as_str())).collect();
            let encoded = encode_request_head(&head, &origin, &[], &extra);

            if !upstream_open {
                match self.redial_upstream_tls(&target).await {
                    Ok(fresh) => {
                        tls_upstream = BufferedConn::new(fresh);
                        reused = false;
                        upstream_open = true;
                    }
                    Err(err) => {
                        self.fail_exchange(&mut tls_client, capture, err, timer).await;
                        break;
                    }
                }
            }

            let result = loop {
                let result = self
                    .exchange(&mut tls_client, &mut tls_upstream, &head, &encoded, framing, &mut capture)
                    .await;
                let stale = reused
                    && framing == BodyFraming::None
                    && capture.response_status_code == 0
                    && matches!(&result, Err(err) if is_stale_upstream(err));
                if !stale {
                    break result;
                }

                debug!(upstream = %target, "Reused upstream TLS session was stale; redialing");
                match self.redial_upstream_tls(&target).await {
                    Ok(fresh) => {
                        tls_upstream = BufferedConn::new(fresh);
                        reused = false;
                    }
                    Err(err) => break Err(err),
                }
            };
            reused = true;

            match result {
                Ok(persistence) => {
                    self.record(capture, timer, None);
                    if !persistence.client {
                        break;
                    }
                    upstream_open = persistence.upstream;
                }
                Err(err) => {
                    self.fail_exchange(&mut tls_client, capture, err, timer).await;
                    break;
                }
            }
        }

        let _ = tls_client.shutdown().await;
        let _ = tls_upstream.shutdown().await;
    }

    async fn redial_upstream_tls(
        &self,
        target: &Target,
    ) -> Result<tokio_rustls::client::TlsStream<TcpStream>, ExchangeError> {
        let stream = self.dial(target).await?;
        self.connect_upstream_tls(target, stream).await
    }

    async fn connect_upstream_tls(
        &self,
        target: &Target,
        upstream: TcpStream,
    ) -> Result<tokio_rustls::client::TlsStream<TcpStream>, ExchangeError> {
        let server_name = ServerName::try_from(target.host.clone())
            .map_err(|e| handshake_error(HandshakeSide::Upstream, e.to_string()))?;
        let connector = TlsConnector::from(self.ctx.tls.proxy_upstream_config());
        let window = self.ctx.settings.head_read_timeout();

        match tokio::time::timeout(window, connector.connect(server_name, upstream)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(err)) => Err(handshake_error(HandshakeSide::Upstream, err.to_string())),
            Err(_) => Err(handshake_error(HandshakeSide::Upstream, "timed out".into())),
        }
    }

    /// Relay one request and its response. `capture` is filled in as the
    /// exchange progresses, so on error it still reflects how far it got.
    async fn exchange<C, U>(
        &self,
        client: &mut BufferedConn<C>,
        upstream: &mut BufferedConn<U>,
        head: &RequestHead,
        encoded_head: &[u8],
        framing: BodyFraming,
        capture: &mut CapturedExchange,
    ) -> Result<Persistence, ExchangeError>
    where
        C: AsyncRead + AsyncWrite + Unpin + Send,
        U: AsyncRead + AsyncWrite + Unpin + Send,
    {
        upstream.write_all(encoded_head).await?;

        // With `Expect: 100-continue` the client holds its body back until
        // the origin answers, so the origin has to be heard first.
        let mut early_final = None;
        if framing != BodyFraming::None && expects_continue(head) {
            upstream.flush().await?;
            let wait = tokio::time::sleep(CONTINUE_WAIT);
            tokio::pin!(wait);
            loop {
                let (raw, response) = tokio::select! {
                    next = self.read_response_head(upstream) => next?,
                    // Origin ignores the expectation; send the body anyway.
                    _ = &mut wait => break,
                };
                if response.is_interim() {
                    client.write_all(&raw.bytes).await?;
                    client.flush().await?;
                    if response.status == 100 {
                        break;
                    }
                    continue;
                }
                early_final = Some((raw, response));
                break;
            }
        }

        // A final answer before the body means the body is never sent, and
        // neither side can be reused with it still pending on the client.
        let body_skipped = early_final.is_some();
        if !body_skipped {
            capture.request_body_size = client.relay_body(upstream, framing).await?;
            upstream.flush().await?;
        }

        loop {
            let (raw, response) = match early_final.take() {
                Some(early) => early,
                None => self.read_response_head(upstream).await?,
            };

            if response.is_interim() {
                client.write_all(&raw.bytes).await?;
                client.flush().await?;
                continue;
            }

            if response.status == 101 {
                capture.response_status_code = 101;
                capture.response_header_count = response.headers.len();
                client.write_all(&raw.bytes).await?;
                client.flush().await?;
                let (sent, received) = tokio::io::copy_bidirectional(client, upstream).await?;
                capture.request_body_size += sent;
                capture.response_body_size = received;
                return Ok(Persistence {
                    client: false,
                    upstream: false,
                });
            }

            let response_framing = response
                .framing(&head.method)
                .map_err(ExchangeError::MalformedResponse)?;

            capture.response_status_code = response.status;
            capture.response_header_count = response.headers.len();
            client.write_all(&raw.bytes).await?;
            capture.response_body_size = upstream.relay_body(client, response_framing).await?;
            client.flush().await?;

            let delimited = response_framing != BodyFraming::UntilClose && !body_skipped;
            return Ok(Persistence {
                client: delimited && head.keep_alive(),
                upstream: delimited && response.keep_alive(),
            });
        }
    }

    async fn read_response_head<U>(
        &self,
        upstream: &mut BufferedConn<U>,
    ) -> Result<(RawHead, ResponseHead), ExchangeError>
    where
        U: AsyncRead + Unpin,
    {
        let raw = match upstream.read_head(self.ctx.settings.max_head_bytes).await {
            Ok(Some(raw)) => raw,
            Ok(None) | Err(HeadError::Truncated) => {
                return Err(ExchangeError::MalformedResponse(UPSTREAM_CLOSED.into()))
            }
            Err(HeadError::TooLarge(limit)) => {
                return Err(ExchangeError::MalformedResponse(format!(
                    "response head exceeds {limit} bytes"
                )))
            }
            Err(HeadError::Io(err)) => return Err(err.into()),
        };
        let response = ResponseHead::parse(&raw.bytes).map_err(ExchangeError::MalformedResponse)?;
        Ok((raw, response))
    }

    async fn dial(&self, target: &Target) -> Result<TcpStream, ExchangeError> {
        let window = self.ctx.settings.upstream_connect_timeout();
        let connect = TcpStream::connect((target.host.as_str(), target.port));

        let stream = match tokio::time::timeout(window, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => return Err(upstream_error(target, err.to_string())),
            Err(_) => return Err(upstream_error(target, format!("timed out after {window:?}"))),
        };
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }

    /// Best-effort error response, then a capture of the failure.
    async fn reject<C>(
        &self,
        client: &mut BufferedConn<C>,
        capture: CapturedExchange,
        err: ExchangeError,
        timer: ExchangeTimer,
    ) where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        if let Some(status) = err.client_status() {
            let _ = client
                .write_all(&simple_response(status, &err.to_string()))
                .await;
            let _ = client.flush().await;
        }
        self.record(capture, timer, Some(&err));
    }

    /// Like [`reject`](Self::reject), but only answers the client if no part
    /// of the real response reached it yet.
    async fn fail_exchange<C>(
        &self,
        client: &mut BufferedConn<C>,
        capture: CapturedExchange,
        err: ExchangeError,
        timer: ExchangeTimer,
    ) where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        if capture.response_status_code == 0 {
            let status = err.client_status().unwrap_or(StatusCode::BAD_GATEWAY);
            let _ = client
                .write_all(&simple_response(status, &err.to_string()))
                .await;
            let _ = client.flush().await;
        }
        self.record(capture, timer, Some(&err));
    }

    fn record(&self, mut capture: CapturedExchange, timer: ExchangeTimer, err: Option<&ExchangeError>) {
        match err {
            Some(err) => {
                capture.duration = timer.fail();
                capture.error = Some(err.to_string());
                // Decryption never completed, whatever the tunnel was meant to be.
                if matches!(
                    err,
                    ExchangeError::TlsHandshake { .. } | ExchangeError::CertificateMint(_)
                ) {
                    capture.intercepted = false;
                }
                warn!(
                    peer = %self.peer,
                    method = %capture.method,
                    url = %capture.url,
                    error = %err,
                    "Exchange failed"
                );
            }
            None => {
                capture.duration = timer.finish();
                debug!(
                    peer = %self.peer,
                    method = %capture.method,
                    url = %capture.url,
                    status = capture.response_status_code,
                    duration_ms = capture.duration.as_millis() as u64,
                    "Exchange captured"
                );
            }
        }
        self.ctx.store.add(capture);
    }

    fn timer(&self, started: Instant) -> ExchangeTimer {
        ExchangeTimer::started_at(Arc::clone(&self.ctx.metrics), started)
    }

    fn tunnel_capture(&self, method: &str, target: &Target, request_target: &str) -> CapturedExchange {
        let url = format!("https://{}{}", target.url_authority(443), request_target);
        let mut capture = CapturedExchange::new(method, target.host.clone(), url);
        capture.intercepted = true;
        capture
    }
}

fn handshake_error(side: HandshakeSide, reason: String) -> ExchangeError {
    ExchangeError::TlsHandshake { side, reason }
}

fn upstream_error(target: &Target, reason: String) -> ExchangeError {
    ExchangeError::UpstreamConnect {
        authority: target.to_string(),
        reason,
    }
}

/// Copy `src` to `dst` until EOF, then shut `dst` down. `count` tracks
/// bytes delivered so far, whatever the outcome.
async fn pump<R, W>(mut src: R, mut dst: W, count: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            return dst.shutdown().await;
        }
        dst.write_all(&buf[..n]).await?;
        dst.flush().await?;
        *count += n as u64;
    }
}

fn is_abortive_close(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

fn is_stale_upstream(err: &ExchangeError) -> bool {
    match err {
        ExchangeError::MalformedResponse(reason) => reason == UPSTREAM_CLOSED,
        ExchangeError::Io(err) => is_abortive_close(err),
        _ => false,
    }
}

fn expects_continue(head: &RequestHead) -> bool {
    head.header("expect")
        .is_some_and(|value| value.eq_ignore_ascii_case("100-continue"))
}

/// Method-looking prefix of an unparseable head, for the capture list.
fn first_token(raw: &[u8]) -> String {
    raw.iter()
        .take_while(|b| b.is_ascii_alphabetic())
        .take(16)
        .map(|b| *b as char)
        .collect()
}
