//! Loopback origins and a tiny proxy client shared by the integration tests.
#![allow(dead_code)]

use capture_proxy::proxy::http1::{BodyFraming, BufferedConn, RequestHead, ResponseHead};
use capture_proxy::CaptureStore;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

pub const CHUNKED_RESPONSE: &[u8] =
    b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5;note=x\r\nhello\r\n6\r\n world\r\n0\r\nX-Trailer: done\r\n\r\n";

pub fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

/// Answers `<METHOD> <target>` as the body. Special targets:
/// - `/chunked`: a fixed chunked response
/// - `/echo-head`: the request head exactly as received
/// - `/close`: `Connection: close`, then hangs up
/// - `/then-close`: an ordinary response, then hangs up without notice
///
/// Otherwise keeps the connection open while the client allows it.
pub async fn serve_origin<S>(stream: S)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut conn = BufferedConn::new(stream);
    while let Ok(Some(raw)) = conn.read_head(64 * 1024).await {
        let Ok(head) = RequestHead::parse(&raw.bytes) else {
            return;
        };
        let Ok(framing) = head.framing() else {
            return;
        };
        let mut sink = tokio::io::sink();
        if conn.relay_body(&mut sink, framing).await.is_err() {
            return;
        }

        let summary = format!("{} {}", head.method, head.target);
        let (response, hang_up) = match head.target.as_str() {
            "/chunked" => (CHUNKED_RESPONSE.to_vec(), false),
            "/echo-head" => (text_response(&raw.bytes, ""), false),
            "/close" => (text_response(summary.as_bytes(), "Connection: close\r\n"), true),
            "/then-close" => (text_response(summary.as_bytes(), ""), true),
            _ => (text_response(summary.as_bytes(), ""), false),
        };
        if conn.write_all(&response).await.is_err() || conn.flush().await.is_err() {
            return;
        }
        if hang_up || !head.keep_alive() {
            let _ = conn.shutdown().await;
            return;
        }
    }
}

fn text_response(body: &[u8], extra_headers: &str) -> Vec<u8> {
    let mut response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n{extra_headers}Content-Length: {}\r\n\r\n",
        body.len()
    )
    .into_bytes();
    response.extend_from_slice(body);
    response
}

pub async fn spawn_http_origin() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve_origin(stream));
        }
    });
    addr
}

/// HTTPS origin on 127.0.0.1 with a throwaway self-signed certificate.
pub async fn spawn_https_origin() -> SocketAddr {
    let key = rcgen::KeyPair::generate().unwrap();
    let params = rcgen::CertificateParams::new(vec!["127.0.0.1".to_string()]).unwrap();
    let cert = params.self_signed(&key).unwrap();

    let config = rustls::ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(
            vec![cert.der().clone()],
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der())),
        )
        .unwrap();
    let acceptor = TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                if let Ok(tls) = acceptor.accept(stream).await {
                    serve_origin(tls).await;
                }
            });
        }
    });
    addr
}

/// Address that refuses connections.
pub async fn dead_address() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

pub struct Response {
    pub status: u16,
    pub head: Vec<u8>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Read one response whose body is Content-Length or chunked framed. The
/// chunked body is returned with its framing intact.
pub async fn read_response<S>(conn: &mut BufferedConn<S>) -> Response
where
    S: AsyncRead + Unpin,
{
    let raw = conn.read_head(64 * 1024).await.unwrap().unwrap();
    let head = ResponseHead::parse(&raw.bytes).unwrap();
    let mut body = Vec::new();
    match head.framing("GET").unwrap() {
        BodyFraming::UntilClose => {
            conn.relay_to_eof(&mut body).await.unwrap();
        }
        framing => {
            conn.relay_body(&mut body, framing).await.unwrap();
        }
    }
    Response {
        status: head.status,
        head: raw.bytes.to_vec(),
        body,
    }
}

pub async fn connect(proxy_port: u16) -> BufferedConn<TcpStream> {
    BufferedConn::new(
        TcpStream::connect(("127.0.0.1", proxy_port))
            .await
            .unwrap(),
    )
}

/// One plain-HTTP request through the proxy on a fresh connection.
pub async fn proxy_request(proxy_port: u16, method: &str, url: &str, body: &str) -> Response {
    let mut conn = connect(proxy_port).await;
    let authority = url
        .trim_start_matches("http://")
        .split('/')
        .next()
        .unwrap()
        .to_string();
    let request = format!(
        "{method} {url} HTTP/1.1\r\nHost: {authority}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    conn.write_all(request.as_bytes()).await.unwrap();
    read_response(&mut conn).await
}

/// Wait until the store holds at least `count` captures.
pub async fn wait_for_captures(store: &CaptureStore, count: usize) {
    let mut feed = store.subscribe();
    let wait = async {
        while store.count("") < count {
            feed.changed().await.unwrap();
        }
    };
    tokio::time::timeout(std::time::Duration::from_secs(10), wait)
        .await
        .expect("captures did not arrive in time");
}

pub fn trust_store_with(root: &CertificateDer<'static>) -> rustls::RootCertStore {
    let mut roots = rustls::RootCertStore::empty();
    roots.add(root.clone()).unwrap();
    roots
}
