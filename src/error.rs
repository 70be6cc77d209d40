use std::io;
use std::net::SocketAddr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Failed to bind proxy listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Environment variable error: {0}")]
    EnvVar(String),
}

#[derive(Error, Debug)]
pub enum TlsError {
    #[error("Invalid TLS material: {0}")]
    InvalidMaterial(String),

    #[error("Failed to mint certificate for {host}: {reason}")]
    CertificateMint { host: String, reason: String },

    #[error("TLS configuration rejected: {0}")]
    Config(#[from] rustls::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl TlsError {
    pub(crate) fn mint(host: &str, reason: impl ToString) -> Self {
        TlsError::CertificateMint {
            host: host.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Which leg of an intercepted tunnel failed its handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeSide {
    Client,
    Upstream,
}

impl std::fmt::Display for HandshakeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandshakeSide::Client => f.write_str("client"),
            HandshakeSide::Upstream => f.write_str("upstream"),
        }
    }
}

/// Failures scoped to a single proxied connection. These never reach the
/// controller; they end the connection and are recorded on its capture.
#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Request head exceeds {0} bytes")]
    HeadTooLarge(usize),

    #[error("Upstream {authority} unreachable: {reason}")]
    UpstreamConnect { authority: String, reason: String },

    #[error("TLS handshake with {side} failed: {reason}")]
    TlsHandshake { side: HandshakeSide, reason: String },

    #[error(transparent)]
    CertificateMint(TlsError),

    #[error("Malformed upstream response: {0}")]
    MalformedResponse(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl ExchangeError {
    /// Status line for the synthetic response sent to the client, if any
    /// can still be written.
    pub fn client_status(&self) -> Option<http::StatusCode> {
        match self {
            ExchangeError::MalformedRequest(_) => Some(http::StatusCode::BAD_REQUEST),
            ExchangeError::HeadTooLarge(_) => {
                Some(http::StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE)
            }
            ExchangeError::UpstreamConnect { .. } => Some(http::StatusCode::BAD_GATEWAY),
            ExchangeError::MalformedResponse(_) => Some(http::StatusCode::BAD_GATEWAY),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
