use serde::Serialize;

pub mod metrics;

pub use metrics::{ExchangeTimer, Metrics};

/// Lifecycle of the listening proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl std::fmt::Display for ProxyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ProxyState::Stopped => "stopped",
            ProxyState::Starting => "starting",
            ProxyState::Running => "running",
            ProxyState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of the controller, recomputed on every call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyStatus {
    pub state: ProxyState,
    pub running: bool,
    /// Bound port while Running (and Stopping).
    pub port: Option<u16>,
    /// `None` means no filter.
    pub method_filter: Option<String>,
    /// Captures matching `method_filter`.
    pub capture_count: usize,
    pub intercepting: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serializes_camel_case() {
        let status = ProxyStatus {
            state: ProxyState::Running,
            running: true,
            port: Some(8080),
            method_filter: Some("GET".into()),
            capture_count: 3,
            intercepting: false,
        };

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "running");
        assert_eq!(json["methodFilter"], "GET");
        assert_eq!(json["captureCount"], 3);
    }
}
