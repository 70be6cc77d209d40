use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use crate::tls::TlsClientConfig;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub authority: AuthorityConfig,
    #[serde(default)]
    pub tls: TlsClientConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    #[serde(default = "default_proxy_host")]
    pub host: String,
    /// 0 lets the OS pick an ephemeral port.
    #[serde(default)]
    pub port: u16,
    #[serde(default = "default_max_captures")]
    pub max_captures: usize,
    /// Decrypt CONNECT tunnels with a per-host leaf certificate instead of
    /// relaying them opaquely.
    #[serde(default)]
    pub intercept_tls: bool,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,
    #[serde(default = "default_head_read_timeout")]
    pub head_read_timeout_ms: u64,
    #[serde(default = "default_upstream_connect_timeout")]
    pub upstream_connect_timeout_ms: u64,
    #[serde(default = "default_max_head_bytes")]
    pub max_head_bytes: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorityConfig {
    #[serde(default = "default_common_name")]
    pub common_name: String,
    #[serde(default = "default_organization")]
    pub organization: String,
    #[serde(default = "default_root_validity_days")]
    pub root_validity_days: u32,
    #[serde(default = "default_leaf_validity_days")]
    pub leaf_validity_days: u32,
}

// Default value functions
fn default_proxy_host() -> String {
    "127.0.0.1".to_string()
}

fn default_max_captures() -> usize {
    10_000
}

fn default_shutdown_grace() -> u64 {
    3000
}

fn default_head_read_timeout() -> u64 {
    10_000
}

fn default_upstream_connect_timeout() -> u64 {
    10_000
}

fn default_max_head_bytes() -> usize {
    64 * 1024
}

fn default_common_name() -> String {
    "Capture Proxy Root CA".to_string()
}

fn default_organization() -> String {
    "Capture Proxy".to_string()
}

fn default_root_validity_days() -> u32 {
    365
}

fn default_leaf_validity_days() -> u32 {
    7
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: default_proxy_host(),
            port: 0,
            max_captures: default_max_captures(),
            intercept_tls: false,
            shutdown_grace_ms: default_shutdown_grace(),
            head_read_timeout_ms: default_head_read_timeout(),
            upstream_connect_timeout_ms: default_upstream_connect_timeout(),
            max_head_bytes: default_max_head_bytes(),
        }
    }
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            common_name: default_common_name(),
            organization: default_organization(),
            root_validity_days: default_root_validity_days(),
            leaf_validity_days: default_leaf_validity_days(),
        }
    }
}

impl ProxyConfig {
    pub fn listen_ip(&self) -> IpAddr {
        self.host
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn head_read_timeout(&self) -> Duration {
        Duration::from_millis(self.head_read_timeout_ms)
    }

    pub fn upstream_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_connect_timeout_ms)
    }
}

impl AuthorityConfig {
    pub fn root_validity(&self) -> time::Duration {
        time::Duration::days(i64::from(self.root_validity_days))
    }

    pub fn leaf_validity(&self) -> time::Duration {
        time::Duration::days(i64::from(self.leaf_validity_days))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.proxy.host, "127.0.0.1");
        assert_eq!(config.proxy.port, 0);
        assert_eq!(config.proxy.max_captures, 10_000);
        assert!(!config.proxy.intercept_tls);
        assert_eq!(config.authority.leaf_validity_days, 7);
        assert!(!config.tls.insecure_skip_verify);
    }

    #[test]
    fn test_config_yaml_roundtrip_uses_camel_case() {
        let mut config = Config::default();
        config.proxy.intercept_tls = true;
        config.proxy.max_captures = 50;

        let yaml = serde_yaml::to_string(&config).expect("Failed to serialize");
        assert!(yaml.contains("interceptTls: true"));
        assert!(yaml.contains("maxCaptures: 50"));

        let deserialized: Config = serde_yaml::from_str(&yaml).expect("Failed to deserialize");
        assert!(deserialized.proxy.intercept_tls);
        assert_eq!(deserialized.proxy.max_captures, 50);
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let config: Config = serde_yaml::from_str("proxy:\n  port: 8899\n").unwrap();
        assert_eq!(config.proxy.port, 8899);
        assert_eq!(config.proxy.shutdown_grace_ms, 3000);
        assert_eq!(config.authority.root_validity_days, 365);
    }
}
