use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct Metrics {
    registry: Registry,

    // Connection metrics
    pub connections_total: IntCounter,
    pub active_connections: IntGauge,

    // Exchange metrics
    pub exchanges_total: IntCounter,
    pub exchange_errors_total: IntCounter,
    pub exchange_duration: Histogram,

    // Tunnel metrics
    pub opaque_tunnels_total: IntCounter,
    pub intercepted_tunnels_total: IntCounter,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let connections_total = IntCounter::new(
            "capture_proxy_connections_total",
            "Total number of accepted client connections",
        )
        .expect("metric creation failed");
        let active_connections = IntGauge::new(
            "capture_proxy_active_connections",
            "Number of client connections currently being served",
        )
        .expect("metric creation failed");

        let exchanges_total = IntCounter::new(
            "capture_proxy_exchanges_total",
            "Total number of captured exchanges",
        )
        .expect("metric creation failed");
        let exchange_errors_total = IntCounter::new(
            "capture_proxy_exchange_errors_total",
            "Total number of captured exchanges that ended in an error",
        )
        .expect("metric creation failed");
        let exchange_duration = Histogram::with_opts(HistogramOpts::new(
            "capture_proxy_exchange_duration_seconds",
            "Exchange duration from first request byte to last response byte",
        ))
        .expect("metric creation failed");

        let opaque_tunnels_total = IntCounter::new(
            "capture_proxy_opaque_tunnels_total",
            "Total number of CONNECT tunnels relayed without decryption",
        )
        .expect("metric creation failed");
        let intercepted_tunnels_total = IntCounter::new(
            "capture_proxy_intercepted_tunnels_total",
            "Total number of CONNECT tunnels decrypted with a minted leaf",
        )
        .expect("metric creation failed");

        // Register all metrics
        registry
            .register(Box::new(connections_total.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(active_connections.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(exchanges_total.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(exchange_errors_total.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(exchange_duration.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(opaque_tunnels_total.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(intercepted_tunnels_total.clone()))
            .expect("metric registration failed");

        Self {
            registry,
            connections_total,
            active_connections,
            exchanges_total,
            exchange_errors_total,
            exchange_duration,
            opaque_tunnels_total,
            intercepted_tunnels_total,
        }
    }

    pub fn connection_opened(&self) {
        self.connections_total.inc();
        self.active_connections.inc();
    }

    pub fn connection_closed(&self) {
        self.active_connections.dec();
    }

    pub fn record_exchange(&self, duration: Duration, failed: bool) {
        self.exchanges_total.inc();
        self.exchange_duration.observe(duration.as_secs_f64());
        if failed {
            self.exchange_errors_total.inc();
        }
    }

    pub fn record_tunnel(&self, intercepted: bool) {
        if intercepted {
            self.intercepted_tunnels_total.inc();
        } else {
            self.opaque_tunnels_total.inc();
        }
    }

    pub fn gather_metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// Text exposition format of every registered metric.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.gather_metrics(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

/// Times one exchange from its first request byte.
pub struct ExchangeTimer {
    start: Instant,
    metrics: Arc<Metrics>,
}

impl ExchangeTimer {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self::started_at(metrics, Instant::now())
    }

    pub fn started_at(metrics: Arc<Metrics>, start: Instant) -> Self {
        Self { start, metrics }
    }

    pub fn finish(self) -> Duration {
        let duration = self.start.elapsed();
        self.metrics.record_exchange(duration, false);
        duration
    }

    pub fn fail(self) -> Duration {
        let duration = self.start.elapsed();
        self.metrics.record_exchange(duration, true);
        duration
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_records_outcome() {
        let metrics = Arc::new(Metrics::new());
        ExchangeTimer::new(Arc::clone(&metrics)).finish();
        ExchangeTimer::new(Arc::clone(&metrics)).fail();

        assert_eq!(metrics.exchanges_total.get(), 2);
        assert_eq!(metrics.exchange_errors_total.get(), 1);
        assert_eq!(metrics.exchange_duration.get_sample_count(), 2);
    }

    #[test]
    fn test_render_exposes_metric_names() {
        let metrics = Metrics::new();
        metrics.connection_opened();
        metrics.record_tunnel(true);

        let text = metrics.render().unwrap();
        assert!(text.contains("capture_proxy_connections_total 1"));
        assert!(text.contains("capture_proxy_active_connections 1"));
        assert!(text.contains("capture_proxy_intercepted_tunnels_total 1"));
    }
}
