//! Listener lifecycle and the control surface the UI drives.

use arc_swap::{ArcSwap, ArcSwapOption};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::capture::{CaptureStore, CapturedExchange};
use crate::config::{Config, ProxyConfig};
use crate::error::{ProxyError, Result};
use crate::proxy::HandlerContext;
use crate::state::{Metrics, ProxyState, ProxyStatus};
use crate::tls::{CertificateAuthority, TlsClientConfig, TlsConfigProvider};

mod lifecycle;

struct RunningProxy {
    port: u16,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Debug, Clone, Copy)]
struct LifecycleView {
    state: ProxyState,
    port: Option<u16>,
}

/// Owns the proxy's listening socket.
///
/// `Stopped -> Starting -> Running -> Stopping -> Stopped`. Start and stop
/// are serialized against each other; `status` never waits on them.
pub struct ProxyController {
    context: Arc<HandlerContext>,
    lifecycle: Mutex<Option<RunningProxy>>,
    view: ArcSwap<LifecycleView>,
    method_filter: ArcSwapOption<String>,
}

impl ProxyController {
    pub fn new(config: &Config) -> Result<Self> {
        let tls = TlsConfigProvider::new()?;
        if config.tls != TlsClientConfig::default() {
            tls.apply(config.tls.clone())?;
        }

        Ok(Self::with_components(
            config.proxy.clone(),
            Arc::new(CaptureStore::new(config.proxy.max_captures)),
            Arc::new(CertificateAuthority::new(config.authority.clone())),
            Arc::new(tls),
            Arc::new(Metrics::new()),
        ))
    }

    /// Build a controller around existing collaborators, e.g. a TLS provider
    /// shared with the application's own request sender.
    pub fn with_components(
        settings: ProxyConfig,
        store: Arc<CaptureStore>,
        authority: Arc<CertificateAuthority>,
        tls: Arc<TlsConfigProvider>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            context: Arc::new(HandlerContext::new(store, authority, tls, metrics, settings)),
            lifecycle: Mutex::new(None),
            view: ArcSwap::from_pointee(LifecycleView {
                state: ProxyState::Stopped,
                port: None,
            }),
            method_filter: ArcSwapOption::empty(),
        }
    }

    /// Bind and start accepting. `requested_port` 0 asks the OS for an
    /// ephemeral port. Returns the bound port; if already running, returns
    /// the current port and changes nothing.
    pub async fn start(&self, requested_port: u16) -> Result<u16> {
        let mut lifecycle = self.lifecycle.lock().await;
        if let Some(running) = lifecycle.as_ref() {
            tracing::debug!(port = running.port, "Proxy already running");
            return Ok(running.port);
        }

        self.publish(ProxyState::Starting, None);

        let addr = SocketAddr::new(self.context.settings().listen_ip(), requested_port);
        let bound = TcpListener::bind(addr)
            .await
            .map_err(|source| ProxyError::Bind { addr, source })
            .and_then(|listener| {
                let port = listener.local_addr()?.port();
                Ok((listener, port))
            });
        let (listener, port) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                tracing::warn!(%addr, error = %e, "Failed to start proxy");
                self.publish(ProxyState::Stopped, None);
                return Err(e);
            }
        };

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(lifecycle::run_accept_loop(
            listener,
            Arc::clone(&self.context),
            shutdown.clone(),
            self.context.settings().shutdown_grace(),
        ));

        *lifecycle = Some(RunningProxy {
            port,
            shutdown,
            task,
        });
        self.publish(ProxyState::Running, Some(port));

        tracing::info!(
            host = %addr.ip(),
            port,
            intercept_tls = self.context.intercept_tls(),
            "Capture proxy listening"
        );
        Ok(port)
    }

    /// Close the listener and wait for connections to drain (or be closed
    /// after the grace period). A no-op when already stopped.
    pub async fn stop(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        let Some(running) = lifecycle.take() else {
            return Ok(());
        };

        self.publish(ProxyState::Stopping, Some(running.port));
        tracing::info!(port = running.port, "Stopping capture proxy");
        // Publishes Stopped even if this future is dropped while draining.
        // The cancelled accept loop keeps draining in the background.
        let _stopped = PublishStoppedOnDrop(&self.view);

        running.shutdown.cancel();
        if let Err(e) = running.task.await {
            tracing::error!(error = %e, "Accept loop terminated abnormally");
        }

        tracing::info!("Capture proxy stopped");
        Ok(())
    }

    pub fn status(&self) -> ProxyStatus {
        let view = **self.view.load();
        let method_filter = self.method_filter();

        ProxyStatus {
            state: view.state,
            running: view.state == ProxyState::Running,
            port: view.port,
            capture_count: self
                .context
                .store
                .count(method_filter.as_deref().unwrap_or("")),
            method_filter,
            intercepting: self.context.intercept_tls(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.view.load().state == ProxyState::Running
    }

    /// An empty filter clears it.
    pub fn set_method_filter(&self, method: impl Into<String>) {
        let method = method.into();
        if method.is_empty() {
            self.clear_method_filter();
        } else {
            self.method_filter.store(Some(Arc::new(method)));
        }
    }

    pub fn clear_method_filter(&self) {
        self.method_filter.store(None);
    }

    pub fn method_filter(&self) -> Option<String> {
        self.method_filter.load_full().map(|m| m.as_ref().clone())
    }

    /// Captures matching the current method filter.
    pub fn captures(&self) -> Vec<CapturedExchange> {
        self.context
            .store
            .list(self.method_filter().as_deref().unwrap_or(""))
    }

    pub fn set_intercept_tls(&self, enabled: bool) {
        self.context.set_intercept_tls(enabled);
        tracing::info!(enabled, "TLS interception toggled");
    }

    pub fn intercept_tls(&self) -> bool {
        self.context.intercept_tls()
    }

    pub fn store(&self) -> Arc<CaptureStore> {
        Arc::clone(&self.context.store)
    }

    pub fn authority(&self) -> Arc<CertificateAuthority> {
        Arc::clone(&self.context.authority)
    }

    pub fn tls(&self) -> Arc<TlsConfigProvider> {
        Arc::clone(&self.context.tls)
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.context.metrics)
    }

    fn publish(&self, state: ProxyState, port: Option<u16>) {
        self.view.store(Arc::new(LifecycleView { state, port }));
    }
}

struct PublishStoppedOnDrop<'a>(&'a ArcSwap<LifecycleView>);

impl Drop for PublishStoppedOnDrop<'_> {
    fn drop(&mut self) {
        self.0.store(Arc::new(LifecycleView {
            state: ProxyState::Stopped,
            port: None,
        }));
    }
}

impl Drop for ProxyController {
    fn drop(&mut self) {
        if let Some(running) = self.lifecycle.get_mut().take() {
            running.shutdown.cancel();
        }
    }
}
