use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use tokio::signal;
use tracing::{error, info};

use capture_proxy::capture::CapturedExchange;
use capture_proxy::config::{self, Config};
use capture_proxy::logging;
use capture_proxy::ProxyController;

#[derive(Parser, Debug)]
#[command(name = "capture-proxy")]
#[command(about = "Local HTTP/HTTPS forward proxy that records every exchange", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file (YAML/JSON/TOML)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Emit logs and captures as JSON lines
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Run the capture proxy (default)
    Run(RunArgs),
}

#[derive(Debug, Default, clap::Args)]
struct RunArgs {
    /// Port to listen on (0 picks a free one)
    #[arg(short, long)]
    port: Option<u16>,

    /// Decrypt CONNECT tunnels using the session CA
    #[arg(long)]
    intercept: bool,

    /// Only print captures with this exact method
    #[arg(long, value_name = "METHOD")]
    filter: Option<String>,

    /// Client certificate presented to upstream servers (PEM)
    #[arg(long, value_name = "FILE", requires = "client_key")]
    client_cert: Option<PathBuf>,

    /// Private key for --client-cert (PEM)
    #[arg(long, value_name = "FILE", requires = "client_cert")]
    client_key: Option<PathBuf>,

    /// Extra CA bundle trusted for upstream servers (PEM)
    #[arg(long, value_name = "FILE")]
    ca_bundle: Option<PathBuf>,

    /// Skip upstream certificate verification
    #[arg(long)]
    insecure: bool,

    /// Where to write the session root certificate when intercepting
    #[arg(long, value_name = "FILE")]
    export_ca: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    logging::init(log_level, args.json);

    let mut config = match &args.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            config::load_from_path(path)
                .with_context(|| format!("loading configuration from {}", path.display()))?
        }
        None => config::load_from_env_or_file().context("loading configuration")?,
    };

    let run = match args.command {
        Some(Command::Run(run)) => run,
        None => RunArgs::default(),
    };
    apply_overrides(&mut config, &run);
    config::validate(&config)?;

    let proxy = ProxyController::new(&config)?;
    if let Some(method) = &run.filter {
        proxy.set_method_filter(method.clone());
    }

    if config.proxy.intercept_tls {
        let path = match run.export_ca {
            Some(path) => path,
            None => default_ca_path().context("cannot determine home directory for --export-ca")?,
        };
        proxy.authority().write_root_pem(&path)?;
        info!(
            "Trust {} in your client to inspect HTTPS traffic",
            path.display()
        );
    }

    let port = proxy.start(config.proxy.port).await?;
    info!("Point clients at http://{}:{}", config.proxy.host, port);

    let printer = tokio::spawn(print_captures(
        proxy.store(),
        proxy.method_filter(),
        args.json,
    ));

    shutdown_signal().await;

    info!("Shutting down capture proxy");
    if let Err(e) = proxy.stop().await {
        error!("Error while stopping proxy: {}", e);
    }
    printer.abort();

    let status = proxy.status();
    info!(
        "Captured {} exchange(s){}",
        status.capture_count,
        status
            .method_filter
            .map(|m| format!(" matching {m}"))
            .unwrap_or_default()
    );

    Ok(())
}

fn apply_overrides(config: &mut Config, run: &RunArgs) {
    if let Some(port) = run.port {
        config.proxy.port = port;
    }
    if run.intercept {
        config.proxy.intercept_tls = true;
    }
    if let Some(cert) = &run.client_cert {
        config.tls.client_cert_path = Some(cert.clone());
    }
    if let Some(key) = &run.client_key {
        config.tls.client_key_path = Some(key.clone());
    }
    if let Some(bundle) = &run.ca_bundle {
        config.tls.custom_ca_path = Some(bundle.clone());
    }
    if run.insecure {
        config.tls.insecure_skip_verify = true;
    }
}

fn default_ca_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".capture-proxy").join("ca.crt"))
}

async fn print_captures(
    store: std::sync::Arc<capture_proxy::CaptureStore>,
    filter: Option<String>,
    json: bool,
) {
    let mut revisions = store.subscribe();
    let mut last_seen = 0;

    while revisions.changed().await.is_ok() {
        for exchange in store.since(last_seen) {
            last_seen = exchange.id;
            if filter.as_deref().is_some_and(|m| m != exchange.method) {
                continue;
            }
            println!("{}", render(&exchange, json));
        }
    }
}

fn render(exchange: &CapturedExchange, json: bool) -> String {
    if json {
        return serde_json::to_string(exchange).unwrap_or_default();
    }

    let status = match exchange.response_status_code {
        0 => "---".to_string(),
        code => code.to_string(),
    };
    let mut line = format!(
        "#{:<5} {:<7} {} {} {}B {:.1}ms",
        exchange.id,
        exchange.method,
        status,
        exchange.url,
        exchange.response_body_size,
        exchange.duration.as_secs_f64() * 1000.0
    );
    if exchange.intercepted {
        line.push_str(" [tls]");
    }
    if let Some(err) = &exchange.error {
        line.push_str(&format!(" error: {err}"));
    }
    line
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}
