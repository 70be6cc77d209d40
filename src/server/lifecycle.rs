use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::proxy::{ConnectionHandler, HandlerContext};

/// Accept connections until `shutdown` fires, one task per connection.
///
/// On shutdown the listener is closed first, so the port refuses new
/// connections while in-flight ones get `grace` to finish before they are
/// aborted.
pub(crate) async fn run_accept_loop(
    listener: TcpListener,
    ctx: Arc<HandlerContext>,
    shutdown: CancellationToken,
    grace: Duration,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    let handler = ConnectionHandler::new(Arc::clone(&ctx), peer);
                    connections.spawn(handler.run(stream));
                }
                Err(e) => {
                    // Usually fd exhaustion; back off instead of spinning.
                    error!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
            Some(finished) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = finished {
                    if e.is_panic() {
                        error!(error = %e, "Connection task panicked");
                    }
                }
            }
        }
    }

    drop(listener);
    info!(in_flight = connections.len(), "Listener closed; draining connections");

    let drained = tokio::time::timeout(grace, async {
        while connections.join_next().await.is_some() {}
    })
    .await;

    if drained.is_err() {
        warn!(
            remaining = connections.len(),
            grace_ms = grace.as_millis() as u64,
            "Grace period elapsed; closing remaining connections"
        );
        connections.shutdown().await;
    }
    debug!("Accept loop finished");
}
