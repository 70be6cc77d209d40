use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` is honoured, with `capture_proxy=<level>` added on top.
/// Calling this again (tests, embedding applications) leaves the first
/// subscriber in place.
pub fn init(level: &str, json: bool) {
    let filter = EnvFilter::from_default_env().add_directive(
        format!("capture_proxy={level}")
            .parse()
            .unwrap_or_else(|_| LevelFilter::INFO.into()),
    );

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    if result.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}
