#![forbid(unsafe_code)]

use tracing_subscriber::{
    EnvFilter, fmt::format::Format, layer::SubscriberExt, util::SubscriberInitExt,
};

/// Installs the global subscriber. `RUST_LOG` wins over `default_filter`.
pub fn init_tracing(default_filter: &str) {
    let console_fmt = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .event_format(Format::default().compact().with_target(false));
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(console_fmt)
        .try_init();
}
