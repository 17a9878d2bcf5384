//! Tracing subscriber setup. Safe to call more than once; only the first call installs
//! a subscriber.

use std::sync::OnceLock;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::LogFormat;

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// `RUST_LOG` wins over `default_level` when set. Logs go to stderr so command output
/// on stdout stays clean.
pub fn init_logging(default_level: &str, format: LogFormat) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let filter = build_filter(std::env::var("RUST_LOG").ok().as_deref(), default_level);
        let registry = tracing_subscriber::registry().with(filter);
        let result = match format {
            LogFormat::Json => registry
                .with(
                    fmt::layer()
                        .json()
                        .with_target(true)
                        .with_current_span(false)
                        .with_writer(std::io::stderr),
                )
                .try_init(),
            LogFormat::Pretty => registry
                .with(
                    fmt::layer()
                        .with_target(false)
                        .with_writer(std::io::stderr),
                )
                .try_init(),
        };
        if result.is_err() {
            tracing::debug!("global tracing subscriber already set, keeping it");
        }
    });
}

fn build_filter(env: Option<&str>, default_level: &str) -> EnvFilter {
    env.filter(|v| !v.trim().is_empty())
        .and_then(|v| EnvFilter::try_new(v).ok())
        .or_else(|| EnvFilter::try_new(default_level).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}
