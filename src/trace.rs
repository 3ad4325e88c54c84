use std::sync::OnceLock;

use tracing::Instrument;
use tracing_subscriber::{EnvFilter, prelude::*};

use crate::settings::LogFormat;

static INSTALLED: OnceLock<Result<(), String>> = OnceLock::new();

/// Install the global subscriber. `RUST_LOG` overrides the default `info`
/// filter; `log_format` picks compact text or one JSON object per line.
///
/// Only the first call installs anything. Later calls return the first
/// call's result, whatever format they ask for.
pub fn init(log_format: LogFormat) -> anyhow::Result<()> {
    INSTALLED
        .get_or_init(|| install(log_format).map_err(|e| e.to_string()))
        .clone()
        .map_err(anyhow::Error::msg)
}

fn install(log_format: LogFormat) -> Result<(), tracing_subscriber::util::TryInitError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt = tracing_subscriber::fmt::layer().with_target(true).with_level(true);
    match log_format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(fmt.compact().with_filter(filter))
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(fmt.json().with_filter(filter))
            .try_init(),
    }
}

/// Run an async test body inside a span named after the test.
pub async fn with_test_tracing<F, Fut, T>(test_name: &str, f: F) -> T
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = T>,
{
    // Logs are best effort in tests.
    let _ = init(LogFormat::Text);
    f().instrument(tracing::info_span!("test", name = test_name))
        .await
}

pub fn with_test_tracing_sync<F, T>(test_name: &str, f: F) -> T
where
    F: FnOnce() -> T,
{
    let _ = init(LogFormat::Text);
    tracing::info_span!("test", name = test_name).in_scope(f)
}
