use tracing_subscriber::{fmt, EnvFilter};

/// Output format for the global subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable output for terminals.
    Text,
    /// JSON lines, suitable for log shippers.
    Json,
}

/// Initialize the global tracing subscriber.
///
/// Uses the `RUST_LOG` environment variable if set, otherwise falls back to
/// `default_level` (e.g. "info", "fm_daemon=debug,warn").
///
/// Safe to call multiple times (e.g. in tests) -- subsequent calls are no-ops.
pub fn init_logging(service_name: &str, default_level: &str, format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_level(true);

    match format {
        LogFormat::Text => {
            builder.try_init().ok();
        }
        LogFormat::Json => {
            builder.json().try_init().ok();
        }
    }

    tracing::info!(service = service_name, format = ?format, "logging initialised");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_init_does_not_panic() {
        init_logging("fm-test", "info", LogFormat::Text);
        init_logging("fm-test", "debug", LogFormat::Json);
    }
}
