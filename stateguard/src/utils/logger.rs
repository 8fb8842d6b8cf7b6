//! Logging configuration using tracing.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging with the specified level and format.
///
/// `RUST_LOG` wins over the configured level. Output goes to stderr so that
/// stdout only carries the final run summary.
pub fn init(level: &str, format: &str) -> anyhow::Result<()> {
    let filter = build_filter(std::env::var("RUST_LOG").ok().as_deref(), level);

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        "json" => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init()?,
        _ => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()?,
    }

    Ok(())
}

fn build_filter(rust_log: Option<&str>, level: &str) -> EnvFilter {
    rust_log
        .and_then(|v| EnvFilter::try_new(v).ok())
        .or_else(|| EnvFilter::try_new(level).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_precedence() {
        assert_eq!(build_filter(Some("debug"), "warn").to_string(), "debug");
        assert_eq!(build_filter(None, "warn").to_string(), "warn");
    }
}
