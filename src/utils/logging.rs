use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::LoggingConfig;

/// Installs the global subscriber. `RUST_LOG` takes precedence over the
/// configured level so operators can raise verbosity without editing config.
pub fn init_tracing(config: &LoggingConfig, level_override: Option<&str>) {
    let level = level_override.unwrap_or(&config.level);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{level},serenity=warn,tungstenite=warn")));

    let registry = tracing_subscriber::registry().with(filter);

    if config.format.eq_ignore_ascii_case("json") {
        registry
            .with(fmt::layer().json().with_current_span(false))
            .init();
    } else {
        registry.with(fmt::layer().with_target(true)).init();
    }
}
