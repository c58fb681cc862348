//! Structured logging initialization.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the logging system.
///
/// `RUST_LOG` wins over `filter`. Logs are JSON when `json_format` is set,
/// pretty-printed otherwise.
///
/// # Example
///
/// ```rust,no_run
/// use grove_node::observability::init_logging;
///
/// init_logging("grove=info", true);
/// ```
pub fn init_logging(filter: &str, json_format: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    let registry = tracing_subscriber::registry().with(env_filter);

    if json_format {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_file(true)
                    .with_line_number(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_thread_names(false),
            )
            .init();
    } else {
        registry.with(fmt::layer().pretty()).init();
    }

    tracing::info!(
        filter = %filter,
        format = if json_format { "json" } else { "pretty" },
        "Logging initialized"
    );
}
