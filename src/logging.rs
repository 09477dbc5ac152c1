use tracing::Level;
use tracing_subscriber::fmt::time::SystemTime;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Registry};

/// Initialize logging for a node process.
///
/// `RUST_LOG` overrides the default filter. Calling this twice is harmless: the
/// second registration attempt is ignored.
pub fn init_logging(level: Level, json_output: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("lightning_eventstore={},warn", level)));

    let result = if json_output {
        let fmt_layer = fmt::layer()
            .json()
            .with_timer(SystemTime)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .with_thread_ids(true)
            .with_thread_names(true);

        Registry::default().with(env_filter).with(fmt_layer).try_init()
    } else {
        let fmt_layer = fmt::layer()
            .with_timer(SystemTime)
            .with_target(true)
            .with_file(false)
            .with_line_number(false)
            .with_thread_ids(false)
            .with_thread_names(true);

        Registry::default().with(env_filter).with(fmt_layer).try_init()
    };

    if result.is_err() {
        tracing::debug!("Logging already initialized");
    }
}

/// Logging for tests: compact output captured by the test harness.
pub fn init_test_logging() {
    let _ = fmt()
        .with_env_filter(EnvFilter::new("lightning_eventstore=debug"))
        .with_test_writer()
        .try_init();
}
