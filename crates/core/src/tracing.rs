//! Log output for simulation runs.
//!
//! Everything in the crate logs through the `tracing` macros; this module
//! only installs the global subscriber. Per-event tracing of the event loop
//! is switched on separately through `EventQueueConfig::trace_events`.

#[cfg(feature = "trace")]
pub mod tracer {
    use tracing::level_filters::LevelFilter;
    use tracing_subscriber::{layer::SubscriberExt, Layer, Registry};

    /// Installs a pretty `fmt` subscriber filtered by `RUST_LOG`, falling back
    /// to `level` (or DEBUG in debug builds, INFO otherwise).
    ///
    /// `NETBUILDER_DISABLE_LOGS` turns output off entirely and
    /// `NETBUILDER_LOG_TO_STDERR` writes to stderr instead of stdout.
    pub fn init_tracer(level: Option<LevelFilter>) -> anyhow::Result<()> {
        let default_filter = if cfg!(any(test, debug_assertions)) {
            LevelFilter::DEBUG
        } else {
            LevelFilter::INFO
        };
        let default_filter = level.unwrap_or(default_filter);
        let filter_layer = tracing_subscriber::EnvFilter::builder()
            .with_default_directive(default_filter.into())
            .from_env_lossy();

        if std::env::var("NETBUILDER_DISABLE_LOGS").is_ok() {
            return Ok(());
        }
        let to_stderr = std::env::var("NETBUILDER_LOG_TO_STDERR").is_ok();

        let fmt_layer = tracing_subscriber::fmt::layer().with_level(true).pretty();
        let fmt_layer = if cfg!(any(test, debug_assertions)) {
            fmt_layer.with_file(true).with_line_number(true)
        } else {
            fmt_layer
        };
        let fmt_layer = if to_stderr {
            fmt_layer.with_writer(std::io::stderr).boxed()
        } else {
            fmt_layer.boxed()
        };

        let subscriber = Registry::default().with(fmt_layer.with_filter(filter_layer));
        tracing::subscriber::set_global_default(subscriber)?;
        Ok(())
    }
}
