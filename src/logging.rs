use tracing_subscriber::EnvFilter;

/// Subscriber for runs with `RECORD_MATCHER_TRACING` set. `RUST_LOG` filters
/// it (default `info`); output goes to stderr so `--json` stays clean.
pub fn init_tracing_from_env() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_thread_names(true)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_ok() {
        // library code logs through `log::`; forward it once a subscriber exists
        let _ = tracing_log::LogTracer::init();
    }
}

/// Plain env_logger setup, used unless `RECORD_MATCHER_TRACING` is set.
pub fn init_env_logger() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}

pub fn tracing_requested() -> bool {
    std::env::var("RECORD_MATCHER_TRACING")
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}
