//! Worker-side logging.
//!
//! A worker's stdout carries protocol frames, so tracing output MUST go to
//! stderr — the parent pumps that channel line by line into its own log,
//! tagged with the child pid.

/// Install the stderr subscriber at the level named by `SPAWNPOOL_LOG`
/// (default `info`). Best-effort: if a subscriber is already installed the
/// call is a no-op.
pub fn init() {
    let level = std::env::var("SPAWNPOOL_LOG")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(tracing::Level::INFO);
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
