//! Tracing setup for embedding supervisors.
//!
//! spawnpool is a library and never installs a subscriber behind the host's
//! back. Hosts that want the default formatting call [`install`] once at
//! startup; the level comes from [`ManagerConfig::log_level`], falling back
//! to the `SPAWNPOOL_LOG` environment variable, then `info`.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::ManagerConfig;

static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Resolve the tracing level for a supervisor process: the config value
/// wins, then `SPAWNPOOL_LOG`, then `info`. Unparseable names fall back to
/// `info` rather than erroring.
pub fn resolve_level(config: &ManagerConfig) -> tracing::Level {
    config
        .log_level
        .clone()
        .or_else(|| std::env::var("SPAWNPOOL_LOG").ok())
        .and_then(|value| value.parse().ok())
        .unwrap_or(tracing::Level::INFO)
}

/// Install the process-wide subscriber for this supervisor.
///
/// Returns `false` without touching anything when a subscriber was already
/// installed — by an earlier call or by the embedding application.
pub fn install(config: &ManagerConfig) -> bool {
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return false;
    }
    tracing_subscriber::fmt()
        .with_max_level(resolve_level(config))
        .with_target(false)
        .try_init()
        .is_ok()
}
