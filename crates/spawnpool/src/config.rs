//! Pool and manager configuration.
//!
//! Pool configs are serde structs with per-field defaults, so a TOML file
//! (or a literal in tests) only names what it overrides. At runtime a pool
//! keeps its config behind an atomic snapshot (`arc-swap`): hot edits via
//! [`crate::pool::WorkerPool::set_config`] become visible as one consistent
//! snapshot at the next tick or dispatch.

use std::collections::BTreeMap;
use std::path::PathBuf;

use rand::Rng;
use serde::{Deserialize, Serialize};
use spawnpool_proto::{CompressConfig, WorkerBootConfig};

use crate::error::PoolError;

/// Per-child request budget: a fixed count or a `[lo, hi]` range randomised
/// per worker at spawn time. `0` disables recycling.
///
/// Hot-updating the pool config never re-randomises the budget already
/// resolved for a live worker; use
/// [`crate::pool::WorkerPool::set_request_budget`] to overwrite one
/// explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChildRequestBudget {
    Fixed(u64),
    Range(u64, u64),
}

impl Default for ChildRequestBudget {
    fn default() -> Self {
        Self::Fixed(0)
    }
}

impl ChildRequestBudget {
    /// Resolve to a concrete per-worker budget.
    pub fn resolve<R: Rng>(&self, rng: &mut R) -> u64 {
        match *self {
            Self::Fixed(n) => n,
            Self::Range(lo, hi) if lo >= hi => lo,
            Self::Range(lo, hi) => rng.gen_range(lo..=hi),
        }
    }
}

/// When a worker becomes due for automatic maintenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaintMethod {
    /// After `maint_requests` served since the last maintenance.
    Requests,
    /// After `maint_time_sec` elapsed since the last maintenance.
    Time,
}

/// Configuration of one worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Executable to spawn for each child worker.
    pub exec_cmd: String,
    pub exec_args: Vec<String>,
    /// Extra environment merged over the inherited parent environment.
    pub exec_env: BTreeMap<String, String>,
    pub exec_cwd: Option<PathBuf>,
    /// User script/module path passed through to the worker.
    pub script: Option<String>,

    pub min_children: usize,
    pub max_children: usize,
    /// Pool-wide in-flight request cap; `0` disables (no 429s).
    pub max_concurrent_requests: usize,
    pub max_requests_per_child: ChildRequestBudget,
    pub max_concurrent_launches: usize,
    pub max_concurrent_maint: usize,
    /// Auto-scaler over-provisioning percentage.
    pub child_headroom_pct: u32,
    /// A worker counts as busy when it has at least this many requests.
    pub child_busy_factor: usize,

    pub startup_timeout_sec: u64,
    pub shutdown_timeout_sec: u64,
    /// Per-request deadline, enforced on both sides; `0` disables.
    pub request_timeout_sec: u64,
    /// Maintenance deadline before escalating to shutdown; `0` disables.
    pub maint_timeout_sec: u64,

    pub auto_maint: bool,
    pub maint_method: MaintMethod,
    pub maint_requests: u64,
    pub maint_time_sec: u64,

    pub compress_enabled: bool,
    pub compress_regex: String,
    pub compress_brotli: bool,

    /// URI pattern to register with the HTTP collaborator, if any.
    pub uri_match: Option<String>,
    /// Opaque ACL entries the HTTP collaborator enforces (403s never reach
    /// the pool).
    pub acl: Vec<String>,

    pub enabled: bool,
    /// Free-form extra config passed to the worker's startup hook.
    pub extra: serde_json::Value,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            exec_cmd: String::new(),
            exec_args: Vec::new(),
            exec_env: BTreeMap::new(),
            exec_cwd: None,
            script: None,
            min_children: 1,
            max_children: 1,
            max_concurrent_requests: 0,
            max_requests_per_child: ChildRequestBudget::default(),
            max_concurrent_launches: 1,
            max_concurrent_maint: 1,
            child_headroom_pct: 0,
            child_busy_factor: 1,
            startup_timeout_sec: 10,
            shutdown_timeout_sec: 10,
            request_timeout_sec: 0,
            maint_timeout_sec: 0,
            auto_maint: false,
            maint_method: MaintMethod::Requests,
            maint_requests: 1000,
            maint_time_sec: 0,
            compress_enabled: false,
            compress_regex: "^text/|javascript|json|xml".to_string(),
            compress_brotli: false,
            uri_match: None,
            acl: Vec::new(),
            enabled: true,
            extra: serde_json::Value::Null,
        }
    }
}

impl PoolConfig {
    /// Reject inconsistent configurations before any child is spawned.
    ///
    /// # Errors
    ///
    /// [`PoolError::InvalidConfig`] describing the first problem found.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max_children == 0 {
            return Err(PoolError::InvalidConfig(
                "max_children must be at least 1".into(),
            ));
        }
        if self.min_children > self.max_children {
            return Err(PoolError::InvalidConfig(format!(
                "min_children ({}) exceeds max_children ({})",
                self.min_children, self.max_children
            )));
        }
        if self.max_concurrent_launches == 0 {
            return Err(PoolError::InvalidConfig(
                "max_concurrent_launches must be at least 1".into(),
            ));
        }
        if let ChildRequestBudget::Range(lo, hi) = self.max_requests_per_child {
            if lo > hi {
                return Err(PoolError::InvalidConfig(format!(
                    "max_requests_per_child range [{lo}, {hi}] is inverted"
                )));
            }
        }
        if self.auto_maint
            && self.maint_method == MaintMethod::Time
            && self.maint_time_sec == 0
        {
            return Err(PoolError::InvalidConfig(
                "auto_maint by time requires maint_time_sec > 0".into(),
            ));
        }
        if self.compress_enabled && regex::Regex::new(&self.compress_regex).is_err() {
            return Err(PoolError::InvalidConfig(format!(
                "compress_regex {:?} is not a valid pattern",
                self.compress_regex
            )));
        }
        if let Some(pattern) = &self.uri_match {
            if regex::Regex::new(pattern).is_err() {
                return Err(PoolError::InvalidConfig(format!(
                    "uri_match {pattern:?} is not a valid pattern"
                )));
            }
        }
        Ok(())
    }

    /// The slice of this config a child worker receives at startup.
    pub fn worker_boot_config(&self) -> WorkerBootConfig {
        WorkerBootConfig {
            script: self.script.clone(),
            request_timeout_sec: self.request_timeout_sec,
            compress: CompressConfig {
                enabled: self.compress_enabled,
                content_match: self.compress_regex.clone(),
                brotli: self.compress_brotli,
            },
            extra: self.extra.clone(),
        }
    }
}

/// Top-level configuration: the set of pools plus process-wide knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub pools: BTreeMap<String, PoolConfig>,
    /// Parallelism bound for starting pools at manager startup.
    pub startup_threads: usize,
    /// Install a panic hook that SIGKILLs every child before unwinding.
    pub kill_children_on_panic: bool,
    /// Externally visible IP reported to children in the startup frame.
    pub server_ip: Option<String>,
    /// Tracing level for [`crate::logging::install`]; `SPAWNPOOL_LOG` is the
    /// fallback when unset.
    pub log_level: Option<String>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            pools: BTreeMap::new(),
            startup_threads: 1,
            kill_children_on_panic: false,
            server_ip: None,
            log_level: None,
        }
    }
}

impl ManagerConfig {
    /// Parse a manager config from TOML text.
    ///
    /// # Errors
    ///
    /// [`PoolError::InvalidConfig`] for a syntax error or any pool failing
    /// validation.
    pub fn from_toml_str(text: &str) -> Result<Self, PoolError> {
        let config: Self =
            toml::from_str(text).map_err(|e| PoolError::InvalidConfig(e.to_string()))?;
        for (id, pool) in &config.pools {
            pool.validate()
                .map_err(|e| PoolError::InvalidConfig(format!("pool {id:?}: {e}")))?;
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        PoolConfig::default().validate().unwrap();
    }

    #[test]
    fn test_min_over_max_rejected() {
        let config = PoolConfig {
            min_children: 3,
            max_children: 2,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(PoolError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_zero_max_children_rejected() {
        let config = PoolConfig {
            max_children: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_inverted_budget_range_rejected() {
        let config = PoolConfig {
            max_requests_per_child: ChildRequestBudget::Range(100, 10),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_time_maint_requires_interval() {
        let config = PoolConfig {
            auto_maint: true,
            maint_method: MaintMethod::Time,
            maint_time_sec: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_budget_scalar_resolves_to_itself() {
        let mut rng = rand::thread_rng();
        assert_eq!(ChildRequestBudget::Fixed(50).resolve(&mut rng), 50);
    }

    #[test]
    fn test_budget_range_resolves_within_bounds() {
        let mut rng = rand::thread_rng();
        for _ in 0..100 {
            let n = ChildRequestBudget::Range(10, 20).resolve(&mut rng);
            assert!((10..=20).contains(&n));
        }
    }

    #[test]
    fn test_budget_deserializes_scalar_and_range() {
        #[derive(Deserialize)]
        struct Wrap {
            budget: ChildRequestBudget,
        }
        let scalar: Wrap = serde_json::from_str(r#"{"budget": 100}"#).unwrap();
        assert_eq!(scalar.budget, ChildRequestBudget::Fixed(100));
        let range: Wrap = serde_json::from_str(r#"{"budget": [10, 20]}"#).unwrap();
        assert_eq!(range.budget, ChildRequestBudget::Range(10, 20));
    }

    #[test]
    fn test_worker_boot_config_carries_compression() {
        let config = PoolConfig {
            compress_enabled: true,
            compress_brotli: true,
            request_timeout_sec: 30,
            script: Some("image_worker.toml".into()),
            ..Default::default()
        };
        let boot = config.worker_boot_config();
        assert!(boot.compress.enabled);
        assert!(boot.compress.brotli);
        assert_eq!(boot.request_timeout_sec, 30);
        assert_eq!(boot.script.as_deref(), Some("image_worker.toml"));
    }

    #[test]
    fn test_manager_config_from_toml() {
        let text = r#"
            startup_threads = 2
            log_level = "warn"

            [pools.thumbs]
            exec_cmd = "/usr/local/bin/thumb-worker"
            min_children = 2
            max_children = 8
            max_concurrent_requests = 64
            uri_match = "^/thumb/"

            [pools.video]
            exec_cmd = "/usr/local/bin/video-worker"
            max_requests_per_child = [500, 1000]
            enabled = false
        "#;
        let config = ManagerConfig::from_toml_str(text).unwrap();
        assert_eq!(config.startup_threads, 2);
        assert_eq!(config.log_level.as_deref(), Some("warn"));
        assert_eq!(config.pools.len(), 2);
        assert_eq!(config.pools["thumbs"].min_children, 2);
        assert_eq!(
            config.pools["video"].max_requests_per_child,
            ChildRequestBudget::Range(500, 1000)
        );
        assert!(!config.pools["video"].enabled);
    }

    #[test]
    fn test_manager_config_rejects_invalid_pool() {
        let text = r#"
            [pools.bad]
            exec_cmd = "w"
            min_children = 5
            max_children = 2
        "#;
        assert!(ManagerConfig::from_toml_str(text).is_err());
    }
}
