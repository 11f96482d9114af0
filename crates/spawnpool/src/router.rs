//! Request-router binding.
//!
//! The HTTP server is an external collaborator; [`RouteRegistrar`] is the
//! seam it implements. A pool with a `uri_match` gets a [`UriRoute`]
//! (anchored regex plus opaque ACL entries — the collaborator enforces the
//! ACL and answers 403s itself) bound to a handler that dispatches into the
//! pool and resolves with `(status, headers, body)`.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use regex::Regex;

use crate::error::PoolError;
use crate::pool::WorkerPool;
use crate::request::{RequestArgs, ResponseParts};

/// Identifier of one registered route, for later removal.
pub type RouteId = u64;

/// Handler installed with the HTTP collaborator.
pub type RouteHandler =
    Arc<dyn Fn(RequestArgs) -> BoxFuture<'static, ResponseParts> + Send + Sync>;

/// A URI pattern plus the ACL entries the collaborator enforces.
#[derive(Debug, Clone)]
pub struct UriRoute {
    pub pattern: Regex,
    pub acl: Vec<String>,
}

impl UriRoute {
    /// Compile a string pattern, anchoring it at the start when it is not
    /// already anchored.
    ///
    /// # Errors
    ///
    /// [`PoolError::InvalidConfig`] for a malformed pattern.
    pub fn new(pattern: &str, acl: Vec<String>) -> Result<Self, PoolError> {
        let anchored = if pattern.starts_with('^') {
            pattern.to_string()
        } else {
            format!("^{pattern}")
        };
        let pattern = Regex::new(&anchored)
            .map_err(|e| PoolError::InvalidConfig(format!("uri pattern {anchored:?}: {e}")))?;
        Ok(Self { pattern, acl })
    }

    /// Use a pre-compiled regex as-is.
    pub fn from_regex(pattern: Regex, acl: Vec<String>) -> Self {
        Self { pattern, acl }
    }

    /// Whether a request URI matches this route.
    pub fn matches(&self, uri: &str) -> bool {
        self.pattern.is_match(uri)
    }
}

/// The HTTP collaborator's registration surface.
pub trait RouteRegistrar: Send + Sync {
    /// Install a handler for requests matching `route`.
    fn register(&self, route: UriRoute, handler: RouteHandler) -> RouteId;
    /// Remove a previously registered route.
    fn unregister(&self, id: RouteId);
}

/// Bind a pool's dispatch to a route on the collaborator.
pub fn bind_pool(
    registrar: &dyn RouteRegistrar,
    route: UriRoute,
    pool: Arc<WorkerPool>,
) -> RouteId {
    registrar.register(
        route,
        Arc::new(move |args| {
            let pool = Arc::clone(&pool);
            Box::pin(async move { pool.dispatch(args).await })
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_pattern_is_anchored() {
        let route = UriRoute::new("/pool1", Vec::new()).unwrap();
        assert!(route.matches("/pool1/thumb"));
        assert!(!route.matches("/other/pool1"));
    }

    #[test]
    fn test_pre_anchored_pattern_kept() {
        let route = UriRoute::new("^/api/v[0-9]+/", Vec::new()).unwrap();
        assert!(route.matches("/api/v2/render"));
        assert!(!route.matches("/apix/v2/render"));
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        assert!(matches!(
            UriRoute::new("(", Vec::new()),
            Err(PoolError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_from_regex_passthrough() {
        let route = UriRoute::from_regex(Regex::new("thumb").unwrap(), vec!["10.0.0.0/8".into()]);
        // A caller-supplied regex is deliberately not anchored.
        assert!(route.matches("/x/thumb"));
        assert_eq!(route.acl, vec!["10.0.0.0/8".to_string()]);
    }
}
