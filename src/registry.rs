//! Named, read-only view over live breakers for dashboards.
//!
//! A [`BreakerRegistry`] is constructed by whoever composes the application
//! and handed to the chains it builds. It holds weak back-references only:
//! it never keeps a breaker alive and offers no way to change one.

use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;

use crate::breaker::{CircuitBreaker, WeakBreaker};
use crate::metrics::CircuitStats;

/// Registry of breakers by name.
///
/// Cloning yields a handle to the same registry.
#[derive(Clone, Default)]
pub struct BreakerRegistry {
    breakers: Arc<RwLock<AHashMap<String, WeakBreaker>>>,
}

impl std::fmt::Debug for BreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreakerRegistry")
            .field("names", &self.names())
            .finish()
    }
}

impl BreakerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `breaker` under its name, replacing a previous entry of the same
    /// name. Entries of dropped breakers are pruned on the way.
    pub fn register(&self, breaker: &CircuitBreaker) {
        let mut breakers = self.breakers.write();
        breakers.retain(|_, weak| weak.upgrade().is_some());
        if breakers
            .insert(breaker.name().to_string(), breaker.downgrade())
            .is_some()
        {
            tracing::debug!(dependency = %breaker.name(), "replaced registered breaker");
        }
    }

    /// Names of the live breakers, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .breakers
            .read()
            .iter()
            .filter(|(_, weak)| weak.upgrade().is_some())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Statistics of the named breaker, if it is still alive.
    pub fn stats(&self, name: &str) -> Option<CircuitStats> {
        let breaker = self.breakers.read().get(name)?.upgrade()?;
        Some(breaker.stats())
    }

    /// Statistics of every live breaker, sorted by name.
    pub fn snapshot(&self) -> Vec<CircuitStats> {
        let live: Vec<CircuitBreaker> = self
            .breakers
            .read()
            .values()
            .filter_map(WeakBreaker::upgrade)
            .collect();
        // stats() may log; keep that outside the registry lock
        let mut stats: Vec<_> = live.iter().map(CircuitBreaker::stats).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CircuitConfig;
    use crate::kind::FailureKind;
    use crate::state::State;

    #[test]
    fn snapshot_lists_live_breakers() {
        let registry = BreakerRegistry::new();
        let config = CircuitConfig::builder().failure_threshold(1).build().unwrap();
        let openai = CircuitBreaker::new("openai", config.clone());
        let voyage = CircuitBreaker::new("voyage", config);
        registry.register(&voyage);
        registry.register(&openai);

        openai.record_failure(FailureKind::ServerError);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].name, "openai");
        assert_eq!(snapshot[0].state, State::Open);
        assert_eq!(snapshot[1].state, State::Closed);
        assert_eq!(registry.stats("openai").map(|s| s.failed_calls), Some(1));
    }

    #[test]
    fn dropped_breakers_disappear() {
        let registry = BreakerRegistry::new();
        let breaker = CircuitBreaker::new("ephemeral", CircuitConfig::default());
        registry.register(&breaker);
        assert_eq!(registry.names(), vec!["ephemeral".to_string()]);

        drop(breaker);
        assert!(registry.names().is_empty());
        assert!(registry.snapshot().is_empty());
        assert!(registry.stats("ephemeral").is_none());
    }
}
