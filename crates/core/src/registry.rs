//! Per-group policy and circuit registries
//!
//! Both are sharded maps keyed by `group_key`, created by the executor and
//! shared with the queue through `Arc`. Nothing here is global.

use dashmap::DashMap;
use tideguard_common::{
    CircuitBreaker, CircuitBreakerMetrics, CircuitState, CommonResult, TokioClock,
};
use tracing::info;

use crate::config::{CircuitPolicy, ExecutorConfig, GroupPolicy, PolicyUpdate};

/// Resolved policy per group
#[derive(Debug)]
pub struct PolicyRegistry {
    defaults: GroupPolicy,
    groups: DashMap<String, GroupPolicy>,
}

impl PolicyRegistry {
    pub fn new(defaults: GroupPolicy) -> Self {
        Self { defaults, groups: DashMap::new() }
    }

    /// Resolve every configured override up front
    pub fn from_config(config: &ExecutorConfig) -> Self {
        let registry = Self::new(config.defaults.clone());
        for (group_key, group) in &config.groups {
            registry.groups.insert(group_key.clone(), group.apply_to(&config.defaults));
        }
        registry
    }

    pub fn defaults(&self) -> &GroupPolicy {
        &self.defaults
    }

    /// Current policy for `group_key`
    pub fn policy_for(&self, group_key: &str) -> GroupPolicy {
        self.groups
            .get(group_key)
            .map_or_else(|| self.defaults.clone(), |policy| policy.value().clone())
    }

    /// Apply a validated update, returning the new policy
    pub fn apply(&self, group_key: &str, update: PolicyUpdate) -> GroupPolicy {
        let mut entry =
            self.groups.entry(group_key.to_string()).or_insert_with(|| self.defaults.clone());
        update.apply(entry.value_mut());
        entry.value().clone()
    }
}

/// Lazily created circuit breaker per group
#[derive(Debug, Default)]
pub struct CircuitRegistry {
    breakers: DashMap<String, CircuitBreaker<TokioClock>>,
}

impl CircuitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The group's breaker, created from `policy` on first use
    pub fn breaker_for(
        &self,
        group_key: &str,
        policy: &CircuitPolicy,
    ) -> CommonResult<CircuitBreaker<TokioClock>> {
        if let Some(breaker) = self.breakers.get(group_key) {
            return Ok(breaker.value().clone());
        }

        let entry = self
            .breakers
            .entry(group_key.to_string())
            .or_try_insert_with(|| CircuitBreaker::named(group_key, policy.clone(), TokioClock))?;
        Ok(entry.value().clone())
    }

    /// Swap in a fresh Closed breaker with a new policy
    pub fn replace(&self, group_key: &str, policy: &CircuitPolicy) -> CommonResult<()> {
        let breaker = CircuitBreaker::named(group_key, policy.clone(), TokioClock)?;
        let previous = self.breakers.insert(group_key.to_string(), breaker);
        info!(
            group_key,
            previous_state = %previous.map_or(CircuitState::Closed, |breaker| breaker.state()),
            failure_threshold = policy.failure_threshold,
            "circuit policy replaced, circuit reset to closed"
        );
        Ok(())
    }

    /// State of the group's circuit; `Closed` if it has never been used
    pub fn state(&self, group_key: &str) -> CircuitState {
        self.breakers.get(group_key).map_or(CircuitState::Closed, |breaker| breaker.state())
    }

    pub fn metrics(&self, group_key: &str) -> Option<CircuitBreakerMetrics> {
        self.breakers.get(group_key).map(|breaker| breaker.metrics())
    }

    /// Force the group's circuit Closed; false if it does not exist yet
    pub fn reset(&self, group_key: &str) -> bool {
        match self.breakers.get(group_key) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }
}
