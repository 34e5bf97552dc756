//! Cache configuration

use std::time::Duration;

/// Key namespaces used by [`IndexedStore`](crate::IndexedStore).
///
/// Values live under `{value_prefix}{parent_id}:{resource_id}`, the forward
/// index under `{forward_prefix}{parent_id}` and the reverse index under
/// `{reverse_prefix}{resource_id}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Prefix for the value namespace. Also used by `size()` to count values,
    /// so it must not be a prefix of the two index namespaces.
    pub value_prefix: String,
    /// Prefix for the forward index (parent -> resources)
    pub forward_prefix: String,
    /// Prefix for the reverse index (resource -> parents)
    pub reverse_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            value_prefix: "value:".to_owned(),
            forward_prefix: "mapping:".to_owned(),
            reverse_prefix: "reverse:".to_owned(),
        }
    }
}

impl StoreConfig {
    pub fn with_value_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.value_prefix = prefix.into();
        self
    }

    pub fn with_forward_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.forward_prefix = prefix.into();
        self
    }

    pub fn with_reverse_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.reverse_prefix = prefix.into();
        self
    }
}

/// Restart policy for the supervised background loops.
///
/// Delays grow exponentially from `initial_delay` until they reach
/// `max_delay`, then stay there forever.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    /// Delay before restart number `attempt` (zero-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1).saturating_pow(attempt);
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}
