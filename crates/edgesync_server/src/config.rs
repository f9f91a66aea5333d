//! Server configuration.

/// Configuration for uplink processing.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Maximum sub-messages accepted in one uplink batch.
    pub max_batch_messages: usize,
    /// Applied message ids cached in memory per edge, in front of the store.
    pub dedup_capacity: usize,
    /// Consecutive protocol violations after which a session is torn down.
    pub max_protocol_violations: u32,
}

impl ServerConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            max_batch_messages: 1000,
            dedup_capacity: 10_000,
            max_protocol_violations: 3,
        }
    }

    /// Sets the maximum batch size.
    pub fn with_max_batch_messages(mut self, max: usize) -> Self {
        self.max_batch_messages = max;
        self
    }

    /// Sets the dedup capacity. Clamped to at least 1.
    pub fn with_dedup_capacity(mut self, capacity: usize) -> Self {
        self.dedup_capacity = capacity.max(1);
        self
    }

    /// Sets the violation limit. Clamped to at least 1.
    pub fn with_max_protocol_violations(mut self, max: u32) -> Self {
        self.max_protocol_violations = max.max(1);
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}
