//! Configuration for the consensus reactor.

/// Tuning knobs for per-peer gossip.
#[derive(Debug, Clone)]
pub struct ReactorConfig {
    /// Interval between gossip sweeps in milliseconds. Each sweep sends a
    /// peer at most one vote it is missing plus any proposal data it lacks.
    /// Default: 100.
    pub gossip_interval_ms: u64,

    /// Maximum number of peers tracked simultaneously. Default: 200.
    pub max_peers: usize,

    /// Maximum size of a single encoded message in bytes; oversized inbound
    /// frames are dropped before decoding. Default: 1 MiB.
    pub max_message_size: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            gossip_interval_ms: 100,
            max_peers: 200,
            max_message_size: 1_048_576,
        }
    }
}

impl ReactorConfig {
    /// Shorter intervals for local testing.
    pub fn dev_default() -> Self {
        Self {
            gossip_interval_ms: 10,
            max_peers: 10,
            max_message_size: 1_048_576,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ReactorConfig::default();
        assert_eq!(config.gossip_interval_ms, 100);
        assert_eq!(config.max_peers, 200);
        assert!(config.max_message_size >= 1 << 20);
    }
}
