//! Reimint consensus configuration.
//!
//! Timing parameters, the evidence-age window, and queue sizes for the
//! height/round/step state machine. Chain id and the minimum voting power
//! are plumbed through here rather than read from any global state.

/// Configuration for the Reimint consensus engine.
///
/// All timeouts are in milliseconds. Waiting timeouts grow linearly with the
/// round number so that consecutive failed rounds leave progressively more
/// time for slow proposers and links.
#[derive(Debug, Clone)]
pub struct ReimintConfig {
    /// Chain identifier mixed into every signing digest.
    pub chain_id: u64,

    /// Base timeout for the propose phase in milliseconds.
    /// The actual timeout is `base + delta * round`.
    /// Default: 3000.
    pub propose_timeout_base_ms: u64,

    /// Additional propose timeout per round. Default: 500.
    pub propose_timeout_delta_ms: u64,

    /// Base timeout for the prevote-wait phase in milliseconds. Default: 3000.
    pub prevote_timeout_base_ms: u64,

    /// Additional prevote-wait timeout per round. Default: 500.
    pub prevote_timeout_delta_ms: u64,

    /// Base timeout for the precommit-wait phase in milliseconds. Default: 3000.
    pub precommit_timeout_base_ms: u64,

    /// Additional precommit-wait timeout per round. Default: 500.
    pub precommit_timeout_delta_ms: u64,

    /// How long to linger after a commit before starting the next height,
    /// giving slow validators a chance to catch up. Default: 1000.
    pub commit_timeout_ms: u64,

    /// When non-zero and the transaction pool is empty, round 0 waits this
    /// long before proposing an empty block. Default: 0 (propose immediately).
    pub create_empty_blocks_interval_ms: u64,

    /// Skip the commit linger entirely and start the next height as soon as
    /// a block is finalized. Default: false.
    pub skip_timeout_commit: bool,

    /// Evidence older than this many blocks is pruned and refused.
    /// Default: 10_000.
    pub max_age_num_blocks: u64,

    /// Byte budget for evidence embedded into a single proposed block.
    /// Default: 65_536.
    pub max_evidence_bytes: u64,

    /// Validators below this voting power are excluded from the set.
    /// Default: 1.
    pub min_voting_power: u64,

    /// Bounded size of the state machine's input queue; the oldest event is
    /// dropped (with a warning) when it overflows. Default: 10.
    pub message_queue_size: usize,

    /// Number of historic validator sets kept in the by-state-root cache.
    /// Default: 120.
    pub validator_set_cache_size: usize,
}

impl Default for ReimintConfig {
    fn default() -> Self {
        Self {
            chain_id: 1,
            propose_timeout_base_ms: 3000,
            propose_timeout_delta_ms: 500,
            prevote_timeout_base_ms: 3000,
            prevote_timeout_delta_ms: 500,
            precommit_timeout_base_ms: 3000,
            precommit_timeout_delta_ms: 500,
            commit_timeout_ms: 1000,
            create_empty_blocks_interval_ms: 0,
            skip_timeout_commit: false,
            max_age_num_blocks: 10_000,
            max_evidence_bytes: 65_536,
            min_voting_power: 1,
            message_queue_size: 10,
            validator_set_cache_size: 120,
        }
    }
}

impl ReimintConfig {
    /// Propose timeout for a given round.
    pub fn propose_timeout_ms(&self, round: u32) -> u64 {
        self.propose_timeout_base_ms + self.propose_timeout_delta_ms * round as u64
    }

    /// Prevote-wait timeout for a given round.
    pub fn prevote_timeout_ms(&self, round: u32) -> u64 {
        self.prevote_timeout_base_ms + self.prevote_timeout_delta_ms * round as u64
    }

    /// Precommit-wait timeout for a given round.
    pub fn precommit_timeout_ms(&self, round: u32) -> u64 {
        self.precommit_timeout_base_ms + self.precommit_timeout_delta_ms * round as u64
    }

    /// Validate configuration parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.propose_timeout_base_ms == 0 {
            return Err(ConfigError::InvalidTimeout("propose_timeout_base_ms"));
        }
        if self.prevote_timeout_base_ms == 0 {
            return Err(ConfigError::InvalidTimeout("prevote_timeout_base_ms"));
        }
        if self.precommit_timeout_base_ms == 0 {
            return Err(ConfigError::InvalidTimeout("precommit_timeout_base_ms"));
        }
        if self.message_queue_size == 0 {
            return Err(ConfigError::InvalidQueueSize);
        }
        if self.max_age_num_blocks == 0 {
            return Err(ConfigError::InvalidEvidenceAge);
        }
        if self.validator_set_cache_size == 0 {
            return Err(ConfigError::InvalidCacheSize);
        }
        Ok(())
    }
}

/// Errors in consensus configuration.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be > 0")]
    InvalidTimeout(&'static str),
    #[error("message_queue_size must be > 0")]
    InvalidQueueSize,
    #[error("max_age_num_blocks must be > 0")]
    InvalidEvidenceAge,
    #[error("validator_set_cache_size must be > 0")]
    InvalidCacheSize,
}
