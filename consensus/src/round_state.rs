//! Transient per-height consensus state.

use {
    crate::{height_vote_set::HeightVoteSet, proposal::Proposal, validator_set::ValidatorSet},
    reimint_types::{Block, H256},
    std::{sync::Arc, time::Instant},
};

/// Phase within a round. Ordering follows protocol progression, so step
/// guards can compare variants directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Step {
    NewHeight = 1,
    NewRound = 2,
    Propose = 3,
    Prevote = 4,
    PrevoteWait = 5,
    Precommit = 6,
    PrecommitWait = 7,
    Commit = 8,
}

impl Step {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::NewHeight),
            2 => Some(Self::NewRound),
            3 => Some(Self::Propose),
            4 => Some(Self::Prevote),
            5 => Some(Self::PrevoteWait),
            6 => Some(Self::Precommit),
            7 => Some(Self::PrecommitWait),
            8 => Some(Self::Commit),
            _ => None,
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::NewHeight => "NewHeight",
            Self::NewRound => "NewRound",
            Self::Propose => "Propose",
            Self::Prevote => "Prevote",
            Self::PrevoteWait => "PrevoteWait",
            Self::Precommit => "Precommit",
            Self::PrecommitWait => "PrecommitWait",
            Self::Commit => "Commit",
        };
        write!(f, "{name}")
    }
}

/// Everything the state machine tracks while deciding one height.
/// Created on the previous height's commit, destroyed on this height's.
#[derive(Debug, Clone)]
pub struct RoundState {
    pub height: u64,
    pub round: u32,
    pub step: Step,

    /// When this height's round 0 is allowed to begin.
    pub start_time: Instant,
    /// Set on entering Commit; seeds the next height's start time.
    pub commit_time: Option<Instant>,

    /// Validator set advanced to the current round's proposer.
    pub validators: Arc<ValidatorSet>,

    /// Identity of the parent block.
    pub parent_hash: H256,
    /// Parent state root; keys the validator-set cache.
    pub parent_state_root: H256,

    pub proposal: Option<Proposal>,
    pub proposal_block_hash: Option<H256>,
    pub proposal_block: Option<Block>,

    pub locked_round: Option<u32>,
    pub locked_block: Option<Block>,

    pub valid_round: Option<u32>,
    pub valid_block: Option<Block>,

    pub votes: HeightVoteSet,

    pub commit_round: Option<u32>,
    pub triggered_timeout_precommit: bool,
}

impl RoundState {
    pub fn new(
        chain_id: u64,
        height: u64,
        validators: Arc<ValidatorSet>,
        parent_hash: H256,
        parent_state_root: H256,
        start_time: Instant,
    ) -> Self {
        Self {
            height,
            round: 0,
            step: Step::NewHeight,
            start_time,
            commit_time: None,
            votes: HeightVoteSet::new(chain_id, height, validators.clone()),
            validators,
            parent_hash,
            parent_state_root,
            proposal: None,
            proposal_block_hash: None,
            proposal_block: None,
            locked_round: None,
            locked_block: None,
            valid_round: None,
            valid_block: None,
            commit_round: None,
            triggered_timeout_precommit: false,
        }
    }
}
