//! Per-(height, round, type) vote tally.
//!
//! A [`VoteSet`] admits at most one vote per validator index. A second vote
//! from the same index for a *different* hash is surfaced as
//! [`VoteSetError::ConflictingVotes`] carrying both ballots — the caller
//! turns that into slashable evidence; the tally itself keeps the original.
//!
//! `maj23` latches the first block hash whose accumulated voting power
//! strictly exceeds two thirds of the total and never changes afterwards.

use {
    crate::{
        bit_array::BitArray,
        validator_set::ValidatorSet,
        vote::{Vote, VoteType},
        PeerId,
    },
    log::debug,
    reimint_types::{Signature, H256},
    std::{collections::HashMap, sync::Arc},
    thiserror::Error,
};

/// Errors from [`VoteSet::add_vote`].
#[derive(Debug, Clone, Error)]
pub enum VoteSetError {
    /// The vote belongs to a different (height, round, type) or chain.
    #[error("unexpected vote: got ({height}, {round}, {kind}), want ({want_height}, {want_round}, {want_kind})")]
    UnexpectedVote {
        height: u64,
        round: u32,
        kind: VoteType,
        want_height: u64,
        want_round: u32,
        want_kind: VoteType,
    },

    /// The validator index does not exist in the set.
    #[error("validator index {0} out of range")]
    InvalidValidatorIndex(u32),

    /// The signature does not recover to the validator at that index.
    #[error("invalid signature from validator index {0}")]
    InvalidSignature(u32),

    /// Same validator, same (height, round, type), different block hash.
    /// Carries both votes for the evidence pool.
    #[error("conflicting votes from validator index {}", existing.validator_index)]
    ConflictingVotes {
        existing: Box<Vote>,
        conflicting: Box<Vote>,
    },

    /// A peer pushed votes for more future rounds than it is allowed to seed.
    #[error("unwanted round {0}")]
    GotVoteFromUnwantedRound(u32),
}

/// Accumulated votes for one block hash.
#[derive(Debug, Clone)]
struct BlockVotes {
    power: u64,
    voters: BitArray,
}

/// All votes of one type at one (height, round).
#[derive(Debug, Clone)]
pub struct VoteSet {
    chain_id: u64,
    height: u64,
    round: u32,
    kind: VoteType,
    validators: Arc<ValidatorSet>,
    /// One slot per validator index.
    votes: Vec<Option<Vote>>,
    voters: BitArray,
    /// Total voting power of everyone who voted, regardless of hash.
    sum: u64,
    /// First hash to cross the two-thirds line; immutable once set.
    maj23: Option<H256>,
    /// Tallies keyed by block-hash content.
    votes_by_block: HashMap<H256, BlockVotes>,
    /// Two-thirds claims peers have announced for this set.
    peer_maj23s: HashMap<PeerId, H256>,
}

impl VoteSet {
    pub fn new(
        chain_id: u64,
        height: u64,
        round: u32,
        kind: VoteType,
        validators: Arc<ValidatorSet>,
    ) -> Self {
        assert!(
            kind != VoteType::Proposal,
            "proposal ballots are never tallied"
        );
        let n = validators.len();
        Self {
            chain_id,
            height,
            round,
            kind,
            validators,
            votes: vec![None; n],
            voters: BitArray::new(n),
            sum: 0,
            maj23: None,
            votes_by_block: HashMap::new(),
            peer_maj23s: HashMap::new(),
        }
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn kind(&self) -> VoteType {
        self.kind
    }

    /// Add a verified vote. `Ok(true)` means the tally changed; `Ok(false)`
    /// means an identical vote was already present.
    pub fn add_vote(&mut self, vote: Vote) -> Result<bool, VoteSetError> {
        if vote.chain_id != self.chain_id
            || vote.height != self.height
            || vote.round != self.round
            || vote.kind != self.kind
        {
            return Err(VoteSetError::UnexpectedVote {
                height: vote.height,
                round: vote.round,
                kind: vote.kind,
                want_height: self.height,
                want_round: self.round,
                want_kind: self.kind,
            });
        }

        let idx = vote.validator_index as usize;
        let validator = self
            .validators
            .get(idx)
            .ok_or(VoteSetError::InvalidValidatorIndex(vote.validator_index))?
            .clone();

        if let Some(existing) = &self.votes[idx] {
            if existing.block_hash == vote.block_hash {
                return Ok(false);
            }
            // Only flag a conflict when the second ballot is genuinely
            // signed by the validator; forged duplicates are just dropped.
            if !vote.verify(&validator.address) {
                return Err(VoteSetError::InvalidSignature(vote.validator_index));
            }
            return Err(VoteSetError::ConflictingVotes {
                existing: Box::new(existing.clone()),
                conflicting: Box::new(vote),
            });
        }

        if !vote.verify(&validator.address) {
            return Err(VoteSetError::InvalidSignature(vote.validator_index));
        }

        let block_hash = vote.block_hash;
        self.votes[idx] = Some(vote);
        self.voters.set(idx, true);
        self.sum += validator.voting_power;

        let n = self.validators.len();
        let entry = self
            .votes_by_block
            .entry(block_hash)
            .or_insert_with(|| BlockVotes {
                power: 0,
                voters: BitArray::new(n),
            });
        entry.power += validator.voting_power;
        entry.voters.set(idx, true);

        if self.maj23.is_none() && self.validators.is_two_thirds(entry.power) {
            debug!(
                "{} set reached 2/3 for {:?} at h={} r={}",
                self.kind, block_hash, self.height, self.round
            );
            self.maj23 = Some(block_hash);
        }
        Ok(true)
    }

    /// The vote of a validator index, if present.
    pub fn get(&self, index: u32) -> Option<&Vote> {
        self.votes.get(index as usize).and_then(|v| v.as_ref())
    }

    /// The latched two-thirds hash (may be the nil hash).
    pub fn two_thirds_majority(&self) -> Option<H256> {
        self.maj23
    }

    pub fn has_two_thirds_majority(&self) -> bool {
        self.maj23.is_some()
    }

    /// True once the combined power of all voters — across every hash —
    /// exceeds two thirds.
    pub fn has_two_thirds_any(&self) -> bool {
        self.validators.is_two_thirds(self.sum)
    }

    /// Combined power of everyone who voted.
    pub fn sum(&self) -> u64 {
        self.sum
    }

    /// Record a peer's claim that it has seen a two-thirds majority for
    /// `block_hash`. The claim only steers targeted gossip; it is never
    /// trusted for state transitions.
    pub fn set_peer_maj23(&mut self, peer: PeerId, block_hash: H256) {
        if let Some(prev) = self.peer_maj23s.get(&peer) {
            if *prev != block_hash {
                debug!(
                    "peer {peer} changed its 2/3 claim at h={} r={} ({:?} -> {:?})",
                    self.height, self.round, prev, block_hash
                );
            }
        }
        self.peer_maj23s.insert(peer, block_hash);
    }

    /// Bitmap of every validator that voted (any hash).
    pub fn bit_array(&self) -> BitArray {
        self.voters.clone()
    }

    /// Bitmap of validators that voted for a specific hash.
    pub fn bit_array_by_block_hash(&self, block_hash: &H256) -> Option<BitArray> {
        self.votes_by_block.get(block_hash).map(|bv| bv.voters.clone())
    }

    /// Build the commit aggregate justifying `maj23`: the voter bitmap plus
    /// the signatures in ascending validator-index order.
    ///
    /// Only meaningful for precommit sets with a latched non-nil majority.
    pub fn make_commit(&self) -> Option<(BitArray, Vec<Signature>)> {
        if self.kind != VoteType::Precommit {
            return None;
        }
        let maj23 = self.maj23?;
        if maj23.is_zero() {
            return None;
        }
        let voters = self.bit_array_by_block_hash(&maj23)?;
        let mut signatures = Vec::with_capacity(voters.count_ones());
        for idx in voters.iter_ones() {
            let vote = self.votes[idx].as_ref()?;
            signatures.push(vote.signature);
        }
        Some((voters, signatures))
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
