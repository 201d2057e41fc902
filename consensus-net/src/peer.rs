//! Per-peer consensus bookkeeping.
//!
//! The reactor keeps, for every connected peer, a [`PeerRoundState`]: where
//! the peer is in the protocol and which votes it already holds. Gossip
//! consults this to send each peer only what it is missing; the peer updates
//! it through `NewRoundStep`, `HasVote`, `ProposalPol`, and `VoteSetBits`
//! messages, and we update it optimistically for everything we send.

use {
    log::debug,
    reimint_consensus::{BitArray, PeerId, Step, VoteType},
    std::collections::{BTreeMap, HashSet},
    tokio::sync::mpsc,
};

/// What we know about a peer's position in the protocol.
#[derive(Debug, Clone)]
pub struct PeerRoundState {
    pub height: u64,
    pub round: u32,
    pub step: Step,
    /// Whether the peer holds the current round's proposal.
    pub has_proposal: bool,
    /// Whether the peer holds the current proposal's full block.
    pub has_proposal_block: bool,
    /// Proof-of-lock round the peer advertised for its proposal.
    pub proposal_pol_round: Option<u32>,
    /// Validator indices whose votes the peer holds, per (round, type).
    known_votes: BTreeMap<(u32, u8), HashSet<u32>>,
}

impl Default for PeerRoundState {
    fn default() -> Self {
        Self {
            height: 0,
            round: 0,
            step: Step::NewHeight,
            has_proposal: false,
            has_proposal_block: false,
            proposal_pol_round: None,
            known_votes: BTreeMap::new(),
        }
    }
}

impl PeerRoundState {
    /// Record a round-step announcement, resetting per-round knowledge when
    /// the peer moves.
    pub fn apply_new_round_step(&mut self, height: u64, round: u32, step: Step) {
        if height != self.height {
            debug!("peer moved to height {height}");
            self.known_votes.clear();
            self.has_proposal = false;
            self.has_proposal_block = false;
            self.proposal_pol_round = None;
        } else if round != self.round {
            self.has_proposal = false;
            self.has_proposal_block = false;
            self.proposal_pol_round = None;
            // Keep vote knowledge: it is keyed per round.
        }
        self.height = height;
        self.round = round;
        self.step = step;
        // Trim vote knowledge from long-dead rounds.
        let keep_from = round.saturating_sub(1);
        self.known_votes.retain(|(r, _), _| *r >= keep_from);
    }

    /// Record that the peer holds the vote of `index` at (round, kind).
    pub fn set_has_vote(&mut self, height: u64, round: u32, kind: VoteType, index: u32) {
        if height != self.height {
            return;
        }
        self.known_votes
            .entry((round, kind.as_u8()))
            .or_default()
            .insert(index);
    }

    /// Merge a bitmap of votes the peer claims to hold.
    pub fn apply_vote_bits(&mut self, height: u64, round: u32, kind: VoteType, bits: &BitArray) {
        if height != self.height {
            return;
        }
        let entry = self.known_votes.entry((round, kind.as_u8())).or_default();
        for index in bits.iter_ones() {
            entry.insert(index as u32);
        }
    }

    /// Record the peer's advertised proof-of-lock bitmap.
    pub fn apply_proposal_pol(&mut self, height: u64, pol_round: u32, bits: &BitArray) {
        if height != self.height {
            return;
        }
        self.proposal_pol_round = Some(pol_round);
        self.apply_vote_bits(height, pol_round, VoteType::Prevote, bits);
    }

    /// Whether the peer already holds this vote.
    pub fn has_vote(&self, round: u32, kind: VoteType, index: u32) -> bool {
        self.known_votes
            .get(&(round, kind.as_u8()))
            .map(|set| set.contains(&index))
            .unwrap_or(false)
    }
}

/// A tracked peer: its protocol position plus the outbound frame channel.
#[derive(Debug)]
pub struct Peer {
    pub id: PeerId,
    pub state: PeerRoundState,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
}

impl Peer {
    pub fn new(id: PeerId, outbound: mpsc::UnboundedSender<Vec<u8>>) -> Self {
        Self {
            id,
            state: PeerRoundState::default(),
            outbound,
        }
    }

    /// Queue an encoded frame for this peer. Returns false when the peer's
    /// connection is gone.
    pub fn send(&self, frame: Vec<u8>) -> bool {
        self.outbound.send(frame).is_ok()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
