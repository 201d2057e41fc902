//! Consensus wire messages.
//!
//! Every frame on the consensus channel is a two-item RLP envelope
//! `[code, payload]`. Codes 0–9 cover round-step announcements, proposal and
//! block gossip, votes, and the two-thirds bitmap exchange used for targeted
//! catch-up gossip.

use {
    crate::{
        bit_array::BitArray,
        proposal::Proposal,
        round_state::Step,
        vote::{Vote, VoteType},
    },
    reimint_types::{Block, H256},
    rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream},
};

/// Wire codes, one per message variant.
mod code {
    pub const NEW_ROUND_STEP: u8 = 0;
    pub const NEW_VALID_BLOCK: u8 = 1;
    pub const HAS_VOTE: u8 = 2;
    pub const PROPOSAL: u8 = 3;
    pub const PROPOSAL_POL: u8 = 4;
    pub const PROPOSAL_BLOCK: u8 = 5;
    pub const VOTE: u8 = 6;
    pub const VOTE_SET_MAJ23: u8 = 7;
    pub const VOTE_SET_BITS: u8 = 8;
    pub const GET_PROPOSAL_BLOCK: u8 = 9;
}

/// Top-level consensus message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsensusMessage {
    /// Periodic announcement of our (height, round, step).
    NewRoundStep {
        height: u64,
        round: u32,
        step: Step,
        seconds_since_start_time: u64,
        /// Commit round of the previous height, if any.
        last_commit_round: Option<u32>,
    },

    /// We accepted a block as valid (or decided it); peers missing it should
    /// fetch it.
    NewValidBlock {
        height: u64,
        round: u32,
        block_hash: H256,
        is_commit: bool,
    },

    /// We hold the vote of `index` at (height, round, kind).
    HasVote {
        height: u64,
        round: u32,
        kind: VoteType,
        index: u32,
    },

    /// The round proposer's signed proposal.
    Proposal(Proposal),

    /// Which prevotes we hold for the proposal's proof-of-lock round.
    ProposalPol {
        height: u64,
        proposal_pol_round: u32,
        proposal_pol: BitArray,
    },

    /// The full proposed block.
    ProposalBlock(Block),

    /// A single signed vote.
    Vote(Vote),

    /// Claim: we have seen two-thirds for `block_hash` at (height, round, kind).
    VoteSetMaj23 {
        height: u64,
        round: u32,
        kind: VoteType,
        block_hash: H256,
    },

    /// Answer to a maj23 claim: the bitmap of votes we hold for that hash.
    VoteSetBits {
        height: u64,
        round: u32,
        kind: VoteType,
        block_hash: H256,
        votes: BitArray,
    },

    /// Request the full block with the given hash.
    GetProposalBlock { block_hash: H256 },
}

impl ConsensusMessage {
    /// Short tag for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NewRoundStep { .. } => "new_round_step",
            Self::NewValidBlock { .. } => "new_valid_block",
            Self::HasVote { .. } => "has_vote",
            Self::Proposal(_) => "proposal",
            Self::ProposalPol { .. } => "proposal_pol",
            Self::ProposalBlock(_) => "proposal_block",
            Self::Vote(_) => "vote",
            Self::VoteSetMaj23 { .. } => "vote_set_maj23",
            Self::VoteSetBits { .. } => "vote_set_bits",
            Self::GetProposalBlock { .. } => "get_proposal_block",
        }
    }

    /// Encode into the `[code, payload]` envelope.
    pub fn encode(&self) -> Vec<u8> {
        rlp::encode(self).to_vec()
    }

    /// Decode from the `[code, payload]` envelope.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecoderError> {
        rlp::decode(bytes)
    }
}

fn append_vote_type(s: &mut RlpStream, kind: VoteType) {
    s.append(&kind.as_u8());
}

fn vote_type_at(rlp: &Rlp, i: usize) -> Result<VoteType, DecoderError> {
    VoteType::from_u8(rlp.val_at(i)?).ok_or(DecoderError::Custom("unknown vote type"))
}

impl Encodable for ConsensusMessage {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(2);
        match self {
            Self::NewRoundStep {
                height,
                round,
                step,
                seconds_since_start_time,
                last_commit_round,
            } => {
                s.append(&code::NEW_ROUND_STEP);
                s.begin_list(5);
                s.append(height);
                s.append(round);
                s.append(&step.as_u8());
                s.append(seconds_since_start_time);
                // Offset by one: zero means "no previous commit".
                s.append(&last_commit_round.map(|r| r as u64 + 1).unwrap_or(0));
            }
            Self::NewValidBlock {
                height,
                round,
                block_hash,
                is_commit,
            } => {
                s.append(&code::NEW_VALID_BLOCK);
                s.begin_list(4);
                s.append(height);
                s.append(round);
                s.append(block_hash);
                s.append(&(*is_commit as u8));
            }
            Self::HasVote {
                height,
                round,
                kind,
                index,
            } => {
                s.append(&code::HAS_VOTE);
                s.begin_list(4);
                s.append(height);
                s.append(round);
                append_vote_type(s, *kind);
                s.append(index);
            }
            Self::Proposal(p) => {
                s.append(&code::PROPOSAL);
                s.append(p);
            }
            Self::ProposalPol {
                height,
                proposal_pol_round,
                proposal_pol,
            } => {
                s.append(&code::PROPOSAL_POL);
                s.begin_list(3);
                s.append(height);
                s.append(proposal_pol_round);
                s.append(proposal_pol);
            }
            Self::ProposalBlock(b) => {
                s.append(&code::PROPOSAL_BLOCK);
                s.append(b);
            }
            Self::Vote(v) => {
                s.append(&code::VOTE);
                s.append(v);
            }
            Self::VoteSetMaj23 {
                height,
                round,
                kind,
                block_hash,
            } => {
                s.append(&code::VOTE_SET_MAJ23);
                s.begin_list(4);
                s.append(height);
                s.append(round);
                append_vote_type(s, *kind);
                s.append(block_hash);
            }
            Self::VoteSetBits {
                height,
                round,
                kind,
                block_hash,
                votes,
            } => {
                s.append(&code::VOTE_SET_BITS);
                s.begin_list(5);
                s.append(height);
                s.append(round);
                append_vote_type(s, *kind);
                s.append(block_hash);
                s.append(votes);
            }
            Self::GetProposalBlock { block_hash } => {
                s.append(&code::GET_PROPOSAL_BLOCK);
                s.begin_list(1);
                s.append(block_hash);
            }
        }
    }
}

impl Decodable for ConsensusMessage {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        if rlp.item_count()? != 2 {
            return Err(DecoderError::RlpIncorrectListLen);
        }
        let msg_code: u8 = rlp.val_at(0)?;
        let payload = rlp.at(1)?;
        match msg_code {
            code::NEW_ROUND_STEP => {
                if payload.item_count()? != 5 {
                    return Err(DecoderError::RlpIncorrectListLen);
                }
                let step = Step::from_u8(payload.val_at(2)?)
                    .ok_or(DecoderError::Custom("unknown step"))?;
                let lcr: u64 = payload.val_at(4)?;
                Ok(Self::NewRoundStep {
                    height: payload.val_at(0)?,
                    round: payload.val_at(1)?,
                    step,
                    seconds_since_start_time: payload.val_at(3)?,
                    last_commit_round: if lcr == 0 { None } else { Some((lcr - 1) as u32) },
                })
            }
            code::NEW_VALID_BLOCK => {
                if payload.item_count()? != 4 {
                    return Err(DecoderError::RlpIncorrectListLen);
                }
                let is_commit: u8 = payload.val_at(3)?;
                Ok(Self::NewValidBlock {
                    height: payload.val_at(0)?,
                    round: payload.val_at(1)?,
                    block_hash: payload.val_at(2)?,
                    is_commit: is_commit != 0,
                })
            }
            code::HAS_VOTE => {
                if payload.item_count()? != 4 {
                    return Err(DecoderError::RlpIncorrectListLen);
                }
                Ok(Self::HasVote {
                    height: payload.val_at(0)?,
                    round: payload.val_at(1)?,
                    kind: vote_type_at(&payload, 2)?,
                    index: payload.val_at(3)?,
                })
            }
            code::PROPOSAL => Ok(Self::Proposal(payload.as_val()?)),
            code::PROPOSAL_POL => {
                if payload.item_count()? != 3 {
                    return Err(DecoderError::RlpIncorrectListLen);
                }
                Ok(Self::ProposalPol {
                    height: payload.val_at(0)?,
                    proposal_pol_round: payload.val_at(1)?,
                    proposal_pol: payload.val_at(2)?,
                })
            }
            code::PROPOSAL_BLOCK => Ok(Self::ProposalBlock(payload.as_val()?)),
            code::VOTE => Ok(Self::Vote(payload.as_val()?)),
            code::VOTE_SET_MAJ23 => {
                if payload.item_count()? != 4 {
                    return Err(DecoderError::RlpIncorrectListLen);
                }
                Ok(Self::VoteSetMaj23 {
                    height: payload.val_at(0)?,
                    round: payload.val_at(1)?,
                    kind: vote_type_at(&payload, 2)?,
                    block_hash: payload.val_at(3)?,
                })
            }
            code::VOTE_SET_BITS => {
                if payload.item_count()? != 5 {
                    return Err(DecoderError::RlpIncorrectListLen);
                }
                Ok(Self::VoteSetBits {
                    height: payload.val_at(0)?,
                    round: payload.val_at(1)?,
                    kind: vote_type_at(&payload, 2)?,
                    block_hash: payload.val_at(3)?,
                    votes: payload.val_at(4)?,
                })
            }
            code::GET_PROPOSAL_BLOCK => {
                if payload.item_count()? != 1 {
                    return Err(DecoderError::RlpIncorrectListLen);
                }
                Ok(Self::GetProposalBlock {
                    block_hash: payload.val_at(0)?,
                })
            }
            _ => Err(DecoderError::Custom("unknown message code")),
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
