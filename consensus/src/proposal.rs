//! Signed block proposals.
//!
//! One proposal exists per (height, round), signed by that round's elected
//! proposer. `pol_round` points at the earlier prevote majority that
//! justifies re-proposing a locked or valid block; absent, the proposal
//! stands on its own. On the wire and in digests the round is stored offset
//! by one, so "no proof-of-lock" encodes as zero.

use {
    crate::vote::VoteType,
    reimint_types::{keccak, Address, Signature, SignatureError, Signer, H256},
    rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream},
};

/// Encode an optional proof-of-lock round for RLP (offset by one).
pub(crate) fn pol_round_to_wire(pol_round: Option<u32>) -> u64 {
    match pol_round {
        Some(r) => r as u64 + 1,
        None => 0,
    }
}

/// Decode the offset-by-one wire form back into an optional round.
pub(crate) fn pol_round_from_wire(wire: u64) -> Result<Option<u32>, DecoderError> {
    if wire == 0 {
        Ok(None)
    } else if wire - 1 <= u32::MAX as u64 {
        Ok(Some((wire - 1) as u32))
    } else {
        Err(DecoderError::Custom("pol round out of range"))
    }
}

/// A proposer's signed (height, round, block hash) commitment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    pub chain_id: u64,
    pub height: u64,
    pub round: u32,
    /// Round of the prevote majority justifying this proposal, if any.
    pub pol_round: Option<u32>,
    pub block_hash: H256,
    pub timestamp: u64,
    pub signature: Signature,
}

impl Proposal {
    /// Construct and sign in one step.
    pub fn signed(
        chain_id: u64,
        height: u64,
        round: u32,
        pol_round: Option<u32>,
        block_hash: H256,
        timestamp: u64,
        signer: &dyn Signer,
    ) -> Self {
        let digest = proposal_digest(chain_id, height, round, pol_round, block_hash, timestamp);
        Self {
            chain_id,
            height,
            round,
            pol_round,
            block_hash,
            timestamp,
            signature: signer.sign(digest),
        }
    }

    /// The digest this proposal's signature covers.
    pub fn signing_digest(&self) -> H256 {
        proposal_digest(
            self.chain_id,
            self.height,
            self.round,
            self.pol_round,
            self.block_hash,
            self.timestamp,
        )
    }

    /// Recover the proposer address from the signature.
    pub fn recover_signer(&self) -> Result<Address, SignatureError> {
        self.signature.recover(self.signing_digest())
    }

    /// True when the signature recovers to `expected`.
    pub fn validate_signature(&self, expected: &Address) -> bool {
        matches!(self.recover_signer(), Ok(addr) if addr == *expected)
    }

    /// A proof-of-lock round must predate the proposal's own round.
    pub fn pol_round_is_valid(&self) -> bool {
        match self.pol_round {
            None => true,
            Some(r) => r < self.round,
        }
    }
}

/// Canonical proposal signing digest:
/// `keccak256(RLP([chain_id, 32, height, round, pol_round, block_hash, timestamp]))`.
pub fn proposal_digest(
    chain_id: u64,
    height: u64,
    round: u32,
    pol_round: Option<u32>,
    block_hash: H256,
    timestamp: u64,
) -> H256 {
    let mut s = RlpStream::new_list(7);
    s.append(&chain_id);
    s.append(&VoteType::Proposal.as_u8());
    s.append(&height);
    s.append(&round);
    s.append(&pol_round_to_wire(pol_round));
    s.append(&block_hash);
    s.append(&timestamp);
    keccak(s.out())
}

impl Encodable for Proposal {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(7);
        s.append(&self.chain_id);
        s.append(&self.height);
        s.append(&self.round);
        s.append(&pol_round_to_wire(self.pol_round));
        s.append(&self.block_hash);
        s.append(&self.timestamp);
        s.append(&self.signature);
    }
}

impl Decodable for Proposal {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        if rlp.item_count()? != 7 {
            return Err(DecoderError::RlpIncorrectListLen);
        }
        Ok(Self {
            chain_id: rlp.val_at(0)?,
            height: rlp.val_at(1)?,
            round: rlp.val_at(2)?,
            pol_round: pol_round_from_wire(rlp.val_at(3)?)?,
            block_hash: rlp.val_at(4)?,
            timestamp: rlp.val_at(5)?,
            signature: rlp.val_at(6)?,
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
