//! Signed consensus ballots.
//!
//! A [`Vote`] is one validator's prevote or precommit for a block hash (or
//! nil, encoded as the all-zero hash) at a given height and round. The
//! signature covers the canonical RLP of every other field, so a vote is
//! immutable and self-authenticating: recovery yields the signer's address.
//!
//! `VoteType::Proposal` exists only to build the proposal signing digest and
//! never appears inside a vote set.

use {
    reimint_types::{keccak, Address, Signature, SignatureError, Signer, H256},
    rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream},
};

/// Discriminates the signing domain of a ballot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VoteType {
    Prevote = 1,
    Precommit = 2,
    /// Only used to derive the proposal signing digest.
    Proposal = 32,
}

impl VoteType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Prevote),
            2 => Some(Self::Precommit),
            32 => Some(Self::Proposal),
            _ => None,
        }
    }
}

impl std::fmt::Display for VoteType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Prevote => write!(f, "prevote"),
            Self::Precommit => write!(f, "precommit"),
            Self::Proposal => write!(f, "proposal"),
        }
    }
}

/// Canonical vote signing digest:
/// `keccak256(RLP([chain_id, type, height, round, block_hash, timestamp]))`.
pub fn vote_digest(
    chain_id: u64,
    kind: VoteType,
    height: u64,
    round: u32,
    block_hash: H256,
    timestamp: u64,
) -> H256 {
    let mut s = RlpStream::new_list(6);
    s.append(&chain_id);
    s.append(&kind.as_u8());
    s.append(&height);
    s.append(&round);
    s.append(&block_hash);
    s.append(&timestamp);
    keccak(s.out())
}

/// A signed prevote or precommit.
///
/// `block_hash == H256::zero()` is the nil vote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vote {
    pub chain_id: u64,
    pub kind: VoteType,
    pub height: u64,
    pub round: u32,
    pub block_hash: H256,
    pub timestamp: u64,
    pub validator_index: u32,
    pub signature: Signature,
}

impl Vote {
    /// Construct and sign a vote in one step.
    #[allow(clippy::too_many_arguments)]
    pub fn signed(
        chain_id: u64,
        kind: VoteType,
        height: u64,
        round: u32,
        block_hash: H256,
        timestamp: u64,
        validator_index: u32,
        signer: &dyn Signer,
    ) -> Self {
        let digest = vote_digest(chain_id, kind, height, round, block_hash, timestamp);
        Self {
            chain_id,
            kind,
            height,
            round,
            block_hash,
            timestamp,
            validator_index,
            signature: signer.sign(digest),
        }
    }

    /// The digest this vote's signature covers.
    pub fn signing_digest(&self) -> H256 {
        vote_digest(
            self.chain_id,
            self.kind,
            self.height,
            self.round,
            self.block_hash,
            self.timestamp,
        )
    }

    /// Recover the signer's address.
    pub fn recover_signer(&self) -> Result<Address, SignatureError> {
        self.signature.recover(self.signing_digest())
    }

    /// True when the signature recovers to `expected`.
    pub fn verify(&self, expected: &Address) -> bool {
        matches!(self.recover_signer(), Ok(addr) if addr == *expected)
    }

    /// A nil vote carries the all-zero hash.
    pub fn is_nil(&self) -> bool {
        self.block_hash.is_zero()
    }

    /// Content digest of the full vote (including the signature); used as a
    /// storage key for evidence.
    pub fn hash(&self) -> H256 {
        keccak(rlp::encode(self))
    }
}

impl Encodable for Vote {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(8);
        s.append(&self.chain_id);
        s.append(&self.kind.as_u8());
        s.append(&self.height);
        s.append(&self.round);
        s.append(&self.block_hash);
        s.append(&self.timestamp);
        s.append(&self.validator_index);
        s.append(&self.signature);
    }
}

impl Decodable for Vote {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        if rlp.item_count()? != 8 {
            return Err(DecoderError::RlpIncorrectListLen);
        }
        let kind = VoteType::from_u8(rlp.val_at(1)?)
            .ok_or(DecoderError::Custom("unknown vote type"))?;
        if kind == VoteType::Proposal {
            return Err(DecoderError::Custom("proposal type not allowed in votes"));
        }
        Ok(Self {
            chain_id: rlp.val_at(0)?,
            kind,
            height: rlp.val_at(2)?,
            round: rlp.val_at(3)?,
            block_hash: rlp.val_at(4)?,
            timestamp: rlp.val_at(5)?,
            validator_index: rlp.val_at(6)?,
            signature: rlp.val_at(7)?,
        })
    }
}

impl std::fmt::Display for Vote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} h={} r={} idx={} hash={}",
            self.kind,
            self.height,
            self.round,
            self.validator_index,
            if self.is_nil() {
                "nil".to_string()
            } else {
                format!("{:?}", self.block_hash)
            }
        )
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
