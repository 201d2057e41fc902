//! The consensus seal carried in `header.extra_data`.
//!
//! Layout: the first 32 bytes of `extra_data` are proposer vanity; the rest
//! is `RLP([round, commit_round, pol_round, [evidence…], proposal,
//! commit_bitmap, [signature…]])`. A pending block is sealed with an empty
//! commit (the proposer fills evidence and its signed proposal); finalizing
//! replaces the seal with one that includes the precommit aggregate.
//!
//! **Block identity.** The block hash is `keccak256` of the header with its
//! seal replaced by `vanity ‖ keccak256(ev₁) ‖ keccak256(ev₂) ‖ …`. Evidence
//! is therefore part of a block's identity; the proposal and the precommit
//! aggregate are not, so the same decided block hashes identically no matter
//! which 2/3 subset signed it.
//!
//! **Commit verification.** Precommits that justify a commit are signed with
//! the *proposal's* timestamp (every validator holds the proposed block, and
//! with it the proposal, before precommitting non-nil), which makes the
//! aggregate verifiable from the seal alone: the digest for bitmap index `i`
//! is reconstructed from the header, the commit round, and the embedded
//! proposal.

use {
    crate::{
        bit_array::BitArray,
        evidence::DuplicateVoteEvidence,
        proposal::{pol_round_from_wire, pol_round_to_wire, Proposal},
        validator_set::ValidatorSet,
        vote::{vote_digest, VoteType},
    },
    reimint_types::{keccak, Header, Signature, H256, EXTRA_VANITY},
    rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream},
    thiserror::Error,
};

/// Errors from seal decoding and commit verification.
#[derive(Debug, Error)]
pub enum ExtraDataError {
    #[error("undecodable consensus seal: {0}")]
    Decode(DecoderError),

    #[error("seal carries no commit aggregate")]
    MissingCommit,

    #[error("commit bitmap width {got} does not match validator count {want}")]
    BadBitmap { got: usize, want: usize },

    #[error("signature count {got} does not match bitmap population {want}")]
    SignatureCount { got: usize, want: usize },

    #[error("committed power {got} is not more than 2/3 of {total}")]
    InsufficientPower { got: u64, total: u64 },

    #[error("commit signature for validator index {0} does not verify")]
    BadSignature(usize),

    #[error("embedded proposal does not match the block hash")]
    ProposalMismatch,

    #[error("proposal signer is not the round {0} proposer")]
    WrongProposer(u32),
}

/// Decoded consensus seal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtraData {
    /// Round the embedded proposal was made in.
    pub round: u32,
    /// Round whose precommits decided the block; `None` on pending blocks.
    pub commit_round: Option<u32>,
    /// Proof-of-lock round of the embedded proposal.
    pub pol_round: Option<u32>,
    /// Evidence sealed into this block (part of its identity).
    pub evidence: Vec<DuplicateVoteEvidence>,
    /// The proposer's signed proposal for this block.
    pub proposal: Proposal,
    /// Which validator indices contributed precommits.
    pub commit_bitmap: BitArray,
    /// Signatures, one per set bitmap bit, ascending index order.
    pub commit_signatures: Vec<Signature>,
}

impl ExtraData {
    /// Seal for a freshly proposed block: evidence and proposal, no commit.
    pub fn new_proposal(
        round: u32,
        pol_round: Option<u32>,
        evidence: Vec<DuplicateVoteEvidence>,
        proposal: Proposal,
    ) -> Self {
        Self {
            round,
            commit_round: None,
            pol_round,
            evidence,
            proposal,
            commit_bitmap: BitArray::new(0),
            commit_signatures: Vec::new(),
        }
    }

    /// A copy of this seal with the decided commit aggregate attached.
    pub fn with_commit(
        &self,
        commit_round: u32,
        commit_bitmap: BitArray,
        commit_signatures: Vec<Signature>,
    ) -> Self {
        Self {
            commit_round: Some(commit_round),
            commit_bitmap,
            commit_signatures,
            ..self.clone()
        }
    }

    /// Parse the seal out of a header's `extra_data`.
    pub fn from_header(header: &Header) -> Result<Self, ExtraDataError> {
        let seal = header.extra_seal();
        if seal.is_empty() {
            return Err(ExtraDataError::Decode(DecoderError::Custom("no seal")));
        }
        rlp::decode(seal).map_err(ExtraDataError::Decode)
    }

    /// Write this seal into the header, preserving (and zero-padding) the
    /// 32-byte vanity prefix.
    pub fn seal_into(&self, header: &mut Header) {
        let mut extra = vanity_of(header).to_vec();
        extra.extend_from_slice(&rlp::encode(self));
        header.extra_data = extra;
    }

    /// Verify the commit aggregate against the validator set of this height.
    ///
    /// Checks: the proposal matches the block identity and was signed by the
    /// proposer elected for `self.round`; the bitmap covers more than 2/3 of
    /// the voting power; every signature is that validator's precommit for
    /// `(height, commit_round, block_hash)`.
    pub fn verify_commit(
        &self,
        header: &Header,
        validators: &ValidatorSet,
    ) -> Result<(), ExtraDataError> {
        let commit_round = self.commit_round.ok_or(ExtraDataError::MissingCommit)?;
        if self.commit_bitmap.len() != validators.len() {
            return Err(ExtraDataError::BadBitmap {
                got: self.commit_bitmap.len(),
                want: validators.len(),
            });
        }
        if self.commit_signatures.len() != self.commit_bitmap.count_ones() {
            return Err(ExtraDataError::SignatureCount {
                got: self.commit_signatures.len(),
                want: self.commit_bitmap.count_ones(),
            });
        }

        let block_hash = calc_block_hash(header);
        if self.proposal.block_hash != block_hash {
            return Err(ExtraDataError::ProposalMismatch);
        }

        // The proposer for round r is obtained by advancing the height's
        // seeded set r rounds.
        let mut elected = validators.clone();
        elected.increment_proposer_priority(self.round);
        if !self.proposal.validate_signature(&elected.proposer().address) {
            return Err(ExtraDataError::WrongProposer(self.round));
        }

        let mut power = 0u64;
        for (slot, idx) in self.commit_bitmap.iter_ones().enumerate() {
            let validator = validators
                .get(idx)
                .ok_or(ExtraDataError::BadSignature(idx))?;
            let digest = vote_digest(
                self.proposal.chain_id,
                VoteType::Precommit,
                header.number,
                commit_round,
                block_hash,
                self.proposal.timestamp,
            );
            match self.commit_signatures[slot].recover(digest) {
                Ok(addr) if addr == validator.address => power += validator.voting_power,
                _ => return Err(ExtraDataError::BadSignature(idx)),
            }
        }
        if !validators.is_two_thirds(power) {
            return Err(ExtraDataError::InsufficientPower {
                got: power,
                total: validators.total_voting_power(),
            });
        }
        Ok(())
    }
}

impl Encodable for ExtraData {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(7);
        s.append(&self.round);
        // Offset by one so "not committed yet" encodes as zero.
        s.append(&self.commit_round.map(|r| r as u64 + 1).unwrap_or(0));
        s.append(&pol_round_to_wire(self.pol_round));
        s.append_list(&self.evidence);
        s.append(&self.proposal);
        s.append(&self.commit_bitmap);
        s.append_list(&self.commit_signatures);
    }
}

impl Decodable for ExtraData {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        if rlp.item_count()? != 7 {
            return Err(DecoderError::RlpIncorrectListLen);
        }
        let commit_wire: u64 = rlp.val_at(1)?;
        let commit_round = if commit_wire == 0 {
            None
        } else {
            Some((commit_wire - 1) as u32)
        };
        Ok(Self {
            round: rlp.val_at(0)?,
            commit_round,
            pol_round: pol_round_from_wire(rlp.val_at(2)?)?,
            evidence: rlp.list_at(3)?,
            proposal: rlp.val_at(4)?,
            commit_bitmap: rlp.val_at(5)?,
            commit_signatures: rlp.list_at(6)?,
        })
    }
}

// ── Block hashing ───────────────────────────────────────────────────────────

fn vanity_of(header: &Header) -> [u8; EXTRA_VANITY] {
    let mut vanity = [0u8; EXTRA_VANITY];
    let src = header.extra_vanity();
    vanity[..src.len()].copy_from_slice(src);
    vanity
}

/// Hash of a header with a *known* evidence list, independent of any seal
/// already present: `keccak256(RLP(header{extra = vanity ‖ H(ev)…}))`.
pub fn calc_block_hash_with(header: &Header, evidence: &[DuplicateVoteEvidence]) -> H256 {
    let mut extra = vanity_of(header).to_vec();
    for ev in evidence {
        extra.extend_from_slice(ev.hash().as_bytes());
    }
    keccak(header.encode_with_extra_data(&extra))
}

/// Hash of an arbitrary header.
///
/// Sealed headers hash through the evidence-substitution rule; headers
/// without a decodable seal (genesis, foreign engines) hash as-is.
pub fn calc_block_hash(header: &Header) -> H256 {
    match ExtraData::from_header(header) {
        Ok(extra) => calc_block_hash_with(header, &extra.evidence),
        Err(_) => keccak(rlp::encode(header)),
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::vote::Vote,
        reimint_types::{LocalSigner, Signer},
    };

    const CHAIN: u64 = 7;

    fn committee(n: usize) -> (Vec<LocalSigner>, ValidatorSet) {
        let mut signers: Vec<LocalSigner> = (0..n)
            .map(|i| {
                let mut b = [0u8; 32];
                b[0] = i as u8 + 1;
                b[31] = 0x88;
                LocalSigner::from_secret_bytes(&b).unwrap()
            })
            .collect();
        let vs = ValidatorSet::new(signers.iter().map(|s| (s.address(), 100)).collect()).unwrap();
        signers.sort_by_key(|s| vs.index_by_address(&s.address()).unwrap());
        (signers, vs)
    }

    fn evidence_pair(signers: &[LocalSigner], idx: u32, height: u64) -> DuplicateVoteEvidence {
        let a = Vote::signed(CHAIN, VoteType::Prevote, height, 0, H256::repeat_byte(1), 10, idx, &signers[idx as usize]);
        let b = Vote::signed(CHAIN, VoteType::Prevote, height, 0, H256::repeat_byte(2), 11, idx, &signers[idx as usize]);
        DuplicateVoteEvidence::new(a, b).unwrap()
    }

    fn base_header(height: u64) -> Header {
        let mut h = Header::empty();
        h.number = height;
        h.parent_hash = H256::repeat_byte(0x99);
        h.extra_data = vec![0u8; EXTRA_VANITY];
        h
    }

    /// Build a sealed, committed block for a 4-validator committee where the
    /// proposer of `round` proposes and everyone precommits at `commit_round`.
    fn sealed_header(
        signers: &[LocalSigner],
        vs: &ValidatorSet,
        height: u64,
        evidence: Vec<DuplicateVoteEvidence>,
        precommitters: &[usize],
    ) -> (Header, ExtraData) {
        let mut header = base_header(height);

        let block_hash = calc_block_hash_with(&header, &evidence);
        let mut elected = vs.clone();
        elected.increment_proposer_priority(0);
        let proposer_idx = vs
            .index_by_address(&elected.proposer().address)
            .unwrap();
        let proposal = Proposal::signed(
            CHAIN,
            height,
            0,
            None,
            block_hash,
            5_000,
            &signers[proposer_idx],
        );

        let mut bitmap = BitArray::new(vs.len());
        let mut sigs = Vec::new();
        for &i in precommitters {
            bitmap.set(i, true);
        }
        for idx in bitmap.iter_ones() {
            let digest = vote_digest(
                CHAIN,
                VoteType::Precommit,
                height,
                0,
                block_hash,
                proposal.timestamp,
            );
            sigs.push(signers[idx].sign(digest));
        }

        let extra = ExtraData::new_proposal(0, None, evidence, proposal)
            .with_commit(0, bitmap, sigs);
        extra.seal_into(&mut header);
        (header, extra)
    }

    #[test]
    fn test_seal_roundtrip() {
        let (signers, vs) = committee(4);
        let ev = evidence_pair(&signers, 1, 3);
        let (header, extra) = sealed_header(&signers, &vs, 3, vec![ev], &[0, 1, 2]);
        let decoded = ExtraData::from_header(&header).unwrap();
        assert_eq!(decoded, extra);
    }

    #[test]
    fn test_block_hash_ignores_commit_votes() {
        let (signers, vs) = committee(4);
        let ev = evidence_pair(&signers, 1, 3);
        let (with_three, _) = sealed_header(&signers, &vs, 3, vec![ev.clone()], &[0, 1, 2]);
        let (with_four, _) = sealed_header(&signers, &vs, 3, vec![ev], &[0, 1, 2, 3]);
        assert_eq!(calc_block_hash(&with_three), calc_block_hash(&with_four));
    }

    #[test]
    fn test_block_hash_covers_evidence() {
        let (signers, vs) = committee(4);
        let (plain, _) = sealed_header(&signers, &vs, 3, vec![], &[0, 1, 2]);
        let ev = evidence_pair(&signers, 1, 3);
        let (with_ev, _) = sealed_header(&signers, &vs, 3, vec![ev], &[0, 1, 2]);
        assert_ne!(calc_block_hash(&plain), calc_block_hash(&with_ev));
    }

    #[test]
    fn test_unsealed_header_hashes_plainly() {
        let header = base_header(1);
        assert_eq!(calc_block_hash(&header), keccak(rlp::encode(&header)));
    }

    #[test]
    fn test_verify_commit_ok() {
        let (signers, vs) = committee(4);
        let (header, extra) = sealed_header(&signers, &vs, 3, vec![], &[0, 1, 2]);
        extra.verify_commit(&header, &vs).unwrap();
    }

    #[test]
    fn test_verify_commit_insufficient_power() {
        let (signers, vs) = committee(4);
        let (header, extra) = sealed_header(&signers, &vs, 3, vec![], &[0, 1]);
        assert!(matches!(
            extra.verify_commit(&header, &vs),
            Err(ExtraDataError::InsufficientPower { .. })
        ));
    }

    #[test]
    fn test_verify_commit_rejects_foreign_signature() {
        let (signers, vs) = committee(4);
        let (header, mut extra) = sealed_header(&signers, &vs, 3, vec![], &[0, 1, 2]);
        // Swap one signature for a signature over garbage.
        extra.commit_signatures[1] = signers[1].sign(keccak(b"garbage"));
        assert!(matches!(
            extra.verify_commit(&header, &vs),
            Err(ExtraDataError::BadSignature(_))
        ));
    }

    #[test]
    fn test_verify_commit_requires_commit() {
        let (signers, vs) = committee(4);
        let mut header = base_header(3);
        let block_hash = calc_block_hash_with(&header, &[]);
        let proposal = Proposal::signed(CHAIN, 3, 0, None, block_hash, 0, &signers[0]);
        let extra = ExtraData::new_proposal(0, None, vec![], proposal);
        extra.seal_into(&mut header);
        assert!(matches!(
            extra.verify_commit(&header, &vs),
            Err(ExtraDataError::MissingCommit)
        ));
    }

    #[test]
    fn test_pending_seal_and_commit_seal_share_identity() {
        let (signers, vs) = committee(4);
        let mut header = base_header(3);
        let block_hash = calc_block_hash_with(&header, &[]);
        let mut elected = vs.clone();
        elected.increment_proposer_priority(0);
        let pi = vs.index_by_address(&elected.proposer().address).unwrap();
        let proposal = Proposal::signed(CHAIN, 3, 0, None, block_hash, 5_000, &signers[pi]);

        let pending = ExtraData::new_proposal(0, None, vec![], proposal);
        pending.seal_into(&mut header);
        let pending_hash = calc_block_hash(&header);
        assert_eq!(pending_hash, block_hash);

        let (bitmap, sigs) = {
            let mut bitmap = BitArray::new(vs.len());
            for i in 0..3 {
                bitmap.set(i, true);
            }
            let digest = vote_digest(CHAIN, VoteType::Precommit, 3, 0, block_hash, 5_000);
            let sigs = bitmap.iter_ones().map(|i| signers[i].sign(digest)).collect();
            (bitmap, sigs)
        };
        let sealed = pending.with_commit(0, bitmap, sigs);
        sealed.seal_into(&mut header);
        assert_eq!(calc_block_hash(&header), pending_hash);
        sealed.verify_commit(&header, &vs).unwrap();
    }
}
