//! Duplicate-vote evidence: detection artifacts, verification, and the
//! persistent pool.
//!
//! When the same validator signs two different hashes at one
//! (height, round, type), the pair of votes is a self-contained, verifiable
//! proof of misbehavior. The pool persists such proofs until they have been
//! sealed into a committed block and aged out.
//!
//! Storage layout (sled): two trees, `evidence/pending` and
//! `evidence/committed`, keyed `height (8 bytes BE) ‖ keccak256(evidence)` so
//! iteration order is oldest-first and pruning is a prefix scan.

use {
    crate::{validator_set::ValidatorSet, vote::Vote},
    log::debug,
    reimint_types::{keccak, H256},
    rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream},
    std::{path::Path, sync::Arc},
    thiserror::Error,
};

/// RLP kind tag for duplicate-vote evidence (the only kind today).
const EVIDENCE_KIND_DUPLICATE_VOTE: u8 = 0;

/// Errors from evidence verification and the pool.
#[derive(Debug, Error)]
pub enum EvidenceError {
    /// The two votes do not form valid evidence.
    #[error("invalid evidence: {0}")]
    Invalid(String),

    /// Evidence is older than the retention window.
    #[error("expired evidence: height {evidence_height}, current {current_height}")]
    Expired {
        evidence_height: u64,
        current_height: u64,
    },

    /// Evidence was already included in a committed block.
    #[error("evidence already committed")]
    AlreadyCommitted,

    /// Underlying store failure; surfaced to the consensus loop, which logs
    /// and carries on.
    #[error("evidence storage error: {0}")]
    Storage(#[from] sled::Error),
}

/// Proof that one validator signed two different hashes at the same
/// (height, round, type).
///
/// Canonical order: `vote_a.block_hash < vote_b.block_hash`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateVoteEvidence {
    pub vote_a: Vote,
    pub vote_b: Vote,
}

impl DuplicateVoteEvidence {
    /// Pair two conflicting votes, normalizing the canonical order.
    pub fn new(a: Vote, b: Vote) -> Result<Self, EvidenceError> {
        let (vote_a, vote_b) = if a.block_hash < b.block_hash {
            (a, b)
        } else {
            (b, a)
        };
        let ev = Self { vote_a, vote_b };
        ev.verify_structure()?;
        Ok(ev)
    }

    /// Height of the offense.
    pub fn height(&self) -> u64 {
        self.vote_a.height
    }

    /// Content digest, used as the storage key suffix and in block hashing.
    pub fn hash(&self) -> H256 {
        keccak(rlp::encode(self))
    }

    /// Structural checks: identical coordinates, distinct hashes, canonical
    /// order.
    pub fn verify_structure(&self) -> Result<(), EvidenceError> {
        let (a, b) = (&self.vote_a, &self.vote_b);
        if a.validator_index != b.validator_index
            || a.height != b.height
            || a.round != b.round
            || a.kind != b.kind
            || a.chain_id != b.chain_id
        {
            return Err(EvidenceError::Invalid(
                "votes are not for the same (validator, height, round, type)".into(),
            ));
        }
        if a.block_hash == b.block_hash {
            return Err(EvidenceError::Invalid("votes agree on the block hash".into()));
        }
        if a.block_hash >= b.block_hash {
            return Err(EvidenceError::Invalid("votes are not in canonical order".into()));
        }
        Ok(())
    }

    /// Full verification: structure plus both signatures recovering to the
    /// accused validator in `validators` (the set active at the offense
    /// height).
    pub fn verify(&self, validators: &ValidatorSet) -> Result<(), EvidenceError> {
        self.verify_structure()?;
        let idx = self.vote_a.validator_index as usize;
        let validator = validators.get(idx).ok_or_else(|| {
            EvidenceError::Invalid(format!("validator index {idx} out of range"))
        })?;
        if !self.vote_a.verify(&validator.address) || !self.vote_b.verify(&validator.address) {
            return Err(EvidenceError::Invalid(format!(
                "signature does not recover to validator {:?}",
                validator.address
            )));
        }
        Ok(())
    }

    /// Signature sanity without a validator set: both votes must at least
    /// recover to the *same* address. Used when the set for an old height is
    /// no longer cached.
    pub fn verify_signers_match(&self) -> Result<(), EvidenceError> {
        self.verify_structure()?;
        let a = self
            .vote_a
            .recover_signer()
            .map_err(|e| EvidenceError::Invalid(e.to_string()))?;
        let b = self
            .vote_b
            .recover_signer()
            .map_err(|e| EvidenceError::Invalid(e.to_string()))?;
        if a != b {
            return Err(EvidenceError::Invalid(
                "votes recover to different signers".into(),
            ));
        }
        Ok(())
    }
}

impl Encodable for DuplicateVoteEvidence {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(3);
        s.append(&EVIDENCE_KIND_DUPLICATE_VOTE);
        s.append(&self.vote_a);
        s.append(&self.vote_b);
    }
}

impl Decodable for DuplicateVoteEvidence {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        if rlp.item_count()? != 3 {
            return Err(DecoderError::RlpIncorrectListLen);
        }
        let kind: u8 = rlp.val_at(0)?;
        if kind != EVIDENCE_KIND_DUPLICATE_VOTE {
            return Err(DecoderError::Custom("unknown evidence kind"));
        }
        Ok(Self {
            vote_a: rlp.val_at(1)?,
            vote_b: rlp.val_at(2)?,
        })
    }
}

// ── Pool ────────────────────────────────────────────────────────────────────

/// Resolves the validator set that was active at a given height; `None`
/// when the set is no longer available (verification degrades to a
/// signer-consistency check).
pub type ValidatorSetResolver<'a> = &'a dyn Fn(u64) -> Option<Arc<ValidatorSet>>;

/// Persistent store of detected misbehavior.
pub struct EvidencePool {
    _db: sled::Db,
    pending: sled::Tree,
    committed: sled::Tree,
    max_age_num_blocks: u64,
}

impl EvidencePool {
    /// Open (or create) the pool at `path`.
    pub fn open(path: impl AsRef<Path>, max_age_num_blocks: u64) -> Result<Self, EvidenceError> {
        let db = sled::open(path)?;
        Self::with_db(db, max_age_num_blocks)
    }

    /// An ephemeral pool for tests and tooling.
    pub fn in_memory(max_age_num_blocks: u64) -> Result<Self, EvidenceError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::with_db(db, max_age_num_blocks)
    }

    fn with_db(db: sled::Db, max_age_num_blocks: u64) -> Result<Self, EvidenceError> {
        let pending = db.open_tree("evidence/pending")?;
        let committed = db.open_tree("evidence/committed")?;
        Ok(Self {
            _db: db,
            pending,
            committed,
            max_age_num_blocks,
        })
    }

    fn key(ev: &DuplicateVoteEvidence) -> Vec<u8> {
        let mut key = Vec::with_capacity(8 + 32);
        key.extend_from_slice(&ev.height().to_be_bytes());
        key.extend_from_slice(ev.hash().as_bytes());
        key
    }

    /// Verify and persist new evidence. Returns `Ok(false)` when the pool
    /// already knows it.
    pub fn add_evidence(
        &self,
        ev: &DuplicateVoteEvidence,
        validators: &ValidatorSet,
        current_height: u64,
    ) -> Result<bool, EvidenceError> {
        ev.verify(validators)?;
        if current_height.saturating_sub(ev.height()) > self.max_age_num_blocks {
            return Err(EvidenceError::Expired {
                evidence_height: ev.height(),
                current_height,
            });
        }
        let key = Self::key(ev);
        if self.committed.contains_key(&key)? {
            return Err(EvidenceError::AlreadyCommitted);
        }
        if self.pending.contains_key(&key)? {
            return Ok(false);
        }
        self.pending.insert(key, rlp::encode(ev).to_vec())?;
        debug!(
            "evidence pool: stored duplicate-vote proof against index {} at h={} r={}",
            ev.vote_a.validator_index,
            ev.height(),
            ev.vote_a.round
        );
        Ok(true)
    }

    /// Validate a block's evidence list: every entry must verify, be inside
    /// the retention window, appear at most once, and not be committed yet.
    pub fn check_evidence(
        &self,
        list: &[DuplicateVoteEvidence],
        current_height: u64,
        resolve: ValidatorSetResolver<'_>,
    ) -> Result<(), EvidenceError> {
        let mut seen = std::collections::HashSet::new();
        for ev in list {
            if !seen.insert(ev.hash()) {
                return Err(EvidenceError::Invalid("duplicate evidence entry".into()));
            }
            if current_height.saturating_sub(ev.height()) > self.max_age_num_blocks {
                return Err(EvidenceError::Expired {
                    evidence_height: ev.height(),
                    current_height,
                });
            }
            if self.committed.contains_key(Self::key(ev))? {
                return Err(EvidenceError::AlreadyCommitted);
            }
            match resolve(ev.height()) {
                Some(validators) => ev.verify(&validators)?,
                None => ev.verify_signers_match()?,
            }
        }
        Ok(())
    }

    /// Oldest-first pending evidence, bounded by encoded size.
    pub fn pending_evidence(&self, max_bytes: u64) -> Result<Vec<DuplicateVoteEvidence>, EvidenceError> {
        let mut out = Vec::new();
        let mut used = 0u64;
        for item in self.pending.iter() {
            let (_, value) = item?;
            let size = value.len() as u64;
            if used + size > max_bytes {
                break;
            }
            match rlp::decode::<DuplicateVoteEvidence>(&value) {
                Ok(ev) => {
                    used += size;
                    out.push(ev);
                }
                Err(e) => {
                    // A corrupt record must not wedge block production.
                    debug!("evidence pool: skipping undecodable record: {e}");
                }
            }
        }
        Ok(out)
    }

    /// Mark evidence sealed into a committed block and prune everything
    /// outside the retention window.
    pub fn update(
        &self,
        committed: &[DuplicateVoteEvidence],
        height: u64,
    ) -> Result<(), EvidenceError> {
        for ev in committed {
            let key = Self::key(ev);
            self.pending.remove(&key)?;
            self.committed.insert(key, rlp::encode(ev).to_vec())?;
        }
        let horizon = height.saturating_sub(self.max_age_num_blocks);
        self.prune_tree(&self.pending, horizon)?;
        self.prune_tree(&self.committed, horizon)?;
        Ok(())
    }

    fn prune_tree(&self, tree: &sled::Tree, horizon: u64) -> Result<(), EvidenceError> {
        // Keys are height-prefixed big-endian, so everything to prune sits
        // strictly below the horizon key.
        let bound = horizon.to_be_bytes().to_vec();
        let stale: Vec<_> = tree
            .range(..bound)
            .map(|item| item.map(|(k, _)| k))
            .collect::<Result<_, _>>()?;
        for key in stale {
            tree.remove(key)?;
        }
        Ok(())
    }

    /// Whether this exact evidence is pending.
    pub fn is_pending(&self, ev: &DuplicateVoteEvidence) -> Result<bool, EvidenceError> {
        Ok(self.pending.contains_key(Self::key(ev))?)
    }

    /// Whether this exact evidence was sealed into a block.
    pub fn is_committed(&self, ev: &DuplicateVoteEvidence) -> Result<bool, EvidenceError> {
        Ok(self.committed.contains_key(Self::key(ev))?)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
