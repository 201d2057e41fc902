//! All vote sets of the current height, across rounds.
//!
//! Rounds are materialized lazily: the machine's own round (plus one ahead)
//! always exists, and peers may seed up to two further future rounds each —
//! enough to learn that the network has moved on, without letting a single
//! peer allocate unbounded state.

use {
    crate::{
        validator_set::ValidatorSet,
        vote::{Vote, VoteType},
        vote_set::{VoteSet, VoteSetError},
        PeerId,
    },
    reimint_types::H256,
    std::{
        collections::{BTreeMap, HashMap, HashSet},
        sync::Arc,
    },
};

/// How many future rounds one peer may create in our state.
const MAX_PEER_CATCHUP_ROUNDS: usize = 2;

#[derive(Debug, Clone)]
struct RoundVoteSet {
    prevotes: VoteSet,
    precommits: VoteSet,
}

/// Union of the per-round vote sets at one height.
#[derive(Debug, Clone)]
pub struct HeightVoteSet {
    chain_id: u64,
    height: u64,
    validators: Arc<ValidatorSet>,
    round: u32,
    round_vote_sets: BTreeMap<u32, RoundVoteSet>,
    peer_catchup_rounds: HashMap<PeerId, HashSet<u32>>,
}

impl HeightVoteSet {
    pub fn new(chain_id: u64, height: u64, validators: Arc<ValidatorSet>) -> Self {
        let mut hvs = Self {
            chain_id,
            height,
            validators,
            round: 0,
            round_vote_sets: BTreeMap::new(),
            peer_catchup_rounds: HashMap::new(),
        };
        hvs.ensure_round(0);
        hvs.ensure_round(1);
        hvs
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    /// Advance the working round, materializing vote sets up to `round + 1`.
    pub fn set_round(&mut self, round: u32) {
        for r in 0..=round.saturating_add(1) {
            self.ensure_round(r);
        }
        self.round = round;
    }

    fn ensure_round(&mut self, round: u32) {
        let chain_id = self.chain_id;
        let height = self.height;
        let validators = self.validators.clone();
        self.round_vote_sets.entry(round).or_insert_with(|| RoundVoteSet {
            prevotes: VoteSet::new(chain_id, height, round, VoteType::Prevote, validators.clone()),
            precommits: VoteSet::new(chain_id, height, round, VoteType::Precommit, validators),
        });
    }

    /// Dispatch a vote into the matching round and type.
    ///
    /// Votes for unmaterialized future rounds are only admitted while the
    /// sending peer has seeded fewer than two such rounds; our own votes
    /// (`peer == None`) always land.
    pub fn add_vote(&mut self, vote: Vote, peer: Option<&PeerId>) -> Result<bool, VoteSetError> {
        if !self.round_vote_sets.contains_key(&vote.round) {
            match peer {
                Some(peer) => {
                    let seeded = self.peer_catchup_rounds.entry(peer.clone()).or_default();
                    if !seeded.contains(&vote.round) && seeded.len() >= MAX_PEER_CATCHUP_ROUNDS {
                        return Err(VoteSetError::GotVoteFromUnwantedRound(vote.round));
                    }
                    seeded.insert(vote.round);
                }
                None => {}
            }
            self.ensure_round(vote.round);
        }
        let rvs = self
            .round_vote_sets
            .get_mut(&vote.round)
            .expect("round materialized above");
        match vote.kind {
            VoteType::Prevote => rvs.prevotes.add_vote(vote),
            VoteType::Precommit => rvs.precommits.add_vote(vote),
            VoteType::Proposal => Err(VoteSetError::UnexpectedVote {
                height: vote.height,
                round: vote.round,
                kind: vote.kind,
                want_height: self.height,
                want_round: vote.round,
                want_kind: VoteType::Prevote,
            }),
        }
    }

    pub fn prevotes(&self, round: u32) -> Option<&VoteSet> {
        self.round_vote_sets.get(&round).map(|r| &r.prevotes)
    }

    pub fn precommits(&self, round: u32) -> Option<&VoteSet> {
        self.round_vote_sets.get(&round).map(|r| &r.precommits)
    }

    pub fn prevotes_mut(&mut self, round: u32) -> Option<&mut VoteSet> {
        self.round_vote_sets.get_mut(&round).map(|r| &mut r.prevotes)
    }

    pub fn precommits_mut(&mut self, round: u32) -> Option<&mut VoteSet> {
        self.round_vote_sets.get_mut(&round).map(|r| &mut r.precommits)
    }

    /// The most recent proof-of-lock: the greatest round at or below the
    /// working round whose prevotes latched a non-nil majority.
    pub fn pol_info(&self) -> Option<(u32, H256)> {
        for r in (0..=self.round).rev() {
            if let Some(prevotes) = self.prevotes(r) {
                if let Some(maj23) = prevotes.two_thirds_majority() {
                    if !maj23.is_zero() {
                        return Some((r, maj23));
                    }
                }
            }
        }
        None
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::validator_set::ValidatorSet,
        reimint_types::{LocalSigner, Signer},
    };

    const CHAIN: u64 = 7;

    fn committee(n: usize) -> (Vec<LocalSigner>, Arc<ValidatorSet>) {
        let mut signers: Vec<LocalSigner> = (0..n)
            .map(|i| {
                let mut b = [0u8; 32];
                b[0] = i as u8 + 1;
                b[31] = 0x44;
                LocalSigner::from_secret_bytes(&b).unwrap()
            })
            .collect();
        let vs = ValidatorSet::new(signers.iter().map(|s| (s.address(), 100)).collect()).unwrap();
        signers.sort_by_key(|s| vs.index_by_address(&s.address()).unwrap());
        (signers, Arc::new(vs))
    }

    fn vote(signers: &[LocalSigner], kind: VoteType, round: u32, idx: u32, hash: H256) -> Vote {
        Vote::signed(CHAIN, kind, 5, round, hash, 1000, idx, &signers[idx as usize])
    }

    #[test]
    fn test_rounds_materialized_on_set_round() {
        let (_, vs) = committee(4);
        let mut hvs = HeightVoteSet::new(CHAIN, 5, vs);
        assert!(hvs.prevotes(0).is_some());
        assert!(hvs.prevotes(1).is_some());
        assert!(hvs.prevotes(2).is_none());
        hvs.set_round(3);
        assert!(hvs.prevotes(4).is_some());
        assert_eq!(hvs.round(), 3);
    }

    #[test]
    fn test_dispatch_by_type() {
        let (signers, vs) = committee(4);
        let mut hvs = HeightVoteSet::new(CHAIN, 5, vs);
        let hash = H256::repeat_byte(1);
        hvs.add_vote(vote(&signers, VoteType::Prevote, 0, 0, hash), None)
            .unwrap();
        hvs.add_vote(vote(&signers, VoteType::Precommit, 0, 1, hash), None)
            .unwrap();
        assert_eq!(hvs.prevotes(0).unwrap().sum(), 100);
        assert_eq!(hvs.precommits(0).unwrap().sum(), 100);
    }

    #[test]
    fn test_peer_catchup_round_limit() {
        let (signers, vs) = committee(4);
        let mut hvs = HeightVoteSet::new(CHAIN, 5, vs);
        let peer: PeerId = "peer-a".into();
        let hash = H256::repeat_byte(1);

        // Two future rounds are fine…
        hvs.add_vote(vote(&signers, VoteType::Prevote, 5, 0, hash), Some(&peer))
            .unwrap();
        hvs.add_vote(vote(&signers, VoteType::Prevote, 6, 1, hash), Some(&peer))
            .unwrap();
        // …a third from the same peer is not.
        assert!(matches!(
            hvs.add_vote(vote(&signers, VoteType::Prevote, 7, 2, hash), Some(&peer)),
            Err(VoteSetError::GotVoteFromUnwantedRound(7))
        ));
        // A round the peer already seeded keeps accepting votes.
        hvs.add_vote(vote(&signers, VoteType::Prevote, 5, 3, hash), Some(&peer))
            .unwrap();
        // A different peer gets its own allowance.
        let other: PeerId = "peer-b".into();
        hvs.add_vote(vote(&signers, VoteType::Prevote, 7, 3, hash), Some(&other))
            .unwrap();
    }

    #[test]
    fn test_own_votes_bypass_catchup_limit() {
        let (signers, vs) = committee(4);
        let mut hvs = HeightVoteSet::new(CHAIN, 5, vs);
        for r in [5u32, 6, 7, 8] {
            hvs.add_vote(vote(&signers, VoteType::Prevote, r, 0, H256::repeat_byte(1)), None)
                .unwrap();
        }
    }

    #[test]
    fn test_pol_info_returns_greatest_non_nil() {
        let (signers, vs) = committee(4);
        let mut hvs = HeightVoteSet::new(CHAIN, 5, vs);
        hvs.set_round(3);

        let hash0 = H256::repeat_byte(0xA0);
        for i in 0..3 {
            hvs.add_vote(vote(&signers, VoteType::Prevote, 0, i, hash0), None)
                .unwrap();
        }
        assert_eq!(hvs.pol_info(), Some((0, hash0)));

        // A nil majority at round 2 must not shadow round 0.
        for i in 0..3 {
            hvs.add_vote(vote(&signers, VoteType::Prevote, 2, i, H256::zero()), None)
                .unwrap();
        }
        assert_eq!(hvs.pol_info(), Some((0, hash0)));

        let hash3 = H256::repeat_byte(0xA3);
        for i in 0..3 {
            hvs.add_vote(vote(&signers, VoteType::Prevote, 3, i, hash3), None)
                .unwrap();
        }
        assert_eq!(hvs.pol_info(), Some((3, hash3)));
    }

    #[test]
    fn test_pol_ignores_rounds_above_current() {
        let (signers, vs) = committee(4);
        let mut hvs = HeightVoteSet::new(CHAIN, 5, vs);
        // Round 1 exists (round + 1) and gets a majority, but the working
        // round is still 0.
        let hash = H256::repeat_byte(0xB1);
        for i in 0..3 {
            hvs.add_vote(vote(&signers, VoteType::Prevote, 1, i, hash), None)
                .unwrap();
        }
        assert_eq!(hvs.pol_info(), None);
        hvs.set_round(1);
        assert_eq!(hvs.pol_info(), Some((1, hash)));
    }
}
