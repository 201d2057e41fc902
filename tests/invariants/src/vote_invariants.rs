//! Vote-set invariants under randomized vote traffic.

use {
    proptest::prelude::*,
    reimint_consensus::{ValidatorSet, Vote, VoteSet, VoteSetError, VoteType},
    reimint_types::{LocalSigner, Signer, H256},
    std::sync::Arc,
};

const CHAIN: u64 = 7;

fn committee(n: usize) -> (Vec<LocalSigner>, Arc<ValidatorSet>) {
    let mut signers: Vec<LocalSigner> = (0..n)
        .map(|i| {
            let mut b = [0u8; 32];
            b[0] = i as u8 + 1;
            b[31] = 0xCD;
            LocalSigner::from_secret_bytes(&b).unwrap()
        })
        .collect();
    let vs = ValidatorSet::new(signers.iter().map(|s| (s.address(), 100)).collect()).unwrap();
    signers.sort_by_key(|s| vs.index_by_address(&s.address()).unwrap());
    (signers, Arc::new(vs))
}

fn hash_of(tag: u8) -> H256 {
    // tag 0 is the nil hash.
    if tag == 0 {
        H256::zero()
    } else {
        H256::repeat_byte(tag)
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// However votes arrive, each index holds at most one vote, and any two
    /// accepted votes from the same index agree on the hash.
    #[test]
    fn at_most_one_vote_per_index(
        n in 2usize..=8,
        // (validator index, hash tag) pairs, possibly repeating indices.
        traffic in prop::collection::vec((0u32..8, 0u8..4), 1..=64),
    ) {
        let (signers, vs) = committee(n);
        let mut set = VoteSet::new(CHAIN, 1, 0, VoteType::Prevote, vs.clone());
        let mut accepted: std::collections::HashMap<u32, H256> =
            std::collections::HashMap::new();

        for (idx, tag) in traffic {
            if idx as usize >= n {
                continue;
            }
            let vote = Vote::signed(
                CHAIN,
                VoteType::Prevote,
                1,
                0,
                hash_of(tag),
                1_000 + tag as u64,
                idx,
                &signers[idx as usize],
            );
            match set.add_vote(vote) {
                Ok(true) => {
                    accepted.insert(idx, hash_of(tag));
                }
                Ok(false) => {
                    // Idempotent duplicate: must agree with what we hold.
                    prop_assert_eq!(accepted[&idx], hash_of(tag));
                }
                Err(VoteSetError::ConflictingVotes { existing, conflicting }) => {
                    prop_assert_eq!(existing.block_hash, accepted[&idx]);
                    prop_assert_ne!(conflicting.block_hash, accepted[&idx]);
                }
                Err(e) => prop_assert!(false, "unexpected error: {e}"),
            }
        }

        // The stored votes match our model exactly.
        for (idx, hash) in &accepted {
            prop_assert_eq!(set.get(*idx).unwrap().block_hash, *hash);
        }
        prop_assert_eq!(set.sum(), accepted.len() as u64 * 100);
    }

    /// Once a two-thirds hash latches, no later vote changes it.
    #[test]
    fn maj23_is_monotonic(
        n in 3usize..=8,
        traffic in prop::collection::vec((0u32..8, 0u8..3), 1..=64),
    ) {
        let (signers, vs) = committee(n);
        let mut set = VoteSet::new(CHAIN, 1, 0, VoteType::Prevote, vs);
        let mut latched: Option<H256> = None;

        for (idx, tag) in traffic {
            if idx as usize >= n {
                continue;
            }
            let vote = Vote::signed(
                CHAIN,
                VoteType::Prevote,
                1,
                0,
                hash_of(tag),
                2_000,
                idx,
                &signers[idx as usize],
            );
            let _ = set.add_vote(vote);
            match (latched, set.two_thirds_majority()) {
                (None, now) => latched = now,
                (Some(before), now) => prop_assert_eq!(Some(before), now),
            }
        }
    }

    /// `has_two_thirds_any` counts power across hashes; a latched majority
    /// implies it, never the other way around.
    #[test]
    fn two_thirds_any_weaker_than_majority(
        n in 3usize..=8,
        traffic in prop::collection::vec((0u32..8, 0u8..3), 1..=64),
    ) {
        let (signers, vs) = committee(n);
        let mut set = VoteSet::new(CHAIN, 1, 0, VoteType::Prevote, vs);
        for (idx, tag) in traffic {
            if idx as usize >= n {
                continue;
            }
            let vote = Vote::signed(
                CHAIN,
                VoteType::Prevote,
                1,
                0,
                hash_of(tag),
                3_000,
                idx,
                &signers[idx as usize],
            );
            let _ = set.add_vote(vote);
            if set.has_two_thirds_majority() {
                prop_assert!(set.has_two_thirds_any());
            }
        }
    }

    /// A commit aggregate always carries exactly the voters for the decided
    /// hash, with enough power.
    #[test]
    fn commit_aggregate_matches_decision(
        n in 3usize..=8,
    ) {
        let (signers, vs) = committee(n);
        let mut set = VoteSet::new(CHAIN, 1, 0, VoteType::Precommit, vs.clone());
        let hash = H256::repeat_byte(0x42);
        for idx in 0..n as u32 {
            let vote = Vote::signed(
                CHAIN,
                VoteType::Precommit,
                1,
                0,
                hash,
                4_000,
                idx,
                &signers[idx as usize],
            );
            set.add_vote(vote).unwrap();
        }
        let (bitmap, sigs) = set.make_commit().unwrap();
        prop_assert_eq!(bitmap.count_ones(), n);
        prop_assert_eq!(sigs.len(), n);
        let power: u64 = bitmap.iter_ones().map(|i| vs.get(i).unwrap().voting_power).sum();
        prop_assert!(vs.is_two_thirds(power));
    }
}
