//! Validator-set and proposer-election invariants.

use {
    proptest::prelude::*,
    reimint_consensus::ValidatorSet,
    reimint_types::Address,
};

fn addr(i: usize) -> Address {
    let mut bytes = [0u8; 20];
    bytes[0] = i as u8;
    bytes[19] = 0xBB;
    Address::from(bytes)
}

fn make_set(powers: &[u64]) -> ValidatorSet {
    ValidatorSet::new(
        powers
            .iter()
            .enumerate()
            .map(|(i, p)| (addr(i + 1), *p))
            .collect(),
    )
    .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Total voting power is invariant across any number of increments, and
    /// the priority sum stays within one total-power of zero.
    #[test]
    fn increment_conserves_power_and_bounds_priorities(
        powers in prop::collection::vec(1u64..=1_000_000, 1..=16),
        times in 1u32..=64,
    ) {
        let mut vs = make_set(&powers);
        let total = vs.total_voting_power();

        vs.increment_proposer_priority(times);

        prop_assert_eq!(vs.total_voting_power(), total);
        let sum: i128 = vs.iter().map(|v| v.priority).sum();
        prop_assert!(
            sum.abs() <= total as i128,
            "|priority sum| = {} exceeds total power {}",
            sum.abs(),
            total
        );
    }

    /// The priority spread never exceeds twice the total power.
    #[test]
    fn increment_bounds_priority_spread(
        powers in prop::collection::vec(1u64..=1_000_000, 2..=12),
        times in 1u32..=128,
    ) {
        let mut vs = make_set(&powers);
        let total = vs.total_voting_power() as i128;
        for _ in 0..times {
            vs.increment_proposer_priority(1);
            let max = vs.iter().map(|v| v.priority).max().unwrap();
            let min = vs.iter().map(|v| v.priority).min().unwrap();
            prop_assert!(max - min <= 2 * total);
        }
    }

    /// Identical initial sets advanced by the same count elect the same
    /// proposer, byte for byte.
    #[test]
    fn proposer_election_deterministic(
        powers in prop::collection::vec(1u64..=1_000, 1..=10),
        times in 0u32..=100,
    ) {
        let mut a = make_set(&powers);
        let mut b = make_set(&powers);
        a.increment_proposer_priority(times);
        b.increment_proposer_priority(times);
        prop_assert_eq!(a.proposer().address, b.proposer().address);
    }

    /// Advancing one round at a time equals advancing in one batch.
    #[test]
    fn incremental_equals_batched(
        powers in prop::collection::vec(1u64..=1_000, 1..=8),
        times in 1u32..=32,
    ) {
        let mut stepwise = make_set(&powers);
        let mut batched = make_set(&powers);
        for _ in 0..times {
            stepwise.increment_proposer_priority(1);
        }
        batched.increment_proposer_priority(times);
        prop_assert_eq!(stepwise.proposer().address, batched.proposer().address);
        for (a, b) in stepwise.iter().zip(batched.iter()) {
            prop_assert_eq!(a.priority, b.priority);
        }
    }

    /// With equal powers every validator proposes exactly once per cycle.
    #[test]
    fn equal_powers_rotate_fairly(n in 2usize..=10) {
        let powers = vec![100u64; n];
        let mut vs = make_set(&powers);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..n {
            vs.increment_proposer_priority(1);
            seen.insert(vs.proposer().address);
        }
        prop_assert_eq!(seen.len(), n);
    }

    /// Election frequency tracks stake: over many rounds, each validator's
    /// share of proposals lands near its share of power.
    #[test]
    fn election_is_stake_proportional(
        powers in prop::collection::vec(1u64..=20, 2..=6),
    ) {
        let mut vs = make_set(&powers);
        let total: u64 = powers.iter().sum();
        let rounds = (total * 50) as u32;
        let mut counts = std::collections::HashMap::new();
        for _ in 0..rounds {
            vs.increment_proposer_priority(1);
            *counts.entry(vs.proposer().address).or_insert(0u64) += 1;
        }
        for (i, power) in powers.iter().enumerate() {
            let got = counts.get(&addr(i + 1)).copied().unwrap_or(0);
            let expected = rounds as u64 * power / total;
            // The accumulator scheme is fair up to a cycle of drift.
            let slack = 50 + total;
            prop_assert!(
                got + slack >= expected && got <= expected + slack,
                "validator {} proposed {} times, expected ~{}",
                i,
                got,
                expected
            );
        }
    }

    /// A single vote in a one-validator set always exceeds two thirds.
    #[test]
    fn single_validator_threshold(power in 1u64..=1_000_000) {
        let vs = make_set(&[power]);
        prop_assert!(vs.is_two_thirds(power));
        prop_assert!(!vs.is_two_thirds(power * 2 / 3));
    }
}

#[test]
fn total_power_must_fit_63_bits() {
    let half = (i64::MAX / 2) as u64 + 1;
    assert!(ValidatorSet::new(vec![(addr(1), half), (addr(2), half)]).is_err());
}
