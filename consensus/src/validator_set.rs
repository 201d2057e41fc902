//! Weighted validator set with proposer-priority accounting.
//!
//! Validators are ordered deterministically (voting power descending, then
//! address ascending) so every node sees the same indices. Proposer election
//! follows the accumulator scheme: each round every validator's priority
//! grows by its voting power, the highest-priority validator proposes, and
//! the winner pays the total voting power back. Over time each validator
//! proposes in proportion to its stake.

use {
    crate::config::ReimintConfig,
    reimint_types::Address,
    std::collections::HashMap,
    thiserror::Error,
};

/// Errors raised while constructing a validator set.
#[derive(Debug, Clone, Error)]
pub enum ValidatorSetError {
    #[error("invalid validator set: {0}")]
    InvalidValidatorSet(String),
}

/// A single validator: address, stake weight, and the proposer-priority
/// accumulator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validator {
    pub address: Address,
    pub voting_power: u64,
    /// Signed accumulator; re-centered around zero on every increment.
    pub priority: i128,
}

/// A deterministically ordered, weighted set of validators.
#[derive(Debug, Clone)]
pub struct ValidatorSet {
    /// Sorted by voting power descending, then address ascending.
    validators: Vec<Validator>,
    /// Address → index into `validators`.
    index: HashMap<Address, usize>,
    /// Sum of all voting powers. Always fits in 63 bits.
    total_voting_power: u64,
    /// Index of the validator chosen by the most recent increment.
    proposer: usize,
}

impl ValidatorSet {
    /// Build a set from `(address, voting_power)` pairs.
    ///
    /// Zero-power entries are dropped. Fails if the set ends up empty,
    /// contains duplicate addresses, or the total voting power does not fit
    /// in 63 bits.
    pub fn new(entries: Vec<(Address, u64)>) -> Result<Self, ValidatorSetError> {
        let mut validators: Vec<Validator> = entries
            .into_iter()
            .filter(|(_, power)| *power > 0)
            .map(|(address, voting_power)| Validator {
                address,
                voting_power,
                priority: 0,
            })
            .collect();

        if validators.is_empty() {
            return Err(ValidatorSetError::InvalidValidatorSet(
                "no validators with positive voting power".into(),
            ));
        }

        validators.sort_by(|a, b| {
            b.voting_power
                .cmp(&a.voting_power)
                .then_with(|| a.address.cmp(&b.address))
        });

        let mut total: u128 = 0;
        for v in &validators {
            total += v.voting_power as u128;
        }
        if total > i64::MAX as u128 {
            return Err(ValidatorSetError::InvalidValidatorSet(format!(
                "total voting power {total} exceeds 63 bits"
            )));
        }

        let mut index = HashMap::with_capacity(validators.len());
        for (i, v) in validators.iter().enumerate() {
            if index.insert(v.address, i).is_some() {
                return Err(ValidatorSetError::InvalidValidatorSet(format!(
                    "duplicate validator {:?}",
                    v.address
                )));
            }
        }

        let mut set = Self {
            validators,
            index,
            total_voting_power: total as u64,
            proposer: 0,
        };
        // Seed the proposer deterministically before any increment has run
        // (all priorities are zero, so this is the address tiebreak alone).
        set.proposer = set.select_highest_priority();
        Ok(set)
    }

    /// Build a set from staking output, dropping entries below the
    /// configured minimum voting power.
    pub fn from_staked(
        entries: Vec<(Address, u64)>,
        config: &ReimintConfig,
    ) -> Result<Self, ValidatorSetError> {
        let min = config.min_voting_power;
        Self::new(
            entries
                .into_iter()
                .filter(|(_, power)| *power >= min)
                .collect(),
        )
    }

    // ── Queries ─────────────────────────────────────────────────────────

    /// Number of validators.
    pub fn len(&self) -> usize {
        self.validators.len()
    }

    /// True when the set holds no validators (construction forbids this, so
    /// only reachable through `Default`-like misuse in tests).
    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// Sum of all voting powers.
    pub fn total_voting_power(&self) -> u64 {
        self.total_voting_power
    }

    /// The validator at a given index, in canonical order.
    pub fn get(&self, index: usize) -> Option<&Validator> {
        self.validators.get(index)
    }

    /// Canonical index of an address, if present.
    pub fn index_by_address(&self, address: &Address) -> Option<usize> {
        self.index.get(address).copied()
    }

    /// Voting power of an address, zero when absent.
    pub fn voting_power_of(&self, address: &Address) -> u64 {
        self.index
            .get(address)
            .map(|&i| self.validators[i].voting_power)
            .unwrap_or(0)
    }

    /// Whether an address is a member.
    pub fn contains(&self, address: &Address) -> bool {
        self.index.contains_key(address)
    }

    /// The validator selected by the most recent increment (or the seeded
    /// proposer of a fresh set).
    pub fn proposer(&self) -> &Validator {
        &self.validators[self.proposer]
    }

    /// Iterator over validators in canonical order.
    pub fn iter(&self) -> impl Iterator<Item = &Validator> {
        self.validators.iter()
    }

    /// True iff `power` strictly exceeds two thirds of the total.
    pub fn is_two_thirds(&self, power: u64) -> bool {
        (power as u128) * 3 > (self.total_voting_power as u128) * 2
    }

    // ── Proposer election ───────────────────────────────────────────────

    /// Advance the proposer accumulator by `times` rounds.
    ///
    /// Each round: grow every priority by its voting power, re-center so the
    /// mean is zero, compress the spread when it exceeds twice the total
    /// power, pick the highest priority (address tiebreak), and charge the
    /// winner the total power.
    pub fn increment_proposer_priority(&mut self, times: u32) {
        let total = self.total_voting_power as i128;
        for _ in 0..times {
            for v in &mut self.validators {
                v.priority += v.voting_power as i128;
            }
            self.center_priorities();
            self.scale_priorities(2 * total);
            let winner = self.select_highest_priority();
            self.validators[winner].priority -= total;
            self.proposer = winner;
        }
    }

    fn center_priorities(&mut self) {
        let sum: i128 = self.validators.iter().map(|v| v.priority).sum();
        let mean = sum / self.validators.len() as i128;
        for v in &mut self.validators {
            v.priority -= mean;
        }
    }

    /// Divide every priority by `ceil(spread / diff_max)` when the spread
    /// exceeds `diff_max`, keeping the accumulators bounded.
    fn scale_priorities(&mut self, diff_max: i128) {
        let max = self.validators.iter().map(|v| v.priority).max().unwrap_or(0);
        let min = self.validators.iter().map(|v| v.priority).min().unwrap_or(0);
        let diff = max - min;
        if diff > diff_max && diff_max > 0 {
            let divisor = (diff + diff_max - 1) / diff_max;
            for v in &mut self.validators {
                v.priority /= divisor;
            }
        }
    }

    fn select_highest_priority(&self) -> usize {
        let mut best = 0;
        for i in 1..self.validators.len() {
            let (a, b) = (&self.validators[i], &self.validators[best]);
            if a.priority > b.priority
                || (a.priority == b.priority && a.address < b.address)
            {
                best = i;
            }
        }
        best
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
