//! Shared helpers for the Reimint benchmarks.

use {
    reimint_consensus::ValidatorSet,
    reimint_types::{LocalSigner, Signer},
};

/// Build `n` deterministic signers and the matching equal-power validator
/// set, with signers ordered by canonical validator index.
pub fn committee(n: usize) -> (Vec<LocalSigner>, ValidatorSet) {
    let mut signers: Vec<LocalSigner> = (0..n)
        .map(|i| {
            let mut b = [0u8; 32];
            b[0] = (i % 251) as u8 + 1;
            b[1] = (i / 251) as u8;
            b[31] = 0xBE;
            LocalSigner::from_secret_bytes(&b).unwrap()
        })
        .collect();
    let vs = ValidatorSet::new(signers.iter().map(|s| (s.address(), 1_000_000)).collect())
        .unwrap();
    signers.sort_by_key(|s| vs.index_by_address(&s.address()).unwrap());
    (signers, vs)
}
