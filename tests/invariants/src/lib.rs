//! Property-based tests for the Reimint consensus core.
//!
//! Covered properties:
//! 1. Validator-set increments conserve total voting power and keep the
//!    priority sum bounded by it.
//! 2. Proposer election is deterministic and stake-proportional.
//! 3. Vote sets hold at most one vote per validator index, and a latched
//!    two-thirds hash never changes.
//! 4. Block identity covers evidence but never commit votes.
//! 5. Canonical encodings round-trip for votes, proposals, blocks, and the
//!    consensus seal.

#[cfg(test)]
mod codec_invariants;
#[cfg(test)]
mod validator_invariants;
#[cfg(test)]
mod vote_invariants;
