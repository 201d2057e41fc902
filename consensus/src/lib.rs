//! Reimint BFT Consensus Core
//!
//! A Tendermint-style Byzantine fault tolerant consensus engine for an
//! Ethereum-compatible proof-of-stake chain. Each block height runs one or
//! more rounds of a two-phase commit:
//!
//! 1. **Propose** — the round's elected proposer (stake-weighted
//!    accumulator election) broadcasts a signed proposal and the full block.
//! 2. **Prevote** — validators evaluate the proposal and broadcast prevotes.
//! 3. **Precommit** — upon a prevote polka (2/3+ for one hash), validators
//!    lock on the block and broadcast precommits.
//! 4. **Commit** — upon 2/3+ precommits for one hash, the block is sealed
//!    with the precommit aggregate and handed to the block pipeline.
//!
//! # Key properties
//!
//! - **Safety**: at most one block per height while less than 1/3 of the
//!   voting power is Byzantine; locks are only released by a later polka.
//! - **Liveness**: round timeouts grow linearly, so consecutive failed
//!   rounds leave more time for slow proposers and links.
//! - **Accountability**: conflicting votes become [`evidence`] that is
//!   persisted, gossiped, and sealed into blocks for slashing.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                    StateMachine                           │
//! │  ┌──────────┐ ┌──────────────┐ ┌───────────────────────┐  │
//! │  │  Config  │ │ ValidatorSet │ │     EvidencePool      │  │
//! │  └──────────┘ └──────────────┘ └───────────────────────┘  │
//! │  ┌─────────────────────────────────────────────────────┐  │
//! │  │ RoundState: height, round, step, locks, HeightVotes │  │
//! │  └─────────────────────────────────────────────────────┘  │
//! │  ┌───────────────┐      ┌────────────────────────────┐    │
//! │  │ TimeoutTicker │─────▶│ EventQueue (bounded, drop- │    │
//! │  └───────────────┘      │ oldest; peers + timeouts + │    │
//! │        reactor ────────▶│ new chain heads)           │    │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! All transitions run on one cooperative loop; concurrency lives at the
//! edges (reactor, ticker, block pipeline) and converges on the queue.

pub mod bit_array;
pub mod config;
pub mod event;
pub mod evidence;
pub mod extra_data;
pub mod height_vote_set;
pub mod message;
pub mod proposal;
pub mod round_state;
pub mod state_machine;
pub mod timeout;
pub mod validator_set;
pub mod vote;
pub mod vote_set;

/// Opaque peer identity assigned by the networking layer.
pub type PeerId = String;

// Re-exports for convenience
pub use bit_array::BitArray;
pub use config::{ConfigError, ReimintConfig};
pub use event::{Event, EventQueue};
pub use evidence::{DuplicateVoteEvidence, EvidenceError, EvidencePool};
pub use extra_data::{calc_block_hash, calc_block_hash_with, ExtraData, ExtraDataError};
pub use height_vote_set::HeightVoteSet;
pub use message::ConsensusMessage;
pub use proposal::Proposal;
pub use round_state::{RoundState, Step};
pub use state_machine::{
    BlockPipeline, Notification, PipelineError, StateMachine, StateMachineHandle,
};
pub use timeout::{TimeoutInfo, TimeoutTicker};
pub use validator_set::{Validator, ValidatorSet, ValidatorSetError};
pub use vote::{Vote, VoteType};
pub use vote_set::{VoteSet, VoteSetError};
