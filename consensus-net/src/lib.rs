//! Reimint Consensus Networking Layer
//!
//! The reactor between the wire and the consensus state machine. It keeps a
//! [`peer::PeerRoundState`] per connection, demultiplexes inbound frames
//! into `(peer, message)` events for the machine, and turns the machine's
//! notifications into broadcasts and targeted gossip.
//!
//! ```text
//!  ┌─────────────────────────────────────────────────┐
//!  │  StateMachine (reimint-consensus)               │
//!  │  ◀ Event::Message { peer, msg }                 │
//!  │  ▶ Notification (round-step, votes, requests)   │
//!  └───────────────┬─────────────────────────────────┘
//!                  │ EventQueue / mpsc
//!  ┌───────────────▼─────────────────────────────────┐
//!  │  Reactor                                        │
//!  │  • PeerRoundState per peer                      │
//!  │  • height cache: proposal, block, votes         │
//!  │  • gossip sweep: one missing vote per peer      │
//!  │  • VoteSetMaj23 → VoteSetBits answers           │
//!  └───────────────┬─────────────────────────────────┘
//!                  │ encoded [code, payload] frames
//!  ┌───────────────▼─────────────────────────────────┐
//!  │  Transport (session layer, out of scope here)   │
//!  └─────────────────────────────────────────────────┘
//! ```
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`]  | `ReactorConfig` defaults and dev overrides |
//! | [`peer`]    | Per-peer round state and outbound channel |
//! | [`reactor`] | The gossip loop itself |
//! | [`error`]   | Crate-wide error enum |

pub mod config;
pub mod error;
pub mod peer;
pub mod reactor;

pub use config::ReactorConfig;
pub use error::{ReactorError, Result};
pub use peer::{Peer, PeerRoundState};
pub use reactor::{PeerCommand, Reactor, ReactorHandle};
