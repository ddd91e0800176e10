//! Deterministic simulation harness for Tessera.
//!
//! Managers run against in-process key servers with every post parked until
//! the test decides how and when it is answered. Time and randomness come
//! from a seeded [`SimEnv`], so a failing run replays exactly from its seed.
//!
//! # Components
//!
//! - [`SimEnv`]: seeded RNG and virtual clocks
//! - [`SimNetwork`]: nodes, key servers and the posts in flight between them
//! - [`invariants`]: behavioral checks over [`SystemSnapshot`]s of a network
//!
//! # Invariant Testing
//!
//! Invariants verify WHAT must be true across all delivery orders, not
//! specific scenarios. Use [`InvariantRegistry::standard()`] for the manager
//! ordering and deduplication guarantees.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod invariants;
pub mod sim_env;
pub mod sim_network;

pub use invariants::{
    CompletedOnce, EncryptionOrder, Invariant, InvariantRegistry, InvariantResult, NodeSnapshot,
    SingleFetchPerPeer, SystemSnapshot, Violation,
};
pub use sim_env::{SIM_EPOCH_SECS, SimEnv, SimInstant};
pub use sim_network::{DeliveryOrder, InFlight, SimNetwork, SimNode};
