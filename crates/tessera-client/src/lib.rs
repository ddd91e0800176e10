//! Client
//!
//! Action-based encryption manager for Tessera. Owns the local users of a
//! device, talks to their key servers, and encrypts and decrypts messages for
//! any number of peer devices.
//!
//! # Architecture
//!
//! The manager follows the Sans-IO and Action-Based patterns of
//! [`tessera_core`]. It receives events ([`ManagerEvent`]), processes them
//! through pure state machine logic, and returns actions ([`ManagerAction`])
//! for the caller to execute. Every key-server exchange is a
//! [`ManagerAction::Post`] whose answer comes back as a
//! [`ManagerEvent::ServerResponse`]; every asynchronous operation ends with
//! exactly one [`ManagerAction::Completed`].
//!
//! Decryption and trust management never wait on the network and are plain
//! methods on [`Manager`].
//!
//! # Components
//!
//! - [`Manager`]: top-level state machine over storage and environment
//! - [`ManagerEvent`]: events fed into the manager
//! - [`ManagerAction`]: actions produced by the manager
//! - [`EncryptOutput`] / [`DecryptOutput`]: results of the message operations
//!
//! # Runtime (optional)
//!
//! With the `runtime` feature enabled, this crate also provides:
//! - [`runtime::AsyncManager`]: async facade that executes posts on tokio
//! - [`runtime::SystemEnv`]: environment backed by the OS clock and RNG

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod decryption;
mod encryption;
mod error;
mod event;
mod key_exchange;
mod maintenance;
mod manager;

#[cfg(feature = "runtime")]
pub mod runtime;

pub use error::ManagerError;
pub use event::{
    Completion, DecryptOutput, EncryptOutput, ManagerAction, ManagerEvent, RecipientOutput,
    RecipientStatus, RequestId, Ticket,
};
pub use key_exchange::STATUS_OK;
pub use manager::Manager;
pub use tessera_core::{EncryptionPolicy, Environment, ManagerConfig, PeerDeviceStatus};
pub use tessera_crypto::CurveId;
