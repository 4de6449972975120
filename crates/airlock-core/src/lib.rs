//! Connection core: the STA connect/disconnect/FT state machine, the
//! soft-AP association state machine with WSC push-button enrollment,
//! and the per-interface orchestrator that routes kernel events between
//! them.
//!
//! The state machines drive the kernel through the [`driver::Driver`]
//! trait and never touch sockets directly; the daemon crate supplies the
//! real implementation and tests supply a recording fake.

use thiserror::Error;

pub mod ap;
pub mod driver;
pub mod events;
pub mod manager;
pub mod profile;
pub mod station;

pub use driver::{Driver, TimerKind};
pub use events::{ApEvent, ConnectError, DisconnectReason, StationEvent};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("operation already in progress")]
    InProgress,

    #[error("not connected")]
    NotConnected,

    #[error("not supported: {0}")]
    NotSupported(&'static str),

    #[error("invalid arguments: {0}")]
    InvalidArgs(&'static str),

    #[error("information element error: {0}")]
    Ie(#[from] airlock_ie::IeError),

    #[error("handshake error: {0}")]
    Eapol(#[from] airlock_eapol::EapolError),

    #[error("crypto error: {0}")]
    Crypto(#[from] airlock_crypto::CryptoError),
}

pub type Result<T> = std::result::Result<T, CoreError>;
