//! The RSN security association layer: EAPoL-Key frame codec, the
//! per-association key ladder (`Handshake`) and the 4-Way Handshake state
//! machines for both the supplicant and authenticator roles.
//!
//! The state machines perform no I/O. Each input (a received EAPoL frame,
//! a timer expiry) produces a sequence of [`Update`]s the owner acts on:
//! frames to transmit, keys to install, timers to arm. This keeps the
//! engines deterministic under test and serializes all effects onto the
//! caller's event loop.

use thiserror::Error;

pub mod authenticator;
pub mod frame;
pub mod handshake;
pub mod keydata;
pub mod supplicant;

pub use authenticator::Authenticator;
pub use frame::{KeyFrame, KeyInfo, PacketType};
pub use handshake::{Handshake, HandshakeConfig};
pub use supplicant::Supplicant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Supplicant,
    Authenticator,
}

/// Why a handshake gave up. Reported through `Update::Failed` exactly
/// once; the owner deauthenticates the peer in response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeFailure {
    /// A retransmit limit was exhausted while waiting for the peer.
    Timeout,
    /// A frame that must be authenticated carried a bad MIC.
    MicMismatch,
    /// The RSNE in Msg2/Msg3 did not match the association's RSNE.
    IeMismatch,
    /// Key data could not be decrypted or lacked a required KDE.
    BadKeyData,
}

/// One effect requested by a state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update {
    /// Transmit this EAPoL PDU to the peer.
    TxFrame(Vec<u8>),
    /// The PTK is final; install the temporal key for the peer address.
    NewPtk { tk: Vec<u8>, cipher_selector: u32 },
    /// Install (or replace) the group key.
    NewGtk { index: u8, key: Vec<u8>, rsc: u64, cipher_selector: u32 },
    /// Install the integrity group key.
    NewIgtk { index: u16, key: Vec<u8>, ipn: [u8; 6] },
    /// Arm the per-message retransmit timer (1 s).
    StartTimer,
    /// Disarm the retransmit timer.
    StopTimer,
    /// The handshake finished; the owner may authorize the peer.
    Complete,
    /// The handshake failed; the owner deauthenticates.
    Failed(HandshakeFailure),
}

pub type UpdateSink = Vec<Update>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EapolError {
    #[error("EAPoL frame truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("unsupported EAPoL protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("not an EAPoL-Key descriptor")]
    NotKeyDescriptor,

    #[error("handshake state is frozen after PTK installation")]
    Frozen,

    #[error("handshake is missing {0}")]
    Incomplete(&'static str),

    #[error("information element error: {0}")]
    Ie(#[from] airlock_ie::IeError),

    #[error("crypto error: {0}")]
    Crypto(#[from] airlock_crypto::CryptoError),
}

pub type Result<T> = std::result::Result<T, EapolError>;

/// Per-message retransmit policy shared by both roles.
pub const RETRANSMIT_TIMEOUT_SECS: u64 = 1;
pub const RETRANSMIT_LIMIT: u8 = 3;
