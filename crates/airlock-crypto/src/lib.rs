//! Cryptographic adapters for the 802.11 key hierarchy: passphrase to PMK,
//! PTK derivation, EAPoL MIC computation, AES key wrap, the FT key ladder
//! and nonce generation.
//!
//! Everything here is a thin, typed layer over the RustCrypto primitives;
//! protocol decisions (which algorithm a given AKM uses) are made by the
//! callers through the `Akm` parameter.

use thiserror::Error;

pub mod ft;
pub mod keywrap;
pub mod mic;
pub mod nonce;
pub mod prf;
pub mod psk;
pub mod ptk;

pub use mic::MicAlgorithm;
pub use ptk::Ptk;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid key length {got} for {what}")]
    InvalidKeyLength { what: &'static str, got: usize },

    #[error("invalid passphrase: must be 8..=63 characters")]
    InvalidPassphrase,

    #[error("wrapped data length {0} is not a multiple of 8 or too short")]
    InvalidWrappedLength(usize),

    #[error("key unwrap integrity check failed")]
    UnwrapIntegrity,

    #[error("R0KH-ID length {0} out of range 1..=48")]
    InvalidR0khId(usize),
}

pub type Result<T> = std::result::Result<T, CryptoError>;
