//! Codec for the TLV-encoded information elements carried in 802.11
//! management frames: RSNE, MDE, FTE, WSC attribute payloads, supported
//! rates and SSID.
//!
//! Parsers take the element body (after tag and length); builders emit the
//! full element including tag and length so the output can be spliced into
//! a frame or compared byte-for-byte against a peer's element.

use thiserror::Error;

pub mod ft;
pub mod rates;
pub mod rsne;
pub mod tlv;
pub mod wsc;

pub use ft::{Fte, Mde};
pub use rsne::{AkmSuite, CipherSuite, RsnCapabilities, Rsne};
pub use tlv::{Tlv, TlvIterator};

/// Element IDs from IEEE 802.11-2016, Table 9-77.
pub mod eid {
    pub const SSID: u8 = 0;
    pub const SUPPORTED_RATES: u8 = 1;
    pub const DSSS_PARAM_SET: u8 = 3;
    pub const TIM: u8 = 5;
    pub const RSN: u8 = 48;
    pub const EXTENDED_SUPPORTED_RATES: u8 = 50;
    pub const MOBILITY_DOMAIN: u8 = 54;
    pub const FAST_BSS_TRANSITION: u8 = 55;
    pub const VENDOR_SPECIFIC: u8 = 221;
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IeError {
    #[error("element truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("element {tag} overruns its frame")]
    Overrun { tag: u8 },

    #[error("duplicate element {tag} in frame")]
    Duplicate { tag: u8 },

    #[error("unsupported {what} version {version}")]
    UnsupportedVersion { what: &'static str, version: u16 },

    #[error("malformed {what}: {reason}")]
    Malformed { what: &'static str, reason: &'static str },
}

pub type Result<T> = std::result::Result<T, IeError>;

impl IeError {
    pub(crate) fn malformed(what: &'static str, reason: &'static str) -> Self {
        IeError::Malformed { what, reason }
    }
}
