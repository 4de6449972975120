//! Pairwise Transient Key derivation, IEEE 802.11-2016, 12.7.1.3.

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::prf::{kdf_sha256, prf_sha1};

/// Which hash family the negotiated AKM uses for the key hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyDerivation {
    Sha1,
    Sha256,
}

/// The PTK partitioned into KCK (16), KEK (16) and the temporal key.
/// Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Ptk {
    bytes: Vec<u8>,
}

impl Ptk {
    pub(crate) fn from_bytes(bytes: Vec<u8>) -> Ptk {
        Ptk { bytes }
    }

    pub fn kck(&self) -> &[u8] {
        &self.bytes[..16]
    }

    pub fn kek(&self) -> &[u8] {
        &self.bytes[16..32]
    }

    pub fn tk(&self) -> &[u8] {
        &self.bytes[32..]
    }
}

impl std::fmt::Debug for Ptk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of logs.
        write!(f, "Ptk({} octets)", self.bytes.len())
    }
}

impl PartialEq for Ptk {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

/// Derives the PTK over the concatenation of the min/max ordered
/// authenticator and supplicant addresses and nonces.
pub fn derive_ptk(
    derivation: KeyDerivation,
    pmk: &[u8],
    aa: &[u8; 6],
    spa: &[u8; 6],
    anonce: &[u8; 32],
    snonce: &[u8; 32],
    tk_len: usize,
) -> Ptk {
    let mut context = Vec::with_capacity(6 + 6 + 32 + 32);
    let (addr_lo, addr_hi) = if aa <= spa { (aa, spa) } else { (spa, aa) };
    context.extend_from_slice(addr_lo);
    context.extend_from_slice(addr_hi);
    let (nonce_lo, nonce_hi) = if anonce <= snonce { (anonce, snonce) } else { (snonce, anonce) };
    context.extend_from_slice(nonce_lo);
    context.extend_from_slice(nonce_hi);

    let mut bytes = vec![0u8; 32 + tk_len];
    match derivation {
        KeyDerivation::Sha1 => {
            prf_sha1(pmk, b"Pairwise key expansion", &context, &mut bytes);
        }
        KeyDerivation::Sha256 => {
            kdf_sha256(pmk, b"Pairwise key expansion", &context, &mut bytes);
        }
    }

    Ptk { bytes }
}
