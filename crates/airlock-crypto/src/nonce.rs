//! CSPRNG-backed nonce and group key generation.

use rand::rngs::OsRng;
use rand::RngCore;

/// A fresh 256-bit nonce for the 4-Way Handshake.
pub fn new_nonce() -> [u8; 32] {
    let mut nonce = [0u8; 32];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// A fresh group temporal key of the requested cipher key length.
pub fn new_gtk(len: usize) -> Vec<u8> {
    let mut key = vec![0u8; len];
    OsRng.fill_bytes(&mut key);
    key
}
