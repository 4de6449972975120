//! The two pseudo-random functions of IEEE 802.11-2016: the SHA-1 based
//! PRF of 12.7.1.2 and the SHA-256 based KDF of 12.7.1.7.2.

use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha256;

type HmacSha1 = Hmac<Sha1>;
type HmacSha256 = Hmac<Sha256>;

/// PRF(K, A, B): HMAC-SHA1 iterated over `A || 0x00 || B || counter`,
/// filling `out`.
pub fn prf_sha1(key: &[u8], label: &[u8], data: &[u8], out: &mut [u8]) {
    let mut written = 0;
    let mut counter = 0u8;

    while written < out.len() {
        let mut mac =
            HmacSha1::new_from_slice(key).expect("HMAC-SHA1 accepts any key length");
        mac.update(label);
        mac.update(&[0u8]);
        mac.update(data);
        mac.update(&[counter]);
        let digest = mac.finalize().into_bytes();

        let n = digest.len().min(out.len() - written);
        out[written..written + n].copy_from_slice(&digest[..n]);
        written += n;
        counter = counter.wrapping_add(1);
    }
}

/// KDF-Hash-Length(K, label, context): HMAC-SHA256 over
/// `counter_le || label || context || length_le` with the counter starting
/// at one and the length expressed in bits.
pub fn kdf_sha256(key: &[u8], label: &[u8], context: &[u8], out: &mut [u8]) {
    let bits = (out.len() * 8) as u16;
    let mut written = 0;
    let mut counter = 1u16;

    while written < out.len() {
        let mut mac =
            HmacSha256::new_from_slice(key).expect("HMAC-SHA256 accepts any key length");
        mac.update(&counter.to_le_bytes());
        mac.update(label);
        mac.update(context);
        mac.update(&bits.to_le_bytes());
        let digest = mac.finalize().into_bytes();

        let n = digest.len().min(out.len() - written);
        out[written..written + n].copy_from_slice(&digest[..n]);
        written += n;
        counter += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // IEEE 802.11-2016, Annex J.3, PRF test vector 1.
    #[test]
    fn prf_sha1_known_answer() {
        let key = [0x0b; 20];
        let mut out = [0u8; 24];
        prf_sha1(&key, b"prefix", b"Hi There", &mut out);
        let expected = [
            0xbc, 0xd4, 0xc6, 0x50, 0xb3, 0x0b, 0x96, 0x84, 0x95, 0x18, 0x29, 0xe0, 0xd7, 0x5f,
            0x9d, 0x54, 0xb8, 0x62, 0x17, 0x5e, 0xd9, 0xf0, 0x06, 0x06,
        ];
        assert_eq!(out, expected);
    }

    #[test]
    fn prf_output_is_deterministic_across_lengths() {
        let key = [7u8; 32];
        let mut short = [0u8; 16];
        let mut long = [0u8; 48];
        prf_sha1(&key, b"Pairwise key expansion", b"ctx", &mut short);
        prf_sha1(&key, b"Pairwise key expansion", b"ctx", &mut long);
        assert_eq!(short, long[..16]);
    }

    #[test]
    fn kdf_sha256_length_affects_output() {
        let key = [1u8; 32];
        let mut a = [0u8; 16];
        let mut b = [0u8; 32];
        kdf_sha256(&key, b"FT-R1", b"ctx", &mut a);
        kdf_sha256(&key, b"FT-R1", b"ctx", &mut b);
        // The bit-length is mixed into every block, so a shorter request
        // is not a prefix of a longer one.
        assert_ne!(a, b[..16]);
    }
}
