//! AES key wrap, RFC 3394, as used for EAPoL key-data encryption.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;

use crate::{CryptoError, Result};

const IV: u64 = 0xa6a6_a6a6_a6a6_a6a6;

fn cipher(kek: &[u8]) -> Result<Aes128> {
    Aes128::new_from_slice(kek)
        .map_err(|_| CryptoError::InvalidKeyLength { what: "KEK", got: kek.len() })
}

/// Wraps `plain` (a multiple of 8, at least 16 octets) under `kek`.
pub fn wrap(kek: &[u8], plain: &[u8]) -> Result<Vec<u8>> {
    if plain.len() < 16 || plain.len() % 8 != 0 {
        return Err(CryptoError::InvalidWrappedLength(plain.len()));
    }
    let cipher = cipher(kek)?;

    let n = plain.len() / 8;
    let mut a = IV;
    let mut r: Vec<[u8; 8]> = plain.chunks_exact(8).map(|c| c.try_into().unwrap()).collect();

    for j in 0..6 {
        for (i, ri) in r.iter_mut().enumerate() {
            let mut block = [0u8; 16];
            block[..8].copy_from_slice(&a.to_be_bytes());
            block[8..].copy_from_slice(ri);
            let mut ga = GenericArray::clone_from_slice(&block);
            cipher.encrypt_block(&mut ga);
            let t = (n * j + i + 1) as u64;
            a = u64::from_be_bytes(ga[..8].try_into().unwrap()) ^ t;
            ri.copy_from_slice(&ga[8..]);
        }
    }

    let mut out = Vec::with_capacity(plain.len() + 8);
    out.extend_from_slice(&a.to_be_bytes());
    for block in r {
        out.extend_from_slice(&block);
    }
    Ok(out)
}

/// Unwraps RFC 3394 ciphertext, verifying the integrity value.
pub fn unwrap(kek: &[u8], wrapped: &[u8]) -> Result<Vec<u8>> {
    if wrapped.len() < 24 || wrapped.len() % 8 != 0 {
        return Err(CryptoError::InvalidWrappedLength(wrapped.len()));
    }
    let cipher = cipher(kek)?;

    let n = wrapped.len() / 8 - 1;
    let mut a = u64::from_be_bytes(wrapped[..8].try_into().unwrap());
    let mut r: Vec<[u8; 8]> =
        wrapped[8..].chunks_exact(8).map(|c| c.try_into().unwrap()).collect();

    for j in (0..6).rev() {
        for i in (0..n).rev() {
            let t = (n * j + i + 1) as u64;
            let mut block = [0u8; 16];
            block[..8].copy_from_slice(&(a ^ t).to_be_bytes());
            block[8..].copy_from_slice(&r[i]);
            let mut ga = GenericArray::clone_from_slice(&block);
            cipher.decrypt_block(&mut ga);
            a = u64::from_be_bytes(ga[..8].try_into().unwrap());
            r[i].copy_from_slice(&ga[8..]);
        }
    }

    if a != IV {
        return Err(CryptoError::UnwrapIntegrity);
    }

    let mut out = Vec::with_capacity(n * 8);
    for block in r {
        out.extend_from_slice(&block);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 3394, section 4.1: 128-bit key data with a 128-bit KEK.
    #[test]
    fn rfc3394_vector() {
        let kek: Vec<u8> = (0x00..=0x0f).collect();
        let plain = [
            0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd,
            0xee, 0xff,
        ];
        let expected = [
            0x1f, 0xa6, 0x8b, 0x0a, 0x81, 0x12, 0xb4, 0x47, 0xae, 0xf3, 0x4b, 0xd8, 0xfb, 0x5a,
            0x7b, 0x82, 0x9d, 0x3e, 0x86, 0x23, 0x71, 0xd2, 0xcf, 0xe5,
        ];

        let wrapped = wrap(&kek, &plain).unwrap();
        assert_eq!(wrapped, expected);
        assert_eq!(unwrap(&kek, &wrapped).unwrap(), plain);
    }

    #[test]
    fn corrupted_ciphertext_fails_integrity() {
        let kek = [3u8; 16];
        let mut wrapped = wrap(&kek, &[0x77; 24]).unwrap();
        wrapped[9] ^= 0x01;
        assert_eq!(unwrap(&kek, &wrapped), Err(CryptoError::UnwrapIntegrity));
    }

    #[test]
    fn length_validation() {
        let kek = [3u8; 16];
        assert!(wrap(&kek, &[0u8; 8]).is_err());
        assert!(wrap(&kek, &[0u8; 17]).is_err());
        assert!(unwrap(&kek, &[0u8; 16]).is_err());
    }
}
