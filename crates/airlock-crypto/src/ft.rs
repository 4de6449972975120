//! Fast BSS Transition key hierarchy, IEEE 802.11-2016, 12.7.1.7.

use aes::Aes128;
use cmac::Cmac;
use hmac::Mac;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::prf::kdf_sha256;
use crate::{CryptoError, Result};

/// The two level-one keys and their names, derived once per mobility
/// domain association. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct FtKeys {
    pub pmk_r0: [u8; 32],
    pub pmk_r0_name: [u8; 16],
    pub pmk_r1: [u8; 32],
    pub pmk_r1_name: [u8; 16],
}

impl std::fmt::Debug for FtKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FtKeys(r0_name={:02x?})", &self.pmk_r0_name[..4])
    }
}

/// Derives PMK-R0/R1 and their names. `mdid` is the 2-octet Mobility
/// Domain identifier in wire order, `r0kh_id` the 1..=48 octet key-holder
/// identity, `r1kh_id` the target AP's key-holder MAC.
pub fn derive_ft_keys(
    pmk: &[u8; 32],
    ssid: &[u8],
    mdid: [u8; 2],
    r0kh_id: &[u8],
    r1kh_id: &[u8; 6],
    spa: &[u8; 6],
) -> Result<FtKeys> {
    if r0kh_id.is_empty() || r0kh_id.len() > 48 {
        return Err(CryptoError::InvalidR0khId(r0kh_id.len()));
    }

    // R0-Key-Data = KDF-384(PMK, "FT-R0",
    //     SSIDlength || SSID || MDID || R0KHlength || R0KH-ID || S0KH-ID)
    let mut context = Vec::with_capacity(1 + ssid.len() + 2 + 1 + r0kh_id.len() + 6);
    context.push(ssid.len() as u8);
    context.extend_from_slice(ssid);
    context.extend_from_slice(&mdid);
    context.push(r0kh_id.len() as u8);
    context.extend_from_slice(r0kh_id);
    context.extend_from_slice(spa);

    let mut r0_key_data = [0u8; 48];
    kdf_sha256(pmk, b"FT-R0", &context, &mut r0_key_data);

    let mut pmk_r0 = [0u8; 32];
    pmk_r0.copy_from_slice(&r0_key_data[..32]);

    let mut hasher = Sha256::new();
    hasher.update(b"FT-R0N");
    hasher.update(&r0_key_data[32..]);
    let mut pmk_r0_name = [0u8; 16];
    pmk_r0_name.copy_from_slice(&hasher.finalize()[..16]);
    r0_key_data.zeroize();

    // PMK-R1 = KDF-256(PMK-R0, "FT-R1", R1KH-ID || S1KH-ID)
    let mut context = Vec::with_capacity(12);
    context.extend_from_slice(r1kh_id);
    context.extend_from_slice(spa);

    let mut pmk_r1 = [0u8; 32];
    kdf_sha256(&pmk_r0, b"FT-R1", &context, &mut pmk_r1);

    let mut hasher = Sha256::new();
    hasher.update(b"FT-R1N");
    hasher.update(pmk_r0_name);
    hasher.update(r1kh_id);
    hasher.update(spa);
    let mut pmk_r1_name = [0u8; 16];
    pmk_r1_name.copy_from_slice(&hasher.finalize()[..16]);

    Ok(FtKeys { pmk_r0, pmk_r0_name, pmk_r1, pmk_r1_name })
}

/// FT PTK derivation, IEEE 802.11-2016, 12.7.1.7.5:
/// KDF(PMK-R1, "FT-PTK", SNonce || ANonce || BSSID || STA-ADDR).
pub fn derive_ft_ptk(
    pmk_r1: &[u8; 32],
    bssid: &[u8; 6],
    spa: &[u8; 6],
    anonce: &[u8; 32],
    snonce: &[u8; 32],
    tk_len: usize,
) -> crate::Ptk {
    let mut context = Vec::with_capacity(32 + 32 + 6 + 6);
    context.extend_from_slice(snonce);
    context.extend_from_slice(anonce);
    context.extend_from_slice(bssid);
    context.extend_from_slice(spa);

    let mut bytes = vec![0u8; 32 + tk_len];
    kdf_sha256(pmk_r1, b"FT-PTK", &context, &mut bytes);
    crate::Ptk::from_bytes(bytes)
}

/// FTE MIC, IEEE 802.11-2016, 13.8.4 and 13.8.5: AES-128-CMAC over
/// `SPA || AA || sequence || element...` where the FTE element is passed
/// with its MIC field zeroed.
pub fn fte_mic(
    kck: &[u8],
    spa: &[u8; 6],
    aa: &[u8; 6],
    transaction_seq: u8,
    elements: &[&[u8]],
) -> Result<[u8; 16]> {
    let mut mac = Cmac::<Aes128>::new_from_slice(kck)
        .map_err(|_| CryptoError::InvalidKeyLength { what: "KCK", got: kck.len() })?;
    mac.update(spa);
    mac.update(aa);
    mac.update(&[transaction_seq]);
    for element in elements {
        mac.update(element);
    }
    let mut out = [0u8; 16];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPA: [u8; 6] = [0x02, 0x11, 0x22, 0x33, 0x44, 0x55];
    const R1KH: [u8; 6] = [0x02, 0xaa, 0xbb, 0xcc, 0xdd, 0xee];

    #[test]
    fn key_names_bind_all_inputs() {
        let pmk = [0x42u8; 32];
        let base =
            derive_ft_keys(&pmk, b"Net", [0x34, 0x12], b"r0kh.example", &R1KH, &SPA).unwrap();

        let other_mdid =
            derive_ft_keys(&pmk, b"Net", [0x35, 0x12], b"r0kh.example", &R1KH, &SPA).unwrap();
        assert_ne!(base.pmk_r0_name, other_mdid.pmk_r0_name);

        let other_r1kh = derive_ft_keys(
            &pmk,
            b"Net",
            [0x34, 0x12],
            b"r0kh.example",
            &[0x02, 0, 0, 0, 0, 1],
            &SPA,
        )
        .unwrap();
        assert_eq!(base.pmk_r0_name, other_r1kh.pmk_r0_name);
        assert_ne!(base.pmk_r1_name, other_r1kh.pmk_r1_name);
    }

    #[test]
    fn r0kh_id_length_enforced() {
        let pmk = [0u8; 32];
        assert!(derive_ft_keys(&pmk, b"Net", [0, 0], &[], &R1KH, &SPA).is_err());
        assert!(derive_ft_keys(&pmk, b"Net", [0, 0], &[0u8; 49], &R1KH, &SPA).is_err());
    }

    #[test]
    fn fte_mic_covers_sequence_number() {
        let kck = [7u8; 16];
        let rsne = [0x30u8, 0x02, 0x01, 0x00];
        let a = fte_mic(&kck, &SPA, &R1KH, 5, &[&rsne]).unwrap();
        let b = fte_mic(&kck, &SPA, &R1KH, 6, &[&rsne]).unwrap();
        assert_ne!(a, b);
    }
}
