//! Key Data Encapsulations carried in EAPoL-Key frames, IEEE 802.11-2016,
//! 12.7.2 (Figure 12-35 and Table 12-6), and the key-data encryption
//! wrapper.

use airlock_crypto::keywrap;

use crate::{EapolError, Result};

const KDE_TYPE: u8 = 0xdd;
const OUI_IEEE: [u8; 3] = [0x00, 0x0f, 0xac];

const DATA_TYPE_GTK: u8 = 1;
const DATA_TYPE_PMKID: u8 = 4;
const DATA_TYPE_IGTK: u8 = 9;

/// A group key delivered in Msg3 or a group-key Msg1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GtkKde {
    pub key_id: u8,
    pub tx: bool,
    pub key: Vec<u8>,
}

/// An integrity group key delivered alongside the GTK under MFP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IgtkKde {
    pub key_id: u16,
    pub ipn: [u8; 6],
    pub key: Vec<u8>,
}

/// Everything we pull out of a decrypted key-data field. RSN elements are
/// kept raw for the Msg3 comparison against the advertised RSNE.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyData {
    pub rsne: Option<Vec<u8>>,
    pub gtk: Option<GtkKde>,
    pub igtk: Option<IgtkKde>,
    pub pmkid: Option<[u8; 16]>,
}

impl KeyData {
    /// Parses a plaintext key-data field. Iteration stops at the padding
    /// marker (a 0xdd KDE with zero length) per 12.7.2.
    pub fn parse(data: &[u8]) -> Result<KeyData> {
        let mut out = KeyData::default();
        let mut pos = 0usize;

        while pos + 2 <= data.len() {
            let (typ, len) = (data[pos], data[pos + 1] as usize);
            if typ == KDE_TYPE && len == 0 {
                break;
            }
            if pos + 2 + len > data.len() {
                return Err(EapolError::Truncated { need: pos + 2 + len, have: data.len() });
            }
            let body = &data[pos + 2..pos + 2 + len];
            pos += 2 + len;

            if typ == airlock_ie::eid::RSN {
                if out.rsne.is_none() {
                    let mut raw = vec![airlock_ie::eid::RSN, len as u8];
                    raw.extend_from_slice(body);
                    out.rsne = Some(raw);
                }
                continue;
            }
            if typ != KDE_TYPE || len < 4 || body[..3] != OUI_IEEE {
                continue;
            }

            match body[3] {
                DATA_TYPE_GTK if len >= 6 => {
                    out.gtk = Some(GtkKde {
                        key_id: body[4] & 0x03,
                        tx: body[4] & 0x04 != 0,
                        key: body[6..].to_vec(),
                    });
                }
                DATA_TYPE_IGTK if len >= 12 => {
                    let mut ipn = [0u8; 6];
                    ipn.copy_from_slice(&body[6..12]);
                    out.igtk = Some(IgtkKde {
                        key_id: u16::from_le_bytes([body[4], body[5]]),
                        ipn,
                        key: body[12..].to_vec(),
                    });
                }
                DATA_TYPE_PMKID if len >= 20 => {
                    let mut pmkid = [0u8; 16];
                    pmkid.copy_from_slice(&body[4..20]);
                    out.pmkid = Some(pmkid);
                }
                _ => {}
            }
        }

        Ok(out)
    }
}

/// Serializes KDEs (and an optional leading RSNE) into a plaintext
/// key-data field.
#[derive(Debug, Clone, Default)]
pub struct KeyDataBuilder {
    buf: Vec<u8>,
}

impl KeyDataBuilder {
    pub fn rsne(mut self, element: &[u8]) -> Self {
        self.buf.extend_from_slice(element);
        self
    }

    pub fn gtk(mut self, key_id: u8, tx: bool, key: &[u8]) -> Self {
        self.buf.push(KDE_TYPE);
        self.buf.push((6 + key.len()) as u8);
        self.buf.extend_from_slice(&OUI_IEEE);
        self.buf.push(DATA_TYPE_GTK);
        self.buf.push((key_id & 0x03) | if tx { 0x04 } else { 0 });
        self.buf.push(0);
        self.buf.extend_from_slice(key);
        self
    }

    pub fn igtk(mut self, key_id: u16, ipn: &[u8; 6], key: &[u8]) -> Self {
        self.buf.push(KDE_TYPE);
        self.buf.push((12 + key.len()) as u8);
        self.buf.extend_from_slice(&OUI_IEEE);
        self.buf.push(DATA_TYPE_IGTK);
        self.buf.extend_from_slice(&key_id.to_le_bytes());
        self.buf.extend_from_slice(ipn);
        self.buf.extend_from_slice(key);
        self
    }

    pub fn build(self) -> Vec<u8> {
        self.buf
    }
}

/// Encrypts key data for a frame with the Encrypted Key Data bit: pads to
/// the key-wrap block size with the 0xdd marker, then AES-wraps under the
/// KEK.
pub fn encrypt(kek: &[u8], plain: &[u8]) -> Result<Vec<u8>> {
    let mut padded = plain.to_vec();
    if padded.len() < 16 || padded.len() % 8 != 0 {
        padded.push(KDE_TYPE);
        while padded.len() < 16 || padded.len() % 8 != 0 {
            padded.push(0);
        }
    }
    Ok(keywrap::wrap(kek, &padded)?)
}

/// Decrypts the key-data field of a received frame.
pub fn decrypt(kek: &[u8], wrapped: &[u8]) -> Result<Vec<u8>> {
    Ok(keywrap::unwrap(kek, wrapped)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gtk_kde_round_trip() {
        let plain = KeyDataBuilder::default().gtk(1, true, &[0xab; 16]).build();
        let parsed = KeyData::parse(&plain).unwrap();
        let gtk = parsed.gtk.unwrap();
        assert_eq!(gtk.key_id, 1);
        assert!(gtk.tx);
        assert_eq!(gtk.key, vec![0xab; 16]);
    }

    #[test]
    fn rsne_and_gtk_coexist() {
        let rsne = airlock_ie::Rsne::wpa2_psk().to_bytes();
        let plain = KeyDataBuilder::default().rsne(&rsne).gtk(2, false, &[1; 16]).build();
        let parsed = KeyData::parse(&plain).unwrap();
        assert_eq!(parsed.rsne.as_deref(), Some(&rsne[..]));
        assert_eq!(parsed.gtk.unwrap().key_id, 2);
    }

    #[test]
    fn encrypt_pads_and_round_trips() {
        let kek = [0x55u8; 16];
        let rsne = airlock_ie::Rsne::wpa2_psk().to_bytes();
        let plain = KeyDataBuilder::default().rsne(&rsne).gtk(1, true, &[9; 16]).build();

        let wrapped = encrypt(&kek, &plain).unwrap();
        assert_eq!(wrapped.len() % 8, 0);
        let decrypted = decrypt(&kek, &wrapped).unwrap();
        // Padding survives parse: the 0xdd,0 marker terminates iteration.
        let parsed = KeyData::parse(&decrypted).unwrap();
        assert_eq!(parsed.rsne.as_deref(), Some(&rsne[..]));
        assert_eq!(parsed.gtk.unwrap().key, vec![9; 16]);
    }

    #[test]
    fn igtk_kde_round_trip() {
        let plain = KeyDataBuilder::default().igtk(4, &[1, 2, 3, 4, 5, 6], &[7; 16]).build();
        let igtk = KeyData::parse(&plain).unwrap().igtk.unwrap();
        assert_eq!(igtk.key_id, 4);
        assert_eq!(igtk.ipn, [1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn overrun_kde_rejected() {
        let bad = [KDE_TYPE, 0x20, 0x00, 0x0f];
        assert!(KeyData::parse(&bad).is_err());
    }
}
