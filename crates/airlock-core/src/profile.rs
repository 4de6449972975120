//! Network profile reader.
//!
//! Profiles are INI-style text with at least a `[Security]` group
//! carrying `Passphrase` and/or `PreSharedKey` (64 hex digits). Only the
//! read contract is fixed here; storage and file naming belong to the
//! embedding application.

use airlock_crypto::psk::psk_from_passphrase;

use crate::{CoreError, Result};

#[derive(Debug, Clone, Default)]
pub struct NetworkProfile {
    entries: Vec<(String, String, String)>,
}

impl NetworkProfile {
    /// Parses INI text. Unknown groups and keys are preserved; malformed
    /// lines (outside any group, or without `=`) are rejected.
    pub fn parse(text: &str) -> Result<NetworkProfile> {
        let mut entries = Vec::new();
        let mut group: Option<String> = None;

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                group = Some(name.trim().to_string());
                continue;
            }
            let Some(group) = &group else {
                return Err(CoreError::InvalidArgs("profile entry outside any group"));
            };
            let Some((key, value)) = line.split_once('=') else {
                return Err(CoreError::InvalidArgs("profile line without '='"));
            };
            entries.push((group.clone(), key.trim().to_string(), value.trim().to_string()));
        }

        Ok(NetworkProfile { entries })
    }

    pub fn get(&self, group: &str, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(g, k, _)| g.eq_ignore_ascii_case(group) && k.eq_ignore_ascii_case(key))
            .map(|(_, _, v)| v.as_str())
    }

    /// Resolves the PMK for `ssid`: an explicit `PreSharedKey` wins over
    /// a `Passphrase`.
    pub fn pmk(&self, ssid: &[u8]) -> Result<Option<[u8; 32]>> {
        if let Some(hex) = self.get("Security", "PreSharedKey") {
            let bytes = decode_hex(hex)
                .ok_or(CoreError::InvalidArgs("PreSharedKey is not 64 hex digits"))?;
            return Ok(Some(bytes));
        }
        if let Some(passphrase) = self.get("Security", "Passphrase") {
            return Ok(Some(psk_from_passphrase(passphrase, ssid)?));
        }
        Ok(None)
    }
}

fn decode_hex(hex: &str) -> Option<[u8; 32]> {
    let hex = hex.trim();
    if hex.len() != 64 {
        return None;
    }
    let mut out = [0u8; 32];
    for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
        let hi = (chunk[0] as char).to_digit(16)?;
        let lo = (chunk[1] as char).to_digit(16)?;
        out[i] = ((hi << 4) | lo) as u8;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passphrase_derives_pmk() {
        let profile = NetworkProfile::parse("[Security]\nPassphrase=password\n").unwrap();
        let pmk = profile.pmk(b"IEEE").unwrap().unwrap();
        // Matches the Annex J.4 vector.
        assert_eq!(pmk[0], 0xf4);
        assert_eq!(pmk[31], 0x2e);
    }

    #[test]
    fn preshared_key_wins_over_passphrase() {
        let text = "[Security]\nPassphrase=hello1234\nPreSharedKey=\
                    0000000000000000000000000000000000000000000000000000000000000042\n";
        let profile = NetworkProfile::parse(text).unwrap();
        let pmk = profile.pmk(b"Net").unwrap().unwrap();
        assert_eq!(pmk[31], 0x42);
    }

    #[test]
    fn open_profile_has_no_pmk() {
        let profile = NetworkProfile::parse("[Settings]\nAutoConnect=true\n").unwrap();
        assert_eq!(profile.pmk(b"Net").unwrap(), None);
    }

    #[test]
    fn comments_and_case_insensitive_lookup() {
        let text = "# profile\n[security]\npassphrase = hello1234\n";
        let profile = NetworkProfile::parse(text).unwrap();
        assert_eq!(profile.get("Security", "Passphrase"), Some("hello1234"));
    }

    #[test]
    fn malformed_lines_rejected() {
        assert!(NetworkProfile::parse("Passphrase=x\n").is_err());
        assert!(NetworkProfile::parse("[Security]\nPassphrase\n").is_err());
        let profile = NetworkProfile::parse("[Security]\nPreSharedKey=zz\n").unwrap();
        assert!(profile.pmk(b"Net").is_err());
    }
}
