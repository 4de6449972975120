//! Robust Security Network Element, IEEE 802.11-2016, 9.4.2.25.
//!
//! Cipher and AKM suite lists are kept as bitmaps so FSMs can intersect
//! offered and requested suites without allocating; `to_bytes` emits a
//! canonical encoding suitable for byte comparison against a peer element.

use crate::{eid, IeError, Result};

const OUI_IEEE: [u8; 3] = [0x00, 0x0f, 0xac];

/// Cipher suites as bitmap positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CipherSuite {
    UseGroup = 0x0001,
    Wep40 = 0x0002,
    Wep104 = 0x0004,
    Tkip = 0x0008,
    Ccmp = 0x0010,
    BipCmac128 = 0x0020,
}

impl CipherSuite {
    fn selector_type(self) -> u8 {
        match self {
            CipherSuite::UseGroup => 0,
            CipherSuite::Wep40 => 1,
            CipherSuite::Tkip => 2,
            CipherSuite::Ccmp => 4,
            CipherSuite::Wep104 => 5,
            CipherSuite::BipCmac128 => 6,
        }
    }

    fn from_selector(oui: &[u8], typ: u8) -> Option<CipherSuite> {
        if oui != OUI_IEEE {
            return None;
        }
        match typ {
            0 => Some(CipherSuite::UseGroup),
            1 => Some(CipherSuite::Wep40),
            2 => Some(CipherSuite::Tkip),
            4 => Some(CipherSuite::Ccmp),
            5 => Some(CipherSuite::Wep104),
            6 => Some(CipherSuite::BipCmac128),
            _ => None,
        }
    }

    /// nl80211 cipher suite selector, 00-0F-AC:type in host order.
    pub fn to_cipher_selector(self) -> u32 {
        0x000f_ac00 | u32::from(self.selector_type())
    }

    /// Temporal key length in octets.
    pub fn key_len(self) -> usize {
        match self {
            CipherSuite::Tkip => 32,
            _ => 16,
        }
    }

    const CANONICAL: [CipherSuite; 6] = [
        CipherSuite::UseGroup,
        CipherSuite::Wep40,
        CipherSuite::Wep104,
        CipherSuite::Tkip,
        CipherSuite::Ccmp,
        CipherSuite::BipCmac128,
    ];
}

/// AKM suites as bitmap positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum AkmSuite {
    Dot1x = 0x0001,
    Psk = 0x0002,
    FtDot1x = 0x0004,
    FtPsk = 0x0008,
    Dot1xSha256 = 0x0010,
    PskSha256 = 0x0020,
}

impl AkmSuite {
    fn selector_type(self) -> u8 {
        match self {
            AkmSuite::Dot1x => 1,
            AkmSuite::Psk => 2,
            AkmSuite::FtDot1x => 3,
            AkmSuite::FtPsk => 4,
            AkmSuite::Dot1xSha256 => 5,
            AkmSuite::PskSha256 => 6,
        }
    }

    fn from_selector(oui: &[u8], typ: u8) -> Option<AkmSuite> {
        if oui != OUI_IEEE {
            return None;
        }
        match typ {
            1 => Some(AkmSuite::Dot1x),
            2 => Some(AkmSuite::Psk),
            3 => Some(AkmSuite::FtDot1x),
            4 => Some(AkmSuite::FtPsk),
            5 => Some(AkmSuite::Dot1xSha256),
            6 => Some(AkmSuite::PskSha256),
            _ => None,
        }
    }

    /// nl80211 AKM suite selector in host order.
    pub fn to_akm_selector(self) -> u32 {
        0x000f_ac00 | u32::from(self.selector_type())
    }

    /// True when the key hierarchy uses SHA-256 based derivation.
    pub fn uses_sha256(self) -> bool {
        matches!(
            self,
            AkmSuite::FtDot1x | AkmSuite::FtPsk | AkmSuite::Dot1xSha256 | AkmSuite::PskSha256
        )
    }

    /// True for the Fast-BSS-Transition key hierarchies.
    pub fn is_ft(self) -> bool {
        matches!(self, AkmSuite::FtDot1x | AkmSuite::FtPsk)
    }

    const CANONICAL: [AkmSuite; 6] = [
        AkmSuite::Dot1x,
        AkmSuite::Psk,
        AkmSuite::FtDot1x,
        AkmSuite::FtPsk,
        AkmSuite::Dot1xSha256,
        AkmSuite::PskSha256,
    ];
}

/// RSN Capabilities field, kept raw so unknown bits survive a round trip.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RsnCapabilities(pub u16);

impl RsnCapabilities {
    pub fn preauth(self) -> bool {
        self.0 & 0x0001 != 0
    }

    pub fn mfp_required(self) -> bool {
        self.0 & 0x0040 != 0
    }

    pub fn mfp_capable(self) -> bool {
        self.0 & 0x0080 != 0
    }

    pub fn spp_a_msdu_capable(self) -> bool {
        self.0 & 0x0400 != 0
    }

    pub fn spp_a_msdu_required(self) -> bool {
        self.0 & 0x0800 != 0
    }

    pub fn set_mfp_capable(&mut self, v: bool) {
        if v {
            self.0 |= 0x0080;
        } else {
            self.0 &= !0x0080;
        }
    }

    pub fn set_mfp_required(&mut self, v: bool) {
        if v {
            self.0 |= 0x0040;
        } else {
            self.0 &= !0x0040;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rsne {
    pub group_cipher: Option<CipherSuite>,
    /// `CipherSuite` bitmap.
    pub pairwise_ciphers: u16,
    /// `AkmSuite` bitmap.
    pub akm_suites: u16,
    pub caps: RsnCapabilities,
    pub pmkids: Vec<[u8; 16]>,
    pub group_management_cipher: Option<CipherSuite>,
}

impl Rsne {
    /// WPA2-Personal element: CCMP pairwise and group, PSK key management.
    pub fn wpa2_psk() -> Rsne {
        Rsne {
            group_cipher: Some(CipherSuite::Ccmp),
            pairwise_ciphers: CipherSuite::Ccmp as u16,
            akm_suites: AkmSuite::Psk as u16,
            ..Rsne::default()
        }
    }

    /// Parses a full element (tag and length octets included).
    pub fn parse(element: &[u8]) -> Result<Rsne> {
        if element.len() < 2 || element[0] != eid::RSN {
            return Err(IeError::malformed("RSNE", "not an RSN element"));
        }
        let len = element[1] as usize;
        if element.len() != len + 2 {
            return Err(IeError::Truncated { need: len + 2, have: element.len() });
        }
        Self::parse_body(&element[2..])
    }

    /// Parses the element body after the tag and length octets.
    pub fn parse_body(body: &[u8]) -> Result<Rsne> {
        let mut r = Reader::new(body);

        let version = r.le16("RSNE")?;
        if version != 1 {
            return Err(IeError::UnsupportedVersion { what: "RSNE", version });
        }

        let mut rsne = Rsne::default();

        // Every field from the group cipher on may be omitted, but only
        // from the tail: a field is present whenever bytes remain.
        if r.done() {
            return Ok(rsne);
        }
        let (oui, typ) = r.suite("RSNE")?;
        rsne.group_cipher = Some(
            CipherSuite::from_selector(oui, typ)
                .ok_or(IeError::malformed("RSNE", "unknown group cipher suite"))?,
        );

        if r.done() {
            return Ok(rsne);
        }
        let count = r.le16("RSNE")?;
        for _ in 0..count {
            let (oui, typ) = r.suite("RSNE")?;
            // Unrecognized pairwise suites are ignored, not fatal.
            if let Some(c) = CipherSuite::from_selector(oui, typ) {
                rsne.pairwise_ciphers |= c as u16;
            }
        }

        if r.done() {
            return Ok(rsne);
        }
        let count = r.le16("RSNE")?;
        for _ in 0..count {
            let (oui, typ) = r.suite("RSNE")?;
            if let Some(a) = AkmSuite::from_selector(oui, typ) {
                rsne.akm_suites |= a as u16;
            }
        }

        if r.done() {
            return Ok(rsne);
        }
        rsne.caps = RsnCapabilities(r.le16("RSNE")?);

        if r.done() {
            return Ok(rsne);
        }
        let count = r.le16("RSNE")?;
        for _ in 0..count {
            let bytes = r.take(16, "RSNE")?;
            let mut pmkid = [0u8; 16];
            pmkid.copy_from_slice(bytes);
            rsne.pmkids.push(pmkid);
        }

        if r.done() {
            return Ok(rsne);
        }
        let (oui, typ) = r.suite("RSNE")?;
        rsne.group_management_cipher = Some(
            CipherSuite::from_selector(oui, typ)
                .ok_or(IeError::malformed("RSNE", "unknown group management cipher"))?,
        );

        if !r.done() {
            return Err(IeError::malformed("RSNE", "trailing bytes"));
        }

        Ok(rsne)
    }

    /// Builds the full element. Output is canonical: suites are emitted in
    /// a fixed order and trailing all-default fields are omitted, so two
    /// semantically equal elements encode identically.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![eid::RSN, 0, 0x01, 0x00];

        let group = self.group_cipher.unwrap_or(CipherSuite::Ccmp);
        push_suite(&mut out, group.selector_type());

        let pairwise: Vec<_> = CipherSuite::CANONICAL
            .iter()
            .copied()
            .filter(|c| self.pairwise_ciphers & (*c as u16) != 0)
            .collect();
        out.extend_from_slice(&(pairwise.len() as u16).to_le_bytes());
        for c in pairwise {
            push_suite(&mut out, c.selector_type());
        }

        let akms: Vec<_> = AkmSuite::CANONICAL
            .iter()
            .copied()
            .filter(|a| self.akm_suites & (*a as u16) != 0)
            .collect();
        out.extend_from_slice(&(akms.len() as u16).to_le_bytes());
        for a in akms {
            push_suite(&mut out, a.selector_type());
        }

        let need_pmkids = !self.pmkids.is_empty() || self.group_management_cipher.is_some();
        if self.caps.0 != 0 || need_pmkids {
            out.extend_from_slice(&self.caps.0.to_le_bytes());
        }

        if need_pmkids {
            out.extend_from_slice(&(self.pmkids.len() as u16).to_le_bytes());
            for pmkid in &self.pmkids {
                out.extend_from_slice(pmkid);
            }
        }

        if let Some(gmc) = self.group_management_cipher {
            push_suite(&mut out, gmc.selector_type());
        }

        out[1] = (out.len() - 2) as u8;
        out
    }

    /// Number of pairwise cipher suites advertised.
    pub fn pairwise_count(&self) -> u32 {
        self.pairwise_ciphers.count_ones()
    }

    /// The single advertised pairwise cipher, when there is exactly one.
    pub fn single_pairwise(&self) -> Option<CipherSuite> {
        if self.pairwise_count() != 1 {
            return None;
        }
        CipherSuite::CANONICAL.iter().copied().find(|c| self.pairwise_ciphers & (*c as u16) != 0)
    }

    /// The single advertised AKM suite, when there is exactly one.
    pub fn single_akm(&self) -> Option<AkmSuite> {
        if self.akm_suites.count_ones() != 1 {
            return None;
        }
        AkmSuite::CANONICAL.iter().copied().find(|a| self.akm_suites & (*a as u16) != 0)
    }
}

fn push_suite(out: &mut Vec<u8>, typ: u8) {
    out.extend_from_slice(&OUI_IEEE);
    out.push(typ);
}

/// Compares two RSN elements semantically. With `ignore_pmkids`, the PMKID
/// lists may differ; all other fields must match. Both arguments are full
/// elements with tag and length octets.
pub fn ap_ie_matches(a: &[u8], b: &[u8], ignore_pmkids: bool) -> bool {
    let (Ok(mut ia), Ok(mut ib)) = (Rsne::parse(a), Rsne::parse(b)) else {
        return false;
    };

    if ignore_pmkids {
        ia.pmkids.clear();
        ib.pmkids.clear();
    }

    ia == ib
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn done(&self) -> bool {
        self.pos == self.buf.len()
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8]> {
        if self.buf.len() - self.pos < n {
            return Err(IeError::malformed(what, "field truncated"));
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn le16(&mut self, what: &'static str) -> Result<u16> {
        let b = self.take(2, what)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn suite(&mut self, what: &'static str) -> Result<(&'a [u8], u8)> {
        let b = self.take(4, what)?;
        Ok((&b[..3], b[3]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WPA2_PSK_CCMP: [u8; 22] = [
        0x30, 0x14, 0x01, 0x00, 0x00, 0x0f, 0xac, 0x04, 0x01, 0x00, 0x00, 0x0f, 0xac, 0x04, 0x01,
        0x00, 0x00, 0x0f, 0xac, 0x02, 0x00, 0x00,
    ];

    #[test]
    fn parse_wpa2_psk() {
        let rsne = Rsne::parse(&WPA2_PSK_CCMP).unwrap();
        assert_eq!(rsne.group_cipher, Some(CipherSuite::Ccmp));
        assert_eq!(rsne.pairwise_ciphers, CipherSuite::Ccmp as u16);
        assert_eq!(rsne.akm_suites, AkmSuite::Psk as u16);
        assert_eq!(rsne.caps.0, 0);
        assert!(rsne.pmkids.is_empty());
    }

    #[test]
    fn round_trip_is_byte_identical() {
        let rsne = Rsne::parse(&WPA2_PSK_CCMP).unwrap();
        assert_eq!(rsne.to_bytes(), &WPA2_PSK_CCMP[..]);
    }

    #[test]
    fn truncated_element_rejected() {
        let mut bad = WPA2_PSK_CCMP.to_vec();
        bad.truncate(10);
        bad[1] = 8;
        // pairwise count says one suite but the bytes are missing
        assert!(Rsne::parse(&bad).is_err());
    }

    #[test]
    fn overlong_count_rejected() {
        let mut bad = WPA2_PSK_CCMP.to_vec();
        bad[8] = 0xff; // pairwise suite count
        assert!(Rsne::parse(&bad).is_err());
    }

    #[test]
    fn pmkid_list_round_trip() {
        let mut rsne = Rsne::wpa2_psk();
        rsne.pmkids.push([0xab; 16]);
        let bytes = rsne.to_bytes();
        let back = Rsne::parse(&bytes).unwrap();
        assert_eq!(back.pmkids, vec![[0xab; 16]]);
        assert_eq!(back, rsne);
    }

    #[test]
    fn matches_tolerates_pmkids_only_when_asked() {
        let plain = Rsne::wpa2_psk();
        let mut with_pmkid = Rsne::wpa2_psk();
        with_pmkid.pmkids.push([0x11; 16]);

        let a = plain.to_bytes();
        let b = with_pmkid.to_bytes();
        assert!(ap_ie_matches(&a, &b, true));
        assert!(!ap_ie_matches(&a, &b, false));
    }

    #[test]
    fn matches_rejects_cipher_change() {
        let a = Rsne::wpa2_psk().to_bytes();
        let mut tkip = Rsne::wpa2_psk();
        tkip.pairwise_ciphers = CipherSuite::Tkip as u16;
        let b = tkip.to_bytes();
        assert!(!ap_ie_matches(&a, &b, true));
    }

    #[test]
    fn short_element_without_optional_fields() {
        // Version + group cipher only.
        let bytes = [0x30, 0x06, 0x01, 0x00, 0x00, 0x0f, 0xac, 0x04];
        let rsne = Rsne::parse(&bytes).unwrap();
        assert_eq!(rsne.group_cipher, Some(CipherSuite::Ccmp));
        assert_eq!(rsne.pairwise_ciphers, 0);
    }

    #[test]
    fn mfp_capability_bits() {
        let mut caps = RsnCapabilities::default();
        caps.set_mfp_capable(true);
        caps.set_mfp_required(true);
        assert!(caps.mfp_capable());
        assert!(caps.mfp_required());
        assert_eq!(caps.0, 0x00c0);
    }
}
