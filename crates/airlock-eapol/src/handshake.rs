//! The key ladder for one (supplicant, authenticator) pair.
//!
//! A `Handshake` is owned by a connection (STA side) or a station record
//! (AP side). It holds the negotiated suites, both peers' IE blobs in
//! their original framing, the PMK, nonces and derived keys. Once
//! `install_ptk` succeeds the ladder is frozen: state-changing operations
//! fail, which is what makes retransmit handling idempotent.
//!
//! Freeing the ladder always erases key material. Drop handles the common
//! path; error paths that keep the struct alive call `secure_erase`
//! directly.

use airlock_crypto::ft::{derive_ft_keys, derive_ft_ptk, FtKeys};
use airlock_crypto::ptk::{derive_ptk, KeyDerivation};
use airlock_crypto::{nonce, MicAlgorithm, Ptk};
use airlock_ie::{AkmSuite, CipherSuite, Fte, Mde, Rsne};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::frame::key_info;
use crate::{EapolError, Result};

/// Addressing and identity for a new handshake.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Supplicant (station) address.
    pub spa: [u8; 6],
    /// Authenticator (BSS) address.
    pub aa: [u8; 6],
    pub ssid: Vec<u8>,
}

/// A group key as accepted from the wire, pending or completed kernel
/// installation.
#[derive(Debug, Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct GroupKey {
    pub index: u8,
    pub key: Vec<u8>,
    pub rsc: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct IntegrityGroupKey {
    pub index: u16,
    pub key: Vec<u8>,
    pub ipn: [u8; 6],
}

pub struct Handshake {
    spa: [u8; 6],
    aa: [u8; 6],
    ssid: Vec<u8>,

    own_ie: Option<Vec<u8>>,
    ap_ie: Option<Vec<u8>>,
    mde: Option<Vec<u8>>,
    fte: Option<Vec<u8>>,
    r0kh_id: Option<Vec<u8>>,
    r1kh_id: Option<[u8; 6]>,

    akm: Option<AkmSuite>,
    pairwise: Option<CipherSuite>,
    group: Option<CipherSuite>,
    mfp: bool,

    pmk: Option<Zeroizing<[u8; 32]>>,
    ft: Option<FtKeys>,

    anonce: [u8; 32],
    snonce: [u8; 32],
    have_anonce: bool,
    have_snonce: bool,

    ptk: Option<Ptk>,
    ptk_complete: bool,

    gtk: Option<GroupKey>,
    igtk: Option<IntegrityGroupKey>,
}

impl Handshake {
    pub fn new(config: HandshakeConfig) -> Handshake {
        Handshake {
            spa: config.spa,
            aa: config.aa,
            ssid: config.ssid,
            own_ie: None,
            ap_ie: None,
            mde: None,
            fte: None,
            r0kh_id: None,
            r1kh_id: None,
            akm: None,
            pairwise: None,
            group: None,
            mfp: false,
            pmk: None,
            ft: None,
            anonce: [0; 32],
            snonce: [0; 32],
            have_anonce: false,
            have_snonce: false,
            ptk: None,
            ptk_complete: false,
            gtk: None,
            igtk: None,
        }
    }

    fn check_mutable(&self) -> Result<()> {
        if self.ptk_complete {
            return Err(EapolError::Frozen);
        }
        Ok(())
    }

    pub fn spa(&self) -> [u8; 6] {
        self.spa
    }

    pub fn aa(&self) -> [u8; 6] {
        self.aa
    }

    pub fn ssid(&self) -> &[u8] {
        &self.ssid
    }

    pub fn set_pmk(&mut self, pmk: [u8; 32]) -> Result<()> {
        self.check_mutable()?;
        self.pmk = Some(Zeroizing::new(pmk));
        Ok(())
    }

    pub fn pmk_set(&self) -> bool {
        self.pmk.is_some()
    }

    pub fn pmk(&self) -> Option<&[u8; 32]> {
        self.pmk.as_deref()
    }

    /// Records our RSNE (the one that goes into the association request)
    /// and negotiates suites from it. The element must advertise exactly
    /// one pairwise cipher and one AKM.
    pub fn set_own_ie(&mut self, element: &[u8]) -> Result<()> {
        self.check_mutable()?;
        let rsne = Rsne::parse(element)?;
        let pairwise = rsne
            .single_pairwise()
            .ok_or(EapolError::Incomplete("a single pairwise cipher"))?;
        let akm = rsne.single_akm().ok_or(EapolError::Incomplete("a single AKM"))?;

        self.pairwise = Some(pairwise);
        self.group = rsne.group_cipher;
        self.akm = Some(akm);
        self.mfp = rsne.caps.mfp_capable();
        self.own_ie = Some(element.to_vec());
        Ok(())
    }

    /// Records the BSS-advertised RSNE from beacon or probe response.
    pub fn set_ap_ie(&mut self, element: &[u8]) -> Result<()> {
        self.check_mutable()?;
        Rsne::parse(element)?;
        self.ap_ie = Some(element.to_vec());
        Ok(())
    }

    /// Records the advertised MDE verbatim; FT requires the exact bytes
    /// to be echoed in later frames.
    pub fn set_mde(&mut self, element: &[u8]) -> Result<()> {
        self.check_mutable()?;
        Mde::parse(element)?;
        self.mde = Some(element.to_vec());
        Ok(())
    }

    pub fn set_fte(&mut self, element: &[u8]) -> Result<()> {
        self.check_mutable()?;
        Fte::parse(element)?;
        self.fte = Some(element.to_vec());
        Ok(())
    }

    pub fn set_kh_ids(&mut self, r0kh_id: &[u8], r1kh_id: [u8; 6]) -> Result<()> {
        self.check_mutable()?;
        self.r0kh_id = Some(r0kh_id.to_vec());
        self.r1kh_id = Some(r1kh_id);
        Ok(())
    }

    pub fn own_ie(&self) -> Option<&[u8]> {
        self.own_ie.as_deref()
    }

    pub fn ap_ie(&self) -> Option<&[u8]> {
        self.ap_ie.as_deref()
    }

    pub fn mde(&self) -> Option<&[u8]> {
        self.mde.as_deref()
    }

    pub fn fte(&self) -> Option<&[u8]> {
        self.fte.as_deref()
    }

    pub fn r0kh_id(&self) -> Option<&[u8]> {
        self.r0kh_id.as_deref()
    }

    pub fn r1kh_id(&self) -> Option<[u8; 6]> {
        self.r1kh_id
    }

    pub fn akm(&self) -> Option<AkmSuite> {
        self.akm
    }

    pub fn pairwise_cipher(&self) -> Option<CipherSuite> {
        self.pairwise
    }

    pub fn group_cipher(&self) -> Option<CipherSuite> {
        self.group
    }

    pub fn mfp(&self) -> bool {
        self.mfp
    }

    pub fn anonce(&self) -> Option<&[u8; 32]> {
        self.have_anonce.then_some(&self.anonce)
    }

    pub fn snonce(&self) -> Option<&[u8; 32]> {
        self.have_snonce.then_some(&self.snonce)
    }

    /// Generates a fresh SNonce. Reused for the lifetime of one handshake
    /// attempt so retransmit answers stay idempotent.
    pub fn new_snonce(&mut self) -> Result<()> {
        self.check_mutable()?;
        self.snonce = nonce::new_nonce();
        self.have_snonce = true;
        Ok(())
    }

    pub fn new_anonce(&mut self) -> Result<()> {
        self.check_mutable()?;
        self.anonce = nonce::new_nonce();
        self.have_anonce = true;
        Ok(())
    }

    pub fn set_anonce(&mut self, anonce: [u8; 32]) -> Result<()> {
        self.check_mutable()?;
        self.anonce = anonce;
        self.have_anonce = true;
        Ok(())
    }

    pub fn set_snonce(&mut self, snonce: [u8; 32]) -> Result<()> {
        self.check_mutable()?;
        self.snonce = snonce;
        self.have_snonce = true;
        Ok(())
    }

    /// The MIC algorithm the negotiated AKM prescribes.
    pub fn mic_algorithm(&self) -> Result<MicAlgorithm> {
        let akm = self.akm.ok_or(EapolError::Incomplete("a negotiated AKM"))?;
        Ok(if akm.uses_sha256() { MicAlgorithm::AesCmac128 } else { MicAlgorithm::HmacSha1_128 })
    }

    /// The EAPoL-Key descriptor version for the negotiated AKM.
    pub fn descriptor_version(&self) -> Result<u16> {
        let akm = self.akm.ok_or(EapolError::Incomplete("a negotiated AKM"))?;
        Ok(if akm.uses_sha256() {
            key_info::VERSION_AES_128_CMAC_AES
        } else {
            key_info::VERSION_HMAC_SHA1_AES
        })
    }

    /// Derives the level-one FT keys. Requires PMK, MDE and key-holder
    /// identities; called before an FT initial association completes and
    /// again when validating a transition target.
    pub fn derive_ft_keys(&mut self) -> Result<()> {
        self.check_mutable()?;
        let pmk = self.pmk.as_ref().ok_or(EapolError::Incomplete("PMK"))?;
        let mde_raw = self.mde.as_ref().ok_or(EapolError::Incomplete("MDE"))?;
        let mde = Mde::parse(mde_raw)?;
        let r0kh = self.r0kh_id.as_ref().ok_or(EapolError::Incomplete("R0KH-ID"))?;
        let r1kh = self.r1kh_id.ok_or(EapolError::Incomplete("R1KH-ID"))?;

        self.ft = Some(derive_ft_keys(
            pmk,
            &self.ssid,
            mde.mdid.to_le_bytes(),
            r0kh,
            &r1kh,
            &self.spa,
        )?);
        Ok(())
    }

    pub fn pmk_r0_name(&self) -> Option<&[u8; 16]> {
        self.ft.as_ref().map(|ft| &ft.pmk_r0_name)
    }

    pub fn pmk_r1_name(&self) -> Option<&[u8; 16]> {
        self.ft.as_ref().map(|ft| &ft.pmk_r1_name)
    }

    /// Derives the PTK from the recorded nonces. For FT AKMs this uses
    /// the FT-PTK derivation over PMK-R1; otherwise the pairwise key
    /// expansion over the PMK.
    pub fn derive_ptk(&mut self) -> Result<()> {
        self.check_mutable()?;
        if !(self.have_anonce && self.have_snonce) {
            return Err(EapolError::Incomplete("both nonces"));
        }
        let akm = self.akm.ok_or(EapolError::Incomplete("a negotiated AKM"))?;
        let pairwise = self.pairwise.ok_or(EapolError::Incomplete("a pairwise cipher"))?;
        let tk_len = pairwise.key_len();

        let ptk = if akm.is_ft() {
            let ft = self.ft.as_ref().ok_or(EapolError::Incomplete("FT keys"))?;
            derive_ft_ptk(&ft.pmk_r1, &self.aa, &self.spa, &self.anonce, &self.snonce, tk_len)
        } else {
            let pmk = self.pmk.as_ref().ok_or(EapolError::Incomplete("PMK"))?;
            let derivation =
                if akm.uses_sha256() { KeyDerivation::Sha256 } else { KeyDerivation::Sha1 };
            derive_ptk(
                derivation,
                pmk.as_ref(),
                &self.aa,
                &self.spa,
                &self.anonce,
                &self.snonce,
                tk_len,
            )
        };

        self.ptk = Some(ptk);
        Ok(())
    }

    pub fn ptk(&self) -> Option<&Ptk> {
        self.ptk.as_ref()
    }

    pub fn ptk_complete(&self) -> bool {
        self.ptk_complete
    }

    /// Marks the PTK as installed and freezes the ladder.
    pub fn install_ptk(&mut self) -> Result<()> {
        self.check_mutable()?;
        if self.ptk.is_none() {
            return Err(EapolError::Incomplete("a derived PTK"));
        }
        self.ptk_complete = true;
        Ok(())
    }

    pub fn install_gtk(&mut self, index: u8, key: &[u8], rsc: u64) {
        self.gtk = Some(GroupKey { index, key: key.to_vec(), rsc });
    }

    pub fn install_igtk(&mut self, index: u16, key: &[u8], ipn: [u8; 6]) {
        self.igtk = Some(IntegrityGroupKey { index, key: key.to_vec(), ipn });
    }

    pub fn gtk(&self) -> Option<&GroupKey> {
        self.gtk.as_ref()
    }

    pub fn igtk(&self) -> Option<&IntegrityGroupKey> {
        self.igtk.as_ref()
    }

    /// Overwrites every piece of key material. Idempotent; also invoked
    /// by Drop.
    pub fn secure_erase(&mut self) {
        self.pmk = None;
        self.ft = None;
        self.ptk = None;
        self.gtk = None;
        self.igtk = None;
        self.anonce.zeroize();
        self.snonce.zeroize();
        self.have_anonce = false;
        self.have_snonce = false;
    }
}

impl Drop for Handshake {
    fn drop(&mut self) {
        self.secure_erase();
    }
}

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshake")
            .field("spa", &self.spa)
            .field("aa", &self.aa)
            .field("akm", &self.akm)
            .field("pairwise", &self.pairwise)
            .field("pmk_set", &self.pmk.is_some())
            .field("ptk_complete", &self.ptk_complete)
            .finish()
    }
}
