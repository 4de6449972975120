//! EAPoL and EAPoL-Key PDU codec, IEEE 802.1X-2010 and IEEE 802.11-2016,
//! 12.7.2. PDUs here start at the EAPoL header; the Ethernet framing is
//! the transport's concern.

use airlock_crypto::MicAlgorithm;

use crate::{EapolError, Result};

pub const ETHERTYPE_EAPOL: u16 = 0x888e;

/// 802.1X-2004; what we emit, and the ceiling we accept.
pub const PROTOCOL_VERSION_2004: u8 = 2;
pub const PROTOCOL_VERSION_2010: u8 = 3;

/// RSN key descriptor type.
pub const DESCRIPTOR_IEEE80211: u8 = 2;

const KEY_FRAME_MIN: usize = 4 + 95;
const MIC_OFFSET: usize = 4 + 77;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Eap = 0,
    Start = 1,
    Logoff = 2,
    Key = 3,
}

/// Key Information field bit accessors, IEEE 802.11-2016, Figure 12-34.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyInfo(pub u16);

impl KeyInfo {
    pub fn descriptor_version(self) -> u8 {
        (self.0 & 0x0007) as u8
    }

    pub fn pairwise(self) -> bool {
        self.0 & 0x0008 != 0
    }

    pub fn install(self) -> bool {
        self.0 & 0x0040 != 0
    }

    pub fn ack(self) -> bool {
        self.0 & 0x0080 != 0
    }

    pub fn mic(self) -> bool {
        self.0 & 0x0100 != 0
    }

    pub fn secure(self) -> bool {
        self.0 & 0x0200 != 0
    }

    pub fn error(self) -> bool {
        self.0 & 0x0400 != 0
    }

    pub fn request(self) -> bool {
        self.0 & 0x0800 != 0
    }

    pub fn encrypted_key_data(self) -> bool {
        self.0 & 0x1000 != 0
    }

    pub fn with(mut self, bits: u16) -> KeyInfo {
        self.0 |= bits;
        self
    }
}

pub mod key_info {
    /// HMAC-SHA1/AES key wrap descriptor version.
    pub const VERSION_HMAC_SHA1_AES: u16 = 2;
    /// AES-128-CMAC/AES key wrap descriptor version.
    pub const VERSION_AES_128_CMAC_AES: u16 = 3;
    pub const PAIRWISE: u16 = 0x0008;
    pub const INSTALL: u16 = 0x0040;
    pub const ACK: u16 = 0x0080;
    pub const MIC: u16 = 0x0100;
    pub const SECURE: u16 = 0x0200;
    pub const ENCRYPTED_KEY_DATA: u16 = 0x1000;
}

/// A parsed EAPoL-Key frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyFrame {
    pub version: u8,
    pub key_info: KeyInfo,
    pub key_length: u16,
    pub replay_counter: u64,
    pub key_nonce: [u8; 32],
    pub key_iv: [u8; 16],
    pub key_rsc: u64,
    pub key_mic: [u8; 16],
    pub key_data: Vec<u8>,
}

impl Default for KeyFrame {
    fn default() -> Self {
        KeyFrame {
            version: PROTOCOL_VERSION_2004,
            key_info: KeyInfo::default(),
            key_length: 0,
            replay_counter: 0,
            key_nonce: [0; 32],
            key_iv: [0; 16],
            key_rsc: 0,
            key_mic: [0; 16],
            key_data: Vec::new(),
        }
    }
}

/// Classifies a raw EAPoL PDU without fully parsing it.
pub fn packet_type(pdu: &[u8]) -> Result<PacketType> {
    if pdu.len() < 4 {
        return Err(EapolError::Truncated { need: 4, have: pdu.len() });
    }
    match pdu[1] {
        0 => Ok(PacketType::Eap),
        1 => Ok(PacketType::Start),
        2 => Ok(PacketType::Logoff),
        3 => Ok(PacketType::Key),
        _ => Err(EapolError::NotKeyDescriptor),
    }
}

impl KeyFrame {
    /// Parses an EAPoL-Key PDU with the RSN descriptor.
    pub fn parse(pdu: &[u8]) -> Result<KeyFrame> {
        if pdu.len() < KEY_FRAME_MIN {
            return Err(EapolError::Truncated { need: KEY_FRAME_MIN, have: pdu.len() });
        }
        let version = pdu[0];
        if version == 0 || version > PROTOCOL_VERSION_2010 {
            return Err(EapolError::UnsupportedVersion(version));
        }
        if pdu[1] != PacketType::Key as u8 || pdu[4] != DESCRIPTOR_IEEE80211 {
            return Err(EapolError::NotKeyDescriptor);
        }

        let body_len = u16::from_be_bytes([pdu[2], pdu[3]]) as usize;
        if body_len + 4 > pdu.len() {
            return Err(EapolError::Truncated { need: body_len + 4, have: pdu.len() });
        }

        let mut frame = KeyFrame {
            version,
            key_info: KeyInfo(u16::from_be_bytes([pdu[5], pdu[6]])),
            key_length: u16::from_be_bytes([pdu[7], pdu[8]]),
            replay_counter: u64::from_be_bytes(pdu[9..17].try_into().unwrap()),
            ..KeyFrame::default()
        };
        frame.key_nonce.copy_from_slice(&pdu[17..49]);
        frame.key_iv.copy_from_slice(&pdu[49..65]);
        frame.key_rsc = u64::from_le_bytes(pdu[65..73].try_into().unwrap());
        // 8 reserved octets, then the MIC
        frame.key_mic.copy_from_slice(&pdu[MIC_OFFSET..MIC_OFFSET + 16]);

        let data_len = u16::from_be_bytes([pdu[97], pdu[98]]) as usize;
        if 99 + data_len > pdu.len() {
            return Err(EapolError::Truncated { need: 99 + data_len, have: pdu.len() });
        }
        frame.key_data = pdu[99..99 + data_len].to_vec();

        Ok(frame)
    }

    /// Serializes the PDU with the MIC field as stored.
    pub fn to_bytes(&self) -> Vec<u8> {
        let body_len = 95 + self.key_data.len();
        let mut out = Vec::with_capacity(4 + body_len);
        out.push(self.version);
        out.push(PacketType::Key as u8);
        out.extend_from_slice(&(body_len as u16).to_be_bytes());
        out.push(DESCRIPTOR_IEEE80211);
        out.extend_from_slice(&self.key_info.0.to_be_bytes());
        out.extend_from_slice(&self.key_length.to_be_bytes());
        out.extend_from_slice(&self.replay_counter.to_be_bytes());
        out.extend_from_slice(&self.key_nonce);
        out.extend_from_slice(&self.key_iv);
        out.extend_from_slice(&self.key_rsc.to_le_bytes());
        out.extend_from_slice(&[0u8; 8]);
        out.extend_from_slice(&self.key_mic);
        out.extend_from_slice(&(self.key_data.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.key_data);
        out
    }

    /// Computes the MIC over the serialized PDU with a zeroed MIC field
    /// and stores it.
    pub fn sign(&mut self, algorithm: MicAlgorithm, kck: &[u8]) -> Result<()> {
        self.key_mic = [0; 16];
        let bytes = self.to_bytes();
        self.key_mic = algorithm.compute(kck, &bytes)?;
        Ok(())
    }

    /// Verifies the stored MIC.
    pub fn verify_mic(&self, algorithm: MicAlgorithm, kck: &[u8]) -> Result<bool> {
        let mut unsigned = self.clone();
        unsigned.key_mic = [0; 16];
        Ok(algorithm.verify(kck, &unsigned.to_bytes(), &self.key_mic)?)
    }

    pub fn nonce_is_zero(&self) -> bool {
        self.key_nonce.iter().all(|&b| b == 0)
    }
}

/// Builds an EAPoL-Start PDU.
pub fn build_start() -> Vec<u8> {
    vec![PROTOCOL_VERSION_2004, PacketType::Start as u8, 0, 0]
}
