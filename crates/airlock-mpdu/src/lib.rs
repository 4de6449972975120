//! Builders and parsers for 802.11 management MPDUs.
//!
//! Frames are built with protocol version 0, duration 0 and a zeroed
//! sequence number; the driver fills in duration and sequencing on
//! transmit. Addresses follow the management-frame convention
//! address1 = DA, address2 = SA, address3 = BSSID.

use thiserror::Error;

pub mod mgmt;

pub use mgmt::{
    AssocReqBody, AssocRespBody, AuthBody, BeaconBody, DeauthBody, MgmtBody, ReassocReqBody,
};

pub const MGMT_HDR_LEN: usize = 24;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MpduError {
    #[error("frame truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("not a management frame")]
    NotManagement,

    #[error("unknown management subtype {0}")]
    UnknownSubtype(u8),
}

pub type Result<T> = std::result::Result<T, MpduError>;

/// Management frame subtypes, IEEE 802.11-2016, Table 9-1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MgmtSubtype {
    AssociationRequest = 0,
    AssociationResponse = 1,
    ReassociationRequest = 2,
    ReassociationResponse = 3,
    ProbeRequest = 4,
    ProbeResponse = 5,
    Beacon = 8,
    Disassociation = 10,
    Authentication = 11,
    Deauthentication = 12,
    Action = 13,
}

impl MgmtSubtype {
    fn from_u8(v: u8) -> Result<MgmtSubtype> {
        Ok(match v {
            0 => MgmtSubtype::AssociationRequest,
            1 => MgmtSubtype::AssociationResponse,
            2 => MgmtSubtype::ReassociationRequest,
            3 => MgmtSubtype::ReassociationResponse,
            4 => MgmtSubtype::ProbeRequest,
            5 => MgmtSubtype::ProbeResponse,
            8 => MgmtSubtype::Beacon,
            10 => MgmtSubtype::Disassociation,
            11 => MgmtSubtype::Authentication,
            12 => MgmtSubtype::Deauthentication,
            13 => MgmtSubtype::Action,
            other => return Err(MpduError::UnknownSubtype(other)),
        })
    }

    /// Frame-control field value for this subtype: version 0, type
    /// management, no flags. Useful as a match prefix for frame
    /// registration.
    pub fn frame_control(self) -> u16 {
        u16::from(self as u8) << 4
    }
}

/// Reason codes, IEEE 802.11-2016, Table 9-45 (subset in use).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ReasonCode {
    Unspecified = 1,
    PreviousAuthInvalid = 2,
    DeauthLeaving = 3,
    DisassocApBusy = 5,
    Class2FrameFromNonauthSta = 6,
    Class3FrameFromNonassocSta = 7,
    InvalidIe = 13,
    MicFailure = 14,
    FourwayHandshakeTimeout = 15,
    GroupHandshakeTimeout = 16,
    IeDifferent = 17,
    InvalidGroupCipher = 18,
    InvalidPairwiseCipher = 19,
    InvalidAkmp = 20,
    UnsupportedRsneVersion = 21,
    InvalidRsneCapabilities = 22,
    Ieee8021xAuthFailed = 23,
}

impl ReasonCode {
    pub fn from_u16(v: u16) -> Option<ReasonCode> {
        Some(match v {
            1 => ReasonCode::Unspecified,
            2 => ReasonCode::PreviousAuthInvalid,
            3 => ReasonCode::DeauthLeaving,
            5 => ReasonCode::DisassocApBusy,
            6 => ReasonCode::Class2FrameFromNonauthSta,
            7 => ReasonCode::Class3FrameFromNonassocSta,
            13 => ReasonCode::InvalidIe,
            14 => ReasonCode::MicFailure,
            15 => ReasonCode::FourwayHandshakeTimeout,
            16 => ReasonCode::GroupHandshakeTimeout,
            17 => ReasonCode::IeDifferent,
            18 => ReasonCode::InvalidGroupCipher,
            19 => ReasonCode::InvalidPairwiseCipher,
            20 => ReasonCode::InvalidAkmp,
            21 => ReasonCode::UnsupportedRsneVersion,
            22 => ReasonCode::InvalidRsneCapabilities,
            23 => ReasonCode::Ieee8021xAuthFailed,
            _ => return None,
        })
    }
}

/// Status codes, IEEE 802.11-2016, Table 9-46 (subset in use).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum StatusCode {
    Success = 0,
    Unspecified = 1,
    UnsupportedCapabilities = 10,
    ReassocDenied = 11,
    AssocDenied = 12,
    UnsupportedAuthAlgorithm = 13,
    AuthSequenceError = 14,
    AssocDeniedRatesMismatch = 18,
    InvalidIe = 40,
    InvalidGroupCipher = 41,
    InvalidPairwiseCipher = 42,
    InvalidAkmp = 43,
    UnsupportedRsneVersion = 44,
}

/// Authentication algorithm numbers.
pub const AUTH_ALGO_OPEN: u16 = 0;
pub const AUTH_ALGO_SHARED_KEY: u16 = 1;
pub const AUTH_ALGO_FT: u16 = 2;

/// Capability Information bits advertised by an AP.
pub const CAPABILITY_ESS: u16 = 0x0001;
pub const CAPABILITY_PRIVACY: u16 = 0x0010;
pub const CAPABILITY_SHORT_PREAMBLE: u16 = 0x0020;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MgmtHdr {
    pub subtype: MgmtSubtype,
    pub addr1: [u8; 6],
    pub addr2: [u8; 6],
    pub addr3: [u8; 6],
    pub seq_ctrl: u16,
}

impl MgmtHdr {
    pub fn new(subtype: MgmtSubtype, da: [u8; 6], sa: [u8; 6], bssid: [u8; 6]) -> MgmtHdr {
        MgmtHdr { subtype, addr1: da, addr2: sa, addr3: bssid, seq_ctrl: 0 }
    }

    /// Splits a raw frame into its header and body.
    pub fn parse(frame: &[u8]) -> Result<(MgmtHdr, &[u8])> {
        if frame.len() < MGMT_HDR_LEN {
            return Err(MpduError::Truncated { need: MGMT_HDR_LEN, have: frame.len() });
        }
        let fc = u16::from_le_bytes([frame[0], frame[1]]);
        if fc & 0x0003 != 0 || fc & 0x000c != 0 {
            // protocol version must be 0 and type must be management
            return Err(MpduError::NotManagement);
        }
        let subtype = MgmtSubtype::from_u8(((fc >> 4) & 0x0f) as u8)?;

        let mut addr = [[0u8; 6]; 3];
        for (i, a) in addr.iter_mut().enumerate() {
            a.copy_from_slice(&frame[4 + i * 6..10 + i * 6]);
        }

        Ok((
            MgmtHdr {
                subtype,
                addr1: addr[0],
                addr2: addr[1],
                addr3: addr[2],
                seq_ctrl: u16::from_le_bytes([frame[22], frame[23]]),
            },
            &frame[MGMT_HDR_LEN..],
        ))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MGMT_HDR_LEN);
        out.extend_from_slice(&self.subtype.frame_control().to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes()); // duration
        out.extend_from_slice(&self.addr1);
        out.extend_from_slice(&self.addr2);
        out.extend_from_slice(&self.addr3);
        out.extend_from_slice(&0u16.to_le_bytes()); // sequence
        out
    }
}
