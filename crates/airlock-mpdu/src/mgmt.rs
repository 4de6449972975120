//! Subtype-specific management frame bodies.

use crate::{MgmtHdr, MgmtSubtype, MpduError, Result};

fn le16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn need(buf: &[u8], n: usize) -> Result<()> {
    if buf.len() < n {
        return Err(MpduError::Truncated { need: n, have: buf.len() });
    }
    Ok(())
}

/// Authentication frame body: algorithm, transaction sequence, status,
/// then the element section (used by FT).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthBody {
    pub algorithm: u16,
    pub transaction: u16,
    pub status: u16,
    pub ies: Vec<u8>,
}

impl AuthBody {
    pub fn parse(body: &[u8]) -> Result<AuthBody> {
        need(body, 6)?;
        Ok(AuthBody {
            algorithm: le16(body, 0),
            transaction: le16(body, 2),
            status: le16(body, 4),
            ies: body[6..].to_vec(),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(6 + self.ies.len());
        out.extend_from_slice(&self.algorithm.to_le_bytes());
        out.extend_from_slice(&self.transaction.to_le_bytes());
        out.extend_from_slice(&self.status.to_le_bytes());
        out.extend_from_slice(&self.ies);
        out
    }
}

/// (Re)Association request body. `current_ap` is set on reassociation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssocReqBody {
    pub capability: u16,
    pub listen_interval: u16,
    pub ies: Vec<u8>,
}

impl AssocReqBody {
    pub fn parse(body: &[u8]) -> Result<AssocReqBody> {
        need(body, 4)?;
        Ok(AssocReqBody {
            capability: le16(body, 0),
            listen_interval: le16(body, 2),
            ies: body[4..].to_vec(),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.ies.len());
        out.extend_from_slice(&self.capability.to_le_bytes());
        out.extend_from_slice(&self.listen_interval.to_le_bytes());
        out.extend_from_slice(&self.ies);
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReassocReqBody {
    pub capability: u16,
    pub listen_interval: u16,
    pub current_ap: [u8; 6],
    pub ies: Vec<u8>,
}

impl ReassocReqBody {
    pub fn parse(body: &[u8]) -> Result<ReassocReqBody> {
        need(body, 10)?;
        let mut current_ap = [0u8; 6];
        current_ap.copy_from_slice(&body[4..10]);
        Ok(ReassocReqBody {
            capability: le16(body, 0),
            listen_interval: le16(body, 2),
            current_ap,
            ies: body[10..].to_vec(),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(10 + self.ies.len());
        out.extend_from_slice(&self.capability.to_le_bytes());
        out.extend_from_slice(&self.listen_interval.to_le_bytes());
        out.extend_from_slice(&self.current_ap);
        out.extend_from_slice(&self.ies);
        out
    }
}

/// (Re)Association response body. The two high bits of the AID field are
/// set on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssocRespBody {
    pub capability: u16,
    pub status: u16,
    pub aid: u16,
    pub ies: Vec<u8>,
}

impl AssocRespBody {
    pub fn parse(body: &[u8]) -> Result<AssocRespBody> {
        need(body, 6)?;
        Ok(AssocRespBody {
            capability: le16(body, 0),
            status: le16(body, 2),
            aid: le16(body, 4) & 0x3fff,
            ies: body[6..].to_vec(),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(6 + self.ies.len());
        out.extend_from_slice(&self.capability.to_le_bytes());
        out.extend_from_slice(&self.status.to_le_bytes());
        out.extend_from_slice(&(self.aid | 0xc000).to_le_bytes());
        out.extend_from_slice(&self.ies);
        out
    }
}

/// Beacon and probe-response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeaconBody {
    pub timestamp: u64,
    pub beacon_interval: u16,
    pub capability: u16,
    pub ies: Vec<u8>,
}

impl BeaconBody {
    pub fn parse(body: &[u8]) -> Result<BeaconBody> {
        need(body, 12)?;
        Ok(BeaconBody {
            timestamp: u64::from_le_bytes(body[0..8].try_into().unwrap()),
            beacon_interval: le16(body, 8),
            capability: le16(body, 10),
            ies: body[12..].to_vec(),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(12 + self.ies.len());
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.extend_from_slice(&self.beacon_interval.to_le_bytes());
        out.extend_from_slice(&self.capability.to_le_bytes());
        out.extend_from_slice(&self.ies);
        out
    }
}

/// Deauthentication and disassociation body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeauthBody {
    pub reason: u16,
}

impl DeauthBody {
    pub fn parse(body: &[u8]) -> Result<DeauthBody> {
        need(body, 2)?;
        Ok(DeauthBody { reason: le16(body, 0) })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.reason.to_le_bytes().to_vec()
    }
}

/// A parsed management frame body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MgmtBody {
    Authentication(AuthBody),
    AssociationRequest(AssocReqBody),
    ReassociationRequest(ReassocReqBody),
    AssociationResponse(AssocRespBody),
    ReassociationResponse(AssocRespBody),
    Beacon(BeaconBody),
    ProbeResponse(BeaconBody),
    ProbeRequest { ies: Vec<u8> },
    Disassociation(DeauthBody),
    Deauthentication(DeauthBody),
    Action { data: Vec<u8> },
}

impl MgmtBody {
    pub fn parse(subtype: MgmtSubtype, body: &[u8]) -> Result<MgmtBody> {
        Ok(match subtype {
            MgmtSubtype::Authentication => MgmtBody::Authentication(AuthBody::parse(body)?),
            MgmtSubtype::AssociationRequest => {
                MgmtBody::AssociationRequest(AssocReqBody::parse(body)?)
            }
            MgmtSubtype::ReassociationRequest => {
                MgmtBody::ReassociationRequest(ReassocReqBody::parse(body)?)
            }
            MgmtSubtype::AssociationResponse => {
                MgmtBody::AssociationResponse(AssocRespBody::parse(body)?)
            }
            MgmtSubtype::ReassociationResponse => {
                MgmtBody::ReassociationResponse(AssocRespBody::parse(body)?)
            }
            MgmtSubtype::Beacon => MgmtBody::Beacon(BeaconBody::parse(body)?),
            MgmtSubtype::ProbeResponse => MgmtBody::ProbeResponse(BeaconBody::parse(body)?),
            MgmtSubtype::ProbeRequest => MgmtBody::ProbeRequest { ies: body.to_vec() },
            MgmtSubtype::Disassociation => MgmtBody::Disassociation(DeauthBody::parse(body)?),
            MgmtSubtype::Deauthentication => MgmtBody::Deauthentication(DeauthBody::parse(body)?),
            MgmtSubtype::Action => MgmtBody::Action { data: body.to_vec() },
        })
    }
}

/// Builds a complete management frame from header fields and a body.
pub fn build_frame(
    subtype: MgmtSubtype,
    da: [u8; 6],
    sa: [u8; 6],
    bssid: [u8; 6],
    body: &[u8],
) -> Vec<u8> {
    let mut out = MgmtHdr::new(subtype, da, sa, bssid).to_bytes();
    out.extend_from_slice(body);
    out
}
