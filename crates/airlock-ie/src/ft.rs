//! Mobility Domain and Fast BSS Transition elements, IEEE 802.11-2016,
//! 9.4.2.47 and 9.4.2.48.

use crate::{eid, IeError, Result};

/// Mobility Domain element. The body is always three octets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mde {
    pub mdid: u16,
    /// FT Capability and Policy field: bit 0 = FT over the DS,
    /// bit 1 = resource request protocol capability.
    pub ft_capabilities: u8,
}

impl Mde {
    pub fn parse(element: &[u8]) -> Result<Mde> {
        if element.len() != 5 || element[0] != eid::MOBILITY_DOMAIN || element[1] != 3 {
            return Err(IeError::malformed("MDE", "body must be 3 octets"));
        }
        Ok(Mde {
            mdid: u16::from_le_bytes([element[2], element[3]]),
            ft_capabilities: element[4],
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mdid = self.mdid.to_le_bytes();
        vec![eid::MOBILITY_DOMAIN, 3, mdid[0], mdid[1], self.ft_capabilities]
    }
}

/// GTK sub-element of the FTE.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FteGtk {
    pub key_id: u8,
    pub key_len: u8,
    pub rsc: [u8; 8],
    /// AES-wrapped key material.
    pub wrapped_key: Vec<u8>,
}

/// IGTK sub-element of the FTE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FteIgtk {
    pub key_id: u16,
    pub ipn: [u8; 6],
    pub key_len: u8,
    pub wrapped_key: Vec<u8>,
}

/// Fast BSS Transition element.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fte {
    /// Element Count octet of the MIC Control field.
    pub mic_element_count: u8,
    pub mic: [u8; 16],
    pub anonce: [u8; 32],
    pub snonce: [u8; 32],
    pub r1kh_id: Option<[u8; 6]>,
    /// 1..=48 octets.
    pub r0kh_id: Option<Vec<u8>>,
    pub gtk: Option<FteGtk>,
    pub igtk: Option<FteIgtk>,
}

const SUBELEM_R1KH_ID: u8 = 1;
const SUBELEM_GTK: u8 = 2;
const SUBELEM_R0KH_ID: u8 = 3;
const SUBELEM_IGTK: u8 = 4;

impl Fte {
    pub fn parse(element: &[u8]) -> Result<Fte> {
        if element.len() < 2 || element[0] != eid::FAST_BSS_TRANSITION {
            return Err(IeError::malformed("FTE", "not an FT element"));
        }
        let len = element[1] as usize;
        if element.len() != len + 2 {
            return Err(IeError::Truncated { need: len + 2, have: element.len() });
        }
        let body = &element[2..];
        if body.len() < 2 + 16 + 32 + 32 {
            return Err(IeError::malformed("FTE", "fixed fields truncated"));
        }

        let mut fte = Fte { mic_element_count: body[1], ..Fte::default() };
        fte.mic.copy_from_slice(&body[2..18]);
        fte.anonce.copy_from_slice(&body[18..50]);
        fte.snonce.copy_from_slice(&body[50..82]);

        let mut rest = &body[82..];
        while !rest.is_empty() {
            if rest.len() < 2 {
                return Err(IeError::malformed("FTE", "sub-element truncated"));
            }
            let (id, sublen) = (rest[0], rest[1] as usize);
            if rest.len() < 2 + sublen {
                return Err(IeError::malformed("FTE", "sub-element overruns element"));
            }
            let data = &rest[2..2 + sublen];
            rest = &rest[2 + sublen..];

            match id {
                SUBELEM_R1KH_ID => {
                    if sublen != 6 {
                        return Err(IeError::malformed("FTE", "R1KH-ID must be 6 octets"));
                    }
                    let mut id6 = [0u8; 6];
                    id6.copy_from_slice(data);
                    fte.r1kh_id = Some(id6);
                }
                SUBELEM_R0KH_ID => {
                    if sublen == 0 || sublen > 48 {
                        return Err(IeError::malformed("FTE", "R0KH-ID must be 1..48 octets"));
                    }
                    fte.r0kh_id = Some(data.to_vec());
                }
                SUBELEM_GTK => {
                    if sublen < 11 {
                        return Err(IeError::malformed("FTE", "GTK sub-element truncated"));
                    }
                    let key_info = u16::from_le_bytes([data[0], data[1]]);
                    let mut rsc = [0u8; 8];
                    rsc.copy_from_slice(&data[3..11]);
                    fte.gtk = Some(FteGtk {
                        key_id: (key_info & 0x0003) as u8,
                        key_len: data[2],
                        rsc,
                        wrapped_key: data[11..].to_vec(),
                    });
                }
                SUBELEM_IGTK => {
                    if sublen < 9 {
                        return Err(IeError::malformed("FTE", "IGTK sub-element truncated"));
                    }
                    let mut ipn = [0u8; 6];
                    ipn.copy_from_slice(&data[2..8]);
                    fte.igtk = Some(FteIgtk {
                        key_id: u16::from_le_bytes([data[0], data[1]]),
                        ipn,
                        key_len: data[8],
                        wrapped_key: data[9..].to_vec(),
                    });
                }
                // Unknown sub-elements are skipped.
                _ => {}
            }
        }

        Ok(fte)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![eid::FAST_BSS_TRANSITION, 0];
        out.push(0); // MIC Control, reserved octet
        out.push(self.mic_element_count);
        out.extend_from_slice(&self.mic);
        out.extend_from_slice(&self.anonce);
        out.extend_from_slice(&self.snonce);

        if let Some(r1kh) = &self.r1kh_id {
            out.push(SUBELEM_R1KH_ID);
            out.push(6);
            out.extend_from_slice(r1kh);
        }

        if let Some(gtk) = &self.gtk {
            out.push(SUBELEM_GTK);
            out.push((11 + gtk.wrapped_key.len()) as u8);
            out.extend_from_slice(&u16::from(gtk.key_id).to_le_bytes());
            out.push(gtk.key_len);
            out.extend_from_slice(&gtk.rsc);
            out.extend_from_slice(&gtk.wrapped_key);
        }

        if let Some(r0kh) = &self.r0kh_id {
            out.push(SUBELEM_R0KH_ID);
            out.push(r0kh.len() as u8);
            out.extend_from_slice(r0kh);
        }

        if let Some(igtk) = &self.igtk {
            out.push(SUBELEM_IGTK);
            out.push((9 + igtk.wrapped_key.len()) as u8);
            out.extend_from_slice(&igtk.key_id.to_le_bytes());
            out.extend_from_slice(&igtk.ipn);
            out.push(igtk.key_len);
            out.extend_from_slice(&igtk.wrapped_key);
        }

        out[1] = (out.len() - 2) as u8;
        out
    }

    /// True when MIC, ANonce, SNonce and the element count are all zero,
    /// as required of the FTE in an initial mobility domain association.
    pub fn is_zeroed_initial(&self) -> bool {
        self.mic_element_count == 0
            && self.mic.iter().all(|&b| b == 0)
            && self.anonce.iter().all(|&b| b == 0)
            && self.snonce.iter().all(|&b| b == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mde_round_trip() {
        let mde = Mde { mdid: 0x1234, ft_capabilities: 0x01 };
        let bytes = mde.to_bytes();
        assert_eq!(bytes, vec![0x36, 0x03, 0x34, 0x12, 0x01]);
        assert_eq!(Mde::parse(&bytes).unwrap(), mde);
    }

    #[test]
    fn mde_wrong_length_rejected() {
        assert!(Mde::parse(&[0x36, 0x04, 0x34, 0x12, 0x01, 0x00]).is_err());
    }

    #[test]
    fn fte_round_trip_with_kh_ids() {
        let fte = Fte {
            mic_element_count: 3,
            mic: [0x5a; 16],
            anonce: [0x01; 32],
            snonce: [0x02; 32],
            r1kh_id: Some([0x10, 0x20, 0x30, 0x40, 0x50, 0x60]),
            r0kh_id: Some(b"r0kh.example".to_vec()),
            ..Fte::default()
        };
        let bytes = fte.to_bytes();
        assert_eq!(Fte::parse(&bytes).unwrap(), fte);
    }

    #[test]
    fn fte_gtk_subelement() {
        let fte = Fte {
            gtk: Some(FteGtk {
                key_id: 1,
                key_len: 16,
                rsc: [1, 2, 3, 4, 5, 6, 0, 0],
                wrapped_key: vec![0xcc; 24],
            }),
            ..Fte::default()
        };
        let parsed = Fte::parse(&fte.to_bytes()).unwrap();
        let gtk = parsed.gtk.unwrap();
        assert_eq!(gtk.key_id, 1);
        assert_eq!(gtk.wrapped_key.len(), 24);
    }

    #[test]
    fn fte_zeroed_initial_check() {
        let mut fte = Fte { r0kh_id: Some(vec![0xab]), ..Fte::default() };
        assert!(fte.is_zeroed_initial());
        fte.snonce[0] = 1;
        assert!(!fte.is_zeroed_initial());
    }

    #[test]
    fn fte_subelement_overrun_rejected() {
        let mut bytes = Fte::default().to_bytes();
        bytes.push(SUBELEM_R1KH_ID);
        bytes.push(0x20); // claims 32 octets, none follow
        let total = bytes.len() - 2;
        bytes[1] = total as u8;
        assert!(Fte::parse(&bytes).is_err());
    }
}
