//! Wi-Fi Simple Configuration attribute payloads.
//!
//! WSC data rides in vendor-specific elements (OUI 00-50-F2, type 4) whose
//! concatenated bodies form a sequence of attributes with big-endian
//! 16-bit type and length fields (WSC Technical Specification v2.0.5,
//! Section 12).

use crate::{eid, IeError, Result, TlvIterator};

pub const WSC_OUI: [u8; 4] = [0x00, 0x50, 0xf2, 0x04];

/// Attribute types, WSC v2.0.5 Table 28.
pub mod attr {
    pub const ASSOCIATION_STATE: u16 = 0x1002;
    pub const CONFIG_METHODS: u16 = 0x1008;
    pub const CONFIGURATION_ERROR: u16 = 0x1009;
    pub const DEVICE_NAME: u16 = 0x1011;
    pub const DEVICE_PASSWORD_ID: u16 = 0x1012;
    pub const MANUFACTURER: u16 = 0x1021;
    pub const MODEL_NAME: u16 = 0x1023;
    pub const MODEL_NUMBER: u16 = 0x1024;
    pub const REQUEST_TYPE: u16 = 0x103a;
    pub const RESPONSE_TYPE: u16 = 0x103b;
    pub const RF_BANDS: u16 = 0x103c;
    pub const SELECTED_REGISTRAR: u16 = 0x1041;
    pub const SERIAL_NUMBER: u16 = 0x1042;
    pub const SIMPLE_CONFIG_STATE: u16 = 0x1044;
    pub const UUID_E: u16 = 0x1047;
    pub const VENDOR_EXTENSION: u16 = 0x1049;
    pub const VERSION: u16 = 0x104a;
    pub const PRIMARY_DEVICE_TYPE: u16 = 0x1054;
    pub const SELECTED_REGISTRAR_CONFIG_METHODS: u16 = 0x1053;
}

/// Config Methods bits.
pub const CONFIG_METHOD_PUSH_BUTTON: u16 = 0x0080;
pub const CONFIG_METHOD_VIRTUAL_PUSH_BUTTON: u16 = 0x0280;
pub const CONFIG_METHOD_PHYSICAL_PUSH_BUTTON: u16 = 0x0480;

/// Device Password ID values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum DevicePasswordId {
    Default = 0x0000,
    UserSpecified = 0x0001,
    MachineSpecified = 0x0002,
    Rekey = 0x0003,
    PushButton = 0x0004,
    RegistrarSpecified = 0x0005,
}

impl DevicePasswordId {
    fn from_u16(v: u16) -> Option<DevicePasswordId> {
        match v {
            0x0000 => Some(DevicePasswordId::Default),
            0x0001 => Some(DevicePasswordId::UserSpecified),
            0x0002 => Some(DevicePasswordId::MachineSpecified),
            0x0003 => Some(DevicePasswordId::Rekey),
            0x0004 => Some(DevicePasswordId::PushButton),
            0x0005 => Some(DevicePasswordId::RegistrarSpecified),
            _ => None,
        }
    }
}

/// Request Type values.
pub const REQUEST_TYPE_ENROLLEE_INFO: u8 = 0x00;
pub const REQUEST_TYPE_ENROLLEE_OPEN_8021X: u8 = 0x01;

/// Response Type value used by an AP.
pub const RESPONSE_TYPE_AP: u8 = 0x03;

/// Simple Config State values.
pub const STATE_NOT_CONFIGURED: u8 = 0x01;
pub const STATE_CONFIGURED: u8 = 0x02;

const VERSION_1_0: u8 = 0x10;
const VERSION_2_0: u8 = 0x20;
const WFA_VENDOR_ID: [u8; 3] = [0x00, 0x37, 0x2a];
const WFA_SUBELEM_VERSION2: u8 = 0x00;

/// Extracts the concatenated WSC attribute payload from a frame's element
/// section, or `None` when no WSC vendor element is present. Fragmented
/// payloads spanning several vendor elements are joined in order.
pub fn extract_wsc_payload(ies: &[u8]) -> Result<Option<Vec<u8>>> {
    let mut payload: Option<Vec<u8>> = None;

    for tlv in TlvIterator::new(ies) {
        let tlv = tlv?;
        if tlv.tag != eid::VENDOR_SPECIFIC || tlv.data.len() < 4 || tlv.data[..4] != WSC_OUI {
            continue;
        }
        payload.get_or_insert_with(Vec::new).extend_from_slice(&tlv.data[4..]);
    }

    Ok(payload)
}

/// Wraps a WSC attribute payload into vendor-specific elements,
/// fragmenting when the payload exceeds a single element's capacity.
pub fn build_wsc_ies(payload: &[u8]) -> Vec<u8> {
    const MAX_FRAGMENT: usize = 0xff - 4;
    let mut out = Vec::with_capacity(payload.len() + 8);

    let mut chunks = payload.chunks(MAX_FRAGMENT);
    // An empty payload still produces one (empty) element.
    let first = chunks.next().unwrap_or(&[]);
    for chunk in std::iter::once(first).chain(chunks) {
        out.push(eid::VENDOR_SPECIFIC);
        out.push((4 + chunk.len()) as u8);
        out.extend_from_slice(&WSC_OUI);
        out.extend_from_slice(chunk);
    }
    out
}

/// Iterator over WSC attributes in a payload.
pub struct AttrIterator<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> AttrIterator<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        AttrIterator { buf, pos: 0 }
    }
}

impl<'a> Iterator for AttrIterator<'a> {
    type Item = Result<(u16, &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.buf.len() {
            return None;
        }
        if self.buf.len() - self.pos < 4 {
            self.pos = self.buf.len();
            return Some(Err(IeError::malformed("WSC", "attribute header truncated")));
        }
        let typ = u16::from_be_bytes([self.buf[self.pos], self.buf[self.pos + 1]]);
        let len = u16::from_be_bytes([self.buf[self.pos + 2], self.buf[self.pos + 3]]) as usize;
        let start = self.pos + 4;
        if start + len > self.buf.len() {
            self.pos = self.buf.len();
            return Some(Err(IeError::malformed("WSC", "attribute overruns payload")));
        }
        self.pos = start + len;
        Some(Ok((typ, &self.buf[start..start + len])))
    }
}

fn push_attr(out: &mut Vec<u8>, typ: u16, data: &[u8]) {
    out.extend_from_slice(&typ.to_be_bytes());
    out.extend_from_slice(&(data.len() as u16).to_be_bytes());
    out.extend_from_slice(data);
}

fn push_version2(out: &mut Vec<u8>) {
    let mut ext = Vec::with_capacity(6);
    ext.extend_from_slice(&WFA_VENDOR_ID);
    ext.push(WFA_SUBELEM_VERSION2);
    ext.push(1);
    ext.push(VERSION_2_0);
    push_attr(out, attr::VENDOR_EXTENSION, &ext);
}

fn parse_version2(data: &[u8]) -> Option<u8> {
    if data.len() < 3 || data[..3] != WFA_VENDOR_ID {
        return None;
    }
    let mut rest = &data[3..];
    while rest.len() >= 2 {
        let (id, len) = (rest[0], rest[1] as usize);
        if rest.len() < 2 + len {
            return None;
        }
        if id == WFA_SUBELEM_VERSION2 && len == 1 {
            return Some(rest[2]);
        }
        rest = &rest[2 + len..];
    }
    None
}

/// The attributes of a WSC Probe Request that matter for PBC monitoring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeRequest {
    pub uuid_e: [u8; 16],
    pub config_methods: u16,
    pub device_password_id: DevicePasswordId,
    pub request_type: u8,
    pub version2: bool,
}

impl ProbeRequest {
    pub fn parse(payload: &[u8]) -> Result<ProbeRequest> {
        let mut uuid_e = None;
        let mut config_methods = None;
        let mut dpid = None;
        let mut request_type = None;
        let mut version2 = false;

        for a in AttrIterator::new(payload) {
            let (typ, data) = a?;
            match typ {
                attr::UUID_E if data.len() == 16 => {
                    let mut uuid = [0u8; 16];
                    uuid.copy_from_slice(data);
                    uuid_e = Some(uuid);
                }
                attr::CONFIG_METHODS if data.len() == 2 => {
                    config_methods = Some(u16::from_be_bytes([data[0], data[1]]));
                }
                attr::DEVICE_PASSWORD_ID if data.len() == 2 => {
                    dpid = DevicePasswordId::from_u16(u16::from_be_bytes([data[0], data[1]]));
                }
                attr::REQUEST_TYPE if data.len() == 1 => request_type = Some(data[0]),
                attr::VENDOR_EXTENSION => {
                    if parse_version2(data) == Some(VERSION_2_0) {
                        version2 = true;
                    }
                }
                _ => {}
            }
        }

        Ok(ProbeRequest {
            uuid_e: uuid_e.ok_or(IeError::malformed("WSC", "probe request without UUID-E"))?,
            config_methods: config_methods
                .ok_or(IeError::malformed("WSC", "probe request without config methods"))?,
            device_password_id: dpid
                .ok_or(IeError::malformed("WSC", "probe request without password id"))?,
            request_type: request_type.unwrap_or(REQUEST_TYPE_ENROLLEE_INFO),
            version2,
        })
    }
}

/// WSC (Re)Association Request payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationRequest {
    pub request_type: u8,
    pub version2: bool,
}

impl AssociationRequest {
    pub fn parse(payload: &[u8]) -> Result<AssociationRequest> {
        let mut request_type = None;
        let mut version2 = false;

        for a in AttrIterator::new(payload) {
            let (typ, data) = a?;
            match typ {
                attr::REQUEST_TYPE if data.len() == 1 => request_type = Some(data[0]),
                attr::VENDOR_EXTENSION => {
                    if parse_version2(data) == Some(VERSION_2_0) {
                        version2 = true;
                    }
                }
                _ => {}
            }
        }

        Ok(AssociationRequest {
            request_type: request_type
                .ok_or(IeError::malformed("WSC", "association request without request type"))?,
            version2,
        })
    }

    pub fn to_payload(&self) -> Vec<u8> {
        let mut out = Vec::new();
        push_attr(&mut out, attr::VERSION, &[VERSION_1_0]);
        push_attr(&mut out, attr::REQUEST_TYPE, &[self.request_type]);
        if self.version2 {
            push_version2(&mut out);
        }
        out
    }
}

/// WSC (Re)Association Response payload sent by the AP.
pub fn build_association_response(version2: bool) -> Vec<u8> {
    let mut out = Vec::new();
    push_attr(&mut out, attr::VERSION, &[VERSION_1_0]);
    push_attr(&mut out, attr::RESPONSE_TYPE, &[RESPONSE_TYPE_AP]);
    if version2 {
        push_version2(&mut out);
    }
    out
}

/// Registrar-side beacon and probe-response parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrarAdvertisement {
    pub configured: bool,
    /// Active registration window: toggles Selected Registrar and the
    /// password id attributes.
    pub selected_registrar: Option<DevicePasswordId>,
    pub uuid_e: [u8; 16],
    pub device_name: String,
}

impl RegistrarAdvertisement {
    pub fn build_beacon(&self) -> Vec<u8> {
        let mut out = Vec::new();
        push_attr(&mut out, attr::VERSION, &[VERSION_1_0]);
        let state = if self.configured { STATE_CONFIGURED } else { STATE_NOT_CONFIGURED };
        push_attr(&mut out, attr::SIMPLE_CONFIG_STATE, &[state]);
        if let Some(dpid) = self.selected_registrar {
            push_attr(&mut out, attr::SELECTED_REGISTRAR, &[0x01]);
            push_attr(&mut out, attr::DEVICE_PASSWORD_ID, &(dpid as u16).to_be_bytes());
            push_attr(
                &mut out,
                attr::SELECTED_REGISTRAR_CONFIG_METHODS,
                &CONFIG_METHOD_PHYSICAL_PUSH_BUTTON.to_be_bytes(),
            );
        }
        push_version2(&mut out);
        out
    }

    pub fn build_probe_response(&self) -> Vec<u8> {
        let mut out = Vec::new();
        push_attr(&mut out, attr::VERSION, &[VERSION_1_0]);
        let state = if self.configured { STATE_CONFIGURED } else { STATE_NOT_CONFIGURED };
        push_attr(&mut out, attr::SIMPLE_CONFIG_STATE, &[state]);
        if let Some(dpid) = self.selected_registrar {
            push_attr(&mut out, attr::SELECTED_REGISTRAR, &[0x01]);
            push_attr(&mut out, attr::DEVICE_PASSWORD_ID, &(dpid as u16).to_be_bytes());
            push_attr(
                &mut out,
                attr::SELECTED_REGISTRAR_CONFIG_METHODS,
                &CONFIG_METHOD_PHYSICAL_PUSH_BUTTON.to_be_bytes(),
            );
        }
        push_attr(&mut out, attr::RESPONSE_TYPE, &[RESPONSE_TYPE_AP]);
        push_attr(&mut out, attr::UUID_E, &self.uuid_e);
        push_attr(&mut out, attr::DEVICE_NAME, self.device_name.as_bytes());
        push_version2(&mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pbc_probe_payload(uuid: [u8; 16]) -> Vec<u8> {
        let mut out = Vec::new();
        push_attr(&mut out, attr::VERSION, &[VERSION_1_0]);
        push_attr(&mut out, attr::REQUEST_TYPE, &[REQUEST_TYPE_ENROLLEE_OPEN_8021X]);
        push_attr(&mut out, attr::CONFIG_METHODS, &CONFIG_METHOD_PUSH_BUTTON.to_be_bytes());
        push_attr(&mut out, attr::UUID_E, &uuid);
        push_attr(
            &mut out,
            attr::DEVICE_PASSWORD_ID,
            &(DevicePasswordId::PushButton as u16).to_be_bytes(),
        );
        push_version2(&mut out);
        out
    }

    #[test]
    fn probe_request_parses_pbc() {
        let req = ProbeRequest::parse(&pbc_probe_payload([7; 16])).unwrap();
        assert_eq!(req.device_password_id, DevicePasswordId::PushButton);
        assert_eq!(req.config_methods & CONFIG_METHOD_PUSH_BUTTON, CONFIG_METHOD_PUSH_BUTTON);
        assert_eq!(req.uuid_e, [7; 16]);
        assert!(req.version2);
    }

    #[test]
    fn payload_extraction_joins_fragments() {
        let payload = pbc_probe_payload([3; 16]);
        let ies = build_wsc_ies(&payload);
        let back = extract_wsc_payload(&ies).unwrap().unwrap();
        assert_eq!(back, payload);

        // Force fragmentation and re-join.
        let long = vec![0x5au8; 600];
        let ies = build_wsc_ies(&long);
        assert!(ies.len() > 600 + 6);
        assert_eq!(extract_wsc_payload(&ies).unwrap().unwrap(), long);
    }

    #[test]
    fn non_wsc_vendor_elements_ignored() {
        let ies = [0xdd, 0x05, 0x00, 0x50, 0xf2, 0x02, 0x00];
        assert_eq!(extract_wsc_payload(&ies).unwrap(), None);
    }

    #[test]
    fn truncated_attribute_rejected() {
        let bad = [0x10, 0x4a, 0x00, 0x05, 0x10];
        assert!(ProbeRequest::parse(&bad).is_err());
    }

    #[test]
    fn beacon_toggles_selected_registrar() {
        let mut adv = RegistrarAdvertisement {
            configured: true,
            selected_registrar: None,
            uuid_e: [9; 16],
            device_name: "airlock-ap".into(),
        };
        let quiet = adv.build_beacon();
        adv.selected_registrar = Some(DevicePasswordId::PushButton);
        let active = adv.build_beacon();

        let has_sel_reg = |p: &[u8]| {
            AttrIterator::new(p).any(|a| matches!(a, Ok((t, _)) if t == attr::SELECTED_REGISTRAR))
        };
        assert!(!has_sel_reg(&quiet));
        assert!(has_sel_reg(&active));
    }

    #[test]
    fn association_response_carries_ap_response_type() {
        let payload = build_association_response(true);
        let typ = AttrIterator::new(&payload)
            .filter_map(|a| a.ok())
            .find(|(t, _)| *t == attr::RESPONSE_TYPE)
            .map(|(_, d)| d[0]);
        assert_eq!(typ, Some(RESPONSE_TYPE_AP));
    }
}
