//! nl80211 wire contract: command and attribute constants plus typed
//! command builders for the subset of the family this daemon speaks.
//! Numeric values follow the kernel's nl80211.h and are stable ABI.

use crate::genl::GenlCmd;

pub mod cmd {
    pub const GET_INTERFACE: u8 = 5;
    pub const SET_INTERFACE: u8 = 6;
    pub const NEW_INTERFACE: u8 = 7;
    pub const DEL_INTERFACE: u8 = 8;
    pub const GET_KEY: u8 = 9;
    pub const SET_KEY: u8 = 10;
    pub const NEW_KEY: u8 = 11;
    pub const DEL_KEY: u8 = 12;
    pub const SET_BEACON: u8 = 14;
    pub const START_AP: u8 = 15;
    pub const STOP_AP: u8 = 16;
    pub const SET_STATION: u8 = 18;
    pub const NEW_STATION: u8 = 19;
    pub const DEL_STATION: u8 = 20;
    pub const AUTHENTICATE: u8 = 37;
    pub const ASSOCIATE: u8 = 38;
    pub const DEAUTHENTICATE: u8 = 39;
    pub const DISASSOCIATE: u8 = 40;
    pub const CONNECT: u8 = 46;
    pub const ROAM: u8 = 47;
    pub const DISCONNECT: u8 = 48;
    pub const REGISTER_FRAME: u8 = 58;
    pub const FRAME: u8 = 59;
    pub const FRAME_TX_STATUS: u8 = 60;
    pub const SET_CQM: u8 = 63;
    pub const NOTIFY_CQM: u8 = 64;
    pub const SET_REKEY_OFFLOAD: u8 = 79;
}

pub mod attr {
    pub const IFINDEX: u16 = 3;
    pub const IFNAME: u16 = 4;
    pub const IFTYPE: u16 = 5;
    pub const MAC: u16 = 6;
    pub const KEY_DATA: u16 = 7;
    pub const KEY_IDX: u16 = 8;
    pub const KEY_CIPHER: u16 = 9;
    pub const KEY_SEQ: u16 = 10;
    pub const KEY_DEFAULT: u16 = 11;
    pub const BEACON_INTERVAL: u16 = 12;
    pub const DTIM_PERIOD: u16 = 13;
    pub const BEACON_HEAD: u16 = 14;
    pub const BEACON_TAIL: u16 = 15;
    pub const STA_AID: u16 = 16;
    pub const STA_LISTEN_INTERVAL: u16 = 18;
    pub const STA_SUPPORTED_RATES: u16 = 19;
    pub const KEY_DEFAULT_MGMT: u16 = 40;
    pub const IE: u16 = 42;
    pub const FRAME: u16 = 51;
    pub const SSID: u16 = 52;
    pub const AUTH_TYPE: u16 = 53;
    pub const REASON_CODE: u16 = 54;
    pub const KEY_TYPE: u16 = 55;
    pub const TIMED_OUT: u16 = 65;
    pub const USE_MFP: u16 = 66;
    pub const STA_FLAGS2: u16 = 67;
    pub const CONTROL_PORT: u16 = 68;
    pub const PRIVACY: u16 = 70;
    pub const DISCONNECTED_BY_AP: u16 = 71;
    pub const STATUS_CODE: u16 = 72;
    pub const CIPHER_SUITES_PAIRWISE: u16 = 73;
    pub const CIPHER_SUITE_GROUP: u16 = 74;
    pub const WPA_VERSIONS: u16 = 75;
    pub const AKM_SUITES: u16 = 76;
    pub const REQ_IE: u16 = 77;
    pub const RESP_IE: u16 = 78;
    pub const PREV_BSSID: u16 = 79;
    pub const WIPHY_FREQ: u16 = 38;
    pub const COOKIE: u16 = 88;
    pub const FRAME_MATCH: u16 = 91;
    pub const ACK: u16 = 92;
    pub const CQM: u16 = 94;
    pub const FRAME_TYPE: u16 = 101;
    pub const REKEY_DATA: u16 = 122;
    pub const IE_PROBE_RESP: u16 = 127;
    pub const IE_ASSOC_RESP: u16 = 128;
    pub const WDEV: u16 = 153;
}

pub mod rekey_data {
    pub const KEK: u16 = 1;
    pub const KCK: u16 = 2;
    pub const REPLAY_CTR: u16 = 3;
}

pub mod cqm {
    pub const RSSI_THOLD: u16 = 1;
    pub const RSSI_HYST: u16 = 2;
    pub const RSSI_THRESHOLD_EVENT: u16 = 3;

    pub const EVENT_LOW: u32 = 0;
    pub const EVENT_HIGH: u32 = 1;
}

pub mod iftype {
    pub const STATION: u32 = 2;
    pub const AP: u32 = 3;
}

pub mod auth_type {
    pub const OPEN_SYSTEM: u32 = 0;
    pub const FT: u32 = 2;
}

pub mod key_type {
    pub const GROUP: u32 = 0;
    pub const PAIRWISE: u32 = 1;
}

pub const WPA_VERSION_2: u32 = 1 << 1;
pub const STA_FLAG_AUTHORIZED: u32 = 1 << 1;

/// `struct nl80211_sta_flag_update { mask, set }`.
fn sta_flags(mask: u32, set: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(8);
    out.extend_from_slice(&mask.to_ne_bytes());
    out.extend_from_slice(&set.to_ne_bytes());
    out
}

/// RSN parameters attached to a CONNECT command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRsn {
    pub pairwise_selector: u32,
    pub group_selector: u32,
    pub akm_selector: u32,
    pub mfp: bool,
}

/// CONNECT with Open System auth and optional RSN attributes; `ies` is
/// the element section placed into the association request.
#[allow(clippy::too_many_arguments)]
pub fn connect(
    ifindex: u32,
    ssid: &[u8],
    bssid: [u8; 6],
    frequency: u32,
    rsn: Option<&ConnectRsn>,
    ies: &[u8],
    prev_bssid: Option<[u8; 6]>,
) -> GenlCmd {
    let mut cmd = GenlCmd::new(cmd::CONNECT)
        .u32(attr::IFINDEX, ifindex)
        .bytes(attr::SSID, ssid)
        .bytes(attr::MAC, bssid.to_vec())
        .u32(attr::WIPHY_FREQ, frequency)
        .u32(attr::AUTH_TYPE, auth_type::OPEN_SYSTEM);

    if let Some(rsn) = rsn {
        cmd = cmd
            .u32(attr::CIPHER_SUITES_PAIRWISE, rsn.pairwise_selector)
            .u32(attr::CIPHER_SUITE_GROUP, rsn.group_selector)
            .u32(attr::AKM_SUITES, rsn.akm_selector)
            .u32(attr::WPA_VERSIONS, WPA_VERSION_2)
            .flag(attr::PRIVACY)
            .flag(attr::CONTROL_PORT);
        if rsn.mfp {
            cmd = cmd.u32(attr::USE_MFP, 1);
        }
    }
    if let Some(prev) = prev_bssid {
        cmd = cmd.bytes(attr::PREV_BSSID, prev.to_vec());
    }
    if !ies.is_empty() {
        cmd = cmd.bytes(attr::IE, ies);
    }
    cmd
}

pub fn disconnect(ifindex: u32, reason: u16) -> GenlCmd {
    GenlCmd::new(cmd::DISCONNECT).u32(attr::IFINDEX, ifindex).u16(attr::REASON_CODE, reason)
}

pub fn deauthenticate(ifindex: u32, peer: [u8; 6], reason: u16) -> GenlCmd {
    GenlCmd::new(cmd::DEAUTHENTICATE)
        .u32(attr::IFINDEX, ifindex)
        .bytes(attr::MAC, peer.to_vec())
        .u16(attr::REASON_CODE, reason)
}

/// FT Authenticate with the ies carrying RSNE (PMKR0Name), MDE and FTE.
pub fn authenticate_ft(
    ifindex: u32,
    peer: [u8; 6],
    frequency: u32,
    ssid: &[u8],
    ies: &[u8],
) -> GenlCmd {
    GenlCmd::new(cmd::AUTHENTICATE)
        .u32(attr::IFINDEX, ifindex)
        .bytes(attr::MAC, peer.to_vec())
        .u32(attr::WIPHY_FREQ, frequency)
        .bytes(attr::SSID, ssid)
        .u32(attr::AUTH_TYPE, auth_type::FT)
        .bytes(attr::IE, ies)
}

/// FT Reassociation: ASSOCIATE with the previous BSSID set.
pub fn associate_ft(
    ifindex: u32,
    target: [u8; 6],
    frequency: u32,
    ssid: &[u8],
    ies: &[u8],
    prev_bssid: [u8; 6],
) -> GenlCmd {
    GenlCmd::new(cmd::ASSOCIATE)
        .u32(attr::IFINDEX, ifindex)
        .bytes(attr::MAC, target.to_vec())
        .u32(attr::WIPHY_FREQ, frequency)
        .bytes(attr::SSID, ssid)
        .bytes(attr::PREV_BSSID, prev_bssid.to_vec())
        .bytes(attr::IE, ies)
}

pub fn new_pairwise_key(ifindex: u32, peer: [u8; 6], cipher_selector: u32, tk: &[u8]) -> GenlCmd {
    GenlCmd::new(cmd::NEW_KEY)
        .u32(attr::IFINDEX, ifindex)
        .bytes(attr::MAC, peer.to_vec())
        .bytes(attr::KEY_DATA, tk)
        .u32(attr::KEY_CIPHER, cipher_selector)
        .u8(attr::KEY_IDX, 0)
        .u32(attr::KEY_TYPE, key_type::PAIRWISE)
}

pub fn set_pairwise_key_default(ifindex: u32, peer: [u8; 6]) -> GenlCmd {
    GenlCmd::new(cmd::SET_KEY)
        .u32(attr::IFINDEX, ifindex)
        .u8(attr::KEY_IDX, 0)
        .bytes(attr::MAC, peer.to_vec())
}

pub fn new_group_key(
    ifindex: u32,
    index: u8,
    cipher_selector: u32,
    key: &[u8],
    rsc: u64,
) -> GenlCmd {
    GenlCmd::new(cmd::NEW_KEY)
        .u32(attr::IFINDEX, ifindex)
        .bytes(attr::KEY_DATA, key)
        .u32(attr::KEY_CIPHER, cipher_selector)
        .u8(attr::KEY_IDX, index)
        .bytes(attr::KEY_SEQ, rsc.to_le_bytes()[..6].to_vec())
        .u32(attr::KEY_TYPE, key_type::GROUP)
}

pub fn set_group_key_default(ifindex: u32, index: u8) -> GenlCmd {
    GenlCmd::new(cmd::SET_KEY)
        .u32(attr::IFINDEX, ifindex)
        .u8(attr::KEY_IDX, index)
        .flag(attr::KEY_DEFAULT)
}

/// Integrity group key for protected management frames.
pub fn new_mgmt_group_key(
    ifindex: u32,
    index: u16,
    cipher_selector: u32,
    key: &[u8],
    ipn: [u8; 6],
) -> GenlCmd {
    GenlCmd::new(cmd::NEW_KEY)
        .u32(attr::IFINDEX, ifindex)
        .bytes(attr::KEY_DATA, key)
        .u32(attr::KEY_CIPHER, cipher_selector)
        .u8(attr::KEY_IDX, index as u8)
        .bytes(attr::KEY_SEQ, ipn.to_vec())
        .u32(attr::KEY_TYPE, key_type::GROUP)
        .flag(attr::KEY_DEFAULT_MGMT)
}

/// Queries a group key, used to learn the kernel-chosen Tx RSC before
/// the authenticator handshake starts.
pub fn get_key(ifindex: u32, index: u8) -> GenlCmd {
    GenlCmd::new(cmd::GET_KEY).u32(attr::IFINDEX, ifindex).u8(attr::KEY_IDX, index)
}

pub fn del_key(ifindex: u32, index: u8) -> GenlCmd {
    GenlCmd::new(cmd::DEL_KEY).u32(attr::IFINDEX, ifindex).u8(attr::KEY_IDX, index)
}

pub fn new_station(
    ifindex: u32,
    mac: [u8; 6],
    aid: u16,
    listen_interval: u16,
    supported_rates: &[u8],
) -> GenlCmd {
    GenlCmd::new(cmd::NEW_STATION)
        .u32(attr::IFINDEX, ifindex)
        .bytes(attr::MAC, mac.to_vec())
        .u16(attr::STA_AID, aid)
        .u16(attr::STA_LISTEN_INTERVAL, listen_interval)
        .bytes(attr::STA_SUPPORTED_RATES, supported_rates)
        .bytes(attr::STA_FLAGS2, sta_flags(STA_FLAG_AUTHORIZED, 0))
}

pub fn set_station_authorized(ifindex: u32, mac: [u8; 6]) -> GenlCmd {
    GenlCmd::new(cmd::SET_STATION)
        .u32(attr::IFINDEX, ifindex)
        .bytes(attr::MAC, mac.to_vec())
        .bytes(attr::STA_FLAGS2, sta_flags(STA_FLAG_AUTHORIZED, STA_FLAG_AUTHORIZED))
}

pub fn del_station(ifindex: u32, mac: [u8; 6], reason: u16) -> GenlCmd {
    GenlCmd::new(cmd::DEL_STATION)
        .u32(attr::IFINDEX, ifindex)
        .bytes(attr::MAC, mac.to_vec())
        .u16(attr::REASON_CODE, reason)
}

#[allow(clippy::too_many_arguments)]
pub fn start_ap(
    ifindex: u32,
    beacon_head: &[u8],
    beacon_tail: &[u8],
    beacon_interval: u32,
    dtim_period: u32,
    ssid: &[u8],
    privacy: bool,
    probe_resp_ies: &[u8],
) -> GenlCmd {
    let mut cmd = GenlCmd::new(cmd::START_AP)
        .u32(attr::IFINDEX, ifindex)
        .bytes(attr::BEACON_HEAD, beacon_head)
        .bytes(attr::BEACON_TAIL, beacon_tail)
        .u32(attr::BEACON_INTERVAL, beacon_interval)
        .u32(attr::DTIM_PERIOD, dtim_period)
        .bytes(attr::SSID, ssid);
    if privacy {
        cmd = cmd.flag(attr::PRIVACY);
    }
    if !probe_resp_ies.is_empty() {
        cmd = cmd.bytes(attr::IE_PROBE_RESP, probe_resp_ies);
    }
    cmd
}

pub fn stop_ap(ifindex: u32) -> GenlCmd {
    GenlCmd::new(cmd::STOP_AP).u32(attr::IFINDEX, ifindex)
}

pub fn set_beacon(
    ifindex: u32,
    beacon_head: &[u8],
    beacon_tail: &[u8],
    probe_resp_ies: &[u8],
) -> GenlCmd {
    let mut cmd = GenlCmd::new(cmd::SET_BEACON)
        .u32(attr::IFINDEX, ifindex)
        .bytes(attr::BEACON_HEAD, beacon_head)
        .bytes(attr::BEACON_TAIL, beacon_tail);
    if !probe_resp_ies.is_empty() {
        cmd = cmd.bytes(attr::IE_PROBE_RESP, probe_resp_ies);
    }
    cmd
}

/// Asks the kernel to forward management frames whose body starts with
/// `frame_match` for the given frame-control type.
pub fn register_frame(ifindex: u32, frame_type: u16, frame_match: &[u8]) -> GenlCmd {
    GenlCmd::new(cmd::REGISTER_FRAME)
        .u32(attr::IFINDEX, ifindex)
        .u16(attr::FRAME_TYPE, frame_type)
        .bytes(attr::FRAME_MATCH, frame_match)
}

/// Transmits a management frame.
pub fn frame_tx(ifindex: u32, frequency: u32, frame: &[u8]) -> GenlCmd {
    GenlCmd::new(cmd::FRAME)
        .u32(attr::IFINDEX, ifindex)
        .u32(attr::WIPHY_FREQ, frequency)
        .bytes(attr::FRAME, frame)
}

/// Arms the connection-quality monitor with an RSSI threshold in dBm.
pub fn set_cqm_rssi(ifindex: u32, threshold_dbm: i32, hysteresis_db: u32) -> GenlCmd {
    let mut nested = Vec::new();
    push_nested_attr(&mut nested, cqm::RSSI_THOLD, &threshold_dbm.to_ne_bytes());
    push_nested_attr(&mut nested, cqm::RSSI_HYST, &hysteresis_db.to_ne_bytes());
    GenlCmd::new(cmd::SET_CQM).u32(attr::IFINDEX, ifindex).bytes(attr::CQM, nested)
}

/// Pushes the rekey material into the kernel for offloaded group rekey.
pub fn set_rekey_offload(ifindex: u32, kek: &[u8], kck: &[u8], replay_counter: u64) -> GenlCmd {
    let mut nested = Vec::new();
    push_nested_attr(&mut nested, rekey_data::KEK, kek);
    push_nested_attr(&mut nested, rekey_data::KCK, kck);
    push_nested_attr(&mut nested, rekey_data::REPLAY_CTR, &replay_counter.to_be_bytes());
    GenlCmd::new(cmd::SET_REKEY_OFFLOAD).u32(attr::IFINDEX, ifindex).bytes(attr::REKEY_DATA, nested)
}

pub fn get_interface_dump() -> GenlCmd {
    GenlCmd::new(cmd::GET_INTERFACE).dump()
}

fn push_nested_attr(out: &mut Vec<u8>, typ: u16, payload: &[u8]) {
    let len = 4 + payload.len();
    out.extend_from_slice(&(len as u16).to_ne_bytes());
    out.extend_from_slice(&typ.to_ne_bytes());
    out.extend_from_slice(payload);
    while out.len() % 4 != 0 {
        out.push(0);
    }
}
