//! Soft-AP association state machine.
//!
//! One `AccessPoint` per AP-mode interface; per-client state lives in
//! `Sta` records keyed by MAC. Clients walk
//! `authenticated -> associated -> rsna` (or the WSC registration path
//! instead of an RSNA while push-button mode is active). The kernel
//! forwards management frames through registered frame watches; we
//! respond with `CMD_FRAME` and gate association on the response
//! transmission ack.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use airlock_crypto::nonce;
use airlock_eapol::frame::{packet_type, KeyFrame, PacketType};
use airlock_eapol::handshake::{GroupKey, Handshake, HandshakeConfig};
use airlock_eapol::{Authenticator, Update};
use airlock_ie::rates::{build_rates_elements, build_ssid, RateSet};
use airlock_ie::{eid, tlv, wsc, AkmSuite, CipherSuite, Rsne};
use airlock_mpdu::{
    mgmt, AssocReqBody, AssocRespBody, AuthBody, BeaconBody, DeauthBody, MgmtHdr, MgmtSubtype,
    ReasonCode, StatusCode, AUTH_ALGO_OPEN, CAPABILITY_ESS, CAPABILITY_PRIVACY,
};
use airlock_netlink::genl::{CommandId, CommandOutcome};
use airlock_netlink::nl80211::{self, attr};
use tracing::{debug, info, warn};

use crate::driver::{Driver, TimerKind};
use crate::events::ApEvent;
use crate::{CoreError, Result};

/// WSC v2.0.5, Section 11.3: walk time and monitor window.
pub const PBC_WALK_TIME: Duration = Duration::from_secs(120);
pub const PBC_MONITOR_TIME: Duration = Duration::from_secs(120);

const MAX_AID: u16 = 2007;
const EAPOL_TIMEOUT: Duration = Duration::from_secs(1);
const GTK_INDEX: u8 = 1;

/// 802.11b/g rate set with the basic-rate bit on the 11b rates.
const DEFAULT_RATES: [u8; 12] =
    [0x82, 0x84, 0x8b, 0x96, 0x0c, 0x12, 0x18, 0x24, 0x30, 0x48, 0x60, 0x6c];

#[derive(Debug, Clone)]
pub struct ApConfig {
    pub ssid: Vec<u8>,
    pub pmk: [u8; 32],
    pub frequency: u32,
    pub beacon_interval: u16,
    pub dtim_period: u8,
    /// When set, only these MACs may authenticate.
    pub authorized_macs: Option<Vec<[u8; 6]>>,
    pub wsc_uuid: [u8; 16],
    pub wsc_device_name: String,
}

impl ApConfig {
    pub fn new(ssid: Vec<u8>, pmk: [u8; 32], frequency: u32) -> ApConfig {
        ApConfig {
            ssid,
            pmk,
            frequency,
            beacon_interval: 100,
            dtim_period: 2,
            authorized_macs: None,
            wsc_uuid: [0; 16],
            wsc_device_name: "airlock-ap".into(),
        }
    }
}

/// Per-enrollee WSC registration context.
#[derive(Debug, Clone)]
struct WscSession {
    uuid_e: [u8; 16],
    version2: bool,
}

struct Sta {
    addr: [u8; 6],
    aid: u16,
    capability: u16,
    listen_interval: u16,
    rates_raw: Vec<u8>,
    authenticated: bool,
    associated: bool,
    rsna: bool,
    /// Association request element section, verbatim.
    assoc_ies: Vec<u8>,
    /// Owned copy of the request's RSNE.
    assoc_rsne: Option<Vec<u8>>,
    assoc_resp_cmd: Option<CommandId>,
    authenticator: Option<Authenticator>,
    wsc: Option<WscSession>,
}

impl Sta {
    fn new(addr: [u8; 6]) -> Sta {
        Sta {
            addr,
            aid: 0,
            capability: 0,
            listen_interval: 0,
            rates_raw: Vec::new(),
            authenticated: true,
            associated: false,
            rsna: false,
            assoc_ies: Vec::new(),
            assoc_rsne: None,
            assoc_resp_cmd: None,
            authenticator: None,
            wsc: None,
        }
    }
}

/// Read-only client summary for the upper layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StationInfo<'a> {
    pub aid: u16,
    pub capability: u16,
    pub listen_interval: u16,
    pub associated: bool,
    pub rsna: bool,
    pub assoc_ies: &'a [u8],
}

#[derive(Debug, Clone)]
struct PbcProbe {
    mac: [u8; 6],
    uuid_e: [u8; 16],
    at: Instant,
}

enum GtkState {
    None,
    /// NEW_KEY issued, waiting for its ack.
    Installing { cmd_id: CommandId, key: Vec<u8>, pending: Vec<[u8; 6]> },
    /// GET_KEY issued to learn the kernel's Tx RSC.
    QueryingRsc { cmd_id: CommandId, key: Vec<u8>, pending: Vec<[u8; 6]> },
    Ready(GroupKey),
}

pub struct AccessPoint {
    ifindex: u32,
    addr: [u8; 6],
    config: ApConfig,

    started: bool,
    start_cmd: Option<CommandId>,
    stop_cmd: Option<CommandId>,

    stations: Vec<Sta>,
    last_aid: u16,
    gtk: GtkState,

    pbc_mode: bool,
    pbc_probes: VecDeque<PbcProbe>,

    beacon_cmd: Option<CommandId>,
    beacon_dirty: bool,

    events: Vec<ApEvent>,
}

impl AccessPoint {
    pub fn new(ifindex: u32, addr: [u8; 6], config: ApConfig) -> AccessPoint {
        AccessPoint {
            ifindex,
            addr,
            config,
            started: false,
            start_cmd: None,
            stop_cmd: None,
            stations: Vec::new(),
            last_aid: 0,
            gtk: GtkState::None,
            pbc_mode: false,
            pbc_probes: VecDeque::new(),
            beacon_cmd: None,
            beacon_dirty: false,
            events: Vec::new(),
        }
    }

    pub fn ifindex(&self) -> u32 {
        self.ifindex
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn take_events(&mut self) -> Vec<ApEvent> {
        std::mem::take(&mut self.events)
    }

    /// Diagnostic view of one client: AID, capability, listen interval
    /// and the association-request IEs captured verbatim.
    pub fn station_info(&self, mac: [u8; 6]) -> Option<StationInfo<'_>> {
        self.stations.iter().find(|sta| sta.addr == mac).map(|sta| StationInfo {
            aid: sta.aid,
            capability: sta.capability,
            listen_interval: sta.listen_interval,
            associated: sta.associated,
            rsna: sta.rsna,
            assoc_ies: &sta.assoc_ies,
        })
    }

    fn emit(&mut self, event: ApEvent) {
        self.events.push(event);
    }

    fn our_rsne(&self) -> Rsne {
        Rsne::wpa2_psk()
    }

    /// Cipher bitmap offered in our RSNE.
    fn offered_ciphers(&self) -> u16 {
        CipherSuite::Ccmp as u16
    }

    // --- beacon construction -------------------------------------------

    fn channel(&self) -> u8 {
        // 2.4 GHz mapping; channel 14 sits apart.
        match self.config.frequency {
            2484 => 14,
            f if (2412..2484).contains(&f) => ((f - 2407) / 5) as u8,
            f => ((f - 5000) / 5) as u8,
        }
    }

    fn beacon_head(&self) -> Vec<u8> {
        let mut ies = build_ssid(&self.config.ssid);
        ies.extend_from_slice(&build_rates_elements(&DEFAULT_RATES[..8]));
        ies.extend_from_slice(&[eid::DSSS_PARAM_SET, 1, self.channel()]);

        BeaconBody {
            timestamp: 0,
            beacon_interval: self.config.beacon_interval,
            capability: CAPABILITY_ESS | CAPABILITY_PRIVACY,
            ies,
        }
        .to_bytes()
    }

    fn wsc_advertisement(&self) -> wsc::RegistrarAdvertisement {
        wsc::RegistrarAdvertisement {
            configured: true,
            selected_registrar: self
                .pbc_mode
                .then_some(wsc::DevicePasswordId::PushButton),
            uuid_e: self.config.wsc_uuid,
            device_name: self.config.wsc_device_name.clone(),
        }
    }

    /// Ascending element order: RSNE, extended rates, vendor WSC last.
    fn beacon_tail(&self) -> Vec<u8> {
        let mut tail = self.our_rsne().to_bytes();
        let ext = &DEFAULT_RATES[8..];
        tail.push(eid::EXTENDED_SUPPORTED_RATES);
        tail.push(ext.len() as u8);
        tail.extend_from_slice(ext);
        tail.extend_from_slice(&wsc::build_wsc_ies(&self.wsc_advertisement().build_beacon()));
        tail
    }

    fn probe_response_ies(&self) -> Vec<u8> {
        let mut tail = self.our_rsne().to_bytes();
        let ext = &DEFAULT_RATES[8..];
        tail.push(eid::EXTENDED_SUPPORTED_RATES);
        tail.push(ext.len() as u8);
        tail.extend_from_slice(ext);
        tail.extend_from_slice(&wsc::build_wsc_ies(
            &self.wsc_advertisement().build_probe_response(),
        ));
        tail
    }

    // --- lifecycle -----------------------------------------------------

    pub fn start(&mut self, driver: &mut dyn Driver) -> Result<()> {
        if self.started || self.start_cmd.is_some() {
            return Err(CoreError::InProgress);
        }

        // Management frames the kernel must forward to us.
        for subtype in [
            MgmtSubtype::Authentication,
            MgmtSubtype::AssociationRequest,
            MgmtSubtype::ReassociationRequest,
            MgmtSubtype::ProbeRequest,
            MgmtSubtype::Disassociation,
            MgmtSubtype::Deauthentication,
        ] {
            driver.submit(nl80211::register_frame(self.ifindex, subtype.frame_control(), &[]));
        }

        let cmd_id = driver.submit(nl80211::start_ap(
            self.ifindex,
            &self.beacon_head(),
            &self.beacon_tail(),
            u32::from(self.config.beacon_interval),
            u32::from(self.config.dtim_period),
            &self.config.ssid,
            true,
            &self.probe_response_ies(),
        ));
        self.start_cmd = Some(cmd_id);
        Ok(())
    }

    pub fn stop(&mut self, driver: &mut dyn Driver) -> Result<()> {
        if !self.started {
            return Err(CoreError::NotConnected);
        }
        if self.stop_cmd.is_some() {
            return Ok(());
        }
        self.emit(ApEvent::Stopping);
        let cmd_id = driver.submit(nl80211::stop_ap(self.ifindex));
        self.stop_cmd = Some(cmd_id);
        Ok(())
    }

    pub fn on_command_complete(
        &mut self,
        driver: &mut dyn Driver,
        id: CommandId,
        outcome: CommandOutcome,
    ) {
        if self.start_cmd == Some(id) {
            self.start_cmd = None;
            match outcome {
                CommandOutcome::Error(errno) => {
                    warn!(errno, "START_AP failed");
                    self.emit(ApEvent::StartFailed);
                }
                _ => {
                    info!(ifindex = self.ifindex, "AP started");
                    self.started = true;
                    self.emit(ApEvent::Started);
                }
            }
            return;
        }
        if self.stop_cmd == Some(id) {
            self.stop_cmd = None;
            self.started = false;
            let macs: Vec<_> = self.stations.drain(..).map(|sta| sta.addr).collect();
            for mac in macs {
                self.emit(ApEvent::StationRemoved { mac });
            }
            return;
        }
        if self.beacon_cmd == Some(id) {
            self.beacon_cmd = None;
            if self.beacon_dirty {
                self.beacon_dirty = false;
                self.update_beacon(driver);
            }
            return;
        }

        // GTK installation chain.
        match &mut self.gtk {
            GtkState::Installing { cmd_id, key, pending } if *cmd_id == id => {
                let key = std::mem::take(key);
                let pending = std::mem::take(pending);
                if matches!(outcome, CommandOutcome::Error(_)) {
                    warn!("GTK installation failed");
                    self.gtk = GtkState::None;
                    return;
                }
                let query = driver.submit(nl80211::get_key(self.ifindex, GTK_INDEX));
                self.gtk = GtkState::QueryingRsc { cmd_id: query, key, pending };
                return;
            }
            GtkState::QueryingRsc { cmd_id, key, pending } if *cmd_id == id => {
                let key = std::mem::take(key);
                let pending = std::mem::take(pending);
                // Some drivers refuse a user-supplied Tx RSC, so ask the
                // kernel what it chose.
                let rsc = match &outcome {
                    CommandOutcome::Response(resp) => resp
                        .get(attr::KEY_SEQ)
                        .map(|seq| {
                            let mut bytes = [0u8; 8];
                            bytes[..seq.len().min(8)]
                                .copy_from_slice(&seq[..seq.len().min(8)]);
                            u64::from_le_bytes(bytes)
                        })
                        .unwrap_or(0),
                    _ => 0,
                };
                self.gtk = GtkState::Ready(GroupKey { index: GTK_INDEX, key, rsc });
                for mac in pending {
                    self.begin_rsna(driver, mac);
                }
                return;
            }
            _ => {}
        }

        // Association response transmission acks.
        let sta_idx = self.stations.iter().position(|sta| sta.assoc_resp_cmd == Some(id));
        if let Some(idx) = sta_idx {
            self.stations[idx].assoc_resp_cmd = None;
            if matches!(outcome, CommandOutcome::Error(_)) {
                debug!("association response transmission failed");
                return;
            }
            self.on_assoc_resp_acked(driver, idx);
        }
    }

    // --- management frames ---------------------------------------------

    /// A forwarded management frame from the kernel's frame watch.
    pub fn on_mgmt_frame(&mut self, driver: &mut dyn Driver, frame: &[u8], now: Instant) {
        if !self.started {
            return;
        }
        let Ok((hdr, body)) = MgmtHdr::parse(frame) else { return };
        if hdr.addr1 != self.addr {
            return;
        }

        match hdr.subtype {
            MgmtSubtype::Authentication => self.on_auth_frame(driver, &hdr, body),
            MgmtSubtype::AssociationRequest => {
                if let Ok(req) = AssocReqBody::parse(body) {
                    self.on_assoc_request(driver, hdr.addr2, false, req, now);
                }
            }
            MgmtSubtype::ReassociationRequest => {
                if let Ok(req) = mgmt::ReassocReqBody::parse(body) {
                    let req = AssocReqBody {
                        capability: req.capability,
                        listen_interval: req.listen_interval,
                        ies: req.ies,
                    };
                    self.on_assoc_request(driver, hdr.addr2, true, req, now);
                }
            }
            MgmtSubtype::ProbeRequest => self.on_probe_request(driver, hdr.addr2, body, now),
            MgmtSubtype::Disassociation | MgmtSubtype::Deauthentication => {
                if let Ok(deauth) = DeauthBody::parse(body) {
                    debug!(reason = deauth.reason, "station {:02x?} left", hdr.addr2);
                }
                self.remove_station(driver, hdr.addr2, None);
            }
            _ => {}
        }
    }

    fn tx_frame(&mut self, driver: &mut dyn Driver, frame: Vec<u8>) -> CommandId {
        driver.submit(nl80211::frame_tx(self.ifindex, self.config.frequency, &frame))
    }

    fn on_auth_frame(&mut self, driver: &mut dyn Driver, hdr: &MgmtHdr, body: &[u8]) {
        let Ok(auth) = AuthBody::parse(body) else { return };
        let from = hdr.addr2;

        let status = if let Some(allowed) = &self.config.authorized_macs {
            if allowed.contains(&from) {
                StatusCode::Success
            } else {
                StatusCode::Unspecified
            }
        } else if auth.algorithm != AUTH_ALGO_OPEN {
            StatusCode::UnsupportedAuthAlgorithm
        } else if auth.transaction != 1 {
            StatusCode::AuthSequenceError
        } else {
            StatusCode::Success
        };

        // Re-check the algorithm even for allow-listed peers.
        let status = if status == StatusCode::Success && auth.algorithm != AUTH_ALGO_OPEN {
            StatusCode::UnsupportedAuthAlgorithm
        } else {
            status
        };

        if status == StatusCode::Success {
            if self.station_mut(from).is_none() {
                self.stations.push(Sta::new(from));
                debug!("station {from:02x?} authenticated");
            }
        }

        let reply = mgmt::build_frame(
            MgmtSubtype::Authentication,
            from,
            self.addr,
            self.addr,
            &AuthBody {
                algorithm: AUTH_ALGO_OPEN,
                transaction: 2,
                status: status as u16,
                ies: Vec::new(),
            }
            .to_bytes(),
        );
        self.tx_frame(driver, reply);
    }

    fn station_mut(&mut self, addr: [u8; 6]) -> Option<&mut Sta> {
        self.stations.iter_mut().find(|sta| sta.addr == addr)
    }

    fn send_assoc_reject(
        &mut self,
        driver: &mut dyn Driver,
        to: [u8; 6],
        reassoc: bool,
        status: StatusCode,
    ) {
        let subtype = if reassoc {
            MgmtSubtype::ReassociationResponse
        } else {
            MgmtSubtype::AssociationResponse
        };
        let body = AssocRespBody {
            capability: CAPABILITY_ESS | CAPABILITY_PRIVACY,
            status: status as u16,
            aid: 0,
            ies: Vec::new(),
        };
        let frame = mgmt::build_frame(subtype, to, self.addr, self.addr, &body.to_bytes());
        self.tx_frame(driver, frame);
    }

    fn on_assoc_request(
        &mut self,
        driver: &mut dyn Driver,
        from: [u8; 6],
        reassoc: bool,
        req: AssocReqBody,
        now: Instant,
    ) {
        let Some(sta_idx) = self
            .stations
            .iter()
            .position(|sta| sta.addr == from && sta.authenticated)
        else {
            // 11.3.5.3: association from an unauthenticated peer.
            debug!("association request from unauthenticated {from:02x?}");
            self.send_assoc_reject(driver, from, reassoc, StatusCode::Unspecified);
            return;
        };
        if self.stations[sta_idx].assoc_resp_cmd.is_some() {
            return;
        }
        if reassoc && !self.stations[sta_idx].associated {
            self.send_assoc_reject(driver, from, reassoc, StatusCode::Unspecified);
            return;
        }

        match self.validate_assoc_request(from, &req.ies, now) {
            Ok(wsc_session) => {
                let aid = if self.stations[sta_idx].associated {
                    self.stations[sta_idx].aid
                } else {
                    self.last_aid += 1;
                    self.last_aid
                };
                if aid > MAX_AID {
                    self.send_assoc_reject(driver, from, reassoc, StatusCode::AssocDenied);
                    return;
                }

                let rsne_copy = tlv::find_unique_raw(&req.ies, eid::RSN)
                    .ok()
                    .flatten()
                    .filter(|_| wsc_session.is_none())
                    .map(<[u8]>::to_vec);

                // The response carries our rates (and the WSC response
                // payload during a registration).
                let mut resp_ies = build_rates_elements(&DEFAULT_RATES);
                if let Some(session) = &wsc_session {
                    resp_ies.extend_from_slice(&wsc::build_wsc_ies(
                        &wsc::build_association_response(session.version2),
                    ));
                }
                let subtype = if reassoc {
                    MgmtSubtype::ReassociationResponse
                } else {
                    MgmtSubtype::AssociationResponse
                };
                let body = AssocRespBody {
                    capability: CAPABILITY_ESS | CAPABILITY_PRIVACY,
                    status: StatusCode::Success as u16,
                    aid,
                    ies: resp_ies,
                };
                let frame =
                    mgmt::build_frame(subtype, from, self.addr, self.addr, &body.to_bytes());
                let cmd_id = self.tx_frame(driver, frame);

                let rates = RateSet::from_ies(&req.ies).ok().flatten().unwrap_or_default();
                let sta = &mut self.stations[sta_idx];
                if sta.rsna || sta.associated {
                    // 11.3.5.3 j): restart security on reassociation.
                    sta.rsna = false;
                    sta.authenticator = None;
                }
                sta.aid = aid;
                sta.capability = req.capability;
                sta.listen_interval = req.listen_interval;
                sta.rates_raw = rates.iter().collect();
                sta.assoc_ies = req.ies.clone();
                sta.assoc_rsne = rsne_copy;
                sta.wsc = wsc_session;
                sta.assoc_resp_cmd = Some(cmd_id);
                // A registration start may have deferred a beacon update.
                self.flush_beacon(driver);
            }
            Err(status) => {
                debug!("rejecting association from {from:02x?}: {status:?}");
                let sta = &mut self.stations[sta_idx];
                if sta.rsna {
                    sta.rsna = false;
                }
                sta.authenticator = None;
                self.send_assoc_reject(driver, from, reassoc, status);
            }
        }
    }

    /// 802.11-2016 11.3.5.3 plus the WSC v2.0.5 8.2 carve-out. Returns
    /// the WSC session for a registration association, `None` for an
    /// RSNA one.
    fn validate_assoc_request(
        &mut self,
        from: [u8; 6],
        ies: &[u8],
        now: Instant,
    ) -> std::result::Result<Option<WscSession>, StatusCode> {
        let ssid = tlv::find(ies, eid::SSID).map_err(|_| StatusCode::InvalidIe)?;
        let rates = RateSet::from_ies(ies).map_err(|_| StatusCode::InvalidIe)?;
        let wsc_payload = wsc::extract_wsc_payload(ies).map_err(|_| StatusCode::InvalidIe)?;
        // WSC v2.0.5, 8.2: during a WSC association the RSNE is ignored.
        let rsne_raw = if wsc_payload.is_some() {
            None
        } else {
            tlv::find_unique_raw(ies, eid::RSN).map_err(|_| StatusCode::InvalidIe)?
        };

        if ssid != Some(self.config.ssid.as_slice()) {
            return Err(StatusCode::InvalidIe);
        }
        let Some(rates) = rates else { return Err(StatusCode::InvalidIe) };
        let mut ours = RateSet::default();
        for rate in DEFAULT_RATES {
            ours.insert(rate);
        }
        if !rates.intersects(&ours) {
            return Err(StatusCode::AssocDeniedRatesMismatch);
        }

        if let Some(payload) = wsc_payload {
            let req = wsc::AssociationRequest::parse(&payload)
                .map_err(|_| StatusCode::InvalidIe)?;
            if req.request_type != wsc::REQUEST_TYPE_ENROLLEE_OPEN_8021X {
                return Err(StatusCode::InvalidIe);
            }
            if !self.pbc_mode {
                debug!("WSC association from {from:02x?} outside PBC mode");
                return Err(StatusCode::Unspecified);
            }
            self.expire_pbc_probes(now, None);
            // The enrollee must be the sole PBC prober in the window.
            let record = match self.pbc_probes.front() {
                Some(record) if record.mac == from => record.clone(),
                Some(_) => {
                    debug!("session overlap during {from:02x?} registration attempt");
                    return Err(StatusCode::Unspecified);
                }
                None => {
                    debug!("no PBC probe record for {from:02x?}");
                    return Err(StatusCode::Unspecified);
                }
            };

            debug!("starting registration with {from:02x?}, UUID-E {:02x?}", record.uuid_e);
            self.emit(ApEvent::RegistrationStart { mac: from });
            // Registration has begun; leave active PBC mode.
            self.exit_pbc(None);
            return Ok(Some(WscSession { uuid_e: record.uuid_e, version2: req.version2 }));
        }

        let Some(rsne_raw) = rsne_raw else { return Err(StatusCode::InvalidIe) };
        let rsne = Rsne::parse(rsne_raw).map_err(|_| StatusCode::InvalidIe)?;

        if rsne.caps.mfp_required() && rsne.caps.spp_a_msdu_required() {
            return Err(StatusCode::Unspecified);
        }
        if rsne.pairwise_count() != 1
            || rsne.pairwise_ciphers & self.offered_ciphers() != rsne.pairwise_ciphers
        {
            return Err(StatusCode::InvalidPairwiseCipher);
        }
        if rsne.akm_suites != AkmSuite::Psk as u16 {
            return Err(StatusCode::InvalidAkmp);
        }

        Ok(None)
    }

    fn on_assoc_resp_acked(&mut self, driver: &mut dyn Driver, sta_idx: usize) {
        let sta = &mut self.stations[sta_idx];
        sta.associated = true;
        let mac = sta.addr;
        let aid = sta.aid;
        let listen_interval = sta.listen_interval;
        let rates = sta.rates_raw.clone();
        let needs_rsna = sta.assoc_rsne.is_some();
        info!("station {mac:02x?} associated with AID {aid}");

        driver.submit(nl80211::new_station(self.ifindex, mac, aid, listen_interval, &rates));

        if needs_rsna {
            match &mut self.gtk {
                GtkState::Ready(_) => self.begin_rsna(driver, mac),
                GtkState::Installing { pending, .. }
                | GtkState::QueryingRsc { pending, .. } => pending.push(mac),
                GtkState::None => {
                    // First secured station: create the group key, then
                    // learn the kernel's Tx RSC before handshaking.
                    let key = nonce::new_gtk(CipherSuite::Ccmp.key_len());
                    let cmd_id = driver.submit(nl80211::new_group_key(
                        self.ifindex,
                        GTK_INDEX,
                        CipherSuite::Ccmp.to_cipher_selector(),
                        &key,
                        0,
                    ));
                    self.gtk =
                        GtkState::Installing { cmd_id, key, pending: vec![mac] };
                }
            }
        }
        // WSC registrations proceed over EAP; the EAP-WSC method drives
        // the exchange and reports back through `credential_delivered`.
    }

    fn begin_rsna(&mut self, driver: &mut dyn Driver, mac: [u8; 6]) {
        let GtkState::Ready(gtk) = &self.gtk else { return };
        let gtk = gtk.clone();
        let our_rsne = self.our_rsne().to_bytes();
        let ssid = self.config.ssid.clone();
        let pmk = self.config.pmk;
        let addr = self.addr;

        let Some(sta_rsne) = self.station_mut(mac).and_then(|sta| sta.assoc_rsne.clone())
        else {
            return;
        };

        let mut hs = Handshake::new(HandshakeConfig { spa: mac, aa: addr, ssid });
        let prepared = hs
            .set_own_ie(&sta_rsne)
            .and_then(|_| hs.set_ap_ie(&our_rsne))
            .and_then(|_| hs.set_pmk(pmk));
        if let Err(err) = prepared {
            warn!("cannot start RSNA for {mac:02x?}: {err}");
            return;
        }

        let mut authenticator = match Authenticator::new(hs, gtk, None) {
            Ok(authenticator) => authenticator,
            Err(err) => {
                warn!("cannot create authenticator for {mac:02x?}: {err}");
                return;
            }
        };
        let mut sink = Vec::new();
        authenticator.initiate(&mut sink);
        if let Some(sta) = self.station_mut(mac) {
            sta.authenticator = Some(authenticator);
        }
        self.process_eapol_updates(driver, mac, sink);
    }

    // --- EAPoL ---------------------------------------------------------

    /// EAPoL PDU received from `source` on the control port.
    pub fn on_eapol_pdu(&mut self, driver: &mut dyn Driver, source: [u8; 6], pdu: &[u8]) {
        let mut sink = Vec::new();
        match packet_type(pdu) {
            Ok(PacketType::Start) => {
                // Restart the handshake for this station.
                let Some(sta) = self.station_mut(source) else { return };
                let Some(authenticator) = &mut sta.authenticator else { return };
                authenticator.initiate(&mut sink);
            }
            Ok(PacketType::Key) => {
                let Ok(frame) = KeyFrame::parse(pdu) else { return };
                let Some(sta) = self.station_mut(source) else { return };
                let Some(authenticator) = &mut sta.authenticator else { return };
                authenticator.on_eapol_frame(&frame, &mut sink);
            }
            _ => return,
        }
        self.process_eapol_updates(driver, source, sink);
    }

    pub fn on_timeout(&mut self, driver: &mut dyn Driver, kind: TimerKind) {
        match kind {
            TimerKind::PbcWalk => {
                debug!("PBC walk time expired");
                self.exit_pbc(Some(driver));
            }
            TimerKind::EapolRetransmit(mac) => {
                let mut sink = Vec::new();
                {
                    let Some(sta) = self.station_mut(mac) else { return };
                    let Some(authenticator) = &mut sta.authenticator else { return };
                    authenticator.on_timeout(&mut sink);
                }
                self.process_eapol_updates(driver, mac, sink);
            }
            _ => {}
        }
    }

    fn process_eapol_updates(
        &mut self,
        driver: &mut dyn Driver,
        mac: [u8; 6],
        sink: Vec<Update>,
    ) {
        for update in sink {
            match update {
                Update::TxFrame(pdu) => driver.tx_eapol(mac, &pdu),
                Update::StartTimer => {
                    driver.start_timer(TimerKind::EapolRetransmit(mac), EAPOL_TIMEOUT)
                }
                Update::StopTimer => driver.stop_timer(TimerKind::EapolRetransmit(mac)),
                Update::NewPtk { tk, cipher_selector } => {
                    driver.submit(nl80211::new_pairwise_key(
                        self.ifindex,
                        mac,
                        cipher_selector,
                        &tk,
                    ));
                    driver.submit(nl80211::set_station_authorized(self.ifindex, mac));
                }
                Update::Complete => {
                    let newly_secured = match self.station_mut(mac) {
                        Some(sta) if !sta.rsna => {
                            sta.rsna = true;
                            true
                        }
                        _ => false,
                    };
                    if newly_secured {
                        self.emit(ApEvent::StationAdded { mac });
                    }
                }
                Update::Failed(failure) => {
                    debug!("handshake with {mac:02x?} failed: {failure:?}");
                    self.remove_station(
                        driver,
                        mac,
                        Some(ReasonCode::FourwayHandshakeTimeout),
                    );
                    return;
                }
                // The AP's group key is installed once, not per peer.
                Update::NewGtk { .. } | Update::NewIgtk { .. } => {}
            }
        }
    }

    /// The EAP-WSC method delivered the credential to `mac`. Purge the
    /// enrollee's probe records so its next button press is not counted
    /// as an overlap with this session.
    pub fn credential_delivered(&mut self, mac: [u8; 6]) {
        self.pbc_probes.retain(|record| record.mac != mac);
        let registered =
            self.station_mut(mac).map(|sta| sta.wsc.take().is_some()).unwrap_or(false);
        if registered {
            self.emit(ApEvent::RegistrationSuccess { mac });
        }
    }

    // --- probes and PBC ------------------------------------------------

    fn on_probe_request(
        &mut self,
        driver: &mut dyn Driver,
        from: [u8; 6],
        body: &[u8],
        now: Instant,
    ) {
        // Probe request bodies are all elements.
        let ies = body;
        match tlv::find(ies, eid::SSID) {
            Ok(Some(ssid)) if ssid.is_empty() || ssid == self.config.ssid.as_slice() => {}
            Ok(None) => {}
            _ => return,
        }

        if let Ok(Some(payload)) = wsc::extract_wsc_payload(ies) {
            self.process_wsc_probe(driver, from, &payload, now);
        }

        let mut resp_ies = build_ssid(&self.config.ssid);
        resp_ies.extend_from_slice(&build_rates_elements(&DEFAULT_RATES[..8]));
        resp_ies.extend_from_slice(&[eid::DSSS_PARAM_SET, 1, self.channel()]);
        resp_ies.extend_from_slice(&self.probe_response_ies());

        let body = BeaconBody {
            timestamp: 0,
            beacon_interval: self.config.beacon_interval,
            capability: CAPABILITY_ESS | CAPABILITY_PRIVACY,
            ies: resp_ies,
        };
        let frame = mgmt::build_frame(
            MgmtSubtype::ProbeResponse,
            from,
            self.addr,
            self.addr,
            &body.to_bytes(),
        );
        self.tx_frame(driver, frame);
    }

    /// Drops expired records and, when `replacing` is set, older records
    /// from the same enrollee.
    fn expire_pbc_probes(&mut self, now: Instant, replacing: Option<[u8; 6]>) {
        self.pbc_probes.retain(|record| {
            now.duration_since(record.at) < PBC_MONITOR_TIME
                && Some(record.mac) != replacing
        });
    }

    fn process_wsc_probe(
        &mut self,
        driver: &mut dyn Driver,
        from: [u8; 6],
        payload: &[u8],
        now: Instant,
    ) {
        let Ok(req) = wsc::ProbeRequest::parse(payload) else { return };
        if req.config_methods & wsc::CONFIG_METHOD_PUSH_BUTTON == 0
            || req.device_password_id != wsc::DevicePasswordId::PushButton
        {
            return;
        }

        self.expire_pbc_probes(now, Some(from));
        let was_empty = self.pbc_probes.is_empty();
        self.pbc_probes.push_back(PbcProbe { mac: from, uuid_e: req.uuid_e, at: now });

        // WSC v2.0.5, 11.3: more than one PBC enrollee inside the
        // monitor window is a session overlap.
        if was_empty {
            return;
        }
        if self.pbc_mode {
            info!("exiting PBC mode: session overlap");
            self.exit_pbc(Some(driver));
        }
        // Interrupt a registration already in progress with the first
        // enrollee.
        let overlap_victim = self
            .stations
            .iter()
            .find(|sta| sta.associated && sta.wsc.is_some() && sta.addr != from)
            .map(|sta| sta.addr);
        if let Some(victim) = overlap_victim {
            debug!("interrupting registration with {victim:02x?}: session overlap");
            self.remove_station_quiet(victim);
        }
    }

    /// Activates push-button mode for one walk time. Fails when a
    /// session overlap is already on record.
    pub fn push_button(&mut self, driver: &mut dyn Driver, now: Instant) -> Result<()> {
        if !self.started {
            return Err(CoreError::NotConnected);
        }
        self.expire_pbc_probes(now, None);
        if self.pbc_probes.len() > 1 {
            debug!("cannot enter PBC mode: session overlap");
            return Err(CoreError::InProgress);
        }

        // A second press during the walk time restarts the timer.
        driver.start_timer(TimerKind::PbcWalk, PBC_WALK_TIME);
        if !self.pbc_mode {
            self.pbc_mode = true;
            self.update_beacon(driver);
        }
        Ok(())
    }

    fn exit_pbc(&mut self, driver: Option<&mut dyn Driver>) {
        if !self.pbc_mode {
            return;
        }
        self.pbc_mode = false;
        self.emit(ApEvent::PbcModeExit);
        if let Some(driver) = driver {
            driver.stop_timer(TimerKind::PbcWalk);
            self.update_beacon(driver);
        } else {
            self.beacon_dirty = true;
        }
    }

    /// Reinstalls the beacon and probe-response tails. Serialized: at
    /// most one SET_BEACON in flight, a dirty flag re-issues.
    fn update_beacon(&mut self, driver: &mut dyn Driver) {
        if self.beacon_cmd.is_some() {
            self.beacon_dirty = true;
            return;
        }
        let cmd_id = driver.submit(nl80211::set_beacon(
            self.ifindex,
            &self.beacon_head(),
            &self.beacon_tail(),
            &self.probe_response_ies(),
        ));
        self.beacon_cmd = Some(cmd_id);
    }

    /// Flushes a deferred beacon update (used after handling a frame
    /// without a driver at hand).
    pub fn flush_beacon(&mut self, driver: &mut dyn Driver) {
        if self.beacon_dirty && self.beacon_cmd.is_none() {
            self.beacon_dirty = false;
            self.update_beacon(driver);
        }
    }

    // --- teardown ------------------------------------------------------

    fn remove_station_quiet(&mut self, mac: [u8; 6]) {
        if let Some(idx) = self.stations.iter().position(|sta| sta.addr == mac) {
            let sta = self.stations.remove(idx);
            let was_known = sta.associated;
            // Authenticator drop zeroizes the station's key ladder.
            drop(sta);
            if was_known {
                self.emit(ApEvent::StationRemoved { mac });
            }
        }
    }

    fn remove_station(
        &mut self,
        driver: &mut dyn Driver,
        mac: [u8; 6],
        deauth_reason: Option<ReasonCode>,
    ) {
        let Some(idx) = self.stations.iter().position(|sta| sta.addr == mac) else {
            return;
        };
        let sta = self.stations.remove(idx);
        driver.stop_timer(TimerKind::EapolRetransmit(mac));
        if let Some(id) = sta.assoc_resp_cmd {
            driver.cancel(id);
        }
        if sta.associated {
            driver.submit(nl80211::del_station(
                self.ifindex,
                mac,
                deauth_reason.unwrap_or(ReasonCode::DeauthLeaving) as u16,
            ));
            self.emit(ApEvent::StationRemoved { mac });
        }
        if let Some(reason) = deauth_reason {
            let frame = mgmt::build_frame(
                MgmtSubtype::Deauthentication,
                mac,
                self.addr,
                self.addr,
                &DeauthBody { reason: reason as u16 }.to_bytes(),
            );
            self.tx_frame(driver, frame);
        }
    }

    /// Forcibly disconnects one client.
    pub fn disconnect_station(
        &mut self,
        driver: &mut dyn Driver,
        mac: [u8; 6],
        reason: ReasonCode,
    ) -> Result<()> {
        if self.stations.iter().all(|sta| sta.addr != mac) {
            return Err(CoreError::NotConnected);
        }
        self.remove_station(driver, mac, Some(reason));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::fake::FakeDriver;
    use airlock_eapol::Supplicant;
    use airlock_netlink::genl::AttrValue;
    use airlock_netlink::nl80211::cmd;

    const AP_ADDR: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0xa0];
    const STA1: [u8; 6] = [0x02, 0x11, 0x22, 0x33, 0x44, 0x55];
    const STA2: [u8; 6] = [0x02, 0xaa, 0xbb, 0xcc, 0xdd, 0xee];
    const PMK: [u8; 32] = [0x42; 32];
    const IFINDEX: u32 = 7;

    fn config() -> ApConfig {
        ApConfig::new(b"Net".to_vec(), PMK, 2412)
    }

    fn started_ap(driver: &mut FakeDriver) -> AccessPoint {
        let mut ap = AccessPoint::new(IFINDEX, AP_ADDR, config());
        ap.start(driver).unwrap();
        let start_id = driver
            .submitted
            .iter()
            .find(|(_, c)| c.cmd == cmd::START_AP)
            .map(|(id, _)| *id)
            .unwrap();
        ap.on_command_complete(driver, start_id, CommandOutcome::Ack);
        assert!(ap.take_events().contains(&ApEvent::Started));
        ap
    }

    fn auth_frame(from: [u8; 6]) -> Vec<u8> {
        mgmt::build_frame(
            MgmtSubtype::Authentication,
            AP_ADDR,
            from,
            AP_ADDR,
            &AuthBody { algorithm: AUTH_ALGO_OPEN, transaction: 1, status: 0, ies: vec![] }
                .to_bytes(),
        )
    }

    fn rsn_assoc_frame(from: [u8; 6]) -> Vec<u8> {
        let mut ies = build_ssid(b"Net");
        ies.extend_from_slice(&build_rates_elements(&DEFAULT_RATES[..8]));
        ies.extend_from_slice(&Rsne::wpa2_psk().to_bytes());
        mgmt::build_frame(
            MgmtSubtype::AssociationRequest,
            AP_ADDR,
            from,
            AP_ADDR,
            &AssocReqBody { capability: 0x0431, listen_interval: 10, ies }.to_bytes(),
        )
    }

    fn wsc_assoc_frame(from: [u8; 6]) -> Vec<u8> {
        let mut ies = build_ssid(b"Net");
        ies.extend_from_slice(&build_rates_elements(&DEFAULT_RATES[..8]));
        let payload = wsc::AssociationRequest {
            request_type: wsc::REQUEST_TYPE_ENROLLEE_OPEN_8021X,
            version2: true,
        }
        .to_payload();
        ies.extend_from_slice(&wsc::build_wsc_ies(&payload));
        mgmt::build_frame(
            MgmtSubtype::AssociationRequest,
            AP_ADDR,
            from,
            AP_ADDR,
            &AssocReqBody { capability: 0x0421, listen_interval: 10, ies }.to_bytes(),
        )
    }

    fn pbc_probe_frame(from: [u8; 6], uuid: [u8; 16]) -> Vec<u8> {
        let mut payload = Vec::new();
        let push = |out: &mut Vec<u8>, typ: u16, data: &[u8]| {
            out.extend_from_slice(&typ.to_be_bytes());
            out.extend_from_slice(&(data.len() as u16).to_be_bytes());
            out.extend_from_slice(data);
        };
        push(&mut payload, wsc::attr::VERSION, &[0x10]);
        push(&mut payload, wsc::attr::REQUEST_TYPE, &[wsc::REQUEST_TYPE_ENROLLEE_OPEN_8021X]);
        push(
            &mut payload,
            wsc::attr::CONFIG_METHODS,
            &wsc::CONFIG_METHOD_PUSH_BUTTON.to_be_bytes(),
        );
        push(&mut payload, wsc::attr::UUID_E, &uuid);
        push(
            &mut payload,
            wsc::attr::DEVICE_PASSWORD_ID,
            &(wsc::DevicePasswordId::PushButton as u16).to_be_bytes(),
        );

        let mut ies = build_ssid(b"Net");
        ies.extend_from_slice(&build_rates_elements(&DEFAULT_RATES[..8]));
        ies.extend_from_slice(&wsc::build_wsc_ies(&payload));
        mgmt::build_frame(MgmtSubtype::ProbeRequest, AP_ADDR, from, AP_ADDR, &ies)
    }

    /// Decodes the last FRAME command into (subtype, body).
    fn last_tx_frame(driver: &FakeDriver) -> (MgmtSubtype, Vec<u8>) {
        let frames = driver.commands(cmd::FRAME);
        let frame = frames.last().expect("a FRAME command");
        let Some(AttrValue::Bytes(bytes)) = frame.get(attr::FRAME) else {
            panic!("FRAME without frame attribute");
        };
        let (hdr, body) = MgmtHdr::parse(bytes).unwrap();
        (hdr.subtype, body.to_vec())
    }

    fn associate(ap: &mut AccessPoint, driver: &mut FakeDriver, sta: [u8; 6], now: Instant) {
        ap.on_mgmt_frame(driver, &auth_frame(sta), now);
        ap.on_mgmt_frame(driver, &rsn_assoc_frame(sta), now);
        let (subtype, body) = last_tx_frame(driver);
        assert_eq!(subtype, MgmtSubtype::AssociationResponse);
        let resp = AssocRespBody::parse(&body).unwrap();
        assert_eq!(resp.status, StatusCode::Success as u16);

        let resp_id = driver.last_submitted().unwrap().0;
        ap.on_command_complete(driver, resp_id, CommandOutcome::Ack);
    }

    #[test]
    fn deny_list_refuses_authentication_without_record() {
        let mut driver = FakeDriver::new();
        let mut ap = AccessPoint::new(IFINDEX, AP_ADDR, {
            let mut cfg = config();
            cfg.authorized_macs = Some(vec![[0x02, 0, 0, 0, 0, 0x01]]);
            cfg
        });
        ap.start(&mut driver).unwrap();
        let start_id = driver
            .submitted
            .iter()
            .find(|(_, c)| c.cmd == cmd::START_AP)
            .map(|(id, _)| *id)
            .unwrap();
        ap.on_command_complete(&mut driver, start_id, CommandOutcome::Ack);

        ap.on_mgmt_frame(&mut driver, &auth_frame([0x02, 0, 0, 0, 0, 0x02]), Instant::now());

        let (subtype, body) = last_tx_frame(&driver);
        assert_eq!(subtype, MgmtSubtype::Authentication);
        let reply = AuthBody::parse(&body).unwrap();
        assert_eq!(reply.status, StatusCode::Unspecified as u16);
        assert_eq!(reply.transaction, 2);
        assert!(ap.stations.is_empty());
    }

    #[test]
    fn open_auth_creates_station_and_replies() {
        let mut driver = FakeDriver::new();
        let mut ap = started_ap(&mut driver);

        ap.on_mgmt_frame(&mut driver, &auth_frame(STA1), Instant::now());
        let (subtype, body) = last_tx_frame(&driver);
        assert_eq!(subtype, MgmtSubtype::Authentication);
        assert_eq!(AuthBody::parse(&body).unwrap().status, 0);
        assert_eq!(ap.stations.len(), 1);
        assert!(ap.stations[0].authenticated);
    }

    #[test]
    fn association_assigns_monotonic_aids() {
        let mut driver = FakeDriver::new();
        let mut ap = started_ap(&mut driver);
        let now = Instant::now();

        associate(&mut ap, &mut driver, STA1, now);
        associate(&mut ap, &mut driver, STA2, now);

        let aids: Vec<u16> = ap.stations.iter().map(|sta| sta.aid).collect();
        assert_eq!(aids, vec![1, 2]);
        let info = ap.station_info(STA1).unwrap();
        assert!(info.associated);
        assert_eq!(info.aid, 1);
        assert!(!info.assoc_ies.is_empty());
        assert!(aids.iter().all(|aid| (1..=MAX_AID).contains(aid)));
        // No duplicate AIDs among simultaneously associated stations.
        let mut deduped = aids.clone();
        deduped.dedup();
        assert_eq!(deduped.len(), aids.len());
    }

    #[test]
    fn tkip_only_client_rejected_with_pairwise_status() {
        let mut driver = FakeDriver::new();
        let mut ap = started_ap(&mut driver);
        let now = Instant::now();
        ap.on_mgmt_frame(&mut driver, &auth_frame(STA1), now);

        let mut tkip = Rsne::wpa2_psk();
        tkip.pairwise_ciphers = CipherSuite::Tkip as u16;
        let mut ies = build_ssid(b"Net");
        ies.extend_from_slice(&build_rates_elements(&DEFAULT_RATES[..8]));
        ies.extend_from_slice(&tkip.to_bytes());
        let frame = mgmt::build_frame(
            MgmtSubtype::AssociationRequest,
            AP_ADDR,
            STA1,
            AP_ADDR,
            &AssocReqBody { capability: 0x0431, listen_interval: 10, ies }.to_bytes(),
        );
        ap.on_mgmt_frame(&mut driver, &frame, now);

        let (_, body) = last_tx_frame(&driver);
        let resp = AssocRespBody::parse(&body).unwrap();
        assert_eq!(resp.status, StatusCode::InvalidPairwiseCipher as u16);
    }

    #[test]
    fn full_rsna_establishment() {
        let mut driver = FakeDriver::new();
        let mut ap = started_ap(&mut driver);
        let now = Instant::now();

        associate(&mut ap, &mut driver, STA1, now);
        assert_eq!(driver.commands(cmd::NEW_STATION).len(), 1);

        // GTK creation: NEW_KEY then GET_KEY for the kernel's Tx RSC.
        let gtk_new_id = driver
            .submitted
            .iter()
            .rev()
            .find(|(_, c)| c.cmd == cmd::NEW_KEY)
            .map(|(id, _)| *id)
            .unwrap();
        ap.on_command_complete(&mut driver, gtk_new_id, CommandOutcome::Ack);
        let get_key_id = driver.last_submitted().unwrap().0;
        assert_eq!(driver.last_submitted().unwrap().1.cmd, cmd::GET_KEY);
        ap.on_command_complete(
            &mut driver,
            get_key_id,
            CommandOutcome::Response(airlock_netlink::genl::GenlResponse {
                cmd: cmd::NEW_KEY,
                attrs: vec![(attr::KEY_SEQ, vec![5, 0, 0, 0, 0, 0])],
            }),
        );

        // Authenticator sent Msg1; run a supplicant peer against it.
        assert_eq!(driver.eapol_tx.len(), 1);
        let mut hs = Handshake::new(HandshakeConfig {
            spa: STA1,
            aa: AP_ADDR,
            ssid: b"Net".to_vec(),
        });
        hs.set_own_ie(&Rsne::wpa2_psk().to_bytes()).unwrap();
        hs.set_ap_ie(&Rsne::wpa2_psk().to_bytes()).unwrap();
        hs.set_pmk(PMK).unwrap();
        let mut supplicant = Supplicant::new(hs).unwrap();

        let msg1 = KeyFrame::parse(&driver.eapol_tx[0].1).unwrap();
        let mut sink = Vec::new();
        supplicant.on_eapol_frame(&msg1, &mut sink);
        let msg2 = sink
            .iter()
            .find_map(|u| match u {
                Update::TxFrame(f) => Some(f.clone()),
                _ => None,
            })
            .unwrap();
        ap.on_eapol_pdu(&mut driver, STA1, &msg2);

        let msg3 = KeyFrame::parse(&driver.eapol_tx.last().unwrap().1).unwrap();
        sink.clear();
        supplicant.on_eapol_frame(&msg3, &mut sink);
        let msg4 = sink
            .iter()
            .find_map(|u| match u {
                Update::TxFrame(f) => Some(f.clone()),
                _ => None,
            })
            .unwrap();
        ap.on_eapol_pdu(&mut driver, STA1, &msg4);

        assert!(ap.take_events().contains(&ApEvent::StationAdded { mac: STA1 }));
        assert!(ap.stations[0].rsna);
        // Pairwise key installed for the station, then authorization.
        let pairwise: Vec<_> = driver
            .commands(cmd::NEW_KEY)
            .into_iter()
            .filter(|c| c.get(attr::MAC).is_some())
            .collect();
        assert_eq!(pairwise.len(), 1);
        assert_eq!(driver.commands(cmd::SET_STATION).len(), 1);
    }

    #[test]
    fn pbc_session_overlap_exits_before_probe_response() {
        let mut driver = FakeDriver::new();
        let mut ap = started_ap(&mut driver);
        let t0 = Instant::now();

        ap.push_button(&mut driver, t0).unwrap();
        assert!(ap.pbc_mode);
        let beacon_id = driver
            .submitted
            .iter()
            .rev()
            .find(|(_, c)| c.cmd == cmd::SET_BEACON)
            .map(|(id, _)| *id)
            .unwrap();
        ap.on_command_complete(&mut driver, beacon_id, CommandOutcome::Ack);

        ap.on_mgmt_frame(&mut driver, &pbc_probe_frame(STA1, [1; 16]), t0);
        assert!(ap.pbc_mode);
        driver.submitted.clear();

        // Second distinct PBC enrollee 500 ms later: session overlap.
        ap.on_mgmt_frame(
            &mut driver,
            &pbc_probe_frame(STA2, [2; 16]),
            t0 + Duration::from_millis(500),
        );
        assert!(!ap.pbc_mode);
        assert!(ap.take_events().contains(&ApEvent::PbcModeExit));

        // The beacon update (clearing Selected Registrar) precedes the
        // probe response transmission.
        let order: Vec<u8> = driver.submitted.iter().map(|(_, c)| c.cmd).collect();
        let beacon_pos = order.iter().position(|c| *c == cmd::SET_BEACON).unwrap();
        let frame_pos = order.iter().position(|c| *c == cmd::FRAME).unwrap();
        assert!(beacon_pos < frame_pos);

        // A WSC association attempt from either enrollee is now refused.
        ap.on_mgmt_frame(&mut driver, &auth_frame(STA1), t0 + Duration::from_secs(1));
        ap.on_mgmt_frame(&mut driver, &wsc_assoc_frame(STA1), t0 + Duration::from_secs(1));
        let (subtype, body) = last_tx_frame(&driver);
        assert_eq!(subtype, MgmtSubtype::AssociationResponse);
        assert_eq!(
            AssocRespBody::parse(&body).unwrap().status,
            StatusCode::Unspecified as u16
        );
    }

    #[test]
    fn push_button_refused_during_overlap_window() {
        let mut driver = FakeDriver::new();
        let mut ap = started_ap(&mut driver);
        let t0 = Instant::now();

        ap.on_mgmt_frame(&mut driver, &pbc_probe_frame(STA1, [1; 16]), t0);
        ap.on_mgmt_frame(
            &mut driver,
            &pbc_probe_frame(STA2, [2; 16]),
            t0 + Duration::from_secs(1),
        );

        assert!(ap.push_button(&mut driver, t0 + Duration::from_secs(2)).is_err());

        // Once the monitor window slides past both records, the button
        // works again.
        ap.push_button(&mut driver, t0 + PBC_MONITOR_TIME + Duration::from_secs(1)).unwrap();
        assert!(ap.pbc_mode);
    }

    #[test]
    fn wsc_registration_path_starts_and_completes() {
        let mut driver = FakeDriver::new();
        let mut ap = started_ap(&mut driver);
        let t0 = Instant::now();

        ap.push_button(&mut driver, t0).unwrap();
        ap.on_mgmt_frame(&mut driver, &pbc_probe_frame(STA1, [7; 16]), t0);
        ap.on_mgmt_frame(&mut driver, &auth_frame(STA1), t0);
        ap.on_mgmt_frame(&mut driver, &wsc_assoc_frame(STA1), t0 + Duration::from_secs(1));

        let events = ap.take_events();
        assert!(events.contains(&ApEvent::RegistrationStart { mac: STA1 }));
        // Starting the registration protocol leaves active PBC mode.
        assert!(events.contains(&ApEvent::PbcModeExit));

        let (subtype, body) = last_tx_frame(&driver);
        assert_eq!(subtype, MgmtSubtype::AssociationResponse);
        let resp = AssocRespBody::parse(&body).unwrap();
        assert_eq!(resp.status, 0);
        // The response carries the WSC association response payload.
        assert!(wsc::extract_wsc_payload(&resp.ies).unwrap().is_some());

        // Ack the association response transmission (a beacon update may
        // have been submitted after it).
        let resp_id = driver
            .submitted
            .iter()
            .rev()
            .find(|(_, c)| c.cmd == cmd::FRAME)
            .map(|(id, _)| *id)
            .unwrap();
        ap.on_command_complete(&mut driver, resp_id, CommandOutcome::Ack);

        ap.credential_delivered(STA1);
        assert!(ap.take_events().contains(&ApEvent::RegistrationSuccess { mac: STA1 }));
        // Purged records: the same enrollee's next press is not an
        // overlap.
        assert!(ap.pbc_probes.is_empty());
    }

    #[test]
    fn deauthentication_removes_station() {
        let mut driver = FakeDriver::new();
        let mut ap = started_ap(&mut driver);
        let now = Instant::now();
        associate(&mut ap, &mut driver, STA1, now);
        ap.take_events();

        let deauth = mgmt::build_frame(
            MgmtSubtype::Deauthentication,
            AP_ADDR,
            STA1,
            AP_ADDR,
            &DeauthBody { reason: ReasonCode::DeauthLeaving as u16 }.to_bytes(),
        );
        ap.on_mgmt_frame(&mut driver, &deauth, now);

        assert!(ap.stations.is_empty());
        assert!(ap.take_events().contains(&ApEvent::StationRemoved { mac: STA1 }));
        assert_eq!(driver.commands(cmd::DEL_STATION).len(), 1);
    }
}
