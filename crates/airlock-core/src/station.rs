//! STA-role connection state machine.
//!
//! One `Station` per managed interface. The lifecycle is
//! `Idle -> Connecting -> FourWay -> SettingKeys -> Operational`, with a
//! `FtAuthenticating -> FtReassociating` side path entered from
//! `Operational` when the upper layer requests a fast transition, and
//! `Disconnecting`/`Aborting` on the way back down. Exactly one
//! `Operational` or `ConnectFailed` event is emitted per connect attempt.

use std::collections::VecDeque;
use std::time::Duration;

use airlock_crypto::{ft as ft_crypto, keywrap};
use airlock_eapol::frame::{packet_type, KeyFrame, PacketType};
use airlock_eapol::handshake::{Handshake, HandshakeConfig};
use airlock_eapol::{Supplicant, Update};
use airlock_ie::{eid, rsne, tlv, AkmSuite, CipherSuite, Fte, Rsne};
use airlock_mpdu::{MgmtBody, MgmtHdr, ReasonCode, AUTH_ALGO_FT};
use airlock_netlink::genl::{CommandId, CommandOutcome, GenlCmd, GenlResponse};
use airlock_netlink::nl80211::{self, attr, cmd, cqm};
use airlock_netlink::rtnl::{LinkMode, OperState};
use tracing::{debug, info, warn};

use crate::driver::{Driver, TimerKind};
use crate::events::{ConnectError, DisconnectReason, StationEvent};
use crate::{CoreError, Result};

const EAPOL_TIMEOUT: Duration = Duration::from_secs(1);
const NEIGHBOR_REPORT_TIMEOUT: Duration = Duration::from_secs(3);

const CATEGORY_RADIO_MEASUREMENT: u8 = 5;
const ACTION_NEIGHBOR_REPORT_REQUEST: u8 = 4;
const ACTION_NEIGHBOR_REPORT_RESPONSE: u8 = 5;

/// Target BSS description for a connect attempt.
#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub bssid: [u8; 6],
    pub frequency: u32,
    pub ssid: Vec<u8>,
    /// The RSNE the BSS advertises, with element framing. `None` means
    /// an open network.
    pub beacon_rsne: Option<Vec<u8>>,
    /// The advertised MDE, verbatim, when the BSS is in a mobility
    /// domain.
    pub mde: Option<Vec<u8>>,
    pub pmk: Option<[u8; 32]>,
    /// Request management frame protection when the BSS is capable.
    pub mfp: bool,
}

/// Target BSS for a fast transition out of the current association.
#[derive(Debug, Clone)]
pub struct FtTarget {
    pub bssid: [u8; 6],
    pub frequency: u32,
    pub beacon_rsne: Vec<u8>,
    pub mde: Vec<u8>,
}

/// Optional post-connect behaviors.
#[derive(Debug, Clone, Default)]
pub struct StationConfig {
    /// Arm the kernel CQM monitor with (threshold dBm, hysteresis dB).
    pub rssi_monitor: Option<(i32, u32)>,
    /// Push KEK/KCK/replay-counter into the kernel after the 4-way so
    /// group rekeys are handled without waking us.
    pub rekey_offload: bool,
}

enum State {
    Idle,
    Connecting {
        cmd_id: Option<CommandId>,
    },
    FourWay,
    SettingKeys {
        current: CommandId,
        queue: VecDeque<GenlCmd>,
    },
    Operational,
    FtAuthenticating {
        cmd_id: Option<CommandId>,
        ft: Box<FtContext>,
    },
    FtReassociating {
        cmd_id: Option<CommandId>,
        ft: Box<FtContext>,
    },
    /// Tear-down after a failure already reported; no further events.
    Aborting {
        cmd_id: CommandId,
    },
    /// User-initiated disconnect awaiting its ack.
    Disconnecting {
        cmd_id: CommandId,
        reason: DisconnectReason,
    },
}

struct FtContext {
    target: FtTarget,
    prev_bssid: [u8; 6],
    hs: Option<Handshake>,
}

pub struct Station {
    ifindex: u32,
    addr: [u8; 6],
    config: StationConfig,
    state: State,

    bssid: [u8; 6],
    frequency: u32,
    ssid: Vec<u8>,

    /// The key ladder between connect() and the supplicant taking over.
    hs: Option<Handshake>,
    supplicant: Option<Supplicant>,
    /// EAPoL frames that raced the CONNECT event.
    early_eapol: Vec<Vec<u8>>,

    events: Vec<StationEvent>,
}

impl Station {
    pub fn new(ifindex: u32, addr: [u8; 6], config: StationConfig) -> Station {
        Station {
            ifindex,
            addr,
            config,
            state: State::Idle,
            bssid: [0; 6],
            frequency: 0,
            ssid: Vec::new(),
            hs: None,
            supplicant: None,
            early_eapol: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn ifindex(&self) -> u32 {
        self.ifindex
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::Idle)
    }

    pub fn is_operational(&self) -> bool {
        matches!(self.state, State::Operational)
    }

    /// Drains events for the upper layer, in emission order.
    pub fn take_events(&mut self) -> Vec<StationEvent> {
        std::mem::take(&mut self.events)
    }

    fn emit(&mut self, event: StationEvent) {
        self.events.push(event);
    }

    /// Starts a connection attempt. The CONNECT result arrives through
    /// `on_mlme_event`.
    pub fn connect(&mut self, driver: &mut dyn Driver, params: ConnectParams) -> Result<()> {
        if !matches!(self.state, State::Idle) {
            return Err(CoreError::InProgress);
        }

        let mut hs = Handshake::new(HandshakeConfig {
            spa: self.addr,
            aa: params.bssid,
            ssid: params.ssid.clone(),
        });

        let mut ies = Vec::new();
        let rsn_attrs = match &params.beacon_rsne {
            Some(beacon_rsne) => {
                let pmk =
                    params.pmk.ok_or(CoreError::InvalidArgs("an RSN connect requires a PMK"))?;
                let own_rsne = build_own_rsne(beacon_rsne, params.mde.is_some(), params.mfp)?;

                hs.set_ap_ie(beacon_rsne)?;
                hs.set_own_ie(&own_rsne)?;
                hs.set_pmk(pmk)?;
                ies.extend_from_slice(&own_rsne);

                let pairwise = hs.pairwise_cipher().expect("own RSNE has one pairwise");
                let group = hs.group_cipher().unwrap_or(CipherSuite::Ccmp);
                let akm = hs.akm().expect("own RSNE has one AKM");
                Some(nl80211::ConnectRsn {
                    pairwise_selector: pairwise.to_cipher_selector(),
                    group_selector: group.to_cipher_selector(),
                    akm_selector: akm.to_akm_selector(),
                    mfp: hs.mfp(),
                })
            }
            None => None,
        };

        if let Some(mde) = &params.mde {
            hs.set_mde(mde)?;
            ies.extend_from_slice(mde);
        }

        let connect_cmd = nl80211::connect(
            self.ifindex,
            &params.ssid,
            params.bssid,
            params.frequency,
            rsn_attrs.as_ref(),
            &ies,
            None,
        );
        let cmd_id = driver.submit(connect_cmd);

        self.bssid = params.bssid;
        self.frequency = params.frequency;
        self.ssid = params.ssid;
        self.hs = Some(hs);
        self.supplicant = None;
        self.early_eapol.clear();
        self.state = State::Connecting { cmd_id: Some(cmd_id) };
        self.emit(StationEvent::Connecting);
        info!(ifindex = self.ifindex, "connecting to {:02x?}", self.bssid);
        Ok(())
    }

    /// Tears the connection down. Sends exactly one DEAUTHENTICATE no
    /// matter how many times it is called.
    pub fn disconnect(&mut self, driver: &mut dyn Driver) -> Result<()> {
        if matches!(self.state, State::Idle) {
            return Err(CoreError::NotConnected);
        }
        if matches!(self.state, State::Disconnecting { .. } | State::Aborting { .. }) {
            return Ok(());
        }

        self.cancel_outstanding(driver);
        let mid_attempt = matches!(
            self.state,
            State::Connecting { .. } | State::FourWay | State::SettingKeys { .. }
        );
        if mid_attempt {
            self.emit(StationEvent::ConnectFailed(ConnectError::Aborted));
            self.send_disconnect(driver, DisconnectReason::BySme, false);
        } else {
            self.send_disconnect(driver, DisconnectReason::BySme, true);
        }
        Ok(())
    }

    fn cancel_outstanding(&self, driver: &mut dyn Driver) {
        match &self.state {
            State::Connecting { cmd_id }
            | State::FtAuthenticating { cmd_id, .. }
            | State::FtReassociating { cmd_id, .. } => {
                if let Some(id) = cmd_id {
                    driver.cancel(*id);
                }
            }
            State::SettingKeys { current, .. } => driver.cancel(*current),
            _ => {}
        }
        driver.stop_timer(TimerKind::EapolRetransmit(self.bssid));
    }

    fn send_disconnect(&mut self, driver: &mut dyn Driver, reason: DisconnectReason, notify: bool) {
        let cmd = nl80211::deauthenticate(
            self.ifindex,
            self.bssid,
            ReasonCode::DeauthLeaving as u16,
        );
        let cmd_id = driver.submit(cmd);
        self.teardown_keys();
        self.state = if notify {
            State::Disconnecting { cmd_id, reason }
        } else {
            State::Aborting { cmd_id }
        };
    }

    fn teardown_keys(&mut self) {
        // Dropping the ladder zeroizes PMK, PTK and group keys.
        if let Some(mut hs) = self.hs.take() {
            hs.secure_erase();
        }
        self.supplicant = None;
        self.early_eapol.clear();
    }

    fn fail_connect(&mut self, driver: &mut dyn Driver, error: ConnectError) {
        warn!(ifindex = self.ifindex, "connection attempt failed: {error:?}");
        self.cancel_outstanding(driver);
        self.emit(StationEvent::ConnectFailed(error));

        let cmd = nl80211::deauthenticate(
            self.ifindex,
            self.bssid,
            ReasonCode::Unspecified as u16,
        );
        let cmd_id = driver.submit(cmd);
        self.teardown_keys();
        self.state = State::Aborting { cmd_id };
    }

    /// Completion of a command this FSM submitted. Unknown ids (e.g.
    /// fire-and-forget group rekey installs) are ignored.
    pub fn on_command_complete(
        &mut self,
        driver: &mut dyn Driver,
        id: CommandId,
        outcome: CommandOutcome,
    ) {
        match &mut self.state {
            State::Connecting { cmd_id } if *cmd_id == Some(id) => {
                match outcome {
                    CommandOutcome::Error(errno) => {
                        debug!(errno, "CONNECT rejected by kernel");
                        self.emit(StationEvent::ConnectFailed(ConnectError::AssociationFailed(0)));
                        self.teardown_keys();
                        self.state = State::Idle;
                    }
                    _ => *cmd_id = None,
                }
            }
            State::FtAuthenticating { cmd_id, .. } if *cmd_id == Some(id) => match outcome {
                CommandOutcome::Error(errno) => {
                    debug!(errno, "AUTHENTICATE rejected by kernel");
                    self.fail_connect(driver, ConnectError::AuthenticationFailed);
                }
                _ => *cmd_id = None,
            },
            State::FtReassociating { cmd_id, .. } if *cmd_id == Some(id) => match outcome {
                CommandOutcome::Error(errno) => {
                    debug!(errno, "ASSOCIATE rejected by kernel");
                    self.fail_connect(driver, ConnectError::AssociationFailed(0));
                }
                _ => *cmd_id = None,
            },
            State::SettingKeys { current, queue } if *current == id => match outcome {
                CommandOutcome::Ack | CommandOutcome::Response(_) => {
                    if let Some(next) = queue.pop_front() {
                        *current = driver.submit(next);
                    } else {
                        self.finish_connect(driver);
                    }
                }
                CommandOutcome::Error(errno) => {
                    warn!(errno, "key installation failed");
                    self.fail_connect(driver, ConnectError::KeySettingFailed);
                }
            },
            State::Aborting { cmd_id } if *cmd_id == id => {
                self.state = State::Idle;
            }
            State::Disconnecting { cmd_id, reason } if *cmd_id == id => {
                let reason = *reason;
                self.state = State::Idle;
                self.emit(StationEvent::Disconnected(reason));
            }
            _ => {}
        }
    }

    /// An nl80211 multicast notification for this interface.
    pub fn on_mlme_event(&mut self, driver: &mut dyn Driver, event: &GenlResponse) {
        match event.cmd {
            cmd::CONNECT => self.on_connect_event(driver, event),
            cmd::AUTHENTICATE => self.on_authenticate_event(driver, event),
            cmd::ASSOCIATE => self.on_associate_event(driver, event),
            cmd::DISCONNECT | cmd::DEAUTHENTICATE => self.on_disconnect_event(event),
            cmd::NOTIFY_CQM => self.on_cqm_event(event),
            cmd::SET_REKEY_OFFLOAD => self.on_rekey_event(event),
            cmd::FRAME => self.on_action_frame(driver, event),
            other => debug!(cmd = other, "unhandled MLME event"),
        }
    }

    /// Asks the current AP for a radio-measurement neighbor report;
    /// candidates come back as `RoamingCandidate` events within the
    /// response window.
    pub fn request_neighbor_report(&mut self, driver: &mut dyn Driver) -> Result<()> {
        if !matches!(self.state, State::Operational) {
            return Err(CoreError::NotConnected);
        }

        let body = [CATEGORY_RADIO_MEASUREMENT, ACTION_NEIGHBOR_REPORT_REQUEST, 1];
        let frame = airlock_mpdu::mgmt::build_frame(
            airlock_mpdu::MgmtSubtype::Action,
            self.bssid,
            self.addr,
            self.bssid,
            &body,
        );
        driver.submit(nl80211::frame_tx(self.ifindex, self.frequency, &frame));
        driver.start_timer(TimerKind::NeighborReport, NEIGHBOR_REPORT_TIMEOUT);
        Ok(())
    }

    /// Radio-measurement neighbor reports surface roam targets for the
    /// FT path.
    fn on_action_frame(&mut self, driver: &mut dyn Driver, event: &GenlResponse) {
        if !matches!(self.state, State::Operational) {
            return;
        }
        let Some(frame) = event.get(attr::FRAME) else { return };
        let Ok((hdr, body)) = MgmtHdr::parse(frame) else { return };
        if hdr.subtype != airlock_mpdu::MgmtSubtype::Action || body.len() < 3 {
            return;
        }
        if body[0] != CATEGORY_RADIO_MEASUREMENT || body[1] != ACTION_NEIGHBOR_REPORT_RESPONSE {
            return;
        }
        driver.stop_timer(TimerKind::NeighborReport);

        // Category, action, dialog token, then the report elements.
        const EID_NEIGHBOR_REPORT: u8 = 52;
        for element in tlv::TlvIterator::new(&body[3..]).flatten() {
            if element.tag == EID_NEIGHBOR_REPORT && element.data.len() >= 6 {
                let mut bssid = [0u8; 6];
                bssid.copy_from_slice(&element.data[..6]);
                if bssid != self.bssid {
                    self.emit(StationEvent::RoamingCandidate { bssid });
                }
            }
        }
    }

    fn on_connect_event(&mut self, driver: &mut dyn Driver, event: &GenlResponse) {
        if !matches!(self.state, State::Connecting { .. }) {
            debug!("CONNECT event outside of Connecting");
            return;
        }

        let status = event.get_u16(attr::STATUS_CODE).unwrap_or(u16::MAX);
        if status != 0 || event.has(attr::TIMED_OUT) {
            self.emit(StationEvent::ConnectFailed(ConnectError::AssociationFailed(status)));
            self.teardown_keys();
            self.state = State::Idle;
            return;
        }

        let resp_ies = event.get(attr::RESP_IE).unwrap_or(&[]).to_vec();
        let validated = {
            let hs = self.hs.as_mut().expect("handshake exists while Connecting");
            validate_association_ies(hs, &resp_ies)
        };
        if let Err(err) = validated {
            debug!("association response IEs rejected: {err:?}");
            self.fail_connect(driver, ConnectError::InvalidIe);
            return;
        }

        let is_rsn =
            self.hs.as_ref().map(|hs| hs.own_ie().is_some()).unwrap_or(false);
        if is_rsn {
            // RSN: hand off to the 4-Way Handshake.
            let hs = self.hs.take().expect("checked above");
            match Supplicant::new(hs) {
                Ok(supplicant) => {
                    self.supplicant = Some(supplicant);
                    self.state = State::FourWay;
                    self.emit(StationEvent::FourWayHandshake);
                    let early: Vec<_> = std::mem::take(&mut self.early_eapol);
                    for pdu in early {
                        self.on_eapol_pdu(driver, &pdu);
                    }
                }
                Err(err) => {
                    warn!("cannot start supplicant: {err}");
                    self.fail_connect(driver, ConnectError::InvalidIe);
                }
            }
        } else {
            // Open network: no keys to install.
            self.finish_connect(driver);
        }
    }

    fn finish_connect(&mut self, driver: &mut dyn Driver) {
        driver.set_link_mode(LinkMode::Dormant, OperState::Up);
        self.state = State::Operational;
        self.emit(StationEvent::Operational);
        info!(ifindex = self.ifindex, frequency = self.frequency, "link operational");

        if let Some((threshold, hysteresis)) = self.config.rssi_monitor {
            driver.submit(nl80211::set_cqm_rssi(self.ifindex, threshold, hysteresis));
        }
        if self.config.rekey_offload {
            if let Some(ptk) = self.supplicant.as_ref().and_then(|s| s.handshake().ptk()) {
                driver.submit(nl80211::set_rekey_offload(self.ifindex, ptk.kek(), ptk.kck(), 0));
            }
        }
    }

    /// EAPoL PDU from the control port.
    pub fn on_eapol_pdu(&mut self, driver: &mut dyn Driver, pdu: &[u8]) {
        match self.state {
            State::Connecting { .. } => {
                // Msg1 can outrun the CONNECT event; hold on to it.
                if self.early_eapol.len() < 4 {
                    self.early_eapol.push(pdu.to_vec());
                }
                return;
            }
            State::FourWay | State::Operational => {}
            _ => return,
        }

        if packet_type(pdu) != Ok(PacketType::Key) {
            return;
        }
        let frame = match KeyFrame::parse(pdu) {
            Ok(frame) => frame,
            Err(err) => {
                debug!("dropping unparseable EAPoL frame: {err}");
                return;
            }
        };

        let Some(supplicant) = self.supplicant.as_mut() else { return };
        let mut sink = Vec::new();
        supplicant.on_eapol_frame(&frame, &mut sink);
        self.process_eapol_updates(driver, sink);
    }

    /// The EAPoL retransmit timer fired.
    pub fn on_timeout(&mut self, driver: &mut dyn Driver, kind: TimerKind) {
        if kind != TimerKind::EapolRetransmit(self.bssid) {
            return;
        }
        let Some(supplicant) = self.supplicant.as_mut() else { return };
        let mut sink = Vec::new();
        supplicant.on_timeout(&mut sink);
        self.process_eapol_updates(driver, sink);
    }

    fn process_eapol_updates(&mut self, driver: &mut dyn Driver, sink: Vec<Update>) {
        let mut keys: VecDeque<GenlCmd> = VecDeque::new();
        let mut complete = false;

        for update in sink {
            match update {
                Update::TxFrame(pdu) => driver.tx_eapol(self.bssid, &pdu),
                Update::StartTimer => {
                    driver.start_timer(TimerKind::EapolRetransmit(self.bssid), EAPOL_TIMEOUT)
                }
                Update::StopTimer => driver.stop_timer(TimerKind::EapolRetransmit(self.bssid)),
                Update::NewPtk { tk, cipher_selector } => {
                    keys.push_back(nl80211::new_pairwise_key(
                        self.ifindex,
                        self.bssid,
                        cipher_selector,
                        &tk,
                    ));
                    keys.push_back(nl80211::set_pairwise_key_default(self.ifindex, self.bssid));
                }
                Update::NewGtk { index, key, rsc, cipher_selector } => {
                    keys.push_back(nl80211::new_group_key(
                        self.ifindex,
                        index,
                        cipher_selector,
                        &key,
                        rsc,
                    ));
                }
                Update::NewIgtk { index, key, ipn } => {
                    keys.push_back(nl80211::new_mgmt_group_key(
                        self.ifindex,
                        index,
                        CipherSuite::BipCmac128.to_cipher_selector(),
                        &key,
                        ipn,
                    ));
                }
                Update::Complete => complete = true,
                Update::Failed(failure) => {
                    if matches!(self.state, State::Operational) {
                        // A failed group rekey drops the link.
                        self.emit(StationEvent::Disconnected(DisconnectReason::BySme));
                        self.send_disconnect_quiet(driver);
                    } else {
                        self.fail_connect(driver, ConnectError::HandshakeFailed(failure));
                    }
                    return;
                }
            }
        }

        if complete && matches!(self.state, State::FourWay) {
            keys.push_back(nl80211::set_station_authorized(self.ifindex, self.bssid));
            self.start_key_installation(driver, keys);
        } else if matches!(self.state, State::Operational) {
            // Group rekey: install in order, completions are not gated.
            for cmd in keys {
                driver.submit(cmd);
            }
        }
    }

    fn start_key_installation(&mut self, driver: &mut dyn Driver, mut queue: VecDeque<GenlCmd>) {
        self.emit(StationEvent::SettingKeys);
        let first = queue.pop_front().expect("at least the pairwise key");
        let current = driver.submit(first);
        self.state = State::SettingKeys { current, queue };
    }

    fn send_disconnect_quiet(&mut self, driver: &mut dyn Driver) {
        let cmd = nl80211::deauthenticate(
            self.ifindex,
            self.bssid,
            ReasonCode::Unspecified as u16,
        );
        let cmd_id = driver.submit(cmd);
        self.teardown_keys();
        self.state = State::Aborting { cmd_id };
    }

    fn on_disconnect_event(&mut self, event: &GenlResponse) {
        match self.state {
            State::Idle | State::Aborting { .. } | State::Disconnecting { .. } => return,
            _ => {}
        }

        let by_ap = event.has(attr::DISCONNECTED_BY_AP);
        let reason =
            if by_ap { DisconnectReason::ByPeer } else { DisconnectReason::LostBeacon };
        info!(ifindex = self.ifindex, "disconnected ({reason:?})");

        if !matches!(self.state, State::Operational) {
            self.emit(StationEvent::ConnectFailed(ConnectError::AssociationFailed(
                event.get_u16(attr::REASON_CODE).unwrap_or(0),
            )));
        } else {
            self.emit(StationEvent::Disconnected(reason));
        }
        self.teardown_keys();
        self.state = State::Idle;
    }

    fn on_cqm_event(&mut self, event: &GenlResponse) {
        let Some(nested) = event.get_nested(attr::CQM) else { return };
        for (typ, payload) in nested {
            if typ == cqm::RSSI_THRESHOLD_EVENT && payload.len() == 4 {
                let which = u32::from_ne_bytes(payload.try_into().unwrap());
                self.emit(if which == cqm::EVENT_HIGH {
                    StationEvent::RssiHigh
                } else {
                    StationEvent::RssiLow
                });
            }
        }
    }

    fn on_rekey_event(&mut self, event: &GenlResponse) {
        let Some(nested) = event.get_nested(attr::REKEY_DATA) else { return };
        let replay = nested
            .iter()
            .find(|(t, _)| *t == nl80211::rekey_data::REPLAY_CTR)
            .and_then(|(_, v)| v.as_slice().try_into().ok())
            .map(u64::from_be_bytes);
        match replay {
            Some(replay) => {
                if let Some(supplicant) = self.supplicant.as_mut() {
                    supplicant.note_offload_replay(replay);
                }
            }
            // The kernel sent rekey data without a replay counter; the
            // event carries nothing we can act on.
            None => debug!("rekey-offload event without replay counter dropped"),
        }
    }

    // --- Fast BSS Transition -------------------------------------------

    /// Starts a fast transition to `target`, which must advertise the
    /// same mobility domain as the current association.
    pub fn fast_transition(&mut self, driver: &mut dyn Driver, target: FtTarget) -> Result<()> {
        if !matches!(self.state, State::Operational) {
            return Err(CoreError::NotConnected);
        }
        let supplicant = self.supplicant.as_ref().ok_or(CoreError::NotSupported(
            "fast transition requires an RSN association",
        ))?;
        let current = supplicant.handshake();
        if current.mde() != Some(target.mde.as_slice()) {
            return Err(CoreError::InvalidArgs("target is in a different mobility domain"));
        }
        if current.akm().map(|a| a.is_ft()) != Some(true) {
            return Err(CoreError::NotSupported("current association is not FT"));
        }

        // Build the transition key ladder from the current one: same
        // PMK, fresh SNonce, target addresses.
        let mut hs = Handshake::new(HandshakeConfig {
            spa: self.addr,
            aa: target.bssid,
            ssid: current.ssid().to_vec(),
        });
        let own_ie =
            current.own_ie().ok_or(CoreError::NotSupported("missing own RSNE"))?.to_vec();
        let pmk = *current.pmk().ok_or(CoreError::NotSupported("missing PMK"))?;
        let r0kh = current
            .r0kh_id()
            .ok_or(CoreError::NotSupported("no R0KH-ID from initial association"))?
            .to_vec();
        let r1kh =
            current.r1kh_id().ok_or(CoreError::NotSupported("no R1KH-ID"))?;

        hs.set_own_ie(&own_ie)?;
        hs.set_ap_ie(&target.beacon_rsne)?;
        hs.set_pmk(pmk)?;
        hs.set_mde(&target.mde)?;
        hs.set_kh_ids(&r0kh, r1kh)?;
        hs.new_snonce()?;
        hs.derive_ft_keys()?;

        // 12.8.4: RSNE with the PMKR0Name as the lone PMKID, the MDE
        // verbatim, and an FTE carrying SNonce and R0KH-ID.
        let mut auth_rsne = Rsne::parse(&own_ie)?;
        auth_rsne.pmkids = vec![*hs.pmk_r0_name().expect("derived above")];
        let fte = Fte {
            snonce: *hs.snonce().expect("generated above"),
            r0kh_id: Some(r0kh),
            ..Fte::default()
        };

        let mut ies = auth_rsne.to_bytes();
        ies.extend_from_slice(&target.mde);
        ies.extend_from_slice(&fte.to_bytes());

        let cmd_id = driver.submit(nl80211::authenticate_ft(
            self.ifindex,
            target.bssid,
            target.frequency,
            &self.ssid,
            &ies,
        ));

        info!(ifindex = self.ifindex, "fast transition to {:02x?}", target.bssid);
        let prev_bssid = self.bssid;
        self.state = State::FtAuthenticating {
            cmd_id: Some(cmd_id),
            ft: Box::new(FtContext { target, prev_bssid, hs: Some(hs) }),
        };
        Ok(())
    }

    fn on_authenticate_event(&mut self, driver: &mut dyn Driver, event: &GenlResponse) {
        if !matches!(self.state, State::FtAuthenticating { .. }) {
            debug!("AUTHENTICATE event outside of FT");
            return;
        }

        let auth = event
            .get(attr::FRAME)
            .filter(|_| !event.has(attr::TIMED_OUT))
            .and_then(|frame| {
                MgmtHdr::parse(frame)
                    .and_then(|(hdr, body)| MgmtBody::parse(hdr.subtype, body))
                    .ok()
            })
            .and_then(|body| match body {
                MgmtBody::Authentication(auth) => Some(auth),
                _ => None,
            });
        let auth = match auth {
            Some(auth)
                if auth.status == 0
                    && auth.algorithm == AUTH_ALGO_FT
                    && auth.transaction == 2 =>
            {
                auth
            }
            _ => {
                self.fail_connect(driver, ConnectError::AuthenticationFailed);
                return;
            }
        };

        let State::FtAuthenticating { ft, .. } =
            std::mem::replace(&mut self.state, State::Idle)
        else {
            unreachable!("state checked above");
        };
        let mut ft = ft;
        let hs = ft.hs.as_mut().expect("ladder exists while FtAuthenticating");
        let reassoc_ies = match process_ft_auth_response(hs, &auth.ies, self.addr) {
            Ok(ies) => ies,
            Err(err) => {
                debug!("FT authenticate response rejected: {err:?}");
                self.fail_connect(driver, ConnectError::AuthenticationFailed);
                return;
            }
        };

        let cmd_id = driver.submit(nl80211::associate_ft(
            self.ifindex,
            ft.target.bssid,
            ft.target.frequency,
            &self.ssid,
            &reassoc_ies,
            ft.prev_bssid,
        ));
        self.state = State::FtReassociating { cmd_id: Some(cmd_id), ft };
    }

    fn on_associate_event(&mut self, driver: &mut dyn Driver, event: &GenlResponse) {
        if !matches!(self.state, State::FtReassociating { .. }) {
            debug!("ASSOCIATE event outside of FT");
            return;
        }

        let resp = event
            .get(attr::FRAME)
            .filter(|_| !event.has(attr::TIMED_OUT))
            .and_then(|frame| {
                MgmtHdr::parse(frame)
                    .and_then(|(hdr, body)| MgmtBody::parse(hdr.subtype, body))
                    .ok()
            })
            .and_then(|body| match body {
                MgmtBody::ReassociationResponse(resp) | MgmtBody::AssociationResponse(resp) => {
                    Some(resp)
                }
                _ => None,
            });
        let resp = match resp {
            Some(resp) => resp,
            None => {
                self.fail_connect(driver, ConnectError::AssociationFailed(0));
                return;
            }
        };
        if resp.status != 0 {
            self.fail_connect(driver, ConnectError::AssociationFailed(resp.status));
            return;
        }

        let State::FtReassociating { ft, .. } =
            std::mem::replace(&mut self.state, State::Idle)
        else {
            unreachable!("state checked above");
        };
        let mut ft = ft;
        let mut hs = ft.hs.take().expect("ladder exists while FtReassociating");
        let target = ft.target.clone();
        match validate_ft_reassoc_ies(&mut hs, &resp.ies, self.addr) {
            Ok(()) => {}
            Err(err) => {
                debug!("FT reassociation response rejected: {err:?}");
                self.fail_connect(driver, ConnectError::InvalidIe);
                return;
            }
        }

        // Transition complete at the MAC layer; install the FT-derived
        // PTK directly, no 4-Way Handshake.
        self.bssid = target.bssid;
        self.frequency = target.frequency;

        let mut keys = VecDeque::new();
        let pairwise = hs.pairwise_cipher().unwrap_or(CipherSuite::Ccmp);
        let tk = hs.ptk().expect("derived during authenticate").tk().to_vec();
        keys.push_back(nl80211::new_pairwise_key(
            self.ifindex,
            self.bssid,
            pairwise.to_cipher_selector(),
            &tk,
        ));
        keys.push_back(nl80211::set_pairwise_key_default(self.ifindex, self.bssid));
        if let Some(gtk) = hs.gtk() {
            let group = hs.group_cipher().unwrap_or(CipherSuite::Ccmp);
            keys.push_back(nl80211::new_group_key(
                self.ifindex,
                gtk.index,
                group.to_cipher_selector(),
                &gtk.key,
                gtk.rsc,
            ));
        }
        if let Some(igtk) = hs.igtk() {
            keys.push_back(nl80211::new_mgmt_group_key(
                self.ifindex,
                igtk.index,
                CipherSuite::BipCmac128.to_cipher_selector(),
                &igtk.key,
                igtk.ipn,
            ));
        }
        keys.push_back(nl80211::set_station_authorized(self.ifindex, self.bssid));

        let _ = hs.install_ptk();
        // The frozen ladder stays with a fresh supplicant context so a
        // later transition can read PMK and key-holder identities.
        match Supplicant::new_established(hs) {
            Ok(supplicant) => self.supplicant = Some(supplicant),
            Err(err) => {
                warn!("cannot retain FT ladder: {err}");
                self.supplicant = None;
            }
        }

        self.start_key_installation(driver, keys);
    }
}

/// Builds our RSNE for the association request from the advertised one.
fn build_own_rsne(beacon_rsne: &[u8], has_mde: bool, want_mfp: bool) -> Result<Vec<u8>> {
    let advertised = Rsne::parse(beacon_rsne)?;

    if advertised.pairwise_ciphers & CipherSuite::Ccmp as u16 == 0 {
        return Err(CoreError::NotSupported("BSS does not offer CCMP"));
    }
    let akm = if has_mde && advertised.akm_suites & AkmSuite::FtPsk as u16 != 0 {
        AkmSuite::FtPsk
    } else if advertised.akm_suites & AkmSuite::Psk as u16 != 0 {
        AkmSuite::Psk
    } else if advertised.akm_suites & AkmSuite::PskSha256 as u16 != 0 {
        AkmSuite::PskSha256
    } else {
        return Err(CoreError::NotSupported("BSS offers no PSK key management"));
    };

    let mut own = Rsne {
        group_cipher: advertised.group_cipher.or(Some(CipherSuite::Ccmp)),
        pairwise_ciphers: CipherSuite::Ccmp as u16,
        akm_suites: akm as u16,
        ..Rsne::default()
    };
    if want_mfp && advertised.caps.mfp_capable() {
        own.caps.set_mfp_capable(true);
        own.group_management_cipher =
            advertised.group_management_cipher.or(Some(CipherSuite::BipCmac128));
    }
    Ok(own.to_bytes())
}

/// Validates the association response element section of a CONNECT
/// event (initial association, 12.4.2 for the FT initial case).
fn validate_association_ies(hs: &mut Handshake, resp_ies: &[u8]) -> Result<()> {
    let rsne = tlv::find_unique_raw(resp_ies, eid::RSN)?;
    let mde = tlv::find_unique_raw(resp_ies, eid::MOBILITY_DOMAIN)?;
    let fte = tlv::find_unique_raw(resp_ies, eid::FAST_BSS_TRANSITION)?;

    let is_rsn = hs.own_ie().is_some();
    let sent_mde = hs.mde().map(<[u8]>::to_vec);

    if is_rsn {
        let rsne = rsne.ok_or(CoreError::InvalidArgs("response lacks an RSNE"))?;
        Rsne::parse(rsne)?;
    } else if rsne.is_some() {
        return Err(CoreError::InvalidArgs("unexpected RSNE on an open connection"));
    }

    // The MDE must be echoed bit-exact.
    if let Some(sent) = &sent_mde {
        match mde {
            Some(mde) if mde == sent.as_slice() => {}
            _ => return Err(CoreError::InvalidArgs("response MDE does not match")),
        }
    }

    let expect_fte = sent_mde.is_some() && is_rsn;
    match (expect_fte, fte) {
        (true, Some(fte_raw)) => {
            // 12.4.2: in the initial mobility-domain association the FTE
            // carries the key-holder identities with zeroed nonces and
            // MIC.
            let fte = Fte::parse(fte_raw)?;
            if !fte.is_zeroed_initial() {
                return Err(CoreError::InvalidArgs("initial FTE must be zeroed"));
            }
            let r0kh = fte
                .r0kh_id
                .ok_or(CoreError::InvalidArgs("initial FTE lacks R0KH-ID"))?;
            let r1kh = fte
                .r1kh_id
                .ok_or(CoreError::InvalidArgs("initial FTE lacks R1KH-ID"))?;
            hs.set_fte(fte_raw)?;
            hs.set_kh_ids(&r0kh, r1kh)?;
            hs.derive_ft_keys()?;
        }
        (true, None) => return Err(CoreError::InvalidArgs("FT association lacks an FTE")),
        (false, Some(_)) => return Err(CoreError::InvalidArgs("unexpected FTE")),
        (false, None) => {}
    }

    Ok(())
}

/// Handles the IEs of the FT Authenticate Response (sequence 2) and
/// builds the Reassociation Request element section (12.8.4).
fn process_ft_auth_response(
    hs: &mut Handshake,
    auth_ies: &[u8],
    spa: [u8; 6],
) -> Result<Vec<u8>> {
    let rsne_raw = tlv::find_unique_raw(auth_ies, eid::RSN)?
        .ok_or(CoreError::InvalidArgs("FT response lacks an RSNE"))?;
    let mde_raw = tlv::find_unique_raw(auth_ies, eid::MOBILITY_DOMAIN)?
        .ok_or(CoreError::InvalidArgs("FT response lacks an MDE"))?;
    let fte_raw = tlv::find_unique_raw(auth_ies, eid::FAST_BSS_TRANSITION)?
        .ok_or(CoreError::InvalidArgs("FT response lacks an FTE"))?;

    if hs.mde() != Some(mde_raw) {
        return Err(CoreError::InvalidArgs("FT response MDE differs"));
    }
    let fte = Fte::parse(fte_raw)?;
    if hs.snonce() != Some(&fte.snonce) {
        return Err(CoreError::InvalidArgs("FT response SNonce differs"));
    }
    let r0kh = fte.r0kh_id.clone().ok_or(CoreError::InvalidArgs("FT response lacks R0KH-ID"))?;
    if hs.r0kh_id() != Some(r0kh.as_slice()) {
        return Err(CoreError::InvalidArgs("FT response R0KH-ID differs"));
    }
    let r1kh = fte.r1kh_id.ok_or(CoreError::InvalidArgs("FT response lacks R1KH-ID"))?;

    // The R1KH of the target is authoritative now; re-derive the level-1
    // keys and the PTK from the response's ANonce.
    hs.set_kh_ids(&r0kh, r1kh)?;
    hs.derive_ft_keys()?;
    hs.set_anonce(fte.anonce)?;
    hs.derive_ptk()?;
    hs.set_fte(fte_raw)?;

    // Verify the response RSNE still names our PMK-R0.
    let rsne = Rsne::parse(rsne_raw)?;
    if rsne.pmkids.len() != 1 || Some(&rsne.pmkids[0]) != hs.pmk_r0_name() {
        return Err(CoreError::InvalidArgs("FT response PMKID is not PMKR0Name"));
    }

    // Build the reassociation trio: RSNE with PMKR1Name, MDE verbatim,
    // FTE with a MIC over five elements (12.8.4).
    let mut reassoc_rsne = Rsne::parse(hs.own_ie().expect("own RSNE set"))?;
    reassoc_rsne.pmkids = vec![*hs.pmk_r1_name().expect("derived above")];
    let rsne_bytes = reassoc_rsne.to_bytes();

    let mut out_fte = Fte {
        mic_element_count: 3,
        anonce: fte.anonce,
        snonce: fte.snonce,
        r0kh_id: Some(r0kh),
        r1kh_id: Some(r1kh),
        ..Fte::default()
    };
    let fte_zero_mic = out_fte.to_bytes();
    let kck = hs.ptk().expect("derived above").kck().to_vec();
    let mic = ft_crypto::fte_mic(
        &kck,
        &spa,
        &hs.aa(),
        5,
        &[&rsne_bytes, mde_raw, &fte_zero_mic],
    )?;
    out_fte.mic = mic;

    let mut ies = rsne_bytes;
    ies.extend_from_slice(mde_raw);
    ies.extend_from_slice(&out_fte.to_bytes());
    Ok(ies)
}

/// Validates the FT Reassociation Response IEs (12.8.5) and absorbs the
/// delivered group keys.
fn validate_ft_reassoc_ies(hs: &mut Handshake, resp_ies: &[u8], spa: [u8; 6]) -> Result<()> {
    let rsne_raw = tlv::find_unique_raw(resp_ies, eid::RSN)?
        .ok_or(CoreError::InvalidArgs("reassociation response lacks an RSNE"))?;
    let mde_raw = tlv::find_unique_raw(resp_ies, eid::MOBILITY_DOMAIN)?
        .ok_or(CoreError::InvalidArgs("reassociation response lacks an MDE"))?;
    let fte_raw = tlv::find_unique_raw(resp_ies, eid::FAST_BSS_TRANSITION)?
        .ok_or(CoreError::InvalidArgs("reassociation response lacks an FTE"))?;

    if hs.mde() != Some(mde_raw) {
        return Err(CoreError::InvalidArgs("reassociation MDE differs"));
    }

    // RSNE: one PMKID equal to PMKR1Name, other fields as advertised.
    let rsne = Rsne::parse(rsne_raw)?;
    if rsne.pmkids.len() != 1 || Some(&rsne.pmkids[0]) != hs.pmk_r1_name() {
        return Err(CoreError::InvalidArgs("reassociation PMKID is not PMKR1Name"));
    }
    let ap_ie = hs.ap_ie().ok_or(CoreError::InvalidArgs("no advertised RSNE"))?;
    if !rsne::ap_ie_matches(rsne_raw, ap_ie, true) {
        return Err(CoreError::InvalidArgs("reassociation RSNE differs from advertised"));
    }

    let fte = Fte::parse(fte_raw)?;
    if fte.mic_element_count != 3 {
        return Err(CoreError::InvalidArgs("unexpected FTE MIC element count"));
    }
    if hs.anonce() != Some(&fte.anonce) || hs.snonce() != Some(&fte.snonce) {
        return Err(CoreError::InvalidArgs("reassociation FTE nonces differ"));
    }
    if fte.r0kh_id.as_deref() != hs.r0kh_id() || fte.r1kh_id != hs.r1kh_id() {
        return Err(CoreError::InvalidArgs("reassociation key-holder identities differ"));
    }

    // MIC over six elements for the response direction.
    let mut unsigned = fte.clone();
    unsigned.mic = [0; 16];
    let fte_zero_mic = unsigned.to_bytes();
    let kck = hs.ptk().expect("derived during authenticate").kck().to_vec();
    let mic =
        ft_crypto::fte_mic(&kck, &spa, &hs.aa(), 6, &[rsne_raw, mde_raw, &fte_zero_mic])?;
    if mic != fte.mic {
        return Err(CoreError::InvalidArgs("reassociation FTE MIC mismatch"));
    }

    // Group keys ride in the FTE sub-elements, wrapped under the KEK.
    let kek = hs.ptk().expect("derived").kek().to_vec();
    if let Some(gtk) = &fte.gtk {
        if gtk.rsc[6] != 0 || gtk.rsc[7] != 0 {
            return Err(CoreError::InvalidArgs("GTK RSC out of range"));
        }
        let key = keywrap::unwrap(&kek, &gtk.wrapped_key)?;
        let key = &key[..usize::from(gtk.key_len).min(key.len())];
        let rsc = u64::from_le_bytes(gtk.rsc);
        hs.install_gtk(gtk.key_id, key, rsc);
    }
    if let Some(igtk) = &fte.igtk {
        let key = keywrap::unwrap(&kek, &igtk.wrapped_key)?;
        let key = &key[..usize::from(igtk.key_len).min(key.len())];
        hs.install_igtk(igtk.key_id, key, igtk.ipn);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::fake::FakeDriver;
    use airlock_crypto::ft::{derive_ft_keys, derive_ft_ptk};
    use airlock_eapol::handshake::GroupKey;
    use airlock_eapol::Authenticator;
    use airlock_ie::Mde;
    use airlock_mpdu::{mgmt, AuthBody, MgmtSubtype};

    const STA_ADDR: [u8; 6] = [0x02, 0x11, 0x22, 0x33, 0x44, 0x55];
    const BSSID: [u8; 6] = [0x02, 0xaa, 0xbb, 0xcc, 0xdd, 0xee];
    const BSSID2: [u8; 6] = [0x02, 0xaa, 0xbb, 0xcc, 0xdd, 0xff];
    const PMK: [u8; 32] = [0x42; 32];
    const IFINDEX: u32 = 3;
    const MDE_BYTES: [u8; 5] = [0x36, 0x03, 0x34, 0x12, 0x01];

    fn wpa2_beacon_rsne() -> Vec<u8> {
        Rsne::wpa2_psk().to_bytes()
    }

    fn ft_beacon_rsne() -> Vec<u8> {
        let mut rsne = Rsne::wpa2_psk();
        rsne.akm_suites |= AkmSuite::FtPsk as u16;
        rsne.to_bytes()
    }

    fn event(cmd_no: u8, attrs: Vec<(u16, Vec<u8>)>) -> GenlResponse {
        GenlResponse { cmd: cmd_no, attrs }
    }

    fn connect_event(resp_ies: &[u8]) -> GenlResponse {
        event(
            cmd::CONNECT,
            vec![(attr::STATUS_CODE, 0u16.to_ne_bytes().to_vec()), (attr::RESP_IE, resp_ies.to_vec())],
        )
    }

    fn ack_all_pending(station: &mut Station, driver: &mut FakeDriver) {
        // Deliver acks until the FSM stops submitting new commands.
        let mut acked = 0;
        loop {
            let pending: Vec<_> =
                driver.submitted.iter().skip(acked).map(|(id, _)| *id).collect();
            if pending.is_empty() {
                break;
            }
            for id in pending {
                acked += 1;
                station.on_command_complete(driver, id, CommandOutcome::Ack);
            }
        }
    }

    fn authenticator_for(own_rsne: &[u8], ap_rsne: &[u8], ft: bool) -> Authenticator {
        let mut hs = Handshake::new(HandshakeConfig {
            spa: STA_ADDR,
            aa: BSSID,
            ssid: b"Net".to_vec(),
        });
        hs.set_own_ie(own_rsne).unwrap();
        hs.set_ap_ie(ap_rsne).unwrap();
        hs.set_pmk(PMK).unwrap();
        if ft {
            hs.set_mde(&MDE_BYTES).unwrap();
            hs.set_kh_ids(b"r0kh.example", BSSID).unwrap();
            hs.derive_ft_keys().unwrap();
        }
        Authenticator::new(hs, GroupKey { index: 1, key: vec![0xaa; 16], rsc: 0 }, None)
            .unwrap()
    }

    /// Drives a station to Operational over WPA2-PSK and returns the
    /// authenticator used for the 4-way.
    fn connect_to_operational(
        station: &mut Station,
        driver: &mut FakeDriver,
        beacon_rsne: Vec<u8>,
        mde: Option<Vec<u8>>,
        resp_ies: Vec<u8>,
    ) -> Authenticator {
        let ft = mde.is_some();
        station
            .connect(
                driver,
                ConnectParams {
                    bssid: BSSID,
                    frequency: 2412,
                    ssid: b"Net".to_vec(),
                    beacon_rsne: Some(beacon_rsne.clone()),
                    mde,
                    pmk: Some(PMK),
                    mfp: false,
                },
            )
            .unwrap();
        let (connect_id, connect_cmd) = driver.last_submitted().unwrap().clone();
        assert_eq!(connect_cmd.cmd, cmd::CONNECT);
        station.on_command_complete(driver, connect_id, CommandOutcome::Ack);

        station.on_mlme_event(driver, &connect_event(&resp_ies));
        assert!(station.take_events().contains(&StationEvent::FourWayHandshake));

        let own_rsne = build_own_rsne(&beacon_rsne, ft, false).unwrap();
        let mut authenticator = authenticator_for(&own_rsne, &beacon_rsne, ft);
        let mut sink = Vec::new();
        authenticator.initiate(&mut sink);
        let msg1 = sink
            .iter()
            .find_map(|u| match u {
                Update::TxFrame(f) => Some(f.clone()),
                _ => None,
            })
            .unwrap();

        station.on_eapol_pdu(driver, &msg1);
        let msg2 = driver.eapol_tx.last().unwrap().1.clone();
        let mut sink = Vec::new();
        authenticator.on_eapol_frame(&KeyFrame::parse(&msg2).unwrap(), &mut sink);
        let msg3 = sink
            .iter()
            .find_map(|u| match u {
                Update::TxFrame(f) => Some(f.clone()),
                _ => None,
            })
            .unwrap();
        station.on_eapol_pdu(driver, &msg3);

        ack_all_pending(station, driver);
        assert!(station.is_operational());
        authenticator
    }

    #[test]
    fn wpa2_happy_path_command_sequence() {
        let mut driver = FakeDriver::new();
        let mut station = Station::new(IFINDEX, STA_ADDR, StationConfig::default());

        connect_to_operational(
            &mut station,
            &mut driver,
            wpa2_beacon_rsne(),
            None,
            wpa2_beacon_rsne(),
        );

        // 1 CONNECT; pairwise NEW_KEY + pairwise SET_KEY + group NEW_KEY;
        // 1 SET_STATION; 1 link-mode update; 2 EAPoL transmissions.
        assert_eq!(driver.commands(cmd::CONNECT).len(), 1);
        assert_eq!(driver.commands(cmd::NEW_KEY).len(), 2);
        assert_eq!(driver.commands(cmd::SET_KEY).len(), 1);
        assert_eq!(driver.commands(cmd::SET_STATION).len(), 1);
        assert_eq!(driver.link_modes, vec![(LinkMode::Dormant, OperState::Up)]);
        assert_eq!(driver.eapol_tx.len(), 2);

        let events = station.take_events();
        assert!(events.contains(&StationEvent::SettingKeys));
        assert!(events.contains(&StationEvent::Operational));

        // Key installation order: pairwise before group, SET_STATION last.
        let kinds: Vec<u8> = driver
            .submitted
            .iter()
            .map(|(_, c)| c.cmd)
            .filter(|c| matches!(*c, cmd::NEW_KEY | cmd::SET_KEY | cmd::SET_STATION))
            .collect();
        assert_eq!(kinds, vec![cmd::NEW_KEY, cmd::SET_KEY, cmd::NEW_KEY, cmd::SET_STATION]);
    }

    #[test]
    fn association_status_failure_reaches_idle() {
        let mut driver = FakeDriver::new();
        let mut station = Station::new(IFINDEX, STA_ADDR, StationConfig::default());
        station
            .connect(
                &mut driver,
                ConnectParams {
                    bssid: BSSID,
                    frequency: 2412,
                    ssid: b"Net".to_vec(),
                    beacon_rsne: Some(wpa2_beacon_rsne()),
                    mde: None,
                    pmk: Some(PMK),
                    mfp: false,
                },
            )
            .unwrap();

        let denied = event(
            cmd::CONNECT,
            vec![(attr::STATUS_CODE, 17u16.to_ne_bytes().to_vec())],
        );
        station.on_mlme_event(&mut driver, &denied);

        assert!(station.is_idle());
        let events = station.take_events();
        assert!(events
            .contains(&StationEvent::ConnectFailed(ConnectError::AssociationFailed(17))));
    }

    #[test]
    fn key_install_failure_deauthenticates() {
        let mut driver = FakeDriver::new();
        let mut station = Station::new(IFINDEX, STA_ADDR, StationConfig::default());
        station
            .connect(
                &mut driver,
                ConnectParams {
                    bssid: BSSID,
                    frequency: 2412,
                    ssid: b"Net".to_vec(),
                    beacon_rsne: Some(wpa2_beacon_rsne()),
                    mde: None,
                    pmk: Some(PMK),
                    mfp: false,
                },
            )
            .unwrap();
        let connect_id = driver.last_submitted().unwrap().0;
        station.on_command_complete(&mut driver, connect_id, CommandOutcome::Ack);
        station.on_mlme_event(&mut driver, &connect_event(&wpa2_beacon_rsne()));

        let own_rsne = build_own_rsne(&wpa2_beacon_rsne(), false, false).unwrap();
        let mut authenticator = authenticator_for(&own_rsne, &wpa2_beacon_rsne(), false);
        let mut sink = Vec::new();
        authenticator.initiate(&mut sink);
        let msg1 = match &sink[0] {
            Update::TxFrame(f) => f.clone(),
            other => panic!("unexpected update {other:?}"),
        };
        station.on_eapol_pdu(&mut driver, &msg1);
        let msg2 = driver.eapol_tx.last().unwrap().1.clone();
        sink.clear();
        authenticator.on_eapol_frame(&KeyFrame::parse(&msg2).unwrap(), &mut sink);
        let msg3 = sink
            .iter()
            .find_map(|u| match u {
                Update::TxFrame(f) => Some(f.clone()),
                _ => None,
            })
            .unwrap();
        station.on_eapol_pdu(&mut driver, &msg3);

        // First key installation is rejected by the kernel.
        let (key_id, key_cmd) = driver.last_submitted().unwrap().clone();
        assert_eq!(key_cmd.cmd, cmd::NEW_KEY);
        station.on_command_complete(&mut driver, key_id, CommandOutcome::Error(22));

        let events = station.take_events();
        assert!(events.contains(&StationEvent::ConnectFailed(ConnectError::KeySettingFailed)));
        let deauth = driver.commands(cmd::DEAUTHENTICATE);
        assert_eq!(deauth.len(), 1);
        assert_eq!(
            deauth[0].get(attr::REASON_CODE),
            Some(&airlock_netlink::genl::AttrValue::U16(ReasonCode::Unspecified as u16))
        );
    }

    #[test]
    fn msg3_rsne_mismatch_fails_and_deauthenticates() {
        let mut driver = FakeDriver::new();
        let mut station = Station::new(IFINDEX, STA_ADDR, StationConfig::default());
        station
            .connect(
                &mut driver,
                ConnectParams {
                    bssid: BSSID,
                    frequency: 2412,
                    ssid: b"Net".to_vec(),
                    beacon_rsne: Some(wpa2_beacon_rsne()),
                    mde: None,
                    pmk: Some(PMK),
                    mfp: false,
                },
            )
            .unwrap();
        let connect_id = driver.last_submitted().unwrap().0;
        station.on_command_complete(&mut driver, connect_id, CommandOutcome::Ack);
        station.on_mlme_event(&mut driver, &connect_event(&wpa2_beacon_rsne()));

        // The authenticator advertises TKIP inside Msg3 while the
        // beacon said CCMP.
        let mut tkip = Rsne::wpa2_psk();
        tkip.pairwise_ciphers = CipherSuite::Tkip as u16;
        let own_rsne = build_own_rsne(&wpa2_beacon_rsne(), false, false).unwrap();
        let mut authenticator = authenticator_for(&own_rsne, &tkip.to_bytes(), false);

        let mut sink = Vec::new();
        authenticator.initiate(&mut sink);
        let msg1 = match &sink[0] {
            Update::TxFrame(f) => f.clone(),
            other => panic!("unexpected update {other:?}"),
        };
        station.on_eapol_pdu(&mut driver, &msg1);
        let msg2 = driver.eapol_tx.last().unwrap().1.clone();
        sink.clear();
        authenticator.on_eapol_frame(&KeyFrame::parse(&msg2).unwrap(), &mut sink);
        let msg3 = sink
            .iter()
            .find_map(|u| match u {
                Update::TxFrame(f) => Some(f.clone()),
                _ => None,
            })
            .unwrap();
        station.on_eapol_pdu(&mut driver, &msg3);

        let events = station.take_events();
        assert!(events.contains(&StationEvent::ConnectFailed(ConnectError::HandshakeFailed(
            airlock_eapol::HandshakeFailure::IeMismatch
        ))));
        let deauth = driver.commands(cmd::DEAUTHENTICATE);
        assert_eq!(deauth.len(), 1);

        let deauth_id = driver.last_submitted().unwrap().0;
        station.on_command_complete(&mut driver, deauth_id, CommandOutcome::Ack);
        assert!(station.is_idle());
        // No keys were installed.
        assert!(driver.commands(cmd::NEW_KEY).is_empty());
    }

    #[test]
    fn disconnect_is_idempotent_on_the_wire() {
        let mut driver = FakeDriver::new();
        let mut station = Station::new(IFINDEX, STA_ADDR, StationConfig::default());
        connect_to_operational(
            &mut station,
            &mut driver,
            wpa2_beacon_rsne(),
            None,
            wpa2_beacon_rsne(),
        );
        station.take_events();

        station.disconnect(&mut driver).unwrap();
        station.disconnect(&mut driver).unwrap();
        assert_eq!(driver.commands(cmd::DEAUTHENTICATE).len(), 1);

        let deauth_id = driver.last_submitted().unwrap().0;
        station.on_command_complete(&mut driver, deauth_id, CommandOutcome::Ack);
        assert!(station.is_idle());
        assert_eq!(
            station.take_events(),
            vec![StationEvent::Disconnected(DisconnectReason::BySme)]
        );
    }

    #[test]
    fn fast_transition_echoes_mde_and_skips_fourway() {
        let mut driver = FakeDriver::new();
        let mut station = Station::new(IFINDEX, STA_ADDR, StationConfig::default());

        // Initial FT mobility-domain association: the response carries
        // RSNE + MDE + zeroed FTE with the key-holder identities.
        let initial_fte = Fte {
            r0kh_id: Some(b"r0kh.example".to_vec()),
            r1kh_id: Some(BSSID),
            ..Fte::default()
        };
        let mut resp_ies = ft_beacon_rsne();
        resp_ies.extend_from_slice(&MDE_BYTES);
        resp_ies.extend_from_slice(&initial_fte.to_bytes());

        connect_to_operational(
            &mut station,
            &mut driver,
            ft_beacon_rsne(),
            Some(MDE_BYTES.to_vec()),
            resp_ies,
        );
        station.take_events();
        let eapol_sends_before = driver.eapol_tx.len();

        station
            .fast_transition(
                &mut driver,
                FtTarget {
                    bssid: BSSID2,
                    frequency: 5180,
                    beacon_rsne: ft_beacon_rsne(),
                    mde: MDE_BYTES.to_vec(),
                },
            )
            .unwrap();

        // The FT Authenticate request: RSNE with PMKR0Name as the only
        // PMKID, the MDE verbatim, FTE with SNonce and R0KH-ID set and
        // everything else zeroed.
        let (auth_id, auth_cmd) = driver.last_submitted().unwrap().clone();
        assert_eq!(auth_cmd.cmd, cmd::AUTHENTICATE);
        let ies = match auth_cmd.get(attr::IE) {
            Some(airlock_netlink::genl::AttrValue::Bytes(ies)) => ies.clone(),
            other => panic!("missing IE attribute: {other:?}"),
        };
        let own_rsne = build_own_rsne(&ft_beacon_rsne(), true, false).unwrap();
        let own = Rsne::parse(&own_rsne).unwrap();
        assert_eq!(own.single_akm(), Some(AkmSuite::FtPsk));

        let mdid = Mde::parse(&MDE_BYTES).unwrap().mdid.to_le_bytes();
        let expected_r0 =
            derive_ft_keys(&PMK, b"Net", mdid, b"r0kh.example", &BSSID, &STA_ADDR).unwrap();

        let sent_rsne_raw = tlv::find_unique_raw(&ies, eid::RSN).unwrap().unwrap();
        let sent_rsne = Rsne::parse(sent_rsne_raw).unwrap();
        assert_eq!(sent_rsne.pmkids, vec![expected_r0.pmk_r0_name]);

        let sent_mde = tlv::find_unique_raw(&ies, eid::MOBILITY_DOMAIN).unwrap().unwrap();
        assert_eq!(sent_mde, MDE_BYTES);

        let sent_fte_raw =
            tlv::find_unique_raw(&ies, eid::FAST_BSS_TRANSITION).unwrap().unwrap();
        let sent_fte = Fte::parse(sent_fte_raw).unwrap();
        assert_eq!(sent_fte.mic_element_count, 0);
        assert_eq!(sent_fte.mic, [0; 16]);
        assert_eq!(sent_fte.anonce, [0; 32]);
        assert_ne!(sent_fte.snonce, [0; 32]);
        assert_eq!(sent_fte.r0kh_id.as_deref(), Some(&b"r0kh.example"[..]));

        station.on_command_complete(&mut driver, auth_id, CommandOutcome::Ack);

        // Kernel delivers the FT Authenticate Response (sequence 2).
        let snonce = sent_fte.snonce;
        let anonce = [0x5a; 32];
        let mut r0_rsne = Rsne::parse(&ft_beacon_rsne()).unwrap();
        r0_rsne.pmkids = vec![expected_r0.pmk_r0_name];
        let resp_fte = Fte {
            anonce,
            snonce,
            r0kh_id: Some(b"r0kh.example".to_vec()),
            r1kh_id: Some(BSSID2),
            ..Fte::default()
        };
        let mut auth_ies = r0_rsne.to_bytes();
        auth_ies.extend_from_slice(&MDE_BYTES);
        auth_ies.extend_from_slice(&resp_fte.to_bytes());
        let auth_frame = mgmt::build_frame(
            MgmtSubtype::Authentication,
            STA_ADDR,
            BSSID2,
            BSSID2,
            &AuthBody { algorithm: AUTH_ALGO_FT, transaction: 2, status: 0, ies: auth_ies }
                .to_bytes(),
        );
        station.on_mlme_event(
            &mut driver,
            &event(cmd::AUTHENTICATE, vec![(attr::FRAME, auth_frame)]),
        );

        // The Reassociate Request: MDE byte-identical again, FTE MIC
        // computed, PMKID now the PMKR1Name for the target's R1KH.
        let (assoc_id, assoc_cmd) = driver.last_submitted().unwrap().clone();
        assert_eq!(assoc_cmd.cmd, cmd::ASSOCIATE);
        let reassoc_ies = match assoc_cmd.get(attr::IE) {
            Some(airlock_netlink::genl::AttrValue::Bytes(ies)) => ies.clone(),
            other => panic!("missing IE attribute: {other:?}"),
        };
        let expected_r1 =
            derive_ft_keys(&PMK, b"Net", mdid, b"r0kh.example", &BSSID2, &STA_ADDR).unwrap();
        let reassoc_rsne =
            Rsne::parse(tlv::find_unique_raw(&reassoc_ies, eid::RSN).unwrap().unwrap()).unwrap();
        assert_eq!(reassoc_rsne.pmkids, vec![expected_r1.pmk_r1_name]);
        assert_eq!(
            tlv::find_unique_raw(&reassoc_ies, eid::MOBILITY_DOMAIN).unwrap().unwrap(),
            MDE_BYTES
        );
        let reassoc_fte = Fte::parse(
            tlv::find_unique_raw(&reassoc_ies, eid::FAST_BSS_TRANSITION).unwrap().unwrap(),
        )
        .unwrap();
        assert_eq!(reassoc_fte.mic_element_count, 3);
        assert_ne!(reassoc_fte.mic, [0; 16]);

        station.on_command_complete(&mut driver, assoc_id, CommandOutcome::Ack);

        // Kernel delivers the successful Reassociation Response with a
        // valid response-direction FTE MIC.
        let ptk = derive_ft_ptk(&expected_r1.pmk_r1, &BSSID2, &STA_ADDR, &anonce, &snonce, 16);
        let mut resp_rsne = Rsne::parse(&ft_beacon_rsne()).unwrap();
        resp_rsne.pmkids = vec![expected_r1.pmk_r1_name];
        let resp_rsne_bytes = resp_rsne.to_bytes();
        let mut resp_fte = Fte {
            mic_element_count: 3,
            anonce,
            snonce,
            r0kh_id: Some(b"r0kh.example".to_vec()),
            r1kh_id: Some(BSSID2),
            ..Fte::default()
        };
        let zero_mic_fte = resp_fte.to_bytes();
        resp_fte.mic = ft_crypto::fte_mic(
            ptk.kck(),
            &STA_ADDR,
            &BSSID2,
            6,
            &[&resp_rsne_bytes, &MDE_BYTES, &zero_mic_fte],
        )
        .unwrap();
        let mut resp_ies = resp_rsne_bytes.clone();
        resp_ies.extend_from_slice(&MDE_BYTES);
        resp_ies.extend_from_slice(&resp_fte.to_bytes());
        let reassoc_frame = mgmt::build_frame(
            MgmtSubtype::ReassociationResponse,
            STA_ADDR,
            BSSID2,
            BSSID2,
            &mgmt::AssocRespBody { capability: 0x0431, status: 0, aid: 1, ies: resp_ies }
                .to_bytes(),
        );
        station.on_mlme_event(
            &mut driver,
            &event(cmd::ASSOCIATE, vec![(attr::FRAME, reassoc_frame)]),
        );

        ack_all_pending(&mut station, &mut driver);
        assert!(station.is_operational());
        // No 4-Way Handshake ran for the transition.
        assert_eq!(driver.eapol_tx.len(), eapol_sends_before);

        // The installed pairwise key is the FT-derived one, for the new
        // BSSID.
        let new_keys = driver.commands(cmd::NEW_KEY);
        let ft_pairwise = new_keys
            .iter()
            .rev()
            .find(|c| c.get(attr::MAC).is_some())
            .expect("pairwise NEW_KEY for the target");
        assert_eq!(
            ft_pairwise.get(attr::KEY_DATA),
            Some(&airlock_netlink::genl::AttrValue::Bytes(ptk.tk().to_vec()))
        );
        assert_eq!(
            ft_pairwise.get(attr::MAC),
            Some(&airlock_netlink::genl::AttrValue::Bytes(BSSID2.to_vec()))
        );
    }
}
