//! Per-interface registry and event demultiplexer.
//!
//! Tracks every managed netdev by kernel ifindex, spawns the role state
//! machine for it, and routes MLME events, EAPoL frames, command
//! completions and timer expirations to the right instance. Interface
//! name filters let operators scope which netdevs the daemon touches.

use std::collections::HashMap;
use std::time::Instant;

use airlock_netlink::genl::{CommandId, CommandOutcome, GenlResponse};
use airlock_netlink::nl80211::{attr, cmd, iftype};
use tracing::{debug, info};

use crate::ap::{AccessPoint, ApConfig};
use crate::driver::{Driver, TimerKind};
use crate::events::{ApEvent, StationEvent};
use crate::station::{ConnectParams, FtTarget, Station, StationConfig};
use crate::{CoreError, Result};

/// One event from one interface, for the upper layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterfaceEvent {
    Station(StationEvent),
    Ap(ApEvent),
}

enum Role {
    Station(Box<Station>),
    Ap(Box<AccessPoint>),
}

pub struct ManagedInterface {
    pub ifindex: u32,
    pub name: String,
    pub addr: [u8; 6],
    role: Role,
}

impl ManagedInterface {
    /// True for a station-role interface with no connection attempt in
    /// flight.
    pub fn is_idle_station(&self) -> bool {
        matches!(&self.role, Role::Station(station) if station.is_idle())
    }
}

/// Shell-style pattern match supporting `*` and `?`.
fn pattern_match(pattern: &str, name: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let name: Vec<char> = name.chars().collect();

    fn matches(pattern: &[char], name: &[char]) -> bool {
        match (pattern.first(), name.first()) {
            (None, None) => true,
            (Some('*'), _) => {
                matches(&pattern[1..], name)
                    || (!name.is_empty() && matches(pattern, &name[1..]))
            }
            (Some('?'), Some(_)) => matches(&pattern[1..], &name[1..]),
            (Some(p), Some(n)) if p == n => matches(&pattern[1..], &name[1..]),
            _ => false,
        }
    }

    matches(&pattern, &name)
}

pub struct Manager {
    interfaces: HashMap<u32, ManagedInterface>,
    allow_patterns: Vec<String>,
    block_patterns: Vec<String>,
    station_config: StationConfig,
    events: Vec<(u32, InterfaceEvent)>,
}

impl Manager {
    pub fn new(allow_patterns: Vec<String>, block_patterns: Vec<String>) -> Manager {
        Manager {
            interfaces: HashMap::new(),
            allow_patterns,
            block_patterns,
            station_config: StationConfig::default(),
            events: Vec::new(),
        }
    }

    pub fn set_station_config(&mut self, config: StationConfig) {
        self.station_config = config;
    }

    /// Applies the allow/block name filters: blocked wins, an empty
    /// allow list admits everything.
    pub fn name_allowed(&self, name: &str) -> bool {
        if self.block_patterns.iter().any(|p| pattern_match(p, name)) {
            return false;
        }
        if self.allow_patterns.is_empty() {
            return true;
        }
        self.allow_patterns.iter().any(|p| pattern_match(p, name))
    }

    pub fn interfaces(&self) -> impl Iterator<Item = &ManagedInterface> {
        self.interfaces.values()
    }

    pub fn contains(&self, ifindex: u32) -> bool {
        self.interfaces.contains_key(&ifindex)
    }

    /// Drains (ifindex, event) pairs accumulated by the role FSMs.
    pub fn take_events(&mut self) -> Vec<(u32, InterfaceEvent)> {
        let mut out = std::mem::take(&mut self.events);
        for (ifindex, iface) in &mut self.interfaces {
            match &mut iface.role {
                Role::Station(station) => out
                    .extend(station.take_events().into_iter().map(|e| {
                        (*ifindex, InterfaceEvent::Station(e))
                    })),
                Role::Ap(ap) => out.extend(
                    ap.take_events().into_iter().map(|e| (*ifindex, InterfaceEvent::Ap(e))),
                ),
            }
        }
        out
    }

    // --- interface lifecycle -------------------------------------------

    /// Registers an interface reported by GET_INTERFACE or a
    /// NEW_INTERFACE notification. Returns false when filtered out or
    /// of an unmanaged type.
    pub fn add_interface(
        &mut self,
        ifindex: u32,
        name: &str,
        addr: [u8; 6],
        nl_iftype: u32,
    ) -> bool {
        if !self.name_allowed(name) {
            debug!("ignoring interface {name}: filtered by name patterns");
            return false;
        }
        if self.interfaces.contains_key(&ifindex) {
            return true;
        }
        // Every managed netdev begins as an idle station; `start_ap`
        // switches the role when the upper layer brings up a BSS.
        let role = match nl_iftype {
            iftype::STATION | iftype::AP => Role::Station(Box::new(Station::new(
                ifindex,
                addr,
                self.station_config.clone(),
            ))),
            other => {
                debug!("ignoring interface {name}: unmanaged iftype {other}");
                return false;
            }
        };

        info!(ifindex, "managing interface {name}");
        self.interfaces
            .insert(ifindex, ManagedInterface { ifindex, name: name.to_string(), addr, role });
        true
    }

    pub fn remove_interface(&mut self, ifindex: u32) {
        if let Some(iface) = self.interfaces.remove(&ifindex) {
            info!(ifindex, "interface {} gone", iface.name);
            // Dropping the role zeroizes any key ladders it still holds.
        }
    }

    /// Handles NEW_INTERFACE/DEL_INTERFACE notifications and interface
    /// dump responses.
    pub fn on_interface_event(&mut self, event: &GenlResponse) {
        match event.cmd {
            cmd::NEW_INTERFACE | cmd::GET_INTERFACE => {
                let (Some(ifindex), Some(name), Some(addr), Some(nl_iftype)) = (
                    event.get_u32(attr::IFINDEX),
                    event.get(attr::IFNAME),
                    event.get_mac(attr::MAC),
                    event.get_u32(attr::IFTYPE),
                ) else {
                    return;
                };
                let name = String::from_utf8_lossy(name);
                let name = name.trim_end_matches('\0');
                self.add_interface(ifindex, name, addr, nl_iftype);
            }
            cmd::DEL_INTERFACE => {
                if let Some(ifindex) = event.get_u32(attr::IFINDEX) {
                    self.remove_interface(ifindex);
                }
            }
            _ => {}
        }
    }

    /// A netlink socket error invalidates everything we track; the
    /// daemon reconnects and re-enumerates.
    pub fn reset(&mut self) {
        self.interfaces.clear();
    }

    // --- role control --------------------------------------------------

    fn station_mut(&mut self, ifindex: u32) -> Result<&mut Station> {
        match self.interfaces.get_mut(&ifindex).map(|iface| &mut iface.role) {
            Some(Role::Station(station)) => Ok(station),
            Some(Role::Ap(_)) => Err(CoreError::NotSupported("interface is in AP mode")),
            None => Err(CoreError::InvalidArgs("unknown interface")),
        }
    }

    fn ap_mut(&mut self, ifindex: u32) -> Result<&mut AccessPoint> {
        match self.interfaces.get_mut(&ifindex).map(|iface| &mut iface.role) {
            Some(Role::Ap(ap)) => Ok(ap),
            Some(Role::Station(_)) => {
                Err(CoreError::NotSupported("interface is in station mode"))
            }
            None => Err(CoreError::InvalidArgs("unknown interface")),
        }
    }

    pub fn connect(
        &mut self,
        driver: &mut dyn Driver,
        ifindex: u32,
        params: ConnectParams,
    ) -> Result<()> {
        self.station_mut(ifindex)?.connect(driver, params)
    }

    pub fn disconnect(&mut self, driver: &mut dyn Driver, ifindex: u32) -> Result<()> {
        self.station_mut(ifindex)?.disconnect(driver)
    }

    pub fn fast_transition(
        &mut self,
        driver: &mut dyn Driver,
        ifindex: u32,
        target: FtTarget,
    ) -> Result<()> {
        self.station_mut(ifindex)?.fast_transition(driver, target)
    }

    /// Switches the interface into AP mode and starts the BSS.
    pub fn start_ap(
        &mut self,
        driver: &mut dyn Driver,
        ifindex: u32,
        config: ApConfig,
    ) -> Result<()> {
        let iface =
            self.interfaces.get_mut(&ifindex).ok_or(CoreError::InvalidArgs("unknown interface"))?;
        if let Role::Station(station) = &iface.role {
            if !station.is_idle() {
                return Err(CoreError::InProgress);
            }
        }
        let mut ap = Box::new(AccessPoint::new(ifindex, iface.addr, config));
        ap.start(driver)?;
        iface.role = Role::Ap(ap);
        Ok(())
    }

    pub fn stop_ap(&mut self, driver: &mut dyn Driver, ifindex: u32) -> Result<()> {
        self.ap_mut(ifindex)?.stop(driver)
    }

    pub fn push_button(
        &mut self,
        driver: &mut dyn Driver,
        ifindex: u32,
        now: Instant,
    ) -> Result<()> {
        self.ap_mut(ifindex)?.push_button(driver, now)
    }

    // --- event routing -------------------------------------------------

    /// The ifindex an MLME notification belongs to.
    pub fn event_ifindex(event: &GenlResponse) -> Option<u32> {
        event.get_u32(attr::IFINDEX)
    }

    pub fn on_mlme_event(
        &mut self,
        driver: &mut dyn Driver,
        ifindex: u32,
        event: &GenlResponse,
        now: Instant,
    ) {
        let Some(iface) = self.interfaces.get_mut(&ifindex) else { return };
        match &mut iface.role {
            Role::Station(station) => station.on_mlme_event(driver, event),
            Role::Ap(ap) => {
                if event.cmd == cmd::FRAME {
                    if let Some(frame) = event.get(attr::FRAME) {
                        let frame = frame.to_vec();
                        ap.on_mgmt_frame(driver, &frame, now);
                    }
                }
            }
        }
    }

    pub fn on_command_complete(
        &mut self,
        driver: &mut dyn Driver,
        ifindex: u32,
        id: CommandId,
        outcome: CommandOutcome,
    ) {
        let Some(iface) = self.interfaces.get_mut(&ifindex) else { return };
        match &mut iface.role {
            Role::Station(station) => station.on_command_complete(driver, id, outcome),
            Role::Ap(ap) => ap.on_command_complete(driver, id, outcome),
        }
    }

    pub fn on_eapol_pdu(
        &mut self,
        driver: &mut dyn Driver,
        ifindex: u32,
        source: [u8; 6],
        pdu: &[u8],
    ) {
        let Some(iface) = self.interfaces.get_mut(&ifindex) else { return };
        match &mut iface.role {
            Role::Station(station) => station.on_eapol_pdu(driver, pdu),
            Role::Ap(ap) => ap.on_eapol_pdu(driver, source, pdu),
        }
    }

    pub fn on_timeout(&mut self, driver: &mut dyn Driver, ifindex: u32, kind: TimerKind) {
        let Some(iface) = self.interfaces.get_mut(&ifindex) else { return };
        match &mut iface.role {
            Role::Station(station) => station.on_timeout(driver, kind),
            Role::Ap(ap) => ap.on_timeout(driver, kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_patterns() {
        assert!(pattern_match("wlan*", "wlan0"));
        assert!(pattern_match("*", "anything"));
        assert!(pattern_match("wl?n0", "wlan0"));
        assert!(!pattern_match("wlan*", "eth0"));
        assert!(!pattern_match("wlan?", "wlan10"));
    }

    #[test]
    fn block_overrides_allow() {
        let manager = Manager::new(vec!["wlan*".into()], vec!["wlan1".into()]);
        assert!(manager.name_allowed("wlan0"));
        assert!(!manager.name_allowed("wlan1"));
        assert!(!manager.name_allowed("eth0"));
    }

    #[test]
    fn empty_allow_list_admits_all_but_blocked() {
        let manager = Manager::new(vec![], vec!["p2p*".into()]);
        assert!(manager.name_allowed("wlan0"));
        assert!(!manager.name_allowed("p2p-dev-wlan0"));
    }

    #[test]
    fn interface_registry_follows_kernel_events() {
        let mut manager = Manager::new(vec![], vec![]);

        let new_iface = GenlResponse {
            cmd: cmd::NEW_INTERFACE,
            attrs: vec![
                (attr::IFINDEX, 3u32.to_ne_bytes().to_vec()),
                (attr::IFNAME, b"wlan0\0".to_vec()),
                (attr::MAC, vec![2, 0, 0, 0, 0, 1]),
                (attr::IFTYPE, iftype::STATION.to_ne_bytes().to_vec()),
            ],
        };
        manager.on_interface_event(&new_iface);
        assert!(manager.contains(3));

        let del_iface = GenlResponse {
            cmd: cmd::DEL_INTERFACE,
            attrs: vec![(attr::IFINDEX, 3u32.to_ne_bytes().to_vec())],
        };
        manager.on_interface_event(&del_iface);
        assert!(!manager.contains(3));
    }

    #[test]
    fn filtered_interface_not_managed() {
        let mut manager = Manager::new(vec!["wlan*".into()], vec![]);
        assert!(!manager.add_interface(5, "eth0", [0; 6], iftype::STATION));
        assert!(manager.add_interface(6, "wlan1", [0; 6], iftype::STATION));
    }
}
