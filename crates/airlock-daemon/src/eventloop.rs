//! The single-threaded cooperative main loop.
//!
//! Three sources feed it: the nl80211 generic-netlink socket, the
//! per-interface EAPoL packet sockets, and the timer table. Every
//! callback runs to completion on this thread before the next message
//! is read; per-interface drivers serialize all kernel effects through
//! the one transport.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use airlock_core::driver::Driver;
use airlock_core::manager::{InterfaceEvent, Manager};
use airlock_core::station::{ConnectParams, StationConfig};
use airlock_core::profile::NetworkProfile;
use airlock_core::TimerKind;
use airlock_netlink::eapol_socket::EapolSocket;
use airlock_netlink::genl::{CommandId, CommandOutcome, GenlCmd, GenlResponse, GenlTransport};
use airlock_netlink::nl80211::{self, cmd};
use airlock_netlink::rtnl::{LinkMode, OperState, RtnlSocket};
use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::config::DaemonConfig;
use crate::timers::Timers;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_signo: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

type CompletionQueue = Rc<RefCell<VecDeque<(u32, CommandId, CommandOutcome)>>>;
type NotificationQueue = Rc<RefCell<VecDeque<GenlResponse>>>;

/// Driver implementation for one interface, borrowing the shared
/// transport and timer table for the duration of one dispatch.
struct IfaceDriver<'a> {
    ifindex: u32,
    transport: &'a mut GenlTransport,
    rtnl: &'a mut RtnlSocket,
    eapol: &'a HashMap<u32, EapolSocket>,
    timers: &'a mut Timers,
    completions: CompletionQueue,
}

impl Driver for IfaceDriver<'_> {
    fn submit(&mut self, cmd: GenlCmd) -> CommandId {
        let completions = Rc::clone(&self.completions);
        let ifindex = self.ifindex;
        match self.transport.send(
            cmd,
            Box::new(move |id, outcome| {
                completions.borrow_mut().push_back((ifindex, id, outcome));
            }),
        ) {
            Ok(id) => id,
            Err(err) => {
                warn!(ifindex, "command submission failed: {err}");
                0
            }
        }
    }

    fn cancel(&mut self, id: CommandId) {
        self.transport.cancel(id);
        // A completion may already be queued; drop it so the callback
        // contract holds.
        self.completions.borrow_mut().retain(|(_, pending, _)| *pending != id);
    }

    fn tx_eapol(&mut self, dest: [u8; 6], pdu: &[u8]) {
        match self.eapol.get(&self.ifindex) {
            Some(socket) => {
                if let Err(err) = socket.send(dest, pdu) {
                    warn!(ifindex = self.ifindex, "EAPoL send failed: {err}");
                }
            }
            None => warn!(ifindex = self.ifindex, "no EAPoL socket for interface"),
        }
    }

    fn set_link_mode(&mut self, mode: LinkMode, state: OperState) -> bool {
        match self.rtnl.set_link_mode(self.ifindex, mode, state) {
            Ok(()) => true,
            Err(err) => {
                warn!(ifindex = self.ifindex, "link mode update failed: {err}");
                false
            }
        }
    }

    fn start_timer(&mut self, kind: TimerKind, after: Duration) {
        self.timers.arm(self.ifindex, kind, after);
    }

    fn stop_timer(&mut self, kind: TimerKind) {
        self.timers.disarm(self.ifindex, kind);
    }
}

pub struct Daemon {
    config: DaemonConfig,
    transport: GenlTransport,
    rtnl: RtnlSocket,
    manager: Manager,
    timers: Timers,
    eapol: HashMap<u32, EapolSocket>,
    completions: CompletionQueue,
    notifications: NotificationQueue,
}

macro_rules! iface_driver {
    ($self:ident, $ifindex:expr) => {
        IfaceDriver {
            ifindex: $ifindex,
            transport: &mut $self.transport,
            rtnl: &mut $self.rtnl,
            eapol: &$self.eapol,
            timers: &mut $self.timers,
            completions: Rc::clone(&$self.completions),
        }
    };
}

impl Daemon {
    pub fn new(config: DaemonConfig) -> Result<Daemon> {
        let mut transport = GenlTransport::connect().context("connecting to nl80211")?;
        transport.register_multicast("config").context("joining config group")?;
        transport.register_multicast("mlme").context("joining mlme group")?;

        let notifications: NotificationQueue = Rc::new(RefCell::new(VecDeque::new()));
        let queue = Rc::clone(&notifications);
        transport.add_event_handler(Box::new(move |event| {
            queue.borrow_mut().push_back(event.clone());
        }));

        let mut manager =
            Manager::new(config.interface_allow.clone(), config.interface_block.clone());
        manager.set_station_config(StationConfig {
            rssi_monitor: config.rssi_threshold.map(|t| (t, 4)),
            rekey_offload: config.rekey_offload,
        });

        Ok(Daemon {
            config,
            transport,
            rtnl: RtnlSocket::connect().context("connecting to route netlink")?,
            manager,
            timers: Timers::default(),
            eapol: HashMap::new(),
            completions: Rc::new(RefCell::new(VecDeque::new())),
            notifications,
        })
    }

    pub fn run(mut self) -> Result<()> {
        let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
        unsafe {
            libc::signal(libc::SIGINT, handler);
            libc::signal(libc::SIGTERM, handler);
        }

        // Learn the existing interfaces; further changes arrive as
        // NEW_INTERFACE/DEL_INTERFACE notifications.
        let queue = Rc::clone(&self.notifications);
        self.transport
            .send(
                nl80211::get_interface_dump(),
                Box::new(move |_, outcome| {
                    if let CommandOutcome::Response(response) = outcome {
                        queue.borrow_mut().push_back(response);
                    }
                }),
            )
            .context("interface enumeration")?;

        info!("airlockd running");
        while !SHUTDOWN.load(Ordering::SeqCst) {
            self.drain_notifications();
            self.drain_completions();
            self.fire_timers();
            self.sync_eapol_sockets();
            self.autoconnect();
            self.report_events();
            self.poll()?;
        }

        info!("airlockd shutting down");
        Ok(())
    }

    fn drain_notifications(&mut self) {
        loop {
            let Some(event) = self.notifications.borrow_mut().pop_front() else { break };
            match event.cmd {
                cmd::NEW_INTERFACE | cmd::DEL_INTERFACE | cmd::GET_INTERFACE => {
                    self.manager.on_interface_event(&event);
                    if event.cmd == cmd::DEL_INTERFACE {
                        if let Some(ifindex) = Manager::event_ifindex(&event) {
                            self.eapol.remove(&ifindex);
                            self.timers.disarm_interface(ifindex);
                        }
                    }
                }
                _ => {
                    let Some(ifindex) = Manager::event_ifindex(&event) else {
                        debug!(cmd = event.cmd, "notification without ifindex");
                        continue;
                    };
                    let mut driver = iface_driver!(self, ifindex);
                    self.manager.on_mlme_event(&mut driver, ifindex, &event, Instant::now());
                }
            }
        }
    }

    fn drain_completions(&mut self) {
        loop {
            let Some((ifindex, id, outcome)) = self.completions.borrow_mut().pop_front() else {
                break;
            };
            let mut driver = iface_driver!(self, ifindex);
            self.manager.on_command_complete(&mut driver, ifindex, id, outcome);
        }
    }

    fn fire_timers(&mut self) {
        for (ifindex, kind) in self.timers.pop_expired(Instant::now()) {
            let mut driver = iface_driver!(self, ifindex);
            self.manager.on_timeout(&mut driver, ifindex, kind);
        }
    }

    /// Opens an EAPoL socket for every managed interface that lacks one.
    fn sync_eapol_sockets(&mut self) {
        let wanted: Vec<(u32, [u8; 6])> =
            self.manager.interfaces().map(|iface| (iface.ifindex, iface.addr)).collect();
        for (ifindex, addr) in wanted {
            if self.eapol.contains_key(&ifindex) {
                continue;
            }
            match EapolSocket::open(ifindex, addr) {
                Ok(socket) => {
                    self.eapol.insert(ifindex, socket);
                }
                Err(err) => debug!(ifindex, "cannot open EAPoL socket yet: {err}"),
            }
        }
        self.eapol.retain(|ifindex, _| self.manager.contains(*ifindex));
    }

    /// Stand-in for the control surface: a single env-configured
    /// connection attempt per idle station interface.
    fn autoconnect(&mut self) {
        let Some(params) = self.env_connect_params() else { return };
        let idle: Vec<u32> = self
            .manager
            .interfaces()
            .filter(|iface| iface.is_idle_station())
            .map(|iface| iface.ifindex)
            .collect();
        for ifindex in idle {
            let mut driver = iface_driver!(self, ifindex);
            if let Err(err) = self.manager.connect(&mut driver, ifindex, params.clone()) {
                warn!(ifindex, "connect failed: {err}");
            }
        }
    }

    fn env_connect_params(&self) -> Option<ConnectParams> {
        let ssid = std::env::var("AIRLOCKD_SSID").ok()?;
        let bssid = parse_mac(&std::env::var("AIRLOCKD_BSSID").ok()?)?;
        let frequency = std::env::var("AIRLOCKD_FREQUENCY").ok()?.parse().ok()?;

        let pmk = self.config.profile_dir.as_ref().and_then(|dir| {
            let path = dir.join(format!("{ssid}.psk"));
            let text = std::fs::read_to_string(path).ok()?;
            let profile = NetworkProfile::parse(&text).ok()?;
            profile.pmk(ssid.as_bytes()).ok().flatten()
        });

        Some(ConnectParams {
            bssid,
            frequency,
            ssid: ssid.into_bytes(),
            // WPA2-Personal with CCMP; an open network when no profile
            // resolves a key.
            beacon_rsne: pmk.map(|_| airlock_ie::Rsne::wpa2_psk().to_bytes()),
            mde: None,
            pmk,
            mfp: false,
        })
    }

    fn report_events(&mut self) {
        for (ifindex, event) in self.manager.take_events() {
            match event {
                InterfaceEvent::Station(event) => info!(ifindex, "station event: {event:?}"),
                InterfaceEvent::Ap(event) => info!(ifindex, "AP event: {event:?}"),
            }
        }
    }

    fn poll(&mut self) -> Result<()> {
        let mut fds = vec![libc::pollfd {
            fd: self.transport.fd(),
            events: libc::POLLIN,
            revents: 0,
        }];
        let eapol_ifindexes: Vec<u32> = self.eapol.keys().copied().collect();
        for ifindex in &eapol_ifindexes {
            fds.push(libc::pollfd {
                fd: self.eapol[ifindex].fd(),
                events: libc::POLLIN,
                revents: 0,
            });
        }

        let timeout = self
            .timers
            .next_timeout(Instant::now())
            .unwrap_or(Duration::from_secs(1))
            .min(Duration::from_secs(1));
        let rc = unsafe {
            libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout.as_millis() as i32)
        };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err).context("poll");
        }

        if fds[0].revents & libc::POLLIN != 0 {
            self.transport.dispatch();
        }
        for (slot, ifindex) in eapol_ifindexes.iter().enumerate() {
            if fds[slot + 1].revents & libc::POLLIN == 0 {
                continue;
            }
            loop {
                let pdu = match self.eapol.get(ifindex).map(|s| s.recv()) {
                    Some(Ok(Some(pdu))) => pdu,
                    Some(Ok(None)) | None => break,
                    Some(Err(err)) => {
                        warn!(ifindex, "EAPoL receive error: {err}");
                        break;
                    }
                };
                let mut driver = iface_driver!(self, *ifindex);
                self.manager.on_eapol_pdu(&mut driver, *ifindex, pdu.source, &pdu.pdu);
            }
        }

        Ok(())
    }
}

fn parse_mac(text: &str) -> Option<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut parts = text.trim().split(':');
    for byte in mac.iter_mut() {
        *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    parts.next().is_none().then_some(mac)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_parsing() {
        assert_eq!(
            parse_mac("02:11:22:33:44:55"),
            Some([0x02, 0x11, 0x22, 0x33, 0x44, 0x55])
        );
        assert_eq!(parse_mac("02:11:22:33:44"), None);
        assert_eq!(parse_mac("02:11:22:33:44:55:66"), None);
        assert_eq!(parse_mac("zz:11:22:33:44:55"), None);
    }
}
