//! The seam between the state machines and the kernel.
//!
//! One `Driver` instance serves one interface. The daemon's
//! implementation forwards to the genl transport, the rtnl socket and
//! the per-interface EAPoL packet socket; tests use a recording fake.

use std::time::Duration;

use airlock_netlink::genl::{CommandId, GenlCmd};
use airlock_netlink::rtnl::{LinkMode, OperState};

/// Timers a state machine can arm. Each kind is a singleton per
/// interface; re-arming replaces the previous deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// EAPoL retransmit timer for the peer (STA role uses the BSSID).
    EapolRetransmit([u8; 6]),
    /// WSC push-button walk time.
    PbcWalk,
    /// Window for a neighbor-report response after the request.
    NeighborReport,
}

pub trait Driver {
    /// Submits an nl80211 command; the completion is routed back through
    /// `on_command_complete` with the returned id.
    fn submit(&mut self, cmd: GenlCmd) -> CommandId;

    /// Guarantees the completion for `id` will not be delivered.
    fn cancel(&mut self, id: CommandId);

    /// Sends an EAPoL PDU over the control port.
    fn tx_eapol(&mut self, dest: [u8; 6], pdu: &[u8]);

    /// Adjusts link mode and operational state over route netlink.
    /// Returns false when the kernel refused.
    fn set_link_mode(&mut self, mode: LinkMode, state: OperState) -> bool;

    fn start_timer(&mut self, kind: TimerKind, after: Duration);

    fn stop_timer(&mut self, kind: TimerKind);
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;

    /// Records everything; completions are delivered manually by tests.
    #[derive(Default)]
    pub struct FakeDriver {
        pub submitted: Vec<(CommandId, GenlCmd)>,
        pub cancelled: Vec<CommandId>,
        pub eapol_tx: Vec<([u8; 6], Vec<u8>)>,
        pub link_modes: Vec<(LinkMode, OperState)>,
        pub timers: Vec<(TimerKind, Duration)>,
        pub stopped_timers: Vec<TimerKind>,
        next_id: CommandId,
    }

    impl FakeDriver {
        pub fn new() -> Self {
            FakeDriver { next_id: 100, ..FakeDriver::default() }
        }

        pub fn last_submitted(&self) -> Option<&(CommandId, GenlCmd)> {
            self.submitted.last()
        }

        /// Commands of one nl80211 command number, in submit order.
        pub fn commands(&self, cmd: u8) -> Vec<&GenlCmd> {
            self.submitted.iter().filter(|(_, c)| c.cmd == cmd).map(|(_, c)| c).collect()
        }
    }

    impl Driver for FakeDriver {
        fn submit(&mut self, cmd: GenlCmd) -> CommandId {
            self.next_id += 1;
            self.submitted.push((self.next_id, cmd));
            self.next_id
        }

        fn cancel(&mut self, id: CommandId) {
            self.cancelled.push(id);
        }

        fn tx_eapol(&mut self, dest: [u8; 6], pdu: &[u8]) {
            self.eapol_tx.push((dest, pdu.to_vec()));
        }

        fn set_link_mode(&mut self, mode: LinkMode, state: OperState) -> bool {
            self.link_modes.push((mode, state));
            true
        }

        fn start_timer(&mut self, kind: TimerKind, after: Duration) {
            self.timers.push((kind, after));
        }

        fn stop_timer(&mut self, kind: TimerKind) {
            self.stopped_timers.push(kind);
        }
    }
}
