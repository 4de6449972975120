//! Deadline table for the main loop. Timers are singletons per
//! (interface, kind); re-arming replaces the deadline.

use std::time::{Duration, Instant};

use airlock_core::TimerKind;

#[derive(Default)]
pub struct Timers {
    deadlines: Vec<(Instant, u32, TimerKind)>,
}

impl Timers {
    pub fn arm(&mut self, ifindex: u32, kind: TimerKind, after: Duration) {
        let deadline = Instant::now() + after;
        self.disarm(ifindex, kind);
        self.deadlines.push((deadline, ifindex, kind));
    }

    pub fn disarm(&mut self, ifindex: u32, kind: TimerKind) {
        self.deadlines.retain(|(_, i, k)| !(*i == ifindex && *k == kind));
    }

    pub fn disarm_interface(&mut self, ifindex: u32) {
        self.deadlines.retain(|(_, i, _)| *i != ifindex);
    }

    /// Time until the earliest deadline, for the poll timeout.
    pub fn next_timeout(&self, now: Instant) -> Option<Duration> {
        self.deadlines
            .iter()
            .map(|(deadline, _, _)| deadline.saturating_duration_since(now))
            .min()
    }

    /// Removes and returns every expired timer.
    pub fn pop_expired(&mut self, now: Instant) -> Vec<(u32, TimerKind)> {
        let mut expired = Vec::new();
        self.deadlines.retain(|(deadline, ifindex, kind)| {
            if *deadline <= now {
                expired.push((*ifindex, *kind));
                false
            } else {
                true
            }
        });
        expired
    }
}
