//! In-memory record for a peer, local or remote (spec §3 "Estate").

use std::collections::HashSet;
use std::time::{Duration, Instant};

use crate::keep::Acceptance;
use crate::socket::HostAddr;
use crate::transaction::TxIndex;

/// Reserved uid meaning "unassigned / bootstrap".
pub const UNASSIGNED_UID: u32 = 0;

/// Per-remote keep-alive timer, ticked by [`Estate::manage`].
#[derive(Debug, Clone)]
pub struct Timer {
    period: Duration,
    offset: Duration,
    last_fired: Option<Instant>,
}

impl Timer {
    /// Builds a timer with the given cadence.
    pub fn new(period: Duration, offset: Duration) -> Self {
        Self {
            period,
            offset,
            last_fired: None,
        }
    }

    /// Whether the timer is due to fire at `now`.
    pub fn due(&self, now: Instant) -> bool {
        match self.last_fired {
            None => true,
            Some(last) => now.saturating_duration_since(last) + self.offset >= self.period,
        }
    }

    /// Marks the timer as having fired at `now`.
    pub fn fire(&mut self, now: Instant) {
        self.last_fired = Some(now);
    }
}

/// A peer in the protocol: the local estate or one remote.
#[derive(Debug, Clone)]
pub struct Estate {
    /// Stable id, unique within the stack. 0 while bootstrapping.
    pub uid: u32,
    /// Unique human readable name.
    pub name: String,
    /// Bound or last-known host address.
    pub ha: HostAddr,
    /// Outbound session id (own epoch counter, only meaningful once this
    /// estate is used as a remote's peer — i.e. on the local estate).
    pub sid: u32,
    /// Last accepted inbound session id from this peer. Only meaningful
    /// on remotes.
    pub rsid: u32,
    /// Hex-encoded signing (verify) key.
    pub sighex: String,
    /// Hex-encoded private or public box key (private for local, public
    /// for remotes).
    pub prihex: String,
    /// Acceptance state. Only meaningful on remotes; local is always
    /// treated as accepted.
    pub acceptance: Acceptance,
    /// Whether new remotes default to accepted without an explicit join
    /// approval (mirrors the safe keep's `auto` flag).
    pub auto: bool,
    /// Whether this estate plays the rendezvous (`main`) role.
    pub main: bool,
    /// Keep-alive cadence for this remote.
    pub timer: Timer,
    /// Transaction indexes currently bound to this estate.
    pub indexes: HashSet<TxIndex>,
}

impl Estate {
    /// Builds a fresh estate with no assigned uid or key material.
    pub fn new(name: impl Into<String>, ha: HostAddr) -> Self {
        Self {
            uid: UNASSIGNED_UID,
            name: name.into(),
            ha,
            sid: 0,
            rsid: 0,
            sighex: String::new(),
            prihex: String::new(),
            acceptance: Acceptance::Pending,
            auto: false,
            main: false,
            timer: Timer::new(Duration::from_secs(1), Duration::from_millis(500)),
            indexes: HashSet::new(),
        }
    }

    /// Advances the outbound session id, wrapping past `u32::MAX` back to
    /// 1 (0 stays reserved for join), mirroring `RemoteEstate.nextSid`.
    pub fn next_sid(&mut self) -> u32 {
        self.sid = self.sid.wrapping_add(1);
        if self.sid == 0 {
            self.sid = 1;
        }
        self.sid
    }

    /// Whether `rsid` is an acceptable next session id from this remote:
    /// non-decreasing, allowing equal (retransmits) and strictly greater
    /// (a fresh session).
    pub fn valid_rsid(&self, rsid: u32) -> bool {
        rsid >= self.rsid
    }

    /// Per-remote timer-driven step. `cascade` chains a failing alive into
    /// re-join/re-allow/re-alive; `immediate` fires the first attempt
    /// without waiting for the timer. The actual transaction spawning is
    /// done by the stack, which owns the registries this estate cannot
    /// reach; this method only reports whether a step is due.
    pub fn manage(&mut self, now: Instant, immediate: bool) -> bool {
        if immediate || self.timer.due(now) {
            self.timer.fire(now);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> HostAddr {
        "127.0.0.1:7530".parse().unwrap()
    }

    #[test]
    fn next_sid_wraps_past_zero() {
        let mut e = Estate::new("bob", addr());
        e.sid = u32::MAX;
        assert_eq!(e.next_sid(), 1);
    }

    #[test]
    fn valid_rsid_rejects_replay() {
        let mut e = Estate::new("bob", addr());
        e.rsid = 5;
        assert!(e.valid_rsid(5));
        assert!(e.valid_rsid(6));
        assert!(!e.valid_rsid(4));
    }

    #[test]
    fn manage_fires_immediately_when_asked() {
        let mut e = Estate::new("bob", addr());
        assert!(e.manage(Instant::now(), true));
    }
}
