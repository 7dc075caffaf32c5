//! Timer wheel: wall-clock scheduled signal deliveries.
//!
//! A timer does not call anything itself. When it expires, the scheduler
//! pass picks it up and sends the chosen signal through the dispatcher, so
//! expiries compose with interface locking like any other signal.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::dispatcher::{IfaceKind, Signal};

/// Timer identity.
pub type Tid = u32;

struct Entry {
    due: u64,
    mask: IfaceKind,
    name: String,
    signal: Signal,
}

/// The wheel. Keyed by absolute wall-time seconds.
pub struct Timers {
    inner: Mutex<Wheel>,
}

struct Wheel {
    entries: BTreeMap<Tid, Entry>,
    next_tid: Tid,
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO).as_secs()
}

impl Timers {
    pub fn new() -> Timers {
        Timers { inner: Mutex::new(Wheel { entries: BTreeMap::new(), next_tid: 1 }) }
    }

    /// Schedule `signal` for interfaces matching `mask`/`name` after
    /// `seconds`. Returns the tid for [`kill_timer`](Self::kill_timer).
    pub fn new_timer(&self, mask: IfaceKind, name: &str, signal: Signal, seconds: u64) -> Tid {
        let mut w = self.inner.lock().unwrap();
        let tid = w.next_tid;
        w.next_tid = w.next_tid.wrapping_add(1).max(1);
        w.entries.insert(
            tid,
            Entry { due: now_secs() + seconds, mask, name: name.to_owned(), signal },
        );
        tid
    }

    /// Remove a pending timer; unknown tids are ignored.
    pub fn kill_timer(&self, tid: Tid) {
        self.inner.lock().unwrap().entries.remove(&tid);
    }

    /// Drain every expired timer, returning the deliveries for the caller
    /// to route through the bus.
    pub fn expired(&self) -> Vec<(IfaceKind, String, Signal)> {
        let now = now_secs();
        let mut w = self.inner.lock().unwrap();
        let due: Vec<Tid> = w
            .entries
            .iter()
            .filter(|(_, e)| e.due <= now)
            .map(|(&tid, _)| tid)
            .collect();
        due.into_iter()
            .filter_map(|tid| w.entries.remove(&tid))
            .map(|e| (e.mask, e.name, e.signal))
            .collect()
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }
}

impl Default for Timers {
    fn default() -> Self {
        Timers::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_and_kill() {
        let t = Timers::new();
        let tid = t.new_timer(IfaceKind::CONNECT, "peer", Signal::Timeout, 3600);
        assert_eq!(t.pending(), 1);
        t.kill_timer(tid);
        assert_eq!(t.pending(), 0);
        t.kill_timer(tid); // double kill is a no-op
    }

    #[test]
    fn test_zero_delay_expires_immediately() {
        let t = Timers::new();
        t.new_timer(IfaceKind::LISTEN, "2021", Signal::Timeout, 0);
        let fired = t.expired();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].1, "2021");
        assert_eq!(fired[0].2, Signal::Timeout);
        assert_eq!(t.pending(), 0);
    }

    #[test]
    fn test_future_timer_stays() {
        let t = Timers::new();
        t.new_timer(IfaceKind::CONNECT, "x", Signal::Timeout, 3600);
        assert!(t.expired().is_empty());
        assert_eq!(t.pending(), 1);
    }
}
