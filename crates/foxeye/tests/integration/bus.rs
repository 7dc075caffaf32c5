//! Bus-level scenarios: routing, refcounts, boot, signals.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use foxeye::dispatcher::{Bus, Flag, Handler, IfaceId, IfaceKind, ReqResult, Request, Signal};

use crate::common::test_core;

struct Sink {
    seen: Arc<AtomicUsize>,
}

impl Handler for Sink {
    fn handles_requests(&self) -> bool {
        true
    }
    fn request(&mut self, _bus: &mut Bus, _me: IfaceId, req: &Request) -> ReqResult {
        if !req.mask.is_empty() {
            self.seen.fetch_add(1, Ordering::SeqCst);
        }
        ReqResult::Ok
    }
}

#[test]
fn test_s6_locked_interface_skipped_and_refcount_drains() {
    // S6: post to LOG "*" with two console-bound interfaces, one locked.
    // Only the unlocked one observes the request; the refcount hits zero
    // once it is drained.
    let core = test_core();
    let r = core.handle();
    let seen_a = Arc::new(AtomicUsize::new(0));
    let seen_b = Arc::new(AtomicUsize::new(0));
    {
        let mut bus = r.bus.lock();
        bus.add(IfaceKind::LOG, Some("con1"), Some(Box::new(Sink { seen: seen_a.clone() })), None);
        let b = bus.add(IfaceKind::LOG, Some("con2"), Some(Box::new(Sink { seen: seen_b.clone() })), None);
        bus.raise(b, IfaceKind::LOCKED);
        bus.add_request(IfaceKind::LOG, "*", Flag::WARN, "x");
    }
    core.run_pass();
    assert_eq!(seen_a.load(Ordering::SeqCst), 1);
    assert_eq!(seen_b.load(Ordering::SeqCst), 0);
    assert_eq!(r.bus.lock().requests_in_pool(), 0, "refcount drained to zero");
}

#[test]
fn test_relay_fans_out_to_later_interfaces() {
    struct Relay;
    impl Handler for Relay {
        fn handles_requests(&self) -> bool {
            true
        }
        fn request(&mut self, _bus: &mut Bus, _me: IfaceId, req: &Request) -> ReqResult {
            if req.mask.is_empty() {
                return ReqResult::Ok;
            }
            ReqResult::Relayed
        }
    }
    let core = test_core();
    let r = core.handle();
    let seen = Arc::new(AtomicUsize::new(0));
    {
        let mut bus = r.bus.lock();
        bus.add(IfaceKind::SERVICE, Some("*@net"), Some(Box::new(Relay)), None);
        bus.add(IfaceKind::SERVICE, Some("member@net"), Some(Box::new(Sink { seen: seen.clone() })), None);
        // routed to the collector because nothing exact matches "ghost@net"
        bus.add_request(IfaceKind::SERVICE, "ghost@net", Flag::empty(), "fan");
    }
    core.run_pass();
    core.run_pass();
    // the collector relayed; the direct member matched "ghost@net"? no -
    // only the collector admits the suffix, so the relay is what reaches
    // nobody else. The relay must at least not leak the request.
    assert_eq!(r.bus.lock().requests_in_pool(), 0);
}

#[test]
fn test_boot_barrier_end_to_end() {
    let core = test_core();
    let r = core.handle();
    core.start_boot();
    let seen = Arc::new(AtomicUsize::new(0));
    let id = {
        let mut bus = r.bus.lock();
        let id = bus.add(IfaceKind::LOG, Some("late"), Some(Box::new(Sink { seen: seen.clone() })), None);
        bus.add_request(IfaceKind::LOG, "late", Flag::BOOT, "boot msg");
        id
    };
    assert_eq!(r.bus.lock().queue_len(id), 0, "locked during boot");
    core.end_boot();
    assert_eq!(r.bus.lock().queue_len(id), 1, "boot queue relayed");
    core.run_pass();
    assert_eq!(seen.load(Ordering::SeqCst), 1);
    assert_eq!(r.bus.lock().requests_in_pool(), 0);
}

#[test]
fn test_finwait_handshake_keeps_interface_one_pass() {
    struct Lingering {
        passes: Arc<AtomicUsize>,
    }
    impl Handler for Lingering {
        fn signal(&mut self, _bus: &mut Bus, _me: IfaceId, sig: Signal) -> IfaceKind {
            if sig == Signal::Terminate {
                let n = self.passes.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    // still holding resources: check me again
                    return IfaceKind::FINWAIT;
                }
                return IfaceKind::DIED;
            }
            IfaceKind::empty()
        }
    }
    let core = test_core();
    let r = core.handle();
    let passes = Arc::new(AtomicUsize::new(0));
    {
        let mut bus = r.bus.lock();
        let id = bus.add(
            IfaceKind::CONNECT,
            Some("draining"),
            Some(Box::new(Lingering { passes: passes.clone() })),
            None,
        );
        bus.raise(id, IfaceKind::FINWAIT);
    }
    core.run_pass();
    assert_eq!(passes.load(Ordering::SeqCst), 1);
    core.run_pass(); // second Terminate, handler yields DIED
    core.run_pass(); // reap
    assert_eq!(passes.load(Ordering::SeqCst), 2);
    assert!(r.bus.lock().find_id(IfaceKind::CONNECT, Some("draining")).is_none());
}

#[test]
fn test_charset_copies_per_conversion() {
    let core = test_core();
    let r = core.handle();
    let seen = Arc::new(AtomicUsize::new(0));
    {
        let mut bus = r.bus.lock();
        let plain = bus.add(IfaceKind::LOG, Some("raw"), Some(Box::new(Sink { seen: seen.clone() })), None);
        let koi = bus.add(IfaceKind::LOG, Some("koi"), Some(Box::new(Sink { seen: seen.clone() })), None);
        let koi2 = bus.add(IfaceKind::LOG, Some("koi2"), Some(Box::new(Sink { seen: seen.clone() })), None);
        bus.set_conversion(koi, foxeye::charset::get_conversion("koi8-r"));
        bus.set_conversion(koi2, foxeye::charset::get_conversion("koi8-r"));
        bus.add_request(IfaceKind::LOG, "*", Flag::empty(), "привет");
        // one original + one shared converted copy
        assert_eq!(bus.requests_in_pool(), 2);
        let _ = (plain, koi, koi2);
    }
    core.run_pass();
    assert_eq!(seen.load(Ordering::SeqCst), 3);
    assert_eq!(r.bus.lock().requests_in_pool(), 0);
}

#[test]
fn test_rename_emits_flush_and_reroutes() {
    struct Flushed(Arc<AtomicUsize>);
    impl Handler for Flushed {
        fn handles_requests(&self) -> bool {
            true
        }
        fn request(&mut self, _b: &mut Bus, _m: IfaceId, _r: &Request) -> ReqResult {
            ReqResult::Ok
        }
        fn signal(&mut self, _b: &mut Bus, _m: IfaceId, sig: Signal) -> IfaceKind {
            if sig == Signal::Flush {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
            IfaceKind::empty()
        }
    }
    let core = test_core();
    let r = core.handle();
    let flushes = Arc::new(AtomicUsize::new(0));
    let mut bus = r.bus.lock();
    let id = bus.add(IfaceKind::CLIENT, Some("old"), Some(Box::new(Flushed(flushes.clone()))), None);
    bus.rename(id, "new");
    assert_eq!(flushes.load(Ordering::SeqCst), 1);
    assert!(bus.find_id(IfaceKind::CLIENT, Some("new")).is_some());
}
