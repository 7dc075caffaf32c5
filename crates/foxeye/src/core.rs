//! The process-wide core: every shared table under one roof, plus the
//! scheduler loop that drives the bus.
//!
//! One `Core` exists per process and lives as long as the event loop.
//! Handlers reach the services through [`CoreRef`], a cheap bundle of
//! shared handles.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::bindtable::BindTable;
use crate::chain::{ChainMgr, FilterInit};
use crate::config::Settings;
use crate::dcc::{CtcpDccFn, TransferDoneFn};
use crate::dispatcher::{BusHandle, Flag, IfaceKind, Signal};
use crate::filters::bind::TextFilterFn;
use crate::session::{DccCmdFn, Listfile, LoginFn, OpenListfile, PasswdFn};
use crate::socket::SocketSet;
use crate::timer::Timers;

/// Bounded sleep slice of the scheduler when a pass found no work.
pub const SLEEP_SLICE: Duration = Duration::from_millis(200);

/// Every bindtable the core consults.
pub struct Binds {
    pub connchain_grow: BindTable<FilterInit>,
    pub login: BindTable<LoginFn>,
    pub passwd: BindTable<PasswdFn>,
    /// `.command` session commands.
    pub dcc: BindTable<DccCmdFn>,
    pub in_filter: Arc<BindTable<TextFilterFn>>,
    pub out_filter: Arc<BindTable<TextFilterFn>>,
    pub ctcp_dcc: BindTable<CtcpDccFn>,
    pub dcc_got: BindTable<TransferDoneFn>,
    pub dcc_sent: BindTable<TransferDoneFn>,
}

impl Binds {
    fn new() -> Binds {
        Binds {
            connchain_grow: BindTable::new("connchain-grow"),
            login: BindTable::new("login"),
            passwd: BindTable::new("passwd"),
            dcc: BindTable::new("dcc"),
            in_filter: Arc::new(BindTable::new("in-filter")),
            out_filter: Arc::new(BindTable::new("out-filter")),
            ctcp_dcc: BindTable::new("ctcp-dcc"),
            dcc_got: BindTable::new("dcc-got"),
            dcc_sent: BindTable::new("dcc-sent"),
        }
    }
}

/// Shared-service bundle handed to handlers and workers.
#[derive(Clone)]
pub struct CoreRef {
    pub bus: BusHandle,
    pub sockets: Arc<SocketSet>,
    pub chains: Arc<ChainMgr>,
    pub timers: Arc<Timers>,
    pub binds: Arc<Binds>,
    pub config: Arc<Settings>,
    pub listfile: Arc<dyn Listfile>,
}

/// The runtime core.
pub struct Core {
    r: CoreRef,
}

impl Core {
    /// Build the core with its stock filters and bindings registered.
    pub fn new(config: Arc<Settings>, listfile: Option<Arc<dyn Listfile>>) -> Core {
        let strict = config.get_bool("strict-backresolve");
        let sockets = SocketSet::new(strict);
        let chains = ChainMgr::new(sockets.clone());
        let bus = BusHandle::new();
        let r = CoreRef {
            bus: bus.clone(),
            sockets,
            chains,
            timers: Arc::new(Timers::new()),
            binds: Arc::new(Binds::new()),
            config,
            listfile: listfile.unwrap_or_else(|| Arc::new(OpenListfile)),
        };
        bus.lock().set_core(r.clone());
        crate::filters::register_stock(&r);
        crate::session::register_stock(&r);
        debug!("core initialized");
        Core { r }
    }

    pub fn handle(&self) -> CoreRef {
        self.r.clone()
    }

    /// Enter the boot phase: collect all messages, lock newcomers.
    pub fn start_boot(&self) {
        self.r.bus.lock().start_boot();
    }

    /// Leave the boot phase: unlock, relay collected messages.
    pub fn end_boot(&self) {
        self.r.bus.lock().end_boot();
    }

    /// One full scheduler pass: expired timers first, then every
    /// interface in creation order. The lock is taken per step so worker
    /// tasks interleave freely.
    pub fn run_pass(&self) {
        for (mask, name, sig) in self.r.timers.expired() {
            self.r.bus.lock().send_signal(mask, &name, sig);
        }
        let len = self.r.bus.lock().pass_len();
        for pos in 0..len {
            self.r.bus.lock().tick(pos);
        }
    }

    /// The dispatcher loop. Runs until the task is cancelled or the
    /// process exits through the shutdown path.
    pub async fn run(&self) {
        loop {
            self.run_pass();
            let busy = self.r.bus.lock().has_queued_work();
            if !busy {
                // sleep on the socket poller for up to the bounded slice
                let _ = tokio::time::timeout(SLEEP_SLICE, self.r.sockets.wait_pass_async()).await;
            } else {
                tokio::task::yield_now().await;
            }
        }
    }

    /// Graceful exit: shutdown waves, then the process ends.
    pub fn shutdown(&self, reason: &str, code: i32) -> ! {
        {
            let mut bus = self.r.bus.lock();
            bus.log(Flag::BOOT, reason);
            bus.shutdown_waves(Some(reason), code > 0);
        }
        std::process::exit(code);
    }

    /// Rehash: flush every interface.
    pub fn flush_all(&self) {
        self.r.bus.lock().send_signal(IfaceKind::any(), "*", Signal::Flush);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{Bus, Handler, IfaceId, ReqResult, Request};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Probe(Arc<AtomicUsize>);

    impl Handler for Probe {
        fn handles_requests(&self) -> bool {
            true
        }
        fn request(&mut self, _b: &mut Bus, _me: IfaceId, req: &Request) -> ReqResult {
            if !req.mask.is_empty() {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
            ReqResult::Ok
        }
        fn signal(
            &mut self,
            _b: &mut Bus,
            _me: IfaceId,
            sig: Signal,
        ) -> IfaceKind {
            if sig == Signal::Timeout {
                self.0.fetch_add(100, Ordering::SeqCst);
            }
            IfaceKind::empty()
        }
    }

    fn core() -> Core {
        Core::new(Arc::new(Settings::with_core_defaults()), None)
    }

    #[test]
    fn test_pass_delivers_requests() {
        let c = core();
        let seen = Arc::new(AtomicUsize::new(0));
        {
            let mut bus = c.r.bus.lock();
            bus.add(IfaceKind::LOG, Some("sink"), Some(Box::new(Probe(seen.clone()))), None);
            bus.add_request(IfaceKind::LOG, "sink", Flag::empty(), "one");
        }
        c.run_pass();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_timer_routes_signal_through_pass() {
        let c = core();
        let seen = Arc::new(AtomicUsize::new(0));
        {
            let mut bus = c.r.bus.lock();
            bus.add(IfaceKind::CONNECT, Some("t"), Some(Box::new(Probe(seen.clone()))), None);
        }
        c.r.timers.new_timer(IfaceKind::CONNECT, "t", Signal::Timeout, 0);
        c.run_pass();
        assert_eq!(seen.load(Ordering::SeqCst), 100);
        assert_eq!(c.r.timers.pending(), 0);
    }

    #[test]
    fn test_stock_filters_registered() {
        let c = core();
        for tag in ["x", "y", "b", "Z", "S", "s"] {
            assert!(
                !c.r.binds.connchain_grow.lookup(tag, crate::peer::UserFlag::all()).is_empty(),
                "stock filter {tag} missing"
            );
        }
    }
}
