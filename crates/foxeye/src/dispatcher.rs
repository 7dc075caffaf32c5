//! Interface bus: registry, request routing, signal delivery, scheduler.
//!
//! Everything that wants to exist in the daemon registers an *interface*:
//! a named, typed sink with an optional handler. Work travels either as
//! pool-allocated, reference-counted *requests* (queued, matched by
//! name/type) or as *signals* (delivered synchronously). One scheduler
//! loop drains queues in interface-creation order; worker tasks only ever
//! touch the bus through [`BusHandle`].

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use slab::Slab;
use tracing::{debug, error, trace, warn};

use crate::charset::Conversion;
use crate::core::CoreRef;
use crate::util::glob;

/// Interface identity inside the bus.
pub type IfaceId = usize;

/// Interface type bits. A closed vocabulary; an interface usually carries
/// one role bit plus zero or more of the state bits (`LOCKED`, `DIED`,
/// `FINWAIT`, `PENDING`).
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct IfaceKind(pub u32);

impl IfaceKind {
    pub const CONSOLE: IfaceKind = IfaceKind(1 << 0);
    pub const LOG: IfaceKind = IfaceKind(1 << 1);
    pub const LISTEN: IfaceKind = IfaceKind(1 << 2);
    pub const CONNECT: IfaceKind = IfaceKind(1 << 3);
    pub const CLIENT: IfaceKind = IfaceKind(1 << 4);
    pub const SERVICE: IfaceKind = IfaceKind(1 << 5);
    pub const MODULE: IfaceKind = IfaceKind(1 << 6);
    pub const DIRECT: IfaceKind = IfaceKind(1 << 7);
    pub const DCCALIAS: IfaceKind = IfaceKind(1 << 8);
    pub const TEMP: IfaceKind = IfaceKind(1 << 9);
    pub const INIT: IfaceKind = IfaceKind(1 << 10);
    pub const LOCKED: IfaceKind = IfaceKind(1 << 28);
    pub const DIED: IfaceKind = IfaceKind(1 << 29);
    pub const FINWAIT: IfaceKind = IfaceKind(1 << 30);
    pub const PENDING: IfaceKind = IfaceKind(1 << 31);

    pub const fn empty() -> IfaceKind {
        IfaceKind(0)
    }

    pub const fn any() -> IfaceKind {
        IfaceKind(u32::MAX)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: IfaceKind) -> bool {
        self.0 & other.0 != 0
    }

    pub fn contains_all(self, other: IfaceKind) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for IfaceKind {
    type Output = IfaceKind;
    fn bitor(self, rhs: IfaceKind) -> IfaceKind {
        IfaceKind(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for IfaceKind {
    fn bitor_assign(&mut self, rhs: IfaceKind) {
        self.0 |= rhs.0;
    }
}

impl std::ops::BitAnd for IfaceKind {
    type Output = IfaceKind;
    fn bitand(self, rhs: IfaceKind) -> IfaceKind {
        IfaceKind(self.0 & rhs.0)
    }
}

impl std::ops::Not for IfaceKind {
    type Output = IfaceKind;
    fn not(self) -> IfaceKind {
        IfaceKind(!self.0)
    }
}

impl fmt::Debug for IfaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IfaceKind({:#x})", self.0)
    }
}

/// Request flag bits.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Flag(pub u32);

impl Flag {
    /// Reserved: payload would be an out-of-band signal code. Signals are
    /// delivered through [`Bus::send_signal`]; the bit exists so wire
    /// formats stay stable.
    pub const SIGNAL: Flag = Flag(1 << 0);
    pub const DEBUG: Flag = Flag(1 << 1);
    pub const ERROR: Flag = Flag(1 << 2);
    pub const WARN: Flag = Flag(1 << 3);
    pub const BOOT: Flag = Flag(1 << 4);
    /// Connection-state log line.
    pub const CONN: Flag = Flag(1 << 5);
    pub const REPORT: Flag = Flag(1 << 6);
    /// Insert at queue head.
    pub const QUICK: Flag = Flag(1 << 7);
    /// Insert just before the queue tail.
    pub const AHEAD: Flag = Flag(1 << 8);
    /// CTCP request payload.
    pub const T_CTCP: Flag = Flag(1 << 9);
    /// CTCP reply payload.
    pub const T_CTCR: Flag = Flag(1 << 10);
    pub const T_NOTICE: Flag = Flag(1 << 11);
    pub const T_ACTION: Flag = Flag(1 << 12);

    pub const fn empty() -> Flag {
        Flag(0)
    }

    pub fn contains(self, other: Flag) -> bool {
        self.0 & other.0 != 0
    }
}

impl std::ops::BitOr for Flag {
    type Output = Flag;
    fn bitor(self, rhs: Flag) -> Flag {
        Flag(self.0 | rhs.0)
    }
}

impl fmt::Debug for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Flag({:#x})", self.0)
    }
}

/// Signals delivered synchronously to interfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Release resources; the handler may return `FINWAIT` to ask for one
    /// more pass before being reaped.
    Terminate,
    /// Best-effort, non-recoverable shutdown.
    Shutdown,
    /// Flush caches / state changed (also emitted after a rename).
    Flush,
    /// Report status through a request.
    Report,
    Stop,
    Continue,
    /// Re-register config directives.
    Reg,
    /// Module-local out-of-band message (carried in [`Bus::local`]).
    Local,
    Timeout,
}

/// What a request handler did with the head entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqResult {
    /// Served; pop and release.
    Ok,
    /// Not servable now; keep it and skip this interface until next tick.
    Rejected,
    /// Re-post to further matching interfaces, then pop.
    Relayed,
}

/// An addressed message shared by reference across queues.
pub struct Request {
    pub from: Option<IfaceId>,
    /// Target name the poster used.
    pub to: String,
    /// Target type mask.
    pub mask: IfaceKind,
    pub flags: Flag,
    /// Payload, in the charset of whoever holds this copy.
    pub text: Bytes,
    refs: u32,
}

impl Request {
    /// Payload as internal text (lossy only for converted copies).
    pub fn text_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.text)
    }
}

/// An interface's behavior. Implementations may serve requests, signals,
/// or both; an interface registered without a handler is a clone that only
/// aliases its parent in name lookups.
pub trait Handler: Send {
    /// Whether queued requests should be routed here (otherwise they climb
    /// to the parent interface).
    fn handles_requests(&self) -> bool {
        false
    }

    /// Serve one request.
    fn request(&mut self, _bus: &mut Bus, _me: IfaceId, _req: &Request) -> ReqResult {
        ReqResult::Ok
    }

    /// Receive a signal; returned bits are OR'd into the interface type by
    /// the dispatcher.
    fn signal(&mut self, _bus: &mut Bus, _me: IfaceId, _sig: Signal) -> IfaceKind {
        IfaceKind::empty()
    }
}

struct IfaceSlot {
    kind: IfaceKind,
    name: Option<String>,
    handler: Option<Box<dyn Handler>>,
    /// Capabilities captured at registration; valid even while the
    /// handler box is temporarily out for a nested call.
    has_handler: bool,
    serves_requests: bool,
    conv: Option<Arc<Conversion>>,
    parent: Option<IfaceId>,
    queue: VecDeque<usize>,
    /// Head was rejected; skip until the next scheduler pass.
    rejected: bool,
}

/// The bus state. Handlers receive `&mut Bus` and may re-enter any public
/// method; worker tasks go through [`BusHandle`] instead.
pub struct Bus {
    ifaces: Slab<IfaceSlot>,
    /// Scheduler pass order = interface creation order (with the
    /// delete-swaps-last twist the service fan-out contract allows).
    order: Vec<IfaceId>,
    names: BTreeMap<String, Vec<IfaceId>>,
    pool: Slab<Request>,
    /// Context stack for nested handler calls.
    stack: Vec<IfaceId>,
    current: Option<IfaceId>,
    console: Option<IfaceId>,
    boot: Option<IfaceId>,
    /// Bits OR'd into every new interface (LOCKED during boot).
    kind_or: IfaceKind,
    /// Out-of-band argument for `Signal::Local` (the BindResult slot).
    pub local: Option<String>,
    pub shutdown_reason: Option<String>,
    pub pid_path: Option<std::path::PathBuf>,
    core: Option<CoreRef>,
    req_max: usize,
}

/// Cross-task handle to the bus.
#[derive(Clone)]
pub struct BusHandle(Arc<Mutex<Bus>>);

/// Result of [`BusHandle::find`]: keeps the bus locked while the caller
/// inspects the found interface, the Rust reading of "find leaves the bus
/// lock held".
pub struct Found<'a> {
    pub guard: MutexGuard<'a, Bus>,
    pub id: IfaceId,
}

impl Bus {
    fn new() -> Bus {
        Bus {
            ifaces: Slab::new(),
            order: Vec::new(),
            names: BTreeMap::new(),
            pool: Slab::new(),
            stack: Vec::new(),
            current: None,
            console: None,
            boot: None,
            kind_or: IfaceKind::empty(),
            local: None,
            shutdown_reason: None,
            pid_path: None,
            core: None,
            req_max: 0,
        }
    }

    /// Services bundle (sockets, chains, timers, binds, config).
    ///
    /// # Panics
    /// Before `Core::new` finished wiring.
    pub fn core(&self) -> &CoreRef {
        self.core.as_ref().expect("bus used before core wiring")
    }

    pub(crate) fn set_core(&mut self, core: CoreRef) {
        self.core = Some(core);
    }

    // -- registry -----------------------------------------------------------

    /// Register an interface. `handler: None` creates a clone usable only
    /// as a lookup alias for `parent`.
    pub fn add(
        &mut self,
        kind: IfaceKind,
        name: Option<&str>,
        handler: Option<Box<dyn Handler>>,
        parent: Option<IfaceId>,
    ) -> IfaceId {
        let has_handler = handler.is_some();
        let serves_requests = handler.as_ref().map_or(false, |h| h.handles_requests());
        let slot = IfaceSlot {
            kind: kind | self.kind_or,
            name: name.map(str::to_owned),
            handler,
            has_handler,
            serves_requests,
            conv: None,
            parent,
            queue: VecDeque::new(),
            rejected: false,
        };
        let id = self.ifaces.insert(slot);
        self.order.push(id);
        if let Some(n) = name {
            self.names.entry(n.to_owned()).or_default().push(id);
        }
        debug!(id, ?kind, name = name.unwrap_or(""), "iface: added");
        id
    }

    /// Attach a charset conversion handle.
    pub fn set_conversion(&mut self, id: IfaceId, conv: Option<Arc<Conversion>>) {
        if let Some(s) = self.ifaces.get_mut(id) {
            s.conv = conv;
        }
    }

    pub fn kind(&self, id: IfaceId) -> IfaceKind {
        self.ifaces.get(id).map(|s| s.kind).unwrap_or(IfaceKind::DIED)
    }

    pub fn name(&self, id: IfaceId) -> Option<&str> {
        self.ifaces.get(id).and_then(|s| s.name.as_deref())
    }

    pub fn queue_len(&self, id: IfaceId) -> usize {
        self.ifaces.get(id).map(|s| s.queue.len()).unwrap_or(0)
    }

    /// OR state bits into an interface (workers flag `FINWAIT`/`DIED` this
    /// way; the dispatcher is the only clearer).
    pub fn raise(&mut self, id: IfaceId, bits: IfaceKind) {
        if let Some(s) = self.ifaces.get_mut(id) {
            s.kind |= bits;
        }
    }

    /// Replace the whole type word (used by handlers that retire their
    /// interface, e.g. `kind = DIED`).
    pub fn set_kind(&mut self, id: IfaceId, kind: IfaceKind) {
        if let Some(s) = self.ifaces.get_mut(id) {
            s.kind = kind;
        }
    }

    /// First live interface matching all bits of `kind` and, when given,
    /// the exact name. `None` name means "any of this type".
    pub fn find_id(&self, kind: IfaceKind, name: Option<&str>) -> Option<IfaceId> {
        match name {
            None => self.order.iter().copied().find(|&id| {
                let s = &self.ifaces[id];
                s.kind.contains_all(kind) && !s.kind.contains(IfaceKind::DIED)
            }),
            Some(n) => self.names.get(n).and_then(|ids| {
                ids.iter().copied().find(|&id| {
                    let s = &self.ifaces[id];
                    s.kind.contains_all(kind) && !s.kind.contains(IfaceKind::DIED)
                })
            }),
        }
    }

    /// Mark this interface as the console force-feed target.
    pub fn set_console(&mut self, id: Option<IfaceId>) {
        self.console = id;
    }

    pub fn console(&self) -> Option<IfaceId> {
        self.console
    }

    /// Push an interface onto the context stack; `None` inherits the
    /// current one.
    pub fn set_iface(&mut self, id: Option<IfaceId>) -> Option<IfaceId> {
        let prev = self.current;
        let eff = id.or(prev);
        self.stack.push(eff.unwrap_or(usize::MAX));
        self.current = eff;
        prev
    }

    /// Pop the context stack. Returns `Err` on underflow, which the caller
    /// escalates as lock-stack corruption (exit code 7).
    pub fn unset_iface(&mut self) -> Result<(), ()> {
        if self.stack.pop().is_none() {
            return Err(());
        }
        self.current = self
            .stack
            .last()
            .copied()
            .filter(|&v| v != usize::MAX)
            .or(self.boot);
        Ok(())
    }

    pub fn current(&self) -> Option<IfaceId> {
        self.current
    }

    /// Rename an interface: queued requests that targeted the old name are
    /// rewritten, the name index updated, and `Flush` delivered.
    pub fn rename(&mut self, id: IfaceId, newname: &str) {
        let Some(old) = self.ifaces.get(id).map(|s| s.name.clone()) else { return };
        debug!(id, old = old.as_deref().unwrap_or(""), new = newname, "iface: rename");
        if let Some(oldname) = &old {
            if oldname != "*" {
                let req_ids: Vec<usize> =
                    self.ifaces[id].queue.iter().copied().collect();
                for rid in req_ids {
                    if let Some(req) = self.pool.get_mut(rid) {
                        if req.to == *oldname {
                            req.to = newname.to_owned();
                        }
                    }
                }
            }
            if let Some(ids) = self.names.get_mut(oldname) {
                ids.retain(|&i| i != id);
                if ids.is_empty() {
                    self.names.remove(oldname);
                }
            }
        }
        self.ifaces[id].name = Some(newname.to_owned());
        self.names.entry(newname.to_owned()).or_default().push(id);
        self.signal_one(id, Signal::Flush);
    }

    // -- request pool -------------------------------------------------------

    fn alloc_request(
        &mut self,
        from: Option<IfaceId>,
        to: &str,
        mask: IfaceKind,
        flags: Flag,
        text: Bytes,
    ) -> usize {
        let id = self.pool.insert(Request { from, to: to.to_owned(), mask, flags, text, refs: 0 });
        self.req_max = self.req_max.max(self.pool.len());
        id
    }

    fn ref_request(&mut self, rid: usize) {
        self.pool[rid].refs += 1;
    }

    fn unref_request(&mut self, rid: usize) {
        let req = &mut self.pool[rid];
        if req.refs <= 1 {
            self.pool.remove(rid);
        } else {
            req.refs -= 1;
        }
    }

    pub fn request(&self, rid: usize) -> &Request {
        &self.pool[rid]
    }

    /// Total refcount of the request `rid` (testing/reporting aid).
    pub fn request_refs(&self, rid: usize) -> u32 {
        self.pool.get(rid).map(|r| r.refs).unwrap_or(0)
    }

    pub fn requests_in_pool(&self) -> usize {
        self.pool.len()
    }

    // -- queueing -----------------------------------------------------------

    /// Resolve clone → parent until a request-capable interface is found.
    fn request_target(&self, mut id: IfaceId) -> Option<IfaceId> {
        loop {
            let s = self.ifaces.get(id)?;
            if s.serves_requests {
                return Some(id);
            }
            id = s.parent?;
        }
    }

    /// Enqueue `rid` on `to` honouring lock state and queue priorities.
    fn enqueue(&mut self, to: IfaceId, rid: usize) -> bool {
        let Some(s) = self.ifaces.get(to) else { return false };
        if s.kind.contains(IfaceKind::LOCKED | IfaceKind::DIED) {
            return false;
        }
        let Some(target) = self.request_target(to) else { return false };
        let flags = self.pool[rid].flags;
        let q = &mut self.ifaces[target].queue;
        if flags.contains(Flag::QUICK) {
            q.push_front(rid);
        } else if flags.contains(Flag::AHEAD) && !q.is_empty() {
            q.insert(q.len() - 1, rid);
        } else {
            q.push_back(rid);
        }
        self.ref_request(rid);
        trace!(target, rid, qsize = self.ifaces[target].queue.len(), "enqueue");
        true
    }

    /// Collect interfaces a plain (wildcard-free) target name routes to:
    /// exact matches, then `@suffix` service collectors when nothing exact
    /// matched, then every interface named `*` of the type.
    fn match_plain(&self, mask: IfaceKind, name: &str) -> Vec<IfaceId> {
        let mut out = Vec::new();
        if let Some(ids) = self.names.get(name) {
            for &id in ids {
                if self.ifaces[id].kind.contains(mask) {
                    out.push(id);
                }
            }
        }
        if out.is_empty() {
            if let Some(at) = name.rfind('@') {
                let suffix = &name[at..];
                for &id in &self.order {
                    let s = &self.ifaces[id];
                    if s.kind.contains(mask) {
                        if let Some(n) = &s.name {
                            if glob::match_score(suffix, n).map_or(false, |sc| sc > 1) {
                                out.push(id);
                            }
                        }
                    }
                }
            }
        }
        if let Some(ids) = self.names.get("*") {
            for &id in ids {
                if self.ifaces[id].kind.contains(mask) && !out.contains(&id) {
                    out.push(id);
                }
            }
        }
        out
    }

    /// Post a request to every interface matching `mask`/`name_mask`.
    pub fn add_request(&mut self, mask: IfaceKind, name_mask: &str, flags: Flag, text: &str) {
        if mask.is_empty() {
            return;
        }
        let from = self.current;
        let wild = glob::have_wildcard(name_mask).is_some();
        let mut targets: Vec<IfaceId> = Vec::new();
        let mut feed_console = false;
        if !wild {
            targets = self.match_plain(mask, name_mask);
        } else {
            for &id in &self.order {
                let s = &self.ifaces[id];
                if !s.kind.contains(mask) {
                    continue;
                }
                if Some(id) == self.console {
                    feed_console = true; // the console is force-fed on globs
                    continue;
                }
                let name = s.name.as_deref().unwrap_or("");
                if glob::match_score(name_mask, name).is_some() {
                    targets.push(id);
                }
            }
        }
        if !flags.contains(Flag::DEBUG) {
            trace!(?mask, name_mask, n = targets.len(), text, "add_request");
        }
        let rid = self.alloc_request(from, name_mask, mask, flags, Bytes::copy_from_slice(text.as_bytes()));
        self.deliver(rid, &targets, text);
        if feed_console {
            if let Some(cid) = self.console {
                self.run_request_now(cid, rid);
            }
        }
        if self.pool.get(rid).map(|r| r.refs == 0).unwrap_or(false) {
            self.pool.remove(rid);
        }
    }

    /// Enqueue `rid` on each target, materializing converted copies so
    /// every interface reads exactly one flat text in its own charset.
    fn deliver(&mut self, rid: usize, targets: &[IfaceId], text: &str) {
        // one converted request per distinct conversion handle
        let mut converted: Vec<(Arc<Conversion>, usize)> = Vec::new();
        for &id in targets {
            let conv = self.ifaces.get(id).and_then(|s| s.conv.clone());
            let use_rid = match conv {
                None => rid,
                Some(c) => {
                    if let Some((_, crid)) =
                        converted.iter().find(|(k, _)| Arc::ptr_eq(k, &c))
                    {
                        *crid
                    } else {
                        let (from, to, mask, flags) = {
                            let r = &self.pool[rid];
                            (r.from, r.to.clone(), r.mask, r.flags)
                        };
                        let crid = self.alloc_request(from, &to, mask, flags, c.encode(text));
                        converted.push((c.clone(), crid));
                        crid
                    }
                }
            };
            self.enqueue(id, use_rid);
        }
        // converted copies nobody accepted go straight back to the pool
        for (_, crid) in converted {
            if self.pool.get(crid).map(|r| r.refs == 0).unwrap_or(false) {
                self.pool.remove(crid);
            }
        }
    }

    /// Post directly to one interface, bypassing matching.
    pub fn new_request(&mut self, to: IfaceId, flags: Flag, text: &str) {
        let Some(s) = self.ifaces.get(to) else {
            warn!(to, "new_request to unknown interface");
            return;
        };
        if s.kind.contains(IfaceKind::DIED) {
            return;
        }
        let name = s.name.clone().unwrap_or_default();
        let mask = s.kind;
        let from = self.current;
        let rid = self.alloc_request(from, &name, mask, flags, Bytes::copy_from_slice(text.as_bytes()));
        self.deliver(rid, &[to], text);
        if self.pool.get(rid).map(|r| r.refs == 0).unwrap_or(false) {
            self.pool.remove(rid);
        }
    }

    /// Re-post an already-received request to further matching interfaces,
    /// skipping the current source.
    pub fn relay_request(&mut self, rid: usize) {
        let (mask, to, refs_before) = {
            let Some(r) = self.pool.get(rid) else { return };
            (r.mask, r.to.clone(), r.refs)
        };
        if mask.is_empty() {
            return;
        }
        let mut targets = Vec::new();
        for &id in &self.order {
            if Some(id) == self.current {
                continue;
            }
            let s = &self.ifaces[id];
            if s.kind.contains(mask)
                && glob::match_score(&to, s.name.as_deref().unwrap_or("")).is_some()
            {
                targets.push(id);
            }
        }
        for id in targets {
            self.enqueue(id, rid);
        }
        trace!(rid, refs_before, refs_after = self.pool[rid].refs, "relay_request");
    }

    /// Re-post a received request under a new target name and type mask
    /// (service fan-out). Matching covers exact names and `@suffix`
    /// collectors; the catch-all tier is not consulted.
    pub fn relay_as(&mut self, mask: IfaceKind, name: &str, rid: usize) {
        if mask.is_empty() || name.is_empty() {
            return;
        }
        let (from, flags, text) = {
            let Some(r) = self.pool.get(rid) else { return };
            (r.from, r.flags, r.text.clone())
        };
        let nrid = self.alloc_request(from, name, mask, flags, text);
        let mut targets: Vec<IfaceId> = Vec::new();
        if let Some(ids) = self.names.get(name) {
            for &id in ids {
                if self.ifaces[id].kind.contains(mask) {
                    targets.push(id);
                }
            }
        }
        if targets.is_empty() {
            if let Some(at) = name.rfind('@') {
                let suffix = &name[at..];
                for &id in &self.order {
                    let s = &self.ifaces[id];
                    if s.kind.contains(mask)
                        && s.name
                            .as_deref()
                            .and_then(|n| glob::match_score(suffix, n))
                            .map_or(false, |sc| sc > 1)
                    {
                        targets.push(id);
                    }
                }
            }
        }
        for id in targets {
            self.enqueue(id, nrid);
        }
        if self.pool.get(nrid).map(|r| r.refs == 0).unwrap_or(false) {
            self.pool.remove(nrid);
        }
    }

    /// Convenience: log line to every LOG interface.
    pub fn log(&mut self, flags: Flag, text: &str) {
        self.add_request(IfaceKind::LOG, "*", flags, text);
    }

    // -- signals ------------------------------------------------------------

    /// Deliver a signal to one interface (clone resolves to parent).
    /// A locked interface still accepts signals; a dead one does not.
    /// Returns false when no handler accepted it.
    pub fn signal_one(&mut self, id: IfaceId, sig: Signal) -> bool {
        let mut target = id;
        loop {
            let Some(s) = self.ifaces.get(target) else { return false };
            if s.kind.contains(IfaceKind::DIED) {
                return false;
            }
            if s.has_handler {
                break;
            }
            match s.parent {
                Some(p) => target = p,
                None => return false,
            }
        }
        // take the handler out so it can re-enter the bus
        let Some(mut h) = self.ifaces[target].handler.take() else {
            trace!(target, ?sig, "signal dropped: handler busy");
            return false;
        };
        let bits = h.signal(self, target, sig);
        if let Some(s) = self.ifaces.get_mut(target) {
            s.handler = Some(h);
            if !bits.is_empty() {
                s.kind |= bits;
            }
        }
        true
    }

    /// Deliver `sig` synchronously to every matching interface.
    pub fn send_signal(&mut self, mask: IfaceKind, name_mask: &str, sig: Signal) {
        let wild = glob::have_wildcard(name_mask).is_some();
        let candidates: Vec<IfaceId> = if !wild && name_mask != "*" {
            self.names.get(name_mask).cloned().unwrap_or_default()
        } else {
            self.order.clone()
        };
        for id in candidates {
            let Some(s) = self.ifaces.get(id) else { continue };
            if !s.kind.contains(mask) {
                continue;
            }
            // locked interfaces still take signals, dead ones never
            if s.kind.contains(IfaceKind::DIED) {
                continue;
            }
            if wild || name_mask == "*" {
                let name = s.name.as_deref().unwrap_or("");
                if glob::match_score(name_mask, name).is_none() {
                    continue;
                }
            }
            self.signal_one(id, sig);
        }
    }

    // -- scheduler ----------------------------------------------------------

    /// Run one interface's head request immediately (console force-feed).
    fn run_request_now(&mut self, id: IfaceId, rid: usize) {
        let Some(mut h) = self.ifaces.get_mut(id).and_then(|s| s.handler.take()) else {
            return;
        };
        // borrow the request out of the pool for the call
        let req = self.pool.get(rid).map(|r| Request {
            from: r.from,
            to: r.to.clone(),
            mask: r.mask,
            flags: r.flags,
            text: r.text.clone(),
            refs: 0,
        });
        if let Some(req) = req {
            let _ = h.request(self, id, &req);
        }
        if let Some(s) = self.ifaces.get_mut(id) {
            s.handler = Some(h);
        }
    }

    /// Serve the head queue entry of the current interface. Returns true
    /// when an entry was consumed.
    pub fn get_request(&mut self) -> bool {
        let Some(id) = self.current else { return false };
        let Some(s) = self.ifaces.get(id) else { return false };
        if s.kind.is_empty() || s.kind.contains(IfaceKind::DIED) {
            return false;
        }
        if !s.serves_requests {
            return false;
        }
        let head = self.ifaces.get_mut(id).and_then(|s| s.queue.pop_front());
        let Some(rid) = head else {
            // idle call lets the handler poll its own input
            let Some(mut h) = self.ifaces.get_mut(id).and_then(|s| s.handler.take()) else {
                return false;
            };
            let idle = Request {
                from: None,
                to: String::new(),
                mask: IfaceKind::empty(),
                flags: Flag::empty(),
                text: Bytes::new(),
                refs: 0,
            };
            let _ = h.request(self, id, &idle);
            if let Some(s) = self.ifaces.get_mut(id) {
                s.handler = Some(h);
            }
            return false;
        };
        let Some(mut h) = self.ifaces.get_mut(id).and_then(|s| s.handler.take()) else {
            self.ifaces[id].queue.push_front(rid);
            return false;
        };
        let req_view = {
            let r = &self.pool[rid];
            Request {
                from: r.from,
                to: r.to.clone(),
                mask: r.mask,
                flags: r.flags,
                text: r.text.clone(),
                refs: 0,
            }
        };
        let mut out = h.request(self, id, &req_view);
        if let Some(s) = self.ifaces.get_mut(id) {
            s.handler = Some(h);
        }
        if out == ReqResult::Relayed {
            self.relay_request(rid);
            out = ReqResult::Ok;
        }
        match out {
            ReqResult::Ok => {
                self.unref_request(rid);
                true
            }
            _ => {
                // rejected: restore the head, skip until next tick
                if let Some(s) = self.ifaces.get_mut(id) {
                    s.queue.push_front(rid);
                    s.rejected = true;
                }
                false
            }
        }
    }

    /// Reap a dead interface. Returns false when the delete must be
    /// deferred (a pooled request still names it as source).
    fn delete_iface(&mut self, id: IfaceId) -> bool {
        // no queue for the dead
        while let Some(rid) = self.ifaces[id].queue.pop_front() {
            self.unref_request(rid);
        }
        // a nested clone's parent gets a chance to resume
        if self.ifaces[id].has_handler {
            let mut p = self.ifaces[id].parent;
            while let Some(pid) = p {
                if self.ifaces.get(pid).map(|s| s.has_handler) == Some(true) {
                    self.signal_one(pid, Signal::Continue);
                    break;
                }
                p = self.ifaces.get(pid).and_then(|s| s.parent);
            }
        }
        // hold the slot while something in the pool still references it
        if self.pool.iter().any(|(_, r)| r.from == Some(id) && !r.mask.is_empty()) {
            trace!(id, "delete deferred: live requests from this interface");
            return false;
        }
        let slot = self.ifaces.remove(id);
        if let Some(pos) = self.order.iter().position(|&x| x == id) {
            self.order.swap_remove(pos);
        }
        if let Some(n) = &slot.name {
            if let Some(ids) = self.names.get_mut(n) {
                ids.retain(|&x| x != id);
                if ids.is_empty() {
                    self.names.remove(n);
                }
            }
        }
        debug!(id, name = slot.name.as_deref().unwrap_or(""), "iface: deleted");
        // clones die with the parent; children get terminated
        let dependents: Vec<IfaceId> = self
            .ifaces
            .iter()
            .filter(|(_, s)| s.parent == Some(id))
            .map(|(i, _)| i)
            .collect();
        for dep in dependents {
            if !self.ifaces[dep].has_handler {
                self.ifaces[dep].kind = IfaceKind::DIED;
            } else {
                self.ifaces[dep].parent = None;
                let bits = {
                    let Some(mut h) = self.ifaces[dep].handler.take() else { continue };
                    let bits = h.signal(self, dep, Signal::Terminate);
                    if let Some(s) = self.ifaces.get_mut(dep) {
                        s.handler = Some(h);
                    }
                    bits
                };
                if let Some(s) = self.ifaces.get_mut(dep) {
                    s.kind |= bits;
                }
            }
        }
        true
    }

    /// One scheduler step for the interface at pass position `pos`.
    pub fn tick(&mut self, pos: usize) {
        loop {
            if pos >= self.order.len() {
                return;
            }
            let id = self.order[pos];
            let kind = self.ifaces[id].kind;
            if kind.contains(IfaceKind::DIED) {
                if !self.delete_iface(id) {
                    return; // deferred, skip this pass
                }
                continue; // a new interface may have been swapped in
            }
            if kind.contains(IfaceKind::FINWAIT) {
                if self.ifaces[id].has_handler {
                    self.set_iface(Some(id));
                    self.signal_one(id, Signal::Terminate);
                    if self.unset_iface().is_err() {
                        self.lock_stack_panic();
                    }
                } else {
                    self.ifaces[id].kind |= IfaceKind::DIED;
                }
                return;
            }
            if kind.contains(IfaceKind::LOCKED) {
                return;
            }
            self.ifaces[id].rejected = false;
            self.set_iface(Some(id));
            // drain the queue until empty or rejected
            while self.get_request() {
                match self.ifaces.get(id) {
                    Some(s) if !s.queue.is_empty() && !s.rejected => {}
                    _ => break,
                }
            }
            if self.unset_iface().is_err() {
                self.lock_stack_panic();
            }
            return;
        }
    }

    /// Interface stack escaped its depth: unrecoverable, exit code 7.
    fn lock_stack_panic(&mut self) -> ! {
        error!("OOPS! interface stack exhausted! Extra unset_iface() called?");
        self.shutdown_waves(Some("interface lock stack corrupt"), true);
        std::process::exit(7);
    }

    /// Number of pass positions this round.
    pub fn pass_len(&self) -> usize {
        self.order.len()
    }

    /// True when any live interface has queued work.
    pub fn has_queued_work(&self) -> bool {
        self.order.iter().any(|&id| {
            let s = &self.ifaces[id];
            !s.queue.is_empty() && !s.kind.contains(IfaceKind::LOCKED | IfaceKind::DIED)
        })
    }

    /// Post one status line per interface to `to` (the `Report` surface).
    pub fn report_interfaces(&mut self, to: IfaceId) {
        let lines: Vec<String> = self
            .order
            .iter()
            .map(|&id| {
                let s = &self.ifaces[id];
                let caps = if s.serves_requests {
                    "SR"
                } else if s.has_handler {
                    "S"
                } else if s.parent.is_some() {
                    "clone"
                } else {
                    ""
                };
                format!(
                    "interface {}: flags {:#x} ({}), name {}, queue size {}.",
                    id,
                    s.kind.0,
                    caps,
                    s.name.as_deref().unwrap_or(""),
                    s.queue.len()
                )
            })
            .collect();
        for line in lines {
            self.new_request(to, Flag::empty(), &line);
        }
        let total = format!(
            "Total: {} interfaces, {} requests in pool (max {}).",
            self.order.len(),
            self.pool.len(),
            self.req_max
        );
        self.new_request(to, Flag::empty(), &total);
    }

    // -- boot barrier -------------------------------------------------------

    /// Start the boot phase: a hidden interface collects every message and
    /// every new interface is born locked.
    pub fn start_boot(&mut self) {
        let mask = !(IfaceKind::CONSOLE
            | IfaceKind::LISTEN
            | IfaceKind::MODULE
            | IfaceKind::INIT
            | IfaceKind::DIED
            | IfaceKind::LOCKED
            | IfaceKind::FINWAIT
            | IfaceKind::PENDING);
        let id = self.add(mask, Some("*"), Some(Box::new(BootStub)), None);
        self.boot = Some(id);
        self.kind_or = IfaceKind::LOCKED;
        self.current = Some(id);
    }

    /// End the boot phase: unlock the world, relay collected messages to
    /// the interfaces that came up meanwhile, retire the boot interface.
    pub fn end_boot(&mut self) {
        self.kind_or = IfaceKind::empty();
        let Some(boot) = self.boot else { return };
        let console = self.console;
        if let Some(cid) = console {
            self.ifaces[cid].kind |= IfaceKind::LOCKED;
        }
        let unlock: Vec<IfaceId> = self.order.clone();
        for id in unlock {
            let s = &mut self.ifaces[id];
            if !s.kind.contains(IfaceKind::CONSOLE | IfaceKind::INIT) {
                s.kind = IfaceKind(s.kind.0 & !IfaceKind::LOCKED.0);
            }
        }
        debug!(n = self.order.len(), "end_boot: relaying boot queue");
        self.current = Some(boot);
        while let Some(rid) = self.ifaces[boot].queue.pop_front() {
            self.relay_request(rid);
            self.unref_request(rid);
        }
        if let Some(cid) = console {
            let k = &mut self.ifaces[cid].kind;
            *k = IfaceKind(k.0 & !IfaceKind::LOCKED.0);
        }
        self.ifaces[boot].kind = IfaceKind::DIED;
        self.boot = None;
        self.current = None;
    }

    // -- shutdown -----------------------------------------------------------

    /// Shutdown waves: connections, then modules, then everything else,
    /// console last (its queue is flushed through its own handler).
    pub fn shutdown_waves(&mut self, reason: Option<&str>, fatal: bool) {
        if let Some(r) = reason {
            if self.shutdown_reason.is_none() {
                self.shutdown_reason = Some(r.to_owned());
            }
        }
        let sig = if fatal { Signal::Shutdown } else { Signal::Terminate };
        let ids: Vec<IfaceId> = self.order.clone();
        for &id in &ids {
            let Some(s) = self.ifaces.get(id) else { continue };
            if s.kind.contains(IfaceKind::CONSOLE) || s.kind.contains(IfaceKind::DIED) {
                continue;
            }
            if s.kind.contains(IfaceKind::CONNECT) {
                self.signal_one(id, sig);
            }
        }
        for &id in &ids {
            let Some(s) = self.ifaces.get(id) else { continue };
            if s.kind.contains(IfaceKind::MODULE) && !s.kind.contains(IfaceKind::DIED) {
                self.signal_one(id, sig);
            }
        }
        for &id in &ids {
            let Some(s) = self.ifaces.get(id) else { continue };
            if s.kind.contains(IfaceKind::CONSOLE) || s.kind.contains(IfaceKind::DIED) {
                continue;
            }
            self.signal_one(id, Signal::Shutdown);
        }
        // flush and close the console last
        if let Some(cid) = self.console {
            let pending: Vec<usize> = self
                .ifaces
                .get(cid)
                .map(|s| s.queue.iter().copied().collect())
                .unwrap_or_default();
            for rid in pending {
                self.run_request_now(cid, rid);
            }
            self.signal_one(cid, Signal::Shutdown);
        }
        if let Some(p) = &self.pid_path {
            let _ = std::fs::remove_file(p);
        }
    }
}

// The boot stub swallows nothing: it accepts requests into its queue and
// rejects serving them, so the queue survives until end_boot relays it.
struct BootStub;

impl Handler for BootStub {
    fn handles_requests(&self) -> bool {
        true
    }
    fn request(&mut self, _bus: &mut Bus, _me: IfaceId, _req: &Request) -> ReqResult {
        ReqResult::Rejected
    }
}

impl BusHandle {
    pub fn new() -> BusHandle {
        BusHandle(Arc::new(Mutex::new(Bus::new())))
    }

    /// Lock the bus for a sequence of calls.
    pub fn lock(&self) -> MutexGuard<'_, Bus> {
        self.0.lock().unwrap()
    }

    /// Find the first live matching interface, keeping the bus locked
    /// while the caller holds the result.
    pub fn find(&self, kind: IfaceKind, name: Option<&str>) -> Option<Found<'_>> {
        let guard = self.lock();
        let id = guard.find_id(kind, name)?;
        Some(Found { guard, id })
    }

    /// Post a request from a worker task.
    pub fn add_request(&self, mask: IfaceKind, name_mask: &str, flags: Flag, text: &str) {
        self.lock().add_request(mask, name_mask, flags, text);
    }

    /// Deliver a signal from a worker task.
    pub fn send_signal(&self, mask: IfaceKind, name_mask: &str, sig: Signal) {
        self.lock().send_signal(mask, name_mask, sig);
    }

    /// OR state bits from a worker (`FINWAIT`, `DIED`).
    pub fn raise(&self, id: IfaceId, bits: IfaceKind) {
        self.lock().raise(id, bits);
    }

    /// Fatal escalation: run the shutdown waves and exit the process.
    pub fn fatal(&self, reason: &str, code: i32) -> ! {
        error!(code, reason, "fatal shutdown");
        if let Ok(mut bus) = self.0.lock() {
            bus.shutdown_waves(Some(reason), code > 0);
        }
        std::process::exit(code);
    }
}

impl Default for BusHandle {
    fn default() -> Self {
        BusHandle::new()
    }
}
