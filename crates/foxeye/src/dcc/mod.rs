//! DCC sessions: CTCP-negotiated chat and file transfers.
//!
//! Covers incoming and outgoing connection modes, passive (reverse) DCC
//! with tokens, `DCC RESUME`/`DCC ACCEPT` negotiation, the bounded
//! ahead-window transfer loops, speed averaging for reports, and the
//! authorization hooks toward the listfile. The `ctcp-dcc` bindtable is
//! the entry point protocol modules feed with `DCC …` CTCP payloads.

pub mod ctcp;
pub mod recv;
pub mod send;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::core::CoreRef;
use crate::dispatcher::{Bus, Flag, Handler, IfaceId, IfaceKind, Signal};
use crate::listener::{self, AcceptCtx, ListenSpec};
use crate::peer::{PeerState, UserFlag};
use crate::session;
use crate::timer::Tid;
use crate::util::path as upath;
use ctcp::DccMsg;

pub const MIN_BLOCK: u64 = 256;
pub const MAX_BLOCK: u64 = 16384;

/// Completion hook type for the `dcc-got` / `dcc-sent` bindtables.
pub type TransferDoneFn = Arc<dyn Fn(&CoreRef, &str, &std::path::Path) + Send + Sync>;

/// `ctcp-dcc` bindtable callback: `(bus, core, who, lname, payload)`.
pub type CtcpDccFn =
    Arc<dyn Fn(&mut Bus, &CoreRef, &str, Option<&str>, &str) -> i32 + Send + Sync>;

/// 16-slot per-second byte ring for speed averaging.
pub struct RateRing {
    slots: [u64; 16],
    last: u64,
}

impl RateRing {
    pub fn new() -> RateRing {
        RateRing { slots: [0; 16], last: now() }
    }

    /// Account `bytes` at timestamp `t` (seconds).
    pub fn add(&mut self, t: u64, bytes: u64) {
        if t != self.last {
            let gap = (t.saturating_sub(self.last)).min(16);
            for i in 1..=gap {
                self.slots[((self.last + i) % 16) as usize] = 0;
            }
            self.last = t;
        }
        self.slots[(t % 16) as usize] += bytes;
    }

    /// Average bytes per second over the window.
    pub fn average(&self) -> u64 {
        self.slots.iter().sum::<u64>() / 16
    }
}

impl Default for RateRing {
    fn default() -> Self {
        RateRing::new()
    }
}

pub fn now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// One DCC session record, shared between the dispatcher-side interface
/// and the transfer worker.
pub struct DccPriv {
    pub state: PeerState,
    /// `None` for chat sessions.
    pub filename: Option<PathBuf>,
    pub size: u64,
    /// Bytes moved so far in this transfer.
    pub ptr: u64,
    /// Committed resume offset.
    pub startptr: u64,
    pub rate: RateRing,
    pub ahead: u64,
    pub token: Option<u32>,
    /// Remote port (or our offered port while listening).
    pub port: u16,
    /// Peer address in wire (host-order IPv4) form.
    pub ip: u32,
    pub socket: Option<crate::socket::SockIdx>,
    pub iface: Option<IfaceId>,
    pub tid: Option<Tid>,
    /// A `DCC RESUME` is out and its `ACCEPT` has not arrived yet.
    pub wait_accept: bool,
    pub lname: String,
    /// `nick@net` or `nick!user@host` of the far side.
    pub uh: String,
}

pub type DccRef = Arc<Mutex<DccPriv>>;

impl DccPriv {
    pub fn new(uh: &str) -> DccPriv {
        DccPriv {
            state: PeerState::Disconnected,
            filename: None,
            size: 0,
            ptr: 0,
            startptr: 0,
            rate: RateRing::new(),
            ahead: 0,
            token: None,
            port: 0,
            ip: 0,
            socket: None,
            iface: None,
            tid: None,
            wait_accept: false,
            lname: String::new(),
            uh: uh.to_owned(),
        }
    }
}

/// Registry of live DCC sessions.
pub struct DccRegistry {
    sessions: Mutex<Vec<DccRef>>,
}

impl DccRegistry {
    pub fn new() -> Arc<DccRegistry> {
        Arc::new(DccRegistry { sessions: Mutex::new(Vec::new()) })
    }

    fn insert(&self, uh: &str) -> DccRef {
        let mut list = self.sessions.lock().unwrap();
        list.retain(|d| d.lock().unwrap().state != PeerState::LastWait);
        let dcc = Arc::new(Mutex::new(DccPriv::new(uh)));
        list.push(dcc.clone());
        debug!(uh, "dcc: new session record");
        dcc
    }

    /// Look for a pending send offer matching an incoming `DCC RESUME`.
    fn find_offer(&self, target: &str, port: u16) -> Option<DccRef> {
        self.sessions.lock().unwrap().iter().cloned().find(|d| {
            let d = d.lock().unwrap();
            d.state == PeerState::Disconnected && d.uh == target && d.port == port
        })
    }

    pub fn count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }
}

fn ahead_setting(core: &CoreRef) -> u64 {
    core.config.get_int("dcc-ahead").clamp(0, 16) as u64
}

fn block_setting(core: &CoreRef) -> u64 {
    (core.config.get_int("dcc-blocksize") as u64).clamp(MIN_BLOCK, MAX_BLOCK)
}

/// Dispatcher-side face of a DCC session: reports, resume negotiation,
/// timeouts, teardown.
struct DccIface {
    dcc: DccRef,
    core: CoreRef,
}

impl Handler for DccIface {
    fn signal(&mut self, bus: &mut Bus, me: IfaceId, sig: Signal) -> IfaceKind {
        match sig {
            Signal::Report => {
                let d = self.dcc.lock().unwrap();
                let line = match (&d.filename, d.state) {
                    (Some(f), PeerState::Talk) => format!(
                        "transfer {}: {} of {} bytes, {} B/s",
                        f.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default(),
                        d.startptr + d.ptr,
                        d.size,
                        d.rate.average()
                    ),
                    (Some(f), PeerState::Idle) => format!(
                        "getting {}: waiting for DCC ACCEPT",
                        f.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
                    ),
                    _ => "waiting for DCC connection".to_owned(),
                };
                drop(d);
                let to = bus.current().unwrap_or(me);
                bus.new_request(to, Flag::REPORT, &line);
                IfaceKind::empty()
            }
            Signal::Local => self.on_accept(bus, me),
            Signal::Timeout => {
                enum After {
                    Resume,
                    Abort,
                    Nothing,
                }
                let action = {
                    let mut d = self.dcc.lock().unwrap();
                    if d.state == PeerState::Idle && d.filename.is_some() {
                        // no ACCEPT in time: start anyway, buffering into a
                        // temp file in case the ACCEPT still shows up
                        d.state = PeerState::Talk;
                        After::Resume
                    } else if d.state == PeerState::Initial {
                        // connect never completed
                        d.state = PeerState::LastWait;
                        After::Abort
                    } else {
                        After::Nothing
                    }
                };
                match action {
                    After::Resume => {
                        bus.log(Flag::WARN, "DCC GET: no ACCEPT in time, downloading anyway.");
                        start_transfer(bus, &self.core, &self.dcc, me);
                        IfaceKind::empty()
                    }
                    After::Abort => {
                        if let Some(idx) = self.dcc.lock().unwrap().socket.take() {
                            self.core.sockets.kill(idx);
                        }
                        let uh = self.dcc.lock().unwrap().uh.clone();
                        bus.log(Flag::CONN, &format!("DCC connection to {uh} timed out."));
                        IfaceKind::FINWAIT
                    }
                    After::Nothing => IfaceKind::empty(),
                }
            }
            Signal::Terminate => {
                let mut d = self.dcc.lock().unwrap();
                if let Some(tid) = d.tid.take() {
                    self.core.timers.kill_timer(tid);
                }
                if let Some(idx) = d.socket.take() {
                    drop(d);
                    self.core.sockets.kill(idx);
                    let d = self.dcc.lock().unwrap();
                    bus.log(
                        Flag::CONN,
                        &format!("DCC connection to {} terminated.", d.uh),
                    );
                    drop(d);
                } else {
                    drop(d);
                }
                self.dcc.lock().unwrap().state = PeerState::LastWait;
                IfaceKind::DIED
            }
            Signal::Shutdown => {
                let mut d = self.dcc.lock().unwrap();
                if let Some(idx) = d.socket.take() {
                    self.core.sockets.kill(idx);
                }
                d.state = PeerState::LastWait;
                IfaceKind::DIED
            }
            _ => IfaceKind::empty(),
        }
    }
}

impl DccIface {
    /// `DCC ACCEPT` arrived (routed through `bus.local`).
    fn on_accept(&mut self, bus: &mut Bus, me: IfaceId) -> IfaceKind {
        let Some(text) = bus.local.take() else { return IfaceKind::empty() };
        let Some(DccMsg::Accept { port, offset, token, .. }) = ctcp::parse_dcc(&text) else {
            bus.local = Some(text); // not ours
            return IfaceKind::empty();
        };
        let proceed = {
            let mut d = self.dcc.lock().unwrap();
            if !d.wait_accept || d.filename.is_none() {
                bus.local = Some(text);
                return IfaceKind::empty();
            }
            if d.port != 0 && port != d.port {
                debug!(port, expected = d.port, "dcc: ACCEPT port mismatch");
                bus.local = Some(text);
                return IfaceKind::empty();
            }
            if d.port == 0 && token != d.token {
                debug!(?token, expected = ?d.token, "dcc: ACCEPT token mismatch");
                bus.local = Some(text);
                return IfaceKind::empty();
            }
            if d.startptr != 0 {
                // the transfer already committed its offset (or finished)
                drop(d);
                bus.log(Flag::WARN, "DCC GET: got late ACCEPT, ignoring it.");
                return IfaceKind::empty();
            }
            d.startptr = offset;
            d.wait_accept = false;
            let was_idle = d.state == PeerState::Idle;
            d.state = PeerState::Talk;
            if let Some(tid) = d.tid.take() {
                self.core.timers.kill_timer(tid);
            }
            was_idle
        };
        let fname = self.dcc.lock().unwrap().filename.clone();
        bus.log(
            Flag::CONN,
            &format!(
                "DCC: got ACCEPT on {}, transfer resumed at {}.",
                fname.map(|f| f.display().to_string()).unwrap_or_default(),
                offset
            ),
        );
        if proceed {
            start_transfer(bus, &self.core, &self.dcc, me);
        }
        IfaceKind::empty()
    }
}

/// Open the connection for a receive and run the transfer worker.
fn start_transfer(bus: &mut Bus, core: &CoreRef, dcc: &DccRef, iface: IfaceId) {
    let (port, ip, token, passive) = {
        let mut d = dcc.lock().unwrap();
        d.ahead = ahead_setting(core);
        d.iface = Some(iface);
        (d.port, d.ip, d.token, d.port == 0)
    };
    if passive {
        // reverse DCC: we listen and tell the peer where
        let timeout = core.config.get_int("dcc-connection-timeout").max(1) as u64;
        let core2 = core.clone();
        let dcc2 = dcc.clone();
        let (uh, size, name) = {
            let d = dcc.lock().unwrap();
            (
                d.uh.clone(),
                d.size,
                d.filename
                    .as_ref()
                    .and_then(|f| f.file_name())
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            )
        };
        let dcc3 = dcc.clone();
        let on_bound: listener::BoundCb = Box::new(move |addr| {
            if let Some(addr) = addr {
                let ip = match addr.ip() {
                    std::net::IpAddr::V4(v4) => u32::from(v4),
                    _ => 0,
                };
                core2.bus.add_request(
                    IfaceKind::CLIENT,
                    &uh,
                    Flag::T_CTCP,
                    &ctcp::format_send(&name, ip, addr.port(), size, token),
                );
                // the timer goes by the listener's final name: its port
                let tid = core2.timers.new_timer(
                    IfaceKind::LISTEN,
                    &addr.port().to_string(),
                    Signal::Timeout,
                    timeout,
                );
                dcc3.lock().unwrap().tid = Some(tid);
            }
            Ok(())
        });
        let core3 = core.clone();
        let handler: listener::AcceptCb = Arc::new(move |ctx: AcceptCtx| {
            {
                let mut d = dcc2.lock().unwrap();
                d.socket = Some(ctx.socket);
                d.state = PeerState::Talk;
            }
            recv::recv_file(&core3, &dcc2);
        });
        let spec = ListenSpec {
            client: Some(self_uh(dcc)),
            host: None,
            port: 0,
            confline: None,
            on_bound: Some(on_bound),
            prehandler: None,
            handler,
        };
        if listener::listen_port(bus, core, spec).is_err() {
            bus.log(Flag::ERROR, "request for DCC SEND (passive): could not open listen port!");
            bus.raise(iface, IfaceKind::FINWAIT);
        }
        return;
    }
    let addr = ctcp::ip_to_string(ip);
    let core2 = core.clone();
    let dcc2 = dcc.clone();
    dcc.lock().unwrap().state = PeerState::Initial;
    let connected = listener::connect_host(
        core,
        &addr,
        port,
        Box::new(move |res, idx| match res {
            Ok(()) => {
                {
                    let mut d = dcc2.lock().unwrap();
                    d.socket = Some(idx);
                    d.state = PeerState::Talk;
                    if let Some(tid) = d.tid.take() {
                        core2.timers.kill_timer(tid);
                    }
                }
                recv::recv_file(&core2, &dcc2);
            }
            Err(_) => {
                core2.bus.raise(iface, IfaceKind::FINWAIT);
            }
        }),
    );
    if connected.is_none() {
        bus.log(Flag::CONN, &format!("DCC: Cannot create connection thread to {addr}."));
        bus.raise(iface, IfaceKind::FINWAIT);
    } else {
        let timeout = core.config.get_int("dcc-connection-timeout").max(1) as u64;
        let who = dcc.lock().unwrap().uh.clone();
        let tid = core.timers.new_timer(IfaceKind::CONNECT, &who, Signal::Timeout, timeout);
        dcc.lock().unwrap().tid = Some(tid);
    }
}

fn self_uh(dcc: &DccRef) -> String {
    dcc.lock().unwrap().uh.clone()
}

/// Incoming `DCC CHAT` offer.
fn process_chat(bus: &mut Bus, core: &CoreRef, reg: &Arc<DccRegistry>, who: &str, lname: Option<&str>, msg: &DccMsg) -> i32 {
    let DccMsg::Chat { ip, port } = msg else { return 0 };
    if !core.config.get_bool("dcc-allow-ctcp-chat") || !core.config.get_bool("dcc-accept-chat") {
        return 0;
    }
    if let Some(l) = lname {
        if bus.find_id(IfaceKind::DIRECT, Some(l)).is_some() {
            bus.add_request(
                IfaceKind::CLIENT,
                who,
                Flag::T_CTCR,
                "DCC ERRMSG No duplicate connections allowed.",
            );
            bus.log(Flag::CONN, "DCC CHAT: Duplicate connection attempt, refused.");
            return 0;
        }
    }
    let dcc = reg.insert(who);
    {
        let mut d = dcc.lock().unwrap();
        d.ip = *ip;
        d.port = *port;
        d.lname = lname.unwrap_or("").to_owned();
        d.state = PeerState::Initial;
    }
    let iface = bus.add(
        IfaceKind::CONNECT,
        Some(who),
        Some(Box::new(DccIface { dcc: dcc.clone(), core: core.clone() })),
        None,
    );
    dcc.lock().unwrap().iface = Some(iface);
    let addr = ctcp::ip_to_string(*ip);
    let core2 = core.clone();
    let lname2 = lname.unwrap_or("").to_owned();
    let dcc2 = dcc.clone();
    let connected = listener::connect_host(
        core,
        &addr,
        *port,
        Box::new(move |res, idx| match res {
            Ok(()) => {
                let mut peer = crate::peer::Peer::new();
                peer.socket = Some(idx);
                peer.state = PeerState::Initial;
                {
                    let mut d = dcc2.lock().unwrap();
                    d.socket = Some(idx);
                    d.state = PeerState::Talk;
                    if let Some(tid) = d.tid.take() {
                        core2.timers.kill_timer(tid);
                    }
                }
                core2.chains.grow(&mut peer, 'x', &core2);
                let uf = core2.listfile.match_client("", "", Some(&lname2));
                peer.uf = uf;
                let mut slot = Some(peer);
                let refused = match core2.binds.login.first("*", uf) {
                    // a DCC chat peer is not a telnet terminal
                    Some(b) => (b.func)(&core2, &lname2, "", "", &mut slot, false).err(),
                    None => Some("no access"),
                };
                if let Some(msg) = refused {
                    core2.bus.add_request(
                        IfaceKind::LOG,
                        "*",
                        Flag::CONN,
                        &format!("DCC CHAT with {lname2} failed: {msg}"),
                    );
                    if let Some(mut p) = slot.take() {
                        p.kill_chain(&core2.chains);
                    }
                    core2.sockets.kill(idx);
                }
                {
                    let mut d = dcc2.lock().unwrap();
                    d.socket = None; // inherited by the session
                    d.state = PeerState::LastWait;
                }
                if let Some(ifc) = dcc2.lock().unwrap().iface {
                    core2.bus.raise(ifc, IfaceKind::FINWAIT);
                }
            }
            Err(_) => {
                if let Some(ifc) = dcc2.lock().unwrap().iface {
                    core2.bus.raise(ifc, IfaceKind::FINWAIT);
                }
            }
        }),
    );
    if connected.is_none() {
        bus.raise(iface, IfaceKind::FINWAIT);
        return 0;
    }
    let timeout = core.config.get_int("dcc-connection-timeout").max(1) as u64;
    let tid = core.timers.new_timer(IfaceKind::CONNECT, who, Signal::Timeout, timeout);
    dcc.lock().unwrap().tid = Some(tid);
    1
}

/// Incoming `DCC SEND` (an offer for us to receive, or the reply to one
/// of our passive offers).
fn process_send(bus: &mut Bus, core: &CoreRef, reg: &Arc<DccRegistry>, who: &str, lname: Option<&str>, msg: &DccMsg) -> i32 {
    let DccMsg::Send { name, ip, port, size, token } = msg else { return 0 };
    if token.is_some() && *port != 0 {
        // reply to our passive offer: find the parked session by token
        return passive_reply(bus, core, who, lname, *ip, *port, token.unwrap());
    }
    let maxsize = core.config.get_int("dcc-get-maxsize");
    if maxsize >= 0 && *size > maxsize as u64 {
        bus.log(Flag::WARN, &format!("invalid DCC: size {size} is out of range"));
        return 0;
    }
    if !core.config.get_bool("dcc-get") {
        return 0;
    }
    let dir = upath::expand(&core.config.get_str("incoming-path"));
    if !dir.is_dir() {
        bus.log(Flag::ERROR, &format!("DCC: cannot stat download directory {}", dir.display()));
        return 1;
    }
    let short = name.rsplit('/').next().unwrap_or(name);
    let short = upath::clamp_name(short, upath::name_max(&dir));
    let path = dir.join(&short);
    let resume_min = core.config.get_int("dcc-resume-min").max(256) as u64;
    let mut resume_from = None;
    let exists = std::fs::metadata(&path).is_ok();
    match std::fs::metadata(&path) {
        Err(_) => {}
        Ok(meta) if meta.len() == *size => {
            bus.log(
                Flag::WARN,
                &format!(
                    "DCC: offered file \"{}\" seems equal to existing, request ignored.",
                    path.display()
                ),
            );
            return 0;
        }
        Ok(meta) if meta.len() > *size => {
            bus.log(
                Flag::WARN,
                &format!(
                    "DCC: offered size {size} of \"{}\" is less than current, restarting file.",
                    path.display()
                ),
            );
        }
        Ok(meta) if meta.len() < resume_min => {} // too small, redownload
        Ok(meta) => resume_from = Some(meta.len()),
    }
    let want_resume = resume_from.is_some()
        && core.config.get_bool("dcc-resume")
        && core.config.get_bool("dcc-allow-resume");
    if exists && !want_resume && !core.config.get_bool("dcc-get-overwrite") {
        bus.log(
            Flag::CONN,
            &format!("DCC GET of {} refused: file exists.", path.display()),
        );
        return 0;
    }
    let dcc = reg.insert(who);
    {
        let mut d = dcc.lock().unwrap();
        d.filename = Some(path);
        d.size = *size;
        d.ip = *ip;
        d.port = *port;
        d.token = *token;
        d.lname = lname.unwrap_or("").to_owned();
        d.state = PeerState::Initial;
    }
    let iface = bus.add(
        IfaceKind::CONNECT,
        Some(who),
        Some(Box::new(DccIface { dcc: dcc.clone(), core: core.clone() })),
        None,
    );
    dcc.lock().unwrap().iface = Some(iface);
    bus.log(
        Flag::CONN,
        &format!("DCC SEND request from {who}: file \"{short}\", {size} bytes."),
    );
    if want_resume {
        let offset = resume_from.unwrap();
        {
            let mut d = dcc.lock().unwrap();
            d.wait_accept = true;
            d.state = PeerState::Idle;
        }
        bus.add_request(
            IfaceKind::CLIENT,
            who,
            Flag::T_CTCP,
            &ctcp::format_resume(*port, offset, *token),
        );
        let timeout = core.config.get_int("dcc-resume-timeout").max(1) as u64;
        let tid = core.timers.new_timer(IfaceKind::CONNECT, who, Signal::Timeout, timeout);
        dcc.lock().unwrap().tid = Some(tid);
        return 1;
    }
    start_transfer(bus, core, &dcc, iface);
    1
}

/// The peer answered our passive `DCC SEND` offer with its address.
fn passive_reply(bus: &mut Bus, core: &CoreRef, who: &str, lname: Option<&str>, ip: u32, port: u16, token: u32) -> i32 {
    let temp_name = format!("irc-ctcp#{token}");
    let Some(_tid) = bus.find_id(IfaceKind::TEMP, Some(&temp_name)) else { return 0 };
    // hand the reply to the parked offer interface
    bus.local = Some(format!("SENDREPLY {ip} {port} {}", who));
    let _ = lname;
    bus.send_signal(IfaceKind::TEMP, &temp_name, Signal::Local);
    1
}

/// Incoming `DCC RESUME`: the peer asks to resume a file we offered.
fn process_resume(bus: &mut Bus, core: &CoreRef, reg: &Arc<DccRegistry>, who: &str, lname: Option<&str>, msg: &DccMsg) -> i32 {
    let DccMsg::Resume { port, offset, token, .. } = msg else { return 0 };
    if !core.config.get_bool("dcc-allow-resume") {
        return 0;
    }
    if *port == 0 {
        // passive resume goes to the parked offer by token
        if let Some(t) = token {
            let temp_name = format!("irc-ctcp#{t}");
            bus.local = Some(format!("RESUME file.ext 0 {offset} {t}"));
            bus.send_signal(IfaceKind::TEMP, &temp_name, Signal::Local);
        }
        return 0;
    }
    let Some(dcc) = reg.find_offer(who, *port) else { return 0 };
    let resume_min = {
        let m = core.config.get_int("dcc-resume-min");
        if m < 256 { 0 } else { m as u64 }
    };
    let mut d = dcc.lock().unwrap();
    if d.startptr != 0 || *offset >= d.size || *offset < resume_min {
        return 0; // invalid or duplicate request, silently ignored
    }
    d.startptr = *offset;
    if let Some(l) = lname {
        d.lname = l.to_owned();
    }
    let name = d
        .filename
        .as_ref()
        .and_then(|f| f.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file.ext".to_owned());
    drop(d);
    bus.add_request(
        IfaceKind::CLIENT,
        who,
        Flag::T_CTCP,
        &ctcp::format_accept(&name, *port, *offset, None),
    );
    1
}

/// Incoming `DCC ACCEPT`: route to the waiting receive session.
fn process_accept(bus: &mut Bus, _core: &CoreRef, who: &str, raw: &str) -> i32 {
    bus.local = Some(raw.to_owned());
    bus.send_signal(IfaceKind::CONNECT, who, Signal::Local);
    1
}

/// Offer a file to `target`. Active mode opens a listener and announces
/// it; passive mode parks the offer under a token and waits for the
/// peer's reply. Returns false when the offer could not be made.
pub fn send_file_offer(
    bus: &mut Bus,
    core: &CoreRef,
    reg: &Arc<DccRegistry>,
    target: &str,
    path: &std::path::Path,
    passive: bool,
) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        bus.log(Flag::ERROR, &format!("DCC SEND: cannot stat file {}", path.display()));
        return false;
    };
    let size = meta.len();
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file.ext".to_owned());
    let dcc = reg.insert(target);
    {
        let mut d = dcc.lock().unwrap();
        d.filename = Some(path.to_owned());
        d.size = size;
        d.ahead = ahead_setting(core);
    }
    if passive {
        let token = ((now() as u32) ^ (reg.count() as u32)) | 1;
        dcc.lock().unwrap().token = Some(token);
        let temp_name = format!("irc-ctcp#{token}");
        let iface = bus.add(
            IfaceKind::TEMP,
            Some(&temp_name),
            Some(Box::new(PassiveOffer { dcc: dcc.clone(), core: core.clone() })),
            None,
        );
        dcc.lock().unwrap().iface = Some(iface);
        bus.add_request(
            IfaceKind::CLIENT,
            target,
            Flag::T_CTCP,
            &ctcp::format_send(&name, 0, 0, size, Some(token)),
        );
        return true;
    }
    // active mode: one-shot listener, offer carries our address
    let core2 = core.clone();
    let dcc2 = dcc.clone();
    let target2 = target.to_owned();
    let on_bound: listener::BoundCb = Box::new(move |addr| {
        if let Some(addr) = addr {
            let ip = match addr.ip() {
                std::net::IpAddr::V4(v4) => u32::from(v4),
                _ => 0,
            };
            dcc2.lock().unwrap().port = addr.port();
            core2.bus.add_request(
                IfaceKind::CLIENT,
                &target2,
                Flag::T_CTCP,
                &ctcp::format_send(&name, ip, addr.port(), size, None),
            );
            // connect-timeout timer goes by the listener's port name
            let timeout = core2.config.get_int("dcc-connection-timeout").max(1) as u64;
            let tid = core2.timers.new_timer(
                IfaceKind::LISTEN,
                &addr.port().to_string(),
                Signal::Timeout,
                timeout,
            );
            dcc2.lock().unwrap().tid = Some(tid);
        }
        Ok(())
    });
    let core3 = core.clone();
    let dcc3 = dcc.clone();
    let handler: listener::AcceptCb = Arc::new(move |ctx: AcceptCtx| {
        {
            let mut d = dcc3.lock().unwrap();
            d.socket = Some(ctx.socket);
            d.state = PeerState::Talk;
        }
        send::send_file(&core3, &dcc3);
    });
    let spec = ListenSpec {
        client: Some(target.to_owned()),
        host: None,
        port: 0,
        confline: None,
        on_bound: Some(on_bound),
        prehandler: None,
        handler,
    };
    match listener::listen_port(bus, core, spec) {
        Ok(_) => true,
        Err(_) => {
            bus.log(Flag::ERROR, "DCC SEND: could not open listen port!");
            false
        }
    }
}

/// Parked passive offer: waits for the peer's `SEND` reply or a passive
/// `RESUME`, then connects and streams.
struct PassiveOffer {
    dcc: DccRef,
    core: CoreRef,
}

impl Handler for PassiveOffer {
    fn signal(&mut self, bus: &mut Bus, me: IfaceId, sig: Signal) -> IfaceKind {
        match sig {
            Signal::Local => {
                let Some(text) = bus.local.take() else { return IfaceKind::empty() };
                if let Some(DccMsg::Resume { offset, token, .. }) = ctcp::parse_dcc(&text) {
                    let mut d = self.dcc.lock().unwrap();
                    let resume_min = {
                        let m = self.core.config.get_int("dcc-resume-min");
                        if m < 256 { 0 } else { m as u64 }
                    };
                    if token == d.token
                        && d.startptr == 0
                        && offset < d.size
                        && offset >= resume_min
                        && self.core.config.get_bool("dcc-allow-resume")
                    {
                        d.startptr = offset;
                        let name = d
                            .filename
                            .as_ref()
                            .and_then(|f| f.file_name())
                            .map(|n| n.to_string_lossy().into_owned())
                            .unwrap_or_default();
                        let uh = d.uh.clone();
                        let t = d.token;
                        drop(d);
                        bus.add_request(
                            IfaceKind::CLIENT,
                            &uh,
                            Flag::T_CTCP,
                            &ctcp::format_accept(&name, 0, offset, t),
                        );
                    }
                    return IfaceKind::empty();
                }
                // "SENDREPLY <ip> <port> <who>" from passive_reply
                let mut parts = text.split_whitespace();
                if parts.next() != Some("SENDREPLY") {
                    bus.local = Some(text);
                    return IfaceKind::empty();
                }
                let (Some(ip), Some(port)) = (
                    parts.next().and_then(|s| s.parse::<u32>().ok()),
                    parts.next().and_then(|s| s.parse::<u16>().ok()),
                ) else {
                    return IfaceKind::empty();
                };
                {
                    let d = self.dcc.lock().unwrap();
                    if d.state != PeerState::Disconnected || d.filename.is_none() {
                        return IfaceKind::empty(); // inconsistent reply
                    }
                }
                {
                    let mut d = self.dcc.lock().unwrap();
                    d.ip = ip;
                    d.port = port;
                    d.state = PeerState::Initial;
                }
                let addr = ctcp::ip_to_string(ip);
                let core2 = self.core.clone();
                let dcc2 = self.dcc.clone();
                let iface_id = me;
                let connected = listener::connect_host(
                    &self.core,
                    &addr,
                    port,
                    Box::new(move |res, idx| {
                        match res {
                            Ok(()) => {
                                {
                                    let mut d = dcc2.lock().unwrap();
                                    d.socket = Some(idx);
                                    d.state = PeerState::Talk;
                                }
                                send::send_file(&core2, &dcc2);
                            }
                            Err(_) => {
                                dcc2.lock().unwrap().state = PeerState::LastWait;
                            }
                        }
                        core2.bus.raise(iface_id, IfaceKind::FINWAIT);
                    }),
                );
                if connected.is_none() {
                    bus.log(Flag::CONN, &format!("DCC: Cannot create connection thread to {addr}."));
                    return IfaceKind::FINWAIT;
                }
                IfaceKind::empty()
            }
            Signal::Terminate | Signal::Timeout => {
                self.dcc.lock().unwrap().state = PeerState::LastWait;
                IfaceKind::DIED
            }
            Signal::Shutdown => IfaceKind::DIED,
            _ => IfaceKind::empty(),
        }
    }
}

/// Accept handler wiring DCC onto a direct-service listener: every
/// accepted connection goes through the telnet login.
pub fn direct_accept_handler(ctx: AcceptCtx) {
    session::session_handler(ctx, false);
}

/// Register the `ctcp-dcc` bindings and return the session registry.
pub fn register(core: &CoreRef) -> Arc<DccRegistry> {
    let reg = DccRegistry::new();

    let r = reg.clone();
    let chat: CtcpDccFn = Arc::new(move |bus: &mut Bus, core: &CoreRef, who: &str, lname: Option<&str>, text: &str| {
        match ctcp::parse_dcc(text) {
            Some(msg @ DccMsg::Chat { .. }) => process_chat(bus, core, &r, who, lname, &msg),
            _ => 0,
        }
    });
    core.binds.ctcp_dcc.add("CHAT*", UserFlag::empty(), chat);

    let r = reg.clone();
    let send_b: CtcpDccFn = Arc::new(move |bus: &mut Bus, core: &CoreRef, who: &str, lname: Option<&str>, text: &str| {
        match ctcp::parse_dcc(text) {
            Some(msg @ DccMsg::Send { .. }) => process_send(bus, core, &r, who, lname, &msg),
            _ => {
                warn!(text, "unparsable DCC SEND request");
                0
            }
        }
    });
    core.binds.ctcp_dcc.add("SEND*", UserFlag::empty(), send_b);

    let r = reg.clone();
    let resume: CtcpDccFn = Arc::new(move |bus: &mut Bus, core: &CoreRef, who: &str, lname: Option<&str>, text: &str| {
        match ctcp::parse_dcc(text) {
            Some(msg @ DccMsg::Resume { .. }) => process_resume(bus, core, &r, who, lname, &msg),
            _ => 0,
        }
    });
    core.binds.ctcp_dcc.add("RESUME*", UserFlag::empty(), resume);

    let accept: CtcpDccFn = Arc::new(move |bus: &mut Bus, core: &CoreRef, who: &str, _lname: Option<&str>, text: &str| {
        process_accept(bus, core, who, text)
    });
    core.binds.ctcp_dcc.add("ACCEPT*", UserFlag::empty(), accept);

    // .send [-passive] <nick@net> <file>
    let r = reg.clone();
    let send_cmd: session::DccCmdFn =
        Arc::new(move |bus: &mut Bus, core: &CoreRef, peer: &mut crate::peer::Peer, args: &str| {
            let mut parts = args.split_whitespace();
            let (passive, target) = match parts.next() {
                Some("-passive") => (true, parts.next()),
                t => (false, t),
            };
            let (Some(target), Some(file)) = (target, parts.next()) else {
                if let Some(me) = peer.iface.or(bus.current()) {
                    bus.new_request(me, Flag::empty(), "usage: .send [-passive] <nick@net> <file>");
                }
                return;
            };
            let path = upath::expand(file);
            send_file_offer(bus, core, &r, target, &path, passive);
        });
    core.binds.dcc.add("send", UserFlag::empty(), send_cmd);

    reg
}

/// Run the transfer-completion bindtable (`dcc-got` or `dcc-sent`).
pub(crate) fn run_done_table(
    core: &CoreRef,
    table: &crate::bindtable::BindTable<TransferDoneFn>,
    lname: &str,
    uh: &str,
    path: &std::path::Path,
) {
    let uf = core.listfile.match_client("", "", Some(lname));
    for b in table.lookup(lname, uf) {
        (b.func)(core, uh, path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_ring_average() {
        let mut r = RateRing::new();
        let t0 = 1000;
        r.last = t0;
        for t in t0..t0 + 16 {
            r.add(t, 1600);
        }
        assert_eq!(r.average(), 1600);
    }

    #[test]
    fn test_rate_ring_gap_clears_slots() {
        let mut r = RateRing::new();
        r.last = 100;
        r.add(100, 16000);
        // a long silence wipes the whole window
        r.add(200, 0);
        assert_eq!(r.average(), 0);
    }

    #[test]
    fn test_registry_prunes_finished() {
        let reg = DccRegistry::new();
        let a = reg.insert("x@net");
        assert_eq!(reg.count(), 1);
        a.lock().unwrap().state = PeerState::LastWait;
        let _b = reg.insert("y@net");
        assert_eq!(reg.count(), 1, "finished session pruned");
    }

    #[test]
    fn test_find_offer_matches_port_and_target() {
        let reg = DccRegistry::new();
        let a = reg.insert("nick@net");
        a.lock().unwrap().port = 2048;
        assert!(reg.find_offer("nick@net", 2048).is_some());
        assert!(reg.find_offer("nick@net", 1).is_none());
        assert!(reg.find_offer("other@net", 2048).is_none());
    }
}
