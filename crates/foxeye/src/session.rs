//! Direct (telnet-style) sessions: greeting, login, and the session
//! interface that bridges the bus to a connection chain.
//!
//! The accept path runs in a listener worker: greeting goes out raw, the
//! line framer is grown, the login name is read, the `login` bindtable
//! decides what happens next. The stock login binding prompts for a
//! password (hiding input with `IAC WILL ECHO` on telnet peers), verifies
//! it through the `passwd` bindtable, and registers the session interface
//! with its chat and log clones.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::charset::get_conversion;
use crate::core::CoreRef;
use crate::dispatcher::{Bus, Flag, Handler, IfaceId, IfaceKind, ReqResult, Request, Signal};
use crate::error::Error;
use crate::filters::telnet::{WILL_ECHO, WONT_ECHO};
use crate::listener::AcceptCtx;
use crate::peer::{Peer, PeerState, UserFlag};

/// Client database contract (the listfile lives outside the core).
pub trait Listfile: Send + Sync {
    /// Access flags for `ident@host`, optionally bound to a login name.
    fn match_client(&self, host: &str, ident: &str, lname: Option<&str>) -> UserFlag;
    /// Stored (possibly hashed) password of a client.
    fn passwd(&self, lname: &str) -> Option<String>;
    /// Preferred charset of a client.
    fn charset(&self, lname: &str) -> Option<String>;
    /// Resolve aliases to the canonical login name.
    fn canonical(&self, lname: &str) -> Option<String>;
}

/// Listfile that knows nobody; every client matches with empty flags.
pub struct OpenListfile;

impl Listfile for OpenListfile {
    fn match_client(&self, _host: &str, _ident: &str, _lname: Option<&str>) -> UserFlag {
        UserFlag::ACCESS
    }
    fn passwd(&self, _lname: &str) -> Option<String> {
        None
    }
    fn charset(&self, _lname: &str) -> Option<String> {
        None
    }
    fn canonical(&self, lname: &str) -> Option<String> {
        Some(lname.to_owned())
    }
}

/// Login bindtable callback: decide whether the named client may enter
/// and build its session. On success the binding takes the peer out of
/// the slot; on failure it leaves it there and the refusal in `Err` is
/// written back to the still-live connection.
pub type LoginFn = Arc<
    dyn Fn(&CoreRef, &str, &str, &str, &mut Option<Peer>, bool) -> std::result::Result<(), &'static str>
        + Send
        + Sync,
>;

/// Password check: `(plain, stored)` → verified.
pub type PasswdFn = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;

/// Session command callback (the `.command` bindings).
pub type DccCmdFn = Arc<dyn Fn(&mut Bus, &CoreRef, &mut Peer, &str) + Send + Sync>;

/// Blocking line read through the peer's chain with a deadline.
/// `Ok(None)` on timeout.
pub fn read_line(
    core: &CoreRef,
    peer: &mut Peer,
    deadline: Instant,
) -> std::result::Result<Option<String>, Error> {
    let mut buf = [0u8; 512];
    loop {
        if Instant::now() >= deadline {
            return Ok(None);
        }
        let _ = peer.push(&core.chains);
        match peer.get(&core.chains, &mut buf) {
            Ok(0) => core.sockets.wait_pass(Duration::from_millis(50)),
            Ok(n) => {
                peer.touch();
                return Ok(Some(String::from_utf8_lossy(&buf[..n]).into_owned()));
            }
            Err(Error::Again) => core.sockets.wait_pass(Duration::from_millis(50)),
            Err(e) => return Err(e),
        }
    }
}

/// Blocking write of the whole buffer through the peer's chain.
pub fn write_all(
    core: &CoreRef,
    peer: &mut Peer,
    data: &[u8],
    deadline: Instant,
) -> std::result::Result<(), Error> {
    let mut sent = 0;
    while sent < data.len() {
        if Instant::now() >= deadline {
            return Err(Error::Again);
        }
        match peer.put(&core.chains, &data[sent..]) {
            Ok(0) => core.sockets.wait_pass(Duration::from_millis(50)),
            Ok(n) => sent += n,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Accept handler for direct-service listeners: the telnet login flow.
///
/// Runs in the listener's accept worker. `botsonly` restricts entry to
/// clients carrying the SPECIAL flag.
pub fn session_handler(ctx: AcceptCtx, botsonly: bool) {
    let core = ctx.core.clone();
    let mut peer = Peer::new();
    peer.socket = Some(ctx.socket);
    peer.state = PeerState::Initial;
    peer.uf = core.listfile.match_client(&ctx.host, &ctx.ident, None);
    let timeout = Duration::from_secs(core.config.get_int("dcc-timeout").max(1) as u64);
    let deadline = Instant::now() + timeout;

    if core.config.get_bool("drop-unknown")
        && core.binds.login.first("*", peer.uf).is_none()
    {
        refuse(&core, peer, "not allowed", &ctx);
        return;
    }

    // root the chain, then the greeting goes out before the framer so the
    // raw prompt shows as-is
    core.chains.grow(&mut peer, '\0', &core);
    let greeting = b"\r\nFoxEye network node\r\n\r\nlogin: ";
    if write_all(&core, &mut peer, greeting, deadline).is_err() {
        drop_peer(&core, peer);
        return;
    }
    core.chains.grow(&mut peer, 'x', &core);
    let lname = match read_line(&core, &mut peer, deadline) {
        Ok(Some(l)) if !l.is_empty() => l,
        _ => {
            refuse(&core, peer, "connection lost", &ctx);
            return;
        }
    };
    debug!(%lname, "session: login name received");
    peer.uf = core.listfile.match_client(&ctx.host, &ctx.ident, Some(&lname));
    let Some(bind) = core.binds.login.first("*", peer.uf) else {
        refuse(&core, peer, "not allowed", &ctx);
        return;
    };
    if botsonly && !peer.uf.admits(UserFlag::SPECIAL) {
        refuse(&core, peer, "not allowed", &ctx);
        return;
    }
    let mut slot = Some(peer);
    if let Err(msg) = (bind.func)(&core, &lname, &ctx.ident, &ctx.host, &mut slot, true) {
        if let Some(p) = slot.take() {
            refuse(&core, p, msg, &ctx);
        }
    }
}

fn refuse(core: &CoreRef, mut peer: Peer, msg: &str, ctx: &AcceptCtx) {
    core.chains.grow(&mut peer, '\0', core);
    let deadline = Instant::now() + Duration::from_secs(5);
    let text = format!("Access denied: {msg}");
    let _ = write_all(core, &mut peer, text.as_bytes(), deadline);
    core.bus.add_request(
        IfaceKind::LOG,
        "*",
        Flag::CONN,
        &format!("Connection from {} closed: {}.", ctx.host, msg),
    );
    drop_peer(core, peer);
}

fn drop_peer(core: &CoreRef, mut peer: Peer) {
    peer.kill_chain(&core.chains);
    if let Some(idx) = peer.socket.take() {
        core.sockets.kill(idx);
    }
}

/// The stock login binding: password prompt, verification, session
/// registration.
pub fn stock_login(
    core: &CoreRef,
    name: &str,
    ident: &str,
    host: &str,
    slot: &mut Option<Peer>,
    telnet: bool,
) -> std::result::Result<(), &'static str> {
    let stored = match core.listfile.passwd(name) {
        Some(p) => p,
        None => return Err("user has no password yet"),
    };
    let peer = slot.as_mut().ok_or("connection lost")?;
    let timeout = Duration::from_secs(core.config.get_int("dcc-timeout").max(1) as u64);
    let deadline = Instant::now() + timeout;
    let mut prompt = b"Password: ".to_vec();
    if telnet {
        prompt.extend_from_slice(WILL_ECHO);
    }
    if write_all(core, peer, &prompt, deadline).is_err() {
        return Err("connection lost");
    }
    let pass = match read_line(core, peer, deadline) {
        Ok(Some(p)) => p,
        Ok(None) => return Err("login timeout"),
        Err(_) => return Err("connection lost"),
    };
    let verified = core
        .binds
        .passwd
        .first("*", UserFlag::all())
        .map(|b| (b.func)(&pass, &stored))
        .unwrap_or(false);
    if !verified {
        return Err("authentication failed");
    }
    let canonical = core.listfile.canonical(name).unwrap_or_else(|| name.to_owned());
    let mut peer = slot.take().expect("peer checked above");
    peer.uf = core.listfile.match_client(host, ident, Some(&canonical));
    if telnet {
        debug!("enabling echo for user");
        let _ = write_all(core, &mut peer, WONT_ECHO, deadline);
    }
    peer.state = PeerState::Login;
    peer.dname = Some(canonical.clone());
    let conv = core.listfile.charset(&canonical).and_then(|c| get_conversion(&c));
    register_session(core, &canonical, peer, conv);
    Ok(())
}

/// Register a logged-in peer on the bus: the DIRECT interface plus its
/// chat-alias and log clones, conversion handle, and the `b` filter.
pub fn register_session(
    core: &CoreRef,
    name: &str,
    mut peer: Peer,
    conv: Option<Arc<crate::charset::Conversion>>,
) -> IfaceId {
    core.chains.grow(&mut peer, 'b', core);
    let mut bus = core.bus.lock();
    let session = Session { peer, core: core.clone(), pending: Vec::new(), pending_pos: 0 };
    let id = bus.add(
        IfaceKind::DIRECT | IfaceKind::CONNECT,
        Some(name),
        Some(Box::new(session)),
        None,
    );
    bus.set_conversion(id, conv);
    // clones: scripts talk to the alias, log lines find the session
    let alias = bus.add(IfaceKind::DCCALIAS, None, None, Some(id));
    let _log = bus.add(IfaceKind::LOG, None, None, Some(id));
    bus.log(Flag::CONN, &format!("Direct connection established with {name}."));
    debug!(id, alias, name, "session registered");
    id
}

/// A live session interface: requests flow out through the chain, input
/// lines come back in and are dispatched as chat or commands.
pub struct Session {
    pub peer: Peer,
    core: CoreRef,
    pending: Vec<u8>,
    pending_pos: usize,
}

impl Session {
    /// Render a request for the wire. The payload travels as raw bytes so
    /// converted-charset copies stay intact; only the decoration is ours.
    fn format_request(&self, bus: &Bus, req: &Request) -> Option<Vec<u8>> {
        if req.mask.is_empty() {
            return None; // idle poll
        }
        let mut out = Vec::with_capacity(req.text.len() + 24);
        if req.mask.contains(IfaceKind::LOG) && !req.mask.contains(IfaceKind::DIRECT) {
            out.extend_from_slice(format!("[{}] ", &self.peer.start[11..]).as_bytes());
        } else if req.mask.contains(IfaceKind::DCCALIAS) {
            let from = req.from.and_then(|f| bus.name(f)).unwrap_or("?");
            if req.flags.contains(Flag::T_ACTION) {
                out.extend_from_slice(format!("* {from} ").as_bytes());
            } else if req.flags.contains(Flag::T_NOTICE) {
                out.extend_from_slice(b"*** ");
            } else {
                out.extend_from_slice(format!("<{from}> ").as_bytes());
            }
        }
        out.extend_from_slice(&req.text);
        Some(out)
    }

    fn push_pending(&mut self) -> std::result::Result<bool, Error> {
        while self.pending_pos < self.pending.len() {
            let data = &self.pending[self.pending_pos..];
            let idx = self.peer.socket.ok_or(Error::NoSocket)?;
            let n = self.core.chains.put(&mut self.peer.chain, idx, data)?;
            if n == 0 {
                return Ok(false);
            }
            self.pending_pos += n;
        }
        self.pending.clear();
        self.pending_pos = 0;
        Ok(true)
    }

    fn die(&mut self, bus: &mut Bus, me: IfaceId) {
        self.peer.state = PeerState::LastWait;
        self.peer.kill_chain(&self.core.chains);
        if let Some(idx) = self.peer.socket.take() {
            self.core.sockets.kill(idx);
        }
        if let Some(name) = &self.peer.dname {
            bus.log(Flag::CONN, &format!("Lost direct connection to {name}."));
        }
        bus.raise(me, IfaceKind::DIED);
    }
}

impl Handler for Session {
    fn handles_requests(&self) -> bool {
        true
    }

    fn request(&mut self, bus: &mut Bus, me: IfaceId, req: &Request) -> ReqResult {
        // drain what a previous call left behind
        match self.push_pending() {
            Ok(true) => {}
            Ok(false) => {
                if !req.mask.is_empty() {
                    return ReqResult::Rejected;
                }
            }
            Err(_) => {
                self.die(bus, me);
                return ReqResult::Ok;
            }
        }
        if let Some(line) = self.format_request(bus, req) {
            self.pending.extend_from_slice(&line);
            if self.push_pending().is_err() {
                self.die(bus, me);
                return ReqResult::Ok;
            }
        }
        // poll input
        let mut buf = [0u8; 512];
        let idx = match self.peer.socket {
            Some(i) => i,
            None => return ReqResult::Ok,
        };
        match self.core.chains.get(&mut self.peer.chain, idx, &mut buf) {
            Ok(0) | Err(Error::Again) => {}
            Ok(n) => {
                self.peer.touch();
                let line = String::from_utf8_lossy(&buf[..n]).into_owned();
                dispatch_line(bus, &self.core, &mut self.peer, me, &line);
            }
            Err(_) => {
                self.die(bus, me);
                return ReqResult::Ok;
            }
        }
        if self.peer.state == PeerState::Quit {
            self.die(bus, me);
        }
        ReqResult::Ok
    }

    fn signal(&mut self, bus: &mut Bus, me: IfaceId, sig: Signal) -> IfaceKind {
        match sig {
            Signal::Terminate => {
                self.die(bus, me);
                IfaceKind::DIED
            }
            Signal::Shutdown => {
                if let Some(idx) = self.peer.socket.take() {
                    self.core.sockets.kill(idx);
                }
                IfaceKind::DIED
            }
            Signal::Report => {
                let name = self.peer.dname.as_deref().unwrap_or("-");
                let line = format!(
                    "{}: on since {}, idle {}s",
                    name,
                    self.peer.start,
                    self.peer.idle_secs()
                );
                let to = bus.current().unwrap_or(me);
                bus.new_request(to, Flag::REPORT, &line);
                IfaceKind::empty()
            }
            Signal::Flush => IfaceKind::empty(),
            _ => IfaceKind::empty(),
        }
    }
}

/// Route one input line: `.command` goes through the `dcc` bindtable,
/// everything else is chat fanned out to the alias channel.
pub fn dispatch_line(bus: &mut Bus, core: &CoreRef, peer: &mut Peer, me: IfaceId, line: &str) {
    if let Some(cmd) = line.strip_prefix('.') {
        let word = cmd.split_whitespace().next().unwrap_or("");
        let args = cmd[word.len()..].trim_start();
        if let Some(b) = core.binds.dcc.first(word, peer.uf) {
            (b.func)(bus, core, peer, args);
        } else {
            bus.new_request(me, Flag::empty(), &format!("No such command: {word}"));
        }
        return;
    }
    if line.is_empty() {
        return;
    }
    bus.add_request(IfaceKind::DCCALIAS, "*", Flag::empty(), line);
}

/// Register the stock `login`, `passwd`, and `dcc` bindings.
pub fn register_stock(core: &CoreRef) {
    let login: LoginFn = Arc::new(stock_login);
    core.binds.login.add("*", UserFlag::empty(), login);
    let plain: PasswdFn = Arc::new(|plain: &str, stored: &str| plain == stored);
    core.binds.passwd.add("*", UserFlag::empty(), plain);
    let quit: DccCmdFn = Arc::new(|_bus: &mut Bus, _core: &CoreRef, peer: &mut Peer, _args: &str| {
        peer.state = PeerState::Quit;
    });
    core.binds.dcc.add("quit", UserFlag::empty(), quit);
    // .who asks everything alive to report; answers come back addressed
    // to the asking session
    let who: DccCmdFn = Arc::new(|bus: &mut Bus, _core: &CoreRef, _peer: &mut Peer, _args: &str| {
        bus.send_signal(IfaceKind::any(), "*", Signal::Report);
        if let Some(me) = bus.current() {
            bus.report_interfaces(me);
        }
    });
    core.binds.dcc.add("who", UserFlag::empty(), who);
}
