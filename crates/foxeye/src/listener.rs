//! Port listeners and outbound connection workers.
//!
//! A listener owns one background task per port: it binds a random port
//! inside the configured range (retrying on collisions), reports the
//! chosen address to its creator, then loops accepting connections. Every
//! accepted child gets an RFC 1413 ident query on a parallel socket before
//! the acceptance handler runs. Listener state is visible to `Report`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, warn};

use crate::config::parse_port_range;
use crate::core::CoreRef;
use crate::dispatcher::{Bus, Flag, Handler, IfaceId, IfaceKind, Signal};
use crate::error::{Error, Result};
use crate::socket::{SockIdx, SockKind};

/// Called once with the address a listener bound; `Err(Again)` asks for a
/// retry on another port.
pub type BoundCb = Box<dyn FnMut(Option<SocketAddr>) -> Result<()> + Send>;

/// Called right after `answer` with the fresh child socket, and with
/// `None` when the listener dies before completing its job.
pub type PreCb = Box<dyn FnMut(Option<SockIdx>) + Send>;

/// Runs in the accept worker once the ident lookup finished.
pub struct AcceptCtx {
    pub core: CoreRef,
    pub client: Option<String>,
    pub ident: String,
    pub host: String,
    pub port: u16,
    pub socket: SockIdx,
}

pub type AcceptCb = Arc<dyn Fn(AcceptCtx) + Send + Sync>;

/// What to listen for.
pub struct ListenSpec {
    /// One-shot client connection: stop listening after the first accept.
    pub client: Option<String>,
    pub host: Option<String>,
    /// Fixed port, or 0 for a random one from `dcc-port-range`.
    pub port: u16,
    /// Config line re-announced on `Reg`, also the interface name.
    pub confline: Option<String>,
    pub on_bound: Option<BoundCb>,
    pub prehandler: Option<PreCb>,
    pub handler: AcceptCb,
}

struct ListenerState {
    port: AtomicU16,
    children: AtomicUsize,
    stop: AtomicBool,
    socket: std::sync::Mutex<Option<SockIdx>>,
    finishing: AtomicBool,
}

struct ListenerIface {
    state: Arc<ListenerState>,
    confline: Option<String>,
    core: CoreRef,
}

impl Handler for ListenerIface {
    fn signal(&mut self, bus: &mut Bus, me: IfaceId, sig: Signal) -> IfaceKind {
        match sig {
            Signal::Report => {
                let port = self.state.port.load(Ordering::Relaxed);
                let kids = self.state.children.load(Ordering::Relaxed);
                let status = if self.state.finishing.load(Ordering::Relaxed) {
                    "finishing"
                } else {
                    "active"
                };
                let line = format!(
                    "listening on port {port} ({status}), {kids} connection(s)"
                );
                let to = bus.current().unwrap_or(me);
                bus.new_request(to, Flag::REPORT, &line);
                IfaceKind::empty()
            }
            Signal::Reg => {
                if let Some(cl) = &self.confline {
                    if !cl.is_empty() && !cl.starts_with('#') {
                        bus.add_request(IfaceKind::INIT, "*", Flag::REPORT, cl);
                    }
                }
                IfaceKind::empty()
            }
            Signal::Terminate | Signal::Timeout => {
                debug!(me, "terminating listener");
                self.state.stop.store(true, Ordering::SeqCst);
                let sock = self.state.socket.lock().unwrap().take();
                if let Some(idx) = sock {
                    self.core.sockets.kill(idx);
                }
                bus.log(
                    Flag::CONN,
                    &format!(
                        "Listening socket on port {} terminated.",
                        self.state.port.load(Ordering::Relaxed)
                    ),
                );
                IfaceKind::DIED
            }
            Signal::Shutdown => IfaceKind::DIED,
            _ => IfaceKind::empty(),
        }
    }
}

fn random_port(start: u16, end: u16) -> u16 {
    if end <= start {
        return start;
    }
    rand::thread_rng().gen_range(start..=end)
}

/// RFC 1413 ident query toward the peer of an accepted socket.
///
/// Blocking; run from a worker. Returns the reported user id, or empty
/// when the peer has no identd or the timeout expires.
pub fn ask_ident(core: &CoreRef, accepted: SockIdx, local_port: u16, timeout: Duration) -> String {
    let (domain, peer_port) = core.sockets.domain(accepted);
    if domain.is_empty() {
        return String::new();
    }
    let Ok(idx) = core.sockets.get(SockKind::Raw) else { return String::new() };
    let deadline = Instant::now() + timeout;
    let result = (|| -> Option<String> {
        core.sockets.setup(idx, Some(&domain), None, 113, None).ok()?;
        let query = format!("{peer_port}, {local_port}\r\n");
        debug!(%domain, %query, "asking host for ident");
        let buf = query.as_bytes();
        let mut ptr = 0;
        let mut len = buf.len();
        while len > 0 && Instant::now() < deadline {
            match core.sockets.write(idx, buf, &mut ptr, &mut len) {
                Ok(0) => core.sockets.wait_pass(Duration::from_millis(50)),
                Ok(_) => {}
                Err(_) => return None,
            }
        }
        let mut resp = Vec::new();
        let mut chunk = [0u8; 256];
        while Instant::now() < deadline {
            match core.sockets.read(idx, &mut chunk) {
                Ok(0) | Err(Error::Again) => core.sockets.wait_pass(Duration::from_millis(50)),
                Ok(n) => {
                    resp.extend_from_slice(&chunk[..n]);
                    if resp.contains(&b'\n') {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        let line = String::from_utf8_lossy(&resp);
        let line = line.lines().next()?;
        parse_ident_reply(line)
    })();
    core.sockets.kill(idx);
    result.unwrap_or_default()
}

/// `<ports> : USERID : <charset> : <id>` → id.
pub fn parse_ident_reply(line: &str) -> Option<String> {
    let mut fields = line.split(':').map(str::trim);
    let _ports = fields.next()?;
    if fields.next()? != "USERID" {
        return None;
    }
    let _charset = fields.next()?;
    let id = fields.next()?.split_whitespace().next()?;
    if id.is_empty() {
        return None;
    }
    Some(id.to_owned())
}

/// Open a listening port and register its interface on the bus.
///
/// The bus is passed in because callers are often handlers already
/// holding it. The actual bind/accept loop runs in a background worker;
/// the returned interface reports state and accepts `Terminate`.
pub fn listen_port(bus: &mut Bus, core: &CoreRef, mut spec: ListenSpec) -> Result<IfaceId> {
    let sock = core.sockets.get(SockKind::Listen)?;
    let state = Arc::new(ListenerState {
        port: AtomicU16::new(spec.port),
        children: AtomicUsize::new(0),
        stop: AtomicBool::new(false),
        socket: std::sync::Mutex::new(Some(sock)),
        finishing: AtomicBool::new(false),
    });
    let iface_name = spec
        .confline
        .clone()
        .unwrap_or_else(|| spec.port.to_string());
    let iface = bus.add(
        IfaceKind::LISTEN | IfaceKind::CONNECT,
        Some(&iface_name),
        Some(Box::new(ListenerIface {
            state: state.clone(),
            confline: spec.confline.clone(),
            core: core.clone(),
        })),
        None,
    );
    let core = core.clone();
    let state2 = state;
    tokio::task::spawn_blocking(move || {
        listener_worker(core, spec_takeout(&mut spec), state2, sock, iface);
    });
    Ok(iface)
}

// split the spec so the worker owns the callbacks
struct WorkerSpec {
    client: Option<String>,
    host: Option<String>,
    port: u16,
    confline: Option<String>,
    on_bound: Option<BoundCb>,
    prehandler: Option<PreCb>,
    handler: AcceptCb,
}

fn spec_takeout(spec: &mut ListenSpec) -> WorkerSpec {
    WorkerSpec {
        client: spec.client.take(),
        host: spec.host.take(),
        port: spec.port,
        confline: spec.confline.take(),
        on_bound: spec.on_bound.take(),
        prehandler: spec.prehandler.take(),
        handler: spec.handler.clone(),
    }
}

fn listener_worker(
    core: CoreRef,
    mut spec: WorkerSpec,
    state: Arc<ListenerState>,
    sock: SockIdx,
    iface: IfaceId,
) {
    let (lo, hi) = if spec.port != 0 {
        (spec.port, spec.port)
    } else {
        parse_port_range(&core.config.get_str("dcc-port-range"))
    };
    let mut tries = i32::from(hi - lo);
    let bound = loop {
        if state.stop.load(Ordering::SeqCst) {
            break false;
        }
        let port = random_port(lo, hi);
        let r = {
            let mut bound_cb = |addr: SocketAddr| -> Result<()> {
                match &mut spec.on_bound {
                    Some(cb) => cb(Some(addr)),
                    None => Ok(()),
                }
            };
            core.sockets
                .setup(sock, spec.host.as_deref(), None, port, Some(&mut bound_cb))
        };
        match r {
            Ok(()) => break true,
            Err(e) => {
                debug!(port, %e, "listener setup failed");
                tries -= 1;
                if tries < 0 {
                    // final try: the callback may grant one more round
                    let again = match &mut spec.on_bound {
                        Some(cb) => cb(None) == Err(Error::Again),
                        None => false,
                    };
                    if !again {
                        warn!(
                            confline = spec.confline.as_deref().unwrap_or(""),
                            "could not start listener: {e}"
                        );
                        break false;
                    }
                    tries = i32::from(hi - lo);
                }
                core.sockets.reset(sock, SockKind::Listen);
            }
        }
    };
    if !bound {
        finish_listener(&core, &mut spec, &state, iface, false);
        return;
    }
    let (_, real_port) = core.sockets.domain(sock);
    state.port.store(real_port, Ordering::Relaxed);
    if spec.confline.is_none() {
        let mut bus = core.bus.lock();
        bus.rename(iface, &real_port.to_string());
    }
    let ident_timeout =
        Duration::from_secs(core.config.get_int("ident-timeout").max(1) as u64);
    let mut inherited = false;
    while !state.stop.load(Ordering::SeqCst) && core.sockets.is_live(sock) {
        match core.sockets.answer(sock) {
            Err(Error::Again) => core.sockets.wait_pass(Duration::from_millis(100)),
            Err(_) => break,
            Ok(child) => {
                state.children.fetch_add(1, Ordering::Relaxed);
                debug!(sock, child, "listener answered");
                if let Some(pre) = &mut spec.prehandler {
                    pre(Some(child));
                }
                // every accepted child gets its own worker for the ident
                // query and the acceptance handler
                let core2 = core.clone();
                let state2 = state.clone();
                let handler = spec.handler.clone();
                let client = spec.client.clone();
                let work = move || {
                    let ident = ask_ident(&core2, child, real_port, ident_timeout);
                    let (host, peer_port) = core2.sockets.domain(child);
                    core2.bus.add_request(
                        IfaceKind::LOG,
                        "*",
                        Flag::CONN,
                        &format!(
                            "Input connection from {}@{} port {}.",
                            if ident.is_empty() { "(unknown)" } else { &ident },
                            host,
                            peer_port
                        ),
                    );
                    handler(AcceptCtx {
                        core: core2.clone(),
                        client,
                        ident,
                        host,
                        port: peer_port,
                        socket: child,
                    });
                    state2.children.fetch_sub(1, Ordering::Relaxed);
                };
                if spec.client.is_some() {
                    // one-shot: the child inherits the listener's job
                    work();
                    inherited = true;
                    break;
                }
                tokio::task::spawn_blocking(work);
            }
        }
    }
    finish_listener(&core, &mut spec, &state, iface, inherited);
}

fn finish_listener(
    core: &CoreRef,
    spec: &mut WorkerSpec,
    state: &ListenerState,
    iface: IfaceId,
    inherited: bool,
) {
    state.finishing.store(true, Ordering::SeqCst);
    if !inherited {
        if let Some(pre) = &mut spec.prehandler {
            pre(None); // notify the caller the listener died unfinished
        }
    }
    // the dispatcher finishes the job from here
    core.bus.raise(iface, IfaceKind::FINWAIT);
}

/// Called by the worker when an outbound connect finished.
pub type ConnectCb = Box<dyn FnOnce(Result<()>, SockIdx) + Send>;

/// Start an outbound connection worker. Returns the allocated socket
/// index immediately; the handler fires from the worker when the connect
/// resolves. On failure the socket is already dead when the handler runs.
pub fn connect_host(core: &CoreRef, host: &str, port: u16, handler: ConnectCb) -> Option<SockIdx> {
    let idx = core.sockets.get(SockKind::Raw).ok()?;
    let core = core.clone();
    let host = host.to_owned();
    tokio::task::spawn_blocking(move || {
        let r = core.sockets.setup(idx, Some(&host), None, port, None);
        match &r {
            Ok(()) => {
                debug!(%host, port, idx, "connected");
            }
            Err(e) => {
                core.bus.add_request(
                    IfaceKind::LOG,
                    "*",
                    Flag::CONN,
                    &format!(
                        "Could not make connection to {host} at port {port} (socket {idx}): {e}"
                    ),
                );
                core.sockets.kill(idx);
            }
        }
        handler(r, idx);
    });
    Some(idx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ident_reply() {
        assert_eq!(
            parse_ident_reply("6193, 23 : USERID : UNIX : joe"),
            Some("joe".to_owned())
        );
        assert_eq!(parse_ident_reply("6193, 23 : ERROR : NO-USER"), None);
        assert_eq!(parse_ident_reply("garbage"), None);
    }

    #[test]
    fn test_random_port_in_range() {
        for _ in 0..50 {
            let p = random_port(2000, 2010);
            assert!((2000..=2010).contains(&p));
        }
        assert_eq!(random_port(5555, 5555), 5555);
        assert_eq!(random_port(5555, 5000), 5555);
    }
}
