//! Non-blocking socket layer: slot table, poll thread, resolver.
//!
//! All OS descriptors live in one fixed-capacity slot table indexed by a
//! small integer ([`SockIdx`]) which is the only identity callers ever see.
//! A dedicated poll thread keeps each slot's observed events current; the
//! thread polls on a private pollfd array and is woken through a self-pipe
//! whenever a caller changes a slot's requested events. Completion of a
//! pass is broadcast both to blocking waiters (condvar) and async waiters
//! (notify), so workers and the dispatcher can sleep on socket progress.
//!
//! Every operation returns a code from the closed [`Error`] set; `Ok(0)`
//! from [`SocketSet::read`] means "no data yet" while `Err(Again)` means
//! "connect still in progress".

use std::ffi::CString;
use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use slab::Slab;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::error::{Error, Result};

/// Hard cap on simultaneously open slots.
pub const SOCKET_MAX: usize = 200;

/// External identity of a socket slot.
pub type SockIdx = usize;

/// What a slot is for; decides address family and listen/connect behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockKind {
    /// Plain stream connection.
    Raw,
    /// Listening socket, backlog 3.
    Listen,
    /// Listening socket accepting a single connection (backlog 1).
    ListenOnce,
    /// UNIX-domain listening socket.
    Unix,
}

impl SockKind {
    fn is_listener(self) -> bool {
        matches!(self, SockKind::Listen | SockKind::ListenOnce)
    }
}

/// Callback invoked by the poll thread when a slot turns readable.
pub type EventFn = Box<dyn Fn() + Send>;

/// Callback invoked once with the local address chosen for a listener.
/// Returning `Err(Again)` asks the caller to retry on another port.
pub type ListenCb<'a> = &'a mut dyn FnMut(SocketAddr) -> Result<()>;

struct Slot {
    fd: RawFd,
    kind: SockKind,
    domain: Option<String>,
    ipname: Option<String>,
    port: u16,
    ready: bool,
    events: i16,
    revents: i16,
    callback: Option<EventFn>,
    unix_path: Option<PathBuf>,
}

impl Slot {
    fn new(fd: RawFd, kind: SockKind) -> Self {
        Slot {
            fd,
            kind,
            domain: None,
            ipname: None,
            port: 0,
            ready: false,
            // POLLHUP in requested events tells the poll thread to reset
            events: libc::POLLHUP,
            revents: 0,
            callback: None,
            unix_path: None,
        }
    }
}

struct Table {
    slots: Slab<Slot>,
    /// Set by the poll thread after each completed pass.
    pass_done: bool,
}

/// The socket manager. One per process, shared by reference.
pub struct SocketSet {
    table: Mutex<Table>,
    /// Broadcast when a poll pass completes (blocking waiters).
    pass_cv: Condvar,
    /// Broadcast when a poll pass completes (async waiters).
    notify: Notify,
    /// Write end of the self-pipe that interrupts the poll thread.
    wake_fd: RawFd,
    /// Keep the canonical reverse name only when it forward-resolves back.
    strict_backresolve: bool,
}

fn set_nonblocking(fd: RawFd) {
    // SAFETY: plain fcntl on a descriptor we own.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK | libc::O_ASYNC);
        libc::fcntl(fd, libc::F_SETOWN, libc::getpid());
    }
}

fn new_stream_socket(kind: SockKind) -> Result<RawFd> {
    let family = if kind == SockKind::Unix { libc::AF_UNIX } else { libc::AF_INET };
    // SAFETY: socket() with constant arguments.
    let fd = unsafe { libc::socket(family, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(Error::NoSocket);
    }
    Ok(fd)
}

/// sockaddr_storage helpers: the slot table speaks std `SocketAddr`.
mod sa {
    use super::*;

    pub union Storage {
        pub ss: libc::sockaddr_storage,
        pub v4: libc::sockaddr_in,
        pub v6: libc::sockaddr_in6,
        pub un: libc::sockaddr_un,
    }

    pub fn from_std(addr: SocketAddr) -> (Storage, libc::socklen_t) {
        // SAFETY: zeroed sockaddr_storage is a valid all-families blank.
        let mut st: Storage = unsafe { mem::zeroed() };
        match addr {
            SocketAddr::V4(a) => {
                let v4 = libc::sockaddr_in {
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: a.port().to_be(),
                    sin_addr: libc::in_addr { s_addr: u32::from_ne_bytes(a.ip().octets()) },
                    sin_zero: [0; 8],
                };
                st.v4 = v4;
                (st, mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
            }
            SocketAddr::V6(a) => {
                let mut v6: libc::sockaddr_in6 = unsafe { mem::zeroed() };
                v6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                v6.sin6_port = a.port().to_be();
                v6.sin6_addr.s6_addr = a.ip().octets();
                st.v6 = v6;
                (st, mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
            }
        }
    }

    pub fn to_std(st: &Storage) -> Option<SocketAddr> {
        // SAFETY: family tag picks the active union member.
        unsafe {
            match st.ss.ss_family as i32 {
                libc::AF_INET => {
                    let v4 = &st.v4;
                    let ip = Ipv4Addr::from(v4.sin_addr.s_addr.to_ne_bytes());
                    Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(v4.sin_port))))
                }
                libc::AF_INET6 => {
                    let v6 = &st.v6;
                    let ip = Ipv6Addr::from(v6.sin6_addr.s6_addr);
                    // surface v4-mapped addresses as plain IPv4
                    if let Some(mapped) = ip.to_ipv4_mapped() {
                        return Some(SocketAddr::V4(SocketAddrV4::new(
                            mapped,
                            u16::from_be(v6.sin6_port),
                        )));
                    }
                    Some(SocketAddr::V6(SocketAddrV6::new(ip, u16::from_be(v6.sin6_port), 0, 0)))
                }
                _ => None,
            }
        }
    }
}

/// Blocking getaddrinfo wrapper keeping the EAI distinction the closed
/// error set needs (`ResolveTimeout` vs `NoSuchDomain`).
pub fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>> {
    let chost = CString::new(host).map_err(|_| Error::NoSuchDomain)?;
    // SAFETY: zeroed addrinfo is a valid hints blank.
    let mut hints: libc::addrinfo = unsafe { mem::zeroed() };
    hints.ai_family = libc::AF_UNSPEC;
    hints.ai_socktype = libc::SOCK_STREAM;
    let mut res: *mut libc::addrinfo = std::ptr::null_mut();
    // SAFETY: chost outlives the call; res is checked before use.
    let rc = unsafe { libc::getaddrinfo(chost.as_ptr(), std::ptr::null(), &hints, &mut res) };
    match rc {
        0 => {}
        libc::EAI_AGAIN => return Err(Error::ResolveTimeout),
        libc::EAI_SYSTEM => return Err(Error::last_os()),
        _ => return Err(Error::NoSuchDomain),
    }
    let mut out = Vec::new();
    let mut cur = res;
    while !cur.is_null() {
        // SAFETY: cur walks the list getaddrinfo returned.
        unsafe {
            let ai = &*cur;
            if !ai.ai_addr.is_null() {
                let mut st: sa::Storage = mem::zeroed();
                let len = (ai.ai_addrlen as usize).min(mem::size_of::<libc::sockaddr_storage>());
                std::ptr::copy_nonoverlapping(ai.ai_addr as *const u8, &mut st as *mut _ as *mut u8, len);
                if let Some(mut addr) = sa::to_std(&st) {
                    addr.set_port(port);
                    out.push(addr);
                }
            }
            cur = ai.ai_next;
        }
    }
    // SAFETY: res came from getaddrinfo.
    unsafe { libc::freeaddrinfo(res) };
    if out.is_empty() {
        return Err(Error::NoSuchDomain);
    }
    Ok(out)
}

/// Reverse lookup via getnameinfo; `None` when the address has no name.
fn reverse_lookup(addr: SocketAddr) -> Option<String> {
    let (st, len) = sa::from_std(addr);
    let mut host = [0u8; 1025];
    // SAFETY: st/len describe one sockaddr; host is a writable buffer.
    let rc = unsafe {
        libc::getnameinfo(
            &st.ss as *const _ as *const libc::sockaddr,
            len,
            host.as_mut_ptr() as *mut libc::c_char,
            host.len() as libc::socklen_t,
            std::ptr::null_mut(),
            0,
            libc::NI_NAMEREQD,
        )
    };
    if rc != 0 {
        return None;
    }
    let end = host.iter().position(|&b| b == 0).unwrap_or(host.len());
    String::from_utf8(host[..end].to_vec()).ok()
}

impl SocketSet {
    /// Create the slot table and start the poll thread.
    pub fn new(strict_backresolve: bool) -> std::sync::Arc<Self> {
        let mut pipe = [0 as RawFd; 2];
        // SAFETY: pipe2 fills the two descriptors.
        let rc = unsafe { libc::pipe2(pipe.as_mut_ptr(), libc::O_NONBLOCK) };
        assert!(rc == 0, "cannot create poll wake pipe");
        let set = std::sync::Arc::new(SocketSet {
            table: Mutex::new(Table { slots: Slab::with_capacity(32), pass_done: true }),
            pass_cv: Condvar::new(),
            notify: Notify::new(),
            wake_fd: pipe[1],
            strict_backresolve,
        });
        let clone = set.clone();
        let wake_rd = pipe[0];
        std::thread::Builder::new()
            .name("foxeye-poll".into())
            .spawn(move || clone.poll_thread(wake_rd))
            .expect("cannot start poll thread");
        set
    }

    /// Interrupt the poll thread so it reloads requested events.
    fn wake_poll(&self) {
        // SAFETY: one byte into our own pipe; EAGAIN just means it is
        // already pending.
        unsafe {
            let b = 0u8;
            libc::write(self.wake_fd, &b as *const u8 as *const libc::c_void, 1);
        }
    }

    fn poll_thread(&self, wake_rd: RawFd) {
        // persistent private pollfd array; slot i lives at local[i + 1]
        let mut local: Vec<libc::pollfd> = Vec::new();
        loop {
            let mut n;
            {
                let mut t = self.table.lock().unwrap();
                t.pass_done = false;
                // run callbacks for slots that already have input or errors
                for (_, s) in t.slots.iter() {
                    if s.fd >= 0
                        && s.revents & (libc::POLLIN | libc::POLLERR | libc::POLLHUP) != 0
                    {
                        if let Some(cb) = &s.callback {
                            cb();
                        }
                    }
                }
                n = t.slots.capacity().max(1);
                local.resize(n + 1, libc::pollfd { fd: -1, events: 0, revents: 0 });
                local[0] = libc::pollfd { fd: wake_rd, events: libc::POLLIN, revents: 0 };
                for i in 0..n {
                    let l = &mut local[i + 1];
                    match t.slots.get_mut(i) {
                        Some(s) => {
                            if s.events & libc::POLLHUP != 0 {
                                l.events = 0; // signalled to reset
                            } else {
                                l.events |= s.events;
                            }
                            l.fd = s.fd;
                            s.events = 0;
                            if s.revents & libc::POLLHUP != 0 {
                                l.fd = -1; // connection died, stop watching
                            }
                        }
                        None => {
                            l.fd = -1;
                            l.events = 0;
                        }
                    }
                }
            }
            n += 1;
            // SAFETY: local is a live array of n pollfds.
            let rc = unsafe { libc::poll(local.as_mut_ptr(), n as libc::nfds_t, -1) };
            if rc > 0 && local[0].revents & libc::POLLIN != 0 {
                // drain the wake pipe
                let mut scratch = [0u8; 64];
                // SAFETY: reading our own nonblocking pipe.
                while unsafe {
                    libc::read(wake_rd, scratch.as_mut_ptr() as *mut libc::c_void, scratch.len())
                } > 0
                {}
                local[0].revents = 0;
            }
            {
                let mut t = self.table.lock().unwrap();
                for i in 0..n - 1 {
                    let l = &mut local[i + 1];
                    if let Some(s) = t.slots.get_mut(i) {
                        if s.events & libc::POLLHUP != 0 {
                            // slot was reset while we polled
                        } else if l.fd >= 0 && l.revents != 0 {
                            l.events &= !l.revents;
                            if l.fd == s.fd {
                                s.revents |= l.revents;
                            }
                            l.revents = 0;
                        }
                    }
                }
                t.pass_done = true;
                self.pass_cv.notify_all();
                self.notify.notify_waiters();
            }
            std::thread::sleep(Duration::from_micros(100));
        }
    }

    /// Lock the table, request events on `idx` and make sure the observed
    /// state is fresh: either wake the poll thread and wait for its pass,
    /// or (when nothing changed) poll our own descriptor with no timeout.
    fn acquire_and_poll(&self, idx: SockIdx, write: bool) -> MutexGuard<'_, Table> {
        let mut t = self.table.lock().unwrap();
        let wanted = if write {
            libc::POLLIN | libc::POLLPRI | libc::POLLOUT
        } else {
            libc::POLLIN | libc::POLLPRI
        };
        let Some(s) = t.slots.get_mut(idx) else { return t };
        let old = s.events;
        s.events = wanted;
        if old != wanted || s.revents != 0 {
            self.wake_poll();
            while !t.pass_done {
                let (nt, _) = self
                    .pass_cv
                    .wait_timeout(t, Duration::from_millis(1))
                    .unwrap();
                t = nt;
                self.wake_poll();
            }
        } else if let Some(s) = t.slots.get_mut(idx) {
            if s.revents & wanted == 0 {
                // opportunistic zero-timeout poll on just this descriptor
                let mut pfd = libc::pollfd { fd: s.fd, events: wanted, revents: 0 };
                // SAFETY: one pollfd, zero timeout.
                unsafe { libc::poll(&mut pfd, 1, 0) };
                s.revents |= pfd.revents;
            }
        }
        t
    }

    /// Allocate a slot with an unbound descriptor of the matching family.
    pub fn get(&self, kind: SockKind) -> Result<SockIdx> {
        let fd = new_stream_socket(kind)?;
        let mut t = self.table.lock().unwrap();
        if t.slots.len() >= SOCKET_MAX {
            drop(t);
            // SAFETY: closing the fd we just opened.
            unsafe { libc::close(fd) };
            return Err(Error::NoSocket);
        }
        let idx = t.slots.insert(Slot::new(fd, kind));
        debug!(idx, fd, ?kind, "socket: allocated");
        Ok(idx)
    }

    /// Replace the descriptor after a failed [`setup`](Self::setup) without
    /// giving up the slot.
    pub fn reset(&self, idx: SockIdx, kind: SockKind) {
        let mut t = self.table.lock().unwrap();
        let Some(s) = t.slots.get_mut(idx) else { return };
        let old = s.fd;
        s.fd = -1;
        s.ipname = None;
        s.domain = None;
        if old >= 0 {
            // SAFETY: closing a descriptor this slot owned.
            unsafe { libc::close(old) };
        }
        if let Ok(fd) = new_stream_socket(kind) {
            s.fd = fd;
            s.revents = 0;
            s.kind = kind;
            debug!(idx, fd, "socket: reset");
        }
    }

    /// Shut down and release a slot. UNIX listener paths are unlinked.
    pub fn kill(&self, idx: SockIdx) {
        let mut t = self.table.lock().unwrap();
        let Some(s) = t.slots.try_remove(idx) else { return };
        drop(t);
        debug!(idx, fd = s.fd, "socket: kill");
        if s.fd >= 0 {
            // SAFETY: shutting down and closing our own descriptor.
            unsafe {
                libc::shutdown(s.fd, libc::SHUT_RDWR);
                libc::close(s.fd);
            }
        }
        if let Some(path) = s.unix_path {
            let _ = std::fs::remove_file(path);
        }
        self.wake_poll();
    }

    /// Register the readable-event callback the event core uses to wake
    /// interfaces.
    pub fn associate(&self, idx: SockIdx, callback: EventFn) {
        let mut t = self.table.lock().unwrap();
        if let Some(s) = t.slots.get_mut(idx) {
            s.callback = Some(callback);
        }
    }

    /// Resolve, bind/listen or connect, and switch the descriptor to
    /// non-blocking. Blocking: call from a worker.
    pub fn setup(
        &self,
        idx: SockIdx,
        domain: Option<&str>,
        bind_host: Option<&str>,
        port: u16,
        mut callback: Option<ListenCb<'_>>,
    ) -> Result<()> {
        let (fd, kind) = {
            let t = self.table.lock().unwrap();
            let s = t.slots.get(idx).ok_or(Error::NoSocket)?;
            if s.fd < 0 {
                return Err(Error::NoSocket);
            }
            (s.fd, s.kind)
        };
        if domain.is_none() && !kind.is_listener() && kind != SockKind::Unix {
            return Err(Error::UndefDomain);
        }

        if kind == SockKind::Unix {
            let path = domain.ok_or(Error::UndefDomain)?;
            let cpath = CString::new(path).map_err(|_| Error::UndefDomain)?;
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            // SAFETY: building a sockaddr_un from a bounded path.
            unsafe {
                let mut un: libc::sockaddr_un = mem::zeroed();
                un.sun_family = libc::AF_UNIX as libc::sa_family_t;
                let bytes = cpath.as_bytes_with_nul();
                if bytes.len() > un.sun_path.len() {
                    return Err(Error::UndefDomain);
                }
                for (dst, src) in un.sun_path.iter_mut().zip(bytes) {
                    *dst = *src as libc::c_char;
                }
                let len = mem::size_of::<libc::sa_family_t>() + path.len();
                if libc::bind(fd, &un as *const _ as *const libc::sockaddr, len as libc::socklen_t) < 0
                {
                    return Err(Error::last_os());
                }
                if libc::listen(fd, 3) < 0 {
                    return Err(Error::last_os());
                }
            }
            let mut t = self.table.lock().unwrap();
            let s = t.slots.get_mut(idx).ok_or(Error::NoSocket)?;
            s.port = 0;
            s.domain = Some(path.to_owned());
            s.unix_path = Some(PathBuf::from(path));
            s.events = libc::POLLIN | libc::POLLPRI | libc::POLLOUT;
            drop(t);
            self.wake_poll();
            return Ok(());
        }

        let target: SocketAddr = if kind.is_listener() {
            let addr = match bind_host.or(domain) {
                Some(host) => *resolve(host, port)?.first().ok_or(Error::NoSuchDomain)?,
                None => SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)),
            };
            let one: libc::c_int = 1;
            // SAFETY: enabling SO_REUSEADDR on our descriptor.
            unsafe {
                libc::setsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_REUSEADDR,
                    &one as *const _ as *const libc::c_void,
                    mem::size_of::<libc::c_int>() as libc::socklen_t,
                );
            }
            let (st, len) = sa::from_std(addr);
            let backlog = if kind == SockKind::ListenOnce { 1 } else { 3 };
            // SAFETY: bind/listen/getsockname on our descriptor.
            unsafe {
                if libc::bind(fd, &st.ss as *const _ as *const libc::sockaddr, len) < 0 {
                    return Err(Error::last_os());
                }
                if libc::listen(fd, backlog) < 0 {
                    return Err(Error::last_os());
                }
                let mut out: sa::Storage = mem::zeroed();
                let mut olen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
                if libc::getsockname(fd, &mut out.ss as *mut _ as *mut libc::sockaddr, &mut olen) < 0 {
                    return Err(Error::last_os());
                }
                sa::to_std(&out).ok_or(Error::NoSocket)?
            }
        } else {
            // outgoing connection
            let host = domain.ok_or(Error::UndefDomain)?;
            if let Some(bind_to) = bind_host {
                let baddr = *resolve(bind_to, 0)?.first().ok_or(Error::NoSuchDomain)?;
                let (st, len) = sa::from_std(baddr);
                // SAFETY: bind on our descriptor.
                if unsafe { libc::bind(fd, &st.ss as *const _ as *const libc::sockaddr, len) } < 0 {
                    return Err(Error::last_os());
                }
            }
            let addr = *resolve(host, port)?.first().ok_or(Error::NoSuchDomain)?;
            let (st, len) = sa::from_std(addr);
            // SAFETY: connect on our descriptor; blocking by design here.
            if unsafe { libc::connect(fd, &st.ss as *const _ as *const libc::sockaddr, len) } < 0 {
                return Err(Error::last_os());
            }
            addr
        };

        // keepalive + immediate-close linger, then non-blocking
        let one: libc::c_int = 1;
        let ling = libc::linger { l_onoff: 1, l_linger: 0 };
        // SAFETY: option setting on our descriptor.
        unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_KEEPALIVE,
                &one as *const _ as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_LINGER,
                &ling as *const _ as *const libc::c_void,
                mem::size_of::<libc::linger>() as libc::socklen_t,
            );
        }
        set_nonblocking(fd);

        let ipname = target.ip().to_string();
        let canonical = reverse_lookup(target)
            .or_else(|| domain.map(str::to_owned))
            .unwrap_or_else(|| ipname.clone());

        let cb_result = match &mut callback {
            Some(cb) => cb(target),
            None => Ok(()),
        };

        let mut t = self.table.lock().unwrap();
        let s = t.slots.get_mut(idx).ok_or(Error::NoSocket)?;
        s.ipname = Some(ipname);
        s.domain = Some(canonical);
        s.port = target.port();
        s.events = libc::POLLIN | libc::POLLPRI | libc::POLLOUT;
        drop(t);
        self.wake_poll();
        cb_result
    }

    /// Accept one pending connection on a listener.
    ///
    /// Returns the new slot, `Err(Again)` when nothing is pending, or an
    /// error describing the listener's state.
    pub fn answer(&self, listen: SockIdx) -> Result<SockIdx> {
        let mut t = {
            let t = self.table.lock().unwrap();
            let s = t.slots.get(listen).ok_or(Error::NoSocket)?;
            if s.fd < 0 {
                return Err(Error::NoSocket);
            }
            drop(t);
            self.acquire_and_poll(listen, false)
        };
        let rev = {
            let s = t.slots.get_mut(listen).ok_or(Error::NoSocket)?;
            let rev = s.revents;
            s.events |= libc::POLLIN | libc::POLLPRI;
            rev
        };
        if rev & (libc::POLLIN | libc::POLLPRI | libc::POLLNVAL | libc::POLLERR) == 0
            || rev & (libc::POLLHUP | libc::POLLOUT) != 0
        {
            return Err(Error::Again);
        } else if rev & libc::POLLNVAL != 0 {
            return Err(Error::NoSocket);
        } else if rev & libc::POLLERR != 0 {
            return Err(Error::Errno(libc::EIO));
        }
        if t.slots.len() >= SOCKET_MAX {
            return Err(Error::NoSocket);
        }
        let (lfd, is_unix) = {
            let s = t.slots.get(listen).ok_or(Error::NoSocket)?;
            (s.fd, s.kind == SockKind::Unix)
        };
        // SAFETY: accept on our listening descriptor.
        let (fd, peer) = unsafe {
            let mut st: sa::Storage = mem::zeroed();
            let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            let fd = libc::accept(lfd, &mut st.ss as *mut _ as *mut libc::sockaddr, &mut len);
            (fd, if fd >= 0 && !is_unix { sa::to_std(&st) } else { None })
        };
        if let Some(s) = t.slots.get_mut(listen) {
            s.revents = 0;
            if fd >= 0 {
                // two connects can land at once, force a re-check next time
                s.revents = libc::POLLIN;
            }
        }
        if fd < 0 {
            return Err(Error::Again);
        }
        let mut slot = Slot::new(fd, SockKind::Raw);
        slot.ready = true;
        if let Some(addr) = peer {
            slot.port = addr.port();
            slot.ipname = Some(addr.ip().to_string());
            slot.domain = Some(self.canonical_peer_name(addr));
        }
        let idx = t.slots.insert(slot);
        drop(t);
        set_nonblocking(fd);
        debug!(idx, fd, "socket: answered");
        Ok(idx)
    }

    /// Reverse name for an accepted peer, honouring strict back-resolve.
    fn canonical_peer_name(&self, addr: SocketAddr) -> String {
        let ipname = addr.ip().to_string();
        let Some(name) = reverse_lookup(addr) else { return ipname };
        if self.strict_backresolve {
            match resolve(&name, addr.port()) {
                Ok(addrs) if addrs.iter().any(|a| a.ip() == addr.ip()) => name,
                _ => {
                    debug!(%name, %ipname, "socket: backresolve mismatch, using address");
                    ipname
                }
            }
        } else {
            name
        }
    }

    /// Read into `out`. `Ok(0)` = no data yet, `Err(Again)` = connect still
    /// pending, `Err(Eof)` = peer closed.
    pub fn read(&self, idx: SockIdx, out: &mut [u8]) -> Result<usize> {
        let (fd, rev, was_ready) = {
            let t = self.table.lock().unwrap();
            let s = t.slots.get(idx).ok_or(Error::NoSocket)?;
            if s.fd < 0 {
                return Err(Error::NoSocket);
            }
            let write_bit = !s.ready;
            drop(t);
            let mut t = self.acquire_and_poll(idx, write_bit);
            let s = t.slots.get_mut(idx).ok_or(Error::NoSocket)?;
            let rev = s.revents;
            s.events |= libc::POLLIN | libc::POLLPRI;
            s.revents &= !(libc::POLLIN | libc::POLLPRI | libc::POLLHUP);
            let was_ready = s.ready;
            if rev != 0 {
                s.ready = true; // connection established or failed
            }
            (s.fd, rev, was_ready)
        };
        if rev == 0 && !was_ready {
            return Err(Error::Again);
        }
        if rev & libc::POLLHUP != 0 {
            trace!(idx, "socket: POLLHUP observed");
        }
        // even a dead socket can still hold data
        // SAFETY: read into a live out buffer on our descriptor.
        let n = unsafe { libc::read(fd, out.as_mut_ptr() as *mut libc::c_void, out.len()) };
        if n == 0 {
            return Err(Error::Eof);
        }
        if n < 0 {
            let e = io::Error::last_os_error();
            return if e.kind() == io::ErrorKind::WouldBlock { Ok(0) } else { Err(e.into()) };
        }
        let n = n as usize;
        if n == out.len() {
            // buffer full: there may be more, force a re-check
            let mut t = self.table.lock().unwrap();
            if let Some(s) = t.slots.get_mut(idx) {
                s.revents |= libc::POLLIN;
            }
            drop(t);
            self.wake_poll();
        }
        Ok(n)
    }

    /// Write from `buf[*ptr..*ptr + *len]`, advancing both on success.
    /// `Ok(0)` = would block.
    pub fn write(&self, idx: SockIdx, buf: &[u8], ptr: &mut usize, len: &mut usize) -> Result<usize> {
        let fd = {
            let mut t = self.table.lock().unwrap();
            let s = t.slots.get_mut(idx).ok_or(Error::NoSocket)?;
            if s.fd < 0 {
                return Err(Error::NoSocket);
            }
            s.events |= libc::POLLOUT;
            s.revents &= !libc::POLLOUT;
            s.fd
        };
        if *len == 0 {
            return Ok(0);
        }
        let chunk = &buf[*ptr..*ptr + *len];
        // SAFETY: writing a live slice to our descriptor.
        let n = unsafe { libc::write(fd, chunk.as_ptr() as *const libc::c_void, chunk.len()) };
        if n < 0 {
            let e = io::Error::last_os_error();
            return if e.kind() == io::ErrorKind::WouldBlock { Ok(0) } else { Err(e.into()) };
        }
        if n == 0 {
            return Err(Error::Eof);
        }
        let n = n as usize;
        *ptr += n;
        *len -= n;
        let mut t = self.table.lock().unwrap();
        if let Some(s) = t.slots.get_mut(idx) {
            s.ready = true; // we sent something, so we are connected
        }
        Ok(n)
    }

    /// Resolved peer name and port (empty string when not yet set up).
    pub fn domain(&self, idx: SockIdx) -> (String, u16) {
        let t = self.table.lock().unwrap();
        match t.slots.get(idx) {
            Some(s) => (s.domain.clone().unwrap_or_default(), s.port),
            None => (String::new(), 0),
        }
    }

    /// Textual peer address.
    pub fn ip(&self, idx: SockIdx) -> String {
        let t = self.table.lock().unwrap();
        t.slots.get(idx).and_then(|s| s.ipname.clone()).unwrap_or_default()
    }

    /// Textual local address of a connected or bound socket.
    pub fn my_ip(&self, idx: SockIdx) -> Option<String> {
        let t = self.table.lock().unwrap();
        let s = t.slots.get(idx)?;
        if s.fd < 0 {
            return None;
        }
        // SAFETY: getsockname on our descriptor.
        unsafe {
            let mut st: sa::Storage = mem::zeroed();
            let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            if libc::getsockname(s.fd, &mut st.ss as *mut _ as *mut libc::sockaddr, &mut len) < 0 {
                return None;
            }
            sa::to_std(&st).map(|a| a.ip().to_string())
        }
    }

    /// Local address (ip and port) of a bound socket.
    pub fn my_addr(&self, idx: SockIdx) -> Option<SocketAddr> {
        let t = self.table.lock().unwrap();
        let s = t.slots.get(idx)?;
        if s.fd < 0 {
            return None;
        }
        // SAFETY: getsockname on our descriptor.
        unsafe {
            let mut st: sa::Storage = mem::zeroed();
            let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            if libc::getsockname(s.fd, &mut st.ss as *mut _ as *mut libc::sockaddr, &mut len) < 0 {
                return None;
            }
            sa::to_std(&st)
        }
    }

    /// True when the slot exists and its descriptor is live.
    pub fn is_live(&self, idx: SockIdx) -> bool {
        let t = self.table.lock().unwrap();
        t.slots.get(idx).map(|s| s.fd >= 0).unwrap_or(false)
    }

    /// Block until the next poll pass completes or `timeout` elapses.
    /// For workers that have nothing to do but wait for socket progress.
    pub fn wait_pass(&self, timeout: Duration) {
        let t = self.table.lock().unwrap();
        if !t.pass_done {
            let _ = self.pass_cv.wait_timeout(t, timeout);
        } else {
            drop(t);
            std::thread::sleep(timeout.min(Duration::from_millis(5)));
        }
    }

    /// Async counterpart of [`wait_pass`](Self::wait_pass): resolves when
    /// the poll thread finishes a pass. Used by the dispatcher sleep slice.
    pub async fn wait_pass_async(&self) {
        self.notify.notified().await;
    }

    /// Number of live slots, for reports.
    pub fn live_count(&self) -> usize {
        let t = self.table.lock().unwrap();
        t.slots.iter().filter(|(_, s)| s.fd >= 0).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::net::TcpStream;
    use std::sync::Arc;

    fn set() -> std::sync::Arc<SocketSet> {
        SocketSet::new(false)
    }

    #[test]
    fn test_slot_lifecycle() {
        let s = set();
        let idx = s.get(SockKind::Raw).unwrap();
        assert!(s.is_live(idx));
        assert_eq!(s.domain(idx).0, "");
        s.kill(idx);
        assert!(!s.is_live(idx));
    }

    #[test]
    fn test_listen_ephemeral_port_reported() {
        let s = set();
        let idx = s.get(SockKind::Listen).unwrap();
        let mut seen = None;
        let mut cb = |addr: SocketAddr| {
            seen = Some(addr);
            Ok(())
        };
        s.setup(idx, Some("127.0.0.1"), None, 0, Some(&mut cb)).unwrap();
        let (_, port) = s.domain(idx);
        assert_ne!(port, 0, "ephemeral port must be written back");
        assert_eq!(seen.unwrap().port(), port);
        s.kill(idx);
    }

    #[test]
    fn test_answer_and_read() {
        let s = set();
        let idx = s.get(SockKind::Listen).unwrap();
        s.setup(idx, Some("127.0.0.1"), None, 0, None).unwrap();
        let (_, port) = s.domain(idx);
        let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        client.write_all(b"ping").unwrap();
        // answer can race the poll pass; retry on Again
        let accepted = loop {
            match s.answer(idx) {
                Ok(a) => break a,
                Err(Error::Again) => s.wait_pass(Duration::from_millis(50)),
                Err(e) => panic!("answer failed: {e}"),
            }
        };
        let mut buf = [0u8; 16];
        let got = loop {
            match s.read(accepted, &mut buf) {
                Ok(0) => s.wait_pass(Duration::from_millis(50)),
                Ok(n) => break n,
                Err(Error::Again) => s.wait_pass(Duration::from_millis(50)),
                Err(e) => panic!("read failed: {e}"),
            }
        };
        assert_eq!(&buf[..got], b"ping");
        s.kill(accepted);
        s.kill(idx);
    }

    #[test]
    fn test_write_tracks_cursor() {
        let s = set();
        let idx = s.get(SockKind::Listen).unwrap();
        s.setup(idx, Some("127.0.0.1"), None, 0, None).unwrap();
        let (_, port) = s.domain(idx);
        let _client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let accepted = loop {
            match s.answer(idx) {
                Ok(a) => break a,
                Err(Error::Again) => s.wait_pass(Duration::from_millis(50)),
                Err(e) => panic!("answer failed: {e}"),
            }
        };
        let buf = b"hello";
        let mut ptr = 0usize;
        let mut len = buf.len();
        while len > 0 {
            s.write(accepted, buf, &mut ptr, &mut len).unwrap();
        }
        assert_eq!(ptr, 5);
        s.kill(accepted);
        s.kill(idx);
    }

    #[test]
    fn test_resolve_localhost() {
        let addrs = resolve("localhost", 6667).unwrap();
        assert!(addrs.iter().all(|a| a.port() == 6667));
    }

    #[test]
    fn test_associated_callback_fires_on_input() {
        use std::sync::atomic::{AtomicBool, Ordering};
        let s = set();
        let idx = s.get(SockKind::Listen).unwrap();
        s.setup(idx, Some("127.0.0.1"), None, 0, None).unwrap();
        let (_, port) = s.domain(idx);
        let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let accepted = loop {
            match s.answer(idx) {
                Ok(a) => break a,
                Err(Error::Again) => s.wait_pass(Duration::from_millis(50)),
                Err(e) => panic!("answer failed: {e}"),
            }
        };
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        s.associate(accepted, Box::new(move || flag.store(true, Ordering::SeqCst)));
        // first read arms the poll events for the slot
        let mut buf = [0u8; 8];
        let _ = s.read(accepted, &mut buf);
        client.write_all(b"wake").unwrap();
        for _ in 0..100 {
            if fired.load(Ordering::SeqCst) {
                break;
            }
            s.wait_pass(Duration::from_millis(20));
        }
        assert!(fired.load(Ordering::SeqCst), "event callback never ran");
        s.kill(accepted);
        s.kill(idx);
    }

    #[test]
    fn test_read_unallocated_slot() {
        let s = set();
        let mut buf = [0u8; 4];
        assert_eq!(s.read(99, &mut buf), Err(Error::NoSocket));
    }
}
