//! Connection chains: stacked byte-stream filters over one socket.
//!
//! A chain is a list of links living in a process-wide arena; each peer
//! holds the head link id and every `next` edge is an index, never an
//! owning pointer. The terminal link talks to the socket manager; filters
//! stacked above translate bytes both ways. The most recently grown filter
//! is outermost on writes and innermost on reads.
//!
//! Filters register in the `connchain-grow` bindtable under a one-char
//! tag. A filter may declare itself *sticky*: its link survives a peer
//! rebuild (the preserved sub-chain becomes the initial chain of the new
//! peer), which is how a TLS session outlives a reconnect without a second
//! handshake.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use slab::Slab;
use tracing::{debug, trace};

use crate::core::CoreRef;
use crate::error::{Error, Result};
use crate::peer::Peer;
use crate::socket::{SockIdx, SocketSet};

/// Link identity in the arena.
pub type LinkId = usize;

/// Peer identity used by the sticky registry; survives peer rebuilds when
/// the session logic carries it over.
pub type PeerToken = u64;

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Fresh token for a new logical peer.
pub fn new_peer_token() -> PeerToken {
    NEXT_TOKEN.fetch_add(1, Ordering::Relaxed)
}

/// Maximum framed message length, bytes.
pub const MESSAGE_MAX: usize = 512;
/// Per-direction ring capacity of the line framer.
pub const LINE_RING: usize = 2 * 4 * MESSAGE_MAX;

/// One link's behavior. All methods receive a [`Down`] handle onto the
/// rest of the chain.
pub trait Filter: Send {
    /// Push application bytes toward the socket. Returns how many bytes
    /// of `data` were consumed; `Ok(0)` means "try again later".
    fn send(&mut self, down: &mut Down<'_>, data: &[u8]) -> Result<usize>;

    /// Readiness probe (the zero-length write of the wire protocol).
    fn ready(&mut self, down: &mut Down<'_>) -> Result<bool>;

    /// Flush buffered output. `Ok(0)` while something is still pending;
    /// the raw terminal answers `Err(NoSocket)` once the probe reaches it.
    fn flush(&mut self, down: &mut Down<'_>) -> Result<usize>;

    /// Pull bytes toward the application. `Ok(0)` = nothing yet; an error
    /// tears this link down.
    fn recv(&mut self, down: &mut Down<'_>, out: &mut [u8]) -> Result<usize>;

    /// Raw drain used while a newly grown filter swallows an older chain:
    /// returns buffered not-yet-translated input without touching the
    /// socket. Default forwards downward.
    fn pull(&mut self, down: &mut Down<'_>, out: &mut [u8]) -> Result<usize> {
        down.pull(out)
    }

    /// Termination notice before the link is dropped.
    fn close(&mut self, _down: &mut Down<'_>) {}
}

/// What a grow binding produced.
pub struct Grown {
    pub filter: Box<dyn Filter>,
    pub sticky: bool,
}

/// Context handed to a `connchain-grow` binding.
pub struct GrowCtx<'a> {
    pub peer: &'a mut Peer,
    pub core: &'a CoreRef,
    /// Probe only: the binding must not commit side effects.
    pub test: bool,
}

/// Callback type for the `connchain-grow` bindtable.
pub type FilterInit = Arc<dyn Fn(&mut GrowCtx<'_>) -> Option<Grown> + Send + Sync>;

struct LinkSlot {
    tag: char,
    next: Option<LinkId>,
    filter: Option<Box<dyn Filter>>,
}

/// Handle a filter uses to reach the rest of its chain.
pub struct Down<'a> {
    mgr: &'a ChainMgr,
    /// The calling link's `next` cell.
    pub head: &'a mut Option<LinkId>,
    idx: SockIdx,
    /// Set by a filter that wants itself removed from the chain (TLS
    /// bypass); honoured by the caller after the current call returns.
    pub shrink_self: bool,
}

impl<'a> Down<'a> {
    pub fn idx(&self) -> SockIdx {
        self.idx
    }

    pub fn sockets(&self) -> &Arc<SocketSet> {
        &self.mgr.sockets
    }

    pub fn put(&mut self, data: &[u8]) -> Result<usize> {
        self.mgr.put(self.head, self.idx, data)
    }

    pub fn ready(&mut self) -> Result<bool> {
        self.mgr.ready(self.head, self.idx)
    }

    pub fn flush(&mut self) -> Result<usize> {
        self.mgr.flush(self.head, self.idx)
    }

    pub fn get(&mut self, out: &mut [u8]) -> Result<usize> {
        self.mgr.get(self.head, self.idx, out)
    }

    pub fn pull(&mut self, out: &mut [u8]) -> Result<usize> {
        self.mgr.pull(self.head, out)
    }

    /// Operate on a chain other than our own `next` (the saved-chain drain
    /// of mid-stream filter installs).
    pub fn pull_at(&self, head: &mut Option<LinkId>, out: &mut [u8]) -> Result<usize> {
        self.mgr.pull(head, out)
    }

    pub fn flush_at(&self, head: &mut Option<LinkId>, idx: SockIdx) -> Result<usize> {
        self.mgr.flush(head, idx)
    }

    pub fn close_at(&self, head: &mut Option<LinkId>, idx: SockIdx) {
        self.mgr.close(head, idx)
    }
}

/// The arena plus the sticky registry.
pub struct ChainMgr {
    links: Mutex<Slab<LinkSlot>>,
    sticky: Mutex<Vec<(PeerToken, LinkId)>>,
    sockets: Arc<SocketSet>,
}

enum Op<'o> {
    Send(&'o [u8]),
    Ready,
    Flush,
    Recv(&'o mut [u8]),
    Pull(&'o mut [u8]),
}

impl ChainMgr {
    pub fn new(sockets: Arc<SocketSet>) -> Arc<ChainMgr> {
        Arc::new(ChainMgr { links: Mutex::new(Slab::new()), sticky: Mutex::new(Vec::new()), sockets })
    }

    /// Append a link on top of `head`.
    pub fn push_link(&self, head: &mut Option<LinkId>, tag: char, filter: Box<dyn Filter>) -> LinkId {
        let mut links = self.links.lock().unwrap();
        let id = links.insert(LinkSlot { tag, next: *head, filter: Some(filter) });
        *head = Some(id);
        debug!(id, tag = %tag, "chain: created link");
        id
    }

    /// Initial chain for a peer: the sticky sub-chain when one is
    /// registered for this token, a fresh raw terminal otherwise.
    pub fn create(&self, token: PeerToken) -> Option<LinkId> {
        let sticky = self.sticky.lock().unwrap();
        if let Some(&(_, link)) = sticky.iter().find(|&&(t, _)| t == token) {
            debug!(link, token, "chain: adopted sticky chain");
            return Some(link);
        }
        drop(sticky);
        self.new_terminal()
    }

    /// Fresh raw terminal chain, no sticky adoption (mid-stream filter
    /// installs re-root over one of these).
    pub fn new_terminal(&self) -> Option<LinkId> {
        let mut head = None;
        self.push_link(&mut head, '\0', Box::new(RawLink));
        head
    }

    fn has_sticky(&self, token: PeerToken) -> bool {
        self.sticky.lock().unwrap().iter().any(|&(t, _)| t == token)
    }

    fn register_sticky(&self, token: PeerToken, link: LinkId) {
        debug!(token, link, "chain: registered sticky link");
        self.sticky.lock().unwrap().push((token, link));
    }

    fn drop_sticky_for_link(&self, link: LinkId) {
        let mut sticky = self.sticky.lock().unwrap();
        let before = sticky.len();
        sticky.retain(|&(_, l)| l != link);
        if sticky.len() != before {
            debug!(link, "chain: destroyed sticky registration");
        }
    }

    fn tags_of(&self, head: Option<LinkId>) -> Vec<char> {
        let links = self.links.lock().unwrap();
        let mut out = Vec::new();
        let mut cur = head;
        while let Some(id) = cur {
            match links.get(id) {
                Some(s) => {
                    out.push(s.tag);
                    cur = s.next;
                }
                None => break,
            }
        }
        out
    }

    /// Grow a filter with the given tag on a peer's chain.
    ///
    /// Returns 1 on success, 0 when no registered filter admits the peer,
    /// −1 on a duplicate tag (or no socket).
    pub fn grow(&self, peer: &mut Peer, tag: char, core: &CoreRef) -> i32 {
        if peer.socket.is_none() {
            return -1;
        }
        if peer.chain.is_none() {
            peer.chain = self.create(peer.token);
        }
        if tag == '\0' {
            return 1; // idle call, chain is rooted now
        }
        if self.tags_of(peer.chain).contains(&tag) {
            debug!(tag = %tag, "chain: duplicate link refused");
            return -1;
        }
        let had_sticky = self.has_sticky(peer.token);
        let bindings = core.binds.connchain_grow.lookup(&tag.to_string(), peer.uf);
        for b in bindings {
            let mut ctx = GrowCtx { peer: &mut *peer, core, test: false };
            let Some(grown) = (b.func)(&mut ctx) else { continue };
            if grown.sticky && had_sticky {
                continue; // one sticky filter per peer
            }
            let sticky = grown.sticky;
            let id = self.push_link(&mut peer.chain, tag, grown.filter);
            if sticky {
                self.register_sticky(peer.token, id);
            }
            return 1;
        }
        debug!(tag = %tag, "chain: no filter for tag");
        0
    }

    /// Probe whether [`grow`](Self::grow) would succeed, committing
    /// nothing.
    pub fn check(&self, peer: &mut Peer, tag: char, core: &CoreRef) -> i32 {
        if tag == '\0' {
            return 1;
        }
        if self.tags_of(peer.chain).contains(&tag) {
            return -1;
        }
        let bindings = core.binds.connchain_grow.lookup(&tag.to_string(), peer.uf);
        for b in bindings {
            let mut ctx = GrowCtx { peer: &mut *peer, core, test: true };
            if (b.func)(&mut ctx).is_some() {
                return 1;
            }
        }
        0
    }

    fn run(&self, head_cell: &mut Option<LinkId>, idx: SockIdx, op: Op<'_>) -> Result<usize> {
        let Some(id) = *head_cell else { return Err(Error::NoSocket) };
        let (mut filter, mut next) = {
            let mut links = self.links.lock().unwrap();
            let slot = links.get_mut(id).ok_or(Error::NoSocket)?;
            let f = slot.filter.take().ok_or(Error::NoSocket)?;
            (f, slot.next)
        };
        let mut down = Down { mgr: self, head: &mut next, idx, shrink_self: false };
        let result = match op {
            Op::Send(data) => filter.send(&mut down, data),
            Op::Ready => filter.ready(&mut down).map(|r| r as usize),
            Op::Flush => filter.flush(&mut down),
            Op::Recv(out) => filter.recv(&mut down, out),
            Op::Pull(out) => filter.pull(&mut down, out),
        };
        let shrink = down.shrink_self;
        {
            let mut links = self.links.lock().unwrap();
            if let Some(slot) = links.get_mut(id) {
                slot.filter = Some(filter);
                slot.next = next;
            }
        }
        if shrink {
            self.shrink(head_cell);
        }
        result
    }

    /// Write through the chain. Zero-length writes are rejected; use
    /// [`ready`](Self::ready) for the probe.
    pub fn put(&self, head: &mut Option<LinkId>, idx: SockIdx, data: &[u8]) -> Result<usize> {
        self.run(head, idx, Op::Send(data))
    }

    /// Readiness probe propagated through every link.
    pub fn ready(&self, head: &mut Option<LinkId>, idx: SockIdx) -> Result<bool> {
        self.run(head, idx, Op::Ready).map(|v| v != 0)
    }

    /// Flush probe (the null-buffer write).
    pub fn flush(&self, head: &mut Option<LinkId>, idx: SockIdx) -> Result<usize> {
        self.run(head, idx, Op::Flush)
    }

    /// Read through the chain. On an error from the top link, that link is
    /// torn down, its sticky registration cleared, and the head advanced
    /// to the next link; the error is returned.
    pub fn get(&self, head: &mut Option<LinkId>, idx: SockIdx, out: &mut [u8]) -> Result<usize> {
        match self.run(head, idx, Op::Recv(out)) {
            Ok(n) => Ok(n),
            Err(e) => {
                self.teardown_top(head, idx);
                Err(e)
            }
        }
    }

    /// Raw drain (no socket behind it): read leftover buffered input.
    pub fn pull(&self, head: &mut Option<LinkId>, out: &mut [u8]) -> Result<usize> {
        // errors in pull mode do not tear links down
        self.run(head, usize::MAX, Op::Pull(out))
    }

    fn teardown_top(&self, head: &mut Option<LinkId>, idx: SockIdx) {
        let Some(id) = *head else { return };
        let (filter, next) = {
            let mut links = self.links.lock().unwrap();
            match links.try_remove(id) {
                Some(slot) => (slot.filter, slot.next),
                None => return,
            }
        };
        if let Some(mut f) = filter {
            let mut next_cell = next;
            let mut down = Down { mgr: self, head: &mut next_cell, idx, shrink_self: false };
            f.close(&mut down);
        }
        self.drop_sticky_for_link(id);
        debug!(id, "chain: destroyed link");
        *head = next;
    }

    /// Tear the whole chain down from the top.
    pub fn close(&self, head: &mut Option<LinkId>, idx: SockIdx) {
        while head.is_some() {
            self.teardown_top(head, idx);
        }
    }

    /// Remove the topmost link without touching the rest (pre-handshake
    /// byte peek revealed the assumed filter is wrong).
    pub fn shrink(&self, head: &mut Option<LinkId>) {
        let Some(id) = *head else { return };
        let next = {
            let mut links = self.links.lock().unwrap();
            links.try_remove(id).and_then(|s| s.next)
        };
        self.drop_sticky_for_link(id);
        trace!(id, "chain: shrunk top link");
        *head = next;
    }

    /// Links currently allocated, for reports.
    pub fn link_count(&self) -> usize {
        self.links.lock().unwrap().len()
    }
}

/// Terminal link: raw socket read/write through the socket manager.
/// Socket identity comes with each call, so a preserved chain works over a
/// replacement socket untouched.
struct RawLink;

impl Filter for RawLink {
    fn send(&mut self, down: &mut Down<'_>, data: &[u8]) -> Result<usize> {
        let mut ptr = 0;
        let mut len = data.len();
        let n = down.sockets().write(down.idx(), data, &mut ptr, &mut len)?;
        if n > 0 {
            trace!(idx = down.idx(), n, "chain: raw put");
        }
        Ok(n)
    }

    fn ready(&mut self, _down: &mut Down<'_>) -> Result<bool> {
        Ok(true)
    }

    fn flush(&mut self, _down: &mut Down<'_>) -> Result<usize> {
        Err(Error::NoSocket) // nothing of our own to flush
    }

    fn recv(&mut self, down: &mut Down<'_>, out: &mut [u8]) -> Result<usize> {
        let n = down.sockets().read(down.idx(), out)?;
        if n > 0 {
            trace!(idx = down.idx(), n, "chain: raw got");
        }
        Ok(n)
    }

    fn pull(&mut self, _down: &mut Down<'_>, _out: &mut [u8]) -> Result<usize> {
        Err(Error::NoSocket) // no buffer of our own to drain
    }
}

/// Filter `x`: the line framer. Inbound produces newline-terminated lines
/// with the trailing CR stripped; outbound appends CRLF to each write.
pub struct LineFramer {
    inbuf: Vec<u8>,
    outbuf: Vec<u8>,
    outpos: usize,
    in_err: Option<Error>,
}

impl LineFramer {
    pub fn new() -> LineFramer {
        LineFramer { inbuf: Vec::new(), outbuf: Vec::new(), outpos: 0, in_err: None }
    }

    /// Extract one line from the ring, or the full ring minus its last
    /// byte when it filled without a newline.
    fn take_line(&mut self, out: &mut [u8]) -> Option<usize> {
        if let Some(nl) = self.inbuf.iter().position(|&b| b == b'\n') {
            let mut end = nl;
            if end > 0 && self.inbuf[end - 1] == b'\r' {
                end -= 1;
            }
            let n = end.min(out.len());
            out[..n].copy_from_slice(&self.inbuf[..n]);
            self.inbuf.drain(..=nl);
            return Some(n);
        }
        if self.inbuf.len() >= LINE_RING {
            // full ring, no newline: hand it over, last byte is lost
            let n = (LINE_RING - 1).min(out.len());
            out[..n].copy_from_slice(&self.inbuf[..n]);
            self.inbuf.clear();
            return Some(n);
        }
        None
    }

    fn push_out(&mut self, down: &mut Down<'_>) -> Result<usize> {
        while self.outpos < self.outbuf.len() {
            let n = down.put(&self.outbuf[self.outpos..])?;
            if n == 0 {
                break;
            }
            self.outpos += n;
        }
        if self.outpos >= self.outbuf.len() {
            self.outbuf.clear();
            self.outpos = 0;
        }
        Ok(self.outbuf.len() - self.outpos)
    }
}

impl Default for LineFramer {
    fn default() -> Self {
        LineFramer::new()
    }
}

impl Filter for LineFramer {
    fn send(&mut self, down: &mut Down<'_>, data: &[u8]) -> Result<usize> {
        if self.push_out(down)? > 0 {
            return Ok(0); // tail kept for the next attempt
        }
        let take = data.len().min(LINE_RING - 2);
        self.outbuf.extend_from_slice(&data[..take]);
        self.outbuf.extend_from_slice(b"\r\n");
        self.outpos = 0;
        let _ = self.push_out(down); // best effort now, retry later
        Ok(take)
    }

    fn ready(&mut self, down: &mut Down<'_>) -> Result<bool> {
        if self.push_out(down)? > 0 {
            return Ok(false);
        }
        down.ready()
    }

    fn flush(&mut self, down: &mut Down<'_>) -> Result<usize> {
        if self.push_out(down)? > 0 {
            return Ok(0);
        }
        down.flush()
    }

    fn recv(&mut self, down: &mut Down<'_>, out: &mut [u8]) -> Result<usize> {
        if let Some(n) = self.take_line(out) {
            return Ok(n);
        }
        if let Some(e) = self.in_err {
            if !self.inbuf.is_empty() {
                // hand over what is left before dying
                let n = self.inbuf.len().min(out.len());
                out[..n].copy_from_slice(&self.inbuf[..n]);
                self.inbuf.drain(..n);
                return Ok(n);
            }
            return Err(e);
        }
        let room = LINE_RING - self.inbuf.len();
        if room > 0 {
            let mut tmp = vec![0u8; room];
            match down.get(&mut tmp) {
                Ok(0) => return Ok(0),
                Ok(n) => self.inbuf.extend_from_slice(&tmp[..n]),
                Err(e) => {
                    self.in_err = Some(e);
                    return self.recv(down, out);
                }
            }
        }
        Ok(self.take_line(out).unwrap_or(0))
    }

    fn pull(&mut self, down: &mut Down<'_>, out: &mut [u8]) -> Result<usize> {
        if !self.inbuf.is_empty() {
            let n = self.inbuf.len().min(out.len());
            out[..n].copy_from_slice(&self.inbuf[..n]);
            self.inbuf.drain(..n);
            return Ok(n);
        }
        down.pull(out)
    }
}

/// Register the stock `x` filter.
pub fn register_line_framer(core: &CoreRef) {
    use crate::peer::UserFlag;
    let init: FilterInit = Arc::new(|_ctx: &mut GrowCtx<'_>| {
        Some(Grown { filter: Box::new(LineFramer::new()), sticky: false })
    });
    core.binds.connchain_grow.add("x", UserFlag::empty(), init);
}


#[cfg(test)]
mod tests {
    use super::testwire::mock_chain;
    use super::*;

    fn mgr() -> Arc<ChainMgr> {
        ChainMgr::new(SocketSet::new(false))
    }

    #[test]
    fn test_framer_appends_crlf() {
        let m = mgr();
        let (mut head, _rx, tx) = mock_chain(&m);
        m.push_link(&mut head, 'x', Box::new(LineFramer::new()));
        let n = m.put(&mut head, 0, b"hello").unwrap();
        assert_eq!(n, 5);
        assert_eq!(tx.lock().unwrap().as_slice(), b"hello\r\n");
    }

    #[test]
    fn test_framer_splits_lines_strips_cr() {
        let m = mgr();
        let (mut head, rx, _tx) = mock_chain(&m);
        m.push_link(&mut head, 'x', Box::new(LineFramer::new()));
        rx.lock().unwrap().extend(b"abc\r\ndef\r\n");
        let mut buf = [0u8; 64];
        let n = m.get(&mut head, 0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"abc");
        let n = m.get(&mut head, 0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"def");
        let n = m.get(&mut head, 0, &mut buf).unwrap();
        assert_eq!(n, 0, "no more lines");
    }

    #[test]
    fn test_framer_roundtrip_identity() {
        // outbound CRLF append then inbound strip is the identity
        let m = mgr();
        let (mut head, rx, tx) = mock_chain(&m);
        m.push_link(&mut head, 'x', Box::new(LineFramer::new()));
        let payload = b"some text without line breaks";
        m.put(&mut head, 0, payload).unwrap();
        let wire = tx.lock().unwrap().clone();
        rx.lock().unwrap().extend(wire.iter());
        let mut buf = [0u8; 128];
        let n = m.get(&mut head, 0, &mut buf).unwrap();
        assert_eq!(&buf[..n], payload);
    }

    #[test]
    fn test_framer_full_ring_drops_last_byte() {
        let m = mgr();
        let (mut head, rx, _tx) = mock_chain(&m);
        m.push_link(&mut head, 'x', Box::new(LineFramer::new()));
        rx.lock().unwrap().extend(std::iter::repeat(b'a').take(LINE_RING + 10));
        let mut buf = vec![0u8; LINE_RING + 10];
        let n = m.get(&mut head, 0, &mut buf).unwrap();
        assert_eq!(n, LINE_RING - 1);
    }

    #[test]
    fn test_error_tears_down_top_link_only() {
        let m = mgr();
        let (wire, _rx, _tx) = testwire::MockWire::pair();
        let fail = wire.fail.clone();
        let mut head = None;
        m.push_link(&mut head, '\0', Box::new(wire));
        m.push_link(&mut head, 'x', Box::new(LineFramer::new()));
        assert_eq!(m.link_count(), 2);
        *fail.lock().unwrap() = true;
        let mut buf = [0u8; 16];
        assert!(m.get(&mut head, 0, &mut buf).is_err());
        assert_eq!(m.link_count(), 1, "only the framer died");
        assert!(head.is_some(), "head advanced to the raw link");
    }

    #[test]
    fn test_close_destroys_everything() {
        let m = mgr();
        let (mut head, _rx, _tx) = mock_chain(&m);
        m.push_link(&mut head, 'x', Box::new(LineFramer::new()));
        m.close(&mut head, 0);
        assert!(head.is_none());
        assert_eq!(m.link_count(), 0);
    }

    #[test]
    fn test_sticky_chain_adopted_on_rebuild() {
        let m = mgr();
        let token = new_peer_token();
        let mut head = m.create(token);
        let sticky_id = m.push_link(&mut head, 'S', Box::new(LineFramer::new()));
        m.register_sticky(token, sticky_id);
        // peer rebuild: a fresh create for the same token adopts the chain
        let adopted = m.create(token);
        assert_eq!(adopted, Some(sticky_id));
        // a different token gets a fresh raw chain
        let fresh = m.create(new_peer_token());
        assert_ne!(fresh, Some(sticky_id));
    }

    #[test]
    fn test_shrink_pops_top() {
        let m = mgr();
        let (mut head, _rx, tx) = mock_chain(&m);
        m.push_link(&mut head, 'x', Box::new(LineFramer::new()));
        m.shrink(&mut head);
        // the framer is gone: writes now go raw
        m.put(&mut head, 0, b"raw").unwrap();
        assert_eq!(tx.lock().unwrap().as_slice(), b"raw");
    }
}
