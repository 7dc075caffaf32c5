//! Connection chains over real loopback sockets.

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use foxeye::chain::{Down, Filter, FilterInit, GrowCtx, Grown};
use foxeye::error::{Error, Result};
use foxeye::peer::{Peer, PeerState, UserFlag};

use crate::common::{accept_pair, test_core};

fn chain_get(
    core: &foxeye::CoreRef,
    peer: &mut Peer,
    buf: &mut [u8],
) -> Result<usize> {
    let idx = peer.socket.unwrap();
    core.chains.get(&mut peer.chain, idx, buf)
}

#[test]
fn test_s1_line_framer_roundtrip() {
    // S1: send "abc\r\ndef\r\n" over a grown 'x' chain; reads yield
    // exactly "abc" then "def" then nothing.
    let core = test_core().handle();
    let (accepted, mut client) = accept_pair(&core);
    let mut peer = Peer::new();
    peer.socket = Some(accepted);
    peer.state = PeerState::Talk;
    assert_eq!(core.chains.grow(&mut peer, 'x', &core), 1);

    client.write_all(b"abc\r\ndef\r\n").unwrap();
    let mut buf = [0u8; 64];
    let mut lines = Vec::new();
    for _ in 0..100 {
        match chain_get(&core, &mut peer, &mut buf) {
            Ok(0) => core.sockets.wait_pass(Duration::from_millis(20)),
            Ok(n) => {
                lines.push(String::from_utf8_lossy(&buf[..n]).into_owned());
                if lines.len() == 2 {
                    break;
                }
            }
            Err(Error::Again) => core.sockets.wait_pass(Duration::from_millis(20)),
            Err(e) => panic!("chain read: {e}"),
        }
    }
    assert_eq!(lines, ["abc", "def"]);
    assert_eq!(chain_get(&core, &mut peer, &mut buf).unwrap_or(0), 0);

    // outbound: the framer appends CRLF on the wire
    let idx = peer.socket.unwrap();
    core.chains.put(&mut peer.chain, idx, b"pong").unwrap();
    let mut wire = [0u8; 16];
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let n = client.read(&mut wire).unwrap();
    assert_eq!(&wire[..n], b"pong\r\n");
}

#[test]
fn test_s2_telnet_doubles_iac_on_wire() {
    // S2: "hi\xff\xff!" through y over x arrives on the wire as
    // "hi\xff\xff\xff\xff!\r\n".
    let core = test_core().handle();
    let (accepted, mut client) = accept_pair(&core);
    let mut peer = Peer::new();
    peer.socket = Some(accepted);
    // telnet under the framer: escapes nearest the socket, one CRLF per line
    assert_eq!(core.chains.grow(&mut peer, 'y', &core), 1);
    assert_eq!(core.chains.grow(&mut peer, 'x', &core), 1);

    let idx = peer.socket.unwrap();
    let mut sent = 0;
    while sent == 0 {
        sent = core.chains.put(&mut peer.chain, idx, b"hi\xff\xff!").unwrap();
        core.sockets.wait_pass(Duration::from_millis(10));
    }
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut wire = Vec::new();
    let mut chunk = [0u8; 32];
    while wire.len() < 9 {
        match client.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => wire.extend_from_slice(&chunk[..n]),
            Err(_) => break,
        }
    }
    assert_eq!(wire.as_slice(), b"hi\xff\xff\xff\xff!\r\n");
}

#[test]
fn test_duplicate_tag_refused() {
    let core = test_core().handle();
    let (accepted, _client) = accept_pair(&core);
    let mut peer = Peer::new();
    peer.socket = Some(accepted);
    assert_eq!(core.chains.grow(&mut peer, 'x', &core), 1);
    assert_eq!(core.chains.grow(&mut peer, 'x', &core), -1);
    assert_eq!(core.chains.check(&mut peer, 'x', &core), -1);
    assert_eq!(core.chains.grow(&mut peer, '?', &core), 0, "unknown tag");
}

#[test]
fn test_check_probes_without_commit() {
    let core = test_core().handle();
    let (accepted, _client) = accept_pair(&core);
    let mut peer = Peer::new();
    peer.socket = Some(accepted);
    core.chains.grow(&mut peer, '\0', &core);
    let links_before = core.chains.link_count();
    assert_eq!(core.chains.check(&mut peer, 'y', &core), 1);
    assert_eq!(core.chains.link_count(), links_before, "check commits nothing");
}

/// A sticky marker filter: passthrough that remembers a session value.
struct StickyMark {
    value: Arc<std::sync::Mutex<u32>>,
}

impl Filter for StickyMark {
    fn send(&mut self, down: &mut Down<'_>, data: &[u8]) -> Result<usize> {
        down.put(data)
    }
    fn ready(&mut self, down: &mut Down<'_>) -> Result<bool> {
        down.ready()
    }
    fn flush(&mut self, down: &mut Down<'_>) -> Result<usize> {
        down.flush()
    }
    fn recv(&mut self, down: &mut Down<'_>, out: &mut [u8]) -> Result<usize> {
        down.get(out)
    }
}

#[test]
fn test_s7_sticky_link_survives_peer_rebuild() {
    // S7 in miniature: a sticky filter keeps its session state across a
    // peer rebuild; the new chain decrypts (here: observes) without a
    // fresh handshake (here: without resetting the marker).
    let core = test_core().handle();
    let session = Arc::new(std::sync::Mutex::new(0u32));
    let marker = session.clone();
    let init: FilterInit = Arc::new(move |ctx: &mut GrowCtx<'_>| {
        if !ctx.test {
            *marker.lock().unwrap() += 1; // "handshake" happened
        }
        Some(Grown { filter: Box::new(StickyMark { value: marker.clone() }), sticky: true })
    });
    core.binds.connchain_grow.add("T", UserFlag::empty(), init);

    let (accepted, _client) = accept_pair(&core);
    let mut peer = Peer::new();
    peer.socket = Some(accepted);
    assert_eq!(core.chains.grow(&mut peer, 'T', &core), 1);
    assert_eq!(*session.lock().unwrap(), 1, "one handshake on first grow");
    let token = peer.token;
    let old_head = peer.chain;

    // the peer's socket dies; the chain is NOT killed, only dropped
    core.sockets.kill(accepted);

    // rebuild: a fresh peer carries the token and gets a new socket
    let (accepted2, _client2) = accept_pair(&core);
    let mut peer2 = Peer::new();
    peer2.token = token;
    peer2.socket = Some(accepted2);
    assert_eq!(core.chains.grow(&mut peer2, '\0', &core), 1);
    assert_eq!(peer2.chain, old_head, "sticky chain adopted");
    assert_eq!(*session.lock().unwrap(), 1, "no renegotiation on rebuild");

    // a second sticky grow on the same peer is refused (duplicate tag)
    assert_eq!(core.chains.grow(&mut peer2, 'T', &core), -1);

    // full teardown clears the sticky registration: a later peer with the
    // same token starts fresh and negotiates a new session
    peer2.kill_chain(&core.chains);
    let (accepted3, _client3) = accept_pair(&core);
    let mut peer3 = Peer::new();
    peer3.token = token;
    peer3.socket = Some(accepted3);
    assert_eq!(core.chains.grow(&mut peer3, 'T', &core), 1);
    assert_eq!(*session.lock().unwrap(), 2, "fresh handshake after teardown");
}

#[test]
fn test_zlib_across_loopback() {
    // both ends of the same wire, one compressing, one inflating
    let core = test_core().handle();
    let (server, client) = crate::common::slot_pair(&core);
    let mut tx_peer = Peer::new();
    tx_peer.socket = Some(server);
    assert_eq!(core.chains.grow(&mut tx_peer, 'Z', &core), 1);
    let mut rx_peer = Peer::new();
    rx_peer.socket = Some(client);
    assert_eq!(core.chains.grow(&mut rx_peer, 'Z', &core), 1);

    let payload = b"compressed hello across the wire";
    let idx = tx_peer.socket.unwrap();
    let mut sent = 0;
    while sent == 0 {
        sent = core.chains.put(&mut tx_peer.chain, idx, payload).unwrap();
    }
    let mut buf = [0u8; 128];
    let mut got = Vec::new();
    for _ in 0..200 {
        match chain_get(&core, &mut rx_peer, &mut buf) {
            Ok(0) | Err(Error::Again) => core.sockets.wait_pass(Duration::from_millis(10)),
            Ok(n) => {
                got.extend_from_slice(&buf[..n]);
                if got.len() >= payload.len() {
                    break;
                }
            }
            Err(e) => panic!("inflate side: {e}"),
        }
    }
    assert_eq!(got.as_slice(), payload);
}
