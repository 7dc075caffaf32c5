//! DCC transfer loops end to end over loopback sockets.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use foxeye::dcc::{recv::recv_file, send::send_file, DccPriv, TransferDoneFn};
use foxeye::peer::PeerState;
use foxeye::socket::SockIdx;

use crate::common::{slot_pair, test_core};

fn transfer_priv(uh: &str, path: &std::path::Path, size: u64, socket: SockIdx) -> DccPriv {
    let mut p = DccPriv::new(uh);
    p.filename = Some(path.to_owned());
    p.size = size;
    p.socket = Some(socket);
    p.state = PeerState::Talk;
    p
}

fn temp_file(name: &str, content: &[u8]) -> std::path::PathBuf {
    let p = std::env::temp_dir().join(format!("foxeye-test-{}-{name}", std::process::id()));
    std::fs::write(&p, content).unwrap();
    p
}

fn temp_path(name: &str) -> std::path::PathBuf {
    let p = std::env::temp_dir().join(format!("foxeye-test-{}-{name}", std::process::id()));
    let _ = std::fs::remove_file(&p);
    p
}

#[test]
fn test_s3_send_and_receive_small_file() {
    // S3: a 3-byte file crosses the wire; the receiver ACKs the
    // cumulative count and the dcc-got bindtable fires exactly once.
    let core = test_core();
    let r = core.handle();
    let got_fired = Arc::new(AtomicUsize::new(0));
    let hook_fired = got_fired.clone();
    let hook: TransferDoneFn = Arc::new(move |_core, _uh, _path| {
        hook_fired.fetch_add(1, Ordering::SeqCst);
    });
    r.binds.dcc_got.add("*", foxeye::peer::UserFlag::empty(), hook);

    let (sender_sock, receiver_sock) = slot_pair(&r);
    let src = temp_file("send-src", b"abc");
    let dst = temp_path("send-dst");

    let tx = Arc::new(std::sync::Mutex::new(transfer_priv("peer@net", &src, 3, sender_sock)));
    let rx = Arc::new(std::sync::Mutex::new(transfer_priv("peer@net", &dst, 3, receiver_sock)));

    let r2 = r.clone();
    let tx2 = tx.clone();
    let sender = std::thread::spawn(move || send_file(&r2, &tx2));
    let r3 = r.clone();
    let rx2 = rx.clone();
    let receiver = std::thread::spawn(move || recv_file(&r3, &rx2));
    sender.join().unwrap();
    receiver.join().unwrap();

    assert_eq!(std::fs::read(&dst).unwrap(), b"abc");
    assert_eq!(got_fired.load(Ordering::SeqCst), 1, "dcc-got fired exactly once");
    assert_eq!(tx.lock().unwrap().state, PeerState::LastWait);
    assert_eq!(rx.lock().unwrap().state, PeerState::LastWait);
    let _ = std::fs::remove_file(src);
    let _ = std::fs::remove_file(dst);
}

#[test]
fn test_s5_resume_transfers_the_tail() {
    // S5: the receiver already has 100 bytes of a 500-byte file; after
    // the resume handshake committed offset 100, only the tail flows and
    // the final file is 500 bytes.
    let core = test_core();
    let r = core.handle();
    let full: Vec<u8> = (0..500u32).map(|i| (i % 251) as u8).collect();
    let src = temp_file("resume-src", &full);
    let dst = temp_file("resume-dst", &full[..100]);

    let (sender_sock, receiver_sock) = slot_pair(&r);
    let mut txp = transfer_priv("peer@net", &src, 500, sender_sock);
    txp.startptr = 100; // ACCEPT committed on both sides
    let mut rxp = transfer_priv("peer@net", &dst, 500, receiver_sock);
    rxp.startptr = 100;
    let tx = Arc::new(std::sync::Mutex::new(txp));
    let rx = Arc::new(std::sync::Mutex::new(rxp));

    let r2 = r.clone();
    let tx2 = tx.clone();
    let sender = std::thread::spawn(move || send_file(&r2, &tx2));
    let r3 = r.clone();
    let rx2 = rx.clone();
    let receiver = std::thread::spawn(move || recv_file(&r3, &rx2));
    sender.join().unwrap();
    receiver.join().unwrap();

    let result = std::fs::read(&dst).unwrap();
    assert_eq!(result.len(), 500);
    assert_eq!(result, full, "resumed file is bit-identical");
    // bytes moved this session = size - resume offset
    assert_eq!(rx.lock().unwrap().ptr, 400);
    let _ = std::fs::remove_file(src);
    let _ = std::fs::remove_file(dst);
}

#[test]
fn test_short_transfer_keeps_partial_file() {
    // the sender dies mid-file: the partial file stays on disk and the
    // completion hook does not fire
    let core = test_core();
    let r = core.handle();
    let fired = Arc::new(AtomicUsize::new(0));
    let hook_fired = fired.clone();
    let hook: TransferDoneFn = Arc::new(move |_c, _u, _p| {
        hook_fired.fetch_add(1, Ordering::SeqCst);
    });
    r.binds.dcc_got.add("*", foxeye::peer::UserFlag::empty(), hook);

    let (sender_sock, receiver_sock) = slot_pair(&r);
    let dst = temp_path("short-dst");
    // receiver expects 1000 bytes but the "sender" writes 10 and hangs up
    let rx = Arc::new(std::sync::Mutex::new(transfer_priv("peer@net", &dst, 1000, receiver_sock)));
    let r2 = r.clone();
    let writer = std::thread::spawn(move || {
        let buf = [7u8; 10];
        let mut ptr = 0;
        let mut len = buf.len();
        while len > 0 {
            r2.sockets.write(sender_sock, &buf, &mut ptr, &mut len).unwrap();
        }
        r2.sockets.kill(sender_sock);
    });
    let r3 = r.clone();
    let rx2 = rx.clone();
    let receiver = std::thread::spawn(move || recv_file(&r3, &rx2));
    writer.join().unwrap();
    receiver.join().unwrap();

    assert_eq!(std::fs::read(&dst).unwrap(), vec![7u8; 10], "partial kept");
    assert_eq!(fired.load(Ordering::SeqCst), 0, "no completion hook");
    let _ = std::fs::remove_file(dst);
}
