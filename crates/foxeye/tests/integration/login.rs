//! The telnet login flow against a scripted client.

use std::io::{Read, Write};
use std::time::Duration;

use foxeye::dispatcher::IfaceKind;
use foxeye::listener::AcceptCtx;
use foxeye::session::session_handler;

use crate::common::{accept_pair, pump_until, test_core_with_user};

fn read_until(client: &mut std::net::TcpStream, needle: &[u8]) -> Vec<u8> {
    let mut got = Vec::new();
    let mut chunk = [0u8; 256];
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    while !got
        .windows(needle.len())
        .any(|w| w == needle)
    {
        match client.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => got.extend_from_slice(&chunk[..n]),
            Err(_) => break,
        }
    }
    got
}

#[test]
fn test_telnet_login_creates_session() {
    let core = test_core_with_user("joe", "sesame");
    let r = core.handle();
    let (accepted, mut client) = accept_pair(&r);
    let r2 = r.clone();
    let worker = std::thread::spawn(move || {
        session_handler(
            AcceptCtx {
                core: r2,
                client: None,
                ident: "joe".into(),
                host: "localhost".into(),
                port: 12345,
                socket: accepted,
            },
            false,
        );
    });
    let greeting = read_until(&mut client, b"login: ");
    assert!(
        String::from_utf8_lossy(&greeting).contains("FoxEye network node"),
        "greeting shown"
    );
    client.write_all(b"joe\r\n").unwrap();
    let prompt = read_until(&mut client, b"Password: ");
    assert!(String::from_utf8_lossy(&prompt).contains("Password: "));
    // telnet peers get echo hidden for the password
    let echoed = read_until(&mut client, &[0xff, 0xfb, 0x01]);
    assert!(echoed.windows(3).any(|w| w == [0xff, 0xfb, 0x01]) || echoed.is_empty());
    client.write_all(b"sesame\r\n").unwrap();
    worker.join().unwrap();

    assert!(
        pump_until(&core, || r.bus.lock().find_id(IfaceKind::DIRECT, Some("joe")).is_some()),
        "session interface registered"
    );
}

#[test]
fn test_wrong_password_refused() {
    let core = test_core_with_user("joe", "sesame");
    let r = core.handle();
    let (accepted, mut client) = accept_pair(&r);
    let r2 = r.clone();
    let worker = std::thread::spawn(move || {
        session_handler(
            AcceptCtx {
                core: r2,
                client: None,
                ident: "joe".into(),
                host: "localhost".into(),
                port: 12345,
                socket: accepted,
            },
            false,
        );
    });
    read_until(&mut client, b"login: ");
    client.write_all(b"joe\r\n").unwrap();
    read_until(&mut client, b"Password: ");
    client.write_all(b"wrong\r\n").unwrap();
    worker.join().unwrap();
    assert!(r.bus.lock().find_id(IfaceKind::DIRECT, Some("joe")).is_none());
}

#[test]
fn test_unknown_user_has_no_password() {
    // a user the listfile has no password for cannot log in
    let core = test_core_with_user("joe", "sesame");
    let r = core.handle();
    let (accepted, mut client) = accept_pair(&r);
    let r2 = r.clone();
    let worker = std::thread::spawn(move || {
        session_handler(
            AcceptCtx {
                core: r2,
                client: None,
                ident: "x".into(),
                host: "localhost".into(),
                port: 1,
                socket: accepted,
            },
            false,
        );
    });
    read_until(&mut client, b"login: ");
    client.write_all(b"stranger\r\n").unwrap();
    let denial = read_until(&mut client, b"Access denied");
    worker.join().unwrap();
    assert!(String::from_utf8_lossy(&denial).contains("Access denied"));
    assert!(r.bus.lock().find_id(IfaceKind::DIRECT, Some("stranger")).is_none());
}
