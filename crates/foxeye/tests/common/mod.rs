//! Shared helpers for integration tests.

use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use foxeye::config::Settings;
use foxeye::core::{Core, CoreRef};
use foxeye::error::Error;
use foxeye::peer::UserFlag;
use foxeye::session::Listfile;
use foxeye::socket::{SockIdx, SockKind};

/// Core over default settings and the open listfile.
pub fn test_core() -> Core {
    Core::new(Arc::new(Settings::with_core_defaults()), None)
}

/// Core whose listfile knows one user with a plain password.
pub fn test_core_with_user(lname: &str, pass: &str) -> Core {
    let lf: Arc<dyn Listfile> =
        Arc::new(OneUser { lname: lname.to_owned(), pass: pass.to_owned() });
    Core::new(Arc::new(Settings::with_core_defaults()), Some(lf))
}

pub struct OneUser {
    lname: String,
    pass: String,
}

impl Listfile for OneUser {
    fn match_client(&self, _host: &str, _ident: &str, lname: Option<&str>) -> UserFlag {
        match lname {
            Some(l) if l == self.lname => UserFlag::ACCESS | UserFlag::FRIEND,
            _ => UserFlag::ACCESS,
        }
    }
    fn passwd(&self, lname: &str) -> Option<String> {
        (lname == self.lname).then(|| self.pass.clone())
    }
    fn charset(&self, _lname: &str) -> Option<String> {
        None
    }
    fn canonical(&self, lname: &str) -> Option<String> {
        Some(lname.to_owned())
    }
}

/// A loopback listener plus a std client stream; the accepted side lives
/// in the core's socket table.
pub fn accept_pair(core: &CoreRef) -> (SockIdx, TcpStream) {
    let listen = core.sockets.get(SockKind::Listen).expect("listen slot");
    core.sockets
        .setup(listen, Some("127.0.0.1"), None, 0, None)
        .expect("bind loopback");
    let (_, port) = core.sockets.domain(listen);
    let client = TcpStream::connect(("127.0.0.1", port)).expect("client connect");
    let accepted = wait_answer(core, listen);
    core.sockets.kill(listen);
    (accepted, client)
}

/// Two connected slots inside the same socket table.
pub fn slot_pair(core: &CoreRef) -> (SockIdx, SockIdx) {
    let listen = core.sockets.get(SockKind::Listen).expect("listen slot");
    core.sockets
        .setup(listen, Some("127.0.0.1"), None, 0, None)
        .expect("bind loopback");
    let (_, port) = core.sockets.domain(listen);
    let connector = core.sockets.get(SockKind::Raw).expect("raw slot");
    core.sockets
        .setup(connector, Some("127.0.0.1"), None, port, None)
        .expect("loopback connect");
    let accepted = wait_answer(core, listen);
    core.sockets.kill(listen);
    (accepted, connector)
}

pub fn wait_answer(core: &CoreRef, listen: SockIdx) -> SockIdx {
    for _ in 0..200 {
        match core.sockets.answer(listen) {
            Ok(idx) => return idx,
            Err(Error::Again) => core.sockets.wait_pass(Duration::from_millis(25)),
            Err(e) => panic!("answer failed: {e}"),
        }
    }
    panic!("no connection accepted");
}

/// Drive the scheduler until `cond` holds or the retries run out.
pub fn pump_until(core: &Core, mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        core.run_pass();
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}
