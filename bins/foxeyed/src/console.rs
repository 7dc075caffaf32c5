//! Foreground console: a CONSOLE/LOG interface printing to stderr, with
//! a stdin reader feeding lines back into the bus.

use std::io::{BufRead, Write};

use foxeye::core::CoreRef;
use foxeye::dispatcher::{Bus, Flag, Handler, IfaceId, IfaceKind, ReqResult, Request, Signal};

struct ConsoleIface;

impl Handler for ConsoleIface {
    fn handles_requests(&self) -> bool {
        true
    }

    fn request(&mut self, _bus: &mut Bus, _me: IfaceId, req: &Request) -> ReqResult {
        if req.mask.is_empty() {
            return ReqResult::Ok; // idle poll
        }
        let mut err = std::io::stderr().lock();
        let _ = writeln!(err, "{}", req.text_lossy());
        ReqResult::Ok
    }

    fn signal(&mut self, bus: &mut Bus, _me: IfaceId, sig: Signal) -> IfaceKind {
        match sig {
            Signal::Shutdown | Signal::Terminate => {
                if let Some(reason) = bus.shutdown_reason.clone() {
                    let mut err = std::io::stderr().lock();
                    let _ = writeln!(err, "{reason}");
                }
                IfaceKind::DIED
            }
            Signal::Report => IfaceKind::empty(),
            _ => IfaceKind::empty(),
        }
    }
}

/// Register the console interface and start the stdin pump.
pub fn attach(core: &CoreRef) {
    {
        let mut bus = core.bus.lock();
        let id = bus.add(
            IfaceKind::CONSOLE | IfaceKind::LOG | IfaceKind::DIRECT,
            Some("::0"),
            Some(Box::new(ConsoleIface)),
            None,
        );
        bus.set_console(Some(id));
    }
    let bus = core.bus.clone();
    std::thread::Builder::new()
        .name("foxeye-console".into())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                let line = line.trim_end();
                if line.is_empty() {
                    continue;
                }
                bus.add_request(IfaceKind::INIT, "*", Flag::empty(), line);
            }
        })
        .ok();
}
