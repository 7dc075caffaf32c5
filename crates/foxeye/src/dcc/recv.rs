//! DCC file receiver: writes the stream, ACKs cumulative offsets, and can
//! ack ahead to keep the pipe full.
//!
//! While a resume confirmation is still outstanding the payload goes to a
//! temp file; once the `ACCEPT` offset is known the buffered bytes are
//! committed into the real file at that offset. A transfer that ends
//! short keeps the partial file and logs the error.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::time::Duration;

use tracing::{debug, error};
use zerocopy::byteorder::{BigEndian, U32};
use zerocopy::IntoBytes;

use crate::core::CoreRef;
use crate::dispatcher::{Flag, IfaceKind};
use crate::error::Error;
use crate::peer::PeerState;

use super::{now, DccRef, MAX_BLOCK};

fn send_ack(core: &CoreRef, socket: crate::socket::SockIdx, value: u64) -> bool {
    let v = U32::<BigEndian>::new(value as u32);
    let buf = v.as_bytes();
    let mut off = 0usize;
    let mut len = buf.len();
    while len > 0 {
        match core.sockets.write(socket, buf, &mut off, &mut len) {
            Ok(0) => core.sockets.wait_pass(Duration::from_millis(50)),
            Ok(_) => {}
            Err(_) => return false,
        }
    }
    true
}

/// Blocking receive loop for a connected incoming send. Runs in the
/// worker that owns the connection.
pub fn recv_file(core: &CoreRef, dcc: &DccRef) {
    let (path, size, wait_accept, startptr, ahead, socket, iface, uh, lname) = {
        let mut d = dcc.lock().unwrap();
        d.ptr = 0;
        d.state = PeerState::Talk;
        (
            d.filename.clone(),
            d.size,
            d.wait_accept,
            d.startptr,
            d.ahead,
            d.socket,
            d.iface,
            d.uh.clone(),
            d.lname.clone(),
        )
    };
    let (Some(path), Some(socket)) = (path, socket) else {
        finish(core, dcc, iface);
        return;
    };
    // a pending resume buffers into a temp file until ACCEPT resolves
    let tmp_path = wait_accept.then(|| {
        std::env::temp_dir().join(format!("foxeye-dcc-{}.part", dcc.lock().unwrap().token.unwrap_or(0)))
    });
    let file = match &tmp_path {
        Some(t) => File::create(t),
        None => OpenOptions::new().write(true).create(true).open(&path).and_then(|mut f| {
            f.seek(SeekFrom::Start(startptr)).map(|_| f)
        }),
    };
    let mut file = match file {
        Ok(f) => f,
        Err(e) => {
            error!("DCC GET: cannot open local file to download there: {e}.");
            core.sockets.kill(socket);
            finish(core, dcc, iface);
            return;
        }
    };
    core.bus.add_request(
        IfaceKind::LOG,
        "*",
        Flag::CONN,
        &format!("Getting file \"{}\" from {}.", path.display(), uh),
    );
    let to_get = size.saturating_sub(startptr);
    let mut buf = vec![0u8; MAX_BLOCK as usize];
    let mut ptr: u64 = 0; // received this session
    let mut aptr: u64 = 0; // highest offset acked
    let mut last_block: usize = 0;
    let mut stable_block: u64 = 0; // two consecutive equal reads fix it
    let mut ahead_sent: u64 = 0;
    let mut failed = false;

    loop {
        {
            let mut d = dcc.lock().unwrap();
            d.ptr = ptr;
        }
        match core.sockets.read(socket, &mut buf) {
            Ok(0) | Err(Error::Again) => {
                // idle: maybe ack ahead to keep the sender busy
                if stable_block != 0 && ahead_sent < ahead {
                    let next = aptr + stable_block;
                    if next < to_get {
                        ahead_sent += 1;
                        aptr = next;
                        debug!(aptr, "DCC GET {}: ack ahead", path.display());
                        if !send_ack(core, socket, aptr) {
                            failed = true;
                            break;
                        }
                    }
                }
                core.sockets.wait_pass(Duration::from_millis(50));
                continue;
            }
            Ok(n) => {
                if file.write_all(&buf[..n]).is_err() {
                    failed = true;
                    break;
                }
                if stable_block == 0 {
                    if last_block == n {
                        stable_block = n as u64;
                    }
                    last_block = n;
                }
                ptr += n as u64;
                {
                    let mut d = dcc.lock().unwrap();
                    d.rate.add(now(), n as u64);
                }
                debug!(got = n, total = ptr, "DCC GET {}", path.display());
                if ahead_sent > 0 && ptr <= aptr {
                    ahead_sent = ahead_sent.saturating_sub(1);
                }
                if ptr < aptr {
                    continue; // still inside the acked-ahead window
                }
                ahead_sent = 0;
                aptr = ptr;
                if !send_ack(core, socket, ptr) {
                    failed = true;
                    break;
                }
                if size > 0 && ptr >= to_get {
                    break; // got everything offered
                }
            }
            Err(Error::Eof) => break,
            Err(_) => {
                failed = true;
                break;
            }
        }
    }

    // commit the temp buffer when a resume offset arrived mid-transfer
    let committed_offset = {
        let mut d = dcc.lock().unwrap();
        let off = if wait_accept && d.startptr > 0 { Some(d.startptr) } else { None };
        // from now on any ACCEPT is too late
        if wait_accept {
            d.startptr = 1;
        }
        off
    };
    if let Some(t) = &tmp_path {
        let off = committed_offset.unwrap_or(0);
        let copied = (|| -> std::io::Result<()> {
            let mut real = OpenOptions::new().write(true).create(true).open(&path)?;
            real.seek(SeekFrom::Start(off))?;
            file.flush()?;
            let mut tmp = File::open(t)?;
            std::io::copy(&mut tmp, &mut real)?;
            Ok(())
        })();
        if copied.is_err() {
            error!("DCC GET: error on saving file {}.", path.display());
            failed = true;
        }
        let _ = std::fs::remove_file(t);
    }

    let complete = !failed && (size == 0 || ptr >= to_get);
    if complete {
        core.bus.add_request(
            IfaceKind::LOG,
            "*",
            Flag::CONN,
            &format!("Got file \"{}\" from {}.", path.display(), uh),
        );
        super::run_done_table(core, &core.binds.dcc_got, &lname, &uh, &path);
    } else if ptr > to_get {
        core.bus.add_request(
            IfaceKind::LOG,
            "*",
            Flag::CONN,
            &format!(
                "Got file \"{}\" from {}: {} bytes instead of {}.",
                path.display(),
                uh,
                ptr,
                to_get
            ),
        );
    } else {
        core.bus.add_request(
            IfaceKind::LOG,
            "*",
            Flag::CONN,
            &format!(
                "Got incomplete file \"{}\" from {}: {}/{} bytes.",
                path.display(),
                uh,
                ptr,
                to_get
            ),
        );
    }
    core.sockets.kill(socket);
    dcc.lock().unwrap().socket = None;
    finish(core, dcc, iface);
}

fn finish(core: &CoreRef, dcc: &DccRef, iface: Option<crate::dispatcher::IfaceId>) {
    dcc.lock().unwrap().state = PeerState::LastWait;
    if let Some(ifc) = iface {
        core.bus.raise(ifc, IfaceKind::FINWAIT);
    }
}
