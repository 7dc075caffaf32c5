//! DCC file sender: bounded ahead-window streaming.
//!
//! The sender may put up to `ahead` blocks on the wire beyond the
//! receiver's cumulative ACK; each ACK is a 4-byte big-endian counter of
//! bytes the receiver has. An ACK running backwards or ahead of what was
//! sent ends the transfer.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::time::Duration;

use tracing::{debug, error};
use zerocopy::byteorder::{BigEndian, U32};
use zerocopy::FromBytes;

use crate::core::CoreRef;
use crate::dispatcher::{Flag, IfaceKind};
use crate::error::Error;
use crate::peer::PeerState;

use super::{block_setting, now, DccRef};

/// Accumulates the 4-byte ACK counters, tolerating split reads.
pub struct AckReader {
    buf: [u8; 4],
    have: usize,
}

impl AckReader {
    pub fn new() -> AckReader {
        AckReader { buf: [0; 4], have: 0 }
    }

    /// Feed raw bytes; returns each completed counter.
    pub fn feed(&mut self, mut data: &[u8]) -> Vec<u64> {
        let mut out = Vec::new();
        while !data.is_empty() {
            let take = (4 - self.have).min(data.len());
            self.buf[self.have..self.have + take].copy_from_slice(&data[..take]);
            self.have += take;
            data = &data[take..];
            if self.have == 4 {
                let v = U32::<BigEndian>::read_from_bytes(&self.buf).unwrap();
                out.push(u64::from(v.get()));
                self.have = 0;
            }
        }
        out
    }
}

impl Default for AckReader {
    fn default() -> Self {
        AckReader::new()
    }
}

/// Blocking transfer loop for a connected outgoing send. Runs in the
/// worker that owns the connection; finishes by flagging the session
/// interface for reaping.
pub fn send_file(core: &CoreRef, dcc: &DccRef) {
    let (path, size, startptr, ahead, socket, iface, uh, lname) = {
        let mut d = dcc.lock().unwrap();
        d.ptr = 0;
        d.state = PeerState::Talk;
        (
            d.filename.clone(),
            d.size,
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
    let mut file = match File::open(&path) {
        Ok(f) => f,
        Err(e) => {
            error!("DCC SEND: cannot open file {}: {e}.", path.display());
            core.sockets.kill(socket);
            finish(core, dcc, iface);
            return;
        }
    };
    let bs = block_setting(core);
    if file.seek(SeekFrom::Start(startptr)).is_err() {
        core.sockets.kill(socket);
        finish(core, dcc, iface);
        return;
    }
    let to_send = size.saturating_sub(startptr);
    let ahead_bytes = ahead * bs;
    let mut acks = AckReader::new();
    let mut ptr: u64 = 0; // sent this session
    let mut aptr: u64 = 0; // acked this session
    let mut block = vec![0u8; bs as usize];
    let mut ackbuf = [0u8; 64];
    let mut failed = false;
    let mut at_eof = false;

    loop {
        {
            let mut d = dcc.lock().unwrap();
            d.ptr = ptr;
        }
        // pick up any ACKs
        match core.sockets.read(socket, &mut ackbuf) {
            Ok(0) | Err(Error::Again) => {}
            Ok(n) => {
                let mut latest = None;
                for v in acks.feed(&ackbuf[..n]) {
                    latest = Some(v);
                }
                if let Some(v) = latest {
                    debug!(ack = v, "DCC SEND {}: got ack", path.display());
                    if v < aptr || v > ptr {
                        failed = true; // wrong ack
                        break;
                    }
                    aptr = v;
                }
            }
            Err(_) => {
                failed = ptr < to_send || aptr < to_send;
                break;
            }
        }
        if aptr >= to_send {
            break; // everything delivered and confirmed
        }
        if ptr >= to_send {
            at_eof = true;
        }
        if at_eof || aptr + ahead_bytes < ptr {
            // window exhausted (or file done): wait for acks to catch up
            core.sockets.wait_pass(Duration::from_millis(50));
            continue;
        }
        let want = (bs.min(to_send - ptr)) as usize;
        let got = match file.read(&mut block[..want]) {
            Ok(0) => {
                at_eof = true;
                continue;
            }
            Ok(n) => n,
            Err(_) => {
                failed = true;
                break;
            }
        };
        let mut off = 0usize;
        let mut len = got;
        while len > 0 {
            match core.sockets.write(socket, &block[..got], &mut off, &mut len) {
                Ok(0) => core.sockets.wait_pass(Duration::from_millis(50)),
                Ok(_) => {}
                Err(_) => {
                    failed = true;
                    break;
                }
            }
        }
        if failed {
            break;
        }
        ptr += got as u64;
        {
            let mut d = dcc.lock().unwrap();
            let t = now();
            d.rate.add(t, got as u64);
            d.ptr = ptr;
        }
        debug!(sent = got, total = ptr, "DCC SEND {}", path.display());
    }

    if !failed && ptr >= to_send {
        core.bus.add_request(
            IfaceKind::LOG,
            "*",
            Flag::CONN,
            &format!("File \"{}\" sent to {}.", path.display(), uh),
        );
        super::run_done_table(core, &core.binds.dcc_sent, &lname, &uh, &path);
    } else {
        error!(
            "DCC SEND {} failed: sent {} out from {} bytes.",
            path.display(),
            ptr,
            to_send
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

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::IntoBytes;

    #[test]
    fn test_ack_reader_whole() {
        let mut r = AckReader::new();
        assert_eq!(r.feed(&[0, 0, 0, 3]), vec![3]);
        assert_eq!(r.feed(&[0, 0, 1, 0]), vec![256]);
    }

    #[test]
    fn test_ack_reader_split() {
        let mut r = AckReader::new();
        assert!(r.feed(&[0, 0]).is_empty());
        assert_eq!(r.feed(&[0, 5, 0, 0]).len(), 1);
        assert_eq!(r.feed(&[0, 6]), vec![6]);
    }

    #[test]
    fn test_ack_reader_multiple_in_one_read() {
        let mut r = AckReader::new();
        let acks = r.feed(&[0, 0, 0, 1, 0, 0, 0, 2]);
        assert_eq!(acks, vec![1, 2]);
    }

    #[test]
    fn test_ack_wire_format_is_big_endian() {
        let v = U32::<BigEndian>::new(3);
        assert_eq!(v.as_bytes(), &[0, 0, 0, 3]);
    }
}
