//! Filter `y`: RFC 854 telnet byte-stream processing.
//!
//! Inbound: `IAC IAC` collapses to a literal 0xFF, option negotiation is
//! answered with refusals (`DON'T` to `WILL`, `WON'T` to `DO`) except ECHO
//! which is stripped silently, and `AYT` gets `Y\r\n`. Replies queue in a
//! small side buffer and ride out ahead of user data.
//!
//! Outbound: literal 0xFF is doubled; our own `IAC <neg> ECHO` sequences
//! pass through verbatim, and everything after an outgoing `IAC WILL
//! ECHO` is suppressed until the next write (echo management quirk kept
//! as-is; a diagnostic fires when that tail is non-empty).

use std::sync::Arc;

use tracing::debug;

use crate::chain::{Down, Filter, FilterInit, GrowCtx, Grown};
use crate::core::CoreRef;
use crate::error::Result;
use crate::peer::UserFlag;

const IAC: u8 = 255;
const WILL: u8 = 251;
const WONT: u8 = 252;
const DO: u8 = 253;
const DONT: u8 = 254;
const AYT: u8 = 246;
const OPT_ECHO: u8 = 1;

/// Side buffer capacity for queued replies.
const REPLY_CAP: usize = 24;

pub struct TelnetFilter {
    tosend: Vec<u8>,
}

impl TelnetFilter {
    pub fn new() -> TelnetFilter {
        TelnetFilter { tosend: Vec::with_capacity(REPLY_CAP) }
    }

    fn queue_reply(&mut self, bytes: &[u8]) {
        if self.tosend.len() + bytes.len() <= REPLY_CAP {
            self.tosend.extend_from_slice(bytes);
        }
    }

    fn push_replies(&mut self, down: &mut Down<'_>) -> Result<bool> {
        while !self.tosend.is_empty() {
            let n = down.put(&self.tosend)?;
            if n == 0 {
                return Ok(false);
            }
            self.tosend.drain(..n);
        }
        Ok(true)
    }

    /// Strip telnet protocol from `input`, writing cleaned bytes into
    /// `out` and queueing replies. Returns cleaned length.
    fn process_input(&mut self, input: &[u8], out: &mut Vec<u8>) {
        let mut i = 0;
        while i < input.len() {
            let b = input[i];
            if b != IAC {
                out.push(b);
                i += 1;
                continue;
            }
            if i + 1 >= input.len() {
                break; // bogus trailing IAC
            }
            let cmd = input[i + 1];
            match cmd {
                IAC => {
                    out.push(IAC);
                    i += 2;
                }
                WILL | WONT | DO | DONT => {
                    if i + 2 >= input.len() {
                        break; // bogus
                    }
                    let opt = input[i + 2];
                    if opt == OPT_ECHO {
                        // ECHO negotiation is always swallowed
                    } else if cmd == WILL {
                        self.queue_reply(&[IAC, DONT, opt]);
                    } else if cmd == DO {
                        self.queue_reply(&[IAC, WONT, opt]);
                    }
                    i += 3;
                }
                AYT => {
                    self.queue_reply(b"Y\r\n");
                    i += 2;
                }
                _ => {
                    i += 2; // unknown command, drop it
                }
            }
        }
    }
}

impl Default for TelnetFilter {
    fn default() -> Self {
        TelnetFilter::new()
    }
}

impl Filter for TelnetFilter {
    fn send(&mut self, down: &mut Down<'_>, data: &[u8]) -> Result<usize> {
        if !down.ready()? {
            return Ok(0);
        }
        if !self.push_replies(down)? {
            return Ok(0);
        }
        let mut sent_total = 0;
        let mut i = 0;
        while i < data.len() {
            let rest = &data[i..];
            let iac_at = rest.iter().position(|&b| b == IAC);
            match iac_at {
                None => {
                    let n = down.put(rest)?;
                    sent_total += n;
                    i += n;
                    if n < rest.len() {
                        break;
                    }
                }
                Some(p) => {
                    if p > 0 {
                        let n = down.put(&rest[..p])?;
                        sent_total += n;
                        i += n;
                        if n < p {
                            break;
                        }
                        continue;
                    }
                    // rest starts with IAC
                    if rest.len() >= 3 && (WILL..=DONT).contains(&rest[1]) && rest[2] == OPT_ECHO {
                        // echo management sequence goes out verbatim
                        let n = down.put(&rest[..3])?;
                        sent_total += n;
                        i += n;
                        if n < 3 {
                            break;
                        }
                        if rest[1] == WILL {
                            // far echo disabled: suppress the rest of this
                            // buffer, reporting it consumed
                            if rest.len() > 3 {
                                debug!(
                                    dropped = rest.len() - 3,
                                    "telnet: tail after IAC WILL ECHO suppressed"
                                );
                            }
                            return Ok(data.len());
                        }
                        continue;
                    }
                    // literal 0xFF in user data: double it
                    let n = down.put(&[IAC, IAC])?;
                    if n < 2 {
                        break;
                    }
                    sent_total += 1;
                    i += 1;
                }
            }
        }
        Ok(sent_total.min(data.len()))
    }

    fn ready(&mut self, down: &mut Down<'_>) -> Result<bool> {
        if !down.ready()? {
            return Ok(false);
        }
        self.push_replies(down)
    }

    fn flush(&mut self, down: &mut Down<'_>) -> Result<usize> {
        if !self.push_replies(down)? {
            return Ok(0);
        }
        down.flush()
    }

    fn recv(&mut self, down: &mut Down<'_>, out: &mut [u8]) -> Result<usize> {
        let mut raw = vec![0u8; out.len()];
        let n = down.get(&mut raw)?;
        if n == 0 {
            return Ok(0);
        }
        let mut cleaned = Vec::with_capacity(n);
        self.process_input(&raw[..n], &mut cleaned);
        let m = cleaned.len().min(out.len());
        out[..m].copy_from_slice(&cleaned[..m]);
        Ok(m)
    }
}

/// Register the stock `y` filter.
pub fn register(core: &CoreRef) {
    let init: FilterInit = Arc::new(|_ctx: &mut GrowCtx<'_>| {
        Some(Grown { filter: Box::new(TelnetFilter::new()), sticky: false })
    });
    core.binds.connchain_grow.add("y", UserFlag::empty(), init);
}

/// `IAC WONT ECHO`, pushed by the login flow to restore local echo after
/// password entry.
pub const WONT_ECHO: &[u8] = &[IAC, WONT, OPT_ECHO];
/// `IAC WILL ECHO`, pushed by the login flow to hide password input.
pub const WILL_ECHO: &[u8] = &[IAC, WILL, OPT_ECHO];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::testwire::mock_chain;
    use crate::chain::{ChainMgr, LineFramer};
    use crate::socket::SocketSet;

    fn mgr() -> std::sync::Arc<ChainMgr> {
        ChainMgr::new(SocketSet::new(false))
    }

    #[test]
    fn test_iac_doubling_on_send() {
        // "hi\xff\xff!" through the framer over telnet lands on the wire
        // as "hi\xff\xff\xff\xff!\r\n": one CRLF per line, IACs doubled
        let m = mgr();
        let (mut head, _rx, tx) = mock_chain(&m);
        m.push_link(&mut head, 'y', Box::new(TelnetFilter::new()));
        m.push_link(&mut head, 'x', Box::new(LineFramer::new()));
        let n = m.put(&mut head, 0, b"hi\xff\xff!").unwrap();
        assert_eq!(n, 5);
        assert_eq!(tx.lock().unwrap().as_slice(), b"hi\xff\xff\xff\xff!\r\n");
    }

    #[test]
    fn test_iac_iac_is_literal_ff_inbound() {
        let m = mgr();
        let (mut head, rx, _tx) = mock_chain(&m);
        m.push_link(&mut head, 'y', Box::new(TelnetFilter::new()));
        rx.lock().unwrap().extend(b"a\xff\xffb");
        let mut buf = [0u8; 16];
        let n = m.get(&mut head, 0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"a\xffb");
    }

    #[test]
    fn test_will_answered_with_dont() {
        let m = mgr();
        let (mut head, rx, tx) = mock_chain(&m);
        m.push_link(&mut head, 'y', Box::new(TelnetFilter::new()));
        // IAC WILL <32>
        rx.lock().unwrap().extend([IAC, WILL, 32u8]);
        let mut buf = [0u8; 16];
        let n = m.get(&mut head, 0, &mut buf).unwrap();
        assert_eq!(n, 0, "negotiation is invisible to the application");
        // reply rides out on the next write probe
        m.ready(&mut head, 0).unwrap();
        assert_eq!(tx.lock().unwrap().as_slice(), &[IAC, DONT, 32u8]);
    }

    #[test]
    fn test_do_answered_with_wont() {
        let m = mgr();
        let (mut head, rx, tx) = mock_chain(&m);
        m.push_link(&mut head, 'y', Box::new(TelnetFilter::new()));
        rx.lock().unwrap().extend([IAC, DO, 31u8]);
        let mut buf = [0u8; 16];
        m.get(&mut head, 0, &mut buf).unwrap();
        m.ready(&mut head, 0).unwrap();
        assert_eq!(tx.lock().unwrap().as_slice(), &[IAC, WONT, 31u8]);
    }

    #[test]
    fn test_echo_negotiation_stripped_silently() {
        let m = mgr();
        let (mut head, rx, tx) = mock_chain(&m);
        m.push_link(&mut head, 'y', Box::new(TelnetFilter::new()));
        rx.lock().unwrap().extend([IAC, WILL, OPT_ECHO, b'x']);
        let mut buf = [0u8; 16];
        let n = m.get(&mut head, 0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"x");
        m.ready(&mut head, 0).unwrap();
        assert!(tx.lock().unwrap().is_empty(), "no reply to ECHO offers");
    }

    #[test]
    fn test_ayt_answered() {
        let m = mgr();
        let (mut head, rx, tx) = mock_chain(&m);
        m.push_link(&mut head, 'y', Box::new(TelnetFilter::new()));
        rx.lock().unwrap().extend([IAC, AYT]);
        let mut buf = [0u8; 16];
        m.get(&mut head, 0, &mut buf).unwrap();
        m.ready(&mut head, 0).unwrap();
        assert_eq!(tx.lock().unwrap().as_slice(), b"Y\r\n");
    }

    #[test]
    fn test_will_echo_suppresses_tail() {
        let m = mgr();
        let (mut head, _rx, tx) = mock_chain(&m);
        m.push_link(&mut head, 'y', Box::new(TelnetFilter::new()));
        let mut data = Vec::new();
        data.extend_from_slice(b"Password: ");
        data.extend_from_slice(WILL_ECHO);
        data.extend_from_slice(b"secret-tail");
        let n = m.put(&mut head, 0, &data).unwrap();
        assert_eq!(n, data.len(), "whole buffer reported consumed");
        let wire = tx.lock().unwrap().clone();
        assert!(wire.ends_with(WILL_ECHO), "tail after IAC WILL ECHO dropped");
    }
}
