//! Filter `Z`: zlib stream compression.
//!
//! Outbound data is deflated with partial flush so interactive protocols
//! stay word-synchronous; inbound data is inflated. The filter installs
//! atomically in the middle of a live stream: the existing chain is saved
//! aside and drained (buffered input re-read as compressed stream data,
//! pending output flushed) before the compressed stream goes live. An
//! error on either direction tears both down.

use std::sync::Arc;

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use tracing::{debug, error};

use crate::chain::{Down, Filter, FilterInit, GrowCtx, Grown, LinkId};
use crate::core::CoreRef;
use crate::error::{Error, Result};
use crate::peer::UserFlag;

const ZBUF: usize = 16384;
const COMPRESSION_LEVEL: u32 = 6;

pub struct ZlibFilter {
    comp: Compress,
    decomp: Decompress,
    /// Chain that carried this peer before compression went live; drained
    /// then destroyed.
    saved: Option<LinkId>,
    /// Compressed bytes waiting to go down.
    out_buf: Vec<u8>,
    out_pos: usize,
    /// Compressed bytes read but not yet inflated.
    in_buf: Vec<u8>,
    in_pos: usize,
    error: Option<Error>,
}

impl ZlibFilter {
    fn new(saved: Option<LinkId>) -> ZlibFilter {
        ZlibFilter {
            comp: Compress::new(Compression::new(COMPRESSION_LEVEL), true),
            decomp: Decompress::new(true),
            saved,
            out_buf: Vec::with_capacity(ZBUF),
            out_pos: 0,
            in_buf: Vec::with_capacity(ZBUF),
            in_pos: 0,
            error: None,
        }
    }

    /// Pull leftovers out of the saved chain; kill it once dry both ways.
    fn drain_saved(&mut self, down: &mut Down<'_>) {
        let Some(mut saved) = self.saved.take() else { return };
        let mut head = Some(saved);
        let mut in_done = false;
        if self.in_buf.len() < ZBUF {
            let mut tmp = vec![0u8; ZBUF - self.in_buf.len()];
            match down.pull_at(&mut head, &mut tmp) {
                Ok(0) => in_done = true,
                Ok(n) => {
                    debug!(n, "ziplink: found stream data in old chain");
                    self.in_buf.extend_from_slice(&tmp[..n]);
                }
                Err(_) => in_done = true,
            }
        }
        let out_done = matches!(down.flush_at(&mut head, down.idx()), Err(_));
        if in_done && out_done {
            down.close_at(&mut head, down.idx());
            debug!("ziplink: old chain drained and destroyed");
            return;
        }
        saved = head.expect("saved chain lost during drain");
        self.saved = Some(saved);
    }

    fn push_out(&mut self, down: &mut Down<'_>) -> Result<usize> {
        while self.out_pos < self.out_buf.len() {
            let n = down.put(&self.out_buf[self.out_pos..])?;
            if n == 0 {
                break;
            }
            self.out_pos += n;
        }
        if self.out_pos >= self.out_buf.len() {
            self.out_buf.clear();
            self.out_pos = 0;
        }
        Ok(self.out_buf.len() - self.out_pos)
    }
}

impl Filter for ZlibFilter {
    fn send(&mut self, down: &mut Down<'_>, data: &[u8]) -> Result<usize> {
        if self.saved.is_some() {
            self.drain_saved(down);
            if self.saved.is_some() {
                return Ok(0); // not live yet
            }
        }
        self.push_out(down)?;
        if self.out_buf.len() >= ZBUF - 16 {
            return Ok(0); // not ready now
        }
        let before_in = self.comp.total_in();
        let before_out = self.comp.total_out();
        let mut scratch = vec![0u8; ZBUF - self.out_buf.len()];
        let status = self
            .comp
            .compress(data, &mut scratch, FlushCompress::Partial)
            .map_err(|_| Error::NoSocket)?;
        if status == Status::StreamEnd {
            return Err(Error::NoSocket);
        }
        let consumed = (self.comp.total_in() - before_in) as usize;
        let produced = (self.comp.total_out() - before_out) as usize;
        self.out_buf.extend_from_slice(&scratch[..produced]);
        self.push_out(down)?;
        Ok(consumed)
    }

    fn ready(&mut self, down: &mut Down<'_>) -> Result<bool> {
        if self.saved.is_some() {
            self.drain_saved(down);
            if self.saved.is_some() {
                return Ok(false);
            }
        }
        if self.out_buf.len() - self.out_pos >= ZBUF - 64 {
            return Ok(false); // keep some reserve
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
        if self.saved.is_some() {
            self.drain_saved(down);
        } else if self.error.is_none() && self.in_buf.len() < ZBUF {
            let mut tmp = vec![0u8; ZBUF - self.in_buf.len()];
            match down.get(&mut tmp) {
                Ok(0) => {}
                Ok(n) => {
                    self.in_buf.extend_from_slice(&tmp[..n]);
                }
                Err(e) => self.error = Some(e),
            }
        }
        let input = &self.in_buf[self.in_pos..];
        let before_in = self.decomp.total_in();
        let before_out = self.decomp.total_out();
        let flush =
            if self.error.is_some() { FlushDecompress::Sync } else { FlushDecompress::None };
        match self.decomp.decompress(input, out, flush) {
            Ok(Status::Ok) | Ok(Status::BufError) | Ok(Status::StreamEnd) => {
                let consumed = (self.decomp.total_in() - before_in) as usize;
                let produced = (self.decomp.total_out() - before_out) as usize;
                self.in_pos += consumed;
                if self.in_pos >= self.in_buf.len() {
                    self.in_buf.clear();
                    self.in_pos = 0;
                }
                if produced > 0 {
                    return Ok(produced);
                }
                match self.error {
                    // connection error surfaces once the stream is dry
                    Some(e) => {
                        error!("ziplink: got {e} from connection chain, terminating");
                        Err(e)
                    }
                    None => Ok(0),
                }
            }
            Err(_) => {
                error!("ziplink: inflate failed, finishing streams");
                Err(self.error.unwrap_or(Error::NoSocket))
            }
        }
    }

    fn pull(&mut self, down: &mut Down<'_>, out: &mut [u8]) -> Result<usize> {
        if self.saved.is_some() {
            self.drain_saved(down);
        }
        if self.in_buf.len() > self.in_pos {
            let avail = &self.in_buf[self.in_pos..];
            let n = avail.len().min(out.len());
            out[..n].copy_from_slice(&avail[..n]);
            self.in_pos += n;
            if self.in_pos >= self.in_buf.len() {
                self.in_buf.clear();
                self.in_pos = 0;
            }
            return Ok(n);
        }
        down.pull(out)
    }

    fn close(&mut self, down: &mut Down<'_>) {
        if let Some(saved) = self.saved.take() {
            let mut head = Some(saved);
            down.close_at(&mut head, down.idx());
        }
        // stream contexts dropped dirty by design; zlib data errors at
        // this point mean discarded bytes, not a fault
    }
}

/// Register the stock `Z` filter.
pub fn register(core: &CoreRef) {
    let chains = core.chains.clone();
    let init: FilterInit = Arc::new(move |ctx: &mut GrowCtx<'_>| {
        if ctx.test {
            return Some(Grown { filter: Box::new(ZlibFilter::new(None)), sticky: false });
        }
        // save the live chain and re-root the peer over a fresh terminal;
        // everything from here on is compressed stream data
        let saved = ctx.peer.chain.take();
        ctx.peer.chain = chains.new_terminal();
        Some(Grown { filter: Box::new(ZlibFilter::new(saved)), sticky: false })
    });
    core.binds.connchain_grow.add("Z", UserFlag::empty(), init);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::testwire::mock_chain;
    use crate::chain::ChainMgr;
    use crate::socket::SocketSet;

    fn mgr() -> std::sync::Arc<ChainMgr> {
        ChainMgr::new(SocketSet::new(false))
    }

    #[test]
    fn test_compress_decompress_roundtrip() {
        let m = mgr();
        let (mut head, rx, tx) = mock_chain(&m);
        m.push_link(&mut head, 'Z', Box::new(ZlibFilter::new(None)));
        let payload = b"the quick brown fox jumps over the lazy dog";
        let n = m.put(&mut head, 0, payload).unwrap();
        assert_eq!(n, payload.len());
        let wire = tx.lock().unwrap().clone();
        assert!(!wire.is_empty());
        assert_ne!(wire.as_slice(), payload, "data left compressed");
        // feed the compressed bytes back through a fresh inflater
        let m2 = mgr();
        let (mut head2, rx2, _tx2) = mock_chain(&m2);
        m2.push_link(&mut head2, 'Z', Box::new(ZlibFilter::new(None)));
        rx2.lock().unwrap().extend(wire.iter());
        drop(rx);
        let mut buf = [0u8; 256];
        let got = m2.get(&mut head2, 0, &mut buf).unwrap();
        assert_eq!(&buf[..got], payload);
    }

    #[test]
    fn test_partial_flush_keeps_messages_separable() {
        // two independent writes must each be inflatable as they arrive
        let m = mgr();
        let (mut head, _rx, tx) = mock_chain(&m);
        m.push_link(&mut head, 'Z', Box::new(ZlibFilter::new(None)));
        m.put(&mut head, 0, b"first ").unwrap();
        let after_first = tx.lock().unwrap().len();
        assert!(after_first > 0, "partial flush pushed bytes immediately");
        m.put(&mut head, 0, b"second").unwrap();
        let after_second = tx.lock().unwrap().len();
        assert!(after_second > after_first);

        let wire = tx.lock().unwrap().clone();
        let m2 = mgr();
        let (mut head2, rx2, _t) = mock_chain(&m2);
        m2.push_link(&mut head2, 'Z', Box::new(ZlibFilter::new(None)));
        rx2.lock().unwrap().extend(wire.iter());
        let mut buf = [0u8; 64];
        let mut got = Vec::new();
        loop {
            let n = m2.get(&mut head2, 0, &mut buf).unwrap();
            if n == 0 {
                break;
            }
            got.extend_from_slice(&buf[..n]);
        }
        assert_eq!(got, b"first second");
    }

    #[test]
    fn test_error_terminates_filter() {
        let m = mgr();
        let (wire, rx, tx) = crate::chain::testwire::MockWire::pair();
        let fail = wire.fail.clone();
        let mut head = None;
        m.push_link(&mut head, '\0', Box::new(wire));
        m.push_link(&mut head, 'Z', Box::new(ZlibFilter::new(None)));
        m.put(&mut head, 0, b"payload").unwrap();
        rx.lock().unwrap().extend(tx.lock().unwrap().iter());
        let mut buf = [0u8; 64];
        let n = m.get(&mut head, 0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"payload");
        // wire dies: the stored error terminates the filter and the
        // chain tears its top link down
        *fail.lock().unwrap() = true;
        assert!(m.get(&mut head, 0, &mut buf).is_err());
        assert_eq!(m.link_count(), 1, "zlib link destroyed, raw link left");
    }
}
