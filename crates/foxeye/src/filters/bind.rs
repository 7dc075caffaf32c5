//! Filter `b`: eggdrop-style text filter bindings.
//!
//! Runs the `out-filter` bindtable over every outbound line and the
//! `in-filter` bindtable over every inbound line, honouring the peer's
//! user flags. A binding that empties the line swallows it. Local
//! sessions only; growing it on an unregistered peer is refused.

use std::sync::Arc;

use crate::bindtable::BindTable;
use crate::chain::{Down, Filter, FilterInit, GrowCtx, Grown};
use crate::core::CoreRef;
use crate::error::Result;
use crate::peer::UserFlag;

/// Context a text filter binding receives; the line is rewritten in
/// place, clearing it swallows the message.
pub struct TextFilterCtx<'a> {
    pub line: &'a mut String,
    pub uf: UserFlag,
}

/// Callback type for `in-filter` / `out-filter` rows.
pub type TextFilterFn = Arc<dyn Fn(&mut TextFilterCtx<'_>) + Send + Sync>;

pub struct BindFilter {
    uf: UserFlag,
    in_table: Arc<BindTable<TextFilterFn>>,
    out_table: Arc<BindTable<TextFilterFn>>,
}

impl BindFilter {
    fn run_table(&self, table: &BindTable<TextFilterFn>, line: &mut String) {
        loop {
            let before = line.clone();
            for b in table.lookup(line.as_str(), self.uf) {
                let mut ctx = TextFilterCtx { line: &mut *line, uf: self.uf };
                (b.func)(&mut ctx);
                if line.is_empty() {
                    return;
                }
            }
            if *line == before {
                return; // fixpoint, stop re-running bindings
            }
        }
    }
}

impl Filter for BindFilter {
    fn send(&mut self, down: &mut Down<'_>, data: &[u8]) -> Result<usize> {
        if !down.ready()? {
            return Ok(0);
        }
        let mut line = String::from_utf8_lossy(data).into_owned();
        self.run_table(&self.out_table, &mut line);
        if line.is_empty() {
            return Ok(data.len()); // swallowed
        }
        let out = line.into_bytes();
        let mut sent = 0;
        while sent < out.len() {
            let n = down.put(&out[sent..])?;
            if n == 0 {
                break;
            }
            sent += n;
        }
        Ok(data.len())
    }

    fn ready(&mut self, down: &mut Down<'_>) -> Result<bool> {
        down.ready()
    }

    fn flush(&mut self, down: &mut Down<'_>) -> Result<usize> {
        down.flush()
    }

    fn recv(&mut self, down: &mut Down<'_>, out: &mut [u8]) -> Result<usize> {
        let n = down.get(out)?;
        if n == 0 {
            return Ok(0);
        }
        let mut line = String::from_utf8_lossy(&out[..n]).into_owned();
        self.run_table(&self.in_table, &mut line);
        let rewritten = line.into_bytes();
        let m = rewritten.len().min(out.len());
        out[..m].copy_from_slice(&rewritten[..m]);
        Ok(m)
    }
}

/// Register the stock `b` filter.
pub fn register(core: &CoreRef) {
    let binds = core.binds.clone();
    let init: FilterInit = Arc::new(move |ctx: &mut GrowCtx<'_>| {
        if ctx.peer.dname.is_none() {
            return None; // local sessions only
        }
        Some(Grown {
            filter: Box::new(BindFilter {
                uf: ctx.peer.uf,
                in_table: binds.in_filter.clone(),
                out_table: binds.out_filter.clone(),
            }),
            sticky: false,
        })
    });
    core.binds.connchain_grow.add("b", UserFlag::empty(), init);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::testwire::mock_chain;
    use crate::chain::ChainMgr;
    use crate::socket::SocketSet;

    fn tables() -> (Arc<BindTable<TextFilterFn>>, Arc<BindTable<TextFilterFn>>) {
        (
            Arc::new(BindTable::new("in-filter")),
            Arc::new(BindTable::new("out-filter")),
        )
    }

    #[test]
    fn test_out_filter_rewrites() {
        let m = ChainMgr::new(SocketSet::new(false));
        let (mut head, _rx, tx) = mock_chain(&m);
        let (in_t, out_t) = tables();
        out_t.add(
            "*",
            UserFlag::empty(),
            Arc::new(|ctx: &mut TextFilterCtx<'_>| {
                *ctx.line = ctx.line.to_uppercase();
            }),
        );
        m.push_link(
            &mut head,
            'b',
            Box::new(BindFilter { uf: UserFlag::empty(), in_table: in_t, out_table: out_t }),
        );
        m.put(&mut head, 0, b"hello").unwrap();
        assert_eq!(tx.lock().unwrap().as_slice(), b"HELLO");
    }

    #[test]
    fn test_in_filter_can_swallow() {
        let m = ChainMgr::new(SocketSet::new(false));
        let (mut head, rx, _tx) = mock_chain(&m);
        let (in_t, out_t) = tables();
        in_t.add(
            "secret*",
            UserFlag::empty(),
            Arc::new(|ctx: &mut TextFilterCtx<'_>| ctx.line.clear()),
        );
        m.push_link(
            &mut head,
            'b',
            Box::new(BindFilter { uf: UserFlag::empty(), in_table: in_t, out_table: out_t }),
        );
        rx.lock().unwrap().extend(b"secret stuff");
        let mut buf = [0u8; 32];
        let n = m.get(&mut head, 0, &mut buf).unwrap();
        assert_eq!(n, 0, "line swallowed by in-filter");
    }

    #[test]
    fn test_flag_gated_binding() {
        let m = ChainMgr::new(SocketSet::new(false));
        let (mut head, _rx, tx) = mock_chain(&m);
        let (in_t, out_t) = tables();
        out_t.add(
            "*",
            UserFlag::OWNER,
            Arc::new(|ctx: &mut TextFilterCtx<'_>| ctx.line.push_str("!owner")),
        );
        m.push_link(
            &mut head,
            'b',
            Box::new(BindFilter { uf: UserFlag::OP, in_table: in_t, out_table: out_t }),
        );
        m.put(&mut head, 0, b"cmd").unwrap();
        assert_eq!(tx.lock().unwrap().as_slice(), b"cmd", "op is not admitted");
    }
}
