//! Stock connection-chain filters beyond the line framer: telnet escape
//! processing, eggdrop-style text filter bindings, zlib compression, TLS.

pub mod bind;
pub mod telnet;
pub mod tls;
pub mod zlib;

use crate::core::CoreRef;

/// Register every stock filter in the `connchain-grow` bindtable.
pub fn register_stock(core: &CoreRef) {
    crate::chain::register_line_framer(core);
    telnet::register(core);
    bind::register(core);
    zlib::register(core);
    tls::register(core);
}
