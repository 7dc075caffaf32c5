//! Integration test entry point.
//!
//! The actual tests are organized in the `integration/` directory:
//!
//! - `chain.rs` - connection chains over real loopback sockets
//! - `bus.rs` - request routing, refcounts, boot barrier
//! - `transfer.rs` - DCC transfer loops end to end
//! - `login.rs` - the telnet login flow
//!
//! ```bash
//! cargo test --test integration
//! ```

#[path = "common/mod.rs"]
mod common;

#[path = "integration/chain.rs"]
mod chain;

#[path = "integration/bus.rs"]
mod bus;

#[path = "integration/transfer.rs"]
mod transfer;

#[path = "integration/login.rs"]
mod login;
