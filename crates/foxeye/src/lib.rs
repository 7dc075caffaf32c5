//! FoxEye runtime core.
//!
//! The pieces every protocol module plugs into:
//!
//! - the **dispatcher**: an interface registry and request/signal bus
//!   driven by a single round-robin scheduler loop;
//! - **connection chains**: per-peer stacks of byte-stream filters (line
//!   framing, telnet, text-filter bindings, zlib, TLS) rooted at one
//!   socket;
//! - the **socket layer**: a slot table with a background poll thread,
//!   non-blocking reads/writes, resolver, and ident lookups;
//! - **DCC**: CTCP-negotiated chat sessions and file transfers with
//!   resume and passive modes, built directly on the primitives above.
//!
//! # Example
//!
//! ```ignore
//! use foxeye::config::Settings;
//! use foxeye::core::Core;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let settings = Arc::new(Settings::with_core_defaults());
//!     settings.apply_line("set nick \"foxeye\"");
//!     let core = Core::new(settings, None);
//!     core.start_boot();
//!     // ... register protocol modules, open listeners ...
//!     core.end_boot();
//!     core.run().await;
//! }
//! ```

pub mod bindtable;
pub mod chain;
pub mod charset;
pub mod config;
pub mod core;
pub mod dcc;
pub mod dispatcher;
pub mod error;
pub mod filters;
pub mod listener;
pub mod peer;
pub mod session;
pub mod socket;
pub mod timer;
pub mod util;

pub use crate::chain::{ChainMgr, Filter, LinkId};
pub use crate::core::{Binds, Core, CoreRef};
pub use crate::dispatcher::{
    Bus, BusHandle, Flag, Handler, IfaceId, IfaceKind, ReqResult, Request, Signal,
};
pub use crate::error::{Error, Result};
pub use crate::peer::{Peer, PeerState, UserFlag};
pub use crate::socket::{SockIdx, SockKind, SocketSet};
pub use crate::timer::{Tid, Timers};
