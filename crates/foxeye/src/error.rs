//! The closed error set shared by the socket layer and the connection chain.

use std::io;

/// Result type used across the runtime core.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors a socket or chain operation can surface.
///
/// The set is closed on purpose: callers dispatch on the variant, not on
/// strings, and everything OS-level collapses into [`Error::Errno`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Operation would block; for reads on a connecting socket this means
    /// the connection is still being established.
    #[error("socket is waiting for connection")]
    Again,

    /// Slot index does not name a live socket.
    #[error("no such socket")]
    NoSocket,

    /// Resolver returned a temporary failure (EAI_AGAIN).
    #[error("resolver temporary failure")]
    ResolveTimeout,

    /// A worker task could not be started.
    #[error("cannot create listening thread")]
    NoThread,

    /// Peer closed the connection.
    #[error("connection reset by peer")]
    Eof,

    /// No domain given where one is required.
    #[error("domain not defined")]
    UndefDomain,

    /// Resolver does not know the domain.
    #[error("domain unknown")]
    NoSuchDomain,

    /// OS error, carrying the errno value.
    #[error("{}", errno_string(*.0))]
    Errno(i32),

    /// A fixed-size pool (sockets, interfaces, requests) is exhausted.
    #[error("resource pool exhausted")]
    Pool,
}

fn errno_string(errno: i32) -> String {
    io::Error::from_raw_os_error(errno).to_string()
}

impl Error {
    /// Capture the current `errno` after a failed libc call.
    pub fn last_os() -> Self {
        Error::Errno(io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO))
    }

    /// Transient conditions the caller should retry.
    pub fn is_transient(self) -> bool {
        matches!(self, Error::Again | Error::ResolveTimeout)
    }

    /// Conditions that end the peer: the caller closes the associated
    /// interface and logs.
    pub fn is_fatal_for_peer(self) -> bool {
        matches!(self, Error::Eof | Error::Errno(_) | Error::NoSocket)
    }

    /// The errno value if this is an OS error.
    pub fn errno(self) -> Option<i32> {
        match self {
            Error::Errno(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::WouldBlock => Error::Again,
            io::ErrorKind::UnexpectedEof => Error::Eof,
            _ => Error::Errno(e.raw_os_error().unwrap_or(libc::EIO)),
        }
    }
}
