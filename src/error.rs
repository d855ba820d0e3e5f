//! Error handling utils.

use std::io;
use std::os::unix::io::RawFd;

use crate::reactor::Event;

/// A specialized [`Result`] type for the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Represents all error cases for all routines of the crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("io error: {0}")]
    IO(#[from] io::Error),

    /// Returned by [`Reactor::add_event`] on duplicate registration of the
    /// same direction on the same fd. Registrations are one-shot: re-arming
    /// requires a fresh `add_event` after the previous one fired.
    ///
    /// [`Reactor::add_event`]: crate::reactor::Reactor::add_event
    #[error("event {events:?} already registered for fd {fd}")]
    EventExists { fd: RawFd, events: Event },

    /// A bounded wait expired before the awaited readiness event fired.
    #[error("timed out")]
    TimedOut,
}

impl Error {
    /// Returns the name of the variant as it is spelled in the source code.
    pub const fn variant_name(&self) -> &'static str {
        match self {
            Self::IO(_) => "IO",
            Self::EventExists { .. } => "EventExists",
            Self::TimedOut => "TimedOut",
        }
    }
}

const _: () = {
    /// Assert Error implements Send + Sync
    const fn if_this_compiles_the_type_implements_send_and_sync<T: Send + Sync>() {}
    if_this_compiles_the_type_implements_send_and_sync::<Error>();
};
