//! The module containing the [`Error`] type used across the core.

use core::fmt;

/// The closed set of failure kinds the core reports. Lower layers may
/// surface [`Error::NoSpace`] and [`Error::Io`]; the core forwards them
/// unmodified.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// Generic precondition violation, bad encoding, or corrupted state
    /// that does not correspond to a richer kind.
    Fail,

    /// The lookup did not find a page, region or cluster.
    NotAvail,

    /// Argument out of range.
    Invalid,

    /// Pool or heap exhaustion.
    NoMem,

    /// No space left in a lower layer.
    NoSpace,

    /// An I/O failure in a lower layer.
    Io,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Error::Fail => "operation failed",
            Error::NotAvail => "not available",
            Error::Invalid => "invalid argument",
            Error::NoMem => "out of memory",
            Error::NoSpace => "out of space",
            Error::Io => "i/o error",
        };
        f.write_str(name)
    }
}

/// The `Result` alias every fallible core operation returns.
pub type Result<T> = core::result::Result<T, Error>;
