//! Error taxonomy for container constructors and operations.
//!
//! The core never logs and never prints; every fallible operation reports
//! through these values and the caller decides whether to retry, degrade to
//! an older snapshot, or fail.

use std::fmt;

/// Failure kinds surfaced by constructors and container operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// Zero or out-of-range sizes, non-power-of-two where required, or a key
    /// size below the minimum needed by the TTL map's free-list encoding.
    InvalidArgument,
    /// An arena allocation failed. Constructors roll back everything they
    /// allocated before returning this.
    OutOfMemory,
    /// A fixed pool is full: the TTL map's extra-bucket pool or key cursor,
    /// or a remap table's value cursor.
    Exhausted,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArgument => f.write_str("invalid argument"),
            Error::OutOfMemory => f.write_str("out of arena memory"),
            Error::Exhausted => f.write_str("capacity exhausted"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;
