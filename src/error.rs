use std::fmt;

/// An error returned by a table mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Error {
    /// The entry for a new route could not be allocated.
    ///
    /// The table is left unchanged.
    OutOfMemory,
    /// No route exists for the requested address.
    NotFound,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::OutOfMemory => write!(f, "failed to allocate a route entry"),
            Error::NotFound => write!(f, "no route for the given address"),
        }
    }
}

impl std::error::Error for Error {}
