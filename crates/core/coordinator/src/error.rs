use std::{fmt, sync::Arc};

#[derive(Debug)]
/// Failure delivered to every waiter of a coalesced group.
pub enum Error<E> {
    /// The operation itself failed; all waiters share a handle to the same error value
    Operation(Arc<E>),
    /// The shared operation was cancelled because one of its waiters dropped out
    Cancelled,
    /// The operation panicked before producing a value
    Panicked,
    /// The outcome channel closed without a published result for unknown reason
    RecvError,
}

impl<E> Clone for Error<E> {
    fn clone(&self) -> Self {
        match self {
            Error::Operation(error) => Error::Operation(Arc::clone(error)),
            Error::Cancelled => Error::Cancelled,
            Error::Panicked => Error::Panicked,
            Error::RecvError => Error::RecvError,
        }
    }
}

impl<E: fmt::Display> fmt::Display for Error<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Operation(error) => write!(f, "Operation failed: {error}"),
            Error::Cancelled => write!(f, "Operation was cancelled before completing"),
            Error::Panicked => write!(f, "Operation panicked before producing a value"),
            Error::RecvError => write!(f, "Unable to receive the outcome from the channel"),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for Error<E> {}
