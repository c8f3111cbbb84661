//! Single-assignment promises with synchronous `then`/`catch` continuations.
//!
//! A producer calls [`defer`] to get a [`Deferred`], hands out the
//! [`Promise`] it wraps, and settles it later with
//! [`Deferred::resolve`] or [`Deferred::reject`]. Consumers register
//! continuations on the promise, or simply `.await` it.
//!
//! ```
//! use oath::defer;
//! use std::sync::{Arc, Mutex};
//!
//! let deferred = defer::<i32, String>();
//! let seen = Arc::new(Mutex::new(None));
//! let slot = seen.clone();
//! deferred.promise().on_success(move |v| {
//!     *slot.lock().unwrap() = Some(v * 2);
//! });
//! deferred.resolve(5);
//! assert_eq!(*seen.lock().unwrap(), Some(10));
//! ```
pub mod deferred;
pub mod promise;

pub use deferred::{defer, Builder, Deferred};
pub use promise::{Promise, Status, Step};

use thiserror::Error;

/// What an awaited [`Promise`] yields instead of its value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error<E> {
    /// The payload is left out of the message so `E` needs no `Display`;
    /// get it back with [`Error::into_rejection`].
    #[error("promise was rejected")]
    Rejected(E),
    #[error("deferred was dropped before it settled")]
    Abandoned,
}

impl<E> Error<E> {
    /// The rejection payload, if there is one.
    pub fn into_rejection(self) -> Option<E> {
        match self {
            Error::Rejected(error) => Some(error),
            Error::Abandoned => None,
        }
    }
}
