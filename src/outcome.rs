// Copyright 2026 the handoff contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The result slot: the value a completion eventually carries.
//!
//! An [`Outcome`] is exactly one of a success value, a typed domain
//! error, or an opaque [`Exception`]. Domain errors and exceptions flow
//! through the same slot as success values and are never thrown across
//! the state-machine boundary; the only place anything unwinds is an
//! explicit accessor like [`Outcome::unwrap`] or [`Exception::resume`].

use crate::error::Abandoned;
use alloc::string::String;
use alloc::sync::Arc;
use core::any::Any;
use core::fmt;

/// A resolved result: success value, domain error, or exception.
///
/// The "empty" state of a completion's slot is represented by the slot
/// itself (`Option<Outcome>`), never by a variant here: once an
/// `Outcome` exists it is immutable.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Outcome<V, E> {
    /// The producer computed a value.
    Value(V),
    /// The producer reported an expected, typed failure.
    Error(E),
    /// Something unexpected happened: a continuation panicked, or the
    /// producer side disappeared before resolving.
    Panicked(Exception),
}

impl<V, E> Outcome<V, E> {
    /// `true` for [`Outcome::Value`].
    #[must_use]
    pub fn is_value(&self) -> bool {
        matches!(self, Outcome::Value(_))
    }

    /// Borrows the success value, if any.
    #[must_use]
    pub fn value(&self) -> Option<&V> {
        match self {
            Outcome::Value(v) => Some(v),
            _ => None,
        }
    }

    /// Splits into `Ok(value)` or `Err(failure)`.
    ///
    /// # Errors
    ///
    /// Returns the domain error or exception that was stored.
    pub fn ok(self) -> Result<V, Failure<E>> {
        match self {
            Outcome::Value(v) => Ok(v),
            Outcome::Error(e) => Err(Failure::Error(e)),
            Outcome::Panicked(p) => Err(Failure::Panicked(p)),
        }
    }

    /// Maps the success value, passing failures through unchanged.
    pub fn map<V2>(self, f: impl FnOnce(V) -> V2) -> Outcome<V2, E> {
        match self {
            Outcome::Value(v) => Outcome::Value(f(v)),
            Outcome::Error(e) => Outcome::Error(e),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Discards the success value.
    pub fn void(self) -> Outcome<(), E> {
        self.map(|_| ())
    }

    /// Re-tags a failure for a different value type.
    ///
    /// # Panics
    ///
    /// Panics if `self` is a [`Outcome::Value`].
    pub(crate) fn retag<V2>(self) -> Outcome<V2, E> {
        match self {
            Outcome::Value(_) => unreachable!("retag called on a success value"),
            Outcome::Error(e) => Outcome::Error(e),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Takes the success value, panicking on either failure lane.
    ///
    /// This is the explicit "ok-or-throw" accessor: a stored exception is
    /// resumed, a domain error aborts with its `Debug` rendering.
    ///
    /// # Panics
    ///
    /// Panics unless `self` is [`Outcome::Value`].
    #[track_caller]
    pub fn unwrap(self) -> V
    where
        E: fmt::Debug,
    {
        match self {
            Outcome::Value(v) => v,
            Outcome::Error(e) => panic!("called `Outcome::unwrap()` on a domain error: {e:?}"),
            Outcome::Panicked(p) => p.resume(),
        }
    }
}

impl<V, E> From<Exception> for Outcome<V, E> {
    fn from(exception: Exception) -> Self {
        Outcome::Panicked(exception)
    }
}

/// The failure half of [`Outcome::ok`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Failure<E> {
    /// An expected, typed failure.
    Error(E),
    /// An exception (panic or abandonment).
    Panicked(Exception),
}

/// An opaque carrier for unexpected failures.
///
/// Rust has no first-class exception object, so this is a cheaply
/// clonable, shareable payload: panics captured at a continuation
/// boundary keep their `&str`/`String` message, other panic payloads
/// degrade to an opaque marker, and producer abandonment carries
/// [`Abandoned`]. Clonability is what lets a broadcast cell hand the
/// same exception to every subscriber.
#[derive(Clone)]
pub struct Exception {
    payload: Arc<dyn Any + Send + Sync>,
}

/// Stand-in payload for panics whose payload type cannot be shared.
#[derive(Copy, Clone, Debug)]
struct OpaquePanic;

impl Exception {
    /// Wraps an arbitrary shareable payload.
    pub fn new(payload: impl Any + Send + Sync) -> Self {
        Self {
            payload: Arc::new(payload),
        }
    }

    /// The exception stored when a producer disappears unresolved.
    #[must_use]
    pub fn abandoned() -> Self {
        Self::new(Abandoned)
    }

    /// `true` if this exception carries the [`Abandoned`] marker.
    #[must_use]
    pub fn is_abandoned(&self) -> bool {
        self.payload.is::<Abandoned>()
    }

    /// Converts a payload caught by `catch_unwind`.
    ///
    /// String-ish messages are preserved; anything else is replaced by an
    /// opaque marker, since arbitrary panic payloads are not `Sync`.
    #[must_use]
    pub fn from_panic(payload: alloc::boxed::Box<dyn Any + Send>) -> Self {
        match payload.downcast::<&'static str>() {
            Ok(msg) => Self::new(*msg),
            Err(payload) => match payload.downcast::<String>() {
                Ok(msg) => Self::new(*msg),
                Err(_) => Self::new(OpaquePanic),
            },
        }
    }

    /// Borrows the payload as a concrete type, if it is one.
    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }

    /// The human-readable message, when the payload has one.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        if let Some(msg) = self.downcast_ref::<&'static str>() {
            Some(msg)
        } else if let Some(msg) = self.downcast_ref::<String>() {
            Some(msg)
        } else if self.is_abandoned() {
            Some("abandoned before completion")
        } else {
            None
        }
    }

    /// Rethrows the exception as a panic.
    pub fn resume(self) -> ! {
        match self.message() {
            Some(msg) => panic!("{msg}"),
            None => panic!("opaque exception resumed"),
        }
    }
}

impl fmt::Debug for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exception")
            .field("message", &self.message())
            .finish()
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.message().unwrap_or("opaque exception"))
    }
}

impl PartialEq for Exception {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.payload, &other.payload)
    }
}

impl Eq for Exception {}
