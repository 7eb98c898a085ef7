// Copyright 2026 the handoff contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Lock-free completion cells and the machinery built on top of them.
//!
//! The heart of this crate is a single atomic machine word per
//! asynchronous result, packing a 3-bit state tag together with an
//! observer pointer so that a producer (whoever computes the result) and
//! a consumer (whoever attaches a continuation or blocks waiting) can
//! race without locks: whichever side performs its atomic write second
//! observes the other and drives delivery forward.
//!
//! On top of the cell sit:
//!
//! - [`completion`]: a single-consumer producer/consumer pair with
//!   continuation chaining ([`UniqueCompletion::then`]) and blocking
//!   waits,
//! - [`broadcast()`]: a multi-subscriber cell whose resolved value is
//!   copied to every subscriber,
//! - fan-in combinators ([`when_all`], [`when_any`], [`join`],
//!   [`WaitGroup`]) that reduce completion of N cells to one
//!   notification,
//! - the [`Executor`] and [`Event`] collaborator contracts for handing
//!   work to a scheduler or parking a thread.
//!
//! Long chains of synchronous continuations are resolved iteratively by
//! a trampoline rather than recursively, so stack depth stays bounded no
//! matter how deep a chain grows.

#![cfg_attr(not(any(test, feature = "std")), no_std)]

extern crate alloc;
#[cfg(feature = "std")]
extern crate std;

#[macro_use]
mod loom;
#[macro_use]
pub mod diag;

pub mod broadcast;
mod cell;
mod count;
pub mod error;
pub mod exec;
pub mod fanin;
pub mod outcome;
pub mod park;
#[cfg(all(test, not(loom)))]
mod test_util;
pub mod unique;

pub use broadcast::{broadcast, BroadcastCompletion, BroadcastProducer};
pub use error::Abandoned;
pub use exec::{Executor, ExecutorRef, Job};
#[cfg(feature = "std")]
pub use fanin::{wait_all, wait_all_timeout, WaitGroup};
pub use fanin::{join, wait_all_with, when_all, when_any, Policy, Waitable};
pub use outcome::{Exception, Failure, Outcome};
pub use park::Event;
#[cfg(feature = "std")]
pub use park::MutexEvent;
pub use unique::{completion, Producer, UniqueCompletion};
