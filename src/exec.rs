// Copyright 2026 the handoff contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The executor collaborator contract.
//!
//! This crate owns no scheduler. A continuation that should not run
//! inline is handed to an [`Executor`] as a [`Job`]; the executor must
//! eventually [`run`](Job::run) it, or [`abandon`](Job::abandon) it if
//! it refuses work (for example after shutdown). Exactly one of the two
//! happens, exactly once — a `Job` that is simply dropped abandons
//! itself.

use crate::cell::{drive, ObserverHeader};
use alloc::sync::Arc;
use core::fmt;
use core::mem;
use core::ptr::NonNull;

/// Something that can accept a runnable unit of work.
///
/// Submission may run the job synchronously on the calling thread (see
/// [`inline`]) or asynchronously on any other thread.
pub trait Executor: Send + Sync {
    /// Accepts `job`. The executor must eventually invoke [`Job::run`]
    /// exactly once, or [`Job::abandon`] if it refuses the work.
    fn submit(&self, job: Job);
}

/// Shared handle to an executor.
pub type ExecutorRef = Arc<dyn Executor>;

/// An owned, runnable unit of work: a continuation node detached from
/// its cell and waiting to be executed.
pub struct Job {
    observer: NonNull<ObserverHeader>,
}

// Safety: the node behind the pointer was built from `Send` parts (the
// continuation closure and captured handles are `Send`-bounded at
// construction).
unsafe impl Send for Job {}

impl Job {
    /// # Safety
    ///
    /// `observer` must carry the single outstanding right to fire the
    /// node's `run`/`abandoned` entry.
    pub(crate) unsafe fn new(observer: NonNull<ObserverHeader>) -> Self {
        Self { observer }
    }

    /// Executes the job on the calling thread.
    pub fn run(self) {
        let observer = self.observer;
        mem::forget(self);
        tracing::trace!(target: "handoff::exec", ?observer, "job run");
        // Safety: `self` held the single right to fire this node, and we
        // just consumed it.
        drive(unsafe { (observer.as_ref().vtable.run)(observer) });
    }

    /// Refuses the job: the continuation is told it will never receive
    /// a result and resolves downstream cells with the abandonment
    /// exception.
    pub fn abandon(self) {
        let observer = self.observer;
        mem::forget(self);
        tracing::trace!(target: "handoff::exec", ?observer, "job abandoned");
        // Safety: as in `run`.
        drive(unsafe { (observer.as_ref().vtable.abandoned)(observer) });
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        tracing::trace!(target: "handoff::exec", observer = ?self.observer, "job dropped, abandoning");
        // Safety: `run`/`abandon` forget `self` before consuming the
        // right to fire, so reaching this drop means the right is still
        // ours.
        drive(unsafe { (self.observer.as_ref().vtable.abandoned)(self.observer) });
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("observer", &self.observer)
            .finish()
    }
}

/// The synchronous executor: `submit` runs the job in place.
#[derive(Debug, Default, Copy, Clone)]
pub struct Inline;

impl Executor for Inline {
    fn submit(&self, job: Job) {
        job.run();
    }
}

cfg_if::cfg_if! {
    if #[cfg(loom)] {
        /// A handle to the inline executor.
        ///
        /// Under loom every call constructs a fresh handle; lazily
        /// initialized globals do not survive across model iterations.
        pub fn inline() -> ExecutorRef {
            Arc::new(Inline)
        }
    } else {
        /// A handle to the process-wide inline executor singleton.
        pub fn inline() -> ExecutorRef {
            fn make() -> ExecutorRef {
                Arc::new(Inline)
            }
            static INLINE: spin::Lazy<ExecutorRef> = spin::Lazy::new(make);
            INLINE.clone()
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::outcome::Outcome;
    use crate::unique::completion;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc as StdArc;

    #[test]
    fn inline_executor_runs_in_place() {
        let hits = StdArc::new(AtomicUsize::new(0));
        let observed = hits.clone();
        let (producer, consumer) = completion::<u32, ()>();
        consumer
            .then_via(inline(), move |outcome| {
                observed.fetch_add(1, Ordering::SeqCst);
                outcome
            })
            .detach(|_| ());
        producer.complete(Outcome::Value(1));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    /// An executor that refuses everything.
    struct Refusing;

    impl Executor for Refusing {
        fn submit(&self, job: Job) {
            job.abandon();
        }
    }

    #[test]
    fn refused_jobs_resolve_downstream_with_abandonment() {
        let (producer, consumer) = completion::<u32, ()>();
        let downstream = consumer.then_via(StdArc::new(Refusing), |outcome| outcome);
        producer.complete(Outcome::Value(1));
        match downstream.get() {
            Outcome::Panicked(exception) => assert!(exception.is_abandoned()),
            other => panic!("expected abandonment, got {other:?}"),
        }
    }
}
