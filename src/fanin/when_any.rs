// Copyright 2026 the handoff contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! `when_any`: complete with the first source that succeeds.
//!
//! The first success always wins immediately. What happens when sources
//! fail depends on the [`Policy`]: `FirstFail` stashes the first
//! observed failure and surfaces it only if every source fails;
//! `LastFail` counts failures down and surfaces the final one, so the
//! error reflects the last source to give up.

use crate::cell::{ObserverHeader, ObserverVTable, Step};
use crate::fanin::sub_eq;
use crate::fanin::when_all::{attach_child, ChildNode};
use crate::loom::cell::UnsafeCell;
use crate::loom::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use crate::outcome::Outcome;
use crate::unique::{completion, Producer, UniqueCompletion};
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::ptr::NonNull;

/// Which failure a [`when_any`] surfaces when no source succeeds.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Policy {
    /// Surface the first failure observed.
    FirstFail,
    /// Surface the failure of the last source to give up.
    LastFail,
}

/// Completes with the first successful source; if every source fails,
/// completes with a failure chosen by `policy`.
///
/// Requires at least one source; calling with none is a contract
/// violation.
#[must_use]
pub fn when_any<V, E>(
    sources: Vec<UniqueCompletion<V, E>>,
    policy: Policy,
) -> UniqueCompletion<V, E>
where
    V: Send + 'static,
    E: Send + 'static,
{
    if sources.is_empty() {
        violation!("when_any requires at least one source");
    }
    let (producer, consumer) = completion::<V, E>();
    let n = sources.len();

    let combinator = Box::into_raw(Box::new(AnyCombinator {
        pending: AtomicUsize::new(n),
        policy,
        // LastFail countdown: 2 per source, bit 0 flags a success.
        state: AtomicUsize::new(2 * n),
        stash_state: AtomicU8::new(STASH_EMPTY),
        stash: UnsafeCell::new(None),
        target: UnsafeCell::new(Some(producer)),
        children: UnsafeCell::new(None),
    }));

    let children: Box<[AnyChild<V, E>]> = sources
        .into_iter()
        .map(|source| AnyChild {
            observer: ObserverHeader {
                vtable: &AnyChild::<V, E>::VTABLE,
            },
            source: UnsafeCell::new(Some(source)),
            combinator,
        })
        .collect();
    // Safety: the combinator was just allocated and is not yet shared.
    let children_base = unsafe {
        (*combinator).children.with_mut(|slot| {
            *slot = Some(children);
            (*slot).as_mut().expect("just stored").as_mut_ptr()
        })
    };

    // Safety: each child cannot fire before its own attach, so the
    // combinator outlives the loop (see `when_all`).
    for index in 0..n {
        unsafe { attach_child::<AnyChild<V, E>>(children_base.add(index)) };
    }
    consumer
}

const STASH_EMPTY: u8 = 0;
const STASH_CLAIMED: u8 = 1;
const STASH_STORED: u8 = 2;

struct AnyCombinator<V, E> {
    pending: AtomicUsize,
    policy: Policy,
    /// `2 * remaining_failures`, with bit 0 set once a success claimed
    /// the target.
    state: AtomicUsize,
    stash_state: AtomicU8,
    /// FirstFail: the first failure, kept in case no source succeeds.
    stash: UnsafeCell<Option<Outcome<V, E>>>,
    target: UnsafeCell<Option<Producer<V, E>>>,
    children: UnsafeCell<Option<Box<[AnyChild<V, E>]>>>,
}

#[repr(C)]
struct AnyChild<V, E> {
    /// Must be the first field so the attach word can recover the node.
    observer: ObserverHeader,
    source: UnsafeCell<Option<UniqueCompletion<V, E>>>,
    combinator: *mut AnyCombinator<V, E>,
}

impl<V, E> ChildNode for AnyChild<V, E> {
    unsafe fn source_header(&self) -> &crate::cell::CellHeader {
        // Safety: promised by the caller.
        unsafe {
            self.source.with(|s| {
                (*s).as_ref()
                    .map(UniqueCompletion::header)
                    .expect("source already consumed")
            })
        }
    }
}

impl<V, E> AnyChild<V, E>
where
    V: Send + 'static,
    E: Send + 'static,
{
    const VTABLE: ObserverVTable = ObserverVTable {
        resolved: Self::resolved,
        run: Self::never_run,
        abandoned: Self::resolved,
    };

    unsafe fn resolved(observer: NonNull<ObserverHeader>) -> Step {
        // Safety: fired exactly once; header is the node's first field.
        unsafe {
            let this = observer.as_ptr().cast::<Self>();
            let combinator = (*this).combinator;
            let source = (*this)
                .source
                .with_mut(|s| (*s).take())
                .expect("child fired twice");
            let outcome = source.take_resolved();

            let mut step = Self::combine(combinator, outcome);
            if sub_eq(&(*combinator).pending, 1) {
                let final_step = Self::finalize(combinator);
                if matches!(step, Step::Idle) {
                    step = final_step;
                }
            }
            step
        }
    }

    unsafe fn never_run(_observer: NonNull<ObserverHeader>) -> Step {
        violation!("a combinator child was submitted to an executor");
    }

    unsafe fn combine(combinator: *mut AnyCombinator<V, E>, outcome: Outcome<V, E>) -> Step {
        // Safety: the pending count keeps the combinator alive for the
        // duration of this call.
        unsafe {
            match outcome {
                Outcome::Value(value) => {
                    // First success wins, under either policy.
                    if (*combinator).state.swap(1, Ordering::AcqRel) & 1 == 0 {
                        let producer = (*combinator)
                            .target
                            .with_mut(|t| (*t).take())
                            .expect("target already completed");
                        return producer.complete_step(Outcome::Value(value));
                    }
                    Step::Idle
                }
                failure => match (*combinator).policy {
                    Policy::FirstFail => {
                        if (*combinator)
                            .stash_state
                            .compare_exchange(
                                STASH_EMPTY,
                                STASH_CLAIMED,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            )
                            .is_ok()
                        {
                            (*combinator).stash.with_mut(|stash| *stash = Some(failure));
                            (*combinator)
                                .stash_state
                                .store(STASH_STORED, Ordering::Release);
                        }
                        Step::Idle
                    }
                    Policy::LastFail => {
                        // The final failure (with no success flagged)
                        // observes exactly 2 and completes the target.
                        if (*combinator).state.fetch_sub(2, Ordering::AcqRel) == 2 {
                            let producer = (*combinator)
                                .target
                                .with_mut(|t| (*t).take())
                                .expect("target already completed");
                            return producer.complete_step(failure);
                        }
                        Step::Idle
                    }
                },
            }
        }
    }

    /// Last child standing: under FirstFail with no success, surface
    /// the stashed failure; then free everything.
    unsafe fn finalize(combinator: *mut AnyCombinator<V, E>) -> Step {
        // Safety: the pending count reached zero; this thread owns the
        // structure exclusively (the acquire fence in `sub_eq` makes
        // every child's stash write visible).
        unsafe {
            let combinator = Box::from_raw(combinator);
            drop(combinator.children.with_mut(|children| (*children).take()));
            let step = match combinator.target.with_mut(|t| (*t).take()) {
                Some(producer) => {
                    debug_assert_eq!(
                        combinator.stash_state.load(Ordering::Relaxed),
                        STASH_STORED,
                        "no success and no stashed failure"
                    );
                    let failure = combinator
                        .stash
                        .with_mut(|stash| (*stash).take())
                        .expect("stash empty at finalize");
                    producer.complete_step(failure)
                }
                None => Step::Idle,
            };
            step
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::outcome::Failure;

    #[test]
    fn first_success_wins() {
        let (p1, c1) = completion::<u32, &'static str>();
        let (p2, c2) = completion::<u32, &'static str>();
        let any = when_any(vec![c1, c2], Policy::FirstFail);
        p2.complete_value(2);
        p1.complete_value(1);
        assert_eq!(any.try_take().unwrap(), Outcome::Value(2));
    }

    #[test]
    fn success_after_failures_still_wins() {
        let (p1, c1) = completion::<u32, &'static str>();
        let (p2, c2) = completion::<u32, &'static str>();
        let (p3, c3) = completion::<u32, &'static str>();
        let any = when_any(vec![c1, c2, c3], Policy::FirstFail);
        p1.complete_error("first");
        p2.complete_error("second");
        p3.complete_value(3);
        assert_eq!(any.try_take().unwrap(), Outcome::Value(3));
    }

    #[test]
    fn first_fail_policy_surfaces_the_first_failure() {
        let (p1, c1) = completion::<u32, &'static str>();
        let (p2, c2) = completion::<u32, &'static str>();
        let any = when_any(vec![c1, c2], Policy::FirstFail);
        p1.complete_error("first");
        p2.complete_error("second");
        assert_eq!(any.try_take().unwrap(), Outcome::Error("first"));
    }

    #[test]
    fn last_fail_policy_surfaces_the_last_failure() {
        let (p1, c1) = completion::<u32, &'static str>();
        let (p2, c2) = completion::<u32, &'static str>();
        let any = when_any(vec![c1, c2], Policy::LastFail);
        p1.complete_error("first");
        p2.complete_error("second");
        assert_eq!(any.try_take().unwrap(), Outcome::Error("second"));
    }

    #[test]
    fn ready_source_completes_during_registration() {
        let ready = UniqueCompletion::<u32, &'static str>::ready(Outcome::Value(7));
        let (_pending_producer, pending) = completion::<u32, &'static str>();
        let any = when_any(vec![ready, pending], Policy::FirstFail);
        assert_eq!(any.try_take().unwrap(), Outcome::Value(7));
    }

    #[test]
    fn abandonment_is_a_failure_lane() {
        let (dropped, c1) = completion::<u32, &'static str>();
        let any = when_any(vec![c1], Policy::FirstFail);
        drop(dropped);
        match any.try_take().unwrap().ok() {
            Err(Failure::Panicked(exception)) => assert!(exception.is_abandoned()),
            other => panic!("expected abandonment, got {other:?}"),
        }
    }

    #[test]
    #[should_panic(expected = "at least one source")]
    fn empty_input_is_a_violation() {
        let _ = when_any(Vec::<UniqueCompletion<u32, ()>>::new(), Policy::FirstFail);
    }

    #[test]
    fn racing_successes_yield_exactly_one_winner() {
        let pairs: Vec<_> = (0..16).map(|_| completion::<usize, ()>()).collect();
        let (producers, consumers): (Vec<_>, Vec<_>) = pairs.into_iter().unzip();
        let any = when_any(consumers, Policy::FirstFail);
        let handles: Vec<_> = producers
            .into_iter()
            .enumerate()
            .map(|(i, producer)| std::thread::spawn(move || producer.complete_value(i)))
            .collect();
        let value = match any.get() {
            Outcome::Value(value) => value,
            other => panic!("unexpected {other:?}"),
        };
        assert!(value < 16);
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
