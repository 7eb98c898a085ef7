// Copyright 2026 the handoff contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! `when_all` and `join`: complete once every source has.
//!
//! Each source gets its own child observer carrying its index, so
//! values land in disjoint output slots and the result is in **source
//! order** no matter which source resolves last. Failures use a
//! first-wins exchange: exactly one failure propagates, the rest are
//! suppressed.
//!
//! The combinator is reference-counted by its children; whichever child
//! fires last finalizes (completing the target if no failure already
//! did) and frees the whole structure, handing the target's
//! continuation back to the trampoline instead of recursing into it.

use crate::cell::{drive, ObserverHeader, ObserverVTable, Step, Tag};
use crate::fanin::sub_eq;
use crate::loom::cell::UnsafeCell;
use crate::loom::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use crate::outcome::Outcome;
use crate::unique::{completion, Producer, UniqueCompletion};
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::ptr::NonNull;

/// Completes with every source's value, in source order, once all of
/// them resolved — or with the first observed failure.
#[must_use]
pub fn when_all<V, E>(sources: Vec<UniqueCompletion<V, E>>) -> UniqueCompletion<Vec<V>, E>
where
    V: Send + 'static,
    E: Send + 'static,
{
    if sources.is_empty() {
        return UniqueCompletion::ready(Outcome::Value(Vec::new()));
    }
    let (producer, consumer) = completion::<Vec<V>, E>();
    let n = sources.len();

    let combinator = Box::into_raw(Box::new(AllCombinator {
        pending: AtomicUsize::new(n),
        failed: AtomicBool::new(false),
        target: UnsafeCell::new(Some(producer)),
        slots: (0..n).map(|_| UnsafeCell::new(None)).collect(),
        children: UnsafeCell::new(None),
    }));

    let children: Box<[AllChild<V, E>]> = sources
        .into_iter()
        .enumerate()
        .map(|(index, source)| AllChild {
            observer: ObserverHeader {
                vtable: &AllChild::<V, E>::VTABLE,
            },
            index,
            source: UnsafeCell::new(Some(source)),
            combinator,
        })
        .collect();
    let children_base = attach_children(combinator, children);

    // Safety: a child cannot fire before its own attach below, so the
    // combinator (which counts all n children) outlives this loop.
    for index in 0..n {
        unsafe { attach_child::<AllChild<V, E>>(children_base.add(index)) };
    }
    consumer
}

/// Completes with `()` once every source resolved, propagating the
/// first observed failure and ignoring values.
#[must_use]
pub fn join<V, E>(sources: Vec<UniqueCompletion<V, E>>) -> UniqueCompletion<(), E>
where
    V: Send + 'static,
    E: Send + 'static,
{
    when_all(sources).then(Outcome::void)
}

struct AllCombinator<V, E> {
    pending: AtomicUsize,
    failed: AtomicBool,
    target: UnsafeCell<Option<Producer<Vec<V>, E>>>,
    slots: Box<[UnsafeCell<Option<V>>]>,
    children: UnsafeCell<Option<Box<[AllChild<V, E>]>>>,
}

#[repr(C)]
struct AllChild<V, E> {
    /// Must be the first field so the attach word can recover the node.
    observer: ObserverHeader,
    index: usize,
    source: UnsafeCell<Option<UniqueCompletion<V, E>>>,
    combinator: *mut AllCombinator<V, E>,
}

/// Stores `children` into the combinator (which owns and later frees
/// them) and returns the stable base pointer of the slice.
fn attach_children<V, E>(
    combinator: *mut AllCombinator<V, E>,
    children: Box<[AllChild<V, E>]>,
) -> *mut AllChild<V, E> {
    // Safety: the combinator was just allocated and is not yet shared.
    unsafe {
        (*combinator).children.with_mut(|slot| {
            *slot = Some(children);
            (*slot).as_mut().expect("just stored").as_mut_ptr()
        })
    }
}

/// Registers one child node against its source cell, delivering in
/// place when the source already resolved.
///
/// # Safety
///
/// `child` must point into a live, fully initialized child slice whose
/// node type `C` starts with an `ObserverHeader` and holds its source
/// handle.
pub(super) unsafe fn attach_child<C: ChildNode>(child: *mut C) {
    // Safety: promised by the caller; the source handle keeps the
    // source header alive through the attach.
    unsafe {
        let observer = NonNull::new_unchecked(child.cast::<ObserverHeader>());
        let attached = (*child)
            .source_header()
            .machine
            .try_attach(observer, Tag::Inline);
        if !attached {
            drive(Step::Resolve(observer));
        }
    }
}

/// Minimal surface `attach_child` needs from a combinator child node.
pub(super) trait ChildNode {
    /// # Safety
    ///
    /// Only callable while the node still owns its source handle.
    unsafe fn source_header(&self) -> &crate::cell::CellHeader;
}

impl<V, E> ChildNode for AllChild<V, E> {
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

impl<V, E> AllChild<V, E>
where
    V: Send + 'static,
    E: Send + 'static,
{
    const VTABLE: ObserverVTable = ObserverVTable {
        resolved: Self::resolved,
        run: Self::never_run,
        // An abandoned source still resolved (with the abandonment
        // exception); combine it like any failure.
        abandoned: Self::resolved,
    };

    unsafe fn resolved(observer: NonNull<ObserverHeader>) -> Step {
        // Safety: fired exactly once; header is the node's first field.
        unsafe {
            let this = observer.as_ptr().cast::<Self>();
            let combinator = (*this).combinator;
            let index = (*this).index;
            let source = (*this)
                .source
                .with_mut(|s| (*s).take())
                .expect("child fired twice");
            let outcome = source.take_resolved();

            let mut step = Step::Idle;
            match outcome {
                Outcome::Value(value) => {
                    // Index-disjoint slots: no two children share one.
                    (*combinator).slots[index].with_mut(|slot| *slot = Some(value));
                }
                failure => {
                    if !(*combinator).failed.swap(true, Ordering::AcqRel) {
                        let producer = (*combinator)
                            .target
                            .with_mut(|t| (*t).take())
                            .expect("target already completed");
                        step = producer.complete_step(failure.retag());
                    }
                }
            }

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

    /// Last child standing: complete the target (unless a failure beat
    /// us to it) and free the combinator and its children.
    unsafe fn finalize(combinator: *mut AllCombinator<V, E>) -> Step {
        // Safety: the pending count reached zero, so no other thread
        // touches this structure again.
        unsafe {
            let combinator = Box::from_raw(combinator);
            drop(combinator.children.with_mut(|children| (*children).take()));
            match combinator.target.with_mut(|t| (*t).take()) {
                Some(producer) => {
                    let values: Vec<V> = combinator
                        .slots
                        .iter()
                        .map(|slot| slot.with_mut(|s| (*s).take()).expect("missing value"))
                        .collect();
                    producer.complete_step(Outcome::Value(values))
                }
                None => Step::Idle,
            }
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::outcome::Failure;
    use std::time::Duration;

    #[test]
    fn empty_input_is_immediately_ready() {
        let all = when_all(Vec::<UniqueCompletion<u32, ()>>::new());
        assert_eq!(all.try_take().unwrap(), Outcome::Value(Vec::new()));
    }

    #[test]
    fn values_arrive_in_source_order() {
        // One source resolved before registration, one resolved after a
        // delay: the output order follows the sources, not the races.
        let first = UniqueCompletion::<u32, ()>::ready(Outcome::Value(10));
        let (producer, second) = completion::<u32, ()>();
        let all = when_all(vec![first, second]);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(5));
            producer.complete_value(20);
        });
        assert_eq!(all.get(), Outcome::Value(vec![10, 20]));
        handle.join().unwrap();
    }

    #[test]
    fn exactly_one_failure_propagates() {
        let sources: Vec<_> = (0..4).map(|_| completion::<u32, &'static str>()).collect();
        let (producers, consumers): (Vec<_>, Vec<_>) = sources.into_iter().unzip();
        let all = when_all(consumers);
        let mut failed = 0;
        for (i, producer) in producers.into_iter().enumerate() {
            if i % 2 == 0 {
                producer.complete_error("broken");
                failed += 1;
            } else {
                producer.complete_value(i as u32);
            }
        }
        assert_eq!(failed, 2);
        assert_eq!(all.try_take().unwrap(), Outcome::Error("broken"));
    }

    #[test]
    fn abandonment_counts_as_a_failure() {
        let (kept, consumer_a) = completion::<u32, ()>();
        let (dropped, consumer_b) = completion::<u32, ()>();
        let all = when_all(vec![consumer_a, consumer_b]);
        drop(dropped);
        kept.complete_value(1);
        match all.try_take().unwrap().ok() {
            Err(Failure::Panicked(exception)) => assert!(exception.is_abandoned()),
            other => panic!("expected abandonment, got {other:?}"),
        }
    }

    #[test]
    fn join_discards_values_and_keeps_failures() {
        let (p1, c1) = completion::<u32, &'static str>();
        let (p2, c2) = completion::<u32, &'static str>();
        let joined = join(vec![c1, c2]);
        p1.complete_value(1);
        p2.complete_value(2);
        assert_eq!(joined.try_take().unwrap(), Outcome::Value(()));

        let (p3, c3) = completion::<u32, &'static str>();
        let joined = join(vec![c3]);
        p3.complete_error("bad");
        assert_eq!(joined.try_take().unwrap(), Outcome::Error("bad"));
    }

    #[test]
    fn many_sources_resolved_from_many_threads() {
        let pairs: Vec<_> = (0..32).map(|_| completion::<usize, ()>()).collect();
        let (producers, consumers): (Vec<_>, Vec<_>) = pairs.into_iter().unzip();
        let all = when_all(consumers);
        let handles: Vec<_> = producers
            .into_iter()
            .enumerate()
            .map(|(i, producer)| std::thread::spawn(move || producer.complete_value(i)))
            .collect();
        let values = match all.get() {
            Outcome::Value(values) => values,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(values, (0..32).collect::<Vec<_>>());
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
