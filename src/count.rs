// Copyright 2026 the handoff contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Intrusive reference-count strategies, installed per allocation
//! through the cell vtable.
//!
//! Two strategies exist:
//!
//! - **shared**: relaxed increments; decrements use release ordering and
//!   escalate to an acquire fence only on the path that observed zero,
//!   so destruction is correctly ordered without paying a full
//!   synchronizing cost on every decrement;
//! - **unique**: for cells with exactly one structural owner. There is
//!   nothing to count: retaining is a contract violation and releasing
//!   always destroys.
//!
//! "Adopting" a baked-in reference without incrementing is
//! [`CoreRef::adopt`](crate::cell::CoreRef::adopt), which asserts the
//! reference exists instead of performing a no-op increment.

use crate::cell::CellHeader;
use crate::loom::sync::atomic::{fence, Ordering};
use alloc::boxed::Box;
use core::ptr::NonNull;

/// Relaxed increment of a shared allocation's count.
///
/// # Safety
///
/// `header` must point at a live allocation whose count is at least one.
pub(crate) unsafe fn retain_shared(header: NonNull<CellHeader>) {
    // Safety: liveness promised by the caller.
    let prev = unsafe { header.as_ref() }
        .count
        .fetch_add(1, Ordering::Relaxed);
    debug_assert!(prev >= 1, "retained a dead cell");
}

/// Release decrement; destroys the allocation as a `Box<T>` when this
/// was the final reference.
///
/// # Safety
///
/// `header` must point at a live allocation of concrete type `T` whose
/// first field is its [`CellHeader`].
pub(crate) unsafe fn release_shared<T>(header: NonNull<CellHeader>) -> bool {
    // Safety: liveness promised by the caller.
    if unsafe { header.as_ref() }
        .count
        .fetch_sub(1, Ordering::Release)
        == 1
    {
        fence(Ordering::Acquire);
        // Safety: the count reached zero, so this thread owns the
        // allocation exclusively; `T`'s header sits at offset zero.
        drop(unsafe { Box::from_raw(header.cast::<T>().as_ptr()) });
        true
    } else {
        false
    }
}

/// A unique-owner cell is never retained; doing so is a misuse of the
/// single-owner contract.
///
/// # Safety
///
/// Callable with any pointer; it never dereferences.
pub(crate) unsafe fn retain_unique(_header: NonNull<CellHeader>) {
    violation!("retained a unique-owner completion cell");
}

/// Releasing the single structural owner always destroys.
///
/// # Safety
///
/// As [`release_shared`], plus: the caller must really be the single
/// owner.
pub(crate) unsafe fn release_unique<T>(header: NonNull<CellHeader>) -> bool {
    // Safety: single ownership promised by the caller.
    drop(unsafe { Box::from_raw(header.cast::<T>().as_ptr()) });
    true
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::cell::{CellVTable, Core, CoreRef};

    #[repr(C)]
    struct PlainCell {
        core: Core<u32, ()>,
    }

    impl PlainCell {
        const SHARED: CellVTable = CellVTable {
            retain: retain_shared,
            release: release_shared::<PlainCell>,
        };
    }

    #[test]
    fn shared_count_destroys_on_last_release() {
        let (_, handle) = unsafe {
            crate::cell::allocate::<PlainCell, u32, ()>(PlainCell {
                core: Core::ready(&PlainCell::SHARED, 1, crate::outcome::Outcome::Value(5)),
            })
        };
        let second: CoreRef<u32, ()> = handle.clone();
        drop(handle);
        // The clone still owns the cell; the slot is intact.
        assert!(second.core().machine().is_resolved());
        drop(second);
    }

    #[test]
    #[should_panic(expected = "unique-owner")]
    fn unique_cells_cannot_be_retained() {
        #[repr(C)]
        struct UniqueCell {
            core: Core<u32, ()>,
        }
        const UNIQUE: CellVTable = CellVTable {
            retain: retain_unique,
            release: release_unique::<UniqueCell>,
        };
        let (_, handle) = unsafe {
            crate::cell::allocate::<UniqueCell, u32, ()>(UniqueCell {
                core: Core::ready(&UNIQUE, 1, crate::outcome::Outcome::Value(5)),
            })
        };
        let _clone = handle.clone();
    }
}
