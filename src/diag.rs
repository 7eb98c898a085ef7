// Copyright 2026 the handoff contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Contract-violation reporting.
//!
//! Misusing the completion protocol (resolving a cell twice, attaching a
//! second observer, destroying an unresolved unique cell, ...) is not a
//! recoverable runtime error. Violations invoke the pluggable hook and
//! then abort the process by panicking, in every build profile.

/// Callback invoked before the process aborts on a contract violation.
///
/// The hook receives a static description of the violated contract. It
/// may log, flush buffers, or capture a backtrace; the panic happens
/// regardless of what the hook does.
pub type ViolationHook = fn(&'static str);

static HOOK: spin::Mutex<Option<ViolationHook>> = spin::Mutex::new(None);

/// Installs a process-wide hook observing contract violations.
///
/// Replaces any previously installed hook.
pub fn set_violation_hook(hook: ViolationHook) {
    *HOOK.lock() = Some(hook);
}

#[cold]
#[inline(never)]
pub(crate) fn violation(what: &'static str) -> ! {
    tracing::error!(target: "handoff::diag", "contract violation: {what}");
    let hook = *HOOK.lock();
    if let Some(hook) = hook {
        hook(what);
    }
    panic!("handoff contract violation: {what}");
}

macro_rules! violation {
    ($what:literal) => {
        $crate::diag::violation($what)
    };
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::{AtomicUsize, Ordering};

    static SEEN: AtomicUsize = AtomicUsize::new(0);

    fn count_hook(_what: &'static str) {
        SEEN.fetch_add(1, Ordering::Relaxed);
    }

    #[test]
    fn hook_fires_before_abort() {
        super::set_violation_hook(count_hook);
        let result = std::panic::catch_unwind(|| violation!("test violation"));
        assert!(result.is_err());
        // Other tests may trip violations while the hook is installed,
        // so only a lower bound is stable here.
        assert!(SEEN.load(Ordering::Relaxed) >= 1);
        *super::HOOK.lock() = None;
    }
}
