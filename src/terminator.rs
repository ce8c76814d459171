/*
 * SPDX-FileCopyrightText: 2024-2025 The delta-applier Authors
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! Process-wide "block exit" flag. The applier engages it around
//! non-idempotent steps and checkpoint writes; the host's shutdown path
//! checks it before exiting and re-checks once it is released. Actually
//! terminating the process is the host's job.

use std::sync::atomic::{AtomicBool, Ordering};

static EXIT_BLOCKED: AtomicBool = AtomicBool::new(false);
static EXIT_REQUESTED: AtomicBool = AtomicBool::new(false);

pub struct Terminator;

impl Terminator {
    pub fn set_exit_blocked(blocked: bool) {
        EXIT_BLOCKED.store(blocked, Ordering::SeqCst);
    }

    pub fn exit_blocked() -> bool {
        EXIT_BLOCKED.load(Ordering::SeqCst)
    }

    /// Record that the host wants to shut down. Returns whether the exit may
    /// proceed immediately, i.e. no critical section is in progress.
    pub fn request_exit() -> bool {
        EXIT_REQUESTED.store(true, Ordering::SeqCst);
        !Self::exit_blocked()
    }

    pub fn exit_requested() -> bool {
        EXIT_REQUESTED.load(Ordering::SeqCst)
    }

    /// RAII guard that releases the exit block when dropped.
    pub fn scoped_unblocker() -> ScopedExitUnblocker {
        ScopedExitUnblocker
    }
}

pub struct ScopedExitUnblocker;

impl Drop for ScopedExitUnblocker {
    fn drop(&mut self) {
        Terminator::set_exit_blocked(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scoped_unblocker_releases_on_drop() {
        Terminator::set_exit_blocked(true);
        {
            let _unblocker = Terminator::scoped_unblocker();
            assert!(Terminator::exit_blocked());
        }
        assert!(!Terminator::exit_blocked());
    }
}
