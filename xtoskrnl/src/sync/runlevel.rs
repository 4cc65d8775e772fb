//! Runlevel raise/restore: an IRQL-style priority discipline guarding code
//! that must not be preempted by certain interrupt classes while it holds a
//! `QueuedSpinLock`.
//!
//! `kernel/src/init.rs`'s interrupt handlers are naked assembly stubs with no
//! priority scheme above "interrupts on or off", so there's no prior runlevel
//! concept to generalize here; this is built in the idiom the rest of the
//! kernel already uses for RAII guards (`QueuedSpinLockGuard`): a guard type
//! whose `Drop` restores the prior state, constructed by a `raise` function
//! that never fails.

use core::sync::atomic::{AtomicU8, Ordering};

/// Runlevels, ascending in priority: ordinary kernel code, device-interrupt
/// level, and the highest level used while the PFN database or page tables
/// are being mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum RunLevel {
    Passive = 0,
    DispatchLevel = 1,
    HighLevel = 2,
}

impl RunLevel {
    const fn from_u8(v: u8) -> Self {
        match v {
            0 => RunLevel::Passive,
            1 => RunLevel::DispatchLevel,
            _ => RunLevel::HighLevel,
        }
    }
}

static CURRENT_RUN_LEVEL: AtomicU8 = AtomicU8::new(RunLevel::Passive as u8);

/// Returns the runlevel the calling CPU is currently executing at.
pub fn current_run_level() -> RunLevel {
    RunLevel::from_u8(CURRENT_RUN_LEVEL.load(Ordering::Acquire))
}

/// RAII guard raising the runlevel for its lifetime. Dropping it restores
/// whatever runlevel was active before the raise; raising and lowering must
/// nest, a lower level is never restored out of order.
///
/// # Panics
/// `RaiseRunLevel::to` panics if asked to raise to a level at or below the
/// current one -- runlevel is a strictly-ascending discipline while held.
pub struct RaiseRunLevel {
    previous: RunLevel,
}

impl RaiseRunLevel {
    /// Raises the current CPU's runlevel to `target`, returning a guard that
    /// restores the previous runlevel on drop.
    pub fn to(target: RunLevel) -> Self {
        let previous = current_run_level();
        assert!(
            target > previous,
            "runlevel must strictly ascend: attempted to raise to a level at or below the current one"
        );
        CURRENT_RUN_LEVEL.store(target as u8, Ordering::Release);
        RaiseRunLevel { previous }
    }

    pub fn previous(&self) -> RunLevel {
        self.previous
    }
}

impl Drop for RaiseRunLevel {
    fn drop(&mut self) {
        CURRENT_RUN_LEVEL.store(self.previous as u8, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raise_and_restore_nests_correctly() {
        assert_eq!(current_run_level(), RunLevel::Passive);
        {
            let _g1 = RaiseRunLevel::to(RunLevel::DispatchLevel);
            assert_eq!(current_run_level(), RunLevel::DispatchLevel);
            {
                let _g2 = RaiseRunLevel::to(RunLevel::HighLevel);
                assert_eq!(current_run_level(), RunLevel::HighLevel);
            }
            assert_eq!(current_run_level(), RunLevel::DispatchLevel);
        }
        assert_eq!(current_run_level(), RunLevel::Passive);
    }

    #[test]
    #[should_panic(expected = "runlevel must strictly ascend")]
    fn raising_to_a_lower_or_equal_level_panics() {
        let _g1 = RaiseRunLevel::to(RunLevel::HighLevel);
        let _g2 = RaiseRunLevel::to(RunLevel::DispatchLevel);
    }
}
