//! Concurrency primitives: a queued spinlock guarding shared kernel data
//! (the PFN database, chiefly) and an RAII runlevel-raising guard modelling
//! IRQL-style priority inversion avoidance.
//!
//! Grounded on `kernel/src/out/terminal.rs`, `kernel/src/mem/sysalloc.rs`,
//! and `kernel/src/memm/talloc.rs`'s direct use of `spin::Mutex` for the
//! "wrap a spinlock around shared mutable state" idiom, generalized into a
//! queued (ticket) variant and paired with a runlevel guard for FIFO
//! fairness and runlevel-raise/restore semantics a plain `spin::Mutex`
//! doesn't provide.

pub mod runlevel;
pub mod spinlock;

pub use runlevel::{RaiseRunLevel, RunLevel};
pub use spinlock::{QueuedSpinLock, QueuedSpinLockGuard};
