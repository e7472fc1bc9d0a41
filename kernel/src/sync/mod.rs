//! Synchronization primitives
//!
//! Spinlocks for short critical sections, counting semaphores and mutexes
//! for sleeping waits, bounded mailboxes for message passing, and the
//! single-slot waiter that underlies every blockable resource.

pub mod mailbox;
pub mod semaphore;
pub mod spinlock;
pub mod waiter;

pub use mailbox::Mailbox;
pub use semaphore::{Mutex, Semaphore};
pub use spinlock::{SpinLock, SpinLockGuard};
pub use waiter::WaitSlot;
