//! # StrandKV Fiber Engine
//!
//! Stackful, single-threaded, cooperative scheduler. Fibers suspend only
//! at explicit points (`yield_now`, `block`, the server's suspending I/O
//! wrappers); there is no preemption, so code between suspension points
//! never observes another fiber's partial mutations.
//!
//! ## Design Principles
//!
//! 1. **Per-Fiber Stacks**: Each fiber owns a fixed stack and suspension
//!    is a register swap (via `corosensei`), so any number of fibers share
//!    one OS thread without copying live stacks around.
//! 2. **Explicit Block/Wake**: A fiber parks itself with [`Engine::block`]
//!    and is made runnable again by [`Engine::wake`]; waking never
//!    switches, it only moves the fiber between the intrusive lists.
//! 3. **Idle Hook**: When nothing is runnable the engine invokes a
//!    user-supplied hook, which is where the server runs `epoll_wait`.
//! 4. **Thread Affinity**: The engine is `!Send`; every fiber runs on the
//!    thread that called [`Engine::start`].
//!
//! A fiber that panics tears the whole engine down: the panic propagates
//! out of `start` on the hosting thread. A fiber that overflows its fixed
//! stack is fatal for the process.

mod fiber;

pub mod engine;

pub use engine::{Engine, FiberId};

/// Default fiber stack size: plenty for an I/O-bound worker that keeps a
/// 4 KiB socket buffer on its stack.
pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;
