//! Corosensei-backed fiber primitive: one fixed stack per fiber and a
//! thread-local channel back to the suspension point.

use std::cell::Cell;

use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};

thread_local! {
    /// Raw pointer to the running fiber's `Yielder`.
    ///
    /// Installed at the top of the fiber body and re-installed after every
    /// suspension, because another fiber may have overwritten it while this
    /// one was parked.
    ///
    /// Safety: the pointer is valid only while its fiber is running; it is
    /// stored as `*const ()` to erase the borrow of the coroutine body.
    static CURRENT_YIELDER: Cell<Option<*const ()>> = const { Cell::new(None) };
}

/// Suspends the running fiber, handing control back to the scheduler.
///
/// # Panics
///
/// Panics when called from outside a fiber body.
pub(crate) fn suspend_current() {
    CURRENT_YIELDER.with(|cell| {
        let ptr = cell
            .get()
            .expect("fiber suspension requested outside a fiber");
        // Safety: installed by the running fiber's own body; the Yielder is
        // borrowed for the duration of this resume.
        let yielder: &Yielder<(), ()> = unsafe { &*(ptr as *const Yielder<(), ()>) };
        yielder.suspend(());
        // Re-install after resume; a sibling fiber ran in the meantime.
        cell.set(Some(ptr));
    });
}

/// A fiber's coroutine object: its stack plus saved register state.
pub(crate) struct FiberCoro {
    coro: Coroutine<(), (), ()>,
}

impl FiberCoro {
    /// Creates a fiber that will run `body` on a fresh fixed stack.
    ///
    /// Stack allocation failure is fatal for the engine.
    pub(crate) fn new<F>(stack_size: usize, body: F) -> Self
    where
        F: FnOnce() + 'static,
    {
        let stack = DefaultStack::new(stack_size).expect("failed to allocate fiber stack");
        let coro = Coroutine::with_stack(stack, move |yielder: &Yielder<(), ()>, _input: ()| {
            let ptr = yielder as *const Yielder<(), ()> as *const ();
            CURRENT_YIELDER.with(|cell| cell.set(Some(ptr)));
            body();
            CURRENT_YIELDER.with(|cell| cell.set(None));
        });
        FiberCoro { coro }
    }

    /// Runs the fiber until its next suspension point.
    ///
    /// Returns true when the fiber's body returned; the slot can be freed.
    pub(crate) fn resume(&mut self) -> bool {
        match self.coro.resume(()) {
            CoroutineResult::Yield(()) => false,
            CoroutineResult::Return(()) => true,
        }
    }
}
