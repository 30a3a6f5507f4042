//! # Cooperative Scheduler
//!
//! The engine keeps fibers in two intrusive, index-linked lists: `alive`
//! (runnable, the running fiber included) and `blocked`. Links are arena
//! indices into a slot vector, and every handle carries a generation so a
//! stale [`FiberId`] can never reach a recycled slot.
//!
//! The scheduler itself runs as a trampoline on the host thread's stack: a
//! suspending fiber returns control here together with an optional switch
//! hint (set by `spawn` and `switch_to`), and the trampoline resumes the
//! hinted fiber or applies the yield policy. Spawn pushes the new fiber at
//! the head of `alive`, so its first suspension hands control back to its
//! spawner.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::trace;

use crate::fiber::{suspend_current, FiberCoro};
use crate::DEFAULT_STACK_SIZE;

/// Generation-checked handle to a fiber.
///
/// Handles stay valid to hold after the fiber terminates; operations on a
/// stale handle are silent no-ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiberId {
    index: usize,
    gen: u32,
}

/// Per-fiber slot in the scheduler arena.
struct Slot {
    /// Taken out while the fiber is running on the trampoline.
    coro: Option<FiberCoro>,
    /// Set while the fiber sits on the `blocked` list.
    blocked: bool,
    /// Intrusive links within whichever list the fiber is on.
    prev: Option<usize>,
    next: Option<usize>,
}

/// Scheduler state shared between the trampoline and fiber-side calls.
struct Sched {
    slots: Vec<Option<Slot>>,
    /// Generation per slot index; bumped on every reuse.
    gens: Vec<u32>,
    /// Recycled slot indices.
    free: Vec<usize>,
    /// Head of the runnable list (LIFO; the running fiber stays linked).
    alive: Option<usize>,
    /// Head of the blocked list.
    blocked: Option<usize>,
    /// The running fiber, `None` while the trampoline or idle hook runs.
    current: Option<usize>,
    /// One-shot switch target consumed by the next scheduling decision.
    hint: Option<usize>,
    /// Stack size for newly spawned fibers.
    stack_size: usize,
}

impl Sched {
    fn new(stack_size: usize) -> Self {
        Sched {
            slots: Vec::new(),
            gens: Vec::new(),
            free: Vec::new(),
            alive: None,
            blocked: None,
            current: None,
            hint: None,
            stack_size,
        }
    }

    fn is_live(&self, id: FiberId) -> bool {
        id.index < self.slots.len()
            && self.slots[id.index].is_some()
            && self.gens[id.index] == id.gen
    }

    /// Detaches `idx` from whichever list it is on.
    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let slot = self.slots[idx].as_ref().expect("linked slot exists");
            (slot.prev, slot.next)
        };

        if let Some(prev_idx) = prev {
            if let Some(prev_slot) = self.slots[prev_idx].as_mut() {
                prev_slot.next = next;
            }
        } else if self.alive == Some(idx) {
            self.alive = next;
        } else if self.blocked == Some(idx) {
            self.blocked = next;
        }

        if let Some(next_idx) = next {
            if let Some(next_slot) = self.slots[next_idx].as_mut() {
                next_slot.prev = prev;
            }
        }

        if let Some(slot) = self.slots[idx].as_mut() {
            slot.prev = None;
            slot.next = None;
        }
    }

    /// Pushes `idx` at the head of the `alive` list.
    fn push_alive(&mut self, idx: usize) {
        let head = self.alive;
        if let Some(slot) = self.slots[idx].as_mut() {
            slot.prev = None;
            slot.next = head;
        }
        if let Some(head_idx) = head {
            if let Some(head_slot) = self.slots[head_idx].as_mut() {
                head_slot.prev = Some(idx);
            }
        }
        self.alive = Some(idx);
    }

    /// Pushes `idx` at the head of the `blocked` list.
    fn push_blocked(&mut self, idx: usize) {
        let head = self.blocked;
        if let Some(slot) = self.slots[idx].as_mut() {
            slot.prev = None;
            slot.next = head;
        }
        if let Some(head_idx) = head {
            if let Some(head_slot) = self.slots[head_idx].as_mut() {
                head_slot.prev = Some(idx);
            }
        }
        self.blocked = Some(idx);
    }

    /// Allocates a slot for a fresh fiber and links it runnable.
    fn insert(&mut self, coro: FiberCoro) -> FiberId {
        let idx = match self.free.pop() {
            Some(idx) => {
                self.gens[idx] = self.gens[idx].wrapping_add(1);
                idx
            }
            None => {
                self.slots.push(None);
                self.gens.push(0);
                self.slots.len() - 1
            }
        };

        self.slots[idx] = Some(Slot {
            coro: Some(coro),
            blocked: false,
            prev: None,
            next: None,
        });
        self.push_alive(idx);
        FiberId {
            index: idx,
            gen: self.gens[idx],
        }
    }

    /// Frees a terminated fiber's slot.
    fn remove(&mut self, idx: usize) {
        self.unlink(idx);
        self.slots[idx] = None;
        self.free.push(idx);
    }

    /// Applies the yield policy: the switch hint if one is pending, else
    /// the head of `alive` (skipping to the successor when the head is the
    /// fiber that just suspended), else that same fiber if it is the only
    /// runnable one.
    fn pick(&mut self, last: Option<usize>) -> Option<usize> {
        if let Some(hinted) = self.hint.take() {
            return Some(hinted);
        }

        let mut cand = self.alive;
        if cand.is_some() && cand == last {
            cand = self.slots[cand.expect("checked")]
                .as_ref()
                .and_then(|slot| slot.next);
        }
        if cand.is_some() {
            return cand;
        }

        match last {
            Some(idx) if self.alive == Some(idx) => Some(idx),
            _ => None,
        }
    }
}

/// Handle to the cooperative engine.
///
/// Clones share one scheduler; the type is `!Send`, so every clone lives
/// on the thread that drives [`Engine::start`].
#[derive(Clone)]
pub struct Engine {
    sched: Rc<RefCell<Sched>>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    /// Creates an engine with the default fiber stack size.
    pub fn new() -> Self {
        Self::with_stack_size(DEFAULT_STACK_SIZE)
    }

    /// Creates an engine whose fibers get `stack_size`-byte stacks.
    pub fn with_stack_size(stack_size: usize) -> Self {
        Engine {
            sched: Rc::new(RefCell::new(Sched::new(stack_size))),
        }
    }

    /// Runs `entry` as the first fiber and drives the scheduler until every
    /// fiber has terminated.
    ///
    /// `idle` is invoked on the scheduler stack whenever no fiber is
    /// runnable but blocked fibers remain; it is expected to perform one
    /// round of external work that may wake fibers (the server runs
    /// `epoll_wait` here) and return.
    pub fn start<F, I>(&self, entry: F, mut idle: I)
    where
        F: FnOnce() + 'static,
        I: FnMut(),
    {
        self.add_fiber(entry);

        let mut last: Option<usize> = None;
        loop {
            let next = self.sched.borrow_mut().pick(last);
            match next {
                Some(idx) => {
                    last = self.run(idx);
                }
                None => {
                    if self.all_blocked() {
                        idle();
                        last = None;
                    } else {
                        break;
                    }
                }
            }
        }
        trace!("engine drained, all fibers terminated");
    }

    /// Spawns a fiber and immediately enters it.
    ///
    /// The new fiber is pushed at the head of the runnable list; when it
    /// first suspends, control returns here and `spawn` returns its id.
    /// Called from outside any fiber (e.g. the idle hook), it only enqueues
    /// the fiber.
    pub fn spawn<F>(&self, f: F) -> FiberId
    where
        F: FnOnce() + 'static,
    {
        let id = self.add_fiber(f);
        let enter_now = {
            let mut sched = self.sched.borrow_mut();
            if sched.current.is_some() {
                sched.hint = Some(id.index);
                true
            } else {
                false
            }
        };
        if enter_now {
            suspend_current();
        }
        id
    }

    /// Switches to another runnable fiber.
    ///
    /// Policy: enter the head of the runnable list, or its successor when
    /// the head is the calling fiber. If the calling fiber is the only
    /// runnable one this returns immediately without switching; if nothing
    /// is runnable the scheduler enters the idle hook.
    pub fn yield_now(&self) {
        let switch = {
            let sched = self.sched.borrow();
            match sched.current {
                None => false,
                Some(cur) => {
                    let alone = sched.alive == Some(cur)
                        && sched.slots[cur]
                            .as_ref()
                            .map_or(true, |slot| slot.next.is_none());
                    let runnable = sched.slots[cur].as_ref().map_or(false, |slot| !slot.blocked);
                    !(alone && runnable)
                }
            }
        };
        if switch {
            suspend_current();
        }
    }

    /// Switches directly into `target`.
    ///
    /// A silent no-op when `target` is the calling fiber, terminated, or
    /// currently blocked.
    pub fn switch_to(&self, target: FiberId) {
        let switch = {
            let mut sched = self.sched.borrow_mut();
            if !sched.is_live(target)
                || sched.current == Some(target.index)
                || sched.slots[target.index]
                    .as_ref()
                    .map_or(true, |slot| slot.blocked)
            {
                false
            } else {
                sched.hint = Some(target.index);
                sched.current.is_some()
            }
        };
        if switch {
            suspend_current();
        }
    }

    /// Parks the calling fiber: moves it from `alive` to `blocked` and
    /// yields. It runs again only after [`Engine::wake`].
    pub fn block(&self) {
        {
            let mut sched = self.sched.borrow_mut();
            let cur = sched.current.expect("block called outside a fiber");
            let already = sched.slots[cur].as_ref().map_or(true, |slot| slot.blocked);
            if !already {
                if let Some(slot) = sched.slots[cur].as_mut() {
                    slot.blocked = true;
                }
                sched.unlink(cur);
                sched.push_blocked(cur);
            }
        }
        suspend_current();
    }

    /// Makes a blocked fiber runnable again. Never switches.
    ///
    /// Ignores handles that are stale or name a fiber that is not blocked.
    pub fn wake(&self, id: FiberId) {
        let mut sched = self.sched.borrow_mut();
        if !sched.is_live(id) {
            return;
        }
        let blocked = sched.slots[id.index]
            .as_ref()
            .map_or(false, |slot| slot.blocked);
        if blocked {
            if let Some(slot) = sched.slots[id.index].as_mut() {
                slot.blocked = false;
            }
            sched.unlink(id.index);
            sched.push_alive(id.index);
        }
    }

    /// Wakes every fiber on the blocked list.
    pub fn wake_all(&self) {
        let mut sched = self.sched.borrow_mut();
        while let Some(idx) = sched.blocked {
            if let Some(slot) = sched.slots[idx].as_mut() {
                slot.blocked = false;
            }
            sched.unlink(idx);
            sched.push_alive(idx);
        }
    }

    /// True when no fiber is runnable but blocked fibers remain.
    pub fn all_blocked(&self) -> bool {
        let sched = self.sched.borrow();
        sched.alive.is_none() && sched.blocked.is_some()
    }

    /// Handle to the running fiber.
    ///
    /// # Panics
    ///
    /// Panics when called from outside a fiber (the idle hook included).
    pub fn current(&self) -> FiberId {
        let sched = self.sched.borrow();
        let idx = sched.current.expect("current called outside a fiber");
        FiberId {
            index: idx,
            gen: sched.gens[idx],
        }
    }

    fn add_fiber<F>(&self, f: F) -> FiberId
    where
        F: FnOnce() + 'static,
    {
        let stack_size = self.sched.borrow().stack_size;
        let coro = FiberCoro::new(stack_size, f);
        let id = self.sched.borrow_mut().insert(coro);
        trace!(index = id.index, "fiber spawned");
        id
    }

    /// Resumes `idx` until its next suspension; returns it as the "last
    /// suspended" fiber, or `None` when it terminated.
    fn run(&self, idx: usize) -> Option<usize> {
        let mut coro = {
            let mut sched = self.sched.borrow_mut();
            sched.current = Some(idx);
            sched.slots[idx]
                .as_mut()
                .and_then(|slot| slot.coro.take())
                .expect("picked fiber has a coroutine")
        };

        let done = coro.resume();

        let mut sched = self.sched.borrow_mut();
        sched.current = None;
        if done {
            sched.remove(idx);
            trace!(index = idx, "fiber terminated");
            None
        } else {
            if let Some(slot) = sched.slots[idx].as_mut() {
                slot.coro = Some(coro);
            }
            Some(idx)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    type Log = Rc<RefCell<Vec<&'static str>>>;

    fn log() -> Log {
        Rc::new(RefCell::new(Vec::new()))
    }

    #[test]
    fn fiber_without_suspension_runs_to_completion() {
        let engine = Engine::new();
        let ran = Rc::new(Cell::new(false));
        let flag = Rc::clone(&ran);
        engine.start(
            move || flag.set(true),
            || panic!("idle hook must not run when nothing blocks"),
        );
        assert!(ran.get());
    }

    #[test]
    fn spawn_returns_control_on_first_suspension() {
        let engine = Engine::new();
        let order = log();

        let o = Rc::clone(&order);
        let eng = engine.clone();
        engine.start(
            move || {
                o.borrow_mut().push("entry:before");
                let inner = Rc::clone(&o);
                let child_engine = eng.clone();
                eng.spawn(move || {
                    inner.borrow_mut().push("child:first");
                    child_engine.yield_now();
                    inner.borrow_mut().push("child:second");
                });
                o.borrow_mut().push("entry:after-spawn");
            },
            || {},
        );

        assert_eq!(
            *order.borrow(),
            vec![
                "entry:before",
                "child:first",
                "entry:after-spawn",
                "child:second"
            ]
        );
    }

    #[test]
    fn block_and_wake_preserve_fiber_locals() {
        let engine = Engine::new();
        let observed = Rc::new(Cell::new(0u64));

        let eng = engine.clone();
        let out = Rc::clone(&observed);
        engine.start(
            move || {
                let waker = eng.clone();
                let result = Rc::clone(&out);
                let blocker = eng.clone();
                let id = eng.spawn(move || {
                    let local = 0xDEAD_BEEF_u64;
                    let marker = [7u8; 32];
                    blocker.block();
                    // Locals must survive the park/unpark round-trip intact.
                    assert_eq!(local, 0xDEAD_BEEF_u64);
                    assert_eq!(marker, [7u8; 32]);
                    result.set(local);
                });
                waker.wake(id);
            },
            || {},
        );

        assert_eq!(observed.get(), 0xDEAD_BEEF);
    }

    #[test]
    fn n_fibers_m_yields_all_terminate() {
        const N: usize = 8;
        const M: usize = 25;

        let engine = Engine::new();
        let yields = Rc::new(Cell::new(0usize));
        let finished = Rc::new(Cell::new(0usize));

        let eng = engine.clone();
        let y = Rc::clone(&yields);
        let f = Rc::clone(&finished);
        engine.start(
            move || {
                for _ in 0..N {
                    let fiber_engine = eng.clone();
                    let y = Rc::clone(&y);
                    let f = Rc::clone(&f);
                    eng.spawn(move || {
                        for _ in 0..M {
                            y.set(y.get() + 1);
                            fiber_engine.yield_now();
                        }
                        f.set(f.get() + 1);
                    });
                }
            },
            || {},
        );

        assert_eq!(yields.get(), N * M);
        assert_eq!(finished.get(), N);
    }

    #[test]
    fn all_blocked_reflects_list_states() {
        let engine = Engine::new();
        let idle_checked = Rc::new(Cell::new(false));

        let eng = engine.clone();
        let idle_engine = engine.clone();
        let checked = Rc::clone(&idle_checked);
        engine.start(
            move || {
                // Not all blocked while a runnable fiber exists.
                assert!(!eng.all_blocked());
                for _ in 0..2 {
                    let blocker = eng.clone();
                    eng.spawn(move || blocker.block());
                }
            },
            move || {
                assert!(idle_engine.all_blocked());
                idle_engine.wake_all();
                assert!(!idle_engine.all_blocked());
                checked.set(true);
            },
        );

        assert!(idle_checked.get());
    }

    #[test]
    fn switch_to_transfers_directly() {
        let engine = Engine::new();
        let order = log();

        let o = Rc::clone(&order);
        let eng = engine.clone();
        engine.start(
            move || {
                let first_log = Rc::clone(&o);
                let first_engine = eng.clone();
                let first = eng.spawn(move || {
                    first_log.borrow_mut().push("first:a");
                    first_engine.yield_now();
                    first_log.borrow_mut().push("first:b");
                });

                let second_log = Rc::clone(&o);
                let second_engine = eng.clone();
                eng.spawn(move || {
                    second_log.borrow_mut().push("second:a");
                    second_engine.switch_to(first);
                    second_log.borrow_mut().push("second:b");
                });
            },
            || {},
        );

        assert_eq!(
            *order.borrow(),
            vec!["first:a", "second:a", "first:b", "second:b"]
        );
    }

    #[test]
    fn waking_a_terminated_fiber_is_a_no_op() {
        let engine = Engine::new();
        let done = Rc::new(Cell::new(false));

        let eng = engine.clone();
        let flag = Rc::clone(&done);
        engine.start(
            move || {
                let stale = eng.spawn(|| {});
                // The child already terminated; its handle is stale.
                eng.wake(stale);
                // Slot reuse bumps the generation, so the stale handle
                // still cannot reach the new fiber.
                let parker = eng.clone();
                let _fresh = eng.spawn(move || {
                    parker.yield_now();
                });
                eng.wake(stale);
                flag.set(true);
            },
            || {},
        );

        assert!(done.get());
    }

    #[test]
    fn yield_without_siblings_returns_immediately() {
        let engine = Engine::new();
        let count = Rc::new(Cell::new(0usize));

        let eng = engine.clone();
        let c = Rc::clone(&count);
        engine.start(
            move || {
                for _ in 0..3 {
                    eng.yield_now();
                    c.set(c.get() + 1);
                }
            },
            || panic!("idle hook must not run"),
        );

        assert_eq!(count.get(), 3);
    }
}
