//! The Hook Multiplexer (§4.3): fans a single low-level emulator hook out
//! to N registered callbacks, one multiplexer instance per hook kind per
//! emulator.
//!
//! The underlying CPU engine permits only one callback per kind, so each
//! `Emulator::hook_*` call lazily installs exactly one low-level hook
//! whose body is `Multiplexer::dispatch`/`dispatch_bool`, and everything
//! else — ordering, add/remove, teardown-on-empty — lives here instead of
//! being re-derived at every call site.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

/// Owns the registered callbacks for one (emulator, hook kind) pair, plus
/// an optional teardown action run exactly once, when the last
/// registration is dropped.
pub struct Multiplexer<F> {
    next_id: u64,
    callbacks: Vec<(u64, F)>,
    teardown: Option<Box<dyn FnMut()>>,
}

impl<F> Multiplexer<F> {
    pub fn new() -> Multiplexer<F> {
        Multiplexer {
            next_id: 0,
            callbacks: Vec::new(),
            teardown: None,
        }
    }

    /// Install the action that detaches the underlying low-level hook.
    /// Called once, right after the multiplexer is created and the
    /// low-level hook has actually been installed.
    pub fn set_teardown(&mut self, teardown: Box<dyn FnMut()>) {
        self.teardown = Some(teardown);
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    fn add(&mut self, f: F) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.callbacks.push((id, f));
        id
    }

    fn remove(&mut self, id: u64) {
        self.callbacks.retain(|(i, _)| *i != id);
        if self.callbacks.is_empty() {
            if let Some(mut teardown) = self.teardown.take() {
                teardown();
            }
        }
    }
}

impl<F> Default for Multiplexer<F> {
    fn default() -> Self {
        Multiplexer::new()
    }
}

/// Void-returning dispatch: every callback runs, in insertion order.
impl<A: Copy> Multiplexer<Box<dyn FnMut(A)>> {
    pub fn dispatch(&mut self, arg: A) {
        for (_, f) in self.callbacks.iter_mut() {
            f(arg);
        }
    }
}

impl<A: Copy, B: Copy> Multiplexer<Box<dyn FnMut(A, B)>> {
    pub fn dispatch2(&mut self, a: A, b: B) {
        for (_, f) in self.callbacks.iter_mut() {
            f(a, b);
        }
    }
}

impl<A: Copy, B: Copy, C: Copy> Multiplexer<Box<dyn FnMut(A, B, C)>> {
    pub fn dispatch3(&mut self, a: A, b: B, c: C) {
        for (_, f) in self.callbacks.iter_mut() {
            f(a, b, c);
        }
    }
}

/// Bool-returning dispatch (unmapped-memory hooks): the aggregate is the
/// logical AND of every callback's result, and every callback still runs
/// (so all listeners see the event) regardless of an earlier "stop".
impl<A: Copy, B: Copy, C: Copy> Multiplexer<Box<dyn FnMut(A, B, C) -> bool>> {
    pub fn dispatch_bool3(&mut self, a: A, b: B, c: C) -> bool {
        let mut result = true;
        for (_, f) in self.callbacks.iter_mut() {
            result = f(a, b, c) && result;
        }
        result
    }
}

impl<A: Copy, B: Copy, C: Copy, D: Copy> Multiplexer<Box<dyn FnMut(A, B, C, D)>> {
    pub fn dispatch4(&mut self, a: A, b: B, c: C, d: D) {
        for (_, f) in self.callbacks.iter_mut() {
            f(a, b, c, d);
        }
    }
}

impl<A: Copy, B: Copy, C: Copy, D: Copy> Multiplexer<Box<dyn FnMut(A, B, C, D) -> bool>> {
    pub fn dispatch_bool4(&mut self, a: A, b: B, c: C, d: D) -> bool {
        let mut result = true;
        for (_, f) in self.callbacks.iter_mut() {
            result = f(a, b, c, d) && result;
        }
        result
    }
}

/// Void-returning dispatch taking its one argument by reference, for
/// callback payloads too large (or not `Copy`) to hand out by value, e.g.
/// a decoded instruction.
impl<A: ?Sized> Multiplexer<Box<dyn FnMut(&A)>> {
    pub fn dispatch_ref(&mut self, arg: &A) {
        for (_, f) in self.callbacks.iter_mut() {
            f(arg);
        }
    }
}

/// As `dispatch_ref`, but with three further `Copy` arguments alongside
/// the reference.
impl<A: ?Sized, B: Copy, C: Copy, D: Copy> Multiplexer<Box<dyn FnMut(&A, B, C, D)>> {
    pub fn dispatch_ref4(&mut self, a: &A, b: B, c: C, d: D) {
        for (_, f) in self.callbacks.iter_mut() {
            f(a, b, c, d);
        }
    }
}

/// A scoped handle to one registered callback. Dropping it removes the
/// callback from its multiplexer; if that was the last one, the
/// multiplexer's teardown action fires and the low-level hook is
/// detached.
pub struct Registration<F> {
    id: u64,
    mux: Weak<RefCell<Multiplexer<F>>>,
}

impl<F> Registration<F> {
    pub fn new(mux: &Rc<RefCell<Multiplexer<F>>>, id: u64) -> Registration<F> {
        Registration {
            id,
            mux: Rc::downgrade(mux),
        }
    }
}

impl<F> Drop for Registration<F> {
    fn drop(&mut self) {
        if let Some(mux) = self.mux.upgrade() {
            mux.borrow_mut().remove(self.id);
        }
    }
}

/// Register `f` with `mux`, returning a scoped handle.
pub fn add_hook<F>(mux: &Rc<RefCell<Multiplexer<F>>>, f: F) -> Registration<F> {
    let id = mux.borrow_mut().add(f);
    Registration::new(mux, id)
}
