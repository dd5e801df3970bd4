//! A single current [`State`] plus the subscribers watching it.
//!
//! # Invariants
//!
//! 1. The current state is replaced, never written in place while shared.
//!    A [`MutationGuard`] copies it on first write (`Rc::make_mut`).
//! 2. Guards nest. Only the outermost guard broadcasts, once, on drop, with
//!    the state captured when it was opened as `prior`.
//! 3. Nothing is broadcast unless the current state is a different `Rc`
//!    from `prior`. Reads never broadcast.
//! 4. A broadcast calls every subscriber that was live when it started, even
//!    one unsubscribed by an earlier callback of the same broadcast.
//!    Unsubscribing takes effect from the next broadcast.
//!
//! # Failure Modes
//!
//! - Panic inside a mutation scope: the outermost guard restores `prior` and
//!   does not broadcast.
//! - Callback panic: propagates to whoever dropped the guard.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;

use serde_json::Value;

use super::{State, StateError};

type Callback = Rc<dyn Fn(&State)>;

struct Subscriber {
    who: String,
    callback: Callback,
    terminated: Cell<bool>,
}

struct AtomInner {
    state: RefCell<Rc<State>>,
    /// Set while a mutation scope is open.
    prior: RefCell<Option<Rc<State>>>,
    subscribers: RefCell<BTreeMap<u64, Rc<Subscriber>>>,
    next_id: Cell<u64>,
}

#[derive(Clone)]
pub struct Atom {
    inner: Rc<AtomInner>,
}

impl std::fmt::Debug for Atom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Atom")
            .field("state", &*self.inner.state.borrow())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl AsRef<Atom> for Atom {
    fn as_ref(&self) -> &Atom {
        self
    }
}

impl Atom {
    pub fn new(state: State) -> Self {
        Self {
            inner: Rc::new(AtomInner {
                state: RefCell::new(Rc::new(state)),
                prior: RefCell::new(None),
                subscribers: RefCell::new(BTreeMap::new()),
                next_id: Cell::new(1),
            }),
        }
    }

    /// The current state.
    pub fn state(&self) -> Rc<State> {
        Rc::clone(&self.inner.state.borrow())
    }

    pub fn get(&self, attribute: &str) -> Result<Value, StateError> {
        self.state().get(attribute).cloned()
    }

    /// Compute from the current state without mutating it.
    pub fn read<R>(&self, f: impl FnOnce(&State) -> R) -> R {
        f(&self.state())
    }

    pub fn call(&self, name: &str, args: &[Value]) -> Result<Value, StateError> {
        self.state().call(name, args)
    }

    pub fn is_mutating(&self) -> bool {
        self.inner.prior.borrow().is_some()
    }

    /// Open a mutation scope. Changes are broadcast when the outermost
    /// guard drops.
    pub fn mutation(&self) -> MutationGuard<'_> {
        let outermost = {
            let mut prior = self.inner.prior.borrow_mut();
            if prior.is_none() {
                *prior = Some(self.state());
                true
            } else {
                false
            }
        };
        MutationGuard {
            atom: self,
            outermost,
        }
    }

    /// Set several attributes in one scope. Nothing changes if any name is
    /// unknown.
    pub fn mutate(&self, values: &[(&str, Value)]) -> Result<(), StateError> {
        let state = self.state();
        let shape = state.shape();
        if let Some((attribute, _)) = values.iter().find(|(a, _)| shape.index_of(a).is_none()) {
            return Err(StateError::UnknownAttribute {
                shape: shape.name().to_string(),
                attribute: attribute.to_string(),
            });
        }

        let mut guard = self.mutation();
        for (attribute, value) in values {
            guard.set(attribute, value.clone())?;
        }
        Ok(())
    }

    /// Run `f` inside a mutation scope.
    pub fn mutate_with<R>(&self, f: impl FnOnce(&mut MutationGuard<'_>) -> R) -> R {
        let mut guard = self.mutation();
        f(&mut guard)
    }

    /// Register `callback`, called with the prior state after each change.
    /// `who` labels the subscriber in logs.
    pub fn subscribe(&self, who: &str, callback: impl Fn(&State) + 'static) -> u64 {
        let id = self.inner.next_id.get();
        self.inner.next_id.set(id + 1);
        self.inner.subscribers.borrow_mut().insert(
            id,
            Rc::new(Subscriber {
                who: who.to_string(),
                callback: Rc::new(callback),
                terminated: Cell::new(false),
            }),
        );
        id
    }

    /// Returns false if `id` was not subscribed.
    pub fn unsubscribe(&self, id: u64) -> bool {
        match self.inner.subscribers.borrow().get(&id) {
            Some(subscriber) if !subscriber.terminated.get() => {
                subscriber.terminated.set(true);
                true
            }
            _ => false,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .borrow()
            .values()
            .filter(|s| !s.terminated.get())
            .count()
    }

    fn broadcast(&self, prior: &State) {
        let live: Vec<Rc<Subscriber>> = {
            let mut subscribers = self.inner.subscribers.borrow_mut();
            subscribers.retain(|_, s| !s.terminated.get());
            subscribers.values().cloned().collect()
        };
        tracing::trace!(subscribers = live.len(), "Broadcasting state change");
        for subscriber in live {
            tracing::trace!(who = %subscriber.who, "Notifying subscriber");
            (subscriber.callback)(prior);
        }
    }
}

/// Write access to an [`Atom`]'s state for the lifetime of the guard.
pub struct MutationGuard<'a> {
    atom: &'a Atom,
    outermost: bool,
}

impl MutationGuard<'_> {
    pub fn set(&mut self, attribute: &str, value: Value) -> Result<(), StateError> {
        let mut state = self.atom.inner.state.borrow_mut();
        Rc::make_mut(&mut state).set(attribute, value)
    }

    pub fn get(&self, attribute: &str) -> Result<Value, StateError> {
        self.atom.get(attribute)
    }

    /// The state as written so far.
    pub fn current(&self) -> Rc<State> {
        self.atom.state()
    }

    /// Swap in a whole new state. Passing back [`current`](Self::current)
    /// unchanged is not a change.
    pub fn replace(&mut self, state: Rc<State>) {
        *self.atom.inner.state.borrow_mut() = state;
    }
}

impl Drop for MutationGuard<'_> {
    fn drop(&mut self) {
        if !self.outermost {
            return;
        }
        let Some(prior) = self.atom.inner.prior.borrow_mut().take() else {
            return;
        };

        if std::thread::panicking() {
            *self.atom.inner.state.borrow_mut() = prior;
            return;
        }

        if !Rc::ptr_eq(&prior, &self.atom.state()) {
            self.atom.broadcast(&prior);
        }
    }
}
