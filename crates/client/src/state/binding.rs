//! Derived subscriptions over an [`Atom`] or [`Store`](super::Store).
//!
//! A [`Binding`] pairs a projection (`Fn(&State) -> T`) with a
//! [`ChangeDetector`] that decides whether a broadcast is worth passing on.
//! Its callback only fires for changes the detector cares about.
//!
//! # Lifecycle
//!
//! `activate` subscribes, `deactivate` unsubscribes. Activating an active
//! binding is an error. After `deactivate`, [`Binding::value`] returns
//! [`BindingValue::Deactivated`] and a late callback only logs a warning, so
//! a binding that outlives its view is noisy rather than fatal. Dropping the
//! last handle unsubscribes.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use serde_json::Value;

use super::{Atom, BindingError, State, StateError};

/// Decides whether a state transition matters to a binding.
#[derive(Clone)]
pub enum ChangeDetector {
    /// Compare `prior.call(name, args)` with the same call on the current state.
    Method { name: String, args: Vec<Value> },
    /// Called with the prior state; true means changed.
    Predicate(Rc<dyn Fn(&State) -> bool>),
    /// Every broadcast counts.
    Any,
}

impl std::fmt::Debug for ChangeDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeDetector::Method { name, args } => f
                .debug_struct("Method")
                .field("name", name)
                .field("args", args)
                .finish(),
            ChangeDetector::Predicate(_) => f.write_str("Predicate"),
            ChangeDetector::Any => f.write_str("Any"),
        }
    }
}

impl ChangeDetector {
    /// Track a single attribute.
    pub fn attribute(name: &str) -> Self {
        ChangeDetector::Method {
            name: name.to_string(),
            args: Vec::new(),
        }
    }

    pub fn method(name: &str, args: Vec<Value>) -> Self {
        ChangeDetector::Method {
            name: name.to_string(),
            args,
        }
    }

    pub fn predicate(f: impl Fn(&State) -> bool + 'static) -> Self {
        ChangeDetector::Predicate(Rc::new(f))
    }
}

/// What [`Binding::value`] produces.
#[derive(Debug, Clone, PartialEq)]
pub enum BindingValue<T> {
    Value(T),
    /// The binding was deactivated; `binding` is its label.
    Deactivated { binding: String },
}

impl<T> BindingValue<T> {
    pub fn into_value(self) -> Option<T> {
        match self {
            BindingValue::Value(value) => Some(value),
            BindingValue::Deactivated { .. } => None,
        }
    }

    pub fn is_deactivated(&self) -> bool {
        matches!(self, BindingValue::Deactivated { .. })
    }
}

type Callback = Rc<dyn Fn(&State)>;

struct BindingInner<T> {
    atom: Atom,
    who: String,
    detector: ChangeDetector,
    projection: Box<dyn Fn(&State) -> T>,
    subscription: Cell<Option<u64>>,
    deactivated: Cell<bool>,
    callback: RefCell<Callback>,
}

pub struct Binding<T> {
    inner: Rc<BindingInner<T>>,
}

impl<T> Clone for Binding<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for Binding<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binding")
            .field("who", &self.inner.who)
            .field("detector", &self.inner.detector)
            .field("active", &self.is_active())
            .finish()
    }
}

impl<T> Binding<T> {
    pub fn who(&self) -> &str {
        &self.inner.who
    }

    pub fn is_active(&self) -> bool {
        self.inner.subscription.get().is_some()
    }
}

impl<T: 'static> Binding<T> {
    /// Bind `projection` over `source`.
    ///
    /// A [`ChangeDetector::Method`] is checked against the current state
    /// here, so a misspelled attribute fails now rather than on every
    /// broadcast.
    pub fn new(
        source: &impl AsRef<Atom>,
        who: &str,
        detector: ChangeDetector,
        projection: impl Fn(&State) -> T + 'static,
    ) -> Result<Self, StateError> {
        let atom = source.as_ref().clone();
        if let ChangeDetector::Method { name, args } = &detector {
            atom.call(name, args)?;
        }

        Ok(Self {
            inner: Rc::new(BindingInner {
                atom,
                who: who.to_string(),
                detector,
                projection: Box::new(projection),
                subscription: Cell::new(None),
                deactivated: Cell::new(false),
                callback: RefCell::new(Rc::new(|_: &State| {})),
            }),
        })
    }

    /// Shorthand for a binding that tracks one attribute.
    pub fn tracking(
        source: &impl AsRef<Atom>,
        who: &str,
        attribute: &str,
        projection: impl Fn(&State) -> T + 'static,
    ) -> Result<Self, StateError> {
        Self::new(source, who, ChangeDetector::attribute(attribute), projection)
    }

    /// Subscribe. `callback` gets the prior state whenever the detector
    /// reports a change.
    pub fn activate(&self, callback: impl Fn(&State) + 'static) -> Result<(), BindingError> {
        if self.is_active() {
            return Err(BindingError::AlreadyActive(self.inner.who.clone()));
        }
        *self.inner.callback.borrow_mut() = Rc::new(callback);
        self.inner.deactivated.set(false);

        let weak: Weak<BindingInner<T>> = Rc::downgrade(&self.inner);
        let id = self.inner.atom.subscribe(&self.inner.who, move |prior| {
            if let Some(inner) = weak.upgrade() {
                inner.notify(prior);
            }
        });
        self.inner.subscription.set(Some(id));
        Ok(())
    }

    pub fn deactivate(&self) {
        if let Some(id) = self.inner.subscription.take() {
            self.inner.atom.unsubscribe(id);
        }
        self.inner.deactivated.set(true);

        let who = self.inner.who.clone();
        *self.inner.callback.borrow_mut() = Rc::new(move |_: &State| {
            tracing::warn!(binding = %who, "Deactivated binding was notified");
        });
    }

    /// Whether the transition from `prior` to the current state matters.
    pub fn changed(&self, prior: &State) -> bool {
        self.inner.changed(prior)
    }

    /// Project `prior`, or the current state when `None`.
    pub fn value(&self, prior: Option<&State>) -> BindingValue<T> {
        if self.inner.deactivated.get() {
            tracing::warn!(binding = %self.inner.who, "Value requested from deactivated binding");
            return BindingValue::Deactivated {
                binding: self.inner.who.clone(),
            };
        }
        let value = match prior {
            Some(state) => (self.inner.projection)(state),
            None => (self.inner.projection)(&self.inner.atom.state()),
        };
        BindingValue::Value(value)
    }
}

impl<T> BindingInner<T> {
    fn notify(&self, prior: &State) {
        if !self.changed(prior) {
            return;
        }
        let callback = Rc::clone(&self.callback.borrow());
        callback(prior);
    }

    fn changed(&self, prior: &State) -> bool {
        match &self.detector {
            ChangeDetector::Method { name, args } => {
                let current = self.atom.state();
                match (prior.call(name, args), current.call(name, args)) {
                    (Ok(before), Ok(after)) => before != after,
                    (Err(e), _) | (_, Err(e)) => {
                        tracing::warn!(binding = %self.who, "Change check failed: {}", e);
                        true
                    }
                }
            }
            ChangeDetector::Predicate(predicate) => predicate(prior),
            ChangeDetector::Any => true,
        }
    }
}

impl<T> Drop for BindingInner<T> {
    fn drop(&mut self) {
        if let Some(id) = self.subscription.take() {
            self.atom.unsubscribe(id);
        }
    }
}
