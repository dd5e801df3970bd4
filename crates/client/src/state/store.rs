//! An [`Atom`] driven by named reducers.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use serde_json::Value;

use super::{Atom, State, StateError};

/// Pure `(state, args) -> next state`. Returning the input `Rc` means no change.
pub type Reducer = Rc<dyn Fn(&Rc<State>, &[Value]) -> Result<Rc<State>, StateError>>;

#[derive(Clone)]
pub struct Store {
    atom: Atom,
    reducers: Rc<RefCell<HashMap<String, Reducer>>>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut actions: Vec<_> = self.reducers.borrow().keys().cloned().collect();
        actions.sort();
        f.debug_struct("Store")
            .field("atom", &self.atom)
            .field("actions", &actions)
            .finish()
    }
}

impl AsRef<Atom> for Store {
    fn as_ref(&self) -> &Atom {
        &self.atom
    }
}

impl Store {
    pub fn new(state: State) -> Self {
        Self {
            atom: Atom::new(state),
            reducers: Rc::new(RefCell::new(HashMap::new())),
        }
    }

    pub fn atom(&self) -> &Atom {
        &self.atom
    }

    pub fn state(&self) -> Rc<State> {
        self.atom.state()
    }

    /// Register `reducer` for `action`, replacing any earlier one.
    pub fn register_reducer(
        &self,
        action: &str,
        reducer: impl Fn(&Rc<State>, &[Value]) -> Result<Rc<State>, StateError> + 'static,
    ) {
        self.reducers
            .borrow_mut()
            .insert(action.to_string(), Rc::new(reducer));
    }

    /// Run the reducer for `action` and broadcast if it produced a new state.
    pub fn dispatch(&self, action: &str, args: &[Value]) -> Result<(), StateError> {
        let reducer = self
            .reducers
            .borrow()
            .get(action)
            .cloned()
            .ok_or_else(|| StateError::UnknownAction(action.to_string()))?;

        tracing::debug!(%action, "Dispatching");
        let mut guard = self.atom.mutation();
        let next = reducer(&guard.current(), args)?;
        guard.replace(next);
        Ok(())
    }
}
