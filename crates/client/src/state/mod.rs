//! Client-side state: shaped records, atoms that own them, reducer stores and
//! bindings that watch them.
//!
//! Everything here is single threaded (`Rc`/`RefCell`). State lives on the
//! thread that drives the UI; task results are handed over to it by
//! application code.

use thiserror::Error;

mod atom;
mod binding;
mod record;
mod shape;
mod store;

pub use atom::{Atom, MutationGuard};
pub use binding::{Binding, BindingValue, ChangeDetector};
pub use record::State;
pub use shape::{Accessor, Shape};
pub use store::{Reducer, Store};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("`{shape}` has no attribute `{attribute}`")]
    UnknownAttribute { shape: String, attribute: String },
    #[error("`{shape}` has no attribute or accessor `{name}`")]
    UnknownMethod { shape: String, name: String },
    #[error("no reducer registered for `{0}`")]
    UnknownAction(String),
    #[error("`{shape}` has {expected} attributes, got {got} values")]
    TooManyValues {
        shape: String,
        expected: usize,
        got: usize,
    },
    #[error("attribute `{attribute}` has the wrong type: {message}")]
    InvalidValue { attribute: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BindingError {
    #[error("binding `{0}` is already active")]
    AlreadyActive(String),
}
