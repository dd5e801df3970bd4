//! Immutable attribute records laid out by a [`Shape`].

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use super::{Shape, StateError};

static NULL: Value = Value::Null;

/// A shaped record of JSON values, addressed by attribute name.
///
/// A `State` reachable from an [`Atom`](super::Atom) is never written
/// through a shared reference; writes go through a
/// [`MutationGuard`](super::MutationGuard) or build a new value with
/// [`with`](Self::with).
#[derive(Clone)]
pub struct State {
    shape: Arc<Shape>,
    values: Vec<Value>,
}

impl State {
    /// All attributes null.
    pub fn new(shape: &Arc<Shape>) -> Self {
        Self {
            shape: Arc::clone(shape),
            values: vec![Value::Null; shape.len()],
        }
    }

    /// Positional seed, padded with nulls.
    pub fn from_values(shape: &Arc<Shape>, mut values: Vec<Value>) -> Result<Self, StateError> {
        let expected = shape.len();
        if values.len() > expected {
            return Err(StateError::TooManyValues {
                shape: shape.name().to_string(),
                expected,
                got: values.len(),
            });
        }
        values.resize(expected, Value::Null);
        Ok(Self {
            shape: Arc::clone(shape),
            values,
        })
    }

    /// Named seed. Every key must be an attribute of `shape`.
    pub fn from_map<I, K>(shape: &Arc<Shape>, entries: I) -> Result<Self, StateError>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: AsRef<str>,
    {
        let mut state = Self::new(shape);
        for (attribute, value) in entries {
            state.set(attribute.as_ref(), value)?;
        }
        Ok(state)
    }

    pub fn shape(&self) -> &Arc<Shape> {
        &self.shape
    }

    fn index(&self, attribute: &str) -> Result<usize, StateError> {
        self.shape
            .index_of(attribute)
            .ok_or_else(|| StateError::UnknownAttribute {
                shape: self.shape.name().to_string(),
                attribute: attribute.to_string(),
            })
    }

    pub fn get(&self, attribute: &str) -> Result<&Value, StateError> {
        let index = self.index(attribute)?;
        Ok(self.at(index))
    }

    pub fn get_as<T: DeserializeOwned>(&self, attribute: &str) -> Result<T, StateError> {
        serde_json::from_value(self.get(attribute)?.clone()).map_err(|e| {
            StateError::InvalidValue {
                attribute: attribute.to_string(),
                message: e.to_string(),
            }
        })
    }

    /// Value at `index`. Attributes added to the shape after this state was
    /// built read as null.
    pub fn at(&self, index: usize) -> &Value {
        self.values.get(index).unwrap_or(&NULL)
    }

    /// Copy of this state with `attribute` replaced.
    pub fn with(&self, attribute: &str, value: Value) -> Result<State, StateError> {
        let mut next = self.clone();
        next.set(attribute, value)?;
        Ok(next)
    }

    pub(crate) fn set(&mut self, attribute: &str, value: Value) -> Result<(), StateError> {
        let index = self.index(attribute)?;
        if index >= self.values.len() {
            self.values.resize(index + 1, Value::Null);
        }
        self.values[index] = value;
        Ok(())
    }

    /// Read an attribute, or run an accessor defined on the shape.
    pub fn call(&self, name: &str, args: &[Value]) -> Result<Value, StateError> {
        if let Some(index) = self.shape.index_of(name) {
            return Ok(self.at(index).clone());
        }
        match self.shape.accessor(name) {
            Some(accessor) => Ok(accessor(self, args)),
            None => Err(StateError::UnknownMethod {
                shape: self.shape.name().to_string(),
                name: name.to_string(),
            }),
        }
    }

    pub fn to_map(&self) -> Map<String, Value> {
        self.shape
            .attributes()
            .into_iter()
            .enumerate()
            .map(|(index, attribute)| (attribute, self.at(index).clone()))
            .collect()
    }
}

impl PartialEq for State {
    fn eq(&self, other: &Self) -> bool {
        if !Arc::ptr_eq(&self.shape, &other.shape) {
            return false;
        }
        let len = self.values.len().max(other.values.len());
        (0..len).all(|i| self.at(i) == other.at(i))
    }
}

impl std::fmt::Debug for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.shape.name())?;
        f.debug_map()
            .entries(
                self.shape
                    .attributes()
                    .iter()
                    .enumerate()
                    .map(|(i, a)| (a.clone(), self.at(i))),
            )
            .finish()
    }
}
