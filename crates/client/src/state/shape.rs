//! Process-wide state shapes.
//!
//! A shape is the ordered attribute list shared by every [`State`] of that
//! kind. Attributes can be added later but an attribute's index never
//! changes once assigned.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde_json::Value;

use super::State;

/// Computed read over a state, called through [`State::call`].
pub type Accessor = Arc<dyn Fn(&State, &[Value]) -> Value + Send + Sync>;

static SHAPES: Lazy<RwLock<HashMap<String, Arc<Shape>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

pub struct Shape {
    name: String,
    attributes: RwLock<Vec<String>>,
    accessors: RwLock<HashMap<String, Accessor>>,
}

impl std::fmt::Debug for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shape")
            .field("name", &self.name)
            .field("attributes", &*self.attributes.read())
            .finish()
    }
}

impl Shape {
    /// Get or create the shape `name`, appending any attributes it lacks.
    pub fn define(name: &str, attributes: &[&str]) -> Arc<Shape> {
        let shape = {
            let mut shapes = SHAPES.write();
            let shape = shapes.entry(name.to_string()).or_insert_with(|| {
                Arc::new(Shape {
                    name: name.to_string(),
                    attributes: RwLock::new(Vec::new()),
                    accessors: RwLock::new(HashMap::new()),
                })
            });
            Arc::clone(shape)
        };

        let mut known = shape.attributes.write();
        for attribute in attributes {
            if !known.iter().any(|a| a == attribute) {
                known.push(attribute.to_string());
            }
        }
        drop(known);
        shape
    }

    pub fn lookup(name: &str) -> Option<Arc<Shape>> {
        SHAPES.read().get(name).cloned()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attributes(&self) -> Vec<String> {
        self.attributes.read().clone()
    }

    pub fn index_of(&self, attribute: &str) -> Option<usize> {
        self.attributes.read().iter().position(|a| a == attribute)
    }

    pub fn len(&self) -> usize {
        self.attributes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.read().is_empty()
    }

    pub fn define_accessor(
        &self,
        name: &str,
        accessor: impl Fn(&State, &[Value]) -> Value + Send + Sync + 'static,
    ) {
        self.accessors
            .write()
            .insert(name.to_string(), Arc::new(accessor));
    }

    pub fn accessor(&self, name: &str) -> Option<Accessor> {
        self.accessors.read().get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indices_are_stable_across_redefinition() {
        let shape = Shape::define("shape_test_counter", &["count", "label"]);
        assert_eq!(shape.index_of("label"), Some(1));

        let again = Shape::define("shape_test_counter", &["extra", "count"]);
        assert!(Arc::ptr_eq(&shape, &again));
        assert_eq!(again.attributes(), vec!["count", "label", "extra"]);
        assert_eq!(again.index_of("count"), Some(0));
        assert_eq!(again.index_of("label"), Some(1));
        assert_eq!(again.index_of("extra"), Some(2));
        assert!(Shape::lookup("shape_test_counter").is_some());
        assert!(Shape::lookup("shape_test_missing").is_none());
    }
}
