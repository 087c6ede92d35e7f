//! Vertex façade: ergonomic handles over the store.
//!
//! A handle is an engine reference plus an id; all state lives in the
//! engine's store. [`Vertex`] is the read view, [`VertexMut`] adds
//! mutation and observer registration.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::CoreError;
use crate::id::VertexId;
use crate::op::PropertyValue;
use crate::store::{ObserverHandle, TreeEvent, VertexStore, NAME_KEY};
use crate::tree::RepTree;

/// Read-only vertex handle.
#[derive(Clone, Copy)]
pub struct Vertex<'t> {
    tree: &'t RepTree,
    id: &'t VertexId,
}

impl<'t> Vertex<'t> {
    pub(crate) fn new(tree: &'t RepTree, id: &'t VertexId) -> Self {
        Self { tree, id }
    }

    pub fn id(&self) -> &VertexId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.tree.store().name(self.id)
    }

    pub fn parent_id(&self) -> Option<VertexId> {
        self.tree.store().parent(self.id)
    }

    pub fn children(&self) -> &[VertexId] {
        self.tree.store().children(self.id)
    }

    pub fn property(&self, key: &str) -> Option<&PropertyValue> {
        self.tree.store().property_value(self.id, key)
    }

    /// Linear scan over children for the first one whose `key` equals
    /// `value`.
    pub fn find_first_child_with_property(
        &self,
        key: &str,
        value: &PropertyValue,
    ) -> Option<VertexId> {
        self.children()
            .iter()
            .find(|c| self.tree.store().property_value(c, key) == Some(value))
            .cloned()
    }

    /// Project `{id, ...properties}` into a typed struct.
    pub fn to_typed<T: DeserializeOwned>(&self) -> Result<T, CoreError> {
        let value = projected_value(self.tree.store(), self.id);
        serde_json::from_value(value).map_err(|err| CoreError::Projection {
            reason: err.to_string(),
        })
    }
}

/// Mutable vertex handle.
pub struct VertexMut<'t> {
    tree: &'t mut RepTree,
    id: VertexId,
}

impl<'t> VertexMut<'t> {
    pub(crate) fn new(tree: &'t mut RepTree, id: VertexId) -> Self {
        Self { tree, id }
    }

    pub fn id(&self) -> &VertexId {
        &self.id
    }

    pub fn set_property(
        &mut self,
        key: &str,
        value: impl Into<PropertyValue>,
    ) -> Result<(), CoreError> {
        self.tree.set_vertex_property(&self.id, key, value.into())
    }

    /// One op per key, in the given order.
    pub fn set_properties(
        &mut self,
        props: Vec<(String, PropertyValue)>,
    ) -> Result<(), CoreError> {
        for (key, value) in props {
            self.tree.set_vertex_property(&self.id, &key, value)?;
        }
        Ok(())
    }

    pub fn rename(&mut self, name: &str) -> Result<(), CoreError> {
        self.set_property(NAME_KEY, name)
    }

    pub fn new_child(
        &mut self,
        props: Vec<(String, PropertyValue)>,
    ) -> Result<VertexId, CoreError> {
        let id = self.id.clone();
        self.tree.new_vertex(Some(&id), props)
    }

    pub fn delete(self) -> Result<(), CoreError> {
        self.tree.delete_vertex(&self.id)
    }

    /// Fire on any event touching this vertex; the listener receives the
    /// post-change store for re-projection.
    pub fn observe(
        &mut self,
        listener: impl FnMut(&VertexStore, &TreeEvent) + Send + 'static,
    ) -> ObserverHandle {
        self.tree.observe_vertex(self.id.clone(), listener)
    }

    /// Fire with the re-projected children whenever this vertex's child
    /// list changes.
    pub fn observe_children_as_typed<T, F>(&mut self, mut listener: F) -> ObserverHandle
    where
        T: DeserializeOwned,
        F: FnMut(Vec<T>) + Send + 'static,
    {
        let id = self.id.clone();
        self.tree.observe_vertex(id.clone(), move |store, event| {
            if !matches!(event, TreeEvent::Children { .. }) {
                return;
            }
            let projected = store
                .children(&id)
                .iter()
                .filter_map(|c| serde_json::from_value(projected_value(store, c)).ok())
                .collect();
            listener(projected);
        })
    }
}

fn projected_value(store: &VertexStore, id: &VertexId) -> Value {
    let mut map = Map::new();
    map.insert("id".to_string(), Value::String(id.to_string()));
    for (key, slot) in store.properties(id) {
        let value = match &slot.value {
            Some(v) => serde_json::to_value(v).unwrap_or(Value::Null),
            None => continue,
        };
        map.insert(key.clone(), value);
    }
    Value::Object(map)
}

impl RepTree {
    pub fn vertex<'t>(&'t self, id: &'t VertexId) -> Option<Vertex<'t>> {
        self.store().contains(id).then(|| Vertex::new(self, id))
    }

    pub fn vertex_mut(&mut self, id: &VertexId) -> Option<VertexMut<'_>> {
        self.store()
            .contains(id)
            .then(|| VertexMut::new(self, id.clone()))
    }

    /// Root handle, if the tree is bootstrapped.
    pub fn root_mut(&mut self) -> Option<VertexMut<'_>> {
        let root = self.root_vertex_id()?;
        Some(VertexMut::new(self, root))
    }
}
