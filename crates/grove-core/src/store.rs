//! Vertex store: the canonical node table.
//!
//! Owns parent pointers, per-parent child lists (in attach order), and the
//! property maps with their last-writer OpIds. Emits change events
//! synchronously with each mutation; observers see the post-change state.
//!
//! The store is mechanism only. Which mutations happen, and in which
//! order, is decided by the [`tree`](crate::tree) engine.

use std::collections::HashMap;

use crate::id::VertexId;
use crate::op::{OpId, PropertyValue};

/// Reserved property key: vertex name.
pub const NAME_KEY: &str = "_n";
/// Reserved property key: creation timestamp, set once at creation.
pub const CREATED_AT_KEY: &str = "_c";

/// One property cell: the current value plus the op that wrote it.
/// `value == None` records an explicit "undefined" write.
#[derive(Clone, Debug, PartialEq)]
pub struct PropertySlot {
    pub value: Option<PropertyValue>,
    pub last_op: OpId,
}

/// A store change. Emission order for a reparent is move, children(old),
/// children(new), so observers always see a consistent snapshot.
#[derive(Clone, Debug, PartialEq)]
pub enum TreeEvent {
    Move {
        vertex: VertexId,
        old_parent: Option<VertexId>,
        new_parent: Option<VertexId>,
    },
    Children {
        parent: VertexId,
    },
    Property {
        vertex: VertexId,
        key: String,
    },
}

impl TreeEvent {
    /// The vertex whose scoped observers should fire.
    fn subject(&self) -> &VertexId {
        match self {
            TreeEvent::Move { vertex, .. } => vertex,
            TreeEvent::Children { parent } => parent,
            TreeEvent::Property { vertex, .. } => vertex,
        }
    }
}

/// Handle returned by observer registration; pass back to `unobserve`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObserverHandle(u64);

impl ObserverHandle {
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub(crate) fn raw(self) -> u64 {
        self.0
    }
}

type Listener = Box<dyn FnMut(&VertexStore, &TreeEvent) + Send>;

struct VertexRecord {
    parent: Option<VertexId>,
    /// OpId of the Move that currently places this vertex. Child lists
    /// sort by it, which equals apply order under OpId-ordered replay.
    placed_by: Option<OpId>,
    properties: HashMap<String, PropertySlot>,
    /// A vertex exists iff some applied Move created it. Records persist
    /// through transient detach/re-attach during move-log replay so that
    /// already-applied properties survive.
    attached: bool,
}

#[derive(Default)]
pub struct VertexStore {
    nodes: HashMap<VertexId, VertexRecord>,
    children: HashMap<VertexId, Vec<VertexId>>,
    global: Vec<(u64, Listener)>,
    scoped: HashMap<VertexId, Vec<(u64, Listener)>>,
    next_handle: u64,
}

impl VertexStore {
    pub fn new() -> Self {
        Self::default()
    }

    // -------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------

    pub fn contains(&self, id: &VertexId) -> bool {
        self.nodes.get(id).map(|n| n.attached).unwrap_or(false)
    }

    pub fn parent(&self, id: &VertexId) -> Option<VertexId> {
        self.nodes
            .get(id)
            .filter(|n| n.attached)
            .and_then(|n| n.parent.clone())
    }

    /// Children in attach order (the placing Moves' OpId order), which
    /// is what applying the moves one by one produces and is therefore
    /// stable under re-merge.
    pub fn children(&self, id: &VertexId) -> &[VertexId] {
        self.children.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Current placement of an attached vertex: parent plus the move
    /// that put it there.
    pub(crate) fn placement(&self, id: &VertexId) -> Option<(Option<VertexId>, OpId)> {
        let record = self.nodes.get(id).filter(|n| n.attached)?;
        Some((record.parent.clone(), record.placed_by.clone()?))
    }

    pub fn property(&self, id: &VertexId, key: &str) -> Option<&PropertySlot> {
        self.nodes
            .get(id)
            .filter(|n| n.attached)
            .and_then(|n| n.properties.get(key))
    }

    pub fn property_value(&self, id: &VertexId, key: &str) -> Option<&PropertyValue> {
        self.property(id, key).and_then(|slot| slot.value.as_ref())
    }

    pub fn name(&self, id: &VertexId) -> Option<&str> {
        self.property_value(id, NAME_KEY).and_then(PropertyValue::as_str)
    }

    pub fn properties(
        &self,
        id: &VertexId,
    ) -> impl Iterator<Item = (&String, &PropertySlot)> {
        self.nodes
            .get(id)
            .filter(|n| n.attached)
            .into_iter()
            .flat_map(|n| n.properties.iter())
    }

    pub fn attached_ids(&self) -> impl Iterator<Item = &VertexId> {
        self.nodes
            .iter()
            .filter(|(_, n)| n.attached)
            .map(|(id, _)| id)
    }

    // -------------------------------------------------------------------
    // Mutations (engine-only surface)
    // -------------------------------------------------------------------

    /// Create the vertex, or re-attach a record left behind by an undo.
    pub(crate) fn attach(&mut self, id: VertexId, parent: Option<VertexId>, placed_by: OpId) {
        let record = self.nodes.entry(id.clone()).or_insert(VertexRecord {
            parent: None,
            placed_by: None,
            properties: HashMap::new(),
            attached: false,
        });
        record.attached = true;
        record.parent = parent.clone();
        record.placed_by = Some(placed_by.clone());
        if let Some(p) = &parent {
            self.insert_child(p, id.clone(), &placed_by);
        }
        self.emit(TreeEvent::Move {
            vertex: id,
            old_parent: None,
            new_parent: parent.clone(),
        });
        if let Some(p) = parent {
            self.emit(TreeEvent::Children { parent: p });
        }
    }

    /// Reverse of a creating move: the vertex stops existing but its
    /// record (properties included) stays for re-attachment.
    pub(crate) fn detach(&mut self, id: &VertexId) {
        let old_parent = match self.nodes.get_mut(id) {
            Some(record) if record.attached => {
                record.attached = false;
                record.placed_by = None;
                record.parent.take()
            }
            _ => return,
        };
        if let Some(p) = &old_parent {
            if let Some(list) = self.children.get_mut(p) {
                list.retain(|c| c != id);
            }
        }
        self.emit(TreeEvent::Move {
            vertex: id.clone(),
            old_parent: old_parent.clone(),
            new_parent: None,
        });
        if let Some(p) = old_parent {
            self.emit(TreeEvent::Children { parent: p });
        }
    }

    /// Reparent an existing vertex, updating both child lists.
    pub(crate) fn set_parent(
        &mut self,
        id: &VertexId,
        new_parent: Option<VertexId>,
        placed_by: OpId,
    ) {
        let old_parent = match self.nodes.get_mut(id) {
            Some(record) if record.attached => {
                let old = record.parent.clone();
                record.parent = new_parent.clone();
                record.placed_by = Some(placed_by.clone());
                old
            }
            _ => return,
        };
        if let Some(p) = &old_parent {
            if let Some(list) = self.children.get_mut(p) {
                list.retain(|c| c != id);
            }
        }
        if let Some(p) = &new_parent {
            self.insert_child(p, id.clone(), &placed_by);
        }
        self.emit(TreeEvent::Move {
            vertex: id.clone(),
            old_parent: old_parent.clone(),
            new_parent: new_parent.clone(),
        });
        if let Some(p) = old_parent {
            self.emit(TreeEvent::Children { parent: p });
        }
        if let Some(p) = new_parent {
            self.emit(TreeEvent::Children { parent: p });
        }
    }

    /// Keep each child list sorted by placement OpId.
    fn insert_child(&mut self, parent: &VertexId, child: VertexId, placed_by: &OpId) {
        let index = {
            let list = self.children.get(parent).map(Vec::as_slice).unwrap_or(&[]);
            list.iter()
                .position(|c| {
                    self.nodes
                        .get(c)
                        .and_then(|n| n.placed_by.as_ref())
                        .map(|placed| placed > placed_by)
                        .unwrap_or(false)
                })
                .unwrap_or(list.len())
        };
        self.children
            .entry(parent.clone())
            .or_default()
            .insert(index, child);
    }

    /// LWW property write: only an op newer than the current last-writer
    /// lands. Returns whether the value changed.
    pub(crate) fn apply_property(
        &mut self,
        id: &VertexId,
        key: &str,
        value: Option<PropertyValue>,
        op_id: OpId,
    ) -> bool {
        let Some(record) = self.nodes.get_mut(id).filter(|n| n.attached) else {
            return false;
        };
        if let Some(slot) = record.properties.get(key) {
            if slot.last_op >= op_id {
                return false;
            }
        }
        record.properties.insert(
            key.to_string(),
            PropertySlot {
                value,
                last_op: op_id,
            },
        );
        self.emit(TreeEvent::Property {
            vertex: id.clone(),
            key: key.to_string(),
        });
        true
    }

    // -------------------------------------------------------------------
    // Observers
    // -------------------------------------------------------------------

    pub fn observe(&mut self, listener: impl FnMut(&VertexStore, &TreeEvent) + Send + 'static) -> ObserverHandle {
        let handle = self.next_handle;
        self.next_handle += 1;
        self.global.push((handle, Box::new(listener)));
        ObserverHandle(handle)
    }

    pub fn observe_vertex(
        &mut self,
        id: VertexId,
        listener: impl FnMut(&VertexStore, &TreeEvent) + Send + 'static,
    ) -> ObserverHandle {
        let handle = self.next_handle;
        self.next_handle += 1;
        self.scoped
            .entry(id)
            .or_default()
            .push((handle, Box::new(listener)));
        ObserverHandle(handle)
    }

    pub fn unobserve(&mut self, handle: ObserverHandle) {
        self.global.retain(|(h, _)| *h != handle.0);
        for list in self.scoped.values_mut() {
            list.retain(|(h, _)| *h != handle.0);
        }
        self.scoped.retain(|_, list| !list.is_empty());
    }

    fn emit(&mut self, event: TreeEvent) {
        // Listeners get a shared view of the store, so the lists are taken
        // out for the duration of the call. Registration needs &mut and
        // therefore cannot race this.
        let mut global = std::mem::take(&mut self.global);
        for (_, listener) in global.iter_mut() {
            listener(self, &event);
        }
        self.global = global;

        let subject = event.subject().clone();
        if let Some(mut list) = self.scoped.remove(&subject) {
            for (_, listener) in list.iter_mut() {
                listener(self, &event);
            }
            self.scoped.insert(subject, list);
        }
    }
}
