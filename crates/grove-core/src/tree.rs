//! RepTree: the replicated tree engine.
//!
//! State is fully determined by the op multiset: merging any permutation
//! of the same ops yields identical parent, child-order, and property
//! maps. Three mechanisms make that hold:
//!
//! - properties are last-writer-wins by OpId;
//! - accepted Move ops live in a log ordered by OpId, and an op arriving
//!   out of order undoes the newer suffix, splices in, and redoes it, so
//!   every peer effectively applies moves in OpId order;
//! - a move that would create a cycle at its position in that order is
//!   rejected, and because the order is shared, every peer rejects the
//!   same op.
//!
//! Ops whose dependencies have not arrived yet (a move's parent, a
//! property's target) wait in pending buffers and are retried when the
//! missing vertex is created.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use crate::error::CoreError;
use crate::id::{PeerId, VertexId};
use crate::op::{MoveOp, OpId, PropertyValue, SetPropertyOp, TreeOp};
use crate::store::{
    ObserverHandle, PropertySlot, TreeEvent, VertexStore, CREATED_AT_KEY, NAME_KEY,
};

/// Name of the reserved deletion parent. Deleted vertices (and their
/// subtrees) are moved under it and never garbage-collected, so late
/// ops about them still merge cleanly.
pub const TOMBSTONE_NAME: &str = "_t";

/// The target's state immediately before a move-log entry applied.
/// Recorded so the entry can be undone during out-of-order insertion.
#[derive(Clone, Debug, PartialEq)]
enum Prior {
    /// The vertex did not exist; this entry created it.
    Missing,
    /// The vertex existed with this parent, put there by `placed_by`.
    Attached {
        parent: Option<VertexId>,
        placed_by: OpId,
    },
}

#[derive(Debug)]
struct MoveEntry {
    op: MoveOp,
    prior: Prior,
    applied: bool,
}

enum QueueItem {
    /// Newly ingested op; dropped if its OpId was already seen.
    Fresh(TreeOp),
    /// A pending op whose dependency just appeared; skips the seen check.
    Retry(TreeOp),
}

type OpListener = Box<dyn FnMut(&TreeOp) + Send>;

/// Deterministic projection of tree state, for convergence checks.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct TreeSnapshot {
    pub parents: BTreeMap<VertexId, Option<VertexId>>,
    pub children: BTreeMap<VertexId, Vec<VertexId>>,
    pub properties: BTreeMap<VertexId, BTreeMap<String, PropertySlot>>,
}

pub struct RepTree {
    peer: PeerId,
    counter: u64,
    store: VertexStore,
    seen: HashSet<OpId>,
    move_log: Vec<MoveEntry>,
    /// Moves waiting for their parent vertex, keyed by the missing parent.
    pending_moves: HashMap<VertexId, Vec<MoveOp>>,
    /// Property ops waiting for their target vertex, keyed by the target.
    pending_props: HashMap<VertexId, Vec<SetPropertyOp>>,
    queue: VecDeque<QueueItem>,
    local_ops: Vec<TreeOp>,
    op_observers: Vec<(u64, OpListener)>,
    next_observer: u64,
}

impl RepTree {
    pub fn new(peer: PeerId) -> Self {
        Self {
            peer,
            counter: 0,
            store: VertexStore::new(),
            seen: HashSet::new(),
            move_log: Vec::new(),
            pending_moves: HashMap::new(),
            pending_props: HashMap::new(),
            queue: VecDeque::new(),
            local_ops: Vec::new(),
            op_observers: Vec::new(),
            next_observer: 0,
        }
    }

    /// Construct and fold `ops` in their natural multiset order. Safe for
    /// any permutation.
    pub fn with_ops(peer: PeerId, ops: impl IntoIterator<Item = TreeOp>) -> Self {
        let mut tree = Self::new(peer);
        tree.merge(ops);
        tree
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer
    }

    pub fn store(&self) -> &VertexStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut VertexStore {
        &mut self.store
    }

    /// The target of the OpId-smallest applied Move with a null parent.
    pub fn root_vertex_id(&self) -> Option<VertexId> {
        self.move_log
            .iter()
            .find(|e| e.applied && e.op.parent.is_none())
            .map(|e| e.op.target.clone())
    }

    // -------------------------------------------------------------------
    // Local op generation
    // -------------------------------------------------------------------

    /// Create a vertex under `parent` (`None` bootstraps a root) with the
    /// given properties plus a shared `_c` creation timestamp.
    pub fn new_vertex(
        &mut self,
        parent: Option<&VertexId>,
        props: Vec<(String, PropertyValue)>,
    ) -> Result<VertexId, CoreError> {
        if let Some(p) = parent {
            self.ensure_exists(p)?;
        }
        let id = VertexId::generate();
        let move_id = self.next_op_id();
        self.commit_local(TreeOp::Move(MoveOp {
            id: move_id,
            target: id.clone(),
            parent: parent.cloned(),
        }));
        let created_id = self.next_op_id();
        self.commit_local(TreeOp::SetProperty(SetPropertyOp {
            id: created_id,
            target: id.clone(),
            key: CREATED_AT_KEY.to_string(),
            value: Some(PropertyValue::String(now_rfc3339())),
            transient: false,
        }));
        for (key, value) in props {
            let op_id = self.next_op_id();
            self.commit_local(TreeOp::SetProperty(SetPropertyOp {
                id: op_id,
                target: id.clone(),
                key,
                value: Some(value),
                transient: false,
            }));
        }
        Ok(id)
    }

    /// Set a property. No-op when the current value already equals
    /// `value` *and* this peer was the last writer; when the last writer
    /// differs an op is still emitted so both peers converge.
    pub fn set_vertex_property(
        &mut self,
        id: &VertexId,
        key: &str,
        value: PropertyValue,
    ) -> Result<(), CoreError> {
        self.ensure_exists(id)?;
        if let Some(slot) = self.store.property(id, key) {
            if slot.value.as_ref() == Some(&value) && slot.last_op.peer == self.peer {
                return Ok(());
            }
        }
        let op_id = self.next_op_id();
        self.commit_local(TreeOp::SetProperty(SetPropertyOp {
            id: op_id,
            target: id.clone(),
            key: key.to_string(),
            value: Some(value),
            transient: false,
        }));
        Ok(())
    }

    /// Transient variant: applied locally and handed to `pop_local_ops`
    /// for optional broadcast, but marked so persistence skips it.
    pub fn set_transient_vertex_property(
        &mut self,
        id: &VertexId,
        key: &str,
        value: PropertyValue,
    ) -> Result<(), CoreError> {
        self.ensure_exists(id)?;
        let op_id = self.next_op_id();
        self.commit_local(TreeOp::SetProperty(SetPropertyOp {
            id: op_id,
            target: id.clone(),
            key: key.to_string(),
            value: Some(value),
            transient: true,
        }));
        Ok(())
    }

    /// Reparent a vertex. The root cannot be moved.
    pub fn move_vertex(&mut self, id: &VertexId, new_parent: &VertexId) -> Result<(), CoreError> {
        self.ensure_exists(id)?;
        self.ensure_exists(new_parent)?;
        if self.root_vertex_id().as_ref() == Some(id) {
            return Err(CoreError::RootImmutable);
        }
        let op_id = self.next_op_id();
        self.commit_local(TreeOp::Move(MoveOp {
            id: op_id,
            target: id.clone(),
            parent: Some(new_parent.clone()),
        }));
        Ok(())
    }

    /// Delete by moving under the reserved tombstone vertex (created on
    /// first use as a root child named `_t`). Descendants follow their
    /// parent; nothing is garbage-collected.
    pub fn delete_vertex(&mut self, id: &VertexId) -> Result<(), CoreError> {
        self.ensure_exists(id)?;
        let tombstone = self.tombstone_vertex()?;
        if *id == tombstone {
            return Ok(());
        }
        self.move_vertex(id, &tombstone)
    }

    /// True when some ancestor is a tombstone vertex.
    pub fn is_deleted(&self, id: &VertexId) -> bool {
        let mut cur = self.store.parent(id);
        while let Some(p) = cur {
            if self.store.name(&p) == Some(TOMBSTONE_NAME) {
                return true;
            }
            cur = self.store.parent(&p);
        }
        false
    }

    fn tombstone_vertex(&mut self) -> Result<VertexId, CoreError> {
        let root = self.root_vertex_id().ok_or(CoreError::NoRoot)?;
        let existing = self
            .store
            .children(&root)
            .iter()
            .find(|c| self.store.name(c) == Some(TOMBSTONE_NAME))
            .cloned();
        match existing {
            Some(id) => Ok(id),
            None => self.new_vertex(
                Some(&root),
                vec![(NAME_KEY.to_string(), TOMBSTONE_NAME.into())],
            ),
        }
    }

    /// Return and clear the buffer of ops generated by this peer since
    /// the last call. Persistence drains this on its flush tick.
    pub fn pop_local_ops(&mut self) -> Vec<TreeOp> {
        std::mem::take(&mut self.local_ops)
    }

    // -------------------------------------------------------------------
    // Remote ingestion
    // -------------------------------------------------------------------

    /// Fold remote ops into state. Each op's counter advances the Lamport
    /// clock; duplicates (by OpId) are dropped.
    pub fn merge(&mut self, ops: impl IntoIterator<Item = TreeOp>) {
        for op in ops {
            self.counter = self.counter.max(op.id().counter);
            self.queue.push_back(QueueItem::Fresh(op));
        }
        self.drain();
    }

    // -------------------------------------------------------------------
    // Observers
    // -------------------------------------------------------------------

    /// Notified for every op after it has been folded into state.
    pub fn observe_op_applied(
        &mut self,
        listener: impl FnMut(&TreeOp) + Send + 'static,
    ) -> ObserverHandle {
        let handle = self.next_observer;
        self.next_observer += 1;
        self.op_observers.push((handle, Box::new(listener)));
        ObserverHandle::from_raw(handle)
    }

    pub fn unobserve_op(&mut self, handle: ObserverHandle) {
        let raw = handle.raw();
        self.op_observers.retain(|(h, _)| *h != raw);
    }

    /// Store-level move events, any vertex.
    pub fn observe_vertex_move(
        &mut self,
        mut listener: impl FnMut(&VertexStore, &TreeEvent) + Send + 'static,
    ) -> ObserverHandle {
        self.store.observe(move |store, event| {
            if matches!(event, TreeEvent::Move { .. }) {
                listener(store, event);
            }
        })
    }

    /// Store-level events scoped to one vertex.
    pub fn observe_vertex(
        &mut self,
        id: VertexId,
        listener: impl FnMut(&VertexStore, &TreeEvent) + Send + 'static,
    ) -> ObserverHandle {
        self.store.observe_vertex(id, listener)
    }

    pub fn unobserve(&mut self, handle: ObserverHandle) {
        self.store.unobserve(handle);
    }

    // -------------------------------------------------------------------
    // Apply machinery
    // -------------------------------------------------------------------

    fn next_op_id(&mut self) -> OpId {
        self.counter += 1;
        OpId::new(self.counter, self.peer.clone())
    }

    fn commit_local(&mut self, op: TreeOp) {
        self.queue.push_back(QueueItem::Fresh(op.clone()));
        self.drain();
        self.local_ops.push(op);
    }

    fn ensure_exists(&self, id: &VertexId) -> Result<(), CoreError> {
        if self.store.contains(id) {
            Ok(())
        } else {
            Err(CoreError::UnknownVertex {
                id: id.to_string(),
            })
        }
    }

    /// Drain the apply queue to a fixed point. Retries unblocked by a
    /// creation are queued behind whatever is already waiting.
    fn drain(&mut self) {
        while let Some(item) = self.queue.pop_front() {
            let op = match item {
                QueueItem::Fresh(op) => {
                    if !self.seen.insert(op.id().clone()) {
                        continue;
                    }
                    op
                }
                QueueItem::Retry(op) => op,
            };
            match op {
                TreeOp::Move(mv) => {
                    if let Some(parent) = &mv.parent {
                        if !self.store.contains(parent) {
                            self.pending_moves
                                .entry(parent.clone())
                                .or_default()
                                .push(mv);
                            continue;
                        }
                    }
                    if self.insert_move(mv.clone()) {
                        self.notify_op(&TreeOp::Move(mv));
                    }
                }
                TreeOp::SetProperty(prop) => {
                    if !self.store.contains(&prop.target) {
                        self.pending_props
                            .entry(prop.target.clone())
                            .or_default()
                            .push(prop);
                        continue;
                    }
                    let mutated = self.store.apply_property(
                        &prop.target,
                        &prop.key,
                        prop.value.clone(),
                        prop.id.clone(),
                    );
                    if mutated {
                        self.notify_op(&TreeOp::SetProperty(prop));
                    }
                }
            }
        }
    }

    /// Place a move at its OpId position. Arrivals newer than everything
    /// applied so far append directly; older arrivals undo the newer
    /// suffix, splice in, and redo it. Returns whether this op mutated
    /// state (false for duplicates and rejected moves).
    fn insert_move(&mut self, op: MoveOp) -> bool {
        let pos = match self.move_log.binary_search_by(|e| e.op.id.cmp(&op.id)) {
            Ok(_) => return false,
            Err(pos) => pos,
        };
        if pos == self.move_log.len() {
            let entry = self.run_move(op);
            let applied = entry.applied;
            self.move_log.push(entry);
            return applied;
        }

        for i in (pos..self.move_log.len()).rev() {
            self.undo_entry(i);
        }
        self.move_log.insert(
            pos,
            MoveEntry {
                op,
                prior: Prior::Missing,
                applied: false,
            },
        );
        for i in pos..self.move_log.len() {
            let op = self.move_log[i].op.clone();
            let entry = self.run_move(op);
            self.move_log[i] = entry;
        }
        self.move_log[pos].applied
    }

    /// Execute one move against current state. Creation always lands; a
    /// reparent lands unless it would put the target above itself.
    fn run_move(&mut self, op: MoveOp) -> MoveEntry {
        let prior = match self.store.placement(&op.target) {
            Some((parent, placed_by)) => Prior::Attached { parent, placed_by },
            None => Prior::Missing,
        };

        if let Some(parent) = &op.parent {
            if !self.store.contains(parent) {
                // Only reachable with non-causal input: a well-behaved
                // peer has seen the parent's creation, which then has a
                // smaller OpId and sits earlier in the log.
                tracing::warn!(target_id = %op.target, parent_id = %parent, "move references unknown parent, skipping");
                return MoveEntry {
                    op,
                    prior,
                    applied: false,
                };
            }
            if prior != Prior::Missing && self.would_cycle(&op.target, parent) {
                tracing::trace!(target_id = %op.target, parent_id = %parent, "move rejected, would create cycle");
                return MoveEntry {
                    op,
                    prior,
                    applied: false,
                };
            }
        }

        match &prior {
            Prior::Missing => {
                self.store
                    .attach(op.target.clone(), op.parent.clone(), op.id.clone());
                self.unblock(&op.target);
            }
            Prior::Attached { .. } => {
                self.store
                    .set_parent(&op.target, op.parent.clone(), op.id.clone());
            }
        }
        MoveEntry {
            op,
            prior,
            applied: true,
        }
    }

    fn undo_entry(&mut self, index: usize) {
        let (target, prior) = {
            let entry = &mut self.move_log[index];
            if !entry.applied {
                return;
            }
            entry.applied = false;
            (entry.op.target.clone(), entry.prior.clone())
        };
        match prior {
            Prior::Missing => self.store.detach(&target),
            Prior::Attached { parent, placed_by } => {
                self.store.set_parent(&target, parent, placed_by)
            }
        }
    }

    /// True when `candidate_parent` is `target` or sits below it.
    fn would_cycle(&self, target: &VertexId, candidate_parent: &VertexId) -> bool {
        let mut cur = Some(candidate_parent.clone());
        while let Some(node) = cur {
            if node == *target {
                return true;
            }
            cur = self.store.parent(&node);
        }
        false
    }

    /// A vertex just came into existence; requeue whatever waited on it.
    fn unblock(&mut self, id: &VertexId) {
        if let Some(moves) = self.pending_moves.remove(id) {
            for op in moves {
                self.queue.push_back(QueueItem::Retry(TreeOp::Move(op)));
            }
        }
        if let Some(props) = self.pending_props.remove(id) {
            for op in props {
                self.queue
                    .push_back(QueueItem::Retry(TreeOp::SetProperty(op)));
            }
        }
    }

    fn notify_op(&mut self, op: &TreeOp) {
        for (_, listener) in self.op_observers.iter_mut() {
            listener(op);
        }
    }

    // -------------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------------

    pub fn snapshot(&self) -> TreeSnapshot {
        let mut snapshot = TreeSnapshot::default();
        for id in self.store.attached_ids() {
            snapshot
                .parents
                .insert(id.clone(), self.store.parent(id));
            let children = self.store.children(id);
            if !children.is_empty() {
                snapshot.children.insert(id.clone(), children.to_vec());
            }
            let props: BTreeMap<String, PropertySlot> = self
                .store
                .properties(id)
                .map(|(k, slot)| (k.clone(), slot.clone()))
                .collect();
            if !props.is_empty() {
                snapshot.properties.insert(id.clone(), props);
            }
        }
        snapshot
    }
}

fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::{Arc, Mutex};

    fn peer(s: &str) -> PeerId {
        PeerId::new(s).unwrap()
    }

    fn vid(s: &str) -> VertexId {
        VertexId::new(s).unwrap()
    }

    fn mv(counter: u64, p: &str, target: &str, parent: Option<&str>) -> TreeOp {
        TreeOp::Move(MoveOp {
            id: OpId::new(counter, peer(p)),
            target: vid(target),
            parent: parent.map(vid),
        })
    }

    fn prop(counter: u64, p: &str, target: &str, key: &str, value: &str) -> TreeOp {
        TreeOp::SetProperty(SetPropertyOp {
            id: OpId::new(counter, peer(p)),
            target: vid(target),
            key: key.to_string(),
            value: Some(value.into()),
            transient: false,
        })
    }

    #[test]
    fn creates_vertices_and_tracks_root() {
        let mut tree = RepTree::new(peer("p1"));
        let root = tree.new_vertex(None, vec![(NAME_KEY.into(), "space".into())]).unwrap();
        assert_eq!(tree.root_vertex_id(), Some(root.clone()));

        let child = tree.new_vertex(Some(&root), vec![]).unwrap();
        assert_eq!(tree.store().parent(&child), Some(root.clone()));
        assert_eq!(tree.store().children(&root), &[child.clone()]);
        assert!(tree.store().property_value(&child, CREATED_AT_KEY).is_some());
    }

    #[test]
    fn new_vertex_under_unknown_parent_fails() {
        let mut tree = RepTree::new(peer("p1"));
        let err = tree.new_vertex(Some(&vid("nope")), vec![]).unwrap_err();
        assert!(matches!(err, CoreError::UnknownVertex { .. }));
    }

    #[test]
    fn property_lww_converges_on_greater_op_id() {
        // Peers a and b write (v, name) at the same counter; the
        // lexicographically larger peer wins on both sides.
        let base = vec![mv(1, "a", "v", None)];
        let op_a = prop(5, "a", "v", "name", "X");
        let op_b = prop(5, "b", "v", "name", "Y");

        let mut on_a = RepTree::with_ops(peer("a"), base.clone());
        on_a.merge([op_a.clone(), op_b.clone()]);
        let mut on_b = RepTree::with_ops(peer("b"), base);
        on_b.merge([op_b, op_a]);

        for tree in [&on_a, &on_b] {
            assert_eq!(
                tree.store().property_value(&vid("v"), "name"),
                Some(&PropertyValue::String("Y".into()))
            );
        }
        assert_eq!(on_a.snapshot(), on_b.snapshot());
    }

    #[test]
    fn concurrent_cycle_rejects_the_larger_op_on_both_peers() {
        // A->under B at (3,a), B->under A at (3,b). The smaller op
        // applies, the larger is rejected as a cycle, on both peers.
        let base = vec![
            mv(1, "a", "root", None),
            mv(2, "a", "A", Some("root")),
            mv(2, "b", "B", Some("root")),
        ];
        let move_a = mv(3, "a", "A", Some("B"));
        let move_b = mv(3, "b", "B", Some("A"));

        let mut first = RepTree::with_ops(peer("a"), base.clone());
        first.merge([move_a.clone(), move_b.clone()]);
        let mut second = RepTree::with_ops(peer("b"), base);
        second.merge([move_b, move_a]);

        for tree in [&first, &second] {
            assert_eq!(tree.store().parent(&vid("A")), Some(vid("B")));
            assert_eq!(tree.store().parent(&vid("B")), Some(vid("root")));
        }
        assert_eq!(first.snapshot(), second.snapshot());
    }

    #[test]
    fn late_creator_unblocks_pending_descendants() {
        let mut tree = RepTree::new(peer("p1"));
        // Child ops arrive before the parent's creation.
        tree.merge([
            mv(3, "a", "child", Some("parent")),
            prop(4, "a", "child", "k", "v"),
        ]);
        assert!(!tree.store().contains(&vid("child")));

        tree.merge([mv(1, "a", "root", None), mv(2, "a", "parent", Some("root"))]);
        assert_eq!(tree.store().parent(&vid("child")), Some(vid("parent")));
        assert_eq!(
            tree.store().property_value(&vid("child"), "k"),
            Some(&PropertyValue::String("v".into()))
        );
    }

    #[test]
    fn duplicate_ops_are_idempotent() {
        let ops = vec![
            mv(1, "a", "root", None),
            mv(2, "a", "x", Some("root")),
            prop(3, "a", "x", "k", "v"),
        ];
        let mut tree = RepTree::with_ops(peer("p1"), ops.clone());
        let before = tree.snapshot();
        tree.merge(ops);
        assert_eq!(tree.snapshot(), before);
    }

    #[test]
    fn set_property_skips_when_this_peer_already_wrote_it() {
        let mut tree = RepTree::new(peer("p1"));
        let root = tree.new_vertex(None, vec![]).unwrap();
        tree.set_vertex_property(&root, "name", "x".into()).unwrap();
        tree.pop_local_ops();

        // Same value, same writer: nothing emitted.
        tree.set_vertex_property(&root, "name", "x".into()).unwrap();
        assert!(tree.pop_local_ops().is_empty());

        // Same value but a different last writer: must re-emit.
        let foreign = TreeOp::SetProperty(SetPropertyOp {
            id: OpId::new(tree.counter + 1, peer("zz")),
            target: root.clone(),
            key: "name".into(),
            value: Some("x".into()),
            transient: false,
        });
        tree.merge([foreign]);
        tree.set_vertex_property(&root, "name", "x".into()).unwrap();
        assert_eq!(tree.pop_local_ops().len(), 1);
    }

    #[test]
    fn pop_local_ops_returns_and_clears() {
        let mut tree = RepTree::new(peer("p1"));
        let root = tree.new_vertex(None, vec![]).unwrap();
        let child = tree.new_vertex(Some(&root), vec![]).unwrap();
        tree.set_transient_vertex_property(&child, "text", "typing".into())
            .unwrap();

        let ops = tree.pop_local_ops();
        // Two moves + two _c stamps + the transient op.
        assert_eq!(ops.len(), 5);
        assert_eq!(ops.iter().filter(|op| op.is_transient()).count(), 1);
        assert!(tree.pop_local_ops().is_empty());
    }

    #[test]
    fn merge_advances_lamport_clock() {
        let mut tree = RepTree::new(peer("p1"));
        tree.merge([mv(41, "zz", "root", None)]);
        let id = tree.new_vertex(Some(&tree.root_vertex_id().unwrap()), vec![]).unwrap();
        let ops = tree.pop_local_ops();
        assert_eq!(ops[0].id().counter, 42);
        assert_eq!(ops[0].target(), &id);
    }

    #[test]
    fn delete_moves_subtree_under_tombstone() {
        let mut tree = RepTree::new(peer("p1"));
        let root = tree.new_vertex(None, vec![]).unwrap();
        let branch = tree.new_vertex(Some(&root), vec![]).unwrap();
        let leaf = tree.new_vertex(Some(&branch), vec![]).unwrap();

        tree.delete_vertex(&branch).unwrap();
        assert!(tree.is_deleted(&branch));
        assert!(tree.is_deleted(&leaf));
        assert!(!tree.is_deleted(&root));
        // Still present in the store; deletion never collects.
        assert!(tree.store().contains(&leaf));
    }

    #[test]
    fn root_cannot_be_moved() {
        let mut tree = RepTree::new(peer("p1"));
        let root = tree.new_vertex(None, vec![]).unwrap();
        let child = tree.new_vertex(Some(&root), vec![]).unwrap();
        assert!(matches!(
            tree.move_vertex(&root, &child),
            Err(CoreError::RootImmutable)
        ));
    }

    #[test]
    fn op_observer_fires_in_apply_order() {
        let mut tree = RepTree::new(peer("p1"));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        tree.observe_op_applied(move |op| {
            sink.lock().unwrap().push(op.id().clone());
        });

        tree.merge([mv(1, "a", "root", None), prop(2, "a", "root", "k", "v")]);
        let ids = seen.lock().unwrap();
        assert_eq!(
            *ids,
            vec![OpId::new(1, peer("a")), OpId::new(2, peer("a"))]
        );
    }

    #[test]
    fn op_observer_skips_rejected_and_superseded_ops() {
        let mut tree = RepTree::with_ops(
            peer("p1"),
            vec![
                mv(1, "a", "root", None),
                mv(2, "a", "A", Some("root")),
                mv(2, "b", "B", Some("root")),
                prop(5, "b", "A", "k", "current"),
            ],
        );

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        tree.observe_op_applied(move |op| {
            sink.lock().unwrap().push(op.id().clone());
        });

        tree.merge([
            // Lands: A moves under B.
            mv(3, "a", "A", Some("B")),
            // Rejected: would put B under its own descendant.
            mv(3, "b", "B", Some("A")),
            // Superseded: loses the (5,b) write by LWW.
            prop(4, "a", "A", "k", "stale"),
            // Lands: newest write for (A, k).
            prop(6, "a", "A", "k", "newest"),
        ]);

        let ids = seen.lock().unwrap();
        assert_eq!(
            *ids,
            vec![OpId::new(3, peer("a")), OpId::new(6, peer("a"))]
        );
        assert_eq!(
            tree.store().property_value(&vid("A"), "k"),
            Some(&PropertyValue::String("newest".into()))
        );
    }

    // ---------------------------------------------------------------
    // Model-peer property tests
    // ---------------------------------------------------------------

    #[derive(Clone, Debug)]
    enum Action {
        Create { peer: u8, parent: u8 },
        Move { peer: u8, target: u8, parent: u8 },
        Set { peer: u8, target: u8, key: u8, value: u8 },
    }

    fn action_strategy() -> impl Strategy<Value = Action> {
        prop_oneof![
            (0u8..3, any::<u8>()).prop_map(|(peer, parent)| Action::Create { peer, parent }),
            (0u8..3, any::<u8>(), any::<u8>())
                .prop_map(|(peer, target, parent)| Action::Move { peer, target, parent }),
            (0u8..3, any::<u8>(), 0u8..4, any::<u8>())
                .prop_map(|(peer, target, key, value)| Action::Set { peer, target, key, value }),
        ]
    }

    /// Expand a script into a causally plausible op multiset: one shared
    /// Lamport counter, ids handed out in creation order, moves never
    /// target the root.
    fn build_ops(actions: &[Action]) -> Vec<TreeOp> {
        let peers = ["a", "b", "c"];
        let mut counter = 0u64;
        let mut vertices = vec!["v0".to_string()];
        let mut ops = vec![mv(1, "a", "v0", None)];
        counter += 1;

        for action in actions {
            match action {
                Action::Create { peer: p, parent } => {
                    counter += 1;
                    let id = format!("v{}", vertices.len());
                    let parent = vertices[*parent as usize % vertices.len()].clone();
                    ops.push(mv(counter, peers[*p as usize], &id, Some(parent.as_str())));
                    vertices.push(id);
                }
                Action::Move { peer: p, target, parent } => {
                    let target = vertices[*target as usize % vertices.len()].clone();
                    if target == "v0" {
                        continue;
                    }
                    let parent = vertices[*parent as usize % vertices.len()].clone();
                    counter += 1;
                    ops.push(mv(counter, peers[*p as usize], &target, Some(parent.as_str())));
                }
                Action::Set { peer: p, target, key, value } => {
                    let target = vertices[*target as usize % vertices.len()].clone();
                    counter += 1;
                    ops.push(prop(
                        counter,
                        peers[*p as usize],
                        &target,
                        &format!("k{key}"),
                        &format!("val{value}"),
                    ));
                }
            }
        }
        ops
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]

        // Any permutation of the multiset converges to the same
        // parents, child order, and properties.
        #[test]
        fn merge_is_commutative(
            actions in prop::collection::vec(action_strategy(), 1..40),
            seed in any::<u64>(),
        ) {
            let ops = build_ops(&actions);
            let reference = RepTree::with_ops(peer("obs"), ops.clone()).snapshot();

            let mut shuffled = ops.clone();
            // Cheap deterministic shuffle keyed by the seed.
            let mut state = seed | 1;
            for i in (1..shuffled.len()).rev() {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                shuffled.swap(i, (state % (i as u64 + 1)) as usize);
            }

            let permuted = RepTree::with_ops(peer("obs"), shuffled).snapshot();
            prop_assert_eq!(permuted, reference);
        }

        // Every (target, key) holds the value of its
        // greatest-OpId op.
        #[test]
        fn properties_are_last_writer_wins(
            actions in prop::collection::vec(action_strategy(), 1..40),
        ) {
            let ops = build_ops(&actions);
            let tree = RepTree::with_ops(peer("obs"), ops.clone());

            let mut expected: HashMap<(VertexId, String), (OpId, Option<PropertyValue>)> =
                HashMap::new();
            for op in &ops {
                if let TreeOp::SetProperty(p) = op {
                    let entry = expected
                        .entry((p.target.clone(), p.key.clone()))
                        .or_insert_with(|| (p.id.clone(), p.value.clone()));
                    if p.id >= entry.0 {
                        *entry = (p.id.clone(), p.value.clone());
                    }
                }
            }
            for ((target, key), (_, value)) in expected {
                prop_assert_eq!(
                    tree.store().property(&target, &key).and_then(|s| s.value.clone()),
                    value
                );
            }
        }

        // The parent relation stays a forest after any merge.
        #[test]
        fn parent_relation_is_acyclic(
            actions in prop::collection::vec(action_strategy(), 1..40),
        ) {
            let ops = build_ops(&actions);
            let tree = RepTree::with_ops(peer("obs"), ops);
            let snapshot = tree.snapshot();

            for start in snapshot.parents.keys() {
                let mut hops = 0usize;
                let mut cur = snapshot.parents.get(start).cloned().flatten();
                while let Some(node) = cur {
                    hops += 1;
                    prop_assert!(hops <= snapshot.parents.len(), "cycle through {}", node);
                    cur = snapshot.parents.get(&node).cloned().flatten();
                }
            }
        }

        // Distinct OpIds with a colliding target never double-create: the
        // first move in OpId order creates, the second just reparents.
        #[test]
        fn colliding_target_ids_do_not_double_create(counter_a in 2u64..50, counter_b in 2u64..50) {
            prop_assume!(counter_a != counter_b);
            let ops = vec![
                mv(1, "a", "root", None),
                mv(counter_a, "a", "dup", Some("root")),
                mv(counter_b, "b", "dup", Some("root")),
            ];
            let tree = RepTree::with_ops(peer("obs"), ops);
            let count = tree
                .store()
                .children(&vid("root"))
                .iter()
                .filter(|c| c.as_str() == "dup")
                .count();
            prop_assert_eq!(count, 1);
        }
    }
}
