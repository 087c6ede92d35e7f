//! SpaceConnection: one peer's live attachment to a space directory.
//!
//! The connection owns the Space and is the single serialization point
//! for engine state. Background threads only produce events into
//! channels; `pump()` drains them, flushes the local-op buffer on its
//! cadence, and polls the secrets blob. Hosts call `pump()` from their
//! own loop (UI tick, scheduler), keeping the whole engine
//! single-threaded and cooperative.

use std::path::{Path, PathBuf};
use std::time::Instant;

use crossbeam::channel::{unbounded, Receiver};

use grove_core::{PeerId, RepTree, TreeOp, VertexId};

use crate::config::{atomic_write, ConnectionConfig};
use crate::error::SpaceError;
use crate::layout::{self, SpacePointer};
use crate::oplog;
use crate::secrets::{self, SecretMap};
use crate::space::Space;
use crate::sync::watch::{self, WatchEvent, Watcher};

pub struct SpaceConnection {
    dir: PathBuf,
    peer: PeerId,
    space: Space,
    config: ConnectionConfig,
    watcher: Option<Watcher>,
    watch_rx: Option<Receiver<WatchEvent>>,
    last_flush: Instant,
    last_secrets_poll: Instant,
    /// Content of the secrets blob as last read or written; saves are
    /// skipped while the in-memory map still equals this.
    last_secrets: SecretMap,
    /// Batches whose append failed; retried on the next flush.
    pending_writes: Vec<(VertexId, Vec<TreeOp>)>,
    flushing: bool,
    connected: bool,
}

impl SpaceConnection {
    /// Create a fresh space in `dir`: pointer file, genesis ops on disk.
    pub fn create(dir: impl Into<PathBuf>, peer: PeerId) -> Result<Self, SpaceError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| SpaceError::io(&dir, source))?;
        let config = ConnectionConfig::load(&dir)?;

        let mut space = Space::create(peer.clone())?;
        let id = space.id().ok_or_else(|| SpaceError::InvalidSpace {
            path: dir.clone(),
            reason: "bootstrap produced no root".into(),
        })?;
        let pointer = SpacePointer { id: id.to_string() };
        let body = serde_json::to_vec(&pointer).map_err(|err| SpaceError::InvalidSpace {
            path: dir.clone(),
            reason: err.to_string(),
        })?;
        atomic_write(&layout::pointer_path(&dir), &body)?;

        install_tree_loader(&mut space, &dir, &peer);

        let mut connection = Self::assemble(dir, peer, space, config);
        connection.flush_now()?;
        Ok(connection)
    }

    /// Open an existing space: read the pointer, load the space tree's
    /// full op multiset, verify the root matches the declared id.
    pub fn open(dir: impl Into<PathBuf>, peer: PeerId) -> Result<Self, SpaceError> {
        let dir = dir.into();
        let config = ConnectionConfig::load(&dir)?;
        let pointer_path = layout::pointer_path(&dir);
        let contents = std::fs::read_to_string(&pointer_path)
            .map_err(|source| SpaceError::InvalidSpace {
                path: dir.clone(),
                reason: format!("cannot read {}: {source}", layout::POINTER_FILE),
            })?;
        let pointer: SpacePointer =
            serde_json::from_str(&contents).map_err(|err| SpaceError::InvalidSpace {
                path: dir.clone(),
                reason: format!("malformed {}: {err}", layout::POINTER_FILE),
            })?;
        let tree_id =
            VertexId::new(pointer.id.as_str()).map_err(|_| SpaceError::InvalidSpace {
                path: dir.clone(),
                reason: "pointer id is empty".into(),
            })?;

        let ops = oplog::read_tree_ops(&dir, &tree_id)?;
        let tree = RepTree::with_ops(peer.clone(), ops);
        let root = tree.root_vertex_id().ok_or_else(|| SpaceError::InvalidSpace {
            path: dir.clone(),
            reason: "space tree has no root".into(),
        })?;
        if root != tree_id {
            return Err(SpaceError::SpaceIdMismatch {
                expected: pointer.id,
                found: root.to_string(),
            });
        }

        let mut space = Space::from_tree(tree);
        let loaded = secrets::load(&layout::secrets_path(&dir), tree_id.as_str());
        space.replace_secrets(loaded.clone());
        install_tree_loader(&mut space, &dir, &peer);

        let mut connection = Self::assemble(dir, peer, space, config);
        connection.last_secrets = loaded;
        Ok(connection)
    }

    fn assemble(dir: PathBuf, peer: PeerId, space: Space, config: ConnectionConfig) -> Self {
        Self {
            dir,
            peer,
            space,
            config,
            watcher: None,
            watch_rx: None,
            last_flush: Instant::now(),
            last_secrets_poll: Instant::now(),
            last_secrets: SecretMap::new(),
            pending_writes: Vec::new(),
            flushing: false,
            connected: true,
        }
    }

    pub fn space(&self) -> &Space {
        &self.space
    }

    pub fn space_mut(&mut self) -> &mut Space {
        &mut self.space
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn connected(&self) -> bool {
        self.connected
    }

    /// Start watching peer files. Without this the connection still
    /// persists its own ops (one-way sync).
    pub fn connect(&mut self) {
        if self.watcher.is_some() {
            return;
        }
        let (tx, rx) = unbounded();
        self.watcher = Some(watch::spawn(
            self.dir.clone(),
            self.peer.clone(),
            self.config.watch_poll(),
            tx,
        ));
        self.watch_rx = Some(rx);
    }

    /// One cooperative turn: ingest watcher events, flush if due, poll
    /// secrets if due. Best-effort; I/O failures are logged and retried.
    pub fn pump(&mut self) {
        self.ingest_watch_events();

        if self.last_flush.elapsed() >= self.config.flush_interval() {
            self.last_flush = Instant::now();
            if let Err(err) = self.flush_now() {
                tracing::warn!(%err, "flush failed, ops stay buffered");
            }
        }

        if self.last_secrets_poll.elapsed() >= self.config.secrets_poll() {
            self.last_secrets_poll = Instant::now();
            if let Err(err) = self.save_secrets_if_changed() {
                tracing::warn!(%err, "secrets save failed");
            }
        }
    }

    fn ingest_watch_events(&mut self) {
        let Some(rx) = self.watch_rx.as_ref() else {
            return;
        };
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        for event in events {
            match event {
                WatchEvent::Ops {
                    tree,
                    peer,
                    content,
                } => self.ingest_ops(&tree, &peer, &content),
                WatchEvent::Secrets => self.reload_secrets(),
            }
        }
    }

    /// Merge a peer file into the matching tree: the space tree for the
    /// space id, a loaded app tree otherwise. Files for unloaded trees
    /// are ignored; they are read in full when the tree is loaded.
    fn ingest_ops(&mut self, tree: &VertexId, peer: &PeerId, content: &str) {
        let ops = oplog::parse_lines(content, peer, Path::new("watch"));
        if self.space.id().as_ref() == Some(tree) {
            self.space.tree_mut().merge(ops);
        } else if let Some(app_tree) = self.space.app_tree_mut(tree) {
            app_tree.tree_mut().merge(ops);
        } else {
            tracing::debug!(tree_id = %tree, "ops for unloaded tree, skipping");
        }
    }

    fn reload_secrets(&mut self) {
        let Some(id) = self.space.id() else { return };
        let loaded = secrets::load(&layout::secrets_path(&self.dir), id.as_str());
        self.last_secrets = loaded.clone();
        self.space.replace_secrets(loaded);
    }

    /// Drain local-op buffers to the per-tree current-day files. Failed
    /// batches stay queued for the next tick.
    pub fn flush_now(&mut self) -> Result<(), SpaceError> {
        if self.flushing {
            return Ok(());
        }
        self.flushing = true;
        let result = self.flush_inner();
        self.flushing = false;
        result
    }

    fn flush_inner(&mut self) -> Result<(), SpaceError> {
        let mut batches = std::mem::take(&mut self.pending_writes);

        if let Some(space_id) = self.space.id() {
            let ops = drain_persistable(self.space.tree_mut(), &self.peer);
            if !ops.is_empty() {
                batches.push((space_id, ops));
            }
        }
        let tree_ids: Vec<VertexId> = self.space.loaded_tree_ids().cloned().collect();
        for id in tree_ids {
            if let Some(app_tree) = self.space.app_tree_mut(&id) {
                let ops = drain_persistable(app_tree.tree_mut(), &self.peer);
                if !ops.is_empty() {
                    batches.push((id, ops));
                }
            }
        }

        let date = oplog::today();
        let mut first_error = None;
        for (tree, ops) in batches {
            match oplog::append_ops(&self.dir, &tree, &self.peer, date, &ops) {
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(tree_id = %tree, %err, "append failed, keeping batch");
                    self.pending_writes.push((tree, ops));
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }
        match first_error {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    fn save_secrets_if_changed(&mut self) -> Result<(), SpaceError> {
        let Some(id) = self.space.id() else {
            return Ok(());
        };
        let current = self.space.secrets().clone();
        let wrote = secrets::save(
            &layout::secrets_path(&self.dir),
            id.as_str(),
            &current,
            Some(&self.last_secrets),
        )?;
        if wrote {
            self.last_secrets = current;
        }
        Ok(())
    }

    /// Stop the watcher, flush once more, and mark the connection down.
    pub fn disconnect(&mut self) {
        if let Some(mut watcher) = self.watcher.take() {
            watcher.stop();
        }
        self.watch_rx = None;
        if let Err(err) = self.flush_now() {
            tracing::warn!(%err, "final flush failed on disconnect");
        }
        if let Err(err) = self.save_secrets_if_changed() {
            tracing::warn!(%err, "final secrets save failed on disconnect");
        }
        self.connected = false;
    }
}

impl Drop for SpaceConnection {
    fn drop(&mut self) {
        if self.connected {
            self.disconnect();
        }
    }
}

fn drain_persistable(tree: &mut RepTree, peer: &PeerId) -> Vec<TreeOp> {
    tree.pop_local_ops()
        .into_iter()
        .filter(|op| oplog::should_persist(op, peer))
        .collect()
}

fn install_tree_loader(space: &mut Space, dir: &Path, peer: &PeerId) {
    let dir = dir.to_path_buf();
    let peer = peer.clone();
    space.set_tree_loader(move |id| match oplog::read_tree_ops(&dir, id) {
        Ok(ops) if !ops.is_empty() => Some(RepTree::with_ops(peer.clone(), ops)),
        Ok(_) => None,
        Err(err) => {
            tracing::warn!(tree_id = %id, %err, "app tree load failed");
            None
        }
    });
}
