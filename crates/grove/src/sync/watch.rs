//! Filesystem watcher for a shared space directory.
//!
//! Other peers append to their own JSONL files in the same space; we
//! notice new or grown files by polling sizes on a background thread
//! and ship their contents over a channel. The engine-owning thread
//! ingests on its next pump, so tree state never leaves one thread.
//!
//! Watch failures are transient: the scanner logs and keeps trying, and
//! the space keeps working in one-way-sync mode meanwhile.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::Sender;

use grove_core::{PeerId, VertexId};

use crate::layout;

/// Something another peer changed under the space directory.
#[derive(Clone, Debug, PartialEq)]
pub enum WatchEvent {
    /// A peer op file appeared or grew; `content` is the full file.
    Ops {
        tree: VertexId,
        peer: PeerId,
        content: String,
    },
    /// The secrets blob changed on disk.
    Secrets,
}

pub struct Watcher {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Watcher {
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Spawn the scanner thread. The first sweep only records what already
/// exists (the caller has loaded that state from disk); later sweeps
/// emit events for changes.
pub fn spawn(
    space_dir: PathBuf,
    self_peer: PeerId,
    interval: Duration,
    tx: Sender<WatchEvent>,
) -> Watcher {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = Arc::clone(&stop);

    let thread = std::thread::spawn(move || {
        let mut scanner = Scanner {
            space_dir,
            self_peer,
            sizes: HashMap::new(),
            secrets_len: None,
        };
        scanner.sweep(None);

        while !stop_flag.load(Ordering::Relaxed) {
            std::thread::sleep(interval);
            if stop_flag.load(Ordering::Relaxed) {
                break;
            }
            scanner.sweep(Some(&tx));
        }
    });

    Watcher {
        stop,
        thread: Some(thread),
    }
}

struct Scanner {
    space_dir: PathBuf,
    self_peer: PeerId,
    sizes: HashMap<PathBuf, u64>,
    secrets_len: Option<u64>,
}

impl Scanner {
    /// One pass over the space. `tx == None` on the baseline sweep.
    fn sweep(&mut self, tx: Option<&Sender<WatchEvent>>) {
        let mut files = Vec::new();
        collect_op_files(&layout::ops_dir(&self.space_dir), &mut files);

        for path in files {
            let len = match fs::metadata(&path) {
                Ok(meta) => meta.len(),
                Err(err) => {
                    tracing::warn!(path = %path.display(), %err, "watch stat failed");
                    continue;
                }
            };
            let changed = self.sizes.get(&path) != Some(&len);
            self.sizes.insert(path.clone(), len);
            if !changed {
                continue;
            }
            let Some(tx) = tx else { continue };
            let Some((tree, peer)) = layout::parse_op_path(&self.space_dir, &path) else {
                continue;
            };
            if peer == self.self_peer {
                continue;
            }
            match fs::read_to_string(&path) {
                Ok(content) => {
                    let _ = tx.send(WatchEvent::Ops {
                        tree,
                        peer,
                        content,
                    });
                }
                Err(err) => {
                    tracing::warn!(path = %path.display(), %err, "watch read failed");
                }
            }
        }

        let secrets = layout::secrets_path(&self.space_dir);
        let len = fs::metadata(&secrets).ok().map(|m| m.len());
        if len != self.secrets_len {
            self.secrets_len = len;
            if let (Some(tx), Some(_)) = (tx, len) {
                let _ = tx.send(WatchEvent::Secrets);
            }
        }
    }
}

fn collect_op_files(dir: &Path, out: &mut Vec<PathBuf>) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return,
        Err(err) => {
            tracing::warn!(path = %dir.display(), %err, "watch scan failed");
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_op_files(&path, out);
        } else if path.extension().and_then(|e| e.to_str()) == Some(layout::OPS_EXT) {
            out.push(path);
        }
    }
}
