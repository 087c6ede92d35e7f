//! Append-only JSONL op persistence.
//!
//! Write path: one append per flush tick into the current-day file for
//! (tree, peer). Read path: walk date directories ascending, parse every
//! peer file, feed the aggregate multiset to the engine. A corrupt line
//! is skipped with a warning; merge order does not matter.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use grove_core::{decode_line, encode_line, PeerId, TreeOp, VertexId};

use crate::error::SpaceError;
use crate::layout;

/// Whether this op belongs in our on-disk log. Transient ops never
/// persist; move ops authored by other peers are persisted by their
/// own peers and only ever reach us through sync.
pub fn should_persist(op: &TreeOp, self_peer: &PeerId) -> bool {
    if op.is_transient() {
        return false;
    }
    match op {
        TreeOp::Move(mv) => mv.id.peer == *self_peer,
        TreeOp::SetProperty(_) => true,
    }
}

/// Append ops to the (tree, date, peer) file, creating directories as
/// needed. Returns the file written.
pub fn append_ops(
    space_dir: &Path,
    tree: &VertexId,
    peer: &PeerId,
    date: time::Date,
    ops: &[TreeOp],
) -> Result<PathBuf, SpaceError> {
    let path = layout::day_file(space_dir, tree, date, peer);
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(|source| SpaceError::io(dir, source))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|source| SpaceError::io(&path, source))?;

    let mut buf = String::new();
    for op in ops {
        buf.push_str(&encode_line(op));
        buf.push('\n');
    }
    file.write_all(buf.as_bytes())
        .map_err(|source| SpaceError::io(&path, source))?;
    Ok(path)
}

/// Load the full op multiset for one tree. Missing directories mean an
/// empty tree, not an error.
pub fn read_tree_ops(space_dir: &Path, tree: &VertexId) -> Result<Vec<TreeOp>, SpaceError> {
    let dir = layout::tree_ops_dir(space_dir, tree);
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut dates: Vec<(time::Date, PathBuf)> = Vec::new();
    for entry in fs::read_dir(&dir).map_err(|source| SpaceError::io(&dir, source))? {
        let entry = entry.map_err(|source| SpaceError::io(&dir, source))?;
        let name = entry.file_name();
        let Some(date) = name.to_str().and_then(layout::parse_date) else {
            continue;
        };
        dates.push((date, entry.path()));
    }
    dates.sort_by_key(|(date, _)| *date);

    let mut ops = Vec::new();
    for (_, date_dir) in dates {
        let mut files: Vec<PathBuf> = fs::read_dir(&date_dir)
            .map_err(|source| SpaceError::io(&date_dir, source))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some(layout::OPS_EXT))
            .collect();
        files.sort();

        for path in files {
            let Some(peer) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| PeerId::new(s).ok())
            else {
                tracing::warn!(path = %path.display(), "op file name is not a peer id, skipping");
                continue;
            };
            let content =
                fs::read_to_string(&path).map_err(|source| SpaceError::io(&path, source))?;
            ops.extend(parse_lines(&content, &peer, &path));
        }
    }
    Ok(ops)
}

/// Decode JSONL content for one peer, dropping corrupt lines.
pub fn parse_lines(content: &str, peer: &PeerId, origin: &Path) -> Vec<TreeOp> {
    let mut ops = Vec::new();
    for (lineno, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match decode_line(line, peer) {
            Ok(op) => ops.push(op),
            Err(err) => {
                tracing::warn!(
                    path = %origin.display(),
                    line = lineno + 1,
                    %err,
                    "skipping corrupt op line"
                );
            }
        }
    }
    ops
}

pub fn today() -> time::Date {
    time::OffsetDateTime::now_utc().date()
}

#[cfg(test)]
mod tests {
    use super::*;
    use grove_core::{MoveOp, OpId, RepTree, SetPropertyOp};
    use tempfile::TempDir;

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

    #[test]
    fn append_then_read_roundtrips() {
        let dir = TempDir::new().unwrap();
        let tree = vid("ab12cd");
        let p = peer("p1");
        let date = time::macros::date!(2026 - 01 - 02);

        let ops = vec![mv(1, "p1", "root", None), mv(2, "p1", "x", Some("root"))];
        append_ops(dir.path(), &tree, &p, date, &ops).unwrap();

        let read = read_tree_ops(dir.path(), &tree).unwrap();
        assert_eq!(read, ops);
    }

    #[test]
    fn read_merges_days_ascending_and_all_peers() {
        let dir = TempDir::new().unwrap();
        let tree = vid("ab12cd");
        let d1 = time::macros::date!(2026 - 01 - 01);
        let d2 = time::macros::date!(2026 - 01 - 02);

        append_ops(dir.path(), &tree, &peer("b"), d2, &[mv(3, "b", "y", Some("root"))]).unwrap();
        append_ops(dir.path(), &tree, &peer("a"), d1, &[mv(1, "a", "root", None)]).unwrap();
        append_ops(dir.path(), &tree, &peer("a"), d2, &[mv(2, "a", "x", Some("root"))]).unwrap();

        let read = read_tree_ops(dir.path(), &tree).unwrap();
        assert_eq!(read.len(), 3);
        // Day 1 before day 2 regardless of write order.
        assert_eq!(read[0].id().counter, 1);

        // Whatever the on-disk order, the engine converges.
        let engine = RepTree::with_ops(peer("obs"), read);
        assert_eq!(engine.store().parent(&vid("y")), Some(vid("root")));
    }

    #[test]
    fn corrupt_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        let tree = vid("ab12cd");
        let p = peer("p1");
        let date = time::macros::date!(2026 - 01 - 02);
        append_ops(dir.path(), &tree, &p, date, &[mv(1, "p1", "root", None)]).unwrap();

        let path = layout::day_file(dir.path(), &tree, date, &p);
        let mut content = fs::read_to_string(&path).unwrap();
        content.push_str("this is not an op\n");
        content.push_str(&grove_core::encode_line(&mv(2, "p1", "x", Some("root"))));
        content.push('\n');
        fs::write(&path, content).unwrap();

        let read = read_tree_ops(dir.path(), &tree).unwrap();
        assert_eq!(read.len(), 2);
    }

    #[test]
    fn missing_tree_dir_reads_empty() {
        let dir = TempDir::new().unwrap();
        assert!(read_tree_ops(dir.path(), &vid("zz99"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn transient_and_foreign_moves_do_not_persist() {
        let me = peer("me");
        let transient = TreeOp::SetProperty(SetPropertyOp {
            id: OpId::new(5, me.clone()),
            target: vid("v"),
            key: "text".into(),
            value: Some("draft".into()),
            transient: true,
        });
        let foreign_move = mv(6, "other", "v", Some("root"));
        let own_move = mv(7, "me", "v", Some("root"));

        assert!(!should_persist(&transient, &me));
        assert!(!should_persist(&foreign_move, &me));
        assert!(should_persist(&own_move, &me));
    }
}
