//! On-disk layout of a space directory.
//!
//! ```text
//! <space>/
//!   space.json                          {"id": "<spaceId>"}
//!   secrets                             base64(iv | ciphertext)
//!   ops/<tt>/<rest>/<YYYY-MM-DD>/<peerId>.jsonl
//! ```
//!
//! `tt` is the first two characters of the tree id, `rest` the
//! remainder. One file per (tree, day, peer); the peer id is recovered
//! from the file name, the tree id from the directory pair.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use time::format_description::FormatItem;
use time::macros::format_description;
use time::Date;

use grove_core::{PeerId, VertexId};

pub const POINTER_FILE: &str = "space.json";
pub const SECRETS_FILE: &str = "secrets";
pub const OPS_DIR: &str = "ops";
pub const OPS_EXT: &str = "jsonl";

const DATE_FORMAT: &[FormatItem<'static>] = format_description!("[year]-[month]-[day]");

/// Contents of `space.json`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpacePointer {
    pub id: String,
}

pub fn pointer_path(space_dir: &Path) -> PathBuf {
    space_dir.join(POINTER_FILE)
}

pub fn secrets_path(space_dir: &Path) -> PathBuf {
    space_dir.join(SECRETS_FILE)
}

pub fn ops_dir(space_dir: &Path) -> PathBuf {
    space_dir.join(OPS_DIR)
}

fn split_tree_id(id: &str) -> (&str, &str) {
    if id.len() > 2 {
        id.split_at(2)
    } else {
        // Degenerate ids still get a two-level home.
        (id, "_")
    }
}

/// `ops/<tt>/<rest>` for one tree.
pub fn tree_ops_dir(space_dir: &Path, tree: &VertexId) -> PathBuf {
    let (tt, rest) = split_tree_id(tree.as_str());
    ops_dir(space_dir).join(tt).join(rest)
}

/// The current-day file this peer appends to.
pub fn day_file(space_dir: &Path, tree: &VertexId, date: Date, peer: &PeerId) -> PathBuf {
    tree_ops_dir(space_dir, tree)
        .join(format_date(date))
        .join(format!("{}.{}", peer, OPS_EXT))
}

pub fn format_date(date: Date) -> String {
    date.format(DATE_FORMAT).unwrap_or_default()
}

pub fn parse_date(name: &str) -> Option<Date> {
    Date::parse(name, DATE_FORMAT).ok()
}

/// Recover `(tree id, peer id)` from an op file path.
///
/// Accepts any path ending in `ops/<tt>/<rest>/<date>/<peer>.jsonl`;
/// watcher events carry absolute paths.
pub fn parse_op_path(space_dir: &Path, path: &Path) -> Option<(VertexId, PeerId)> {
    let rel = path.strip_prefix(space_dir).ok()?;
    let mut parts = rel.iter().map(|c| c.to_str().unwrap_or_default());
    if parts.next()? != OPS_DIR {
        return None;
    }
    let tt = parts.next()?;
    let rest = parts.next()?;
    let date = parts.next()?;
    let file = parts.next()?;
    if parts.next().is_some() || parse_date(date).is_none() {
        return None;
    }
    let stem = file.strip_suffix(&format!(".{}", OPS_EXT))?;

    let tree_id = if rest == "_" {
        tt.to_string()
    } else {
        format!("{}{}", tt, rest)
    };
    let tree = VertexId::new(tree_id).ok()?;
    let peer = PeerId::new(stem).ok()?;
    Some((tree, peer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    fn vid(s: &str) -> VertexId {
        VertexId::new(s).unwrap()
    }

    #[test]
    fn day_file_partitions_by_tree_date_peer() {
        let peer = PeerId::new("peer-1").unwrap();
        let path = day_file(
            Path::new("/sp"),
            &vid("ab12cd"),
            date!(2026 - 03 - 01),
            &peer,
        );
        assert_eq!(
            path,
            Path::new("/sp/ops/ab/12cd/2026-03-01/peer-1.jsonl")
        );
    }

    #[test]
    fn op_path_roundtrip() {
        let space = Path::new("/sp");
        let tree = vid("ab12cd");
        let peer = PeerId::new("peer-1").unwrap();
        let path = day_file(space, &tree, date!(2026 - 03 - 01), &peer);
        assert_eq!(parse_op_path(space, &path), Some((tree, peer)));
    }

    #[test]
    fn parse_rejects_foreign_paths() {
        let space = Path::new("/sp");
        assert_eq!(parse_op_path(space, Path::new("/sp/secrets")), None);
        assert_eq!(
            parse_op_path(space, Path::new("/sp/ops/ab/12cd/not-a-date/p.jsonl")),
            None
        );
        assert_eq!(
            parse_op_path(space, Path::new("/sp/ops/ab/12cd/2026-03-01/p.txt")),
            None
        );
    }

    #[test]
    fn date_format_roundtrip() {
        let d = date!(2025 - 12 - 31);
        assert_eq!(format_date(d), "2025-12-31");
        assert_eq!(parse_date("2025-12-31"), Some(d));
        assert_eq!(parse_date("2025-13-01"), None);
    }

    #[test]
    fn pointer_serde_shape() {
        let pointer = SpacePointer {
            id: "abc123".into(),
        };
        let json = serde_json::to_string(&pointer).unwrap();
        assert_eq!(json, r#"{"id":"abc123"}"#);
    }
}
