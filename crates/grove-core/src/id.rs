//! Identity atoms.
//!
//! PeerId: stable identifier of one engine instance.
//! VertexId: tree node identifier.
//!
//! Both are validated strings. Generated ids are GUIDs, but any non-empty
//! string is accepted so that op logs written by other implementations
//! remain readable.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::{CoreError, InvalidId};

/// Peer identifier - non-empty string after trimming.
///
/// The lexicographic `Ord` on the inner string is load-bearing: it is the
/// OpId tiebreak, so it must be total and identical on every peer.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerId(String);

impl PeerId {
    pub fn new(s: impl Into<String>) -> Result<Self, CoreError> {
        let s = s.into();
        if s.trim().is_empty() {
            Err(InvalidId::Peer {
                raw: s,
                reason: "empty".into(),
            }
            .into())
        } else {
            Ok(Self(s))
        }
    }

    /// Generate a fresh GUID peer id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({:?})", self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for PeerId {
    type Error = CoreError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        PeerId::new(s)
    }
}

impl From<PeerId> for String {
    fn from(id: PeerId) -> String {
        id.0
    }
}

/// Vertex identifier - non-empty string, GUID when generated by this engine.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VertexId(String);

impl VertexId {
    pub fn new(s: impl Into<String>) -> Result<Self, CoreError> {
        let s = s.into();
        if s.trim().is_empty() {
            Err(InvalidId::Vertex {
                raw: s,
                reason: "empty".into(),
            }
            .into())
        } else {
            Ok(Self(s))
        }
    }

    /// Generate a fresh GUID vertex id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for VertexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VertexId({:?})", self.0)
    }
}

impl fmt::Display for VertexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for VertexId {
    type Error = CoreError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        VertexId::new(s)
    }
}

impl From<VertexId> for String {
    fn from(id: VertexId) -> String {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_rejects_empty() {
        assert!(PeerId::new("").is_err());
        assert!(PeerId::new("   ").is_err());
    }

    #[test]
    fn peer_id_serde_validates_on_deserialize() {
        let peer: PeerId = serde_json::from_str(r#""p1""#).unwrap();
        assert_eq!(peer.as_str(), "p1");

        let err = serde_json::from_str::<PeerId>(r#""""#).unwrap_err();
        assert!(err.to_string().contains("empty"));
    }

    #[test]
    fn vertex_id_roundtrip() {
        let id = VertexId::generate();
        let json = serde_json::to_string(&id).unwrap();
        let back: VertexId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn generated_ids_are_distinct() {
        assert_ne!(VertexId::generate(), VertexId::generate());
        assert_ne!(PeerId::generate(), PeerId::generate());
    }

    #[test]
    fn peer_order_is_lexicographic() {
        let a = PeerId::new("a").unwrap();
        let b = PeerId::new("b").unwrap();
        assert!(a < b);
    }
}
