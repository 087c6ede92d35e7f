//! Wire layer for remote spaces.
//!
//! A single duplex channel carries op batches (the JSONL line form plus
//! the authoring peer) and request/response/broadcast envelopes. The
//! routes themselves are opaque to the core: handlers are registered by
//! the application layer, and op batches flow into `RepTree::merge`
//! regardless of arrival order.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use grove_core::{PeerId, VertexId};

use crate::error::SpaceError;
use crate::oplog;
use crate::space::Space;

// =====================================================================
// Op exchange
// =====================================================================

/// A group of op lines from one peer for one tree. `lines` are exactly
/// the JSONL form used on disk.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OpBatch {
    pub tree_id: String,
    pub peer_id: String,
    pub lines: Vec<String>,
}

/// One frame on the duplex channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SyncMessage {
    /// Initial op-list snapshot sent on connect.
    Snapshot { batches: Vec<OpBatch> },
    /// Incremental ops.
    Ops { batch: OpBatch },
    Request { request: RequestEnvelope },
    Response { response: ResponseEnvelope },
}

/// Merge a batch into the space tree or the addressed app tree.
/// Returns how many lines decoded; corrupt lines are dropped.
pub fn apply_op_batch(space: &mut Space, batch: &OpBatch) -> Result<usize, SpaceError> {
    let peer = PeerId::new(batch.peer_id.as_str())?;
    let tree_id = VertexId::new(batch.tree_id.as_str())?;
    let content = batch.lines.join("\n");
    let ops = oplog::parse_lines(&content, &peer, std::path::Path::new("wire"));
    let applied = ops.len();

    if space.id().as_ref() == Some(&tree_id) {
        space.tree_mut().merge(ops);
    } else if let Some(app_tree) = space.load_app_tree(&tree_id) {
        app_tree.tree_mut().merge(ops);
    } else {
        return Err(SpaceError::MissingTree {
            id: batch.tree_id.clone(),
        });
    }
    Ok(applied)
}

// =====================================================================
// Request / response / broadcast envelopes
// =====================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BroadcastAction {
    Post,
    Update,
    Delete,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "verb", content = "action", rename_all = "UPPERCASE")]
pub enum Verb {
    Get,
    Post,
    Delete,
    Broadcast(BroadcastAction),
}

/// `{route, verb, data}` as sent by a client or broadcast origin.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub route: String,
    #[serde(flatten)]
    pub verb: Verb,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponseEnvelope {
    pub fn ok(data: Option<Value>) -> Self {
        Self { data, error: None }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Route params plus request payload, handed to handlers.
#[derive(Debug, Default)]
pub struct RequestContext {
    pub params: HashMap<String, String>,
    pub data: Option<Value>,
}

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("no route matches `{route}`")]
    NotFound { route: String },
    #[error("route `{route}` does not accept this verb")]
    MethodNotAllowed { route: String },
    #[error("broadcast rejected by validator")]
    BroadcastRejected,
    #[error("{0}")]
    Handler(String),
}

type Handler = Box<dyn FnMut(&RequestContext) -> Result<Option<Value>, RouteError> + Send>;
type Validator = Box<dyn FnMut(BroadcastAction, &RequestContext) -> bool + Send>;

#[derive(Clone, Debug, PartialEq)]
enum Segment {
    Literal(String),
    Param(String),
}

struct RouteEntry {
    segments: Vec<Segment>,
    handlers: HashMap<Verb, Handler>,
    validate_broadcast: Option<Validator>,
}

/// Pattern router over request envelopes. Patterns use `:name` segments,
/// e.g. `threads/:id`.
#[derive(Default)]
pub struct Router {
    routes: Vec<RouteEntry>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(
        &mut self,
        pattern: &str,
        verb: Verb,
        handler: impl FnMut(&RequestContext) -> Result<Option<Value>, RouteError> + Send + 'static,
    ) {
        let segments = parse_pattern(pattern);
        let entry = self.entry_mut(segments);
        entry.handlers.insert(verb, Box::new(handler));
    }

    /// Hook consulted before any broadcast handler on this pattern runs.
    pub fn validate_broadcast(
        &mut self,
        pattern: &str,
        validator: impl FnMut(BroadcastAction, &RequestContext) -> bool + Send + 'static,
    ) {
        let segments = parse_pattern(pattern);
        let entry = self.entry_mut(segments);
        entry.validate_broadcast = Some(Box::new(validator));
    }

    fn entry_mut(&mut self, segments: Vec<Segment>) -> &mut RouteEntry {
        if let Some(index) = self.routes.iter().position(|r| r.segments == segments) {
            return &mut self.routes[index];
        }
        self.routes.push(RouteEntry {
            segments,
            handlers: HashMap::new(),
            validate_broadcast: None,
        });
        self.routes.last_mut().expect("just pushed")
    }

    pub fn dispatch(&mut self, request: &RequestEnvelope) -> ResponseEnvelope {
        match self.try_dispatch(request) {
            Ok(data) => ResponseEnvelope::ok(data),
            Err(err) => ResponseEnvelope::err(err.to_string()),
        }
    }

    fn try_dispatch(&mut self, request: &RequestEnvelope) -> Result<Option<Value>, RouteError> {
        let entry = self
            .routes
            .iter_mut()
            .find_map(|entry| {
                match_segments(&entry.segments, &request.route).map(|params| (entry, params))
            })
            .ok_or_else(|| RouteError::NotFound {
                route: request.route.clone(),
            })?;
        let (entry, params) = entry;

        let ctx = RequestContext {
            params,
            data: request.data.clone(),
        };

        if let Verb::Broadcast(action) = request.verb {
            if let Some(validator) = entry.validate_broadcast.as_mut() {
                if !validator(action, &ctx) {
                    return Err(RouteError::BroadcastRejected);
                }
            }
        }

        let handler =
            entry
                .handlers
                .get_mut(&request.verb)
                .ok_or_else(|| RouteError::MethodNotAllowed {
                    route: request.route.clone(),
                })?;
        handler(&ctx)
    }
}

fn parse_pattern(pattern: &str) -> Vec<Segment> {
    pattern
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|s| match s.strip_prefix(':') {
            Some(name) => Segment::Param(name.to_string()),
            None => Segment::Literal(s.to_string()),
        })
        .collect()
}

fn match_segments(segments: &[Segment], route: &str) -> Option<HashMap<String, String>> {
    let parts: Vec<&str> = route.split('/').filter(|s| !s.is_empty()).collect();
    if parts.len() != segments.len() {
        return None;
    }
    let mut params = HashMap::new();
    for (segment, part) in segments.iter().zip(parts) {
        match segment {
            Segment::Literal(lit) if lit == part => {}
            Segment::Literal(_) => return None,
            Segment::Param(name) => {
                params.insert(name.clone(), part.to_string());
            }
        }
    }
    Some(params)
}
