//! Op sync: filesystem watching for local spaces, wire framing for
//! remote ones. Both variants feed the same ingest surface,
//! `RepTree::merge`.

pub mod watch;
pub mod wire;
