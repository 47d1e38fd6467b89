//! Error types surfaced by the peer-table cache.

use thiserror::Error;

/// Failures a table operation can surface to the caller.
///
/// Only persistence fails loudly. Operational outcomes such as a full bucket
/// or an unknown peer are normal Kademlia behavior and are reported as empty
/// results or silently absorbed updates.
#[derive(Debug, Error)]
pub enum TableError {
    #[error("peer table cache I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("peer table cache is malformed: {0}")]
    Decode(#[from] serde_json::Error),
}
