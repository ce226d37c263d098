//! redb table definitions for the coordination store.

use redb::TableDefinition;

/// Every node, keyed by its absolute path (`/a/b/c`). Intermediate nodes
/// exist as their own rows, usually with empty data.
pub const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");
