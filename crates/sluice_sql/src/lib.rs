//! The Sluice SQL engines.
//!
//! `parplan` is the seam to the embedded parser/planner; `push` maintains
//! materialized views incrementally as rows arrive from sources, and `pull`
//! answers ad-hoc queries by splitting a physical plan into a local part
//! and remote parts executed on peer shards. `aggfuncs` holds the
//! aggregate-function state shared by the two-tier aggregator.

pub mod aggfuncs;
pub mod parplan;
pub mod pull;
pub mod push;

use sluice_core::schema::TableInfo;
use sluice_core::SluiceResult;

/// Resolves table names against the catalog. Implemented by the server's
/// meta controller; the engines never see the registry itself.
pub trait TableResolver: Send + Sync {
    fn resolve_table(&self, schema_name: &str, table_name: &str) -> SluiceResult<TableInfo>;
}
