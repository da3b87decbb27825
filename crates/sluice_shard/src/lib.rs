//! Shard runtime for Sluice: the on-disk replicated state machine, the KV
//! adapter it writes through, cross-shard forwarding, and the `Cluster`
//! trait the SQL engines program against.
//!
//! The replication layer (an external Raft implementation) drives each
//! shard's [`sm::ShardStateMachine`] through `open`/`update`/`lookup`/
//! snapshot calls; [`local::LocalCluster`] hosts every shard of a node in
//! one process and drives the same entry path a replicated log would, which
//! is also how the test suites exercise the stack.

use std::collections::BTreeMap;
use std::sync::Arc;

use sluice_core::codec::{append_bytes, append_u32_le, append_u64_be, read_bytes, read_u32_le, read_u64_be, read_u8};
use sluice_core::types::{ColumnType, Rows};
use sluice_core::{SluiceError, SluiceResult};

pub mod dedup;
pub mod forward;
pub mod kv;
pub mod local;
pub mod sharder;
pub mod sm;
pub mod snapshot;

/// One replicated log entry as delivered by the replication layer.
#[derive(Clone, Debug)]
pub struct LogEntry {
    pub index: u64,
    pub cmd: Vec<u8>,
}

/// Per-entry result value returned from a successful apply.
pub const UPDATE_OK: u64 = 1;

/// A key/value pair, used by scans and the write-batch codec.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KvPair {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// A batch of puts and deletes destined for one shard.
///
/// Serialized into a single log entry; the shard state machine applies the
/// whole batch atomically.
#[derive(Clone, Debug, Default)]
pub struct WriteBatch {
    pub shard_id: u64,
    pub puts: Vec<(Vec<u8>, Vec<u8>)>,
    pub deletes: Vec<Vec<u8>>,
}

impl WriteBatch {
    pub fn new(shard_id: u64) -> Self {
        Self {
            shard_id,
            puts: Vec::new(),
            deletes: Vec::new(),
        }
    }

    pub fn add_put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.puts.push((key, value));
    }

    pub fn add_delete(&mut self, key: Vec<u8>) {
        self.deletes.push(key);
    }

    pub fn is_empty(&self) -> bool {
        self.puts.is_empty() && self.deletes.is_empty()
    }
}

/// Notified when a forward write lands on a shard this replica processes.
pub trait ShardListener: Send + Sync {
    fn remote_write_occurred(&self);
}

/// Creates one listener per shard; registered by the push engine before the
/// cluster starts so processor replicas can signal it.
pub trait ShardListenerFactory: Send + Sync {
    fn create_shard_listener(&self, shard_id: u64) -> Arc<dyn ShardListener>;
}

/// Executes the remote part of a pull query on behalf of a peer node.
///
/// Implemented by the pull engine; invoked from the shard state machine's
/// lookup path.
pub trait RemoteQueryHandler: Send + Sync {
    fn execute_remote_pull_query(&self, info: &QueryExecutionInfo) -> SluiceResult<Rows>;
}

/// Everything a remote shard needs to run one page of a pull query.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryExecutionInfo {
    /// `<node_id>-<uuid>`, keys the peer's execution-context cache.
    pub execution_id: String,
    pub schema_name: String,
    pub query: String,
    pub shard_id: u64,
    pub limit: u32,
    /// System queries are honored before the peer signals availability.
    pub system_query: bool,
}

impl QueryExecutionInfo {
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            32 + self.execution_id.len() + self.schema_name.len() + self.query.len(),
        );
        append_bytes(&mut buf, self.execution_id.as_bytes());
        append_bytes(&mut buf, self.schema_name.as_bytes());
        append_bytes(&mut buf, self.query.as_bytes());
        append_u64_be(&mut buf, self.shard_id);
        append_u32_le(&mut buf, self.limit);
        buf.push(self.system_query as u8);
        buf
    }

    pub fn deserialize(data: &[u8]) -> anyhow::Result<QueryExecutionInfo> {
        let mut offset = 0;
        let execution_id = std::str::from_utf8(read_bytes(data, &mut offset)?)?.to_string();
        let schema_name = std::str::from_utf8(read_bytes(data, &mut offset)?)?.to_string();
        let query = std::str::from_utf8(read_bytes(data, &mut offset)?)?.to_string();
        let shard_id = read_u64_be(data, &mut offset)?;
        let limit = read_u32_le(data, &mut offset)?;
        let system_query = read_u8(data, &mut offset)? != 0;
        anyhow::ensure!(offset == data.len(), "trailing bytes in query info");
        Ok(QueryExecutionInfo {
            execution_id,
            schema_name,
            query,
            shard_id,
            limit,
            system_query,
        })
    }
}

/// The cluster surface consumed by the push/pull engines and the DDL layer.
///
/// `write_batch` and `forward` go through the replicated log; `local_get`
/// and `local_scan` read this node's KV store directly.
pub trait Cluster: Send + Sync {
    fn node_id(&self) -> u64;

    /// All shard ids in the cluster, ascending.
    fn shard_ids(&self) -> Vec<u64>;

    fn local_get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>>;

    /// Ordered scan of `[lo, hi)`; `limit == usize::MAX` means unbounded.
    fn local_scan(&self, lo: &[u8], hi: &[u8], limit: usize) -> anyhow::Result<Vec<KvPair>>;

    /// Apply a batch of local mutations to the batch's shard.
    fn write_batch(&self, batch: WriteBatch) -> anyhow::Result<()>;

    /// Deliver forwarded rows to `dest_shard`. Blocks when the destination
    /// cannot accept more work (the log queue is the backpressure bound).
    fn forward(&self, dest_shard: u64, batch: WriteBatch) -> anyhow::Result<()>;

    /// Run one page of a remote pull query against a peer shard.
    fn execute_remote_pull_query(
        &self,
        info: &QueryExecutionInfo,
        col_types: Vec<ColumnType>,
    ) -> SluiceResult<Rows>;

    fn register_shard_listener_factory(&self, factory: Arc<dyn ShardListenerFactory>);

    fn register_remote_query_handler(&self, handler: Arc<dyn RemoteQueryHandler>);

    /// Remove every row of `table_id` on every shard. Used by DDL cleanup
    /// when a table is dropped or a failed create is rolled back.
    fn delete_all_data_for_table(&self, table_id: u64) -> anyhow::Result<()>;

    /// Flush the KV store to stable storage.
    fn sync(&self) -> anyhow::Result<()>;
}

/// Decode a lookup reply: `0x01 | rows` on success, `0x00 | error-json` for
/// an expected (user-visible) error.
pub fn decode_lookup_reply(reply: &[u8], col_types: Vec<ColumnType>) -> SluiceResult<Rows> {
    if reply.is_empty() {
        return Err(internal_anyhow(anyhow::anyhow!("empty lookup reply")));
    }
    match reply[0] {
        0 => {
            let err: SluiceError = serde_json::from_slice(&reply[1..])
                .unwrap_or(SluiceError::Internal(0));
            Err(err)
        }
        1 => Rows::deserialize(&reply[1..], col_types).map_err(internal_anyhow),
        other => Err(internal_anyhow(anyhow::anyhow!(
            "unknown lookup reply tag {other}"
        ))),
    }
}

// Internal errors are logged at the point of failure and redacted here; the
// API surface assigns the client-visible sequence number.
fn internal_anyhow(err: anyhow::Error) -> SluiceError {
    tracing::warn!(error = ?err, "internal error in shard layer");
    SluiceError::Internal(0)
}

/// Group scan results by a key prefix length, preserving scan order inside
/// and across groups.
pub fn group_pairs_by_prefix(pairs: Vec<KvPair>, prefix_len: usize) -> Vec<Vec<KvPair>> {
    let mut grouped: BTreeMap<Vec<u8>, Vec<KvPair>> = BTreeMap::new();
    for pair in pairs {
        let prefix = pair.key[..prefix_len.min(pair.key.len())].to_vec();
        grouped.entry(prefix).or_default().push(pair);
    }
    grouped.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_info_round_trip() {
        let info = QueryExecutionInfo {
            execution_id: "2-3f1c".into(),
            schema_name: "test".into(),
            query: "select * from t".into(),
            shard_id: 5,
            limit: 1000,
            system_query: false,
        };
        let bytes = info.serialize();
        let back = QueryExecutionInfo::deserialize(&bytes).unwrap();
        assert_eq!(info, back);
    }

    #[test]
    fn query_info_rejects_trailing_bytes() {
        let info = QueryExecutionInfo {
            execution_id: "1-x".into(),
            schema_name: "s".into(),
            query: "q".into(),
            shard_id: 0,
            limit: 1,
            system_query: true,
        };
        let mut bytes = info.serialize();
        bytes.push(9);
        assert!(QueryExecutionInfo::deserialize(&bytes).is_err());
    }

    #[test]
    fn lookup_reply_error_round_trip() {
        let err = SluiceError::table_not_exists("test", "missing");
        let mut reply = vec![0u8];
        reply.extend_from_slice(&serde_json::to_vec(&err).unwrap());
        let got = decode_lookup_reply(&reply, vec![]).unwrap_err();
        assert_eq!(got, err);
    }
}
