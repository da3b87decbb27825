//! Single-process cluster runtime.
//!
//! `LocalCluster` hosts one state machine per shard and feeds them through
//! the same serialized-entry path a replicated log would: every
//! `write_batch`/`forward` becomes a log entry with the next index for its
//! shard and is applied synchronously, so the sender blocks exactly when
//! the destination shard cannot accept more work. This is the node runtime
//! for single-node deployments and the harness the test suites run on; a
//! Raft-backed cluster drives the identical `ShardStateMachine` surface.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::info;

use sluice_core::types::{ColumnType, Rows};
use sluice_core::SluiceResult;

use crate::forward::{serialize_write_batch, COMMAND_FORWARD_WRITE, COMMAND_WRITE};
use crate::kv::KvEngine;
use crate::sm::{LookupRequest, ShardStateMachine};
use crate::{
    decode_lookup_reply, Cluster, KvPair, LogEntry, QueryExecutionInfo, RemoteQueryHandler,
    ShardListener, ShardListenerFactory, WriteBatch,
};

/// One hosted shard: its state machine plus the shard's log cursor.
pub struct ShardHolder {
    pub sm: ShardStateMachine,
    next_index: AtomicU64,
}

impl ShardHolder {
    fn next_index(&self) -> u64 {
        self.next_index.fetch_add(1, Ordering::SeqCst)
    }
}

struct NoopListener;

impl ShardListener for NoopListener {
    fn remote_write_occurred(&self) {}
}

/// Used until the push engine registers its factory, so shards opened in
/// storage-only tests still have a listener to satisfy the processor
/// invariant.
struct NoopListenerFactory;

impl ShardListenerFactory for NoopListenerFactory {
    fn create_shard_listener(&self, _shard_id: u64) -> Arc<dyn ShardListener> {
        Arc::new(NoopListener)
    }
}

pub struct LocalCluster {
    node_id: u64,
    node_ids: Vec<u64>,
    num_shards: u64,
    test_mode: bool,
    kv: Arc<dyn KvEngine>,
    query_handler: Arc<RwLock<Option<Arc<dyn RemoteQueryHandler>>>>,
    listener_factory: RwLock<Arc<dyn ShardListenerFactory>>,
    shards: RwLock<HashMap<u64, Arc<ShardHolder>>>,
    started: AtomicBool,
}

impl LocalCluster {
    pub fn new(
        node_id: u64,
        node_ids: Vec<u64>,
        num_shards: u64,
        kv: Arc<dyn KvEngine>,
        test_mode: bool,
    ) -> Arc<Self> {
        assert!(num_shards > 0, "cluster requires at least one shard");
        assert!(
            node_ids.contains(&node_id),
            "node {node_id} missing from node_ids"
        );
        Arc::new(Self {
            node_id,
            node_ids,
            num_shards,
            test_mode,
            kv,
            query_handler: Arc::new(RwLock::new(None)),
            listener_factory: RwLock::new(Arc::new(NoopListenerFactory)),
            shards: RwLock::new(HashMap::new()),
            started: AtomicBool::new(false),
        })
    }

    /// Open every shard state machine. Listener factories and query
    /// handlers must be registered before this.
    pub fn start(&self) -> anyhow::Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let factory = self.listener_factory.read().expect("factory lock").clone();
        let mut shards = self.shards.write().expect("shards lock");
        for shard_id in 0..self.num_shards {
            let processor =
                crate::sm::calc_processor(&self.node_ids, shard_id, self.node_id);
            let listener = processor.then(|| factory.create_shard_listener(shard_id));
            let sm = ShardStateMachine::new(
                shard_id,
                self.node_id,
                &self.node_ids,
                self.kv.clone(),
                listener,
                self.query_handler.clone(),
                self.test_mode,
            );
            let last_applied = sm.open()?;
            shards.insert(
                shard_id,
                Arc::new(ShardHolder {
                    sm,
                    next_index: AtomicU64::new(last_applied + 1),
                }),
            );
        }
        info!(
            node = self.node_id,
            shards = self.num_shards,
            "local cluster started"
        );
        Ok(())
    }

    pub fn stop(&self) -> anyhow::Result<()> {
        if !self.started.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let mut shards = self.shards.write().expect("shards lock");
        for holder in shards.values() {
            holder.sm.close()?;
        }
        shards.clear();
        // The query handler holds this cluster; dropping it here breaks
        // the cycle so the KV store is released with the last owner.
        *self.query_handler.write().expect("query handler lock") = None;
        Ok(())
    }

    pub fn shard(&self, shard_id: u64) -> Option<Arc<ShardHolder>> {
        self.shards.read().expect("shards lock").get(&shard_id).cloned()
    }

    fn apply_entry(&self, shard_id: u64, cmd: Vec<u8>) -> anyhow::Result<()> {
        let holder = self
            .shard(shard_id)
            .ok_or_else(|| anyhow::anyhow!("unknown shard {shard_id}"))?;
        let entry = LogEntry {
            index: holder.next_index(),
            cmd,
        };
        holder.sm.update(&[entry])?;
        Ok(())
    }
}

impl Cluster for LocalCluster {
    fn node_id(&self) -> u64 {
        self.node_id
    }

    fn shard_ids(&self) -> Vec<u64> {
        (0..self.num_shards).collect()
    }

    fn local_get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        self.kv.get(key)
    }

    fn local_scan(&self, lo: &[u8], hi: &[u8], limit: usize) -> anyhow::Result<Vec<KvPair>> {
        self.kv.range(lo, hi, limit)
    }

    fn write_batch(&self, batch: WriteBatch) -> anyhow::Result<()> {
        let shard_id = batch.shard_id;
        self.apply_entry(shard_id, serialize_write_batch(&batch, COMMAND_WRITE))
    }

    fn forward(&self, dest_shard: u64, batch: WriteBatch) -> anyhow::Result<()> {
        self.apply_entry(
            dest_shard,
            serialize_write_batch(&batch, COMMAND_FORWARD_WRITE),
        )
    }

    fn execute_remote_pull_query(
        &self,
        info: &QueryExecutionInfo,
        col_types: Vec<ColumnType>,
    ) -> SluiceResult<Rows> {
        let holder = self.shard(info.shard_id).ok_or_else(|| {
            tracing::warn!(shard = info.shard_id, "pull query for unknown shard");
            sluice_core::SluiceError::Internal(0)
        })?;
        let reply = holder
            .sm
            .lookup(&LookupRequest::encode_query(info))
            .map_err(|err| {
                tracing::warn!(error = ?err, "remote pull query lookup failed");
                sluice_core::SluiceError::Internal(0)
            })?;
        decode_lookup_reply(&reply, col_types)
    }

    fn register_shard_listener_factory(&self, factory: Arc<dyn ShardListenerFactory>) {
        assert!(
            !self.started.load(Ordering::SeqCst),
            "listener factory registered after start"
        );
        *self.listener_factory.write().expect("factory lock") = factory;
    }

    fn register_remote_query_handler(&self, handler: Arc<dyn RemoteQueryHandler>) {
        *self.query_handler.write().expect("query handler lock") = Some(handler);
    }

    fn delete_all_data_for_table(&self, table_id: u64) -> anyhow::Result<()> {
        for shard_id in 0..self.num_shards {
            let (lo, hi) = sluice_core::codec::table_range(shard_id, table_id);
            self.kv.delete_range(&lo, &hi)?;
        }
        Ok(())
    }

    fn sync(&self) -> anyhow::Result<()> {
        self.kv.sync()
    }
}
