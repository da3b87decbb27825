//! The per-shard on-disk replicated state machine.
//!
//! The replication layer delivers blocks of ordered log entries to
//! `update`, which applies them as one atomic KV batch: local writes go
//! straight to their keys, forward writes are rewritten into the receiver
//! table, deduplicated against the per-originator ledger, and stamped with
//! the deterministic batch sequence. Replicas applying the same log prefix
//! produce byte-identical shard ranges.
//!
//! Failure model: KV errors surface as apply errors (the replication layer
//! retries or crashes the replica); malformed commands and shard-prefix
//! violations are deterministic panics because they can only be programming
//! errors.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex, RwLock};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use sluice_core::codec::{
    append_u32_be, append_u32_le, append_u64_be, append_u64_le, encode_table_prefix, read_u32_le,
    read_u64_le, shard_range, table_range, TABLE_PREFIX_LEN,
};
use sluice_core::schema::{FORWARD_DEDUP_TABLE_ID, LAST_LOG_INDEX_RECEIVED_TABLE_ID, RECEIVER_TABLE_ID};
use sluice_core::SluiceError;

use crate::dedup::{ledger_key, DedupCache};
use crate::forward::{
    deserialize_write_batch, ForwardKey, COMMAND_FORWARD_WRITE, COMMAND_WRITE,
};
use crate::kv::{KvBatch, KvEngine, KvSnapshot};
use crate::snapshot::{restore_snapshot_data, save_snapshot_data};
use crate::{LogEntry, QueryExecutionInfo, RemoteQueryHandler, ShardListener, UPDATE_OK};

/// Lookup sub-protocol tag: liveness ping, empty reply.
pub const LOOKUP_PING: u8 = 1;
/// Lookup sub-protocol tag: remote pull-query page.
pub const LOOKUP_QUERY: u8 = 2;

/// A decoded lookup request. The wire format stays a one-byte tag; parsing
/// it into a variant up front keeps dispatch and validation in one place.
pub enum LookupRequest {
    Ping,
    Query(QueryExecutionInfo),
}

impl LookupRequest {
    /// Decode a lookup payload. An unknown tag is an invariant violation:
    /// only this codebase produces lookup requests.
    pub fn decode(data: &[u8]) -> anyhow::Result<LookupRequest> {
        let Some(tag) = data.first() else {
            panic!("empty lookup request");
        };
        match *tag {
            LOOKUP_PING => Ok(LookupRequest::Ping),
            LOOKUP_QUERY => Ok(LookupRequest::Query(QueryExecutionInfo::deserialize(
                &data[1..],
            )?)),
            other => panic!("invalid lookup type {other}"),
        }
    }

    pub fn encode_ping() -> Vec<u8> {
        vec![LOOKUP_PING]
    }

    pub fn encode_query(info: &QueryExecutionInfo) -> Vec<u8> {
        let body = info.serialize();
        let mut buf = Vec::with_capacity(1 + body.len());
        buf.push(LOOKUP_QUERY);
        buf.extend_from_slice(&body);
        buf
    }
}

/// One of the replicas is chosen deterministically to drive push processing
/// for the shard. It does not matter whether it is the log leader, only
/// that every replica agrees on the choice.
pub fn calc_processor(node_ids: &[u64], shard_id: u64, node_id: u64) -> bool {
    let chosen = node_ids[(shard_id % node_ids.len() as u64) as usize];
    node_id == chosen
}

struct SmState {
    dedup: DedupCache,
    receiver_seq: u64,
    batch_seq: u32,
    last_applied_index: u64,
}

/// The shard state machine. One instance per shard per replica.
pub struct ShardStateMachine {
    shard_id: u64,
    node_id: u64,
    processor: bool,
    test_mode: bool,
    kv: Arc<dyn KvEngine>,
    listener: Option<Arc<dyn ShardListener>>,
    query_handler: Arc<RwLock<Option<Arc<dyn RemoteQueryHandler>>>>,
    state: Mutex<SmState>,
}

impl ShardStateMachine {
    /// `listener` must be present iff this replica is the shard's processor.
    pub fn new(
        shard_id: u64,
        node_id: u64,
        node_ids: &[u64],
        kv: Arc<dyn KvEngine>,
        listener: Option<Arc<dyn ShardListener>>,
        query_handler: Arc<RwLock<Option<Arc<dyn RemoteQueryHandler>>>>,
        test_mode: bool,
    ) -> Self {
        let processor = calc_processor(node_ids, shard_id, node_id);
        if processor && listener.is_none() {
            panic!("no shard listener for processor replica");
        }
        Self {
            shard_id,
            node_id,
            processor,
            test_mode,
            kv,
            listener: if processor { listener } else { None },
            query_handler,
            state: Mutex::new(SmState {
                dedup: DedupCache::new(),
                receiver_seq: 0,
                batch_seq: 0,
                last_applied_index: 0,
            }),
        }
    }

    pub fn shard_id(&self) -> u64 {
        self.shard_id
    }

    pub fn is_processor(&self) -> bool {
        self.processor
    }

    /// Open the state machine: rebuild the dedup cache from its ledger and
    /// load the persisted sequences. Returns the last applied log index so
    /// the replication layer replays from there.
    pub fn open(&self) -> anyhow::Result<u64> {
        let mut state = self.state.lock().expect("sm lock poisoned");
        state.dedup = self.load_dedup_cache()?;
        let (last_applied, receiver_seq, batch_seq) = self.load_sequences()?;
        state.last_applied_index = last_applied;
        state.receiver_seq = receiver_seq;
        state.batch_seq = batch_seq;
        debug!(
            shard = self.shard_id,
            node = self.node_id,
            last_applied,
            "shard state machine opened"
        );
        Ok(last_applied)
    }

    fn load_dedup_cache(&self) -> anyhow::Result<DedupCache> {
        let (lo, hi) = table_range(self.shard_id, FORWARD_DEDUP_TABLE_ID);
        let pairs = self.kv.range(&lo, &hi, usize::MAX)?;
        DedupCache::rebuild(&pairs)
    }

    fn sequences_key(&self) -> Vec<u8> {
        encode_table_prefix(self.shard_id, LAST_LOG_INDEX_RECEIVED_TABLE_ID, TABLE_PREFIX_LEN)
    }

    fn load_sequences(&self) -> anyhow::Result<(u64, u64, u32)> {
        let Some(value) = self.kv.get(&self.sequences_key())? else {
            return Ok((0, 0, 0));
        };
        let mut offset = 0;
        let last_applied = read_u64_le(&value, &mut offset)?;
        let receiver_seq = read_u64_le(&value, &mut offset)?;
        let batch_seq = read_u32_le(&value, &mut offset)?;
        Ok((last_applied, receiver_seq, batch_seq))
    }

    // The full triplet is written exactly once per apply, in the same KV
    // batch as the applied entries.
    fn write_sequences(&self, batch: &mut KvBatch, state: &SmState) {
        let mut value = Vec::with_capacity(20);
        append_u64_le(&mut value, state.last_applied_index);
        append_u64_le(&mut value, state.receiver_seq);
        append_u32_le(&mut value, state.batch_seq);
        batch.put(self.sequences_key(), value);
    }

    /// Apply a block of log entries in order, atomically.
    pub fn update(&self, entries: &[LogEntry]) -> anyhow::Result<Vec<u64>> {
        assert!(!entries.is_empty(), "update with no entries");
        let mut state = self.state.lock().expect("sm lock poisoned");
        let mut batch = KvBatch::default();
        let mut has_forward = false;
        for entry in entries {
            let command = *entry.cmd.first().expect("empty command");
            match command {
                COMMAND_WRITE => self.handle_write(&mut batch, &entry.cmd[1..])?,
                COMMAND_FORWARD_WRITE => {
                    self.handle_forward_write(&mut state, &mut batch, &entry.cmd[1..])?;
                    has_forward = true;
                }
                other => panic!("unexpected command {other}"),
            }
        }
        // One batch sequence per update invocation: every replica sees the
        // same entry blocks, so every replica computes the same value.
        state.batch_seq = state.batch_seq.wrapping_add(1);
        state.last_applied_index = entries.last().expect("non-empty entries").index;
        self.write_sequences(&mut batch, &state);
        // Durability comes from log replay; the commit itself is nosync.
        self.kv.apply_batch(batch, false)?;
        drop(state);

        // A forward write delivers rows from another shard; the processor
        // replica kicks the push engine to drain the receiver table.
        if has_forward {
            self.maybe_trigger_remote_write_occurred();
        }
        Ok(vec![UPDATE_OK; entries.len()])
    }

    fn maybe_trigger_remote_write_occurred(&self) {
        if let Some(listener) = &self.listener {
            listener.remote_write_occurred();
        }
    }

    fn handle_write(&self, batch: &mut KvBatch, payload: &[u8]) -> anyhow::Result<()> {
        let decoded = deserialize_write_batch(payload)?;
        for put in decoded.puts {
            self.check_key(&put.key);
            batch.put(put.key, put.value);
        }
        for key in decoded.deletes {
            self.check_key(&key);
            batch.delete(key);
        }
        Ok(())
    }

    fn handle_forward_write(
        &self,
        state: &mut SmState,
        batch: &mut KvBatch,
        payload: &[u8],
    ) -> anyhow::Result<()> {
        let decoded = deserialize_write_batch(payload)?;
        if !decoded.deletes.is_empty() {
            panic!("deletes not supported for forward write");
        }
        for put in decoded.puts {
            let fk = ForwardKey::decode(&put.key)?;
            if fk.dedup_enabled {
                if !state.dedup.check_and_update(fk.originator, fk.seq) {
                    // Already accepted this (originator, seq); replay no-op.
                    continue;
                }
                let mut seq_value = Vec::with_capacity(8);
                append_u64_be(&mut seq_value, fk.seq);
                batch.put(ledger_key(self.shard_id, &fk.originator), seq_value);
            }
            // Receiver key:
            // shard | receiver_table | batch_seq | receiver_seq | consumer.
            let mut key = encode_table_prefix(
                self.shard_id,
                RECEIVER_TABLE_ID,
                TABLE_PREFIX_LEN + 12 + fk.remote_consumer_id.len(),
            );
            append_u32_be(&mut key, state.batch_seq);
            append_u64_be(&mut key, state.receiver_seq);
            key.extend_from_slice(&fk.remote_consumer_id);
            batch.put(key, put.value);
            state.receiver_seq += 1;
        }
        Ok(())
    }

    fn check_key(&self, key: &[u8]) {
        if self.test_mode {
            return;
        }
        // Sanity check: a local write must stay inside its shard prefix.
        let mut sid = [0u8; 8];
        sid.copy_from_slice(&key[0..8]);
        let sid = u64::from_be_bytes(sid);
        if sid != self.shard_id {
            panic!(
                "invalid key in sm write, expected shard {} actual {}",
                self.shard_id, sid
            );
        }
    }

    /// Read-only request path used by peers. Expected query errors are
    /// embedded in the reply (`0x00 | error`) so the replication layer does
    /// not retry a deterministic SQL failure; only unrecoverable errors
    /// fail the lookup itself.
    pub fn lookup(&self, data: &[u8]) -> anyhow::Result<Vec<u8>> {
        match LookupRequest::decode(data)? {
            LookupRequest::Ping => Ok(Vec::new()),
            LookupRequest::Query(info) => {
                let handler = self
                    .query_handler
                    .read()
                    .expect("query handler lock poisoned")
                    .clone();
                let result = match handler {
                    Some(handler) => handler.execute_remote_pull_query(&info),
                    None => Err(SluiceError::Unavailable),
                };
                match result {
                    Ok(rows) => {
                        let body = rows.serialize()?;
                        let mut reply = Vec::with_capacity(1 + body.len());
                        reply.push(1);
                        reply.extend_from_slice(&body);
                        Ok(reply)
                    }
                    Err(err) => {
                        let mut reply = vec![0u8];
                        reply.extend_from_slice(&serde_json::to_vec(&err)?);
                        Ok(reply)
                    }
                }
            }
        }
    }

    pub fn sync(&self) -> anyhow::Result<()> {
        self.kv.sync()
    }

    /// Capture the snapshot handle under the state-machine lock. Streaming
    /// happens afterwards, without the lock.
    pub fn prepare_snapshot(&self) -> anyhow::Result<Box<dyn KvSnapshot>> {
        let _state = self.state.lock().expect("sm lock poisoned");
        self.kv.snapshot()
    }

    /// Stream the shard's byte range from a prepared snapshot handle.
    pub fn save_snapshot(
        &self,
        snap: &dyn KvSnapshot,
        writer: &mut dyn Write,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        debug!(shard = self.shard_id, "saving shard snapshot");
        let (lo, hi) = shard_range(self.shard_id);
        save_snapshot_data(snap, &lo, &hi, writer, cancel)
    }

    /// Wipe the shard range, stream entries back in, rebuild the dedup
    /// cache and sequences, then signal the processor so pending receiver
    /// rows become visible to the push engine.
    pub fn recover_from_snapshot(
        &self,
        reader: &mut dyn Read,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        debug!(shard = self.shard_id, "recovering shard from snapshot");
        {
            let mut state = self.state.lock().expect("sm lock poisoned");
            let (lo, hi) = shard_range(self.shard_id);
            restore_snapshot_data(self.kv.as_ref(), &lo, &hi, reader, cancel)?;
            state.dedup = self.load_dedup_cache()?;
            let (last_applied, receiver_seq, batch_seq) = self.load_sequences()?;
            state.last_applied_index = last_applied;
            state.receiver_seq = receiver_seq;
            state.batch_seq = batch_seq;
        }
        self.maybe_trigger_remote_write_occurred();
        Ok(())
    }

    pub fn close(&self) -> anyhow::Result<()> {
        debug!(shard = self.shard_id, "shard state machine closed");
        Ok(())
    }

    /// Last applied log index, as tracked in memory.
    pub fn last_applied_index(&self) -> u64 {
        self.state.lock().expect("sm lock poisoned").last_applied_index
    }

    /// Current batch sequence (the value the next apply will stamp).
    pub fn batch_seq(&self) -> u32 {
        self.state.lock().expect("sm lock poisoned").batch_seq
    }

    pub fn receiver_seq(&self) -> u64 {
        self.state.lock().expect("sm lock poisoned").receiver_seq
    }

    /// Last accepted dedup sequence for an originator, if any.
    pub fn dedup_seq(&self, originator: &[u8; 16]) -> Option<u64> {
        self.state
            .lock()
            .expect("sm lock poisoned")
            .dedup
            .last_seq(originator)
    }
}
