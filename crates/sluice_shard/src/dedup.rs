//! Forward-write deduplication.
//!
//! Each forwarded batch carries a 16-byte originator id and a sequence that
//! is monotone per originator. A shard keeps the largest sequence it has
//! accepted from each originator, both in memory and persisted in the
//! `ForwardDedup` system table, so replayed forwards are dropped after
//! restart or snapshot restore.

use std::collections::HashMap;

use sluice_core::codec::{encode_table_prefix, read_u64_be, TABLE_PREFIX_LEN};
use sluice_core::schema::FORWARD_DEDUP_TABLE_ID;

use crate::KvPair;

/// Byte length of an originator id (source table id | source shard id).
pub const ORIGINATOR_ID_LEN: usize = 16;

/// In-memory `originator -> max seen sequence` map for one shard.
#[derive(Debug, Default)]
pub struct DedupCache {
    seqs: HashMap<[u8; ORIGINATOR_ID_LEN], u64>,
}

impl DedupCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the message must be applied. A message is a
    /// duplicate iff its sequence is <= the largest accepted one; on
    /// acceptance the cache advances. The caller persists the matching
    /// ledger row in the same KV batch.
    pub fn check_and_update(&mut self, originator: [u8; ORIGINATOR_ID_LEN], seq: u64) -> bool {
        match self.seqs.get_mut(&originator) {
            Some(last) if seq <= *last => false,
            Some(last) => {
                *last = seq;
                true
            }
            None => {
                self.seqs.insert(originator, seq);
                true
            }
        }
    }

    pub fn last_seq(&self, originator: &[u8; ORIGINATOR_ID_LEN]) -> Option<u64> {
        self.seqs.get(originator).copied()
    }

    pub fn len(&self) -> usize {
        self.seqs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seqs.is_empty()
    }

    /// Rebuild the cache from a scan of the shard's `ForwardDedup` range.
    /// Used on open and after snapshot restore.
    pub fn rebuild(pairs: &[KvPair]) -> anyhow::Result<DedupCache> {
        let mut cache = DedupCache::new();
        for pair in pairs {
            anyhow::ensure!(
                pair.key.len() == TABLE_PREFIX_LEN + ORIGINATOR_ID_LEN,
                "malformed dedup ledger key of length {}",
                pair.key.len()
            );
            let mut originator = [0u8; ORIGINATOR_ID_LEN];
            originator.copy_from_slice(&pair.key[TABLE_PREFIX_LEN..]);
            let mut offset = 0;
            let seq = read_u64_be(&pair.value, &mut offset)?;
            cache.seqs.insert(originator, seq);
        }
        Ok(cache)
    }
}

/// Ledger row key for one originator on one shard.
pub fn ledger_key(shard_id: u64, originator: &[u8; ORIGINATOR_ID_LEN]) -> Vec<u8> {
    let mut key = encode_table_prefix(
        shard_id,
        FORWARD_DEDUP_TABLE_ID,
        TABLE_PREFIX_LEN + ORIGINATOR_ID_LEN,
    );
    key.extend_from_slice(originator);
    key
}
