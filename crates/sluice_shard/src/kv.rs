//! The typed KV adapter over the LSM engine.
//!
//! `KvEngine` is the only storage surface the shard state machine touches:
//! point reads, ordered range reads, atomic batches with sync/nosync
//! commit, immutable snapshots, range deletion and an explicit flush. The
//! production implementation wraps a fjall keyspace; `MemoryKv` backs unit
//! tests that do not need a disk.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::Path;
use std::sync::{Arc, RwLock};

use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};

use crate::KvPair;

/// A set of mutations applied atomically.
#[derive(Clone, Debug, Default)]
pub struct KvBatch {
    pub puts: Vec<(Vec<u8>, Vec<u8>)>,
    pub deletes: Vec<Vec<u8>>,
}

impl KvBatch {
    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.puts.push((key, value));
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.deletes.push(key);
    }

    pub fn is_empty(&self) -> bool {
        self.puts.is_empty() && self.deletes.is_empty()
    }
}

/// Immutable read view captured at a point in time.
pub trait KvSnapshot: Send {
    fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>>;

    /// Ordered scan of `[lo, hi)` bounded by `limit`.
    fn range(&self, lo: &[u8], hi: &[u8], limit: usize) -> anyhow::Result<Vec<KvPair>>;
}

/// Storage engine surface used by the shard state machines.
pub trait KvEngine: Send + Sync + 'static {
    fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>>;

    /// Ordered scan of `[lo, hi)` bounded by `limit` (`usize::MAX` for all).
    fn range(&self, lo: &[u8], hi: &[u8], limit: usize) -> anyhow::Result<Vec<KvPair>>;

    /// Apply all mutations atomically. `sync` forces stable storage before
    /// returning; the state machine applies with `sync = false` because the
    /// replicated log provides durability on replay.
    fn apply_batch(&self, batch: KvBatch, sync: bool) -> anyhow::Result<()>;

    /// Delete every key in `[lo, hi)`.
    fn delete_range(&self, lo: &[u8], hi: &[u8]) -> anyhow::Result<()>;

    fn snapshot(&self) -> anyhow::Result<Box<dyn KvSnapshot>>;

    /// Flush to stable storage.
    fn sync(&self) -> anyhow::Result<()>;

    fn set(&self, key: Vec<u8>, value: Vec<u8>) -> anyhow::Result<()> {
        let mut batch = KvBatch::default();
        batch.put(key, value);
        self.apply_batch(batch, false)
    }

    fn delete(&self, key: Vec<u8>) -> anyhow::Result<()> {
        let mut batch = KvBatch::default();
        batch.delete(key);
        self.apply_batch(batch, false)
    }
}

/// Fjall-backed engine. All shards of a node share one keyspace with a
/// single data partition; shard isolation comes from the key prefix.
pub struct FjallKv {
    keyspace: Arc<Keyspace>,
    data: PartitionHandle,
}

impl FjallKv {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let keyspace = Arc::new(fjall::Config::new(path).open()?);
        let data = keyspace.open_partition("data", PartitionCreateOptions::default())?;
        Ok(Self { keyspace, data })
    }
}

impl KvEngine for FjallKv {
    fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.data.get(key)?.map(|slice| slice.to_vec()))
    }

    fn range(&self, lo: &[u8], hi: &[u8], limit: usize) -> anyhow::Result<Vec<KvPair>> {
        let mut out = Vec::new();
        for item in self.data.range(lo.to_vec()..hi.to_vec()) {
            if out.len() >= limit {
                break;
            }
            let (key, value) = item?;
            out.push(KvPair {
                key: key.to_vec(),
                value: value.to_vec(),
            });
        }
        Ok(out)
    }

    fn apply_batch(&self, batch: KvBatch, sync: bool) -> anyhow::Result<()> {
        let mut b = self.keyspace.batch();
        for (key, value) in batch.puts {
            b.insert(&self.data, key, value);
        }
        for key in batch.deletes {
            b.remove(&self.data, key);
        }
        b.commit()?;
        if sync {
            self.keyspace.persist(PersistMode::SyncAll)?;
        }
        Ok(())
    }

    fn delete_range(&self, lo: &[u8], hi: &[u8]) -> anyhow::Result<()> {
        // fjall has no native range tombstone; collect and remove in chunks
        // so one huge range does not build one huge batch.
        const CHUNK: usize = 4096;
        let mut lo = lo.to_vec();
        loop {
            let pairs = self.range(&lo, hi, CHUNK)?;
            if pairs.is_empty() {
                return Ok(());
            }
            let mut b = self.keyspace.batch();
            for pair in &pairs {
                b.remove(&self.data, pair.key.clone());
            }
            b.commit()?;
            if pairs.len() < CHUNK {
                return Ok(());
            }
            // Resume after the last deleted key.
            lo = pairs.last().expect("non-empty chunk").key.clone();
            lo.push(0);
        }
    }

    fn snapshot(&self) -> anyhow::Result<Box<dyn KvSnapshot>> {
        Ok(Box::new(FjallSnapshot {
            inner: self.data.snapshot(),
        }))
    }

    fn sync(&self) -> anyhow::Result<()> {
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }
}

struct FjallSnapshot {
    inner: fjall::Snapshot,
}

impl KvSnapshot for FjallSnapshot {
    fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.inner.get(key)?.map(|slice| slice.to_vec()))
    }

    fn range(&self, lo: &[u8], hi: &[u8], limit: usize) -> anyhow::Result<Vec<KvPair>> {
        let mut out = Vec::new();
        for item in self.inner.range(lo.to_vec()..hi.to_vec()) {
            if out.len() >= limit {
                break;
            }
            let (key, value) = item?;
            out.push(KvPair {
                key: key.to_vec(),
                value: value.to_vec(),
            });
        }
        Ok(out)
    }
}

/// In-memory engine with the same semantics, for tests.
#[derive(Default)]
pub struct MemoryKv {
    inner: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

fn scan_map(
    map: &BTreeMap<Vec<u8>, Vec<u8>>,
    lo: &[u8],
    hi: &[u8],
    limit: usize,
) -> Vec<KvPair> {
    map.range((Bound::Included(lo.to_vec()), Bound::Excluded(hi.to_vec())))
        .take(limit)
        .map(|(k, v)| KvPair {
            key: k.clone(),
            value: v.clone(),
        })
        .collect()
}

impl KvEngine for MemoryKv {
    fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        let guard = self.inner.read().expect("kv lock poisoned");
        Ok(guard.get(key).cloned())
    }

    fn range(&self, lo: &[u8], hi: &[u8], limit: usize) -> anyhow::Result<Vec<KvPair>> {
        let guard = self.inner.read().expect("kv lock poisoned");
        Ok(scan_map(&guard, lo, hi, limit))
    }

    fn apply_batch(&self, batch: KvBatch, _sync: bool) -> anyhow::Result<()> {
        let mut guard = self.inner.write().expect("kv lock poisoned");
        for (key, value) in batch.puts {
            guard.insert(key, value);
        }
        for key in batch.deletes {
            guard.remove(&key);
        }
        Ok(())
    }

    fn delete_range(&self, lo: &[u8], hi: &[u8]) -> anyhow::Result<()> {
        let mut guard = self.inner.write().expect("kv lock poisoned");
        let keys: Vec<Vec<u8>> = guard
            .range((Bound::Included(lo.to_vec()), Bound::Excluded(hi.to_vec())))
            .map(|(k, _)| k.clone())
            .collect();
        for key in keys {
            guard.remove(&key);
        }
        Ok(())
    }

    fn snapshot(&self) -> anyhow::Result<Box<dyn KvSnapshot>> {
        let guard = self.inner.read().expect("kv lock poisoned");
        Ok(Box::new(MemorySnapshot {
            data: guard.clone(),
        }))
    }

    fn sync(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

struct MemorySnapshot {
    data: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl KvSnapshot for MemorySnapshot {
    fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.data.get(key).cloned())
    }

    fn range(&self, lo: &[u8], hi: &[u8], limit: usize) -> anyhow::Result<Vec<KvPair>> {
        Ok(scan_map(&self.data, lo, hi, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engines() -> Vec<(&'static str, Arc<dyn KvEngine>)> {
        let dir = tempfile::tempdir().unwrap();
        let fjall = FjallKv::open(dir.path()).unwrap();
        // Leak the tempdir so the fjall engine outlives this helper.
        std::mem::forget(dir);
        vec![
            ("memory", Arc::new(MemoryKv::new()) as Arc<dyn KvEngine>),
            ("fjall", Arc::new(fjall)),
        ]
    }

    #[test]
    fn batch_get_range() {
        for (name, kv) in engines() {
            let mut batch = KvBatch::default();
            batch.put(b"a1".to_vec(), b"v1".to_vec());
            batch.put(b"a2".to_vec(), b"v2".to_vec());
            batch.put(b"b1".to_vec(), b"v3".to_vec());
            kv.apply_batch(batch, false).unwrap();

            assert_eq!(kv.get(b"a2").unwrap(), Some(b"v2".to_vec()), "{name}");
            assert_eq!(kv.get(b"zz").unwrap(), None, "{name}");

            let pairs = kv.range(b"a", b"b", usize::MAX).unwrap();
            assert_eq!(pairs.len(), 2, "{name}");
            assert_eq!(pairs[0].key, b"a1".to_vec(), "{name}");
            assert_eq!(pairs[1].key, b"a2".to_vec(), "{name}");

            let limited = kv.range(b"a", b"c", 1).unwrap();
            assert_eq!(limited.len(), 1, "{name}");
        }
    }

    #[test]
    fn snapshot_isolated_from_later_writes() {
        for (name, kv) in engines() {
            kv.set(b"k".to_vec(), b"old".to_vec()).unwrap();
            let snap = kv.snapshot().unwrap();
            kv.set(b"k".to_vec(), b"new".to_vec()).unwrap();
            kv.set(b"k2".to_vec(), b"x".to_vec()).unwrap();

            assert_eq!(snap.get(b"k").unwrap(), Some(b"old".to_vec()), "{name}");
            assert_eq!(snap.get(b"k2").unwrap(), None, "{name}");
            assert_eq!(kv.get(b"k").unwrap(), Some(b"new".to_vec()), "{name}");
        }
    }

    #[test]
    fn delete_range_removes_exactly_the_range() {
        for (name, kv) in engines() {
            for i in 0u8..10 {
                kv.set(vec![b'x', i], vec![i]).unwrap();
            }
            kv.delete_range(&[b'x', 2], &[b'x', 7]).unwrap();
            let left = kv.range(&[b'x'], &[b'y'], usize::MAX).unwrap();
            let keys: Vec<Vec<u8>> = left.into_iter().map(|p| p.key).collect();
            assert_eq!(
                keys,
                vec![
                    vec![b'x', 0],
                    vec![b'x', 1],
                    vec![b'x', 7],
                    vec![b'x', 8],
                    vec![b'x', 9]
                ],
                "{name}"
            );
        }
    }
}
