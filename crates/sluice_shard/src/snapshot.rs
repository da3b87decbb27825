//! Framed snapshot streams.
//!
//! A shard snapshot is an opaque stream of `(key_len u32 LE, key,
//! value_len u32 LE, value)` frames terminated by a zero-length key. Saving
//! reads from an immutable KV snapshot; restoring wipes the target range
//! first and applies frames in chunks.

use std::io::{Read, Write};

use tokio_util::sync::CancellationToken;

use crate::kv::{KvBatch, KvEngine, KvSnapshot};

/// Keys streamed per snapshot read and entries applied per restore batch.
const SNAPSHOT_CHUNK: usize = 1024;

/// Stream every pair in `[lo, hi)` from `snap` into `writer`.
pub fn save_snapshot_data(
    snap: &dyn KvSnapshot,
    lo: &[u8],
    hi: &[u8],
    writer: &mut dyn Write,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let mut cursor = lo.to_vec();
    loop {
        anyhow::ensure!(!cancel.is_cancelled(), "snapshot save cancelled");
        let pairs = snap.range(&cursor, hi, SNAPSHOT_CHUNK)?;
        for pair in &pairs {
            writer.write_all(&(pair.key.len() as u32).to_le_bytes())?;
            writer.write_all(&pair.key)?;
            writer.write_all(&(pair.value.len() as u32).to_le_bytes())?;
            writer.write_all(&pair.value)?;
        }
        if pairs.len() < SNAPSHOT_CHUNK {
            break;
        }
        cursor = pairs.last().expect("non-empty chunk").key.clone();
        cursor.push(0);
    }
    // Terminator: a zero-length key.
    writer.write_all(&0u32.to_le_bytes())?;
    writer.flush()?;
    Ok(())
}

/// Wipe `[lo, hi)` in `kv` and load frames from `reader` until the
/// terminator.
pub fn restore_snapshot_data(
    kv: &dyn KvEngine,
    lo: &[u8],
    hi: &[u8],
    reader: &mut dyn Read,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    kv.delete_range(lo, hi)?;
    let mut batch = KvBatch::default();
    loop {
        anyhow::ensure!(!cancel.is_cancelled(), "snapshot restore cancelled");
        let klen = read_len(reader)?;
        if klen == 0 {
            break;
        }
        let mut key = vec![0u8; klen];
        reader.read_exact(&mut key)?;
        let vlen = read_len(reader)?;
        let mut value = vec![0u8; vlen];
        reader.read_exact(&mut value)?;
        batch.put(key, value);
        if batch.puts.len() >= SNAPSHOT_CHUNK {
            kv.apply_batch(std::mem::take(&mut batch), false)?;
        }
    }
    if !batch.is_empty() {
        kv.apply_batch(batch, false)?;
    }
    Ok(())
}

fn read_len(reader: &mut dyn Read) -> anyhow::Result<usize> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use std::io::Cursor;

    #[test]
    fn save_restore_round_trip() {
        let kv = MemoryKv::new();
        for i in 0u32..3000 {
            let mut key = vec![b's'];
            key.extend_from_slice(&i.to_be_bytes());
            kv.set(key, i.to_le_bytes().to_vec()).unwrap();
        }
        // A key outside the saved range must survive the restore wipe.
        kv.set(b"t-outside".to_vec(), b"keep".to_vec()).unwrap();

        let snap = kv.snapshot().unwrap();
        let mut archive = Vec::new();
        let cancel = CancellationToken::new();
        save_snapshot_data(snap.as_ref(), b"s", b"t", &mut archive, &cancel).unwrap();

        let before = kv.range(b"s", b"t", usize::MAX).unwrap();
        let target = MemoryKv::new();
        target.set(b"s-stale".to_vec(), b"gone".to_vec()).unwrap();
        target.set(b"t-outside".to_vec(), b"keep".to_vec()).unwrap();
        restore_snapshot_data(&target, b"s", b"t", &mut Cursor::new(archive), &cancel).unwrap();

        let after = target.range(b"s", b"t", usize::MAX).unwrap();
        assert_eq!(before, after);
        assert_eq!(target.get(b"t-outside").unwrap(), Some(b"keep".to_vec()));
        assert_eq!(target.get(b"s-stale").unwrap(), None);
    }

    #[test]
    fn empty_range_is_just_a_terminator() {
        let kv = MemoryKv::new();
        let snap = kv.snapshot().unwrap();
        let mut archive = Vec::new();
        let cancel = CancellationToken::new();
        save_snapshot_data(snap.as_ref(), b"a", b"b", &mut archive, &cancel).unwrap();
        assert_eq!(archive, 0u32.to_le_bytes().to_vec());
    }

    #[test]
    fn cancellation_stops_promptly() {
        let kv = MemoryKv::new();
        kv.set(b"a1".to_vec(), b"v".to_vec()).unwrap();
        let snap = kv.snapshot().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut out = Vec::new();
        assert!(save_snapshot_data(snap.as_ref(), b"a", b"b", &mut out, &cancel).is_err());
    }
}
