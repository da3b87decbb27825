//! Wire formats for log-entry payloads and cross-shard forwarding.
//!
//! A log entry is one command byte followed by a serialized write batch:
//! `num_puts u32 LE; (klen u32 LE, k, vlen u32 LE, v)*; num_deletes u32 LE;
//! (klen u32 LE, k)*`. Forward-write puts carry a routing key that the
//! destination state machine rewrites into a receiver-table key.

use sluice_core::codec::{
    append_u32_le, append_u64_be, read_u32_le, read_u64_be, read_u8,
};

use crate::dedup::ORIGINATOR_ID_LEN;
use crate::{KvPair, WriteBatch};

/// Command byte for a local mutation applied by the originating shard.
pub const COMMAND_WRITE: u8 = 1;
/// Command byte for rows delivered from another shard.
pub const COMMAND_FORWARD_WRITE: u8 = 2;

/// Serialize a write batch into a log-entry payload with `command` leading.
pub fn serialize_write_batch(batch: &WriteBatch, command: u8) -> Vec<u8> {
    let mut size = 1 + 4 + 4;
    for (k, v) in &batch.puts {
        size += 8 + k.len() + v.len();
    }
    for k in &batch.deletes {
        size += 4 + k.len();
    }
    let mut buf = Vec::with_capacity(size);
    buf.push(command);
    append_u32_le(&mut buf, batch.puts.len() as u32);
    for (k, v) in &batch.puts {
        append_u32_le(&mut buf, k.len() as u32);
        buf.extend_from_slice(k);
        append_u32_le(&mut buf, v.len() as u32);
        buf.extend_from_slice(v);
    }
    append_u32_le(&mut buf, batch.deletes.len() as u32);
    for k in &batch.deletes {
        append_u32_le(&mut buf, k.len() as u32);
        buf.extend_from_slice(k);
    }
    buf
}

/// Puts and deletes decoded from a log-entry payload.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DecodedWriteBatch {
    pub puts: Vec<KvPair>,
    pub deletes: Vec<Vec<u8>>,
}

/// Decode the payload following the command byte.
pub fn deserialize_write_batch(data: &[u8]) -> anyhow::Result<DecodedWriteBatch> {
    let mut offset = 0;
    let num_puts = read_u32_le(data, &mut offset)? as usize;
    let mut puts = Vec::with_capacity(num_puts);
    for _ in 0..num_puts {
        let klen = read_u32_le(data, &mut offset)? as usize;
        anyhow::ensure!(offset + klen <= data.len(), "short put key");
        let key = data[offset..offset + klen].to_vec();
        offset += klen;
        let vlen = read_u32_le(data, &mut offset)? as usize;
        anyhow::ensure!(offset + vlen <= data.len(), "short put value");
        let value = data[offset..offset + vlen].to_vec();
        offset += vlen;
        puts.push(KvPair { key, value });
    }
    let num_deletes = read_u32_le(data, &mut offset)? as usize;
    let mut deletes = Vec::with_capacity(num_deletes);
    for _ in 0..num_deletes {
        let klen = read_u32_le(data, &mut offset)? as usize;
        anyhow::ensure!(offset + klen <= data.len(), "short delete key");
        deletes.push(data[offset..offset + klen].to_vec());
        offset += klen;
    }
    anyhow::ensure!(offset == data.len(), "trailing bytes in write batch");
    Ok(DecodedWriteBatch { puts, deletes })
}

/// Routing key carried by each forward-write put:
/// `enable_dedup u8 | originator 16B | seq u64 BE | remote_consumer_id`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForwardKey {
    pub dedup_enabled: bool,
    pub originator: [u8; ORIGINATOR_ID_LEN],
    pub seq: u64,
    pub remote_consumer_id: Vec<u8>,
}

impl ForwardKey {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf =
            Vec::with_capacity(1 + ORIGINATOR_ID_LEN + 8 + self.remote_consumer_id.len());
        buf.push(self.dedup_enabled as u8);
        buf.extend_from_slice(&self.originator);
        append_u64_be(&mut buf, self.seq);
        buf.extend_from_slice(&self.remote_consumer_id);
        buf
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<ForwardKey> {
        let mut offset = 0;
        let dedup_enabled = read_u8(data, &mut offset)? != 0;
        anyhow::ensure!(
            offset + ORIGINATOR_ID_LEN <= data.len(),
            "short forward key originator"
        );
        let mut originator = [0u8; ORIGINATOR_ID_LEN];
        originator.copy_from_slice(&data[offset..offset + ORIGINATOR_ID_LEN]);
        offset += ORIGINATOR_ID_LEN;
        let seq = read_u64_be(data, &mut offset)?;
        Ok(ForwardKey {
            dedup_enabled,
            originator,
            seq,
            remote_consumer_id: data[offset..].to_vec(),
        })
    }
}

/// Originator id for forwards produced on behalf of `table_id` by
/// `shard_id`: the table id then the shard id, both big-endian.
pub fn make_originator(table_id: u64, shard_id: u64) -> [u8; ORIGINATOR_ID_LEN] {
    let mut out = [0u8; ORIGINATOR_ID_LEN];
    out[..8].copy_from_slice(&table_id.to_be_bytes());
    out[8..].copy_from_slice(&shard_id.to_be_bytes());
    out
}

/// Dedup sequence for a partial-aggregation forward. The batch sequence is
/// deterministic per log entry and the holder index is the position in the
/// insertion-ordered holder list, so a replayed batch regenerates the same
/// sequence.
pub fn make_dedup_seq(batch_seq: u32, holder_index: u32) -> u64 {
    (u64::from(batch_seq) << 32) | u64::from(holder_index)
}

/// Value payload pairing an optional previous and current row encoding.
/// A zero length marks an absent side (an encoded row is never empty).
pub fn encode_prev_and_current_row(prev: Option<&[u8]>, curr: Option<&[u8]>) -> Vec<u8> {
    let prev = prev.unwrap_or_default();
    let curr = curr.unwrap_or_default();
    let mut buf = Vec::with_capacity(8 + prev.len() + curr.len());
    append_u32_le(&mut buf, prev.len() as u32);
    buf.extend_from_slice(prev);
    append_u32_le(&mut buf, curr.len() as u32);
    buf.extend_from_slice(curr);
    buf
}

/// Inverse of [`encode_prev_and_current_row`].
pub fn decode_prev_and_current_row(
    data: &[u8],
) -> anyhow::Result<(Option<Vec<u8>>, Option<Vec<u8>>)> {
    let mut offset = 0;
    let plen = read_u32_le(data, &mut offset)? as usize;
    anyhow::ensure!(offset + plen <= data.len(), "short previous row");
    let prev = (plen > 0).then(|| data[offset..offset + plen].to_vec());
    offset += plen;
    let clen = read_u32_le(data, &mut offset)? as usize;
    anyhow::ensure!(offset + clen <= data.len(), "short current row");
    let curr = (clen > 0).then(|| data[offset..offset + clen].to_vec());
    offset += clen;
    anyhow::ensure!(offset == data.len(), "trailing bytes in row pair");
    Ok((prev, curr))
}
