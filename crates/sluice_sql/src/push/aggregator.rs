//! The two-tier streaming aggregator.
//!
//! Partial aggregation runs on the shard where rows arrive; every changed
//! partial state is persisted locally and forwarded to the shard that owns
//! the group key, where the full state merges the contribution. Forward
//! sequences combine the deterministic batch sequence with the holder's
//! insertion index, so a replayed batch regenerates identical sequences
//! and the destination's dedup ledger drops them.

use std::collections::HashMap;

use sluice_core::codec::{encode_key_cols, encode_table_prefix, TABLE_PREFIX_LEN};
use sluice_core::types::{ColumnType, Row};

use sluice_shard::forward::{
    encode_prev_and_current_row, make_dedup_seq, make_originator, ForwardKey,
};
use sluice_shard::sharder::Sharder;

use crate::aggfuncs::{AggFunction, AggState};
use crate::push::exec::{ExecutionContext, RowsBatch, RowsEntry};

/// Per-group state loaded for the duration of one batch.
struct StateHolder {
    state: AggState,
    key: Vec<u8>,
    initial_row_bytes: Option<Vec<u8>>,
    initial_row: Option<Row>,
    row_bytes: Option<Vec<u8>>,
    row: Option<Row>,
}

/// Holders in insertion order; the order feeds the forwarded dedup
/// sequence, so it must be deterministic across replays.
#[derive(Default)]
struct StateHolders {
    by_key: HashMap<Vec<u8>, usize>,
    list: Vec<StateHolder>,
}

impl StateHolders {
    fn get_or_load(
        &mut self,
        key: Vec<u8>,
        funcs: &[AggFunction],
        ctx: &ExecutionContext,
    ) -> anyhow::Result<usize> {
        if let Some(idx) = self.by_key.get(&key) {
            return Ok(*idx);
        }
        let holder = match ctx.cluster.local_get(&key)? {
            Some(stored) => {
                let (state, row_bytes) = AggState::deserialize(&stored, funcs)?;
                let initial_row =
                    Row::decode(&row_bytes, &AggFunction::value_types(funcs))?;
                StateHolder {
                    state,
                    key: key.clone(),
                    initial_row_bytes: Some(row_bytes),
                    initial_row: Some(initial_row),
                    row_bytes: None,
                    row: None,
                }
            }
            None => StateHolder {
                state: AggState::new(funcs)?,
                key: key.clone(),
                initial_row_bytes: None,
                initial_row: None,
                row_bytes: None,
                row: None,
            },
        };
        let idx = self.list.len();
        self.by_key.insert(key, idx);
        self.list.push(holder);
        Ok(idx)
    }
}

#[derive(Debug)]
pub struct Aggregator {
    funcs: Vec<AggFunction>,
    /// Group-by column indexes in the child's rows.
    group_by_cols: Vec<usize>,
    /// Group-key positions in the aggregate output rows.
    out_key_cols: Vec<usize>,
    child_col_types: Vec<ColumnType>,
    partial_table_id: u64,
    full_table_id: u64,
    sharder: Sharder,
}

impl Aggregator {
    pub fn new(
        funcs: Vec<AggFunction>,
        group_by_cols: Vec<usize>,
        out_key_cols: Vec<usize>,
        child_col_types: Vec<ColumnType>,
        partial_table_id: u64,
        full_table_id: u64,
        sharder: Sharder,
    ) -> Aggregator {
        Aggregator {
            funcs,
            group_by_cols,
            out_key_cols,
            child_col_types,
            partial_table_id,
            full_table_id,
            sharder,
        }
    }

    pub fn full_table_id(&self) -> u64 {
        self.full_table_id
    }

    pub fn partial_table_id(&self) -> u64 {
        self.partial_table_id
    }

    /// Output column types (one per aggregate call).
    pub fn out_col_types(&self) -> Vec<ColumnType> {
        AggFunction::value_types(&self.funcs)
    }

    fn partial_key(&self, entry: &RowsEntry, shard_id: u64) -> anyhow::Result<Vec<u8>> {
        let row = entry
            .curr
            .as_ref()
            .or(entry.prev.as_ref())
            .expect("entry with no rows");
        let key = encode_table_prefix(shard_id, self.partial_table_id, TABLE_PREFIX_LEN + 16);
        encode_key_cols(row, &self.group_by_cols, &self.child_col_types, key)
    }

    fn full_key(&self, entry: &RowsEntry, shard_id: u64) -> anyhow::Result<Vec<u8>> {
        let row = entry
            .curr
            .as_ref()
            .or(entry.prev.as_ref())
            .expect("entry with no rows");
        let out_types = self.out_col_types();
        let key = encode_table_prefix(shard_id, self.full_table_id, TABLE_PREFIX_LEN + 16);
        encode_key_cols(row, &self.out_key_cols, &out_types, key)
    }

    /// Partial path: fold row changes into per-group partial states, store
    /// the changed states and forward them to the owning shards.
    pub fn handle_rows(
        &self,
        batch: RowsBatch,
        ctx: &mut ExecutionContext,
    ) -> anyhow::Result<()> {
        let mut holders = StateHolders::default();
        for entry in &batch.entries {
            let key = self.partial_key(entry, ctx.shard_id)?;
            let idx = holders.get_or_load(key, &self.funcs, ctx)?;
            let holder = &mut holders.list[idx];
            if let Some(prev) = &entry.prev {
                holder.state.eval_row(&self.funcs, prev, true)?;
            }
            if let Some(curr) = &entry.curr {
                holder.state.eval_row(&self.funcs, curr, false)?;
            }
        }

        self.store_results(&mut holders, ctx)?;

        for (i, holder) in holders.list.iter().enumerate() {
            if !holder.state.is_changed() {
                continue;
            }
            // The dedup sequence packs (batch_seq, holder index) into a
            // u64; more holders than u32::MAX would collide.
            anyhow::ensure!(
                i <= u32::MAX as usize,
                "aggregation batch produced too many state holders"
            );
            let group_bytes = &holder.key[TABLE_PREFIX_LEN..];
            let dest_shard = self.sharder.calculate_shard(group_bytes);
            let forward_key = ForwardKey {
                dedup_enabled: ctx.enable_dedup,
                originator: make_originator(self.partial_table_id, ctx.shard_id),
                seq: make_dedup_seq(ctx.batch_seq, i as u32),
                remote_consumer_id: self.full_table_id.to_be_bytes().to_vec(),
            };
            let value = encode_prev_and_current_row(
                holder.initial_row_bytes.as_deref(),
                holder.row_bytes.as_deref(),
            );
            ctx.add_to_forward_batch(dest_shard, forward_key.encode(), value);
        }
        Ok(())
    }

    /// Full path, entered with forwarded partial rows: merge contributions
    /// into the full states and emit old/new full rows for the parent.
    pub fn handle_remote_rows(
        &self,
        batch: RowsBatch,
        ctx: &mut ExecutionContext,
    ) -> anyhow::Result<RowsBatch> {
        let mut holders = StateHolders::default();
        for entry in &batch.entries {
            let key = self.full_key(entry, ctx.shard_id)?;
            let idx = holders.get_or_load(key, &self.funcs, ctx)?;
            let holder = &mut holders.list[idx];
            if let Some(prev) = &entry.prev {
                holder.state.merge_row(&self.funcs, prev, true)?;
            }
            if let Some(curr) = &entry.curr {
                holder.state.merge_row(&self.funcs, curr, false)?;
            }
        }

        self.store_results(&mut holders, ctx)?;

        let mut out = Vec::new();
        for holder in &holders.list {
            if holder.state.is_changed() {
                out.push(RowsEntry::new(
                    holder.initial_row.clone(),
                    holder.row.clone(),
                ));
            }
        }
        Ok(RowsBatch::new(out))
    }

    fn store_results(
        &self,
        holders: &mut StateHolders,
        ctx: &mut ExecutionContext,
    ) -> anyhow::Result<()> {
        for holder in holders.list.iter_mut() {
            if !holder.state.is_changed() {
                continue;
            }
            let (row_bytes, stored) = holder.state.serialize(&self.funcs)?;
            ctx.write_batch.add_put(holder.key.clone(), stored);
            holder.row = Some(Row::decode(&row_bytes, &self.out_col_types())?);
            holder.row_bytes = Some(row_bytes);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggfuncs::AggFunctionType;
    use crate::parplan::PlanExpr;
    use sluice_core::types::Datum;
    use sluice_shard::kv::MemoryKv;
    use sluice_shard::local::LocalCluster;
    use sluice_shard::{Cluster, WriteBatch};
    use std::sync::Arc;

    const PARTIAL_ID: u64 = 2001;
    const FULL_ID: u64 = 2002;

    fn aggregator(num_shards: u64) -> Aggregator {
        Aggregator::new(
            vec![
                AggFunction {
                    func_type: AggFunctionType::FirstRow,
                    arg: Some(PlanExpr::Column(0)),
                    value_type: ColumnType::Varchar,
                },
                AggFunction {
                    func_type: AggFunctionType::Sum,
                    arg: Some(PlanExpr::Column(1)),
                    value_type: ColumnType::BigInt,
                },
            ],
            vec![0],
            vec![0],
            vec![ColumnType::Varchar, ColumnType::BigInt],
            PARTIAL_ID,
            FULL_ID,
            Sharder::new((0..num_shards).collect()),
        )
    }

    fn child_row(group: &str, v: i64) -> Row {
        Row::new(vec![
            Some(Datum::Varchar(group.into())),
            Some(Datum::Int(v)),
        ])
    }

    struct Harness {
        cluster: Arc<LocalCluster>,
    }

    impl Harness {
        fn new() -> Harness {
            let cluster =
                LocalCluster::new(0, vec![0], 2, Arc::new(MemoryKv::new()), false);
            cluster.start().unwrap();
            Harness { cluster }
        }

        /// Run one partial batch on `shard`, committing writes and
        /// returning the assembled forward batches.
        fn run_partial(
            &self,
            agg: &Aggregator,
            shard: u64,
            batch_seq: u32,
            batch: RowsBatch,
        ) -> HashMap<u64, WriteBatch> {
            let mut wb = WriteBatch::new(shard);
            let mut fwd = HashMap::new();
            let mut ctx = ExecutionContext {
                shard_id: shard,
                batch_seq,
                enable_dedup: true,
                write_batch: &mut wb,
                forward_batches: &mut fwd,
                cluster: self.cluster.as_ref(),
            };
            agg.handle_rows(batch, &mut ctx).unwrap();
            self.cluster.write_batch(wb).unwrap();
            fwd
        }

        fn run_full(
            &self,
            agg: &Aggregator,
            shard: u64,
            batch: RowsBatch,
        ) -> RowsBatch {
            let mut wb = WriteBatch::new(shard);
            let mut fwd = HashMap::new();
            let mut ctx = ExecutionContext {
                shard_id: shard,
                batch_seq: 0,
                enable_dedup: true,
                write_batch: &mut wb,
                forward_batches: &mut fwd,
                cluster: self.cluster.as_ref(),
            };
            let out = agg.handle_remote_rows(batch, &mut ctx).unwrap();
            self.cluster.write_batch(wb).unwrap();
            out
        }

        fn forwarded_entry(fwd: &HashMap<u64, WriteBatch>) -> (ForwardKey, RowsEntry) {
            assert_eq!(fwd.len(), 1, "expected one destination shard");
            let batch = fwd.values().next().unwrap();
            assert_eq!(batch.puts.len(), 1);
            let (key, value) = &batch.puts[0];
            let fk = ForwardKey::decode(key).unwrap();
            let (prev, curr) =
                sluice_shard::forward::decode_prev_and_current_row(value).unwrap();
            let types = vec![ColumnType::Varchar, ColumnType::BigInt];
            let entry = RowsEntry::new(
                prev.map(|b| Row::decode(&b, &types).unwrap()),
                curr.map(|b| Row::decode(&b, &types).unwrap()),
            );
            (fk, entry)
        }
    }

    #[test]
    fn partial_then_full_sums_across_shards() {
        let h = Harness::new();
        let agg = aggregator(2);

        // Shard 0 contributes 3, shard 1 contributes 4, same group key.
        let fwd0 = h.run_partial(
            &agg,
            0,
            1,
            RowsBatch::new(vec![RowsEntry::insert(child_row("a", 3))]),
        );
        let fwd1 = h.run_partial(
            &agg,
            1,
            1,
            RowsBatch::new(vec![RowsEntry::insert(child_row("a", 4))]),
        );
        let (fk0, entry0) = Harness::forwarded_entry(&fwd0);
        let (fk1, entry1) = Harness::forwarded_entry(&fwd1);
        // Same group key hashes to the same owner from both shards.
        let dest0 = *fwd0.keys().next().unwrap();
        let dest1 = *fwd1.keys().next().unwrap();
        assert_eq!(dest0, dest1);
        assert_eq!(fk0.originator, make_originator(PARTIAL_ID, 0));
        assert_eq!(fk1.originator, make_originator(PARTIAL_ID, 1));
        assert_eq!(fk0.seq, make_dedup_seq(1, 0));

        let out = h.run_full(&agg, dest0, RowsBatch::new(vec![entry0, entry1]));
        assert_eq!(out.len(), 1);
        let full = out.entries[0].curr.as_ref().unwrap();
        assert_eq!(full.get(1), Some(&Datum::Int(7)));

        // Delete the 3 on shard 0: partial drops to 0 and forwards the
        // (old, new) pair; the full side lands on 4.
        let fwd0 = h.run_partial(
            &agg,
            0,
            2,
            RowsBatch::new(vec![RowsEntry::delete(child_row("a", 3))]),
        );
        let (_, entry) = Harness::forwarded_entry(&fwd0);
        assert_eq!(
            entry.prev.as_ref().unwrap().get(1),
            Some(&Datum::Int(3))
        );
        assert_eq!(
            entry.curr.as_ref().unwrap().get(1),
            Some(&Datum::Int(0))
        );
        let out = h.run_full(&agg, dest0, RowsBatch::new(vec![entry]));
        let full = out.entries[0].curr.as_ref().unwrap();
        assert_eq!(full.get(1), Some(&Datum::Int(4)));
    }

    #[test]
    fn partial_state_persists_between_batches() {
        let h = Harness::new();
        let agg = aggregator(2);
        h.run_partial(
            &agg,
            0,
            1,
            RowsBatch::new(vec![RowsEntry::insert(child_row("g", 5))]),
        );
        let fwd = h.run_partial(
            &agg,
            0,
            2,
            RowsBatch::new(vec![RowsEntry::insert(child_row("g", 7))]),
        );
        let (_, entry) = Harness::forwarded_entry(&fwd);
        // Second batch forwards (5, 12): old partial and new partial.
        assert_eq!(entry.prev.as_ref().unwrap().get(1), Some(&Datum::Int(5)));
        assert_eq!(entry.curr.as_ref().unwrap().get(1), Some(&Datum::Int(12)));
    }

    #[test]
    fn replayed_batch_regenerates_identical_sequences() {
        let h = Harness::new();
        let agg = aggregator(2);
        let batch = RowsBatch::new(vec![
            RowsEntry::insert(child_row("a", 1)),
            RowsEntry::insert(child_row("b", 2)),
        ]);
        let fwd_first = h.run_partial(&agg, 0, 7, batch.clone());
        // Reset partial state to simulate the crash-replay of the same
        // receiver group on a fresh replica of this shard's log prefix.
        let h2 = Harness::new();
        let fwd_second = h2.run_partial(&agg, 0, 7, batch);

        let mut seqs_first: Vec<u64> = fwd_first
            .values()
            .flat_map(|b| b.puts.iter())
            .map(|(k, _)| ForwardKey::decode(k).unwrap().seq)
            .collect();
        let mut seqs_second: Vec<u64> = fwd_second
            .values()
            .flat_map(|b| b.puts.iter())
            .map(|(k, _)| ForwardKey::decode(k).unwrap().seq)
            .collect();
        seqs_first.sort_unstable();
        seqs_second.sort_unstable();
        assert_eq!(seqs_first, seqs_second);
    }
}
