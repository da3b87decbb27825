//! Push-side executors.
//!
//! Operators share one contract: take a batch of `(previous, current)` row
//! pairs and either transform it for the parent or absorb it (the partial
//! aggregator forwards across shards instead of returning). The DAG is an
//! arena of operators with parent indices, so operator graphs stay free of
//! ownership cycles.

use std::collections::HashMap;

use sluice_core::codec::{encode_key_cols, encode_table_prefix, TABLE_PREFIX_LEN};
use sluice_core::schema::TableInfo;
use sluice_core::types::Row;

use sluice_shard::{Cluster, WriteBatch};

use crate::parplan::PlanExpr;
use crate::push::aggregator::Aggregator;

/// One change: an update carries both rows, an insert only `curr`, a
/// delete only `prev`.
#[derive(Clone, Debug)]
pub struct RowsEntry {
    pub prev: Option<Row>,
    pub curr: Option<Row>,
}

impl RowsEntry {
    pub fn new(prev: Option<Row>, curr: Option<Row>) -> RowsEntry {
        assert!(
            prev.is_some() || curr.is_some(),
            "rows entry with neither previous nor current row"
        );
        RowsEntry { prev, curr }
    }

    pub fn insert(curr: Row) -> RowsEntry {
        RowsEntry {
            prev: None,
            curr: Some(curr),
        }
    }

    pub fn delete(prev: Row) -> RowsEntry {
        RowsEntry {
            prev: Some(prev),
            curr: None,
        }
    }
}

/// A batch of changes flowing through a push DAG.
#[derive(Clone, Debug, Default)]
pub struct RowsBatch {
    pub entries: Vec<RowsEntry>,
}

impl RowsBatch {
    pub fn new(entries: Vec<RowsEntry>) -> RowsBatch {
        RowsBatch { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Mutable state threaded through one batch application: the shard's write
/// batch, the forward batches being assembled per destination shard, and
/// the deterministic batch identity driving dedup sequences.
pub struct ExecutionContext<'a> {
    pub shard_id: u64,
    pub batch_seq: u32,
    pub enable_dedup: bool,
    pub write_batch: &'a mut WriteBatch,
    pub forward_batches: &'a mut HashMap<u64, WriteBatch>,
    pub cluster: &'a dyn Cluster,
}

impl<'a> ExecutionContext<'a> {
    pub fn add_to_forward_batch(&mut self, dest_shard: u64, key: Vec<u8>, value: Vec<u8>) {
        self.forward_batches
            .entry(dest_shard)
            .or_insert_with(|| WriteBatch::new(dest_shard))
            .add_put(key, value);
    }
}

/// Filters change entries. An update whose current row stops matching
/// becomes a delete; one that starts matching becomes an insert.
#[derive(Debug)]
pub struct PushFilter {
    pred: PlanExpr,
}

impl PushFilter {
    pub fn new(pred: PlanExpr) -> PushFilter {
        PushFilter { pred }
    }

    fn process(&self, batch: RowsBatch) -> anyhow::Result<RowsBatch> {
        let mut out = Vec::with_capacity(batch.entries.len());
        for entry in batch.entries {
            let prev_ok = match &entry.prev {
                Some(row) => self.pred.eval_bool(row)?,
                None => false,
            };
            let curr_ok = match &entry.curr {
                Some(row) => self.pred.eval_bool(row)?,
                None => false,
            };
            match (prev_ok, curr_ok) {
                (true, true) => out.push(entry),
                (false, true) => out.push(RowsEntry::new(None, entry.curr)),
                (true, false) => out.push(RowsEntry::new(entry.prev, None)),
                (false, false) => {}
            }
        }
        Ok(RowsBatch::new(out))
    }
}

/// Projects each side of a change through the same expressions.
#[derive(Debug)]
pub struct PushProject {
    exprs: Vec<PlanExpr>,
}

impl PushProject {
    pub fn new(exprs: Vec<PlanExpr>) -> PushProject {
        PushProject { exprs }
    }

    fn project_row(&self, row: &Row) -> anyhow::Result<Row> {
        let mut values = Vec::with_capacity(self.exprs.len());
        for expr in &self.exprs {
            values.push(expr.eval(row)?);
        }
        Ok(Row::new(values))
    }

    fn process(&self, batch: RowsBatch) -> anyhow::Result<RowsBatch> {
        let mut out = Vec::with_capacity(batch.entries.len());
        for entry in batch.entries {
            let prev = entry.prev.as_ref().map(|r| self.project_row(r)).transpose()?;
            let curr = entry.curr.as_ref().map(|r| self.project_row(r)).transpose()?;
            out.push(RowsEntry::new(prev, curr));
        }
        Ok(RowsBatch::new(out))
    }
}

/// Writes change entries into a table's shard-local rows.
#[derive(Debug)]
pub struct TableWriter {
    table: TableInfo,
}

impl TableWriter {
    pub fn new(table: TableInfo) -> TableWriter {
        TableWriter { table }
    }

    pub fn table(&self) -> &TableInfo {
        &self.table
    }

    fn row_key(&self, row: &Row, shard_id: u64) -> anyhow::Result<Vec<u8>> {
        let key = encode_table_prefix(shard_id, self.table.id, TABLE_PREFIX_LEN + 16);
        encode_key_cols(
            row,
            &self.table.primary_key_cols,
            &self.table.column_types,
            key,
        )
    }

    pub fn process(
        &self,
        batch: RowsBatch,
        ctx: &mut ExecutionContext,
    ) -> anyhow::Result<RowsBatch> {
        for entry in &batch.entries {
            match (&entry.prev, &entry.curr) {
                (_, Some(curr)) => {
                    let key = self.row_key(curr, ctx.shard_id)?;
                    if let Some(prev) = &entry.prev {
                        let prev_key = self.row_key(prev, ctx.shard_id)?;
                        if prev_key != key {
                            ctx.write_batch.add_delete(prev_key);
                        }
                    }
                    let value = curr.encoded(&self.table.column_types)?;
                    ctx.write_batch.add_put(key, value);
                }
                (Some(prev), None) => {
                    ctx.write_batch.add_delete(self.row_key(prev, ctx.shard_id)?);
                }
                (None, None) => unreachable!("checked by RowsEntry::new"),
            }
        }
        Ok(batch)
    }
}

/// Maintains a secondary index table: `shard | index_table | indexed cols |
/// pk cols -> empty`, kept in step with the rows flowing past.
#[derive(Debug)]
pub struct IndexWriter {
    index_table_id: u64,
    index_cols: Vec<usize>,
    table: TableInfo,
}

impl IndexWriter {
    pub fn new(index_table_id: u64, index_cols: Vec<usize>, table: TableInfo) -> IndexWriter {
        IndexWriter {
            index_table_id,
            index_cols,
            table,
        }
    }

    fn index_key(&self, row: &Row, shard_id: u64) -> anyhow::Result<Vec<u8>> {
        let key = encode_table_prefix(shard_id, self.index_table_id, TABLE_PREFIX_LEN + 24);
        let key = encode_key_cols(row, &self.index_cols, &self.table.column_types, key)?;
        encode_key_cols(
            row,
            &self.table.primary_key_cols,
            &self.table.column_types,
            key,
        )
    }

    fn process(
        &self,
        batch: RowsBatch,
        ctx: &mut ExecutionContext,
    ) -> anyhow::Result<RowsBatch> {
        for entry in &batch.entries {
            if let Some(prev) = &entry.prev {
                ctx.write_batch.add_delete(self.index_key(prev, ctx.shard_id)?);
            }
            if let Some(curr) = &entry.curr {
                ctx.write_batch
                    .add_put(self.index_key(curr, ctx.shard_id)?, Vec::new());
            }
        }
        Ok(batch)
    }
}

/// A push operator node.
#[derive(Debug)]
pub enum PushOperator {
    Filter(PushFilter),
    Project(PushProject),
    TableWriter(TableWriter),
    IndexWriter(IndexWriter),
    Aggregator(Aggregator),
}

/// An operator DAG as an arena: `parent[i]` consumes node `i`'s output.
#[derive(Debug)]
pub struct PushDag {
    nodes: Vec<PushOperator>,
    parents: Vec<Option<usize>>,
    entry: usize,
}

impl PushDag {
    pub fn new(nodes: Vec<PushOperator>, parents: Vec<Option<usize>>, entry: usize) -> PushDag {
        assert_eq!(nodes.len(), parents.len());
        PushDag {
            nodes,
            parents,
            entry,
        }
    }

    pub fn entry(&self) -> usize {
        self.entry
    }

    pub fn node(&self, idx: usize) -> &PushOperator {
        &self.nodes[idx]
    }

    /// Drive a batch from `from` towards the sink. Returns the batch that
    /// reached the sink, or `None` when the partial aggregator absorbed it.
    pub fn handle_rows(
        &self,
        from: usize,
        batch: RowsBatch,
        ctx: &mut ExecutionContext,
    ) -> anyhow::Result<Option<RowsBatch>> {
        let mut idx = from;
        let mut batch = batch;
        loop {
            let out = match &self.nodes[idx] {
                PushOperator::Filter(op) => Some(op.process(batch)?),
                PushOperator::Project(op) => Some(op.process(batch)?),
                PushOperator::TableWriter(op) => Some(op.process(batch, ctx)?),
                PushOperator::IndexWriter(op) => Some(op.process(batch, ctx)?),
                // The aggregator's partial half ends the local walk; its
                // output travels to the owning shard as a forward batch.
                PushOperator::Aggregator(op) => {
                    op.handle_rows(batch, ctx)?;
                    None
                }
            };
            match (out, self.parents[idx]) {
                (Some(next), Some(parent)) => {
                    batch = next;
                    idx = parent;
                }
                (Some(next), None) => return Ok(Some(next)),
                (None, _) => return Ok(None),
            }
        }
    }

    /// Entry point for forwarded partial-aggregation rows: run the full
    /// merge at `agg_idx`, then continue towards the sink.
    pub fn handle_remote_rows(
        &self,
        agg_idx: usize,
        batch: RowsBatch,
        ctx: &mut ExecutionContext,
    ) -> anyhow::Result<Option<RowsBatch>> {
        let PushOperator::Aggregator(agg) = &self.nodes[agg_idx] else {
            anyhow::bail!("remote rows routed to non-aggregator node {agg_idx}");
        };
        let out = agg.handle_remote_rows(batch, ctx)?;
        match self.parents[agg_idx] {
            Some(parent) => self.handle_rows(parent, out, ctx),
            None => Ok(Some(out)),
        }
    }

}
