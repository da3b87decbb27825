//! Materialized views: a physical plan lowered into a push DAG.
//!
//! A view is fed by one table (source or another view). Non-aggregate
//! views chain filter/project into the view's table writer; aggregate
//! views end the local chain at the partial aggregator and re-enter on the
//! owning shard through the full aggregator, whose output reaches the
//! writer.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use sluice_core::schema::{MaterializedViewInfo, TableInfo};
use sluice_core::types::ColumnType;
use sluice_core::{SluiceError, SluiceResult};

use sluice_shard::sharder::Sharder;

use crate::aggfuncs::{AggFunction, AggFunctionType};
use crate::parplan::{PhysicalPlan, PlannedQuery};
use crate::push::aggregator::Aggregator;
use crate::push::exec::{
    ExecutionContext, PushDag, PushFilter, PushOperator, PushProject, RowsBatch, TableWriter,
};
use crate::push::RemoteRowsHandler;

/// A built materialized view ready to receive feed rows.
#[derive(Debug)]
pub struct MvRuntime {
    info: MaterializedViewInfo,
    dag: PushDag,
    feed_table: TableInfo,
    agg_node: Option<usize>,
    /// Views fed by this view, per shard (views stack).
    subscribers: RwLock<HashMap<u64, Vec<Arc<MvRuntime>>>>,
}

impl MvRuntime {
    /// Lower a planned query into a push DAG writing into `mv_table`.
    /// `alloc_internal_id` hands out ids for internal aggregate tables.
    pub fn build(
        mv_table: TableInfo,
        query: String,
        planned: &PlannedQuery,
        sharder: Sharder,
        alloc_internal_id: &mut dyn FnMut() -> SluiceResult<u64>,
    ) -> SluiceResult<Arc<MvRuntime>> {
        // Flatten the plan into operator order, scan first.
        let mut stages = Vec::new();
        let mut current = &planned.plan;
        let feed_table = loop {
            match current {
                PhysicalPlan::TableScan { table } => break table.clone(),
                PhysicalPlan::Limit { .. } => {
                    return Err(SluiceError::invalid_statement(
                        "LIMIT is not allowed in a materialized view",
                    ));
                }
                PhysicalPlan::Filter { input, .. }
                | PhysicalPlan::Project { input, .. }
                | PhysicalPlan::Aggregate { input, .. } => {
                    stages.push(current);
                    current = input;
                }
            }
        };
        stages.reverse();

        let mut nodes: Vec<PushOperator> = Vec::with_capacity(stages.len() + 1);
        let mut col_types = feed_table.column_types.clone();
        let mut agg_node = None;
        let mut internal_table_ids = Vec::new();
        for stage in stages {
            match stage {
                PhysicalPlan::Filter { pred, .. } => {
                    nodes.push(PushOperator::Filter(PushFilter::new(pred.clone())));
                }
                PhysicalPlan::Project { exprs, .. } => {
                    let mut next_types = Vec::with_capacity(exprs.len());
                    for expr in exprs {
                        next_types.push(
                            expr.result_type(&col_types)
                                .map_err(|e| SluiceError::invalid_statement(e.to_string()))?,
                        );
                    }
                    nodes.push(PushOperator::Project(PushProject::new(exprs.clone())));
                    col_types = next_types;
                }
                PhysicalPlan::Aggregate {
                    group_by, calls, ..
                } => {
                    let funcs = AggFunction::from_calls(calls);
                    let out_key_cols: Vec<usize> = funcs
                        .iter()
                        .enumerate()
                        .filter(|(_, f)| f.func_type == AggFunctionType::FirstRow)
                        .map(|(i, _)| i)
                        .collect();
                    let partial_table_id = alloc_internal_id()?;
                    let full_table_id = alloc_internal_id()?;
                    internal_table_ids.push(partial_table_id);
                    internal_table_ids.push(full_table_id);
                    let next_types = AggFunction::value_types(&funcs);
                    agg_node = Some(nodes.len());
                    nodes.push(PushOperator::Aggregator(Aggregator::new(
                        funcs,
                        group_by.clone(),
                        out_key_cols,
                        col_types,
                        partial_table_id,
                        full_table_id,
                        sharder.clone(),
                    )));
                    col_types = next_types;
                }
                _ => unreachable!("scan and limit handled above"),
            }
        }
        if col_types != mv_table.column_types {
            return Err(SluiceError::invalid_statement(
                "materialized view columns do not match its query",
            ));
        }
        nodes.push(PushOperator::TableWriter(TableWriter::new(mv_table.clone())));

        let count = nodes.len();
        let parents: Vec<Option<usize>> = (0..count)
            .map(|i| if i + 1 < count { Some(i + 1) } else { None })
            .collect();
        let dag = PushDag::new(nodes, parents, 0);

        Ok(Arc::new(MvRuntime {
            info: MaterializedViewInfo {
                table: mv_table,
                query,
                internal_table_ids,
            },
            dag,
            feed_table,
            agg_node,
            subscribers: RwLock::new(HashMap::new()),
        }))
    }

    pub fn info(&self) -> &MaterializedViewInfo {
        &self.info
    }

    pub fn feed_table(&self) -> &TableInfo {
        &self.feed_table
    }

    /// Remote-consumer id for the full-aggregation side, if any.
    pub fn agg_consumer_id(&self) -> Option<u64> {
        self.agg_node.map(|idx| match self.dag.node(idx) {
            PushOperator::Aggregator(agg) => agg.full_table_id(),
            _ => unreachable!("agg_node points at the aggregator"),
        })
    }

    fn aggregator(&self) -> Option<&Aggregator> {
        self.agg_node.map(|idx| match self.dag.node(idx) {
            PushOperator::Aggregator(agg) => agg,
            _ => unreachable!("agg_node points at the aggregator"),
        })
    }

    pub fn add_subscriber(&self, shard_id: u64, mv: Arc<MvRuntime>) {
        self.subscribers
            .write()
            .expect("subscribers lock poisoned")
            .entry(shard_id)
            .or_default()
            .push(mv);
    }

    pub fn remove_subscriber(&self, mv_table_id: u64) {
        let mut subscribers = self.subscribers.write().expect("subscribers lock poisoned");
        for subs in subscribers.values_mut() {
            subs.retain(|mv| mv.info.table.id != mv_table_id);
        }
    }

    fn subscribers_for(&self, shard_id: u64) -> Vec<Arc<MvRuntime>> {
        self.subscribers
            .read()
            .expect("subscribers lock poisoned")
            .get(&shard_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Feed a batch of feed-table changes through the DAG on this shard.
    pub fn feed(&self, batch: RowsBatch, ctx: &mut ExecutionContext) -> anyhow::Result<()> {
        if let Some(out) = self.dag.handle_rows(self.dag.entry(), batch, ctx)? {
            for mv in self.subscribers_for(ctx.shard_id) {
                mv.feed(out.clone(), ctx)?;
            }
        }
        Ok(())
    }
}

impl RemoteRowsHandler for MvRuntime {
    fn input_col_types(&self) -> Vec<ColumnType> {
        self.aggregator()
            .expect("remote rows require an aggregator")
            .out_col_types()
    }

    /// Forwarded partial-aggregation rows enter at the full aggregator.
    fn handle_remote_rows(
        &self,
        batch: RowsBatch,
        ctx: &mut ExecutionContext,
    ) -> anyhow::Result<()> {
        let agg_node = self
            .agg_node
            .ok_or_else(|| anyhow::anyhow!("remote rows for a view without aggregation"))?;
        if let Some(out) = self.dag.handle_remote_rows(agg_node, batch, ctx)? {
            for mv in self.subscribers_for(ctx.shard_id) {
                mv.feed(out.clone(), ctx)?;
            }
        }
        Ok(())
    }
}
