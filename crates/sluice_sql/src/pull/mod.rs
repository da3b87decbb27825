//! The pull engine: ad-hoc query execution across shards.
//!
//! The node that receives a query builds a local DAG whose remote executor
//! fans `QUERY` lookups out to peer shards; each peer builds (and caches)
//! an execution context keyed by the execution id and streams pages back
//! until a short page ends the cursor. Cache entries die when drained,
//! when the originating node leaves, or when the engine stops.

pub mod exec;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use sluice_core::types::Rows;
use sluice_core::{SluiceError, SluiceResult};

use sluice_shard::{Cluster, QueryExecutionInfo, RemoteQueryHandler};

use crate::parplan::{PhysicalPlan, PlannedQuery, Planner};
use crate::TableResolver;

use exec::{PullExecutor, PullFilter, PullLimit, PullProject, PullTableScan, RemoteExecutor};

/// Page size used by the internal `execute_query` helper.
const INTERNAL_PAGE_SIZE: usize = 1000;

/// Cached server-side cursor state for one execution id: one remote
/// sub-DAG per shard this node has been asked for.
struct CachedExecution {
    query: String,
    shard_dags: HashMap<u64, Box<dyn PullExecutor>>,
}

pub struct PullEngine {
    cluster: Arc<dyn Cluster>,
    planner: Planner,
    node_id: u64,
    available: AtomicBool,
    started: AtomicBool,
    exec_ctx_cache: DashMap<String, CachedExecution>,
}

impl PullEngine {
    pub fn new(cluster: Arc<dyn Cluster>, resolver: Arc<dyn TableResolver>) -> Arc<PullEngine> {
        let node_id = cluster.node_id();
        Arc::new(PullEngine {
            cluster,
            planner: Planner::new(resolver),
            node_id,
            available: AtomicBool::new(false),
            started: AtomicBool::new(false),
            exec_ctx_cache: DashMap::new(),
        })
    }

    pub fn start(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.started.store(false, Ordering::SeqCst);
        self.available.store(false, Ordering::SeqCst);
        self.exec_ctx_cache.clear();
    }

    /// Queries are refused until the schemas are loaded, except system
    /// queries (which are how the schemas get loaded).
    pub fn set_available(&self) {
        self.available.store(true, Ordering::SeqCst);
    }

    pub fn num_cached_execs(&self) -> usize {
        self.exec_ctx_cache.len()
    }

    /// Build the local side of a pull query: everything below the limit
    /// runs remotely, the limit (if any) runs here.
    pub fn build_pull_query(
        &self,
        schema_name: &str,
        sql: &str,
        system_query: bool,
    ) -> SluiceResult<Box<dyn PullExecutor>> {
        let planned = self.planner.plan_query(schema_name, sql)?;
        if planned.group_cols.is_some() {
            return Err(SluiceError::invalid_statement(
                "aggregating pull queries are not supported; create a materialized view",
            ));
        }
        let mut limits = Vec::new();
        let mut plan = &planned.plan;
        while let PhysicalPlan::Limit { limit, input } = plan {
            limits.push(*limit);
            plan = input;
        }
        let execution_id = format!("{}-{}", self.node_id, Uuid::new_v4());
        let mut executor: Box<dyn PullExecutor> = Box::new(RemoteExecutor::new(
            self.cluster.clone(),
            execution_id,
            schema_name.to_string(),
            sql.to_string(),
            system_query,
            planned.col_types.clone(),
        ));
        for limit in limits {
            executor = Box::new(PullLimit::new(executor, limit));
        }
        Ok(executor)
    }

    /// Column metadata for a query, for result framing.
    pub fn plan_output(&self, schema_name: &str, sql: &str) -> SluiceResult<PlannedQuery> {
        self.planner.plan_query(schema_name, sql)
    }

    /// Build the remote sub-DAG for one shard: scan, filter, project. The
    /// limit stays on the calling node; here the page limit rules.
    fn build_remote_dag(
        &self,
        schema_name: &str,
        sql: &str,
        shard_id: u64,
    ) -> SluiceResult<Box<dyn PullExecutor>> {
        let planned = self.planner.plan_query(schema_name, sql)?;
        if planned.group_cols.is_some() {
            return Err(SluiceError::invalid_statement(
                "aggregating pull queries are not supported; create a materialized view",
            ));
        }
        let mut plan = &planned.plan;
        while let PhysicalPlan::Limit { input, .. } = plan {
            plan = input;
        }
        fn build(
            engine: &PullEngine,
            plan: &PhysicalPlan,
            shard_id: u64,
        ) -> SluiceResult<Box<dyn PullExecutor>> {
            match plan {
                PhysicalPlan::TableScan { table } => Ok(Box::new(PullTableScan::new(
                    engine.cluster.clone(),
                    table.clone(),
                    shard_id,
                ))),
                PhysicalPlan::Filter { pred, input } => {
                    let child = build(engine, input, shard_id)?;
                    Ok(Box::new(PullFilter::new(child, pred.clone())))
                }
                PhysicalPlan::Project { exprs, input } => {
                    let child = build(engine, input, shard_id)?;
                    let mut types = Vec::with_capacity(exprs.len());
                    for expr in exprs {
                        types.push(
                            expr.result_type(child.col_types())
                                .map_err(|e| SluiceError::invalid_statement(e.to_string()))?,
                        );
                    }
                    Ok(Box::new(PullProject::new(child, exprs.clone(), types)))
                }
                PhysicalPlan::Aggregate { .. } => Err(SluiceError::invalid_statement(
                    "aggregating pull queries are not supported",
                )),
                PhysicalPlan::Limit { .. } => unreachable!("limits peeled above"),
            }
        }
        build(self, plan, shard_id)
    }

    /// Execute one page of a pull query on behalf of a peer node.
    pub fn execute_remote(&self, info: &QueryExecutionInfo) -> SluiceResult<Rows> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(SluiceError::Unavailable);
        }
        if !info.system_query && !self.available.load(Ordering::SeqCst) {
            return Err(SluiceError::Unavailable);
        }
        // Peers always stamp an execution id; its absence is a bug.
        assert!(!info.execution_id.is_empty(), "empty execution id");

        let mut entry = self
            .exec_ctx_cache
            .entry(info.execution_id.clone())
            .or_insert_with(|| CachedExecution {
                query: info.query.clone(),
                shard_dags: HashMap::new(),
            });
        if entry.query != info.query {
            panic!(
                "execution {} is already running query {:?}, got {:?}",
                info.execution_id, entry.query, info.query
            );
        }
        if !entry.shard_dags.contains_key(&info.shard_id) {
            match self.build_remote_dag(&info.schema_name, &info.query, info.shard_id) {
                Ok(dag) => {
                    entry.shard_dags.insert(info.shard_id, dag);
                }
                // A plan that never built must not pin an empty entry.
                Err(err) => {
                    let empty = entry.shard_dags.is_empty();
                    drop(entry);
                    if empty {
                        self.exec_ctx_cache
                            .remove_if(&info.execution_id, |_, cached| cached.shard_dags.is_empty());
                    }
                    return Err(err);
                }
            }
        }
        let limit = info.limit as usize;
        let dag = entry
            .shard_dags
            .get_mut(&info.shard_id)
            .expect("inserted above");
        let result = dag.get_rows(limit);
        let (rows, drained) = match result {
            Ok(rows) => {
                let drained = rows.row_count() < limit;
                (Ok(rows), drained)
            }
            // A failed cursor is dead; drop it so the entry can die too.
            Err(err) => (Err(err), true),
        };
        if drained {
            entry.shard_dags.remove(&info.shard_id);
        }
        let empty = entry.shard_dags.is_empty();
        drop(entry);
        if empty {
            self.exec_ctx_cache
                .remove_if(&info.execution_id, |_, cached| cached.shard_dags.is_empty());
            debug!(execution = %info.execution_id, "execution context drained");
        }
        rows
    }

    /// Lightweight internal query interface, used for catalog checks and
    /// moderate row counts.
    pub fn execute_query(&self, schema_name: &str, sql: &str) -> SluiceResult<Rows> {
        self.execute_query_with_availability(schema_name, sql, false)
    }

    /// System-query variant usable before `set_available`.
    pub fn execute_system_query(&self, schema_name: &str, sql: &str) -> SluiceResult<Rows> {
        self.execute_query_with_availability(schema_name, sql, true)
    }

    fn execute_query_with_availability(
        &self,
        schema_name: &str,
        sql: &str,
        system_query: bool,
    ) -> SluiceResult<Rows> {
        let mut executor = self.build_pull_query(schema_name, sql, system_query)?;
        let mut out: Option<Rows> = None;
        loop {
            let page = executor.get_rows(INTERNAL_PAGE_SIZE)?;
            let last = page.row_count() < INTERNAL_PAGE_SIZE;
            out = Some(match out {
                None => page,
                Some(mut acc) => {
                    acc.append_all(page);
                    acc
                }
            });
            if last {
                return Ok(out.expect("set above"));
            }
        }
    }

    /// Drop cached executions originated by a node that left the cluster.
    pub fn node_left(&self, node_id: u64) {
        let prefix = format!("{node_id}-");
        self.exec_ctx_cache.retain(|key, _| !key.starts_with(&prefix));
    }
}

impl RemoteQueryHandler for PullEngine {
    fn execute_remote_pull_query(&self, info: &QueryExecutionInfo) -> SluiceResult<Rows> {
        self.execute_remote(info)
    }
}
