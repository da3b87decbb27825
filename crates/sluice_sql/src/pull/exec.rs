//! Pull-side executors.
//!
//! A pull DAG pages rows upward through `get_rows(limit)`. Each operator
//! requests at most what its caller still needs, so a page never
//! overflows; a child returning fewer rows than requested means it is
//! exhausted. The remote executor is the network split point: it turns
//! `get_rows` into `QUERY` lookups against peer shards.

use sluice_core::codec::table_range;
use sluice_core::schema::TableInfo;
use sluice_core::types::{ColumnType, Row, Rows};
use sluice_core::{SluiceError, SluiceResult};

use sluice_shard::{Cluster, QueryExecutionInfo};

use std::sync::Arc;

use crate::parplan::PlanExpr;

/// One operator in a pull DAG. Implementations keep their own cursor
/// state (all access is `&mut`); a query is one pass, front to back.
pub trait PullExecutor: Send + Sync {
    fn get_rows(&mut self, limit: usize) -> SluiceResult<Rows>;
    fn col_types(&self) -> &[ColumnType];
}

fn internal(err: anyhow::Error) -> SluiceError {
    tracing::warn!(error = ?err, "internal error in pull executor");
    SluiceError::Internal(0)
}

/// Ordered scan over one shard's slice of a table.
pub struct PullTableScan {
    cluster: Arc<dyn Cluster>,
    table: TableInfo,
    shard_id: u64,
    cursor: Option<Vec<u8>>,
    done: bool,
}

impl PullTableScan {
    pub fn new(cluster: Arc<dyn Cluster>, table: TableInfo, shard_id: u64) -> PullTableScan {
        PullTableScan {
            cluster,
            table,
            shard_id,
            cursor: None,
            done: false,
        }
    }
}

impl PullExecutor for PullTableScan {
    fn get_rows(&mut self, limit: usize) -> SluiceResult<Rows> {
        let mut out = Rows::new(self.table.column_types.clone());
        if self.done || limit == 0 {
            return Ok(out);
        }
        let (table_lo, hi) = table_range(self.shard_id, self.table.id);
        let lo = self.cursor.clone().unwrap_or(table_lo);
        let pairs = self
            .cluster
            .local_scan(&lo, &hi, limit)
            .map_err(internal)?;
        if pairs.len() < limit {
            self.done = true;
        }
        if let Some(last) = pairs.last() {
            // Resume strictly after the last returned key.
            let mut next = last.key.clone();
            next.push(0);
            self.cursor = Some(next);
        }
        for pair in pairs {
            let row = Row::decode(&pair.value, &self.table.column_types).map_err(internal)?;
            out.push(row);
        }
        Ok(out)
    }

    fn col_types(&self) -> &[ColumnType] {
        &self.table.column_types
    }
}

/// Keeps rows matching the predicate, refilling from the child until the
/// page is full or the child runs dry.
pub struct PullFilter {
    child: Box<dyn PullExecutor>,
    pred: PlanExpr,
    child_done: bool,
}

impl PullFilter {
    pub fn new(child: Box<dyn PullExecutor>, pred: PlanExpr) -> PullFilter {
        PullFilter {
            child,
            pred,
            child_done: false,
        }
    }
}

impl PullExecutor for PullFilter {
    fn get_rows(&mut self, limit: usize) -> SluiceResult<Rows> {
        let mut out = Rows::new(self.child.col_types().to_vec());
        while out.row_count() < limit && !self.child_done {
            let want = limit - out.row_count();
            let page = self.child.get_rows(want)?;
            if page.row_count() < want {
                self.child_done = true;
            }
            for row in page.into_rows() {
                if self.pred.eval_bool(&row).map_err(internal)? {
                    out.push(row);
                }
            }
        }
        Ok(out)
    }

    fn col_types(&self) -> &[ColumnType] {
        self.child.col_types()
    }
}

/// Applies scalar expressions to every row of the child's pages.
pub struct PullProject {
    child: Box<dyn PullExecutor>,
    exprs: Vec<PlanExpr>,
    col_types: Vec<ColumnType>,
}

impl PullProject {
    pub fn new(
        child: Box<dyn PullExecutor>,
        exprs: Vec<PlanExpr>,
        col_types: Vec<ColumnType>,
    ) -> PullProject {
        PullProject {
            child,
            exprs,
            col_types,
        }
    }
}

impl PullExecutor for PullProject {
    fn get_rows(&mut self, limit: usize) -> SluiceResult<Rows> {
        let page = self.child.get_rows(limit)?;
        let mut out = Rows::new(self.col_types.clone());
        for row in page.into_rows() {
            let mut values = Vec::with_capacity(self.exprs.len());
            for expr in &self.exprs {
                values.push(expr.eval(&row).map_err(internal)?);
            }
            out.push(Row::new(values));
        }
        Ok(out)
    }

    fn col_types(&self) -> &[ColumnType] {
        &self.col_types
    }
}

/// Caps the total number of rows returned.
pub struct PullLimit {
    child: Box<dyn PullExecutor>,
    remaining: usize,
}

impl PullLimit {
    pub fn new(child: Box<dyn PullExecutor>, limit: usize) -> PullLimit {
        PullLimit {
            child,
            remaining: limit,
        }
    }
}

impl PullExecutor for PullLimit {
    fn get_rows(&mut self, limit: usize) -> SluiceResult<Rows> {
        let want = limit.min(self.remaining);
        if want == 0 {
            return Ok(Rows::new(self.child.col_types().to_vec()));
        }
        let page = self.child.get_rows(want)?;
        self.remaining -= page.row_count().min(self.remaining);
        Ok(page)
    }

    fn col_types(&self) -> &[ColumnType] {
        self.child.col_types()
    }
}

struct ShardCursor {
    shard_id: u64,
    done: bool,
}

/// The network split point: issues `QUERY` lookups carrying the execution
/// id, SQL, schema and page limit to each peer shard in turn, merging
/// pages until the caller's limit is met or every shard is drained.
pub struct RemoteExecutor {
    cluster: Arc<dyn Cluster>,
    execution_id: String,
    schema_name: String,
    query: String,
    system_query: bool,
    col_types: Vec<ColumnType>,
    shards: Vec<ShardCursor>,
}

impl RemoteExecutor {
    pub fn new(
        cluster: Arc<dyn Cluster>,
        execution_id: String,
        schema_name: String,
        query: String,
        system_query: bool,
        col_types: Vec<ColumnType>,
    ) -> RemoteExecutor {
        let shards = cluster
            .shard_ids()
            .into_iter()
            .map(|shard_id| ShardCursor {
                shard_id,
                done: false,
            })
            .collect();
        RemoteExecutor {
            cluster,
            execution_id,
            schema_name,
            query,
            system_query,
            col_types,
            shards,
        }
    }
}

impl PullExecutor for RemoteExecutor {
    fn get_rows(&mut self, limit: usize) -> SluiceResult<Rows> {
        let mut out = Rows::new(self.col_types.clone());
        for cursor in self.shards.iter_mut().filter(|c| !c.done) {
            if out.row_count() >= limit {
                break;
            }
            let want = limit - out.row_count();
            let info = QueryExecutionInfo {
                execution_id: self.execution_id.clone(),
                schema_name: self.schema_name.clone(),
                query: self.query.clone(),
                shard_id: cursor.shard_id,
                limit: want as u32,
                system_query: self.system_query,
            };
            let page = self
                .cluster
                .execute_remote_pull_query(&info, self.col_types.clone())?;
            if page.row_count() < want {
                cursor.done = true;
            }
            out.append_all(page);
        }
        Ok(out)
    }

    fn col_types(&self) -> &[ColumnType] {
        &self.col_types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::types::Datum;

    struct FixedRows {
        rows: Vec<Row>,
        types: Vec<ColumnType>,
        pos: usize,
    }

    impl FixedRows {
        fn new(values: Vec<i64>) -> FixedRows {
            FixedRows {
                rows: values
                    .into_iter()
                    .map(|v| Row::new(vec![Some(Datum::Int(v))]))
                    .collect(),
                types: vec![ColumnType::BigInt],
                pos: 0,
            }
        }
    }

    impl PullExecutor for FixedRows {
        fn get_rows(&mut self, limit: usize) -> SluiceResult<Rows> {
            let mut out = Rows::new(self.types.clone());
            while self.pos < self.rows.len() && out.row_count() < limit {
                out.push(self.rows[self.pos].clone());
                self.pos += 1;
            }
            Ok(out)
        }

        fn col_types(&self) -> &[ColumnType] {
            &self.types
        }
    }

    #[test]
    fn filter_fills_pages_across_child_pages() {
        let child = FixedRows::new((0..100).collect());
        let pred = PlanExpr::BinaryOp {
            op: crate::parplan::BinOp::GtEq,
            left: Box::new(PlanExpr::Column(0)),
            right: Box::new(PlanExpr::Literal(Some(Datum::Int(90)))),
        };
        let mut filter = PullFilter::new(Box::new(child), pred);
        let page = filter.get_rows(5).unwrap();
        assert_eq!(page.row_count(), 5);
        assert_eq!(page.get_row(0).get(0), Some(&Datum::Int(90)));
        let page = filter.get_rows(100).unwrap();
        assert_eq!(page.row_count(), 5);
        assert_eq!(filter.get_rows(100).unwrap().row_count(), 0);
    }

    #[test]
    fn limit_caps_total_rows() {
        let child = FixedRows::new((0..100).collect());
        let mut limit = PullLimit::new(Box::new(child), 7);
        assert_eq!(limit.get_rows(5).unwrap().row_count(), 5);
        assert_eq!(limit.get_rows(5).unwrap().row_count(), 2);
        assert_eq!(limit.get_rows(5).unwrap().row_count(), 0);
    }
}
