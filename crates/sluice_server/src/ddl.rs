//! The DDL coordinator.
//!
//! A DDL command runs as `before()` then `on_phase(0..n)` with
//! `after_phase(i)` between, serialized per schema by a lock name. The
//! phase structure exists so every node transitions in step: phase 0
//! prepares receivers (so nothing in flight is dropped), phase 1 does the
//! bulk work (fill, consumer start), phase 2 waits for the cluster to
//! drain and flips visibility. Failure injection points let tests cut the
//! sequence at its interesting seams.

use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex, RwLock};

use tracing::info;

use sluice_core::schema::{
    CatalogEntry, ColumnSelector, SourceInfo, TableInfo, TopicEncoding, TopicInfo,
};
use sluice_core::{SluiceError, SluiceResult};

use sluice_shard::Cluster;
use sluice_sql::parplan::{DdlStatement, ParsedStatement, PhysicalPlan, PlanExpr, PlannedQuery};
use sluice_sql::pull::PullEngine;
use sluice_sql::push::mv::MvRuntime;
use sluice_sql::push::source::DescriptorRegistry;
use sluice_sql::push::PushEngine;

use crate::meta::MetaController;

/// Named failure points, activated by tests.
#[derive(Default)]
pub struct FailureInjector {
    active: RwLock<HashSet<String>>,
}

impl FailureInjector {
    pub fn activate(&self, name: &str) {
        self.active
            .write()
            .expect("failpoints lock")
            .insert(name.to_string());
    }

    pub fn deactivate(&self, name: &str) {
        self.active.write().expect("failpoints lock").remove(name);
    }

    pub fn check_fail(&self, name: &str) -> SluiceResult<()> {
        if self.active.read().expect("failpoints lock").contains(name) {
            tracing::warn!(failpoint = name, "injected failure");
            return Err(SluiceError::Internal(0));
        }
        Ok(())
    }
}

/// Serializes DDL per lock name (one lock per schema).
#[derive(Default)]
struct LockManager {
    held: Mutex<HashSet<String>>,
    cv: Condvar,
}

impl LockManager {
    fn acquire(&self, name: &str) {
        let mut held = self.held.lock().expect("lock manager poisoned");
        while held.contains(name) {
            held = self.cv.wait(held).expect("lock manager poisoned");
        }
        held.insert(name.to_string());
    }

    fn release(&self, name: &str) {
        self.held.lock().expect("lock manager poisoned").remove(name);
        self.cv.notify_all();
    }
}

/// Shared dependencies handed to each command.
pub struct DdlContext {
    pub cluster: Arc<dyn Cluster>,
    pub meta: Arc<MetaController>,
    pub push: Arc<PushEngine>,
    pub pull: Arc<PullEngine>,
    pub registry: Arc<dyn DescriptorRegistry>,
    pub injector: FailureInjector,
}

/// One multi-phase DDL command.
trait DdlCommand {
    fn lock_name(&self) -> String;
    fn num_phases(&self) -> usize;
    fn before(&mut self) -> SluiceResult<()>;
    fn on_phase(&mut self, phase: usize) -> SluiceResult<()>;
    fn after_phase(&mut self, _phase: usize) -> SluiceResult<()> {
        Ok(())
    }
    /// Best-effort in-memory rollback after a failed run; persisted
    /// leftovers are reclaimed through `to_delete` on restart.
    fn cleanup(&mut self) {}
}

pub struct DdlExecutor {
    ctx: Arc<DdlContext>,
    locks: LockManager,
}

impl DdlExecutor {
    pub fn new(ctx: Arc<DdlContext>) -> DdlExecutor {
        DdlExecutor {
            ctx,
            locks: LockManager::default(),
        }
    }

    pub fn context(&self) -> &DdlContext {
        &self.ctx
    }

    /// Run one parsed DDL statement to completion.
    pub fn execute(&self, schema_name: &str, statement: DdlStatement) -> SluiceResult<()> {
        let mut command: Box<dyn DdlCommand> = match statement {
            DdlStatement::CreateSource {
                name,
                column_names,
                column_types,
                primary_key_cols,
                options,
            } => Box::new(CreateSourceCommand {
                ctx: self.ctx.clone(),
                schema_name: schema_name.to_string(),
                name,
                column_names,
                column_types,
                primary_key_cols,
                options,
                source_info: None,
            }),
            DdlStatement::CreateMaterializedView { name, query } => {
                Box::new(CreateMvCommand {
                    ctx: self.ctx.clone(),
                    schema_name: schema_name.to_string(),
                    name,
                    query,
                    mv: None,
                })
            }
            DdlStatement::DropSource { name } => Box::new(DropSourceCommand {
                ctx: self.ctx.clone(),
                schema_name: schema_name.to_string(),
                name,
                info: None,
            }),
            DdlStatement::DropMaterializedView { name } => Box::new(DropMvCommand {
                ctx: self.ctx.clone(),
                schema_name: schema_name.to_string(),
                name,
                info: None,
            }),
        };

        let lock_name = command.lock_name();
        self.locks.acquire(&lock_name);
        let result = Self::run(command.as_mut());
        self.locks.release(&lock_name);
        result
    }

    fn run(command: &mut dyn DdlCommand) -> SluiceResult<()> {
        let result = (|| {
            command.before()?;
            for phase in 0..command.num_phases() {
                command.on_phase(phase)?;
                command.after_phase(phase)?;
            }
            Ok(())
        })();
        if result.is_err() {
            command.cleanup();
        }
        result
    }
}

fn internal(err: anyhow::Error) -> SluiceError {
    tracing::warn!(error = ?err, "internal error in ddl");
    SluiceError::Internal(0)
}

/// Storage-level existence check: catches objects persisted by a crashed
/// DDL that never got registered.
fn exists_in_storage(
    pull: &PullEngine,
    schema_name: &str,
    name: &str,
    kind: &str,
) -> SluiceResult<bool> {
    let sql = format!(
        "select id from tables where schema_name = '{schema_name}' and name = '{name}' and kind = '{kind}'"
    );
    let rows = pull.execute_system_query("sys", &sql)?;
    Ok(rows.row_count() != 0)
}

// Create source: 2 phases. Phase 0 registers the source with the push
// engine (so forwards can land), metadata persists after phase 0, phase 1
// starts consumers and registers it in the catalog.
struct CreateSourceCommand {
    ctx: Arc<DdlContext>,
    schema_name: String,
    name: String,
    column_names: Vec<String>,
    column_types: Vec<sluice_core::types::ColumnType>,
    primary_key_cols: Vec<usize>,
    options: std::collections::BTreeMap<String, String>,
    source_info: Option<SourceInfo>,
}

impl CreateSourceCommand {
    fn required_option(&self, key: &str) -> SluiceResult<String> {
        self.options
            .get(key)
            .cloned()
            .ok_or_else(|| SluiceError::invalid_statement(format!("{key} is required")))
    }

    fn build_source_info(&self, table_id: u64) -> SluiceResult<SourceInfo> {
        let header_encoding = TopicEncoding::parse(&self.required_option("header_encoding")?)?;
        let key_encoding = TopicEncoding::parse(&self.required_option("key_encoding")?)?;
        let value_encoding = TopicEncoding::parse(&self.required_option("value_encoding")?)?;
        let broker_name = self.required_option("broker")?;
        let topic_name = self.required_option("topic")?;

        // Protobuf encodings must reference a registered message.
        for encoding in [&header_encoding, &key_encoding, &value_encoding] {
            if let TopicEncoding::Protobuf(message) = encoding {
                if self.ctx.registry.message_descriptor(message).is_none() {
                    return Err(SluiceError::UnknownTopicEncoding(format!(
                        "proto message {message:?} not registered"
                    )));
                }
            }
        }

        let col_selectors = match self.options.get("column_selectors") {
            Some(raw) if !raw.trim().is_empty() => raw
                .split(',')
                .map(ColumnSelector::parse)
                .collect::<Result<Vec<_>, _>>()?,
            _ => Vec::new(),
        };
        if !col_selectors.is_empty() && col_selectors.len() != self.column_types.len() {
            return Err(SluiceError::WrongNumberColumnSelectors {
                selectors: col_selectors.len(),
                columns: self.column_types.len(),
            });
        }

        let mut properties = std::collections::BTreeMap::new();
        if let Some(raw) = self.options.get("properties") {
            for pair in raw.split(';').filter(|p| !p.trim().is_empty()) {
                let Some((k, v)) = pair.split_once('=') else {
                    return Err(SluiceError::invalid_statement(format!(
                        "bad property {pair:?}"
                    )));
                };
                properties.insert(k.trim().to_string(), v.trim().to_string());
            }
        }

        Ok(SourceInfo {
            table: TableInfo {
                id: table_id,
                schema_name: self.schema_name.clone(),
                name: self.name.clone(),
                primary_key_cols: self.primary_key_cols.clone(),
                column_names: self.column_names.clone(),
                column_types: self.column_types.clone(),
            },
            topic: TopicInfo {
                broker_name,
                topic_name,
                header_encoding,
                key_encoding,
                value_encoding,
                col_selectors,
                properties,
            },
        })
    }
}

impl DdlCommand for CreateSourceCommand {
    fn lock_name(&self) -> String {
        format!("{}/", self.schema_name)
    }

    fn num_phases(&self) -> usize {
        2
    }

    fn before(&mut self) -> SluiceResult<()> {
        if self.ctx.meta.get_source(&self.schema_name, &self.name).is_some() {
            return Err(SluiceError::SourceAlreadyExists {
                schema_name: self.schema_name.clone(),
                name: self.name.clone(),
            });
        }
        if exists_in_storage(&self.ctx.pull, &self.schema_name, &self.name, "source")? {
            return Err(SluiceError::SourceAlreadyExists {
                schema_name: self.schema_name.clone(),
                name: self.name.clone(),
            });
        }
        let table_id = self.ctx.meta.next_table_id().map_err(internal)?;
        self.source_info = Some(self.build_source_info(table_id)?);
        Ok(())
    }

    fn on_phase(&mut self, phase: usize) -> SluiceResult<()> {
        let info = self.source_info.clone().expect("validated in before");
        match phase {
            0 => {
                // Receive forwarded rows before any consumer runs.
                self.ctx.push.create_source(info).map_err(internal)?;
                Ok(())
            }
            1 => {
                self.ctx
                    .push
                    .start_source(info.table.id)
                    .map_err(internal)?;
                self.ctx.meta.register_source(info);
                Ok(())
            }
            other => panic!("invalid phase {other}"),
        }
    }

    fn after_phase(&mut self, phase: usize) -> SluiceResult<()> {
        if phase == 0 {
            // Persist before registration: a restart in between must not
            // lose a source that was already visible.
            let info = self.source_info.clone().expect("validated in before");
            self.ctx
                .meta
                .persist(&CatalogEntry::Source(info))
                .map_err(internal)?;
        }
        Ok(())
    }
}

// Create MV: 3 phases. Phase 0 writes to_delete markers and connects the
// aggregations as remote consumers; phase 1 fills; metadata persists after
// phase 1 on the originating node; phase 2 waits for the schedulers,
// registers and removes the markers.
struct CreateMvCommand {
    ctx: Arc<DdlContext>,
    schema_name: String,
    name: String,
    query: String,
    mv: Option<Arc<MvRuntime>>,
}

impl CreateMvCommand {
    fn all_table_ids(mv: &MvRuntime) -> Vec<u64> {
        let mut ids = vec![mv.info().table.id];
        ids.extend(mv.info().internal_table_ids.iter().copied());
        ids
    }

    fn derive_primary_key(planned: &PlannedQuery, feed: &TableInfo) -> SluiceResult<Vec<usize>> {
        if let Some(group_cols) = &planned.group_cols {
            if group_cols.is_empty() {
                return Err(SluiceError::invalid_statement(
                    "an aggregating materialized view requires a GROUP BY key",
                ));
            }
            return Ok(group_cols.clone());
        }
        // Non-aggregating views key by the feed table's primary key, which
        // must survive the projection.
        let mut plan = &planned.plan;
        let exprs: Option<&Vec<PlanExpr>> = loop {
            match plan {
                PhysicalPlan::TableScan { .. } => break None,
                PhysicalPlan::Project { exprs, input } => {
                    // The planner builds at most one projection over the scan.
                    let _ = input;
                    break Some(exprs);
                }
                PhysicalPlan::Filter { input, .. } | PhysicalPlan::Limit { input, .. } => {
                    plan = input;
                }
                PhysicalPlan::Aggregate { .. } => {
                    unreachable!("aggregates handled via group_cols")
                }
            }
        };
        let mut pk = Vec::with_capacity(feed.primary_key_cols.len());
        for feed_col in &feed.primary_key_cols {
            let position = match exprs {
                None => Some(*feed_col),
                Some(exprs) => exprs
                    .iter()
                    .position(|e| matches!(e, PlanExpr::Column(c) if c == feed_col)),
            };
            let Some(position) = position else {
                return Err(SluiceError::invalid_statement(format!(
                    "materialized view must select the key column {}",
                    feed.column_names[*feed_col]
                )));
            };
            pk.push(position);
        }
        Ok(pk)
    }
}

impl DdlCommand for CreateMvCommand {
    fn lock_name(&self) -> String {
        format!("{}/", self.schema_name)
    }

    fn num_phases(&self) -> usize {
        3
    }

    fn before(&mut self) -> SluiceResult<()> {
        if self.ctx.meta.get_mv(&self.schema_name, &self.name).is_some() {
            return Err(SluiceError::MaterializedViewAlreadyExists {
                schema_name: self.schema_name.clone(),
                name: self.name.clone(),
            });
        }
        if exists_in_storage(
            &self.ctx.pull,
            &self.schema_name,
            &self.name,
            "materialized_view",
        )? {
            return Err(SluiceError::MaterializedViewAlreadyExists {
                schema_name: self.schema_name.clone(),
                name: self.name.clone(),
            });
        }

        let planned = self.ctx.pull.plan_output(&self.schema_name, &self.query)?;
        let table_id = self.ctx.meta.next_table_id().map_err(internal)?;
        // Pull the feed table back out of the plan for key derivation.
        let mut plan = &planned.plan;
        let feed = loop {
            match plan {
                PhysicalPlan::TableScan { table } => break table.clone(),
                PhysicalPlan::Filter { input, .. }
                | PhysicalPlan::Project { input, .. }
                | PhysicalPlan::Aggregate { input, .. }
                | PhysicalPlan::Limit { input, .. } => plan = input,
            }
        };
        let primary_key_cols = Self::derive_primary_key(&planned, &feed)?;
        let mv_table = TableInfo {
            id: table_id,
            schema_name: self.schema_name.clone(),
            name: self.name.clone(),
            primary_key_cols,
            column_names: planned.col_names.clone(),
            column_types: planned.col_types.clone(),
        };
        let meta = self.ctx.meta.clone();
        let mv = MvRuntime::build(
            mv_table,
            self.query.clone(),
            &planned,
            self.ctx.push.sharder().clone(),
            &mut || meta.next_table_id().map_err(internal),
        )?;
        self.mv = Some(mv);
        Ok(())
    }

    fn on_phase(&mut self, phase: usize) -> SluiceResult<()> {
        let mv = self.mv.clone().expect("built in before");
        match phase {
            0 => {
                // Markers first: a crash anywhere after this point leaves
                // reclaimable garbage, never an orphaned range. Connecting
                // the aggregations before the fill means forwards produced
                // during the fill are consumed, not dropped.
                self.ctx
                    .meta
                    .store_to_delete_batch(&Self::all_table_ids(&mv))
                    .map_err(internal)?;
                self.ctx.push.connect_mv_aggregations(&mv);
                Ok(())
            }
            1 => self.ctx.push.fill_mv(&mv).map_err(internal),
            2 => {
                // Fill-produced forwards must finish everywhere before the
                // view becomes visible.
                self.ctx.push.wait_for_schedulers().map_err(internal)?;
                self.ctx.push.register_mv(mv.clone());
                self.ctx.meta.register_mv(mv.info().clone());
                self.ctx.injector.check_fail("create_mv_2")?;
                self.ctx
                    .meta
                    .remove_to_delete_batch(&Self::all_table_ids(&mv))
                    .map_err(internal)
            }
            other => panic!("invalid phase {other}"),
        }
    }

    fn after_phase(&mut self, phase: usize) -> SluiceResult<()> {
        if phase == 1 {
            self.ctx.injector.check_fail("create_mv_1")?;
            let mv = self.mv.clone().expect("built in before");
            self.ctx
                .meta
                .persist(&CatalogEntry::MaterializedView(mv.info().clone()))
                .map_err(internal)?;
        }
        Ok(())
    }

    fn cleanup(&mut self) {
        // The to_delete markers stay: restart reclaims any persisted rows.
        if let Some(mv) = &self.mv {
            self.ctx.meta.unregister_mv(&self.schema_name, &self.name);
            let _ = self.ctx.push.remove_mv(mv.info().table.id);
            self.ctx.push.disconnect_mv(mv);
        }
    }
}

// Drop commands: reverse of create. Phase 0 detaches the object from the
// data flow, phase 1 removes metadata and schedules range deletion through
// to_delete markers.

struct DropSourceCommand {
    ctx: Arc<DdlContext>,
    schema_name: String,
    name: String,
    info: Option<SourceInfo>,
}

fn drop_table_data(ctx: &DdlContext, table_ids: &[u64]) -> SluiceResult<()> {
    ctx.meta.store_to_delete_batch(table_ids).map_err(internal)?;
    for table_id in table_ids {
        ctx.cluster
            .delete_all_data_for_table(*table_id)
            .map_err(internal)?;
    }
    ctx.meta.remove_to_delete_batch(table_ids).map_err(internal)
}

impl DdlCommand for DropSourceCommand {
    fn lock_name(&self) -> String {
        format!("{}/", self.schema_name)
    }

    fn num_phases(&self) -> usize {
        2
    }

    fn before(&mut self) -> SluiceResult<()> {
        let info = self
            .ctx
            .meta
            .get_source(&self.schema_name, &self.name)
            .ok_or_else(|| SluiceError::table_not_exists(&self.schema_name, &self.name))?;
        for mv in self.ctx.push.all_mvs() {
            if mv.feed_table().id == info.table.id {
                return Err(SluiceError::invalid_statement(format!(
                    "cannot drop source {}: materialized view {} reads from it",
                    self.name,
                    mv.info().table.name
                )));
            }
        }
        self.info = Some(info);
        Ok(())
    }

    fn on_phase(&mut self, phase: usize) -> SluiceResult<()> {
        let info = self.info.clone().expect("checked in before");
        match phase {
            0 => {
                // Stop consumers and forwarding before metadata goes away.
                self.ctx.push.remove_source(info.table.id).map_err(internal)?;
                self.ctx.meta.unregister_source(&self.schema_name, &self.name);
                Ok(())
            }
            1 => {
                self.ctx
                    .meta
                    .delete_persisted(info.table.id)
                    .map_err(internal)?;
                drop_table_data(&self.ctx, &[info.table.id])
            }
            other => panic!("invalid phase {other}"),
        }
    }
}

struct DropMvCommand {
    ctx: Arc<DdlContext>,
    schema_name: String,
    name: String,
    info: Option<sluice_core::schema::MaterializedViewInfo>,
}

impl DdlCommand for DropMvCommand {
    fn lock_name(&self) -> String {
        format!("{}/", self.schema_name)
    }

    fn num_phases(&self) -> usize {
        2
    }

    fn before(&mut self) -> SluiceResult<()> {
        let info = self
            .ctx
            .meta
            .get_mv(&self.schema_name, &self.name)
            .ok_or_else(|| SluiceError::table_not_exists(&self.schema_name, &self.name))?;
        for mv in self.ctx.push.all_mvs() {
            if mv.feed_table().id == info.table.id {
                return Err(SluiceError::invalid_statement(format!(
                    "cannot drop materialized view {}: materialized view {} reads from it",
                    self.name,
                    mv.info().table.name
                )));
            }
        }
        self.info = Some(info);
        Ok(())
    }

    fn on_phase(&mut self, phase: usize) -> SluiceResult<()> {
        let info = self.info.clone().expect("checked in before");
        match phase {
            0 => {
                self.ctx.push.remove_mv(info.table.id).map_err(internal)?;
                self.ctx.meta.unregister_mv(&self.schema_name, &self.name);
                Ok(())
            }
            1 => {
                self.ctx
                    .meta
                    .delete_persisted(info.table.id)
                    .map_err(internal)?;
                let mut ids = vec![info.table.id];
                ids.extend(info.internal_table_ids.iter().copied());
                drop_table_data(&self.ctx, &ids)
            }
            other => panic!("invalid phase {other}"),
        }
    }
}

/// Statement entry point used by the API: DDL runs through the
/// coordinator, anything else is a pull query.
pub fn classify(sql: &str) -> SluiceResult<ParsedStatement> {
    sluice_sql::parplan::parse_statement(sql)
}

/// Record of executed DDL, used by logs.
pub fn describe(statement: &DdlStatement) -> String {
    match statement {
        DdlStatement::CreateSource { name, .. } => format!("create source {name}"),
        DdlStatement::CreateMaterializedView { name, .. } => {
            format!("create materialized view {name}")
        }
        DdlStatement::DropSource { name } => format!("drop source {name}"),
        DdlStatement::DropMaterializedView { name } => {
            format!("drop materialized view {name}")
        }
    }
}

pub fn log_executed(schema_name: &str, statement: &DdlStatement) {
    info!(schema = schema_name, ddl = %describe(statement), "ddl executed");
}
