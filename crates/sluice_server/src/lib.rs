//! Sluice node composition root.
//!
//! Wires the cluster runtime, KV store, push/pull engines, catalog and DDL
//! coordinator together, restores persisted state on startup and exposes
//! the pieces the API layer serves. The startup order matters: views must
//! reconnect to their feeds before source consumers start, and the pull
//! engine only becomes generally available once the catalog is loaded.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use tracing::{info, warn};

use sluice_core::schema::CatalogEntry;
use sluice_core::types::Rows;
use sluice_core::SluiceResult;

use sluice_shard::kv::FjallKv;
use sluice_shard::local::LocalCluster;
use sluice_shard::Cluster;

use sluice_sql::parplan::ParsedStatement;
use sluice_sql::pull::PullEngine;
use sluice_sql::push::mv::MvRuntime;
use sluice_sql::push::source::MessageProvider;
use sluice_sql::push::PushEngine;

pub mod api;
pub mod config;
pub mod ddl;
pub mod meta;
pub mod metrics;
pub mod proto_registry;

use config::NodeConfig;
use ddl::{DdlContext, DdlExecutor, FailureInjector};
use meta::MetaController;
use proto_registry::ProtoRegistry;

/// Shared handles the API layer works against.
pub struct ServerState {
    pub meta: Arc<MetaController>,
    pub push: Arc<PushEngine>,
    pub pull: Arc<PullEngine>,
    pub ddl: Arc<DdlExecutor>,
    pub registry: Arc<ProtoRegistry>,
    /// Sequence for redacted internal-error references.
    pub error_sequence: AtomicU64,
}

pub struct Server {
    config: NodeConfig,
    cluster: Arc<LocalCluster>,
    state: Arc<ServerState>,
}

impl Server {
    /// Build a node from its config. Nothing runs until [`Server::start`].
    pub fn new(config: NodeConfig) -> anyhow::Result<Server> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir)?;
        std::fs::create_dir_all(config.ingest_dir())?;

        let kv = Arc::new(FjallKv::open(config.data_dir.join("db"))?);
        let cluster = LocalCluster::new(
            config.node_id,
            config.node_ids.clone(),
            config.num_shards,
            kv,
            config.test_mode,
        );
        let registry = ProtoRegistry::new();
        let meta = MetaController::new(cluster.clone());
        let push = Arc::new(PushEngine::new(cluster.clone(), registry.clone()));
        let pull = PullEngine::new(cluster.clone(), meta.clone());

        cluster.register_shard_listener_factory(push.listener_factory());
        cluster.register_remote_query_handler(pull.clone());

        let ddl = Arc::new(DdlExecutor::new(Arc::new(DdlContext {
            cluster: cluster.clone(),
            meta: meta.clone(),
            push: push.clone(),
            pull: pull.clone(),
            registry: registry.clone(),
            injector: FailureInjector::default(),
        })));

        Ok(Server {
            config,
            cluster,
            state: Arc::new(ServerState {
                meta,
                push,
                pull,
                ddl,
                registry,
                error_sequence: AtomicU64::new(0),
            }),
        })
    }

    /// Register a topic provider under a broker name. Must happen before
    /// `start` so restored sources can reconnect their consumers.
    pub fn register_message_provider(
        &self,
        broker_name: &str,
        provider: Arc<dyn MessageProvider>,
    ) {
        self.state.push.register_message_provider(broker_name, provider);
    }

    /// Start the node: open shards, restore the catalog, reconnect views
    /// and sources, clean up failed DDL, then open for queries.
    pub fn start(&self) -> anyhow::Result<()> {
        let state = &self.state;
        state.push.start()?;
        self.cluster.start()?;
        state.pull.start();

        let mut sources = Vec::new();
        let mut mvs = Vec::new();
        for entry in state.meta.load_persisted()? {
            match entry {
                CatalogEntry::Source(info) => sources.push(info),
                CatalogEntry::MaterializedView(info) => mvs.push(info),
            }
        }

        // Sources first (views resolve their feed tables through them),
        // but without consumers, so nothing flows while views reconnect.
        for info in &sources {
            state.meta.register_source(info.clone());
            state.push.create_source(info.clone())?;
        }
        // Views in id order: a view reading another view restores after it.
        mvs.sort_by_key(|info| info.table.id);
        for info in &mvs {
            let planned = state
                .pull
                .plan_output(&info.table.schema_name, &info.query)?;
            let mut internal = info.internal_table_ids.clone().into_iter();
            let mv = MvRuntime::build(
                info.table.clone(),
                info.query.clone(),
                &planned,
                state.push.sharder().clone(),
                &mut || {
                    internal.next().ok_or_else(|| {
                        tracing::error!("persisted view is missing internal table ids");
                        sluice_core::SluiceError::Internal(0)
                    })
                },
            )?;
            state.push.connect_mv_aggregations(&mv);
            state.push.connect_mv_to_feed(&mv)?;
            state.push.register_mv(mv.clone());
            state.meta.register_mv(info.clone());
        }
        // Now it is safe for rows to flow.
        for info in &sources {
            if let Err(err) = state.push.start_source(info.table.id) {
                // A missing broker keeps the source passive; it still
                // applies forwarded rows.
                warn!(source = %info.table.name, error = ?err, "source consumers not started");
            }
        }

        state.meta.cleanup_to_delete()?;
        state.pull.set_available();
        state.push.trigger_all();
        info!(
            node = self.config.node_id,
            shards = self.config.num_shards,
            sources = sources.len(),
            views = mvs.len(),
            "sluice node started"
        );
        Ok(())
    }

    pub fn stop(&self) -> anyhow::Result<()> {
        self.state.pull.stop();
        self.state.push.stop()?;
        // Flush before closing so restart replays as little as possible.
        self.cluster.sync()?;
        self.cluster.stop()?;
        Ok(())
    }

    pub fn state(&self) -> Arc<ServerState> {
        self.state.clone()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn cluster(&self) -> Arc<LocalCluster> {
        self.cluster.clone()
    }

    pub fn pull_engine(&self) -> Arc<PullEngine> {
        self.state.pull.clone()
    }

    pub fn push_engine(&self) -> Arc<PushEngine> {
        self.state.push.clone()
    }

    pub fn meta_controller(&self) -> Arc<MetaController> {
        self.state.meta.clone()
    }

    pub fn ddl_executor(&self) -> Arc<DdlExecutor> {
        self.state.ddl.clone()
    }

    /// Convenience entry point used by tests and embedded callers: run one
    /// statement, returning rows for queries and an empty batch for DDL.
    pub fn execute_statement(&self, schema_name: &str, sql: &str) -> SluiceResult<Rows> {
        match ddl::classify(sql)? {
            ParsedStatement::Ddl(statement) => {
                self.state.ddl.execute(schema_name, statement.clone())?;
                ddl::log_executed(schema_name, &statement);
                Ok(Rows::new(vec![]))
            }
            ParsedStatement::Query(query) => self.state.pull.execute_query(schema_name, &query),
        }
    }
}
