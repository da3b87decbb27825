//! The push engine: per-shard schedulers, receiver-table draining and the
//! registry of sources, views and remote consumers.
//!
//! Each shard has one logical scheduler; everything that touches a shard's
//! push state (receiver draining, view fills) runs as a job on that
//! scheduler, so per-shard work is serialized without fine-grained locks.
//! The shard state machine signals `remote_write_occurred` on the
//! processor replica and the scheduler drains the receiver table in
//! `(batch_seq, receiver_seq)` order, whole batch groups at a time.

pub mod aggregator;
pub mod exec;
pub mod mv;
pub mod source;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, RwLock, Weak};
use std::thread::JoinHandle;

use tracing::{debug, error, info, warn};

use sluice_core::codec::{read_u32_be, read_u64_be, table_range, TABLE_PREFIX_LEN};
use sluice_core::schema::{SourceInfo, RECEIVER_TABLE_ID};
use sluice_core::types::{ColumnType, Row};

use sluice_shard::forward::decode_prev_and_current_row;
use sluice_shard::sharder::Sharder;
use sluice_shard::{
    group_pairs_by_prefix, Cluster, ShardListener, ShardListenerFactory, WriteBatch,
};

use exec::{ExecutionContext, RowsBatch, RowsEntry};
use mv::MvRuntime;
use source::{DescriptorRegistry, MessageProvider, MessageSink, SourceRuntime};

/// Rows replayed per fill batch.
const FILL_CHUNK: usize = 512;
/// Barrier rounds before `wait_for_schedulers` gives up.
const DRAIN_MAX_ROUNDS: usize = 1000;

/// Consumes batches of rows forwarded from other shards. Registered under
/// a remote-consumer id (a table id) before any forward can reference it.
pub trait RemoteRowsHandler: Send + Sync {
    fn input_col_types(&self) -> Vec<ColumnType>;
    fn handle_remote_rows(
        &self,
        batch: RowsBatch,
        ctx: &mut ExecutionContext,
    ) -> anyhow::Result<()>;
}

enum Job {
    ProcessReceiver,
    Run(Box<dyn FnOnce() + Send + 'static>),
    Stop,
}

struct ShardScheduler {
    tx: mpsc::Sender<Job>,
    /// Coalesces remote-write signals so a burst queues one drain.
    pending: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// Either kind of table a view can be fed by.
#[derive(Clone)]
enum FeedHandle {
    Source(Arc<SourceRuntime>),
    Mv(Arc<MvRuntime>),
}

impl FeedHandle {
    fn add_subscriber(&self, shard_id: u64, mv: Arc<MvRuntime>) {
        match self {
            FeedHandle::Source(s) => s.add_subscriber(shard_id, mv),
            FeedHandle::Mv(m) => m.add_subscriber(shard_id, mv),
        }
    }

    fn remove_subscriber(&self, mv_table_id: u64) {
        match self {
            FeedHandle::Source(s) => s.remove_subscriber(mv_table_id),
            FeedHandle::Mv(m) => m.remove_subscriber(mv_table_id),
        }
    }
}

struct PushEngineInner {
    cluster: Arc<dyn Cluster>,
    sharder: Sharder,
    registry: Arc<dyn DescriptorRegistry>,
    providers: RwLock<HashMap<String, Arc<dyn MessageProvider>>>,
    schedulers: RwLock<HashMap<u64, Arc<ShardScheduler>>>,
    remote_consumers: RwLock<HashMap<u64, Arc<dyn RemoteRowsHandler>>>,
    sources: RwLock<HashMap<u64, Arc<SourceRuntime>>>,
    mvs: RwLock<HashMap<u64, Arc<MvRuntime>>>,
    started: AtomicBool,
}

/// The push engine for one node.
pub struct PushEngine {
    inner: Arc<PushEngineInner>,
}

struct PushListenerFactory {
    engine: Weak<PushEngineInner>,
}

struct PushListener {
    engine: Weak<PushEngineInner>,
    shard_id: u64,
}

impl ShardListener for PushListener {
    fn remote_write_occurred(&self) {
        if let Some(engine) = self.engine.upgrade() {
            engine.signal(self.shard_id);
        }
    }
}

impl ShardListenerFactory for PushListenerFactory {
    fn create_shard_listener(&self, shard_id: u64) -> Arc<dyn ShardListener> {
        Arc::new(PushListener {
            engine: self.engine.clone(),
            shard_id,
        })
    }
}

impl PushEngine {
    pub fn new(
        cluster: Arc<dyn Cluster>,
        registry: Arc<dyn DescriptorRegistry>,
    ) -> PushEngine {
        let sharder = Sharder::new(cluster.shard_ids());
        PushEngine {
            inner: Arc::new(PushEngineInner {
                cluster,
                sharder,
                registry,
                providers: RwLock::new(HashMap::new()),
                schedulers: RwLock::new(HashMap::new()),
                remote_consumers: RwLock::new(HashMap::new()),
                sources: RwLock::new(HashMap::new()),
                mvs: RwLock::new(HashMap::new()),
                started: AtomicBool::new(false),
            }),
        }
    }

    /// Factory handed to the cluster before it starts; processor replicas
    /// signal through it when forward writes land.
    pub fn listener_factory(&self) -> Arc<dyn ShardListenerFactory> {
        Arc::new(PushListenerFactory {
            engine: Arc::downgrade(&self.inner),
        })
    }

    pub fn sharder(&self) -> &Sharder {
        &self.inner.sharder
    }

    /// Spawn one scheduler per shard. Must run before the cluster starts
    /// delivering remote-write signals.
    pub fn start(&self) -> anyhow::Result<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut schedulers = self.inner.schedulers.write().expect("schedulers lock");
        for shard_id in self.inner.cluster.shard_ids() {
            let (tx, rx) = mpsc::channel();
            let pending = Arc::new(AtomicBool::new(false));
            let engine = Arc::downgrade(&self.inner);
            let worker_pending = pending.clone();
            let handle = std::thread::Builder::new()
                .name(format!("push-sched-{shard_id}"))
                .spawn(move || scheduler_loop(shard_id, rx, worker_pending, engine))?;
            schedulers.insert(
                shard_id,
                Arc::new(ShardScheduler {
                    tx,
                    pending,
                    handle: Mutex::new(Some(handle)),
                }),
            );
        }
        info!(shards = schedulers.len(), "push engine started");
        Ok(())
    }

    pub fn stop(&self) -> anyhow::Result<()> {
        if !self.inner.started.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let schedulers: Vec<Arc<ShardScheduler>> = {
            let mut guard = self.inner.schedulers.write().expect("schedulers lock");
            guard.drain().map(|(_, s)| s).collect()
        };
        for scheduler in &schedulers {
            let _ = scheduler.tx.send(Job::Stop);
        }
        for scheduler in schedulers {
            if let Some(handle) = scheduler.handle.lock().expect("handle lock").take() {
                let _ = handle.join();
            }
        }
        self.inner.remote_consumers.write().expect("consumers lock").clear();
        self.inner.sources.write().expect("sources lock").clear();
        self.inner.mvs.write().expect("mvs lock").clear();
        Ok(())
    }

    /// Kick every shard once; used after startup or snapshot restore so
    /// receiver rows persisted before this process lived get processed.
    pub fn trigger_all(&self) {
        for shard_id in self.inner.cluster.shard_ids() {
            self.inner.signal(shard_id);
        }
    }

    pub fn register_message_provider(&self, broker_name: &str, provider: Arc<dyn MessageProvider>) {
        self.inner
            .providers
            .write()
            .expect("providers lock")
            .insert(broker_name.to_string(), provider);
    }

    pub fn register_remote_consumer(&self, id: u64, handler: Arc<dyn RemoteRowsHandler>) {
        self.inner
            .remote_consumers
            .write()
            .expect("consumers lock")
            .insert(id, handler);
    }

    pub fn unregister_remote_consumer(&self, id: u64) {
        self.inner
            .remote_consumers
            .write()
            .expect("consumers lock")
            .remove(&id);
    }

    /// Create a source runtime and register it to receive forwarded rows.
    /// Consumers are not started yet.
    pub fn create_source(&self, info: SourceInfo) -> anyhow::Result<Arc<SourceRuntime>> {
        let runtime = SourceRuntime::new(
            info,
            self.inner.registry.clone(),
            self.inner.cluster.clone(),
            self.inner.sharder.clone(),
        );
        let table_id = runtime.info().table.id;
        self.register_remote_consumer(table_id, runtime.clone());
        self.inner
            .sources
            .write()
            .expect("sources lock")
            .insert(table_id, runtime.clone());
        Ok(runtime)
    }

    /// Activate a source's message consumers.
    pub fn start_source(&self, table_id: u64) -> anyhow::Result<()> {
        let runtime = self
            .source(table_id)
            .ok_or_else(|| anyhow::anyhow!("unknown source table {table_id}"))?;
        let broker = runtime.info().topic.broker_name.clone();
        let topic = runtime.info().topic.topic_name.clone();
        let provider = self
            .inner
            .providers
            .read()
            .expect("providers lock")
            .get(&broker)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown broker {broker}"))?;
        runtime.set_started(true);
        provider.subscribe(&topic, runtime as Arc<dyn MessageSink>)
    }

    /// Stop consumers and drop the source registration.
    pub fn remove_source(&self, table_id: u64) -> anyhow::Result<()> {
        let Some(runtime) = self
            .inner
            .sources
            .write()
            .expect("sources lock")
            .remove(&table_id)
        else {
            return Ok(());
        };
        runtime.set_started(false);
        let broker = runtime.info().topic.broker_name.clone();
        if let Some(provider) = self
            .inner
            .providers
            .read()
            .expect("providers lock")
            .get(&broker)
        {
            provider.unsubscribe(&runtime.info().topic.topic_name)?;
        }
        self.unregister_remote_consumer(table_id);
        Ok(())
    }

    pub fn source(&self, table_id: u64) -> Option<Arc<SourceRuntime>> {
        self.inner
            .sources
            .read()
            .expect("sources lock")
            .get(&table_id)
            .cloned()
    }

    pub fn mv(&self, table_id: u64) -> Option<Arc<MvRuntime>> {
        self.inner
            .mvs
            .read()
            .expect("mvs lock")
            .get(&table_id)
            .cloned()
    }

    pub fn all_mvs(&self) -> Vec<Arc<MvRuntime>> {
        self.inner
            .mvs
            .read()
            .expect("mvs lock")
            .values()
            .cloned()
            .collect()
    }

    /// Register the view's full-aggregation side as a remote consumer, so
    /// in-flight forwards are not dropped while the view is filling.
    pub fn connect_mv_aggregations(&self, mv: &Arc<MvRuntime>) {
        if let Some(consumer_id) = mv.agg_consumer_id() {
            self.register_remote_consumer(consumer_id, mv.clone());
        }
    }

    /// Fill the view from its feeding table, shard by shard. Connecting to
    /// the feed and replaying the snapshot scan run in one scheduler job
    /// per shard, so concurrently ingested rows are seen exactly once.
    pub fn fill_mv(&self, mv: &Arc<MvRuntime>) -> anyhow::Result<()> {
        let feed = self.feed_handle(mv.feed_table().id)?;
        let feed_table = mv.feed_table().clone();
        for shard_id in self.inner.cluster.shard_ids() {
            let mv = mv.clone();
            let feed = feed.clone();
            let feed_table = feed_table.clone();
            let cluster = self.inner.cluster.clone();
            self.run_on_shard(
                shard_id,
                Box::new(move || {
                    feed.add_subscriber(shard_id, mv.clone());
                    let (lo, hi) = table_range(shard_id, feed_table.id);
                    let pairs = cluster.local_scan(&lo, &hi, usize::MAX)?;
                    for chunk in pairs.chunks(FILL_CHUNK) {
                        let mut entries = Vec::with_capacity(chunk.len());
                        for pair in chunk {
                            let row = Row::decode(&pair.value, &feed_table.column_types)?;
                            entries.push(RowsEntry::insert(row));
                        }
                        let mut wb = WriteBatch::new(shard_id);
                        let mut fwd = HashMap::new();
                        let mut ctx = ExecutionContext {
                            shard_id,
                            batch_seq: 0,
                            enable_dedup: false,
                            write_batch: &mut wb,
                            forward_batches: &mut fwd,
                            cluster: cluster.as_ref(),
                        };
                        mv.feed(RowsBatch::new(entries), &mut ctx)?;
                        if !wb.is_empty() {
                            cluster.write_batch(wb)?;
                        }
                        for (dest_shard, batch) in fwd {
                            cluster.forward(dest_shard, batch)?;
                        }
                    }
                    Ok(())
                }),
            )?;
        }
        Ok(())
    }

    /// Reattach a restored view to its feeding table on every shard. Only
    /// valid before consumers start flowing rows; live creation goes
    /// through `fill_mv`, which connects per shard inside the scheduler.
    pub fn connect_mv_to_feed(&self, mv: &Arc<MvRuntime>) -> anyhow::Result<()> {
        let feed = self.feed_handle(mv.feed_table().id)?;
        for shard_id in self.inner.cluster.shard_ids() {
            feed.add_subscriber(shard_id, mv.clone());
        }
        Ok(())
    }

    /// Make the view visible to the engine (rows start flowing to any
    /// later views built on it).
    pub fn register_mv(&self, mv: Arc<MvRuntime>) {
        self.inner
            .mvs
            .write()
            .expect("mvs lock")
            .insert(mv.info().table.id, mv);
    }

    /// Detach a view from the data flow: unsubscribe it from its feed and
    /// unregister its aggregation consumer. Safe to call for views that
    /// never finished creation.
    pub fn disconnect_mv(&self, mv: &Arc<MvRuntime>) {
        if let Ok(feed) = self.feed_handle(mv.feed_table().id) {
            feed.remove_subscriber(mv.info().table.id);
        }
        if let Some(consumer_id) = mv.agg_consumer_id() {
            self.unregister_remote_consumer(consumer_id);
        }
    }

    /// Disconnect and drop a view.
    pub fn remove_mv(&self, table_id: u64) -> anyhow::Result<()> {
        let Some(mv) = self
            .inner
            .mvs
            .write()
            .expect("mvs lock")
            .remove(&table_id)
        else {
            return Ok(());
        };
        self.disconnect_mv(&mv);
        Ok(())
    }

    fn feed_handle(&self, feed_table_id: u64) -> anyhow::Result<FeedHandle> {
        if let Some(source) = self.source(feed_table_id) {
            return Ok(FeedHandle::Source(source));
        }
        if let Some(mv) = self.mv(feed_table_id) {
            return Ok(FeedHandle::Mv(mv));
        }
        anyhow::bail!("feeding table {feed_table_id} is not registered")
    }

    /// Run `f` on the shard's scheduler and wait for it.
    pub fn run_on_shard(
        &self,
        shard_id: u64,
        f: Box<dyn FnOnce() -> anyhow::Result<()> + Send>,
    ) -> anyhow::Result<()> {
        let scheduler = self
            .inner
            .schedulers
            .read()
            .expect("schedulers lock")
            .get(&shard_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no scheduler for shard {shard_id}"))?;
        let (tx, rx) = mpsc::channel();
        scheduler
            .tx
            .send(Job::Run(Box::new(move || {
                let _ = tx.send(f());
            })))
            .map_err(|_| anyhow::anyhow!("scheduler for shard {shard_id} stopped"))?;
        rx.recv()
            .map_err(|_| anyhow::anyhow!("scheduler for shard {shard_id} dropped the job"))?
    }

    /// Wait until every scheduler has drained its queue and no receiver
    /// rows remain; the DDL layer uses this as a causal barrier.
    pub fn wait_for_schedulers(&self) -> anyhow::Result<()> {
        for _ in 0..DRAIN_MAX_ROUNDS {
            let shard_ids: Vec<u64> = self
                .inner
                .schedulers
                .read()
                .expect("schedulers lock")
                .keys()
                .copied()
                .collect();
            for shard_id in &shard_ids {
                self.run_on_shard(*shard_id, Box::new(|| Ok(())))?;
            }
            let mut busy = false;
            for shard_id in &shard_ids {
                let (lo, hi) = table_range(*shard_id, RECEIVER_TABLE_ID);
                if !self.inner.cluster.local_scan(&lo, &hi, 1)?.is_empty() {
                    busy = true;
                    self.inner.signal(*shard_id);
                }
            }
            if !busy {
                return Ok(());
            }
        }
        anyhow::bail!("push schedulers did not drain")
    }
}

impl PushEngineInner {
    fn signal(&self, shard_id: u64) {
        let scheduler = self
            .schedulers
            .read()
            .expect("schedulers lock")
            .get(&shard_id)
            .cloned();
        match scheduler {
            Some(scheduler) => {
                scheduler.pending.store(true, Ordering::SeqCst);
                let _ = scheduler.tx.send(Job::ProcessReceiver);
            }
            // Signals can arrive while the engine is still wiring up; the
            // startup trigger re-covers them.
            None => debug!(shard = shard_id, "remote write signal before start"),
        }
    }

    /// Drain the shard's receiver table: process whole batch-sequence
    /// groups, dispatching rows to their remote consumers, deleting the
    /// consumed rows in the same write batch.
    fn process_receiver(&self, shard_id: u64) -> anyhow::Result<()> {
        let (lo, hi) = table_range(shard_id, RECEIVER_TABLE_ID);
        let pairs = self.cluster.local_scan(&lo, &hi, usize::MAX)?;
        if pairs.is_empty() {
            return Ok(());
        }
        let consumers = self
            .remote_consumers
            .read()
            .expect("consumers lock")
            .clone();
        let groups = group_pairs_by_prefix(pairs, TABLE_PREFIX_LEN + 4);
        for group in groups {
            let mut offset = TABLE_PREFIX_LEN;
            let batch_seq = read_u32_be(&group[0].key, &mut offset)?;

            // Split the group per consumer, preserving receiver order.
            let mut order: Vec<u64> = Vec::new();
            let mut per_consumer: HashMap<u64, Vec<RowsEntry>> = HashMap::new();
            for pair in &group {
                let mut offset = TABLE_PREFIX_LEN + 12;
                let consumer_id = read_u64_be(&pair.key, &mut offset)?;
                let Some(handler) = consumers.get(&consumer_id) else {
                    // Consumers register before any forward can target
                    // them, so an unknown id means the target was dropped
                    // or rolled back; its rows are garbage.
                    warn!(consumer = consumer_id, "dropping rows for unknown remote consumer");
                    continue;
                };
                let types = handler.input_col_types();
                let (prev, curr) = decode_prev_and_current_row(&pair.value)?;
                let entry = RowsEntry::new(
                    prev.map(|b| Row::decode(&b, &types)).transpose()?,
                    curr.map(|b| Row::decode(&b, &types)).transpose()?,
                );
                if !per_consumer.contains_key(&consumer_id) {
                    order.push(consumer_id);
                }
                per_consumer.entry(consumer_id).or_default().push(entry);
            }

            let mut wb = WriteBatch::new(shard_id);
            let mut fwd = HashMap::new();
            {
                let mut ctx = ExecutionContext {
                    shard_id,
                    batch_seq,
                    enable_dedup: true,
                    write_batch: &mut wb,
                    forward_batches: &mut fwd,
                    cluster: self.cluster.as_ref(),
                };
                for consumer_id in order {
                    let handler = consumers
                        .get(&consumer_id)
                        .expect("consumer checked above");
                    let entries = per_consumer
                        .remove(&consumer_id)
                        .expect("entries gathered above");
                    handler.handle_remote_rows(RowsBatch::new(entries), &mut ctx)?;
                }
            }
            // Forwards go out before the local commit removes the group:
            // a crash in between replays the group, regenerating the same
            // dedup sequences, and the destinations drop the duplicates.
            for (dest_shard, batch) in fwd {
                self.cluster.forward(dest_shard, batch)?;
            }
            for pair in &group {
                wb.add_delete(pair.key.clone());
            }
            self.cluster.write_batch(wb)?;
        }
        Ok(())
    }
}

fn scheduler_loop(
    shard_id: u64,
    rx: mpsc::Receiver<Job>,
    pending: Arc<AtomicBool>,
    engine: Weak<PushEngineInner>,
) {
    while let Ok(job) = rx.recv() {
        match job {
            Job::ProcessReceiver => {
                if !pending.swap(false, Ordering::SeqCst) {
                    continue;
                }
                let Some(engine) = engine.upgrade() else {
                    return;
                };
                if let Err(err) = engine.process_receiver(shard_id) {
                    // Rows stay in the receiver table; the next signal (or
                    // startup trigger) retries the whole group.
                    error!(shard = shard_id, error = ?err, "receiver processing failed");
                }
            }
            Job::Run(f) => f(),
            Job::Stop => break,
        }
    }
    debug!(shard = shard_id, "push scheduler stopped");
}
