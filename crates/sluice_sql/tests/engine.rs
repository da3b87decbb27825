//! End-to-end engine tests over the in-process cluster runtime: topic
//! ingest through forwarding, receiver draining, two-tier aggregation and
//! view maintenance, plus remote pull-query pagination.

use std::collections::BTreeMap;
use std::sync::Arc;

use sluice_core::codec::{encode_key_cols, encode_table_prefix, table_range, TABLE_PREFIX_LEN};
use sluice_core::schema::{SourceInfo, TableInfo, TopicEncoding, TopicInfo, USER_TABLE_ID_BASE};
use sluice_core::types::{ColumnType, Datum, Row};
use sluice_core::{SluiceError, SluiceResult};

use sluice_shard::kv::MemoryKv;
use sluice_shard::local::LocalCluster;
use sluice_shard::sharder::Sharder;
use sluice_shard::{Cluster, WriteBatch};

use sluice_sql::parplan::Planner;
use sluice_sql::pull::exec::PullExecutor;
use sluice_sql::pull::PullEngine;
use sluice_sql::push::mv::MvRuntime;
use sluice_sql::push::source::{EmptyDescriptorRegistry, LoopbackProvider, Message};
use sluice_sql::push::PushEngine;
use sluice_sql::TableResolver;

const NUM_SHARDS: u64 = 4;
const ORDERS_ID: u64 = USER_TABLE_ID_BASE;
const MV_ID: u64 = USER_TABLE_ID_BASE + 100;

fn orders_table() -> TableInfo {
    TableInfo {
        id: ORDERS_ID,
        schema_name: "test".into(),
        name: "orders".into(),
        primary_key_cols: vec![0],
        column_names: vec!["id".into(), "customer".into(), "amount".into()],
        column_types: vec![ColumnType::BigInt, ColumnType::Varchar, ColumnType::BigInt],
    }
}

fn orders_source() -> SourceInfo {
    SourceInfo {
        table: orders_table(),
        topic: TopicInfo {
            broker_name: "main".into(),
            topic_name: "orders".into(),
            header_encoding: TopicEncoding::StringBytes,
            key_encoding: TopicEncoding::Int64Be,
            value_encoding: TopicEncoding::Json,
            col_selectors: vec![],
            properties: BTreeMap::new(),
        },
    }
}

struct Registry {
    tables: Vec<TableInfo>,
}

impl TableResolver for Registry {
    fn resolve_table(&self, _schema: &str, name: &str) -> SluiceResult<TableInfo> {
        self.tables
            .iter()
            .find(|t| t.name == name)
            .cloned()
            .ok_or_else(|| SluiceError::table_not_exists("test", name))
    }
}

struct Harness {
    cluster: Arc<LocalCluster>,
    push: PushEngine,
    provider: Arc<LoopbackProvider>,
}

impl Harness {
    fn new() -> Harness {
        let cluster = LocalCluster::new(0, vec![0], NUM_SHARDS, Arc::new(MemoryKv::new()), false);
        let push = PushEngine::new(cluster.clone(), Arc::new(EmptyDescriptorRegistry));
        cluster.register_shard_listener_factory(push.listener_factory());
        push.start().unwrap();
        cluster.start().unwrap();
        let provider = Arc::new(LoopbackProvider::new());
        push.register_message_provider("main", provider.clone());
        Harness {
            cluster,
            push,
            provider,
        }
    }

    fn start_orders_source(&self) {
        self.push.create_source(orders_source()).unwrap();
        self.push.start_source(ORDERS_ID).unwrap();
    }

    fn publish_order(&self, offset: u64, id: i64, customer: &str, amount: i64) {
        let value = format!(r#"{{"id": {id}, "customer": "{customer}", "amount": {amount}}}"#);
        self.provider
            .publish(
                "orders",
                &[Message {
                    partition: 0,
                    offset,
                    key: id.to_be_bytes().to_vec(),
                    value: value.into_bytes(),
                    headers: BTreeMap::new(),
                    timestamp: 0,
                }],
            )
            .unwrap();
    }

    fn scan_table_rows(&self, table: &TableInfo) -> Vec<Row> {
        let mut rows = Vec::new();
        for shard_id in self.cluster.shard_ids() {
            let (lo, hi) = table_range(shard_id, table.id);
            for pair in self.cluster.local_scan(&lo, &hi, usize::MAX).unwrap() {
                rows.push(Row::decode(&pair.value, &table.column_types).unwrap());
            }
        }
        rows
    }

    fn build_totals_mv(&self) -> Arc<MvRuntime> {
        let planner = Planner::new(Arc::new(Registry {
            tables: vec![orders_table()],
        }));
        let sql = "select customer, sum(amount) from orders group by customer";
        let planned = planner.plan_query("test", sql).unwrap();
        let mv_table = TableInfo {
            id: MV_ID,
            schema_name: "test".into(),
            name: "totals".into(),
            primary_key_cols: vec![0],
            column_names: planned.col_names.clone(),
            column_types: planned.col_types.clone(),
        };
        let mut next = MV_ID + 1;
        MvRuntime::build(
            mv_table,
            sql.to_string(),
            &planned,
            Sharder::new(self.cluster.shard_ids()),
            &mut || {
                let id = next;
                next += 1;
                Ok(id)
            },
        )
        .unwrap()
    }

    fn mv_totals(&self, mv: &MvRuntime) -> BTreeMap<String, i64> {
        let mut totals = BTreeMap::new();
        for row in self.scan_table_rows(&mv.info().table) {
            let customer = row.get(0).unwrap().as_str().unwrap().to_string();
            let total = row.get(1).unwrap().as_int().unwrap();
            totals.insert(customer, total);
        }
        totals
    }
}

#[test]
fn ingest_flows_into_source_table() {
    let h = Harness::new();
    h.start_orders_source();
    h.publish_order(1, 1, "bob", 3);
    h.publish_order(2, 2, "alice", 5);
    h.push.wait_for_schedulers().unwrap();

    let rows = h.scan_table_rows(&orders_table());
    assert_eq!(rows.len(), 2);
}

#[test]
fn redelivered_messages_are_deduplicated() {
    let h = Harness::new();
    h.start_orders_source();
    h.publish_order(1, 1, "bob", 3);
    h.push.wait_for_schedulers().unwrap();
    // Same partition and offset again: the dedup ledger drops it.
    h.publish_order(1, 1, "bob", 3);
    h.push.wait_for_schedulers().unwrap();

    assert_eq!(h.scan_table_rows(&orders_table()).len(), 1);
}

#[test]
fn aggregating_view_maintains_totals_across_shards() {
    let h = Harness::new();
    h.start_orders_source();
    let mv = h.build_totals_mv();
    h.push.connect_mv_aggregations(&mv);
    h.push.fill_mv(&mv).unwrap();
    h.push.register_mv(mv.clone());

    h.publish_order(1, 1, "bob", 3);
    h.publish_order(2, 2, "bob", 4);
    h.publish_order(3, 3, "alice", 5);
    h.push.wait_for_schedulers().unwrap();

    let totals = h.mv_totals(&mv);
    assert_eq!(totals.get("bob"), Some(&7));
    assert_eq!(totals.get("alice"), Some(&5));

    // Redelivery must not change any total.
    h.publish_order(2, 2, "bob", 4);
    h.push.wait_for_schedulers().unwrap();
    assert_eq!(h.mv_totals(&mv).get("bob"), Some(&7));
}

#[test]
fn view_fill_catches_existing_rows() {
    let h = Harness::new();
    h.start_orders_source();
    h.publish_order(1, 1, "bob", 10);
    h.publish_order(2, 2, "alice", 1);
    h.push.wait_for_schedulers().unwrap();

    // The view is created after rows already exist; fill replays them.
    let mv = h.build_totals_mv();
    h.push.connect_mv_aggregations(&mv);
    h.push.fill_mv(&mv).unwrap();
    h.push.register_mv(mv.clone());
    h.push.wait_for_schedulers().unwrap();

    let totals = h.mv_totals(&mv);
    assert_eq!(totals.get("bob"), Some(&10));
    assert_eq!(totals.get("alice"), Some(&1));

    // And new rows keep flowing after the fill.
    h.publish_order(3, 3, "bob", 5);
    h.push.wait_for_schedulers().unwrap();
    assert_eq!(h.mv_totals(&mv).get("bob"), Some(&15));
}

#[test]
fn view_creation_under_concurrent_ingest_is_exactly_once() {
    let h = Harness::new();
    h.start_orders_source();

    // Half the rows land before the fill, half race with it on another
    // thread; every row must be counted exactly once.
    for i in 0..5 {
        h.publish_order(i + 1, i as i64 + 1, "c", 1);
    }
    let provider = h.provider.clone();
    let publisher = std::thread::spawn(move || {
        for i in 5..10u64 {
            let id = i + 1;
            let value = format!(r#"{{"id": {id}, "customer": "c", "amount": 1}}"#);
            provider
                .publish(
                    "orders",
                    &[Message {
                        partition: 0,
                        offset: i + 1,
                        key: (id as i64).to_be_bytes().to_vec(),
                        value: value.into_bytes(),
                        headers: BTreeMap::new(),
                        timestamp: 0,
                    }],
                )
                .unwrap();
        }
    });

    let mv = h.build_totals_mv();
    h.push.connect_mv_aggregations(&mv);
    h.push.fill_mv(&mv).unwrap();
    h.push.register_mv(mv.clone());

    publisher.join().unwrap();
    h.push.wait_for_schedulers().unwrap();

    assert_eq!(h.scan_table_rows(&orders_table()).len(), 10);
    assert_eq!(h.mv_totals(&mv).get("c"), Some(&10));
}

#[test]
fn remote_pull_query_pages_and_evicts_context() {
    let cluster = LocalCluster::new(0, vec![0], NUM_SHARDS, Arc::new(MemoryKv::new()), false);
    cluster.start().unwrap();
    let table = orders_table();
    let resolver = Arc::new(Registry {
        tables: vec![table.clone()],
    });
    let pull = PullEngine::new(cluster.clone(), resolver);
    cluster.register_remote_query_handler(pull.clone());
    pull.start();
    pull.set_available();

    // Seed 2,500 rows, partitioned the way the ingest path would.
    let sharder = Sharder::new(cluster.shard_ids());
    let mut batches: std::collections::HashMap<u64, WriteBatch> = Default::default();
    for id in 0..2500i64 {
        let row = Row::new(vec![
            Some(Datum::Int(id)),
            Some(Datum::Varchar(format!("c{}", id % 7))),
            Some(Datum::Int(id % 100)),
        ]);
        let pk = encode_key_cols(&row, &[0], &table.column_types, Vec::new()).unwrap();
        let shard_id = sharder.calculate_shard(&pk);
        let mut key = encode_table_prefix(shard_id, table.id, TABLE_PREFIX_LEN + pk.len());
        key.extend_from_slice(&pk);
        batches
            .entry(shard_id)
            .or_insert_with(|| WriteBatch::new(shard_id))
            .add_put(key, row.encoded(&table.column_types).unwrap());
    }
    for (_, batch) in batches {
        cluster.write_batch(batch).unwrap();
    }

    let mut executor = pull
        .build_pull_query("test", "select * from orders", false)
        .unwrap();
    let page1 = executor.get_rows(1000).unwrap();
    let page2 = executor.get_rows(1000).unwrap();
    let page3 = executor.get_rows(1000).unwrap();
    assert_eq!(page1.row_count(), 1000);
    assert_eq!(page2.row_count(), 1000);
    assert_eq!(page3.row_count(), 500);
    // The final short page evicted the server-side execution context.
    assert_eq!(pull.num_cached_execs(), 0);
}

#[test]
fn node_left_and_stop_evict_execution_contexts() {
    let cluster = LocalCluster::new(0, vec![0], 1, Arc::new(MemoryKv::new()), false);
    cluster.start().unwrap();
    let table = orders_table();
    let resolver = Arc::new(Registry {
        tables: vec![table.clone()],
    });
    let pull = PullEngine::new(cluster.clone(), resolver);
    cluster.register_remote_query_handler(pull.clone());
    pull.start();
    pull.set_available();

    let mut batch = WriteBatch::new(0);
    for id in 0..10i64 {
        let row = Row::new(vec![
            Some(Datum::Int(id)),
            Some(Datum::Varchar("x".into())),
            Some(Datum::Int(id)),
        ]);
        let pk = encode_key_cols(&row, &[0], &table.column_types, Vec::new()).unwrap();
        let mut key = encode_table_prefix(0, table.id, TABLE_PREFIX_LEN + pk.len());
        key.extend_from_slice(&pk);
        batch.add_put(key, row.encoded(&table.column_types).unwrap());
    }
    cluster.write_batch(batch).unwrap();

    // A full first page leaves the cursor cached on the serving side.
    let mut executor = pull
        .build_pull_query("test", "select * from orders", false)
        .unwrap();
    assert_eq!(executor.get_rows(5).unwrap().row_count(), 5);
    assert_eq!(pull.num_cached_execs(), 1);

    // This node (node 0) originated the execution id; reporting it as
    // left evicts the abandoned cursor.
    pull.node_left(0);
    assert_eq!(pull.num_cached_execs(), 0);

    // Stopping the engine clears whatever remains.
    let mut executor = pull
        .build_pull_query("test", "select * from orders", false)
        .unwrap();
    assert_eq!(executor.get_rows(5).unwrap().row_count(), 5);
    assert_eq!(pull.num_cached_execs(), 1);
    pull.stop();
    assert_eq!(pull.num_cached_execs(), 0);
}

#[test]
fn pull_filter_runs_remotely() {
    let cluster = LocalCluster::new(0, vec![0], NUM_SHARDS, Arc::new(MemoryKv::new()), false);
    cluster.start().unwrap();
    let table = orders_table();
    let resolver = Arc::new(Registry {
        tables: vec![table.clone()],
    });
    let pull = PullEngine::new(cluster.clone(), resolver);
    cluster.register_remote_query_handler(pull.clone());
    pull.start();
    pull.set_available();

    let mut batch = WriteBatch::new(0);
    for id in 0..10i64 {
        let row = Row::new(vec![
            Some(Datum::Int(id)),
            Some(Datum::Varchar("x".into())),
            Some(Datum::Int(id * 10)),
        ]);
        let pk = encode_key_cols(&row, &[0], &table.column_types, Vec::new()).unwrap();
        let mut key = encode_table_prefix(0, table.id, TABLE_PREFIX_LEN + pk.len());
        key.extend_from_slice(&pk);
        batch.add_put(key, row.encoded(&table.column_types).unwrap());
    }
    cluster.write_batch(batch).unwrap();

    let rows = pull
        .execute_query("test", "select id from orders where amount >= 50")
        .unwrap();
    assert_eq!(rows.row_count(), 5);
    for row in rows.iter() {
        assert!(row.get(0).unwrap().as_int().unwrap() >= 5);
    }
}

#[test]
fn unavailable_until_signaled_except_system_queries() {
    let cluster = LocalCluster::new(0, vec![0], 1, Arc::new(MemoryKv::new()), false);
    cluster.start().unwrap();
    let resolver = Arc::new(Registry {
        tables: vec![orders_table()],
    });
    let pull = PullEngine::new(cluster.clone(), resolver);
    cluster.register_remote_query_handler(pull.clone());
    pull.start();

    let err = pull
        .execute_query("test", "select * from orders")
        .unwrap_err();
    assert_eq!(err, SluiceError::Unavailable);

    // System queries work before availability (schema loading needs them).
    let rows = pull
        .execute_system_query("test", "select * from orders")
        .unwrap();
    assert_eq!(rows.row_count(), 0);

    pull.set_available();
    assert!(pull.execute_query("test", "select * from orders").is_ok());
}
