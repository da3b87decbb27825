//! DDL coordinator integration tests: source and view lifecycle, failure
//! injection and restart recovery over a real on-disk keyspace.

mod common;

use common::{TestNode, CREATE_ORDERS_SOURCE, CREATE_TOTALS_MV};

use sluice_core::SluiceError;

#[test]
fn create_source_ingest_and_query() {
    let node = TestNode::start();
    node.execute(CREATE_ORDERS_SOURCE).unwrap();

    node.publish_order(1, 1, "bob", 3);
    node.publish_order(2, 2, "alice", 5);
    node.settle();

    let rows = node.execute("select * from orders").unwrap();
    assert_eq!(rows.row_count(), 2);

    let rows = node
        .execute("select customer from orders where amount > 4")
        .unwrap();
    assert_eq!(rows.row_count(), 1);
    assert_eq!(rows.get_row(0).get(0).unwrap().as_str().unwrap(), "alice");
}

#[test]
fn create_mv_maintains_totals() {
    let node = TestNode::start();
    node.execute(CREATE_ORDERS_SOURCE).unwrap();
    node.publish_order(1, 1, "bob", 3);
    node.settle();

    // The view fill picks up the pre-existing row.
    node.execute(CREATE_TOTALS_MV).unwrap();
    assert_eq!(node.totals().get("bob"), Some(&3));

    node.publish_order(2, 2, "bob", 4);
    node.publish_order(3, 3, "alice", 5);
    node.settle();
    let totals = node.totals();
    assert_eq!(totals.get("bob"), Some(&7));
    assert_eq!(totals.get("alice"), Some(&5));
}

#[test]
fn duplicate_creates_are_rejected() {
    let node = TestNode::start();
    node.execute(CREATE_ORDERS_SOURCE).unwrap();
    let err = node.execute(CREATE_ORDERS_SOURCE).unwrap_err();
    assert!(matches!(err, SluiceError::SourceAlreadyExists { .. }));

    node.execute(CREATE_TOTALS_MV).unwrap();
    let err = node.execute(CREATE_TOTALS_MV).unwrap_err();
    assert!(matches!(
        err,
        SluiceError::MaterializedViewAlreadyExists { .. }
    ));
}

#[test]
fn mv_on_missing_table_is_user_error() {
    let node = TestNode::start();
    let err = node.execute(CREATE_TOTALS_MV).unwrap_err();
    assert!(matches!(err, SluiceError::TableNotExists { .. }));
}

#[test]
fn source_validation_errors() {
    let node = TestNode::start();
    let err = node
        .execute(
            "create source s1 (id bigint, primary key (id)) with (\
             broker = 'main', topic = 't', header_encoding = 'stringbytes', \
             key_encoding = 'int64be', value_encoding = 'avro')",
        )
        .unwrap_err();
    assert!(matches!(err, SluiceError::UnknownTopicEncoding(_)));

    let err = node
        .execute(
            "create source s1 (id bigint, primary key (id)) with (\
             broker = 'main', topic = 't', header_encoding = 'stringbytes', \
             key_encoding = 'int64be', value_encoding = 'protobuf:not.Registered')",
        )
        .unwrap_err();
    assert!(matches!(err, SluiceError::UnknownTopicEncoding(_)));

    let err = node
        .execute(
            "create source s1 (id bigint, v varchar, primary key (id)) with (\
             broker = 'main', topic = 't', header_encoding = 'stringbytes', \
             key_encoding = 'int64be', value_encoding = 'json', \
             column_selectors = 'id')",
        )
        .unwrap_err();
    assert!(matches!(
        err,
        SluiceError::WrongNumberColumnSelectors {
            selectors: 1,
            columns: 2
        }
    ));

    let err = node
        .execute(
            "create source s1 (id bigint, primary key (id)) with (\
             topic = 't', header_encoding = 'stringbytes', \
             key_encoding = 'int64be', value_encoding = 'json')",
        )
        .unwrap_err();
    assert!(matches!(err, SluiceError::InvalidStatement(_)));
}

#[test]
fn drop_order_is_enforced_and_cleans_data() {
    let node = TestNode::start();
    node.execute(CREATE_ORDERS_SOURCE).unwrap();
    node.execute(CREATE_TOTALS_MV).unwrap();
    node.publish_order(1, 1, "bob", 3);
    node.settle();

    // The view still reads from the source.
    let err = node.execute("drop source orders").unwrap_err();
    assert!(matches!(err, SluiceError::InvalidStatement(_)));

    node.execute("drop materialized view totals").unwrap();
    let err = node.execute("select * from totals").unwrap_err();
    assert!(matches!(err, SluiceError::TableNotExists { .. }));

    node.execute("drop source orders").unwrap();
    let err = node.execute("select * from orders").unwrap_err();
    assert!(matches!(err, SluiceError::TableNotExists { .. }));

    // Recreating both starts from clean state.
    node.execute(CREATE_ORDERS_SOURCE).unwrap();
    node.execute(CREATE_TOTALS_MV).unwrap();
    assert_eq!(node.execute("select * from orders").unwrap().row_count(), 0);
    assert!(node.totals().is_empty());
}

#[test]
fn failed_mv_create_is_reclaimed_on_restart() {
    let node = TestNode::start();
    node.execute(CREATE_ORDERS_SOURCE).unwrap();
    node.publish_order(1, 1, "bob", 3);
    node.settle();

    // Fail after the fill but before the metadata row is persisted.
    node.server
        .ddl_executor()
        .context()
        .injector
        .activate("create_mv_1");
    let err = node.execute(CREATE_TOTALS_MV).unwrap_err();
    assert!(matches!(err, SluiceError::Internal(_)));
    node.server
        .ddl_executor()
        .context()
        .injector
        .deactivate("create_mv_1");

    // The half-created view is invisible and ingest still works.
    assert!(matches!(
        node.execute("select * from totals").unwrap_err(),
        SluiceError::TableNotExists { .. }
    ));
    node.publish_order(2, 2, "bob", 4);
    node.settle();

    // Restart cleanup reclaims the to_delete ranges; creating the view
    // again succeeds and sees every row exactly once.
    let node = node.restart();
    node.execute(CREATE_TOTALS_MV).unwrap();
    assert_eq!(node.totals().get("bob"), Some(&7));
}

#[test]
fn mv_create_failure_after_persist_survives_restart() {
    let node = TestNode::start();
    node.execute(CREATE_ORDERS_SOURCE).unwrap();
    node.publish_order(1, 1, "bob", 3);
    node.settle();

    // Fail after the metadata row is persisted and the view registered,
    // but before the to_delete markers are removed.
    node.server
        .ddl_executor()
        .context()
        .injector
        .activate("create_mv_2");
    let err = node.execute(CREATE_TOTALS_MV).unwrap_err();
    assert!(matches!(err, SluiceError::Internal(_)));

    // Past the point of no return: restart keeps the view (the stale
    // markers are discarded, not acted on) and it keeps maintaining.
    let node = node.restart();
    assert_eq!(node.totals().get("bob"), Some(&3));
    node.publish_order(2, 2, "bob", 4);
    node.settle();
    assert_eq!(node.totals().get("bob"), Some(&7));
}

#[test]
fn restart_restores_catalog_and_flow() {
    let node = TestNode::start();
    node.execute(CREATE_ORDERS_SOURCE).unwrap();
    node.execute(CREATE_TOTALS_MV).unwrap();
    node.publish_order(1, 1, "bob", 3);
    node.settle();
    assert_eq!(node.totals().get("bob"), Some(&3));

    let node = node.restart();
    // Catalog restored from sys.tables: both objects queryable.
    assert_eq!(node.execute("select * from orders").unwrap().row_count(), 1);
    assert_eq!(node.totals().get("bob"), Some(&3));

    // And the restored view keeps maintaining itself.
    node.publish_order(2, 2, "bob", 4);
    node.settle();
    assert_eq!(node.totals().get("bob"), Some(&7));
}

#[test]
fn replayed_offsets_after_restart_are_dropped() {
    let node = TestNode::start();
    node.execute(CREATE_ORDERS_SOURCE).unwrap();
    node.publish_order(1, 1, "bob", 3);
    node.settle();

    let node = node.restart();
    // The producer replays offset 1; the dedup ledger survived restart.
    node.publish_order(1, 1, "bob", 3);
    node.publish_order(2, 2, "bob", 4);
    node.settle();
    assert_eq!(node.execute("select * from orders").unwrap().row_count(), 2);
}
