//! Shared helpers for server integration tests.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use tempfile::TempDir;

use sluice_core::types::Rows;
use sluice_core::SluiceResult;
use sluice_server::config::NodeConfig;
use sluice_server::Server;
use sluice_sql::push::source::{LoopbackProvider, Message};

pub const CREATE_ORDERS_SOURCE: &str = "create source orders (\
     id bigint, customer varchar, amount bigint, primary key (id)) with (\
     broker = 'main', topic = 'orders', header_encoding = 'stringbytes', \
     key_encoding = 'int64be', value_encoding = 'json')";

pub const CREATE_TOTALS_MV: &str = "create materialized view totals as \
     select customer, sum(amount) as total from orders group by customer";

/// One running node over a temp data dir, with an in-process broker.
pub struct TestNode {
    pub server: Server,
    pub provider: Arc<LoopbackProvider>,
    /// Keeps the data dir alive for the node's lifetime.
    _dir: TempDir,
}

impl TestNode {
    pub fn start() -> TestNode {
        let dir = TempDir::new().expect("create temp dir");
        TestNode::start_in(dir)
    }

    fn start_in(dir: TempDir) -> TestNode {
        let config = NodeConfig::single_node(PathBuf::from(dir.path()));
        let server = Server::new(config).expect("build server");
        let provider = Arc::new(LoopbackProvider::new());
        server.register_message_provider("main", provider.clone());
        server.start().expect("start server");
        TestNode {
            server,
            provider,
            _dir: dir,
        }
    }

    /// Stop the node and start a fresh one over the same data dir.
    pub fn restart(self) -> TestNode {
        self.server.stop().expect("stop server");
        let TestNode { server, _dir, .. } = self;
        drop(server);
        TestNode::start_in(_dir)
    }

    pub fn execute(&self, sql: &str) -> SluiceResult<Rows> {
        self.server.execute_statement("test", sql)
    }

    pub fn publish_order(&self, offset: u64, id: i64, customer: &str, amount: i64) {
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
            .expect("publish order");
    }

    /// Barrier: all push work settled.
    pub fn settle(&self) {
        self.server
            .push_engine()
            .wait_for_schedulers()
            .expect("schedulers drain");
    }

    /// Totals from the `totals` view, keyed by customer.
    pub fn totals(&self) -> BTreeMap<String, i64> {
        let rows = self
            .execute("select customer, total from totals")
            .expect("query totals");
        rows.iter()
            .map(|row| {
                (
                    row.get(0).unwrap().as_str().unwrap().to_string(),
                    row.get(1).unwrap().as_int().unwrap(),
                )
            })
            .collect()
    }
}
