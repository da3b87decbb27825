//! Sources: tables continuously ingested from external message topics.
//!
//! The external topic system sits behind the `MessageProvider` seam; a
//! `SourceRuntime` decodes delivered messages into rows through the
//! source's topic encodings and column selectors, hash-partitions them by
//! primary key and forwards them to the owning shards with per-partition
//! monotone sequences, so redelivered messages dedup on arrival.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use prost_reflect::{DynamicMessage, MessageDescriptor};
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use tracing::debug;

use sluice_core::codec::encode_key_cols;
use sluice_core::schema::{ColumnSelector, SourceInfo, TopicEncoding};
use sluice_core::types::{ColumnType, Datum, Row};

use sluice_shard::forward::{encode_prev_and_current_row, make_originator, ForwardKey};
use sluice_shard::sharder::Sharder;
use sluice_shard::{Cluster, WriteBatch};

use crate::push::exec::{ExecutionContext, RowsBatch, TableWriter};
use crate::push::mv::MvRuntime;
use crate::push::RemoteRowsHandler;

/// One message as delivered by a topic consumer.
#[derive(Clone, Debug, Default)]
pub struct Message {
    pub partition: u64,
    /// Monotone per partition; doubles as the ingest dedup sequence.
    pub offset: u64,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub headers: BTreeMap<String, Vec<u8>>,
    /// Microseconds past the Unix epoch, UTC.
    pub timestamp: i64,
}

/// Receives delivered messages; implemented by the source runtime.
pub trait MessageSink: Send + Sync {
    fn deliver(&self, messages: &[Message]) -> anyhow::Result<()>;
}

/// The external topic contract: subscribing starts delivery to the sink.
pub trait MessageProvider: Send + Sync {
    fn subscribe(&self, topic_name: &str, sink: Arc<dyn MessageSink>) -> anyhow::Result<()>;
    fn unsubscribe(&self, topic_name: &str) -> anyhow::Result<()>;
}

/// In-process provider used by tests and single-node setups: published
/// messages are delivered synchronously to the subscribed sinks.
#[derive(Default)]
pub struct LoopbackProvider {
    topics: Mutex<HashMap<String, Vec<Arc<dyn MessageSink>>>>,
}

impl LoopbackProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, topic_name: &str, messages: &[Message]) -> anyhow::Result<()> {
        let sinks = {
            let topics = self.topics.lock().expect("topics lock poisoned");
            topics.get(topic_name).cloned().unwrap_or_default()
        };
        for sink in sinks {
            sink.deliver(messages)?;
        }
        Ok(())
    }
}

impl MessageProvider for LoopbackProvider {
    fn subscribe(&self, topic_name: &str, sink: Arc<dyn MessageSink>) -> anyhow::Result<()> {
        self.topics
            .lock()
            .expect("topics lock poisoned")
            .entry(topic_name.to_string())
            .or_default()
            .push(sink);
        Ok(())
    }

    fn unsubscribe(&self, topic_name: &str) -> anyhow::Result<()> {
        self.topics
            .lock()
            .expect("topics lock poisoned")
            .remove(topic_name);
        Ok(())
    }
}

/// Looks up registered protobuf message descriptors; implemented by the
/// server's proto registry.
pub trait DescriptorRegistry: Send + Sync {
    fn message_descriptor(&self, name: &str) -> Option<MessageDescriptor>;
}

/// Registry used where no protobuf sources exist (tests, JSON-only nodes).
pub struct EmptyDescriptorRegistry;

impl DescriptorRegistry for EmptyDescriptorRegistry {
    fn message_descriptor(&self, _name: &str) -> Option<MessageDescriptor> {
        None
    }
}

/// Decodes topic messages into rows. All encodings normalize to a JSON
/// value first, so column selectors traverse one representation.
pub struct MessageDecoder {
    info: SourceInfo,
    registry: Arc<dyn DescriptorRegistry>,
}

impl MessageDecoder {
    pub fn new(info: SourceInfo, registry: Arc<dyn DescriptorRegistry>) -> MessageDecoder {
        MessageDecoder { info, registry }
    }

    fn decode_payload(
        &self,
        encoding: &TopicEncoding,
        bytes: &[u8],
    ) -> anyhow::Result<JsonValue> {
        if bytes.is_empty() {
            return Ok(JsonValue::Null);
        }
        match encoding {
            TopicEncoding::Json => Ok(serde_json::from_slice(bytes)?),
            TopicEncoding::Protobuf(message_name) => {
                let descriptor = self
                    .registry
                    .message_descriptor(message_name)
                    .ok_or_else(|| {
                        anyhow::anyhow!("proto message {message_name} not registered")
                    })?;
                let message = DynamicMessage::decode(descriptor, bytes)?;
                Ok(serde_json::to_value(&message)?)
            }
            TopicEncoding::StringBytes => {
                Ok(JsonValue::String(String::from_utf8(bytes.to_vec())?))
            }
            TopicEncoding::Int64Be => {
                anyhow::ensure!(bytes.len() == 8, "int64be key must be 8 bytes");
                let mut buf = [0u8; 8];
                buf.copy_from_slice(bytes);
                Ok(JsonValue::from(i64::from_be_bytes(buf)))
            }
        }
    }

    fn select(
        &self,
        selector: &ColumnSelector,
        key: &JsonValue,
        value: &JsonValue,
        headers: &JsonValue,
        timestamp: i64,
    ) -> JsonValue {
        if let Some(meta) = &selector.meta_key {
            return match meta.as_str() {
                "key" => key.clone(),
                "header" => headers.clone(),
                "timestamp" => JsonValue::from(timestamp),
                _ => JsonValue::Null,
            };
        }
        let mut current = value;
        for part in &selector.path {
            match current.get(part) {
                Some(next) => current = next,
                None => return JsonValue::Null,
            }
        }
        current.clone()
    }

    /// Decode one message into a row of the source's schema.
    pub fn decode(&self, message: &Message) -> anyhow::Result<Row> {
        let table = &self.info.table;
        let topic = &self.info.topic;
        let key = self.decode_payload(&topic.key_encoding, &message.key)?;
        let value = self.decode_payload(&topic.value_encoding, &message.value)?;
        let headers = if message.headers.is_empty() {
            JsonValue::Null
        } else {
            let mut map = serde_json::Map::new();
            for (name, bytes) in &message.headers {
                let decoded = self.decode_payload(&topic.header_encoding, bytes)?;
                map.insert(name.clone(), decoded);
            }
            JsonValue::Object(map)
        };

        let mut values = Vec::with_capacity(table.num_columns());
        for (i, col_type) in table.column_types.iter().enumerate() {
            let selected = if topic.col_selectors.is_empty() {
                // Without selectors, columns map by name from the value.
                value.get(&table.column_names[i]).cloned().unwrap_or(JsonValue::Null)
            } else {
                self.select(&topic.col_selectors[i], &key, &value, &headers, message.timestamp)
            };
            values.push(json_to_datum(&selected, col_type)?);
        }
        Ok(Row::new(values))
    }
}

fn json_to_datum(value: &JsonValue, col_type: &ColumnType) -> anyhow::Result<Option<Datum>> {
    if value.is_null() {
        return Ok(None);
    }
    let datum = match col_type {
        ColumnType::TinyInt | ColumnType::Int | ColumnType::BigInt => match value {
            JsonValue::Number(n) => Datum::Int(
                n.as_i64()
                    .ok_or_else(|| anyhow::anyhow!("non-integer number {n} for int column"))?,
            ),
            JsonValue::Bool(b) => Datum::Int(*b as i64),
            JsonValue::String(s) => Datum::Int(s.parse()?),
            other => anyhow::bail!("cannot decode {other} as integer"),
        },
        ColumnType::Double => match value {
            JsonValue::Number(n) => Datum::Double(
                n.as_f64()
                    .ok_or_else(|| anyhow::anyhow!("bad double {n}"))?,
            ),
            JsonValue::String(s) => Datum::Double(s.parse()?),
            other => anyhow::bail!("cannot decode {other} as double"),
        },
        ColumnType::Varchar => match value {
            JsonValue::String(s) => Datum::Varchar(s.clone()),
            other => Datum::Varchar(other.to_string()),
        },
        ColumnType::Decimal { .. } => match value {
            JsonValue::String(s) => Datum::Decimal(s.parse::<Decimal>()?),
            JsonValue::Number(n) => Datum::Decimal(n.to_string().parse::<Decimal>()?),
            other => anyhow::bail!("cannot decode {other} as decimal"),
        },
        ColumnType::Timestamp => match value {
            // Integers are microseconds past the epoch.
            JsonValue::Number(n) => Datum::Timestamp(
                n.as_i64()
                    .ok_or_else(|| anyhow::anyhow!("bad timestamp {n}"))?,
            ),
            JsonValue::String(s) => {
                let parsed = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
                    .map_err(|e| anyhow::anyhow!("bad timestamp {s}: {e}"))?;
                Datum::Timestamp(parsed.and_utc().timestamp_micros())
            }
            other => anyhow::bail!("cannot decode {other} as timestamp"),
        },
    };
    Ok(Some(datum))
}

/// A running source: decodes, partitions and forwards incoming messages,
/// and applies forwarded rows on the owning shard.
pub struct SourceRuntime {
    info: SourceInfo,
    decoder: MessageDecoder,
    writer: TableWriter,
    cluster: Arc<dyn Cluster>,
    sharder: Sharder,
    /// Per-shard lists of materialized views fed by this source. Guarded
    /// per shard by running connection and feeding on the shard scheduler.
    subscribers: RwLock<HashMap<u64, Vec<Arc<MvRuntime>>>>,
    started: AtomicBool,
}

impl SourceRuntime {
    pub fn new(
        info: SourceInfo,
        registry: Arc<dyn DescriptorRegistry>,
        cluster: Arc<dyn Cluster>,
        sharder: Sharder,
    ) -> Arc<SourceRuntime> {
        Arc::new(SourceRuntime {
            decoder: MessageDecoder::new(info.clone(), registry),
            writer: TableWriter::new(info.table.clone()),
            info,
            cluster,
            sharder,
            subscribers: RwLock::new(HashMap::new()),
            started: AtomicBool::new(false),
        })
    }

    pub fn info(&self) -> &SourceInfo {
        &self.info
    }

    pub fn set_started(&self, started: bool) {
        self.started.store(started, Ordering::SeqCst);
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
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
            subs.retain(|mv| mv.info().table.id != mv_table_id);
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
}

impl MessageSink for SourceRuntime {
    /// Ingest a block of messages: decode, partition by primary key and
    /// forward to the owning shards.
    fn deliver(&self, messages: &[Message]) -> anyhow::Result<()> {
        if !self.is_started() {
            anyhow::bail!("source {} is not started", self.info.table.name);
        }
        let table = &self.info.table;
        let mut batches: HashMap<u64, WriteBatch> = HashMap::new();
        for message in messages {
            let row = self.decoder.decode(message)?;
            let pk = encode_key_cols(
                &row,
                &table.primary_key_cols,
                &table.column_types,
                Vec::new(),
            )?;
            let dest_shard = self.sharder.calculate_shard(&pk);
            let forward_key = ForwardKey {
                dedup_enabled: true,
                originator: make_originator(table.id, message.partition),
                seq: message.offset,
                remote_consumer_id: table.id.to_be_bytes().to_vec(),
            };
            let value =
                encode_prev_and_current_row(None, Some(&row.encoded(&table.column_types)?));
            batches
                .entry(dest_shard)
                .or_insert_with(|| WriteBatch::new(dest_shard))
                .add_put(forward_key.encode(), value);
        }
        debug!(
            source = %table.name,
            messages = messages.len(),
            shards = batches.len(),
            "ingested message block"
        );
        for (dest_shard, batch) in batches {
            self.cluster.forward(dest_shard, batch)?;
        }
        Ok(())
    }
}

impl RemoteRowsHandler for SourceRuntime {
    fn input_col_types(&self) -> Vec<ColumnType> {
        self.info.table.column_types.clone()
    }

    /// Apply forwarded source rows on the owning shard: write the source
    /// table rows, then feed the connected materialized views.
    fn handle_remote_rows(
        &self,
        batch: RowsBatch,
        ctx: &mut ExecutionContext,
    ) -> anyhow::Result<()> {
        let written = self.writer.process(batch, ctx)?;
        for mv in self.subscribers_for(ctx.shard_id) {
            mv.feed(written.clone(), ctx)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::schema::{TableInfo, TopicInfo};

    fn source_info(selectors: Vec<ColumnSelector>) -> SourceInfo {
        SourceInfo {
            table: TableInfo {
                id: 1000,
                schema_name: "test".into(),
                name: "orders".into(),
                primary_key_cols: vec![0],
                column_names: vec!["id".into(), "customer".into(), "amount".into()],
                column_types: vec![ColumnType::BigInt, ColumnType::Varchar, ColumnType::Double],
            },
            topic: TopicInfo {
                broker_name: "main".into(),
                topic_name: "orders".into(),
                header_encoding: TopicEncoding::StringBytes,
                key_encoding: TopicEncoding::Int64Be,
                value_encoding: TopicEncoding::Json,
                col_selectors: selectors,
                properties: Default::default(),
            },
        }
    }

    #[test]
    fn decodes_json_by_column_name() {
        let decoder = MessageDecoder::new(source_info(vec![]), Arc::new(EmptyDescriptorRegistry));
        let message = Message {
            value: br#"{"id": 7, "customer": "bob", "amount": 12.5}"#.to_vec(),
            ..Default::default()
        };
        let row = decoder.decode(&message).unwrap();
        assert_eq!(row.get(0), Some(&Datum::Int(7)));
        assert_eq!(row.get(1), Some(&Datum::Varchar("bob".into())));
        assert_eq!(row.get(2), Some(&Datum::Double(12.5)));
    }

    #[test]
    fn decodes_with_selectors_and_meta_key() {
        let selectors = vec![
            ColumnSelector::parse("meta(\"key\")").unwrap(),
            ColumnSelector::parse("customer.name").unwrap(),
            ColumnSelector::parse("total").unwrap(),
        ];
        let decoder =
            MessageDecoder::new(source_info(selectors), Arc::new(EmptyDescriptorRegistry));
        let message = Message {
            key: 42i64.to_be_bytes().to_vec(),
            value: br#"{"customer": {"name": "carol"}, "total": 3.25}"#.to_vec(),
            ..Default::default()
        };
        let row = decoder.decode(&message).unwrap();
        assert_eq!(row.get(0), Some(&Datum::Int(42)));
        assert_eq!(row.get(1), Some(&Datum::Varchar("carol".into())));
        assert_eq!(row.get(2), Some(&Datum::Double(3.25)));
    }

    #[test]
    fn missing_json_fields_become_null() {
        let decoder = MessageDecoder::new(source_info(vec![]), Arc::new(EmptyDescriptorRegistry));
        let message = Message {
            value: br#"{"id": 1}"#.to_vec(),
            ..Default::default()
        };
        let row = decoder.decode(&message).unwrap();
        assert!(row.get(1).is_none());
        assert!(row.get(2).is_none());
    }

    #[test]
    fn unregistered_proto_message_fails() {
        let mut info = source_info(vec![]);
        info.topic.value_encoding = TopicEncoding::Protobuf("com.example.Order".into());
        let decoder = MessageDecoder::new(info, Arc::new(EmptyDescriptorRegistry));
        let message = Message {
            value: vec![1, 2, 3],
            ..Default::default()
        };
        assert!(decoder.decode(&message).is_err());
    }

    #[test]
    fn loopback_provider_delivers_to_subscribers() {
        struct Collect(Mutex<Vec<u64>>);
        impl MessageSink for Collect {
            fn deliver(&self, messages: &[Message]) -> anyhow::Result<()> {
                let mut seen = self.0.lock().unwrap();
                seen.extend(messages.iter().map(|m| m.offset));
                Ok(())
            }
        }
        let provider = LoopbackProvider::new();
        let sink = Arc::new(Collect(Mutex::new(Vec::new())));
        provider.subscribe("orders", sink.clone()).unwrap();
        provider
            .publish(
                "orders",
                &[
                    Message {
                        offset: 1,
                        ..Default::default()
                    },
                    Message {
                        offset: 2,
                        ..Default::default()
                    },
                ],
            )
            .unwrap();
        assert_eq!(*sink.0.lock().unwrap(), vec![1, 2]);
    }
}
