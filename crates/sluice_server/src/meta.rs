//! The meta controller: the in-memory catalog, its persisted form in the
//! `sys.tables` system table, and `to_delete` tombstone handling.
//!
//! Registration order matters and is owned by the DDL layer: metadata is
//! persisted *before* an object becomes visible to clients, so a crash can
//! leave persisted-but-unregistered state (cleaned by `cleanup_to_delete`)
//! but never a visible object that vanishes on restart.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, RwLock};
use std::sync::Arc;

use tracing::{info, warn};

use sluice_core::codec::{
    encode_key_cols, encode_table_prefix, read_u64_le, table_range, TABLE_PREFIX_LEN,
};
use sluice_core::schema::{
    CatalogEntry, MaterializedViewInfo, SourceInfo, TableInfo, SEQUENCE_TABLE_ID, SYSTEM_SCHEMA,
    TABLES_TABLE_ID, TO_DELETE_TABLE_ID, USER_TABLE_ID_BASE,
};
use sluice_core::types::{ColumnType, Datum, Row};
use sluice_core::{SluiceError, SluiceResult};

use sluice_shard::{Cluster, WriteBatch};
use sluice_sql::TableResolver;

#[derive(Default)]
struct SchemaEntries {
    sources: HashMap<String, SourceInfo>,
    mvs: HashMap<String, MaterializedViewInfo>,
}

pub struct MetaController {
    cluster: Arc<dyn Cluster>,
    registry: RwLock<HashMap<String, SchemaEntries>>,
    /// Serializes table-id allocation within the process; cross-node
    /// serialization comes from the DDL schema lock.
    seq_lock: Mutex<()>,
}

/// Schema of the `sys.tables` catalog table.
pub fn sys_tables_table() -> TableInfo {
    TableInfo {
        id: TABLES_TABLE_ID,
        schema_name: SYSTEM_SCHEMA.into(),
        name: "tables".into(),
        primary_key_cols: vec![0],
        column_names: vec![
            "id".into(),
            "kind".into(),
            "schema_name".into(),
            "name".into(),
            "metadata".into(),
        ],
        column_types: vec![
            ColumnType::BigInt,
            ColumnType::Varchar,
            ColumnType::Varchar,
            ColumnType::Varchar,
            ColumnType::Varchar,
        ],
    }
}

impl MetaController {
    pub fn new(cluster: Arc<dyn Cluster>) -> Arc<MetaController> {
        Arc::new(MetaController {
            cluster,
            registry: RwLock::new(HashMap::new()),
            seq_lock: Mutex::new(()),
        })
    }

    // In-memory registry.

    pub fn register_source(&self, info: SourceInfo) {
        self.registry
            .write()
            .expect("registry lock")
            .entry(info.table.schema_name.clone())
            .or_default()
            .sources
            .insert(info.table.name.clone(), info);
    }

    pub fn register_mv(&self, info: MaterializedViewInfo) {
        self.registry
            .write()
            .expect("registry lock")
            .entry(info.table.schema_name.clone())
            .or_default()
            .mvs
            .insert(info.table.name.clone(), info);
    }

    pub fn unregister_source(&self, schema_name: &str, name: &str) {
        if let Some(entries) = self.registry.write().expect("registry lock").get_mut(schema_name) {
            entries.sources.remove(name);
        }
    }

    pub fn unregister_mv(&self, schema_name: &str, name: &str) {
        if let Some(entries) = self.registry.write().expect("registry lock").get_mut(schema_name) {
            entries.mvs.remove(name);
        }
    }

    pub fn get_source(&self, schema_name: &str, name: &str) -> Option<SourceInfo> {
        self.registry
            .read()
            .expect("registry lock")
            .get(schema_name)
            .and_then(|e| e.sources.get(name).cloned())
    }

    pub fn get_mv(&self, schema_name: &str, name: &str) -> Option<MaterializedViewInfo> {
        self.registry
            .read()
            .expect("registry lock")
            .get(schema_name)
            .and_then(|e| e.mvs.get(name).cloned())
    }

    /// All registered views, across schemas.
    pub fn all_mvs(&self) -> Vec<MaterializedViewInfo> {
        self.registry
            .read()
            .expect("registry lock")
            .values()
            .flat_map(|e| e.mvs.values().cloned())
            .collect()
    }

    // Table id allocation.

    /// Allocate the next table id from the persisted sequence row.
    pub fn next_table_id(&self) -> anyhow::Result<u64> {
        let _guard = self.seq_lock.lock().expect("seq lock poisoned");
        let key = encode_table_prefix(0, SEQUENCE_TABLE_ID, TABLE_PREFIX_LEN);
        let next = match self.cluster.local_get(&key)? {
            Some(value) => {
                let mut offset = 0;
                read_u64_le(&value, &mut offset)?
            }
            None => USER_TABLE_ID_BASE,
        };
        let mut batch = WriteBatch::new(0);
        batch.add_put(key, (next + 1).to_le_bytes().to_vec());
        self.cluster.write_batch(batch)?;
        Ok(next)
    }

    // Persistence in sys.tables.

    fn catalog_row_key(&self, table_id: u64) -> anyhow::Result<Vec<u8>> {
        let row = Row::new(vec![Some(Datum::Int(table_id as i64))]);
        let key = encode_table_prefix(0, TABLES_TABLE_ID, TABLE_PREFIX_LEN + 9);
        encode_key_cols(&row, &[0], &[ColumnType::BigInt], key)
    }

    /// Persist a catalog entry; done before the object is registered so it
    /// cannot be seen and then lost.
    pub fn persist(&self, entry: &CatalogEntry) -> anyhow::Result<()> {
        let table = entry.table();
        let sys = sys_tables_table();
        let metadata = serde_json::to_string(entry)?;
        let row = Row::new(vec![
            Some(Datum::Int(table.id as i64)),
            Some(Datum::Varchar(entry.kind().as_str().to_string())),
            Some(Datum::Varchar(table.schema_name.clone())),
            Some(Datum::Varchar(table.name.clone())),
            Some(Datum::Varchar(metadata)),
        ]);
        let mut batch = WriteBatch::new(0);
        batch.add_put(self.catalog_row_key(table.id)?, row.encoded(&sys.column_types)?);
        self.cluster.write_batch(batch)
    }

    pub fn delete_persisted(&self, table_id: u64) -> anyhow::Result<()> {
        let mut batch = WriteBatch::new(0);
        batch.add_delete(self.catalog_row_key(table_id)?);
        self.cluster.write_batch(batch)
    }

    /// Read every persisted catalog entry.
    pub fn load_persisted(&self) -> anyhow::Result<Vec<CatalogEntry>> {
        let (lo, hi) = table_range(0, TABLES_TABLE_ID);
        let sys = sys_tables_table();
        let mut entries = Vec::new();
        for pair in self.cluster.local_scan(&lo, &hi, usize::MAX)? {
            let row = Row::decode(&pair.value, &sys.column_types)?;
            let metadata = row
                .get(4)
                .ok_or_else(|| anyhow::anyhow!("catalog row without metadata"))?
                .as_str()?;
            entries.push(serde_json::from_str(metadata)?);
        }
        Ok(entries)
    }

    // `to_delete` tombstones.

    fn to_delete_key(&self, shard_id: u64, table_id: u64) -> Vec<u8> {
        let mut key = encode_table_prefix(shard_id, TO_DELETE_TABLE_ID, TABLE_PREFIX_LEN + 8);
        key.extend_from_slice(&table_id.to_be_bytes());
        key
    }

    /// Mark table ids for deletion on every shard; if the creating DDL
    /// fails, restart cleanup reclaims their key ranges.
    pub fn store_to_delete_batch(&self, table_ids: &[u64]) -> anyhow::Result<()> {
        for shard_id in self.cluster.shard_ids() {
            let mut batch = WriteBatch::new(shard_id);
            for table_id in table_ids {
                batch.add_put(self.to_delete_key(shard_id, *table_id), Vec::new());
            }
            self.cluster.write_batch(batch)?;
        }
        Ok(())
    }

    pub fn remove_to_delete_batch(&self, table_ids: &[u64]) -> anyhow::Result<()> {
        for shard_id in self.cluster.shard_ids() {
            let mut batch = WriteBatch::new(shard_id);
            for table_id in table_ids {
                batch.add_delete(self.to_delete_key(shard_id, *table_id));
            }
            self.cluster.write_batch(batch)?;
        }
        Ok(())
    }

    /// Startup cleanup: any `to_delete` marker whose table never made it
    /// into the persisted catalog is leftover garbage from a failed DDL;
    /// reclaim its range. Markers for tables that did get persisted are
    /// stale (the DDL crashed after the point of no return) and are simply
    /// removed.
    pub fn cleanup_to_delete(&self) -> anyhow::Result<()> {
        let persisted: BTreeSet<u64> = {
            let mut ids = BTreeSet::new();
            for entry in self.load_persisted()? {
                ids.insert(entry.table().id);
                if let CatalogEntry::MaterializedView(mv) = &entry {
                    ids.extend(mv.internal_table_ids.iter().copied());
                }
            }
            ids
        };
        let mut marked = BTreeSet::new();
        for shard_id in self.cluster.shard_ids() {
            let (lo, hi) = table_range(shard_id, TO_DELETE_TABLE_ID);
            for pair in self.cluster.local_scan(&lo, &hi, usize::MAX)? {
                let tail = &pair.key[TABLE_PREFIX_LEN..];
                anyhow::ensure!(tail.len() == 8, "malformed to_delete key");
                let mut id = [0u8; 8];
                id.copy_from_slice(tail);
                marked.insert(u64::from_be_bytes(id));
            }
        }
        for table_id in marked {
            if persisted.contains(&table_id) {
                info!(table_id, "removing stale to_delete marker");
            } else {
                warn!(table_id, "reclaiming range of failed ddl");
                self.cluster.delete_all_data_for_table(table_id)?;
            }
            self.remove_to_delete_batch(&[table_id])?;
        }
        Ok(())
    }
}

impl TableResolver for MetaController {
    fn resolve_table(&self, schema_name: &str, table_name: &str) -> SluiceResult<TableInfo> {
        if schema_name == SYSTEM_SCHEMA {
            if table_name == "tables" {
                return Ok(sys_tables_table());
            }
            return Err(SluiceError::table_not_exists(schema_name, table_name));
        }
        let registry = self.registry.read().expect("registry lock");
        let Some(entries) = registry.get(schema_name) else {
            return Err(SluiceError::table_not_exists(schema_name, table_name));
        };
        if let Some(source) = entries.sources.get(table_name) {
            return Ok(source.table.clone());
        }
        if let Some(mv) = entries.mvs.get(table_name) {
            return Ok(mv.table.clone());
        }
        Err(SluiceError::table_not_exists(schema_name, table_name))
    }
}
