//! Registry of protobuf descriptors used to decode topic messages.
//!
//! Clients upload a serialized `FileDescriptorSet`; registration is
//! atomic: the set is merged into a candidate pool and the live pool is
//! only replaced if the whole set is valid.

use std::sync::{Arc, RwLock};

use prost::Message;
use prost_reflect::{DescriptorPool, MessageDescriptor};

use sluice_core::{SluiceError, SluiceResult};
use sluice_sql::push::source::DescriptorRegistry;

#[derive(Default)]
pub struct ProtoRegistry {
    pool: RwLock<DescriptorPool>,
}

impl ProtoRegistry {
    pub fn new() -> Arc<ProtoRegistry> {
        Arc::new(ProtoRegistry::default())
    }

    /// Register all files in a serialized `FileDescriptorSet`.
    pub fn register_file_descriptor_set(&self, bytes: &[u8]) -> SluiceResult<()> {
        let set = prost_types::FileDescriptorSet::decode(bytes).map_err(|e| {
            SluiceError::invalid_statement(format!("bad file descriptor set: {e}"))
        })?;
        let mut candidate = self.pool.read().expect("pool lock poisoned").clone();
        candidate.add_file_descriptor_set(set).map_err(|e| {
            SluiceError::invalid_statement(format!("invalid file descriptor set: {e}"))
        })?;
        *self.pool.write().expect("pool lock poisoned") = candidate;
        Ok(())
    }
}

impl DescriptorRegistry for ProtoRegistry {
    fn message_descriptor(&self, name: &str) -> Option<MessageDescriptor> {
        self.pool
            .read()
            .expect("pool lock poisoned")
            .get_message_by_name(name)
    }
}
