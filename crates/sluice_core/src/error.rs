//! User-visible error kinds.
//!
//! These are the errors that may cross the API surface verbatim. Everything
//! else travels as `anyhow::Error` internally and is redacted to
//! [`SluiceError::Internal`] with a server-side sequence number before it
//! reaches a client, so implementation details never leak.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type SluiceResult<T> = Result<T, SluiceError>;

/// Serde derives let peer nodes embed an error verbatim in a lookup reply
/// instead of failing the replication-layer call.
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum SluiceError {
    #[error("invalid statement: {0}")]
    InvalidStatement(String),

    #[error("table {schema_name}.{name} does not exist")]
    TableNotExists { schema_name: String, name: String },

    #[error("source {schema_name}.{name} already exists")]
    SourceAlreadyExists { schema_name: String, name: String },

    #[error("materialized view {schema_name}.{name} already exists")]
    MaterializedViewAlreadyExists { schema_name: String, name: String },

    #[error("unknown topic encoding {0}")]
    UnknownTopicEncoding(String),

    #[error("invalid column selector {0}")]
    InvalidSelector(String),

    #[error("number of column selectors ({selectors}) must match number of columns ({columns})")]
    WrongNumberColumnSelectors { selectors: usize, columns: usize },

    #[error("engine is not available")]
    Unavailable,

    /// Redacted internal error. The sequence number keys the full error in
    /// the server log.
    #[error("internal error - reference: {0}")]
    Internal(u64),
}

impl SluiceError {
    pub fn invalid_statement(msg: impl Into<String>) -> Self {
        SluiceError::InvalidStatement(msg.into())
    }

    pub fn table_not_exists(schema_name: impl Into<String>, name: impl Into<String>) -> Self {
        SluiceError::TableNotExists {
            schema_name: schema_name.into(),
            name: name.into(),
        }
    }
}
