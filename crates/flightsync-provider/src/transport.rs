use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flightsync_core::{Credentials, SyncSettings};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::error::ProviderError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMeta {
    pub name: String,
    /// Provider-native type name, e.g. `singleLineText` or `dateTime`.
    pub field_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMeta {
    pub id: String,
    pub name: String,
    pub fields: Vec<FieldMeta>,
}

impl TableMeta {
    pub fn field(&self, name: &str) -> Option<&FieldMeta> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Tables can be referenced by display name or by provider id.
    pub fn matches(&self, table: &str) -> bool {
        self.name == table || self.id == table
    }
}

/// Incremental filter: only rows whose `field` is at or after `since`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifiedSince {
    pub field: String,
    pub since: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRequest {
    pub table: String,
    pub fields: Vec<String>,
    pub modified_since: Option<ModifiedSince>,
    pub page_size: u32,
    pub max_records: Option<u32>,
    pub offset: Option<String>,
}

impl QueryRequest {
    pub fn new(table: impl Into<String>, page_size: u32) -> Self {
        Self {
            table: table.into(),
            fields: Vec::new(),
            modified_since: None,
            page_size,
            max_records: None,
            offset: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryPage {
    pub records: Vec<ProviderRecord>,
    /// Continuation token; `None` on the last page.
    pub offset: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRecord {
    pub id: String,
    pub created_time: Option<DateTime<Utc>>,
    pub fields: JsonMap<String, JsonValue>,
}

/// Read API of the external tabular provider.
#[async_trait]
pub trait ProviderTransport: Send + Sync {
    async fn list_tables(&self) -> Result<Vec<TableMeta>, ProviderError>;

    async fn query(&self, request: &QueryRequest) -> Result<QueryPage, ProviderError>;
}

/// Builds one transport per tenant from that tenant's credentials.
pub trait TransportFactory: Send + Sync {
    fn transport(
        &self,
        credentials: &Credentials,
        settings: &SyncSettings,
    ) -> Result<Arc<dyn ProviderTransport>, ProviderError>;
}
