//! In-memory provider and fixtures shared by the sync crate's tests.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use flightsync_core::{
    Credentials, ErrorCode, ProviderType, SyncSettings, TenantProviderConfig, ValidationStatus,
};
use flightsync_provider::{
    FieldMeta, ProviderError, ProviderRecord, ProviderTransport, QueryPage, QueryRequest,
    TableMeta, TransportFactory,
};
use flightsync_storage::SyncStore;
use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

use crate::mapping::parse_datetime;

pub const MODIFIED: &str = "Last Modified";

#[derive(Debug, Clone)]
pub struct FakeTable {
    pub meta: TableMeta,
    pub records: Vec<ProviderRecord>,
}

impl FakeTable {
    pub fn new(name: &str, fields: &[(&str, &str)]) -> Self {
        Self {
            meta: TableMeta {
                id: format!("tbl{name}"),
                name: name.to_string(),
                fields: fields
                    .iter()
                    .map(|(n, t)| FieldMeta {
                        name: n.to_string(),
                        field_type: t.to_string(),
                    })
                    .collect(),
            },
            records: Vec::new(),
        }
    }

    pub fn with_record(mut self, record: ProviderRecord) -> Self {
        self.records.push(record);
        self
    }
}

#[derive(Debug, Clone, Default)]
struct FakeBase {
    tables: Vec<FakeTable>,
    failure: Option<ProviderError>,
    delay: Option<Duration>,
    queries: usize,
}

/// Provider double keyed by base id; also acts as the transport factory.
#[derive(Debug, Clone, Default)]
pub struct FakeProvider {
    bases: Arc<Mutex<HashMap<String, FakeBase>>>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_tables(&self, base_id: &str, tables: Vec<FakeTable>) {
        let mut bases = self.bases.lock().unwrap();
        bases.entry(base_id.to_string()).or_default().tables = tables;
    }

    pub fn upsert_record(&self, base_id: &str, table: &str, record: ProviderRecord) {
        let mut bases = self.bases.lock().unwrap();
        let base = bases.entry(base_id.to_string()).or_default();
        let table = base
            .tables
            .iter_mut()
            .find(|t| t.meta.name == table)
            .expect("table exists");
        table.records.retain(|r| r.id != record.id);
        table.records.push(record);
    }

    pub fn fail_base(&self, base_id: &str, error: Option<ProviderError>) {
        let mut bases = self.bases.lock().unwrap();
        bases.entry(base_id.to_string()).or_default().failure = error;
    }

    /// Every call against `base_id` waits this long before answering.
    pub fn delay_base(&self, base_id: &str, delay: Duration) {
        let mut bases = self.bases.lock().unwrap();
        bases.entry(base_id.to_string()).or_default().delay = Some(delay);
    }

    pub fn queries(&self, base_id: &str) -> usize {
        self.bases
            .lock()
            .unwrap()
            .get(base_id)
            .map(|b| b.queries)
            .unwrap_or(0)
    }
}

impl TransportFactory for FakeProvider {
    fn transport(
        &self,
        credentials: &Credentials,
        _settings: &SyncSettings,
    ) -> Result<Arc<dyn ProviderTransport>, ProviderError> {
        Ok(Arc::new(FakeTransport {
            bases: self.bases.clone(),
            base_id: credentials.base_id.clone(),
        }))
    }
}

struct FakeTransport {
    bases: Arc<Mutex<HashMap<String, FakeBase>>>,
    base_id: String,
}

impl FakeTransport {
    async fn stall(&self) {
        let delay = self
            .bases
            .lock()
            .unwrap()
            .get(&self.base_id)
            .and_then(|b| b.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl ProviderTransport for FakeTransport {
    async fn list_tables(&self) -> Result<Vec<TableMeta>, ProviderError> {
        self.stall().await;
        let bases = self.bases.lock().unwrap();
        let base = bases.get(&self.base_id).ok_or_else(|| {
            ProviderError::new(ErrorCode::InvalidBaseId, "unknown base").with_status(404)
        })?;
        if let Some(err) = &base.failure {
            return Err(err.clone());
        }
        Ok(base.tables.iter().map(|t| t.meta.clone()).collect())
    }

    async fn query(&self, request: &QueryRequest) -> Result<QueryPage, ProviderError> {
        self.stall().await;
        let mut bases = self.bases.lock().unwrap();
        let base = bases.get_mut(&self.base_id).ok_or_else(|| {
            ProviderError::new(ErrorCode::InvalidBaseId, "unknown base").with_status(404)
        })?;
        base.queries += 1;
        if let Some(err) = &base.failure {
            return Err(err.clone());
        }
        let table = base
            .tables
            .iter()
            .find(|t| t.meta.matches(&request.table))
            .ok_or_else(|| {
                ProviderError::new(ErrorCode::TableNotFound, "no such table").with_status(404)
            })?;

        let mut matching: Vec<ProviderRecord> = table
            .records
            .iter()
            .filter(|r| match &request.modified_since {
                Some(filter) => r
                    .fields
                    .get(&filter.field)
                    .and_then(JsonValue::as_str)
                    .and_then(parse_datetime)
                    .is_some_and(|ts| ts >= filter.since),
                None => true,
            })
            .cloned()
            .collect();
        if let Some(max) = request.max_records {
            matching.truncate(max as usize);
        }

        let start: usize = request
            .offset
            .as_deref()
            .and_then(|o| o.parse().ok())
            .unwrap_or(0);
        let page_size = request.page_size.max(1) as usize;
        let end = (start + page_size).min(matching.len());
        let records = matching.get(start..end).map(<[_]>::to_vec).unwrap_or_default();
        let offset = (end < matching.len()).then(|| end.to_string());
        Ok(QueryPage { records, offset })
    }
}

pub fn at(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 1, hour, 0, 0).single().unwrap()
}

pub fn record(id: &str, fields: JsonValue, modified: DateTime<Utc>) -> ProviderRecord {
    let mut fields = fields.as_object().cloned().unwrap_or_default();
    fields.insert(MODIFIED.to_string(), JsonValue::String(modified.to_rfc3339()));
    ProviderRecord {
        id: id.to_string(),
        created_time: None,
        fields,
    }
}

pub fn pilots_table() -> FakeTable {
    FakeTable::new(
        "Pilots",
        &[
            ("Callsign", "singleLineText"),
            ("Name", "singleLineText"),
            (MODIFIED, "lastModifiedTime"),
        ],
    )
}

pub fn routes_table() -> FakeTable {
    FakeTable::new(
        "Routes",
        &[
            ("Origin", "singleLineText"),
            ("Destination", "singleLineText"),
            (MODIFIED, "lastModifiedTime"),
        ],
    )
}

pub fn reports_table() -> FakeTable {
    FakeTable::new(
        "PIREPs",
        &[
            ("Pilot", "singleLineText"),
            ("Route", "singleLineText"),
            (MODIFIED, "lastModifiedTime"),
        ],
    )
}

/// Current-version document mirroring the three fixture tables.
pub fn document(base_id: &str) -> JsonValue {
    json!({
        "schema_version": 2,
        "credentials": {"api_key": "patTEST", "base_id": base_id},
        "entities": [
            {
                "entity_type": "pilot",
                "table": "Pilots",
                "last_modified_field": MODIFIED,
                "fields": [
                    {"internal": "callsign", "provider": "Callsign", "required": true},
                    {"internal": "name", "provider": "Name"}
                ]
            },
            {
                "entity_type": "route",
                "table": "Routes",
                "last_modified_field": MODIFIED,
                "fields": [
                    {"internal": "origin", "provider": "Origin", "required": true},
                    {"internal": "destination", "provider": "Destination", "required": true}
                ]
            },
            {
                "entity_type": "flight_report",
                "table": "PIREPs",
                "last_modified_field": MODIFIED,
                "fields": [
                    {"internal": "pilot_callsign", "provider": "Pilot", "required": true},
                    {"internal": "route", "provider": "Route"}
                ]
            }
        ],
        "sync": {"batch_size": 2, "rate_limit_per_second": 50, "retry_attempts": 0},
        "linkage": {"callsign_prefix": "VAX"}
    })
}

/// All three fixture tables, each holding one well-formed record.
pub fn healthy_tables() -> Vec<FakeTable> {
    vec![
        pilots_table().with_record(record("p1", json!({"Callsign": "VAX001", "Name": "Ada"}), at(1))),
        routes_table().with_record(record(
            "r1",
            json!({"Origin": "KJFK", "Destination": "EGLL"}),
            at(1),
        )),
        reports_table().with_record(record(
            "f1",
            json!({"Pilot": "001", "Route": "KJFK-EGLL"}),
            at(1),
        )),
    ]
}

/// Insert an already validated and activated config for `tenant_id`.
pub async fn seed_active_config(
    store: &dyn SyncStore,
    tenant_id: Uuid,
    document: JsonValue,
) -> TenantProviderConfig {
    let mut config = TenantProviderConfig::new_version(
        tenant_id,
        ProviderType::Airtable,
        1,
        document,
        BTreeSet::new(),
    );
    config.validation_status = ValidationStatus::Valid;
    config.is_active = true;
    config.last_validated_at = Some(Utc::now());
    store.insert_config(&config).await.unwrap();
    config
}
