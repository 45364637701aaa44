//! Versioned tenant configuration documents.
//!
//! Documents are stored as JSON, but are only ever read through
//! [`parse_config_document`], which dispatches on `schema_version` and upgrades
//! older layouts to the current [`ProviderConfigDocument`].

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::error::{ErrorCode, SyncError, ValidationPhase};
use crate::EntityType;

pub const CURRENT_SCHEMA_VERSION: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FieldDataType {
    #[default]
    Text,
    Number,
    Integer,
    Boolean,
    Date,
    #[serde(rename = "datetime", alias = "date_time")]
    DateTime,
    Email,
    Url,
    Select,
    MultiSelect,
    LinkedRecord,
    Attachment,
}

impl FieldDataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Date => "date",
            Self::DateTime => "datetime",
            Self::Email => "email",
            Self::Url => "url",
            Self::Select => "select",
            Self::MultiSelect => "multi_select",
            Self::LinkedRecord => "linked_record",
            Self::Attachment => "attachment",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    #[serde(alias = "internal_name")]
    pub internal: String,
    #[serde(alias = "provider_field")]
    pub provider: String,
    #[serde(default)]
    pub data_type: FieldDataType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<JsonValue>,
    #[serde(default = "default_true")]
    pub user_visible: bool,
    /// Marks the single field the bot may write enrichment data into.
    #[serde(default)]
    pub bot_metadata: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySchema {
    pub entity_type: EntityType,
    #[serde(alias = "table_id")]
    pub table: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub fields: Vec<FieldMapping>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified_field: Option<String>,
}

impl EntitySchema {
    /// Provider field names to request: every mapped field plus the cursor field.
    pub fn provider_fields(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::with_capacity(self.fields.len() + 1);
        for mapping in &self.fields {
            if !out.contains(&mapping.provider) {
                out.push(mapping.provider.clone());
            }
        }
        if let Some(field) = &self.last_modified_field {
            if !out.contains(field) {
                out.push(field.clone());
            }
        }
        out
    }

    pub fn mapping(&self, internal: &str) -> Option<&FieldMapping> {
        self.fields.iter().find(|m| m.internal == internal)
    }

    pub fn bot_metadata_field(&self) -> Option<&FieldMapping> {
        self.fields.iter().find(|m| m.bot_metadata)
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub api_key: String,
    pub base_id: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"<redacted>")
            .field("base_id", &self.base_id)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSettings {
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_second: u32,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            rate_limit_per_second: default_rate_limit(),
            retry_attempts: default_retry_attempts(),
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

impl SyncSettings {
    pub const MAX_BATCH_SIZE: u32 = 100;
    pub const MAX_RETRY_ATTEMPTS: u32 = 10;
    pub const MAX_TIMEOUT_SECONDS: u64 = 300;

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    fn range_problems(&self) -> Vec<SyncError> {
        let mut problems = Vec::new();
        let mut out_of_range = |setting: &str, value: u64, min: u64, max: u64| {
            if value < min || value > max {
                problems.push(
                    SyncError::new(
                        ErrorCode::ValueOutOfRange,
                        format!("sync.{setting} must be between {min} and {max}, got {value}"),
                    )
                    .in_phase(ValidationPhase::SchemaParse)
                    .with_detail("setting", setting)
                    .with_detail("value", value),
                );
            }
        };
        out_of_range("batch_size", self.batch_size.into(), 1, Self::MAX_BATCH_SIZE.into());
        out_of_range(
            "rate_limit_per_second",
            self.rate_limit_per_second.into(),
            1,
            u32::MAX.into(),
        );
        out_of_range(
            "retry_attempts",
            self.retry_attempts.into(),
            0,
            Self::MAX_RETRY_ATTEMPTS.into(),
        );
        out_of_range("timeout_seconds", self.timeout_seconds, 1, Self::MAX_TIMEOUT_SECONDS);
        problems
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LinkageSettings {
    /// Prefix prepended to report callsigns when matching synced pilots (e.g. "VAX").
    #[serde(default)]
    pub callsign_prefix: String,
}

/// Current (v2) configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfigDocument {
    pub schema_version: u32,
    pub credentials: Credentials,
    #[serde(default)]
    pub entities: Vec<EntitySchema>,
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub linkage: LinkageSettings,
}

impl ProviderConfigDocument {
    pub fn enabled_schemas(&self) -> impl Iterator<Item = &EntitySchema> {
        self.entities.iter().filter(|s| s.enabled)
    }

    /// The enabled schema for a built-in entity type.
    pub fn schema_for(&self, entity_type: EntityType) -> Option<&EntitySchema> {
        self.enabled_schemas().find(|s| s.entity_type == entity_type)
    }

    pub fn to_json(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }

    fn structural_problems(&self) -> Vec<SyncError> {
        let malformed = |message: String| {
            SyncError::new(ErrorCode::ConfigMalformed, message)
                .in_phase(ValidationPhase::SchemaParse)
        };
        let mut problems = Vec::new();

        if self.credentials.api_key.trim().is_empty() {
            problems.push(malformed("credentials.api_key is empty".into()));
        }
        if self.credentials.base_id.trim().is_empty() {
            problems.push(malformed("credentials.base_id is empty".into()));
        }

        let mut seen_entities = BTreeSet::new();
        for schema in &self.entities {
            let scoped = |err: SyncError| err.for_entity(schema.entity_type).for_table(&schema.table);
            if schema.table.trim().is_empty() {
                problems.push(scoped(malformed(format!(
                    "{} schema has no table name",
                    schema.entity_type
                ))));
            }
            if schema.enabled
                && schema.entity_type.is_mirrored()
                && !seen_entities.insert(schema.entity_type)
            {
                problems.push(scoped(malformed(format!(
                    "more than one enabled {} schema",
                    schema.entity_type
                ))));
            }
            if schema.fields.is_empty() {
                problems.push(scoped(malformed(format!(
                    "{} schema maps no fields",
                    schema.entity_type
                ))));
            }

            let mut internal_names = BTreeSet::new();
            for mapping in &schema.fields {
                if !internal_names.insert(mapping.internal.as_str()) {
                    problems.push(scoped(
                        malformed(format!("internal field {} is mapped twice", mapping.internal))
                            .for_field(&mapping.provider),
                    ));
                }
            }

            let bot_fields: Vec<&str> = schema
                .fields
                .iter()
                .filter(|m| m.bot_metadata)
                .map(|m| m.internal.as_str())
                .collect();
            if bot_fields.len() > 1 {
                problems.push(scoped(
                    malformed(format!(
                        "{} schema marks {} bot metadata fields; at most one is allowed",
                        schema.entity_type,
                        bot_fields.len()
                    ))
                    .with_detail("fields", bot_fields.clone()),
                ));
            }
        }

        problems.extend(self.sync.range_problems());
        problems
    }
}

/// Legacy (v1) flat configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigDocumentV1 {
    pub api_key: String,
    pub base_id: String,
    #[serde(default)]
    pub tables: BTreeMap<EntityType, LegacyTable>,
    #[serde(default)]
    pub batch_size: Option<u32>,
    #[serde(default)]
    pub rate_limit_per_second: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyTable {
    pub table: String,
    /// internal name -> provider field name
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub last_modified_field: Option<String>,
}

pub fn upgrade_v1(doc: ConfigDocumentV1) -> ProviderConfigDocument {
    let entities = doc
        .tables
        .into_iter()
        .map(|(entity_type, table)| EntitySchema {
            entity_type,
            table: table.table,
            enabled: true,
            fields: table
                .fields
                .into_iter()
                .map(|(internal, provider)| FieldMapping {
                    required: table.required.contains(&internal),
                    internal,
                    provider,
                    data_type: FieldDataType::Text,
                    default_value: None,
                    user_visible: true,
                    bot_metadata: false,
                })
                .collect(),
            last_modified_field: table.last_modified_field,
        })
        .collect();

    let defaults = SyncSettings::default();
    ProviderConfigDocument {
        schema_version: CURRENT_SCHEMA_VERSION,
        credentials: Credentials {
            api_key: doc.api_key,
            base_id: doc.base_id,
        },
        entities,
        sync: SyncSettings {
            batch_size: doc.batch_size.unwrap_or(defaults.batch_size),
            rate_limit_per_second: doc
                .rate_limit_per_second
                .unwrap_or(defaults.rate_limit_per_second),
            ..defaults
        },
        linkage: LinkageSettings::default(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum VersionedConfigDocument {
    V1(ConfigDocumentV1),
    V2(ProviderConfigDocument),
}

impl VersionedConfigDocument {
    pub fn from_json(raw: &JsonValue) -> Result<Self, ConfigDocumentError> {
        let version = raw
            .get("schema_version")
            .and_then(JsonValue::as_u64)
            .ok_or(ConfigDocumentError::MissingVersion)?;
        match version {
            1 => serde_json::from_value(raw.clone())
                .map(Self::V1)
                .map_err(|source| ConfigDocumentError::Malformed { version: 1, source }),
            2 => serde_json::from_value(raw.clone())
                .map(Self::V2)
                .map_err(|source| ConfigDocumentError::Malformed { version: 2, source }),
            other => Err(ConfigDocumentError::UnsupportedVersion(other)),
        }
    }

    pub fn into_current(self) -> ProviderConfigDocument {
        match self {
            Self::V1(doc) => upgrade_v1(doc),
            Self::V2(doc) => doc,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigDocumentError {
    #[error("configuration document has no numeric schema_version")]
    MissingVersion,
    #[error("schema version {0} is not supported (current is {CURRENT_SCHEMA_VERSION})")]
    UnsupportedVersion(u64),
    #[error("configuration document does not match schema version {version}: {source}")]
    Malformed {
        version: u32,
        #[source]
        source: serde_json::Error,
    },
    #[error("configuration document failed {} structural check(s)", .0.len())]
    Invalid(Vec<SyncError>),
}

impl ConfigDocumentError {
    pub fn to_sync_errors(&self) -> Vec<SyncError> {
        match self {
            Self::UnsupportedVersion(version) => vec![SyncError::new(
                ErrorCode::SchemaVersionUnsupported,
                self.to_string(),
            )
            .in_phase(ValidationPhase::SchemaParse)
            .with_detail("schema_version", *version)],
            Self::MissingVersion | Self::Malformed { .. } => {
                vec![SyncError::new(ErrorCode::ConfigMalformed, self.to_string())
                    .in_phase(ValidationPhase::SchemaParse)]
            }
            Self::Invalid(problems) => problems.clone(),
        }
    }
}

/// Parse a stored document under its declared schema version and upgrade it.
pub fn parse_config_document(
    raw: &JsonValue,
) -> Result<ProviderConfigDocument, ConfigDocumentError> {
    let mut doc = VersionedConfigDocument::from_json(raw)?.into_current();
    doc.schema_version = CURRENT_SCHEMA_VERSION;
    let problems = doc.structural_problems();
    if problems.is_empty() {
        Ok(doc)
    } else {
        Err(ConfigDocumentError::Invalid(problems))
    }
}

fn default_true() -> bool {
    true
}

fn default_batch_size() -> u32 {
    100
}

fn default_rate_limit() -> u32 {
    5
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_timeout_seconds() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn v2_document() -> JsonValue {
        json!({
            "schema_version": 2,
            "credentials": {"api_key": "patXYZ", "base_id": "appBASE000000001"},
            "entities": [{
                "entity_type": "pilot",
                "table": "Pilots",
                "last_modified_field": "Last Modified",
                "fields": [
                    {"internal": "callsign", "provider": "Callsign", "required": true},
                    {"internal": "name", "provider": "Name"},
                    {"internal": "hours", "provider": "Total Hours", "data_type": "number"},
                    {"internal": "bot_notes", "provider": "Bot Notes", "bot_metadata": true}
                ]
            }],
            "sync": {"batch_size": 50, "rate_limit_per_second": 2},
            "linkage": {"callsign_prefix": "VAX"}
        })
    }

    #[test]
    fn parses_current_document_with_defaults() {
        let doc = parse_config_document(&v2_document()).expect("valid document");
        assert_eq!(doc.sync.batch_size, 50);
        assert_eq!(doc.sync.retry_attempts, 3);
        assert_eq!(doc.sync.timeout_seconds, 30);
        assert_eq!(doc.linkage.callsign_prefix, "VAX");

        let pilot = doc.schema_for(EntityType::Pilot).expect("pilot schema");
        assert!(pilot.enabled);
        assert_eq!(pilot.mapping("hours").unwrap().data_type, FieldDataType::Number);
        assert!(pilot.mapping("name").unwrap().user_visible);
        assert_eq!(pilot.bot_metadata_field().unwrap().internal, "bot_notes");
        assert_eq!(
            pilot.provider_fields(),
            vec!["Callsign", "Name", "Total Hours", "Bot Notes", "Last Modified"]
        );
    }

    #[test]
    fn upgrades_legacy_document() {
        let raw = json!({
            "schema_version": 1,
            "api_key": "patOLD",
            "base_id": "appOLD",
            "rate_limit_per_second": 3,
            "tables": {
                "route": {
                    "table": "Routes",
                    "fields": {"origin": "From", "destination": "To"},
                    "required": ["origin"],
                    "last_modified_field": "Modified"
                }
            }
        });
        let doc = parse_config_document(&raw).expect("legacy document upgrades");
        assert_eq!(doc.schema_version, CURRENT_SCHEMA_VERSION);
        assert_eq!(doc.credentials.base_id, "appOLD");
        assert_eq!(doc.sync.rate_limit_per_second, 3);
        assert_eq!(doc.sync.batch_size, 100);

        let route = doc.schema_for(EntityType::Route).unwrap();
        assert_eq!(route.table, "Routes");
        assert!(route.mapping("origin").unwrap().required);
        assert!(!route.mapping("destination").unwrap().required);
        assert_eq!(route.last_modified_field.as_deref(), Some("Modified"));
    }

    #[test]
    fn unsupported_version_fails_fast() {
        let err = parse_config_document(&json!({"schema_version": 7})).unwrap_err();
        assert!(matches!(err, ConfigDocumentError::UnsupportedVersion(7)));
        let errors = err.to_sync_errors();
        assert_eq!(errors[0].code, ErrorCode::SchemaVersionUnsupported);
        assert_eq!(errors[0].phase, Some(ValidationPhase::SchemaParse));
    }

    #[test]
    fn missing_version_is_malformed() {
        let err = parse_config_document(&json!({"credentials": {}})).unwrap_err();
        assert_eq!(err.to_sync_errors()[0].code, ErrorCode::ConfigMalformed);
    }

    #[test]
    fn rejects_two_bot_metadata_fields() {
        let mut raw = v2_document();
        raw["entities"][0]["fields"][1]["bot_metadata"] = json!(true);
        let err = parse_config_document(&raw).unwrap_err();
        let errors = err.to_sync_errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code, ErrorCode::ConfigMalformed);
        assert_eq!(errors[0].entity_type, Some(EntityType::Pilot));
    }

    #[test]
    fn collects_every_structural_problem() {
        let mut raw = v2_document();
        raw["credentials"]["api_key"] = json!("  ");
        raw["sync"]["batch_size"] = json!(500);
        raw["entities"][0]["fields"][1]["internal"] = json!("callsign");
        let errors = parse_config_document(&raw).unwrap_err().to_sync_errors();
        let codes: Vec<_> = errors.iter().map(|e| e.code).collect();
        assert_eq!(
            codes,
            vec![
                ErrorCode::ConfigMalformed,
                ErrorCode::ConfigMalformed,
                ErrorCode::ValueOutOfRange
            ]
        );
    }

    #[test]
    fn credentials_debug_redacts_key() {
        let creds = Credentials {
            api_key: "patSECRET".into(),
            base_id: "appX".into(),
        };
        let debug = format!("{creds:?}");
        assert!(!debug.contains("patSECRET"));
        assert!(debug.contains("appX"));
    }
}
