use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use uuid::Uuid;

use crate::document::{parse_config_document, ConfigDocumentError, ProviderConfigDocument};
use crate::error::{SyncError, ValidationPhase};
use crate::{EntityType, ProviderType};

/// Internal field names the linkage logic relies on.
pub mod fields {
    pub const CALLSIGN: &str = "callsign";
    pub const ORIGIN: &str = "origin";
    pub const DESTINATION: &str = "destination";
    pub const PILOT_CALLSIGN: &str = "pilot_callsign";
    pub const ROUTE: &str = "route";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Pending,
    Validating,
    Valid,
    Invalid,
}

impl ValidationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Validating => "validating",
            Self::Valid => "valid",
            Self::Invalid => "invalid",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "validating" => Some(Self::Validating),
            "valid" => Some(Self::Valid),
            "invalid" => Some(Self::Invalid),
            _ => None,
        }
    }

    /// pending -> validating -> {valid, invalid}; a finished run may start again.
    pub fn can_transition_to(&self, next: ValidationStatus) -> bool {
        use ValidationStatus::*;
        matches!(
            (self, next),
            (Pending | Valid | Invalid, Validating) | (Validating, Valid | Invalid)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Valid | Self::Invalid)
    }
}

impl std::fmt::Display for ValidationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationTrigger {
    Onboarding,
    Admin,
    Api,
    Cli,
    Scheduled,
}

impl ValidationTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Onboarding => "onboarding",
            Self::Admin => "admin",
            Self::Api => "api",
            Self::Cli => "cli",
            Self::Scheduled => "scheduled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "onboarding" => Some(Self::Onboarding),
            "admin" => Some(Self::Admin),
            "api" => Some(Self::Api),
            "cli" => Some(Self::Cli),
            "scheduled" => Some(Self::Scheduled),
            _ => None,
        }
    }
}

/// One versioned configuration per (tenant, provider type, version).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantProviderConfig {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub provider_type: ProviderType,
    pub version: i32,
    pub document: JsonValue,
    pub is_active: bool,
    pub validation_status: ValidationStatus,
    #[serde(default)]
    pub enabled_features: BTreeSet<String>,
    pub last_validated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub validation_errors: Vec<SyncError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TenantProviderConfig {
    pub fn new_version(
        tenant_id: Uuid,
        provider_type: ProviderType,
        version: i32,
        document: JsonValue,
        enabled_features: BTreeSet<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            provider_type,
            version,
            document,
            is_active: false,
            validation_status: ValidationStatus::Pending,
            enabled_features,
            last_validated_at: None,
            validation_errors: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn parsed_document(&self) -> Result<ProviderConfigDocument, ConfigDocumentError> {
        parse_config_document(&self.document)
    }

    /// Sync jobs only pick up configs that are both active and valid.
    pub fn is_syncable(&self) -> bool {
        self.is_active && self.validation_status == ValidationStatus::Valid
    }
}

/// Append-only audit record of one validation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationHistoryRecord {
    pub id: Uuid,
    pub config_id: Uuid,
    pub tenant_id: Uuid,
    pub config_version: i32,
    pub status: ValidationStatus,
    pub errors: Vec<SyncError>,
    pub warnings: Vec<SyncError>,
    pub phases_completed: Vec<ValidationPhase>,
    pub phase_failed: Option<ValidationPhase>,
    pub duration_ms: u64,
    pub triggered_by: ValidationTrigger,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub tenant_id: Uuid,
    pub entity_type: EntityType,
    pub last_synced_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SyncCursor {
    /// The cursor never moves backward.
    pub fn advanced_to(&self, candidate: DateTime<Utc>) -> DateTime<Utc> {
        self.last_synced_at.max(candidate)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackfillStatus {
    #[default]
    Unresolved,
    Resolved,
    Unresolvable,
}

impl BackfillStatus {
    pub fn as_i16(&self) -> i16 {
        match self {
            Self::Unresolved => 0,
            Self::Resolved => 1,
            Self::Unresolvable => 2,
        }
    }

    pub fn from_i16(value: i16) -> Option<Self> {
        match value {
            0 => Some(Self::Unresolved),
            1 => Some(Self::Resolved),
            2 => Some(Self::Unresolvable),
            _ => None,
        }
    }
}

/// Cross-references carried only by flight-report mirror rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FlightReportLinks {
    pub pilot_id: Option<Uuid>,
    pub route_id: Option<Uuid>,
    pub backfill_status: BackfillStatus,
    pub backfill_attempts: i32,
}

impl FlightReportLinks {
    pub fn from_resolution(pilot_id: Option<Uuid>, route_id: Option<Uuid>) -> Self {
        let backfill_status = if pilot_id.is_some() && route_id.is_some() {
            BackfillStatus::Resolved
        } else {
            BackfillStatus::Unresolved
        };
        Self {
            pilot_id,
            route_id,
            backfill_status,
            backfill_attempts: 0,
        }
    }
}

/// Local copy of one provider record, keyed by (tenant, provider record id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorRow {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub entity_type: EntityType,
    pub provider_record_id: String,
    pub fields: JsonMap<String, JsonValue>,
    pub content_hash: String,
    pub provider_modified_at: Option<DateTime<Utc>>,
    pub synced_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub links: Option<FlightReportLinks>,
}

impl MirrorRow {
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .and_then(JsonValue::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncEventStatus {
    Success,
    Failed,
}

impl SyncEventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

/// Observability record appended after each per-tenant sync attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncHistoryEvent {
    pub id: Uuid,
    pub run_id: Uuid,
    pub tenant_id: Uuid,
    pub event_type: String,
    pub entity_type: EntityType,
    pub status: SyncEventStatus,
    pub previous_cursor: Option<DateTime<Utc>>,
    pub cursor: Option<DateTime<Utc>>,
    pub records_fetched: u64,
    pub records_inserted: u64,
    pub records_updated: u64,
    pub records_unchanged: u64,
    pub records_rejected: u64,
    pub errors: Vec<SyncError>,
    pub duration_ms: u64,
    pub created_at: DateTime<Utc>,
}

impl SyncHistoryEvent {
    pub fn records_upserted(&self) -> u64 {
        self.records_inserted + self.records_updated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn validation_status_transitions() {
        use ValidationStatus::*;
        assert!(Pending.can_transition_to(Validating));
        assert!(Validating.can_transition_to(Valid));
        assert!(Validating.can_transition_to(Invalid));
        assert!(Valid.can_transition_to(Validating));
        assert!(Invalid.can_transition_to(Validating));
        assert!(!Pending.can_transition_to(Valid));
        assert!(!Invalid.can_transition_to(Valid));
        assert!(!Validating.can_transition_to(Pending));
    }

    #[test]
    fn cursor_never_moves_backward() {
        let ts = |h| Utc.with_ymd_and_hms(2026, 3, 1, h, 0, 0).single().unwrap();
        let cursor = SyncCursor {
            tenant_id: Uuid::new_v4(),
            entity_type: EntityType::Pilot,
            last_synced_at: ts(10),
            updated_at: ts(10),
        };
        assert_eq!(cursor.advanced_to(ts(9)), ts(10));
        assert_eq!(cursor.advanced_to(ts(11)), ts(11));
    }

    #[test]
    fn links_resolve_only_with_both_references() {
        let partial = FlightReportLinks::from_resolution(Some(Uuid::new_v4()), None);
        assert_eq!(partial.backfill_status, BackfillStatus::Unresolved);
        let full = FlightReportLinks::from_resolution(Some(Uuid::new_v4()), Some(Uuid::new_v4()));
        assert_eq!(full.backfill_status, BackfillStatus::Resolved);
        assert_eq!(BackfillStatus::from_i16(2), Some(BackfillStatus::Unresolvable));
        assert_eq!(BackfillStatus::from_i16(3), None);
    }

    #[test]
    fn new_versions_start_pending_and_inactive() {
        let config = TenantProviderConfig::new_version(
            Uuid::new_v4(),
            ProviderType::Airtable,
            1,
            serde_json::json!({"schema_version": 2}),
            BTreeSet::new(),
        );
        assert_eq!(config.validation_status, ValidationStatus::Pending);
        assert!(!config.is_active);
        assert!(!config.is_syncable());
    }
}
