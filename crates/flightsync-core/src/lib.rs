//! Core domain model for flightsync: tenant provider configs, versioned
//! config documents, mirror rows, sync history and the error taxonomy.

mod document;
mod error;
mod model;

use serde::{Deserialize, Serialize};

pub use document::{
    parse_config_document, upgrade_v1, ConfigDocumentError, ConfigDocumentV1, Credentials,
    EntitySchema, FieldDataType, FieldMapping, LegacyTable, LinkageSettings,
    ProviderConfigDocument, SyncSettings, VersionedConfigDocument, CURRENT_SCHEMA_VERSION,
};
pub use error::{describe_code, ErrorCategory, ErrorCode, Severity, SyncError, ValidationPhase};
pub use model::{
    fields, BackfillStatus, FlightReportLinks, MirrorRow, SyncCursor, SyncEventStatus,
    SyncHistoryEvent, TenantProviderConfig, ValidationHistoryRecord, ValidationStatus,
    ValidationTrigger,
};

pub const CRATE_NAME: &str = "flightsync-core";

/// External tabular provider a tenant mirrors from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderType {
    Airtable,
}

impl ProviderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Airtable => "airtable",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "airtable" => Some(Self::Airtable),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Pilot,
    Route,
    FlightReport,
    Custom,
}

impl EntityType {
    /// Entity types that have a mirror table and a sync job.
    pub const MIRRORED: [EntityType; 3] = [Self::Pilot, Self::Route, Self::FlightReport];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pilot => "pilot",
            Self::Route => "route",
            Self::FlightReport => "flight_report",
            Self::Custom => "custom",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "pilot" | "pilots" => Some(Self::Pilot),
            "route" | "routes" => Some(Self::Route),
            "flight_report" | "flight_reports" | "pirep" | "pireps" => Some(Self::FlightReport),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }

    /// Sync-history event type written after each per-tenant sync.
    pub fn sync_event_type(&self) -> &'static str {
        match self {
            Self::Pilot => "pilot_sync",
            Self::Route => "route_sync",
            Self::FlightReport => "flight_report_sync",
            Self::Custom => "custom_sync",
        }
    }

    pub fn is_mirrored(&self) -> bool {
        Self::MIRRORED.contains(self)
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
