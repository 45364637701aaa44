//! Closed error taxonomy shared by the provider client, the validator and the
//! sync jobs. Every classified failure ends up as a serializable [`SyncError`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::EntityType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Credential,
    Table,
    Field,
    DataValidation,
    Configuration,
    Linkage,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // credential / connection
    InvalidApiKey,
    InvalidBaseId,
    AuthenticationFailed,
    NetworkError,
    RateLimited,
    RequestTimeout,
    // schema / table
    TableNotFound,
    TableAccessDenied,
    TableEmpty,
    // field
    FieldNotFound,
    FieldRenamed,
    FieldTypeMismatch,
    // data validation
    TypeConversionFailed,
    RequiredFieldEmpty,
    RequiredFieldMostlyEmpty,
    InvalidFormat,
    ValueOutOfRange,
    // configuration
    ConfigMalformed,
    SchemaVersionUnsupported,
    ValidationTimeout,
    ConfigNotFound,
    ConfigNotActive,
    ConfigNotValidated,
    // pilot / route linkage
    PilotNotSynced,
    RouteNotSynced,
    MissingExternalId,
    PilotNotFound,
    RouteNotFound,
    Unknown,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 29] = [
        Self::InvalidApiKey,
        Self::InvalidBaseId,
        Self::AuthenticationFailed,
        Self::NetworkError,
        Self::RateLimited,
        Self::RequestTimeout,
        Self::TableNotFound,
        Self::TableAccessDenied,
        Self::TableEmpty,
        Self::FieldNotFound,
        Self::FieldRenamed,
        Self::FieldTypeMismatch,
        Self::TypeConversionFailed,
        Self::RequiredFieldEmpty,
        Self::RequiredFieldMostlyEmpty,
        Self::InvalidFormat,
        Self::ValueOutOfRange,
        Self::ConfigMalformed,
        Self::SchemaVersionUnsupported,
        Self::ValidationTimeout,
        Self::ConfigNotFound,
        Self::ConfigNotActive,
        Self::ConfigNotValidated,
        Self::PilotNotSynced,
        Self::RouteNotSynced,
        Self::MissingExternalId,
        Self::PilotNotFound,
        Self::RouteNotFound,
        Self::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidApiKey => "INVALID_API_KEY",
            Self::InvalidBaseId => "INVALID_BASE_ID",
            Self::AuthenticationFailed => "AUTHENTICATION_FAILED",
            Self::NetworkError => "NETWORK_ERROR",
            Self::RateLimited => "RATE_LIMITED",
            Self::RequestTimeout => "REQUEST_TIMEOUT",
            Self::TableNotFound => "TABLE_NOT_FOUND",
            Self::TableAccessDenied => "TABLE_ACCESS_DENIED",
            Self::TableEmpty => "TABLE_EMPTY",
            Self::FieldNotFound => "FIELD_NOT_FOUND",
            Self::FieldRenamed => "FIELD_RENAMED",
            Self::FieldTypeMismatch => "FIELD_TYPE_MISMATCH",
            Self::TypeConversionFailed => "TYPE_CONVERSION_FAILED",
            Self::RequiredFieldEmpty => "REQUIRED_FIELD_EMPTY",
            Self::RequiredFieldMostlyEmpty => "REQUIRED_FIELD_MOSTLY_EMPTY",
            Self::InvalidFormat => "INVALID_FORMAT",
            Self::ValueOutOfRange => "VALUE_OUT_OF_RANGE",
            Self::ConfigMalformed => "CONFIG_MALFORMED",
            Self::SchemaVersionUnsupported => "SCHEMA_VERSION_UNSUPPORTED",
            Self::ValidationTimeout => "VALIDATION_TIMEOUT",
            Self::ConfigNotFound => "CONFIG_NOT_FOUND",
            Self::ConfigNotActive => "CONFIG_NOT_ACTIVE",
            Self::ConfigNotValidated => "CONFIG_NOT_VALIDATED",
            Self::PilotNotSynced => "PILOT_NOT_SYNCED",
            Self::RouteNotSynced => "ROUTE_NOT_SYNCED",
            Self::MissingExternalId => "MISSING_EXTERNAL_ID",
            Self::PilotNotFound => "PILOT_NOT_FOUND",
            Self::RouteNotFound => "ROUTE_NOT_FOUND",
            Self::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(code: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.as_str() == code)
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidApiKey
            | Self::InvalidBaseId
            | Self::AuthenticationFailed
            | Self::NetworkError
            | Self::RateLimited
            | Self::RequestTimeout => ErrorCategory::Credential,
            Self::TableNotFound | Self::TableAccessDenied | Self::TableEmpty => ErrorCategory::Table,
            Self::FieldNotFound | Self::FieldRenamed | Self::FieldTypeMismatch => {
                ErrorCategory::Field
            }
            Self::TypeConversionFailed
            | Self::RequiredFieldEmpty
            | Self::RequiredFieldMostlyEmpty
            | Self::InvalidFormat
            | Self::ValueOutOfRange => ErrorCategory::DataValidation,
            Self::ConfigMalformed
            | Self::SchemaVersionUnsupported
            | Self::ValidationTimeout
            | Self::ConfigNotFound
            | Self::ConfigNotActive
            | Self::ConfigNotValidated => ErrorCategory::Configuration,
            Self::PilotNotSynced
            | Self::RouteNotSynced
            | Self::MissingExternalId
            | Self::PilotNotFound
            | Self::RouteNotFound => ErrorCategory::Linkage,
            Self::Unknown => ErrorCategory::Unknown,
        }
    }

    /// Transient failures are retried by the provider client; everything else
    /// is surfaced immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::NetworkError | Self::RateLimited | Self::RequestTimeout
        )
    }

    pub fn message(&self) -> &'static str {
        match self {
            Self::InvalidApiKey => "The API key was rejected by the data provider. Check that it is correct and has not been revoked.",
            Self::InvalidBaseId => "The base ID does not exist or is not reachable with this API key.",
            Self::AuthenticationFailed => "Authentication with the data provider failed. Check the key's scopes and base permissions.",
            Self::NetworkError => "Could not reach the data provider. This is usually temporary; try again shortly.",
            Self::RateLimited => "The data provider is rate limiting requests. Lower the configured requests per second.",
            Self::RequestTimeout => "The data provider did not answer within the configured timeout.",
            Self::TableNotFound => "The configured table was not found in the base.",
            Self::TableAccessDenied => "The API key does not have access to the configured table.",
            Self::TableEmpty => "The configured table has no records.",
            Self::FieldNotFound => "A mapped field does not exist in the provider table.",
            Self::FieldRenamed => "A mapped field appears to have been renamed in the provider table.",
            Self::FieldTypeMismatch => "A mapped field's type in the provider table is not compatible with the declared type.",
            Self::TypeConversionFailed => "A provider value could not be converted to the declared type.",
            Self::RequiredFieldEmpty => "Some records have an empty value in a required field.",
            Self::RequiredFieldMostlyEmpty => "A required field is empty in more than 10% of sampled records.",
            Self::InvalidFormat => "A value or filter has an invalid format.",
            Self::ValueOutOfRange => "A value is outside the allowed range.",
            Self::ConfigMalformed => "The configuration document is malformed.",
            Self::SchemaVersionUnsupported => "The configuration document uses an unsupported schema version.",
            Self::ValidationTimeout => "Validation did not finish within the allowed time.",
            Self::ConfigNotFound => "No configuration was found for this tenant and provider.",
            Self::ConfigNotActive => "The configuration is not active.",
            Self::ConfigNotValidated => "The configuration has not passed validation.",
            Self::PilotNotSynced => "The referenced pilot has not been synced yet.",
            Self::RouteNotSynced => "The referenced route has not been synced yet.",
            Self::MissingExternalId => "The record has no provider record ID.",
            Self::PilotNotFound => "No synced pilot matches the report's callsign.",
            Self::RouteNotFound => "No synced route matches the report's route.",
            Self::Unknown => UNKNOWN_ERROR_MESSAGE,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

const UNKNOWN_ERROR_MESSAGE: &str = "An unknown error occurred.";

/// Human message for a stored code string; unrecognized codes get the generic message.
pub fn describe_code(code: &str) -> &'static str {
    ErrorCode::parse(code)
        .map(|c| c.message())
        .unwrap_or(UNKNOWN_ERROR_MESSAGE)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationPhase {
    SchemaParse,
    Credentials,
    TableAccess,
    FieldPresence,
    DataQuality,
}

impl ValidationPhase {
    pub const ORDERED: [ValidationPhase; 5] = [
        Self::SchemaParse,
        Self::Credentials,
        Self::TableAccess,
        Self::FieldPresence,
        Self::DataQuality,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SchemaParse => "schema_parse",
            Self::Credentials => "credentials",
            Self::TableAccess => "table_access",
            Self::FieldPresence => "field_presence",
            Self::DataQuality => "data_quality",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    #[default]
    Error,
    Warning,
}

/// Structured error attached to validation history records and sync events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncError {
    pub code: ErrorCode,
    pub category: ErrorCategory,
    #[serde(default)]
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<ValidationPhase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<EntityType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_name: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, JsonValue>,
}

impl SyncError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            category: code.category(),
            severity: Severity::Error,
            message: message.into(),
            phase: None,
            entity_type: None,
            table_name: None,
            field_name: None,
            details: BTreeMap::new(),
        }
    }

    /// Error carrying the code's default human message.
    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.message())
    }

    pub fn warning(mut self) -> Self {
        self.severity = Severity::Warning;
        self
    }

    pub fn in_phase(mut self, phase: ValidationPhase) -> Self {
        self.phase = Some(phase);
        self
    }

    pub fn for_entity(mut self, entity_type: EntityType) -> Self {
        self.entity_type = Some(entity_type);
        self
    }

    pub fn for_table(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = Some(table_name.into());
        self
    }

    pub fn for_field(mut self, field_name: impl Into<String>) -> Self {
        self.field_name = Some(field_name.into());
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    pub fn is_warning(&self) -> bool {
        self.severity == Severity::Warning
    }

    /// Human-readable message for admin display, independent of the stored message.
    pub fn user_message(&self) -> &'static str {
        self.code.message()
    }
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for SyncError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_code_round_trips_through_its_string() {
        for code in ErrorCode::ALL {
            assert_eq!(ErrorCode::parse(code.as_str()), Some(code));
            let json = serde_json::to_value(code).unwrap();
            assert_eq!(json, JsonValue::String(code.as_str().to_string()));
        }
    }

    #[test]
    fn unrecognized_codes_fall_back_to_generic_message() {
        assert_eq!(describe_code("SOMETHING_NEW"), "An unknown error occurred.");
        assert_eq!(
            describe_code("TABLE_EMPTY"),
            "The configured table has no records."
        );
    }

    #[test]
    fn only_connection_failures_are_transient() {
        let transient: Vec<_> = ErrorCode::ALL
            .iter()
            .filter(|c| c.is_transient())
            .copied()
            .collect();
        assert_eq!(
            transient,
            vec![
                ErrorCode::NetworkError,
                ErrorCode::RateLimited,
                ErrorCode::RequestTimeout
            ]
        );
    }

    #[test]
    fn sync_error_serializes_structured_fields() {
        let err = SyncError::from_code(ErrorCode::FieldRenamed)
            .in_phase(ValidationPhase::FieldPresence)
            .for_entity(EntityType::Pilot)
            .for_table("Pilots")
            .for_field("Callsign")
            .with_detail("suggested", "Call Sign");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "FIELD_RENAMED");
        assert_eq!(json["category"], "field");
        assert_eq!(json["phase"], "field_presence");
        assert_eq!(json["entity_type"], "pilot");
        assert_eq!(json["table_name"], "Pilots");
        assert_eq!(json["details"]["suggested"], "Call Sign");
        assert_eq!(json["severity"], "error");
    }
}
