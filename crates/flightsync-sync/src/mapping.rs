//! Provider record -> internal record mapping.

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use flightsync_core::{EntitySchema, ErrorCode, FieldDataType, SyncError};
use flightsync_provider::ProviderRecord;
use serde_json::{Map as JsonMap, Number as JsonNumber, Value as JsonValue};
use sha2::{Digest, Sha256};
use strsim::jaro_winkler;

/// Minimum Jaro-Winkler score for a missing field to be reported as renamed.
pub const RENAME_SIMILARITY_THRESHOLD: f64 = 0.90;

#[derive(Debug, Clone, PartialEq)]
pub struct MappedRecord {
    pub provider_record_id: String,
    pub fields: JsonMap<String, JsonValue>,
    pub modified_at: Option<DateTime<Utc>>,
    pub content_hash: String,
    /// Optional fields whose value could not be converted and were stored as null.
    pub warnings: Vec<SyncError>,
}

/// Apply a schema's field mappings to one provider record.
///
/// Empty values fall back to the mapping's default. A required field that is
/// still empty, or fails conversion, rejects the whole record.
pub fn map_record(
    schema: &EntitySchema,
    record: &ProviderRecord,
) -> Result<MappedRecord, Vec<SyncError>> {
    let mut fields = JsonMap::new();
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    for mapping in &schema.fields {
        let scoped = |err: SyncError| {
            err.for_entity(schema.entity_type)
                .for_table(&schema.table)
                .for_field(&mapping.provider)
                .with_detail("record_id", record.id.as_str())
        };
        let raw = record.fields.get(&mapping.provider);
        let value = if is_empty_value(raw) {
            mapping.default_value.clone()
        } else {
            raw.map(|v| coerce(v, mapping.data_type)).and_then(|res| match res {
                Ok(v) => Some(v),
                Err(reason) => {
                    let err = scoped(SyncError::new(
                        ErrorCode::TypeConversionFailed,
                        format!("{}: {reason}", mapping.provider),
                    ))
                    .with_detail("expected", mapping.data_type.as_str());
                    if mapping.required {
                        errors.push(err);
                    } else {
                        warnings.push(err.warning());
                    }
                    None
                }
            })
        };

        match value {
            Some(v) => {
                fields.insert(mapping.internal.clone(), v);
            }
            None if mapping.required => {
                if !errors.iter().any(|e: &SyncError| {
                    e.field_name.as_deref() == Some(mapping.provider.as_str())
                }) {
                    errors.push(scoped(SyncError::new(
                        ErrorCode::RequiredFieldEmpty,
                        format!("required field {} is empty", mapping.provider),
                    )));
                }
            }
            None => {
                fields.insert(mapping.internal.clone(), JsonValue::Null);
            }
        }
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    Ok(MappedRecord {
        provider_record_id: record.id.clone(),
        content_hash: content_hash(&fields),
        modified_at: record_modified_at(schema, record),
        fields,
        warnings,
    })
}

/// Last-modified time from the schema's cursor field, else the record's creation time.
pub fn record_modified_at(schema: &EntitySchema, record: &ProviderRecord) -> Option<DateTime<Utc>> {
    schema
        .last_modified_field
        .as_ref()
        .and_then(|field| record.fields.get(field))
        .and_then(JsonValue::as_str)
        .and_then(parse_datetime)
        .or(record.created_time)
}

/// Absent, null, blank strings and empty lists all count as empty.
pub fn is_empty_value(value: Option<&JsonValue>) -> bool {
    match value {
        None | Some(JsonValue::Null) => true,
        Some(JsonValue::String(s)) => s.trim().is_empty(),
        Some(JsonValue::Array(items)) => items.is_empty(),
        Some(_) => false,
    }
}

/// SHA-256 of the canonical (key-sorted) JSON encoding.
pub fn content_hash(fields: &JsonMap<String, JsonValue>) -> String {
    let canonical = serde_json::to_vec(fields).unwrap_or_default();
    hex::encode(Sha256::digest(&canonical))
}

pub fn coerce(value: &JsonValue, data_type: FieldDataType) -> Result<JsonValue, String> {
    use FieldDataType::*;

    if let JsonValue::Array(items) = value {
        if items.len() == 1 && !matches!(data_type, MultiSelect | LinkedRecord | Attachment) {
            return coerce(&items[0], data_type);
        }
    }

    match data_type {
        Text => match value {
            JsonValue::String(s) => Ok(JsonValue::String(s.trim().to_string())),
            JsonValue::Number(n) => Ok(JsonValue::String(n.to_string())),
            JsonValue::Bool(b) => Ok(JsonValue::String(b.to_string())),
            JsonValue::Array(items) => {
                let parts: Vec<String> = items.iter().filter_map(scalar_text).collect();
                if parts.len() == items.len() {
                    Ok(JsonValue::String(parts.join(", ")))
                } else {
                    Err("list contains non-text values".into())
                }
            }
            _ => Err("expected text".into()),
        },
        Select => scalar_text(value)
            .map(JsonValue::String)
            .ok_or_else(|| "expected a single option".to_string()),
        Email => match scalar_text(value) {
            Some(s) if s.contains('@') && !s.contains(char::is_whitespace) => {
                Ok(JsonValue::String(s.to_ascii_lowercase()))
            }
            _ => Err("expected an email address".into()),
        },
        Url => match scalar_text(value) {
            Some(s) if s.starts_with("http://") || s.starts_with("https://") => {
                Ok(JsonValue::String(s))
            }
            _ => Err("expected an http(s) url".into()),
        },
        Number => match value {
            JsonValue::Number(n) => Ok(JsonValue::Number(n.clone())),
            JsonValue::String(s) => s
                .trim()
                .replace(',', "")
                .parse::<f64>()
                .ok()
                .and_then(JsonNumber::from_f64)
                .map(JsonValue::Number)
                .ok_or_else(|| format!("{s:?} is not a number")),
            _ => Err("expected a number".into()),
        },
        Integer => {
            let parsed = match value {
                JsonValue::Number(n) => n
                    .as_i64()
                    .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
                JsonValue::String(s) => s.trim().parse::<i64>().ok(),
                _ => None,
            };
            parsed
                .map(|i| JsonValue::Number(i.into()))
                .ok_or_else(|| "expected an integer".to_string())
        }
        Boolean => match value {
            JsonValue::Bool(b) => Ok(JsonValue::Bool(*b)),
            JsonValue::Number(n) if n.as_i64() == Some(1) => Ok(JsonValue::Bool(true)),
            JsonValue::Number(n) if n.as_i64() == Some(0) => Ok(JsonValue::Bool(false)),
            JsonValue::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "y" | "1" => Ok(JsonValue::Bool(true)),
                "false" | "no" | "n" | "0" => Ok(JsonValue::Bool(false)),
                _ => Err(format!("{s:?} is not a boolean")),
            },
            _ => Err("expected a boolean".into()),
        },
        Date => value
            .as_str()
            .and_then(|s| {
                parse_datetime(s)
                    .map(|dt| dt.date_naive())
                    .or_else(|| NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok())
            })
            .map(|d| JsonValue::String(d.format("%Y-%m-%d").to_string()))
            .ok_or_else(|| "expected a date (YYYY-MM-DD)".to_string()),
        DateTime => value
            .as_str()
            .and_then(parse_datetime)
            .map(|dt| JsonValue::String(dt.to_rfc3339_opts(SecondsFormat::Secs, true)))
            .ok_or_else(|| "expected an RFC 3339 timestamp".to_string()),
        MultiSelect | LinkedRecord => match value {
            JsonValue::Array(items) => {
                let parts: Vec<JsonValue> = items
                    .iter()
                    .filter_map(scalar_text)
                    .map(JsonValue::String)
                    .collect();
                if parts.len() == items.len() {
                    Ok(JsonValue::Array(parts))
                } else {
                    Err("list contains non-text values".into())
                }
            }
            JsonValue::String(s) => Ok(JsonValue::Array(
                s.split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(|p| JsonValue::String(p.to_string()))
                    .collect(),
            )),
            _ => Err("expected a list".into()),
        },
        Attachment => match value {
            JsonValue::Array(_) => Ok(value.clone()),
            _ => Err("expected a list of attachments".into()),
        },
    }
}

/// Whether a provider column type can feed a declared internal type.
///
/// Computed columns (formula, rollup, lookup) can produce any type and are
/// always accepted; phase 5 catches bad values instead.
pub fn type_compatible(declared: FieldDataType, provider_type: &str) -> bool {
    const TEXT: &[&str] = &[
        "singleLineText",
        "multilineText",
        "richText",
        "email",
        "url",
        "phoneNumber",
        "singleSelect",
        "barcode",
    ];
    const NUMERIC: &[&str] = &[
        "number",
        "currency",
        "percent",
        "rating",
        "duration",
        "autoNumber",
        "count",
    ];
    const DATES: &[&str] = &["date", "dateTime", "createdTime", "lastModifiedTime"];
    const COMPUTED: &[&str] = &["formula", "rollup", "lookup", "multipleLookupValues"];

    if COMPUTED.contains(&provider_type) {
        return true;
    }
    match declared {
        FieldDataType::Text => {
            TEXT.contains(&provider_type)
                || NUMERIC.contains(&provider_type)
                || DATES.contains(&provider_type)
        }
        FieldDataType::Number | FieldDataType::Integer => NUMERIC.contains(&provider_type),
        FieldDataType::Boolean => provider_type == "checkbox",
        FieldDataType::Date | FieldDataType::DateTime => DATES.contains(&provider_type),
        FieldDataType::Email => matches!(provider_type, "email" | "singleLineText"),
        FieldDataType::Url => matches!(provider_type, "url" | "singleLineText"),
        FieldDataType::Select => matches!(provider_type, "singleSelect" | "singleLineText"),
        FieldDataType::MultiSelect => provider_type == "multipleSelects",
        FieldDataType::LinkedRecord => provider_type == "multipleRecordLinks",
        FieldDataType::Attachment => provider_type == "multipleAttachments",
    }
}

/// Best guess for a provider field that was renamed: case-insensitive match,
/// then punctuation-insensitive match, then the closest Jaro-Winkler score.
pub fn find_renamed<'a>(
    wanted: &str,
    available: impl IntoIterator<Item = &'a str> + Clone,
) -> Option<String> {
    if let Some(hit) = available
        .clone()
        .into_iter()
        .find(|candidate| candidate.eq_ignore_ascii_case(wanted))
    {
        return Some(hit.to_string());
    }

    let wanted_norm = normalize_field_name(wanted);
    if let Some(hit) = available
        .clone()
        .into_iter()
        .find(|candidate| normalize_field_name(candidate) == wanted_norm)
    {
        return Some(hit.to_string());
    }

    let wanted_lower = wanted.to_lowercase();
    available
        .into_iter()
        .map(|candidate| (jaro_winkler(&wanted_lower, &candidate.to_lowercase()), candidate))
        .filter(|(score, _)| *score >= RENAME_SIMILARITY_THRESHOLD)
        .max_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(_, candidate)| candidate.to_string())
}

fn normalize_field_name(input: &str) -> String {
    input
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

fn scalar_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

pub(crate) fn parse_datetime(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(value, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|naive| naive.and_utc())
        })
}
