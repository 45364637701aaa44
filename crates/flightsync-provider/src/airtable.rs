//! Airtable REST transport.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use flightsync_core::{Credentials, ErrorCode, SyncSettings};
use reqwest::header::RETRY_AFTER;
use reqwest::{Response, Url};
use serde::Deserialize;
use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::error::{classify_reqwest_error, classify_status, ProviderError, RequestScope};
use crate::transport::{
    FieldMeta, ModifiedSince, ProviderRecord, ProviderTransport, QueryPage, QueryRequest,
    TableMeta, TransportFactory,
};

pub const DEFAULT_AIRTABLE_BASE_URL: &str = "https://api.airtable.com/v0";

#[derive(Debug, Clone)]
pub struct AirtableTransport {
    http: reqwest::Client,
    base_url: Url,
    credentials: Credentials,
}

#[derive(Debug, Deserialize)]
struct TablesResponse {
    tables: Vec<TableResponse>,
}

#[derive(Debug, Deserialize)]
struct TableResponse {
    id: String,
    name: String,
    #[serde(default)]
    fields: Vec<FieldResponse>,
}

#[derive(Debug, Deserialize)]
struct FieldResponse {
    name: String,
    #[serde(rename = "type")]
    field_type: String,
}

#[derive(Debug, Deserialize)]
struct RecordsResponse {
    #[serde(default)]
    records: Vec<RecordResponse>,
    #[serde(default)]
    offset: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecordResponse {
    id: String,
    #[serde(default)]
    created_time: Option<DateTime<Utc>>,
    #[serde(default)]
    fields: JsonMap<String, JsonValue>,
}

impl AirtableTransport {
    pub fn new(
        base_url: &str,
        credentials: Credentials,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let base_url = Url::parse(base_url.trim_end_matches('/')).map_err(|err| {
            ProviderError::new(
                ErrorCode::ConfigMalformed,
                format!("invalid provider base url {base_url}: {err}"),
            )
        })?;
        let http = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(timeout)
            .build()
            .map_err(|err| ProviderError::new(classify_reqwest_error(&err), err.to_string()))?;
        Ok(Self {
            http,
            base_url,
            credentials,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ProviderError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                ProviderError::new(ErrorCode::ConfigMalformed, "provider base url cannot be a base")
            })?
            .extend(segments);
        Ok(url)
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        scope: RequestScope<'_>,
    ) -> Result<Response, ProviderError> {
        let response = request
            .bearer_auth(&self.credentials.api_key)
            .send()
            .await
            .map_err(|err| ProviderError::new(classify_reqwest_error(&err), err.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body: JsonValue = response.json().await.unwrap_or(JsonValue::Null);
        let (error_type, message) = error_type_and_message(&body);
        let code = classify_status(status, scope, error_type.as_deref());
        let message = message
            .or(error_type)
            .unwrap_or_else(|| status.to_string());

        Err(ProviderError::new(code, message)
            .with_status(status.as_u16())
            .with_retry_after(retry_after))
    }
}

#[async_trait]
impl ProviderTransport for AirtableTransport {
    async fn list_tables(&self) -> Result<Vec<TableMeta>, ProviderError> {
        let url = self.endpoint(&["meta", "bases", &self.credentials.base_id, "tables"])?;
        let response = self.send(self.http.get(url), RequestScope::Base).await?;
        let parsed: TablesResponse = response
            .json()
            .await
            .map_err(|err| ProviderError::new(ErrorCode::InvalidFormat, err.to_string()))?;
        Ok(parsed
            .tables
            .into_iter()
            .map(|t| TableMeta {
                id: t.id,
                name: t.name,
                fields: t
                    .fields
                    .into_iter()
                    .map(|f| FieldMeta {
                        name: f.name,
                        field_type: f.field_type,
                    })
                    .collect(),
            })
            .collect())
    }

    async fn query(&self, request: &QueryRequest) -> Result<QueryPage, ProviderError> {
        let url = self.endpoint(&[&self.credentials.base_id, &request.table])?;
        let params = query_params(request);
        let builder = self.http.get(url).query(&params);
        let response = self
            .send(builder, RequestScope::Table(&request.table))
            .await?;
        let parsed: RecordsResponse = response
            .json()
            .await
            .map_err(|err| ProviderError::new(ErrorCode::InvalidFormat, err.to_string()))?;
        Ok(QueryPage {
            records: parsed
                .records
                .into_iter()
                .map(|r| ProviderRecord {
                    id: r.id,
                    created_time: r.created_time,
                    fields: r.fields,
                })
                .collect(),
            offset: parsed.offset,
        })
    }
}

fn query_params(request: &QueryRequest) -> Vec<(String, String)> {
    let mut params = vec![("pageSize".to_string(), request.page_size.to_string())];
    if let Some(max) = request.max_records {
        params.push(("maxRecords".to_string(), max.to_string()));
    }
    if let Some(offset) = &request.offset {
        params.push(("offset".to_string(), offset.clone()));
    }
    for field in &request.fields {
        params.push(("fields[]".to_string(), field.clone()));
    }
    if let Some(filter) = &request.modified_since {
        params.push(("filterByFormula".to_string(), modified_since_formula(filter)));
    }
    params
}

/// `field >= since`, expressed as "not before" so equal timestamps are re-read.
fn modified_since_formula(filter: &ModifiedSince) -> String {
    let field = filter.field.replace('}', "");
    let since = filter.since.to_rfc3339_opts(SecondsFormat::Millis, true);
    format!("NOT(IS_BEFORE({{{field}}}, '{since}'))")
}

fn error_type_and_message(body: &JsonValue) -> (Option<String>, Option<String>) {
    match body.get("error") {
        Some(JsonValue::String(kind)) => (Some(kind.clone()), None),
        Some(JsonValue::Object(obj)) => (
            obj.get("type").and_then(JsonValue::as_str).map(str::to_string),
            obj.get("message")
                .and_then(JsonValue::as_str)
                .map(str::to_string),
        ),
        _ => (None, None),
    }
}

/// Builds an [`AirtableTransport`] per tenant.
#[derive(Debug, Clone)]
pub struct AirtableTransportFactory {
    base_url: String,
}

impl AirtableTransportFactory {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

impl Default for AirtableTransportFactory {
    fn default() -> Self {
        Self::new(DEFAULT_AIRTABLE_BASE_URL)
    }
}

impl TransportFactory for AirtableTransportFactory {
    fn transport(
        &self,
        credentials: &Credentials,
        settings: &SyncSettings,
    ) -> Result<Arc<dyn ProviderTransport>, ProviderError> {
        let transport =
            AirtableTransport::new(&self.base_url, credentials.clone(), settings.timeout())?;
        Ok(Arc::new(transport))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn transport() -> AirtableTransport {
        AirtableTransport::new(
            DEFAULT_AIRTABLE_BASE_URL,
            Credentials {
                api_key: "patTEST".into(),
                base_id: "appBASE".into(),
            },
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn endpoints_escape_table_names() {
        let url = transport().endpoint(&["appBASE", "Flight Reports"]).unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.airtable.com/v0/appBASE/Flight%20Reports"
        );
        let meta = transport()
            .endpoint(&["meta", "bases", "appBASE", "tables"])
            .unwrap();
        assert_eq!(
            meta.as_str(),
            "https://api.airtable.com/v0/meta/bases/appBASE/tables"
        );
    }

    #[test]
    fn query_params_include_filter_and_fields() {
        let mut request = QueryRequest::new("Pilots", 50);
        request.fields = vec!["Callsign".into(), "Name".into()];
        request.offset = Some("itr123".into());
        request.modified_since = Some(ModifiedSince {
            field: "Last Modified".into(),
            since: Utc.with_ymd_and_hms(2026, 4, 1, 12, 30, 0).single().unwrap(),
        });

        let params = query_params(&request);
        assert!(params.contains(&("pageSize".into(), "50".into())));
        assert!(params.contains(&("offset".into(), "itr123".into())));
        assert!(params.contains(&("fields[]".into(), "Callsign".into())));
        assert!(params.contains(&("fields[]".into(), "Name".into())));
        assert!(params.contains(&(
            "filterByFormula".into(),
            "NOT(IS_BEFORE({Last Modified}, '2026-04-01T12:30:00.000Z'))".into()
        )));
    }

    #[test]
    fn parses_both_error_body_shapes() {
        assert_eq!(
            error_type_and_message(&json!({"error": "NOT_FOUND"})),
            (Some("NOT_FOUND".into()), None)
        );
        assert_eq!(
            error_type_and_message(&json!({
                "error": {"type": "UNKNOWN_FIELD_NAME", "message": "Unknown field name: \"Callsign\""}
            })),
            (
                Some("UNKNOWN_FIELD_NAME".into()),
                Some("Unknown field name: \"Callsign\"".into())
            )
        );
        assert_eq!(error_type_and_message(&JsonValue::Null), (None, None));
    }

    #[test]
    fn rejects_unparseable_base_url() {
        let err = AirtableTransport::new(
            "not a url",
            Credentials {
                api_key: "k".into(),
                base_id: "b".into(),
            },
            Duration::from_secs(1),
        )
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConfigMalformed);
    }

    #[test]
    fn record_response_reads_created_time() {
        let parsed: RecordsResponse = serde_json::from_value(json!({
            "records": [{"id": "rec1", "createdTime": "2026-01-02T03:04:05.000Z", "fields": {"Name": "A"}}],
            "offset": "itr"
        }))
        .unwrap();
        assert_eq!(parsed.records[0].id, "rec1");
        assert!(parsed.records[0].created_time.is_some());
        assert_eq!(parsed.offset.as_deref(), Some("itr"));
    }
}
