use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use flightsync_core::{ErrorCode, SyncSettings};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

use crate::backoff::BackoffPolicy;
use crate::error::ProviderError;
use crate::limiter::RateLimiter;
use crate::transport::{ModifiedSince, ProviderRecord, ProviderTransport, QueryRequest, TableMeta};

/// Per-tenant handle to the provider.
///
/// Each handle owns its own [`RateLimiter`]; handles are built once per tenant
/// per job run and never shared between tenants.
pub struct ProviderClient {
    transport: Arc<dyn ProviderTransport>,
    limiter: RateLimiter,
    backoff: BackoffPolicy,
    timeout: Duration,
    page_size: u32,
    cancel: CancellationToken,
    label: String,
}

impl ProviderClient {
    pub fn new(
        transport: Arc<dyn ProviderTransport>,
        settings: &SyncSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            limiter: RateLimiter::per_second(settings.rate_limit_per_second),
            backoff: BackoffPolicy::from_settings(settings),
            timeout: settings.timeout(),
            page_size: settings.batch_size.clamp(1, SyncSettings::MAX_BATCH_SIZE),
            cancel,
            label: String::new(),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Tag used in log spans, usually the tenant id.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub async fn list_tables(&self) -> Result<Vec<TableMeta>, ProviderError> {
        self.execute("list_tables", || self.transport.list_tables())
            .await
    }

    /// Fetch every row of `table`, following continuation offsets.
    pub async fn fetch(
        &self,
        table: &str,
        filter: Option<&ModifiedSince>,
        fields: &[String],
    ) -> Result<Vec<ProviderRecord>, ProviderError> {
        let mut request = QueryRequest::new(table, self.page_size);
        request.fields = fields.to_vec();
        request.modified_since = filter.cloned();

        let mut records = Vec::new();
        loop {
            let page = self
                .execute("query", || self.transport.query(&request))
                .await?;
            records.extend(page.records);
            match page.offset {
                Some(offset) => request.offset = Some(offset),
                None => break,
            }
        }
        debug!(tenant = %self.label, table, rows = records.len(), "provider fetch complete");
        Ok(records)
    }

    /// Fetch at most `limit` rows for data-quality sampling.
    pub async fn sample(
        &self,
        table: &str,
        fields: &[String],
        limit: u32,
    ) -> Result<Vec<ProviderRecord>, ProviderError> {
        let limit = limit.max(1);
        let mut request = QueryRequest::new(table, self.page_size.min(limit));
        request.fields = fields.to_vec();
        request.max_records = Some(limit);

        let mut records = Vec::new();
        loop {
            let page = self
                .execute("sample", || self.transport.query(&request))
                .await?;
            records.extend(page.records);
            if records.len() >= limit as usize {
                records.truncate(limit as usize);
                break;
            }
            match page.offset {
                Some(offset) => request.offset = Some(offset),
                None => break,
            }
        }
        Ok(records)
    }

    /// Confirm `table` is readable and holds at least one row.
    pub async fn probe(&self, table: &str) -> Result<(), ProviderError> {
        let mut request = QueryRequest::new(table, 1);
        request.max_records = Some(1);
        let page = self
            .execute("probe", || self.transport.query(&request))
            .await?;
        if page.records.is_empty() {
            return Err(ProviderError::new(
                ErrorCode::TableEmpty,
                format!("table {table} has no records"),
            ));
        }
        Ok(())
    }

    async fn execute<T, F, Fut>(&self, operation: &'static str, call: F) -> Result<T, ProviderError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let span = info_span!("provider_request", tenant = %self.label, operation);
        async {
            let mut attempt = 0u32;
            loop {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Err(ProviderError::Cancelled),
                    _ = self.limiter.take() => {}
                }

                let outcome = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Err(ProviderError::Cancelled),
                    res = tokio::time::timeout(self.timeout, call()) => match res {
                        Ok(outcome) => outcome,
                        Err(_) => Err(ProviderError::new(
                            ErrorCode::RequestTimeout,
                            format!("no response within {}s", self.timeout.as_secs()),
                        )),
                    },
                };

                match outcome {
                    Ok(value) => return Ok(value),
                    Err(err) if err.is_transient() && attempt < self.backoff.max_retries => {
                        let delay = self.backoff.delay_with_hint(attempt, err.retry_after());
                        warn!(
                            attempt,
                            code = %err.code(),
                            delay_ms = delay.as_millis() as u64,
                            "transient provider error; backing off"
                        );
                        tokio::select! {
                            biased;
                            _ = self.cancel.cancelled() => return Err(ProviderError::Cancelled),
                            _ = tokio::time::sleep(delay) => {}
                        }
                        attempt += 1;
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::QueryPage;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::time::Instant;

    /// Transport that replays a fixed script of query outcomes.
    struct ScriptedTransport {
        script: Mutex<VecDeque<Result<QueryPage, ProviderError>>>,
        requests: Mutex<Vec<QueryRequest>>,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Result<QueryPage, ProviderError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ProviderTransport for ScriptedTransport {
        async fn list_tables(&self) -> Result<Vec<TableMeta>, ProviderError> {
            Ok(Vec::new())
        }

        async fn query(&self, request: &QueryRequest) -> Result<QueryPage, ProviderError> {
            self.requests.lock().unwrap().push(request.clone());
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(QueryPage::default()))
        }
    }

    fn record(id: &str) -> ProviderRecord {
        ProviderRecord {
            id: id.to_string(),
            created_time: None,
            fields: serde_json::Map::new(),
        }
    }

    fn page(ids: &[&str], offset: Option<&str>) -> QueryPage {
        QueryPage {
            records: ids.iter().map(|id| record(id)).collect(),
            offset: offset.map(str::to_string),
        }
    }

    fn rate_limited() -> ProviderError {
        ProviderError::new(ErrorCode::RateLimited, "too many requests").with_status(429)
    }

    fn settings(retry_attempts: u32, rate_limit_per_second: u32) -> SyncSettings {
        SyncSettings {
            retry_attempts,
            rate_limit_per_second,
            ..SyncSettings::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_twice_then_succeeds_after_two_backoffs() {
        let transport = ScriptedTransport::new(vec![
            Err(rate_limited()),
            Err(rate_limited()),
            Ok(page(&["rec1", "rec2"], None)),
        ]);
        let client = ProviderClient::new(transport.clone(), &settings(3, 2), CancellationToken::new());

        let start = Instant::now();
        let rows = client.fetch("Pilots", None, &[]).await.expect("fetch succeeds");
        let elapsed = start.elapsed();

        assert_eq!(rows.len(), 2);
        assert_eq!(transport.calls(), 3);
        // 500ms + 1000ms of backoff; the 2 rps bucket never has to wait here.
        assert!(elapsed >= Duration::from_millis(1500), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(1600), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_surface_after_retry_budget() {
        let transport = ScriptedTransport::new(vec![
            Err(rate_limited()),
            Err(rate_limited()),
            Err(rate_limited()),
        ]);
        let client = ProviderClient::new(transport.clone(), &settings(2, 5), CancellationToken::new());

        let err = client.fetch("Pilots", None, &[]).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::RateLimited);
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_are_not_retried() {
        let transport = ScriptedTransport::new(vec![Err(ProviderError::new(
            ErrorCode::TableNotFound,
            "no such table",
        ))]);
        let client = ProviderClient::new(transport.clone(), &settings(3, 5), CancellationToken::new());

        let err = client.fetch("Pilots", None, &[]).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::TableNotFound);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_backoff() {
        let transport = ScriptedTransport::new(vec![Err(rate_limited()), Err(rate_limited())]);
        let cancel = CancellationToken::new();
        let client = ProviderClient::new(transport.clone(), &settings(10, 5), cancel.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });
        let err = client.fetch("Pilots", None, &[]).await.unwrap_err();
        canceller.await.unwrap();

        assert!(err.is_cancelled());
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn fetch_follows_offsets_and_forwards_filter() {
        let transport = ScriptedTransport::new(vec![
            Ok(page(&["a", "b"], Some("next"))),
            Ok(page(&["c"], None)),
        ]);
        let client = ProviderClient::new(transport.clone(), &settings(0, 50), CancellationToken::new());
        let since = chrono::Utc::now();
        let filter = ModifiedSince {
            field: "Last Modified".into(),
            since,
        };

        let rows = client
            .fetch("Pilots", Some(&filter), &["Callsign".to_string()])
            .await
            .unwrap();
        assert_eq!(rows.len(), 3);

        let requests = transport.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].offset, None);
        assert_eq!(requests[1].offset.as_deref(), Some("next"));
        assert_eq!(requests[1].modified_since.as_ref().unwrap().since, since);
        assert_eq!(requests[1].fields, vec!["Callsign".to_string()]);
    }

    #[tokio::test]
    async fn probe_reports_empty_tables() {
        let transport = ScriptedTransport::new(vec![Ok(page(&[], None)), Ok(page(&["x"], None))]);
        let client = ProviderClient::new(transport, &settings(0, 50), CancellationToken::new());
        assert_eq!(
            client.probe("Routes").await.unwrap_err().code(),
            ErrorCode::TableEmpty
        );
        assert!(client.probe("Routes").await.is_ok());
    }

    #[tokio::test]
    async fn sample_truncates_to_limit() {
        let transport = ScriptedTransport::new(vec![Ok(page(&["a", "b", "c"], Some("more")))]);
        let client = ProviderClient::new(transport.clone(), &settings(0, 50), CancellationToken::new());
        let rows = client.sample("Pilots", &[], 2).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(transport.requests.lock().unwrap()[0].max_records, Some(2));
    }
}
