//! Administrative JSON surface: job status and on-demand triggers, config
//! validation and activation, latest validation results.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use flightsync_core::{
    ErrorCode, ProviderType, SyncError, TenantProviderConfig, ValidationHistoryRecord,
    ValidationTrigger,
};
use flightsync_storage::{StoreError, SyncStore};
use flightsync_sync::{
    ConfigService, ConfigValidator, JobRegistry, LifecycleError, TriggerError, ValidateError,
};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "flightsync-web";

pub struct AppState {
    pub registry: JobRegistry,
    pub validator: Arc<ConfigValidator>,
    pub configs: ConfigService,
    pub store: Arc<dyn SyncStore>,
}

impl AppState {
    pub fn new(
        registry: JobRegistry,
        validator: Arc<ConfigValidator>,
        store: Arc<dyn SyncStore>,
    ) -> Self {
        Self {
            registry,
            validator,
            configs: ConfigService::new(store.clone()),
            store,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ValidationQuery {
    version: Option<i32>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/jobs", get(jobs_handler))
        .route("/jobs/{job}/trigger", post(trigger_handler))
        .route(
            "/tenants/{tenant_id}/configs/{provider}/versions/{version}/validate",
            post(validate_handler),
        )
        .route(
            "/tenants/{tenant_id}/configs/{provider}/versions/{version}/activate",
            post(activate_handler),
        )
        .route(
            "/tenants/{tenant_id}/configs/{provider}/validation",
            get(latest_validation_handler),
        )
        .with_state(Arc::new(state))
}

/// Serve until `shutdown` is cancelled.
pub async fn serve(addr: SocketAddr, state: AppState, shutdown: CancellationToken) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "admin surface listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn health_handler() -> Response {
    Json(json!({"status": "ok", "service": CRATE_NAME})).into_response()
}

async fn jobs_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.registry.status().await).into_response()
}

async fn trigger_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(job): AxumPath<String>,
) -> Response {
    match state.registry.trigger_named(&job).await {
        Ok(run_id) => {
            info!(job = %job, run_id = %run_id, "sync triggered");
            (
                StatusCode::ACCEPTED,
                Json(json!({"job": job, "run_id": run_id})),
            )
                .into_response()
        }
        Err(err) => {
            let status = match err {
                TriggerError::UnknownJob(_) | TriggerError::NotScheduled(_) => StatusCode::NOT_FOUND,
                TriggerError::Stopped(_) => StatusCode::SERVICE_UNAVAILABLE,
            };
            error_response(status, ErrorCode::Unknown, err.to_string())
        }
    }
}

async fn validate_handler(
    State(state): State<Arc<AppState>>,
    AxumPath((tenant_id, provider, version)): AxumPath<(Uuid, String, i32)>,
) -> Response {
    let Some(provider_type) = ProviderType::parse(&provider) else {
        return unknown_provider(&provider);
    };
    match state
        .validator
        .validate(tenant_id, provider_type, version, ValidationTrigger::Api)
        .await
    {
        Ok(result) => Json(validation_view(&result.config, &result.record)).into_response(),
        Err(err) => {
            let status = match &err {
                ValidateError::ConfigNotFound { .. } => StatusCode::NOT_FOUND,
                ValidateError::Store(StoreError::InvalidTransition { .. }) => StatusCode::CONFLICT,
                ValidateError::Aborted(_) | ValidateError::Store(_) => status_for(err.code()),
            };
            error_response(status, err.code(), err.to_string())
        }
    }
}

async fn activate_handler(
    State(state): State<Arc<AppState>>,
    AxumPath((tenant_id, provider, version)): AxumPath<(Uuid, String, i32)>,
) -> Response {
    let Some(provider_type) = ProviderType::parse(&provider) else {
        return unknown_provider(&provider);
    };
    match state.configs.activate(tenant_id, provider_type, version).await {
        Ok(config) => Json(config_view(&config)).into_response(),
        Err(err) => lifecycle_error(err),
    }
}

async fn latest_validation_handler(
    State(state): State<Arc<AppState>>,
    AxumPath((tenant_id, provider)): AxumPath<(Uuid, String)>,
    Query(query): Query<ValidationQuery>,
) -> Response {
    let Some(provider_type) = ProviderType::parse(&provider) else {
        return unknown_provider(&provider);
    };
    match load_latest_validation(state.store.as_ref(), tenant_id, provider_type, query.version).await {
        Ok(Some((config, record))) => Json(validation_view(&config, &record)).into_response(),
        Ok(None) => error_response(
            StatusCode::NOT_FOUND,
            ErrorCode::ConfigNotFound,
            format!("no validation record for tenant {tenant_id} {provider_type} config"),
        ),
        Err(err) => server_error(err),
    }
}

/// Latest record of `version`, or of the newest version when none is given.
async fn load_latest_validation(
    store: &dyn SyncStore,
    tenant_id: Uuid,
    provider_type: ProviderType,
    version: Option<i32>,
) -> Result<Option<(TenantProviderConfig, ValidationHistoryRecord)>, StoreError> {
    let version = match version {
        Some(version) => version,
        None => match store.latest_config_version(tenant_id, provider_type).await? {
            Some(version) => version,
            None => return Ok(None),
        },
    };
    let Some(config) = store.find_config(tenant_id, provider_type, version).await? else {
        return Ok(None);
    };
    let record = store.validation_history(config.id, 1).await?.into_iter().next();
    Ok(record.map(|record| (config, record)))
}

fn validation_view(config: &TenantProviderConfig, record: &ValidationHistoryRecord) -> JsonValue {
    json!({
        "config": config_view(config),
        "status": record.status,
        "phases_completed": record.phases_completed,
        "phase_failed": record.phase_failed,
        "errors": record.errors.iter().map(error_view).collect::<Vec<_>>(),
        "warnings": record.warnings.iter().map(error_view).collect::<Vec<_>>(),
        "duration_ms": record.duration_ms,
        "triggered_by": record.triggered_by,
        "validated_at": record.created_at,
    })
}

fn config_view(config: &TenantProviderConfig) -> JsonValue {
    json!({
        "id": config.id,
        "tenant_id": config.tenant_id,
        "provider_type": config.provider_type,
        "version": config.version,
        "is_active": config.is_active,
        "validation_status": config.validation_status,
        "last_validated_at": config.last_validated_at,
    })
}

fn error_view(error: &SyncError) -> JsonValue {
    let mut view = serde_json::to_value(error).unwrap_or_else(|_| json!({"code": error.code}));
    if let Some(map) = view.as_object_mut() {
        map.insert("user_message".into(), json!(error.user_message()));
    }
    view
}

fn lifecycle_error(err: LifecycleError) -> Response {
    let status = match &err {
        LifecycleError::ConfigNotFound { .. } => StatusCode::NOT_FOUND,
        LifecycleError::NotValidated { .. } | LifecycleError::NotActive { .. } => StatusCode::CONFLICT,
        LifecycleError::Store(_) => status_for(err.code()),
    };
    error_response(status, err.code(), err.to_string())
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::ConfigNotFound => StatusCode::NOT_FOUND,
        ErrorCode::ConfigNotActive | ErrorCode::ConfigNotValidated => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn unknown_provider(provider: &str) -> Response {
    error_response(
        StatusCode::NOT_FOUND,
        ErrorCode::ConfigNotFound,
        format!("unknown provider type {provider:?}"),
    )
}

fn server_error(err: StoreError) -> Response {
    warn!(error = %err, "admin request failed");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, ErrorCode::Unknown, err.to_string())
}

fn error_response(status: StatusCode, code: ErrorCode, message: String) -> Response {
    (
        status,
        Json(json!({
            "code": code,
            "message": message,
            "user_message": code.message(),
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use flightsync_core::{Credentials, SyncSettings};
    use flightsync_provider::{
        FieldMeta, ProviderError, ProviderRecord, ProviderTransport, QueryPage, QueryRequest,
        TableMeta, TransportFactory,
    };
    use flightsync_storage::MemoryStore;
    use flightsync_sync::{Job, JobKind, JobRunSummary, RunContext, Scheduler};
    use http_body_util::BodyExt;
    use std::collections::{BTreeMap, BTreeSet};
    use std::time::Duration;
    use tower::ServiceExt;

    struct PilotsOnly;

    #[async_trait]
    impl ProviderTransport for PilotsOnly {
        async fn list_tables(&self) -> Result<Vec<TableMeta>, ProviderError> {
            Ok(vec![TableMeta {
                id: "tblPilots".into(),
                name: "Pilots".into(),
                fields: vec![FieldMeta {
                    name: "Callsign".into(),
                    field_type: "singleLineText".into(),
                }],
            }])
        }

        async fn query(&self, _request: &QueryRequest) -> Result<QueryPage, ProviderError> {
            let mut fields = serde_json::Map::new();
            fields.insert("Callsign".into(), json!("VAX001"));
            Ok(QueryPage {
                records: vec![ProviderRecord {
                    id: "rec1".into(),
                    created_time: None,
                    fields,
                }],
                offset: None,
            })
        }
    }

    impl TransportFactory for PilotsOnly {
        fn transport(
            &self,
            _credentials: &Credentials,
            _settings: &SyncSettings,
        ) -> Result<Arc<dyn ProviderTransport>, ProviderError> {
            Ok(Arc::new(PilotsOnly))
        }
    }

    struct IdleJob;

    #[async_trait]
    impl Job for IdleJob {
        fn kind(&self) -> JobKind {
            JobKind::PilotSync
        }

        async fn run(&self, ctx: &RunContext) -> anyhow::Result<JobRunSummary> {
            Ok(JobRunSummary::start(JobKind::PilotSync, ctx.run_id).finish())
        }
    }

    fn pilots_document() -> JsonValue {
        json!({
            "schema_version": 2,
            "credentials": {"api_key": "patTEST", "base_id": "appWEB"},
            "entities": [{
                "entity_type": "pilot",
                "table": "Pilots",
                "fields": [{"internal": "callsign", "provider": "Callsign", "required": true}]
            }],
            "sync": {"rate_limit_per_second": 50, "retry_attempts": 0}
        })
    }

    fn state_with(store: Arc<MemoryStore>, registry: JobRegistry) -> AppState {
        let validator = ConfigValidator::new(store.clone(), Arc::new(PilotsOnly));
        AppState::new(registry, Arc::new(validator), store)
    }

    fn idle_state() -> (Arc<MemoryStore>, AppState) {
        let store = Arc::new(MemoryStore::new());
        let registry = JobRegistry::new(BTreeMap::new(), store.clone());
        (store.clone(), state_with(store, registry))
    }

    async fn send(app: &Router, method: &str, uri: &str) -> (StatusCode, JsonValue) {
        let resp = app
            .clone()
            .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&body).unwrap_or(JsonValue::Null);
        (status, value)
    }

    #[tokio::test]
    async fn handler_smoke_health() {
        let (_, state) = idle_state();
        let (status, body) = send(&app(state), "GET", "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn trigger_and_list_jobs() {
        let store = Arc::new(MemoryStore::new());
        let mut scheduler = Scheduler::new(store.clone(), CancellationToken::new());
        scheduler.schedule(Arc::new(IdleJob), Duration::from_secs(3600));
        let app = app(state_with(store, scheduler.registry()));

        let (status, body) = send(&app, "POST", "/jobs/pilot/trigger").await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(body["run_id"].as_str().is_some());

        let (status, _) = send(&app, "POST", "/jobs/route/trigger").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&app, "POST", "/jobs/weather/trigger").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = send(&app, "GET", "/jobs").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["job"], "pilot_sync");
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn validate_then_activate() {
        let (store, state) = idle_state();
        let tenant = Uuid::new_v4();
        state
            .configs
            .submit(tenant, ProviderType::Airtable, pilots_document(), BTreeSet::new())
            .await
            .unwrap();
        let app = app(state);
        let base = format!("/tenants/{tenant}/configs/airtable");

        let (status, _) = send(&app, "POST", &format!("{base}/versions/1/activate")).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = send(&app, "POST", &format!("{base}/versions/1/validate")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "valid");
        assert_eq!(body["phases_completed"].as_array().unwrap().len(), 5);

        let (status, body) = send(&app, "POST", &format!("{base}/versions/1/activate")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["is_active"], true);

        let active = store.active_config(tenant, ProviderType::Airtable).await.unwrap();
        assert_eq!(active.map(|c| c.version), Some(1));
    }

    #[tokio::test]
    async fn latest_validation_carries_user_messages() {
        let (_, state) = idle_state();
        let tenant = Uuid::new_v4();
        state
            .configs
            .submit(tenant, ProviderType::Airtable, json!({"schema_version": 9}), BTreeSet::new())
            .await
            .unwrap();
        let app = app(state);
        let base = format!("/tenants/{tenant}/configs/airtable");

        let (status, _) = send(&app, "GET", &format!("{base}/validation")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = send(&app, "POST", &format!("{base}/versions/1/validate")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "invalid");

        let (status, body) = send(&app, "GET", &format!("{base}/validation")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["phase_failed"], "schema_parse");
        let first = &body["errors"][0];
        assert_eq!(first["code"], "SCHEMA_VERSION_UNSUPPORTED");
        assert_eq!(
            first["user_message"],
            ErrorCode::SchemaVersionUnsupported.message()
        );
    }

    #[tokio::test]
    async fn unknown_configs_and_providers_are_not_found() {
        let (_, state) = idle_state();
        let app = app(state);
        let tenant = Uuid::new_v4();

        let (status, body) = send(
            &app,
            "POST",
            &format!("/tenants/{tenant}/configs/airtable/versions/3/validate"),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "CONFIG_NOT_FOUND");

        let (status, _) = send(
            &app,
            "POST",
            &format!("/tenants/{tenant}/configs/notion/versions/1/activate"),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
