use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flightsync_core::{
    fields, BackfillStatus, EntityType, FlightReportLinks, MirrorRow, ProviderType, SyncCursor,
    SyncHistoryEvent, TenantProviderConfig, ValidationHistoryRecord, ValidationStatus,
};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    mirror_table, StoreError, StoreResult, SyncBatch, SyncEventFilter, SyncStore, UpsertOutcome,
};

type MirrorKey = (Uuid, EntityType, String);

#[derive(Debug, Default)]
struct MemoryState {
    configs: HashMap<Uuid, TenantProviderConfig>,
    history: Vec<ValidationHistoryRecord>,
    cursors: BTreeMap<(Uuid, EntityType), SyncCursor>,
    mirror: BTreeMap<MirrorKey, MirrorRow>,
    events: Vec<SyncHistoryEvent>,
}

/// In-process [`SyncStore`] with the same write semantics as PostgreSQL.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail as if the database were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }
}

#[async_trait]
impl SyncStore for MemoryStore {
    async fn insert_config(&self, config: &TenantProviderConfig) -> StoreResult<()> {
        self.check()?;
        let mut state = self.state.write().await;
        let clash = state.configs.values().any(|c| {
            c.tenant_id == config.tenant_id
                && c.provider_type == config.provider_type
                && c.version == config.version
        });
        if clash {
            return Err(StoreError::VersionConflict {
                tenant_id: config.tenant_id,
                provider_type: config.provider_type,
                version: config.version,
            });
        }
        state.configs.insert(config.id, config.clone());
        Ok(())
    }

    async fn get_config(&self, config_id: Uuid) -> StoreResult<Option<TenantProviderConfig>> {
        self.check()?;
        Ok(self.state.read().await.configs.get(&config_id).cloned())
    }

    async fn find_config(
        &self,
        tenant_id: Uuid,
        provider_type: ProviderType,
        version: i32,
    ) -> StoreResult<Option<TenantProviderConfig>> {
        self.check()?;
        let state = self.state.read().await;
        Ok(state
            .configs
            .values()
            .find(|c| {
                c.tenant_id == tenant_id && c.provider_type == provider_type && c.version == version
            })
            .cloned())
    }

    async fn latest_config_version(
        &self,
        tenant_id: Uuid,
        provider_type: ProviderType,
    ) -> StoreResult<Option<i32>> {
        self.check()?;
        let state = self.state.read().await;
        Ok(state
            .configs
            .values()
            .filter(|c| c.tenant_id == tenant_id && c.provider_type == provider_type)
            .map(|c| c.version)
            .max())
    }

    async fn list_configs(
        &self,
        tenant_id: Uuid,
        provider_type: ProviderType,
    ) -> StoreResult<Vec<TenantProviderConfig>> {
        self.check()?;
        let state = self.state.read().await;
        let mut out: Vec<_> = state
            .configs
            .values()
            .filter(|c| c.tenant_id == tenant_id && c.provider_type == provider_type)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.version.cmp(&a.version));
        Ok(out)
    }

    async fn active_config(
        &self,
        tenant_id: Uuid,
        provider_type: ProviderType,
    ) -> StoreResult<Option<TenantProviderConfig>> {
        self.check()?;
        let state = self.state.read().await;
        Ok(state
            .configs
            .values()
            .find(|c| c.tenant_id == tenant_id && c.provider_type == provider_type && c.is_active)
            .cloned())
    }

    async fn syncable_configs(
        &self,
        provider_type: ProviderType,
    ) -> StoreResult<Vec<TenantProviderConfig>> {
        self.check()?;
        let state = self.state.read().await;
        let mut out: Vec<_> = state
            .configs
            .values()
            .filter(|c| c.provider_type == provider_type && c.is_syncable())
            .cloned()
            .collect();
        out.sort_by_key(|c| c.tenant_id);
        Ok(out)
    }

    async fn begin_validation(
        &self,
        config_id: Uuid,
        stale_before: DateTime<Utc>,
    ) -> StoreResult<TenantProviderConfig> {
        self.check()?;
        let mut state = self.state.write().await;
        let config = state
            .configs
            .get_mut(&config_id)
            .ok_or(StoreError::ConfigNotFound(config_id))?;
        let abandoned = config.validation_status == ValidationStatus::Validating
            && config.updated_at < stale_before;
        if !abandoned
            && !config
                .validation_status
                .can_transition_to(ValidationStatus::Validating)
        {
            return Err(StoreError::InvalidTransition {
                config_id,
                from: config.validation_status,
                to: ValidationStatus::Validating,
            });
        }
        config.validation_status = ValidationStatus::Validating;
        config.updated_at = Utc::now();
        Ok(config.clone())
    }

    async fn complete_validation(
        &self,
        record: &ValidationHistoryRecord,
    ) -> StoreResult<TenantProviderConfig> {
        self.check()?;
        let mut state = self.state.write().await;
        let config = state
            .configs
            .get_mut(&record.config_id)
            .ok_or(StoreError::ConfigNotFound(record.config_id))?;
        if !config.validation_status.can_transition_to(record.status) {
            return Err(StoreError::InvalidTransition {
                config_id: record.config_id,
                from: config.validation_status,
                to: record.status,
            });
        }
        config.validation_status = record.status;
        config.last_validated_at = Some(record.created_at);
        config.validation_errors = record.errors.clone();
        config.is_active = config.is_active && record.status == ValidationStatus::Valid;
        config.updated_at = Utc::now();
        let updated = config.clone();
        state.history.push(record.clone());
        Ok(updated)
    }

    async fn activate_config(&self, config_id: Uuid) -> StoreResult<TenantProviderConfig> {
        self.check()?;
        let mut state = self.state.write().await;
        let target = state
            .configs
            .get(&config_id)
            .ok_or(StoreError::ConfigNotFound(config_id))?;
        if target.validation_status != ValidationStatus::Valid {
            return Err(StoreError::NotValidated {
                config_id,
                status: target.validation_status,
            });
        }
        let (tenant_id, provider_type) = (target.tenant_id, target.provider_type);
        let now = Utc::now();
        for config in state.configs.values_mut() {
            if config.tenant_id == tenant_id && config.provider_type == provider_type {
                let active = config.id == config_id;
                if config.is_active != active {
                    config.is_active = active;
                    config.updated_at = now;
                }
            }
        }
        state
            .configs
            .get(&config_id)
            .cloned()
            .ok_or(StoreError::ConfigNotFound(config_id))
    }

    async fn deactivate_config(&self, config_id: Uuid) -> StoreResult<TenantProviderConfig> {
        self.check()?;
        let mut state = self.state.write().await;
        let config = state
            .configs
            .get_mut(&config_id)
            .ok_or(StoreError::ConfigNotFound(config_id))?;
        config.is_active = false;
        config.updated_at = Utc::now();
        Ok(config.clone())
    }

    async fn validation_history(
        &self,
        config_id: Uuid,
        limit: i64,
    ) -> StoreResult<Vec<ValidationHistoryRecord>> {
        self.check()?;
        let state = self.state.read().await;
        Ok(state
            .history
            .iter()
            .rev()
            .filter(|r| r.config_id == config_id)
            .take(usize::try_from(limit).unwrap_or(0))
            .cloned()
            .collect())
    }

    async fn get_cursor(
        &self,
        tenant_id: Uuid,
        entity_type: EntityType,
    ) -> StoreResult<Option<SyncCursor>> {
        self.check()?;
        Ok(self
            .state
            .read()
            .await
            .cursors
            .get(&(tenant_id, entity_type))
            .cloned())
    }

    async fn list_cursors(&self, entity_type: EntityType) -> StoreResult<Vec<SyncCursor>> {
        self.check()?;
        let state = self.state.read().await;
        Ok(state
            .cursors
            .values()
            .filter(|c| c.entity_type == entity_type)
            .cloned()
            .collect())
    }

    async fn apply_sync_batch(&self, batch: &SyncBatch) -> StoreResult<UpsertOutcome> {
        self.check()?;
        mirror_table(batch.entity_type)?;
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let now = Utc::now();
        let mut outcome = UpsertOutcome::default();
        let is_report = batch.entity_type == EntityType::FlightReport;

        for row in &batch.rows {
            let key = (
                batch.tenant_id,
                batch.entity_type,
                row.provider_record_id.clone(),
            );
            let links = is_report.then(|| row.links.unwrap_or_default());
            match state.mirror.get_mut(&key) {
                Some(existing) if existing.content_hash == row.content_hash => {
                    outcome.unchanged += 1;
                }
                Some(existing) => {
                    existing.fields = row.fields.clone();
                    existing.content_hash = row.content_hash.clone();
                    existing.provider_modified_at = row.provider_modified_at;
                    existing.synced_at = now;
                    existing.links = links;
                    outcome.updated += 1;
                }
                None => {
                    state.mirror.insert(
                        key,
                        MirrorRow {
                            id: Uuid::new_v4(),
                            tenant_id: batch.tenant_id,
                            entity_type: batch.entity_type,
                            provider_record_id: row.provider_record_id.clone(),
                            fields: row.fields.clone(),
                            content_hash: row.content_hash.clone(),
                            provider_modified_at: row.provider_modified_at,
                            synced_at: now,
                            links,
                        },
                    );
                    outcome.inserted += 1;
                }
            }
        }

        let cursor_key = (batch.tenant_id, batch.entity_type);
        if let Some(candidate) = batch.cursor {
            let next = match state.cursors.get(&cursor_key) {
                Some(existing) => existing.advanced_to(candidate),
                None => candidate,
            };
            state.cursors.insert(
                cursor_key,
                SyncCursor {
                    tenant_id: batch.tenant_id,
                    entity_type: batch.entity_type,
                    last_synced_at: next,
                    updated_at: now,
                },
            );
        }
        outcome.cursor = state.cursors.get(&cursor_key).map(|c| c.last_synced_at);
        Ok(outcome)
    }

    async fn get_mirror_row(
        &self,
        tenant_id: Uuid,
        entity_type: EntityType,
        provider_record_id: &str,
    ) -> StoreResult<Option<MirrorRow>> {
        self.check()?;
        mirror_table(entity_type)?;
        let state = self.state.read().await;
        Ok(state
            .mirror
            .get(&(tenant_id, entity_type, provider_record_id.to_string()))
            .cloned())
    }

    async fn count_mirror_rows(
        &self,
        tenant_id: Uuid,
        entity_type: EntityType,
    ) -> StoreResult<u64> {
        self.check()?;
        mirror_table(entity_type)?;
        let state = self.state.read().await;
        Ok(state
            .mirror
            .values()
            .filter(|r| r.tenant_id == tenant_id && r.entity_type == entity_type)
            .count() as u64)
    }

    async fn find_pilot_by_callsign(
        &self,
        tenant_id: Uuid,
        callsign: &str,
    ) -> StoreResult<Option<Uuid>> {
        self.check()?;
        let wanted = callsign.trim();
        let state = self.state.read().await;
        Ok(state
            .mirror
            .values()
            .filter(|r| r.tenant_id == tenant_id && r.entity_type == EntityType::Pilot)
            .filter(|r| {
                r.field_str(fields::CALLSIGN)
                    .is_some_and(|c| c.eq_ignore_ascii_case(wanted))
            })
            .max_by_key(|r| r.synced_at)
            .map(|r| r.id))
    }

    async fn find_route(
        &self,
        tenant_id: Uuid,
        origin: &str,
        destination: &str,
    ) -> StoreResult<Option<Uuid>> {
        self.check()?;
        let (origin, destination) = (origin.trim(), destination.trim());
        let state = self.state.read().await;
        Ok(state
            .mirror
            .values()
            .filter(|r| r.tenant_id == tenant_id && r.entity_type == EntityType::Route)
            .filter(|r| {
                r.field_str(fields::ORIGIN)
                    .is_some_and(|o| o.eq_ignore_ascii_case(origin))
                    && r.field_str(fields::DESTINATION)
                        .is_some_and(|d| d.eq_ignore_ascii_case(destination))
            })
            .max_by_key(|r| r.synced_at)
            .map(|r| r.id))
    }

    async fn unresolved_flight_reports(&self, limit: i64) -> StoreResult<Vec<MirrorRow>> {
        self.check()?;
        let state = self.state.read().await;
        let mut rows: Vec<_> = state
            .mirror
            .values()
            .filter(|r| r.entity_type == EntityType::FlightReport)
            .filter(|r| {
                r.links
                    .is_some_and(|l| l.backfill_status == BackfillStatus::Unresolved)
            })
            .cloned()
            .collect();
        rows.sort_by_key(|r| (r.tenant_id, r.synced_at));
        rows.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(rows)
    }

    async fn update_flight_report_links(
        &self,
        row_id: Uuid,
        links: FlightReportLinks,
    ) -> StoreResult<()> {
        self.check()?;
        let mut state = self.state.write().await;
        if let Some(row) = state
            .mirror
            .values_mut()
            .find(|r| r.id == row_id && r.entity_type == EntityType::FlightReport)
        {
            row.links = Some(links);
        }
        Ok(())
    }

    async fn append_sync_event(&self, event: &SyncHistoryEvent) -> StoreResult<()> {
        self.check()?;
        self.state.write().await.events.push(event.clone());
        Ok(())
    }

    async fn recent_sync_events(
        &self,
        filter: SyncEventFilter,
    ) -> StoreResult<Vec<SyncHistoryEvent>> {
        self.check()?;
        let state = self.state.read().await;
        Ok(state
            .events
            .iter()
            .rev()
            .filter(|e| filter.tenant_id.map_or(true, |t| e.tenant_id == t))
            .filter(|e| filter.entity_type.map_or(true, |t| e.entity_type == t))
            .take(usize::try_from(filter.limit).unwrap_or(0))
            .cloned()
            .collect())
    }
}
