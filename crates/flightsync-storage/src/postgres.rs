use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flightsync_core::{
    BackfillStatus, EntityType, FlightReportLinks, MirrorRow, ProviderType, SyncCursor,
    SyncError, SyncHistoryEvent, TenantProviderConfig, ValidationHistoryRecord, ValidationPhase,
    ValidationStatus,
};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    decode_enum, mirror_table, MirrorUpsert, StoreError, StoreResult, SyncBatch, SyncEventFilter,
    SyncStore, UpsertOutcome,
};

const CONFIG_COLUMNS: &str = "id, tenant_id, provider_type, version, document, is_active, \
     validation_status, enabled_features, last_validated_at, validation_errors, created_at, \
     updated_at";

const MIRROR_COLUMNS: &str =
    "id, tenant_id, provider_record_id, fields, content_hash, provider_modified_at, synced_at";

const FLIGHT_REPORT_COLUMNS: &str = "id, tenant_id, provider_record_id, fields, content_hash, \
     provider_modified_at, synced_at, pilot_id, route_id, backfill_status, backfill_attempts";

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgSyncStore {
    pool: PgPool,
}

impl PgSyncStore {
    pub async fn connect(database_url: &str, settings: &PoolSettings) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections.max(1))
            .min_connections(settings.min_connections.min(settings.max_connections))
            .acquire_timeout(settings.acquire_timeout)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }

    async fn lock_config(
        tx: &mut Transaction<'_, Postgres>,
        config_id: Uuid,
    ) -> StoreResult<TenantProviderConfig> {
        let row = sqlx::query(&format!(
            "SELECT {CONFIG_COLUMNS} FROM tenant_provider_configs WHERE id = $1 FOR UPDATE"
        ))
        .bind(config_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(StoreError::ConfigNotFound(config_id))?;
        config_from_row(&row)
    }

    async fn upsert_row(
        tx: &mut Transaction<'_, Postgres>,
        table: &str,
        tenant_id: Uuid,
        row: &MirrorUpsert,
    ) -> StoreResult<Option<bool>> {
        let sql = format!(
            r#"
            INSERT INTO {table} AS t
                (id, tenant_id, provider_record_id, fields, content_hash, provider_modified_at, synced_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW())
            ON CONFLICT (tenant_id, provider_record_id) DO UPDATE
               SET fields = EXCLUDED.fields,
                   content_hash = EXCLUDED.content_hash,
                   provider_modified_at = EXCLUDED.provider_modified_at,
                   synced_at = EXCLUDED.synced_at
             WHERE t.content_hash IS DISTINCT FROM EXCLUDED.content_hash
            RETURNING (xmax = 0) AS inserted
            "#
        );
        let written = sqlx::query(&sql)
            .bind(Uuid::new_v4())
            .bind(tenant_id)
            .bind(&row.provider_record_id)
            .bind(JsonValue::Object(row.fields.clone()))
            .bind(&row.content_hash)
            .bind(row.provider_modified_at)
            .fetch_optional(&mut **tx)
            .await?;
        written
            .map(|r| r.try_get::<bool, _>("inserted"))
            .transpose()
            .map_err(StoreError::from)
    }

    async fn upsert_flight_report(
        tx: &mut Transaction<'_, Postgres>,
        tenant_id: Uuid,
        row: &MirrorUpsert,
    ) -> StoreResult<Option<bool>> {
        let links = row.links.unwrap_or_default();
        let written = sqlx::query(
            r#"
            INSERT INTO synced_flight_reports AS t
                (id, tenant_id, provider_record_id, fields, content_hash, provider_modified_at,
                 synced_at, pilot_id, route_id, backfill_status, backfill_attempts)
            VALUES ($1, $2, $3, $4, $5, $6, NOW(), $7, $8, $9, $10)
            ON CONFLICT (tenant_id, provider_record_id) DO UPDATE
               SET fields = EXCLUDED.fields,
                   content_hash = EXCLUDED.content_hash,
                   provider_modified_at = EXCLUDED.provider_modified_at,
                   synced_at = EXCLUDED.synced_at,
                   pilot_id = EXCLUDED.pilot_id,
                   route_id = EXCLUDED.route_id,
                   backfill_status = EXCLUDED.backfill_status,
                   backfill_attempts = EXCLUDED.backfill_attempts
             WHERE t.content_hash IS DISTINCT FROM EXCLUDED.content_hash
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(tenant_id)
        .bind(&row.provider_record_id)
        .bind(JsonValue::Object(row.fields.clone()))
        .bind(&row.content_hash)
        .bind(row.provider_modified_at)
        .bind(links.pilot_id)
        .bind(links.route_id)
        .bind(links.backfill_status.as_i16())
        .bind(links.backfill_attempts)
        .fetch_optional(&mut **tx)
        .await?;
        written
            .map(|r| r.try_get::<bool, _>("inserted"))
            .transpose()
            .map_err(StoreError::from)
    }
}

#[async_trait]
impl SyncStore for PgSyncStore {
    async fn insert_config(&self, config: &TenantProviderConfig) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO tenant_provider_configs
                (id, tenant_id, provider_type, version, document, is_active, validation_status,
                 enabled_features, last_validated_at, validation_errors, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(config.id)
        .bind(config.tenant_id)
        .bind(config.provider_type.as_str())
        .bind(config.version)
        .bind(&config.document)
        .bind(config.is_active)
        .bind(config.validation_status.as_str())
        .bind(config.enabled_features.iter().cloned().collect::<Vec<_>>())
        .bind(config.last_validated_at)
        .bind(Json(&config.validation_errors))
        .bind(config.created_at)
        .bind(config.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::VersionConflict {
                    tenant_id: config.tenant_id,
                    provider_type: config.provider_type,
                    version: config.version,
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn get_config(&self, config_id: Uuid) -> StoreResult<Option<TenantProviderConfig>> {
        let row = sqlx::query(&format!(
            "SELECT {CONFIG_COLUMNS} FROM tenant_provider_configs WHERE id = $1"
        ))
        .bind(config_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(config_from_row).transpose()
    }

    async fn find_config(
        &self,
        tenant_id: Uuid,
        provider_type: ProviderType,
        version: i32,
    ) -> StoreResult<Option<TenantProviderConfig>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {CONFIG_COLUMNS}
              FROM tenant_provider_configs
             WHERE tenant_id = $1 AND provider_type = $2 AND version = $3
            "#
        ))
        .bind(tenant_id)
        .bind(provider_type.as_str())
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(config_from_row).transpose()
    }

    async fn latest_config_version(
        &self,
        tenant_id: Uuid,
        provider_type: ProviderType,
    ) -> StoreResult<Option<i32>> {
        let latest: Option<i32> = sqlx::query_scalar(
            r#"
            SELECT MAX(version)
              FROM tenant_provider_configs
             WHERE tenant_id = $1 AND provider_type = $2
            "#,
        )
        .bind(tenant_id)
        .bind(provider_type.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(latest)
    }

    async fn list_configs(
        &self,
        tenant_id: Uuid,
        provider_type: ProviderType,
    ) -> StoreResult<Vec<TenantProviderConfig>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {CONFIG_COLUMNS}
              FROM tenant_provider_configs
             WHERE tenant_id = $1 AND provider_type = $2
             ORDER BY version DESC
            "#
        ))
        .bind(tenant_id)
        .bind(provider_type.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(config_from_row).collect()
    }

    async fn active_config(
        &self,
        tenant_id: Uuid,
        provider_type: ProviderType,
    ) -> StoreResult<Option<TenantProviderConfig>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {CONFIG_COLUMNS}
              FROM tenant_provider_configs
             WHERE tenant_id = $1 AND provider_type = $2 AND is_active
            "#
        ))
        .bind(tenant_id)
        .bind(provider_type.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(config_from_row).transpose()
    }

    async fn syncable_configs(
        &self,
        provider_type: ProviderType,
    ) -> StoreResult<Vec<TenantProviderConfig>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {CONFIG_COLUMNS}
              FROM tenant_provider_configs
             WHERE provider_type = $1 AND is_active AND validation_status = 'valid'
             ORDER BY tenant_id
            "#
        ))
        .bind(provider_type.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(config_from_row).collect()
    }

    async fn begin_validation(
        &self,
        config_id: Uuid,
        stale_before: DateTime<Utc>,
    ) -> StoreResult<TenantProviderConfig> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE tenant_provider_configs
               SET validation_status = 'validating',
                   updated_at = NOW()
             WHERE id = $1
               AND (validation_status <> 'validating' OR updated_at < $2)
            RETURNING {CONFIG_COLUMNS}
            "#
        ))
        .bind(config_id)
        .bind(stale_before)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => config_from_row(&row),
            None => match self.get_config(config_id).await? {
                Some(config) => Err(StoreError::InvalidTransition {
                    config_id,
                    from: config.validation_status,
                    to: ValidationStatus::Validating,
                }),
                None => Err(StoreError::ConfigNotFound(config_id)),
            },
        }
    }

    async fn complete_validation(
        &self,
        record: &ValidationHistoryRecord,
    ) -> StoreResult<TenantProviderConfig> {
        let mut tx = self.pool.begin().await?;
        let current = Self::lock_config(&mut tx, record.config_id).await?;
        if !current.validation_status.can_transition_to(record.status) {
            return Err(StoreError::InvalidTransition {
                config_id: record.config_id,
                from: current.validation_status,
                to: record.status,
            });
        }

        let row = sqlx::query(&format!(
            r#"
            UPDATE tenant_provider_configs
               SET validation_status = $2,
                   last_validated_at = $3,
                   validation_errors = $4,
                   is_active = is_active AND $2::text = 'valid',
                   updated_at = NOW()
             WHERE id = $1
            RETURNING {CONFIG_COLUMNS}
            "#
        ))
        .bind(record.config_id)
        .bind(record.status.as_str())
        .bind(record.created_at)
        .bind(Json(&record.errors))
        .fetch_one(&mut *tx)
        .await?;
        let updated = config_from_row(&row)?;

        sqlx::query(
            r#"
            INSERT INTO validation_history
                (id, config_id, tenant_id, config_version, status, errors, warnings,
                 phases_completed, phase_failed, duration_ms, triggered_by, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(record.id)
        .bind(record.config_id)
        .bind(record.tenant_id)
        .bind(record.config_version)
        .bind(record.status.as_str())
        .bind(Json(&record.errors))
        .bind(Json(&record.warnings))
        .bind(Json(&record.phases_completed))
        .bind(record.phase_failed.map(|p| p.as_str()))
        .bind(to_i64(record.duration_ms))
        .bind(record.triggered_by.as_str())
        .bind(record.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        if current.is_active && !updated.is_active {
            info!(config_id = %updated.id, tenant_id = %updated.tenant_id, "active config failed validation; deactivated");
        }
        Ok(updated)
    }

    async fn activate_config(&self, config_id: Uuid) -> StoreResult<TenantProviderConfig> {
        let mut tx = self.pool.begin().await?;
        let current = Self::lock_config(&mut tx, config_id).await?;
        if current.validation_status != ValidationStatus::Valid {
            return Err(StoreError::NotValidated {
                config_id,
                status: current.validation_status,
            });
        }

        sqlx::query(
            r#"
            UPDATE tenant_provider_configs
               SET is_active = FALSE,
                   updated_at = NOW()
             WHERE tenant_id = $1 AND provider_type = $2 AND is_active AND id <> $3
            "#,
        )
        .bind(current.tenant_id)
        .bind(current.provider_type.as_str())
        .bind(config_id)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query(&format!(
            r#"
            UPDATE tenant_provider_configs
               SET is_active = TRUE,
                   updated_at = NOW()
             WHERE id = $1
            RETURNING {CONFIG_COLUMNS}
            "#
        ))
        .bind(config_id)
        .fetch_one(&mut *tx)
        .await?;
        let activated = config_from_row(&row)?;
        tx.commit().await?;
        Ok(activated)
    }

    async fn deactivate_config(&self, config_id: Uuid) -> StoreResult<TenantProviderConfig> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE tenant_provider_configs
               SET is_active = FALSE,
                   updated_at = NOW()
             WHERE id = $1
            RETURNING {CONFIG_COLUMNS}
            "#
        ))
        .bind(config_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::ConfigNotFound(config_id))?;
        config_from_row(&row)
    }

    async fn validation_history(
        &self,
        config_id: Uuid,
        limit: i64,
    ) -> StoreResult<Vec<ValidationHistoryRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, config_id, tenant_id, config_version, status, errors, warnings,
                   phases_completed, phase_failed, duration_ms, triggered_by, created_at
              FROM validation_history
             WHERE config_id = $1
             ORDER BY created_at DESC
             LIMIT $2
            "#,
        )
        .bind(config_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(validation_record_from_row).collect()
    }

    async fn get_cursor(
        &self,
        tenant_id: Uuid,
        entity_type: EntityType,
    ) -> StoreResult<Option<SyncCursor>> {
        let row = sqlx::query(
            r#"
            SELECT tenant_id, entity_type, last_synced_at, updated_at
              FROM sync_cursors
             WHERE tenant_id = $1 AND entity_type = $2
            "#,
        )
        .bind(tenant_id)
        .bind(entity_type.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(cursor_from_row).transpose()
    }

    async fn list_cursors(&self, entity_type: EntityType) -> StoreResult<Vec<SyncCursor>> {
        let rows = sqlx::query(
            r#"
            SELECT tenant_id, entity_type, last_synced_at, updated_at
              FROM sync_cursors
             WHERE entity_type = $1
             ORDER BY tenant_id
            "#,
        )
        .bind(entity_type.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(cursor_from_row).collect()
    }

    async fn apply_sync_batch(&self, batch: &SyncBatch) -> StoreResult<UpsertOutcome> {
        let table = mirror_table(batch.entity_type)?;
        let mut outcome = UpsertOutcome::default();
        let mut tx = self.pool.begin().await?;

        for row in &batch.rows {
            let written = if batch.entity_type == EntityType::FlightReport {
                Self::upsert_flight_report(&mut tx, batch.tenant_id, row).await?
            } else {
                Self::upsert_row(&mut tx, table, batch.tenant_id, row).await?
            };
            match written {
                Some(true) => outcome.inserted += 1,
                Some(false) => outcome.updated += 1,
                None => outcome.unchanged += 1,
            }
        }

        outcome.cursor = match batch.cursor {
            Some(candidate) => Some(
                sqlx::query_scalar(
                    r#"
                    INSERT INTO sync_cursors (tenant_id, entity_type, last_synced_at, updated_at)
                    VALUES ($1, $2, $3, NOW())
                    ON CONFLICT (tenant_id, entity_type) DO UPDATE
                       SET last_synced_at = GREATEST(sync_cursors.last_synced_at, EXCLUDED.last_synced_at),
                           updated_at = NOW()
                    RETURNING last_synced_at
                    "#,
                )
                .bind(batch.tenant_id)
                .bind(batch.entity_type.as_str())
                .bind(candidate)
                .fetch_one(&mut *tx)
                .await?,
            ),
            None => sqlx::query_scalar(
                r#"
                SELECT last_synced_at
                  FROM sync_cursors
                 WHERE tenant_id = $1 AND entity_type = $2
                "#,
            )
            .bind(batch.tenant_id)
            .bind(batch.entity_type.as_str())
            .fetch_optional(&mut *tx)
            .await?,
        };

        tx.commit().await?;
        debug!(
            tenant_id = %batch.tenant_id,
            entity_type = %batch.entity_type,
            inserted = outcome.inserted,
            updated = outcome.updated,
            unchanged = outcome.unchanged,
            "sync batch committed"
        );
        Ok(outcome)
    }

    async fn get_mirror_row(
        &self,
        tenant_id: Uuid,
        entity_type: EntityType,
        provider_record_id: &str,
    ) -> StoreResult<Option<MirrorRow>> {
        let table = mirror_table(entity_type)?;
        let columns = if entity_type == EntityType::FlightReport {
            FLIGHT_REPORT_COLUMNS
        } else {
            MIRROR_COLUMNS
        };
        let row = sqlx::query(&format!(
            "SELECT {columns} FROM {table} WHERE tenant_id = $1 AND provider_record_id = $2"
        ))
        .bind(tenant_id)
        .bind(provider_record_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref()
            .map(|r| mirror_row_from_row(r, entity_type))
            .transpose()
    }

    async fn count_mirror_rows(
        &self,
        tenant_id: Uuid,
        entity_type: EntityType,
    ) -> StoreResult<u64> {
        let table = mirror_table(entity_type)?;
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {table} WHERE tenant_id = $1"
        ))
        .bind(tenant_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(to_u64(count))
    }

    async fn find_pilot_by_callsign(
        &self,
        tenant_id: Uuid,
        callsign: &str,
    ) -> StoreResult<Option<Uuid>> {
        let id = sqlx::query_scalar(
            r#"
            SELECT id
              FROM synced_pilots
             WHERE tenant_id = $1 AND lower(fields->>'callsign') = lower($2)
             ORDER BY synced_at DESC
             LIMIT 1
            "#,
        )
        .bind(tenant_id)
        .bind(callsign.trim())
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    async fn find_route(
        &self,
        tenant_id: Uuid,
        origin: &str,
        destination: &str,
    ) -> StoreResult<Option<Uuid>> {
        let id = sqlx::query_scalar(
            r#"
            SELECT id
              FROM synced_routes
             WHERE tenant_id = $1
               AND upper(fields->>'origin') = upper($2)
               AND upper(fields->>'destination') = upper($3)
             ORDER BY synced_at DESC
             LIMIT 1
            "#,
        )
        .bind(tenant_id)
        .bind(origin.trim())
        .bind(destination.trim())
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    async fn unresolved_flight_reports(&self, limit: i64) -> StoreResult<Vec<MirrorRow>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {FLIGHT_REPORT_COLUMNS}
              FROM synced_flight_reports
             WHERE backfill_status = 0
             ORDER BY tenant_id, synced_at
             LIMIT $1
            "#
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| mirror_row_from_row(r, EntityType::FlightReport))
            .collect()
    }

    async fn update_flight_report_links(
        &self,
        row_id: Uuid,
        links: FlightReportLinks,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE synced_flight_reports
               SET pilot_id = $2,
                   route_id = $3,
                   backfill_status = $4,
                   backfill_attempts = $5
             WHERE id = $1
            "#,
        )
        .bind(row_id)
        .bind(links.pilot_id)
        .bind(links.route_id)
        .bind(links.backfill_status.as_i16())
        .bind(links.backfill_attempts)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_sync_event(&self, event: &SyncHistoryEvent) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_history
                (id, run_id, tenant_id, event_type, entity_type, status, previous_cursor, cursor,
                 records_fetched, records_inserted, records_updated, records_unchanged,
                 records_rejected, errors, duration_ms, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(event.id)
        .bind(event.run_id)
        .bind(event.tenant_id)
        .bind(&event.event_type)
        .bind(event.entity_type.as_str())
        .bind(event.status.as_str())
        .bind(event.previous_cursor)
        .bind(event.cursor)
        .bind(to_i64(event.records_fetched))
        .bind(to_i64(event.records_inserted))
        .bind(to_i64(event.records_updated))
        .bind(to_i64(event.records_unchanged))
        .bind(to_i64(event.records_rejected))
        .bind(Json(&event.errors))
        .bind(to_i64(event.duration_ms))
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_sync_events(
        &self,
        filter: SyncEventFilter,
    ) -> StoreResult<Vec<SyncHistoryEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT id, run_id, tenant_id, event_type, entity_type, status, previous_cursor,
                   cursor, records_fetched, records_inserted, records_updated,
                   records_unchanged, records_rejected, errors, duration_ms, created_at
              FROM sync_history
             WHERE ($1::uuid IS NULL OR tenant_id = $1)
               AND ($2::text IS NULL OR entity_type = $2)
             ORDER BY created_at DESC
             LIMIT $3
            "#,
        )
        .bind(filter.tenant_id)
        .bind(filter.entity_type.map(|e| e.as_str()))
        .bind(filter.limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(sync_event_from_row).collect()
    }
}

fn config_from_row(row: &PgRow) -> StoreResult<TenantProviderConfig> {
    let features: Vec<String> = row.try_get("enabled_features")?;
    let errors: Json<Vec<SyncError>> = row.try_get("validation_errors")?;
    Ok(TenantProviderConfig {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        provider_type: decode_enum("provider_type", row.try_get("provider_type")?)?,
        version: row.try_get("version")?,
        document: row.try_get("document")?,
        is_active: row.try_get("is_active")?,
        validation_status: decode_enum("validation_status", row.try_get("validation_status")?)?,
        enabled_features: features.into_iter().collect::<BTreeSet<_>>(),
        last_validated_at: row.try_get("last_validated_at")?,
        validation_errors: errors.0,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn validation_record_from_row(row: &PgRow) -> StoreResult<ValidationHistoryRecord> {
    let errors: Json<Vec<SyncError>> = row.try_get("errors")?;
    let warnings: Json<Vec<SyncError>> = row.try_get("warnings")?;
    let phases: Json<Vec<ValidationPhase>> = row.try_get("phases_completed")?;
    let phase_failed: Option<String> = row.try_get("phase_failed")?;
    let duration_ms: i64 = row.try_get("duration_ms")?;
    Ok(ValidationHistoryRecord {
        id: row.try_get("id")?,
        config_id: row.try_get("config_id")?,
        tenant_id: row.try_get("tenant_id")?,
        config_version: row.try_get("config_version")?,
        status: decode_enum("status", row.try_get("status")?)?,
        errors: errors.0,
        warnings: warnings.0,
        phases_completed: phases.0,
        phase_failed: phase_failed
            .map(|p| decode_enum("phase_failed", p))
            .transpose()?,
        duration_ms: to_u64(duration_ms),
        triggered_by: decode_enum("triggered_by", row.try_get("triggered_by")?)?,
        created_at: row.try_get("created_at")?,
    })
}

fn cursor_from_row(row: &PgRow) -> StoreResult<SyncCursor> {
    Ok(SyncCursor {
        tenant_id: row.try_get("tenant_id")?,
        entity_type: decode_enum("entity_type", row.try_get("entity_type")?)?,
        last_synced_at: row.try_get("last_synced_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn mirror_row_from_row(row: &PgRow, entity_type: EntityType) -> StoreResult<MirrorRow> {
    let fields = match row.try_get::<JsonValue, _>("fields")? {
        JsonValue::Object(map) => map,
        other => {
            return Err(StoreError::Corrupt {
                column: "fields",
                value: other.to_string(),
            })
        }
    };
    let links = if entity_type == EntityType::FlightReport {
        let status: i16 = row.try_get("backfill_status")?;
        Some(FlightReportLinks {
            pilot_id: row.try_get("pilot_id")?,
            route_id: row.try_get("route_id")?,
            backfill_status: BackfillStatus::from_i16(status).ok_or(StoreError::Corrupt {
                column: "backfill_status",
                value: status.to_string(),
            })?,
            backfill_attempts: row.try_get("backfill_attempts")?,
        })
    } else {
        None
    };
    let provider_modified_at: Option<DateTime<Utc>> = row.try_get("provider_modified_at")?;
    Ok(MirrorRow {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        entity_type,
        provider_record_id: row.try_get("provider_record_id")?,
        fields,
        content_hash: row.try_get("content_hash")?,
        provider_modified_at,
        synced_at: row.try_get("synced_at")?,
        links,
    })
}

fn sync_event_from_row(row: &PgRow) -> StoreResult<SyncHistoryEvent> {
    let errors: Json<Vec<SyncError>> = row.try_get("errors")?;
    let count = |column: &str| -> StoreResult<u64> { Ok(to_u64(row.try_get::<i64, _>(column)?)) };
    Ok(SyncHistoryEvent {
        id: row.try_get("id")?,
        run_id: row.try_get("run_id")?,
        tenant_id: row.try_get("tenant_id")?,
        event_type: row.try_get("event_type")?,
        entity_type: decode_enum("entity_type", row.try_get("entity_type")?)?,
        status: decode_enum("status", row.try_get("status")?)?,
        previous_cursor: row.try_get("previous_cursor")?,
        cursor: row.try_get("cursor")?,
        records_fetched: count("records_fetched")?,
        records_inserted: count("records_inserted")?,
        records_updated: count("records_updated")?,
        records_unchanged: count("records_unchanged")?,
        records_rejected: count("records_rejected")?,
        errors: errors.0,
        duration_ms: count("duration_ms")?,
        created_at: row.try_get("created_at")?,
    })
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}
