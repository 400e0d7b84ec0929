//! Postgres `PipelineStore`
//!
//! Records are stored whole as JSONB next to the columns queries filter on.
//! Multi-row invariants (one current intent per service, atomic requirement
//! sync, dependency-checked claims) run in a transaction holding a per-CBU
//! advisory lock. The event ledger is append-only at the database level
//! (see `migrations/001_service_resource_pipeline.sql`).

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{Postgres, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use super::discovery::plan_requirement_sync;
use super::ledger::apply_inbound;
use super::store::{
    apply_instance_update, AppendResult, ClaimOutcome, InstanceUpdate, LedgerEntry,
    PipelineStore, ReadinessKey, ReadinessWrite, RequirementSync, StoreError,
};
use super::types::*;
use crate::config::PipelineConfig;

const SCHEMA_SQL: &str = include_str!("../../migrations/001_service_resource_pipeline.sql");

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn not_found(entity: &'static str, id: impl ToString) -> StoreError {
    StoreError::NotFound {
        entity,
        id: id.to_string(),
    }
}

/// serde name of a unit enum variant, as stored in status columns.
fn label<T: Serialize>(value: &T) -> String {
    serde_json::to_value(value)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

type Tx<'c> = Transaction<'c, Postgres>;

async fn lock_cbu(tx: &mut Tx<'_>, cbu_id: Uuid) -> Result<(), StoreError> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1::text, 0))")
        .bind(cbu_id.to_string())
        .execute(&mut **tx)
        .await
        .map_err(backend)?;
    Ok(())
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect using `DATABASE_URL` / `DATABASE_POOL_SIZE`.
    pub async fn connect(config: &PipelineConfig) -> Result<Self> {
        let url = config
            .database_url
            .as_deref()
            .context("DATABASE_URL must be set for the Postgres store")?;
        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size)
            .connect(url)
            .await
            .context("Failed to connect to Postgres")?;
        info!("Connected Postgres pipeline store (pool size {})", config.pool_size);
        Ok(Self::new(pool))
    }

    /// Create tables and ledger triggers if missing.
    pub async fn apply_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA_SQL)
            .execute(&self.pool)
            .await
            .context("Failed to apply pipeline schema")?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn begin(&self) -> Result<Tx<'static>, StoreError> {
        self.pool.begin().await.map_err(backend)
    }

    async fn intent_for_update(
        tx: &mut Tx<'_>,
        intent_id: Uuid,
    ) -> Result<ServiceIntent, StoreError> {
        let row: Option<(Json<ServiceIntent>,)> = sqlx::query_as(
            r#"SELECT record FROM "ob-poc".service_intents WHERE intent_id = $1 FOR UPDATE"#,
        )
        .bind(intent_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(backend)?;
        row.map(|(Json(i),)| i).ok_or_else(|| not_found("intent", intent_id))
    }

    async fn save_intent(tx: &mut Tx<'_>, intent: &ServiceIntent) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO "ob-poc".service_intents
                (intent_id, cbu_id, product_code, service_code, version, created_at, record)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (intent_id) DO UPDATE SET record = EXCLUDED.record
            "#,
        )
        .bind(intent.intent_id)
        .bind(intent.cbu_id)
        .bind(&intent.product_code)
        .bind(&intent.service_code)
        .bind(intent.version as i32)
        .bind(intent.created_at)
        .bind(Json(intent))
        .execute(&mut **tx)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn cbu_instances(
        executor: &mut sqlx::PgConnection,
        cbu_id: Uuid,
    ) -> Result<Vec<ResourceInstance>, StoreError> {
        let rows: Vec<(Json<ResourceInstance>,)> = sqlx::query_as(
            r#"
            SELECT record FROM "ob-poc".cbu_resource_instances
            WHERE cbu_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(cbu_id)
        .fetch_all(executor)
        .await
        .map_err(backend)?;
        Ok(rows.into_iter().map(|(Json(i),)| i).collect())
    }

    async fn save_instance(tx: &mut Tx<'_>, instance: &ResourceInstance) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO "ob-poc".cbu_resource_instances
                (instance_id, cbu_id, requirement_key, created_at, record)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (instance_id) DO UPDATE SET record = EXCLUDED.record
            "#,
        )
        .bind(instance.instance_id)
        .bind(instance.cbu_id)
        .bind(&instance.requirement_key)
        .bind(instance.created_at)
        .bind(Json(instance))
        .execute(&mut **tx)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn instance_cbu(&self, instance_id: Uuid) -> Result<Uuid, StoreError> {
        let row: Option<(Uuid,)> = sqlx::query_as(
            r#"SELECT cbu_id FROM "ob-poc".cbu_resource_instances WHERE instance_id = $1"#,
        )
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        row.map(|(id,)| id).ok_or_else(|| not_found("instance", instance_id))
    }

    async fn save_request(
        tx: &mut Tx<'_>,
        request: &ProvisioningRequest,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO "ob-poc".provisioning_requests
                (request_id, cbu_id, status, requested_at, record)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (request_id) DO UPDATE
                SET status = EXCLUDED.status, record = EXCLUDED.record
            "#,
        )
        .bind(request.request_id)
        .bind(request.cbu_id)
        .bind(label(&request.status))
        .bind(request.requested_at)
        .bind(Json(request))
        .execute(&mut **tx)
        .await
        .map_err(backend)?;
        Ok(())
    }

    /// `false` when the event id or content hash is already taken.
    async fn insert_event(
        tx: &mut Tx<'_>,
        cbu_id: Uuid,
        event: &ProvisioningEvent,
        outcome: Option<&IngestOutcome>,
    ) -> Result<bool, StoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO "ob-poc".provisioning_events
                (event_id, cbu_id, request_id, occurred_at, content_hash, event, outcome)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(event.event_id)
        .bind(cbu_id)
        .bind(event.request_id)
        .bind(event.occurred_at)
        .bind(event.content_hash.as_deref())
        .bind(Json(event))
        .bind(outcome.map(Json))
        .execute(&mut **tx)
        .await
        .map_err(backend)?
        .rows_affected();
        Ok(inserted > 0)
    }

    /// The stored entry an append collided with. Fails when the collision
    /// is the same event id carrying different content.
    async fn recorded_entry(
        conn: &mut sqlx::PgConnection,
        event: &ProvisioningEvent,
    ) -> Result<LedgerEntry, StoreError> {
        let immutable = || StoreError::ImmutableEvent {
            event_id: event.event_id,
        };
        if let Some(hash) = event.content_hash.as_deref() {
            if let Some(existing) = Self::entry_by_hash(&mut *conn, hash).await? {
                if existing.event.event_id == event.event_id && existing.event != *event {
                    return Err(immutable());
                }
                return Ok(existing);
            }
        }
        let row: Option<(Uuid, Json<ProvisioningEvent>, Option<Json<IngestOutcome>>)> =
            sqlx::query_as(
                r#"
                SELECT cbu_id, event, outcome FROM "ob-poc".provisioning_events
                WHERE event_id = $1
                "#,
            )
            .bind(event.event_id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(backend)?;
        match row {
            Some((cbu_id, Json(existing), outcome)) if existing == *event => Ok(LedgerEntry {
                cbu_id,
                event: existing,
                outcome: outcome.map(|Json(o)| o),
            }),
            _ => Err(immutable()),
        }
    }

    async fn entry_by_hash(
        executor: &mut sqlx::PgConnection,
        content_hash: &str,
    ) -> Result<Option<LedgerEntry>, StoreError> {
        let row: Option<(Uuid, Json<ProvisioningEvent>, Option<Json<IngestOutcome>>)> =
            sqlx::query_as(
                r#"
                SELECT cbu_id, event, outcome FROM "ob-poc".provisioning_events
                WHERE content_hash = $1
                "#,
            )
            .bind(content_hash)
            .fetch_optional(executor)
            .await
            .map_err(backend)?;
        Ok(row.map(|(cbu_id, Json(event), outcome)| LedgerEntry {
            cbu_id,
            event,
            outcome: outcome.map(|Json(o)| o),
        }))
    }
}

#[async_trait]
impl PipelineStore for PgStore {
    async fn insert_intent(&self, intent: ServiceIntent) -> Result<ServiceIntent, StoreError> {
        let mut tx = self.begin().await?;
        lock_cbu(&mut tx, intent.cbu_id).await?;
        let existing: Vec<(Json<ServiceIntent>,)> = sqlx::query_as(
            r#"
            SELECT record FROM "ob-poc".service_intents
            WHERE cbu_id = $1 AND product_code = $2 AND service_code = $3
            "#,
        )
        .bind(intent.cbu_id)
        .bind(&intent.product_code)
        .bind(&intent.service_code)
        .fetch_all(&mut *tx)
        .await
        .map_err(backend)?;
        if let Some((Json(current),)) = existing.iter().find(|(Json(i),)| i.is_current()) {
            return Err(StoreError::DuplicateIntent {
                product_code: intent.product_code.clone(),
                service_code: intent.service_code.clone(),
                existing: current.intent_id,
            });
        }
        Self::save_intent(&mut tx, &intent).await?;
        tx.commit().await.map_err(backend)?;
        Ok(intent)
    }

    async fn supersede_intent(
        &self,
        intent_id: Uuid,
        replacement: ServiceIntent,
    ) -> Result<ServiceIntent, StoreError> {
        let mut tx = self.begin().await?;
        lock_cbu(&mut tx, replacement.cbu_id).await?;
        let mut old = Self::intent_for_update(&mut tx, intent_id).await?;
        if old.superseded_by.is_some() {
            return Err(StoreError::InvalidTransition {
                entity: "intent",
                from: "superseded".to_string(),
                to: "superseded".to_string(),
            });
        }
        old.superseded_by = Some(replacement.intent_id);
        Self::save_intent(&mut tx, &old).await?;
        Self::save_intent(&mut tx, &replacement).await?;
        tx.commit().await.map_err(backend)?;
        Ok(replacement)
    }

    async fn set_intent_status(
        &self,
        intent_id: Uuid,
        status: ServiceIntentStatus,
    ) -> Result<ServiceIntent, StoreError> {
        let mut tx = self.begin().await?;
        let mut intent = Self::intent_for_update(&mut tx, intent_id).await?;
        if intent.status == ServiceIntentStatus::Cancelled && status != ServiceIntentStatus::Cancelled {
            return Err(StoreError::InvalidTransition {
                entity: "intent",
                from: intent.status.to_string(),
                to: status.to_string(),
            });
        }
        intent.status = status;
        Self::save_intent(&mut tx, &intent).await?;
        tx.commit().await.map_err(backend)?;
        Ok(intent)
    }

    async fn get_intent(&self, intent_id: Uuid) -> Result<Option<ServiceIntent>, StoreError> {
        let row: Option<(Json<ServiceIntent>,)> = sqlx::query_as(
            r#"SELECT record FROM "ob-poc".service_intents WHERE intent_id = $1"#,
        )
        .bind(intent_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        Ok(row.map(|(Json(i),)| i))
    }

    async fn active_intents(&self, cbu_id: Uuid) -> Result<Vec<ServiceIntent>, StoreError> {
        let rows: Vec<(Json<ServiceIntent>,)> = sqlx::query_as(
            r#"
            SELECT record FROM "ob-poc".service_intents
            WHERE cbu_id = $1
            ORDER BY product_code, service_code, intent_id
            "#,
        )
        .bind(cbu_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        Ok(rows
            .into_iter()
            .map(|(Json(i),)| i)
            .filter(|i| i.is_current())
            .collect())
    }

    async fn put_cbu_facts(&self, cbu_id: Uuid, facts: CbuFacts) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO "ob-poc".cbu_facts (cbu_id, facts) VALUES ($1, $2)
            ON CONFLICT (cbu_id) DO UPDATE SET facts = EXCLUDED.facts
            "#,
        )
        .bind(cbu_id)
        .bind(Json(&facts))
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn cbu_facts(&self, cbu_id: Uuid) -> Result<CbuFacts, StoreError> {
        let row: Option<(Json<CbuFacts>,)> =
            sqlx::query_as(r#"SELECT facts FROM "ob-poc".cbu_facts WHERE cbu_id = $1"#)
                .bind(cbu_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)?;
        Ok(row.map(|(Json(f),)| f).unwrap_or_default())
    }

    async fn sync_requirements(
        &self,
        cbu_id: Uuid,
        desired: Vec<DiscoveredRequirement>,
        now: DateTime<Utc>,
    ) -> Result<RequirementSync, StoreError> {
        let mut tx = self.begin().await?;
        lock_cbu(&mut tx, cbu_id).await?;

        let rows: Vec<(Json<DiscoveredRequirement>,)> = sqlx::query_as(
            r#"
            SELECT record FROM "ob-poc".srdef_discovery_reasons
            WHERE cbu_id = $1 AND superseded_at IS NULL
            "#,
        )
        .bind(cbu_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(backend)?;
        let active: Vec<DiscoveredRequirement> = rows.into_iter().map(|(Json(r),)| r).collect();
        let plan = plan_requirement_sync(&active, desired);

        for old in active.iter().filter(|r| plan.supersede.contains(&r.discovery_id)) {
            let superseded = DiscoveredRequirement {
                superseded_at: Some(now),
                ..old.clone()
            };
            sqlx::query(
                r#"
                UPDATE "ob-poc".srdef_discovery_reasons
                SET superseded_at = $2, record = $3
                WHERE discovery_id = $1
                "#,
            )
            .bind(old.discovery_id)
            .bind(now)
            .bind(Json(&superseded))
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        }

        for new in &plan.insert {
            sqlx::query(
                r#"
                INSERT INTO "ob-poc".srdef_discovery_reasons
                    (discovery_id, cbu_id, srdef_id, requirement_key, discovered_at, superseded_at, record)
                VALUES ($1, $2, $3, $4, $5, NULL, $6)
                "#,
            )
            .bind(new.discovery_id)
            .bind(cbu_id)
            .bind(&new.srdef_id)
            .bind(new.requirement_key())
            .bind(new.discovered_at)
            .bind(Json(new))
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        }
        tx.commit().await.map_err(backend)?;

        let sync = RequirementSync {
            inserted: plan.insert.len(),
            superseded: plan.supersede.len(),
            unchanged: plan.unchanged,
        };
        debug!(
            "Requirement sync for CBU {}: {} inserted, {} superseded, {} unchanged",
            cbu_id, sync.inserted, sync.superseded, sync.unchanged
        );
        Ok(sync)
    }

    async fn active_requirements(
        &self,
        cbu_id: Uuid,
    ) -> Result<Vec<DiscoveredRequirement>, StoreError> {
        let rows: Vec<(Json<DiscoveredRequirement>,)> = sqlx::query_as(
            r#"
            SELECT record FROM "ob-poc".srdef_discovery_reasons
            WHERE cbu_id = $1 AND superseded_at IS NULL
            ORDER BY requirement_key
            "#,
        )
        .bind(cbu_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        Ok(rows.into_iter().map(|(Json(r),)| r).collect())
    }

    async fn requirement_history(
        &self,
        cbu_id: Uuid,
    ) -> Result<Vec<DiscoveredRequirement>, StoreError> {
        let rows: Vec<(Json<DiscoveredRequirement>,)> = sqlx::query_as(
            r#"
            SELECT record FROM "ob-poc".srdef_discovery_reasons
            WHERE cbu_id = $1
            ORDER BY discovered_at, discovery_id
            "#,
        )
        .bind(cbu_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        Ok(rows.into_iter().map(|(Json(r),)| r).collect())
    }

    async fn replace_unified_requirements(
        &self,
        cbu_id: Uuid,
        requirements: Vec<CbuUnifiedAttrRequirement>,
    ) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        sqlx::query(r#"DELETE FROM "ob-poc".cbu_unified_attr_requirements WHERE cbu_id = $1"#)
            .bind(cbu_id)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        for requirement in &requirements {
            sqlx::query(
                r#"
                INSERT INTO "ob-poc".cbu_unified_attr_requirements (cbu_id, attr_id, record)
                VALUES ($1, $2, $3)
                "#,
            )
            .bind(cbu_id)
            .bind(&requirement.attr_id)
            .bind(Json(requirement))
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        }
        tx.commit().await.map_err(backend)?;
        Ok(())
    }

    async fn unified_requirements(
        &self,
        cbu_id: Uuid,
    ) -> Result<Vec<CbuUnifiedAttrRequirement>, StoreError> {
        let rows: Vec<(Json<CbuUnifiedAttrRequirement>,)> = sqlx::query_as(
            r#"
            SELECT record FROM "ob-poc".cbu_unified_attr_requirements
            WHERE cbu_id = $1
            ORDER BY attr_id
            "#,
        )
        .bind(cbu_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        Ok(rows.into_iter().map(|(Json(r),)| r).collect())
    }

    async fn put_attr_value(&self, value: CbuAttrValue) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO "ob-poc".cbu_attr_values (cbu_id, attr_id, as_of, record)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (cbu_id, attr_id) DO UPDATE
                SET as_of = EXCLUDED.as_of, record = EXCLUDED.record
            "#,
        )
        .bind(value.cbu_id)
        .bind(&value.attr_id)
        .bind(value.as_of)
        .bind(Json(&value))
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn remove_attr_value(&self, cbu_id: Uuid, attr_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"DELETE FROM "ob-poc".cbu_attr_values WHERE cbu_id = $1 AND attr_id = $2"#,
        )
        .bind(cbu_id)
        .bind(attr_id)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(result.rows_affected() > 0)
    }

    async fn attr_values(&self, cbu_id: Uuid) -> Result<Vec<CbuAttrValue>, StoreError> {
        let rows: Vec<(Json<CbuAttrValue>,)> = sqlx::query_as(
            r#"
            SELECT record FROM "ob-poc".cbu_attr_values
            WHERE cbu_id = $1
            ORDER BY attr_id
            "#,
        )
        .bind(cbu_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        Ok(rows.into_iter().map(|(Json(v),)| v).collect())
    }

    async fn ensure_instance(
        &self,
        requirement: &DiscoveredRequirement,
    ) -> Result<ResourceInstance, StoreError> {
        let key = requirement.requirement_key();
        let mut tx = self.begin().await?;
        lock_cbu(&mut tx, requirement.cbu_id).await?;
        let instances = Self::cbu_instances(&mut *tx, requirement.cbu_id).await?;
        if let Some(existing) = current_instance(&instances, &key) {
            if existing.status != InstanceStatus::Decommissioned {
                return Ok(existing.clone());
            }
        }
        let now = Utc::now();
        let instance = ResourceInstance {
            instance_id: Uuid::now_v7(),
            cbu_id: requirement.cbu_id,
            srdef_id: requirement.srdef_id.clone(),
            requirement_key: key,
            parameters: requirement.parameters.clone(),
            status: InstanceStatus::Pending,
            srid: None,
            native_key: None,
            resource_url: None,
            last_request_id: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        };
        Self::save_instance(&mut tx, &instance).await?;
        tx.commit().await.map_err(backend)?;
        Ok(instance)
    }

    async fn get_instance(&self, instance_id: Uuid) -> Result<Option<ResourceInstance>, StoreError> {
        let row: Option<(Json<ResourceInstance>,)> = sqlx::query_as(
            r#"SELECT record FROM "ob-poc".cbu_resource_instances WHERE instance_id = $1"#,
        )
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        Ok(row.map(|(Json(i),)| i))
    }

    async fn instances(&self, cbu_id: Uuid) -> Result<Vec<ResourceInstance>, StoreError> {
        let mut conn = self.pool.acquire().await.map_err(backend)?;
        Self::cbu_instances(&mut *conn, cbu_id).await
    }

    async fn begin_provisioning(
        &self,
        instance_id: Uuid,
        dependency_keys: &[String],
    ) -> Result<ClaimOutcome, StoreError> {
        let cbu_id = self.instance_cbu(instance_id).await?;
        let mut tx = self.begin().await?;
        lock_cbu(&mut tx, cbu_id).await?;
        let instances = Self::cbu_instances(&mut *tx, cbu_id).await?;

        let unmet: Vec<String> = dependency_keys
            .iter()
            .filter(|key| !current_instance(&instances, key).is_some_and(|i| i.is_active()))
            .cloned()
            .collect();
        let mut instance = instances
            .into_iter()
            .find(|i| i.instance_id == instance_id)
            .ok_or_else(|| not_found("instance", instance_id))?;
        if instance.status != InstanceStatus::Pending {
            return Ok(ClaimOutcome::NotPending(instance.status));
        }
        if !unmet.is_empty() {
            return Ok(ClaimOutcome::DependenciesNotReady(unmet));
        }
        instance.status = InstanceStatus::Provisioning;
        instance.updated_at = Utc::now();
        Self::save_instance(&mut tx, &instance).await?;
        tx.commit().await.map_err(backend)?;
        Ok(ClaimOutcome::Claimed(instance))
    }

    async fn update_instance(
        &self,
        instance_id: Uuid,
        update: InstanceUpdate,
    ) -> Result<ResourceInstance, StoreError> {
        let mut tx = self.begin().await?;
        let row: Option<(Json<ResourceInstance>,)> = sqlx::query_as(
            r#"
            SELECT record FROM "ob-poc".cbu_resource_instances
            WHERE instance_id = $1
            FOR UPDATE
            "#,
        )
        .bind(instance_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(backend)?;
        let (Json(mut instance),) = row.ok_or_else(|| not_found("instance", instance_id))?;
        apply_instance_update(&mut instance, update, Utc::now())?;
        Self::save_instance(&mut tx, &instance).await?;
        tx.commit().await.map_err(backend)?;
        Ok(instance)
    }

    async fn insert_request(&self, request: ProvisioningRequest) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        Self::save_request(&mut tx, &request).await?;
        tx.commit().await.map_err(backend)?;
        Ok(())
    }

    async fn get_request(&self, request_id: Uuid) -> Result<Option<ProvisioningRequest>, StoreError> {
        let row: Option<(Json<ProvisioningRequest>,)> = sqlx::query_as(
            r#"SELECT record FROM "ob-poc".provisioning_requests WHERE request_id = $1"#,
        )
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        Ok(row.map(|(Json(r),)| r))
    }

    async fn requests_for_cbu(&self, cbu_id: Uuid) -> Result<Vec<ProvisioningRequest>, StoreError> {
        let rows: Vec<(Json<ProvisioningRequest>,)> = sqlx::query_as(
            r#"
            SELECT record FROM "ob-poc".provisioning_requests
            WHERE cbu_id = $1
            ORDER BY request_id
            "#,
        )
        .bind(cbu_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        Ok(rows.into_iter().map(|(Json(r),)| r).collect())
    }

    async fn set_request_status(
        &self,
        request_id: Uuid,
        status: ProvisioningStatus,
        owner_ticket_id: Option<String>,
    ) -> Result<ProvisioningRequest, StoreError> {
        let mut tx = self.begin().await?;
        let row: Option<(Json<ProvisioningRequest>,)> = sqlx::query_as(
            r#"
            SELECT record FROM "ob-poc".provisioning_requests
            WHERE request_id = $1
            FOR UPDATE
            "#,
        )
        .bind(request_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(backend)?;
        let (Json(mut request),) = row.ok_or_else(|| not_found("request", request_id))?;
        if request.status != status {
            if !request.status.can_transition_to(status) {
                return Err(StoreError::InvalidTransition {
                    entity: "request",
                    from: request.status.to_string(),
                    to: status.to_string(),
                });
            }
            request.status = status;
            request.status_changed_at = Utc::now();
        }
        if owner_ticket_id.is_some() {
            request.owner_ticket_id = owner_ticket_id;
        }
        Self::save_request(&mut tx, &request).await?;
        tx.commit().await.map_err(backend)?;
        Ok(request)
    }

    async fn in_flight_requests(&self) -> Result<Vec<ProvisioningRequest>, StoreError> {
        let rows: Vec<(Json<ProvisioningRequest>,)> = sqlx::query_as(
            r#"
            SELECT record FROM "ob-poc".provisioning_requests
            WHERE status IN ('queued', 'sent', 'ack')
            ORDER BY requested_at
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        Ok(rows.into_iter().map(|(Json(r),)| r).collect())
    }

    async fn append_event(
        &self,
        cbu_id: Uuid,
        event: ProvisioningEvent,
        outcome: Option<IngestOutcome>,
    ) -> Result<AppendResult, StoreError> {
        let mut tx = self.begin().await?;
        if Self::insert_event(&mut tx, cbu_id, &event, outcome.as_ref()).await? {
            tx.commit().await.map_err(backend)?;
            return Ok(AppendResult::Inserted(LedgerEntry {
                cbu_id,
                event,
                outcome,
            }));
        }
        let existing = Self::recorded_entry(&mut *tx, &event).await?;
        Ok(AppendResult::Duplicate(existing))
    }

    async fn ingest_inbound(
        &self,
        cbu_id: Uuid,
        event: ProvisioningEvent,
    ) -> Result<AppendResult, StoreError> {
        let mut tx = self.begin().await?;
        lock_cbu(&mut tx, cbu_id).await?;
        if let Some(hash) = event.content_hash.as_deref() {
            if Self::entry_by_hash(&mut *tx, hash).await?.is_some() {
                let existing = Self::recorded_entry(&mut *tx, &event).await?;
                return Ok(AppendResult::Duplicate(existing));
            }
        }

        let row: Option<(Json<ProvisioningRequest>,)> = sqlx::query_as(
            r#"
            SELECT record FROM "ob-poc".provisioning_requests
            WHERE request_id = $1
            FOR UPDATE
            "#,
        )
        .bind(event.request_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(backend)?;
        let (Json(mut request),) = row.ok_or_else(|| not_found("request", event.request_id))?;
        let outcome = apply_inbound(&mut request, &event, Utc::now());
        Self::save_request(&mut tx, &request).await?;

        if !Self::insert_event(&mut tx, cbu_id, &event, Some(&outcome)).await? {
            // Lost the hash to a concurrent delivery; dropping tx undoes the request change.
            let existing = Self::recorded_entry(&mut *tx, &event).await?;
            return Ok(AppendResult::Duplicate(existing));
        }
        tx.commit().await.map_err(backend)?;
        debug!(
            "Ingested {} for request {} ({:?})",
            outcome.kind, outcome.request_id, outcome.disposition
        );
        Ok(AppendResult::Inserted(LedgerEntry {
            cbu_id,
            event,
            outcome: Some(outcome),
        }))
    }

    async fn event_by_hash(&self, content_hash: &str) -> Result<Option<LedgerEntry>, StoreError> {
        let mut conn = self.pool.acquire().await.map_err(backend)?;
        Self::entry_by_hash(&mut *conn, content_hash).await
    }

    async fn events_for_request(
        &self,
        request_id: Uuid,
    ) -> Result<Vec<ProvisioningEvent>, StoreError> {
        let rows: Vec<(Json<ProvisioningEvent>,)> = sqlx::query_as(
            r#"
            SELECT event FROM "ob-poc".provisioning_events
            WHERE request_id = $1
            ORDER BY seq
            "#,
        )
        .bind(request_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        Ok(rows.into_iter().map(|(Json(e),)| e).collect())
    }

    async fn put_readiness(&self, record: CbuServiceReadiness) -> Result<ReadinessWrite, StoreError> {
        let mut tx = self.begin().await?;
        let stored: Option<(DateTime<Utc>,)> = sqlx::query_as(
            r#"
            SELECT as_of FROM "ob-poc".cbu_service_readiness
            WHERE cbu_id = $1 AND product_code = $2 AND service_code = $3
            FOR UPDATE
            "#,
        )
        .bind(record.cbu_id)
        .bind(&record.product_code)
        .bind(&record.service_code)
        .fetch_optional(&mut *tx)
        .await
        .map_err(backend)?;
        if let Some((stored_as_of,)) = stored {
            if stored_as_of > record.as_of {
                return Ok(ReadinessWrite::RejectedStale { stored_as_of });
            }
        }
        sqlx::query(
            r#"
            INSERT INTO "ob-poc".cbu_service_readiness
                (cbu_id, product_code, service_code, as_of, is_stale, record)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (cbu_id, product_code, service_code) DO UPDATE
                SET as_of = EXCLUDED.as_of, is_stale = EXCLUDED.is_stale, record = EXCLUDED.record
            "#,
        )
        .bind(record.cbu_id)
        .bind(&record.product_code)
        .bind(&record.service_code)
        .bind(record.as_of)
        .bind(record.is_stale)
        .bind(Json(&record))
        .execute(&mut *tx)
        .await
        .map_err(backend)?;
        tx.commit().await.map_err(backend)?;
        Ok(ReadinessWrite::Written)
    }

    async fn readiness(&self, cbu_id: Uuid) -> Result<Vec<CbuServiceReadiness>, StoreError> {
        let rows: Vec<(Json<CbuServiceReadiness>, bool)> = sqlx::query_as(
            r#"
            SELECT record, is_stale FROM "ob-poc".cbu_service_readiness
            WHERE cbu_id = $1
            ORDER BY product_code, service_code
            "#,
        )
        .bind(cbu_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        Ok(rows
            .into_iter()
            .map(|(Json(mut r), is_stale)| {
                r.is_stale = is_stale;
                r
            })
            .collect())
    }

    async fn mark_readiness_stale(&self, cbu_id: Uuid, trigger: &str) -> Result<usize, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE "ob-poc".cbu_service_readiness
            SET is_stale = TRUE,
                record = jsonb_set(record, '{recomputation_trigger}', to_jsonb($2::text))
            WHERE cbu_id = $1
            "#,
        )
        .bind(cbu_id)
        .bind(trigger)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(result.rows_affected() as usize)
    }

    async fn stale_readiness(&self) -> Result<Vec<ReadinessKey>, StoreError> {
        let rows: Vec<(Uuid, String, String)> = sqlx::query_as(
            r#"
            SELECT cbu_id, product_code, service_code FROM "ob-poc".cbu_service_readiness
            WHERE is_stale
            ORDER BY cbu_id, product_code, service_code
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        Ok(rows)
    }

    async fn retain_readiness(
        &self,
        cbu_id: Uuid,
        services: &[(String, String)],
    ) -> Result<usize, StoreError> {
        let (products, codes): (Vec<String>, Vec<String>) = services.iter().cloned().unzip();
        let result = sqlx::query(
            r#"
            DELETE FROM "ob-poc".cbu_service_readiness r
            WHERE r.cbu_id = $1
              AND NOT EXISTS (
                  SELECT 1 FROM UNNEST($2::text[], $3::text[]) AS keep(product_code, service_code)
                  WHERE keep.product_code = r.product_code AND keep.service_code = r.service_code
              )
            "#,
        )
        .bind(cbu_id)
        .bind(&products)
        .bind(&codes)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(result.rows_affected() as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> PgStore {
        let config = PipelineConfig::from_env().unwrap();
        let store = PgStore::connect(&config).await.unwrap();
        store.apply_schema().await.unwrap();
        store
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_ledger_rejects_update() {
        let store = store().await;
        let request_id = Uuid::now_v7();
        let event = ProvisioningEvent {
            event_id: Uuid::now_v7(),
            request_id,
            occurred_at: Utc::now(),
            direction: EventDirection::In,
            payload: EventPayload::Ack {
                owner_ticket_id: None,
            },
            content_hash: Some(format!("test-{}", request_id)),
        };
        let first = store.append_event(Uuid::nil(), event.clone(), None).await.unwrap();
        assert!(matches!(first, AppendResult::Inserted(_)));
        let again = store.append_event(Uuid::nil(), event.clone(), None).await.unwrap();
        assert!(matches!(again, AppendResult::Duplicate(_)));

        let tampered = ProvisioningEvent {
            payload: EventPayload::Ack {
                owner_ticket_id: Some("tampered".to_string()),
            },
            ..event.clone()
        };
        let err = store.append_event(Uuid::nil(), tampered, None).await.unwrap_err();
        assert!(matches!(err, StoreError::ImmutableEvent { .. }));

        let update = sqlx::query(
            r#"UPDATE "ob-poc".provisioning_events SET occurred_at = now() WHERE event_id = $1"#,
        )
        .bind(event.event_id)
        .execute(store.pool())
        .await;
        assert!(update.is_err());
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_stale_readiness_write_rejected() {
        let store = store().await;
        let now = Utc::now();
        let record = CbuServiceReadiness {
            cbu_id: Uuid::now_v7(),
            product_code: "CUSTODY".to_string(),
            service_code: "SAFEKEEPING".to_string(),
            status: ReadinessStatus::Ready,
            blocking_reasons: vec![],
            required_srdefs: vec![],
            active_srids: vec![],
            as_of: now,
            last_recomputed_at: now,
            recomputation_trigger: None,
            is_stale: false,
        };
        assert_eq!(store.put_readiness(record.clone()).await.unwrap(), ReadinessWrite::Written);
        let older = CbuServiceReadiness {
            as_of: now - chrono::Duration::seconds(5),
            ..record
        };
        assert!(matches!(
            store.put_readiness(older).await.unwrap(),
            ReadinessWrite::RejectedStale { .. }
        ));
    }
}
