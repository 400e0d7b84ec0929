//! Service Resource Pipeline Service
//!
//! Facade owning the catalog, store, provisioner and attribute sources.
//! Runs the pipeline stages for one CBU or many, and is the entry point for
//! intents, owner-system callbacks, retries and readiness queries.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use super::discovery::{run_discovery_pipeline, DiscoveryResult, PipelineResult, ResourceDiscoveryEngine};
use super::ledger::ProvisioningLedger;
use super::population::{AttributeSources, PopulationEngine, PopulationResult};
use super::provisioning::{
    run_provisioning_pipeline, FullPipelineResult, ProvisioningOrchestrator,
    ProvisioningOrchestratorResult, ResourceProvisioner, StubProvisioner,
};
use super::readiness::{ReadinessComputeResult, ReadinessEngine};
use super::rollup::{AttributeRollupEngine, RollupResult};
use super::srdef_loader::SrdefRegistry;
use super::store::{InstanceUpdate, MemoryStore, PipelineStore, StoreError};
use super::types::*;
use crate::config::PipelineConfig;

/// One full pipeline pass for a CBU.
#[derive(Debug, Serialize)]
pub struct CbuPipelineRun {
    pub cbu_id: Uuid,
    pub discovery: PipelineResult,
    pub provisioning: FullPipelineResult,
}

pub struct ServiceResourcePipelineService {
    store: Arc<dyn PipelineStore>,
    registry: Arc<SrdefRegistry>,
    provisioner: Arc<dyn ResourceProvisioner>,
    sources: Arc<AttributeSources>,
    config: PipelineConfig,
}

impl ServiceResourcePipelineService {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        registry: Arc<SrdefRegistry>,
        provisioner: Arc<dyn ResourceProvisioner>,
        sources: Arc<AttributeSources>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            registry,
            provisioner,
            sources,
            config,
        }
    }

    /// In-memory store, stub provisioner, no attribute sources.
    pub fn in_memory(registry: SrdefRegistry) -> Self {
        Self::new(
            Arc::new(MemoryStore::new()),
            Arc::new(registry),
            Arc::new(StubProvisioner),
            Arc::new(AttributeSources::new()),
            PipelineConfig::default(),
        )
    }

    pub fn with_sources(mut self, sources: Arc<AttributeSources>) -> Self {
        self.sources = sources;
        self
    }

    pub fn with_provisioner(mut self, provisioner: Arc<dyn ResourceProvisioner>) -> Self {
        self.provisioner = provisioner;
        self
    }

    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(&self) -> &dyn PipelineStore {
        self.store.as_ref()
    }

    pub fn registry(&self) -> &SrdefRegistry {
        &self.registry
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn orchestrator(&self) -> ProvisioningOrchestrator<'_> {
        ProvisioningOrchestrator::new(self.store.as_ref(), &self.registry, self.provisioner.as_ref())
    }

    // =========================================================================
    // INTENTS AND FACTS
    // =========================================================================

    /// Record a new service intent (version 1).
    pub async fn declare_intent(&self, input: NewServiceIntent) -> Result<ServiceIntent> {
        let intent = ServiceIntent {
            intent_id: Uuid::now_v7(),
            cbu_id: input.cbu_id,
            product_code: input.product_code,
            service_code: input.service_code,
            options: input.options,
            status: ServiceIntentStatus::Active,
            version: 1,
            superseded_by: None,
            created_at: Utc::now(),
            created_by: input.created_by,
        };
        let intent = self
            .store
            .insert_intent(intent)
            .await
            .context("Failed to declare service intent")?;
        info!(
            "Declared intent {} for CBU {}: {}/{}",
            intent.intent_id, intent.cbu_id, intent.product_code, intent.service_code
        );
        self.store.mark_readiness_stale(intent.cbu_id, "intent").await?;
        Ok(intent)
    }

    /// Replace an intent's options with a new version.
    pub async fn supersede_intent(
        &self,
        intent_id: Uuid,
        options: IntentOptions,
        created_by: Option<String>,
    ) -> Result<ServiceIntent> {
        let current = self
            .store
            .get_intent(intent_id)
            .await?
            .ok_or(StoreError::NotFound {
                entity: "intent",
                id: intent_id.to_string(),
            })?;
        let replacement = ServiceIntent {
            intent_id: Uuid::now_v7(),
            options,
            status: ServiceIntentStatus::Active,
            version: current.version + 1,
            superseded_by: None,
            created_at: Utc::now(),
            created_by,
            ..current
        };
        let replacement = self.store.supersede_intent(intent_id, replacement).await?;
        info!(
            "Intent {} superseded by {} (version {})",
            intent_id, replacement.intent_id, replacement.version
        );
        self.store.mark_readiness_stale(replacement.cbu_id, "intent").await?;
        Ok(replacement)
    }

    pub async fn cancel_intent(&self, intent_id: Uuid) -> Result<ServiceIntent> {
        self.set_intent_status(intent_id, ServiceIntentStatus::Cancelled).await
    }

    pub async fn suspend_intent(&self, intent_id: Uuid) -> Result<ServiceIntent> {
        self.set_intent_status(intent_id, ServiceIntentStatus::Suspended).await
    }

    pub async fn resume_intent(&self, intent_id: Uuid) -> Result<ServiceIntent> {
        self.set_intent_status(intent_id, ServiceIntentStatus::Active).await
    }

    async fn set_intent_status(
        &self,
        intent_id: Uuid,
        status: ServiceIntentStatus,
    ) -> Result<ServiceIntent> {
        let intent = self.store.set_intent_status(intent_id, status).await?;
        info!("Intent {} is now {}", intent_id, status);
        self.store.mark_readiness_stale(intent.cbu_id, "intent").await?;
        Ok(intent)
    }

    /// CBU / entity facts consulted by conditions.
    pub async fn put_cbu_facts(&self, cbu_id: Uuid, facts: CbuFacts) -> Result<()> {
        self.store.put_cbu_facts(cbu_id, facts).await?;
        self.store.mark_readiness_stale(cbu_id, "facts").await?;
        Ok(())
    }

    // =========================================================================
    // STAGES
    // =========================================================================

    pub async fn discover(&self, cbu_id: Uuid) -> Result<DiscoveryResult> {
        ResourceDiscoveryEngine::new(self.store.as_ref(), &self.registry)
            .discover_for_cbu(cbu_id)
            .await
    }

    pub async fn rollup(&self, cbu_id: Uuid) -> Result<RollupResult> {
        AttributeRollupEngine::new(self.store.as_ref(), &self.registry)
            .rollup_for_cbu(cbu_id)
            .await
    }

    pub async fn populate(&self, cbu_id: Uuid) -> Result<PopulationResult> {
        PopulationEngine::new(self.store.as_ref(), &self.registry, &self.sources)
            .populate_for_cbu(cbu_id)
            .await
    }

    pub async fn provision(&self, cbu_id: Uuid) -> Result<ProvisioningOrchestratorResult> {
        self.orchestrator().provision_for_cbu(cbu_id).await
    }

    pub async fn compute_readiness(&self, cbu_id: Uuid, trigger: &str) -> Result<ReadinessComputeResult> {
        ReadinessEngine::new(self.store.as_ref(), &self.registry)
            .compute_for_cbu(cbu_id, trigger)
            .await
    }

    /// Discovery → rollup → population → provisioning → readiness.
    pub async fn run_full_pipeline(&self, cbu_id: Uuid) -> Result<CbuPipelineRun> {
        info!("Running service resource pipeline for CBU {}", cbu_id);
        let discovery =
            run_discovery_pipeline(self.store.as_ref(), &self.registry, &self.sources, cbu_id)
                .await
                .with_context(|| format!("Discovery pipeline failed for CBU {}", cbu_id))?;
        let provisioning = run_provisioning_pipeline(
            self.store.as_ref(),
            &self.registry,
            self.provisioner.as_ref(),
            cbu_id,
        )
        .await
        .with_context(|| format!("Provisioning pipeline failed for CBU {}", cbu_id))?;

        info!(
            "Pipeline complete for CBU {}: {} requirements, {} attrs missing, {} requests created, {} ready / {} partial / {} blocked",
            cbu_id,
            discovery.srdefs_discovered,
            discovery.attrs_missing,
            provisioning.requests_created,
            provisioning.services_ready,
            provisioning.services_partial,
            provisioning.services_blocked
        );
        Ok(CbuPipelineRun {
            cbu_id,
            discovery,
            provisioning,
        })
    }

    /// Run the pipeline for many CBUs concurrently. One CBU's failure does
    /// not affect the others.
    pub async fn run_for_cbus(&self, cbu_ids: &[Uuid]) -> Vec<(Uuid, Result<CbuPipelineRun>)> {
        let mut results: Vec<(Uuid, Result<CbuPipelineRun>)> = stream::iter(cbu_ids.iter().copied())
            .map(|cbu_id| async move { (cbu_id, self.run_full_pipeline(cbu_id).await) })
            .buffer_unordered(self.config.max_concurrency.max(1))
            .collect()
            .await;
        for (cbu_id, result) in &results {
            if let Err(e) = result {
                warn!("Pipeline failed for CBU {}: {:#}", cbu_id, e);
            }
        }
        results.sort_by_key(|(cbu_id, _)| *cbu_id);
        results
    }

    // =========================================================================
    // PROVISIONING CALLBACKS
    // =========================================================================

    /// Ingest an owner-system event, then advance dependents and recompute
    /// readiness when it changed anything.
    pub async fn ingest_event(&self, event: InboundEvent) -> Result<IngestResult> {
        let result = self.orchestrator().ingest_event(event).await?;
        if result.duplicate {
            return Ok(result);
        }
        if let Some(request) = self.store.get_request(result.outcome.request_id).await? {
            if matches!(result.outcome.disposition, EventDisposition::Applied { .. }) {
                self.provision(request.cbu_id).await?;
            }
            self.compute_readiness(request.cbu_id, "provisioning_event").await?;
        }
        Ok(result)
    }

    pub async fn retry_request(
        &self,
        request_id: Uuid,
        reason: &str,
        requested_by: RequestedBy,
    ) -> Result<ProvisioningRequest> {
        let request = self
            .orchestrator()
            .retry_request(request_id, reason, requested_by)
            .await?;
        self.compute_readiness(request.cbu_id, "provisioning_retry").await?;
        Ok(request)
    }

    /// In-flight requests past the configured SLA.
    pub async fn overdue_requests(&self, now: DateTime<Utc>) -> Result<Vec<ProvisioningRequest>> {
        self.orchestrator()
            .overdue_requests(now, self.config.provisioning_sla_chrono())
            .await
    }

    pub async fn request_history(&self, request_id: Uuid) -> Result<Vec<ProvisioningEvent>> {
        ProvisioningLedger::new(self.store.as_ref()).history(request_id).await
    }

    // =========================================================================
    // INSTANCE LIFECYCLE
    // =========================================================================

    pub async fn suspend_instance(&self, instance_id: Uuid) -> Result<ResourceInstance> {
        self.update_instance(instance_id, InstanceUpdate::Suspend).await
    }

    pub async fn resume_instance(&self, instance_id: Uuid) -> Result<ResourceInstance> {
        self.update_instance(instance_id, InstanceUpdate::Resume).await
    }

    pub async fn decommission_instance(&self, instance_id: Uuid) -> Result<ResourceInstance> {
        self.update_instance(instance_id, InstanceUpdate::Decommission).await
    }

    async fn update_instance(
        &self,
        instance_id: Uuid,
        update: InstanceUpdate,
    ) -> Result<ResourceInstance> {
        let instance = self.store.update_instance(instance_id, update).await?;
        info!(
            "Instance {} ({}) is now {}",
            instance_id, instance.requirement_key, instance.status
        );
        self.store
            .mark_readiness_stale(instance.cbu_id, "instance_lifecycle")
            .await?;
        Ok(instance)
    }

    // =========================================================================
    // READINESS
    // =========================================================================

    /// Current readiness for a CBU, recomputed first if stale or absent.
    pub async fn readiness(&self, cbu_id: Uuid) -> Result<Vec<CbuServiceReadiness>> {
        let records = self.store.readiness(cbu_id).await?;
        let intents = self.store.active_intents(cbu_id).await?;
        if records.len() == intents.len() && records.iter().all(|r| !r.is_stale) {
            return Ok(records);
        }
        self.compute_readiness(cbu_id, "readiness_query").await?;
        Ok(self.store.readiness(cbu_id).await?)
    }

    pub async fn refresh_stale_readiness(&self) -> Result<Vec<(Uuid, ReadinessComputeResult)>> {
        ReadinessEngine::new(self.store.as_ref(), &self.registry)
            .refresh_stale()
            .await
    }
}
