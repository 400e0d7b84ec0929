//! Provisioning Orchestrator
//!
//! Handles:
//! 1. Eligibility checks (required attrs present, required dependencies ACTIVE)
//! 2. Layered provisioning in dependency order, concurrent within a layer
//! 3. Strategy dispatch (create / request / discover)
//! 4. Inbound owner-system events and explicit retries

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::condition::{condition_context, parse_condition};
use super::ledger::{
    content_hash, failure_reason, idempotency_key, IngestError, ProvisioningLedger,
};
use super::readiness::{ReadinessComputeResult, ReadinessEngine};
use super::srdef_loader::{LoadedSrdef, SrdefRegistry};
use super::store::{AppendResult, ClaimOutcome, InstanceUpdate, PipelineStore};
use super::types::*;

pub const DEFAULT_MAX_CONCURRENCY: usize = 8;

#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error("provisioning request {0} not found")]
    UnknownRequest(Uuid),

    #[error("only failed requests can be retried (request is {0})")]
    NotRetryable(ProvisioningStatus),

    #[error("request already retried as {0}")]
    AlreadyRetried(Uuid),

    #[error("requirement {0} is no longer required")]
    NoLongerRequired(String),

    #[error("dependencies not ready: {}", .0.join(", "))]
    DependenciesNotReady(Vec<String>),

    #[error("instance is {0}, expected PENDING")]
    InstanceNotPending(InstanceStatus),
}

// =============================================================================
// DEPENDENCY RESOLUTION
// =============================================================================

/// A requirement's dependency edges resolved to active requirement keys.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DependencyKeys {
    /// Must be ACTIVE before the requirement may provision.
    pub gating: Vec<String>,
    /// Required SRDEFs with no matching active requirement.
    pub undiscovered: Vec<String>,
    /// inject_arg → candidate dependency keys
    pub bindings: Vec<(String, Vec<String>)>,
}

/// Resolve `srdef`'s edges against the active requirement set.
///
/// A dependency requirement matches when it agrees with the dependent on
/// every parameter both carry. Conditional edges only gate when discovery
/// actually followed them from this requirement.
pub fn dependency_keys(
    srdef: &LoadedSrdef,
    requirement: &DiscoveredRequirement,
    active: &[DiscoveredRequirement],
) -> DependencyKeys {
    let parent_key = requirement.requirement_key();
    let mut keys = DependencyKeys::default();

    for dep in &srdef.dependencies {
        let candidates = active.iter().filter(|d| {
            d.srdef_id == dep.depends_on && d.parameters_compatible(&requirement.parameters)
        });
        let mut matching: Vec<String> = match dep.dependency_type {
            DependencyType::Conditional => candidates
                .filter(|d| {
                    d.reason.rules.iter().any(|r| {
                        matches!(r, DiscoveryRule::Dependency { parent, .. } if *parent == parent_key)
                    })
                })
                .map(|d| d.requirement_key())
                .collect(),
            _ => candidates.map(|d| d.requirement_key()).collect(),
        };
        matching.sort();

        match dep.dependency_type {
            DependencyType::Required if matching.is_empty() => {
                keys.undiscovered.push(dep.depends_on.clone())
            }
            DependencyType::Required | DependencyType::Conditional => {
                keys.gating.extend(matching.iter().cloned())
            }
            DependencyType::Optional => {}
        }
        if let Some(arg) = &dep.inject_arg {
            if !matching.is_empty() {
                keys.bindings.push((arg.clone(), matching));
            }
        }
    }

    keys.gating.sort();
    keys.gating.dedup();
    keys
}

/// Group requirements into layers; every gating dependency of a
/// requirement sits in an earlier layer.
pub fn layer_requirements<'r>(
    registry: &SrdefRegistry,
    active: &'r [DiscoveredRequirement],
) -> Vec<Vec<&'r DiscoveredRequirement>> {
    let by_key: HashMap<String, &DiscoveredRequirement> =
        active.iter().map(|r| (r.requirement_key(), r)).collect();
    let gating: HashMap<String, Vec<String>> = active
        .iter()
        .map(|r| {
            let deps = registry
                .get(&r.srdef_id)
                .map(|s| dependency_keys(s, r, active).gating)
                .unwrap_or_default();
            (r.requirement_key(), deps)
        })
        .collect();

    fn depth(
        key: &str,
        gating: &HashMap<String, Vec<String>>,
        memo: &mut HashMap<String, usize>,
        visiting: &mut HashSet<String>,
    ) -> usize {
        if let Some(d) = memo.get(key) {
            return *d;
        }
        if !visiting.insert(key.to_string()) {
            return 0;
        }
        let d = gating
            .get(key)
            .map(|deps| {
                deps.iter()
                    .map(|dep| depth(dep, gating, memo, visiting) + 1)
                    .max()
                    .unwrap_or(0)
            })
            .unwrap_or(0);
        visiting.remove(key);
        memo.insert(key.to_string(), d);
        d
    }

    let mut memo = HashMap::new();
    let mut layers: BTreeMap<usize, Vec<&DiscoveredRequirement>> = BTreeMap::new();
    let mut keys: Vec<&String> = by_key.keys().collect();
    keys.sort();
    for key in keys {
        let d = depth(key, &gating, &mut memo, &mut HashSet::new());
        layers.entry(d).or_default().push(by_key[key]);
    }
    layers.into_values().collect()
}

// =============================================================================
// PROVISIONING ORCHESTRATOR
// =============================================================================

/// Why a requirement was not provisioned this run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum NotReadyReason {
    UnknownSrdef,
    MissingAttrs { attr_ids: Vec<String> },
    AttrConflict { attr_ids: Vec<String> },
    DependencyNotDiscovered { srdef_ids: Vec<String> },
    DependencyNotReady { depends_on: Vec<String> },
    AwaitingRetry { request_id: Uuid },
    Suspended,
    Decommissioned,
}

impl std::fmt::Display for NotReadyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownSrdef => write!(f, "SRDEF not in catalog"),
            Self::MissingAttrs { attr_ids } => write!(f, "missing attrs: {}", attr_ids.join(", ")),
            Self::AttrConflict { attr_ids } => {
                write!(f, "conflicting attrs: {}", attr_ids.join(", "))
            }
            Self::DependencyNotDiscovered { srdef_ids } => {
                write!(f, "dependencies not discovered: {}", srdef_ids.join(", "))
            }
            Self::DependencyNotReady { depends_on } => {
                write!(f, "dependencies not active: {}", depends_on.join(", "))
            }
            Self::AwaitingRetry { request_id } => {
                write!(f, "request {} failed, awaiting retry", request_id)
            }
            Self::Suspended => write!(f, "instance suspended"),
            Self::Decommissioned => write!(f, "instance decommissioned"),
        }
    }
}

/// What happened to one requirement during a provisioning run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RequirementOutcome {
    AlreadyActive,
    InFlight { request_id: Option<Uuid> },
    Activated { instance_id: Uuid, srid: String },
    RequestSent { request_id: Uuid },
    NotReady { reason: NotReadyReason },
    Failed { reason: String },
}

/// Result of provisioning orchestration
#[derive(Debug, Default, Serialize)]
pub struct ProvisioningOrchestratorResult {
    pub layers: usize,
    pub requests_created: usize,
    pub created_request_ids: Vec<Uuid>,
    pub activated: usize,
    pub already_active: usize,
    pub in_flight: usize,
    pub not_ready: usize,
    pub not_ready_reasons: Vec<(String, NotReadyReason)>,
    pub failed: usize,
    pub errors: Vec<String>,
    pub outcomes: BTreeMap<String, RequirementOutcome>,
}

impl ProvisioningOrchestratorResult {
    fn record(&mut self, key: String, outcome: RequirementOutcome) {
        match &outcome {
            RequirementOutcome::AlreadyActive => self.already_active += 1,
            RequirementOutcome::InFlight { .. } => self.in_flight += 1,
            RequirementOutcome::Activated { .. } => self.activated += 1,
            RequirementOutcome::RequestSent { request_id } => {
                self.requests_created += 1;
                self.created_request_ids.push(*request_id);
            }
            RequirementOutcome::NotReady { reason } => {
                self.not_ready += 1;
                self.not_ready_reasons.push((key.clone(), reason.clone()));
            }
            RequirementOutcome::Failed { reason } => {
                self.failed += 1;
                self.errors.push(format!("{}: {}", key, reason));
            }
        }
        self.outcomes.insert(key, outcome);
    }

    fn changed_anything(&self) -> bool {
        self.requests_created > 0 || self.activated > 0 || self.failed > 0
    }
}

/// Attribute state shared by every requirement of one run.
struct AttributeSnapshot {
    values: BTreeMap<String, serde_json::Value>,
    unified: HashMap<String, CbuUnifiedAttrRequirement>,
    facts: CbuFacts,
    options_by_intent: HashMap<Uuid, IntentOptions>,
}

/// Orchestrates provisioning of resources for a CBU
pub struct ProvisioningOrchestrator<'a> {
    store: &'a dyn PipelineStore,
    registry: &'a SrdefRegistry,
    provisioner: &'a dyn ResourceProvisioner,
    ledger: ProvisioningLedger<'a>,
    max_concurrency: usize,
}

impl<'a> ProvisioningOrchestrator<'a> {
    pub fn new(
        store: &'a dyn PipelineStore,
        registry: &'a SrdefRegistry,
        provisioner: &'a dyn ResourceProvisioner,
    ) -> Self {
        Self {
            store,
            registry,
            provisioner,
            ledger: ProvisioningLedger::new(store),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    /// Provision all eligible requirements for a CBU
    pub async fn provision_for_cbu(&self, cbu_id: Uuid) -> Result<ProvisioningOrchestratorResult> {
        info!("Starting provisioning orchestration for CBU {}", cbu_id);

        let discoveries = self
            .store
            .active_requirements(cbu_id)
            .await
            .context("Failed to load active requirements")?;
        if discoveries.is_empty() {
            info!("No requirements to provision for CBU {}", cbu_id);
            return Ok(ProvisioningOrchestratorResult::default());
        }

        let snapshot = AttributeSnapshot {
            values: self
                .store
                .attr_values(cbu_id)
                .await?
                .into_iter()
                .map(|v| (v.attr_id, v.value))
                .collect(),
            unified: self
                .store
                .unified_requirements(cbu_id)
                .await?
                .into_iter()
                .map(|u| (u.attr_id.clone(), u))
                .collect(),
            facts: self.store.cbu_facts(cbu_id).await?,
            options_by_intent: self
                .store
                .active_intents(cbu_id)
                .await?
                .into_iter()
                .map(|i| (i.intent_id, i.options))
                .collect(),
        };

        let layers = layer_requirements(self.registry, &discoveries);
        let mut result = ProvisioningOrchestratorResult {
            layers: layers.len(),
            ..Default::default()
        };

        for (depth, layer) in layers.iter().enumerate() {
            debug!(
                "Provisioning layer {} for CBU {} ({} requirements)",
                depth,
                cbu_id,
                layer.len()
            );
            let outcomes: Vec<(String, RequirementOutcome)> = stream::iter(
                layer
                    .iter()
                    .copied()
                    .map(|req| {
                        let snapshot = &snapshot;
                        let discoveries = &discoveries;
                        async move {
                            let outcome =
                                self.provision_requirement(req, discoveries, snapshot).await;
                            (req.requirement_key(), outcome)
                        }
                    })
                    .collect::<Vec<_>>(),
            )
            .buffer_unordered(self.max_concurrency)
            .collect()
            .await;
            for (key, outcome) in outcomes {
                result.record(key, outcome);
            }
        }
        result.created_request_ids.sort();
        result.not_ready_reasons.sort_by(|a, b| a.0.cmp(&b.0));
        result.errors.sort();

        if result.changed_anything() {
            self.store
                .mark_readiness_stale(cbu_id, "provisioning")
                .await?;
        }

        info!(
            "Provisioning orchestration complete for CBU {}: {} requests created, {} activated, {} already active, {} in flight, {} not ready, {} failed",
            cbu_id,
            result.requests_created,
            result.activated,
            result.already_active,
            result.in_flight,
            result.not_ready,
            result.failed
        );

        Ok(result)
    }

    async fn provision_requirement(
        &self,
        req: &DiscoveredRequirement,
        active: &[DiscoveredRequirement],
        snapshot: &AttributeSnapshot,
    ) -> RequirementOutcome {
        match self.try_provision(req, active, snapshot).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Provisioning {} failed: {:#}", req.requirement_key(), e);
                RequirementOutcome::Failed {
                    reason: format!("{:#}", e),
                }
            }
        }
    }

    async fn try_provision(
        &self,
        req: &DiscoveredRequirement,
        active: &[DiscoveredRequirement],
        snapshot: &AttributeSnapshot,
    ) -> Result<RequirementOutcome> {
        let not_ready = |reason| Ok(RequirementOutcome::NotReady { reason });

        let Some(srdef) = self.registry.get(&req.srdef_id) else {
            return not_ready(NotReadyReason::UnknownSrdef);
        };

        let instance = self.store.ensure_instance(req).await?;
        match instance.status {
            InstanceStatus::Active => return Ok(RequirementOutcome::AlreadyActive),
            InstanceStatus::Provisioning => {
                return Ok(RequirementOutcome::InFlight {
                    request_id: instance.last_request_id,
                })
            }
            InstanceStatus::Suspended => return not_ready(NotReadyReason::Suspended),
            InstanceStatus::Decommissioned => return not_ready(NotReadyReason::Decommissioned),
            InstanceStatus::Pending => {}
        }

        // Failed owner requests are only retried explicitly.
        if let Some(request_id) = instance.last_request_id {
            if let Some(last) = self.store.get_request(request_id).await? {
                if last.status == ProvisioningStatus::Failed {
                    return not_ready(NotReadyReason::AwaitingRetry { request_id });
                }
            }
        }

        let (missing, conflicted) = missing_required_attrs(srdef, req, snapshot);
        if !conflicted.is_empty() {
            return not_ready(NotReadyReason::AttrConflict {
                attr_ids: conflicted,
            });
        }
        if !missing.is_empty() {
            return not_ready(NotReadyReason::MissingAttrs { attr_ids: missing });
        }

        let deps = dependency_keys(srdef, req, active);
        if !deps.undiscovered.is_empty() {
            return not_ready(NotReadyReason::DependencyNotDiscovered {
                srdef_ids: deps.undiscovered,
            });
        }

        match self
            .store
            .begin_provisioning(instance.instance_id, &deps.gating)
            .await?
        {
            ClaimOutcome::Claimed(_) => {}
            ClaimOutcome::DependenciesNotReady(depends_on) => {
                return not_ready(NotReadyReason::DependencyNotReady { depends_on })
            }
            ClaimOutcome::NotPending(InstanceStatus::Active) => {
                return Ok(RequirementOutcome::AlreadyActive)
            }
            ClaimOutcome::NotPending(_) => {
                return Ok(RequirementOutcome::InFlight { request_id: None })
            }
        }

        let executed = self.execute(req, srdef, &instance, &deps, snapshot).await;
        if let Err(e) = &executed {
            // Release the claim so a later run can try again.
            if let Err(release) = self
                .store
                .update_instance(
                    instance.instance_id,
                    InstanceUpdate::Fail {
                        reason: format!("{:#}", e),
                    },
                )
                .await
            {
                warn!(
                    "Could not release claim on {}: {}",
                    instance.requirement_key, release
                );
            }
        }
        executed
    }

    /// Run the strategy for a claimed (PROVISIONING) instance.
    async fn execute(
        &self,
        req: &DiscoveredRequirement,
        srdef: &LoadedSrdef,
        instance: &ResourceInstance,
        deps: &DependencyKeys,
        snapshot: &AttributeSnapshot,
    ) -> Result<RequirementOutcome> {
        let instances = self.store.instances(req.cbu_id).await?;
        let mut bind_to = BTreeMap::new();
        for (arg, keys) in &deps.bindings {
            if let Some(handle) = keys
                .iter()
                .filter_map(|k| current_instance(&instances, k))
                .filter(|i| i.is_active())
                .find_map(|i| i.handle())
            {
                bind_to.insert(arg.clone(), handle);
            }
        }

        let attrs = srdef
            .attributes
            .iter()
            .filter_map(|a| {
                snapshot
                    .values
                    .get(&a.attr_id)
                    .map(|v| (a.attr_id.clone(), v.clone()))
            })
            .collect();

        let payload = ProvisioningPayload {
            cbu_id: req.cbu_id,
            srdef_id: srdef.srdef_id.clone(),
            parameters: req.parameters.clone(),
            attrs,
            bind_to,
            idempotency_key: idempotency_key(req.cbu_id, &srdef.srdef_id, &req.parameters, 1),
        };

        let strategy = match srdef.provisioning_strategy {
            ProvisioningStrategy::Discover => {
                if let Some(found) = self
                    .provisioner
                    .find_existing(req.cbu_id, srdef, &req.parameters)
                    .await?
                {
                    info!(
                        "Linked existing resource {} for {}",
                        found.srid, instance.requirement_key
                    );
                    return self.activate(instance, found).await;
                }
                debug!(
                    "No existing resource for {}, falling back to {}",
                    instance.requirement_key, srdef.discover_fallback
                );
                srdef.discover_fallback
            }
            other => other,
        };

        match strategy {
            ProvisioningStrategy::Request => {
                let request = self
                    .send_request(
                        Uuid::now_v7(),
                        srdef,
                        instance,
                        payload,
                        1,
                        None,
                        RequestedBy::System,
                    )
                    .await?;
                Ok(RequirementOutcome::RequestSent {
                    request_id: request.request_id,
                })
            }
            _ => match self
                .provisioner
                .provision(req.cbu_id, srdef, &payload)
                .await
            {
                Ok(provisioned) => self.activate(instance, provisioned).await,
                Err(e) => {
                    let reason = format!("{:#}", e);
                    warn!("Create failed for {}: {}", instance.requirement_key, reason);
                    self.store
                        .update_instance(
                            instance.instance_id,
                            InstanceUpdate::Fail {
                                reason: reason.clone(),
                            },
                        )
                        .await?;
                    Ok(RequirementOutcome::Failed { reason })
                }
            },
        }
    }

    async fn activate(
        &self,
        instance: &ResourceInstance,
        provisioned: ProvisionResult,
    ) -> Result<RequirementOutcome> {
        let srid = provisioned.srid.clone();
        self.store
            .update_instance(
                instance.instance_id,
                InstanceUpdate::Activate {
                    srid: provisioned.srid,
                    native_key: provisioned.native_key,
                    resource_url: provisioned.resource_url,
                },
            )
            .await?;
        info!("Activated {} as {}", instance.requirement_key, srid);
        Ok(RequirementOutcome::Activated {
            instance_id: instance.instance_id,
            srid,
        })
    }

    /// Create a request, log REQUEST_SENT, and leave the instance waiting on it.
    #[allow(clippy::too_many_arguments)]
    async fn send_request(
        &self,
        request_id: Uuid,
        srdef: &LoadedSrdef,
        instance: &ResourceInstance,
        payload: ProvisioningPayload,
        attempt: u32,
        retry_of: Option<Uuid>,
        requested_by: RequestedBy,
    ) -> Result<ProvisioningRequest> {
        let now = Utc::now();
        let request = ProvisioningRequest {
            request_id,
            cbu_id: instance.cbu_id,
            srdef_id: srdef.srdef_id.clone(),
            requirement_key: instance.requirement_key.clone(),
            instance_id: instance.instance_id,
            attempt,
            retry_of,
            requested_by,
            requested_at: now,
            request_payload: payload,
            status: ProvisioningStatus::Queued,
            owner_system: srdef.owner.clone(),
            owner_ticket_id: None,
            status_changed_at: now,
        };

        self.store
            .insert_request(request.clone())
            .await
            .context("Failed to create provisioning request")?;
        self.ledger.record_request_sent(&request).await?;
        let request = self
            .store
            .set_request_status(request.request_id, ProvisioningStatus::Sent, None)
            .await?;
        self.store
            .update_instance(
                instance.instance_id,
                InstanceUpdate::AwaitRequest {
                    request_id: request.request_id,
                },
            )
            .await?;
        Ok(request)
    }

    // =========================================================================
    // INBOUND EVENTS
    // =========================================================================

    /// Ingest an owner-system callback. Idempotent by content hash.
    pub async fn ingest_event(&self, event: InboundEvent) -> Result<IngestResult> {
        let kind = event.payload.kind();
        if matches!(kind, EventKind::RequestSent | EventKind::Retry) {
            return Err(IngestError::OutboundKind(kind).into());
        }

        let request = self
            .store
            .get_request(event.request_id)
            .await?
            .ok_or(IngestError::UnknownRequest(event.request_id))?;

        let hash = match &event.content_hash {
            Some(hash) => hash.clone(),
            None => content_hash(request.request_id, EventDirection::In, &event.payload)?,
        };
        if let Some(entry) = self.ledger.find_by_hash(&hash).await? {
            if let Some(outcome) = entry.outcome {
                debug!(
                    "Duplicate {} event for request {}",
                    kind, request.request_id
                );
                return Ok(IngestResult {
                    outcome,
                    duplicate: true,
                });
            }
        }

        let recorded = ProvisioningEvent {
            event_id: Uuid::now_v7(),
            request_id: request.request_id,
            occurred_at: event.occurred_at.unwrap_or_else(Utc::now),
            direction: EventDirection::In,
            payload: event.payload.clone(),
            content_hash: Some(hash),
        };
        let (entry, duplicate) = match self.ledger.record_inbound(request.cbu_id, recorded).await? {
            AppendResult::Inserted(entry) => (entry, false),
            AppendResult::Duplicate(entry) => (entry, true),
        };
        let outcome = entry
            .outcome
            .ok_or(IngestError::MissingOutcome(entry.event.event_id))?;
        if duplicate {
            debug!(
                "Duplicate {} event for request {}",
                kind, request.request_id
            );
            return Ok(IngestResult {
                outcome,
                duplicate: true,
            });
        }

        match &outcome.disposition {
            EventDisposition::Applied { status } => {
                info!("Request {} is now {}", request.request_id, status);
                self.apply_instance_effect(&request, *status, &event.payload)
                    .await;
            }
            EventDisposition::Recorded => {}
            EventDisposition::NoChange { reason } => {
                info!(
                    "{} for request {} recorded without effect: {}",
                    kind, request.request_id, reason
                );
            }
        }
        self.store
            .mark_readiness_stale(request.cbu_id, "provisioning_event")
            .await?;

        Ok(IngestResult {
            outcome,
            duplicate: false,
        })
    }

    /// Carry an applied request transition over to its instance.
    async fn apply_instance_effect(
        &self,
        request: &ProvisioningRequest,
        status: ProvisioningStatus,
        payload: &EventPayload,
    ) {
        let update = match (status, payload) {
            (
                ProvisioningStatus::Completed,
                EventPayload::Result {
                    result:
                        OwnerProvisioningResult::Success {
                            srid,
                            native_key,
                            resource_url,
                        },
                },
            ) => Some(InstanceUpdate::Activate {
                srid: srid.clone(),
                native_key: native_key.clone(),
                resource_url: resource_url.clone(),
            }),
            (ProvisioningStatus::Failed, _) => Some(InstanceUpdate::Fail {
                reason: failure_reason(payload)
                    .unwrap_or_else(|| "owner system reported failure".to_string()),
            }),
            _ => None,
        };
        if let Some(update) = update {
            if let Err(e) = self
                .store
                .update_instance(request.instance_id, update)
                .await
            {
                warn!(
                    "Instance {} not updated for request {}: {}",
                    request.instance_id, request.request_id, e
                );
            }
        }
    }

    // =========================================================================
    // RETRY AND SLA
    // =========================================================================

    /// Retry a failed request as a new attempt linked by `retry_of`.
    pub async fn retry_request(
        &self,
        request_id: Uuid,
        reason: &str,
        requested_by: RequestedBy,
    ) -> Result<ProvisioningRequest> {
        let previous = self
            .store
            .get_request(request_id)
            .await?
            .ok_or(ProvisioningError::UnknownRequest(request_id))?;
        if previous.status != ProvisioningStatus::Failed {
            return Err(ProvisioningError::NotRetryable(previous.status).into());
        }
        if let Some(next) = self
            .store
            .requests_for_cbu(previous.cbu_id)
            .await?
            .into_iter()
            .find(|r| r.retry_of == Some(request_id))
        {
            return Err(ProvisioningError::AlreadyRetried(next.request_id).into());
        }

        let active = self.store.active_requirements(previous.cbu_id).await?;
        let requirement = active
            .iter()
            .find(|r| r.requirement_key() == previous.requirement_key)
            .ok_or_else(|| ProvisioningError::NoLongerRequired(previous.requirement_key.clone()))?;
        let srdef = self
            .registry
            .get(&previous.srdef_id)
            .ok_or_else(|| ProvisioningError::NoLongerRequired(previous.srdef_id.clone()))?;

        let deps = dependency_keys(srdef, requirement, &active);
        if !deps.undiscovered.is_empty() {
            return Err(ProvisioningError::DependenciesNotReady(deps.undiscovered).into());
        }
        let instance = match self
            .store
            .begin_provisioning(previous.instance_id, &deps.gating)
            .await?
        {
            ClaimOutcome::Claimed(instance) => instance,
            ClaimOutcome::DependenciesNotReady(keys) => {
                return Err(ProvisioningError::DependenciesNotReady(keys).into())
            }
            ClaimOutcome::NotPending(status) => {
                return Err(ProvisioningError::InstanceNotPending(status).into())
            }
        };

        let attempt = previous.attempt + 1;
        let mut payload = previous.request_payload.clone();
        payload.idempotency_key = idempotency_key(
            previous.cbu_id,
            &previous.srdef_id,
            &payload.parameters,
            attempt,
        );

        let next_request_id = Uuid::now_v7();
        let sent = self
            .send_request(
                next_request_id,
                srdef,
                &instance,
                payload,
                attempt,
                Some(request_id),
                requested_by,
            )
            .await;
        let request = match sent {
            Ok(request) => request,
            Err(e) => {
                if let Err(release) = self
                    .store
                    .update_instance(
                        instance.instance_id,
                        InstanceUpdate::Fail {
                            reason: format!("{:#}", e),
                        },
                    )
                    .await
                {
                    warn!(
                        "Could not release claim on {}: {}",
                        instance.requirement_key, release
                    );
                }
                return Err(e);
            }
        };

        // Logged once the new attempt exists, so the link always resolves.
        self.ledger
            .record_outbound(
                &previous,
                EventPayload::Retry {
                    reason: reason.to_string(),
                    next_request_id: request.request_id,
                },
            )
            .await
            .with_context(|| format!("Failed to record retry of request {}", request_id))?;
        info!(
            "Retried request {} as {} (attempt {})",
            request_id, request.request_id, attempt
        );
        self.store
            .mark_readiness_stale(previous.cbu_id, "provisioning_retry")
            .await?;
        Ok(request)
    }

    /// In-flight requests older than `sla`.
    pub async fn overdue_requests(
        &self,
        now: DateTime<Utc>,
        sla: chrono::Duration,
    ) -> Result<Vec<ProvisioningRequest>> {
        let overdue: Vec<ProvisioningRequest> = self
            .store
            .in_flight_requests()
            .await?
            .into_iter()
            .filter(|r| now - r.requested_at > sla)
            .collect();
        for r in &overdue {
            warn!(
                "Request {} for {} overdue (sent {}, status {})",
                r.request_id, r.requirement_key, r.requested_at, r.status
            );
        }
        Ok(overdue)
    }
}

/// (missing, conflicted) required attributes of one requirement.
///
/// Conditions are evaluated here rather than read off the rollup, so the
/// gate holds even when rollup has not run for the current requirements.
fn missing_required_attrs(
    srdef: &LoadedSrdef,
    req: &DiscoveredRequirement,
    snapshot: &AttributeSnapshot,
) -> (Vec<String>, Vec<String>) {
    let default_options = IntentOptions::default();
    let options = req
        .reason
        .triggered_by_intents
        .iter()
        .find_map(|id| snapshot.options_by_intent.get(id))
        .unwrap_or(&default_options);

    let mut missing = Vec::new();
    let mut conflicted = Vec::new();
    for attr in srdef.required_attributes() {
        if let Some(expression) = &attr.condition {
            // Invalid conditions apply unconditionally, as in rollup.
            if let Ok(condition) = parse_condition(expression) {
                let ctx = condition_context(options, &req.parameters, &snapshot.facts);
                if !condition.evaluate(&ctx) {
                    continue;
                }
            }
        }
        if snapshot
            .unified
            .get(&attr.attr_id)
            .is_some_and(|u| u.conflict.is_some())
        {
            conflicted.push(attr.attr_id.clone());
        } else if !snapshot.values.contains_key(&attr.attr_id) {
            missing.push(attr.attr_id.clone());
        }
    }
    missing.sort();
    conflicted.sort();
    (missing, conflicted)
}

// =============================================================================
// PROVISIONERS
// =============================================================================

/// Trait for resource provisioners
#[async_trait]
pub trait ResourceProvisioner: Send + Sync {
    /// Provision a resource synchronously (`create` strategy)
    async fn provision(
        &self,
        cbu_id: Uuid,
        srdef: &LoadedSrdef,
        payload: &ProvisioningPayload,
    ) -> Result<ProvisionResult>;

    /// Look for a pre-existing resource (`discover` strategy)
    async fn find_existing(
        &self,
        _cbu_id: Uuid,
        _srdef: &LoadedSrdef,
        _parameters: &ResourceParameters,
    ) -> Result<Option<ProvisionResult>> {
        Ok(None)
    }
}

/// Result of provisioning
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionResult {
    pub srid: String,
    pub native_key: String,
    pub resource_url: Option<String>,
}

/// Stub provisioner that synthesizes fake resources
pub struct StubProvisioner;

impl StubProvisioner {
    fn fake_result(srdef_id: &str) -> ProvisionResult {
        let fake_key = format!(
            "FAKE-{}",
            Uuid::now_v7().simple().to_string()[24..].to_uppercase()
        );
        let parts: Vec<&str> = srdef_id.split("::").collect();
        let (app, kind) = if parts.len() >= 3 {
            (parts[1], parts[2])
        } else {
            ("UNKNOWN", "Resource")
        };

        ProvisionResult {
            srid: format!("SR::{}::{}::{}", app, kind, fake_key),
            native_key: fake_key,
            resource_url: None,
        }
    }
}

#[async_trait]
impl ResourceProvisioner for StubProvisioner {
    async fn provision(
        &self,
        _cbu_id: Uuid,
        srdef: &LoadedSrdef,
        _payload: &ProvisioningPayload,
    ) -> Result<ProvisionResult> {
        Ok(Self::fake_result(&srdef.srdef_id))
    }
}

// =============================================================================
// CONVENIENCE FUNCTIONS
// =============================================================================

/// Run the provisioning + readiness pipeline for a CBU
pub async fn run_provisioning_pipeline(
    store: &dyn PipelineStore,
    registry: &SrdefRegistry,
    provisioner: &dyn ResourceProvisioner,
    cbu_id: Uuid,
) -> Result<FullPipelineResult> {
    let provisioning = ProvisioningOrchestrator::new(store, registry, provisioner)
        .provision_for_cbu(cbu_id)
        .await?;

    let readiness = ReadinessEngine::new(store, registry)
        .compute_for_cbu(cbu_id, "provisioning_pipeline")
        .await?;

    Ok(FullPipelineResult {
        cbu_id,
        requests_created: provisioning.requests_created,
        already_active: provisioning.already_active,
        not_ready: provisioning.not_ready,
        services_ready: readiness.ready,
        services_partial: readiness.partial,
        services_blocked: readiness.blocked,
        provisioning,
        readiness,
    })
}

/// Result of running the provisioning pipeline
#[derive(Debug, Serialize)]
pub struct FullPipelineResult {
    pub cbu_id: Uuid,
    pub requests_created: usize,
    pub already_active: usize,
    pub not_ready: usize,
    pub services_ready: usize,
    pub services_partial: usize,
    pub services_blocked: usize,
    pub provisioning: ProvisioningOrchestratorResult,
    pub readiness: ReadinessComputeResult,
}
