//! Readiness Engine
//!
//! Computes ready / partial / blocked per (CBU, product, service) from a
//! point-in-time snapshot of requirements, instances, requests and
//! attribute values. Every non-ready outcome carries typed blocking reasons.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::provisioning::dependency_keys;
use super::srdef_loader::SrdefRegistry;
use super::store::{PipelineStore, ReadinessWrite};
use super::types::*;

/// Everything readiness reads, captured once per computation.
#[derive(Debug, Clone)]
pub struct ReadinessSnapshot {
    pub as_of: DateTime<Utc>,
    pub requirements: Vec<DiscoveredRequirement>,
    pub instances: Vec<ResourceInstance>,
    pub requests: Vec<ProvisioningRequest>,
    pub populated_attrs: BTreeSet<String>,
    pub unified: Vec<CbuUnifiedAttrRequirement>,
}

/// Evaluate one service intent against a snapshot. Pure and deterministic.
pub fn evaluate_service(
    registry: &SrdefRegistry,
    intent: &ServiceIntent,
    snapshot: &ReadinessSnapshot,
    trigger: Option<&str>,
) -> CbuServiceReadiness {
    let required_srdefs: Vec<String> = registry
        .get_by_service(&intent.service_code)
        .iter()
        .map(|s| s.srdef_id.clone())
        .collect();

    let requests: HashMap<Uuid, &ProvisioningRequest> =
        snapshot.requests.iter().map(|r| (r.request_id, r)).collect();

    let mut blocking_reasons = Vec::new();
    let mut active_srids = Vec::new();
    let mut active_srdefs = BTreeSet::new();

    for srdef_id in &required_srdefs {
        let mut requirements: Vec<&DiscoveredRequirement> = snapshot
            .requirements
            .iter()
            .filter(|r| {
                r.srdef_id == *srdef_id && r.reason.triggered_by_intents.contains(&intent.intent_id)
            })
            .collect();
        if requirements.is_empty() {
            blocking_reasons.push(BlockingReason::MissingSrdef {
                srdef_id: srdef_id.clone(),
            });
            continue;
        }
        requirements.sort_by_key(|r| r.requirement_key());

        for requirement in requirements {
            let key = requirement.requirement_key();
            let instance = current_instance(&snapshot.instances, &key);
            if let Some(instance) = instance.filter(|i| i.is_active()) {
                if let Some(srid) = &instance.srid {
                    active_srids.push(srid.clone());
                }
                active_srdefs.insert(srdef_id.clone());
                continue;
            }
            blocking_reasons.push(classify_pending(
                registry,
                requirement,
                instance,
                &requests,
                snapshot,
            ));
        }
    }

    blocking_reasons.extend(attribute_reasons(registry, &required_srdefs, snapshot));

    let terminal = terminal_srdefs(registry, &required_srdefs);
    let status = if blocking_reasons.is_empty() {
        ReadinessStatus::Ready
    } else if terminal.iter().any(|id| active_srdefs.contains(id)) {
        ReadinessStatus::Partial
    } else {
        ReadinessStatus::Blocked
    };

    active_srids.sort();
    CbuServiceReadiness {
        cbu_id: intent.cbu_id,
        product_code: intent.product_code.clone(),
        service_code: intent.service_code.clone(),
        status,
        blocking_reasons,
        required_srdefs,
        active_srids,
        as_of: snapshot.as_of,
        last_recomputed_at: Utc::now(),
        recomputation_trigger: trigger.map(str::to_string),
        is_stale: false,
    }
}

/// Why a requirement without an ACTIVE instance is not active yet.
fn classify_pending(
    registry: &SrdefRegistry,
    requirement: &DiscoveredRequirement,
    instance: Option<&ResourceInstance>,
    requests: &HashMap<Uuid, &ProvisioningRequest>,
    snapshot: &ReadinessSnapshot,
) -> BlockingReason {
    let srdef_id = requirement.srdef_id.clone();
    let requirement_key = requirement.requirement_key();

    let last_request = instance
        .and_then(|i| i.last_request_id)
        .and_then(|id| requests.get(&id).copied())
        .or_else(|| {
            snapshot
                .requests
                .iter()
                .filter(|r| r.requirement_key == requirement_key)
                .max_by_key(|r| (r.requested_at, r.attempt))
        });

    if let Some(request) = last_request {
        let state = match request.status {
            ProvisioningStatus::Queued => Some(PendingState::Queued),
            ProvisioningStatus::Sent => Some(PendingState::Sent),
            ProvisioningStatus::Ack => Some(PendingState::Acknowledged),
            _ => None,
        };
        if let Some(state) = state {
            return BlockingReason::PendingProvisioning {
                srdef_id,
                requirement_key,
                state,
                request_id: Some(request.request_id),
            };
        }
        if request.status == ProvisioningStatus::Failed {
            return BlockingReason::FailedProvisioning {
                srdef_id,
                requirement_key,
                request_id: Some(request.request_id),
                reason: instance
                    .and_then(|i| i.failure_reason.clone())
                    .unwrap_or_else(|| "owner system reported failure".to_string()),
            };
        }
    }

    if let Some(reason) = instance
        .filter(|i| i.status == InstanceStatus::Pending)
        .and_then(|i| i.failure_reason.clone())
    {
        return BlockingReason::FailedProvisioning {
            srdef_id,
            requirement_key,
            request_id: None,
            reason,
        };
    }

    if let Some(srdef) = registry.get(&requirement.srdef_id) {
        let deps = dependency_keys(srdef, requirement, &snapshot.requirements);
        let mut depends_on: Vec<String> = deps
            .gating
            .into_iter()
            .filter(|k| !current_instance(&snapshot.instances, k).is_some_and(|i| i.is_active()))
            .collect();
        depends_on.extend(deps.undiscovered);
        if !depends_on.is_empty() {
            return BlockingReason::DependencyNotReady {
                srdef_id,
                requirement_key,
                depends_on,
            };
        }
    }

    let state = match instance.map(|i| i.status) {
        None | Some(InstanceStatus::Pending) | Some(InstanceStatus::Active) => {
            PendingState::NotStarted
        }
        Some(InstanceStatus::Provisioning) => PendingState::Provisioning,
        Some(InstanceStatus::Suspended) => PendingState::Suspended,
        Some(InstanceStatus::Decommissioned) => PendingState::Decommissioned,
    };
    BlockingReason::PendingProvisioning {
        srdef_id,
        requirement_key,
        state,
        request_id: None,
    }
}

/// Missing and conflicted attributes relevant to the service's resources.
fn attribute_reasons(
    registry: &SrdefRegistry,
    required_srdefs: &[String],
    snapshot: &ReadinessSnapshot,
) -> Vec<BlockingReason> {
    let mut closure: BTreeSet<String> = required_srdefs.iter().cloned().collect();
    for id in required_srdefs {
        closure.extend(registry.dependency_closure(id));
    }

    let mut missing = Vec::new();
    let mut reasons = Vec::new();
    let mut unified: Vec<&CbuUnifiedAttrRequirement> = snapshot
        .unified
        .iter()
        .filter(|u| u.required_by_srdefs.iter().any(|id| closure.contains(id)))
        .collect();
    unified.sort_by(|a, b| a.attr_id.cmp(&b.attr_id));

    for requirement in unified {
        if let Some(conflict) = &requirement.conflict {
            reasons.push(BlockingReason::AttrConflict {
                attr_id: requirement.attr_id.clone(),
                conflict: conflict.clone(),
            });
            continue;
        }
        if snapshot.populated_attrs.contains(&requirement.attr_id) {
            continue;
        }
        let required_here = requirement.required_by_srdefs.iter().any(|id| {
            closure.contains(id)
                && registry.get(id).is_some_and(|s| {
                    s.required_attributes().any(|a| a.attr_id == requirement.attr_id)
                })
        });
        if required_here {
            missing.push(requirement.attr_id.clone());
        }
    }

    if !missing.is_empty() {
        reasons.insert(0, BlockingReason::MissingAttrs { attr_ids: missing });
    }
    reasons
}

/// Required SRDEFs that are not prerequisites of another required SRDEF.
pub fn terminal_srdefs(registry: &SrdefRegistry, required_srdefs: &[String]) -> BTreeSet<String> {
    let prerequisites: BTreeSet<String> = required_srdefs
        .iter()
        .flat_map(|id| registry.dependency_closure(id))
        .collect();
    required_srdefs
        .iter()
        .filter(|id| !prerequisites.contains(*id))
        .cloned()
        .collect()
}

// =============================================================================
// READINESS ENGINE
// =============================================================================

/// Result of readiness computation
#[derive(Debug, Default, Serialize)]
pub struct ReadinessComputeResult {
    pub total_services: usize,
    pub ready: usize,
    pub partial: usize,
    pub blocked: usize,
    pub rejected_stale: usize,
    pub records: Vec<CbuServiceReadiness>,
}

/// Computes service readiness for CBUs
pub struct ReadinessEngine<'a> {
    store: &'a dyn PipelineStore,
    registry: &'a SrdefRegistry,
}

impl<'a> ReadinessEngine<'a> {
    pub fn new(store: &'a dyn PipelineStore, registry: &'a SrdefRegistry) -> Self {
        Self { store, registry }
    }

    /// Capture the inputs readiness depends on.
    pub async fn snapshot(&self, cbu_id: Uuid) -> Result<ReadinessSnapshot> {
        // Taken before any read so a concurrent change always looks newer.
        let as_of = Utc::now();
        Ok(ReadinessSnapshot {
            as_of,
            requirements: self.store.active_requirements(cbu_id).await?,
            instances: self.store.instances(cbu_id).await?,
            requests: self.store.requests_for_cbu(cbu_id).await?,
            populated_attrs: self
                .store
                .attr_values(cbu_id)
                .await?
                .into_iter()
                .map(|v| v.attr_id)
                .collect(),
            unified: self.store.unified_requirements(cbu_id).await?,
        })
    }

    /// Compute readiness for all active service intents of a CBU
    pub async fn compute_for_cbu(
        &self,
        cbu_id: Uuid,
        trigger: &str,
    ) -> Result<ReadinessComputeResult> {
        info!("Computing service readiness for CBU {}", cbu_id);

        let intents = self
            .store
            .active_intents(cbu_id)
            .await
            .context("Failed to load service intents")?;
        let services: Vec<(String, String)> = intents
            .iter()
            .map(|i| (i.product_code.clone(), i.service_code.clone()))
            .collect();
        let dropped = self.store.retain_readiness(cbu_id, &services).await?;
        if dropped > 0 {
            debug!("Dropped {} readiness rows for withdrawn services of CBU {}", dropped, cbu_id);
        }

        if intents.is_empty() {
            info!("No active service intents for CBU {}", cbu_id);
            return Ok(ReadinessComputeResult::default());
        }

        let snapshot = self.snapshot(cbu_id).await?;
        let mut result = ReadinessComputeResult {
            total_services: intents.len(),
            ..Default::default()
        };

        for intent in &intents {
            let record = evaluate_service(self.registry, intent, &snapshot, Some(trigger));
            debug!(
                "Service {}/{} for CBU {} is {} ({} blocking reasons)",
                record.product_code,
                record.service_code,
                cbu_id,
                record.status,
                record.blocking_reasons.len()
            );

            match self.store.put_readiness(record.clone()).await? {
                ReadinessWrite::Written => {}
                ReadinessWrite::RejectedStale { stored_as_of } => {
                    warn!(
                        "Discarded stale readiness for {}/{} (snapshot {} older than stored {})",
                        record.product_code, record.service_code, record.as_of, stored_as_of
                    );
                    result.rejected_stale += 1;
                    continue;
                }
            }

            match record.status {
                ReadinessStatus::Ready => result.ready += 1,
                ReadinessStatus::Partial => result.partial += 1,
                ReadinessStatus::Blocked => result.blocked += 1,
            }
            result.records.push(record);
        }

        info!(
            "Readiness computation complete for CBU {}: {} ready, {} partial, {} blocked",
            cbu_id, result.ready, result.partial, result.blocked
        );

        Ok(result)
    }

    /// Recompute every CBU with a stale readiness row.
    pub async fn refresh_stale(&self) -> Result<Vec<(Uuid, ReadinessComputeResult)>> {
        let cbus: BTreeSet<Uuid> = self
            .store
            .stale_readiness()
            .await?
            .into_iter()
            .map(|(cbu_id, _, _)| cbu_id)
            .collect();

        let mut refreshed = Vec::with_capacity(cbus.len());
        for cbu_id in cbus {
            let result = self.compute_for_cbu(cbu_id, "stale_refresh").await?;
            refreshed.push((cbu_id, result));
        }
        Ok(refreshed)
    }
}
