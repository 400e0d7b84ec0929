//! Pipeline persistence
//!
//! `PipelineStore` is the seam between the engines and storage. Every method
//! is atomic on its own; the operations that must be race-free under
//! concurrency (requirement sync, provisioning claims, event append,
//! readiness writes) are single trait calls so each backend can make them
//! atomic in its own way.
//!
//! `MemoryStore` shards state per CBU behind its own mutex, so work on
//! different CBUs never contends. The ledger's content-hash index is global
//! and sharded by hash.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use super::discovery::plan_requirement_sync;
use super::ledger::apply_inbound;
use super::types::{
    current_instance, CbuAttrValue, CbuFacts, CbuServiceReadiness, CbuUnifiedAttrRequirement,
    DiscoveredRequirement, IngestOutcome, InstanceStatus, ProvisioningEvent, ProvisioningRequest,
    ProvisioningStatus, ResourceInstance, ServiceIntent, ServiceIntentStatus,
};

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("invalid {entity} transition {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("an active intent already exists for {product_code}/{service_code} (intent {existing})")]
    DuplicateIntent {
        product_code: String,
        service_code: String,
        existing: Uuid,
    },

    #[error("ledger event {event_id} is immutable and already recorded with different content")]
    ImmutableEvent { event_id: Uuid },

    #[error("store backend error: {0}")]
    Backend(String),
}

// =============================================================================
// RESULT TYPES
// =============================================================================

/// Counts from an atomic requirement sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequirementSync {
    pub inserted: usize,
    pub superseded: usize,
    pub unchanged: usize,
}

impl RequirementSync {
    pub fn changed(&self) -> bool {
        self.inserted > 0 || self.superseded > 0
    }
}

/// Outcome of trying to move an instance PENDING → PROVISIONING.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    Claimed(ResourceInstance),
    NotPending(InstanceStatus),
    DependenciesNotReady(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum InstanceUpdate {
    Activate {
        srid: String,
        native_key: String,
        resource_url: Option<String>,
    },
    /// Stays PROVISIONING while the owner system works on `request_id`.
    AwaitRequest { request_id: Uuid },
    /// PROVISIONING → PENDING with the failure recorded.
    Fail { reason: String },
    Suspend,
    Resume,
    Decommission,
}

/// A ledger row together with what ingesting it did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub cbu_id: Uuid,
    pub event: ProvisioningEvent,
    pub outcome: Option<IngestOutcome>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AppendResult {
    Inserted(LedgerEntry),
    /// The same content was already recorded; the original entry is returned.
    Duplicate(LedgerEntry),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReadinessWrite {
    Written,
    /// A record computed from a newer snapshot is already stored.
    RejectedStale { stored_as_of: DateTime<Utc> },
}

/// (cbu_id, product_code, service_code) of a stale readiness record.
pub type ReadinessKey = (Uuid, String, String);

// =============================================================================
// STORE TRAIT
// =============================================================================

#[async_trait]
pub trait PipelineStore: Send + Sync {
    // ---- intents ----
    /// Rejects a second current intent for the same (cbu, product, service).
    async fn insert_intent(&self, intent: ServiceIntent) -> Result<ServiceIntent, StoreError>;
    /// Marks `intent_id` superseded by `replacement` and stores the replacement.
    async fn supersede_intent(
        &self,
        intent_id: Uuid,
        replacement: ServiceIntent,
    ) -> Result<ServiceIntent, StoreError>;
    async fn set_intent_status(
        &self,
        intent_id: Uuid,
        status: ServiceIntentStatus,
    ) -> Result<ServiceIntent, StoreError>;
    async fn get_intent(&self, intent_id: Uuid) -> Result<Option<ServiceIntent>, StoreError>;
    async fn active_intents(&self, cbu_id: Uuid) -> Result<Vec<ServiceIntent>, StoreError>;

    // ---- facts ----
    async fn put_cbu_facts(&self, cbu_id: Uuid, facts: CbuFacts) -> Result<(), StoreError>;
    async fn cbu_facts(&self, cbu_id: Uuid) -> Result<CbuFacts, StoreError>;

    // ---- discovery ----
    /// Atomically replace the active requirement set with `desired`.
    async fn sync_requirements(
        &self,
        cbu_id: Uuid,
        desired: Vec<DiscoveredRequirement>,
        now: DateTime<Utc>,
    ) -> Result<RequirementSync, StoreError>;
    async fn active_requirements(&self, cbu_id: Uuid)
        -> Result<Vec<DiscoveredRequirement>, StoreError>;
    async fn requirement_history(
        &self,
        cbu_id: Uuid,
    ) -> Result<Vec<DiscoveredRequirement>, StoreError>;

    // ---- rollup ----
    async fn replace_unified_requirements(
        &self,
        cbu_id: Uuid,
        requirements: Vec<CbuUnifiedAttrRequirement>,
    ) -> Result<(), StoreError>;
    async fn unified_requirements(
        &self,
        cbu_id: Uuid,
    ) -> Result<Vec<CbuUnifiedAttrRequirement>, StoreError>;

    // ---- attribute values ----
    async fn put_attr_value(&self, value: CbuAttrValue) -> Result<(), StoreError>;
    async fn remove_attr_value(&self, cbu_id: Uuid, attr_id: &str) -> Result<bool, StoreError>;
    async fn attr_values(&self, cbu_id: Uuid) -> Result<Vec<CbuAttrValue>, StoreError>;

    // ---- instances ----
    /// Current instance for the requirement, created PENDING if none exists.
    async fn ensure_instance(
        &self,
        requirement: &DiscoveredRequirement,
    ) -> Result<ResourceInstance, StoreError>;
    async fn get_instance(&self, instance_id: Uuid) -> Result<Option<ResourceInstance>, StoreError>;
    async fn instances(&self, cbu_id: Uuid) -> Result<Vec<ResourceInstance>, StoreError>;
    /// PENDING → PROVISIONING, only if every dependency key has an ACTIVE instance.
    async fn begin_provisioning(
        &self,
        instance_id: Uuid,
        dependency_keys: &[String],
    ) -> Result<ClaimOutcome, StoreError>;
    async fn update_instance(
        &self,
        instance_id: Uuid,
        update: InstanceUpdate,
    ) -> Result<ResourceInstance, StoreError>;

    // ---- requests ----
    async fn insert_request(&self, request: ProvisioningRequest) -> Result<(), StoreError>;
    async fn get_request(&self, request_id: Uuid) -> Result<Option<ProvisioningRequest>, StoreError>;
    async fn requests_for_cbu(&self, cbu_id: Uuid) -> Result<Vec<ProvisioningRequest>, StoreError>;
    async fn set_request_status(
        &self,
        request_id: Uuid,
        status: ProvisioningStatus,
        owner_ticket_id: Option<String>,
    ) -> Result<ProvisioningRequest, StoreError>;
    async fn in_flight_requests(&self) -> Result<Vec<ProvisioningRequest>, StoreError>;

    // ---- ledger ----
    /// Append-only. Atomic per content hash: concurrent appends of the same
    /// content yield exactly one `Inserted`.
    async fn append_event(
        &self,
        cbu_id: Uuid,
        event: ProvisioningEvent,
        outcome: Option<IngestOutcome>,
    ) -> Result<AppendResult, StoreError>;
    /// Append an inbound event and apply it to its request atomically. The
    /// stored outcome is classified against the request as it is at commit
    /// time. A duplicate hash changes nothing and returns the first entry.
    async fn ingest_inbound(
        &self,
        cbu_id: Uuid,
        event: ProvisioningEvent,
    ) -> Result<AppendResult, StoreError>;
    async fn event_by_hash(&self, content_hash: &str) -> Result<Option<LedgerEntry>, StoreError>;
    async fn events_for_request(
        &self,
        request_id: Uuid,
    ) -> Result<Vec<ProvisioningEvent>, StoreError>;

    // ---- readiness ----
    /// Rejects the write when the stored record has a newer `as_of`.
    async fn put_readiness(&self, record: CbuServiceReadiness) -> Result<ReadinessWrite, StoreError>;
    async fn readiness(&self, cbu_id: Uuid) -> Result<Vec<CbuServiceReadiness>, StoreError>;
    async fn mark_readiness_stale(&self, cbu_id: Uuid, trigger: &str) -> Result<usize, StoreError>;
    async fn stale_readiness(&self) -> Result<Vec<ReadinessKey>, StoreError>;
    /// Drop readiness rows whose (product, service) is not in `services`.
    async fn retain_readiness(
        &self,
        cbu_id: Uuid,
        services: &[(String, String)],
    ) -> Result<usize, StoreError>;
}

// =============================================================================
// IN-MEMORY STORE
// =============================================================================

const HASH_SHARDS: usize = 16;

#[derive(Debug, Default)]
struct CbuShard {
    intents: Vec<ServiceIntent>,
    facts: CbuFacts,
    requirements: Vec<DiscoveredRequirement>,
    unified: BTreeMap<String, CbuUnifiedAttrRequirement>,
    values: BTreeMap<String, CbuAttrValue>,
    instances: Vec<ResourceInstance>,
    requests: BTreeMap<Uuid, ProvisioningRequest>,
    events: Vec<ProvisioningEvent>,
    readiness: BTreeMap<(String, String), CbuServiceReadiness>,
}

/// In-memory `PipelineStore`, used by tests, the CLI demo and embedders
/// without a database.
pub struct MemoryStore {
    shards: RwLock<HashMap<Uuid, Arc<Mutex<CbuShard>>>>,
    intent_index: RwLock<HashMap<Uuid, Uuid>>,
    instance_index: RwLock<HashMap<Uuid, Uuid>>,
    request_index: RwLock<HashMap<Uuid, Uuid>>,
    hash_index: [Mutex<HashMap<String, LedgerEntry>>; HASH_SHARDS],
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            shards: RwLock::new(HashMap::new()),
            intent_index: RwLock::new(HashMap::new()),
            instance_index: RwLock::new(HashMap::new()),
            request_index: RwLock::new(HashMap::new()),
            hash_index: std::array::from_fn(|_| Mutex::new(HashMap::new())),
        }
    }

    /// Shared append path. `effect` runs under both locks after the
    /// duplicate checks, so whatever it changes commits with the event.
    fn append_locked(
        &self,
        cbu_id: Uuid,
        event: ProvisioningEvent,
        effect: impl FnOnce(&mut CbuShard, &ProvisioningEvent) -> Result<Option<IngestOutcome>, StoreError>,
    ) -> Result<AppendResult, StoreError> {
        let shard = self.shard(cbu_id);

        // Lock order: hash shard, then CBU shard.
        let mut hashes = event
            .content_hash
            .as_deref()
            .map(|h| lock(self.hash_shard(h)));
        if let (Some(index), Some(hash)) = (hashes.as_ref(), event.content_hash.as_ref()) {
            if let Some(existing) = index.get(hash) {
                if existing.event.event_id == event.event_id && existing.event != event {
                    return Err(StoreError::ImmutableEvent {
                        event_id: event.event_id,
                    });
                }
                return Ok(AppendResult::Duplicate(existing.clone()));
            }
        }

        let mut shard = lock(&shard);
        if let Some(existing) = shard.events.iter().find(|e| e.event_id == event.event_id) {
            if *existing != event {
                return Err(StoreError::ImmutableEvent {
                    event_id: existing.event_id,
                });
            }
            return Ok(AppendResult::Duplicate(LedgerEntry {
                cbu_id,
                event: existing.clone(),
                outcome: None,
            }));
        }
        let outcome = effect(&mut *shard, &event)?;
        shard.events.push(event.clone());
        let entry = LedgerEntry {
            cbu_id,
            event,
            outcome,
        };
        if let (Some(index), Some(hash)) = (hashes.as_mut(), entry.event.content_hash.as_ref()) {
            index.insert(hash.clone(), entry.clone());
        }
        Ok(AppendResult::Inserted(entry))
    }

    fn shard(&self, cbu_id: Uuid) -> Arc<Mutex<CbuShard>> {
        {
            let shards = self.shards.read().unwrap_or_else(|p| p.into_inner());
            if let Some(shard) = shards.get(&cbu_id) {
                return Arc::clone(shard);
            }
        }
        let mut shards = self.shards.write().unwrap_or_else(|p| p.into_inner());
        Arc::clone(shards.entry(cbu_id).or_default())
    }

    fn all_shards(&self) -> Vec<(Uuid, Arc<Mutex<CbuShard>>)> {
        let shards = self.shards.read().unwrap_or_else(|p| p.into_inner());
        shards.iter().map(|(id, s)| (*id, Arc::clone(s))).collect()
    }

    fn index_lookup(
        index: &RwLock<HashMap<Uuid, Uuid>>,
        id: Uuid,
    ) -> Option<Uuid> {
        index.read().unwrap_or_else(|p| p.into_inner()).get(&id).copied()
    }

    fn index_insert(index: &RwLock<HashMap<Uuid, Uuid>>, id: Uuid, cbu_id: Uuid) {
        index
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id, cbu_id);
    }

    fn hash_shard(&self, content_hash: &str) -> &Mutex<HashMap<String, LedgerEntry>> {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        content_hash.hash(&mut hasher);
        &self.hash_index[(hasher.finish() as usize) % HASH_SHARDS]
    }

    fn owning_shard(
        &self,
        index: &RwLock<HashMap<Uuid, Uuid>>,
        entity: &'static str,
        id: Uuid,
    ) -> Result<Arc<Mutex<CbuShard>>, StoreError> {
        let cbu_id = Self::index_lookup(index, id).ok_or_else(|| StoreError::NotFound {
            entity,
            id: id.to_string(),
        })?;
        Ok(self.shard(cbu_id))
    }
}

fn not_found(entity: &'static str, id: impl ToString) -> StoreError {
    StoreError::NotFound {
        entity,
        id: id.to_string(),
    }
}

pub(crate) fn apply_instance_update(
    instance: &mut ResourceInstance,
    update: InstanceUpdate,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    let target = match &update {
        InstanceUpdate::Activate { .. } | InstanceUpdate::Resume => InstanceStatus::Active,
        InstanceUpdate::AwaitRequest { .. } => InstanceStatus::Provisioning,
        InstanceUpdate::Fail { .. } => InstanceStatus::Pending,
        InstanceUpdate::Suspend => InstanceStatus::Suspended,
        InstanceUpdate::Decommission => InstanceStatus::Decommissioned,
    };
    let allowed = match &update {
        InstanceUpdate::AwaitRequest { .. } => instance.status == InstanceStatus::Provisioning,
        InstanceUpdate::Fail { .. } => instance.status == InstanceStatus::Provisioning,
        InstanceUpdate::Resume => instance.status == InstanceStatus::Suspended,
        _ => instance.status.can_transition_to(target),
    };
    if !allowed {
        return Err(StoreError::InvalidTransition {
            entity: "instance",
            from: instance.status.to_string(),
            to: target.to_string(),
        });
    }

    match update {
        InstanceUpdate::Activate {
            srid,
            native_key,
            resource_url,
        } => {
            instance.srid = Some(srid);
            instance.native_key = Some(native_key);
            instance.resource_url = resource_url;
            instance.failure_reason = None;
        }
        InstanceUpdate::AwaitRequest { request_id } => {
            instance.last_request_id = Some(request_id);
            instance.failure_reason = None;
        }
        InstanceUpdate::Fail { reason } => {
            instance.failure_reason = Some(reason);
        }
        InstanceUpdate::Suspend | InstanceUpdate::Resume | InstanceUpdate::Decommission => {}
    }
    instance.status = target;
    instance.updated_at = now;
    Ok(())
}

#[async_trait]
impl PipelineStore for MemoryStore {
    async fn insert_intent(&self, intent: ServiceIntent) -> Result<ServiceIntent, StoreError> {
        let shard = self.shard(intent.cbu_id);
        let mut shard = lock(&shard);
        if let Some(existing) = shard.intents.iter().find(|i| {
            i.is_current()
                && i.product_code == intent.product_code
                && i.service_code == intent.service_code
        }) {
            return Err(StoreError::DuplicateIntent {
                product_code: intent.product_code.clone(),
                service_code: intent.service_code.clone(),
                existing: existing.intent_id,
            });
        }
        shard.intents.push(intent.clone());
        Self::index_insert(&self.intent_index, intent.intent_id, intent.cbu_id);
        Ok(intent)
    }

    async fn supersede_intent(
        &self,
        intent_id: Uuid,
        replacement: ServiceIntent,
    ) -> Result<ServiceIntent, StoreError> {
        let shard = self.owning_shard(&self.intent_index, "intent", intent_id)?;
        let mut shard = lock(&shard);
        let old = shard
            .intents
            .iter_mut()
            .find(|i| i.intent_id == intent_id)
            .ok_or_else(|| not_found("intent", intent_id))?;
        if old.superseded_by.is_some() {
            return Err(StoreError::InvalidTransition {
                entity: "intent",
                from: "superseded".to_string(),
                to: "superseded".to_string(),
            });
        }
        old.superseded_by = Some(replacement.intent_id);
        shard.intents.push(replacement.clone());
        Self::index_insert(&self.intent_index, replacement.intent_id, replacement.cbu_id);
        Ok(replacement)
    }

    async fn set_intent_status(
        &self,
        intent_id: Uuid,
        status: ServiceIntentStatus,
    ) -> Result<ServiceIntent, StoreError> {
        let shard = self.owning_shard(&self.intent_index, "intent", intent_id)?;
        let mut shard = lock(&shard);
        let intent = shard
            .intents
            .iter_mut()
            .find(|i| i.intent_id == intent_id)
            .ok_or_else(|| not_found("intent", intent_id))?;
        if intent.status == ServiceIntentStatus::Cancelled && status != ServiceIntentStatus::Cancelled {
            return Err(StoreError::InvalidTransition {
                entity: "intent",
                from: intent.status.to_string(),
                to: status.to_string(),
            });
        }
        intent.status = status;
        Ok(intent.clone())
    }

    async fn get_intent(&self, intent_id: Uuid) -> Result<Option<ServiceIntent>, StoreError> {
        let Some(cbu_id) = Self::index_lookup(&self.intent_index, intent_id) else {
            return Ok(None);
        };
        let shard = self.shard(cbu_id);
        let shard = lock(&shard);
        Ok(shard.intents.iter().find(|i| i.intent_id == intent_id).cloned())
    }

    async fn active_intents(&self, cbu_id: Uuid) -> Result<Vec<ServiceIntent>, StoreError> {
        let shard = self.shard(cbu_id);
        let shard = lock(&shard);
        let mut intents: Vec<ServiceIntent> =
            shard.intents.iter().filter(|i| i.is_current()).cloned().collect();
        intents.sort_by(|a, b| {
            (&a.product_code, &a.service_code, a.intent_id)
                .cmp(&(&b.product_code, &b.service_code, b.intent_id))
        });
        Ok(intents)
    }

    async fn put_cbu_facts(&self, cbu_id: Uuid, facts: CbuFacts) -> Result<(), StoreError> {
        let shard = self.shard(cbu_id);
        lock(&shard).facts = facts;
        Ok(())
    }

    async fn cbu_facts(&self, cbu_id: Uuid) -> Result<CbuFacts, StoreError> {
        let shard = self.shard(cbu_id);
        let facts = lock(&shard).facts.clone();
        Ok(facts)
    }

    async fn sync_requirements(
        &self,
        cbu_id: Uuid,
        desired: Vec<DiscoveredRequirement>,
        now: DateTime<Utc>,
    ) -> Result<RequirementSync, StoreError> {
        let shard = self.shard(cbu_id);
        let mut shard = lock(&shard);
        let active: Vec<DiscoveredRequirement> = shard
            .requirements
            .iter()
            .filter(|r| r.is_active())
            .cloned()
            .collect();
        let plan = plan_requirement_sync(&active, desired);

        for req in shard.requirements.iter_mut() {
            if req.is_active() && plan.supersede.contains(&req.discovery_id) {
                req.superseded_at = Some(now);
            }
        }
        let sync = RequirementSync {
            inserted: plan.insert.len(),
            superseded: plan.supersede.len(),
            unchanged: plan.unchanged,
        };
        shard.requirements.extend(plan.insert);
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
        let shard = self.shard(cbu_id);
        let shard = lock(&shard);
        let mut reqs: Vec<DiscoveredRequirement> = shard
            .requirements
            .iter()
            .filter(|r| r.is_active())
            .cloned()
            .collect();
        reqs.sort_by_key(|r| r.requirement_key());
        Ok(reqs)
    }

    async fn requirement_history(
        &self,
        cbu_id: Uuid,
    ) -> Result<Vec<DiscoveredRequirement>, StoreError> {
        let shard = self.shard(cbu_id);
        let history = lock(&shard).requirements.clone();
        Ok(history)
    }

    async fn replace_unified_requirements(
        &self,
        cbu_id: Uuid,
        requirements: Vec<CbuUnifiedAttrRequirement>,
    ) -> Result<(), StoreError> {
        let shard = self.shard(cbu_id);
        lock(&shard).unified = requirements
            .into_iter()
            .map(|r| (r.attr_id.clone(), r))
            .collect();
        Ok(())
    }

    async fn unified_requirements(
        &self,
        cbu_id: Uuid,
    ) -> Result<Vec<CbuUnifiedAttrRequirement>, StoreError> {
        let shard = self.shard(cbu_id);
        let unified = lock(&shard).unified.values().cloned().collect();
        Ok(unified)
    }

    async fn put_attr_value(&self, value: CbuAttrValue) -> Result<(), StoreError> {
        let shard = self.shard(value.cbu_id);
        lock(&shard).values.insert(value.attr_id.clone(), value);
        Ok(())
    }

    async fn remove_attr_value(&self, cbu_id: Uuid, attr_id: &str) -> Result<bool, StoreError> {
        let shard = self.shard(cbu_id);
        let removed = lock(&shard).values.remove(attr_id).is_some();
        Ok(removed)
    }

    async fn attr_values(&self, cbu_id: Uuid) -> Result<Vec<CbuAttrValue>, StoreError> {
        let shard = self.shard(cbu_id);
        let values = lock(&shard).values.values().cloned().collect();
        Ok(values)
    }

    async fn ensure_instance(
        &self,
        requirement: &DiscoveredRequirement,
    ) -> Result<ResourceInstance, StoreError> {
        let key = requirement.requirement_key();
        let shard = self.shard(requirement.cbu_id);
        let mut shard = lock(&shard);
        if let Some(existing) = current_instance(&shard.instances, &key) {
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
        shard.instances.push(instance.clone());
        Self::index_insert(&self.instance_index, instance.instance_id, instance.cbu_id);
        Ok(instance)
    }

    async fn get_instance(&self, instance_id: Uuid) -> Result<Option<ResourceInstance>, StoreError> {
        let Some(cbu_id) = Self::index_lookup(&self.instance_index, instance_id) else {
            return Ok(None);
        };
        let shard = self.shard(cbu_id);
        let shard = lock(&shard);
        Ok(shard
            .instances
            .iter()
            .find(|i| i.instance_id == instance_id)
            .cloned())
    }

    async fn instances(&self, cbu_id: Uuid) -> Result<Vec<ResourceInstance>, StoreError> {
        let shard = self.shard(cbu_id);
        let instances = lock(&shard).instances.clone();
        Ok(instances)
    }

    async fn begin_provisioning(
        &self,
        instance_id: Uuid,
        dependency_keys: &[String],
    ) -> Result<ClaimOutcome, StoreError> {
        let shard = self.owning_shard(&self.instance_index, "instance", instance_id)?;
        let mut shard = lock(&shard);

        let unmet: Vec<String> = dependency_keys
            .iter()
            .filter(|key| {
                !current_instance(&shard.instances, key).is_some_and(|i| i.is_active())
            })
            .cloned()
            .collect();

        let instance = shard
            .instances
            .iter_mut()
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
        Ok(ClaimOutcome::Claimed(instance.clone()))
    }

    async fn update_instance(
        &self,
        instance_id: Uuid,
        update: InstanceUpdate,
    ) -> Result<ResourceInstance, StoreError> {
        let shard = self.owning_shard(&self.instance_index, "instance", instance_id)?;
        let mut shard = lock(&shard);
        let instance = shard
            .instances
            .iter_mut()
            .find(|i| i.instance_id == instance_id)
            .ok_or_else(|| not_found("instance", instance_id))?;
        apply_instance_update(instance, update, Utc::now())?;
        Ok(instance.clone())
    }

    async fn insert_request(&self, request: ProvisioningRequest) -> Result<(), StoreError> {
        let shard = self.shard(request.cbu_id);
        Self::index_insert(&self.request_index, request.request_id, request.cbu_id);
        lock(&shard).requests.insert(request.request_id, request);
        Ok(())
    }

    async fn get_request(&self, request_id: Uuid) -> Result<Option<ProvisioningRequest>, StoreError> {
        let Some(cbu_id) = Self::index_lookup(&self.request_index, request_id) else {
            return Ok(None);
        };
        let shard = self.shard(cbu_id);
        let request = lock(&shard).requests.get(&request_id).cloned();
        Ok(request)
    }

    async fn requests_for_cbu(&self, cbu_id: Uuid) -> Result<Vec<ProvisioningRequest>, StoreError> {
        let shard = self.shard(cbu_id);
        let requests = lock(&shard).requests.values().cloned().collect();
        Ok(requests)
    }

    async fn set_request_status(
        &self,
        request_id: Uuid,
        status: ProvisioningStatus,
        owner_ticket_id: Option<String>,
    ) -> Result<ProvisioningRequest, StoreError> {
        let shard = self.owning_shard(&self.request_index, "request", request_id)?;
        let mut shard = lock(&shard);
        let request = shard
            .requests
            .get_mut(&request_id)
            .ok_or_else(|| not_found("request", request_id))?;
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
        Ok(request.clone())
    }

    async fn in_flight_requests(&self) -> Result<Vec<ProvisioningRequest>, StoreError> {
        let mut in_flight = Vec::new();
        for (_, shard) in self.all_shards() {
            let shard = lock(&shard);
            in_flight.extend(
                shard
                    .requests
                    .values()
                    .filter(|r| r.status.is_in_flight())
                    .cloned(),
            );
        }
        in_flight.sort_by_key(|r| r.requested_at);
        Ok(in_flight)
    }

    async fn append_event(
        &self,
        cbu_id: Uuid,
        event: ProvisioningEvent,
        outcome: Option<IngestOutcome>,
    ) -> Result<AppendResult, StoreError> {
        self.append_locked(cbu_id, event, |_, _| Ok(outcome))
    }

    async fn ingest_inbound(
        &self,
        cbu_id: Uuid,
        event: ProvisioningEvent,
    ) -> Result<AppendResult, StoreError> {
        self.append_locked(cbu_id, event, |shard, event| {
            let request = shard
                .requests
                .get_mut(&event.request_id)
                .ok_or_else(|| not_found("request", event.request_id))?;
            Ok(Some(apply_inbound(request, event, Utc::now())))
        })
    }

    async fn event_by_hash(&self, content_hash: &str) -> Result<Option<LedgerEntry>, StoreError> {
        let entry = lock(self.hash_shard(content_hash)).get(content_hash).cloned();
        Ok(entry)
    }

    async fn events_for_request(
        &self,
        request_id: Uuid,
    ) -> Result<Vec<ProvisioningEvent>, StoreError> {
        let Some(cbu_id) = Self::index_lookup(&self.request_index, request_id) else {
            return Ok(Vec::new());
        };
        let shard = self.shard(cbu_id);
        let shard = lock(&shard);
        Ok(shard
            .events
            .iter()
            .filter(|e| e.request_id == request_id)
            .cloned()
            .collect())
    }

    async fn put_readiness(&self, record: CbuServiceReadiness) -> Result<ReadinessWrite, StoreError> {
        let shard = self.shard(record.cbu_id);
        let mut shard = lock(&shard);
        let key = (record.product_code.clone(), record.service_code.clone());
        if let Some(existing) = shard.readiness.get(&key) {
            if existing.as_of > record.as_of {
                return Ok(ReadinessWrite::RejectedStale {
                    stored_as_of: existing.as_of,
                });
            }
        }
        shard.readiness.insert(key, record);
        Ok(ReadinessWrite::Written)
    }

    async fn readiness(&self, cbu_id: Uuid) -> Result<Vec<CbuServiceReadiness>, StoreError> {
        let shard = self.shard(cbu_id);
        let records = lock(&shard).readiness.values().cloned().collect();
        Ok(records)
    }

    async fn mark_readiness_stale(&self, cbu_id: Uuid, trigger: &str) -> Result<usize, StoreError> {
        let shard = self.shard(cbu_id);
        let mut shard = lock(&shard);
        let mut marked = 0;
        for record in shard.readiness.values_mut() {
            record.is_stale = true;
            record.recomputation_trigger = Some(trigger.to_string());
            marked += 1;
        }
        Ok(marked)
    }

    async fn stale_readiness(&self) -> Result<Vec<ReadinessKey>, StoreError> {
        let mut stale = Vec::new();
        for (cbu_id, shard) in self.all_shards() {
            let shard = lock(&shard);
            stale.extend(
                shard
                    .readiness
                    .values()
                    .filter(|r| r.is_stale)
                    .map(|r| (cbu_id, r.product_code.clone(), r.service_code.clone())),
            );
        }
        stale.sort();
        Ok(stale)
    }

    async fn retain_readiness(
        &self,
        cbu_id: Uuid,
        services: &[(String, String)],
    ) -> Result<usize, StoreError> {
        let shard = self.shard(cbu_id);
        let mut shard = lock(&shard);
        let before = shard.readiness.len();
        shard.readiness.retain(|key, _| services.contains(key));
        Ok(before - shard.readiness.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service_resources::types::{
        DiscoveryReason, DiscoveryRule, EventDirection, EventDisposition, EventPayload,
        IntentOptions, ReadinessStatus, ResourceParameters,
    };

    fn requirement(cbu_id: Uuid, srdef_id: &str) -> DiscoveredRequirement {
        let mut reason = DiscoveryReason::default();
        reason.record(
            Uuid::nil(),
            DiscoveryRule::ServiceTrigger {
                service_code: "CUSTODY".to_string(),
            },
        );
        DiscoveredRequirement {
            discovery_id: Uuid::now_v7(),
            cbu_id,
            srdef_id: srdef_id.to_string(),
            parameters: ResourceParameters::new(),
            reason,
            discovered_at: Utc::now(),
            superseded_at: None,
        }
    }

    fn intent(cbu_id: Uuid) -> ServiceIntent {
        ServiceIntent {
            intent_id: Uuid::now_v7(),
            cbu_id,
            product_code: "CUSTODY".to_string(),
            service_code: "SAFEKEEPING".to_string(),
            options: IntentOptions::default(),
            status: ServiceIntentStatus::Active,
            version: 1,
            superseded_by: None,
            created_at: Utc::now(),
            created_by: None,
        }
    }

    fn queued_request(inst: &ResourceInstance) -> ProvisioningRequest {
        let now = Utc::now();
        ProvisioningRequest {
            request_id: Uuid::now_v7(),
            cbu_id: inst.cbu_id,
            srdef_id: inst.srdef_id.clone(),
            requirement_key: inst.requirement_key.clone(),
            instance_id: inst.instance_id,
            attempt: 1,
            retry_of: None,
            requested_by: crate::service_resources::types::RequestedBy::System,
            requested_at: now,
            request_payload: crate::service_resources::types::ProvisioningPayload {
                cbu_id: inst.cbu_id,
                srdef_id: inst.srdef_id.clone(),
                parameters: ResourceParameters::new(),
                attrs: BTreeMap::new(),
                bind_to: BTreeMap::new(),
                idempotency_key: "k".to_string(),
            },
            status: ProvisioningStatus::Queued,
            owner_system: "A".to_string(),
            owner_ticket_id: None,
            status_changed_at: now,
        }
    }

    #[tokio::test]
    async fn test_duplicate_active_intent_rejected() {
        let store = MemoryStore::new();
        let cbu = Uuid::now_v7();
        store.insert_intent(intent(cbu)).await.unwrap();
        let err = store.insert_intent(intent(cbu)).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateIntent { .. }));
    }

    #[tokio::test]
    async fn test_claim_requires_active_dependencies() {
        let store = MemoryStore::new();
        let cbu = Uuid::now_v7();
        let dep = store.ensure_instance(&requirement(cbu, "SRDEF::A::X::dep")).await.unwrap();
        let inst = store.ensure_instance(&requirement(cbu, "SRDEF::A::X::main")).await.unwrap();
        let keys = vec![dep.requirement_key.clone()];

        let outcome = store.begin_provisioning(inst.instance_id, &keys).await.unwrap();
        assert_eq!(outcome, ClaimOutcome::DependenciesNotReady(keys.clone()));

        store.begin_provisioning(dep.instance_id, &[]).await.unwrap();
        store
            .update_instance(
                dep.instance_id,
                InstanceUpdate::Activate {
                    srid: "SR::A::X::1".to_string(),
                    native_key: "1".to_string(),
                    resource_url: None,
                },
            )
            .await
            .unwrap();

        let outcome = store.begin_provisioning(inst.instance_id, &keys).await.unwrap();
        assert!(matches!(outcome, ClaimOutcome::Claimed(_)));
        let again = store.begin_provisioning(inst.instance_id, &keys).await.unwrap();
        assert_eq!(again, ClaimOutcome::NotPending(InstanceStatus::Provisioning));
    }

    #[tokio::test]
    async fn test_request_status_cannot_regress() {
        let store = MemoryStore::new();
        let cbu = Uuid::now_v7();
        let inst = store.ensure_instance(&requirement(cbu, "SRDEF::A::X::main")).await.unwrap();
        let request = queued_request(&inst);
        store.insert_request(request.clone()).await.unwrap();
        store
            .set_request_status(request.request_id, ProvisioningStatus::Sent, None)
            .await
            .unwrap();
        store
            .set_request_status(request.request_id, ProvisioningStatus::Completed, None)
            .await
            .unwrap();
        let err = store
            .set_request_status(request.request_id, ProvisioningStatus::Ack, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_ledger_rejects_rewrite_and_dedupes_hash() {
        let store = MemoryStore::new();
        let cbu = Uuid::now_v7();
        let event = ProvisioningEvent {
            event_id: Uuid::now_v7(),
            request_id: Uuid::now_v7(),
            occurred_at: Utc::now(),
            direction: EventDirection::In,
            payload: EventPayload::Ack {
                owner_ticket_id: None,
            },
            content_hash: Some("abc".to_string()),
        };
        let first = store.append_event(cbu, event.clone(), None).await.unwrap();
        assert!(matches!(first, AppendResult::Inserted(_)));

        let same_hash = ProvisioningEvent {
            event_id: Uuid::now_v7(),
            ..event.clone()
        };
        let dup = store.append_event(cbu, same_hash, None).await.unwrap();
        assert!(matches!(dup, AppendResult::Duplicate(e) if e.event.event_id == event.event_id));

        let tampered = ProvisioningEvent {
            payload: EventPayload::Ack {
                owner_ticket_id: Some("tampered".to_string()),
            },
            ..event.clone()
        };
        let err = store.append_event(cbu, tampered, None).await.unwrap_err();
        assert!(matches!(err, StoreError::ImmutableEvent { event_id } if event_id == event.event_id));

        let rewritten = ProvisioningEvent {
            content_hash: Some("other".to_string()),
            payload: EventPayload::Ack {
                owner_ticket_id: Some("changed".to_string()),
            },
            ..event.clone()
        };
        let err = store.append_event(cbu, rewritten, None).await.unwrap_err();
        assert!(matches!(err, StoreError::ImmutableEvent { .. }));
    }

    #[tokio::test]
    async fn test_inbound_outcome_follows_stored_request() {
        let store = MemoryStore::new();
        let cbu = Uuid::now_v7();
        let inst = store.ensure_instance(&requirement(cbu, "SRDEF::A::X::main")).await.unwrap();
        let request = queued_request(&inst);
        store.insert_request(request.clone()).await.unwrap();
        store
            .set_request_status(request.request_id, ProvisioningStatus::Sent, None)
            .await
            .unwrap();

        let inbound = |payload: EventPayload, hash: &str| ProvisioningEvent {
            event_id: Uuid::now_v7(),
            request_id: request.request_id,
            occurred_at: Utc::now(),
            direction: EventDirection::In,
            payload,
            content_hash: Some(hash.to_string()),
        };
        let result = inbound(
            EventPayload::Result {
                result: crate::service_resources::types::OwnerProvisioningResult::Success {
                    srid: "SR::A::X::1".to_string(),
                    native_key: "1".to_string(),
                    resource_url: None,
                },
            },
            "result",
        );
        let error = inbound(
            EventPayload::Error {
                code: None,
                message: "owner rejected".to_string(),
            },
            "error",
        );

        let AppendResult::Inserted(first) = store.ingest_inbound(cbu, result).await.unwrap() else {
            panic!("result should be inserted");
        };
        assert_eq!(
            first.outcome.unwrap().disposition,
            EventDisposition::Applied {
                status: ProvisioningStatus::Completed
            }
        );

        // Classified after RESULT committed, so it cannot claim to have failed the request.
        let AppendResult::Inserted(second) = store.ingest_inbound(cbu, error).await.unwrap() else {
            panic!("error should be inserted");
        };
        let outcome = second.outcome.unwrap();
        assert!(matches!(outcome.disposition, EventDisposition::NoChange { .. }));
        assert_eq!(outcome.request_status, ProvisioningStatus::Completed);
        assert_eq!(
            store.get_request(request.request_id).await.unwrap().unwrap().status,
            ProvisioningStatus::Completed
        );
        assert_eq!(store.events_for_request(request.request_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_older_readiness_snapshot_is_rejected() {
        let store = MemoryStore::new();
        let cbu = Uuid::now_v7();
        let now = Utc::now();
        let record = CbuServiceReadiness {
            cbu_id: cbu,
            product_code: "P".to_string(),
            service_code: "S".to_string(),
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
            status: ReadinessStatus::Blocked,
            ..record
        };
        assert!(matches!(
            store.put_readiness(older).await.unwrap(),
            ReadinessWrite::RejectedStale { .. }
        ));
        assert_eq!(store.readiness(cbu).await.unwrap()[0].status, ReadinessStatus::Ready);
    }
}
