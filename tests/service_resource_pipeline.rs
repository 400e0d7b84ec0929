//! Service Resource Pipeline Integration Tests
//!
//! Drives the full pipeline against `MemoryStore`: discovery, attribute
//! rollup and population, layered provisioning, the inbound event ledger and
//! readiness.
//!
//! Run with: cargo test --test service_resource_pipeline

use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use ob_resource_pipeline::service_resources::provisioning::NotReadyReason;
use ob_resource_pipeline::service_resources::readiness::{evaluate_service, ReadinessEngine};
use ob_resource_pipeline::service_resources::srdef_loader::srdef_id;
use ob_resource_pipeline::service_resources::{
    AttributeConstraints, AttributeDefinition, AttributeSource, AttributeSources,
    AttributeValueType, BlockingReason, BlockingReasonType, CandidateValue, DependencyType,
    EventDisposition, EventKind, EventPayload, EvidencePolicy, GapReason, InboundEvent,
    InstanceStatus, IntentOptions, LoadedSrdef, LoadedSrdefAttribute, NewServiceIntent,
    OwnerProvisioningResult, PendingState, ProvisionResult, ProvisioningPayload,
    ProvisioningStatus, ProvisioningStrategy, ReadinessStatus, RequestedBy, RequirementStrength,
    ResourceDependency, ResourceParameters, ResourceProvisioner, ServiceResourcePipelineService,
    SrdefRegistry, StaticSourceProvider, StubProvisioner,
};
use ob_resource_pipeline::PipelineConfig;

// =============================================================================
// FIXTURES
// =============================================================================

fn string_attr(id: &str) -> AttributeDefinition {
    AttributeDefinition {
        id: id.to_string(),
        name: id.to_string(),
        value_type: AttributeValueType::String,
        validation: AttributeConstraints::default(),
        description: None,
    }
}

fn srdef_attr(
    attr_id: &str,
    requirement: RequirementStrength,
    constraints: AttributeConstraints,
) -> LoadedSrdefAttribute {
    LoadedSrdefAttribute {
        attr_id: attr_id.to_string(),
        requirement,
        source_policy: vec![],
        constraints,
        evidence_policy: EvidencePolicy::default(),
        default_value: None,
        condition: None,
        description: None,
    }
}

fn r1_id() -> String {
    srdef_id("CUSTODY", "Account", "safekeeping")
}

fn r2_id() -> String {
    srdef_id("SETTLEMENT", "Ssi", "ssi")
}

/// R1 (create) and R2 (request, depends on R1), both behind SAFEKEEPING.
fn custody_catalog() -> SrdefRegistry {
    let mut r1 = LoadedSrdef::new("CUSTODY", "Account", "safekeeping", ProvisioningStrategy::Create);
    r1.triggered_by_services = vec!["SAFEKEEPING".to_string()];
    r1.attributes = vec![srdef_attr(
        "account_name",
        RequirementStrength::Required,
        AttributeConstraints::default(),
    )];

    let mut r2 = LoadedSrdef::new("SETTLEMENT", "Ssi", "ssi", ProvisioningStrategy::Request);
    r2.triggered_by_services = vec!["SAFEKEEPING".to_string()];
    r2.dependencies = vec![ResourceDependency::required(r1_id()).with_inject_arg("custody_account")];

    SrdefRegistry::from_parts(vec![string_attr("account_name")], vec![r1, r2])
}

fn intent(cbu_id: Uuid, service_code: &str, options: IntentOptions) -> NewServiceIntent {
    NewServiceIntent {
        cbu_id,
        product_code: "CUSTODY".to_string(),
        service_code: service_code.to_string(),
        options,
        created_by: Some("integration".to_string()),
    }
}

fn cbu_sources(cbu_id: Uuid) -> Arc<AttributeSources> {
    let cbu = Arc::new(StaticSourceProvider::new(AttributeSource::Cbu));
    cbu.insert(cbu_id, "account_name", CandidateValue::new(json!("ACME GLOBAL")));
    Arc::new(AttributeSources::new().with_provider(cbu))
}

fn success(request_id: Uuid, srid: &str) -> InboundEvent {
    InboundEvent {
        request_id,
        payload: EventPayload::Result {
            result: OwnerProvisioningResult::Success {
                srid: srid.to_string(),
                native_key: format!("NK-{}", srid),
                resource_url: None,
            },
        },
        content_hash: None,
        occurred_at: None,
    }
}

fn ack(request_id: Uuid, ticket: &str) -> InboundEvent {
    InboundEvent {
        request_id,
        payload: EventPayload::Ack {
            owner_ticket_id: Some(ticket.to_string()),
        },
        content_hash: None,
        occurred_at: None,
    }
}

// =============================================================================
// END TO END
// =============================================================================

#[tokio::test]
async fn test_create_then_request_until_owner_result() {
    let cbu = Uuid::now_v7();
    let svc = ServiceResourcePipelineService::in_memory(custody_catalog()).with_sources(cbu_sources(cbu));
    svc.declare_intent(intent(cbu, "SAFEKEEPING", IntentOptions::default()))
        .await
        .unwrap();

    let run = svc.run_full_pipeline(cbu).await.unwrap();
    assert_eq!(run.discovery.srdefs_discovered, 2);
    assert_eq!(run.discovery.attrs_missing, 0);
    assert_eq!(run.provisioning.requests_created, 1);

    // R1 is active immediately
    let instances = svc.store().instances(cbu).await.unwrap();
    let r1 = instances.iter().find(|i| i.srdef_id == r1_id()).unwrap();
    assert_eq!(r1.status, InstanceStatus::Active);
    assert!(r1.srid.as_deref().unwrap().starts_with("SR::CUSTODY::Account::FAKE-"));

    // R2 was requested only after R1 was active, bound to R1's handle
    let requests = svc.store().requests_for_cbu(cbu).await.unwrap();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(request.srdef_id, r2_id());
    assert_eq!(request.status, ProvisioningStatus::Sent);
    assert!(request.requested_at >= r1.updated_at);
    assert_eq!(
        request.request_payload.bind_to.get("custody_account"),
        r1.handle().as_ref()
    );
    let r2 = instances.iter().find(|i| i.srdef_id == r2_id()).unwrap();
    assert_eq!(r2.status, InstanceStatus::Provisioning);

    let history = svc.request_history(request.request_id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].kind(), EventKind::RequestSent);

    // Blocked on R2 while the owner system works
    let readiness = svc.readiness(cbu).await.unwrap();
    assert_eq!(readiness.len(), 1);
    assert_eq!(readiness[0].status, ReadinessStatus::Blocked);
    assert_eq!(readiness[0].reason_types(), vec![BlockingReasonType::PendingProvisioning]);
    assert!(matches!(
        &readiness[0].blocking_reasons[0],
        BlockingReason::PendingProvisioning { srdef_id, state: PendingState::Sent, .. } if *srdef_id == r2_id()
    ));

    svc.ingest_event(ack(request.request_id, "OPS-1")).await.unwrap();
    let readiness = svc.readiness(cbu).await.unwrap();
    assert_eq!(readiness[0].status, ReadinessStatus::Blocked);

    let result = svc
        .ingest_event(success(request.request_id, "SR::SETTLEMENT::Ssi::0001"))
        .await
        .unwrap();
    assert!(!result.duplicate);
    assert_eq!(
        result.outcome.disposition,
        EventDisposition::Applied {
            status: ProvisioningStatus::Completed
        }
    );

    let readiness = svc.readiness(cbu).await.unwrap();
    assert_eq!(readiness[0].status, ReadinessStatus::Ready);
    assert!(readiness[0].blocking_reasons.is_empty());
    assert_eq!(readiness[0].active_srids.len(), 2);

    let request = svc.store().get_request(request.request_id).await.unwrap().unwrap();
    assert_eq!(request.owner_ticket_id.as_deref(), Some("OPS-1"));
    assert_eq!(request.status, ProvisioningStatus::Completed);
}

#[tokio::test]
async fn test_missing_attribute_holds_provisioning_back() {
    let cbu = Uuid::now_v7();
    let svc = ServiceResourcePipelineService::in_memory(custody_catalog());
    svc.declare_intent(intent(cbu, "SAFEKEEPING", IntentOptions::default()))
        .await
        .unwrap();

    let run = svc.run_full_pipeline(cbu).await.unwrap();
    assert_eq!(run.discovery.attrs_missing, 1);
    assert_eq!(run.provisioning.requests_created, 0);
    assert!(svc.store().requests_for_cbu(cbu).await.unwrap().is_empty());

    let readiness = svc.readiness(cbu).await.unwrap();
    assert_eq!(readiness[0].status, ReadinessStatus::Blocked);
    assert!(readiness[0]
        .reason_types()
        .contains(&BlockingReasonType::MissingAttrs));
}

#[tokio::test]
async fn test_provision_before_rollup_still_requires_attributes() {
    let cbu = Uuid::now_v7();
    let svc = ServiceResourcePipelineService::in_memory(custody_catalog()).with_sources(cbu_sources(cbu));
    svc.declare_intent(intent(cbu, "SAFEKEEPING", IntentOptions::default()))
        .await
        .unwrap();
    svc.discover(cbu).await.unwrap();

    // Nothing rolled up or populated yet
    let result = svc.provision(cbu).await.unwrap();
    assert_eq!(result.activated, 0);
    assert_eq!(result.requests_created, 0);
    assert!(result.not_ready_reasons.iter().any(|(key, reason)| key == &r1_id()
        && matches!(reason, NotReadyReason::MissingAttrs { attr_ids } if attr_ids == &vec!["account_name".to_string()])));
    let instances = svc.store().instances(cbu).await.unwrap();
    assert!(instances.iter().all(|i| i.status != InstanceStatus::Active));

    svc.rollup(cbu).await.unwrap();
    svc.populate(cbu).await.unwrap();
    let result = svc.provision(cbu).await.unwrap();
    assert_eq!(result.activated, 1);
    assert_eq!(result.requests_created, 1);
}

// =============================================================================
// DISCOVER STRATEGY
// =============================================================================

fn gateway_catalog(fallback: ProvisioningStrategy) -> SrdefRegistry {
    let mut gateway = LoadedSrdef::new("SWIFT", "Connectivity", "swift_gateway", ProvisioningStrategy::Discover);
    gateway.triggered_by_services = vec!["SWIFT".to_string()];
    gateway.discover_fallback = fallback;
    SrdefRegistry::from_parts(vec![], vec![gateway])
}

fn gateway_id() -> String {
    srdef_id("SWIFT", "Connectivity", "swift_gateway")
}

/// Finds a gateway the CBU already has.
struct ExistingGateway;

#[async_trait::async_trait]
impl ResourceProvisioner for ExistingGateway {
    async fn provision(
        &self,
        cbu_id: Uuid,
        srdef: &LoadedSrdef,
        payload: &ProvisioningPayload,
    ) -> anyhow::Result<ProvisionResult> {
        StubProvisioner.provision(cbu_id, srdef, payload).await
    }

    async fn find_existing(
        &self,
        _cbu_id: Uuid,
        _srdef: &LoadedSrdef,
        _parameters: &ResourceParameters,
    ) -> anyhow::Result<Option<ProvisionResult>> {
        Ok(Some(ProvisionResult {
            srid: "SR::SWIFT::Connectivity::ACMEGB2L".to_string(),
            native_key: "ACMEGB2L".to_string(),
            resource_url: None,
        }))
    }
}

#[tokio::test]
async fn test_discover_links_existing_resource() {
    let cbu = Uuid::now_v7();
    let svc = ServiceResourcePipelineService::in_memory(gateway_catalog(ProvisioningStrategy::Request))
        .with_provisioner(Arc::new(ExistingGateway));
    svc.declare_intent(intent(cbu, "SWIFT", IntentOptions::default()))
        .await
        .unwrap();

    let run = svc.run_full_pipeline(cbu).await.unwrap();
    assert_eq!(run.provisioning.requests_created, 0);
    assert!(svc.store().requests_for_cbu(cbu).await.unwrap().is_empty());

    let instances = svc.store().instances(cbu).await.unwrap();
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].srdef_id, gateway_id());
    assert_eq!(instances[0].status, InstanceStatus::Active);
    assert_eq!(instances[0].srid.as_deref(), Some("SR::SWIFT::Connectivity::ACMEGB2L"));

    let readiness = svc.readiness(cbu).await.unwrap();
    assert_eq!(readiness[0].status, ReadinessStatus::Ready);
}

#[tokio::test]
async fn test_discover_falls_back_to_request() {
    let cbu = Uuid::now_v7();
    let svc = ServiceResourcePipelineService::in_memory(gateway_catalog(ProvisioningStrategy::Request));
    svc.declare_intent(intent(cbu, "SWIFT", IntentOptions::default()))
        .await
        .unwrap();

    let run = svc.run_full_pipeline(cbu).await.unwrap();
    assert_eq!(run.provisioning.requests_created, 1);

    let requests = svc.store().requests_for_cbu(cbu).await.unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].srdef_id, gateway_id());
    assert_eq!(requests[0].status, ProvisioningStatus::Sent);
    let instances = svc.store().instances(cbu).await.unwrap();
    assert_eq!(instances[0].status, InstanceStatus::Provisioning);
}

// =============================================================================
// DISCOVERY
// =============================================================================

#[tokio::test]
async fn test_discovery_is_idempotent() {
    let cbu = Uuid::now_v7();
    let svc = ServiceResourcePipelineService::in_memory(custody_catalog());
    svc.declare_intent(intent(cbu, "SAFEKEEPING", IntentOptions::default()))
        .await
        .unwrap();

    let first = svc.discover(cbu).await.unwrap();
    assert_eq!(first.sync.inserted, 2);
    let history_before = svc.store().requirement_history(cbu).await.unwrap();

    let second = svc.discover(cbu).await.unwrap();
    assert_eq!(second.sync.inserted, 0);
    assert_eq!(second.sync.superseded, 0);
    assert_eq!(second.sync.unchanged, 2);
    assert_eq!(
        svc.store().requirement_history(cbu).await.unwrap().len(),
        history_before.len()
    );
}

#[tokio::test]
async fn test_two_markets_two_currencies_expand_to_four() {
    let mut ssi = LoadedSrdef::new("SETTLEMENT", "Ssi", "ssi", ProvisioningStrategy::Request);
    ssi.per_market = true;
    ssi.per_currency = true;
    ssi.triggered_by_services = vec!["SETTLEMENT".to_string()];
    let svc = ServiceResourcePipelineService::in_memory(SrdefRegistry::from_parts(vec![], vec![ssi]));

    let cbu = Uuid::now_v7();
    svc.declare_intent(intent(
        cbu,
        "SETTLEMENT",
        IntentOptions {
            markets: vec!["XNYS".to_string(), "XLON".to_string()],
            currencies: vec!["USD".to_string(), "EUR".to_string()],
            ..Default::default()
        },
    ))
    .await
    .unwrap();

    let result = svc.discover(cbu).await.unwrap();
    let mut keys: Vec<String> = result.discovered.iter().map(|r| r.requirement_key()).collect();
    keys.sort();
    keys.dedup();
    assert_eq!(keys.len(), 4);
    assert!(keys.contains(&format!("{}[currency=EUR,market=XLON]", r2_id())));
    assert!(keys.contains(&format!("{}[currency=USD,market=XNYS]", r2_id())));
}

#[tokio::test]
async fn test_narrowed_options_supersede_requirements() {
    let mut ssi = LoadedSrdef::new("SETTLEMENT", "Ssi", "ssi", ProvisioningStrategy::Request);
    ssi.per_market = true;
    ssi.triggered_by_services = vec!["SETTLEMENT".to_string()];
    let svc = ServiceResourcePipelineService::in_memory(SrdefRegistry::from_parts(vec![], vec![ssi]));

    let cbu = Uuid::now_v7();
    let v1 = svc
        .declare_intent(intent(
            cbu,
            "SETTLEMENT",
            IntentOptions {
                markets: vec!["XNYS".to_string(), "XLON".to_string()],
                ..Default::default()
            },
        ))
        .await
        .unwrap();
    svc.discover(cbu).await.unwrap();

    svc.supersede_intent(
        v1.intent_id,
        IntentOptions {
            markets: vec!["XNYS".to_string()],
            ..Default::default()
        },
        None,
    )
    .await
    .unwrap();
    let result = svc.discover(cbu).await.unwrap();
    // XLON dropped; XNYS re-explained by the new intent version
    assert_eq!(result.sync.superseded, 2);
    assert_eq!(result.sync.inserted, 1);

    let active = svc.store().active_requirements(cbu).await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].parameters.get("market").map(String::as_str), Some("XNYS"));
    assert_eq!(svc.store().requirement_history(cbu).await.unwrap().len(), 3);
}

// =============================================================================
// ROLLUP AND POPULATION
// =============================================================================

fn two_contributors(a: LoadedSrdefAttribute, b: LoadedSrdefAttribute) -> SrdefRegistry {
    let mut first = LoadedSrdef::new("CUSTODY", "Account", "first", ProvisioningStrategy::Create);
    first.triggered_by_services = vec!["SAFEKEEPING".to_string()];
    first.attributes = vec![a];
    let mut second = LoadedSrdef::new("CASH", "Account", "second", ProvisioningStrategy::Create);
    second.triggered_by_services = vec!["SAFEKEEPING".to_string()];
    second.attributes = vec![b];
    SrdefRegistry::from_parts(vec![string_attr("lei"), string_attr("account_name")], vec![first, second])
}

#[tokio::test]
async fn test_required_wins_over_optional() {
    let registry = two_contributors(
        srdef_attr("lei", RequirementStrength::Optional, AttributeConstraints::default()),
        srdef_attr("lei", RequirementStrength::Required, AttributeConstraints::default()),
    );
    let svc = ServiceResourcePipelineService::in_memory(registry);
    let cbu = Uuid::now_v7();
    svc.declare_intent(intent(cbu, "SAFEKEEPING", IntentOptions::default()))
        .await
        .unwrap();
    svc.discover(cbu).await.unwrap();
    let rollup = svc.rollup(cbu).await.unwrap();

    assert_eq!(rollup.total_attributes, 1);
    assert_eq!(rollup.required_count, 1);
    let lei = &rollup.requirements[0];
    assert_eq!(lei.requirement_strength, RequirementStrength::Required);
    assert_eq!(lei.required_by_srdefs.len(), 2);
}

#[tokio::test]
async fn test_disjoint_length_constraints_conflict() {
    let registry = two_contributors(
        srdef_attr(
            "account_name",
            RequirementStrength::Required,
            AttributeConstraints {
                min_length: Some(5),
                ..Default::default()
            },
        ),
        srdef_attr(
            "account_name",
            RequirementStrength::Required,
            AttributeConstraints {
                max_length: Some(3),
                ..Default::default()
            },
        ),
    );
    let cbu = Uuid::now_v7();
    let svc = ServiceResourcePipelineService::in_memory(registry).with_sources(cbu_sources(cbu));
    svc.declare_intent(intent(cbu, "SAFEKEEPING", IntentOptions::default()))
        .await
        .unwrap();

    let run = svc.run_full_pipeline(cbu).await.unwrap();
    assert_eq!(run.discovery.rollup.conflict_count, 1);
    let conflict = run.discovery.rollup.requirements[0].conflict.as_ref().unwrap();
    assert_eq!(conflict.contributors.len(), 2);

    // Never populated, never silently resolved
    assert!(run
        .discovery
        .population
        .gaps
        .iter()
        .any(|g| g.attr_id == "account_name" && g.reason == GapReason::Conflict));
    assert!(svc.store().attr_values(cbu).await.unwrap().is_empty());
    assert_eq!(run.provisioning.provisioning.activated, 0);

    let readiness = svc.readiness(cbu).await.unwrap();
    assert!(readiness[0]
        .reason_types()
        .contains(&BlockingReasonType::AttrConflict));
}

#[tokio::test]
async fn test_entity_value_beats_later_manual_value() {
    let mut r1 = LoadedSrdef::new("CUSTODY", "Account", "safekeeping", ProvisioningStrategy::Create);
    r1.triggered_by_services = vec!["SAFEKEEPING".to_string()];
    r1.attributes = vec![srdef_attr(
        "legal_name",
        RequirementStrength::Required,
        AttributeConstraints::default(),
    )];
    let registry = SrdefRegistry::from_parts(vec![string_attr("legal_name")], vec![r1]);

    let cbu = Uuid::now_v7();
    let entity = Arc::new(StaticSourceProvider::new(AttributeSource::Entity));
    entity.insert(cbu, "legal_name", CandidateValue::new(json!("Acme Global Fund Ltd")));
    let manual = Arc::new(StaticSourceProvider::new(AttributeSource::Manual));
    manual.insert(cbu, "legal_name", CandidateValue::new(json!("ACME (typed by ops)")));
    let sources = AttributeSources::new()
        .with_provider(manual)
        .with_provider(entity);

    let svc = ServiceResourcePipelineService::in_memory(registry).with_sources(Arc::new(sources));
    svc.declare_intent(intent(cbu, "SAFEKEEPING", IntentOptions::default()))
        .await
        .unwrap();
    svc.run_full_pipeline(cbu).await.unwrap();

    let values = svc.store().attr_values(cbu).await.unwrap();
    assert_eq!(values.len(), 1);
    assert_eq!(values[0].source, AttributeSource::Entity);
    assert_eq!(values[0].value, json!("Acme Global Fund Ltd"));
}

// =============================================================================
// LEDGER
// =============================================================================

async fn service_with_sent_request() -> (ServiceResourcePipelineService, Uuid, Uuid) {
    let cbu = Uuid::now_v7();
    let svc = ServiceResourcePipelineService::in_memory(custody_catalog()).with_sources(cbu_sources(cbu));
    svc.declare_intent(intent(cbu, "SAFEKEEPING", IntentOptions::default()))
        .await
        .unwrap();
    let run = svc.run_full_pipeline(cbu).await.unwrap();
    let request_id = run.provisioning.provisioning.created_request_ids[0];
    (svc, cbu, request_id)
}

#[tokio::test]
async fn test_same_event_twice_is_recorded_once() {
    let (svc, _, request_id) = service_with_sent_request().await;

    let first = svc.ingest_event(ack(request_id, "OPS-7")).await.unwrap();
    let second = svc.ingest_event(ack(request_id, "OPS-7")).await.unwrap();
    assert!(!first.duplicate);
    assert!(second.duplicate);
    assert_eq!(first.outcome, second.outcome);

    let history = svc.request_history(request_id).await.unwrap();
    let acks = history.iter().filter(|e| e.kind() == EventKind::Ack).count();
    assert_eq!(acks, 1);
}

#[tokio::test]
async fn test_late_ack_after_result_does_not_regress() {
    let (svc, _, request_id) = service_with_sent_request().await;

    svc.ingest_event(success(request_id, "SR::SETTLEMENT::Ssi::0009"))
        .await
        .unwrap();
    let late = svc.ingest_event(ack(request_id, "OPS-LATE")).await.unwrap();
    assert!(matches!(late.outcome.disposition, EventDisposition::NoChange { .. }));
    assert_eq!(late.outcome.request_status, ProvisioningStatus::Completed);

    let request = svc.store().get_request(request_id).await.unwrap().unwrap();
    assert_eq!(request.status, ProvisioningStatus::Completed);
    // Recorded all the same
    assert_eq!(svc.request_history(request_id).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_failed_request_waits_for_explicit_retry() {
    let (svc, cbu, request_id) = service_with_sent_request().await;

    svc.ingest_event(InboundEvent {
        request_id,
        payload: EventPayload::Error {
            code: Some("E42".to_string()),
            message: "BIC not recognised".to_string(),
        },
        content_hash: None,
        occurred_at: None,
    })
    .await
    .unwrap();

    let readiness = svc.readiness(cbu).await.unwrap();
    assert_eq!(
        readiness[0].reason_types(),
        vec![BlockingReasonType::FailedProvisioning]
    );
    // R1 is active but R2 is the terminal resource
    assert_eq!(readiness[0].status, ReadinessStatus::Blocked);

    // A plain re-run never re-sends
    let rerun = svc.run_full_pipeline(cbu).await.unwrap();
    assert_eq!(rerun.provisioning.requests_created, 0);
    assert_eq!(svc.store().requests_for_cbu(cbu).await.unwrap().len(), 1);

    let retry = svc
        .retry_request(request_id, "BIC corrected", RequestedBy::Operator)
        .await
        .unwrap();
    assert_eq!(retry.attempt, 2);
    assert_eq!(retry.retry_of, Some(request_id));
    assert_eq!(retry.status, ProvisioningStatus::Sent);

    let original = svc.store().get_request(request_id).await.unwrap().unwrap();
    assert_eq!(retry.instance_id, original.instance_id);
    assert_eq!(retry.requirement_key, original.requirement_key);
    assert_ne!(
        retry.request_payload.idempotency_key,
        original.request_payload.idempotency_key
    );
    let history = svc.request_history(request_id).await.unwrap();
    assert_eq!(history.last().map(|e| e.kind()), Some(EventKind::Retry));
    let Some(EventPayload::Retry { next_request_id, .. }) = history.last().map(|e| &e.payload) else {
        panic!("last event is not a retry");
    };
    assert_eq!(*next_request_id, retry.request_id);
    assert!(svc.store().get_request(*next_request_id).await.unwrap().is_some());

    assert!(svc
        .retry_request(request_id, "again", RequestedBy::Operator)
        .await
        .is_err());
}

#[tokio::test]
async fn test_overdue_requests_use_configured_sla() {
    let cbu = Uuid::now_v7();
    let config = PipelineConfig {
        provisioning_sla: std::time::Duration::from_secs(60),
        ..Default::default()
    };
    let svc = ServiceResourcePipelineService::in_memory(custody_catalog())
        .with_sources(cbu_sources(cbu))
        .with_config(config);
    svc.declare_intent(intent(cbu, "SAFEKEEPING", IntentOptions::default()))
        .await
        .unwrap();
    svc.run_full_pipeline(cbu).await.unwrap();

    assert!(svc.overdue_requests(Utc::now()).await.unwrap().is_empty());
    let later = Utc::now() + chrono::Duration::minutes(5);
    assert_eq!(svc.overdue_requests(later).await.unwrap().len(), 1);
}

// =============================================================================
// CONCURRENCY
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dependents_never_start_before_dependency_is_active() {
    // Owner-system parent, synchronously created child
    let mut parent = LoadedSrdef::new("SETTLEMENT", "Ssi", "ssi", ProvisioningStrategy::Request);
    parent.triggered_by_services = vec!["SETTLEMENT".to_string()];
    let mut child = LoadedSrdef::new("CUSTODY", "Account", "cash", ProvisioningStrategy::Create);
    child.triggered_by_services = vec!["SETTLEMENT".to_string()];
    child.dependencies = vec![ResourceDependency {
        depends_on: r2_id(),
        dependency_type: DependencyType::Required,
        inject_arg: Some("ssi".to_string()),
        priority: 0,
        condition: None,
    }];
    let registry = SrdefRegistry::from_parts(vec![], vec![parent, child]);

    let svc = Arc::new(ServiceResourcePipelineService::in_memory(registry));
    let cbu = Uuid::now_v7();
    svc.declare_intent(intent(cbu, "SETTLEMENT", IntentOptions::default()))
        .await
        .unwrap();
    svc.discover(cbu).await.unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let svc = Arc::clone(&svc);
            tokio::spawn(async move { svc.provision(cbu).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let requests = svc.store().requests_for_cbu(cbu).await.unwrap();
    assert_eq!(requests.len(), 1, "parent requested exactly once");
    let instances = svc.store().instances(cbu).await.unwrap();
    assert_eq!(instances.len(), 2);
    let cash_id = srdef_id("CUSTODY", "Account", "cash");
    let cash = instances.iter().find(|i| i.srdef_id == cash_id).unwrap();
    assert_eq!(cash.status, InstanceStatus::Pending);

    svc.ingest_event(success(requests[0].request_id, "SR::SETTLEMENT::Ssi::0100"))
        .await
        .unwrap();

    let instances = svc.store().instances(cbu).await.unwrap();
    let parent = instances.iter().find(|i| i.srdef_id == r2_id()).unwrap();
    let cash = instances.iter().find(|i| i.srdef_id == cash_id).unwrap();
    assert_eq!(cash.status, InstanceStatus::Active);
    assert!(cash.updated_at >= parent.updated_at);
    let readiness = svc.readiness(cbu).await.unwrap();
    assert_eq!(readiness[0].status, ReadinessStatus::Ready);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cbus_run_independently() {
    let cbus: Vec<Uuid> = (0..6).map(|_| Uuid::now_v7()).collect();
    let cbu_source = Arc::new(StaticSourceProvider::new(AttributeSource::Cbu));
    // Every other CBU lacks its account name
    for cbu in cbus.iter().step_by(2) {
        cbu_source.insert(*cbu, "account_name", CandidateValue::new(json!("ACME")));
    }
    let svc = ServiceResourcePipelineService::in_memory(custody_catalog())
        .with_sources(Arc::new(AttributeSources::new().with_provider(cbu_source)));
    for cbu in &cbus {
        svc.declare_intent(intent(*cbu, "SAFEKEEPING", IntentOptions::default()))
            .await
            .unwrap();
    }

    let results = svc.run_for_cbus(&cbus).await;
    assert_eq!(results.len(), cbus.len());
    for (i, cbu) in cbus.iter().enumerate() {
        let (_, run) = results.iter().find(|(id, _)| id == cbu).unwrap();
        let run = run.as_ref().unwrap();
        let expected = if i % 2 == 0 { 1 } else { 0 };
        assert_eq!(run.provisioning.requests_created, expected);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_same_event_delivered_concurrently_is_recorded_once() {
    let (svc, _, request_id) = service_with_sent_request().await;
    let svc = Arc::new(svc);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let svc = Arc::clone(&svc);
            tokio::spawn(async move { svc.ingest_event(ack(request_id, "OPS-8")).await })
        })
        .collect();
    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap().unwrap());
    }

    assert_eq!(results.iter().filter(|r| !r.duplicate).count(), 1);
    assert!(results.iter().all(|r| r.outcome == results[0].outcome));

    let history = svc.request_history(request_id).await.unwrap();
    let acks = history.iter().filter(|e| e.kind() == EventKind::Ack).count();
    assert_eq!(acks, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_result_and_error_record_what_took_effect() {
    let (svc, cbu, request_id) = service_with_sent_request().await;
    let svc = Arc::new(svc);

    let completed = {
        let svc = Arc::clone(&svc);
        tokio::spawn(async move {
            svc.ingest_event(success(request_id, "SR::SETTLEMENT::Ssi::0200"))
                .await
        })
    };
    let failed = {
        let svc = Arc::clone(&svc);
        tokio::spawn(async move {
            svc.ingest_event(InboundEvent {
                request_id,
                payload: EventPayload::Error {
                    code: None,
                    message: "owner timeout".to_string(),
                },
                content_hash: None,
                occurred_at: None,
            })
            .await
        })
    };
    let outcomes = [
        completed.await.unwrap().unwrap().outcome,
        failed.await.unwrap().unwrap().outcome,
    ];

    let applied: Vec<ProvisioningStatus> = outcomes
        .iter()
        .filter_map(|o| match o.disposition {
            EventDisposition::Applied { status } => Some(status),
            _ => None,
        })
        .collect();
    assert_eq!(applied.len(), 1, "exactly one terminal event takes effect");

    let request = svc.store().get_request(request_id).await.unwrap().unwrap();
    assert_eq!(request.status, applied[0]);
    for outcome in &outcomes {
        if matches!(outcome.disposition, EventDisposition::NoChange { .. }) {
            assert_eq!(outcome.request_status, request.status);
        }
    }
    // Both recorded, each with the outcome it was returned
    let history = svc.request_history(request_id).await.unwrap();
    assert_eq!(history.len(), 3);

    let instances = svc.store().instances(cbu).await.unwrap();
    let r2 = instances.iter().find(|i| i.srdef_id == r2_id()).unwrap();
    let expected = if request.status == ProvisioningStatus::Completed {
        InstanceStatus::Active
    } else {
        InstanceStatus::Pending
    };
    assert_eq!(r2.status, expected);
}

// =============================================================================
// READINESS
// =============================================================================

#[tokio::test]
async fn test_readiness_is_deterministic_for_a_snapshot() {
    let (svc, cbu, _) = service_with_sent_request().await;
    let engine = ReadinessEngine::new(svc.store(), svc.registry());
    let snapshot = engine.snapshot(cbu).await.unwrap();
    let intents = svc.store().active_intents(cbu).await.unwrap();

    let a = evaluate_service(svc.registry(), &intents[0], &snapshot, Some("test"));
    let b = evaluate_service(svc.registry(), &intents[0], &snapshot, Some("test"));
    assert!(a.same_outcome(&b));
    assert_eq!(a.as_of, b.as_of);
    assert_eq!(
        serde_json::to_value(&a.blocking_reasons).unwrap(),
        serde_json::to_value(&b.blocking_reasons).unwrap()
    );

    let first = engine.compute_for_cbu(cbu, "test").await.unwrap();
    let second = engine.compute_for_cbu(cbu, "test").await.unwrap();
    assert!(first.records[0].same_outcome(&second.records[0]));
    assert_eq!(second.rejected_stale, 0);
}

#[tokio::test]
async fn test_lifecycle_changes_mark_readiness_stale() {
    let (svc, cbu, request_id) = service_with_sent_request().await;
    svc.ingest_event(success(request_id, "SR::SETTLEMENT::Ssi::0042"))
        .await
        .unwrap();
    assert_eq!(svc.readiness(cbu).await.unwrap()[0].status, ReadinessStatus::Ready);

    let instances = svc.store().instances(cbu).await.unwrap();
    let r1 = instances.iter().find(|i| i.srdef_id == r1_id()).unwrap();
    svc.suspend_instance(r1.instance_id).await.unwrap();
    assert!(svc.store().readiness(cbu).await.unwrap()[0].is_stale);

    let refreshed = svc.refresh_stale_readiness().await.unwrap();
    assert_eq!(refreshed.len(), 1);
    let readiness = svc.readiness(cbu).await.unwrap();
    // R2 still active, so only partially ready
    assert_eq!(readiness[0].status, ReadinessStatus::Partial);
    assert!(matches!(
        &readiness[0].blocking_reasons[0],
        BlockingReason::PendingProvisioning { state: PendingState::Suspended, .. }
    ));
}
