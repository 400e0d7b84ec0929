//! Attribute Population Engine
//!
//! Fills unified attribute requirements from pluggable sources. Sources are
//! consulted in fixed priority order (derived, entity, cbu, document,
//! manual, external) restricted to the requirement's source policy; the
//! first candidate that passes type, constraint and evidence checks wins.
//! Values that can no longer be justified are removed, and every unfilled
//! requirement gets a typed gap reason.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::srdef_loader::SrdefRegistry;
use super::store::PipelineStore;
use super::types::*;

// =============================================================================
// SOURCES
// =============================================================================

/// A value offered by a source, with its provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateValue {
    pub value: JsonValue,
    #[serde(default)]
    pub evidence_refs: Vec<EvidenceRef>,
    /// Derivation rule for computed values.
    #[serde(default)]
    pub derivation: Option<String>,
}

impl CandidateValue {
    pub fn new(value: JsonValue) -> Self {
        Self {
            value,
            evidence_refs: Vec::new(),
            derivation: None,
        }
    }

    pub fn with_evidence(mut self, evidence: EvidenceRef) -> Self {
        self.evidence_refs.push(evidence);
        self
    }
}

/// Pluggable attribute source.
#[async_trait]
pub trait AttributeSourceProvider: Send + Sync {
    fn source(&self) -> AttributeSource;

    /// Candidates for one attribute, best first.
    async fn candidates(
        &self,
        cbu_id: Uuid,
        attribute: &AttributeDefinition,
    ) -> Result<Vec<CandidateValue>>;
}

/// Fixed in-memory values, keyed by (cbu, attribute).
pub struct StaticSourceProvider {
    source: AttributeSource,
    values: RwLock<HashMap<(Uuid, String), Vec<CandidateValue>>>,
}

impl StaticSourceProvider {
    pub fn new(source: AttributeSource) -> Self {
        Self {
            source,
            values: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, cbu_id: Uuid, attr_id: &str, candidate: CandidateValue) {
        self.values
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .entry((cbu_id, attr_id.to_string()))
            .or_default()
            .push(candidate);
    }

    pub fn clear(&self, cbu_id: Uuid, attr_id: &str) {
        self.values
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&(cbu_id, attr_id.to_string()));
    }
}

#[async_trait]
impl AttributeSourceProvider for StaticSourceProvider {
    fn source(&self) -> AttributeSource {
        self.source
    }

    async fn candidates(
        &self,
        cbu_id: Uuid,
        attribute: &AttributeDefinition,
    ) -> Result<Vec<CandidateValue>> {
        let values = self.values.read().unwrap_or_else(|p| p.into_inner());
        Ok(values
            .get(&(cbu_id, attribute.id.clone()))
            .cloned()
            .unwrap_or_default())
    }
}

/// Registered providers, grouped by source.
#[derive(Default, Clone)]
pub struct AttributeSources {
    providers: Vec<Arc<dyn AttributeSourceProvider>>,
}

impl AttributeSources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider(mut self, provider: Arc<dyn AttributeSourceProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn register(&mut self, provider: Arc<dyn AttributeSourceProvider>) {
        self.providers.push(provider);
    }

    fn for_source(&self, source: AttributeSource) -> impl Iterator<Item = &Arc<dyn AttributeSourceProvider>> {
        self.providers.iter().filter(move |p| p.source() == source)
    }
}

// =============================================================================
// POPULATION ENGINE
// =============================================================================

/// Why a requirement has no value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum GapReason {
    NoCandidate,
    ConstraintViolation { message: String },
    EvidencePolicyFailed { message: String },
    Conflict,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeGap {
    pub attr_id: String,
    pub strength: RequirementStrength,
    pub reason: GapReason,
}

/// Result of population operation
#[derive(Debug, Default, Serialize)]
pub struct PopulationResult {
    pub populated: usize,
    pub already_populated: usize,
    pub removed: usize,
    /// Required attributes left without a value
    pub still_missing: usize,
    pub gaps: Vec<AttributeGap>,
}

enum Resolution {
    Value(CbuAttrValue),
    Gap(GapReason),
}

/// Engine for populating attribute values from various sources
pub struct PopulationEngine<'a> {
    store: &'a dyn PipelineStore,
    registry: &'a SrdefRegistry,
    sources: &'a AttributeSources,
}

impl<'a> PopulationEngine<'a> {
    pub fn new(
        store: &'a dyn PipelineStore,
        registry: &'a SrdefRegistry,
        sources: &'a AttributeSources,
    ) -> Self {
        Self {
            store,
            registry,
            sources,
        }
    }

    /// Bring attribute values in line with the unified requirements
    pub async fn populate_for_cbu(&self, cbu_id: Uuid) -> Result<PopulationResult> {
        info!("Starting attribute population for CBU {}", cbu_id);
        let now = Utc::now();

        let requirements = self
            .store
            .unified_requirements(cbu_id)
            .await
            .context("Failed to load unified requirements")?;
        let existing: BTreeMap<String, CbuAttrValue> = self
            .store
            .attr_values(cbu_id)
            .await?
            .into_iter()
            .map(|v| (v.attr_id.clone(), v))
            .collect();

        let mut result = PopulationResult::default();

        for req in &requirements {
            let resolution = match self.registry.attribute(&req.attr_id) {
                Some(definition) => self.resolve(cbu_id, req, definition, now).await?,
                None => {
                    warn!("Attribute {} missing from dictionary", req.attr_id);
                    Resolution::Gap(GapReason::NoCandidate)
                }
            };

            match resolution {
                Resolution::Value(value) => match existing.get(&req.attr_id) {
                    Some(current) if current.same_content(&value) => {
                        result.already_populated += 1;
                    }
                    _ => {
                        debug!(
                            "Populated {} for CBU {} from {}",
                            req.attr_id, cbu_id, value.source
                        );
                        self.store.put_attr_value(value).await?;
                        result.populated += 1;
                    }
                },
                Resolution::Gap(reason) => {
                    if existing.contains_key(&req.attr_id)
                        && self.store.remove_attr_value(cbu_id, &req.attr_id).await?
                    {
                        result.removed += 1;
                    }
                    if req.is_required() {
                        result.still_missing += 1;
                    }
                    result.gaps.push(AttributeGap {
                        attr_id: req.attr_id.clone(),
                        strength: req.requirement_strength,
                        reason,
                    });
                }
            }
        }

        // Values for attributes nothing requires any more
        for attr_id in existing.keys() {
            if !requirements.iter().any(|r| &r.attr_id == attr_id)
                && self.store.remove_attr_value(cbu_id, attr_id).await?
            {
                result.removed += 1;
            }
        }

        if result.populated > 0 || result.removed > 0 {
            self.store.mark_readiness_stale(cbu_id, "population").await?;
        }

        info!(
            "Population complete for CBU {}: {} populated, {} unchanged, {} removed, {} required missing",
            cbu_id, result.populated, result.already_populated, result.removed, result.still_missing
        );
        Ok(result)
    }

    async fn resolve(
        &self,
        cbu_id: Uuid,
        req: &CbuUnifiedAttrRequirement,
        definition: &AttributeDefinition,
        now: DateTime<Utc>,
    ) -> Result<Resolution> {
        if req.conflict.is_some() {
            return Ok(Resolution::Gap(GapReason::Conflict));
        }

        let mut trace = Vec::new();
        let mut constraint_failure: Option<String> = None;
        let mut evidence_failure: Option<String> = None;

        for source in AttributeSource::PRIORITY {
            if !req.source_policy.is_empty() && !req.source_policy.contains(&source) {
                continue;
            }
            for provider in self.sources.for_source(source) {
                let candidates = match provider.candidates(cbu_id, definition).await {
                    Ok(candidates) => candidates,
                    Err(e) => {
                        warn!(
                            "Source {} failed for attribute {}: {:#}",
                            source, definition.id, e
                        );
                        trace.push(explain("source_error", json!(source), json!(e.to_string())));
                        continue;
                    }
                };
                for candidate in candidates {
                    if let Err(message) = check_candidate(req, definition, &candidate.value) {
                        trace.push(explain("rejected_constraint", candidate.value.clone(), json!(&message)));
                        constraint_failure.get_or_insert(message);
                        continue;
                    }
                    if let Err(message) = req.evidence_policy.check(&candidate.evidence_refs, now) {
                        trace.push(explain("rejected_evidence", candidate.value.clone(), json!(&message)));
                        evidence_failure.get_or_insert(message);
                        continue;
                    }
                    trace.push(explain(
                        candidate.derivation.as_deref().unwrap_or("source_priority"),
                        json!(source),
                        candidate.value.clone(),
                    ));
                    return Ok(Resolution::Value(CbuAttrValue {
                        cbu_id,
                        attr_id: req.attr_id.clone(),
                        value: candidate.value,
                        source,
                        evidence_refs: candidate.evidence_refs,
                        explain_refs: trace,
                        as_of: now,
                    }));
                }
            }
        }

        if let Some(default) = &req.default_value {
            if check_candidate(req, definition, default).is_ok() {
                trace.push(explain("declared_default", JsonValue::Null, default.clone()));
                return Ok(Resolution::Value(CbuAttrValue {
                    cbu_id,
                    attr_id: req.attr_id.clone(),
                    value: default.clone(),
                    source: AttributeSource::Derived,
                    evidence_refs: Vec::new(),
                    explain_refs: trace,
                    as_of: now,
                }));
            }
        }

        let reason = match (evidence_failure, constraint_failure) {
            (Some(message), _) => GapReason::EvidencePolicyFailed { message },
            (None, Some(message)) => GapReason::ConstraintViolation { message },
            (None, None) => GapReason::NoCandidate,
        };
        Ok(Resolution::Gap(reason))
    }
}

fn check_candidate(
    req: &CbuUnifiedAttrRequirement,
    definition: &AttributeDefinition,
    value: &JsonValue,
) -> Result<(), String> {
    if !definition.value_type.accepts(value) {
        return Err(format!("{} is not a valid {}", value, definition.value_type));
    }
    req.merged_constraints.check(value)
}

fn explain(rule: &str, input: JsonValue, output: JsonValue) -> ExplainRef {
    ExplainRef {
        rule: rule.to_string(),
        input: Some(input),
        output: Some(output),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service_resources::store::MemoryStore;
    use std::collections::BTreeSet;

    fn registry() -> SrdefRegistry {
        SrdefRegistry::from_parts(
            vec![AttributeDefinition {
                id: "settlement_bic".to_string(),
                name: "Settlement BIC".to_string(),
                value_type: AttributeValueType::String,
                validation: AttributeConstraints {
                    min_length: Some(8),
                    max_length: Some(11),
                    ..Default::default()
                },
                description: None,
            }],
            vec![],
        )
    }

    fn requirement(cbu_id: Uuid, sources: Vec<AttributeSource>) -> CbuUnifiedAttrRequirement {
        CbuUnifiedAttrRequirement {
            cbu_id,
            attr_id: "settlement_bic".to_string(),
            requirement_strength: RequirementStrength::Required,
            merged_constraints: AttributeConstraints {
                min_length: Some(8),
                max_length: Some(11),
                ..Default::default()
            },
            evidence_policy: EvidencePolicy::default(),
            preferred_source: sources.first().copied(),
            source_policy: sources,
            required_by_srdefs: BTreeSet::from(["SRDEF::A".to_string()]),
            default_value: None,
            conflict: None,
        }
    }

    #[tokio::test]
    async fn test_priority_order_wins_over_recency() {
        let store = MemoryStore::new();
        let registry = registry();
        let cbu = Uuid::now_v7();
        store
            .replace_unified_requirements(cbu, vec![requirement(cbu, vec![])])
            .await
            .unwrap();

        let manual = Arc::new(StaticSourceProvider::new(AttributeSource::Manual));
        manual.insert(cbu, "settlement_bic", CandidateValue::new(json!("MANUALXXXXX")));
        let entity = Arc::new(StaticSourceProvider::new(AttributeSource::Entity));
        entity.insert(cbu, "settlement_bic", CandidateValue::new(json!("ENTITYXX")));
        let sources = AttributeSources::new()
            .with_provider(manual)
            .with_provider(entity);

        let result = PopulationEngine::new(&store, &registry, &sources)
            .populate_for_cbu(cbu)
            .await
            .unwrap();
        assert_eq!(result.populated, 1);
        let values = store.attr_values(cbu).await.unwrap();
        assert_eq!(values[0].value, json!("ENTITYXX"));
        assert_eq!(values[0].source, AttributeSource::Entity);
    }

    #[tokio::test]
    async fn test_invalid_candidates_fall_through_and_gap_is_typed() {
        let store = MemoryStore::new();
        let registry = registry();
        let cbu = Uuid::now_v7();
        let mut req = requirement(cbu, vec![AttributeSource::Cbu]);
        req.evidence_policy.requires_verified_document = true;
        store.replace_unified_requirements(cbu, vec![req]).await.unwrap();

        let cbu_source = Arc::new(StaticSourceProvider::new(AttributeSource::Cbu));
        cbu_source.insert(cbu, "settlement_bic", CandidateValue::new(json!("SHORT")));
        cbu_source.insert(cbu, "settlement_bic", CandidateValue::new(json!("DEUTDEFFXXX")));
        let sources = AttributeSources::new().with_provider(cbu_source);

        let result = PopulationEngine::new(&store, &registry, &sources)
            .populate_for_cbu(cbu)
            .await
            .unwrap();
        assert_eq!(result.still_missing, 1);
        assert!(matches!(
            result.gaps[0].reason,
            GapReason::EvidencePolicyFailed { .. }
        ));
    }

    #[tokio::test]
    async fn test_default_is_recorded_as_derived_and_stale_values_removed() {
        let store = MemoryStore::new();
        let registry = registry();
        let cbu = Uuid::now_v7();
        let mut req = requirement(cbu, vec![AttributeSource::Manual]);
        req.default_value = Some(json!("DEFAULTXX"));
        store.replace_unified_requirements(cbu, vec![req]).await.unwrap();

        let sources = AttributeSources::new();
        let engine = PopulationEngine::new(&store, &registry, &sources);
        engine.populate_for_cbu(cbu).await.unwrap();
        let values = store.attr_values(cbu).await.unwrap();
        assert_eq!(values[0].source, AttributeSource::Derived);
        assert_eq!(values[0].explain_refs.last().unwrap().rule, "declared_default");

        let second = engine.populate_for_cbu(cbu).await.unwrap();
        assert_eq!(second.populated, 0);
        assert_eq!(second.already_populated, 1);

        store.replace_unified_requirements(cbu, vec![]).await.unwrap();
        let third = engine.populate_for_cbu(cbu).await.unwrap();
        assert_eq!(third.removed, 1);
        assert!(store.attr_values(cbu).await.unwrap().is_empty());
    }
}
