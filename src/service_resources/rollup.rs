//! Attribute Rollup Engine
//!
//! Merges the attribute requirements of every active requirement into one
//! dictionary-keyed requirement per attribute. Merging narrows: strengths
//! take the stronger, numeric and length bounds intersect, allowed-value
//! sets intersect, evidence policies take the strictest. An empty
//! intersection is recorded as a conflict instead of a merged bound.

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::condition::{condition_context, parse_condition};
use super::srdef_loader::{LoadedSrdefAttribute, SrdefRegistry};
use super::store::PipelineStore;
use super::types::*;

// =============================================================================
// ATTRIBUTE ROLLUP ENGINE
// =============================================================================

/// Engine for rolling up attribute requirements across discovered SRDEFs
pub struct AttributeRollupEngine<'a> {
    store: &'a dyn PipelineStore,
    registry: &'a SrdefRegistry,
}

/// Result of rollup operation
#[derive(Debug, Default, Serialize)]
pub struct RollupResult {
    pub total_attributes: usize,
    pub required_count: usize,
    pub optional_count: usize,
    pub conflict_count: usize,
    pub requirements: Vec<CbuUnifiedAttrRequirement>,
}

impl<'a> AttributeRollupEngine<'a> {
    pub fn new(store: &'a dyn PipelineStore, registry: &'a SrdefRegistry) -> Self {
        Self { store, registry }
    }

    /// Build unified attribute requirements for a CBU
    pub async fn rollup_for_cbu(&self, cbu_id: Uuid) -> Result<RollupResult> {
        info!("Starting attribute rollup for CBU {}", cbu_id);

        let discoveries = self
            .store
            .active_requirements(cbu_id)
            .await
            .context("Failed to load active requirements")?;
        let intents = self.store.active_intents(cbu_id).await?;
        let facts = self.store.cbu_facts(cbu_id).await?;

        let options_by_intent: HashMap<Uuid, &IntentOptions> =
            intents.iter().map(|i| (i.intent_id, &i.options)).collect();
        let default_options = IntentOptions::default();

        // attr_id -> srdef_id -> declaration
        let mut contributions: BTreeMap<String, BTreeMap<String, &LoadedSrdefAttribute>> =
            BTreeMap::new();

        for discovery in &discoveries {
            let Some(srdef) = self.registry.get(&discovery.srdef_id) else {
                warn!(
                    "Active requirement {} references unknown SRDEF, skipping",
                    discovery.requirement_key()
                );
                continue;
            };
            let options = discovery
                .reason
                .triggered_by_intents
                .iter()
                .find_map(|id| options_by_intent.get(id).copied())
                .unwrap_or(&default_options);

            for attr in &srdef.attributes {
                if let Some(expression) = &attr.condition {
                    match parse_condition(expression) {
                        Ok(condition) => {
                            let ctx = condition_context(options, &discovery.parameters, &facts);
                            if !condition.evaluate(&ctx) {
                                continue;
                            }
                        }
                        Err(e) => {
                            warn!(
                                "Attribute {} on {} has an invalid condition, applying unconditionally: {}",
                                attr.attr_id, srdef.srdef_id, e
                            );
                        }
                    }
                }
                contributions
                    .entry(attr.attr_id.clone())
                    .or_default()
                    .entry(srdef.srdef_id.clone())
                    .or_insert(attr);
            }
        }

        let mut result = RollupResult::default();
        for (attr_id, by_srdef) in &contributions {
            let Some(definition) = self.registry.attribute(attr_id) else {
                warn!("Attribute {} is not in the dictionary, skipping", attr_id);
                continue;
            };
            let contribs: Vec<(&str, &LoadedSrdefAttribute)> = by_srdef
                .iter()
                .map(|(srdef_id, attr)| (srdef_id.as_str(), *attr))
                .collect();
            let unified = merge_attribute(cbu_id, definition, &contribs);

            if unified.is_required() {
                result.required_count += 1;
            } else {
                result.optional_count += 1;
            }
            if let Some(conflict) = &unified.conflict {
                result.conflict_count += 1;
                warn!("Attribute conflict for CBU {}: {}", cbu_id, conflict.explain);
            }
            result.requirements.push(unified);
        }
        result.total_attributes = result.requirements.len();

        self.store
            .replace_unified_requirements(cbu_id, result.requirements.clone())
            .await
            .context("Failed to store unified requirements")?;
        self.store.mark_readiness_stale(cbu_id, "rollup").await?;

        info!(
            "Rollup complete for CBU {}: {} attributes ({} required, {} optional, {} conflicts)",
            cbu_id,
            result.total_attributes,
            result.required_count,
            result.optional_count,
            result.conflict_count
        );

        Ok(result)
    }
}

// =============================================================================
// MERGING
// =============================================================================

/// Merge every contributor's declaration of one attribute.
///
/// Contributors must be ordered by srdef_id; the first declared default and
/// the first-seen source order win.
pub fn merge_attribute(
    cbu_id: Uuid,
    definition: &AttributeDefinition,
    contributions: &[(&str, &LoadedSrdefAttribute)],
) -> CbuUnifiedAttrRequirement {
    let mut strength = RequirementStrength::Optional;
    let mut evidence_policy = EvidencePolicy::default();
    let mut source_policy: Vec<AttributeSource> = Vec::new();
    let mut default_value: Option<JsonValue> = None;
    let mut required_by = BTreeSet::new();

    for (srdef_id, attr) in contributions {
        strength = strength.merge(attr.requirement);
        evidence_policy = merge_evidence(&evidence_policy, &attr.evidence_policy);
        for source in &attr.source_policy {
            if !source_policy.contains(source) {
                source_policy.push(*source);
            }
        }
        if default_value.is_none() {
            default_value = attr.default_value.clone();
        }
        required_by.insert(srdef_id.to_string());
    }

    let declared: Vec<ConstraintContribution> = contributions
        .iter()
        .map(|(srdef_id, attr)| ConstraintContribution {
            srdef_id: srdef_id.to_string(),
            constraints: attr.constraints.clone(),
        })
        .collect();

    let (merged_constraints, conflict) =
        match merge_constraints(&definition.id, &definition.validation, &declared) {
            Ok(merged) => (merged, None),
            Err(conflict) => (definition.validation.clone(), Some(conflict)),
        };

    debug!(
        "Merged attribute {} from {} contributors",
        definition.id,
        contributions.len()
    );

    CbuUnifiedAttrRequirement {
        cbu_id,
        attr_id: definition.id.clone(),
        requirement_strength: strength,
        merged_constraints,
        evidence_policy,
        preferred_source: source_policy.first().copied(),
        source_policy,
        required_by_srdefs: required_by,
        default_value,
        conflict,
    }
}

/// The strictest of two evidence policies.
pub fn merge_evidence(a: &EvidencePolicy, b: &EvidencePolicy) -> EvidencePolicy {
    EvidencePolicy {
        requires_verified_document: a.requires_verified_document || b.requires_verified_document,
        max_age_days: match (a.max_age_days, b.max_age_days) {
            (Some(x), Some(y)) => Some(x.min(y)),
            (x, y) => x.or(y),
        },
    }
}

/// Intersect the dictionary's base validation with every contribution.
pub fn merge_constraints(
    attr_id: &str,
    base: &AttributeConstraints,
    contributions: &[ConstraintContribution],
) -> Result<AttributeConstraints, AttributeConflict> {
    let mut merged = base.clone();

    for c in contributions {
        let cons = &c.constraints;
        merged.min_length = max_opt(merged.min_length, cons.min_length);
        merged.max_length = min_opt(merged.max_length, cons.max_length);
        merged.min = max_opt_f64(merged.min, cons.min);
        merged.max = min_opt_f64(merged.max, cons.max);
        merged.allowed_values = match (merged.allowed_values.take(), &cons.allowed_values) {
            (Some(current), Some(other)) => {
                Some(current.into_iter().filter(|v| other.contains(v)).collect())
            }
            (Some(current), None) => Some(current),
            (None, Some(other)) => Some(other.clone()),
            (None, None) => None,
        };
        for pattern in &cons.patterns {
            if !merged.patterns.contains(pattern) {
                merged.patterns.push(pattern.clone());
            }
        }
    }
    merged.patterns.sort();

    let conflict = |kind: ConflictKind, involved: fn(&AttributeConstraints) -> bool, explain: String| {
        AttributeConflict {
            attr_id: attr_id.to_string(),
            kind,
            contributors: contributions
                .iter()
                .filter(|c| involved(&c.constraints))
                .cloned()
                .collect(),
            explain,
        }
    };

    if let (Some(min), Some(max)) = (merged.min_length, merged.max_length) {
        if min > max {
            return Err(conflict(
                ConflictKind::LengthRange,
                |c| c.min_length.is_some() || c.max_length.is_some(),
                format!(
                    "{}: min_length {} ({}) exceeds max_length {} ({})",
                    attr_id,
                    min,
                    declared_by(contributions, |c| c.min_length == Some(min)),
                    max,
                    declared_by(contributions, |c| c.max_length == Some(max)),
                ),
            ));
        }
    }
    if let (Some(min), Some(max)) = (merged.min, merged.max) {
        if min > max {
            return Err(conflict(
                ConflictKind::ValueRange,
                |c| c.min.is_some() || c.max.is_some(),
                format!(
                    "{}: min {} ({}) exceeds max {} ({})",
                    attr_id,
                    min,
                    declared_by(contributions, |c| c.min == Some(min)),
                    max,
                    declared_by(contributions, |c| c.max == Some(max)),
                ),
            ));
        }
    }
    if merged.allowed_values.as_ref().is_some_and(|v| v.is_empty()) {
        return Err(conflict(
            ConflictKind::AllowedValues,
            |c| c.allowed_values.is_some(),
            format!(
                "{}: allowed value sets of {} do not intersect",
                attr_id,
                declared_by(contributions, |c| c.allowed_values.is_some()),
            ),
        ));
    }

    Ok(merged)
}

fn declared_by(
    contributions: &[ConstraintContribution],
    pred: impl Fn(&AttributeConstraints) -> bool,
) -> String {
    let ids: Vec<&str> = contributions
        .iter()
        .filter(|c| pred(&c.constraints))
        .map(|c| c.srdef_id.as_str())
        .collect();
    if ids.is_empty() {
        "dictionary".to_string()
    } else {
        ids.join(", ")
    }
}

fn max_opt<T: Ord>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.max(y)),
        (x, y) => x.or(y),
    }
}

fn min_opt<T: Ord>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (x, y) => x.or(y),
    }
}

fn max_opt_f64(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.max(y)),
        (x, y) => x.or(y),
    }
}

fn min_opt_f64(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (x, y) => x.or(y),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn contribution(srdef_id: &str, constraints: AttributeConstraints) -> ConstraintContribution {
        ConstraintContribution {
            srdef_id: srdef_id.to_string(),
            constraints,
        }
    }

    fn declaration(
        requirement: RequirementStrength,
        sources: Vec<AttributeSource>,
        evidence: EvidencePolicy,
    ) -> LoadedSrdefAttribute {
        LoadedSrdefAttribute {
            attr_id: "settlement_bic".to_string(),
            requirement,
            source_policy: sources,
            constraints: AttributeConstraints::default(),
            evidence_policy: evidence,
            default_value: None,
            condition: None,
            description: None,
        }
    }

    #[test]
    fn test_length_bounds_narrow() {
        let merged = merge_constraints(
            "bic",
            &AttributeConstraints::default(),
            &[
                contribution("A", AttributeConstraints { min_length: Some(8), max_length: Some(11), ..Default::default() }),
                contribution("B", AttributeConstraints { min_length: Some(11), ..Default::default() }),
            ],
        )
        .unwrap();
        assert_eq!(merged.min_length, Some(11));
        assert_eq!(merged.max_length, Some(11));
    }

    #[test]
    fn test_disjoint_lengths_conflict_names_contributors() {
        let conflict = merge_constraints(
            "account_name",
            &AttributeConstraints::default(),
            &[
                contribution("SRDEF::A", AttributeConstraints { min_length: Some(5), ..Default::default() }),
                contribution("SRDEF::B", AttributeConstraints { max_length: Some(3), ..Default::default() }),
                contribution("SRDEF::C", AttributeConstraints::default()),
            ],
        )
        .unwrap_err();
        assert_eq!(conflict.kind, ConflictKind::LengthRange);
        let ids: Vec<&str> = conflict.contributors.iter().map(|c| c.srdef_id.as_str()).collect();
        assert_eq!(ids, vec!["SRDEF::A", "SRDEF::B"]);
        assert!(conflict.explain.contains("SRDEF::A"));
        assert!(conflict.explain.contains("SRDEF::B"));
    }

    #[test]
    fn test_allowed_values_intersect() {
        let a = AttributeConstraints { allowed_values: Some(vec![json!("DVP"), json!("FOP")]), ..Default::default() };
        let b = AttributeConstraints { allowed_values: Some(vec![json!("DVP")]), ..Default::default() };
        let c = AttributeConstraints { allowed_values: Some(vec![json!("RVP")]), ..Default::default() };

        let merged = merge_constraints("mode", &AttributeConstraints::default(), &[contribution("A", a.clone()), contribution("B", b)]).unwrap();
        assert_eq!(merged.allowed_values, Some(vec![json!("DVP")]));

        let conflict = merge_constraints("mode", &AttributeConstraints::default(), &[contribution("A", a), contribution("C", c)]).unwrap_err();
        assert_eq!(conflict.kind, ConflictKind::AllowedValues);
    }

    #[test]
    fn test_dictionary_base_participates() {
        let base = AttributeConstraints { max: Some(100.0), ..Default::default() };
        let conflict = merge_constraints(
            "pct",
            &base,
            &[contribution("A", AttributeConstraints { min: Some(150.0), ..Default::default() })],
        )
        .unwrap_err();
        assert_eq!(conflict.kind, ConflictKind::ValueRange);
        assert!(conflict.explain.contains("dictionary"));
    }

    #[test]
    fn test_required_dominates_and_policies_union() {
        let definition = AttributeDefinition {
            id: "settlement_bic".to_string(),
            name: "Settlement BIC".to_string(),
            value_type: AttributeValueType::String,
            validation: AttributeConstraints::default(),
            description: None,
        };
        let a = declaration(
            RequirementStrength::Optional,
            vec![AttributeSource::Cbu, AttributeSource::Manual],
            EvidencePolicy { requires_verified_document: false, max_age_days: Some(90) },
        );
        let b = declaration(
            RequirementStrength::Required,
            vec![AttributeSource::Document, AttributeSource::Cbu],
            EvidencePolicy { requires_verified_document: true, max_age_days: Some(30) },
        );
        let unified = merge_attribute(Uuid::nil(), &definition, &[("SRDEF::A", &a), ("SRDEF::B", &b)]);

        assert!(unified.is_required());
        assert_eq!(
            unified.source_policy,
            vec![AttributeSource::Cbu, AttributeSource::Manual, AttributeSource::Document]
        );
        assert_eq!(unified.preferred_source, Some(AttributeSource::Cbu));
        assert!(unified.evidence_policy.requires_verified_document);
        assert_eq!(unified.evidence_policy.max_age_days, Some(30));
        assert_eq!(unified.required_by_srdefs.len(), 2);
        assert!(unified.conflict.is_none());
    }
}
