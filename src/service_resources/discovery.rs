//! Resource Discovery Engine
//!
//! Derives required SRDEFs from ServiceIntents. Discovery is a pure function
//! of (active intents, catalog, CBU facts): parameterized SRDEFs expand over
//! the intent's option sets, and required plus satisfied conditional
//! dependencies are pulled in transitively. The result replaces the CBU's
//! active requirement set in one atomic sync.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::condition::{condition_context, parse_condition};
use super::population::{AttributeSources, PopulationEngine, PopulationResult};
use super::rollup::{AttributeRollupEngine, RollupResult};
use super::srdef_loader::{LoadedSrdef, SrdefRegistry};
use super::store::{PipelineStore, RequirementSync};
use super::types::*;

// =============================================================================
// DISCOVERY ENGINE
// =============================================================================

/// Engine for discovering required SRDEFs from service intents
pub struct ResourceDiscoveryEngine<'a> {
    store: &'a dyn PipelineStore,
    registry: &'a SrdefRegistry,
}

/// Something discovery could not expand. Scoped to one SRDEF or edge.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum DiscoveryIssue {
    Quarantined {
        srdef_id: String,
        reason: String,
    },
    MissingCatalogEntry {
        srdef_id: String,
        dependency: String,
    },
    MalformedCondition {
        srdef_id: String,
        dependency: String,
        message: String,
    },
}

impl std::fmt::Display for DiscoveryIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Quarantined { srdef_id, reason } => {
                write!(f, "{} is quarantined: {}", srdef_id, reason)
            }
            Self::MissingCatalogEntry {
                srdef_id,
                dependency,
            } => write!(f, "{} depends on unknown {}", srdef_id, dependency),
            Self::MalformedCondition {
                srdef_id,
                dependency,
                message,
            } => write!(
                f,
                "{} -> {} has a malformed condition: {}",
                srdef_id, dependency, message
            ),
        }
    }
}

/// Requirement being assembled during a discovery pass.
struct PendingRequirement {
    srdef_id: String,
    parameters: ResourceParameters,
    reason: DiscoveryReason,
}

struct DiscoveryPass<'r> {
    registry: &'r SrdefRegistry,
    facts: &'r CbuFacts,
    requirements: BTreeMap<String, PendingRequirement>,
    expanded: HashSet<(String, Uuid)>,
    issues: BTreeSet<DiscoveryIssue>,
}

impl<'r> DiscoveryPass<'r> {
    fn report(&mut self, issue: DiscoveryIssue) {
        self.issues.insert(issue);
    }

    fn visit(
        &mut self,
        srdef: &'r LoadedSrdef,
        parameters: ResourceParameters,
        rule: DiscoveryRule,
        intent: &ServiceIntent,
        path: &mut Vec<String>,
    ) {
        let key = requirement_key(&srdef.srdef_id, &parameters);
        if path.contains(&key) {
            // The catalog is validated acyclic; a repeat here means the
            // registry was mutated after validation.
            warn!("Dependency loop at {}, not expanding further", key);
            return;
        }

        self.requirements
            .entry(key.clone())
            .or_insert_with(|| PendingRequirement {
                srdef_id: srdef.srdef_id.clone(),
                parameters: parameters.clone(),
                reason: DiscoveryReason::default(),
            })
            .reason
            .record(intent.intent_id, rule);

        if !self.expanded.insert((key.clone(), intent.intent_id)) {
            return;
        }

        let mut deps: Vec<&ResourceDependency> = srdef.dependencies.iter().collect();
        deps.sort_by(|a, b| (a.priority, &a.depends_on).cmp(&(b.priority, &b.depends_on)));

        path.push(key.clone());
        for dep in deps {
            match dep.dependency_type {
                DependencyType::Optional => continue,
                DependencyType::Required => {}
                DependencyType::Conditional => {
                    // A conditional edge without a condition behaves as required.
                    if let Some(expression) = dep.condition.as_deref() {
                        match parse_condition(expression) {
                            Ok(condition) => {
                                let ctx =
                                    condition_context(&intent.options, &parameters, self.facts);
                                if !condition.evaluate(&ctx) {
                                    debug!(
                                        "Condition on {} -> {} not satisfied",
                                        srdef.srdef_id, dep.depends_on
                                    );
                                    continue;
                                }
                            }
                            Err(e) => {
                                self.report(DiscoveryIssue::MalformedCondition {
                                    srdef_id: srdef.srdef_id.clone(),
                                    dependency: dep.depends_on.clone(),
                                    message: e.to_string(),
                                });
                                continue;
                            }
                        }
                    }
                }
            }
            self.include_dependency(srdef, dep, &parameters, intent, path, &key);
        }
        path.pop();
    }

    /// Expand one dependency edge.
    fn include_dependency(
        &mut self,
        srdef: &'r LoadedSrdef,
        dep: &ResourceDependency,
        parameters: &ResourceParameters,
        intent: &ServiceIntent,
        path: &mut Vec<String>,
        parent_key: &str,
    ) {
        let Some(dep_srdef) = self.registry.get(&dep.depends_on) else {
            self.report(DiscoveryIssue::MissingCatalogEntry {
                srdef_id: srdef.srdef_id.clone(),
                dependency: dep.depends_on.clone(),
            });
            return;
        };
        if let Some(reason) = self.registry.quarantine_reason(&dep_srdef.srdef_id) {
            self.report(DiscoveryIssue::Quarantined {
                srdef_id: dep_srdef.srdef_id.clone(),
                reason: reason.to_string(),
            });
            return;
        }

        for dep_params in
            expand_dimensions(&dep_srdef.parameter_dimensions(), parameters, &intent.options)
        {
            self.visit(
                dep_srdef,
                dep_params,
                DiscoveryRule::Dependency {
                    parent: parent_key.to_string(),
                    dependency_type: dep.dependency_type,
                },
                intent,
                path,
            );
        }
    }
}

impl<'a> ResourceDiscoveryEngine<'a> {
    pub fn new(store: &'a dyn PipelineStore, registry: &'a SrdefRegistry) -> Self {
        Self { store, registry }
    }

    /// Compute the desired requirement set without persisting it.
    pub async fn plan_for_cbu(
        &self,
        cbu_id: Uuid,
    ) -> Result<(Vec<DiscoveredRequirement>, Vec<DiscoveryIssue>)> {
        let intents = self
            .store
            .active_intents(cbu_id)
            .await
            .context("Failed to load service intents")?;
        let facts = self.store.cbu_facts(cbu_id).await?;
        Ok(discover_requirements(
            self.registry,
            cbu_id,
            &intents,
            &facts,
            Utc::now(),
        ))
    }

    /// Discover required SRDEFs for a CBU based on their service intents
    pub async fn discover_for_cbu(&self, cbu_id: Uuid) -> Result<DiscoveryResult> {
        info!("Starting resource discovery for CBU {}", cbu_id);

        let (desired, issues) = self.plan_for_cbu(cbu_id).await?;
        for issue in &issues {
            warn!("Discovery issue for CBU {}: {}", cbu_id, issue);
        }

        let sync = self
            .store
            .sync_requirements(cbu_id, desired, Utc::now())
            .await
            .context("Failed to sync discovered requirements")?;
        if sync.changed() {
            self.store.mark_readiness_stale(cbu_id, "discovery").await?;
        }

        let requirements = self.store.active_requirements(cbu_id).await?;
        info!(
            "Discovery complete for CBU {}: {} requirements ({} new, {} superseded, {} issues)",
            cbu_id,
            requirements.len(),
            sync.inserted,
            sync.superseded,
            issues.len()
        );

        Ok(DiscoveryResult {
            total_discovered: requirements.len(),
            discovered: requirements,
            sync,
            issues,
        })
    }
}

/// Pure discovery: intents × catalog × facts → requirements.
pub fn discover_requirements(
    registry: &SrdefRegistry,
    cbu_id: Uuid,
    intents: &[ServiceIntent],
    facts: &CbuFacts,
    now: DateTime<Utc>,
) -> (Vec<DiscoveredRequirement>, Vec<DiscoveryIssue>) {
    let mut pass = DiscoveryPass {
        registry,
        facts,
        requirements: BTreeMap::new(),
        expanded: HashSet::new(),
        issues: BTreeSet::new(),
    };

    let mut intents: Vec<&ServiceIntent> = intents.iter().filter(|i| i.is_current()).collect();
    intents.sort_by_key(|i| i.intent_id);

    for intent in intents {
        let triggered = registry.get_by_service(&intent.service_code);
        debug!(
            "Service {} triggers {} SRDEFs",
            intent.service_code,
            triggered.len()
        );

        for srdef in triggered {
            if let Some(reason) = registry.quarantine_reason(&srdef.srdef_id) {
                pass.report(DiscoveryIssue::Quarantined {
                    srdef_id: srdef.srdef_id.clone(),
                    reason: reason.to_string(),
                });
                continue;
            }
            for params in expand_dimensions(
                &srdef.parameter_dimensions(),
                &ResourceParameters::new(),
                &intent.options,
            ) {
                pass.visit(
                    srdef,
                    params,
                    DiscoveryRule::ServiceTrigger {
                        service_code: intent.service_code.clone(),
                    },
                    intent,
                    &mut Vec::new(),
                );
            }
        }
    }

    let requirements = pass
        .requirements
        .into_values()
        .map(|p| DiscoveredRequirement {
            discovery_id: Uuid::now_v7(),
            cbu_id,
            srdef_id: p.srdef_id,
            parameters: p.parameters,
            reason: p.reason,
            discovered_at: now,
            superseded_at: None,
        })
        .collect();
    let issues = pass.issues.into_iter().collect();
    (requirements, issues)
}

/// Cartesian expansion over `dimensions`.
///
/// Dimensions already fixed in `inherited` (a dependent's parameters) are
/// projected as-is; the rest expand over the intent's option sets. A
/// dimension with no options contributes no axis.
pub fn expand_dimensions(
    dimensions: &[ParameterDimension],
    inherited: &ResourceParameters,
    options: &IntentOptions,
) -> Vec<ResourceParameters> {
    let mut sets = vec![ResourceParameters::new()];
    for &dim in dimensions {
        if let Some(value) = inherited.get(dim.key()) {
            for set in &mut sets {
                set.insert(dim.key().to_string(), value.clone());
            }
            continue;
        }
        let values: BTreeSet<&String> = options.values_for(dim).iter().collect();
        if values.is_empty() {
            continue;
        }
        sets = sets
            .into_iter()
            .flat_map(|base| {
                values.iter().map(move |v| {
                    let mut set = base.clone();
                    set.insert(dim.key().to_string(), (*v).clone());
                    set
                })
            })
            .collect();
    }
    sets
}

// =============================================================================
// REQUIREMENT SYNC
// =============================================================================

/// Changes needed to move the active set to the desired set.
#[derive(Debug, Default)]
pub struct SyncPlan {
    pub insert: Vec<DiscoveredRequirement>,
    pub supersede: Vec<Uuid>,
    pub unchanged: usize,
}

/// Diff by requirement key. A key whose reason changed is superseded and
/// re-inserted so the history keeps the old reason.
pub fn plan_requirement_sync(
    active: &[DiscoveredRequirement],
    desired: Vec<DiscoveredRequirement>,
) -> SyncPlan {
    let current: HashMap<String, &DiscoveredRequirement> =
        active.iter().map(|r| (r.requirement_key(), r)).collect();
    let mut plan = SyncPlan::default();
    let mut seen = HashSet::new();

    for req in desired {
        let key = req.requirement_key();
        seen.insert(key.clone());
        match current.get(&key) {
            Some(existing) if existing.reason == req.reason => plan.unchanged += 1,
            Some(existing) => {
                plan.supersede.push(existing.discovery_id);
                plan.insert.push(req);
            }
            None => plan.insert.push(req),
        }
    }

    for (key, existing) in &current {
        if !seen.contains(key) {
            plan.supersede.push(existing.discovery_id);
        }
    }
    plan
}

/// Result of discovery operation
#[derive(Debug, Default, Serialize)]
pub struct DiscoveryResult {
    pub discovered: Vec<DiscoveredRequirement>,
    pub total_discovered: usize,
    pub sync: RequirementSync,
    pub issues: Vec<DiscoveryIssue>,
}

// =============================================================================
// CONVENIENCE FUNCTIONS
// =============================================================================

/// Run the discovery + rollup + populate pipeline for a CBU
pub async fn run_discovery_pipeline(
    store: &dyn PipelineStore,
    registry: &SrdefRegistry,
    sources: &AttributeSources,
    cbu_id: Uuid,
) -> Result<PipelineResult> {
    let discovery = ResourceDiscoveryEngine::new(store, registry)
        .discover_for_cbu(cbu_id)
        .await?;

    let rollup = AttributeRollupEngine::new(store, registry)
        .rollup_for_cbu(cbu_id)
        .await?;

    let population = PopulationEngine::new(store, registry, sources)
        .populate_for_cbu(cbu_id)
        .await?;

    Ok(PipelineResult {
        cbu_id,
        srdefs_discovered: discovery.total_discovered,
        attrs_rolled_up: rollup.total_attributes,
        attrs_populated: population.populated,
        attrs_missing: population.still_missing,
        discovery,
        rollup,
        population,
    })
}

/// Result of running the discovery pipeline
#[derive(Debug, Serialize)]
pub struct PipelineResult {
    pub cbu_id: Uuid,
    pub srdefs_discovered: usize,
    pub attrs_rolled_up: usize,
    pub attrs_populated: usize,
    pub attrs_missing: usize,
    pub discovery: DiscoveryResult,
    pub rollup: RollupResult,
    pub population: PopulationResult,
}
