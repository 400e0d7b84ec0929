//! SRDEF Registry Loader
//!
//! Loads ServiceResourceDefinition (SRDEF) configurations and the attribute
//! dictionary from YAML files, then validates the catalog. SRDEFs that fail
//! validation are quarantined: they stay visible (so readiness can name
//! them) but discovery never expands them.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::condition::parse_condition;
use super::types::{
    AttributeConstraints, AttributeDefinition, AttributeSource, DependencyType, EvidencePolicy,
    ParameterDimension, ProvisioningStrategy, RequirementStrength, ResourceDependency,
};
use crate::config::PipelineConfig;

// =============================================================================
// ERRORS
// =============================================================================

/// Catalog validation problems. Each one affects only the SRDEFs it names.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
pub enum CatalogError {
    #[error("SRDEF {srdef_id} depends on unknown SRDEF {dependency}")]
    MissingDependency { srdef_id: String, dependency: String },

    #[error("dependency cycle detected: {}", .cycle.join(" -> "))]
    DependencyCycle { cycle: Vec<String> },

    #[error("SRDEF {srdef_id} references unregistered attribute {attr_id}")]
    UnregisteredAttribute { srdef_id: String, attr_id: String },

    #[error("SRDEF {srdef_id} has invalid condition '{expression}': {message}")]
    InvalidCondition {
        srdef_id: String,
        expression: String,
        message: String,
    },

    #[error("SRDEF {srdef_id} depends on quarantined SRDEF {dependency}")]
    QuarantinedDependency { srdef_id: String, dependency: String },

    #[error("duplicate SRDEF {srdef_id}")]
    DuplicateSrdef { srdef_id: String },

    #[error("failed to load {path}: {message}")]
    ConfigFile { path: String, message: String },
}

// =============================================================================
// YAML CONFIG TYPES
// =============================================================================

/// Root of an SRDEF YAML file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SrdefConfigFile {
    pub domain: String,
    pub description: Option<String>,

    /// Attribute dictionary entries (usually kept in their own file)
    #[serde(default)]
    pub attributes: Vec<AttributeDefinition>,

    #[serde(default)]
    pub srdefs: Vec<SrdefConfig>,
}

/// Individual SRDEF configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SrdefConfig {
    pub code: String,
    pub name: String,
    pub resource_type: String,
    pub purpose: Option<String>,
    pub provisioning_strategy: ProvisioningStrategy,
    pub owner: String,

    /// Strategy used by `discover` when nothing pre-existing matches
    #[serde(default)]
    pub discover_fallback: Option<ProvisioningStrategy>,

    #[serde(default)]
    pub triggered_by_services: Vec<String>,

    #[serde(default)]
    pub attributes: Vec<SrdefAttributeConfig>,

    #[serde(default)]
    pub depends_on: Vec<DependencyConfig>,

    #[serde(default)]
    pub per_market: bool,

    #[serde(default)]
    pub per_currency: bool,

    #[serde(default)]
    pub per_counterparty: bool,

    #[serde(default)]
    pub capabilities: Option<JsonValue>,
}

/// Either a bare SRDEF reference or a full edge description.
///
/// References may be a full `SRDEF::...` id or a code of the same catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependencyConfig {
    Reference(String),
    Edge {
        srdef: String,
        #[serde(default)]
        dependency_type: DependencyType,
        #[serde(default)]
        inject_arg: Option<String>,
        #[serde(default)]
        priority: i32,
        #[serde(default)]
        condition: Option<String>,
    },
}

/// Attribute requirement in SRDEF config
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SrdefAttributeConfig {
    pub id: String,
    pub requirement: RequirementStrength,

    #[serde(default)]
    pub source_policy: Vec<AttributeSource>,

    #[serde(default)]
    pub constraints: Option<AttributeConstraints>,

    #[serde(default)]
    pub evidence_policy: Option<EvidencePolicy>,

    pub default: Option<JsonValue>,
    pub condition: Option<String>,
    pub description: Option<String>,
}

// =============================================================================
// LOADED SRDEF (in-memory representation)
// =============================================================================

/// A fully loaded SRDEF with resolved dependency ids
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadedSrdef {
    pub srdef_id: String,
    pub code: String,
    pub name: String,
    pub resource_type: String,
    pub purpose: Option<String>,
    pub provisioning_strategy: ProvisioningStrategy,
    pub discover_fallback: ProvisioningStrategy,
    pub owner: String,
    pub triggered_by_services: Vec<String>,
    pub attributes: Vec<LoadedSrdefAttribute>,
    pub dependencies: Vec<ResourceDependency>,
    pub per_market: bool,
    pub per_currency: bool,
    pub per_counterparty: bool,
    pub capabilities: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadedSrdefAttribute {
    pub attr_id: String,
    pub requirement: RequirementStrength,
    pub source_policy: Vec<AttributeSource>,
    pub constraints: AttributeConstraints,
    pub evidence_policy: EvidencePolicy,
    pub default_value: Option<JsonValue>,
    pub condition: Option<String>,
    pub description: Option<String>,
}

impl LoadedSrdef {
    /// Minimal SRDEF for programmatic catalogs.
    pub fn new(
        owner: &str,
        resource_type: &str,
        code: &str,
        provisioning_strategy: ProvisioningStrategy,
    ) -> Self {
        Self {
            srdef_id: srdef_id(owner, resource_type, code),
            code: code.to_string(),
            name: code.to_string(),
            resource_type: resource_type.to_string(),
            purpose: None,
            provisioning_strategy,
            discover_fallback: ProvisioningStrategy::Create,
            owner: owner.to_string(),
            triggered_by_services: Vec::new(),
            attributes: Vec::new(),
            dependencies: Vec::new(),
            per_market: false,
            per_currency: false,
            per_counterparty: false,
            capabilities: json!({}),
        }
    }

    pub fn parameter_dimensions(&self) -> Vec<ParameterDimension> {
        let mut dims = Vec::new();
        if self.per_market {
            dims.push(ParameterDimension::Market);
        }
        if self.per_currency {
            dims.push(ParameterDimension::Currency);
        }
        if self.per_counterparty {
            dims.push(ParameterDimension::Counterparty);
        }
        dims
    }

    pub fn required_dependencies(&self) -> impl Iterator<Item = &ResourceDependency> {
        self.dependencies.iter().filter(|d| d.is_required())
    }

    /// Attributes this SRDEF declares as required.
    pub fn required_attributes(&self) -> impl Iterator<Item = &LoadedSrdefAttribute> {
        self.attributes
            .iter()
            .filter(|a| a.requirement == RequirementStrength::Required)
    }
}

pub fn srdef_id(owner: &str, resource_type: &str, code: &str) -> String {
    format!("SRDEF::{}::{}::{}", owner, resource_type, code)
}

// =============================================================================
// SRDEF REGISTRY
// =============================================================================

/// In-memory registry of loaded SRDEFs and the attribute dictionary
#[derive(Debug, Default, Clone)]
pub struct SrdefRegistry {
    /// SRDEFs indexed by srdef_id
    pub srdefs: HashMap<String, LoadedSrdef>,

    /// Service → SRDEF mapping (which SRDEFs are triggered by which services)
    pub service_triggers: HashMap<String, Vec<String>>,

    /// Dependency graph (srdef_id → depends_on ids, all edge types)
    pub dependencies: HashMap<String, Vec<String>>,

    /// Attribute dictionary
    pub attributes: HashMap<String, AttributeDefinition>,

    /// Quarantined SRDEFs and why
    pub quarantined: BTreeMap<String, CatalogError>,

    /// Every problem found while loading, quarantining or not
    pub issues: Vec<CatalogError>,
}

impl SrdefRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build and validate a registry from already-loaded parts.
    pub fn from_parts(attributes: Vec<AttributeDefinition>, srdefs: Vec<LoadedSrdef>) -> Self {
        let mut registry = Self::new();
        for attr in attributes {
            registry.attributes.insert(attr.id.clone(), attr);
        }
        for srdef in srdefs {
            registry.insert(srdef);
        }
        registry.validate();
        registry
    }

    /// Index an SRDEF. Call `validate` once the catalog is complete.
    pub fn insert(&mut self, srdef: LoadedSrdef) {
        let srdef_id = srdef.srdef_id.clone();
        if self.srdefs.contains_key(&srdef_id) {
            warn!("Duplicate SRDEF {}, keeping the first definition", srdef_id);
            self.issues.push(CatalogError::DuplicateSrdef { srdef_id });
            return;
        }

        for service in &srdef.triggered_by_services {
            self.service_triggers
                .entry(service.clone())
                .or_default()
                .push(srdef_id.clone());
        }

        self.dependencies.insert(
            srdef_id.clone(),
            srdef.dependencies.iter().map(|d| d.depends_on.clone()).collect(),
        );

        self.srdefs.insert(srdef_id, srdef);
    }

    /// Get an SRDEF by ID
    pub fn get(&self, srdef_id: &str) -> Option<&LoadedSrdef> {
        self.srdefs.get(srdef_id)
    }

    pub fn attribute(&self, attr_id: &str) -> Option<&AttributeDefinition> {
        self.attributes.get(attr_id)
    }

    pub fn is_quarantined(&self, srdef_id: &str) -> bool {
        self.quarantined.contains_key(srdef_id)
    }

    pub fn quarantine_reason(&self, srdef_id: &str) -> Option<&CatalogError> {
        self.quarantined.get(srdef_id)
    }

    /// Get all SRDEFs triggered by a service, quarantined ones included, sorted by id
    pub fn get_by_service(&self, service_code: &str) -> Vec<&LoadedSrdef> {
        let mut srdefs: Vec<&LoadedSrdef> = self
            .service_triggers
            .get(service_code)
            .map(|ids| ids.iter().filter_map(|id| self.srdefs.get(id)).collect())
            .unwrap_or_default();
        srdefs.sort_by(|a, b| a.srdef_id.cmp(&b.srdef_id));
        srdefs
    }

    /// Get dependencies for an SRDEF
    pub fn get_dependencies(&self, srdef_id: &str) -> Vec<&LoadedSrdef> {
        self.dependencies
            .get(srdef_id)
            .map(|ids| ids.iter().filter_map(|id| self.srdefs.get(id)).collect())
            .unwrap_or_default()
    }

    /// Transitive closure over required and conditional edges.
    pub fn dependency_closure(&self, srdef_id: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![srdef_id.to_string()];
        while let Some(id) = stack.pop() {
            let Some(srdef) = self.srdefs.get(&id) else {
                continue;
            };
            for dep in &srdef.dependencies {
                if dep.dependency_type == DependencyType::Optional {
                    continue;
                }
                if seen.insert(dep.depends_on.clone()) {
                    stack.push(dep.depends_on.clone());
                }
            }
        }
        seen
    }

    pub fn services(&self) -> Vec<String> {
        let mut services: Vec<String> = self.service_triggers.keys().cloned().collect();
        services.sort();
        services
    }

    /// Topological sort of SRDEFs (dependencies first)
    pub fn topo_sort(&self, srdef_ids: &[String]) -> Result<Vec<String>, CatalogError> {
        let mut result = Vec::new();
        let mut visited = HashSet::new();
        let mut path = Vec::new();

        for id in srdef_ids {
            self.topo_visit(id, &mut result, &mut visited, &mut path)?;
        }

        Ok(result)
    }

    fn topo_visit(
        &self,
        id: &str,
        result: &mut Vec<String>,
        visited: &mut HashSet<String>,
        path: &mut Vec<String>,
    ) -> Result<(), CatalogError> {
        if let Some(pos) = path.iter().position(|p| p == id) {
            let mut cycle = path[pos..].to_vec();
            cycle.push(id.to_string());
            return Err(CatalogError::DependencyCycle { cycle });
        }
        if visited.contains(id) {
            return Ok(());
        }

        path.push(id.to_string());

        if let Some(deps) = self.dependencies.get(id) {
            let mut deps = deps.clone();
            deps.sort();
            for dep in &deps {
                self.topo_visit(dep, result, visited, path)?;
            }
        }

        path.pop();
        visited.insert(id.to_string());
        result.push(id.to_string());

        Ok(())
    }

    /// All non-quarantined SRDEFs, dependencies first.
    pub fn provisioning_order(&self) -> Result<Vec<String>, CatalogError> {
        let mut ids: Vec<String> = self
            .srdefs
            .keys()
            .filter(|id| !self.is_quarantined(id))
            .cloned()
            .collect();
        ids.sort();
        self.topo_sort(&ids)
    }

    /// Validate the catalog and quarantine what cannot be used.
    ///
    /// Missing dependencies, cycles and unregistered attributes quarantine
    /// the SRDEF. Unparseable conditions are recorded but only fail the
    /// affected requirement at discovery time. Quarantine then propagates
    /// to every SRDEF that needs a quarantined one.
    pub fn validate(&mut self) {
        self.quarantined.clear();
        self.issues
            .retain(|i| matches!(i, CatalogError::DuplicateSrdef { .. } | CatalogError::ConfigFile { .. }));

        let mut ids: Vec<String> = self.srdefs.keys().cloned().collect();
        ids.sort();

        for id in &ids {
            let srdef = &self.srdefs[id];
            for attr in &srdef.attributes {
                if !self.attributes.contains_key(&attr.attr_id) {
                    let err = CatalogError::UnregisteredAttribute {
                        srdef_id: id.clone(),
                        attr_id: attr.attr_id.clone(),
                    };
                    self.issues.push(err.clone());
                    self.quarantined.entry(id.clone()).or_insert(err);
                }
                if let Some(expr) = &attr.condition {
                    if let Err(e) = parse_condition(expr) {
                        self.issues.push(CatalogError::InvalidCondition {
                            srdef_id: id.clone(),
                            expression: expr.clone(),
                            message: e.to_string(),
                        });
                    }
                }
            }
            for dep in &srdef.dependencies {
                if !self.srdefs.contains_key(&dep.depends_on) {
                    let err = CatalogError::MissingDependency {
                        srdef_id: id.clone(),
                        dependency: dep.depends_on.clone(),
                    };
                    self.issues.push(err.clone());
                    self.quarantined.entry(id.clone()).or_insert(err);
                }
                if let Some(expr) = &dep.condition {
                    if let Err(e) = parse_condition(expr) {
                        self.issues.push(CatalogError::InvalidCondition {
                            srdef_id: id.clone(),
                            expression: expr.clone(),
                            message: e.to_string(),
                        });
                    }
                }
            }
        }

        for cycle in self.find_cycles(&ids) {
            let err = CatalogError::DependencyCycle {
                cycle: cycle.clone(),
            };
            self.issues.push(err.clone());
            for member in cycle {
                self.quarantined.entry(member).or_insert_with(|| err.clone());
            }
        }

        // Propagate to dependents until nothing changes.
        loop {
            let mut newly = Vec::new();
            for id in &ids {
                if self.quarantined.contains_key(id) {
                    continue;
                }
                let srdef = &self.srdefs[id];
                if let Some(dep) = srdef.dependencies.iter().find(|d| {
                    d.dependency_type != DependencyType::Optional
                        && self.quarantined.contains_key(&d.depends_on)
                }) {
                    newly.push((
                        id.clone(),
                        CatalogError::QuarantinedDependency {
                            srdef_id: id.clone(),
                            dependency: dep.depends_on.clone(),
                        },
                    ));
                }
            }
            if newly.is_empty() {
                break;
            }
            for (id, err) in newly {
                self.issues.push(err.clone());
                self.quarantined.insert(id, err);
            }
        }

        for (id, err) in &self.quarantined {
            warn!("Quarantined SRDEF {}: {}", id, err);
        }
    }

    /// Every distinct cycle reachable in the dependency graph.
    fn find_cycles(&self, ids: &[String]) -> Vec<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit(
            registry: &SrdefRegistry,
            id: &str,
            marks: &mut HashMap<String, Mark>,
            path: &mut Vec<String>,
            cycles: &mut Vec<Vec<String>>,
        ) {
            match marks.get(id) {
                Some(Mark::Done) => return,
                Some(Mark::Visiting) => {
                    if let Some(pos) = path.iter().position(|p| p == id) {
                        let mut cycle = path[pos..].to_vec();
                        cycle.push(id.to_string());
                        cycles.push(cycle);
                    }
                    return;
                }
                None => {}
            }
            marks.insert(id.to_string(), Mark::Visiting);
            path.push(id.to_string());
            if let Some(deps) = registry.dependencies.get(id) {
                let mut deps = deps.clone();
                deps.sort();
                for dep in deps.iter().filter(|d| registry.srdefs.contains_key(*d)) {
                    visit(registry, dep, marks, path, cycles);
                }
            }
            path.pop();
            marks.insert(id.to_string(), Mark::Done);
        }

        let mut marks = HashMap::new();
        let mut cycles = Vec::new();
        for id in ids {
            visit(self, id, &mut marks, &mut Vec::new(), &mut cycles);
        }
        cycles
    }
}

// =============================================================================
// LOADER
// =============================================================================

/// Loads SRDEF configurations from YAML files
pub struct SrdefLoader {
    config_dir: std::path::PathBuf,
}

impl SrdefLoader {
    pub fn new<P: AsRef<Path>>(config_dir: P) -> Self {
        Self {
            config_dir: config_dir.as_ref().to_path_buf(),
        }
    }

    /// Load all SRDEF configs from the config directory
    pub fn load_all(&self) -> Result<SrdefRegistry> {
        let mut yaml_files: Vec<_> = std::fs::read_dir(&self.config_dir)
            .with_context(|| {
                format!(
                    "Failed to read SRDEF config directory {}",
                    self.config_dir.display()
                )
            })?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.extension()
                    .map(|ext| ext == "yaml" || ext == "yml")
                    .unwrap_or(false)
            })
            .collect();
        yaml_files.sort();

        info!("Found {} SRDEF config files", yaml_files.len());

        let mut attributes = Vec::new();
        let mut configs = Vec::new();
        let mut file_issues = Vec::new();

        for path in yaml_files {
            match self.load_file(&path) {
                Ok(config) => {
                    info!(
                        "Loaded {} SRDEFs and {} attributes from {} (domain: {})",
                        config.srdefs.len(),
                        config.attributes.len(),
                        path.display(),
                        config.domain
                    );
                    attributes.extend(config.attributes);
                    configs.extend(config.srdefs);
                }
                Err(e) => {
                    warn!("Failed to load SRDEF config {}: {:#}", path.display(), e);
                    file_issues.push(CatalogError::ConfigFile {
                        path: path.display().to_string(),
                        message: format!("{:#}", e),
                    });
                }
            }
        }

        let srdefs = resolve_configs(&configs);
        let mut registry = SrdefRegistry::from_parts(attributes, srdefs);
        registry.issues.extend(file_issues);

        info!(
            "Loaded {} total SRDEFs into registry ({} quarantined, {} attributes)",
            registry.srdefs.len(),
            registry.quarantined.len(),
            registry.attributes.len()
        );
        Ok(registry)
    }

    /// Load a single YAML file
    fn load_file(&self, path: &Path) -> Result<SrdefConfigFile> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;

        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))
    }
}

/// Convert configs to loaded SRDEFs, resolving code references to ids.
fn resolve_configs(configs: &[SrdefConfig]) -> Vec<LoadedSrdef> {
    let mut by_code: HashMap<&str, Vec<String>> = HashMap::new();
    for config in configs {
        by_code
            .entry(config.code.as_str())
            .or_default()
            .push(srdef_id(&config.owner, &config.resource_type, &config.code));
    }

    let resolve = |reference: &str| -> String {
        if reference.starts_with("SRDEF::") {
            return reference.to_string();
        }
        match by_code.get(reference).map(Vec::as_slice) {
            Some([only]) => only.clone(),
            Some(_) => {
                warn!("Ambiguous SRDEF reference {}, leaving unresolved", reference);
                reference.to_string()
            }
            None => reference.to_string(),
        }
    };

    configs
        .iter()
        .map(|config| config_to_loaded(config, &resolve))
        .collect()
}

/// Convert config to loaded representation
fn config_to_loaded(config: &SrdefConfig, resolve: &dyn Fn(&str) -> String) -> LoadedSrdef {
    let srdef_id = srdef_id(&config.owner, &config.resource_type, &config.code);

    let attributes = config
        .attributes
        .iter()
        .map(|attr| LoadedSrdefAttribute {
            attr_id: attr.id.clone(),
            requirement: attr.requirement,
            source_policy: attr.source_policy.clone(),
            constraints: attr.constraints.clone().unwrap_or_default(),
            evidence_policy: attr.evidence_policy.clone().unwrap_or_default(),
            default_value: attr.default.clone(),
            condition: attr.condition.clone(),
            description: attr.description.clone(),
        })
        .collect();

    let dependencies = config
        .depends_on
        .iter()
        .map(|dep| match dep {
            DependencyConfig::Reference(reference) => ResourceDependency::required(resolve(reference)),
            DependencyConfig::Edge {
                srdef,
                dependency_type,
                inject_arg,
                priority,
                condition,
            } => ResourceDependency {
                depends_on: resolve(srdef),
                dependency_type: *dependency_type,
                inject_arg: inject_arg.clone(),
                priority: *priority,
                condition: condition.clone(),
            },
        })
        .collect();

    debug!("Resolved SRDEF {}", srdef_id);

    LoadedSrdef {
        srdef_id,
        code: config.code.clone(),
        name: config.name.clone(),
        resource_type: config.resource_type.clone(),
        purpose: config.purpose.clone(),
        provisioning_strategy: config.provisioning_strategy,
        discover_fallback: config
            .discover_fallback
            .unwrap_or(ProvisioningStrategy::Create),
        owner: config.owner.clone(),
        triggered_by_services: config.triggered_by_services.clone(),
        attributes,
        dependencies,
        per_market: config.per_market,
        per_currency: config.per_currency,
        per_counterparty: config.per_counterparty,
        capabilities: config.capabilities.clone().unwrap_or(json!({})),
    }
}

// =============================================================================
// CONVENIENCE FUNCTIONS
// =============================================================================

/// Load SRDEFs from the configured directory (`SRDEF_CONFIG_DIR`)
pub fn load_srdefs_from_config() -> Result<SrdefRegistry> {
    let config = PipelineConfig::from_env()?;
    SrdefLoader::new(&config.srdef_config_dir).load_all()
}
