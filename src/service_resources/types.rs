//! Service Resource Pipeline Types
//!
//! Shared data model for the CBU service → resource → provisioning → readiness
//! pipeline. Every record here is a plain serde value; behavior lives in the
//! engines that read and write them.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

// =============================================================================
// SRDEF TYPES
// =============================================================================

/// How a resource comes into existence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProvisioningStrategy {
    /// Provisioned internally and synchronously.
    Create,
    /// Requested from the owner system; completed by inbound events.
    Request,
    /// Linked to a pre-existing resource when one matches.
    Discover,
}

impl fmt::Display for ProvisioningStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Request => write!(f, "request"),
            Self::Discover => write!(f, "discover"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyType {
    #[default]
    Required,
    Optional,
    Conditional,
}

/// Directed edge: the owning SRDEF depends on `depends_on`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDependency {
    pub depends_on: String,
    #[serde(default)]
    pub dependency_type: DependencyType,
    /// Provisioning argument that receives the dependency's resolved handle.
    #[serde(default)]
    pub inject_arg: Option<String>,
    #[serde(default)]
    pub priority: i32,
    /// Condition expression, evaluated for `conditional` edges only.
    #[serde(default)]
    pub condition: Option<String>,
}

impl ResourceDependency {
    pub fn required(depends_on: impl Into<String>) -> Self {
        Self {
            depends_on: depends_on.into(),
            dependency_type: DependencyType::Required,
            inject_arg: None,
            priority: 0,
            condition: None,
        }
    }

    pub fn with_inject_arg(mut self, inject_arg: impl Into<String>) -> Self {
        self.inject_arg = Some(inject_arg.into());
        self
    }

    /// Required edges are the only ones that gate provisioning.
    pub fn is_required(&self) -> bool {
        self.dependency_type == DependencyType::Required
    }
}

/// A parameterization axis of an SRDEF.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ParameterDimension {
    Market,
    Currency,
    Counterparty,
}

impl ParameterDimension {
    /// Key used in `ResourceParameters`.
    pub fn key(self) -> &'static str {
        match self {
            Self::Market => "market",
            Self::Currency => "currency",
            Self::Counterparty => "counterparty",
        }
    }
}

/// Resolved parameters of one resource instance (e.g. `market=XNYS`).
pub type ResourceParameters = BTreeMap<String, String>;

/// Canonical identity of a parameterized requirement.
///
/// `SRDEF::CUSTODY::Account::custody_securities[currency=USD,market=XNYS]`
pub fn requirement_key(srdef_id: &str, parameters: &ResourceParameters) -> String {
    if parameters.is_empty() {
        return srdef_id.to_string();
    }
    let params: Vec<String> = parameters
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
    format!("{}[{}]", srdef_id, params.join(","))
}

// =============================================================================
// SERVICE INTENTS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceIntentStatus {
    Active,
    Suspended,
    Cancelled,
}

impl fmt::Display for ServiceIntentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Suspended => write!(f, "suspended"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Option sets declared on an intent. Parameterized SRDEFs expand over these.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntentOptions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub markets: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub currencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub counterparties: Vec<String>,
    /// Anything else the subscription carried (visible to conditions).
    #[serde(flatten)]
    pub extra: BTreeMap<String, JsonValue>,
}

impl IntentOptions {
    pub fn values_for(&self, dimension: ParameterDimension) -> &[String] {
        match dimension {
            ParameterDimension::Market => &self.markets,
            ParameterDimension::Currency => &self.currencies,
            ParameterDimension::Counterparty => &self.counterparties,
        }
    }
}

/// A CBU's declared need for a product/service combination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceIntent {
    pub intent_id: Uuid,
    pub cbu_id: Uuid,
    pub product_code: String,
    pub service_code: String,
    pub options: IntentOptions,
    pub status: ServiceIntentStatus,
    pub version: u32,
    /// Set when a newer version replaced this one.
    pub superseded_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub created_by: Option<String>,
}

impl ServiceIntent {
    /// Active and not superseded: the only intents the pipeline consumes.
    pub fn is_current(&self) -> bool {
        self.status == ServiceIntentStatus::Active && self.superseded_by.is_none()
    }
}

/// Input for declaring an intent.
#[derive(Debug, Clone)]
pub struct NewServiceIntent {
    pub cbu_id: Uuid,
    pub product_code: String,
    pub service_code: String,
    pub options: IntentOptions,
    pub created_by: Option<String>,
}

/// CBU and entity master data visible to condition expressions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CbuFacts {
    pub cbu: JsonValue,
    pub entity: JsonValue,
}

impl Default for CbuFacts {
    fn default() -> Self {
        Self {
            cbu: json!({}),
            entity: json!({}),
        }
    }
}

// =============================================================================
// DISCOVERY
// =============================================================================

/// Why a requirement exists.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum DiscoveryRule {
    /// Directly triggered by a subscribed service.
    ServiceTrigger { service_code: String },
    /// Pulled in as a dependency of another requirement.
    Dependency {
        parent: String,
        dependency_type: DependencyType,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryReason {
    pub triggered_by_intents: BTreeSet<Uuid>,
    pub rules: BTreeSet<DiscoveryRule>,
}

impl DiscoveryReason {
    pub fn record(&mut self, intent_id: Uuid, rule: DiscoveryRule) {
        self.triggered_by_intents.insert(intent_id);
        self.rules.insert(rule);
    }
}

/// "This CBU needs this parameterized resource instance."
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredRequirement {
    pub discovery_id: Uuid,
    pub cbu_id: Uuid,
    pub srdef_id: String,
    pub parameters: ResourceParameters,
    pub reason: DiscoveryReason,
    pub discovered_at: DateTime<Utc>,
    pub superseded_at: Option<DateTime<Utc>>,
}

impl DiscoveredRequirement {
    pub fn requirement_key(&self) -> String {
        requirement_key(&self.srdef_id, &self.parameters)
    }

    pub fn is_active(&self) -> bool {
        self.superseded_at.is_none()
    }

    /// True when `other` agrees with this requirement on every shared parameter.
    pub fn parameters_compatible(&self, other: &ResourceParameters) -> bool {
        self.parameters
            .iter()
            .all(|(k, v)| other.get(k).map_or(true, |o| o == v))
    }
}

// =============================================================================
// ATTRIBUTES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeValueType {
    String,
    Number,
    Boolean,
    Date,
    Currency,
    Percentage,
    Json,
}

impl AttributeValueType {
    pub fn accepts(self, value: &JsonValue) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Date => value
                .as_str()
                .is_some_and(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()),
            Self::Currency => value
                .as_str()
                .is_some_and(|s| s.len() == 3 && s.chars().all(|c| c.is_ascii_uppercase())),
            Self::Percentage => value
                .as_f64()
                .is_some_and(|n| (0.0..=100.0).contains(&n)),
            Self::Json => true,
        }
    }
}

impl fmt::Display for AttributeValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Date => "date",
            Self::Currency => "currency",
            Self::Percentage => "percentage",
            Self::Json => "json",
        };
        write!(f, "{}", s)
    }
}

/// Validation constraints. Merging across contributors narrows each bound.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttributeConstraints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_values: Option<Vec<JsonValue>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patterns: Vec<String>,
}

impl AttributeConstraints {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Check a candidate value; the error names the first violated bound.
    pub fn check(&self, value: &JsonValue) -> Result<(), String> {
        if let Some(s) = value.as_str() {
            let len = s.chars().count();
            if let Some(min) = self.min_length {
                if len < min {
                    return Err(format!("length {} below min_length {}", len, min));
                }
            }
            if let Some(max) = self.max_length {
                if len > max {
                    return Err(format!("length {} above max_length {}", len, max));
                }
            }
            for pattern in &self.patterns {
                match regex::Regex::new(pattern) {
                    Ok(re) if re.is_match(s) => {}
                    Ok(_) => return Err(format!("value does not match pattern {}", pattern)),
                    Err(e) => return Err(format!("invalid pattern {}: {}", pattern, e)),
                }
            }
        }
        if let Some(n) = value.as_f64() {
            if let Some(min) = self.min {
                if n < min {
                    return Err(format!("{} below min {}", n, min));
                }
            }
            if let Some(max) = self.max {
                if n > max {
                    return Err(format!("{} above max {}", n, max));
                }
            }
        }
        if let Some(allowed) = &self.allowed_values {
            if !allowed.contains(value) {
                return Err(format!("{} not in allowed values", value));
            }
        }
        Ok(())
    }
}

/// Evidence a sourced value must carry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidencePolicy {
    #[serde(default)]
    pub requires_verified_document: bool,
    #[serde(default)]
    pub max_age_days: Option<u32>,
}

impl EvidencePolicy {
    pub fn is_empty(&self) -> bool {
        !self.requires_verified_document && self.max_age_days.is_none()
    }

    pub fn check(&self, evidence: &[EvidenceRef], now: DateTime<Utc>) -> Result<(), String> {
        if self.is_empty() {
            return Ok(());
        }
        let eligible: Vec<&EvidenceRef> = evidence
            .iter()
            .filter(|e| !self.requires_verified_document || e.is_verified_document())
            .collect();
        if eligible.is_empty() {
            return Err("no verified document evidence".to_string());
        }
        if let Some(days) = self.max_age_days {
            let cutoff = now - chrono::Duration::days(i64::from(days));
            let fresh = eligible
                .iter()
                .any(|e| e.observed_at.is_some_and(|at| at >= cutoff));
            if !fresh {
                return Err(format!("evidence older than {} days", days));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequirementStrength {
    Required,
    Optional,
}

impl RequirementStrength {
    /// Required dominates optional.
    pub fn merge(self, other: Self) -> Self {
        if self == Self::Required || other == Self::Required {
            Self::Required
        } else {
            Self::Optional
        }
    }
}

impl fmt::Display for RequirementStrength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Required => write!(f, "required"),
            Self::Optional => write!(f, "optional"),
        }
    }
}

/// Dictionary entry. Every attribute consumed anywhere must be registered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeDefinition {
    pub id: String,
    pub name: String,
    pub value_type: AttributeValueType,
    #[serde(default)]
    pub validation: AttributeConstraints,
    #[serde(default)]
    pub description: Option<String>,
}

/// Where a value came from, in priority order (derived wins).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeSource {
    Derived,
    Entity,
    Cbu,
    Document,
    Manual,
    External,
}

impl AttributeSource {
    pub const PRIORITY: [AttributeSource; 6] = [
        Self::Derived,
        Self::Entity,
        Self::Cbu,
        Self::Document,
        Self::Manual,
        Self::External,
    ];

    /// 0 is the highest priority.
    pub fn rank(self) -> usize {
        self as usize
    }
}

impl fmt::Display for AttributeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Derived => "derived",
            Self::Entity => "entity",
            Self::Cbu => "cbu",
            Self::Document => "document",
            Self::Manual => "manual",
            Self::External => "external",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceRef {
    pub evidence_type: String,
    pub evidence_id: String,
    #[serde(default)]
    pub verified: bool,
    #[serde(default)]
    pub observed_at: Option<DateTime<Utc>>,
}

impl EvidenceRef {
    pub fn is_verified_document(&self) -> bool {
        self.evidence_type == "document" && self.verified
    }
}

/// One step of a derivation trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExplainRef {
    pub rule: String,
    pub input: Option<JsonValue>,
    pub output: Option<JsonValue>,
}

/// Current value of an attribute for a CBU.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CbuAttrValue {
    pub cbu_id: Uuid,
    pub attr_id: String,
    pub value: JsonValue,
    pub source: AttributeSource,
    pub evidence_refs: Vec<EvidenceRef>,
    pub explain_refs: Vec<ExplainRef>,
    pub as_of: DateTime<Utc>,
}

impl CbuAttrValue {
    /// Same value from the same source with the same evidence.
    pub fn same_content(&self, other: &CbuAttrValue) -> bool {
        self.value == other.value
            && self.source == other.source
            && self.evidence_refs == other.evidence_refs
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    LengthRange,
    ValueRange,
    AllowedValues,
}

/// One contributor's declared constraints, kept for conflict explanation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintContribution {
    pub srdef_id: String,
    pub constraints: AttributeConstraints,
}

/// Irreconcilable constraints between contributing SRDEFs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeConflict {
    pub attr_id: String,
    pub kind: ConflictKind,
    pub contributors: Vec<ConstraintContribution>,
    pub explain: String,
}

/// Per (cbu, attribute) merged requirement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CbuUnifiedAttrRequirement {
    pub cbu_id: Uuid,
    pub attr_id: String,
    pub requirement_strength: RequirementStrength,
    pub merged_constraints: AttributeConstraints,
    pub evidence_policy: EvidencePolicy,
    pub source_policy: Vec<AttributeSource>,
    pub preferred_source: Option<AttributeSource>,
    pub required_by_srdefs: BTreeSet<String>,
    pub default_value: Option<JsonValue>,
    pub conflict: Option<AttributeConflict>,
}

impl CbuUnifiedAttrRequirement {
    pub fn is_required(&self) -> bool {
        self.requirement_strength == RequirementStrength::Required
    }
}

// =============================================================================
// PROVISIONING
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProvisioningStatus {
    Queued,
    Sent,
    Ack,
    Completed,
    Failed,
    Cancelled,
}

impl ProvisioningStatus {
    /// Waiting on the owner system.
    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Queued | Self::Sent | Self::Ack)
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        use ProvisioningStatus::*;
        matches!(
            (self, next),
            (Queued, Sent | Failed | Cancelled)
                | (Sent, Ack | Completed | Failed | Cancelled)
                | (Ack, Completed | Failed | Cancelled)
        )
    }
}

impl fmt::Display for ProvisioningStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Sent => "sent",
            Self::Ack => "ack",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestedBy {
    System,
    Operator,
}

impl fmt::Display for RequestedBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::Operator => write!(f, "operator"),
        }
    }
}

/// Outbound payload sent to the owner system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisioningPayload {
    pub cbu_id: Uuid,
    pub srdef_id: String,
    pub parameters: ResourceParameters,
    pub attrs: BTreeMap<String, JsonValue>,
    /// inject_arg → dependency handle
    pub bind_to: BTreeMap<String, String>,
    pub idempotency_key: String,
}

/// One attempt to provision a requirement through the owner system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisioningRequest {
    pub request_id: Uuid,
    pub cbu_id: Uuid,
    pub srdef_id: String,
    pub requirement_key: String,
    pub instance_id: Uuid,
    pub attempt: u32,
    pub retry_of: Option<Uuid>,
    pub requested_by: RequestedBy,
    pub requested_at: DateTime<Utc>,
    pub request_payload: ProvisioningPayload,
    pub status: ProvisioningStatus,
    pub owner_system: String,
    pub owner_ticket_id: Option<String>,
    pub status_changed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventDirection {
    Out,
    In,
}

impl fmt::Display for EventDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Out => write!(f, "OUT"),
            Self::In => write!(f, "IN"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    RequestSent,
    Ack,
    Result,
    Error,
    Status,
    Retry,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::RequestSent => "REQUEST_SENT",
            Self::Ack => "ACK",
            Self::Result => "RESULT",
            Self::Error => "ERROR",
            Self::Status => "STATUS",
            Self::Retry => "RETRY",
        };
        write!(f, "{}", s)
    }
}

/// Result reported by the owner system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum OwnerProvisioningResult {
    Success {
        srid: String,
        native_key: String,
        resource_url: Option<String>,
    },
    Failure {
        reason: String,
    },
}

/// Typed event body; the tag is the event kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventPayload {
    RequestSent {
        payload: ProvisioningPayload,
    },
    Ack {
        owner_ticket_id: Option<String>,
    },
    Result {
        result: OwnerProvisioningResult,
    },
    Error {
        code: Option<String>,
        message: String,
    },
    Status {
        status: String,
        message: Option<String>,
    },
    Retry {
        reason: String,
        next_request_id: Uuid,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::RequestSent { .. } => EventKind::RequestSent,
            Self::Ack { .. } => EventKind::Ack,
            Self::Result { .. } => EventKind::Result,
            Self::Error { .. } => EventKind::Error,
            Self::Status { .. } => EventKind::Status,
            Self::Retry { .. } => EventKind::Retry,
        }
    }
}

/// Immutable ledger row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisioningEvent {
    pub event_id: Uuid,
    pub request_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub direction: EventDirection,
    pub payload: EventPayload,
    pub content_hash: Option<String>,
}

impl ProvisioningEvent {
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

/// Callback delivered by an owner system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    pub request_id: Uuid,
    pub payload: EventPayload,
    #[serde(default)]
    pub content_hash: Option<String>,
    #[serde(default)]
    pub occurred_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "disposition", rename_all = "snake_case")]
pub enum EventDisposition {
    /// The request moved to `status`.
    Applied { status: ProvisioningStatus },
    /// Informational; recorded without a status change.
    Recorded,
    /// Arrived too late or out of order to change anything.
    NoChange { reason: String },
}

/// What processing an inbound event did. Replayed verbatim for duplicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestOutcome {
    pub event_id: Uuid,
    pub request_id: Uuid,
    pub kind: EventKind,
    pub disposition: EventDisposition,
    pub request_status: ProvisioningStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestResult {
    pub outcome: IngestOutcome,
    pub duplicate: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Pending,
    Provisioning,
    Active,
    Suspended,
    Decommissioned,
}

impl InstanceStatus {
    pub fn can_transition_to(self, next: Self) -> bool {
        use InstanceStatus::*;
        matches!(
            (self, next),
            (Pending, Provisioning | Active)
                | (Provisioning, Active | Pending)
                | (Active, Suspended | Decommissioned)
                | (Suspended, Active | Decommissioned)
        )
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Provisioning => "PROVISIONING",
            Self::Active => "ACTIVE",
            Self::Suspended => "SUSPENDED",
            Self::Decommissioned => "DECOMMISSIONED",
        };
        write!(f, "{}", s)
    }
}

/// The materialized resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceInstance {
    pub instance_id: Uuid,
    pub cbu_id: Uuid,
    pub srdef_id: String,
    pub requirement_key: String,
    pub parameters: ResourceParameters,
    pub status: InstanceStatus,
    pub srid: Option<String>,
    pub native_key: Option<String>,
    pub resource_url: Option<String>,
    pub last_request_id: Option<Uuid>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ResourceInstance {
    /// Handle injected into dependents: URL when known, else the SRID.
    pub fn handle(&self) -> Option<String> {
        self.resource_url.clone().or_else(|| self.srid.clone())
    }

    pub fn is_active(&self) -> bool {
        self.status == InstanceStatus::Active
    }
}

/// The instance that currently represents `requirement_key`.
///
/// Prefers the newest non-decommissioned instance.
pub fn current_instance<'a>(
    instances: &'a [ResourceInstance],
    requirement_key: &str,
) -> Option<&'a ResourceInstance> {
    let mut matching: Vec<&ResourceInstance> = instances
        .iter()
        .filter(|i| i.requirement_key == requirement_key)
        .collect();
    matching.sort_by_key(|i| (i.status != InstanceStatus::Decommissioned, i.created_at));
    matching.last().copied()
}

// =============================================================================
// READINESS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadinessStatus {
    Ready,
    Partial,
    Blocked,
}

impl fmt::Display for ReadinessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => write!(f, "ready"),
            Self::Partial => write!(f, "partial"),
            Self::Blocked => write!(f, "blocked"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockingReasonType {
    MissingSrdef,
    PendingProvisioning,
    FailedProvisioning,
    DependencyNotReady,
    MissingAttrs,
    AttrConflict,
}

impl fmt::Display for BlockingReasonType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::MissingSrdef => "missing_srdef",
            Self::PendingProvisioning => "pending_provisioning",
            Self::FailedProvisioning => "failed_provisioning",
            Self::DependencyNotReady => "dependency_not_ready",
            Self::MissingAttrs => "missing_attrs",
            Self::AttrConflict => "attr_conflict",
        };
        write!(f, "{}", s)
    }
}

/// Where a not-yet-active requirement sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingState {
    NotStarted,
    Queued,
    Sent,
    Acknowledged,
    Provisioning,
    Suspended,
    Decommissioned,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason_type", rename_all = "snake_case")]
pub enum BlockingReason {
    MissingSrdef {
        srdef_id: String,
    },
    PendingProvisioning {
        srdef_id: String,
        requirement_key: String,
        state: PendingState,
        request_id: Option<Uuid>,
    },
    FailedProvisioning {
        srdef_id: String,
        requirement_key: String,
        request_id: Option<Uuid>,
        reason: String,
    },
    DependencyNotReady {
        srdef_id: String,
        requirement_key: String,
        depends_on: Vec<String>,
    },
    MissingAttrs {
        attr_ids: Vec<String>,
    },
    AttrConflict {
        attr_id: String,
        conflict: AttributeConflict,
    },
}

impl BlockingReason {
    pub fn reason_type(&self) -> BlockingReasonType {
        match self {
            Self::MissingSrdef { .. } => BlockingReasonType::MissingSrdef,
            Self::PendingProvisioning { .. } => BlockingReasonType::PendingProvisioning,
            Self::FailedProvisioning { .. } => BlockingReasonType::FailedProvisioning,
            Self::DependencyNotReady { .. } => BlockingReasonType::DependencyNotReady,
            Self::MissingAttrs { .. } => BlockingReasonType::MissingAttrs,
            Self::AttrConflict { .. } => BlockingReasonType::AttrConflict,
        }
    }

    pub fn srdef_id(&self) -> Option<&str> {
        match self {
            Self::MissingSrdef { srdef_id }
            | Self::PendingProvisioning { srdef_id, .. }
            | Self::FailedProvisioning { srdef_id, .. }
            | Self::DependencyNotReady { srdef_id, .. } => Some(srdef_id),
            Self::MissingAttrs { .. } | Self::AttrConflict { .. } => None,
        }
    }

    /// Human-readable explanation.
    pub fn explain(&self) -> String {
        match self {
            Self::MissingSrdef { srdef_id } => format!("SRDEF {} not discovered", srdef_id),
            Self::PendingProvisioning {
                requirement_key,
                state,
                ..
            } => format!(
                "{} provisioning in progress ({})",
                requirement_key,
                serde_json::to_value(state)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default()
            ),
            Self::FailedProvisioning {
                requirement_key,
                reason,
                ..
            } => format!("{} provisioning failed: {}", requirement_key, reason),
            Self::DependencyNotReady {
                requirement_key,
                depends_on,
                ..
            } => format!(
                "{} waiting on dependencies: {}",
                requirement_key,
                depends_on.join(", ")
            ),
            Self::MissingAttrs { attr_ids } => format!(
                "{} required attributes missing: {}",
                attr_ids.len(),
                attr_ids.join(", ")
            ),
            Self::AttrConflict { attr_id, conflict } => {
                format!("attribute {} has conflicting constraints: {}", attr_id, conflict.explain)
            }
        }
    }
}

/// Derived "good to transact" record per (cbu, product, service).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CbuServiceReadiness {
    pub cbu_id: Uuid,
    pub product_code: String,
    pub service_code: String,
    pub status: ReadinessStatus,
    pub blocking_reasons: Vec<BlockingReason>,
    pub required_srdefs: Vec<String>,
    pub active_srids: Vec<String>,
    /// Snapshot time of the inputs this record was computed from.
    pub as_of: DateTime<Utc>,
    pub last_recomputed_at: DateTime<Utc>,
    pub recomputation_trigger: Option<String>,
    pub is_stale: bool,
}

impl CbuServiceReadiness {
    /// Equal status, reasons and resource sets; timestamps ignored.
    pub fn same_outcome(&self, other: &CbuServiceReadiness) -> bool {
        self.status == other.status
            && self.blocking_reasons == other.blocking_reasons
            && self.required_srdefs == other.required_srdefs
            && self.active_srids == other.active_srids
    }

    pub fn reason_types(&self) -> Vec<BlockingReasonType> {
        self.blocking_reasons.iter().map(|r| r.reason_type()).collect()
    }
}
