//! Service Resources Pipeline
//!
//! This module implements the CBU Service → Resource Discovery → Unified Dictionary → Provisioning → Readiness pipeline.
//!
//! ## Overview
//!
//! ```text
//! ServiceIntent (what CBU wants)
//!        ↓
//! ResourceDiscoveryEngine (derive parameterized requirements)
//!        ↓
//! DiscoveryReason (audit trail)
//!        ↓
//! AttributeRollupEngine (merge attr requirements, detect conflicts)
//!        ↓
//! CbuUnifiedAttrRequirement (per-CBU attr needs)
//!        ↓
//! PopulationEngine (fill values from ranked sources)
//!        ↓
//! CbuAttrValue (populated values + evidence)
//!        ↓
//! ProvisioningOrchestrator (dependency layers, atomic claims)
//!        ↓
//! ProvisioningRequest → ProvisioningEvent (append-only ledger)
//!        ↓
//! ReadinessEngine (compute "good to transact")
//!        ↓
//! CbuServiceReadiness
//! ```
//!
//! ## Storage
//!
//! | Record | Purpose |
//! |-------|---------|
//! | `ServiceIntent` | What CBU wants (versioned) |
//! | `DiscoveredRequirement` | Why each resource is needed (superseded, never deleted) |
//! | `CbuUnifiedAttrRequirement` | Rolled-up attr requirements |
//! | `CbuAttrValue` | Populated attribute values |
//! | `ProvisioningRequest` | One row per attempt |
//! | `ProvisioningEvent` | Append-only event log |
//! | `CbuServiceReadiness` | Derived readiness status |

pub mod condition;
pub mod discovery;
pub mod ledger;
#[cfg(feature = "database")]
pub mod pg_store;
pub mod population;
pub mod provisioning;
pub mod readiness;
pub mod rollup;
pub mod service;
pub mod srdef_loader;
pub mod store;
pub mod types;

// Re-export main types
pub use types::{
    // Attribute types
    AttributeConflict,
    AttributeConstraints,
    AttributeDefinition,
    AttributeSource,
    AttributeValueType,
    // Readiness types
    BlockingReason,
    BlockingReasonType,
    CbuAttrValue,
    CbuFacts,
    CbuServiceReadiness,
    CbuUnifiedAttrRequirement,
    ConflictKind,
    ConstraintContribution,
    DependencyType,
    // Discovery types
    DiscoveredRequirement,
    DiscoveryReason,
    DiscoveryRule,
    EventDirection,
    EventDisposition,
    EventKind,
    EventPayload,
    EvidencePolicy,
    EvidenceRef,
    ExplainRef,
    InboundEvent,
    IngestOutcome,
    IngestResult,
    InstanceStatus,
    IntentOptions,
    NewServiceIntent,
    OwnerProvisioningResult,
    ParameterDimension,
    PendingState,
    ProvisioningEvent,
    ProvisioningPayload,
    // Provisioning types
    ProvisioningRequest,
    ProvisioningStatus,
    // SRDEF types
    ProvisioningStrategy,
    ReadinessStatus,
    RequestedBy,
    RequirementStrength,
    ResourceDependency,
    ResourceInstance,
    ResourceParameters,
    // Core types
    ServiceIntent,
    ServiceIntentStatus,
};

pub use service::{CbuPipelineRun, ServiceResourcePipelineService};

pub use store::{MemoryStore, PipelineStore, StoreError};

#[cfg(feature = "database")]
pub use pg_store::PgStore;

// Re-export loader types
pub use srdef_loader::{
    load_srdefs_from_config, CatalogError, LoadedSrdef, LoadedSrdefAttribute, SrdefConfigFile,
    SrdefLoader, SrdefRegistry,
};

// Re-export engine types
pub use discovery::{
    run_discovery_pipeline, DiscoveryIssue, DiscoveryResult, PipelineResult,
    ResourceDiscoveryEngine,
};
pub use population::{
    AttributeGap, AttributeSourceProvider, AttributeSources, CandidateValue, GapReason,
    PopulationEngine, PopulationResult, StaticSourceProvider,
};
pub use rollup::{AttributeRollupEngine, RollupResult};

// Re-export provisioning types
pub use ledger::ProvisioningLedger;
pub use provisioning::{
    run_provisioning_pipeline, FullPipelineResult, ProvisionResult, ProvisioningOrchestrator,
    ProvisioningOrchestratorResult, RequirementOutcome, ResourceProvisioner, StubProvisioner,
};
pub use readiness::{ReadinessComputeResult, ReadinessEngine};
