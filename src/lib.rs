//! OB Resource Pipeline
//!
//! Turns a CBU's service intents into provisioned resources and an
//! explainable go-live readiness status.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ob_resource_pipeline::service_resources::{
//!     load_srdefs_from_config, IntentOptions, NewServiceIntent, ServiceResourcePipelineService,
//! };
//! use uuid::Uuid;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let registry = load_srdefs_from_config()?;
//! let service = ServiceResourcePipelineService::in_memory(registry);
//! let cbu_id = Uuid::now_v7();
//! service
//!     .declare_intent(NewServiceIntent {
//!         cbu_id,
//!         product_code: "CUSTODY".to_string(),
//!         service_code: "SAFEKEEPING".to_string(),
//!         options: IntentOptions::default(),
//!         created_by: None,
//!     })
//!     .await?;
//! let run = service.run_full_pipeline(cbu_id).await?;
//! println!("{} services ready", run.provisioning.services_ready);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod service_resources;

pub use config::PipelineConfig;

/// Install a `tracing` subscriber filtered by `RUST_LOG` (default `info`).
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
