//! SRDEF Catalog Command Line Interface
//!
//! Validates the resource catalog, prints its provisioning order and runs an
//! in-memory demo of the full pipeline.
//!
//! # Usage
//!
//! ```bash
//! # Validate catalog in SRDEF_CONFIG_DIR (default config/srdefs)
//! srdef_cli validate
//!
//! # Dependency-first provisioning order
//! srdef_cli order --dir config/srdefs
//!
//! # Custody onboarding demo over two markets and two currencies
//! srdef_cli demo --markets XNYS,XLON --currencies USD,EUR
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use ob_resource_pipeline::service_resources::{
    AttributeSource, AttributeSources, CandidateValue, CbuServiceReadiness, EventPayload,
    InboundEvent, IntentOptions, NewServiceIntent, OwnerProvisioningResult, ReadinessStatus,
    ServiceResourcePipelineService, SrdefLoader, SrdefRegistry, StaticSourceProvider,
};
use ob_resource_pipeline::PipelineConfig;

#[derive(Parser)]
#[command(name = "srdef_cli")]
#[command(author = "ob-poc")]
#[command(version = "0.1.0")]
#[command(about = "Service resource catalog validation and pipeline demo")]
#[command(long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Catalog directory (overrides SRDEF_CONFIG_DIR)
    #[arg(long, short = 'd', global = true)]
    dir: Option<PathBuf>,

    /// Output format: json or pretty (default)
    #[arg(long, short = 'o', global = true, default_value = "pretty", value_enum)]
    format: OutputFormat,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Json,
    Pretty,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate the catalog; fails if anything is quarantined
    Validate,

    /// Print SRDEFs in dependency-first provisioning order
    Order,

    /// Run the custody onboarding demo against an in-memory store
    Demo {
        /// Comma-separated market codes
        #[arg(long, value_delimiter = ',', default_value = "XNYS")]
        markets: Vec<String>,

        /// Comma-separated currency codes
        #[arg(long, value_delimiter = ',', default_value = "USD")]
        currencies: Vec<String>,

        /// Leave settlement requests in flight instead of completing them
        #[arg(long)]
        no_callbacks: bool,
    },
}

// =============================================================================
// MAIN
// =============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let result = match load_registry(cli.dir.clone()) {
        Ok(registry) => match cli.command {
            Commands::Validate => cmd_validate(&registry, cli.format),
            Commands::Order => cmd_order(&registry, cli.format),
            Commands::Demo {
                markets,
                currencies,
                no_callbacks,
            } => cmd_demo(registry, markets, currencies, no_callbacks, cli.format).await,
        },
        Err(e) => Err(e),
    };

    match result {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            if cli.format == OutputFormat::Json {
                println!("{}", serde_json::json!({ "error": format!("{:#}", e) }));
            } else {
                eprintln!("{}: {:#}", "error".red().bold(), e);
            }
            ExitCode::FAILURE
        }
    }
}

fn load_registry(dir: Option<PathBuf>) -> Result<SrdefRegistry> {
    let dir = match dir {
        Some(dir) => dir,
        None => PipelineConfig::from_env()?.srdef_config_dir,
    };
    SrdefLoader::new(&dir)
        .load_all()
        .with_context(|| format!("Failed to load catalog from {}", dir.display()))
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("JSON serialization failed")?
    );
    Ok(())
}

// =============================================================================
// COMMAND IMPLEMENTATIONS
// =============================================================================

fn cmd_validate(registry: &SrdefRegistry, format: OutputFormat) -> Result<()> {
    let mut ids: Vec<&String> = registry.srdefs.keys().collect();
    ids.sort();

    match format {
        OutputFormat::Json => print_json(&serde_json::json!({
            "srdefs": ids,
            "attributes": registry.attributes.len(),
            "quarantined": registry.quarantined,
            "issues": registry.issues,
        }))?,
        OutputFormat::Pretty => {
            println!(
                "{} {} SRDEFs, {} attributes",
                "Catalog".bold(),
                ids.len(),
                registry.attributes.len()
            );
            for id in &ids {
                match registry.quarantine_reason(id) {
                    Some(reason) => println!("  {} {} ({})", "QUARANTINED".red(), id, reason),
                    None => println!("  {} {}", "OK".green(), id),
                }
            }
            for issue in &registry.issues {
                println!("  {} {}", "warning".yellow(), issue);
            }
        }
    }

    if registry.quarantined.is_empty() && registry.issues.is_empty() {
        Ok(())
    } else {
        anyhow::bail!(
            "{} SRDEFs quarantined, {} catalog issues",
            registry.quarantined.len(),
            registry.issues.len()
        )
    }
}

fn cmd_order(registry: &SrdefRegistry, format: OutputFormat) -> Result<()> {
    let order = registry.provisioning_order()?;
    match format {
        OutputFormat::Json => print_json(&order)?,
        OutputFormat::Pretty => {
            for (i, id) in order.iter().enumerate() {
                let strategy = registry
                    .get(id)
                    .map(|s| s.provisioning_strategy.to_string())
                    .unwrap_or_default();
                println!("{:>3}. {} [{}]", i + 1, id, strategy.cyan());
            }
        }
    }
    Ok(())
}

async fn cmd_demo(
    registry: SrdefRegistry,
    markets: Vec<String>,
    currencies: Vec<String>,
    no_callbacks: bool,
    format: OutputFormat,
) -> Result<()> {
    let cbu_id = Uuid::now_v7();

    let entity = Arc::new(StaticSourceProvider::new(AttributeSource::Entity));
    entity.insert(cbu_id, "legal_name", CandidateValue::new("Acme Global Equity Fund".into()));
    let cbu = Arc::new(StaticSourceProvider::new(AttributeSource::Cbu));
    cbu.insert(cbu_id, "account_name", CandidateValue::new("ACME GLOBAL EQUITY".into()));
    cbu.insert(cbu_id, "base_currency", CandidateValue::new("USD".into()));
    cbu.insert(cbu_id, "settlement_bic", CandidateValue::new("ACMEUS33XXX".into()));
    let sources = AttributeSources::new()
        .with_provider(entity)
        .with_provider(cbu);

    let service = ServiceResourcePipelineService::in_memory(registry).with_sources(Arc::new(sources));

    for service_code in ["SAFEKEEPING", "SETTLEMENT"] {
        service
            .declare_intent(NewServiceIntent {
                cbu_id,
                product_code: "CUSTODY".to_string(),
                service_code: service_code.to_string(),
                options: IntentOptions {
                    markets: markets.clone(),
                    currencies: currencies.clone(),
                    ..Default::default()
                },
                created_by: Some("srdef_cli".to_string()),
            })
            .await?;
    }

    let run = service.run_full_pipeline(cbu_id).await?;
    if format == OutputFormat::Pretty {
        println!("{} CBU {}", "Demo".bold(), cbu_id);
        println!(
            "  discovered {} requirements, populated {} attrs ({} missing), sent {} requests",
            run.discovery.srdefs_discovered,
            run.discovery.attrs_populated,
            run.discovery.attrs_missing,
            run.provisioning.requests_created
        );
        print_readiness("after first run", &run.provisioning.readiness.records);
    }

    if !no_callbacks {
        let in_flight = service.store().in_flight_requests().await?;
        for (n, request) in in_flight.iter().enumerate() {
            service
                .ingest_event(InboundEvent {
                    request_id: request.request_id,
                    payload: EventPayload::Ack {
                        owner_ticket_id: Some(format!("TICKET-{:04}", n + 1)),
                    },
                    content_hash: None,
                    occurred_at: None,
                })
                .await?;
            service
                .ingest_event(InboundEvent {
                    request_id: request.request_id,
                    payload: EventPayload::Result {
                        result: OwnerProvisioningResult::Success {
                            srid: format!("SR::{}::{:04}", request.owner_system, n + 1),
                            native_key: format!("{}-{:04}", request.owner_system, n + 1),
                            resource_url: None,
                        },
                    },
                    content_hash: None,
                    occurred_at: None,
                })
                .await?;
        }
        if format == OutputFormat::Pretty {
            println!("  completed {} owner requests", in_flight.len());
        }
    }

    let readiness = service.readiness(cbu_id).await?;
    match format {
        OutputFormat::Json => print_json(&serde_json::json!({
            "cbu_id": cbu_id,
            "run": run,
            "readiness": readiness,
        }))?,
        OutputFormat::Pretty => print_readiness("final", &readiness),
    }
    Ok(())
}

fn print_readiness(label: &str, records: &[CbuServiceReadiness]) {
    println!("  {} ({}):", "Readiness".bold(), label);
    for record in records {
        let status = match record.status {
            ReadinessStatus::Ready => record.status.to_string().green(),
            ReadinessStatus::Partial => record.status.to_string().yellow(),
            ReadinessStatus::Blocked => record.status.to_string().red(),
        };
        println!(
            "    {}/{} {} ({} active resources)",
            record.product_code,
            record.service_code,
            status,
            record.active_srids.len()
        );
        for reason in &record.blocking_reasons {
            println!("      - {}", reason.explain());
        }
    }
}
