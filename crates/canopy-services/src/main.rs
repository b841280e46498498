//! CLI entry point for the canopy operator tool.
//!
//! Runs a script of service requests (one JSON object per line) against the
//! configured storage backend and prints one JSON report per line to stdout.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use canopy_core::config::CanopyConfig;
use canopy_core::{CancelSignal, Context, SchemaRegistry, TenantId};
use canopy_graph::EntityManager;
use canopy_services::script::run_file;
use canopy_services::ServiceManager;
use canopy_store::StoreClient;

#[derive(Parser)]
#[command(name = "canopy")]
#[command(about = "Operator tool for the Canopy entity graph")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Tenant to act in. A fresh tenant is used when omitted.
    #[arg(long, global = true)]
    tenant_id: Option<String>,

    /// Config file prefix (default: canopy).
    #[arg(short, long, default_value = "canopy", global = true)]
    config: String,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a file of JSON request lines.
    Run {
        /// Path to the request script.
        requests: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .json()
        .init();

    let cli = Cli::parse();
    let config = CanopyConfig::load(&cli.config)?;
    let tenant_id = resolve_tenant_id(&cli)?;

    let store = StoreClient::connect(&config.store).await?;
    let timeout = Duration::from_millis(config.store.timeout_ms);
    let base_uri = config.base_uri.clone();
    let services = ServiceManager::new(EntityManager::new(
        store,
        SchemaRegistry::with_builtins(),
        config,
    ));

    let cancel = CancelSignal::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, finishing the current request");
            on_interrupt.cancel();
        }
    });

    let ctx = Context::system(tenant_id)
        .with_timeout(timeout)
        .with_cancel(cancel);

    match cli.command {
        Command::Run { requests } => {
            tracing::info!(tenant_id = %tenant_id, script = %requests.display(), "Running request script");
            let reports = run_file(&services, &ctx, &base_uri, &requests).await?;
            for report in &reports {
                println!("{}", serde_json::to_string(report)?);
            }
            let failed = reports
                .iter()
                .filter(|r| r.error.is_some())
                .count();
            tracing::info!(requests = reports.len(), failed, "Script finished");
        }
    }

    Ok(())
}

fn resolve_tenant_id(cli: &Cli) -> anyhow::Result<TenantId> {
    match cli.tenant_id.as_deref() {
        Some(raw) => Ok(TenantId(uuid::Uuid::parse_str(raw)?)),
        None => {
            let tenant = TenantId::new();
            tracing::info!(tenant_id = %tenant, "No --tenant-id given, using a fresh tenant");
            Ok(tenant)
        }
    }
}
