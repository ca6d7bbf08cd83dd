//! mvirt-lb: load balancer reconciler CLI.
//!
//! - `plan` shows the calls an update would issue and whether it needs a replacement
//! - `arn-suffix` extracts the identity suffix from an ARN
//! - `simulate` runs a full lifecycle against the in-memory control plane

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mvirt_lb::arn::arn_suffix;
use mvirt_lb::clients::{InMemoryCloud, SimulationOptions};
use mvirt_lb::clock::ManualClock;
use mvirt_lb::reconciler::{LoadBalancerReconciler, plan_update, requires_replacement};
use mvirt_lb::{DesiredLoadBalancer, ReconcilerConfig};

/// mvirt load balancer reconciler
#[derive(Parser, Debug)]
#[command(name = "mvirt-lb", version, about)]
struct Cli {
    /// Reconciler configuration file (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the create timeout in seconds
    #[arg(long, global = true)]
    create_timeout_secs: Option<u64>,

    /// Override the update timeout in seconds
    #[arg(long, global = true)]
    update_timeout_secs: Option<u64>,

    /// Override the delete cleanup timeout in seconds
    #[arg(long, global = true)]
    delete_timeout_secs: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the update plan for a desired state as JSON
    Plan {
        /// Desired state file (JSON)
        #[arg(long)]
        desired: PathBuf,

        /// Previously applied desired state file (JSON)
        #[arg(long)]
        prior: Option<PathBuf>,

        /// Plan the update chained right after a create
        #[arg(long)]
        new: bool,
    },

    /// Print the `<type>/<name>/<id>` suffix of a load balancer ARN
    ArnSuffix {
        /// Load balancer ARN
        arn: String,
    },

    /// Create, read, optionally update, and delete against an in-memory control plane
    Simulate {
        /// Desired state file (JSON)
        #[arg(long)]
        desired: PathBuf,

        /// Desired state to update to after create (JSON)
        #[arg(long)]
        update: Option<PathBuf>,

        /// Describe calls reporting `provisioning` after create
        #[arg(long, default_value = "2")]
        provisioning_reads: u32,

        /// Interface queries before platform interfaces disappear after delete
        #[arg(long, default_value = "2")]
        platform_interface_lifetime: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mvirt_lb=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli).await?;

    match cli.command {
        Commands::Plan {
            desired,
            prior,
            new,
        } => {
            let desired: DesiredLoadBalancer = read_json(&desired).await?;
            let prior: Option<DesiredLoadBalancer> = match prior {
                Some(path) => Some(read_json(&path).await?),
                None => None,
            };

            let plan = plan_update(prior.as_ref(), &desired, new);
            let immutable = prior
                .as_ref()
                .map(|p| p.immutable_changes(&desired))
                .unwrap_or_default();
            let replace = !immutable.is_empty()
                || requires_replacement(
                    desired.variant(),
                    prior.as_ref().filter(|_| !new).map(|p| &p.attachments),
                    &desired.attachments,
                );

            let output = json!({
                "plan": plan,
                "immutable_changes": immutable,
                "requires_replacement": replace,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }

        Commands::ArnSuffix { arn } => {
            println!("{}", arn_suffix(&arn)?);
        }

        Commands::Simulate {
            desired,
            update,
            provisioning_reads,
            platform_interface_lifetime,
        } => {
            let desired: DesiredLoadBalancer = read_json(&desired).await?;
            let update: Option<DesiredLoadBalancer> = match update {
                Some(path) => Some(read_json(&path).await?),
                None => None,
            };

            let cloud = Arc::new(InMemoryCloud::new(SimulationOptions {
                provisioning_reads,
                platform_interface_lifetime,
                ..Default::default()
            }));
            let clock = Arc::new(ManualClock::new());
            let reconciler = LoadBalancerReconciler::with_clock(
                cloud.clone(),
                cloud.clone(),
                clock.clone(),
                config,
            );

            let steps = simulate(&reconciler, &desired, update.as_ref()).await?;
            for (step, value) in &steps {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&json!({ "step": step, "value": value }))?
                );
            }

            info!(
                calls = cloud.calls().await.len(),
                virtual_time = ?clock.elapsed(),
                "simulation finished"
            );
        }
    }

    Ok(())
}

async fn load_config(cli: &Cli) -> Result<ReconcilerConfig> {
    let mut config = match &cli.config {
        Some(path) => read_json(path).await?,
        None => ReconcilerConfig::default(),
    };
    if let Some(secs) = cli.create_timeout_secs {
        config.create_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = cli.update_timeout_secs {
        config.update_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = cli.delete_timeout_secs {
        config.delete_timeout = Duration::from_secs(secs);
    }
    Ok(config)
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

/// Create, read, optionally converge to `update`, then delete whatever
/// load balancer is current at the end. Returns each step's output.
async fn simulate(
    reconciler: &LoadBalancerReconciler,
    desired: &DesiredLoadBalancer,
    update: Option<&DesiredLoadBalancer>,
) -> Result<Vec<(&'static str, Value)>> {
    let mut steps = Vec::new();

    let created = reconciler.create(desired).await.context("create failed")?;
    let mut arn = created.arn.clone();
    steps.push(("created", serde_json::to_value(&created)?));

    let read = reconciler
        .read(&arn)
        .await
        .context("read failed")?
        .context("load balancer vanished after create")?;
    steps.push(("read", serde_json::to_value(&read)?));

    if let Some(update) = update {
        let converged = reconciler
            .converge(Some(&arn), Some(desired), update)
            .await
            .context("update failed")?;
        // A replacement has a new identity.
        arn = converged.load_balancer.arn.clone();
        steps.push(("converged", serde_json::to_value(&converged)?));
    }

    let report = reconciler.delete(&arn).await.context("delete failed")?;
    let warnings: Vec<String> = report.warnings.iter().map(|w| w.to_string()).collect();
    steps.push((
        "deleted",
        json!({
            "arn": arn,
            "interfaces_removed": report.interfaces_removed,
            "warnings": warnings,
        }),
    ));

    Ok(steps)
}
