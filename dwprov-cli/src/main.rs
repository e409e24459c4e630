//! dwprov: declarative provisioning of warehouse cluster audit logging.
//!
//! Resources are declared in a TOML file and converged against the
//! control plane. Tracked instances live in a SQLite database; the control
//! plane is the in-memory simulator, persisted as a JSON snapshot between
//! invocations.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use dwprov_engine::sim::WarehouseSnapshot;
use dwprov_engine::{
    AttrValue, DriftStatus, InstanceStore, LifecycleController, LoggingMapper, SimulatedWarehouse,
    SqliteStore, StateMapper, TrackedInstance,
};
use tabled::{Table, Tabled};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;

use config::Config;

type Controller = LifecycleController<SimulatedWarehouse, LoggingMapper>;

#[derive(Parser)]
#[command(name = "dwprov", version)]
#[command(about = "Declarative provisioning for warehouse cluster logging", long_about = None)]
struct Cli {
    /// Declaration file
    #[arg(short, long, default_value = "dwprov.toml")]
    config: PathBuf,

    /// Tracking database
    #[arg(long, default_value = "dwprov.db")]
    state_db: PathBuf,

    /// Simulated control plane snapshot
    #[arg(long, default_value = "dwprov-remote.json")]
    remote: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply every declared resource and destroy undeclared tracked ones
    Apply,

    /// Show what apply would do
    Plan,

    /// Destroy a tracked instance
    Destroy {
        /// Identifier (c1 or c1:logging)
        id: Option<String>,

        /// Destroy every tracked instance
        #[arg(long, conflicts_with = "id")]
        all: bool,
    },

    /// Track an existing remote instance
    Import {
        /// Identifier (c1 or c1:logging)
        id: String,

        /// Name of the declaring resource block
        #[arg(short, long)]
        name: String,
    },

    /// Compare a tracked instance against the remote
    Check {
        /// Identifier (c1 or c1:logging)
        id: String,
    },

    /// Fail if any of the given instances still exists remotely
    VerifyDestroyed {
        /// Identifiers (c1 or c1:logging)
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// List tracked instances
    List,

    /// Manipulate clusters on the simulated control plane
    #[command(subcommand)]
    Cluster(ClusterCommands),
}

#[derive(Subcommand)]
enum ClusterCommands {
    /// Add a cluster
    Create {
        /// Cluster identifier
        id: String,

        /// Refuse this many mutations as not ready before becoming available
        #[arg(long, default_value = "0")]
        pending: u32,
    },

    /// Delete a cluster together with its logging
    Delete {
        /// Cluster identifier
        id: String,
    },

    /// Disable logging out of band
    DisableLogging {
        /// Cluster identifier
        id: String,
    },

    /// List clusters
    List,
}

#[derive(Tabled)]
struct InstanceRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "GEN")]
    generation: u64,
    #[tabled(rename = "ATTRIBUTES")]
    attributes: String,
    #[tabled(rename = "UPDATED")]
    updated_at: String,
}

impl From<TrackedInstance> for InstanceRow {
    fn from(instance: TrackedInstance) -> Self {
        Self {
            id: instance.id.to_string(),
            name: instance.name,
            generation: instance.generation,
            attributes: format_attributes(&instance.spec.attributes),
            updated_at: instance.updated_at,
        }
    }
}

#[derive(Tabled)]
struct ResultRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "RESULT")]
    result: String,
}

#[derive(Tabled)]
struct ClusterRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "LOGGING")]
    logging: String,
    #[tabled(rename = "DESTINATION")]
    destination: String,
}

fn format_attributes(attributes: &BTreeMap<String, AttrValue>) -> String {
    if attributes.is_empty() {
        return "-".to_string();
    }
    attributes
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(" ")
}

fn load_remote(path: &Path) -> Result<SimulatedWarehouse> {
    if !path.exists() {
        debug!(path = %path.display(), "No remote snapshot, starting empty");
        return Ok(SimulatedWarehouse::new());
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let snapshot: WarehouseSnapshot = serde_json::from_str(&text)
        .with_context(|| format!("Invalid remote snapshot {}", path.display()))?;
    Ok(SimulatedWarehouse::from_snapshot(snapshot))
}

async fn save_remote(sim: &SimulatedWarehouse, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(&sim.snapshot().await)?;
    std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dwprov=info,dwprov_engine=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = Config::load_or_default(&cli.config)?;

    let sim = Arc::new(load_remote(&cli.remote)?);
    let db_path = cli.state_db.to_string_lossy();
    let store: Arc<dyn InstanceStore> = Arc::new(
        SqliteStore::open(&db_path)
            .await
            .with_context(|| format!("Failed to open tracking database {}", db_path))?,
    );
    let controller = LifecycleController::new(
        Arc::clone(&sim),
        Arc::new(LoggingMapper),
        store,
        config.retry.clone(),
    );

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, canceling in-flight operations");
            on_signal.cancel();
        }
    });

    let result = run(cli.command, config, &controller, &sim, &cancel).await;

    // Persist whatever the remote looks like now, including partial progress.
    save_remote(&sim, &cli.remote).await?;
    result
}

async fn run(
    command: Commands,
    config: Config,
    controller: &Controller,
    sim: &SimulatedWarehouse,
    cancel: &CancellationToken,
) -> Result<()> {
    match command {
        Commands::Apply => {
            let report = controller.sync(config.specs(), cancel).await?;
            let failures = report.failures();

            let mut rows = Vec::new();
            for (name, result) in report.applied {
                rows.push(match result {
                    Ok(outcome) => ResultRow {
                        name,
                        id: outcome.instance.id.to_string(),
                        result: outcome.action.to_string(),
                    },
                    Err(e) => ResultRow {
                        name,
                        id: "-".to_string(),
                        result: format!("error: {}", e),
                    },
                });
            }
            for (id, result) in report.pruned {
                rows.push(ResultRow {
                    name: "-".to_string(),
                    id: id.to_string(),
                    result: match result {
                        Ok(()) => "destroyed".to_string(),
                        Err(e) => format!("error: {}", e),
                    },
                });
            }

            if rows.is_empty() {
                println!("Nothing declared, nothing tracked");
            } else {
                println!("{}", Table::new(rows));
            }
            if failures > 0 {
                bail!("{} resource(s) failed", failures);
            }
        }

        Commands::Plan => {
            let tracked = controller.store().list().await?;
            let declared = controller.pair_declared(config.specs(), &tracked)?;

            let mut rows = Vec::new();
            for (spec, existing) in declared.pairs {
                let name = spec.name.clone();
                let id = controller.mapper().id_for(&spec).to_string();
                let action = controller.plan(spec, existing.as_ref(), cancel).await?;
                rows.push(ResultRow {
                    name,
                    id,
                    result: action.to_string(),
                });
            }
            for stale in declared.stale {
                rows.push(ResultRow {
                    name: stale.name,
                    id: stale.id.to_string(),
                    result: "destroy (no longer declared)".to_string(),
                });
            }

            if rows.is_empty() {
                println!("Nothing declared, nothing tracked");
            } else {
                println!("{}", Table::new(rows));
            }
        }

        Commands::Destroy { id, all } => {
            let ids = if all {
                controller
                    .store()
                    .list()
                    .await?
                    .into_iter()
                    .map(|i| i.id)
                    .collect()
            } else {
                match id {
                    Some(id) => vec![controller.parse_id(&id)?],
                    None => bail!("Specify an identifier or --all"),
                }
            };

            for id in ids {
                controller.destroy_id(&id, cancel).await?;
                println!("Destroyed {}", id);
            }
        }

        Commands::Import { id, name } => {
            let id = controller.parse_id(&id)?;
            let instance = controller.import(&id, &name, cancel).await?;
            println!("{}", Table::new([InstanceRow::from(instance)]));
        }

        Commands::Check { id } => {
            let id = controller.parse_id(&id)?;
            let instance = controller
                .store()
                .get(&id)
                .await?
                .with_context(|| format!("{} is not tracked; import it first", id))?;

            match controller.check(&instance, cancel).await? {
                DriftStatus::InSync(_) => println!("{}: in sync", id),
                DriftStatus::Drifted { diff, .. } => {
                    println!("{}: drifted", id);
                    for field in diff {
                        println!("  {}", field);
                    }
                }
                DriftStatus::Gone => println!("{}: gone", id),
            }
        }

        Commands::VerifyDestroyed { ids } => {
            let ids = ids
                .iter()
                .map(|s| controller.parse_id(s))
                .collect::<dwprov_engine::Result<Vec<_>>>()?;
            controller.verify_destroyed(&ids, cancel).await?;
            println!("{} instance(s) confirmed destroyed", ids.len());
        }

        Commands::List => {
            let instances = controller.store().list().await?;
            if instances.is_empty() {
                println!("No tracked instances");
            } else {
                let rows: Vec<InstanceRow> = instances.into_iter().map(InstanceRow::from).collect();
                println!("{}", Table::new(rows));
            }
        }

        Commands::Cluster(cmd) => run_cluster(cmd, sim).await?,
    }

    Ok(())
}

async fn run_cluster(command: ClusterCommands, sim: &SimulatedWarehouse) -> Result<()> {
    match command {
        ClusterCommands::Create { id, pending } => {
            sim.add_pending_cluster(&id, pending).await;
            info!(cluster = %id, pending, "Cluster added");
            println!("Created cluster {}", id);
        }

        ClusterCommands::Delete { id } => {
            if !sim.delete_cluster(&id).await {
                bail!("Cluster {} not found", id);
            }
            println!("Deleted cluster {}", id);
        }

        ClusterCommands::DisableLogging { id } => {
            if !sim.disable_logging(&id).await {
                bail!("Cluster {} not found", id);
            }
            println!("Disabled logging on {}", id);
        }

        ClusterCommands::List => {
            let snapshot = sim.snapshot().await;
            if snapshot.clusters.is_empty() {
                println!("No clusters");
            } else {
                let rows: Vec<ClusterRow> = snapshot
                    .clusters
                    .into_values()
                    .map(|c| ClusterRow {
                        id: c.identifier,
                        status: c.status.as_str().to_string(),
                        logging: if c.logging.logging_enabled {
                            "enabled".to_string()
                        } else {
                            "disabled".to_string()
                        },
                        destination: c
                            .logging
                            .log_destination_type
                            .unwrap_or_else(|| "-".to_string()),
                    })
                    .collect();
                println!("{}", Table::new(rows));
            }
        }
    }
    Ok(())
}
