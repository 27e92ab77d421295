use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use spend_engine::cube::{AggregateQuery, Cut};
use spend_engine::worker::{self, Job, WorkQueue, Worker};
use spend_engine::{Config, DatasetRegistry, LoadMode, Viewer};

#[derive(Parser)]
#[command(name = "spend-engine", version, about = "Spending dataset registry and cube engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Register a dataset from a JSON manifest
    Create { manifest: PathBuf },
    /// Load a CSV source into a dataset's fact table
    Load {
        dataset: String,
        source: PathBuf,
        /// Keep existing rows instead of replacing them
        #[arg(long)]
        append: bool,
    },
    /// Assign a dimensional model from a JSON file
    Model { dataset: String, model: PathBuf },
    /// List datasets visible to the caller
    List {
        #[arg(long)]
        account: Option<Uuid>,
        #[arg(long)]
        admin: bool,
    },
    /// Print the full metadata document of a dataset
    Show { dataset: String },
    /// Aggregate a dataset's cube
    Query {
        dataset: String,
        #[arg(long = "aggregate")]
        aggregates: Vec<String>,
        /// Filter as ref:value
        #[arg(long = "cut")]
        cuts: Vec<String>,
        #[arg(long = "drilldown")]
        drilldowns: Vec<String>,
        #[arg(long, default_value_t = 1)]
        page: usize,
        #[arg(long)]
        pagesize: Option<usize>,
    },
    /// Distinct members of a dimension or one of its attributes
    Members {
        dataset: String,
        /// `dimension` or `dimension.attribute`
        reference: String,
        #[arg(long = "cut")]
        cuts: Vec<String>,
    },
    /// Delete a dataset and its fact table
    Delete { dataset: String },
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn read_json(path: &Path) -> anyhow::Result<serde_json::Value> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Invalid JSON in {}", path.display()))
}

fn parse_cuts(cuts: &[String]) -> anyhow::Result<Vec<Cut>> {
    let cuts = cuts
        .iter()
        .map(|c| Cut::parse(c))
        .collect::<spend_engine::Result<Vec<_>>>()?;
    Ok(cuts)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "spend_engine=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    info!("Configuration loaded:");
    info!("  Warehouse: {}", config.warehouse_url);
    match config.redacted_database_url() {
        Some(url) => info!("  Database URL: {}", url),
        None => warn!("DATABASE_URL not set, the catalog will not outlive this process"),
    }

    let registry = Arc::new(DatasetRegistry::connect(&config).await?);

    match cli.command {
        Command::Create { manifest } => {
            let mut dataset = registry.create(read_json(&manifest)?).await?;
            print_json(&registry.to_dict(&mut dataset).await?)?;
        }
        Command::Load {
            dataset,
            source,
            append,
        } => {
            let package = registry.package();
            let stored = package.ingest_path(&source).await?;

            let (queue, receiver) = worker::channel();
            queue.enqueue(Job::LoadSource {
                dataset: dataset.clone(),
                package: package.id().to_string(),
                filename: stored.filename.clone(),
                mode: if append { LoadMode::Append } else { LoadMode::Replace },
            })?;
            drop(queue);

            let failures = Worker::new(registry.clone()).run(receiver).await;
            anyhow::ensure!(failures == 0, "Loading {} into {} failed", source.display(), dataset);

            let mut dataset = registry.get(&dataset).await?;
            print_json(&registry.to_dict(&mut dataset).await?)?;
        }
        Command::Model { dataset, model } => {
            let mut dataset = registry.get(&dataset).await?;
            let spec = read_json(&model)?;
            registry.validate_model(&dataset, &spec).await?;
            let cardinalities = registry.assign_model(&mut dataset, spec).await?;
            print_json(&cardinalities)?;
        }
        Command::List { account, admin } => {
            let viewer = match (account, admin) {
                (Some(id), true) => Viewer::admin(id),
                (Some(id), false) => Viewer::account(id),
                (None, _) => Viewer::anonymous(),
            };
            let mut views = Vec::new();
            for mut dataset in registry.list_visible(&viewer, true).await? {
                views.push(registry.to_dict(&mut dataset).await?);
            }
            print_json(&views)?;
        }
        Command::Show { dataset } => {
            let mut dataset = registry.get(&dataset).await?;
            print_json(&registry.to_full_dict(&mut dataset).await?)?;
        }
        Command::Query {
            dataset,
            aggregates,
            cuts,
            drilldowns,
            page,
            pagesize,
        } => {
            let mut dataset = registry.get(&dataset).await?;
            let cube = registry
                .cube(&mut dataset)
                .await?
                .with_context(|| format!("Dataset {} has no usable model", dataset.name))?;
            let query = AggregateQuery {
                aggregates,
                cuts: parse_cuts(&cuts)?,
                drilldowns,
                page,
                pagesize,
            };
            print_json(&cube.query(&query).await?)?;
        }
        Command::Members {
            dataset,
            reference,
            cuts,
        } => {
            let mut dataset = registry.get(&dataset).await?;
            let cube = registry
                .cube(&mut dataset)
                .await?
                .with_context(|| format!("Dataset {} has no usable model", dataset.name))?;
            print_json(&cube.members(&reference, &parse_cuts(&cuts)?).await?)?;
        }
        Command::Delete { dataset } => {
            let dataset = registry.get(&dataset).await?;
            let name = dataset.name.clone();
            registry.delete(dataset).await?;
            info!("Deleted {}", name);
        }
    }

    Ok(())
}
