use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

mod analytics;
mod config;
mod db;
mod error;
mod export;
mod extract;
mod models;
mod report;
mod store;
mod units;

use analytics::{Aggregator, AnalyticsSettings};
use config::Config;
use db::PgStore;
use export::ExportKind;
use extract::{project_for_display, RecordFilter};
use models::{AggregatedStats, Fields, Record};
use store::{MemoryStore, RecordStore};
use units::{Section, Unit};

#[derive(Parser)]
#[command(name = "division-records")]
#[command(about = "Records, analytics and exports for the veterinary division", long_about = None)]
struct Cli {
    /// Run against an in-memory store loaded with the seed records
    #[arg(long, global = true)]
    demo: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct FilterArgs {
    /// Only records whose month key is YYYY-MM
    #[arg(long)]
    month: Option<String>,
    /// Only records resolved to this province
    #[arg(long)]
    province: Option<String>,
    /// Case-insensitive text search over every displayed field
    #[arg(long)]
    search: Option<String>,
}

impl From<FilterArgs> for RecordFilter {
    fn from(args: FilterArgs) -> Self {
        RecordFilter {
            month: args.month,
            province: args.province,
            search: args.search,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Xlsx,
    Doc,
    Print,
}

impl From<Format> for ExportKind {
    fn from(format: Format) -> Self {
        match format {
            Format::Xlsx => ExportKind::Spreadsheet,
            Format::Doc => ExportKind::Word,
            Format::Print => ExportKind::Print,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load realistic seed data
    Seed,
    /// Import records for a unit from a CSV file
    Import {
        #[arg(long)]
        unit: String,
        #[arg(long)]
        csv: PathBuf,
    },
    /// List units by section
    Units {
        /// Include disabled units
        #[arg(long)]
        all: bool,
    },
    /// Hide a unit from data entry
    Disable {
        #[arg(long)]
        unit: String,
    },
    /// Make a disabled unit visible again
    Enable {
        #[arg(long)]
        unit: String,
    },
    /// Create a record from key=value fields
    Add {
        #[arg(long)]
        unit: String,
        #[arg(long = "field", value_name = "KEY=VALUE", required = true)]
        fields: Vec<String>,
    },
    /// Merge key=value fields into an existing record
    Update {
        #[arg(long)]
        unit: String,
        #[arg(long)]
        id: Uuid,
        #[arg(long = "field", value_name = "KEY=VALUE", required = true)]
        fields: Vec<String>,
    },
    /// Delete a record
    Delete {
        #[arg(long)]
        unit: String,
        #[arg(long)]
        id: Uuid,
    },
    /// Browse a unit's records
    Records {
        #[arg(long)]
        unit: String,
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Compute analytics over every unit
    Stats {
        /// Print the raw statistics as JSON
        #[arg(long)]
        json: bool,
    },
    /// Generate a markdown report
    Report {
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
    /// Export a unit's filtered records
    Export {
        #[arg(long)]
        unit: String,
        #[arg(long, value_enum, default_value_t = Format::Xlsx)]
        format: Format,
        #[command(flatten)]
        filter: FilterArgs,
        /// Directory for the generated file (defaults to RECORDS_EXPORT_DIR)
        #[arg(long)]
        out_dir: Option<PathBuf>,
        /// Open a print page in the default browser
        #[arg(long)]
        open: bool,
    },
    /// Keep analytics fresh and print each new snapshot
    Watch,
}

fn lookup_unit(id: &str) -> anyhow::Result<Unit> {
    units::find(id).with_context(|| format!("unknown unit '{id}' (see `division-records units`)"))
}

fn parse_fields(pairs: &[String]) -> anyhow::Result<Fields> {
    let mut fields = Fields::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("field '{pair}' is not KEY=VALUE"))?;
        let key = key.trim();
        if key.is_empty() {
            bail!("field '{pair}' has an empty key");
        }
        // Numbers and JSON literals keep their type; everything else is text.
        let value = serde_json::from_str::<Value>(value.trim())
            .ok()
            .filter(|parsed| !parsed.is_string())
            .unwrap_or_else(|| Value::String(value.to_string()));
        fields.insert(key.to_string(), value);
    }
    Ok(fields)
}

fn print_summary(stats: &AggregatedStats) {
    println!("{} records across {} units.", stats.total, stats.by_unit.len());
    for (id, unit) in report::rank_units(stats) {
        match stats.unit_ratings.get(id) {
            Some(ratings) => println!(
                "- {}: {} records, satisfaction {:.2} ({} rated)",
                unit.label, unit.count, ratings.overall_avg, ratings.rated_count
            ),
            None => println!("- {}: {} records", unit.label, unit.count),
        }
    }
}

async fn connect(config: &Config) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(config.database_url()?)
        .await
        .context("failed to connect to Postgres")
}

async fn demo_store() -> MemoryStore {
    let store = MemoryStore::new();
    for (_, collection, fields) in db::seed_documents() {
        let record = Record::new(fields.as_object().cloned().unwrap_or_default());
        store.insert(collection, record).await;
    }
    store
}

fn require_pool(pool: &Option<PgPool>) -> anyhow::Result<&PgPool> {
    pool.as_ref()
        .context("this command writes to Postgres and cannot run with --demo")
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    info!("Received Ctrl+C, shutting down");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;
    let (store, pool) = if cli.demo {
        info!("using in-memory demo store");
        let store: Arc<dyn RecordStore> = Arc::new(demo_store().await);
        (store, None)
    } else {
        let pool = connect(&config).await?;
        let store: Arc<dyn RecordStore> = Arc::new(PgStore::new(pool.clone()));
        (store, Some(pool))
    };

    let settings = AnalyticsSettings {
        max_docs_per_collection: config.max_docs_per_collection,
        debounce: config.debounce,
    };

    match cli.command {
        Commands::InitDb => {
            db::init_db(require_pool(&pool)?).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            let inserted = db::seed(require_pool(&pool)?).await?;
            println!("Inserted {inserted} seed records.");
        }
        Commands::Import { unit, csv } => {
            let unit = lookup_unit(&unit)?;
            let inserted = db::import_csv(require_pool(&pool)?, unit.id, &csv).await?;
            println!("Inserted {inserted} {} records from {}.", unit.label, csv.display());
        }
        Commands::Units { all } => {
            let disabled = store.disabled_units().await?;
            for section in Section::ALL {
                println!("{}:", section.label());
                let listed: Vec<Unit> = if all {
                    units::UNITS
                        .iter()
                        .filter(|unit| unit.section == Some(section))
                        .copied()
                        .collect()
                } else {
                    units::visible_units(section, &disabled)
                };
                for unit in listed {
                    let marker = if disabled.contains(unit.id) { " (disabled)" } else { "" };
                    println!("- {} `{}`{marker}", unit.label, unit.id);
                }
            }
        }
        Commands::Disable { unit } => {
            let unit = lookup_unit(&unit)?;
            let mut disabled = store.disabled_units().await?;
            disabled.insert(unit.id.to_string());
            store.set_disabled_units(&disabled).await?;
            println!("{} disabled.", unit.label);
        }
        Commands::Enable { unit } => {
            let unit = lookup_unit(&unit)?;
            let mut disabled = store.disabled_units().await?;
            disabled.remove(unit.id);
            store.set_disabled_units(&disabled).await?;
            println!("{} enabled.", unit.label);
        }
        Commands::Add { unit, fields } => {
            let unit = lookup_unit(&unit)?;
            let fields = parse_fields(&fields)?;
            let id = store
                .create(unit.id, fields)
                .await
                .with_context(|| format!("could not save {} record", unit.label))?;
            println!("Created {} record {id}.", unit.label);
        }
        Commands::Update { unit, id, fields } => {
            let unit = lookup_unit(&unit)?;
            let fields = parse_fields(&fields)?;
            store
                .update(unit.id, id, fields)
                .await
                .with_context(|| format!("could not update {} record {id}", unit.label))?;
            println!("Updated {} record {id}.", unit.label);
        }
        Commands::Delete { unit, id } => {
            let unit = lookup_unit(&unit)?;
            store
                .delete(unit.id, id)
                .await
                .with_context(|| format!("could not delete {} record {id}", unit.label))?;
            println!("Deleted {} record {id}.", unit.label);
        }
        Commands::Records { unit, filter } => {
            let unit = lookup_unit(&unit)?;
            let records = store.fetch_all(unit.id).await?;
            let filter = RecordFilter::from(filter);
            let matched = filter.apply(&records);

            if matched.is_empty() {
                println!("No {} records match.", unit.label);
                return Ok(());
            }

            println!("{} of {} {} records:", matched.len(), records.len(), unit.label);
            for record in matched {
                let row = project_for_display(record);
                let summary: Vec<String> = unit
                    .field_order
                    .iter()
                    .filter_map(|key| {
                        row.get(*key)
                            .filter(|cell| !cell.is_empty())
                            .map(|cell| format!("{key}={cell}"))
                    })
                    .collect();
                println!("- {} {}", record.id, summary.join(" | "));
            }
        }
        Commands::Stats { json } => {
            let aggregator = Aggregator::new(store, settings);
            let stats = aggregator.refresh().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&*stats)?);
            } else {
                print_summary(&stats);
            }
        }
        Commands::Report { out } => {
            let aggregator = Aggregator::new(store, settings);
            let stats = aggregator.refresh().await?;
            let report = report::build_report(&stats, chrono::Local::now());
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
        Commands::Export {
            unit,
            format,
            filter,
            out_dir,
            open,
        } => {
            let unit = lookup_unit(&unit)?;
            let records = store.fetch_all(unit.id).await?;
            let filter = RecordFilter::from(filter);
            let matched = filter.apply(&records);
            let dir = out_dir.unwrap_or_else(|| config.export_dir.clone());
            let kind = ExportKind::from(format);
            if !filter.is_empty() {
                info!(matched = matched.len(), of = records.len(), "filter applied");
            }

            let path = export::export(kind, &unit, &matched, &dir, chrono::Local::now())
                .context("export failed")?;
            println!("Exported {} records to {}.", matched.len(), path.display());

            if open && kind == ExportKind::Print {
                export::open_preview(&path).context("could not open print preview")?;
            }
        }
        Commands::Watch => {
            let aggregator = Arc::new(Aggregator::new(store, settings));
            let mut snapshots = aggregator.snapshots();

            let watcher = aggregator.start().await?;
            let running = tokio::spawn(watcher.run(shutdown_signal()));

            let printer = tokio::spawn(async move {
                while snapshots.changed().await.is_ok() {
                    let latest = snapshots.borrow_and_update().clone();
                    if let Some(stats) = latest {
                        print_summary(&stats);
                    }
                }
            });

            running.await?;
            printer.abort();
            if let Some(stats) = aggregator.latest() {
                info!(total = stats.total, "last published snapshot");
            }
        }
    }

    Ok(())
}
