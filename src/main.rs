use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use poi_fusion::config::{self, PipelineConfig};
use poi_fusion::elastic::ElasticClient;
use poi_fusion::index::{IndexRole, IndexWriter, UpsertSummary};
use poi_fusion::memory::MemoryEngine;
use poi_fusion::merge::FeaturesMerger;
use poi_fusion::models::{validate_features, Source};
use poi_fusion::pipeline::{Pipeline, RebuildSummary};
use poi_fusion::report::{CsvReportSink, ReportSink, TracingReportSink};
use poi_fusion::search::SearchEngine;
use poi_fusion::sources::{self, GeoJsonFileGateway, SourceGateway};
use poi_fusion::sync_state::state_path;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};
use tracing::{error, info, Level};
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::FmtSubscriber;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "poi-fusion")]
#[command(about = "Merge points of interest across sources and publish them to Elasticsearch")]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Merge source dumps into one GeoJSON file
    Merge(MergeArgs),
    /// Rebuild the indices from source dumps without downtime
    Rebuild(RebuildArgs),
    /// Upsert features changed since the last sync
    Update(UpdateArgs),
    /// Cache raw source dumps in the external POIs index
    Store(StoreArgs),
    /// Create the first index slots and aliases if missing
    Init(EngineArgs),
    /// Print one indexed feature as GeoJSON
    Get(GetArgs),
    /// Delete one point of interest
    Delete(DeleteArgs),
}

#[derive(Args, Clone)]
struct EngineArgs {
    /// Elasticsearch base URL
    #[arg(long, env = "POI_FUSION_ES_URL", default_value = config::DEFAULT_ES_URL)]
    es_url: String,

    /// Use an in-memory engine instead of Elasticsearch
    #[arg(long)]
    dry_run: bool,
}

#[derive(Args, Clone)]
struct TuningArgs {
    /// Merge distance threshold, in degrees
    #[arg(long, default_value_t = config::DEFAULT_MERGE_THRESHOLD)]
    threshold: f64,

    /// Documents per bulk request
    #[arg(long, default_value_t = config::DEFAULT_PAGE_SIZE)]
    page_size: usize,

    /// Seconds allowed per bulk request
    #[arg(long, default_value_t = config::DEFAULT_BATCH_TIMEOUT_SECS)]
    batch_timeout_secs: u64,

    /// Attempts per bulk request
    #[arg(long, default_value_t = config::BULK_MAX_ATTEMPTS)]
    max_attempts: u32,
}

impl TuningArgs {
    fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            merge_threshold: self.threshold,
            page_size: self.page_size,
            batch_timeout: Duration::from_secs(self.batch_timeout_secs),
            max_attempts: self.max_attempts,
            ..Default::default()
        }
    }
}

#[derive(Args)]
struct MergeArgs {
    /// Source dump as SOURCE=PATH, e.g. osm=pois.geojson (repeatable)
    #[arg(short, long, required = true)]
    input: Vec<String>,

    /// Merged GeoJSON output file
    #[arg(short, long)]
    output: PathBuf,

    /// CSV file receiving one row per merge decision
    #[arg(long)]
    report: Option<PathBuf>,

    #[arg(long, default_value_t = config::DEFAULT_MERGE_THRESHOLD)]
    threshold: f64,
}

#[derive(Args)]
struct RebuildArgs {
    /// Source dump as SOURCE=PATH (repeatable)
    #[arg(short, long, required = true)]
    input: Vec<String>,

    /// Highways GeoJSON, rebuilt into the highways index
    #[arg(long)]
    highways: Option<PathBuf>,

    /// Directory holding the sync state
    #[arg(long, default_value = ".")]
    state_dir: PathBuf,

    #[arg(long)]
    report: Option<PathBuf>,

    /// Show bulk write progress
    #[arg(long)]
    progress: bool,

    #[command(flatten)]
    tuning: TuningArgs,

    #[command(flatten)]
    engine: EngineArgs,
}

#[derive(Args)]
struct UpdateArgs {
    /// Source dump as SOURCE=PATH (repeatable)
    #[arg(short, long, required = true)]
    input: Vec<String>,

    #[arg(long, default_value = ".")]
    state_dir: PathBuf,

    #[arg(long)]
    report: Option<PathBuf>,

    #[command(flatten)]
    tuning: TuningArgs,

    #[command(flatten)]
    engine: EngineArgs,
}

#[derive(Args)]
struct StoreArgs {
    /// Source dump as SOURCE=PATH (repeatable)
    #[arg(short, long, required = true)]
    input: Vec<String>,

    /// Keep features already cached for the same sources
    #[arg(long)]
    append: bool,

    #[command(flatten)]
    tuning: TuningArgs,

    #[command(flatten)]
    engine: EngineArgs,
}

#[derive(Args)]
struct GetArgs {
    id: String,

    /// Look in the highways index
    #[arg(long, conflicts_with = "external")]
    highways: bool,

    /// Look in the external POIs index
    #[arg(long)]
    external: bool,

    #[command(flatten)]
    engine: EngineArgs,
}

#[derive(Args)]
struct DeleteArgs {
    id: String,

    /// Mark as deleted instead of removing the document
    #[arg(long)]
    soft: bool,

    #[command(flatten)]
    engine: EngineArgs,
}

impl Commands {
    fn engine_args(&self) -> Option<&EngineArgs> {
        match self {
            Commands::Merge(_) => None,
            Commands::Rebuild(args) => Some(&args.engine),
            Commands::Update(args) => Some(&args.engine),
            Commands::Store(args) => Some(&args.engine),
            Commands::Init(args) => Some(args),
            Commands::Get(args) => Some(&args.engine),
            Commands::Delete(args) => Some(&args.engine),
        }
    }
}

enum Report {
    Csv(CsvReportSink),
    Tracing(TracingReportSink),
}

impl Report {
    fn open(path: Option<&PathBuf>) -> Result<Self> {
        match path {
            Some(path) => Ok(Report::Csv(CsvReportSink::create(path)?)),
            None => Ok(Report::Tracing(TracingReportSink)),
        }
    }

    fn sink(&self) -> &dyn ReportSink {
        match self {
            Report::Csv(sink) => sink,
            Report::Tracing(sink) => sink,
        }
    }

    fn finish(&self) -> Result<()> {
        match self {
            Report::Csv(sink) => sink.flush(),
            Report::Tracing(_) => Ok(()),
        }
    }
}

fn gateways(inputs: &[String]) -> Result<Vec<Box<dyn SourceGateway>>> {
    inputs
        .iter()
        .map(|arg| Ok(Box::new(GeoJsonFileGateway::from_arg(arg)?) as Box<dyn SourceGateway>))
        .collect()
}

async fn run_merge(args: MergeArgs) -> Result<()> {
    let start = Instant::now();
    let features = sources::fetch_all(&gateways(&args.input)?).await?;
    validate_features(&features).context("Source data failed validation")?;

    let report = Report::open(args.report.as_ref())?;
    let (merged, stats) = FeaturesMerger::new(args.threshold, report.sink()).merge_with_stats(features);
    report.finish()?;
    sources::write_feature_collection(&args.output, &merged)?;

    println!();
    println!("=== Summary ===");
    println!("Merge time:         {:.2}s", start.elapsed().as_secs_f64());
    println!("Input features:     {}", stats.input);
    println!("Wikipedia joined:   {}", stats.wikipedia_merged);
    println!("Off-road joined:    {}", stats.offroad_merged);
    println!("Merged by title:    {}", stats.title_merged);
    println!("Simplified:         {}", stats.simplified);
    println!("Output features:    {}", stats.output);
    Ok(())
}

fn print_upsert(label: &str, summary: &UpsertSummary) {
    println!("{label:<20}{} written, {} failed", summary.written, summary.failures.len());
    for failure in &summary.failures {
        println!("    {} ({}): {}", failure.id, failure.status, failure.reason);
    }
}

fn print_rebuild(summary: &RebuildSummary) {
    println!();
    println!("=== Summary ===");
    println!("Input features:     {}", summary.merge.input);
    println!("Merged away:        {}", summary.merge.total_merged());
    print_upsert("Points of interest:", &summary.pois);
    if let Some(highways) = &summary.highways {
        print_upsert("Highways:", highways);
    }
}

async fn execute<E: SearchEngine>(engine: E, command: Commands, dry_run: bool) -> Result<()> {
    match command {
        Commands::Merge(args) => run_merge(args).await,
        Commands::Rebuild(args) => {
            let config = args.tuning.pipeline_config();
            let writer = IndexWriter::new(engine, &config).with_progress(args.progress);
            let report = Report::open(args.report.as_ref())?;
            let pipeline = Pipeline::new(&writer, &config, report.sink());

            let gateways = gateways(&args.input)?;
            let highways = args
                .highways
                .map(|path| GeoJsonFileGateway::new(Source::Osm, path));
            let summary = if dry_run {
                let features = sources::fetch_all(&gateways).await?;
                let highways = match &highways {
                    Some(gateway) => Some(gateway.get_all().await?),
                    None => None,
                };
                pipeline.rebuild_indices(features, highways, Utc::now()).await?
            } else {
                let highways = highways.as_ref().map(|g| g as &dyn SourceGateway);
                pipeline
                    .sync_rebuild(&gateways, highways, &state_path(&args.state_dir))
                    .await?
            };
            report.finish()?;
            print_rebuild(&summary);
            println!("Bulk batches:       {}", writer.stats().batches());
            println!("Bulk retries:       {}", writer.stats().retries());
            Ok(())
        }
        Commands::Update(args) => {
            let config = args.tuning.pipeline_config();
            let writer = IndexWriter::new(engine, &config);
            let report = Report::open(args.report.as_ref())?;
            let pipeline = Pipeline::new(&writer, &config, report.sink());
            let gateways = gateways(&args.input)?;
            let state = state_path(&args.state_dir);
            let summary = if dry_run {
                writer.initialize().await?;
                pipeline.preview_update(&gateways, &state).await?
            } else {
                pipeline.sync_update(&gateways, &state).await?
            };
            report.finish()?;
            print_upsert("Points of interest:", &summary);
            Ok(())
        }
        Commands::Store(args) => {
            let config = args.tuning.pipeline_config();
            let writer = IndexWriter::new(engine, &config);
            if dry_run {
                writer.initialize().await?;
            }
            for gateway in gateways(&args.input)? {
                let source = gateway.source();
                let features = gateway
                    .get_all()
                    .await
                    .with_context(|| format!("Failed to read {source} features"))?;
                validate_features(&features).context("Source data failed validation")?;
                if !args.append {
                    writer.delete_external_pois_by_source(&source).await?;
                }
                let summary = writer.add_external_pois(&features).await?;
                print_upsert(&format!("{source}:"), &summary);
            }
            Ok(())
        }
        Commands::Init(_) => {
            let writer = IndexWriter::new(engine, &PipelineConfig::default());
            writer.initialize().await?;
            for role in IndexRole::ALL {
                let live = writer.current_index(role).await?;
                println!(
                    "{role}: {}",
                    live.map(|h| h.name).unwrap_or_else(|| "-".to_string())
                );
            }
            Ok(())
        }
        Commands::Get(args) => {
            let writer = IndexWriter::new(engine, &PipelineConfig::default());
            if dry_run {
                writer.initialize().await?;
            }
            let role = if args.highways {
                IndexRole::Highways
            } else if args.external {
                IndexRole::ExternalPois
            } else {
                IndexRole::PointsOfInterest
            };
            let Some(feature) = writer.get_by_id(role, &args.id).await? else {
                bail!("{} not found in {role}", args.id);
            };
            println!("{}", serde_json::to_string_pretty(&feature.to_document()?)?);
            Ok(())
        }
        Commands::Delete(args) => {
            let writer = IndexWriter::new(engine, &PipelineConfig::default());
            if dry_run {
                writer.initialize().await?;
            }
            let removed = if args.soft {
                writer.mark_deleted(&args.id, Utc::now()).await?
            } else {
                writer
                    .delete_by_id(IndexRole::PointsOfInterest, &args.id)
                    .await?
            };
            if !removed {
                bail!("{} not found", args.id);
            }
            info!(id = %args.id, soft = args.soft, "Deleted");
            Ok(())
        }
    }
}

async fn run(command: Commands) -> Result<()> {
    let command = match command {
        Commands::Merge(args) => return run_merge(args).await,
        other => other,
    };
    let Some(engine_args) = command.engine_args().cloned() else {
        bail!("Command needs an engine");
    };
    if engine_args.dry_run {
        info!("Dry run, using the in-memory engine");
        execute(MemoryEngine::new(), command, true).await
    } else {
        let client = ElasticClient::new(&engine_args.es_url)
            .with_context(|| format!("Invalid Elasticsearch URL: {}", engine_args.es_url))?;
        execute(client, command, false).await
    }
}

/// Verbosity for everything, and merge decisions always at INFO.
fn default_directives(level: Level) -> String {
    format!("{},merge_report=info", LevelFilter::from_level(level))
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    // RUST_LOG wins, e.g. RUST_LOG=merge_report=info to get only the merge report
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directives(level)))
        .unwrap_or_else(|_| EnvFilter::default().add_directive(LevelFilter::from_level(level).into()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {e}");
        return ExitCode::FAILURE;
    }

    let result = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .thread_name("poi-fusion-worker")
        .enable_io()
        .enable_time()
        .build()
        .context("Failed to start runtime")
        .and_then(|rt| rt.block_on(run(cli.command)));

    match result {
        Ok(()) => {
            info!("Completed successfully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Error: {:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
