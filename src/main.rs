//! WolfShard - Cluster Coordination and Online Migration for Sharded MySQL
//!
//! Runs a compute node, migration jobs, and admin commands against a
//! running node's HTTP API.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfshard::api::HttpServer;
use wolfshard::cluster::{
    ClusterEventDispatcher, ComputeNodeInstance, ComputeNodeRegistrar, ContextManager, HandlerRegistry,
    InstanceMetaData,
};
use wolfshard::config::{DatabaseConfig, LoggingConfig, WolfShardConfig};
use wolfshard::error::{Error, Result};
use wolfshard::pipeline::{
    require_tables, ConsistencyChecker, InventoryTaskSplitter, JobItemContext, JobItemProgress, JobSettings,
    MigrationJob, MySqlDataSource, MySqlIncrementalDumper, MySqlSink,
};
use wolfshard::repository::open_repository;

/// WolfShard - Cluster Coordination and Online Migration for Sharded MySQL
#[derive(Parser)]
#[command(name = "wolfshard")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfshard.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides [logging]
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the compute node
    Start,

    /// Run one migration job item on this node
    Migrate {
        /// Job identifier
        #[arg(long)]
        job_id: String,

        /// Sharding item of the job
        #[arg(long, default_value_t = 0)]
        item: usize,
    },

    /// Print the inventory units a migration job item would run
    Split {
        /// Job identifier (saved progress is reused)
        #[arg(long)]
        job_id: String,

        #[arg(long, default_value_t = 0)]
        item: usize,
    },

    /// Show cluster status from a running node
    Status {
        /// Node API address
        #[arg(short, long, default_value = "localhost:8090")]
        address: String,
    },

    /// List running processes across the cluster
    Processes {
        #[arg(short, long, default_value = "localhost:8090")]
        address: String,
    },

    /// Kill a process wherever it runs
    Kill {
        /// Process id, e.g. `<job_id>_<item>`
        process_id: String,

        #[arg(short, long, default_value = "localhost:8090")]
        address: String,
    },

    /// Compare a migrated job's source tables with the target
    Check {
        #[arg(long)]
        job_id: String,

        /// Rows compared per page (defaults to pipeline.batch_size)
        #[arg(long)]
        batch_size: Option<usize>,
    },

    /// Show the saved progress of a migration job item
    Progress {
        #[arg(long)]
        job_id: String,

        #[arg(long, default_value_t = 0)]
        item: usize,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfshard.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value = "node-1")]
        node_id: String,
    },

    /// Validate configuration file
    Validate,

    /// Show node information
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logging settings come from the config file when it is readable
    let logging = WolfShardConfig::from_file(&cli.config)
        .map(|config| config.logging)
        .unwrap_or_default();
    let level = cli.log_level.clone().unwrap_or_else(|| logging.level.clone());
    init_logging(&level, &logging);

    match cli.command {
        Commands::Start => run_start(&cli.config).await,
        Commands::Migrate { job_id, item } => run_migrate(&cli.config, job_id, item).await,
        Commands::Split { job_id, item } => run_split(&cli.config, job_id, item).await,
        Commands::Status { address } => run_get(&format!("http://{}/cluster", address)).await,
        Commands::Processes { address } => {
            run_get(&format!("http://{}/processes?cluster=true", address)).await
        }
        Commands::Kill { process_id, address } => run_kill(address, process_id).await,
        Commands::Check { job_id, batch_size } => run_check(&cli.config, job_id, batch_size).await,
        Commands::Progress { job_id, item } => run_progress(&cli.config, job_id, item).await,
        Commands::Init { output, node_id } => run_init(output, node_id),
        Commands::Validate => run_validate(&cli.config),
        Commands::Info => run_info(&cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str, logging: &LoggingConfig) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let file = logging.file.as_ref().and_then(|path| {
        match std::fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Some(Mutex::new(file)),
            Err(e) => {
                eprintln!("Cannot open log file {}: {}", path.display(), e);
                None
            }
        }
    });

    let registry = tracing_subscriber::registry().with(env_filter);
    match (logging.format.as_str(), file) {
        ("json", Some(file)) => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(file))
            .init(),
        ("json", None) => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        (_, Some(file)) => registry
            .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(file))
            .init(),
        (_, None) => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

fn load_config(config_path: &Path) -> Result<WolfShardConfig> {
    match WolfShardConfig::from_file(config_path) {
        Ok(config) => Ok(config),
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            tracing::error!("Please check that the config file exists and is valid TOML");
            Err(e)
        }
    }
}

/// Open the repository and load this node's view of the cluster
async fn build_context(config: &WolfShardConfig) -> Result<Arc<ContextManager>> {
    std::fs::create_dir_all(config.data_dir())?;
    let repository = open_repository(&config.repository, config.data_dir())?;

    let mut metadata = InstanceMetaData::new(config.node.id.clone(), config.node.instance_type);
    metadata.address = config.node.advertise_address.clone();
    let mut local = ComputeNodeInstance::new(metadata);
    local.labels = config.node.labels.clone();

    let context = Arc::new(
        ContextManager::new(repository, local)
            .with_process_operation_timeout(config.process_operation_timeout()),
    );
    context.load().await?;
    Ok(context)
}

/// A compute node that is online and handling cluster events
struct RunningNode {
    context: Arc<ContextManager>,
    registrar: ComputeNodeRegistrar,
    dispatcher: ClusterEventDispatcher,
}

impl RunningNode {
    async fn online(config: &WolfShardConfig) -> Result<Self> {
        let context = build_context(config).await?;
        let dispatcher = ClusterEventDispatcher::new(
            HandlerRegistry::with_default_handlers()?,
            Arc::clone(&context),
        );
        dispatcher.start();

        let registrar = ComputeNodeRegistrar::new(Arc::clone(&context));
        registrar.online().await?;
        Ok(Self {
            context,
            registrar,
            dispatcher,
        })
    }

    async fn offline(self) -> Result<()> {
        let result = self.registrar.offline().await;
        self.dispatcher.stop().await;
        self.context.shutdown();
        result
    }
}

/// Start the compute node
async fn run_start(config_path: &Path) -> Result<()> {
    tracing::info!("Starting WolfShard compute node...");
    let config = load_config(config_path)?;
    tracing::info!("Node ID: {} ({})", config.node.id, config.node.instance_type);

    let node = RunningNode::online(&config).await?;
    let summary = node.context.instances().summary().await;
    tracing::info!("Cluster has {} online instance(s)", summary.total_instances);

    let server = HttpServer::new(config.api.clone(), Arc::clone(&node.context));
    let api = tokio::spawn(async move { server.start().await });

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            tracing::info!("Shutdown signal received");
        }
        result = api => match result {
            Ok(Ok(())) => {
                // API disabled; keep serving cluster events until shutdown
                tokio::signal::ctrl_c().await?;
                tracing::info!("Shutdown signal received");
            }
            Ok(Err(e)) => {
                tracing::error!("HTTP API failed: {}", e);
                node.offline().await?;
                return Err(e);
            }
            Err(e) => tracing::error!("HTTP API task ended abnormally: {}", e),
        },
    }

    node.offline().await?;
    tracing::info!("WolfShard node stopped");
    Ok(())
}

fn require_database<'a>(database: &'a Option<DatabaseConfig>, section: &str) -> Result<&'a DatabaseConfig> {
    database
        .as_ref()
        .ok_or_else(|| Error::Config(format!("[{}] database is required for migration", section)))
}

/// Run a migration job item until it finishes, is killed or Ctrl-C
async fn run_migrate(config_path: &Path, job_id: String, item: usize) -> Result<()> {
    let config = load_config(config_path)?;
    require_tables(&config.pipeline.tables)?;
    let source_config = require_database(&config.source, "source")?;
    let source = Arc::new(MySqlDataSource::connect(source_config).await?);
    let sink = Arc::new(MySqlSink::connect(require_database(&config.target, "target")?).await?);

    let (dump_workers, import_workers) = config.worker_counts();
    tracing::info!("Using {} dump and {} import worker(s)", dump_workers, import_workers);

    let node = RunningNode::online(&config).await?;
    let mut job = MigrationJob::new(
        job_id,
        item,
        config.pipeline.tables.clone(),
        source.clone(),
        sink,
        Arc::clone(node.context.repository()),
    )
    .with_settings(JobSettings::from_config(&config.pipeline, dump_workers, import_workers))
    .with_context(Arc::clone(&node.context));
    if config.pipeline.incremental.enabled {
        tracing::info!(
            "Binlog change capture enabled as server_id {}",
            config.pipeline.incremental.server_id
        );
        job = job.with_incremental(Arc::new(MySqlIncrementalDumper::new(
            source_config.clone(),
            config.pipeline.incremental.server_id,
            source,
            config.pipeline.tables.clone(),
        )));
    }

    // The job is listed and killed through this node's API
    let server = HttpServer::new(config.api.clone(), Arc::clone(&node.context));
    let api = tokio::spawn(async move {
        if let Err(e) = server.start().await {
            tracing::warn!("HTTP API unavailable while migrating: {}", e);
        }
    });

    let cancel = CancellationToken::new();
    let signal = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutdown signal received, stopping job");
                cancel.cancel();
            }
        })
    };

    let result = job.run(cancel).await;
    signal.abort();
    api.abort();
    node.offline().await?;

    let status = result?;
    println!("Job {} finished with status {}", job.process_id(), status);
    Ok(())
}

/// Print the inventory units of a job item without running them
async fn run_split(config_path: &Path, job_id: String, item: usize) -> Result<()> {
    let config = load_config(config_path)?;
    require_tables(&config.pipeline.tables)?;
    let source = Arc::new(MySqlDataSource::connect(require_database(&config.source, "source")?).await?);
    let repository = open_repository(&config.repository, config.data_dir())?;

    let mut job_item = JobItemContext::new(job_id.clone(), item, config.pipeline.tables.clone(), source);
    job_item.batch_size = config.pipeline.batch_size;
    job_item.init_progress = JobItemProgress::load(repository.as_ref(), &job_id, item).await?;

    let contexts = InventoryTaskSplitter::new(config.pipeline.shard_size)
        .split_inventory_dumper_contexts(&job_item)
        .await?;

    println!("{} inventory unit(s), ~{} rows", contexts.len(), job_item.estimated_records());
    for context in &contexts {
        println!("  {:<40} {}", context.task_id(), context.position);
    }
    Ok(())
}

/// Run a consistency check of a job and save the result next to its progress
async fn run_check(config_path: &Path, job_id: String, batch_size: Option<usize>) -> Result<()> {
    let config = load_config(config_path)?;
    require_tables(&config.pipeline.tables)?;
    let source = Arc::new(MySqlDataSource::connect(require_database(&config.source, "source")?).await?);
    let target = Arc::new(MySqlDataSource::connect(require_database(&config.target, "target")?).await?);
    let repository = open_repository(&config.repository, config.data_dir())?;

    let checker = ConsistencyChecker::new(job_id.clone(), config.pipeline.tables.clone(), source, target)
        .with_batch_size(batch_size.unwrap_or(config.pipeline.batch_size));

    let cancel = CancellationToken::new();
    let signal = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };
    let result = checker.check(&cancel).await;
    signal.abort();
    let report = result?;
    report.persist(repository.as_ref()).await?;

    println!("Consistency check of job {}", job_id);
    for table in &report.tables {
        let verdict = if table.is_matched() { "OK" } else { "MISMATCH" };
        println!(
            "  {:<30} {:<9} {:>10} / {:<10} rows  {}",
            table.table,
            table.method.to_string(),
            table.source_records,
            table.target_records,
            verdict
        );
        if let Some(range) = &table.mismatch {
            println!("  {:<30} first differing key range {}", "", range);
        }
    }

    if report.is_consistent() {
        Ok(())
    } else {
        Err(Error::Pipeline(format!(
            "Job {} is inconsistent: {}",
            job_id,
            report.mismatched_tables().join(", ")
        )))
    }
}

/// Show saved progress straight from the repository
async fn run_progress(config_path: &Path, job_id: String, item: usize) -> Result<()> {
    let config = load_config(config_path)?;
    let repository = open_repository(&config.repository, config.data_dir())?;
    match JobItemProgress::load(repository.as_ref(), &job_id, item).await? {
        Some(progress) => {
            println!("Job {} item {}: {}", job_id, item, progress.status);
            println!("  Inventory: {}% finished", progress.inventory_finished_percentage());
            for (task_id, position) in &progress.inventory {
                println!("  {:<40} {}", task_id, position);
            }
            for (data_source, position) in &progress.incremental {
                println!("  {:<40} {}", format!("{}.incremental", data_source), position);
            }
            Ok(())
        }
        None => Err(Error::JobNotFound(format!("{}/{}", job_id, item))),
    }
}

/// GET an admin endpoint and print the JSON body
async fn run_get(url: &str) -> Result<()> {
    match reqwest::get(url).await {
        Ok(response) => {
            let body: serde_json::Value = response
                .json()
                .await
                .map_err(|e| Error::Network(e.to_string()))?;
            println!("{}", serde_json::to_string_pretty(&body)?);
            Ok(())
        }
        Err(e) => {
            eprintln!("Failed to query {}: {}", url, e);
            Err(Error::Network(e.to_string()))
        }
    }
}

/// Ask a running node to kill a process cluster-wide
async fn run_kill(address: String, process_id: String) -> Result<()> {
    let url = format!("http://{}/processes/{}", address, process_id);
    let response = reqwest::Client::new()
        .delete(&url)
        .send()
        .await
        .map_err(|e| Error::Network(e.to_string()))?;

    if response.status().is_success() {
        println!("Process {} killed", process_id);
        return Ok(());
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    eprintln!("Kill of {} failed ({}): {}", process_id, status, body);
    Err(Error::Network(format!("kill returned {}", status)))
}

/// Initialize configuration file
fn run_init(output: PathBuf, node_id: String) -> Result<()> {
    let config_content = format!(r#"# WolfShard Configuration
# Generated configuration file

[node]
id = "{node_id}"
instance_type = "proxy"
data_dir = "/var/lib/wolfshard/{node_id}"
labels = []
# advertise_address = "my-public-ip:8090"

[repository]
type = "file"
# type = "registry"
# path = "/var/lib/wolfshard/registry.db"
# poll_interval_ms = 200

[source]
name = "ds_0"
host = "localhost"
port = 3306
user = "wolfshard"
password = "changeme"
database = "sharding_db"
pool_size = 10
connect_timeout_secs = 30

[target]
name = "ds_target"
host = "localhost"
port = 3306
user = "wolfshard"
password = "changeme"
database = "sharding_db_new"

[pipeline]
batch_size = 1000
shard_size = 1000000
channel_capacity = 16
dump_workers = 0
import_workers = 0
importer_timeout_ms = 3000
rate_limit_rows_per_sec = 0
persist_interval_secs = 60
process_operation_timeout_ms = 5000

[[pipeline.tables]]
actual = "t_order_0"
logical = "t_order"

[pipeline.incremental]
enabled = false
server_id = 1001

[api]
enabled = true
bind_address = "0.0.0.0:8090"
cors_enabled = false

[logging]
level = "info"
format = "pretty"
# file = "/var/log/wolfshard/wolfshard.log"
"#);

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to configure your data sources and tables.");
    println!("Then start with: wolfshard start --config {}", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: &Path) -> Result<()> {
    match WolfShardConfig::from_file(config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node ID: {} ({})", config.node.id, config.node.instance_type);
            println!("  Repository: {:?}", config.repository.repository_type);
            for (section, db) in [("Source", &config.source), ("Target", &config.target)] {
                if let Some(db) = db {
                    println!(
                        "  {}: {} {}@{}:{}/{}",
                        section,
                        db.name,
                        db.user,
                        db.host,
                        db.port,
                        db.database.as_deref().unwrap_or("(none)")
                    );
                }
            }
            println!("  Tables: {}", config.pipeline.tables.len());
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show node information
fn run_info(config_path: &Path) -> Result<()> {
    let config = WolfShardConfig::from_file(config_path)?;
    let tuned = wolfshard::tuning::auto_tune();
    let (dump_workers, import_workers) = config.worker_counts();

    println!("WolfShard Node Information");
    println!("==========================");
    println!();
    println!("Node ID:          {}", config.node.id);
    println!("Instance Type:    {}", config.node.instance_type);
    println!("Labels:           {:?}", config.node.labels);
    println!("Data Directory:   {}", config.data_dir().display());
    println!("API:              {}", config.api.bind_address);
    println!();
    println!("Pipeline Configuration:");
    println!("  Batch Size:     {}", config.pipeline.batch_size);
    println!("  Shard Size:     {}", config.pipeline.shard_size);
    println!("  Dump Workers:   {}", dump_workers);
    println!("  Import Workers: {}", import_workers);
    println!("  Persist Every:  {} s", config.pipeline.persist_interval_secs);
    println!();
    println!("{}", wolfshard::tuning::tuning_summary(&tuned));

    Ok(())
}
