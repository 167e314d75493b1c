//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use reservoir_core::{
    FlowSignal, IngestRequest, IngestSummary, ProgressReporter, ingest_records,
    initialize_match_key,
};
use reservoir_matchkey::{MethodCache, validate_config};
use reservoir_shared::{
    AppConfig, ClusterId, MatchKeyConfig, ReservoirError, SourceId, TenantId, UPDATE_INGEST,
    init_config, load_config, load_config_from,
};
use reservoir_storage::Storage;
use serde::Serialize;
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Reservoir: store records from many sources and cluster them by match keys.
#[derive(Parser)]
#[command(
    name = "reservoir",
    version,
    about = "Store bibliographic records from many sources and cluster them by match keys.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Tenant whose database is used.
    #[arg(long, env = "RESERVOIR_TENANT", default_value = "default", global = true)]
    pub tenant: String,

    /// Database file (defaults to <data_dir>/<tenant>.db).
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Config file (defaults to ~/.reservoir/reservoir.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Ingest a batch of records (JSON lines or concatenated JSON) from one source.
    Ingest {
        /// Source identifier, e.g. a library code.
        #[arg(long)]
        source_id: String,

        /// Source version the records belong to.
        #[arg(long, default_value_t = 1)]
        source_version: i64,

        /// JSONPath giving the local id for records without `localId`.
        #[arg(long)]
        local_id_path: Option<String>,

        /// Maximum records in flight (overrides config).
        #[arg(long)]
        window: Option<usize>,

        /// Input file.
        file: PathBuf,
    },

    /// Match key configuration and clustering.
    #[command(name = "matchkey")]
    MatchKey {
        #[command(subcommand)]
        action: MatchKeyAction,
    },

    /// Read clusters.
    Cluster {
        #[command(subcommand)]
        action: ClusterAction,
    },

    /// Read or remove stored records.
    Record {
        #[command(subcommand)]
        action: RecordAction,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Match key subcommands.
#[derive(Subcommand)]
pub(crate) enum MatchKeyAction {
    /// Create a match key config.
    Add {
        #[command(flatten)]
        spec: MatchKeySpec,
    },
    /// Replace an existing match key config.
    Update {
        #[command(flatten)]
        spec: MatchKeySpec,
    },
    /// List match key configs.
    List,
    /// Show one match key config.
    Show { id: String },
    /// Delete a match key config and all of its clusters.
    Delete { id: String },
    /// Compute clusters for all stored records.
    Init {
        id: String,
        /// Remove the existing clusters of this config first.
        #[arg(long)]
        clean: bool,
    },
    /// Show clustering statistics.
    Stats { id: String },
}

/// Fields of a match key config given on the command line.
#[derive(clap::Args)]
pub(crate) struct MatchKeySpec {
    /// Config identifier, e.g. `isbn`.
    #[arg(long)]
    id: String,

    /// Extraction method.
    #[arg(long, default_value = "jsonpath")]
    method: String,

    /// JSONPath expression for the `jsonpath` method.
    #[arg(long)]
    expr: Option<String>,

    /// Raw method params as JSON (instead of --expr).
    #[arg(long, conflicts_with = "expr")]
    params: Option<String>,

    /// Update strategy: `ingest` or `manual`.
    #[arg(long, default_value = UPDATE_INGEST)]
    update: String,
}

/// Cluster subcommands.
#[derive(Subcommand)]
pub(crate) enum ClusterAction {
    /// Show one cluster with its records and match values.
    Get { id: String },
    /// List clusters changed since a point in time.
    Changed {
        /// Match key config id.
        #[arg(long)]
        match_key: String,

        /// RFC 3339 timestamp or microseconds since the epoch.
        #[arg(long)]
        since: Option<String>,

        /// Continue after this cluster id (with --since set to its datestamp).
        #[arg(long)]
        after: Option<String>,

        /// Page size.
        #[arg(long, default_value_t = 100)]
        limit: u32,
    },
}

/// Record subcommands.
#[derive(Subcommand)]
pub(crate) enum RecordAction {
    /// List stored records.
    List {
        #[arg(long)]
        source_id: Option<String>,
    },
    /// Delete every record of one source.
    DeleteSource { source_id: String },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "reservoir=info",
        1 => "reservoir=debug",
        _ => "reservoir=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    // Logs go to stderr; stdout carries command output.
    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let ctx = Context::new(&cli)?;
    match cli.command {
        Command::Ingest {
            source_id,
            source_version,
            local_id_path,
            window,
            file,
        } => cmd_ingest(&ctx, &source_id, source_version, local_id_path, window, &file).await,
        Command::MatchKey { action } => match action {
            MatchKeyAction::Add { spec } => cmd_matchkey_add(&ctx, spec).await,
            MatchKeyAction::Update { spec } => cmd_matchkey_update(&ctx, spec).await,
            MatchKeyAction::List => cmd_matchkey_list(&ctx).await,
            MatchKeyAction::Show { id } => cmd_matchkey_show(&ctx, &id).await,
            MatchKeyAction::Delete { id } => cmd_matchkey_delete(&ctx, &id).await,
            MatchKeyAction::Init { id, clean } => cmd_matchkey_init(&ctx, &id, clean).await,
            MatchKeyAction::Stats { id } => cmd_matchkey_stats(&ctx, &id).await,
        },
        Command::Cluster { action } => match action {
            ClusterAction::Get { id } => cmd_cluster_get(&ctx, &id).await,
            ClusterAction::Changed {
                match_key,
                since,
                after,
                limit,
            } => {
                cmd_cluster_changed(&ctx, &match_key, since.as_deref(), after.as_deref(), limit)
                    .await
            }
        },
        Command::Record { action } => match action {
            RecordAction::List { source_id } => cmd_record_list(&ctx, source_id.as_deref()).await,
            RecordAction::DeleteSource { source_id } => {
                cmd_record_delete_source(&ctx, &source_id).await
            }
        },
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show(&ctx).await,
        },
    }
}

/// Resolved config, tenant and database location shared by the handlers.
struct Context {
    config: AppConfig,
    tenant: TenantId,
    db_path: PathBuf,
    cache: MethodCache,
}

impl Context {
    fn new(cli: &Cli) -> Result<Self> {
        let config = match &cli.config {
            Some(path) => load_config_from(path)?,
            None => load_config()?,
        };
        let tenant: TenantId = cli.tenant.parse()?;
        let db_path = match &cli.db {
            Some(path) => path.clone(),
            None => config.database_path(&tenant)?,
        };
        Ok(Self {
            config,
            tenant,
            db_path,
            cache: MethodCache::new(),
        })
    }

    /// Open (creating and migrating if needed) for writing.
    async fn open(&self) -> Result<Storage> {
        Ok(Storage::open_with_config(&self.db_path, self.tenant.clone(), &self.config.storage).await?)
    }

    /// Open an existing database for reading.
    async fn open_readonly(&self) -> Result<Storage> {
        if !self.db_path.exists() {
            return Err(eyre!(
                "no database for tenant '{}' at {}",
                self.tenant,
                self.db_path.display()
            ));
        }
        Ok(Storage::open_readonly(&self.db_path, self.tenant.clone()).await?)
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// Ingest
// ---------------------------------------------------------------------------

async fn cmd_ingest(
    ctx: &Context,
    source_id: &str,
    source_version: i64,
    local_id_path: Option<String>,
    window: Option<usize>,
    file: &Path,
) -> Result<()> {
    let source_id: SourceId = source_id.parse()?;
    let mut ingest = ctx.config.ingest.clone();
    if let Some(window) = window {
        if window == 0 {
            return Err(eyre!("--window must be at least 1"));
        }
        ingest.window = window;
    }

    let input = tokio::fs::read(file)
        .await
        .map_err(|e| eyre!("cannot read {}: {e}", file.display()))?;
    let storage = Arc::new(ctx.open().await?);

    info!(
        tenant = %ctx.tenant,
        source_id = %source_id,
        source_version,
        file = %file.display(),
        "ingesting records"
    );

    let request = IngestRequest {
        source_id,
        source_version,
        local_id_path,
    };
    let reporter = CliProgress::new();
    let summary = ingest_records(storage, &ctx.cache, &ingest, request, &input, &reporter).await?;
    print_json(&summary)
}

// ---------------------------------------------------------------------------
// Match keys
// ---------------------------------------------------------------------------

impl MatchKeySpec {
    fn into_config(self) -> Result<MatchKeyConfig> {
        let params = match (self.params, self.expr) {
            (Some(raw), _) => serde_json::from_str(&raw)
                .map_err(|e| eyre!("--params is not valid JSON: {e}"))?,
            (None, Some(expr)) => serde_json::json!({ "expr": expr }),
            (None, None) => serde_json::json!({}),
        };
        let config = MatchKeyConfig {
            id: self.id,
            method: self.method,
            params,
            update: self.update,
        };
        validate_config(&config)?;
        Ok(config)
    }
}

fn missing_match_key(id: &str) -> ReservoirError {
    ReservoirError::NotFound(format!("match key '{id}'"))
}

async fn cmd_matchkey_add(ctx: &Context, spec: MatchKeySpec) -> Result<()> {
    let config = spec.into_config()?;
    let storage = ctx.open().await?;
    storage.insert_match_key_config(&config).await?;
    info!(match_key = %config.id, method = %config.method, "match key created");
    print_json(&config)
}

async fn cmd_matchkey_update(ctx: &Context, spec: MatchKeySpec) -> Result<()> {
    let config = spec.into_config()?;
    let storage = ctx.open().await?;
    if !storage.update_match_key_config(&config).await? {
        return Err(missing_match_key(&config.id).into());
    }
    ctx.cache.purge(&ctx.tenant, &config.id);
    info!(match_key = %config.id, "match key updated");
    print_json(&config)
}

async fn cmd_matchkey_list(ctx: &Context) -> Result<()> {
    let storage = ctx.open_readonly().await?;
    print_json(&storage.list_match_key_configs().await?)
}

async fn cmd_matchkey_show(ctx: &Context, id: &str) -> Result<()> {
    let storage = ctx.open_readonly().await?;
    match storage.get_match_key_config(id).await? {
        Some(config) => print_json(&config),
        None => Err(missing_match_key(id).into()),
    }
}

async fn cmd_matchkey_delete(ctx: &Context, id: &str) -> Result<()> {
    let storage = ctx.open().await?;
    if !storage.delete_match_key_config(id).await? {
        return Err(missing_match_key(id).into());
    }
    ctx.cache.purge(&ctx.tenant, id);
    info!(match_key = id, "match key deleted");
    println!("Deleted match key '{id}'");
    Ok(())
}

async fn cmd_matchkey_init(ctx: &Context, id: &str, clean: bool) -> Result<()> {
    let storage = ctx.open().await?;
    if clean {
        storage.clear_cluster_state(id).await?;
        info!(match_key = id, "cleared cluster state");
    }
    let reporter = CliProgress::new();
    let stats = initialize_match_key(
        &storage,
        &ctx.cache,
        id,
        ctx.config.ingest.match_value_max_length,
        &reporter,
    )
    .await?;
    reporter.spinner.finish_and_clear();
    match stats {
        Some(stats) => print_json(&stats),
        None => Err(missing_match_key(id).into()),
    }
}

async fn cmd_matchkey_stats(ctx: &Context, id: &str) -> Result<()> {
    let storage = ctx.open_readonly().await?;
    if storage.get_match_key_config(id).await?.is_none() {
        return Err(missing_match_key(id).into());
    }
    print_json(&storage.stats_match_key(id).await?)
}

// ---------------------------------------------------------------------------
// Clusters and records
// ---------------------------------------------------------------------------

async fn cmd_cluster_get(ctx: &Context, id: &str) -> Result<()> {
    let cluster_id: ClusterId = id.parse().map_err(|e| eyre!("invalid cluster id '{id}': {e}"))?;
    let storage = ctx.open_readonly().await?;
    match storage.get_cluster_by_id(&cluster_id).await? {
        Some(cluster) => print_json(&cluster),
        None => Err(ReservoirError::NotFound(format!("cluster '{id}'")).into()),
    }
}

/// Parse `--since`: RFC 3339 or raw microseconds.
fn parse_since(since: &str) -> Result<i64> {
    if let Ok(micros) = since.parse::<i64>() {
        return Ok(micros);
    }
    chrono::DateTime::parse_from_rfc3339(since)
        .map(|dt| dt.timestamp_micros())
        .map_err(|e| eyre!("invalid --since '{since}': {e}"))
}

async fn cmd_cluster_changed(
    ctx: &Context,
    match_key: &str,
    since: Option<&str>,
    after: Option<&str>,
    limit: u32,
) -> Result<()> {
    let since = since.map(parse_since).transpose()?.unwrap_or(0);
    let after: Option<ClusterId> = after
        .map(|a| a.parse().map_err(|e| eyre!("invalid --after '{a}': {e}")))
        .transpose()?;
    let storage = ctx.open_readonly().await?;
    let changed = storage
        .get_clusters_changed_since(match_key, since, after.as_ref(), limit)
        .await?;
    print_json(&changed)
}

async fn cmd_record_list(ctx: &Context, source_id: Option<&str>) -> Result<()> {
    let source_id: Option<SourceId> = source_id.map(str::parse).transpose()?;
    let storage = ctx.open_readonly().await?;
    print_json(&storage.list_global_records(source_id.as_ref()).await?)
}

async fn cmd_record_delete_source(ctx: &Context, source_id: &str) -> Result<()> {
    let source_id: SourceId = source_id.parse()?;
    let storage = ctx.open().await?;
    let deleted = storage.delete_source(&source_id).await?;
    println!("Deleted {deleted} records of source {source_id}");
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn record_done(&self, count: u64) {
        self.spinner.set_message(format!("Records: {count}"));
    }

    fn flow(&self, signal: FlowSignal) {
        debug!(?signal, "ingest flow");
    }

    fn done(&self, _summary: &IngestSummary) {
        self.spinner.finish_and_clear();
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show(ctx: &Context) -> Result<()> {
    let toml_str = toml::to_string_pretty(&ctx.config)?;
    println!("{toml_str}");
    println!("# tenant database: {}", ctx.db_path.display());
    Ok(())
}
