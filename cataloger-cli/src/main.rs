mod admin;
mod logging;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use cataloger::client::{DocumentClient, ReqwestDocumentClient};
use cataloger::facter::FacterRegistry;
use cataloger::resolver::{DefaultOwnership, ObjectResolver, RemoteResolver};
use cataloger::storepruner::{StorePruner, StorePrunerConfig};
use cataloger::task::SledTaskStore;
use cataloger::workflow::{Cataloger, CatalogerConfig};
use cataloger_core::ObjectKind;

const MIN_POLL_INTERVAL: Duration = Duration::from_secs(10);
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(3600);

/// Autonomous agent that watches a tag on a document-management service and
/// enriches newly-consumed documents with facts extracted from their
/// content.
#[derive(Parser, Debug)]
#[command(name = "cataloger", version, about)]
struct Args {
    /// Print the registered fact extractors and exit.
    #[arg(long)]
    cataloger_list_facters: bool,

    /// How often to poll for tagged documents, clamped to [10s, 1h].
    #[arg(long, value_parser = parse_duration, default_value = "1m", env = "CATALOGER_POLL_INTERVAL")]
    cataloger_poll_interval: Duration,

    /// Tag applied to documents awaiting cataloging; defaults to
    /// `<program>:todo`.
    #[arg(long, env = "CATALOGER_TAG_TODO")]
    cataloger_tag_todo: Option<String>,

    /// Tag applied to documents that exhausted their retries.
    #[arg(long, env = "CATALOGER_TAG_FAILED")]
    cataloger_tag_failed: Option<String>,

    /// Attempts (including the first) before a document is marked failed.
    #[arg(long, default_value_t = 3, env = "CATALOGER_RETRIES_MAX")]
    cataloger_retries_max: u32,

    /// Per-document extraction timeout.
    #[arg(long, value_parser = parse_duration, default_value = "5m", env = "CATALOGER_FACT_EXTRACT_TIMEOUT")]
    cataloger_fact_extract_timeout: Duration,

    /// Documents larger than this are marked failed without extraction.
    #[arg(long, default_value_t = 10 * 1024 * 1024, env = "CATALOGER_FILE_SIZE_MAX_BYTES")]
    cataloger_file_size_max_bytes: u64,

    /// How often stale task records are pruned from the local store.
    #[arg(long, value_parser = parse_duration, default_value = "1h", env = "CATALOGER_STORE_PRUNE_INTERVAL")]
    cataloger_store_prune_interval: Duration,

    /// Task records older than this are eligible for pruning.
    #[arg(long, value_parser = parse_duration, default_value = "24h", env = "CATALOGER_STORE_PRUNE_MAX_AGE")]
    cataloger_store_prune_max_age: Duration,

    /// Maximum number of documents processed concurrently per poll.
    #[arg(long, default_value_t = 4, env = "CATALOGER_MAX_PARALLEL")]
    cataloger_max_parallel: usize,

    /// Base URL of the document-management service.
    #[arg(long, env = "DOCUMENT_SERVICE_URL")]
    document_service_url: String,

    /// Bearer token for the document-management service.
    #[arg(long, env = "DOCUMENT_SERVICE_TOKEN")]
    document_service_token: String,

    /// Path to the embedded task-record store.
    #[arg(long, default_value = "./cataloger-data", env = "CATALOGER_STORE_PATH")]
    store_path: PathBuf,

    /// Address the admin HTTP server listens on.
    #[arg(long, default_value = "0.0.0.0:8080", env = "CATALOGER_LISTEN_ADDRESS")]
    listen_address: String,

    /// Owner assigned to any tag/correspondent/document-type created by the
    /// resolver.
    #[arg(long, env = "OBJECT_DEFAULT_OWNER_NAME")]
    object_default_owner_name: Option<String>,

    #[arg(long, value_delimiter = ',', env = "OBJECT_DEFAULT_VIEW_USERS")]
    object_default_view_users: Vec<String>,
    #[arg(long, value_delimiter = ',', env = "OBJECT_DEFAULT_VIEW_GROUPS")]
    object_default_view_groups: Vec<String>,
    #[arg(long, value_delimiter = ',', env = "OBJECT_DEFAULT_CHANGE_USERS")]
    object_default_change_users: Vec<String>,
    #[arg(long, value_delimiter = ',', env = "OBJECT_DEFAULT_CHANGE_GROUPS")]
    object_default_change_groups: Vec<String>,
}

/// Accepts `"30s"`, `"5m"`, `"2h"`; a bare number is treated as seconds.
fn parse_duration(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    let (digits, unit) = match raw.find(|c: char| !c.is_ascii_digit()) {
        Some(split) => raw.split_at(split),
        None => (raw, "s"),
    };
    let value: u64 = digits.parse().map_err(|_| format!("not a duration: {raw:?}"))?;
    let seconds = match unit {
        "s" => value,
        "m" => value * 60,
        "h" => value * 3600,
        other => return Err(format!("unknown duration unit {other:?} in {raw:?}")),
    };
    Ok(Duration::from_secs(seconds))
}

fn clamp_poll_interval(interval: Duration) -> Duration {
    interval.clamp(MIN_POLL_INTERVAL, MAX_POLL_INTERVAL)
}

/// Resolves a single name to an id by exact lookup only — creation during
/// bootstrap would race the resolver's own single-flight creates.
async fn resolve_name(client: &dyn DocumentClient, kind: ObjectKind, name: &str) -> anyhow::Result<i64> {
    let matches = client.list_objects(kind, name).await?;
    match matches.as_slice() {
        [one] => Ok(one.id),
        [] => Err(anyhow::anyhow!("{kind} named {name:?} was not found")),
        many => Err(anyhow::anyhow!("{kind} named {name:?} is ambiguous ({} matches)", many.len())),
    }
}

async fn resolve_names(client: &dyn DocumentClient, kind: ObjectKind, names: &[String]) -> anyhow::Result<Vec<i64>> {
    let mut ids = Vec::with_capacity(names.len());
    for name in names {
        ids.push(resolve_name(client, kind, name).await?);
    }
    Ok(ids)
}

async fn default_ownership(client: &dyn DocumentClient, args: &Args) -> anyhow::Result<DefaultOwnership> {
    let owner = match &args.object_default_owner_name {
        Some(name) => Some(resolve_name(client, ObjectKind::User, name).await?),
        None => None,
    };
    Ok(DefaultOwnership {
        owner,
        view_users: resolve_names(client, ObjectKind::User, &args.object_default_view_users).await?,
        view_groups: resolve_names(client, ObjectKind::Group, &args.object_default_view_groups).await?,
        change_users: resolve_names(client, ObjectKind::User, &args.object_default_change_users).await?,
        change_groups: resolve_names(client, ObjectKind::Group, &args.object_default_change_groups).await?,
    })
}

fn run() -> anyhow::Result<ExitCode> {
    let args = Args::parse();
    logging::init();

    if args.cataloger_list_facters {
        let facters = FacterRegistry::new();
        for name in facters.names() {
            println!("{name}");
        }
        return Ok(ExitCode::SUCCESS);
    }

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run_async(args))?;
    Ok(ExitCode::SUCCESS)
}

async fn run_async(args: Args) -> anyhow::Result<()> {
    let program = env!("CARGO_BIN_NAME");
    let todo_tag_name = args.cataloger_tag_todo.clone().unwrap_or_else(|| format!("{program}:todo"));
    let failed_tag_name = args.cataloger_tag_failed.clone().unwrap_or_else(|| format!("{program}:failed"));
    let poll_interval = clamp_poll_interval(args.cataloger_poll_interval);

    let client = Arc::new(ReqwestDocumentClient::new(args.document_service_url.clone(), args.document_service_token.clone()));
    let ownership = default_ownership(client.as_ref(), &args).await?;
    let resolver: Arc<dyn ObjectResolver> = Arc::new(RemoteResolver::new(client.clone(), ownership));

    std::fs::create_dir_all(&args.store_path)?;
    let db = sled::open(&args.store_path)?;
    let store = Arc::new(SledTaskStore::open(&db)?);

    let facters = Arc::new(FacterRegistry::new());
    let scratch_base_dir = std::env::temp_dir().join(program);
    tokio::fs::create_dir_all(&scratch_base_dir).await?;

    let config = CatalogerConfig {
        poll_interval,
        todo_tag_name,
        failed_tag_name,
        retries_max: args.cataloger_retries_max,
        extract_timeout: args.cataloger_fact_extract_timeout,
        max_file_size_bytes: args.cataloger_file_size_max_bytes,
        scratch_base_dir,
        max_parallel: args.cataloger_max_parallel,
    };
    let cataloger = Arc::new(Cataloger::new(client.clone() as Arc<dyn DocumentClient>, resolver, store.clone(), facters, config)?);

    let pruner = Arc::new(StorePruner::new(
        store,
        StorePrunerConfig {
            poll_interval: args.cataloger_store_prune_interval,
            max_record_age: args.cataloger_store_prune_max_age,
        },
    )?);

    let admin_shutdown = cataloger.cancellation_token();
    let admin = tokio::spawn(admin::serve(args.listen_address.clone(), cataloger.clone(), admin_shutdown));

    let poll_handle = tokio::spawn(cataloger.clone().run());
    let prune_handle = tokio::spawn(pruner.clone().run());

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    cataloger.cancel();
    pruner.cancel();

    let _ = poll_handle.await;
    let _ = prune_handle.await;
    match admin.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::error!(error = %err, "admin server exited with an error"),
        Err(err) => tracing::error!(error = %err, "admin server task panicked"),
    }
    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("cataloger: {err:#}");
            ExitCode::FAILURE
        }
    }
}
