use std::collections::BTreeMap;
use std::io::{BufRead, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use admeasure_cloud::adapters::digitalocean::DigitalOceanProvider;
use admeasure_cloud::adapters::lightsail::LightsailProvider;
use admeasure_cloud::adapters::s3::S3ArtifactStore;
use admeasure_cloud::config::DEFAULT_DIGITALOCEAN_API;
use admeasure_cloud::handlers::logs::{collect_log_files, LogFiles};
use admeasure_cloud::{
    fetch_all, ArtifactClient, FetchOptions, Fleet, FleetConfig, StoreConfig, TeardownReport,
    WaitOutcome,
};
use admeasure_core::storage_keys::artifact_key;
use admeasure_core::{
    grep, merge_files, normalize, KeywordConfig, KeywordScanner, LazyScanner, PlanBatch,
    ScanStrategy,
};
use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio::runtime::Runtime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

// ── CLI definition ─────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "adm",
    about = "Operator CLI for ad measurement campaigns",
    long_about = "Spawn and tear down runner VMs, inspect and fetch campaign\n\
                  artifacts, reconstruct runner logs and scan captured pages\n\
                  for keywords."
)]
struct Cli {
    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true, env = "ADMEASURE_LOG_JSON")]
    log_json: bool,
    /// Local directory fetched artifacts are cached in
    #[arg(long, global = true, env = "ADMEASURE_CACHE_DIR", default_value = ".cache")]
    cache_dir: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the target URL of a visited step
    Url {
        /// Step identifier, e.g. eval/2024-05-01T10:00:00/news-3
        id: String,
    },
    /// Runner VM fleet
    Vm {
        #[command(flatten)]
        credentials: ProviderArgs,
        #[command(subcommand)]
        command: VmCommand,
    },
    /// Artifact bucket
    S3 {
        #[command(subcommand)]
        command: S3Command,
    },
    /// Runner logs
    Log {
        #[command(subcommand)]
        command: LogCommand,
    },
    /// Count keyword matches in captured page files
    Scan {
        /// Files to scan
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Keyword group file
        #[arg(long, env = "ADMEASURE_KEYWORDS", default_value = "keywords.json")]
        keywords: PathBuf,
        #[arg(value_enum, long, default_value_t = Engine::Auto)]
        engine: Engine,
    },
}

#[derive(Args)]
struct ProviderArgs {
    #[arg(long, env = "DIGITALOCEAN_ACCESS_TOKEN", hide_env_values = true)]
    digitalocean_token: Option<String>,
    #[arg(long, env = "ADMEASURE_DO_ENDPOINT", default_value = DEFAULT_DIGITALOCEAN_API)]
    digitalocean_endpoint: String,
}

#[derive(Subcommand)]
enum VmCommand {
    /// Launch one runner per plan in a JSON file ("-" reads stdin)
    Spawn { plans: String },
    /// Delete every instance carrying the tag on both providers
    Delete { tag: String },
    /// Wait for tagged runners to finish, deleting stragglers after the timeout
    WaitComplete {
        tag: String,
        timeout_secs: u64,
        #[arg(long, default_value_t = 5)]
        poll_secs: u64,
    },
}

#[derive(Subcommand)]
enum S3Command {
    /// Print one artifact file of a step or plan
    Get {
        filename: String,
        id: String,
        #[arg(long)]
        pretty: bool,
    },
    /// Delete everything under a prefix
    Delete {
        prefix: String,
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
    /// List common prefixes below a prefix
    Ls {
        prefix: String,
        #[arg(long, default_value = "/")]
        delimiter: String,
    },
    /// Download artifacts under a prefix into the cache directory
    Fetch {
        prefix: String,
        /// Only keys ending in one of these suffixes
        #[arg(long)]
        suffix: Vec<String>,
        /// Fail when a listed object has disappeared
        #[arg(long)]
        strict: bool,
    },
    /// Upload runner resources, publicly readable
    ResourceUpload {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Print the public URL of a runner resource
    ResourceUrl { filename: String },
}

#[derive(Subcommand)]
enum LogCommand {
    /// Print the merged measurement log under a prefix
    Show { prefix: String },
    /// Search log entries, case-insensitively
    Grep {
        pattern: String,
        /// Defaults to today's evaluation prefix
        prefix: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Engine {
    /// Accelerated when available, reference otherwise
    Auto,
    Reference,
    Accelerated,
}

// ── helpers ────────────────────────────────────────────────────────

fn step(label: &str) {
    eprintln!("\n=== {label} ===");
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json().with_writer(std::io::stderr)))
        .with((!json).then(|| fmt::layer().with_writer(std::io::stderr)))
        .init();
}

fn artifact_client(runtime: &Runtime) -> ArtifactClient {
    let store = S3ArtifactStore::connect(&StoreConfig::from_env(), runtime.handle().clone());
    ArtifactClient::new(Arc::new(store))
}

fn fleet(runtime: &Runtime, credentials: ProviderArgs) -> Result<Fleet> {
    let config = FleetConfig::from_env();
    let store = StoreConfig::from_env();
    let token = credentials
        .digitalocean_token
        .context("DIGITALOCEAN_ACCESS_TOKEN is not set")?;
    let lightsail = LightsailProvider::connect(
        store.profile.as_deref(),
        config.lightsail_bundle.clone(),
        runtime.handle().clone(),
    );
    let digitalocean = DigitalOceanProvider::new(
        &credentials.digitalocean_endpoint,
        token,
        config.digitalocean_size.clone(),
        config.digitalocean_ssh_keys.clone(),
    )?;
    Ok(Fleet::new(Box::new(lightsail), Box::new(digitalocean), config))
}

fn read_plans(source: &str) -> Result<Vec<u8>> {
    if source == "-" {
        let mut buffer = Vec::new();
        std::io::stdin()
            .read_to_end(&mut buffer)
            .context("failed to read plans from stdin")?;
        return Ok(buffer);
    }
    std::fs::read(source).with_context(|| format!("failed to read plans from {source}"))
}

fn confirm(question: &str) -> Result<bool> {
    eprint!("{question} [y/N] ");
    std::io::stderr().flush()?;
    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

fn ensure_clean(report: &TeardownReport) -> Result<()> {
    for failure in &report.failures {
        eprintln!(
            "  {} {}: {}",
            failure.provider,
            failure.region.as_deref().unwrap_or("-"),
            failure.message
        );
    }
    if !report.is_clean() {
        bail!(
            "teardown left {} failure(s); instances may still be running",
            report.failures.len()
        );
    }
    Ok(())
}

fn collect_logs(runtime: &Runtime, cache_dir: &Path, prefix: &str) -> Result<LogFiles> {
    let client = artifact_client(runtime);
    let options = FetchOptions {
        show_progress: true,
        ..FetchOptions::default()
    };
    let files = collect_log_files(&client, cache_dir, prefix, &options)
        .with_context(|| format!("failed to collect logs under {prefix}"))?;
    Ok(files)
}

fn runtime() -> Result<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")
}

// ── commands ───────────────────────────────────────────────────────

fn run_vm(runtime: &Runtime, credentials: ProviderArgs, command: VmCommand) -> Result<()> {
    let fleet = fleet(runtime, credentials)?;
    match command {
        VmCommand::Spawn { plans } => {
            let plans = PlanBatch::from_json(&read_plans(&plans)?)?;
            step(&format!("Spawning {} runner(s)", plans.len()));
            let artifacts = artifact_client(runtime);
            for instance in fleet.spawn(&plans, &artifacts, true)? {
                println!(
                    "{}\t{}\t{}\t{}",
                    instance.provider, instance.region, instance.name, instance.id
                );
            }
        }
        VmCommand::Delete { tag } => {
            step(&format!("Deleting instances tagged {tag}"));
            let report = fleet.delete_by_tag(&tag);
            for instance in &report.deleted {
                println!("{}\t{}\t{}", instance.provider, instance.region, instance.name);
            }
            ensure_clean(&report)?;
        }
        VmCommand::WaitComplete {
            tag,
            timeout_secs,
            poll_secs,
        } => {
            step(&format!("Waiting for instances tagged {tag}"));
            match fleet.wait_complete(
                &tag,
                Duration::from_secs(timeout_secs),
                Duration::from_secs(poll_secs.max(1)),
            )? {
                WaitOutcome::Drained { elapsed } => {
                    eprintln!("All runners finished after {}s.", elapsed.as_secs());
                }
                WaitOutcome::TimedOut { alive, teardown } => {
                    eprintln!(
                        "Timed out with {alive} runner(s) alive; deleted {}.",
                        teardown.deleted.len()
                    );
                    ensure_clean(&teardown)?;
                }
            }
        }
    }
    Ok(())
}

fn run_s3(runtime: &Runtime, cache_dir: &Path, command: S3Command) -> Result<()> {
    let client = artifact_client(runtime);
    match command {
        S3Command::Get { filename, id, pretty } => {
            let key = artifact_key(normalize(&id).as_str(), &filename);
            let body = client
                .get(&key)
                .with_context(|| format!("failed to read {key}"))?;
            if pretty {
                let value: serde_json::Value = serde_json::from_slice(&body)
                    .with_context(|| format!("{key} is not JSON"))?;
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                std::io::stdout().write_all(&body)?;
            }
        }
        S3Command::Delete { prefix, yes } => {
            if !yes && !confirm(&format!("Delete every object under '{prefix}'?"))? {
                eprintln!("Aborted.");
                return Ok(());
            }
            let deleted = client.delete_prefix(&prefix)?;
            eprintln!("Deleted {deleted} object(s).");
        }
        S3Command::Ls { prefix, delimiter } => {
            for entry in client.enumerate_prefixes(&prefix, &delimiter) {
                println!("{}", entry?);
            }
        }
        S3Command::Fetch {
            prefix,
            suffix,
            strict,
        } => {
            let prefix = normalize(&prefix);
            let keys: Vec<String> = client
                .list_keys(prefix.as_str())?
                .into_iter()
                .filter(|key| suffix.is_empty() || suffix.iter().any(|s| key.ends_with(s.as_str())))
                .collect();
            step(&format!("Fetching {} object(s) under {prefix}", keys.len()));
            let options = FetchOptions {
                ignore_missing: !strict,
                show_progress: true,
                ..FetchOptions::default()
            };
            let outcome = fetch_all(&client, cache_dir, &keys, &options)?;
            eprintln!(
                "{} cached, {} downloaded, {} missing",
                outcome.stats.cached, outcome.stats.downloaded, outcome.stats.missing
            );
        }
        S3Command::ResourceUpload { files } => {
            for file in files {
                let key = client
                    .upload_resource(&file)
                    .with_context(|| format!("failed to upload {}", file.display()))?;
                println!("{key}");
            }
        }
        S3Command::ResourceUrl { filename } => {
            println!("{}", client.resource_url(&filename)?);
        }
    }
    Ok(())
}

fn run_log(runtime: &Runtime, cache_dir: &Path, command: LogCommand) -> Result<()> {
    match command {
        LogCommand::Show { prefix } => {
            let files = collect_logs(runtime, cache_dir, &prefix)?;
            for entry in merge_files(&files.site, &files.job)? {
                println!("{} [{}] {}", entry.time.to_rfc3339(), entry.part, entry.text);
            }
        }
        LogCommand::Grep { pattern, prefix } => {
            let prefix = prefix
                .unwrap_or_else(|| format!("eval/{}", chrono::Utc::now().format("%Y-%m-%d")));
            let files = collect_logs(runtime, cache_dir, &prefix)?;
            for hit in grep(&pattern, &files.site, &files.job)? {
                println!("{}\t{}", hit.source_id, hit.text);
            }
        }
    }
    Ok(())
}

fn run_scan(files: &[PathBuf], keywords: &Path, engine: Engine) -> Result<()> {
    let lazy = LazyScanner::new(keywords);
    let pinned = match engine {
        Engine::Auto => None,
        Engine::Reference => Some(ScanStrategy::Reference),
        Engine::Accelerated => Some(ScanStrategy::Accelerated),
    };
    let explicit = match pinned {
        Some(strategy) => Some(KeywordScanner::with_strategy(
            KeywordConfig::load(keywords)?.patterns(),
            strategy,
        )?),
        None => None,
    };
    for file in files {
        let scanner = match &explicit {
            Some(scanner) => scanner,
            None => lazy.scanner()?,
        };
        let data = std::fs::read(file).with_context(|| format!("failed to read {}", file.display()))?;
        let counts = scanner
            .scan(&data)
            .with_context(|| format!("failed to scan {}", file.display()))?;
        let matched: BTreeMap<&str, u64> = counts.non_zero().collect();
        let line = serde_json::json!({
            "file": file.display().to_string(),
            "total": counts.total(),
            "counts": matched,
        });
        println!("{line}");
    }
    Ok(())
}

// ── main ───────────────────────────────────────────────────────────

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Commands::Url { id } => {
            println!("{}", artifact_client(&runtime()?).step_url(&id)?);
        }
        Commands::Vm {
            credentials,
            command,
        } => run_vm(&runtime()?, credentials, command)?,
        Commands::S3 { command } => run_s3(&runtime()?, &cli.cache_dir, command)?,
        Commands::Log { command } => run_log(&runtime()?, &cli.cache_dir, command)?,
        Commands::Scan {
            files,
            keywords,
            engine,
        } => run_scan(&files, &keywords, engine)?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn command_tree_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn wait_complete_defaults_to_five_second_polls() {
        let cli = Cli::try_parse_from(["adm", "vm", "wait-complete", "runner", "600"])
            .expect("arguments should parse");
        assert!(matches!(
            cli.command,
            Commands::Vm {
                command: VmCommand::WaitComplete { ref tag, timeout_secs: 600, poll_secs: 5 },
                ..
            } if tag == "runner"
        ));
    }

    #[test]
    fn scan_requires_at_least_one_file() {
        assert!(Cli::try_parse_from(["adm", "scan"]).is_err());
    }
}
