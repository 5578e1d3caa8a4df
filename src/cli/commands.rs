//! CLI command definitions for swe-harvest.
//!
//! `collect` runs the mining engine against one or more repositories and
//! writes per-repository task-instance files. `repos` lists the most-starred
//! repositories per language so operators can assemble a target list.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::collect::config::{
    credential_source_from_env, parse_cutoff, resolve_credentials, CollectConfig,
};
use crate::collect::extract::TaskExtractor;
use crate::collect::filter::FilterPolicy;
use crate::collect::scheduler::{CollectionScheduler, RunSummary};
use crate::collect::store::TaskStore;
use crate::collect::CollectTarget;
use crate::credentials::{CredentialPool, PoolConfig};
use crate::forge::{DiscoveredRepository, HttpForgeClient};

const DEFAULT_OUTPUT_DIR: &str = "./task-instances";

/// Mine merged pull requests into task instances.
#[derive(Parser)]
#[command(name = "swe-harvest")]
#[command(about = "Mine GitHub PR history into task-instance datasets")]
#[command(version)]
#[command(
    long_about = "swe-harvest walks a repository's merged pull requests, keeps the ones that \
fix a linked issue with accompanying test changes, and writes one JSONL task-instance file \
per repository.\n\nExample usage:\n  swe-harvest collect --repos octo/widgets --cutoff-date 20230101"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Collect task instances from repositories.
    Collect(CollectArgs),

    /// List top repositories per language for target discovery.
    Repos(ReposArgs),
}

/// Arguments for `swe-harvest collect`.
#[derive(Parser, Debug)]
pub struct CollectArgs {
    /// Comma-separated repositories to mine (owner/name).
    #[arg(long)]
    pub repos: Option<String>,

    /// Comma-separated languages to discover repositories for.
    #[arg(long)]
    pub languages: Option<String>,

    /// How many repositories to take per discovered language.
    #[arg(long, default_value = "10")]
    pub max_repos_per_language: usize,

    /// Only discover repositories pushed within this many months.
    #[arg(long)]
    pub recency_months: Option<u32>,

    /// Output directory for task-instance and progress files.
    #[arg(short = 'o', long = "path-tasks", default_value = DEFAULT_OUTPUT_DIR)]
    pub path_tasks: PathBuf,

    /// Stop after scanning this many PRs per repository.
    #[arg(long)]
    pub max_pulls: Option<u64>,

    /// Skip PRs merged before this date (YYYYMMDD, inclusive).
    #[arg(long)]
    pub cutoff_date: Option<String>,

    /// Maximum repositories processed concurrently.
    #[arg(long, default_value = "4")]
    pub concurrency: usize,

    /// YAML file overriding the built-in filter policy.
    #[arg(long)]
    pub policy: Option<PathBuf>,

    /// Re-scan repositories even if a previous run drained them.
    #[arg(long)]
    pub refresh: bool,

    /// Version tag stamped onto emitted task instances.
    #[arg(long = "version-tag", default_value = "0.1")]
    pub version: String,

    /// Forge API base URL override.
    #[arg(long, env = "FORGE_BASE_URL")]
    pub base_url: Option<String>,
}

/// Arguments for `swe-harvest repos`.
#[derive(Parser, Debug)]
pub struct ReposArgs {
    /// Comma-separated languages to list repositories for.
    #[arg(long)]
    pub languages: String,

    /// How many repositories to list per language.
    #[arg(long, default_value = "10")]
    pub count: usize,

    /// Only list repositories pushed within this many months.
    #[arg(long)]
    pub recency_months: Option<u32>,

    /// Forge API base URL override.
    #[arg(long, env = "FORGE_BASE_URL")]
    pub base_url: Option<String>,
}

/// Parse CLI arguments without executing.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Execute a parsed CLI invocation.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Collect(args) => run_collect(args).await,
        Commands::Repos(args) => run_repos(args).await,
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn pushed_after(recency_months: Option<u32>) -> Option<DateTime<Utc>> {
    recency_months.map(|months| Utc::now() - chrono::Duration::days(30 * i64::from(months)))
}

/// Wire ctrl-c to the shutdown channel.
fn spawn_shutdown_listener() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested, letting in-flight work finish");
            let _ = tx.send(true);
        }
    });
    rx
}

async fn run_collect(args: CollectArgs) -> anyhow::Result<()> {
    let credentials = credential_source_from_env()?;
    let cutoff = args
        .cutoff_date
        .as_deref()
        .map(parse_cutoff)
        .transpose()?;

    let mut repos = args
        .repos
        .as_deref()
        .map(split_list)
        .unwrap_or_default();

    let shutdown = spawn_shutdown_listener();
    let api = Arc::new(HttpForgeClient::new(args.base_url.clone()));

    let config = CollectConfig {
        repos: repos.clone(),
        cutoff,
        max_pulls: args.max_pulls,
        concurrency: args.concurrency,
        output_dir: args.path_tasks.clone(),
        policy_path: args.policy.clone(),
        refresh: args.refresh,
        version: args.version.clone(),
        credentials,
    };
    let resolved = config.resolve_credentials().await?;
    info!(credentials = resolved.len(), "Credential pool ready");
    let pool = CredentialPool::new(resolved, PoolConfig::default());

    // Discovery extends an explicit repo list rather than replacing it.
    if let Some(languages) = args.languages.as_deref() {
        let discovered = discover(
            &api,
            &pool,
            &split_list(languages),
            args.max_repos_per_language,
            pushed_after(args.recency_months),
            shutdown.clone(),
        )
        .await?;
        for repo in discovered {
            if !repos.contains(&repo.full_name) {
                repos.push(repo.full_name);
            }
        }
    }

    let config = CollectConfig { repos, ..config };
    config.validate()?;

    let policy = match &config.policy_path {
        Some(path) => FilterPolicy::from_file(path)?,
        None => FilterPolicy::default(),
    };
    let store = TaskStore::open(&config.output_dir)?;
    let scheduler = CollectionScheduler::new(
        api,
        pool,
        TaskExtractor::new(policy),
        store,
        config.concurrency,
        shutdown,
    );

    let targets: Vec<CollectTarget> = config
        .repos
        .iter()
        .map(|repo| CollectTarget {
            repo: repo.clone(),
            cutoff: config.cutoff,
            max_pulls: config.max_pulls,
            refresh: config.refresh,
            version: config.version.clone(),
        })
        .collect();

    let summary = scheduler
        .run(targets)
        .await
        .context("collection run aborted")?;
    print_summary(&summary);
    Ok(())
}

async fn run_repos(args: ReposArgs) -> anyhow::Result<()> {
    let credentials = credential_source_from_env()?;
    let resolved = resolve_credentials(&credentials).await?;
    let pool = CredentialPool::new(resolved, PoolConfig::default());
    let api = HttpForgeClient::new(args.base_url.clone());
    let shutdown = spawn_shutdown_listener();

    let discovered = discover(
        &api,
        &pool,
        &split_list(&args.languages),
        args.count,
        pushed_after(args.recency_months),
        shutdown,
    )
    .await?;

    for repo in discovered {
        println!("{:>8}  {}", repo.stars, repo.full_name);
    }
    Ok(())
}

/// Look up the most-starred repositories for each language.
async fn discover(
    api: &HttpForgeClient,
    pool: &CredentialPool,
    languages: &[String],
    count: usize,
    pushed_after: Option<DateTime<Utc>>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<Vec<DiscoveredRepository>> {
    let mut all = Vec::new();
    for language in languages {
        let Some(lease) = pool.acquire_wait(&mut shutdown).await else {
            anyhow::bail!("shut down while waiting for a credential");
        };
        match api
            .search_top_repositories(language, count, pushed_after, &lease)
            .await
        {
            Ok(response) => {
                lease.record(&response.rate);
                info!(
                    language = %language,
                    repos = response.value.len(),
                    "Discovered repositories"
                );
                all.extend(response.value);
            }
            Err(err) => {
                warn!(language = %language, error = %err, "Repository discovery failed");
            }
        }
    }
    Ok(all)
}

fn print_summary(summary: &RunSummary) {
    println!("Collection summary:");
    println!("  repositories done:    {}", summary.repos_done);
    println!("  repositories failed:  {}", summary.repos_failed);
    println!("  pulls scanned:        {}", summary.pulls_scanned);
    println!("  filtered out:         {}", summary.filtered_out);
    println!("  instances collected:  {}", summary.collected);
    println!("  candidates skipped:   {}", summary.skipped);
    println!("  pages skipped:        {}", summary.pages_skipped);
    println!("  credentials:");
    for cred in &summary.rate_limit_state {
        let remaining = cred
            .remaining
            .map(|r| r.to_string())
            .unwrap_or_else(|| "?".to_string());
        let state = if cred.exhausted { "exhausted" } else { "ok" };
        println!("    {:<12} remaining={:<6} {}", cred.id, remaining, state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_splitting_trims_and_drops_empty() {
        assert_eq!(
            split_list(" octo/widgets, acme/gears ,,"),
            vec!["octo/widgets".to_string(), "acme/gears".to_string()]
        );
        assert!(split_list("").is_empty());
    }

    #[test]
    fn cli_parses_collect_invocation() {
        let cli = Cli::try_parse_from([
            "swe-harvest",
            "collect",
            "--repos",
            "octo/widgets",
            "--cutoff-date",
            "20230101",
            "--concurrency",
            "2",
        ])
        .expect("valid invocation");
        match cli.command {
            Commands::Collect(args) => {
                assert_eq!(args.repos.as_deref(), Some("octo/widgets"));
                assert_eq!(args.cutoff_date.as_deref(), Some("20230101"));
                assert_eq!(args.concurrency, 2);
                assert!(!args.refresh);
            }
            _ => panic!("expected collect"),
        }
    }

    #[test]
    fn cli_parses_repos_invocation() {
        let cli = Cli::try_parse_from([
            "swe-harvest",
            "repos",
            "--languages",
            "rust,python",
            "--count",
            "5",
        ])
        .expect("valid invocation");
        match cli.command {
            Commands::Repos(args) => {
                assert_eq!(args.languages, "rust,python");
                assert_eq!(args.count, 5);
            }
            _ => panic!("expected repos"),
        }
    }
}
