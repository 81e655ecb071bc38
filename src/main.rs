use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use repochat::data::{
    Message, MessageStore, RepositoryTarget, TargetKey, TargetStore, DEFAULT_BRANCH,
    DEFAULT_MESSAGE_PATH,
};
use repochat::remote::GithubRemoteFactory;
use repochat::sync::TargetStatus;
use repochat::{util, Config, Database, Registry, SyncEngine, SyncReport};

#[derive(Parser, Debug)]
#[command(
    name = "repochat",
    version,
    about = "Chat over Git: sync messages across GitHub repositories"
)]
struct Cli {
    /// Data directory (default: ~/.repochat)
    #[arg(long, global = true, value_name = "PATH")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage synchronized repositories
    #[command(subcommand)]
    Repo(RepoCommands),

    /// Store a message locally; it is pushed on the next sync
    Send {
        /// Author recorded on the message
        author: String,
        /// Message text
        content: String,
    },

    /// Run one fetch-then-push cycle across all repositories
    Sync {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand, Debug)]
enum RepoCommands {
    /// Add a repository ("owner/name")
    Add {
        /// Repository as owner/name
        repo: String,
        /// Branch to sync
        #[arg(long, default_value = DEFAULT_BRANCH)]
        branch: String,
        /// Directory holding message files
        #[arg(long, default_value = DEFAULT_MESSAGE_PATH)]
        path: String,
    },

    /// Remove a repository
    Remove {
        /// Repository as owner/name
        repo: String,
        #[arg(long, default_value = DEFAULT_BRANCH)]
        branch: String,
    },

    /// List configured repositories
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    util::init_data_dir(cli.data_dir.clone());

    // Initialize logging to file (~/.repochat/logs/repochat.log)
    fs::create_dir_all(util::logs_dir())?;
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(util::log_file_path())?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(log_file)
        .with_ansi(false) // Disable ANSI colors in log file
        .init();

    let config = Config::load();
    let database = Database::open(util::database_path()).context("failed to open database")?;

    match cli.command {
        Commands::Repo(command) => run_repo(&database, command),
        Commands::Send { author, content } => {
            let message = Message::new(&content, &author);
            MessageStore::new(database.connection())
                .put(&message)
                .context("failed to store message")?;
            println!("{}", message.id);
            Ok(())
        }
        Commands::Sync { json } => {
            let engine = SyncEngine::new(&database, github_factory(&config)?);
            let report = engine.sync_once(CancellationToken::new()).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&report_json(&report))?);
            } else {
                println!(
                    "fetched {} message(s), pushed {} commit(s) across {} repositories",
                    report.fetched,
                    report.pushed,
                    report.per_target.len()
                );
                for (key, status) in &report.per_target {
                    match status {
                        TargetStatus::Synced { fetched, pushed } => {
                            println!("  {key}: ok ({fetched} fetched, {pushed} pushed)");
                        }
                        TargetStatus::Failed { error, .. } => {
                            println!("  {key}: error: {error}");
                        }
                        TargetStatus::Skipped => println!("  {key}: skipped"),
                    }
                }
            }
            if report.per_target_errors().is_empty() {
                Ok(())
            } else {
                Err(anyhow!("sync completed with errors"))
            }
        }
    }
}

fn run_repo(database: &Database, command: RepoCommands) -> Result<()> {
    let registry = Registry::new(TargetStore::new(database.connection()));
    match command {
        RepoCommands::Add { repo, branch, path } => {
            let (owner, name) = parse_repo_spec(&repo)?;
            let target = RepositoryTarget::new(owner, name)
                .with_branch(&branch)
                .with_message_path(&path);
            let key = target.key.clone();
            registry.add(target)?;
            println!("added {key}");
            Ok(())
        }
        RepoCommands::Remove { repo, branch } => {
            let (owner, name) = parse_repo_spec(&repo)?;
            let key = TargetKey::new(owner, name, &branch);
            registry.remove(&key)?;
            println!("removed {key}");
            Ok(())
        }
        RepoCommands::List => {
            let targets = registry.list()?;
            if targets.is_empty() {
                println!("no repositories configured");
            }
            for target in targets {
                let cursor = target.cursor.as_deref().unwrap_or("never synced");
                println!("{} ({}) [{}]", target.key, target.message_path, cursor);
            }
            Ok(())
        }
    }
}

fn github_factory(config: &Config) -> Result<Arc<GithubRemoteFactory>> {
    let token = config
        .github_token
        .clone()
        .ok_or_else(|| anyhow!("no GitHub token configured (set [github].token or GITHUB_TOKEN)"))?;
    let factory = GithubRemoteFactory::new(
        token,
        config.api_base.clone(),
        config.request_timeout,
        config.retry,
    )
    .context("failed to build GitHub client")?;
    Ok(Arc::new(factory))
}

fn report_json(report: &SyncReport) -> serde_json::Value {
    let targets: serde_json::Map<String, serde_json::Value> = report
        .per_target
        .iter()
        .map(|(key, status)| {
            let value = match status {
                TargetStatus::Synced { fetched, pushed } => serde_json::json!({
                    "status": "synced",
                    "fetched": fetched,
                    "pushed": pushed,
                }),
                TargetStatus::Failed {
                    fetched,
                    pushed,
                    error,
                } => serde_json::json!({
                    "status": "failed",
                    "fetched": fetched,
                    "pushed": pushed,
                    "error": error.to_string(),
                }),
                TargetStatus::Skipped => serde_json::json!({ "status": "skipped" }),
            };
            (key.to_string(), value)
        })
        .collect();
    serde_json::json!({
        "fetched": report.fetched,
        "pushed": report.pushed,
        "targets": targets,
    })
}

fn parse_repo_spec(spec: &str) -> Result<(&str, &str)> {
    match spec.split_once('/') {
        Some((owner, name)) if !owner.is_empty() && !name.is_empty() && !name.contains('/') => {
            Ok((owner, name))
        }
        _ => Err(anyhow!("invalid repository {spec:?}, expected owner/name")),
    }
}
