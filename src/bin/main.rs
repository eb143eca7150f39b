// Reviewscope CLI
// One-shot mirror-and-score runs plus filter validation

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use reviewscope::config::Config;
use reviewscope::dashboard;
use reviewscope::filter::eval::Filter;
use reviewscope::preds::{collect_change_preds, defaults, BoardChange};
use reviewscope::remote::gerrit::GerritClient;
use reviewscope::remote::github::GitHubClient;
use reviewscope::remote::groups::GroupsClient;
use reviewscope::review::accounts::AccountSet;
use reviewscope::review::board;
use reviewscope::storage::kv::MemStore;
use reviewscope::sync::gerrit::GerritSync;
use reviewscope::sync::github::GitHubSync;
use reviewscope::sync::groups::GroupSync;

#[derive(Parser)]
#[command(name = "reviewscope", about = "Review dashboard over mirrored services")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Mirror every configured source, then print the scored dashboard.
    Run {
        /// JSON config file listing instances, repos and groups.
        #[arg(long)]
        config: PathBuf,
        /// Filter expression applied to the scored changes.
        #[arg(long)]
        filter: Option<String>,
        /// JSON file with category definitions `[{name, doc, filter}]`.
        #[arg(long)]
        categories: Option<PathBuf>,
    },
    /// Parse a filter expression and report diagnostics.
    CheckFilter { expr: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match Cli::parse().command {
        Command::Run {
            config,
            filter,
            categories,
        } => run(config, filter, categories).await,
        Command::CheckFilter { expr } => check_filter(&expr),
    }
}

async fn run(
    config_path: PathBuf,
    filter: Option<String>,
    categories: Option<PathBuf>,
) -> anyhow::Result<()> {
    let config = Config::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let db = MemStore::shared();
    let cancel = CancellationToken::new();
    let mut changes: Vec<BoardChange> = Vec::new();

    for gerrit in &config.gerrit {
        let mut client = GerritClient::new(&gerrit.url)?;
        if let (Some(username), Some(password)) = (&gerrit.username, Config::gerrit_password()) {
            client = client.with_auth(username, password);
        }
        let sync = GerritSync::new(Arc::clone(&db), client, gerrit.instance());
        for project in &gerrit.projects {
            sync.add(project);
        }
        sync.sync(&cancel).await?;
        sync.refresh_mergeable_if_stale(&cancel).await?;
        for project in &gerrit.projects {
            let (_, mut project_changes) = board::gerrit_board_changes(&sync, project);
            changes.append(&mut project_changes);
        }
    }

    if !config.github.is_empty() {
        let client = GitHubClient::new(Config::github_token())?;
        let sync = GitHubSync::new(Arc::clone(&db), client);
        for repo in &config.github {
            sync.add(repo);
        }
        sync.sync(&cancel).await?;
        let accounts = Arc::new(AccountSet::default());
        for repo in &config.github {
            changes.append(&mut board::github_board_changes(
                &sync,
                repo,
                Arc::clone(&accounts),
            ));
        }
    }

    if !config.groups.is_empty() {
        let sync = GroupSync::new(Arc::clone(&db), GroupsClient::new()?);
        for group in &config.groups {
            sync.add(group);
        }
        sync.sync(&cancel).await?;
        for group in &config.groups {
            changes.append(&mut board::groups_board_changes(&sync, group));
        }
    }

    info!(total = changes.len(), "scoring mirrored changes");
    let rows = collect_change_preds(
        &cancel,
        changes,
        &defaults::default_predicates(),
        &defaults::default_rejects(),
    )
    .await;

    let rows = match &filter {
        Some(expr) => dashboard::query(expr, rows)?,
        None => rows,
    };

    let split = match &categories {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("loading {}", path.display()))?;
            dashboard::categorize(&dashboard::parse_categories(&text)?, rows)?
        }
        None => dashboard::categorize(&[], rows)?,
    };
    print!("{}", dashboard::render_text(&split));
    Ok(())
}

fn check_filter(expr: &str) -> anyhow::Result<()> {
    let filter = Filter::new(expr)?;
    match filter.expr() {
        Some(parsed) => println!("ok: {parsed}"),
        None => println!("ok: empty filter (matches everything)"),
    }
    for warning in filter.warnings() {
        println!("warning: {warning}");
    }
    Ok(())
}
