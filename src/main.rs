use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::Span;
use tracing_subscriber::EnvFilter;
use tweetgraph::clock::{Clock, SystemClock};
use tweetgraph::{AnalysisError, Analyzer, ApiPlan, Category, Config, InteractionGraph, TwitterClient};

#[derive(Parser, Debug)]
#[command(
    name = "tweetgraph",
    version,
    about = "Rank the accounts a Twitter user interacts with most"
)]
struct Cli {
    /// Path to config file (defaults to ~/.config/tweetgraph/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// API plan: basic, pro or enterprise
    #[arg(long, global = true)]
    plan: Option<ApiPlan>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Analyze the subject's timeline and likes
    Graph {
        #[command(flatten)]
        subject: Subject,

        #[command(flatten)]
        output: OutputArgs,
    },

    /// Search the interactions between the subject and the given accounts
    Counterparts {
        #[command(flatten)]
        subject: Subject,

        /// Comma separated user ids
        #[arg(long, value_delimiter = ',', required = true)]
        candidates: Vec<String>,

        #[command(flatten)]
        output: OutputArgs,
    },

    /// Resolve usernames to user ids
    Lookup {
        #[arg(required = true)]
        usernames: Vec<String>,
    },
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct Subject {
    /// Numeric user id of the subject
    #[arg(long)]
    user_id: Option<String>,

    /// Username of the subject, resolved with a lookup request
    #[arg(long)]
    username: Option<String>,
}

#[derive(Args, Debug)]
struct OutputArgs {
    /// Print JSON instead of a table
    #[arg(long)]
    json: bool,

    /// Only show the N highest ranked accounts
    #[arg(long)]
    top: Option<usize>,
}

#[derive(Serialize)]
struct RankedEntry<'a> {
    rank: usize,
    id: &'a str,
    score: u64,
}

#[derive(Serialize)]
struct Report<'a> {
    subject_id: &'a str,
    partial: bool,
    ranking: Vec<RankedEntry<'a>>,
    graph: &'a InteractionGraph,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(plan) = cli.plan {
        config.plan = plan;
    }

    let span = tracing::info_span!("tweetgraph", plan = ?config.plan);
    let client = Arc::new(
        TwitterClient::new(
            config.bearer_token()?.to_string(),
            config.plan,
            config.request_timeout(),
            span.clone(),
        )
        .with_base_url(config.base_url.clone()),
    );

    match cli.command {
        Commands::Lookup { usernames } => {
            let users = client
                .lookup_users(&usernames)
                .await
                .context("User lookup failed")?;
            for user in users {
                println!("{}\t{}\t{}", user.id, user.username, user.name);
            }
            Ok(())
        }

        Commands::Graph { subject, output } => {
            let subject_id = resolve_subject(&client, subject).await?;
            let cancel = watch_for_shutdown(config.deadline());
            let analyzer = build_analyzer(&config, client, cancel, span);
            let result = analyzer.create_interaction_graph(&subject_id).await;
            report(result, &output)
        }

        Commands::Counterparts {
            subject,
            candidates,
            output,
        } => {
            let subject_id = resolve_subject(&client, subject).await?;
            let candidates: Vec<String> = candidates
                .into_iter()
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect();
            let cancel = watch_for_shutdown(config.deadline());
            let analyzer = build_analyzer(&config, client, cancel, span);
            let result = analyzer
                .analyze_counterpart_interactions(&subject_id, &candidates)
                .await;
            report(result, &output)
        }
    }
}

fn build_analyzer(config: &Config, client: Arc<TwitterClient>, cancel: CancellationToken, span: Span) -> Analyzer {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    Analyzer::new(
        client,
        config.limiters(clock.clone()),
        clock,
        config.analyzer_settings(),
        cancel,
        span,
    )
}

async fn resolve_subject(client: &TwitterClient, subject: Subject) -> Result<String> {
    if let Some(id) = subject.user_id {
        return Ok(id);
    }
    let username = subject.username.context("Either --user-id or --username is required")?;
    let users = client
        .lookup_users(std::slice::from_ref(&username))
        .await
        .with_context(|| format!("Failed to look up @{}", username))?;
    users
        .into_iter()
        .next()
        .map(|user| user.id)
        .with_context(|| format!("No user named @{}", username))
}

/// Cancels the returned token on Ctrl-C or once `deadline` has passed.
fn watch_for_shutdown(deadline: Option<Duration>) -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        let deadline = async {
            match deadline {
                Some(deadline) => tokio::time::sleep(deadline).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::warn!("interrupted, stopping collection"),
            _ = deadline => tracing::warn!("deadline reached, stopping collection"),
        }
        token.cancel();
    });
    cancel
}

fn report(result: Result<InteractionGraph, AnalysisError>, output: &OutputArgs) -> Result<()> {
    match result {
        Ok(graph) => print_graph(&graph, false, output),
        Err(err) => {
            eprintln!("warning: collection incomplete, showing partial results");
            for failure in &err.failures {
                eprintln!("  {}", failure);
            }
            print_graph(&err.graph, true, output)?;
            Err(err.into())
        }
    }
}

fn print_graph(graph: &InteractionGraph, partial: bool, output: &OutputArgs) -> Result<()> {
    let (ids, scores) = graph.ranked();
    let limit = output.top.unwrap_or(ids.len());
    let ranking: Vec<RankedEntry> = ids
        .iter()
        .zip(scores)
        .take(limit)
        .enumerate()
        .map(|(i, (id, score))| RankedEntry {
            rank: i + 1,
            id: id.as_str(),
            score,
        })
        .collect();

    if output.json {
        let report = Report {
            subject_id: &graph.subject_id,
            partial,
            ranking,
            graph,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!(
        "{:>4}  {:<20} {:>6} {:>8} {:>8} {:>8} {:>8} {:>6}",
        "#", "user id", "score", "rep to", "rep from", "rt to", "rt from", "likes"
    );
    for entry in &ranking {
        let [reply_to, reply_from, retweet_to, retweet_from, like] =
            Category::ALL.map(|category| graph.count(category, entry.id));
        println!(
            "{:>4}  {:<20} {:>6} {:>8} {:>8} {:>8} {:>8} {:>6}",
            entry.rank, entry.id, entry.score, reply_to, reply_from, retweet_to, retweet_from, like
        );
    }
    if ranking.is_empty() {
        println!("no interactions found for {}", graph.subject_id);
    }
    Ok(())
}
