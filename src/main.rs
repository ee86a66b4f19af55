use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand};
use couchshard::{
    ConnectionConfig, HttpSessionFactory, MonitorConfig, NodeEndpoint, PipelineConfig,
    ReconcileOptions, RetryPolicy, TracingProgress, UpdateReport, metadata_counts, update_metadata,
    wait_for_convergence,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "couchshard")]
#[command(about = "Reassign CouchDB shard ownership and wait for the cluster to converge")]
struct Cli {
    #[command(flatten)]
    connection: ConnectionArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct ConnectionArgs {
    /// Node to talk to; credentials may be embedded in the URL
    #[arg(long, global = true, default_value = "http://127.0.0.1:5984")]
    url: String,

    #[arg(long, short = 'u', global = true)]
    user: Option<String>,

    #[arg(long, short = 'p', global = true, env = "COUCHSHARD_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Connection attempts before giving up
    #[arg(long, global = true, default_value_t = 6)]
    attempts: u32,

    /// Delay after the first failed attempt, doubled after each further one
    #[arg(long, global = true, default_value_t = 250)]
    backoff_ms: u64,
}

#[derive(Subcommand)]
enum Command {
    /// Assign every shard of every database to the target nodes
    UpdateMetadata {
        /// Target node (repeatable); defaults to the cluster's members
        #[arg(long = "node")]
        nodes: Vec<String>,
        #[arg(long, default_value_t = 16)]
        workers: usize,
        #[arg(long, default_value_t = 100)]
        batch_size: usize,
        #[arg(long, default_value_t = 1000)]
        page_size: usize,
        /// Rewrite even if the first database already names the target nodes
        #[arg(long)]
        force: bool,
    },
    /// Wait until the secondaries hold as much shard metadata as the primary
    WaitSync {
        /// Primary node URL; defaults to --url
        #[arg(long)]
        primary: Option<String>,
        #[arg(long = "secondary", required = true)]
        secondaries: Vec<String>,
        #[arg(long, default_value_t = 2)]
        interval_secs: u64,
        /// Give up after this many seconds
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Print the shard metadata document count of each node
    Status {
        /// Node URL (repeatable); defaults to --url
        #[arg(long = "node")]
        nodes: Vec<String>,
    },
}

impl ConnectionArgs {
    fn retry(&self) -> Result<RetryPolicy> {
        let retry = RetryPolicy::new(self.attempts, Duration::from_millis(self.backoff_ms));
        retry.validate().map_err(|err| anyhow!(err))?;
        Ok(retry)
    }

    /// Parses `url`, applying the global credentials unless the URL has its own.
    fn endpoint(&self, url: &str) -> Result<NodeEndpoint> {
        let mut config = ConnectionConfig::from_url(url)
            .map_err(|err| anyhow!(err))
            .with_context(|| format!("invalid node URL '{}'", url))?;
        if config.username.is_none() {
            if let Some(user) = &self.user {
                config = config.credentials(user, self.password.as_deref().unwrap_or(""));
            }
        }
        config
            .validate()
            .map_err(|err| anyhow!(err))
            .with_context(|| format!("invalid node URL '{}'", url))?;
        Ok(NodeEndpoint::from_config(config))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let factory = Arc::new(HttpSessionFactory::new());
    let retry = cli.connection.retry()?;

    match cli.command {
        Command::UpdateMetadata {
            nodes,
            workers,
            batch_size,
            page_size,
            force,
        } => {
            let endpoint = cli.connection.endpoint(&cli.connection.url)?;
            let mut options = ReconcileOptions::new(endpoint.config)
                .pipeline(
                    PipelineConfig::default()
                        .workers(workers)
                        .batch_size(batch_size)
                        .retry(retry),
                )
                .page_size(page_size)
                .force(force);
            if !nodes.is_empty() {
                options = options.target_nodes(nodes);
            }

            let report = update_metadata(factory, &options, Arc::new(TracingProgress))
                .await
                .context("shard metadata update failed")?;
            match report {
                UpdateReport::NoDatabases => println!("no databases, nothing to do"),
                UpdateReport::AlreadyAligned { database } => {
                    println!("shard maps already aligned (checked '{}'), nothing to do", database)
                }
                UpdateReport::Rewritten(stats) => println!(
                    "rewrote {} shard maps, skipped {} ({} batches)",
                    stats.applied, stats.skipped, stats.batches
                ),
            }
        }
        Command::WaitSync {
            primary,
            secondaries,
            interval_secs,
            timeout_secs,
        } => {
            let primary = cli
                .connection
                .endpoint(primary.as_deref().unwrap_or(&cli.connection.url))?;
            let secondaries = secondaries
                .iter()
                .map(|url| cli.connection.endpoint(url))
                .collect::<Result<Vec<_>>>()?;
            let config = MonitorConfig::default()
                .poll_interval(Duration::from_secs(interval_secs))
                .retry(retry);

            let wait = wait_for_convergence(factory, &primary, &secondaries, config, &TracingProgress);
            let report = match timeout_secs {
                Some(secs) => tokio::time::timeout(Duration::from_secs(secs), wait)
                    .await
                    .map_err(|_| anyhow!("secondaries did not converge within {}s", secs))?,
                None => wait.await,
            }
            .context("waiting for convergence failed")?;
            println!(
                "all {} secondaries hold {} metadata documents ({} polls)",
                report.nodes.len(),
                report.target,
                report.polls
            );
        }
        Command::Status { nodes } => {
            let urls = if nodes.is_empty() {
                vec![cli.connection.url.clone()]
            } else {
                nodes
            };
            let endpoints = urls
                .iter()
                .map(|url| cli.connection.endpoint(url))
                .collect::<Result<Vec<_>>>()?;
            let config = MonitorConfig::default().retry(retry);

            let counts = metadata_counts(factory.as_ref(), &endpoints, &config)
                .await
                .context("reading metadata counts failed")?;
            for (node, count) in counts {
                println!("{}\t{}", node, count);
            }
        }
    }

    Ok(())
}
