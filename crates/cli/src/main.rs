use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use polrep_controller::{config::DEFAULT_RETRY_LIMIT, CatalogBuilder, Controller, ControllerConfig, StaticCatalog};
use polrep_core::{Builder, Creator, ResultBatch};
use polrep_kubehub::{KubePolicyCatalog, KubeSink, RequestCreator, StdoutSink};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "polrepctl", version, about = "Policy report request controller")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller on result batches read as JSON lines
    Run(RunArgs),
    /// Print the composite key of each batch
    Key {
        /// Input file with one JSON batch per line ("-" for stdin)
        #[arg(short, long, default_value = "-")]
        input: String,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Input file with one JSON batch per line ("-" for stdin)
    #[arg(short, long, default_value = "-")]
    input: String,

    /// Worker tasks draining the queue (at least one)
    #[arg(long, env = "POLREP_WORKERS", default_value_t = 2)]
    workers: usize,

    /// Requeues before a failing batch is abandoned
    #[arg(long = "retry-limit", env = "POLREP_RETRY_LIMIT", default_value_t = DEFAULT_RETRY_LIMIT)]
    retry_limit: u32,

    #[arg(long = "backoff-base-ms", env = "POLREP_BACKOFF_BASE_MS", default_value_t = 5)]
    backoff_base_ms: u64,

    #[arg(long = "backoff-max-secs", env = "POLREP_BACKOFF_MAX_SECS", default_value_t = 1000)]
    backoff_max_secs: u64,

    #[arg(long, env = "POLREP_SHARDS", default_value_t = 16)]
    shards: usize,

    /// How often the creator flushes pending report requests
    #[arg(long = "flush-interval-ms", env = "POLREP_FLUSH_INTERVAL_MS", default_value_t = 3000)]
    flush_interval_ms: u64,

    /// Accept every policy and print records as JSON lines instead of applying them
    #[arg(long = "dry-run", action = ArgAction::SetTrue)]
    dry_run: bool,

    /// Stop once the input is exhausted and all batches are processed
    #[arg(long = "exit-on-eof", action = ArgAction::SetTrue)]
    exit_on_eof: bool,
}

impl RunArgs {
    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            workers: self.workers.max(1),
            retry_limit: self.retry_limit,
            initial_backoff: Duration::from_millis(self.backoff_base_ms),
            max_backoff: Duration::from_secs(self.backoff_max_secs),
            store_shards: self.shards,
            ..Default::default()
        }
    }
}

fn init_tracing() {
    let env = std::env::var("POLREP_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("POLREP_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid POLREP_METRICS_ADDR; expected host:port");
        }
    }
}

async fn open_input(input: &str) -> Result<Box<dyn AsyncBufRead + Unpin + Send>> {
    if input == "-" {
        return Ok(Box::new(BufReader::new(tokio::io::stdin())));
    }
    let file = tokio::fs::File::open(input).await.with_context(|| format!("opening {}", input))?;
    Ok(Box::new(BufReader::new(file)))
}

/// Parse one input line; blank lines yield `None`.
fn parse_batch(line: &str) -> Result<Option<ResultBatch>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let batch: ResultBatch = serde_json::from_str(line).context("decoding result batch")?;
    if batch.policy_name.is_empty() {
        anyhow::bail!("batch has no policyName");
    }
    Ok(Some(batch))
}

/// Calls `f` for every decodable batch; returns how many were accepted.
async fn for_each_batch(input: &str, mut f: impl FnMut(ResultBatch)) -> Result<usize> {
    let mut lines = open_input(input).await?.lines();
    let (mut lineno, mut accepted) = (0usize, 0usize);
    while let Some(line) = lines.next_line().await.context("reading input")? {
        lineno += 1;
        match parse_batch(&line) {
            Ok(Some(batch)) => {
                f(batch);
                accepted += 1;
            }
            Ok(None) => {}
            Err(e) => warn!(line = lineno, error = %e, "skipping malformed batch"),
        }
    }
    Ok(accepted)
}

async fn wait_for_drain(controller: &Controller) {
    let mut tick = tokio::time::interval(Duration::from_millis(50));
    while !controller.store().is_empty() {
        tokio::select! {
            _ = tick.tick() => {}
            _ = signal::ctrl_c() => { info!("Ctrl-C received; not waiting for pending batches"); return; }
        }
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let config = args.controller_config();
    let flush_interval = Duration::from_millis(args.flush_interval_ms.max(1));
    let (builder, creator): (Arc<dyn Builder>, Arc<dyn Creator>) = if args.dry_run {
        (
            Arc::new(CatalogBuilder::new(StaticCatalog::permissive())),
            Arc::new(RequestCreator::new(StdoutSink, flush_interval)),
        )
    } else {
        let client = kube::Client::try_default().await.context("connecting to Kubernetes")?;
        (
            Arc::new(CatalogBuilder::new(KubePolicyCatalog::new(client.clone()))),
            Arc::new(RequestCreator::new(KubeSink::new(client), flush_interval)),
        )
    };

    let workers = config.workers;
    let controller = Arc::new(Controller::new(config, builder, creator));
    let stop = CancellationToken::new();
    let runner = tokio::spawn(Arc::clone(&controller).run(workers, stop.clone()));

    let fed = tokio::select! {
        res = for_each_batch(&args.input, |b| controller.add([b])) => Some(res?),
        _ = signal::ctrl_c() => { info!("Ctrl-C received; shutting down"); None }
    };
    if let Some(batches) = fed {
        info!(batches, "input exhausted");
        if args.exit_on_eof {
            wait_for_drain(&controller).await;
        } else {
            signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            info!("Ctrl-C received; shutting down");
        }
    }

    stop.cancel();
    runner.await.context("controller task")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run(args).await?,
        Commands::Key { input } => {
            for_each_batch(&input, |b| println!("{}", b.key())).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_args_map_onto_controller_config() {
        let cli = Cli::try_parse_from(["polrepctl", "run", "--workers", "0", "--retry-limit", "3", "--backoff-base-ms", "20", "--shards", "4"]).unwrap();
        let Commands::Run(args) = cli.command else { panic!("expected run") };
        let cfg = args.controller_config();
        assert_eq!(cfg.workers, 1);
        assert_eq!(cfg.retry_limit, 3);
        assert_eq!(cfg.initial_backoff, Duration::from_millis(20));
        assert_eq!(cfg.store_shards, 4);
        assert_eq!(cfg.queue_name, "report-request-controller");
    }

    #[test]
    fn parse_batch_skips_blank_and_rejects_unnamed() {
        assert!(parse_batch("   ").unwrap().is_none());
        assert!(parse_batch(r#"{"policyName":"","namespace":"ns1"}"#).is_err());
        assert!(parse_batch("not json").is_err());
        let b = parse_batch(r#"{"policyName":"p1","namespace":"ns1","results":[]}"#).unwrap().unwrap();
        assert_eq!(b.key().as_str(), "p1/ns1/0");
    }
}
