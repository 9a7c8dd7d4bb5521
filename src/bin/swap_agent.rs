use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::{Parser as _, Subcommand};
use ln_liquidity_swap::chain::keys::MasterSeed;
use ln_liquidity_swap::config::SwapConfig;
use ln_liquidity_swap::exchange::ExchangeClient;
use ln_liquidity_swap::exchange::boltz::BoltzClient;
use ln_liquidity_swap::lightning::cln::ClnSocketClient;
use ln_liquidity_swap::lightning::ldk::LdkLightningClient;
use ln_liquidity_swap::lightning::{NodeAdapter, NodeBackend};
use ln_liquidity_swap::swap::engine::ExecutionEngine;
use ln_liquidity_swap::swap::sink::{LogMessage, LogSink};
use ln_liquidity_swap::swap::store::JobStore;
use ln_liquidity_swap::swap::{JobId, JobOutcome};
use serde_json::json;
use tokio_util::sync::CancellationToken;

#[derive(Debug, clap::Parser)]
struct Args {
    #[arg(long, env = "SWAP_STORE_PATH", default_value = "swap-jobs.sqlite3")]
    store_path: PathBuf,

    /// JSON file with a `SwapConfig`. Flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, env = "SWAP_MASTER_SEED", hide_env_values = true)]
    master_seed: Option<String>,

    #[arg(long)]
    network: Option<bitcoin::Network>,

    #[arg(long, env = "SWAP_EXCHANGE_URL", default_value = "http://127.0.0.1:9001")]
    exchange_url: String,

    #[arg(long, value_enum, default_value = "ldk")]
    node_backend: NodeBackend,

    #[arg(long, env = "SWAP_LDK_REST_ADDR")]
    ldk_rest_addr: Option<String>,

    #[arg(long, env = "SWAP_CLN_SOCKET")]
    cln_socket: Option<PathBuf>,

    #[arg(long)]
    poll_interval_secs: Option<u64>,

    #[arg(long)]
    min_swap_sats: Option<u64>,

    #[arg(long)]
    max_swap_sats: Option<u64>,

    #[arg(long)]
    accept_zero_conf: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Starts a job, or resumes it when the id is already known.
    Execute {
        #[arg(long)]
        job_id: u32,

        /// e.g. '{"target":"InboundLiquidityNodePercent","percentage":90}'
        #[arg(long, default_value = "")]
        target: String,
    },
    Status {
        #[arg(long)]
        job_id: u32,
    },
    List {
        #[arg(long)]
        unfinished: bool,
    },
    /// Resumes every unfinished job in the store.
    Resume,
    /// Lists the exchange's Lightning nodes.
    Nodes,
    GenerateSeed,
}

#[tokio::main]
async fn main() -> Result<()> {
    ln_liquidity_swap::logging::init().ok();
    let args = Args::parse();

    match &args.command {
        Command::GenerateSeed => {
            emit(&json!({ "master_seed": MasterSeed::generate().to_hex() }))?;
            Ok(())
        }
        Command::Status { job_id } => {
            let store = JobStore::connect(&args.store_path).context("open job store")?;
            let job = store.get(JobId(*job_id)).context("get job")?;
            store.close().ok();
            match job {
                Some(job) => emit(&job),
                None => anyhow::bail!("job {job_id} not found"),
            }
        }
        Command::List { unfinished } => {
            let store = JobStore::connect(&args.store_path).context("open job store")?;
            let jobs = if *unfinished {
                store.list_unfinished()
            } else {
                store.list_jobs()
            }
            .context("list jobs")?;
            store.close().ok();
            for job in jobs {
                emit(&job)?;
            }
            Ok(())
        }
        Command::Nodes => {
            let exchange = exchange_client(&args)?;
            let nodes = exchange
                .get_nodes()
                .await
                .context("get exchange nodes")?;
            emit(&nodes)
        }
        Command::Execute { job_id, target } => {
            let engine = build_engine(&args).await?;
            let cancel = cancel_on_ctrl_c();
            let sink = JsonLinesSink;
            let outcome = engine
                .execute_with_cancel(JobId(*job_id), target.as_bytes(), &sink, cancel)
                .await;
            engine.store().close().ok();
            emit(&json!({ "outcome": outcome? }))
        }
        Command::Resume => {
            let engine = build_engine(&args).await?;
            let cancel = cancel_on_ctrl_c();
            let handles = engine.resume_unfinished(Arc::new(JsonLinesSink), cancel)?;

            let mut outcomes: Vec<JobOutcome> = Vec::new();
            for (job_id, handle) in handles {
                match handle.await.context("join job task")? {
                    Ok(outcome) => outcomes.push(outcome),
                    Err(err) => tracing::warn!(job_id = %job_id, error = %err, "job stopped"),
                }
            }
            engine.store().close().ok();
            emit(&json!({ "outcomes": outcomes }))
        }
    }
}

struct JsonLinesSink;

impl LogSink for JsonLinesSink {
    fn log(&self, msg: LogMessage) -> Result<()> {
        emit(&msg)
    }
}

fn emit(value: &impl serde::Serialize) -> Result<()> {
    let line = serde_json::to_string(value).context("encode json line")?;
    let mut out = std::io::stdout().lock();
    writeln!(out, "{line}").context("write stdout")?;
    out.flush().context("flush stdout")
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, stopping after the current step");
            on_signal.cancel();
        }
    });
    cancel
}

fn swap_config(args: &Args) -> Result<SwapConfig> {
    let mut cfg = match &args.config {
        Some(path) => {
            let raw = std::fs::read(path)
                .with_context(|| format!("read config {}", path.display()))?;
            serde_json::from_slice(&raw)
                .with_context(|| format!("parse config {}", path.display()))?
        }
        None => SwapConfig::default(),
    };

    if let Some(network) = args.network {
        cfg.network = network;
    }
    if let Some(secs) = args.poll_interval_secs {
        cfg.poll_interval = Duration::from_secs(secs);
    }
    if let Some(sats) = args.min_swap_sats {
        cfg.min_swap_sats = sats;
    }
    if let Some(sats) = args.max_swap_sats {
        cfg.max_swap_sats = sats;
    }
    if args.accept_zero_conf {
        cfg.accept_zero_conf = true;
    }
    cfg.validate().context("validate config")?;
    Ok(cfg)
}

fn exchange_client(args: &Args) -> Result<BoltzClient> {
    BoltzClient::new(args.exchange_url.clone(), Duration::from_secs(30))
        .context("create exchange client")
}

fn node_adapter(args: &Args) -> Result<Arc<dyn NodeAdapter>> {
    Ok(match args.node_backend {
        NodeBackend::Ldk => {
            let addr = args
                .ldk_rest_addr
                .clone()
                .context("--ldk-rest-addr is required for the ldk backend")?;
            Arc::new(LdkLightningClient::new(addr))
        }
        NodeBackend::Cln => {
            let socket = args
                .cln_socket
                .clone()
                .context("--cln-socket is required for the cln backend")?;
            Arc::new(ClnSocketClient::new(socket))
        }
    })
}

async fn build_engine(args: &Args) -> Result<ExecutionEngine> {
    let cfg = swap_config(args)?;
    let seed = args
        .master_seed
        .as_deref()
        .context("--master-seed (or SWAP_MASTER_SEED) is required")
        .and_then(MasterSeed::from_hex)?;

    let exchange = exchange_client(args)?;
    match exchange.get_nodes().await {
        Ok(nodes) => {
            for (currency, node) in &nodes.nodes {
                tracing::info!(currency = %currency, node_key = %node.node_key, "exchange node");
            }
        }
        Err(err) => tracing::warn!(error = %err, url = %exchange.base_url(), "exchange not reachable"),
    }

    let node = node_adapter(args)?;
    match node.get_info().await {
        Ok(info) => tracing::info!(
            alias = %info.alias,
            pubkey = %info.pubkey,
            block_height = info.block_height,
            "lightning node ready"
        ),
        Err(err) => tracing::warn!(error = %err, "lightning node not reachable"),
    }

    let store = Arc::new(JobStore::connect(&args.store_path).context("open job store")?);
    ExecutionEngine::new(store, node, Arc::new(exchange), &seed, cfg).context("create engine")
}
