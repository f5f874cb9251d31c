//! BlobIO CLI - Operator Command Line Interface
//!
//! Prints resolved client configuration and runs smoke workloads through
//! the full client data path against in-memory storage nodes.

use anyhow::{Context, Result, bail};
use blobio_client::testing::{CountingConnector, MemoryCluster};
use blobio_client::{
    BlobClient, BlobDescriptor, BlobStream, DispatchStats, IoCompletion, LatencyHistogram,
    NodeConnectionPool, PrometheusExporter, StaticRouter, TransportKind, shared_pool,
};
use blobio_common::{BlobId, ClientConfig, ExtentId, IoKind, NodeAddr, NodeId, RouteEntry};
use bytes::{Bytes, BytesMut};
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "blobio-cli")]
#[command(about = "BlobIO client operator CLI")]
#[command(version)]
struct Args {
    /// Client configuration file (TOML); defaults apply when omitted
    #[arg(short, long, env = "BLOBIO_CONFIG")]
    config: Option<PathBuf>,

    /// Log level, overridden by RUST_LOG
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the resolved configuration
    Config,
    /// Run a read/write workload against in-memory storage nodes
    Smoke(SmokeArgs),
}

#[derive(clap::Args, Debug)]
struct SmokeArgs {
    /// Blob size in bytes
    #[arg(long, default_value_t = 256 * 1024 * 1024)]
    blob_size: u64,

    /// Writes to issue; each is read back afterwards
    #[arg(long, default_value_t = 1000)]
    ops: usize,

    /// Bytes per request
    #[arg(long, default_value_t = 64 * 1024)]
    io_size: u64,

    /// In-memory storage nodes; extents are spread round-robin
    #[arg(long, default_value_t = 3)]
    nodes: u64,

    /// Issue through the null transport instead of the nodes
    #[arg(long)]
    null_transport: bool,

    /// Random seed for offsets and payloads
    #[arg(long)]
    seed: Option<u64>,

    /// Print Prometheus text after the run
    #[arg(long)]
    metrics: bool,
}

fn load_config(path: Option<&PathBuf>) -> Result<ClientConfig> {
    match path {
        Some(path) => ClientConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Ok(ClientConfig::default()),
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(args.config.as_ref())?;

    // Initialize logging
    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    let registry = tracing_subscriber::registry().with(
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| log_level.into()),
    );
    if args.log_json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    match args.command {
        Commands::Config => {
            config.validate().context("invalid configuration")?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
        Commands::Smoke(smoke) => run_smoke(config, &smoke),
    }
}

fn run_smoke(config: ClientConfig, args: &SmokeArgs) -> Result<()> {
    if args.io_size == 0 || args.io_size > config.stream.max_io_size {
        bail!(
            "--io-size must be in 1..={} (stream.max_io_size)",
            config.stream.max_io_size
        );
    }
    if args.nodes == 0 {
        bail!("--nodes must be at least 1");
    }
    let slots = (args.blob_size / args.io_size).saturating_sub(1);
    if (args.ops as u64) > slots {
        bail!(
            "--ops {} exceeds the {slots} non-overlapping slots of a {}-byte blob",
            args.ops,
            args.blob_size
        );
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("blobio-rt")
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    let blob_id = BlobId::new(1);
    let cluster = MemoryCluster::new();
    let router = Arc::new(StaticRouter::new());
    let extent_count = args.blob_size.div_ceil(config.stream.extent_size);
    for n in 0..args.nodes {
        cluster.add_node(NodeAddr::new(NodeId::new(n + 1), "127.0.0.1", 7000 + n as u16));
    }
    for index in 1..=extent_count {
        let node = (index - 1) % args.nodes + 1;
        let addr = NodeAddr::new(NodeId::new(node), "127.0.0.1", 7000 + (node - 1) as u16);
        let index = u32::try_from(index).context("blob has too many extents")?;
        router.set_route(ExtentId::new(blob_id, index), RouteEntry::primary_only(addr));
    }

    let client = BlobClient::new(
        config,
        router,
        shared_pool(NodeConnectionPool::new(CountingConnector::new(cluster))),
        runtime.handle().clone(),
    )?;
    let transport = if args.null_transport {
        TransportKind::Null
    } else {
        TransportKind::Live
    };
    let blob = client.open_with(
        BlobDescriptor {
            blob_id,
            name: "smoke".to_string(),
            size: args.blob_size,
            pool_id: 0,
            user_id: 0,
        },
        transport,
    )?;

    let seed = args.seed.unwrap_or_else(rand::random);
    info!(seed, ops = args.ops, io_size = args.io_size, %transport, "starting smoke run");
    let mut rng = StdRng::seed_from_u64(seed);

    // Half-slot shift so some requests straddle extent boundaries
    let shift = args.io_size / 2;
    let mut offsets: Vec<u64> = (0..slots).map(|s| s * args.io_size + shift).collect();
    offsets.shuffle(&mut rng);
    offsets.truncate(args.ops);
    let payloads: Vec<Bytes> = offsets
        .iter()
        .map(|_| {
            let mut data = vec![0u8; args.io_size as usize];
            rng.fill(&mut data[..]);
            Bytes::from(data)
        })
        .collect();

    let started = Instant::now();
    let writes = run_phase(&blob, IoKind::Write, &offsets, &payloads, args.io_size)?;
    let expected = expected_reads(transport, payloads, args.io_size);
    let reads = run_phase(&blob, IoKind::Read, &offsets, &expected, args.io_size)?;
    let elapsed = started.elapsed();

    let stats = client.dispatch_stats();
    print_summary(&blob, &stats, elapsed, writes, reads);
    if args.metrics {
        print!(
            "{}",
            PrometheusExporter::default().export(&[&blob], Some(&stats))
        );
    }

    blob.close();
    client.shutdown();

    let failures = writes.failed + reads.failed + reads.mismatched;
    if failures > 0 {
        bail!("{failures} requests failed or returned wrong data");
    }
    Ok(())
}

/// What reads should return after the write phase
fn expected_reads(transport: TransportKind, written: Vec<Bytes>, io_size: u64) -> Vec<Bytes> {
    match transport {
        TransportKind::Live => written,
        // The null transport stores nothing and reads back zeroes
        TransportKind::Null => vec![Bytes::from(vec![0u8; io_size as usize]); written.len()],
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct PhaseResult {
    completed: usize,
    failed: usize,
    mismatched: usize,
}

/// Issue one request per offset and wait for every callback.
///
/// Writes send `payloads[i]`; reads are checked against it.
fn run_phase(
    blob: &BlobStream,
    kind: IoKind,
    offsets: &[u64],
    payloads: &[Bytes],
    io_size: u64,
) -> Result<PhaseResult> {
    let (tx, rx) = crossbeam_channel::unbounded::<(usize, IoCompletion)>();
    for (i, (&offset, payload)) in offsets.iter().zip(payloads).enumerate() {
        let tx = tx.clone();
        let callback = move |completion: IoCompletion| {
            let _ = tx.send((i, completion));
        };
        match kind {
            IoKind::Write => blob.async_write(payload.clone(), offset, callback)?,
            IoKind::Read => blob.async_read(BytesMut::zeroed(io_size as usize), offset, callback)?,
        }
    }
    drop(tx);

    let mut result = PhaseResult::default();
    for _ in 0..offsets.len() {
        let (i, completion) = rx
            .recv_timeout(Duration::from_secs(60))
            .context("timed out waiting for completions")?;
        result.completed += 1;
        if let Err(e) = &completion.result {
            warn!(offset = offsets[i], %kind, "request failed: {e}");
            result.failed += 1;
            continue;
        }
        if let Some(buf) = &completion.buffer
            && buf[..] != payloads[i][..]
        {
            result.mismatched += 1;
        }
    }
    Ok(result)
}

fn print_latency(label: &str, histogram: &LatencyHistogram) {
    let p = histogram.percentiles();
    println!(
        "  {label:<14} n={:<8} avg={}us p50<={}us p99<={}us max={}us",
        histogram.count(),
        p.avg,
        p.p50,
        p.p99,
        p.max
    );
}

fn print_summary(
    blob: &BlobStream,
    dispatch: &DispatchStats,
    elapsed: Duration,
    writes: PhaseResult,
    reads: PhaseResult,
) {
    let stats = blob.stats();
    let total_bytes = stats.read_bytes() + stats.write_bytes();
    let secs = elapsed.as_secs_f64().max(f64::EPSILON);

    println!("Smoke Run");
    println!("=========");
    println!("Transport:     {}", blob.transport_kind());
    println!("Elapsed:       {:.3}s", elapsed.as_secs_f64());
    println!(
        "Writes:        {} ok, {} failed",
        writes.completed - writes.failed,
        writes.failed
    );
    println!(
        "Reads:         {} ok, {} failed, {} mismatched",
        reads.completed - reads.failed,
        reads.failed,
        reads.mismatched
    );
    println!("Split ops:     {}", stats.split_ops());
    println!("Checksum errs: {}", stats.checksum_errors());
    println!(
        "Throughput:    {:.1} MiB/s",
        total_bytes as f64 / secs / (1024.0 * 1024.0)
    );
    println!("Latency:");
    print_latency("read", stats.read_latency());
    print_latency("write", stats.write_latency());
    println!("Dispatch:");
    println!(
        "  pushed={} issued={} expired={} full_retries={}",
        dispatch.pushed(),
        dispatch.issued(),
        dispatch.expired(),
        dispatch.full_retries()
    );
    print_latency("queue wait", dispatch.queue_wait());
    print_latency("issue", dispatch.issue_cost());
    print_latency("callback", dispatch.callback_cost());
}
