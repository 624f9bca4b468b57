//! Order Simulator - drives the ordering pipeline with a lossy overlay feed.
//! Generates publisher chains, drops, duplicates and reorders their messages,
//! keeps (part of) the history in an in-memory replica, and verifies that the
//! ordered output of every chain is strictly increasing.

use anyhow::{bail, Result};
use chain_order::{
    ChainKey, Collaborators, Gap, MemoryReplica, Message, MessagePosition, OrderMessages,
    OrderingConfig, StreamPartId,
};
use clap::Parser;
use futures::StreamExt;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, trace, warn};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Number of publishers
    #[arg(short, long, default_value_t = 4)]
    publishers: usize,

    /// Chains per publisher
    #[arg(long, default_value_t = 1)]
    chains: usize,

    /// Messages per chain
    #[arg(short, long, default_value_t = 200)]
    messages: usize,

    /// Probability that the overlay drops a message
    #[arg(long, default_value_t = 0.05)]
    drop_rate: f64,

    /// Probability that the overlay delivers a message twice
    #[arg(long, default_value_t = 0.05)]
    duplicate_rate: f64,

    /// Size of the shuffle window used to reorder the feed
    #[arg(long, default_value_t = 8)]
    reorder_window: usize,

    /// Fraction of the history the storage replica retains
    #[arg(long, default_value_t = 1.0)]
    retention: f64,

    /// Delay between two inbound messages (ms)
    #[arg(long, default_value_t = 1)]
    feed_delay_ms: u64,

    /// RNG seed for a reproducible run
    #[arg(long)]
    seed: Option<u64>,

    /// JSON config file; otherwise the environment is used
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, env = "GAP_FILL_INITIAL_WAIT_MS")]
    initial_wait_ms: Option<u64>,

    #[arg(long, env = "GAP_FILL_RETRY_WAIT_MS")]
    retry_wait_ms: Option<u64>,

    #[arg(long, env = "GAP_FILL_MAX_REQUESTS")]
    max_requests: Option<u32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => OrderingConfig::load(path)?,
        None => OrderingConfig::from_env()?,
    };
    if let Some(ms) = args.initial_wait_ms { config.initial_wait_ms = ms; }
    if let Some(ms) = args.retry_wait_ms { config.retry_wait_ms = ms; }
    if let Some(n) = args.max_requests { config.max_requests_per_gap = n; }
    config.validate()?;

    let seed = args.seed.unwrap_or_else(|| rand::thread_rng().gen());
    let mut rng = StdRng::seed_from_u64(seed);
    info!("Simulating {} publishers x {} chains x {} messages (seed {})", args.publishers, args.chains, args.messages, seed);

    // 1. Generate chains and seed the replica
    let replica = Arc::new(MemoryReplica::new("replica-0"));
    let mut history = Vec::with_capacity(args.publishers * args.chains * args.messages);
    for p in 0..args.publishers {
        for c in 0..args.chains {
            let key = ChainKey::new(format!("publisher-{}", p), format!("chain-{}", c));
            let mut prev = None;
            for i in 0..args.messages {
                let position = MessagePosition::new(1_000 + (i as i64) * 10, (i % 3) as u32);
                let msg = Message::new(key.clone(), position, prev, format!("{}:{}", key, i).into_bytes());
                if rng.gen_bool(args.retention.clamp(0.0, 1.0)) {
                    replica.store(msg.clone());
                }
                prev = Some(position);
                history.push(msg);
            }
        }
    }

    // 2. Push it through a lossy, duplicating, reordering overlay
    history.sort_by_key(|m| m.position);
    let mut feed = Vec::with_capacity(history.len());
    for msg in &history {
        if rng.gen_bool(args.drop_rate.clamp(0.0, 1.0)) { continue; }
        if rng.gen_bool(args.duplicate_rate.clamp(0.0, 1.0)) { feed.push(msg.clone()); }
        feed.push(msg.clone());
    }
    for window in feed.chunks_mut(args.reorder_window.max(1)) {
        window.shuffle(&mut rng);
    }
    info!("Overlay feed: {} messages ({} in history)", feed.len(), history.len());

    // 3. Run the pipeline
    let (unfillable_tx, mut unfillable_rx) = mpsc::unbounded_channel::<Gap>();
    let (pipeline, mut ordered) = OrderMessages::new(
        StreamPartId::new("sim/stream", 0),
        config,
        Collaborators {
            fetcher: replica.clone(),
            resolver: replica.clone(),
            observer: Arc::new(unfillable_tx),
        },
    );
    let pipeline = Arc::new(pipeline);
    info!("Ordering {} with storage replica {}", pipeline.stream_part(), replica.name());

    let feeder = Arc::clone(&pipeline);
    let delay = Duration::from_millis(args.feed_delay_ms);
    tokio::spawn(async move {
        let src = futures::stream::iter(feed).then(move |msg| async move {
            tokio::time::sleep(delay).await;
            Ok::<_, Infallible>(msg)
        });
        feeder.add_messages(src).await;
    });

    let interrupt = Arc::clone(&pipeline);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Shutdown signal received. Destroying pipeline...");
            interrupt.destroy();
        }
    });

    // 4. Verify the ordered output
    let mut last_seen: HashMap<ChainKey, MessagePosition> = HashMap::new();
    let mut violations = 0u64;
    while let Some(item) = ordered.next().await {
        let msg = match item {
            Ok(msg) => msg,
            Err(e) => bail!("pipeline failed: {}", e),
        };
        trace!(chain = %msg.chain_key, position = %msg.position, payload = %hex::encode(&msg.payload[..msg.payload.len().min(16)]), "ordered");
        if let Some(prev) = last_seen.insert(msg.chain_key.clone(), msg.position) {
            if msg.position <= prev {
                warn!("Order violation on {}: {} after {}", msg.chain_key, msg.position, prev);
                violations += 1;
            }
        }
    }
    pipeline.stopped().await;

    let mut unfillable = 0;
    while let Ok(gap) = unfillable_rx.try_recv() {
        unfillable += 1;
        info!("Unfillable gap on {}: {:?} .. {}", gap.chain_key, gap.from, gap.to.position);
    }

    println!();
    print!("{}", pipeline.monitor().render_summary());
    println!("  Chains verified:     {}", last_seen.len());
    println!("  Unfillable reported: {}", unfillable);
    println!("  Replica requests:    {}", replica.request_count());
    println!("  Order violations:    {}\n", violations);

    if violations > 0 {
        bail!("{} order violations detected", violations);
    }
    Ok(())
}
