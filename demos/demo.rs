//! Demo application: concurrent writers on sharded counters, then export.
//!
//! Run with:
//! ```bash
//! cargo run --example demo --features demo -- --help
//! RUST_LOG=shardtally=debug cargo run --example demo --features demo -- --threads 16
//! ```

use std::error::Error;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::{Parser, ValueEnum};
use shardtally::context::Context;
use shardtally::engine::CounterEngine;
use shardtally::observers::json::JsonObserver;
use shardtally::observers::prometheus::{MetricType, PrometheusObserver};
use shardtally::snapshot::MetricsSnapshot;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Output format for the final snapshot.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    /// One `name = value (shards)` line per counter
    Plain,
    /// JSON format
    Json,
    /// Prometheus exposition format
    Prometheus,
}

/// Demo application for shardtally - sharded counters with a cached aggregate.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Output format
    #[arg(short, long, value_enum, default_value = "plain")]
    format: OutputFormat,

    /// Number of writer threads
    #[arg(short, long, default_value = "8")]
    threads: usize,

    /// Increments per thread
    #[arg(short, long, default_value = "1000")]
    increments: usize,

    /// Shard fanout to configure before writing
    #[arg(short, long, default_value = "20")]
    shards: u32,

    /// Counter names to write to, round-robin per increment
    #[arg(short, long, value_delimiter = ',', default_value = "http_requests_total,jobs_done")]
    counters: Vec<String>,

    /// Abort the run after this many milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Pretty print JSON output
    #[arg(long)]
    pretty: bool,

    /// Prometheus metric namespace (prefix)
    #[arg(long, default_value = "demo")]
    namespace: String,

    /// Export each counter's fanout as an extra Prometheus gauge
    #[arg(long)]
    shard_gauges: bool,
}

fn simulate_traffic(engine: &Arc<CounterEngine>, ctx: &Context, args: &Args) -> shardtally::Result<()> {
    let counters = Arc::new(args.counters.clone());
    let mut handles = vec![];

    for i in 0..args.threads {
        let engine = Arc::clone(engine);
        let counters = Arc::clone(&counters);
        let ctx = ctx.clone();
        let iterations = args.increments;

        handles.push(thread::spawn(move || -> shardtally::Result<()> {
            for j in 0..iterations {
                let name = &counters[(i + j) % counters.len()];
                engine.increment(&ctx, name)?;
            }
            Ok(())
        }));
    }

    let mut outcome = Ok(());
    for handle in handles {
        match handle.join() {
            Ok(Err(err)) if outcome.is_ok() => outcome = Err(err),
            Ok(_) => {}
            Err(_) => eprintln!("writer thread panicked"),
        }
    }
    outcome
}

fn render_output(args: &Args, snapshot: &MetricsSnapshot) -> Result<String, Box<dyn Error>> {
    let output = match args.format {
        OutputFormat::Plain => snapshot
            .counters
            .iter()
            .map(|c| format!("{} = {} ({} shards)", c.name, c.value, c.shards))
            .collect::<Vec<_>>()
            .join("\n"),

        OutputFormat::Json => JsonObserver::new().pretty(args.pretty).render(snapshot)?,

        OutputFormat::Prometheus => {
            let mut observer = PrometheusObserver::new()
                .with_namespace(&args.namespace)
                .with_shard_gauges(args.shard_gauges);
            for name in &args.counters {
                if name.ends_with("_total") {
                    observer = observer.with_type(name, MetricType::Counter);
                }
            }
            observer.render(&snapshot.counters)?
        }
    };
    Ok(output)
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    if args.counters.is_empty() {
        return Err("at least one counter name is required".into());
    }

    let engine = Arc::new(CounterEngine::in_memory());
    let ctx = match args.timeout_ms {
        Some(ms) => Context::with_timeout(Duration::from_millis(ms)),
        None => Context::background(),
    };

    for name in &args.counters {
        engine.increase_shards(&ctx, name, args.shards)?;
    }

    let started = Instant::now();
    simulate_traffic(&engine, &ctx, &args)?;
    info!(
        threads = args.threads,
        increments = args.increments,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "simulation complete"
    );

    let names: Vec<&str> = args.counters.iter().map(String::as_str).collect();
    let snapshot = engine.snapshot(&Context::background(), names)?;
    println!("{}", render_output(&args, &snapshot)?);
    Ok(())
}
