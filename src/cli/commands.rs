//! CLI command definitions for set-forge.
//!
//! Every command starts a scheduler over the reference annealing kernel,
//! runs its workload, and shuts the scheduler down before returning.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::aggregate::{ResultAggregator, ScoredResult};
use crate::kernel::AnnealingKernel;
use crate::metrics::{export_metrics, init_metrics};
use crate::scheduler::{QueueOrder, Scheduler, SchedulerConfig, SchedulerStats};

/// Default number of jobs submitted by `bench`.
const DEFAULT_BENCH_JOBS: usize = 32;

/// How long `optimise` waits for the pool to start before sizing its batch.
const UNIT_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

/// How often `continuous` checks whether its slots stopped on their own.
const FINISH_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Equipment set optimiser backed by a pool of solver kernels.
#[derive(Parser)]
#[command(name = "set-forge")]
#[command(about = "Search for high-scoring equipment sets on a pool of solver kernels")]
#[command(version)]
#[command(
    long_about = "set-forge dispatches optimisation jobs to a pool of isolated solver kernels.\n\nExample usage:\n  set-forge optimise --request request.json --attempts 8\n  set-forge continuous --duration 30\n  set-forge lookup slot 3"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Print Prometheus metrics after the command finishes.
    #[arg(long, global = true)]
    pub metrics: bool,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run a batch of optimisations and print the best set.
    #[command(alias = "opt")]
    Optimise(OptimiseArgs),

    /// Keep optimising until the duration elapses or Ctrl-C, printing improvements.
    Continuous(ContinuousArgs),

    /// Query the kernel's catalogue.
    Lookup(LookupArgs),

    /// Measure job throughput.
    Bench(BenchArgs),
}

/// Scheduler options shared by every command. Flags override `SCHEDULER_*`
/// environment variables.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct PoolArgs {
    /// Number of execution units.
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Queue order for pending jobs (lifo or fifo).
    #[arg(long)]
    pub queue_order: Option<QueueOrder>,

    /// Response field used to rank results.
    #[arg(long)]
    pub score_field: Option<String>,
}

/// Request options shared by the optimising commands.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct RequestArgs {
    /// JSON file holding the optimise request. Uses a demo request when omitted.
    #[arg(short = 'r', long, env = "SET_FORGE_REQUEST")]
    pub request: Option<PathBuf>,

    /// Override the request's iteration count.
    #[arg(long)]
    pub iterations: Option<u64>,

    /// Override the request's random seed.
    #[arg(long)]
    pub seed: Option<u64>,
}

/// Arguments for `set-forge optimise`.
#[derive(clap::Args, Debug)]
pub struct OptimiseArgs {
    #[command(flatten)]
    pub pool: PoolArgs,

    #[command(flatten)]
    pub request: RequestArgs,

    /// Number of independent runs (default: number of free units).
    #[arg(short = 'k', long)]
    pub attempts: Option<usize>,

    /// Print the full result as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Arguments for `set-forge continuous`.
#[derive(clap::Args, Debug)]
pub struct ContinuousArgs {
    #[command(flatten)]
    pub pool: PoolArgs,

    #[command(flatten)]
    pub request: RequestArgs,

    /// Concurrent optimisation loops (default: pool size).
    #[arg(short = 's', long)]
    pub slots: Option<usize>,

    /// Stop after this many seconds. Runs until Ctrl-C when omitted.
    #[arg(short = 'd', long)]
    pub duration: Option<u64>,

    /// Print the final result as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Arguments for `set-forge lookup`.
#[derive(clap::Args, Debug)]
pub struct LookupArgs {
    #[command(subcommand)]
    pub target: LookupTarget,

    #[command(flatten)]
    pub pool: PoolArgs,
}

/// What to look up.
#[derive(clap::Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum LookupTarget {
    /// Items that fit one equipment slot (0-15).
    Slot {
        /// Slot index.
        slot: u32,
    },
    /// Every item in the catalogue.
    Catalog,
    /// Spells the kernel knows.
    Spells,
}

/// Arguments for `set-forge bench`.
#[derive(clap::Args, Debug)]
pub struct BenchArgs {
    #[command(flatten)]
    pub pool: PoolArgs,

    #[command(flatten)]
    pub request: RequestArgs,

    /// Number of optimise jobs to run.
    #[arg(short = 'n', long, default_value_t = DEFAULT_BENCH_JOBS)]
    pub jobs: usize,
}

/// Throughput report printed by `bench`.
#[derive(Debug, Serialize)]
struct BenchReport {
    jobs: usize,
    succeeded: usize,
    failed: usize,
    elapsed_secs: f64,
    jobs_per_sec: f64,
    best_energy: Option<f64>,
    scheduler: SchedulerStats,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
///
/// For more control over logging initialization, use `parse_cli()` and `run_with_cli()`.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    if cli.metrics {
        init_metrics().context("Failed to initialize metrics")?;
    }

    match cli.command {
        Commands::Optimise(args) => run_optimise_command(args).await?,
        Commands::Continuous(args) => run_continuous_command(args).await?,
        Commands::Lookup(args) => run_lookup_command(args).await?,
        Commands::Bench(args) => run_bench_command(args).await?,
    }

    if cli.metrics {
        print!("{}", export_metrics());
    }
    Ok(())
}

/// Builds the scheduler configuration: defaults, then environment, then flags.
pub fn build_config(args: &PoolArgs) -> anyhow::Result<SchedulerConfig> {
    let mut config = SchedulerConfig::from_env().context("Invalid scheduler environment")?;

    if let Some(workers) = args.workers {
        config = config.with_target_size(workers);
    }
    if let Some(order) = args.queue_order {
        config = config.with_queue_order(order);
    }
    if let Some(field) = &args.score_field {
        config = config.with_score_field(field.clone());
    }

    config.validate()?;
    Ok(config)
}

fn start_scheduler(args: &PoolArgs) -> anyhow::Result<Scheduler> {
    let config = build_config(args)?;
    info!(workers = config.target_size, "Starting solver pool");
    Ok(Scheduler::start(config, Arc::new(AnnealingKernel::new))?)
}

/// Demo request used when no request file is given.
pub fn default_request() -> Value {
    json!({
        "weights": [1.0, 0.5, 1.0, 1.0, 1.0, 1.0, 50.0, 40.0],
        "maxLevel": 200,
        "bannedItems": [],
        "iterations": 2000,
        "initialTemperature": 500.0
    })
}

/// Loads an optimise request and applies command-line overrides.
pub fn load_request(args: &RequestArgs) -> anyhow::Result<Value> {
    let mut request = match &args.request {
        Some(path) => read_request(path)?,
        None => default_request(),
    };

    let Some(fields) = request.as_object_mut() else {
        anyhow::bail!("Optimise request must be a JSON object");
    };
    if let Some(iterations) = args.iterations {
        fields.insert("iterations".to_string(), json!(iterations));
    }
    if let Some(seed) = args.seed {
        fields.insert("seed".to_string(), json!(seed));
    }

    Ok(request)
}

fn read_request(path: &Path) -> anyhow::Result<Value> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read request file {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse request file {}", path.display()))
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn run_optimise_command(args: OptimiseArgs) -> anyhow::Result<()> {
    let request = load_request(&args.request)?;
    let scheduler = start_scheduler(&args.pool)?;

    // Batch sizing reads the free-unit count, so let the pool finish starting.
    wait_for_units(&scheduler, UNIT_STARTUP_TIMEOUT).await;

    let aggregator = ResultAggregator::new(scheduler.clone());
    let outcome = aggregator
        .run_batch(request, args.attempts, &CancellationToken::new())
        .await;
    scheduler.shutdown().await;
    let outcome = outcome?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        println!(
            "Best energy {:.1} ({} of {} runs succeeded)",
            outcome.best.score, outcome.progress.succeeded, outcome.attempts
        );
        print_set(&outcome.best);
    }
    Ok(())
}

async fn run_continuous_command(args: ContinuousArgs) -> anyhow::Result<()> {
    let request = load_request(&args.request)?;
    let scheduler = start_scheduler(&args.pool)?;
    let aggregator = ResultAggregator::new(scheduler.clone());

    let run = aggregator.run_continuous(request, args.slots, &CancellationToken::new());
    let mut best = run.subscribe();

    let deadline = async {
        match args.duration {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut poll = tokio::time::interval(FINISH_POLL_INTERVAL);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupted, stopping");
                break;
            }
            _ = &mut deadline => break,
            changed = best.changed() => {
                if changed.is_err() {
                    break;
                }
                if let Some(score) = best.borrow_and_update().as_ref().map(|b| b.score) {
                    println!("New best energy {:.1}", score);
                }
            }
            _ = poll.tick() => {
                if run.is_finished() {
                    warn!("All optimisation loops stopped on their own");
                    break;
                }
            }
        }
    }

    run.cancel();
    let summary = run.join().await;
    scheduler.shutdown().await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!(
        "{} runs completed, {} succeeded, {} failed",
        summary.progress.completed, summary.progress.succeeded, summary.progress.failed
    );
    match &summary.best {
        Some(best) => {
            println!("Best energy {:.1}", best.score);
            print_set(best);
        }
        None => println!("No result found"),
    }
    Ok(())
}

async fn run_lookup_command(args: LookupArgs) -> anyhow::Result<()> {
    let scheduler = start_scheduler(&args.pool)?;

    let handle = match args.target {
        LookupTarget::Slot { slot } => scheduler.items_in_slot(slot),
        LookupTarget::Catalog => scheduler.catalog(),
        LookupTarget::Spells => scheduler.spells(),
    };
    let result = handle.await;
    scheduler.shutdown().await;

    let response = result.context("Lookup failed")?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

async fn run_bench_command(args: BenchArgs) -> anyhow::Result<()> {
    let request = load_request(&args.request)?;
    let scheduler = start_scheduler(&args.pool)?;
    let cancel = CancellationToken::new();

    let started = Instant::now();
    let handles: Vec<_> = (0..args.jobs)
        .map(|_| scheduler.optimise(request.clone(), &cancel))
        .collect();
    let outcomes = futures::future::join_all(handles).await;
    let elapsed = started.elapsed().as_secs_f64();

    let field = scheduler.config().score_field.clone();
    let succeeded = outcomes.iter().filter(|outcome| outcome.is_ok()).count();
    let best_energy = outcomes
        .iter()
        .filter_map(|outcome| outcome.as_ref().ok())
        .filter_map(|response| response.get(field.as_str()).and_then(Value::as_f64))
        .reduce(f64::max);

    let report = BenchReport {
        jobs: args.jobs,
        succeeded,
        failed: args.jobs - succeeded,
        elapsed_secs: elapsed,
        jobs_per_sec: if elapsed > 0.0 {
            args.jobs as f64 / elapsed
        } else {
            0.0
        },
        best_energy,
        scheduler: scheduler.stats(),
    };
    scheduler.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Waits until every unit the pool wants is up and none is still initializing.
///
/// Gives up early when the pool is exhausted or the scheduler closed.
async fn wait_for_units(scheduler: &Scheduler, timeout: Duration) {
    let mut stats = scheduler.subscribe();
    let ready = stats.wait_for(|s| {
        let started = s.pool.initializing == 0 && s.pool.units >= s.pool.target_size;
        started || s.pool.exhausted || s.closed
    });
    if tokio::time::timeout(timeout, ready).await.is_err() {
        warn!(
            free_units = scheduler.free_unit_count(),
            "Execution units did not all start in time"
        );
    }
}

fn print_set(result: &ScoredResult) {
    let Some(items) = result.response.get("items").and_then(Value::as_array) else {
        return;
    };
    for (slot, item) in items.iter().enumerate() {
        if item.is_null() {
            continue;
        }
        println!(
            "  slot {:>2}  {} (level {})",
            slot,
            item["name"].as_str().unwrap_or("?"),
            item["level"]
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::io::Write;

    #[test]
    fn test_cli_parses() {
        // Verify CLI definition is valid
        Cli::command().debug_assert();
    }

    #[test]
    fn test_optimise_command_defaults() {
        let cli = Cli::try_parse_from(["set-forge", "optimise"]).expect("should parse");

        assert_eq!(cli.log_level, "info");
        assert!(!cli.metrics);
        match cli.command {
            Commands::Optimise(args) => {
                assert!(args.pool.workers.is_none());
                assert!(args.request.request.is_none());
                assert!(args.attempts.is_none());
                assert!(!args.json);
            }
            _ => panic!("Expected Optimise command"),
        }
    }

    #[test]
    fn test_optimise_command_with_all_options() {
        let cli = Cli::try_parse_from([
            "set-forge",
            "opt",
            "-w",
            "4",
            "--queue-order",
            "fifo",
            "--score-field",
            "score",
            "-r",
            "request.json",
            "--iterations",
            "500",
            "--seed",
            "9",
            "-k",
            "6",
            "--json",
            "--metrics",
            "--log-level",
            "debug",
        ])
        .expect("should parse");

        assert!(cli.metrics);
        assert_eq!(cli.log_level, "debug");
        match cli.command {
            Commands::Optimise(args) => {
                assert_eq!(args.pool.workers, Some(4));
                assert_eq!(args.pool.queue_order, Some(QueueOrder::Fifo));
                assert_eq!(args.pool.score_field.as_deref(), Some("score"));
                assert_eq!(args.request.request, Some(PathBuf::from("request.json")));
                assert_eq!(args.request.iterations, Some(500));
                assert_eq!(args.request.seed, Some(9));
                assert_eq!(args.attempts, Some(6));
                assert!(args.json);
            }
            _ => panic!("Expected Optimise command"),
        }
    }

    #[test]
    fn test_continuous_and_bench_commands() {
        let cli = Cli::try_parse_from(["set-forge", "continuous", "-d", "30", "-s", "2"])
            .expect("should parse");
        match cli.command {
            Commands::Continuous(args) => {
                assert_eq!(args.duration, Some(30));
                assert_eq!(args.slots, Some(2));
            }
            _ => panic!("Expected Continuous command"),
        }

        let cli = Cli::try_parse_from(["set-forge", "bench"]).expect("should parse");
        match cli.command {
            Commands::Bench(args) => assert_eq!(args.jobs, DEFAULT_BENCH_JOBS),
            _ => panic!("Expected Bench command"),
        }
    }

    #[test]
    fn test_lookup_targets() {
        let cli = Cli::try_parse_from(["set-forge", "lookup", "slot", "3"]).expect("should parse");
        match cli.command {
            Commands::Lookup(args) => assert_eq!(args.target, LookupTarget::Slot { slot: 3 }),
            _ => panic!("Expected Lookup command"),
        }

        assert!(Cli::try_parse_from(["set-forge", "lookup", "spells"]).is_ok());
        assert!(Cli::try_parse_from(["set-forge", "lookup", "catalog"]).is_ok());
        assert!(Cli::try_parse_from(["set-forge", "lookup", "slot"]).is_err());
    }

    #[test]
    fn test_invalid_queue_order_rejected() {
        let result = Cli::try_parse_from(["set-forge", "bench", "--queue-order", "random"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_load_default_request_with_overrides() {
        let args = RequestArgs {
            request: None,
            iterations: Some(50),
            seed: Some(7),
        };
        let request = load_request(&args).expect("default request loads");

        assert_eq!(request["iterations"], 50);
        assert_eq!(request["seed"], 7);
        assert_eq!(request["weights"].as_array().map(Vec::len), Some(8));
    }

    #[test]
    fn test_load_request_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(file, r#"{{"weights": [1, 1, 1, 1, 1, 1, 1, 1], "maxLevel": 50}}"#)
            .expect("write request");

        let args = RequestArgs {
            request: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        let request = load_request(&args).expect("file request loads");
        assert_eq!(request["maxLevel"], 50);
        assert!(request.get("seed").is_none());
    }

    #[test]
    fn test_load_request_errors() {
        let dir = tempfile::tempdir().expect("temp dir");

        let missing = RequestArgs {
            request: Some(dir.path().join("missing.json")),
            ..Default::default()
        };
        let err = load_request(&missing).expect_err("missing file");
        assert!(err.to_string().contains("Failed to read"));

        let path = dir.path().join("list.json");
        std::fs::write(&path, "[1, 2, 3]").expect("write");
        let not_object = RequestArgs {
            request: Some(path),
            ..Default::default()
        };
        let err = load_request(&not_object).expect_err("arrays are not requests");
        assert!(err.to_string().contains("JSON object"));

        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ weights").expect("write");
        let broken = RequestArgs {
            request: Some(path),
            ..Default::default()
        };
        let err = load_request(&broken).expect_err("invalid JSON");
        assert!(err.to_string().contains("Failed to parse"));
    }

    #[test]
    fn test_build_config_applies_flags() {
        let args = PoolArgs {
            workers: Some(3),
            queue_order: Some(QueueOrder::Fifo),
            score_field: Some("score".to_string()),
        };
        let config = build_config(&args).expect("valid config");

        assert_eq!(config.target_size, 3);
        assert_eq!(config.queue_order, QueueOrder::Fifo);
        assert_eq!(config.score_field, "score");

        let args = PoolArgs {
            score_field: Some(String::new()),
            ..Default::default()
        };
        assert!(build_config(&args).is_err());
    }

    /// The first unit starts at once, the others take a while to initialize.
    struct StaggeredStart {
        delay: Duration,
        broken: bool,
    }

    impl crate::kernel::SolverKernel for StaggeredStart {
        fn initialize(&mut self) -> Result<(), crate::error::KernelError> {
            std::thread::sleep(self.delay);
            if self.broken {
                return Err(crate::error::KernelError::Fatal("no catalogue".to_string()));
            }
            Ok(())
        }

        fn run(
            &mut self,
            _kind: crate::scheduler::JobKind,
            _payload: Value,
            _stop: &CancellationToken,
        ) -> Result<Value, crate::error::KernelError> {
            Ok(json!({ "energy": 1.0 }))
        }
    }

    fn staggered_scheduler(config: SchedulerConfig, broken: bool) -> Scheduler {
        let started = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        Scheduler::start(
            config,
            Arc::new(move || {
                let index = started.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                let delay = if index == 0 { 0 } else { 300 };
                StaggeredStart {
                    delay: Duration::from_millis(delay),
                    broken,
                }
            }),
        )
        .expect("valid config")
    }

    #[tokio::test]
    async fn test_default_batch_uses_every_started_unit() {
        let scheduler = staggered_scheduler(SchedulerConfig::new(4), false);

        wait_for_units(&scheduler, Duration::from_secs(5)).await;
        assert_eq!(scheduler.free_unit_count(), 4);

        let outcome = ResultAggregator::new(scheduler.clone())
            .run_batch(json!({}), None, &CancellationToken::new())
            .await
            .expect("every run succeeds");
        assert_eq!(outcome.attempts, 4);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_wait_for_units_gives_up_on_exhausted_pool() {
        let config = SchedulerConfig::new(2).with_max_init_failures(2);
        let scheduler = staggered_scheduler(config, true);

        tokio::time::timeout(
            Duration::from_secs(5),
            wait_for_units(&scheduler, Duration::from_secs(60)),
        )
        .await
        .expect("returns once the pool stops respawning");
        assert!(scheduler.stats().pool.exhausted);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_lookup_spells_end_to_end() {
        let cli = Cli::try_parse_from(["set-forge", "lookup", "-w", "1", "spells"])
            .expect("should parse");
        run_with_cli(cli).await.expect("lookup succeeds");
    }

    #[tokio::test]
    async fn test_lookup_out_of_range_slot_fails() {
        let cli = Cli::try_parse_from(["set-forge", "lookup", "-w", "1", "slot", "16"])
            .expect("should parse");
        let err = run_with_cli(cli).await.expect_err("slot 16 does not exist");
        assert!(format!("{:#}", err).contains("out of range"));
    }
}
