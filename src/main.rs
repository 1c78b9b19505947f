//! Taskmill command-line entry point: run the scheduler, print a dashboard
//! snapshot, or run a demo workload.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tracing::info;

use taskmill::util::init_telemetry;
use taskmill::{
    DashboardStats, HandlerRegistry, ManagerConfig, TaskManager, TaskPriority, TaskSpec,
};

#[derive(Parser)]
#[command(name = "taskmill", version, about = "Local, resource-aware job scheduler")]
struct Cli {
    /// Redis URL for the shared queue (overrides TASKMILL_REDIS_URL).
    #[arg(long)]
    redis_url: Option<String>,

    /// SQLite database path (overrides TASKMILL_DB_PATH).
    #[arg(long)]
    db_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler until interrupted.
    Start {
        /// Worker count; defaults to the resource monitor's recommendation.
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Print a one-shot dashboard snapshot and exit.
    Dashboard,
    /// Run the scheduler, submit a batch of demo tasks, and report.
    Example {
        /// Worker count; defaults to the resource monitor's recommendation.
        #[arg(long)]
        workers: Option<usize>,

        /// Monitoring cycles to print before stopping.
        #[arg(long, default_value_t = 15)]
        cycles: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_telemetry();
    let cli = Cli::parse();

    let mut config = ManagerConfig::from_env()?;
    if let Some(url) = cli.redis_url {
        config.redis_url = Some(url);
    }
    if let Some(path) = cli.db_path {
        config.db_path = Some(path);
    }

    match cli.command {
        Command::Start { workers } => run(config, workers).await,
        Command::Example { workers, cycles } => example(config, workers, cycles).await,
        Command::Dashboard => dashboard(config).await,
    }
}

async fn run(config: ManagerConfig, workers: Option<usize>) -> anyhow::Result<()> {
    let manager = Arc::new(TaskManager::new(config, demo_registry()).await?);
    let interval = manager.config().metrics_interval;
    manager.start(workers)?;

    info!("scheduler running; press ctrl-c to stop");
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            signal = &mut shutdown => {
                signal.context("failed to listen for shutdown signal")?;
                break;
            }
            () = tokio::time::sleep(interval) => {
                let stats = manager.get_dashboard_stats().await?;
                println!("{}", render_dashboard(&stats));
            }
        }
    }

    manager.stop().await?;
    Ok(())
}

async fn example(
    config: ManagerConfig,
    workers: Option<usize>,
    cycles: u32,
) -> anyhow::Result<()> {
    let manager = Arc::new(TaskManager::new(config, demo_registry()).await?);
    manager.start(workers)?;

    submit_examples(&manager).await?;
    report_cycles(&manager, cycles).await?;

    manager.stop().await?;
    Ok(())
}

async fn dashboard(config: ManagerConfig) -> anyhow::Result<()> {
    let manager = TaskManager::new(config, HandlerRegistry::new()).await?;
    let stats = manager.get_dashboard_stats().await?;
    println!("{}", render_dashboard(&stats));
    Ok(())
}

/// Submit one task per demo handler across the priority tiers.
async fn submit_examples(manager: &TaskManager) -> anyhow::Result<()> {
    let mut health_kwargs = serde_json::Map::new();
    health_kwargs.insert("component".into(), json!("scheduler"));
    let mut content_kwargs = serde_json::Map::new();
    content_kwargs.insert("topic".into(), json!("release notes"));

    let specs = vec![
        TaskSpec::new("health check", "system_health_check")
            .with_kwargs(health_kwargs)
            .with_priority(TaskPriority::Critical),
        TaskSpec::new("fetch quotes", "market_data_fetch")
            .with_args(vec![json!(["AAPL", "MSFT", "NVDA"])])
            .with_priority(TaskPriority::High),
        TaskSpec::new("draft article", "content_generation")
            .with_kwargs(content_kwargs)
            .with_priority(TaskPriority::Medium),
        TaskSpec::new("publish update", "social_post")
            .with_args(vec![json!("Scheduled maintenance complete")])
            .with_priority(TaskPriority::Medium),
        TaskSpec::new("rollup analytics", "analytics_update").with_priority(TaskPriority::Low),
        TaskSpec::new("prune old rows", "database_cleanup").with_priority(TaskPriority::Batch),
    ];

    for spec in specs {
        let id = manager.submit_task(spec).await?;
        info!(task_id = %id, "example task submitted");
    }
    Ok(())
}

/// Print a dashboard snapshot every couple of seconds for up to `cycles`
/// iterations, ending early once the demo workload has drained.
async fn report_cycles(manager: &TaskManager, cycles: u32) -> anyhow::Result<()> {
    for _ in 0..cycles {
        tokio::time::sleep(Duration::from_secs(2)).await;
        let stats = manager.get_dashboard_stats().await?;
        println!("{}", render_dashboard(&stats));
        let drained = stats.tasks.queue_size == 0
            && stats.tasks.total_completed + stats.tasks.total_failed >= stats.tasks.total_queued;
        if drained {
            info!("example workload drained");
            return Ok(());
        }
    }
    info!("example workload did not drain within the cycle budget");
    Ok(())
}

fn render_dashboard(stats: &DashboardStats) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "=== taskmill dashboard @ {} ===\n",
        stats.timestamp.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    out.push_str(&format!(
        "system     cpu {:>5.1}%  mem {:>5.1}%  disk {:>5.1}%  load1 {:.2}  procs {}\n",
        stats.system.cpu_percent,
        stats.system.memory_percent,
        stats.system.disk_percent,
        stats.system.load_avg_1m,
        stats.system.process_count,
    ));
    out.push_str(&format!(
        "workers    active {}/{}  total {}  dead {}\n",
        stats.workers.active, stats.workers.max, stats.workers.total, stats.workers.dead,
    ));
    out.push_str(&format!(
        "tasks      queued {}  submitted {}  completed {}  failed {}\n",
        stats.tasks.queue_size,
        stats.tasks.total_queued,
        stats.tasks.total_completed,
        stats.tasks.total_failed,
    ));
    out.push_str(&format!(
        "           {:.1} tasks/min  avg exec {:.2}s\n",
        stats.tasks.tasks_per_minute, stats.tasks.avg_execution_time,
    ));
    let mut counts: Vec<_> = stats.tasks.recent_by_status.iter().collect();
    counts.sort();
    for (status, count) in counts {
        out.push_str(&format!("           {status}: {count}\n"));
    }
    out.push_str(&format!(
        "perf       success {:.1}%  throttling {}  recommended workers {}  throttle events {}\n",
        stats.performance.success_rate,
        stats.performance.is_throttling,
        stats.performance.recommended_workers,
        stats.performance.throttle_events,
    ));
    out
}

/// Handlers for the demo workload. Each simulates a short unit of real work
/// and returns a JSON summary.
fn demo_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();

    registry.register_fn("content_generation", |_args, kwargs| async move {
        tokio::time::sleep(Duration::from_millis(400)).await;
        let topic = kwargs
            .get("topic")
            .and_then(Value::as_str)
            .unwrap_or("general")
            .to_string();
        let content = format!("draft article on {topic}");
        Ok(json!({
            "topic": topic,
            "content": content,
            "words": 420,
        }))
    });

    registry.register_fn("market_data_fetch", |args, _kwargs| async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        let symbols = args.first().cloned().unwrap_or_else(|| json!([]));
        Ok(json!({ "symbols": symbols, "source": "demo-feed" }))
    });

    registry.register_fn("social_post", |args, _kwargs| async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let body = args
            .first()
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Ok(json!({ "posted": true, "length": body.len() }))
    });

    registry.register_fn("analytics_update", |_args, _kwargs| async move {
        tokio::time::sleep(Duration::from_millis(250)).await;
        Ok(json!({ "rows_aggregated": 1280 }))
    });

    registry.register_fn("system_health_check", |_args, kwargs| async move {
        let component = kwargs
            .get("component")
            .and_then(Value::as_str)
            .unwrap_or("all")
            .to_string();
        Ok(json!({ "component": component, "status": "healthy" }))
    });

    registry.register_fn("database_cleanup", |_args, _kwargs| async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        Ok(json!({ "rows_pruned": 57 }))
    });

    registry
}
