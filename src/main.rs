use std::collections::HashSet;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use clap::Parser;
use serde_json::{json, Value};

use conductor::{
    clog, HistoryFilter, Orchestrator, OrchestratorConfig, Result, SignalType, TaskId, TaskSpec,
};

/// Conductor - run a small dependency pipeline through the task orchestrator
#[derive(Parser, Debug)]
#[command(name = "conductor")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    CONDUCTOR_DEBUG=1     Enable debug logging (alternative to --debug)"
)]
pub struct Cli {
    /// Worker pool size (overrides the config file)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Config file (defaults to ~/.conductor/conductor.toml)
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Enable debug logging (writes to ~/.conductor/conductor.log)
    #[arg(short = 'd', long)]
    pub debug: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let path = match cli.config {
        Some(path) => path,
        None => OrchestratorConfig::default_path()?,
    };
    let mut config = OrchestratorConfig::load(&path)?;
    if let Some(workers) = cli.workers {
        config.max_parallel_tasks = workers;
    }
    config.debug |= cli.debug;

    conductor::log::init_with_debug(config.debug);
    clog!(
        "Conductor starting with {} workers (config: {})",
        config.max_parallel_tasks,
        path.display()
    );

    let orchestrator = Orchestrator::new(config)?;
    build_pipeline(&orchestrator)?;
    let outcomes = orchestrator.run_pending()?;

    let mut tasks = Vec::new();
    for task in orchestrator.tasks() {
        let outcome = match outcomes.get(&task.id) {
            Some(Ok(value)) => json!({ "result": value }),
            Some(Err(failure)) => json!({ "error": failure }),
            None => Value::Null,
        };
        tasks.push(json!({
            "id": task.id.short(),
            "name": task.name,
            "state": task.state,
            "priority": task.priority,
            "duration_ms": task.duration().map(|d| d.num_milliseconds()),
            "outcome": outcome,
        }));
    }

    let mut history = orchestrator.bus().history(&HistoryFilter::default());
    history.reverse();
    let signals: Vec<Value> = history
        .iter()
        .map(|signal| {
            json!({
                "type": signal.signal_type,
                "task": signal.task_id.map(|id| id.short()),
                "agent": signal.agent_id,
                "at": signal.timestamp.format("%H:%M:%S%.3f").to_string(),
            })
        })
        .collect();

    let failed = orchestrator
        .bus()
        .history(&HistoryFilter::default().signal_type(SignalType::TaskFailed))
        .len();

    let json_output = json!({
        "workers": orchestrator.config().max_parallel_tasks,
        "tasks": tasks,
        "signals": signals,
        "failed": failed,
    });
    println!("{}", serde_json::to_string_pretty(&json_output)?);

    orchestrator.shutdown();
    Ok(())
}

/// Diamond `fetch -> {parse, index} -> report`, plus a task that fails and
/// one that depends on it.
fn build_pipeline(orchestrator: &Orchestrator) -> Result<()> {
    let add = |spec: TaskSpec| -> Result<TaskId> { orchestrator.create_task(spec) };

    let fetch = add(TaskSpec::new("fetch", || {
        thread::sleep(Duration::from_millis(30));
        Ok(json!({ "documents": 12 }))
    })
    .priority(10)
    .agent("fetcher"))?;

    let parse = add(TaskSpec::new("parse", || {
        thread::sleep(Duration::from_millis(20));
        Ok(json!({ "sections": 48 }))
    })
    .depends_on(fetch)
    .priority(5)
    .agent("parser"))?;

    let index = add(TaskSpec::new("index", || {
        thread::sleep(Duration::from_millis(20));
        Ok(json!({ "terms": 1024 }))
    })
    .depends_on(fetch)
    .agent("indexer"))?;

    add(TaskSpec::new("report", || Ok(json!("pipeline complete")))
        .dependencies(HashSet::from([parse, index]))
        .description("summarise parse and index output"))?;

    let flaky = add(TaskSpec::new("upload", || {
        Err("remote store unavailable".into())
    })
    .agent("uploader"))?;

    add(TaskSpec::new("notify", || Ok(json!("sent"))).depends_on(flaky))?;

    Ok(())
}
