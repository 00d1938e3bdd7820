//! Orchestrator: turns registered tasks into execution.
//!
//! Single-task and sequential execution run work on the caller's thread.
//! Parallel execution coordinates in waves from the caller's thread and runs
//! work on the bounded [`WorkerPool`]. Every state change is requested from
//! the [`TaskRegistry`]; the orchestrator never mutates task records itself.
//!
//! Shutdown stops intake first. Sequential runs stop before their next task
//! and parallel runs before their next dispatch; both return the outcomes
//! gathered so far and leave untouched members PENDING. Shutdown then waits
//! for every caller-side execution to return before joining the pool.

use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;

use crate::config::OrchestratorConfig;
use crate::core::registry::{dispatch_order, Assessment, Readiness, TaskRegistry, Transition};
use crate::core::task::{Task, TaskFailure, TaskId, TaskOutcome, TaskSpec, TaskState, Work};
use crate::error::{Error, Result};
use crate::orchestration::pool::{self, PoolHandle, WorkerPool};
use crate::signals::SignalBus;
use crate::{clog, clog_debug, clog_error, clog_warn};

/// How a task group's children are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Sequential,
    Parallel,
}

/// Per-task outcome map returned by the batch APIs.
pub type Outcomes = HashMap<TaskId, TaskOutcome>;

thread_local! {
    /// Nesting depth of task work running on this thread.
    static RUNNING_WORK: Cell<usize> = const { Cell::new(0) };
}

/// Schedules and executes tasks against a shared registry and signal bus.
///
/// # Example
///
/// ```
/// use conductor::{Orchestrator, TaskSpec};
/// use serde_json::json;
///
/// let orchestrator = Orchestrator::with_workers(2).unwrap();
/// let fetch = orchestrator
///     .create_task(TaskSpec::new("fetch", || Ok(json!("page"))))
///     .unwrap();
/// let parse = orchestrator
///     .create_task(TaskSpec::new("parse", || Ok(json!(3))).depends_on(fetch))
///     .unwrap();
///
/// let outcomes = orchestrator
///     .execute_tasks_parallel(&[fetch, parse].into_iter().collect())
///     .unwrap();
/// assert_eq!(outcomes[&parse], Ok(json!(3)));
/// ```
pub struct Orchestrator {
    config: OrchestratorConfig,
    bus: Arc<SignalBus>,
    registry: Arc<TaskRegistry>,
    pool: WorkerPool,
    activity: Mutex<Activity>,
    /// Notified when the last in-flight execution returns.
    idle: Condvar,
}

struct Activity {
    accepting: bool,
    /// Caller-side executions currently inside the orchestrator.
    in_flight: usize,
}

/// Counts one execution as in flight until dropped.
struct InFlight<'a> {
    orchestrator: &'a Orchestrator,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut activity = self.orchestrator.activity();
        activity.in_flight -= 1;
        if activity.in_flight == 0 {
            self.orchestrator.idle.notify_all();
        }
    }
}

impl Orchestrator {
    /// Build an orchestrator with its own signal bus.
    ///
    /// # Errors
    /// [`Error::InvalidConfig`] when the configuration does not validate.
    pub fn new(config: OrchestratorConfig) -> Result<Self> {
        config.validate()?;
        let bus = Arc::new(SignalBus::new(config.history_capacity));
        Self::with_bus(config, bus)
    }

    pub fn with_workers(max_parallel_tasks: usize) -> Result<Self> {
        Self::new(OrchestratorConfig::with_workers(max_parallel_tasks))
    }

    /// Build an orchestrator that publishes to an existing bus.
    pub fn with_bus(config: OrchestratorConfig, bus: Arc<SignalBus>) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(TaskRegistry::new(bus.clone()));
        let pool = WorkerPool::new(config.max_parallel_tasks)?;
        clog!(
            "Orchestrator ready: max_parallel_tasks={} history_capacity={}",
            config.max_parallel_tasks,
            bus.capacity()
        );
        Ok(Self {
            config,
            bus,
            registry,
            pool,
            activity: Mutex::new(Activity {
                accepting: true,
                in_flight: 0,
            }),
            idle: Condvar::new(),
        })
    }

    fn activity(&self) -> MutexGuard<'_, Activity> {
        self.activity.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_accepting(&self) -> Result<()> {
        if self.activity().accepting {
            Ok(())
        } else {
            Err(Error::ShutDown)
        }
    }

    /// Register an execution that shutdown must wait for.
    fn enter(&self) -> Result<InFlight<'_>> {
        let mut activity = self.activity();
        if !activity.accepting {
            return Err(Error::ShutDown);
        }
        activity.in_flight += 1;
        Ok(InFlight { orchestrator: self })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<SignalBus> {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    // ========== Submission ==========

    /// Register a new PENDING task and return its id.
    pub fn create_task(&self, spec: TaskSpec) -> Result<TaskId> {
        self.ensure_accepting()?;
        self.registry.register(spec)
    }

    /// Cancel a task that has not started.
    pub fn cancel_task(&self, task_id: &TaskId) -> Result<Task> {
        self.registry.cancel(task_id)
    }

    /// Fire the cancellation token of a RUNNING task.
    ///
    /// The task stays RUNNING until its work returns. Work that gives up with
    /// an error is recorded as [`TaskFailure::Interrupted`].
    pub fn interrupt_task(&self, task_id: &TaskId) -> Result<()> {
        self.registry.interrupt(task_id)
    }

    // ========== Queries ==========

    pub fn task(&self, task_id: &TaskId) -> Option<Task> {
        self.registry.get(task_id)
    }

    pub fn task_state(&self, task_id: &TaskId) -> Option<TaskState> {
        self.registry.state(task_id)
    }

    /// All tasks in creation order.
    pub fn tasks(&self) -> Vec<Task> {
        self.registry.all()
    }

    /// Ready tasks in dispatch order.
    pub fn ready_tasks(&self) -> Vec<Task> {
        self.registry.ready_tasks()
    }

    pub fn is_shut_down(&self) -> bool {
        !self.activity().accepting
    }

    // ========== Execution ==========

    /// Run one ready task on the calling thread.
    ///
    /// Returns the task's outcome; failures of the work itself are inside the
    /// `Ok`. A task whose dependency failed or was cancelled is marked FAILED
    /// without running and its [`TaskFailure::DependencyFailed`] returned.
    ///
    /// # Errors
    /// - [`Error::TaskNotFound`] for unknown ids
    /// - [`Error::DependencyNotSatisfied`] if dependencies are unfinished or
    ///   unregistered; the task stays PENDING
    /// - [`Error::InvalidTransition`] if the task is no longer PENDING
    pub fn execute_task(&self, task_id: &TaskId) -> Result<TaskOutcome> {
        let _in_flight = self.enter()?;
        match self.registry.readiness(task_id)? {
            Readiness::Ready => {}
            Readiness::Waiting { pending } => {
                return Err(Error::DependencyNotSatisfied {
                    task_id: *task_id,
                    pending,
                });
            }
            Readiness::Missing { missing } => {
                return Err(Error::DependencyNotSatisfied {
                    task_id: *task_id,
                    pending: missing,
                });
            }
            Readiness::Blocked { dependency, state } => {
                let failure = TaskFailure::DependencyFailed { dependency, state };
                self.registry
                    .transition(task_id, Transition::Fail(failure.clone()))?;
                return Ok(Err(failure));
            }
            Readiness::NotPending(state) => {
                return Err(Error::InvalidTransition {
                    task_id: *task_id,
                    from: state,
                    to: TaskState::Running,
                });
            }
        }

        let (work, token) = self.registry.start(task_id)?;
        Ok(finish(&self.registry, task_id, run_work(work, &token)))
    }

    /// Run tasks one at a time in the given order.
    ///
    /// Stops early only at an id that is not registered. A task whose
    /// dependencies are not done gets a [`TaskFailure::DependencyNotSatisfied`]
    /// entry and the rest still run. Tasks that are already terminal keep
    /// their recorded outcome; cancelled ones have no entry.
    ///
    /// A shutdown during the run stops it before the next task; the outcomes
    /// gathered so far are returned and the rest stay PENDING.
    pub fn execute_tasks_sequential(&self, task_ids: &[TaskId]) -> Result<Outcomes> {
        self.ensure_accepting()?;
        clog!("Executing {} tasks sequentially", task_ids.len());

        let mut outcomes = Outcomes::new();
        for (position, task_id) in task_ids.iter().enumerate() {
            if self.is_shut_down() {
                clog_warn!(
                    "Shutdown requested, {} tasks left unexecuted",
                    task_ids.len() - position
                );
                break;
            }
            if !self.registry.contains(task_id) {
                clog_warn!(
                    "Task {} not registered, stopping sequential execution",
                    task_id
                );
                break;
            }

            match self.execute_task(task_id) {
                Ok(outcome) => {
                    outcomes.insert(*task_id, outcome);
                }
                Err(Error::DependencyNotSatisfied { pending, .. }) => {
                    clog_warn!(
                        "Task {} skipped: {} dependencies not satisfied",
                        task_id.short(),
                        pending.len()
                    );
                    outcomes.insert(
                        *task_id,
                        Err(TaskFailure::DependencyNotSatisfied { pending }),
                    );
                }
                Err(Error::InvalidTransition { .. }) => {
                    // Already claimed elsewhere; report whatever it ends as.
                    let task = self.registry.wait_until_terminal(task_id)?;
                    if let Some(outcome) = task.outcome() {
                        outcomes.insert(*task_id, outcome);
                    }
                }
                Err(Error::ShutDown) => {
                    clog_warn!("Shutdown requested, stopping before task {}", task_id.short());
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(outcomes)
    }

    /// Run a set of tasks in dependency-respecting waves on the worker pool.
    ///
    /// Each wave dispatches the ready members of the set, highest priority
    /// first and then in creation order, at most `max_parallel_tasks` at a
    /// time, and waits for the whole wave before re-checking readiness. The
    /// call returns once every member is terminal:
    ///
    /// - members with a FAILED or CANCELLED dependency are failed with
    ///   [`TaskFailure::DependencyFailed`]
    /// - members whose dependencies can never run within this call
    ///   (unregistered, or pending outside the set) are failed with
    ///   [`TaskFailure::DependencyNotSatisfied`]
    ///
    /// A shutdown during the run lets the current wave finish and dispatches
    /// nothing further; members not yet started stay PENDING and have no entry.
    ///
    /// # Errors
    /// [`Error::TaskNotFound`] if any id is unknown; nothing runs in that case.
    pub fn execute_tasks_parallel(&self, task_ids: &HashSet<TaskId>) -> Result<Outcomes> {
        let _in_flight = self.enter()?;
        if let Some(unknown) = task_ids.iter().find(|id| !self.registry.contains(id)) {
            return Err(Error::TaskNotFound(*unknown));
        }
        let pool = self.pool.handle()?;
        clog!("Executing {} tasks in parallel", task_ids.len());

        let mut remaining: Vec<TaskId> = task_ids.iter().copied().collect();
        let mut outcomes = Outcomes::new();
        let mut wave = 0usize;

        while !remaining.is_empty() {
            if self.is_shut_down() {
                clog_warn!(
                    "Shutdown requested, stopping parallel execution with {} tasks unfinished",
                    remaining.len()
                );
                break;
            }
            let plan = self.plan(&remaining, &mut outcomes);
            remaining = plan.unfinished;

            if !plan.ready.is_empty() {
                wave += 1;
                self.run_wave(wave, plan.ready, &pool, &mut outcomes);
                continue;
            }
            if !plan.running.is_empty() {
                clog_debug!(
                    "No ready tasks, waiting on {} running tasks",
                    plan.running.len()
                );
                self.registry.wait_any_terminal(&plan.running);
                continue;
            }
            if remaining.is_empty() {
                break;
            }
            self.fail_stuck(plan.stuck, &remaining);
        }
        drop(pool);

        clog!(
            "Parallel execution finished after {} waves ({} outcomes)",
            wave,
            outcomes.len()
        );
        Ok(outcomes)
    }

    /// Classify the unfinished members of a parallel batch.
    fn plan(&self, remaining: &[TaskId], outcomes: &mut Outcomes) -> WavePlan {
        let mut plan = WavePlan::default();

        for Assessment {
            task,
            readiness,
            running,
        } in self.registry.assess(remaining)
        {
            match readiness {
                Readiness::Ready => {
                    plan.unfinished.push(task.id);
                    plan.ready.push(task);
                }
                Readiness::NotPending(state) if state.is_terminal() => {
                    if let Some(outcome) = task.outcome() {
                        outcomes.entry(task.id).or_insert(outcome);
                    }
                }
                Readiness::NotPending(_) => {
                    plan.unfinished.push(task.id);
                    plan.running.push(task.id);
                }
                Readiness::Blocked { dependency, state } => {
                    let failure = TaskFailure::DependencyFailed { dependency, state };
                    match self
                        .registry
                        .transition(&task.id, Transition::Fail(failure.clone()))
                    {
                        Ok(_) => {
                            outcomes.insert(task.id, Err(failure));
                        }
                        // Claimed concurrently; picked up on the next pass.
                        Err(_) => plan.unfinished.push(task.id),
                    }
                }
                Readiness::Waiting { pending } => {
                    plan.unfinished.push(task.id);
                    plan.running.extend(running);
                    plan.stuck.push((task.id, pending));
                }
                Readiness::Missing { missing } => {
                    plan.unfinished.push(task.id);
                    plan.stuck.push((task.id, missing));
                }
            }
        }
        plan
    }

    /// Dispatch one wave and block until every task in it has finished.
    fn run_wave(&self, wave: usize, mut ready: Vec<Task>, pool: &PoolHandle, outcomes: &mut Outcomes) {
        ready.sort_by(dispatch_order);
        ready.truncate(self.config.max_parallel_tasks);
        clog_debug!("Wave {}: dispatching {} tasks", wave, ready.len());

        let (tx, rx) = crossbeam_channel::unbounded::<(TaskId, TaskOutcome)>();
        for task in ready {
            if self.is_shut_down() {
                clog_debug!("Wave {}: shutdown requested, dispatch stopped", wave);
                break;
            }
            let task_id = task.id;
            let (work, token) = match self.registry.start(&task_id) {
                Ok(claimed) => claimed,
                Err(e) => {
                    clog_debug!("Task {} not dispatched: {}", task_id.short(), e);
                    continue;
                }
            };

            let registry = Arc::clone(&self.registry);
            let tx = tx.clone();
            let submitted = pool.submit(move || {
                let outcome = finish(&registry, &task_id, run_work(work, &token));
                let _ = tx.send((task_id, outcome));
            });
            if let Err(e) = submitted {
                let failure = TaskFailure::Interrupted {
                    message: e.to_string(),
                };
                outcomes.insert(task_id, finish(&self.registry, &task_id, Err(failure)));
            }
        }
        drop(tx);

        for (task_id, outcome) in rx.iter() {
            outcomes.insert(task_id, outcome);
        }
    }

    /// Fail tasks that can never become ready within the current call.
    ///
    /// Only tasks with no pending dependency inside the batch are failed
    /// directly; their dependents follow as blocked on the next pass. The
    /// registry re-checks each one, so a task whose dependency moved on since
    /// the plan was taken is left for the next pass.
    fn fail_stuck(&self, stuck: Vec<(TaskId, Vec<TaskId>)>, remaining: &[TaskId]) {
        let in_batch: HashSet<&TaskId> = remaining.iter().collect();
        let (roots, rest): (Vec<_>, Vec<_>) = stuck
            .into_iter()
            .partition(|(_, pending)| !pending.iter().any(|dep| in_batch.contains(dep)));
        let targets = if roots.is_empty() { rest } else { roots };

        for (task_id, pending) in targets {
            match self.registry.fail_stalled(&task_id) {
                Ok(Some(_)) => clog_warn!(
                    "Task {} can make no progress, waiting on {} unfinished dependencies",
                    task_id.short(),
                    pending.len()
                ),
                Ok(None) => clog_debug!("Task {} progressed since planning", task_id.short()),
                Err(e) => clog_debug!("Task {} could not be failed: {}", task_id.short(), e),
            }
        }
    }

    /// Execute the children of `parent` in creation order.
    pub fn execute_task_group(&self, parent: &TaskId, mode: ExecutionMode) -> Result<Outcomes> {
        self.ensure_accepting()?;
        let children: Vec<TaskId> = self
            .registry
            .children(parent)
            .into_iter()
            .map(|task| task.id)
            .collect();
        if children.is_empty() {
            clog_warn!("No child tasks found for {}", parent);
            return Ok(Outcomes::new());
        }

        match mode {
            ExecutionMode::Sequential => self.execute_tasks_sequential(&children),
            ExecutionMode::Parallel => {
                self.execute_tasks_parallel(&children.into_iter().collect())
            }
        }
    }

    /// Execute every PENDING task in the registry.
    pub fn run_pending(&self) -> Result<Outcomes> {
        let pending: HashSet<TaskId> = self
            .registry
            .by_state(TaskState::Pending)
            .into_iter()
            .map(|task| task.id)
            .collect();
        if pending.is_empty() {
            self.ensure_accepting()?;
            return Ok(Outcomes::new());
        }
        self.execute_tasks_parallel(&pending)
    }

    /// Stop accepting work, wait for in-flight executions and release the pool.
    ///
    /// Running batches stop dispatching and return what they have. Called
    /// from inside task work, this only stops intake and closes the pool
    /// queue; the waiting happens on a later call or on drop. Calling it
    /// again is harmless.
    pub fn shutdown(&self) {
        let first = std::mem::replace(&mut self.activity().accepting, false);
        if first {
            clog!("Shutting down orchestrator");
        }

        if inside_work() {
            self.pool.close();
            return;
        }

        let mut activity = self.activity();
        while activity.in_flight > 0 {
            activity = self
                .idle
                .wait(activity)
                .unwrap_or_else(PoisonError::into_inner);
        }
        drop(activity);

        self.pool.shutdown();
        if first {
            clog!("Orchestrator shut down");
        }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("pool", &self.pool)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

#[derive(Default)]
struct WavePlan {
    /// Members not yet terminal.
    unfinished: Vec<TaskId>,
    ready: Vec<Task>,
    /// Running tasks whose completion may unblock the batch.
    running: Vec<TaskId>,
    /// Pending members and the dependencies they wait on.
    stuck: Vec<(TaskId, Vec<TaskId>)>,
}

fn run_work(work: Work, token: &CancellationToken) -> TaskOutcome {
    RUNNING_WORK.with(|depth| depth.set(depth.get() + 1));
    let outcome = work.run(token);
    RUNNING_WORK.with(|depth| depth.set(depth.get() - 1));
    outcome
}

/// Whether the calling thread is currently executing task work.
fn inside_work() -> bool {
    RUNNING_WORK.with(Cell::get) > 0 || pool::on_worker_thread()
}

/// Record a work outcome on a RUNNING task and hand it back.
fn finish(registry: &TaskRegistry, task_id: &TaskId, outcome: TaskOutcome) -> TaskOutcome {
    let transition = match &outcome {
        Ok(value) => Transition::Complete(value.clone()),
        Err(failure) => Transition::Fail(failure.clone()),
    };
    if let Err(e) = registry.transition(task_id, transition) {
        clog_error!("Could not record outcome of task {}: {}", task_id.short(), e);
    }
    outcome
}
