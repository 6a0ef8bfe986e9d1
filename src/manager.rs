// src/manager.rs
//
// =============================================================================
// DROIDFLOW: WORKFLOW TASK MANAGER
// =============================================================================
//
// The Conductor.
//
// Responsibilities:
// 1. Own the set of workflow tasks (monotone ids, add/remove/save).
// 2. Run them serially (sync) or in parallel (async).
// 3. Route completion -> jump rules to chain workflows, with a per-source
//    depth guard against runaway chains in bounded mode.
// 4. Publish task status and aggregate completion to the bridge.

use crate::bridge::ExecutionObserver;
use crate::core::{EngineConfig, RunMode, StopReason, TaskStatus};
use crate::executor::{ExecutorOptions, WorkflowExecutor};
use crate::tasks::{StopToken, TaskRegistry};
use crate::workflow::{store, Workflow};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinSet;

// ============================================================================
// 1. WORKFLOW TASK
// ============================================================================

/// Runtime wrapper over one workflow: status, stop plumbing, jump rules.
pub struct WorkflowTask {
    pub task_id: u64,
    pub name: String,
    /// Empty for workflows that were never saved.
    pub filepath: PathBuf,
    pub workflow: Workflow,
    pub status: TaskStatus,
    pub enabled: bool,
    pub modified: bool,
    pub stop_reason: Option<StopReason>,
    /// stop reason -> task to execute next.
    pub jump_rules: HashMap<StopReason, u64>,
    /// 0 means unlimited (watchdog-style loops).
    pub max_jump_count: u32,
    stop: StopToken,
}

impl WorkflowTask {
    fn new(task_id: u64, name: String, filepath: PathBuf, workflow: Workflow) -> Self {
        Self {
            task_id,
            name,
            filepath,
            workflow,
            status: TaskStatus::Idle,
            enabled: true,
            modified: false,
            stop_reason: None,
            jump_rules: HashMap::new(),
            max_jump_count: 10,
            stop: StopToken::new(),
        }
    }

    pub fn can_execute(&self) -> bool {
        self.enabled && self.status.can_execute()
    }

    pub fn can_stop(&self) -> bool {
        self.status.can_stop()
    }

    pub fn request_stop(&self) {
        if self.can_stop() {
            log::info!("stop requested for task '{}'", self.name);
            self.stop.request_stop();
        }
    }

    pub fn update_workflow(&mut self, workflow: Workflow) {
        self.workflow = workflow;
        self.modified = true;
    }

    /// Saves to the task's own filepath; unsaved tasks need a path first.
    pub fn save(&mut self, registry: Option<&TaskRegistry>) -> bool {
        if self.filepath.as_os_str().is_empty() {
            log::warn!("task '{}' has no file path; save skipped", self.name);
            return false;
        }
        match store::save(&self.workflow, &self.filepath, registry) {
            Ok(()) => {
                self.modified = false;
                true
            }
            Err(e) => {
                log::error!("saving task '{}' failed: {e:#}", self.name);
                false
            }
        }
    }
}

// ============================================================================
// 2. THE MANAGER
// ============================================================================

pub struct TaskManager {
    tasks: BTreeMap<u64, WorkflowTask>,
    next_task_id: u64,
    pub execution_mode: RunMode,
    registry: TaskRegistry,
    observer: Arc<dyn ExecutionObserver>,
    config: EngineConfig,
    abort: StopToken,
}

impl TaskManager {
    pub fn new(
        registry: TaskRegistry,
        observer: Arc<dyn ExecutionObserver>,
        config: EngineConfig,
    ) -> Self {
        Self {
            tasks: BTreeMap::new(),
            next_task_id: 1,
            execution_mode: config.task_execution_mode,
            registry,
            observer,
            config,
            abort: StopToken::new(),
        }
    }

    // ------------------------------------------------------------------------
    // LIFECYCLE
    // ------------------------------------------------------------------------

    pub fn add_task(&mut self, name: impl Into<String>, filepath: PathBuf, workflow: Workflow) -> u64 {
        let task_id = self.next_task_id;
        self.next_task_id += 1;

        let name = name.into();
        log::info!("adding task {task_id}: '{name}'");
        self.tasks
            .insert(task_id, WorkflowTask::new(task_id, name, filepath, workflow));
        task_id
    }

    pub fn remove_task(&mut self, task_id: u64) -> bool {
        let Some(task) = self.tasks.get(&task_id) else {
            log::warn!("remove: task {task_id} does not exist");
            return false;
        };
        if task.can_stop() {
            task.request_stop();
        }
        self.tasks.remove(&task_id);
        log::info!("removed task {task_id}");
        true
    }

    pub fn task(&self, task_id: u64) -> Option<&WorkflowTask> {
        self.tasks.get(&task_id)
    }

    pub fn task_mut(&mut self, task_id: u64) -> Option<&mut WorkflowTask> {
        self.tasks.get_mut(&task_id)
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn running_count(&self) -> usize {
        self.tasks
            .values()
            .filter(|t| t.status == TaskStatus::Running)
            .count()
    }

    /// Pre-cloned handle tests and signal handlers use to abort a running
    /// `execute_all` from outside.
    pub fn abort_token(&self) -> StopToken {
        self.abort.clone()
    }

    pub fn stop_task(&self, task_id: u64) {
        if let Some(task) = self.tasks.get(&task_id) {
            task.request_stop();
        }
    }

    pub fn stop_all(&self) {
        log::info!("stopping all running tasks");
        self.abort.request_stop();
        for task in self.tasks.values() {
            task.request_stop();
        }
    }

    pub fn save_all_modified(&mut self) -> usize {
        let registry = self.registry.clone();
        let mut saved = 0;
        for task in self.tasks.values_mut() {
            if task.modified && task.save(Some(&registry)) {
                saved += 1;
            }
        }
        log::info!("saved {saved} modified task(s)");
        saved
    }

    fn set_status(&mut self, task_id: u64, status: TaskStatus) {
        if let Some(task) = self.tasks.get_mut(&task_id) {
            if task.status != status {
                log::info!("task '{}' status: {:?} -> {:?}", task.name, task.status, status);
                task.status = status;
                self.observer.task_status_changed(task_id, status);
            }
        }
    }

    // ------------------------------------------------------------------------
    // EXECUTION
    // ------------------------------------------------------------------------

    fn executable_ids(&self) -> Vec<u64> {
        self.tasks
            .values()
            .filter(|t| t.can_execute())
            .map(|t| t.task_id)
            .collect()
    }

    /// Runs every executable task in the configured mode. Returns overall
    /// success; `all_tasks_completed` fires exactly once per call.
    pub async fn execute_all(&mut self) -> bool {
        let ids = self.executable_ids();
        if ids.is_empty() {
            log::warn!("no executable tasks");
            return false;
        }

        self.abort = StopToken::new();
        log::info!("executing {} task(s), mode {:?}", ids.len(), self.execution_mode);

        let overall = match self.execution_mode {
            RunMode::Sync => self.execute_sync(ids).await,
            RunMode::Async => self.execute_async(ids).await,
        };

        self.observer.all_tasks_completed(overall);
        log::info!("all tasks completed, overall success: {overall}");
        overall
    }

    /// Serial mode: ascending task id; a failure (with no jump rule for
    /// it) skips the remaining tasks. Jump targets preempt natural order.
    async fn execute_sync(&mut self, ids: Vec<u64>) -> bool {
        let mut queue: VecDeque<u64> = ids.into();
        let mut jump_depth: HashMap<u64, u32> = HashMap::new();
        let mut override_next: Option<u64> = None;
        let mut overall = true;

        loop {
            if self.abort.is_stopped() {
                log::info!("execution aborted");
                break;
            }

            let Some(task_id) = override_next.take().or_else(|| queue.pop_front()) else {
                break;
            };
            if !self.tasks.get(&task_id).map(|t| t.can_execute()).unwrap_or(false) {
                continue;
            }

            let (success, reason) = self.run_one(task_id).await;

            match self.resolve_jump(task_id, reason, &mut jump_depth) {
                Some(target) => {
                    // The jumped-to task runs next; drop its queued slot so
                    // it is not executed twice this round.
                    queue.retain(|&id| id != target);
                    override_next = Some(target);
                }
                None => {
                    if !success {
                        if reason == StopReason::Stopped {
                            log::info!("task {task_id} stopped, skipping remaining tasks");
                        } else {
                            log::error!("task {task_id} failed, skipping remaining tasks");
                        }
                        overall = false;
                        break;
                    }
                }
            }
        }
        overall
    }

    /// Parallel mode: all executable tasks start at once; completions may
    /// trigger jump rules, which spawn their targets into the same round.
    async fn execute_async(&mut self, ids: Vec<u64>) -> bool {
        let mut join_set: JoinSet<(u64, bool, String, StopReason)> = JoinSet::new();
        let mut jump_depth: HashMap<u64, u32> = HashMap::new();
        let mut overall = true;

        for task_id in ids {
            self.spawn_task(task_id, &mut join_set);
        }

        while let Some(res) = join_set.join_next().await {
            let Ok((task_id, success, message, reason)) = res else {
                log::error!("executor task panicked");
                overall = false;
                continue;
            };
            self.finish_task(task_id, success, &message, reason);
            overall &= success;

            if self.abort.is_stopped() {
                continue;
            }
            if let Some(target) = self.resolve_jump(task_id, reason, &mut jump_depth) {
                self.spawn_task(target, &mut join_set);
            }
        }
        overall
    }

    /// Runs one task to completion on the current future (sync mode).
    async fn run_one(&mut self, task_id: u64) -> (bool, StopReason) {
        let Some(handle) = self.prepare_run(task_id) else {
            return (false, StopReason::Failed);
        };
        let report = handle.executor.run().await;
        self.finish_task(task_id, report.success, &report.message, report.reason);
        (report.success, report.reason)
    }

    fn spawn_task(
        &mut self,
        task_id: u64,
        join_set: &mut JoinSet<(u64, bool, String, StopReason)>,
    ) {
        let Some(handle) = self.prepare_run(task_id) else {
            return;
        };
        join_set.spawn(async move {
            let report = handle.executor.run().await;
            (task_id, report.success, report.message, report.reason)
        });
    }

    /// Flips a task to running and builds its executor over a fresh stop
    /// token and graph snapshot.
    fn prepare_run(&mut self, task_id: u64) -> Option<PreparedRun> {
        let registry = self.registry.clone();
        let observer = self.observer.clone();
        let opts = ExecutorOptions::from_config(&self.config);

        let task = self.tasks.get_mut(&task_id)?;
        if !task.can_execute() {
            log::warn!("task '{}' is not executable right now", task.name);
            return None;
        }
        if let Err(e) = task.workflow.ensure_executable() {
            log::error!("task '{}' not executable: {e}", task.name);
            task.status = TaskStatus::Failed;
            task.stop_reason = Some(StopReason::Failed);
            self.observer.task_status_changed(task_id, TaskStatus::Failed);
            self.observer
                .execution_finished(task_id, false, &e, StopReason::Failed);
            return None;
        }

        // Child of the manager's abort token, so StopAll and ctrl-c reach
        // running executors without back-references.
        task.stop = self.abort.child();
        task.stop_reason = None;
        let executor = WorkflowExecutor::new(
            task_id,
            &task.workflow,
            registry,
            observer,
            task.stop.clone(),
            opts,
        );

        self.set_status(task_id, TaskStatus::Running);
        Some(PreparedRun { executor })
    }

    fn finish_task(&mut self, task_id: u64, success: bool, message: &str, reason: StopReason) {
        let status = match reason {
            StopReason::Stopped => TaskStatus::Stopped,
            _ if success => TaskStatus::Completed,
            _ => TaskStatus::Failed,
        };
        if let Some(task) = self.tasks.get_mut(&task_id) {
            task.stop_reason = Some(reason);
        }
        self.set_status(task_id, status);
        self.observer
            .execution_finished(task_id, success, message, reason);
    }

    /// Applies the task's jump rules for its stop reason. Bounded mode
    /// counts jumps per source task; zero means unlimited and bypasses
    /// the counter entirely.
    fn resolve_jump(
        &self,
        source_id: u64,
        reason: StopReason,
        jump_depth: &mut HashMap<u64, u32>,
    ) -> Option<u64> {
        let source = self.tasks.get(&source_id)?;
        let &target = source.jump_rules.get(&reason)?;

        if !self.tasks.contains_key(&target) {
            log::warn!("jump target task {target} does not exist");
            return None;
        }

        if source.max_jump_count > 0 {
            let depth = jump_depth.entry(source_id).or_insert(0);
            if *depth >= source.max_jump_count {
                log::warn!(
                    "task '{}' reached max jump count {}, not jumping",
                    source.name,
                    source.max_jump_count
                );
                return None;
            }
            *depth += 1;
        }

        log::info!(
            "jump: task {source_id} ({}) -> task {target}",
            reason.as_str()
        );
        Some(target)
    }
}

struct PreparedRun {
    executor: WorkflowExecutor,
}
