// src/executor.rs
//
// =============================================================================
// DROIDFLOW: WORKFLOW EXECUTOR
// =============================================================================
//
// The Interpreter.
//
// Walks one workflow graph as a state machine: each card runs through its
// task module, the returned action picks the next card (sequential edge,
// jump, repeat, or stop), and every transition is published to the
// frontend bridge. One run, one executor, one graph snapshot.

use crate::bridge::ExecutionObserver;
use crate::core::{
    CardState, Counters, ExecutionMode, NextAction, StopReason,
};
use crate::tasks::{ImageProvider, StopToken, TaskContext, TaskRegistry};
use crate::workflow::Workflow;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

/// Per-run settings resolved by the owning workflow task.
#[derive(Clone)]
pub struct ExecutorOptions {
    pub execution_mode: ExecutionMode,
    pub target_window: Option<u64>,
    pub window_region: Option<[i32; 4]>,
    pub images_dir: PathBuf,
    pub image_provider: Option<Arc<dyn ImageProvider>>,
    pub device_id: Option<String>,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            execution_mode: ExecutionMode::Foreground,
            target_window: None,
            window_region: None,
            images_dir: PathBuf::from("images"),
            image_provider: None,
            device_id: None,
        }
    }
}

impl ExecutorOptions {
    /// Resolves the target window from the engine configuration: the first
    /// enabled bound window wins.
    pub fn from_config(cfg: &crate::core::EngineConfig) -> Self {
        Self {
            execution_mode: cfg.execution_mode,
            target_window: cfg.resolve_target_window(),
            ..Default::default()
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub success: bool,
    pub message: String,
    pub reason: StopReason,
    pub steps: u64,
}

impl ExecutionReport {
    fn finish(success: bool, reason: StopReason, message: impl Into<String>, steps: u64) -> Self {
        Self {
            success,
            message: message.into(),
            reason,
            steps,
        }
    }
}

pub struct WorkflowExecutor {
    run_id: Uuid,
    task_id: u64,
    workflow: Workflow,
    registry: TaskRegistry,
    observer: Arc<dyn ExecutionObserver>,
    stop: StopToken,
    opts: ExecutorOptions,
}

impl WorkflowExecutor {
    /// Takes a read-only snapshot of the workflow for the whole run.
    pub fn new(
        task_id: u64,
        workflow: &Workflow,
        registry: TaskRegistry,
        observer: Arc<dyn ExecutionObserver>,
        stop: StopToken,
        opts: ExecutorOptions,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            task_id,
            workflow: workflow.clone(),
            registry,
            observer,
            stop,
            opts,
        }
    }

    pub fn stop_token(&self) -> StopToken {
        self.stop.clone()
    }

    pub fn request_stop(&self) {
        self.stop.request_stop();
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    fn card_state(&self, card_id: i64, state: CardState) {
        self.observer.card_state_changed(self.task_id, card_id, state);
    }

    fn progress(&self, message: &str) {
        self.observer.task_progress(self.task_id, message);
    }

    /// The main loop. Never panics out of a task failure: every ending is
    /// a report with a stop reason.
    pub async fn run(&self) -> ExecutionReport {
        let run = self.run_id.simple().to_string().chars().take(8).collect::<String>();
        log::info!("[run {run}] workflow '{}' starting", self.workflow.name);

        let start_id = match self.workflow.ensure_executable() {
            Ok(()) => match self.workflow.start_card() {
                Some(card) => card.id,
                None => {
                    return ExecutionReport::finish(false, StopReason::Failed, "找不到起始卡片", 0)
                }
            },
            Err(msg) => {
                log::error!("[run {run}] {msg}");
                return ExecutionReport::finish(false, StopReason::Failed, msg, 0);
            }
        };

        let mut counters = Counters::new();
        let mut current = start_id;
        let mut steps: u64 = 0;
        let mut last_ok = true;

        loop {
            if self.stop.is_stopped() {
                log::info!("[run {run}] stop requested at card {current}");
                return ExecutionReport::finish(false, StopReason::Stopped, "工作流已停止", steps);
            }

            let Some(card) = self.workflow.card(current) else {
                // Only reachable through a stale snapshot; treat as config error.
                let msg = format!("卡片 {current} 不存在");
                return ExecutionReport::finish(false, StopReason::Failed, msg, steps);
            };

            self.card_state(current, CardState::Executing);
            let label = card
                .custom_name
                .clone()
                .unwrap_or_else(|| card.task_type.clone());
            self.progress(&format!("执行卡片 {current}: {label}"));

            let Some(module) = self.registry.get(&card.task_type) else {
                self.card_state(current, CardState::Failure);
                let msg = format!("未知任务类型: {}", card.task_type);
                log::error!("[run {run}] {msg}");
                return ExecutionReport::finish(false, StopReason::Failed, msg, steps);
            };

            let outcome = {
                let mut ctx = TaskContext {
                    params: &card.parameters,
                    counters: &mut counters,
                    execution_mode: self.opts.execution_mode,
                    target_window: self.opts.target_window,
                    window_region: self.opts.window_region,
                    card_id: current,
                    stop: self.stop.clone(),
                    images: self.opts.image_provider.clone(),
                    images_dir: self.opts.images_dir.clone(),
                    device_id: self.opts.device_id.clone(),
                };
                module.execute(&mut ctx).await
            };
            steps += 1;
            last_ok = outcome.ok;

            self.card_state(
                current,
                if outcome.ok {
                    CardState::Success
                } else {
                    CardState::Failure
                },
            );
            if !outcome.message.is_empty() {
                self.progress(&outcome.message);
            }
            log::debug!(
                "[run {run}] card {current} -> ok={} action={}",
                outcome.ok,
                outcome.action.as_str()
            );

            match outcome.action {
                NextAction::Stop => {
                    // A stop directive during cancellation is the
                    // acknowledgement, not a workflow-chosen ending.
                    let reason = if self.stop.is_stopped() {
                        StopReason::Stopped
                    } else if outcome.ok {
                        StopReason::Success
                    } else {
                        StopReason::Failed
                    };
                    let msg = if outcome.message.is_empty() {
                        "工作流停止".to_string()
                    } else {
                        outcome.message
                    };
                    return ExecutionReport::finish(outcome.ok, reason, msg, steps);
                }
                NextAction::JumpTo(target) => {
                    if self.workflow.card(target).is_none() {
                        let msg = format!("跳转目标卡片不存在 (ID: {target})");
                        log::error!("[run {run}] {msg}");
                        return ExecutionReport::finish(false, StopReason::Failed, msg, steps);
                    }
                    current = target;
                }
                NextAction::Repeat => {
                    // Same card again; the stop check at loop head keeps
                    // this interruptible.
                }
                NextAction::Next => match self.workflow.sequential_next(current) {
                    Some(next) => current = next,
                    None => {
                        log::info!("[run {run}] card {current} has no successor, run ends");
                        return ExecutionReport::finish(
                            last_ok,
                            StopReason::NoNext,
                            "没有后续卡片，流程结束",
                            steps,
                        );
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::RecordingObserver;
    use crate::core::ACTION_JUMP;
    use crate::workflow::{Card, EdgeKind, START_TASK_TYPE};

    fn executor_for(wf: &Workflow) -> (WorkflowExecutor, Arc<RecordingObserver>) {
        let observer = RecordingObserver::new();
        let exec = WorkflowExecutor::new(
            1,
            wf,
            TaskRegistry::with_builtins(),
            observer.clone(),
            StopToken::new(),
            ExecutorOptions::default(),
        );
        (exec, observer)
    }

    #[tokio::test]
    async fn missing_start_card_fails_with_reason() {
        let wf = Workflow::new("empty");
        let (exec, _) = executor_for(&wf);
        let report = exec.run().await;
        assert!(!report.success);
        assert_eq!(report.reason, StopReason::Failed);
        assert!(report.message.contains("起始"));
    }

    #[tokio::test]
    async fn jump_to_missing_card_fails() {
        let mut wf = Workflow::new("bad-jump");
        wf.add_card(Card::new(0, START_TASK_TYPE).with_param("next_step_card_id", 42))
            .unwrap();
        let (exec, _) = executor_for(&wf);
        let report = exec.run().await;
        assert!(!report.success);
        assert_eq!(report.reason, StopReason::Failed);
        assert!(report.message.contains("42"));
    }

    #[tokio::test]
    async fn unknown_task_type_is_a_config_failure() {
        let mut wf = Workflow::new("unknown-type");
        wf.add_card(Card::new(0, START_TASK_TYPE)).unwrap();
        wf.add_card(Card::new(1, "没有这种任务")).unwrap();
        wf.add_edge(0, 1, EdgeKind::Sequential).unwrap();

        let (exec, _) = executor_for(&wf);
        let report = exec.run().await;
        assert!(!report.success);
        assert_eq!(report.reason, StopReason::Failed);
    }

    #[tokio::test]
    async fn failure_branch_jumps_and_run_still_succeeds() {
        // findImage misses (no matcher/template), on_failure jumps to the
        // delay card, which finishes the run with no_next.
        let mut wf = Workflow::new("branching");
        wf.add_card(Card::new(0, START_TASK_TYPE)).unwrap();
        wf.add_card(
            Card::new(1, "查找图片")
                .with_param("image_file", "memory://missing")
                .with_param("on_failure", ACTION_JUMP)
                .with_param("failure_jump_target_id", 2),
        )
        .unwrap();
        wf.add_card(
            Card::new(2, "延迟")
                .with_param("delay_mode", "固定延迟")
                .with_param("fixed_delay", 0.05),
        )
        .unwrap();
        wf.add_edge(0, 1, EdgeKind::Sequential).unwrap();
        wf.rebuild_derived_edges();

        let (exec, observer) = executor_for(&wf);
        let report = exec.run().await;

        assert!(report.success);
        assert_eq!(report.reason, StopReason::NoNext);
        assert_eq!(
            observer.card_states(1),
            vec![CardState::Executing, CardState::Failure]
        );
        assert_eq!(
            observer.card_states(2),
            vec![CardState::Executing, CardState::Success]
        );
    }

    #[tokio::test]
    async fn single_delay_scenario_timing_and_events() {
        let mut wf = Workflow::new("delay");
        wf.add_card(Card::new(0, START_TASK_TYPE)).unwrap();
        wf.add_card(
            Card::new(1, "延迟")
                .with_param("delay_mode", "固定延迟")
                .with_param("fixed_delay", 0.5),
        )
        .unwrap();
        wf.add_edge(0, 1, EdgeKind::Sequential).unwrap();

        let (exec, observer) = executor_for(&wf);
        let t0 = std::time::Instant::now();
        let report = exec.run().await;
        let elapsed = t0.elapsed().as_secs_f64();

        assert!(report.success);
        assert_eq!(report.reason, StopReason::NoNext);
        assert!((0.45..1.0).contains(&elapsed), "elapsed {elapsed:.3}s");
        assert_eq!(
            observer.card_states(1),
            vec![CardState::Executing, CardState::Success]
        );
    }

    #[tokio::test]
    async fn stop_request_ends_run_with_stopped() {
        let mut wf = Workflow::new("stoppable");
        wf.add_card(Card::new(0, START_TASK_TYPE)).unwrap();
        wf.add_card(Card::new(1, "延迟").with_param("fixed_delay", 30.0))
            .unwrap();
        wf.add_edge(0, 1, EdgeKind::Sequential).unwrap();

        let (exec, _) = executor_for(&wf);
        let stop = exec.stop_token();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(150)).await;
            stop.request_stop();
        });

        let t0 = std::time::Instant::now();
        let report = exec.run().await;
        assert!(!report.success);
        assert_eq!(report.reason, StopReason::Stopped);
        assert!(t0.elapsed().as_secs_f64() < 2.0);
    }
}
