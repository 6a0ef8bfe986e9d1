use droidflow::bridge::{BridgeEvent, ChannelObserver, RecordingObserver};
use droidflow::core::{EngineConfig, RunMode, StopReason, TaskStatus};
use droidflow::manager::TaskManager;
use droidflow::tasks::TaskRegistry;
use droidflow::workflow::{Card, EdgeKind, Workflow, START_TASK_TYPE};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn delay_workflow(name: &str, seconds: f64) -> Workflow {
    let mut wf = Workflow::new(name);
    wf.add_card(Card::new(0, START_TASK_TYPE)).unwrap();
    wf.add_card(
        Card::new(1, "延迟")
            .with_param("delay_mode", "固定延迟")
            .with_param("fixed_delay", seconds),
    )
    .unwrap();
    wf.add_edge(0, 1, EdgeKind::Sequential).unwrap();
    wf
}

fn broken_workflow(name: &str) -> Workflow {
    let mut wf = Workflow::new(name);
    wf.add_card(Card::new(0, START_TASK_TYPE)).unwrap();
    wf.add_card(Card::new(1, "不存在的任务类型")).unwrap();
    wf.add_edge(0, 1, EdgeKind::Sequential).unwrap();
    wf
}

fn manager_with(observer: Arc<dyn droidflow::ExecutionObserver>, mode: RunMode) -> TaskManager {
    let cfg = EngineConfig {
        task_execution_mode: mode,
        ..Default::default()
    };
    TaskManager::new(TaskRegistry::with_builtins(), observer, cfg)
}

#[tokio::test]
async fn async_mode_runs_workflows_in_parallel() {
    let observer = RecordingObserver::new();
    let mut manager = manager_with(observer.clone(), RunMode::Async);

    for i in 0..3 {
        let wf = delay_workflow(&format!("wf{i}"), 2.0);
        manager.add_task(format!("wf{i}"), PathBuf::new(), wf);
    }

    let t0 = Instant::now();
    let overall = manager.execute_all().await;
    let elapsed = t0.elapsed();

    assert!(overall);
    // Three 2s delays in parallel must beat 3s wall clock.
    assert!(elapsed < Duration::from_secs(3), "took {elapsed:?}");

    let completions: Vec<_> = observer
        .events()
        .into_iter()
        .filter(|e| matches!(e, BridgeEvent::AllTasksCompleted { .. }))
        .collect();
    assert_eq!(
        completions,
        vec![BridgeEvent::AllTasksCompleted {
            overall_success: true
        }]
    );
}

#[tokio::test]
async fn sync_mode_failure_skips_remaining_tasks() {
    let observer = RecordingObserver::new();
    let mut manager = manager_with(observer.clone(), RunMode::Sync);

    let a = manager.add_task("broken", PathBuf::new(), broken_workflow("broken"));
    let b = manager.add_task("after", PathBuf::new(), delay_workflow("after", 0.05));

    let overall = manager.execute_all().await;
    assert!(!overall);
    assert_eq!(manager.task(a).unwrap().status, TaskStatus::Failed);
    // The failure skipped the second task entirely.
    assert_eq!(manager.task(b).unwrap().status, TaskStatus::Idle);
}

#[tokio::test]
async fn no_next_jump_rule_chains_workflows() {
    let observer = RecordingObserver::new();
    let mut manager = manager_with(observer.clone(), RunMode::Sync);

    let a = manager.add_task("a", PathBuf::new(), delay_workflow("a", 0.02));
    let b = manager.add_task("b", PathBuf::new(), delay_workflow("b", 0.02));

    // A ends with no_next (delay has no successor) and routes to B.
    manager
        .task_mut(a)
        .unwrap()
        .jump_rules
        .insert(StopReason::NoNext, b);

    let overall = manager.execute_all().await;
    assert!(overall);
    assert_eq!(manager.task(a).unwrap().stop_reason, Some(StopReason::NoNext));
    assert_eq!(manager.task(b).unwrap().status, TaskStatus::Completed);

    // B ran exactly once despite being both jump target and queued.
    let b_finishes = observer
        .events()
        .into_iter()
        .filter(|e| matches!(e, BridgeEvent::ExecutionFinished { task_id, .. } if *task_id == b))
        .count();
    assert_eq!(b_finishes, 1);
}

#[tokio::test]
async fn failed_task_does_not_take_no_next_jump() {
    let observer = RecordingObserver::new();
    let mut manager = manager_with(observer.clone(), RunMode::Sync);

    let a = manager.add_task("a", PathBuf::new(), broken_workflow("a"));
    let b = manager.add_task("b", PathBuf::new(), delay_workflow("b", 0.02));

    manager
        .task_mut(a)
        .unwrap()
        .jump_rules
        .insert(StopReason::NoNext, b);

    let overall = manager.execute_all().await;
    assert!(!overall);
    assert_eq!(manager.task(a).unwrap().stop_reason, Some(StopReason::Failed));
    // The rule keys on no_next; a failed ending does not start B.
    assert_eq!(manager.task(b).unwrap().status, TaskStatus::Idle);
}

#[tokio::test]
async fn bounded_jump_count_stops_the_chain() {
    let observer = RecordingObserver::new();
    let mut manager = manager_with(observer.clone(), RunMode::Sync);

    let a = manager.add_task("looper", PathBuf::new(), delay_workflow("looper", 0.01));
    {
        let task = manager.task_mut(a).unwrap();
        task.jump_rules.insert(StopReason::NoNext, a);
        task.max_jump_count = 3;
    }

    let overall = manager.execute_all().await;
    assert!(overall);

    // 1 natural run + 3 jumps.
    let finishes = observer
        .events()
        .into_iter()
        .filter(|e| matches!(e, BridgeEvent::ExecutionFinished { .. }))
        .count();
    assert_eq!(finishes, 4);
}

#[tokio::test]
async fn unlimited_jump_count_loops_until_stopped() {
    let (observer, mut events) = ChannelObserver::new();
    let mut manager = manager_with(observer, RunMode::Sync);

    let a = manager.add_task("watchdog", PathBuf::new(), delay_workflow("watchdog", 0.005));
    {
        let task = manager.task_mut(a).unwrap();
        task.jump_rules.insert(StopReason::NoNext, a);
        // 0 means unlimited: the depth counter is bypassed.
        task.max_jump_count = 0;
    }

    let abort = manager.abort_token();
    let counter = tokio::spawn(async move {
        let mut finishes = 0u32;
        while let Some(event) = events.recv().await {
            if matches!(event, BridgeEvent::ExecutionFinished { .. }) {
                finishes += 1;
                if finishes >= 100 {
                    abort.request_stop();
                }
            }
        }
        finishes
    });

    manager.execute_all().await;
    drop(manager); // closes the channel so the counter task ends

    let finishes = counter.await.unwrap();
    assert!(finishes >= 100, "only {finishes} iterations before stop");
}

#[tokio::test]
async fn stop_all_interrupts_running_workflows() {
    let observer = RecordingObserver::new();
    let mut manager = manager_with(observer.clone(), RunMode::Sync);

    let a = manager.add_task("long", PathBuf::new(), delay_workflow("long", 30.0));

    let abort = manager.abort_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        abort.request_stop();
    });

    let t0 = Instant::now();
    manager.execute_all().await;
    assert!(t0.elapsed() < Duration::from_secs(5));
    assert_eq!(manager.task(a).unwrap().status, TaskStatus::Stopped);
    assert_eq!(manager.task(a).unwrap().stop_reason, Some(StopReason::Stopped));
}

#[tokio::test]
async fn save_all_modified_counts_saved_tasks() {
    let dir = tempfile::tempdir().unwrap();
    let observer = RecordingObserver::new();
    let mut manager = manager_with(observer, RunMode::Sync);

    let a = manager.add_task(
        "saved",
        dir.path().join("saved.json"),
        delay_workflow("saved", 0.1),
    );
    let b = manager.add_task("unsaved", PathBuf::new(), delay_workflow("unsaved", 0.1));

    manager.task_mut(a).unwrap().modified = true;
    manager.task_mut(b).unwrap().modified = true;

    // The pathless task cannot be saved; only one write happens.
    assert_eq!(manager.save_all_modified(), 1);
    assert!(dir.path().join("saved.json").exists());
    assert!(!manager.task(a).unwrap().modified);
    assert!(manager.task(b).unwrap().modified);
}
