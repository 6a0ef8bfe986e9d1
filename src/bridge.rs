// src/bridge.rs
//
// =============================================================================
// DROIDFLOW: EXECUTOR <-> FRONTEND BRIDGE
// =============================================================================
//
// The Window.
//
// The core emits execution events through this observer seam; frontends
// (GUI tabs, the CLI, test drivers) attach listeners. One method per
// signal, all with no-op defaults so observers subscribe selectively.

use crate::core::{CardState, StopReason, TaskStatus};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

pub trait ExecutionObserver: Send + Sync {
    fn task_status_changed(&self, _task_id: u64, _status: TaskStatus) {}
    fn task_progress(&self, _task_id: u64, _message: &str) {}
    fn execution_finished(
        &self,
        _task_id: u64,
        _success: bool,
        _message: &str,
        _reason: StopReason,
    ) {
    }
    fn card_state_changed(&self, _task_id: u64, _card_id: i64, _state: CardState) {}
    fn all_tasks_completed(&self, _overall_success: bool) {}
}

/// For hosts that don't observe anything.
pub struct NullObserver;

impl ExecutionObserver for NullObserver {}

// ============================================================================
// CONCRETE OBSERVERS
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    TaskStatusChanged {
        task_id: u64,
        status: TaskStatus,
    },
    TaskProgress {
        task_id: u64,
        message: String,
    },
    ExecutionFinished {
        task_id: u64,
        success: bool,
        message: String,
        reason: StopReason,
    },
    CardStateChanged {
        task_id: u64,
        card_id: i64,
        state: CardState,
    },
    AllTasksCompleted {
        overall_success: bool,
    },
}

/// Buffers every event; the test driver's observer.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<BridgeEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<BridgeEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn card_states(&self, card_id: i64) -> Vec<CardState> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                BridgeEvent::CardStateChanged {
                    card_id: id, state, ..
                } if id == card_id => Some(state),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: BridgeEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl ExecutionObserver for RecordingObserver {
    fn task_status_changed(&self, task_id: u64, status: TaskStatus) {
        self.push(BridgeEvent::TaskStatusChanged { task_id, status });
    }

    fn task_progress(&self, task_id: u64, message: &str) {
        self.push(BridgeEvent::TaskProgress {
            task_id,
            message: message.to_string(),
        });
    }

    fn execution_finished(&self, task_id: u64, success: bool, message: &str, reason: StopReason) {
        self.push(BridgeEvent::ExecutionFinished {
            task_id,
            success,
            message: message.to_string(),
            reason,
        });
    }

    fn card_state_changed(&self, task_id: u64, card_id: i64, state: CardState) {
        self.push(BridgeEvent::CardStateChanged {
            task_id,
            card_id,
            state,
        });
    }

    fn all_tasks_completed(&self, overall_success: bool) {
        self.push(BridgeEvent::AllTasksCompleted { overall_success });
    }
}

/// Forwards events into a channel for frontends that run their own loop.
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<BridgeEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<BridgeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }

    fn send(&self, event: BridgeEvent) {
        // A dropped receiver just means the frontend went away.
        let _ = self.tx.send(event);
    }
}

impl ExecutionObserver for ChannelObserver {
    fn task_status_changed(&self, task_id: u64, status: TaskStatus) {
        self.send(BridgeEvent::TaskStatusChanged { task_id, status });
    }

    fn task_progress(&self, task_id: u64, message: &str) {
        self.send(BridgeEvent::TaskProgress {
            task_id,
            message: message.to_string(),
        });
    }

    fn execution_finished(&self, task_id: u64, success: bool, message: &str, reason: StopReason) {
        self.send(BridgeEvent::ExecutionFinished {
            task_id,
            success,
            message: message.to_string(),
            reason,
        });
    }

    fn card_state_changed(&self, task_id: u64, card_id: i64, state: CardState) {
        self.send(BridgeEvent::CardStateChanged {
            task_id,
            card_id,
            state,
        });
    }

    fn all_tasks_completed(&self, overall_success: bool) {
        self.send(BridgeEvent::AllTasksCompleted { overall_success });
    }
}
