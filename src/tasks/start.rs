// src/tasks/start.rs
//
// The start card. Executes instantly; its only job is deciding where the
// run begins — the sequential edge by default, or an explicit first card.

use crate::core::NextAction;
use crate::tasks::{
    param_i64, DisplayMeta, ParamSpec, ParamType, TaskContext, TaskModule, TaskOutcome,
};
use async_trait::async_trait;

pub const TASK_TYPE: &str = "起点";

pub struct StartTask;

#[async_trait]
impl TaskModule for StartTask {
    fn task_type(&self) -> &'static str {
        TASK_TYPE
    }

    fn params_def(&self) -> Vec<ParamSpec> {
        vec![ParamSpec::new("next_step_card_id", "下一步骤卡片", ParamType::Select)
            .widget_hint("card_selector")]
    }

    fn display_meta(&self) -> DisplayMeta {
        DisplayMeta {
            name: "起点".into(),
            category: "流程控制".into(),
            description: "工作流的入口。可指定第一个执行的卡片。".into(),
            icon: "mdi.flag".into(),
        }
    }

    fn never_branches(&self) -> bool {
        true
    }

    async fn execute(&self, ctx: &mut TaskContext<'_>) -> TaskOutcome {
        match param_i64(ctx.params, "next_step_card_id") {
            Some(next_id) => {
                log::info!("start card jumps to card {next_id}");
                TaskOutcome::success(NextAction::JumpTo(next_id), "起点跳转")
            }
            None => TaskOutcome::success(NextAction::Next, "起点"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Counters, ExecutionMode};
    use crate::tasks::StopToken;
    use serde_json::json;

    async fn run(params: serde_json::Value) -> TaskOutcome {
        let params = params.as_object().cloned().unwrap_or_default();
        let mut counters = Counters::new();
        let mut ctx = TaskContext {
            params: &params,
            counters: &mut counters,
            execution_mode: ExecutionMode::Foreground,
            target_window: None,
            window_region: None,
            card_id: 0,
            stop: StopToken::new(),
            images: None,
            images_dir: std::path::PathBuf::new(),
            device_id: None,
        };
        StartTask.execute(&mut ctx).await
    }

    #[tokio::test]
    async fn follows_sequential_edge_by_default() {
        let out = run(json!({})).await;
        assert!(out.ok);
        assert_eq!(out.action, NextAction::Next);
    }

    #[tokio::test]
    async fn explicit_next_card_becomes_a_jump() {
        let out = run(json!({"next_step_card_id": 5})).await;
        assert!(out.ok);
        assert_eq!(out.action, NextAction::JumpTo(5));
    }

    #[tokio::test]
    async fn unparsable_next_card_falls_back() {
        let out = run(json!({"next_step_card_id": "none"})).await;
        assert_eq!(out.action, NextAction::Next);
    }
}
