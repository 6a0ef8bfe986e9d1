// src/tasks/delay.rs
//
// The delay card: fixed or random sleep, interruptible at 100ms
// granularity. The realized sleep is stored in the run counters so later
// cards can reference the actual (possibly random) value.

use crate::core::NextAction;
use crate::tasks::{
    param_f64, param_str, DisplayMeta, ParamCondition, ParamSpec, ParamType, TaskContext,
    TaskModule, TaskOutcome,
};
use async_trait::async_trait;
use rand::Rng;
use std::time::Duration;

pub const TASK_TYPE: &str = "延迟";

const MODE_FIXED: &str = "固定延迟";
const MODE_RANDOM: &str = "随机延迟";
const STOP_POLL: Duration = Duration::from_millis(100);

pub struct DelayTask;

#[async_trait]
impl TaskModule for DelayTask {
    fn task_type(&self) -> &'static str {
        TASK_TYPE
    }

    fn params_def(&self) -> Vec<ParamSpec> {
        vec![
            ParamSpec::new("delay_mode", "延迟模式", ParamType::Select)
                .options([MODE_FIXED, MODE_RANDOM])
                .default_value(MODE_FIXED),
            ParamSpec::new("---fixed---", "固定延迟参数", ParamType::Separator)
                .condition(ParamCondition::equals("delay_mode", MODE_FIXED)),
            ParamSpec::new("fixed_delay", "固定延迟 (秒)", ParamType::Float)
                .default_value(1.0)
                .range(0.0, 3600.0)
                .condition(ParamCondition::equals("delay_mode", MODE_FIXED)),
            ParamSpec::new("---random---", "随机延迟参数", ParamType::Separator)
                .condition(ParamCondition::equals("delay_mode", MODE_RANDOM)),
            ParamSpec::new("min_delay", "最小延迟 (秒)", ParamType::Float)
                .default_value(0.5)
                .range(0.0, 3600.0)
                .condition(ParamCondition::equals("delay_mode", MODE_RANDOM)),
            ParamSpec::new("max_delay", "最大延迟 (秒)", ParamType::Float)
                .default_value(2.0)
                .range(0.0, 3600.0)
                .condition(ParamCondition::equals("delay_mode", MODE_RANDOM)),
        ]
    }

    fn display_meta(&self) -> DisplayMeta {
        DisplayMeta {
            name: "等待 (延迟)".into(),
            category: "流程控制".into(),
            description: "暂停执行固定的秒数或一段随机时间。".into(),
            icon: "mdi.timer-sand".into(),
        }
    }

    fn never_branches(&self) -> bool {
        true
    }

    async fn execute(&self, ctx: &mut TaskContext<'_>) -> TaskOutcome {
        let mode = match param_str(ctx.params, "delay_mode", MODE_FIXED) {
            MODE_FIXED | "fixed" => "fixed",
            MODE_RANDOM | "random" => "random",
            other => {
                log::warn!("unknown delay mode '{other}', skipping delay");
                return TaskOutcome::success(NextAction::Next, "未知延迟模式，跳过");
            }
        };

        let seconds = if mode == "fixed" {
            param_f64(ctx.params, "fixed_delay", 1.0)
        } else {
            let min = param_f64(ctx.params, "min_delay", 0.5);
            let max = param_f64(ctx.params, "max_delay", 2.0);
            if min > max {
                log::warn!("random delay misconfigured (min {min} > max {max}), using min");
                min
            } else {
                rand::thread_rng().gen_range(min..=max)
            }
        };

        if !seconds.is_finite() || seconds < 0.0 {
            return TaskOutcome::failure(NextAction::Next, format!("无效的延迟值: {seconds}"));
        }

        log::info!("delay {seconds:.2}s (card {})", ctx.card_id);
        ctx.counters
            .insert(format!("__last_delay_{}", ctx.card_id), seconds);

        // Interruptible sleep: poll the stop flag every 100ms.
        let total = Duration::from_secs_f64(seconds);
        let mut elapsed = Duration::ZERO;
        while elapsed < total {
            if ctx.stop.is_stopped() {
                log::info!(
                    "delay interrupted after {:.2}/{:.2}s",
                    elapsed.as_secs_f64(),
                    seconds
                );
                return TaskOutcome::stopped();
            }
            let step = STOP_POLL.min(total - elapsed);
            tokio::time::sleep(step).await;
            elapsed += step;
        }

        TaskOutcome::success(NextAction::Next, format!("延迟 {seconds:.2} 秒完成"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Counters, ExecutionMode};
    use crate::tasks::StopToken;
    use serde_json::json;
    use std::time::Instant;

    async fn run_with(
        params: serde_json::Value,
        stop: StopToken,
    ) -> (TaskOutcome, Counters) {
        let params = params.as_object().cloned().unwrap_or_default();
        let mut counters = Counters::new();
        let out = {
            let mut ctx = TaskContext {
                params: &params,
                counters: &mut counters,
                execution_mode: ExecutionMode::Foreground,
                target_window: None,
                window_region: None,
                card_id: 3,
                stop,
                images: None,
                images_dir: std::path::PathBuf::new(),
                device_id: None,
            };
            DelayTask.execute(&mut ctx).await
        };
        (out, counters)
    }

    #[tokio::test]
    async fn fixed_delay_sleeps_and_records_counter() {
        let t0 = Instant::now();
        let (out, counters) = run_with(
            json!({"delay_mode": "固定延迟", "fixed_delay": 0.3}),
            StopToken::new(),
        )
        .await;
        assert!(out.ok);
        assert_eq!(out.action, NextAction::Next);
        let elapsed = t0.elapsed().as_secs_f64();
        assert!(elapsed >= 0.28, "slept only {elapsed:.3}s");
        assert_eq!(counters.get("__last_delay_3"), Some(&0.3));
    }

    #[tokio::test]
    async fn random_delay_stays_in_range() {
        let (out, counters) = run_with(
            json!({"delay_mode": "随机延迟", "min_delay": 0.05, "max_delay": 0.1}),
            StopToken::new(),
        )
        .await;
        assert!(out.ok);
        let realized = counters["__last_delay_3"];
        assert!((0.05..=0.1).contains(&realized), "got {realized}");
    }

    #[tokio::test]
    async fn stop_interrupts_within_polling_budget() {
        let stop = StopToken::new();
        let stopper = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            stopper.request_stop();
        });

        let t0 = Instant::now();
        let (out, _) = run_with(json!({"fixed_delay": 10.0}), stop).await;
        assert!(!out.ok);
        assert_eq!(out.action, NextAction::Stop);
        assert!(t0.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn inverted_random_range_uses_min() {
        let (out, counters) = run_with(
            json!({"delay_mode": "随机延迟", "min_delay": 0.05, "max_delay": 0.01}),
            StopToken::new(),
        )
        .await;
        assert!(out.ok);
        assert_eq!(counters["__last_delay_3"], 0.05);
    }
}
