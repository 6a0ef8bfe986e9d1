// src/tasks/input.rs
//
// Input event cards: tap, swipe, text entry and keyevents, all delivered
// through `adb shell input` on the bound (or least-loaded) device.

use crate::core::NextAction;
use crate::tasks::{
    action_from_params, adb_shell, param_f64, param_i64, param_str, resolve_device, DisplayMeta,
    ParamSpec, ParamType, TaskContext, TaskModule, TaskOutcome,
};
use async_trait::async_trait;
use std::time::Duration;

const INPUT_TIMEOUT: Duration = Duration::from_secs(10);

/// Branch-port parameter block shared by every input card.
fn branch_params() -> Vec<ParamSpec> {
    use crate::core::{ACTION_JUMP, ACTION_NEXT, ACTION_STOP};
    vec![
        ParamSpec::new("on_success", "成功后", ParamType::Select)
            .options([ACTION_NEXT, ACTION_JUMP, ACTION_STOP])
            .default_value(ACTION_NEXT),
        ParamSpec::new("success_jump_target_id", "成功跳转目标", ParamType::Select)
            .widget_hint("card_selector"),
        ParamSpec::new("on_failure", "失败后", ParamType::Select)
            .options([ACTION_NEXT, ACTION_JUMP, ACTION_STOP])
            .default_value(ACTION_NEXT),
        ParamSpec::new("failure_jump_target_id", "失败跳转目标", ParamType::Select)
            .widget_hint("card_selector"),
    ]
}

async fn run_input(
    ctx: &TaskContext<'_>,
    args: Vec<String>,
    describe: &str,
) -> TaskOutcome {
    if ctx.stop.is_stopped() {
        return TaskOutcome::stopped();
    }

    let device = match resolve_device(ctx).await {
        Ok(d) => d,
        Err(e) => return TaskOutcome::failure(action_from_params(ctx.params, false), e),
    };

    let res = adb_shell(&device, args, INPUT_TIMEOUT).await;
    if res.ok {
        TaskOutcome::success(
            action_from_params(ctx.params, true),
            format!("{describe} 完成 ({device})"),
        )
    } else {
        TaskOutcome::failure(
            action_from_params(ctx.params, false),
            format!("{describe} 失败: {}", res.stderr.trim()),
        )
    }
}

// ============================================================================
// TAP
// ============================================================================

pub struct TapTask;

#[async_trait]
impl TaskModule for TapTask {
    fn task_type(&self) -> &'static str {
        "点击"
    }

    fn params_def(&self) -> Vec<ParamSpec> {
        let mut p = vec![
            ParamSpec::new("coordinate", "点击坐标", ParamType::Coordinate),
            ParamSpec::new("tap_count", "点击次数", ParamType::Int)
                .default_value(1)
                .range(1.0, 100.0),
            ParamSpec::new("tap_interval", "点击间隔 (秒)", ParamType::Float)
                .default_value(0.1)
                .range(0.0, 60.0),
        ];
        p.extend(branch_params());
        p
    }

    fn display_meta(&self) -> DisplayMeta {
        DisplayMeta {
            name: "点击".into(),
            category: "输入操作".into(),
            description: "在指定坐标执行点击。".into(),
            icon: "mdi.cursor-default-click".into(),
        }
    }

    async fn execute(&self, ctx: &mut TaskContext<'_>) -> TaskOutcome {
        let (x, y) = match parse_coordinate(ctx.params.get("coordinate")) {
            Some(c) => c,
            None => {
                return TaskOutcome::failure(
                    action_from_params(ctx.params, false),
                    "缺少点击坐标",
                )
            }
        };

        let count = param_i64(ctx.params, "tap_count").unwrap_or(1).max(1);
        let interval = param_f64(ctx.params, "tap_interval", 0.1).max(0.0);

        for i in 0..count {
            if ctx.stop.is_stopped() {
                return TaskOutcome::stopped();
            }
            let out = run_input(
                ctx,
                vec!["input".into(), "tap".into(), x.to_string(), y.to_string()],
                "点击",
            )
            .await;
            if !out.ok {
                return out;
            }
            if i + 1 < count {
                tokio::time::sleep(Duration::from_secs_f64(interval)).await;
            }
        }

        TaskOutcome::success(
            action_from_params(ctx.params, true),
            format!("点击 ({x},{y}) x{count}"),
        )
    }
}

/// Coordinates arrive as `[x, y]` or `"x,y"` depending on editor version.
pub fn parse_coordinate(v: Option<&serde_json::Value>) -> Option<(i64, i64)> {
    match v? {
        serde_json::Value::Array(arr) if arr.len() >= 2 => {
            Some((arr[0].as_i64()?, arr[1].as_i64()?))
        }
        serde_json::Value::String(s) => {
            let (x, y) = s.split_once(',')?;
            Some((x.trim().parse().ok()?, y.trim().parse().ok()?))
        }
        _ => None,
    }
}

// ============================================================================
// SWIPE
// ============================================================================

pub struct SwipeTask;

#[async_trait]
impl TaskModule for SwipeTask {
    fn task_type(&self) -> &'static str {
        "滑动"
    }

    fn params_def(&self) -> Vec<ParamSpec> {
        let mut p = vec![
            ParamSpec::new("start_coordinate", "起点坐标", ParamType::Coordinate),
            ParamSpec::new("end_coordinate", "终点坐标", ParamType::Coordinate),
            ParamSpec::new("duration_ms", "滑动时长 (毫秒)", ParamType::Int)
                .default_value(300)
                .range(50.0, 10000.0),
        ];
        p.extend(branch_params());
        p
    }

    fn display_meta(&self) -> DisplayMeta {
        DisplayMeta {
            name: "滑动".into(),
            category: "输入操作".into(),
            description: "从起点滑动到终点。".into(),
            icon: "mdi.gesture-swipe".into(),
        }
    }

    async fn execute(&self, ctx: &mut TaskContext<'_>) -> TaskOutcome {
        let from = parse_coordinate(ctx.params.get("start_coordinate"));
        let to = parse_coordinate(ctx.params.get("end_coordinate"));
        let (Some((x1, y1)), Some((x2, y2))) = (from, to) else {
            return TaskOutcome::failure(action_from_params(ctx.params, false), "缺少滑动坐标");
        };
        let duration = param_i64(ctx.params, "duration_ms").unwrap_or(300).max(50);

        run_input(
            ctx,
            vec![
                "input".into(),
                "swipe".into(),
                x1.to_string(),
                y1.to_string(),
                x2.to_string(),
                y2.to_string(),
                duration.to_string(),
            ],
            "滑动",
        )
        .await
    }
}

// ============================================================================
// TEXT
// ============================================================================

pub struct TextInputTask;

#[async_trait]
impl TaskModule for TextInputTask {
    fn task_type(&self) -> &'static str {
        "文本输入"
    }

    fn params_def(&self) -> Vec<ParamSpec> {
        let mut p = vec![ParamSpec::new("text", "输入文本", ParamType::Textarea)];
        p.extend(branch_params());
        p
    }

    fn display_meta(&self) -> DisplayMeta {
        DisplayMeta {
            name: "文本输入".into(),
            category: "输入操作".into(),
            description: "向当前焦点控件输入文本。".into(),
            icon: "mdi.keyboard".into(),
        }
    }

    async fn execute(&self, ctx: &mut TaskContext<'_>) -> TaskOutcome {
        let text = param_str(ctx.params, "text", "");
        if text.is_empty() {
            return TaskOutcome::failure(action_from_params(ctx.params, false), "输入文本为空");
        }
        // `input text` cannot carry spaces; adb expects %s escapes.
        let escaped = text.replace(' ', "%s");
        run_input(
            ctx,
            vec!["input".into(), "text".into(), escaped],
            "文本输入",
        )
        .await
    }
}

// ============================================================================
// KEYEVENT
// ============================================================================

pub struct KeyEventTask;

#[async_trait]
impl TaskModule for KeyEventTask {
    fn task_type(&self) -> &'static str {
        "按键"
    }

    fn params_def(&self) -> Vec<ParamSpec> {
        let mut p = vec![ParamSpec::new("keycode", "按键码", ParamType::Int)
            .default_value(4) // KEYCODE_BACK
            .range(0.0, 1000.0)];
        p.extend(branch_params());
        p
    }

    fn display_meta(&self) -> DisplayMeta {
        DisplayMeta {
            name: "按键".into(),
            category: "输入操作".into(),
            description: "发送一个 Android 按键事件。".into(),
            icon: "mdi.keyboard-outline".into(),
        }
    }

    async fn execute(&self, ctx: &mut TaskContext<'_>) -> TaskOutcome {
        let Some(keycode) = param_i64(ctx.params, "keycode") else {
            return TaskOutcome::failure(action_from_params(ctx.params, false), "缺少按键码");
        };
        run_input(
            ctx,
            vec!["input".into(), "keyevent".into(), keycode.to_string()],
            "按键",
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn coordinate_accepts_array_and_string_forms() {
        assert_eq!(parse_coordinate(Some(&json!([100, 200]))), Some((100, 200)));
        assert_eq!(parse_coordinate(Some(&json!("320, 480"))), Some((320, 480)));
        assert_eq!(parse_coordinate(Some(&json!("junk"))), None);
        assert_eq!(parse_coordinate(None), None);
    }
}
