// src/tasks/find_image.rs
//
// The image-search card. Template pixels come from the image provider
// (`memory://` keys) or the workflow's image directory; the actual
// matching engine is an external collaborator plugged in as a `Matcher`.
// Without one, every search misses — which still exercises the card's
// failure routing (on_failure jump/stop/next).

use crate::tasks::{
    action_from_params, adb_shell, param_f64, resolve_device, resolve_image, DisplayMeta,
    ParamSpec, ParamType, TaskContext, TaskModule, TaskOutcome,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

pub const TASK_TYPE: &str = "查找图片";

const SCREENCAP_TIMEOUT: Duration = Duration::from_secs(15);

/// Template matching over a raw screenshot. Implementations return the
/// center of the best match above the confidence threshold.
pub trait Matcher: Send + Sync {
    fn find(&self, screen: &[u8], template: &[u8], confidence: f64) -> Option<(i64, i64)>;
}

#[derive(Default)]
pub struct FindImageTask {
    matcher: Option<Arc<dyn Matcher>>,
}

impl FindImageTask {
    pub fn with_matcher(matcher: Arc<dyn Matcher>) -> Self {
        Self {
            matcher: Some(matcher),
        }
    }
}

#[async_trait]
impl TaskModule for FindImageTask {
    fn task_type(&self) -> &'static str {
        TASK_TYPE
    }

    fn params_def(&self) -> Vec<ParamSpec> {
        use crate::core::{ACTION_JUMP, ACTION_NEXT, ACTION_STOP};
        vec![
            ParamSpec::new("image_file", "模板图片", ParamType::File).widget_hint("image_picker"),
            ParamSpec::new("confidence", "匹配置信度", ParamType::Float)
                .default_value(0.8)
                .range(0.1, 1.0),
            ParamSpec::new("click_on_match", "匹配后点击", ParamType::Bool).default_value(true),
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

    fn display_meta(&self) -> DisplayMeta {
        DisplayMeta {
            name: "查找图片".into(),
            category: "图像识别".into(),
            description: "在屏幕上查找模板图片，可选择命中后点击。".into(),
            icon: "mdi.image-search".into(),
        }
    }

    async fn execute(&self, ctx: &mut TaskContext<'_>) -> TaskOutcome {
        if ctx.stop.is_stopped() {
            return TaskOutcome::stopped();
        }

        let key = crate::tasks::param_str(ctx.params, "image_file", "");
        if key.is_empty() {
            return TaskOutcome::failure(action_from_params(ctx.params, false), "缺少模板图片");
        }

        let Some(template) =
            resolve_image(ctx.images.as_deref(), &ctx.images_dir, key)
        else {
            // A missing template is an ordinary miss, not a fatal error —
            // workflows use it to probe "is this screen gone yet".
            log::info!("template unavailable: {key}");
            return TaskOutcome::failure(
                action_from_params(ctx.params, false),
                format!("未找到模板图片: {key}"),
            );
        };

        let Some(matcher) = &self.matcher else {
            log::info!("no matcher installed; reporting miss for {key}");
            return TaskOutcome::failure(
                action_from_params(ctx.params, false),
                "未安装图像匹配引擎".to_string(),
            );
        };

        let device = match resolve_device(ctx).await {
            Ok(d) => d,
            Err(e) => return TaskOutcome::failure(action_from_params(ctx.params, false), e),
        };

        let shot = adb_shell(&device, ["screencap", "-p"], SCREENCAP_TIMEOUT).await;
        if !shot.ok {
            return TaskOutcome::failure(
                action_from_params(ctx.params, false),
                format!("截图失败: {}", shot.stderr.trim()),
            );
        }

        let confidence = param_f64(ctx.params, "confidence", 0.8);
        match matcher.find(shot.stdout.as_bytes(), &template, confidence) {
            Some((x, y)) => {
                let click = ctx
                    .params
                    .get("click_on_match")
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(true);
                if click {
                    let (x_arg, y_arg) = (x.to_string(), y.to_string());
                    let tap = adb_shell(
                        &device,
                        ["input", "tap", x_arg.as_str(), y_arg.as_str()],
                        SCREENCAP_TIMEOUT,
                    )
                    .await;
                    if !tap.ok {
                        return TaskOutcome::failure(
                            action_from_params(ctx.params, false),
                            format!("命中但点击失败: {}", tap.stderr.trim()),
                        );
                    }
                }
                TaskOutcome::success(
                    action_from_params(ctx.params, true),
                    format!("匹配成功 ({x},{y})"),
                )
            }
            None => TaskOutcome::failure(
                action_from_params(ctx.params, false),
                format!("未匹配到模板: {key}"),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Counters, ExecutionMode, NextAction, ACTION_JUMP};
    use crate::tasks::StopToken;
    use serde_json::json;

    #[tokio::test]
    async fn forced_miss_routes_through_on_failure() {
        let params = json!({
            "image_file": "memory://missing",
            "on_failure": ACTION_JUMP,
            "failure_jump_target_id": 2,
        })
        .as_object()
        .cloned()
        .unwrap();
        let mut counters = Counters::new();
        let mut ctx = TaskContext {
            params: &params,
            counters: &mut counters,
            execution_mode: ExecutionMode::Foreground,
            target_window: None,
            window_region: None,
            card_id: 1,
            stop: StopToken::new(),
            images: None,
            images_dir: std::path::PathBuf::new(),
            device_id: None,
        };

        let out = FindImageTask::default().execute(&mut ctx).await;
        assert!(!out.ok);
        assert_eq!(out.action, NextAction::JumpTo(2));
    }
}
