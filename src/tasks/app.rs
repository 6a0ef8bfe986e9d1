// src/tasks/app.rs
//
// App lifecycle cards: launch a package via the monkey shortcut (works
// without knowing the main activity) and force-stop it via `am`.

use crate::tasks::{
    action_from_params, adb_shell, param_str, resolve_device, DisplayMeta, ParamSpec, ParamType,
    TaskContext, TaskModule, TaskOutcome,
};
use async_trait::async_trait;
use std::time::Duration;

const APP_TIMEOUT: Duration = Duration::from_secs(20);

fn package_param() -> ParamSpec {
    ParamSpec::new("package_name", "应用包名", ParamType::Text)
        .widget_hint("package_selector")
}

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

pub struct AppStartTask;

#[async_trait]
impl TaskModule for AppStartTask {
    fn task_type(&self) -> &'static str {
        "启动应用"
    }

    fn params_def(&self) -> Vec<ParamSpec> {
        let mut p = vec![package_param()];
        p.extend(branch_params());
        p
    }

    fn display_meta(&self) -> DisplayMeta {
        DisplayMeta {
            name: "启动应用".into(),
            category: "应用管理".into(),
            description: "在设备上启动指定包名的应用。".into(),
            icon: "mdi.rocket-launch".into(),
        }
    }

    async fn execute(&self, ctx: &mut TaskContext<'_>) -> TaskOutcome {
        let package = param_str(ctx.params, "package_name", "");
        if package.is_empty() {
            return TaskOutcome::failure(action_from_params(ctx.params, false), "缺少应用包名");
        }
        if ctx.stop.is_stopped() {
            return TaskOutcome::stopped();
        }

        let device = match resolve_device(ctx).await {
            Ok(d) => d,
            Err(e) => return TaskOutcome::failure(action_from_params(ctx.params, false), e),
        };

        let res = adb_shell(
            &device,
            [
                "monkey",
                "-p",
                package,
                "-c",
                "android.intent.category.LAUNCHER",
                "1",
            ],
            APP_TIMEOUT,
        )
        .await;

        // monkey prints injection stats on success and "No activities" on a
        // missing package; rely on both channels.
        let launched = res.ok && !res.stdout.contains("No activities found");
        if launched {
            TaskOutcome::success(
                action_from_params(ctx.params, true),
                format!("已启动 {package} ({device})"),
            )
        } else {
            TaskOutcome::failure(
                action_from_params(ctx.params, false),
                format!("启动 {package} 失败: {}", res.stderr.trim()),
            )
        }
    }
}

pub struct AppStopTask;

#[async_trait]
impl TaskModule for AppStopTask {
    fn task_type(&self) -> &'static str {
        "停止应用"
    }

    fn params_def(&self) -> Vec<ParamSpec> {
        let mut p = vec![package_param()];
        p.extend(branch_params());
        p
    }

    fn display_meta(&self) -> DisplayMeta {
        DisplayMeta {
            name: "停止应用".into(),
            category: "应用管理".into(),
            description: "强制停止指定包名的应用。".into(),
            icon: "mdi.stop-circle".into(),
        }
    }

    async fn execute(&self, ctx: &mut TaskContext<'_>) -> TaskOutcome {
        let package = param_str(ctx.params, "package_name", "");
        if package.is_empty() {
            return TaskOutcome::failure(action_from_params(ctx.params, false), "缺少应用包名");
        }
        if ctx.stop.is_stopped() {
            return TaskOutcome::stopped();
        }

        let device = match resolve_device(ctx).await {
            Ok(d) => d,
            Err(e) => return TaskOutcome::failure(action_from_params(ctx.params, false), e),
        };

        let res = adb_shell(&device, ["am", "force-stop", package], APP_TIMEOUT).await;
        if res.ok {
            TaskOutcome::success(
                action_from_params(ctx.params, true),
                format!("已停止 {package} ({device})"),
            )
        } else {
            TaskOutcome::failure(
                action_from_params(ctx.params, false),
                format!("停止 {package} 失败: {}", res.stderr.trim()),
            )
        }
    }
}
