// src/tasks.rs
//
// =============================================================================
// DROIDFLOW: TASK CONTRACT & REGISTRY
// =============================================================================
//
// The Toolbox.
//
// Responsibilities:
// 1. Define the `TaskModule` trait every card type implements.
// 2. Define the parameter schema tasks expose to the editor.
// 3. Dispatch `task_type` strings to concrete modules via the registry.
//
// Tasks never return `Err` to the executor: every outcome is a value with
// an ok flag and a routing action. The executor owns state transitions.

use crate::core::{
    Counters, ExecutionMode, NextAction, ACTION_JUMP, ACTION_NEXT, ACTION_REPEAT, ACTION_STOP,
};
use crate::pool::{AdbCommand, AdbPool};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub mod app;
pub mod delay;
pub mod find_image;
pub mod input;
pub mod start;

// ============================================================================
// 1. PARAMETER SCHEMA
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    Text,
    Int,
    Float,
    Bool,
    Select,
    Radio,
    Textarea,
    File,
    Coordinate,
    MultiCoordinate,
    Color,
    Region,
    Hidden,
    Separator,
    Button,
}

/// One equality test against a peer parameter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParamEq {
    pub param: String,
    pub value: Value,
}

/// Visibility condition in disjunctive normal form: the field shows when
/// any clause has all of its equalities satisfied. Strictly a UI concern;
/// the executor ignores it but must carry it through round-trips.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParamCondition {
    pub any_of: Vec<Vec<ParamEq>>,
}

impl ParamCondition {
    pub fn equals(param: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            any_of: vec![vec![ParamEq {
                param: param.into(),
                value: value.into(),
            }]],
        }
    }
}

/// Declaration of one editable parameter.
#[derive(Debug, Clone, Serialize)]
pub struct ParamSpec {
    pub name: String,
    pub label: String,
    pub kind: ParamType,
    pub default: Value,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub options: Vec<String>,
    pub condition: Option<ParamCondition>,
    pub widget_hint: Option<String>,
    /// Transient UI state is declared with `false` and never serialized.
    pub save_to_workflow: bool,
}

impl ParamSpec {
    pub fn new(name: impl Into<String>, label: impl Into<String>, kind: ParamType) -> Self {
        Self {
            name: name.into(),
            label: label.into(),
            kind,
            default: Value::Null,
            min: None,
            max: None,
            options: Vec::new(),
            condition: None,
            widget_hint: None,
            save_to_workflow: true,
        }
    }

    pub fn default_value(mut self, v: impl Into<Value>) -> Self {
        self.default = v.into();
        self
    }

    pub fn range(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    pub fn options(mut self, options: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.options = options.into_iter().map(Into::into).collect();
        self
    }

    pub fn condition(mut self, c: ParamCondition) -> Self {
        self.condition = Some(c);
        self
    }

    pub fn widget_hint(mut self, hint: impl Into<String>) -> Self {
        self.widget_hint = Some(hint.into());
        self
    }

    pub fn transient(mut self) -> Self {
        self.save_to_workflow = false;
        self
    }
}

/// Editor-facing metadata.
#[derive(Debug, Clone, Serialize)]
pub struct DisplayMeta {
    pub name: String,
    pub category: String,
    pub description: String,
    pub icon: String,
}

// ============================================================================
// 2. EXECUTION CONTEXT
// ============================================================================

/// Cooperative cancellation flag shared between host and task.
#[derive(Clone, Default)]
pub struct StopToken {
    flag: Arc<AtomicBool>,
    parent: Option<Box<StopToken>>,
}

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that also observes this one: stopping the parent stops
    /// every child, stopping a child leaves siblings running.
    pub fn child(&self) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            parent: Some(Box::new(self.clone())),
        }
    }

    pub fn request_stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || self.parent.as_ref().map(|p| p.is_stopped()).unwrap_or(false)
    }
}

/// Image bytes by key. `memory://` keys are editor-held buffers; anything
/// else is a path under the workflow's image directory.
pub trait ImageProvider: Send + Sync {
    fn image_data(&self, key: &str) -> Option<Vec<u8>>;
}

pub fn resolve_image(
    provider: Option<&dyn ImageProvider>,
    images_dir: &std::path::Path,
    key: &str,
) -> Option<Vec<u8>> {
    if key.starts_with("memory://") {
        return provider?.image_data(key);
    }
    let path = if std::path::Path::new(key).is_absolute() {
        PathBuf::from(key)
    } else {
        images_dir.join(key)
    };
    std::fs::read(path).ok()
}

/// Everything a task invocation may touch.
pub struct TaskContext<'a> {
    pub params: &'a serde_json::Map<String, Value>,
    pub counters: &'a mut Counters,
    pub execution_mode: ExecutionMode,
    pub target_window: Option<u64>,
    pub window_region: Option<[i32; 4]>,
    pub card_id: i64,
    pub stop: StopToken,
    pub images: Option<Arc<dyn ImageProvider>>,
    pub images_dir: PathBuf,
    /// Device binding of the surrounding workflow task, when configured.
    pub device_id: Option<String>,
}

/// The result of one task execution.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub ok: bool,
    pub action: NextAction,
    pub message: String,
}

impl TaskOutcome {
    pub fn success(action: NextAction, message: impl Into<String>) -> Self {
        Self {
            ok: true,
            action,
            message: message.into(),
        }
    }

    pub fn failure(action: NextAction, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            action,
            message: message.into(),
        }
    }

    pub fn stopped() -> Self {
        Self::failure(NextAction::Stop, "任务被停止")
    }
}

// ============================================================================
// 3. THE TASK TRAIT
// ============================================================================

#[async_trait]
pub trait TaskModule: Send + Sync {
    /// Stable key cards reference via `task_type`.
    fn task_type(&self) -> &'static str;

    /// Ordered parameter declarations for the editor.
    fn params_def(&self) -> Vec<ParamSpec>;

    fn display_meta(&self) -> DisplayMeta;

    /// Task types that never expose success/failure branch ports.
    fn never_branches(&self) -> bool {
        false
    }

    async fn execute(&self, ctx: &mut TaskContext<'_>) -> TaskOutcome;
}

// ============================================================================
// 4. THE REGISTRY
// ============================================================================

#[derive(Clone, Default)]
pub struct TaskRegistry {
    modules: HashMap<String, Arc<dyn TaskModule>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The stock task set.
    pub fn with_builtins() -> Self {
        let mut reg = Self::new();
        reg.register(Arc::new(start::StartTask));
        reg.register(Arc::new(delay::DelayTask));
        reg.register(Arc::new(input::TapTask));
        reg.register(Arc::new(input::SwipeTask));
        reg.register(Arc::new(input::TextInputTask));
        reg.register(Arc::new(input::KeyEventTask));
        reg.register(Arc::new(app::AppStartTask));
        reg.register(Arc::new(app::AppStopTask));
        reg.register(Arc::new(find_image::FindImageTask::default()));
        reg
    }

    pub fn register(&mut self, module: Arc<dyn TaskModule>) {
        self.modules.insert(module.task_type().to_string(), module);
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskModule>> {
        self.modules.get(task_type).cloned()
    }

    pub fn task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.modules.keys().cloned().collect();
        types.sort();
        types
    }

    /// Whether a card of this type may expose branch ports at all.
    pub fn branches_allowed(&self, task_type: &str) -> bool {
        self.get(task_type).map(|m| !m.never_branches()).unwrap_or(true)
    }
}

// ============================================================================
// 5. SHARED HELPERS
// ============================================================================

/// Reads a numeric parameter, tolerating stringly-typed editor values.
pub fn param_f64(params: &serde_json::Map<String, Value>, name: &str, default: f64) -> f64 {
    match params.get(name) {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(default),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(default),
        _ => default,
    }
}

pub fn param_i64(params: &serde_json::Map<String, Value>, name: &str) -> Option<i64> {
    match params.get(name) {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn param_str<'a>(
    params: &'a serde_json::Map<String, Value>,
    name: &str,
    default: &'a str,
) -> &'a str {
    params.get(name).and_then(Value::as_str).unwrap_or(default)
}

/// Routes an outcome through the card's `on_success` / `on_failure`
/// parameters. Absent or default parameters follow the sequential edge;
/// a jump with no usable target degrades to the sequential edge.
pub fn action_from_params(params: &serde_json::Map<String, Value>, ok: bool) -> NextAction {
    let (action_key, target_key) = if ok {
        ("on_success", "success_jump_target_id")
    } else {
        ("on_failure", "failure_jump_target_id")
    };

    match param_str(params, action_key, ACTION_NEXT) {
        ACTION_JUMP => match param_i64(params, target_key) {
            Some(id) => NextAction::JumpTo(id),
            None => NextAction::Next,
        },
        ACTION_STOP => NextAction::Stop,
        ACTION_REPEAT => NextAction::Repeat,
        _ => NextAction::Next,
    }
}

/// Picks the device an adb-backed task should drive: the workflow's
/// binding first, the least-loaded healthy device otherwise.
pub async fn resolve_device(ctx: &TaskContext<'_>) -> Result<String, String> {
    if let Some(id) = &ctx.device_id {
        return Ok(id.clone());
    }
    match AdbPool::global().device_for_load_balancing().await {
        Some(dev) => Ok(dev.device_id),
        None => Err("没有可用的健康设备".to_string()),
    }
}

/// One `adb shell …` against a device through the global pool.
pub async fn adb_shell(
    device_id: &str,
    args: impl IntoIterator<Item = impl Into<String>>,
    timeout: Duration,
) -> crate::pool::CommandResult {
    let mut argv: Vec<String> = vec!["shell".into()];
    argv.extend(args.into_iter().map(Into::into));
    let cmd = AdbCommand::new(device_id, argv).timeout(timeout);
    AdbPool::global().execute_sync(&cmd).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(v: Value) -> serde_json::Map<String, Value> {
        v.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn default_routing_follows_sequential_edge() {
        let p = params(json!({}));
        assert_eq!(action_from_params(&p, true), NextAction::Next);
        assert_eq!(action_from_params(&p, false), NextAction::Next);
    }

    #[test]
    fn jump_routing_reads_the_matching_target() {
        let p = params(json!({
            "on_success": ACTION_NEXT,
            "on_failure": ACTION_JUMP,
            "failure_jump_target_id": 7,
        }));
        assert_eq!(action_from_params(&p, true), NextAction::Next);
        assert_eq!(action_from_params(&p, false), NextAction::JumpTo(7));
    }

    #[test]
    fn jump_without_target_degrades_to_next() {
        let p = params(json!({"on_success": ACTION_JUMP}));
        assert_eq!(action_from_params(&p, true), NextAction::Next);
    }

    #[test]
    fn stringly_typed_targets_still_parse() {
        let p = params(json!({"on_failure": ACTION_JUMP, "failure_jump_target_id": "12"}));
        assert_eq!(action_from_params(&p, false), NextAction::JumpTo(12));
    }

    #[test]
    fn stop_and_repeat_literals_route() {
        let p = params(json!({"on_success": ACTION_STOP, "on_failure": ACTION_REPEAT}));
        assert_eq!(action_from_params(&p, true), NextAction::Stop);
        assert_eq!(action_from_params(&p, false), NextAction::Repeat);
    }

    #[test]
    fn registry_knows_builtins() {
        let reg = TaskRegistry::with_builtins();
        assert!(reg.get("起点").is_some());
        assert!(reg.get("延迟").is_some());
        assert!(reg.get("查找图片").is_some());
        assert!(reg.get("不存在的类型").is_none());
        // Start/delay never branch; image search does.
        assert!(!reg.branches_allowed("起点"));
        assert!(!reg.branches_allowed("延迟"));
        assert!(reg.branches_allowed("查找图片"));
    }

    #[test]
    fn numeric_params_tolerate_strings() {
        let p = params(json!({"a": 1.5, "b": "2.5", "c": "x"}));
        assert_eq!(param_f64(&p, "a", 0.0), 1.5);
        assert_eq!(param_f64(&p, "b", 0.0), 2.5);
        assert_eq!(param_f64(&p, "c", 9.0), 9.0);
        assert_eq!(param_f64(&p, "missing", 3.0), 3.0);
    }
}
