// src/core.rs
//
// =============================================================================
// DROIDFLOW: CORE SCHEMA AUTHORITY
// =============================================================================
//
// The shared vocabulary of the engine.
// This file defines the strict data contracts between the discovery layer
// (registry/locator/ports), the connection pool, and the workflow runtime.
//
// Design Principles:
// 1. Enums over stringly-typed state: every lifecycle is a closed set.
// 2. Wire literals live here once, never scattered across modules.
// 3. Everything that crosses a module boundary is serde-serializable.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

// ============================================================================
// 1. EMULATOR FAMILIES
// ============================================================================

/// Which vendor an emulator window / port / adb binary belongs to.
/// The family decides which adb binary talks to a device.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EmulatorKind {
    Mumu,
    Ldplayer,
    Unknown,
}

impl EmulatorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmulatorKind::Mumu => "mumu",
            EmulatorKind::Ldplayer => "ldplayer",
            EmulatorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for EmulatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The set of adb binaries known to the engine, one slot per family plus
/// a generic fallback (system PATH / Android SDK).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdbPaths {
    pub generic: Option<PathBuf>,
    pub mumu: Option<PathBuf>,
    pub ldplayer: Option<PathBuf>,
}

impl AdbPaths {
    /// Family-specific binary, falling back to the generic one.
    pub fn for_kind(&self, kind: EmulatorKind) -> Option<&Path> {
        let specific = match kind {
            EmulatorKind::Mumu => self.mumu.as_deref(),
            EmulatorKind::Ldplayer => self.ldplayer.as_deref(),
            EmulatorKind::Unknown => None,
        };
        specific.or(self.generic.as_deref())
    }

    pub fn is_empty(&self) -> bool {
        self.generic.is_none() && self.mumu.is_none() && self.ldplayer.is_none()
    }

    /// All distinct binaries, for operations that fan out over every adb
    /// (kill-server, `adb devices` harvesting).
    pub fn all(&self) -> Vec<&Path> {
        let mut out: Vec<&Path> = Vec::new();
        for p in [
            self.generic.as_deref(),
            self.ldplayer.as_deref(),
            self.mumu.as_deref(),
        ]
        .into_iter()
        .flatten()
        {
            if !out.contains(&p) {
                out.push(p);
            }
        }
        out
    }
}

// ============================================================================
// 2. DEVICE LIFECYCLE
// ============================================================================

/// Connection state as reported by `adb get-state` (or the MuMu manager).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    #[serde(rename = "device")]
    Online,
    Offline,
    Unauthorized,
    Unknown,
}

impl DeviceStatus {
    /// Maps the raw `adb get-state` stdout to a status.
    pub fn from_get_state(s: &str) -> Self {
        match s.trim() {
            "device" => DeviceStatus::Online,
            "offline" => DeviceStatus::Offline,
            "unauthorized" => DeviceStatus::Unauthorized,
            _ => DeviceStatus::Unknown,
        }
    }
}

/// Coarse rating of a device's recent command success ratio.
/// Drives eligibility for dispatch and reconnect scheduling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionHealth {
    Healthy,
    Degraded,
    Unhealthy,
    Critical,
}

impl ConnectionHealth {
    /// Health is a monotone function of the success ratio: more successes
    /// never lower the rating. A device with no history is healthy.
    pub fn from_counts(successes: u64, errors: u64) -> Self {
        let total = successes + errors;
        if total == 0 {
            return ConnectionHealth::Healthy;
        }
        let ratio = successes as f64 / total as f64;
        if ratio >= 0.95 {
            ConnectionHealth::Healthy
        } else if ratio >= 0.80 {
            ConnectionHealth::Degraded
        } else if ratio >= 0.50 {
            ConnectionHealth::Unhealthy
        } else {
            ConnectionHealth::Critical
        }
    }
}

/// Dispatch priority of a queued adb command. Equal priorities are FIFO.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum CommandPriority {
    Normal,
    High,
    Critical,
}

impl Default for CommandPriority {
    fn default() -> Self {
        CommandPriority::Normal
    }
}

// ============================================================================
// 3. WORKFLOW RUNTIME STATES
// ============================================================================

/// Why a workflow run ended. The task manager routes inter-workflow jumps
/// off this value.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Success,
    Failed,
    NoNext,
    Stopped,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::Success => "success",
            StopReason::Failed => "failed",
            StopReason::NoNext => "no_next",
            StopReason::Stopped => "stopped",
        }
    }
}

/// Lifecycle of a managed workflow task (one tab in the frontend).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Idle,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl TaskStatus {
    /// Only settled tasks may be (re)started.
    pub fn can_execute(&self) -> bool {
        matches!(
            self,
            TaskStatus::Idle | TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Stopped
        )
    }

    pub fn can_stop(&self) -> bool {
        matches!(self, TaskStatus::Running)
    }

    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Stopped
        )
    }
}

/// Per-card execution state, published to the frontend bridge.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CardState {
    Idle,
    Executing,
    Success,
    Failure,
}

// ============================================================================
// 4. TASK ACTION LITERALS
// ============================================================================

// These literals are the wire values carried by card parameters
// (`on_success` / `on_failure`) and returned by task modules. They come
// from the editor's vocabulary and must round-trip byte-identically.
pub const ACTION_NEXT: &str = "执行下一步";
pub const ACTION_JUMP: &str = "跳转到步骤";
pub const ACTION_STOP: &str = "停止工作流";
pub const ACTION_REPEAT: &str = "继续执行本步骤";

/// Routing directive returned by a task execution.
#[derive(Debug, Clone, PartialEq)]
pub enum NextAction {
    /// Follow the outgoing sequential edge.
    Next,
    /// Continue at a specific card.
    JumpTo(i64),
    /// Terminate the run.
    Stop,
    /// Re-execute the current card.
    Repeat,
}

impl NextAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            NextAction::Next => ACTION_NEXT,
            NextAction::JumpTo(_) => ACTION_JUMP,
            NextAction::Stop => ACTION_STOP,
            NextAction::Repeat => ACTION_REPEAT,
        }
    }
}

/// Scratch values tasks stash for later steps of the same run
/// (e.g. the realized sleep of a random delay).
pub type Counters = HashMap<String, f64>;

// ============================================================================
// 5. ENGINE CONFIGURATION
// ============================================================================

/// Whether tasks drive the emulator window in the foreground (real input)
/// or in the background (message injection).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Foreground,
    Background,
}

impl Default for ExecutionMode {
    fn default() -> Self {
        ExecutionMode::Foreground
    }
}

/// Whether the task manager runs its workflows serially or in parallel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Sync,
    Async,
}

impl Default for RunMode {
    fn default() -> Self {
        RunMode::Sync
    }
}

/// A window the operator bound a workflow to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundWindow {
    pub hwnd: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Engine configuration as read from the operator's config file.
/// Unknown keys are ignored so frontend-only settings can ride along.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    #[serde(default)]
    pub task_execution_mode: RunMode,
    #[serde(default)]
    pub target_window_title: String,
    #[serde(default)]
    pub bound_windows: Vec<BoundWindow>,
}

impl EngineConfig {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let cfg = serde_json::from_str(&text)?;
        Ok(cfg)
    }

    /// The window handle a run should target: the first enabled bound
    /// window wins; no binding means the tasks decide per device.
    pub fn resolve_target_window(&self) -> Option<u64> {
        self.bound_windows.iter().find(|w| w.enabled).map(|w| w.hwnd)
    }
}

// ============================================================================
// 6. HELPERS
// ============================================================================

/// Splits a `host:port` device id into its port, if it has one.
pub fn device_port(device_id: &str) -> Option<u16> {
    device_id.rsplit_once(':')?.1.parse().ok()
}

/// Loopback-connected devices are the ones `adb connect` can re-establish.
pub fn is_loopback_device(device_id: &str) -> bool {
    device_id.starts_with("127.0.0.1:")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_thresholds() {
        assert_eq!(ConnectionHealth::from_counts(0, 0), ConnectionHealth::Healthy);
        assert_eq!(ConnectionHealth::from_counts(95, 5), ConnectionHealth::Healthy);
        assert_eq!(ConnectionHealth::from_counts(80, 20), ConnectionHealth::Degraded);
        assert_eq!(ConnectionHealth::from_counts(50, 50), ConnectionHealth::Unhealthy);
        assert_eq!(ConnectionHealth::from_counts(49, 51), ConnectionHealth::Critical);
    }

    #[test]
    fn health_is_monotone_in_successes() {
        // Adding successes at fixed errors never worsens the rating.
        let mut prev = ConnectionHealth::Critical;
        for s in 0..500u64 {
            let h = ConnectionHealth::from_counts(s, 20);
            assert!(h <= prev, "health regressed at {} successes", s);
            prev = h;
        }
    }

    #[test]
    fn device_id_port_extraction() {
        assert_eq!(device_port("127.0.0.1:16384"), Some(16384));
        assert_eq!(device_port("emulator-5554"), None);
        assert!(is_loopback_device("127.0.0.1:5555"));
        assert!(!is_loopback_device("emulator-5554"));
    }
}
