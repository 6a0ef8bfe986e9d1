// src/pool.rs
//
// =============================================================================
// DROIDFLOW: ADB CONNECTION POOL
// =============================================================================
//
// The Switchboard.
//
// Responsibilities:
// 1. Own the device map and its command/health bookkeeping.
// 2. Dispatch adb commands synchronously or through a prioritized worker
//    queue with retry/backoff.
// 3. Run the background health monitor and reconnect offline devices.
// 4. Restart the adb server with the binary matching the running family.
// 5. Deduplicate aliased devices before handing a fleet to callers.
//
// The pool is a deliberate process-wide singleton: the adb server socket is
// an OS-level singleton, and exactly one component may restart it.

use crate::core::{
    device_port, is_loopback_device, AdbPaths, CommandPriority, ConnectionHealth, DeviceStatus,
    EmulatorKind,
};
use crate::managers::VendorManagers;
use crate::proc;
use crate::registry::EmulatorRegistry;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;

const GET_STATE_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const RECONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const ECHO_TEST_TIMEOUT: Duration = Duration::from_secs(5);
const KILL_SERVER_TIMEOUT: Duration = Duration::from_secs(3);
const START_SERVER_TIMEOUT: Duration = Duration::from_secs(15);
const SERVER_SETTLE: Duration = Duration::from_secs(3);

// ============================================================================
// 1. DATA TYPES
// ============================================================================

/// Everything the pool knows about one device. Mutated only under the
/// pool lock.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub device_id: String,
    pub status: DeviceStatus,
    pub health: ConnectionHealth,
    pub adb_path: PathBuf,
    pub kind: EmulatorKind,
    pub last_seen: DateTime<Utc>,
    pub connection_count: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub properties: HashMap<String, String>,
}

impl DeviceInfo {
    fn new(device_id: String, status: DeviceStatus, adb_path: PathBuf, kind: EmulatorKind) -> Self {
        Self {
            device_id,
            status,
            health: ConnectionHealth::Healthy,
            adb_path,
            kind,
            last_seen: Utc::now(),
            connection_count: 0,
            success_count: 0,
            error_count: 0,
            properties: HashMap::new(),
        }
    }

    fn refresh_health(&mut self) {
        self.health = ConnectionHealth::from_counts(self.success_count, self.error_count);
    }
}

/// Completion callback; invoked exactly once with the final outcome of an
/// async command, after all retries.
pub type CommandCallback = Box<dyn FnOnce(&CommandResult) + Send + Sync>;

/// One adb request. Retries reuse the same command object.
pub struct AdbCommand {
    pub argv: Vec<String>,
    pub device_id: String,
    pub timeout: Duration,
    pub priority: CommandPriority,
    pub retry_count: u32,
    pub callback: Option<CommandCallback>,
}

impl AdbCommand {
    pub fn new(device_id: impl Into<String>, argv: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            device_id: device_id.into(),
            timeout: Duration::from_secs(10),
            priority: CommandPriority::Normal,
            retry_count: 3,
            callback: None,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn priority(mut self, priority: CommandPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn retries(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn on_complete(mut self, callback: CommandCallback) -> Self {
        self.callback = Some(callback);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandResult {
    pub ok: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    fn fail(stderr: impl Into<String>) -> Self {
        Self {
            ok: false,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GlobalStats {
    pub total_commands: u64,
    pub successful_commands: u64,
    pub failed_commands: u64,
    pub reconnections: u64,
    pub devices_discovered: u64,
}

/// Point-in-time snapshot returned by `statistics()`.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatistics {
    pub global: GlobalStats,
    pub device_count: usize,
    pub devices: HashMap<String, DeviceInfo>,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub workers: usize,
    pub health_check_interval: Duration,
    pub stale_after: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 10.min((num_cpus::get() * 2).max(2)),
            health_check_interval: Duration::from_secs(30),
            stale_after: Duration::from_secs(300),
        }
    }
}

// ============================================================================
// 2. COMMAND QUEUE
// ============================================================================

struct QueuedCommand {
    priority: CommandPriority,
    seq: u64,
    cmd: AdbCommand,
    responder: oneshot::Sender<CommandResult>,
}

// Max-heap on priority; FIFO within a class via the reversed sequence.
impl Ord for QueuedCommand {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then(other.seq.cmp(&self.seq))
    }
}
impl PartialOrd for QueuedCommand {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl PartialEq for QueuedCommand {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}
impl Eq for QueuedCommand {}

// ============================================================================
// 3. THE POOL
// ============================================================================

struct PoolState {
    devices: HashMap<String, DeviceInfo>,
    stats: GlobalStats,
}

pub struct AdbPool {
    cfg: PoolConfig,
    state: Mutex<PoolState>,
    adb_paths: Mutex<AdbPaths>,
    managers: Mutex<VendorManagers>,
    registry: Mutex<Option<Arc<EmulatorRegistry>>>,
    queue: Mutex<BinaryHeap<QueuedCommand>>,
    queue_notify: Notify,
    seq: AtomicU64,
    shutdown: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

static GLOBAL_POOL: OnceLock<Arc<AdbPool>> = OnceLock::new();

impl AdbPool {
    /// Boots a pool: spawns the worker fleet and the health monitor.
    /// Must run inside a tokio runtime.
    pub fn start(cfg: PoolConfig) -> Arc<Self> {
        let pool = Arc::new(Self {
            cfg: cfg.clone(),
            state: Mutex::new(PoolState {
                devices: HashMap::new(),
                stats: GlobalStats::default(),
            }),
            adb_paths: Mutex::new(AdbPaths::default()),
            managers: Mutex::new(VendorManagers::default()),
            registry: Mutex::new(None),
            queue: Mutex::new(BinaryHeap::new()),
            queue_notify: Notify::new(),
            seq: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });

        let mut handles = Vec::new();
        for worker_id in 0..cfg.workers {
            let p = pool.clone();
            handles.push(tokio::spawn(async move { p.worker_loop(worker_id).await }));
        }
        let p = pool.clone();
        handles.push(tokio::spawn(async move { p.health_monitor_loop().await }));
        *pool.tasks.lock().unwrap() = handles;

        log::info!("adb pool started: {} workers", cfg.workers);
        pool
    }

    /// The process-wide instance. First access boots it with defaults.
    pub fn global() -> Arc<AdbPool> {
        GLOBAL_POOL
            .get_or_init(|| AdbPool::start(PoolConfig::default()))
            .clone()
    }

    /// Wires in the discovery collaborators. Call after path discovery and
    /// whenever the fleet environment changes.
    pub fn attach(
        &self,
        adb_paths: AdbPaths,
        managers: VendorManagers,
        registry: Option<Arc<EmulatorRegistry>>,
    ) {
        *self.adb_paths.lock().unwrap() = adb_paths;
        *self.managers.lock().unwrap() = managers;
        *self.registry.lock().unwrap() = registry;
    }

    // ------------------------------------------------------------------------
    // DEVICE CREATION
    // ------------------------------------------------------------------------

    /// Builds (or refreshes) pool entries for the given device ids.
    ///
    /// Restarts the adb server first: vendor-patched and stock adb builds
    /// conflict on the shared server socket, and whichever binary starts
    /// the server owns it, so it must be the one matching the running
    /// emulator family. Idempotent: existing entries keep their counters.
    pub async fn create_devices_from_list(&self, ids: &[String]) -> Vec<DeviceInfo> {
        self.restart_adb_server().await;

        let paths = self.adb_paths.lock().unwrap().clone();
        let mut discovered: Vec<DeviceInfo> = Vec::new();

        for id in ids {
            let kind = self.family_of_device(id).await;
            let Some(adb) = paths.for_kind(kind).map(|p| p.to_path_buf()) else {
                log::warn!("no adb binary for device {id} (family {kind})");
                continue;
            };

            let mut status = self.probe_device_status(id, kind, &adb).await;

            // Offline loopback devices get one connect attempt here.
            if status == DeviceStatus::Offline && is_loopback_device(id) {
                log::info!("attempting to connect offline device {id}");
                if self.adb_connect(&adb, id).await {
                    status = DeviceStatus::Online;
                    log::info!("device connected: {id}");
                } else {
                    log::warn!("device connect failed: {id}");
                }
            }

            discovered.push(DeviceInfo::new(id.clone(), status, adb, kind));
        }

        // Merge into the pool.
        {
            let mut state = self.state.lock().unwrap();
            for dev in &discovered {
                match state.devices.get_mut(&dev.device_id) {
                    Some(existing) => {
                        if existing.status != dev.status {
                            log::info!(
                                "device status change: {} {:?} -> {:?}",
                                dev.device_id,
                                existing.status,
                                dev.status
                            );
                            existing.status = dev.status;
                        }
                        existing.last_seen = Utc::now();
                    }
                    None => {
                        log::info!("new device: {} ({:?})", dev.device_id, dev.status);
                        state.devices.insert(dev.device_id.clone(), dev.clone());
                        state.stats.devices_discovered += 1;
                    }
                }
            }
        }

        // Return the pool's view (with preserved counters), not the probes.
        let state = self.state.lock().unwrap();
        ids.iter()
            .filter_map(|id| state.devices.get(id).cloned())
            .collect()
    }

    async fn probe_device_status(
        &self,
        id: &str,
        kind: EmulatorKind,
        adb: &PathBuf,
    ) -> DeviceStatus {
        // MuMu boot progress comes from the manager, not get-state: the adb
        // port accepts connections long before Android is usable.
        if kind == EmulatorKind::Mumu {
            let mumu = self.managers.lock().unwrap().mumu.clone();
            if let (Some(mumu), Some(port)) = (mumu, device_port(id)) {
                let vms = mumu.all_vm_info().await;
                if let Some(vm) = vms.values().find(|vm| vm.adb_port == Some(port)) {
                    return if vm.is_ready() {
                        DeviceStatus::Online
                    } else {
                        DeviceStatus::Offline
                    };
                }
            }
        }

        match proc::run_with_timeout(adb, ["-s", id, "get-state"], GET_STATE_TIMEOUT).await {
            Ok(out) if out.ok => DeviceStatus::from_get_state(&out.stdout),
            Ok(_) => DeviceStatus::Offline,
            Err(e) => {
                log::warn!("get-state failed for {id}: {e:#}");
                DeviceStatus::Unknown
            }
        }
    }

    /// Family of a device id: manager port sets first, range inference as
    /// the fallback for ids discovered before any manager answered.
    async fn family_of_device(&self, id: &str) -> EmulatorKind {
        let Some(port) = device_port(id) else {
            return EmulatorKind::Unknown;
        };

        let (mumu, ld) = {
            let managers = self.managers.lock().unwrap();
            (managers.mumu.clone(), managers.ldplayer.clone())
        };
        if let Some(mumu) = mumu {
            if mumu.known_ports().await.contains(&port) {
                return EmulatorKind::Mumu;
            }
        }
        if let Some(ld) = ld {
            if ld.known_ports().await.contains(&port) {
                return EmulatorKind::Ldplayer;
            }
        }

        if (16384..=16500).contains(&port) {
            EmulatorKind::Mumu
        } else if (5555..=5585).contains(&port) {
            EmulatorKind::Ldplayer
        } else {
            EmulatorKind::Unknown
        }
    }

    // ------------------------------------------------------------------------
    // ADB SERVER CONTROL
    // ------------------------------------------------------------------------

    /// Kills every known adb server, waits for the processes to die, then
    /// starts a fresh server with the binary of a running family.
    async fn restart_adb_server(&self) {
        let paths = self.adb_paths.lock().unwrap().clone();
        if paths.is_empty() {
            log::warn!("no adb paths known; skipping server restart");
            return;
        }

        log::info!("restarting adb server");
        for adb in paths.all() {
            let _ = proc::run_with_timeout(adb, ["kill-server"], KILL_SERVER_TIMEOUT).await;
        }
        tokio::time::sleep(SERVER_SETTLE).await;

        // Binary preference follows the running families, generic last.
        let running = self.running_kinds().await;
        let mut order: Vec<Option<PathBuf>> = Vec::new();
        if running.contains(&EmulatorKind::Ldplayer) {
            order.push(paths.ldplayer.clone());
        }
        if running.contains(&EmulatorKind::Mumu) {
            order.push(paths.mumu.clone());
        }
        if order.iter().all(|p| p.is_none()) {
            order.push(paths.generic.clone());
            order.push(paths.ldplayer.clone());
            order.push(paths.mumu.clone());
        } else {
            order.push(paths.generic.clone());
        }

        for adb in order.into_iter().flatten() {
            for attempt in 0..3u32 {
                match proc::run_with_timeout(&adb, ["start-server"], START_SERVER_TIMEOUT).await {
                    Ok(out) if out.ok => {
                        log::info!("adb server started with {}", adb.display());
                        return;
                    }
                    Ok(out) => log::debug!(
                        "start-server attempt {}/3 failed ({}): {}",
                        attempt + 1,
                        adb.display(),
                        out.stderr.trim()
                    ),
                    Err(e) => log::debug!("start-server spawn failed: {e:#}"),
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            log::warn!("adb server failed to start with {}", adb.display());
        }
    }

    async fn running_kinds(&self) -> Vec<EmulatorKind> {
        let registry = self.registry.lock().unwrap().clone();
        let Some(registry) = registry else {
            return Vec::new();
        };
        let paths = self.adb_paths.lock().unwrap().clone();
        // Window enumeration is synchronous but cheap; keep it off the
        // async executor threads anyway.
        tokio::task::spawn_blocking(move || registry.running_kinds(&paths))
            .await
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------------
    // COMMAND EXECUTION
    // ------------------------------------------------------------------------

    /// Runs one command to completion against the device's adb binary.
    /// Timeouts and spawn failures report as `ok = false`.
    pub async fn execute_sync(&self, cmd: &AdbCommand) -> CommandResult {
        let adb = {
            let state = self.state.lock().unwrap();
            match state.devices.get(&cmd.device_id) {
                Some(dev) => dev.adb_path.clone(),
                None => return CommandResult::fail("device not in pool"),
            }
        };

        let mut argv: Vec<String> = vec!["-s".into(), cmd.device_id.clone()];
        argv.extend(cmd.argv.iter().cloned());
        log::debug!("adb {}: {}", cmd.device_id, argv.join(" "));

        let result = match proc::run_with_timeout(&adb, &argv, cmd.timeout).await {
            Ok(out) => CommandResult {
                ok: out.ok,
                stdout: out.stdout,
                stderr: out.stderr,
            },
            Err(e) => CommandResult::fail(format!("{e:#}")),
        };

        let mut state = self.state.lock().unwrap();
        state.stats.total_commands += 1;
        if result.ok {
            state.stats.successful_commands += 1;
        } else {
            state.stats.failed_commands += 1;
        }
        if let Some(dev) = state.devices.get_mut(&cmd.device_id) {
            dev.connection_count += 1;
            if result.ok {
                dev.success_count += 1;
            } else {
                dev.error_count += 1;
            }
            dev.last_seen = Utc::now();
            dev.refresh_health();
        }

        result
    }

    /// Enqueues a command on the priority queue. The returned receiver
    /// resolves with the final outcome after retries; the command's
    /// callback (if any) fires exactly once with the same outcome.
    pub fn execute_async(&self, cmd: AdbCommand) -> oneshot::Receiver<CommandResult> {
        let (tx, rx) = oneshot::channel();
        let queued = QueuedCommand {
            priority: cmd.priority,
            seq: self.seq.fetch_add(1, AtomicOrdering::Relaxed),
            cmd,
            responder: tx,
        };
        self.queue.lock().unwrap().push(queued);
        self.queue_notify.notify_one();
        rx
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        log::debug!("adb worker {worker_id} up");
        loop {
            let next = self.queue.lock().unwrap().pop();
            let Some(mut queued) = next else {
                if self.shutdown.load(AtomicOrdering::SeqCst) {
                    break;
                }
                // Re-check the queue after either a notify or a tick; a
                // notify can land between pop and wait.
                tokio::select! {
                    _ = self.queue_notify.notified() => {}
                    _ = tokio::time::sleep(Duration::from_millis(200)) => {}
                }
                continue;
            };

            let result = self.execute_with_retry(&queued.cmd).await;

            if let Some(cb) = queued.cmd.callback.take() {
                cb(&result);
            }
            let _ = queued.responder.send(result);
        }
        log::debug!("adb worker {worker_id} down");
    }

    /// Exponential backoff: 0.5s * 2^attempt between tries.
    async fn execute_with_retry(&self, cmd: &AdbCommand) -> CommandResult {
        let attempts = cmd.retry_count.max(1);
        let mut last = CommandResult::fail("not executed");

        for attempt in 0..attempts {
            last = self.execute_sync(cmd).await;
            if last.ok || self.shutdown.load(AtomicOrdering::SeqCst) {
                break;
            }
            if attempt + 1 < attempts {
                let backoff = Duration::from_millis(500 * (1u64 << attempt.min(6)));
                log::info!(
                    "retry {}/{} for {} in {:?}",
                    attempt + 1,
                    attempts,
                    cmd.device_id,
                    backoff
                );
                tokio::time::sleep(backoff).await;
            }
        }
        last
    }

    // ------------------------------------------------------------------------
    // HEALTH & RECONNECT
    // ------------------------------------------------------------------------

    async fn health_monitor_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.cfg.health_check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so boot isn't noisy.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.queue_notify.notified(), if self.shutdown.load(AtomicOrdering::SeqCst) => break,
            }
            if self.shutdown.load(AtomicOrdering::SeqCst) {
                break;
            }

            // Pass 1: flag stale devices. The monitor never discovers.
            let stale_after = chrono::Duration::from_std(self.cfg.stale_after)
                .unwrap_or_else(|_| chrono::Duration::seconds(300));
            let mut reconnect_candidates: Vec<DeviceInfo> = Vec::new();
            {
                let mut state = self.state.lock().unwrap();
                let now = Utc::now();
                for dev in state.devices.values_mut() {
                    if now - dev.last_seen > stale_after {
                        dev.health = ConnectionHealth::Critical;
                    }
                    if matches!(
                        dev.health,
                        ConnectionHealth::Unhealthy | ConnectionHealth::Critical
                    ) && dev.status == DeviceStatus::Offline
                    {
                        reconnect_candidates.push(dev.clone());
                    }
                }
            }

            // Pass 2: reconnect outside the lock.
            for dev in reconnect_candidates {
                if self.shutdown.load(AtomicOrdering::SeqCst) {
                    break;
                }
                if self.try_reconnect(&dev).await {
                    self.mark_reconnected(&dev.device_id);
                    log::info!("device reconnected: {}", dev.device_id);
                }
            }
        }
        log::debug!("health monitor down");
    }

    async fn try_reconnect(&self, dev: &DeviceInfo) -> bool {
        if !is_loopback_device(&dev.device_id) {
            return false;
        }
        let connect = proc::run_with_timeout(
            &dev.adb_path,
            ["connect", dev.device_id.as_str()],
            RECONNECT_TIMEOUT,
        )
        .await;
        if !matches!(connect, Ok(out) if out.ok) {
            return false;
        }
        // Verify the session actually works before flipping state.
        matches!(
            proc::run_with_timeout(
                &dev.adb_path,
                ["-s", dev.device_id.as_str(), "shell", "echo", "test"],
                ECHO_TEST_TIMEOUT,
            )
            .await,
            Ok(out) if out.ok
        )
    }

    async fn adb_connect(&self, adb: &PathBuf, id: &str) -> bool {
        match proc::run_with_timeout(adb, ["connect", id], CONNECT_TIMEOUT).await {
            Ok(out) => out.ok && out.stdout.to_lowercase().contains("connected"),
            Err(_) => false,
        }
    }

    fn mark_reconnected(&self, device_id: &str) {
        let mut state = self.state.lock().unwrap();
        state.stats.reconnections += 1;
        if let Some(dev) = state.devices.get_mut(device_id) {
            dev.status = DeviceStatus::Online;
            dev.health = ConnectionHealth::Healthy;
            dev.error_count = 0;
            dev.last_seen = Utc::now();
        }
    }

    // ------------------------------------------------------------------------
    // FLEET QUERIES
    // ------------------------------------------------------------------------

    /// Refresh-and-return: reconnects offline loopback devices one by one,
    /// then returns the deduplicated healthy fleet.
    pub async fn healthy_devices(&self) -> Vec<DeviceInfo> {
        let offline: Vec<DeviceInfo> = {
            let state = self.state.lock().unwrap();
            state
                .devices
                .values()
                .filter(|d| d.status == DeviceStatus::Offline)
                .cloned()
                .collect()
        };

        if !offline.is_empty() {
            log::info!("{} offline device(s); attempting reconnect", offline.len());
            for dev in &offline {
                if self.try_reconnect(dev).await {
                    self.mark_reconnected(&dev.device_id);
                    log::info!("device reconnected: {}", dev.device_id);
                }
            }
        }

        let running = self.running_kinds().await;
        self.snapshot_healthy_with(&running)
    }

    /// Pure query: the deduplicated healthy fleet as currently known,
    /// with no reconnect side effects.
    pub fn snapshot_healthy(&self) -> Vec<DeviceInfo> {
        self.snapshot_healthy_with(&[])
    }

    fn snapshot_healthy_with(&self, running: &[EmulatorKind]) -> Vec<DeviceInfo> {
        let healthy: Vec<DeviceInfo> = {
            let state = self.state.lock().unwrap();
            state
                .devices
                .values()
                .filter(|d| {
                    d.status == DeviceStatus::Online
                        && matches!(
                            d.health,
                            ConnectionHealth::Healthy | ConnectionHealth::Degraded
                        )
                })
                .cloned()
                .collect()
        };

        let unique = deduplicate_devices(healthy, running);
        unique
    }

    /// Least-loaded healthy device, for spreading one-shot commands.
    pub async fn device_for_load_balancing(&self) -> Option<DeviceInfo> {
        self.healthy_devices()
            .await
            .into_iter()
            .min_by_key(|d| d.connection_count)
    }

    pub fn statistics(&self) -> PoolStatistics {
        let state = self.state.lock().unwrap();
        PoolStatistics {
            global: state.stats.clone(),
            device_count: state.devices.len(),
            devices: state.devices.clone(),
        }
    }

    /// Test/bootstrap hook: installs a device entry directly.
    pub fn insert_device(&self, dev: DeviceInfo) {
        let mut state = self.state.lock().unwrap();
        if !state.devices.contains_key(&dev.device_id) {
            state.stats.devices_discovered += 1;
        }
        state.devices.insert(dev.device_id.clone(), dev);
    }

    pub fn device(&self, device_id: &str) -> Option<DeviceInfo> {
        self.state.lock().unwrap().devices.get(device_id).cloned()
    }

    // ------------------------------------------------------------------------
    // SHUTDOWN
    // ------------------------------------------------------------------------

    /// Stops the workers and the health monitor. Safe to call twice.
    pub async fn shutdown(&self) {
        if self.shutdown.swap(true, AtomicOrdering::SeqCst) {
            return;
        }
        log::info!("shutting down adb pool");
        self.queue_notify.notify_waiters();

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock().unwrap());
        for h in handles {
            h.abort();
            let _ = h.await;
        }
        log::info!("adb pool shut down");
    }
}

// ============================================================================
// 4. DEDUPLICATION
// ============================================================================

/// The dedup key of a device id.
/// MuMu VMs live at 16384 + 32·vm (tolerating the +1 port-taken case), so
/// both alias ports of a VM collapse to one key. LDPlayer instances are
/// one-port-one-instance. Loopback ports outside both schemes are invalid;
/// native serials key as themselves.
pub fn port_key(device_id: &str) -> String {
    let Some(port) = device_port(device_id) else {
        return device_id.to_string();
    };

    if port >= 16384 && (port - 16384) % 32 <= 1 {
        format!("mumu_vm{}", (port - 16384) / 32)
    } else if (5555..=5585).contains(&port) {
        format!("ldplayer_{port}")
    } else {
        format!("invalid_{port}")
    }
}

fn key_family(key: &str) -> EmulatorKind {
    if key.starts_with("mumu_vm") {
        EmulatorKind::Mumu
    } else if key.starts_with("ldplayer_") {
        EmulatorKind::Ldplayer
    } else {
        EmulatorKind::Unknown
    }
}

fn port_priority(device_id: &str) -> u8 {
    match device_port(device_id) {
        Some(p) if (16384..=16500).contains(&p) => 1,
        Some(p) if (5555..=5585).contains(&p) => 2,
        Some(_) => 9,
        None => 5,
    }
}

/// Keeps one device per dedup key. Devices whose key family matches a
/// currently running family win collisions; invalid port keys are
/// excluded outright.
pub fn deduplicate_devices(devices: Vec<DeviceInfo>, running: &[EmulatorKind]) -> Vec<DeviceInfo> {
    let mut sorted = devices;
    sorted.sort_by_key(|d| {
        let key = port_key(&d.device_id);
        let matches_running = running.is_empty() || running.contains(&key_family(&key));
        (if matches_running { 0u8 } else { 1u8 }, port_priority(&d.device_id), d.device_id.clone())
    });

    let mut seen: Vec<String> = Vec::new();
    let mut unique = Vec::new();
    for dev in sorted {
        let key = port_key(&dev.device_id);
        if key.starts_with("invalid_") {
            log::debug!("excluding device with invalid port key: {}", dev.device_id);
            continue;
        }
        if seen.contains(&key) {
            log::info!("dedup: dropping {} (key {key})", dev.device_id);
            continue;
        }
        seen.push(key);
        unique.push(dev);
    }
    unique
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dev(id: &str) -> DeviceInfo {
        DeviceInfo::new(
            id.to_string(),
            DeviceStatus::Online,
            PathBuf::from("/usr/bin/adb"),
            EmulatorKind::Unknown,
        )
    }

    #[test]
    fn port_keys_follow_the_slot_rules() {
        assert_eq!(port_key("127.0.0.1:16384"), "mumu_vm0");
        assert_eq!(port_key("127.0.0.1:16385"), "mumu_vm0"); // port-taken +1
        assert_eq!(port_key("127.0.0.1:16416"), "mumu_vm1");
        assert_eq!(port_key("127.0.0.1:5555"), "ldplayer_5555");
        assert_eq!(port_key("127.0.0.1:5557"), "ldplayer_5557");
        assert_eq!(port_key("127.0.0.1:7555"), "invalid_7555");
        assert_eq!(port_key("emulator-5554"), "emulator-5554");
    }

    #[test]
    fn dedup_collapses_alias_ports() {
        let devices = vec![dev("127.0.0.1:16384"), dev("127.0.0.1:16385")];
        let unique = deduplicate_devices(devices, &[]);
        assert_eq!(unique.len(), 1);
    }

    #[test]
    fn dedup_excludes_invalid_ports() {
        let devices = vec![dev("127.0.0.1:16384"), dev("127.0.0.1:7555")];
        let unique = deduplicate_devices(devices, &[]);
        assert_eq!(unique.len(), 1);
        assert_eq!(unique[0].device_id, "127.0.0.1:16384");
    }

    #[test]
    fn dedup_keys_are_unique_in_output() {
        let devices = vec![
            dev("127.0.0.1:16384"),
            dev("127.0.0.1:16385"),
            dev("127.0.0.1:16416"),
            dev("127.0.0.1:5555"),
        ];
        let unique = deduplicate_devices(devices, &[]);
        let mut keys: Vec<String> = unique.iter().map(|d| port_key(&d.device_id)).collect();
        let before = keys.len();
        keys.dedup();
        assert_eq!(before, keys.len());
    }

    #[test]
    fn running_family_wins_key_collisions() {
        // Same slot seen via both schemes is impossible; emulate a
        // collision through the +1 alias and check ordering preference.
        let devices = vec![dev("127.0.0.1:5555"), dev("127.0.0.1:16384")];
        let unique = deduplicate_devices(devices, &[EmulatorKind::Mumu]);
        // No collision here, but the mumu device sorts first.
        assert_eq!(unique[0].device_id, "127.0.0.1:16384");
        assert_eq!(unique.len(), 2);
    }

    #[test]
    fn queue_orders_by_priority_then_fifo() {
        let mut heap: BinaryHeap<QueuedCommand> = BinaryHeap::new();
        let mk = |prio, seq| {
            let (tx, _rx) = oneshot::channel();
            QueuedCommand {
                priority: prio,
                seq,
                cmd: AdbCommand::new("d", ["shell"]),
                responder: tx,
            }
        };
        heap.push(mk(CommandPriority::Normal, 0));
        heap.push(mk(CommandPriority::Critical, 1));
        heap.push(mk(CommandPriority::Normal, 2));
        heap.push(mk(CommandPriority::High, 3));

        let order: Vec<(CommandPriority, u64)> = std::iter::from_fn(|| heap.pop())
            .map(|q| (q.priority, q.seq))
            .collect();
        assert_eq!(
            order,
            vec![
                (CommandPriority::Critical, 1),
                (CommandPriority::High, 3),
                (CommandPriority::Normal, 0),
                (CommandPriority::Normal, 2),
            ]
        );
    }

    #[tokio::test]
    async fn insert_is_idempotent_for_discovery_count() {
        let pool = AdbPool::start(PoolConfig {
            workers: 1,
            ..Default::default()
        });
        pool.insert_device(dev("127.0.0.1:16384"));
        pool.insert_device(dev("127.0.0.1:16384"));
        assert_eq!(pool.statistics().global.devices_discovered, 1);
        assert_eq!(pool.statistics().device_count, 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_is_reentrant() {
        let pool = AdbPool::start(PoolConfig {
            workers: 1,
            ..Default::default()
        });
        pool.shutdown().await;
        pool.shutdown().await;
    }
}
