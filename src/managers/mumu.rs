// src/managers/mumu.rs
//
// =============================================================================
// DROIDFLOW: MUMU MANAGER DRIVER
// =============================================================================
//
// Wraps the MuMuManager console utility. Its `info -v all` command reports
// every VM's adb port and boot progress as JSON; that report is the
// authoritative source for MuMu port attribution and online checks.

use crate::core::AdbPaths;
use crate::proc;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Boot state of a single MuMu VM as the manager reports it.
#[derive(Debug, Clone, Deserialize)]
pub struct VmInfo {
    #[serde(default)]
    pub adb_port: Option<u16>,
    #[serde(default)]
    pub is_android_started: bool,
    #[serde(default)]
    pub player_state: String,
}

impl VmInfo {
    /// A VM counts as online only once Android has booted AND the player
    /// finished starting; either alone still refuses adb sessions.
    pub fn is_ready(&self) -> bool {
        self.is_android_started && self.player_state == "start_finished"
    }
}

pub struct MuMuManager {
    exe: PathBuf,
}

impl MuMuManager {
    pub fn new(exe: PathBuf) -> Self {
        Self { exe }
    }

    /// Searches for MuMuManager next to the MuMu adb binary. MuMu installs
    /// keep both under the same `shell`/`vmonitor` tree.
    pub fn locate(adb_paths: &AdbPaths) -> Option<Self> {
        let adb = adb_paths.mumu.as_ref()?;
        let mut dir = adb.parent()?;

        for _ in 0..3 {
            for name in ["MuMuManager.exe", "MuMuManager"] {
                let cand = dir.join(name);
                if cand.is_file() {
                    log::info!("found MuMu manager: {}", cand.display());
                    return Some(Self::new(cand));
                }
            }
            dir = dir.parent()?;
        }
        None
    }

    pub fn is_available(&self) -> bool {
        self.exe.is_file()
    }

    pub fn exe(&self) -> &Path {
        &self.exe
    }

    /// Queries every VM. Unavailability and malformed output both collapse
    /// to an empty map so discovery can fall through to other sources.
    pub async fn all_vm_info(&self) -> HashMap<u32, VmInfo> {
        let out = match proc::run_with_timeout(&self.exe, ["info", "-v", "all"], QUERY_TIMEOUT).await
        {
            Ok(out) if out.ok => out,
            Ok(out) => {
                log::warn!("MuMu manager query failed: {}", out.stderr.trim());
                return HashMap::new();
            }
            Err(e) => {
                log::warn!("MuMu manager not runnable: {e:#}");
                return HashMap::new();
            }
        };

        parse_vm_info(&out.stdout)
    }

    /// All ports the manager knows about, running or not. Used for port
    /// family attribution.
    pub async fn known_ports(&self) -> Vec<u16> {
        self.all_vm_info()
            .await
            .values()
            .filter_map(|vm| vm.adb_port)
            .collect()
    }

    /// Ports of VMs that are fully booted.
    pub async fn ready_ports(&self) -> Vec<u16> {
        self.all_vm_info()
            .await
            .values()
            .filter(|vm| vm.is_ready())
            .filter_map(|vm| vm.adb_port)
            .collect()
    }
}

/// Parses `MuMuManager info -v all` output.
/// Multi-VM installs emit `{"0": {...}, "1": {...}}`; single-VM installs
/// emit the bare VM object, which lands at index 0.
pub fn parse_vm_info(stdout: &str) -> HashMap<u32, VmInfo> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return HashMap::new();
    }

    if let Ok(map) = serde_json::from_str::<HashMap<String, VmInfo>>(trimmed) {
        let parsed: HashMap<u32, VmInfo> = map
            .into_iter()
            .filter_map(|(k, v)| k.parse::<u32>().ok().map(|idx| (idx, v)))
            .collect();
        if !parsed.is_empty() {
            return parsed;
        }
    }

    if let Ok(single) = serde_json::from_str::<VmInfo>(trimmed) {
        if single.adb_port.is_some() {
            return HashMap::from([(0, single)]);
        }
    }

    let preview: String = trimmed.chars().take(200).collect();
    log::warn!("unrecognized MuMu manager output: {preview}");
    HashMap::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_multi_vm_report() {
        let out = r#"{
            "0": {"adb_port": 16384, "is_android_started": true, "player_state": "start_finished"},
            "1": {"adb_port": 16416, "is_android_started": false, "player_state": "starting"}
        }"#;
        let vms = parse_vm_info(out);
        assert_eq!(vms.len(), 2);
        assert!(vms[&0].is_ready());
        assert!(!vms[&1].is_ready());
        assert_eq!(vms[&1].adb_port, Some(16416));
    }

    #[test]
    fn parses_single_vm_report() {
        let out = r#"{"adb_port": 16384, "is_android_started": true, "player_state": "start_finished"}"#;
        let vms = parse_vm_info(out);
        assert_eq!(vms.len(), 1);
        assert!(vms[&0].is_ready());
    }

    #[test]
    fn android_started_alone_is_not_ready() {
        let vm = VmInfo {
            adb_port: Some(16384),
            is_android_started: true,
            player_state: "starting".into(),
        };
        assert!(!vm.is_ready());
    }

    #[test]
    fn garbage_collapses_to_empty() {
        assert!(parse_vm_info("").is_empty());
        assert!(parse_vm_info("not json").is_empty());
    }
}
