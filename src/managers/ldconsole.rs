// src/managers/ldconsole.rs
//
// =============================================================================
// DROIDFLOW: LDPLAYER CONSOLE DRIVER
// =============================================================================
//
// Wraps `ldconsole` (dnconsole on older installs). `list2` emits one CSV
// line per instance: index,title,topHwnd,bindHwnd,androidStarted,pid.
// The adb port of instance i is 5555 + 2i.

use crate::core::AdbPaths;
use crate::proc;
use std::path::{Path, PathBuf};
use std::time::Duration;

const QUERY_TIMEOUT: Duration = Duration::from_secs(10);
const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq)]
pub struct LdInstance {
    pub index: u32,
    pub title: String,
    pub top_hwnd: u64,
    pub bind_hwnd: u64,
    pub android_started: bool,
    pub pid: u32,
    pub adb_port: u16,
}

pub fn adb_port_for_index(index: u32) -> u16 {
    5555 + (index as u16) * 2
}

pub struct LdConsole {
    exe: PathBuf,
}

impl LdConsole {
    pub fn new(exe: PathBuf) -> Self {
        Self { exe }
    }

    /// The console ships beside the LDPlayer adb binary.
    pub fn locate(adb_paths: &AdbPaths) -> Option<Self> {
        let adb = adb_paths.ldplayer.as_ref()?;
        let mut dir = adb.parent()?;

        for _ in 0..3 {
            for name in ["ldconsole.exe", "dnconsole.exe", "ldconsole"] {
                let cand = dir.join(name);
                if cand.is_file() {
                    log::info!("found LDPlayer console: {}", cand.display());
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

    pub async fn all_instances(&self) -> Vec<LdInstance> {
        let out = match proc::run_with_timeout(&self.exe, ["list2"], QUERY_TIMEOUT).await {
            Ok(out) if out.ok => out,
            Ok(out) => {
                log::warn!("ldconsole list2 failed: {}", out.stderr.trim());
                return Vec::new();
            }
            Err(e) => {
                log::warn!("ldconsole not runnable: {e:#}");
                return Vec::new();
            }
        };

        parse_list2(&out.stdout)
    }

    /// Ports of every configured instance, running or not. Used for port
    /// family attribution.
    pub async fn known_ports(&self) -> Vec<u16> {
        self.all_instances().await.iter().map(|i| i.adb_port).collect()
    }

    /// Ports of booted instances only — the authoritative live set used to
    /// drop stale loopback listeners in the LDPlayer range.
    pub async fn active_ports(&self) -> Vec<u16> {
        self.all_instances()
            .await
            .iter()
            .filter(|i| i.android_started)
            .map(|i| i.adb_port)
            .collect()
    }

    pub async fn instance_by_hwnd(&self, hwnd: u64) -> Option<LdInstance> {
        self.all_instances()
            .await
            .into_iter()
            .find(|i| i.top_hwnd == hwnd || i.bind_hwnd == hwnd)
    }

    pub async fn instance_by_title(&self, title: &str) -> Option<LdInstance> {
        self.all_instances()
            .await
            .into_iter()
            .find(|i| i.title.contains(title) || title.contains(&i.title))
    }

    pub async fn launch(&self, index: u32) -> bool {
        self.control("launch", index).await
    }

    pub async fn quit(&self, index: u32) -> bool {
        self.control("quit", index).await
    }

    async fn control(&self, verb: &str, index: u32) -> bool {
        let idx = index.to_string();
        match proc::run_with_timeout(&self.exe, [verb, "--index", idx.as_str()], CONTROL_TIMEOUT).await {
            Ok(out) => {
                if !out.ok {
                    log::warn!("ldconsole {verb} --index {index} failed: {}", out.stderr.trim());
                }
                out.ok
            }
            Err(e) => {
                log::warn!("ldconsole {verb} failed to spawn: {e:#}");
                false
            }
        }
    }
}

/// Parses `ldconsole list2` CSV. Titles containing commas are a vendor
/// quirk we tolerate by taking the fixed fields from both ends.
pub fn parse_list2(stdout: &str) -> Vec<LdInstance> {
    let mut out = Vec::new();

    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let parts: Vec<&str> = line.split(',').collect();
        if parts.len() < 5 {
            log::debug!("skipping malformed list2 line: {line}");
            continue;
        }

        let Ok(index) = parts[0].parse::<u32>() else {
            continue;
        };

        // Fixed tail: ...,topHwnd,bindHwnd,androidStarted[,pid]
        let (tail_start, pid) = if parts.len() >= 6 {
            (parts.len() - 4, parts[parts.len() - 1].parse().unwrap_or(0))
        } else {
            (parts.len() - 3, 0)
        };
        let title = parts[1..tail_start].join(",");
        let top_hwnd = parts[tail_start].parse().unwrap_or(0);
        let bind_hwnd = parts[tail_start + 1].parse().unwrap_or(0);
        let android_started = parts[tail_start + 2].trim() == "1";

        out.push(LdInstance {
            index,
            title,
            top_hwnd,
            bind_hwnd,
            android_started,
            pid,
            adb_port: adb_port_for_index(index),
        });
    }

    log::debug!("ldconsole reported {} instance(s)", out.len());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_rule_is_5555_plus_2i() {
        assert_eq!(adb_port_for_index(0), 5555);
        assert_eq!(adb_port_for_index(1), 5557);
        assert_eq!(adb_port_for_index(4), 5563);
    }

    #[test]
    fn parses_list2_lines() {
        let out = "0,雷电模拟器,12345,67890,1,4321\n1,雷电模拟器-1,0,0,0,0\n";
        let instances = parse_list2(out);
        assert_eq!(instances.len(), 2);

        assert_eq!(instances[0].index, 0);
        assert_eq!(instances[0].title, "雷电模拟器");
        assert!(instances[0].android_started);
        assert_eq!(instances[0].adb_port, 5555);
        assert_eq!(instances[0].pid, 4321);

        assert!(!instances[1].android_started);
        assert_eq!(instances[1].adb_port, 5557);
    }

    #[test]
    fn tolerates_commas_in_titles() {
        let out = "2,my,fancy,title,111,222,1,999\n";
        let instances = parse_list2(out);
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].title, "my,fancy,title");
        assert_eq!(instances[0].top_hwnd, 111);
        assert_eq!(instances[0].adb_port, 5559);
    }

    #[test]
    fn skips_garbage_lines() {
        let out = "header junk\n0,ok,1,2,1,3\n";
        let instances = parse_list2(out);
        assert_eq!(instances.len(), 1);
    }
}
