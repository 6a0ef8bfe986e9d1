// src/locator.rs
//
// =============================================================================
// DROIDFLOW: ADB PATH RESOLVER
// =============================================================================
//
// The Bloodhound.
//
// Responsibilities:
// 1. Collect candidate adb binaries from the system search path and from
//    directories of running adb/emulator processes.
// 2. Validate every candidate with `adb version` before trusting it.
// 3. Attribute each validated binary to an emulator family.
// 4. Cache results (discovery shells out; 5 minutes is fresh enough).

use crate::core::{AdbPaths, EmulatorKind};
use crate::proc;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use sysinfo::{ProcessRefreshKind, RefreshKind, System};

const VALIDATE_TIMEOUT: Duration = Duration::from_secs(5);
const CACHE_TTL: Duration = Duration::from_secs(300);

/// Subdirectories searched next to a discovered process executable.
const SEARCH_SUBDIRS: &[&str] = &["platform-tools", "tools", "bin", "LDPlayer9", "LDPlayer4"];

/// Process-name keywords that mark a directory as worth searching.
const PROCESS_KEYWORDS: &[&str] = &["adb", "mumu", "nemu", "dnplayer", "ldplayer"];

#[cfg(windows)]
const ADB_NAMES: &[&str] = &["adb.exe"];
#[cfg(not(windows))]
const ADB_NAMES: &[&str] = &["adb"];

pub struct AdbLocator {
    cache: Mutex<Option<(Instant, AdbPaths)>>,
}

impl Default for AdbLocator {
    fn default() -> Self {
        Self::new()
    }
}

impl AdbLocator {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(None),
        }
    }

    /// Resolves the family -> adb map, serving from cache when fresh.
    pub async fn discover(&self) -> AdbPaths {
        if let Some((at, paths)) = self.cache.lock().unwrap().clone() {
            if at.elapsed() < CACHE_TTL {
                return paths;
            }
        }

        let paths = self.discover_uncached().await;
        *self.cache.lock().unwrap() = Some((Instant::now(), paths.clone()));
        paths
    }

    /// Drops the cache so the next `discover` rescans (e.g. after the
    /// operator installs an emulator mid-session).
    pub fn invalidate(&self) {
        *self.cache.lock().unwrap() = None;
    }

    async fn discover_uncached(&self) -> AdbPaths {
        let mut candidates: Vec<PathBuf> = Vec::new();

        // 1. System search path.
        candidates.extend(find_in_search_path());

        // 2. Directories of running adb / emulator processes.
        candidates.extend(find_near_processes());

        candidates.dedup();

        // 3. Validate each candidate; silently drop the broken ones.
        let mut valid: Vec<PathBuf> = Vec::new();
        for cand in candidates {
            if valid.contains(&cand) {
                continue;
            }
            if validate_adb(&cand).await {
                valid.push(cand);
            } else {
                log::debug!("rejected adb candidate: {}", cand.display());
            }
        }

        // 4. Priority order decides which binary fills the generic slot.
        valid.sort_by_key(|p| source_priority(p));

        let mut paths = AdbPaths::default();
        for p in &valid {
            match family_of_path(p) {
                EmulatorKind::Mumu if paths.mumu.is_none() => paths.mumu = Some(p.clone()),
                EmulatorKind::Ldplayer if paths.ldplayer.is_none() => {
                    paths.ldplayer = Some(p.clone())
                }
                _ if paths.generic.is_none() => paths.generic = Some(p.clone()),
                _ => {}
            }
        }

        log::info!(
            "adb discovery: generic={:?} mumu={:?} ldplayer={:?}",
            paths.generic,
            paths.mumu,
            paths.ldplayer
        );
        paths
    }
}

// ============================================================================
// CANDIDATE SOURCES
// ============================================================================

fn find_in_search_path() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(path_var) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&path_var) {
            for name in ADB_NAMES {
                let cand = dir.join(name);
                if cand.is_file() {
                    out.push(cand);
                }
            }
        }
    }
    out
}

fn find_near_processes() -> Vec<PathBuf> {
    let sys = System::new_with_specifics(
        RefreshKind::nothing().with_processes(ProcessRefreshKind::everything()),
    );

    let mut dirs: Vec<PathBuf> = Vec::new();
    for proc_ in sys.processes().values() {
        let name = proc_.name().to_string_lossy().to_lowercase();
        if !PROCESS_KEYWORDS.iter().any(|kw| name.contains(kw)) {
            continue;
        }
        let Some(exe) = proc_.exe() else { continue };
        if let Some(dir) = exe.parent() {
            push_unique(&mut dirs, dir.to_path_buf());
            if let Some(parent) = dir.parent() {
                push_unique(&mut dirs, parent.to_path_buf());
            }
        }
    }

    let mut out = Vec::new();
    for dir in dirs {
        for name in ADB_NAMES {
            let direct = dir.join(name);
            if direct.is_file() {
                out.push(direct);
            }
            for sub in SEARCH_SUBDIRS {
                let nested = dir.join(sub).join(name);
                if nested.is_file() {
                    out.push(nested);
                }
            }
        }
    }
    out
}

fn push_unique(dirs: &mut Vec<PathBuf>, dir: PathBuf) {
    if !dirs.contains(&dir) {
        dirs.push(dir);
    }
}

// ============================================================================
// VALIDATION & ATTRIBUTION
// ============================================================================

/// A candidate counts only if `adb version` exits cleanly within 5s.
async fn validate_adb(path: &Path) -> bool {
    match proc::run_with_timeout(path, ["version"], VALIDATE_TIMEOUT).await {
        Ok(out) => out.ok,
        Err(_) => false,
    }
}

/// Lower sorts first: system path > Android-SDK-like path > emulator dir.
fn source_priority(path: &Path) -> u8 {
    let lower = path.to_string_lossy().to_lowercase();
    match family_of_path(path) {
        EmulatorKind::Mumu | EmulatorKind::Ldplayer => 2,
        EmulatorKind::Unknown => {
            if lower.contains("android") || lower.contains("sdk") || lower.contains("platform-tools")
            {
                1
            } else {
                0
            }
        }
    }
}

/// A binary living under an emulator install tree belongs to that family.
pub fn family_of_path(path: &Path) -> EmulatorKind {
    let lower = path.to_string_lossy().to_lowercase();
    if lower.contains("mumu") || lower.contains("nemu") {
        EmulatorKind::Mumu
    } else if lower.contains("ldplayer") || lower.contains("dnplayer") || lower.contains("leidian")
    {
        EmulatorKind::Ldplayer
    } else {
        EmulatorKind::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_attribution_by_install_dir() {
        assert_eq!(
            family_of_path(Path::new("D:/MuMu/emulator/nemu/vmonitor/bin/adb.exe")),
            EmulatorKind::Mumu
        );
        assert_eq!(
            family_of_path(Path::new("C:/LDPlayer9/adb.exe")),
            EmulatorKind::Ldplayer
        );
        assert_eq!(
            family_of_path(Path::new("/usr/bin/adb")),
            EmulatorKind::Unknown
        );
    }

    #[test]
    fn system_path_outranks_sdk_outranks_emulator() {
        assert!(source_priority(Path::new("/usr/bin/adb")) < source_priority(Path::new("/opt/android-sdk/platform-tools/adb")));
        assert!(
            source_priority(Path::new("/opt/android-sdk/platform-tools/adb"))
                < source_priority(Path::new("C:/LDPlayer9/adb.exe"))
        );
    }
}
