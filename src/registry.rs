// src/registry.rs
//
// =============================================================================
// DROIDFLOW: EMULATOR REGISTRY
// =============================================================================
//
// The Eyes.
//
// Responsibilities:
// 1. Enumerate top-level windows through a pluggable `WindowEnumerator`.
// 2. Classify each window as MuMu / LDPlayer / unknown by title rules.
// 3. Extract MuMu VM indices from window titles.
// 4. Report which emulator families are currently running.
//
// The executor core never touches a window-system API; hosts provide an
// enumerator (Win32 EnumWindows on Windows, a process-table scan headless).

use crate::core::{AdbPaths, EmulatorKind};
use regex::Regex;
use std::path::PathBuf;
use std::sync::OnceLock;
use sysinfo::{ProcessRefreshKind, RefreshKind, System};

// ============================================================================
// 1. WINDOW SOURCES
// ============================================================================

/// Raw fact about one top-level window, as cheap as the host can make it.
#[derive(Debug, Clone)]
pub struct RawWindow {
    pub handle: u64,
    pub title: String,
    pub process_path: PathBuf,
}

/// Host-provided window enumeration. Implementations must only return
/// visible top-level windows.
pub trait WindowEnumerator: Send + Sync {
    fn windows(&self) -> Vec<RawWindow>;
}

/// An emulator window after classification.
#[derive(Debug, Clone)]
pub struct EmulatorWindow {
    pub handle: u64,
    pub title: String,
    pub kind: EmulatorKind,
    pub process_path: PathBuf,
    pub adb_path: Option<PathBuf>,
    pub device_id: Option<String>,
    pub vm_index: Option<u32>,
}

/// Fallback enumerator for hosts without a window system: synthesizes one
/// pseudo-window per known emulator core process. Titles follow the
/// process name, so classification falls through to the process rules.
pub struct ProcessEnumerator;

impl WindowEnumerator for ProcessEnumerator {
    fn windows(&self) -> Vec<RawWindow> {
        let sys = System::new_with_specifics(
            RefreshKind::nothing().with_processes(ProcessRefreshKind::everything()),
        );

        let mut out = Vec::new();
        for (pid, proc_) in sys.processes() {
            let name = proc_.name().to_string_lossy().to_lowercase();
            // Core processes only; launcher/helper processes misclassify.
            let title = if name.contains("nemuheadless") || name.contains("nemuplayer") {
                "mumu模拟器"
            } else if name.contains("dnplayer") {
                "雷电模拟器"
            } else {
                continue;
            };
            out.push(RawWindow {
                handle: pid.as_u32() as u64,
                title: title.to_string(),
                process_path: proc_
                    .exe()
                    .map(|p| p.to_path_buf())
                    .unwrap_or_default(),
            });
        }
        out
    }
}

// ============================================================================
// 2. TITLE CLASSIFICATION RULES
// ============================================================================

const BROWSER_KEYWORDS: &[&str] = &[
    "edge", "chrome", "firefox", "browser", "浏览器", "microsoft", "页面",
];

fn mumu_rules() -> &'static Vec<Regex> {
    static RULES: OnceLock<Vec<Regex>> = OnceLock::new();
    RULES.get_or_init(|| {
        [
            r"^mumu.*模拟器$",
            r"^mumu.*player$",
            r"^mumu.*simulator$",
            r"^网易mumu",
            r"^mumu\d+$",
            r"^mumu.*\d+-\d+$",
            r"^mumu安卓设备",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("static rule"))
        .collect()
    })
}

fn ldplayer_rules() -> &'static Vec<Regex> {
    static RULES: OnceLock<Vec<Regex>> = OnceLock::new();
    RULES.get_or_init(|| {
        [r"^雷电.*模拟器", r"^ldplayer", r"^雷电.*\d+", r"^ld.*player"]
            .iter()
            .map(|p| Regex::new(p).expect("static rule"))
            .collect()
    })
}

/// Classifies a window title. Browser windows mentioning an emulator in a
/// tab title are rejected before the rules run.
pub fn classify_title(title: &str) -> EmulatorKind {
    let lower = title.to_lowercase();

    if BROWSER_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
        return EmulatorKind::Unknown;
    }

    if mumu_rules().iter().any(|re| re.is_match(&lower)) {
        return EmulatorKind::Mumu;
    }
    if ldplayer_rules().iter().any(|re| re.is_match(&lower)) {
        return EmulatorKind::Ldplayer;
    }

    EmulatorKind::Unknown
}

/// Extracts the MuMu VM index from a title.
/// `mumu模拟器12-0` carries the index in the tail pair (-> 0); a single
/// trailing integer is the fallback.
pub fn extract_mumu_vm_index(title: &str) -> Option<u32> {
    static PAIR: OnceLock<Regex> = OnceLock::new();
    static SINGLE: OnceLock<Regex> = OnceLock::new();

    let lower = title.to_lowercase();

    let pair = PAIR.get_or_init(|| Regex::new(r"mumu.*?(\d+)-(\d+)").expect("static rule"));
    if let Some(caps) = pair.captures(&lower) {
        return caps[2].parse().ok();
    }

    let single = SINGLE.get_or_init(|| Regex::new(r"mumu.*?(\d+)").expect("static rule"));
    if let Some(caps) = single.captures(&lower) {
        return caps[1].parse().ok();
    }

    None
}

// ============================================================================
// 3. THE REGISTRY
// ============================================================================

pub struct EmulatorRegistry {
    enumerator: Box<dyn WindowEnumerator>,
}

impl EmulatorRegistry {
    pub fn new(enumerator: Box<dyn WindowEnumerator>) -> Self {
        Self { enumerator }
    }

    /// Headless default: classify by emulator core processes.
    pub fn with_process_scan() -> Self {
        Self::new(Box::new(ProcessEnumerator))
    }

    /// One discovery scan. Windows are recomputed from scratch each call,
    /// never mutated in place.
    pub fn discover_windows(&self, adb_paths: &AdbPaths) -> Vec<EmulatorWindow> {
        let mut windows = Vec::new();

        for raw in self.enumerator.windows() {
            if raw.title.is_empty() {
                continue;
            }
            let kind = classify_title(&raw.title);
            if kind == EmulatorKind::Unknown {
                continue;
            }

            let vm_index = if kind == EmulatorKind::Mumu {
                extract_mumu_vm_index(&raw.title)
            } else {
                None
            };

            log::info!("discovered {} window: {} (handle {})", kind, raw.title, raw.handle);

            windows.push(EmulatorWindow {
                handle: raw.handle,
                title: raw.title,
                kind,
                process_path: raw.process_path,
                adb_path: adb_paths.for_kind(kind).map(|p| p.to_path_buf()),
                device_id: None,
                vm_index,
            });
        }

        log::info!("discovered {} emulator window(s)", windows.len());
        windows
    }

    /// Families with at least one live window. Drives adb-server binary
    /// selection and device deduplication preferences.
    pub fn running_kinds(&self, adb_paths: &AdbPaths) -> Vec<EmulatorKind> {
        let mut kinds = Vec::new();
        for w in self.discover_windows(adb_paths) {
            if !kinds.contains(&w.kind) {
                kinds.push(w.kind);
            }
        }
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_mumu_titles() {
        assert_eq!(classify_title("MuMu模拟器"), EmulatorKind::Mumu);
        assert_eq!(classify_title("MuMu模拟器12-0"), EmulatorKind::Mumu);
        assert_eq!(classify_title("网易MuMu"), EmulatorKind::Mumu);
        assert_eq!(classify_title("MuMu安卓设备"), EmulatorKind::Mumu);
        assert_eq!(classify_title("mumu3"), EmulatorKind::Mumu);
    }

    #[test]
    fn classifies_ldplayer_titles() {
        assert_eq!(classify_title("雷电模拟器"), EmulatorKind::Ldplayer);
        assert_eq!(classify_title("LDPlayer9"), EmulatorKind::Ldplayer);
        assert_eq!(classify_title("雷电模拟器-1"), EmulatorKind::Ldplayer);
    }

    #[test]
    fn browser_tabs_are_rejected_first() {
        // A tab title mentioning an emulator must not classify.
        assert_eq!(
            classify_title("MuMu模拟器下载 - Microsoft Edge"),
            EmulatorKind::Unknown
        );
        assert_eq!(
            classify_title("雷电模拟器 - Google Chrome"),
            EmulatorKind::Unknown
        );
    }

    #[test]
    fn unrelated_titles_stay_unknown() {
        assert_eq!(classify_title("Visual Studio Code"), EmulatorKind::Unknown);
        assert_eq!(classify_title(""), EmulatorKind::Unknown);
    }

    #[test]
    fn vm_index_prefers_tail_pair() {
        assert_eq!(extract_mumu_vm_index("MuMu模拟器12-0"), Some(0));
        assert_eq!(extract_mumu_vm_index("MuMu模拟器12-3"), Some(3));
        assert_eq!(extract_mumu_vm_index("mumu7"), Some(7));
        assert_eq!(extract_mumu_vm_index("MuMu模拟器"), None);
    }

    struct FakeWindows(Vec<RawWindow>);
    impl WindowEnumerator for FakeWindows {
        fn windows(&self) -> Vec<RawWindow> {
            self.0.clone()
        }
    }

    #[test]
    fn discover_filters_and_annotates() {
        let reg = EmulatorRegistry::new(Box::new(FakeWindows(vec![
            RawWindow {
                handle: 1,
                title: "MuMu模拟器12-1".into(),
                process_path: PathBuf::from("C:/mumu/NemuHeadless.exe"),
            },
            RawWindow {
                handle: 2,
                title: "雷电模拟器".into(),
                process_path: PathBuf::from("C:/ld/dnplayer.exe"),
            },
            RawWindow {
                handle: 3,
                title: "Notepad".into(),
                process_path: PathBuf::from("C:/win/notepad.exe"),
            },
        ])));

        let paths = AdbPaths {
            generic: Some(PathBuf::from("/usr/bin/adb")),
            mumu: Some(PathBuf::from("C:/mumu/adb.exe")),
            ldplayer: None,
        };

        let windows = reg.discover_windows(&paths);
        assert_eq!(windows.len(), 2);

        let mumu = windows.iter().find(|w| w.kind == EmulatorKind::Mumu).unwrap();
        assert_eq!(mumu.vm_index, Some(1));
        assert_eq!(mumu.adb_path.as_deref(), Some(std::path::Path::new("C:/mumu/adb.exe")));

        // LDPlayer slot is empty -> falls back to generic.
        let ld = windows.iter().find(|w| w.kind == EmulatorKind::Ldplayer).unwrap();
        assert_eq!(ld.adb_path.as_deref(), Some(std::path::Path::new("/usr/bin/adb")));

        let kinds = reg.running_kinds(&paths);
        assert!(kinds.contains(&EmulatorKind::Mumu) && kinds.contains(&EmulatorKind::Ldplayer));
    }
}
