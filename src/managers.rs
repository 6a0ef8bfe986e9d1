// src/managers.rs
//
// =============================================================================
// DROIDFLOW: VENDOR MANAGER CLIS
// =============================================================================
//
// The Diplomats.
//
// Each emulator vendor ships a console utility that knows the authoritative
// state of its instances (VM index, adb port, boot progress). Where a
// manager is installed we trust it over any port-range guesswork.

use crate::core::AdbPaths;
use std::sync::Arc;

pub mod ldconsole;
pub mod mumu;

pub use ldconsole::LdConsole;
pub use mumu::MuMuManager;

/// The manager CLIs found on this host. Slots are `None` when the vendor
/// tooling is not installed; every consumer must degrade gracefully.
#[derive(Clone, Default)]
pub struct VendorManagers {
    pub mumu: Option<Arc<MuMuManager>>,
    pub ldplayer: Option<Arc<LdConsole>>,
}

impl VendorManagers {
    /// Locates manager binaries next to the discovered adb installs.
    pub fn detect(adb_paths: &AdbPaths) -> Self {
        let mumu = MuMuManager::locate(adb_paths).map(Arc::new);
        let ldplayer = LdConsole::locate(adb_paths).map(Arc::new);

        log::info!(
            "vendor managers: mumu={} ldplayer={}",
            mumu.is_some(),
            ldplayer.is_some()
        );

        Self { mumu, ldplayer }
    }
}
