//! Desired-state model and reconciliation primitives for the hearth hub.
//!
//! The applied baseline lives in [`ConfigStore`]; operator edits accumulate in
//! a single queued change set managed by [`QueueManager`]; [`diff`] turns the
//! gap between the two (and what is actually installed) into [`Operation`]s.
//! Ports for extension processes come from [`PortAllocator`].

pub mod diff;
pub mod error;
pub mod manifest;
pub mod model;
pub mod operation;
pub mod patch;
pub mod ports;
pub mod queue;
pub mod settings;
pub mod store;
pub mod util;

pub use diff::{diff, diff_report, DiffReport};
pub use error::{Error, Result};
pub use manifest::{
    scan_installed, ExtensionManifest, InstallMarker, InstalledExtensionRecord, ServiceTemplate,
};
pub use model::{CoreMeta, ExtensionEntry, MasterConfig, PortAssignments, ToolConfig};
pub use operation::{execution_order, Operation, OperationKind, Phase};
pub use patch::{ExtensionPatch, ToolPatch};
pub use ports::{PortAllocator, PortAssignment, PortScope};
pub use queue::{QueueDocument, QueueManager, QueuedChangeSet};
pub use settings::{CoreServiceConfig, Settings};
pub use store::ConfigStore;

/// Find `rel` under the usual config roots, first hit wins: `HEARTH_CONFIG_DIR`,
/// the executable's directory and its parent, then the working directory.
/// Absolute paths are returned as-is when they exist.
pub fn resolve_config_path(rel: &str) -> Option<std::path::PathBuf> {
    use std::path::{Path, PathBuf};

    let wanted = Path::new(rel);
    if wanted.is_absolute() {
        return wanted.exists().then(|| wanted.to_path_buf());
    }
    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf));
    let roots = util::env_string("HEARTH_CONFIG_DIR")
        .map(PathBuf::from)
        .into_iter()
        .chain(exe_dir.iter().cloned())
        .chain(exe_dir.as_deref().and_then(Path::parent).map(Path::to_path_buf))
        .chain(std::env::current_dir().ok());
    roots.map(|root| root.join(wanted)).find(|p| p.exists())
}
