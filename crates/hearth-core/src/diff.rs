//! Pure comparison of desired, installed, and last-applied state.

use std::collections::{BTreeSet, HashMap};

use serde::Serialize;
use tracing::warn;

use crate::manifest::InstalledExtensionRecord;
use crate::model::MasterConfig;
use crate::operation::Operation;

/// Everything the differ noticed, not only the operations it emits.
#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct DiffReport {
    pub operations: Vec<Operation>,
    /// Extensions whose `enabled`/`config` changed without needing an operation.
    pub config_only: Vec<String>,
    /// Desired extensions that could not be installed because they have no source.
    pub dropped: Vec<String>,
}

/// Operations needed to move from `previous` (last applied) and `installed`
/// (what is on disk) to `desired`.
pub fn diff(
    desired: &MasterConfig,
    installed: &[InstalledExtensionRecord],
    previous: &MasterConfig,
) -> Vec<Operation> {
    diff_report(desired, installed, previous).operations
}

pub fn diff_report(
    desired: &MasterConfig,
    installed: &[InstalledExtensionRecord],
    previous: &MasterConfig,
) -> DiffReport {
    let on_disk: HashMap<&str, &InstalledExtensionRecord> = installed
        .iter()
        .map(|record| (record.name.as_str(), record))
        .collect();
    let names: BTreeSet<&str> = desired
        .extensions
        .keys()
        .chain(previous.extensions.keys())
        .map(String::as_str)
        .collect();

    let mut report = DiffReport::default();
    let mut deletes = Vec::new();
    let mut provisions = Vec::new();

    for name in names {
        match (desired.extensions.get(name), previous.extensions.get(name)) {
            (Some(want), None) => {
                if !want.has_source() {
                    warn!(target: "hearth::queue", extension = name, "desired extension has no source; not installing");
                    report.dropped.push(name.to_string());
                    continue;
                }
                provisions.push(Operation::Install {
                    target: name.to_string(),
                    source: want.source().to_string(),
                });
            }
            (Some(want), Some(had)) => {
                if want.source() != had.source() && want.has_source() {
                    provisions.push(Operation::Update {
                        target: name.to_string(),
                        source: want.source().to_string(),
                    });
                } else if !on_disk.contains_key(name) {
                    if want.has_source() {
                        provisions.push(Operation::Install {
                            target: name.to_string(),
                            source: want.source().to_string(),
                        });
                    } else {
                        warn!(target: "hearth::queue", extension = name, "extension missing on disk and has no source");
                        report.dropped.push(name.to_string());
                    }
                } else if want != had {
                    report.config_only.push(name.to_string());
                }
            }
            (None, Some(_)) => deletes.push(Operation::Delete {
                target: name.to_string(),
            }),
            (None, None) => {}
        }
    }

    report.operations.extend(deletes);
    report.operations.extend(provisions);
    report.operations.extend(tool_operations(desired, previous));
    report.operations.extend(core_operation(desired, previous));
    report
}

fn tool_operations(desired: &MasterConfig, previous: &MasterConfig) -> Vec<Operation> {
    let names: BTreeSet<&String> = desired
        .tool_configs
        .keys()
        .chain(previous.tool_configs.keys())
        .collect();
    names
        .into_iter()
        .filter_map(|name| {
            let want = desired.tool_configs.get(name);
            if want == previous.tool_configs.get(name) {
                return None;
            }
            Some(Operation::ToolConfig {
                target: name.clone(),
                config: want.copied(),
            })
        })
        .collect()
}

fn core_operation(desired: &MasterConfig, previous: &MasterConfig) -> Option<Operation> {
    let pending = desired.core.pending_update.as_deref()?;
    if previous.core.pending_update.as_deref() == Some(pending) || pending == previous.core.version {
        return None;
    }
    Some(Operation::UpdateCore {
        target_version: pending.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ExtensionEntry, ToolConfig};
    use crate::operation::OperationKind;
    use std::path::PathBuf;

    fn installed(names: &[&str]) -> Vec<InstalledExtensionRecord> {
        names
            .iter()
            .map(|name| InstalledExtensionRecord {
                name: name.to_string(),
                version: None,
                source: Some("local".into()),
                has_ui: false,
                has_backend: true,
                path: PathBuf::from(format!("/ext/{name}")),
            })
            .collect()
    }

    fn cfg_with(exts: &[(&str, &str)]) -> MasterConfig {
        let mut cfg = MasterConfig::default();
        for (name, source) in exts {
            cfg.extensions
                .insert(name.to_string(), ExtensionEntry::new(*source));
        }
        cfg
    }

    #[test]
    fn matching_state_yields_no_operations() {
        let mut cfg = cfg_with(&[("chef", "local"), ("pantry", "local")]);
        cfg.tool_configs.insert(
            "search".into(),
            ToolConfig {
                enabled_in_mcp: true,
                passthrough: false,
            },
        );
        cfg.core.version = "1.0.0".into();
        assert!(diff(&cfg, &installed(&["chef", "pantry"]), &cfg).is_empty());
    }

    #[test]
    fn fresh_extension_installs_and_sourceless_is_dropped() {
        let desired = cfg_with(&[("chef", "local"), ("ghost", "")]);
        let report = diff_report(&desired, &[], &MasterConfig::default());
        assert_eq!(
            report.operations,
            vec![Operation::Install {
                target: "chef".into(),
                source: "local".into()
            }]
        );
        assert_eq!(report.dropped, vec!["ghost".to_string()]);
    }

    #[test]
    fn source_change_updates_and_missing_dir_reinstalls() {
        let previous = cfg_with(&[("chef", "local"), ("pantry", "local")]);
        let desired = cfg_with(&[("chef", "git+https://example.invalid/chef.git"), ("pantry", "local")]);
        let ops = diff(&desired, &installed(&["chef"]), &previous);
        let kinds: Vec<_> = ops.iter().map(|op| (op.kind(), op.target())).collect();
        assert_eq!(
            kinds,
            vec![
                (OperationKind::Update, "chef"),
                (OperationKind::Install, "pantry")
            ]
        );
    }

    #[test]
    fn toggle_only_is_config_only() {
        let previous = cfg_with(&[("chef", "local")]);
        let mut desired = previous.clone();
        desired.extensions.get_mut("chef").unwrap().enabled = false;
        let report = diff_report(&desired, &installed(&["chef"]), &previous);
        assert!(report.operations.is_empty());
        assert_eq!(report.config_only, vec!["chef".to_string()]);
    }

    #[test]
    fn removed_extension_is_deleted_first() {
        let previous = cfg_with(&[("old", "local")]);
        let desired = cfg_with(&[("new", "local")]);
        let ops = diff(&desired, &installed(&["old"]), &previous);
        assert_eq!(ops[0], Operation::Delete { target: "old".into() });
        assert_eq!(ops[1].kind(), OperationKind::Install);
    }

    #[test]
    fn tool_and_core_changes_are_appended() {
        let mut previous = MasterConfig::default();
        previous.core.version = "1.0.0".into();
        previous.tool_configs.insert("gone".into(), ToolConfig::default());
        let mut desired = previous.clone();
        desired.tool_configs.remove("gone");
        desired.tool_configs.insert(
            "search".into(),
            ToolConfig {
                enabled_in_mcp: true,
                passthrough: true,
            },
        );
        desired.core.pending_update = Some("1.1.0".into());
        let ops = diff(&desired, &[], &previous);
        assert_eq!(
            ops,
            vec![
                Operation::ToolConfig {
                    target: "gone".into(),
                    config: None
                },
                Operation::ToolConfig {
                    target: "search".into(),
                    config: Some(ToolConfig {
                        enabled_in_mcp: true,
                        passthrough: true
                    })
                },
                Operation::UpdateCore {
                    target_version: "1.1.0".into()
                },
            ]
        );
    }

    #[test]
    fn pending_update_equal_to_current_version_is_ignored() {
        let mut previous = MasterConfig::default();
        previous.core.version = "1.0.0".into();
        let mut desired = previous.clone();
        desired.core.pending_update = Some("1.0.0".into());
        assert!(diff(&desired, &[], &previous).is_empty());
    }
}
