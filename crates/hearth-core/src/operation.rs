use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{validate_core_version, validate_extension_name, ToolConfig};

/// Target name used for core update operations.
pub const CORE_TARGET: &str = "core";

/// One reconciliation step derived from desired vs. applied state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Operation {
    Install {
        target: String,
        source: String,
    },
    Update {
        target: String,
        source: String,
    },
    Delete {
        target: String,
    },
    ToolConfig {
        target: String,
        /// `None` when the tool entry is being removed.
        #[serde(default)]
        config: Option<ToolConfig>,
    },
    UpdateCore {
        target_version: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Install,
    Update,
    Delete,
    ToolConfig,
    UpdateCore,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Install => "install",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
            OperationKind::ToolConfig => "tool_config",
            OperationKind::UpdateCore => "update_core",
        }
    }
}

/// Execution phase. Deletes free names and ports before anything is provisioned.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Delete,
    Provision,
    Tools,
    Core,
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Install { .. } => OperationKind::Install,
            Operation::Update { .. } => OperationKind::Update,
            Operation::Delete { .. } => OperationKind::Delete,
            Operation::ToolConfig { .. } => OperationKind::ToolConfig,
            Operation::UpdateCore { .. } => OperationKind::UpdateCore,
        }
    }

    pub fn target(&self) -> &str {
        match self {
            Operation::Install { target, .. }
            | Operation::Update { target, .. }
            | Operation::Delete { target }
            | Operation::ToolConfig { target, .. } => target,
            Operation::UpdateCore { .. } => CORE_TARGET,
        }
    }

    /// Extension name for install/update/delete operations.
    pub fn extension(&self) -> Option<&str> {
        match self {
            Operation::Install { target, .. }
            | Operation::Update { target, .. }
            | Operation::Delete { target } => Some(target),
            _ => None,
        }
    }

    pub fn phase(&self) -> Phase {
        match self {
            Operation::Delete { .. } => Phase::Delete,
            Operation::Install { .. } | Operation::Update { .. } => Phase::Provision,
            Operation::ToolConfig { .. } => Phase::Tools,
            Operation::UpdateCore { .. } => Phase::Core,
        }
    }

    /// Two operations with the same key describe the same slot of work; the
    /// later one replaces the earlier. Install and update share a slot, delete
    /// does not, so delete-then-reinstall keeps both steps.
    pub fn dedup_key(&self) -> (Phase, &str) {
        (self.phase(), self.target())
    }

    /// Same kind and target, ignoring payload. Used when an operator removes
    /// an operation they saw in an earlier queue snapshot.
    pub fn same_slot(&self, other: &Operation) -> bool {
        self.kind() == other.kind() && self.target() == other.target()
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Operation::Install { target, source } | Operation::Update { target, source } => {
                validate_extension_name(target)?;
                if source.trim().is_empty() {
                    return Err(Error::Validation(format!(
                        "{} of `{target}` requires a source",
                        self.kind().as_str()
                    )));
                }
                Ok(())
            }
            Operation::Delete { target } => validate_extension_name(target),
            Operation::ToolConfig { target, .. } => {
                if target.trim().is_empty() {
                    Err(Error::Validation("tool_config requires a target".into()))
                } else {
                    Ok(())
                }
            }
            Operation::UpdateCore { target_version } => validate_core_version(target_version),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind().as_str(), self.target())
    }
}

/// Collapse duplicate slots, keeping the later operation.
pub fn dedup_operations(ops: impl IntoIterator<Item = Operation>) -> Vec<Operation> {
    let mut out: Vec<Operation> = Vec::new();
    for op in ops {
        out.retain(|existing| existing.dedup_key() != op.dedup_key());
        out.push(op);
    }
    out
}

/// Stable sort into execution order: deletes, installs/updates, tools, core.
pub fn execution_order(ops: &[Operation]) -> Vec<Operation> {
    let mut ordered = ops.to_vec();
    ordered.sort_by_key(|op| op.phase());
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn install(target: &str) -> Operation {
        Operation::Install {
            target: target.into(),
            source: "local".into(),
        }
    }

    #[test]
    fn wire_format_is_tagged_by_type() {
        let op: Operation =
            serde_json::from_value(json!({"type": "install", "target": "chef", "source": "local"}))
                .unwrap();
        assert_eq!(op, install("chef"));
        let core = Operation::UpdateCore {
            target_version: "1.2.0".into(),
        };
        assert_eq!(
            serde_json::to_value(&core).unwrap(),
            json!({"type": "update_core", "target_version": "1.2.0"})
        );
        assert_eq!(core.target(), CORE_TARGET);
    }

    #[test]
    fn install_then_update_collapses_to_one() {
        let ops = dedup_operations(vec![
            install("chef"),
            Operation::Update {
                target: "chef".into(),
                source: "git+https://example.invalid/chef.git".into(),
            },
        ]);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].kind(), OperationKind::Update);
    }

    #[test]
    fn delete_and_reinstall_of_same_target_coexist() {
        let ops = dedup_operations(vec![
            Operation::Delete {
                target: "chef".into(),
            },
            install("chef"),
        ]);
        assert_eq!(ops.len(), 2);
    }

    #[test]
    fn execution_order_runs_deletes_first_and_core_last() {
        let ops = vec![
            Operation::UpdateCore {
                target_version: "2.0.0".into(),
            },
            install("b"),
            Operation::ToolConfig {
                target: "search".into(),
                config: None,
            },
            Operation::Delete { target: "a".into() },
            install("a"),
        ];
        let kinds: Vec<_> = execution_order(&ops)
            .iter()
            .map(|op| (op.kind(), op.target().to_string()))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (OperationKind::Delete, "a".into()),
                (OperationKind::Install, "b".into()),
                (OperationKind::Install, "a".into()),
                (OperationKind::ToolConfig, "search".into()),
                (OperationKind::UpdateCore, "core".into()),
            ]
        );
    }

    #[test]
    fn validation_rejects_sourceless_installs() {
        let op = Operation::Install {
            target: "chef".into(),
            source: " ".into(),
        };
        assert!(op.validate().is_err());
        assert!(install("chef").validate().is_ok());
    }
}
