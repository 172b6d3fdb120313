use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::diff::diff;
use crate::error::{Error, Result};
use crate::manifest::InstalledExtensionRecord;
use crate::model::MasterConfig;
use crate::operation::{dedup_operations, Operation};
use crate::store::ConfigStore;
use crate::util::{read_json_opt, write_json_atomic};

pub const QUEUE_FILE: &str = "queue.json";

/// The single pending change set: what to do, and what the config should look
/// like afterwards.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct QueuedChangeSet {
    #[serde(default)]
    pub operations: Vec<Operation>,
    #[serde(rename = "master_config", alias = "target_config")]
    pub target_config: MasterConfig,
    pub created_at: DateTime<Utc>,
}

impl QueuedChangeSet {
    pub fn seed(baseline: MasterConfig) -> Self {
        Self {
            operations: Vec::new(),
            target_config: baseline,
            created_at: Utc::now(),
        }
    }

    pub fn is_noop_against(&self, applied: &MasterConfig) -> bool {
        self.operations.is_empty() && self.target_config.canonical_eq(applied)
    }
}

/// Operator-supplied queue document (`PUT /queue`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueDocument {
    #[serde(default)]
    pub operations: Vec<Operation>,
    #[serde(rename = "master_config", alias = "target_config")]
    pub master_config: MasterConfig,
}

pub struct QueueManager {
    path: PathBuf,
}

impl QueueManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_dir(state_dir: &Path) -> Self {
        Self::new(state_dir.join(QUEUE_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<QueuedChangeSet>> {
        read_json_opt(&self.path)
    }

    /// The current queue, or a fresh draft seeded from the applied baseline.
    pub fn ensure_draft(&self, store: &ConfigStore) -> Result<QueuedChangeSet> {
        match self.load()? {
            Some(queue) => Ok(queue),
            None => Ok(QueuedChangeSet::seed(store.load()?)),
        }
    }

    /// Write the change set, or delete the queue file when it would change
    /// nothing. Ports are always taken from the applied baseline.
    pub fn persist(
        &self,
        mut change_set: QueuedChangeSet,
        applied: &MasterConfig,
    ) -> Result<Option<QueuedChangeSet>> {
        change_set.target_config.port_assignments = applied.port_assignments.clone();
        change_set.operations = dedup_operations(change_set.operations);
        if change_set.is_noop_against(applied) {
            if self.delete()? {
                info!(target: "hearth::queue", "queue matches applied config; cleared");
            }
            return Ok(None);
        }
        change_set.target_config.validate()?;
        for op in &change_set.operations {
            op.validate()?;
        }
        write_json_atomic(&self.path, &change_set)?;
        debug!(
            target: "hearth::queue",
            operations = change_set.operations.len(),
            "queue persisted"
        );
        Ok(Some(change_set))
    }

    /// Recompute operations for a new target and persist. Each call replaces
    /// the previous operation list, so reverting a patch leaves no queue.
    pub fn stage(
        &self,
        store: &ConfigStore,
        installed: &[InstalledExtensionRecord],
        target: MasterConfig,
    ) -> Result<Option<QueuedChangeSet>> {
        let applied = store.load()?;
        let target = target.with_ports_from(&applied);
        target.validate()?;
        let created_at = self
            .load()?
            .map(|existing| existing.created_at)
            .unwrap_or_else(Utc::now);
        let operations = diff(&target, installed, &applied);
        self.persist(
            QueuedChangeSet {
                operations,
                target_config: target,
                created_at,
            },
            &applied,
        )
    }

    /// Replace the queue with an operator-edited document. Operations are kept
    /// as given (deduplicated), not recomputed.
    pub fn save_document(
        &self,
        store: &ConfigStore,
        doc: QueueDocument,
    ) -> Result<Option<QueuedChangeSet>> {
        let applied = store.load()?;
        for op in &doc.operations {
            op.validate()?;
        }
        doc.master_config.validate()?;
        self.persist(
            QueuedChangeSet {
                operations: doc.operations,
                target_config: doc.master_config,
                created_at: Utc::now(),
            },
            &applied,
        )
    }

    /// Drop one operation and revert the fields it covers back to the applied
    /// baseline; everything else in the draft stays as queued.
    pub fn remove_operation(
        &self,
        store: &ConfigStore,
        op: &Operation,
    ) -> Result<Option<QueuedChangeSet>> {
        let mut queue = self.load()?.ok_or(Error::NoQueue)?;
        let before = queue.operations.len();
        queue.operations.retain(|existing| !existing.same_slot(op));
        if queue.operations.len() == before {
            return Err(Error::UnknownOperation(op.to_string()));
        }
        let applied = store.load()?;
        revert_operation_fields(&mut queue.target_config, &applied, op);
        info!(target: "hearth::queue", operation = %op, "operation removed from queue");
        self.persist(queue, &applied)
    }

    /// Returns whether a queue file existed.
    pub fn delete(&self) -> Result<bool> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(Error::io(&self.path, err)),
        }
    }
}

/// Reset the part of `target` an operation is responsible for to its value in `baseline`.
pub fn revert_operation_fields(target: &mut MasterConfig, baseline: &MasterConfig, op: &Operation) {
    match op {
        Operation::Install { target: name, .. }
        | Operation::Update { target: name, .. }
        | Operation::Delete { target: name } => match baseline.extensions.get(name) {
            Some(entry) => {
                target.extensions.insert(name.clone(), entry.clone());
            }
            None => {
                target.extensions.remove(name);
            }
        },
        Operation::ToolConfig { target: name, .. } => match baseline.tool_configs.get(name) {
            Some(entry) => {
                target.tool_configs.insert(name.clone(), *entry);
            }
            None => {
                target.tool_configs.remove(name);
            }
        },
        Operation::UpdateCore { .. } => {
            target.core.pending_update = baseline.core.pending_update.clone();
        }
    }
}
