//! Field-level edits to the desired config. Every patch edits the queued draft
//! (or the baseline when nothing is queued) and restages the queue; the applied
//! baseline itself only changes through apply.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use crate::error::{Error, Result};
use crate::manifest::InstalledExtensionRecord;
use crate::model::{
    merge_values, validate_core_version, validate_extension_name, ExtensionEntry, ToolConfig,
};
use crate::queue::{QueueManager, QueuedChangeSet};
use crate::store::ConfigStore;

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ExtensionPatch {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub source: Option<String>,
    /// Deep-merged into the existing `config` object.
    #[serde(default)]
    pub config: Option<Map<String, Value>>,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ToolPatch {
    #[serde(default)]
    pub enabled_in_mcp: Option<bool>,
    #[serde(default)]
    pub passthrough: Option<bool>,
}

impl ConfigStore {
    /// `None` removes the extension from the desired state.
    pub fn patch_extension(
        &self,
        queue: &QueueManager,
        installed: &[InstalledExtensionRecord],
        name: &str,
        patch: Option<ExtensionPatch>,
    ) -> Result<Option<QueuedChangeSet>> {
        validate_extension_name(name)?;
        let mut draft = queue.ensure_draft(self)?.target_config;
        match patch {
            None => {
                draft.extensions.remove(name);
            }
            Some(patch) => {
                let is_new = !draft.extensions.contains_key(name);
                let entry = draft
                    .extensions
                    .entry(name.to_string())
                    .or_insert_with(|| ExtensionEntry::new(""));
                if let Some(enabled) = patch.enabled {
                    entry.enabled = enabled;
                }
                if let Some(source) = patch.source {
                    let source = source.trim();
                    if source.is_empty() {
                        return Err(Error::Validation(format!(
                            "source for `{name}` cannot be blank"
                        )));
                    }
                    entry.source = source.to_string();
                }
                if let Some(config) = patch.config {
                    let mut merged = Value::Object(std::mem::take(&mut entry.config));
                    merge_values(&mut merged, &Value::Object(config));
                    if let Value::Object(map) = merged {
                        entry.config = map;
                    }
                }
                if is_new && !entry.has_source() {
                    return Err(Error::Validation(format!(
                        "installing `{name}` requires a source"
                    )));
                }
            }
        }
        info!(target: "hearth::config", extension = name, "extension patched");
        queue.stage(self, installed, draft)
    }

    /// `None` removes the tool entry; an emptied `tool_configs` map is pruned.
    pub fn patch_tool(
        &self,
        queue: &QueueManager,
        installed: &[InstalledExtensionRecord],
        name: &str,
        patch: Option<ToolPatch>,
    ) -> Result<Option<QueuedChangeSet>> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::Validation("tool name must not be empty".into()));
        }
        let mut draft = queue.ensure_draft(self)?.target_config;
        match patch {
            None => {
                draft.tool_configs.remove(name);
            }
            Some(patch) => {
                let entry = draft
                    .tool_configs
                    .entry(name.to_string())
                    .or_insert_with(ToolConfig::default);
                if let Some(flag) = patch.enabled_in_mcp {
                    entry.enabled_in_mcp = flag;
                }
                if let Some(flag) = patch.passthrough {
                    entry.passthrough = flag;
                }
            }
        }
        info!(target: "hearth::config", tool = name, "tool config patched");
        queue.stage(self, installed, draft)
    }

    /// `None` withdraws a pending core update.
    pub fn patch_core_update(
        &self,
        queue: &QueueManager,
        installed: &[InstalledExtensionRecord],
        version: Option<String>,
    ) -> Result<Option<QueuedChangeSet>> {
        let version = version
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        if let Some(v) = version.as_deref() {
            validate_core_version(v)?;
        }
        let mut draft = queue.ensure_draft(self)?.target_config;
        draft.core.pending_update = version;
        info!(
            target: "hearth::config",
            pending = draft.core.pending_update.as_deref().unwrap_or("-"),
            "core update patched"
        );
        queue.stage(self, installed, draft)
    }
}
