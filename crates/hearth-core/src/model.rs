use std::collections::{BTreeMap, HashMap};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::ports::PortScope;

static EXTENSION_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9_-]{0,63}$").expect("extension name regex"));

/// The single desired-state document.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MasterConfig {
    #[serde(default)]
    pub extensions: BTreeMap<String, ExtensionEntry>,
    /// Pruned from the document when empty.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tool_configs: BTreeMap<String, ToolConfig>,
    #[serde(default)]
    pub mcp_servers: BTreeMap<String, Value>,
    #[serde(default)]
    pub agent_presets: BTreeMap<String, Value>,
    #[serde(default)]
    pub port_assignments: PortAssignments,
    #[serde(default)]
    pub external_services: BTreeMap<String, Value>,
    #[serde(default)]
    pub core: CoreMeta,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ExtensionEntry {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub config: Map<String, Value>,
}

fn default_true() -> bool {
    true
}

impl ExtensionEntry {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            enabled: true,
            source: source.into(),
            config: Map::new(),
        }
    }

    pub fn has_source(&self) -> bool {
        !self.source.trim().is_empty()
    }

    pub fn source(&self) -> &str {
        self.source.trim()
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ToolConfig {
    #[serde(default)]
    pub enabled_in_mcp: bool,
    #[serde(default)]
    pub passthrough: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PortAssignments {
    #[serde(default)]
    pub extensions: BTreeMap<String, u16>,
    #[serde(default)]
    pub services: BTreeMap<String, u16>,
}

impl PortAssignments {
    pub fn table(&self, scope: PortScope) -> &BTreeMap<String, u16> {
        match scope {
            PortScope::ExtensionUi => &self.extensions,
            PortScope::ExtensionService => &self.services,
        }
    }

    pub fn table_mut(&mut self, scope: PortScope) -> &mut BTreeMap<String, u16> {
        match scope {
            PortScope::ExtensionUi => &mut self.extensions,
            PortScope::ExtensionService => &mut self.services,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CoreMeta {
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_update: Option<String>,
}

impl MasterConfig {
    /// Copy of `self` carrying `other`'s port table. Ports belong to the allocator,
    /// not to queued drafts, so comparisons and baselines always take them from disk.
    pub fn with_ports_from(mut self, other: &MasterConfig) -> Self {
        self.port_assignments = other.port_assignments.clone();
        self
    }

    /// Structural equality that ignores key order anywhere in the document.
    pub fn canonical_eq(&self, other: &MasterConfig) -> bool {
        match (serde_json::to_value(self), serde_json::to_value(other)) {
            (Ok(a), Ok(b)) => canonicalize(a) == canonicalize(b),
            _ => false,
        }
    }

    /// Stable JSON rendering with recursively sorted keys.
    pub fn canonical_string(&self) -> String {
        serde_json::to_value(self)
            .map(canonicalize)
            .map(|value| value.to_string())
            .unwrap_or_default()
    }

    pub fn validate(&self) -> Result<()> {
        for name in self.extensions.keys() {
            validate_extension_name(name)?;
        }
        for name in self.tool_configs.keys() {
            if name.trim().is_empty() {
                return Err(Error::Validation("tool name must not be empty".into()));
            }
        }
        for scope in [PortScope::ExtensionUi, PortScope::ExtensionService] {
            let range = scope.range();
            let mut seen: HashMap<u16, &str> = HashMap::new();
            for (owner, port) in self.port_assignments.table(scope) {
                if !range.contains(port) {
                    return Err(Error::Validation(format!(
                        "{scope} port {port} for `{owner}` outside {}-{}",
                        range.start(),
                        range.end()
                    )));
                }
                if let Some(previous) = seen.insert(*port, owner.as_str()) {
                    return Err(Error::Validation(format!(
                        "{scope} port {port} assigned to both `{previous}` and `{owner}`"
                    )));
                }
            }
        }
        if let Some(version) = self.core.pending_update.as_deref() {
            validate_core_version(version)?;
        }
        Ok(())
    }
}

/// Extension names double as directory names and port owner keys; dots are
/// reserved for `extension.service` keys.
pub fn validate_extension_name(name: &str) -> Result<()> {
    if EXTENSION_NAME.is_match(name) {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "invalid extension name `{name}` (expected [a-z0-9][a-z0-9_-]{{0,63}})"
        )))
    }
}

pub fn validate_core_version(version: &str) -> Result<()> {
    let trimmed = version.trim().trim_start_matches('v');
    semver::Version::parse(trimmed)
        .map(|_| ())
        .map_err(|err| Error::Validation(format!("invalid core version `{version}`: {err}")))
}

/// Recursively rebuild objects with sorted keys.
pub fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut out = Map::new();
            for (key, value) in entries {
                out.insert(key, canonicalize(value));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

/// Deep-merge `add` into `dst`: objects merge key by key, everything else replaces.
pub fn merge_values(dst: &mut Value, add: &Value) {
    match (dst, add) {
        (Value::Object(d), Value::Object(a)) => {
            for (k, v) in a.iter() {
                match d.get_mut(k) {
                    Some(dv) => merge_values(dv, v),
                    None => {
                        d.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (d, v) => {
            *d = v.clone();
        }
    }
}
