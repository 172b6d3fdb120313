//! Extension manifests (`extension.toml`), install markers, and the on-disk scan
//! that feeds the differ.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use hearth_runtime::{HealthCheck, ServiceKind, ServiceSpec};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};
use crate::model::validate_extension_name;
use crate::ports::{service_owner, ui_owner, PortScope};
use crate::util::{read_json_opt, write_json_atomic};

pub const MANIFEST_FILE: &str = "extension.toml";
pub const INSTALL_MARKER: &str = ".hearth-install.json";

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ProcessDecl {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub health_path: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ServiceDecl {
    pub name: String,
    #[serde(flatten)]
    pub process: ProcessDecl,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ExtensionManifest {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub ui: Option<ProcessDecl>,
    #[serde(default)]
    pub services: Vec<ServiceDecl>,
}

impl ExtensionManifest {
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILE);
        let text = fs::read_to_string(&path).map_err(|e| Error::io(&path, e))?;
        let manifest: ExtensionManifest =
            toml::from_str(&text).map_err(|e| Error::malformed(&path, e))?;
        manifest
            .validate()
            .map_err(|e| Error::malformed(&path, e))?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<()> {
        validate_extension_name(&self.name)?;
        if let Some(ui) = &self.ui {
            if ui.command.trim().is_empty() {
                return Err(Error::Validation(format!("{}: ui.command is empty", self.name)));
            }
        }
        let mut seen = std::collections::HashSet::new();
        for svc in &self.services {
            validate_extension_name(&svc.name)?;
            if svc.process.command.trim().is_empty() {
                return Err(Error::Validation(format!(
                    "{}: service `{}` has no command",
                    self.name, svc.name
                )));
            }
            if !seen.insert(svc.name.as_str()) {
                return Err(Error::Validation(format!(
                    "{}: duplicate service `{}`",
                    self.name, svc.name
                )));
            }
        }
        Ok(())
    }

    /// One template per declared process, UI first, services in manifest order.
    pub fn templates(&self, dir: &Path) -> Vec<ServiceTemplate> {
        let mut out = Vec::new();
        if let Some(ui) = &self.ui {
            out.push(ServiceTemplate::from_decl(
                ui_owner(&self.name),
                ServiceKind::ExtensionUi,
                &self.name,
                Some(PortScope::ExtensionUi),
                ui,
                dir,
            ));
        }
        for svc in &self.services {
            out.push(ServiceTemplate::from_decl(
                service_owner(&self.name, &svc.name),
                ServiceKind::ExtensionService,
                &self.name,
                Some(PortScope::ExtensionService),
                &svc.process,
                dir,
            ));
        }
        out
    }
}

/// Where an installed extension came from.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct InstallMarker {
    pub source: String,
    #[serde(default)]
    pub version: Option<String>,
    pub installed_at: DateTime<Utc>,
}

impl InstallMarker {
    pub fn write(dir: &Path, source: &str, version: Option<String>) -> Result<Self> {
        let marker = InstallMarker {
            source: source.to_string(),
            version,
            installed_at: Utc::now(),
        };
        write_json_atomic(&dir.join(INSTALL_MARKER), &marker)?;
        Ok(marker)
    }

    pub fn read(dir: &Path) -> Result<Option<Self>> {
        read_json_opt(&dir.join(INSTALL_MARKER))
    }
}

/// What exists on disk for one extension.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct InstalledExtensionRecord {
    pub name: String,
    pub version: Option<String>,
    pub source: Option<String>,
    pub has_ui: bool,
    pub has_backend: bool,
    pub path: PathBuf,
}

impl InstalledExtensionRecord {
    pub fn from_manifest(dir: &Path, manifest: &ExtensionManifest, marker: Option<InstallMarker>) -> Self {
        Self {
            name: manifest.name.clone(),
            version: manifest
                .version
                .clone()
                .or_else(|| marker.as_ref().and_then(|m| m.version.clone())),
            source: marker.map(|m| m.source),
            has_ui: manifest.ui.is_some(),
            has_backend: !manifest.services.is_empty(),
            path: dir.to_path_buf(),
        }
    }
}

/// Scan `extensions_dir` for installed extensions, sorted by name. Directories
/// whose manifest is missing, unreadable, or names a different extension are
/// skipped so the differ schedules a fresh install for them.
pub fn scan_installed(extensions_dir: &Path) -> Result<Vec<InstalledExtensionRecord>> {
    let entries = match fs::read_dir(extensions_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(Error::io(extensions_dir, err)),
    };
    let mut out = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| Error::io(extensions_dir, e))?;
        let dir = entry.path();
        if !dir.is_dir() || !dir.join(MANIFEST_FILE).is_file() {
            continue;
        }
        let dir_name = entry.file_name().to_string_lossy().into_owned();
        if dir_name.starts_with('.') {
            continue;
        }
        let manifest = match ExtensionManifest::load(&dir) {
            Ok(manifest) => manifest,
            Err(err) => {
                warn!(target: "hearth::config", dir = %dir.display(), %err, "skipping unreadable extension");
                continue;
            }
        };
        if manifest.name != dir_name {
            warn!(
                target: "hearth::config",
                dir = %dir.display(),
                manifest = %manifest.name,
                "manifest name does not match directory; skipping"
            );
            continue;
        }
        let marker = match InstallMarker::read(&dir) {
            Ok(marker) => marker,
            Err(err) => {
                warn!(target: "hearth::config", dir = %dir.display(), %err, "ignoring unreadable install marker");
                None
            }
        };
        out.push(InstalledExtensionRecord::from_manifest(&dir, &manifest, marker));
    }
    out.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(out)
}

/// A declared process before a port has been chosen for it.
#[derive(Clone, Debug, PartialEq)]
pub struct ServiceTemplate {
    pub id: String,
    pub kind: ServiceKind,
    pub owner: String,
    /// `None` for core services, which carry a fixed port.
    pub scope: Option<PortScope>,
    pub fixed_port: Option<u16>,
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub workdir: Option<PathBuf>,
    pub health_path: Option<String>,
}

impl ServiceTemplate {
    fn from_decl(
        id: String,
        kind: ServiceKind,
        owner: &str,
        scope: Option<PortScope>,
        decl: &ProcessDecl,
        dir: &Path,
    ) -> Self {
        Self {
            id,
            kind,
            owner: owner.to_string(),
            scope,
            fixed_port: None,
            command: decl.command.clone(),
            args: decl.args.clone(),
            env: decl.env.clone(),
            workdir: Some(dir.to_path_buf()),
            health_path: decl.health_path.clone(),
        }
    }

    /// Substitute `{port}`/`{dir}` placeholders and export `PORT`/`HEARTH_PORT`.
    pub fn resolve(&self, port: Option<u16>) -> ServiceSpec {
        let dir = self
            .workdir
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        let port_str = port.map(|p| p.to_string()).unwrap_or_default();
        let expand = |raw: &str| raw.replace("{port}", &port_str).replace("{dir}", &dir);
        let mut env: BTreeMap<String, String> = self
            .env
            .iter()
            .map(|(k, v)| (k.clone(), expand(v)))
            .collect();
        if let Some(port) = port {
            env.insert("PORT".into(), port.to_string());
            env.insert("HEARTH_PORT".into(), port.to_string());
        }
        ServiceSpec {
            id: self.id.clone(),
            kind: self.kind,
            owner: self.owner.clone(),
            command: expand(&self.command),
            args: self.args.iter().map(|a| expand(a)).collect(),
            env,
            workdir: self.workdir.clone(),
            port,
            health: self.health_path.as_deref().map(HealthCheck::new),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHEF: &str = r#"
name = "chef"
version = "0.3.1"

[ui]
command = "python3"
args = ["-m", "http.server", "{port}"]

[[services]]
name = "api"
command = "{dir}/bin/chef-api"
args = ["--port", "{port}"]
health_path = "/health"
env = { CHEF_MODE = "prod" }
"#;

    fn write_ext(root: &Path, name: &str, manifest: &str) -> PathBuf {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(MANIFEST_FILE), manifest).unwrap();
        dir
    }

    #[test]
    fn manifest_produces_ui_and_service_templates() {
        let root = tempfile::tempdir().unwrap();
        let dir = write_ext(root.path(), "chef", CHEF);
        let manifest = ExtensionManifest::load(&dir).unwrap();
        let templates = manifest.templates(&dir);
        assert_eq!(templates.len(), 2);
        assert_eq!(templates[0].id, "chef");
        assert_eq!(templates[0].scope, Some(PortScope::ExtensionUi));
        assert_eq!(templates[1].id, "chef.api");

        let spec = templates[1].resolve(Some(5300));
        assert_eq!(spec.args, vec!["--port", "5300"]);
        assert_eq!(spec.command, format!("{}/bin/chef-api", dir.display()));
        assert_eq!(spec.env["PORT"], "5300");
        assert_eq!(spec.env["HEARTH_PORT"], "5300");
        assert_eq!(spec.env["CHEF_MODE"], "prod");
        assert_eq!(spec.health.as_ref().unwrap().path, "/health");
    }

    #[test]
    fn scan_reads_marker_and_skips_broken_dirs() {
        let root = tempfile::tempdir().unwrap();
        let dir = write_ext(root.path(), "chef", CHEF);
        InstallMarker::write(&dir, "local", Some("0.3.1".into())).unwrap();
        write_ext(root.path(), "broken", "name = ");
        write_ext(root.path(), "renamed", "name = \"other\"\n");
        fs::create_dir_all(root.path().join("no-manifest")).unwrap();

        let installed = scan_installed(root.path()).unwrap();
        assert_eq!(installed.len(), 1);
        let chef = &installed[0];
        assert_eq!(chef.name, "chef");
        assert_eq!(chef.source.as_deref(), Some("local"));
        assert_eq!(chef.version.as_deref(), Some("0.3.1"));
        assert!(chef.has_ui && chef.has_backend);
    }

    #[test]
    fn scan_of_missing_dir_is_empty() {
        let root = tempfile::tempdir().unwrap();
        assert!(scan_installed(&root.path().join("nope")).unwrap().is_empty());
    }

    #[test]
    fn duplicate_service_names_are_rejected() {
        let manifest: ExtensionManifest = toml::from_str(
            r#"
name = "chef"
[[services]]
name = "api"
command = "a"
[[services]]
name = "api"
command = "b"
"#,
        )
        .unwrap();
        assert!(manifest.validate().is_err());
    }
}
