use std::path::{Path, PathBuf};

use hearth_core::{scan_installed, ExtensionManifest, InstallMarker, InstalledExtensionRecord};
use tracing::{info, warn};
use walkdir::WalkDir;

#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("source `{0}` not found")]
    SourceMissing(String),
    #[error("unsupported source `{0}`")]
    UnsupportedSource(String),
    #[error("git clone failed: {0}")]
    Git(String),
    #[error("invalid extension: {0}")]
    Manifest(String),
    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for InstallError {
    fn from(err: std::io::Error) -> Self {
        InstallError::Io(err.to_string())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceKind {
    /// `local`: a directory of the same name under the sources dir.
    Local(PathBuf),
    Path(PathBuf),
    Git(String),
}

pub fn classify_source(source: &str, name: &str, sources_dir: &Path) -> Result<SourceKind, InstallError> {
    let source = source.trim();
    if source.eq_ignore_ascii_case("local") {
        return Ok(SourceKind::Local(sources_dir.join(name)));
    }
    if let Some(url) = source.strip_prefix("git+") {
        return Ok(SourceKind::Git(url.to_string()));
    }
    if let Some(path) = source.strip_prefix("file://") {
        return Ok(SourceKind::Path(PathBuf::from(path)));
    }
    let is_url = source.starts_with("https://")
        || source.starts_with("http://")
        || source.starts_with("ssh://")
        || source.starts_with("git@");
    if is_url && source.ends_with(".git") {
        return Ok(SourceKind::Git(source.to_string()));
    }
    let path = Path::new(source);
    if path.is_absolute() {
        return Ok(SourceKind::Path(path.to_path_buf()));
    }
    Err(InstallError::UnsupportedSource(source.to_string()))
}

fn copy_tree(from: &Path, to: &Path) -> Result<(), InstallError> {
    for entry in WalkDir::new(from)
        .into_iter()
        .filter_entry(|e| e.file_name() != ".git")
    {
        let entry = entry.map_err(|e| InstallError::Io(e.to_string()))?;
        let rel = entry
            .path()
            .strip_prefix(from)
            .map_err(|e| InstallError::Io(e.to_string()))?;
        let dest = to.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&dest)?;
        } else if entry.file_type().is_file() {
            std::fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(())
}

/// Installs extensions into `extensions_dir/<name>`.
pub struct Installer {
    extensions_dir: PathBuf,
    sources_dir: PathBuf,
}

impl Installer {
    pub fn new(extensions_dir: PathBuf, sources_dir: PathBuf) -> Self {
        Self {
            extensions_dir,
            sources_dir,
        }
    }

    pub fn extensions_dir(&self) -> &Path {
        &self.extensions_dir
    }

    pub fn installed(&self) -> hearth_core::Result<Vec<InstalledExtensionRecord>> {
        scan_installed(&self.extensions_dir)
    }

    /// Fetch into a staging dir next to the target, check the manifest, then
    /// swap it into place. A failed install leaves any previous copy untouched.
    pub async fn install(&self, name: &str, source: &str) -> Result<InstalledExtensionRecord, InstallError> {
        hearth_core::model::validate_extension_name(name)
            .map_err(|e| InstallError::Manifest(e.to_string()))?;
        let kind = classify_source(source, name, &self.sources_dir)?;
        tokio::fs::create_dir_all(&self.extensions_dir).await?;
        let stage = tempfile::Builder::new()
            .prefix(&format!(".staging-{name}-"))
            .tempdir_in(&self.extensions_dir)?;
        let staged = stage.path().join("content");

        match &kind {
            SourceKind::Local(dir) | SourceKind::Path(dir) => {
                if !dir.is_dir() {
                    return Err(InstallError::SourceMissing(dir.display().to_string()));
                }
                let (from, to) = (dir.clone(), staged.clone());
                tokio::task::spawn_blocking(move || copy_tree(&from, &to))
                    .await
                    .map_err(|e| InstallError::Io(e.to_string()))??;
            }
            SourceKind::Git(url) => {
                let output = tokio::process::Command::new("git")
                    .args(["clone", "--depth", "1", url])
                    .arg(&staged)
                    .output()
                    .await
                    .map_err(|e| InstallError::Git(e.to_string()))?;
                if !output.status.success() {
                    return Err(InstallError::Git(
                        String::from_utf8_lossy(&output.stderr).trim().to_string(),
                    ));
                }
                let _ = tokio::fs::remove_dir_all(staged.join(".git")).await;
            }
        }

        let manifest =
            ExtensionManifest::load(&staged).map_err(|e| InstallError::Manifest(e.to_string()))?;
        if manifest.name != name {
            return Err(InstallError::Manifest(format!(
                "manifest declares `{}`, expected `{name}`",
                manifest.name
            )));
        }
        let marker = InstallMarker::write(&staged, source, manifest.version.clone())
            .map_err(|e| InstallError::Io(e.to_string()))?;

        let target = self.extensions_dir.join(name);
        let backup = stage.path().join("previous");
        let had_previous = target.exists();
        if had_previous {
            tokio::fs::rename(&target, &backup).await?;
        }
        if let Err(err) = tokio::fs::rename(&staged, &target).await {
            if had_previous {
                if let Err(restore) = tokio::fs::rename(&backup, &target).await {
                    warn!(target: "hearth::installer", extension = name, %restore, "failed to restore previous copy");
                }
            }
            return Err(err.into());
        }
        info!(
            target: "hearth::installer",
            extension = name,
            source,
            version = manifest.version.as_deref().unwrap_or("-"),
            "extension installed"
        );
        Ok(InstalledExtensionRecord::from_manifest(
            &target,
            &manifest,
            Some(marker),
        ))
    }

    /// Returns whether anything was on disk.
    pub async fn remove(&self, name: &str) -> Result<bool, InstallError> {
        hearth_core::model::validate_extension_name(name)
            .map_err(|e| InstallError::Manifest(e.to_string()))?;
        let target = self.extensions_dir.join(name);
        match tokio::fs::remove_dir_all(&target).await {
            Ok(()) => {
                info!(target: "hearth::installer", extension = name, "extension removed");
                Ok(true)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}
