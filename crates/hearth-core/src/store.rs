use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use fs2::FileExt;
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::MasterConfig;
use crate::util::{read_json_opt, write_json_atomic};

pub const MASTER_CONFIG_FILE: &str = "master_config.json";

/// Durable home of the applied baseline (`master_config.json`).
///
/// All writers go through [`ConfigStore::update`] or [`ConfigStore::save`], which
/// serialize on an in-process mutex plus an advisory lock file so a CLI and the
/// hub never interleave read-modify-write cycles.
pub struct ConfigStore {
    path: PathBuf,
    lock_path: PathBuf,
    guard: Mutex<()>,
}

struct StoreGuard<'a> {
    _inner: MutexGuard<'a, ()>,
    file: File,
}

impl Drop for StoreGuard<'_> {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock_path = path.with_extension("lock");
        Self {
            path,
            lock_path,
            guard: Mutex::new(()),
        }
    }

    pub fn in_dir(state_dir: &Path) -> Self {
        Self::new(state_dir.join(MASTER_CONFIG_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing file yields the empty default; anything unreadable is fatal.
    pub fn load(&self) -> Result<MasterConfig> {
        match read_json_opt::<MasterConfig>(&self.path)? {
            None => Ok(MasterConfig::default()),
            Some(cfg) => {
                cfg.validate()
                    .map_err(|err| Error::malformed(&self.path, err))?;
                Ok(cfg)
            }
        }
    }

    pub fn save(&self, cfg: &MasterConfig) -> Result<()> {
        let _lock = self.lock()?;
        self.write(cfg)
    }

    /// Locked read-modify-write. Nothing is written when `f` errors or leaves
    /// the document unchanged.
    pub fn update<R>(&self, f: impl FnOnce(&mut MasterConfig) -> Result<R>) -> Result<R> {
        let _lock = self.lock()?;
        let mut cfg = self.load()?;
        let before = cfg.clone();
        let out = f(&mut cfg)?;
        if cfg != before {
            self.write(&cfg)?;
        }
        Ok(out)
    }

    fn write(&self, cfg: &MasterConfig) -> Result<()> {
        cfg.validate()?;
        write_json_atomic(&self.path, cfg)?;
        debug!(
            target: "hearth::config",
            path = %self.path.display(),
            extensions = cfg.extensions.len(),
            "master config saved"
        );
        Ok(())
    }

    fn lock(&self) -> Result<StoreGuard<'_>> {
        let inner = self.guard.lock().unwrap_or_else(|poison| poison.into_inner());
        if let Some(parent) = self.lock_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)
            .map_err(|e| Error::io(&self.lock_path, e))?;
        file.lock_exclusive()
            .map_err(|e| Error::io(&self.lock_path, e))?;
        Ok(StoreGuard {
            _inner: inner,
            file,
        })
    }
}
