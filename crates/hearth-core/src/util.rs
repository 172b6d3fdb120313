use std::fs;
use std::io::Write;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

/// `1/true/yes/on` and `0/false/no/off`, any casing.
pub fn parse_bool_flag(raw: &str) -> Option<bool> {
    const TRUTHY: [&str; 4] = ["1", "true", "yes", "on"];
    const FALSY: [&str; 4] = ["0", "false", "no", "off"];
    let value = raw.trim();
    if TRUTHY.iter().any(|t| value.eq_ignore_ascii_case(t)) {
        Some(true)
    } else if FALSY.iter().any(|f| value.eq_ignore_ascii_case(f)) {
        Some(false)
    } else {
        None
    }
}

pub fn env_bool(key: &str) -> Option<bool> {
    env_string(key).and_then(|raw| parse_bool_flag(&raw))
}

/// Read a non-empty, trimmed environment variable and parse it.
pub fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse().ok()
}

pub fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
}

/// Write bytes through a sibling temp file and rename into place so readers
/// never observe a partially written document.
pub fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = std::path::PathBuf::from(tmp);
    {
        let mut file = fs::File::create(&tmp).map_err(|e| Error::io(&tmp, e))?;
        file.write_all(bytes).map_err(|e| Error::io(&tmp, e))?;
        file.sync_all().map_err(|e| Error::io(&tmp, e))?;
    }
    match fs::rename(&tmp, path) {
        Ok(()) => Ok(()),
        Err(first) => {
            // Windows refuses to rename over an existing file.
            if path.exists() {
                let _ = fs::remove_file(path);
                if fs::rename(&tmp, path).is_ok() {
                    return Ok(());
                }
            }
            let _ = fs::remove_file(&tmp);
            Err(Error::io(path, first))
        }
    }
}

pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| Error::Validation(format!("serialize {}: {e}", path.display())))?;
    bytes.push(b'\n');
    write_bytes_atomic(path, &bytes)
}

/// `Ok(None)` when the file is absent; a present but unparseable file is `Malformed`.
pub fn read_json_opt<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(Error::io(path, err)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|err| Error::malformed(path, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn bool_flags_ignore_case_and_padding() {
        for raw in ["1", " On ", "TRUE", "yes"] {
            assert_eq!(parse_bool_flag(raw), Some(true), "{raw}");
        }
        for raw in ["0", "Off", "false", "NO"] {
            assert_eq!(parse_bool_flag(raw), Some(false), "{raw}");
        }
        assert_eq!(parse_bool_flag("enabled"), None);
        assert_eq!(parse_bool_flag(""), None);
    }

    #[test]
    #[serial]
    fn env_helpers_read_env() {
        std::env::set_var("HEARTH_TEST_BOOL", "on");
        assert_eq!(env_bool("HEARTH_TEST_BOOL"), Some(true));
        std::env::set_var("HEARTH_TEST_BOOL", " 42 ");
        assert_eq!(env_parse::<u64>("HEARTH_TEST_BOOL"), Some(42));
        std::env::set_var("HEARTH_TEST_BOOL", "  ");
        assert_eq!(env_string("HEARTH_TEST_BOOL"), None);
        std::env::remove_var("HEARTH_TEST_BOOL");
        assert_eq!(env_bool("HEARTH_TEST_BOOL"), None);
    }

    #[test]
    fn atomic_write_replaces_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("doc.json");
        write_json_atomic(&path, &serde_json::json!({"v": 1})).unwrap();
        write_json_atomic(&path, &serde_json::json!({"v": 2})).unwrap();
        let back: serde_json::Value = read_json_opt(&path).unwrap().unwrap();
        assert_eq!(back["v"], 2);
        assert!(!dir.path().join("nested").join("doc.json.tmp").exists());
    }

    #[test]
    fn read_json_opt_distinguishes_missing_and_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        assert!(read_json_opt::<serde_json::Value>(&path).unwrap().is_none());
        std::fs::write(&path, b"{not json").unwrap();
        assert!(matches!(
            read_json_opt::<serde_json::Value>(&path),
            Err(Error::Malformed { .. })
        ));
    }
}
