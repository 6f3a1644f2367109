//! Run settings storage.
//!
//! Settings are read from the process environment with the env file layered
//! on top, so values written back through [`SettingsStore::submit`] win over
//! whatever the process was started with. Without an env file, submitted
//! settings are kept in memory for the following runs.

use crate::config::RunConfig;
use crate::error::{EtlError, EtlResult};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use tracing::{debug, info};

/// Source of [`RunConfig`] snapshots and target of settings write-back.
#[derive(Debug, Default)]
pub struct SettingsStore {
    env_file: Option<PathBuf>,
    staged: RwLock<Option<RunConfig>>,
    current: RwLock<Option<RunConfig>>,
}

impl SettingsStore {
    pub fn new(env_file: Option<PathBuf>) -> Self {
        Self {
            env_file,
            ..Self::default()
        }
    }

    pub fn env_file(&self) -> Option<&Path> {
        self.env_file.as_deref()
    }

    /// Key/value view: process environment overlaid with the env file.
    pub fn load_map(&self) -> EtlResult<HashMap<String, String>> {
        let mut map: HashMap<String, String> = std::env::vars().collect();
        if let Some(path) = self.env_file.as_deref().filter(|p| p.exists()) {
            let entries = dotenv::from_path_iter(path).map_err(|e| {
                EtlError::config(format!("Cannot read env file {}: {}", path.display(), e))
            })?;
            for entry in entries {
                let (key, value) = entry.map_err(|e| {
                    EtlError::config(format!("Invalid entry in {}: {}", path.display(), e))
                })?;
                map.insert(key, value);
            }
        }
        Ok(map)
    }

    /// Settings snapshot for the next run.
    ///
    /// Re-reads the environment and env file every time unless settings were
    /// submitted without an env file to persist them to.
    pub fn load(&self) -> EtlResult<RunConfig> {
        let staged = self
            .staged
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let config = match staged {
            Some(config) => config,
            None => RunConfig::from_map(&self.load_map()?)?,
        };
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(config.clone());
        Ok(config)
    }

    /// Settings of the latest loaded or submitted snapshot.
    pub fn current(&self) -> Option<RunConfig> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Validate and accept new settings for the next run.
    ///
    /// Validation errors are returned to the caller and leave the stored
    /// settings untouched.
    pub fn submit(&self, mut config: RunConfig) -> EtlResult<()> {
        if let Some(current) = self.current() {
            config.unmask_from(&current);
        }
        config.validate()?;

        match &self.env_file {
            Some(path) => {
                write_env_file(path, &config.to_env_pairs())?;
                info!(path = %path.display(), "Settings written to env file");
            }
            None => {
                *self.staged.write().unwrap_or_else(PoisonError::into_inner) =
                    Some(config.clone());
                info!("Settings staged for the next run");
            }
        }
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(config);
        Ok(())
    }
}

/// Rewrite `KEY=value` entries of an env file in place.
///
/// Existing keys are updated where they stand; comments, blank lines and
/// unrelated keys are preserved; new keys are appended.
pub fn write_env_file(path: &Path, pairs: &[(String, String)]) -> EtlResult<()> {
    let existing = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => {
            return Err(EtlError::config(format!(
                "Cannot read env file {}: {}",
                path.display(),
                e
            )));
        }
    };

    let values: HashMap<&str, &str> = pairs
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    let mut written: HashSet<&str> = HashSet::new();
    let mut lines: Vec<String> = Vec::new();

    for line in existing.lines() {
        match env_key(line).and_then(|key| values.get_key_value(key)) {
            Some((&key, &value)) => {
                if written.insert(key) {
                    lines.push(format_entry(key, value));
                }
            }
            None => lines.push(line.to_string()),
        }
    }
    for (key, value) in pairs {
        if written.insert(key.as_str()) {
            lines.push(format_entry(key, value));
        }
    }

    let mut content = lines.join("\n");
    content.push('\n');
    fs::write(path, content).map_err(|e| {
        EtlError::config(format!("Cannot write env file {}: {}", path.display(), e))
    })?;
    debug!(path = %path.display(), keys = pairs.len(), "Env file updated");
    Ok(())
}

fn env_key(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    if trimmed.starts_with('#') {
        return None;
    }
    let trimmed = trimmed.strip_prefix("export ").unwrap_or(trimmed);
    let (key, _) = trimmed.split_once('=')?;
    let key = key.trim();
    (!key.is_empty()).then_some(key)
}

fn format_entry(key: &str, value: &str) -> String {
    let plain = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "_-.:/@,*{}".contains(c));
    if plain {
        format!("{}={}", key, value)
    } else if !value.contains('\'') {
        // Single quotes are taken literally, with no `$` substitution.
        format!("{}='{}'", key, value)
    } else {
        format!(
            "{}=\"{}\"",
            key,
            value
                .replace('\\', "\\\\")
                .replace('"', "\\\"")
                .replace('$', "\\$")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_key_parsing() {
        assert_eq!(env_key("MAX_WORKERS=4"), Some("MAX_WORKERS"));
        assert_eq!(env_key("export SRC_DB_HOST = h"), Some("SRC_DB_HOST"));
        assert_eq!(env_key("# MAX_WORKERS=4"), None);
        assert_eq!(env_key(""), None);
        assert_eq!(env_key("=x"), None);
    }

    #[test]
    fn test_format_entry_quotes_when_needed() {
        assert_eq!(format_entry("A", "latest:backup_*"), "A=latest:backup_*");
        assert_eq!(format_entry("A", ""), "A=");
        assert_eq!(format_entry("A", "p ss\"w$x"), "A='p ss\"w$x'");
        assert_eq!(format_entry("A", "it's"), "A=\"it's\"");
    }

    #[test]
    fn test_write_env_file_preserves_unrelated_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        fs::write(&path, "# settings\nOTHER=keep\nMAX_WORKERS=4\n\n").unwrap();

        write_env_file(
            &path,
            &[
                ("MAX_WORKERS".to_string(), "8".to_string()),
                ("BATCH_SIZE".to_string(), "1000".to_string()),
            ],
        )
        .unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(
            content,
            "# settings\nOTHER=keep\nMAX_WORKERS=8\n\nBATCH_SIZE=1000\n"
        );
    }
}
