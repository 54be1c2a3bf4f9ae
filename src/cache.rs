//! Stores auxiliary data that outlives a job.
//!
//! Data is organized into banks, each holding named fields. A device's auxiliary data lives in
//! the bank returned by [device_key], in the fields [GRAINS] and [PILLAR].
//!
//! Each device session writes only its own device's bank, so sessions within a job never contend.
//! Overlapping jobs that target the same device may overwrite each other's writes; the last
//! write wins.

use crate::core::{Mapping, Value};
use anyhow::{anyhow, bail, Context};
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

/// The field holding a device's grains.
pub const GRAINS: &str = "grains";

/// The field holding a device's pillar data.
pub const PILLAR: &str = "pillar";

/// Returns the bank that holds auxiliary data for device `id`.
pub fn device_key(id: &str) -> String {
    format!("minions/{id}/data")
}

/// A key-value store for structured data.
pub trait Cache: Send + Sync {
    /// Returns every field stored in bank `key`, or [None] if the bank doesn't exist.
    fn fetch(&self, key: &str) -> anyhow::Result<Option<Mapping>>;

    /// Stores `value` as `field` in bank `key`, creating the bank if needed.
    fn store(&self, key: &str, field: &str, value: Value) -> anyhow::Result<()>;
}

/// A [Cache] that lives only as long as the process.
#[derive(Debug, Default)]
pub struct MemoryCache {
    banks: Mutex<HashMap<String, Mapping>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Cache for MemoryCache {
    fn fetch(&self, key: &str) -> anyhow::Result<Option<Mapping>> {
        let banks = self
            .banks
            .lock()
            .map_err(|_| anyhow!("memory cache lock poisoned"))?;
        Ok(banks.get(key).cloned())
    }

    fn store(&self, key: &str, field: &str, value: Value) -> anyhow::Result<()> {
        let mut banks = self
            .banks
            .lock()
            .map_err(|_| anyhow!("memory cache lock poisoned"))?;
        banks
            .entry(key.to_string())
            .or_default()
            .insert(field.into(), value);
        Ok(())
    }
}

/// A [Cache] that stores each bank as a YAML file under a directory.
///
/// Bank `minions/r1/data` lives at `<directory>/minions/r1/data.yaml`.
#[derive(Clone, Debug)]
pub struct FileCache {
    directory: PathBuf,
}

impl FileCache {
    /// Create a new [FileCache] that stores its files in `directory`.
    ///
    /// Attempts to create `directory` if it does not exist.
    pub fn new(directory: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let directory = directory.into();

        match fs::metadata(&directory) {
            Ok(md) if !md.is_dir() => {
                bail!("not a directory: {}", directory.display());
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                fs::create_dir_all(&directory).with_context(|| {
                    format!("could not create cache directory {}", directory.display())
                })?;
            }
            Err(err) => return Err(err.into()),
            _ => {}
        }

        Ok(Self { directory })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Maps a bank key to its file, refusing keys that would escape the cache directory.
    fn path(&self, key: &str) -> anyhow::Result<PathBuf> {
        let relative = Path::new(key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if key.is_empty() || escapes {
            bail!("invalid cache key: {key:?}");
        }

        let mut path = self.directory.join(relative);
        path.set_extension("yaml");
        Ok(path)
    }
}

impl Cache for FileCache {
    fn fetch(&self, key: &str) -> anyhow::Result<Option<Mapping>> {
        let path = self.path(key)?;
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("could not read {}", path.display()))
            }
        };

        let bank = serde_yaml::from_str(&contents)
            .with_context(|| format!("could not parse {}", path.display()))?;
        Ok(Some(bank))
    }

    fn store(&self, key: &str, field: &str, value: Value) -> anyhow::Result<()> {
        let path = self.path(key)?;
        let mut bank = self.fetch(key)?.unwrap_or_default();
        bank.insert(field.into(), value);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("could not create {}", parent.display()))?;
        }
        let contents = serde_yaml::to_string(&bank)?;
        fs::write(&path, contents).with_context(|| format!("could not write {}", path.display()))
    }
}
