//! Loads netrun's configuration.
//!
//! Configuration lives in `config.yaml` under [config_dir]. Every key is optional:
//!
//! ```yaml
//! roster: lab                  # the roster used when a call doesn't name one
//! roster_file: /etc/netrun/roster.yaml
//! nodegroups:
//!   backbone: [core*]
//! batch_size: 10
//! timeout: 60                  # seconds
//! driver: junos
//! username: netops
//! optional_args:
//!   port: 22
//! events: true
//! cache_dir: /var/cache/netrun
//! pillar:
//!   ntp_servers: [192.0.2.123]
//! ```

use crate::core::job::DEFAULT_BATCH_SIZE;
use crate::core::{ConnectionDefaults, JobOptions, Mapping};
use crate::roster::{FileRoster, Nodegroup};
use anyhow::Context;
use indexmap::IndexMap;
use serde::Deserialize;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The name of the configuration file within [config_dir].
pub const CONFIG_FILE: &str = "config.yaml";

/// Returns a [PathBuf] to the directory where netrun's configuration should live.
///
/// When compiled for testing, this returns `CARGO_MANIFEST_DIR` plus `resources/etc/netrun`.
/// Otherwise, it returns `/etc/netrun`.
pub fn config_dir() -> PathBuf {
    // Omit the leading slash so that PathBuf::push appends instead of replacing.
    const CONFIG_DIR: &str = "etc/netrun";

    let mut path = PathBuf::new();

    #[cfg(test)]
    {
        path.push(env!("CARGO_MANIFEST_DIR"));
        path.push("resources");
    }
    #[cfg(not(test))]
    path.push("/");

    path.push(CONFIG_DIR);
    path
}

/// netrun's configuration file, deserialized.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The name of the roster used when a call doesn't name one.
    pub roster: Option<String>,

    /// A YAML roster file. Registered under [Self::roster], or `file` if that's unset.
    pub roster_file: Option<PathBuf>,
    pub nodegroups: IndexMap<String, Nodegroup>,
    pub batch_size: usize,

    /// Seconds.
    pub timeout: u64,
    pub driver: Option<String>,
    pub username: Option<String>,
    #[serde(alias = "passwd")]
    pub password: Option<String>,
    pub optional_args: Mapping,
    pub provider: Option<String>,
    pub events: bool,
    pub cache_dir: Option<PathBuf>,

    /// Pillar data shared by every device.
    pub pillar: Mapping,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            roster: None,
            roster_file: None,
            nodegroups: IndexMap::new(),
            batch_size: DEFAULT_BATCH_SIZE,
            timeout: 60,
            driver: None,
            username: None,
            password: None,
            optional_args: Mapping::new(),
            provider: None,
            events: true,
            cache_dir: None,
            pillar: Mapping::new(),
        }
    }
}

impl Config {
    /// Reads the configuration file at `path`.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("could not read config file {}", path.display()))?;
        let config: Option<Config> = serde_yaml::from_str(&contents)
            .with_context(|| format!("could not parse config file {}", path.display()))?;
        Ok(config.unwrap_or_default())
    }

    /// Reads `config.yaml` from [config_dir], or returns the defaults if it doesn't exist.
    pub fn load_default() -> anyhow::Result<Self> {
        let path = config_dir().join(CONFIG_FILE);
        match fs::metadata(&path) {
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Self::default()),
            _ => Self::load(path),
        }
    }

    pub fn connection_defaults(&self) -> ConnectionDefaults {
        ConnectionDefaults {
            driver: self.driver.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            timeout: Duration::from_secs(self.timeout),
            optional_args: self.optional_args.clone(),
            provider: self.provider.clone(),
        }
    }

    /// Returns job options seeded from this configuration.
    pub fn job_options(&self) -> JobOptions {
        JobOptions {
            connection: self.connection_defaults(),
            batch_size: self.batch_size,
            events: self.events,
            ..Default::default()
        }
    }

    /// The directory [FileCache](crate::cache::FileCache) stores data in: [Self::cache_dir] if
    /// set, otherwise `.cache/netrun` in the user's home directory.
    pub fn cache_dir(&self) -> anyhow::Result<PathBuf> {
        if let Some(ref dir) = self.cache_dir {
            return Ok(dir.clone());
        }
        let mut dir = home::home_dir().context("could not determine home directory")?;
        dir.push(".cache");
        dir.push("netrun");
        Ok(dir)
    }

    /// The name [Self::roster_file] is registered under.
    pub fn file_roster_name(&self) -> &str {
        self.roster.as_deref().unwrap_or("file")
    }

    /// Loads [Self::roster_file] with [Self::nodegroups], if a roster file is configured.
    ///
    /// A relative path is resolved against [config_dir].
    pub fn file_roster(&self) -> anyhow::Result<Option<FileRoster>> {
        let Some(ref path) = self.roster_file else {
            return Ok(None);
        };
        let path = config_dir().join(path);
        let nodegroups = self
            .nodegroups
            .iter()
            .map(|(name, group)| (name.clone(), group.patterns()))
            .collect();
        Ok(Some(FileRoster::load(path)?.with_nodegroups(nodegroups)))
    }
}
