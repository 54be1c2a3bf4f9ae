//! Types for describing the devices a job connects to.

use crate::core::{Mapping, Value};
#[cfg(doc)]
use crate::resolve;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// The connection timeout applied when neither the device nor the job sets one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Per-device connection options, exactly as a caller or roster supplied them.
///
/// Every field is optional. Unset fields are filled from [ConnectionDefaults] when the options
/// are turned into a [DeviceDescriptor].
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DeviceOptions {
    /// The identifier results and events are keyed by. Also accepted as `minion_id`.
    #[serde(alias = "minion_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// The address or DNS name used to reach the device.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    /// The vendor tag, e.g. `eos`, `junos`, or `ios`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Also accepted as `passwd`.
    #[serde(alias = "passwd", skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Timeout in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,

    /// Driver-specific options. Merged key by key over the job's optional arguments.
    #[serde(skip_serializing_if = "Mapping::is_empty")]
    pub optional_args: Mapping,

    /// The library that provides the driver, for device-abstraction layers that support more
    /// than one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    #[serde(flatten)]
    pub session: SessionOverrides,

    /// Every other key. Passed to the function as a keyword argument, over the job's own.
    #[serde(flatten)]
    pub kwargs: Mapping,
}

/// Per-device overrides of a job's session settings. Unset fields keep the job's value.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub with_grains: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preload_grains: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub with_pillar: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preload_pillar: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_grains: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_pillar: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_cached_grains: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_cached_pillar: Option<bool>,

    /// Merged key by key over the job's default grains.
    #[serde(skip_serializing_if = "Mapping::is_empty")]
    pub default_grains: Mapping,

    /// Merged key by key over the job's default pillar.
    #[serde(skip_serializing_if = "Mapping::is_empty")]
    pub default_pillar: Mapping,

    /// Replaces the job's positional arguments.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<Value>>,
}

impl SessionOverrides {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Job-wide connection defaults, applied to every device that doesn't set its own value.
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectionDefaults {
    pub driver: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout: Duration,
    pub optional_args: Mapping,
    pub provider: Option<String>,
}

impl Default for ConnectionDefaults {
    fn default() -> Self {
        ConnectionDefaults {
            driver: None,
            username: None,
            password: None,
            timeout: DEFAULT_TIMEOUT,
            optional_args: Mapping::new(),
            provider: None,
        }
    }
}

/// One device's fully merged connection parameters.
///
/// Produced by [resolve] from caller input or roster output. A [DeviceDescriptor] is immutable
/// once its job has been scheduled.
#[derive(Clone, PartialEq)]
pub struct DeviceDescriptor {
    /// Unique within a job. Keys the device's entry in the result set and its events.
    pub id: String,
    pub hostname: String,
    pub driver: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,

    /// Bounds the connection attempt and the function call, each separately.
    pub timeout: Duration,
    pub optional_args: Mapping,
    pub provider: Option<String>,

    /// Applied over the job's settings for this device only.
    pub session: SessionOverrides,

    /// Keyword arguments applied over the job's for this device only.
    pub kwargs: Mapping,
}

impl DeviceDescriptor {
    /// Merges `options` over `defaults`. Values set in `options` win.
    ///
    /// The hostname falls back to `id` when `options` doesn't name one.
    pub fn from_options(
        id: impl Into<String>,
        options: DeviceOptions,
        defaults: &ConnectionDefaults,
    ) -> Self {
        let id = id.into();

        let mut optional_args = defaults.optional_args.clone();
        for (key, value) in options.optional_args {
            optional_args.insert(key, value);
        }

        DeviceDescriptor {
            hostname: options.hostname.unwrap_or_else(|| id.clone()),
            id,
            driver: options.driver.or_else(|| defaults.driver.clone()),
            username: options.username.or_else(|| defaults.username.clone()),
            password: options.password.or_else(|| defaults.password.clone()),
            timeout: options
                .timeout
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            optional_args,
            provider: options.provider.or_else(|| defaults.provider.clone()),
            session: options.session,
            kwargs: options.kwargs,
        }
    }
}

// Hand-written so that passwords never reach a log line.
impl fmt::Debug for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceDescriptor")
            .field("id", &self.id)
            .field("hostname", &self.hostname)
            .field("driver", &self.driver)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("timeout", &self.timeout)
            .field("optional_args", &self.optional_args)
            .field("provider", &self.provider)
            .field("session", &self.session)
            .field("kwargs", &self.kwargs)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> ConnectionDefaults {
        let mut optional_args = Mapping::new();
        optional_args.insert("port".into(), 22.into());
        optional_args.insert("transport".into(), "ssh".into());

        ConnectionDefaults {
            driver: Some("junos".to_string()),
            username: Some("netops".to_string()),
            password: Some("s3cret".to_string()),
            timeout: Duration::from_secs(30),
            optional_args,
            provider: None,
        }
    }

    mod from_options {
        use super::*;

        #[test]
        fn inherits_unset_fields() {
            let options = DeviceOptions {
                hostname: Some("10.0.0.1".to_string()),
                ..Default::default()
            };

            let device = DeviceDescriptor::from_options("a", options, &defaults());

            assert_eq!("a", device.id);
            assert_eq!("10.0.0.1", device.hostname);
            assert_eq!(Some("junos".to_string()), device.driver);
            assert_eq!(Some("netops".to_string()), device.username);
            assert_eq!(Some("s3cret".to_string()), device.password);
            assert_eq!(Duration::from_secs(30), device.timeout);
        }

        #[test]
        fn carries_session_overrides() {
            let mut kwargs = Mapping::new();
            kwargs.insert("port".into(), 830.into());
            let options = DeviceOptions {
                session: SessionOverrides {
                    with_pillar: Some(true),
                    ..Default::default()
                },
                kwargs: kwargs.clone(),
                ..Default::default()
            };

            let device = DeviceDescriptor::from_options("e", options, &defaults());

            assert_eq!(Some(true), device.session.with_pillar);
            assert_eq!(kwargs, device.kwargs);
        }

        #[test]
        fn device_values_win() {
            let options = DeviceOptions {
                driver: Some("eos".to_string()),
                username: Some("root".to_string()),
                timeout: Some(5),
                ..Default::default()
            };

            let device = DeviceDescriptor::from_options("b", options, &defaults());

            assert_eq!(Some("eos".to_string()), device.driver);
            assert_eq!(Some("root".to_string()), device.username);
            assert_eq!(Duration::from_secs(5), device.timeout);
        }

        #[test]
        fn hostname_falls_back_to_id() {
            let device = DeviceDescriptor::from_options("edge1", Default::default(), &defaults());
            assert_eq!("edge1", device.hostname);
        }

        #[test]
        fn merges_optional_args_key_by_key() {
            let mut optional_args = Mapping::new();
            optional_args.insert("port".into(), 830.into());
            let options = DeviceOptions {
                optional_args,
                ..Default::default()
            };

            let device = DeviceDescriptor::from_options("c", options, &defaults());

            assert_eq!(Some(&Value::from(830)), device.optional_args.get("port"));
            assert_eq!(
                Some(&Value::from("ssh")),
                device.optional_args.get("transport"),
            );
        }
    }

    mod deserialize {
        use super::*;

        #[test]
        fn accepts_aliases() {
            let yaml = "minion_id: core1\nhostname: 10.1.1.1\npasswd: pw\n";
            let options: DeviceOptions = serde_yaml::from_str(yaml).unwrap();
            assert_eq!(Some("core1".to_string()), options.id);
            assert_eq!(Some("pw".to_string()), options.password);
        }

        #[test]
        fn keeps_session_overrides_and_other_keys() {
            let yaml = "\
hostname: 192.0.2.9
with_grains: true
default_grains:
  role: spine
port: 830
";
            let options: DeviceOptions = serde_yaml::from_str(yaml).unwrap();

            assert_eq!(Some("192.0.2.9".to_string()), options.hostname);
            assert_eq!(Some(true), options.session.with_grains);
            assert_eq!(None, options.session.preload_grains);
            assert_eq!(
                Some(&Value::from("spine")),
                options.session.default_grains.get("role"),
            );
            assert_eq!(1, options.kwargs.len());
            assert_eq!(Some(&Value::from(830)), options.kwargs.get("port"));
        }

        #[test]
        fn serializes_other_keys_inline() {
            let yaml = "hostname: r1\nport: 830\n";
            let options: DeviceOptions = serde_yaml::from_str(yaml).unwrap();
            assert_eq!(yaml, serde_yaml::to_string(&options).unwrap());
        }
    }

    #[test]
    fn debug_redacts_password() {
        let device = DeviceDescriptor::from_options("d", Default::default(), &defaults());
        let debug = format!("{device:?}");
        assert!(!debug.contains("s3cret"));
        assert!(debug.contains("<redacted>"));
    }
}
