//! Turns caller input into the list of devices a job runs on.

use crate::core::{ConnectionDefaults, DeviceDescriptor, DeviceOptions};
use crate::error::{ExecuteError, RosterError};
use crate::roster::{Roster, TargetType, Targets};
use indexmap::IndexMap;
use serde::Deserialize;

/// A set of devices in any of the shapes a caller may supply.
///
/// Deserializes from YAML as a bare hostname, a list, or a mapping of id to options.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum DeviceSet {
    /// One device, identified and reached by this hostname.
    Host(String),

    /// Devices listed in order, each a hostname or a mapping of options.
    List(Vec<DeviceEntry>),

    /// Maps each device id to its options.
    Map(IndexMap<String, DeviceOptions>),
}

/// One item of a [DeviceSet::List].
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum DeviceEntry {
    Host(String),

    /// Identified by its `id` (or `minion_id`), falling back to its `hostname`.
    Options(DeviceOptions),
}

impl From<&str> for DeviceSet {
    fn from(value: &str) -> Self {
        DeviceSet::Host(value.to_string())
    }
}

impl From<Vec<&str>> for DeviceSet {
    fn from(value: Vec<&str>) -> Self {
        DeviceSet::List(
            value
                .into_iter()
                .map(|h| DeviceEntry::Host(h.to_string()))
                .collect(),
        )
    }
}

impl From<Targets> for DeviceSet {
    fn from(value: Targets) -> Self {
        DeviceSet::Map(value)
    }
}

/// Merges every device in `set` over `defaults`, preserving the caller's order.
///
/// # Returns
///
/// The resolved devices, or [ExecuteError::InvalidDeviceSet] if a device in the set can't be
/// identified. Duplicate ids are left for [Job::new](crate::core::Job::new) to reject.
pub fn resolve(
    set: DeviceSet,
    defaults: &ConnectionDefaults,
) -> Result<Vec<DeviceDescriptor>, ExecuteError> {
    match set {
        DeviceSet::Host(host) => Ok(vec![from_host(host, defaults)]),
        DeviceSet::List(entries) => entries
            .into_iter()
            .map(|entry| match entry {
                DeviceEntry::Host(host) => Ok(from_host(host, defaults)),
                DeviceEntry::Options(options) => {
                    let id = options
                        .id
                        .clone()
                        .or_else(|| options.hostname.clone())
                        .ok_or_else(|| {
                            ExecuteError::InvalidDeviceSet(
                                "a device needs an `id`, `minion_id`, or `hostname`".to_string(),
                            )
                        })?;
                    Ok(DeviceDescriptor::from_options(id, options, defaults))
                }
            })
            .collect(),
        DeviceSet::Map(map) => Ok(map
            .into_iter()
            .map(|(id, options)| DeviceDescriptor::from_options(id, options, defaults))
            .collect()),
    }
}

fn from_host(host: String, defaults: &ConnectionDefaults) -> DeviceDescriptor {
    DeviceDescriptor::from_options(host, DeviceOptions::default(), defaults)
}

/// The outcome of expanding a target expression through a roster.
#[derive(Clone, Debug, PartialEq)]
pub enum Resolution {
    /// At least one device matched.
    Matched(Targets),

    /// The expression was valid but selected nothing.
    NoMatch,
}

/// Asks `roster` which devices `tgt` selects.
pub fn resolve_roster(
    roster: &dyn Roster,
    tgt: &str,
    tgt_type: TargetType,
) -> Result<Resolution, RosterError> {
    let targets = roster.targets(tgt, tgt_type)?;
    if targets.is_empty() {
        Ok(Resolution::NoMatch)
    } else {
        Ok(Resolution::Matched(targets))
    }
}
