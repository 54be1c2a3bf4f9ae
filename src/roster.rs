//! Expands target expressions into concrete devices.
//!
//! A [Roster] answers one question: which devices does a target expression select? The
//! expression's meaning depends on its [TargetType]:
//!
//! * `glob`: a shell-style pattern matched against device ids, e.g. `edge*` or `core[12]`.
//!   Supports `*`, `?`, `[abc]`, `[!abc]`, and `{a,b}` alternatives.
//! * `list`: ids separated by commas or whitespace. Ids the roster doesn't know are skipped.
//! * `pcre`: a regular expression matched against the start of each device id.
//! * `nodegroup`: the name of a group of glob patterns defined alongside the roster.
//!
//! [FileRoster] is the reference implementation.

use crate::core::DeviceOptions;
use crate::error::RosterError;
use anyhow::Context;
use indexmap::IndexMap;
use regex::Regex;
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

/// The devices a roster matched, keyed by id, in roster order.
pub type Targets = IndexMap<String, DeviceOptions>;

/// How to interpret a target expression.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TargetType {
    #[default]
    Glob,
    List,
    Pcre,
    Nodegroup,
}

impl TargetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetType::Glob => "glob",
            TargetType::List => "list",
            TargetType::Pcre => "pcre",
            TargetType::Nodegroup => "nodegroup",
        }
    }
}

impl FromStr for TargetType {
    type Err = RosterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "glob" => Ok(TargetType::Glob),
            "list" => Ok(TargetType::List),
            "pcre" => Ok(TargetType::Pcre),
            "nodegroup" => Ok(TargetType::Nodegroup),
            other => Err(RosterError::UnknownTargetType(other.to_string())),
        }
    }
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A source of devices that can be selected by expression.
pub trait Roster: Send + Sync {
    /// Returns every device matched by `tgt`. An empty result means nothing matched.
    fn targets(&self, tgt: &str, tgt_type: TargetType) -> Result<Targets, RosterError>;
}

/// A [Roster] backed by a YAML file mapping device ids to their options.
///
/// ```yaml
/// edge1:
///   hostname: 192.0.2.1
///   driver: junos
/// edge2:
///   hostname: 192.0.2.2
/// core1:
/// ```
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FileRoster {
    devices: Targets,
    nodegroups: IndexMap<String, Vec<String>>,
}

impl FileRoster {
    pub fn new(devices: Targets) -> Self {
        FileRoster {
            devices,
            nodegroups: IndexMap::new(),
        }
    }

    /// Reads a roster from the YAML file at `path`.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("could not read roster {}", path.display()))?;
        Self::from_yaml(&contents).with_context(|| format!("could not parse roster {}", path.display()))
    }

    /// Parses a roster from YAML. A device with no options may be given as a bare key.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let raw: Option<IndexMap<String, Option<DeviceOptions>>> = serde_yaml::from_str(yaml)?;
        let devices = raw
            .unwrap_or_default()
            .into_iter()
            .map(|(id, options)| (id, options.unwrap_or_default()))
            .collect();
        Ok(Self::new(devices))
    }

    /// Replaces the roster's nodegroups. Each nodegroup is a list of glob patterns.
    pub fn with_nodegroups(mut self, nodegroups: IndexMap<String, Vec<String>>) -> Self {
        self.nodegroups = nodegroups;
        self
    }

    /// Returns the devices whose ids match any of `patterns`.
    fn filter(&self, patterns: &[Regex]) -> Targets {
        self.devices
            .iter()
            .filter(|(id, _)| patterns.iter().any(|p| p.is_match(id)))
            .map(|(id, options)| (id.clone(), options.clone()))
            .collect()
    }
}

impl Roster for FileRoster {
    fn targets(&self, tgt: &str, tgt_type: TargetType) -> Result<Targets, RosterError> {
        let targets = match tgt_type {
            TargetType::Glob => self.filter(&[glob_to_regex(tgt)?]),
            TargetType::Pcre => {
                let pattern =
                    Regex::new(&format!("^(?:{tgt})")).map_err(|e| RosterError::invalid(tgt, e))?;
                self.filter(&[pattern])
            }
            TargetType::List => split_list(tgt)
                .filter_map(|id| {
                    self.devices
                        .get_key_value(id)
                        .map(|(id, options)| (id.clone(), options.clone()))
                })
                .collect(),
            TargetType::Nodegroup => {
                let patterns = self
                    .nodegroups
                    .get(tgt)
                    .ok_or_else(|| RosterError::UnknownNodegroup(tgt.to_string()))?
                    .iter()
                    .map(String::as_str)
                    .map(glob_to_regex)
                    .collect::<Result<Vec<_>, _>>()?;
                self.filter(&patterns)
            }
        };
        Ok(targets)
    }
}

/// Splits a list expression on commas and whitespace.
fn split_list(tgt: &str) -> impl Iterator<Item = &str> {
    tgt.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
}

/// Translates a shell-style glob into an anchored regular expression.
pub fn glob_to_regex(glob: &str) -> Result<Regex, RosterError> {
    let mut pattern = String::from("^");
    let mut chars = glob.chars().peekable();
    let mut brace_depth = 0usize;

    while let Some(c) = chars.next() {
        match c {
            '*' => pattern.push_str(".*"),
            '?' => pattern.push('.'),
            '[' => {
                pattern.push('[');
                if matches!(chars.peek(), Some('!' | '^')) {
                    chars.next();
                    pattern.push('^');
                }
                let mut closed = false;
                for c in chars.by_ref() {
                    match c {
                        ']' => {
                            closed = true;
                            break;
                        }
                        '\\' | '[' | '&' | '~' => {
                            pattern.push('\\');
                            pattern.push(c);
                        }
                        _ => pattern.push(c),
                    }
                }
                if !closed {
                    return Err(RosterError::invalid(glob, "unterminated character class"));
                }
                pattern.push(']');
            }
            '{' => {
                brace_depth += 1;
                pattern.push_str("(?:");
            }
            ',' if brace_depth > 0 => pattern.push('|'),
            '}' if brace_depth > 0 => {
                brace_depth -= 1;
                pattern.push(')');
            }
            _ => pattern.push_str(&regex::escape(c.encode_utf8(&mut [0; 4]))),
        }
    }

    if brace_depth > 0 {
        return Err(RosterError::invalid(glob, "unterminated alternative"));
    }
    pattern.push('$');
    Regex::new(&pattern).map_err(|e| RosterError::invalid(glob, e))
}

/// A nodegroup as written in configuration: a list of glob patterns, or one string of patterns
/// separated by commas or whitespace.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Nodegroup {
    Expression(String),
    Patterns(Vec<String>),
}

impl Nodegroup {
    pub fn patterns(&self) -> Vec<String> {
        match self {
            Nodegroup::Expression(s) => split_list(s).map(str::to_string).collect(),
            Nodegroup::Patterns(v) => v.clone(),
        }
    }
}
