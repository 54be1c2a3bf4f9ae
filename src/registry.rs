//! Maps function names to the code that runs them on a device.
//!
//! A job names its function as a string, e.g. `net.cli`. The [Registry] in the job's
//! [Context](crate::Context) turns that name into a [DeviceFunction], which a device session
//! invokes once per device with an open [Connection] and the device's auxiliary data.
//!
//! [Registry::with_builtins] provides a small standard library:
//!
//! | Name | Returns |
//! |---|---|
//! | `test.ping` | `true` once the device is connected |
//! | `net.call` | the result of the driver method named by the first positional argument |
//! | `net.cli` | the result of the driver's `cli` method |
//! | `grains.items` | every grain |
//! | `grains.get` | one grain, by `:`-delimited path |
//! | `grains.setval` | sets one grain and returns `{key: value}` |
//! | `pillar.items` | all pillar data |
//! | `pillar.get` | one pillar value, by `:`-delimited path |

use crate::core::{DeviceDescriptor, Mapping, Value};
use crate::net::Connection;
use anyhow::{anyhow, bail};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// The delimiter between keys in a nested lookup path, e.g. `interfaces:eth0:mtu`.
pub const PATH_DELIMITER: char = ':';

/// Everything a [DeviceFunction] may touch while it runs on one device.
pub struct Invocation<'a> {
    pub device: &'a DeviceDescriptor,
    pub connection: &'a mut dyn Connection,

    /// The device's grains. Changes are written back to the cache if the job asks for it.
    pub grains: &'a mut Mapping,

    /// The device's pillar data. Changes are written back to the cache if the job asks for it.
    pub pillar: &'a mut Mapping,
    pub args: &'a [Value],
    pub kwargs: &'a Mapping,
}

/// A callable that can run on a device.
#[async_trait]
pub trait DeviceFunction: Send + Sync {
    async fn call(&self, invocation: Invocation<'_>) -> anyhow::Result<Value>;
}

/// A named set of [DeviceFunction]s. Built explicitly; nothing registers itself.
#[derive(Clone, Default)]
pub struct Registry {
    functions: HashMap<String, Arc<dyn DeviceFunction>>,
}

impl Registry {
    /// Returns an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a registry holding the built-in functions listed in the [module
    /// documentation](self).
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry
            .register("test.ping", Ping)
            .register("net.call", NetCall)
            .register("net.cli", NetCli)
            .register("grains.items", Items(Aux::Grains))
            .register("grains.get", Get(Aux::Grains))
            .register("grains.setval", SetVal)
            .register("pillar.items", Items(Aux::Pillar))
            .register("pillar.get", Get(Aux::Pillar));
        registry
    }

    /// Registers `function` under `name`, replacing any function already registered there.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        function: impl DeviceFunction + 'static,
    ) -> &mut Self {
        self.functions.insert(name.into(), Arc::new(function));
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn DeviceFunction>> {
        self.functions.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.names()).finish()
    }
}

/// Looks up a `:`-delimited `path` in `data`.
pub fn traverse<'a>(data: &'a Mapping, path: &str) -> Option<&'a Value> {
    let mut keys = path.split(PATH_DELIMITER);
    let mut current = data.get(keys.next()?)?;
    for key in keys {
        current = current.as_mapping()?.get(key)?;
    }
    Some(current)
}

/// Returns positional argument `index` as a string.
fn str_arg<'a>(args: &'a [Value], index: usize, name: &str) -> anyhow::Result<&'a str> {
    match args.get(index) {
        Some(Value::String(s)) => Ok(s),
        Some(other) => bail!("{name} must be a string, not {other:?}"),
        None => Err(anyhow!("missing required argument: {name}")),
    }
}

struct Ping;

#[async_trait]
impl DeviceFunction for Ping {
    async fn call(&self, _invocation: Invocation<'_>) -> anyhow::Result<Value> {
        Ok(true.into())
    }
}

struct NetCall;

#[async_trait]
impl DeviceFunction for NetCall {
    async fn call(&self, invocation: Invocation<'_>) -> anyhow::Result<Value> {
        let method = str_arg(invocation.args, 0, "method")?;
        invocation
            .connection
            .invoke(method, &invocation.args[1..], invocation.kwargs)
            .await
    }
}

struct NetCli;

#[async_trait]
impl DeviceFunction for NetCli {
    async fn call(&self, invocation: Invocation<'_>) -> anyhow::Result<Value> {
        if invocation.args.is_empty() {
            bail!("net.cli requires at least one command");
        }
        invocation
            .connection
            .invoke("cli", invocation.args, invocation.kwargs)
            .await
    }
}

#[derive(Clone, Copy)]
enum Aux {
    Grains,
    Pillar,
}

impl Aux {
    fn data<'a>(self, invocation: &'a Invocation<'_>) -> &'a Mapping {
        match self {
            Aux::Grains => &*invocation.grains,
            Aux::Pillar => &*invocation.pillar,
        }
    }
}

struct Items(Aux);

#[async_trait]
impl DeviceFunction for Items {
    async fn call(&self, invocation: Invocation<'_>) -> anyhow::Result<Value> {
        Ok(Value::Mapping(self.0.data(&invocation).clone()))
    }
}

/// Returns the value at a path, or the `default` keyword argument (an empty string if unset).
struct Get(Aux);

#[async_trait]
impl DeviceFunction for Get {
    async fn call(&self, invocation: Invocation<'_>) -> anyhow::Result<Value> {
        let path = str_arg(invocation.args, 0, "key")?;
        let default = invocation
            .args
            .get(1)
            .or_else(|| invocation.kwargs.get("default"))
            .cloned()
            .unwrap_or_else(|| Value::String(String::new()));

        Ok(traverse(self.0.data(&invocation), path)
            .cloned()
            .unwrap_or(default))
    }
}

struct SetVal;

#[async_trait]
impl DeviceFunction for SetVal {
    async fn call(&self, invocation: Invocation<'_>) -> anyhow::Result<Value> {
        let key = str_arg(invocation.args, 0, "key")?;
        let value = invocation
            .args
            .get(1)
            .or_else(|| invocation.kwargs.get("val"))
            .cloned()
            .ok_or_else(|| anyhow!("missing required argument: val"))?;

        invocation.grains.insert(key.into(), value.clone());

        let mut ret = Mapping::new();
        ret.insert(key.into(), value);
        Ok(Value::Mapping(ret))
    }
}
