//! Bundles everything a job needs from its surroundings.

use crate::auxiliary::{AuxSource, DefaultAux};
use crate::cache::{Cache, MemoryCache};
use crate::config::Config;
use crate::core::{DeviceDescriptor, Mapping, Value};
use crate::events::EventBus;
use crate::net::{self, Driver};
use crate::registry::Registry;
use crate::roster::Roster;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// The collaborators a job runs against. Cheap to clone; every field is shared.
///
/// Built once by the caller and passed into [execute](crate::execute) and
/// [execute_on_device_set](crate::execute_on_device_set). Nothing in netrun reaches for global
/// state.
#[derive(Clone)]
pub struct Context {
    pub config: Arc<Config>,
    pub driver: Arc<dyn Driver>,
    pub registry: Arc<Registry>,
    pub cache: Arc<dyn Cache>,

    /// [None] disables events regardless of what a job asks for.
    pub events: Option<Arc<dyn EventBus>>,
    pub rosters: HashMap<String, Arc<dyn Roster>>,
    pub aux: Arc<dyn AuxSource>,
}

impl Context {
    /// Returns a context with the built-in functions, an in-memory cache, no event bus, and no
    /// rosters.
    pub fn new(config: Config, driver: impl Driver + 'static) -> Self {
        let aux = DefaultAux::new(config.pillar.clone());
        Context {
            config: Arc::new(config),
            driver: Arc::new(driver),
            registry: Arc::new(Registry::with_builtins()),
            cache: Arc::new(MemoryCache::new()),
            events: None,
            rosters: HashMap::new(),
            aux: Arc::new(aux),
        }
    }

    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn with_cache(mut self, cache: impl Cache + 'static) -> Self {
        self.cache = Arc::new(cache);
        self
    }

    pub fn with_events(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.events = Some(bus);
        self
    }

    /// Registers `roster` under `name`, replacing any roster already registered there.
    pub fn with_roster(mut self, name: impl Into<String>, roster: impl Roster + 'static) -> Self {
        self.rosters.insert(name.into(), Arc::new(roster));
        self
    }

    pub fn with_aux(mut self, aux: impl AuxSource + 'static) -> Self {
        self.aux = Arc::new(aux);
        self
    }

    /// Returns the roster registered under `name`.
    pub fn roster(&self, name: &str) -> Option<Arc<dyn Roster>> {
        self.rosters.get(name).cloned()
    }

    /// Opens a connection to `device`, invokes one driver method, and closes the connection.
    pub async fn call(
        &self,
        device: &DeviceDescriptor,
        method: &str,
        args: &[Value],
        kwargs: &Mapping,
    ) -> anyhow::Result<Value> {
        net::call(self.driver.as_ref(), device, method, args, kwargs).await
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut rosters: Vec<_> = self.rosters.keys().collect();
        rosters.sort_unstable();
        f.debug_struct("Context")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("events", &self.events.is_some())
            .field("rosters", &rosters)
            .finish_non_exhaustive()
    }
}
