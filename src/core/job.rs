//! Types for representing one fan-out execution request.

use crate::core::device::{ConnectionDefaults, DeviceDescriptor};
use crate::core::{Mapping, Value};
use crate::error::ExecuteError;
use chrono::Utc;
use std::borrow::Cow;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// The batch size used when the caller doesn't choose one.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// The keyword-argument prefix reserved for the caller's own bookkeeping.
///
/// Keys with this prefix are stripped before arguments are forwarded to a function.
pub const RESERVED_KWARG_PREFIX: &str = "__";

/// Identifies one job. Correlates the events a job emits.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(String);

impl JobId {
    /// Generates a new identifier from the current UTC time, down to the microsecond.
    pub fn generate() -> Self {
        JobId(Utc::now().format("%Y%m%d%H%M%S%6f").to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        JobId(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        JobId(value.to_string())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Controls how a session gathers and caches a device's auxiliary data (grains and pillar).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AuxFlags {
    /// Collect grains after the connection opens.
    pub with_grains: bool,

    /// Collect grains before the connection opens.
    pub preload_grains: bool,

    /// Compile pillar data after the connection opens.
    pub with_pillar: bool,

    /// Compile pillar data before the connection opens.
    pub preload_pillar: bool,

    /// Store the device's grains in the cache once the session ends.
    pub cache_grains: bool,

    /// Store the device's pillar data in the cache once the session ends.
    pub cache_pillar: bool,

    /// Prefer cached grains over collecting them.
    pub use_cached_grains: bool,

    /// Prefer cached pillar data over compiling it.
    pub use_cached_pillar: bool,
}

impl Default for AuxFlags {
    fn default() -> Self {
        AuxFlags {
            with_grains: false,
            preload_grains: false,
            with_pillar: false,
            preload_pillar: false,
            cache_grains: false,
            cache_pillar: false,
            use_cached_grains: true,
            use_cached_pillar: true,
        }
    }
}

/// Everything a caller may tune about a job, before its devices are known.
#[derive(Clone, Debug, PartialEq)]
pub struct JobOptions {
    /// Applied to every device that doesn't set its own value.
    pub connection: ConnectionDefaults,
    pub aux: AuxFlags,
    pub default_grains: Mapping,
    pub default_pillar: Mapping,

    /// Positional arguments for the function.
    pub args: Vec<Value>,

    /// Keyword arguments for the function. Keys starting with [RESERVED_KWARG_PREFIX] are
    /// stripped before the call; `__pub_user` and `__pub_jid` are read first.
    pub kwargs: Mapping,

    /// The number of devices contacted concurrently. Must be at least 1.
    pub batch_size: usize,

    /// Return the complete result set instead of streaming results as they arrive.
    pub sync: bool,

    /// Publish progress events.
    pub events: bool,

    /// Reuse a job identifier instead of generating one.
    pub jid: Option<JobId>,

    /// The target expression, echoed into the job-started event.
    pub tgt: Option<String>,

    /// The target expression's type, echoed into the job-started event.
    pub tgt_type: Option<String>,

    /// The user on whose behalf the job runs, echoed into the job-started event.
    pub user: Option<String>,

    /// Return the matched targets instead of running anything.
    pub preview_target: bool,

    /// With [Self::preview_target], return each target's options as well as its id.
    pub target_details: bool,
}

impl Default for JobOptions {
    fn default() -> Self {
        JobOptions {
            connection: ConnectionDefaults::default(),
            aux: AuxFlags::default(),
            default_grains: Mapping::new(),
            default_pillar: Mapping::new(),
            args: Vec::new(),
            kwargs: Mapping::new(),
            batch_size: DEFAULT_BATCH_SIZE,
            sync: false,
            events: true,
            jid: None,
            tgt: None,
            tgt_type: None,
            user: None,
            preview_target: false,
            target_details: false,
        }
    }
}

/// The part of a [Job] that every device session shares.
#[derive(Clone, Debug, PartialEq)]
pub struct JobCall {
    /// The registry name of the function to run.
    pub function: String,
    pub args: Vec<Value>,

    /// Already cleaned of reserved keys.
    pub kwargs: Mapping,
    pub aux: AuxFlags,
    pub default_grains: Mapping,
    pub default_pillar: Mapping,
}

impl JobCall {
    /// Applies `device`'s overrides to this call. Borrows when the device overrides nothing.
    pub fn for_device(&self, device: &DeviceDescriptor) -> Cow<'_, JobCall> {
        let overrides = &device.session;
        if overrides.is_empty() && device.kwargs.is_empty() {
            return Cow::Borrowed(self);
        }

        let mut call = self.clone();
        let aux = &mut call.aux;
        override_flag(&mut aux.with_grains, overrides.with_grains);
        override_flag(&mut aux.preload_grains, overrides.preload_grains);
        override_flag(&mut aux.with_pillar, overrides.with_pillar);
        override_flag(&mut aux.preload_pillar, overrides.preload_pillar);
        override_flag(&mut aux.cache_grains, overrides.cache_grains);
        override_flag(&mut aux.cache_pillar, overrides.cache_pillar);
        override_flag(&mut aux.use_cached_grains, overrides.use_cached_grains);
        override_flag(&mut aux.use_cached_pillar, overrides.use_cached_pillar);

        for (key, value) in &overrides.default_grains {
            call.default_grains.insert(key.clone(), value.clone());
        }
        for (key, value) in &overrides.default_pillar {
            call.default_pillar.insert(key.clone(), value.clone());
        }
        if let Some(ref args) = overrides.args {
            call.args = args.clone();
        }
        for (key, value) in clean_kwargs(&device.kwargs) {
            call.kwargs.insert(key, value);
        }
        Cow::Owned(call)
    }
}

fn override_flag(flag: &mut bool, value: Option<bool>) {
    if let Some(value) = value {
        *flag = value;
    }
}

/// The unit of one fan-out execution. Owns the devices it targets.
#[derive(Debug)]
pub struct Job {
    pub jid: JobId,
    pub call: Arc<JobCall>,
    pub devices: Vec<DeviceDescriptor>,
    pub batch_size: NonZeroUsize,
    pub sync: bool,
    pub events: bool,
    pub tgt: Option<String>,
    pub tgt_type: Option<String>,
    pub user: Option<String>,
}

impl Job {
    /// Builds a [Job] that runs `function` on `devices`.
    ///
    /// Generates a job identifier unless `options` or its `__pub_jid` keyword argument carries
    /// one. Returns an error if the batch size is zero or a device identifier repeats.
    pub fn new(
        function: impl Into<String>,
        options: JobOptions,
        devices: Vec<DeviceDescriptor>,
    ) -> Result<Self, ExecuteError> {
        let batch_size =
            NonZeroUsize::new(options.batch_size).ok_or(ExecuteError::InvalidBatchSize)?;

        let mut seen = std::collections::HashSet::new();
        for device in &devices {
            if !seen.insert(device.id.as_str()) {
                return Err(ExecuteError::DuplicateDevice(device.id.clone()));
            }
        }

        let jid = options
            .jid
            .or_else(|| reserved_str(&options.kwargs, "__pub_jid").map(JobId::from))
            .unwrap_or_else(JobId::generate);
        let user = options
            .user
            .or_else(|| reserved_str(&options.kwargs, "__pub_user").map(str::to_string));

        let call = JobCall {
            function: function.into(),
            args: options.args,
            kwargs: clean_kwargs(&options.kwargs),
            aux: options.aux,
            default_grains: options.default_grains,
            default_pillar: options.default_pillar,
        };

        Ok(Job {
            jid,
            call: Arc::new(call),
            devices,
            batch_size,
            sync: options.sync,
            events: options.events,
            tgt: options.tgt,
            tgt_type: options.tgt_type,
            user,
        })
    }

    /// The identifiers of every device in the job, in scheduling order.
    pub fn device_ids(&self) -> Vec<String> {
        self.devices.iter().map(|d| d.id.clone()).collect()
    }

    /// The argument list as announced in events: the positional arguments followed, if there
    /// are any keyword arguments, by a mapping of them tagged with `__kwarg__: true`.
    pub fn event_args(&self) -> Vec<Value> {
        let mut args = self.call.args.clone();
        if !self.call.kwargs.is_empty() {
            let mut kwargs = Mapping::new();
            kwargs.insert("__kwarg__".into(), true.into());
            for (key, value) in &self.call.kwargs {
                kwargs.insert(key.clone(), value.clone());
            }
            args.push(Value::Mapping(kwargs));
        }
        args
    }
}

/// Returns a copy of `kwargs` without any key starting with [RESERVED_KWARG_PREFIX].
pub fn clean_kwargs(kwargs: &Mapping) -> Mapping {
    kwargs
        .iter()
        .filter(|(key, _)| !key.as_str().is_some_and(|k| k.starts_with(RESERVED_KWARG_PREFIX)))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

fn reserved_str<'m>(kwargs: &'m Mapping, key: &str) -> Option<&'m str> {
    kwargs.get(key).and_then(Value::as_str)
}
