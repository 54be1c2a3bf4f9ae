//! Provides the types that describe a fan-out job: the devices it targets, the function it runs,
//! and the outcomes it produces.

pub mod device;
pub mod job;
pub mod outcome;

#[doc(inline)]
pub use device::{ConnectionDefaults, DeviceDescriptor, DeviceOptions, SessionOverrides};

#[doc(inline)]
pub use job::{AuxFlags, Job, JobCall, JobId, JobOptions};

#[doc(inline)]
pub use outcome::{Failure, FailureKind, Outcome, ResultSet, SessionResult};

/// Generic structured data exchanged with devices, functions, caches, and event buses.
pub type Value = serde_yaml::Value;

/// A generic keyword-argument or auxiliary-data mapping.
pub type Mapping = serde_yaml::Mapping;
