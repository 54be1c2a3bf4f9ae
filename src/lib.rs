//! Runs functions on many network devices at once.
//!
//! netrun takes a set of devices and the name of a function, connects to each device, runs the
//! function, and hands back every device's result. Devices are contacted a batch at a time, and a
//! failure on one device never stops the rest.
//!
//! # Program flow
//!
//! 1. The caller builds a [Context]: configuration, a [Driver](net::Driver) for reaching devices,
//!    a function [Registry](registry::Registry), and optionally rosters, a cache, and an event bus.
//!
//! 2. The caller invokes [execute] with a target expression, or [execute_on_device_set] with the
//!    devices themselves. Target expressions are expanded through a [Roster](roster::Roster).
//!
//! 3. The devices are merged over the job's connection defaults, then handed to the
//!    [BatchScheduler](scheduler::BatchScheduler), which runs one [session] per device.
//!
//! 4. Each session's outcome goes to the [collector], which either gathers them into a
//!    [ResultSet](core::ResultSet) or streams them to a [Sink](collector::Sink) as they arrive.
//!    If the job has events enabled, each outcome is also published on the context's
//!    [EventBus](events::EventBus).

pub mod auxiliary;
pub mod cache;
pub mod collector;
pub mod config;
pub mod context;
pub mod core;
pub mod error;
pub mod events;
pub mod execute;
pub mod net;
pub mod registry;
pub mod report;
pub mod resolve;
pub mod roster;
pub mod scheduler;
pub mod session;

#[doc(inline)]
pub use context::Context;

#[doc(inline)]
pub use error::{ExecuteError, RosterError};

#[doc(inline)]
pub use execute::{execute, execute_on_device_set, ExecuteOutcome, StreamHandle};
