//! Runs one function on one device.
//!
//! A session is the whole life of one device within a job:
//!
//! 1. Seed the device's grains and pillar from the job's defaults, then from the cache or a
//!    pre-connect collection.
//! 2. Open a connection.
//! 3. Collect grains and pillar over the connection, if asked.
//! 4. Invoke the function.
//! 5. Close the connection.
//! 6. Write grains and pillar back to the cache, if asked.
//!
//! Nothing in a session returns an error. Every failure becomes the device's [Outcome], so one
//! device can never fail the rest of its batch. A function that panics is reported as
//! [FailureKind::Crashed], and its connection is still closed. Connecting and invoking are each
//! bounded by the device's timeout.

use crate::auxiliary::merge;
use crate::cache::{self, device_key};
use crate::context::Context;
use crate::core::{DeviceDescriptor, FailureKind, JobCall, Mapping, Outcome, Value};
use crate::net::Connection;
use crate::registry::Invocation;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::time;
use tracing::{debug, error, warn};

/// The possible results of a bounded step.
enum Bounded<T> {
    Done(T),
    Failed(anyhow::Error),
    TimedOut,
}

/// Runs `future` for at most `limit`.
async fn bounded<T>(limit: Duration, future: impl Future<Output = anyhow::Result<T>>) -> Bounded<T> {
    match time::timeout(limit, future).await {
        Ok(Ok(value)) => Bounded::Done(value),
        Ok(Err(error)) => Bounded::Failed(error),
        Err(_) => Bounded::TimedOut,
    }
}

/// Data restored from the cache, per field.
#[derive(Default)]
struct Cached {
    grains: Option<Mapping>,
    pillar: Option<Mapping>,
}

impl Cached {
    fn fetch(ctx: &Context, device: &DeviceDescriptor, call: &JobCall) -> Self {
        let aux = call.aux;
        if !aux.use_cached_grains && !aux.use_cached_pillar {
            return Self::default();
        }

        let bank = match ctx.cache.fetch(&device_key(&device.id)) {
            Ok(Some(bank)) => bank,
            Ok(None) => return Self::default(),
            Err(error) => {
                warn!(device = %device.id, "could not read cache: {error:#}");
                return Self::default();
            }
        };

        let field = |name: &str| {
            bank.get(name)
                .and_then(Value::as_mapping)
                .filter(|m| !m.is_empty())
                .cloned()
        };
        Cached {
            grains: field(cache::GRAINS).filter(|_| aux.use_cached_grains),
            pillar: field(cache::PILLAR).filter(|_| aux.use_cached_pillar),
        }
    }
}

/// Collected data goes under the defaults the caller supplied, so the caller's values win.
fn layer(defaults: &mut Mapping, collected: Mapping) {
    let mut data = collected;
    merge(&mut data, std::mem::take(defaults));
    *defaults = data;
}

/// Runs `call` on `device` and returns the device's outcome.
///
/// Settings the device overrides take precedence over the job's.
pub async fn run(ctx: &Context, device: &DeviceDescriptor, call: &JobCall) -> Outcome {
    let id = device.id.as_str();
    let call = call.for_device(device);
    let aux = call.aux;

    let mut grains = call.default_grains.clone();
    if let Some(ref driver) = device.driver {
        if !grains.contains_key("os") {
            grains.insert("os".into(), driver.clone().into());
        }
    }
    let mut pillar = call.default_pillar.clone();

    let cached = Cached::fetch(ctx, device, &call);
    let grains_cached = cached.grains.is_some();
    let pillar_cached = cached.pillar.is_some();
    if let Some(data) = cached.grains {
        merge(&mut grains, data);
    } else if aux.preload_grains {
        collect_grains(ctx, device, None, &mut grains).await;
    }
    if let Some(data) = cached.pillar {
        merge(&mut pillar, data);
    } else if aux.preload_pillar {
        compile_pillar(ctx, device, &grains, &mut pillar).await;
    }

    debug!(device = id, host = %device.hostname, "connecting");
    let mut connection = match bounded(device.timeout, ctx.driver.open(device)).await {
        Bounded::Done(connection) => connection,
        Bounded::Failed(error) => {
            debug!(device = id, "connection failed: {error:#}");
            return Outcome::failure(FailureKind::Connect, format!("{error:#}"));
        }
        Bounded::TimedOut => {
            debug!(device = id, "connection timed out");
            return Outcome::failure(
                FailureKind::Timeout,
                format!("connection timed out after {:?}", device.timeout),
            );
        }
    };

    if aux.with_grains && !grains_cached {
        collect_grains(ctx, device, Some(connection.as_mut()), &mut grains).await;
    }
    if aux.with_pillar && !pillar_cached && !aux.preload_pillar {
        compile_pillar(ctx, device, &grains, &mut pillar).await;
    }

    let outcome = match ctx.registry.get(&call.function) {
        None => Outcome::failure(
            FailureKind::UnknownFunction,
            format!("no function named {:?} is registered", call.function),
        ),
        Some(function) => {
            debug!(device = id, function = %call.function, "invoking");
            let invocation = Invocation {
                device,
                connection: connection.as_mut(),
                grains: &mut grains,
                pillar: &mut pillar,
                args: &call.args,
                kwargs: &call.kwargs,
            };
            let invoked = AssertUnwindSafe(bounded(device.timeout, function.call(invocation)))
                .catch_unwind()
                .await;
            match invoked {
                Ok(Bounded::Done(value)) => Outcome::Success(value),
                Ok(Bounded::Failed(err)) => {
                    error!(device = id, function = %call.function, "{err:#}");
                    Outcome::failure(FailureKind::Invocation, format!("{err:#}"))
                }
                Ok(Bounded::TimedOut) => {
                    error!(device = id, function = %call.function, "timed out");
                    Outcome::failure(
                        FailureKind::Timeout,
                        format!("{} timed out after {:?}", call.function, device.timeout),
                    )
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    error!(device = id, function = %call.function, "panicked: {message}");
                    Outcome::failure(
                        FailureKind::Crashed,
                        format!("{} panicked: {message}", call.function),
                    )
                }
            }
        }
    };

    match bounded(device.timeout, connection.close()).await {
        Bounded::Done(()) => debug!(device = id, "connection closed"),
        Bounded::Failed(error) => warn!(device = id, "failed to close connection: {error:#}"),
        Bounded::TimedOut => warn!(device = id, "timed out closing connection"),
    }

    if aux.cache_grains {
        store(ctx, id, cache::GRAINS, grains);
    }
    if aux.cache_pillar {
        store(ctx, id, cache::PILLAR, pillar);
    }

    outcome
}

/// Collects grains and layers them under `grains`. Failure is logged and otherwise ignored.
async fn collect_grains(
    ctx: &Context,
    device: &DeviceDescriptor,
    connection: Option<&mut dyn Connection>,
    grains: &mut Mapping,
) {
    match bounded(device.timeout, ctx.aux.grains(device, connection)).await {
        Bounded::Done(collected) => layer(grains, collected),
        Bounded::Failed(error) => {
            warn!(device = %device.id, "could not collect grains: {error:#}")
        }
        Bounded::TimedOut => warn!(device = %device.id, "timed out collecting grains"),
    }
}

/// Compiles pillar data and layers it under `pillar`. Failure is logged and otherwise ignored.
async fn compile_pillar(
    ctx: &Context,
    device: &DeviceDescriptor,
    grains: &Mapping,
    pillar: &mut Mapping,
) {
    match bounded(device.timeout, ctx.aux.pillar(device, grains)).await {
        Bounded::Done(compiled) => layer(pillar, compiled),
        Bounded::Failed(error) => {
            warn!(device = %device.id, "could not compile pillar: {error:#}")
        }
        Bounded::TimedOut => warn!(device = %device.id, "timed out compiling pillar"),
    }
}

/// Extracts the message a panic was raised with.
fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

fn store(ctx: &Context, id: &str, field: &str, data: Mapping) {
    if let Err(error) = ctx.cache.store(&device_key(id), field, Value::Mapping(data)) {
        warn!(device = id, "could not cache {field}: {error:#}");
    }
}

#[cfg(test)]
mod test;
