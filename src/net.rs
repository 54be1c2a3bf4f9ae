//! The device-abstraction layer's contract. Does not contain a vendor implementation.
//!
//! netrun connects to devices through a [Driver]. The jobs of a driver are to (a) open a
//! [Connection] to one device from a [DeviceDescriptor], (b) invoke named methods on that
//! connection, and (c) close it again. Every session opens a fresh connection and closes it when
//! the session ends; nothing is kept alive between jobs.
//!
//! # Implementing a driver
//!
//! The reference implementation ([openssh], behind the `openssh` feature) runs commands over SSH,
//! but any transport works: a NETCONF client, a vendor REST API, or an in-process fake for tests.
//! Authentication and vendor-specific method sets are entirely the driver's business.

use crate::core::{DeviceDescriptor, Mapping, Value};
use async_trait::async_trait;
use tracing::warn;

#[cfg(feature = "openssh")]
pub mod openssh;

/// Opens connections to devices.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Connects to `device` and, on success, returns an interface to it.
    ///
    /// Implementations should honor [DeviceDescriptor::timeout] where their transport allows;
    /// the session wraps this call in the same timeout regardless.
    async fn open(&self, device: &DeviceDescriptor) -> anyhow::Result<Box<dyn Connection>>;
}

/// An open connection to one device.
#[async_trait]
pub trait Connection: Send {
    /// Invokes `method` on the device with the given arguments and returns its result.
    async fn invoke(&mut self, method: &str, args: &[Value], kwargs: &Mapping)
        -> anyhow::Result<Value>;

    /// Closes the connection. Called exactly once per opened connection.
    async fn close(&mut self) -> anyhow::Result<()>;
}

/// Opens a connection to `device`, invokes one driver method, and closes the connection.
///
/// A failure to close is logged, never returned.
pub async fn call(
    driver: &dyn Driver,
    device: &DeviceDescriptor,
    method: &str,
    args: &[Value],
    kwargs: &Mapping,
) -> anyhow::Result<Value> {
    let mut connection = driver.open(device).await?;
    let ret = connection.invoke(method, args, kwargs).await;
    if let Err(error) = connection.close().await {
        warn!(device = %device.id, "failed to close connection: {error:#}");
    }
    ret
}
