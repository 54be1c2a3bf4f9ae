//! Collects a device's auxiliary data: its grains (descriptive facts) and pillar (configuration
//! data supplied from the control side).
//!
//! Collection is never fatal. A session that fails to collect auxiliary data logs the failure and
//! carries on with whatever defaults it already had.

use crate::core::{DeviceDescriptor, Mapping, Value};
use crate::net::Connection;
use async_trait::async_trait;

/// Supplies grains and pillar data for a device.
#[async_trait]
pub trait AuxSource: Send + Sync {
    /// Collects grains for `device`. `connection` is [None] when collecting before the
    /// connection opens.
    async fn grains(
        &self,
        device: &DeviceDescriptor,
        connection: Option<&mut dyn Connection>,
    ) -> anyhow::Result<Mapping>;

    /// Compiles pillar data for `device`, given the grains collected so far.
    async fn pillar(&self, device: &DeviceDescriptor, grains: &Mapping) -> anyhow::Result<Mapping>;
}

/// The [AuxSource] used unless a caller supplies their own.
///
/// Grains describe the device from its descriptor and, once connected, merge in whatever the
/// driver's `get_facts` method returns. Pillar data is a fixed mapping shared by every device,
/// plus a `proxy` entry describing how the device is reached.
#[derive(Clone, Debug, Default)]
pub struct DefaultAux {
    pillar: Mapping,
}

impl DefaultAux {
    pub fn new(pillar: Mapping) -> Self {
        DefaultAux { pillar }
    }
}

#[async_trait]
impl AuxSource for DefaultAux {
    async fn grains(
        &self,
        device: &DeviceDescriptor,
        connection: Option<&mut dyn Connection>,
    ) -> anyhow::Result<Mapping> {
        let mut grains = Mapping::new();
        grains.insert("id".into(), device.id.clone().into());
        grains.insert("host".into(), device.hostname.clone().into());
        if let Some(ref driver) = device.driver {
            grains.insert("os".into(), driver.clone().into());
        }

        if let Some(connection) = connection {
            let facts = connection
                .invoke("get_facts", &[], &Mapping::new())
                .await?;
            if let Value::Mapping(facts) = facts {
                merge(&mut grains, facts);
            }
        }

        Ok(grains)
    }

    async fn pillar(&self, device: &DeviceDescriptor, _grains: &Mapping) -> anyhow::Result<Mapping> {
        let mut proxy = Mapping::new();
        proxy.insert("proxytype".into(), "netrun".into());
        proxy.insert("host".into(), device.hostname.clone().into());
        if let Some(ref driver) = device.driver {
            proxy.insert("driver".into(), driver.clone().into());
        }
        if let Some(ref username) = device.username {
            proxy.insert("username".into(), username.clone().into());
        }

        let mut pillar = self.pillar.clone();
        pillar.insert("proxy".into(), Value::Mapping(proxy));
        Ok(pillar)
    }
}

/// Inserts every entry of `overlay` into `base`, replacing existing keys.
pub fn merge(base: &mut Mapping, overlay: Mapping) {
    for (key, value) in overlay {
        base.insert(key, value);
    }
}
