//! Publishes job progress to an event bus.
//!
//! A job announces itself once on `netrun/runner/<jid>/new` and then once per device on
//! `netrun/runner/<jid>/ret/<id>`. Publishing is best-effort: errors are logged and never fail
//! the job.

use crate::core::{Job, JobId, Outcome, Value};
use chrono::Utc;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// The namespace every topic lives under.
pub const TOPIC_PREFIX: &str = "netrun/runner";

/// The topic a job announces itself on.
pub fn new_job_topic(jid: &JobId) -> String {
    format!("{TOPIC_PREFIX}/{jid}/new")
}

/// The topic a device's outcome is announced on.
pub fn device_return_topic(jid: &JobId, id: &str) -> String {
    format!("{TOPIC_PREFIX}/{jid}/ret/{id}")
}

/// Delivers events somewhere. Fire-and-forget: implementations must not block for long.
pub trait EventBus: Send + Sync {
    fn publish(&self, topic: &str, payload: Value) -> anyhow::Result<()>;
}

/// An [EventBus] that writes each event to the log.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogBus;

impl EventBus for LogBus {
    fn publish(&self, topic: &str, payload: Value) -> anyhow::Result<()> {
        let payload = serde_yaml::to_string(&payload)?;
        info!(topic, "{}", payload.trim_end());
        Ok(())
    }
}

/// An event as delivered by [ChannelBus].
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    pub topic: String,
    pub payload: Value,
}

/// An [EventBus] that forwards events into a channel, for embedding netrun in a larger program.
#[derive(Clone, Debug)]
pub struct ChannelBus {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelBus {
    /// Returns a bus and the receiving end of its channel.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelBus { tx }, rx)
    }
}

impl EventBus for ChannelBus {
    fn publish(&self, topic: &str, payload: Value) -> anyhow::Result<()> {
        self.tx.send(Event {
            topic: topic.to_string(),
            payload,
        })?;
        Ok(())
    }
}

/// An [EventBus] that keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemoryBus {
    events: Mutex<Vec<Event>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of every event published so far, in order.
    pub fn events(&self) -> Vec<Event> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl EventBus for MemoryBus {
    fn publish(&self, topic: &str, payload: Value) -> anyhow::Result<()> {
        let mut events = self
            .events
            .lock()
            .map_err(|_| anyhow::anyhow!("event log lock poisoned"))?;
        events.push(Event {
            topic: topic.to_string(),
            payload,
        });
        Ok(())
    }
}

#[derive(Serialize)]
struct JobStarted<'a> {
    fun: &'a str,
    minions: Vec<String>,
    arg: Vec<Value>,
    jid: &'a str,
    tgt: Option<&'a str>,
    tgt_type: Option<&'a str>,
    user: Option<&'a str>,
    #[serde(rename = "_stamp")]
    stamp: String,
}

#[derive(Serialize)]
struct DeviceCompleted<'a> {
    fun: &'a str,
    fun_args: &'a [Value],
    id: &'a str,
    jid: &'a str,
    #[serde(rename = "return")]
    ret: Value,
    success: bool,
    #[serde(rename = "_stamp")]
    stamp: String,
}

fn stamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

/// Announces one job's progress. Does nothing if the job has events disabled.
#[derive(Clone)]
pub struct Emitter {
    bus: Option<Arc<dyn EventBus>>,
    jid: JobId,
    fun: String,
    fun_args: Arc<Vec<Value>>,
}

impl Emitter {
    /// Returns an emitter for `job`. Publishes to `bus` only if the job has events enabled.
    pub fn new(bus: Option<Arc<dyn EventBus>>, job: &Job) -> Self {
        Emitter {
            bus: bus.filter(|_| job.events),
            jid: job.jid.clone(),
            fun: job.call.function.clone(),
            fun_args: Arc::new(job.event_args()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.bus.is_some()
    }

    /// Announces that `job` has started.
    pub fn job_started(&self, job: &Job) {
        let Some(ref bus) = self.bus else {
            return;
        };
        let payload = JobStarted {
            fun: &self.fun,
            minions: job.device_ids(),
            arg: self.fun_args.to_vec(),
            jid: self.jid.as_str(),
            tgt: job.tgt.as_deref(),
            tgt_type: job.tgt_type.as_deref(),
            user: job.user.as_deref(),
            stamp: stamp(),
        };
        self.send(bus.as_ref(), &new_job_topic(&self.jid), payload);
    }

    /// Announces that device `id` has finished with `outcome`.
    pub fn device_completed(&self, id: &str, outcome: &Outcome) {
        let Some(ref bus) = self.bus else {
            return;
        };
        let (ret, success) = match outcome {
            Outcome::Success(value) => (value.clone(), true),
            Outcome::Failure(failure) => match serde_yaml::to_value(failure) {
                Ok(value) => (value, false),
                Err(error) => {
                    warn!(device = id, "could not serialize outcome: {error}");
                    (Value::Null, false)
                }
            },
        };
        let payload = DeviceCompleted {
            fun: &self.fun,
            fun_args: &self.fun_args,
            id,
            jid: self.jid.as_str(),
            ret,
            success,
            stamp: stamp(),
        };
        self.send(bus.as_ref(), &device_return_topic(&self.jid, id), payload);
    }

    fn send(&self, bus: &dyn EventBus, topic: &str, payload: impl Serialize) {
        let published = serde_yaml::to_value(payload)
            .map_err(anyhow::Error::from)
            .and_then(|payload| bus.publish(topic, payload));
        if let Err(error) = published {
            warn!(topic, "failed to publish event: {error:#}");
        }
    }
}
