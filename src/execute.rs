//! The caller-facing entry points.
//!
//! [execute] expands a target expression through a named roster and runs a function on every
//! device it matches. [execute_on_device_set] does the same for devices the caller lists directly.
//! Both return an [ExecuteError] only for misconfigurations caught before any device is contacted;
//! everything that goes wrong on a device ends up in that device's [Outcome](crate::core::Outcome).

use crate::collector::{self, ResultReceiver, ResultSender, Sink};
use crate::context::Context;
use crate::core::{DeviceDescriptor, Job, JobId, JobOptions, ResultSet, SessionResult};
use crate::error::ExecuteError;
use crate::events::Emitter;
use crate::resolve::{self, DeviceSet, Resolution};
use crate::roster::{TargetType, Targets};
use crate::scheduler::{BatchScheduler, Report, ScheduleSummary};
use crate::session;
use std::io;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// Returned in place of results when a target expression selects no devices.
pub const NO_MATCH: &str = "No devices matched your target. Please review your tgt / tgt_type \
                            arguments, or the Roster data source";

/// A suffix some callers append to roster names. Ignored when looking a roster up.
const ROSTER_SUFFIX: &str = ".targets";

/// What a call to [execute] or [execute_on_device_set] produced.
#[derive(Debug)]
pub enum ExecuteOutcome {
    /// The ids of the matched devices. Nothing was run.
    Preview(Vec<String>),

    /// The matched devices and their options. Nothing was run.
    PreviewDetails(Targets),

    /// The target expression was valid but selected nothing. Nothing was run.
    NoMatch,

    /// Every device's outcome, keyed by device id.
    Complete {
        results: ResultSet,
        summary: ScheduleSummary,
    },

    /// Every session has finished; the sink may still be consuming results.
    Streaming(StreamHandle),
}

impl ExecuteOutcome {
    /// The complete result set, if the job ran synchronously.
    pub fn results(&self) -> Option<&ResultSet> {
        match self {
            ExecuteOutcome::Complete { results, .. } => Some(results),
            _ => None,
        }
    }

    /// Consumes the outcome, returning the complete result set if the job ran synchronously.
    pub fn into_results(self) -> Option<ResultSet> {
        match self {
            ExecuteOutcome::Complete { results, .. } => Some(results),
            _ => None,
        }
    }

    /// How the job was scheduled, if it ran.
    pub fn summary(&self) -> Option<ScheduleSummary> {
        match self {
            ExecuteOutcome::Complete { summary, .. } => Some(*summary),
            ExecuteOutcome::Streaming(handle) => Some(handle.summary),
            _ => None,
        }
    }
}

/// Tracks the sink of a streaming job.
#[derive(Debug)]
pub struct StreamHandle {
    pub jid: JobId,
    pub summary: ScheduleSummary,
    consumer: JoinHandle<io::Result<usize>>,
}

impl StreamHandle {
    /// Waits for the sink to finish.
    ///
    /// # Returns
    ///
    /// The number of results the sink received, or the first error it returned.
    pub async fn wait(self) -> io::Result<usize> {
        self.consumer.await.map_err(io::Error::other)?
    }
}

/// Runs `function` on every device `tgt` selects from a roster.
///
/// The roster is the one registered in `ctx` under `roster`, or under the configured default
/// roster name if `roster` is [None].
///
/// # Arguments
///
/// * `sink` - Receives each result as it arrives. Unused when `options.sync` is set.
pub async fn execute<S: Sink + 'static>(
    ctx: &Context,
    tgt: &str,
    tgt_type: TargetType,
    roster: Option<&str>,
    function: &str,
    mut options: JobOptions,
    sink: S,
) -> Result<ExecuteOutcome, ExecuteError> {
    let name = roster
        .or(ctx.config.roster.as_deref())
        .ok_or(ExecuteError::NoRoster)?;
    let name = name.strip_suffix(ROSTER_SUFFIX).unwrap_or(name);
    let source = ctx
        .roster(name)
        .ok_or_else(|| ExecuteError::UnknownRoster(name.to_string()))?;

    let targets = match resolve::resolve_roster(source.as_ref(), tgt, tgt_type)? {
        Resolution::Matched(targets) => targets,
        Resolution::NoMatch => {
            info!(tgt, %tgt_type, roster = name, "no devices matched");
            return Ok(ExecuteOutcome::NoMatch);
        }
    };

    if options.preview_target {
        return Ok(if options.target_details {
            ExecuteOutcome::PreviewDetails(targets)
        } else {
            ExecuteOutcome::Preview(targets.keys().cloned().collect())
        });
    }

    options.tgt = options.tgt.or_else(|| Some(tgt.to_string()));
    options.tgt_type = options.tgt_type.or_else(|| Some(tgt_type.to_string()));
    execute_on_device_set(ctx, DeviceSet::Map(targets), function, options, sink).await
}

/// Runs `function` on every device in `devices`.
///
/// Devices are contacted `options.batch_size` at a time. With `options.sync` set, the call returns
/// every device's outcome. Otherwise each result goes to `sink` as soon as its session ends and the
/// call returns a [StreamHandle] once every session has finished.
pub async fn execute_on_device_set<S: Sink + 'static>(
    ctx: &Context,
    devices: impl Into<DeviceSet>,
    function: &str,
    options: JobOptions,
    sink: S,
) -> Result<ExecuteOutcome, ExecuteError> {
    let devices = resolve::resolve(devices.into(), &options.connection)?;
    if !ctx.registry.contains(function) {
        return Err(ExecuteError::UnknownFunction(function.to_string()));
    }
    let job = Job::new(function, options, devices)?;
    info!(
        jid = %job.jid,
        function,
        devices = job.devices.len(),
        sync = job.sync,
        "job started"
    );

    let emitter = Emitter::new(ctx.events.clone(), &job);
    emitter.job_started(&job);

    let (results, receiver) = collector::channel();
    let consumer = if job.sync {
        Consumer::Collect(receiver)
    } else {
        Consumer::Stream(receiver.stream(sink))
    };
    let reporter = Arc::new(JobReporter { emitter, results });

    let Job {
        jid,
        call,
        devices,
        batch_size,
        ..
    } = job;
    let worker = {
        let ctx = ctx.clone();
        move |device: DeviceDescriptor| {
            let ctx = ctx.clone();
            let call = Arc::clone(&call);
            async move { session::run(&ctx, &device, &call).await }
        }
    };
    let summary = BatchScheduler::new(batch_size)
        .run(devices, worker, reporter)
        .await;
    info!(jid = %jid, batches = summary.batches, "job finished");

    Ok(match consumer {
        Consumer::Collect(receiver) => ExecuteOutcome::Complete {
            results: receiver.collect().await,
            summary,
        },
        Consumer::Stream(consumer) => ExecuteOutcome::Streaming(StreamHandle {
            jid,
            summary,
            consumer,
        }),
    })
}

/// Where a job's results go.
enum Consumer {
    Collect(ResultReceiver),
    Stream(JoinHandle<io::Result<usize>>),
}

/// Publishes each device's result and forwards it to the collector.
struct JobReporter {
    emitter: Emitter,
    results: ResultSender,
}

impl Report for JobReporter {
    fn report(&self, result: SessionResult) {
        self.emitter.device_completed(&result.id, &result.outcome);
        self.results.send(result);
    }
}
