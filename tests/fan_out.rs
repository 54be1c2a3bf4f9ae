//! Drives netrun end to end through its public API, with an in-process driver standing in for the
//! network.

use anyhow::bail;
use async_trait::async_trait;
use netrun::cache::FileCache;
use netrun::collector::Sink;
use netrun::config::Config;
use netrun::core::{
    DeviceDescriptor, FailureKind, JobOptions, Mapping, Outcome, SessionResult, Value,
};
use netrun::net::{Connection, Driver};
use netrun::roster::TargetType;
use netrun::{execute, execute_on_device_set, Context, ExecuteOutcome};
use std::collections::HashSet;
use std::io::{self, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::{NamedTempFile, TempDir};

/// Answers `ping` after a short delay and refuses connections to a set of hosts.
#[derive(Clone, Default)]
struct LabDriver {
    down: Arc<HashSet<String>>,
    open: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    closed: Arc<Mutex<Vec<String>>>,
}

impl LabDriver {
    fn with_down(hosts: &[&str]) -> Self {
        LabDriver {
            down: Arc::new(hosts.iter().map(|h| h.to_string()).collect()),
            ..Default::default()
        }
    }

    fn closed(&self) -> Vec<String> {
        let mut closed = self.closed.lock().unwrap().clone();
        closed.sort();
        closed
    }
}

#[async_trait]
impl Driver for LabDriver {
    async fn open(&self, device: &DeviceDescriptor) -> anyhow::Result<Box<dyn Connection>> {
        if self.down.contains(&device.hostname) {
            bail!("connection refused by {}", device.hostname);
        }
        let now = self.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        Ok(Box::new(LabConnection {
            id: device.id.clone(),
            driver: self.clone(),
        }))
    }
}

struct LabConnection {
    id: String,
    driver: LabDriver,
}

#[async_trait]
impl Connection for LabConnection {
    async fn invoke(
        &mut self,
        method: &str,
        _args: &[Value],
        _kwargs: &Mapping,
    ) -> anyhow::Result<Value> {
        tokio::time::sleep(Duration::from_millis(10)).await;
        match method {
            "ping" => Ok(true.into()),
            "get_facts" => Ok(serde_yaml::from_str("{vendor: Lab, model: vr1}")?),
            other => bail!("{other} is not supported"),
        }
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.driver.open.fetch_sub(1, Ordering::SeqCst);
        self.driver.closed.lock().unwrap().push(self.id.clone());
        Ok(())
    }
}

/// Collects streamed results.
#[derive(Clone, Default)]
struct Collected {
    results: Arc<Mutex<Vec<SessionResult>>>,
    finished: Arc<AtomicUsize>,
}

#[async_trait]
impl Sink for Collected {
    async fn deliver(&mut self, result: &SessionResult) -> io::Result<()> {
        assert_eq!(0, self.finished.load(Ordering::SeqCst), "delivered after finish");
        self.results.lock().unwrap().push(result.clone());
        Ok(())
    }

    async fn finish(&mut self) -> io::Result<()> {
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn ping_options(batch_size: usize, sync: bool) -> JobOptions {
    JobOptions {
        batch_size,
        sync,
        args: vec!["ping".into()],
        ..Default::default()
    }
}

#[tokio::test]
async fn partial_failure_in_two_batches() {
    let driver = LabDriver::with_down(&["h2"]);
    let ctx = Context::new(Config::default(), driver.clone());

    let outcome = execute_on_device_set(
        &ctx,
        vec!["h1", "h2", "h3"],
        "net.call",
        ping_options(2, true),
        Collected::default(),
    )
    .await
    .unwrap();

    assert_eq!(2, outcome.summary().unwrap().batches);
    let results = outcome.into_results().unwrap();
    assert_eq!(vec!["h1", "h2", "h3"], results.ids().collect::<Vec<_>>());
    assert_eq!(Some(&Outcome::Success(true.into())), results.get("h1"));
    assert_eq!(Some(&Outcome::Success(true.into())), results.get("h3"));
    let Some(Outcome::Failure(failure)) = results.get("h2") else {
        panic!("h2 should have failed");
    };
    assert_eq!(FailureKind::Connect, failure.kind);
    assert!(failure.message.contains("connection refused by h2"));

    assert_eq!(vec!["h1", "h3"], driver.closed());
    assert!(driver.peak.load(Ordering::SeqCst) <= 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn streams_a_large_fleet() {
    let driver = LabDriver::default();
    let ctx = Context::new(Config::default(), driver.clone());
    let ids: Vec<String> = (0..25).map(|i| format!("sw{i:02}")).collect();
    let set: Vec<&str> = ids.iter().map(String::as_str).collect();
    let sink = Collected::default();

    let options = ping_options(4, false);

    let outcome = execute_on_device_set(&ctx, set, "net.call", options, sink.clone())
        .await
        .unwrap();

    let ExecuteOutcome::Streaming(handle) = outcome else {
        panic!("expected a streaming job");
    };
    assert_eq!(7, handle.summary.batches);
    assert_eq!(25, handle.wait().await.unwrap());
    assert_eq!(1, sink.finished.load(Ordering::SeqCst));

    let mut delivered: Vec<String> = sink
        .results
        .lock()
        .unwrap()
        .iter()
        .map(|r| r.id.clone())
        .collect();
    delivered.sort();
    assert_eq!(ids, delivered);
    assert!(driver.peak.load(Ordering::SeqCst) <= 4);
}

#[tokio::test]
async fn roster_from_configuration_file() {
    let mut roster = NamedTempFile::new().unwrap();
    write!(
        roster,
        "\
edge1:
  hostname: edge1.lab
edge2:
  hostname: edge2.lab
core1:
  hostname: core1.lab
"
    )
    .unwrap();
    let mut config_file = NamedTempFile::new().unwrap();
    write!(
        config_file,
        "\
roster: lab
roster_file: {}
nodegroups:
  edges: [edge*]
batch_size: 1
",
        roster.path().display()
    )
    .unwrap();

    let config = Config::load(config_file.path()).unwrap();
    let name = config.file_roster_name().to_string();
    let file_roster = config.file_roster().unwrap().unwrap();
    let options = JobOptions {
        sync: true,
        ..config.job_options()
    };
    let driver = LabDriver::with_down(&["edge2.lab"]);
    let ctx = Context::new(config, driver.clone()).with_roster(name, file_roster);

    let outcome = execute(
        &ctx,
        "edges",
        TargetType::Nodegroup,
        None,
        "test.ping",
        options,
        Collected::default(),
    )
    .await
    .unwrap();

    let results = outcome.into_results().unwrap();
    assert_eq!(vec!["edge1", "edge2"], results.ids().collect::<Vec<_>>());
    assert!(results.get("edge1").unwrap().is_success());
    assert_eq!(
        Some(FailureKind::Connect),
        results.get("edge2").unwrap().failure_kind(),
    );
    assert_eq!(1, driver.peak.load(Ordering::SeqCst));
}

#[tokio::test]
async fn grains_survive_in_file_cache() {
    let dir = TempDir::new().unwrap();
    let driver = LabDriver::default();
    let ctx = Context::new(Config::default(), driver)
        .with_cache(FileCache::new(dir.path().join("cache")).unwrap());

    let mut first = JobOptions {
        sync: true,
        ..Default::default()
    };
    first.aux.with_grains = true;
    first.aux.cache_grains = true;
    execute_on_device_set(&ctx, "r1", "test.ping", first, Collected::default())
        .await
        .unwrap();

    // A second context sharing only the cache directory.
    let offline = Context::new(Config::default(), LabDriver::default())
        .with_cache(FileCache::new(dir.path().join("cache")).unwrap());
    let second = JobOptions {
        sync: true,
        args: vec!["model".into()],
        ..Default::default()
    };
    let outcome =
        execute_on_device_set(&offline, "r1", "grains.get", second, Collected::default())
            .await
            .unwrap();

    assert_eq!(
        Some(&Outcome::Success("vr1".into())),
        outcome.results().unwrap().get("r1"),
    );
}
