use super::*;
use crate::auxiliary::{AuxSource, DefaultAux};
use crate::cache::{Cache, MemoryCache};
use crate::config::Config;
use crate::core::fixtures::device;
use crate::core::AuxFlags;
use crate::net::fixtures::{FakeDriver, Record};
use crate::registry::{DeviceFunction, Registry};
use anyhow::bail;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

pub mod fixtures {
    use super::*;

    /// A context around `driver` with an in-memory cache the test can inspect.
    pub fn context(driver: &FakeDriver) -> (Context, Arc<MemoryCache>) {
        let cache = Arc::new(MemoryCache::new());
        let mut ctx = Context::new(Config::default(), driver.clone());
        ctx.cache = cache.clone();
        (ctx, cache)
    }

    pub fn call(function: &str, args: Vec<Value>) -> JobCall {
        JobCall {
            function: function.to_string(),
            args,
            kwargs: Mapping::new(),
            aux: AuxFlags::default(),
            default_grains: Mapping::new(),
            default_pillar: Mapping::new(),
        }
    }

    /// A device whose timeout is short enough to trip in a test.
    pub fn impatient_device(id: &str) -> DeviceDescriptor {
        DeviceDescriptor {
            timeout: Duration::from_millis(50),
            ..device(id)
        }
    }

    pub fn closes(driver: &FakeDriver) -> usize {
        driver.count(|r| matches!(r, Record::Close(_)))
    }

    pub fn mapping(yaml: &str) -> Mapping {
        serde_yaml::from_str(yaml).unwrap()
    }

    /// Wraps [DefaultAux](crate::auxiliary::DefaultAux) and notes each collection along with the
    /// number of connections the driver had opened by then.
    #[derive(Clone)]
    pub struct RecordingAux {
        driver: FakeDriver,
        notes: Arc<Mutex<Vec<(&'static str, usize)>>>,
    }

    impl RecordingAux {
        pub fn new(driver: &FakeDriver) -> Self {
            RecordingAux {
                driver: driver.clone(),
                notes: Arc::default(),
            }
        }

        pub fn notes(&self) -> Vec<(&'static str, usize)> {
            self.notes.lock().unwrap().clone()
        }

        fn note(&self, what: &'static str) {
            let opened = self.driver.count(|r| matches!(r, Record::Open(_)));
            self.notes.lock().unwrap().push((what, opened));
        }
    }

    #[async_trait]
    impl AuxSource for RecordingAux {
        async fn grains(
            &self,
            device: &DeviceDescriptor,
            connection: Option<&mut dyn Connection>,
        ) -> anyhow::Result<Mapping> {
            self.note("grains");
            DefaultAux::default().grains(device, connection).await
        }

        async fn pillar(
            &self,
            device: &DeviceDescriptor,
            grains: &Mapping,
        ) -> anyhow::Result<Mapping> {
            self.note("pillar");
            DefaultAux::new(mapping("ntp: 192.0.2.123"))
                .pillar(device, grains)
                .await
        }
    }

    /// A function that panics on every device.
    pub struct Explode;

    #[async_trait]
    impl DeviceFunction for Explode {
        async fn call(&self, invocation: Invocation<'_>) -> anyhow::Result<Value> {
            panic!("exploded on {}", invocation.device.id);
        }
    }

    /// An [AuxSource] that always fails.
    pub struct BrokenAux;

    #[async_trait]
    impl AuxSource for BrokenAux {
        async fn grains(
            &self,
            _device: &DeviceDescriptor,
            _connection: Option<&mut dyn Connection>,
        ) -> anyhow::Result<Mapping> {
            bail!("grains unavailable")
        }

        async fn pillar(
            &self,
            _device: &DeviceDescriptor,
            _grains: &Mapping,
        ) -> anyhow::Result<Mapping> {
            bail!("pillar unavailable")
        }
    }
}

use fixtures::*;

mod run {
    use super::*;

    #[tokio::test]
    async fn returns_function_value() {
        let driver = FakeDriver::new();
        let (ctx, _) = context(&driver);

        let outcome = run(&ctx, &device("r1"), &call("net.cli", vec!["show clock".into()])).await;

        let Outcome::Success(value) = outcome else {
            panic!("expected success, got {outcome:?}");
        };
        assert_eq!(
            Some(&Value::from("output of show clock")),
            value.as_mapping().unwrap().get("show clock"),
        );
        assert_eq!(
            vec![
                Record::Open("r1".into()),
                Record::Invoke("r1".into(), "cli".into()),
                Record::Close("r1".into()),
            ],
            driver.records(),
        );
    }

    #[tokio::test]
    async fn connect_failure_is_outcome() {
        let driver = FakeDriver::new();
        driver.set_unreachable("r1");
        let (ctx, _) = context(&driver);

        let outcome = run(&ctx, &device("r1"), &call("test.ping", vec![])).await;

        assert_eq!(Some(FailureKind::Connect), outcome.failure_kind());
        assert_eq!(0, closes(&driver));
    }

    #[tokio::test]
    async fn connect_timeout_is_outcome() {
        let driver = FakeDriver::new();
        driver.slow_open("r1", Duration::from_secs(30));
        let (ctx, _) = context(&driver);

        let outcome = run(&ctx, &impatient_device("r1"), &call("test.ping", vec![])).await;

        assert_eq!(Some(FailureKind::Timeout), outcome.failure_kind());
    }

    #[tokio::test]
    async fn function_failure_still_closes_once() {
        let driver = FakeDriver::new();
        driver.fail_method("r1", "cli");
        let (ctx, _) = context(&driver);

        let outcome = run(&ctx, &device("r1"), &call("net.cli", vec!["show run".into()])).await;

        let Outcome::Failure(failure) = outcome else {
            panic!("expected failure");
        };
        assert_eq!(FailureKind::Invocation, failure.kind);
        assert!(failure.message.contains("cli failed on r1"));
        assert_eq!(1, closes(&driver));
    }

    #[tokio::test]
    async fn function_timeout_still_closes_once() {
        let driver = FakeDriver::new();
        driver.slow_invoke("r1", Duration::from_secs(30));
        let (ctx, _) = context(&driver);

        let outcome = run(
            &ctx,
            &impatient_device("r1"),
            &call("net.cli", vec!["show run".into()]),
        )
        .await;

        assert_eq!(Some(FailureKind::Timeout), outcome.failure_kind());
        assert_eq!(1, closes(&driver));
    }

    #[tokio::test]
    async fn unknown_function_still_closes_once() {
        let driver = FakeDriver::new();
        let (ctx, _) = context(&driver);

        let outcome = run(&ctx, &device("r1"), &call("net.nope", vec![])).await;

        assert_eq!(Some(FailureKind::UnknownFunction), outcome.failure_kind());
        assert_eq!(1, closes(&driver));
    }

    #[tokio::test]
    async fn panicking_function_still_closes_once() {
        let driver = FakeDriver::new();
        let (ctx, _) = context(&driver);
        let mut registry = Registry::with_builtins();
        registry.register("test.explode", Explode);
        let ctx = ctx.with_registry(registry);

        let outcome = run(&ctx, &device("r1"), &call("test.explode", vec![])).await;

        let Outcome::Failure(failure) = outcome else {
            panic!("expected failure");
        };
        assert_eq!(FailureKind::Crashed, failure.kind);
        assert!(failure.message.contains("exploded on r1"));
        assert_eq!(1, closes(&driver));
    }

    #[tokio::test]
    async fn device_kwargs_reach_function() {
        let driver = FakeDriver::new();
        let (ctx, _) = context(&driver);
        let mut device = device("r1");
        device.kwargs = mapping("default: fallback");

        let outcome = run(&ctx, &device, &call("grains.get", vec!["missing".into()])).await;

        assert_eq!(Outcome::Success("fallback".into()), outcome);
    }

    #[tokio::test]
    async fn close_failure_is_ignored() {
        let driver = FakeDriver::new();
        driver.fail_close("r1");
        let (ctx, _) = context(&driver);

        let outcome = run(&ctx, &device("r1"), &call("test.ping", vec![])).await;

        assert_eq!(Outcome::Success(true.into()), outcome);
        assert_eq!(1, closes(&driver));
    }
}

mod grains {
    use super::*;

    #[tokio::test]
    async fn defaults_include_os() {
        let driver = FakeDriver::new();
        let (ctx, _) = context(&driver);

        let outcome = run(&ctx, &device("r1"), &call("grains.get", vec!["os".into()])).await;

        assert_eq!(Outcome::Success("eos".into()), outcome);
    }

    #[tokio::test]
    async fn caller_os_wins() {
        let driver = FakeDriver::new();
        let (ctx, _) = context(&driver);
        let mut call = call("grains.get", vec!["os".into()]);
        call.default_grains = mapping("os: junos");

        let outcome = run(&ctx, &device("r1"), &call).await;

        assert_eq!(Outcome::Success("junos".into()), outcome);
    }

    #[tokio::test]
    async fn collected_after_connect() {
        let driver = FakeDriver::new();
        let (ctx, _) = context(&driver);
        let mut call = call("grains.get", vec!["vendor".into()]);
        call.aux.with_grains = true;

        let outcome = run(&ctx, &device("r1"), &call).await;

        assert_eq!(Outcome::Success("Fake".into()), outcome);
        assert_eq!(
            1,
            driver.count(|r| matches!(r, Record::Invoke(_, m) if m == "get_facts")),
        );
    }

    #[tokio::test]
    async fn cached_grains_skip_collection() {
        let driver = FakeDriver::new();
        let (ctx, cache) = context(&driver);
        cache
            .store(
                &device_key("r1"),
                cache::GRAINS,
                Value::Mapping(mapping("vendor: Cached")),
            )
            .unwrap();
        let mut call = call("grains.get", vec!["vendor".into()]);
        call.aux.with_grains = true;

        let outcome = run(&ctx, &device("r1"), &call).await;

        assert_eq!(Outcome::Success("Cached".into()), outcome);
        assert_eq!(
            0,
            driver.count(|r| matches!(r, Record::Invoke(_, m) if m == "get_facts")),
        );
    }

    #[tokio::test]
    async fn cache_ignored_when_disabled() {
        let driver = FakeDriver::new();
        let (ctx, cache) = context(&driver);
        cache
            .store(
                &device_key("r1"),
                cache::GRAINS,
                Value::Mapping(mapping("vendor: Cached")),
            )
            .unwrap();
        let mut call = call("grains.get", vec!["vendor".into()]);
        call.aux.with_grains = true;
        call.aux.use_cached_grains = false;

        let outcome = run(&ctx, &device("r1"), &call).await;

        assert_eq!(Outcome::Success("Fake".into()), outcome);
    }

    #[tokio::test]
    async fn collection_failure_is_not_fatal() {
        let driver = FakeDriver::new();
        let (ctx, _) = context(&driver);
        let ctx = ctx.with_aux(BrokenAux);
        let mut call = call("grains.get", vec!["os".into()]);
        call.aux.preload_grains = true;
        call.aux.with_grains = true;
        call.aux.with_pillar = true;

        let outcome = run(&ctx, &device("r1"), &call).await;

        assert_eq!(Outcome::Success("eos".into()), outcome);
        assert_eq!(1, closes(&driver));
    }

    #[tokio::test]
    async fn preloaded_before_connect() {
        let driver = FakeDriver::new();
        let (ctx, _) = context(&driver);
        let aux = RecordingAux::new(&driver);
        let ctx = ctx.with_aux(aux.clone());
        let mut call = call("grains.get", vec!["host".into()]);
        call.aux.preload_grains = true;

        let outcome = run(&ctx, &device("r1"), &call).await;

        assert_eq!(Outcome::Success("r1.example.net".into()), outcome);
        assert_eq!(vec![("grains", 0)], aux.notes());
    }

    #[tokio::test]
    async fn device_can_request_collection() {
        let driver = FakeDriver::new();
        let (ctx, _) = context(&driver);
        let mut device = device("r1");
        device.session.with_grains = Some(true);

        let outcome = run(&ctx, &device, &call("grains.get", vec!["vendor".into()])).await;

        assert_eq!(Outcome::Success("Fake".into()), outcome);
    }

    #[tokio::test]
    async fn written_back_after_close() {
        let driver = FakeDriver::new();
        let (ctx, cache) = context(&driver);
        let mut call = call("grains.setval", vec!["role".into(), "spine".into()]);
        call.aux.cache_grains = true;

        let outcome = run(&ctx, &device("r1"), &call).await;

        assert!(outcome.is_success());
        let bank = cache.fetch(&device_key("r1")).unwrap().unwrap();
        let grains = bank.get(cache::GRAINS).and_then(Value::as_mapping).unwrap();
        assert_eq!(Some(&Value::from("spine")), grains.get("role"));
        assert_eq!(Some(&Value::from("eos")), grains.get("os"));
        assert!(!bank.contains_key(cache::PILLAR));
    }
}

mod pillar {
    use super::*;

    #[tokio::test]
    async fn compiled_after_connect() {
        let driver = FakeDriver::new();
        let (ctx, _) = context(&driver);
        let mut call = call("pillar.get", vec!["proxy:proxytype".into()]);
        call.aux.with_pillar = true;

        let outcome = run(&ctx, &device("r1"), &call).await;

        assert_eq!(Outcome::Success("netrun".into()), outcome);
    }

    #[tokio::test]
    async fn preloaded_once_before_connect() {
        let driver = FakeDriver::new();
        let (ctx, _) = context(&driver);
        let aux = RecordingAux::new(&driver);
        let ctx = ctx.with_aux(aux.clone());
        let mut call = call("pillar.get", vec!["ntp".into()]);
        call.aux.preload_pillar = true;
        call.aux.with_pillar = true;

        let outcome = run(&ctx, &device("r1"), &call).await;

        assert_eq!(Outcome::Success("192.0.2.123".into()), outcome);
        assert_eq!(vec![("pillar", 0)], aux.notes());
    }

    #[tokio::test]
    async fn compiled_with_connection_open() {
        let driver = FakeDriver::new();
        let (ctx, _) = context(&driver);
        let aux = RecordingAux::new(&driver);
        let ctx = ctx.with_aux(aux.clone());
        let mut call = call("pillar.get", vec!["ntp".into()]);
        call.aux.with_pillar = true;

        let outcome = run(&ctx, &device("r1"), &call).await;

        assert_eq!(Outcome::Success("192.0.2.123".into()), outcome);
        assert_eq!(vec![("pillar", 1)], aux.notes());
    }

    #[tokio::test]
    async fn defaults_only_without_compilation() {
        let driver = FakeDriver::new();
        let (ctx, _) = context(&driver);
        let mut call = call("pillar.items", vec![]);
        call.default_pillar = mapping("site: ams1");

        let outcome = run(&ctx, &device("r1"), &call).await;

        assert_eq!(Outcome::Success(Value::Mapping(mapping("site: ams1"))), outcome);
    }

    #[tokio::test]
    async fn written_back_when_requested() {
        let driver = FakeDriver::new();
        let (ctx, cache) = context(&driver);
        let mut call = call("test.ping", vec![]);
        call.default_pillar = mapping("site: ams1");
        call.aux.cache_pillar = true;

        run(&ctx, &device("r1"), &call).await;

        let bank = cache.fetch(&device_key("r1")).unwrap().unwrap();
        assert_eq!(
            Some(&Value::Mapping(mapping("site: ams1"))),
            bank.get(cache::PILLAR),
        );
    }

    #[tokio::test]
    async fn not_written_after_connect_failure() {
        let driver = FakeDriver::new();
        driver.set_unreachable("r1");
        let (ctx, cache) = context(&driver);
        let mut call = call("test.ping", vec![]);
        call.aux.cache_pillar = true;

        run(&ctx, &device("r1"), &call).await;

        assert_eq!(None, cache.fetch(&device_key("r1")).unwrap());
    }
}
