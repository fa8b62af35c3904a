mod common;

use common::{LogBuffer, RecordingSink, memlimit};
use parquet_tsdb::{
    commands::{ConvertArgs, ServeArgs},
    helpers::shutdown::{LifecycleContext, ShutdownSignal, channel_signals},
    metrics::{MetricsError, MetricsRegistry, Registerer, Subsystem},
    runtime::{App, ConvertHandler, DispatchState, ServeHandler},
};
use prometheus::IntCounter;
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};
use tokio::sync::mpsc;
use tracing::Span;

#[derive(Clone, Default)]
struct FakeConvert {
    calls: Arc<AtomicUsize>,
    fail: bool,
}

impl ConvertHandler for FakeConvert {
    async fn convert(
        &self,
        _ctx: LifecycleContext,
        _span: Span,
        _args: ConvertArgs,
    ) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            anyhow::bail!("block 01ABC is corrupt");
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
struct FakeServe {
    calls: Arc<AtomicUsize>,
    wait_for_shutdown: bool,
    exposition: Arc<Mutex<Option<String>>>,
    sealed: Arc<Mutex<Option<bool>>>,
}

impl ServeHandler for FakeServe {
    async fn serve(
        &self,
        ctx: LifecycleContext,
        span: Span,
        _args: ServeArgs,
        registry: MetricsRegistry,
    ) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.sealed.lock().unwrap() = Some(registry.is_sealed());

        let mut buffer = Vec::new();
        registry
            .encode(&mut buffer)
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        *self.exposition.lock().unwrap() = Some(String::from_utf8(buffer)?);

        if self.wait_for_shutdown {
            span.in_scope(|| tracing::info!("Waiting for shutdown"));
            ctx.cancelled().await;
        }
        Ok(())
    }
}

struct FakeSubsystem {
    name: &'static str,
    fail: bool,
    calls: AtomicUsize,
}

impl FakeSubsystem {
    fn new(name: &'static str, fail: bool) -> Arc<Self> {
        Arc::new(Self {
            name,
            fail,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Subsystem for FakeSubsystem {
    fn name(&self) -> &'static str {
        self.name
    }

    fn metrics_prefix(&self) -> &'static str {
        self.name
    }

    fn register_metrics(&self, registerer: &Registerer) -> Result<(), MetricsError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(MetricsError::Build(prometheus::Error::Msg(
                "collector misconfigured".to_string(),
            )));
        }
        registerer.register(Box::new(IntCounter::new("ready_total", "Ready")?))
    }
}

struct Harness {
    logs: LogBuffer,
    sink: RecordingSink,
    convert: FakeConvert,
    serve: FakeServe,
    signals: mpsc::Sender<ShutdownSignal>,
    app: App<FakeConvert, FakeServe>,
}

fn harness(convert: FakeConvert, serve: FakeServe, subsystems: &[Arc<FakeSubsystem>]) -> Harness {
    let logs = LogBuffer::default();
    let sink = RecordingSink::default();
    let (signals, source) = channel_signals();

    let mut app = App::new(convert.clone(), serve.clone())
        .with_log_writer(logs.clone())
        .with_memlimit(memlimit(Some(1000), sink.clone()))
        .with_signal_source(source);
    for subsystem in subsystems {
        app = app.with_subsystem(subsystem.clone());
    }

    Harness {
        logs,
        sink,
        convert,
        serve,
        signals,
        app,
    }
}

#[tokio::test]
async fn unknown_subcommand_touches_nothing() {
    let subsystem = FakeSubsystem::new("a", false);
    let h = harness(FakeConvert::default(), FakeServe::default(), &[subsystem.clone()]);

    let outcome = h.app.run(["parquet-tsdb", "compact"]).await;

    assert_ne!(outcome.code, 0);
    assert_eq!(outcome.state, DispatchState::Initialized);
    assert!(h.logs.is_empty());
    assert!(h.sink.applied().is_empty());
    assert_eq!(subsystem.calls(), 0);
    assert_eq!(h.convert.calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.serve.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn invalid_ratio_is_a_usage_error() {
    let h = harness(FakeConvert::default(), FakeServe::default(), &[]);

    let outcome = h.app.run(["parquet-tsdb", "--memlimit.ratio", "0", "serve"]).await;

    assert_eq!(outcome.code, 2);
    assert!(h.sink.applied().is_empty());
    assert_eq!(h.serve.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn serve_runs_with_configured_level_and_ratio() {
    let subsystem = FakeSubsystem::new("b", false);
    let h = harness(FakeConvert::default(), FakeServe::default(), &[subsystem.clone()]);

    let outcome = h
        .app
        .run([
            "parquet-tsdb",
            "--logger.level",
            "DEBUG",
            "--memlimit.ratio",
            "0.5",
            "serve",
        ])
        .await;

    assert_eq!(outcome.code, 0);
    assert_eq!(outcome.state, DispatchState::Completed);
    assert_eq!(
        outcome.history,
        [
            DispatchState::Initialized,
            DispatchState::CommandSelected,
            DispatchState::Running,
            DispatchState::Completed,
        ]
    );
    assert_eq!(h.sink.applied(), [500]);
    assert_eq!(subsystem.calls(), 1);
    assert_eq!(h.serve.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.convert.calls.load(Ordering::SeqCst), 0);
    assert_eq!(*h.serve.sealed.lock().unwrap(), Some(true));

    let exposition = h.serve.exposition.lock().unwrap().clone().unwrap();
    assert!(exposition.contains("cf_metrics_b_ready_total 0"));

    assert!(h.logs.levels().iter().any(|l| l == "DEBUG"));
    let messages = h.logs.messages();
    let running = messages.iter().position(|m| m == "Running serve").unwrap();
    let done = messages.iter().position(|m| m == "Done").unwrap();
    assert!(running < done);
}

#[tokio::test]
async fn info_level_hides_debug_records() {
    let h = harness(FakeConvert::default(), FakeServe::default(), &[]);

    let outcome = h.app.run(["parquet-tsdb", "convert", "--tsdb.path", "/data"]).await;

    assert_eq!(outcome.code, 0);
    assert!(!h.logs.levels().is_empty());
    assert!(h.logs.levels().iter().all(|l| l != "DEBUG"));
    assert!(h.logs.find("Running convert").is_some());
    assert_eq!(h.sink.applied(), [900]);
}

#[tokio::test]
async fn convert_failure_exits_one_and_logs_the_cause() {
    let convert = FakeConvert {
        fail: true,
        ..FakeConvert::default()
    };
    let h = harness(convert, FakeServe::default(), &[]);

    let outcome = h.app.run(["parquet-tsdb", "convert", "--tsdb.path", "/data"]).await;

    assert_eq!(outcome.code, 1);
    assert_eq!(outcome.state, DispatchState::Failed);
    assert!(outcome.reached(DispatchState::Running));
    assert!(!outcome.reached(DispatchState::Completed));
    assert_eq!(h.convert.calls.load(Ordering::SeqCst), 1);

    let record = h.logs.find("Error converting tsdb block").unwrap();
    assert_eq!(record["level"], "ERROR");
    assert!(
        record["fields"]["error"]
            .as_str()
            .unwrap()
            .contains("block 01ABC is corrupt")
    );
    assert!(h.logs.find("Done").is_none());
}

#[tokio::test]
async fn registration_failure_prevents_the_handler() {
    let failing = FakeSubsystem::new("a", true);
    let healthy = FakeSubsystem::new("b", false);
    let h = harness(
        FakeConvert::default(),
        FakeServe::default(),
        &[failing.clone(), healthy.clone()],
    );

    let outcome = h.app.run(["parquet-tsdb", "serve"]).await;

    assert_eq!(outcome.code, 1);
    assert_eq!(outcome.state, DispatchState::Failed);
    assert!(!outcome.reached(DispatchState::Running));
    assert_eq!(failing.calls(), 1);
    assert_eq!(healthy.calls(), 1);
    assert_eq!(h.serve.calls.load(Ordering::SeqCst), 0);

    let record = h.logs.find("Could not setup prometheus").unwrap();
    assert_eq!(record["level"], "ERROR");
    let error = record["fields"]["error"].as_str().unwrap();
    assert!(error.contains("1 error occurred"));
    assert!(error.contains("a: "));
}

#[tokio::test]
async fn memory_limit_failure_is_not_fatal() {
    let logs = LogBuffer::default();
    let sink = RecordingSink::default();
    let (_signals, source) = channel_signals();
    let serve = FakeServe::default();

    let outcome = App::new(FakeConvert::default(), serve.clone())
        .with_log_writer(logs.clone())
        .with_memlimit(memlimit(None, sink.clone()))
        .with_signal_source(source)
        .run(["parquet-tsdb", "serve"])
        .await;

    assert_eq!(outcome.code, 0);
    assert!(sink.applied().is_empty());
    assert_eq!(serve.calls.load(Ordering::SeqCst), 1);
    let record = logs.find("Could not apply memory limit, continuing without it").unwrap();
    assert_eq!(record["level"], "WARN");
}

#[tokio::test]
async fn signal_cancels_the_running_handler() {
    let serve = FakeServe {
        wait_for_shutdown: true,
        ..FakeServe::default()
    };
    let h = harness(FakeConvert::default(), serve, &[]);

    // Buffered until the bridge is armed.
    h.signals.send(ShutdownSignal::Terminate).await.unwrap();
    let outcome = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        h.app.run(["parquet-tsdb", "serve"]),
    )
    .await
    .unwrap();

    assert_eq!(outcome.code, 0);
    assert_eq!(outcome.state, DispatchState::Completed);

    let record = h.logs.find("Caught signal, canceling context").unwrap();
    assert_eq!(record["level"], "WARN");
    assert_eq!(record["fields"]["signal"], "terminated");
    assert!(h.logs.find("Done").is_some());
}
