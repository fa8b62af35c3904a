// Local crates
use crate::{
    cli::{Cli, Command},
    commands::{convert::ConvertArgs, serve::ServeArgs},
    helpers::shutdown::{LifecycleContext, SignalSource, os_signals, spawn_signal_bridge},
    instrumentation::{build_logger, init_panic_handler, install_global},
    memlimit::{MemLimitConfigurator, configure_memory_limit},
    metrics::{MetricsRegistry, Subsystem, compose_registry},
};

// External crates
use anyhow::Result;
use clap::Parser;
use std::{ffi::OsString, future::Future, process::ExitCode, sync::Arc};
use tracing::{Span, info_span, instrument::WithSubscriber};
use tracing_subscriber::fmt::{MakeWriter, writer::BoxMakeWriter};

/// Exit code of a failed startup or a failed handler.
pub const FAILURE_EXIT_CODE: u8 = 1;

/// Exit code used when clap reports one outside of `u8`.
const USAGE_EXIT_CODE: u8 = 2;

/// Handler of the `convert` command.
///
/// `span` is the handler's logger: records emitted inside it carry the command.
pub trait ConvertHandler: Send + Sync {
    /// Runs a conversion until done, failed or `ctx` is cancelled.
    fn convert(
        &self,
        ctx: LifecycleContext,
        span: Span,
        args: ConvertArgs,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// Handler of the `serve` command. The only one lent the metrics registry.
pub trait ServeHandler: Send + Sync {
    /// Serves until `ctx` is cancelled or serving fails.
    fn serve(
        &self,
        ctx: LifecycleContext,
        span: Span,
        args: ServeArgs,
        registry: MetricsRegistry,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// Where an invocation is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    /// Nothing parsed yet.
    Initialized,
    /// Command line parsed, one command chosen.
    CommandSelected,
    /// Handler invoked and not yet returned.
    Running,
    /// Handler returned successfully.
    Completed,
    /// Startup or handler failed.
    Failed,
}

/// How an invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    /// Last state reached.
    pub state: DispatchState,
    /// Every state visited, in order, starting with `Initialized`.
    pub history: Vec<DispatchState>,
    /// Process exit code.
    pub code: u8,
}

impl Outcome {
    /// Whether `state` was visited at any point.
    #[must_use]
    pub fn reached(&self, state: DispatchState) -> bool {
        self.history.contains(&state)
    }

    /// `code` as a process exit code.
    #[must_use]
    pub fn exit_code(&self) -> ExitCode {
        ExitCode::from(self.code)
    }
}

#[derive(Debug)]
struct Dispatcher {
    state: DispatchState,
    history: Vec<DispatchState>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self {
            state: DispatchState::Initialized,
            history: vec![DispatchState::Initialized],
        }
    }
}

impl Dispatcher {
    fn transition(&mut self, next: DispatchState) {
        tracing::debug!(from = ?self.state, to = ?next, "Dispatcher state transition");
        self.state = next;
        self.history.push(next);
    }

    fn fail(mut self) -> Outcome {
        self.transition(DispatchState::Failed);
        self.finish(FAILURE_EXIT_CODE)
    }

    fn finish(self, code: u8) -> Outcome {
        Outcome {
            state: self.state,
            history: self.history,
            code,
        }
    }
}

/// The process: schema, logger, memory limit, metrics, signals and exactly one
/// command, in that order.
pub struct App<C, S> {
    convert: C,
    serve: S,
    subsystems: Vec<Arc<dyn Subsystem>>,
    log_writer: BoxMakeWriter,
    global_logger: bool,
    memlimit: Box<dyn Fn(f64) -> MemLimitConfigurator + Send + Sync>,
    signals: Option<SignalSource>,
}

impl<C, S> std::fmt::Debug for App<C, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field(
                "subsystems",
                &self.subsystems.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .field("global_logger", &self.global_logger)
            .field("custom_signals", &self.signals.is_some())
            .finish_non_exhaustive()
    }
}

impl<C: ConvertHandler, S: ServeHandler> App<C, S> {
    /// App logging to stdout, applying the process soft memory limit and
    /// listening for OS signals.
    pub fn new(convert: C, serve: S) -> Self {
        Self {
            convert,
            serve,
            subsystems: Vec::new(),
            log_writer: BoxMakeWriter::new(std::io::stdout),
            global_logger: false,
            memlimit: Box::new(MemLimitConfigurator::new),
            signals: None,
        }
    }

    /// Adds a subsystem whose metrics are registered, in insertion order.
    pub fn with_subsystem(mut self, subsystem: Arc<dyn Subsystem>) -> Self {
        self.subsystems.push(subsystem);
        self
    }

    /// Sends log records to `writer` instead of stdout.
    pub fn with_log_writer<W>(mut self, writer: W) -> Self
    where
        W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    {
        self.log_writer = BoxMakeWriter::new(writer);
        self
    }

    /// Also install the logger process-wide, with a panic hook.
    pub fn with_global_logger(mut self, global: bool) -> Self {
        self.global_logger = global;
        self
    }

    /// Builds the memory limit configurator from the parsed ratio.
    pub fn with_memlimit(
        mut self,
        memlimit: impl Fn(f64) -> MemLimitConfigurator + Send + Sync + 'static,
    ) -> Self {
        self.memlimit = Box::new(memlimit);
        self
    }

    /// Takes shutdown signals from `source` instead of the OS.
    pub fn with_signal_source(mut self, source: SignalSource) -> Self {
        self.signals = Some(source);
        self
    }

    /// Runs one invocation described by `args` (program name first).
    ///
    /// A usage error returns before the logger, the memory limit or the
    /// metrics are touched.
    pub async fn run<I, T>(self, args: I) -> Outcome
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let App {
            convert,
            serve,
            subsystems,
            log_writer,
            global_logger,
            memlimit,
            signals,
        } = self;
        let mut dispatcher = Dispatcher::default();

        let cli = match Cli::try_parse_from(args) {
            Ok(cli) => cli,
            Err(err) => {
                let _ = err.print();
                let code = u8::try_from(err.exit_code()).unwrap_or(USAGE_EXIT_CODE);
                return dispatcher.finish(code);
            }
        };
        dispatcher.transition(DispatchState::CommandSelected);

        let logger = build_logger(cli.log_level.into(), log_writer);
        if global_logger {
            match install_global(&logger) {
                Ok(()) => init_panic_handler(),
                Err(err) => tracing::dispatcher::with_default(&logger, || {
                    tracing::warn!(error = %err, "Could not install process-wide logger");
                }),
            }
        }

        let flow = async move {
            tracing::debug!(
                command = cli.command.name(),
                memlimit_ratio = cli.memlimit_ratio,
                "Parsed command line"
            );

            configure_memory_limit(&memlimit(cli.memlimit_ratio));

            let registry = match compose_registry(&subsystems) {
                Ok(registry) => registry,
                Err(errors) => {
                    tracing::error!(error = %errors, "Could not setup prometheus");
                    return dispatcher.fail();
                }
            };

            let (ctx, trigger) = LifecycleContext::new();
            let source = match signals {
                Some(source) => source,
                None => match os_signals() {
                    Ok(source) => source,
                    Err(err) => {
                        tracing::error!(error = %err, "Could not register signal handlers");
                        return dispatcher.fail();
                    }
                },
            };
            // Detached: parks until the first signal or process exit.
            let _bridge = spawn_signal_bridge(source, trigger);

            let (result, failure) = match cli.command {
                Command::Convert(args) => {
                    tracing::info!("Running convert");
                    dispatcher.transition(DispatchState::Running);
                    let outcome = convert.convert(ctx, info_span!("convert"), args).await;
                    (outcome, "Error converting tsdb block")
                }
                Command::Serve(args) => {
                    tracing::info!("Running serve");
                    dispatcher.transition(DispatchState::Running);
                    let outcome = serve
                        .serve(ctx, info_span!("serve"), args, registry)
                        .await;
                    (outcome, "Error running serve")
                }
            };

            match result {
                Ok(()) => {
                    dispatcher.transition(DispatchState::Completed);
                    tracing::info!("Done");
                    dispatcher.finish(0)
                }
                Err(err) => {
                    tracing::error!(error = %format!("{err:#}"), "{failure}");
                    dispatcher.fail()
                }
            }
        };

        flow.with_subscriber(logger).await
    }
}
