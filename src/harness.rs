//! Top-level orchestration: run many test scripts, parse their TAP output
//! and aggregate the outcome.
//!
//! Three execution strategies share the same per-test plumbing. With one
//! job, tests run back to back. With more jobs, either a
//! [`Multiplexer`] interleaves live parsers in one thread, or (with `fork`)
//! a worker pool runs each parser to completion and ships its results back
//! so per-test output is never interleaved mid-file.

use std::collections::HashSet;
use std::env;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::aggregator::Aggregator;
use crate::error::{Error, Result};
use crate::formatter::{ColorMode, ConsoleFormatter, Formatter, SilentFormatter};
use crate::multiplexer::{Multiplexer, Mux};
use crate::parser::{Parser, ParserEvent, ParserSummary};
use crate::process::{ProcessSource, SpawnOptions};
use crate::result::ParseResult;

type AggregatorHook = Arc<dyn Fn(&Aggregator) + Send + Sync>;
type MadeParserHook = Arc<dyn Fn(&mut Parser) + Send + Sync>;
type ResultHook = Arc<dyn Fn(&ParseResult) + Send + Sync>;

/// Hooks invoked around the run and inside every parser.
///
/// Harness-level events have typed registration methods; parser-level
/// events are registered by name and validated immediately.
#[derive(Clone, Default)]
pub struct Callbacks {
    before_runtests: Vec<AggregatorHook>,
    made_parser: Vec<MadeParserHook>,
    after_runtests: Vec<AggregatorHook>,
    parser: Vec<(ParserEvent, ResultHook)>,
}

impl Callbacks {
    /// Fires once, after the aggregator started and before any test runs.
    pub fn before_runtests(&mut self, hook: impl Fn(&Aggregator) + Send + Sync + 'static) {
        self.before_runtests.push(Arc::new(hook));
    }

    /// Fires after each parser is constructed, before its first result.
    pub fn made_parser(&mut self, hook: impl Fn(&mut Parser) + Send + Sync + 'static) {
        self.made_parser.push(Arc::new(hook));
    }

    /// Fires once, after the whole run has been aggregated.
    pub fn after_runtests(&mut self, hook: impl Fn(&Aggregator) + Send + Sync + 'static) {
        self.after_runtests.push(Arc::new(hook));
    }

    /// Register a parser-event callback by name (`test`, `plan`, `bailout`,
    /// `comment`, `yaml`, `unknown`, `version`, `ELSE`, `ALL`). Unknown
    /// names are rejected here, not at run time.
    pub fn on(
        &mut self,
        event: &str,
        hook: impl Fn(&ParseResult) + Send + Sync + 'static,
    ) -> Result<()> {
        let event: ParserEvent = event.parse()?;
        self.parser.push((event, Arc::new(hook)));
        Ok(())
    }
}

/// Harness configuration. All fields have working defaults.
pub struct HarnessConfig {
    /// Include paths handed to the interpreter as `-I<path>`.
    pub lib: Vec<String>,
    /// Extra interpreter switches; duplicates collapse keeping the first.
    pub switches: Vec<String>,
    /// Argv prefix replacing all interpreter heuristics; the test name is
    /// appended and the result spawned verbatim.
    pub exec: Option<Vec<String>>,
    /// Merge child stderr into the parsed stream.
    pub merge: bool,
    /// Number of tests in flight; 1 means sequential.
    pub jobs: usize,
    /// With `jobs > 1`, use the worker pool instead of the multiplexer.
    pub fork: bool,
    /// Injected formatter; overrides `formatter_class`.
    pub formatter: Option<Box<dyn Formatter>>,
    /// Formatter to build when none is injected: `console` or `silent`.
    pub formatter_class: Option<String>,
    pub verbosity: i8,
    pub timer: bool,
    pub color: ColorMode,
    pub directives: bool,
    pub failures: bool,
    /// Report parse errors under each test as it closes.
    pub errors: bool,
    /// Spool root; overrides the `TEST_HARNESS_DUMP_TAP` environment
    /// variable.
    pub dump_tap: Option<PathBuf>,
    pub callbacks: Callbacks,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            lib: Vec::new(),
            switches: Vec::new(),
            exec: None,
            merge: false,
            jobs: 1,
            fork: false,
            formatter: None,
            formatter_class: None,
            verbosity: 0,
            timer: false,
            color: ColorMode::Auto,
            directives: false,
            failures: false,
            errors: false,
            dump_tap: None,
            callbacks: Callbacks::default(),
        }
    }
}

/// Sets the conventional harness environment for the duration of the run.
struct EnvGuard;

impl EnvGuard {
    fn set() -> Self {
        env::set_var("HARNESS_ACTIVE", "1");
        env::set_var("HARNESS_VERSION", env!("CARGO_PKG_VERSION"));
        EnvGuard
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        env::remove_var("HARNESS_ACTIVE");
        env::remove_var("HARNESS_VERSION");
    }
}

/// Everything needed to start one test, shareable across worker threads.
struct Launcher {
    exec: Option<Vec<String>>,
    switches: Vec<String>,
    lib: Vec<String>,
    merge: bool,
    spool_root: Option<PathBuf>,
    callbacks: Callbacks,
}

impl Launcher {
    fn command_for(&self, test: &str) -> Vec<String> {
        if let Some(exec) = &self.exec {
            let mut argv = exec.clone();
            argv.push(test.to_owned());
            return argv;
        }
        if has_exec_bit(test) {
            return vec![test.to_owned()];
        }
        let mut argv = vec!["perl".to_owned()];
        argv.extend(self.switches.iter().cloned());
        argv.extend(self.lib.iter().map(|path| format!("-I{path}")));
        argv.push(test.to_owned());
        argv
    }

    fn make_parser(&self, test: &str) -> Result<Parser> {
        let command = self.command_for(test);
        let source = ProcessSource::spawn(
            command,
            SpawnOptions {
                merge: self.merge,
                ..SpawnOptions::default()
            },
        )?;
        let mut parser = Parser::new(Box::new(source));
        for (event, hook) in &self.callbacks.parser {
            let hook = Arc::clone(hook);
            parser.callback(*event, Box::new(move |result| hook(result)));
        }
        if let Some(root) = &self.spool_root {
            match open_spool(root, test) {
                Ok(spool) => parser.set_spool(spool),
                Err(err) => tracing::warn!("cannot open spool for {test}: {err}"),
            }
        }
        for hook in &self.callbacks.made_parser {
            hook(&mut parser);
        }
        Ok(parser)
    }

    /// Drain one test to completion. Used by pool workers, where results are
    /// rendered later, on the coordinating thread.
    fn run_one(&self, test: &str) -> (Vec<ParseResult>, ParserSummary) {
        match self.make_parser(test) {
            Ok(mut parser) => {
                let results: Vec<_> = parser.by_ref().collect();
                let summary = parser.summary();
                (results, summary)
            }
            Err(err) => (Vec::new(), ParserSummary::spawn_failure(err.to_string())),
        }
    }
}

/// A formatter session in flight, stashed next to its parser.
struct OpenTest {
    name: String,
    session: Box<dyn crate::formatter::Session>,
}

/// The run orchestrator.
///
/// Constructing a harness validates the configuration and sets
/// `HARNESS_ACTIVE` / `HARNESS_VERSION`; both are removed again on drop.
pub struct Harness {
    config: HarnessConfig,
    _env: EnvGuard,
}

impl Harness {
    pub fn new(mut config: HarnessConfig) -> Result<Self> {
        if config.jobs == 0 {
            return Err(Error::Config("jobs must be at least 1".to_owned()));
        }
        if config.exec.as_ref().is_some_and(Vec::is_empty) {
            return Err(Error::Config("exec must name a command".to_owned()));
        }
        if config.formatter.is_none() {
            if let Some(class) = config.formatter_class.as_deref() {
                if class != "console" && class != "silent" {
                    return Err(Error::Config(format!("unknown formatter class '{class}'")));
                }
            }
        }
        let mut seen = HashSet::new();
        config.switches.retain(|switch| seen.insert(switch.clone()));
        Ok(Self {
            config,
            _env: EnvGuard::set(),
        })
    }

    /// Run every named test and aggregate the outcome. A bailout anywhere
    /// aborts the run with [`Error::Bailout`].
    pub fn runtests<S: AsRef<str>>(&mut self, tests: &[S]) -> Result<Aggregator> {
        let names: Vec<String> = tests.iter().map(|t| t.as_ref().to_owned()).collect();
        let launcher = self.launcher();
        let mut formatter = self.take_formatter();
        formatter.prepare(&names);

        let mut aggregator = Aggregator::new();
        aggregator.start();
        for hook in &self.config.callbacks.before_runtests {
            hook(&aggregator);
        }

        let outcome = if self.config.jobs <= 1 {
            run_sequential(&launcher, &names, formatter.as_mut(), &mut aggregator)
        } else if self.config.fork {
            run_forked(
                &launcher,
                self.config.jobs,
                &names,
                formatter.as_mut(),
                &mut aggregator,
            )
        } else {
            run_multiplexed(
                &launcher,
                self.config.jobs,
                &names,
                formatter.as_mut(),
                &mut aggregator,
            )
        };
        outcome?;

        aggregator.stop();
        formatter.summary(&aggregator);
        for hook in &self.config.callbacks.after_runtests {
            hook(&aggregator);
        }
        Ok(aggregator)
    }

    fn launcher(&self) -> Launcher {
        let spool_root = self.config.dump_tap.clone().or_else(|| {
            env::var("TEST_HARNESS_DUMP_TAP")
                .ok()
                .filter(|value| !value.is_empty())
                .map(PathBuf::from)
        });
        Launcher {
            exec: self.config.exec.clone(),
            switches: self.config.switches.clone(),
            lib: self.config.lib.clone(),
            merge: self.config.merge,
            spool_root,
            callbacks: self.config.callbacks.clone(),
        }
    }

    fn take_formatter(&mut self) -> Box<dyn Formatter> {
        if let Some(formatter) = self.config.formatter.take() {
            return formatter;
        }
        if self.config.formatter_class.as_deref() == Some("silent") {
            return Box::new(SilentFormatter);
        }
        let mut console = ConsoleFormatter::new();
        console.verbosity = self.config.verbosity;
        console.color = self.config.color;
        console.timer = self.config.timer;
        console.directives = self.config.directives;
        console.failures = self.config.failures;
        console.errors = self.config.errors;
        Box::new(console)
    }
}

fn run_sequential(
    launcher: &Launcher,
    names: &[String],
    formatter: &mut dyn Formatter,
    aggregator: &mut Aggregator,
) -> Result<()> {
    for name in names {
        let mut session = formatter.open_test(name);
        let mut parser = match launcher.make_parser(name) {
            Ok(parser) => parser,
            Err(err @ Error::Spawn { .. }) => {
                let summary = ParserSummary::spawn_failure(err.to_string());
                session.close_test(&summary);
                aggregator.add(name, summary)?;
                continue;
            }
            Err(err) => return Err(err),
        };
        while let Some(result) = parser.next_result() {
            session.result(&result);
            if let ParseResult::Bailout(bailout) = &result {
                return Err(Error::Bailout(bailout.reason.clone().unwrap_or_default()));
            }
        }
        let summary = parser.summary();
        session.close_test(&summary);
        aggregator.add(name, summary)?;
    }
    Ok(())
}

fn launch_into(
    launcher: &Launcher,
    formatter: &mut dyn Formatter,
    aggregator: &mut Aggregator,
    mux: &mut Multiplexer<OpenTest>,
    name: &str,
) -> Result<()> {
    let mut session = formatter.open_test(name);
    match launcher.make_parser(name) {
        Ok(parser) => {
            mux.add(
                parser,
                OpenTest {
                    name: name.to_owned(),
                    session,
                },
            );
        }
        Err(err @ Error::Spawn { .. }) => {
            let summary = ParserSummary::spawn_failure(err.to_string());
            session.close_test(&summary);
            aggregator.add(name, summary)?;
        }
        Err(err) => return Err(err),
    }
    Ok(())
}

fn run_multiplexed(
    launcher: &Launcher,
    jobs: usize,
    names: &[String],
    formatter: &mut dyn Formatter,
    aggregator: &mut Aggregator,
) -> Result<()> {
    let mut queue = names.iter();
    let mut mux = Multiplexer::new();
    while mux.parsers() < jobs {
        let Some(name) = queue.next() else { break };
        launch_into(launcher, formatter, aggregator, &mut mux, name)?;
    }
    loop {
        // Finished parsers are handled outside the match so the multiplexer
        // is free to be topped up again.
        let finished = match mux.next_ready() {
            None => break,
            Some(Mux::Item(_, open, result)) => {
                open.session.result(&result);
                if let ParseResult::Bailout(bailout) = &result {
                    return Err(Error::Bailout(bailout.reason.clone().unwrap_or_default()));
                }
                None
            }
            Some(Mux::Done(parser, open)) => Some((parser, open)),
        };
        if let Some((parser, mut open)) = finished {
            let summary = parser.summary();
            open.session.close_test(&summary);
            aggregator.add(&open.name, summary)?;
            while mux.parsers() < jobs {
                let Some(name) = queue.next() else { break };
                launch_into(launcher, formatter, aggregator, &mut mux, name)?;
            }
        }
    }
    Ok(())
}

fn run_forked(
    launcher: &Launcher,
    jobs: usize,
    names: &[String],
    formatter: &mut dyn Formatter,
    aggregator: &mut Aggregator,
) -> Result<()> {
    let (work_tx, work_rx) = crossbeam_channel::unbounded::<String>();
    for name in names {
        let _ = work_tx.send(name.clone());
    }
    drop(work_tx);

    let (done_tx, done_rx) =
        crossbeam_channel::unbounded::<(String, Vec<ParseResult>, ParserSummary)>();

    let mut outcome = Ok(());
    std::thread::scope(|scope| {
        for _ in 0..jobs {
            let work_rx = work_rx.clone();
            let done_tx = done_tx.clone();
            scope.spawn(move || {
                while let Ok(name) = work_rx.recv() {
                    let (results, summary) = launcher.run_one(&name);
                    if done_tx.send((name, results, summary)).is_err() {
                        break;
                    }
                }
            });
        }
        drop(done_tx);
        drop(work_rx);

        for (name, results, summary) in done_rx.iter() {
            let mut session = formatter.open_test(&name);
            let mut bailed = None;
            for result in &results {
                session.result(result);
                if let ParseResult::Bailout(bailout) = result {
                    bailed = Some(bailout.reason.clone().unwrap_or_default());
                }
            }
            session.close_test(&summary);
            if let Err(err) = aggregator.add(&name, summary) {
                outcome = Err(err);
                break;
            }
            if let Some(reason) = bailed {
                outcome = Err(Error::Bailout(reason));
                break;
            }
        }
        // Dropping the receiver makes any still-busy worker's send fail, so
        // the pool winds down instead of queueing for nobody.
    });
    outcome
}

fn open_spool(root: &Path, test: &str) -> std::io::Result<Box<dyn Write + Send>> {
    let relative = test.trim_start_matches('/');
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(Box::new(BufWriter::new(fs::File::create(path)?)))
}

fn has_exec_bit(path: &str) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::metadata(path)
            .map(|meta| meta.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        false
    }
}
