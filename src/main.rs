use std::fs::File;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use tapharness::{ColorMode, Error, Harness, HarnessConfig};

#[derive(Default, Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Color {
    #[default]
    Auto,
    Always,
    Never,
}

impl From<Color> for ColorMode {
    fn from(color: Color) -> Self {
        match color {
            Color::Auto => ColorMode::Auto,
            Color::Always => ColorMode::Always,
            Color::Never => ColorMode::Never,
        }
    }
}

#[derive(Parser, Debug)]
#[clap(about, version, author)]
struct Opt {
    /// Test scripts to run.
    #[clap(required = true, num_args = 1..)]
    tests: Vec<String>,

    /// Number of tests to keep in flight.
    #[clap(short, long, default_value_t = 1)]
    jobs: usize,

    /// With more than one job, run each test in a pool worker instead of
    /// multiplexing their output streams.
    #[clap(long)]
    fork: bool,

    /// Merge each test's stderr into its TAP stream.
    #[clap(long)]
    merge: bool,

    /// Command prefix used to run every test, e.g. "sh -x". Split with
    /// shell quoting rules; disables the interpreter heuristics.
    #[clap(short, long)]
    exec: Option<String>,

    /// Library path handed to the interpreter as -I<path>. May be repeated.
    #[clap(short = 'I', long = "lib")]
    lib: Vec<String>,

    /// Extra interpreter switch. May be repeated; duplicates collapse.
    #[clap(long)]
    switches: Vec<String>,

    /// Echo every TAP line as it is parsed.
    #[clap(short, long)]
    verbose: bool,

    /// Quieter output; twice keeps only the final summary, three times
    /// silences the formatter entirely.
    #[clap(short, long, action = ArgAction::Count)]
    quiet: u8,

    /// Keep only the final summary; shorthand for -qq.
    #[clap(short = 'Q', long)]
    really_quiet: bool,

    /// Whether to enable colorful output.
    #[clap(long, value_enum, default_value_t, value_name = "WHEN")]
    color: Color,

    /// Show per-test wall-clock time.
    #[clap(long)]
    timer: bool,

    /// Echo TODO and SKIP test lines even when not verbose.
    #[clap(long)]
    directives: bool,

    /// List the failed test numbers under each failing file.
    #[clap(long)]
    failures: bool,

    /// Report parse errors under each test as it finishes.
    #[clap(long)]
    errors: bool,

    /// Write a JSON report of the aggregated run to this path.
    #[clap(long)]
    json: Option<PathBuf>,

    /// Copy each test's TAP output verbatim below this directory
    /// (overrides TEST_HARNESS_DUMP_TAP).
    #[clap(long = "dump-tap")]
    dump_tap: Option<PathBuf>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let opt = Opt::parse();
    match run(opt) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(255);
        }
    }
}

fn run(opt: Opt) -> Result<i32> {
    let quiet = opt.quiet.max(if opt.really_quiet { 2 } else { 0 });
    let verbosity = if opt.verbose {
        1
    } else {
        -i8::try_from(quiet.min(3)).unwrap_or(3)
    };
    let exec = opt
        .exec
        .as_deref()
        .map(shell_words::split)
        .transpose()
        .context("cannot parse the --exec command line")?;
    let config = HarnessConfig {
        lib: opt.lib,
        switches: opt.switches,
        exec,
        merge: opt.merge,
        jobs: opt.jobs,
        fork: opt.fork,
        verbosity,
        timer: opt.timer,
        color: opt.color.into(),
        directives: opt.directives,
        failures: opt.failures,
        errors: opt.errors,
        dump_tap: opt.dump_tap,
        ..HarnessConfig::default()
    };

    let mut harness = Harness::new(config)?;
    match harness.runtests(&opt.tests) {
        Ok(aggregator) => {
            if let Some(path) = &opt.json {
                let file = File::create(path)
                    .with_context(|| format!("cannot create {}", path.display()))?;
                serde_json::to_writer_pretty(file, &aggregator.report())
                    .context("cannot serialize the run report")?;
            }
            Ok(if aggregator.has_errors() { 1 } else { 0 })
        }
        Err(Error::Bailout(reason)) => {
            eprintln!("FAILED--Further testing stopped: {reason}");
            Ok(1)
        }
        Err(err) => Err(err.into()),
    }
}
