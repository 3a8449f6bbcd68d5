//! Result rendering.
//!
//! The harness drives a [`Formatter`] through a small session protocol: one
//! [`Session`] per test file receives that file's results in order and is
//! closed with the finalized summary; cross-test output (the final tally)
//! goes through [`Formatter::summary`]. The bundled [`ConsoleFormatter`]
//! renders the classic one-line-per-file view.

use std::time::Instant;

use console::style;

use crate::aggregator::Aggregator;
use crate::parser::ParserSummary;
use crate::result::ParseResult;

/// When to emit ANSI color.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ColorMode {
    /// Color when stdout is a terminal.
    #[default]
    Auto,
    Always,
    Never,
}

/// Per-test rendering state.
pub trait Session {
    /// Called with every result of the session's test, in source order.
    fn result(&mut self, result: &ParseResult);

    /// Called once the test's parser has finalized.
    fn close_test(&mut self, summary: &ParserSummary);
}

/// Run-level rendering.
pub trait Formatter {
    /// Announce the full list of test names before anything runs.
    fn prepare(&mut self, names: &[String]);

    /// Open the session for one test file.
    fn open_test(&mut self, name: &str) -> Box<dyn Session>;

    /// Render the end-of-run tally.
    fn summary(&mut self, aggregator: &Aggregator);
}

/// Console renderer.
///
/// Verbosity levels: `1` echoes every TAP line, `0` is the normal one line
/// per file, `-1` only reports problem files, `-2` only the final summary,
/// `-3` nothing at all.
#[derive(Clone, Debug)]
pub struct ConsoleFormatter {
    pub verbosity: i8,
    pub color: ColorMode,
    pub timer: bool,
    pub directives: bool,
    pub failures: bool,
    pub errors: bool,
    width: usize,
}

impl ConsoleFormatter {
    pub fn new() -> Self {
        Self {
            verbosity: 0,
            color: ColorMode::Auto,
            timer: false,
            directives: false,
            failures: false,
            errors: false,
            width: 0,
        }
    }
}

impl Default for ConsoleFormatter {
    fn default() -> Self {
        Self::new()
    }
}

impl Formatter for ConsoleFormatter {
    fn prepare(&mut self, names: &[String]) {
        match self.color {
            ColorMode::Always => console::set_colors_enabled(true),
            ColorMode::Never => console::set_colors_enabled(false),
            ColorMode::Auto => {}
        }
        self.width = names.iter().map(|n| n.len()).max().unwrap_or(0);
    }

    fn open_test(&mut self, name: &str) -> Box<dyn Session> {
        Box::new(ConsoleSession {
            name: name.to_owned(),
            verbosity: self.verbosity,
            timer: self.timer,
            directives: self.directives,
            failures: self.failures,
            errors: self.errors,
            width: self.width,
            started: Instant::now(),
            failed: Vec::new(),
        })
    }

    fn summary(&mut self, aggregator: &Aggregator) {
        if self.verbosity < -2 {
            return;
        }
        for name in aggregator.names() {
            let Some(summary) = aggregator.get(name) else {
                continue;
            };
            if !summary.has_problems() {
                continue;
            }
            println!(
                "{name} (Wstat: {wait} Tests: {run} Failed: {failed})",
                wait = summary.wait.unwrap_or(0),
                run = summary.tests_run,
                failed = summary.failed,
            );
            for error in &summary.parse_errors {
                println!("  Parse error: {error}");
            }
        }
        let elapsed = aggregator
            .elapsed()
            .map(|d| format!("{:.2}", d.as_secs_f64()))
            .unwrap_or_else(|| "?".to_owned());
        println!(
            "Files={}, Tests={}, {elapsed} wallclock secs",
            aggregator.files(),
            aggregator.total(),
        );
        let status = aggregator.status();
        let styled = match status {
            "PASS" => style(status).green(),
            "FAIL" => style(status).red(),
            _ => style(status).yellow(),
        };
        println!("Result: {styled}");
    }
}

struct ConsoleSession {
    name: String,
    verbosity: i8,
    timer: bool,
    directives: bool,
    failures: bool,
    errors: bool,
    width: usize,
    started: Instant,
    failed: Vec<u32>,
}

impl Session for ConsoleSession {
    fn result(&mut self, result: &ParseResult) {
        if let Some(test) = result.as_test() {
            if !test.is_ok() {
                self.failed.push(test.number);
            }
        }
        if self.verbosity >= 1 {
            println!("{}", result.raw());
        } else if self.directives && self.verbosity >= 0 {
            if result.as_test().is_some_and(|t| t.directive.is_some()) {
                println!("{}: {}", self.name, result.raw());
            }
        }
    }

    fn close_test(&mut self, summary: &ParserSummary) {
        let problems = summary.has_problems();
        if self.verbosity < 0 && !(problems && self.verbosity == -1) {
            return;
        }
        let mut status = if let Some(reason) = summary.skip_all.as_deref() {
            if reason.is_empty() {
                "skipped".to_owned()
            } else {
                format!("skipped: {reason}")
            }
        } else if problems {
            format!(
                "{}",
                style(format!(
                    "Failed {}/{} subtests",
                    summary.failed, summary.tests_run
                ))
                .red()
            )
        } else {
            format!("{}", style("ok").green())
        };
        if self.timer {
            status = format!("{status} {:>5} ms", self.started.elapsed().as_millis());
        }
        println!("{:<width$} .. {status}", self.name, width = self.width);
        if self.failures && !self.failed.is_empty() {
            let list = self
                .failed
                .iter()
                .map(u32::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            println!("  Failed tests: {list}");
        }
        if self.errors {
            for error in &summary.parse_errors {
                println!("  Parse error: {error}");
            }
        }
    }
}

/// Discards everything; used when the caller only wants the aggregate.
#[derive(Debug, Default)]
pub struct SilentFormatter;

struct SilentSession;

impl Session for SilentSession {
    fn result(&mut self, _result: &ParseResult) {}

    fn close_test(&mut self, _summary: &ParserSummary) {}
}

impl Formatter for SilentFormatter {
    fn prepare(&mut self, _names: &[String]) {}

    fn open_test(&mut self, _name: &str) -> Box<dyn Session> {
        Box::new(SilentSession)
    }

    fn summary(&mut self, _aggregator: &Aggregator) {}
}
