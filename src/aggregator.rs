//! Run-level aggregation of finalized parser summaries.

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::{Error, Result};
use crate::parser::ParserSummary;

/// Collects per-test summaries for the lifetime of one run, in the order the
/// tests finished.
#[derive(Debug, Default)]
pub struct Aggregator {
    entries: Vec<(String, ParserSummary)>,
    started: Option<Instant>,
    elapsed: Option<Duration>,
}

/// Serializable snapshot of a whole run, used for machine-readable reports.
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub status: String,
    pub files: usize,
    pub tests: u32,
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub todo: u32,
    pub todo_passed: u32,
    pub elapsed_secs: Option<f64>,
    pub results: Vec<(String, ParserSummary)>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the start of the run.
    pub fn start(&mut self) {
        self.started = Some(Instant::now());
    }

    /// Mark the end of the run and freeze the wall-clock time.
    pub fn stop(&mut self) {
        self.elapsed = self.started.map(|s| s.elapsed());
    }

    /// Wall-clock time between [`Aggregator::start`] and
    /// [`Aggregator::stop`].
    pub fn elapsed(&self) -> Option<Duration> {
        self.elapsed
    }

    /// Record a finalized parser under `name`. Names must be unique within
    /// one run.
    pub fn add(&mut self, name: &str, summary: ParserSummary) -> Result<()> {
        if self.get(name).is_some() {
            return Err(Error::Config(format!(
                "already have a summary for '{name}'"
            )));
        }
        self.entries.push((name.to_owned(), summary));
        Ok(())
    }

    /// Test names in completion order.
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&ParserSummary> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, summary)| summary)
    }

    /// Number of test files seen.
    pub fn files(&self) -> usize {
        self.entries.len()
    }

    /// Files without problems.
    pub fn good(&self) -> usize {
        self.entries
            .iter()
            .filter(|(_, s)| !s.has_problems())
            .count()
    }

    /// Files with failed tests or a non-zero wait status.
    pub fn bad(&self) -> usize {
        self.entries
            .iter()
            .filter(|(_, s)| s.failed > 0 || s.wait.unwrap_or(0) != 0)
            .count()
    }

    pub fn total(&self) -> u32 {
        self.sum(|s| s.tests_run)
    }

    pub fn passed(&self) -> u32 {
        self.sum(|s| s.passed)
    }

    pub fn failed(&self) -> u32 {
        self.sum(|s| s.failed)
    }

    pub fn skipped(&self) -> u32 {
        self.sum(|s| s.skipped)
    }

    pub fn todo(&self) -> u32 {
        self.sum(|s| s.todo)
    }

    /// TODO tests that unexpectedly passed across the whole run.
    pub fn todo_passed(&self) -> u32 {
        self.sum(|s| s.todo_passed)
    }

    /// True when anything should fail the run: failed tests, parse errors,
    /// or a non-zero exit/wait status anywhere. Drives the harness exit
    /// code.
    pub fn has_errors(&self) -> bool {
        self.entries.iter().any(|(_, s)| s.has_problems())
    }

    /// [`Aggregator::has_errors`], or bonus TODO passes worth a human look.
    pub fn has_problems(&self) -> bool {
        self.has_errors() || self.todo_passed() > 0
    }

    /// `PASS`, `FAIL` or `NOTESTS`.
    pub fn status(&self) -> &'static str {
        if self.has_errors() {
            "FAIL"
        } else if self.total() == 0 {
            "NOTESTS"
        } else {
            "PASS"
        }
    }

    /// One-line description of the run.
    pub fn description(&self) -> String {
        format!("Result: {}", self.status())
    }

    /// Snapshot for serialization.
    pub fn report(&self) -> RunReport {
        RunReport {
            status: self.status().to_owned(),
            files: self.files(),
            tests: self.total(),
            passed: self.passed(),
            failed: self.failed(),
            skipped: self.skipped(),
            todo: self.todo(),
            todo_passed: self.todo_passed(),
            elapsed_secs: self.elapsed.map(|d| d.as_secs_f64()),
            results: self.entries.clone(),
        }
    }

    fn sum(&self, f: impl Fn(&ParserSummary) -> u32) -> u32 {
        self.entries.iter().map(|(_, s)| f(s)).sum()
    }
}
