//! The TAP parser state machine.
//!
//! A [`Parser`] drives a [`Grammar`] over a line source and emits
//! [`ParseResult`]s with plan, numbering and directive semantics applied.
//! Malformed input is recorded in [`Parser::parse_errors`] and parsing
//! continues; only the surrounding machinery (spawn failures, bad
//! configuration) raises [`crate::Error`].

use std::fmt;
use std::io::Write;
use std::path::Path;
use std::str::FromStr;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::grammar::Grammar;
use crate::process::{ProcessSource, SpawnOptions};
use crate::result::{ParseResult, TestResult};
use crate::source::{ArraySource, FileSource, Source};
use crate::token::Token;

/// Events a parser callback can attach to.
///
/// `Else` fires for results with no type-specific callback registered;
/// `All` fires for every result, after the others.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ParserEvent {
    Version,
    Plan,
    Test,
    Comment,
    Bailout,
    Yaml,
    Unknown,
    Else,
    All,
}

impl ParserEvent {
    fn of(result: &ParseResult) -> Self {
        match result {
            ParseResult::Version(_) => ParserEvent::Version,
            ParseResult::Plan(_) => ParserEvent::Plan,
            ParseResult::Test(_) => ParserEvent::Test,
            ParseResult::Comment(_) => ParserEvent::Comment,
            ParseResult::Bailout(_) => ParserEvent::Bailout,
            ParseResult::Yaml(_) => ParserEvent::Yaml,
            ParseResult::Unknown(_) => ParserEvent::Unknown,
        }
    }
}

impl FromStr for ParserEvent {
    type Err = Error;

    /// Accepts the lowercase token-kind names plus the literal `ELSE` and
    /// `ALL`; anything else is rejected at registration time.
    fn from_str(name: &str) -> Result<Self> {
        match name {
            "version" => Ok(ParserEvent::Version),
            "plan" => Ok(ParserEvent::Plan),
            "test" => Ok(ParserEvent::Test),
            "comment" => Ok(ParserEvent::Comment),
            "bailout" => Ok(ParserEvent::Bailout),
            "yaml" => Ok(ParserEvent::Yaml),
            "unknown" => Ok(ParserEvent::Unknown),
            "ELSE" => Ok(ParserEvent::Else),
            "ALL" => Ok(ParserEvent::All),
            _ => Err(Error::UnknownCallback(name.to_owned())),
        }
    }
}

/// Handler invoked with each emitted result.
pub type ResultCallback = Box<dyn FnMut(&ParseResult) + Send>;

/// Finalized statistics of one parser, as handed to the aggregator.
#[derive(Clone, Debug, Serialize)]
pub struct ParserSummary {
    pub tests_run: u32,
    pub planned: Option<u32>,
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub todo: u32,
    pub todo_passed: u32,
    pub parse_errors: Vec<String>,
    pub exit: Option<i32>,
    pub wait: Option<i32>,
    pub skip_all: Option<String>,
    pub is_good_plan: Option<bool>,
    pub bailed_out: bool,
}

impl ParserSummary {
    /// Anything that should make the run fail: failed tests, parse errors,
    /// or a non-zero exit/wait status.
    pub fn has_problems(&self) -> bool {
        self.failed > 0
            || !self.parse_errors.is_empty()
            || self.exit.unwrap_or(0) != 0
            || self.wait.unwrap_or(0) != 0
    }

    /// Summary for a test whose process never started.
    pub(crate) fn spawn_failure(message: String) -> Self {
        Self {
            tests_run: 0,
            planned: None,
            passed: 0,
            failed: 0,
            skipped: 0,
            todo: 0,
            todo_passed: 0,
            parse_errors: vec![message],
            exit: Some(-1),
            wait: Some(-1),
            skip_all: None,
            is_good_plan: Some(false),
            bailed_out: false,
        }
    }
}

/// Streaming TAP parser.
///
/// # Examples
///
/// ```
/// use tapharness::Parser;
///
/// let tap = "1..3\nok 1\nnot ok 2 - broken # TODO needs fix\nok 3 # SKIP no platform\n";
/// let mut parser = Parser::from_tap(tap);
/// let results: Vec<_> = parser.by_ref().collect();
/// assert_eq!(results.len(), 4);
/// assert_eq!(parser.passed(), 3);
/// assert_eq!(parser.todo(), 1);
/// assert_eq!(parser.skipped(), 1);
/// assert_eq!(parser.failed(), 0);
/// ```
pub struct Parser {
    grammar: Grammar,
    planned: Option<u32>,
    plan_after_tests: bool,
    tests_after_plan: bool,
    next_expected: u32,
    tests_run: u32,
    passed: u32,
    failed: u32,
    skipped: u32,
    todo: u32,
    todo_passed: u32,
    parse_errors: Vec<String>,
    skip_all: Option<String>,
    bailed_out: bool,
    finished: bool,
    good_plan: Option<bool>,
    last_was_test: bool,
    exit: Option<i32>,
    wait: Option<i32>,
    spool: Option<Box<dyn Write + Send>>,
    callbacks: Vec<(ParserEvent, ResultCallback)>,
}

impl Parser {
    pub fn new(source: Box<dyn Source + Send>) -> Self {
        Self {
            grammar: Grammar::new(source),
            planned: None,
            plan_after_tests: false,
            tests_after_plan: false,
            next_expected: 1,
            tests_run: 0,
            passed: 0,
            failed: 0,
            skipped: 0,
            todo: 0,
            todo_passed: 0,
            parse_errors: Vec::new(),
            skip_all: None,
            bailed_out: false,
            finished: false,
            good_plan: None,
            last_was_test: false,
            exit: None,
            wait: None,
            spool: None,
            callbacks: Vec::new(),
        }
    }

    /// Parse a TAP document held in memory.
    pub fn from_tap(tap: &str) -> Self {
        Self::new(Box::new(ArraySource::from_tap(tap)))
    }

    pub fn from_lines(lines: Vec<String>) -> Self {
        Self::new(Box::new(ArraySource::new(lines)))
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::new(Box::new(FileSource::open(path)?)))
    }

    /// Spawn `command` and parse its output as TAP.
    pub fn from_command(command: Vec<String>, options: SpawnOptions) -> Result<Self> {
        Ok(Self::new(Box::new(ProcessSource::spawn(command, options)?)))
    }

    /// Register `callback` for `event`. Callbacks fire in registration
    /// order: type-specific handlers first, `Else` when none matched, `All`
    /// unconditionally last.
    pub fn callback(&mut self, event: ParserEvent, callback: ResultCallback) {
        self.callbacks.push((event, callback));
    }

    /// Register a callback under its event name, validating the name.
    pub fn callback_named(&mut self, name: &str, callback: ResultCallback) -> Result<()> {
        let event = name.parse()?;
        self.callback(event, callback);
        Ok(())
    }

    /// Attach a writer that receives a verbatim, newline-terminated copy of
    /// every consumed line.
    pub fn set_spool(&mut self, spool: Box<dyn Write + Send>) {
        self.spool = Some(spool);
    }

    /// The next result, or `None` once the stream has ended (terminal).
    pub fn next_result(&mut self) -> Option<ParseResult> {
        if self.finished {
            return None;
        }
        if self.bailed_out {
            self.finalize();
            return None;
        }
        let Some(token) = self.grammar.next_token() else {
            self.finalize();
            return None;
        };
        let result = self.apply(token);
        if let Some(spool) = self.spool.as_mut() {
            if let Err(err) = writeln!(spool, "{}", result.raw()) {
                tracing::warn!("spool write failed, disabling spool: {err}");
                self.spool = None;
            }
        }
        self.fire(&result);
        Some(result)
    }

    fn apply(&mut self, token: Token) -> ParseResult {
        let mut is_test = false;
        let result = match token {
            Token::Version(version) => {
                if self.tests_run > 0 || self.planned.is_some() {
                    self.parse_error("If the TAP version is present it must be the first line of output");
                } else if version.version < 13 {
                    self.parse_error("Explicit TAP version must be at least 13");
                } else if let Err(err) = self.grammar.set_version(version.version) {
                    self.parse_error(err.to_string());
                }
                ParseResult::Version(version)
            }
            Token::Plan(plan) => {
                if self.planned.is_some() {
                    self.parse_error("More than one plan found in TAP output");
                } else {
                    if plan.has_skip() && plan.planned > 0 {
                        tracing::warn!(
                            planned = plan.planned,
                            "plan carries a SKIP directive but still declares tests"
                        );
                    }
                    if plan.is_skip_all() {
                        self.skip_all = Some(
                            plan.directive
                                .as_ref()
                                .map(|d| d.explanation().to_owned())
                                .unwrap_or_default(),
                        );
                    }
                    self.plan_after_tests = self.tests_run > 0;
                    self.planned = Some(plan.planned);
                }
                ParseResult::Plan(plan)
            }
            Token::Test(test) => {
                is_test = true;
                let assigned = self.next_expected;
                if let Some(found) = test.number {
                    if found != assigned {
                        self.parse_error(format!(
                            "Tests out of sequence.  Found ({found}) but expected ({assigned})"
                        ));
                    }
                }
                self.next_expected += 1;
                self.tests_run += 1;
                if self.planned.is_some() {
                    self.tests_after_plan = true;
                }
                let result = TestResult::from_token(test, assigned);
                if result.has_skip() {
                    self.skipped += 1;
                }
                if result.has_todo() {
                    self.todo += 1;
                    if result.ok {
                        self.todo_passed += 1;
                    }
                }
                if result.is_ok() {
                    self.passed += 1;
                } else {
                    self.failed += 1;
                }
                ParseResult::Test(result)
            }
            Token::Bailout(bailout) => {
                self.bailed_out = true;
                ParseResult::Bailout(bailout)
            }
            Token::Yaml(block) => {
                if !self.last_was_test {
                    self.parse_error("Unexpected structured diagnostic");
                }
                if block.payload.is_none() {
                    self.parse_error("Malformed structured diagnostic");
                }
                ParseResult::Yaml(block)
            }
            Token::Comment(comment) => ParseResult::Comment(comment),
            Token::Unknown(unknown) => ParseResult::Unknown(unknown),
        };
        self.last_was_test = is_test;
        result
    }

    fn fire(&mut self, result: &ParseResult) {
        let kind = ParserEvent::of(result);
        let mut fired = false;
        for (event, callback) in self.callbacks.iter_mut() {
            if *event == kind {
                callback(result);
                fired = true;
            }
        }
        if !fired {
            for (event, callback) in self.callbacks.iter_mut() {
                if *event == ParserEvent::Else {
                    callback(result);
                }
            }
        }
        for (event, callback) in self.callbacks.iter_mut() {
            if *event == ParserEvent::All {
                callback(result);
            }
        }
    }

    fn finalize(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.exit = self.grammar.exit();
        self.wait = self.grammar.wait();
        if let Some(mut spool) = self.spool.take() {
            let _ = spool.flush();
        }
        // A bailed-out stream was terminated on purpose; judging its plan
        // would only bury the bailout under noise.
        if !self.bailed_out {
            match self.planned {
                None => {
                    if self.tests_run > 0 {
                        self.parse_error("No plan found in TAP output");
                    }
                }
                Some(planned) => {
                    if self.plan_after_tests && self.tests_after_plan {
                        self.parse_error(format!(
                            "Plan (1..{planned}) must be at the beginning or end of the TAP output"
                        ));
                    }
                    if planned != self.tests_run {
                        self.parse_error(format!(
                            "Bad plan.  You planned {planned} tests but ran {}.",
                            self.tests_run
                        ));
                    }
                }
            }
        }
        self.good_plan = Some(self.planned == Some(self.tests_run));
    }

    fn parse_error(&mut self, message: impl Into<String>) {
        self.parse_errors.push(message.into());
    }

    pub fn tests_run(&self) -> u32 {
        self.tests_run
    }

    pub fn planned_tests(&self) -> Option<u32> {
        self.planned
    }

    pub fn passed(&self) -> u32 {
        self.passed
    }

    pub fn failed(&self) -> u32 {
        self.failed
    }

    pub fn skipped(&self) -> u32 {
        self.skipped
    }

    pub fn todo(&self) -> u32 {
        self.todo
    }

    /// TODO tests that unexpectedly passed ("bonus" tests).
    pub fn todo_passed(&self) -> u32 {
        self.todo_passed
    }

    pub fn parse_errors(&self) -> &[String] {
        &self.parse_errors
    }

    /// Explanation of a `1..0 # SKIP` plan, when the file opted out.
    pub fn skip_all(&self) -> Option<&str> {
        self.skip_all.as_deref()
    }

    pub fn bailed_out(&self) -> bool {
        self.bailed_out
    }

    /// Exit code of the backing process, available after the stream ended.
    pub fn exit(&self) -> Option<i32> {
        self.exit
    }

    /// Raw wait status of the backing process, available after the stream
    /// ended.
    pub fn wait(&self) -> Option<i32> {
        self.wait
    }

    /// The grammar's active TAP syntax version.
    pub fn version(&self) -> u32 {
        self.grammar.version()
    }

    /// `Some(true)` once the stream ended with a plan matching the number of
    /// tests run.
    pub fn is_good_plan(&self) -> Option<bool> {
        self.good_plan
    }

    pub fn has_problems(&self) -> bool {
        self.failed > 0
            || !self.parse_errors.is_empty()
            || self.exit.unwrap_or(0) != 0
            || self.wait.unwrap_or(0) != 0
    }

    pub fn summary(&self) -> ParserSummary {
        ParserSummary {
            tests_run: self.tests_run,
            planned: self.planned,
            passed: self.passed,
            failed: self.failed,
            skipped: self.skipped,
            todo: self.todo,
            todo_passed: self.todo_passed,
            parse_errors: self.parse_errors.clone(),
            exit: self.exit,
            wait: self.wait,
            skip_all: self.skip_all.clone(),
            is_good_plan: self.good_plan,
            bailed_out: self.bailed_out,
        }
    }

    /// True when the next result needs no blocking read: the parser is done,
    /// holds a buffered line, or reads from an always-ready source.
    pub(crate) fn is_avid(&self) -> bool {
        self.finished
            || self.bailed_out
            || self.grammar.has_buffered()
            || self.grammar.select_recv().is_none()
    }

    pub(crate) fn select_recv(&self) -> Option<&crossbeam_channel::Receiver<String>> {
        self.grammar.select_recv()
    }
}

impl Iterator for Parser {
    type Item = ParseResult;

    fn next(&mut self) -> Option<ParseResult> {
        self.next_result()
    }
}

impl fmt::Debug for Parser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parser")
            .field("tests_run", &self.tests_run)
            .field("passed", &self.passed)
            .field("failed", &self.failed)
            .field("parse_errors", &self.parse_errors)
            .field("finished", &self.finished)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    fn drain(parser: &mut Parser) -> Vec<ParseResult> {
        parser.by_ref().collect()
    }

    #[test]
    fn callback_precedence() {
        let log = Arc::new(Mutex::new(Vec::<String>::new()));
        let mut parser = Parser::from_tap("1..1\nok 1\n# note\n");
        for (event, tag) in [
            (ParserEvent::Test, "test"),
            (ParserEvent::Else, "else"),
            (ParserEvent::All, "all"),
        ] {
            let log = Arc::clone(&log);
            parser.callback(
                event,
                Box::new(move |result| {
                    log.lock().unwrap().push(format!("{tag}:{}", result.raw()));
                }),
            );
        }
        drain(&mut parser);
        let log = log.lock().unwrap();
        assert_eq!(
            *log,
            vec![
                "else:1..1",
                "all:1..1",
                "test:ok 1",
                "all:ok 1",
                "else:# note",
                "all:# note",
            ]
        );
    }

    #[test]
    fn callback_names_are_validated() {
        let mut parser = Parser::from_tap("1..0 # SKIP\n");
        assert!(parser.callback_named("test", Box::new(|_| {})).is_ok());
        assert!(matches!(
            parser.callback_named("exploded", Box::new(|_| {})),
            Err(Error::UnknownCallback(name)) if name == "exploded"
        ));
    }

    #[test]
    fn skip_all_plan_is_exposed() {
        let mut parser = Parser::from_tap("1..0 # SKIP no sockets\n");
        drain(&mut parser);
        assert_eq!(parser.skip_all(), Some("no sockets"));
        assert_eq!(parser.is_good_plan(), Some(true));
        assert!(!parser.has_problems());
    }

    #[test]
    fn version_must_be_at_least_13() {
        let mut parser = Parser::from_tap("TAP version 12\nok 1\n1..1\n");
        drain(&mut parser);
        assert_eq!(
            parser.parse_errors(),
            ["Explicit TAP version must be at least 13"]
        );
        assert_eq!(parser.version(), 12);

        let mut parser = Parser::from_tap("TAP version 13\n1..1\nok 1\n");
        drain(&mut parser);
        assert_eq!(parser.parse_errors(), Vec::<String>::new());
        assert_eq!(parser.version(), 13);
    }

    #[test]
    fn yaml_without_test_is_flagged() {
        let mut parser = Parser::from_tap("TAP version 13\n1..1\n  ---\n  note: hi\n  ...\nok 1\n");
        drain(&mut parser);
        assert_eq!(parser.parse_errors(), ["Unexpected structured diagnostic"]);
    }

    #[test]
    fn spool_copies_the_stream() {
        #[derive(Clone, Default)]
        struct SharedSink(Arc<Mutex<Vec<u8>>>);
        impl Write for SharedSink {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let sink = SharedSink::default();
        let mut parser = Parser::from_tap("1..1\nok 1 - first\n");
        parser.set_spool(Box::new(sink.clone()));
        drain(&mut parser);
        let spooled = String::from_utf8(sink.0.lock().unwrap().clone()).unwrap();
        assert_eq!(spooled, "1..1\nok 1 - first\n");
    }
}
