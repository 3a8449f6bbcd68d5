//! Streaming consumer and harness for the Test Anything Protocol (TAP).
//!
//! The crate is organised around a small pipeline. A [`source::Source`]
//! yields newline-stripped lines (from memory, a file, or a spawned test
//! process), a [`grammar::Grammar`] turns lines into typed [`token::Token`]s,
//! and a [`parser::Parser`] applies TAP semantics on top of the token stream,
//! producing [`result::ParseResult`]s and running statistics.
//!
//! On top of the per-stream machinery sit the run-level pieces: a
//! [`multiplexer::Multiplexer`] that drives many parsers at once, an
//! [`aggregator::Aggregator`] that collects finalized per-test summaries,
//! and a [`harness::Harness`] that ties sources, parsers, formatter and
//! aggregation together.
//!
//! # Examples
//!
//! Parsing a short TAP stream held in memory:
//!
//! ```
//! use tapharness::Parser;
//!
//! let mut parser = Parser::from_tap("1..1\nok 1 - first\n");
//! while let Some(result) = parser.next_result() {
//!     println!("{}", result.raw());
//! }
//! assert_eq!(parser.tests_run(), 1);
//! assert_eq!(parser.passed(), 1);
//! assert!(!parser.has_problems());
//! ```

pub mod aggregator;
pub mod error;
pub mod formatter;
pub mod grammar;
pub mod harness;
pub mod multiplexer;
pub mod parser;
pub mod process;
pub mod result;
pub mod source;
pub mod token;

pub use aggregator::Aggregator;
pub use error::{Error, Result};
pub use formatter::{ColorMode, ConsoleFormatter, Formatter, Session, SilentFormatter};
pub use grammar::Grammar;
pub use harness::{Callbacks, Harness, HarnessConfig};
pub use multiplexer::{Multiplexer, Mux};
pub use parser::{Parser, ParserEvent, ParserSummary};
pub use process::{ProcessSource, SpawnOptions};
pub use result::{ParseResult, TestResult};
pub use source::{ArraySource, FileSource, Source};
pub use token::{BailOut, Comment, Directive, Key, Plan, Test, Token, Unknown, Version, YamlBlock};
