//! Lazy line streams feeding the tokenizer.
//!
//! All sources share one contract: [`Source::next_line`] hands out the next
//! line with the trailing newline (and a tolerated `\r`) stripped, and keeps
//! returning `None` once the stream has ended.

use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::Path;

use crate::error::Result;

/// A lazy sequence of lines.
pub trait Source {
    /// The next line, or `None` at (and forever after) end of stream.
    fn next_line(&mut self) -> Option<String>;

    /// Exit code of a backing process. `None` for plain sources, and for
    /// process sources until the stream has ended.
    fn exit(&self) -> Option<i32> {
        None
    }

    /// Raw wait status of a backing process, same availability as
    /// [`Source::exit`].
    fn wait(&self) -> Option<i32> {
        None
    }

    /// Channel receiver usable for readiness selection across many sources.
    /// `None` for sources that are always ready.
    fn select_recv(&self) -> Option<&crossbeam_channel::Receiver<String>> {
        None
    }
}

/// Finite, deterministic source over lines already in memory.
pub struct ArraySource {
    lines: std::vec::IntoIter<String>,
}

impl ArraySource {
    pub fn new(lines: Vec<String>) -> Self {
        Self {
            lines: lines.into_iter(),
        }
    }

    /// Split a whole TAP document into lines.
    pub fn from_tap(tap: &str) -> Self {
        Self::new(tap.lines().map(str::to_owned).collect())
    }
}

impl Source for ArraySource {
    fn next_line(&mut self) -> Option<String> {
        self.lines.next().map(chomp)
    }
}

/// Reads lines from a file on disk.
pub struct FileSource {
    lines: Lines<BufReader<File>>,
}

impl FileSource {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            lines: BufReader::new(file).lines(),
        })
    }
}

impl Source for FileSource {
    fn next_line(&mut self) -> Option<String> {
        loop {
            match self.lines.next() {
                Some(Ok(line)) => return Some(chomp(line)),
                Some(Err(err)) => {
                    tracing::debug!("read error on file source: {err}");
                    continue;
                }
                None => return None,
            }
        }
    }
}

/// Drop one trailing `\r`, the leftover of CRLF line endings.
pub(crate) fn chomp(mut line: String) -> String {
    if line.ends_with('\r') {
        line.pop();
    }
    line
}
