//! Process-backed line source.
//!
//! Spawns a test command with stdin closed and both output pipes captured.
//! Each pipe gets its own reader thread feeding a bounded channel, so a
//! chatty stderr can never deadlock against a full stdout buffer. With
//! `merge` both pipes land in the line channel (no line is lost, relative
//! ordering between the two streams is best-effort); without it stderr is
//! forwarded verbatim to a diagnostic sink and only stdout is parsed.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::process::{Child, Command, Stdio};
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::error::{Error, Result};
use crate::source::{chomp, Source};

/// Lines buffered per pipe before a reader thread blocks.
const CHANNEL_CAPACITY: usize = 256;

/// Hook invoked with the full argv, before spawn or after reap.
pub type ProcessHook = Box<dyn FnMut(&[String]) + Send>;

/// Options controlling how a test process is spawned and observed.
pub struct SpawnOptions {
    /// Route stderr into the parsed line stream instead of the sink.
    pub merge: bool,
    /// Invoked with the argv right before the child is spawned.
    pub setup: Option<ProcessHook>,
    /// Invoked with the argv after the child has been reaped.
    pub teardown: Option<ProcessHook>,
    /// Receives stderr lines (newline-terminated) when `merge` is off.
    /// Defaults to this process' stderr.
    pub err_sink: Option<Box<dyn Write + Send>>,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            merge: false,
            setup: None,
            teardown: None,
            err_sink: None,
        }
    }
}

/// A [`Source`] reading the combined output of a child process.
pub struct ProcessSource {
    command: Vec<String>,
    rx: Receiver<String>,
    readers: Vec<JoinHandle<()>>,
    child: Option<Child>,
    teardown: Option<ProcessHook>,
    wait_status: Option<i32>,
    exit_code: Option<i32>,
}

impl std::fmt::Debug for ProcessSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSource")
            .field("command", &self.command)
            .field("rx", &self.rx)
            .field("readers", &self.readers)
            .field("child", &self.child)
            .field("teardown", &self.teardown.is_some())
            .field("wait_status", &self.wait_status)
            .field("exit_code", &self.exit_code)
            .finish()
    }
}

impl ProcessSource {
    /// Spawn `command` and start the pipe readers. Spawn failure is fatal to
    /// the caller; a child that later exits non-zero is not.
    pub fn spawn(command: Vec<String>, mut options: SpawnOptions) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| Error::Config("cannot spawn an empty command".to_owned()))?;

        if let Some(setup) = options.setup.as_mut() {
            setup(&command);
        }

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| Error::Spawn {
                command: command.join(" "),
                source,
            })?;

        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");

        let (tx, rx) = bounded(CHANNEL_CAPACITY);
        let mut readers = vec![spawn_line_reader(stdout, tx.clone())];
        if options.merge {
            readers.push(spawn_line_reader(stderr, tx));
        } else {
            let sink = options
                .err_sink
                .take()
                .unwrap_or_else(|| Box::new(io::stderr()));
            readers.push(spawn_sink_reader(stderr, sink));
        }

        Ok(Self {
            command,
            rx,
            readers,
            child: Some(child),
            teardown: options.teardown.take(),
            wait_status: None,
            exit_code: None,
        })
    }

    /// The argv this source was spawned with.
    pub fn command(&self) -> &[String] {
        &self.command
    }

    fn finish(&mut self) {
        for reader in self.readers.drain(..) {
            let _ = reader.join();
        }
        let Some(mut child) = self.child.take() else {
            return;
        };
        match child.wait() {
            Ok(status) => {
                let (wait, exit) = decode_status(status);
                self.wait_status = Some(wait);
                self.exit_code = Some(exit);
            }
            Err(err) => {
                tracing::warn!("wait on {:?} failed: {err}", self.command);
                self.wait_status = Some(-1);
                self.exit_code = Some(-1);
            }
        }
        if let Some(teardown) = self.teardown.as_mut() {
            teardown(&self.command);
        }
    }
}

impl Source for ProcessSource {
    fn next_line(&mut self) -> Option<String> {
        match self.rx.recv() {
            Ok(line) => Some(line),
            Err(_) => {
                self.finish();
                None
            }
        }
    }

    fn exit(&self) -> Option<i32> {
        self.exit_code
    }

    fn wait(&self) -> Option<i32> {
        self.wait_status
    }

    fn select_recv(&self) -> Option<&Receiver<String>> {
        Some(&self.rx)
    }
}

#[cfg(unix)]
fn decode_status(status: std::process::ExitStatus) -> (i32, i32) {
    use std::os::unix::process::ExitStatusExt;
    let raw = status.into_raw();
    (raw, raw >> 8)
}

#[cfg(not(unix))]
fn decode_status(status: std::process::ExitStatus) -> (i32, i32) {
    let code = status.code().unwrap_or(0);
    (code, code)
}

fn spawn_line_reader<R: Read + Send + 'static>(pipe: R, tx: Sender<String>) -> JoinHandle<()> {
    std::thread::spawn(move || {
        for line in BufReader::new(pipe).lines() {
            match line {
                Ok(line) => {
                    if tx.send(chomp(line)).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    tracing::debug!("read error on child pipe: {err}");
                    break;
                }
            }
        }
    })
}

fn spawn_sink_reader<R: Read + Send + 'static>(
    pipe: R,
    mut sink: Box<dyn Write + Send>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        for line in BufReader::new(pipe).lines() {
            match line {
                Ok(line) => {
                    let line = chomp(line);
                    if writeln!(sink, "{line}").and_then(|()| sink.flush()).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    tracing::debug!("read error on child stderr: {err}");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_owned(), "-c".to_owned(), script.to_owned()]
    }

    fn drain(source: &mut ProcessSource) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(line) = source.next_line() {
            lines.push(line);
        }
        lines
    }

    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn reads_stdout_and_reaps() {
        let mut source =
            ProcessSource::spawn(sh("echo one; echo two; exit 3"), SpawnOptions::default())
                .unwrap();
        assert_eq!(source.exit(), None);
        assert_eq!(drain(&mut source), vec!["one", "two"]);
        assert_eq!(source.exit(), Some(3));
        assert_eq!(source.wait(), Some(3 << 8));
        assert_eq!(source.next_line(), None);
    }

    #[test]
    fn stderr_goes_to_sink_not_stream() {
        let sink = SharedSink::default();
        let options = SpawnOptions {
            err_sink: Some(Box::new(sink.clone())),
            ..SpawnOptions::default()
        };
        let mut source =
            ProcessSource::spawn(sh("echo out; echo diagnostics >&2"), options).unwrap();
        assert_eq!(drain(&mut source), vec!["out"]);
        let captured = String::from_utf8(sink.0.lock().unwrap().clone()).unwrap();
        assert_eq!(captured, "diagnostics\n");
    }

    #[test]
    fn merge_keeps_every_line() {
        let mut source = ProcessSource::spawn(
            sh("echo out; echo err >&2; echo more"),
            SpawnOptions {
                merge: true,
                ..SpawnOptions::default()
            },
        )
        .unwrap();
        let mut lines = drain(&mut source);
        lines.sort();
        assert_eq!(lines, vec!["err", "more", "out"]);
        assert_eq!(source.exit(), Some(0));
    }

    #[test]
    fn hooks_see_the_argv() {
        let seen = Arc::new(Mutex::new(Vec::<String>::new()));
        let setup_seen = Arc::clone(&seen);
        let teardown_seen = Arc::clone(&seen);
        let options = SpawnOptions {
            setup: Some(Box::new(move |argv| {
                setup_seen.lock().unwrap().push(format!("setup {}", argv[0]));
            })),
            teardown: Some(Box::new(move |argv| {
                teardown_seen
                    .lock()
                    .unwrap()
                    .push(format!("teardown {}", argv[0]));
            })),
            ..SpawnOptions::default()
        };
        let mut source = ProcessSource::spawn(sh("true"), options).unwrap();
        drain(&mut source);
        assert_eq!(*seen.lock().unwrap(), vec!["setup sh", "teardown sh"]);
    }

    #[test]
    fn spawn_failure_is_fatal() {
        let err = ProcessSource::spawn(
            vec!["this-command-does-not-exist-hopefully".to_owned()],
            SpawnOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Spawn { .. }));
    }
}
