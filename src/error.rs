use std::io;

use thiserror::Error;

/// Errors raised by the harness and the stream machinery.
///
/// Malformed TAP is deliberately *not* represented here. The parser records
/// recoverable problems in [`crate::Parser::parse_errors`] and keeps going,
/// because the usual source of broken TAP is a test under debugging.
#[derive(Debug, Error)]
pub enum Error {
    /// Harness configuration rejected before any test is started.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A callback was registered under a name outside the accepted set.
    #[error("unknown callback event '{0}'")]
    UnknownCallback(String),

    /// The grammar has no rule table for the requested TAP version.
    #[error("Unsupported syntax version {0}")]
    UnsupportedVersion(u32),

    /// A test command could not be spawned at all.
    #[error("could not execute ({command}): {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    /// A test asked for the whole run to stop.
    #[error("Bail out!  {0}")]
    Bailout(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
