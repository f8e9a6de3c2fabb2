//! One error type for the whole cache.
//!
//! Failures here cross four boundaries — file I/O, external subprocesses,
//! decoded-metadata parsing, and the persistent store — and a failed
//! derivation is itself a cacheable value (a negative entry that is replayed
//! on later requests). Both facts shape the design:
//!
//! - A single [`Error`] enum is shared by every module, so a derivation
//!   failure can be stored and compared without downcasting.
//! - Context is attached by *nesting*: decorator variants such as
//!   [`Error::InFunction`] and [`Error::WithStderr`] wrap an inner error
//!   rather than flattening it into a string. [`Error::report`] walks the
//!   chain outermost-first and logs one line per layer.
//! - Byte-context decorators keep at most [`CONTEXT_PREFIX_LIMIT`] bytes of
//!   the offending stream, enough to recognize the payload without dragging
//!   a whole image into logs or the store.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Result type alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Maximum number of bytes kept by the `With*` context decorators.
pub const CONTEXT_PREFIX_LIMIT: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum Error {
    /// Underlying OS I/O failure, stringified at the point of capture.
    #[error("i/o error: {0}")]
    Io(String),

    /// Programmer-visible invariant violation (bad geometry, malformed
    /// probe output, incompatible pipeline stages).
    #[error("{0}")]
    Caller(String),

    /// An external command exited non-zero.
    #[error("command failed: {cmd} ({exit})")]
    Command { cmd: String, exit: String },

    /// Prefix of the bytes fed to a failing command.
    #[error("input began: {}", preview(.prefix))]
    WithInput {
        prefix: Vec<u8>,
        source: Box<Error>,
    },

    /// Prefix of what a failing command wrote to stdout.
    #[error("stdout began: {}", preview(.prefix))]
    WithStdout {
        prefix: Vec<u8>,
        source: Box<Error>,
    },

    /// Prefix of what a failing command wrote to stderr.
    #[error("stderr: {}", preview(.prefix))]
    WithStderr {
        prefix: Vec<u8>,
        source: Box<Error>,
    },

    /// Call-site marker.
    #[error("in {name}")]
    InFunction { name: String, source: Box<Error> },

    /// Free-form context attached at a boundary.
    #[error("{text}")]
    Described { text: String, source: Box<Error> },

    /// Catch-all for converted foreign errors.
    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn io(cause: impl fmt::Display) -> Self {
        Error::Io(cause.to_string())
    }

    pub fn caller(message: impl Into<String>) -> Self {
        Error::Caller(message.into())
    }

    pub fn command(cmd: impl Into<String>, exit: impl Into<String>) -> Self {
        Error::Command {
            cmd: cmd.into(),
            exit: exit.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Error::Other(message.into())
    }

    /// Wrap with a prefix of the bytes that were fed to a command.
    pub fn with_input(self, bytes: &[u8]) -> Self {
        Error::WithInput {
            prefix: cap(bytes),
            source: Box::new(self),
        }
    }

    /// Wrap with a prefix of a command's stdout.
    pub fn with_stdout(self, bytes: &[u8]) -> Self {
        Error::WithStdout {
            prefix: cap(bytes),
            source: Box::new(self),
        }
    }

    /// Wrap with a prefix of a command's stderr.
    pub fn with_stderr(self, bytes: &[u8]) -> Self {
        Error::WithStderr {
            prefix: cap(bytes),
            source: Box::new(self),
        }
    }

    /// Wrap with the name of the operation that observed the failure.
    pub fn in_function(self, name: impl Into<String>) -> Self {
        Error::InFunction {
            name: name.into(),
            source: Box::new(self),
        }
    }

    /// Wrap with free-form context.
    pub fn described(self, text: impl Into<String>) -> Self {
        Error::Described {
            text: text.into(),
            source: Box::new(self),
        }
    }

    /// The wrapped error, for decorator variants.
    pub fn inner(&self) -> Option<&Error> {
        match self {
            Error::WithInput { source, .. }
            | Error::WithStdout { source, .. }
            | Error::WithStderr { source, .. }
            | Error::InFunction { source, .. }
            | Error::Described { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Iterate the chain outermost-first, ending at the root cause.
    pub fn layers(&self) -> Layers<'_> {
        Layers {
            current: Some(self),
        }
    }

    /// Log the whole chain at error level, one line per layer.
    pub fn report(&self) {
        for layer in self.layers() {
            tracing::error!("{layer}");
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

/// Iterator over an error chain, outermost layer first.
pub struct Layers<'a> {
    current: Option<&'a Error>,
}

impl<'a> Iterator for Layers<'a> {
    type Item = &'a Error;

    fn next(&mut self) -> Option<&'a Error> {
        let layer = self.current?;
        self.current = layer.inner();
        Some(layer)
    }
}

fn cap(bytes: &[u8]) -> Vec<u8> {
    bytes[..bytes.len().min(CONTEXT_PREFIX_LIMIT)].to_vec()
}

/// Render a byte prefix for display: lossy UTF-8, control characters
/// escaped, trimmed to a log-friendly length.
fn preview(bytes: &[u8]) -> String {
    const DISPLAY_LIMIT: usize = 120;
    let text = String::from_utf8_lossy(bytes);
    let mut out = String::with_capacity(DISPLAY_LIMIT);
    for c in text.chars() {
        if out.len() >= DISPLAY_LIMIT {
            out.push_str("...");
            break;
        }
        match c {
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c if c.is_control() => out.push_str(&format!("\\x{:02x}", c as u32)),
            c => out.push(c),
        }
    }
    out
}
