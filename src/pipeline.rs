//! External command pipelines.
//!
//! Derivations are performed by chains of Netpbm/JPEG tools (`jpegtopnm |
//! pnmscale | cjpeg` and friends). This module provides:
//!
//! - [`Cmd`], a descriptor for one external command: explicit argument
//!   vector (never shell-interpreted), optional working directory, and
//!   extra environment. The `Display` form is the shell-style `a | b | c`
//!   rendering used only for diagnostics.
//! - [`ToolRunner`], the execution seam. The real [`ProcessRunner`] spawns
//!   processes; tests substitute a recording mock (same shape as the
//!   backend trait + mock the imaging modules are tested with).
//!
//! # Execution model
//!
//! Stages run sequentially with fully buffered intermediates: stage *i*'s
//! stdout is collected, then fed as stage *i+1*'s stdin. A stage is judged
//! solely by its exit status; `BrokenPipe` while feeding stdin is ignored
//! because well-behaved tools (`pnmfile` in particular) may close their
//! input after reading only a header. On failure the error carries the
//! command rendering, the exit status, and capped prefixes of the stage's
//! stderr and input.

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;

/// Descriptor for one external command.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Cmd {
    program: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    env: BTreeMap<String, String>,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Cmd {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.to_string_lossy().into_owned());
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn argv(&self) -> &[String] {
        &self.args
    }

    /// Two commands may share a pipeline only when they agree on working
    /// directory and environment.
    fn composes_with(&self, other: &Cmd) -> bool {
        self.cwd == other.cwd && self.env == other.env
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            if arg.contains(char::is_whitespace) || arg.is_empty() {
                write!(f, " '{arg}'")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

/// Shell-style rendering of a whole pipeline, for diagnostics only.
pub fn render_pipeline(cmds: &[Cmd]) -> String {
    cmds.iter()
        .map(Cmd::to_string)
        .collect::<Vec<_>>()
        .join(" | ")
}

/// Executes command pipelines: feed bytes in, collect bytes out.
///
/// The trait exists so every higher layer (byte cache ingestion, metadata
/// probing, the derivation engine) can be exercised against a mock that
/// records pipelines instead of spawning them.
pub trait ToolRunner: Send + Sync {
    fn run_pipeline(&self, cmds: &[Cmd], input: &[u8]) -> Result<Vec<u8>>;
}

/// The real runner, backed by `std::process`.
#[derive(Debug, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        ProcessRunner
    }
}

impl ToolRunner for ProcessRunner {
    fn run_pipeline(&self, cmds: &[Cmd], input: &[u8]) -> Result<Vec<u8>> {
        if cmds.is_empty() {
            return Err(Error::caller("empty pipeline").in_function("run_pipeline"));
        }
        check_composable(cmds)?;

        let mut data = input.to_vec();
        for cmd in cmds {
            data = run_stage(cmd, &data).map_err(|e| {
                let e = e.described(format!("while running {}", render_pipeline(cmds)));
                e.report();
                e
            })?;
        }
        Ok(data)
    }
}

fn check_composable(cmds: &[Cmd]) -> Result<()> {
    let first = &cmds[0];
    for cmd in &cmds[1..] {
        if !first.composes_with(cmd) {
            return Err(Error::caller(format!(
                "cannot compose `{first}` with `{cmd}`: working directory or environment differ"
            )));
        }
    }
    Ok(())
}

fn run_stage(cmd: &Cmd, input: &[u8]) -> Result<Vec<u8>> {
    let mut command = std::process::Command::new(cmd.program());
    command
        .args(cmd.argv())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = &cmd.cwd {
        command.current_dir(dir);
    }
    for (key, value) in &cmd.env {
        command.env(key, value);
    }

    let mut child = command
        .spawn()
        .map_err(|e| Error::io(format!("spawning `{cmd}`: {e}")))?;
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| Error::caller(format!("no stdin handle for `{cmd}`")))?;

    let output = std::thread::scope(|scope| {
        let feeder = scope.spawn(move || {
            // Tolerate the child closing its input early; the exit status
            // decides whether the stage succeeded.
            match stdin.write_all(input) {
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
                other => other,
            }
        });
        let output = child.wait_with_output();
        let fed = feeder.join().unwrap_or_else(|_| {
            Err(std::io::Error::other("stdin feeder panicked"))
        });
        (output, fed)
    });

    let (output, fed) = output;
    let output = output.map_err(|e| Error::io(format!("waiting for `{cmd}`: {e}")))?;
    fed.map_err(|e| {
        Error::io(format!("feeding stdin of `{cmd}`: {e}")).with_input(input)
    })?;

    if !output.status.success() {
        return Err(Error::command(cmd.to_string(), output.status.to_string())
            .with_stderr(&output.stderr)
            .with_input(input));
    }

    Ok(output.stdout)
}
