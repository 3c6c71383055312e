//! External command execution.
//!
//! Every host tool the pipeline drives (partitioners, formatters, mount,
//! bootloader installers) goes through [`Cmd`]. Commands execute through a
//! [`CommandRunner`]; the default runner spawns real processes, and a
//! per-thread override lets callers capture or replace execution.
//!
//! # Example
//!
//! ```rust,ignore
//! use disk_image_builder::process::Cmd;
//!
//! let out = Cmd::new("blkid")
//!     .args(["-s", "UUID", "-o", "value"])
//!     .arg("/dev/loop0p1")
//!     .error_msg("blkid failed")
//!     .run()?;
//! println!("uuid: {}", out.stdout.trim());
//! ```

use crate::error::{Error, Result};
use std::cell::RefCell;
use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};
use std::rc::Rc;
use tracing::debug;

/// A fully described command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<String>,
}

impl Invocation {
    /// Shell-like rendering used for logs and assertions.
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code, `None` when killed by a signal.
    pub status: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Executes invocations.
pub trait CommandRunner {
    fn run(&self, invocation: &Invocation) -> std::io::Result<CommandOutput>;
}

/// Spawns real host processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, invocation: &Invocation) -> std::io::Result<CommandOutput> {
        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if invocation.stdin.is_some() {
            command.stdin(Stdio::piped());
        } else {
            command.stdin(Stdio::null());
        }

        let mut child = command.spawn()?;
        if let Some(input) = &invocation.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(input.as_bytes())?;
            }
        }
        let output = child.wait_with_output()?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            status: output.status.code(),
        })
    }
}

thread_local! {
    static THREAD_RUNNER: RefCell<Option<Rc<dyn CommandRunner>>> = const { RefCell::new(None) };
}

/// Restores the previous runner when dropped.
pub struct RunnerGuard {
    previous: Option<Rc<dyn CommandRunner>>,
}

impl Drop for RunnerGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        THREAD_RUNNER.with(|slot| *slot.borrow_mut() = previous);
    }
}

/// Route every [`Cmd`] on the current thread through `runner` until the
/// returned guard is dropped.
pub fn set_thread_runner(runner: Rc<dyn CommandRunner>) -> RunnerGuard {
    let previous = THREAD_RUNNER.with(|slot| slot.borrow_mut().replace(runner));
    RunnerGuard { previous }
}

fn dispatch(invocation: &Invocation) -> std::io::Result<CommandOutput> {
    let runner = THREAD_RUNNER.with(|slot| slot.borrow().clone());
    match runner {
        Some(runner) => runner.run(invocation),
        None => SystemRunner.run(invocation),
    }
}

/// Command builder.
#[derive(Debug, Clone)]
pub struct Cmd {
    program: String,
    args: Vec<String>,
    stdin: Option<String>,
    error_msg: Option<String>,
    allow_fail: bool,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
            error_msg: None,
            allow_fail: false,
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

    /// Text fed to the command's standard input.
    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Context message used when the command fails.
    pub fn error_msg(mut self, msg: impl Into<String>) -> Self {
        self.error_msg = Some(msg.into());
        self
    }

    /// Return the output instead of an error on non-zero exit.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    pub fn run(self) -> Result<CommandOutput> {
        let invocation = Invocation {
            program: self.program,
            args: self.args,
            stdin: self.stdin,
        };
        debug!("$ {}", invocation.command_line());

        let message = self
            .error_msg
            .unwrap_or_else(|| format!("Failed to run {}", invocation.program));

        let output = match dispatch(&invocation) {
            Ok(output) => output,
            Err(e) if self.allow_fail => {
                return Ok(CommandOutput {
                    stdout: String::new(),
                    stderr: e.to_string(),
                    status: None,
                })
            }
            Err(e) => {
                return Err(Error::Command {
                    tool: invocation.program,
                    message,
                    code: None,
                    output: e.to_string(),
                })
            }
        };

        if !output.success() && !self.allow_fail {
            let text = if output.stderr.trim().is_empty() {
                output.stdout.trim().to_string()
            } else {
                output.stderr.trim().to_string()
            };
            return Err(Error::Command {
                tool: invocation.program,
                message,
                code: output.status,
                output: text,
            });
        }

        Ok(output)
    }
}
