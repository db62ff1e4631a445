// SPDX-License-Identifier: GPL-3.0-only

//! External tool invocation.
//!
//! Every subprocess the engine starts (`mkfs.*`, `cryptsetup`, `lvm`, ...) goes
//! through a [`CommandRunner`], so tests can substitute a recording double and
//! shutdown can kill whatever is still running.

use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, TryRecvError};
use tracing::debug;

use crate::{Result, SysError};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutcome {
    pub command: String,
    pub stdout: String,
    pub stderr: String,
}

pub fn render(command: &str, args: &[&str]) -> String {
    if args.is_empty() {
        command.to_string()
    } else {
        format!("{} {}", command, args.join(" "))
    }
}

pub trait CommandRunner: Send + Sync {
    /// Run `command` to completion, feeding `stdin` when given.
    ///
    /// A non-zero exit status is an error carrying stderr.
    fn run(&self, command: &str, args: &[&str], stdin: Option<&[u8]>) -> Result<CommandOutcome>;

    /// Whether `command` can be found.
    fn available(&self, command: &str) -> bool {
        which::which(command).is_ok()
    }
}

/// Runs real processes.
///
/// When built with a shutdown receiver, a running child is killed as soon as
/// the matching sender is dropped.
#[derive(Debug, Clone, Default)]
pub struct SystemRunner {
    shutdown: Option<Receiver<()>>,
}

impl SystemRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shutdown(shutdown: Receiver<()>) -> Self {
        Self {
            shutdown: Some(shutdown),
        }
    }

    fn cancelled(&self) -> bool {
        match &self.shutdown {
            Some(rx) => matches!(rx.try_recv(), Err(TryRecvError::Disconnected)),
            None => false,
        }
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        String::from_utf8_lossy(&buf).to_string()
    })
}

impl CommandRunner for SystemRunner {
    fn run(&self, command: &str, args: &[&str], stdin: Option<&[u8]>) -> Result<CommandOutcome> {
        let rendered = render(command, args);
        debug!("running {}", rendered);

        let mut child = Command::new(command)
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| {
                if err.kind() == std::io::ErrorKind::NotFound {
                    SysError::ToolMissing(command.to_string())
                } else {
                    SysError::Io(err)
                }
            })?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input)?;
        }

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }

            if self.cancelled() {
                let _ = child.kill();
                let _ = child.wait();
                return Err(SysError::Cancelled);
            }

            thread::sleep(POLL_INTERVAL);
        };

        let stdout = stdout.join().unwrap_or_default();
        let stderr = stderr.join().unwrap_or_default();

        if !status.success() {
            return Err(SysError::CommandFailed {
                command: rendered,
                status: status.to_string(),
                stderr: stderr.trim().to_string(),
            });
        }

        Ok(CommandOutcome {
            command: rendered,
            stdout,
            stderr,
        })
    }
}
