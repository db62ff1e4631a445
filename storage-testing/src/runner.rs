// SPDX-License-Identifier: GPL-3.0-only

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::Mutex;
use storage_sys::command::render;
use storage_sys::{CommandOutcome, CommandRunner, SysError};

#[derive(Debug, Default)]
struct Recorded {
    calls: Vec<String>,
    stdout: BTreeMap<String, String>,
    failing: BTreeSet<String>,
    missing: BTreeSet<String>,
}

/// Records every invocation instead of running it.
///
/// Commands succeed with empty output unless a canned reply or a failure was
/// registered for them.
#[derive(Debug, Default)]
pub struct RecordingRunner {
    state: Mutex<Recorded>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply with `stdout` whenever `command` runs.
    pub fn reply(&self, command: &str, stdout: &str) {
        self.state
            .lock()
            .stdout
            .insert(command.to_string(), stdout.to_string());
    }

    /// Make `command` exit non-zero.
    pub fn fail(&self, command: &str) {
        self.state.lock().failing.insert(command.to_string());
    }

    /// Pretend `command` is not installed.
    pub fn hide(&self, command: &str) {
        self.state.lock().missing.insert(command.to_string());
    }

    /// Rendered command lines, in order.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }
}

impl CommandRunner for RecordingRunner {
    fn run(&self, command: &str, args: &[&str], _stdin: Option<&[u8]>) -> storage_sys::Result<CommandOutcome> {
        let rendered = render(command, args);
        let mut state = self.state.lock();
        state.calls.push(rendered.clone());

        if state.missing.contains(command) {
            return Err(SysError::ToolMissing(command.to_string()));
        }
        if state.failing.contains(command) {
            return Err(SysError::CommandFailed {
                command: rendered,
                status: "exit status: 1".to_string(),
                stderr: "injected failure".to_string(),
            });
        }

        Ok(CommandOutcome {
            stdout: state.stdout.get(command).cloned().unwrap_or_default(),
            command: rendered,
            stderr: String::new(),
        })
    }

    fn available(&self, command: &str) -> bool {
        !self.state.lock().missing.contains(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_replies() {
        let runner = RecordingRunner::new();
        runner.reply("pvscan", "  VG vg0 is complete\n");
        runner.fail("vgchange");

        let out = runner.run("pvscan", &["--cache", "/dev/sdb"], None).unwrap();
        assert!(out.stdout.contains("vg0"));
        assert!(runner.run("vgchange", &["-aay", "vg0"], None).is_err());
        assert_eq!(runner.calls(), ["pvscan --cache /dev/sdb", "vgchange -aay vg0"]);
    }

    #[test]
    fn hidden_tools_are_unavailable() {
        let runner = RecordingRunner::new();
        runner.hide("xfs_scrub");
        assert!(!runner.available("xfs_scrub"));
        assert!(runner.available("mkfs.xfs"));
    }
}
