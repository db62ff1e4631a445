// SPDX-License-Identifier: GPL-3.0-only

//! Close-after-write notifications on `/dev/<name>` nodes.
//!
//! Userspace partitioning tools rewrite a disk without the kernel emitting a
//! uevent; watching the device node catches those writes.

use std::collections::HashMap;
use std::os::fd::AsFd;
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use nix::errno::Errno;
use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify, WatchDescriptor};
use parking_lot::Mutex;
use tracing::debug;

use crate::{Result, wait_readable};

const POLL_TIMEOUT_MS: u16 = 500;

#[derive(Default)]
struct Watches {
    by_name: HashMap<String, WatchDescriptor>,
    by_wd: HashMap<WatchDescriptor, String>,
}

/// inotify instance watching device nodes by name.
#[derive(Clone)]
pub struct DevWatcher {
    inotify: Arc<Inotify>,
    watches: Arc<Mutex<Watches>>,
    dev_root: String,
}

impl std::fmt::Debug for DevWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DevWatcher")
            .field("dev_root", &self.dev_root)
            .field("watches", &self.watches.lock().by_name.len())
            .finish()
    }
}

impl DevWatcher {
    pub fn new() -> Result<Self> {
        Self::with_root("/dev")
    }

    /// Watch nodes under `dev_root` instead of `/dev`.
    pub fn with_root(dev_root: &str) -> Result<Self> {
        let inotify = Inotify::init(InitFlags::IN_CLOEXEC | InitFlags::IN_NONBLOCK)?;

        Ok(Self {
            inotify: Arc::new(inotify),
            watches: Arc::new(Mutex::new(Watches::default())),
            dev_root: dev_root.trim_end_matches('/').to_string(),
        })
    }

    /// Start watching `<dev_root>/<name>`; a missing node is not an error.
    pub fn watch(&self, name: &str) -> Result<()> {
        let mut watches = self.watches.lock();
        if watches.by_name.contains_key(name) {
            return Ok(());
        }

        let path = format!("{}/{}", self.dev_root, name);
        match self.inotify.add_watch(path.as_str(), AddWatchFlags::IN_CLOSE_WRITE) {
            Ok(wd) => {
                watches.by_name.insert(name.to_string(), wd);
                watches.by_wd.insert(wd, name.to_string());
                Ok(())
            }
            Err(Errno::ENOENT) => {
                debug!("not watching {}: node is gone", path);
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn unwatch(&self, name: &str) -> Result<()> {
        let mut watches = self.watches.lock();
        let Some(wd) = watches.by_name.remove(name) else {
            return Ok(());
        };
        watches.by_wd.remove(&wd);

        // the kernel drops the watch itself when the node is deleted
        match self.inotify.rm_watch(wd) {
            Ok(()) | Err(Errno::EINVAL) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn is_watched(&self, name: &str) -> bool {
        self.watches.lock().by_name.contains_key(name)
    }

    /// Names of devices written since the last call, waiting at most `timeout_ms`.
    pub fn poll_written(&self, timeout_ms: u16) -> Result<Vec<String>> {
        if !wait_readable(self.inotify.as_fd(), timeout_ms)? {
            return Ok(Vec::new());
        }

        let events = match self.inotify.read_events() {
            Ok(events) => events,
            Err(Errno::EAGAIN) => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let watches = self.watches.lock();
        let mut names: Vec<String> = events
            .iter()
            .filter(|event| event.mask.contains(AddWatchFlags::IN_CLOSE_WRITE))
            .filter_map(|event| watches.by_wd.get(&event.wd).cloned())
            .collect();
        names.dedup();

        Ok(names)
    }

    /// Forward written device names to a channel from a dedicated thread.
    pub fn spawn_reader(&self, shutdown: Receiver<()>) -> Result<Receiver<String>> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let watcher = self.clone();

        thread::Builder::new()
            .name("dev-inotify".to_string())
            .spawn(move || watcher.read_loop(&tx, &shutdown))?;

        Ok(rx)
    }

    fn read_loop(&self, tx: &Sender<String>, shutdown: &Receiver<()>) {
        loop {
            if matches!(shutdown.try_recv(), Err(TryRecvError::Disconnected)) {
                return;
            }

            match self.poll_written(POLL_TIMEOUT_MS) {
                Ok(names) => {
                    for name in names {
                        if tx.send(name).is_err() {
                            return;
                        }
                    }
                }
                Err(err) => debug!("inotify read failed: {}", err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn reports_close_after_write() {
        let dir = tempfile::tempdir().unwrap();
        let node = dir.path().join("sda");
        std::fs::write(&node, b"").unwrap();

        let watcher = DevWatcher::with_root(dir.path().to_str().unwrap()).unwrap();
        watcher.watch("sda").unwrap();
        assert!(watcher.is_watched("sda"));

        let mut file = std::fs::OpenOptions::new().write(true).open(&node).unwrap();
        file.write_all(b"gpt").unwrap();
        drop(file);

        assert_eq!(watcher.poll_written(1000).unwrap(), vec!["sda".to_string()]);
    }

    #[test]
    fn missing_nodes_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = DevWatcher::with_root(dir.path().to_str().unwrap()).unwrap();

        watcher.watch("sdz").unwrap();
        assert!(!watcher.is_watched("sdz"));
        watcher.unwatch("sdz").unwrap();
    }

    #[test]
    fn unwatched_nodes_are_silent() {
        let dir = tempfile::tempdir().unwrap();
        let node = dir.path().join("vda");
        std::fs::write(&node, b"").unwrap();

        let watcher = DevWatcher::with_root(dir.path().to_str().unwrap()).unwrap();
        watcher.watch("vda").unwrap();
        watcher.unwatch("vda").unwrap();

        std::fs::write(&node, b"data").unwrap();
        assert!(watcher.poll_written(100).unwrap().is_empty());
    }
}
