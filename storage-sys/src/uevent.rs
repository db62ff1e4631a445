// SPDX-License-Identifier: GPL-3.0-only

//! Kernel uevents for block devices.
//!
//! Live events come from a `NETLINK_KOBJECT_UEVENT` socket; the initial state
//! is synthesized from the `uevent` files under sysfs (see [`crate::sysfs`]).
//! Both produce the same [`Uevent`] record.

use std::collections::BTreeMap;
use std::fmt;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};
use std::str::FromStr;
use std::thread;

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use nix::errno::Errno;
use tracing::{debug, warn};

use crate::{Result, SysError, wait_readable};

/// Receive buffer forced on the socket, so bursts at boot are not dropped.
const RECEIVE_BUFFER: usize = 64 * 1024 * 1024;
const KERNEL_GROUP: u32 = 1;
const MAX_MESSAGE: usize = 64 * 1024;
const POLL_TIMEOUT_MS: u16 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Add,
    Remove,
    Change,
    Move,
    Online,
    Offline,
    Bind,
    Unbind,
}

impl FromStr for Action {
    type Err = SysError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "add" => Action::Add,
            "remove" => Action::Remove,
            "change" => Action::Change,
            "move" => Action::Move,
            "online" => Action::Online,
            "offline" => Action::Offline,
            "bind" => Action::Bind,
            "unbind" => Action::Unbind,
            other => return Err(SysError::Parse(format!("unknown uevent action {:?}", other))),
        })
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Action::Add => "add",
            Action::Remove => "remove",
            Action::Change => "change",
            Action::Move => "move",
            Action::Online => "online",
            Action::Offline => "offline",
            Action::Bind => "bind",
            Action::Unbind => "unbind",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uevent {
    pub action: Action,
    /// Path relative to `/sys`, e.g. `/devices/virtual/block/loop0`.
    pub dev_path: String,
    pub values: BTreeMap<String, String>,
}

impl Uevent {
    pub fn get(&self, key: &str) -> &str {
        self.values.get(key).map(String::as_str).unwrap_or_default()
    }

    pub fn subsystem(&self) -> &str {
        self.get("SUBSYSTEM")
    }

    pub fn dev_name(&self) -> &str {
        self.get("DEVNAME")
    }

    /// `disk` or `partition`.
    pub fn dev_type(&self) -> &str {
        self.get("DEVTYPE")
    }

    pub fn major(&self) -> u32 {
        self.get("MAJOR").parse().unwrap_or_default()
    }

    pub fn minor(&self) -> u32 {
        self.get("MINOR").parse().unwrap_or_default()
    }

    pub fn partition_number(&self) -> u32 {
        self.get("PARTN").parse().unwrap_or_default()
    }

    pub fn partition_name(&self) -> &str {
        self.get("PARTNAME")
    }

    pub fn is_block(&self) -> bool {
        self.subsystem() == "block"
    }
}

/// Parse one kernel netlink message: `action@devpath\0KEY=VALUE\0...`.
///
/// Messages re-broadcast by udev (`libudev\0` magic) are not kernel events and
/// yield `None`.
pub fn parse_message(buf: &[u8]) -> Option<Uevent> {
    if buf.starts_with(b"libudev\0") {
        return None;
    }

    let mut fields = buf.split(|&b| b == 0).filter(|f| !f.is_empty());
    let header = std::str::from_utf8(fields.next()?).ok()?;
    let (action, dev_path) = header.split_once('@')?;
    let action = action.parse().ok()?;

    let mut values = BTreeMap::new();
    for field in fields {
        let Ok(field) = std::str::from_utf8(field) else {
            continue;
        };
        if let Some((key, value)) = field.split_once('=') {
            values.insert(key.to_string(), value.to_string());
        }
    }

    Some(Uevent {
        action,
        dev_path: dev_path.to_string(),
        values,
    })
}

/// Build an `add` event from the contents of a sysfs `uevent` file.
pub fn from_uevent_file(dev_path: &str, content: &str) -> Uevent {
    let mut values: BTreeMap<String, String> = content
        .lines()
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .collect();

    values.insert("ACTION".to_string(), Action::Add.to_string());
    values.insert("DEVPATH".to_string(), dev_path.to_string());
    values
        .entry("SUBSYSTEM".to_string())
        .or_insert_with(|| "block".to_string());

    Uevent {
        action: Action::Add,
        dev_path: dev_path.to_string(),
        values,
    }
}

#[derive(Debug)]
pub struct UeventSocket {
    fd: OwnedFd,
}

impl UeventSocket {
    pub fn open() -> Result<Self> {
        // SAFETY: plain socket(2) call; the descriptor is owned below.
        let raw = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_DGRAM | libc::SOCK_CLOEXEC,
                libc::NETLINK_KOBJECT_UEVENT,
            )
        };
        if raw < 0 {
            return Err(Errno::last().into());
        }
        // SAFETY: `raw` is a fresh descriptor nothing else owns.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        if let Err(err) = set_receive_buffer(&fd, libc::SO_RCVBUFFORCE) {
            warn!("failed to force uevent receive buffer size: {}", err);
            set_receive_buffer(&fd, libc::SO_RCVBUF)?;
        }

        // SAFETY: sockaddr_nl is plain old data; all-zeroes is a valid value.
        let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        addr.nl_groups = KERNEL_GROUP;

        // SAFETY: `addr` is a valid sockaddr_nl of the given length.
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(Errno::last().into());
        }

        Ok(Self { fd })
    }

    /// Next kernel event, waiting at most `timeout_ms`.
    pub fn recv(&self, timeout_ms: u16) -> Result<Option<Uevent>> {
        if !wait_readable(self.fd.as_fd(), timeout_ms)? {
            return Ok(None);
        }

        let mut buf = vec![0u8; MAX_MESSAGE];
        // SAFETY: `buf` is valid for writes of its full length.
        let n = unsafe {
            libc::recv(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            )
        };
        if n < 0 {
            return Err(Errno::last().into());
        }

        Ok(parse_message(&buf[..n as usize]))
    }

    /// Forward block-subsystem events to a channel from a dedicated thread.
    ///
    /// The thread exits once `shutdown` disconnects or the receiver is dropped.
    pub fn spawn_reader(self, shutdown: Receiver<()>) -> Result<Receiver<Uevent>> {
        let (tx, rx) = crossbeam_channel::unbounded();

        thread::Builder::new()
            .name("uevent-reader".to_string())
            .spawn(move || self.read_loop(&tx, &shutdown))?;

        Ok(rx)
    }

    fn read_loop(&self, tx: &Sender<Uevent>, shutdown: &Receiver<()>) {
        loop {
            if matches!(shutdown.try_recv(), Err(TryRecvError::Disconnected)) {
                return;
            }

            match self.recv(POLL_TIMEOUT_MS) {
                Ok(Some(event)) if event.is_block() => {
                    if tx.send(event).is_err() {
                        return;
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    debug!("uevent receive failed: {}", err);
                }
            }
        }
    }
}

fn set_receive_buffer(fd: &OwnedFd, option: libc::c_int) -> Result<()> {
    let size = RECEIVE_BUFFER as libc::c_int;
    // SAFETY: the option value is a c_int living for the duration of the call.
    let rc = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            option,
            &size as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(Errno::last().into());
    }
    Ok(())
}
