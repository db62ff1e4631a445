// SPDX-License-Identifier: GPL-3.0-only

use storage_contracts::VolumeError;
use thiserror::Error;

/// Error types for system-level operations
#[derive(Error, Debug)]
pub enum SysError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("system call failed: {0}")]
    Errno(#[from] nix::errno::Errno),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("failed to lock {0}: timed out")]
    LockTimeout(String),

    #[error("device busy: {0}")]
    Busy(String),

    #[error("{command} failed ({status}): {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("{0} not found in PATH")]
    ToolMissing(String),

    #[error("cancelled")]
    Cancelled,

    #[error("partition table error: {0}")]
    PartitionTable(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("Operation failed: {0}")]
    OperationFailed(String),
}

impl SysError {
    /// Transient failures the caller should retry later.
    pub fn is_transient(&self) -> bool {
        match self {
            SysError::LockTimeout(_) | SysError::Busy(_) => true,
            SysError::Errno(errno) => matches!(errno, nix::errno::Errno::EBUSY),
            SysError::Io(err) => err.raw_os_error() == Some(libc::EBUSY),
            _ => false,
        }
    }
}

impl From<SysError> for VolumeError {
    fn from(err: SysError) -> Self {
        if err.is_transient() {
            VolumeError::retryable(err.to_string())
        } else {
            VolumeError::system(err.to_string())
        }
    }
}

/// Result type alias for system operations
pub type Result<T> = std::result::Result<T, SysError>;

#[cfg(test)]
mod tests {
    use super::*;
    use storage_contracts::ErrorKind;

    #[test]
    fn lock_timeouts_become_retryable() {
        let err: VolumeError = SysError::LockTimeout("/dev/sda".into()).into();
        assert_eq!(err.kind, ErrorKind::Retryable);

        let err: VolumeError = SysError::Errno(nix::errno::Errno::EBUSY).into();
        assert_eq!(err.kind, ErrorKind::Retryable);
    }

    #[test]
    fn tool_failures_are_system_errors() {
        let err: VolumeError = SysError::CommandFailed {
            command: "mkfs.xfs".into(),
            status: "exit status: 1".into(),
            stderr: "bad".into(),
        }
        .into();
        assert_eq!(err.kind, ErrorKind::System);
        assert_eq!(err.message, "mkfs.xfs failed (exit status: 1): bad");
    }
}
