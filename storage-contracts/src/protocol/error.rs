// SPDX-License-Identifier: GPL-3.0-only

use serde::Serialize;
use thiserror::Error;

/// How the volume engine reacts to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transient: device busy, lock timeout, key provider unreachable, no disk yet.
    Retryable,
    /// Invalid locator/selector or inconsistent volume definition.
    Config,
    /// Content on the device contradicts the configuration.
    Fatal,
    /// A syscall or external tool failed.
    System,
}

impl ErrorKind {
    /// Whether the periodic retry re-drives a volume failed with this kind.
    ///
    /// Config and fatal errors stay put until the configuration changes.
    pub fn is_retried(self) -> bool {
        matches!(self, Self::Retryable | Self::System)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{message}")]
pub struct VolumeError {
    pub kind: ErrorKind,
    pub message: String,
}

pub type VolumeResult<T> = std::result::Result<T, VolumeError>;

impl VolumeError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Retryable, message)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, message)
    }

    pub fn system(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::System, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == ErrorKind::Retryable
    }

    /// Prefix the message, keeping the kind.
    pub fn context(self, context: impl std::fmt::Display) -> Self {
        Self {
            kind: self.kind,
            message: format!("{}: {}", context, self.message),
        }
    }
}

/// Attach context to a `VolumeResult` without changing the error kind.
pub trait ResultExt<T> {
    fn context(self, context: impl std::fmt::Display) -> VolumeResult<T>;
}

impl<T> ResultExt<T> for VolumeResult<T> {
    fn context(self, context: impl std::fmt::Display) -> VolumeResult<T> {
        self.map_err(|err| err.context(context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_keeps_kind() {
        let err = VolumeError::retryable("device busy").context("error locking /dev/sda");
        assert_eq!(err.kind, ErrorKind::Retryable);
        assert_eq!(err.to_string(), "error locking /dev/sda: device busy");
    }

    #[test]
    fn sticky_kinds_are_not_retried() {
        assert!(ErrorKind::Retryable.is_retried());
        assert!(ErrorKind::System.is_retried());
        assert!(!ErrorKind::Config.is_retried());
        assert!(!ErrorKind::Fatal.is_retried());
    }

    #[test]
    fn serializes_kind_in_snake_case() {
        let json = serde_json::to_string(&VolumeError::config("bad")).unwrap();
        assert_eq!(json, r#"{"kind":"config","message":"bad"}"#);
    }
}
