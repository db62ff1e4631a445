// SPDX-License-Identifier: GPL-3.0-only

//! LUKS2 through the `cryptsetup` CLI.
//!
//! Key material never appears on a command line: the unlocking passphrase is
//! written to stdin, a second passphrase (for `luksAddKey`) is handed over as
//! an anonymous memfd the child inherits.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::Path;
use std::sync::Arc;

use nix::errno::Errno;
use serde::Deserialize;
use storage_contracts::{EncryptionProvider, Passphrase, VolumeError, VolumeResult};
use storage_types::constants::{DEFAULT_LUKS_BLOCK_SIZE, DEFAULT_LUKS_CIPHER, DEFAULT_LUKS_KEY_SIZE, DEV_MAPPER};
use storage_types::EncryptionSpec;
use tracing::{debug, info};

use crate::command::CommandRunner;
use crate::{Result, SysError};

const CRYPTSETUP: &str = "cryptsetup";
const PBKDF: &str = "argon2id";

/// An in-memory file holding a passphrase, visible to children as `/dev/fd/<n>`.
struct KeyFile {
    fd: OwnedFd,
}

impl KeyFile {
    fn new(key: &Passphrase) -> Result<Self> {
        // SAFETY: the name is a NUL-terminated literal. The descriptor is
        // deliberately inheritable so the child can open it.
        let raw = unsafe { libc::memfd_create(c"luks-key".as_ptr(), 0) };
        if raw < 0 {
            return Err(Errno::last().into());
        }
        // SAFETY: `raw` is a fresh descriptor nothing else owns.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let mut file = File::from(fd.try_clone()?);
        file.write_all(key.as_bytes())?;

        Ok(Self { fd })
    }

    fn path(&self) -> String {
        format!("/dev/fd/{}", self.fd.as_raw_fd())
    }
}

#[derive(Deserialize)]
struct LuksMetadata {
    #[serde(default)]
    keyslots: BTreeMap<String, serde_json::Value>,
}

/// Parse the `luksDump --dump-json-metadata` output into occupied slots.
pub fn parse_keyslots(json: &str) -> Result<Vec<u32>> {
    let metadata: LuksMetadata = serde_json::from_str(json)
        .map_err(|err| SysError::Parse(format!("invalid LUKS2 metadata: {}", err)))?;

    let mut slots: Vec<u32> = metadata
        .keyslots
        .keys()
        .filter_map(|slot| slot.parse().ok())
        .collect();
    slots.sort_unstable();
    Ok(slots)
}

/// [`EncryptionProvider`] backed by `cryptsetup`.
#[derive(Clone)]
pub struct Luks2 {
    runner: Arc<dyn CommandRunner>,
}

impl std::fmt::Debug for Luks2 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Luks2")
    }
}

impl Luks2 {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    fn run(&self, args: &[String], key: Option<&Passphrase>) -> Result<String> {
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let outcome = self.runner.run(CRYPTSETUP, &args, key.map(Passphrase::as_bytes))?;
        Ok(outcome.stdout)
    }

    pub fn format_args(dev_path: &str, spec: &EncryptionSpec, slot: u32) -> Vec<String> {
        let cipher = if spec.cipher.is_empty() {
            DEFAULT_LUKS_CIPHER
        } else {
            &spec.cipher
        };
        let key_size = if spec.key_size == 0 {
            DEFAULT_LUKS_KEY_SIZE
        } else {
            spec.key_size
        };
        let block_size = if spec.block_size == 0 {
            DEFAULT_LUKS_BLOCK_SIZE
        } else {
            spec.block_size
        };

        vec![
            "luksFormat".to_string(),
            "--type".to_string(),
            "luks2".to_string(),
            "--batch-mode".to_string(),
            "--cipher".to_string(),
            cipher.to_string(),
            "--key-size".to_string(),
            key_size.to_string(),
            "--sector-size".to_string(),
            block_size.to_string(),
            "--pbkdf".to_string(),
            PBKDF.to_string(),
            "--key-slot".to_string(),
            slot.to_string(),
            "--key-file=-".to_string(),
            dev_path.to_string(),
        ]
    }

    pub fn open_args(dev_path: &str, mapped_name: &str, spec: &EncryptionSpec) -> Vec<String> {
        let mut args = vec![
            "open".to_string(),
            "--type".to_string(),
            "luks2".to_string(),
            "--key-file=-".to_string(),
        ];
        args.extend(spec.perf_options.iter().map(|opt| format!("--perf-{}", opt)));
        args.push(dev_path.to_string());
        args.push(mapped_name.to_string());
        args
    }
}

impl EncryptionProvider for Luks2 {
    fn format(
        &self,
        dev_path: &str,
        spec: &EncryptionSpec,
        slot: u32,
        key: &Passphrase,
    ) -> VolumeResult<()> {
        self.run(&Self::format_args(dev_path, spec, slot), Some(key))?;
        info!("formatted {} as LUKS2 (key slot {})", dev_path, slot);
        Ok(())
    }

    fn open(
        &self,
        dev_path: &str,
        mapped_name: &str,
        spec: &EncryptionSpec,
        key: &Passphrase,
    ) -> VolumeResult<String> {
        let mapped_path = format!("{}/{}", DEV_MAPPER, mapped_name);
        if Path::new(&mapped_path).exists() {
            debug!("{} is already open as {}", dev_path, mapped_path);
            return Ok(mapped_path);
        }

        self.run(&Self::open_args(dev_path, mapped_name, spec), Some(key))?;
        info!("opened {} as {}", dev_path, mapped_path);
        Ok(mapped_path)
    }

    fn close(&self, mapped_name: &str) -> VolumeResult<()> {
        let mapped_path = format!("{}/{}", DEV_MAPPER, mapped_name);
        if !Path::new(&mapped_path).exists() {
            return Ok(());
        }

        self.run(&["close".to_string(), mapped_name.to_string()], None)
            .map_err(|err| match err {
                SysError::CommandFailed { .. } => VolumeError::retryable(err.to_string()),
                err => err.into(),
            })?;
        info!("closed {}", mapped_path);
        Ok(())
    }

    fn add_key(
        &self,
        dev_path: &str,
        existing: &Passphrase,
        slot: u32,
        key: &Passphrase,
    ) -> VolumeResult<()> {
        let new_key = KeyFile::new(key)?;
        let args = vec![
            "luksAddKey".to_string(),
            "--batch-mode".to_string(),
            "--pbkdf".to_string(),
            PBKDF.to_string(),
            "--key-slot".to_string(),
            slot.to_string(),
            "--key-file=-".to_string(),
            dev_path.to_string(),
            new_key.path(),
        ];
        self.run(&args, Some(existing))?;
        info!("added key slot {} to {}", slot, dev_path);
        Ok(())
    }

    fn remove_key(&self, dev_path: &str, slot: u32, existing: &Passphrase) -> VolumeResult<()> {
        let args = vec![
            "luksKillSlot".to_string(),
            "--batch-mode".to_string(),
            "--key-file=-".to_string(),
            dev_path.to_string(),
            slot.to_string(),
        ];
        self.run(&args, Some(existing))?;
        info!("removed key slot {} from {}", slot, dev_path);
        Ok(())
    }

    fn check_key(&self, dev_path: &str, slot: u32, key: &Passphrase) -> VolumeResult<bool> {
        let args = vec![
            "open".to_string(),
            "--test-passphrase".to_string(),
            "--key-slot".to_string(),
            slot.to_string(),
            "--key-file=-".to_string(),
            dev_path.to_string(),
        ];

        match self.run(&args, Some(key)) {
            Ok(_) => Ok(true),
            Err(SysError::CommandFailed { .. }) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn read_keyslots(&self, dev_path: &str) -> VolumeResult<Vec<u32>> {
        let json = self.run(
            &[
                "luksDump".to_string(),
                "--dump-json-metadata".to_string(),
                dev_path.to_string(),
            ],
            None,
        )?;
        Ok(parse_keyslots(&json)?)
    }
}
