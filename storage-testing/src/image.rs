// SPDX-License-Identifier: GPL-3.0-only

use std::path::Path;

use tempfile::NamedTempFile;

use crate::errors::{Result, TestingError};

/// A sparse file of a fixed size, removed on drop.
///
/// The block device helpers accept regular files, so GPT, META and probe
/// code can run against an image without loop devices.
#[derive(Debug)]
pub struct DiskImage {
    file: NamedTempFile,
}

impl DiskImage {
    pub fn new(size: u64) -> Result<Self> {
        let file = NamedTempFile::new().map_err(|err| TestingError::ImageIo {
            path: std::env::temp_dir(),
            reason: err.to_string(),
        })?;

        file.as_file().set_len(size).map_err(|err| TestingError::ImageIo {
            path: file.path().to_path_buf(),
            reason: err.to_string(),
        })?;

        Ok(Self { file })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn path_str(&self) -> String {
        self.file.path().display().to_string()
    }

    pub fn write_at(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        use std::os::unix::fs::FileExt;

        self.file
            .as_file()
            .write_all_at(bytes, offset)
            .map_err(|err| TestingError::ImageIo {
                path: self.file.path().to_path_buf(),
                reason: err.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_has_requested_size() {
        let image = DiskImage::new(8 * 1024 * 1024).unwrap();
        let len = std::fs::metadata(image.path()).unwrap().len();
        assert_eq!(len, 8 * 1024 * 1024);
        image.write_at(4096, b"hello").unwrap();
    }
}
