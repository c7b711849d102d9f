use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use crate::error::{Result, UpdateError};

pub const FLAG_FILE_NAME: &str = "down.lock";

const TRUE_TOKEN: &str = "True";
const FALSE_TOKEN: &str = "False";

/// Where the coordinator keeps its download flag.
pub trait FlagStore: Send + Sync {
    fn write(&self, need_download: bool) -> Result<()>;
    fn read(&self) -> bool;
}

/// Durable "a download session is still open" marker.
///
/// The file holds a single literal token and is fully overwritten on every
/// write. A missing or unreadable file reads as `true` so that a lost flag
/// is treated as an incomplete download.
#[derive(Debug, Clone)]
pub struct DownloadFlag {
    path: PathBuf,
}

impl DownloadFlag {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(FLAG_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn try_read(&self) -> Result<bool> {
        let file = fs::File::open(&self.path).map_err(|e| UpdateError::storage(&self.path, e))?;
        let mut line = String::new();
        BufReader::new(file)
            .read_line(&mut line)
            .map_err(|e| UpdateError::storage(&self.path, e))?;
        Ok(line.trim_end_matches(['\r', '\n']) == TRUE_TOKEN)
    }
}

impl FlagStore for DownloadFlag {
    fn write(&self, need_download: bool) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| UpdateError::storage(parent, e))?;
            }
        }
        let token = if need_download { TRUE_TOKEN } else { FALSE_TOKEN };
        fs::write(&self.path, token).map_err(|e| UpdateError::storage(&self.path, e))?;
        log::debug!("flag {:?} <- {}", self.path, token);
        Ok(())
    }

    fn read(&self) -> bool {
        match self.try_read() {
            Ok(value) => value,
            Err(e) => {
                log::warn!("{}; assuming download incomplete", e);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let flag = DownloadFlag::in_dir(dir.path());

        flag.write(true).unwrap();
        assert!(flag.read());
        assert_eq!(fs::read_to_string(flag.path()).unwrap(), "True");

        flag.write(false).unwrap();
        assert!(!flag.read());
        assert_eq!(fs::read_to_string(flag.path()).unwrap(), "False");
    }

    #[test]
    fn test_missing_file_reads_true() {
        let dir = TempDir::new().unwrap();
        let flag = DownloadFlag::in_dir(dir.path());
        assert!(flag.read());
    }

    #[test]
    fn test_token_is_case_sensitive() {
        let dir = TempDir::new().unwrap();
        let flag = DownloadFlag::in_dir(dir.path());

        fs::write(flag.path(), "true").unwrap();
        assert!(!flag.read());

        fs::write(flag.path(), "True\nleftover").unwrap();
        assert!(flag.read());

        fs::write(flag.path(), "").unwrap();
        assert!(!flag.read());
    }

    #[test]
    fn test_write_creates_parent_dir() {
        let dir = TempDir::new().unwrap();
        let flag = DownloadFlag::in_dir(&dir.path().join("nested/data"));
        flag.write(true).unwrap();
        assert!(flag.path().exists());
    }

    #[test]
    fn test_write_failure_is_storage_error() {
        let dir = TempDir::new().unwrap();
        // A directory where the file should be makes the write fail.
        let flag = DownloadFlag::in_dir(dir.path());
        fs::create_dir(flag.path()).unwrap();

        let err = flag.write(false).unwrap_err();
        assert!(matches!(err, UpdateError::Storage { .. }));
        assert!(flag.read());
    }
}
