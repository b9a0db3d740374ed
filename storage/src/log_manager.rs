//! Write-ahead log hookup point for the buffer pool.

use std::{
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

/// Log sequence number.
pub type Lsn = u64;

/// Owner of the write-ahead log file.
///
/// The buffer pool keeps a reference to it so that dirty pages can later be
/// written only after their log records are durable. For now it only hands out
/// sequence numbers.
pub struct LogManager {
    log_path: PathBuf,
    next_lsn: AtomicU64,
}

impl LogManager {
    pub fn new(log_path: impl AsRef<Path>) -> Self {
        LogManager {
            log_path: log_path.as_ref().to_path_buf(),
            next_lsn: AtomicU64::new(1),
        }
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Reserves next log sequence number.
    pub fn next_lsn(&self) -> Lsn {
        self.next_lsn.fetch_add(1, Ordering::AcqRel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_manager_hands_out_increasing_lsns() {
        let log_manager = LogManager::new("wal.log");

        assert_eq!(log_manager.next_lsn(), 1);
        assert_eq!(log_manager.next_lsn(), 2);
        assert_eq!(log_manager.log_path(), Path::new("wal.log"));
    }
}
