//! In-memory page cache of a disk-backed storage engine.
//!
//! [`buffer_pool::BufferPoolManager`] keeps a fixed number of page frames, loads pages
//! through a [`disk_manager::DiskManager`] and evicts unpinned pages chosen by a
//! [`replacer::Replacer`].

pub mod background_worker;
pub mod buffer_pool;
pub mod config;
pub mod disk_manager;
pub mod log_manager;
pub mod page;
pub mod paged_file;
pub mod replacer;

pub use buffer_pool::{BufferPoolError, BufferPoolManager, PinnedPage};
pub use config::BufferPoolConfig;
pub use disk_manager::{DiskManager, DiskManagerError, FileDiskManager, MemoryDiskManager};
pub use log_manager::LogManager;
pub use page::{FrameId, INVALID_PAGE_ID, PAGE_SIZE, PageData, PageId};
pub use replacer::{ClockReplacer, LruReplacer, Replacer, ReplacerKind};
