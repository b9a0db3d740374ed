//! DiskManager module: contract between the buffer pool and persistent storage.

use std::{
    collections::{BTreeSet, HashMap},
    path::{Path, PathBuf},
};

use directories::ProjectDirs;
use parking_lot::Mutex;
use thiserror::Error;

use crate::{
    page::{PAGE_SIZE, PageData, PageId},
    paged_file::{PagedFile, PagedFileError},
};

/// Error for [`DiskManager`] related operations.
#[derive(Error, Debug)]
pub enum DiskManagerError {
    #[error("couldn't find the data directory")]
    DirectoryNotFound,
    #[error("page {0} was never allocated")]
    PageNotAllocated(PageId),
    #[error("paged file error: {0}")]
    PagedFileError(#[from] PagedFileError),
}

/// Synchronous page-granular storage used by the buffer pool.
///
/// Implementations synchronize internally, every method can be called from many threads.
pub trait DiskManager: Send + Sync {
    /// Fills `buffer` with the content of page `page_id`.
    fn read_page(&self, page_id: PageId, buffer: &mut PageData) -> Result<(), DiskManagerError>;

    /// Persists `buffer` as the content of page `page_id`.
    fn write_page(&self, page_id: PageId, buffer: &PageData) -> Result<(), DiskManagerError>;

    /// Returns a fresh page id that is not used by any live page.
    fn allocate_page(&self) -> Result<PageId, DiskManagerError>;

    /// Marks `page_id` as free so that it can be reused by later allocations.
    fn deallocate_page(&self, page_id: PageId) -> Result<(), DiskManagerError>;
}

/// [`DiskManager`] backed by a single [`PagedFile`].
pub struct FileDiskManager {
    file: Mutex<PagedFile>,
    path: PathBuf,
}

impl FileDiskManager {
    /// Opens (or creates) the page file at `path`.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, DiskManagerError> {
        let path = path.as_ref().to_path_buf();
        let file = PagedFile::new(&path)?;
        Ok(Self {
            file: Mutex::new(file),
            path,
        })
    }

    /// Opens the page file of `database_name` inside the OS-specific local data directory.
    ///
    /// Can fail if the data directory cannot be determined or created.
    pub fn in_project_dir(database_name: &str) -> Result<Self, DiskManagerError> {
        let project_dir =
            ProjectDirs::from("", "", "Storage").ok_or(DiskManagerError::DirectoryNotFound)?;
        let base_path = project_dir.data_local_dir();
        std::fs::create_dir_all(base_path).map_err(PagedFileError::from)?;
        Self::new(base_path.join(format!("{database_name}.db")))
    }

    /// Returns path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Syncs the underlying file to disk.
    pub fn sync(&self) -> Result<(), DiskManagerError> {
        self.file.lock().flush()?;
        Ok(())
    }
}

impl DiskManager for FileDiskManager {
    fn read_page(&self, page_id: PageId, buffer: &mut PageData) -> Result<(), DiskManagerError> {
        let mut file = self.file.lock();
        if !file.is_allocated(page_id) {
            return Err(DiskManagerError::PageNotAllocated(page_id));
        }
        file.read_page(page_id, buffer)?;
        Ok(())
    }

    fn write_page(&self, page_id: PageId, buffer: &PageData) -> Result<(), DiskManagerError> {
        self.file.lock().write_page(page_id, buffer)?;
        Ok(())
    }

    fn allocate_page(&self) -> Result<PageId, DiskManagerError> {
        let mut file = self.file.lock();
        let page_id = file.allocate_page()?;
        // Reused pages still hold content from before they were freed.
        file.write_page(page_id, &[0u8; PAGE_SIZE])?;
        Ok(page_id)
    }

    fn deallocate_page(&self, page_id: PageId) -> Result<(), DiskManagerError> {
        self.file.lock().free_page(page_id)?;
        Ok(())
    }
}

/// In-memory [`DiskManager`], useful for tests of components built on top of the buffer pool.
///
/// Besides storing pages it counts reads and writes per page.
#[derive(Default)]
pub struct MemoryDiskManager {
    inner: Mutex<MemoryDisk>,
}

#[derive(Default)]
struct MemoryDisk {
    pages: HashMap<PageId, Box<PageData>>,
    free_pages: BTreeSet<PageId>,
    next_page_id: PageId,
    reads: HashMap<PageId, usize>,
    writes: HashMap<PageId, usize>,
}

impl MemoryDiskManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of [`DiskManager::read_page`] calls for `page_id`.
    pub fn reads(&self, page_id: PageId) -> usize {
        self.inner.lock().reads.get(&page_id).copied().unwrap_or(0)
    }

    /// Number of [`DiskManager::write_page`] calls for `page_id`.
    pub fn writes(&self, page_id: PageId) -> usize {
        self.inner.lock().writes.get(&page_id).copied().unwrap_or(0)
    }

    /// Total number of writes for all pages.
    pub fn total_writes(&self) -> usize {
        self.inner.lock().writes.values().sum()
    }

    /// Returns copy of the stored content of `page_id`, if it's allocated.
    pub fn page(&self, page_id: PageId) -> Option<PageData> {
        self.inner.lock().pages.get(&page_id).map(|page| **page)
    }
}

impl DiskManager for MemoryDiskManager {
    fn read_page(&self, page_id: PageId, buffer: &mut PageData) -> Result<(), DiskManagerError> {
        let mut disk = self.inner.lock();
        let page = disk
            .pages
            .get(&page_id)
            .ok_or(DiskManagerError::PageNotAllocated(page_id))?;
        buffer.copy_from_slice(&page[..]);
        *disk.reads.entry(page_id).or_default() += 1;
        Ok(())
    }

    fn write_page(&self, page_id: PageId, buffer: &PageData) -> Result<(), DiskManagerError> {
        let mut disk = self.inner.lock();
        let page = disk
            .pages
            .get_mut(&page_id)
            .ok_or(DiskManagerError::PageNotAllocated(page_id))?;
        page.copy_from_slice(buffer);
        *disk.writes.entry(page_id).or_default() += 1;
        Ok(())
    }

    fn allocate_page(&self) -> Result<PageId, DiskManagerError> {
        let mut disk = self.inner.lock();
        let page_id = match disk.free_pages.pop_first() {
            Some(page_id) => page_id,
            None => {
                let page_id = disk.next_page_id;
                disk.next_page_id += 1;
                page_id
            }
        };
        disk.pages.insert(page_id, Box::new([0u8; PAGE_SIZE]));
        Ok(page_id)
    }

    fn deallocate_page(&self, page_id: PageId) -> Result<(), DiskManagerError> {
        let mut disk = self.inner.lock();
        if disk.pages.remove(&page_id).is_none() {
            return Err(DiskManagerError::PageNotAllocated(page_id));
        }
        disk.free_pages.insert(page_id);
        Ok(())
    }
}
