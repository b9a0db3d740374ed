//! PagedFile module: on-disk file split into fixed-size pages.

use std::{
    collections::BTreeSet,
    fs,
    io::{self, Cursor, ErrorKind, Read, Seek, Write},
    path::Path,
};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

use crate::page::{PAGE_SIZE, PageData, PageId};

/// Responsible for managing a single on-disk file.
/// Only this structure should be responsible for directly communicating with disk.
///
/// Page 0 is reserved for [`FileMetadata`]. Pages from 1 to N have no defined format
/// from [`PagedFile`]'s perspective - it only reads, writes, allocates and frees them.
pub struct PagedFile {
    /// handle to underlying file
    handle: fs::File,
    /// file's metadata
    metadata: FileMetadata,
}

/// Error for [`PagedFile`] related operations.
#[derive(Error, Debug)]
pub enum PagedFileError {
    /// Provided page id was invalid, e.g. tried to read [`PagedFile::METADATA_PAGE_ID`]
    #[error("invalid page id: {0}")]
    InvalidPageId(PageId),
    /// File used for loading [`PagedFile`] has invalid format
    #[error("file has invalid format: {0}")]
    InvalidFileFormat(&'static str),
    /// Underlying IO module returned error
    #[error("io error occured: {0}")]
    IoError(#[from] io::Error),
}

impl PagedFile {
    /// Metadata page id - page with this id should only be used internally by [`PagedFile`].
    const METADATA_PAGE_ID: PageId = 0;

    /// Creates a new instance of [`PagedFile`]. When `file_path` points to existing file it
    /// tries to load it from there, otherwise it creates new file at `file_path`.
    pub fn new<P>(file_path: P) -> Result<PagedFile, PagedFileError>
    where
        P: AsRef<Path>,
    {
        if file_path.as_ref().try_exists()? {
            let file = fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(&file_path)?;
            return PagedFile::try_from(file);
        }

        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&file_path)?;
        let mut pf = PagedFile {
            handle: file,
            metadata: FileMetadata::default(),
        };
        pf.update_size()?;
        pf.sync_metadata()?;
        Ok(pf)
    }

    /// Reads page `page_id` into `buffer`. Can fail if io error occurs or `page_id` is not valid.
    pub fn read_page(&mut self, page_id: PageId, buffer: &mut PageData) -> Result<(), PagedFileError> {
        self.check_page_id(page_id)?;
        self.seek_page(page_id)?;
        self.handle.read_exact(buffer)?;
        Ok(())
    }

    /// Writes `page` to page with id `page_id`. It does not sync the write to disk, for this check [`PagedFile::flush`].
    /// Page must be allocated before writing to it.
    pub fn write_page(&mut self, page_id: PageId, page: &PageData) -> Result<(), PagedFileError> {
        self.check_page_id(page_id)?;
        self.seek_page(page_id)?;
        self.handle.write_all(page)?;
        Ok(())
    }

    /// Allocates new page and returns its id. The lowest freed page is reused first,
    /// otherwise the file grows by one page.
    ///
    /// If the metadata cannot be persisted the allocation is rolled back.
    pub fn allocate_page(&mut self) -> Result<PageId, PagedFileError> {
        if let Some(page_id) = self.metadata.free_pages.pop_first() {
            if let Err(e) = self.sync_metadata() {
                self.metadata.free_pages.insert(page_id);
                return Err(e);
            }
            return Ok(page_id);
        }

        let page_id = self.metadata.next_page_id;
        self.metadata.next_page_id += 1;
        let grown = match self.update_size() {
            Ok(()) => self.sync_metadata(),
            Err(e) => Err(e),
        };
        if let Err(e) = grown {
            self.metadata.next_page_id -= 1;
            return Err(e);
        }
        Ok(page_id)
    }

    /// Frees page with `page_id` so that it can be reused later.
    /// It doesn't erase the page content, though the page may be overwritten while it's free.
    ///
    /// If the metadata cannot be persisted the page stays allocated.
    pub fn free_page(&mut self, page_id: PageId) -> Result<(), PagedFileError> {
        self.check_page_id(page_id)?;
        self.metadata.free_pages.insert(page_id);
        if let Err(e) = self.sync_metadata() {
            self.metadata.free_pages.remove(&page_id);
            return Err(e);
        }
        Ok(())
    }

    /// Removes free pages from the end of the file.
    pub fn truncate(&mut self) -> Result<(), PagedFileError> {
        while self.metadata.next_page_id > 1
            && self
                .metadata
                .free_pages
                .remove(&(self.metadata.next_page_id - 1))
        {
            self.metadata.next_page_id -= 1;
        }
        self.update_size()?;
        self.sync_metadata()
    }

    /// Flushes file content to disk ensuring it's synced with in-memory state.
    pub fn flush(&mut self) -> Result<(), PagedFileError> {
        self.handle.sync_all()?;
        Ok(())
    }

    /// Returns true if `page_id` points to an allocated data page.
    pub fn is_allocated(&self, page_id: PageId) -> bool {
        page_id != Self::METADATA_PAGE_ID
            && page_id < self.metadata.next_page_id
            && !self.metadata.free_pages.contains(&page_id)
    }

    fn check_page_id(&self, page_id: PageId) -> Result<(), PagedFileError> {
        if self.is_allocated(page_id) {
            Ok(())
        } else {
            Err(PagedFileError::InvalidPageId(page_id))
        }
    }

    /// Seeks underlying file handle to the start of the page with `page_id`.
    fn seek_page(&mut self, page_id: PageId) -> Result<(), PagedFileError> {
        let start = PAGE_SIZE as u64 * page_id;
        self.handle.seek(io::SeekFrom::Start(start))?;
        Ok(())
    }

    /// Syncs in-memory metadata with data stored in [`PagedFile::METADATA_PAGE_ID`] page
    /// and its free list overflow pages. The metadata page is written last.
    fn sync_metadata(&mut self) -> Result<(), PagedFileError> {
        let pages = self.metadata.encode()?;
        for (page_id, page) in pages.iter().rev() {
            self.seek_page(*page_id)?;
            self.handle.write_all(page)?;
        }
        Ok(())
    }

    /// Updates size of underlying file to hold `next_page_id * PAGE_SIZE` bytes
    fn update_size(&mut self) -> Result<(), PagedFileError> {
        let new_size = self.metadata.next_page_id * PAGE_SIZE as u64;
        self.handle.set_len(new_size)?;
        Ok(())
    }
}

/// Loads existing [`PagedFile`] from file.
impl TryFrom<fs::File> for PagedFile {
    type Error = PagedFileError;

    fn try_from(mut value: fs::File) -> Result<Self, Self::Error> {
        let metadata = FileMetadata::load(&mut value)?;
        Ok(PagedFile {
            handle: value,
            metadata,
        })
    }
}

impl Drop for PagedFile {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            log::error!("failed to flush file content while dropping PagedFile: {e}");
        }
    }
}

/// Storage for file metadata, always kept in the first page of the file.
///
/// Format of the first page:
/// - `magic_number` (4 bytes)
/// - `next_page_id` (8 bytes)
/// - `free_pages_length` (4 bytes), length of the whole free list
/// - `overflow_page_id` (8 bytes), first overflow page or [`PagedFile::METADATA_PAGE_ID`] if none
/// - `free_pages` (up to [`FileMetadata::INLINE_FREE_PAGES`] * 8 bytes)
///
/// Free page ids that don't fit are stored in overflow pages:
/// - `overflow_page_id` (8 bytes), next overflow page
/// - `free_pages` (up to [`FileMetadata::OVERFLOW_FREE_PAGES`] * 8 bytes)
///
/// Overflow pages are the highest free pages, so they are the last ones to be reused.
/// The whole chain is rewritten on every sync.
#[derive(Debug, PartialEq, Eq)]
struct FileMetadata {
    /// id that will be given to the next page appended to the file
    next_page_id: PageId,
    /// pages that were allocated once and then freed
    free_pages: BTreeSet<PageId>,
}

impl FileMetadata {
    const MAGIC_NUMBER: [u8; 4] = [0xB, 0xF, 0x0, 0x1];
    const HEADER_SIZE: usize = 24;
    const INLINE_FREE_PAGES: usize = (PAGE_SIZE - Self::HEADER_SIZE) / size_of::<PageId>();
    const OVERFLOW_FREE_PAGES: usize = (PAGE_SIZE - size_of::<PageId>()) / size_of::<PageId>();

    /// Reads metadata page and every overflow page it points to.
    fn load(file: &mut fs::File) -> Result<Self, PagedFileError> {
        let mut page = [0u8; PAGE_SIZE];
        file.seek(io::SeekFrom::Start(0))?;
        if let Err(e) = file.read_exact(&mut page) {
            return match e.kind() {
                ErrorKind::UnexpectedEof => Err(PagedFileError::InvalidFileFormat(
                    "file shorter than one page",
                )),
                _ => Err(PagedFileError::IoError(e)),
            };
        }

        let mut cursor = Cursor::new(&page[..]);
        let mut magic_number = [0u8; 4];
        cursor.read_exact(&mut magic_number)?;
        if magic_number != Self::MAGIC_NUMBER {
            return Err(PagedFileError::InvalidFileFormat("invalid magic number"));
        }
        let next_page_id = cursor.read_u64::<BigEndian>()?;
        let free_pages_length = cursor.read_u32::<BigEndian>()? as usize;
        if free_pages_length as u64 >= next_page_id {
            return Err(PagedFileError::InvalidFileFormat("free pages list too long"));
        }
        let mut overflow_page_id = cursor.read_u64::<BigEndian>()?;
        let mut free_pages = BTreeSet::new();
        let inline = free_pages_length.min(Self::INLINE_FREE_PAGES);
        for _ in 0..inline {
            free_pages.insert(cursor.read_u64::<BigEndian>()?);
        }

        let mut remaining = free_pages_length - inline;
        while remaining > 0 {
            if overflow_page_id == PagedFile::METADATA_PAGE_ID || overflow_page_id >= next_page_id {
                return Err(PagedFileError::InvalidFileFormat("broken free pages chain"));
            }
            file.seek(io::SeekFrom::Start(PAGE_SIZE as u64 * overflow_page_id))?;
            file.read_exact(&mut page)?;
            let mut cursor = Cursor::new(&page[..]);
            overflow_page_id = cursor.read_u64::<BigEndian>()?;
            let stored = remaining.min(Self::OVERFLOW_FREE_PAGES);
            for _ in 0..stored {
                free_pages.insert(cursor.read_u64::<BigEndian>()?);
            }
            remaining -= stored;
        }

        Ok(FileMetadata {
            next_page_id,
            free_pages,
        })
    }

    /// Serializes metadata into the metadata page followed by overflow pages, each paired
    /// with the id it has to be written to.
    fn encode(&self) -> Result<Vec<(PageId, PageData)>, PagedFileError> {
        let free_pages_length = u32::try_from(self.free_pages.len())
            .map_err(|_| PagedFileError::InvalidFileFormat("free pages list too long"))?;
        let ids: Vec<PageId> = self.free_pages.iter().copied().collect();
        let (inline, mut rest) = ids.split_at(ids.len().min(Self::INLINE_FREE_PAGES));
        let overflow_pages: Vec<PageId> = ids
            .iter()
            .rev()
            .take(rest.len().div_ceil(Self::OVERFLOW_FREE_PAGES))
            .copied()
            .collect();
        let next_overflow = |i: usize| {
            overflow_pages
                .get(i)
                .copied()
                .unwrap_or(PagedFile::METADATA_PAGE_ID)
        };

        let mut pages = Vec::with_capacity(overflow_pages.len() + 1);
        let mut page = [0u8; PAGE_SIZE];
        let mut cursor = Cursor::new(&mut page[..]);
        cursor.write_all(&Self::MAGIC_NUMBER)?;
        cursor.write_u64::<BigEndian>(self.next_page_id)?;
        cursor.write_u32::<BigEndian>(free_pages_length)?;
        cursor.write_u64::<BigEndian>(next_overflow(0))?;
        for free_page_id in inline {
            cursor.write_u64::<BigEndian>(*free_page_id)?;
        }
        pages.push((PagedFile::METADATA_PAGE_ID, page));

        for (i, &overflow_page_id) in overflow_pages.iter().enumerate() {
            let (stored, tail) = rest.split_at(rest.len().min(Self::OVERFLOW_FREE_PAGES));
            rest = tail;
            let mut page = [0u8; PAGE_SIZE];
            let mut cursor = Cursor::new(&mut page[..]);
            cursor.write_u64::<BigEndian>(next_overflow(i + 1))?;
            for free_page_id in stored {
                cursor.write_u64::<BigEndian>(*free_page_id)?;
            }
            pages.push((overflow_page_id, page));
        }
        Ok(pages)
    }
}

impl Default for FileMetadata {
    fn default() -> Self {
        Self {
            next_page_id: PagedFile::METADATA_PAGE_ID + 1,
            free_pages: BTreeSet::new(),
        }
    }
}
