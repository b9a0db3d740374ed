//! Page and frame types shared by the buffer pool and the disk subsystem.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Type representing page id, should be used instead of using bare `u64`.
pub type PageId = u64;

/// Index of a frame slot inside the buffer pool.
pub type FrameId = usize;

/// Page id stored in frames that do not hold any page.
pub const INVALID_PAGE_ID: PageId = PageId::MAX;

/// Size of each page, shared by every frame and by the disk subsystem.
pub const PAGE_SIZE: usize = 4096; // 4 kB

/// Type representing page content, should be used instead of bare array of bytes.
pub type PageData = [u8; PAGE_SIZE];

/// Physical storage for a single page inside the buffer pool.
///
/// The content is guarded by its own latch so that threads holding pins on
/// different pages never contend with each other. Which page the frame holds
/// is tracked separately in [`PageMeta`], under the pool lock.
pub(crate) struct PageFrame {
    data: RwLock<PageData>,
}

impl PageFrame {
    /// Creates new zeroed [`PageFrame`].
    pub(crate) fn new() -> Self {
        Self {
            data: RwLock::new([0u8; PAGE_SIZE]),
        }
    }

    /// Acquires shared latch on the frame's content.
    pub(crate) fn read(&self) -> RwLockReadGuard<'_, PageData> {
        self.data.read()
    }

    /// Acquires exclusive latch on the frame's content.
    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, PageData> {
        self.data.write()
    }
}

/// Bookkeeping of a single frame: which page it holds and who is using it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PageMeta {
    /// Id of the page held by the frame, [`INVALID_PAGE_ID`] when the frame is free.
    pub(crate) page_id: PageId,
    /// Number of active borrowers. Frame can only be reused if it's 0.
    pub(crate) pin_count: usize,
    /// Set when the in-memory content diverges from the one on disk.
    pub(crate) is_dirty: bool,
    /// Distinguishes loads of pages into the frame, 0 while the frame is free.
    pub(crate) load_id: u64,
}

impl PageMeta {
    /// Metadata of a frame that holds no page.
    pub(crate) fn unused() -> Self {
        Self {
            page_id: INVALID_PAGE_ID,
            pin_count: 0,
            is_dirty: false,
            load_id: 0,
        }
    }

    /// Marks frame as newly resident for `page_id`, pinned once by its loader.
    pub(crate) fn assign(&mut self, page_id: PageId, load_id: u64) {
        self.page_id = page_id;
        self.pin_count = 1;
        self.is_dirty = false;
        self.load_id = load_id;
    }

    /// Returns the frame to the unused state.
    pub(crate) fn reset(&mut self) {
        *self = Self::unused();
    }

    pub(crate) fn is_pinned(&self) -> bool {
        self.pin_count > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_meta_assign_pins_once_and_clears_dirty() {
        // given dirty metadata of an evicted page
        let mut meta = PageMeta {
            page_id: 3,
            pin_count: 0,
            is_dirty: true,
            load_id: 4,
        };

        // when assigning it to another page
        meta.assign(7, 5);

        // then it is pinned by the loader and clean
        assert_eq!(meta.page_id, 7);
        assert_eq!(meta.pin_count, 1);
        assert!(!meta.is_dirty);
        assert_eq!(meta.load_id, 5);
        assert!(meta.is_pinned());
    }

    #[test]
    fn page_meta_reset_returns_to_unused() {
        let mut meta = PageMeta::unused();
        meta.assign(1, 1);
        meta.is_dirty = true;

        meta.reset();

        assert_eq!(meta, PageMeta::unused());
        assert_eq!(meta.page_id, INVALID_PAGE_ID);
    }

    #[test]
    fn page_frame_latches_content() {
        let frame = PageFrame::new();
        frame.write()[0..4].copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(&frame.read()[0..4], &[1, 2, 3, 4]);
        assert!(frame.read()[4..].iter().all(|b| *b == 0));
    }
}
