use std::{
    collections::{HashMap, VecDeque},
    mem::ManuallyDrop,
    num::NonZeroUsize,
    sync::{Arc, mpsc},
    thread,
    time::Duration,
};

use log::{debug, error, warn};
use parking_lot::{Mutex, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

use crate::{
    background_worker::{BackgroundWorker, BackgroundWorkerHandle},
    config::BufferPoolConfig,
    disk_manager::{DiskManager, DiskManagerError},
    log_manager::LogManager,
    page::{FrameId, PageData, PageFrame, PageId, PageMeta},
    replacer::{LruReplacer, Replacer},
};

/// Error for buffer pool related operations.
#[derive(Debug, Error)]
pub enum BufferPoolError {
    /// Every frame is pinned, nothing can be evicted.
    #[error("no free frame: every frame in the buffer pool is pinned")]
    NoFreeFrame,
    #[error("page {0} is not in the buffer pool")]
    PageNotFound(PageId),
    #[error("page {0} is already unpinned")]
    AlreadyUnpinned(PageId),
    #[error("page {0} is pinned")]
    PagePinned(PageId),
    #[error("replacer tracks {capacity} frames, pool has {pool_size}")]
    ReplacerTooSmall { capacity: usize, pool_size: usize },
    #[error("disk error: {0}")]
    Disk(#[from] DiskManagerError),
}

/// Handle to a page pinned in the [`BufferPoolManager`].
///
/// While the handle lives the page stays in its frame. Dropping it unpins the page,
/// marking it dirty if [`PinnedPage::write`] was used.
///
/// Latches returned by [`PinnedPage::read`] and [`PinnedPage::write`] must be released
/// before calling back into the pool (e.g. [`BufferPoolManager::flush_page`]) - the pool
/// takes frame latches while holding its own lock.
///
/// The handle only gives back its own pin. If the page was meanwhile unpinned through
/// [`BufferPoolManager::unpin_page`] and loaded again, dropping the handle does nothing.
pub struct PinnedPage<'a> {
    pool: &'a BufferPoolManager,
    frame_id: FrameId,
    page_id: PageId,
    load_id: u64,
    dirty: bool,
}

impl<'a> PinnedPage<'a> {
    fn new(
        pool: &'a BufferPoolManager,
        frame_id: FrameId,
        page_id: PageId,
        load_id: u64,
    ) -> Self {
        Self {
            pool,
            frame_id,
            page_id,
            load_id,
            dirty: false,
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    /// Acquires shared latch on the page content.
    pub fn read(&self) -> RwLockReadGuard<'_, PageData> {
        self.pool.frames[self.frame_id].read()
    }

    /// Acquires exclusive latch on the page content. The page will be unpinned as dirty.
    pub fn write(&mut self) -> RwLockWriteGuard<'_, PageData> {
        self.dirty = true;
        self.pool.frames[self.frame_id].write()
    }

    /// Unpins the page now and reports the outcome, instead of doing it silently on drop.
    pub fn unpin(self, is_dirty: bool) -> Result<(), BufferPoolError> {
        let this = ManuallyDrop::new(self);
        this.pool.unpin_handle(&this, this.dirty || is_dirty)
    }

    /// Gives up the handle but keeps the pin. The caller becomes responsible
    /// for calling [`BufferPoolManager::unpin_page`], including passing the dirty flag -
    /// writes made through this handle are not remembered.
    pub fn detach(self) -> PageId {
        let this = ManuallyDrop::new(self);
        this.page_id
    }
}

impl Drop for PinnedPage<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.pool.unpin_handle(self, self.dirty) {
            warn!("failed to unpin page {} on drop: {e}", self.page_id);
        }
    }
}

/// Everything guarded by the pool lock.
struct PoolState {
    /// Metadata of every frame, indexed by [`FrameId`].
    metas: Vec<PageMeta>,
    /// Resident pages. Free frames have no entry.
    page_table: HashMap<PageId, FrameId>,
    /// Frames that hold no page, used before anything gets evicted.
    free_list: VecDeque<FrameId>,
    /// Id given to the next page load, see [`PageMeta::load_id`].
    next_load_id: u64,
}

impl PoolState {
    /// Makes `page_id` resident in `frame_id`, pinned once. Returns id of this load.
    fn assign(&mut self, frame_id: FrameId, page_id: PageId) -> u64 {
        let load_id = self.next_load_id;
        self.next_load_id += 1;
        self.metas[frame_id].assign(page_id, load_id);
        self.page_table.insert(page_id, frame_id);
        load_id
    }
}

/// Caches pages in a fixed number of frames and hands them out to other threads.
///
/// It is guaranteed that:
/// - a pinned page is never evicted nor overwritten,
/// - a dirty page is written to disk before its frame is reused,
/// - a free frame is always used before evicting anything.
///
/// Lock order: pool lock, then replacer's lock or a frame latch. Disk I/O happens
/// while holding the pool lock.
pub struct BufferPoolManager {
    frames: Box<[PageFrame]>,
    state: Mutex<PoolState>,
    replacer: Box<dyn Replacer>,
    disk: Arc<dyn DiskManager>,
    log_manager: Option<Arc<LogManager>>,
}

impl BufferPoolManager {
    /// Creates pool of `pool_size` frames using LRU replacement.
    pub fn new(
        pool_size: NonZeroUsize,
        disk: Arc<dyn DiskManager>,
        log_manager: Option<Arc<LogManager>>,
    ) -> Self {
        Self::assemble(pool_size, Box::new(LruReplacer::new()), disk, log_manager)
    }

    /// Creates pool according to `config`.
    pub fn from_config(
        config: &BufferPoolConfig,
        disk: Arc<dyn DiskManager>,
        log_manager: Option<Arc<LogManager>>,
    ) -> Self {
        let replacer = config.replacer.build(config.pool_size.get());
        Self::assemble(config.pool_size, replacer, disk, log_manager)
    }

    /// Creates pool that picks victims with `replacer`.
    ///
    /// Fails if `replacer` can't track every frame of the pool.
    pub fn with_replacer(
        pool_size: NonZeroUsize,
        replacer: Box<dyn Replacer>,
        disk: Arc<dyn DiskManager>,
        log_manager: Option<Arc<LogManager>>,
    ) -> Result<Self, BufferPoolError> {
        if let Some(capacity) = replacer
            .capacity()
            .filter(|&capacity| capacity < pool_size.get())
        {
            return Err(BufferPoolError::ReplacerTooSmall {
                capacity,
                pool_size: pool_size.get(),
            });
        }
        Ok(Self::assemble(pool_size, replacer, disk, log_manager))
    }

    fn assemble(
        pool_size: NonZeroUsize,
        replacer: Box<dyn Replacer>,
        disk: Arc<dyn DiskManager>,
        log_manager: Option<Arc<LogManager>>,
    ) -> Self {
        let pool_size = pool_size.get();
        Self {
            frames: (0..pool_size).map(|_| PageFrame::new()).collect(),
            state: Mutex::new(PoolState {
                metas: vec![PageMeta::unused(); pool_size],
                page_table: HashMap::with_capacity(pool_size),
                free_list: (0..pool_size).collect(),
                next_load_id: 1,
            }),
            replacer,
            disk,
            log_manager,
        }
    }

    /// Creates pool according to `config` together with [`BackgroundFlusher`]'s handle.
    pub fn with_background_flusher(
        config: &BufferPoolConfig,
        disk: Arc<dyn DiskManager>,
        log_manager: Option<Arc<LogManager>>,
    ) -> (Arc<Self>, BackgroundWorkerHandle) {
        let pool = Arc::new(Self::from_config(config, disk, log_manager));
        let flusher = BackgroundFlusher::start(BackgroundFlusherParams {
            pool: pool.clone(),
            flush_interval: config.flush_interval,
        });
        (pool, flusher)
    }

    /// Returns pinned page `page_id`. If page is not resident it's loaded from disk
    /// into a free frame or into the frame of an evicted page.
    pub fn fetch_page(&self, page_id: PageId) -> Result<PinnedPage<'_>, BufferPoolError> {
        let mut state = self.state.lock();

        if let Some(&frame_id) = state.page_table.get(&page_id) {
            let meta = &mut state.metas[frame_id];
            meta.pin_count += 1;
            if meta.pin_count == 1 {
                self.replacer.record_pinned(frame_id);
            }
            return Ok(PinnedPage::new(self, frame_id, page_id, meta.load_id));
        }

        let frame_id = self.acquire_frame(&mut state)?;
        let loaded = self.disk.read_page(page_id, &mut self.frames[frame_id].write());
        if let Err(e) = loaded {
            self.release_frame(&mut state, frame_id);
            return Err(e.into());
        }
        let load_id = state.assign(frame_id, page_id);
        debug!("buffer pool: loaded page {page_id} into frame {frame_id}");

        Ok(PinnedPage::new(self, frame_id, page_id, load_id))
    }

    /// Drops one pin of `page_id`. When `is_dirty` is set the page will be written back
    /// before its frame is reused. A page with no pins left becomes evictable.
    ///
    /// Meant for pins handed over by [`PinnedPage::detach`]. A page still held through a
    /// [`PinnedPage`] must not be unpinned here, its pin count would go out of sync with
    /// its handles. Handles never unpin a later load of the same page though.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> Result<(), BufferPoolError> {
        let mut state = self.state.lock();
        let frame_id = *state
            .page_table
            .get(&page_id)
            .ok_or(BufferPoolError::PageNotFound(page_id))?;
        self.unpin_frame(&mut state, frame_id, page_id, is_dirty)
    }

    /// Gives back the pin of `handle`, unless the frame holds another load by now.
    fn unpin_handle(
        &self,
        handle: &PinnedPage<'_>,
        is_dirty: bool,
    ) -> Result<(), BufferPoolError> {
        let mut state = self.state.lock();
        let meta = &state.metas[handle.frame_id];
        if meta.page_id != handle.page_id || meta.load_id != handle.load_id {
            return Err(BufferPoolError::PageNotFound(handle.page_id));
        }
        self.unpin_frame(&mut state, handle.frame_id, handle.page_id, is_dirty)
    }

    fn unpin_frame(
        &self,
        state: &mut PoolState,
        frame_id: FrameId,
        page_id: PageId,
        is_dirty: bool,
    ) -> Result<(), BufferPoolError> {
        let meta = &mut state.metas[frame_id];
        if !meta.is_pinned() {
            return Err(BufferPoolError::AlreadyUnpinned(page_id));
        }
        meta.pin_count -= 1;
        meta.is_dirty |= is_dirty;
        if meta.pin_count == 0 {
            self.replacer.record_unpinned(frame_id);
        }
        Ok(())
    }

    /// Writes `page_id` to disk, dirty or not, and marks it clean.
    pub fn flush_page(&self, page_id: PageId) -> Result<(), BufferPoolError> {
        let mut state = self.state.lock();
        let frame_id = *state
            .page_table
            .get(&page_id)
            .ok_or(BufferPoolError::PageNotFound(page_id))?;
        self.flush_frame(&mut state, frame_id)
    }

    /// Allocates new page on disk and returns it pinned, with zeroed content.
    pub fn new_page(&self) -> Result<PinnedPage<'_>, BufferPoolError> {
        let mut state = self.state.lock();
        if state.free_list.is_empty() && self.replacer.size() == 0 {
            warn!("buffer pool: cannot create page - every frame is pinned");
            return Err(BufferPoolError::NoFreeFrame);
        }

        let frame_id = self.acquire_frame(&mut state)?;
        let page_id = match self.disk.allocate_page() {
            Ok(page_id) => page_id,
            Err(e) => {
                self.release_frame(&mut state, frame_id);
                return Err(e.into());
            }
        };
        self.frames[frame_id].write().fill(0);
        let load_id = state.assign(frame_id, page_id);
        debug!("buffer pool: created page {page_id} in frame {frame_id}");

        Ok(PinnedPage::new(self, frame_id, page_id, load_id))
    }

    /// Removes `page_id` from the pool and deallocates it on disk.
    /// Succeeds without doing anything if the page is not resident.
    pub fn delete_page(&self, page_id: PageId) -> Result<(), BufferPoolError> {
        let mut state = self.state.lock();
        let Some(&frame_id) = state.page_table.get(&page_id) else {
            return Ok(());
        };
        if state.metas[frame_id].is_pinned() {
            return Err(BufferPoolError::PagePinned(page_id));
        }

        self.disk.deallocate_page(page_id)?;
        state.page_table.remove(&page_id);
        self.replacer.record_pinned(frame_id);
        state.metas[frame_id].reset();
        self.frames[frame_id].write().fill(0);
        state.free_list.push_back(frame_id);
        debug!("buffer pool: deleted page {page_id}, frame {frame_id} is free");
        Ok(())
    }

    /// Writes every resident page to disk. Failures don't stop the flush, they are
    /// logged and the first of them is returned.
    pub fn flush_all_pages(&self) -> Result<(), BufferPoolError> {
        let mut state = self.state.lock();
        let resident: Vec<FrameId> = state.page_table.values().copied().collect();

        let mut first_error = None;
        for frame_id in resident {
            if let Err(e) = self.flush_frame(&mut state, frame_id) {
                error!("failed to flush frame {frame_id}: {e}");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Writes back dirty pages nobody is using. Returns how many pages were written.
    pub fn flush_dirty_pages(&self) -> Result<usize, BufferPoolError> {
        let mut state = self.state.lock();
        let dirty: Vec<FrameId> = state
            .page_table
            .values()
            .copied()
            .filter(|&frame_id| {
                let meta = &state.metas[frame_id];
                meta.is_dirty && !meta.is_pinned()
            })
            .collect();

        for &frame_id in &dirty {
            self.flush_frame(&mut state, frame_id)?;
        }
        Ok(dirty.len())
    }

    pub fn pool_size(&self) -> usize {
        self.frames.len()
    }

    /// Number of frames that hold no page.
    pub fn free_frame_count(&self) -> usize {
        self.state.lock().free_list.len()
    }

    /// Number of resident pages that can be evicted.
    pub fn evictable_count(&self) -> usize {
        let _state = self.state.lock();
        self.replacer.size()
    }

    /// Returns true if `page_id` is currently resident.
    pub fn contains(&self, page_id: PageId) -> bool {
        self.state.lock().page_table.contains_key(&page_id)
    }

    /// Pin count of `page_id`, `None` if it's not resident.
    pub fn pin_count(&self, page_id: PageId) -> Option<usize> {
        let state = self.state.lock();
        let frame_id = *state.page_table.get(&page_id)?;
        Some(state.metas[frame_id].pin_count)
    }

    /// Dirty flag of `page_id`, `None` if it's not resident.
    pub fn is_dirty(&self, page_id: PageId) -> Option<bool> {
        let state = self.state.lock();
        let frame_id = *state.page_table.get(&page_id)?;
        Some(state.metas[frame_id].is_dirty)
    }

    pub fn log_manager(&self) -> Option<&Arc<LogManager>> {
        self.log_manager.as_ref()
    }

    /// Returns a frame that holds no page - from the free list first, otherwise
    /// the replacer's victim, written back if dirty and removed from the page table.
    ///
    /// If writing the victim fails it stays resident and remains the next victim.
    fn acquire_frame(&self, state: &mut PoolState) -> Result<FrameId, BufferPoolError> {
        if let Some(frame_id) = state.free_list.pop_front() {
            return Ok(frame_id);
        }

        let Some(frame_id) = self.replacer.select_victim() else {
            warn!("buffer pool: cannot evict frame - every frame is pinned");
            return Err(BufferPoolError::NoFreeFrame);
        };

        let victim = &state.metas[frame_id];
        debug_assert!(!victim.is_pinned(), "replacer returned pinned frame {frame_id}");
        let victim_page_id = victim.page_id;
        if victim.is_dirty {
            let written = self
                .disk
                .write_page(victim_page_id, &self.frames[frame_id].read());
            if let Err(e) = written {
                self.replacer.restore_victim(frame_id);
                return Err(e.into());
            }
            debug!("buffer pool: wrote back dirty page {victim_page_id}");
        }

        state.page_table.remove(&victim_page_id);
        state.metas[frame_id].reset();
        debug!("buffer pool: evicted page {victim_page_id} from frame {frame_id}");
        Ok(frame_id)
    }

    /// Puts a frame taken by [`BufferPoolManager::acquire_frame`] back to the free list
    /// when the operation that needed it failed.
    fn release_frame(&self, state: &mut PoolState, frame_id: FrameId) {
        state.metas[frame_id].reset();
        state.free_list.push_front(frame_id);
    }

    /// Writes frame content to disk under its page id and clears the dirty flag.
    fn flush_frame(&self, state: &mut PoolState, frame_id: FrameId) -> Result<(), BufferPoolError> {
        let meta = &mut state.metas[frame_id];
        self.disk
            .write_page(meta.page_id, &self.frames[frame_id].read())?;
        meta.is_dirty = false;
        Ok(())
    }
}

/// Make sure that dirty pages are written to disk before dropping [`BufferPoolManager`].
/// Errors are logged, so that we try to write as many pages as we can.
impl Drop for BufferPoolManager {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for (&page_id, &frame_id) in &state.page_table {
            if !state.metas[frame_id].is_dirty {
                continue;
            }
            if let Err(e) = self.disk.write_page(page_id, &self.frames[frame_id].read()) {
                error!("failed to write back page {page_id} while dropping buffer pool: {e}");
            }
        }
    }
}

/// Periodically writes dirty, unpinned pages of [`BufferPoolManager`] back to disk.
struct BackgroundFlusher {
    pool: Arc<BufferPoolManager>,
    flush_interval: Duration,
    shutdown: mpsc::Receiver<()>,
}

struct BackgroundFlusherParams {
    pool: Arc<BufferPoolManager>,
    flush_interval: Duration,
}

impl BackgroundWorker for BackgroundFlusher {
    type BackgroundWorkerParams = BackgroundFlusherParams;

    fn start(params: Self::BackgroundWorkerParams) -> BackgroundWorkerHandle {
        let (tx, rx) = mpsc::channel();
        let flusher = BackgroundFlusher {
            pool: params.pool,
            flush_interval: params.flush_interval,
            shutdown: rx,
        };
        let handle = thread::spawn(move || {
            flusher.run();
        });
        BackgroundWorkerHandle::new(handle, tx)
    }
}

impl BackgroundFlusher {
    fn run(self) {
        loop {
            match self.shutdown.recv_timeout(self.flush_interval) {
                Ok(()) => {
                    // Got signal for shutdown.
                    break;
                }
                Err(mpsc::RecvTimeoutError::Timeout) => match self.pool.flush_dirty_pages() {
                    Ok(0) => {}
                    Ok(written) => debug!("background flusher: wrote back {written} pages"),
                    Err(e) => error!("background flusher failed to write back pages: {e}"),
                },
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    // Sender dropped - trying to shutdown anyway.
                    break;
                }
            }
        }
    }
}
