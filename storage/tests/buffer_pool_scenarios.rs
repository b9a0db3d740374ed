use std::{collections::HashSet, num::NonZeroUsize, sync::Arc, thread};

use storage::{
    BufferPoolError, BufferPoolManager, DiskManager, FileDiskManager, LogManager,
    MemoryDiskManager, PAGE_SIZE, PageId,
};
use tempfile::{TempDir, tempdir};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn pool_size(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n).unwrap()
}

/// Creates file-backed pool in a temporary directory. Directory must outlive the pool.
fn create_file_pool(n: usize) -> (TempDir, Arc<FileDiskManager>, BufferPoolManager) {
    init_logger();
    let tmp = tempdir().unwrap();
    let disk = Arc::new(FileDiskManager::new(tmp.path().join("pool.db")).unwrap());
    let log_manager = Arc::new(LogManager::new(tmp.path().join("pool.wal")));
    let pool = BufferPoolManager::new(pool_size(n), disk.clone(), Some(log_manager));
    (tmp, disk, pool)
}

fn fill(pool: &BufferPoolManager, byte: u8) -> PageId {
    let mut page = pool.new_page().unwrap();
    page.write().fill(byte);
    page.page_id()
}

#[test]
fn pool_of_two_rejects_third_page_while_both_pinned() {
    let (_tmp, _disk, pool) = create_file_pool(2);

    let first = pool.new_page().unwrap();
    let second = pool.new_page().unwrap();

    assert_ne!(first.page_id(), second.page_id());
    assert!(matches!(pool.new_page(), Err(BufferPoolError::NoFreeFrame)));

    drop(first);
    assert!(pool.new_page().is_ok());
    drop(second);
}

#[test]
fn pool_of_one_evicts_clean_page_and_loads_next() {
    init_logger();
    let disk = Arc::new(MemoryDiskManager::new());
    let a = disk.allocate_page().unwrap();
    let b = disk.allocate_page().unwrap();
    disk.write_page(b, &[0xB; PAGE_SIZE]).unwrap();
    let pool = BufferPoolManager::new(pool_size(1), disk.clone(), None);

    drop(pool.fetch_page(a).unwrap());
    let page = pool.fetch_page(b).unwrap();

    assert_eq!(*page.read(), [0xB; PAGE_SIZE]);
    assert_eq!(disk.writes(a), 0);
    assert!(!pool.contains(a));
}

#[test]
fn dirty_pages_survive_eviction_through_file() {
    // given more pages than frames, each filled with its own byte
    let (_tmp, _disk, pool) = create_file_pool(3);
    let ids: Vec<_> = (1..=10).map(|byte| fill(&pool, byte)).collect();

    // then every page reads back with its content
    for (byte, page_id) in (1..=10u8).zip(&ids) {
        let page = pool.fetch_page(*page_id).unwrap();
        assert_eq!(*page.read(), [byte; PAGE_SIZE], "page {page_id}");
    }
}

#[test]
fn flushed_pages_are_visible_after_reopen() {
    init_logger();
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("reopen.db");
    let page_id = {
        let disk = Arc::new(FileDiskManager::new(&path).unwrap());
        let pool = BufferPoolManager::new(pool_size(4), disk.clone(), None);
        let page_id = fill(&pool, 0x5A);
        pool.flush_all_pages().unwrap();
        disk.sync().unwrap();
        page_id
    };

    let disk = Arc::new(FileDiskManager::new(&path).unwrap());
    let pool = BufferPoolManager::new(pool_size(4), disk, None);
    let page = pool.fetch_page(page_id).unwrap();

    assert_eq!(*page.read(), [0x5A; PAGE_SIZE]);
}

#[test]
fn deleted_page_id_is_reused() {
    let (_tmp, _disk, pool) = create_file_pool(2);
    let page_id = fill(&pool, 1);

    pool.delete_page(page_id).unwrap();
    let page = pool.new_page().unwrap();

    assert_eq!(page.page_id(), page_id);
    assert_eq!(*page.read(), [0u8; PAGE_SIZE]);
}

#[test]
fn deleting_hundreds_of_pages_keeps_ids_unique() {
    // given more freed pages than fit into the file's metadata page
    let (_tmp, _disk, pool) = create_file_pool(2);
    let ids: Vec<_> = (0..1200).map(|i| fill(&pool, i as u8)).collect();
    for &page_id in ids.iter().rev() {
        drop(pool.fetch_page(page_id).unwrap());
        pool.delete_page(page_id).unwrap();
        assert!(!pool.contains(page_id));
    }

    // when creating pages again
    let first = pool.new_page().unwrap();
    let second = pool.new_page().unwrap();

    // then each id is handed out once and lives in one frame
    assert_ne!(first.page_id(), second.page_id());
    assert_ne!(first.frame_id(), second.frame_id());
    assert_eq!(pool.pin_count(first.page_id()), Some(1));
    let mut reused = HashSet::from([first.page_id(), second.page_id()]);
    drop(first);
    drop(second);
    for _ in 2..ids.len() {
        assert!(reused.insert(fill(&pool, 1)));
    }
    let expected: HashSet<_> = ids.into_iter().collect();
    assert_eq!(reused, expected);
}

#[test]
fn delete_pinned_page_leaves_it_intact() {
    let (_tmp, _disk, pool) = create_file_pool(2);
    let mut page = pool.new_page().unwrap();
    page.write().fill(3);

    let result = pool.delete_page(page.page_id());

    assert!(matches!(result, Err(BufferPoolError::PagePinned(_))));
    assert!(pool.contains(page.page_id()));
    assert_eq!(*page.read(), [3u8; PAGE_SIZE]);
}

#[test]
fn double_unpin_is_rejected() {
    let (_tmp, _disk, pool) = create_file_pool(1);
    let page_id = fill(&pool, 1);
    let page_id = pool.fetch_page(page_id).unwrap().detach();

    assert!(pool.unpin_page(page_id, false).is_ok());
    assert!(matches!(
        pool.unpin_page(page_id, false),
        Err(BufferPoolError::AlreadyUnpinned(_))
    ));
}

#[test]
fn threads_share_pool_over_file() {
    let (_tmp, _disk, pool) = create_file_pool(4);
    let ids: Vec<_> = (0..4).map(|_| fill(&pool, 0)).collect();

    thread::scope(|s| {
        for (t, page_id) in ids.iter().enumerate() {
            let pool = &pool;
            s.spawn(move || {
                for _ in 0..20 {
                    let mut page = pool.fetch_page(*page_id).unwrap();
                    let mut data = page.write();
                    data[t] = data[t].wrapping_add(1);
                }
            });
        }
    });

    for (t, page_id) in ids.iter().enumerate() {
        let page = pool.fetch_page(*page_id).unwrap();
        assert_eq!(page.read()[t], 20);
    }
}
