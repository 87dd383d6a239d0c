use anyhow::Result;
use mapjournal::cache::{Access, MappingManager, PageHandle};
use mapjournal::journal::{JournalHeader, JournalParameters, ListDescriptor, RecoveryStatus};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use tempfile::tempdir;

const PAGE_SIZE: usize = 4096;

fn open_file(path: &Path, len: u64) -> Result<Arc<File>> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    if file.metadata()?.len() < len {
        file.set_len(len)?;
    }
    Ok(Arc::new(file))
}

fn new_header(user_data_size: u32) -> Result<JournalHeader> {
    let params = JournalParameters::default();
    let header_size = JournalHeader::required_header_size(user_data_size, PAGE_SIZE as u32);
    Ok(JournalHeader::init(
        header_size as u32,
        32,
        params.page_data_size(),
        PAGE_SIZE as u32,
        user_data_size,
        &params,
    )?)
}

/// Reopens the file with a fresh cache, as a restarted process would.
fn reopen_header(path: &Path) -> Result<JournalHeader> {
    let cache = MappingManager::new(1 << 20, 2);
    let file = open_file(path, 0)?;
    let page = cache.add_page(&file, 0, PAGE_SIZE, Access::ReadOnly, 0, None);
    let header = {
        let guard = cache.read_page(&page)?;
        JournalHeader::open(&guard)
    };
    cache.remove_page(page);
    Ok(header?)
}

#[test]
fn test_header_survives_crash_through_mapped_page() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("journal.dat");

    {
        let mut header = new_header(8)?;
        let file = open_file(&path, header.calculate_file_size(4))?;
        let cache = MappingManager::new(1 << 20, 2);
        let dirty = cache.create_dirty_list();
        let page = cache.add_page(&file, 0, PAGE_SIZE, Access::ReadWrite, 1, Some(dirty));

        header.set_num_pages(4);
        header.user_data_mut().copy_from_slice(b"mapjrnl!");
        *header.fill_pages_mut() = ListDescriptor {
            first: 0,
            last: 3,
            count: 4,
        };
        header.commit_active_state();
        header.write_to(&mut cache.write_page(&page)?)?;
        assert_eq!(cache.flush_dirty_list(dirty, true)?, 1);

        // Work in progress reaches the file but is never committed
        header.set_num_pages(40);
        header.fill_pages_mut().count = 40;
        header.write_active_state(&mut cache.write_page(&page)?)?;
        assert_eq!(cache.flush_dirty_list(dirty, true)?, 1);

        cache.remove_page(page);
        cache.delete_dirty_list(dirty);
    }

    let recovered = reopen_header(&path)?;
    assert_eq!(recovered.num_pages(), 4);
    assert_eq!(recovered.fill_pages().count, 4);
    assert_eq!(recovered.user_data(), b"mapjrnl!");
    assert_eq!(recovered.last_committed_transaction_id(), 1);
    assert_eq!(recovered.current_transaction_id(), 2);
    Ok(())
}

#[test]
fn test_torn_commit_recovers_previous_state() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("journal.dat");

    let mut header = new_header(0)?;
    let file = open_file(&path, header.calculate_file_size(1))?;
    let cache = MappingManager::new(1 << 20, 2);
    let dirty = cache.create_dirty_list();
    let page = cache.add_page(&file, 0, PAGE_SIZE, Access::ReadWrite, 0, Some(dirty));

    header.set_num_pages(1);
    header.commit_active_state();
    header.write_to(&mut cache.write_page(&page)?)?;
    cache.flush_dirty_list(dirty, true)?;

    header.set_num_pages(2);
    *header.fill_pages_mut() = ListDescriptor {
        first: 1,
        last: 1,
        count: 1,
    };
    header.commit_active_state();
    let mut next = vec![0u8; PAGE_SIZE];
    header.write_to(&mut next)?;

    // Only the start of the new committed slot makes it to disk
    let committed = 1 - header.active_index();
    let start = 56 + committed * 72;
    {
        let mut guard = cache.write_page(&page)?;
        guard[start..start + 30].copy_from_slice(&next[start..start + 30]);
    }
    cache.flush_dirty_list(dirty, true)?;
    cache.remove_page(page);
    cache.delete_dirty_list(dirty);

    let recovered = reopen_header(&path)?;
    assert_eq!(recovered.num_pages(), 1);
    assert!(recovered.fill_pages().is_empty());
    assert_eq!(recovered.last_committed_transaction_id(), 1);
    Ok(())
}

#[test]
fn test_recovery_twice_is_a_no_op() -> Result<()> {
    let mut header = new_header(0)?;
    header.set_num_pages(3);
    header.commit_active_state();
    header.set_num_pages(6);
    header.commit_active_state();
    let mut buf = vec![0u8; PAGE_SIZE];
    header.write_to(&mut buf)?;

    let mut first = JournalHeader::open(&buf)?;
    let status = first.recover_transaction(&buf)?;
    assert_eq!(
        status,
        RecoveryStatus::Recovered {
            committed_slot: 1 - header.active_index(),
            committed_transaction_id: 2,
        }
    );
    assert_eq!(first.active_state(), header.active_state());
    assert_eq!(first.active_index(), header.active_index());
    Ok(())
}

#[test]
fn test_concurrent_use_under_eviction() -> Result<()> {
    let dir = tempdir()?;
    let pages_per_thread = 8;
    let threads = 4;
    let file = open_file(
        &dir.path().join("pages.dat"),
        (pages_per_thread * threads * PAGE_SIZE) as u64,
    )?;
    // Room for about a quarter of the pages
    let cache = MappingManager::new(pages_per_thread * PAGE_SIZE, 2);

    let handles: Vec<Vec<PageHandle>> = (0..threads)
        .map(|t| {
            (0..pages_per_thread)
                .map(|p| {
                    let offset = ((t * pages_per_thread + p) * PAGE_SIZE) as u64;
                    cache.add_page(&file, offset, PAGE_SIZE, Access::ReadWrite, p % 2, None)
                })
                .collect()
        })
        .collect();

    thread::scope(|scope| -> Result<()> {
        let mut workers = Vec::new();
        for (t, pages) in handles.iter().enumerate() {
            let cache = &cache;
            workers.push(scope.spawn(move || -> Result<()> {
                for round in 0..20u8 {
                    for (p, page) in pages.iter().enumerate() {
                        let mut guard = cache.write_page(page)?;
                        guard[0] = t as u8;
                        guard[1] = p as u8;
                        guard[2] = round;
                    }
                    for (p, page) in pages.iter().enumerate() {
                        let guard = cache.read_page(page)?;
                        assert_eq!(&guard[..3], &[t as u8, p as u8, round]);
                    }
                }
                Ok(())
            }));
        }
        for worker in workers {
            worker.join().expect("worker panicked")?;
        }
        Ok(())
    })?;

    for page in handles.iter().flatten() {
        assert_eq!(cache.page_use_count(page), 0);
    }
    assert!(cache.total_mapped() <= cache.mapping_limit());
    assert!(cache.map_count_reset() > (threads * pages_per_thread) as u64);

    for page in handles.into_iter().flatten() {
        cache.remove_page(page);
    }
    assert_eq!(cache.total_mapped(), 0);
    Ok(())
}

#[test]
fn test_shared_page_refcounts_across_threads() -> Result<()> {
    let dir = tempdir()?;
    let file = open_file(&dir.path().join("pages.dat"), PAGE_SIZE as u64)?;
    let cache = MappingManager::new(1 << 20, 2);
    let page = cache.add_page(&file, 0, PAGE_SIZE, Access::ReadOnly, 0, None);

    thread::scope(|scope| {
        for _ in 0..8 {
            scope.spawn(|| {
                for _ in 0..500 {
                    let guard = cache.read_page(&page).expect("map header page");
                    assert_eq!(guard.len(), PAGE_SIZE);
                }
            });
        }
    });

    assert_eq!(cache.page_use_count(&page), 0);
    assert_eq!(cache.map_count_reset(), 1);
    cache.remove_page(page);
    Ok(())
}

#[test]
fn test_priority_tiers_evict_in_order() -> Result<()> {
    let dir = tempdir()?;
    let file = open_file(&dir.path().join("pages.dat"), 8 * PAGE_SIZE as u64)?;
    // Budget fits three pages before the fourth forces an eviction
    let cache = MappingManager::new(4 * PAGE_SIZE, 3);

    let low = cache.add_page(&file, 0, PAGE_SIZE, Access::ReadOnly, 0, None);
    let mid = cache.add_page(&file, PAGE_SIZE as u64, PAGE_SIZE, Access::ReadOnly, 1, None);
    let high = cache.add_page(&file, 2 * PAGE_SIZE as u64, PAGE_SIZE, Access::ReadOnly, 2, None);
    for page in [&high, &mid, &low] {
        drop(cache.read_page(page)?);
    }
    assert_eq!(cache.map_count_reset(), 3);

    let extra = cache.add_page(&file, 3 * PAGE_SIZE as u64, PAGE_SIZE, Access::ReadOnly, 2, None);
    drop(cache.read_page(&extra)?);
    assert_eq!(cache.total_mapped(), 3 * PAGE_SIZE);
    assert_eq!(cache.map_count_reset(), 1);

    // The high and mid pages stayed mapped; the low one did not
    drop(cache.read_page(&high)?);
    drop(cache.read_page(&mid)?);
    assert_eq!(cache.map_count_reset(), 0);
    drop(cache.read_page(&low)?);
    assert_eq!(cache.map_count_reset(), 1);

    for page in [low, mid, high, extra] {
        cache.remove_page(page);
    }
    Ok(())
}

#[test]
fn test_random_operations_keep_invariants() -> Result<()> {
    let dir = tempdir()?;
    let sizes: Vec<usize> = vec![PAGE_SIZE, 2 * PAGE_SIZE, PAGE_SIZE, 3 * PAGE_SIZE, PAGE_SIZE, 2 * PAGE_SIZE];
    let total: usize = sizes.iter().sum();
    let file = open_file(&dir.path().join("pages.dat"), total as u64)?;
    let limit = 5 * PAGE_SIZE;
    let cache = MappingManager::new(limit, 2);
    let dirty = cache.create_dirty_list();

    let mut offset = 0u64;
    let pages: Vec<PageHandle> = sizes
        .iter()
        .enumerate()
        .map(|(i, &size)| {
            let page = cache.add_page(&file, offset, size, Access::ReadWrite, i % 2, Some(dirty));
            offset += size as u64;
            page
        })
        .collect();

    let mut rng = StdRng::seed_from_u64(0x6a6f_7572);
    let mut uses = vec![0u32; pages.len()];
    let mut peak_in_use = 0usize;

    for _ in 0..2000 {
        let i = rng.gen_range(0..pages.len());
        match rng.gen_range(0..10) {
            0..=3 => {
                let data = cache.use_page(&pages[i], rng.gen_bool(0.3))?;
                uses[i] += 1;
                // The first byte of every page holds its index
                unsafe {
                    let first = data.as_ptr();
                    if *first == 0 {
                        *first = i as u8 + 1;
                    }
                    assert_eq!(*first, i as u8 + 1);
                }
            }
            4..=7 if uses[i] > 0 => {
                cache.release_page(&pages[i]);
                uses[i] -= 1;
            }
            8 => {
                cache.flush_dirty_list(dirty, false)?;
                assert_eq!(cache.dirty_list_len(dirty), 0);
            }
            9 => {
                cache.clear_dirty_list(dirty);
            }
            _ => {}
        }

        let in_use: usize = uses
            .iter()
            .zip(&sizes)
            .filter(|(count, _)| **count > 0)
            .map(|(_, size)| size)
            .sum();
        peak_in_use = peak_in_use.max(in_use);

        for (page, count) in pages.iter().zip(&uses) {
            assert_eq!(cache.page_use_count(page), *count);
        }
        let dirty_pages = pages.iter().filter(|page| cache.is_page_dirty(page)).count();
        assert_eq!(cache.dirty_list_len(dirty), dirty_pages);
        assert!(cache.total_mapped() <= limit.max(peak_in_use));
    }

    for (page, count) in pages.iter().zip(&uses) {
        for _ in 0..*count {
            cache.release_page(page);
        }
    }
    cache.clear_dirty_list(dirty);
    for page in pages {
        cache.remove_page(page);
    }
    cache.delete_dirty_list(dirty);
    assert_eq!(cache.total_mapped(), 0);
    Ok(())
}
