//! Page allocation, fetching and the free-page list.
//!
//! The pager owns the mapping between page offsets and the storage
//! backend. Allocation prefers the free list (LIFO through the pages'
//! next-page link, so recently freed pages stay warm) and otherwise
//! extends the file by one page size. Freeing is deferred: during a
//! transaction, shadowed chains accumulate in a `freed` buffer and
//! only join the on-disk free list once the commit has rewritten the
//! global header; pages allocated by an abandoned transaction go back
//! to the free list on rollback.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::{record, PageIo};
use crate::{
    backend::StorageBackend,
    error::{
        CorruptedSnafu, EndOfFileSnafu, FreePageSnafu, InvalidOffsetSnafu, PageOffset, Result,
        NO_PAGE,
    },
};

/// Allocation counters, cheap enough to keep always on.
#[derive(Debug, Default)]
pub struct PagerStats {
    /// Pages created by extending the file.
    pub nb_created_pages: AtomicU64,
    /// Pages recycled from the free list.
    pub nb_reused_pages: AtomicU64,
    /// Pages returned to the free list.
    pub nb_freed_pages: AtomicU64,
    /// Physical page writes.
    pub nb_page_writes: AtomicU64,
}

/// Mutable pager state, guarded by one mutex. Only the single writer
/// mutates it; readers touch it just to learn the end-of-file bound.
struct PagerState {
    /// Head of the on-disk free-page list, or [`NO_PAGE`].
    first_free_page: PageOffset,
    /// Offset one past the last page (always a multiple of page size).
    end_of_file: u64,
    /// First offsets of chains shadowed by the running transaction.
    freed: Vec<PageOffset>,
    /// Offsets of single pages allocated by the running transaction.
    allocated: Vec<PageOffset>,
}

/// Fixed-size-page storage substrate with free-page recycling.
pub struct Pager<B: StorageBackend> {
    backend: B,
    page_size: usize,
    state: Mutex<PagerState>,
    stats: PagerStats,
}

impl<B: StorageBackend> Pager<B> {
    /// Wraps a backend. `end_of_file` must already be page-aligned.
    pub fn new(backend: B, page_size: usize, first_free_page: PageOffset, end_of_file: u64) -> Self {
        debug_assert_eq!(end_of_file % page_size as u64, 0);
        Self {
            backend,
            page_size,
            state: Mutex::new(PagerState {
                first_free_page,
                end_of_file,
                freed: Vec::new(),
                allocated: Vec::new(),
            }),
            stats: PagerStats::default(),
        }
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// The underlying backend, for header I/O and syncs.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Allocation counters.
    pub fn stats(&self) -> &PagerStats {
        &self.stats
    }

    /// Head of the free-page list, or [`NO_PAGE`].
    pub fn first_free_page(&self) -> PageOffset {
        self.state.lock().first_free_page
    }

    /// Offset one past the last page.
    pub fn end_of_file(&self) -> u64 {
        self.state.lock().end_of_file
    }

    /// Number of data pages in the file (the header page excluded).
    pub fn total_pages(&self) -> u64 {
        (self.end_of_file() / self.page_size as u64).saturating_sub(1)
    }

    /// Validates an offset: not the sentinel, within the file, aligned
    /// to the page size.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidOffset`] on violation.
    pub fn check_offset(&self, offset: PageOffset) -> Result<()> {
        let end_of_file = self.end_of_file();
        snafu::ensure!(
            offset != NO_PAGE && offset <= end_of_file && offset % self.page_size as u64 == 0,
            InvalidOffsetSnafu { offset }
        );
        Ok(())
    }

    /// Reads exactly one page at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidOffset`] for a bad offset and
    /// [`crate::Error::EndOfFile`] when the page lies past the end of
    /// the file.
    pub fn fetch(&self, offset: PageOffset) -> Result<PageIo> {
        self.check_offset(offset)?;
        let end_of_file = self.end_of_file();
        snafu::ensure!(
            offset + self.page_size as u64 <= end_of_file,
            EndOfFileSnafu { offset, file_size: end_of_file }
        );

        let mut data = vec![0u8; self.page_size];
        self.backend.read_exact_at(&mut data, offset)?;
        Ok(PageIo::from_bytes(offset, data))
    }

    /// Returns a zero-length page, popping the free list head when one
    /// is available and extending the file otherwise. The allocation
    /// is remembered so that a rollback can return it.
    ///
    /// # Errors
    ///
    /// Returns an error if reading the free list head fails.
    pub fn allocate(&self) -> Result<PageIo> {
        let mut state = self.state.lock();

        let page = if state.first_free_page == NO_PAGE {
            self.stats.nb_created_pages.fetch_add(1, Ordering::Relaxed);
            let offset = state.end_of_file;
            state.end_of_file += self.page_size as u64;
            PageIo::new(offset, self.page_size)
        } else {
            self.stats.nb_reused_pages.fetch_add(1, Ordering::Relaxed);
            let offset = state.first_free_page;
            let mut link = [0u8; 8];
            self.backend.read_exact_at(&mut link, offset)?;
            state.first_free_page = u64::from_be_bytes(link);
            PageIo::new(offset, self.page_size)
        };

        state.allocated.push(page.offset());
        Ok(page)
    }

    /// Allocates enough linked pages to hold `data_size` payload bytes
    /// and stamps the logical size on the first one.
    ///
    /// # Errors
    ///
    /// Returns an error if the free list cannot be read.
    pub fn reserve(&self, data_size: usize) -> Result<Vec<PageIo>> {
        let nb = record::pages_needed(self.page_size, data_size).max(1);
        let mut pages = Vec::with_capacity(nb);
        for _ in 0..nb {
            pages.push(self.allocate()?);
        }
        for i in 0..nb - 1 {
            let next = pages[i + 1].offset();
            pages[i].set_next_page(next);
        }
        pages[0].set_logical_size(data_size as u32);
        Ok(pages)
    }

    /// Writes each page at its own offset.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Io`] if a write fails.
    pub fn flush(&self, pages: &[PageIo]) -> Result<()> {
        for page in pages {
            self.backend.write_all_at(page.data(), page.offset())?;
            self.stats.nb_page_writes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Walks a chain from `offset` until either `limit` payload bytes
    /// are covered or the chain ends.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Corrupted`] on a cycle and the usual
    /// offset errors on bad links.
    pub fn read_chain(&self, offset: PageOffset, limit: u64) -> Result<Vec<PageIo>> {
        let first = self.fetch(offset)?;
        let mut next = first.next_page();
        let mut pages = vec![first];
        let mut covered = super::page_capacity(self.page_size, true) as u64;
        let max_pages = self.end_of_file() / self.page_size as u64;

        while covered < limit && next != NO_PAGE {
            snafu::ensure!(
                pages.len() as u64 <= max_pages,
                CorruptedSnafu { reason: format!("page chain cycle at {offset:#x}") }
            );
            let page = self.fetch(next)?;
            next = page.next_page();
            pages.push(page);
            covered += super::page_capacity(self.page_size, false) as u64;
        }
        Ok(pages)
    }

    /// Records a chain shadowed by the running transaction; it joins
    /// the free list when the transaction commits.
    pub fn shadow(&self, chain_first: PageOffset) {
        self.state.lock().freed.push(chain_first);
    }

    /// Offsets shadowed so far in the running transaction.
    pub fn shadowed_len(&self) -> usize {
        self.state.lock().freed.len()
    }

    /// Links every page of every shadowed chain into the free list.
    /// Called by the commit after the first header rewrite.
    ///
    /// # Errors
    ///
    /// Returns an error if a chain walk or a link write fails.
    pub fn release_freed(&self) -> Result<()> {
        let chains = {
            let mut state = self.state.lock();
            std::mem::take(&mut state.freed)
        };
        for chain_first in chains {
            for offset in self.chain_offsets(chain_first)? {
                self.free_one(offset)?;
            }
        }
        Ok(())
    }

    /// Returns every page allocated by the running transaction to the
    /// free list and forgets the shadow list. Called by rollback.
    ///
    /// # Errors
    ///
    /// Returns an error if a link write fails.
    pub fn release_allocated(&self) -> Result<()> {
        let (allocated, _) = {
            let mut state = self.state.lock();
            (std::mem::take(&mut state.allocated), std::mem::take(&mut state.freed))
        };
        for offset in allocated {
            self.free_one(offset)?;
        }
        Ok(())
    }

    /// Forgets the per-transaction allocation list. Called by commit
    /// once the allocations became reachable from the new header.
    pub fn clear_transaction_lists(&self) {
        let mut state = self.state.lock();
        state.allocated.clear();
        state.freed.clear();
    }

    /// The page offsets of the chain starting at `first`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Corrupted`] on a cycle.
    pub fn chain_offsets(&self, first: PageOffset) -> Result<Vec<PageOffset>> {
        let max_pages = self.end_of_file() / self.page_size as u64;
        let mut offsets = Vec::new();
        let mut current = first;
        while current != NO_PAGE {
            snafu::ensure!(
                offsets.len() as u64 <= max_pages,
                CorruptedSnafu { reason: format!("page chain cycle at {first:#x}") }
            );
            offsets.push(current);
            let mut link = [0u8; 8];
            self.check_offset(current)?;
            self.backend.read_exact_at(&mut link, current)?;
            current = u64::from_be_bytes(link);
        }
        Ok(offsets)
    }

    /// Pushes one page onto the free-list head by rewriting its link.
    fn free_one(&self, offset: PageOffset) -> Result<()> {
        let mut state = self.state.lock();
        let link = state.first_free_page.to_be_bytes();
        self.backend.write_all_at(&link, offset)?;
        state.first_free_page = offset;
        self.stats.nb_freed_pages.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Walks the free list, validating acyclicity and bounds.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::FreePage`] on a cycle or an offset
    /// outside the file.
    pub fn walk_free_list(&self) -> Result<Vec<PageOffset>> {
        let end_of_file = self.end_of_file();
        let max_pages = end_of_file / self.page_size as u64;
        let mut offsets = Vec::new();
        let mut current = self.first_free_page();

        while current != NO_PAGE {
            snafu::ensure!(
                current < end_of_file && current % self.page_size as u64 == 0,
                FreePageSnafu { reason: format!("offset {current:#x} outside the file") }
            );
            snafu::ensure!(
                offsets.len() as u64 <= max_pages,
                FreePageSnafu { reason: format!("cycle at {current:#x}") }
            );
            offsets.push(current);
            let mut link = [0u8; 8];
            self.backend.read_exact_at(&mut link, current)?;
            current = u64::from_be_bytes(link);
        }
        Ok(offsets)
    }
}
