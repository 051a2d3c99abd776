//! Owns the backing file and its memory mapping. Provides page addressing,
//! allocation/free-list management, copy-on-write isolation of in-flight
//! transactions, and commit/rollback synchronized against the metadata page.
//!
//! The whole file is mapped once and grown by doubling. A transaction
//! isolates its writes with per-page snapshots taken on first write, so
//! rollback just restores those bytes and commit just flushes the mapping.

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

use fs2::FileExt;
use memmap2::{MmapMut, MmapOptions};

use crate::config::{PageId, INITIAL_PAGE_COUNT, META_PID, PAGE_SIZE};
use crate::error::{Error, Result};
use crate::meta::{Metadata, METADATA_SIZE};

pub struct Pager {
    file: File,
    mmap: MmapMut,
    /// Pages the current mapping physically covers (may exceed `meta.page_count`
    /// after a doubling grow that hasn't been fully handed out yet).
    mapped_pages: u32,
    meta: Metadata,
    meta_before_tx: Option<Metadata>,
    tx_active: bool,
    dirty: HashSet<PageId>,
    snapshots: HashMap<PageId, Box<[u8]>>,
}

impl Pager {
    /// Opens or creates the database file at `path`, taking an exclusive
    /// advisory lock. On a fresh (zero-length) file this extends it to
    /// [`INITIAL_PAGE_COUNT`] pages and writes an initial metadata page.
    pub fn init(path: &Path) -> Result<Pager> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Err(Error::LockBusy),
            Err(err) => return Err(Error::Io(err)),
        }

        let file_len = file.metadata()?.len();
        let meta = if file_len == 0 {
            log::info!("creating new database at {}", path.display());
            file.set_len(INITIAL_PAGE_COUNT as u64 * PAGE_SIZE as u64)?;
            let meta = Metadata::fresh(INITIAL_PAGE_COUNT);
            let mut buf = [0u8; PAGE_SIZE];
            meta.write_into(&mut buf);
            {
                use std::io::Write;
                let mut f = &file;
                f.write_all(&buf)?;
            }
            meta
        } else {
            log::debug!("reopening existing database at {}", path.display());
            let mut buf = [0u8; METADATA_SIZE];
            {
                use std::io::Read;
                let mut f = &file;
                f.read_exact(&mut buf)?;
            }
            let meta = Metadata::read_from(&buf);
            if meta.magic != crate::config::MAGIC {
                return Err(Error::InvalidDatabase);
            }
            meta
        };

        let mmap = unsafe { MmapOptions::new().map_mut(&file)? };
        let mapped_pages = (mmap.len() / PAGE_SIZE) as u32;

        Ok(Pager {
            file,
            mmap,
            mapped_pages,
            meta,
            meta_before_tx: None,
            tx_active: false,
            dirty: HashSet::new(),
            snapshots: HashMap::new(),
        })
    }

    /// Releases snapshot buffers, unmaps, releases the file lock and closes
    /// the file. Equivalent to dropping the pager; kept as an explicit call
    /// so callers can observe and propagate the final sync error.
    pub fn deinit(mut self) -> Result<()> {
        self.snapshots.clear();
        self.mmap.flush()?;
        FileExt::unlock(&self.file)?;
        Ok(())
    }

    pub fn meta(&self) -> &Metadata {
        &self.meta
    }

    pub fn root_page(&self) -> PageId {
        self.meta.root_page
    }

    /// Updates the cached root page id. Persisted to the metadata page at
    /// the next `commit_tx`.
    pub fn set_root_page(&mut self, page_id: PageId) -> Result<()> {
        if !self.tx_active {
            return Err(Error::NoActiveTransaction);
        }
        self.meta.root_page = page_id;
        Ok(())
    }

    fn bounds_check(&self, page_id: PageId) -> Result<()> {
        if page_id >= self.meta.page_count {
            return Err(Error::PageOutOfBounds {
                page_id,
                page_count: self.meta.page_count,
            });
        }
        Ok(())
    }

    pub fn begin_tx(&mut self) -> Result<()> {
        if self.tx_active {
            return Err(Error::TransactionActive);
        }
        self.tx_active = true;
        self.meta_before_tx = Some(self.meta);
        Ok(())
    }

    /// Flushes dirty pages (the durability barrier) and, if anything changed,
    /// bumps `tx_id` and persists the metadata page. A commit with no dirty
    /// pages is a no-op and does not bump `tx_id`.
    pub fn commit_tx(&mut self) -> Result<()> {
        if !self.tx_active {
            return Err(Error::NoActiveTransaction);
        }
        if !self.dirty.is_empty() {
            self.meta.tx_id += 1;
            let mut buf = [0u8; METADATA_SIZE];
            self.meta.write_into(&mut buf);
            self.mmap[0..METADATA_SIZE].copy_from_slice(&buf);
            self.mmap.flush()?;
            log::debug!(
                "committed tx {} ({} dirty pages)",
                self.meta.tx_id,
                self.dirty.len()
            );
        }
        self.dirty.clear();
        self.snapshots.clear();
        self.meta_before_tx = None;
        self.tx_active = false;
        Ok(())
    }

    /// Restores every modified page from its pre-transaction snapshot and
    /// discards the in-memory metadata changes. No-op if no transaction is
    /// active.
    pub fn rollback_tx(&mut self) -> Result<()> {
        if !self.tx_active {
            return Ok(());
        }
        for (pid, snapshot) in self.snapshots.drain() {
            let off = pid as usize * PAGE_SIZE;
            self.mmap[off..off + PAGE_SIZE].copy_from_slice(&snapshot);
        }
        self.dirty.clear();
        if let Some(before) = self.meta_before_tx.take() {
            self.meta = before;
        }
        self.tx_active = false;
        Ok(())
    }

    /// Readable without an active transaction.
    pub fn get_page(&self, page_id: PageId) -> Result<&[u8]> {
        self.bounds_check(page_id)?;
        let off = page_id as usize * PAGE_SIZE;
        Ok(&self.mmap[off..off + PAGE_SIZE])
    }

    /// On first write to `page_id` within the current transaction, snapshots
    /// its pre-transaction bytes for rollback, then returns a mutable view
    /// directly into the mapping. Mutations are visible to subsequent reads
    /// within the same transaction immediately.
    pub fn get_page_for_write(&mut self, page_id: PageId) -> Result<&mut [u8]> {
        if !self.tx_active {
            return Err(Error::NoActiveTransaction);
        }
        self.bounds_check(page_id)?;
        let off = page_id as usize * PAGE_SIZE;
        if !self.dirty.contains(&page_id) {
            let snapshot = self.mmap[off..off + PAGE_SIZE].to_vec().into_boxed_slice();
            self.snapshots.insert(page_id, snapshot);
            self.dirty.insert(page_id);
        }
        Ok(&mut self.mmap[off..off + PAGE_SIZE])
    }

    /// From the free list if non-empty, otherwise by extending `page_count`
    /// (growing and remapping the file first if physical capacity is
    /// exhausted). Newly allocated pages are not zeroed here.
    pub fn alloc_page(&mut self) -> Result<PageId> {
        if !self.tx_active {
            return Err(Error::NoActiveTransaction);
        }
        if self.meta.free_list_head != 0 {
            let pid = self.meta.free_list_head;
            let off = pid as usize * PAGE_SIZE;
            let next = u32::from_le_bytes(self.mmap[off..off + 4].try_into().unwrap());
            self.meta.free_list_head = next;
            log::debug!("alloc_page {pid} from free list");
            return Ok(pid);
        }
        if self.meta.page_count == self.mapped_pages {
            let new_mapped = (self.mapped_pages.max(1)) * 2;
            self.grow_mapping(new_mapped)?;
        }
        let pid = self.meta.page_count;
        self.meta.page_count += 1;
        log::debug!("alloc_page {pid} by extending page_count");
        Ok(pid)
    }

    /// Writes `free_list_head` into the first 4 bytes of `page_id` and links
    /// it in as the new head. Refuses to free the metadata page.
    pub fn free_page(&mut self, page_id: PageId) -> Result<()> {
        if !self.tx_active {
            return Err(Error::NoActiveTransaction);
        }
        if page_id == META_PID {
            return Err(Error::CannotFreeMetaPage);
        }
        let prev_head = self.meta.free_list_head;
        let page = self.get_page_for_write(page_id)?;
        page[0..4].copy_from_slice(&prev_head.to_le_bytes());
        self.meta.free_list_head = page_id;
        Ok(())
    }

    /// Extends the file and remaps if `new_page_count` exceeds the pages
    /// currently mapped. Invalidates all outstanding page references, which
    /// the borrow checker enforces since `grow` takes `&mut self`.
    pub fn grow(&mut self, new_page_count: u32) -> Result<()> {
        if new_page_count > self.mapped_pages {
            self.grow_mapping(new_page_count)?;
        }
        Ok(())
    }

    fn grow_mapping(&mut self, new_mapped_pages: u32) -> Result<()> {
        self.file
            .set_len(new_mapped_pages as u64 * PAGE_SIZE as u64)?;
        self.mmap.flush()?;
        let mmap = unsafe { MmapOptions::new().map_mut(&self.file)? };
        self.mmap = mmap;
        self.mapped_pages = new_mapped_pages;
        log::debug!("grew mapping to {new_mapped_pages} pages");
        Ok(())
    }
}

impl Drop for Pager {
    fn drop(&mut self) {
        if self.tx_active {
            let _ = self.rollback_tx();
        }
        let _ = self.mmap.flush();
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open(dir: &tempfile::TempDir, name: &str) -> Pager {
        Pager::init(&dir.path().join(name)).unwrap()
    }

    #[test]
    fn fresh_file_has_expected_metadata() {
        let dir = tempdir().unwrap();
        let pager = open(&dir, "a.db");
        assert_eq!(pager.meta().magic, crate::config::MAGIC);
        assert_eq!(pager.meta().page_count, INITIAL_PAGE_COUNT);
        assert_eq!(pager.meta().root_page, 0);
        assert_eq!(pager.meta().tx_id, 0);
    }

    #[test]
    fn alloc_and_write_then_commit_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.db");
        {
            let mut pager = Pager::init(&path).unwrap();
            pager.begin_tx().unwrap();
            let pid = pager.alloc_page().unwrap();
            let page = pager.get_page_for_write(pid).unwrap();
            page[0] = 0xAB;
            pager.commit_tx().unwrap();
            assert_eq!(pager.meta().tx_id, 1);
        }
        let pager = Pager::init(&path).unwrap();
        assert_eq!(pager.get_page(INITIAL_PAGE_COUNT).unwrap()[0], 0xAB);
    }

    #[test]
    fn rollback_restores_original_bytes() {
        let dir = tempdir().unwrap();
        let mut pager = open(&dir, "a.db");
        pager.begin_tx().unwrap();
        let pid = pager.alloc_page().unwrap();
        pager.commit_tx().unwrap();

        pager.begin_tx().unwrap();
        let before = pager.get_page(pid).unwrap().to_vec();
        let page = pager.get_page_for_write(pid).unwrap();
        page[0] = 0xFF;
        pager.rollback_tx().unwrap();
        assert_eq!(pager.get_page(pid).unwrap(), &before[..]);
        assert_eq!(pager.meta().tx_id, 1);
    }

    #[test]
    fn no_op_commit_does_not_bump_tx_id() {
        let dir = tempdir().unwrap();
        let mut pager = open(&dir, "a.db");
        pager.begin_tx().unwrap();
        pager.commit_tx().unwrap();
        assert_eq!(pager.meta().tx_id, 0);
    }

    #[test]
    fn double_begin_tx_fails() {
        let dir = tempdir().unwrap();
        let mut pager = open(&dir, "a.db");
        pager.begin_tx().unwrap();
        assert!(matches!(pager.begin_tx(), Err(Error::TransactionActive)));
    }

    #[test]
    fn mutating_without_tx_fails() {
        let dir = tempdir().unwrap();
        let mut pager = open(&dir, "a.db");
        assert!(matches!(
            pager.alloc_page(),
            Err(Error::NoActiveTransaction)
        ));
    }

    #[test]
    fn cannot_free_meta_page() {
        let dir = tempdir().unwrap();
        let mut pager = open(&dir, "a.db");
        pager.begin_tx().unwrap();
        assert!(matches!(
            pager.free_page(META_PID),
            Err(Error::CannotFreeMetaPage)
        ));
    }

    #[test]
    fn free_then_alloc_reuses_page() {
        let dir = tempdir().unwrap();
        let mut pager = open(&dir, "a.db");
        pager.begin_tx().unwrap();
        let pid = pager.alloc_page().unwrap();
        pager.free_page(pid).unwrap();
        let reused = pager.alloc_page().unwrap();
        pager.commit_tx().unwrap();
        assert_eq!(pid, reused);
    }

    #[test]
    fn page_out_of_bounds_is_rejected() {
        let dir = tempdir().unwrap();
        let pager = open(&dir, "a.db");
        assert!(matches!(
            pager.get_page(INITIAL_PAGE_COUNT + 1000),
            Err(Error::PageOutOfBounds { .. })
        ));
    }

    #[test]
    fn growth_doubles_physical_capacity() {
        let dir = tempdir().unwrap();
        let mut pager = open(&dir, "a.db");
        pager.begin_tx().unwrap();
        for _ in 0..(INITIAL_PAGE_COUNT) {
            pager.alloc_page().unwrap();
        }
        pager.commit_tx().unwrap();
        assert!(pager.mapped_pages >= INITIAL_PAGE_COUNT * 2);
    }

    #[test]
    fn second_open_sees_lock_busy() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.db");
        let _pager = Pager::init(&path).unwrap();
        assert!(matches!(Pager::init(&path), Err(Error::LockBusy)));
    }

    #[test]
    fn reopen_rejects_bad_magic() {
        use std::io::Write;
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.db");
        {
            let mut f = std::fs::File::create(&path).unwrap();
            f.write_all(&[0u8; PAGE_SIZE]).unwrap();
        }
        assert!(matches!(Pager::init(&path), Err(Error::InvalidDatabase)));
    }
}
