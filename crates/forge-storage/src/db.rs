//! The engine boundary: a thin facade over the B+ tree and pager.
//!
//! Outer layers (the CLI, tests) talk to [`Database`] and never touch
//! pages directly. All operations are synchronous and single-writer;
//! callers needing concurrency must serialise access externally.

use std::path::Path;

use forge_common::{ForgeResult, PageId};

use crate::bloom::BloomStats;
use crate::btree::{BTree, Rows};
use crate::pager::{DbHeader, Pager, PoolStats};
use crate::row::Row;

/// A ForgeDB database: one file, one writer.
///
/// # Example
///
/// ```rust,no_run
/// use forge_storage::{Database, Row};
///
/// fn example() -> forge_common::ForgeResult<()> {
///     let mut db = Database::open("my_database.db")?;
///     db.insert(Row::new(1, "alice", "alice@example.com"))?;
///     assert!(db.find(1)?.is_some());
///     for row in db.all()? {
///         println!("{:?}", row?);
///     }
///     db.close()
/// }
/// ```
pub struct Database {
    tree: BTree,
}

impl Database {
    /// Opens (or creates) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> ForgeResult<Self> {
        let pager = Pager::open(path)?;
        Ok(Self {
            tree: BTree::new(pager)?,
        })
    }

    /// Inserts a row, rejecting duplicate ids with
    /// [`ForgeError::DuplicateKey`](forge_common::ForgeError::DuplicateKey).
    pub fn insert(&mut self, row: Row) -> ForgeResult<()> {
        self.tree.insert(&row)
    }

    /// Removes the row with `id`, reporting
    /// [`ForgeError::KeyNotFound`](forge_common::ForgeError::KeyNotFound)
    /// for absent keys.
    pub fn remove(&mut self, id: u32) -> ForgeResult<()> {
        self.tree.remove(id)
    }

    /// Point lookup by id.
    pub fn find(&mut self, id: u32) -> ForgeResult<Option<Row>> {
        self.tree.find_row(id)
    }

    /// Lazily yields every row in ascending key order.
    pub fn all(&mut self) -> ForgeResult<Rows<'_>> {
        self.tree.all()
    }

    /// Lazily yields rows with `lo <= id <= hi` in ascending key order.
    pub fn range(&mut self, lo: u32, hi: u32) -> ForgeResult<Rows<'_>> {
        self.tree.range(lo, hi)
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    /// Returns a copy of the database header.
    pub fn stats(&self) -> DbHeader {
        *self.tree.pager().header()
    }

    /// Returns buffer pool statistics.
    pub fn pool_stats(&self) -> PoolStats {
        self.tree.pager().stats()
    }

    /// Walks the free list and returns the page numbers in chain order.
    pub fn free_list(&mut self) -> ForgeResult<Vec<PageId>> {
        self.tree.pager_mut().free_list()
    }

    /// Renders the tree as an indented text outline.
    pub fn tree_dump(&mut self) -> ForgeResult<String> {
        self.tree.tree_dump()
    }

    /// Renders the tree as a JSON document.
    pub fn json_dump(&mut self) -> ForgeResult<String> {
        self.tree.json_dump()
    }

    /// Returns Bloom filter occupancy statistics.
    pub fn bloom_stats(&mut self) -> ForgeResult<BloomStats> {
        self.tree.bloom_stats()
    }

    /// Rebuilds the Bloom filter from the leaf chain, shedding bits left
    /// stale by deletes.
    pub fn rebuild_bloom(&mut self) -> ForgeResult<()> {
        self.tree.rebuild_bloom()
    }

    /// Places a page on the free list. Restricted to pages above the
    /// root; intended for repair tooling, not normal operation.
    pub fn free_page(&mut self, page: u32) -> ForgeResult<()> {
        self.tree.pager_mut().free_page(PageId::new(page))
    }

    /// Persists the header, flushes every dirty page, and closes the
    /// file. Dropping the database does the same on a best-effort basis.
    pub fn close(mut self) -> ForgeResult<()> {
        self.tree.pager_mut().close()
    }
}
