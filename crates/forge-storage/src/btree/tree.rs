//! B+ tree operations: lookup, insertion with splits, deletion with
//! rebalancing, iteration, and Bloom filter maintenance.

use forge_common::constants::{
    BLOOM_OFFSET, HEADER_PAGE, INTERNAL_MAX_CELLS, INTERNAL_MIN_KEYS, LEAF_MIN_CELLS,
    LEAF_USABLE_SPACE, ROOT_PAGE, SLOT_SIZE,
};
use forge_common::{ForgeError, ForgeResult, PageId};
use tracing::debug;

use super::cursor::{Cursor, Rows};
use crate::bloom::{BloomFilter, BloomFilterMut, BloomStats};
use crate::page::node;
use crate::page::types::PageType;
use crate::page::{InternalPage, InternalPageRef, LeafPage, LeafPageRef};
use crate::pager::Pager;
use crate::row::Row;

/// B+ tree over a pager.
///
/// The root always lives at page 1: root growth moves the old root's
/// contents to a fresh page and rewrites page 1 in place, so outer code
/// never tracks a root page number.
pub struct BTree {
    pub(crate) pager: Pager,
}

impl BTree {
    /// Attaches a tree to a pager, bootstrapping an empty root leaf on a
    /// fresh database and rebuilding the Bloom filter from the leaf chain
    /// (open-time rebuild repairs bits left stale by deletes).
    pub fn new(mut pager: Pager) -> ForgeResult<Self> {
        if pager.header().total_pages <= ROOT_PAGE {
            pager.header_mut().total_pages = ROOT_PAGE + 1;
            {
                let guard = pager.fetch(PageId::new(ROOT_PAGE))?;
                let mut data = guard.data_mut();
                let mut root = LeafPage::new(&mut data);
                root.initialize();
                root.set_root(true);
            }
            pager.write_header()?;
            debug!("bootstrapped empty root leaf");
        }

        let mut tree = Self { pager };
        tree.rebuild_bloom()?;
        Ok(tree)
    }

    /// Returns the underlying pager.
    #[inline]
    pub fn pager(&self) -> &Pager {
        &self.pager
    }

    /// Returns the underlying pager mutably.
    #[inline]
    pub fn pager_mut(&mut self) -> &mut Pager {
        &mut self.pager
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Descends from the root to the leaf that owns `key`, recording the
    /// internal ancestors on the way down.
    fn find(&mut self, key: u32) -> ForgeResult<Cursor> {
        let mut page = PageId::new(ROOT_PAGE);
        let mut path = Vec::new();

        loop {
            let next = {
                let guard = self.pager.fetch(page)?;
                let data = guard.data();
                match node::page_type(&data) {
                    Some(PageType::Leaf) => None,
                    Some(PageType::Internal) => {
                        Some(InternalPageRef::new(&data).find_child(key))
                    }
                    _ => {
                        return Err(ForgeError::invariant(format!(
                            "page {page} has no valid node type"
                        )))
                    }
                }
            };
            match next {
                None => return Ok(Cursor { page, path }),
                Some(child) => {
                    path.push(page);
                    page = child;
                }
            }
        }
    }

    /// Point lookup through the Bloom gate.
    ///
    /// A negative Bloom answer returns without touching the tree; a
    /// positive one descends and verifies, so a false positive still
    /// resolves to `None`.
    pub fn find_row(&mut self, id: u32) -> ForgeResult<Option<Row>> {
        if !self.bloom_contains(id)? {
            debug!(key = id, "bloom definite negative, zero page reads");
            return Ok(None);
        }

        let cursor = self.find(id)?;
        let guard = self.pager.fetch(cursor.page)?;
        let data = guard.data();
        let leaf = LeafPageRef::new(&data);
        match leaf.search(id) {
            Ok(i) => Ok(Some(leaf.row(i))),
            Err(_) => {
                debug!(key = id, "bloom false positive");
                Ok(None)
            }
        }
    }

    /// Returns the leftmost leaf (descend through child 0 until a leaf).
    pub(crate) fn leftmost_leaf(&mut self) -> ForgeResult<PageId> {
        let mut page = PageId::new(ROOT_PAGE);
        loop {
            let next = {
                let guard = self.pager.fetch(page)?;
                let data = guard.data();
                match node::page_type(&data) {
                    Some(PageType::Leaf) => None,
                    Some(PageType::Internal) => Some(InternalPageRef::new(&data).child(0)),
                    _ => {
                        return Err(ForgeError::invariant(format!(
                            "page {page} has no valid node type"
                        )))
                    }
                }
            };
            match next {
                None => return Ok(page),
                Some(child) => page = child,
            }
        }
    }

    /// Lazily yields every row in ascending key order.
    pub fn all(&mut self) -> ForgeResult<Rows<'_>> {
        let start = self.leftmost_leaf()?;
        Ok(Rows::new(&mut self.pager, start, 0, u32::MAX))
    }

    /// Lazily yields the rows with `lo <= id <= hi` in ascending order.
    pub fn range(&mut self, lo: u32, hi: u32) -> ForgeResult<Rows<'_>> {
        let cursor = self.find(lo)?;
        Ok(Rows::new(&mut self.pager, cursor.page, lo, hi))
    }

    // =========================================================================
    // Insertion
    // =========================================================================

    /// Inserts a row, rejecting duplicate primary keys.
    pub fn insert(&mut self, row: &Row) -> ForgeResult<()> {
        let id = row.id;
        let cursor = self.find(id)?;

        let fits = {
            let guard = self.pager.fetch(cursor.page)?;
            let data = guard.data();
            let leaf = LeafPageRef::new(&data);
            if leaf.search(id).is_ok() {
                return Err(ForgeError::DuplicateKey { key: id });
            }
            leaf.can_fit(row.serialized_size())
        };

        self.bloom_add(id)?;

        if fits {
            let guard = self.pager.fetch(cursor.page)?;
            let mut data = guard.data_mut();
            LeafPage::new(&mut data).insert(row);
            debug!(key = id, page = cursor.page.get(), "inserted row");
        } else {
            self.split_leaf(cursor, row)?;
        }
        Ok(())
    }

    /// Splits a full leaf, distributing rows so that each side ends up
    /// with roughly half the bytes, then promotes the separator (the
    /// smallest key of the new right sibling) into the parent.
    fn split_leaf(&mut self, mut cursor: Cursor, row: &Row) -> ForgeResult<()> {
        let page = cursor.page;

        // Ordered array of all rows, new one included
        let (mut all_rows, old_next, was_root) = {
            let guard = self.pager.fetch(page)?;
            let data = guard.data();
            let leaf = LeafPageRef::new(&data);
            (leaf.rows(), leaf.next_leaf(), leaf.is_root())
        };
        let pos = all_rows
            .iter()
            .position(|r| r.id > row.id)
            .unwrap_or(all_rows.len());
        all_rows.insert(pos, row.clone());

        // Smallest prefix whose bytes exceed half the usable space keeps
        // the left page; at least one row stays left. Fallback: median.
        let half = LEAF_USABLE_SPACE / 2;
        let mut running = 0usize;
        let mut split_point = 0usize;
        for (i, r) in all_rows.iter().enumerate() {
            running += r.serialized_size() + SLOT_SIZE;
            if running > half {
                split_point = i.max(1);
                break;
            }
        }
        if split_point == 0 {
            split_point = all_rows.len() / 2;
        }

        // Right half onto a fresh page, inheriting the old sibling link
        let new_page = self.pager.allocate_page()?;
        {
            let guard = self.pager.fetch(new_page)?;
            let mut data = guard.data_mut();
            let mut leaf = LeafPage::new(&mut data);
            leaf.initialize();
            for r in &all_rows[split_point..] {
                leaf.insert(r);
            }
            leaf.set_next_leaf(old_next);
        }

        // Left prefix back into the old page (root flag preserved)
        {
            let guard = self.pager.fetch(page)?;
            let mut data = guard.data_mut();
            let mut leaf = LeafPage::new(&mut data);
            leaf.initialize();
            leaf.set_root(was_root);
            for r in &all_rows[..split_point] {
                leaf.insert(r);
            }
            leaf.set_next_leaf(new_page);
        }

        let separator = all_rows[split_point].id;
        debug!(
            page = page.get(),
            new_page = new_page.get(),
            separator,
            "split leaf"
        );

        if was_root {
            return self.grow_root(separator, new_page);
        }

        let parent_page = *cursor.path.last().ok_or_else(|| {
            ForgeError::invariant("non-root leaf split with empty ancestor path")
        })?;
        let (child_index, parent_full) = {
            let guard = self.pager.fetch(parent_page)?;
            let data = guard.data();
            let parent = InternalPageRef::new(&data);
            let idx = parent.child_index(page).ok_or_else(|| {
                ForgeError::invariant(format!(
                    "child {page} not found in parent {parent_page}"
                ))
            })?;
            (idx, parent.num_keys() as usize >= INTERNAL_MAX_CELLS)
        };

        if parent_full {
            cursor.path.pop();
            self.split_internal(parent_page, child_index, separator, new_page, &mut cursor.path)
        } else {
            let guard = self.pager.fetch(parent_page)?;
            let mut data = guard.data_mut();
            InternalPage::new(&mut data).insert_child(child_index, separator, new_page);
            debug!(
                parent = parent_page.get(),
                child = new_page.get(),
                "linked split sibling into parent"
            );
            Ok(())
        }
    }

    /// Splits a full internal node holding a pending `(new_key,
    /// new_child)` at `child_index`. The middle key of the combined array
    /// is pushed up and kept in neither half. `path` holds the ancestors
    /// of `page`, exclusive.
    fn split_internal(
        &mut self,
        page: PageId,
        child_index: usize,
        new_key: u32,
        new_child: PageId,
        path: &mut Vec<PageId>,
    ) -> ForgeResult<()> {
        // Conceptual arrays: N+1 keys, N+2 children, pending entry placed
        // immediately right of child_index
        let (keys, children, was_root) = {
            let guard = self.pager.fetch(page)?;
            let data = guard.data();
            let old = InternalPageRef::new(&data);
            let n = old.num_keys() as usize;

            let mut children = Vec::with_capacity(n + 2);
            for i in 0..=child_index {
                children.push(old.child(i));
            }
            children.push(new_child);
            for i in child_index + 1..=n {
                children.push(old.child(i));
            }

            let mut keys = Vec::with_capacity(n + 1);
            for i in 0..child_index {
                keys.push(old.key(i));
            }
            keys.push(new_key);
            for i in child_index..n {
                keys.push(old.key(i));
            }

            (keys, children, old.is_root())
        };

        let total_keys = keys.len();
        let mid = total_keys / 2;
        let push_up = keys[mid];

        // Left half stays in the old page
        {
            let guard = self.pager.fetch(page)?;
            let mut data = guard.data_mut();
            let mut left = InternalPage::new(&mut data);
            left.set_num_keys(mid as u32);
            for i in 0..mid {
                left.set_child(i, children[i]);
                left.set_key(i, keys[i]);
            }
            left.set_right_child(children[mid]);
        }

        // Right half onto a fresh page
        let new_internal = self.pager.allocate_page()?;
        {
            let guard = self.pager.fetch(new_internal)?;
            let mut data = guard.data_mut();
            let mut right = InternalPage::new(&mut data);
            right.initialize();
            let right_count = total_keys - mid - 1;
            right.set_num_keys(right_count as u32);
            for i in 0..right_count {
                right.set_child(i, children[mid + 1 + i]);
                right.set_key(i, keys[mid + 1 + i]);
            }
            right.set_right_child(children[total_keys]);
        }

        debug!(
            page = page.get(),
            new_page = new_internal.get(),
            push_up,
            "split internal node"
        );

        if was_root {
            return self.grow_root(push_up, new_internal);
        }

        let parent_page = path.pop().ok_or_else(|| {
            ForgeError::invariant("non-root internal split with empty ancestor path")
        })?;
        let (pidx, parent_full) = {
            let guard = self.pager.fetch(parent_page)?;
            let data = guard.data();
            let parent = InternalPageRef::new(&data);
            let idx = parent.child_index(page).ok_or_else(|| {
                ForgeError::invariant(format!(
                    "child {page} not found in parent {parent_page}"
                ))
            })?;
            (idx, parent.num_keys() as usize >= INTERNAL_MAX_CELLS)
        };

        if parent_full {
            self.split_internal(parent_page, pidx, push_up, new_internal, path)
        } else {
            let guard = self.pager.fetch(parent_page)?;
            let mut data = guard.data_mut();
            InternalPage::new(&mut data).insert_child(pidx, push_up, new_internal);
            debug!(
                parent = parent_page.get(),
                push_up, "pushed split key into grandparent"
            );
            Ok(())
        }
    }

    /// Root growth: the current root's bytes move verbatim to a fresh
    /// page (the new left child) and page 1 is rewritten as an internal
    /// node with a single separator. The root page number never changes.
    fn grow_root(&mut self, separator: u32, right_page: PageId) -> ForgeResult<()> {
        let left_copy = self.pager.allocate_page()?;
        {
            let src = self.pager.fetch(PageId::new(ROOT_PAGE))?;
            let dst = self.pager.fetch(left_copy)?;
            let src_data = src.data();
            let mut dst_data = dst.data_mut();
            dst_data.copy_from_slice(&src_data);
            node::set_root(&mut dst_data, false);
        }
        {
            let guard = self.pager.fetch(PageId::new(ROOT_PAGE))?;
            let mut data = guard.data_mut();
            let mut root = InternalPage::new(&mut data);
            root.initialize();
            root.set_root(true);
            root.set_num_keys(1);
            root.set_child(0, left_copy);
            root.set_key(0, separator);
            root.set_right_child(right_page);
        }
        debug!(
            left = left_copy.get(),
            right = right_page.get(),
            separator,
            "root grew one level"
        );
        Ok(())
    }

    // =========================================================================
    // Deletion
    // =========================================================================

    /// Removes a row by key. The Bloom filter short-circuits definite
    /// negatives before any tree page is read.
    pub fn remove(&mut self, id: u32) -> ForgeResult<()> {
        if !self.bloom_contains(id)? {
            debug!(key = id, "bloom definite negative, skipping tree descent");
            return Err(ForgeError::KeyNotFound { key: id });
        }

        let cursor = self.find(id)?;
        let (removed, is_root, underflow) = {
            let guard = self.pager.fetch(cursor.page)?;
            let mut data = guard.data_mut();
            let mut leaf = LeafPage::new(&mut data);
            let removed = leaf.remove(id);
            (removed, leaf.is_root(), leaf.is_underflow())
        };

        if !removed {
            // Bloom false positive
            return Err(ForgeError::KeyNotFound { key: id });
        }
        debug!(key = id, page = cursor.page.get(), "deleted row");

        // The root leaf has no minimum occupancy
        if is_root || !underflow {
            return Ok(());
        }

        let mut path = cursor.path;
        self.rebalance_leaf(cursor.page, &mut path)
    }

    /// Restores minimum occupancy of an underflowed leaf: borrow from a
    /// sibling when one can spare a record, otherwise merge (left sibling
    /// preferred).
    fn rebalance_leaf(&mut self, page: PageId, path: &mut Vec<PageId>) -> ForgeResult<()> {
        let parent_page = *path
            .last()
            .ok_or_else(|| ForgeError::invariant("leaf rebalance with empty ancestor path"))?;
        let (child_index, parent_keys) = {
            let guard = self.pager.fetch(parent_page)?;
            let data = guard.data();
            let parent = InternalPageRef::new(&data);
            let idx = parent.child_index(page).ok_or_else(|| {
                ForgeError::invariant(format!(
                    "child {page} not found in parent {parent_page}"
                ))
            })?;
            (idx, parent.num_keys() as usize)
        };

        // Borrow from the left sibling
        if child_index > 0 {
            let left_page = self.parent_child(parent_page, child_index - 1)?;
            let donor = {
                let guard = self.pager.fetch(left_page)?;
                let data = guard.data();
                let left = LeafPageRef::new(&data);
                let n = left.num_cells() as usize;
                if !left.is_underflow() && n > LEAF_MIN_CELLS {
                    Some(left.row(n - 1))
                } else {
                    None
                }
            };
            if let Some(borrowed) = donor {
                {
                    let guard = self.pager.fetch(left_page)?;
                    let mut data = guard.data_mut();
                    let mut left = LeafPage::new(&mut data);
                    let n = left.num_cells() as usize;
                    left.remove_at(n - 1);
                }
                let new_first = {
                    let guard = self.pager.fetch(page)?;
                    let mut data = guard.data_mut();
                    let mut leaf = LeafPage::new(&mut data);
                    leaf.insert(&borrowed);
                    leaf.key(0)
                };
                {
                    let guard = self.pager.fetch(parent_page)?;
                    let mut data = guard.data_mut();
                    InternalPage::new(&mut data).set_key(child_index - 1, new_first);
                }
                debug!(
                    from = left_page.get(),
                    to = page.get(),
                    "leaf borrowed from left sibling"
                );
                return Ok(());
            }
        }

        // Borrow from the right sibling
        if child_index < parent_keys {
            let right_page = self.parent_child(parent_page, child_index + 1)?;
            let donor = {
                let guard = self.pager.fetch(right_page)?;
                let data = guard.data();
                let right = LeafPageRef::new(&data);
                if !right.is_underflow() && right.num_cells() as usize > LEAF_MIN_CELLS {
                    Some(right.row(0))
                } else {
                    None
                }
            };
            if let Some(borrowed) = donor {
                let right_first = {
                    let guard = self.pager.fetch(right_page)?;
                    let mut data = guard.data_mut();
                    let mut right = LeafPage::new(&mut data);
                    right.remove_at(0);
                    right.key(0)
                };
                {
                    let guard = self.pager.fetch(page)?;
                    let mut data = guard.data_mut();
                    LeafPage::new(&mut data).insert(&borrowed);
                }
                {
                    let guard = self.pager.fetch(parent_page)?;
                    let mut data = guard.data_mut();
                    InternalPage::new(&mut data).set_key(child_index, right_first);
                }
                debug!(
                    from = right_page.get(),
                    to = page.get(),
                    "leaf borrowed from right sibling"
                );
                return Ok(());
            }
        }

        // Borrowing impossible: merge with a sibling
        if child_index > 0 {
            let left_page = self.parent_child(parent_page, child_index - 1)?;
            self.merge_leaves(left_page, page, parent_page, child_index - 1, path)
        } else {
            let right_page = self.parent_child(parent_page, child_index + 1)?;
            self.merge_leaves(page, right_page, parent_page, child_index, path)
        }
    }

    /// Folds `right_page` into `left_page`, bypasses it in the sibling
    /// chain, frees it, and drops the separator from the parent.
    fn merge_leaves(
        &mut self,
        left_page: PageId,
        right_page: PageId,
        parent_page: PageId,
        sep_idx: usize,
        path: &mut Vec<PageId>,
    ) -> ForgeResult<()> {
        let (right_rows, right_next) = {
            let guard = self.pager.fetch(right_page)?;
            let data = guard.data();
            let right = LeafPageRef::new(&data);
            (right.rows(), right.next_leaf())
        };
        {
            let guard = self.pager.fetch(left_page)?;
            let mut data = guard.data_mut();
            let mut left = LeafPage::new(&mut data);
            for row in &right_rows {
                left.insert(row);
            }
            left.set_next_leaf(right_next);
        }
        self.pager.free_page(right_page)?;
        debug!(
            left = left_page.get(),
            right = right_page.get(),
            "merged leaves, freed right page"
        );
        self.shrink_parent(parent_page, sep_idx, path)
    }

    /// Restores minimum occupancy of an underflowed internal node. Borrow
    /// rotates one key through the parent; merge pulls the separator
    /// down. An internal node whose path is empty is the root, which has
    /// no minimum.
    fn rebalance_internal(&mut self, page: PageId, path: &mut Vec<PageId>) -> ForgeResult<()> {
        if path.is_empty() {
            return Ok(());
        }

        let parent_page = *path.last().ok_or_else(|| {
            ForgeError::invariant("internal rebalance with empty ancestor path")
        })?;
        let (child_index, parent_keys) = {
            let guard = self.pager.fetch(parent_page)?;
            let data = guard.data();
            let parent = InternalPageRef::new(&data);
            let idx = parent.child_index(page).ok_or_else(|| {
                ForgeError::invariant(format!(
                    "child {page} not found in parent {parent_page}"
                ))
            })?;
            (idx, parent.num_keys() as usize)
        };

        // Borrow from the left sibling: its last child rotates in via the
        // parent separator
        if child_index > 0 {
            let left_page = self.parent_child(parent_page, child_index - 1)?;
            let donation = {
                let guard = self.pager.fetch(left_page)?;
                let data = guard.data();
                let left = InternalPageRef::new(&data);
                let n = left.num_keys() as usize;
                if n > INTERNAL_MIN_KEYS {
                    Some((left.right_child(), left.key(n - 1)))
                } else {
                    None
                }
            };
            if let Some((borrowed_child, borrowed_key)) = donation {
                let sep = child_index - 1;
                let parent_key = self.parent_key(parent_page, sep)?;
                {
                    let guard = self.pager.fetch(left_page)?;
                    let mut data = guard.data_mut();
                    let mut left = InternalPage::new(&mut data);
                    let n = left.num_keys() as usize;
                    let new_right = left.child(n - 1);
                    left.set_right_child(new_right);
                    left.set_num_keys((n - 1) as u32);
                }
                {
                    let guard = self.pager.fetch(page)?;
                    let mut data = guard.data_mut();
                    InternalPage::new(&mut data).prepend_cell(borrowed_child, parent_key);
                }
                {
                    let guard = self.pager.fetch(parent_page)?;
                    let mut data = guard.data_mut();
                    InternalPage::new(&mut data).set_key(sep, borrowed_key);
                }
                debug!(
                    from = left_page.get(),
                    to = page.get(),
                    "internal borrowed from left sibling"
                );
                return Ok(());
            }
        }

        // Borrow from the right sibling: its first child rotates in
        if child_index < parent_keys {
            let right_page = self.parent_child(parent_page, child_index + 1)?;
            let donation = {
                let guard = self.pager.fetch(right_page)?;
                let data = guard.data();
                let right = InternalPageRef::new(&data);
                if right.num_keys() as usize > INTERNAL_MIN_KEYS {
                    Some((right.child(0), right.key(0)))
                } else {
                    None
                }
            };
            if let Some((borrowed_child, borrowed_key)) = donation {
                let sep = child_index;
                let parent_key = self.parent_key(parent_page, sep)?;
                {
                    let guard = self.pager.fetch(right_page)?;
                    let mut data = guard.data_mut();
                    InternalPage::new(&mut data).remove_first_cell();
                }
                {
                    let guard = self.pager.fetch(page)?;
                    let mut data = guard.data_mut();
                    let mut cur = InternalPage::new(&mut data);
                    let old_right = cur.right_child();
                    cur.append_cell(old_right, parent_key);
                    cur.set_right_child(borrowed_child);
                }
                {
                    let guard = self.pager.fetch(parent_page)?;
                    let mut data = guard.data_mut();
                    InternalPage::new(&mut data).set_key(sep, borrowed_key);
                }
                debug!(
                    from = right_page.get(),
                    to = page.get(),
                    "internal borrowed from right sibling"
                );
                return Ok(());
            }
        }

        // Borrowing impossible: merge with a sibling
        if child_index > 0 {
            let left_page = self.parent_child(parent_page, child_index - 1)?;
            self.merge_internals(left_page, page, parent_page, child_index - 1, path)
        } else {
            let right_page = self.parent_child(parent_page, child_index + 1)?;
            self.merge_internals(page, right_page, parent_page, child_index, path)
        }
    }

    /// Folds `right_page` into `left_page`, pulling the parent separator
    /// down between them, then frees the right page and drops the
    /// separator from the parent.
    fn merge_internals(
        &mut self,
        left_page: PageId,
        right_page: PageId,
        parent_page: PageId,
        sep_idx: usize,
        path: &mut Vec<PageId>,
    ) -> ForgeResult<()> {
        let separator = self.parent_key(parent_page, sep_idx)?;
        let (right_keys, right_children, right_rightmost) = {
            let guard = self.pager.fetch(right_page)?;
            let data = guard.data();
            let right = InternalPageRef::new(&data);
            let n = right.num_keys() as usize;
            let keys = right.keys();
            let children: Vec<PageId> = (0..n).map(|i| right.child(i)).collect();
            (keys, children, right.right_child())
        };
        {
            let guard = self.pager.fetch(left_page)?;
            let mut data = guard.data_mut();
            let mut left = InternalPage::new(&mut data);
            let old_right = left.right_child();
            left.append_cell(old_right, separator);
            for (child, key) in right_children.iter().zip(&right_keys) {
                left.append_cell(*child, *key);
            }
            left.set_right_child(right_rightmost);
        }
        self.pager.free_page(right_page)?;
        debug!(
            left = left_page.get(),
            right = right_page.get(),
            "merged internal nodes, freed right page"
        );
        self.shrink_parent(parent_page, sep_idx, path)
    }

    /// Drops a separator from a parent after a merge, then collapses the
    /// root or recurses upward as needed.
    fn shrink_parent(
        &mut self,
        parent_page: PageId,
        sep_idx: usize,
        path: &mut Vec<PageId>,
    ) -> ForgeResult<()> {
        let (is_root, remaining) = {
            let guard = self.pager.fetch(parent_page)?;
            let mut data = guard.data_mut();
            let mut parent = InternalPage::new(&mut data);
            parent.remove_key(sep_idx);
            (parent.is_root(), parent.num_keys() as usize)
        };

        if is_root && remaining == 0 {
            self.collapse_root()
        } else if !is_root && remaining < INTERNAL_MIN_KEYS {
            path.pop();
            self.rebalance_internal(parent_page, path)
        } else {
            Ok(())
        }
    }

    /// Root collapse: the sole remaining child's bytes move onto page 1
    /// and the child page is freed, shrinking the tree by one level.
    fn collapse_root(&mut self) -> ForgeResult<()> {
        let root = PageId::new(ROOT_PAGE);
        let only_child = {
            let guard = self.pager.fetch(root)?;
            let data = guard.data();
            InternalPageRef::new(&data).right_child()
        };
        {
            let src = self.pager.fetch(only_child)?;
            let dst = self.pager.fetch(root)?;
            let src_data = src.data();
            let mut dst_data = dst.data_mut();
            dst_data.copy_from_slice(&src_data);
            node::set_root(&mut dst_data, true);
        }
        self.pager.free_page(only_child)?;
        debug!(
            from = only_child.get(),
            "root collapsed, tree shrank one level"
        );
        Ok(())
    }

    // =========================================================================
    // Bloom filter
    // =========================================================================

    fn bloom_add(&mut self, key: u32) -> ForgeResult<()> {
        let guard = self.pager.fetch(PageId::new(HEADER_PAGE))?;
        let mut data = guard.data_mut();
        BloomFilterMut::new(&mut data[BLOOM_OFFSET..]).add(key);
        Ok(())
    }

    fn bloom_contains(&mut self, key: u32) -> ForgeResult<bool> {
        let guard = self.pager.fetch(PageId::new(HEADER_PAGE))?;
        let data = guard.data();
        Ok(BloomFilter::new(&data[BLOOM_OFFSET..]).possibly_contains(key))
    }

    /// Returns Bloom filter occupancy statistics.
    pub fn bloom_stats(&mut self) -> ForgeResult<BloomStats> {
        let guard = self.pager.fetch(PageId::new(HEADER_PAGE))?;
        let data = guard.data();
        Ok(BloomFilter::new(&data[BLOOM_OFFSET..]).stats())
    }

    /// Clears the bit-array and re-adds every key by walking the leaf
    /// chain. Run at open, and on demand after heavy deletes to shed
    /// stale bits.
    pub fn rebuild_bloom(&mut self) -> ForgeResult<()> {
        let mut keys = Vec::new();
        let mut page = self.leftmost_leaf()?;
        while !page.is_nil() {
            let next = {
                let guard = self.pager.fetch(page)?;
                let data = guard.data();
                let leaf = LeafPageRef::new(&data);
                for i in 0..leaf.num_cells() as usize {
                    keys.push(leaf.key(i));
                }
                leaf.next_leaf()
            };
            page = next;
        }

        let count = keys.len();
        let guard = self.pager.fetch(PageId::new(HEADER_PAGE))?;
        let mut data = guard.data_mut();
        let mut bloom = BloomFilterMut::new(&mut data[BLOOM_OFFSET..]);
        bloom.clear();
        for key in keys {
            bloom.add(key);
        }
        debug!(keys = count, "rebuilt bloom filter from leaf chain");
        Ok(())
    }

    // =========================================================================
    // Private helpers
    // =========================================================================

    /// Reads child `index` of an internal page.
    fn parent_child(&mut self, parent_page: PageId, index: usize) -> ForgeResult<PageId> {
        let guard = self.pager.fetch(parent_page)?;
        let data = guard.data();
        Ok(InternalPageRef::new(&data).child(index))
    }

    /// Reads key `index` of an internal page.
    fn parent_key(&mut self, parent_page: PageId, index: usize) -> ForgeResult<u32> {
        let guard = self.pager.fetch(parent_page)?;
        let data = guard.data();
        Ok(InternalPageRef::new(&data).key(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn row(id: u32) -> Row {
        Row::new(id, format!("user{id}"), format!("user{id}@example.com"))
    }

    /// Row near the 293-byte maximum, for forcing splits quickly.
    fn big_row(id: u32) -> Row {
        Row::new(id, "u".repeat(31), "e".repeat(254))
    }

    fn open_tree(path: &std::path::Path) -> BTree {
        BTree::new(Pager::open(path).unwrap()).unwrap()
    }

    // =========================================================================
    // Structural invariant checker
    // =========================================================================

    #[derive(Default)]
    struct TreeCheck {
        keys: Vec<u32>,
        leaves: Vec<PageId>,
        reachable: Vec<PageId>,
    }

    enum Snapshot {
        Leaf {
            is_root: bool,
            keys: Vec<u32>,
            slot_lengths: Vec<u16>,
            total_free: u16,
        },
        Internal {
            is_root: bool,
            keys: Vec<u32>,
            children: Vec<PageId>,
        },
    }

    fn snapshot(tree: &mut BTree, page: PageId) -> Snapshot {
        let guard = tree.pager.fetch(page).unwrap();
        let data = guard.data();
        match node::page_type(&data).unwrap() {
            PageType::Leaf => {
                let leaf = LeafPageRef::new(&data);
                let n = leaf.num_cells() as usize;
                Snapshot::Leaf {
                    is_root: leaf.is_root(),
                    keys: (0..n).map(|i| leaf.key(i)).collect(),
                    slot_lengths: (0..n).map(|i| leaf.slot_length(i)).collect(),
                    total_free: leaf.total_free(),
                }
            }
            PageType::Internal => {
                let internal = InternalPageRef::new(&data);
                Snapshot::Internal {
                    is_root: internal.is_root(),
                    keys: internal.keys(),
                    children: internal.children(),
                }
            }
            PageType::Free => panic!("tree traversal reached free page {page}"),
        }
    }

    /// Verifies key ordering, separator ranges, occupancy minimums, and
    /// free-space accounting for the subtree at `page`. Keys in the
    /// subtree must fall in `[lo, hi)`: a separator equals the smallest
    /// key of its right subtree and equality routes right on descent.
    fn check_node(
        tree: &mut BTree,
        page: PageId,
        lo: Option<u32>,
        hi: Option<u32>,
        expect_root: bool,
        acc: &mut TreeCheck,
    ) {
        acc.reachable.push(page);
        match snapshot(tree, page) {
            Snapshot::Leaf {
                is_root,
                keys,
                slot_lengths,
                total_free,
            } => {
                assert_eq!(is_root, expect_root, "root flag wrong on page {page}");
                if !is_root {
                    assert!(!keys.is_empty(), "empty non-root leaf {page}");
                }
                let mut used = 0usize;
                for (i, &k) in keys.iter().enumerate() {
                    if i > 0 {
                        assert!(keys[i - 1] < k, "unsorted leaf {page}");
                    }
                    if let Some(lo) = lo {
                        assert!(k >= lo, "key {k} below separator range on page {page}");
                    }
                    if let Some(hi) = hi {
                        assert!(k < hi, "key {k} above separator range on page {page}");
                    }
                    used += slot_lengths[i] as usize + SLOT_SIZE;
                }
                assert_eq!(
                    total_free as usize,
                    LEAF_USABLE_SPACE - used,
                    "free-space accounting wrong on page {page}"
                );
                acc.keys.extend(keys);
                acc.leaves.push(page);
            }
            Snapshot::Internal {
                is_root,
                keys,
                children,
            } => {
                assert_eq!(is_root, expect_root, "root flag wrong on page {page}");
                assert!(!keys.is_empty(), "internal node {page} with zero keys");
                if !is_root {
                    assert!(
                        keys.len() >= INTERNAL_MIN_KEYS,
                        "internal node {page} below minimum occupancy"
                    );
                }
                for w in keys.windows(2) {
                    assert!(w[0] < w[1], "unsorted internal node {page}");
                }
                for (i, &child) in children.iter().enumerate() {
                    let child_lo = if i == 0 { lo } else { Some(keys[i - 1]) };
                    let child_hi = if i < keys.len() { Some(keys[i]) } else { hi };
                    check_node(tree, child, child_lo, child_hi, false, acc);
                }
            }
        }
    }

    /// Full-tree audit: recursive structure, the leaf sibling chain, and
    /// the page accounting equation (reachable + free == all allocated).
    fn check_invariants(tree: &mut BTree) -> Vec<u32> {
        let mut acc = TreeCheck::default();
        check_node(tree, PageId::new(ROOT_PAGE), None, None, true, &mut acc);

        for w in acc.keys.windows(2) {
            assert!(w[0] < w[1], "global key order broken across leaves");
        }

        // The sibling chain must visit exactly the recursion's leaves
        let mut chain = Vec::new();
        let mut page = tree.leftmost_leaf().unwrap();
        while !page.is_nil() {
            chain.push(page);
            let guard = tree.pager.fetch(page).unwrap();
            let data = guard.data();
            let next = LeafPageRef::new(&data).next_leaf();
            drop(data);
            drop(guard);
            page = next;
        }
        assert_eq!(chain, acc.leaves, "leaf chain disagrees with tree structure");

        // Every page in [1, total_pages) is reachable or free, never both
        let free = tree.pager.free_list().unwrap();
        let mut all: Vec<u32> = acc
            .reachable
            .iter()
            .chain(free.iter())
            .map(|p| p.get())
            .collect();
        all.sort_unstable();
        let expected: Vec<u32> = (1..tree.pager.header().total_pages).collect();
        assert_eq!(all, expected, "page accounting broken");

        acc.keys
    }

    // =========================================================================
    // Bootstrap and basic shape
    // =========================================================================

    #[test]
    fn test_bootstrap_fresh_tree() {
        let dir = tempdir().unwrap();
        let mut tree = open_tree(&dir.path().join("t.db"));

        assert_eq!(tree.pager.header().total_pages, 2);
        let keys = check_invariants(&mut tree);
        assert!(keys.is_empty());
        assert_eq!(tree.leftmost_leaf().unwrap(), PageId::new(ROOT_PAGE));
    }

    #[test]
    fn test_single_leaf_inserts() {
        let dir = tempdir().unwrap();
        let mut tree = open_tree(&dir.path().join("t.db"));

        for id in [5, 1, 3, 2, 4] {
            tree.insert(&row(id)).unwrap();
        }

        assert_eq!(check_invariants(&mut tree), vec![1, 2, 3, 4, 5]);
        assert_eq!(tree.find_row(3).unwrap(), Some(row(3)));
        assert_eq!(tree.find_row(6).unwrap(), None);
    }

    #[test]
    fn test_leaf_split_and_root_growth() {
        let dir = tempdir().unwrap();
        let mut tree = open_tree(&dir.path().join("t.db"));

        // 20 near-max rows cannot fit one page
        for id in 1..=20 {
            tree.insert(&big_row(id)).unwrap();
        }

        let keys = check_invariants(&mut tree);
        assert_eq!(keys, (1..=20).collect::<Vec<u32>>());

        // Root must have grown into an internal node, still at page 1
        let guard = tree.pager.fetch(PageId::new(ROOT_PAGE)).unwrap();
        let data = guard.data();
        assert_eq!(node::page_type(&data), Some(PageType::Internal));
        assert!(node::is_root(&data));
    }

    #[test]
    fn test_separator_key_still_findable() {
        let dir = tempdir().unwrap();
        let mut tree = open_tree(&dir.path().join("t.db"));

        for id in 1..=40 {
            tree.insert(&big_row(id)).unwrap();
        }

        // Every key must resolve, including the ones that became
        // separators (equality routes right on descent)
        for id in 1..=40 {
            assert_eq!(tree.find_row(id).unwrap(), Some(big_row(id)), "lost key {id}");
        }
    }

    #[test]
    fn test_descending_inserts() {
        let dir = tempdir().unwrap();
        let mut tree = open_tree(&dir.path().join("t.db"));

        for id in (1..=60).rev() {
            tree.insert(&big_row(id)).unwrap();
        }
        assert_eq!(check_invariants(&mut tree), (1..=60).collect::<Vec<u32>>());
    }

    #[test]
    fn test_duplicate_rejected_even_when_leaf_full() {
        let dir = tempdir().unwrap();
        let mut tree = open_tree(&dir.path().join("t.db"));

        for id in 1..=13 {
            tree.insert(&big_row(id)).unwrap();
        }
        let pages_before = tree.pager.header().total_pages;

        // The duplicate check runs before any split is considered
        assert!(matches!(
            tree.insert(&big_row(7)),
            Err(ForgeError::DuplicateKey { key: 7 })
        ));
        assert_eq!(tree.pager.header().total_pages, pages_before);
    }

    // =========================================================================
    // Iteration
    // =========================================================================

    #[test]
    fn test_all_spans_leaf_boundaries() {
        let dir = tempdir().unwrap();
        let mut tree = open_tree(&dir.path().join("t.db"));

        for id in (1..=50).rev() {
            tree.insert(&big_row(id)).unwrap();
        }

        let ids: Vec<u32> = tree
            .all()
            .unwrap()
            .map(|r| r.map(|row| row.id))
            .collect::<ForgeResult<_>>()
            .unwrap();
        assert_eq!(ids, (1..=50).collect::<Vec<u32>>());
    }

    #[test]
    fn test_range_lower_bound_between_leaves() {
        let dir = tempdir().unwrap();
        let mut tree = open_tree(&dir.path().join("t.db"));

        // Even ids only, so odd range bounds fall between keys
        for id in (2..=80).step_by(2) {
            tree.insert(&big_row(id)).unwrap();
        }

        let ids: Vec<u32> = tree
            .range(31, 49)
            .unwrap()
            .map(|r| r.map(|row| row.id))
            .collect::<ForgeResult<_>>()
            .unwrap();
        assert_eq!(ids, vec![32, 34, 36, 38, 40, 42, 44, 46, 48]);
    }

    #[test]
    fn test_range_empty_interval() {
        let dir = tempdir().unwrap();
        let mut tree = open_tree(&dir.path().join("t.db"));

        for id in (10..=50).step_by(10) {
            tree.insert(&row(id)).unwrap();
        }

        let ids: Vec<u32> = tree
            .range(41, 49)
            .unwrap()
            .map(|r| r.map(|row| row.id))
            .collect::<ForgeResult<_>>()
            .unwrap();
        assert!(ids.is_empty());
    }

    // =========================================================================
    // Deletion
    // =========================================================================

    #[test]
    fn test_delete_from_root_leaf() {
        let dir = tempdir().unwrap();
        let mut tree = open_tree(&dir.path().join("t.db"));

        tree.insert(&row(1)).unwrap();
        tree.remove(1).unwrap();

        // A root leaf may go empty; no rebalancing applies
        assert!(check_invariants(&mut tree).is_empty());
        assert!(matches!(
            tree.remove(1),
            Err(ForgeError::KeyNotFound { key: 1 })
        ));
    }

    #[test]
    fn test_delete_with_rebalancing() {
        let dir = tempdir().unwrap();
        let mut tree = open_tree(&dir.path().join("t.db"));

        for id in 1..=60 {
            tree.insert(&big_row(id)).unwrap();
        }

        // Delete every third key, auditing as we go
        for id in (3..=60).step_by(3) {
            tree.remove(id).unwrap();
            check_invariants(&mut tree);
        }

        let keys = check_invariants(&mut tree);
        let expected: Vec<u32> = (1..=60).filter(|id| id % 3 != 0).collect();
        assert_eq!(keys, expected);
    }

    #[test]
    fn test_insert_all_delete_all_ends_empty() {
        let dir = tempdir().unwrap();
        let mut tree = open_tree(&dir.path().join("t.db"));

        for id in 1..=80 {
            tree.insert(&big_row(id)).unwrap();
        }
        let total_pages = tree.pager.header().total_pages;
        assert!(total_pages > 3);

        for id in 1..=80 {
            tree.remove(id).unwrap();
        }

        // A single empty root leaf remains; every other page is free
        let keys = check_invariants(&mut tree);
        assert!(keys.is_empty());
        let guard = tree.pager.fetch(PageId::new(ROOT_PAGE)).unwrap();
        let data = guard.data();
        assert_eq!(node::page_type(&data), Some(PageType::Leaf));
        drop(data);
        drop(guard);
        assert_eq!(
            tree.pager.header().free_pages,
            tree.pager.header().total_pages - 2
        );
    }

    #[test]
    fn test_random_inserts_reverse_deletes() {
        let dir = tempdir().unwrap();
        let mut tree = open_tree(&dir.path().join("t.db"));

        // Deterministic pseudo-random unique ids in generation order
        let mut ids = Vec::new();
        let mut seen = std::collections::HashSet::new();
        let mut x: u32 = 12345;
        while ids.len() < 1000 {
            x = x.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            let id = (x >> 8) | 1;
            if seen.insert(id) {
                ids.push(id);
            }
        }

        for &id in &ids {
            tree.insert(&row(id)).unwrap();
        }
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(check_invariants(&mut tree), sorted);

        for &id in ids.iter().rev() {
            tree.remove(id).unwrap();
        }
        assert!(check_invariants(&mut tree).is_empty());
    }

    #[test]
    fn test_freed_pages_are_recycled() {
        let dir = tempdir().unwrap();
        let mut tree = open_tree(&dir.path().join("t.db"));

        for id in 1..=60 {
            tree.insert(&big_row(id)).unwrap();
        }
        for id in 1..=60 {
            tree.remove(id).unwrap();
        }
        let total_after_deletes = tree.pager.header().total_pages;
        assert!(tree.pager.header().free_pages > 0);

        // Growing the tree again must reuse the free list, not the file
        for id in 1..=60 {
            tree.insert(&big_row(id)).unwrap();
        }
        assert_eq!(tree.pager.header().total_pages, total_after_deletes);
        check_invariants(&mut tree);
    }

    // =========================================================================
    // Multi-level trees (internal splits and merges)
    // =========================================================================

    #[test]
    fn test_internal_split_three_levels() {
        let dir = tempdir().unwrap();
        let mut tree = open_tree(&dir.path().join("t.db"));

        // Enough near-max rows to overflow a 510-key root: ascending
        // inserts leave ~6 rows per left leaf, so ~4000 rows push past
        // 510 leaf splits and force an internal split plus root growth
        let n = 4000u32;
        for id in 1..=n {
            tree.insert(&big_row(id)).unwrap();
        }

        // The root's children must now be internal nodes
        let first_child = {
            let guard = tree.pager.fetch(PageId::new(ROOT_PAGE)).unwrap();
            let data = guard.data();
            let root = InternalPageRef::new(&data);
            root.child(0)
        };
        let guard = tree.pager.fetch(first_child).unwrap();
        let data = guard.data();
        assert_eq!(node::page_type(&data), Some(PageType::Internal));
        drop(data);
        drop(guard);

        assert_eq!(check_invariants(&mut tree), (1..=n).collect::<Vec<u32>>());
    }

    #[test]
    fn test_three_level_tree_drains_to_empty() {
        let dir = tempdir().unwrap();
        let mut tree = open_tree(&dir.path().join("t.db"));

        let n = 4000u32;
        for id in 1..=n {
            tree.insert(&big_row(id)).unwrap();
        }
        for id in (1..=n).rev() {
            tree.remove(id).unwrap();
            if id % 500 == 0 {
                check_invariants(&mut tree);
            }
        }

        assert!(check_invariants(&mut tree).is_empty());
        let guard = tree.pager.fetch(PageId::new(ROOT_PAGE)).unwrap();
        let data = guard.data();
        assert_eq!(node::page_type(&data), Some(PageType::Leaf));
        assert!(node::is_root(&data));
    }

    // =========================================================================
    // Bloom filter behaviour
    // =========================================================================

    #[test]
    fn test_bloom_never_false_negative() {
        let dir = tempdir().unwrap();
        let mut tree = open_tree(&dir.path().join("t.db"));

        for id in 1..=500 {
            tree.insert(&row(id)).unwrap();
        }
        for id in 1..=500 {
            assert!(
                tree.find_row(id).unwrap().is_some(),
                "bloom shortcut lost present key {id}"
            );
        }
    }

    #[test]
    fn test_bloom_stale_bits_until_rebuild() {
        let dir = tempdir().unwrap();
        let mut tree = open_tree(&dir.path().join("t.db"));

        for id in 1..=50 {
            tree.insert(&row(id)).unwrap();
        }
        let bits_full = tree.bloom_stats().unwrap().bits_set;
        assert!(bits_full > 0);

        for id in 1..=25 {
            tree.remove(id).unwrap();
        }
        // Deletes leave bits behind
        assert_eq!(tree.bloom_stats().unwrap().bits_set, bits_full);

        tree.rebuild_bloom().unwrap();
        let bits_rebuilt = tree.bloom_stats().unwrap().bits_set;
        assert!(bits_rebuilt < bits_full);
        assert!(bits_rebuilt > 0);

        // Still no false negatives afterwards
        for id in 26..=50 {
            assert!(tree.find_row(id).unwrap().is_some());
        }
    }

    #[test]
    fn test_bloom_rebuilt_at_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.db");

        {
            let mut tree = open_tree(&path);
            for id in 1..=100 {
                tree.insert(&row(id)).unwrap();
            }
            tree.pager.close().unwrap();
        }

        let mut tree = open_tree(&path);
        assert!(tree.bloom_stats().unwrap().bits_set > 0);
        for id in 1..=100 {
            assert!(tree.find_row(id).unwrap().is_some());
        }
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    #[test]
    fn test_reopen_preserves_tree() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.db");

        {
            let mut tree = open_tree(&path);
            for id in 1..=200 {
                tree.insert(&big_row(id)).unwrap();
            }
            tree.pager.close().unwrap();
        }

        let mut tree = open_tree(&path);
        assert_eq!(check_invariants(&mut tree), (1..=200).collect::<Vec<u32>>());
        assert_eq!(tree.find_row(137).unwrap(), Some(big_row(137)));
    }
}
