//! Internal B+ tree node pages.
//!
//! An internal node stores `num_keys` fixed 8-byte cells plus a separate
//! rightmost-child pointer, so it addresses `num_keys + 1` children:
//!
//! ```text
//! [type:1][is_root:1][crc32:4][num_keys:4][right_child:4]
//! cell i at 14 + 8*i:  [child:u32][key:u32]
//! ```
//!
//! Ordering contract: keys in `child(i)`'s subtree fall in the half-open
//! interval `[key(i-1), key(i))`; keys at or above `key(num_keys-1)` live
//! under `right_child`. Equal keys route right, matching the leaf split
//! rule that a separator equals the smallest key of its right sibling.

use forge_common::constants::{
    INTERNAL_CELL_SIZE, INTERNAL_HEADER_SIZE, OFFSET_INTERNAL_NUM_KEYS,
    OFFSET_INTERNAL_RIGHT_CHILD, PAGE_SIZE,
};
use forge_common::PageId;

use super::node;
use super::types::PageType;

/// Mutable view of an internal page.
pub struct InternalPage<'a> {
    data: &'a mut [u8],
}

impl<'a> InternalPage<'a> {
    /// Creates an internal view into a page-sized buffer.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is not exactly one page.
    #[inline]
    pub fn new(data: &'a mut [u8]) -> Self {
        assert_eq!(data.len(), PAGE_SIZE, "internal view needs a full page");
        Self { data }
    }

    /// Formats the page as an empty non-root internal node.
    pub fn initialize(&mut self) {
        node::set_page_type(self.data, PageType::Internal);
        node::set_root(self.data, false);
        node::set_checksum(self.data, 0);
        self.set_num_keys(0);
        self.set_right_child(PageId::NIL);
    }

    /// Returns the is-root flag.
    #[inline]
    pub fn is_root(&self) -> bool {
        node::is_root(self.data)
    }

    /// Sets the is-root flag.
    #[inline]
    pub fn set_root(&mut self, root: bool) {
        node::set_root(self.data, root);
    }

    /// Returns the number of keys.
    #[inline]
    pub fn num_keys(&self) -> u32 {
        read_u32(self.data, OFFSET_INTERNAL_NUM_KEYS)
    }

    /// Sets the number of keys.
    #[inline]
    pub fn set_num_keys(&mut self, n: u32) {
        write_u32(self.data, OFFSET_INTERNAL_NUM_KEYS, n);
    }

    /// Returns the rightmost child.
    #[inline]
    pub fn right_child(&self) -> PageId {
        PageId::new(read_u32(self.data, OFFSET_INTERNAL_RIGHT_CHILD))
    }

    /// Sets the rightmost child.
    #[inline]
    pub fn set_right_child(&mut self, child: PageId) {
        write_u32(self.data, OFFSET_INTERNAL_RIGHT_CHILD, child.get());
    }

    #[inline]
    fn cell_pos(i: usize) -> usize {
        INTERNAL_HEADER_SIZE + i * INTERNAL_CELL_SIZE
    }

    /// Returns child `i`, where `child(num_keys)` is the rightmost child.
    #[inline]
    pub fn child(&self, i: usize) -> PageId {
        if i == self.num_keys() as usize {
            self.right_child()
        } else {
            PageId::new(read_u32(self.data, Self::cell_pos(i)))
        }
    }

    /// Sets child `i`, where `child(num_keys)` is the rightmost child.
    #[inline]
    pub fn set_child(&mut self, i: usize, child: PageId) {
        if i == self.num_keys() as usize {
            self.set_right_child(child);
        } else {
            write_u32(self.data, Self::cell_pos(i), child.get());
        }
    }

    /// Returns key `i`.
    #[inline]
    pub fn key(&self, i: usize) -> u32 {
        read_u32(self.data, Self::cell_pos(i) + 4)
    }

    /// Sets key `i`.
    #[inline]
    pub fn set_key(&mut self, i: usize, key: u32) {
        write_u32(self.data, Self::cell_pos(i) + 4, key);
    }

    /// Returns the child page where `key` belongs. Binary search for the
    /// smallest `i` with `key < key(i)`; equality routes right.
    pub fn find_child(&self, key: u32) -> PageId {
        let mut lo = 0usize;
        let mut hi = self.num_keys() as usize;
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.key(mid) <= key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        self.child(lo)
    }

    /// Inserts `(new_key, new_child)` so that in the ordered child
    /// sequence `new_child` lands immediately to the right of the child at
    /// `index` (the position of the split child):
    ///
    /// ```text
    /// before:  ... C_i, K_i, C_i+1 ...
    /// after:   ... C_i, new_key, new_child, K_i, C_i+1 ...
    /// ```
    ///
    /// The caller must have verified the node is not full.
    pub fn insert_child(&mut self, index: usize, new_key: u32, new_child: PageId) {
        let num = self.num_keys() as usize;
        debug_assert!(index <= num);

        if index == num {
            // New child becomes the rightmost; the old rightmost gets a cell
            let old_right = self.right_child();
            self.set_num_keys((num + 1) as u32);
            write_u32(self.data, Self::cell_pos(num), old_right.get());
            self.set_key(num, new_key);
            self.set_right_child(new_child);
            return;
        }

        let key_old = self.key(index);

        // Shift cells index+1..num one position right
        self.data.copy_within(
            Self::cell_pos(index + 1)..Self::cell_pos(num),
            Self::cell_pos(index + 2),
        );

        // Cell `index` keeps its child, takes the new key; the new child
        // slots in right behind carrying the displaced key
        self.set_key(index, new_key);
        write_u32(self.data, Self::cell_pos(index + 1), new_child.get());
        self.set_num_keys((num + 1) as u32);
        self.set_key(index + 1, key_old);
    }

    /// Prepends `(child, key)` as cell 0, shifting every cell one
    /// position right. Used when borrowing through the parent from a left
    /// sibling.
    pub fn prepend_cell(&mut self, child: PageId, key: u32) {
        let num = self.num_keys() as usize;
        self.data
            .copy_within(Self::cell_pos(0)..Self::cell_pos(num), Self::cell_pos(1));
        write_u32(self.data, Self::cell_pos(0), child.get());
        self.set_num_keys((num + 1) as u32);
        self.set_key(0, key);
    }

    /// Appends `(child, key)` as the last cell. The rightmost-child
    /// pointer is left untouched.
    pub fn append_cell(&mut self, child: PageId, key: u32) {
        let num = self.num_keys() as usize;
        write_u32(self.data, Self::cell_pos(num), child.get());
        self.set_num_keys((num + 1) as u32);
        self.set_key(num, key);
    }

    /// Removes cell 0, shifting the remaining cells left. Used when a
    /// right sibling donates its first child.
    pub fn remove_first_cell(&mut self) {
        let num = self.num_keys() as usize;
        debug_assert!(num > 0);
        self.data
            .copy_within(Self::cell_pos(1)..Self::cell_pos(num), Self::cell_pos(0));
        self.set_num_keys((num - 1) as u32);
    }

    /// Removes `key(idx)` and the child to its RIGHT, collapsing the cell
    /// array. Used after a merge, where the right sibling has been folded
    /// into the left one.
    pub fn remove_key(&mut self, idx: usize) {
        let num = self.num_keys() as usize;
        debug_assert!(idx < num);

        if idx == num - 1 {
            // Dropping the last key: the left cell's child becomes the
            // rightmost child
            let left_child = PageId::new(read_u32(self.data, Self::cell_pos(idx)));
            self.set_right_child(left_child);
            self.set_num_keys((num - 1) as u32);
            return;
        }

        // Keep the left (merged) child, drop the right one by shifting the
        // tail of the array left
        let merged_child = read_u32(self.data, Self::cell_pos(idx));
        self.data.copy_within(
            Self::cell_pos(idx + 1)..Self::cell_pos(num),
            Self::cell_pos(idx),
        );
        write_u32(self.data, Self::cell_pos(idx), merged_child);
        self.set_num_keys((num - 1) as u32);
    }
}

/// Read-only view of an internal page.
pub struct InternalPageRef<'a> {
    data: &'a [u8],
}

impl<'a> InternalPageRef<'a> {
    /// Creates a read-only internal view.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is not exactly one page.
    #[inline]
    pub fn new(data: &'a [u8]) -> Self {
        assert_eq!(data.len(), PAGE_SIZE, "internal view needs a full page");
        Self { data }
    }

    /// Returns the is-root flag.
    #[inline]
    pub fn is_root(&self) -> bool {
        node::is_root(self.data)
    }

    /// Returns the number of keys.
    #[inline]
    pub fn num_keys(&self) -> u32 {
        read_u32(self.data, OFFSET_INTERNAL_NUM_KEYS)
    }

    /// Returns the rightmost child.
    #[inline]
    pub fn right_child(&self) -> PageId {
        PageId::new(read_u32(self.data, OFFSET_INTERNAL_RIGHT_CHILD))
    }

    /// Returns child `i`, where `child(num_keys)` is the rightmost child.
    #[inline]
    pub fn child(&self, i: usize) -> PageId {
        if i == self.num_keys() as usize {
            self.right_child()
        } else {
            PageId::new(read_u32(
                self.data,
                INTERNAL_HEADER_SIZE + i * INTERNAL_CELL_SIZE,
            ))
        }
    }

    /// Returns key `i`.
    #[inline]
    pub fn key(&self, i: usize) -> u32 {
        read_u32(self.data, INTERNAL_HEADER_SIZE + i * INTERNAL_CELL_SIZE + 4)
    }

    /// Returns the child page where `key` belongs; see
    /// [`InternalPage::find_child`].
    pub fn find_child(&self, key: u32) -> PageId {
        let mut lo = 0usize;
        let mut hi = self.num_keys() as usize;
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.key(mid) <= key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        self.child(lo)
    }

    /// Returns the position of `child_page` in the child sequence, or
    /// `None` when it is not referenced by this node.
    pub fn child_index(&self, child_page: PageId) -> Option<usize> {
        let n = self.num_keys() as usize;
        (0..=n).find(|&i| self.child(i) == child_page)
    }

    /// Collects all keys in order.
    pub fn keys(&self) -> Vec<u32> {
        (0..self.num_keys() as usize).map(|i| self.key(i)).collect()
    }

    /// Collects all `num_keys + 1` children in order.
    pub fn children(&self) -> Vec<PageId> {
        (0..=self.num_keys() as usize)
            .map(|i| self.child(i))
            .collect()
    }
}

#[inline]
fn read_u32(data: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(data[off..off + 4].try_into().unwrap())
}

#[inline]
fn write_u32(data: &mut [u8], off: usize, v: u32) {
    data[off..off + 4].copy_from_slice(&v.to_le_bytes());
}
