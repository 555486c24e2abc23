//! B+ tree over the paged storage layer.
//!
//! Slotted variable-length leaves chained through sibling pointers,
//! fixed-format internal nodes, stack-based traversal (no parent pointers
//! in the page format), byte-balanced leaf splits with root growth, and
//! deletion with borrow/merge/root-collapse. The Bloom filter on the
//! header page gates lookups and deletes before the tree is touched.

mod cursor;
mod dump;
mod tree;

pub use cursor::Rows;
pub use tree::BTree;
