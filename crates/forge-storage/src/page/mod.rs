//! Page layout and disk format.
//!
//! Every page is 4096 bytes. Tree pages share a 6-byte common header
//! (`[type:1][is_root:1][crc32:4]`); the leaf and internal layouts extend
//! it. Page views are thin wrappers over byte slices with little-endian
//! accessors - they own no data and perform no I/O.

pub mod checksum;
pub mod internal;
pub mod leaf;
pub mod node;
pub mod types;

pub use checksum::{compute_checksum, page_checksum};
pub use internal::{InternalPage, InternalPageRef};
pub use leaf::{LeafPage, LeafPageRef};
pub use types::PageType;
