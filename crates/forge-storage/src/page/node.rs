//! Common node header accessors.
//!
//! Every node page (leaf, internal, or free) starts with the same 6-byte
//! header: `[type:1][is_root:1][crc32:4]`. These free functions read and
//! write it on any page-sized byte slice; the leaf and internal views build
//! on top of them.

use forge_common::constants::{OFFSET_CHECKSUM, OFFSET_IS_ROOT, OFFSET_TYPE};

use super::types::PageType;

/// Returns the node type stored at byte 0, or `None` for an unknown value.
#[inline]
pub fn page_type(data: &[u8]) -> Option<PageType> {
    PageType::from_u8(data[OFFSET_TYPE])
}

/// Sets the node type byte.
#[inline]
pub fn set_page_type(data: &mut [u8], page_type: PageType) {
    data[OFFSET_TYPE] = page_type as u8;
}

/// Returns the is-root flag.
#[inline]
pub fn is_root(data: &[u8]) -> bool {
    data[OFFSET_IS_ROOT] != 0
}

/// Sets the is-root flag.
#[inline]
pub fn set_root(data: &mut [u8], root: bool) {
    data[OFFSET_IS_ROOT] = u8::from(root);
}

/// Returns the stored CRC32.
#[inline]
pub fn stored_checksum(data: &[u8]) -> u32 {
    let bytes: [u8; 4] = data[OFFSET_CHECKSUM..OFFSET_CHECKSUM + 4]
        .try_into()
        .unwrap();
    u32::from_le_bytes(bytes)
}

/// Stores a CRC32 into the header field.
#[inline]
pub fn set_checksum(data: &mut [u8], crc: u32) {
    data[OFFSET_CHECKSUM..OFFSET_CHECKSUM + 4].copy_from_slice(&crc.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_common::constants::PAGE_SIZE;

    #[test]
    fn test_type_round_trip() {
        let mut page = vec![0u8; PAGE_SIZE];
        assert_eq!(page_type(&page), Some(PageType::Internal));

        set_page_type(&mut page, PageType::Leaf);
        assert_eq!(page_type(&page), Some(PageType::Leaf));

        set_page_type(&mut page, PageType::Free);
        assert_eq!(page_type(&page), Some(PageType::Free));

        page[0] = 9;
        assert_eq!(page_type(&page), None);
    }

    #[test]
    fn test_root_flag() {
        let mut page = vec![0u8; PAGE_SIZE];
        assert!(!is_root(&page));
        set_root(&mut page, true);
        assert!(is_root(&page));
        set_root(&mut page, false);
        assert!(!is_root(&page));
    }

    #[test]
    fn test_checksum_round_trip() {
        let mut page = vec![0u8; PAGE_SIZE];
        assert_eq!(stored_checksum(&page), 0);
        set_checksum(&mut page, 0xDEAD_BEEF);
        assert_eq!(stored_checksum(&page), 0xDEAD_BEEF);
    }
}
