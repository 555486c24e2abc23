//! Page checksum utilities.
//!
//! Tree pages carry a CRC32 (ISO 3309, reflected 0xEDB88320) at bytes 2-5
//! of the common node header. The checksum is computed over the full
//! 4096-byte page with those four bytes treated as zero.

use forge_common::constants::OFFSET_CHECKSUM;

/// Computes a plain CRC32 checksum of the given data.
///
/// # Example
///
/// ```rust
/// use forge_storage::page::compute_checksum;
///
/// let data = b"Hello, ForgeDB!";
/// let checksum = compute_checksum(data);
/// assert_ne!(checksum, 0);
/// assert_eq!(compute_checksum(data), checksum);
/// ```
#[inline]
pub fn compute_checksum(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Computes the checksum of a page with the stored CRC field zeroed.
///
/// This is used both when stamping a page before a write and when
/// verifying a page after a read: feeding four zero bytes in place of the
/// CRC field yields the checksum of the page as it looked before stamping.
pub fn page_checksum(page: &[u8]) -> u32 {
    debug_assert!(page.len() > OFFSET_CHECKSUM + 4);

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&page[..OFFSET_CHECKSUM]);
    hasher.update(&[0u8; 4]);
    hasher.update(&page[OFFSET_CHECKSUM + 4..]);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_common::constants::PAGE_SIZE;

    #[test]
    fn test_compute_checksum() {
        let data = b"test data";
        let checksum = compute_checksum(data);

        // Deterministic
        assert_eq!(compute_checksum(data), checksum);

        // Sensitive to content
        assert_ne!(compute_checksum(b"test datb"), checksum);
    }

    #[test]
    fn test_known_value() {
        // CRC-32/ISO-3309 of "123456789" is the classic check value.
        assert_eq!(compute_checksum(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn test_page_checksum_ignores_crc_field() {
        let mut page = vec![0u8; PAGE_SIZE];
        page[0] = 1;
        page[100] = 0xAB;

        let before = page_checksum(&page);

        // Writing into the CRC field must not change the computed value
        page[OFFSET_CHECKSUM..OFFSET_CHECKSUM + 4].copy_from_slice(&before.to_le_bytes());
        assert_eq!(page_checksum(&page), before);

        // But any other byte does
        page[100] = 0xCD;
        assert_ne!(page_checksum(&page), before);
    }

    #[test]
    fn test_page_checksum_matches_zeroed_field() {
        let mut page = vec![0u8; PAGE_SIZE];
        for (i, byte) in page.iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }

        let skipped = page_checksum(&page);

        let mut zeroed = page.clone();
        zeroed[OFFSET_CHECKSUM..OFFSET_CHECKSUM + 4].fill(0);
        assert_eq!(compute_checksum(&zeroed), skipped);
    }
}
