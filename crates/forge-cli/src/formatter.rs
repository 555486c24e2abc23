//! Text rendering for rows and diagnostic blocks.

use forge_common::PageId;
use forge_storage::pager::DbHeader;
use forge_storage::{BloomStats, PoolStats, Row};

/// Formats one row the way `select` prints it.
pub fn format_row(row: &Row) -> String {
    format!("  ({}, {}, {})", row.id, row.username, row.email)
}

/// Formats the database header block.
pub fn format_db_stats(header: &DbHeader) -> String {
    let free_head = if header.first_free_page == 0 {
        "(none)".to_string()
    } else {
        header.first_free_page.to_string()
    };
    format!(
        "=== ForgeDB Stats ===\n\
         Magic:       0x{:x}\n\
         Page Size:   {} bytes\n\
         Total Pages: {}\n\
         Free Pages:  {}\n\
         Free Head:   {}",
        header.magic, header.page_size, header.total_pages, header.free_pages, free_head
    )
}

/// Formats the buffer pool block.
pub fn format_pool_stats(stats: &PoolStats) -> String {
    let mut out = format!(
        "=== Buffer Pool ===\n\
         Frames:     {} / {}\n\
         Pinned:     {}\n\
         Cache Hits: {}\n\
         Misses:     {}\n\
         Evictions:  {}",
        stats.frames_used, stats.capacity, stats.pinned, stats.hits, stats.misses, stats.evictions
    );
    if stats.hits + stats.misses > 0 {
        out.push_str(&format!("\nHit Ratio:  {:.1}%", stats.hit_ratio() * 100.0));
    }
    out
}

/// Formats the Bloom filter block.
pub fn format_bloom_stats(stats: &BloomStats) -> String {
    format!(
        "=== Bloom Filter ===\n\
         Size:     {} bytes ({} bits)\n\
         Bits Set: {} / {}\n\
         Fill:     {:.1}%\n\
         Est. FPR: ~{:.4}%",
        stats.total_bits / 8,
        stats.total_bits,
        stats.bits_set,
        stats.total_bits,
        stats.fill_ratio() * 100.0,
        stats.estimated_fpr() * 100.0
    )
}

/// Formats the free-list chain.
pub fn format_free_list(pages: &[PageId]) -> String {
    if pages.is_empty() {
        return "Free List: (empty)".to_string();
    }
    let chain: Vec<String> = pages.iter().map(|p| format!("[Page {p}]")).collect();
    format!("Free List: {}", chain.join(" -> "))
}
