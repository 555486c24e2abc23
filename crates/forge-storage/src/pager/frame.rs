//! Buffer frames and pin guards.
//!
//! A frame holds one page in memory. Frames are shared as `Arc<PageFrame>`
//! and accessed through [`FrameGuard`], an RAII guard that keeps the frame
//! pinned (and therefore un-evictable) for as long as it is held.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use forge_common::constants::PAGE_SIZE;
use forge_common::PageId;
use parking_lot::RwLock;

/// A buffer frame holding a single page.
///
/// The pin count and dirty flag are atomic so the pager can inspect them
/// without taking the data lock.
pub struct PageFrame {
    /// Page held by this frame.
    page_id: PageId,
    /// Page contents.
    data: RwLock<Vec<u8>>,
    /// Number of active references; a pinned frame is never evicted.
    pin_count: AtomicU32,
    /// Whether the page was modified since it was last written out.
    dirty: AtomicBool,
}

impl PageFrame {
    /// Creates a zeroed frame for `page_id`.
    pub fn new(page_id: PageId) -> Self {
        Self {
            page_id,
            data: RwLock::new(vec![0u8; PAGE_SIZE]),
            pin_count: AtomicU32::new(0),
            dirty: AtomicBool::new(false),
        }
    }

    /// Returns the page this frame holds.
    #[inline]
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Returns the current pin count.
    #[inline]
    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Acquire)
    }

    /// Increments the pin count and returns the new value.
    #[inline]
    pub fn pin(&self) -> u32 {
        self.pin_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrements the pin count and returns the new value.
    #[inline]
    pub fn unpin(&self) -> u32 {
        let old = self.pin_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(old > 0, "unpinned frame with pin_count = 0");
        old - 1
    }

    /// Returns true if the frame is pinned.
    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.pin_count() > 0
    }

    /// Returns true if the frame holds unwritten modifications.
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Sets or clears the dirty flag.
    #[inline]
    pub fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty, Ordering::Release);
    }

    /// Returns a read lock on the page data.
    #[inline]
    pub fn read_data(&self) -> parking_lot::RwLockReadGuard<'_, Vec<u8>> {
        self.data.read()
    }

    /// Returns a write lock on the page data.
    #[inline]
    pub fn write_data(&self) -> parking_lot::RwLockWriteGuard<'_, Vec<u8>> {
        self.data.write()
    }
}

impl std::fmt::Debug for PageFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageFrame")
            .field("page_id", &self.page_id)
            .field("pin_count", &self.pin_count())
            .field("dirty", &self.is_dirty())
            .finish()
    }
}

/// RAII pin guard for a page in the buffer pool.
///
/// Holding the guard pins the frame; the pin is released on drop. Reading
/// goes through [`data`](Self::data); [`data_mut`](Self::data_mut) marks
/// the page dirty. A guard must not outlive the operation that fetched it:
/// every compound tree operation re-fetches pages by number.
pub struct FrameGuard {
    frame: Arc<PageFrame>,
}

impl FrameGuard {
    /// Wraps a frame, taking one pin.
    pub(crate) fn new(frame: Arc<PageFrame>) -> Self {
        frame.pin();
        Self { frame }
    }

    /// Returns the page this guard refers to.
    #[inline]
    pub fn page_id(&self) -> PageId {
        self.frame.page_id()
    }

    /// Returns a read view of the page bytes.
    #[inline]
    pub fn data(&self) -> impl Deref<Target = [u8]> + '_ {
        PageDataRef {
            guard: self.frame.read_data(),
        }
    }

    /// Returns a write view of the page bytes and marks the page dirty.
    #[inline]
    pub fn data_mut(&self) -> impl DerefMut<Target = [u8]> + '_ {
        self.frame.set_dirty(true);
        PageDataMut {
            guard: self.frame.write_data(),
        }
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        self.frame.unpin();
    }
}

impl std::fmt::Debug for FrameGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameGuard")
            .field("page_id", &self.page_id())
            .finish()
    }
}

struct PageDataRef<'a> {
    guard: parking_lot::RwLockReadGuard<'a, Vec<u8>>,
}

impl Deref for PageDataRef<'_> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

struct PageDataMut<'a> {
    guard: parking_lot::RwLockWriteGuard<'a, Vec<u8>>,
}

impl Deref for PageDataMut<'_> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl DerefMut for PageDataMut<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_creation() {
        let frame = PageFrame::new(PageId::new(3));
        assert_eq!(frame.page_id(), PageId::new(3));
        assert_eq!(frame.pin_count(), 0);
        assert!(!frame.is_dirty());
        assert_eq!(frame.read_data().len(), PAGE_SIZE);
    }

    #[test]
    fn test_pin_unpin() {
        let frame = PageFrame::new(PageId::new(1));
        assert!(!frame.is_pinned());

        assert_eq!(frame.pin(), 1);
        assert_eq!(frame.pin(), 2);
        assert!(frame.is_pinned());

        assert_eq!(frame.unpin(), 1);
        assert_eq!(frame.unpin(), 0);
        assert!(!frame.is_pinned());
    }

    #[test]
    fn test_guard_pins_and_unpins() {
        let frame = Arc::new(PageFrame::new(PageId::new(2)));
        {
            let guard = FrameGuard::new(Arc::clone(&frame));
            assert_eq!(frame.pin_count(), 1);
            assert_eq!(guard.page_id(), PageId::new(2));
        }
        assert_eq!(frame.pin_count(), 0);
    }

    #[test]
    fn test_guard_write_marks_dirty() {
        let frame = Arc::new(PageFrame::new(PageId::new(2)));
        let guard = FrameGuard::new(Arc::clone(&frame));

        {
            let data = guard.data();
            assert_eq!(data[0], 0);
        }
        assert!(!frame.is_dirty());

        {
            let mut data = guard.data_mut();
            data[0..4].copy_from_slice(&[1, 2, 3, 4]);
        }
        assert!(frame.is_dirty());

        let data = guard.data();
        assert_eq!(&data[0..4], &[1, 2, 3, 4]);
    }
}
