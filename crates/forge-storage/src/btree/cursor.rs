//! Traversal cursor and lazy row iteration.

use forge_common::{ForgeResult, PageId};

use crate::page::LeafPageRef;
use crate::pager::Pager;
use crate::row::Row;

/// Result of a tree descent: the terminal leaf plus the stack of internal
/// ancestors, oldest first. The path lets splits and merges propagate
/// upward without parent pointers in the page format.
pub(crate) struct Cursor {
    /// The leaf the descent ended in.
    pub page: PageId,
    /// Internal ancestors of `page`, root first.
    pub path: Vec<PageId>,
}

/// Lazy iterator over rows in ascending key order.
///
/// Walks the leaf chain through `next_leaf` pointers, fetching each page
/// through the pager as it goes, and stops once a key exceeds the upper
/// bound. Restartable by reissuing the originating call.
pub struct Rows<'p> {
    pager: &'p mut Pager,
    page: PageId,
    cell: u32,
    lo: u32,
    hi: u32,
}

enum Step {
    Advance(PageId),
    Skip,
    Emit(Row),
    Done,
}

impl<'p> Rows<'p> {
    pub(crate) fn new(pager: &'p mut Pager, start: PageId, lo: u32, hi: u32) -> Self {
        Self {
            pager,
            page: start,
            cell: 0,
            lo,
            hi,
        }
    }
}

impl Iterator for Rows<'_> {
    type Item = ForgeResult<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.page.is_nil() {
                return None;
            }

            let step = {
                let guard = match self.pager.fetch(self.page) {
                    Ok(guard) => guard,
                    Err(e) => {
                        self.page = PageId::NIL;
                        return Some(Err(e));
                    }
                };
                let data = guard.data();
                let leaf = LeafPageRef::new(&data);

                if self.cell >= leaf.num_cells() {
                    Step::Advance(leaf.next_leaf())
                } else {
                    let key = leaf.key(self.cell as usize);
                    if key > self.hi {
                        Step::Done
                    } else if key < self.lo {
                        Step::Skip
                    } else {
                        Step::Emit(leaf.row(self.cell as usize))
                    }
                }
            };

            match step {
                Step::Advance(next) => {
                    self.page = next;
                    self.cell = 0;
                }
                Step::Skip => self.cell += 1,
                Step::Emit(row) => {
                    self.cell += 1;
                    return Some(Ok(row));
                }
                Step::Done => {
                    self.page = PageId::NIL;
                    return None;
                }
            }
        }
    }
}
