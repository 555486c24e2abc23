//! Diagnostic tree inspection: an indented text dump and a JSON dump.

use std::fmt::Write as _;

use forge_common::constants::ROOT_PAGE;
use forge_common::{ForgeError, ForgeResult, PageId};

use super::tree::BTree;
use crate::page::node;
use crate::page::types::PageType;
use crate::page::{InternalPageRef, LeafPageRef};

/// Snapshot of one node, read under a single page guard so recursion
/// never holds more than one page at a time.
enum NodeInfo {
    Leaf {
        cells: Vec<(u32, u16)>,
        used: usize,
        next: PageId,
    },
    Internal {
        keys: Vec<u32>,
        children: Vec<PageId>,
    },
}

impl BTree {
    /// Renders the tree as an indented text outline, one line per node
    /// with per-record sizes under each leaf.
    pub fn tree_dump(&mut self) -> ForgeResult<String> {
        let mut out = String::new();
        self.dump_node(PageId::new(ROOT_PAGE), 0, &mut out)?;
        Ok(out)
    }

    /// Renders the tree as a single-line JSON document.
    pub fn json_dump(&mut self) -> ForgeResult<String> {
        let mut out = String::new();
        self.json_node(PageId::new(ROOT_PAGE), &mut out)?;
        out.push('\n');
        Ok(out)
    }

    fn read_node(&mut self, page: PageId) -> ForgeResult<NodeInfo> {
        let guard = self.pager.fetch(page)?;
        let data = guard.data();
        match node::page_type(&data) {
            Some(PageType::Leaf) => {
                let leaf = LeafPageRef::new(&data);
                let cells = (0..leaf.num_cells() as usize)
                    .map(|i| (leaf.key(i), leaf.slot_length(i)))
                    .collect();
                Ok(NodeInfo::Leaf {
                    cells,
                    used: leaf.used_bytes(),
                    next: leaf.next_leaf(),
                })
            }
            Some(PageType::Internal) => {
                let internal = InternalPageRef::new(&data);
                Ok(NodeInfo::Internal {
                    keys: internal.keys(),
                    children: internal.children(),
                })
            }
            _ => Err(ForgeError::invariant(format!(
                "page {page} has no valid node type"
            ))),
        }
    }

    fn dump_node(&mut self, page: PageId, level: usize, out: &mut String) -> ForgeResult<()> {
        let indent = "  ".repeat(level);
        match self.read_node(page)? {
            NodeInfo::Leaf { cells, used, next } => {
                let next = if next.is_nil() {
                    "nil".to_string()
                } else {
                    next.to_string()
                };
                let _ = writeln!(
                    out,
                    "{indent}- LEAF (Page {page}) | {} rows, {used}B used | next->{next}",
                    cells.len()
                );
                for (key, len) in cells {
                    let _ = writeln!(out, "{indent}  {key} [{len}B]");
                }
            }
            NodeInfo::Internal { keys, children } => {
                let _ = writeln!(
                    out,
                    "{indent}- INTERNAL (Page {page}) | {} keys",
                    keys.len()
                );
                for (i, key) in keys.iter().enumerate() {
                    self.dump_node(children[i], level + 1, out)?;
                    let _ = writeln!(out, "{indent}  Key: {key}");
                }
                if let Some(last) = children.last() {
                    self.dump_node(*last, level + 1, out)?;
                }
            }
        }
        Ok(())
    }

    fn json_node(&mut self, page: PageId, out: &mut String) -> ForgeResult<()> {
        match self.read_node(page)? {
            NodeInfo::Leaf { cells, .. } => {
                let _ = write!(out, "{{\"type\": \"leaf\", \"page\": {page}, \"cells\": [");
                for (i, (key, _)) in cells.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    let _ = write!(out, "{key}");
                }
                out.push_str("]}");
            }
            NodeInfo::Internal { keys, children } => {
                let _ = write!(
                    out,
                    "{{\"type\": \"internal\", \"page\": {page}, \"children\": ["
                );
                for (i, child) in children.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    self.json_node(*child, out)?;
                }
                out.push_str("], \"keys\": [");
                for (i, key) in keys.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    let _ = write!(out, "{key}");
                }
                out.push_str("]}");
            }
        }
        Ok(())
    }
}
