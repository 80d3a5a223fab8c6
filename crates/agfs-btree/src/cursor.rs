//! Transaction-scoped tree cursor.
//!
//! A cursor records the path from the root to one slot: one parsed node,
//! one active slot index, and read-ahead state per level. It is exclusively
//! owned by the calling operation and never persisted; its lifetime is one
//! top-level operation (lookup/insert/delete) or a short explicit sequence
//! such as the insert loop across a split.

use crate::{BtNode, BtreeOps, TreeRoot};
use agfs_block::Txn;
use agfs_types::BlockNumber;

/// Read-ahead already requested toward the left sibling.
pub const RA_LEFT: u8 = 0x01;
/// Read-ahead already requested toward the right sibling.
pub const RA_RIGHT: u8 = 0x02;

/// A pinned node at one cursor level.
#[derive(Debug)]
pub enum NodeBuf<O: BtreeOps> {
    /// Node backed by an on-disk block.
    Disk {
        ptr: O::Ptr,
        block: BlockNumber,
        node: BtNode<O::Ptr, O::Key, O::Rec>,
    },
    /// The inline root (no backing block).
    Inline {
        node: BtNode<O::Ptr, O::Key, O::Rec>,
    },
}

impl<O: BtreeOps> NodeBuf<O> {
    #[must_use]
    pub fn node(&self) -> &BtNode<O::Ptr, O::Key, O::Rec> {
        match self {
            Self::Disk { node, .. } | Self::Inline { node } => node,
        }
    }

    pub fn node_mut(&mut self) -> &mut BtNode<O::Ptr, O::Key, O::Rec> {
        match self {
            Self::Disk { node, .. } | Self::Inline { node } => node,
        }
    }

    #[must_use]
    pub fn is_inline(&self) -> bool {
        matches!(self, Self::Inline { .. })
    }

    /// Tree pointer of the backing block, or null for the inline root.
    #[must_use]
    pub fn ptr(&self) -> O::Ptr {
        use crate::BtreePtr;
        match self {
            Self::Disk { ptr, .. } => *ptr,
            Self::Inline { .. } => O::Ptr::NULL,
        }
    }
}

impl<O: BtreeOps> Clone for NodeBuf<O> {
    fn clone(&self) -> Self {
        match self {
            Self::Disk { ptr, block, node } => Self::Disk {
                ptr: *ptr,
                block: *block,
                node: node.clone(),
            },
            Self::Inline { node } => Self::Inline { node: node.clone() },
        }
    }
}

#[derive(Debug)]
pub(crate) struct CursorLevel<O: BtreeOps> {
    pub(crate) buf: NodeBuf<O>,
    pub(crate) index: usize,
    pub(crate) ra: u8,
}

impl<O: BtreeOps> Clone for CursorLevel<O> {
    fn clone(&self) -> Self {
        Self {
            buf: self.buf.clone(),
            index: self.index,
            ra: self.ra,
        }
    }
}

/// Cursor over one tree, valid within one transaction.
#[derive(Debug)]
pub struct BtCursor<O: BtreeOps> {
    pub(crate) root: TreeRoot<O::Ptr>,
    pub(crate) verify: crate::VerifyLevel,
    /// `levels[0]` is the leaf level; `levels[nlevels-1]` the root.
    pub(crate) levels: Vec<Option<CursorLevel<O>>>,
}

impl<O: BtreeOps> BtCursor<O> {
    /// Create an unpositioned cursor. No I/O happens until the first
    /// operation descends the tree.
    #[must_use]
    pub fn new(root: TreeRoot<O::Ptr>, verify: crate::VerifyLevel) -> Self {
        let n = usize::from(root.nlevels());
        Self {
            root,
            verify,
            levels: (0..n).map(|_| None).collect(),
        }
    }

    #[must_use]
    pub fn root(&self) -> &TreeRoot<O::Ptr> {
        &self.root
    }

    #[must_use]
    pub fn nlevels(&self) -> u16 {
        self.root.nlevels()
    }

    #[must_use]
    pub fn verify(&self) -> crate::VerifyLevel {
        self.verify
    }

    /// Deep-copy the cursor: per-level nodes and slot indices.
    ///
    /// Used before a destructive probe (e.g. rebalance) so the original
    /// position survives if the probe is abandoned.
    #[must_use]
    pub fn duplicate(&self) -> Self {
        Self {
            root: self.root,
            verify: self.verify,
            levels: self.levels.clone(),
        }
    }

    /// Drop every pinned level. Safe to call repeatedly; already-released
    /// levels are skipped.
    pub fn release(&mut self) {
        for level in &mut self.levels {
            *level = None;
        }
    }

    /// Replace the pinned node at `level`, releasing the prior one.
    ///
    /// Read-ahead flags for the level are reset from the new node's sibling
    /// nullness, so a freshly attached block does not trigger spurious
    /// prefetch toward a sibling that does not exist.
    pub fn set_buffer(&mut self, level: u16, buf: NodeBuf<O>, index: usize) {
        use crate::BtreePtr;
        let mut ra = 0;
        if buf.node().left.is_null() {
            ra |= RA_LEFT;
        }
        if buf.node().right.is_null() {
            ra |= RA_RIGHT;
        }
        self.levels[usize::from(level)] = Some(CursorLevel { buf, index, ra });
    }

    #[must_use]
    pub fn buf(&self, level: u16) -> Option<&NodeBuf<O>> {
        self.levels
            .get(usize::from(level))
            .and_then(|l| l.as_ref())
            .map(|l| &l.buf)
    }

    #[must_use]
    pub fn node(&self, level: u16) -> Option<&BtNode<O::Ptr, O::Key, O::Rec>> {
        self.buf(level).map(NodeBuf::node)
    }

    pub(crate) fn level_mut(&mut self, level: u16) -> Option<&mut CursorLevel<O>> {
        self.levels
            .get_mut(usize::from(level))
            .and_then(|l| l.as_mut())
    }

    #[must_use]
    pub fn index(&self, level: u16) -> usize {
        self.levels
            .get(usize::from(level))
            .and_then(|l| l.as_ref())
            .map_or(0, |l| l.index)
    }

    pub fn set_index(&mut self, level: u16, index: usize) {
        if let Some(l) = self.level_mut(level) {
            l.index = index;
        }
    }

    /// The record under the cursor at the leaf level, if positioned.
    #[must_use]
    pub fn current_rec(&self) -> Option<&O::Rec> {
        let l = self.levels.first()?.as_ref()?;
        l.buf.node().recs.get(l.index)
    }

    /// Issue sibling prefetch hints at `level` for the directions in
    /// `mask`, at most once per direction per cursor position. Inline-root
    /// levels never prefetch.
    pub fn readahead(&mut self, ops: &O, txn: &Txn<'_>, level: u16, mask: u8) {
        use crate::BtreePtr;
        let Some(l) = self.level_mut(level) else {
            return;
        };
        if l.buf.is_inline() {
            return;
        }
        let (left, right) = {
            let node = l.buf.node();
            (node.left, node.right)
        };
        if mask & RA_LEFT != 0 && l.ra & RA_LEFT == 0 {
            l.ra |= RA_LEFT;
            if !left.is_null() {
                if let Ok(block) = ops.ptr_to_block(left) {
                    txn.readahead(block);
                }
            }
        }
        if mask & RA_RIGHT != 0 && l.ra & RA_RIGHT == 0 {
            l.ra |= RA_RIGHT;
            if !right.is_null() {
                if let Ok(block) = ops.ptr_to_block(right) {
                    txn.readahead(block);
                }
            }
        }
    }
}
