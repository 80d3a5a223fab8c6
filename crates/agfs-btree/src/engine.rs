//! The generic engine: search, insert (rebalance/split/root growth),
//! delete (steal/merge/root collapse), record update, and ordered
//! traversal.
//!
//! All functions operate through a [`BtCursor`] positioned by a prior
//! [`lookup`] and call back into the tree kind's [`BtreeOps`] for codecs,
//! comparison, fanout, and block allocation. Every mutation is staged into
//! the caller's transaction; nothing reaches the device until the caller
//! commits.

use crate::cursor::{BtCursor, CursorLevel, NodeBuf, RA_LEFT, RA_RIGHT};
use crate::{decode_node, encode_node, BtNode, BtreeOps, BtreePtr, TreeRoot};
use agfs_block::Txn;
use agfs_error::{AgfsError, Result};
use agfs_types::BlockNumber;
use std::cmp::Ordering;
use tracing::{debug, trace};

/// Search direction for [`lookup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupDir {
    /// Exact match only.
    Eq,
    /// Least upper bound: smallest record with key `>=` the target.
    Ge,
    /// Greatest lower bound: largest record with key `<=` the target.
    Le,
}

fn cursor_err(detail: &str) -> AgfsError {
    AgfsError::Format(format!("btree cursor: {detail}"))
}

fn level_ref<O: BtreeOps>(cur: &BtCursor<O>, level: u16) -> Result<&CursorLevel<O>> {
    cur.levels
        .get(usize::from(level))
        .and_then(|l| l.as_ref())
        .ok_or_else(|| cursor_err("level not positioned"))
}

fn level_mut<O: BtreeOps>(cur: &mut BtCursor<O>, level: u16) -> Result<&mut CursorLevel<O>> {
    cur.levels
        .get_mut(usize::from(level))
        .and_then(|l| l.as_mut())
        .ok_or_else(|| cursor_err("level not positioned"))
}

fn read_node_at<O: BtreeOps>(
    ops: &O,
    txn: &Txn<'_>,
    verify: crate::VerifyLevel,
    ptr: O::Ptr,
    expected_level: u16,
) -> Result<(BlockNumber, BtNode<O::Ptr, O::Key, O::Rec>)> {
    let block = ops.ptr_to_block(ptr)?;
    let buf = txn.read_block(block)?;
    let node = decode_node(ops, buf.as_slice(), block, Some(expected_level), verify)?;
    Ok((block, node))
}

fn write_node_block<O: BtreeOps>(
    ops: &O,
    txn: &mut Txn<'_>,
    block: BlockNumber,
    node: &BtNode<O::Ptr, O::Key, O::Rec>,
) -> Result<()> {
    let bytes = encode_node(ops, node, txn.block_size() as usize)?;
    txn.log_block(block, &bytes)
}

/// Write back the cursor's node at `level` (disk block or inline root).
fn write_level<O: BtreeOps>(
    ops: &mut O,
    txn: &mut Txn<'_>,
    cur: &BtCursor<O>,
    level: u16,
) -> Result<()> {
    let l = level_ref(cur, level)?;
    match &l.buf {
        NodeBuf::Disk { block, node, .. } => {
            let bytes = encode_node(ops, node, txn.block_size() as usize)?;
            txn.log_block(*block, &bytes)
        }
        NodeBuf::Inline { node } => ops.store_inline_root(txn, node),
    }
}

fn disk_location<O: BtreeOps>(cur: &BtCursor<O>, level: u16) -> Result<(O::Ptr, BlockNumber)> {
    match &level_ref(cur, level)?.buf {
        NodeBuf::Disk { ptr, block, .. } => Ok((*ptr, *block)),
        NodeBuf::Inline { .. } => Err(cursor_err("inline root where a disk block was expected")),
    }
}

/// Low key of a node: first record's key on a leaf, first separator on an
/// interior node.
fn low_key<O: BtreeOps>(ops: &O, node: &BtNode<O::Ptr, O::Key, O::Rec>) -> Result<O::Key> {
    if node.is_leaf() {
        node.recs
            .first()
            .map(|r| ops.key_of(r))
            .ok_or_else(|| cursor_err("empty node has no low key"))
    } else {
        node.keys
            .first()
            .copied()
            .ok_or_else(|| cursor_err("empty node has no low key"))
    }
}

fn load_root_buf<O: BtreeOps>(ops: &O, txn: &Txn<'_>, cur: &BtCursor<O>) -> Result<NodeBuf<O>> {
    match *cur.root() {
        TreeRoot::Inline { .. } => Ok(NodeBuf::Inline {
            node: ops.load_inline_root()?,
        }),
        TreeRoot::Block { ptr, nlevels } => {
            let (block, node) = read_node_at(ops, txn, cur.verify(), ptr, nlevels - 1)?;
            Ok(NodeBuf::Disk { ptr, block, node })
        }
    }
}

fn child_ptr<O: BtreeOps>(node: &BtNode<O::Ptr, O::Key, O::Rec>, idx: usize) -> Result<O::Ptr> {
    node.ptrs
        .get(idx)
        .copied()
        .ok_or_else(|| cursor_err("child index out of range"))
}

// ── Lookup ──────────────────────────────────────────────────────────────────

/// Descend from the root and position the cursor at (or around) `key`.
///
/// Returns whether a record satisfying `dir` was found; the cursor is left
/// positioned at the matching slot (`true`) or at the insertion slot for
/// `key` at the leaf level (`Eq` miss). For `Ge`/`Le` the search steps
/// across a block boundary via the sibling chain instead of failing when
/// the bound lives in an adjacent leaf.
pub fn lookup<O: BtreeOps>(
    ops: &O,
    txn: &Txn<'_>,
    cur: &mut BtCursor<O>,
    key: &O::Key,
    dir: LookupDir,
) -> Result<bool> {
    cur.release();
    let nlevels = cur.nlevels();
    if nlevels == 0 {
        return Err(cursor_err("tree has no levels"));
    }

    let mut buf = load_root_buf(ops, txn, cur)?;
    let mut level = nlevels - 1;
    while level > 0 {
        let (child, child_idx) = {
            let node = buf.node();
            let pos = node
                .keys
                .partition_point(|k| ops.cmp_keys(k, key) != Ordering::Greater);
            let child_idx = pos.saturating_sub(1);
            (child_ptr::<O>(node, child_idx)?, child_idx)
        };
        cur.set_buffer(level, buf, child_idx);
        level -= 1;
        let (block, node) = read_node_at(ops, txn, cur.verify(), child, level)?;
        buf = NodeBuf::Disk {
            ptr: child,
            block,
            node,
        };
    }

    let (pos, n, exact) = {
        let node = buf.node();
        let pos = node
            .recs
            .partition_point(|r| ops.cmp_keys(&ops.key_of(r), key) == Ordering::Less);
        let exact = node
            .recs
            .get(pos)
            .is_some_and(|r| ops.cmp_keys(&ops.key_of(r), key) == Ordering::Equal);
        (pos, node.recs.len(), exact)
    };
    cur.set_buffer(0, buf, pos);

    match dir {
        LookupDir::Eq => Ok(exact),
        LookupDir::Ge => {
            if pos < n {
                return Ok(true);
            }
            if n == 0 {
                return Ok(false);
            }
            // Overshot the last record; the bound, if any, is the first
            // record of the right sibling.
            cur.set_index(0, n - 1);
            increment(ops, txn, cur, 0)
        }
        LookupDir::Le => {
            if exact {
                return Ok(true);
            }
            if pos > 0 {
                cur.set_index(0, pos - 1);
                return Ok(true);
            }
            // Everything in this leaf is greater; the bound, if any, is the
            // last record of the left sibling.
            decrement(ops, txn, cur, 0)
        }
    }
}

// ── Traversal ───────────────────────────────────────────────────────────────

/// Step the cursor to the next record at `level`. Returns `false` at the
/// end of the tree (cursor position unchanged).
pub fn increment<O: BtreeOps>(
    ops: &O,
    txn: &Txn<'_>,
    cur: &mut BtCursor<O>,
    level: u16,
) -> Result<bool> {
    let (idx, n) = {
        let l = level_ref(cur, level)?;
        (l.index, l.buf.node().numrecs())
    };
    if idx + 1 < n {
        cur.set_index(level, idx + 1);
        return Ok(true);
    }

    // About to cross a block boundary; hint the direction of travel.
    cur.readahead(ops, txn, level, RA_RIGHT);

    let nlevels = cur.nlevels();
    let mut lvl = level + 1;
    loop {
        if lvl >= nlevels {
            return Ok(false);
        }
        let a = level_ref(cur, lvl)?;
        if a.index + 1 < a.buf.node().numrecs() {
            break;
        }
        lvl += 1;
    }

    let new_idx = cur.index(lvl) + 1;
    cur.set_index(lvl, new_idx);
    while lvl > level {
        let child = {
            let a = level_ref(cur, lvl)?;
            child_ptr::<O>(a.buf.node(), a.index)?
        };
        lvl -= 1;
        let (block, node) = read_node_at(ops, txn, cur.verify(), child, lvl)?;
        cur.set_buffer(
            lvl,
            NodeBuf::Disk {
                ptr: child,
                block,
                node,
            },
            0,
        );
    }
    Ok(true)
}

/// Step the cursor to the previous record at `level`. Returns `false` at
/// the start of the tree (cursor position unchanged).
pub fn decrement<O: BtreeOps>(
    ops: &O,
    txn: &Txn<'_>,
    cur: &mut BtCursor<O>,
    level: u16,
) -> Result<bool> {
    let idx = level_ref(cur, level)?.index;
    if idx > 0 {
        cur.set_index(level, idx - 1);
        return Ok(true);
    }

    cur.readahead(ops, txn, level, RA_LEFT);

    let nlevels = cur.nlevels();
    let mut lvl = level + 1;
    loop {
        if lvl >= nlevels {
            return Ok(false);
        }
        if level_ref(cur, lvl)?.index > 0 {
            break;
        }
        lvl += 1;
    }

    let new_idx = cur.index(lvl) - 1;
    cur.set_index(lvl, new_idx);
    while lvl > level {
        let child = {
            let a = level_ref(cur, lvl)?;
            child_ptr::<O>(a.buf.node(), a.index)?
        };
        lvl -= 1;
        let (block, node) = read_node_at(ops, txn, cur.verify(), child, lvl)?;
        let last = node.numrecs().saturating_sub(1);
        cur.set_buffer(
            lvl,
            NodeBuf::Disk {
                ptr: child,
                block,
                node,
            },
            last,
        );
    }
    Ok(true)
}

fn descend_edge<O: BtreeOps>(
    ops: &O,
    txn: &Txn<'_>,
    cur: &mut BtCursor<O>,
    leftmost: bool,
) -> Result<bool> {
    cur.release();
    let nlevels = cur.nlevels();
    if nlevels == 0 {
        return Err(cursor_err("tree has no levels"));
    }
    let mut buf = load_root_buf(ops, txn, cur)?;
    let mut level = nlevels - 1;
    while level > 0 {
        let (child, idx) = {
            let node = buf.node();
            let idx = if leftmost { 0 } else { node.numrecs() - 1 };
            (child_ptr::<O>(node, idx)?, idx)
        };
        cur.set_buffer(level, buf, idx);
        level -= 1;
        let (block, node) = read_node_at(ops, txn, cur.verify(), child, level)?;
        buf = NodeBuf::Disk {
            ptr: child,
            block,
            node,
        };
    }
    let n = buf.node().numrecs();
    let idx = if leftmost { 0 } else { n.saturating_sub(1) };
    cur.set_buffer(0, buf, idx);
    Ok(n > 0)
}

/// Position at the first (smallest) record. Returns `false` on an empty tree.
pub fn first<O: BtreeOps>(ops: &O, txn: &Txn<'_>, cur: &mut BtCursor<O>) -> Result<bool> {
    descend_edge(ops, txn, cur, true)
}

/// Position at the last (largest) record. Returns `false` on an empty tree.
pub fn last<O: BtreeOps>(ops: &O, txn: &Txn<'_>, cur: &mut BtCursor<O>) -> Result<bool> {
    descend_edge(ops, txn, cur, false)
}

// ── Key propagation ─────────────────────────────────────────────────────────

/// Refresh parent separator keys after the low key at `level` changed,
/// climbing while the updated slot is itself a low key (index 0).
fn updkeys<O: BtreeOps>(
    ops: &mut O,
    txn: &mut Txn<'_>,
    cur: &mut BtCursor<O>,
    level: u16,
) -> Result<()> {
    let nlevels = cur.nlevels();
    let mut lvl = level;
    while lvl + 1 < nlevels {
        let low = low_key(ops, level_ref(cur, lvl)?.buf.node())?;
        let pidx = cur.index(lvl + 1);
        {
            let parent = level_mut(cur, lvl + 1)?.buf.node_mut();
            let slot = parent
                .keys
                .get_mut(pidx)
                .ok_or_else(|| cursor_err("parent key index out of range"))?;
            *slot = low;
        }
        write_level(ops, txn, cur, lvl + 1)?;
        if pidx != 0 {
            break;
        }
        lvl += 1;
    }
    Ok(())
}

// ── Insert ──────────────────────────────────────────────────────────────────

enum LevelItem<O: BtreeOps> {
    Rec(O::Rec),
    Child(O::Key, O::Ptr),
}

/// Insert `rec` at the position established by a prior [`lookup`] with
/// [`LookupDir::Eq`] returning `false`. The caller guarantees the key is
/// not already present.
///
/// Runs the bottom-up loop: a level-local insert step reports the key and
/// pointer promoted by a split, which is then inserted one level up, until
/// no split occurred or the root itself grows a level.
pub fn insert<O: BtreeOps>(
    ops: &mut O,
    txn: &mut Txn<'_>,
    cur: &mut BtCursor<O>,
    rec: O::Rec,
) -> Result<()> {
    let mut item = LevelItem::Rec(rec);
    let mut level: u16 = 0;
    loop {
        match insert_into_level(ops, txn, cur, level, item)? {
            None => return Ok(()),
            Some((key, ptr)) => {
                level += 1;
                if level == cur.nlevels() {
                    return grow_root(ops, txn, cur, key, ptr);
                }
                item = LevelItem::Child(key, ptr);
            }
        }
    }
}

/// One level-local insert step. Returns the promoted (low key, pointer)
/// pair when the level split.
fn insert_into_level<O: BtreeOps>(
    ops: &mut O,
    txn: &mut Txn<'_>,
    cur: &mut BtCursor<O>,
    level: u16,
    item: LevelItem<O>,
) -> Result<Option<(O::Key, O::Ptr)>> {
    let mut idx = if level == 0 {
        cur.index(0)
    } else {
        // The promoted child goes just after the split child's own slot.
        cur.index(level) + 1
    };

    let (n, inline) = {
        let l = level_ref(cur, level)?;
        (l.buf.node().numrecs(), l.buf.is_inline())
    };
    let cap = if inline {
        ops.inline_max_recs(level)
    } else {
        ops.max_recs(level)
    };

    let mut split_info: Option<(O::Ptr, O::Key, bool)> = None;
    if n >= cap {
        let mut handled = false;
        if inline {
            // Inline area is exhausted; migrate the root to a disk block
            // and retry against the (usually larger) on-disk fanout.
            migrate_inline_root(ops, txn, cur)?;
            handled = n < ops.max_recs(level);
        }
        if !handled {
            let has_parent = level + 1 < cur.nlevels();
            if has_parent && idx < n && rshift(ops, txn, cur, level)? {
                handled = true;
            } else if has_parent && idx > 0 && lshift(ops, txn, cur, level)? {
                idx -= 1;
                handled = true;
            }
        }
        if !handled {
            let (new_ptr, right_low, moved, new_idx) = split(ops, txn, cur, level, idx)?;
            idx = new_idx;
            split_info = Some((new_ptr, right_low, moved));
        }
    }

    {
        let l = level_mut(cur, level)?;
        let node = l.buf.node_mut();
        match item {
            LevelItem::Rec(rec) => node.recs.insert(idx, rec),
            LevelItem::Child(key, ptr) => {
                node.keys.insert(idx, key);
                node.ptrs.insert(idx, ptr);
            }
        }
        l.index = idx;
    }
    write_level(ops, txn, cur, level)?;

    if level == 0 {
        let (right_null, n_now) = {
            let node = level_ref(cur, 0)?.buf.node();
            (node.right.is_null(), node.recs.len())
        };
        if right_null && idx + 1 == n_now {
            let rec = level_ref(cur, 0)?.buf.node().recs.last().cloned();
            ops.update_lastrec(txn, rec.as_ref())?;
        }
    }

    let moved_right = split_info.is_some_and(|(_, _, m)| m);
    if idx == 0 && !moved_right {
        // New low key for an existing child; refresh parent separators.
        updkeys(ops, txn, cur, level)?;
    }

    if let Some((new_ptr, mut right_low, moved)) = split_info {
        if moved && idx == 0 {
            // The new record became the right block's low key.
            right_low = low_key(ops, level_ref(cur, level)?.buf.node())?;
        }
        return Ok(Some((right_low, new_ptr)));
    }
    Ok(None)
}

/// Shift this node's last record into its right sibling (same parent only).
fn rshift<O: BtreeOps>(
    ops: &mut O,
    txn: &mut Txn<'_>,
    cur: &mut BtCursor<O>,
    level: u16,
) -> Result<bool> {
    let pidx = cur.index(level + 1);
    let parent_n = level_ref(cur, level + 1)?.buf.node().numrecs();
    if pidx + 1 >= parent_n {
        return Ok(false);
    }
    let right = level_ref(cur, level)?.buf.node().right;
    if right.is_null() {
        return Ok(false);
    }
    let (rblock, mut rnode) = read_node_at(ops, txn, cur.verify(), right, level)?;
    if rnode.numrecs() >= ops.max_recs(level) {
        return Ok(false);
    }

    {
        let node = level_mut(cur, level)?.buf.node_mut();
        if node.is_leaf() {
            let rec = node
                .recs
                .pop()
                .ok_or_else(|| cursor_err("rshift from empty node"))?;
            rnode.recs.insert(0, rec);
        } else {
            let key = node
                .keys
                .pop()
                .ok_or_else(|| cursor_err("rshift from empty node"))?;
            let ptr = node
                .ptrs
                .pop()
                .ok_or_else(|| cursor_err("rshift from empty node"))?;
            rnode.keys.insert(0, key);
            rnode.ptrs.insert(0, ptr);
        }
    }
    let right_low = low_key(ops, &rnode)?;
    write_level(ops, txn, cur, level)?;
    write_node_block(ops, txn, rblock, &rnode)?;
    {
        let parent = level_mut(cur, level + 1)?.buf.node_mut();
        let slot = parent
            .keys
            .get_mut(pidx + 1)
            .ok_or_else(|| cursor_err("parent key index out of range"))?;
        *slot = right_low;
    }
    write_level(ops, txn, cur, level + 1)?;
    trace!(level, "btree_rshift");
    Ok(true)
}

/// Shift this node's first record into its left sibling (same parent only).
fn lshift<O: BtreeOps>(
    ops: &mut O,
    txn: &mut Txn<'_>,
    cur: &mut BtCursor<O>,
    level: u16,
) -> Result<bool> {
    let pidx = cur.index(level + 1);
    if pidx == 0 {
        return Ok(false);
    }
    let left = level_ref(cur, level)?.buf.node().left;
    if left.is_null() {
        return Ok(false);
    }
    let (lblock, mut lnode) = read_node_at(ops, txn, cur.verify(), left, level)?;
    if lnode.numrecs() >= ops.max_recs(level) {
        return Ok(false);
    }

    {
        let node = level_mut(cur, level)?.buf.node_mut();
        if node.is_leaf() {
            if node.recs.is_empty() {
                return Err(cursor_err("lshift from empty node"));
            }
            let rec = node.recs.remove(0);
            lnode.recs.push(rec);
        } else {
            if node.keys.is_empty() {
                return Err(cursor_err("lshift from empty node"));
            }
            let key = node.keys.remove(0);
            let ptr = node.ptrs.remove(0);
            lnode.keys.push(key);
            lnode.ptrs.push(ptr);
        }
    }
    let our_low = low_key(ops, level_ref(cur, level)?.buf.node())?;
    write_level(ops, txn, cur, level)?;
    write_node_block(ops, txn, lblock, &lnode)?;
    {
        let parent = level_mut(cur, level + 1)?.buf.node_mut();
        let slot = parent
            .keys
            .get_mut(pidx)
            .ok_or_else(|| cursor_err("parent key index out of range"))?;
        *slot = our_low;
    }
    write_level(ops, txn, cur, level + 1)?;
    trace!(level, "btree_lshift");
    Ok(true)
}

/// Split the cursor's node at `level` around its midpoint, tie-broken by
/// the insertion slot `idx` so the new record lands on the emptier side.
///
/// Returns the new right block's pointer and low key, whether the cursor
/// followed the insertion slot into the right block, and the slot index
/// within whichever block the cursor now holds.
fn split<O: BtreeOps>(
    ops: &mut O,
    txn: &mut Txn<'_>,
    cur: &mut BtCursor<O>,
    level: u16,
    idx: usize,
) -> Result<(O::Ptr, O::Key, bool, usize)> {
    let (our_ptr, _our_block) = disk_location(cur, level)?;
    let new_ptr = ops.alloc_block(txn, our_ptr)?;
    let new_block = ops.ptr_to_block(new_ptr)?;

    let keep;
    let mut rnode;
    let old_right;
    {
        let node = level_mut(cur, level)?.buf.node_mut();
        let n = node.numrecs();
        let mut k = n / 2;
        if idx > k {
            k = n - n / 2;
        }
        keep = k;
        rnode = BtNode::new_interior(node.level);
        if node.is_leaf() {
            rnode.recs = node.recs.split_off(keep);
        } else {
            rnode.keys = node.keys.split_off(keep);
            rnode.ptrs = node.ptrs.split_off(keep);
        }
        old_right = node.right;
        node.right = new_ptr;
        rnode.left = our_ptr;
        rnode.right = old_right;
    }

    if !old_right.is_null() {
        let (orblock, mut ornode) = read_node_at(ops, txn, cur.verify(), old_right, level)?;
        ornode.left = new_ptr;
        write_node_block(ops, txn, orblock, &ornode)?;
    }

    let right_low = low_key(ops, &rnode)?;
    write_level(ops, txn, cur, level)?;
    write_node_block(ops, txn, new_block, &rnode)?;

    let moved = idx > keep;
    let new_idx = if moved { idx - keep } else { idx };
    if moved {
        cur.set_buffer(
            level,
            NodeBuf::Disk {
                ptr: new_ptr,
                block: new_block,
                node: rnode,
            },
            new_idx,
        );
    }
    debug!(level, keep, "btree_split");
    Ok((new_ptr, right_low, moved, new_idx))
}

/// Allocate a new root pointing at the old root and its split sibling.
/// This is the only point the tree gains a level.
fn grow_root<O: BtreeOps>(
    ops: &mut O,
    txn: &mut Txn<'_>,
    cur: &mut BtCursor<O>,
    promoted_key: O::Key,
    new_ptr: O::Ptr,
) -> Result<()> {
    let TreeRoot::Block {
        ptr: old_ptr,
        nlevels,
    } = *cur.root()
    else {
        return Err(cursor_err("inline root cannot split"));
    };

    let (_, old_node) = read_node_at(ops, txn, cur.verify(), old_ptr, nlevels - 1)?;
    let left_low = low_key(ops, &old_node)?;

    let root_ptr = ops.alloc_block(txn, old_ptr)?;
    let root_block = ops.ptr_to_block(root_ptr)?;
    let mut root_node = BtNode::new_interior(nlevels);
    root_node.keys = vec![left_low, promoted_key];
    root_node.ptrs = vec![old_ptr, new_ptr];
    write_node_block(ops, txn, root_block, &root_node)?;

    cur.root = TreeRoot::Block {
        ptr: root_ptr,
        nlevels: nlevels + 1,
    };
    ops.set_root(txn, &cur.root)?;

    let top_ptr = cur.buf(nlevels - 1).map(NodeBuf::ptr);
    let index = usize::from(top_ptr == Some(new_ptr));
    cur.levels.push(None);
    cur.set_buffer(
        nlevels,
        NodeBuf::Disk {
            ptr: root_ptr,
            block: root_block,
            node: root_node,
        },
        index,
    );
    debug!(new_nlevels = nlevels + 1, "btree_grow_root");
    Ok(())
}

/// Move a full inline root into a freshly allocated disk block.
fn migrate_inline_root<O: BtreeOps>(
    ops: &mut O,
    txn: &mut Txn<'_>,
    cur: &mut BtCursor<O>,
) -> Result<()> {
    let TreeRoot::Inline { nlevels } = *cur.root() else {
        return Err(cursor_err("root is not inline"));
    };
    let top = nlevels - 1;
    let new_ptr = ops.alloc_block(txn, O::Ptr::NULL)?;
    let new_block = ops.ptr_to_block(new_ptr)?;

    let (node, index) = {
        let l = level_ref(cur, top)?;
        (l.buf.node().clone(), l.index)
    };
    write_node_block(ops, txn, new_block, &node)?;
    cur.set_buffer(
        top,
        NodeBuf::Disk {
            ptr: new_ptr,
            block: new_block,
            node,
        },
        index,
    );
    cur.root = TreeRoot::Block {
        ptr: new_ptr,
        nlevels,
    };
    ops.set_root(txn, &cur.root)?;
    debug!("btree_inline_root_migrated");
    Ok(())
}

// ── Delete ──────────────────────────────────────────────────────────────────

enum DeleteStep {
    Done,
    /// The level freed a block; the parent must drop its pointer to it.
    Cascade,
}

/// Delete the record under the cursor, positioned by a prior [`lookup`]
/// with [`LookupDir::Eq`] returning `true`.
///
/// Runs the bottom-up loop: a level-local delete step reports when a merge
/// freed a block, cascading the pointer removal one level up, until the
/// tree is back within its fanout bounds (possibly losing a level).
pub fn delete<O: BtreeOps>(ops: &mut O, txn: &mut Txn<'_>, cur: &mut BtCursor<O>) -> Result<()> {
    let mut level: u16 = 0;
    loop {
        match delete_from_level(ops, txn, cur, level)? {
            DeleteStep::Done => return Ok(()),
            DeleteStep::Cascade => level += 1,
        }
    }
}

fn delete_from_level<O: BtreeOps>(
    ops: &mut O,
    txn: &mut Txn<'_>,
    cur: &mut BtCursor<O>,
    level: u16,
) -> Result<DeleteStep> {
    let nlevels = cur.nlevels();
    let is_root = level + 1 == nlevels;

    let (idx, n_after, is_leaf, right_null, removed_last);
    {
        let l = level_mut(cur, level)?;
        idx = l.index;
        let node = l.buf.node_mut();
        is_leaf = node.is_leaf();
        let n = node.numrecs();
        if idx >= n {
            return Err(cursor_err("not positioned on a record"));
        }
        if is_leaf {
            node.recs.remove(idx);
        } else {
            node.keys.remove(idx);
            node.ptrs.remove(idx);
        }
        n_after = n - 1;
        right_null = node.right.is_null();
        removed_last = idx == n_after;
    }
    write_level(ops, txn, cur, level)?;

    if level == 0 && right_null && removed_last {
        let last = level_ref(cur, 0)?.buf.node().recs.last().cloned();
        ops.update_lastrec(txn, last.as_ref())?;
    }

    if is_root {
        if !is_leaf && n_after == 1 {
            killroot(ops, txn, cur)?;
        } else if is_leaf && !cur.root().is_inline() {
            let cap = ops.inline_max_recs(0);
            if cap > 0 && n_after <= cap {
                absorb_root_inline(ops, txn, cur)?;
            }
        }
        return Ok(DeleteStep::Done);
    }

    let low_changed = idx == 0;
    if n_after >= ops.min_recs(level) {
        if low_changed {
            updkeys(ops, txn, cur, level)?;
        }
        return Ok(DeleteStep::Done);
    }

    // Under half occupancy: steal one record from a sibling if it has
    // headroom, otherwise merge. Both only within the same parent.
    if steal_right(ops, txn, cur, level)? {
        if low_changed || n_after == 0 {
            updkeys(ops, txn, cur, level)?;
        }
        return Ok(DeleteStep::Done);
    }
    if steal_left(ops, txn, cur, level)? {
        return Ok(DeleteStep::Done);
    }
    merge(ops, txn, cur, level, low_changed)
}

/// Steal the right sibling's first record (O(1), no structural change).
fn steal_right<O: BtreeOps>(
    ops: &mut O,
    txn: &mut Txn<'_>,
    cur: &mut BtCursor<O>,
    level: u16,
) -> Result<bool> {
    let pidx = cur.index(level + 1);
    let parent_n = level_ref(cur, level + 1)?.buf.node().numrecs();
    if pidx + 1 >= parent_n {
        return Ok(false);
    }
    let right = level_ref(cur, level)?.buf.node().right;
    if right.is_null() {
        return Ok(false);
    }
    let (rblock, mut rnode) = read_node_at(ops, txn, cur.verify(), right, level)?;
    if rnode.numrecs() <= ops.min_recs(level) {
        return Ok(false);
    }

    {
        let node = level_mut(cur, level)?.buf.node_mut();
        if node.is_leaf() {
            node.recs.push(rnode.recs.remove(0));
        } else {
            node.keys.push(rnode.keys.remove(0));
            node.ptrs.push(rnode.ptrs.remove(0));
        }
    }
    let right_low = low_key(ops, &rnode)?;
    write_level(ops, txn, cur, level)?;
    write_node_block(ops, txn, rblock, &rnode)?;
    {
        let parent = level_mut(cur, level + 1)?.buf.node_mut();
        let slot = parent
            .keys
            .get_mut(pidx + 1)
            .ok_or_else(|| cursor_err("parent key index out of range"))?;
        *slot = right_low;
    }
    write_level(ops, txn, cur, level + 1)?;
    trace!(level, "btree_steal_right");
    Ok(true)
}

/// Steal the left sibling's last record (O(1), no structural change).
fn steal_left<O: BtreeOps>(
    ops: &mut O,
    txn: &mut Txn<'_>,
    cur: &mut BtCursor<O>,
    level: u16,
) -> Result<bool> {
    let pidx = cur.index(level + 1);
    if pidx == 0 {
        return Ok(false);
    }
    let left = level_ref(cur, level)?.buf.node().left;
    if left.is_null() {
        return Ok(false);
    }
    let (lblock, mut lnode) = read_node_at(ops, txn, cur.verify(), left, level)?;
    if lnode.numrecs() <= ops.min_recs(level) {
        return Ok(false);
    }

    {
        let node = level_mut(cur, level)?.buf.node_mut();
        if node.is_leaf() {
            let rec = lnode
                .recs
                .pop()
                .ok_or_else(|| cursor_err("steal from empty sibling"))?;
            node.recs.insert(0, rec);
        } else {
            let key = lnode
                .keys
                .pop()
                .ok_or_else(|| cursor_err("steal from empty sibling"))?;
            let ptr = lnode
                .ptrs
                .pop()
                .ok_or_else(|| cursor_err("steal from empty sibling"))?;
            node.keys.insert(0, key);
            node.ptrs.insert(0, ptr);
        }
    }
    let our_low = low_key(ops, level_ref(cur, level)?.buf.node())?;
    write_level(ops, txn, cur, level)?;
    write_node_block(ops, txn, lblock, &lnode)?;
    {
        let parent = level_mut(cur, level + 1)?.buf.node_mut();
        let slot = parent
            .keys
            .get_mut(pidx)
            .ok_or_else(|| cursor_err("parent key index out of range"))?;
        *slot = our_low;
    }
    write_level(ops, txn, cur, level + 1)?;

    // The stolen record now precedes the cursor position.
    let cur_idx = cur.index(level);
    cur.set_index(level, cur_idx + 1);
    trace!(level, "btree_steal_left");
    Ok(true)
}

/// Merge with a same-parent sibling, free the emptied block, and report
/// the cascade: the parent must drop its pointer to the freed block.
fn merge<O: BtreeOps>(
    ops: &mut O,
    txn: &mut Txn<'_>,
    cur: &mut BtCursor<O>,
    level: u16,
    low_changed: bool,
) -> Result<DeleteStep> {
    let pidx = cur.index(level + 1);
    let parent_n = level_ref(cur, level + 1)?.buf.node().numrecs();
    let (our_ptr, our_block) = disk_location(cur, level)?;

    if pidx + 1 < parent_n {
        // Absorb the right sibling; parent drops the entry at pidx + 1.
        let right = level_ref(cur, level)?.buf.node().right;
        if right.is_null() {
            return Err(AgfsError::Corruption {
                block: our_block.0,
                detail: "missing right sibling during merge".to_owned(),
            });
        }
        let (_, rnode) = read_node_at(ops, txn, cur.verify(), right, level)?;
        let new_right = rnode.right;
        {
            let node = level_mut(cur, level)?.buf.node_mut();
            if node.is_leaf() {
                node.recs.extend(rnode.recs);
            } else {
                node.keys.extend(rnode.keys);
                node.ptrs.extend(rnode.ptrs);
            }
            node.right = new_right;
        }
        if !new_right.is_null() {
            let (nrblock, mut nrnode) = read_node_at(ops, txn, cur.verify(), new_right, level)?;
            nrnode.left = our_ptr;
            write_node_block(ops, txn, nrblock, &nrnode)?;
        }
        write_level(ops, txn, cur, level)?;
        ops.free_block(txn, right)?;
        if low_changed {
            updkeys(ops, txn, cur, level)?;
        }
        cur.set_index(level + 1, pidx + 1);
        debug!(level, "btree_merge_right");
        return Ok(DeleteStep::Cascade);
    }

    // Rightmost child: fold into the left sibling; parent drops our entry.
    if pidx == 0 {
        return Err(AgfsError::Corruption {
            block: our_block.0,
            detail: "underfull node with no sibling to merge".to_owned(),
        });
    }
    let left = level_ref(cur, level)?.buf.node().left;
    if left.is_null() {
        return Err(AgfsError::Corruption {
            block: our_block.0,
            detail: "missing left sibling during merge".to_owned(),
        });
    }
    let (lblock, mut lnode) = read_node_at(ops, txn, cur.verify(), left, level)?;
    let left_old_n = lnode.numrecs();
    let our_node = level_ref(cur, level)?.buf.node().clone();
    if lnode.is_leaf() {
        lnode.recs.extend(our_node.recs);
    } else {
        lnode.keys.extend(our_node.keys);
        lnode.ptrs.extend(our_node.ptrs);
    }
    lnode.right = our_node.right;
    if !our_node.right.is_null() {
        let (nrblock, mut nrnode) = read_node_at(ops, txn, cur.verify(), our_node.right, level)?;
        nrnode.left = left;
        write_node_block(ops, txn, nrblock, &nrnode)?;
    }
    write_node_block(ops, txn, lblock, &lnode)?;
    ops.free_block(txn, our_ptr)?;

    let idx = cur.index(level);
    cur.set_buffer(
        level,
        NodeBuf::Disk {
            ptr: left,
            block: lblock,
            node: lnode,
        },
        left_old_n + idx,
    );
    cur.set_index(level + 1, pidx);
    debug!(level, "btree_merge_left");
    Ok(DeleteStep::Cascade)
}

/// Move a shrunken root leaf back into the inline area.
fn absorb_root_inline<O: BtreeOps>(
    ops: &mut O,
    txn: &mut Txn<'_>,
    cur: &mut BtCursor<O>,
) -> Result<()> {
    let TreeRoot::Block { ptr, nlevels } = *cur.root() else {
        return Err(cursor_err("root is already inline"));
    };
    let (node, idx) = {
        let l = level_ref(cur, nlevels - 1)?;
        (l.buf.node().clone(), l.index)
    };
    ops.free_block(txn, ptr)?;
    cur.root = TreeRoot::Inline { nlevels };
    ops.store_inline_root(txn, &node)?;
    ops.set_root(txn, &cur.root)?;
    cur.set_buffer(nlevels - 1, NodeBuf::Inline { node }, idx);
    debug!("btree_root_absorbed_inline");
    Ok(())
}

/// Collapse a single-child root: the child becomes the new root (returning
/// to the inline area when the tree kind has one and the child fits).
fn killroot<O: BtreeOps>(ops: &mut O, txn: &mut Txn<'_>, cur: &mut BtCursor<O>) -> Result<()> {
    let TreeRoot::Block {
        ptr: root_ptr,
        nlevels,
    } = *cur.root()
    else {
        return Err(cursor_err("inline root cannot collapse"));
    };
    let top = nlevels - 1;
    let child = child_ptr::<O>(level_ref(cur, top)?.buf.node(), 0)?;
    let (child_block, child_node) = read_node_at(ops, txn, cur.verify(), child, top - 1)?;

    let inline_cap = ops.inline_max_recs(0);
    let idx = cur.index(top - 1);
    if child_node.is_leaf() && inline_cap > 0 && child_node.recs.len() <= inline_cap {
        ops.free_block(txn, child)?;
        ops.free_block(txn, root_ptr)?;
        cur.root = TreeRoot::Inline {
            nlevels: nlevels - 1,
        };
        ops.store_inline_root(txn, &child_node)?;
        cur.levels.pop();
        cur.set_buffer(top - 1, NodeBuf::Inline { node: child_node }, idx);
    } else {
        ops.free_block(txn, root_ptr)?;
        cur.root = TreeRoot::Block {
            ptr: child,
            nlevels: nlevels - 1,
        };
        cur.levels.pop();
        cur.set_buffer(
            top - 1,
            NodeBuf::Disk {
                ptr: child,
                block: child_block,
                node: child_node,
            },
            idx,
        );
    }
    ops.set_root(txn, &cur.root)?;
    debug!(new_nlevels = nlevels - 1, "btree_killroot");
    Ok(())
}

// ── Update ──────────────────────────────────────────────────────────────────

/// Overwrite the record under the cursor. The caller guarantees the new
/// record's key preserves the block's ordering (typically the key is
/// unchanged and only the payload differs).
pub fn update<O: BtreeOps>(
    ops: &mut O,
    txn: &mut Txn<'_>,
    cur: &mut BtCursor<O>,
    rec: O::Rec,
) -> Result<()> {
    let (idx, n, right_null);
    {
        let l = level_mut(cur, 0)?;
        idx = l.index;
        let node = l.buf.node_mut();
        n = node.recs.len();
        right_null = node.right.is_null();
        let slot = node
            .recs
            .get_mut(idx)
            .ok_or_else(|| cursor_err("not positioned on a record"))?;
        *slot = rec;
    }
    write_level(ops, txn, cur, 0)?;
    if idx == 0 {
        updkeys(ops, txn, cur, 0)?;
    }
    if right_null && idx + 1 == n {
        let last = level_ref(cur, 0)?.buf.node().recs.last().cloned();
        ops.update_lastrec(txn, last.as_ref())?;
    }
    Ok(())
}

// ── Tree creation ───────────────────────────────────────────────────────────

/// Serialize an empty tree block at `level` (an empty leaf for a fresh
/// root, level > 0 only for repair tooling).
pub fn init_tree_block<O: BtreeOps + ?Sized>(
    ops: &O,
    block_size: u32,
    level: u16,
) -> Result<Vec<u8>> {
    let node: BtNode<O::Ptr, O::Key, O::Rec> = if level == 0 {
        BtNode::new_leaf()
    } else {
        BtNode::new_interior(level)
    };
    encode_node(ops, &node, block_size as usize)
}

// ── Tests ───────────────────────────────────────────────────────────────────
