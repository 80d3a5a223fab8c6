#![forbid(unsafe_code)]
//! Generic on-disk B+tree engine.
//!
//! One implementation of search, insert, split, rebalance, merge, and tree
//! walk, shared by every tree kind in the filesystem: the per-AG free-space
//! trees (by block number and by extent length), the directory node index,
//! and inline-rooted per-file trees. Tree kinds differ only in their
//! [`BtreeOps`] implementation — record/key codecs, comparator, fanout,
//! block allocation, and root persistence — and in the pointer width they
//! select through [`BtreePtr`].
//!
//! # On-disk block layout
//!
//! Every tree block starts with a header:
//!
//! ```text
//! offset  size  field
//! 0       4     magic (tree kind)
//! 4       2     level (0 = leaf)
//! 6       2     numrecs
//! 8       P     left sibling pointer
//! 8+P     P     right sibling pointer
//! ```
//!
//! where `P` is the pointer width (4 bytes for [`ShortPtr`], 8 for
//! [`LongPtr`]). A leaf body is `numrecs` fixed-size records. An interior
//! body is a fixed-capacity key array (one low key per child) followed by
//! the child pointer array at byte offset `header + max_recs * key_size`.

use agfs_error::{AgfsError, Result};
use agfs_types::{read_le_u16, read_le_u32, read_le_u64, write_le_u16, write_le_u32, write_le_u64, BlockNumber, ParseError};
use std::cmp::Ordering;
use std::fmt;

mod cursor;
mod engine;

pub use cursor::{BtCursor, NodeBuf, RA_LEFT, RA_RIGHT};
pub use engine::{
    decrement, delete, first, increment, init_tree_block, insert, last, lookup, update, LookupDir,
};

// ── Constants ───────────────────────────────────────────────────────────────

/// Maximum tree height the engine will accept from disk.
pub const MAX_TREE_LEVELS: u16 = 9;

/// Fixed portion of the block header (magic + level + numrecs).
const HEADER_FIXED: usize = 8;

/// Full header size for a given pointer width.
#[must_use]
pub fn header_size<P: BtreePtr>() -> usize {
    HEADER_FIXED + 2 * P::SIZE
}

// ── Pointer abstraction ─────────────────────────────────────────────────────

/// A tree-internal block pointer.
///
/// Chosen once at tree-creation time and fixed for the tree's lifetime:
/// [`ShortPtr`] addresses blocks within one allocation group, [`LongPtr`]
/// addresses the whole device. All width-dependent code lives behind this
/// trait; the engine never inspects pointer bytes directly.
pub trait BtreePtr: Copy + Eq + fmt::Debug + 'static {
    /// Encoded width in bytes.
    const SIZE: usize;

    /// The null sentinel (all bits set).
    const NULL: Self;

    fn is_null(self) -> bool {
        self == Self::NULL
    }

    fn to_raw(self) -> u64;

    fn from_raw(raw: u64) -> Self;

    fn read(data: &[u8], offset: usize) -> std::result::Result<Self, ParseError>;

    fn write(self, data: &mut [u8], offset: usize) -> std::result::Result<(), ParseError>;
}

/// AG-relative block pointer (4 bytes on disk).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ShortPtr(pub u32);

impl BtreePtr for ShortPtr {
    const SIZE: usize = 4;
    const NULL: Self = Self(u32::MAX);

    fn to_raw(self) -> u64 {
        u64::from(self.0)
    }

    #[expect(clippy::cast_possible_truncation)]
    fn from_raw(raw: u64) -> Self {
        Self(raw as u32)
    }

    fn read(data: &[u8], offset: usize) -> std::result::Result<Self, ParseError> {
        Ok(Self(read_le_u32(data, offset)?))
    }

    fn write(self, data: &mut [u8], offset: usize) -> std::result::Result<(), ParseError> {
        write_le_u32(data, offset, self.0)
    }
}

/// Device-wide block pointer (8 bytes on disk).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LongPtr(pub u64);

impl BtreePtr for LongPtr {
    const SIZE: usize = 8;
    const NULL: Self = Self(u64::MAX);

    fn to_raw(self) -> u64 {
        self.0
    }

    fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    fn read(data: &[u8], offset: usize) -> std::result::Result<Self, ParseError> {
        Ok(Self(read_le_u64(data, offset)?))
    }

    fn write(self, data: &mut [u8], offset: usize) -> std::result::Result<(), ParseError> {
        write_le_u64(data, offset, self.0)
    }
}

// ── Verification ────────────────────────────────────────────────────────────

/// How much checking every block read performs.
///
/// `Basic` runs unconditionally on production I/O paths; `Full` adds the
/// ordering scan and is what the test suite runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum VerifyLevel {
    /// Parse-only (structural bounds still apply).
    None,
    /// Magic, level, record count bounds, sibling sanity.
    Basic,
    /// `Basic` plus strict key ordering within the block.
    Full,
}

// ── Root location ───────────────────────────────────────────────────────────

/// Where a tree's root lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeRoot<P: BtreePtr> {
    /// Root is a dedicated on-disk block referenced from a fixed location.
    Block { ptr: P, nlevels: u16 },
    /// Root is embedded in the owning object's metadata (inline area).
    ///
    /// Inline roots are always leaves here; once the inline area overflows
    /// the root is migrated to a disk block and stays on disk.
    Inline { nlevels: u16 },
}

impl<P: BtreePtr> TreeRoot<P> {
    #[must_use]
    pub fn nlevels(&self) -> u16 {
        match self {
            Self::Block { nlevels, .. } | Self::Inline { nlevels } => *nlevels,
        }
    }

    #[must_use]
    pub fn is_inline(&self) -> bool {
        matches!(self, Self::Inline { .. })
    }
}

// ── In-memory node ──────────────────────────────────────────────────────────

/// Parsed form of one tree block (or of an inline root).
///
/// Exactly one of `recs` (leaf) or `keys`/`ptrs` (interior) is populated.
/// Interior nodes carry one low key per child, so `keys.len() == ptrs.len()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BtNode<P, K, R> {
    pub level: u16,
    pub left: P,
    pub right: P,
    pub keys: Vec<K>,
    pub ptrs: Vec<P>,
    pub recs: Vec<R>,
}

impl<P: BtreePtr, K, R> BtNode<P, K, R> {
    #[must_use]
    pub fn new_leaf() -> Self {
        Self {
            level: 0,
            left: P::NULL,
            right: P::NULL,
            keys: Vec::new(),
            ptrs: Vec::new(),
            recs: Vec::new(),
        }
    }

    #[must_use]
    pub fn new_interior(level: u16) -> Self {
        Self {
            level,
            left: P::NULL,
            right: P::NULL,
            keys: Vec::new(),
            ptrs: Vec::new(),
            recs: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.level == 0
    }

    /// Record count (records on a leaf, children on an interior node).
    #[must_use]
    pub fn numrecs(&self) -> usize {
        if self.is_leaf() {
            self.recs.len()
        } else {
            self.ptrs.len()
        }
    }
}

// ── Per-tree-kind callbacks ─────────────────────────────────────────────────

/// The per-tree-kind callback set.
///
/// One implementation per tree kind: free-space-by-block, free-space-by-
/// length, directory index, inline extent trees. The engine calls back here
/// for everything it cannot know generically — codecs, comparison, fanout,
/// block allocation within the tree's address space, and persisting the
/// root location when the tree grows or shrinks a level.
pub trait BtreeOps {
    type Ptr: BtreePtr;
    type Key: Copy + fmt::Debug;
    type Rec: Clone + fmt::Debug;

    /// Block magic identifying this tree kind.
    fn magic(&self) -> u32;

    /// Encoded key width in bytes.
    fn key_size(&self) -> usize;

    /// Encoded record width in bytes.
    fn rec_size(&self) -> usize;

    /// Maximum records (leaf) or children (interior) per on-disk block.
    fn max_recs(&self, level: u16) -> usize;

    /// Minimum occupancy for non-root blocks. The default half-capacity
    /// floor guarantees two merging siblings always fit one block.
    fn min_recs(&self, level: u16) -> usize {
        self.max_recs(level) / 2
    }

    /// Capacity of the inline root area, or 0 if this tree kind never has
    /// an inline root.
    fn inline_max_recs(&self, level: u16) -> usize {
        let _ = level;
        0
    }

    /// Three-way key comparison; defines the tree's total order.
    fn cmp_keys(&self, a: &Self::Key, b: &Self::Key) -> Ordering;

    /// Extract the ordering key from a record.
    fn key_of(&self, rec: &Self::Rec) -> Self::Key;

    fn encode_key(&self, key: &Self::Key, out: &mut [u8]) -> Result<()>;
    fn decode_key(&self, data: &[u8]) -> Result<Self::Key>;
    fn encode_rec(&self, rec: &Self::Rec, out: &mut [u8]) -> Result<()>;
    fn decode_rec(&self, data: &[u8]) -> Result<Self::Rec>;

    /// Map a tree pointer to the device block it names.
    fn ptr_to_block(&self, ptr: Self::Ptr) -> Result<BlockNumber>;

    /// Range sanity for sibling/child pointers (within device/AG bounds).
    fn ptr_in_bounds(&self, ptr: Self::Ptr) -> bool;

    /// Allocate a block for a split or root growth. `hint` is the block
    /// being split (for locality); may be null.
    fn alloc_block(&mut self, txn: &mut agfs_block::Txn<'_>, hint: Self::Ptr) -> Result<Self::Ptr>;

    /// Return a block freed by a merge or root collapse.
    fn free_block(&mut self, txn: &mut agfs_block::Txn<'_>, ptr: Self::Ptr) -> Result<()>;

    /// Persist a new root location/level count (AG header field, owning
    /// file metadata, ...). Called whenever the tree gains or loses a level.
    fn set_root(&mut self, txn: &mut agfs_block::Txn<'_>, root: &TreeRoot<Self::Ptr>) -> Result<()>;

    /// Load the inline root node. Only called for [`TreeRoot::Inline`].
    fn load_inline_root(&self) -> Result<BtNode<Self::Ptr, Self::Key, Self::Rec>> {
        Err(AgfsError::Format("tree has no inline root".to_owned()))
    }

    /// Write back the inline root node. Only called for [`TreeRoot::Inline`].
    fn store_inline_root(
        &mut self,
        txn: &mut agfs_block::Txn<'_>,
        node: &BtNode<Self::Ptr, Self::Key, Self::Rec>,
    ) -> Result<()> {
        let _ = (txn, node);
        Err(AgfsError::Format("tree has no inline root".to_owned()))
    }

    /// Hook invoked when the last record of the rightmost leaf changes
    /// (`None` when that leaf became empty). Tree kinds that keep a
    /// denormalized "last record" hint maintain it here.
    fn update_lastrec(
        &mut self,
        txn: &mut agfs_block::Txn<'_>,
        rec: Option<&Self::Rec>,
    ) -> Result<()> {
        let _ = (txn, rec);
        Ok(())
    }
}

// ── Block codec ─────────────────────────────────────────────────────────────

fn parse_err(block: BlockNumber, err: &ParseError) -> AgfsError {
    AgfsError::Corruption {
        block: block.0,
        detail: err.to_string(),
    }
}

fn codec_err(detail: String) -> AgfsError {
    AgfsError::Format(detail)
}

/// Parse and verify one tree block.
///
/// `expected_level` is `Some` when the caller knows which level it is
/// descending into (always, except when reading a root block of unknown
/// height during repair tooling).
pub fn decode_node<O: BtreeOps + ?Sized>(
    ops: &O,
    data: &[u8],
    block: BlockNumber,
    expected_level: Option<u16>,
    verify: VerifyLevel,
) -> Result<BtNode<O::Ptr, O::Key, O::Rec>> {
    let hs = header_size::<O::Ptr>();
    let magic = read_le_u32(data, 0).map_err(|e| parse_err(block, &e))?;
    let level = read_le_u16(data, 4).map_err(|e| parse_err(block, &e))?;
    let numrecs = usize::from(read_le_u16(data, 6).map_err(|e| parse_err(block, &e))?);
    let left = O::Ptr::read(data, HEADER_FIXED).map_err(|e| parse_err(block, &e))?;
    let right = O::Ptr::read(data, HEADER_FIXED + O::Ptr::SIZE).map_err(|e| parse_err(block, &e))?;

    if verify >= VerifyLevel::Basic {
        if magic != ops.magic() {
            return Err(AgfsError::Corruption {
                block: block.0,
                detail: format!("bad magic: expected {:#010x}, got {magic:#010x}", ops.magic()),
            });
        }
        if level >= MAX_TREE_LEVELS {
            return Err(AgfsError::Corruption {
                block: block.0,
                detail: format!("level {level} exceeds maximum {MAX_TREE_LEVELS}"),
            });
        }
        if let Some(expected) = expected_level {
            if level != expected {
                return Err(AgfsError::Corruption {
                    block: block.0,
                    detail: format!("level mismatch: expected {expected}, got {level}"),
                });
            }
        }
        if numrecs > ops.max_recs(level) {
            return Err(AgfsError::Corruption {
                block: block.0,
                detail: format!(
                    "numrecs {numrecs} exceeds max {} at level {level}",
                    ops.max_recs(level)
                ),
            });
        }
        if level > 0 && numrecs == 0 {
            return Err(AgfsError::Corruption {
                block: block.0,
                detail: "interior block with zero children".to_owned(),
            });
        }
        for (name, sib) in [("left", left), ("right", right)] {
            if !sib.is_null() && !ops.ptr_in_bounds(sib) {
                return Err(AgfsError::Corruption {
                    block: block.0,
                    detail: format!("{name} sibling pointer {sib:?} out of bounds"),
                });
            }
        }
    }

    let mut node = BtNode {
        level,
        left,
        right,
        keys: Vec::new(),
        ptrs: Vec::new(),
        recs: Vec::new(),
    };

    if level == 0 {
        let rs = ops.rec_size();
        node.recs.reserve(numrecs);
        for i in 0..numrecs {
            let off = hs + i * rs;
            let slice = data
                .get(off..off + rs)
                .ok_or_else(|| AgfsError::Corruption {
                    block: block.0,
                    detail: format!("record {i} extends past block end"),
                })?;
            node.recs.push(ops.decode_rec(slice)?);
        }
    } else {
        let ks = ops.key_size();
        let ptr_base = hs + ops.max_recs(level) * ks;
        node.keys.reserve(numrecs);
        node.ptrs.reserve(numrecs);
        for i in 0..numrecs {
            let koff = hs + i * ks;
            let kslice = data
                .get(koff..koff + ks)
                .ok_or_else(|| AgfsError::Corruption {
                    block: block.0,
                    detail: format!("key {i} extends past block end"),
                })?;
            node.keys.push(ops.decode_key(kslice)?);
            let poff = ptr_base + i * O::Ptr::SIZE;
            let ptr = O::Ptr::read(data, poff).map_err(|e| parse_err(block, &e))?;
            if verify >= VerifyLevel::Basic {
                if ptr.is_null() || !ops.ptr_in_bounds(ptr) {
                    return Err(AgfsError::Corruption {
                        block: block.0,
                        detail: format!("child pointer {i} ({ptr:?}) invalid"),
                    });
                }
            }
            node.ptrs.push(ptr);
        }
    }

    if verify >= VerifyLevel::Full {
        check_node_order(ops, &node, block)?;
    }

    Ok(node)
}

/// Strict ordering scan over one node's keys.
pub fn check_node_order<O: BtreeOps + ?Sized>(
    ops: &O,
    node: &BtNode<O::Ptr, O::Key, O::Rec>,
    block: BlockNumber,
) -> Result<()> {
    let bad = if node.is_leaf() {
        node.recs
            .windows(2)
            .any(|w| ops.cmp_keys(&ops.key_of(&w[0]), &ops.key_of(&w[1])) != Ordering::Less)
    } else {
        node.keys
            .windows(2)
            .any(|w| ops.cmp_keys(&w[0], &w[1]) != Ordering::Less)
    };
    if bad {
        return Err(AgfsError::Corruption {
            block: block.0,
            detail: format!("keys out of order at level {}", node.level),
        });
    }
    Ok(())
}

/// Serialize a node into a `block_size`-byte image.
pub fn encode_node<O: BtreeOps + ?Sized>(
    ops: &O,
    node: &BtNode<O::Ptr, O::Key, O::Rec>,
    block_size: usize,
) -> Result<Vec<u8>> {
    let hs = header_size::<O::Ptr>();
    let numrecs = node.numrecs();
    let numrecs_u16 =
        u16::try_from(numrecs).map_err(|_| codec_err(format!("numrecs {numrecs} overflows u16")))?;

    let mut buf = vec![0_u8; block_size];
    write_le_u32(&mut buf, 0, ops.magic()).map_err(|e| codec_err(e.to_string()))?;
    write_le_u16(&mut buf, 4, node.level).map_err(|e| codec_err(e.to_string()))?;
    write_le_u16(&mut buf, 6, numrecs_u16).map_err(|e| codec_err(e.to_string()))?;
    node.left
        .write(&mut buf, HEADER_FIXED)
        .map_err(|e| codec_err(e.to_string()))?;
    node.right
        .write(&mut buf, HEADER_FIXED + O::Ptr::SIZE)
        .map_err(|e| codec_err(e.to_string()))?;

    if node.is_leaf() {
        let rs = ops.rec_size();
        for (i, rec) in node.recs.iter().enumerate() {
            let off = hs + i * rs;
            let slot = buf
                .get_mut(off..off + rs)
                .ok_or_else(|| codec_err(format!("record {i} does not fit block")))?;
            ops.encode_rec(rec, slot)?;
        }
    } else {
        if node.keys.len() != node.ptrs.len() {
            return Err(codec_err(format!(
                "interior node key/ptr count mismatch: {} vs {}",
                node.keys.len(),
                node.ptrs.len()
            )));
        }
        let ks = ops.key_size();
        let ptr_base = hs + ops.max_recs(node.level) * ks;
        for (i, key) in node.keys.iter().enumerate() {
            let koff = hs + i * ks;
            let slot = buf
                .get_mut(koff..koff + ks)
                .ok_or_else(|| codec_err(format!("key {i} does not fit block")))?;
            ops.encode_key(key, slot)?;
        }
        for (i, ptr) in node.ptrs.iter().enumerate() {
            let poff = ptr_base + i * O::Ptr::SIZE;
            ptr.write(&mut buf, poff)
                .map_err(|_| codec_err(format!("child pointer {i} does not fit block")))?;
        }
    }

    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Minimal leaf-only ops for exercising the codec in isolation. The
    // engine tests in `engine.rs` cover the full callback surface.
    struct CodecOps;

    impl BtreeOps for CodecOps {
        type Ptr = ShortPtr;
        type Key = u32;
        type Rec = u32;

        fn magic(&self) -> u32 {
            0x4242_4242
        }

        fn key_size(&self) -> usize {
            4
        }

        fn rec_size(&self) -> usize {
            4
        }

        fn max_recs(&self, level: u16) -> usize {
            if level == 0 {
                4
            } else {
                3
            }
        }

        fn cmp_keys(&self, a: &u32, b: &u32) -> Ordering {
            a.cmp(b)
        }

        fn key_of(&self, rec: &u32) -> u32 {
            *rec
        }

        fn encode_key(&self, key: &u32, out: &mut [u8]) -> Result<()> {
            out.copy_from_slice(&key.to_le_bytes());
            Ok(())
        }

        fn decode_key(&self, data: &[u8]) -> Result<u32> {
            Ok(u32::from_le_bytes([data[0], data[1], data[2], data[3]]))
        }

        fn encode_rec(&self, rec: &u32, out: &mut [u8]) -> Result<()> {
            self.encode_key(rec, out)
        }

        fn decode_rec(&self, data: &[u8]) -> Result<u32> {
            self.decode_key(data)
        }

        fn ptr_to_block(&self, ptr: ShortPtr) -> Result<BlockNumber> {
            Ok(BlockNumber(u64::from(ptr.0)))
        }

        fn ptr_in_bounds(&self, ptr: ShortPtr) -> bool {
            ptr.0 < 1000
        }

        fn alloc_block(
            &mut self,
            _txn: &mut agfs_block::Txn<'_>,
            _hint: ShortPtr,
        ) -> Result<ShortPtr> {
            unimplemented!()
        }

        fn free_block(&mut self, _txn: &mut agfs_block::Txn<'_>, _ptr: ShortPtr) -> Result<()> {
            unimplemented!()
        }

        fn set_root(
            &mut self,
            _txn: &mut agfs_block::Txn<'_>,
            _root: &TreeRoot<ShortPtr>,
        ) -> Result<()> {
            unimplemented!()
        }
    }

    #[test]
    fn leaf_node_round_trips() {
        let ops = CodecOps;
        let mut node: BtNode<ShortPtr, u32, u32> = BtNode::new_leaf();
        node.recs = vec![10, 20, 30];
        node.right = ShortPtr(7);

        let bytes = encode_node(&ops, &node, 512).unwrap();
        let back = decode_node(&ops, &bytes, BlockNumber(1), Some(0), VerifyLevel::Full).unwrap();
        assert_eq!(back, node);
    }

    #[test]
    fn interior_node_round_trips() {
        let ops = CodecOps;
        let mut node: BtNode<ShortPtr, u32, u32> = BtNode::new_interior(1);
        node.keys = vec![5, 50];
        node.ptrs = vec![ShortPtr(3), ShortPtr(9)];

        let bytes = encode_node(&ops, &node, 512).unwrap();
        let back = decode_node(&ops, &bytes, BlockNumber(2), Some(1), VerifyLevel::Full).unwrap();
        assert_eq!(back, node);
    }

    #[test]
    fn verification_catches_bad_magic_and_level() {
        let ops = CodecOps;
        let node: BtNode<ShortPtr, u32, u32> = BtNode::new_leaf();
        let mut bytes = encode_node(&ops, &node, 512).unwrap();

        bytes[0] ^= 0xFF;
        let err = decode_node(&ops, &bytes, BlockNumber(3), Some(0), VerifyLevel::Basic)
            .unwrap_err();
        assert!(matches!(err, AgfsError::Corruption { block: 3, .. }));
        bytes[0] ^= 0xFF;

        let err = decode_node(&ops, &bytes, BlockNumber(3), Some(2), VerifyLevel::Basic)
            .unwrap_err();
        assert!(err.to_string().contains("level mismatch"));
    }

    #[test]
    fn verification_catches_out_of_order_keys() {
        let ops = CodecOps;
        let mut node: BtNode<ShortPtr, u32, u32> = BtNode::new_leaf();
        node.recs = vec![30, 10];
        let bytes = encode_node(&ops, &node, 512).unwrap();

        // Basic parsing accepts it; Full ordering scan rejects it.
        assert!(decode_node(&ops, &bytes, BlockNumber(4), Some(0), VerifyLevel::Basic).is_ok());
        let err = decode_node(&ops, &bytes, BlockNumber(4), Some(0), VerifyLevel::Full)
            .unwrap_err();
        assert!(err.to_string().contains("out of order"));
    }

    #[test]
    fn verification_catches_oversize_numrecs() {
        let ops = CodecOps;
        let mut node: BtNode<ShortPtr, u32, u32> = BtNode::new_leaf();
        node.recs = vec![1, 2, 3, 4];
        let mut bytes = encode_node(&ops, &node, 512).unwrap();
        bytes[6] = 9; // numrecs > max_recs(0)
        let err = decode_node(&ops, &bytes, BlockNumber(5), Some(0), VerifyLevel::Basic)
            .unwrap_err();
        assert!(err.to_string().contains("exceeds max"));
    }

    #[test]
    fn null_pointers_are_all_ones() {
        assert!(ShortPtr::NULL.is_null());
        assert!(LongPtr::NULL.is_null());
        assert!(!ShortPtr(0).is_null());
        assert_eq!(ShortPtr::NULL.0, u32::MAX);
        assert_eq!(LongPtr::NULL.0, u64::MAX);
        assert_eq!(header_size::<ShortPtr>(), 16);
        assert_eq!(header_size::<LongPtr>(), 24);
    }
}
