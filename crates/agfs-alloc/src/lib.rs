#![forbid(unsafe_code)]
//! Allocation-group free-space management.
//!
//! Each allocation group tracks its free space in two B+trees sharing one
//! generic engine: one ordered by starting block (`bno`), one ordered by
//! extent length with starting block as tie-break (`cnt`). Every mutation
//! updates both trees inside the caller's transaction so they always
//! describe the same free-space set from two orderings.
//!
//! Block 0 of the group holds the [`AgHeader`]: both tree roots, the free
//! block count, the longest-free-extent hint (maintained by the cnt tree's
//! last-record hook), a small freelist of blocks reserved for tree splits,
//! and per-size-class summary counts.

use agfs_block::Txn;
use agfs_btree::{
    decrement, delete, first, increment, init_tree_block, insert, lookup, BtCursor, BtreeOps,
    BtreePtr, LookupDir, ShortPtr, TreeRoot, VerifyLevel,
};
use agfs_error::{AgfsError, Result};
use agfs_types::{
    read_le_u16, read_le_u32, write_le_u16, write_le_u32, AgBlock, AgNumber, BlockNumber, FsBlock,
};
use std::cmp::Ordering;
use tracing::{debug, trace};

// ── Constants ───────────────────────────────────────────────────────────────

/// AG header magic ("AGFH").
pub const AG_HEADER_MAGIC: u32 = 0x4147_4648;

/// Free-space-by-block tree magic ("ABTB").
const BNO_MAGIC: u32 = 0x4142_5442;

/// Free-space-by-length tree magic ("ABTC").
const CNT_MAGIC: u32 = 0x4142_5443;

/// Freelist capacity in the header.
pub const FREELIST_SLOTS: usize = 16;

/// Refill threshold: a split consumes at most one block per tree level,
/// so four covers both trees through realistic heights.
const FREELIST_MIN: usize = 4;

/// Trim threshold.
const FREELIST_MAX: usize = 12;

/// Power-of-two size classes in the summary (class k counts free extents
/// with `2^k <= len < 2^(k+1)`).
pub const SUMMARY_CLASSES: usize = 32;

/// Blocks reserved at group start: header, two tree roots, initial freelist.
const RESERVED_BLOCKS: u32 = 3 + FREELIST_MIN as u32;

/// Outward steps per direction before a near-block search falls back to
/// best-fit.
const NEAR_SEARCH_STEPS: usize = 8;

// ── Free extent record ──────────────────────────────────────────────────────

/// One free extent: `len` contiguous free blocks starting at AG-relative
/// block `start`. Doubles as both trees' key and record (8 bytes on disk:
/// start then length, little-endian u32 each).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeExtent {
    pub start: AgBlock,
    pub len: u32,
}

impl FreeExtent {
    /// One past the last block (u64: `start + len` may not fit u32).
    #[must_use]
    pub fn end(&self) -> u64 {
        u64::from(self.start.0) + u64::from(self.len)
    }

    /// Summary size class: `floor(log2(len))`.
    #[must_use]
    pub fn size_class(&self) -> usize {
        (31 - self.len.leading_zeros()) as usize
    }
}

// ── AG header ───────────────────────────────────────────────────────────────

/// Parsed allocation-group header (block 0 of the group).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgHeader {
    pub ag: u32,
    /// Group size in blocks.
    pub length: u32,
    pub bno_root: u32,
    pub cnt_root: u32,
    pub bno_levels: u16,
    pub cnt_levels: u16,
    /// Free blocks tracked by the trees (freelist blocks not included).
    pub freeblks: u32,
    /// Length of the longest free extent.
    pub longest: u32,
    pub flcount: u32,
    pub freelist: [u32; FREELIST_SLOTS],
    pub summary: [u32; SUMMARY_CLASSES],
}

impl AgHeader {
    pub fn parse(data: &[u8], block: BlockNumber) -> Result<Self> {
        let corrupt = |detail: String| AgfsError::Corruption {
            block: block.0,
            detail,
        };
        let rd32 = |off| read_le_u32(data, off).map_err(|e| corrupt(e.to_string()));
        let rd16 = |off| read_le_u16(data, off).map_err(|e| corrupt(e.to_string()));

        let magic = rd32(0)?;
        if magic != AG_HEADER_MAGIC {
            return Err(corrupt(format!(
                "bad AG header magic: expected {AG_HEADER_MAGIC:#010x}, got {magic:#010x}"
            )));
        }
        let mut hdr = Self {
            ag: rd32(4)?,
            length: rd32(8)?,
            bno_root: rd32(12)?,
            cnt_root: rd32(16)?,
            bno_levels: rd16(20)?,
            cnt_levels: rd16(22)?,
            freeblks: rd32(24)?,
            longest: rd32(28)?,
            flcount: rd32(32)?,
            freelist: [0; FREELIST_SLOTS],
            summary: [0; SUMMARY_CLASSES],
        };
        for i in 0..FREELIST_SLOTS {
            hdr.freelist[i] = rd32(36 + i * 4)?;
        }
        for i in 0..SUMMARY_CLASSES {
            hdr.summary[i] = rd32(36 + FREELIST_SLOTS * 4 + i * 4)?;
        }

        if hdr.length <= RESERVED_BLOCKS {
            return Err(corrupt(format!("AG length {} too small", hdr.length)));
        }
        if hdr.flcount as usize > FREELIST_SLOTS {
            return Err(corrupt(format!("flcount {} exceeds freelist", hdr.flcount)));
        }
        for (name, root, levels) in [
            ("bno", hdr.bno_root, hdr.bno_levels),
            ("cnt", hdr.cnt_root, hdr.cnt_levels),
        ] {
            if root == 0 || root >= hdr.length {
                return Err(corrupt(format!("{name} root {root} out of bounds")));
            }
            if levels == 0 {
                return Err(corrupt(format!("{name} tree has zero levels")));
            }
        }
        Ok(hdr)
    }

    pub fn serialize(&self, block_size: u32) -> Result<Vec<u8>> {
        let mut buf = vec![0_u8; block_size as usize];
        let err = |e: agfs_types::ParseError| AgfsError::Format(e.to_string());
        write_le_u32(&mut buf, 0, AG_HEADER_MAGIC).map_err(err)?;
        write_le_u32(&mut buf, 4, self.ag).map_err(err)?;
        write_le_u32(&mut buf, 8, self.length).map_err(err)?;
        write_le_u32(&mut buf, 12, self.bno_root).map_err(err)?;
        write_le_u32(&mut buf, 16, self.cnt_root).map_err(err)?;
        write_le_u16(&mut buf, 20, self.bno_levels).map_err(err)?;
        write_le_u16(&mut buf, 22, self.cnt_levels).map_err(err)?;
        write_le_u32(&mut buf, 24, self.freeblks).map_err(err)?;
        write_le_u32(&mut buf, 28, self.longest).map_err(err)?;
        write_le_u32(&mut buf, 32, self.flcount).map_err(err)?;
        for (i, b) in self.freelist.iter().enumerate() {
            write_le_u32(&mut buf, 36 + i * 4, *b).map_err(err)?;
        }
        for (i, c) in self.summary.iter().enumerate() {
            write_le_u32(&mut buf, 36 + FREELIST_SLOTS * 4 + i * 4, *c).map_err(err)?;
        }
        Ok(buf)
    }
}

// ── Per-tree callbacks ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FreeKind {
    /// Ordered by starting block.
    Bno,
    /// Ordered by (length, starting block).
    Cnt,
}

struct FreeOps<'a> {
    hdr: &'a mut AgHeader,
    stranded: &'a mut Vec<u32>,
    ag_start: BlockNumber,
    block_size: u32,
    kind: FreeKind,
}

impl BtreeOps for FreeOps<'_> {
    type Ptr = ShortPtr;
    type Key = FreeExtent;
    type Rec = FreeExtent;

    fn magic(&self) -> u32 {
        match self.kind {
            FreeKind::Bno => BNO_MAGIC,
            FreeKind::Cnt => CNT_MAGIC,
        }
    }

    fn key_size(&self) -> usize {
        8
    }

    fn rec_size(&self) -> usize {
        8
    }

    fn max_recs(&self, level: u16) -> usize {
        let body = self.block_size as usize - agfs_btree::header_size::<ShortPtr>();
        if level == 0 {
            body / self.rec_size()
        } else {
            body / (self.key_size() + ShortPtr::SIZE)
        }
    }

    fn cmp_keys(&self, a: &FreeExtent, b: &FreeExtent) -> Ordering {
        match self.kind {
            FreeKind::Bno => a.start.cmp(&b.start),
            FreeKind::Cnt => (a.len, a.start).cmp(&(b.len, b.start)),
        }
    }

    fn key_of(&self, rec: &FreeExtent) -> FreeExtent {
        *rec
    }

    fn encode_key(&self, key: &FreeExtent, out: &mut [u8]) -> Result<()> {
        out[..4].copy_from_slice(&key.start.0.to_le_bytes());
        out[4..8].copy_from_slice(&key.len.to_le_bytes());
        Ok(())
    }

    fn decode_key(&self, data: &[u8]) -> Result<FreeExtent> {
        let mut s = [0_u8; 4];
        let mut l = [0_u8; 4];
        s.copy_from_slice(&data[..4]);
        l.copy_from_slice(&data[4..8]);
        Ok(FreeExtent {
            start: AgBlock(u32::from_le_bytes(s)),
            len: u32::from_le_bytes(l),
        })
    }

    fn encode_rec(&self, rec: &FreeExtent, out: &mut [u8]) -> Result<()> {
        self.encode_key(rec, out)
    }

    fn decode_rec(&self, data: &[u8]) -> Result<FreeExtent> {
        self.decode_key(data)
    }

    fn ptr_to_block(&self, ptr: ShortPtr) -> Result<BlockNumber> {
        Ok(BlockNumber(self.ag_start.0 + u64::from(ptr.0)))
    }

    fn ptr_in_bounds(&self, ptr: ShortPtr) -> bool {
        ptr.0 >= 1 && ptr.0 < self.hdr.length
    }

    /// Tree blocks come from the header freelist, never from the trees
    /// themselves (that would recurse into the allocation being staged).
    fn alloc_block(&mut self, _txn: &mut Txn<'_>, _hint: ShortPtr) -> Result<ShortPtr> {
        if self.hdr.flcount == 0 {
            return Err(AgfsError::NoSpace);
        }
        self.hdr.flcount -= 1;
        let b = self.hdr.freelist[self.hdr.flcount as usize];
        trace!(block = b, "ag_freelist_pop");
        Ok(ShortPtr(b))
    }

    fn free_block(&mut self, _txn: &mut Txn<'_>, ptr: ShortPtr) -> Result<()> {
        if (self.hdr.flcount as usize) < FREELIST_SLOTS {
            self.hdr.freelist[self.hdr.flcount as usize] = ptr.0;
            self.hdr.flcount += 1;
        } else {
            // Drained back into the trees by the next freelist fixup.
            self.stranded.push(ptr.0);
        }
        trace!(block = ptr.0, "ag_freelist_push");
        Ok(())
    }

    fn set_root(&mut self, _txn: &mut Txn<'_>, root: &TreeRoot<ShortPtr>) -> Result<()> {
        let TreeRoot::Block { ptr, nlevels } = *root else {
            return Err(AgfsError::Format(
                "free-space trees have no inline root".to_owned(),
            ));
        };
        match self.kind {
            FreeKind::Bno => {
                self.hdr.bno_root = ptr.0;
                self.hdr.bno_levels = nlevels;
            }
            FreeKind::Cnt => {
                self.hdr.cnt_root = ptr.0;
                self.hdr.cnt_levels = nlevels;
            }
        }
        Ok(())
    }

    /// The cnt tree's largest record is by definition the longest free
    /// extent; mirror it into the header hint.
    fn update_lastrec(&mut self, _txn: &mut Txn<'_>, rec: Option<&FreeExtent>) -> Result<()> {
        if self.kind == FreeKind::Cnt {
            self.hdr.longest = rec.map_or(0, |r| r.len);
        }
        Ok(())
    }
}

// ── Allocation policies ─────────────────────────────────────────────────────

/// How to choose the extent for an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocPolicy {
    /// Exactly at this block, or fail.
    ExactBno(AgBlock),
    /// As close as possible to this block, expanding the search outward.
    NearBno(AgBlock),
    /// Best fit anywhere: the smallest extent that satisfies the length.
    AnySize,
}

// ── Allocation group ────────────────────────────────────────────────────────

/// One allocation group's free-space state.
///
/// The header is kept in memory across an operation and written back to
/// block 0 once per public call; the trees are mutated through the generic
/// engine inside the caller's transaction, so an abort undoes the whole
/// logical allocation or free.
pub struct AllocGroup {
    ag: AgNumber,
    ag_start: BlockNumber,
    block_size: u32,
    hdr: AgHeader,
    /// Blocks freed while the freelist was full; owed to the trees.
    stranded: Vec<u32>,
}

impl AllocGroup {
    /// Format a fresh group: header, two empty tree roots, a seeded
    /// freelist, and everything after the reserved area as one free extent.
    pub fn init(
        txn: &mut Txn<'_>,
        ag: AgNumber,
        ag_start: BlockNumber,
        length: u32,
        block_size: u32,
    ) -> Result<Self> {
        if length <= RESERVED_BLOCKS {
            return Err(AgfsError::Format(format!(
                "AG length {length} below reserved minimum {RESERVED_BLOCKS}"
            )));
        }
        let mut freelist = [0_u32; FREELIST_SLOTS];
        for (i, slot) in freelist.iter_mut().take(FREELIST_MIN).enumerate() {
            *slot = 3 + u32::try_from(i)
                .map_err(|_| AgfsError::Format("freelist index overflow".to_owned()))?;
        }
        let hdr = AgHeader {
            ag: ag.0,
            length,
            bno_root: 1,
            cnt_root: 2,
            bno_levels: 1,
            cnt_levels: 1,
            freeblks: 0,
            longest: 0,
            flcount: FREELIST_MIN as u32,
            freelist,
            summary: [0; SUMMARY_CLASSES],
        };
        let mut group = Self {
            ag,
            ag_start,
            block_size,
            hdr,
            stranded: Vec::new(),
        };

        for (kind, root) in [(FreeKind::Bno, 1_u64), (FreeKind::Cnt, 2_u64)] {
            let img = {
                let ops = group.ops(kind);
                init_tree_block(&ops, block_size, 0)?
            };
            txn.log_block(BlockNumber(ag_start.0 + root), &img)?;
        }

        group.record_extent(
            txn,
            FreeExtent {
                start: AgBlock(RESERVED_BLOCKS),
                len: length - RESERVED_BLOCKS,
            },
        )?;
        group.write_header(txn)?;
        debug!(ag = ag.0, length, "ag_init");
        Ok(group)
    }

    /// Load an existing group from its header block.
    pub fn load(
        txn: &Txn<'_>,
        ag: AgNumber,
        ag_start: BlockNumber,
        block_size: u32,
    ) -> Result<Self> {
        let buf = txn.read_block(ag_start)?;
        let hdr = AgHeader::parse(buf.as_slice(), ag_start)?;
        Ok(Self {
            ag,
            ag_start,
            block_size,
            hdr,
            stranded: Vec::new(),
        })
    }

    #[must_use]
    pub fn header(&self) -> &AgHeader {
        &self.hdr
    }

    #[must_use]
    pub fn ag(&self) -> AgNumber {
        self.ag
    }

    /// Filesystem-wide address of a block in this group, for long-pointer
    /// consumers above the AG layer.
    #[must_use]
    pub fn fs_block(&self, bno: AgBlock, ag_shift: u32) -> FsBlock {
        FsBlock::from_parts(self.ag, bno, ag_shift)
    }

    /// Allocate `len` contiguous blocks under `policy`. Returns the extent
    /// actually allocated (always exactly `len` long).
    pub fn alloc_extent(
        &mut self,
        txn: &mut Txn<'_>,
        len: u32,
        policy: AllocPolicy,
    ) -> Result<FreeExtent> {
        if len == 0 {
            return Err(AgfsError::Format("zero-length allocation".to_owned()));
        }
        self.fix_freelist(txn)?;
        let got = self.alloc_extent_inner(txn, len, policy)?;
        self.settle(txn)?;
        debug!(
            ag = self.ag.0,
            start = got.start.0,
            len = got.len,
            ?policy,
            "ag_alloc_extent"
        );
        Ok(got)
    }

    /// Return `len` blocks starting at `start` to the free pool, merging
    /// with adjacent free extents.
    pub fn free_extent(&mut self, txn: &mut Txn<'_>, start: AgBlock, len: u32) -> Result<()> {
        if len == 0 {
            return Err(AgfsError::Format("zero-length free".to_owned()));
        }
        self.fix_freelist(txn)?;
        self.free_extent_inner(txn, start.0, len)?;
        self.settle(txn)?;
        debug!(ag = self.ag.0, start = start.0, len, "ag_free_extent");
        Ok(())
    }

    /// Top up or trim the freelist and drain blocks stranded by merges,
    /// then persist the header.
    pub fn fix_freelist(&mut self, txn: &mut Txn<'_>) -> Result<()> {
        let mut budget = 4 * FREELIST_SLOTS;
        loop {
            if budget == 0 {
                return Err(AgfsError::Corruption {
                    block: self.ag_start.0,
                    detail: "freelist fixup did not converge".to_owned(),
                });
            }
            budget -= 1;

            if let Some(b) = self.stranded.pop() {
                self.free_extent_inner(txn, b, 1)?;
            } else if (self.hdr.flcount as usize) < FREELIST_MIN && self.hdr.freeblks > 0 {
                let got = self.alloc_extent_inner(txn, 1, AllocPolicy::AnySize)?;
                self.hdr.freelist[self.hdr.flcount as usize] = got.start.0;
                self.hdr.flcount += 1;
                trace!(ag = self.ag.0, block = got.start.0, "ag_freelist_refill");
            } else if self.hdr.flcount as usize > FREELIST_MAX {
                self.hdr.flcount -= 1;
                let b = self.hdr.freelist[self.hdr.flcount as usize];
                self.free_extent_inner(txn, b, 1)?;
                trace!(ag = self.ag.0, block = b, "ag_freelist_trim");
            } else {
                break;
            }
        }
        self.write_header(txn)
    }

    /// All free extents in ascending block order (repair/inspection).
    pub fn free_extents(&mut self, txn: &Txn<'_>) -> Result<Vec<FreeExtent>> {
        self.scan(txn, FreeKind::Bno)
    }

    // ── internals ──

    fn ops(&mut self, kind: FreeKind) -> FreeOps<'_> {
        FreeOps {
            hdr: &mut self.hdr,
            stranded: &mut self.stranded,
            ag_start: self.ag_start,
            block_size: self.block_size,
            kind,
        }
    }

    fn root_of(&self, kind: FreeKind) -> TreeRoot<ShortPtr> {
        match kind {
            FreeKind::Bno => TreeRoot::Block {
                ptr: ShortPtr(self.hdr.bno_root),
                nlevels: self.hdr.bno_levels,
            },
            FreeKind::Cnt => TreeRoot::Block {
                ptr: ShortPtr(self.hdr.cnt_root),
                nlevels: self.hdr.cnt_levels,
            },
        }
    }

    fn write_header(&self, txn: &mut Txn<'_>) -> Result<()> {
        let img = self.hdr.serialize(self.block_size)?;
        txn.log_block(self.ag_start, &img)
    }

    /// Post-op cleanup: drain stranded blocks and persist the header.
    fn settle(&mut self, txn: &mut Txn<'_>) -> Result<()> {
        while let Some(b) = self.stranded.pop() {
            self.free_extent_inner(txn, b, 1)?;
        }
        self.write_header(txn)
    }

    fn tree_mutate(
        &mut self,
        txn: &mut Txn<'_>,
        kind: FreeKind,
        ext: FreeExtent,
        is_insert: bool,
    ) -> Result<()> {
        let root = self.root_of(kind);
        let mut ops = self.ops(kind);
        let mut cur = BtCursor::new(root, VerifyLevel::Basic);
        let found = lookup(&ops, txn, &mut cur, &ext, LookupDir::Eq)?;
        if is_insert {
            if found {
                return Err(AgfsError::Corruption {
                    block: ops.ptr_to_block(ShortPtr(ext.start.0))?.0,
                    detail: format!("extent {ext:?} already in {kind:?} tree"),
                });
            }
            insert(&mut ops, txn, &mut cur, ext)?;
        } else {
            if !found {
                return Err(AgfsError::Corruption {
                    block: ops.ptr_to_block(ShortPtr(ext.start.0))?.0,
                    detail: format!("extent {ext:?} missing from {kind:?} tree"),
                });
            }
            delete(&mut ops, txn, &mut cur)?;
        }
        Ok(())
    }

    /// Add an extent to both trees and the header accounting.
    fn record_extent(&mut self, txn: &mut Txn<'_>, ext: FreeExtent) -> Result<()> {
        self.tree_mutate(txn, FreeKind::Bno, ext, true)?;
        self.tree_mutate(txn, FreeKind::Cnt, ext, true)?;
        self.hdr.freeblks += ext.len;
        self.hdr.summary[ext.size_class()] += 1;
        Ok(())
    }

    /// Remove an extent from both trees and the header accounting.
    fn erase_extent(&mut self, txn: &mut Txn<'_>, ext: FreeExtent) -> Result<()> {
        self.tree_mutate(txn, FreeKind::Bno, ext, false)?;
        self.tree_mutate(txn, FreeKind::Cnt, ext, false)?;
        self.hdr.freeblks -= ext.len;
        self.hdr.summary[ext.size_class()] -= 1;
        Ok(())
    }

    fn bno_lookup(
        &mut self,
        txn: &Txn<'_>,
        bno: u32,
        dir: LookupDir,
    ) -> Result<Option<FreeExtent>> {
        let root = self.root_of(FreeKind::Bno);
        let ops = self.ops(FreeKind::Bno);
        let mut cur = BtCursor::new(root, VerifyLevel::Basic);
        let key = FreeExtent {
            start: AgBlock(bno),
            len: 0,
        };
        if lookup(&ops, txn, &mut cur, &key, dir)? {
            Ok(cur.current_rec().copied())
        } else {
            Ok(None)
        }
    }

    fn alloc_extent_inner(
        &mut self,
        txn: &mut Txn<'_>,
        len: u32,
        policy: AllocPolicy,
    ) -> Result<FreeExtent> {
        match policy {
            AllocPolicy::ExactBno(bno) => self.alloc_exact(txn, bno.0, len),
            AllocPolicy::NearBno(bno) => self.alloc_near(txn, bno.0, len),
            AllocPolicy::AnySize => self.alloc_best_fit(txn, len),
        }
    }

    fn alloc_exact(&mut self, txn: &mut Txn<'_>, bno: u32, len: u32) -> Result<FreeExtent> {
        let Some(ext) = self.bno_lookup(txn, bno, LookupDir::Le)? else {
            return Err(AgfsError::NoSpace);
        };
        let want_end = u64::from(bno) + u64::from(len);
        if ext.start.0 > bno || ext.end() < want_end {
            return Err(AgfsError::NoSpace);
        }
        self.carve(txn, ext, bno, len)
    }

    fn alloc_best_fit(&mut self, txn: &mut Txn<'_>, len: u32) -> Result<FreeExtent> {
        // Summary fast path: the longest hint bounds every class.
        if self.hdr.longest < len {
            return Err(AgfsError::NoSpace);
        }
        let root = self.root_of(FreeKind::Cnt);
        let ext = {
            let ops = self.ops(FreeKind::Cnt);
            let mut cur = BtCursor::new(root, VerifyLevel::Basic);
            let key = FreeExtent {
                start: AgBlock(0),
                len,
            };
            if !lookup(&ops, txn, &mut cur, &key, LookupDir::Ge)? {
                return Err(AgfsError::NoSpace);
            }
            *cur.current_rec()
                .ok_or_else(|| AgfsError::Format("cnt cursor lost its record".to_owned()))?
        };
        self.carve(txn, ext, ext.start.0, len)
    }

    fn alloc_near(&mut self, txn: &mut Txn<'_>, bno: u32, len: u32) -> Result<FreeExtent> {
        if self.hdr.longest < len {
            return Err(AgfsError::NoSpace);
        }

        // Probe outward from the hint in both directions along the bno
        // tree, keeping the closest extent that fits on each side.
        let mut best: Option<(u64, FreeExtent)> = None;
        let mut consider = |ext: FreeExtent| {
            if ext.len < len {
                return;
            }
            let dist = if ext.end() <= u64::from(bno) {
                u64::from(bno) - (ext.end() - u64::from(len))
            } else if ext.start.0 >= bno {
                u64::from(ext.start.0) - u64::from(bno)
            } else {
                0 // contains the hint
            };
            if best.is_none_or(|(d, _)| dist < d) {
                best = Some((dist, ext));
            }
        };

        {
            let root = self.root_of(FreeKind::Bno);
            let ops = self.ops(FreeKind::Bno);
            let key = FreeExtent {
                start: AgBlock(bno),
                len: 0,
            };

            let mut cur = BtCursor::new(root, VerifyLevel::Basic);
            if lookup(&ops, txn, &mut cur, &key, LookupDir::Le)? {
                for _ in 0..NEAR_SEARCH_STEPS {
                    let Some(rec) = cur.current_rec().copied() else {
                        break;
                    };
                    consider(rec);
                    if !decrement(&ops, txn, &mut cur, 0)? {
                        break;
                    }
                }
            }

            let mut cur = BtCursor::new(root, VerifyLevel::Basic);
            if lookup(&ops, txn, &mut cur, &key, LookupDir::Ge)? {
                for _ in 0..NEAR_SEARCH_STEPS {
                    let Some(rec) = cur.current_rec().copied() else {
                        break;
                    };
                    consider(rec);
                    if !increment(&ops, txn, &mut cur, 0)? {
                        break;
                    }
                }
            }
        }

        let Some((_, ext)) = best else {
            // Nothing suitable within reach of the hint.
            return self.alloc_best_fit(txn, len);
        };

        // Take the end of the extent nearest the hint.
        let at = if ext.end() <= u64::from(bno) {
            u32::try_from(ext.end() - u64::from(len))
                .map_err(|_| AgfsError::Format("extent end overflow".to_owned()))?
        } else if ext.start.0 >= bno {
            ext.start.0
        } else {
            // Contains the hint; allocate at the hint if the tail is long
            // enough, else from the extent start.
            if ext.end() - u64::from(bno) >= u64::from(len) {
                bno
            } else {
                ext.start.0
            }
        };
        self.carve(txn, ext, at, len)
    }

    /// Remove `ext` from both trees and give back the unallocated head and
    /// tail around `[at, at + len)`.
    fn carve(&mut self, txn: &mut Txn<'_>, ext: FreeExtent, at: u32, len: u32) -> Result<FreeExtent> {
        self.erase_extent(txn, ext)?;
        let head = at - ext.start.0;
        if head > 0 {
            self.record_extent(
                txn,
                FreeExtent {
                    start: ext.start,
                    len: head,
                },
            )?;
        }
        let tail = ext.len - head - len;
        if tail > 0 {
            self.record_extent(
                txn,
                FreeExtent {
                    start: AgBlock(at + len),
                    len: tail,
                },
            )?;
        }
        Ok(FreeExtent {
            start: AgBlock(at),
            len,
        })
    }

    fn free_extent_inner(&mut self, txn: &mut Txn<'_>, start: u32, len: u32) -> Result<()> {
        let end = u64::from(start) + u64::from(len);
        if start < 1 || end > u64::from(self.hdr.length) {
            return Err(AgfsError::Format(format!(
                "freed extent ({start}, {len}) outside group of {} blocks",
                self.hdr.length
            )));
        }

        let mut ext = FreeExtent {
            start: AgBlock(start),
            len,
        };

        if let Some(left) = self.bno_lookup(txn, start, LookupDir::Le)? {
            if left.end() > u64::from(start) {
                return Err(AgfsError::Corruption {
                    block: self.ag_start.0 + u64::from(start),
                    detail: format!("double free: ({start}, {len}) overlaps {left:?}"),
                });
            }
            if left.end() == u64::from(start) {
                self.erase_extent(txn, left)?;
                ext = FreeExtent {
                    start: left.start,
                    len: left.len + len,
                };
            }
        }

        if let Some(right) = self.bno_lookup(txn, start, LookupDir::Ge)? {
            if u64::from(right.start.0) < end {
                return Err(AgfsError::Corruption {
                    block: self.ag_start.0 + u64::from(start),
                    detail: format!("double free: ({start}, {len}) overlaps {right:?}"),
                });
            }
            if u64::from(right.start.0) == ext.end() {
                self.erase_extent(txn, right)?;
                ext.len += right.len;
            }
        }

        self.record_extent(txn, ext)
    }

    fn scan(&mut self, txn: &Txn<'_>, kind: FreeKind) -> Result<Vec<FreeExtent>> {
        let root = self.root_of(kind);
        let ops = self.ops(kind);
        let mut cur = BtCursor::new(root, VerifyLevel::Basic);
        let mut out = Vec::new();
        if !first(&ops, txn, &mut cur)? {
            return Ok(out);
        }
        loop {
            out.push(
                *cur.current_rec()
                    .ok_or_else(|| AgfsError::Format("scan cursor lost its record".to_owned()))?,
            );
            if !increment(&ops, txn, &mut cur, 0)? {
                return Ok(out);
            }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use agfs_block::MemBlockDevice;
    use proptest::prelude::*;

    const BS: u32 = 512;

    fn setup_bs(length: u32, bs: u32) -> (MemBlockDevice, AllocGroup) {
        let dev = MemBlockDevice::new(bs, u64::from(length));
        let mut txn = Txn::new(&dev);
        let group = AllocGroup::init(&mut txn, AgNumber(0), BlockNumber(0), length, bs).unwrap();
        txn.commit().unwrap();
        (dev, group)
    }

    fn setup(length: u32) -> (MemBlockDevice, AllocGroup) {
        setup_bs(length, BS)
    }

    /// Cross-check both trees and the header accounting.
    fn check_group(group: &mut AllocGroup, txn: &Txn<'_>) {
        let bno = group.scan(txn, FreeKind::Bno).unwrap();
        let cnt = group.scan(txn, FreeKind::Cnt).unwrap();

        for w in bno.windows(2) {
            assert!(w[0].end() < u64::from(w[1].start.0), "uncoalesced or overlapping: {w:?}");
        }
        let mut cnt_sorted = cnt.clone();
        cnt_sorted.sort_unstable_by_key(|e| e.start);
        let mut bno_sorted = bno.clone();
        bno_sorted.sort_unstable_by_key(|e| e.start);
        assert_eq!(bno_sorted, cnt_sorted, "trees disagree on the free set");

        let total: u64 = bno.iter().map(|e| u64::from(e.len)).sum();
        assert_eq!(u64::from(group.hdr.freeblks), total);
        let longest = bno.iter().map(|e| e.len).max().unwrap_or(0);
        assert_eq!(group.hdr.longest, longest);

        let mut summary = [0_u32; SUMMARY_CLASSES];
        for e in &bno {
            summary[e.size_class()] += 1;
        }
        assert_eq!(group.hdr.summary, summary);
    }

    #[test]
    fn header_round_trips() {
        let (_dev, group) = setup(1000);
        let img = group.hdr.serialize(BS).unwrap();
        let back = AgHeader::parse(&img, BlockNumber(0)).unwrap();
        assert_eq!(back, group.hdr);
    }

    #[test]
    fn header_parse_rejects_bad_magic() {
        let (_dev, group) = setup(1000);
        let mut img = group.hdr.serialize(BS).unwrap();
        img[0] ^= 0xFF;
        let err = AgHeader::parse(&img, BlockNumber(0)).unwrap_err();
        assert!(matches!(err, AgfsError::Corruption { .. }));
    }

    #[test]
    fn allocated_blocks_compose_into_fs_wide_addresses() {
        let (dev, mut group) = setup(1000);
        let mut txn = Txn::new(&dev);
        let got = group
            .alloc_extent(&mut txn, 4, AllocPolicy::AnySize)
            .unwrap();
        let fsb = group.fs_block(got.start, 24);
        assert_eq!(fsb.split(24), (AgNumber(0), got.start));

        let elsewhere = FsBlock::from_parts(AgNumber(3), got.start, 24);
        assert_ne!(elsewhere, fsb);
        assert_eq!(elsewhere.split(24).1, got.start);
    }

    #[test]
    fn init_leaves_one_free_extent() {
        let (dev, mut group) = setup(1000);
        let txn = Txn::new(&dev);
        let exts = group.free_extents(&txn).unwrap();
        assert_eq!(
            exts,
            vec![FreeExtent {
                start: AgBlock(RESERVED_BLOCKS),
                len: 1000 - RESERVED_BLOCKS
            }]
        );
        check_group(&mut group, &txn);
    }

    #[test]
    fn free_then_exact_alloc_leaves_both_trees_empty() {
        // Group sized so the initial free extent is exactly 4096 blocks.
        let length = RESERVED_BLOCKS + 4096;
        let (dev, mut group) = setup(length);
        let mut txn = Txn::new(&dev);

        // Drain the group, then free 4096 contiguous blocks as one extent.
        let got = group
            .alloc_extent(&mut txn, 4096, AllocPolicy::ExactBno(AgBlock(RESERVED_BLOCKS)))
            .unwrap();
        assert_eq!(
            got,
            FreeExtent {
                start: AgBlock(RESERVED_BLOCKS),
                len: 4096
            }
        );
        group
            .free_extent(&mut txn, AgBlock(RESERVED_BLOCKS), 4096)
            .unwrap();
        assert_eq!(group.header().freeblks, 4096);

        // Exact allocation of the whole extent must empty both orderings.
        let got = group
            .alloc_extent(&mut txn, 4096, AllocPolicy::ExactBno(AgBlock(RESERVED_BLOCKS)))
            .unwrap();
        assert_eq!(got.len, 4096);
        assert!(group.scan(&txn, FreeKind::Bno).unwrap().is_empty());
        assert!(group.scan(&txn, FreeKind::Cnt).unwrap().is_empty());
        assert_eq!(group.header().freeblks, 0);
        assert_eq!(group.header().longest, 0);
        txn.commit().unwrap();
    }

    #[test]
    fn exact_alloc_in_the_middle_splits_head_and_tail() {
        let (dev, mut group) = setup(1000);
        let mut txn = Txn::new(&dev);
        let got = group
            .alloc_extent(&mut txn, 10, AllocPolicy::ExactBno(AgBlock(100)))
            .unwrap();
        assert_eq!(
            got,
            FreeExtent {
                start: AgBlock(100),
                len: 10
            }
        );

        let exts = group.free_extents(&txn).unwrap();
        assert_eq!(exts.len(), 2);
        assert_eq!(exts[0].start, AgBlock(RESERVED_BLOCKS));
        assert_eq!(exts[0].end(), 100);
        assert_eq!(exts[1].start, AgBlock(110));
        check_group(&mut group, &txn);
    }

    #[test]
    fn exact_alloc_of_unavailable_range_fails() {
        let (dev, mut group) = setup(1000);
        let mut txn = Txn::new(&dev);
        group
            .alloc_extent(&mut txn, 10, AllocPolicy::ExactBno(AgBlock(100)))
            .unwrap();
        let err = group
            .alloc_extent(&mut txn, 5, AllocPolicy::ExactBno(AgBlock(105)))
            .unwrap_err();
        assert!(matches!(err, AgfsError::NoSpace));
    }

    #[test]
    fn best_fit_picks_smallest_sufficient_extent() {
        let (dev, mut group) = setup(1000);
        let mut txn = Txn::new(&dev);

        // Fragment the group: carve three separated free extents of 3, 8,
        // and 5 blocks out of an otherwise allocated group.
        let whole = group.header().freeblks;
        group
            .alloc_extent(&mut txn, whole, AllocPolicy::AnySize)
            .unwrap();
        group.free_extent(&mut txn, AgBlock(100), 3).unwrap();
        group.free_extent(&mut txn, AgBlock(200), 8).unwrap();
        group.free_extent(&mut txn, AgBlock(300), 5).unwrap();

        let got = group.alloc_extent(&mut txn, 4, AllocPolicy::AnySize).unwrap();
        assert_eq!(
            got,
            FreeExtent {
                start: AgBlock(300),
                len: 4
            }
        );
        check_group(&mut group, &txn);
    }

    #[test]
    fn near_bno_prefers_the_closer_extent() {
        let (dev, mut group) = setup(2000);
        let mut txn = Txn::new(&dev);
        let whole = group.header().freeblks;
        group
            .alloc_extent(&mut txn, whole, AllocPolicy::AnySize)
            .unwrap();
        group.free_extent(&mut txn, AgBlock(100), 20).unwrap();
        group.free_extent(&mut txn, AgBlock(900), 20).unwrap();

        let got = group
            .alloc_extent(&mut txn, 10, AllocPolicy::NearBno(AgBlock(850)))
            .unwrap();
        assert_eq!(got.start, AgBlock(900), "closer extent wins");

        let got = group
            .alloc_extent(&mut txn, 10, AllocPolicy::NearBno(AgBlock(130)))
            .unwrap();
        // Nearest end of the extent left of the hint.
        assert_eq!(
            got,
            FreeExtent {
                start: AgBlock(110),
                len: 10
            }
        );
        check_group(&mut group, &txn);
    }

    #[test]
    fn freeing_adjacent_extents_coalesces_both_sides() {
        let (dev, mut group) = setup(1000);
        let mut txn = Txn::new(&dev);
        let whole = group.header().freeblks;
        group
            .alloc_extent(&mut txn, whole, AllocPolicy::AnySize)
            .unwrap();

        group.free_extent(&mut txn, AgBlock(100), 10).unwrap();
        group.free_extent(&mut txn, AgBlock(120), 10).unwrap();
        assert_eq!(group.free_extents(&txn).unwrap().len(), 2);

        // The gap joins both neighbors into one extent.
        group.free_extent(&mut txn, AgBlock(110), 10).unwrap();
        let exts = group.free_extents(&txn).unwrap();
        assert_eq!(
            exts,
            vec![FreeExtent {
                start: AgBlock(100),
                len: 30
            }]
        );
        check_group(&mut group, &txn);
    }

    #[test]
    fn double_free_is_detected() {
        let (dev, mut group) = setup(1000);
        let mut txn = Txn::new(&dev);
        let err = group.free_extent(&mut txn, AgBlock(500), 10).unwrap_err();
        assert!(matches!(err, AgfsError::Corruption { .. }), "{err}");
    }

    #[test]
    fn freelist_refills_after_splits_consume_it() {
        let (dev, mut group) = setup(4000);
        let mut txn = Txn::new(&dev);

        // Many separated single-block frees force tree growth, which eats
        // freelist blocks; the fixup must keep the list stocked.
        let whole = group.header().freeblks;
        group
            .alloc_extent(&mut txn, whole, AllocPolicy::AnySize)
            .unwrap();
        for i in 0..200 {
            group
                .free_extent(&mut txn, AgBlock(RESERVED_BLOCKS + i * 2), 1)
                .unwrap();
        }
        group.fix_freelist(&mut txn).unwrap();
        assert!(group.header().flcount as usize >= FREELIST_MIN);
        assert!(group.header().bno_levels > 1, "tree should have grown");
        check_group(&mut group, &txn);
        txn.commit().unwrap();

        // Reload from disk and verify the persisted state agrees.
        let txn = Txn::new(&dev);
        let mut reloaded = AllocGroup::load(&txn, AgNumber(0), BlockNumber(0), BS).unwrap();
        assert_eq!(reloaded.header(), group.header());
        check_group(&mut reloaded, &txn);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn random_alloc_free_keeps_trees_consistent(
            steps in proptest::collection::vec((any::<bool>(), 1_u32..40), 1..60),
        ) {
            // 4 KiB blocks keep both trees single-leaf, so the final
            // accounting closes without chasing tree-block usage.
            let (dev, mut group) = setup_bs(3000, 4096);
            let mut txn = Txn::new(&dev);
            let mut held: Vec<FreeExtent> = Vec::new();

            for (do_alloc, len) in steps {
                if do_alloc || held.is_empty() {
                    match group.alloc_extent(&mut txn, len, AllocPolicy::AnySize) {
                        Ok(got) => {
                            prop_assert_eq!(got.len, len);
                            for h in &held {
                                let overlap = u64::from(got.start.0) < h.end()
                                    && u64::from(h.start.0) < got.end();
                                prop_assert!(!overlap, "allocated {:?} overlaps held {:?}", got, h);
                            }
                            held.push(got);
                        }
                        Err(AgfsError::NoSpace) => {}
                        Err(e) => return Err(TestCaseError::fail(e.to_string())),
                    }
                } else {
                    let ext = held.swap_remove(len as usize % held.len());
                    group.free_extent(&mut txn, ext.start, ext.len).unwrap();
                }
                check_group(&mut group, &txn);
            }

            // Free everything and confirm full accounting.
            for ext in held.drain(..) {
                group.free_extent(&mut txn, ext.start, ext.len).unwrap();
            }
            check_group(&mut group, &txn);
            let accounted = u64::from(group.header().freeblks)
                + u64::from(group.header().flcount)
                + 3;
            prop_assert_eq!(accounted, 3000);
        }
    }
}
