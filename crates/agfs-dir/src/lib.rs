#![forbid(unsafe_code)]
//! Directory data structures.
//!
//! One directory's entries live in one of four on-disk shapes, promoted
//! and demoted as the directory grows and shrinks:
//!
//! - `Inline`: entries packed in the owning inode's metadata area.
//! - `Block`: one combined block, entry data from the front and a sorted
//!   (hash, addr) leaf array with a count/stale tail at the back.
//! - `Leaf`: one leaf block (sorted hash array plus a per-data-block
//!   best-free table) over multiple data blocks.
//! - `Node`: a short-pointer index tree over multiple chained leaf blocks,
//!   with the best-free table moved out to dedicated free-index blocks.
//!
//! Every shape transition repacks the surviving entries wholesale inside
//! one transaction. Leaf blocks in `Node` shape rebalance with their own
//! fixed-size-record split, not the generic engine's; the engine only
//! manages the hash index above them.
//!
//! Directory-internal block addresses are logical: data blocks count from
//! zero, leaf blocks from [`LEAF_SEGMENT`], free-index blocks from
//! [`FREE_SEGMENT`], and index tree blocks from [`INDEX_SEGMENT`]. A map
//! from logical to device blocks is kept per directory, fed by the
//! caller's [`DirBlockAlloc`].

use agfs_block::Txn;
use agfs_btree::{
    delete as btree_delete, first, increment, init_tree_block, insert as btree_insert,
    lookup as btree_lookup, BtCursor, BtreeOps, BtreePtr, LookupDir, ShortPtr, TreeRoot,
    VerifyLevel,
};
use agfs_error::{AgfsError, Result};
use agfs_types::{
    name_hash, name_hash_ci, read_le_u16, read_le_u32, read_le_u64, write_le_u16, write_le_u32,
    write_le_u64, BlockNumber, DirHash,
};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::{debug, trace};

// ── Constants ───────────────────────────────────────────────────────────────

/// Combined data+leaf block magic ("ADBK").
const BLOCK_MAGIC: u32 = 0x4144_424B;
/// Pure data block magic ("ADDT").
const DATA_MAGIC: u32 = 0x4144_4454;
/// Leaf block magic ("ADLF").
const LEAF_MAGIC: u32 = 0x4144_4C46;
/// Free-index block magic ("ADFR").
const FREE_MAGIC: u32 = 0x4144_4652;
/// Hash index tree block magic ("ADIX").
const INDEX_MAGIC: u32 = 0x4144_4958;

/// Tombstoned leaf entry address.
pub const NULL_ADDR: u32 = 0xFFFF_FFFF;
/// Null logical block in leaf sibling links.
const NULL_LBLK: u32 = 0xFFFF_FFFF;
/// Unused slot in a best-free table.
const BEST_HOLE: u16 = 0xFFFF;

/// Logical block segments.
const LEAF_SEGMENT: u32 = 0x0080_0000;
const FREE_SEGMENT: u32 = 0x0100_0000;
const INDEX_SEGMENT: u32 = 0x0180_0000;

/// Data region header: magic, then data-end in 8-byte units.
const DATA_HEADER: usize = 8;
/// Leaf block header: magic, count, stale, forw, back.
const LEAF_HEADER: usize = 16;
/// Free-index block header: magic, nvalid, pad.
const FREE_HEADER: usize = 8;
/// Combined-block tail: count, stale.
const BLOCK_TAIL: usize = 4;
/// Data entry header: ino (8), rec_len (2), namelen (1).
const ENTRY_HEADER: usize = 11;
/// Smallest slot worth splitting off as a free span.
const MIN_SLOT: usize = 16;

/// Per-entry bytes in the inline shape: namelen (1) + ino (8) + name.
const INLINE_OVERHEAD: usize = 9;

const fn align8(n: usize) -> usize {
    (n + 7) & !7
}

/// On-disk size of one data entry.
const fn entry_size(name_len: usize) -> usize {
    align8(ENTRY_HEADER + name_len)
}

// ── Configuration ───────────────────────────────────────────────────────────

/// Per-directory-instance format parameters.
#[derive(Debug, Clone, Copy)]
pub struct DirConfig {
    pub block_size: u32,
    /// Bytes available for the inline shape in the owning inode.
    pub inline_capacity: usize,
    /// ASCII-case-insensitive name matching.
    pub case_insensitive: bool,
}

/// Block source for directory blocks. Directory-internal addressing is
/// logical; this trait supplies the physical blocks behind it.
pub trait DirBlockAlloc {
    fn alloc_block(&mut self, txn: &mut Txn<'_>) -> Result<BlockNumber>;
    fn free_block(&mut self, txn: &mut Txn<'_>, block: BlockNumber) -> Result<()>;
}

/// Current on-disk shape of a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirShape {
    Inline,
    Block,
    Leaf,
    Node,
}

// ── Data region ─────────────────────────────────────────────────────────────
//
// The data region of a block holds entries and free spans back to back
// from DATA_HEADER up to a stored data-end offset. Each slot starts with
// the inode number; zero marks a free span of rec_len bytes. All slots are
// 8-byte aligned, so leaf addresses can use 8-byte units.

fn corrupt(block: BlockNumber, detail: String) -> AgfsError {
    AgfsError::Corruption {
        block: block.0,
        detail,
    }
}

fn init_data_region(block_size: u32, magic: u32) -> Result<Vec<u8>> {
    let mut buf = vec![0_u8; block_size as usize];
    let err = |e: agfs_types::ParseError| AgfsError::Format(e.to_string());
    write_le_u32(&mut buf, 0, magic).map_err(err)?;
    write_le_u16(&mut buf, 4, 1).map_err(err)?; // data-end = 8 bytes
    Ok(buf)
}

fn data_end(buf: &[u8], block: BlockNumber) -> Result<usize> {
    let units = read_le_u16(buf, 4).map_err(|e| corrupt(block, e.to_string()))?;
    let end = usize::from(units) * 8;
    if end < DATA_HEADER || end > buf.len() {
        return Err(corrupt(block, format!("data end {end} out of range")));
    }
    Ok(end)
}

fn set_data_end(buf: &mut [u8], end: usize) -> Result<()> {
    let units = u16::try_from(end / 8)
        .map_err(|_| AgfsError::Format("data end exceeds u16 units".to_owned()))?;
    write_le_u16(buf, 4, units).map_err(|e| AgfsError::Format(e.to_string()))
}

struct DataSlot {
    off: usize,
    ino: u64,
    rec_len: usize,
    name: Vec<u8>,
}

fn data_slot_at(buf: &[u8], off: usize, block: BlockNumber) -> Result<DataSlot> {
    let emap = |e: agfs_types::ParseError| corrupt(block, e.to_string());
    let ino = read_le_u64(buf, off).map_err(emap)?;
    let rec_len = usize::from(read_le_u16(buf, off + 8).map_err(emap)?);
    if rec_len < MIN_SLOT || rec_len % 8 != 0 {
        return Err(corrupt(block, format!("bad rec_len {rec_len} at {off}")));
    }
    let name = if ino == 0 {
        Vec::new()
    } else {
        let name_len = usize::from(
            *buf.get(off + 10)
                .ok_or_else(|| corrupt(block, "entry header out of bounds".to_owned()))?,
        );
        if ENTRY_HEADER + name_len > rec_len {
            return Err(corrupt(block, format!("name overflows slot at {off}")));
        }
        buf[off + ENTRY_HEADER..off + ENTRY_HEADER + name_len].to_vec()
    };
    Ok(DataSlot {
        off,
        ino,
        rec_len,
        name,
    })
}

fn data_slots(buf: &[u8], block: BlockNumber) -> Result<Vec<DataSlot>> {
    let end = data_end(buf, block)?;
    let mut out = Vec::new();
    let mut off = DATA_HEADER;
    while off < end {
        let slot = data_slot_at(buf, off, block)?;
        if off + slot.rec_len > end {
            return Err(corrupt(block, format!("slot at {off} overruns data end")));
        }
        off += slot.rec_len;
        out.push(slot);
    }
    Ok(out)
}

fn write_data_entry(
    buf: &mut [u8],
    off: usize,
    ino: u64,
    rec_len: usize,
    name: &[u8],
) -> Result<()> {
    let err = |e: agfs_types::ParseError| AgfsError::Format(e.to_string());
    let name_len = u8::try_from(name.len())
        .map_err(|_| AgfsError::NameTooLong)?;
    write_le_u64(buf, off, ino).map_err(err)?;
    write_le_u16(
        buf,
        off + 8,
        u16::try_from(rec_len).map_err(|_| AgfsError::Format("rec_len exceeds u16".to_owned()))?,
    )
    .map_err(err)?;
    buf[off + 10] = name_len;
    buf[off + ENTRY_HEADER..off + ENTRY_HEADER + name.len()].copy_from_slice(name);
    // Zero slack for deterministic images.
    buf[off + ENTRY_HEADER + name.len()..off + rec_len].fill(0);
    Ok(())
}

/// Place an entry in the region, reusing a free span or growing the data
/// end, but never past `limit`. Returns the entry offset, or `None` when
/// nothing fits.
fn data_add(
    buf: &mut [u8],
    limit: usize,
    ino: u64,
    name: &[u8],
    block: BlockNumber,
) -> Result<Option<usize>> {
    let need = entry_size(name.len());
    let end = data_end(buf, block)?;

    let mut off = DATA_HEADER;
    while off < end {
        let slot = data_slot_at(buf, off, block)?;
        if slot.ino == 0 && slot.rec_len >= need {
            let rest = slot.rec_len - need;
            if rest >= MIN_SLOT {
                write_data_entry(buf, off, ino, need, name)?;
                // Remainder stays a free span.
                write_le_u64(buf, off + need, 0)
                    .map_err(|e| AgfsError::Format(e.to_string()))?;
                write_le_u16(
                    buf,
                    off + need + 8,
                    u16::try_from(rest)
                        .map_err(|_| AgfsError::Format("rec_len exceeds u16".to_owned()))?,
                )
                .map_err(|e| AgfsError::Format(e.to_string()))?;
            } else {
                write_data_entry(buf, off, ino, slot.rec_len, name)?;
            }
            return Ok(Some(off));
        }
        off += slot.rec_len;
    }

    if end + need <= limit {
        write_data_entry(buf, end, ino, need, name)?;
        set_data_end(buf, end + need)?;
        return Ok(Some(end));
    }
    Ok(None)
}

/// Free the slot at `off`, merging runs of free spans and trimming the
/// data end when the tail becomes free.
fn data_remove(buf: &mut [u8], off: usize, block: BlockNumber) -> Result<()> {
    let slot = data_slot_at(buf, off, block)?;
    if slot.ino == 0 {
        return Err(corrupt(block, format!("slot at {off} already free")));
    }
    write_le_u64(buf, off, 0).map_err(|e| AgfsError::Format(e.to_string()))?;

    let mut end = data_end(buf, block)?;
    let mut cursor = DATA_HEADER;
    while cursor < end {
        let s = data_slot_at(buf, cursor, block)?;
        if s.ino != 0 {
            cursor += s.rec_len;
            continue;
        }
        let mut span = s.rec_len;
        while cursor + span < end {
            let next = data_slot_at(buf, cursor + span, block)?;
            if next.ino != 0 {
                break;
            }
            span += next.rec_len;
        }
        if cursor + span == end {
            end = cursor;
            set_data_end(buf, end)?;
            break;
        }
        write_le_u16(
            buf,
            cursor + 8,
            u16::try_from(span).map_err(|_| AgfsError::Format("rec_len exceeds u16".to_owned()))?,
        )
        .map_err(|e| AgfsError::Format(e.to_string()))?;
        cursor += span;
    }
    Ok(())
}

/// Largest insertable entry size in the region, given `limit`.
fn data_best_free(buf: &[u8], limit: usize, block: BlockNumber) -> Result<usize> {
    let end = data_end(buf, block)?;
    let mut best = limit.saturating_sub(end);
    for slot in data_slots(buf, block)? {
        if slot.ino == 0 && slot.rec_len > best {
            best = slot.rec_len;
        }
    }
    Ok(best)
}

fn data_is_empty(buf: &[u8], block: BlockNumber) -> Result<bool> {
    Ok(data_end(buf, block)? == DATA_HEADER)
}

/// Leaf address for an entry: data block in the high part, 8-byte offset
/// units in the low part.
fn make_addr(block_size: u32, lblk: u32, off: usize) -> Result<u32> {
    let units = block_size / 8;
    let off_units =
        u32::try_from(off / 8).map_err(|_| AgfsError::Format("offset overflow".to_owned()))?;
    lblk.checked_mul(units)
        .and_then(|base| base.checked_add(off_units))
        .ok_or_else(|| AgfsError::Format("leaf address overflow".to_owned()))
}

fn split_addr(block_size: u32, addr: u32) -> (u32, usize) {
    let units = block_size / 8;
    (addr / units, (addr % units) as usize * 8)
}

// ── Leaf blocks ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LeafEntry {
    hash: u32,
    addr: u32,
}

/// Parsed leaf block. `bests` is present in the single-leaf format only;
/// node-format leaves keep their best-free data in free-index blocks and
/// use the sibling links instead.
#[derive(Debug, Clone)]
struct LeafImg {
    forw: u32,
    back: u32,
    ents: Vec<LeafEntry>,
    bests: Option<Vec<u16>>,
}

impl LeafImg {
    fn new(bests: bool) -> Self {
        Self {
            forw: NULL_LBLK,
            back: NULL_LBLK,
            ents: Vec::new(),
            bests: bests.then(Vec::new),
        }
    }

    fn parse(buf: &[u8], block: BlockNumber, with_bests: bool) -> Result<Self> {
        let emap = |e: agfs_types::ParseError| corrupt(block, e.to_string());
        let magic = read_le_u32(buf, 0).map_err(emap)?;
        if magic != LEAF_MAGIC {
            return Err(corrupt(block, format!("bad leaf magic {magic:#010x}")));
        }
        let count = usize::from(read_le_u16(buf, 4).map_err(emap)?);
        let stale = usize::from(read_le_u16(buf, 6).map_err(emap)?);
        let forw = read_le_u32(buf, 8).map_err(emap)?;
        let back = read_le_u32(buf, 12).map_err(emap)?;

        let mut ents = Vec::with_capacity(count);
        for i in 0..count {
            let off = LEAF_HEADER + i * 8;
            ents.push(LeafEntry {
                hash: read_le_u32(buf, off).map_err(emap)?,
                addr: read_le_u32(buf, off + 4).map_err(emap)?,
            });
        }
        for w in ents.windows(2) {
            if w[0].hash > w[1].hash {
                return Err(corrupt(block, "leaf hashes out of order".to_owned()));
            }
        }
        let derived = ents.iter().filter(|e| e.addr == NULL_ADDR).count();
        if derived != stale || stale > count {
            return Err(corrupt(
                block,
                format!("stale count {stale} disagrees with entries ({derived}/{count})"),
            ));
        }

        let bests = if with_bests {
            let nbests = usize::from(read_le_u16(buf, buf.len() - 2).map_err(emap)?);
            let base = buf.len() - 2 - nbests * 2;
            if LEAF_HEADER + count * 8 > base {
                return Err(corrupt(block, "leaf entries overlap best table".to_owned()));
            }
            let mut bests = Vec::with_capacity(nbests);
            for i in 0..nbests {
                bests.push(read_le_u16(buf, base + i * 2).map_err(emap)?);
            }
            Some(bests)
        } else {
            None
        };
        Ok(Self {
            forw,
            back,
            ents,
            bests,
        })
    }

    fn serialize(&self, block_size: u32) -> Result<Vec<u8>> {
        let bs = block_size as usize;
        if self.used_bytes() > bs {
            return Err(AgfsError::Format("leaf block overflow".to_owned()));
        }
        let mut buf = vec![0_u8; bs];
        let err = |e: agfs_types::ParseError| AgfsError::Format(e.to_string());
        let u16of = |n: usize| {
            u16::try_from(n).map_err(|_| AgfsError::Format("count exceeds u16".to_owned()))
        };
        write_le_u32(&mut buf, 0, LEAF_MAGIC).map_err(err)?;
        write_le_u16(&mut buf, 4, u16of(self.ents.len())?).map_err(err)?;
        write_le_u16(&mut buf, 6, u16of(self.stale())?).map_err(err)?;
        write_le_u32(&mut buf, 8, self.forw).map_err(err)?;
        write_le_u32(&mut buf, 12, self.back).map_err(err)?;
        for (i, e) in self.ents.iter().enumerate() {
            write_le_u32(&mut buf, LEAF_HEADER + i * 8, e.hash).map_err(err)?;
            write_le_u32(&mut buf, LEAF_HEADER + i * 8 + 4, e.addr).map_err(err)?;
        }
        if let Some(bests) = &self.bests {
            let base = bs - 2 - bests.len() * 2;
            for (i, b) in bests.iter().enumerate() {
                write_le_u16(&mut buf, base + i * 2, *b).map_err(err)?;
            }
            write_le_u16(&mut buf, bs - 2, u16of(bests.len())?).map_err(err)?;
        }
        Ok(buf)
    }

    fn stale(&self) -> usize {
        self.ents.iter().filter(|e| e.addr == NULL_ADDR).count()
    }

    fn used_bytes(&self) -> usize {
        let tail = self.bests.as_ref().map_or(0, |b| 2 + b.len() * 2);
        LEAF_HEADER + self.ents.len() * 8 + tail
    }

    /// Room for one more entry (and `extra_bests` more table slots)?
    fn can_insert(&self, block_size: u32, extra_bests: usize) -> bool {
        self.used_bytes() + 8 + extra_bests * 2 <= block_size as usize
    }

    fn low(&self) -> Option<u32> {
        self.ents.first().map(|e| e.hash)
    }

    /// Insert after any equal-hash run, preserving the relative order of
    /// live and stale entries.
    fn insert(&mut self, hash: u32, addr: u32) {
        let pos = self.ents.partition_point(|e| e.hash <= hash);
        self.ents.insert(pos, LeafEntry { hash, addr });
    }

    /// Drop tombstones. Returns true if anything was reclaimed.
    fn compact(&mut self) -> bool {
        let before = self.ents.len();
        self.ents.retain(|e| e.addr != NULL_ADDR);
        self.ents.len() != before
    }
}

// ── Combined-block tail ─────────────────────────────────────────────────────

fn blk_parse_tail(buf: &[u8], block: BlockNumber) -> Result<Vec<LeafEntry>> {
    let emap = |e: agfs_types::ParseError| corrupt(block, e.to_string());
    let bs = buf.len();
    let count = usize::from(read_le_u16(buf, bs - 4).map_err(emap)?);
    let stale = usize::from(read_le_u16(buf, bs - 2).map_err(emap)?);
    let base = bs - BLOCK_TAIL - count * 8;
    if base < DATA_HEADER {
        return Err(corrupt(block, "leaf tail overlaps data header".to_owned()));
    }
    let mut ents = Vec::with_capacity(count);
    for i in 0..count {
        ents.push(LeafEntry {
            hash: read_le_u32(buf, base + i * 8).map_err(emap)?,
            addr: read_le_u32(buf, base + i * 8 + 4).map_err(emap)?,
        });
    }
    let derived = ents.iter().filter(|e| e.addr == NULL_ADDR).count();
    if derived != stale {
        return Err(corrupt(block, "combined-block stale count mismatch".to_owned()));
    }
    Ok(ents)
}

fn blk_write_tail(buf: &mut [u8], ents: &[LeafEntry], block: BlockNumber) -> Result<()> {
    let err = |e: agfs_types::ParseError| AgfsError::Format(e.to_string());
    let bs = buf.len();
    let base = bs - BLOCK_TAIL - ents.len() * 8;
    if data_end(buf, block)? > base {
        return Err(corrupt(block, "data region collides with leaf tail".to_owned()));
    }
    for (i, e) in ents.iter().enumerate() {
        write_le_u32(buf, base + i * 8, e.hash).map_err(err)?;
        write_le_u32(buf, base + i * 8 + 4, e.addr).map_err(err)?;
    }
    let stale = ents.iter().filter(|e| e.addr == NULL_ADDR).count();
    let u16of =
        |n: usize| u16::try_from(n).map_err(|_| AgfsError::Format("count exceeds u16".to_owned()));
    write_le_u16(buf, bs - 4, u16of(ents.len())?).map_err(err)?;
    write_le_u16(buf, bs - 2, u16of(stale)?).map_err(err)?;
    Ok(())
}

// ── Hash index (node shape) ─────────────────────────────────────────────────

/// Index record: lowest hash of one leaf block, keyed (hash, lblk) so
/// equal-hash runs spanning leaves stay unambiguous.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct IndexRec {
    hash: u32,
    lblk: u32,
}

struct IndexOps<'a, A: DirBlockAlloc> {
    alloc: &'a mut A,
    map: &'a mut BTreeMap<u32, BlockNumber>,
    next_index: &'a mut u32,
    root: &'a mut Option<TreeRoot<ShortPtr>>,
    block_size: u32,
}

impl<A: DirBlockAlloc> BtreeOps for IndexOps<'_, A> {
    type Ptr = ShortPtr;
    type Key = IndexRec;
    type Rec = IndexRec;

    fn magic(&self) -> u32 {
        INDEX_MAGIC
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

    fn cmp_keys(&self, a: &IndexRec, b: &IndexRec) -> Ordering {
        (a.hash, a.lblk).cmp(&(b.hash, b.lblk))
    }

    fn key_of(&self, rec: &IndexRec) -> IndexRec {
        *rec
    }

    fn encode_key(&self, key: &IndexRec, out: &mut [u8]) -> Result<()> {
        out[..4].copy_from_slice(&key.hash.to_le_bytes());
        out[4..8].copy_from_slice(&key.lblk.to_le_bytes());
        Ok(())
    }

    fn decode_key(&self, data: &[u8]) -> Result<IndexRec> {
        let mut h = [0_u8; 4];
        let mut l = [0_u8; 4];
        h.copy_from_slice(&data[..4]);
        l.copy_from_slice(&data[4..8]);
        Ok(IndexRec {
            hash: u32::from_le_bytes(h),
            lblk: u32::from_le_bytes(l),
        })
    }

    fn encode_rec(&self, rec: &IndexRec, out: &mut [u8]) -> Result<()> {
        self.encode_key(rec, out)
    }

    fn decode_rec(&self, data: &[u8]) -> Result<IndexRec> {
        self.decode_key(data)
    }

    fn ptr_to_block(&self, ptr: ShortPtr) -> Result<BlockNumber> {
        self.map.get(&ptr.0).copied().ok_or_else(|| {
            AgfsError::Format(format!("unmapped index block {:#x}", ptr.0))
        })
    }

    fn ptr_in_bounds(&self, ptr: ShortPtr) -> bool {
        ptr.0 >= INDEX_SEGMENT && ptr.0 < INDEX_SEGMENT + LEAF_SEGMENT
    }

    fn alloc_block(&mut self, txn: &mut Txn<'_>, _hint: ShortPtr) -> Result<ShortPtr> {
        let lblk = INDEX_SEGMENT + *self.next_index;
        *self.next_index += 1;
        let dev = self.alloc.alloc_block(txn)?;
        self.map.insert(lblk, dev);
        Ok(ShortPtr(lblk))
    }

    fn free_block(&mut self, txn: &mut Txn<'_>, ptr: ShortPtr) -> Result<()> {
        let dev = self.ptr_to_block(ptr)?;
        self.map.remove(&ptr.0);
        self.alloc.free_block(txn, dev)
    }

    fn set_root(&mut self, _txn: &mut Txn<'_>, root: &TreeRoot<ShortPtr>) -> Result<()> {
        *self.root = Some(*root);
        Ok(())
    }
}

// ── Directory ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct InlineEntry {
    name: Vec<u8>,
    ino: u64,
}

/// Where a found entry lives, for tombstoning on remove.
enum EntryLoc {
    Inline(usize),
    Block(usize),
    Leaf(usize),
    Node { lblk: u32, idx: usize },
}

enum AddOutcome {
    Done,
    /// The current shape cannot absorb the entry; promote and retry.
    Full,
}

enum NameMatch {
    Exact,
    CaseOnly,
    Different,
}

fn match_name(ci: bool, stored: &[u8], query: &[u8]) -> NameMatch {
    if stored == query {
        NameMatch::Exact
    } else if ci && stored.eq_ignore_ascii_case(query) {
        NameMatch::CaseOnly
    } else {
        NameMatch::Different
    }
}

/// One directory's entry store across the four shapes.
///
/// The struct holds the directory's volatile state (shape, the logical to
/// device block map, the index root); the caller persists it alongside the
/// owning inode. All block mutations go through the supplied transaction.
pub struct Directory<A: DirBlockAlloc> {
    cfg: DirConfig,
    alloc: A,
    shape: DirShape,
    inline: Vec<InlineEntry>,
    map: BTreeMap<u32, BlockNumber>,
    next_data: u32,
    next_leaf: u32,
    next_free: u32,
    next_index: u32,
    index_root: Option<TreeRoot<ShortPtr>>,
}

impl<A: DirBlockAlloc> Directory<A> {
    #[must_use]
    pub fn new(cfg: DirConfig, alloc: A) -> Self {
        Self {
            cfg,
            alloc,
            shape: DirShape::Inline,
            inline: Vec::new(),
            map: BTreeMap::new(),
            next_data: 0,
            next_leaf: 0,
            next_free: 0,
            next_index: 0,
            index_root: None,
        }
    }

    #[must_use]
    pub fn shape(&self) -> DirShape {
        self.shape
    }

    #[must_use]
    pub fn config(&self) -> &DirConfig {
        &self.cfg
    }

    /// Name hash under this directory's comparator configuration.
    #[must_use]
    pub fn hash_of(&self, name: &[u8]) -> DirHash {
        if self.cfg.case_insensitive {
            name_hash_ci(name)
        } else {
            name_hash(name)
        }
    }

    /// Look a name up. Case-insensitive instances accept case variants,
    /// preferring an exact match over a case-only one.
    pub fn lookup(&mut self, txn: &Txn<'_>, name: &[u8]) -> Result<Option<u64>> {
        Ok(self.find(txn, name)?.map(|(_, ino)| ino))
    }

    /// Add an entry. Fails with `Exists` for a duplicate name (case
    /// variants count as duplicates when configured case-insensitive).
    pub fn add(&mut self, txn: &mut Txn<'_>, name: &[u8], ino: u64) -> Result<()> {
        validate_name(name)?;
        if self.find(txn, name)?.is_some() {
            return Err(AgfsError::Exists);
        }
        loop {
            match self.try_add(txn, name, ino)? {
                AddOutcome::Done => break,
                AddOutcome::Full => self.promote(txn)?,
            }
        }
        trace!(name = %String::from_utf8_lossy(name), ino, shape = ?self.shape, "dir_add");
        Ok(())
    }

    /// Remove an entry, then demote the shape as far as the survivors fit.
    pub fn remove(&mut self, txn: &mut Txn<'_>, name: &[u8]) -> Result<()> {
        validate_name(name)?;
        let Some((loc, _)) = self.find(txn, name)? else {
            return Err(AgfsError::NotFound(
                String::from_utf8_lossy(name).into_owned(),
            ));
        };
        match loc {
            EntryLoc::Inline(idx) => {
                self.inline.remove(idx);
            }
            EntryLoc::Block(idx) => self.block_remove(txn, idx)?,
            EntryLoc::Leaf(idx) => self.leaf_remove(txn, idx)?,
            EntryLoc::Node { lblk, idx } => self.node_remove(txn, lblk, idx)?,
        }
        self.maybe_demote(txn)?;
        trace!(name = %String::from_utf8_lossy(name), shape = ?self.shape, "dir_remove");
        Ok(())
    }

    /// All live entries as (name, ino) pairs, in storage order.
    pub fn entries(&self, txn: &Txn<'_>) -> Result<Vec<(Vec<u8>, u64)>> {
        self.collect_live(txn)
    }

    // ── logical block plumbing ──

    fn dev_block(&self, lblk: u32) -> Result<BlockNumber> {
        self.map
            .get(&lblk)
            .copied()
            .ok_or_else(|| AgfsError::Format(format!("unmapped directory block {lblk:#x}")))
    }

    fn alloc_dirblock(&mut self, txn: &mut Txn<'_>, lblk: u32) -> Result<BlockNumber> {
        let dev = self.alloc.alloc_block(txn)?;
        self.map.insert(lblk, dev);
        Ok(dev)
    }

    fn free_dirblock(&mut self, txn: &mut Txn<'_>, lblk: u32) -> Result<()> {
        let dev = self.dev_block(lblk)?;
        self.map.remove(&lblk);
        self.alloc.free_block(txn, dev)
    }

    fn read_data_entry(&self, txn: &Txn<'_>, addr: u32) -> Result<(u64, Vec<u8>)> {
        let (dlblk, off) = split_addr(self.cfg.block_size, addr);
        let dev = self.dev_block(dlblk)?;
        let buf = txn.read_block(dev)?;
        let slot = data_slot_at(buf.as_slice(), off, dev)?;
        if slot.ino == 0 {
            return Err(corrupt(dev, format!("leaf address {addr:#x} points at a free slot")));
        }
        Ok((slot.ino, slot.name))
    }

    // ── find ──

    fn find(&mut self, txn: &Txn<'_>, name: &[u8]) -> Result<Option<(EntryLoc, u64)>> {
        let ci = self.cfg.case_insensitive;
        if self.shape == DirShape::Inline {
            let mut fallback = None;
            for (idx, e) in self.inline.iter().enumerate() {
                match match_name(ci, &e.name, name) {
                    NameMatch::Exact => return Ok(Some((EntryLoc::Inline(idx), e.ino))),
                    NameMatch::CaseOnly => {
                        fallback.get_or_insert((EntryLoc::Inline(idx), e.ino));
                    }
                    NameMatch::Different => {}
                }
            }
            return Ok(fallback);
        }

        let hash = self.hash_of(name).0;
        match self.shape {
            DirShape::Inline => Ok(None),
            DirShape::Block => {
                let buf = txn.read_block(self.dev_block(0)?)?;
                let ents = blk_parse_tail(buf.as_slice(), self.dev_block(0)?)?;
                Ok(self
                    .scan_run(txn, &ents, hash, name)?
                    .map(|(idx, ino, _)| (EntryLoc::Block(idx), ino)))
            }
            DirShape::Leaf => {
                let img = self.read_leaf(txn, LEAF_SEGMENT, true)?;
                Ok(self
                    .scan_run(txn, &img.ents, hash, name)?
                    .map(|(idx, ino, _)| (EntryLoc::Leaf(idx), ino)))
            }
            DirShape::Node => self.node_find(txn, hash, name),
        }
    }

    /// Scan the equal-hash run in a sorted entry array. Returns the index,
    /// inode, and whether the match was exact.
    fn scan_run(
        &self,
        txn: &Txn<'_>,
        ents: &[LeafEntry],
        hash: u32,
        name: &[u8],
    ) -> Result<Option<(usize, u64, bool)>> {
        let ci = self.cfg.case_insensitive;
        let mut fallback = None;
        let mut i = ents.partition_point(|e| e.hash < hash);
        while i < ents.len() && ents[i].hash == hash {
            if ents[i].addr != NULL_ADDR {
                let (ino, stored) = self.read_data_entry(txn, ents[i].addr)?;
                match match_name(ci, &stored, name) {
                    NameMatch::Exact => return Ok(Some((i, ino, true))),
                    NameMatch::CaseOnly => {
                        fallback.get_or_insert((i, ino, false));
                    }
                    NameMatch::Different => {}
                }
            }
            i += 1;
        }
        Ok(fallback)
    }

    fn node_find(
        &mut self,
        txn: &Txn<'_>,
        hash: u32,
        name: &[u8],
    ) -> Result<Option<(EntryLoc, u64)>> {
        // Start at the last leaf whose low hash is strictly below the
        // target; equal-hash runs can only extend rightward from there.
        let start = match self.index_lookup(txn, IndexRec { hash, lblk: 0 }, LookupDir::Le)? {
            Some(rec) => rec.lblk,
            None => match self.index_first(txn)? {
                Some(rec) => rec.lblk,
                None => return Ok(None),
            },
        };
        let mut lblk = start;
        let mut fallback = None;
        loop {
            let img = self.read_leaf(txn, lblk, false)?;
            if let Some((idx, ino, exact)) = self.scan_run(txn, &img.ents, hash, name)? {
                if exact {
                    return Ok(Some((EntryLoc::Node { lblk, idx }, ino)));
                }
                fallback.get_or_insert((EntryLoc::Node { lblk, idx }, ino));
            }
            // The run ends inside this leaf once a larger hash appears.
            if img.ents.last().is_some_and(|e| e.hash > hash) || img.forw == NULL_LBLK {
                return Ok(fallback);
            }
            lblk = img.forw;
        }
    }

    // ── shape transitions ──

    fn promote(&mut self, txn: &mut Txn<'_>) -> Result<()> {
        let to = match self.shape {
            DirShape::Inline => DirShape::Block,
            DirShape::Block => DirShape::Leaf,
            DirShape::Leaf => DirShape::Node,
            DirShape::Node => {
                return Err(AgfsError::Format(
                    "node-shape directory reported itself full".to_owned(),
                ));
            }
        };
        let entries = self.collect_live(txn)?;
        self.rebuild(txn, to, entries)
    }

    fn maybe_demote(&mut self, txn: &mut Txn<'_>) -> Result<()> {
        loop {
            let entries = self.collect_live(txn)?;
            let to = match self.shape {
                DirShape::Node => {
                    if !self.node_collapsible(txn, &entries)? {
                        return Ok(());
                    }
                    DirShape::Leaf
                }
                DirShape::Leaf => {
                    if !self.fits_block(&entries) {
                        return Ok(());
                    }
                    DirShape::Block
                }
                DirShape::Block => {
                    if !self.fits_inline(&entries) {
                        return Ok(());
                    }
                    DirShape::Inline
                }
                DirShape::Inline => return Ok(()),
            };
            self.rebuild(txn, to, entries)?;
        }
    }

    fn rebuild(
        &mut self,
        txn: &mut Txn<'_>,
        to: DirShape,
        entries: Vec<(Vec<u8>, u64)>,
    ) -> Result<()> {
        let from = self.shape;
        debug!(?from, ?to, entries = entries.len(), "dir_convert");
        self.release_all(txn)?;
        match to {
            DirShape::Inline => {
                self.inline = entries
                    .into_iter()
                    .map(|(name, ino)| InlineEntry { name, ino })
                    .collect();
            }
            DirShape::Block => self.build_block(txn, &entries)?,
            DirShape::Leaf => self.build_leaf(txn, &entries)?,
            DirShape::Node => self.build_node(txn, &entries)?,
        }
        self.shape = to;
        Ok(())
    }

    fn release_all(&mut self, txn: &mut Txn<'_>) -> Result<()> {
        let blocks: Vec<BlockNumber> = self.map.values().copied().collect();
        self.map.clear();
        for dev in blocks {
            self.alloc.free_block(txn, dev)?;
        }
        self.inline.clear();
        self.next_data = 0;
        self.next_leaf = 0;
        self.next_free = 0;
        self.next_index = 0;
        self.index_root = None;
        Ok(())
    }

    fn collect_live(&self, txn: &Txn<'_>) -> Result<Vec<(Vec<u8>, u64)>> {
        if self.shape == DirShape::Inline {
            return Ok(self
                .inline
                .iter()
                .map(|e| (e.name.clone(), e.ino))
                .collect());
        }
        let mut out = Vec::new();
        for (&lblk, &dev) in &self.map {
            if lblk >= LEAF_SEGMENT {
                continue;
            }
            let buf = txn.read_block(dev)?;
            for slot in data_slots(buf.as_slice(), dev)? {
                if slot.ino != 0 {
                    out.push((slot.name, slot.ino));
                }
            }
        }
        Ok(out)
    }

    fn inline_used(&self) -> usize {
        self.inline
            .iter()
            .map(|e| INLINE_OVERHEAD + e.name.len())
            .sum()
    }

    fn fits_inline(&self, entries: &[(Vec<u8>, u64)]) -> bool {
        entries
            .iter()
            .map(|(n, _)| INLINE_OVERHEAD + n.len())
            .sum::<usize>()
            <= self.cfg.inline_capacity
    }

    fn fits_block(&self, entries: &[(Vec<u8>, u64)]) -> bool {
        let data: usize = entries.iter().map(|(n, _)| entry_size(n.len())).sum();
        DATA_HEADER + data + entries.len() * 8 + BLOCK_TAIL <= self.cfg.block_size as usize
    }

    /// Greedy first-fit packing, mirroring `build_leaf`.
    fn packed_data_blocks(&self, entries: &[(Vec<u8>, u64)]) -> usize {
        let cap = self.cfg.block_size as usize - DATA_HEADER;
        let mut blocks = 0;
        let mut used = cap; // force a first block
        for (name, _) in entries {
            let need = entry_size(name.len());
            if used + need > cap {
                blocks += 1;
                used = 0;
            }
            used += need;
        }
        blocks
    }

    fn node_collapsible(&mut self, txn: &Txn<'_>, entries: &[(Vec<u8>, u64)]) -> Result<bool> {
        if self.index_count(txn)? > 1 {
            return Ok(false);
        }
        let ndata = self.packed_data_blocks(entries);
        Ok(LEAF_HEADER + entries.len() * 8 + 2 + ndata * 2 <= self.cfg.block_size as usize)
    }

    // ── builders ──

    fn build_block(&mut self, txn: &mut Txn<'_>, entries: &[(Vec<u8>, u64)]) -> Result<()> {
        let bs = self.cfg.block_size;
        let dev = self.alloc_dirblock(txn, 0)?;
        let mut buf = init_data_region(bs, BLOCK_MAGIC)?;
        let limit = bs as usize - BLOCK_TAIL - entries.len() * 8;
        let mut ents = Vec::with_capacity(entries.len());
        for (name, ino) in entries {
            let off = data_add(&mut buf, limit, *ino, name, dev)?
                .ok_or_else(|| AgfsError::Format("combined block overflow on rebuild".to_owned()))?;
            ents.push(LeafEntry {
                hash: self.hash_of(name).0,
                addr: make_addr(bs, 0, off)?,
            });
        }
        ents.sort_unstable_by_key(|e| (e.hash, e.addr));
        blk_write_tail(&mut buf, &ents, dev)?;
        txn.log_block(dev, &buf)?;
        self.next_data = 1;
        Ok(())
    }

    /// Pack entries into fresh data blocks first-fit, returning the sorted
    /// leaf entries and the per-block best-free table.
    fn pack_data(
        &mut self,
        txn: &mut Txn<'_>,
        entries: &[(Vec<u8>, u64)],
    ) -> Result<(Vec<LeafEntry>, Vec<u16>)> {
        let bs = self.cfg.block_size;
        let mut ents = Vec::with_capacity(entries.len());
        let mut bests: Vec<u16> = Vec::new();
        let mut open: Option<(u32, BlockNumber, Vec<u8>)> = None;

        for (name, ino) in entries {
            let need = entry_size(name.len());
            let fits = open
                .as_ref()
                .map(|(_, dev, buf)| {
                    data_best_free(buf, bs as usize, *dev).map(|b| b >= need)
                })
                .transpose()?
                .unwrap_or(false);
            if !fits {
                if let Some((_, dev, buf)) = open.take() {
                    bests.push(best_of(&buf, bs, dev)?);
                    txn.log_block(dev, &buf)?;
                }
                let lblk = self.next_data;
                self.next_data += 1;
                let dev = self.alloc_dirblock(txn, lblk)?;
                open = Some((lblk, dev, init_data_region(bs, DATA_MAGIC)?));
            }
            let (lblk, dev, buf) = open
                .as_mut()
                .ok_or_else(|| AgfsError::Format("no open data block".to_owned()))?;
            let off = data_add(buf, bs as usize, *ino, name, *dev)?
                .ok_or_else(|| AgfsError::Format("data block overflow on rebuild".to_owned()))?;
            ents.push(LeafEntry {
                hash: self.hash_of(name).0,
                addr: make_addr(bs, *lblk, off)?,
            });
        }
        if let Some((_, dev, buf)) = open.take() {
            bests.push(best_of(&buf, bs, dev)?);
            txn.log_block(dev, &buf)?;
        }
        ents.sort_unstable_by_key(|e| (e.hash, e.addr));
        Ok((ents, bests))
    }

    fn build_leaf(&mut self, txn: &mut Txn<'_>, entries: &[(Vec<u8>, u64)]) -> Result<()> {
        let (ents, bests) = self.pack_data(txn, entries)?;
        let mut img = LeafImg::new(true);
        img.ents = ents;
        img.bests = Some(bests);
        self.alloc_dirblock(txn, LEAF_SEGMENT)?;
        self.write_leaf(txn, LEAF_SEGMENT, &img)?;
        self.next_leaf = 1;
        Ok(())
    }

    fn build_node(&mut self, txn: &mut Txn<'_>, entries: &[(Vec<u8>, u64)]) -> Result<()> {
        let bs = self.cfg.block_size;
        let (ents, bests) = self.pack_data(txn, entries)?;
        for (i, best) in bests.iter().enumerate() {
            let lblk =
                u32::try_from(i).map_err(|_| AgfsError::Format("data block overflow".to_owned()))?;
            self.node_set_best(txn, lblk, *best)?;
        }

        // Chunk the sorted array into leaves at two-thirds fill so early
        // inserts do not immediately split.
        let cap = (bs as usize - LEAF_HEADER) / 8;
        let chunk = (cap * 2 / 3).max(1);
        let mut leaves: Vec<LeafImg> = Vec::new();
        for piece in ents.chunks(chunk) {
            let mut img = LeafImg::new(false);
            img.ents = piece.to_vec();
            leaves.push(img);
        }
        if leaves.is_empty() {
            leaves.push(LeafImg::new(false));
        }
        let nleaves = u32::try_from(leaves.len())
            .map_err(|_| AgfsError::Format("leaf count overflow".to_owned()))?;
        for i in 0..nleaves {
            let lblk = LEAF_SEGMENT + i;
            self.alloc_dirblock(txn, lblk)?;
            let img = &mut leaves[i as usize];
            img.back = if i == 0 { NULL_LBLK } else { LEAF_SEGMENT + i - 1 };
            img.forw = if i + 1 == nleaves {
                NULL_LBLK
            } else {
                LEAF_SEGMENT + i + 1
            };
        }
        for (i, img) in leaves.iter().enumerate() {
            self.write_leaf(txn, LEAF_SEGMENT + i as u32, img)?;
        }
        self.next_leaf = nleaves;

        // Index: one record per leaf keyed by its low hash.
        {
            let bs = self.cfg.block_size;
            let mut ops = self.index_ops();
            let ptr = ops.alloc_block(txn, ShortPtr::NULL)?;
            let img = init_tree_block(&ops, bs, 0)?;
            txn.log_block(ops.ptr_to_block(ptr)?, &img)?;
            ops.set_root(txn, &TreeRoot::Block { ptr, nlevels: 1 })?;
        }
        for (i, img) in leaves.iter().enumerate() {
            let rec = IndexRec {
                hash: img.low().unwrap_or(0),
                lblk: LEAF_SEGMENT + i as u32,
            };
            self.index_insert(txn, rec)?;
        }
        Ok(())
    }

    // ── leaf block I/O ──

    fn read_leaf(&self, txn: &Txn<'_>, lblk: u32, with_bests: bool) -> Result<LeafImg> {
        let dev = self.dev_block(lblk)?;
        let buf = txn.read_block(dev)?;
        LeafImg::parse(buf.as_slice(), dev, with_bests)
    }

    fn write_leaf(&self, txn: &mut Txn<'_>, lblk: u32, img: &LeafImg) -> Result<()> {
        let dev = self.dev_block(lblk)?;
        txn.log_block(dev, &img.serialize(self.cfg.block_size)?)
    }

    // ── inline / block shape ──

    fn try_add(&mut self, txn: &mut Txn<'_>, name: &[u8], ino: u64) -> Result<AddOutcome> {
        match self.shape {
            DirShape::Inline => {
                if self.inline_used() + INLINE_OVERHEAD + name.len() > self.cfg.inline_capacity {
                    return Ok(AddOutcome::Full);
                }
                self.inline.push(InlineEntry {
                    name: name.to_vec(),
                    ino,
                });
                Ok(AddOutcome::Done)
            }
            DirShape::Block => self.block_add(txn, name, ino),
            DirShape::Leaf => self.leaf_add(txn, name, ino),
            DirShape::Node => {
                self.node_add(txn, name, ino)?;
                Ok(AddOutcome::Done)
            }
        }
    }

    fn block_add(&mut self, txn: &mut Txn<'_>, name: &[u8], ino: u64) -> Result<AddOutcome> {
        let bs = self.cfg.block_size;
        let dev = self.dev_block(0)?;
        let mut buf = txn.read_block(dev)?.into_inner();
        let mut ents = blk_parse_tail(&buf, dev)?;

        let mut limit = bs as usize - BLOCK_TAIL - (ents.len() + 1) * 8;
        let mut off = data_add(&mut buf, limit, ino, name, dev)?;
        if off.is_none() && ents.iter().any(|e| e.addr == NULL_ADDR) {
            // Tombstones cost tail space; reclaim them and retry.
            ents.retain(|e| e.addr != NULL_ADDR);
            limit = bs as usize - BLOCK_TAIL - (ents.len() + 1) * 8;
            off = data_add(&mut buf, limit, ino, name, dev)?;
        }
        let Some(off) = off else {
            return Ok(AddOutcome::Full);
        };

        let hash = self.hash_of(name).0;
        let addr = make_addr(bs, 0, off)?;
        let pos = ents.partition_point(|e| e.hash <= hash);
        ents.insert(pos, LeafEntry { hash, addr });
        blk_write_tail(&mut buf, &ents, dev)?;
        txn.log_block(dev, &buf)?;
        Ok(AddOutcome::Done)
    }

    fn block_remove(&mut self, txn: &mut Txn<'_>, idx: usize) -> Result<()> {
        let dev = self.dev_block(0)?;
        let mut buf = txn.read_block(dev)?.into_inner();
        let mut ents = blk_parse_tail(&buf, dev)?;
        let addr = ents[idx].addr;
        let (_, off) = split_addr(self.cfg.block_size, addr);
        data_remove(&mut buf, off, dev)?;
        ents[idx].addr = NULL_ADDR;
        blk_write_tail(&mut buf, &ents, dev)?;
        txn.log_block(dev, &buf)
    }

    // ── leaf shape ──

    fn leaf_add(&mut self, txn: &mut Txn<'_>, name: &[u8], ino: u64) -> Result<AddOutcome> {
        let bs = self.cfg.block_size;
        let need = entry_size(name.len());
        let mut img = self.read_leaf(txn, LEAF_SEGMENT, true)?;
        let bests = img
            .bests
            .as_ref()
            .ok_or_else(|| AgfsError::Format("single-leaf block lost its best table".to_owned()))?;

        let target = bests
            .iter()
            .position(|&b| b != BEST_HOLE && usize::from(b) >= need);
        let slot = target.or_else(|| bests.iter().position(|&b| b == BEST_HOLE));
        let extra_bests = usize::from(target.is_none() && slot.is_none());

        if !img.can_insert(bs, extra_bests) {
            img.compact();
            if !img.can_insert(bs, extra_bests) {
                return Ok(AddOutcome::Full);
            }
        }

        // Data placement: an existing block with room, a freed table hole,
        // or a brand-new data block.
        let dlblk = match (target, slot) {
            (Some(i), _) => u32::try_from(i)
                .map_err(|_| AgfsError::Format("data block index overflow".to_owned()))?,
            (None, hole) => {
                let i = hole.unwrap_or_else(|| img.bests.as_ref().map_or(0, Vec::len));
                let lblk = u32::try_from(i)
                    .map_err(|_| AgfsError::Format("data block index overflow".to_owned()))?;
                let dev = self.alloc_dirblock(txn, lblk)?;
                txn.log_block(dev, &init_data_region(bs, DATA_MAGIC)?)?;
                if lblk >= self.next_data {
                    self.next_data = lblk + 1;
                }
                lblk
            }
        };

        let dev = self.dev_block(dlblk)?;
        let mut buf = txn.read_block(dev)?.into_inner();
        let off = data_add(&mut buf, bs as usize, ino, name, dev)?
            .ok_or_else(|| corrupt(dev, "best-free table overstated free space".to_owned()))?;
        let best = best_of(&buf, bs, dev)?;
        txn.log_block(dev, &buf)?;

        let bests = img
            .bests
            .as_mut()
            .ok_or_else(|| AgfsError::Format("single-leaf block lost its best table".to_owned()))?;
        let bidx = dlblk as usize;
        if bidx >= bests.len() {
            bests.resize(bidx + 1, BEST_HOLE);
        }
        bests[bidx] = best;

        let hash = self.hash_of(name).0;
        img.insert(hash, make_addr(bs, dlblk, off)?);
        self.write_leaf(txn, LEAF_SEGMENT, &img)?;
        Ok(AddOutcome::Done)
    }

    fn leaf_remove(&mut self, txn: &mut Txn<'_>, idx: usize) -> Result<()> {
        let bs = self.cfg.block_size;
        let mut img = self.read_leaf(txn, LEAF_SEGMENT, true)?;
        let addr = img.ents[idx].addr;
        let (dlblk, off) = split_addr(bs, addr);

        let dev = self.dev_block(dlblk)?;
        let mut buf = txn.read_block(dev)?.into_inner();
        data_remove(&mut buf, off, dev)?;
        let best = if data_is_empty(&buf, dev)? {
            self.free_dirblock(txn, dlblk)?;
            BEST_HOLE
        } else {
            let b = best_of(&buf, bs, dev)?;
            txn.log_block(dev, &buf)?;
            b
        };

        let bests = img
            .bests
            .as_mut()
            .ok_or_else(|| AgfsError::Format("single-leaf block lost its best table".to_owned()))?;
        if let Some(slot) = bests.get_mut(dlblk as usize) {
            *slot = best;
        }
        while bests.last() == Some(&BEST_HOLE) {
            bests.pop();
            self.next_data -= 1;
        }
        img.ents[idx].addr = NULL_ADDR;
        self.write_leaf(txn, LEAF_SEGMENT, &img)
    }

    // ── node shape ──

    fn node_add(&mut self, txn: &mut Txn<'_>, name: &[u8], ino: u64) -> Result<()> {
        let bs = self.cfg.block_size;
        let hash = self.hash_of(name).0;
        let addr = self.node_data_add(txn, name, ino)?;

        // Inserts target the chain-last leaf whose low hash does not exceed
        // the new entry's. The index tie-break on logical block number does
        // not track sibling order once a split lands inside an equal-hash
        // run, so equal lows are resolved by walking the forw chain.
        let rec = match self.index_lookup(
            txn,
            IndexRec {
                hash,
                lblk: u32::MAX,
            },
            LookupDir::Le,
        )? {
            Some(rec) => rec,
            None => self
                .index_first(txn)?
                .ok_or_else(|| AgfsError::Format("node directory with empty index".to_owned()))?,
        };
        let mut lblk = rec.lblk;
        let mut img = self.read_leaf(txn, lblk, false)?;
        while img.forw != NULL_LBLK {
            let next = self.read_leaf(txn, img.forw, false)?;
            if !next.low().is_some_and(|low| low <= hash) {
                break;
            }
            lblk = img.forw;
            img = next;
        }
        let mut key = IndexRec {
            hash: img.low().unwrap_or(rec.hash),
            lblk,
        };

        if !img.can_insert(bs, 0) && img.compact() {
            let new_low = img.low().unwrap_or(hash);
            if new_low != key.hash {
                self.index_replace(txn, key, new_low)?;
                key.hash = new_low;
            }
        }
        if !img.can_insert(bs, 0) {
            (lblk, img, key) = self.leafn_split(txn, lblk, img, key, hash)?;
        }

        let old_low = img.low();
        img.insert(hash, addr);
        let new_low = img.low().unwrap_or(hash);
        if old_low != Some(new_low) && new_low != key.hash {
            self.index_replace(txn, key, new_low)?;
        }
        self.write_leaf(txn, lblk, &img)
    }

    /// Split a full node-format leaf, biasing the cut toward the insertion
    /// point the same way the engine does. Returns the piece the new entry
    /// belongs in along with its index record.
    fn leafn_split(
        &mut self,
        txn: &mut Txn<'_>,
        lblk: u32,
        mut img: LeafImg,
        key: IndexRec,
        ins_hash: u32,
    ) -> Result<(u32, LeafImg, IndexRec)> {
        let n = img.ents.len();
        let pos = img.ents.partition_point(|e| e.hash <= ins_hash);
        let mut keep = n / 2;
        if pos > keep {
            keep = n - n / 2;
        }
        let right_ents = img.ents.split_off(keep);

        let new_lblk = LEAF_SEGMENT + self.next_leaf;
        self.next_leaf += 1;
        self.alloc_dirblock(txn, new_lblk)?;
        let mut right = LeafImg::new(false);
        right.ents = right_ents;
        right.forw = img.forw;
        right.back = lblk;
        img.forw = new_lblk;
        if right.forw != NULL_LBLK {
            let mut after = self.read_leaf(txn, right.forw, false)?;
            after.back = new_lblk;
            self.write_leaf(txn, right.forw, &after)?;
        }

        let right_low = right
            .low()
            .ok_or_else(|| AgfsError::Format("leaf split produced an empty right".to_owned()))?;
        let right_key = IndexRec {
            hash: right_low,
            lblk: new_lblk,
        };
        self.index_insert(txn, right_key)?;
        debug!(
            left = lblk,
            right = new_lblk,
            moved = right.ents.len(),
            "dir_leafn_split"
        );

        if ins_hash >= right_low {
            self.write_leaf(txn, lblk, &img)?;
            Ok((new_lblk, right, right_key))
        } else {
            self.write_leaf(txn, new_lblk, &right)?;
            Ok((lblk, img, key))
        }
    }

    fn node_remove(&mut self, txn: &mut Txn<'_>, lblk: u32, idx: usize) -> Result<()> {
        let bs = self.cfg.block_size;
        let mut img = self.read_leaf(txn, lblk, false)?;
        let addr = img.ents[idx].addr;
        let (dlblk, off) = split_addr(bs, addr);

        let dev = self.dev_block(dlblk)?;
        let mut buf = txn.read_block(dev)?.into_inner();
        data_remove(&mut buf, off, dev)?;
        if data_is_empty(&buf, dev)? {
            self.free_dirblock(txn, dlblk)?;
            self.node_set_best(txn, dlblk, BEST_HOLE)?;
        } else {
            let best = best_of(&buf, bs, dev)?;
            txn.log_block(dev, &buf)?;
            self.node_set_best(txn, dlblk, best)?;
        }

        img.ents[idx].addr = NULL_ADDR;
        if img.ents.iter().all(|e| e.addr == NULL_ADDR) {
            // Whole leaf is tombstones; unlink and drop it.
            let low = img
                .low()
                .ok_or_else(|| AgfsError::Format("empty leaf in node directory".to_owned()))?;
            if img.back != NULL_LBLK {
                let mut before = self.read_leaf(txn, img.back, false)?;
                before.forw = img.forw;
                self.write_leaf(txn, img.back, &before)?;
            }
            if img.forw != NULL_LBLK {
                let mut after = self.read_leaf(txn, img.forw, false)?;
                after.back = img.back;
                self.write_leaf(txn, img.forw, &after)?;
            }
            self.index_delete(txn, IndexRec { hash: low, lblk })?;
            self.free_dirblock(txn, lblk)?;
            debug!(leaf = lblk, "dir_leafn_drop");
            return Ok(());
        }
        self.write_leaf(txn, lblk, &img)
    }

    /// Place the entry data for a node-shape directory, consulting the
    /// free-index blocks for a data block with room.
    fn node_data_add(&mut self, txn: &mut Txn<'_>, name: &[u8], ino: u64) -> Result<u32> {
        let bs = self.cfg.block_size;
        let need = entry_size(name.len());
        let per = (bs as usize - FREE_HEADER) / 2;

        let mut found = None;
        'outer: for f in 0..self.next_free {
            let dev = self.dev_block(FREE_SEGMENT + f)?;
            let buf = txn.read_block(dev)?;
            let nvalid =
                usize::from(read_le_u16(buf.as_slice(), 4).map_err(|e| corrupt(dev, e.to_string()))?);
            for i in 0..nvalid {
                let best = read_le_u16(buf.as_slice(), FREE_HEADER + i * 2)
                    .map_err(|e| corrupt(dev, e.to_string()))?;
                if best != BEST_HOLE && usize::from(best) >= need {
                    let lblk = u32::try_from(f as usize * per + i)
                        .map_err(|_| AgfsError::Format("data block overflow".to_owned()))?;
                    found = Some(lblk);
                    break 'outer;
                }
            }
        }
        let dlblk = match found {
            Some(lblk) => lblk,
            None => {
                let lblk = self.next_data;
                self.next_data += 1;
                let dev = self.alloc_dirblock(txn, lblk)?;
                txn.log_block(dev, &init_data_region(bs, DATA_MAGIC)?)?;
                lblk
            }
        };

        let dev = self.dev_block(dlblk)?;
        let mut buf = txn.read_block(dev)?.into_inner();
        let off = data_add(&mut buf, bs as usize, ino, name, dev)?
            .ok_or_else(|| corrupt(dev, "free-index table overstated free space".to_owned()))?;
        let best = best_of(&buf, bs, dev)?;
        txn.log_block(dev, &buf)?;
        self.node_set_best(txn, dlblk, best)?;
        make_addr(bs, dlblk, off)
    }

    fn node_set_best(&mut self, txn: &mut Txn<'_>, dlblk: u32, best: u16) -> Result<()> {
        let bs = self.cfg.block_size;
        let per = u32::try_from((bs as usize - FREE_HEADER) / 2)
            .map_err(|_| AgfsError::Format("free-index stride overflow".to_owned()))?;
        let f = dlblk / per;
        let idx = (dlblk % per) as usize;

        while self.next_free <= f {
            let lblk = FREE_SEGMENT + self.next_free;
            self.next_free += 1;
            let dev = self.alloc_dirblock(txn, lblk)?;
            let mut buf = vec![0_u8; bs as usize];
            let err = |e: agfs_types::ParseError| AgfsError::Format(e.to_string());
            write_le_u32(&mut buf, 0, FREE_MAGIC).map_err(err)?;
            write_le_u16(&mut buf, 4, 0).map_err(err)?;
            txn.log_block(dev, &buf)?;
        }

        let dev = self.dev_block(FREE_SEGMENT + f)?;
        let mut buf = txn.read_block(dev)?.into_inner();
        let err = |e: agfs_types::ParseError| AgfsError::Format(e.to_string());
        let nvalid = usize::from(read_le_u16(&buf, 4).map_err(err)?);
        if idx >= nvalid {
            // Slots between nvalid and idx stay holes.
            for hole in nvalid..idx {
                write_le_u16(&mut buf, FREE_HEADER + hole * 2, BEST_HOLE).map_err(err)?;
            }
            write_le_u16(
                &mut buf,
                4,
                u16::try_from(idx + 1)
                    .map_err(|_| AgfsError::Format("free-index count overflow".to_owned()))?,
            )
            .map_err(err)?;
        }
        write_le_u16(&mut buf, FREE_HEADER + idx * 2, best).map_err(err)?;
        // Only a couple of bytes changed; log the dirty span, not the block.
        let (lo, hi) = if idx >= nvalid {
            (4, FREE_HEADER + (idx + 1) * 2)
        } else {
            (FREE_HEADER + idx * 2, FREE_HEADER + idx * 2 + 2)
        };
        let overflow = |_| AgfsError::Format("free-index offset overflow".to_owned());
        txn.log_range(
            dev,
            &buf,
            u32::try_from(lo).map_err(overflow)?,
            u32::try_from(hi).map_err(overflow)?,
        )
    }

    // ── index tree plumbing ──

    fn index_ops(&mut self) -> IndexOps<'_, A> {
        IndexOps {
            alloc: &mut self.alloc,
            map: &mut self.map,
            next_index: &mut self.next_index,
            root: &mut self.index_root,
            block_size: self.cfg.block_size,
        }
    }

    fn index_root(&self) -> Result<TreeRoot<ShortPtr>> {
        self.index_root
            .ok_or_else(|| AgfsError::Format("node directory has no index root".to_owned()))
    }

    fn index_lookup(
        &mut self,
        txn: &Txn<'_>,
        key: IndexRec,
        dir: LookupDir,
    ) -> Result<Option<IndexRec>> {
        let root = self.index_root()?;
        let ops = self.index_ops();
        let mut cur = BtCursor::new(root, VerifyLevel::Basic);
        if btree_lookup(&ops, txn, &mut cur, &key, dir)? {
            Ok(cur.current_rec().copied())
        } else {
            Ok(None)
        }
    }

    fn index_first(&mut self, txn: &Txn<'_>) -> Result<Option<IndexRec>> {
        let root = self.index_root()?;
        let ops = self.index_ops();
        let mut cur = BtCursor::new(root, VerifyLevel::Basic);
        if first(&ops, txn, &mut cur)? {
            Ok(cur.current_rec().copied())
        } else {
            Ok(None)
        }
    }

    fn index_count(&mut self, txn: &Txn<'_>) -> Result<usize> {
        let root = self.index_root()?;
        let ops = self.index_ops();
        let mut cur = BtCursor::new(root, VerifyLevel::Basic);
        if !first(&ops, txn, &mut cur)? {
            return Ok(0);
        }
        let mut n = 1;
        while increment(&ops, txn, &mut cur, 0)? {
            n += 1;
        }
        Ok(n)
    }

    fn index_insert(&mut self, txn: &mut Txn<'_>, rec: IndexRec) -> Result<()> {
        let root = self.index_root()?;
        let mut ops = self.index_ops();
        let mut cur = BtCursor::new(root, VerifyLevel::Basic);
        if btree_lookup(&ops, txn, &mut cur, &rec, LookupDir::Eq)? {
            return Err(AgfsError::Format(format!("duplicate index record {rec:?}")));
        }
        btree_insert(&mut ops, txn, &mut cur, rec)
    }

    fn index_delete(&mut self, txn: &mut Txn<'_>, rec: IndexRec) -> Result<()> {
        let root = self.index_root()?;
        let mut ops = self.index_ops();
        let mut cur = BtCursor::new(root, VerifyLevel::Basic);
        if !btree_lookup(&ops, txn, &mut cur, &rec, LookupDir::Eq)? {
            return Err(AgfsError::Format(format!("missing index record {rec:?}")));
        }
        btree_delete(&mut ops, txn, &mut cur)
    }

    /// Rekey one leaf's index record after its low hash changed.
    fn index_replace(&mut self, txn: &mut Txn<'_>, old: IndexRec, new_hash: u32) -> Result<()> {
        self.index_delete(txn, old)?;
        self.index_insert(
            txn,
            IndexRec {
                hash: new_hash,
                lblk: old.lblk,
            },
        )
    }
}

fn best_of(buf: &[u8], block_size: u32, block: BlockNumber) -> Result<u16> {
    let best = data_best_free(buf, block_size as usize, block)?;
    u16::try_from(best).map_err(|_| AgfsError::Format("best-free exceeds u16".to_owned()))
}

fn validate_name(name: &[u8]) -> Result<()> {
    if name.is_empty() {
        return Err(AgfsError::Format("empty directory entry name".to_owned()));
    }
    if name.len() > usize::from(u8::MAX) {
        return Err(AgfsError::NameTooLong);
    }
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use agfs_block::MemBlockDevice;
    use proptest::prelude::*;
    use std::collections::{BTreeMap as Model, HashSet};

    const BS: u32 = 512;

    struct MockAlloc {
        next: u64,
        live: HashSet<u64>,
    }

    impl MockAlloc {
        fn new() -> Self {
            Self {
                next: 0,
                live: HashSet::new(),
            }
        }
    }

    impl DirBlockAlloc for MockAlloc {
        fn alloc_block(&mut self, _txn: &mut Txn<'_>) -> Result<BlockNumber> {
            let b = self.next;
            self.next += 1;
            self.live.insert(b);
            Ok(BlockNumber(b))
        }

        fn free_block(&mut self, _txn: &mut Txn<'_>, block: BlockNumber) -> Result<()> {
            if !self.live.remove(&block.0) {
                return Err(AgfsError::Format(format!("double free of block {block}")));
            }
            Ok(())
        }
    }

    fn newdir(ci: bool, inline_capacity: usize) -> (MemBlockDevice, Directory<MockAlloc>) {
        let dev = MemBlockDevice::new(BS, 1 << 16);
        let cfg = DirConfig {
            block_size: BS,
            inline_capacity,
            case_insensitive: ci,
        };
        (dev, Directory::new(cfg, MockAlloc::new()))
    }

    #[test]
    fn empty_directory_misses() {
        let (dev, mut dir) = newdir(false, 256);
        let txn = Txn::new(&dev);
        assert_eq!(dir.lookup(&txn, b"nothing").unwrap(), None);
        assert_eq!(dir.shape(), DirShape::Inline);
    }

    #[test]
    fn inline_add_lookup_remove() {
        let (dev, mut dir) = newdir(false, 256);
        let mut txn = Txn::new(&dev);
        dir.add(&mut txn, b"alpha", 11).unwrap();
        dir.add(&mut txn, b"beta", 12).unwrap();
        assert_eq!(dir.shape(), DirShape::Inline);
        assert_eq!(dir.lookup(&txn, b"alpha").unwrap(), Some(11));
        assert_eq!(dir.lookup(&txn, b"beta").unwrap(), Some(12));

        assert!(matches!(
            dir.add(&mut txn, b"alpha", 99).unwrap_err(),
            AgfsError::Exists
        ));
        dir.remove(&mut txn, b"alpha").unwrap();
        assert_eq!(dir.lookup(&txn, b"alpha").unwrap(), None);
        assert!(matches!(
            dir.remove(&mut txn, b"alpha").unwrap_err(),
            AgfsError::NotFound(_)
        ));
    }

    #[test]
    fn name_validation() {
        let (dev, mut dir) = newdir(false, 256);
        let mut txn = Txn::new(&dev);
        assert!(matches!(
            dir.add(&mut txn, b"", 1).unwrap_err(),
            AgfsError::Format(_)
        ));
        let long = vec![b'x'; 256];
        assert!(matches!(
            dir.add(&mut txn, &long, 1).unwrap_err(),
            AgfsError::NameTooLong
        ));
    }

    /// Fifty four-byte names; the directory must have left the inline
    /// shape around the twentieth entry and resolve every name at every
    /// step along the way.
    #[test]
    fn fifty_entries_promote_with_lookups_at_every_step() {
        let (dev, mut dir) = newdir(false, 256);
        let mut txn = Txn::new(&dev);
        let names: Vec<Vec<u8>> = (0..50).map(|i| format!("e{i:03}").into_bytes()).collect();

        for (i, name) in names.iter().enumerate() {
            dir.add(&mut txn, name, i as u64 + 100).unwrap();
            for (j, prev) in names.iter().take(i + 1).enumerate() {
                assert_eq!(
                    dir.lookup(&txn, prev).unwrap(),
                    Some(j as u64 + 100),
                    "missing {} after {} adds (shape {:?})",
                    String::from_utf8_lossy(prev),
                    i + 1,
                    dir.shape()
                );
            }
            if i + 1 >= 20 {
                assert_ne!(dir.shape(), DirShape::Inline, "still inline at {}", i + 1);
            }
        }
        assert!(matches!(dir.shape(), DirShape::Block | DirShape::Leaf));
        txn.commit().unwrap();
    }

    #[test]
    fn promotes_to_node_and_collapses_back_to_inline() {
        let (dev, mut dir) = newdir(false, 128);
        let mut txn = Txn::new(&dev);
        let names: Vec<Vec<u8>> = (0..300).map(|i| format!("n{i:04}").into_bytes()).collect();

        for (i, name) in names.iter().enumerate() {
            dir.add(&mut txn, name, i as u64 + 1).unwrap();
        }
        assert_eq!(dir.shape(), DirShape::Node);
        for (i, name) in names.iter().enumerate() {
            assert_eq!(dir.lookup(&txn, name).unwrap(), Some(i as u64 + 1));
        }

        let mut listed = dir.entries(&txn).unwrap();
        listed.sort();
        assert_eq!(listed.len(), 300);

        for name in names.iter().rev() {
            dir.remove(&mut txn, name).unwrap();
            assert_eq!(dir.lookup(&txn, name).unwrap(), None);
        }
        assert_eq!(dir.shape(), DirShape::Inline);
        assert!(dir.entries(&txn).unwrap().is_empty());
        assert_eq!(dir.alloc.live.len(), 0, "leaked directory blocks");
        txn.commit().unwrap();
    }

    #[test]
    fn removed_names_leave_others_intact_across_shapes() {
        let (dev, mut dir) = newdir(false, 64);
        let mut txn = Txn::new(&dev);
        let names: Vec<Vec<u8>> = (0..40).map(|i| format!("f{i:02}").into_bytes()).collect();
        for (i, name) in names.iter().enumerate() {
            dir.add(&mut txn, name, i as u64 + 1).unwrap();
        }
        for i in (0..40).step_by(3) {
            dir.remove(&mut txn, &names[i]).unwrap();
        }
        for (i, name) in names.iter().enumerate() {
            let expect = if i % 3 == 0 { None } else { Some(i as u64 + 1) };
            assert_eq!(dir.lookup(&txn, name).unwrap(), expect);
        }
        // Removed names can come back.
        dir.add(&mut txn, &names[0], 777).unwrap();
        assert_eq!(dir.lookup(&txn, &names[0]).unwrap(), Some(777));
    }

    #[test]
    fn case_insensitive_matching() {
        let (dev, mut dir) = newdir(true, 256);
        let mut txn = Txn::new(&dev);
        dir.add(&mut txn, b"README", 5).unwrap();
        assert_eq!(dir.lookup(&txn, b"readme").unwrap(), Some(5));
        assert_eq!(dir.lookup(&txn, b"ReadMe").unwrap(), Some(5));
        assert!(matches!(
            dir.add(&mut txn, b"ReadMe", 6).unwrap_err(),
            AgfsError::Exists
        ));
        dir.remove(&mut txn, b"rEADME").unwrap();
        assert_eq!(dir.lookup(&txn, b"README").unwrap(), None);

        let (dev2, mut exact) = newdir(false, 256);
        let mut txn2 = Txn::new(&dev2);
        exact.add(&mut txn2, b"README", 5).unwrap();
        assert_eq!(exact.lookup(&txn2, b"readme").unwrap(), None);
        exact.add(&mut txn2, b"readme", 6).unwrap();
        assert_eq!(exact.lookup(&txn2, b"README").unwrap(), Some(5));
        assert_eq!(exact.lookup(&txn2, b"readme").unwrap(), Some(6));
    }

    #[test]
    fn block_shape_keeps_tombstones_until_compaction() {
        let (dev, mut dir) = newdir(false, 32);
        let mut txn = Txn::new(&dev);
        for i in 0..8 {
            dir.add(&mut txn, format!("t{i:02}").as_bytes(), i + 1).unwrap();
        }
        assert_eq!(dir.shape(), DirShape::Block);
        dir.remove(&mut txn, b"t03").unwrap();
        assert_eq!(dir.shape(), DirShape::Block);

        let devblk = dir.dev_block(0).unwrap();
        let buf = txn.read_block(devblk).unwrap();
        let ents = blk_parse_tail(buf.as_slice(), devblk).unwrap();
        let stale = ents.iter().filter(|e| e.addr == NULL_ADDR).count();
        assert_eq!(stale, 1, "remove must tombstone, not shift");
        assert_eq!(ents.len(), 8);
    }

    #[test]
    fn data_region_reuses_freed_slots() {
        let block = BlockNumber(0);
        let mut buf = init_data_region(BS, DATA_MAGIC).unwrap();
        let a = data_add(&mut buf, BS as usize, 1, b"first", block).unwrap().unwrap();
        let b = data_add(&mut buf, BS as usize, 2, b"second", block).unwrap().unwrap();
        let _c = data_add(&mut buf, BS as usize, 3, b"third", block).unwrap().unwrap();
        assert!(a < b);

        data_remove(&mut buf, a, block).unwrap();
        // The freed head slot is first-fit reused.
        let again = data_add(&mut buf, BS as usize, 4, b"fresh", block).unwrap().unwrap();
        assert_eq!(again, a);

        // Freeing the tail entry shrinks the data end.
        let end_before = data_end(&buf, block).unwrap();
        data_remove(&mut buf, _c, block).unwrap();
        assert!(data_end(&buf, block).unwrap() < end_before);
    }

    #[test]
    fn leaf_image_round_trips_and_rejects_bad_stale() {
        let mut img = LeafImg::new(true);
        img.insert(30, 7);
        img.insert(10, 3);
        img.insert(30, NULL_ADDR);
        img.bests = Some(vec![100, BEST_HOLE, 40]);
        let buf = img.serialize(BS).unwrap();
        let back = LeafImg::parse(&buf, BlockNumber(0), true).unwrap();
        assert_eq!(back.ents, img.ents);
        assert_eq!(back.bests, img.bests);
        assert_eq!(back.stale(), 1);

        let mut bad = buf.clone();
        bad[6] = 9; // stale field no longer matches the entries
        assert!(matches!(
            LeafImg::parse(&bad, BlockNumber(0), true).unwrap_err(),
            AgfsError::Corruption { .. }
        ));
    }

    /// Build `count` distinct eight-byte names that all hash to `target`.
    ///
    /// For fixed-length input `name_hash` is XOR-linear (shifts, rotates and
    /// XOR only, and the all-zero name hashes to zero), so Gaussian
    /// elimination over the hashes of the 64 single-bit names yields a basis
    /// that can hit any target plus a kernel of masks that leave the hash
    /// unchanged.
    fn colliding_names(target: u32, count: usize) -> Vec<Vec<u8>> {
        let mut pivots: [Option<(u32, u64)>; 32] = [None; 32];
        let mut kernel: Vec<u64> = Vec::new();
        for bit in 0..64 {
            let mut h = name_hash(&(1_u64 << bit).to_le_bytes()).0;
            let mut m = 1_u64 << bit;
            loop {
                if h == 0 {
                    kernel.push(m);
                    break;
                }
                let top = 31 - h.leading_zeros() as usize;
                if let Some((ph, pm)) = pivots[top] {
                    h ^= ph;
                    m ^= pm;
                } else {
                    pivots[top] = Some((h, m));
                    break;
                }
            }
        }
        assert!(count <= 1_usize << kernel.len().min(20), "kernel too small");

        let mut t = target;
        let mut base = 0_u64;
        while t != 0 {
            let top = 31 - t.leading_zeros() as usize;
            let (ph, pm) = pivots[top].expect("name hash spans all 32 bits over 8-byte names");
            t ^= ph;
            base ^= pm;
        }

        (0..count)
            .map(|i| {
                let mut m = base;
                for (k, km) in kernel.iter().enumerate() {
                    if i & (1 << k) != 0 {
                        m ^= km;
                    }
                }
                m.to_le_bytes().to_vec()
            })
            .collect()
    }

    /// A run of identically-hashed names spread over several node-shape
    /// leaves, with unrelated inserts forcing splits inside the run. Names
    /// hashing above the run must land after the whole run, and every name
    /// must stay reachable throughout.
    #[test]
    fn equal_hash_runs_survive_mid_chain_leaf_splits() {
        let (dev, mut dir) = newdir(false, 64);
        let mut txn = Txn::new(&dev);

        let target = 0x8000_0000;
        let family = colliding_names(target, 130);
        for name in &family {
            assert_eq!(name_hash(name).0, target);
        }
        let low_fill: Vec<Vec<u8>> = (0_u32..)
            .map(|i| format!("fill{i:05}").into_bytes())
            .filter(|n| name_hash(n).0 < target)
            .take(80)
            .collect();
        let high_fill: Vec<Vec<u8>> = (0_u32..)
            .map(|i| format!("over{i:05}").into_bytes())
            .filter(|n| name_hash(n).0 > target)
            .take(8)
            .collect();

        let mut model: Model<Vec<u8>, u64> = Model::new();
        let mut ino = 0_u64;
        for (i, name) in family.iter().enumerate() {
            ino += 1;
            dir.add(&mut txn, name, ino).unwrap();
            model.insert(name.clone(), ino);
            if i % 2 == 0 && i / 2 < low_fill.len() {
                ino += 1;
                dir.add(&mut txn, &low_fill[i / 2], ino).unwrap();
                model.insert(low_fill[i / 2].clone(), ino);
            }
        }
        assert_eq!(dir.shape(), DirShape::Node);

        for name in &high_fill {
            ino += 1;
            dir.add(&mut txn, name, ino).unwrap();
            model.insert(name.clone(), ino);
            for (n, &v) in &model {
                assert_eq!(dir.lookup(&txn, n).unwrap(), Some(v), "lost {n:02x?}");
            }
        }

        let names: Vec<Vec<u8>> = model.keys().cloned().collect();
        for n in &names {
            dir.remove(&mut txn, n).unwrap();
            assert_eq!(dir.lookup(&txn, n).unwrap(), None);
        }
        assert_eq!(dir.shape(), DirShape::Inline);
        assert_eq!(dir.alloc.live.len(), 0, "leaked directory blocks");
        txn.commit().unwrap();
    }

    /// Best-free slot updates touch two bytes of a free-index block; the
    /// transaction must see them as partial dirty ranges, never whole-block
    /// logs.
    #[test]
    fn free_index_updates_log_partial_dirty_ranges() {
        let (dev, mut dir) = newdir(false, 64);
        let mut txn = Txn::new(&dev);
        for i in 0..120 {
            dir.add(&mut txn, format!("r{i:04}").as_bytes(), i + 1).unwrap();
        }
        assert_eq!(dir.shape(), DirShape::Node);
        txn.commit().unwrap();

        let mut txn = Txn::new(&dev);
        dir.add(&mut txn, b"straggler", 999).unwrap();
        let free_dev = dir.dev_block(FREE_SEGMENT).unwrap();
        let ranges = txn.logged_ranges(free_dev).expect("free-index block untouched");
        assert!(!ranges.is_empty());
        for &(lo, hi) in ranges {
            assert!(lo < hi && hi - lo < BS, "whole-block log at {lo}..{hi}");
        }
        txn.commit().unwrap();
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn random_ops_agree_with_reference_model(
            steps in proptest::collection::vec((any::<bool>(), 0_u16..48), 1..120),
        ) {
            let (dev, mut dir) = newdir(false, 96);
            let mut txn = Txn::new(&dev);
            let mut model: Model<Vec<u8>, u64> = Model::new();

            for (do_add, sel) in steps {
                let name = format!("p{:02}", sel % 48).into_bytes();
                if do_add {
                    let ino = u64::from(sel) + 1;
                    match dir.add(&mut txn, &name, ino) {
                        Ok(()) => {
                            prop_assert!(!model.contains_key(&name));
                            model.insert(name.clone(), ino);
                        }
                        Err(AgfsError::Exists) => prop_assert!(model.contains_key(&name)),
                        Err(e) => return Err(TestCaseError::fail(e.to_string())),
                    }
                } else {
                    match dir.remove(&mut txn, &name) {
                        Ok(()) => {
                            prop_assert!(model.remove(&name).is_some());
                        }
                        Err(AgfsError::NotFound(_)) => prop_assert!(!model.contains_key(&name)),
                        Err(e) => return Err(TestCaseError::fail(e.to_string())),
                    }
                }
                for (n, &ino) in &model {
                    prop_assert_eq!(dir.lookup(&txn, n).unwrap(), Some(ino));
                }
            }

            let names: Vec<Vec<u8>> = model.keys().cloned().collect();
            for n in names {
                dir.remove(&mut txn, &n).unwrap();
            }
            prop_assert_eq!(dir.shape(), DirShape::Inline);
            prop_assert_eq!(dir.alloc.live.len(), 0);
        }
    }
}
