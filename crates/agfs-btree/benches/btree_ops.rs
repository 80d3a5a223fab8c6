//! Microbenchmarks for the generic B+tree engine over an in-memory device.

use agfs_block::{MemBlockDevice, Txn};
use agfs_btree::{
    delete, init_tree_block, insert, lookup, BtCursor, BtreeOps, BtreePtr, LongPtr, LookupDir,
    TreeRoot, VerifyLevel,
};
use agfs_error::{AgfsError, Result};
use agfs_types::BlockNumber;
use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use std::cmp::Ordering;

const BS: u32 = 4096;
const NBLOCKS: u64 = 1 << 20;

#[derive(Debug, Clone)]
struct Rec {
    key: u64,
    val: u64,
}

struct BenchOps {
    next_block: u64,
}

impl BtreeOps for BenchOps {
    type Ptr = LongPtr;
    type Key = u64;
    type Rec = Rec;

    fn magic(&self) -> u32 {
        0x4245_4E43
    }

    fn key_size(&self) -> usize {
        8
    }

    fn rec_size(&self) -> usize {
        16
    }

    fn max_recs(&self, level: u16) -> usize {
        let hdr = agfs_btree::header_size::<LongPtr>();
        let body = BS as usize - hdr;
        if level == 0 {
            body / self.rec_size()
        } else {
            body / (self.key_size() + LongPtr::SIZE)
        }
    }

    fn cmp_keys(&self, a: &u64, b: &u64) -> Ordering {
        a.cmp(b)
    }

    fn key_of(&self, rec: &Rec) -> u64 {
        rec.key
    }

    fn encode_key(&self, key: &u64, out: &mut [u8]) -> Result<()> {
        out.copy_from_slice(&key.to_le_bytes());
        Ok(())
    }

    fn decode_key(&self, data: &[u8]) -> Result<u64> {
        let mut b = [0_u8; 8];
        b.copy_from_slice(&data[..8]);
        Ok(u64::from_le_bytes(b))
    }

    fn encode_rec(&self, rec: &Rec, out: &mut [u8]) -> Result<()> {
        out[..8].copy_from_slice(&rec.key.to_le_bytes());
        out[8..16].copy_from_slice(&rec.val.to_le_bytes());
        Ok(())
    }

    fn decode_rec(&self, data: &[u8]) -> Result<Rec> {
        let mut k = [0_u8; 8];
        let mut v = [0_u8; 8];
        k.copy_from_slice(&data[..8]);
        v.copy_from_slice(&data[8..16]);
        Ok(Rec {
            key: u64::from_le_bytes(k),
            val: u64::from_le_bytes(v),
        })
    }

    fn ptr_to_block(&self, ptr: LongPtr) -> Result<BlockNumber> {
        Ok(BlockNumber(ptr.0))
    }

    fn ptr_in_bounds(&self, ptr: LongPtr) -> bool {
        ptr.0 < NBLOCKS
    }

    fn alloc_block(&mut self, _txn: &mut Txn<'_>, _hint: LongPtr) -> Result<LongPtr> {
        if self.next_block >= NBLOCKS {
            return Err(AgfsError::NoSpace);
        }
        let b = self.next_block;
        self.next_block += 1;
        Ok(LongPtr(b))
    }

    fn free_block(&mut self, _txn: &mut Txn<'_>, _ptr: LongPtr) -> Result<()> {
        Ok(())
    }

    fn set_root(&mut self, _txn: &mut Txn<'_>, _root: &TreeRoot<LongPtr>) -> Result<()> {
        Ok(())
    }
}

fn build_tree(dev: &MemBlockDevice, ops: &mut BenchOps, n: u64) -> TreeRoot<LongPtr> {
    let mut txn = Txn::new(dev);
    let root_ptr = ops.alloc_block(&mut txn, LongPtr::NULL).unwrap();
    let img = init_tree_block(ops, BS, 0).unwrap();
    txn.log_block(BlockNumber(root_ptr.0), &img).unwrap();

    let mut cur = BtCursor::new(
        TreeRoot::Block {
            ptr: root_ptr,
            nlevels: 1,
        },
        VerifyLevel::Basic,
    );
    for i in 0..n {
        let key = i.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 16;
        if !lookup(&*ops, &txn, &mut cur, &key, LookupDir::Eq).unwrap() {
            insert(ops, &mut txn, &mut cur, Rec { key, val: i }).unwrap();
        }
    }
    let root = *cur.root();
    txn.commit().unwrap();
    root
}

fn bench_lookup(c: &mut Criterion) {
    let dev = MemBlockDevice::new(BS, NBLOCKS);
    let mut ops = BenchOps { next_block: 1 };
    let root = build_tree(&dev, &mut ops, 100_000);
    let txn = Txn::new(&dev);
    let mut cur = BtCursor::new(root, VerifyLevel::Basic);

    let mut i = 0_u64;
    c.bench_function("btree_lookup_100k", |b| {
        b.iter(|| {
            let key = i.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 16;
            i = (i + 1) % 100_000;
            lookup(&ops, &txn, &mut cur, &key, LookupDir::Eq).unwrap()
        });
    });
}

fn bench_insert_delete(c: &mut Criterion) {
    let dev = MemBlockDevice::new(BS, NBLOCKS);
    let mut ops = BenchOps { next_block: 1 };
    let root = build_tree(&dev, &mut ops, 100_000);

    c.bench_function("btree_insert_delete_cycle", |b| {
        b.iter_batched(
            || Txn::new(&dev),
            |mut txn| {
                let mut cur = BtCursor::new(root, VerifyLevel::Basic);
                let key = u64::MAX / 2;
                if !lookup(&ops, &txn, &mut cur, &key, LookupDir::Eq).unwrap() {
                    insert(&mut ops, &mut txn, &mut cur, Rec { key, val: 0 }).unwrap();
                }
                assert!(lookup(&ops, &txn, &mut cur, &key, LookupDir::Eq).unwrap());
                delete(&mut ops, &mut txn, &mut cur).unwrap();
                txn.abort();
            },
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, bench_lookup, bench_insert_delete);
criterion_main!(benches);
