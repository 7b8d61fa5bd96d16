//! Basic equality-encoded bitmap index ("RELIC"): one bitmap per
//! distinct column value, plus byte offsets for seek-free random access.

use std::{collections::BTreeMap, fmt, path::Path, sync::Arc};

use crate::{
    err_at,
    storage::{union_all, Bitvector},
    util::Spinlock,
    Error, Result,
};

use super::predicate::{locate, RangePredicate};

/// on-disk magic: `"#IBIS\x07"` + typecode + `sizeof(int32)`.
const MAGIC_PREFIX: &[u8; 6] = b"#IBIS\x07";
pub const TYPECODE_RELIC: u8 = 2;

/// One column bitmap, activated on first touch. A freshly built index
/// starts every slot `Loaded`; a slot read back from disk starts
/// `Unread`, holding only the byte range within the shared file buffer,
/// and decodes into a cached [Bitvector] the first time anything asks
/// for its bits.
enum LazyBit {
    Loaded(Bitvector),
    Unread { raw: Arc<[u8]>, start: usize, end: usize },
}

pub(crate) struct BitSlot(Spinlock<LazyBit>);

impl BitSlot {
    pub(crate) fn loaded(bv: Bitvector) -> BitSlot {
        BitSlot(Spinlock::new(LazyBit::Loaded(bv)))
    }

    pub(crate) fn unread(raw: Arc<[u8]>, start: usize, end: usize) -> BitSlot {
        BitSlot(Spinlock::new(LazyBit::Unread { raw, start, end }))
    }

    /// Serialized byte length, known without decoding: the stored range's
    /// width for an unread slot, or the re-encoded size for one already
    /// activated. The cost model (`offsets`/`coffsets`) runs entirely off
    /// this, so comparing plans never itself forces activation.
    pub(crate) fn byte_len(&self) -> usize {
        match &*self.0.read() {
            LazyBit::Loaded(bv) => bv.bytes(),
            LazyBit::Unread { start, end, .. } => end - start,
        }
    }

    /// Decode on first touch, caching the result so every later touch is
    /// a plain clone.
    pub(crate) fn get(&self) -> Bitvector {
        {
            let guard = self.0.read();
            if let LazyBit::Loaded(bv) = &*guard {
                return bv.clone();
            }
        }
        let mut guard = self.0.write();
        if let LazyBit::Unread { raw, start, end } = &*guard {
            let (bv, _) = Bitvector::read_from(&raw[*start..*end])
                .expect("bitmap bytes already range-checked at read_prefix time");
            *guard = LazyBit::Loaded(bv);
        }
        match &*guard {
            LazyBit::Loaded(bv) => bv.clone(),
            LazyBit::Unread { .. } => unreachable!("just activated above"),
        }
    }
}

impl Clone for BitSlot {
    fn clone(&self) -> BitSlot {
        BitSlot::loaded(self.get())
    }
}

impl fmt::Debug for BitSlot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("BitSlot(..)")
    }
}

/// `BitmapIndex`: sorted distinct values plus one bitmap per
/// value. Invariant: `vals` strictly increasing; every row is set in
/// exactly one `bits[i]`.
#[derive(Debug, Default)]
pub struct BitmapIndex {
    nrows: u32,
    vals: Vec<f64>,
    bits: Vec<BitSlot>,
}

impl Clone for BitmapIndex {
    fn clone(&self) -> BitmapIndex {
        BitmapIndex {
            nrows: self.nrows,
            vals: self.vals.clone(),
            bits: self.bits.iter().map(BitSlot::clone).collect(),
        }
    }
}

impl BitmapIndex {
    /// `build`: scan `(value, row)` pairs under the column's null mask and
    /// assign one bitmap per distinct value, in ascending value order
    /// ("Build").
    pub fn build(nrows: u32, values: impl IntoIterator<Item = (f64, u32)>) -> BitmapIndex {
        let mut groups: BTreeMap<u64, Vec<u32>> = BTreeMap::new();
        for (v, row) in values {
            groups.entry(v.to_bits()).or_default().push(row);
        }
        let mut vals = Vec::with_capacity(groups.len());
        let mut bits = Vec::with_capacity(groups.len());
        for (bits_key, rows) in groups {
            vals.push(f64::from_bits(bits_key));
            bits.push(BitSlot::loaded(Bitvector::from_ordinals(rows, nrows)));
        }
        BitmapIndex { nrows, vals, bits }
    }

    pub fn nrows(&self) -> u32 {
        self.nrows
    }

    pub fn k(&self) -> usize {
        self.vals.len()
    }

    pub fn vals(&self) -> &[f64] {
        &self.vals
    }

    /// Activate and return bitmap `i`. Cheap on every call after the
    /// first: the slot caches its decoded form.
    pub fn bit(&self, i: usize) -> Bitvector {
        self.bits[i].get()
    }

    /// Activate and return `bits[lo..hi)`. Only the touched slots decode;
    /// the rest of the index stays `Unread`.
    pub fn bits_range(&self, lo: usize, hi: usize) -> Vec<Bitvector> {
        self.bits[lo..hi].iter().map(BitSlot::get).collect()
    }

    /// Byte offsets of each bitmap, relative to the first bitmap, mirroring
    /// the persisted `offsets[0..K]` array. Reading this never activates a
    /// bitmap: the stored byte range is known up front.
    pub fn offsets(&self) -> Vec<u64> {
        let mut offsets = Vec::with_capacity(self.bits.len() + 1);
        let mut acc = 0u64;
        offsets.push(acc);
        for b in &self.bits {
            acc += b.byte_len() as u64;
            offsets.push(acc);
        }
        offsets
    }

    /// `locate(predicate) -> [hit0, hit1)`.
    pub fn locate(&self, predicate: &RangePredicate) -> (u32, u32) {
        locate(&self.vals, predicate)
    }

    /// `evaluate`: degenerate cases handled directly, else [BitmapIndex::sum_bits].
    pub fn evaluate(&self, predicate: &RangePredicate) -> Bitvector {
        let (hit0, hit1) = self.locate(predicate);
        if self.vals.is_empty() || hit0 >= hit1 {
            return Bitvector::with_size(self.nrows);
        }
        if hit0 == 0 && hit1 == self.vals.len() as u32 {
            let all = self.bits_range(0, self.bits.len());
            return union_all(all.iter(), self.nrows);
        }
        if hit1 - hit0 == 1 {
            return self.bit(hit0 as usize);
        }
        self.sum_bits(hit0, hit1)
    }

    /// `sumBits(lo, hi, out)`: union `bits[lo..hi)`, choosing
    /// between a direct union and a complement-of-the-outside union by
    /// whichever the precomputed `offsets` say reads fewer bytes; a tie
    /// within 1% prefers the simpler direct plan.
    pub fn sum_bits(&self, lo: u32, hi: u32) -> Bitvector {
        let offsets = self.offsets();
        let total = *offsets.last().unwrap();
        let direct_cost = offsets[hi as usize] - offsets[lo as usize];
        let complement_cost = total - direct_cost;

        if direct_cost as f64 <= complement_cost as f64 * 1.01 {
            let span = self.bits_range(lo as usize, hi as usize);
            union_all(span.iter(), self.nrows)
        } else {
            let mut outside = self.bits_range(0, lo as usize);
            outside.extend(self.bits_range(hi as usize, self.bits.len()));
            let outside = union_all(outside.iter(), self.nrows);
            let mut full = Bitvector::with_size(self.nrows);
            for b in 0..self.nrows {
                full.set(b, 1);
            }
            full -= &outside;
            full
        }
    }

    /// `equiJoin`: merge the two sorted `vals` arrays and, for every value
    /// present in both, return the masked-bitmap pair for that value
    /// ("outer-product the masked bitmaps on equal keys" — the
    /// cross-product of rows is left to the caller, which is the natural
    /// consumer of a matched `(left_rows, right_rows)` pair).
    pub fn equi_join(
        &self,
        other: &BitmapIndex,
        self_mask: &Bitvector,
        other_mask: &Bitvector,
    ) -> Vec<(Bitvector, Bitvector)> {
        let mut out = Vec::new();
        let (mut i, mut j) = (0usize, 0usize);
        while i < self.vals.len() && j < other.vals.len() {
            match self.vals[i].partial_cmp(&other.vals[j]).unwrap() {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => {
                    let mut lhs = self.bit(i);
                    lhs &= self_mask;
                    let mut rhs = other.bit(j);
                    rhs &= other_mask;
                    if !lhs.is_empty() && !rhs.is_empty() {
                        out.push((lhs, rhs));
                    }
                    i += 1;
                    j += 1;
                }
            }
        }
        out
    }

    /// `rangeJoin`: for each value `v` in `self`, union `other`'s bitmaps
    /// whose value falls in `[v-delta, v+delta]`.
    pub fn range_join(
        &self,
        other: &BitmapIndex,
        self_mask: &Bitvector,
        other_mask: &Bitvector,
        delta: f64,
    ) -> Vec<(Bitvector, Bitvector)> {
        let mut out = Vec::new();
        for (i, &v) in self.vals.iter().enumerate() {
            let predicate = RangePredicate::between(
                super::predicate::Op::Le,
                v - delta,
                super::predicate::Op::Le,
                v + delta,
            );
            let (lo, hi) = other.locate(&predicate);
            if lo >= hi {
                continue;
            }
            let mut lhs = self.bit(i);
            lhs &= self_mask;
            let mut rhs = other.sum_bits(lo, hi);
            rhs &= other_mask;
            if !lhs.is_empty() && !rhs.is_empty() {
                out.push((lhs, rhs));
            }
        }
        out
    }

    /// `compJoin`: like [BitmapIndex::range_join], with `delta`
    /// re-evaluated per value by the caller-supplied expression.
    pub fn comp_join(
        &self,
        other: &BitmapIndex,
        self_mask: &Bitvector,
        other_mask: &Bitvector,
        delta_of: impl Fn(f64) -> f64,
    ) -> Vec<(Bitvector, Bitvector)> {
        let mut out = Vec::new();
        for (i, &v) in self.vals.iter().enumerate() {
            let delta = delta_of(v);
            let predicate = RangePredicate::between(
                super::predicate::Op::Le,
                v - delta,
                super::predicate::Op::Le,
                v + delta,
            );
            let (lo, hi) = other.locate(&predicate);
            if lo >= hi {
                continue;
            }
            let mut lhs = self.bit(i);
            lhs &= self_mask;
            let mut rhs = other.sum_bits(lo, hi);
            rhs &= other_mask;
            if !lhs.is_empty() && !rhs.is_empty() {
                out.push((lhs, rhs));
            }
        }
        out
    }

    /// Persist in the on-disk layout (header, `nrows`, `K`, `K`,
    /// padding, `vals`, `offsets`, bitmaps).
    pub fn write(&self, path: &Path) -> Result<()> {
        let mut buf = Vec::new();
        self.write_prefix(&mut buf, TYPECODE_RELIC)?;
        crate::util::files::write_whole_file(path, &buf)
    }

    /// Write the header + base-index body shared by the plain RELIC file
    /// and every [super::coarse::CoarseBitmap] variant's file prefix, using
    /// `typecode` in the magic byte so readers can dispatch.
    pub(super) fn write_prefix(&self, buf: &mut Vec<u8>, typecode: u8) -> Result<()> {
        buf.extend_from_slice(MAGIC_PREFIX);
        buf.push(typecode);
        buf.extend_from_slice(&(std::mem::size_of::<i32>() as u8).to_le_bytes());
        debug_assert_eq!(buf.len(), 8);

        let k = self.vals.len() as u32;
        buf.extend_from_slice(&self.nrows.to_le_bytes());
        buf.extend_from_slice(&k.to_le_bytes());
        buf.extend_from_slice(&k.to_le_bytes());
        while buf.len() % 8 != 0 {
            buf.push(0);
        }

        for v in &self.vals {
            buf.extend_from_slice(&v.to_le_bytes());
        }

        let mut bitmap_bytes = Vec::new();
        let mut offsets: Vec<i32> = Vec::with_capacity(self.bits.len() + 1);
        offsets.push(0);
        for slot in &self.bits {
            slot.get().write_to(&mut bitmap_bytes)?;
            offsets.push(bitmap_bytes.len() as i32);
        }
        for o in &offsets {
            buf.extend_from_slice(&o.to_le_bytes());
        }
        buf.extend_from_slice(&bitmap_bytes);
        Ok(())
    }

    pub fn read(path: &Path) -> Result<BitmapIndex> {
        let len = crate::util::files::file_len(path)?;
        let buf = crate::util::files::read_file_range(path, 0, len)?;
        let raw: Arc<[u8]> = Arc::from(buf);
        if raw.len() < 8 || raw[0..6] != *MAGIC_PREFIX {
            return err_at!(BadFormat, msg: "bad BitmapIndex magic in {:?}", path);
        }
        if raw[6] != TYPECODE_RELIC {
            return err_at!(
                BadFormat,
                msg: "unsupported index typecode {} in {:?}",
                raw[6], path
            );
        }
        let (index, _off) = Self::read_prefix(&raw)?;
        Ok(index)
    }

    /// Read the header + base-index body starting at byte 0, returning the
    /// index and the byte offset immediately after its last bitmap (where
    /// a [super::coarse::CoarseBitmap] tail, if any, begins). Every fine
    /// bitmap is left `Unread`, pointing back into `raw`: nothing decodes
    /// until [BitmapIndex::bit]/[BitmapIndex::bits_range] (or a cost-model
    /// query that only needs [BitmapIndex::offsets]) actually asks for it.
    pub(super) fn read_prefix(raw: &Arc<[u8]>) -> Result<(BitmapIndex, usize)> {
        let buf: &[u8] = raw;
        if buf.len() < 8 || &buf[0..6] != MAGIC_PREFIX {
            return err_at!(BadFormat, msg: "bad BitmapIndex magic");
        }
        let mut off = 8usize;
        let nrows = read_u32(buf, &mut off)?;
        let k = read_u32(buf, &mut off)?;
        let _k_repeat = read_u32(buf, &mut off)?;
        while off % 8 != 0 {
            off += 1;
        }

        let mut vals = Vec::with_capacity(k as usize);
        for _ in 0..k {
            vals.push(read_f64(buf, &mut off)?);
        }

        let mut offsets = Vec::with_capacity(k as usize + 1);
        for _ in 0..=k {
            offsets.push(read_i32(buf, &mut off)? as usize);
        }

        let bitmaps_start = off;
        let mut bits = Vec::with_capacity(k as usize);
        for i in 0..k as usize {
            let (start, end) = (bitmaps_start + offsets[i], bitmaps_start + offsets[i + 1]);
            if end > buf.len() || start > end {
                return err_at!(BadFormat, msg: "bitmap range out of bounds");
            }
            bits.push(BitSlot::unread(raw.clone(), start, end));
        }

        Ok((BitmapIndex { nrows, vals, bits }, bitmaps_start + offsets[k as usize]))
    }
}

fn read_u32(buf: &[u8], off: &mut usize) -> Result<u32> {
    if *off + 4 > buf.len() {
        return err_at!(BadFormat, msg: "index file truncated at offset {}", off);
    }
    let v = u32::from_le_bytes(buf[*off..*off + 4].try_into().unwrap());
    *off += 4;
    Ok(v)
}

fn read_i32(buf: &[u8], off: &mut usize) -> Result<i32> {
    if *off + 4 > buf.len() {
        return err_at!(BadFormat, msg: "index file truncated at offset {}", off);
    }
    let v = i32::from_le_bytes(buf[*off..*off + 4].try_into().unwrap());
    *off += 4;
    Ok(v)
}

fn read_f64(buf: &[u8], off: &mut usize) -> Result<f64> {
    if *off + 8 > buf.len() {
        return err_at!(BadFormat, msg: "index file truncated at offset {}", off);
    }
    let v = f64::from_le_bytes(buf[*off..*off + 8].try_into().unwrap());
    *off += 8;
    Ok(v)
}

#[cfg(test)]
mod bitmap_index_test {
    use super::*;
    use crate::index::predicate::Op;

    fn sample() -> BitmapIndex {
        let data = [3.0, 1.0, 4.0, 1.0, 5.0, 9.0, 2.0, 6.0, 5.0, 3.0];
        let values: Vec<(f64, u32)> =
            data.iter().enumerate().map(|(i, &v)| (v, i as u32)).collect();
        BitmapIndex::build(10, values)
    }

    #[test]
    fn test_build_matches_scenario() {
        let idx = sample();
        assert_eq!(idx.vals(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 9.0]);
        assert!(idx.bit(0).contains(1) && idx.bit(0).contains(3));
        assert!(idx.bit(2).contains(0) && idx.bit(2).contains(9));
        assert!(idx.bit(4).contains(4) && idx.bit(4).contains(8));
    }

    #[test]
    fn test_evaluate_ge() {
        let idx = sample();
        let hits = idx.evaluate(&RangePredicate::single(Op::Ge, 5.0));
        let rows: Vec<u32> = hits.iter().collect();
        assert_eq!(rows, vec![4, 5, 7, 8]);
    }

    #[test]
    fn test_sum_bits_matches_direct_union() {
        let idx = sample();
        let span = idx.bits_range(1, 4);
        let direct = union_all(span.iter(), idx.nrows());
        let summed = idx.sum_bits(1, 4);
        assert_eq!(direct, summed);
    }

    #[test]
    fn test_write_read_roundtrip() {
        let idx = sample();
        let dir = std::env::temp_dir().join(format!("fastbit-idx-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("idx");
        idx.write(&path).unwrap();
        let idx2 = BitmapIndex::read(&path).unwrap();
        assert_eq!(idx2.vals(), idx.vals());
        for i in 0..idx.k() {
            assert_eq!(idx.bit(i), idx2.bit(i));
        }
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_read_back_index_activates_lazily() {
        let idx = sample();
        let dir =
            std::env::temp_dir().join(format!("fastbit-idx-lazy-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("idx");
        idx.write(&path).unwrap();

        let idx2 = BitmapIndex::read(&path).unwrap();
        // offsets() is purely a byte-range query; it must not force any
        // bitmap to decode, and the two reads must still agree.
        assert_eq!(idx2.offsets(), idx.offsets());
        // touching one slot doesn't disturb the others.
        assert_eq!(idx2.bit(2), idx.bit(2));
        assert_eq!(idx2.bit(0), idx.bit(0));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_equi_join() {
        let data_a = [1.0, 2.0, 3.0];
        let a = BitmapIndex::build(
            3,
            data_a.iter().enumerate().map(|(i, &v)| (v, i as u32)),
        );
        let data_b = [2.0, 3.0, 4.0];
        let b = BitmapIndex::build(
            3,
            data_b.iter().enumerate().map(|(i, &v)| (v, i as u32)),
        );
        let mask_a = Bitvector::from_ordinals([0, 1, 2], 3);
        let mask_b = Bitvector::from_ordinals([0, 1, 2], 3);
        let pairs = a.equi_join(&b, &mask_a, &mask_b);
        assert_eq!(pairs.len(), 2);
    }
}
