//! Two-level coarsening on top of [BitmapIndex]: range-equality
//! (`bylt`), interval-equality (`fuzz`), and equality-equality (`zona`),
//! sharing one file layout and cost-based plan selection.

use std::{path::Path, sync::Arc};

use crate::{
    err_at,
    index::bitmap_index::BitSlot,
    storage::{union_all, Bitvector},
    util::files,
    Error, Result,
};

use super::{bitmap_index::BitmapIndex, predicate::RangePredicate};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Variant {
    /// `cbits[j]` = union of `bits[0..cbounds[j+1])`; `C-1` coarse bitmaps.
    Bylt,
    /// `cbits[j]` = union of a sliding window of width ~C/2.
    Fuzz,
    /// `cbits[j]` = union of the disjoint group `bits[cbounds[j]..cbounds[j+1])`.
    Zona,
}

impl Variant {
    fn default_ncoarse(self) -> usize {
        match self {
            Variant::Bylt => 16,
            Variant::Fuzz => 16,
            Variant::Zona => 11,
        }
    }

    fn typecode(self) -> u8 {
        match self {
            Variant::Bylt => 3,
            Variant::Fuzz => 4,
            Variant::Zona => 5,
        }
    }

    fn from_typecode(code: u8) -> Result<Variant> {
        match code {
            3 => Ok(Variant::Bylt),
            4 => Ok(Variant::Fuzz),
            5 => Ok(Variant::Zona),
            other => err_at!(BadFormat, msg: "unrecognized coarse-bitmap typecode {}", other),
        }
    }
}

/// The coarse-bitmap minimum build threshold ("built only if K >= 32").
pub const MIN_K_FOR_COARSE: usize = 32;

#[derive(Debug)]
pub struct CoarseBitmap {
    base: BitmapIndex,
    variant: Variant,
    /// Strictly increasing indices into `base`'s fine bitmaps partitioning
    /// them into `C` contiguous groups; length `C+1`.
    cbounds: Vec<u32>,
    cbits: Vec<BitSlot>,
}

impl Clone for CoarseBitmap {
    fn clone(&self) -> CoarseBitmap {
        CoarseBitmap {
            base: self.base.clone(),
            variant: self.variant,
            cbounds: self.cbounds.clone(),
            cbits: self.cbits.iter().map(BitSlot::clone).collect(),
        }
    }
}

impl CoarseBitmap {
    /// Build the coarse tail over an already-built [BitmapIndex]; returns
    /// `None` when `K < 32`, in which case callers should use the
    /// base index directly.
    pub fn build(base: BitmapIndex, variant: Variant, ncoarse: Option<usize>) -> Option<CoarseBitmap> {
        if base.k() < MIN_K_FOR_COARSE {
            return None;
        }
        let c = ncoarse.unwrap_or_else(|| variant.default_ncoarse()).max(1);
        let cbounds = partition_by_bytes(&base, c);
        let cbits = build_cbits(&base, variant, &cbounds)
            .into_iter()
            .map(BitSlot::loaded)
            .collect();
        Some(CoarseBitmap { base, variant, cbounds, cbits })
    }

    pub fn base(&self) -> &BitmapIndex {
        &self.base
    }

    pub fn variant(&self) -> Variant {
        self.variant
    }

    pub fn cbounds(&self) -> &[u32] {
        &self.cbounds
    }

    /// Activate and return coarse bitmap `g`.
    pub fn cbit(&self, g: usize) -> Bitvector {
        self.cbits[g].get()
    }

    /// Activate and return every coarse bitmap. Prefer [CoarseBitmap::cbit]
    /// when only one group is needed: [CoarseBitmap::evaluate] never calls
    /// this.
    pub fn cbits(&self) -> Vec<Bitvector> {
        self.cbits.iter().map(BitSlot::get).collect()
    }

    fn coffsets(&self) -> Vec<u64> {
        let mut offsets = Vec::with_capacity(self.cbits.len() + 1);
        let mut acc = 0u64;
        offsets.push(acc);
        for b in &self.cbits {
            acc += b.byte_len() as u64;
            offsets.push(acc);
        }
        offsets
    }

    /// `evaluate`: compare the fine-only plan against every coarse-assisted
    /// plan that applies to `[hit0, hit1)` and execute whichever the
    /// byte-cost model says is cheapest, rounding up to fine-only when
    /// within 1% of it ("prefer simplicity"):
    ///
    /// - fine-only: [BitmapIndex::sum_bits]'s own direct/complement choice.
    /// - span ("undershoot"): the largest coarse group fully contained in
    ///   `[hit0, hit1)`, plus the fine edges on either side, unioned in.
    /// - cover ("overshoot"): the smallest coarse group fully containing
    ///   `[hit0, hit1)`, with the fine excess on either side subtracted
    ///   out. This is what makes `Bylt`'s prefix-union coarse bitmaps
    ///   useful beyond `hit0 == 0`: a prefix group only ever satisfies
    ///   "span" when it starts at row 0, but it satisfies "cover" any time
    ///   it reaches far enough to contain `hit1`, regardless of `hit0`.
    /// - zona complement (`Zona` only): the complement of `[hit0, hit1)`
    ///   split at the hit boundary, each flank covered by its own
    ///   cheapest span plan (Zona's groups are a disjoint partition, so a
    ///   flank is often exactly a few whole coarse groups).
    pub fn evaluate(&self, predicate: &RangePredicate) -> Bitvector {
        let (hit0, hit1) = self.base.locate(predicate);
        if hit0 >= hit1 {
            return Bitvector::with_size(self.base.nrows());
        }
        if hit0 == 0 && hit1 == self.base.k() as u32 {
            return self.base.evaluate(predicate);
        }

        let offsets = self.base.offsets();
        let fine_cost = offsets[hit1 as usize] - offsets[hit0 as usize];
        let mut best_cost = (fine_cost as f64) * 0.99;
        let mut plan = Plan::Fine;

        if let Some((cost, g, glo, ghi)) = self.span_cost_and_group(hit0, hit1) {
            if (cost as f64) < best_cost {
                best_cost = cost as f64;
                plan = Plan::Span(g, glo, ghi);
            }
        }
        if let Some((cost, g, glo, ghi)) = self.cover_cost_and_group(hit0, hit1) {
            if (cost as f64) < best_cost {
                best_cost = cost as f64;
                plan = Plan::Cover(g, glo, ghi);
            }
        }
        if let Some(cost) = self.zona_complement_cost(hit0, hit1) {
            if (cost as f64) < best_cost {
                plan = Plan::ZonaComplement;
            }
        }

        match plan {
            Plan::Fine => self.base.sum_bits(hit0, hit1),
            Plan::Span(g, glo, ghi) => self.evaluate_span(hit0, hit1, g, glo, ghi),
            Plan::Cover(g, glo, ghi) => self.evaluate_cover(hit0, hit1, g, glo, ghi),
            Plan::ZonaComplement => self.evaluate_zona_complement(hit0, hit1),
        }
    }

    /// Fine-only plan, walked high-to-low. Functionally identical to the
    /// ascending fine fallback inside [CoarseBitmap::evaluate] (union is
    /// order-independent), offered as a separate entry point for callers
    /// that want to force the fine-only path without going through coarse
    /// plan selection at all.
    pub fn evaluate_fine_descending(&self, predicate: &RangePredicate) -> Bitvector {
        let (hit0, hit1) = self.base.locate(predicate);
        if hit0 >= hit1 {
            return Bitvector::with_size(self.base.nrows());
        }
        let span = self.base.bits_range(hit0 as usize, hit1 as usize);
        union_all(span.iter().rev(), self.base.nrows())
    }

    /// Largest coarse group fully CONTAINED in `[lo, hi)` ("undershoot"):
    /// cost of that one coarse bitmap plus the fine bitmaps needed to
    /// cover the uncovered edges.
    fn span_cost_and_group(&self, lo: u32, hi: u32) -> Option<(u64, usize, u32, u32)> {
        let offsets = self.base.offsets();
        let coffsets = self.coffsets();
        let mut best: Option<(u64, usize, u32, u32)> = None;
        for g in 0..self.cbits.len() {
            let (glo, ghi) = self.group_fine_range(g);
            if glo >= lo && ghi <= hi {
                let edge_cost = (offsets[glo as usize] - offsets[lo as usize])
                    + (offsets[hi as usize] - offsets[ghi as usize]);
                let cost = (coffsets[g + 1] - coffsets[g]) + edge_cost;
                if best.map_or(true, |(c, ..)| cost < c) {
                    best = Some((cost, g, glo, ghi));
                }
            }
        }
        best
    }

    /// Smallest coarse group fully COVERING `[lo, hi)` ("overshoot"): cost
    /// of that coarse bitmap plus the fine excess on either side, which
    /// `evaluate_cover` subtracts out rather than unions in.
    fn cover_cost_and_group(&self, lo: u32, hi: u32) -> Option<(u64, usize, u32, u32)> {
        let offsets = self.base.offsets();
        let coffsets = self.coffsets();
        let mut best: Option<(u64, usize, u32, u32)> = None;
        for g in 0..self.cbits.len() {
            let (glo, ghi) = self.group_fine_range(g);
            if glo <= lo && ghi >= hi && (glo < lo || ghi > hi) {
                let excess_cost = (offsets[lo as usize] - offsets[glo as usize])
                    + (offsets[ghi as usize] - offsets[hi as usize]);
                let cost = (coffsets[g + 1] - coffsets[g]) + excess_cost;
                if best.map_or(true, |(c, ..)| cost < c) {
                    best = Some((cost, g, glo, ghi));
                }
            }
        }
        best
    }

    /// The `[lo, hi)` range of fine-bitmap indices that coarse group `g`
    /// summarizes, per variant (table).
    fn group_fine_range(&self, g: usize) -> (u32, u32) {
        match self.variant {
            Variant::Bylt => (0, self.cbounds[g + 1]),
            Variant::Zona => (self.cbounds[g], self.cbounds[g + 1]),
            Variant::Fuzz => {
                let c = self.cbounds.len().saturating_sub(1);
                let half = fuzz_half(c);
                let lo_idx = g.saturating_sub(1);
                let hi_idx = (g + half).min(self.cbounds.len() - 1);
                (self.cbounds[lo_idx], self.cbounds[hi_idx])
            }
        }
    }

    fn evaluate_span(&self, lo: u32, hi: u32, g: usize, glo: u32, ghi: u32) -> Bitvector {
        let mut out = self.cbit(g);
        if lo < glo {
            out |= &self.base.sum_bits(lo, glo);
        }
        if ghi < hi {
            out |= &self.base.sum_bits(ghi, hi);
        }
        out
    }

    fn evaluate_cover(&self, lo: u32, hi: u32, g: usize, glo: u32, ghi: u32) -> Bitvector {
        let mut out = self.cbit(g);
        if glo < lo {
            out -= &self.base.sum_bits(glo, lo);
        }
        if ghi > hi {
            out -= &self.base.sum_bits(hi, ghi);
        }
        out
    }

    /// `Zona`-only: cost of covering `[0, hit0)` and `[hit1, K)` each by
    /// their own cheapest span plan (falling back to a fine sum when no
    /// group fits), which is the cost of building the complement that
    /// [CoarseBitmap::evaluate_zona_complement] then subtracts from the
    /// universe.
    fn zona_complement_cost(&self, hit0: u32, hit1: u32) -> Option<u64> {
        if self.variant != Variant::Zona {
            return None;
        }
        let k = self.base.k() as u32;
        if hit0 == 0 && hit1 == k {
            return None;
        }
        Some(self.flank_cost(0, hit0) + self.flank_cost(hit1, k))
    }

    fn flank_cost(&self, lo: u32, hi: u32) -> u64 {
        if lo >= hi {
            return 0;
        }
        let offsets = self.base.offsets();
        let fine = offsets[hi as usize] - offsets[lo as usize];
        match self.span_cost_and_group(lo, hi) {
            Some((cost, ..)) => cost.min(fine),
            None => fine,
        }
    }

    fn flank_bits(&self, lo: u32, hi: u32) -> Bitvector {
        if lo >= hi {
            return Bitvector::with_size(self.base.nrows());
        }
        let offsets = self.base.offsets();
        let fine = offsets[hi as usize] - offsets[lo as usize];
        match self.span_cost_and_group(lo, hi) {
            Some((cost, g, glo, ghi)) if (cost as f64) < fine as f64 * 0.99 => {
                self.evaluate_span(lo, hi, g, glo, ghi)
            }
            _ => self.base.sum_bits(lo, hi),
        }
    }

    fn evaluate_zona_complement(&self, hit0: u32, hit1: u32) -> Bitvector {
        let mut full = Bitvector::with_size(self.base.nrows());
        for b in 0..self.base.nrows() {
            full.set(b, 1);
        }
        let lo_piece = self.flank_bits(0, hit0);
        let hi_piece = self.flank_bits(hit1, self.base.k() as u32);
        full -= &lo_piece;
        full -= &hi_piece;
        full
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let mut buf = Vec::new();
        self.base.write_prefix(&mut buf, self.variant.typecode())?;

        let c = (self.cbounds.len() - 1) as u32;
        buf.extend_from_slice(&c.to_le_bytes());
        for b in &self.cbounds {
            buf.extend_from_slice(&b.to_le_bytes());
        }

        let mut bitmap_bytes = Vec::new();
        let mut coffsets: Vec<i32> = Vec::with_capacity(self.cbits.len() + 1);
        coffsets.push(0);
        for slot in &self.cbits {
            slot.get().write_to(&mut bitmap_bytes)?;
            coffsets.push(bitmap_bytes.len() as i32);
        }
        for o in &coffsets {
            buf.extend_from_slice(&o.to_le_bytes());
        }
        buf.extend_from_slice(&bitmap_bytes);

        files::write_whole_file(path, &buf)
    }

    pub fn read(path: &Path, variant: Variant) -> Result<CoarseBitmap> {
        let len = files::file_len(path)?;
        let buf = files::read_file_range(path, 0, len)?;
        let raw: Arc<[u8]> = Arc::from(buf);
        if raw.len() < 7 {
            return err_at!(BadFormat, msg: "coarse-bitmap file {:?} too short", path);
        }
        let found = Variant::from_typecode(raw[6])?;
        if found != variant {
            return err_at!(
                BadFormat,
                msg: "coarse-bitmap typecode mismatch in {:?}: expected {:?}, file says {:?}",
                path, variant, found
            );
        }
        let (base, mut off) = BitmapIndex::read_prefix(&raw)?;

        if off + 4 > raw.len() {
            return err_at!(BadFormat, msg: "coarse-bitmap tail truncated in {:?}", path);
        }
        let c = u32::from_le_bytes(raw[off..off + 4].try_into().unwrap()) as usize;
        off += 4;
        let mut cbounds = Vec::with_capacity(c + 1);
        for _ in 0..=c {
            if off + 4 > raw.len() {
                return err_at!(BadFormat, msg: "coarse cbounds truncated in {:?}", path);
            }
            cbounds.push(u32::from_le_bytes(raw[off..off + 4].try_into().unwrap()));
            off += 4;
        }

        let ncbits = group_count(variant, c);
        let mut coffsets = Vec::with_capacity(ncbits + 1);
        for _ in 0..=ncbits {
            if off + 4 > raw.len() {
                return err_at!(BadFormat, msg: "coarse coffsets truncated in {:?}", path);
            }
            coffsets.push(i32::from_le_bytes(raw[off..off + 4].try_into().unwrap()) as usize);
            off += 4;
        }

        let bitmaps_start = off;
        let mut cbits = Vec::with_capacity(ncbits);
        for i in 0..ncbits {
            let (start, end) = (bitmaps_start + coffsets[i], bitmaps_start + coffsets[i + 1]);
            if end > raw.len() || start > end {
                return err_at!(BadFormat, msg: "coarse bitmap range out of bounds in {:?}", path);
            }
            cbits.push(BitSlot::unread(raw.clone(), start, end));
        }

        Ok(CoarseBitmap { base, variant, cbounds, cbits })
    }
}

enum Plan {
    Fine,
    Span(usize, u32, u32),
    Cover(usize, u32, u32),
    ZonaComplement,
}

/// `ceil(C/2)`, the sliding-window half-width shared by [group_count],
/// [build_cbits] and [CoarseBitmap::group_fine_range] for the `Fuzz` variant.
fn fuzz_half(c: usize) -> usize {
    (c + 1) / 2
}

fn group_count(variant: Variant, c: usize) -> usize {
    match variant {
        Variant::Bylt => c.saturating_sub(1).max(1),
 // C - ceil(C/2) + 1 (table, interval-equality).
        Variant::Fuzz => c.saturating_sub(fuzz_half(c)).saturating_add(1).max(1),
        Variant::Zona => c,
    }
}

/// Choose `cbounds` so each of `c` groups covers approximately equal total
/// fine-bitmap bytes ("Coarsening"); adjacent equal bounds advance by 1.
fn partition_by_bytes(base: &BitmapIndex, c: usize) -> Vec<u32> {
    let offsets = base.offsets();
    let total = *offsets.last().unwrap();
    let k = base.k() as u32;
    let mut cbounds = Vec::with_capacity(c + 1);
    cbounds.push(0u32);
    for g in 1..c {
        let target = total * g as u64 / c as u64;
        let idx = offsets.partition_point(|&o| o < target) as u32;
        let idx = idx.clamp(*cbounds.last().unwrap() + 1, k);
        cbounds.push(idx);
    }
    cbounds.push(k);
    cbounds.dedup();
    while cbounds.len() < 2 {
        cbounds.push(k);
    }
    cbounds
}

fn build_cbits(base: &BitmapIndex, variant: Variant, cbounds: &[u32]) -> Vec<Bitvector> {
    let c = cbounds.len() - 1;
    let n = base.nrows();
    let bits = base.bits_range(0, base.k());
    match variant {
        Variant::Bylt => (0..c)
            .map(|g| union_all(bits[0..cbounds[g + 1] as usize].iter(), n))
            .collect(),
        Variant::Zona => (0..c)
            .map(|g| {
                union_all(bits[cbounds[g] as usize..cbounds[g + 1] as usize].iter(), n)
            })
            .collect(),
        Variant::Fuzz => {
            let half = fuzz_half(c);
            let ngroups = group_count(Variant::Fuzz, c);
            (0..ngroups)
                .map(|g| {
                    let lo_idx = g.saturating_sub(1).min(cbounds.len() - 1);
                    let hi_idx = (g + half).min(cbounds.len() - 1);
                    union_all(
                        bits[cbounds[lo_idx] as usize..cbounds[hi_idx] as usize].iter(),
                        n,
                    )
                })
                .collect()
        }
    }
}

#[cfg(test)]
mod coarse_test {
    use super::*;
    use crate::index::predicate::Op;

    fn sample(k: usize) -> BitmapIndex {
        let values: Vec<(f64, u32)> = (0..k as u32 * 3)
            .map(|row| ((row % k as u32) as f64, row))
            .collect();
        BitmapIndex::build(k as u32 * 3, values)
    }

    #[test]
    fn test_too_small_returns_none() {
        let base = sample(10);
        assert!(CoarseBitmap::build(base, Variant::Zona, None).is_none());
    }

    #[test]
    fn test_zona_groups_consistent() {
        let base = sample(40);
        let coarse = CoarseBitmap::build(base, Variant::Zona, Some(8)).unwrap();
        assert_eq!(coarse.cbits().len(), 8);
        for g in 0..8 {
            let (lo, hi) = (coarse.cbounds()[g] as usize, coarse.cbounds()[g + 1] as usize);
            let fine = coarse.base().bits_range(lo, hi);
            let expect = crate::storage::union_all(fine.iter(), coarse.base().nrows());
            assert_eq!(coarse.cbit(g), expect);
        }
    }

    #[test]
    fn test_evaluate_matches_base_bylt() {
        let base = sample(60);
        let coarse = CoarseBitmap::build(base.clone(), Variant::Bylt, Some(10)).unwrap();
        let predicate = RangePredicate::between(Op::Le, 5.0, Op::Le, 40.0);
        assert_eq!(coarse.evaluate(&predicate), base.evaluate(&predicate));
    }

    #[test]
    fn test_evaluate_matches_base_fuzz() {
        let base = sample(60);
        let coarse = CoarseBitmap::build(base.clone(), Variant::Fuzz, Some(10)).unwrap();
        let predicate = RangePredicate::between(Op::Le, 5.0, Op::Le, 40.0);
        assert_eq!(coarse.evaluate(&predicate), base.evaluate(&predicate));
    }

    #[test]
    fn test_evaluate_matches_base_zona() {
        let base = sample(60);
        let coarse = CoarseBitmap::build(base.clone(), Variant::Zona, Some(10)).unwrap();
        let predicate = RangePredicate::between(Op::Le, 5.0, Op::Le, 40.0);
        assert_eq!(coarse.evaluate(&predicate), base.evaluate(&predicate));
    }

    /// A range whose lower edge sits mid-file exercises Bylt's "cover"
    /// plan: no prefix group starts at `hit0 > 0`, so the old span-only
    /// selection fell back to fine-only here; cover should now fire
    /// whenever a prefix reaches far enough to contain `hit1`.
    #[test]
    fn test_bylt_cover_plan_matches_base() {
        let base = sample(80);
        let coarse = CoarseBitmap::build(base.clone(), Variant::Bylt, Some(16)).unwrap();
        let predicate = RangePredicate::between(Op::Le, 30.0, Op::Le, 45.0);
        assert_eq!(coarse.evaluate(&predicate), base.evaluate(&predicate));
    }

    #[test]
    fn test_zona_complement_plan_matches_base() {
        let base = sample(120);
        let coarse = CoarseBitmap::build(base.clone(), Variant::Zona, Some(12)).unwrap();
        // a wide middle-of-range predicate leaves two substantial flanks,
        // making the complement plan's cost genuinely competitive.
        let predicate = RangePredicate::between(Op::Le, 10.0, Op::Le, 108.0);
        assert_eq!(coarse.evaluate(&predicate), base.evaluate(&predicate));
    }

    #[test]
    fn test_evaluate_fine_descending_matches_base() {
        let base = sample(60);
        let coarse = CoarseBitmap::build(base.clone(), Variant::Zona, Some(10)).unwrap();
        let predicate = RangePredicate::between(Op::Le, 5.0, Op::Le, 40.0);
        assert_eq!(coarse.evaluate_fine_descending(&predicate), base.evaluate(&predicate));
    }

    #[test]
    fn test_write_read_roundtrip() {
        let base = sample(40);
        let coarse = CoarseBitmap::build(base, Variant::Zona, Some(8)).unwrap();
        let dir = std::env::temp_dir().join(format!("fastbit-coarse-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("coarse-idx");
        coarse.write(&path).unwrap();
        let coarse2 = CoarseBitmap::read(&path, Variant::Zona).unwrap();
        assert_eq!(coarse.cbounds(), coarse2.cbounds());
        assert_eq!(coarse.cbits().len(), coarse2.cbits().len());
        std::fs::remove_dir_all(&dir).ok();
    }
}
