//! Compressed bit-per-row vector. The originating tree treats this as an
//! opaque black box; here it is backed by a real compressed bitmap,
//! [roaring::RoaringBitmap].

use roaring::RoaringBitmap;

use std::ops::{BitAndAssign, BitOrAssign, SubAssign};

use crate::{err_at, Error, Result};

/// A set of row ordinals with a fixed logical length (`size`), bitwise
/// union/intersection/difference, and a byte-exact on-disk encoding.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Bitvector {
    bits: RoaringBitmap,
    /// Logical length in bits; ordinals `>= size` are never set.
    size: u32,
}

impl Bitvector {
    pub fn new() -> Bitvector {
        Bitvector { bits: RoaringBitmap::new(), size: 0 }
    }

    pub fn with_size(size: u32) -> Bitvector {
        Bitvector { bits: RoaringBitmap::new(), size }
    }

    /// Build from an explicit set of ordinals, sized to fit them all unless
    /// `size` is given larger.
    pub fn from_ordinals(ordinals: impl IntoIterator<Item = u32>, size: u32) -> Bitvector {
        let mut bits = RoaringBitmap::new();
        let mut max_seen = 0u32;
        for o in ordinals {
            max_seen = max_seen.max(o + 1);
            bits.insert(o);
        }
        Bitvector { bits, size: size.max(max_seen) }
    }

    /// `size()`: logical length in bits.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// `cnt()`: number of set bits.
    pub fn cnt(&self) -> u64 {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn contains(&self, bit: u32) -> bool {
        self.bits.contains(bit)
    }

    /// `set(bit, n)`: set (`n != 0`) or clear (`n == 0`) a single bit,
    /// extending `size` if `bit >= size`.
    pub fn set(&mut self, bit: u32, n: u32) {
        if n != 0 {
            self.bits.insert(bit);
        } else {
            self.bits.remove(bit);
        }
        if bit >= self.size {
            self.size = bit + 1;
        }
    }

    /// `setSize(n)`: change the logical length, clearing any bits at or
    /// beyond the new size when shrinking.
    pub fn set_size(&mut self, n: u32) {
        if n < self.size {
            self.bits.remove_range(u64::from(n)..u64::from(self.size));
        }
        self.size = n;
    }

    /// `adjustSize(lo, n)`: reinterpret this vector as starting at ordinal
    /// `lo` within a universe of `n` bits — ordinals below `lo` are
    /// dropped and shifted down by `lo`, then the result is sized to `n`.
    pub fn adjust_size(&mut self, lo: u32, n: u32) {
        if lo > 0 {
            let shifted: RoaringBitmap =
                self.bits.iter().filter(|&b| b >= lo).map(|b| b - lo).collect();
            self.bits = shifted;
        }
        self.set_size(n);
    }

    /// `copy()`: deep clone.
    pub fn copy(&self) -> Bitvector {
        self.clone()
    }

    /// `bytes()`: size of the serialized form, in bytes.
    pub fn bytes(&self) -> usize {
        self.bits.serialized_size()
    }

    pub fn write_to(&self, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(&self.size.to_le_bytes());
        err_at!(IOError, self.bits.serialize_into(out))?;
        Ok(())
    }

    pub fn read_from(buf: &[u8]) -> Result<(Bitvector, usize)> {
        if buf.len() < 4 {
            return err_at!(BadFormat, msg: "bitvector header truncated");
        }
        let size = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let bits = err_at!(BadFormat, RoaringBitmap::deserialize_from(&buf[4..]))?;
        let consumed = 4 + bits.serialized_size();
        Ok((Bitvector { bits, size }, consumed))
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.bits.iter()
    }
}

impl BitOrAssign<&Bitvector> for Bitvector {
    fn bitor_assign(&mut self, rhs: &Bitvector) {
        self.bits |= &rhs.bits;
        self.size = self.size.max(rhs.size);
    }
}

impl BitAndAssign<&Bitvector> for Bitvector {
    fn bitand_assign(&mut self, rhs: &Bitvector) {
        self.bits &= &rhs.bits;
    }
}

impl SubAssign<&Bitvector> for Bitvector {
    fn sub_assign(&mut self, rhs: &Bitvector) {
        self.bits -= &rhs.bits;
    }
}

/// Union of `parts` into a single Bitvector, used by
/// [crate::index::bitmap_index::BitmapIndex::sum_bits] and coarse-bitmap
/// group construction.
pub fn union_all<'a>(parts: impl IntoIterator<Item = &'a Bitvector>, size: u32) -> Bitvector {
    let mut out = Bitvector::with_size(size);
    for p in parts {
        out |= p;
    }
    out
}

#[cfg(test)]
mod bitvector_test {
    use super::*;

    #[test]
    fn test_set_and_size() {
        let mut bv = Bitvector::with_size(10);
        bv.set(3, 1);
        bv.set(7, 1);
        assert_eq!(bv.cnt(), 2);
        assert!(bv.contains(3));
        bv.set(3, 0);
        assert!(!bv.contains(3));
        assert_eq!(bv.size(), 10);
    }

    #[test]
    fn test_adjust_size() {
        let mut bv = Bitvector::from_ordinals([1, 5, 9], 10);
        bv.adjust_size(5, 5);
        assert_eq!(bv.size(), 5);
        assert!(bv.contains(0));
        assert!(bv.contains(4));
        assert!(!bv.contains(9));
    }

    #[test]
    fn test_roundtrip() {
        let bv = Bitvector::from_ordinals([0, 2, 4, 100], 200);
        let mut buf = Vec::new();
        bv.write_to(&mut buf).unwrap();
        let (bv2, consumed) = Bitvector::read_from(&buf).unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(bv, bv2);
    }

    #[test]
    fn test_union_and_intersect() {
        let a = Bitvector::from_ordinals([1, 2, 3], 10);
        let b = Bitvector::from_ordinals([3, 4, 5], 10);
        let mut u = a.clone();
        u |= &b;
        assert_eq!(u.cnt(), 5);
        let mut i = a.clone();
        i &= &b;
        assert_eq!(i.cnt(), 1);
        assert!(i.contains(3));
    }
}
