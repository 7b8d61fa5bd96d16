//! Tagged-variant `ColumnValues` over the source's closed dispatch family
//! `{int, uint, long, ulong, float, double}` ("Dynamic dispatch on
//! ColumnValues"): one arm per element type, monomorphized methods, and a
//! single dispatch point at the outer loop boundary rather than per-element
//! virtual calls.

use std::cmp::Ordering;

use crate::{err_at, storage::TypedArray, Error, Result};

/// Element type tag, persisted alongside `elementSize` so a bundle file can
/// be re-typed on read (the column's native type otherwise lives in the
/// parent schema, which is out of scope here).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnTag {
    Int,
    UInt,
    Long,
    ULong,
    Float,
    Double,
}

impl ColumnTag {
    pub fn elem_size(self) -> usize {
        match self {
            ColumnTag::Int | ColumnTag::UInt | ColumnTag::Float => 4,
            ColumnTag::Long | ColumnTag::ULong | ColumnTag::Double => 8,
        }
    }
}

#[derive(Clone, Debug)]
pub enum ColumnValues {
    Int(TypedArray<i32>),
    UInt(TypedArray<u32>),
    Long(TypedArray<i64>),
    ULong(TypedArray<u64>),
    Float(TypedArray<f32>),
    Double(TypedArray<f64>),
}

impl ColumnValues {
    pub fn tag(&self) -> ColumnTag {
        match self {
            ColumnValues::Int(_) => ColumnTag::Int,
            ColumnValues::UInt(_) => ColumnTag::UInt,
            ColumnValues::Long(_) => ColumnTag::Long,
            ColumnValues::ULong(_) => ColumnTag::ULong,
            ColumnValues::Float(_) => ColumnTag::Float,
            ColumnValues::Double(_) => ColumnTag::Double,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ColumnValues::Int(a) => a.len(),
            ColumnValues::UInt(a) => a.len(),
            ColumnValues::Long(a) => a.len(),
            ColumnValues::ULong(a) => a.len(),
            ColumnValues::Float(a) => a.len(),
            ColumnValues::Double(a) => a.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Widen element `i` to `f64`, the common currency for sort keys and
    /// aggregation ("AVG, SUM, ... promoted to double").
    pub fn as_f64(&self, i: usize) -> f64 {
        match self {
            ColumnValues::Int(a) => a[i] as f64,
            ColumnValues::UInt(a) => a[i] as f64,
            ColumnValues::Long(a) => a[i] as f64,
            ColumnValues::ULong(a) => a[i] as f64,
            ColumnValues::Float(a) => a[i] as f64,
            ColumnValues::Double(a) => a[i],
        }
    }

    pub fn compare(&self, i: usize, j: usize) -> Ordering {
        self.as_f64(i).partial_cmp(&self.as_f64(j)).unwrap_or(Ordering::Equal)
    }

    /// Select elements by position, in the given order (used both for
    /// sort-permutation application and for group-boundary segmentation).
    pub fn take(&self, order: &[usize]) -> ColumnValues {
        match self {
            ColumnValues::Int(a) => {
                ColumnValues::Int(TypedArray::from_vec(order.iter().map(|&i| a[i]).collect()))
            }
            ColumnValues::UInt(a) => {
                ColumnValues::UInt(TypedArray::from_vec(order.iter().map(|&i| a[i]).collect()))
            }
            ColumnValues::Long(a) => {
                ColumnValues::Long(TypedArray::from_vec(order.iter().map(|&i| a[i]).collect()))
            }
            ColumnValues::ULong(a) => {
                ColumnValues::ULong(TypedArray::from_vec(order.iter().map(|&i| a[i]).collect()))
            }
            ColumnValues::Float(a) => {
                ColumnValues::Float(TypedArray::from_vec(order.iter().map(|&i| a[i]).collect()))
            }
            ColumnValues::Double(a) => {
                ColumnValues::Double(TypedArray::from_vec(order.iter().map(|&i| a[i]).collect()))
            }
        }
    }

    /// Force this column's native type to `double`, widening every element
    /// (aggregate columns for `AVG`/`SUM`/`VARPOP`/`VARSAMP`/`STDPOP`/
    /// `STDSAMP` are promoted before the aggregator runs).
    pub fn to_double(&self) -> ColumnValues {
        ColumnValues::Double(TypedArray::from_vec((0..self.len()).map(|i| self.as_f64(i)).collect()))
    }

    pub fn write_block(&self, buf: &mut Vec<u8>) {
        match self {
            ColumnValues::Int(a) => {
                for v in a.as_slice() {
                    buf.extend_from_slice(&v.to_le_bytes());
                }
            }
            ColumnValues::UInt(a) => {
                for v in a.as_slice() {
                    buf.extend_from_slice(&v.to_le_bytes());
                }
            }
            ColumnValues::Long(a) => {
                for v in a.as_slice() {
                    buf.extend_from_slice(&v.to_le_bytes());
                }
            }
            ColumnValues::ULong(a) => {
                for v in a.as_slice() {
                    buf.extend_from_slice(&v.to_le_bytes());
                }
            }
            ColumnValues::Float(a) => {
                for v in a.as_slice() {
                    buf.extend_from_slice(&v.to_le_bytes());
                }
            }
            ColumnValues::Double(a) => {
                for v in a.as_slice() {
                    buf.extend_from_slice(&v.to_le_bytes());
                }
            }
        }
    }

    pub fn read_block(tag: ColumnTag, bytes: &[u8], n: usize) -> Result<ColumnValues> {
        let want = n * tag.elem_size();
        if bytes.len() < want {
            return err_at!(BadFormat, msg: "column block truncated: want {} have {}", want, bytes.len());
        }
        Ok(match tag {
            ColumnTag::Int => ColumnValues::Int(TypedArray::from_vec(
                bytes[..want].chunks_exact(4).map(|c| i32::from_le_bytes(c.try_into().unwrap())).collect(),
            )),
            ColumnTag::UInt => ColumnValues::UInt(TypedArray::from_vec(
                bytes[..want].chunks_exact(4).map(|c| u32::from_le_bytes(c.try_into().unwrap())).collect(),
            )),
            ColumnTag::Long => ColumnValues::Long(TypedArray::from_vec(
                bytes[..want].chunks_exact(8).map(|c| i64::from_le_bytes(c.try_into().unwrap())).collect(),
            )),
            ColumnTag::ULong => ColumnValues::ULong(TypedArray::from_vec(
                bytes[..want].chunks_exact(8).map(|c| u64::from_le_bytes(c.try_into().unwrap())).collect(),
            )),
            ColumnTag::Float => ColumnValues::Float(TypedArray::from_vec(
                bytes[..want].chunks_exact(4).map(|c| f32::from_le_bytes(c.try_into().unwrap())).collect(),
            )),
            ColumnTag::Double => ColumnValues::Double(TypedArray::from_vec(
                bytes[..want].chunks_exact(8).map(|c| f64::from_le_bytes(c.try_into().unwrap())).collect(),
            )),
        })
    }
}

/// Aggregation kinds recognized by a Bundle's projection list.
/// `Avg`/`Sum`/`Varpop`/`Varsamp`/`Stdpop`/`Stdsamp` promote their column to
/// `double` before running; `Min`/`Max`/`Count` keep the column's native type
/// (`Count` is reported as `f64` here purely for storage uniformity, never
/// as a promotion of the *input* column).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Aggregator {
    Min,
    Max,
    Count,
    Sum,
    Avg,
    Varpop,
    Varsamp,
    Stdpop,
    Stdsamp,
}

impl Aggregator {
    pub fn promotes_to_double(self) -> bool {
        matches!(
            self,
            Aggregator::Avg
                | Aggregator::Sum
                | Aggregator::Varpop
                | Aggregator::Varsamp
                | Aggregator::Stdpop
                | Aggregator::Stdsamp
        )
    }

    /// Reduce one segment's values to a single `f64` ("apply the
    /// listed aggregator to each segment").
    pub fn apply(self, values: &[f64]) -> f64 {
        let n = values.len();
        if n == 0 {
            return 0.0;
        }
        match self {
            Aggregator::Min => values.iter().cloned().fold(f64::INFINITY, f64::min),
            Aggregator::Max => values.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
            Aggregator::Count => n as f64,
            Aggregator::Sum => values.iter().sum(),
            Aggregator::Avg => values.iter().sum::<f64>() / n as f64,
            Aggregator::Varpop | Aggregator::Varsamp => {
                let mean = values.iter().sum::<f64>() / n as f64;
                let ss: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
                let denom = if self == Aggregator::Varsamp { (n - 1).max(1) } else { n };
                ss / denom as f64
            }
            Aggregator::Stdpop | Aggregator::Stdsamp => {
                let variance_kind =
                    if self == Aggregator::Stdsamp { Aggregator::Varsamp } else { Aggregator::Varpop };
                variance_kind.apply(values).sqrt()
            }
        }
    }
}
