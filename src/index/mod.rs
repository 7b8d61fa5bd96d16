//! Column indices: [BitmapIndex] (RELIC) and its coarse two-level
//! refinements [CoarseBitmap] (bylt/fuzz/zona), plus the range
//! predicate type they evaluate against.

pub mod bitmap_index;
pub mod coarse;
pub mod predicate;

pub use bitmap_index::{BitmapIndex, TYPECODE_RELIC};
pub use coarse::{CoarseBitmap, Variant, MIN_K_FOR_COARSE};
pub use predicate::{Bound, Op, RangePredicate};
