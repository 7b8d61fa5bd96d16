//! Minimal stand-in for the externally-opaque row identifier. RID generation
//! itself is out of scope here, but [super::Bundle]'s `rids[]` machinery
//! needs a concrete fixed-size value to carry and persist.

/// A row identifier distinguishing rows across partitions: a contiguous
/// array of these is a caller-defined fixed-size struct, typically 16
/// bytes on disk. `(run, row)` mirrors the source's two-`int64` layout.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Rid {
    pub run: i64,
    pub row: i64,
}

pub const RID_SIZE: usize = 16;

impl Rid {
    pub fn new(run: i64, row: i64) -> Rid {
        Rid { run, row }
    }

    pub fn to_le_bytes(self) -> [u8; RID_SIZE] {
        let mut out = [0u8; RID_SIZE];
        out[..8].copy_from_slice(&self.run.to_le_bytes());
        out[8..].copy_from_slice(&self.row.to_le_bytes());
        out
    }

    pub fn from_le_bytes(bytes: &[u8]) -> Rid {
        Rid {
            run: i64::from_le_bytes(bytes[0..8].try_into().unwrap()),
            row: i64::from_le_bytes(bytes[8..16].try_into().unwrap()),
        }
    }
}

#[cfg(test)]
mod rid_test {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let r = Rid::new(3, 41);
        assert_eq!(Rid::from_le_bytes(&r.to_le_bytes()), r);
    }
}
