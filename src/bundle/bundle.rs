//! Post-query grouping of selected rows by projected columns, with optional
//! per-group aggregation, stable multi-key sort, and group persistence.

use std::{cmp::Ordering, path::Path};

use crate::{
    err_at,
    util::files,
    Error, Result,
};

use super::{
    column_values::{Aggregator, ColumnTag, ColumnValues},
    rid::{Rid, RID_SIZE},
};

/// One projected column: a key to group by (`aggregator: None`) or a column
/// reduced per-group by `aggregator` ("projection list").
pub struct Projection {
    pub values: ColumnValues,
    pub aggregator: Option<Aggregator>,
}

impl Projection {
    pub fn key(values: ColumnValues) -> Projection {
        Projection { values, aggregator: None }
    }

    pub fn aggregate(values: ColumnValues, aggregator: Aggregator) -> Projection {
        Projection { values, aggregator: Some(aggregator) }
    }
}

/// A grouped result set: `cols[c]` holds one representative or
/// aggregated value per group, in the original projection order;
/// `starts[g]..starts[g+1]` delimits group `g`'s rows in the pre-grouping
/// (hit-bitmap) row order; `rids`, if present, is the same row stream
/// reordered to match.
#[derive(Clone, Debug)]
pub struct Bundle {
    cols: Vec<ColumnValues>,
    starts: Vec<u32>,
    rids: Option<Vec<Rid>>,
}

impl Bundle {
    /// Build a Bundle from already-materialized projection columns.
    /// Non-aggregate columns form the grouping key, sorted and
    /// segmented as one composite stable sort rather than the source's
    /// literal recursive per-key resort — the two produce the same final
    /// grouping and order since a composite-key stable sort is equivalent
    /// to sorting by each key in turn, most-significant first.
    pub fn build(projections: Vec<Projection>, rids: Option<Vec<Rid>>) -> Result<Bundle> {
        if projections.is_empty() {
            return err_at!(ArgumentError, msg: "bundle requires at least one projected column");
        }
        let n = projections[0].values.len();
        for p in &projections {
            if p.values.len() != n {
                return err_at!(ArgumentError, msg: "projected columns have mismatched row counts");
            }
        }
        if let Some(r) = &rids {
            if r.len() != n {
                return err_at!(ArgumentError, msg: "rids length does not match row count");
            }
        }

        let key_cols: Vec<&ColumnValues> =
            projections.iter().filter(|p| p.aggregator.is_none()).map(|p| &p.values).collect();
        let order = sort_order(&key_cols, n);
        let starts = group_boundaries(&key_cols, &order);

        let group_reps: Vec<usize> =
            starts[..starts.len() - 1].iter().map(|&s| order[s as usize]).collect();

        let mut cols = Vec::with_capacity(projections.len());
        for p in &projections {
            let col = match p.aggregator {
                None => p.values.take(&group_reps),
                Some(agg) => aggregate_column(&p.values, agg, &order, &starts),
            };
            cols.push(col);
        }

        let rids = rids.map(|r| order.iter().map(|&i| r[i]).collect());

        Ok(Bundle { cols, starts, rids })
    }

    pub fn ngroups(&self) -> usize {
        self.starts.len() - 1
    }

    pub fn nrows(&self) -> u32 {
        *self.starts.last().unwrap_or(&0)
    }

    pub fn cols(&self) -> &[ColumnValues] {
        &self.cols
    }

    pub fn starts(&self) -> &[u32] {
        &self.starts
    }

    pub fn rids(&self) -> Option<&[Rid]> {
        self.rids.as_deref()
    }

    /// `rowCounts(out)`: per-group row counts.
    pub fn row_counts(&self) -> Vec<u32> {
        (0..self.ngroups()).map(|g| self.starts[g + 1] - self.starts[g]).collect()
    }

    /// `readRIDs(i)`: the RID set for group `i`, found by seeking into the
    /// grouped RID stream using `starts`.
    pub fn read_rids(&self, group: usize) -> Option<&[Rid]> {
        let rids = self.rids.as_deref()?;
        let (lo, hi) = (self.starts[group] as usize, self.starts[group + 1] as usize);
        Some(&rids[lo..hi])
    }

    /// `reorder(keyList, direction)`: restrict the sort to the listed
    /// column indices, re-sort groups by them, optionally reverse.
    pub fn reorder(&mut self, key_list: &[usize], descending: bool) {
        let mut order: Vec<usize> = (0..self.ngroups()).collect();
        order.sort_by(|&a, &b| {
            for &k in key_list {
                let c = self.cols[k].compare(a, b);
                if c != Ordering::Equal {
                    return if descending { c.reverse() } else { c };
                }
            }
            Ordering::Equal
        });
        self.apply_group_order(&order);
    }

    /// `truncate(keep [,start])`: keep the first `keep` groups starting at
    /// group `start`, trimming `cols`, `starts`, and `rids` consistently.
    pub fn truncate(&mut self, keep: usize, start: usize) {
        let ngroups = self.ngroups();
        let start = start.min(ngroups);
        let end = (start + keep).min(ngroups);
        let order: Vec<usize> = (start..end).collect();
        self.apply_group_order(&order);
    }

    /// `reverse()`: flip group order and re-thread `starts`.
    pub fn reverse(&mut self) {
        let order: Vec<usize> = (0..self.ngroups()).rev().collect();
        self.apply_group_order(&order);
    }

    /// Re-materialize `cols`, `starts`, and `rids` under a new group order
    /// (also used for arbitrary subsets, as in [Bundle::truncate]).
    fn apply_group_order(&mut self, order: &[usize]) {
        for c in &mut self.cols {
            *c = c.take(order);
        }
        let mut new_starts = Vec::with_capacity(order.len() + 1);
        new_starts.push(0u32);
        let mut acc = 0u32;
        for &g in order {
            acc += self.starts[g + 1] - self.starts[g];
            new_starts.push(acc);
        }
        if let Some(rids) = &self.rids {
            let mut new_rids = Vec::with_capacity(rids.len());
            for &g in order {
                new_rids.extend_from_slice(&rids[self.starts[g] as usize..self.starts[g + 1] as usize]);
            }
            self.rids = Some(new_rids);
        }
        self.starts = new_starts;
    }

    /// Persist in the layout: `bundles` holds `nGroups; nCols;
    /// elementSize[nCols]; column-blocks; starts[nGroups+1]`. `rids_path`,
    /// if given, receives the sibling grouped RID stream.
    pub fn write(&self, path: &Path, rids_path: Option<&Path>) -> Result<()> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(self.ngroups() as u32).to_le_bytes());
        buf.extend_from_slice(&(self.cols.len() as u32).to_le_bytes());
        for c in &self.cols {
            buf.extend_from_slice(&(c.tag().elem_size() as u32).to_le_bytes());
        }
        for c in &self.cols {
            c.write_block(&mut buf);
        }
        for s in &self.starts {
            buf.extend_from_slice(&s.to_le_bytes());
        }
        files::write_whole_file(path, &buf)?;

        if let Some(rp) = rids_path {
            let rids = self
                .rids
                .as_ref()
                .ok_or_else(|| Error::ArgumentError("bundle has no rids to persist".into()))?;
            let mut rbuf = Vec::with_capacity(rids.len() * RID_SIZE);
            for r in rids {
                rbuf.extend_from_slice(&r.to_le_bytes());
            }
            files::write_whole_file(rp, &rbuf)?;
        }
        Ok(())
    }

    /// Read a bundle back. The file itself carries only `elementSize`, not
    /// signedness/float-ness; `tags` supplies that from the caller's
    /// schema, matching how the source locates column type via the parent
    /// `part`/`column` rather than inside the bundle file.
    pub fn read(path: &Path, rids_path: Option<&Path>, tags: &[ColumnTag]) -> Result<Bundle> {
        let len = files::file_len(path)?;
        let buf = files::read_file_range(path, 0, len)?;
        let mut off = 0usize;
        let ngroups = read_u32(&buf, &mut off)? as usize;
        let ncols = read_u32(&buf, &mut off)? as usize;
        if ncols != tags.len() {
            return err_at!(
                ArgumentError,
                msg: "bundle column-type count mismatch: file has {}, caller supplied {}",
                ncols, tags.len()
            );
        }
        let mut elem_sizes = Vec::with_capacity(ncols);
        for _ in 0..ncols {
            elem_sizes.push(read_u32(&buf, &mut off)? as usize);
        }
        let mut cols = Vec::with_capacity(ncols);
        for i in 0..ncols {
            let want = elem_sizes[i] * ngroups;
            if off + want > buf.len() {
                return err_at!(BadFormat, msg: "bundle column block {} truncated in {:?}", i, path);
            }
            cols.push(ColumnValues::read_block(tags[i], &buf[off..off + want], ngroups)?);
            off += want;
        }
        let mut starts = Vec::with_capacity(ngroups + 1);
        for _ in 0..=ngroups {
            starts.push(read_u32(&buf, &mut off)?);
        }

        let rids = match rids_path {
            Some(rp) => {
                let rlen = files::file_len(rp)?;
                let rbuf = files::read_file_range(rp, 0, rlen)?;
                let n = rbuf.len() / RID_SIZE;
                Some((0..n).map(|i| Rid::from_le_bytes(&rbuf[i * RID_SIZE..(i + 1) * RID_SIZE])).collect())
            }
            None => None,
        };

        Ok(Bundle { cols, starts, rids })
    }

    /// A restartable `(group_id, row_in_group)` cursor over this bundle
    /// ("Generators / lazy sequences").
    pub fn cursor(&self) -> BundleCursor<'_> {
        BundleCursor { bundle: self, group: 0, row: 0 }
    }
}

/// Lazy, finite, restartable iterator over `(group_id, row_in_group)`.
pub struct BundleCursor<'a> {
    bundle: &'a Bundle,
    group: u32,
    row: u32,
}

impl<'a> BundleCursor<'a> {
    pub fn reset(&mut self) {
        self.group = 0;
        self.row = 0;
    }

    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<(u32, u32)> {
        loop {
            if self.group as usize >= self.bundle.ngroups() {
                return None;
            }
            let glen = self.bundle.starts[self.group as usize + 1] - self.bundle.starts[self.group as usize];
            if self.row < glen {
                let out = (self.group, self.row);
                self.row += 1;
                return Some(out);
            }
            self.group += 1;
            self.row = 0;
        }
    }
}

fn sort_order(keys: &[&ColumnValues], n: usize) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..n).collect();
    idx.sort_by(|&a, &b| {
        for k in keys {
            let c = k.compare(a, b);
            if c != Ordering::Equal {
                return c;
            }
        }
        Ordering::Equal
    });
    idx
}

fn group_boundaries(keys: &[&ColumnValues], order: &[usize]) -> Vec<u32> {
    let n = order.len();
    let mut starts = vec![0u32];
    for i in 1..n {
        let (a, b) = (order[i - 1], order[i]);
        let equal = keys.iter().all(|k| k.compare(a, b) == Ordering::Equal);
        if !equal {
            starts.push(i as u32);
        }
    }
    starts.push(n as u32);
    starts
}

fn aggregate_column(col: &ColumnValues, agg: Aggregator, order: &[usize], starts: &[u32]) -> ColumnValues {
    let ngroups = starts.len() - 1;
    match agg {
        Aggregator::Min | Aggregator::Max => {
            let mut picks = Vec::with_capacity(ngroups);
            for g in 0..ngroups {
                let seg = &order[starts[g] as usize..starts[g + 1] as usize];
                let best = seg
                    .iter()
                    .cloned()
                    .reduce(|a, b| {
                        let (va, vb) = (col.as_f64(a), col.as_f64(b));
                        let take_b = if agg == Aggregator::Min { vb < va } else { vb > va };
                        if take_b {
                            b
                        } else {
                            a
                        }
                    })
                    .expect("group is non-empty by construction");
                picks.push(best);
            }
            col.take(&picks)
        }
        Aggregator::Count => {
            let counts: Vec<u64> = (0..ngroups).map(|g| (starts[g + 1] - starts[g]) as u64).collect();
            ColumnValues::ULong(crate::storage::TypedArray::from_vec(counts))
        }
        _ => {
            let doubled = col.to_double();
            let mut out = Vec::with_capacity(ngroups);
            for g in 0..ngroups {
                let seg = &order[starts[g] as usize..starts[g + 1] as usize];
                let vals: Vec<f64> = seg.iter().map(|&i| doubled.as_f64(i)).collect();
                out.push(agg.apply(&vals));
            }
            ColumnValues::Double(crate::storage::TypedArray::from_vec(out))
        }
    }
}

fn read_u32(buf: &[u8], off: &mut usize) -> Result<u32> {
    if *off + 4 > buf.len() {
        return err_at!(BadFormat, msg: "bundle file truncated at offset {}", off);
    }
    let v = u32::from_le_bytes(buf[*off..*off + 4].try_into().unwrap());
    *off += 4;
    Ok(v)
}

#[cfg(test)]
mod bundle_test {
    use super::*;
    use crate::storage::TypedArray;

    fn region_sales() -> (ColumnValues, ColumnValues) {
 // region = [E,W,E,W,E], sales = [10,20,30,40,50] (scenario 4).
        let region = ColumnValues::UInt(TypedArray::from_vec(vec![0, 1, 0, 1, 0])); // 0=E, 1=W
        let sales = ColumnValues::Double(TypedArray::from_vec(vec![10.0, 20.0, 30.0, 40.0, 50.0]));
        (region, sales)
    }

    #[test]
    fn test_single_group_without_keys() {
        let sales = ColumnValues::Double(TypedArray::from_vec(vec![1.0, 2.0, 3.0]));
        let bundle =
            Bundle::build(vec![Projection::aggregate(sales, Aggregator::Sum)], None).unwrap();
        assert_eq!(bundle.ngroups(), 1);
        assert_eq!(bundle.starts(), &[0, 3]);
        assert_eq!(bundle.cols()[0].as_f64(0), 6.0);
    }

    #[test]
    fn test_two_column_group_by_sum_matches_scenario() {
        let (region, sales) = region_sales();
        let rids: Vec<Rid> = (0..5).map(|i| Rid::new(0, i)).collect();
        let bundle = Bundle::build(
            vec![Projection::key(region), Projection::aggregate(sales, Aggregator::Sum)],
            Some(rids),
        )
        .unwrap();

        assert_eq!(bundle.ngroups(), 2);
        assert_eq!(bundle.starts(), &[0, 3, 5]);
        assert_eq!(bundle.cols()[0].as_f64(0), 0.0); // E
        assert_eq!(bundle.cols()[0].as_f64(1), 1.0); // W
        assert_eq!(bundle.cols()[1].as_f64(0), 90.0);
        assert_eq!(bundle.cols()[1].as_f64(1), 60.0);

        let e_rids: Vec<i64> = bundle.read_rids(0).unwrap().iter().map(|r| r.row).collect();
        assert_eq!(e_rids, vec![0, 2, 4]);
        let w_rids: Vec<i64> = bundle.read_rids(1).unwrap().iter().map(|r| r.row).collect();
        assert_eq!(w_rids, vec![1, 3]);
    }

    #[test]
    fn test_reverse_and_truncate() {
        let (region, sales) = region_sales();
        let mut bundle =
            Bundle::build(vec![Projection::key(region), Projection::aggregate(sales, Aggregator::Sum)], None)
                .unwrap();
        bundle.reverse();
        assert_eq!(bundle.cols()[0].as_f64(0), 1.0); // W first now
        bundle.truncate(1, 0);
        assert_eq!(bundle.ngroups(), 1);
        assert_eq!(bundle.cols()[0].as_f64(0), 1.0);
    }

    #[test]
    fn test_cursor_is_restartable() {
        let (region, sales) = region_sales();
        let bundle =
            Bundle::build(vec![Projection::key(region), Projection::aggregate(sales, Aggregator::Sum)], None)
                .unwrap();
        let mut cursor = bundle.cursor();
        let first_pass: Vec<(u32, u32)> = std::iter::from_fn(|| cursor.next()).collect();
        assert_eq!(first_pass, vec![(0, 0), (0, 1), (0, 2), (1, 0), (1, 1)]);
        cursor.reset();
        assert_eq!(cursor.next(), Some((0, 0)));
    }

    #[test]
    fn test_write_read_roundtrip() {
        let (region, sales) = region_sales();
        let rids: Vec<Rid> = (0..5).map(|i| Rid::new(0, i)).collect();
        let bundle = Bundle::build(
            vec![Projection::key(region), Projection::aggregate(sales, Aggregator::Sum)],
            Some(rids),
        )
        .unwrap();

        let dir = std::env::temp_dir().join(format!("fastbit-bundle-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("bundles");
        let rids_path = dir.join("bundles-rids");
        bundle.write(&path, Some(&rids_path)).unwrap();

        let tags = [ColumnTag::UInt, ColumnTag::Double];
        let bundle2 = Bundle::read(&path, Some(&rids_path), &tags).unwrap();
        assert_eq!(bundle2.starts(), bundle.starts());
        assert_eq!(bundle2.cols()[1].as_f64(0), 90.0);
        assert_eq!(bundle2.cols()[1].as_f64(1), 60.0);

        std::fs::remove_dir_all(&dir).ok();
    }
}
