//! Bijective string<->code mapping for categorical columns, with a
//! versioned on-disk format shared across re-opens of the same file.

mod format;
mod pattern;

use std::{collections::HashMap, sync::Arc};

use crate::Result;

pub use format::{DiskVersion, MAGIC, MAGIC_LEN};

/// Compile-time case-folding policy ("Case sensitivity is a
/// compile-time choice via a configuration constant"). Flipping this to
/// `false` upper-cases every key before hashing/comparing.
pub const CASE_SENSITIVE: bool = true;

/// `dictionary`: `raw[0]` is always `None` (the NULL slot);
/// `raw[i]` for `i >= 1` holds the string assigned code `i`.
#[derive(Clone, Debug, Default)]
pub struct Dictionary {
    raw: Vec<Option<Arc<str>>>,
    key: HashMap<Arc<str>, u32>,
}

impl Dictionary {
    pub fn new() -> Dictionary {
        Dictionary { raw: vec![None], key: HashMap::new() }
    }

    /// `size()`: number of real entries, i.e. `N` (excludes the NULL slot).
    pub fn size(&self) -> u32 {
        (self.raw.len() - 1) as u32
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    fn fold<'a>(&self, s: &'a str) -> std::borrow::Cow<'a, str> {
        if CASE_SENSITIVE {
            std::borrow::Cow::Borrowed(s)
        } else {
            std::borrow::Cow::Owned(s.to_ascii_uppercase())
        }
    }

    /// `operator[](code)`: string for a code, or `None` if out of range.
    pub fn get(&self, code: u32) -> Option<&str> {
        self.raw.get(code as usize).and_then(|o| o.as_deref())
    }

    /// `lookup(s) -> code`: `0` for NULL/empty, `N+1` if not present, else
    /// the existing code.
    pub fn lookup(&self, s: Option<&str>) -> u32 {
        match s {
            None => 0,
            Some(s) if s.is_empty() => 0,
            Some(s) => {
                let folded = self.fold(s);
                self.key.get(folded.as_ref()).copied().unwrap_or_else(|| self.size() + 1)
            }
        }
    }

    /// `insert(s) -> code`: return the existing code, or allocate a new
    /// one by copying `s` in.
    pub fn insert(&mut self, s: &str) -> u32 {
        let folded = self.fold(s);
        if let Some(&code) = self.key.get(folded.as_ref()) {
            return code;
        }
        let owned: Arc<str> = Arc::from(folded.into_owned());
        let code = self.raw.len() as u32;
        self.key.insert(owned.clone(), code);
        self.raw.push(Some(owned));
        code
    }

    /// `insertRaw(s) -> code`: in this port, ownership transfer is moot
    /// (Rust's `String` is always uniquely owned on call); kept as a
    /// distinct entry point for API parity with the source.
    pub fn insert_raw(&mut self, s: String) -> u32 {
        self.insert(&s)
    }

    /// `appendOrdered(s) -> code`: unchecked append. Caller guarantees `s`
    /// sorts after every existing key; violating this breaks
    /// [Dictionary::sort]'s assumptions but not [Dictionary::lookup].
    pub fn append_ordered(&mut self, s: &str) -> u32 {
        let folded = self.fold(s).into_owned();
        let owned: Arc<str> = Arc::from(folded);
        let code = self.raw.len() as u32;
        self.key.insert(owned.clone(), code);
        self.raw.push(Some(owned));
        code
    }

    /// `sort(o2n&)`: lexicographically sort `raw`, returning the
    /// old-code -> new-code permutation.
    pub fn sort(&mut self) -> Vec<u32> {
        let n = self.size() as usize;
        let mut order: Vec<u32> = (1..=n as u32).collect();
        order.sort_by(|&a, &b| self.raw[a as usize].cmp(&self.raw[b as usize]));

        let mut o2n = vec![0u32; n + 1];
        let mut new_raw = vec![None];
        for (new_code, &old_code) in order.iter().enumerate() {
            let new_code = (new_code + 1) as u32;
            o2n[old_code as usize] = new_code;
            new_raw.push(self.raw[old_code as usize].clone());
        }
        self.raw = new_raw;
        self.key.clear();
        for (code, s) in self.raw.iter().enumerate().skip(1) {
            if let Some(s) = s {
                self.key.insert(s.clone(), code as u32);
            }
        }
        o2n
    }

    /// `merge(other) -> new_size`: union of keys; `self`'s existing codes
    /// are preserved, new keys from `other` are appended in the order
    /// `other` holds them.
    pub fn merge(&mut self, other: &Dictionary) -> u32 {
        for code in 1..=other.size() {
            if let Some(s) = other.get(code) {
                self.insert(s);
            }
        }
        self.size()
    }

    /// `morph(old, o2n&)`: compute a remap from `old`'s codes to `self`'s
    /// codes; `self` must be a superset of `old`.
    pub fn morph(&self, old: &Dictionary) -> Result<Vec<u32>> {
        let mut o2n = vec![0u32; (old.size() + 1) as usize];
        for code in 1..=old.size() {
            let s = old.get(code).unwrap();
            let new_code = self.lookup(Some(s));
            if new_code > self.size() {
                return crate::err_at!(
                    ArgumentError,
                    msg: "morph: {:?} not present in superset dictionary",
                    s
                );
            }
            o2n[code as usize] = new_code;
        }
        Ok(o2n)
    }

    /// `patternSearch(pattern, matches&)`: SQL `LIKE` (`%`, `_`) plus
    /// shell aliases (`*`, `?`), `\` escaping the next char.
    pub fn pattern_search(&self, pattern: &str) -> Vec<u32> {
        let re = pattern::compile(pattern, CASE_SENSITIVE);
        let prefix = pattern::constant_prefix(pattern);
        let mut matches = Vec::new();
        for code in 1..=self.size() {
            let s = self.get(code).unwrap();
            if !prefix.is_empty() {
                let probe = if CASE_SENSITIVE { s.to_string() } else { s.to_ascii_uppercase() };
                if !probe.starts_with(prefix.as_str()) {
                    continue;
                }
            }
            if re.is_match(s) {
                matches.push(code);
            }
        }
        matches
    }

    pub fn write(&self, path: &std::path::Path) -> Result<()> {
        format::write_v1(self, path)
    }

    pub fn read(path: &std::path::Path) -> Result<Dictionary> {
        format::read(path)
    }

    pub(crate) fn raw_entries(&self) -> &[Option<Arc<str>>] {
        &self.raw
    }

    pub(crate) fn from_entries(entries: Vec<Option<Arc<str>>>) -> Dictionary {
        let mut key = HashMap::new();
        for (code, s) in entries.iter().enumerate().skip(1) {
            if let Some(s) = s {
                key.insert(s.clone(), code as u32);
            }
        }
        Dictionary { raw: entries, key }
    }
}

#[cfg(test)]
mod dict_test {
    use super::*;

    #[test]
    fn test_insert_and_lookup() {
        let mut d = Dictionary::new();
        assert_eq!(d.insert("alpha"), 1);
        assert_eq!(d.insert("beta"), 2);
        assert_eq!(d.insert("alpha"), 1);
        assert_eq!(d.insert("gamma"), 3);
        assert_eq!(d.lookup(Some("beta")), 2);
        assert_eq!(d.lookup(Some("delta")), 4);
        assert_eq!(d.lookup(None), 0);
    }

    #[test]
    fn test_sort_renumbers() {
        let mut d = Dictionary::new();
        d.insert("alpha");
        d.insert("beta");
        d.insert("alpha");
        d.insert("gamma");
        let o2n = d.sort();
        assert_eq!(o2n, vec![0, 1, 2, 3]);

        d.insert("aardvark");
        let o2n = d.sort();
        assert_eq!(o2n[4], 1);
        assert_eq!(o2n[1], 2);
        assert_eq!(o2n[2], 3);
        assert_eq!(o2n[3], 4);
        assert_eq!(d.lookup(Some("alpha")), 2);
    }

    #[test]
    fn test_merge() {
        let mut a = Dictionary::new();
        a.insert("x");
        a.insert("y");
        let mut b = Dictionary::new();
        b.insert("y");
        b.insert("z");
        let n = a.merge(&b);
        assert_eq!(n, 3);
        assert_eq!(a.lookup(Some("x")), 1);
        assert_eq!(a.lookup(Some("y")), 2);
        assert_eq!(a.lookup(Some("z")), 3);
    }

    #[test]
    fn test_morph() {
        let mut sup = Dictionary::new();
        sup.insert("a");
        sup.insert("b");
        sup.insert("c");
        let mut sub = Dictionary::new();
        sub.insert("c");
        sub.insert("a");
        let o2n = sup.morph(&sub).unwrap();
        assert_eq!(o2n[sub.lookup(Some("c")) as usize], sup.lookup(Some("c")));
        assert_eq!(o2n[sub.lookup(Some("a")) as usize], sup.lookup(Some("a")));
    }

    #[test]
    fn test_pattern_search() {
        let mut d = Dictionary::new();
        d.insert("Apex");
        d.insert("Axe");
        d.insert("Box");
        d.insert("ax");
        let matches = d.pattern_search("A%x");
        let words: Vec<&str> = matches.iter().map(|&c| d.get(c).unwrap()).collect();
        assert_eq!(words, vec!["Apex"]);
    }
}
