//! On-disk layouts for [super::Dictionary]: v1 (64-bit offsets),
//! v0 (32-bit offsets, legacy), and headerless raw.

use std::{path::Path, sync::Arc};

use crate::{err_at, util::files, Error, Result};

use super::Dictionary;

pub const MAGIC_LEN: usize = 20;
const MAGIC_PREFIX: &[u8; 16] = b"#IBIS Dictionary";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiskVersion {
    Raw,
    V0,
    V1,
}

fn magic_for(version: DiskVersion) -> Option<[u8; MAGIC_LEN]> {
    let tail: [u8; 4] = match version {
        DiskVersion::Raw => return None,
        DiskVersion::V0 => [0, 0, 0, 0],
        DiskVersion::V1 => [1, 0, 0, 0],
    };
    let mut header = [0u8; MAGIC_LEN];
    header[..16].copy_from_slice(MAGIC_PREFIX);
    header[16..].copy_from_slice(&tail);
    Some(header)
}

pub const MAGIC: &[u8; 16] = MAGIC_PREFIX;

/// Write in the v1 layout: header, `uint32 N`, `uint64 pos[N+1]`,
/// then the NUL-terminated strings packed contiguously.
pub fn write_v1(dict: &Dictionary, path: &Path) -> Result<()> {
    let n = dict.size();
    let mut buf = Vec::new();
    buf.extend_from_slice(&magic_for(DiskVersion::V1).unwrap());
    buf.extend_from_slice(&n.to_le_bytes());

    let pos_table_off = buf.len() + (n as usize + 1) * 8;
    let mut pos = Vec::with_capacity(n as usize + 1);
    let mut strings = Vec::new();
    let mut offset = pos_table_off as u64;
    pos.push(offset);
    for code in 1..=n {
        let s = dict.get(code).unwrap_or("");
        strings.extend_from_slice(s.as_bytes());
        strings.push(0);
        offset += s.len() as u64 + 1;
        pos.push(offset);
    }
    for p in &pos {
        buf.extend_from_slice(&p.to_le_bytes());
    }
    buf.extend_from_slice(&strings);

    files::write_whole_file(path, &buf)
}

pub fn read(path: &Path) -> Result<Dictionary> {
    let bytes = files::read_file_range(path, 0, files::file_len(path)?)?;
    if bytes.len() >= MAGIC_LEN && bytes[..16] == *MAGIC_PREFIX {
        match &bytes[16..20] {
            [1, 0, 0, 0] => return read_v1(&bytes),
            [0, 0, 0, 0] => return read_v0(&bytes),
            other => {
                return err_at!(BadFormat, msg: "unrecognized dictionary version tag {:?}", other)
            }
        }
    }
    read_raw(&bytes)
}

fn read_v1(bytes: &[u8]) -> Result<Dictionary> {
    if bytes.len() < MAGIC_LEN + 4 {
        return err_at!(BadFormat, msg: "v1 dictionary header truncated");
    }
    let n = u32::from_le_bytes(bytes[MAGIC_LEN..MAGIC_LEN + 4].try_into().unwrap());
    let pos_off = MAGIC_LEN + 4;
    let pos_bytes = n as usize + 1;
    if bytes.len() < pos_off + pos_bytes * 8 {
        return err_at!(BadFormat, msg: "v1 dictionary position table truncated");
    }
    let mut pos = Vec::with_capacity(pos_bytes);
    for i in 0..pos_bytes {
        let off = pos_off + i * 8;
        pos.push(u64::from_le_bytes(bytes[off..off + 8].try_into().unwrap()));
    }
    let mut entries: Vec<Option<Arc<str>>> = vec![None];
    for i in 0..n as usize {
        let (start, end) = (pos[i] as usize, pos[i + 1] as usize);
        if end > bytes.len() || start > end {
            return err_at!(BadFormat, msg: "v1 dictionary string range out of bounds");
        }
        let raw = &bytes[start..end];
        let s = raw.split(|&b| b == 0).next().unwrap_or(raw);
        let s = err_at!(BadFormat, std::str::from_utf8(s))?;
        entries.push(Some(Arc::from(s)));
    }
    Ok(Dictionary::from_entries(entries))
}

/// v0 stores a separate code array precisely because, predating the
/// sort-and-renumber discipline, a string's position in the file does not
/// necessarily match its dictionary code: `pos[i]/pos[i+1]` delimits the
/// `i`-th string as written, and `codes[i]` says which code it was
/// assigned, so the two arrays must be read together rather than assuming
/// `code == i + 1`.
fn read_v0(bytes: &[u8]) -> Result<Dictionary> {
    if bytes.len() < MAGIC_LEN + 4 {
        return err_at!(BadFormat, msg: "v0 dictionary header truncated");
    }
    let n = u32::from_le_bytes(bytes[MAGIC_LEN..MAGIC_LEN + 4].try_into().unwrap()) as usize;
    let pos_off = MAGIC_LEN + 4;
    let pos_count = n + 1;
    if bytes.len() < pos_off + pos_count * 4 {
        return err_at!(BadFormat, msg: "v0 dictionary position table truncated");
    }
    let mut pos = Vec::with_capacity(pos_count);
    for i in 0..pos_count {
        let off = pos_off + i * 4;
        pos.push(u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap()) as usize);
    }

    let codes_off = pos_off + pos_count * 4;
    if bytes.len() < codes_off + n * 4 {
        return err_at!(BadFormat, msg: "v0 dictionary code array truncated");
    }
    let mut codes = Vec::with_capacity(n);
    for i in 0..n {
        let off = codes_off + i * 4;
        codes.push(u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap()));
    }

    let max_code = codes.iter().copied().max().unwrap_or(0) as usize;
    let mut entries: Vec<Option<Arc<str>>> = vec![None; max_code + 1];
    for i in 0..n {
        let (start, end) = (pos[i], pos[i + 1]);
        if end > bytes.len() || start > end {
            return err_at!(BadFormat, msg: "v0 dictionary string range out of bounds");
        }
        let code = codes[i] as usize;
        if code == 0 {
            return err_at!(BadFormat, msg: "v0 dictionary code 0 is reserved for null");
        }
        let raw = &bytes[start..end];
        let s = raw.split(|&b| b == 0).next().unwrap_or(raw);
        let s = err_at!(BadFormat, std::str::from_utf8(s))?;
        entries[code] = Some(Arc::from(s));
    }
    Ok(Dictionary::from_entries(entries))
}

fn read_raw(bytes: &[u8]) -> Result<Dictionary> {
    let mut entries: Vec<Option<Arc<str>>> = vec![None];
    for chunk in bytes.split(|&b| b == 0) {
        if chunk.is_empty() && entries.len() > 1 {
            continue;
        }
        if chunk.is_empty() {
            continue;
        }
        let s = err_at!(BadFormat, std::str::from_utf8(chunk))?;
        entries.push(Some(Arc::from(s)));
    }
    Ok(Dictionary::from_entries(entries))
}

#[cfg(test)]
mod format_test {
    use super::*;

    #[test]
    fn test_v1_roundtrip() {
        let dir = std::env::temp_dir().join(format!("fastbit-dict-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("dict-v1");

        let mut d = Dictionary::new();
        d.insert("alpha");
        d.insert("beta");
        d.insert("gamma with spaces");
        d.write(&path).unwrap();

        let d2 = Dictionary::read(&path).unwrap();
        assert_eq!(d2.size(), 3);
        assert_eq!(d2.get(1), Some("alpha"));
        assert_eq!(d2.get(2), Some("beta"));
        assert_eq!(d2.get(3), Some("gamma with spaces"));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_read_v0_out_of_order_codes() {
        // Hand-built v0 buffer: three strings written in file order
        // "beta", "alpha", "gamma" but assigned codes 2, 1, 3 respectively
        // (as a legacy pre-sort-renumber writer might produce).
        let strings: &[&str] = &["beta", "alpha", "gamma"];
        let codes: [u32; 3] = [2, 1, 3];

        let mut buf = Vec::new();
        buf.extend_from_slice(&magic_for(DiskVersion::V0).unwrap());
        buf.extend_from_slice(&(strings.len() as u32).to_le_bytes());

        let pos_off = buf.len();
        let pos_count = strings.len() + 1;
        let codes_off = pos_off + pos_count * 4;
        let strings_off = codes_off + strings.len() * 4;

        let mut pos = Vec::with_capacity(pos_count);
        let mut blob = Vec::new();
        let mut offset = strings_off;
        pos.push(offset);
        for s in strings {
            blob.extend_from_slice(s.as_bytes());
            blob.push(0);
            offset += s.len() + 1;
            pos.push(offset);
        }

        for p in &pos {
            buf.extend_from_slice(&(*p as u32).to_le_bytes());
        }
        for c in &codes {
            buf.extend_from_slice(&c.to_le_bytes());
        }
        buf.extend_from_slice(&blob);

        let dict = read_v0(&buf).unwrap();
        assert_eq!(dict.get(1), Some("alpha"));
        assert_eq!(dict.get(2), Some("beta"));
        assert_eq!(dict.get(3), Some("gamma"));
    }

    #[test]
    fn test_empty_dictionary_roundtrip() {
        let dir = std::env::temp_dir().join(format!("fastbit-dict-empty-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("dict-empty");

        let d = Dictionary::new();
        d.write(&path).unwrap();
        let d2 = Dictionary::read(&path).unwrap();
        assert_eq!(d2.size(), 0);

        std::fs::remove_dir_all(&dir).ok();
    }
}
