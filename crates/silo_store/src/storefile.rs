//! Region store files and split reference files.
//!
//! A store file is a flat run of framed key/value records with a crc32
//! footer. A reference file is a small metadata stub written during a split:
//! it names a parent store file and which half of it (relative to the split
//! row) the daughter owns. Reads through a reference filter the parent's
//! records by that tag; no data is copied at split time.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::region::RegionInfo;

pub const STORE_DIR: &str = "store";
pub const SPLIT_DIR: &str = "splits";
const STORE_FILE_EXT: &str = "sf";
const REFERENCE_EXT: &str = "ref";

pub fn table_dir(data_dir: &Path, table: &str) -> PathBuf {
    data_dir.join(table)
}

pub fn region_dir(data_dir: &Path, region: &RegionInfo) -> PathBuf {
    table_dir(data_dir, &region.table).join(region.encoded_name())
}

pub fn store_dir(region_dir: &Path) -> PathBuf {
    region_dir.join(STORE_DIR)
}

pub fn split_dir(region_dir: &Path) -> PathBuf {
    region_dir.join(SPLIT_DIR)
}

/// Write one store file: `[u32 klen][u32 vlen][key][value]…` + crc32 footer.
pub fn write_store_file(path: &Path, rows: &[(Vec<u8>, Vec<u8>)]) -> anyhow::Result<()> {
    let mut buf = Vec::new();
    for (key, value) in rows {
        buf.extend_from_slice(&(key.len() as u32).to_be_bytes());
        buf.extend_from_slice(&(value.len() as u32).to_be_bytes());
        buf.extend_from_slice(key);
        buf.extend_from_slice(value);
    }
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&buf);
    buf.extend_from_slice(&hasher.finalize().to_be_bytes());
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create store dir {parent:?}"))?;
    }
    fs::write(path, &buf).with_context(|| format!("write store file {path:?}"))
}

pub fn read_store_file(path: &Path) -> anyhow::Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let buf = fs::read(path).with_context(|| format!("read store file {path:?}"))?;
    if buf.len() < 4 {
        anyhow::bail!("store file {path:?} truncated: {} bytes", buf.len());
    }
    let (body, footer) = buf.split_at(buf.len() - 4);
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(body);
    let expected = u32::from_be_bytes(footer.try_into().expect("4-byte footer"));
    let actual = hasher.finalize();
    if expected != actual {
        anyhow::bail!("store file {path:?} checksum mismatch: {expected:#x} != {actual:#x}");
    }

    let mut rows = Vec::new();
    let mut at = 0usize;
    while at < body.len() {
        if at + 8 > body.len() {
            anyhow::bail!("store file {path:?} has a torn record header");
        }
        let klen = u32::from_be_bytes(body[at..at + 4].try_into().unwrap()) as usize;
        let vlen = u32::from_be_bytes(body[at + 4..at + 8].try_into().unwrap()) as usize;
        at += 8;
        if at + klen + vlen > body.len() {
            anyhow::bail!("store file {path:?} has a torn record body");
        }
        let key = body[at..at + klen].to_vec();
        let value = body[at + klen..at + klen + vlen].to_vec();
        at += klen + vlen;
        rows.push((key, value));
    }
    Ok(rows)
}

/// Which half of the parent's keyspace a reference covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReferenceHalf {
    Bottom,
    Top,
}

impl ReferenceHalf {
    pub fn covers(self, key: &[u8], split_row: &[u8]) -> bool {
        match self {
            ReferenceHalf::Bottom => key < split_row,
            ReferenceHalf::Top => key >= split_row,
        }
    }
}

/// Metadata stub pointing at half of a parent store file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreFileReference {
    /// Encoded name of the parent region; resolves under the table dir.
    pub parent_region: String,
    /// File name inside the parent region's store dir.
    pub parent_file: String,
    pub half: ReferenceHalf,
    pub split_row: Vec<u8>,
}

impl StoreFileReference {
    /// Write the reference into `dest_store_dir`, named after the parent
    /// file so two references to distinct parent files never collide.
    pub fn write(&self, dest_store_dir: &Path) -> anyhow::Result<PathBuf> {
        fs::create_dir_all(dest_store_dir)
            .with_context(|| format!("create reference dir {dest_store_dir:?}"))?;
        let path = dest_store_dir.join(format!("{}.{REFERENCE_EXT}", self.parent_file));
        let data = serde_json::to_vec(self).context("encode store file reference")?;
        fs::write(&path, data).with_context(|| format!("write reference {path:?}"))?;
        Ok(path)
    }

    pub fn read(path: &Path) -> anyhow::Result<Self> {
        let data = fs::read(path).with_context(|| format!("read reference {path:?}"))?;
        serde_json::from_slice(&data).with_context(|| format!("decode reference {path:?}"))
    }
}

pub fn is_store_file(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(STORE_FILE_EXT)
}

pub fn is_reference_file(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(REFERENCE_EXT)
}

/// Materialize all rows visible in a store dir: plain store files plus
/// reference files resolved against the parent region under `table_dir`.
pub fn load_store_rows(
    store_dir: &Path,
    table_dir: &Path,
) -> anyhow::Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut rows = Vec::new();
    if !store_dir.exists() {
        return Ok(rows);
    }
    let mut entries: Vec<PathBuf> = fs::read_dir(store_dir)
        .with_context(|| format!("list store dir {store_dir:?}"))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .collect();
    entries.sort();

    for path in entries {
        if is_store_file(&path) {
            rows.extend(read_store_file(&path)?);
        } else if is_reference_file(&path) {
            let reference = StoreFileReference::read(&path)?;
            let parent = table_dir
                .join(&reference.parent_region)
                .join(STORE_DIR)
                .join(&reference.parent_file);
            for (key, value) in read_store_file(&parent)? {
                if reference.half.covers(&key, &reference.split_row) {
                    rows.push((key, value));
                }
            }
        }
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(keys: &[&str]) -> Vec<(Vec<u8>, Vec<u8>)> {
        keys.iter()
            .map(|k| (k.as_bytes().to_vec(), format!("v-{k}").into_bytes()))
            .collect()
    }

    #[test]
    fn store_file_survives_round_trip_and_detects_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.sf");
        let data = rows(&["a", "b", "c"]);
        write_store_file(&path, &data).unwrap();
        assert_eq!(read_store_file(&path).unwrap(), data);

        let mut raw = fs::read(&path).unwrap();
        raw[3] ^= 0xff;
        fs::write(&path, &raw).unwrap();
        assert!(read_store_file(&path).is_err());
    }

    #[test]
    fn reference_filters_parent_by_half() {
        let dir = tempfile::tempdir().unwrap();
        let table = dir.path().join("t");
        let parent_store = table.join("parent").join(STORE_DIR);
        write_store_file(&parent_store.join("f1.sf"), &rows(&["a", "c", "m", "x"])).unwrap();

        let daughter_store = table.join("daughter").join(STORE_DIR);
        StoreFileReference {
            parent_region: "parent".into(),
            parent_file: "f1.sf".into(),
            half: ReferenceHalf::Bottom,
            split_row: b"m".to_vec(),
        }
        .write(&daughter_store)
        .unwrap();

        let seen = load_store_rows(&daughter_store, &table).unwrap();
        let keys: Vec<&[u8]> = seen.iter().map(|(k, _)| k.as_slice()).collect();
        assert_eq!(keys, vec![b"a".as_slice(), b"c".as_slice()]);

        // Top half picks up the split row itself.
        let top = table.join("daughter_b").join(STORE_DIR);
        StoreFileReference {
            parent_region: "parent".into(),
            parent_file: "f1.sf".into(),
            half: ReferenceHalf::Top,
            split_row: b"m".to_vec(),
        }
        .write(&top)
        .unwrap();
        let seen = load_store_rows(&top, &table).unwrap();
        let keys: Vec<&[u8]> = seen.iter().map(|(k, _)| k.as_slice()).collect();
        assert_eq!(keys, vec![b"m".as_slice(), b"x".as_slice()]);
    }
}
