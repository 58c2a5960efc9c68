// src/buckets.rs - length-bucketed training pairs
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{NmtError, Result};

pub type IdPair = (Vec<i64>, Vec<i64>);

/// Group pairs into `num_buckets` buckets of `width` tokens each. Bucket `i`
/// holds pairs whose longer side is at most `(i + 1) * width`; longer pairs
/// are truncated into the last bucket and empty pairs are dropped.
pub fn create_buckets(pairs: impl IntoIterator<Item = IdPair>, width: usize, num_buckets: usize) -> Vec<Vec<IdPair>> {
    let mut buckets: Vec<Vec<IdPair>> = vec![Vec::new(); num_buckets];
    if width == 0 || num_buckets == 0 {
        return buckets;
    }
    let cap = width * num_buckets;

    for (mut src, mut tgt) in pairs {
        if src.is_empty() || tgt.is_empty() {
            continue;
        }
        let max_len = src.len().max(tgt.len()).min(cap);
        src.truncate(max_len);
        tgt.truncate(max_len);
        buckets[(max_len - 1) / width].push((src, tgt));
    }
    buckets
}

/// Pad limit used for every batch drawn from bucket `idx` (0-based).
pub fn bucket_pad_limit(idx: usize, width: usize) -> usize {
    (idx + 1) * width
}

/// One JSON file per bucket, `bucket_1.json` .. `bucket_N.json`.
pub struct BucketStore {
    dir: PathBuf,
}

impl BucketStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self, idx: usize) -> PathBuf {
        self.dir.join(format!("bucket_{}.json", idx + 1))
    }

    pub fn save_all(&self, buckets: &[Vec<IdPair>]) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| NmtError::io(&self.dir, e))?;
        for (idx, bucket) in buckets.iter().enumerate() {
            let path = self.path(idx);
            let json = serde_json::to_string(bucket)?;
            fs::write(&path, json).map_err(|e| NmtError::io(&path, e))?;
            tracing::info!(bucket = idx + 1, items = bucket.len(), "saved bucket");
        }
        Ok(())
    }

    pub fn load(&self, idx: usize) -> Result<Vec<IdPair>> {
        let path = self.path(idx);
        read_bucket(&path)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn read_bucket(path: &Path) -> Result<Vec<IdPair>> {
    let raw = fs::read_to_string(path).map_err(|e| NmtError::io(path, e))?;
    Ok(serde_json::from_str(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assigns_by_longer_side_and_skips_empty() {
        let pairs = vec![
            (vec![4, 5], vec![6]),
            (vec![4, 5, 6, 7], vec![6]),
            (vec![], vec![6]),
            (vec![4], vec![5, 6, 7, 8, 9, 10, 11, 12]),
        ];
        let buckets = create_buckets(pairs, 3, 2);
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0], vec![(vec![4, 5], vec![6])]);
        assert_eq!(buckets[1].len(), 2);
        // truncated to width * num_buckets
        assert_eq!(buckets[1][1].1.len(), 6);
        assert_eq!(bucket_pad_limit(1, 3), 6);
    }

    #[test]
    fn store_round_trip_and_missing_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let store = BucketStore::new(dir.path().join("buckets"));
        let buckets = create_buckets(vec![(vec![4], vec![5, 6])], 2, 2);
        store.save_all(&buckets).unwrap();

        assert_eq!(store.load(0).unwrap(), buckets[0]);
        assert!(store.load(1).unwrap().is_empty());
        assert!(matches!(store.load(7), Err(NmtError::Io { .. })));
    }
}
