//! This module implements the Table, the read-only storage unit of the
//! database. A table wraps one externally produced, lexicographically sorted
//! CSV file together with a sparse in-memory index over it.
//!
//! The file is the authoritative data; nothing else is written to disk. Each
//! record is one CSV row whose first field is the key and whose remaining
//! fields (at least one) are the values:
//!
//! ```text
//! +--------------------------+
//! | key0,value[,value...]    |  <- indexed (record 0)
//! | ...                      |
//! | keyI,value[,value...]    |  <- indexed (every I-th record)
//! | ...                      |
//! | keyN,value[,value...]    |  <- indexed (last record, always)
//! +--------------------------+
//! ```
//!
//! The index samples every I-th record's key and byte offset, so a lookup
//! binary-searches the index for the bucket that may contain the key, seeks
//! there, and scans at most I records. Bulk lookups additionally coalesce
//! sorted keys that fall into the same bucket and resolve them with a single
//! seek and one forward pass.

pub mod index;
mod scan;

use std::fs::File;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime};

use itertools::Itertools;

use crate::error::{Error, Result};
use index::SparseIndex;
use scan::RecordScanner;

/// Timing breakdown of one point lookup. Observability only, not part of the
/// correctness contract.
#[derive(Debug, Clone, Copy, Default)]
pub struct Profile {
    pub search_offset: Duration,
    pub open: Duration,
    pub seek: Duration,
    pub scan: Duration,
}

/// The outcome of a point lookup. `values: None` means the key is not
/// present; `Some` holds the record's non-key fields.
#[derive(Debug, Clone)]
pub struct GetResult {
    pub values: Option<Vec<String>>,
    pub profile: Profile,
}

/// The outcome of a bulk lookup, in input key order.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkResult {
    pub values: Vec<Option<Vec<String>>>,
}

/// A read-only table over one sorted CSV file. Immutable after construction.
///
/// A replaced table owns its backing file until the last handle drops: the
/// registry marks it evicted on replacement and the file is deleted from
/// `Drop`, so a reader holding the old handle can still open and finish its
/// scan.
#[derive(Debug)]
pub struct Table {
    file: String,
    index: SparseIndex,
    index_interval: usize,
    timestamp: SystemTime,
    evicted: AtomicBool,
}

impl Table {
    /// Builds a table by scanning the CSV file once, sampling every
    /// `index_interval`-th record into the sparse index.
    ///
    /// The scan validates that every record has at least two fields and that
    /// keys are non-decreasing in bytewise order. The last record's key is
    /// always indexed so scans in the final bucket stay bounded.
    pub fn build(path: &str, index_interval: usize) -> Result<Self> {
        let index_interval = index_interval.max(1);
        let started = Instant::now();

        let file = File::open(path)?;
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(file);

        let mut record = csv::ByteRecord::new();
        let mut index = SparseIndex::new();
        let mut count: u64 = 0;
        let mut last_key: Vec<u8> = Vec::new();
        let mut last_offset: u64 = 0;

        loop {
            let offset = reader.position().byte();
            if !reader.read_byte_record(&mut record)? {
                break;
            }

            if record.len() < 2 {
                return Err(Error::InvalidRecord(format!(
                    "{} fields at offset {} in {}",
                    record.len(),
                    offset,
                    path
                )));
            }

            let key = &record[0];
            if count > 0 && key < last_key.as_slice() {
                return Err(Error::KeysNotSorted {
                    prev: String::from_utf8_lossy(&last_key).into_owned(),
                    next: String::from_utf8_lossy(key).into_owned(),
                });
            }

            if count % index_interval as u64 == 0 {
                index.push(key.to_vec(), offset);
            }

            last_key.clear();
            last_key.extend_from_slice(key);
            last_offset = offset;
            count += 1;
        }

        if count == 0 {
            return Err(Error::EmptyFile(path.to_string()));
        }

        // the last record bounds every scan in the final bucket
        if index.last_key() != Some(last_key.as_slice()) {
            index.push(last_key, last_offset);
        }

        tracing::info!(
            path,
            records = count,
            index_entries = index.len(),
            elapsed = ?started.elapsed(),
            "loaded table"
        );

        Ok(Self {
            file: path.to_string(),
            index,
            index_interval,
            timestamp: SystemTime::now(),
            evicted: AtomicBool::new(false),
        })
    }

    /// Marks the table as replaced: its backing file is deleted once the
    /// last handle drops.
    pub(crate) fn mark_evicted(&self) {
        self.evicted.store(true, Ordering::SeqCst);
    }

    /// Path of the backing CSV file.
    pub fn path(&self) -> &str {
        &self.file
    }

    /// Wall-clock time the table was built for install.
    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    /// Looks up a single key.
    ///
    /// The file is opened per call; cached handles would share a seek cursor
    /// across concurrent lookups.
    pub fn get(&self, key: &str) -> Result<GetResult> {
        let mut profile = Profile::default();

        let t0 = Instant::now();
        let found = self.index.find(key.as_bytes());
        let t1 = Instant::now();
        profile.search_offset = t1 - t0;

        let Some((offset, limit)) = found else {
            return Ok(GetResult {
                values: None,
                profile,
            });
        };

        let file = File::open(&self.file)?;
        let t2 = Instant::now();
        profile.open = t2 - t1;

        let mut scanner = RecordScanner::new(file, offset)?;
        let t3 = Instant::now();
        profile.seek = t3 - t2;

        let values = scanner.seek_key(key.as_bytes(), offset, limit, self.index_interval)?;
        profile.scan = t3.elapsed();

        Ok(GetResult { values, profile })
    }

    /// Looks up a sorted batch of keys, preserving input order.
    ///
    /// Consecutive keys that fall into the same index bucket form a chunk:
    /// the file is opened once for the batch and each chunk is resolved with
    /// a single seek and one forward pass, each key's scan continuing where
    /// the previous one stopped.
    pub fn bulk_get(&self, keys: &[String]) -> Result<BulkResult> {
        if keys.is_empty() {
            return Err(Error::EmptyBatch);
        }
        if keys.len() == 1 {
            return Ok(BulkResult {
                values: vec![self.get(&keys[0])?.values],
            });
        }

        if let Some(pair) = keys.windows(2).find(|pair| pair[0] > pair[1]) {
            return Err(Error::KeysNotSorted {
                prev: pair[0].clone(),
                next: pair[1].clone(),
            });
        }

        // the whole batch may lie outside the table's key range
        let (Some(first), Some(last)) = (self.index.first_key(), self.index.last_key()) else {
            return Ok(BulkResult {
                values: vec![None; keys.len()],
            });
        };
        if keys[keys.len() - 1].as_bytes() < first || keys[0].as_bytes() > last {
            return Ok(BulkResult {
                values: vec![None; keys.len()],
            });
        }

        let buckets: Vec<Option<(u64, u64)>> = keys
            .iter()
            .map(|key| self.index.find(key.as_bytes()))
            .collect();

        let file = File::open(&self.file)?;
        let mut values: Vec<Option<Vec<String>>> = Vec::with_capacity(keys.len());

        let chunks = keys
            .iter()
            .zip(&buckets)
            .chunk_by(|&(_, bucket)| bucket.map(|(offset, _)| offset));

        for (chunk_offset, chunk) in &chunks {
            let Some(chunk_offset) = chunk_offset else {
                // out-of-range keys resolve without touching the file
                values.extend(chunk.map(|_| None));
                continue;
            };

            let mut scanner = RecordScanner::new(file.try_clone()?, chunk_offset)?;
            let mut prev_key: Option<&str> = None;

            for (key, bucket) in chunk {
                let Some((offset, limit)) = *bucket else {
                    return Err(Error::UnreachableState);
                };

                // the scan for a repeated key already consumed its record
                if prev_key == Some(key.as_str()) {
                    let repeat = values.last().cloned().flatten();
                    values.push(repeat);
                    continue;
                }

                let found =
                    scanner.seek_key(key.as_bytes(), offset, limit, self.index_interval)?;
                values.push(found);
                prev_key = Some(key.as_str());
            }
        }

        Ok(BulkResult { values })
    }
}

impl Drop for Table {
    fn drop(&mut self) {
        if *self.evicted.get_mut() {
            if let Err(e) = std::fs::remove_file(&self.file) {
                tracing::warn!(
                    file = %self.file,
                    error = %e,
                    "failed to delete replaced table file"
                );
            } else {
                tracing::debug!(file = %self.file, "deleted replaced table file");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::Path;

    fn write_csv(dir: &Path, name: &str, content: &str) -> String {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).expect("Failed to create csv");
        file.write_all(content.as_bytes()).expect("Failed to write");
        path.to_str().unwrap().to_string()
    }

    fn numbered_csv(rows: usize) -> String {
        let mut content = String::new();
        for i in 0..rows {
            content.push_str(&format!("{:010},{}\n", i, i));
        }
        content
    }

    fn get_values(table: &Table, key: &str) -> Option<Vec<String>> {
        table.get(key).expect("get failed").values
    }

    #[test]
    fn test_build_and_get() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = write_csv(dir.path(), "test.csv", &numbered_csv(1000));
        let table = Table::build(&path, 1000).expect("Failed to build table");

        assert_eq!(get_values(&table, "0000000000"), Some(vec!["0".to_string()]));
        assert_eq!(
            get_values(&table, "0000000500"),
            Some(vec!["500".to_string()])
        );
        assert_eq!(
            get_values(&table, "0000000999"),
            Some(vec!["999".to_string()])
        );
        assert_eq!(get_values(&table, "0000000500x"), None);
    }

    #[test]
    fn test_get_across_buckets() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = write_csv(dir.path(), "test.csv", &numbered_csv(100));
        let table = Table::build(&path, 10).expect("Failed to build table");

        for i in [0, 1, 9, 10, 11, 42, 98, 99] {
            let key = format!("{:010}", i);
            assert_eq!(
                get_values(&table, &key),
                Some(vec![i.to_string()]),
                "key {key}"
            );
        }
        assert_eq!(get_values(&table, "0000000041x"), None);
    }

    #[test]
    fn test_out_of_range_keys() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = write_csv(dir.path(), "test.csv", "b,1\nc,2\nd,3\n");
        let table = Table::build(&path, 2).expect("Failed to build table");

        assert_eq!(get_values(&table, "a"), None);
        assert_eq!(get_values(&table, "e"), None);
    }

    #[test]
    fn test_single_record() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = write_csv(dir.path(), "test.csv", "k,v\n");
        let table = Table::build(&path, 1000).expect("Failed to build table");

        assert_eq!(get_values(&table, "k"), Some(vec!["v".to_string()]));
        assert_eq!(get_values(&table, "a"), None);
        assert_eq!(get_values(&table, "z"), None);
    }

    #[test]
    fn test_multi_value_fields() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = write_csv(dir.path(), "test.csv", "k,v1,v2,v3\n");
        let table = Table::build(&path, 1000).expect("Failed to build table");

        assert_eq!(
            get_values(&table, "k"),
            Some(vec!["v1".to_string(), "v2".to_string(), "v3".to_string()])
        );
    }

    #[test]
    fn test_quoted_fields() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = write_csv(dir.path(), "test.csv", "a,\"x,y\"\nb,\"say \"\"hi\"\"\"\n");
        let table = Table::build(&path, 1000).expect("Failed to build table");

        assert_eq!(get_values(&table, "a"), Some(vec!["x,y".to_string()]));
        assert_eq!(get_values(&table, "b"), Some(vec!["say \"hi\"".to_string()]));
    }

    #[test]
    fn test_unsorted_file_rejected() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        // "A" < "b" bytewise, so the third record breaks the order
        let path = write_csv(dir.path(), "test.csv", "a,1\nb,2\nA,3\n");

        let err = Table::build(&path, 1000).unwrap_err();
        assert!(matches!(err, Error::KeysNotSorted { .. }), "got {err:?}");
    }

    #[test]
    fn test_empty_file_rejected() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = write_csv(dir.path(), "test.csv", "");

        let err = Table::build(&path, 1000).unwrap_err();
        assert!(matches!(err, Error::EmptyFile(_)), "got {err:?}");
    }

    #[test]
    fn test_short_record_rejected() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = write_csv(dir.path(), "test.csv", "key,value\nbroken\n");

        let err = Table::build(&path, 1000).unwrap_err();
        assert!(matches!(err, Error::InvalidRecord(_)), "got {err:?}");
    }

    #[test]
    fn test_duplicate_keys_first_record_wins() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = write_csv(dir.path(), "test.csv", "a,1\na,2\nb,3\n");
        let table = Table::build(&path, 1000).expect("Failed to build table");

        assert_eq!(get_values(&table, "a"), Some(vec!["1".to_string()]));
    }

    #[test]
    fn test_last_key_always_indexed() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");

        // 25 records with interval 10 samples 0, 10, 20; 24 must be appended
        let path = write_csv(dir.path(), "test.csv", &numbered_csv(25));
        let table = Table::build(&path, 10).expect("Failed to build table");
        assert_eq!(table.index.len(), 4);
        assert_eq!(get_values(&table, "0000000024"), Some(vec!["24".to_string()]));

        // 21 records with interval 10 sample the last record naturally
        let path = write_csv(dir.path(), "test21.csv", &numbered_csv(21));
        let table = Table::build(&path, 10).expect("Failed to build table");
        assert_eq!(table.index.len(), 3);
        assert_eq!(get_values(&table, "0000000020"), Some(vec!["20".to_string()]));
    }

    #[test]
    fn test_bulk_matches_get() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = write_csv(dir.path(), "test.csv", &numbered_csv(100));
        let table = Table::build(&path, 10).expect("Failed to build table");

        let keys: Vec<String> = [
            "0000000000",
            "0000000004x", // miss inside a bucket, before a later hit
            "0000000005",
            "0000000005", // duplicate
            "0000000011",
            "0000000042",
            "0000000099",
            "0000000099x", // above the last key
        ]
        .iter()
        .map(|k| k.to_string())
        .collect();

        let bulk = table.bulk_get(&keys).expect("bulk_get failed");
        assert_eq!(bulk.values.len(), keys.len());
        for (key, value) in keys.iter().zip(&bulk.values) {
            assert_eq!(value, &get_values(&table, key), "key {key}");
        }
    }

    #[test]
    fn test_bulk_single_bucket_chunk() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = write_csv(dir.path(), "test.csv", &numbered_csv(1000));
        let table = Table::build(&path, 1000).expect("Failed to build table");

        // all three share the bucket starting at record 0
        let keys: Vec<String> = ["0000000000", "0000000500", "0000000999"]
            .iter()
            .map(|k| k.to_string())
            .collect();

        let bulk = table.bulk_get(&keys).expect("bulk_get failed");
        assert_eq!(
            bulk.values,
            vec![
                Some(vec!["0".to_string()]),
                Some(vec!["500".to_string()]),
                Some(vec!["999".to_string()]),
            ]
        );
    }

    #[test]
    fn test_bulk_unsorted_rejected() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = write_csv(dir.path(), "test.csv", &numbered_csv(10));
        let table = Table::build(&path, 10).expect("Failed to build table");

        let keys = vec!["0000000001".to_string(), "0000000000".to_string()];
        let err = table.bulk_get(&keys).unwrap_err();
        assert!(matches!(err, Error::KeysNotSorted { .. }), "got {err:?}");
    }

    #[test]
    fn test_bulk_empty_rejected() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = write_csv(dir.path(), "test.csv", &numbered_csv(10));
        let table = Table::build(&path, 10).expect("Failed to build table");

        let err = table.bulk_get(&[]).unwrap_err();
        assert_eq!(err, Error::EmptyBatch);
    }

    #[test]
    fn test_bulk_out_of_range_short_circuit() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = write_csv(dir.path(), "test.csv", "b,1\nc,2\n");
        let table = Table::build(&path, 10).expect("Failed to build table");

        let below = vec!["a1".to_string(), "a2".to_string()];
        assert_eq!(
            table.bulk_get(&below).expect("bulk_get failed").values,
            vec![None, None]
        );

        let above = vec!["x".to_string(), "y".to_string(), "z".to_string()];
        assert_eq!(
            table.bulk_get(&above).expect("bulk_get failed").values,
            vec![None, None, None]
        );
    }

    #[test]
    fn test_bulk_single_key_fast_path() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = write_csv(dir.path(), "test.csv", &numbered_csv(10));
        let table = Table::build(&path, 10).expect("Failed to build table");

        let bulk = table
            .bulk_get(&["0000000003".to_string()])
            .expect("bulk_get failed");
        assert_eq!(bulk.values, vec![Some(vec!["3".to_string()])]);
    }

    #[test]
    fn test_bulk_mixed_range_and_misses() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = write_csv(dir.path(), "test.csv", &numbered_csv(50));
        let table = Table::build(&path, 10).expect("Failed to build table");

        // straddles the range on both sides
        let keys: Vec<String> = ["0", "0000000007", "0000000031", "00000000499"]
            .iter()
            .map(|k| k.to_string())
            .collect();

        let bulk = table.bulk_get(&keys).expect("bulk_get failed");
        assert_eq!(
            bulk.values,
            vec![
                None,
                Some(vec!["7".to_string()]),
                Some(vec!["31".to_string()]),
                None,
            ]
        );
    }

    #[test]
    fn test_profile_phases_recorded() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = write_csv(dir.path(), "test.csv", &numbered_csv(100));
        let table = Table::build(&path, 10).expect("Failed to build table");

        let result = table.get("0000000042").expect("get failed");
        assert!(result.values.is_some());
        // scan covers at least one record read
        assert!(result.profile.scan > Duration::ZERO);
    }
}
