//! Bounded forward scans over one bucket of a sorted table file.

use std::cmp::Ordering;
use std::fs::File;
use std::io::{Seek, SeekFrom};

use csv::{ByteRecord, Reader, ReaderBuilder};

use crate::error::{Error, Result};

/// A forward record reader positioned at a byte offset of a table file.
///
/// The scanner keeps a one-record lookahead: a record that resolves a lookup
/// as a miss (its key sorts after the target) stays buffered, so the next
/// lookup in a sorted batch can start from it without re-reading. Offsets are
/// absolute file positions; the reader only ever moves forward.
pub(crate) struct RecordScanner {
    reader: Reader<File>,
    record: ByteRecord,
    /// Offset the scanner was seeked to; reader positions are relative to it.
    base: u64,
    /// Absolute offset one past the most recently consumed record.
    consumed: u64,
    /// Absolute end offset of the buffered record.
    record_end: u64,
    buffered: bool,
    eof: bool,
}

impl RecordScanner {
    pub fn new(mut file: File, offset: u64) -> Result<Self> {
        file.seek(SeekFrom::Start(offset))?;
        let reader = ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(file);

        Ok(Self {
            reader,
            record: ByteRecord::new(),
            base: offset,
            consumed: offset,
            record_end: offset,
            buffered: false,
            eof: false,
        })
    }

    /// Reads the next record into the lookahead buffer if it is empty.
    /// Returns false at end of file.
    fn fill(&mut self) -> Result<bool> {
        if self.buffered {
            return Ok(true);
        }
        if self.eof {
            return Ok(false);
        }
        if self.reader.read_byte_record(&mut self.record)? {
            self.record_end = self.base + self.reader.position().byte();
            self.buffered = true;
            Ok(true)
        } else {
            self.eof = true;
            Ok(false)
        }
    }

    fn consume(&mut self) {
        self.buffered = false;
        self.consumed = self.record_end;
    }

    /// Scans forward for `key` within the bucket `[offset, limit)`.
    ///
    /// `offset` and `limit` come from the sparse index; `limit == offset`
    /// marks an exact index hit, where the record at `offset` is the target
    /// and no right-edge bound applies. `budget` is the index interval: a
    /// well-formed bucket never holds more records than that, so exceeding it
    /// means the index is corrupted.
    pub fn seek_key(
        &mut self,
        key: &[u8],
        offset: u64,
        limit: u64,
        budget: usize,
    ) -> Result<Option<Vec<String>>> {
        let mut scanned = 0usize;

        loop {
            if !self.fill()? {
                if limit == offset {
                    // exact hit on the file's last record, already consumed
                    return Ok(None);
                }
                return Err(Error::UnreachableState);
            }

            if self.record.len() < 2 {
                return Err(Error::InvalidRecord(format!(
                    "{} fields at offset {}",
                    self.record.len(),
                    self.consumed
                )));
            }

            match self.record[0].cmp(key) {
                Ordering::Equal => {
                    // copy the fields out: the row buffer is reused by the
                    // next read
                    let values = self
                        .record
                        .iter()
                        .skip(1)
                        .map(|field| String::from_utf8_lossy(field).into_owned())
                        .collect();
                    self.consume();
                    return Ok(Some(values));
                }
                Ordering::Greater => {
                    // the file is sorted, so the key cannot appear later;
                    // leave the record buffered for the next lookup
                    return Ok(None);
                }
                Ordering::Less => {
                    self.consume();
                    scanned += 1;

                    if self.consumed >= limit && limit != offset {
                        // reached the next index entry, means not found
                        return Ok(None);
                    }
                    if scanned > budget {
                        return Err(Error::ScanOverrun(scanned as u64));
                    }
                }
            }
        }
    }
}
