use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// YuccaDB errors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// A lookup against a table name that is not registered.
    TableNotFound(String),
    /// A table with this name already exists and replace was not requested.
    TableExists(String),
    /// The file path already backs a live table.
    FileInUse(String),
    /// Keys are not in non-decreasing order, either in a table file or in a
    /// bulk lookup batch.
    KeysNotSorted { prev: String, next: String },
    /// A bulk lookup was given an empty batch.
    EmptyBatch,
    /// The table file contains no records.
    EmptyFile(String),
    /// A record has fewer than two fields.
    InvalidRecord(String),
    /// An IO error.
    Io(String),
    /// A scan consumed more records than the index interval allows. Indicates
    /// a corrupted index.
    ScanOverrun(u64),
    /// A scan ran past the end of file outside the exact-hit case. Indicates
    /// a corrupted index.
    UnreachableState,
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::TableNotFound(name) => write!(f, "table {name} does not exist"),
            Error::TableExists(name) => {
                write!(f, "table {name} already exists and replace is false")
            }
            Error::FileInUse(path) => write!(f, "file {path} already backs a table"),
            Error::KeysNotSorted { prev, next } => {
                write!(f, "keys are not sorted: {prev:?}, {next:?}")
            }
            Error::EmptyBatch => write!(f, "bulk lookup with no keys"),
            Error::EmptyFile(path) => write!(f, "file {path} has no records"),
            Error::InvalidRecord(msg) => write!(f, "invalid record: {msg}"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
            Error::ScanOverrun(count) => write!(f, "too many scanned records: {count}"),
            Error::UnreachableState => write!(f, "scan ran past end of file"),
        }
    }
}

/// A YuccaDB Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<csv::Error> for Error {
    fn from(err: csv::Error) -> Self {
        match err.kind() {
            csv::ErrorKind::Io(e) => Error::Io(e.to_string()),
            _ => Error::InvalidRecord(err.to_string()),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Io(err.to_string())
    }
}
