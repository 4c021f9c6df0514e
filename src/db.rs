//! The database: a registry of named tables behind a reader-writer lock.
//!
//! Readers hold the lock only long enough to clone the table's `Arc`; all
//! file I/O happens lockless. Writers build the new table with no lock held
//! and take the write lock for the install step alone, so a long-running
//! load never blocks reads. Replaced tables stay alive through outstanding
//! handles, and their backing file is deleted only after the registry has
//! swapped them out.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::table::{BulkResult, GetResult, Table};

/// A database instance: named, immutable tables loaded from sorted CSV
/// files.
pub struct Database {
    tables: RwLock<HashMap<String, Arc<Table>>>,
    config: Config,
}

impl Database {
    /// Creates an empty database with the default configuration.
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Creates an empty database with the given configuration.
    pub fn with_config(config: Config) -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Loads the CSV file at `path` and installs it as table `name`.
    ///
    /// The load is a full scan of the file and runs with no lock held;
    /// validation runs twice, before the load (read lock) and again at
    /// install time (write lock), because a concurrent `put_table` may have
    /// raced the build. On replacement the previous table's backing file is
    /// deleted once its last handle drops; a deletion failure is logged and
    /// the install stands.
    pub fn put_table(&self, name: &str, path: &str, replace: bool) -> Result<()> {
        {
            let tables = self.tables.read()?;
            Self::validate_put(&tables, name, path, replace)?;
        }

        let table = Table::build(path, self.config.index_interval)?;

        let previous = {
            let mut tables = self.tables.write()?;
            Self::validate_put(&tables, name, path, replace)?;
            tables.insert(name.to_string(), Arc::new(table))
        };

        match previous {
            Some(old) => {
                tracing::info!(
                    table = name,
                    old_file = old.path(),
                    file = path,
                    "replaced table"
                );
                // deletes the old backing file once the last handle drops
                old.mark_evicted();
            }
            None => tracing::info!(table = name, file = path, "installed table"),
        }

        Ok(())
    }

    fn validate_put(
        tables: &HashMap<String, Arc<Table>>,
        name: &str,
        path: &str,
        replace: bool,
    ) -> Result<()> {
        if !replace && tables.contains_key(name) {
            return Err(Error::TableExists(name.to_string()));
        }
        if tables.values().any(|table| table.path() == path) {
            return Err(Error::FileInUse(path.to_string()));
        }
        Ok(())
    }

    /// Looks up a single key in the named table.
    pub fn get_value(&self, name: &str, key: &str) -> Result<GetResult> {
        self.table(name)?.get(key)
    }

    /// Looks up a sorted batch of keys in the named table.
    pub fn bulk_get_values(&self, name: &str, keys: &[String]) -> Result<BulkResult> {
        self.table(name)?.bulk_get(keys)
    }

    /// Install time of the named table, if present.
    pub fn table_timestamp(&self, name: &str) -> Option<SystemTime> {
        self.tables
            .read()
            .unwrap()
            .get(name)
            .map(|table| table.timestamp())
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.tables.read().unwrap().contains_key(name)
    }

    pub fn tables(&self) -> Vec<String> {
        self.tables.read().unwrap().keys().cloned().collect()
    }

    /// Resolves a table handle under the read lock; I/O happens after the
    /// lock is released.
    fn table(&self, name: &str) -> Result<Arc<Table>> {
        let tables = self.tables.read()?;
        tables
            .get(name)
            .cloned()
            .ok_or_else(|| Error::TableNotFound(name.to_string()))
    }
}

impl Default for Database {
    fn default() -> Self {
        Self::new()
    }
}
