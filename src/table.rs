// Copyright 2025 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Big-endian table codec and the bounded cache of decoded tables.

use std::num::NonZeroUsize;
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use lru::LruCache;
use parking_lot::Mutex;

use crate::raw_file::RawFile;
use crate::{Error, Result};

// Each table is around a single cluster in size, so at the default cluster
// size this keeps up to 64 MiB of tables in memory.
pub(crate) const TABLE_CACHE_ENTRIES: usize = 1000;

/// Reads a table of `count` 64-bit big-endian entries at `offset`.
pub(crate) fn read_table(raw: &RawFile, offset: u64, count: u64) -> Result<Vec<u64>> {
    let byte_len = count
        .checked_mul(8)
        .ok_or(Error::Corrupt("table size overflows"))?;
    let file_len = raw.len().map_err(Error::IoFailure)?;
    if offset.checked_add(byte_len).map_or(true, |end| end > file_len) {
        return Err(Error::Corrupt("table extends past the end of the file"));
    }

    let mut buf = vec![0u8; byte_len as usize];
    raw.read_exact_at(&mut buf, offset).map_err(Error::IoFailure)?;
    let mut table = vec![0u64; count as usize];
    BigEndian::read_u64_into(&buf, &mut table);
    Ok(table)
}

/// Writes `table` back-to-back as 64-bit big-endian entries at `offset`.
pub(crate) fn write_table(raw: &RawFile, offset: u64, table: &[u64]) -> Result<()> {
    let mut buf = vec![0u8; table.len() * 8];
    BigEndian::write_u64_into(table, &mut buf);
    raw.write_all_at(&buf, offset).map_err(Error::IoFailure)
}

/// Bounded LRU cache of decoded tables keyed by `(offset, entry count)`.
///
/// Cached arrays are immutable; updates clone the array, modify the copy and
/// push it through [`TableCache::write`], which invalidates the stale entry.
/// Aliasing between different keys is not tracked: every table in the image
/// is a whole number of clusters and is never partially overwritten.
#[derive(Debug)]
pub(crate) struct TableCache {
    tables: Mutex<LruCache<(u64, u64), Arc<[u64]>>>,
}

impl TableCache {
    pub fn new(capacity: usize) -> TableCache {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        TableCache {
            tables: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Returns the table at `(offset, count)`, reading it from the file on a
    /// miss.
    pub fn read(&self, raw: &RawFile, offset: u64, count: u64) -> Result<Arc<[u64]>> {
        if let Some(table) = self.tables.lock().get(&(offset, count)) {
            return Ok(table.clone());
        }
        let table: Arc<[u64]> = read_table(raw, offset, count)?.into();
        self.tables.lock().put((offset, count), table.clone());
        Ok(table)
    }

    /// Writes `table` at `offset` and drops the cached copy for that key.
    pub fn write(&self, raw: &RawFile, offset: u64, table: &[u64]) -> Result<()> {
        write_table(raw, offset, table)?;
        self.tables.lock().pop(&(offset, table.len() as u64));
        Ok(())
    }
}
