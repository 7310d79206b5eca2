// Copyright 2025 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Reader/writer for QCOW2 version-3 virtual disk images.
//!
//! A qcow2 file is a sparse copy-on-write block container maintained by the
//! qemu project: guest disk offsets map through a two-level L1/L2 table to
//! clusters of a regular host file, clusters are allocated on first write,
//! and per-cluster reference counts let a prepared snapshot share clusters
//! with the live image until a write copies them.
//!
//! [`Image`] is the entry point. Positioned reads take a shared lock and may
//! run concurrently; writes are serialized. The streaming [`Image::read`] /
//! [`Image::write`] calls advance an internal cursor under its own lock, and
//! [`std::io::Read`]/[`Write`]/[`Seek`] are implemented on top of it.

mod decoder;
mod entry;
mod header;
mod raw_file;
mod refcount;
mod table;

use std::cmp::min;
use std::fs::OpenOptions;
use std::io::{self, SeekFrom};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::Arc;

use log::{error, warn};
use parking_lot::{Mutex, RwLock};
use remain::sorted;
use thiserror::Error;

use crate::entry::{L1Entry, L2Entry};
use crate::header::Layout;
use crate::raw_file::RawFile;
use crate::refcount::RefcountEngine;
use crate::table::TableCache;

pub use crate::header::{Header, HeaderExtension, IncompatibleFeatures};

#[sorted]
#[derive(Debug, Error)]
pub enum Error {
    /// Impossible table state discovered at runtime.
    #[error("corrupt image: {0}")]
    Corrupt(&'static str),
    /// DEFLATE decoding of a compressed cluster failed.
    #[error("failed to decompress cluster")]
    DecompressFailure(#[source] flate2::DecompressError),
    /// The file is not a usable qcow2 version-3 image.
    #[error("invalid image: {0}")]
    InvalidImage(String),
    /// An operation on the backing file failed.
    #[error("io failure")]
    IoFailure(#[source] io::Error),
    /// A write extends past the end of the virtual disk.
    #[error("write of {length} bytes at {offset} extends past the end of the disk")]
    OutOfRange { offset: u64, length: usize },
}

pub type Result<T> = std::result::Result<T, Error>;

/// An open qcow2 image.
///
/// # Example
///
/// ```no_run
/// # fn main() -> qcow2::Result<()> {
/// let image = qcow2::Image::create("disk.qcow2", 1 << 30)?;
/// image.write_at(b"boot", 4096)?;
/// let mut buf = [0u8; 4];
/// image.read_at(&mut buf, 4096)?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Image {
    state: RwLock<ImageState>,
    cursor: Mutex<u64>,
}

impl Image {
    /// Creates an image of virtual size `size` at `path`, then opens it
    /// read-write.
    ///
    /// The metadata tables are laid out contiguously: header cluster, L1
    /// table, one L2 table per L1 slot, refcount table, refcount blocks.
    /// The header is written last so a partial create never parses as a
    /// valid image.
    pub fn create<P: AsRef<Path>>(path: P, size: u64) -> Result<Image> {
        let layout = Layout::for_size(size)?;
        let header = Header::create_for_size(size)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o644)
            .open(path.as_ref())
            .map_err(Error::IoFailure)?;
        let raw_file = RawFile::new(file, layout.cluster_size)
            .ok_or_else(|| Error::InvalidImage("invalid cluster size".into()))?;

        // Zero-extends through the L2 tables and the refcount blocks.
        raw_file.set_len(layout.file_len()).map_err(Error::IoFailure)?;

        let mut l1_table = vec![0u64; layout.l1_size as usize];
        for (i, entry) in l1_table.iter_mut().enumerate() {
            *entry =
                L1Entry::new(layout.l2_tables_offset() + i as u64 * layout.cluster_size).raw();
        }
        table::write_table(&raw_file, layout.l1_table_offset(), &l1_table)?;

        let mut refcount_table = vec![0u64; layout.rcb_clusters as usize];
        for (i, entry) in refcount_table.iter_mut().enumerate() {
            *entry = layout.refcount_blocks_offset() + i as u64 * layout.cluster_size;
        }
        table::write_table(&raw_file, layout.refcount_table_offset(), &refcount_table)?;

        raw_file
            .write_all_at(&header.encode(), 0)
            .map_err(Error::IoFailure)?;
        raw_file.sync().map_err(Error::IoFailure)?;
        drop(raw_file);

        Self::open(path.as_ref(), false)
    }

    /// Opens and validates the image at `path`.
    pub fn open<P: AsRef<Path>>(path: P, read_only: bool) -> Result<Image> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path.as_ref())
            .map_err(Error::IoFailure)?;
        let header = Header::read_from(&file)?;
        let cluster_size = 1u64 << header.cluster_bits;
        let raw_file = RawFile::new(file, cluster_size)
            .ok_or_else(|| Error::InvalidImage("invalid cluster size".into()))?;
        let refcounts = RefcountEngine::new(
            header.refcount_table_offset,
            header.refcount_table_clusters,
            header.refcount_order,
            cluster_size,
        );
        let l2_entries = cluster_size / 8;
        Ok(Image {
            state: RwLock::new(ImageState {
                raw_file,
                header,
                tables: TableCache::new(table::TABLE_CACHE_ENTRIES),
                refcounts,
                l2_entries,
            }),
            cursor: Mutex::new(0),
        })
    }

    /// Virtual size of the disk in bytes.
    pub fn size(&self) -> u64 {
        self.state.read().header.size
    }

    /// A copy of the validated header, for inspection.
    pub fn header(&self) -> Header {
        self.state.read().header.clone()
    }

    /// Reads into `buf` at `disk_offset`, returning the number of bytes
    /// read. Reads are clipped at the end of the disk; a read at or past the
    /// end returns 0. Holes read as zeros and compressed clusters are
    /// decompressed transparently.
    pub fn read_at(&self, buf: &mut [u8], disk_offset: u64) -> Result<usize> {
        self.state.read().read_at(buf, disk_offset)
    }

    /// Writes `buf` at `disk_offset`, allocating or copying clusters as
    /// needed, and returns `buf.len()`.
    ///
    /// Fails with [`Error::OutOfRange`] if the buffer extends past the end
    /// of the disk. On an I/O error, clusters earlier in the range may
    /// already have been written.
    pub fn write_at(&self, buf: &[u8], disk_offset: u64) -> Result<usize> {
        self.state.write().write_at(buf, disk_offset)
    }

    /// Streaming read at the internal cursor.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut cursor = self.cursor.lock();
        let nread = self.state.read().read_at(buf, *cursor)?;
        *cursor += nread as u64;
        Ok(nread)
    }

    /// Streaming write at the internal cursor.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        let mut cursor = self.cursor.lock();
        let nwritten = self.state.write().write_at(buf, *cursor)?;
        *cursor += nwritten as u64;
        Ok(nwritten)
    }

    /// Flushes the backing file. Metadata updates are write-through, so this
    /// is the image's only durability point.
    pub fn sync(&self) -> Result<()> {
        self.state.read().raw_file.sync().map_err(Error::IoFailure)
    }

    /// Prepares for copy-on-write by incrementing the refcount of every
    /// currently allocated data cluster.
    ///
    /// This is snapshot preparation only: the L1/L2 tables are not cloned
    /// and no snapshot-table entry is recorded. After this call, writes copy
    /// shared clusters instead of overwriting them.
    pub fn snapshot(&self) -> Result<()> {
        let state = self.state.write();
        state.refcounts.increment_references(
            &state.raw_file,
            &state.tables,
            state.header.l1_table_offset,
            u64::from(state.header.l1_size),
        )
    }

    /// Releases the backing file handle. All state lives in the file;
    /// callers needing durability should [`Image::sync`] first.
    pub fn close(self) -> Result<()> {
        Ok(())
    }
}

impl io::Read for Image {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Image::read(self, buf).map_err(io::Error::other)
    }
}

impl io::Write for Image {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Image::write(self, buf).map_err(io::Error::other)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sync().map_err(io::Error::other)
    }
}

impl io::Seek for Image {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let size = self.size();
        let mut cursor = self.cursor.lock();
        let new_offset = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(offset) => {
                if offset < 0 {
                    size.checked_sub(offset.unsigned_abs())
                } else {
                    size.checked_add(offset as u64)
                }
            }
            SeekFrom::Current(offset) => {
                if offset < 0 {
                    cursor.checked_sub(offset.unsigned_abs())
                } else {
                    cursor.checked_add(offset as u64)
                }
            }
        };
        match new_offset {
            Some(offset) if offset <= size => {
                *cursor = offset;
                Ok(offset)
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek past the end of the disk",
            )),
        }
    }
}

// The file, validated header, table cache and refcount engine, guarded as a
// unit by the image's reader-writer lock.
#[derive(Debug)]
struct ImageState {
    raw_file: RawFile,
    header: Header,
    tables: TableCache,
    refcounts: RefcountEngine,
    l2_entries: u64,
}

impl ImageState {
    fn cluster_size(&self) -> u64 {
        self.raw_file.cluster_size()
    }

    fn l1_index(&self, disk_offset: u64) -> usize {
        (disk_offset / self.cluster_size() / self.l2_entries) as usize
    }

    fn l2_index(&self, disk_offset: u64) -> usize {
        (disk_offset / self.cluster_size() % self.l2_entries) as usize
    }

    fn l1_table(&self) -> Result<Arc<[u64]>> {
        self.tables.read(
            &self.raw_file,
            self.header.l1_table_offset,
            u64::from(self.header.l1_size),
        )
    }

    fn l1_entry(&self, disk_offset: u64) -> Result<L1Entry> {
        let table = self.l1_table()?;
        let raw = table
            .get(self.l1_index(disk_offset))
            .copied()
            .ok_or(Error::Corrupt("disk offset is beyond the L1 table"))?;
        Ok(L1Entry::from_raw(raw))
    }

    fn l2_table(&self, l1_entry: L1Entry) -> Result<Arc<[u64]>> {
        self.tables
            .read(&self.raw_file, l1_entry.host_offset(), self.l2_entries)
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        if offset >= self.header.size {
            return Ok(0);
        }
        let count = min(buf.len() as u64, self.header.size - offset) as usize;
        let mut nread = 0;
        while nread < count {
            nread += self.read_cluster(offset + nread as u64, &mut buf[nread..count])?;
        }
        Ok(count)
    }

    fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<usize> {
        match offset.checked_add(buf.len() as u64) {
            Some(end) if end <= self.header.size => {}
            _ => {
                return Err(Error::OutOfRange {
                    offset,
                    length: buf.len(),
                })
            }
        }
        let mut nwritten = 0;
        while nwritten < buf.len() {
            nwritten += self.write_cluster(offset + nwritten as u64, &buf[nwritten..])?;
        }
        Ok(buf.len())
    }

    // Transfers at most one cluster's worth of bytes starting at
    // `disk_offset` into `buf` and returns the count.
    fn read_cluster(&self, disk_offset: u64, buf: &mut [u8]) -> Result<usize> {
        let in_cluster = self.raw_file.cluster_offset(disk_offset);
        let count = min(buf.len() as u64, self.cluster_size() - in_cluster) as usize;
        let buf = &mut buf[..count];

        let l1_entry = self.l1_entry(disk_offset)?;
        if l1_entry.host_offset() == 0 {
            buf.fill(0);
            return Ok(count);
        }
        let l2_table = self.l2_table(l1_entry)?;
        let l2_entry = L2Entry::from_raw(l2_table[self.l2_index(disk_offset)]);

        if l2_entry.is_unallocated() {
            buf.fill(0);
        } else if l2_entry.is_compressed() {
            let cluster = self.read_compressed_cluster(l2_entry)?;
            buf.copy_from_slice(&cluster[in_cluster as usize..in_cluster as usize + count]);
        } else {
            let host_offset = self.standard_host_cluster(l2_entry)?;
            self.raw_file
                .read_exact_at(buf, host_offset + in_cluster)
                .map_err(Error::IoFailure)?;
        }
        Ok(count)
    }

    // Transfers at most one cluster's worth of bytes from `buf` to the disk
    // at `disk_offset`, allocating or copying the target cluster first.
    fn write_cluster(&mut self, disk_offset: u64, buf: &[u8]) -> Result<usize> {
        let in_cluster = self.raw_file.cluster_offset(disk_offset);
        let count = min(buf.len() as u64, self.cluster_size() - in_cluster) as usize;

        let l2_entry = self.l2_entry_for_write(disk_offset)?;
        let host_cluster = if l2_entry.is_compressed() {
            self.rewrite_compressed_cluster(disk_offset, l2_entry)?
        } else {
            let refcount = if l2_entry.is_unallocated() {
                0
            } else {
                self.refcounts
                    .get(&self.raw_file, &self.tables, disk_offset)?
            };
            match refcount {
                0 => self.allocate_data_cluster(disk_offset)?,
                1 => self.standard_host_cluster(l2_entry)?,
                shared => self.copy_data_cluster(disk_offset, l2_entry, shared)?,
            }
        };

        self.raw_file
            .write_all_at(&buf[..count], host_cluster + in_cluster)
            .map_err(Error::IoFailure)?;
        Ok(count)
    }

    // Returns the L2 entry covering `disk_offset`, allocating a zeroed L2
    // table first if this L1 slot has none (images created elsewhere leave
    // L2 tables unallocated).
    fn l2_entry_for_write(&mut self, disk_offset: u64) -> Result<L2Entry> {
        let l1_entry = self.l1_entry(disk_offset)?;
        if l1_entry.host_offset() == 0 {
            let table_cluster = self.raw_file.append_cluster().map_err(Error::IoFailure)?;
            let l1_table = self.l1_table()?;
            let mut updated = l1_table.to_vec();
            updated[self.l1_index(disk_offset)] = L1Entry::new(table_cluster).raw();
            self.tables
                .write(&self.raw_file, self.header.l1_table_offset, &updated)?;
            return Ok(L2Entry::from_raw(0));
        }
        let l2_table = self.l2_table(l1_entry)?;
        Ok(L2Entry::from_raw(l2_table[self.l2_index(disk_offset)]))
    }

    // Host offset of a standard entry's data cluster, which must be cluster
    // aligned.
    fn standard_host_cluster(&self, l2_entry: L2Entry) -> Result<u64> {
        let host_offset = l2_entry.host_offset(self.header.cluster_bits);
        if self.raw_file.cluster_offset(host_offset) != 0 {
            error!("data cluster offset {host_offset:#x} is not cluster aligned");
            return Err(Error::Corrupt("data cluster offset is not cluster aligned"));
        }
        Ok(host_offset)
    }

    // Reads and decompresses a compressed cluster in full.
    fn read_compressed_cluster(&self, l2_entry: L2Entry) -> Result<Vec<u8>> {
        let cluster_bits = self.header.cluster_bits;
        let host_offset = l2_entry.host_offset(cluster_bits);
        let compressed_len = l2_entry.compressed_byte_size(cluster_bits) as usize;

        // The sector-granular length can run past the end of the file for
        // the last cluster in the image; the tail stays zero.
        let mut compressed = vec![0u8; compressed_len];
        let nread = self
            .raw_file
            .read_at(&mut compressed, host_offset)
            .map_err(Error::IoFailure)?;
        if nread == 0 {
            return Err(Error::Corrupt(
                "compressed cluster offset is past the end of the file",
            ));
        }
        if nread < compressed_len {
            warn!("short read of compressed cluster at {host_offset:#x}: {nread} of {compressed_len} bytes");
        }

        let mut cluster = vec![0u8; self.cluster_size() as usize];
        let decompressed = decoder::inflate_cluster(&compressed[..nread], &mut cluster)?;
        if decompressed != cluster.len() {
            return Err(Error::Corrupt(
                "compressed cluster does not decompress to a full cluster",
            ));
        }
        Ok(cluster)
    }

    // Metadata updates below happen in the order: allocate, update L2, set
    // refcount. There is no journaling; a crash between steps can leak the
    // new cluster.

    // Backs `disk_offset` with a fresh zeroed cluster.
    fn allocate_data_cluster(&mut self, disk_offset: u64) -> Result<u64> {
        let new_cluster = self.raw_file.append_cluster().map_err(Error::IoFailure)?;
        self.update_l2_entry(disk_offset, L2Entry::new_standard(new_cluster))?;
        self.refcounts
            .set(&self.raw_file, &self.tables, disk_offset, 1)?;
        Ok(new_cluster)
    }

    // Copy-on-write: duplicates the shared cluster, repoints L2 at the copy
    // and drops the departing reference from the slot.
    fn copy_data_cluster(
        &mut self,
        disk_offset: u64,
        l2_entry: L2Entry,
        refcount: u64,
    ) -> Result<u64> {
        let old_cluster = self.standard_host_cluster(l2_entry)?;
        let new_cluster = self.raw_file.append_cluster().map_err(Error::IoFailure)?;
        let mut contents = vec![0u8; self.cluster_size() as usize];
        self.raw_file
            .read_exact_at(&mut contents, old_cluster)
            .map_err(Error::IoFailure)?;
        self.raw_file
            .write_all_at(&contents, new_cluster)
            .map_err(Error::IoFailure)?;
        self.update_l2_entry(disk_offset, L2Entry::new_standard(new_cluster))?;
        self.refcounts
            .set(&self.raw_file, &self.tables, disk_offset, refcount - 1)?;
        Ok(new_cluster)
    }

    // In-place writes into a DEFLATE stream are impossible: decompress into
    // a fresh cluster and rewrite the entry as standard.
    fn rewrite_compressed_cluster(&mut self, disk_offset: u64, l2_entry: L2Entry) -> Result<u64> {
        let contents = self.read_compressed_cluster(l2_entry)?;
        let refcount = self
            .refcounts
            .get(&self.raw_file, &self.tables, disk_offset)?;
        let new_cluster = self.raw_file.append_cluster().map_err(Error::IoFailure)?;
        self.raw_file
            .write_all_at(&contents, new_cluster)
            .map_err(Error::IoFailure)?;
        self.update_l2_entry(disk_offset, L2Entry::new_standard(new_cluster))?;
        self.refcounts.set(
            &self.raw_file,
            &self.tables,
            disk_offset,
            refcount.saturating_sub(1).max(1),
        )?;
        Ok(new_cluster)
    }

    // Clones the covering L2 table, rewrites one entry and writes the table
    // back through the cache.
    fn update_l2_entry(&mut self, disk_offset: u64, entry: L2Entry) -> Result<()> {
        let l1_entry = self.l1_entry(disk_offset)?;
        let l2_offset = l1_entry.host_offset();
        if l2_offset == 0 {
            return Err(Error::Corrupt("L2 table vanished during a write"));
        }
        let l2_table = self.l2_table(l1_entry)?;
        let mut updated = l2_table.to_vec();
        updated[self.l2_index(disk_offset)] = entry.raw();
        self.tables.write(&self.raw_file, l2_offset, &updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, Write};
    use std::os::unix::fs::FileExt;

    use vmm_sys_util::tempfile::TempFile;

    const CLUSTER_SIZE: u64 = 1 << 16;

    // Deterministic non-trivial bytes.
    fn test_pattern(len: usize, seed: u32) -> Vec<u8> {
        let mut state = seed | 1;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                state as u8
            })
            .collect()
    }

    fn refcount_at(image: &Image, disk_offset: u64) -> u64 {
        let state = image.state.read();
        state
            .refcounts
            .get(&state.raw_file, &state.tables, disk_offset)
            .unwrap()
    }

    #[test]
    fn create_reports_size_and_layout() {
        let t = TempFile::new().unwrap();
        let image = Image::create(t.as_path(), 1 << 30).unwrap();
        assert_eq!(image.size(), 1_073_741_824);
        drop(image);

        // header + L1 + 3 L2 tables + refcount table + refcount block.
        assert_eq!(
            std::fs::metadata(t.as_path()).unwrap().len(),
            7 * CLUSTER_SIZE
        );

        let bytes = std::fs::read(t.as_path()).unwrap();
        for i in 0..3usize {
            let raw = u64::from_be_bytes(bytes[0x1_0000 + i * 8..][..8].try_into().unwrap());
            let l1_entry = entry::L1Entry::from_raw(raw);
            assert_eq!(l1_entry.host_offset() % CLUSTER_SIZE, 0);
            assert_eq!(l1_entry.host_offset(), 0x2_0000 + i as u64 * CLUSTER_SIZE);
            assert_eq!(raw & (1 << 63), 1 << 63);
        }
        let refcount_entry = u64::from_be_bytes(bytes[0x5_0000..][..8].try_into().unwrap());
        assert_eq!(refcount_entry, 0x6_0000);
    }

    #[test]
    fn fresh_image_reads_zero() {
        let t = TempFile::new().unwrap();
        let image = Image::create(t.as_path(), 1 << 30).unwrap();
        let mut buf = vec![0xffu8; 4096];
        assert_eq!(image.read_at(&mut buf, 0).unwrap(), 4096);
        assert!(buf.iter().all(|&b| b == 0));

        let mut buf = vec![0xffu8; 8192];
        assert_eq!(image.read_at(&mut buf, 123_456_789).unwrap(), 8192);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn unaligned_round_trip() {
        let t = TempFile::new().unwrap();
        let image = Image::create(t.as_path(), 1 << 30).unwrap();
        let data = test_pattern(4096, 42);
        assert_eq!(image.write_at(&data, 12345).unwrap(), 4096);

        let mut readback = vec![0u8; 4096];
        assert_eq!(image.read_at(&mut readback, 12345).unwrap(), 4096);
        assert_eq!(readback, data);

        // The write stayed inside guest cluster 0, whose refcount is now 1.
        assert_eq!(refcount_at(&image, 12345), 1);
    }

    #[test]
    fn cross_cluster_write() {
        let t = TempFile::new().unwrap();
        let image = Image::create(t.as_path(), 1 << 30).unwrap();
        // 200 KiB at 50 KiB spans guest clusters 0 (partially), 1, 2 and 3.
        let data = test_pattern(200 * 1024, 7);
        image.write_at(&data, 50 * 1024).unwrap();

        let mut readback = vec![0u8; data.len()];
        image.read_at(&mut readback, 50 * 1024).unwrap();
        assert_eq!(readback, data);

        for cluster in 0..4u64 {
            assert_eq!(refcount_at(&image, cluster * CLUSTER_SIZE), 1);
        }
        assert_eq!(refcount_at(&image, 4 * CLUSTER_SIZE), 0);
    }

    #[test]
    fn refcounts_track_allocated_clusters() {
        let t = TempFile::new().unwrap();
        let image = Image::create(t.as_path(), 1 << 22).unwrap();
        image.write_at(&test_pattern(100, 1), 0).unwrap();
        image
            .write_at(&test_pattern(100, 2), 3 * CLUSTER_SIZE + 5)
            .unwrap();

        for cluster in 0..8u64 {
            let expected = u64::from(cluster == 0 || cluster == 3);
            assert_eq!(refcount_at(&image, cluster * CLUSTER_SIZE), expected);
        }
    }

    #[test]
    fn snapshot_then_write_copies_cluster() {
        let t = TempFile::new().unwrap();
        let image = Image::create(t.as_path(), 1 << 26).unwrap();
        let offset = 5 * CLUSTER_SIZE;

        let pattern_a = test_pattern(CLUSTER_SIZE as usize, 3);
        image.write_at(&pattern_a, offset).unwrap();
        // The 64 MiB image has 5 metadata clusters, so the first data
        // cluster lands right after them.
        let host_a = 5 * CLUSTER_SIZE;
        assert_eq!(
            std::fs::metadata(t.as_path()).unwrap().len(),
            6 * CLUSTER_SIZE
        );
        assert_eq!(refcount_at(&image, offset), 1);

        image.snapshot().unwrap();
        assert_eq!(refcount_at(&image, offset), 2);

        let pattern_b = test_pattern(CLUSTER_SIZE as usize, 9);
        image.write_at(&pattern_b, offset).unwrap();

        let mut readback = vec![0u8; CLUSTER_SIZE as usize];
        image.read_at(&mut readback, offset).unwrap();
        assert_eq!(readback, pattern_b);
        assert_eq!(refcount_at(&image, offset), 1);
        drop(image);

        // Both generations are present in the host file: the snapshot's at
        // the old offset, the live data in the copied cluster.
        let bytes = std::fs::read(t.as_path()).unwrap();
        let host_b = 6 * CLUSTER_SIZE;
        assert_eq!(&bytes[host_a as usize..][..pattern_a.len()], &pattern_a[..]);
        assert_eq!(&bytes[host_b as usize..][..pattern_b.len()], &pattern_b[..]);
    }

    #[test]
    fn compressed_cluster_reads_plaintext() {
        use flate2::write::DeflateEncoder;
        use flate2::Compression;

        let t = TempFile::new().unwrap();
        Image::create(t.as_path(), 1 << 20).unwrap().close().unwrap();

        let plain: Vec<u8> = (0..CLUSTER_SIZE).map(|i| (i % 251) as u8).collect();
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&plain).unwrap();
        let compressed = encoder.finish().unwrap();

        // Append the raw DEFLATE stream and point guest cluster 0's L2
        // entry at it. The first L2 table sits in cluster 2.
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(t.as_path())
            .unwrap();
        let host_offset = file.metadata().unwrap().len();
        file.write_all_at(&compressed, host_offset).unwrap();

        let extra_sectors = (compressed.len() as u64 + 511) / 512 - 1;
        let l2_entry = (1u64 << 62) | (extra_sectors << 54) | host_offset;
        file.write_all_at(&l2_entry.to_be_bytes(), 2 * CLUSTER_SIZE)
            .unwrap();
        drop(file);

        let image = Image::open(t.as_path(), true).unwrap();
        let mut buf = vec![0u8; CLUSTER_SIZE as usize];
        assert_eq!(image.read_at(&mut buf, 0).unwrap(), CLUSTER_SIZE as usize);
        assert_eq!(buf, plain);

        // An unaligned slice inside the compressed cluster works too.
        let mut small = [0u8; 100];
        image.read_at(&mut small, 1000).unwrap();
        assert_eq!(&small[..], &plain[1000..1100]);
    }

    #[test]
    fn write_to_compressed_cluster_rewrites_it() {
        use flate2::write::DeflateEncoder;
        use flate2::Compression;

        let t = TempFile::new().unwrap();
        Image::create(t.as_path(), 1 << 20).unwrap().close().unwrap();

        let plain: Vec<u8> = (0..CLUSTER_SIZE).map(|i| (i % 13) as u8).collect();
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&plain).unwrap();
        let compressed = encoder.finish().unwrap();

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(t.as_path())
            .unwrap();
        let host_offset = file.metadata().unwrap().len();
        file.write_all_at(&compressed, host_offset).unwrap();
        let extra_sectors = (compressed.len() as u64 + 511) / 512 - 1;
        let l2_entry = (1u64 << 62) | (extra_sectors << 54) | host_offset;
        file.write_all_at(&l2_entry.to_be_bytes(), 2 * CLUSTER_SIZE)
            .unwrap();
        drop(file);

        let image = Image::open(t.as_path(), false).unwrap();
        image.write_at(b"overwrite", 100).unwrap();

        // The rest of the cluster kept the decompressed contents.
        let mut buf = vec![0u8; CLUSTER_SIZE as usize];
        image.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf[..100], &plain[..100]);
        assert_eq!(&buf[100..109], b"overwrite");
        assert_eq!(&buf[109..], &plain[109..]);
        assert_eq!(refcount_at(&image, 0), 1);
    }

    #[test]
    fn read_clips_at_end_of_disk() {
        let t = TempFile::new().unwrap();
        let image = Image::create(t.as_path(), 1 << 20).unwrap();
        let size = image.size();

        let mut buf = [0u8; 100];
        assert_eq!(image.read_at(&mut buf, size - 10).unwrap(), 10);
        assert_eq!(image.read_at(&mut buf, size).unwrap(), 0);
        assert_eq!(image.read_at(&mut buf, size + 1000).unwrap(), 0);
    }

    #[test]
    fn write_past_end_fails() {
        let t = TempFile::new().unwrap();
        let image = Image::create(t.as_path(), 1 << 20).unwrap();
        let size = image.size();

        let err = image.write_at(&[0u8; 20], size - 10).unwrap_err();
        assert!(matches!(err, Error::OutOfRange { .. }));
        // The boundary itself is fine.
        image.write_at(&[0u8; 10], size - 10).unwrap();
    }

    #[test]
    fn streaming_copy_between_images() {
        let t_src = TempFile::new().unwrap();
        let mut src = Image::create(t_src.as_path(), 1 << 20).unwrap();
        let data_head = test_pattern(4096, 1);
        let data_tail = test_pattern(70_000, 2);
        src.write_at(&data_head, 0).unwrap();
        src.write_at(&data_tail, 500_000).unwrap();

        let t_dst = TempFile::new().unwrap();
        let mut dst = Image::create(t_dst.as_path(), 1 << 20).unwrap();
        assert_eq!(io::copy(&mut src, &mut dst).unwrap(), 1 << 20);

        let mut a = vec![0u8; 1 << 20];
        let mut b = vec![0u8; 1 << 20];
        src.read_at(&mut a, 0).unwrap();
        dst.read_at(&mut b, 0).unwrap();
        assert_eq!(a, b);
        assert_eq!(&b[..4096], &data_head[..]);
        assert_eq!(&b[500_000..570_000], &data_tail[..]);
    }

    #[test]
    fn seek_and_streaming_read() {
        let t = TempFile::new().unwrap();
        let mut image = Image::create(t.as_path(), 1 << 20).unwrap();
        let data = test_pattern(100, 5);
        image.write_at(&data, 12345).unwrap();

        image.seek(SeekFrom::Start(12345)).unwrap();
        let mut buf = [0u8; 100];
        assert_eq!(Image::read(&image, &mut buf).unwrap(), 100);
        assert_eq!(&buf[..], &data[..]);
        assert_eq!(image.seek(SeekFrom::Current(0)).unwrap(), 12445);

        let size = image.size();
        assert_eq!(image.seek(SeekFrom::End(-10)).unwrap(), size - 10);
        assert!(image.seek(SeekFrom::Start(size + 1)).is_err());
    }

    #[test]
    fn streaming_read_hits_end_of_disk() {
        let t = TempFile::new().unwrap();
        let mut image = Image::create(t.as_path(), 1 << 20).unwrap();
        image.seek(SeekFrom::End(0)).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(Image::read(&image, &mut buf).unwrap(), 0);
        let mut everything = Vec::new();
        image.seek(SeekFrom::Start(0)).unwrap();
        std::io::Read::read_to_end(&mut image, &mut everything).unwrap();
        assert_eq!(everything.len(), 1 << 20);
    }

    #[test]
    fn open_is_byte_stable() {
        let t = TempFile::new().unwrap();
        Image::create(t.as_path(), 1 << 20).unwrap().close().unwrap();
        let before = std::fs::read(t.as_path()).unwrap();

        Image::open(t.as_path(), true).unwrap().close().unwrap();
        let after = std::fs::read(t.as_path()).unwrap();
        assert_eq!(before, after);
    }

    fn corrupt_and_open(mutate: impl Fn(&std::fs::File)) -> Error {
        let t = TempFile::new().unwrap();
        Image::create(t.as_path(), 1 << 20).unwrap().close().unwrap();
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(t.as_path())
            .unwrap();
        mutate(&file);
        drop(file);
        Image::open(t.as_path(), false).unwrap_err()
    }

    #[test]
    fn open_rejects_bad_headers() {
        // Magic.
        let err = corrupt_and_open(|f| f.write_all_at(&[0], 0).unwrap());
        assert!(matches!(err, Error::InvalidImage(_)));
        // Version 2.
        let err = corrupt_and_open(|f| f.write_all_at(&[2], 7).unwrap());
        assert!(matches!(err, Error::InvalidImage(_)));
        // Encryption.
        let err = corrupt_and_open(|f| f.write_all_at(&[1], 35).unwrap());
        assert!(matches!(err, Error::InvalidImage(_)));
        // Backing file offset.
        let err = corrupt_and_open(|f| f.write_all_at(&[1], 15).unwrap());
        assert!(matches!(err, Error::InvalidImage(_)));
        // Incompatible feature bit (dirty).
        let err = corrupt_and_open(|f| f.write_all_at(&[1], 79).unwrap());
        match err {
            Error::InvalidImage(message) => assert!(message.contains("DIRTY"), "{message}"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn open_rejects_blocking_extensions() {
        // Backing format name, external data file, encryption header.
        for ext_type in [0xe279_2acau32, 0x4441_5441, 0x0537_be77] {
            let err = corrupt_and_open(|f| {
                f.write_all_at(&ext_type.to_be_bytes(), 104).unwrap();
            });
            assert!(matches!(err, Error::InvalidImage(_)), "{ext_type:#x}");
        }
    }

    #[test]
    fn open_preserves_unknown_extensions() {
        let t = TempFile::new().unwrap();
        Image::create(t.as_path(), 1 << 20).unwrap().close().unwrap();
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(t.as_path())
            .unwrap();
        file.write_all_at(&0x1234_5678u32.to_be_bytes(), 104).unwrap();
        file.write_all_at(&4u32.to_be_bytes(), 108).unwrap();
        file.write_all_at(&[0xaa; 4], 112).unwrap();
        drop(file);

        let image = Image::open(t.as_path(), true).unwrap();
        let header = image.header();
        assert_eq!(header.extensions.len(), 1);
        assert_eq!(header.extensions[0].ext_type, 0x1234_5678);
        assert_eq!(header.extensions[0].data, vec![0xaa; 4]);
    }

    #[test]
    fn overwrite_in_place_does_not_grow_the_file() {
        let t = TempFile::new().unwrap();
        let image = Image::create(t.as_path(), 1 << 22).unwrap();
        image.write_at(&test_pattern(1000, 1), 0).unwrap();
        let len_after_first = std::fs::metadata(t.as_path()).unwrap().len();

        image.write_at(&test_pattern(1000, 2), 100).unwrap();
        assert_eq!(std::fs::metadata(t.as_path()).unwrap().len(), len_after_first);
    }
}
