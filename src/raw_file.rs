// Copyright 2025 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;

/// Positioned byte-level access to an image's backing file, plus
/// cluster-granular allocation at the end of the file.
#[derive(Debug)]
pub(crate) struct RawFile {
    file: File,
    cluster_size: u64,
    cluster_mask: u64,
}

impl RawFile {
    /// Wraps `file`; `None` is returned if `cluster_size` is not a power of
    /// two.
    pub fn new(file: File, cluster_size: u64) -> Option<Self> {
        if cluster_size.count_ones() != 1 {
            return None;
        }
        Some(RawFile {
            file,
            cluster_size,
            cluster_mask: cluster_size - 1,
        })
    }

    /// Positioned read. A short count means the end of the file was reached;
    /// the remainder of `buf` is left untouched.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let mut nread = 0;
        while nread < buf.len() {
            let n = self.file.read_at(&mut buf[nread..], offset + nread as u64)?;
            if n == 0 {
                break;
            }
            nread += n;
        }
        Ok(nread)
    }

    pub fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        self.file.read_exact_at(buf, offset)
    }

    pub fn write_all_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        self.file.write_all_at(buf, offset)
    }

    /// Extends the file by exactly one zeroed cluster at the cluster-aligned
    /// end of the file and returns the new cluster's offset.
    pub fn append_cluster(&mut self) -> io::Result<u64> {
        let file_end = self.file.metadata()?.len();
        let new_cluster = (file_end + self.cluster_mask) & !self.cluster_mask;
        self.file.set_len(new_cluster + self.cluster_size)?;
        Ok(new_cluster)
    }

    pub fn set_len(&self, len: u64) -> io::Result<()> {
        self.file.set_len(len)
    }

    pub fn len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn sync(&self) -> io::Result<()> {
        self.file.sync_all()
    }

    pub fn cluster_size(&self) -> u64 {
        self.cluster_size
    }

    /// Returns the offset of `address` within its cluster.
    pub fn cluster_offset(&self, address: u64) -> u64 {
        address & self.cluster_mask
    }
}
