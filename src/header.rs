// Copyright 2025 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! QCOW2 header parsing, validation, and creation.

use std::fs::File;
use std::os::unix::fs::FileExt;

use bitflags::bitflags;
use byteorder::{BigEndian, ByteOrder};
use log::warn;

use crate::{Error, Result};

// QCOW magic constant that starts the header.
pub(crate) const QCOW_MAGIC: u32 = 0x5146_49fb;
// Default to a cluster size of 2^DEFAULT_CLUSTER_BITS.
pub(crate) const DEFAULT_CLUSTER_BITS: u32 = 16;
// Limit clusters to reasonable sizes. Choose the same limits as qemu.
const MIN_CLUSTER_BITS: u32 = 9;
const MAX_CLUSTER_BITS: u32 = 21;
// 16-bit refcounts.
pub(crate) const DEFAULT_REFCOUNT_ORDER: u32 = 4;
// Orders above 6 would describe refcounts wider than 64 bits.
const MAX_REFCOUNT_ORDER: u32 = 6;

pub(crate) const V3_BARE_HEADER_SIZE: u32 = 104;

const COMPRESSION_TYPE_DEFLATE: u8 = 0;

// Header extension types.
const HEADER_EXT_END: u32 = 0x0000_0000;
const HEADER_EXT_BACKING_FORMAT: u32 = 0xe279_2aca;
const HEADER_EXT_FEATURE_NAME_TABLE: u32 = 0x6803_f857;
const HEADER_EXT_BITMAPS: u32 = 0x2385_2875;
const HEADER_EXT_ENCRYPTION_HEADER: u32 = 0x0537_be77;
const HEADER_EXT_EXTERNAL_DATA: u32 = 0x4441_5441;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IncompatibleFeatures: u64 {
        const DIRTY = 1 << 0;
        const CORRUPT = 1 << 1;
        const EXTERNAL_DATA = 1 << 2;
        const COMPRESSION_TYPE = 1 << 3;
        const EXTENDED_L2 = 1 << 4;
    }
}

/// A header extension that was read and preserved but is not interpreted.
#[derive(Clone, Debug)]
pub struct HeaderExtension {
    pub ext_type: u32,
    pub data: Vec<u8>,
}

/// Contains the information from the header of a qcow file.
#[derive(Clone, Debug)]
pub struct Header {
    pub magic: u32,
    pub version: u32,

    pub backing_file_offset: u64,
    pub backing_file_size: u32,

    pub cluster_bits: u32,
    pub size: u64,
    pub crypt_method: u32,

    pub l1_size: u32,
    pub l1_table_offset: u64,

    pub refcount_table_offset: u64,
    pub refcount_table_clusters: u32,

    pub nb_snapshots: u32,
    pub snapshots_offset: u64,

    pub incompatible_features: u64,
    pub compatible_features: u64,
    pub autoclear_features: u64,
    pub refcount_order: u32,
    pub header_length: u32,

    pub extensions: Vec<HeaderExtension>,
}

impl Header {
    /// Reads and validates the header from `file`.
    pub(crate) fn read_from(file: &File) -> Result<Header> {
        let mut fixed = [0u8; V3_BARE_HEADER_SIZE as usize];
        let nread = read_at_full(file, &mut fixed, 0)?;
        if nread < fixed.len() {
            return Err(Error::InvalidImage("header truncated".into()));
        }

        let magic = BigEndian::read_u32(&fixed[0..4]);
        if magic != QCOW_MAGIC {
            return Err(Error::InvalidImage("not a qcow2 image (bad magic)".into()));
        }
        let version = BigEndian::read_u32(&fixed[4..8]);
        if version != 3 {
            return Err(Error::InvalidImage(format!("unsupported version {version}")));
        }

        let mut header = Header {
            magic,
            version,
            backing_file_offset: BigEndian::read_u64(&fixed[8..16]),
            backing_file_size: BigEndian::read_u32(&fixed[16..20]),
            cluster_bits: BigEndian::read_u32(&fixed[20..24]),
            size: BigEndian::read_u64(&fixed[24..32]),
            crypt_method: BigEndian::read_u32(&fixed[32..36]),
            l1_size: BigEndian::read_u32(&fixed[36..40]),
            l1_table_offset: BigEndian::read_u64(&fixed[40..48]),
            refcount_table_offset: BigEndian::read_u64(&fixed[48..56]),
            refcount_table_clusters: BigEndian::read_u32(&fixed[56..60]),
            nb_snapshots: BigEndian::read_u32(&fixed[60..64]),
            snapshots_offset: BigEndian::read_u64(&fixed[64..72]),
            incompatible_features: BigEndian::read_u64(&fixed[72..80]),
            compatible_features: BigEndian::read_u64(&fixed[80..88]),
            autoclear_features: BigEndian::read_u64(&fixed[88..96]),
            refcount_order: BigEndian::read_u32(&fixed[96..100]),
            header_length: BigEndian::read_u32(&fixed[100..104]),
            extensions: Vec::new(),
        };

        header.validate()?;

        // Optional additional fields directly after the bare header; only
        // the DEFLATE compression type is supported.
        if header.header_length > V3_BARE_HEADER_SIZE {
            let mut additional = [0u8; 8];
            file.read_exact_at(&mut additional, u64::from(V3_BARE_HEADER_SIZE))
                .map_err(Error::IoFailure)?;
            if additional[0] != COMPRESSION_TYPE_DEFLATE {
                return Err(Error::InvalidImage(format!(
                    "unsupported compression type {}",
                    additional[0]
                )));
            }
        }

        header.read_extensions(file)?;
        Ok(header)
    }

    fn validate(&self) -> Result<()> {
        if self.backing_file_offset != 0 || self.backing_file_size != 0 {
            return Err(Error::InvalidImage("backing files are not supported".into()));
        }
        if self.crypt_method != 0 {
            return Err(Error::InvalidImage("encryption is not supported".into()));
        }
        let features = IncompatibleFeatures::from_bits_retain(self.incompatible_features);
        if !features.is_empty() {
            return Err(Error::InvalidImage(format!(
                "unsupported incompatible features {features:?}"
            )));
        }
        if !(MIN_CLUSTER_BITS..=MAX_CLUSTER_BITS).contains(&self.cluster_bits) {
            return Err(Error::InvalidImage(format!(
                "invalid cluster_bits {}",
                self.cluster_bits
            )));
        }
        if self.refcount_order > MAX_REFCOUNT_ORDER {
            return Err(Error::InvalidImage(format!(
                "unsupported refcount order {}",
                self.refcount_order
            )));
        }
        if self.header_length < V3_BARE_HEADER_SIZE {
            return Err(Error::InvalidImage("header length too small for version 3".into()));
        }
        if self.refcount_table_clusters == 0 {
            return Err(Error::InvalidImage("no refcount table clusters".into()));
        }

        let cluster_size = 1u64 << self.cluster_bits;
        let cluster_mask = cluster_size - 1;
        if self.l1_table_offset & cluster_mask != 0 {
            return Err(Error::InvalidImage("L1 table offset is not cluster aligned".into()));
        }
        if self.refcount_table_offset & cluster_mask != 0 {
            return Err(Error::InvalidImage(
                "refcount table offset is not cluster aligned".into(),
            ));
        }

        // The L1 table must be able to map the whole disk.
        let l2_entries = cluster_size / 8;
        let mapped = u64::from(self.l1_size)
            .saturating_mul(l2_entries)
            .saturating_mul(cluster_size);
        if mapped < self.size {
            return Err(Error::InvalidImage("L1 table does not cover the disk".into()));
        }
        Ok(())
    }

    // Reads the extension records that follow the header, stopping at the
    // end-of-extensions marker. Blocking extensions are rejected; the rest
    // are preserved uninterpreted.
    fn read_extensions(&mut self, file: &File) -> Result<()> {
        let cluster_size = 1u64 << self.cluster_bits;
        let mut offset = u64::from(self.header_length.max(V3_BARE_HEADER_SIZE));
        // Additional fields are part of header_length; extensions follow,
        // 8-byte aligned.
        offset = (offset + 7) & !7;

        loop {
            if offset + 8 > cluster_size {
                return Err(Error::InvalidImage(
                    "header extension area overruns the header cluster".into(),
                ));
            }
            let mut meta = [0u8; 8];
            file.read_exact_at(&mut meta, offset).map_err(Error::IoFailure)?;
            let ext_type = BigEndian::read_u32(&meta[0..4]);
            let length = BigEndian::read_u32(&meta[4..8]);
            offset += 8;

            if ext_type == HEADER_EXT_END {
                return Ok(());
            }
            match ext_type {
                HEADER_EXT_BACKING_FORMAT => {
                    return Err(Error::InvalidImage(
                        "backing file format extension is not supported".into(),
                    ));
                }
                HEADER_EXT_EXTERNAL_DATA => {
                    return Err(Error::InvalidImage(
                        "external data file extension is not supported".into(),
                    ));
                }
                HEADER_EXT_ENCRYPTION_HEADER => {
                    return Err(Error::InvalidImage(
                        "full disk encryption extension is not supported".into(),
                    ));
                }
                _ => {}
            }

            if offset + u64::from(length) > cluster_size {
                return Err(Error::InvalidImage(
                    "header extension area overruns the header cluster".into(),
                ));
            }
            let mut data = vec![0u8; length as usize];
            file.read_exact_at(&mut data, offset).map_err(Error::IoFailure)?;
            if ext_type != HEADER_EXT_FEATURE_NAME_TABLE && ext_type != HEADER_EXT_BITMAPS {
                warn!("preserving unknown header extension {ext_type:#010x} ({length} bytes)");
            }
            self.extensions.push(HeaderExtension { ext_type, data });

            // Skip to the next 8 byte boundary.
            offset += (u64::from(length) + 7) & !7;
        }
    }

    /// Create a header for an image of the given virtual `size` using the
    /// default geometry.
    pub(crate) fn create_for_size(size: u64) -> Result<Header> {
        let layout = Layout::for_size(size)?;
        Ok(Header {
            magic: QCOW_MAGIC,
            version: 3,
            backing_file_offset: 0,
            backing_file_size: 0,
            cluster_bits: DEFAULT_CLUSTER_BITS,
            size,
            crypt_method: 0,
            l1_size: layout.l1_size as u32,
            l1_table_offset: layout.l1_table_offset(),
            refcount_table_offset: layout.refcount_table_offset(),
            refcount_table_clusters: layout.rct_clusters as u32,
            nb_snapshots: 0,
            snapshots_offset: 0,
            incompatible_features: 0,
            compatible_features: 0,
            autoclear_features: 0,
            refcount_order: DEFAULT_REFCOUNT_ORDER,
            header_length: V3_BARE_HEADER_SIZE,
            extensions: Vec::new(),
        })
    }

    /// Encodes the fixed fields followed by the end-of-extensions marker.
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(V3_BARE_HEADER_SIZE as usize + 8);
        buf.extend_from_slice(&self.magic.to_be_bytes());
        buf.extend_from_slice(&self.version.to_be_bytes());
        buf.extend_from_slice(&self.backing_file_offset.to_be_bytes());
        buf.extend_from_slice(&self.backing_file_size.to_be_bytes());
        buf.extend_from_slice(&self.cluster_bits.to_be_bytes());
        buf.extend_from_slice(&self.size.to_be_bytes());
        buf.extend_from_slice(&self.crypt_method.to_be_bytes());
        buf.extend_from_slice(&self.l1_size.to_be_bytes());
        buf.extend_from_slice(&self.l1_table_offset.to_be_bytes());
        buf.extend_from_slice(&self.refcount_table_offset.to_be_bytes());
        buf.extend_from_slice(&self.refcount_table_clusters.to_be_bytes());
        buf.extend_from_slice(&self.nb_snapshots.to_be_bytes());
        buf.extend_from_slice(&self.snapshots_offset.to_be_bytes());
        buf.extend_from_slice(&self.incompatible_features.to_be_bytes());
        buf.extend_from_slice(&self.compatible_features.to_be_bytes());
        buf.extend_from_slice(&self.autoclear_features.to_be_bytes());
        buf.extend_from_slice(&self.refcount_order.to_be_bytes());
        buf.extend_from_slice(&self.header_length.to_be_bytes());
        // End-of-extensions marker: zero type, zero length.
        buf.extend_from_slice(&[0u8; 8]);
        buf
    }
}

/// Host-file layout of a freshly created image, in cluster order: header,
/// L1 table, L2 tables, refcount table, refcount blocks.
pub(crate) struct Layout {
    pub cluster_size: u64,
    /// L1 entries, one per preallocated L2 cluster.
    pub l1_size: u64,
    pub rct_clusters: u64,
    pub rcb_clusters: u64,
}

impl Layout {
    pub fn for_size(size: u64) -> Result<Layout> {
        let cluster_size = 1u64 << DEFAULT_CLUSTER_BITS;
        let l2_entries = cluster_size / 8;
        let refcount_bits = 1u64 << DEFAULT_REFCOUNT_ORDER;
        let rcb_entries = cluster_size * 8 / refcount_bits;

        let total_clusters = div_round_up_u64(size, cluster_size) + 1;
        let l1_size = div_round_up_u64(total_clusters, l2_entries);
        let rcb_clusters = div_round_up_u64(total_clusters, rcb_entries);
        let rct_clusters = div_round_up_u64(rcb_clusters * 8, cluster_size);

        // The L1 table gets a single cluster; growing it is not supported.
        if l1_size > l2_entries {
            return Err(Error::InvalidImage(
                "disk size requires a multi-cluster L1 table".into(),
            ));
        }

        Ok(Layout {
            cluster_size,
            l1_size,
            rct_clusters,
            rcb_clusters,
        })
    }

    pub fn l1_table_offset(&self) -> u64 {
        self.cluster_size
    }

    pub fn l2_tables_offset(&self) -> u64 {
        2 * self.cluster_size
    }

    pub fn refcount_table_offset(&self) -> u64 {
        (2 + self.l1_size) * self.cluster_size
    }

    pub fn refcount_blocks_offset(&self) -> u64 {
        self.refcount_table_offset() + self.rct_clusters * self.cluster_size
    }

    pub fn file_len(&self) -> u64 {
        self.refcount_blocks_offset() + self.rcb_clusters * self.cluster_size
    }
}

// Positioned read that tolerates a short count at end of file.
fn read_at_full(file: &File, buf: &mut [u8], offset: u64) -> Result<usize> {
    let mut nread = 0;
    while nread < buf.len() {
        let n = file
            .read_at(&mut buf[nread..], offset + nread as u64)
            .map_err(Error::IoFailure)?;
        if n == 0 {
            break;
        }
        nread += n;
    }
    Ok(nread)
}

// Ceiling of the division of `dividend`/`divisor`.
pub(crate) fn div_round_up_u64(dividend: u64, divisor: u64) -> u64 {
    dividend / divisor + u64::from(dividend % divisor != 0)
}
