// Copyright 2025 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Per-cluster reference counts.
//!
//! A disk offset maps to a slot in a refcount block: with
//! `entries_per_block = cluster_size * 8 / refcount_width`, the cluster
//! number `c = disk_offset / cluster_size` splits into
//! `table_index = c / entries_per_block` and
//! `block_index = c % entries_per_block`. The refcount table entry at
//! `table_index`, masked to bits 9..63, gives the block's host offset; the
//! refcount itself is a `2^refcount_order`-bit big-endian field at bit
//! address `block_offset * 8 + block_index * refcount_width`, bit 0 being
//! the most significant bit of byte 0.

use crate::entry::{L1Entry, L2Entry, RefcountTableEntry};
use crate::raw_file::RawFile;
use crate::table::TableCache;
use crate::{Error, Result};

#[derive(Debug)]
pub(crate) struct RefcountEngine {
    table_offset: u64,
    table_entries: u64,
    refcount_bits: u64,
    cluster_size: u64,
}

impl RefcountEngine {
    pub fn new(
        table_offset: u64,
        table_clusters: u32,
        refcount_order: u32,
        cluster_size: u64,
    ) -> RefcountEngine {
        RefcountEngine {
            table_offset,
            table_entries: u64::from(table_clusters) * cluster_size / 8,
            refcount_bits: 1u64 << refcount_order,
            cluster_size,
        }
    }

    /// Largest value a refcount field can hold.
    pub fn max_value(&self) -> u64 {
        if self.refcount_bits >= 64 {
            u64::MAX
        } else {
            (1u64 << self.refcount_bits) - 1
        }
    }

    /// Returns the refcount of the cluster containing `disk_offset`. An
    /// unallocated refcount block reads as zero.
    pub fn get(&self, raw: &RawFile, tables: &TableCache, disk_offset: u64) -> Result<u64> {
        match self.field_location(raw, tables, disk_offset)? {
            None => Ok(0),
            Some((byte_offset, bit_shift)) => {
                read_bits(raw, byte_offset, bit_shift, self.refcount_bits)
            }
        }
    }

    /// Sets the refcount of the cluster containing `disk_offset`.
    pub fn set(
        &self,
        raw: &RawFile,
        tables: &TableCache,
        disk_offset: u64,
        value: u64,
    ) -> Result<()> {
        if value > self.max_value() {
            return Err(Error::Corrupt("refcount value does not fit the refcount width"));
        }
        let (byte_offset, bit_shift) = self
            .field_location(raw, tables, disk_offset)?
            .ok_or(Error::Corrupt("refcount block is not allocated"))?;
        write_bits(raw, byte_offset, bit_shift, self.refcount_bits, value)
    }

    /// Snapshot preparation: walks the L1 table and increments the refcount
    /// of every allocated L2 entry, standard or compressed, so that later
    /// writes copy instead of overwriting. The metadata clusters themselves
    /// are not counted.
    pub fn increment_references(
        &self,
        raw: &RawFile,
        tables: &TableCache,
        l1_table_offset: u64,
        l1_size: u64,
    ) -> Result<()> {
        let l2_entries = self.cluster_size / 8;
        let l1_table = tables.read(raw, l1_table_offset, l1_size)?;
        for (l1_index, &raw_l1) in l1_table.iter().enumerate() {
            let l1_entry = L1Entry::from_raw(raw_l1);
            if l1_entry.host_offset() == 0 {
                continue;
            }
            let l2_table = tables.read(raw, l1_entry.host_offset(), l2_entries)?;
            for (l2_index, &raw_l2) in l2_table.iter().enumerate() {
                if L2Entry::from_raw(raw_l2).is_unallocated() {
                    continue;
                }
                let disk_offset =
                    (l1_index as u64 * l2_entries + l2_index as u64) * self.cluster_size;
                let refcount = self.get(raw, tables, disk_offset)?;
                self.set(raw, tables, disk_offset, refcount + 1)?;
            }
        }
        Ok(())
    }

    // Locates the refcount field for `disk_offset`: the offset of the byte
    // holding its first bit and the field's bit offset within that byte.
    // `None` means the covering refcount block is unallocated.
    fn field_location(
        &self,
        raw: &RawFile,
        tables: &TableCache,
        disk_offset: u64,
    ) -> Result<Option<(u64, u32)>> {
        let cluster = disk_offset / self.cluster_size;
        let entries_per_block = self.cluster_size * 8 / self.refcount_bits;
        let table_index = cluster / entries_per_block;
        let block_index = cluster % entries_per_block;

        if table_index >= self.table_entries {
            return Err(Error::Corrupt("cluster is beyond the refcount table"));
        }

        let table = tables.read(raw, self.table_offset, self.table_entries)?;
        let block_offset = RefcountTableEntry::from_raw(table[table_index as usize]).host_offset();
        if block_offset == 0 {
            return Ok(None);
        }
        let file_len = raw.len().map_err(Error::IoFailure)?;
        if block_offset + self.cluster_size > file_len {
            return Err(Error::Corrupt("refcount block extends past the end of the file"));
        }

        let bit_address = block_offset * 8 + block_index * self.refcount_bits;
        Ok(Some((bit_address / 8, (bit_address % 8) as u32)))
    }
}

// Reads an `nbits`-wide big-endian field starting `bit_shift` bits into the
// byte at `byte_offset`.
fn read_bits(raw: &RawFile, byte_offset: u64, bit_shift: u32, nbits: u64) -> Result<u64> {
    let nbytes = (u64::from(bit_shift) + nbits + 7) / 8;
    let mut buf = vec![0u8; nbytes as usize];
    raw.read_exact_at(&mut buf, byte_offset).map_err(Error::IoFailure)?;

    let mut value: u64 = 0;
    for bit in 0..nbits {
        let abs = u64::from(bit_shift) + bit;
        let byte = buf[(abs / 8) as usize];
        value = (value << 1) | u64::from((byte >> (7 - abs % 8)) & 1);
    }
    Ok(value)
}

// Positioned read-modify-write of the same field, preserving neighbouring
// fields narrower than a byte.
fn write_bits(
    raw: &RawFile,
    byte_offset: u64,
    bit_shift: u32,
    nbits: u64,
    value: u64,
) -> Result<()> {
    let nbytes = (u64::from(bit_shift) + nbits + 7) / 8;
    let mut buf = vec![0u8; nbytes as usize];
    raw.read_exact_at(&mut buf, byte_offset).map_err(Error::IoFailure)?;

    for bit in 0..nbits {
        let abs = u64::from(bit_shift) + bit;
        let mask = 1u8 << (7 - abs % 8);
        let byte = &mut buf[(abs / 8) as usize];
        if value >> (nbits - 1 - bit) & 1 != 0 {
            *byte |= mask;
        } else {
            *byte &= !mask;
        }
    }
    raw.write_all_at(&buf, byte_offset).map_err(Error::IoFailure)
}
