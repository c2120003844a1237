//! Flash regions and the key/value partition table.

use crate::codec::{MAX_NAMESPACE_LEN, SECTOR_SIZE};
use crate::error::KvsError;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A byte range on the flash device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FlashRegion {
    /// Device offset in bytes, sector aligned.
    pub offset: u32,
    /// Length in bytes, a multiple of the sector size.
    pub size: u32,
}

impl FlashRegion {
    pub const fn new(offset: u32, size: u32) -> Self {
        Self { offset, size }
    }

    pub fn end(&self) -> u32 {
        self.offset + self.size
    }

    pub fn is_sector_aligned(&self) -> bool {
        self.offset % SECTOR_SIZE as u32 == 0 && self.size % SECTOR_SIZE as u32 == 0
    }

    pub fn overlaps(&self, other: &FlashRegion) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }
}

/// A dedicated key/value partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct PartitionSpec {
    /// Partition name; namespaces matching it are routed here.
    pub name: &'static str,
    pub region: FlashRegion,
    /// Force encryption for every value stored here.
    pub encrypted: bool,
    /// Reject all mutation.
    pub read_only: bool,
}

/// Build-time partition table for a [`crate::kvs::KeyValueStore`].
///
/// `shared` holds entries whose namespace matches no dedicated
/// partition (namespace bytes are stored per entry there). `backup`
/// is scratch for compaction and must fit the largest partition.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct KvsLayout<const N: usize> {
    pub shared: FlashRegion,
    pub dedicated: heapless::Vec<PartitionSpec, N>,
    pub backup: FlashRegion,
}

impl<const N: usize> KvsLayout<N> {
    fn region_at(&self, i: usize) -> FlashRegion {
        match i {
            0 => self.shared,
            1 => self.backup,
            n => self.dedicated[n - 2].region,
        }
    }

    /// Check geometry: sector alignment, bounds, overlap, backup size
    /// and namespace name limits.
    pub fn validate(&self, flash_capacity: u32) -> Result<(), KvsError> {
        // A partition's device offset doubles as the backup commit tag,
        // and zero is the retired-tag sentinel: a partition at offset 0
        // could never be replayed after a power cut.
        if self.shared.offset == 0 {
            return Err(KvsError::InvalidArgument);
        }
        for part in &self.dedicated {
            if part.name.is_empty()
                || part.name.len() > MAX_NAMESPACE_LEN
                || part.region.offset == 0
            {
                return Err(KvsError::InvalidArgument);
            }
        }

        let count = 2 + self.dedicated.len();
        for i in 0..count {
            let region = self.region_at(i);
            if region.size == 0 || !region.is_sector_aligned() || region.end() > flash_capacity {
                return Err(KvsError::InvalidArgument);
            }
            for j in i + 1..count {
                if region.overlaps(&self.region_at(j)) {
                    return Err(KvsError::InvalidArgument);
                }
            }
        }

        // Compaction stages a full partition in the backup region.
        let mut largest = self.shared.size;
        for part in &self.dedicated {
            largest = largest.max(part.region.size);
        }
        if self.backup.size < largest {
            return Err(KvsError::InvalidArgument);
        }
        Ok(())
    }
}
