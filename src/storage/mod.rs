//! Storage interface: the one abstraction everything above it — disk view,
//! allocator, file system — is built on. Two providers implement it:
//! [`ram::RamStore`] for in-process tests and `crate::drive::client::DriveClient`
//! for the networked virtual drive.
//!
//! Calls are synchronous and block the caller; callers that run inside a
//! `tokio` task (the fs server) hand them to `tokio::task::spawn_blocking`
//! rather than await them directly.

pub mod ram;

use crate::error::StorageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskDescription {
    pub cylinders: u64,
    pub sectors_per_cylinder: u64,
    pub bytes_per_sector: u64,
}

impl DiskDescription {
    pub fn total_sectors(&self) -> u64 {
        self.cylinders * self.sectors_per_cylinder
    }

    pub fn disk_size(&self) -> u64 {
        self.total_sectors() * self.bytes_per_sector
    }

    /// `cylinder = addr >> log2(sectors_per_cylinder)`.
    pub fn cylinder_of(&self, sector_addr: u64) -> u64 {
        sector_addr / self.sectors_per_cylinder
    }
}

impl From<wire::block::DiskDescription> for DiskDescription {
    fn from(d: wire::block::DiskDescription) -> Self {
        Self {
            cylinders: d.cylinders,
            sectors_per_cylinder: d.sectors_per_cylinder,
            bytes_per_sector: d.bytes_per_sector,
        }
    }
}

impl From<DiskDescription> for wire::block::DiskDescription {
    fn from(d: DiskDescription) -> Self {
        Self {
            cylinders: d.cylinders,
            sectors_per_cylinder: d.sectors_per_cylinder,
            bytes_per_sector: d.bytes_per_sector,
        }
    }
}

/// Sector-addressable, thread-safe for concurrent distinct callers.
pub trait StorageProvider: Send + Sync {
    fn read(&self, sector_addr: u64, out_buf: &mut [u8]) -> Result<(), StorageError>;
    fn write(&self, sector_addr: u64, in_buf: &[u8]) -> Result<(), StorageError>;
    fn describe(&self) -> DiskDescription;
    fn shutdown(&self) -> Result<(), StorageError>;
}
