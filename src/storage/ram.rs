use std::sync::Mutex;

use crate::error::StorageError;

use super::{DiskDescription, StorageProvider};

/// In-memory storage provider: a flat byte buffer sized
/// `total_sectors * bytes_per_sector`, guarded by a single mutex since this
/// is a test/standalone backend, not the networked one.
pub struct RamStore {
    desc: DiskDescription,
    data: Mutex<Vec<u8>>,
}

impl RamStore {
    pub fn new(desc: DiskDescription) -> Self {
        let len = desc.disk_size() as usize;
        Self { desc, data: Mutex::new(vec![0u8; len]) }
    }
}

impl StorageProvider for RamStore {
    fn read(&self, sector_addr: u64, out_buf: &mut [u8]) -> Result<(), StorageError> {
        let total = self.desc.total_sectors();
        if sector_addr >= total {
            return Err(StorageError::DiskAddrInvalid { addr: sector_addr, total });
        }
        let sector_size = self.desc.bytes_per_sector as usize;
        let offset = sector_addr as usize * sector_size;
        let data = self.data.lock().expect("ram store mutex poisoned");
        out_buf[..sector_size].copy_from_slice(&data[offset..offset + sector_size]);
        Ok(())
    }

    fn write(&self, sector_addr: u64, in_buf: &[u8]) -> Result<(), StorageError> {
        let total = self.desc.total_sectors();
        if sector_addr >= total {
            return Err(StorageError::DiskAddrInvalid { addr: sector_addr, total });
        }
        let sector_size = self.desc.bytes_per_sector as usize;
        let offset = sector_addr as usize * sector_size;
        let mut data = self.data.lock().expect("ram store mutex poisoned");
        data[offset..offset + sector_size].copy_from_slice(&in_buf[..sector_size]);
        Ok(())
    }

    fn describe(&self) -> DiskDescription {
        self.desc
    }

    fn shutdown(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc() -> DiskDescription {
        DiskDescription { cylinders: 4, sectors_per_cylinder: 8, bytes_per_sector: 256 }
    }

    #[test]
    fn write_then_read_roundtrips() {
        let store = RamStore::new(desc());
        let mut buf = vec![0xAB; 256];
        store.write(5, &buf).unwrap();
        buf.fill(0);
        store.read(5, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn out_of_range_rejected() {
        let store = RamStore::new(desc());
        let mut buf = vec![0; 256];
        assert!(matches!(
            store.read(32, &mut buf),
            Err(StorageError::DiskAddrInvalid { addr: 32, total: 32 })
        ));
    }

    #[test]
    fn describe_reports_geometry() {
        let store = RamStore::new(desc());
        assert_eq!(store.describe(), desc());
    }
}
