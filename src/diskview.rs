//! Disk view: a thin address-indexed projection over a [`StorageProvider`]
//! that transfers whole-sector typed records. No caching — every access is
//! a full-sector disk I/O; plain get/set methods stand in for a proxy type.

use zerocopy::{FromBytes, IntoBytes};

use crate::error::StorageError;
use crate::records::SECTOR_SIZE;
use crate::storage::StorageProvider;
use std::sync::Arc;

#[derive(Clone)]
pub struct DiskView {
    provider: Arc<dyn StorageProvider>,
}

impl DiskView {
    pub fn new(provider: Arc<dyn StorageProvider>) -> Self {
        Self { provider }
    }

    pub fn provider(&self) -> &Arc<dyn StorageProvider> {
        &self.provider
    }

    /// Reads the sector at `addr` and reinterprets it as `T`.
    pub fn get<T: FromBytes>(&self, addr: u64) -> Result<T, StorageError> {
        let mut buf = vec![0u8; SECTOR_SIZE];
        self.provider.read(addr, &mut buf)?;
        Ok(T::read_from_bytes(&buf).expect("sector-sized buffer matches record layout"))
    }

    /// Writes `value` bit-for-bit as a whole sector at `addr`.
    pub fn set<T: IntoBytes + zerocopy::Immutable>(&self, addr: u64, value: &T) -> Result<(), StorageError> {
        self.provider.write(addr, value.as_bytes())
    }

    /// Raw read of fewer than `bytes_per_sector` bytes — used for a file's
    /// tail block.
    pub fn read_partial(&self, addr: u64, len: usize) -> Result<Vec<u8>, StorageError> {
        let mut buf = vec![0u8; SECTOR_SIZE];
        self.provider.read(addr, &mut buf)?;
        buf.truncate(len);
        Ok(buf)
    }

    /// Raw write of fewer than `bytes_per_sector` bytes, zero-padding the
    /// remainder of the sector.
    pub fn write_partial(&self, addr: u64, data: &[u8]) -> Result<(), StorageError> {
        let mut buf = vec![0u8; SECTOR_SIZE];
        buf[..data.len()].copy_from_slice(data);
        self.provider.write(addr, &buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::DirectoryNode;
    use crate::storage::ram::RamStore;
    use crate::storage::DiskDescription;

    fn view() -> DiskView {
        let desc = DiskDescription { cylinders: 2, sectors_per_cylinder: 8, bytes_per_sector: 256 };
        DiskView::new(Arc::new(RamStore::new(desc)))
    }

    #[test]
    fn typed_roundtrip() {
        let v = view();
        let mut node = DirectoryNode::new_folder(0);
        node.set_name("root");
        v.set(0, &node).unwrap();
        let back: DirectoryNode = v.get(0).unwrap();
        assert_eq!(back.name(), "root");
    }

    #[test]
    fn partial_io_zero_pads() {
        let v = view();
        v.write_partial(2, &[1, 2, 3]).unwrap();
        let full = v.read_partial(2, 256).unwrap();
        assert_eq!(&full[..3], &[1, 2, 3]);
        assert!(full[3..].iter().all(|&b| b == 0));
    }
}
