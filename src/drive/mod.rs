//! Virtual drive server: a memory-mapped backing file fronted by
//! the block protocol, serving one client connection at a time while
//! simulating seek latency between cylinders via a pluggable
//! [`scheduler::SeekScheduler`].

pub mod client;
pub mod scheduler;

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use memmap2::MmapMut;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};
use wire::block::{BlockReply, BlockRequest, BlockServerCodec};

use crate::error::{Result, StorageError, VdfsError};
use crate::storage::DiskDescription;

pub struct DriveServer {
    mmap: Mutex<MmapMut>,
    desc: DiskDescription,
    sim_move_cost_us: u64,
    policy: String,
}

impl DriveServer {
    /// Truncates (via a single byte write at `disk_size - 1`) and
    /// memory-maps `path` read+write, shared.
    pub fn open(path: &Path, desc: DiskDescription, sim_move_cost_us: u64, policy: &str) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| StorageError::DriveFileCreate { path: path.display().to_string(), source: e })?;
        let size = desc.disk_size();
        file.set_len(size).map_err(|e| StorageError::DriveFileCreate { path: path.display().to_string(), source: e })?;
        let mmap = unsafe { MmapMut::map_mut(&file) }
            .map_err(|e| StorageError::DriveMmap { path: path.display().to_string(), source: e })?;
        Ok(Self { mmap: Mutex::new(mmap), desc, sim_move_cost_us, policy: policy.to_string() })
    }

    pub fn describe(&self) -> DiskDescription {
        self.desc
    }

    /// Accepts connections forever, one at a time, until a client sends
    /// `SHUTDOWN`.
    pub async fn serve(self: Arc<Self>, port: u16) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|e| VdfsError::Io { context: format!("binding drive server on port {port}"), source: e })?;
        info!(port, policy = %self.policy, "drive server listening");
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };
            info!(%peer, "drive client connected");
            match self.clone().serve_connection(stream).await {
                Ok(true) => {
                    info!("drive server shutting down by client request");
                    return Ok(());
                }
                Ok(false) => debug!(%peer, "drive client disconnected"),
                Err(e) => warn!(error = %e, "connection ended with error"),
            }
        }
    }

    /// Returns `Ok(true)` if the connection ended via `SHUTDOWN`.
    async fn serve_connection(self: Arc<Self>, stream: TcpStream) -> Result<bool> {
        let mut framed = Framed::new(stream, BlockServerCodec::new(self.desc.bytes_per_sector as u32));
        let mut pending: BTreeMap<u64, VecDeque<BlockRequest>> = BTreeMap::new();
        let mut head = 0u64;
        let mut sched = scheduler::by_name(&self.policy).unwrap_or_else(|| Box::new(scheduler::Sstf));

        loop {
            if pending.is_empty() {
                match framed.next().await {
                    Some(Ok(req)) => self.enqueue(&mut pending, req, head),
                    Some(Err(e)) => {
                        warn!(error = %e, "block protocol error");
                        return Ok(false);
                    }
                    None => return Ok(false),
                }
                continue;
            }

            // Opportunistically absorb whatever's already pipelined on the
            // wire: a zero-duration poll resolves immediately once no
            // further frame is already fully buffered.
            while let Ok(Some(frame)) = tokio::time::timeout(Duration::from_millis(0), framed.next()).await {
                match frame {
                    Ok(req) => self.enqueue(&mut pending, req, head),
                    Err(e) => {
                        warn!(error = %e, "block protocol error");
                        return Ok(false);
                    }
                }
            }

            let cylinders: BTreeSet<u64> = pending.keys().copied().collect();
            let path = sched.select(&cylinders, head, self.desc.cylinders);
            let cost = scheduler::seek_distance(head, &path);
            if cost > 0 && self.sim_move_cost_us > 0 {
                tokio::time::sleep(Duration::from_micros(cost * self.sim_move_cost_us)).await;
            }
            head = *path.last().expect("select returns a non-empty path");

            let reqs = pending.remove(&head).unwrap_or_default();
            for req in reqs {
                let tid = req.tid();
                let reply = match self.execute(req) {
                    Ok(reply) => reply,
                    Err(e) => {
                        warn!(tid, error = %e, "storage error servicing request");
                        return Err(e.into());
                    }
                };
                let is_shutdown = matches!(reply, BlockReply::ShutdownOk { .. });
                if framed.send(reply).await.is_err() {
                    return Ok(false);
                }
                if is_shutdown {
                    return Ok(true);
                }
            }
        }
    }

    fn enqueue(&self, pending: &mut BTreeMap<u64, VecDeque<BlockRequest>>, req: BlockRequest, head: u64) {
        let cylinder = match &req {
            BlockRequest::GetDesc { .. } | BlockRequest::Shutdown { .. } => head,
            BlockRequest::Read { sector_addr, .. } | BlockRequest::Write { sector_addr, .. } => {
                self.desc.cylinder_of(*sector_addr)
            }
        };
        pending.entry(cylinder).or_default().push_back(req);
    }

    fn execute(&self, req: BlockRequest) -> std::result::Result<BlockReply, StorageError> {
        match req {
            BlockRequest::GetDesc { tid } => Ok(BlockReply::Desc { tid, desc: self.desc.into() }),
            BlockRequest::Read { tid, sector_addr } => {
                let mut data = vec![0u8; self.desc.bytes_per_sector as usize];
                self.read_sector(sector_addr, &mut data)?;
                Ok(BlockReply::ReadData { tid, data })
            }
            BlockRequest::Write { tid, sector_addr, data } => {
                self.write_sector(sector_addr, &data)?;
                Ok(BlockReply::WriteOk { tid })
            }
            BlockRequest::Shutdown { tid } => Ok(BlockReply::ShutdownOk { tid }),
        }
    }

    fn read_sector(&self, addr: u64, out: &mut [u8]) -> std::result::Result<(), StorageError> {
        let total = self.desc.total_sectors();
        if addr >= total {
            return Err(StorageError::DiskAddrInvalid { addr, total });
        }
        let sector_size = self.desc.bytes_per_sector as usize;
        let offset = addr as usize * sector_size;
        let mmap = self.mmap.lock().expect("mmap mutex poisoned");
        out.copy_from_slice(&mmap[offset..offset + sector_size]);
        Ok(())
    }

    fn write_sector(&self, addr: u64, data: &[u8]) -> std::result::Result<(), StorageError> {
        let total = self.desc.total_sectors();
        if addr >= total {
            return Err(StorageError::DiskAddrInvalid { addr, total });
        }
        let sector_size = self.desc.bytes_per_sector as usize;
        let offset = addr as usize * sector_size;
        let mut mmap = self.mmap.lock().expect("mmap mutex poisoned");
        mmap[offset..offset + sector_size].copy_from_slice(data);
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
    fn open_creates_backing_file_of_exact_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drive.img");
        let server = DriveServer::open(&path, desc(), 0, "sstf").unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), desc().disk_size());
        assert_eq!(server.describe(), desc());
    }

    #[test]
    fn read_write_roundtrips_through_mmap() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drive.img");
        let server = DriveServer::open(&path, desc(), 0, "sstf").unwrap();
        let data = vec![0x42u8; 256];
        server.write_sector(3, &data).unwrap();
        let mut out = vec![0u8; 256];
        server.read_sector(3, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn out_of_range_sector_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drive.img");
        let server = DriveServer::open(&path, desc(), 0, "sstf").unwrap();
        let mut out = vec![0u8; 256];
        assert!(matches!(server.read_sector(32, &mut out), Err(StorageError::DiskAddrInvalid { addr: 32, total: 32 })));
    }
}
