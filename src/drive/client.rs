//! Drive client: the `StorageProvider` that talks to a
//! [`DriveServer`](super::DriveServer) over the block protocol.
//!
//! `StorageProvider` is synchronous, so the background receiver runs on a
//! real OS thread
//! and demultiplexes replies to waiting callers via one `std::sync::mpsc`
//! channel per in-flight transaction. `tokio_util::codec`'s
//! `Encoder`/`Decoder` traits don't require a runtime, so the same wire
//! types serve both this blocking client and the async server.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{mpsc, Arc, Mutex};

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;
use wire::block::{BlockClientCodec, BlockReply, BlockRequest};

use crate::error::TransportError;
use crate::storage::{DiskDescription, StorageProvider};

enum Reply {
    ReadData(Vec<u8>),
    WriteOk,
    ShutdownOk,
}

struct Transaction {
    tx: mpsc::Sender<std::result::Result<Reply, TransportError>>,
}

struct Shared {
    write_stream: Mutex<TcpStream>,
    transactions: Mutex<HashMap<u32, Transaction>>,
    next_tid: AtomicU32,
    closed: AtomicBool,
}

impl Shared {
    fn fail_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let drained: Vec<_> = self.transactions.lock().expect("transactions mutex poisoned").drain().collect();
        for (_, txn) in drained {
            let _ = txn.tx.send(Err(TransportError::SocketClosedByRemote));
        }
    }
}

fn receiver_loop(shared: Arc<Shared>, mut read_stream: TcpStream, sector_size: u32) {
    let mut codec = BlockClientCodec::new(sector_size);
    let mut buf = BytesMut::with_capacity(8192);
    let mut scratch = [0u8; 4096];
    loop {
        match codec.decode(&mut buf) {
            Ok(Some(reply)) => dispatch(&shared, reply),
            Ok(None) => match read_stream.read(&mut scratch) {
                Ok(0) => {
                    shared.fail_all();
                    return;
                }
                Ok(n) => buf.extend_from_slice(&scratch[..n]),
                Err(e) => {
                    warn!(error = %e, "drive client receiver read failed");
                    shared.fail_all();
                    return;
                }
            },
            Err(e) => {
                warn!(error = %e, "drive client protocol error");
                shared.fail_all();
                return;
            }
        }
    }
}

fn dispatch(shared: &Arc<Shared>, reply: BlockReply) {
    let tid = reply.tid();
    let txn = shared.transactions.lock().expect("transactions mutex poisoned").remove(&tid);
    let Some(txn) = txn else {
        warn!(tid, "reply for unknown transaction id");
        return;
    };
    let mapped = match reply {
        BlockReply::Desc { .. } => return, // only ever expected once, during connect()
        BlockReply::ReadData { data, .. } => Reply::ReadData(data),
        BlockReply::WriteOk { .. } => Reply::WriteOk,
        BlockReply::ShutdownOk { .. } => Reply::ShutdownOk,
    };
    let _ = txn.tx.send(Ok(mapped));
}

pub struct DriveClient {
    shared: Arc<Shared>,
    desc: DiskDescription,
    _receiver: std::thread::JoinHandle<()>,
}

impl DriveClient {
    pub fn connect(addr: &str) -> std::result::Result<Self, TransportError> {
        let mut stream = TcpStream::connect(addr)
            .map_err(|e| TransportError::SocketConnect { addr: addr.to_string(), source: e })?;

        let mut handshake_codec = BlockClientCodec::new(0);
        let mut out = BytesMut::new();
        handshake_codec
            .encode(BlockRequest::GetDesc { tid: 0 }, &mut out)
            .expect("encoding GET_DESC never fails");
        stream.write_all(&out).map_err(TransportError::SocketSend)?;

        let mut in_buf = BytesMut::with_capacity(64);
        let mut scratch = [0u8; 64];
        let desc = loop {
            match handshake_codec.decode(&mut in_buf) {
                Ok(Some(BlockReply::Desc { desc, .. })) => break desc,
                Ok(Some(_)) | Err(_) => {
                    return Err(TransportError::SocketRecv(std::io::Error::other("unexpected handshake reply")))
                }
                Ok(None) => {
                    let n = stream.read(&mut scratch).map_err(TransportError::SocketRecv)?;
                    if n == 0 {
                        return Err(TransportError::SocketClosedByRemote);
                    }
                    in_buf.extend_from_slice(&scratch[..n]);
                }
            }
        };
        let desc: DiskDescription = desc.into();

        let read_stream = stream.try_clone().map_err(TransportError::SocketCreate)?;
        let shared = Arc::new(Shared {
            write_stream: Mutex::new(stream),
            transactions: Mutex::new(HashMap::new()),
            next_tid: AtomicU32::new(1),
            closed: AtomicBool::new(false),
        });

        let sector_size = desc.bytes_per_sector as u32;
        let thread_shared = shared.clone();
        let receiver = std::thread::spawn(move || receiver_loop(thread_shared, read_stream, sector_size));

        Ok(Self { shared, desc, _receiver: receiver })
    }

    fn issue(
        &self,
        req: BlockRequest,
    ) -> std::result::Result<Reply, TransportError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(TransportError::SocketTerminated);
        }
        let tid = req.tid();
        let (tx, rx) = mpsc::channel();
        self.shared.transactions.lock().expect("transactions mutex poisoned").insert(tid, Transaction { tx });

        let mut codec = BlockClientCodec::new(self.desc.bytes_per_sector as u32);
        let mut buf = BytesMut::new();
        codec.encode(req, &mut buf).expect("encoding a block request never fails");
        {
            let mut stream = self.shared.write_stream.lock().expect("write mutex poisoned");
            if let Err(e) = stream.write_all(&buf) {
                self.shared.transactions.lock().expect("transactions mutex poisoned").remove(&tid);
                return Err(TransportError::SocketSend(e));
            }
        }

        match rx.recv() {
            Ok(result) => result,
            Err(_) => Err(TransportError::SocketTerminated),
        }
    }

    fn next_tid(&self) -> u32 {
        self.shared.next_tid.fetch_add(1, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drive::DriveServer;
    use std::time::Duration;

    fn desc() -> DiskDescription {
        DiskDescription { cylinders: 2, sectors_per_cylinder: 4, bytes_per_sector: 256 }
    }

    async fn start_server(port: u16) -> Arc<DriveServer> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drive.img");
        let server = Arc::new(DriveServer::open(&path, desc(), 0, "sstf").unwrap());
        std::mem::forget(dir); // keep the backing file alive for the server's lifetime
        let srv = server.clone();
        tokio::spawn(async move {
            let _ = srv.serve(port).await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        server
    }

    #[tokio::test]
    async fn handshake_fetches_disk_description() {
        start_server(55201).await;
        let got = tokio::task::spawn_blocking(|| DriveClient::connect("127.0.0.1:55201").unwrap().describe())
            .await
            .unwrap();
        assert_eq!(got, desc());
    }

    #[tokio::test]
    async fn read_write_roundtrip_over_network() {
        start_server(55202).await;
        tokio::task::spawn_blocking(|| {
            let client = DriveClient::connect("127.0.0.1:55202").unwrap();
            let data = vec![0x7Au8; 256];
            client.write(3, &data).unwrap();
            let mut out = vec![0u8; 256];
            client.read(3, &mut out).unwrap();
            assert_eq!(out, data);
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn shutdown_terminates_connection_and_refuses_new_calls() {
        start_server(55203).await;
        tokio::task::spawn_blocking(|| {
            let client = DriveClient::connect("127.0.0.1:55203").unwrap();
            client.shutdown().unwrap();
            std::thread::sleep(Duration::from_millis(50));
            let mut out = vec![0u8; 256];
            assert!(client.read(0, &mut out).is_err());
        })
        .await
        .unwrap();
    }
}

impl StorageProvider for DriveClient {
    fn read(&self, sector_addr: u64, out_buf: &mut [u8]) -> std::result::Result<(), crate::error::StorageError> {
        let tid = self.next_tid();
        match self.issue(BlockRequest::Read { tid, sector_addr })? {
            Reply::ReadData(data) => {
                out_buf.copy_from_slice(&data);
                Ok(())
            }
            _ => Err(TransportError::SocketRecv(std::io::Error::other("unexpected reply to READ")).into()),
        }
    }

    fn write(&self, sector_addr: u64, in_buf: &[u8]) -> std::result::Result<(), crate::error::StorageError> {
        let tid = self.next_tid();
        match self.issue(BlockRequest::Write { tid, sector_addr, data: in_buf.to_vec() })? {
            Reply::WriteOk => Ok(()),
            _ => Err(TransportError::SocketRecv(std::io::Error::other("unexpected reply to WRITE")).into()),
        }
    }

    fn describe(&self) -> DiskDescription {
        self.desc
    }

    fn shutdown(&self) -> std::result::Result<(), crate::error::StorageError> {
        let tid = self.next_tid();
        match self.issue(BlockRequest::Shutdown { tid })? {
            Reply::ShutdownOk => Ok(()),
            _ => Err(TransportError::SocketRecv(std::io::Error::other("unexpected reply to SHUTDOWN")).into()),
        }
    }
}
