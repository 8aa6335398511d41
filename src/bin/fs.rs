//! File-system server executable: `fs [<disk_port>] <fs_port>`.
//! With one port, the file system is backed by an in-process [`RamStore`];
//! with two, it connects to a remote virtual drive via [`DriveClient`].

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use vdfs::diskview::DiskView;
use vdfs::drive::client::DriveClient;
use vdfs::error::StorageError;
use vdfs::fs::FileSystem;
use vdfs::fsserver::FsServer;
use vdfs::storage::ram::RamStore;
use vdfs::storage::{DiskDescription, StorageProvider};

/// Geometry used when no drive server is given: the in-memory backing has
/// no natural geometry of its own, so this stands in for one.
const RAM_CYLINDERS: u64 = 256;
const RAM_SECTORS_PER_CYLINDER: u64 = 64;
const RAM_BYTES_PER_SECTOR: u64 = 256;

#[derive(Parser, Debug)]
#[command(name = "fs", about = "File-system protocol server")]
struct Cli {
    /// `<disk_port>` (remote drive) or omitted for an in-memory backing,
    /// followed by `<fs_port>`
    ports: Vec<u16>,
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();
    let cli = Cli::parse();

    let (disk_port, fs_port) = match cli.ports.as_slice() {
        [fs_port] => (None, *fs_port),
        [disk_port, fs_port] => (Some(*disk_port), *fs_port),
        _ => {
            return Err(StorageError::DriveInvalidArgs { message: "usage: fs [<disk_port>] <fs_port>".to_string() }.into());
        }
    };

    let provider: Arc<dyn StorageProvider> = match disk_port {
        Some(port) => Arc::new(DriveClient::connect(&format!("127.0.0.1:{port}"))?),
        None => {
            let desc = DiskDescription {
                cylinders: RAM_CYLINDERS,
                sectors_per_cylinder: RAM_SECTORS_PER_CYLINDER,
                bytes_per_sector: RAM_BYTES_PER_SECTOR,
            };
            Arc::new(RamStore::new(desc))
        }
    };

    let view = DiskView::new(provider);
    let fs = FileSystem::mount(view);
    let server = FsServer::new(fs);
    server.serve(fs_port).await?;
    Ok(())
}
