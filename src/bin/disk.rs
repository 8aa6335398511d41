//! Virtual drive executable: `disk <file> -c <cylinders>
//! -s <sectors/cyl> [-b <bytes/sector=256>] [-d <delay_us=0>] -p <port>
//! [--policy <sstf|scan|cscan|look|clook>]`.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use vdfs::drive::DriveServer;
use vdfs::error::StorageError;
use vdfs::storage::DiskDescription;

#[derive(Parser, Debug)]
#[command(name = "disk", about = "Virtual drive server: a memory-mapped sector store over TCP")]
struct Cli {
    /// Backing file path
    file: PathBuf,

    /// Cylinders
    #[arg(short = 'c', long = "cylinders")]
    cylinders: u64,

    /// Sectors per cylinder
    #[arg(short = 's', long = "sectors")]
    sectors_per_cylinder: u64,

    /// Bytes per sector
    #[arg(short = 'b', long = "bytes", default_value_t = 256)]
    bytes_per_sector: u64,

    /// Simulated per-cylinder seek cost, in microseconds
    #[arg(short = 'd', long = "delay", default_value_t = 0)]
    delay_us: u64,

    /// TCP port (1000..65535)
    #[arg(short = 'p', long = "port")]
    port: u16,

    /// Head-scheduling policy
    #[arg(long = "policy", default_value = "sstf")]
    policy: String,
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();
    let cli = Cli::parse();

    if !(1000..65535).contains(&cli.port) {
        return Err(StorageError::DriveInvalidArgs { message: format!("port {} out of range 1000..65535", cli.port) }.into());
    }
    if !cli.sectors_per_cylinder.is_power_of_two() || !cli.bytes_per_sector.is_power_of_two() {
        return Err(StorageError::DriveInvalidArgs {
            message: "sectors/cylinder and bytes/sector must be powers of two".to_string(),
        }
        .into());
    }

    let desc = DiskDescription {
        cylinders: cli.cylinders,
        sectors_per_cylinder: cli.sectors_per_cylinder,
        bytes_per_sector: cli.bytes_per_sector,
    };
    let server = Arc::new(DriveServer::open(&cli.file, desc, cli.delay_us, &cli.policy)?);
    server.serve(cli.port).await?;
    Ok(())
}
