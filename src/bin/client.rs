//! Raw block-protocol shell: `client <port>`. Interactive styling and
//! line-editing are explicitly out of scope; this is a thin stdin command
//! loop over [`DriveClient`] for manual poking at a running drive server.

use std::io::{self, BufRead, Write};

use clap::Parser;
use tracing_subscriber::EnvFilter;
use vdfs::drive::client::DriveClient;
use vdfs::storage::StorageProvider;

#[derive(Parser, Debug)]
#[command(name = "client", about = "Raw block-protocol shell")]
struct Cli {
    /// Drive server port
    port: u16,
}

fn main() -> miette::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();
    let cli = Cli::parse();

    let client = DriveClient::connect(&format!("127.0.0.1:{}", cli.port))?;
    let desc = client.describe();
    println!(
        "connected: cylinders={} sectors/cyl={} bytes/sector={}",
        desc.cylinders, desc.sectors_per_cylinder, desc.bytes_per_sector
    );
    println!("commands: desc | read <addr> | write <addr> <hex bytes> | shutdown | quit");

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line.map_err(|e| vdfs::error::VdfsError::Io { context: "reading stdin".into(), source: e })?;
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("desc") => {
                let d = client.describe();
                println!("cylinders={} sectors/cyl={} bytes/sector={}", d.cylinders, d.sectors_per_cylinder, d.bytes_per_sector);
            }
            Some("read") => {
                let Some(addr) = parts.next().and_then(|s| s.parse::<u64>().ok()) else {
                    println!("usage: read <addr>");
                    continue;
                };
                let mut buf = vec![0u8; desc.bytes_per_sector as usize];
                match client.read(addr, &mut buf) {
                    Ok(()) => println!("{}", hex_encode(&buf)),
                    Err(e) => println!("Failed: {e}"),
                }
            }
            Some("write") => {
                let Some(addr) = parts.next().and_then(|s| s.parse::<u64>().ok()) else {
                    println!("usage: write <addr> <hex bytes>");
                    continue;
                };
                let Some(hex) = parts.next() else {
                    println!("usage: write <addr> <hex bytes>");
                    continue;
                };
                let Some(mut data) = hex_decode(hex) else {
                    println!("Failed: invalid hex payload");
                    continue;
                };
                data.resize(desc.bytes_per_sector as usize, 0);
                match client.write(addr, &data) {
                    Ok(()) => println!("ok"),
                    Err(e) => println!("Failed: {e}"),
                }
            }
            Some("shutdown") => {
                match client.shutdown() {
                    Ok(()) => println!("ok"),
                    Err(e) => println!("Failed: {e}"),
                }
                break;
            }
            Some("quit") | Some("exit") => break,
            Some(other) => println!("unknown command: {other}"),
            None => {}
        }
        io::stdout().flush().ok();
    }
    Ok(())
}

fn hex_encode(data: &[u8]) -> String {
    data.iter().map(|b| format!("{b:02x}")).collect()
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len()).step_by(2).map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok()).collect()
}
