use assert_cmd::cargo::cargo_bin_cmd;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::process::Child;
use std::time::Duration;

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
}

fn connect_with_retry(port: u16) -> TcpStream {
    for _ in 0..100 {
        if let Ok(s) = TcpStream::connect(("127.0.0.1", port)) {
            return s;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    panic!("server on port {port} did not come up");
}

struct Guard(Child);
impl Drop for Guard {
    fn drop(&mut self) {
        let _ = self.0.kill();
    }
}

#[test]
fn help_works_for_all_binaries() {
    for bin in ["disk", "client", "fs"] {
        let output = cargo_bin_cmd!(bin).arg("--help").output().unwrap();
        assert!(output.status.success(), "{bin} --help failed");
    }
}

#[test]
fn disk_rejects_port_out_of_range() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("drive.img");
    let output = cargo_bin_cmd!("disk")
        .args([path.to_str().unwrap(), "-c", "4", "-s", "8", "-p", "42"])
        .output()
        .unwrap();
    assert!(!output.status.success());
}

/// An unformatted disk greets with `CONNECTED_NO_FORMAT`, then `FORMAT`
/// replies `OK`.
#[test]
fn fs_server_greets_unformatted_disk_then_formats() {
    let port = free_port();
    let child = cargo_bin_cmd!("fs").arg(port.to_string()).spawn().unwrap();
    let _guard = Guard(child);

    let mut stream = connect_with_retry(port);
    let mut greeting = [0u8; 1];
    stream.read_exact(&mut greeting).unwrap();
    assert_eq!(greeting[0], 0x41, "expected CONNECTED_NO_FORMAT on a fresh backing store");

    stream.write_all(&[15]).unwrap(); // INSTR_FORMAT, no payload
    let mut reply = [0u8; 1];
    stream.read_exact(&mut reply).unwrap();
    assert_eq!(reply[0], 0x20, "expected OK after FORMAT");
}

/// Duplicate and invalid names are rejected without closing the connection.
#[test]
fn fs_server_rejects_duplicate_and_invalid_names() {
    let port = free_port();
    let child = cargo_bin_cmd!("fs").arg(port.to_string()).spawn().unwrap();
    let _guard = Guard(child);

    let mut stream = connect_with_retry(port);
    let mut greeting = [0u8; 1];
    stream.read_exact(&mut greeting).unwrap();

    stream.write_all(&[15]).unwrap(); // FORMAT
    let mut reply = [0u8; 1];
    stream.read_exact(&mut reply).unwrap();
    assert_eq!(reply[0], 0x20);

    mk(&mut stream, "f");
    assert_eq!(read_u8(&mut stream), 0x20);
    mk(&mut stream, "f");
    assert_eq!(read_u8(&mut stream), 0x31); // ALREADY_EXIST

    mk(&mut stream, "");
    assert_eq!(read_u8(&mut stream), 0x33); // NAME_INVALID

    mk(&mut stream, "a/b");
    assert_eq!(read_u8(&mut stream), 0x33); // NAME_INVALID
}

fn mk(stream: &mut TcpStream, name: &str) {
    stream.write_all(&[2]).unwrap(); // INSTR_MK
    stream.write_all(&(name.len() as u64).to_le_bytes()).unwrap();
    stream.write_all(name.as_bytes()).unwrap();
}

fn read_u8(stream: &mut TcpStream) -> u8 {
    let mut b = [0u8; 1];
    stream.read_exact(&mut b).unwrap();
    b[0]
}
