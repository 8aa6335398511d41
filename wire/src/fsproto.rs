//! File-system protocol: one TCP stream per shell, length-prefixed strings
//! on the wire, fixed-width little-endian numeric fields.
//!
//! Unlike the block protocol there is no transaction id — each connection is
//! served by exactly one worker which executes commands strictly in order,
//! so request/reply correspondence is purely positional.
//!
//! The one-time greeting (`CONNECTED_OK` / `CONNECTED_NO_FORMAT`) is a bare
//! byte sent before the first request and is not modeled as a codec item —
//! see `write_greeting`/`read_greeting`.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{ProtoError, MAX_STRING_LEN};

pub const INSTR_CD: u8 = 0;
pub const INSTR_LS: u8 = 1;
pub const INSTR_MK: u8 = 2;
pub const INSTR_RM: u8 = 3;
pub const INSTR_MKDIR: u8 = 4;
pub const INSTR_RMDIR: u8 = 5;
pub const INSTR_CAT: u8 = 8;
pub const INSTR_WRITE: u8 = 9;
pub const INSTR_INSERT: u8 = 10;
pub const INSTR_DELETE: u8 = 11;
pub const INSTR_FORMAT: u8 = 15;

pub const GREETING_CONNECTED_OK: u8 = 0x40;
pub const GREETING_CONNECTED_NO_FORMAT: u8 = 0x41;

pub const REPLY_OK: u8 = 0x20;
pub const REPLY_NOT_EXIST: u8 = 0x30;
pub const REPLY_ALREADY_EXIST: u8 = 0x31;
pub const REPLY_NAME_TOO_LONG: u8 = 0x32;
pub const REPLY_NAME_INVALID: u8 = 0x33;
pub const REPLY_BUSY_HANDLE: u8 = 0x34;
pub const REPLY_CAPACITY_EXCEEDED: u8 = 0x35;
pub const REPLY_ACCESS_DENIED: u8 = 0x36;
pub const REPLY_NOT_EMPTY: u8 = 0x37;
pub const REPLY_UNKNOWN: u8 = 0x3F;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsErrorCode {
    NotExist,
    AlreadyExist,
    NameTooLong,
    NameInvalid,
    BusyHandle,
    CapacityExceeded,
    AccessDenied,
    NotEmpty,
    Unknown,
}

impl FsErrorCode {
    pub fn wire_code(self) -> u8 {
        match self {
            FsErrorCode::NotExist => REPLY_NOT_EXIST,
            FsErrorCode::AlreadyExist => REPLY_ALREADY_EXIST,
            FsErrorCode::NameTooLong => REPLY_NAME_TOO_LONG,
            FsErrorCode::NameInvalid => REPLY_NAME_INVALID,
            FsErrorCode::BusyHandle => REPLY_BUSY_HANDLE,
            FsErrorCode::CapacityExceeded => REPLY_CAPACITY_EXCEEDED,
            FsErrorCode::AccessDenied => REPLY_ACCESS_DENIED,
            FsErrorCode::NotEmpty => REPLY_NOT_EMPTY,
            FsErrorCode::Unknown => REPLY_UNKNOWN,
        }
    }

    pub fn from_wire(code: u8) -> Self {
        match code {
            REPLY_NOT_EXIST => FsErrorCode::NotExist,
            REPLY_ALREADY_EXIST => FsErrorCode::AlreadyExist,
            REPLY_NAME_TOO_LONG => FsErrorCode::NameTooLong,
            REPLY_NAME_INVALID => FsErrorCode::NameInvalid,
            REPLY_BUSY_HANDLE => FsErrorCode::BusyHandle,
            REPLY_CAPACITY_EXCEEDED => FsErrorCode::CapacityExceeded,
            REPLY_ACCESS_DENIED => FsErrorCode::AccessDenied,
            REPLY_NOT_EMPTY => FsErrorCode::NotEmpty,
            _ => FsErrorCode::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsRequest {
    Cd { name: String },
    Ls,
    Mk { name: String },
    Rm { name: String },
    Mkdir { name: String },
    Rmdir { name: String },
    Cat { name: String },
    Write { name: String, data: Vec<u8> },
    Insert { name: String, pos: u64, data: Vec<u8> },
    Delete { name: String, pos: u64, len: u64 },
    Format,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsReply {
    Ok,
    OkPath(String),
    OkList(Vec<String>),
    OkData(Vec<u8>),
    Err(FsErrorCode),
}

/// Reads a `u64` length followed by that many raw bytes. Returns `Ok(None)`
/// if `buf[*pos..]` doesn't yet contain the full field.
fn try_read_bytes(buf: &[u8], pos: &mut usize) -> Result<Option<Vec<u8>>, ProtoError> {
    if buf.len() < *pos + 8 {
        return Ok(None);
    }
    let len = u64::from_le_bytes(buf[*pos..*pos + 8].try_into().unwrap());
    if len > MAX_STRING_LEN {
        return Err(ProtoError::StringTooLong(len as usize, MAX_STRING_LEN as usize));
    }
    let len = len as usize;
    if buf.len() < *pos + 8 + len {
        return Ok(None);
    }
    let data = buf[*pos + 8..*pos + 8 + len].to_vec();
    *pos += 8 + len;
    Ok(Some(data))
}

fn try_read_string(buf: &[u8], pos: &mut usize) -> Result<Option<String>, ProtoError> {
    Ok(try_read_bytes(buf, pos)?.map(|b| String::from_utf8_lossy(&b).into_owned()))
}

fn try_read_u64(buf: &[u8], pos: &mut usize) -> Option<u64> {
    if buf.len() < *pos + 8 {
        return None;
    }
    let v = u64::from_le_bytes(buf[*pos..*pos + 8].try_into().unwrap());
    *pos += 8;
    Some(v)
}

fn put_string(dst: &mut BytesMut, s: &str) {
    dst.put_u64_le(s.len() as u64);
    dst.extend_from_slice(s.as_bytes());
}

fn put_bytes(dst: &mut BytesMut, b: &[u8]) {
    dst.put_u64_le(b.len() as u64);
    dst.extend_from_slice(b);
}

/// Server-side codec: decodes requests, encodes replies.
#[derive(Default)]
pub struct FsServerCodec;

impl Decoder for FsServerCodec {
    type Item = FsRequest;
    type Error = ProtoError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        let instr = src[0];
        let mut pos = 1usize;
        let req = match instr {
            INSTR_LS | INSTR_FORMAT => {
                // no payload
                if instr == INSTR_LS { FsRequest::Ls } else { FsRequest::Format }
            }
            INSTR_CD | INSTR_MK | INSTR_RM | INSTR_MKDIR | INSTR_RMDIR | INSTR_CAT => {
                let Some(name) = try_read_string(src, &mut pos)? else { return Ok(None) };
                match instr {
                    INSTR_CD => FsRequest::Cd { name },
                    INSTR_MK => FsRequest::Mk { name },
                    INSTR_RM => FsRequest::Rm { name },
                    INSTR_MKDIR => FsRequest::Mkdir { name },
                    INSTR_RMDIR => FsRequest::Rmdir { name },
                    INSTR_CAT => FsRequest::Cat { name },
                    _ => unreachable!(),
                }
            }
            INSTR_WRITE => {
                let Some(name) = try_read_string(src, &mut pos)? else { return Ok(None) };
                let Some(data) = try_read_bytes(src, &mut pos)? else { return Ok(None) };
                FsRequest::Write { name, data }
            }
            INSTR_INSERT => {
                let Some(name) = try_read_string(src, &mut pos)? else { return Ok(None) };
                let Some(posv) = try_read_u64(src, &mut pos) else { return Ok(None) };
                let Some(data) = try_read_bytes(src, &mut pos)? else { return Ok(None) };
                FsRequest::Insert { name, pos: posv, data }
            }
            INSTR_DELETE => {
                let Some(name) = try_read_string(src, &mut pos)? else { return Ok(None) };
                let Some(posv) = try_read_u64(src, &mut pos) else { return Ok(None) };
                let Some(lenv) = try_read_u64(src, &mut pos) else { return Ok(None) };
                FsRequest::Delete { name, pos: posv, len: lenv }
            }
            other => return Err(ProtoError::UnknownInstr(other)),
        };
        src.advance(pos);
        Ok(Some(req))
    }
}

impl Encoder<FsReply> for FsServerCodec {
    type Error = ProtoError;

    fn encode(&mut self, item: FsReply, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            FsReply::Ok => dst.put_u8(REPLY_OK),
            FsReply::OkPath(path) => {
                dst.put_u8(REPLY_OK);
                put_string(dst, &path);
            }
            FsReply::OkList(entries) => {
                dst.put_u8(REPLY_OK);
                dst.put_u32_le(entries.len() as u32);
                for e in entries {
                    put_string(dst, &e);
                }
            }
            FsReply::OkData(data) => {
                dst.put_u8(REPLY_OK);
                put_bytes(dst, &data);
            }
            FsReply::Err(code) => dst.put_u8(code.wire_code()),
        }
        Ok(())
    }
}

/// Client-side codec: encodes requests, decodes replies.
///
/// The reply shape for a given request is positional (no tag on the wire
/// beyond the leading reply-code byte), so the client codec must be told
/// which request is outstanding before it can decode the matching reply.
pub struct FsClientCodec {
    pending: Option<FsRequestKind>,
}

#[derive(Clone, Copy)]
enum FsRequestKind {
    Cd,
    Ls,
    Simple, // MK/RM/MKDIR/RMDIR/WRITE/INSERT/DELETE/FORMAT: OK or error, no extra payload
    Cat,
}

impl Default for FsClientCodec {
    fn default() -> Self {
        Self { pending: None }
    }
}

impl FsClientCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Encoder<FsRequest> for FsClientCodec {
    type Error = ProtoError;

    fn encode(&mut self, item: FsRequest, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let kind = match &item {
            FsRequest::Cd { .. } => FsRequestKind::Cd,
            FsRequest::Ls => FsRequestKind::Ls,
            FsRequest::Cat { .. } => FsRequestKind::Cat,
            _ => FsRequestKind::Simple,
        };
        match item {
            FsRequest::Cd { name } => {
                dst.put_u8(INSTR_CD);
                put_string(dst, &name);
            }
            FsRequest::Ls => dst.put_u8(INSTR_LS),
            FsRequest::Mk { name } => {
                dst.put_u8(INSTR_MK);
                put_string(dst, &name);
            }
            FsRequest::Rm { name } => {
                dst.put_u8(INSTR_RM);
                put_string(dst, &name);
            }
            FsRequest::Mkdir { name } => {
                dst.put_u8(INSTR_MKDIR);
                put_string(dst, &name);
            }
            FsRequest::Rmdir { name } => {
                dst.put_u8(INSTR_RMDIR);
                put_string(dst, &name);
            }
            FsRequest::Cat { name } => {
                dst.put_u8(INSTR_CAT);
                put_string(dst, &name);
            }
            FsRequest::Write { name, data } => {
                dst.put_u8(INSTR_WRITE);
                put_string(dst, &name);
                put_bytes(dst, &data);
            }
            FsRequest::Insert { name, pos, data } => {
                dst.put_u8(INSTR_INSERT);
                put_string(dst, &name);
                dst.put_u64_le(pos);
                put_bytes(dst, &data);
            }
            FsRequest::Delete { name, pos, len } => {
                dst.put_u8(INSTR_DELETE);
                put_string(dst, &name);
                dst.put_u64_le(pos);
                dst.put_u64_le(len);
            }
            FsRequest::Format => dst.put_u8(INSTR_FORMAT),
        }
        self.pending = Some(kind);
        Ok(())
    }
}

impl Decoder for FsClientCodec {
    type Item = FsReply;
    type Error = ProtoError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(kind) = self.pending else {
            return Ok(None);
        };
        if src.is_empty() {
            return Ok(None);
        }
        let code = src[0];
        let mut pos = 1usize;

        if code != REPLY_OK {
            src.advance(pos);
            self.pending = None;
            return Ok(Some(FsReply::Err(FsErrorCode::from_wire(code))));
        }

        let reply = match kind {
            FsRequestKind::Cd => {
                let Some(path) = try_read_string(src, &mut pos)? else { return Ok(None) };
                FsReply::OkPath(path)
            }
            FsRequestKind::Ls => {
                if src.len() < pos + 4 {
                    return Ok(None);
                }
                let count = u32::from_le_bytes(src[pos..pos + 4].try_into().unwrap());
                pos += 4;
                let mut entries = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let Some(s) = try_read_string(src, &mut pos)? else { return Ok(None) };
                    entries.push(s);
                }
                FsReply::OkList(entries)
            }
            FsRequestKind::Cat => {
                let Some(data) = try_read_bytes(src, &mut pos)? else { return Ok(None) };
                FsReply::OkData(data)
            }
            FsRequestKind::Simple => FsReply::Ok,
        };
        src.advance(pos);
        self.pending = None;
        Ok(Some(reply))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cd_roundtrip() {
        let mut server = FsServerCodec;
        let mut client = FsClientCodec::new();
        let mut buf = BytesMut::new();
        client.encode(FsRequest::Cd { name: "sub".into() }, &mut buf).unwrap();
        let req = server.decode(&mut buf).unwrap().unwrap();
        assert_eq!(req, FsRequest::Cd { name: "sub".into() });

        let mut reply_buf = BytesMut::new();
        server.encode(FsReply::OkPath("/sub/".into()), &mut reply_buf).unwrap();
        let reply = client.decode(&mut reply_buf).unwrap().unwrap();
        assert_eq!(reply, FsReply::OkPath("/sub/".into()));
    }

    #[test]
    fn ls_roundtrip() {
        let mut server = FsServerCodec;
        let mut client = FsClientCodec::new();
        let mut buf = BytesMut::new();
        client.encode(FsRequest::Ls, &mut buf).unwrap();
        assert_eq!(server.decode(&mut buf).unwrap().unwrap(), FsRequest::Ls);

        let mut reply_buf = BytesMut::new();
        let entries = vec!["a/".to_string(), "b".to_string()];
        server.encode(FsReply::OkList(entries.clone()), &mut reply_buf).unwrap();
        assert_eq!(client.decode(&mut reply_buf).unwrap().unwrap(), FsReply::OkList(entries));
    }

    #[test]
    fn error_reply_roundtrip() {
        let mut server = FsServerCodec;
        let mut client = FsClientCodec::new();
        let mut buf = BytesMut::new();
        client.encode(FsRequest::Mk { name: "f".into() }, &mut buf).unwrap();
        server.decode(&mut buf).unwrap();

        let mut reply_buf = BytesMut::new();
        server
            .encode(FsReply::Err(FsErrorCode::AlreadyExist), &mut reply_buf)
            .unwrap();
        assert_eq!(
            client.decode(&mut reply_buf).unwrap().unwrap(),
            FsReply::Err(FsErrorCode::AlreadyExist)
        );
    }

    #[test]
    fn partial_frame_waits() {
        let mut server = FsServerCodec;
        let mut full = BytesMut::new();
        full.put_u8(INSTR_MK);
        put_string(&mut full, "hello");
        let mut partial = full.split_to(full.len() - 1);
        assert!(server.decode(&mut partial).unwrap().is_none());
        partial.unsplit(full);
        assert!(server.decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn oversized_string_rejected() {
        let mut server = FsServerCodec;
        let mut buf = BytesMut::new();
        buf.put_u8(INSTR_MK);
        buf.put_u64_le(MAX_STRING_LEN + 1);
        assert!(server.decode(&mut buf).is_err());
    }
}
