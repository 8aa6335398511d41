//! Block protocol: the transaction framing between the virtual drive server
//! and its network client.
//!
//! A request frame is `(instr: u8, tid: u32, payload)`; a reply frame mirrors
//! it. `GET_DESC` carries no request payload and a fixed 24-byte reply
//! (`cylinders`, `sectors_per_cylinder`, `bytes_per_sector`, each `u64`).
//! `READ`/`WRITE` payloads depend on the sector size, which both codecs must
//! be constructed with.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::ProtoError;

pub const INSTR_GET_DESC: u8 = 0;
pub const INSTR_READ: u8 = 1;
pub const INSTR_WRITE: u8 = 2;
pub const INSTR_SHUTDOWN: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskDescription {
    pub cylinders: u64,
    pub sectors_per_cylinder: u64,
    pub bytes_per_sector: u64,
}

impl DiskDescription {
    pub const WIRE_LEN: usize = 24;

    fn decode(buf: &[u8]) -> Self {
        Self {
            cylinders: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            sectors_per_cylinder: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            bytes_per_sector: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
        }
    }

    fn encode(&self, dst: &mut BytesMut) {
        dst.put_u64_le(self.cylinders);
        dst.put_u64_le(self.sectors_per_cylinder);
        dst.put_u64_le(self.bytes_per_sector);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockRequest {
    GetDesc { tid: u32 },
    Read { tid: u32, sector_addr: u64 },
    Write { tid: u32, sector_addr: u64, data: Vec<u8> },
    Shutdown { tid: u32 },
}

impl BlockRequest {
    pub fn tid(&self) -> u32 {
        match self {
            BlockRequest::GetDesc { tid }
            | BlockRequest::Read { tid, .. }
            | BlockRequest::Write { tid, .. }
            | BlockRequest::Shutdown { tid } => *tid,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockReply {
    Desc { tid: u32, desc: DiskDescription },
    ReadData { tid: u32, data: Vec<u8> },
    WriteOk { tid: u32 },
    ShutdownOk { tid: u32 },
}

impl BlockReply {
    pub fn tid(&self) -> u32 {
        match self {
            BlockReply::Desc { tid, .. }
            | BlockReply::ReadData { tid, .. }
            | BlockReply::WriteOk { tid }
            | BlockReply::ShutdownOk { tid } => *tid,
        }
    }
}

/// Shared by both ends: decides how many bytes a frame body needs once the
/// 5-byte header (`instr`, `tid`) is available.
fn body_len(instr: u8, sector_size: u32, is_request: bool) -> Option<usize> {
    match instr {
        INSTR_GET_DESC => Some(if is_request { 0 } else { DiskDescription::WIRE_LEN }),
        INSTR_READ => Some(if is_request { 8 } else { sector_size as usize }),
        INSTR_WRITE => Some(if is_request { 8 + sector_size as usize } else { 0 }),
        INSTR_SHUTDOWN => Some(0),
        _ => None,
    }
}

/// Server-side codec: decodes requests, encodes replies.
pub struct BlockServerCodec {
    sector_size: u32,
}

impl BlockServerCodec {
    pub fn new(sector_size: u32) -> Self {
        Self { sector_size }
    }
}

impl Decoder for BlockServerCodec {
    type Item = BlockRequest;
    type Error = ProtoError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 5 {
            return Ok(None);
        }
        let instr = src[0];
        let tid = u32::from_le_bytes(src[1..5].try_into().unwrap());
        let Some(body) = body_len(instr, self.sector_size, true) else {
            return Err(ProtoError::UnknownInstr(instr));
        };
        let total = 5 + body;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }
        src.advance(5);
        let req = match instr {
            INSTR_GET_DESC => BlockRequest::GetDesc { tid },
            INSTR_READ => {
                let sector_addr = src.get_u64_le();
                BlockRequest::Read { tid, sector_addr }
            }
            INSTR_WRITE => {
                let sector_addr = src.get_u64_le();
                let data = src.split_to(self.sector_size as usize).to_vec();
                BlockRequest::Write { tid, sector_addr, data }
            }
            INSTR_SHUTDOWN => BlockRequest::Shutdown { tid },
            _ => unreachable!(),
        };
        Ok(Some(req))
    }
}

impl Encoder<BlockReply> for BlockServerCodec {
    type Error = ProtoError;

    fn encode(&mut self, item: BlockReply, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            BlockReply::Desc { tid, desc } => {
                dst.put_u8(INSTR_GET_DESC);
                dst.put_u32_le(tid);
                desc.encode(dst);
            }
            BlockReply::ReadData { tid, data } => {
                dst.put_u8(INSTR_READ);
                dst.put_u32_le(tid);
                dst.extend_from_slice(&data);
            }
            BlockReply::WriteOk { tid } => {
                dst.put_u8(INSTR_WRITE);
                dst.put_u32_le(tid);
            }
            BlockReply::ShutdownOk { tid } => {
                dst.put_u8(INSTR_SHUTDOWN);
                dst.put_u32_le(tid);
            }
        }
        Ok(())
    }
}

/// Client-side codec: encodes requests, decodes replies.
pub struct BlockClientCodec {
    sector_size: u32,
}

impl BlockClientCodec {
    pub fn new(sector_size: u32) -> Self {
        Self { sector_size }
    }
}

impl Encoder<BlockRequest> for BlockClientCodec {
    type Error = ProtoError;

    fn encode(&mut self, item: BlockRequest, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            BlockRequest::GetDesc { tid } => {
                dst.put_u8(INSTR_GET_DESC);
                dst.put_u32_le(tid);
            }
            BlockRequest::Read { tid, sector_addr } => {
                dst.put_u8(INSTR_READ);
                dst.put_u32_le(tid);
                dst.put_u64_le(sector_addr);
            }
            BlockRequest::Write { tid, sector_addr, data } => {
                dst.put_u8(INSTR_WRITE);
                dst.put_u32_le(tid);
                dst.put_u64_le(sector_addr);
                dst.extend_from_slice(&data);
            }
            BlockRequest::Shutdown { tid } => {
                dst.put_u8(INSTR_SHUTDOWN);
                dst.put_u32_le(tid);
            }
        }
        Ok(())
    }
}

impl Decoder for BlockClientCodec {
    type Item = BlockReply;
    type Error = ProtoError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 5 {
            return Ok(None);
        }
        let instr = src[0];
        let tid = u32::from_le_bytes(src[1..5].try_into().unwrap());
        let Some(body) = body_len(instr, self.sector_size, false) else {
            return Err(ProtoError::UnknownInstr(instr));
        };
        let total = 5 + body;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }
        src.advance(5);
        let reply = match instr {
            INSTR_GET_DESC => {
                let desc = DiskDescription::decode(&src[..DiskDescription::WIRE_LEN]);
                src.advance(DiskDescription::WIRE_LEN);
                BlockReply::Desc { tid, desc }
            }
            INSTR_READ => {
                let data = src.split_to(self.sector_size as usize).to_vec();
                BlockReply::ReadData { tid, data }
            }
            INSTR_WRITE => BlockReply::WriteOk { tid },
            INSTR_SHUTDOWN => BlockReply::ShutdownOk { tid },
            _ => unreachable!(),
        };
        Ok(Some(reply))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip_request(sector_size: u32, req: BlockRequest) {
        let mut server = BlockServerCodec::new(sector_size);
        let mut client = BlockClientCodec::new(sector_size);
        let mut buf = BytesMut::new();
        client.encode(req.clone(), &mut buf).unwrap();
        let decoded = server.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, req);
        assert!(buf.is_empty());
    }

    #[test]
    fn get_desc_request_roundtrip() {
        roundtrip_request(256, BlockRequest::GetDesc { tid: 0 });
    }

    #[test]
    fn read_request_roundtrip() {
        roundtrip_request(256, BlockRequest::Read { tid: 7, sector_addr: 1234 });
    }

    #[test]
    fn write_request_roundtrip() {
        roundtrip_request(
            256,
            BlockRequest::Write { tid: 9, sector_addr: 1, data: vec![0xAB; 256] },
        );
    }

    #[test]
    fn partial_write_waits_for_full_frame() {
        let mut server = BlockServerCodec::new(256);
        let mut client = BlockClientCodec::new(256);
        let mut full = BytesMut::new();
        client
            .encode(
                BlockRequest::Write { tid: 1, sector_addr: 2, data: vec![7; 256] },
                &mut full,
            )
            .unwrap();

        let mut partial = full.split_to(full.len() - 1);
        assert!(server.decode(&mut partial).unwrap().is_none());
        partial.unsplit(full);
        assert!(server.decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn reply_roundtrip() {
        let mut server = BlockServerCodec::new(256);
        let mut client = BlockClientCodec::new(256);
        let mut buf = BytesMut::new();
        let reply = BlockReply::Desc {
            tid: 0,
            desc: DiskDescription { cylinders: 4, sectors_per_cylinder: 8, bytes_per_sector: 256 },
        };
        server.encode(reply.clone(), &mut buf).unwrap();
        let decoded = client.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, reply);
    }

    #[test]
    fn unknown_instr_errors() {
        let mut server = BlockServerCodec::new(256);
        let mut buf = BytesMut::new();
        buf.put_u8(0xFF);
        buf.put_u32_le(0);
        assert!(server.decode(&mut buf).is_err());
    }
}
