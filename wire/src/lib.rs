//! Wire framing shared between the virtual-drive client/server pair and the
//! file-system client/server pair.
//!
//! Both protocols are transaction-oriented (a `u8` instruction followed by a
//! `u32` transaction id) and both are little-endian on the wire, so frames
//! are portable across client and server architectures.

pub mod block;
pub mod fsproto;

#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown instruction byte: {0:#x}")]
    UnknownInstr(u8),
    #[error("string payload exceeds max length ({0} > {1})")]
    StringTooLong(usize, usize),
}

/// Read the first `len` bytes of `src` as a string without consuming them.
/// Shared helper for the two length-prefixed-string protocols.
pub(crate) const MAX_STRING_LEN: u64 = 1 << 20;
