//! Control-plane cell framing.
//!
//! ## Layout
//!
//! ```text
//! [magic:2 = 0x55 0x4D][kind:1][circuit_id:4 BE][tail:*]
//! ```
//!
//! The 7-byte header is never encrypted; the tail carries the
//! message-specific fields under zero or more onion layers. Relays rewrite
//! only the circuit id and never touch the tail.

use crate::{Result, WireError};

/// Control-plane magic bytes ("UM").
pub const CELL_MAGIC: [u8; 2] = [0x55, 0x4D];

/// Length of the plaintext cell header.
pub const CELL_HEADER_LEN: usize = 7;

const OFF_KIND: usize = 2;
const OFF_CIRCUIT_ID: usize = 3;

/// The seven control-plane message kinds. The `cell` envelope of the protocol
/// is the frame itself; these discriminate what rides inside it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CellKind {
    Create = 1,
    Created = 2,
    Extend = 3,
    Extended = 4,
    Ping = 5,
    Pong = 6,
}

impl CellKind {
    /// Parse a kind discriminator byte.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::Create),
            2 => Ok(Self::Created),
            3 => Ok(Self::Extend),
            4 => Ok(Self::Extended),
            5 => Ok(Self::Ping),
            6 => Ok(Self::Pong),
            other => Err(WireError::UnknownKind(other)),
        }
    }

    /// Wire name, used for statistics and logging.
    pub fn name(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Created => "created",
            Self::Extend => "extend",
            Self::Extended => "extended",
            Self::Ping => "ping",
            Self::Pong => "pong",
        }
    }

    /// Whether this kind's tail is protected by the hybrid handshake blob
    /// instead of circuit session keys. `create` and `created` travel before
    /// any session key exists on their link.
    pub fn is_handshake(self) -> bool {
        matches!(self, Self::Create | Self::Created)
    }
}

/// Assemble a cell from its header fields and tail.
pub fn frame_cell(kind: CellKind, circuit_id: u32, tail: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(CELL_HEADER_LEN + tail.len());
    packet.extend_from_slice(&CELL_MAGIC);
    packet.push(kind as u8);
    packet.extend_from_slice(&circuit_id.to_be_bytes());
    packet.extend_from_slice(tail);
    packet
}

/// Validate the header and return the kind discriminator.
pub fn get_kind(packet: &[u8]) -> Result<CellKind> {
    check_header(packet)?;
    CellKind::from_u8(packet[OFF_KIND])
}

/// Extract the circuit id without a full decode.
pub fn get_circuit_id(packet: &[u8]) -> Result<u32> {
    check_header(packet)?;
    Ok(read_circuit_id(packet, OFF_CIRCUIT_ID))
}

/// Split a cell into its plaintext header and encrypted tail.
pub fn split_encrypted_packet(packet: &[u8]) -> Result<(&[u8], &[u8])> {
    check_header(packet)?;
    Ok(packet.split_at(CELL_HEADER_LEN))
}

/// Rewrite the circuit id in place for relay forwarding.
///
/// Verifies the current id matches `from` so a misrouted packet cannot be
/// silently relabeled. The encrypted tail is untouched.
pub fn swap_circuit_id(packet: &mut [u8], from: u32, to: u32) -> Result<()> {
    check_header(packet)?;
    swap_at(packet, OFF_CIRCUIT_ID, from, to)
}

pub(crate) fn read_circuit_id(packet: &[u8], offset: usize) -> u32 {
    let mut id = [0u8; 4];
    id.copy_from_slice(&packet[offset..offset + 4]);
    u32::from_be_bytes(id)
}

pub(crate) fn swap_at(packet: &mut [u8], offset: usize, from: u32, to: u32) -> Result<()> {
    let found = read_circuit_id(packet, offset);
    if found != from {
        return Err(WireError::CircuitIdMismatch {
            expected: from,
            found,
        });
    }
    packet[offset..offset + 4].copy_from_slice(&to.to_be_bytes());
    Ok(())
}

fn check_header(packet: &[u8]) -> Result<()> {
    if packet.len() < CELL_HEADER_LEN {
        return Err(WireError::Truncated {
            needed: CELL_HEADER_LEN,
            got: packet.len(),
        });
    }
    if packet[..2] != CELL_MAGIC {
        return Err(WireError::BadMagic);
    }
    Ok(())
}
