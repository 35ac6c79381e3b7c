//! Typed payloads for the control-plane cell kinds.
//!
//! [`convert_to_cell`] and [`convert_from_cell`] marshal between these
//! structs and the framed form of [`cell`](crate::cell). The dispatcher
//! decrypts a cell's tail (where the kind demands it) before converting.

use crate::cell::{self, CellKind};
use crate::{Result, WireError};

/// Length of a DH public share on the wire.
pub const DH_SHARE_LEN: usize = 32;

/// Upper bound on candidates offered in a `created`/`extended` reply.
pub const MAX_CANDIDATES: usize = 4;

/// `create`: first half of the telescoped DH exchange.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreatePayload {
    pub circuit_id: u32,
    /// DH public share, hybrid-encrypted to the joining peer's long-term key.
    pub dh_blob: Vec<u8>,
}

/// `created`: second half of the DH exchange plus extension candidates.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreatedPayload {
    pub circuit_id: u32,
    /// The joining peer's DH public share, in the clear.
    pub dh_share: [u8; DH_SHARE_LEN],
    /// Candidate public-key list, encrypted with the fresh endpoint sub-key.
    pub candidate_list_enc: Vec<u8>,
}

/// `extend`: ask the current terminus to telescope one hop further.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtendPayload {
    pub circuit_id: u32,
    /// Which offered candidate to extend with.
    pub extend_with: [u8; DH_SHARE_LEN],
    /// DH public share, hybrid-encrypted to the chosen candidate's key.
    pub dh_blob: Vec<u8>,
}

/// `extended`: a relayed `created`, rewritten on its way back down.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtendedPayload {
    pub circuit_id: u32,
    pub dh_share: [u8; DH_SHARE_LEN],
    pub candidate_list_enc: Vec<u8>,
}

/// `ping` / `pong`: keep-alive probe and its echo.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PingPayload {
    pub circuit_id: u32,
    pub identifier: u16,
}

/// A fully decoded control-plane message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TunnelMessage {
    Create(CreatePayload),
    Created(CreatedPayload),
    Extend(ExtendPayload),
    Extended(ExtendedPayload),
    Ping(PingPayload),
    Pong(PingPayload),
}

impl TunnelMessage {
    /// The kind discriminator this message frames as.
    pub fn kind(&self) -> CellKind {
        match self {
            Self::Create(_) => CellKind::Create,
            Self::Created(_) => CellKind::Created,
            Self::Extend(_) => CellKind::Extend,
            Self::Extended(_) => CellKind::Extended,
            Self::Ping(_) => CellKind::Ping,
            Self::Pong(_) => CellKind::Pong,
        }
    }

    /// The circuit id carried in the plaintext header.
    pub fn circuit_id(&self) -> u32 {
        match self {
            Self::Create(p) => p.circuit_id,
            Self::Created(p) => p.circuit_id,
            Self::Extend(p) => p.circuit_id,
            Self::Extended(p) => p.circuit_id,
            Self::Ping(p) | Self::Pong(p) => p.circuit_id,
        }
    }
}

/// Marshal a message into its framed cell form, tail in plaintext.
pub fn convert_to_cell(message: &TunnelMessage) -> Vec<u8> {
    let tail = match message {
        TunnelMessage::Create(p) => p.dh_blob.clone(),
        TunnelMessage::Created(p) => created_tail(&p.dh_share, &p.candidate_list_enc),
        TunnelMessage::Extended(p) => created_tail(&p.dh_share, &p.candidate_list_enc),
        TunnelMessage::Extend(p) => {
            let mut tail = Vec::with_capacity(DH_SHARE_LEN + p.dh_blob.len());
            tail.extend_from_slice(&p.extend_with);
            tail.extend_from_slice(&p.dh_blob);
            tail
        }
        TunnelMessage::Ping(p) | TunnelMessage::Pong(p) => p.identifier.to_be_bytes().to_vec(),
    };
    cell::frame_cell(message.kind(), message.circuit_id(), &tail)
}

fn created_tail(dh_share: &[u8; DH_SHARE_LEN], candidate_list_enc: &[u8]) -> Vec<u8> {
    let mut tail = Vec::with_capacity(DH_SHARE_LEN + candidate_list_enc.len());
    tail.extend_from_slice(dh_share);
    tail.extend_from_slice(candidate_list_enc);
    tail
}

/// Unmarshal a cell whose tail has been fully decrypted.
pub fn convert_from_cell(packet: &[u8]) -> Result<TunnelMessage> {
    let kind = cell::get_kind(packet)?;
    let circuit_id = cell::get_circuit_id(packet)?;
    let (_, tail) = cell::split_encrypted_packet(packet)?;

    match kind {
        CellKind::Create => Ok(TunnelMessage::Create(CreatePayload {
            circuit_id,
            dh_blob: tail.to_vec(),
        })),
        CellKind::Created | CellKind::Extended => {
            if tail.len() < DH_SHARE_LEN {
                return Err(WireError::MalformedPayload {
                    kind: kind.name(),
                    reason: "missing DH share",
                });
            }
            let mut dh_share = [0u8; DH_SHARE_LEN];
            dh_share.copy_from_slice(&tail[..DH_SHARE_LEN]);
            let candidate_list_enc = tail[DH_SHARE_LEN..].to_vec();
            if kind == CellKind::Created {
                Ok(TunnelMessage::Created(CreatedPayload {
                    circuit_id,
                    dh_share,
                    candidate_list_enc,
                }))
            } else {
                Ok(TunnelMessage::Extended(ExtendedPayload {
                    circuit_id,
                    dh_share,
                    candidate_list_enc,
                }))
            }
        }
        CellKind::Extend => {
            if tail.len() < DH_SHARE_LEN {
                return Err(WireError::MalformedPayload {
                    kind: kind.name(),
                    reason: "missing chosen candidate key",
                });
            }
            let mut extend_with = [0u8; DH_SHARE_LEN];
            extend_with.copy_from_slice(&tail[..DH_SHARE_LEN]);
            Ok(TunnelMessage::Extend(ExtendPayload {
                circuit_id,
                extend_with,
                dh_blob: tail[DH_SHARE_LEN..].to_vec(),
            }))
        }
        CellKind::Ping | CellKind::Pong => {
            if tail.len() < 2 {
                return Err(WireError::MalformedPayload {
                    kind: kind.name(),
                    reason: "missing identifier",
                });
            }
            let identifier = u16::from_be_bytes([tail[0], tail[1]]);
            let payload = PingPayload {
                circuit_id,
                identifier,
            };
            if kind == CellKind::Ping {
                Ok(TunnelMessage::Ping(payload))
            } else {
                Ok(TunnelMessage::Pong(payload))
            }
        }
    }
}

/// Serialize a candidate public-key list: `[count:1]` then per candidate
/// `[len:1][key bytes]`. Length-prefixing keeps keys of other algorithms
/// representable so the originator can filter them.
pub fn encode_candidate_list(candidates: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + candidates.iter().map(|c| 1 + c.len()).sum::<usize>());
    out.push(candidates.len() as u8);
    for key in candidates {
        out.push(key.len() as u8);
        out.extend_from_slice(key);
    }
    out
}

/// Parse a candidate public-key list produced by [`encode_candidate_list`].
pub fn decode_candidate_list(data: &[u8]) -> Result<Vec<Vec<u8>>> {
    let malformed = |reason| WireError::MalformedPayload {
        kind: "candidate-list",
        reason,
    };
    let (&count, mut rest) = data.split_first().ok_or(malformed("empty"))?;
    let mut candidates = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (&len, tail) = rest.split_first().ok_or(malformed("truncated entry"))?;
        if tail.len() < len as usize {
            return Err(malformed("truncated key"));
        }
        let (key, tail) = tail.split_at(len as usize);
        candidates.push(key.to_vec());
        rest = tail;
    }
    if !rest.is_empty() {
        return Err(malformed("trailing bytes"));
    }
    Ok(candidates)
}
