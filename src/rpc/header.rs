/*
    Copyright © 2024, Groupcast Contributors
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The wire header carried by every RPC payload, ordered or point-to-point.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::error::GroupError;
use crate::types::basic::{FunctionId, NodeId, SubgroupId, TypeId};

/// Flag bit: a reply that itself triggers further sends. Cascading point-to-point
/// messages are rejected by the receive pipeline.
pub const FLAG_CASCADE: u8 = 0x01;

/// The fixed header on every RPC payload:
/// `(class_id, subgroup_id, function_id, is_reply, flags, sender_id, payload_len)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct RpcHeader {
    pub class_id: TypeId,
    pub subgroup_id: SubgroupId,
    pub function_id: FunctionId,
    pub is_reply: bool,
    pub flags: u8,
    pub sender_id: NodeId,
    pub payload_len: u32,
}

impl RpcHeader {
    pub fn cascade(&self) -> bool {
        self.flags & FLAG_CASCADE != 0
    }

    /// The dispatch key this header selects.
    pub fn opcode(&self) -> Opcode {
        Opcode {
            class_id: self.class_id,
            subgroup_id: self.subgroup_id,
            function_id: self.function_id,
            is_reply: self.is_reply,
        }
    }
}

/// Key of the receiver dispatch table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Opcode {
    pub class_id: TypeId,
    pub subgroup_id: SubgroupId,
    pub function_id: FunctionId,
    pub is_reply: bool,
}

/// Serialize a header followed by its payload into one wire buffer.
pub fn encode_message(mut header: RpcHeader, payload: &[u8]) -> Result<Vec<u8>, GroupError> {
    header.payload_len = payload.len() as u32;
    let mut bytes = header.try_to_vec()?;
    bytes.extend_from_slice(payload);
    Ok(bytes)
}

/// Split a wire buffer back into its header and payload. A short buffer, an
/// undecodable header, or a payload length disagreeing with the header is an
/// [`GroupError::InvalidRpcMessage`].
pub fn decode_message(bytes: &[u8]) -> Result<(RpcHeader, &[u8]), GroupError> {
    let mut remainder: &[u8] = bytes;
    let header = RpcHeader::deserialize(&mut remainder)
        .map_err(|e| GroupError::InvalidRpcMessage(format!("undecodable header: {e}")))?;
    if remainder.len() != header.payload_len as usize {
        return Err(GroupError::InvalidRpcMessage(format!(
            "header names a {}-byte payload but {} bytes follow",
            header.payload_len,
            remainder.len()
        )));
    }
    Ok((header, remainder))
}

/// The body of a call payload: the caller's invocation id (echoed by replies so
/// they can be matched to the pending result) and the marshalled arguments.
#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct CallBody {
    pub invocation: u64,
    pub args: Vec<u8>,
}

/// The body of a reply payload.
#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct ReplyBody {
    pub invocation: u64,
    pub value: ReplyValue,
}

/// A handler's marshalled return, or the serialization failure that took its place.
#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub enum ReplyValue {
    Ok(Vec<u8>),
    SerializationFailure,
}
