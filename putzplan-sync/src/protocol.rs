//! Binary frames exchanged between the feed server and its clients.
//!
//! Wire format (bincode `standard()` config, so integers are varints):
//! ```text
//! ┌──────────────┬──────────────────┬──────────┬──────────────────────────┐
//! │ msg_type     │ household_id     │ sequence │ payload                  │
//! │ variant idx  │ len(16) + 16 B   │ varint   │ varint len + ChangeEvent │
//! └──────────────┴──────────────────┴──────────┴──────────────────────────┘
//! ```
//!
//! `msg_type` is the 0-based serde variant index, so the variant order below
//! is part of the format.
//!
//! A client opens with `Subscribe`; the server acks with `Subscribed`
//! carrying its current change sequence, then streams `Change` frames for
//! that household. `Ping`/`Pong` are application-level keepalives.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::realtime::ChangeEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    Subscribe,
    Subscribed,
    /// Row-level change; payload is a `ChangeEvent`
    Change,
    Ping,
    Pong,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedMessage {
    pub msg_type: MessageType,
    pub household_id: Uuid,
    /// Server change counter. Zero on client frames.
    pub sequence: u64,
    pub payload: Vec<u8>,
}

impl FeedMessage {
    fn empty(msg_type: MessageType, household_id: Uuid, sequence: u64) -> Self {
        Self {
            msg_type,
            household_id,
            sequence,
            payload: Vec::new(),
        }
    }

    pub fn subscribe(household_id: Uuid) -> Self {
        Self::empty(MessageType::Subscribe, household_id, 0)
    }

    pub fn subscribed(household_id: Uuid, sequence: u64) -> Self {
        Self::empty(MessageType::Subscribed, household_id, sequence)
    }

    pub fn change(household_id: Uuid, sequence: u64, event: &ChangeEvent) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(event, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self {
            msg_type: MessageType::Change,
            household_id,
            sequence,
            payload,
        })
    }

    pub fn ping(household_id: Uuid) -> Self {
        Self::empty(MessageType::Ping, household_id, 0)
    }

    pub fn pong(household_id: Uuid) -> Self {
        Self::empty(MessageType::Pong, household_id, 0)
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    /// Parse the payload of a `Change` frame.
    pub fn change_event(&self) -> Result<ChangeEvent, ProtocolError> {
        if self.msg_type != MessageType::Change {
            return Err(ProtocolError::InvalidMessageType(self.msg_type));
        }
        let (event, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(event)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("unexpected message type {0:?}")]
    InvalidMessageType(MessageType),
}
