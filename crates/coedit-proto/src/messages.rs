//! Protocol messages for document sync.

use coedit_core::codec::{decode_state_vector, encode_state_vector};
use coedit_core::{AwarenessUpdate, CodecError, ReplicaId, StateVector, Update};
use serde::{Deserialize, Serialize};

/// Message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// "Here is what I have": encoded state vector
    SyncStep1 {
        /// Encoded [`StateVector`]
        state_vector: Vec<u8>,
    },
    /// Answer to `SyncStep1`: the records the asker is missing
    SyncStep2 {
        /// Encoded [`Update`]
        update: Vec<u8>,
    },
    /// Incremental update of one committed transaction
    SyncUpdate {
        /// Encoded [`Update`]
        update: Vec<u8>,
    },
    /// Presence states
    AwarenessUpdate(AwarenessUpdate),
    /// The sender joined the room
    JoinNotice,
    /// The sender is leaving the room
    LeaveNotice,
}

impl Payload {
    /// Short name for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::SyncStep1 { .. } => "sync_step1",
            Payload::SyncStep2 { .. } => "sync_step2",
            Payload::SyncUpdate { .. } => "sync_update",
            Payload::AwarenessUpdate(_) => "awareness_update",
            Payload::JoinNotice => "join_notice",
            Payload::LeaveNotice => "leave_notice",
        }
    }

    /// Decode the state vector of a `SyncStep1`.
    ///
    /// # Errors
    ///
    /// Returns error if this is not a `SyncStep1` or the vector is malformed.
    pub fn state_vector(&self) -> Result<StateVector, MessageError> {
        match self {
            Payload::SyncStep1 { state_vector } => Ok(decode_state_vector(state_vector)?),
            other => Err(MessageError::UnexpectedPayload(other.kind())),
        }
    }

    /// Decode the update of a `SyncStep2` or `SyncUpdate`.
    ///
    /// # Errors
    ///
    /// Returns error if this payload carries no update or it is malformed.
    pub fn update(&self) -> Result<Update, MessageError> {
        match self {
            Payload::SyncStep2 { update } | Payload::SyncUpdate { update } => {
                Ok(Update::decode(update)?)
            }
            other => Err(MessageError::UnexpectedPayload(other.kind())),
        }
    }
}

/// A message addressed to a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Room name (`doc-{id}`)
    pub room: String,
    /// Replica that sent the message
    pub sender: ReplicaId,
    /// Message body
    pub payload: Payload,
}

impl Envelope {
    /// Create an envelope.
    #[must_use]
    pub fn new(room: impl Into<String>, sender: ReplicaId, payload: Payload) -> Self {
        Self {
            room: room.into(),
            sender,
            payload,
        }
    }

    /// Sync step 1 carrying `sv`.
    #[must_use]
    pub fn sync_step1(room: impl Into<String>, sender: ReplicaId, sv: &StateVector) -> Self {
        Self::new(
            room,
            sender,
            Payload::SyncStep1 {
                state_vector: encode_state_vector(sv),
            },
        )
    }

    /// Sync step 2 answering a step 1.
    #[must_use]
    pub fn sync_step2(room: impl Into<String>, sender: ReplicaId, update: &Update) -> Self {
        Self::new(
            room,
            sender,
            Payload::SyncStep2 {
                update: update.encode(),
            },
        )
    }

    /// Incremental update.
    #[must_use]
    pub fn sync_update(room: impl Into<String>, sender: ReplicaId, update: &Update) -> Self {
        Self::new(
            room,
            sender,
            Payload::SyncUpdate {
                update: update.encode(),
            },
        )
    }

    /// Serialize to CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_cbor(&self) -> Result<Vec<u8>, MessageError> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes)
            .map_err(|e| MessageError::Serialize(e.to_string()))?;
        Ok(bytes)
    }

    /// Deserialize from CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns error if deserialization fails.
    pub fn from_cbor(bytes: &[u8]) -> Result<Self, MessageError> {
        ciborium::from_reader(bytes).map_err(|e| MessageError::Deserialize(e.to_string()))
    }
}

/// Errors for message serialization/deserialization.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MessageError {
    /// Serialization failed
    #[error("serialization failed: {0}")]
    Serialize(String),
    /// Deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialize(String),
    /// Embedded update or state vector is malformed
    #[error("malformed payload: {0}")]
    Codec(#[from] CodecError),
    /// Payload of the wrong kind for the requested accessor
    #[error("unexpected payload {0}")]
    UnexpectedPayload(&'static str),
}
