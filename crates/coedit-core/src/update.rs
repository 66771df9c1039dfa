//! Operation records and the update wire format.
//!
//! An [`Update`] is the unit exchanged between replicas: a self-contained list
//! of [`Record`]s plus the state-vector range they cover. Updates are produced
//! by committed transactions, by [`crate::Document::diff`] and by
//! [`crate::Document::snapshot`].

use crate::clock::{Id, ReplicaId};
use crate::codec::{CodecError, Decoder, Encoder};
use crate::state_vector::StateVector;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Current binary format version.
pub const FORMAT_VERSION: u8 = 1;

const KIND_INSERT: u8 = 0;
const KIND_DELETE: u8 = 1;
const KIND_MAP_SET: u8 = 2;

const TAG_CHAR: u8 = 0;
const TAG_JSON: u8 = 1;

/// Payload of one sequence item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Content {
    /// One character of a text
    Char(char),
    /// One element of an array
    Json(serde_json::Value),
}

/// What a record does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    /// Insert a sequence item
    Insert {
        /// Id of the left neighbour at creation time
        origin_left: Option<Id>,
        /// Id of the right neighbour at creation time
        origin_right: Option<Id>,
        /// Item payload
        content: Content,
        /// Whether the item is already tombstoned (snapshots and diffs only)
        deleted: bool,
    },
    /// Tombstone a sequence item
    Delete {
        /// Item to delete
        target: Id,
    },
    /// Write a map register (`None` deletes the key)
    MapSet {
        /// Map key
        key: String,
        /// New value
        value: Option<serde_json::Value>,
    },
}

/// One operation in the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Operation id
    pub id: Id,
    /// Lamport time of the operation
    pub lamport: u64,
    /// Root name of the shared type the record applies to
    pub parent: String,
    /// The operation itself
    pub op: Operation,
}

impl Record {
    /// Ids that must be integrated before this record can be.
    ///
    /// The previous clock of the same replica is not included; contiguity is
    /// checked separately against the state vector.
    pub fn dependencies(&self) -> impl Iterator<Item = Id> + '_ {
        let (first, second) = match &self.op {
            Operation::Insert {
                origin_left,
                origin_right,
                ..
            } => (*origin_left, *origin_right),
            Operation::Delete { target } => (Some(*target), None),
            Operation::MapSet { .. } => (None, None),
        };
        first.into_iter().chain(second)
    }

    fn kind(&self) -> u8 {
        match self.op {
            Operation::Insert { .. } => KIND_INSERT,
            Operation::Delete { .. } => KIND_DELETE,
            Operation::MapSet { .. } => KIND_MAP_SET,
        }
    }

    fn encode(&self, out: &mut Encoder) {
        out.write_u8(self.kind());
        out.write_id(&self.id);
        out.write_var(self.lamport);
        out.write_str(&self.parent);
        match &self.op {
            Operation::Insert {
                origin_left,
                origin_right,
                content,
                deleted,
            } => {
                out.write_opt_id(origin_left.as_ref());
                out.write_opt_id(origin_right.as_ref());
                match content {
                    Content::Char(c) => {
                        out.write_u8(TAG_CHAR);
                        out.write_var(u64::from(*c));
                    }
                    Content::Json(value) => {
                        out.write_u8(TAG_JSON);
                        out.write_bytes(value.to_string().as_bytes());
                    }
                }
                out.write_bool(*deleted);
            }
            Operation::Delete { target } => out.write_id(target),
            Operation::MapSet { key, value } => {
                out.write_str(key);
                match value {
                    Some(value) => {
                        out.write_bool(true);
                        out.write_bytes(value.to_string().as_bytes());
                    }
                    None => out.write_bool(false),
                }
            }
        }
    }

    /// Decode one record body. Bytes left in `input` after the known fields
    /// belong to a newer format and are ignored.
    fn decode(input: &mut Decoder<'_>) -> Result<Self, CodecError> {
        let kind = input.read_u8()?;
        let id = input.read_id()?;
        let lamport = input.read_var()?;
        let parent = input.read_str()?.to_owned();
        let op = match kind {
            KIND_INSERT => {
                let origin_left = input.read_opt_id()?;
                let origin_right = input.read_opt_id()?;
                let content = match input.read_u8()? {
                    TAG_CHAR => {
                        let code = input.read_var()?;
                        let c = u32::try_from(code)
                            .ok()
                            .and_then(char::from_u32)
                            .ok_or(CodecError::InvalidCodePoint(code))?;
                        Content::Char(c)
                    }
                    TAG_JSON => Content::Json(read_json(input)?),
                    other => return Err(CodecError::UnknownContentTag(other)),
                };
                let deleted = input.read_bool()?;
                Operation::Insert {
                    origin_left,
                    origin_right,
                    content,
                    deleted,
                }
            }
            KIND_DELETE => Operation::Delete {
                target: input.read_id()?,
            },
            KIND_MAP_SET => {
                let key = input.read_str()?.to_owned();
                let value = if input.read_bool()? {
                    Some(read_json(input)?)
                } else {
                    None
                };
                Operation::MapSet { key, value }
            }
            other => return Err(CodecError::UnknownKind(other)),
        };
        Ok(Self {
            id,
            lamport,
            parent,
            op,
        })
    }
}

fn read_json(input: &mut Decoder<'_>) -> Result<serde_json::Value, CodecError> {
    let bytes = input.read_bytes()?;
    serde_json::from_slice(bytes).map_err(|e| CodecError::InvalidJson(e.to_string()))
}

/// A self-contained batch of records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Update {
    records: Vec<Record>,
    state_vector: StateVector,
}

impl Update {
    /// Build an update; the covered state vector is derived from the records.
    #[must_use]
    pub fn new(records: Vec<Record>) -> Self {
        let state_vector = records
            .iter()
            .map(|r| (r.id.replica, r.id.clock))
            .collect();
        Self {
            records,
            state_vector,
        }
    }

    /// The records, in log order.
    #[must_use]
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Consume the update and return its records.
    #[must_use]
    pub fn into_records(self) -> Vec<Record> {
        self.records
    }

    /// Highest clock per replica covered by this update.
    #[must_use]
    pub fn state_vector(&self) -> &StateVector {
        &self.state_vector
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the update carries no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Combine several updates into one, dropping duplicate records.
    ///
    /// Records are ordered by replica and clock so the result is the same
    /// whatever order the inputs arrive in.
    #[must_use]
    pub fn merge<I: IntoIterator<Item = Update>>(updates: I) -> Self {
        let mut by_id: BTreeMap<(ReplicaId, u64), Record> = BTreeMap::new();
        for update in updates {
            for record in update.records {
                by_id
                    .entry((record.id.replica, record.id.clock))
                    .or_insert(record);
            }
        }
        Self::new(by_id.into_values().collect())
    }

    /// Encode into the binary wire format.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Encoder::new();
        out.write_u8(FORMAT_VERSION);
        out.write_len(self.records.len());
        for record in &self.records {
            let mut body = Encoder::new();
            record.encode(&mut body);
            out.write_bytes(&body.into_bytes());
        }
        out.write_state_vector(&self.state_vector);
        out.into_bytes()
    }

    /// Decode from the binary wire format.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] if the payload is truncated, oversized, carries
    /// unknown kinds or tags, has trailing bytes, or contains a record whose
    /// clock lies outside the advertised state vector.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut input = Decoder::new(bytes);
        let version = input.read_u8()?;
        if version != FORMAT_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }

        // Smallest record: length byte plus kind, replica and three varints
        let count = input.read_count(21)?;
        let mut records = Vec::with_capacity(count);
        for _ in 0..count {
            let len = input.read_len()?;
            let mut body = input.sub(len)?;
            records.push(Record::decode(&mut body)?);
        }

        let state_vector = input.read_state_vector()?;
        input.finish()?;

        if let Some(outside) = records.iter().find(|r| !state_vector.contains(&r.id)) {
            return Err(CodecError::ClockOutsideStateVector(outside.id));
        }

        Ok(Self {
            records,
            state_vector,
        })
    }

    /// Ids of every record in the update.
    #[must_use]
    pub fn ids(&self) -> HashSet<Id> {
        self.records.iter().map(|r| r.id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn replica(n: u128) -> ReplicaId {
        ReplicaId::from_u128(n)
    }

    fn sample() -> Update {
        let a = replica(1);
        Update::new(vec![
            Record {
                id: Id::new(a, 1),
                lamport: 1,
                parent: "content".into(),
                op: Operation::Insert {
                    origin_left: None,
                    origin_right: None,
                    content: Content::Char('é'),
                    deleted: false,
                },
            },
            Record {
                id: Id::new(a, 2),
                lamport: 2,
                parent: "items".into(),
                op: Operation::Insert {
                    origin_left: None,
                    origin_right: None,
                    content: Content::Json(json!({"n": 1})),
                    deleted: true,
                },
            },
            Record {
                id: Id::new(a, 3),
                lamport: 3,
                parent: "content".into(),
                op: Operation::Delete {
                    target: Id::new(a, 1),
                },
            },
            Record {
                id: Id::new(a, 4),
                lamport: 4,
                parent: "metadata".into(),
                op: Operation::MapSet {
                    key: "title".into(),
                    value: None,
                },
            },
        ])
    }

    #[test]
    fn decode_restores_every_record_kind() {
        let update = sample();
        let decoded = Update::decode(&update.encode()).unwrap();
        assert_eq!(decoded, update);
        assert_eq!(decoded.state_vector().get(&replica(1)), 4);
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let bytes = sample().encode();
        for cut in [1, bytes.len() / 2, bytes.len() - 1] {
            assert!(Update::decode(&bytes[..cut]).is_err(), "cut at {cut}");
        }
    }

    #[test]
    fn trailing_bytes_after_state_vector_are_rejected() {
        let mut bytes = sample().encode();
        bytes.push(7);
        assert_eq!(Update::decode(&bytes), Err(CodecError::TrailingBytes(1)));
    }

    #[test]
    fn unknown_trailing_record_fields_are_skipped() {
        let record = Record {
            id: Id::new(replica(5), 1),
            lamport: 9,
            parent: "metadata".into(),
            op: Operation::MapSet {
                key: "k".into(),
                value: Some(json!(true)),
            },
        };
        let mut body = Encoder::new();
        record.encode(&mut body);
        body.write_raw(&[0xde, 0xad, 0xbe, 0xef]);

        let mut out = Encoder::new();
        out.write_u8(FORMAT_VERSION);
        out.write_len(1);
        out.write_bytes(&body.into_bytes());
        out.write_state_vector(&[(replica(5), 1)].into_iter().collect());

        let decoded = Update::decode(&out.into_bytes()).unwrap();
        assert_eq!(decoded.records(), &[record]);
    }

    #[test]
    fn unknown_kind_and_version_are_rejected() {
        let mut bytes = sample().encode();
        bytes[0] = 9;
        assert_eq!(Update::decode(&bytes), Err(CodecError::UnsupportedVersion(9)));

        let mut body = Encoder::new();
        body.write_u8(42);
        body.write_id(&Id::new(replica(1), 1));
        body.write_var(1);
        body.write_str("x");
        let mut out = Encoder::new();
        out.write_u8(FORMAT_VERSION);
        out.write_len(1);
        out.write_bytes(&body.into_bytes());
        out.write_state_vector(&[(replica(1), 1)].into_iter().collect());
        assert_eq!(
            Update::decode(&out.into_bytes()),
            Err(CodecError::UnknownKind(42))
        );
    }

    #[test]
    fn record_beyond_state_vector_is_rejected() {
        let update = sample();
        let mut out = Encoder::new();
        out.write_u8(FORMAT_VERSION);
        out.write_len(1);
        let mut body = Encoder::new();
        update.records()[3].encode(&mut body);
        out.write_bytes(&body.into_bytes());
        out.write_state_vector(&[(replica(1), 2)].into_iter().collect());

        assert_eq!(
            Update::decode(&out.into_bytes()),
            Err(CodecError::ClockOutsideStateVector(Id::new(replica(1), 4)))
        );
    }

    #[test]
    fn merge_deduplicates() {
        let merged = Update::merge([sample(), sample()]);
        assert_eq!(merged.len(), 4);
    }
}
