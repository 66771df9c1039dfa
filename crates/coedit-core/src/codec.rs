//! Low-level binary encoding primitives.
//!
//! Integers are unsigned LEB128 varints; strings and byte blobs are length
//! prefixed; replica ids are their 16 raw bytes. Every read is bounds-checked
//! and reports a [`CodecError`] instead of panicking.

use crate::clock::{Id, ReplicaId};
use crate::state_vector::StateVector;

/// Maximum encoded size of a u64 varint.
const MAX_VARINT_LEN: usize = 10;

/// Errors raised while decoding an update, snapshot or state vector.
///
/// Any of these means the payload is a `MalformedUpdate`: it is dropped,
/// logged, and a full resync is requested.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// Payload ended before a field was complete
    #[error("unexpected end of input: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEof {
        /// Bytes required by the field
        needed: usize,
        /// Bytes left in the payload
        remaining: usize,
    },
    /// A varint ran past 64 bits
    #[error("varint overflows u64")]
    VarintOverflow,
    /// An advertised length does not fit the payload
    #[error("advertised length {advertised} exceeds remaining {remaining} bytes")]
    LengthOverflow {
        /// Length declared in the stream
        advertised: u64,
        /// Bytes actually left
        remaining: usize,
    },
    /// A string field is not UTF-8
    #[error("invalid UTF-8 in string field")]
    InvalidUtf8,
    /// A character content field is not a Unicode scalar value
    #[error("invalid code point {0:#x}")]
    InvalidCodePoint(u64),
    /// A JSON content field does not parse
    #[error("invalid JSON content: {0}")]
    InvalidJson(String),
    /// Unknown record kind byte
    #[error("unknown record kind {0}")]
    UnknownKind(u8),
    /// Unknown content tag byte
    #[error("unknown content tag {0}")]
    UnknownContentTag(u8),
    /// Unknown boolean/flag byte
    #[error("invalid flag byte {0}")]
    InvalidFlag(u8),
    /// Unsupported format version
    #[error("unsupported format version {0}")]
    UnsupportedVersion(u8),
    /// Bytes left after the last field
    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),
    /// A record's clock lies beyond the advertised state vector
    #[error("record {0} is outside the advertised state vector")]
    ClockOutsideStateVector(Id),
}

/// Append-only byte writer.
#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    /// Create an empty encoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a single byte.
    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    /// Write an unsigned LEB128 varint.
    pub fn write_var(&mut self, mut value: u64) {
        loop {
            // Truncation is intended: only the low 7 bits are kept
            #[allow(clippy::cast_possible_truncation)]
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                self.buf.push(byte);
                return;
            }
            self.buf.push(byte | 0x80);
        }
    }

    /// Write a length as a varint.
    pub fn write_len(&mut self, len: usize) {
        self.write_var(len as u64);
    }

    /// Write a length-prefixed byte blob.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.write_len(bytes.len());
        self.buf.extend_from_slice(bytes);
    }

    /// Write a length-prefixed UTF-8 string.
    pub fn write_str(&mut self, value: &str) {
        self.write_bytes(value.as_bytes());
    }

    /// Write a boolean as a flag byte.
    pub fn write_bool(&mut self, value: bool) {
        self.write_u8(u8::from(value));
    }

    /// Write a replica id (16 raw bytes).
    pub fn write_replica(&mut self, replica: &ReplicaId) {
        self.buf.extend_from_slice(replica.as_bytes());
    }

    /// Write an operation id.
    pub fn write_id(&mut self, id: &Id) {
        self.write_replica(&id.replica);
        self.write_var(id.clock);
    }

    /// Write an optional operation id (flag byte, then the id).
    pub fn write_opt_id(&mut self, id: Option<&Id>) {
        match id {
            Some(id) => {
                self.write_bool(true);
                self.write_id(id);
            }
            None => self.write_bool(false),
        }
    }

    /// Write a state vector (entry count, then `replica, clock` pairs).
    pub fn write_state_vector(&mut self, sv: &StateVector) {
        self.write_len(sv.len());
        for (replica, clock) in sv.iter() {
            self.write_replica(replica);
            self.write_var(*clock);
        }
    }

    /// Append raw bytes without a length prefix.
    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Finish and return the encoded bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Bounds-checked byte reader over a borrowed buffer.
#[derive(Debug)]
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    /// Start reading at the beginning of `buf`.
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes not yet consumed.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, needed: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < needed {
            return Err(CodecError::UnexpectedEof {
                needed,
                remaining: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + needed];
        self.pos += needed;
        Ok(slice)
    }

    /// Read one byte.
    ///
    /// # Errors
    ///
    /// Returns error if the input is exhausted.
    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    /// Read an unsigned LEB128 varint.
    ///
    /// # Errors
    ///
    /// Returns error on truncated input or more than 64 significant bits.
    pub fn read_var(&mut self) -> Result<u64, CodecError> {
        let mut value: u64 = 0;
        for i in 0..MAX_VARINT_LEN {
            let byte = self.read_u8()?;
            let bits = u64::from(byte & 0x7f);
            let shift = 7 * i;
            if shift == 63 && bits > 1 {
                return Err(CodecError::VarintOverflow);
            }
            value |= bits << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(CodecError::VarintOverflow)
    }

    /// Read a length and check it fits in the remaining payload.
    ///
    /// # Errors
    ///
    /// Returns error if the advertised length exceeds the remaining bytes.
    pub fn read_len(&mut self) -> Result<usize, CodecError> {
        let advertised = self.read_var()?;
        match usize::try_from(advertised) {
            Ok(len) if len <= self.remaining() => Ok(len),
            _ => Err(CodecError::LengthOverflow {
                advertised,
                remaining: self.remaining(),
            }),
        }
    }

    /// Read a count of elements that each occupy at least `min_size` bytes.
    ///
    /// # Errors
    ///
    /// Returns error if the count cannot possibly fit the remaining payload.
    pub fn read_count(&mut self, min_size: usize) -> Result<usize, CodecError> {
        let advertised = self.read_var()?;
        let max = self.remaining() / min_size.max(1);
        match usize::try_from(advertised) {
            Ok(count) if count <= max => Ok(count),
            _ => Err(CodecError::LengthOverflow {
                advertised,
                remaining: self.remaining(),
            }),
        }
    }

    /// Read a length-prefixed byte blob.
    ///
    /// # Errors
    ///
    /// Returns error if the blob is truncated.
    pub fn read_bytes(&mut self) -> Result<&'a [u8], CodecError> {
        let len = self.read_len()?;
        self.take(len)
    }

    /// Read a length-prefixed UTF-8 string.
    ///
    /// # Errors
    ///
    /// Returns error if truncated or not valid UTF-8.
    pub fn read_str(&mut self) -> Result<&'a str, CodecError> {
        let bytes = self.read_bytes()?;
        std::str::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)
    }

    /// Read a flag byte (0 or 1).
    ///
    /// # Errors
    ///
    /// Returns error on any other byte value.
    pub fn read_bool(&mut self) -> Result<bool, CodecError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(CodecError::InvalidFlag(other)),
        }
    }

    /// Read a replica id.
    ///
    /// # Errors
    ///
    /// Returns error if fewer than 16 bytes remain.
    pub fn read_replica(&mut self) -> Result<ReplicaId, CodecError> {
        let bytes = self.take(16)?;
        let mut raw = [0u8; 16];
        raw.copy_from_slice(bytes);
        Ok(ReplicaId::from_bytes(raw))
    }

    /// Read an operation id.
    ///
    /// # Errors
    ///
    /// Returns error if truncated.
    pub fn read_id(&mut self) -> Result<Id, CodecError> {
        let replica = self.read_replica()?;
        let clock = self.read_var()?;
        Ok(Id::new(replica, clock))
    }

    /// Read an optional operation id.
    ///
    /// # Errors
    ///
    /// Returns error if truncated or the flag byte is invalid.
    pub fn read_opt_id(&mut self) -> Result<Option<Id>, CodecError> {
        if self.read_bool()? {
            Ok(Some(self.read_id()?))
        } else {
            Ok(None)
        }
    }

    /// Read a state vector.
    ///
    /// # Errors
    ///
    /// Returns error if truncated.
    pub fn read_state_vector(&mut self) -> Result<StateVector, CodecError> {
        // 16-byte replica id + at least one varint byte per entry
        let count = self.read_count(17)?;
        let mut sv = StateVector::new();
        for _ in 0..count {
            let replica = self.read_replica()?;
            let clock = self.read_var()?;
            sv.observe(replica, clock);
        }
        Ok(sv)
    }

    /// Split off the next `len` bytes as an independent decoder.
    ///
    /// # Errors
    ///
    /// Returns error if fewer than `len` bytes remain.
    pub fn sub(&mut self, len: usize) -> Result<Decoder<'a>, CodecError> {
        Ok(Decoder::new(self.take(len)?))
    }

    /// Require that the whole input has been consumed.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::TrailingBytes`] otherwise.
    pub fn finish(&self) -> Result<(), CodecError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(CodecError::TrailingBytes(n)),
        }
    }
}

/// Encode a state vector on its own (sync step 1 payload).
#[must_use]
pub fn encode_state_vector(sv: &StateVector) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_state_vector(sv);
    encoder.into_bytes()
}

/// Decode a standalone state vector.
///
/// # Errors
///
/// Returns error if the payload is truncated or has trailing bytes.
pub fn decode_state_vector(bytes: &[u8]) -> Result<StateVector, CodecError> {
    let mut decoder = Decoder::new(bytes);
    let sv = decoder.read_state_vector()?;
    decoder.finish()?;
    Ok(sv)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_boundaries() {
        for value in [0, 1, 127, 128, 300, u64::from(u32::MAX), u64::MAX] {
            let mut encoder = Encoder::new();
            encoder.write_var(value);
            let bytes = encoder.into_bytes();
            let mut decoder = Decoder::new(&bytes);
            assert_eq!(decoder.read_var().unwrap(), value);
            decoder.finish().unwrap();
        }
    }

    #[test]
    fn varint_overflow_rejected() {
        let bytes = [0xff; 11];
        let mut decoder = Decoder::new(&bytes);
        assert_eq!(decoder.read_var(), Err(CodecError::VarintOverflow));
    }

    #[test]
    fn length_larger_than_payload_rejected() {
        let mut encoder = Encoder::new();
        encoder.write_var(50);
        encoder.write_raw(b"short");
        let bytes = encoder.into_bytes();

        let mut decoder = Decoder::new(&bytes);
        assert!(matches!(
            decoder.read_bytes(),
            Err(CodecError::LengthOverflow { advertised: 50, remaining: 5 })
        ));
    }

    #[test]
    fn state_vector_standalone() {
        let sv: StateVector = [(ReplicaId::from_u128(9), 12), (ReplicaId::from_u128(3), 1)]
            .into_iter()
            .collect();
        let bytes = encode_state_vector(&sv);
        assert_eq!(decode_state_vector(&bytes).unwrap(), sv);

        let mut padded = bytes.clone();
        padded.push(0);
        assert_eq!(
            decode_state_vector(&padded),
            Err(CodecError::TrailingBytes(1))
        );
    }
}
