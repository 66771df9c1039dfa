//! # coedit protocol
//!
//! Wire envelopes and room naming for document sync sessions.
//!
//! ## Messages
//!
//! Every message travels as a CBOR [`Envelope`] `{room, sender, payload}`:
//! - `SyncStep1`: the sender's state vector; the receiver answers with
//!   `SyncStep2` carrying the records the sender is missing
//! - `SyncUpdate`: the update of one committed transaction
//! - `AwarenessUpdate`: versioned presence states
//! - `JoinNotice` / `LeaveNotice`: room membership
//!
//! ## Rooms
//!
//! A document's room is `doc-{document id}`; the MQTT transport maps rooms to
//! topics `coedit/v1/{tenant}/{room}`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod messages;
pub mod rooms;

pub use messages::{Envelope, MessageError, Payload};
pub use rooms::{doc_id_of, room_for, RoomScheme};
