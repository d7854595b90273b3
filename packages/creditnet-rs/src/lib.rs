//! Shared domain library for the GEO credit network.
//!
//! Everything two or more packages need lives here: identifiers and status
//! enums, fixed-precision amounts, the canonical payload codec, Ed25519
//! signature verification, the closed domain-error taxonomy, signed payload
//! shapes, and the event types emitted by the hub.

pub mod amount;
pub mod canonical;
pub mod error;
pub mod events;
pub mod payloads;
pub mod signing;
pub mod types;

pub use amount::Amount;
pub use error::GeoError;
pub use types::{EquivalentCode, Pid, SegmentRef, TrustPolicy, TxState, TxType};
