//! Relay — TURN allocations for peers that cannot be reached directly
//!
//! - [`stun`]: STUN/TURN message codec
//! - [`StunCodec`]: framing of STUN messages on a TCP stream
//! - [`TurnSession`]: request/response bookkeeping, no I/O
//! - [`RelayTransport`]: the allocation state machine on a background task

mod codec;
mod session;
mod state;
pub mod stun;
mod transport;

pub use codec::{StunCodec, StunFrame};
pub use session::{RequestKind, SessionEvent, TurnSession};
pub use state::RelayState;
pub use transport::{
    PeerConnectionCallback, PeerConnectionMode, ReadyCallback, RelayError, RelayHandlers,
    RelayTransport, RelayTransportParams, StateChangeCallback, MAX_RELAY_PAYLOAD,
};

/// Standard STUN/TURN port
pub const DEFAULT_TURN_PORT: u16 = 3478;
