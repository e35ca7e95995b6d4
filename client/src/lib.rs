//! floeterm client-side building blocks: the reorder buffer that restores
//! sequence order over a reorder-possible transport, the coordinator that
//! reconciles the session list, and the replay gate that keeps a replaying
//! emulator's self-query answers away from the PTY. No rendering — these sit
//! between the transport and an xterm-style emulator.

pub mod coordinator;
pub mod replay;
pub mod sequence;
pub mod transport;

pub use coordinator::{SessionMetaPatch, SessionsCoordinator};
pub use replay::ReplayGate;
pub use sequence::{ReorderConfig, SequenceBuffer};
pub use transport::{CreateSessionRequest, HttpTransport, SessionsTransport, TransportError};
