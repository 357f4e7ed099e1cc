// Real-time delivery: handshake gate, per-user sessions, the connection
// registry and the producer-facing dispatcher.

pub mod dispatcher;
pub mod gate;
pub mod registry;
pub mod session;

pub use dispatcher::{BroadcastSummary, Delivery, Dispatcher};
pub use gate::{router, RealtimeState};
pub use registry::ConnectionRegistry;
pub use session::{CloseReason, SessionConfig};
