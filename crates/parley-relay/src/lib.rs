//! Audio/control relay for the Parley platform.
//!
//! Bridges one client connection to one upstream realtime-model connection
//! per session, preserving frame order in each direction. Client control
//! frames are rewritten with server-enforced session configuration; upstream
//! function-call frames are intercepted, executed against the retrieval
//! collaborator, and their results injected back into the upstream turn.
//! Every forwarded frame class and every session state transition is recorded
//! on the event bus.
//!
//! Sessions are independent: each runs on its own task with its own
//! [`Orchestrator`], and the only shared resource is the bus.

pub mod orchestrator;
pub mod session;
pub mod wire;

mod error;
mod relay;

pub use error::RelayError;
pub use orchestrator::{default_tool_schemas, Orchestrator, ToolOutcome, ToolResult, ToolTarget};
pub use relay::{ClientMessage, OutboundFrame, Relay, RelayConfig};
pub use session::{SessionHandle, SessionRegistry, SessionState};
pub use wire::SessionOverrides;
