//! Interactive session multiplexing over the agent transport
//!
//! Terminal sessions shuttle raw PTY bytes; docker sessions shuttle typed
//! frames for container operations. Both tie an agent-initiated stream to
//! a session the server created on behalf of a UI client.

pub mod docker;
pub mod terminal;

pub use docker::{DockerSession, DockerSessionRequest, DockerSessionState, DockerStreamManager};
pub use terminal::{SessionError, SessionState, TerminalManager, TerminalSession, STREAM_MAGIC};
