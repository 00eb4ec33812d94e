//! Talk orchestration: the turn-based service, the streaming orchestrator,
//! and the connection-scoped bookkeeping they share.

pub mod barrier;
pub mod directory;
pub mod history;
pub mod orchestrator;
pub mod pipeline;
pub mod prompt;
pub mod registry;
pub mod sentinel;
pub mod summary;
pub mod talk_service;

pub use orchestrator::{Connection, ConnectionPhase, Orchestrator};
pub use pipeline::Pipeline;
pub use registry::{SessionRegistry, StreamHandle, StreamKind};
pub use talk_service::{TalkService, TalkTurn};
