pub mod api;
pub mod bot;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod llm;
pub mod runtime;
pub mod session;
pub mod testing;

pub mod prelude {
    pub use crate::bot::{Bot, BotDirectory, InMemoryBotDirectory};
    pub use crate::checkpoint::{
        Checkpoint, CheckpointPatch, CheckpointSnapshot, CheckpointStore, FileCheckpointStore,
        InMemoryCheckpointStore,
    };
    pub use crate::error::{BotError, ErrorKind, Result};
    pub use crate::runtime::{AgentRuntime, LlmAgentRuntime};
    pub use crate::session::{ResumeFrom, SessionManager, SessionOptions, Turn, UserMessage};
}
