//! Parley Core - Dialogue turn orchestration
//!
//! Ties the boundary contracts from parley-traits together for one
//! conversational exchange:
//! - [`validator`] checks and normalizes the terminal payload
//! - [`orchestrator`] drives the turn state machine and the in-flight guard
//! - [`storage`] adapts the redb partitions to the async `MemoryStore`
//! - [`sink`] delivers frames over a bounded channel

pub mod models;
pub mod orchestrator;
pub mod sink;
pub mod storage;
pub mod testkit;
pub mod validator;

pub use models::{ConversationContext, TurnRequest};
pub use orchestrator::{
    InFlightRegistry, MEMORY_RETRIEVAL_LIMIT, TurnError, TurnOrchestrator, TurnOutcome, TurnPolicy,
    TurnState,
};
pub use sink::{ChannelSink, TurnFrame};
pub use storage::RedbMemoryStore;
pub use validator::{ResponseValidator, SchemaError};
