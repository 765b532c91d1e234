pub mod turn;

pub use turn::{ConversationContext, TurnRequest};
