pub mod manager;
pub mod token_counter;

pub use manager::{ContextWindowManager, WindowSelection, SUMMARY_INSTRUCTION};
pub use token_counter::{
    create_counter, estimate_message_tokens, estimate_tokens, HeuristicCounter, TextKind,
    TokenCounter,
};
