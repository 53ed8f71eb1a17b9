pub mod broker;
pub mod calendar;
pub mod chat;
pub mod history;
pub mod orchestrator;
pub mod router;
pub mod script;
pub mod settings;

#[cfg(test)]
mod testing;

pub use broker::{ConversationBroker, Subscription};
pub use orchestrator::{ChatOrchestrator, OrchestratorError};
pub use router::{Tool, ToolRouter};
