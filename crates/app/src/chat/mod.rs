/// Typed identifiers for messages and conversations.
pub mod ids;
/// Immutable message values emitted to subscribers.
pub mod message;
/// Inbound send contract and its validation.
pub mod request;

pub use ids::{ConversationId, IdError, MessageId};
pub use message::{Message, MessageStatus, Role};
pub use request::{ModelOptions, RESET_SENTINEL, RequestError, SendRequest};
