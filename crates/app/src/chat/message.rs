use serde::{Deserialize, Serialize};

use super::ids::{ConversationId, MessageId};

/// Chat speaker role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl From<Role> for deskmate_llm::Role {
    fn from(role: Role) -> Self {
        match role {
            Role::User => deskmate_llm::Role::User,
            Role::Assistant => deskmate_llm::Role::Assistant,
        }
    }
}

/// Where one emitted message sits in its turn's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Placeholder shown while a slow action runs.
    Pending,
    /// Streamed chunk carrying the text accumulated so far.
    Partial,
    Final,
    /// Terminal failure notice; no further events follow for this id.
    Error,
}

impl MessageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Final | Self::Error)
    }
}

/// Core immutable message model.
///
/// Every published event is a fresh value; nothing mutates a message after emission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub text: String,
    pub status: MessageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_message_id: Option<MessageId>,
}

impl Message {
    pub fn new(
        id: MessageId,
        role: Role,
        text: impl Into<String>,
        status: MessageStatus,
    ) -> Self {
        Self {
            id,
            role,
            text: text.into(),
            status,
            conversation_id: None,
            parent_message_id: None,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(MessageId::new_v7(), Role::User, text, MessageStatus::Final)
    }

    pub fn assistant(id: MessageId, text: impl Into<String>, status: MessageStatus) -> Self {
        Self::new(id, Role::Assistant, text, status)
    }

    pub fn in_conversation(mut self, conversation_id: ConversationId) -> Self {
        self.conversation_id = Some(conversation_id);
        self
    }

    pub fn replying_to(mut self, parent_message_id: Option<MessageId>) -> Self {
        self.parent_message_id = parent_message_id;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_camel_case_wire_names() {
        let parent = MessageId::new_v7();
        let message = Message::assistant(MessageId::new_v7(), "hi", MessageStatus::Partial)
            .in_conversation(ConversationId::new("tab-1"))
            .replying_to(Some(parent));

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["role"], "assistant");
        assert_eq!(json["status"], "partial");
        assert_eq!(json["conversationId"], "tab-1");
        assert_eq!(json["parentMessageId"], parent.to_string());
    }

    #[test]
    fn omits_absent_threading_fields() {
        let json = serde_json::to_value(Message::user("hello")).unwrap();
        assert!(json.get("conversationId").is_none());
        assert!(json.get("parentMessageId").is_none());
    }

    #[test]
    fn only_final_and_error_are_terminal() {
        assert!(!MessageStatus::Pending.is_terminal());
        assert!(!MessageStatus::Partial.is_terminal());
        assert!(MessageStatus::Final.is_terminal());
        assert!(MessageStatus::Error.is_terminal());
    }
}
