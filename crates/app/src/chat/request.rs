use serde::{Deserialize, Serialize};
use snafu::{Snafu, ensure};

use super::ids::{ConversationId, MessageId};

/// Client-local "clear the tab" command; never a valid turn.
pub const RESET_SENTINEL: &str = "RESET";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum RequestError {
    #[snafu(display("message text is empty"))]
    EmptyText { stage: &'static str },
    #[snafu(display("reset command must be handled by the client"))]
    ResetSentinel { stage: &'static str },
    #[snafu(display("conversation id is empty"))]
    EmptyConversationId { stage: &'static str },
}

/// Per-request overrides of the process-wide provider settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelOptions {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
}

impl ModelOptions {
    /// True when the overrides need a dedicated provider client rather than the shared one.
    pub fn overrides_connection(&self) -> bool {
        let set = |value: &Option<String>| value.as_deref().is_some_and(|v| !v.trim().is_empty());
        set(&self.api_key) || set(&self.endpoint)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    pub conversation_id: ConversationId,
    pub text: String,
    #[serde(default)]
    pub parent_message_id: Option<MessageId>,
    #[serde(default)]
    pub model_options: Option<ModelOptions>,
}

impl SendRequest {
    pub fn new(conversation_id: impl Into<ConversationId>, text: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            text: text.into(),
            parent_message_id: None,
            model_options: None,
        }
    }

    pub fn with_parent(mut self, parent_message_id: MessageId) -> Self {
        self.parent_message_id = Some(parent_message_id);
        self
    }

    pub fn with_model_options(mut self, options: ModelOptions) -> Self {
        self.model_options = Some(options);
        self
    }

    pub fn validate(&self) -> Result<(), RequestError> {
        ensure!(
            !self.conversation_id.as_str().trim().is_empty(),
            EmptyConversationIdSnafu {
                stage: "validate-conversation-id",
            }
        );
        let text = self.text.trim();
        ensure!(
            !text.is_empty(),
            EmptyTextSnafu {
                stage: "validate-text",
            }
        );
        ensure!(
            text != RESET_SENTINEL,
            ResetSentinelSnafu {
                stage: "validate-reset-sentinel",
            }
        );
        Ok(())
    }
}
