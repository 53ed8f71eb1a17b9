use std::fmt;
use std::time::Duration;

use deskmate_llm::{CompletionRequest, LlmProvider, complete};
use serde::{Deserialize, Serialize};

use crate::script::duration_millis;

pub const DEFAULT_CLASSIFY_TIMEOUT: Duration = Duration::from_secs(10);
const CLASSIFY_MAX_TOKENS: u64 = 20;

/// Which backend handles a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tool {
    Chat,
    Calendar,
}

impl Tool {
    /// Maps the classifier's closed vocabulary onto tools.
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim() {
            "Calendar" => Some(Self::Calendar),
            "ChatGPT" => Some(Self::Chat),
            _ => None,
        }
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Chat => formatter.write_str("chat"),
            Self::Calendar => formatter.write_str("calendar"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingStrategy {
    /// Always route to one tool without consulting a model.
    Fixed,
    /// Ask the generation backend to pick between "Calendar" and "ChatGPT".
    Model,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolRouter {
    strategy: RoutingStrategy,
    fixed_tool: Tool,
    timeout: Duration,
}

impl ToolRouter {
    pub fn fixed(tool: Tool) -> Self {
        Self {
            strategy: RoutingStrategy::Fixed,
            fixed_tool: tool,
            timeout: DEFAULT_CLASSIFY_TIMEOUT,
        }
    }

    pub fn model_backed(timeout: Duration) -> Self {
        Self {
            strategy: RoutingStrategy::Model,
            fixed_tool: Tool::Chat,
            timeout,
        }
    }

    pub fn strategy(&self) -> RoutingStrategy {
        self.strategy
    }

    /// Picks a tool for `message`. Never fails: any classifier problem routes to [`Tool::Chat`].
    pub async fn classify(&self, backend: &dyn LlmProvider, model_id: &str, message: &str) -> Tool {
        match self.strategy {
            RoutingStrategy::Fixed => self.fixed_tool,
            RoutingStrategy::Model => self.classify_with_model(backend, model_id, message).await,
        }
    }

    async fn classify_with_model(
        &self,
        backend: &dyn LlmProvider,
        model_id: &str,
        message: &str,
    ) -> Tool {
        let request = CompletionRequest::from_prompt(model_id, render_router_prompt(message))
            .with_temperature(0.0)
            .with_max_tokens(CLASSIFY_MAX_TOKENS)
            .with_stop_sequence("\n");

        let label = match tokio::time::timeout(self.timeout, complete(backend, request)).await {
            Ok(Ok(label)) => label,
            Ok(Err(error)) => {
                tracing::warn!(error = %error, "tool classification failed; routing to chat");
                return Tool::Chat;
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = duration_millis(self.timeout),
                    "tool classification timed out; routing to chat"
                );
                return Tool::Chat;
            }
        };

        match Tool::from_label(&label) {
            Some(tool) => {
                tracing::debug!(tool = %tool, "message classified");
                tool
            }
            None => {
                tracing::warn!(label = %label, "classifier answered outside its vocabulary; routing to chat");
                Tool::Chat
            }
        }
    }
}

impl Default for ToolRouter {
    fn default() -> Self {
        Self::model_backed(DEFAULT_CLASSIFY_TIMEOUT)
    }
}

fn render_router_prompt(message: &str) -> String {
    format!(
        "Decide what tools to use to respond to a user message. Possible tools:
- Calendar
- ChatGPT

Example 1:
Message: open image in pil
Tool: ChatGPT

Example 2:
Message: schedule lunch tomorrow noon
Tool: Calendar

Example 3:
Message: {message}
Tool: ",
        message = message.trim()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedProvider;

    fn router() -> ToolRouter {
        ToolRouter::model_backed(Duration::from_millis(100))
    }

    #[tokio::test]
    async fn maps_calendar_label() {
        let provider = ScriptedProvider::with_texts(&["Calendar"]);
        let tool = router()
            .classify(&provider, "m", "schedule coffee chat tomorrow at noon")
            .await;
        assert_eq!(tool, Tool::Calendar);

        let request = provider.requests().remove(0);
        assert_eq!(request.temperature, Some(0.0));
        assert_eq!(request.max_tokens, Some(CLASSIFY_MAX_TOKENS));
        assert!(request.messages[0]
            .content
            .ends_with("Message: schedule coffee chat tomorrow at noon\nTool: "));
    }

    #[tokio::test]
    async fn maps_chatgpt_label_with_surrounding_whitespace() {
        let provider = ScriptedProvider::with_texts(&[" ChatGPT \n"]);
        assert_eq!(router().classify(&provider, "m", "explain lifetimes").await, Tool::Chat);
    }

    #[tokio::test]
    async fn out_of_vocabulary_answer_routes_to_chat() {
        let provider = ScriptedProvider::with_texts(&["Email"]);
        assert_eq!(router().classify(&provider, "m", "mail bob").await, Tool::Chat);
    }

    #[tokio::test]
    async fn backend_error_routes_to_chat() {
        let provider = ScriptedProvider::with_failure("503 service unavailable");
        assert_eq!(router().classify(&provider, "m", "book a room").await, Tool::Chat);
    }

    #[tokio::test]
    async fn backend_timeout_routes_to_chat() {
        let provider = ScriptedProvider::new();
        provider.push_hang();
        let tool = router()
            .classify(&provider, "m", "schedule lunch tomorrow")
            .await;
        assert_eq!(tool, Tool::Chat);
    }

    #[tokio::test]
    async fn fixed_strategy_never_calls_the_backend() {
        let provider = ScriptedProvider::new();
        let tool = ToolRouter::fixed(Tool::Calendar)
            .classify(&provider, "m", "anything")
            .await;
        assert_eq!(tool, Tool::Calendar);
        assert!(provider.requests().is_empty());
    }

    #[test]
    fn labels_are_case_sensitive() {
        assert_eq!(Tool::from_label("calendar"), None);
        assert_eq!(Tool::from_label("Calendar"), Some(Tool::Calendar));
    }
}
