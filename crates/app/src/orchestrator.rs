use std::sync::Arc;

use deskmate_llm::{
    CompletionRequest, DEFAULT_OPENAI_MODEL, LlmProvider, ProviderConfig, ProviderError,
    ProviderMessage, ProviderResult, ProviderStreamHandle, Role as ProviderRole, StreamEvent,
    complete, create_provider,
};
use snafu::{ResultExt, Snafu};

use crate::broker::{ConversationBroker, Subscription};
use crate::calendar::{CalendarAction, ClockSnapshot};
use crate::chat::{
    ConversationId, Message, MessageId, MessageStatus, ModelOptions, RequestError, SendRequest,
};
use crate::history::{ConversationLog, DEFAULT_CONTEXT_DEPTH};
use crate::router::{Tool, ToolRouter};
use crate::settings::Settings;

pub const WORKING_PLACEHOLDER: &str = "Working on it...";
pub const EMPTY_CALENDAR_REPLY: &str = "I tried to update your calendar, but I couldn't put together a reply.";
pub const INTERNAL_ERROR_TEXT: &str = "Something went wrong while handling that message.";
const TITLE_MAX_TOKENS: u64 = 20;
const TITLE_MAX_WORDS: usize = 6;
const TITLE_MAX_CHARS: usize = 48;
const TITLE_CONTEXT_CHARS: usize = 2_000;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum OrchestratorError {
    #[snafu(display("invalid request on `{stage}`: {source}"))]
    InvalidRequest {
        stage: &'static str,
        source: RequestError,
    },
    /// The cause is logged, not returned.
    #[snafu(display("internal error"))]
    Internal { stage: &'static str },
}

/// Ids and threading for one user turn.
struct Turn {
    conversation_id: ConversationId,
    user_message: Message,
    assistant_id: MessageId,
}

impl Turn {
    fn begin(request: &SendRequest) -> Self {
        let user_message = Message::user(request.text.trim())
            .in_conversation(request.conversation_id.clone())
            .replying_to(request.parent_message_id);
        Self {
            conversation_id: request.conversation_id.clone(),
            user_message,
            assistant_id: MessageId::new_v7(),
        }
    }

    fn assistant(&self, text: impl Into<String>, status: MessageStatus) -> Message {
        Message::assistant(self.assistant_id, text, status)
            .in_conversation(self.conversation_id.clone())
            .replying_to(Some(self.user_message.id))
    }
}

/// Routes each message to chat or calendar and relays every result through the broker.
pub struct ChatOrchestrator {
    broker: ConversationBroker,
    backend: Arc<dyn LlmProvider>,
    base_config: Option<ProviderConfig>,
    router: ToolRouter,
    calendar: CalendarAction,
    log: ConversationLog,
    chat_model: String,
    completion_model: String,
    system_message: String,
}

impl ChatOrchestrator {
    pub fn new(
        broker: ConversationBroker,
        backend: Arc<dyn LlmProvider>,
        router: ToolRouter,
        calendar: CalendarAction,
    ) -> Self {
        let default_model = backend.default_model().to_string();
        Self {
            broker,
            backend,
            base_config: None,
            router,
            calendar,
            log: ConversationLog::default(),
            chat_model: default_model.clone(),
            completion_model: default_model,
            system_message: String::new(),
        }
    }

    /// Wires the orchestrator from loaded settings; the script runner comes from `settings.script`.
    pub fn from_settings(
        settings: &Settings,
        broker: ConversationBroker,
        backend: Arc<dyn LlmProvider>,
    ) -> Self {
        let calendar = CalendarAction::new(
            Arc::new(settings.script.script_runner()),
            settings.calendar.contacts.clone(),
        )
        .with_max_tokens(settings.calendar.max_tokens);

        let mut orchestrator = Self::new(broker, backend, settings.router.tool_router(), calendar)
            .with_models(
                settings.provider.chat_model.clone(),
                settings.provider.completion_model.clone(),
            )
            .with_system_message(settings.provider.system_message.clone());
        orchestrator.base_config = settings.provider.to_provider_config();
        orchestrator
    }

    pub fn with_models(mut self, chat_model: impl Into<String>, completion_model: impl Into<String>) -> Self {
        self.chat_model = chat_model.into();
        self.completion_model = completion_model.into();
        self
    }

    pub fn with_system_message(mut self, system_message: impl Into<String>) -> Self {
        self.system_message = system_message.into();
        self
    }

    pub fn subscribe_progress(&self, conversation_id: ConversationId) -> Subscription {
        self.broker.subscribe(conversation_id)
    }

    /// Handles one user message end to end and resolves with the terminal assistant message.
    ///
    /// Every event is also published under the request's conversation id. On failure a single
    /// `Error` message is published and the caller receives [`OrchestratorError::Internal`].
    pub async fn send_message(&self, request: SendRequest) -> Result<Message, OrchestratorError> {
        request.validate().context(InvalidRequestSnafu {
            stage: "validate-send-request",
        })?;

        let turn = Turn::begin(&request);
        self.log.record(turn.user_message.clone()).await;

        match self.dispatch(&turn, &request).await {
            Ok(message) => {
                self.log.record(message.clone()).await;
                Ok(message)
            }
            Err(error) => {
                tracing::error!(
                    conversation_id = %turn.conversation_id,
                    message_id = %turn.assistant_id,
                    error = %error,
                    "turn failed"
                );
                self.publish(&turn, &turn.assistant(INTERNAL_ERROR_TEXT, MessageStatus::Error));
                InternalSnafu {
                    stage: "dispatch-turn",
                }
                .fail()
            }
        }
    }

    async fn dispatch(&self, turn: &Turn, request: &SendRequest) -> ProviderResult<Message> {
        let options = request.model_options.as_ref();
        let backend = self.backend_for(options)?;

        let tool = self
            .router
            .classify(backend.as_ref(), &self.completion_model, &turn.user_message.text)
            .await;
        tracing::info!(
            conversation_id = %turn.conversation_id,
            tool = %tool,
            "routing message"
        );

        match tool {
            Tool::Chat => self.run_chat(backend.as_ref(), turn, options).await,
            Tool::Calendar => self.run_calendar(backend.as_ref(), turn).await,
        }
    }

    async fn run_chat(
        &self,
        backend: &dyn LlmProvider,
        turn: &Turn,
        options: Option<&ModelOptions>,
    ) -> ProviderResult<Message> {
        let model = options
            .and_then(|options| options.model.as_deref())
            .map(str::trim)
            .filter(|model| !model.is_empty())
            .unwrap_or(self.chat_model.as_str());

        let mut completion = CompletionRequest::new(model, self.context_messages(turn).await);
        if !self.system_message.is_empty() {
            completion = completion.with_preamble(self.system_message.clone());
        }
        if let Some(temperature) = options.and_then(|options| options.temperature) {
            completion = completion.with_temperature(temperature);
        }
        if let Some(max_tokens) = options.and_then(|options| options.max_tokens) {
            completion = completion.with_max_tokens(max_tokens);
        }

        let ProviderStreamHandle { mut stream, worker } = backend.stream_completion(completion)?;
        tokio::spawn(worker);

        let mut text = String::new();
        while let Some(event) = stream.recv().await {
            match event {
                StreamEvent::Delta(delta) => {
                    if delta.is_empty() {
                        continue;
                    }
                    text.push_str(&delta);
                    self.publish(turn, &turn.assistant(text.clone(), MessageStatus::Partial));
                }
                StreamEvent::ReasoningDelta(_) => {}
                StreamEvent::Done => {
                    let message = turn.assistant(text, MessageStatus::Final);
                    self.publish(turn, &message);
                    return Ok(message);
                }
                StreamEvent::Error(message) => {
                    return Err(ProviderError::StreamFailed {
                        stage: "chat-stream-event",
                        message,
                    });
                }
            }
        }

        Err(ProviderError::StreamClosed {
            stage: "chat-stream-closed",
        })
    }

    async fn run_calendar(&self, backend: &dyn LlmProvider, turn: &Turn) -> ProviderResult<Message> {
        self.publish(turn, &turn.assistant(WORKING_PLACEHOLDER, MessageStatus::Pending));

        let outcome = self
            .calendar
            .run(
                backend,
                &self.completion_model,
                &turn.user_message.text,
                &ClockSnapshot::now(),
            )
            .await?;

        let reply = if outcome.reply.trim().is_empty() {
            EMPTY_CALENDAR_REPLY.to_string()
        } else {
            outcome.reply
        };
        let message = turn.assistant(reply, MessageStatus::Final);
        self.publish(turn, &message);
        Ok(message)
    }

    /// Prior turns along the parent chain, then the new user message.
    async fn context_messages(&self, turn: &Turn) -> Vec<ProviderMessage> {
        let mut messages = match turn.user_message.parent_message_id {
            Some(parent) => self
                .log
                .ancestry(parent, DEFAULT_CONTEXT_DEPTH)
                .await
                .into_iter()
                .map(|message| ProviderMessage::new(message.role.into(), message.text))
                .collect(),
            None => Vec::new(),
        };
        messages.push(ProviderMessage::new(
            ProviderRole::User,
            turn.user_message.text.clone(),
        ));
        messages
    }

    fn backend_for(&self, options: Option<&ModelOptions>) -> ProviderResult<Arc<dyn LlmProvider>> {
        let Some(options) = options.filter(|options| options.overrides_connection()) else {
            return Ok(self.backend.clone());
        };

        let base = self.base_config.clone().unwrap_or_else(|| {
            ProviderConfig::new(self.backend.id(), "", "", Some(DEFAULT_OPENAI_MODEL.to_string()))
        });
        let pick = |value: &Option<String>, fallback: String| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
                .unwrap_or(fallback)
        };

        let config = ProviderConfig::new(
            base.provider_id,
            pick(&options.api_key, base.api_key),
            pick(&options.endpoint, base.endpoint),
            base.default_model,
        );
        tracing::debug!(provider_id = %config.provider_id, "building per-request provider");
        create_provider(config)
    }

    fn publish(&self, turn: &Turn, message: &Message) {
        self.broker.publish(&turn.conversation_id, message.clone());
    }

    /// Short title for a finished exchange, used for tab labels.
    ///
    /// Falls back to the first words of the user's text when generation fails.
    pub async fn summarize(&self, user_text: &str, assistant_text: &str) -> String {
        let assistant_excerpt = assistant_text
            .chars()
            .take(TITLE_CONTEXT_CHARS)
            .collect::<String>();
        let prompt = format!(
            "Write a short title of at most {TITLE_MAX_WORDS} words for this exchange. Reply with the title only.\n\nUser: {user}\nAssistant: {assistant_excerpt}\n\nTitle:",
            user = user_text.trim(),
        );
        let request = CompletionRequest::from_prompt(&self.completion_model, prompt)
            .with_temperature(0.0)
            .with_max_tokens(TITLE_MAX_TOKENS)
            .with_stop_sequence("\n");

        match complete(self.backend.as_ref(), request).await {
            Ok(title) => {
                let title = clean_title(&title);
                if title.is_empty() {
                    fallback_title(user_text)
                } else {
                    title
                }
            }
            Err(error) => {
                tracing::warn!(error = %error, "title generation failed; using message prefix");
                fallback_title(user_text)
            }
        }
    }
}

fn clean_title(raw: &str) -> String {
    raw.trim()
        .trim_matches(|ch: char| matches!(ch, '"' | '\'' | '`' | '*'))
        .trim_end_matches('.')
        .trim()
        .to_string()
}

fn fallback_title(user_text: &str) -> String {
    let words = user_text
        .split_whitespace()
        .take(TITLE_MAX_WORDS)
        .collect::<Vec<_>>()
        .join(" ");
    words.chars().take(TITLE_MAX_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::StreamExt;

    use super::*;
    use crate::calendar::{REPLY_SENTINEL, default_contacts};
    use crate::testing::{RecordingExecutor, ScriptedProvider};

    const CALENDAR_SCRIPT: &str = "\nlet Calendar = Application(\"Calendar\")\nlet event = Calendar.Event({summary: \"Coffee chat\", startDate: eventStart, endDate: eventEnd})\nprojectCalendar.events.push(event)\nCalendar.reloadCalendars()\n\nsendReply(\"Ok! I scheduled a coffee chat for tomorrow at noon.\")\n";

    struct Harness {
        orchestrator: ChatOrchestrator,
        broker: ConversationBroker,
        provider: Arc<ScriptedProvider>,
        executor: Arc<RecordingExecutor>,
    }

    fn harness(executor: RecordingExecutor) -> Harness {
        let broker = ConversationBroker::spawn();
        let provider = Arc::new(ScriptedProvider::new());
        let executor = Arc::new(executor);
        let orchestrator = ChatOrchestrator::new(
            broker.clone(),
            provider.clone(),
            ToolRouter::model_backed(Duration::from_millis(100)),
            CalendarAction::new(executor.clone(), default_contacts()),
        )
        .with_models("chat-model", "completion-model")
        .with_system_message("be brief");

        Harness {
            orchestrator,
            broker,
            provider,
            executor,
        }
    }

    /// Publishes a marker and returns everything received before it.
    async fn drain(broker: &ConversationBroker, subscription: &mut Subscription) -> Vec<Message> {
        let conversation = subscription.conversation_id().clone();
        let marker = Message::user("--marker--").in_conversation(conversation.clone());
        broker.publish(&conversation, marker.clone());

        let mut received = Vec::new();
        while let Some(message) = subscription.next().await {
            if message.id == marker.id {
                break;
            }
            received.push(message);
        }
        received
    }

    #[tokio::test]
    async fn chat_chunks_are_published_in_order_and_final_shares_their_id() {
        let h = harness(RecordingExecutor::succeeding(""));
        h.provider.push_text("ChatGPT").push_chunks(&["Hel", "lo", ", world"]);
        let mut subscription = h.orchestrator.subscribe_progress(ConversationId::new("tab-1"));

        let reply = h
            .orchestrator
            .send_message(SendRequest::new("tab-1", "say hello"))
            .await
            .unwrap();

        let events = drain(&h.broker, &mut subscription).await;
        let texts = events.iter().map(|m| m.text.as_str()).collect::<Vec<_>>();
        assert_eq!(texts, ["Hel", "Hello", "Hello, world", "Hello, world"]);
        assert!(events[..3].iter().all(|m| m.status == MessageStatus::Partial));
        assert_eq!(events[3].status, MessageStatus::Final);
        assert!(events.iter().all(|m| m.id == reply.id));
        assert!(events
            .iter()
            .all(|m| m.conversation_id == Some(ConversationId::new("tab-1"))));
        assert_eq!(reply.text, "Hello, world");

        let chat_request = h.provider.requests().remove(1);
        assert_eq!(chat_request.model_id, "chat-model");
        assert_eq!(chat_request.preamble.as_deref(), Some("be brief"));
    }

    #[tokio::test]
    async fn calendar_turn_publishes_placeholder_then_final() {
        let h = harness(RecordingExecutor::succeeding(""));
        h.provider.push_text("Calendar").push_text(CALENDAR_SCRIPT);
        let mut subscription = h.orchestrator.subscribe_progress(ConversationId::new("tab-2"));

        let reply = h
            .orchestrator
            .send_message(SendRequest::new("tab-2", "schedule coffee chat tomorrow at noon"))
            .await
            .unwrap();

        let events = drain(&h.broker, &mut subscription).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].status, MessageStatus::Pending);
        assert_eq!(events[0].text, WORKING_PLACEHOLDER);
        assert_eq!(events[1], reply);
        assert_eq!(reply.status, MessageStatus::Final);
        assert!(!reply.text.is_empty());
        assert!(!reply.text.contains(REPLY_SENTINEL));

        let scripts = h.executor.scripts();
        assert_eq!(scripts.len(), 1);
        assert!(scripts[0].contains("Calendar.Event("));

        let calendar_request = h.provider.requests().remove(1);
        assert_eq!(calendar_request.model_id, "completion-model");
        assert_eq!(calendar_request.stop_sequences, vec!["```".to_string()]);
    }

    #[tokio::test]
    async fn calendar_reply_survives_script_failure() {
        let h = harness(RecordingExecutor::failing("Error: Can't get calendar"));
        h.provider.push_text("Calendar").push_text(CALENDAR_SCRIPT);

        let reply = h
            .orchestrator
            .send_message(SendRequest::new("tab", "schedule coffee chat tomorrow at noon"))
            .await
            .unwrap();

        assert_eq!(reply.text, "Ok! I scheduled a coffee chat for tomorrow at noon.");
    }

    #[tokio::test]
    async fn empty_calendar_reply_is_replaced_with_fallback_text() {
        let h = harness(RecordingExecutor::succeeding(""));
        h.provider.push_text("Calendar").push_text("let a = 1\n");

        let reply = h
            .orchestrator
            .send_message(SendRequest::new("tab", "move my dentist appointment"))
            .await
            .unwrap();

        assert_eq!(reply.text, EMPTY_CALENDAR_REPLY);
        assert!(h.executor.scripts().is_empty());
    }

    #[tokio::test]
    async fn classifier_timeout_falls_back_to_chat() {
        let h = harness(RecordingExecutor::succeeding(""));
        h.provider.push_hang().push_chunks(&["fine, chatting"]);

        let reply = h
            .orchestrator
            .send_message(SendRequest::new("tab", "schedule lunch"))
            .await
            .unwrap();

        assert_eq!(reply.text, "fine, chatting");
        assert!(h.executor.scripts().is_empty());
    }

    #[tokio::test]
    async fn generation_failure_surfaces_one_generic_error() {
        let h = harness(RecordingExecutor::succeeding(""));
        h.provider.push_text("ChatGPT").push_events(vec![
            StreamEvent::Delta("par".to_string()),
            StreamEvent::Error("connection reset".to_string()),
        ]);
        let mut subscription = h.orchestrator.subscribe_progress(ConversationId::new("tab"));

        let error = h
            .orchestrator
            .send_message(SendRequest::new("tab", "tell me a story"))
            .await
            .unwrap_err();
        assert!(matches!(error, OrchestratorError::Internal { .. }));
        assert!(!error.to_string().contains("connection reset"));

        let events = drain(&h.broker, &mut subscription).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].status, MessageStatus::Partial);
        assert_eq!(events[1].status, MessageStatus::Error);
        assert_eq!(events[1].id, events[0].id);
    }

    #[tokio::test]
    async fn calendar_generation_failure_terminates_the_placeholder() {
        let h = harness(RecordingExecutor::succeeding(""));
        h.provider.push_text("Calendar").push_failure("model overloaded");
        let mut subscription = h.orchestrator.subscribe_progress(ConversationId::new("tab"));

        let result = h
            .orchestrator
            .send_message(SendRequest::new("tab", "clear my week"))
            .await;
        assert!(result.is_err());

        let statuses = drain(&h.broker, &mut subscription)
            .await
            .into_iter()
            .map(|m| m.status)
            .collect::<Vec<_>>();
        assert_eq!(statuses, [MessageStatus::Pending, MessageStatus::Error]);
    }

    #[tokio::test]
    async fn reset_sentinel_never_reaches_the_backend() {
        let h = harness(RecordingExecutor::succeeding(""));

        for text in ["RESET", "RESET\n", " RESET "] {
            let error = h
                .orchestrator
                .send_message(SendRequest::new("tab", text))
                .await
                .unwrap_err();
            assert!(matches!(error, OrchestratorError::InvalidRequest { .. }));
        }
        assert!(h.provider.requests().is_empty());
    }

    #[tokio::test]
    async fn parent_chain_is_sent_as_context() {
        let h = harness(RecordingExecutor::succeeding(""));
        h.provider
            .push_text("ChatGPT")
            .push_chunks(&["Rust is a systems language."])
            .push_text("ChatGPT")
            .push_chunks(&["It was first released in 2015."]);

        let first = h
            .orchestrator
            .send_message(SendRequest::new("tab", "what is rust?"))
            .await
            .unwrap();
        h.orchestrator
            .send_message(SendRequest::new("tab", "when was it released?").with_parent(first.id))
            .await
            .unwrap();

        let follow_up = h.provider.requests().remove(3);
        let turns = follow_up
            .messages
            .iter()
            .map(|m| (m.role, m.content.as_str()))
            .collect::<Vec<_>>();
        assert_eq!(
            turns,
            [
                (ProviderRole::User, "what is rust?"),
                (ProviderRole::Assistant, "Rust is a systems language."),
                (ProviderRole::User, "when was it released?"),
            ]
        );
    }

    #[tokio::test]
    async fn model_override_applies_to_chat_turns() {
        let h = harness(RecordingExecutor::succeeding(""));
        h.provider.push_text("ChatGPT").push_chunks(&["ok"]);
        let options = ModelOptions {
            model: Some("gpt-4o".to_string()),
            temperature: Some(0.2),
            ..ModelOptions::default()
        };

        h.orchestrator
            .send_message(SendRequest::new("tab", "hi").with_model_options(options))
            .await
            .unwrap();

        let chat_request = h.provider.requests().remove(1);
        assert_eq!(chat_request.model_id, "gpt-4o");
        assert_eq!(chat_request.temperature, Some(0.2));
    }

    #[tokio::test]
    async fn concurrent_conversations_do_not_interfere() {
        let h = harness(RecordingExecutor::succeeding(""));
        let orchestrator = Arc::new(h.orchestrator);
        h.provider
            .push_text("ChatGPT")
            .push_chunks(&["one"])
            .push_text("ChatGPT")
            .push_chunks(&["two"]);
        let mut left = orchestrator.subscribe_progress(ConversationId::new("left"));
        let mut right = orchestrator.subscribe_progress(ConversationId::new("right"));

        let (a, b) = tokio::join!(
            orchestrator.send_message(SendRequest::new("left", "a")),
            orchestrator.send_message(SendRequest::new("right", "b")),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        let left_events = drain(&h.broker, &mut left).await;
        let right_events = drain(&h.broker, &mut right).await;
        assert!(left_events.iter().all(|m| m.id == a.id));
        assert!(right_events.iter().all(|m| m.id == b.id));
        assert_eq!(left_events.last(), Some(&a));
        assert_eq!(right_events.last(), Some(&b));
    }

    #[tokio::test]
    async fn summarize_cleans_generated_title() {
        let h = harness(RecordingExecutor::succeeding(""));
        h.provider.push_text("\"Rust release history.\"\nextra");

        let title = h
            .orchestrator
            .summarize("when was rust released?", "In 2015.")
            .await;
        assert_eq!(title, "Rust release history");
    }

    #[tokio::test]
    async fn summarize_falls_back_to_user_text() {
        let h = harness(RecordingExecutor::succeeding(""));
        h.provider.push_failure("timeout");

        let title = h
            .orchestrator
            .summarize("please book a table for two at seven tonight", "Done.")
            .await;
        assert_eq!(title, "please book a table for two");
    }
}
