//! Calendar automation: prompt a model for a JavaScript-for-Automation script, run it, and hand
//! back the sentence the script says it wants to tell the user.

mod prompt;
mod reply;

use std::sync::Arc;

use deskmate_llm::{CompletionRequest, LlmProvider, ProviderResult, complete};

use crate::script::ScriptExecutor;

pub use prompt::{ClockSnapshot, Contact, default_contacts, render_calendar_prompt};
pub use reply::{GeneratedScript, REPLY_SENTINEL, split_generated};

pub const SCRIPT_FENCE: &str = "```";
pub const DEFAULT_CALENDAR_MAX_TOKENS: u64 = 700;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarOutcome {
    pub reply: String,
    /// Script text as generated, kept for display or audit whether or not it ran cleanly.
    pub script: String,
}

pub struct CalendarAction {
    executor: Arc<dyn ScriptExecutor>,
    contacts: Vec<Contact>,
    max_tokens: u64,
}

impl CalendarAction {
    pub fn new(executor: Arc<dyn ScriptExecutor>, contacts: Vec<Contact>) -> Self {
        Self {
            executor,
            contacts,
            max_tokens: DEFAULT_CALENDAR_MAX_TOKENS,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Generates and runs a calendar script for `task`.
    ///
    /// Only generation failures are returned as errors. Script execution failures are logged and
    /// the generated reply is still returned, since it describes what was attempted.
    pub async fn run(
        &self,
        backend: &dyn LlmProvider,
        model_id: &str,
        task: &str,
        clock: &ClockSnapshot,
    ) -> ProviderResult<CalendarOutcome> {
        let prompt = render_calendar_prompt(task, &self.contacts, clock);
        let request = CompletionRequest::from_prompt(model_id, prompt)
            .with_temperature(0.0)
            .with_max_tokens(self.max_tokens)
            .with_stop_sequence(SCRIPT_FENCE);

        let raw = complete(backend, request).await?;
        let GeneratedScript {
            script,
            reply,
            has_sentinel,
        } = split_generated(&raw);

        if !has_sentinel {
            tracing::warn!(
                model_id = %model_id,
                generated_len = raw.len(),
                "generated calendar script has no reply sentinel; skipping execution"
            );
            return Ok(CalendarOutcome { reply, script });
        }

        match self.executor.execute(&script).await {
            Ok(output) => {
                tracing::info!(output = %output, "calendar script executed");
            }
            Err(error) => {
                tracing::warn!(error = %error, "calendar script failed; delivering reply anyway");
            }
        }

        Ok(CalendarOutcome { reply, script })
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::testing::{RecordingExecutor, ScriptedProvider};

    fn clock() -> ClockSnapshot {
        let datetime = NaiveDate::from_ymd_opt(2023, 2, 20)
            .and_then(|date| date.and_hms_opt(16, 11, 25))
            .unwrap();
        ClockSnapshot::from_naive(datetime)
    }

    const GENERATED: &str = "\nlet Calendar = Application(\"Calendar\")\nlet event = Calendar.Event({summary: \"Coffee chat\"})\nCalendar.reloadCalendars()\n\nsendReply(\"Ok! I scheduled a coffee chat tomorrow at noon.\")\n";

    #[tokio::test]
    async fn runs_the_pre_sentinel_script_and_returns_the_reply() {
        let provider = ScriptedProvider::with_texts(&[GENERATED]);
        let executor = Arc::new(RecordingExecutor::succeeding("done"));
        let action = CalendarAction::new(executor.clone(), default_contacts());

        let outcome = action
            .run(&provider, "m", "schedule coffee chat tomorrow at noon", &clock())
            .await
            .unwrap();

        assert_eq!(outcome.reply, "Ok! I scheduled a coffee chat tomorrow at noon.");
        assert!(!outcome.script.contains(REPLY_SENTINEL));
        assert_eq!(executor.scripts(), vec![outcome.script.clone()]);

        let request = provider.requests().remove(0);
        assert_eq!(request.temperature, Some(0.0));
        assert_eq!(request.max_tokens, Some(DEFAULT_CALENDAR_MAX_TOKENS));
        assert_eq!(request.stop_sequences, vec![SCRIPT_FENCE.to_string()]);
        assert!(request.messages[0].content.contains("Monday, February 20, 2023 at 4:11:25 PM"));
    }

    #[tokio::test]
    async fn script_failure_still_returns_the_reply() {
        let provider = ScriptedProvider::with_texts(&[GENERATED]);
        let executor = Arc::new(RecordingExecutor::failing("execution error: Calendar got an error"));
        let action = CalendarAction::new(executor.clone(), default_contacts());

        let outcome = action.run(&provider, "m", "coffee", &clock()).await.unwrap();

        assert_eq!(outcome.reply, "Ok! I scheduled a coffee chat tomorrow at noon.");
        assert_eq!(executor.scripts().len(), 1);
    }

    #[tokio::test]
    async fn output_without_sentinel_is_not_executed() {
        let provider = ScriptedProvider::with_texts(&["let Calendar = Application(\"Calendar\")\n"]);
        let executor = Arc::new(RecordingExecutor::succeeding(""));
        let action = CalendarAction::new(executor.clone(), default_contacts());

        let outcome = action.run(&provider, "m", "coffee", &clock()).await.unwrap();

        assert_eq!(outcome.reply, "");
        assert!(executor.scripts().is_empty());
    }

    #[tokio::test]
    async fn generation_failure_is_returned() {
        let provider = ScriptedProvider::with_failure("upstream unavailable");
        let executor = Arc::new(RecordingExecutor::succeeding(""));
        let action = CalendarAction::new(executor.clone(), default_contacts());

        assert!(action.run(&provider, "m", "coffee", &clock()).await.is_err());
        assert!(executor.scripts().is_empty());
    }
}
