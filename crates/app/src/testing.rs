//! Test doubles for the generation backend and the script boundary.

use std::collections::VecDeque;
use std::sync::Mutex;

use deskmate_llm::{
    BoxFuture, CompletionRequest, LlmProvider, ProviderResult, ProviderStreamHandle,
    ProviderWorker, StreamEvent, make_event_stream,
};

use crate::script::{ScriptError, ScriptExecutor, ScriptResult};

enum Scripted {
    Events(Vec<StreamEvent>),
    Hang,
}

/// Replays queued responses, one per call, and records every request it saw.
pub(crate) struct ScriptedProvider {
    responses: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedProvider {
    pub(crate) fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn with_texts(texts: &[&str]) -> Self {
        let provider = Self::new();
        for text in texts {
            provider.push_text(text);
        }
        provider
    }

    pub(crate) fn with_failure(message: &str) -> Self {
        let provider = Self::new();
        provider.push_failure(message);
        provider
    }

    pub(crate) fn push_text(&self, text: &str) -> &Self {
        self.push_chunks(&[text])
    }

    pub(crate) fn push_chunks(&self, chunks: &[&str]) -> &Self {
        let mut events = chunks
            .iter()
            .map(|chunk| StreamEvent::Delta(chunk.to_string()))
            .collect::<Vec<_>>();
        events.push(StreamEvent::Done);
        self.push_events(events)
    }

    pub(crate) fn push_failure(&self, message: &str) -> &Self {
        self.push_events(vec![StreamEvent::Error(message.to_string())])
    }

    pub(crate) fn push_events(&self, events: Vec<StreamEvent>) -> &Self {
        self.responses
            .lock()
            .unwrap()
            .push_back(Scripted::Events(events));
        self
    }

    /// Next call never produces an event, standing in for a backend that times out.
    pub(crate) fn push_hang(&self) -> &Self {
        self.responses.lock().unwrap().push_back(Scripted::Hang);
        self
    }

    pub(crate) fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl LlmProvider for ScriptedProvider {
    fn id(&self) -> &str {
        "scripted"
    }

    fn default_model(&self) -> &str {
        "scripted-model"
    }

    fn stream_completion(&self, request: CompletionRequest) -> ProviderResult<ProviderStreamHandle> {
        self.requests.lock().unwrap().push(request);
        let scripted = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Scripted::Events(vec![StreamEvent::Error("no scripted response".to_string())])
            });

        let (event_tx, stream, _cancel_rx) = make_event_stream();
        let worker: ProviderWorker = match scripted {
            Scripted::Events(events) => Box::pin(async move {
                for event in events {
                    if event_tx.send(event).is_err() {
                        return;
                    }
                }
            }),
            Scripted::Hang => Box::pin(async move {
                let _keep_open = event_tx;
                futures::future::pending::<()>().await;
            }),
        };
        Ok(ProviderStreamHandle { stream, worker })
    }
}

/// Records scripts instead of running them.
pub(crate) struct RecordingExecutor {
    scripts: Mutex<Vec<String>>,
    outcome: Result<String, String>,
}

impl RecordingExecutor {
    pub(crate) fn succeeding(output: &str) -> Self {
        Self {
            scripts: Mutex::new(Vec::new()),
            outcome: Ok(output.to_string()),
        }
    }

    pub(crate) fn failing(stderr: &str) -> Self {
        Self {
            scripts: Mutex::new(Vec::new()),
            outcome: Err(stderr.to_string()),
        }
    }

    pub(crate) fn scripts(&self) -> Vec<String> {
        self.scripts.lock().unwrap().clone()
    }
}

impl ScriptExecutor for RecordingExecutor {
    fn execute<'a>(&'a self, script: &'a str) -> BoxFuture<'a, ScriptResult<String>> {
        self.scripts.lock().unwrap().push(script.to_string());
        let outcome = self.outcome.clone().map_err(|stderr| ScriptError::ErrorOutput {
            stage: "recording-executor",
            stderr,
        });
        Box::pin(async move { outcome })
    }
}
