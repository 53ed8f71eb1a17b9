use snafu::ensure;

use super::provider::{
    CompletionRequest, EmptyMessageSetSnafu, LlmProvider, ProviderResult, ProviderStreamHandle,
    StreamClosedSnafu, StreamEvent, StreamFailedSnafu,
};

/// Runs a request to completion and returns the aggregated assistant text.
///
/// Text after the earliest stop sequence is discarded and the upstream stream is cancelled as
/// soon as a stop sequence shows up.
pub async fn complete(provider: &dyn LlmProvider, request: CompletionRequest) -> ProviderResult<String> {
    ensure!(
        !request.messages.is_empty(),
        EmptyMessageSetSnafu {
            stage: "complete",
            model_id: request.model_id.clone(),
        }
    );

    let stop_sequences = request.stop_sequences.clone();
    let model_id = request.model_id.clone();
    let ProviderStreamHandle { mut stream, worker } = provider.stream_completion(request)?;
    tokio::spawn(worker);

    let mut text = String::new();
    while let Some(event) = stream.recv().await {
        match event {
            StreamEvent::Delta(delta) => {
                text.push_str(&delta);
                if let Some(cut) = earliest_stop(&text, &stop_sequences) {
                    text.truncate(cut);
                    stream.cancel();
                    tracing::debug!(
                        provider_id = %provider.id(),
                        model_id = %model_id,
                        "stop sequence reached; cancelled provider stream"
                    );
                    return Ok(text);
                }
            }
            StreamEvent::ReasoningDelta(_) => {}
            StreamEvent::Done => return Ok(text),
            StreamEvent::Error(message) => {
                return StreamFailedSnafu {
                    stage: "complete-stream-event",
                    message,
                }
                .fail();
            }
        }
    }

    StreamClosedSnafu {
        stage: "complete-stream-closed",
    }
    .fail()
}

fn earliest_stop(text: &str, stop_sequences: &[String]) -> Option<usize> {
    stop_sequences
        .iter()
        .filter(|stop| !stop.is_empty())
        .filter_map(|stop| text.find(stop.as_str()))
        .min()
}
