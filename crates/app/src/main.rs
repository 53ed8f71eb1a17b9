use std::sync::Arc;

use deskmate::chat::{
    ConversationId, Message, MessageId, MessageStatus, ModelOptions, RESET_SENTINEL, SendRequest,
};
use deskmate::settings::SettingsStore;
use deskmate::{ChatOrchestrator, ConversationBroker, OrchestratorError, Subscription};
use deskmate_llm::{ProviderError, create_provider};
use futures::StreamExt;
use snafu::{OptionExt, ResultExt, Snafu};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

/// `/model <name>` switches and persists the chat model.
const MODEL_COMMAND: &str = "/model";

#[derive(Debug, Snafu)]
enum CliError {
    #[snafu(display(
        "no API key configured; set OPENAI_API_KEY or provider.api_key in {config_path}"
    ))]
    MissingApiKey {
        stage: &'static str,
        config_path: String,
    },
    #[snafu(display("failed to create provider on `{stage}`: {source}"))]
    CreateProvider {
        stage: &'static str,
        source: ProviderError,
    },
    #[snafu(display("failed to read input on `{stage}`: {source}"))]
    ReadInput {
        stage: &'static str,
        source: std::io::Error,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(error) = run().await {
        eprintln!("deskmate: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    let store = SettingsStore::load();
    let settings = store.settings();

    let config = settings
        .provider
        .to_provider_config()
        .context(MissingApiKeySnafu {
            stage: "load-provider-config",
            config_path: store.config_path().display().to_string(),
        })?;
    let backend = create_provider(config).context(CreateProviderSnafu {
        stage: "create-provider",
    })?;
    tracing::info!(
        provider_id = %backend.id(),
        chat_model = %settings.provider.chat_model,
        "provider ready"
    );

    let orchestrator = Arc::new(ChatOrchestrator::from_settings(
        &settings,
        ConversationBroker::spawn(),
        backend,
    ));

    let mut conversation = std::env::args()
        .nth(1)
        .map(ConversationId::from)
        .unwrap_or_else(ConversationId::generate);
    let mut printer = spawn_printer(orchestrator.subscribe_progress(conversation.clone()));
    let mut parent: Option<MessageId> = None;
    let mut titled = false;
    eprintln!("conversation {conversation}; type RESET to start over, /model <name> to switch models");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context(ReadInputSnafu {
        stage: "read-stdin-line",
    })? {
        let text = line.trim();
        if text.is_empty() {
            continue;
        }

        if text == RESET_SENTINEL {
            printer.abort();
            conversation = ConversationId::generate();
            printer = spawn_printer(orchestrator.subscribe_progress(conversation.clone()));
            parent = None;
            titled = false;
            eprintln!("conversation {conversation}");
            continue;
        }

        if let Some(model) = text.strip_prefix(MODEL_COMMAND) {
            match store.set_chat_model(model.trim()) {
                Ok(settings) => eprintln!("chat model: {}", settings.provider.chat_model),
                Err(error) => eprintln!("{error}"),
            }
            continue;
        }

        let options = ModelOptions {
            model: Some(store.settings().provider.chat_model.clone()),
            ..ModelOptions::default()
        };
        let mut request = SendRequest::new(conversation.clone(), text).with_model_options(options);
        if let Some(parent_id) = parent {
            request = request.with_parent(parent_id);
        }

        match orchestrator.send_message(request).await {
            Ok(reply) => {
                parent = Some(reply.id);
                if !titled {
                    let title = orchestrator.summarize(text, &reply.text).await;
                    eprintln!("title: {title}");
                    titled = true;
                }
            }
            Err(OrchestratorError::InvalidRequest { source, .. }) => {
                eprintln!("{source}");
            }
            // The error notice already reached the printer through the broker.
            Err(OrchestratorError::Internal { .. }) => {}
        }
    }

    printer.abort();
    Ok(())
}

/// Renders progress events for one conversation, printing only the new tail of each chunk.
fn spawn_printer(mut subscription: Subscription) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        let mut current: Option<MessageId> = None;
        let mut printed = 0;

        while let Some(message) = subscription.next().await {
            if current != Some(message.id) {
                current = Some(message.id);
                printed = 0;
            }
            let output = render(&message, &mut printed);
            if let Err(error) = stdout.write_all(output.as_bytes()).await {
                tracing::warn!(error = %error, "failed to write progress");
                break;
            }
            let _ = stdout.flush().await;
        }
    })
}

fn render(message: &Message, printed: &mut usize) -> String {
    match message.status {
        MessageStatus::Pending => format!("... {}\n", message.text),
        MessageStatus::Error => format!("\n! {}\n", message.text),
        MessageStatus::Partial | MessageStatus::Final => {
            let tail = message.text.get(*printed..).unwrap_or(&message.text);
            let mut output = tail.to_string();
            *printed = message.text.len();
            if message.status == MessageStatus::Final {
                output.push('\n');
            }
            output
        }
    }
}
