use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::{mpsc, oneshot};

use crate::chat::{ConversationId, Message};

pub type BrokerWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

type SubscriberId = u64;

enum BrokerCommand {
    Subscribe {
        conversation_id: ConversationId,
        subscriber_id: SubscriberId,
        events: mpsc::UnboundedSender<Message>,
    },
    Unsubscribe {
        conversation_id: ConversationId,
        subscriber_id: SubscriberId,
    },
    Publish {
        conversation_id: ConversationId,
        message: Message,
    },
    SubscriberCount {
        conversation_id: ConversationId,
        reply: oneshot::Sender<usize>,
    },
    RelayCount {
        reply: oneshot::Sender<usize>,
    },
}

/// Live fan-out for one conversation; exists only while it has subscribers.
#[derive(Default)]
struct Relay {
    subscribers: Vec<(SubscriberId, mpsc::UnboundedSender<Message>)>,
}

/// Per-conversation event relay.
///
/// All relay state is owned by one worker task; handles only enqueue commands, so subscribe,
/// unsubscribe and publish are applied in the order they were issued. Publishing to a
/// conversation without subscribers drops the message, and nothing is replayed to late joiners.
#[derive(Clone)]
pub struct ConversationBroker {
    command_tx: mpsc::UnboundedSender<BrokerCommand>,
    next_subscriber_id: Arc<AtomicU64>,
}

impl ConversationBroker {
    /// Returns the handle plus the worker future that owns relay state.
    pub fn new() -> (Self, BrokerWorker) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let broker = Self {
            command_tx,
            next_subscriber_id: Arc::new(AtomicU64::new(1)),
        };
        (broker, Box::pin(run_broker(command_rx)))
    }

    /// Creates a broker and spawns its worker on the current tokio runtime.
    pub fn spawn() -> Self {
        let (broker, worker) = Self::new();
        tokio::spawn(worker);
        broker
    }

    pub fn subscribe(&self, conversation_id: ConversationId) -> Subscription {
        let subscriber_id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let registered = self
            .command_tx
            .send(BrokerCommand::Subscribe {
                conversation_id: conversation_id.clone(),
                subscriber_id,
                events: events_tx,
            })
            .is_ok();

        if !registered {
            tracing::warn!(
                conversation_id = %conversation_id,
                "broker worker is gone; subscription will never receive events"
            );
        }

        Subscription {
            conversation_id,
            subscriber_id,
            events: events_rx,
            command_tx: self.command_tx.clone(),
            active: registered,
        }
    }

    pub fn publish(&self, conversation_id: &ConversationId, message: Message) {
        if self
            .command_tx
            .send(BrokerCommand::Publish {
                conversation_id: conversation_id.clone(),
                message,
            })
            .is_err()
        {
            tracing::warn!(conversation_id = %conversation_id, "broker worker is gone; dropped event");
        }
    }

    pub async fn subscriber_count(&self, conversation_id: &ConversationId) -> usize {
        let (reply, response) = oneshot::channel();
        let command = BrokerCommand::SubscriberCount {
            conversation_id: conversation_id.clone(),
            reply,
        };
        if self.command_tx.send(command).is_err() {
            return 0;
        }
        response.await.unwrap_or(0)
    }

    /// Number of conversations that currently have a live relay.
    pub async fn relay_count(&self) -> usize {
        let (reply, response) = oneshot::channel();
        if self
            .command_tx
            .send(BrokerCommand::RelayCount { reply })
            .is_err()
        {
            return 0;
        }
        response.await.unwrap_or(0)
    }
}

async fn run_broker(mut command_rx: mpsc::UnboundedReceiver<BrokerCommand>) {
    let mut relays: HashMap<ConversationId, Relay> = HashMap::new();

    while let Some(command) = command_rx.recv().await {
        match command {
            BrokerCommand::Subscribe {
                conversation_id,
                subscriber_id,
                events,
            } => {
                let relay = relays.entry(conversation_id.clone()).or_insert_with(|| {
                    tracing::debug!(conversation_id = %conversation_id, "relay created");
                    Relay::default()
                });
                relay.subscribers.push((subscriber_id, events));
            }
            BrokerCommand::Unsubscribe {
                conversation_id,
                subscriber_id,
            } => {
                remove_subscriber(&mut relays, &conversation_id, |id| id == subscriber_id);
            }
            BrokerCommand::Publish {
                conversation_id,
                message,
            } => {
                let Some(relay) = relays.get(&conversation_id) else {
                    continue;
                };

                let mut closed = Vec::new();
                for (subscriber_id, events) in &relay.subscribers {
                    if events.send(message.clone()).is_err() {
                        closed.push(*subscriber_id);
                    }
                }

                if !closed.is_empty() {
                    remove_subscriber(&mut relays, &conversation_id, |id| closed.contains(&id));
                }
            }
            BrokerCommand::SubscriberCount {
                conversation_id,
                reply,
            } => {
                let count = relays
                    .get(&conversation_id)
                    .map(|relay| relay.subscribers.len())
                    .unwrap_or(0);
                let _ = reply.send(count);
            }
            BrokerCommand::RelayCount { reply } => {
                let _ = reply.send(relays.len());
            }
        }
    }

    tracing::debug!(remaining_relays = relays.len(), "broker worker stopped");
}

fn remove_subscriber(
    relays: &mut HashMap<ConversationId, Relay>,
    conversation_id: &ConversationId,
    matches: impl Fn(SubscriberId) -> bool,
) {
    let Some(relay) = relays.get_mut(conversation_id) else {
        return;
    };

    relay.subscribers.retain(|(id, _)| !matches(*id));
    if relay.subscribers.is_empty() {
        relays.remove(conversation_id);
        tracing::debug!(conversation_id = %conversation_id, "relay destroyed");
    }
}

/// One subscriber's view of a conversation's events.
///
/// Yields every message published after the subscription was registered, in publish order.
/// Dropping the subscription unsubscribes it.
pub struct Subscription {
    conversation_id: ConversationId,
    subscriber_id: SubscriberId,
    events: mpsc::UnboundedReceiver<Message>,
    command_tx: mpsc::UnboundedSender<BrokerCommand>,
    active: bool,
}

impl Subscription {
    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub async fn recv(&mut self) -> Option<Message> {
        self.events.recv().await
    }

    pub fn unsubscribe(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        self.events.close();
        let _ = self.command_tx.send(BrokerCommand::Unsubscribe {
            conversation_id: self.conversation_id.clone(),
            subscriber_id: self.subscriber_id,
        });
    }
}

impl Stream for Subscription {
    type Item = Message;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Message>> {
        self.events.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}
