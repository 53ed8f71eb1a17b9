use std::collections::{HashMap, VecDeque};

use tokio::sync::RwLock;

use crate::chat::{Message, MessageId};

pub const DEFAULT_LOG_CAPACITY: usize = 4_096;
pub const DEFAULT_CONTEXT_DEPTH: usize = 16;

struct LogEntries {
    by_id: HashMap<MessageId, Message>,
    insertion_order: VecDeque<MessageId>,
}

/// In-memory record of finished turns, used to thread `parentMessageId` chains into context.
///
/// Not durable. Oldest entries are evicted once `capacity` is reached.
pub struct ConversationLog {
    entries: RwLock<LogEntries>,
    capacity: usize,
}

impl ConversationLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(LogEntries {
                by_id: HashMap::new(),
                insertion_order: VecDeque::new(),
            }),
            capacity: capacity.max(1),
        }
    }

    pub async fn record(&self, message: Message) {
        let mut entries = self.entries.write().await;
        if entries.by_id.insert(message.id, message.clone()).is_none() {
            entries.insertion_order.push_back(message.id);
        }

        while entries.insertion_order.len() > self.capacity {
            if let Some(evicted) = entries.insertion_order.pop_front() {
                entries.by_id.remove(&evicted);
            }
        }
    }

    pub async fn get(&self, id: MessageId) -> Option<Message> {
        self.entries.read().await.by_id.get(&id).cloned()
    }

    /// Walks parent links from `leaf`, returning at most `depth` messages oldest-first.
    pub async fn ancestry(&self, leaf: MessageId, depth: usize) -> Vec<Message> {
        let entries = self.entries.read().await;
        let mut chain = Vec::new();
        let mut cursor = Some(leaf);

        while let Some(id) = cursor {
            if chain.len() >= depth {
                break;
            }
            let Some(message) = entries.by_id.get(&id) else {
                break;
            };
            cursor = message.parent_message_id;
            chain.push(message.clone());
        }

        chain.reverse();
        chain
    }
}

impl Default for ConversationLog {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}
