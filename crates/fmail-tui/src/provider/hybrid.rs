use super::file::FileProvider;
use super::forged::ForgedProvider;
use super::{
    CancelHandle, ConnectionProbe, MessageProvider, ProviderError, Subscription,
    DEFAULT_SUBSCRIBER_BUFFER,
};
use fmail_core::{
    AgentRecord, DmConversation, Message, MessageFilter, SearchQuery, SearchResult,
    SubscriptionFilter, TopicInfo,
};
use std::collections::{HashSet, VecDeque};
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// Message ids remembered per merged subscription for duplicate suppression.
pub const DEDUP_WINDOW: usize = 4096;

/// Live broker plus mailbox polling behind one provider.
///
/// Reads go to the broker side while it is connected and to the mailbox
/// otherwise. Subscriptions merge both sources and deliver each id at most once.
#[derive(Clone)]
pub struct HybridProvider {
    file: FileProvider,
    forged: ForgedProvider,
    subscriber_buffer: usize,
}

impl HybridProvider {
    pub fn new(file: FileProvider, forged: ForgedProvider) -> Self {
        Self {
            file,
            forged,
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
        }
    }

    pub fn with_subscriber_buffer(mut self, capacity: usize) -> Self {
        self.subscriber_buffer = capacity.max(1);
        self
    }

    pub fn file(&self) -> &FileProvider {
        &self.file
    }

    pub fn forged(&self) -> &ForgedProvider {
        &self.forged
    }

    fn route<T>(
        &self,
        op: impl Fn(&dyn MessageProvider) -> Result<T, ProviderError>,
    ) -> Result<T, ProviderError> {
        if !self.forged.is_connected() {
            return op(&self.file);
        }
        match op(&self.forged) {
            Err(ProviderError::Unavailable(_) | ProviderError::NotConnected(_)) => op(&self.file),
            other => other,
        }
    }
}

impl MessageProvider for HybridProvider {
    fn topics(&self) -> Result<Vec<TopicInfo>, ProviderError> {
        self.route(|provider| provider.topics())
    }

    fn messages(&self, topic: &str, filter: &MessageFilter) -> Result<Vec<Message>, ProviderError> {
        self.route(|provider| provider.messages(topic, filter))
    }

    fn dm_conversations(&self, agent: &str) -> Result<Vec<DmConversation>, ProviderError> {
        self.route(|provider| provider.dm_conversations(agent))
    }

    fn dms(&self, agent: &str, filter: &MessageFilter) -> Result<Vec<Message>, ProviderError> {
        self.route(|provider| provider.dms(agent, filter))
    }

    fn agents(&self) -> Result<Vec<AgentRecord>, ProviderError> {
        self.route(|provider| provider.agents())
    }

    fn search(&self, query: &SearchQuery) -> Result<Vec<SearchResult>, ProviderError> {
        self.route(|provider| provider.search(query))
    }

    fn subscribe(&self, filter: SubscriptionFilter) -> Result<Subscription, ProviderError> {
        let live = self.forged.subscribe(filter.clone())?;
        let polled = self.file.subscribe(filter)?;

        let live_cancel = live.cancel_handle();
        let polled_cancel = polled.cancel_handle();
        let cancel = CancelHandle::new(move || {
            live_cancel.cancel();
            polled_cancel.cancel();
        });

        let (tx, rx) = broadcast::channel(self.subscriber_buffer);
        tokio::spawn(merge_streams(live, polled, tx));
        Ok(Subscription::new(rx, cancel))
    }

    fn connection(&self) -> ConnectionProbe {
        self.forged.connection()
    }
}

async fn merge_streams(
    mut live: Subscription,
    mut polled: Subscription,
    tx: broadcast::Sender<Message>,
) {
    let mut seen = DedupWindow::new(DEDUP_WINDOW);
    let mut live_open = true;
    let mut polled_open = true;

    while live_open || polled_open {
        let message = tokio::select! {
            received = live.recv(), if live_open => match received {
                Some(message) => message,
                None => {
                    live_open = false;
                    continue;
                }
            },
            received = polled.recv(), if polled_open => match received {
                Some(message) => message,
                None => {
                    polled_open = false;
                    continue;
                }
            },
        };

        if !seen.insert(&message.id) {
            trace!(event = "hybrid_duplicate", id = %message.id);
            continue;
        }
        if tx.send(message).is_err() {
            break;
        }
    }
    debug!(event = "hybrid_merge_stop");
}

/// Bounded set of recently delivered ids; the oldest id is forgotten first.
#[derive(Debug)]
pub(crate) struct DedupWindow {
    capacity: usize,
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl DedupWindow {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            ids: HashSet::new(),
        }
    }

    /// Returns false when `id` was already delivered.
    pub(crate) fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.ids.insert(id.to_string());
        true
    }
}
