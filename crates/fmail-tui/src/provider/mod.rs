pub mod file;
pub mod forged;
pub mod hybrid;
pub mod select;

pub use file::{FileProvider, FileProviderConfig};
pub use forged::{BrokerAddr, ForgedConfig, ForgedProvider};
pub use hybrid::HybridProvider;
pub use select::{select_provider, ProviderOptions, ProviderSelection};

use crate::lock_or_recover;
use fmail_core::{
    AgentRecord, DmConversation, MailboxError, Message, MessageFilter, SearchQuery, SearchResult,
    SubscriptionFilter, TopicInfo,
};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tracing::debug;

pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 512;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("mailbox error: {0}")]
    Mailbox(#[from] MailboxError),
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("not connected to {0}")]
    NotConnected(String),
    #[error("invalid broker address: {0:?}")]
    InvalidAddress(String),
    #[error("broker handshake failed: {0}")]
    Handshake(String),
    #[error("{0}")]
    Unavailable(String),
}

/// Liveness sample consumed by the connection status tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionProbe {
    /// A live broker is part of this provider.
    pub configured: bool,
    pub connected: bool,
    /// Transport and address, e.g. `unix:/repo/.fmail/forged.sock`.
    pub method: String,
}

/// Capability set every message source implements.
///
/// Read operations are synchronous. `subscribe` must be called from within a
/// tokio runtime: delivery runs on background tasks.
pub trait MessageProvider: Send + Sync {
    fn topics(&self) -> Result<Vec<TopicInfo>, ProviderError>;

    fn messages(&self, topic: &str, filter: &MessageFilter) -> Result<Vec<Message>, ProviderError>;

    /// Conversations `agent` takes part in, one per peer.
    fn dm_conversations(&self, agent: &str) -> Result<Vec<DmConversation>, ProviderError>;

    /// The conversation between the local agent and `agent`, oldest first.
    fn dms(&self, agent: &str, filter: &MessageFilter) -> Result<Vec<Message>, ProviderError>;

    fn agents(&self) -> Result<Vec<AgentRecord>, ProviderError>;

    fn search(&self, query: &SearchQuery) -> Result<Vec<SearchResult>, ProviderError>;

    /// Live stream of future arrivals matching `filter`. Never replays history.
    fn subscribe(&self, filter: SubscriptionFilter) -> Result<Subscription, ProviderError>;

    fn connection(&self) -> ConnectionProbe;
}

struct CancelState {
    fired: watch::Sender<bool>,
    on_cancel: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

/// Stops one subscription. Cloneable, idempotent and safe to fire from any task.
#[derive(Clone)]
pub struct CancelHandle {
    inner: Arc<CancelState>,
}

impl CancelHandle {
    pub(crate) fn new(on_cancel: impl FnOnce() + Send + 'static) -> Self {
        let (fired, _) = watch::channel(false);
        Self {
            inner: Arc::new(CancelState {
                fired,
                on_cancel: Mutex::new(Some(Box::new(on_cancel))),
            }),
        }
    }

    pub fn cancel(&self) {
        let on_cancel = lock_or_recover(&self.inner.on_cancel).take();
        if let Some(on_cancel) = on_cancel {
            on_cancel();
            self.inner.fired.send_replace(true);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.fired.borrow()
    }

    pub async fn cancelled(&self) {
        let mut fired = self.inner.fired.subscribe();
        let _ = fired.wait_for(|cancelled| *cancelled).await;
    }
}

/// Receiving side of a subscription.
///
/// The buffer is bounded: when the consumer falls behind, the oldest buffered
/// messages are overwritten and `recv` resumes from the oldest one retained.
/// Dropping the subscription cancels it.
pub struct Subscription {
    rx: broadcast::Receiver<Message>,
    cancel: CancelHandle,
    dropped: u64,
}

impl Subscription {
    pub(crate) fn new(rx: broadcast::Receiver<Message>, cancel: CancelHandle) -> Self {
        Self {
            rx,
            cancel,
            dropped: 0,
        }
    }

    /// Next message, or `None` once cancelled or the source is gone.
    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            if self.cancel.is_cancelled() {
                return None;
            }
            let received = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                received = self.rx.recv() => received,
            };
            match received {
                Ok(message) => return Some(message),
                Err(broadcast::error::RecvError::Lagged(skipped)) => self.note_lag(skipped),
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<Message> {
        loop {
            if self.cancel.is_cancelled() {
                return None;
            }
            match self.rx.try_recv() {
                Ok(message) => return Some(message),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => self.note_lag(skipped),
                Err(_) => return None,
            }
        }
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Messages lost to drop-oldest backpressure so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn note_lag(&mut self, skipped: u64) {
        self.dropped += skipped;
        debug!(event = "subscription_lagged", skipped, total = self.dropped);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct SubscriberEntry {
    filter: SubscriptionFilter,
    tx: broadcast::Sender<Message>,
}

/// Fan-out registry shared by a provider's delivery task and its subscribers.
pub(crate) struct SubscriberSet {
    capacity: usize,
    next_id: AtomicU64,
    entries: Mutex<HashMap<u64, SubscriberEntry>>,
}

impl SubscriberSet {
    pub(crate) fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
            entries: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn subscribe(self: &Arc<Self>, filter: SubscriptionFilter) -> Subscription {
        let (tx, rx) = broadcast::channel(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock_or_recover(&self.entries).insert(id, SubscriberEntry { filter, tx });

        let registry = Arc::downgrade(self);
        let cancel = CancelHandle::new(move || {
            if let Some(registry) = registry.upgrade() {
                lock_or_recover(&registry.entries).remove(&id);
            }
        });
        Subscription::new(rx, cancel)
    }

    /// Offers `message` to every matching subscriber without ever waiting.
    pub(crate) fn publish(&self, message: &Message) -> usize {
        let entries = lock_or_recover(&self.entries);
        let mut delivered = 0;
        for entry in entries.values() {
            if entry.filter.matches(message) && entry.tx.send(message.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    pub(crate) fn len(&self) -> usize {
        lock_or_recover(&self.entries).len()
    }
}
