use super::{ConnectionProbe, MessageProvider, ProviderError, SubscriberSet, Subscription};
use super::DEFAULT_SUBSCRIBER_BUFFER;
use crate::lock_or_recover;
use fmail_core::mailbox::{list_entries, read_message, Folder};
use fmail_core::{
    AgentRecord, DmConversation, Mailbox, MailboxError, Message, MessageFilter, SearchQuery,
    SearchResult, SubscriptionFilter, TopicInfo,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct FileProviderConfig {
    pub root: PathBuf,
    pub self_agent: String,
    pub poll_interval: Duration,
    pub subscriber_buffer: usize,
}

impl FileProviderConfig {
    pub fn new(root: impl Into<PathBuf>, self_agent: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            self_agent: self_agent.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
        }
    }
}

/// Polls the filesystem mailbox. Always constructible; the universal fallback.
#[derive(Clone)]
pub struct FileProvider {
    inner: Arc<FileInner>,
}

struct FileInner {
    config: FileProviderConfig,
    mailbox: Mailbox,
    subscribers: Arc<SubscriberSet>,
    poller: Mutex<Option<watch::Sender<bool>>>,
}

impl Drop for FileInner {
    fn drop(&mut self) {
        if let Some(shutdown) = lock_or_recover(&self.poller).take() {
            shutdown.send_replace(true);
        }
    }
}

impl FileProvider {
    pub fn new(config: FileProviderConfig) -> Self {
        let mailbox = Mailbox::new(config.root.clone());
        let subscribers = SubscriberSet::new(config.subscriber_buffer);
        Self {
            inner: Arc::new(FileInner {
                config,
                mailbox,
                subscribers,
                poller: Mutex::new(None),
            }),
        }
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.inner.mailbox
    }

    pub fn self_agent(&self) -> &str {
        &self.inner.config.self_agent
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    /// Starts the poll task on first use. The cursor is primed before the
    /// task starts so nothing already on disk is delivered.
    fn ensure_poller(&self) {
        let mut poller = lock_or_recover(&self.inner.poller);
        if poller.is_some() {
            return;
        }
        let cursor = PollCursor::primed(&self.inner.mailbox);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *poller = Some(shutdown_tx);

        let mailbox = self.inner.mailbox.clone();
        let subscribers = self.inner.subscribers.clone();
        let interval = self.inner.config.poll_interval;
        tokio::spawn(poll_loop(mailbox, subscribers, cursor, interval, shutdown_rx));
    }

    fn read_inbox_from(&self, recipient: &str, sender: &str) -> Result<Vec<Message>, MailboxError> {
        Ok(self
            .inner
            .mailbox
            .read_dm_inbox(recipient)?
            .into_iter()
            .filter(|message| message.from == sender)
            .collect())
    }
}

impl MessageProvider for FileProvider {
    fn topics(&self) -> Result<Vec<TopicInfo>, ProviderError> {
        let mailbox = &self.inner.mailbox;
        let mut topics = Vec::new();
        for name in mailbox.topic_names()? {
            let messages = mailbox.read_topic(&name)?;
            let participants = messages
                .iter()
                .map(|message| message.from.clone())
                .collect::<BTreeSet<_>>();
            topics.push(TopicInfo {
                last_activity: messages.iter().map(|message| message.time).max(),
                message_count: messages.len(),
                participants: participants.into_iter().collect(),
                name,
            });
        }
        Ok(topics)
    }

    fn messages(&self, topic: &str, filter: &MessageFilter) -> Result<Vec<Message>, ProviderError> {
        let messages = match topic.strip_prefix('@') {
            Some(agent) => self.inner.mailbox.read_dm_inbox(agent)?,
            None => self.inner.mailbox.read_topic(topic)?,
        };
        Ok(filter.apply(messages))
    }

    fn dm_conversations(&self, agent: &str) -> Result<Vec<DmConversation>, ProviderError> {
        let agent = agent.trim_start_matches('@');
        let mailbox = &self.inner.mailbox;
        let mut by_peer: BTreeMap<String, Vec<Message>> = BTreeMap::new();

        for message in mailbox.read_dm_inbox(agent)? {
            by_peer.entry(message.from.clone()).or_default().push(message);
        }
        for recipient in mailbox.dm_recipients()? {
            if recipient == agent {
                continue;
            }
            for message in mailbox.read_dm_inbox(&recipient)? {
                if message.from == agent {
                    by_peer.entry(recipient.clone()).or_default().push(message);
                }
            }
        }

        let mut conversations = by_peer
            .into_iter()
            .map(|(peer, messages)| {
                let last = messages.iter().max_by(|a, b| a.id.cmp(&b.id));
                DmConversation {
                    agent: peer,
                    message_count: messages.len(),
                    last_activity: last.map(|message| message.time),
                    last_message_id: last.map(|message| message.id.clone()),
                }
            })
            .collect::<Vec<_>>();
        conversations.sort_by(|a, b| b.last_message_id.cmp(&a.last_message_id));
        Ok(conversations)
    }

    fn dms(&self, agent: &str, filter: &MessageFilter) -> Result<Vec<Message>, ProviderError> {
        let peer = agent.trim_start_matches('@');
        let me = self.self_agent();
        let mut messages = self.read_inbox_from(peer, me)?;
        if peer != me {
            messages.extend(self.read_inbox_from(me, peer)?);
        }
        messages.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(filter.apply(messages))
    }

    fn agents(&self) -> Result<Vec<AgentRecord>, ProviderError> {
        Ok(self.inner.mailbox.read_agents()?)
    }

    fn search(&self, query: &SearchQuery) -> Result<Vec<SearchResult>, ProviderError> {
        let mailbox = &self.inner.mailbox;
        let mut results = Vec::new();
        for folder in mailbox.folders()? {
            let label = folder.label();
            for message in mailbox.read_folder(&folder)? {
                if query.matches(&label, &message) {
                    results.push(SearchResult {
                        topic: label.clone(),
                        message,
                    });
                }
            }
        }
        results.sort_by(|a, b| a.message.id.cmp(&b.message.id));
        if let Some(limit) = query.limit {
            if results.len() > limit {
                results.drain(..results.len() - limit);
            }
        }
        Ok(results)
    }

    fn subscribe(&self, filter: SubscriptionFilter) -> Result<Subscription, ProviderError> {
        let subscription = self.inner.subscribers.subscribe(filter);
        self.ensure_poller();
        Ok(subscription)
    }

    fn connection(&self) -> ConnectionProbe {
        ConnectionProbe {
            configured: false,
            connected: false,
            method: format!("poll:{}", self.inner.config.root.display()),
        }
    }
}

/// Newest id seen per mailbox folder; everything sorting after it is new.
/// Reads of one entry that may fail before the poller gives up on it.
const MAX_READ_ATTEMPTS: u32 = 25;

#[derive(Debug, Default)]
struct PollCursor {
    last_seen: HashMap<PathBuf, String>,
    failures: HashMap<PathBuf, u32>,
}

impl PollCursor {
    fn primed(mailbox: &Mailbox) -> Self {
        let mut cursor = Self::default();
        let folders = match mailbox.folders() {
            Ok(folders) => folders,
            Err(err) => {
                warn!(event = "file_poll_prime_error", error = %err);
                return cursor;
            }
        };
        for folder in folders {
            match list_entries(&folder.path) {
                Ok(entries) => {
                    if let Some(last) = entries.last() {
                        cursor.last_seen.insert(folder.path, last.id.clone());
                    }
                }
                Err(err) => warn!(event = "file_poll_prime_error", error = %err),
            }
        }
        cursor
    }

    /// Messages that appeared since the previous scan, in arrival order.
    fn scan(&mut self, mailbox: &Mailbox) -> Result<Vec<Message>, MailboxError> {
        let folders = mailbox.folders()?;
        Ok(self.scan_folders(folders))
    }

    /// A folder's cursor only moves past entries that were delivered or given up on.
    fn scan_folders(&mut self, folders: Vec<Folder>) -> Vec<Message> {
        let mut delta = Vec::new();
        for folder in folders {
            let entries = match list_entries(&folder.path) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(event = "file_poll_folder_error", folder = %folder.name, error = %err);
                    continue;
                }
            };
            let last_seen = self.last_seen.get(&folder.path).cloned();
            let mut advanced_to = None;
            for entry in entries
                .iter()
                .filter(|entry| last_seen.as_ref().map_or(true, |last| entry.id > *last))
            {
                match read_message(&entry.path) {
                    Ok(message) => {
                        self.failures.remove(&entry.path);
                        delta.push(message);
                    }
                    Err(err) => {
                        let attempts = {
                            let count = self.failures.entry(entry.path.clone()).or_insert(0);
                            *count += 1;
                            *count
                        };
                        if attempts < MAX_READ_ATTEMPTS {
                            debug!(event = "file_poll_retry_entry", attempts, error = %err);
                            break;
                        }
                        warn!(event = "file_poll_skip_entry", attempts, error = %err);
                        self.failures.remove(&entry.path);
                    }
                }
                advanced_to = Some(entry.id.clone());
            }
            if let Some(id) = advanced_to {
                self.last_seen.insert(folder.path, id);
            }
        }
        delta.sort_by(|a, b| a.id.cmp(&b.id));
        delta
    }
}

async fn poll_loop(
    mailbox: Mailbox,
    subscribers: Arc<SubscriberSet>,
    mut cursor: PollCursor,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    debug!(event = "file_poll_start", root = %mailbox.project_root().display());

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                match cursor.scan(&mailbox) {
                    Ok(delta) => {
                        for message in &delta {
                            subscribers.publish(message);
                        }
                    }
                    Err(err) => warn!(event = "file_poll_error", error = %err),
                }
            }
        }
    }

    debug!(event = "file_poll_stop", root = %mailbox.project_root().display());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::test_support::{at, message};
    use fmail_core::mailbox::FolderKind;
    use std::fs;
    use tempfile::TempDir;

    fn provider(dir: &TempDir, me: &str) -> FileProvider {
        let mut config = FileProviderConfig::new(dir.path(), me);
        config.poll_interval = Duration::from_millis(20);
        FileProvider::new(config)
    }

    async fn next(sub: &mut Subscription) -> Message {
        tokio::time::timeout(Duration::from_secs(3), sub.recv())
            .await
            .expect("delivery timeout")
            .expect("subscription open")
    }

    #[test]
    fn reads_tolerate_a_missing_mailbox() {
        let dir = TempDir::new().expect("temp dir");
        let provider = provider(&dir, "me");
        assert!(provider.topics().expect("topics").is_empty());
        assert!(provider
            .messages("builds", &MessageFilter::default())
            .expect("messages")
            .is_empty());
        assert!(provider.dm_conversations("me").expect("dms").is_empty());
        assert!(provider.agents().expect("agents").is_empty());
        assert!(provider
            .search(&SearchQuery::default())
            .expect("search")
            .is_empty());
        assert!(!provider.connection().configured);
    }

    #[test]
    fn agents_are_decoded_and_sorted_by_name() {
        let dir = TempDir::new().expect("temp dir");
        let provider = provider(&dir, "me");
        let agents_dir = provider.mailbox().base_dir().join("agents");
        fs::create_dir_all(&agents_dir).expect("mkdir");
        fs::write(
            agents_dir.join("zed.json"),
            r#"{"name":"zed","host":"build-01","last_seen":"2026-02-23T12:00:00Z"}"#,
        )
        .expect("write zed");
        fs::write(agents_dir.join("amy.json"), r#"{"name":"amy","status":"idle"}"#)
            .expect("write amy");
        fs::write(agents_dir.join("notes.txt"), "not an agent").expect("write notes");

        let agents = provider.agents().expect("agents");
        let names = agents.iter().map(|a| a.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["amy", "zed"]);
        assert_eq!(agents[0].status.as_deref(), Some("idle"));
        assert_eq!(agents[0].last_seen, None);
        assert_eq!(agents[1].host.as_deref(), Some("build-01"));
        assert_eq!(agents[1].last_seen, Some(at(12, 0, 0)));
    }

    #[test]
    fn summarises_topics_and_dm_conversations() {
        let dir = TempDir::new().expect("temp dir");
        let provider = provider(&dir, "me");
        let mailbox = provider.mailbox();
        let mut late = message("20260223-120500-0001", "bob", "builds");
        late.time = at(12, 5, 0);
        mailbox.append(&message("20260223-120000-0001", "alice", "builds")).expect("append");
        mailbox.append(&late).expect("append");
        mailbox.append(&message("20260223-120000-0002", "bob", "@me")).expect("append");
        mailbox.append(&message("20260223-120000-0003", "me", "@bob")).expect("append");
        mailbox.append(&message("20260223-120000-0004", "carol", "@bob")).expect("append");

        let topics = provider.topics().expect("topics");
        assert_eq!(topics.len(), 1);
        assert_eq!(topics[0].message_count, 2);
        assert_eq!(topics[0].participants, vec!["alice", "bob"]);
        assert_eq!(topics[0].last_activity, Some(at(12, 5, 0)));

        let conversations = provider.dm_conversations("me").expect("conversations");
        assert_eq!(conversations.len(), 1);
        assert_eq!(conversations[0].agent, "bob");
        assert_eq!(conversations[0].message_count, 2);

        let thread = provider.dms("@bob", &MessageFilter::default()).expect("dms");
        let ids = thread.iter().map(|m| m.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["20260223-120000-0002", "20260223-120000-0003"]);
    }

    #[test]
    fn search_keeps_newest_results_within_limit() {
        let dir = TempDir::new().expect("temp dir");
        let provider = provider(&dir, "me");
        for idx in 1..=5 {
            provider
                .mailbox()
                .append(&message(&format!("20260223-120000-000{idx}"), "alice", "builds"))
                .expect("append");
        }
        let results = provider
            .search(&SearchQuery {
                text: "body".to_string(),
                limit: Some(2),
                ..SearchQuery::default()
            })
            .expect("search");
        let ids = results.iter().map(|r| r.message.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["20260223-120000-0004", "20260223-120000-0005"]);
        assert_eq!(results[0].topic, "builds");
    }

    #[test]
    fn malformed_entry_fails_the_read() {
        let dir = TempDir::new().expect("temp dir");
        let provider = provider(&dir, "me");
        let topic_dir = provider.mailbox().topic_dir("builds").expect("topic dir");
        fs::create_dir_all(&topic_dir).expect("mkdir");
        fs::write(topic_dir.join("20260223-120000-0001.json"), b"nope").expect("write");

        let err = provider
            .messages("builds", &MessageFilter::default())
            .expect_err("decode error");
        assert!(matches!(err, ProviderError::Mailbox(MailboxError::Decode { .. })));
    }

    #[tokio::test]
    async fn subscription_delivers_only_new_messages() {
        let dir = TempDir::new().expect("temp dir");
        let provider = provider(&dir, "me");
        provider
            .mailbox()
            .append(&message("20260223-120000-0001", "alice", "builds"))
            .expect("append history");

        let mut sub = provider
            .subscribe(SubscriptionFilter::default())
            .expect("subscribe");
        provider
            .mailbox()
            .append(&message("20260223-120000-0002", "alice", "builds"))
            .expect("append live");
        provider
            .mailbox()
            .append(&message("20260223-120000-0003", "bob", "@me"))
            .expect("append dm");

        assert_eq!(next(&mut sub).await.id, "20260223-120000-0002");
        assert_eq!(next(&mut sub).await.id, "20260223-120000-0003");
    }

    #[tokio::test]
    async fn concurrent_subscribers_get_independent_streams() {
        let dir = TempDir::new().expect("temp dir");
        let provider = provider(&dir, "me");
        let mut everything = provider
            .subscribe(SubscriptionFilter::default())
            .expect("subscribe all");
        let mut deploys = provider
            .subscribe(SubscriptionFilter::topic("deploys"))
            .expect("subscribe deploys");

        provider
            .mailbox()
            .append(&message("20260223-120000-0001", "alice", "builds"))
            .expect("append");
        provider
            .mailbox()
            .append(&message("20260223-120000-0002", "alice", "deploys"))
            .expect("append");

        assert_eq!(next(&mut everything).await.id, "20260223-120000-0001");
        assert_eq!(next(&mut everything).await.id, "20260223-120000-0002");
        assert_eq!(next(&mut deploys).await.id, "20260223-120000-0002");

        everything.cancel();
        assert_eq!(provider.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn bad_entry_does_not_stop_polling() {
        let dir = TempDir::new().expect("temp dir");
        let provider = provider(&dir, "me");
        let mut sub = provider
            .subscribe(SubscriptionFilter::default())
            .expect("subscribe");

        let topic_dir = provider.mailbox().topic_dir("builds").expect("topic dir");
        fs::create_dir_all(&topic_dir).expect("mkdir");
        fs::write(topic_dir.join("20260223-120000-0001.json"), b"{broken").expect("write");
        tokio::time::sleep(Duration::from_millis(60)).await;
        provider
            .mailbox()
            .append(&message("20260223-120000-0002", "alice", "builds"))
            .expect("append");

        assert_eq!(next(&mut sub).await.id, "20260223-120000-0002");
    }

    #[tokio::test]
    async fn partially_written_entry_is_delivered_once_complete() {
        let dir = TempDir::new().expect("temp dir");
        let provider = provider(&dir, "me");
        let mut sub = provider
            .subscribe(SubscriptionFilter::default())
            .expect("subscribe");

        let full = serde_json::to_vec(&message("20260223-120000-0001", "alice", "builds"))
            .expect("encode");
        let topic_dir = provider.mailbox().topic_dir("builds").expect("topic dir");
        let path = topic_dir.join("20260223-120000-0001.json");
        fs::create_dir_all(&topic_dir).expect("mkdir");
        fs::write(&path, &full[..full.len() / 2]).expect("write half");
        tokio::time::sleep(Duration::from_millis(60)).await;
        fs::write(&path, &full).expect("write rest");

        let delivered = next(&mut sub).await;
        assert_eq!(delivered.id, "20260223-120000-0001");
        assert_eq!(delivered.body, "body of 20260223-120000-0001");
    }

    #[test]
    fn unreadable_folder_does_not_lose_other_folders() {
        let dir = TempDir::new().expect("temp dir");
        let mailbox = Mailbox::new(dir.path());
        mailbox
            .append(&message("20260223-120000-0001", "alice", "builds"))
            .expect("append");
        mailbox
            .append(&message("20260223-120000-0002", "bob", "@me"))
            .expect("append");
        let not_a_dir = dir.path().join("plain-file");
        fs::write(&not_a_dir, "x").expect("write");

        let mut folders = vec![Folder {
            kind: FolderKind::Topic,
            name: "broken".to_string(),
            path: not_a_dir.clone(),
        }];
        folders.extend(mailbox.folders().expect("folders"));

        let mut cursor = PollCursor::default();
        let delta = cursor.scan_folders(folders.clone());
        let ids = delta.iter().map(|m| m.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["20260223-120000-0001", "20260223-120000-0002"]);
        assert!(!cursor.last_seen.contains_key(&not_a_dir));

        assert!(cursor.scan_folders(folders).is_empty());
    }

    #[test]
    fn cursor_holds_at_a_failing_entry_until_it_reads() {
        let dir = TempDir::new().expect("temp dir");
        let mailbox = Mailbox::new(dir.path());
        mailbox
            .append(&message("20260223-120000-0001", "alice", "builds"))
            .expect("append");
        let mut cursor = PollCursor::default();
        assert_eq!(cursor.scan(&mailbox).expect("scan").len(), 1);

        let topic_dir = mailbox.topic_dir("builds").expect("topic dir");
        let pending = topic_dir.join("20260223-120000-0002.json");
        fs::write(&pending, b"{\"id\":").expect("write partial");
        mailbox
            .append(&message("20260223-120000-0003", "alice", "builds"))
            .expect("append");

        assert!(cursor.scan(&mailbox).expect("scan").is_empty());
        assert_eq!(
            cursor.last_seen.get(&topic_dir).map(String::as_str),
            Some("20260223-120000-0001")
        );

        let complete = serde_json::to_vec(&message("20260223-120000-0002", "alice", "builds"))
            .expect("encode");
        fs::write(&pending, complete).expect("complete");
        let ids = cursor
            .scan(&mailbox)
            .expect("scan")
            .into_iter()
            .map(|m| m.id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["20260223-120000-0002", "20260223-120000-0003"]);
    }

    #[test]
    fn entry_that_never_reads_is_skipped_after_retries() {
        let dir = TempDir::new().expect("temp dir");
        let mailbox = Mailbox::new(dir.path());
        let topic_dir = mailbox.topic_dir("builds").expect("topic dir");
        fs::create_dir_all(&topic_dir).expect("mkdir");
        fs::write(topic_dir.join("20260223-120000-0001.json"), b"{broken").expect("write");
        mailbox
            .append(&message("20260223-120000-0002", "alice", "builds"))
            .expect("append");

        let mut cursor = PollCursor::default();
        for _ in 1..MAX_READ_ATTEMPTS {
            assert!(cursor.scan(&mailbox).expect("scan").is_empty());
        }
        let delta = cursor.scan(&mailbox).expect("scan");
        assert_eq!(delta.len(), 1);
        assert_eq!(delta[0].id, "20260223-120000-0002");
        assert!(cursor.failures.is_empty());
    }
}
