pub mod rules;

use crate::lock_or_recover;
use crate::provider::{MessageProvider, ProviderError};
use crate::state::StateStore;
use chrono::{DateTime, Utc};
use fmail_core::{Message, SearchQuery};
use rules::{default_rules, evaluate, CompiledRule, NotificationActions, NotificationRule, RuleError};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_MEMORY_LIMIT: usize = 50;
pub const DEFAULT_PERSIST_LIMIT: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotificationLimits {
    pub memory: usize,
    /// Newest entries written to the state store; kept below `memory`.
    pub persist: usize,
}

impl Default for NotificationLimits {
    fn default() -> Self {
        Self {
            memory: DEFAULT_MEMORY_LIMIT,
            persist: DEFAULT_PERSIST_LIMIT,
        }
    }
}

impl NotificationLimits {
    fn normalized(self) -> Self {
        let memory = self.memory.max(1);
        Self {
            memory,
            persist: self.persist.min(memory - 1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub message_id: String,
    pub message: Message,
    pub actions: NotificationActions,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub read: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreviewResult {
    pub matched: usize,
    pub scanned: usize,
}

#[derive(Debug, Error)]
pub enum PreviewError {
    #[error(transparent)]
    Rule(#[from] RuleError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

struct CenterState {
    rules: Arc<Vec<CompiledRule>>,
    seen: HashSet<String>,
    /// Oldest first.
    log: VecDeque<Notification>,
}

/// Single lock around rules, the seen set and the log; safe to share between
/// the delivery path and the UI.
pub struct NotificationCenter {
    limits: NotificationLimits,
    state: Mutex<CenterState>,
    store: Option<Arc<StateStore>>,
}

impl NotificationCenter {
    /// In-memory center with the built-in rules for `self_agent`.
    pub fn new(self_agent: &str, limits: NotificationLimits) -> Self {
        Self {
            limits: limits.normalized(),
            state: Mutex::new(CenterState {
                rules: Arc::new(compile_or_skip(&default_rules(self_agent))),
                seen: HashSet::new(),
                log: VecDeque::new(),
            }),
            store: None,
        }
    }

    /// Rehydrates the persisted tail and rules from `store` and persists every
    /// later mutation back into it.
    pub fn with_store(self_agent: &str, limits: NotificationLimits, store: Arc<StateStore>) -> Self {
        let limits = limits.normalized();
        let persisted = store.notifications();
        let skip = persisted.len().saturating_sub(limits.persist);
        let log: VecDeque<Notification> = persisted.into_iter().skip(skip).collect();
        let seen = log.iter().map(|entry| entry.message_id.clone()).collect();

        let stored_rules = store.notification_rules();
        let rules = if stored_rules.is_empty() {
            compile_or_skip(&default_rules(self_agent))
        } else {
            compile_or_skip(&stored_rules)
        };
        debug!(
            event = "notifications_restored",
            entries = log.len(),
            rules = rules.len()
        );

        Self {
            limits,
            state: Mutex::new(CenterState {
                rules: Arc::new(rules),
                seen,
                log,
            }),
            store: Some(store),
        }
    }

    pub fn limits(&self) -> NotificationLimits {
        self.limits
    }

    /// Returns the unioned actions and whether a new notification was logged.
    /// A message id is evaluated at most once.
    pub fn process_message(&self, message: &Message) -> (NotificationActions, bool) {
        let mut state = lock_or_recover(&self.state);
        if !state.seen.insert(message.id.clone()) {
            return (NotificationActions::NONE, false);
        }
        let actions = evaluate(&state.rules, message);
        if actions.is_empty() {
            return (NotificationActions::NONE, false);
        }

        state.log.push_back(Notification {
            message_id: message.id.clone(),
            message: message.clone(),
            actions,
            created_at: Utc::now(),
            read: false,
        });
        while state.log.len() > self.limits.memory {
            state.log.pop_front();
        }
        self.persist(&state);
        (actions, true)
    }

    pub fn mark_read(&self, message_id: &str) -> bool {
        let mut state = lock_or_recover(&self.state);
        let Some(entry) = state
            .log
            .iter_mut()
            .find(|entry| entry.message_id == message_id)
        else {
            return false;
        };
        if !entry.read {
            entry.read = true;
            self.persist(&state);
        }
        true
    }

    pub fn mark_all_read(&self) -> usize {
        let mut state = lock_or_recover(&self.state);
        let mut changed = 0;
        for entry in state.log.iter_mut().filter(|entry| !entry.read) {
            entry.read = true;
            changed += 1;
        }
        if changed > 0 {
            self.persist(&state);
        }
        changed
    }

    pub fn dismiss(&self, message_id: &str) -> bool {
        let mut state = lock_or_recover(&self.state);
        let Some(index) = state
            .log
            .iter()
            .position(|entry| entry.message_id == message_id)
        else {
            return false;
        };
        state.log.remove(index);
        self.persist(&state);
        true
    }

    pub fn unread_count(&self) -> usize {
        lock_or_recover(&self.state)
            .log
            .iter()
            .filter(|entry| !entry.read)
            .count()
    }

    /// Newest first.
    pub fn notifications(&self) -> Vec<Notification> {
        lock_or_recover(&self.state).log.iter().rev().cloned().collect()
    }

    pub fn rules(&self) -> Vec<NotificationRule> {
        let rules = lock_or_recover(&self.state).rules.clone();
        rules.iter().map(|rule| rule.rule().clone()).collect()
    }

    /// Replaces the rule set; nothing is installed if any rule fails to compile.
    pub fn set_rules(&self, rules: Vec<NotificationRule>) -> Result<(), RuleError> {
        let compiled = rules
            .iter()
            .map(CompiledRule::compile)
            .collect::<Result<Vec<_>, _>>()?;
        let mut state = lock_or_recover(&self.state);
        state.rules = Arc::new(compiled);
        self.persist(&state);
        Ok(())
    }

    /// Counts how many of the newest `limit` search results `rule` would match.
    /// Touches neither rules, seen set nor log.
    pub fn preview_matches(
        &self,
        rule: &NotificationRule,
        provider: &dyn MessageProvider,
        limit: usize,
    ) -> Result<PreviewResult, PreviewError> {
        let compiled = CompiledRule::compile(rule)?;
        if limit == 0 {
            return Ok(PreviewResult {
                matched: 0,
                scanned: 0,
            });
        }
        let query = SearchQuery {
            limit: Some(limit),
            ..SearchQuery::default()
        };
        let results = provider.search(&query)?;
        let scanned: Vec<&Message> = results.iter().take(limit).map(|hit| &hit.message).collect();
        let matched = scanned
            .iter()
            .filter(|message| compiled.matches(message))
            .count();
        Ok(PreviewResult {
            matched,
            scanned: scanned.len(),
        })
    }

    fn persist(&self, state: &CenterState) {
        let Some(store) = &self.store else {
            return;
        };
        let skip = state.log.len().saturating_sub(self.limits.persist);
        store.set_notifications(state.log.iter().skip(skip).cloned().collect());
        store.set_notification_rules(state.rules.iter().map(|rule| rule.rule().clone()).collect());
        if let Err(err) = store.save_now() {
            warn!(event = "notifications_persist_failed", error = %err);
        }
    }
}

fn compile_or_skip(rules: &[NotificationRule]) -> Vec<CompiledRule> {
    rules
        .iter()
        .filter_map(|rule| match CompiledRule::compile(rule) {
            Ok(compiled) => Some(compiled),
            Err(err) => {
                warn!(event = "notification_rule_skipped", rule = %rule.name, error = %err);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::rules::parse_rule_spec;
    use super::*;
    use crate::provider::file::{FileProvider, FileProviderConfig};
    use crate::provider::test_support::message;
    use fmail_core::Priority;
    use tempfile::TempDir;

    fn center() -> NotificationCenter {
        NotificationCenter::new("me", NotificationLimits::default())
    }

    fn dm(id: &str) -> Message {
        message(id, "alice", "@me")
    }

    #[test]
    fn processing_is_idempotent_per_message_id() {
        let center = center();
        let (actions, is_new) = center.process_message(&dm("m1"));
        assert!(is_new);
        assert!(actions.bell);

        let (actions, is_new) = center.process_message(&dm("m1"));
        assert!(!is_new);
        assert!(actions.is_empty());
        assert_eq!(center.notifications().len(), 1);
        assert_eq!(center.unread_count(), 1);
    }

    #[test]
    fn unmatched_messages_are_seen_but_not_logged() {
        let center = center();
        let quiet = message("m1", "alice", "builds");
        assert_eq!(center.process_message(&quiet), (NotificationActions::NONE, false));
        center
            .set_rules(vec![parse_rule_spec("topic=builds actions=badge").expect("parse")])
            .expect("set rules");
        assert_eq!(center.process_message(&quiet), (NotificationActions::NONE, false));
        assert!(center.notifications().is_empty());
    }

    #[test]
    fn memory_limit_evicts_oldest() {
        let center = center();
        for idx in 0..60 {
            center.process_message(&dm(&format!("m{idx:02}")));
        }
        let log = center.notifications();
        assert_eq!(log.len(), DEFAULT_MEMORY_LIMIT);
        assert_eq!(log[0].message_id, "m59");
        assert_eq!(log[log.len() - 1].message_id, "m10");
    }

    #[test]
    fn persist_limit_stays_below_memory_limit() {
        let limits = NotificationLimits {
            memory: 50,
            persist: 100,
        };
        assert_eq!(limits.normalized().persist, 49);
        let tiny = NotificationLimits {
            memory: 0,
            persist: 5,
        };
        assert_eq!(
            tiny.normalized(),
            NotificationLimits {
                memory: 1,
                persist: 0
            }
        );

        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("state.json");
        let store = Arc::new(StateStore::load(&path).expect("load"));
        let center = NotificationCenter::with_store("me", limits, store);
        for idx in 0..60 {
            center.process_message(&dm(&format!("m{idx:02}")));
        }
        assert_eq!(center.notifications().len(), 50);
        let reloaded = StateStore::load(&path).expect("reload");
        assert_eq!(reloaded.notifications().len(), 49);
    }

    #[test]
    fn read_and_dismiss_report_whether_the_id_was_found() {
        let center = center();
        center.process_message(&dm("m1"));
        center.process_message(&dm("m2"));

        assert!(center.mark_read("m1"));
        assert!(!center.mark_read("missing"));
        assert_eq!(center.unread_count(), 1);

        assert!(center.dismiss("m2"));
        assert!(!center.dismiss("m2"));
        assert_eq!(center.unread_count(), 0);
        assert_eq!(center.notifications().len(), 1);

        center.process_message(&dm("m3"));
        center.process_message(&dm("m4"));
        assert_eq!(center.mark_all_read(), 2);
        assert_eq!(center.unread_count(), 0);
    }

    #[test]
    fn set_rules_is_all_or_nothing() {
        let center = center();
        let before = center.rules();
        let good = parse_rule_spec("name=ok topic=* actions=bell").expect("parse");
        let bad = NotificationRule {
            name: "bad".to_string(),
            text: "(unclosed".to_string(),
            ..NotificationRule::default()
        };
        assert!(center.set_rules(vec![good.clone(), bad]).is_err());
        assert_eq!(center.rules(), before);

        center.set_rules(vec![good.clone()]).expect("set rules");
        assert_eq!(center.rules(), vec![good]);
    }

    #[test]
    fn reload_restores_only_the_persisted_tail() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("state.json");
        let store = Arc::new(StateStore::load(&path).expect("load"));
        let center =
            NotificationCenter::with_store("me", NotificationLimits::default(), store.clone());
        for idx in 0..60 {
            center.process_message(&dm(&format!("m{idx:02}")));
        }
        center.mark_read("m59");

        let reloaded_store = Arc::new(StateStore::load(&path).expect("reload"));
        let restored =
            NotificationCenter::with_store("me", NotificationLimits::default(), reloaded_store);
        let log = restored.notifications();
        assert_eq!(log.len(), DEFAULT_PERSIST_LIMIT);
        assert_eq!(log[0].message_id, "m59");
        assert!(log[0].read);
        assert_eq!(restored.unread_count(), DEFAULT_PERSIST_LIMIT - 1);

        assert!(!restored.process_message(&dm("m59")).1);
        assert!(restored.process_message(&dm("m60")).1);
    }

    #[test]
    fn stored_rules_replace_the_defaults() {
        let dir = TempDir::new().expect("temp dir");
        let store = Arc::new(StateStore::new(dir.path().join("state.json")));
        let center = NotificationCenter::with_store("me", NotificationLimits::default(), store);
        let custom = parse_rule_spec("name=deploys topic=deploys actions=flash").expect("parse");
        center.set_rules(vec![custom.clone()]).expect("set rules");

        let reloaded = Arc::new(StateStore::load(dir.path().join("state.json")).expect("load"));
        let restored = NotificationCenter::with_store("me", NotificationLimits::default(), reloaded);
        assert_eq!(restored.rules(), vec![custom]);
        assert!(!restored.process_message(&dm("m1")).1);
    }

    #[test]
    fn preview_counts_without_mutating() {
        let dir = TempDir::new().expect("temp dir");
        let provider = FileProvider::new(FileProviderConfig::new(dir.path(), "me"));
        for idx in 0..5 {
            let mut entry = message(&format!("m{idx}"), "alice", "builds");
            if idx % 2 == 0 {
                entry.priority = Priority::High;
            }
            provider.mailbox().append(&entry).expect("append");
        }

        let center = center();
        center.process_message(&dm("d1"));
        let rules_before = center.rules();
        let log_before = center.notifications();

        let rule = parse_rule_spec("priority=high actions=badge").expect("parse");
        let preview = center.preview_matches(&rule, &provider, 4).expect("preview");
        assert_eq!(preview, PreviewResult { matched: 2, scanned: 4 });

        let all = center.preview_matches(&rule, &provider, 50).expect("preview");
        assert_eq!(all, PreviewResult { matched: 3, scanned: 5 });

        assert_eq!(center.rules(), rules_before);
        assert_eq!(center.notifications(), log_before);
        assert!(center.process_message(&message("m0", "alice", "@me")).1);
    }
}
