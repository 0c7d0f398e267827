pub mod forged_ipc;
pub mod mailbox;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

pub use mailbox::{Mailbox, MailboxError};

/// A single mailbox message. Immutable once observed; `id` is the only dedup key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub from: String,
    /// Topic name, or `@agent` for a direct message.
    pub to: String,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

impl Message {
    pub fn is_dm(&self) -> bool {
        self.to.starts_with('@')
    }

    pub fn topic(&self) -> Option<&str> {
        if self.is_dm() {
            None
        } else {
            Some(self.to.as_str())
        }
    }

    pub fn dm_target(&self) -> Option<&str> {
        self.to.strip_prefix('@')
    }

    pub fn has_any_tag<'a>(&self, wanted: impl IntoIterator<Item = &'a String>) -> bool {
        wanted.into_iter().any(|tag| self.tags.contains(tag))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            other => Err(format!("Unknown priority: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentRecord {
    pub name: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub first_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TopicInfo {
    pub name: String,
    pub message_count: usize,
    pub last_activity: Option<DateTime<Utc>>,
    #[serde(default)]
    pub participants: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DmConversation {
    /// The other side of the conversation.
    pub agent: String,
    pub message_count: usize,
    pub last_activity: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_message_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SearchResult {
    /// Topic name, or `@agent` for the DM folder the message was found in.
    pub topic: String,
    pub message: Message,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageFilter {
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub priority_min: Option<Priority>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Keep only the newest `limit` matches.
    #[serde(default)]
    pub limit: Option<usize>,
}

impl MessageFilter {
    pub fn matches(&self, message: &Message) -> bool {
        if self.since.is_some_and(|since| message.time < since) {
            return false;
        }
        if self.until.is_some_and(|until| message.time > until) {
            return false;
        }
        if let Some(from) = self.from.as_deref() {
            if message.from != from {
                return false;
            }
        }
        if self
            .priority_min
            .is_some_and(|min| message.priority < min)
        {
            return false;
        }
        if !self.tags.is_empty() && !message.has_any_tag(&self.tags) {
            return false;
        }
        true
    }

    /// Filters `messages` (expected in arrival order) and applies the tail limit.
    pub fn apply(&self, messages: Vec<Message>) -> Vec<Message> {
        let mut kept = messages
            .into_iter()
            .filter(|message| self.matches(message))
            .collect::<Vec<_>>();
        if let Some(limit) = self.limit {
            if kept.len() > limit {
                kept.drain(..kept.len() - limit);
            }
        }
        kept
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SearchQuery {
    /// Case-insensitive substring matched against the body.
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub priority_min: Option<Priority>,
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl SearchQuery {
    pub fn matches(&self, folder: &str, message: &Message) -> bool {
        if let Some(topic) = self.topic.as_deref() {
            if folder != topic {
                return false;
            }
        }
        if let Some(from) = self.from.as_deref() {
            if message.from != from {
                return false;
            }
        }
        if let Some(to) = self.to.as_deref() {
            if message.to != to {
                return false;
            }
        }
        if self.since.is_some_and(|since| message.time < since) {
            return false;
        }
        if self.until.is_some_and(|until| message.time > until) {
            return false;
        }
        if self
            .priority_min
            .is_some_and(|min| message.priority < min)
        {
            return false;
        }
        if !self.tags.is_empty() && !message.has_any_tag(&self.tags) {
            return false;
        }
        let needle = self.text.trim();
        if !needle.is_empty()
            && !message
                .body
                .to_lowercase()
                .contains(&needle.to_lowercase())
        {
            return false;
        }
        true
    }
}

/// Selects which live arrivals a subscription receives.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubscriptionFilter {
    /// `None` or `*` means every topic.
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub include_dm: bool,
    /// Restricts direct messages to those sent to or by this agent.
    #[serde(default)]
    pub agent: Option<String>,
}

impl Default for SubscriptionFilter {
    fn default() -> Self {
        Self {
            topic: None,
            include_dm: true,
            agent: None,
        }
    }
}

impl SubscriptionFilter {
    pub fn topic(topic: impl Into<String>) -> Self {
        Self {
            topic: Some(topic.into()),
            include_dm: false,
            agent: None,
        }
    }

    pub fn matches(&self, message: &Message) -> bool {
        match message.dm_target() {
            Some(target) => {
                if !self.include_dm {
                    return false;
                }
                match self.agent.as_deref() {
                    Some(agent) => target == agent || message.from == agent,
                    None => true,
                }
            }
            None => match self.topic.as_deref() {
                None | Some("*") | Some("") => true,
                Some(topic) => message.to == topic,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(hour: u32, min: u32, sec: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 23, hour, min, sec)
            .single()
            .expect("valid timestamp")
    }

    fn message(id: &str, to: &str, priority: Priority, tags: &[&str]) -> Message {
        Message {
            id: id.to_string(),
            from: "alice".to_string(),
            to: to.to_string(),
            time: ts(12, 0, 0),
            body: "deploy finished".to_string(),
            priority,
            tags: tags.iter().map(|tag| tag.to_string()).collect(),
            reply_to: None,
            host: None,
        }
    }

    #[test]
    fn priorities_are_totally_ordered() {
        assert!(Priority::Low < Priority::Normal);
        assert!(Priority::Normal < Priority::High);
        assert_eq!("HIGH".parse::<Priority>(), Ok(Priority::High));
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn dm_messages_have_no_topic() {
        let dm = message("m1", "@bob", Priority::Normal, &[]);
        assert!(dm.is_dm());
        assert_eq!(dm.topic(), None);
        assert_eq!(dm.dm_target(), Some("bob"));

        let broadcast = message("m2", "builds", Priority::Normal, &[]);
        assert_eq!(broadcast.topic(), Some("builds"));
    }

    #[test]
    fn filter_applies_threshold_tags_and_tail_limit() {
        let filter = MessageFilter {
            priority_min: Some(Priority::Normal),
            tags: vec!["auth".to_string(), "jwt".to_string()],
            limit: Some(1),
            ..MessageFilter::default()
        };
        let kept = filter.apply(vec![
            message("m1", "t", Priority::High, &["auth"]),
            message("m2", "t", Priority::Low, &["auth"]),
            message("m3", "t", Priority::Normal, &["jwt", "x"]),
            message("m4", "t", Priority::High, &["other"]),
        ]);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id, "m3");
    }

    #[test]
    fn subscription_filter_scopes_topics_and_dms() {
        let filter = SubscriptionFilter {
            topic: Some("builds".to_string()),
            include_dm: true,
            agent: Some("bob".to_string()),
        };
        assert!(filter.matches(&message("m1", "builds", Priority::Normal, &[])));
        assert!(!filter.matches(&message("m2", "deploys", Priority::Normal, &[])));
        assert!(filter.matches(&message("m3", "@bob", Priority::Normal, &[])));
        assert!(!filter.matches(&message("m4", "@carol", Priority::Normal, &[])));

        let topics_only = SubscriptionFilter::topic("*");
        assert!(topics_only.matches(&message("m5", "deploys", Priority::Normal, &[])));
        assert!(!topics_only.matches(&message("m6", "@bob", Priority::Normal, &[])));
    }

    #[test]
    fn search_query_is_case_insensitive_on_body() {
        let query = SearchQuery {
            text: "DEPLOY".to_string(),
            topic: Some("builds".to_string()),
            ..SearchQuery::default()
        };
        let msg = message("m1", "builds", Priority::Normal, &[]);
        assert!(query.matches("builds", &msg));
        assert!(!query.matches("other", &msg));
    }
}
