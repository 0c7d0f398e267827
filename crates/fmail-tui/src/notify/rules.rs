use crate::config::parse_bool_flag;
use fmail_core::{Message, Priority};
use globset::{Glob, GlobMatcher};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use thiserror::Error;

pub const DM_TO_SELF_RULE: &str = "dm-to-self";
pub const HIGH_PRIORITY_RULE: &str = "high-priority";

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("rule token {0:?} is not key=value")]
    MalformedToken(String),
    #[error("unknown rule key {0:?}")]
    UnknownKey(String),
    #[error("invalid boolean {value:?} for {key}")]
    InvalidBool { key: String, value: String },
    #[error("invalid priority {0:?}")]
    InvalidPriority(String),
    #[error("unknown action {0:?}")]
    UnknownAction(String),
    #[error("invalid {field} pattern {pattern:?}: {source}")]
    InvalidGlob {
        field: &'static str,
        pattern: String,
        #[source]
        source: globset::Error,
    },
    #[error("invalid text pattern: {0}")]
    InvalidRegex(#[from] regex::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationActions {
    #[serde(default)]
    pub bell: bool,
    #[serde(default)]
    pub badge: bool,
    #[serde(default)]
    pub flash: bool,
    #[serde(default)]
    pub highlight: bool,
}

impl NotificationActions {
    pub const NONE: Self = Self {
        bell: false,
        badge: false,
        flash: false,
        highlight: false,
    };

    pub fn is_empty(&self) -> bool {
        *self == Self::NONE
    }

    /// Parses a comma-separated subset of `bell,badge,flash,highlight`.
    pub fn parse(list: &str) -> Result<Self, RuleError> {
        let mut actions = Self::NONE;
        for item in list.split(',').map(str::trim).filter(|item| !item.is_empty()) {
            match item.to_ascii_lowercase().as_str() {
                "bell" => actions.bell = true,
                "badge" => actions.badge = true,
                "flash" => actions.flash = true,
                "highlight" => actions.highlight = true,
                _ => return Err(RuleError::UnknownAction(item.to_string())),
            }
        }
        Ok(actions)
    }

    fn names(&self) -> Vec<&'static str> {
        [
            (self.bell, "bell"),
            (self.badge, "badge"),
            (self.flash, "flash"),
            (self.highlight, "highlight"),
        ]
        .into_iter()
        .filter_map(|(set, name)| set.then_some(name))
        .collect()
    }
}

impl BitOr for NotificationActions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self {
            bell: self.bell || rhs.bell,
            badge: self.badge || rhs.badge,
            flash: self.flash || rhs.flash,
            highlight: self.highlight || rhs.highlight,
        }
    }
}

impl BitOrAssign for NotificationActions {
    fn bitor_assign(&mut self, rhs: Self) {
        *self = *self | rhs;
    }
}

impl fmt::Display for NotificationActions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.names().join(","))
    }
}

fn default_enabled() -> bool {
    true
}

/// Declarative alert rule. Empty fields impose no constraint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRule {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub topic: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub from: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,
    #[serde(default)]
    pub actions: NotificationActions,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl Default for NotificationRule {
    fn default() -> Self {
        Self {
            name: String::new(),
            topic: String::new(),
            from: String::new(),
            to: String::new(),
            priority: None,
            tags: Vec::new(),
            text: String::new(),
            actions: NotificationActions::NONE,
            enabled: true,
        }
    }
}

impl NotificationRule {
    /// Renders the rule back into its `key=value` form.
    pub fn to_spec(&self) -> String {
        let mut tokens = Vec::new();
        let fields = [
            ("name", &self.name),
            ("topic", &self.topic),
            ("from", &self.from),
            ("to", &self.to),
        ];
        for (key, value) in fields {
            if !value.is_empty() {
                tokens.push(format!("{key}={value}"));
            }
        }
        if let Some(priority) = self.priority {
            tokens.push(format!("priority={priority}"));
        }
        if !self.tags.is_empty() {
            tokens.push(format!("tags={}", self.tags.join(",")));
        }
        if !self.text.is_empty() {
            tokens.push(format!("text={}", self.text));
        }
        if !self.actions.is_empty() {
            tokens.push(format!("actions={}", self.actions));
        }
        if !self.enabled {
            tokens.push("enabled=false".to_string());
        }
        tokens.join(" ")
    }
}

/// Parses `key=value` tokens separated by whitespace.
///
/// Keys: `name topic from to priority tags text actions enabled`.
pub fn parse_rule_spec(spec: &str) -> Result<NotificationRule, RuleError> {
    let mut rule = NotificationRule::default();
    for token in spec.split_whitespace() {
        let Some((key, value)) = token.split_once('=') else {
            return Err(RuleError::MalformedToken(token.to_string()));
        };
        match key.to_ascii_lowercase().as_str() {
            "name" => rule.name = value.to_string(),
            "topic" => rule.topic = value.to_string(),
            "from" => rule.from = value.to_string(),
            "to" => rule.to = value.to_string(),
            "priority" => {
                rule.priority = Some(
                    value
                        .parse::<Priority>()
                        .map_err(|_| RuleError::InvalidPriority(value.to_string()))?,
                );
            }
            "tags" => {
                rule.tags = value
                    .split(',')
                    .map(str::trim)
                    .filter(|tag| !tag.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            "text" => rule.text = value.to_string(),
            "actions" => rule.actions = NotificationActions::parse(value)?,
            "enabled" => {
                rule.enabled = parse_bool_flag(value).ok_or_else(|| RuleError::InvalidBool {
                    key: key.to_string(),
                    value: value.to_string(),
                })?;
            }
            _ => return Err(RuleError::UnknownKey(key.to_string())),
        }
    }
    CompiledRule::compile(&rule)?;
    Ok(rule)
}

/// The two rules installed when nothing else is configured.
pub fn default_rules(self_agent: &str) -> Vec<NotificationRule> {
    let self_agent = self_agent.trim_start_matches('@');
    vec![
        NotificationRule {
            name: DM_TO_SELF_RULE.to_string(),
            to: format!("@{self_agent}"),
            actions: NotificationActions {
                bell: true,
                badge: true,
                highlight: true,
                ..NotificationActions::NONE
            },
            ..NotificationRule::default()
        },
        NotificationRule {
            name: HIGH_PRIORITY_RULE.to_string(),
            topic: "*".to_string(),
            priority: Some(Priority::High),
            actions: NotificationActions {
                badge: true,
                flash: true,
                ..NotificationActions::NONE
            },
            ..NotificationRule::default()
        },
    ]
}

/// Only `*` is special; every other character matches literally.
fn compile_glob(field: &'static str, pattern: &str) -> Result<Option<GlobMatcher>, RuleError> {
    if pattern.is_empty() {
        return Ok(None);
    }
    let escaped = pattern
        .split('*')
        .map(globset::escape)
        .collect::<Vec<_>>()
        .join("*");
    let glob = Glob::new(&escaped).map_err(|source| RuleError::InvalidGlob {
        field,
        pattern: pattern.to_string(),
        source,
    })?;
    Ok(Some(glob.compile_matcher()))
}

#[derive(Debug, Clone)]
pub struct CompiledRule {
    rule: NotificationRule,
    topic: Option<GlobMatcher>,
    from: Option<GlobMatcher>,
    to: Option<GlobMatcher>,
    text: Option<Regex>,
}

impl CompiledRule {
    pub fn compile(rule: &NotificationRule) -> Result<Self, RuleError> {
        let text = if rule.text.is_empty() {
            None
        } else {
            Some(Regex::new(&rule.text)?)
        };
        Ok(Self {
            topic: compile_glob("topic", &rule.topic)?,
            from: compile_glob("from", &rule.from)?,
            to: compile_glob("to", &rule.to)?,
            text,
            rule: rule.clone(),
        })
    }

    pub fn rule(&self) -> &NotificationRule {
        &self.rule
    }

    pub fn actions(&self) -> NotificationActions {
        self.rule.actions
    }

    pub fn matches(&self, message: &Message) -> bool {
        if !self.rule.enabled {
            return false;
        }
        if let Some(topic) = &self.topic {
            match message.topic() {
                Some(name) if topic.is_match(name) => {}
                _ => return false,
            }
        }
        if let Some(from) = &self.from {
            if !from.is_match(&message.from) {
                return false;
            }
        }
        if let Some(to) = &self.to {
            if !to.is_match(&message.to) {
                return false;
            }
        }
        if let Some(min) = self.rule.priority {
            if message.priority < min {
                return false;
            }
        }
        if !self.rule.tags.is_empty() && !message.has_any_tag(&self.rule.tags) {
            return false;
        }
        if let Some(text) = &self.text {
            if !text.is_match(&message.body) {
                return false;
            }
        }
        true
    }
}

/// Union of the actions of every enabled rule that matches.
pub fn evaluate(rules: &[CompiledRule], message: &Message) -> NotificationActions {
    rules
        .iter()
        .filter(|rule| rule.matches(message))
        .fold(NotificationActions::NONE, |acc, rule| acc | rule.actions())
}
