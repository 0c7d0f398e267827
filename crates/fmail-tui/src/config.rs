use crate::notify::NotificationLimits;
use crate::provider::file::DEFAULT_POLL_INTERVAL;
use crate::provider::forged::DEFAULT_RECONNECT_INTERVAL;
use crate::provider::{ProviderOptions, DEFAULT_SUBSCRIBER_BUFFER};
use crate::state::StateStore;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Debug)]
pub struct Config {
    pub root: PathBuf,
    pub agent: String,
    pub forged_addr: Option<String>,
    pub poll_interval: Duration,
    pub reconnect_interval: Duration,
    pub subscriber_buffer: usize,
    pub state_path: PathBuf,
    pub notify_limits: NotificationLimits,
}

impl Config {
    pub fn provider_options(&self) -> ProviderOptions {
        let mut options = ProviderOptions::new(self.root.clone(), self.agent.clone());
        options.forged_addr = self.forged_addr.clone();
        options.poll_interval = self.poll_interval;
        options.reconnect_interval = self.reconnect_interval;
        options.subscriber_buffer = self.subscriber_buffer;
        options
    }
}

pub fn load_config() -> Config {
    load_config_from(|key| std::env::var(key).ok())
}

pub fn load_config_from(lookup: impl Fn(&str) -> Option<String>) -> Config {
    let value = |key: &str| {
        lookup(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    };

    let root = value("FMAIL_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
    let agent = value("FMAIL_AGENT")
        .or_else(|| value("USER"))
        .map(|agent| agent.trim_start_matches('@').to_string())
        .filter(|agent| !agent.is_empty())
        .unwrap_or_else(|| "operator".to_string());
    let state_path = value("FMAIL_STATE_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|| StateStore::default_path(&root));

    let defaults = NotificationLimits::default();
    let notify_limits = NotificationLimits {
        memory: resolve_number(value("FMAIL_NOTIFY_MEMORY_LIMIT"), defaults.memory),
        persist: resolve_number(value("FMAIL_NOTIFY_PERSIST_LIMIT"), defaults.persist),
    };

    Config {
        forged_addr: value("FMAIL_FORGED_ADDR"),
        poll_interval: Duration::from_millis(resolve_number(
            value("FMAIL_POLL_MS"),
            DEFAULT_POLL_INTERVAL.as_millis() as u64,
        )),
        reconnect_interval: Duration::from_secs(resolve_number(
            value("FMAIL_RECONNECT_SECS"),
            DEFAULT_RECONNECT_INTERVAL.as_secs(),
        )),
        subscriber_buffer: resolve_number(value("FMAIL_SUBSCRIBER_BUFFER"), DEFAULT_SUBSCRIBER_BUFFER),
        root,
        agent,
        state_path,
        notify_limits,
    }
}

/// Positive integers only; anything else keeps the default.
fn resolve_number<T>(value: Option<String>, default: T) -> T
where
    T: std::str::FromStr + PartialOrd + Default,
{
    value
        .and_then(|raw| raw.parse::<T>().ok())
        .filter(|parsed| *parsed > T::default())
        .unwrap_or(default)
}

pub fn parse_bool_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout_enabled = std::env::var("FMAIL_LOG_STDOUT")
        .ok()
        .and_then(|value| parse_bool_flag(&value))
        .unwrap_or(false);
    if stdout_enabled {
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::sink)
            .try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_with(pairs: &[(&str, &str)]) -> Config {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        load_config_from(|key| env.get(key).cloned())
    }

    #[test]
    fn parse_bool_flag_accepts_common_spellings() {
        assert_eq!(parse_bool_flag("1"), Some(true));
        assert_eq!(parse_bool_flag(" Yes "), Some(true));
        assert_eq!(parse_bool_flag("off"), Some(false));
        assert_eq!(parse_bool_flag("maybe"), None);
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = config_with(&[("FMAIL_ROOT", "/repo")]);
        assert_eq!(config.root, PathBuf::from("/repo"));
        assert_eq!(config.agent, "operator");
        assert_eq!(config.forged_addr, None);
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert_eq!(config.reconnect_interval, Duration::from_secs(2));
        assert_eq!(config.subscriber_buffer, 512);
        assert_eq!(config.notify_limits, NotificationLimits::default());
        assert_eq!(
            config.state_path,
            PathBuf::from("/repo/.fmail/tui-state.json")
        );
    }

    #[test]
    fn env_overrides_and_bad_numbers_fall_back() {
        let config = config_with(&[
            ("FMAIL_ROOT", "/repo"),
            ("USER", "fallback-user"),
            ("FMAIL_AGENT", "@reviewer"),
            ("FMAIL_FORGED_ADDR", "  tcp://127.0.0.1:7070 "),
            ("FMAIL_POLL_MS", "250"),
            ("FMAIL_RECONNECT_SECS", "0"),
            ("FMAIL_SUBSCRIBER_BUFFER", "lots"),
            ("FMAIL_NOTIFY_PERSIST_LIMIT", "10"),
        ]);
        assert_eq!(config.agent, "reviewer");
        assert_eq!(config.forged_addr.as_deref(), Some("tcp://127.0.0.1:7070"));
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.reconnect_interval, Duration::from_secs(2));
        assert_eq!(config.subscriber_buffer, 512);
        assert_eq!(config.notify_limits.persist, 10);

        let options = config.provider_options();
        assert_eq!(options.self_agent, "reviewer");
        assert_eq!(options.poll_interval, Duration::from_millis(250));
    }

    #[test]
    fn agent_falls_back_to_user() {
        let config = config_with(&[("FMAIL_ROOT", "/repo"), ("USER", "dana")]);
        assert_eq!(config.agent, "dana");
    }
}
