use super::file::{FileProvider, FileProviderConfig, DEFAULT_POLL_INTERVAL};
use super::forged::{BrokerAddr, ForgedConfig, ForgedProvider, DEFAULT_RECONNECT_INTERVAL};
use super::hybrid::HybridProvider;
use super::{MessageProvider, ProviderError, DEFAULT_SUBSCRIBER_BUFFER};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct ProviderOptions {
    pub root: PathBuf,
    pub self_agent: String,
    /// Explicit broker address. When set, failing to reach it is fatal.
    pub forged_addr: Option<String>,
    pub poll_interval: Duration,
    pub reconnect_interval: Duration,
    pub subscriber_buffer: usize,
}

impl ProviderOptions {
    pub fn new(root: impl Into<PathBuf>, self_agent: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            self_agent: self_agent.into(),
            forged_addr: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
        }
    }
}

#[derive(Clone)]
pub enum ProviderSelection {
    File(FileProvider),
    Hybrid(HybridProvider),
}

impl ProviderSelection {
    pub fn mode(&self) -> &'static str {
        match self {
            ProviderSelection::File(_) => "file",
            ProviderSelection::Hybrid(_) => "hybrid",
        }
    }

    pub fn into_provider(self) -> Arc<dyn MessageProvider> {
        match self {
            ProviderSelection::File(provider) => Arc::new(provider),
            ProviderSelection::Hybrid(provider) => Arc::new(provider),
        }
    }
}

/// Builds the provider for this session.
///
/// No explicit address and no socket under the mailbox root means plain
/// polling. A broker that cannot be reached is an error when its address was
/// given explicitly and silently ignored when it was only detected.
pub async fn select_provider(
    options: &ProviderOptions,
) -> Result<ProviderSelection, ProviderError> {
    let mut file_config = FileProviderConfig::new(options.root.clone(), options.self_agent.clone());
    file_config.poll_interval = options.poll_interval;
    file_config.subscriber_buffer = options.subscriber_buffer;
    let file = FileProvider::new(file_config);

    let explicit = options
        .forged_addr
        .as_deref()
        .map(str::trim)
        .filter(|raw| !raw.is_empty());
    let addr = match explicit {
        Some(raw) => BrokerAddr::parse(raw)?,
        None => {
            let socket = file.mailbox().socket_path();
            if !socket.exists() {
                info!(event = "provider_selected", mode = "file", root = %options.root.display());
                return Ok(ProviderSelection::File(file));
            }
            BrokerAddr::Unix(socket)
        }
    };

    let mut config = ForgedConfig::new(addr, options.self_agent.clone());
    config.reconnect_interval = options.reconnect_interval;
    config.subscriber_buffer = options.subscriber_buffer;

    match ForgedProvider::connect(config, Some(file.clone())).await {
        Ok(forged) => {
            info!(event = "provider_selected", mode = "hybrid", addr = %forged.addr());
            Ok(ProviderSelection::Hybrid(
                HybridProvider::new(file, forged).with_subscriber_buffer(options.subscriber_buffer),
            ))
        }
        Err(err) if explicit.is_some() => Err(err),
        Err(err) => {
            warn!(event = "forged_autodetect_skipped", error = %err);
            Ok(ProviderSelection::File(file))
        }
    }
}
