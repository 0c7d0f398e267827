use super::file::FileProvider;
use super::{
    ConnectionProbe, MessageProvider, ProviderError, SubscriberSet, Subscription,
    DEFAULT_SUBSCRIBER_BUFFER,
};
use chrono::Utc;
use fmail_core::forged_ipc::{
    encode_frame, DecodeReport, HelloPayload, NdjsonFrameDecoder, ProtocolVersion, WatchPayload,
    WireEnvelope, WireMsg, DEFAULT_MAX_FRAME_BYTES,
};
use fmail_core::{
    AgentRecord, DmConversation, Message, MessageFilter, SearchQuery, SearchResult,
    SubscriptionFilter, TopicInfo,
};
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerAddr {
    Unix(PathBuf),
    Tcp(String),
}

impl BrokerAddr {
    /// Accepts `unix:<path>`, a bare path, `tcp://host:port` or `host:port`.
    pub fn parse(raw: &str) -> Result<Self, ProviderError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ProviderError::InvalidAddress(raw.to_string()));
        }
        if let Some(path) = raw.strip_prefix("unix:") {
            let path = path.trim_start_matches("//");
            if path.is_empty() {
                return Err(ProviderError::InvalidAddress(raw.to_string()));
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }
        if let Some(addr) = raw.strip_prefix("tcp://").or_else(|| raw.strip_prefix("tcp:")) {
            return Self::tcp(addr, raw);
        }
        if raw.contains('/') || raw.ends_with(".sock") {
            return Ok(Self::Unix(PathBuf::from(raw)));
        }
        Self::tcp(raw, raw)
    }

    fn tcp(addr: &str, raw: &str) -> Result<Self, ProviderError> {
        match addr.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                Ok(Self::Tcp(addr.to_string()))
            }
            _ => Err(ProviderError::InvalidAddress(raw.to_string())),
        }
    }
}

impl fmt::Display for BrokerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerAddr::Unix(path) => write!(f, "unix:{}", path.display()),
            BrokerAddr::Tcp(addr) => write!(f, "tcp:{addr}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ForgedConfig {
    pub addr: BrokerAddr,
    pub agent: String,
    pub client_id: String,
    pub reconnect_interval: Duration,
    pub dial_timeout: Duration,
    pub subscriber_buffer: usize,
}

impl ForgedConfig {
    pub fn new(addr: BrokerAddr, agent: impl Into<String>) -> Self {
        Self {
            addr,
            agent: agent.into(),
            client_id: format!("fmail-tui-{}", std::process::id()),
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
        }
    }
}

/// Push-based provider backed by a live `forged` broker.
///
/// A background task owns the connection: it pumps `message` frames into the
/// subscriber fan-out and, whenever the connection drops, redials on a fixed
/// interval. Subscriptions survive reconnects untouched.
#[derive(Clone)]
pub struct ForgedProvider {
    inner: Arc<ForgedInner>,
}

struct ForgedInner {
    config: ForgedConfig,
    fallback: Option<FileProvider>,
    subscribers: Arc<SubscriberSet>,
    connected: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
}

impl Drop for ForgedInner {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

impl ForgedProvider {
    /// Dials the broker; an unreachable broker is an error even with a fallback.
    pub async fn connect(
        config: ForgedConfig,
        fallback: Option<FileProvider>,
    ) -> Result<Self, ProviderError> {
        let session = dial(&config).await?;
        info!(event = "forged_connected", addr = %config.addr);
        Ok(Self::start(config, fallback, Some(session)))
    }

    /// Starts disconnected and lets the reconnect loop find the broker.
    pub fn connect_lazy(config: ForgedConfig, fallback: FileProvider) -> Self {
        Self::start(config, Some(fallback), None)
    }

    fn start(
        config: ForgedConfig,
        fallback: Option<FileProvider>,
        session: Option<BrokerSession>,
    ) -> Self {
        let subscribers = SubscriberSet::new(config.subscriber_buffer);
        let connected = Arc::new(AtomicBool::new(session.is_some()));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let link = BrokerLink {
            config: config.clone(),
            subscribers: subscribers.clone(),
            connected: connected.clone(),
        };
        tokio::spawn(link.run(session, shutdown_rx));

        Self {
            inner: Arc::new(ForgedInner {
                config,
                fallback,
                subscribers,
                connected,
                shutdown,
            }),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    pub fn addr(&self) -> &BrokerAddr {
        &self.inner.config.addr
    }

    /// Read queries are answered from the mailbox the broker persists into.
    fn reader(&self) -> Result<&FileProvider, ProviderError> {
        match self.inner.fallback.as_ref() {
            Some(fallback) => Ok(fallback),
            None if self.is_connected() => Err(ProviderError::Unavailable(format!(
                "broker {} pushes messages only and no mailbox fallback is configured",
                self.inner.config.addr
            ))),
            None => Err(ProviderError::NotConnected(
                self.inner.config.addr.to_string(),
            )),
        }
    }
}

impl MessageProvider for ForgedProvider {
    fn topics(&self) -> Result<Vec<TopicInfo>, ProviderError> {
        self.reader()?.topics()
    }

    fn messages(&self, topic: &str, filter: &MessageFilter) -> Result<Vec<Message>, ProviderError> {
        self.reader()?.messages(topic, filter)
    }

    fn dm_conversations(&self, agent: &str) -> Result<Vec<DmConversation>, ProviderError> {
        self.reader()?.dm_conversations(agent)
    }

    fn dms(&self, agent: &str, filter: &MessageFilter) -> Result<Vec<Message>, ProviderError> {
        self.reader()?.dms(agent, filter)
    }

    fn agents(&self) -> Result<Vec<AgentRecord>, ProviderError> {
        self.reader()?.agents()
    }

    fn search(&self, query: &SearchQuery) -> Result<Vec<SearchResult>, ProviderError> {
        self.reader()?.search(query)
    }

    fn subscribe(&self, filter: SubscriptionFilter) -> Result<Subscription, ProviderError> {
        Ok(self.inner.subscribers.subscribe(filter))
    }

    fn connection(&self) -> ConnectionProbe {
        ConnectionProbe {
            configured: true,
            connected: self.is_connected(),
            method: self.inner.config.addr.to_string(),
        }
    }
}

type BrokerReader = Box<dyn AsyncRead + Send + Unpin>;
type BrokerWriter = Box<dyn AsyncWrite + Send + Unpin>;

struct BrokerSession {
    reader: BrokerReader,
    // Held so the broker does not see a half-closed peer.
    _writer: BrokerWriter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PumpOutcome {
    Dropped,
    Shutdown,
}

/// State owned by the connection task; holds no reference to the provider so
/// dropping the provider ends the task.
struct BrokerLink {
    config: ForgedConfig,
    subscribers: Arc<SubscriberSet>,
    connected: Arc<AtomicBool>,
}

impl BrokerLink {
    async fn run(self, initial: Option<BrokerSession>, mut shutdown: watch::Receiver<bool>) {
        let mut session = initial;
        loop {
            if let Some(active) = session.take() {
                self.connected.store(true, Ordering::Release);
                let outcome = self.pump(active, &mut shutdown).await;
                self.connected.store(false, Ordering::Release);
                if outcome == PumpOutcome::Shutdown {
                    break;
                }
                warn!(event = "forged_disconnected", addr = %self.config.addr);
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                _ = tokio::time::sleep(self.config.reconnect_interval) => {}
            }

            match dial(&self.config).await {
                Ok(next) => {
                    info!(event = "forged_reconnected", addr = %self.config.addr);
                    session = Some(next);
                }
                Err(err) => debug!(event = "forged_reconnect_failed", error = %err),
            }
        }
        self.connected.store(false, Ordering::Release);
        debug!(event = "forged_link_stop", addr = %self.config.addr);
    }

    async fn pump(
        &self,
        session: BrokerSession,
        shutdown: &mut watch::Receiver<bool>,
    ) -> PumpOutcome {
        let BrokerSession {
            mut reader,
            _writer,
        } = session;
        let mut decoder = NdjsonFrameDecoder::<WireEnvelope>::new(DEFAULT_MAX_FRAME_BYTES);
        let mut read_buf = [0u8; 8192];

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return PumpOutcome::Shutdown;
                    }
                }
                read = reader.read(&mut read_buf) => {
                    let read = match read {
                        Ok(value) => value,
                        Err(err) => {
                            warn!(event = "forged_read_error", error = %err);
                            return PumpOutcome::Dropped;
                        }
                    };
                    if read == 0 {
                        self.dispatch(decoder.finish());
                        return PumpOutcome::Dropped;
                    }
                    self.dispatch(decoder.push_chunk(&read_buf[..read]));
                }
            }
        }
    }

    fn dispatch(&self, report: DecodeReport<WireEnvelope>) {
        for err in report.errors {
            warn!(event = "forged_decode_error", error = %err);
        }
        for envelope in report.frames {
            if !envelope.version.is_supported() {
                debug!(event = "forged_skip_version", version = envelope.version.0);
                continue;
            }
            match envelope.msg {
                WireMsg::Message(message) => {
                    self.subscribers.publish(&message);
                }
                WireMsg::Heartbeat(_) => {}
                WireMsg::Error(payload) => {
                    warn!(
                        event = "forged_broker_error",
                        code = %payload.code,
                        message = %payload.message
                    );
                }
                _ => debug!(event = "forged_ignored_frame", sender = %envelope.sender_id),
            }
        }
    }
}

async fn dial(config: &ForgedConfig) -> Result<BrokerSession, ProviderError> {
    let (reader, mut writer) = tokio::time::timeout(config.dial_timeout, open_stream(&config.addr))
        .await
        .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::TimedOut, "dial timed out")))
        .map_err(|source| ProviderError::Connect {
            addr: config.addr.to_string(),
            source,
        })?;

    for envelope in [build_hello(config), build_watch(config)] {
        send_envelope(&mut writer, &envelope)
            .await
            .map_err(|err| ProviderError::Handshake(err.to_string()))?;
    }

    Ok(BrokerSession {
        reader,
        _writer: writer,
    })
}

async fn open_stream(addr: &BrokerAddr) -> io::Result<(BrokerReader, BrokerWriter)> {
    match addr {
        #[cfg(unix)]
        BrokerAddr::Unix(path) => {
            let (reader, writer) = UnixStream::connect(path).await?.into_split();
            Ok((Box::new(reader), Box::new(writer)))
        }
        #[cfg(not(unix))]
        BrokerAddr::Unix(_) => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "unix sockets are not available on this platform",
        )),
        BrokerAddr::Tcp(addr) => {
            let (reader, writer) = TcpStream::connect(addr.as_str()).await?.into_split();
            Ok((Box::new(reader), Box::new(writer)))
        }
    }
}

async fn send_envelope(writer: &mut BrokerWriter, envelope: &WireEnvelope) -> io::Result<()> {
    let frame = encode_frame(envelope, DEFAULT_MAX_FRAME_BYTES)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?;
    writer.write_all(&frame).await?;
    writer.flush().await
}

fn build_hello(config: &ForgedConfig) -> WireEnvelope {
    WireEnvelope {
        version: ProtocolVersion::CURRENT,
        sender_id: config.client_id.clone(),
        timestamp: Utc::now().to_rfc3339(),
        request_id: None,
        msg: WireMsg::Hello(HelloPayload {
            client_id: config.client_id.clone(),
            agent: Some(config.agent.clone()),
            capabilities: vec!["message".to_string(), "heartbeat".to_string()],
        }),
    }
}

fn build_watch(config: &ForgedConfig) -> WireEnvelope {
    WireEnvelope {
        version: ProtocolVersion::CURRENT,
        sender_id: config.client_id.clone(),
        timestamp: Utc::now().to_rfc3339(),
        request_id: None,
        msg: WireMsg::Watch(WatchPayload {
            topic: "*".to_string(),
            include_dm: true,
            agent: Some(config.agent.clone()),
        }),
    }
}
