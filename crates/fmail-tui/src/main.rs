use chrono::Utc;
use fmail_core::SubscriptionFilter;
use fmail_tui::config::{init_logging, load_config};
use fmail_tui::provider::select_provider;
use fmail_tui::state::StateStore;
use fmail_tui::status::{presence_symbol, spawn_probe_loop};
use fmail_tui::{ConnectionStatusTracker, MessageProvider, NotificationCenter};
use std::error::Error;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

const PROBE_INTERVAL: Duration = Duration::from_secs(1);
const STATUS_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let config = load_config();
    init_logging();

    let selection = select_provider(&config.provider_options()).await?;
    info!(
        event = "fmail_tui_start",
        mode = selection.mode(),
        root = %config.root.display(),
        agent = %config.agent
    );
    let provider = selection.into_provider();

    let store = Arc::new(StateStore::load(&config.state_path)?);
    let center = NotificationCenter::with_store(&config.agent, config.notify_limits, store);
    let tracker = Arc::new(ConnectionStatusTracker::default());
    tracker.apply_probe(&provider.connection(), Utc::now());

    print_agents(provider.as_ref());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let probe_task = spawn_probe_loop(
        tracker.clone(),
        provider.clone(),
        PROBE_INTERVAL,
        shutdown_rx,
    );

    let mut subscription = provider.subscribe(SubscriptionFilter::default())?;
    let mut status_ticker = tokio::time::interval(STATUS_INTERVAL);
    let mut stdout = io::stdout();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            received = subscription.recv() => {
                let Some(message) = received else {
                    warn!(event = "subscription_closed");
                    break;
                };
                tracker.record(&message, Utc::now());
                let (actions, is_new) = center.process_message(&message);
                if !is_new {
                    continue;
                }
                let bell = if actions.bell { "\x07" } else { "" };
                writeln!(
                    stdout,
                    "{bell}[{actions}] {} {} -> {}: {}",
                    message.id, message.from, message.to, message.body
                )?;
                stdout.flush()?;
            }
            _ = status_ticker.tick() => {
                let now = Utc::now();
                let status = tracker.status();
                info!(
                    event = "fmail_tui_status",
                    connection = %status.label(),
                    method = %status.method,
                    msg_per_min = tracker.msg_per_min(now),
                    agents_active = tracker.agents_active(now),
                    unread = center.unread_count(),
                    dropped = subscription.dropped()
                );
            }
        }
    }

    subscription.cancel();
    shutdown_tx.send_replace(true);
    let _ = probe_task.await;
    info!(event = "fmail_tui_stop");
    Ok(())
}

fn print_agents(provider: &dyn MessageProvider) {
    let agents = match provider.agents() {
        Ok(agents) => agents,
        Err(err) => {
            warn!(event = "agents_unavailable", error = %err);
            return;
        }
    };
    let now = Utc::now();
    for agent in agents {
        println!("{} {}", presence_symbol(agent.last_seen, now), agent.name);
    }
}
