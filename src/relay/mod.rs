//! Real-time Update Relay
//!
//! Single WebSocket to the push service. Inbound `leaderboard_update`,
//! `vault_update` and `market_update` messages are republished on one
//! broadcast channel per kind. Nothing here is needed for transaction
//! correctness.
//!
//! Connection loss clears `is_connected`. Whether the worker reconnects is
//! decided by [`ReconnectPolicy`]; the default is not to.

pub mod messages;

pub use messages::*;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, sleep};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

const PING_INTERVAL: Duration = Duration::from_secs(20);
const OBSERVER_CAPACITY: usize = 512;
const COMMAND_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconnectPolicy {
    #[default]
    Never,
    /// Exponential backoff between attempts, doubling up to `max`
    Backoff { initial: Duration, max: Duration },
}

#[derive(Debug)]
enum RelayCommand {
    Subscribe(String),
    Unsubscribe(String),
    Disconnect,
}

enum StreamEnd {
    /// Server closed or the socket dropped
    Lost,
    /// Local disconnect or every handle gone
    Stopped,
}

pub struct UpdateRelay {
    cmd_tx: mpsc::Sender<RelayCommand>,
    connected: AtomicBool,
    channels: RwLock<HashSet<String>>,
    leaderboard: broadcast::Sender<RelayUpdate>,
    vault: broadcast::Sender<RelayUpdate>,
    market: broadcast::Sender<RelayUpdate>,
}

impl UpdateRelay {
    /// Spawn the relay worker and return a handle observers can share.
    pub fn spawn(url: impl Into<String>, policy: ReconnectPolicy) -> Arc<Self> {
        let url = url.into();
        let (relay, cmd_rx) = Self::detached();
        let relay = Arc::new(relay);

        let worker = relay.clone();
        tokio::spawn(async move {
            worker.run(url, policy, cmd_rx).await;
        });

        relay
    }

    fn detached() -> (Self, mpsc::Receiver<RelayCommand>) {
        Self::with_command_capacity(COMMAND_CAPACITY)
    }

    fn with_command_capacity(capacity: usize) -> (Self, mpsc::Receiver<RelayCommand>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(capacity);
        let relay = Self {
            cmd_tx,
            connected: AtomicBool::new(false),
            channels: RwLock::new(HashSet::new()),
            leaderboard: broadcast::channel(OBSERVER_CAPACITY).0,
            vault: broadcast::channel(OBSERVER_CAPACITY).0,
            market: broadcast::channel(OBSERVER_CAPACITY).0,
        };
        (relay, cmd_rx)
    }

    fn sender(&self, kind: UpdateKind) -> &broadcast::Sender<RelayUpdate> {
        match kind {
            UpdateKind::Leaderboard => &self.leaderboard,
            UpdateKind::Vault => &self.vault,
            UpdateKind::Market => &self.market,
        }
    }

    pub fn observe(&self, kind: UpdateKind) -> broadcast::Receiver<RelayUpdate> {
        self.sender(kind).subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn subscribe_league(&self, league_id: &str) {
        self.subscribe(league_channel(league_id));
    }

    pub fn subscribe_vault(&self, vault_id: &str) {
        self.subscribe(vault_channel(vault_id));
    }

    pub fn subscribe_market(&self, market_id: &str) {
        self.subscribe(market_channel(market_id));
    }

    /// Request a channel. Non-blocking; kept across reconnects.
    pub fn subscribe(&self, channel: String) {
        if channel.trim().is_empty() {
            return;
        }
        if self.channels.write().insert(channel.clone()) {
            self.send_command(RelayCommand::Subscribe(channel));
        }
    }

    pub fn unsubscribe(&self, channel: &str) {
        if self.channels.write().remove(channel) {
            self.send_command(RelayCommand::Unsubscribe(channel.to_string()));
        }
    }

    pub fn channels(&self) -> Vec<String> {
        let mut channels: Vec<_> = self.channels.read().iter().cloned().collect();
        channels.sort();
        channels
    }

    pub fn disconnect(&self) {
        self.send_command(RelayCommand::Disconnect);
    }

    /// Queue a command for the worker. Returns false when it was dropped.
    /// A dropped subscribe is still replayed from `channels` on the next
    /// connect.
    fn send_command(&self, cmd: RelayCommand) -> bool {
        match self.cmd_tx.try_send(cmd) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(cmd)) => {
                warn!(command = ?cmd, "relay command queue full; command dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(cmd)) => {
                warn!(command = ?cmd, "relay worker stopped; command dropped");
                false
            }
        }
    }

    /// Republish one inbound text frame. Returns the kind when it was an update.
    fn handle_text(&self, text: &str) -> Option<UpdateKind> {
        match parse_update(text) {
            Ok(Some(update)) => {
                let kind = update.kind;
                // No observers is fine.
                let _ = self.sender(kind).send(update);
                Some(kind)
            }
            Ok(None) => None,
            Err(e) => {
                debug!(error = %e, "ignoring malformed relay message");
                None
            }
        }
    }

    async fn run(
        self: Arc<Self>,
        url: String,
        policy: ReconnectPolicy,
        mut cmd_rx: mpsc::Receiver<RelayCommand>,
    ) {
        let mut delay = match policy {
            ReconnectPolicy::Backoff { initial, .. } => initial,
            ReconnectPolicy::Never => Duration::ZERO,
        };

        loop {
            let result = self.connect_and_stream(&url, &mut cmd_rx).await;
            self.connected.store(false, Ordering::Relaxed);

            match result {
                Ok(StreamEnd::Stopped) => {
                    info!("relay stopped");
                    return;
                }
                Ok(StreamEnd::Lost) => {
                    warn!("relay connection closed");
                    if let ReconnectPolicy::Backoff { initial, .. } = policy {
                        delay = initial;
                    }
                }
                Err(e) => warn!(error = %e, "relay connection failed"),
            }

            let ReconnectPolicy::Backoff { max, .. } = policy else {
                info!("relay reconnection disabled; staying disconnected");
                return;
            };

            debug!(delay_ms = delay.as_millis() as u64, "relay reconnecting");
            sleep(delay).await;
            delay = (delay * 2).min(max);
        }
    }

    async fn connect_and_stream(
        &self,
        url: &str,
        cmd_rx: &mut mpsc::Receiver<RelayCommand>,
    ) -> Result<StreamEnd> {
        info!(url, "connecting update relay");
        let (ws_stream, resp) = connect_async(url).await.context("connect relay ws")?;
        info!(status = %resp.status(), "update relay connected");
        self.connected.store(true, Ordering::Relaxed);

        let (mut write, mut read) = ws_stream.split();

        // Replay desired channels; commands queued before connect are
        // covered by this and skipped below if already sent.
        let mut sent: HashSet<String> = HashSet::new();
        for channel in self.channels() {
            let msg = serde_json::to_string(&ChannelRequest::subscribe(channel.clone()))?;
            write
                .send(Message::Text(msg))
                .await
                .context("send relay subscription")?;
            sent.insert(channel);
        }

        let mut ping = interval(PING_INTERVAL);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ping.tick() => {
                    let _ = write
                        .send(Message::Text(r#"{"type":"ping"}"#.to_string()))
                        .await;
                }
                cmd = cmd_rx.recv() => {
                    let request = match cmd {
                        None | Some(RelayCommand::Disconnect) => {
                            let _ = write.send(Message::Close(None)).await;
                            return Ok(StreamEnd::Stopped);
                        }
                        Some(RelayCommand::Subscribe(channel)) => {
                            if !sent.insert(channel.clone()) {
                                continue;
                            }
                            ChannelRequest::subscribe(channel)
                        }
                        Some(RelayCommand::Unsubscribe(channel)) => {
                            sent.remove(&channel);
                            ChannelRequest::unsubscribe(channel)
                        }
                    };
                    let msg = serde_json::to_string(&request)?;
                    write
                        .send(Message::Text(msg))
                        .await
                        .context("send relay request")?;
                }
                ws_msg = read.next() => {
                    let Some(ws_msg) = ws_msg else {
                        return Ok(StreamEnd::Lost);
                    };

                    match ws_msg {
                        Ok(Message::Text(text)) => {
                            self.handle_text(&text);
                        }
                        Ok(Message::Ping(payload)) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Ok(Message::Close(frame)) => {
                            debug!(?frame, "relay close frame");
                            return Ok(StreamEnd::Lost);
                        }
                        Ok(_) => {}
                        Err(e) => {
                            return Err(anyhow::anyhow!("relay ws error: {e}"));
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_updates_fan_out_by_kind() {
        let (relay, _cmd_rx) = UpdateRelay::detached();
        let mut vaults = relay.observe(UpdateKind::Vault);
        let mut markets = relay.observe(UpdateKind::Market);

        assert_eq!(
            relay.handle_text(r#"{"type":"vault_update","channel":"vault:1","tvl":"1200"}"#),
            Some(UpdateKind::Vault)
        );
        assert_eq!(relay.handle_text(r#"{"type":"pong"}"#), None);
        assert_eq!(relay.handle_text("garbage"), None);

        let update = vaults.try_recv().unwrap();
        assert_eq!(update.payload["tvl"], "1200");
        assert!(markets.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_subscriptions_are_deduplicated() {
        let (relay, mut cmd_rx) = UpdateRelay::detached();

        relay.subscribe_league("7");
        relay.subscribe_league("7");
        relay.subscribe_market("m");
        relay.subscribe(String::new());

        assert_eq!(relay.channels(), vec!["league:7", "market:m"]);
        assert!(matches!(cmd_rx.try_recv(), Ok(RelayCommand::Subscribe(c)) if c == "league:7"));
        assert!(matches!(cmd_rx.try_recv(), Ok(RelayCommand::Subscribe(c)) if c == "market:m"));
        assert!(cmd_rx.try_recv().is_err());

        relay.unsubscribe("league:7");
        assert_eq!(relay.channels(), vec!["market:m"]);
        assert!(matches!(cmd_rx.try_recv(), Ok(RelayCommand::Unsubscribe(_))));
    }

    #[tokio::test]
    async fn test_dropped_commands_keep_channel_state() {
        let (relay, mut cmd_rx) = UpdateRelay::with_command_capacity(1);

        relay.subscribe_league("1");
        relay.subscribe_league("2");
        assert!(!relay.send_command(RelayCommand::Disconnect));
        // Queue overflow loses the command, not the subscription.
        assert_eq!(relay.channels(), vec!["league:1", "league:2"]);
        assert!(matches!(cmd_rx.try_recv(), Ok(RelayCommand::Subscribe(c)) if c == "league:1"));
        assert!(cmd_rx.try_recv().is_err());

        drop(cmd_rx);
        relay.subscribe_vault("v-1");
        relay.unsubscribe("league:1");
        relay.disconnect();
        assert_eq!(relay.channels(), vec!["league:2", "vault:v-1"]);
        assert!(!relay.send_command(RelayCommand::Disconnect));
    }

    #[tokio::test]
    async fn test_unreachable_server_stays_disconnected() {
        let relay = UpdateRelay::spawn("ws://127.0.0.1:9", ReconnectPolicy::Never);
        relay.subscribe_vault("v-1");

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!relay.is_connected());
        // Subscriptions are still tracked for a later reconnect.
        assert_eq!(relay.channels(), vec!["vault:v-1"]);
    }
}
