//! Periodic channel-close detection (design §4.9).
//!
//! Grounded on `eth_engine.rs`'s `notify_connector_on_incoming_settlement`: a
//! fixed-interval poll loop spawned once per watched resource, here rewritten
//! against `tokio::time::interval` instead of `tokio::timer::Interval` + a bare
//! OS thread, since the rest of this crate is async/await throughout.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::ledger::{ChannelId, LedgerClient};

/// Default poll period named in the design: ten minutes bounds the window in
/// which an in-flight close could go undetected.
pub const DEFAULT_POLL_FREQUENCY: Duration = Duration::from_secs(600);

/// A channel the watcher believes is approaching its settle-delay window and
/// should be closed out.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ChannelCloseEvent {
    pub channel_id: ChannelId,
}

/// Polls a set of channel ids on a fixed interval, emitting a [`ChannelCloseEvent`]
/// on `events` the first time a channel's `cancelAfter`/`expiration` falls inside
/// its own settle delay. Channels are added via [`ChannelWatcher::watch`] and
/// removed via [`ChannelWatcher::unwatch`] (called on disconnect).
pub struct ChannelWatcher<L: LedgerClient> {
    ledger: Arc<L>,
    poll_frequency: Duration,
    watched: tokio::sync::Mutex<Vec<ChannelId>>,
    events: mpsc::UnboundedSender<ChannelCloseEvent>,
}

impl<L: LedgerClient + 'static> ChannelWatcher<L> {
    pub fn new(ledger: Arc<L>) -> (Arc<Self>, mpsc::UnboundedReceiver<ChannelCloseEvent>) {
        Self::with_poll_frequency(ledger, DEFAULT_POLL_FREQUENCY)
    }

    pub fn with_poll_frequency(
        ledger: Arc<L>,
        poll_frequency: Duration,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ChannelCloseEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = Arc::new(ChannelWatcher {
            ledger,
            poll_frequency,
            watched: tokio::sync::Mutex::new(Vec::new()),
            events: tx,
        });
        watcher.clone().spawn_poll_loop();
        (watcher, rx)
    }

    pub async fn watch(&self, channel_id: ChannelId) {
        let mut watched = self.watched.lock().await;
        if !watched.contains(&channel_id) {
            watched.push(channel_id);
        }
    }

    pub async fn unwatch(&self, channel_id: ChannelId) {
        self.watched.lock().await.retain(|id| *id != channel_id);
    }

    fn spawn_poll_loop(self: Arc<Self>) {
        let poll_frequency = self.poll_frequency;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_frequency);
            loop {
                ticker.tick().await;
                self.poll_once().await;
            }
        });
    }

    async fn poll_once(&self) {
        let watched = self.watched.lock().await.clone();
        for channel_id in watched {
            let channel = match self.ledger.get_payment_channel(channel_id).await {
                Ok(channel) => channel,
                Err(err) => {
                    warn!(%channel_id, %err, "failed to poll channel during watch cycle");
                    continue;
                }
            };
            let entering_settle_window = channel
                .expiration
                .or(channel.cancel_after)
                .map(|deadline| {
                    deadline
                        .checked_sub(channel.settle_delay)
                        .map(|window_start| window_start <= std::time::SystemTime::now())
                        .unwrap_or(true)
                })
                .unwrap_or(false);

            if entering_settle_window {
                debug!(%channel_id, "channel entering settle-delay window, emitting close event");
                let _ = self.events.send(ChannelCloseEvent { channel_id });
            }
        }
    }
}
