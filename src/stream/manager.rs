//! Streaming connection manager.
//!
//! One logical connection per exchange. The manager owns the reconnect
//! loop: classify the close code, back off per category, bump the
//! generation, reconnect (the connector re-authenticates and re-subscribes
//! every channel on each `connect`), and emit signals downstream. Events
//! are stamped with the generation they arrived on; consumers discard
//! anything older than the current generation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::adapter::{ExchangeError, StreamEvent};
use crate::policy::backoff::{Backoff, BackoffConfig};
use crate::stream::dedup::DedupCache;
use crate::stream::queue::{BoundedQueue, DropCallback};

// ─────────────────────────────────────────────────────────
// Connection state & close-code policy
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseCategory {
    AuthFailure,
    RateLimited,
    Normal,
    Unknown,
}

/// Classify a close code into its reconnect category.
/// 1008 is the standard policy-violation code; 4001–4009 are the
/// exchange-specific auth rejections. 1013 and 4029 are throttles.
pub fn classify_close_code(code: u16) -> CloseCategory {
    match code {
        1000 | 1001 | 1006 => CloseCategory::Normal,
        1008 | 4001..=4009 => CloseCategory::AuthFailure,
        1013 | 4029 => CloseCategory::RateLimited,
        _ => CloseCategory::Unknown,
    }
}

fn classify_connect_error(err: &ExchangeError) -> CloseCategory {
    match err {
        ExchangeError::Auth(_) => CloseCategory::AuthFailure,
        ExchangeError::Throttled { .. } => CloseCategory::RateLimited,
        _ => CloseCategory::Unknown,
    }
}

// ─────────────────────────────────────────────────────────
// Connector capability
// ─────────────────────────────────────────────────────────

/// Raw frames from a live connection. The connector decodes venue JSON into
/// typed events; a `Closed` frame (or channel end) terminates the session.
#[derive(Debug)]
pub enum InboundFrame {
    Event(StreamEvent),
    Closed { code: u16, reason: String },
}

#[async_trait]
pub trait StreamConnector: Send + Sync {
    /// Open the socket, authenticate if required, and subscribe all
    /// configured channels. Frames flow until disconnect.
    async fn connect(&self) -> Result<mpsc::Receiver<InboundFrame>, ExchangeError>;
}

// ─────────────────────────────────────────────────────────
// Signals emitted downstream
// ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum StreamSignal {
    /// A connection is live; consumers should trigger a catch-up pull.
    Connected { generation: u64 },
    /// A de-duplicated event, stamped with its connection generation.
    Event { event: StreamEvent, generation: u64 },
    Disconnected { category: CloseCategory },
}

// ─────────────────────────────────────────────────────────
// Manager
// ─────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct StreamManagerConfig {
    pub queue_capacity: usize,
    pub dedup_ttl: Duration,
    pub dedup_max_entries: usize,
    pub backoff_normal: BackoffConfig,
    pub backoff_rate_limited: BackoffConfig,
    pub backoff_auth: BackoffConfig,
    pub on_drop: Option<DropCallback>,
}

impl Default for StreamManagerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            dedup_ttl: Duration::from_secs(15 * 60),
            dedup_max_entries: 50_000,
            backoff_normal: BackoffConfig::default(),
            backoff_rate_limited: BackoffConfig::rate_limited(),
            backoff_auth: BackoffConfig { max_attempts: Some(3), ..BackoffConfig::default() },
            on_drop: None,
        }
    }
}

pub struct StreamManager {
    connector: Arc<dyn StreamConnector>,
    config: StreamManagerConfig,
    generation: AtomicU64,
    state_tx: watch::Sender<ConnectionState>,
    connect_lock: tokio::sync::Mutex<()>,
    signals: BoundedQueue<StreamSignal>,
    dedup: Mutex<DedupCache>,
}

impl StreamManager {
    pub fn new(
        connector: Arc<dyn StreamConnector>,
        config: StreamManagerConfig,
    ) -> (Arc<Self>, mpsc::Receiver<StreamSignal>) {
        let (signals, signal_rx) =
            BoundedQueue::new(config.queue_capacity, config.on_drop.clone());
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let dedup = Mutex::new(DedupCache::new(config.dedup_ttl, config.dedup_max_entries));
        (
            Arc::new(Self {
                connector,
                config,
                generation: AtomicU64::new(0),
                state_tx,
                connect_lock: tokio::sync::Mutex::new(()),
                signals,
                dedup,
            }),
            signal_rx,
        )
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Generation of the current (or most recent) connection.
    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Messages refused by the bounded inbound queue.
    pub fn dropped_messages(&self) -> u64 {
        self.signals.dropped()
    }

    /// Single connect attempt. The lock makes concurrent callers share one
    /// in-flight attempt: a successful attempt completes before any further
    /// attempt starts, so reconnect races never create duplicate sockets.
    async fn connect_once(&self) -> Result<mpsc::Receiver<InboundFrame>, ExchangeError> {
        let _guard = self.connect_lock.lock().await;
        self.connector.connect().await
    }

    /// Reconnect loop. Returns `Ok(())` on shutdown, `Err` when a capped
    /// category exhausts its attempts (auth exhaustion is fatal) or the
    /// very first connect fails.
    pub async fn run(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ExchangeError> {
        let mut backoff_normal = Backoff::new(self.config.backoff_normal.clone());
        let mut backoff_rate_limited = Backoff::new(self.config.backoff_rate_limited.clone());
        let mut backoff_auth = Backoff::new(self.config.backoff_auth.clone());
        let mut first_attempt = true;

        loop {
            if *shutdown.borrow() {
                let _ = self.state_tx.send(ConnectionState::Disconnected);
                return Ok(());
            }

            let _ = self.state_tx.send(if first_attempt {
                ConnectionState::Connecting
            } else {
                ConnectionState::Reconnecting
            });

            let category = match self.connect_once().await {
                Ok(mut frames) => {
                    let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                    first_attempt = false;
                    // Auth-failure closes arrive AFTER a successful socket
                    // open, so the auth counter only resets further below,
                    // once a session ends for some other reason.
                    backoff_normal.reset();
                    backoff_rate_limited.reset();
                    let _ = self.state_tx.send(ConnectionState::Connected);
                    info!(generation, "stream connected");
                    self.signals.push(StreamSignal::Connected { generation });

                    let category = self.drain(&mut frames, generation, &mut shutdown).await;
                    match category {
                        Some(category) => {
                            warn!(?category, "stream disconnected");
                            self.signals.push(StreamSignal::Disconnected { category });
                            category
                        }
                        // Shutdown requested mid-session.
                        None => {
                            let _ = self.state_tx.send(ConnectionState::Disconnected);
                            return Ok(());
                        }
                    }
                }
                Err(err) if first_attempt => {
                    let _ = self.state_tx.send(ConnectionState::Disconnected);
                    return Err(err);
                }
                Err(err) => {
                    let category = classify_connect_error(&err);
                    warn!(error = %err, ?category, "stream connect failed");
                    self.signals.push(StreamSignal::Disconnected { category });
                    category
                }
            };

            if category != CloseCategory::AuthFailure {
                backoff_auth.reset();
            }
            let backoff = match category {
                CloseCategory::AuthFailure => &mut backoff_auth,
                CloseCategory::RateLimited => &mut backoff_rate_limited,
                CloseCategory::Normal | CloseCategory::Unknown => &mut backoff_normal,
            };
            let delay = match backoff.next_delay() {
                Some(delay) => delay,
                None => {
                    let _ = self.state_tx.send(ConnectionState::Disconnected);
                    return Err(match category {
                        CloseCategory::AuthFailure => {
                            ExchangeError::Auth("stream auth attempts exhausted".into())
                        }
                        _ => ExchangeError::Network(format!(
                            "reconnect attempts exhausted ({category:?})"
                        )),
                    });
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    /// Drain one live session. Returns the close category, or `None` on
    /// shutdown.
    async fn drain(
        &self,
        frames: &mut mpsc::Receiver<InboundFrame>,
        generation: u64,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<CloseCategory> {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return None;
                    }
                }
                frame = frames.recv() => match frame {
                    Some(InboundFrame::Event(event)) => {
                        let fresh = {
                            let mut dedup = self.dedup.lock().unwrap_or_else(|e| e.into_inner());
                            dedup.remember(event.dedup_key())
                        };
                        if fresh {
                            self.signals.push(StreamSignal::Event { event, generation });
                        }
                    }
                    Some(InboundFrame::Closed { code, reason }) => {
                        warn!(code, %reason, "stream close frame");
                        return Some(classify_close_code(code));
                    }
                    // Channel end without a close frame: abnormal closure.
                    None => return Some(classify_close_code(1006)),
                },
            }
        }
    }
}
