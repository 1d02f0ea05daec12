//! Per-stream freshness monitoring.
//!
//! Each logical stream declares an expected message interval and a stale
//! threshold. Streams marked `allow_silence` (order updates while no orders
//! are open) never go unhealthy from staleness. Global health is the AND
//! over required streams plus REST health.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

pub type HealthCallback = Arc<dyn Fn(&str, bool) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct StreamSpec {
    pub name: &'static str,
    pub expected_interval: Duration,
    /// Must exceed `expected_interval`.
    pub stale_after: Duration,
    pub allow_silence: bool,
}

impl StreamSpec {
    pub fn required(name: &'static str, expected: Duration, stale_after: Duration) -> Self {
        Self { name, expected_interval: expected, stale_after, allow_silence: false }
    }

    pub fn allow_silence(name: &'static str, expected: Duration, stale_after: Duration) -> Self {
        Self { name, expected_interval: expected, stale_after, allow_silence: true }
    }
}

#[derive(Debug)]
struct TrackedStream {
    spec: StreamSpec,
    last_seen: Option<Instant>,
    healthy: bool,
}

#[derive(Debug)]
struct Inner {
    streams: HashMap<&'static str, TrackedStream>,
    rest_healthy: bool,
}

pub struct StreamHealthMonitor {
    inner: Mutex<Inner>,
    on_transition: Option<HealthCallback>,
}

impl StreamHealthMonitor {
    pub fn new(specs: Vec<StreamSpec>, on_transition: Option<HealthCallback>) -> Self {
        let streams = specs
            .into_iter()
            .map(|spec| {
                (
                    spec.name,
                    TrackedStream { spec, last_seen: None, healthy: false },
                )
            })
            .collect();
        Self {
            inner: Mutex::new(Inner { streams, rest_healthy: true }),
            on_transition,
        }
    }

    /// A message arrived on `name`; marks the stream healthy.
    pub fn record_message(&self, name: &str) {
        let mut transitions = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(stream) = inner.streams.get_mut(name) {
                stream.last_seen = Some(Instant::now());
                if !stream.healthy {
                    stream.healthy = true;
                    transitions.push((stream.spec.name, true));
                }
            }
        }
        self.fire(transitions);
    }

    /// REST pull outcome feeds global health.
    pub fn set_rest_healthy(&self, healthy: bool) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.rest_healthy != healthy {
            if healthy {
                info!("REST health recovered");
            } else {
                warn!("REST health degraded");
            }
            inner.rest_healthy = healthy;
        }
    }

    /// Apply staleness; called on a fixed cadence by the checker task.
    pub fn check_now(&self) {
        let mut transitions = Vec::new();
        {
            let now = Instant::now();
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            for stream in inner.streams.values_mut() {
                if stream.spec.allow_silence {
                    continue;
                }
                let stale = match stream.last_seen {
                    Some(seen) => now.duration_since(seen) > stream.spec.stale_after,
                    None => true,
                };
                if stale && stream.healthy {
                    stream.healthy = false;
                    transitions.push((stream.spec.name, false));
                } else if !stale && !stream.healthy {
                    stream.healthy = true;
                    transitions.push((stream.spec.name, true));
                }
            }
        }
        self.fire(transitions);
    }

    pub fn is_stream_healthy(&self, name: &str) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.streams.get(name).map(|s| s.healthy || s.spec.allow_silence).unwrap_or(false)
    }

    pub fn rest_healthy(&self) -> bool {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).rest_healthy
    }

    /// All required streams healthy.
    pub fn required_streams_healthy(&self) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .streams
            .values()
            .filter(|s| !s.spec.allow_silence)
            .all(|s| s.healthy)
    }

    /// AND over required streams plus REST.
    pub fn globally_healthy(&self) -> bool {
        self.required_streams_healthy() && self.rest_healthy()
    }

    /// Drop all freshness; used when the socket disconnects.
    pub fn reset_streams(&self) {
        let mut transitions = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            for stream in inner.streams.values_mut() {
                stream.last_seen = None;
                if stream.healthy && !stream.spec.allow_silence {
                    stream.healthy = false;
                    transitions.push((stream.spec.name, false));
                }
            }
        }
        self.fire(transitions);
    }

    pub fn spawn_checker(self: &Arc<Self>, cadence: Duration) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cadence);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                monitor.check_now();
            }
        })
    }

    fn fire(&self, transitions: Vec<(&'static str, bool)>) {
        for (name, healthy) in transitions {
            if healthy {
                info!(stream = name, "stream healthy");
            } else {
                warn!(stream = name, "stream stale");
            }
            if let Some(cb) = &self.on_transition {
                cb(name, healthy);
            }
        }
    }
}
