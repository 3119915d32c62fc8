//! Event stream hub: per-run fan-out of typed engine events.
//!
//! One bounded broadcast channel per run. Publishing never blocks the
//! orchestrator; a subscriber that falls behind skips the overwritten
//! events and the hub counts the drops. Every subscriber greets with
//! `connected`, heartbeats cover quiet stretches, and completion closes
//! the channel after a short grace delay.

#![deny(unsafe_code)]

use aegis_types::{EngineEvent, EngineEventType};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Stream hub parameters.
#[derive(Debug, Clone, Copy)]
pub struct StreamHubConfig {
    /// Broadcast capacity per run; slow subscribers skip past overwrites.
    pub channel_capacity: usize,
    pub heartbeat_interval_ms: u64,
    /// Delay between `decision_finalized` and the closing `completed`.
    pub completion_grace_ms: u64,
}

impl Default for StreamHubConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 64,
            heartbeat_interval_ms: 30_000,
            completion_grace_ms: 100,
        }
    }
}

struct RunChannel {
    sender: broadcast::Sender<EngineEvent>,
    heartbeat: JoinHandle<()>,
}

/// Hub statistics for observability wiring.
#[derive(Debug, Clone)]
pub struct StreamHubStats {
    pub active_runs: usize,
    pub dropped_events: u64,
    pub events_by_type: HashMap<String, u64>,
}

/// Per-run event multiplexer.
pub struct StreamHub {
    channels: Mutex<HashMap<String, RunChannel>>,
    event_counts: Mutex<HashMap<String, u64>>,
    dropped_events: Arc<AtomicU64>,
    config: StreamHubConfig,
}

impl StreamHub {
    pub fn new(config: StreamHubConfig) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            event_counts: Mutex::new(HashMap::new()),
            dropped_events: Arc::new(AtomicU64::new(0)),
            config,
        }
    }

    /// Register a run and start its heartbeat.
    pub fn open_run(&self, run_id: &str) {
        let (sender, _) = broadcast::channel(self.config.channel_capacity);
        let heartbeat = spawn_heartbeat(
            sender.clone(),
            run_id.to_string(),
            self.config.heartbeat_interval_ms,
        );
        let mut guard = match self.channels.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(previous) = guard.insert(
            run_id.to_string(),
            RunChannel { sender, heartbeat },
        ) {
            previous.heartbeat.abort();
        }
    }

    /// Publish one event to the run's subscribers. Data is redacted here
    /// so nothing that bypassed the orchestrator's own pass can leak.
    pub fn publish(&self, mut event: EngineEvent) {
        aegis_redact::redact_value(&mut event.data);
        if let Ok(mut counts) = self.event_counts.lock() {
            *counts
                .entry(event.event_type.as_str().to_string())
                .or_insert(0) += 1;
        }
        let guard = match self.channels.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(channel) = guard.get(&event.run_id) {
            // No receivers yet is fine; late subscribers get no replay.
            let _ = channel.sender.send(event);
        }
    }

    /// Subscribe to a run. `None` when the run is unknown or already
    /// closed. Late subscribers see only events emitted after this call.
    pub fn subscribe(&self, run_id: &str) -> Option<RunSubscription> {
        let guard = match self.channels.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let channel = guard.get(run_id)?;
        Some(RunSubscription {
            connected: Some(EngineEvent::new(
                EngineEventType::Connected,
                run_id,
                serde_json::json!({}),
            )),
            rx: channel.sender.subscribe(),
            dropped: Arc::clone(&self.dropped_events),
        })
    }

    /// Finish a run's stream: after the grace delay, send `completed`,
    /// stop the heartbeat, and close the channel.
    pub async fn complete(&self, run_id: &str) {
        tokio::time::sleep(Duration::from_millis(self.config.completion_grace_ms)).await;
        self.publish(EngineEvent::new(
            EngineEventType::Completed,
            run_id,
            serde_json::json!({}),
        ));
        let removed = {
            let mut guard = match self.channels.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.remove(run_id)
        };
        if let Some(channel) = removed {
            channel.heartbeat.abort();
        } else {
            tracing::debug!(run_id = %run_id, "completing unknown stream");
        }
    }

    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> StreamHubStats {
        let active_runs = match self.channels.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        };
        let events_by_type = match self.event_counts.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        StreamHubStats {
            active_runs,
            dropped_events: self.dropped_events(),
            events_by_type,
        }
    }
}

impl Default for StreamHub {
    fn default() -> Self {
        Self::new(StreamHubConfig::default())
    }
}

fn spawn_heartbeat(
    sender: broadcast::Sender<EngineEvent>,
    run_id: String,
    interval_ms: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
        // The first tick fires immediately; the greeting already covers it.
        interval.tick().await;
        loop {
            interval.tick().await;
            let event = EngineEvent::new(
                EngineEventType::Heartbeat,
                run_id.clone(),
                serde_json::json!({}),
            );
            // No receivers yet is fine; the hub aborts this task on
            // completion.
            let _ = sender.send(event);
        }
    })
}

/// One subscriber's view of a run stream.
pub struct RunSubscription {
    connected: Option<EngineEvent>,
    rx: broadcast::Receiver<EngineEvent>,
    dropped: Arc<AtomicU64>,
}

impl RunSubscription {
    /// Next event in emit order. Lagged stretches are skipped and counted;
    /// `None` means the stream closed.
    pub async fn recv(&mut self) -> Option<EngineEvent> {
        if let Some(greeting) = self.connected.take() {
            return Some(greeting);
        }
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    self.dropped.fetch_add(skipped, Ordering::Relaxed);
                    tracing::warn!(skipped, "subscriber lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
