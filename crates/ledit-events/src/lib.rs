// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Typed publish/subscribe bus for run lifecycle and streaming events.
//!
//! Publication never blocks the publisher.  Every subscriber owns a bounded
//! queue; a subscriber that falls behind loses the *oldest* events and its
//! overflow counter records how many were dropped.  Within one subscriber,
//! events arrive in publication order.  No ordering is guaranteed across
//! subscribers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

/// Capacity of each subscriber's queue before drop-oldest kicks in.
const SUBSCRIBER_QUEUE: usize = 256;

/// Named event kinds carried on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    QueryStarted,
    QueryCompleted,
    StreamChunk,
    ToolCalled,
    ToolCompleted,
    MetricsUpdate,
    Error,
    Interrupt,
    Shutdown,
}

/// One bus event.  `payload` is kind-specific JSON so consumers (console,
/// web UI) can forward it to the wire without re-serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(kind: EventKind, payload: serde_json::Value) -> Self {
        Self {
            kind,
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Multi-producer, multi-consumer event bus.
///
/// Cheap to clone; all clones publish into the same stream.  [`EventBus::close`]
/// terminates every subscriber stream.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    // `None` after close(); publishes become no-ops.
    tx: Mutex<Option<broadcast::Sender<Event>>>,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(SUBSCRIBER_QUEUE);
        Self {
            inner: Arc::new(BusInner {
                tx: Mutex::new(Some(tx)),
                published: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Publish an event.  Never blocks; a bus with no subscribers silently
    /// discards the event.
    pub fn publish(&self, event: Event) {
        let guard = self.inner.tx.lock().unwrap();
        if let Some(tx) = guard.as_ref() {
            self.inner.published.fetch_add(1, Ordering::Relaxed);
            // send() only errors when there are no receivers; that is fine.
            let _ = tx.send(event);
        }
    }

    /// Shorthand for `publish(Event::new(kind, payload))`.
    pub fn emit(&self, kind: EventKind, payload: serde_json::Value) {
        self.publish(Event::new(kind, payload));
    }

    /// Register a subscriber interested in `kinds` (empty slice = all kinds).
    pub fn subscribe(&self, kinds: &[EventKind]) -> EventStream {
        let guard = self.inner.tx.lock().unwrap();
        let rx = guard
            .as_ref()
            .map(|tx| tx.subscribe());
        EventStream {
            rx,
            filter: kinds.to_vec(),
            bus: Arc::clone(&self.inner),
            overflowed: 0,
        }
    }

    /// Spawn a task that feeds matching events to `handler` until the bus
    /// closes.  Returns the task handle so callers can await teardown.
    pub fn subscribe_with<F>(&self, kinds: &[EventKind], mut handler: F) -> tokio::task::JoinHandle<()>
    where
        F: FnMut(Event) + Send + 'static,
    {
        let mut stream = self.subscribe(kinds);
        tokio::spawn(async move {
            while let Some(ev) = stream.next().await {
                handler(ev);
            }
        })
    }

    /// Close the bus: all subscriber streams end after draining what they
    /// already hold.  Subsequent publishes are dropped.
    pub fn close(&self) {
        self.inner.tx.lock().unwrap().take();
    }

    /// Total events published since construction.
    pub fn published_count(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }

    /// Total events dropped across all subscribers due to overflow.
    pub fn dropped_count(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A subscriber's view of the bus.
pub struct EventStream {
    rx: Option<broadcast::Receiver<Event>>,
    filter: Vec<EventKind>,
    bus: Arc<BusInner>,
    overflowed: u64,
}

impl EventStream {
    /// Next matching event, or `None` once the bus is closed.
    ///
    /// A lagging subscriber transparently skips the events it lost; the loss
    /// is counted and logged, never surfaced as an error.
    pub async fn next(&mut self) -> Option<Event> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(ev) => {
                    if self.filter.is_empty() || self.filter.contains(&ev.kind) {
                        return Some(ev);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.overflowed += n;
                    self.bus.dropped.fetch_add(n, Ordering::Relaxed);
                    warn!(dropped = n, "event subscriber overflowed; oldest events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.rx = None;
                    return None;
                }
            }
        }
    }

    /// Events this subscriber lost to overflow.
    pub fn overflow_count(&self) -> u64 {
        self.overflowed
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(&[]);
        bus.emit(EventKind::QueryStarted, json!({"intent": "x"}));
        let ev = sub.next().await.unwrap();
        assert_eq!(ev.kind, EventKind::QueryStarted);
        assert_eq!(ev.payload["intent"], "x");
    }

    #[tokio::test]
    async fn filter_skips_unwanted_kinds() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(&[EventKind::ToolCompleted]);
        bus.emit(EventKind::StreamChunk, json!({"text": "ignored"}));
        bus.emit(EventKind::ToolCompleted, json!({"name": "read_file"}));
        let ev = sub.next().await.unwrap();
        assert_eq!(ev.kind, EventKind::ToolCompleted);
    }

    #[tokio::test]
    async fn per_subscriber_order_matches_publication_order() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(&[]);
        for i in 0..10 {
            bus.emit(EventKind::StreamChunk, json!({"seq": i}));
        }
        for i in 0..10 {
            let ev = sub.next().await.unwrap();
            assert_eq!(ev.payload["seq"], i);
        }
    }

    #[tokio::test]
    async fn close_ends_all_subscribers() {
        let bus = EventBus::new();
        let mut a = bus.subscribe(&[]);
        let mut b = bus.subscribe(&[EventKind::Error]);
        bus.close();
        assert!(a.next().await.is_none());
        assert!(b.next().await.is_none());
    }

    #[tokio::test]
    async fn publish_after_close_is_noop() {
        let bus = EventBus::new();
        bus.close();
        bus.emit(EventKind::Error, json!({}));
        assert_eq!(bus.published_count(), 0);
    }

    #[tokio::test]
    async fn slow_subscriber_drops_oldest_and_counts_overflow() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(&[]);
        // Overfill the queue without draining.
        for i in 0..(SUBSCRIBER_QUEUE + 50) {
            bus.emit(EventKind::StreamChunk, json!({"seq": i}));
        }
        // First received event is no longer seq 0 - the oldest were dropped.
        let first = sub.next().await.unwrap();
        assert!(first.payload["seq"].as_u64().unwrap() > 0);
        assert!(sub.overflow_count() >= 50);
        assert_eq!(bus.dropped_count(), sub.overflow_count());
    }

    #[tokio::test]
    async fn late_subscriber_sees_only_subsequent_events() {
        let bus = EventBus::new();
        bus.emit(EventKind::StreamChunk, json!({"seq": 0}));
        let mut sub = bus.subscribe(&[]);
        bus.emit(EventKind::StreamChunk, json!({"seq": 1}));
        let ev = sub.next().await.unwrap();
        assert_eq!(ev.payload["seq"], 1);
    }

    #[test]
    fn event_kind_serializes_snake_case() {
        let s = serde_json::to_string(&EventKind::ToolCalled).unwrap();
        assert_eq!(s, "\"tool_called\"");
    }
}
