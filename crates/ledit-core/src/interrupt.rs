// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Signal-driven cancellation with force-quit escalation.
//!
//! The first interrupt cancels the shared token; every long operation
//! (provider calls, tool executions, backoff sleeps) observes it and the
//! loop exits at its iteration boundary.  A second interrupt inside the
//! escalation window force-quits with exit code 1.  SIGTSTP is deliberately
//! not intercepted so the process can still be suspended.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use ledit_events::{EventBus, EventKind};

/// What one observed interrupt should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptAction {
    /// Cancel the shared token and let the loop drain.
    Graceful,
    /// Exit immediately with code 1.
    ForceQuit,
}

/// Pure escalation state: two interrupts within the window force-quit.
#[derive(Debug)]
pub struct Escalation {
    window: Duration,
    last: Option<Instant>,
}

impl Escalation {
    pub fn new(window: Duration) -> Self {
        Self { window, last: None }
    }

    pub fn observe(&mut self, now: Instant) -> InterruptAction {
        let action = match self.last {
            Some(prev) if now.duration_since(prev) <= self.window => InterruptAction::ForceQuit,
            _ => InterruptAction::Graceful,
        };
        self.last = Some(now);
        action
    }
}

/// Listens for ctrl-c and drives the cancellation token.
pub struct InterruptController {
    cancel: CancellationToken,
    bus: EventBus,
    escalation_window: Duration,
    /// Exit hook, injectable for tests.
    exit: Arc<dyn Fn(i32) + Send + Sync>,
}

impl InterruptController {
    pub fn new(cancel: CancellationToken, bus: EventBus) -> Self {
        Self {
            cancel,
            bus,
            escalation_window: Duration::from_secs(2),
            exit: Arc::new(|code| std::process::exit(code)),
        }
    }

    pub fn with_escalation_window(mut self, window: Duration) -> Self {
        self.escalation_window = window;
        self
    }

    #[cfg(test)]
    fn with_exit_hook(mut self, exit: Arc<dyn Fn(i32) + Send + Sync>) -> Self {
        self.exit = exit;
        self
    }

    /// Spawn the signal listener.  Runs until the process ends; the handle
    /// is returned so the wiring site can abort it on clean shutdown.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut escalation = Escalation::new(self.escalation_window);
            loop {
                if tokio::signal::ctrl_c().await.is_err() {
                    warn!("interrupt listener could not register; signals disabled");
                    return;
                }
                match escalation.observe(Instant::now()) {
                    InterruptAction::ForceQuit => {
                        eprintln!("\nforced quit");
                        (self.exit)(1);
                        return;
                    }
                    InterruptAction::Graceful => {
                        info!("interrupt received; finishing the current iteration");
                        self.bus.emit(EventKind::Interrupt, json!({}));
                        self.cancel.cancel();
                    }
                }
            }
        })
    }
}

/// Shutdown watchdog for idle interactive prompts: unless dropped within
/// `timeout`, the process is force-exited.  Dropping the guard disarms it.
pub struct ShutdownWatchdog {
    armed: Arc<std::sync::atomic::AtomicBool>,
}

impl ShutdownWatchdog {
    pub fn arm(timeout: Duration) -> Self {
        Self::arm_with(timeout, Arc::new(|code| std::process::exit(code)))
    }

    pub fn arm_with(timeout: Duration, exit: Arc<dyn Fn(i32) + Send + Sync>) -> Self {
        let armed = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let flag = Arc::clone(&armed);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if flag.load(std::sync::atomic::Ordering::SeqCst) {
                warn!("graceful shutdown timed out; forcing exit");
                exit(1);
            }
        });
        Self { armed }
    }
}

impl Drop for ShutdownWatchdog {
    fn drop(&mut self) {
        self.armed
            .store(false, std::sync::atomic::Ordering::SeqCst);
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicI32, Ordering};

    use super::*;

    #[test]
    fn single_interrupt_is_graceful() {
        let mut e = Escalation::new(Duration::from_secs(2));
        assert_eq!(e.observe(Instant::now()), InterruptAction::Graceful);
    }

    #[test]
    fn double_interrupt_inside_window_forces_quit() {
        let mut e = Escalation::new(Duration::from_secs(2));
        let t0 = Instant::now();
        assert_eq!(e.observe(t0), InterruptAction::Graceful);
        assert_eq!(
            e.observe(t0 + Duration::from_millis(500)),
            InterruptAction::ForceQuit
        );
    }

    #[test]
    fn interrupts_outside_window_stay_graceful() {
        let mut e = Escalation::new(Duration::from_secs(2));
        let t0 = Instant::now();
        assert_eq!(e.observe(t0), InterruptAction::Graceful);
        assert_eq!(
            e.observe(t0 + Duration::from_secs(3)),
            InterruptAction::Graceful
        );
    }

    #[test]
    fn third_interrupt_after_two_spaced_ones_escalates_from_second() {
        let mut e = Escalation::new(Duration::from_secs(2));
        let t0 = Instant::now();
        e.observe(t0);
        e.observe(t0 + Duration::from_secs(5));
        assert_eq!(
            e.observe(t0 + Duration::from_secs(6)),
            InterruptAction::ForceQuit
        );
    }

    #[tokio::test]
    async fn watchdog_fires_when_not_disarmed() {
        let exits = Arc::new(AtomicI32::new(0));
        let exits2 = Arc::clone(&exits);
        let guard = ShutdownWatchdog::arm_with(
            Duration::from_millis(50),
            Arc::new(move |_code| {
                exits2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        // Keep the guard alive past the timeout.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(exits.load(Ordering::SeqCst), 1);
        drop(guard);
    }

    #[tokio::test]
    async fn dropped_watchdog_never_fires() {
        let exits = Arc::new(AtomicI32::new(0));
        let exits2 = Arc::clone(&exits);
        let guard = ShutdownWatchdog::arm_with(
            Duration::from_millis(50),
            Arc::new(move |_code| {
                exits2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        drop(guard);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(exits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn controller_builds_with_custom_hook() {
        // Smoke test: constructing and spawning must not panic or exit.
        let cancel = CancellationToken::new();
        let bus = EventBus::new();
        let handle = InterruptController::new(cancel.clone(), bus)
            .with_escalation_window(Duration::from_millis(10))
            .with_exit_hook(Arc::new(|_| {}))
            .spawn();
        handle.abort();
    }
}
