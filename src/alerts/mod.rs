//! Alert fan-out.
//!
//! # Overview
//!
//! The [`Broadcaster`] owns an ordered registry of [`AlertProtocol`]s and
//! delivers every alert to all of them concurrently. Each dispatch runs in
//! its own task under its own timeout, so one slow or failing channel never
//! holds back the others or aborts the call.
//!
//! There is no retry and no queueing: a failed delivery is reported in the
//! [`BroadcastReport`] and forgotten.
//!
//! # Protocols
//!
//! - [`webhook`]: JSON document POSTed to an HTTP endpoint
//! - [`telegram`]: human-readable chat message via the Telegram Bot API

pub mod telegram;
pub mod webhook;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::DispatchError;
use crate::model::{Alert, BoxFuture};

pub use telegram::TelegramProtocol;
pub use webhook::WebhookProtocol;

/// Default per-protocol dispatch timeout.
pub const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(10);

/// A delivery channel for alerts.
///
/// Implementations own their transport state (endpoints, credentials) and
/// report failure through the returned error instead of panicking.
pub trait AlertProtocol: Send + Sync {
    /// Short name used in logs and reports.
    fn name(&self) -> &str;

    fn dispatch<'a>(&'a self, alert: &'a Alert) -> BoxFuture<'a, Result<(), DispatchError>>;
}

/// A protocol that failed during one broadcast.
#[derive(Debug)]
pub struct DispatchFailure {
    pub protocol: String,
    pub error: DispatchError,
}

/// Outcome of a single [`Broadcaster::notify`] call.
#[derive(Debug, Default)]
pub struct BroadcastReport {
    /// Number of protocols the alert was handed to.
    pub attempted: usize,

    /// Number of protocols that confirmed delivery.
    pub succeeded: usize,

    /// Per-protocol failures, in registration order.
    pub failures: Vec<DispatchFailure>,
}

impl BroadcastReport {
    pub fn all_delivered(&self) -> bool {
        self.succeeded == self.attempted
    }
}

/// Concurrent multi-protocol alert dispatcher.
pub struct Broadcaster {
    protocols: RwLock<Vec<Arc<dyn AlertProtocol>>>,
    timeout: Duration,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_DISPATCH_TIMEOUT)
    }
}

impl Broadcaster {
    pub fn new(timeout: Duration) -> Self {
        Self {
            protocols: RwLock::new(Vec::new()),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Append a protocol. Registering the same channel twice delivers twice.
    pub async fn register(&self, protocol: Arc<dyn AlertProtocol>) {
        let mut protocols = self.protocols.write().await;
        info!(index = protocols.len(), protocol = protocol.name(), "Alert protocol registered");
        protocols.push(protocol);
    }

    pub async fn len(&self) -> usize {
        self.protocols.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.protocols.read().await.is_empty()
    }

    /// Names of the registered protocols, in registration order.
    pub async fn protocol_names(&self) -> Vec<String> {
        self.protocols
            .read()
            .await
            .iter()
            .map(|p| p.name().to_string())
            .collect()
    }

    /// Deliver `alert` to every registered protocol concurrently.
    pub async fn notify(&self, alert: Alert) -> BroadcastReport {
        // Snapshot the registry so registration never waits on slow channels
        let protocols: Vec<Arc<dyn AlertProtocol>> = self.protocols.read().await.clone();
        if protocols.is_empty() {
            return BroadcastReport::default();
        }

        let alert = Arc::new(alert);
        let timeout = self.timeout;

        let handles: Vec<_> = protocols
            .into_iter()
            .map(|protocol| {
                let alert = Arc::clone(&alert);
                let name = protocol.name().to_string();
                let handle = tokio::spawn(async move {
                    match tokio::time::timeout(timeout, protocol.dispatch(&alert)).await {
                        Ok(result) => result,
                        Err(_) => Err(DispatchError::Timeout(timeout)),
                    }
                });
                (name, handle)
            })
            .collect();

        let mut report = BroadcastReport {
            attempted: handles.len(),
            ..Default::default()
        };

        for (protocol, handle) in handles {
            let result = handle
                .await
                .unwrap_or_else(|e| Err(DispatchError::Aborted(e.to_string())));
            match result {
                Ok(()) => report.succeeded += 1,
                Err(error) => {
                    warn!(protocol = %protocol, error = %error, "Alert dispatch failed");
                    report.failures.push(DispatchFailure { protocol, error });
                }
            }
        }

        info!(
            title = %alert.title,
            severity = %alert.severity,
            "Alert broadcast. Success: {}/{}",
            report.succeeded,
            report.attempted
        );

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AlertSeverity;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixed {
        name: &'static str,
        ok: bool,
        calls: AtomicUsize,
    }

    impl Fixed {
        fn new(name: &'static str, ok: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                ok,
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl AlertProtocol for Fixed {
        fn name(&self) -> &str {
            self.name
        }

        fn dispatch<'a>(&'a self, _alert: &'a Alert) -> BoxFuture<'a, Result<(), DispatchError>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                if self.ok {
                    Ok(())
                } else {
                    Err(DispatchError::Rejected { status: 500 })
                }
            })
        }
    }

    struct Stalled;

    impl AlertProtocol for Stalled {
        fn name(&self) -> &str {
            "stalled"
        }

        fn dispatch<'a>(&'a self, _alert: &'a Alert) -> BoxFuture<'a, Result<(), DispatchError>> {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            })
        }
    }

    struct Panicking;

    impl AlertProtocol for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        fn dispatch<'a>(&'a self, _alert: &'a Alert) -> BoxFuture<'a, Result<(), DispatchError>> {
            Box::pin(async {
                let broken = true;
                if broken {
                    panic!("transport exploded");
                }
                Ok(())
            })
        }
    }

    fn alert() -> Alert {
        Alert::new("Test", "something happened", AlertSeverity::Low)
    }

    #[tokio::test]
    async fn test_one_of_two_succeeds() {
        let broadcaster = Broadcaster::default();
        let good = Fixed::new("good", true);
        let bad = Fixed::new("bad", false);
        broadcaster.register(good.clone()).await;
        broadcaster.register(bad.clone()).await;

        let report = broadcaster.notify(alert()).await;

        assert_eq!(report.attempted, 2);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].protocol, "bad");
        assert_eq!(good.calls.load(Ordering::SeqCst), 1);
        assert_eq!(bad.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_is_isolated() {
        let broadcaster = Broadcaster::new(Duration::from_millis(50));
        broadcaster.register(Arc::new(Stalled)).await;
        broadcaster.register(Fixed::new("good", true)).await;

        let started = std::time::Instant::now();
        let report = broadcaster.notify(alert()).await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(report.succeeded, 1);
        assert!(matches!(
            report.failures[0].error,
            DispatchError::Timeout(_)
        ));
    }

    #[tokio::test]
    async fn test_panicking_protocol_is_contained() {
        let broadcaster = Broadcaster::default();
        broadcaster.register(Arc::new(Panicking)).await;
        broadcaster.register(Fixed::new("good", true)).await;

        let report = broadcaster.notify(alert()).await;

        assert_eq!(report.succeeded, 1);
        assert!(matches!(
            report.failures[0].error,
            DispatchError::Aborted(_)
        ));
    }

    #[tokio::test]
    async fn test_duplicate_registration_delivers_twice() {
        let broadcaster = Broadcaster::default();
        let good = Fixed::new("good", true);
        broadcaster.register(good.clone()).await;
        broadcaster.register(good.clone()).await;

        let report = broadcaster.notify(alert()).await;

        assert_eq!(report.attempted, 2);
        assert!(report.all_delivered());
        assert_eq!(good.calls.load(Ordering::SeqCst), 2);
        assert_eq!(broadcaster.protocol_names().await, vec!["good", "good"]);
    }

    #[tokio::test]
    async fn test_empty_registry() {
        let broadcaster = Broadcaster::default();
        assert!(broadcaster.is_empty().await);

        let report = broadcaster.notify(alert()).await;
        assert_eq!(report.attempted, 0);
        assert!(report.all_delivered());
    }
}
