//! Startup rendezvous between privileged setup and the privilege drop
//!
//! Every listener and the missed port watcher receive a [`ReadyHandle`] and
//! report through it once their socket or capture handle is open (or has
//! failed to open). The orchestrator waits on [`ReadinessBarrier`] for
//! `listeners + 1` reports before dropping privileges.

use std::fmt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// A component that does privileged setup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Tcp(u16),
    Udp(u16),
    Watcher,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Component::Tcp(port) => write!(f, "tcp/{}", port),
            Component::Udp(port) => write!(f, "udp/{}", port),
            Component::Watcher => f.write_str("watcher"),
        }
    }
}

#[derive(Debug)]
pub struct Report {
    pub component: Component,
    pub outcome: Result<(), String>,
}

/// Cloneable sender side; hand one [`ReadyHandle`] to each component
#[derive(Clone)]
pub struct ReadySender {
    tx: mpsc::UnboundedSender<Report>,
}

impl ReadySender {
    pub fn handle(&self, component: Component) -> ReadyHandle {
        ReadyHandle {
            component,
            tx: Some(self.tx.clone()),
        }
    }
}

/// Reports exactly once; dropping it unreported counts as a failure
pub struct ReadyHandle {
    component: Component,
    tx: Option<mpsc::UnboundedSender<Report>>,
}

impl ReadyHandle {
    pub fn ready(mut self) {
        self.send(Ok(()));
    }

    pub fn failed(mut self, reason: impl fmt::Display) {
        self.send(Err(reason.to_string()));
    }

    fn send(&mut self, outcome: Result<(), String>) {
        if let Some(tx) = self.tx.take() {
            // The barrier may already have released; late reports are ignored
            let _ = tx.send(Report {
                component: self.component,
                outcome,
            });
        }
    }
}

impl Drop for ReadyHandle {
    fn drop(&mut self) {
        self.send(Err("exited before reporting".to_string()));
    }
}

/// Arrival bookkeeping; `released` flips once and never resets
#[derive(Debug)]
pub struct ReadinessState {
    expected: usize,
    received: usize,
    released: bool,
}

impl ReadinessState {
    pub fn new(expected: usize) -> Self {
        Self {
            expected,
            received: 0,
            released: expected == 0,
        }
    }

    /// Count one arrival. Returns true only for the arrival that completes the count.
    pub fn arrive(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.received += 1;
        if self.received >= self.expected {
            self.released = true;
            return true;
        }
        false
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    pub fn received(&self) -> usize {
        self.received
    }
}

/// Summary of startup once the barrier releases
#[derive(Debug, Default)]
pub struct Readiness {
    pub ready: Vec<Component>,
    pub failed: Vec<(Component, String)>,
}

impl Readiness {
    pub fn healthy(&self) -> usize {
        self.ready.len()
    }
}

pub struct ReadinessBarrier {
    state: ReadinessState,
    rx: mpsc::UnboundedReceiver<Report>,
}

impl ReadinessBarrier {
    /// `expected` is the number of configured listeners plus one for the watcher
    pub fn new(expected: usize) -> (Self, ReadySender) {
        let (tx, rx) = mpsc::unbounded_channel();
        let barrier = Self {
            state: ReadinessState::new(expected),
            rx,
        };
        (barrier, ReadySender { tx })
    }

    /// Block until every expected component has reported. Consumes the barrier,
    /// so the release can only be observed once.
    pub async fn wait(mut self) -> Readiness {
        let mut readiness = Readiness::default();

        while !self.state.is_released() {
            let Some(report) = self.rx.recv().await else {
                warn!(
                    "Readiness channel closed after {} of {} reports",
                    self.state.received(),
                    self.state.expected
                );
                break;
            };

            match report.outcome {
                Ok(()) => {
                    debug!("{} reported ready", report.component);
                    readiness.ready.push(report.component);
                }
                Err(reason) => {
                    warn!("{} failed during setup: {}", report.component, reason);
                    readiness.failed.push((report.component, reason));
                }
            }
            self.state.arrive();
        }

        readiness
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_state_releases_exactly_once() {
        let mut state = ReadinessState::new(6);
        let transitions: Vec<bool> = (0..8).map(|_| state.arrive()).collect();

        assert_eq!(transitions, vec![false, false, false, false, false, true, false, false]);
        assert!(state.is_released());
    }

    #[test]
    fn test_zero_expected_is_released_immediately() {
        let mut state = ReadinessState::new(0);
        assert!(state.is_released());
        assert!(!state.arrive());
    }

    #[tokio::test]
    async fn test_three_tcp_two_udp_and_watcher_release_after_sixth() {
        let (barrier, sender) = ReadinessBarrier::new(3 + 2 + 1);
        let drops = Arc::new(AtomicUsize::new(0));

        let components = [
            Component::Tcp(21),
            Component::Tcp(23),
            Component::Tcp(80),
            Component::Udp(53),
            Component::Udp(161),
        ];
        for component in components {
            sender.handle(component).ready();
        }

        let waiter = {
            let drops = drops.clone();
            tokio::spawn(async move {
                let readiness = barrier.wait().await;
                drops.fetch_add(1, Ordering::SeqCst);
                readiness
            })
        };

        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(drops.load(Ordering::SeqCst), 0, "released before the watcher reported");

        sender.handle(Component::Watcher).ready();
        let readiness = waiter.await.unwrap();
        assert_eq!(readiness.healthy(), 6);
        assert_eq!(drops.load(Ordering::SeqCst), 1);

        // A straggler after the release goes nowhere
        sender.handle(Component::Tcp(8080)).ready();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failures_and_dropped_handles_count_as_reports() {
        let (barrier, sender) = ReadinessBarrier::new(3);

        sender.handle(Component::Tcp(22)).failed("address in use");
        drop(sender.handle(Component::Udp(53)));
        sender.handle(Component::Watcher).ready();

        let readiness = barrier.wait().await;
        assert_eq!(readiness.ready, vec![Component::Watcher]);
        assert_eq!(readiness.failed.len(), 2);
        assert_eq!(readiness.failed[0], (Component::Tcp(22), "address in use".to_string()));
        assert_eq!(readiness.failed[1].0, Component::Udp(53));
    }

    #[tokio::test]
    async fn test_extra_reports_before_wait_do_not_overcount() {
        let (barrier, sender) = ReadinessBarrier::new(2);
        for port in [1, 2, 3, 4] {
            sender.handle(Component::Tcp(port)).ready();
        }

        let readiness = barrier.wait().await;
        assert_eq!(readiness.ready, vec![Component::Tcp(1), Component::Tcp(2)]);
    }
}
