//! Event dispatcher: the single serialization point for everything that
//! drives the assignment manager.
//!
//! Coord-store watch events and periodic timers are pumped into one bounded
//! queue with a single consumer (the master's run loop), so no two handlers
//! touch assignment state concurrently. Watch events apply backpressure;
//! timer ticks are droppable and are simply skipped when the queue is busy.

use std::time::Duration;

use silo_coord::WatchEvent;
use tokio::sync::mpsc;

#[derive(Debug)]
pub enum MasterEvent {
    Coord(WatchEvent),
    /// Scan regions-in-transition for lapsed deadlines.
    TimeoutScan,
    /// Run the balancer and enact its advice.
    Balance,
}

#[derive(Debug, Clone, Copy)]
pub struct DispatcherConfig {
    pub queue_depth: usize,
    pub timeout_scan_interval: Duration,
    pub balance_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_depth: 1024,
            timeout_scan_interval: Duration::from_secs(1),
            balance_interval: Duration::from_secs(300),
        }
    }
}

/// Wire the pumps and hand back the consumer end. Pump tasks exit when the
/// consumer is dropped or (for the coord pump) the session channel closes.
pub fn spawn(
    coord_events: mpsc::UnboundedReceiver<WatchEvent>,
    cfg: DispatcherConfig,
) -> mpsc::Receiver<MasterEvent> {
    let (tx, rx) = mpsc::channel(cfg.queue_depth.max(1));

    let coord_tx = tx.clone();
    tokio::spawn(async move {
        let mut coord_events = coord_events;
        while let Some(event) = coord_events.recv().await {
            if coord_tx.send(MasterEvent::Coord(event)).await.is_err() {
                return;
            }
        }
    });

    let scan_tx = tx.clone();
    let scan_every = cfg.timeout_scan_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(scan_every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            match scan_tx.try_send(MasterEvent::TimeoutScan) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {}
                Err(mpsc::error::TrySendError::Closed(_)) => return,
            }
        }
    });

    let balance_every = cfg.balance_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(balance_every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The immediate first tick would balance before bootstrap settles.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match tx.try_send(MasterEvent::Balance) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {}
                Err(mpsc::error::TrySendError::Closed(_)) => return,
            }
        }
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use silo_coord::{WatchEvent as Event, WatchKind};

    #[tokio::test]
    async fn coord_events_arrive_in_order() {
        let (tx, coord_rx) = mpsc::unbounded_channel();
        let cfg = DispatcherConfig {
            timeout_scan_interval: Duration::from_secs(3600),
            balance_interval: Duration::from_secs(3600),
            ..DispatcherConfig::default()
        };
        let mut rx = spawn(coord_rx, cfg);

        for name in ["/unassigned/a", "/unassigned/b", "/unassigned/c"] {
            tx.send(Event {
                path: name.to_string(),
                kind: WatchKind::NodeCreated,
            })
            .unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..3 {
            match rx.recv().await {
                Some(MasterEvent::Coord(ev)) => seen.push(ev.path),
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert_eq!(seen, vec!["/unassigned/a", "/unassigned/b", "/unassigned/c"]);
    }

    #[tokio::test]
    async fn timeout_scans_tick_without_coord_traffic() {
        let (_tx, coord_rx) = mpsc::unbounded_channel();
        let cfg = DispatcherConfig {
            timeout_scan_interval: Duration::from_millis(5),
            balance_interval: Duration::from_secs(3600),
            ..DispatcherConfig::default()
        };
        let mut rx = spawn(coord_rx, cfg);
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("tick in time");
        assert!(matches!(event, Some(MasterEvent::TimeoutScan)));
    }
}
