// src/realtime/positions.rs
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing;

use crate::models::offer::DriverPosition;
use crate::realtime::channel::{events, RealtimeChannel};

/// Feed-level notifications for the map layer.
#[derive(Debug, Clone, PartialEq)]
pub enum PositionEvent {
    Moved(DriverPosition),
    /// The driver's device dropped off; the last known position stays on the
    /// map but should render as stale.
    DriverDropped,
}

struct FeedInner {
    driver_id: i64,
    position_tx: watch::Sender<Option<DriverPosition>>,
    events: broadcast::Sender<PositionEvent>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl FeedInner {
    fn handle_position(&self, payload: &serde_json::Value) {
        match serde_json::from_value::<DriverPosition>(payload.clone()) {
            Ok(position) => {
                if position.driver_id != self.driver_id {
                    return;
                }
                self.position_tx.send_replace(Some(position.clone()));
                let _ = self.events.send(PositionEvent::Moved(position));
            }
            Err(e) => tracing::debug!("unparseable position push: {}", e),
        }
    }

    fn handle_disconnect(&self, payload: &serde_json::Value) {
        // payload is `{"driver_id": n}`; a missing id means "the" driver on
        // single-driver channels
        let dropped_id = payload
            .get("driver_id")
            .and_then(|value| value.as_i64())
            .unwrap_or(self.driver_id);
        if dropped_id != self.driver_id {
            return;
        }
        tracing::info!("driver {} disconnected from tracking", self.driver_id);
        let _ = self.events.send(PositionEvent::DriverDropped);
    }
}

/// Live position of the assigned driver, for the in-trip map.
///
/// Listens on the rider-scoped channel plus the global position events
/// filtered by driver id, whichever the server happens to use.
pub struct DriverPositionFeed {
    inner: Arc<FeedInner>,
}

impl DriverPositionFeed {
    pub fn attach(channel: Arc<dyn RealtimeChannel>, rider_id: i64, driver_id: i64) -> Self {
        let (position_tx, _) = watch::channel(None);
        let (events_tx, _) = broadcast::channel(64);

        let inner = Arc::new(FeedInner {
            driver_id,
            position_tx,
            events: events_tx,
            pump: Mutex::new(None),
        });

        let mut scoped = channel.on(&events::trip_new_driver_position(rider_id));
        let mut fresh = channel.on(events::NEW_DRIVER_POSITION);
        let mut moved = channel.on(events::CHANGE_DRIVER_POSITION);
        let mut dropped = channel.on(events::DRIVER_DISCONNECTED);

        let pump_inner = Arc::clone(&inner);
        let pump = tokio::spawn(async move {
            loop {
                tokio::select! {
                    payload = scoped.next() => match payload {
                        Some(payload) => pump_inner.handle_position(&payload),
                        None => break,
                    },
                    payload = fresh.next() => match payload {
                        Some(payload) => pump_inner.handle_position(&payload),
                        None => break,
                    },
                    payload = moved.next() => match payload {
                        Some(payload) => pump_inner.handle_position(&payload),
                        None => break,
                    },
                    payload = dropped.next() => match payload {
                        Some(payload) => pump_inner.handle_disconnect(&payload),
                        None => break,
                    },
                }
            }
        });
        *inner.pump.lock().unwrap() = Some(pump);

        tracing::debug!("position feed attached for driver {}", driver_id);
        Self { inner }
    }

    pub fn current(&self) -> Option<DriverPosition> {
        self.inner.position_tx.borrow().clone()
    }

    pub fn position_watch(&self) -> watch::Receiver<Option<DriverPosition>> {
        self.inner.position_tx.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<PositionEvent> {
        self.inner.events.subscribe()
    }

    pub fn detach(&self) {
        if let Some(task) = self.inner.pump.lock().unwrap().take() {
            task.abort();
        }
    }
}

impl Drop for DriverPositionFeed {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::channel::InMemoryChannel;
    use chrono::Utc;
    use serde_json::json;
    use std::time::Duration;

    fn position_json(driver_id: i64, lat: f64) -> serde_json::Value {
        json!({
            "driver_id": driver_id,
            "latitude": lat,
            "longitude": -46.63,
            "heading": 90.0,
            "speed_kmh": 32.0,
            "recorded_at": Utc::now(),
        })
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn positions_flow_through_scoped_channel() {
        let channel = Arc::new(InMemoryChannel::new());
        let feed = DriverPositionFeed::attach(channel.clone(), 7, 9);

        channel.push("trip_new_driver_position/7", position_json(9, -23.55));
        settle().await;
        assert_eq!(feed.current().unwrap().latitude, -23.55);

        channel.push("change_driver_position", position_json(9, -23.56));
        settle().await;
        assert_eq!(feed.current().unwrap().latitude, -23.56);
    }

    #[tokio::test(start_paused = true)]
    async fn other_drivers_are_filtered_out() {
        let channel = Arc::new(InMemoryChannel::new());
        let feed = DriverPositionFeed::attach(channel.clone(), 7, 9);

        channel.push("new_driver_position", position_json(1234, -23.9));
        settle().await;
        assert!(feed.current().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_keeps_last_position_but_signals() {
        let channel = Arc::new(InMemoryChannel::new());
        let feed = DriverPositionFeed::attach(channel.clone(), 7, 9);
        let mut events = feed.events();

        channel.push("trip_new_driver_position/7", position_json(9, -23.55));
        channel.push("driver_disconnected", json!({"driver_id": 9}));
        settle().await;

        assert!(feed.current().is_some());
        assert!(matches!(events.try_recv(), Ok(PositionEvent::Moved(_))));
        assert!(matches!(events.try_recv(), Ok(PositionEvent::DriverDropped)));
    }

    #[tokio::test(start_paused = true)]
    async fn detach_releases_subscriptions() {
        let channel = Arc::new(InMemoryChannel::new());
        let feed = DriverPositionFeed::attach(channel.clone(), 7, 9);

        feed.detach();
        settle().await;
        assert_eq!(channel.push("new_driver_position", position_json(9, -23.5)), 0);
    }
}
