// src/realtime/tracker.rs
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing;

use crate::models::trip::{StatusEvent, TripStatus};
use crate::realtime::channel::{events, RealtimeChannel};
use crate::realtime::supervisor::{ReconnectionSupervisor, RestoreRegistration};
use crate::services::trip_service::TripOperations;

struct TrackerState {
    inert: bool,
    pump: Option<JoinHandle<()>>,
    restore: Option<RestoreRegistration>,
}

struct TrackerInner {
    trip_id: i64,
    supervisor: ReconnectionSupervisor,
    trips: Arc<dyn TripOperations>,
    status_tx: watch::Sender<Option<TripStatus>>,
    changes: broadcast::Sender<TripStatus>,
    state: Mutex<TrackerState>,
}

impl TrackerInner {
    /// Runs one pushed (or re-fetched) status through the admission rule.
    /// Returns whether the value was accepted. Discards are routine, not
    /// errors: duplicates and stale deliveries are expected after reconnects.
    fn apply(&self, incoming: TripStatus) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.inert {
            return false;
        }

        let current = *self.status_tx.borrow();
        let accepted = match current {
            // first event after attach seeds the baseline
            None => true,
            Some(known) => known.admits(incoming),
        };

        if accepted {
            self.status_tx.send_replace(Some(incoming));
            let _ = self.changes.send(incoming);
            tracing::info!("trip {} status advanced to {}", self.trip_id, incoming);
            if incoming.is_terminal() {
                state.inert = true;
            }
        } else {
            tracing::debug!(
                "discarding stale status {} for trip {} (known: {:?})",
                incoming,
                self.trip_id,
                current
            );
        }
        accepted
    }

    fn finish(&self) {
        let (pump, restore) = {
            let mut state = self.state.lock().unwrap();
            state.inert = true;
            (state.pump.take(), state.restore.take())
        };
        if let Some(registration) = restore {
            self.supervisor.deregister_restore(registration);
        }
        if let Some(task) = pump {
            // no-op when called from the pump itself; it exits right after
            task.abort();
        }
    }
}

/// Follows the server-pushed status stream for one trip and exposes a
/// de-duplicated, monotonically advancing status value.
///
/// Side effects of particular transitions (arrival chime, hand-off to the
/// rating flow) belong to the UI layer watching the change stream, not here.
pub struct TripStatusTracker {
    inner: Arc<TrackerInner>,
}

impl TripStatusTracker {
    /// Subscribes to the trip's status channel and starts consuming events.
    /// The first event received seeds the baseline; after a terminal status
    /// the tracker unsubscribes and goes inert.
    pub fn attach(
        supervisor: &ReconnectionSupervisor,
        trips: Arc<dyn TripOperations>,
        trip_id: i64,
    ) -> Self {
        let (status_tx, _) = watch::channel(None);
        let (changes, _) = broadcast::channel(32);

        let inner = Arc::new(TrackerInner {
            trip_id,
            supervisor: supervisor.clone(),
            trips,
            status_tx,
            changes,
            state: Mutex::new(TrackerState {
                inert: false,
                pump: None,
                restore: None,
            }),
        });

        let mut subscription = supervisor.channel().on(&events::new_status_trip(trip_id));

        let pump_inner = Arc::clone(&inner);
        let pump = tokio::spawn(async move {
            while let Some(payload) = subscription.next().await {
                let event = match StatusEvent::decode(pump_inner.trip_id, &payload) {
                    Ok(event) => event,
                    Err(e) => {
                        tracing::debug!("unparseable status push: {}", e);
                        continue;
                    }
                };
                if event.trip_id != pump_inner.trip_id {
                    continue;
                }
                if pump_inner.apply(event.status) && event.status.is_terminal() {
                    break;
                }
            }
            // dropping the subscription releases the handler
            pump_inner.finish();
        });

        // After a reconnect the push stream has a gap; re-fetch the
        // authoritative record and let the admission rule absorb it.
        let restore_inner = Arc::downgrade(&inner);
        let registration = supervisor.register_restore(Box::new(move || {
            let weak = restore_inner.clone();
            Box::pin(async move {
                let Some(inner) = weak.upgrade() else { return };
                match inner.trips.get_trip(inner.trip_id).await {
                    Ok(record) => {
                        if inner.apply(record.status) && record.status.is_terminal() {
                            inner.finish();
                        }
                    }
                    Err(e) => tracing::debug!("status catch-up failed: {}", e),
                }
            })
        }));

        {
            let mut state = inner.state.lock().unwrap();
            state.pump = Some(pump);
            state.restore = Some(registration);
        }

        tracing::info!("tracking status for trip {}", trip_id);
        Self { inner }
    }

    pub fn trip_id(&self) -> i64 {
        self.inner.trip_id
    }

    pub fn current(&self) -> Option<TripStatus> {
        *self.inner.status_tx.borrow()
    }

    /// Watch handle for UI bindings.
    pub fn status_watch(&self) -> watch::Receiver<Option<TripStatus>> {
        self.inner.status_tx.subscribe()
    }

    /// Stream of accepted transitions, in order.
    pub fn changes(&self) -> broadcast::Receiver<TripStatus> {
        self.inner.changes.subscribe()
    }

    pub fn is_inert(&self) -> bool {
        self.inner.state.lock().unwrap().inert
    }

    /// Stops consuming events. Idempotent; also called implicitly once a
    /// terminal status lands.
    pub fn detach(&self) {
        self.inner.finish();
    }
}

impl Drop for TripStatusTracker {
    fn drop(&mut self) {
        self.inner.finish();
    }
}
