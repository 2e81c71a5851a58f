// src/session/trip_session.rs
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing;

use crate::config::SessionPolicy;
use crate::errors::{OkadaError, OkadaResult};
use crate::models::offer::DriverOffer;
use crate::models::trip::{TripDraft, TripStatus};
use crate::realtime::channel::{events, RealtimeChannel};
use crate::realtime::supervisor::{ReconnectionSupervisor, RestoreRegistration};
use crate::services::offer_service::OfferOperations;
use crate::services::trip_service::TripOperations;
use crate::session::offer_collection::{OfferCollection, OfferUpsert};
use crate::utils::ids::{CorrelationId, IdKind};

/// Where one ride request currently stands, from the rider's side.
/// DriverAssigned, Expired and Cancelled are final for the session; a
/// DriverAssigned trip continues under a `TripStatusTracker`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Draft,
    Submitting,
    AwaitingOffers,
    DriverAssigned,
    Expired,
    Cancelled,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionPhase::Draft => "Draft",
            SessionPhase::Submitting => "Submitting",
            SessionPhase::AwaitingOffers => "AwaitingOffers",
            SessionPhase::DriverAssigned => "DriverAssigned",
            SessionPhase::Expired => "Expired",
            SessionPhase::Cancelled => "Cancelled",
        };
        write!(f, "{}", name)
    }
}

/// Everything the search screen needs to render, pushed as it happens.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    PhaseChanged(SessionPhase),
    CountdownTick(u64),
    OfferReceived { offer_id: i64, updated: bool },
    OfferRemoved { offer_id: i64 },
    OffersClosed,
    AutoMatched { offer_id: i64 },
    AssignmentFailed(String),
}

struct SessionState {
    phase: SessionPhase,
    trip_id: Option<i64>,
    assigned_driver: Option<i64>,
    assigning: bool,
    countdown: Option<JoinHandle<()>>,
    pump: Option<JoinHandle<()>>,
    restore: Option<RestoreRegistration>,
}

struct SessionInner {
    session_id: CorrelationId,
    trips: Arc<dyn TripOperations>,
    offers_api: Arc<dyn OfferOperations>,
    supervisor: ReconnectionSupervisor,
    policy: SessionPolicy,
    state: Mutex<SessionState>,
    phase_tx: watch::Sender<SessionPhase>,
    countdown_tx: watch::Sender<u64>,
    events: broadcast::Sender<SessionEvent>,
    offers: OfferCollection,
}

impl SessionInner {
    fn phase(&self) -> SessionPhase {
        self.state.lock().unwrap().phase
    }

    fn set_phase(&self, state: &mut SessionState, phase: SessionPhase) {
        state.phase = phase;
        self.phase_tx.send_replace(phase);
        let _ = self.events.send(SessionEvent::PhaseChanged(phase));
    }

    fn start_countdown(inner: &Arc<SessionInner>, trip_id: i64) {
        let total = inner.policy.offer_window.as_secs();
        inner.countdown_tx.send_replace(total);

        let task_inner = Arc::clone(inner);
        let handle = tokio::spawn(async move {
            let mut remaining = total;
            let mut ticks = interval(task_inner.policy.countdown_tick);
            ticks.tick().await;
            while remaining > 0 {
                ticks.tick().await;
                remaining -= 1;
                task_inner.countdown_tx.send_replace(remaining);
                let _ = task_inner
                    .events
                    .send(SessionEvent::CountdownTick(remaining));
            }
            task_inner.expire(trip_id).await;
        });

        let mut state = inner.state.lock().unwrap();
        if let Some(old) = state.countdown.replace(handle) {
            old.abort();
        }
    }

    /// Offer window ran out. The phase is re-checked around the status
    /// request: an acceptance or cancel that slipped in while the request was
    /// in flight wins, and the stale expiry changes nothing.
    async fn expire(&self, trip_id: i64) {
        {
            let state = self.state.lock().unwrap();
            if state.phase != SessionPhase::AwaitingOffers || state.trip_id != Some(trip_id) {
                return;
            }
        }

        tracing::info!("offer window elapsed for trip {}", trip_id);
        if let Err(e) = self
            .trips
            .update_trip_status(trip_id, TripStatus::Expired)
            .await
        {
            tracing::warn!("expiry status request failed: {}", e);
        }
        self.emit_status_update(trip_id, TripStatus::Expired).await;

        let cleanup = {
            let mut state = self.state.lock().unwrap();
            if state.phase != SessionPhase::AwaitingOffers {
                return;
            }
            self.set_phase(&mut state, SessionPhase::Expired);
            (state.pump.take(), state.restore.take())
        };
        self.release_listening(cleanup);
        self.offers.clear();
    }

    async fn emit_status_update(&self, trip_id: i64, status: TripStatus) {
        let payload = serde_json::json!({ "trip_id": trip_id, "status": status });
        if let Err(e) = self
            .supervisor
            .channel()
            .emit(events::UPDATE_STATUS_TRIP, payload)
            .await
        {
            tracing::debug!("status update emit skipped: {}", e);
        }
    }

    fn release_listening(&self, cleanup: (Option<JoinHandle<()>>, Option<RestoreRegistration>)) {
        let (pump, restore) = cleanup;
        if let Some(task) = pump {
            task.abort();
        }
        if let Some(registration) = restore {
            self.supervisor.deregister_restore(registration);
        }
    }

    async fn open_offer_listening(inner: &Arc<SessionInner>, trip_id: i64) {
        let mut subscription = inner
            .supervisor
            .channel()
            .on(&events::created_driver_offer(trip_id));

        // offers that raced the subscription are only visible via REST
        match inner.offers_api.list_offers_for_trip(trip_id).await {
            Ok(existing) => {
                for offer in existing {
                    inner.admit_offer(offer);
                }
            }
            Err(e) => tracing::debug!("offer catch-up failed: {}", e),
        }

        let pump_inner = Arc::clone(inner);
        let pump = tokio::spawn(async move {
            while let Some(payload) = subscription.next().await {
                SessionInner::handle_offer_push(&pump_inner, trip_id, payload).await;
            }
        });

        // after a reconnect, re-list; the upsert rule absorbs duplicates
        let weak = Arc::downgrade(inner);
        let registration = inner.supervisor.register_restore(Box::new(move || {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(session) = weak.upgrade() else { return };
                if session.phase() != SessionPhase::AwaitingOffers {
                    return;
                }
                match session.offers_api.list_offers_for_trip(trip_id).await {
                    Ok(existing) => {
                        for offer in existing {
                            session.admit_offer(offer);
                        }
                    }
                    Err(e) => tracing::debug!("offer catch-up failed: {}", e),
                }
            })
        }));

        let replaced = {
            let mut state = inner.state.lock().unwrap();
            (state.pump.replace(pump), state.restore.replace(registration))
        };
        inner.release_listening(replaced);
    }

    fn admit_offer(&self, offer: DriverOffer) {
        if self.phase() != SessionPhase::AwaitingOffers {
            return;
        }
        let offer_id = offer.id;
        let updated = self.offers.add(offer) == OfferUpsert::Updated;
        let _ = self
            .events
            .send(SessionEvent::OfferReceived { offer_id, updated });
    }

    async fn handle_offer_push(inner: &Arc<SessionInner>, trip_id: i64, payload: serde_json::Value) {
        if inner.phase() != SessionPhase::AwaitingOffers {
            return;
        }

        let batch = match DriverOffer::decode_push(&payload) {
            Ok(batch) => batch,
            Err(e) => {
                tracing::warn!("dropping malformed offer push: {}", e);
                return;
            }
        };
        let batch: Vec<DriverOffer> = batch
            .into_iter()
            .filter(|offer| offer.trip_request_id == trip_id)
            .collect();
        let Some(first) = batch.first().cloned() else {
            return;
        };

        for offer in batch {
            inner.admit_offer(offer);
        }

        // The server resolves exact-fare offers on its own; re-fetch the
        // authoritative record and mirror that decision instead of making our
        // own. Only the first offer of a push batch is compared.
        let record = match inner.trips.get_trip(trip_id).await {
            Ok(record) => record,
            Err(e) => {
                tracing::debug!("trip re-fetch failed: {}", e);
                return;
            }
        };
        let Some(current_fare) = record.fare_offered_value() else {
            tracing::debug!(
                "trip {} fare '{}' is not numeric, skipping auto-match",
                trip_id,
                record.fare_offered
            );
            return;
        };

        if current_fare == first.fare_offered {
            // the re-fetch may have resolved after the rider already acted
            if inner.phase() != SessionPhase::AwaitingOffers {
                return;
            }
            tracing::info!(
                "offer {} matches trip {} fare exactly, auto-accepting",
                first.id,
                trip_id
            );
            // run the acceptance outside the pump: succeeding tears the pump
            // down, which must not cancel the acceptance itself
            let accept_inner = Arc::clone(inner);
            tokio::spawn(async move {
                match SessionInner::accept(&accept_inner, &first).await {
                    Ok(()) => {
                        let _ = accept_inner
                            .events
                            .send(SessionEvent::AutoMatched { offer_id: first.id });
                    }
                    Err(e) => {
                        tracing::warn!("auto-match acceptance failed: {}", e);
                        let _ = accept_inner
                            .events
                            .send(SessionEvent::AssignmentFailed(e.to_string()));
                    }
                }
            });
        }
    }

    async fn accept(inner: &Arc<SessionInner>, offer: &DriverOffer) -> OkadaResult<()> {
        let trip_id = {
            let mut state = inner.state.lock().unwrap();
            if state.phase != SessionPhase::AwaitingOffers {
                return Err(OkadaError::invalid_phase("accept offer", state.phase));
            }
            if state.assigning {
                return Err(OkadaError::assignment("another acceptance is in flight"));
            }
            let Some(trip_id) = state.trip_id else {
                return Err(OkadaError::invalid_phase("accept offer", state.phase));
            };
            state.assigning = true;
            trip_id
        };

        let result = inner
            .trips
            .assign_driver(trip_id, offer.driver_id, offer.fare_offered)
            .await;

        let accepted = {
            let mut state = inner.state.lock().unwrap();
            state.assigning = false;
            match &result {
                Ok(true) => {
                    if state.phase != SessionPhase::AwaitingOffers {
                        return Err(OkadaError::invalid_phase("accept offer", state.phase));
                    }
                    state.assigned_driver = Some(offer.driver_id);
                    inner.set_phase(&mut state, SessionPhase::DriverAssigned);
                    if let Some(countdown) = state.countdown.take() {
                        countdown.abort();
                    }
                    Some((state.pump.take(), state.restore.take()))
                }
                _ => None,
            }
        };

        match result {
            Ok(true) => {
                if let Some(cleanup) = accepted {
                    inner.release_listening(cleanup);
                }
                inner.offers.clear();
                let payload = serde_json::json!({
                    "trip_id": trip_id,
                    "driver_id": offer.driver_id,
                    "fare": offer.fare_offered,
                });
                if let Err(e) = inner
                    .supervisor
                    .channel()
                    .emit(events::NEW_DRIVER_ASSIGNED, payload)
                    .await
                {
                    tracing::debug!("driver-assigned emit skipped: {}", e);
                }
                tracing::info!("driver {} assigned to trip {}", offer.driver_id, trip_id);
                Ok(())
            }
            Ok(false) => Err(OkadaError::assignment("server declined the assignment")),
            Err(e) => Err(OkadaError::assignment(e.to_string())),
        }
    }
}

/// One outstanding ride request: draft submission, bounded offer search,
/// acceptance or cancellation. Instantiated per search; screens hold a
/// reference and render off the watch/event streams.
pub struct TripRequestSession {
    inner: Arc<SessionInner>,
}

impl TripRequestSession {
    pub fn new(
        trips: Arc<dyn TripOperations>,
        offers_api: Arc<dyn OfferOperations>,
        supervisor: ReconnectionSupervisor,
        policy: SessionPolicy,
    ) -> Self {
        let (phase_tx, _) = watch::channel(SessionPhase::Draft);
        let (countdown_tx, _) = watch::channel(0);
        let (events_tx, _) = broadcast::channel(256);

        Self {
            inner: Arc::new(SessionInner {
                session_id: CorrelationId::generate(IdKind::Session),
                trips,
                offers_api,
                supervisor,
                policy,
                state: Mutex::new(SessionState {
                    phase: SessionPhase::Draft,
                    trip_id: None,
                    assigned_driver: None,
                    assigning: false,
                    countdown: None,
                    pump: None,
                    restore: None,
                }),
                phase_tx,
                countdown_tx,
                events: events_tx,
                offers: OfferCollection::new(),
            }),
        }
    }

    pub fn session_id(&self) -> &CorrelationId {
        &self.inner.session_id
    }

    pub fn phase(&self) -> SessionPhase {
        self.inner.phase()
    }

    pub fn phase_watch(&self) -> watch::Receiver<SessionPhase> {
        self.inner.phase_tx.subscribe()
    }

    /// Seconds left in the offer window.
    pub fn countdown_watch(&self) -> watch::Receiver<u64> {
        self.inner.countdown_tx.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn offers(&self) -> &OfferCollection {
        &self.inner.offers
    }

    pub fn trip_id(&self) -> Option<i64> {
        self.inner.state.lock().unwrap().trip_id
    }

    pub fn assigned_driver_id(&self) -> Option<i64> {
        self.inner.state.lock().unwrap().assigned_driver
    }

    /// Validates and submits the draft. On success the session starts its
    /// offer window and begins collecting pushed offers; on a rejected or
    /// failed creation it returns to Draft for a retry.
    pub async fn submit(&self, draft: &TripDraft) -> OkadaResult<i64> {
        draft.validate()?;

        {
            let mut state = self.inner.state.lock().unwrap();
            if state.phase != SessionPhase::Draft {
                return Err(OkadaError::invalid_phase("submit", state.phase));
            }
            self.inner.set_phase(&mut state, SessionPhase::Submitting);
        }

        tracing::info!(
            "submitting trip request {} in session {}",
            draft.correlation_id,
            self.inner.session_id
        );

        let record = match self.inner.trips.create_trip(draft).await {
            Ok(record) => record,
            Err(e) => {
                let mut state = self.inner.state.lock().unwrap();
                self.inner.set_phase(&mut state, SessionPhase::Draft);
                tracing::warn!("trip submission failed: {}", e);
                return Err(OkadaError::submission(e.to_string()));
            }
        };

        let trip_id = record.id;
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.phase != SessionPhase::Submitting {
                // torn down while the request was in flight
                return Err(OkadaError::invalid_phase("submit", state.phase));
            }
            state.trip_id = Some(trip_id);
            self.inner.set_phase(&mut state, SessionPhase::AwaitingOffers);
        }

        SessionInner::start_countdown(&self.inner, trip_id);
        SessionInner::open_offer_listening(&self.inner, trip_id).await;

        // drivers nearby learn about the request over the channel too
        let payload = serde_json::to_value(&record).unwrap_or(serde_json::Value::Null);
        if let Err(e) = self
            .inner
            .supervisor
            .channel()
            .emit(events::NEW_CLIENT_REQUEST, payload)
            .await
        {
            tracing::debug!("new-request emit skipped: {}", e);
        }

        Ok(trip_id)
    }

    /// Accepts a specific offer. On a declined or failed assignment the
    /// session stays in AwaitingOffers so the rider can retry or pick
    /// another offer.
    pub async fn accept_offer(&self, offer: &DriverOffer) -> OkadaResult<()> {
        SessionInner::accept(&self.inner, offer).await
    }

    pub async fn accept_offer_by_id(&self, offer_id: i64) -> OkadaResult<()> {
        let offer = self.inner.offers.get(offer_id).ok_or_else(|| {
            OkadaError::assignment(format!("offer {} is no longer available", offer_id))
        })?;
        SessionInner::accept(&self.inner, &offer).await
    }

    /// Drops an offer from the visible set.
    pub fn reject_offer(&self, offer_id: i64) -> bool {
        let removed = self.inner.offers.remove(offer_id);
        if removed {
            let _ = self.inner.events.send(SessionEvent::OfferRemoved { offer_id });
            if self.inner.offers.is_empty() {
                let _ = self.inner.events.send(SessionEvent::OffersClosed);
            }
        }
        removed
    }

    /// Abandons the search. Valid only while offers are being collected.
    pub async fn cancel(&self) -> OkadaResult<()> {
        let trip_id = {
            let state = self.inner.state.lock().unwrap();
            if state.phase != SessionPhase::AwaitingOffers {
                return Err(OkadaError::invalid_phase("cancel", state.phase));
            }
            let Some(trip_id) = state.trip_id else {
                return Err(OkadaError::invalid_phase("cancel", state.phase));
            };
            trip_id
        };

        // abandoned searches land in the server's expired bucket
        if let Err(e) = self
            .inner
            .trips
            .update_trip_status(trip_id, TripStatus::Expired)
            .await
        {
            tracing::warn!("cancel status request failed: {}", e);
        }
        self.inner
            .emit_status_update(trip_id, TripStatus::Expired)
            .await;

        let cleanup = {
            let mut state = self.inner.state.lock().unwrap();
            if state.phase != SessionPhase::AwaitingOffers {
                // an acceptance resolved while the request was in flight
                return Err(OkadaError::invalid_phase("cancel", state.phase));
            }
            self.inner.set_phase(&mut state, SessionPhase::Cancelled);
            if let Some(countdown) = state.countdown.take() {
                countdown.abort();
            }
            (state.pump.take(), state.restore.take())
        };
        self.inner.release_listening(cleanup);
        self.inner.offers.clear();

        tracing::info!("trip {} search cancelled by rider", trip_id);
        Ok(())
    }

    /// Cancels every timer and subscription. Nothing fires afterwards.
    pub fn teardown(&self) {
        let cleanup = {
            let mut state = self.inner.state.lock().unwrap();
            if let Some(countdown) = state.countdown.take() {
                countdown.abort();
            }
            (state.pump.take(), state.restore.take())
        };
        self.inner.release_listening(cleanup);
        self.inner.offers.clear();
    }
}

impl Drop for TripRequestSession {
    fn drop(&mut self) {
        self.teardown();
    }
}
