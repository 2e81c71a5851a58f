// src/state.rs
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing;

use crate::config::{AuthPolicy, ReconnectPolicy, SessionPolicy};
use crate::realtime::channel::{InMemoryChannel, RealtimeChannel, WsChannel};
use crate::realtime::positions::DriverPositionFeed;
use crate::realtime::supervisor::ReconnectionSupervisor;
use crate::realtime::tracker::TripStatusTracker;
use crate::services::auth_service::{spawn_refresh_loop, AuthSession};
use crate::services::offer_service::{HttpOfferService, MockOfferService, OfferOperations};
use crate::services::trip_service::{HttpTripService, MockTripService, TripOperations};
use crate::session::trip_session::TripRequestSession;

#[derive(Clone)]
pub struct CoreConfig {
    pub api_base_url: String,
    pub realtime_url: String,
    pub reconnect: ReconnectPolicy,
    pub session: SessionPolicy,
    pub auth: AuthPolicy,
}

impl CoreConfig {
    pub fn new(api_base_url: impl Into<String>, realtime_url: impl Into<String>) -> Self {
        Self {
            api_base_url: api_base_url.into(),
            realtime_url: realtime_url.into(),
            reconnect: ReconnectPolicy::default(),
            session: SessionPolicy::default(),
            auth: AuthPolicy::default(),
        }
    }
}

/// Wires the core together for the host app: one shared channel and
/// supervisor underneath, sessions and trackers created per screen.
pub struct CoreState {
    pub trips: Arc<dyn TripOperations>,
    pub offers: Arc<dyn OfferOperations>,
    pub channel: Arc<dyn RealtimeChannel>,
    pub supervisor: ReconnectionSupervisor,
    pub auth: Arc<dyn AuthSession>,
    pub config: CoreConfig,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

impl CoreState {
    pub fn new(config: CoreConfig, auth: Arc<dyn AuthSession>) -> Self {
        let channel: Arc<dyn RealtimeChannel> = Arc::new(
            WsChannel::new(config.realtime_url.clone())
                .with_connect_timeout(config.reconnect.confirm_timeout),
        );
        let supervisor =
            ReconnectionSupervisor::new(channel.clone(), auth.clone(), config.reconnect.clone());

        Self {
            trips: Arc::new(HttpTripService::new(config.api_base_url.clone(), auth.clone())),
            offers: Arc::new(HttpOfferService::new(config.api_base_url.clone(), auth.clone())),
            channel,
            supervisor,
            auth,
            config,
            refresh_task: Mutex::new(None),
        }
    }

    /// Fully in-process wiring for tests and offline development.
    pub fn in_memory(config: CoreConfig, auth: Arc<dyn AuthSession>) -> Self {
        tracing::warn!("using in-memory services, nothing will reach a server");
        let channel: Arc<dyn RealtimeChannel> = Arc::new(InMemoryChannel::new());
        let supervisor =
            ReconnectionSupervisor::new(channel.clone(), auth.clone(), config.reconnect.clone());

        Self {
            trips: Arc::new(MockTripService::new()),
            offers: Arc::new(MockOfferService::new()),
            channel,
            supervisor,
            auth,
            config,
            refresh_task: Mutex::new(None),
        }
    }

    /// Brings the realtime side up: first connection, health probe, token
    /// refresh loop.
    pub fn start(&self) {
        self.supervisor.start();
        self.supervisor.trigger_reconnect();

        let mut slot = self.refresh_task.lock().unwrap();
        if slot.is_none() {
            *slot = Some(spawn_refresh_loop(
                self.auth.clone(),
                self.channel.clone(),
                self.config.auth.clone(),
            ));
        }
    }

    /// A fresh request session for the search screen.
    pub fn begin_session(&self) -> TripRequestSession {
        TripRequestSession::new(
            self.trips.clone(),
            self.offers.clone(),
            self.supervisor.clone(),
            self.config.session.clone(),
        )
    }

    /// Status tracking for an active trip (after driver assignment).
    pub fn track_trip(&self, trip_id: i64) -> TripStatusTracker {
        TripStatusTracker::attach(&self.supervisor, self.trips.clone(), trip_id)
    }

    /// Live position of the assigned driver for the in-trip map.
    pub fn position_feed(&self, rider_id: i64, driver_id: i64) -> DriverPositionFeed {
        DriverPositionFeed::attach(self.channel.clone(), rider_id, driver_id)
    }

    pub async fn shutdown(&self) {
        if let Some(task) = self.refresh_task.lock().unwrap().take() {
            task.abort();
        }
        self.supervisor.shutdown();
        self.channel.disconnect().await;
    }
}
