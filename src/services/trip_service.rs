// src/services/trip_service.rs
use async_trait::async_trait;
use chrono::Utc;
use nanoid::nanoid;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tracing;

use crate::{
    errors::OkadaError as AppError,
    models::trip::{TripDraft, TripRecord, TripStatus},
    services::auth_service::AuthSession,
};

/// Trip CRUD collaborator. Every mutation here is a *request*: the server's
/// pushed status events remain the only authority on what actually happened.
#[async_trait]
pub trait TripOperations: Send + Sync {
    async fn create_trip(&self, draft: &TripDraft) -> Result<TripRecord, AppError>;
    async fn get_trip(&self, trip_id: i64) -> Result<TripRecord, AppError>;
    async fn update_trip_status(&self, trip_id: i64, status: TripStatus) -> Result<bool, AppError>;
    async fn assign_driver(
        &self,
        trip_id: i64,
        driver_id: i64,
        fare: f64,
    ) -> Result<bool, AppError>;
}

pub struct HttpTripService {
    base_url: String,
    client: reqwest::Client,
    auth: Arc<dyn AuthSession>,
}

impl HttpTripService {
    pub fn new(base_url: impl Into<String>, auth: Arc<dyn AuthSession>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
            auth,
        }
    }

    async fn bearer(&self) -> Result<String, AppError> {
        self.auth.current_token().await
    }

    async fn read_error(response: reqwest::Response) -> AppError {
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable body>".to_string());
        AppError::HttpStatus { status, body }
    }
}

#[async_trait]
impl TripOperations for HttpTripService {
    async fn create_trip(&self, draft: &TripDraft) -> Result<TripRecord, AppError> {
        tracing::info!(
            "Creating trip request {} for rider {}",
            draft.correlation_id,
            draft.rider_id
        );

        let token = self.bearer().await?;
        let response = self
            .client
            .post(format!("{}/client-requests", self.base_url))
            .bearer_auth(token)
            // retried submits must not create a second trip
            .header("Idempotency-Key", draft.correlation_id.as_str())
            .header("X-Request-Id", nanoid!(12))
            .json(draft)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::read_error(response).await);
        }

        let record: TripRecord = response.json().await?;
        tracing::info!("Trip request created with id {}", record.id);
        Ok(record)
    }

    async fn get_trip(&self, trip_id: i64) -> Result<TripRecord, AppError> {
        tracing::debug!("Fetching trip {}", trip_id);

        let token = self.bearer().await?;
        let response = self
            .client
            .get(format!("{}/client-requests/{}", self.base_url, trip_id))
            .bearer_auth(token)
            .header("X-Request-Id", nanoid!(12))
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(AppError::trip_not_found(trip_id));
        }
        if !response.status().is_success() {
            return Err(Self::read_error(response).await);
        }

        Ok(response.json().await?)
    }

    async fn update_trip_status(&self, trip_id: i64, status: TripStatus) -> Result<bool, AppError> {
        tracing::info!("Requesting status {} for trip {}", status, trip_id);

        let token = self.bearer().await?;
        let response = self
            .client
            .patch(format!(
                "{}/client-requests/{}/status",
                self.base_url, trip_id
            ))
            .bearer_auth(token)
            .header("X-Request-Id", nanoid!(12))
            .json(&serde_json::json!({ "status": status }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::read_error(response).await);
        }
        Ok(true)
    }

    async fn assign_driver(
        &self,
        trip_id: i64,
        driver_id: i64,
        fare: f64,
    ) -> Result<bool, AppError> {
        tracing::info!(
            "Requesting driver {} for trip {} at fare {:.2}",
            driver_id,
            trip_id,
            fare
        );

        let token = self.bearer().await?;
        let response = self
            .client
            .post(format!(
                "{}/client-requests/{}/driver",
                self.base_url, trip_id
            ))
            .bearer_auth(token)
            .header("X-Request-Id", nanoid!(12))
            .json(&serde_json::json!({ "driver_id": driver_id, "fare": fare }))
            .send()
            .await?;

        // 409 means another rider action or the server's own matcher won the
        // race; the session stays in its offer-collecting phase.
        if response.status() == reqwest::StatusCode::CONFLICT {
            return Ok(false);
        }
        if !response.status().is_success() {
            return Err(Self::read_error(response).await);
        }
        Ok(true)
    }
}

/// In-memory trip service for tests and offline development. Failures are
/// scriptable per operation; call counters let tests assert that validation
/// short-circuits before any network touch.
pub struct MockTripService {
    trips: Mutex<HashMap<i64, TripRecord>>,
    next_id: AtomicI64,
    fail_create: Mutex<Option<String>>,
    decline_assign: Mutex<bool>,
    create_calls: AtomicU32,
    get_calls: AtomicU32,
    status_calls: AtomicU32,
    assign_calls: AtomicU32,
}

impl MockTripService {
    pub fn new() -> Self {
        Self {
            trips: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(42),
            fail_create: Mutex::new(None),
            decline_assign: Mutex::new(false),
            create_calls: AtomicU32::new(0),
            get_calls: AtomicU32::new(0),
            status_calls: AtomicU32::new(0),
            assign_calls: AtomicU32::new(0),
        }
    }

    pub fn fail_next_create(&self, reason: impl Into<String>) {
        *self.fail_create.lock().unwrap() = Some(reason.into());
    }

    pub fn decline_assignments(&self, decline: bool) {
        *self.decline_assign.lock().unwrap() = decline;
    }

    /// Overrides the stored fare string, e.g. to simulate a server-side fare
    /// adjustment between creation and offer arrival.
    pub fn set_fare_offered(&self, trip_id: i64, fare: impl Into<String>) {
        if let Some(record) = self.trips.lock().unwrap().get_mut(&trip_id) {
            record.fare_offered = fare.into();
        }
    }

    pub fn stored_trip(&self, trip_id: i64) -> Option<TripRecord> {
        self.trips.lock().unwrap().get(&trip_id).cloned()
    }

    pub fn create_calls(&self) -> u32 {
        self.create_calls.load(Ordering::Relaxed)
    }

    pub fn get_calls(&self) -> u32 {
        self.get_calls.load(Ordering::Relaxed)
    }

    pub fn status_calls(&self) -> u32 {
        self.status_calls.load(Ordering::Relaxed)
    }

    pub fn assign_calls(&self) -> u32 {
        self.assign_calls.load(Ordering::Relaxed)
    }
}

impl Default for MockTripService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TripOperations for MockTripService {
    async fn create_trip(&self, draft: &TripDraft) -> Result<TripRecord, AppError> {
        self.create_calls.fetch_add(1, Ordering::Relaxed);

        if let Some(reason) = self.fail_create.lock().unwrap().take() {
            return Err(AppError::HttpStatus {
                status: 500,
                body: reason,
            });
        }

        // the real server rejects incomplete drafts; mirror that
        draft.validate()?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (Some(pickup), Some(destination)) = (draft.pickup, draft.destination) else {
            return Err(AppError::validation("draft", "incomplete after validate"));
        };
        let record = TripRecord {
            id,
            rider_id: draft.rider_id,
            driver_id: None,
            pickup,
            destination,
            fare_offered: format!("{:.2}", draft.offered_fare),
            vehicle_class: draft.vehicle_class,
            estimate: None,
            status: TripStatus::Created,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        self.trips.lock().unwrap().insert(id, record.clone());
        Ok(record)
    }

    async fn get_trip(&self, trip_id: i64) -> Result<TripRecord, AppError> {
        self.get_calls.fetch_add(1, Ordering::Relaxed);
        self.trips
            .lock()
            .unwrap()
            .get(&trip_id)
            .cloned()
            .ok_or_else(|| AppError::trip_not_found(trip_id))
    }

    async fn update_trip_status(&self, trip_id: i64, status: TripStatus) -> Result<bool, AppError> {
        self.status_calls.fetch_add(1, Ordering::Relaxed);
        let mut trips = self.trips.lock().unwrap();
        let record = trips
            .get_mut(&trip_id)
            .ok_or_else(|| AppError::trip_not_found(trip_id))?;
        record.status = status;
        record.updated_at = Utc::now();
        Ok(true)
    }

    async fn assign_driver(
        &self,
        trip_id: i64,
        driver_id: i64,
        _fare: f64,
    ) -> Result<bool, AppError> {
        self.assign_calls.fetch_add(1, Ordering::Relaxed);

        if *self.decline_assign.lock().unwrap() {
            return Ok(false);
        }

        let mut trips = self.trips.lock().unwrap();
        let record = trips
            .get_mut(&trip_id)
            .ok_or_else(|| AppError::trip_not_found(trip_id))?;
        record.driver_id = Some(driver_id);
        record.status = TripStatus::Accepted;
        record.updated_at = Utc::now();
        Ok(true)
    }
}
