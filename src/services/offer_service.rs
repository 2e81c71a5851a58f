// src/services/offer_service.rs
use async_trait::async_trait;
use nanoid::nanoid;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing;

use crate::{
    errors::OkadaError as AppError, models::offer::DriverOffer,
    services::auth_service::AuthSession,
};

/// Offer CRUD collaborator. `create_offer` exists for the driver-side build
/// of the app; the rider core only lists, as a catch-up for offers pushed
/// while the socket was down.
#[async_trait]
pub trait OfferOperations: Send + Sync {
    async fn create_offer(&self, offer: &DriverOffer) -> Result<DriverOffer, AppError>;
    async fn list_offers_for_trip(&self, trip_id: i64) -> Result<Vec<DriverOffer>, AppError>;
}

pub struct HttpOfferService {
    base_url: String,
    client: reqwest::Client,
    auth: Arc<dyn AuthSession>,
}

impl HttpOfferService {
    pub fn new(base_url: impl Into<String>, auth: Arc<dyn AuthSession>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
            auth,
        }
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
impl OfferOperations for HttpOfferService {
    async fn create_offer(&self, offer: &DriverOffer) -> Result<DriverOffer, AppError> {
        tracing::info!(
            "Creating offer from driver {} for trip {}",
            offer.driver_id,
            offer.trip_request_id
        );

        let token = self.auth.current_token().await?;
        let response = self
            .client
            .post(format!("{}/driver-offers", self.base_url))
            .bearer_auth(token)
            .header("X-Request-Id", nanoid!(12))
            .json(offer)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::read_error(response).await);
        }
        Ok(response.json().await?)
    }

    async fn list_offers_for_trip(&self, trip_id: i64) -> Result<Vec<DriverOffer>, AppError> {
        tracing::debug!("Listing offers for trip {}", trip_id);

        let token = self.auth.current_token().await?;
        let response = self
            .client
            .get(format!(
                "{}/client-requests/{}/offers",
                self.base_url, trip_id
            ))
            .bearer_auth(token)
            .header("X-Request-Id", nanoid!(12))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::read_error(response).await);
        }
        Ok(response.json().await?)
    }
}

/// In-memory offer service for tests and offline development.
pub struct MockOfferService {
    offers: Mutex<HashMap<i64, Vec<DriverOffer>>>,
}

impl MockOfferService {
    pub fn new() -> Self {
        Self {
            offers: Mutex::new(HashMap::new()),
        }
    }

    /// Seeds an offer as if a driver had already responded.
    pub fn seed(&self, offer: DriverOffer) {
        self.offers
            .lock()
            .unwrap()
            .entry(offer.trip_request_id)
            .or_default()
            .push(offer);
    }
}

impl Default for MockOfferService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OfferOperations for MockOfferService {
    async fn create_offer(&self, offer: &DriverOffer) -> Result<DriverOffer, AppError> {
        self.seed(offer.clone());
        Ok(offer.clone())
    }

    async fn list_offers_for_trip(&self, trip_id: i64) -> Result<Vec<DriverOffer>, AppError> {
        Ok(self
            .offers
            .lock()
            .unwrap()
            .get(&trip_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::offer::{DriverSnapshot, VehicleSnapshot};

    fn offer(id: i64, trip_id: i64) -> DriverOffer {
        DriverOffer {
            id,
            trip_request_id: trip_id,
            driver_id: 7,
            fare_offered: 15.0,
            eta_minutes: 4,
            distance_km: 1.1,
            driver: DriverSnapshot {
                name: "Ama".to_string(),
                rating: 4.9,
                total_trips: 310,
                vehicle: VehicleSnapshot {
                    make: "Hyundai".to_string(),
                    model: "i10".to_string(),
                    color: "red".to_string(),
                    license_plate: "GT 2210-24".to_string(),
                },
            },
        }
    }

    #[tokio::test]
    async fn listing_scopes_by_trip() {
        let service = MockOfferService::new();
        service.seed(offer(1, 42));
        service.seed(offer(2, 42));
        service.seed(offer(3, 77));

        let listed = service.list_offers_for_trip(42).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(service.list_offers_for_trip(99).await.unwrap().is_empty());
    }
}
