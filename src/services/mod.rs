// src/services/mod.rs
pub mod auth_service;
pub mod offer_service;
pub mod trip_service;

pub use auth_service::{spawn_refresh_loop, AuthSession, SharedTokenSession};
pub use offer_service::{HttpOfferService, MockOfferService, OfferOperations};
pub use trip_service::{HttpTripService, MockTripService, TripOperations};
