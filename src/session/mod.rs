// src/session/mod.rs
pub mod offer_collection;
pub mod trip_session;

pub use offer_collection::{OfferCollection, OfferUpsert};
pub use trip_session::{SessionEvent, SessionPhase, TripRequestSession};
