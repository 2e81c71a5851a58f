pub mod config;
pub mod errors;
pub mod models;
pub mod realtime;
pub mod services;
pub mod session;
pub mod state;
pub mod utils;

// Re-export commonly used types
pub use errors::{FieldError, OkadaError, OkadaResult};
pub use models::{
    ConnectionQuality, ConnectionState, DriverOffer, DriverPosition, NetworkStatus, TripDraft,
    TripRecord, TripStatus,
};
pub use realtime::{
    ConnectionEvent, DriverPositionFeed, InMemoryChannel, RealtimeChannel, ReconnectionSupervisor,
    TripStatusTracker, WsChannel,
};
pub use session::{OfferCollection, SessionEvent, SessionPhase, TripRequestSession};
pub use state::{CoreConfig, CoreState};
