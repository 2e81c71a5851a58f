// src/realtime/mod.rs
pub mod channel;
pub mod positions;
pub mod supervisor;
pub mod tracker;

pub use channel::{ChannelError, EventSubscription, InMemoryChannel, RealtimeChannel, WsChannel};
pub use positions::{DriverPositionFeed, PositionEvent};
pub use supervisor::{ConnectionEvent, ReconnectionSupervisor, RestoreRegistration};
pub use tracker::TripStatusTracker;
