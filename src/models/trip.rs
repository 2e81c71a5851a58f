// src/models/trip.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::{OkadaError, OkadaResult};
use crate::utils::ids::{CorrelationId, IdKind};

/// Authoritative trip status, pushed by the server. The happy path is totally
/// ordered; Cancelled and Expired are side exits reachable from any
/// non-terminal state.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TripStatus {
    Created,     // Request stored, no driver yet
    Accepted,    // Driver took the request
    OnTheWay,    // Driver heading to pickup
    Arrived,     // Driver waiting at pickup
    #[serde(alias = "started")]
    Travelling,  // Ride in progress ("started" on older server builds)
    Finished,    // Ride completed
    Cancelled,   // Rider or driver cancelled
    Expired,     // Offer window closed with no acceptance
}

impl TripStatus {
    /// Position along the happy path. Side exits have no rank.
    fn happy_path_rank(self) -> Option<u8> {
        match self {
            TripStatus::Created => Some(0),
            TripStatus::Accepted => Some(1),
            TripStatus::OnTheWay => Some(2),
            TripStatus::Arrived => Some(3),
            TripStatus::Travelling => Some(4),
            TripStatus::Finished => Some(5),
            TripStatus::Cancelled | TripStatus::Expired => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TripStatus::Finished | TripStatus::Cancelled | TripStatus::Expired
        )
    }

    /// Whether an incoming pushed status may replace the current one.
    ///
    /// Accepts forward progress along the happy path and side exits to a
    /// terminal state; rejects duplicates, regressions, and anything arriving
    /// after a terminal state. Rejection is not an error - stale and
    /// duplicated pushes are expected under reconnection.
    pub fn admits(self, incoming: TripStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        if incoming.is_terminal() {
            return true;
        }
        match (self.happy_path_rank(), incoming.happy_path_rank()) {
            (Some(current), Some(next)) => next > current,
            _ => false,
        }
    }
}

impl fmt::Display for TripStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TripStatus::Created => "created",
            TripStatus::Accepted => "accepted",
            TripStatus::OnTheWay => "on_the_way",
            TripStatus::Arrived => "arrived",
            TripStatus::Travelling => "travelling",
            TripStatus::Finished => "finished",
            TripStatus::Cancelled => "cancelled",
            TripStatus::Expired => "expired",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    pub fn in_bounds(&self) -> bool {
        (-90.0..=90.0).contains(&self.latitude) && (-180.0..=180.0).contains(&self.longitude)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VehicleClass {
    Moto,
    Economy,
    Comfort,
    Executive,
}

/// Route figures the server computed for a request.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RouteEstimate {
    pub distance_km: f64,
    pub duration_min: i32,
    pub recommended_fare: f64,
}

/// A rider's trip request before the server has accepted it. No id yet; the
/// server assigns one on creation.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TripDraft {
    pub rider_id: i64,
    pub pickup: Option<GeoPoint>,
    pub destination: Option<GeoPoint>,
    pub offered_fare: f64,
    pub vehicle_class: VehicleClass,
    /// Client-generated id used for log correlation and submit idempotency.
    pub correlation_id: CorrelationId,
}

impl TripDraft {
    pub fn new(rider_id: i64, vehicle_class: VehicleClass) -> Self {
        Self {
            rider_id,
            pickup: None,
            destination: None,
            offered_fare: 0.0,
            vehicle_class,
            correlation_id: CorrelationId::generate(IdKind::Request),
        }
    }

    /// Checks submittability. Fails on the first missing or invalid field,
    /// in the order pickup, destination, fare.
    pub fn validate(&self) -> OkadaResult<()> {
        let pickup = self
            .pickup
            .ok_or_else(|| OkadaError::validation("pickup", "pickup point is required"))?;
        if !pickup.in_bounds() {
            return Err(OkadaError::validation("pickup", "coordinates out of range"));
        }
        let destination = self
            .destination
            .ok_or_else(|| OkadaError::validation("destination", "destination point is required"))?;
        if !destination.in_bounds() {
            return Err(OkadaError::validation(
                "destination",
                "coordinates out of range",
            ));
        }
        if !self.offered_fare.is_finite() || self.offered_fare <= 0.0 {
            return Err(OkadaError::validation("fare", "fare must be positive"));
        }
        Ok(())
    }

    /// UI hint: whether the offered fare meets the server's recommendation.
    pub fn fare_within_recommendation(&self, estimate: &RouteEstimate) -> bool {
        self.offered_fare >= estimate.recommended_fare
    }
}

/// Authoritative trip record as returned by the trip service.
///
/// `fare_offered` stays in the server's decimal-string form; the auto-match
/// comparison parses it on demand so nothing is lost to reformatting.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TripRecord {
    pub id: i64,
    pub rider_id: i64,
    pub driver_id: Option<i64>,
    pub pickup: GeoPoint,
    pub destination: GeoPoint,
    pub fare_offered: String,
    pub vehicle_class: VehicleClass,
    pub estimate: Option<RouteEstimate>,
    pub status: TripStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TripRecord {
    pub fn fare_offered_value(&self) -> Option<f64> {
        self.fare_offered.trim().parse::<f64>().ok()
    }
}

/// Client -> server request to move a trip to a new status. The server push
/// remains the only authority on whether the move actually happened.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TripStatusRequest {
    pub trip_id: i64,
    pub status: TripStatus,
}

/// Decoded `new_status_trip/{tripId}` push payload.
#[derive(Debug, Deserialize, Clone)]
pub struct StatusEvent {
    pub trip_id: i64,
    pub status: TripStatus,
}

impl StatusEvent {
    /// Accepts both the full event object and a bare status string keyed to a
    /// known trip.
    pub fn decode(trip_id: i64, payload: &serde_json::Value) -> OkadaResult<Self> {
        if payload.is_object() {
            let event: StatusEvent = serde_json::from_value(payload.clone())?;
            return Ok(event);
        }
        let status: TripStatus = serde_json::from_value(payload.clone())?;
        Ok(Self { trip_id, status })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn happy_path_is_ordered() {
        use TripStatus::*;
        let path = [Created, Accepted, OnTheWay, Arrived, Travelling, Finished];
        for pair in path.windows(2) {
            assert!(pair[0].admits(pair[1]), "{} -> {}", pair[0], pair[1]);
            assert!(!pair[1].admits(pair[0]), "{} <- {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn duplicates_are_rejected() {
        use TripStatus::*;
        for status in [Created, Accepted, OnTheWay, Arrived, Travelling] {
            assert!(!status.admits(status));
        }
    }

    #[test]
    fn side_exits_from_non_terminal_only() {
        use TripStatus::*;
        assert!(Created.admits(Expired));
        assert!(Arrived.admits(Cancelled));
        assert!(Travelling.admits(Finished));
        // terminal states absorb everything
        for terminal in [Finished, Cancelled, Expired] {
            for incoming in [
                Created, Accepted, OnTheWay, Arrived, Travelling, Finished, Cancelled, Expired,
            ] {
                assert!(!terminal.admits(incoming));
            }
        }
    }

    #[test]
    fn skipping_ahead_is_forward_progress() {
        // Missed pushes must not wedge the tracker
        assert!(TripStatus::Created.admits(TripStatus::Arrived));
        assert!(TripStatus::Accepted.admits(TripStatus::Travelling));
    }

    #[test]
    fn started_alias_decodes_as_travelling() {
        let status: TripStatus = serde_json::from_value(json!("started")).unwrap();
        assert_eq!(status, TripStatus::Travelling);
    }

    #[test]
    fn draft_validation_order() {
        let mut draft = TripDraft::new(7, VehicleClass::Economy);
        match draft.validate() {
            Err(OkadaError::Validation { field, .. }) => assert_eq!(field, "pickup"),
            other => panic!("expected pickup error, got {:?}", other),
        }

        draft.pickup = Some(GeoPoint::new(-23.55, -46.63));
        match draft.validate() {
            Err(OkadaError::Validation { field, .. }) => assert_eq!(field, "destination"),
            other => panic!("expected destination error, got {:?}", other),
        }

        draft.destination = Some(GeoPoint::new(-23.56, -46.64));
        match draft.validate() {
            Err(OkadaError::Validation { field, .. }) => assert_eq!(field, "fare"),
            other => panic!("expected fare error, got {:?}", other),
        }

        draft.offered_fare = 15.0;
        assert!(draft.validate().is_ok());
    }

    #[test]
    fn fare_offered_parses_decimal_string() {
        let record = TripRecord {
            id: 42,
            rider_id: 7,
            driver_id: None,
            pickup: GeoPoint::new(-23.55, -46.63),
            destination: GeoPoint::new(-23.56, -46.64),
            fare_offered: "15.00".to_string(),
            vehicle_class: VehicleClass::Economy,
            estimate: None,
            status: TripStatus::Created,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(record.fare_offered_value(), Some(15.0));
    }

    #[test]
    fn status_event_decodes_object_and_bare_string() {
        let event = StatusEvent::decode(42, &json!({"trip_id": 42, "status": "accepted"})).unwrap();
        assert_eq!(event.status, TripStatus::Accepted);

        let event = StatusEvent::decode(42, &json!("arrived")).unwrap();
        assert_eq!(event.trip_id, 42);
        assert_eq!(event.status, TripStatus::Arrived);
    }
}
