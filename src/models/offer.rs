// src/models/offer.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{OkadaError, OkadaResult};

/// A driver's counter-proposal for a trip request, as pushed over the
/// realtime channel. Identity is the server-assigned `id`; a second push with
/// the same id is an update, not a new offer.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DriverOffer {
    pub id: i64,
    pub trip_request_id: i64,
    pub driver_id: i64,
    pub fare_offered: f64,
    pub eta_minutes: i32,
    pub distance_km: f64,
    pub driver: DriverSnapshot,
}

/// Driver profile frozen at offer time, so the card the rider tapped keeps
/// showing what they tapped even if the profile changes mid-search.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DriverSnapshot {
    pub name: String,
    pub rating: f32,
    pub total_trips: u32,
    pub vehicle: VehicleSnapshot,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct VehicleSnapshot {
    pub make: String,
    pub model: String,
    pub color: String,
    pub license_plate: String,
}

impl DriverOffer {
    /// Decodes a `created_driver_offer/{tripId}` push. The server sends
    /// either a single offer object or a batch array; batch order is kept
    /// because the auto-match rule looks at the first element.
    pub fn decode_push(payload: &serde_json::Value) -> OkadaResult<Vec<DriverOffer>> {
        if payload.is_array() {
            let offers: Vec<DriverOffer> = serde_json::from_value(payload.clone())?;
            return Ok(offers);
        }
        if payload.is_object() {
            let offer: DriverOffer = serde_json::from_value(payload.clone())?;
            return Ok(vec![offer]);
        }
        Err(OkadaError::InvalidFormat(format!(
            "offer push is neither object nor array: {}",
            payload
        )))
    }
}

/// Live driver position from the tracking events.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DriverPosition {
    pub driver_id: i64,
    pub latitude: f64,
    pub longitude: f64,
    pub heading: Option<f64>,
    pub speed_kmh: Option<f64>,
    pub recorded_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn offer_json(id: i64, fare: f64) -> serde_json::Value {
        json!({
            "id": id,
            "trip_request_id": 42,
            "driver_id": 7,
            "fare_offered": fare,
            "eta_minutes": 4,
            "distance_km": 1.2,
            "driver": {
                "name": "Kwame",
                "rating": 4.8,
                "total_trips": 911,
                "vehicle": {
                    "make": "Toyota",
                    "model": "Vitz",
                    "color": "silver",
                    "license_plate": "GR 4411-23"
                }
            }
        })
    }

    #[test]
    fn decodes_single_offer_object() {
        let offers = DriverOffer::decode_push(&offer_json(1, 15.0)).unwrap();
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].id, 1);
        assert_eq!(offers[0].driver.name, "Kwame");
    }

    #[test]
    fn decodes_batch_in_order() {
        let batch = json!([offer_json(3, 18.0), offer_json(1, 15.0)]);
        let offers = DriverOffer::decode_push(&batch).unwrap();
        assert_eq!(offers.len(), 2);
        assert_eq!(offers[0].id, 3);
        assert_eq!(offers[1].id, 1);
    }

    #[test]
    fn rejects_scalar_payload() {
        assert!(DriverOffer::decode_push(&json!("nope")).is_err());
    }
}
